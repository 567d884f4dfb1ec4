use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::ItemId;

/// Requests to change one source of an instance's enabled status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnableDisableFlag {
    GeneralEnable,
    GeneralDisable,
    ParcelEnable,
    ParcelDisable,
    CrossingWaitEnable,
    CrossingWaitDisable,
    /// Stops execution for a take/derez without recording a persistent flag
    DerezDisable,
}

impl EnableDisableFlag {
    pub fn is_enable(self) -> bool {
        matches!(
            self,
            EnableDisableFlag::GeneralEnable
                | EnableDisableFlag::ParcelEnable
                | EnableDisableFlag::CrossingWaitEnable
        )
    }
}

/// Optional stop applied after a state snapshot has been captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StopScriptReason {
    #[default]
    None,
    Derez,
    Crossing,
}

/// Engine-wide diagnostic commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineCommand {
    /// Log every instruction step of one instance
    StartTrace(ItemId),
    StopAllTraces,
}

/// A chat message picked up by a script's listen subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenMessage {
    /// Instance whose listener matched
    pub item_id: ItemId,
    pub channel: i32,
    pub name: String,
    pub speaker_id: Uuid,
    pub message: String,
    /// Set when the speaker is a bot rather than a prim or avatar
    pub from_bot: bool,
}
