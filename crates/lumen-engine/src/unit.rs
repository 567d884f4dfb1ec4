use lumen_events::{AssetId, EventKind};
use serde::{Deserialize, Serialize};

use crate::error::LoadError;

/// Bumped whenever the serialized layout of [`CompiledUnit`] changes
const UNIT_FORMAT_VERSION: u32 = 1;

/// Entry point of one event handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHandler {
    pub kind: EventKind,
    /// Byte offset of the handler's first instruction
    pub entry: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDef {
    pub name: String,
    pub handlers: Vec<EventHandler>,
}

/// Immutable bytecode plus metadata, shared by every instance of one asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledUnit {
    pub asset_id: AssetId,
    pub bytecode: Vec<u8>,
    pub constants: Vec<String>,
    pub states: Vec<StateDef>,
}

#[derive(Serialize, Deserialize)]
struct SerializedUnit {
    format_version: u32,
    unit: CompiledUnit,
}

impl CompiledUnit {
    pub fn find_event(&self, state: u32, kind: EventKind) -> Option<&EventHandler> {
        self.states
            .get(state as usize)?
            .handlers
            .iter()
            .find(|h| h.kind == kind)
    }

    /// Bitmask of events handled in `state`
    pub fn event_mask(&self, state: u32) -> u64 {
        self.states
            .get(state as usize)
            .map(|s| s.handlers.iter().fold(0, |mask, h| mask | h.kind.bit()))
            .unwrap_or(0)
    }

    pub fn state_index(&self, name: &str) -> Option<u32> {
        self.states.iter().position(|s| s.name == name).map(|i| i as u32)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(&SerializedUnit {
            format_version: UNIT_FORMAT_VERSION,
            unit: self.clone(),
        })
    }

    /// Decode a serialized unit that is expected to belong to `asset_id`
    pub fn from_bytes(asset_id: AssetId, bytes: &[u8]) -> Result<Self, LoadError> {
        let corrupt = |reason: String| LoadError::CorruptUnit {
            asset: asset_id,
            reason,
        };

        let serialized: SerializedUnit =
            bincode::deserialize(bytes).map_err(|e| corrupt(e.to_string()))?;
        if serialized.format_version != UNIT_FORMAT_VERSION {
            return Err(corrupt(format!(
                "unsupported format version {}",
                serialized.format_version
            )));
        }
        if serialized.unit.asset_id != asset_id {
            return Err(corrupt(format!(
                "unit belongs to asset {}",
                serialized.unit.asset_id
            )));
        }
        Ok(serialized.unit)
    }

    /// Hex dump of up to `num_bytes` of bytecode leading up to `ip`
    pub fn backtrace(&self, ip: usize, num_bytes: usize) -> String {
        let end = ip.min(self.bytecode.len());
        let start = end.saturating_sub(num_bytes);
        self.bytecode[start..end]
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
