//! Correlation objects for requests answered on the scheduling thread
//!
//! A caller either registers a callback or keeps the receiving half of a
//! one-shot channel and blocks on it with a timeout.

use crossbeam_channel::{bounded, Receiver, Sender};
use lumen_events::{AssetId, ItemId, StopScriptReason};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::runtime::{LocalDisable, RunState, RuntimeState};

/// How a request's answer is delivered
pub enum Reply<T> {
    Callback(Box<dyn FnOnce(T) + Send + 'static>),
    Channel(Sender<T>),
}

impl<T> Reply<T> {
    pub fn callback(f: impl FnOnce(T) + Send + 'static) -> Self {
        Reply::Callback(Box::new(f))
    }

    /// A channel reply plus the receiver to wait on
    pub fn channel() -> (Self, Receiver<T>) {
        let (tx, rx) = bounded(1);
        (Reply::Channel(tx), rx)
    }

    pub fn send(self, value: T) {
        match self {
            Reply::Callback(f) => f(value),
            // The waiter may have timed out and dropped the receiver
            Reply::Channel(tx) => {
                let _ = tx.send(value);
            }
        }
    }
}

impl<T> fmt::Debug for Reply<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Callback(_) => f.write_str("Reply::Callback"),
            Reply::Channel(_) => f.write_str("Reply::Channel"),
        }
    }
}

/// Block on a reply channel, degrading to `None` on timeout
pub fn wait_reply<T>(rx: &Receiver<T>, timeout: Duration) -> Option<T> {
    rx.recv_timeout(timeout).ok()
}

// ============================================================================
// State snapshots
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateForm {
    /// The in-memory runtime state
    Raw,
    /// Bytes ready to be written to the store or shipped with an object
    Serialized,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StateSnapshot {
    Raw(RuntimeState),
    Serialized(Vec<u8>),
}

/// Answer to a [`StateDataRequest`]. `snapshot` is `None` when the instance is
/// not resident or the request was discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct StateData {
    pub item_id: ItemId,
    pub snapshot: Option<StateSnapshot>,
}

impl StateData {
    pub fn empty(item_id: ItemId) -> Self {
        Self {
            item_id,
            snapshot: None,
        }
    }
}

/// Asks the scheduling thread for a consistent snapshot of one instance
#[derive(Debug)]
pub struct StateDataRequest {
    pub item_id: ItemId,
    pub form: StateForm,
    /// Stop applied right after the snapshot is captured
    pub stop_reason: StopScriptReason,
    /// Stamped when the request enters the scheduler inbox
    pub issued_at: u64,
    pub reply: Reply<StateData>,
}

impl StateDataRequest {
    pub fn new(item_id: ItemId, form: StateForm, reply: Reply<StateData>) -> Self {
        Self {
            item_id,
            form,
            stop_reason: StopScriptReason::None,
            issued_at: 0,
            reply,
        }
    }

    pub fn with_stop(mut self, reason: StopScriptReason) -> Self {
        self.stop_reason = reason;
        self
    }

    pub fn respond_empty(self) {
        let item_id = self.item_id;
        self.reply.send(StateData::empty(item_id));
    }
}

// ============================================================================
// Info queries
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptRunningInfo {
    pub item_id: ItemId,
    pub asset_id: AssetId,
    pub run_state: RunState,
    pub state_index: u32,
    pub queued_events: usize,
    pub enabled: bool,
    /// Wall time spent executing this instance
    pub total_runtime: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnabledDetail {
    pub item_id: ItemId,
    pub general_enable: bool,
    pub local_disable: LocalDisable,
}

#[derive(Debug)]
pub enum ScriptInfoRequest {
    Running {
        item_id: ItemId,
        reply: Reply<Option<ScriptRunningInfo>>,
    },
    /// Details for resident instances only; unknown ids are skipped
    EnabledDetails {
        item_ids: Vec<ItemId>,
        reply: Reply<Vec<EnabledDetail>>,
    },
}

/// Best-effort export of compiled units that are currently resident
#[derive(Debug)]
pub struct RetrieveBytecodeRequest {
    pub asset_ids: Vec<AssetId>,
    pub reply: Reply<HashMap<AssetId, Vec<u8>>>,
}
