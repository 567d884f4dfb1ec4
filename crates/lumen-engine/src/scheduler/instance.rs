use lumen_events::{ItemId, ObjectId};
use std::sync::Arc;
use std::time::Duration;

use crate::heap::HeapHandle;
use crate::runtime::RuntimeState;
use crate::unit::CompiledUnit;

/// Why an instance is in the sleep heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WakeAction {
    /// Plain sleep: re-admit to the run queue
    None,
    /// Synthesize a `timer` event
    Timer,
    /// Synthesize a repeat `touch` event
    Touch,
}

/// Entry in the sleep heap, ordered by deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SleepEntry {
    pub ready_on: u64,
    pub item_id: ItemId,
    pub action: WakeAction,
}

/// One resident script. Owned by the scheduling thread.
pub struct ScriptInstance {
    pub item_id: ItemId,
    pub object_id: ObjectId,
    pub unit: Arc<CompiledUnit>,
    pub state: RuntimeState,

    pub sleep_wake: Option<HeapHandle>,
    pub timer_wake: Option<HeapHandle>,
    pub touch_wake: Option<HeapHandle>,

    /// A long-running call is outstanding on the worker pool
    pub syscall_in_flight: bool,
    /// Number of the outstanding call; older returns are stale
    pub syscall_seq: u64,
    pub total_runtime: Duration,
    pub trace: bool,
}

impl ScriptInstance {
    pub fn new(
        item_id: ItemId,
        object_id: ObjectId,
        unit: Arc<CompiledUnit>,
        state: RuntimeState,
    ) -> Self {
        Self {
            item_id,
            object_id,
            unit,
            state,
            sleep_wake: None,
            timer_wake: None,
            touch_wake: None,
            syscall_in_flight: false,
            syscall_seq: 0,
            total_runtime: Duration::ZERO,
            trace: false,
        }
    }

    pub fn wake_slot(&mut self, action: WakeAction) -> &mut Option<HeapHandle> {
        match action {
            WakeAction::None => &mut self.sleep_wake,
            WakeAction::Timer => &mut self.timer_wake,
            WakeAction::Touch => &mut self.touch_wake,
        }
    }
}
