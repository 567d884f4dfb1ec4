use bitflags::bitflags;
use lumen_events::{DetectVariables, EventKind, PostedEvent, Value};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Where an instance is in its execution lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// On the run queue, executing instructions
    Running,
    /// Parked until `next_wakeup`
    Sleeping,
    /// Idle between events
    Waiting,
    /// Blocked on a long-running call serviced off the scheduling thread
    Syscall,
    /// Faulted; never scheduled again
    Killed,
}

bitflags! {
    /// Local disable sources. Any set bit stops the instance.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct LocalDisable: u8 {
        const PARCEL = 0b01;
        const CROSSING_WAIT = 0b10;
    }
}

/// Resumable state of one instance.
///
/// This is exactly what gets snapshotted: restoring it and re-admitting the
/// instance must reproduce its pending events, timer phase and enable flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    pub run_state: RunState,
    /// Index of the active script state
    pub state_index: u32,
    /// Byte offset of the next instruction
    pub ip: usize,
    pub operands: Vec<Value>,
    pub event_queue: VecDeque<PostedEvent>,
    pub running_event: Option<PostedEvent>,

    pub general_enable: bool,
    pub local_disable: LocalDisable,

    /// Active timer interval, 0 when no timer is set
    pub timer_interval_ms: u64,
    pub timer_last_scheduled_on: u64,
    /// When the state was last captured for a snapshot or stopped by a disable
    pub state_captured_on: u64,
    pub next_wakeup: u64,

    pub touch_active: bool,
    pub current_touch_detect: Vec<DetectVariables>,

    pub start_param: i32,
    /// Events handled by the active state
    pub event_mask: u64,
}

impl RuntimeState {
    /// State of a script that has never run. It starts by executing its
    /// global initialisation block.
    pub fn fresh() -> Self {
        Self {
            run_state: RunState::Running,
            state_index: 0,
            ip: 0,
            operands: Vec::new(),
            event_queue: VecDeque::new(),
            running_event: None,
            general_enable: true,
            local_disable: LocalDisable::empty(),
            timer_interval_ms: 0,
            timer_last_scheduled_on: 0,
            state_captured_on: 0,
            next_wakeup: 0,
            touch_active: false,
            current_touch_detect: Vec::new(),
            start_param: 0,
            event_mask: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.general_enable && self.local_disable.is_empty()
    }

    /// Back to a freshly loaded script. Enable flags and the start
    /// parameter survive a reset.
    pub fn reset(&mut self) {
        let general_enable = self.general_enable;
        let local_disable = self.local_disable;
        let start_param = self.start_param;
        *self = Self::fresh();
        self.general_enable = general_enable;
        self.local_disable = local_disable;
        self.start_param = start_param;
    }

    /// Halt the current event and drop everything queued ahead of a state change
    pub fn state_change_prep(&mut self) {
        self.run_state = RunState::Waiting;
        self.operands.clear();
        self.event_queue.clear();
        self.running_event = None;
        self.touch_active = false;
        self.current_touch_detect.clear();
    }

    /// Append to the event queue. Returns false when the queue is full and
    /// the event was dropped.
    pub fn queue_event(&mut self, event: PostedEvent, max_queued: usize) -> bool {
        if self.event_queue.len() >= max_queued {
            return false;
        }
        self.event_queue.push_back(event);
        true
    }

    pub fn is_event_queued(&self, kind: EventKind) -> bool {
        self.event_queue.iter().any(|e| e.kind == kind)
    }

    /// Drop a queued `timer` left over from a previous schedule
    pub fn remove_pending_timer_event(&mut self) {
        if let Some(pos) = self.event_queue.iter().position(|e| e.kind == EventKind::Timer) {
            self.event_queue.remove(pos);
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::fresh()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_enabled_requires_general_and_no_local_disable() {
        let mut state = RuntimeState::fresh();
        assert!(state.is_enabled());

        state.local_disable |= LocalDisable::CROSSING_WAIT;
        assert!(!state.is_enabled());

        state.local_disable = LocalDisable::empty();
        state.general_enable = false;
        assert!(!state.is_enabled());
    }

    #[test]
    fn test_reset_keeps_enable_flags() {
        let mut state = RuntimeState::fresh();
        state.general_enable = false;
        state.local_disable = LocalDisable::PARCEL;
        state.timer_interval_ms = 500;
        state.state_index = 2;
        state.start_param = 7;
        state.queue_event(PostedEvent::new(EventKind::Touch), 8);

        state.reset();

        assert!(!state.general_enable);
        assert_eq!(state.local_disable, LocalDisable::PARCEL);
        assert_eq!(state.start_param, 7);
        assert_eq!(state.timer_interval_ms, 0);
        assert_eq!(state.state_index, 0);
        assert!(state.event_queue.is_empty());
        assert_eq!(state.run_state, RunState::Running);
    }

    #[test]
    fn test_queue_is_bounded() {
        let mut state = RuntimeState::fresh();
        assert!(state.queue_event(PostedEvent::new(EventKind::Touch), 2));
        assert!(state.queue_event(PostedEvent::new(EventKind::Timer), 2));
        assert!(!state.queue_event(PostedEvent::new(EventKind::Money), 2));
        assert_eq!(state.event_queue.len(), 2);
    }

    #[test]
    fn test_remove_pending_timer_event_removes_only_first_timer() {
        let mut state = RuntimeState::fresh();
        state.queue_event(PostedEvent::new(EventKind::Touch), 8);
        state.queue_event(PostedEvent::new(EventKind::Timer), 8);
        state.queue_event(PostedEvent::new(EventKind::Timer), 8);

        state.remove_pending_timer_event();

        let kinds: Vec<_> = state.event_queue.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Touch, EventKind::Timer]);
    }

    #[test]
    fn test_snapshot_preserves_observable_state() {
        let mut state = RuntimeState::fresh();
        state.run_state = RunState::Sleeping;
        state.next_wakeup = 12_345;
        state.timer_interval_ms = 1_000;
        state.timer_last_scheduled_on = 10_000;
        state.state_captured_on = 10_400;
        state.local_disable = LocalDisable::CROSSING_WAIT;
        state.operands.push(Value::Str("held".into()));
        state.queue_event(
            PostedEvent::with_args(EventKind::Listen, vec![Value::Int(4), Value::Key(Uuid::new_v4())]),
            8,
        );
        state.queue_event(PostedEvent::entering_state(1), 8);

        let restored = RuntimeState::from_bytes(&state.to_bytes().unwrap()).unwrap();

        assert_eq!(restored, state);
    }
}
