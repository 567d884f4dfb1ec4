//! Thread-safe inboxes feeding the scheduling thread
//!
//! Producers only enqueue. Every critical section is a push or a swap of the
//! whole queue; all interpretation happens on the scheduling thread after the
//! lock is released.

use lumen_events::{DetectVariables, EnableDisableFlag, EngineCommand, EventKind, ItemId, PostedEvent};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::requests::{ScriptInfoRequest, StateDataRequest};
use crate::signal::WorkSignal;
use crate::vm::SyscallResult;

pub struct CoreInbox {
    events: Mutex<VecDeque<(ItemId, PostedEvent)>>,
    state_requests: Mutex<VecDeque<StateDataRequest>>,
    info_requests: Mutex<VecDeque<ScriptInfoRequest>>,
    enable_disable: Mutex<VecDeque<(ItemId, EnableDisableFlag)>>,
    resets: Mutex<VecDeque<ItemId>>,
    syscall_returns: Mutex<Vec<(ItemId, u64, SyscallResult)>>,
    avatars_ready: Mutex<Vec<(ItemId, Uuid)>>,
    touch_updates: Mutex<HashMap<ItemId, Vec<DetectVariables>>>,
    commands: Mutex<Vec<EngineCommand>>,
    signal: Arc<WorkSignal>,
    clock: SharedClock,
}

impl CoreInbox {
    pub fn new(signal: Arc<WorkSignal>, clock: SharedClock) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            state_requests: Mutex::new(VecDeque::new()),
            info_requests: Mutex::new(VecDeque::new()),
            enable_disable: Mutex::new(VecDeque::new()),
            resets: Mutex::new(VecDeque::new()),
            syscall_returns: Mutex::new(Vec::new()),
            avatars_ready: Mutex::new(Vec::new()),
            touch_updates: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            signal,
            clock,
        }
    }

    pub fn signal(&self) -> &Arc<WorkSignal> {
        &self.signal
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn post_event(&self, item_id: ItemId, event: PostedEvent) {
        self.events.lock().push_back((item_id, event));
        self.signal.notify();
    }

    pub fn post_events(&self, events: impl IntoIterator<Item = (ItemId, PostedEvent)>) {
        self.events.lock().extend(events);
        self.signal.notify();
    }

    /// Post the `state_exit` / `state_entry` pair for one transition under a
    /// single lock so nothing for the same instance can land between them.
    pub fn post_state_change(&self, item_id: ItemId, new_state: u32) {
        {
            let mut events = self.events.lock();
            events.push_back((item_id, PostedEvent::new(EventKind::StateExit)));
            events.push_back((item_id, PostedEvent::entering_state(new_state)));
        }
        self.signal.notify();
    }

    pub fn push_state_request(&self, mut request: StateDataRequest) {
        request.issued_at = self.clock.now_ms();
        self.state_requests.lock().push_back(request);
        self.signal.notify();
    }

    pub fn push_info_request(&self, request: ScriptInfoRequest) {
        self.info_requests.lock().push_back(request);
        self.signal.notify();
    }

    pub fn push_enable_disable(&self, item_id: ItemId, flag: EnableDisableFlag) {
        self.enable_disable.lock().push_back((item_id, flag));
        self.signal.notify();
    }

    pub fn push_reset(&self, item_id: ItemId) {
        self.resets.lock().push_back(item_id);
        self.signal.notify();
    }

    pub fn push_syscall_return(&self, item_id: ItemId, seq: u64, result: SyscallResult) {
        self.syscall_returns.lock().push((item_id, seq, result));
        self.signal.notify();
    }

    pub fn push_avatar_ready(&self, item_id: ItemId, avatar: Uuid) {
        self.avatars_ready.lock().push((item_id, avatar));
        self.signal.notify();
    }

    /// Latest detect data wins; older updates for the same item are replaced
    pub fn push_touch_update(&self, item_id: ItemId, detect: Vec<DetectVariables>) {
        self.touch_updates.lock().insert(item_id, detect);
        self.signal.notify();
    }

    pub fn push_command(&self, command: EngineCommand) {
        self.commands.lock().push(command);
        self.signal.notify();
    }

    pub(crate) fn take_events(&self) -> VecDeque<(ItemId, PostedEvent)> {
        std::mem::take(&mut *self.events.lock())
    }

    pub(crate) fn pop_state_request(&self) -> Option<StateDataRequest> {
        self.state_requests.lock().pop_front()
    }

    pub(crate) fn pop_info_request(&self) -> Option<ScriptInfoRequest> {
        self.info_requests.lock().pop_front()
    }

    pub(crate) fn pop_enable_disable(&self) -> Option<(ItemId, EnableDisableFlag)> {
        self.enable_disable.lock().pop_front()
    }

    pub(crate) fn pop_reset(&self) -> Option<ItemId> {
        self.resets.lock().pop_front()
    }

    pub(crate) fn take_syscall_returns(&self) -> Vec<(ItemId, u64, SyscallResult)> {
        std::mem::take(&mut *self.syscall_returns.lock())
    }

    pub(crate) fn take_avatars_ready(&self) -> Vec<(ItemId, Uuid)> {
        std::mem::take(&mut *self.avatars_ready.lock())
    }

    pub(crate) fn take_touch_updates(&self) -> HashMap<ItemId, Vec<DetectVariables>> {
        std::mem::take(&mut *self.touch_updates.lock())
    }

    pub(crate) fn take_commands(&self) -> Vec<EngineCommand> {
        std::mem::take(&mut *self.commands.lock())
    }

    /// Anything still waiting for the scheduling thread
    pub fn has_pending(&self) -> bool {
        !self.events.lock().is_empty()
            || !self.state_requests.lock().is_empty()
            || !self.info_requests.lock().is_empty()
            || !self.enable_disable.lock().is_empty()
            || !self.resets.lock().is_empty()
            || !self.syscall_returns.lock().is_empty()
            || !self.avatars_ready.lock().is_empty()
            || !self.touch_updates.lock().is_empty()
            || !self.commands.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::requests::{Reply, StateForm};

    fn inbox() -> CoreInbox {
        CoreInbox::new(Arc::new(WorkSignal::new()), Arc::new(ManualClock::new(500)))
    }

    #[test]
    fn test_state_change_pair_is_adjacent() {
        let inbox = inbox();
        let item = ItemId::new_v4();
        inbox.post_event(item, PostedEvent::new(EventKind::Touch));
        inbox.post_state_change(item, 2);

        let events: Vec<_> = inbox.take_events().into_iter().map(|(_, e)| e).collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].kind, EventKind::StateExit);
        assert_eq!(events[2], PostedEvent::entering_state(2));
        assert!(!inbox.has_pending());
    }

    #[test]
    fn test_state_request_is_stamped() {
        let inbox = inbox();
        let (reply, _rx) = Reply::channel();
        inbox.push_state_request(StateDataRequest::new(ItemId::new_v4(), StateForm::Raw, reply));

        assert!(inbox.has_pending());
        assert_eq!(inbox.pop_state_request().map(|r| r.issued_at), Some(500));
    }

    #[test]
    fn test_touch_updates_coalesce() {
        let inbox = inbox();
        let item = ItemId::new_v4();
        inbox.push_touch_update(item, vec![DetectVariables::default()]);
        inbox.push_touch_update(item, vec![]);

        let updates = inbox.take_touch_updates();
        assert_eq!(updates.len(), 1);
        assert!(updates[&item].is_empty());
    }
}
