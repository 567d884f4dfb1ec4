//! ExecutionCore: the cooperative scheduler that owns every resident instance
//!
//! All per-instance state lives here and is only touched from the scheduling
//! thread. Other threads reach it through [`CoreInbox`].

pub mod inbox;
pub mod instance;
pub mod run_queue;
pub mod syscall;

use lumen_events::{
    EnableDisableFlag, EngineCommand, EventKind, ItemId, ListenMessage, ObjectId, PostedEvent,
    StopScriptReason, Value,
};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::clock::SharedClock;
use crate::config::EngineConfig;
use crate::deferred::DeferredEventBuffer;
use crate::driver::WorkStatus;
use crate::error::{panic_message, LoadError, VmFault};
use crate::heap::IndexedHeap;
use crate::host::{CommChannel, FaultSink, ScriptHost};
use crate::persistence::PersistenceHandle;
use crate::requests::{
    EnabledDetail, ScriptInfoRequest, ScriptRunningInfo, StateData, StateDataRequest, StateForm,
    StateSnapshot,
};
use crate::runtime::{LocalDisable, RunState, RuntimeState};
use crate::unit::CompiledUnit;
use crate::vm::{Interpreter, SyscallResult, VmEffect};

pub use inbox::CoreInbox;
pub use instance::{ScriptInstance, SleepEntry, WakeAction};
pub use run_queue::RunQueue;
pub use syscall::SyscallPool;

/// `changed` argument posted to scripts when the region restarts
const CHANGED_REGION_START: i32 = 0x400;

/// Collaborators the scheduler needs from the host
pub struct CoreCollaborators {
    pub host: Arc<dyn ScriptHost>,
    pub comm: Box<dyn CommChannel>,
    pub faults: Arc<dyn FaultSink>,
    pub interpreter: Arc<dyn Interpreter>,
}

/// A successfully resolved load, ready to become a resident instance
pub struct Admission {
    pub item_id: ItemId,
    pub object_id: ObjectId,
    pub unit: Arc<CompiledUnit>,
    /// Restored state, or `None` to start fresh
    pub state: Option<RuntimeState>,
    pub start_param: i32,
    pub post_on_rez: bool,
    pub changed_region_start: bool,
    pub start_local_disabled: bool,
    pub start_global_disabled: bool,
    pub from_crossing: bool,
}

/// Run a step inside a panic boundary so a broken interpreter only kills
/// the instance it was running.
fn guarded<T>(f: impl FnOnce() -> Result<T, VmFault>) -> Result<T, VmFault> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(VmFault::Panic(panic_message(&*payload))),
    }
}

/// Apply one enable/disable flag to the persistent enable bits
fn apply_flag(state: &mut RuntimeState, flag: EnableDisableFlag) {
    match flag {
        EnableDisableFlag::GeneralEnable => state.general_enable = true,
        EnableDisableFlag::GeneralDisable => state.general_enable = false,
        EnableDisableFlag::ParcelEnable => state.local_disable.remove(LocalDisable::PARCEL),
        EnableDisableFlag::ParcelDisable => state.local_disable.insert(LocalDisable::PARCEL),
        EnableDisableFlag::CrossingWaitEnable => {
            state.local_disable.remove(LocalDisable::CROSSING_WAIT)
        }
        EnableDisableFlag::CrossingWaitDisable => {
            state.local_disable.insert(LocalDisable::CROSSING_WAIT)
        }
        EnableDisableFlag::DerezDisable => {}
    }
}

/// Whether `event` will find a handler when it reaches the front of the
/// queue, in the state any queued transition leaves the instance in.
/// Transition markers always count so the state change itself happens.
fn has_handler(unit: &CompiledUnit, state: &RuntimeState, event: &PostedEvent) -> bool {
    if event.transition_to.is_some() {
        return true;
    }
    let target = state
        .event_queue
        .iter()
        .rev()
        .find_map(|queued| queued.transition_to)
        .unwrap_or(state.state_index);
    unit.find_event(target, event.kind).is_some()
}

fn listen_event(message: ListenMessage) -> PostedEvent {
    PostedEvent::with_args(
        EventKind::Listen,
        vec![
            Value::Int(message.channel),
            Value::Str(message.name),
            Value::Key(message.speaker_id),
            Value::Str(message.message),
        ],
    )
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Scheduling structures shared by every instance. Kept apart from the
/// instance map so an instance can be borrowed mutably while they change.
struct Dispatcher {
    config: EngineConfig,
    run_queue: RunQueue,
    sleepers: IndexedHeap<SleepEntry>,
    host: Arc<dyn ScriptHost>,
    comm: Box<dyn CommChannel>,
    faults: Arc<dyn FaultSink>,
    interpreter: Arc<dyn Interpreter>,
    syscalls: SyscallPool,
    inbox: Arc<CoreInbox>,
    /// Instances mutated during the current pass
    changed: HashSet<ItemId>,
    now: u64,
    /// Last number handed to a syscall
    syscall_seq: u64,
}

impl Dispatcher {
    fn arm(&mut self, inst: &mut ScriptInstance, action: WakeAction, ready_on: u64) {
        self.disarm(inst, action);
        let handle = self.sleepers.push(SleepEntry {
            ready_on,
            item_id: inst.item_id,
            action,
        });
        *inst.wake_slot(action) = Some(handle);
    }

    fn disarm(&mut self, inst: &mut ScriptInstance, action: WakeAction) {
        if let Some(handle) = inst.wake_slot(action).take() {
            self.sleepers.remove(handle);
        }
    }

    fn disarm_all(&mut self, inst: &mut ScriptInstance) {
        self.disarm(inst, WakeAction::None);
        self.disarm(inst, WakeAction::Timer);
        self.disarm(inst, WakeAction::Touch);
    }

    /// Place an enabled instance where its run state says it belongs,
    /// replaying its timer at the phase it had when it was stopped.
    fn admit(&mut self, inst: &mut ScriptInstance) {
        if inst.state.run_state == RunState::Killed {
            return;
        }

        let interval = inst.state.timer_interval_ms;
        if interval > 0 && inst.timer_wake.is_none() {
            let elapsed = inst
                .state
                .state_captured_on
                .saturating_sub(inst.state.timer_last_scheduled_on);
            let ready_on = self.now + (interval - elapsed % interval);
            inst.state.timer_last_scheduled_on = ready_on.saturating_sub(interval);
            self.arm(inst, WakeAction::Timer, ready_on);
        }

        if inst.state.touch_active {
            let ready_on = self.now + self.config.touch_repeat_ms;
            self.arm(inst, WakeAction::Touch, ready_on);
        }

        match inst.state.run_state {
            RunState::Running => {
                self.run_queue.push_back(inst.item_id);
            }
            RunState::Sleeping => {
                if inst.state.next_wakeup <= self.now {
                    inst.state.run_state = RunState::Running;
                    self.run_queue.push_back(inst.item_id);
                } else {
                    let ready_on = inst.state.next_wakeup;
                    self.arm(inst, WakeAction::None, ready_on);
                }
            }
            RunState::Waiting => self.process_event_queue(inst),
            RunState::Syscall => {
                // Restored mid-call: the call died with the previous owner
                if !inst.syscall_in_flight {
                    inst.state.run_state = RunState::Running;
                    self.run_queue.push_back(inst.item_id);
                }
            }
            RunState::Killed => {}
        }
        self.changed.insert(inst.item_id);
    }

    fn after_disable(&mut self, inst: &mut ScriptInstance) {
        inst.state.state_captured_on = self.now;
        self.disarm_all(inst);
        self.run_queue.remove(inst.item_id);
        self.comm.remove_listeners(inst.item_id);
        self.changed.insert(inst.item_id);
    }

    fn change_enabled(&mut self, inst: &mut ScriptInstance, flag: EnableDisableFlag) {
        let was_enabled = inst.state.is_enabled();
        apply_flag(&mut inst.state, flag);
        let is_enabled = inst.state.is_enabled();
        debug!(target: "scheduler", "{:?} on {} (enabled {} -> {})", flag, inst.item_id, was_enabled, is_enabled);

        if flag == EnableDisableFlag::DerezDisable {
            if was_enabled {
                self.after_disable(inst);
            }
        } else if was_enabled && !is_enabled {
            self.after_disable(inst);
        } else if !was_enabled && is_enabled {
            self.admit(inst);
        }
        self.changed.insert(inst.item_id);
    }

    fn terminate(&mut self, inst: &mut ScriptInstance, fault: VmFault) {
        error!(
            target: "scheduler",
            "Script {} (asset {}) killed at ip {:#x}: {}",
            inst.item_id, inst.unit.asset_id, inst.state.ip, fault
        );
        inst.state.run_state = RunState::Killed;
        self.disarm_all(inst);
        self.run_queue.remove(inst.item_id);
        self.comm.remove_listeners(inst.item_id);
        self.faults
            .report(inst.item_id, inst.unit.asset_id, &fault.to_string());
        self.changed.insert(inst.item_id);
    }

    fn reset_now(&mut self, inst: &mut ScriptInstance) {
        self.disarm_all(inst);
        inst.syscall_in_flight = false;
        self.comm.remove_listeners(inst.item_id);

        let unit = inst.unit.clone();
        let interpreter = self.interpreter.clone();
        let state = &mut inst.state;
        if let Err(fault) = guarded(|| {
            interpreter.reset(&unit, state);
            Ok(())
        }) {
            self.terminate(inst, fault);
            return;
        }

        inst.state.event_mask = unit.event_mask(inst.state.state_index);
        inst.state
            .event_queue
            .push_back(PostedEvent::new(EventKind::StateEntry));
        if inst.state.is_enabled() {
            self.run_queue.push_back(inst.item_id);
        }
        info!(target: "scheduler", "Reset {}", inst.item_id);
        self.changed.insert(inst.item_id);
    }

    fn set_timer(&mut self, inst: &mut ScriptInstance, interval_ms: u64) {
        self.disarm(inst, WakeAction::Timer);
        inst.state.remove_pending_timer_event();
        inst.state.timer_interval_ms = interval_ms;
        if interval_ms > 0 {
            inst.state.timer_last_scheduled_on = self.now;
            self.arm(inst, WakeAction::Timer, self.now + interval_ms);
        }
    }

    /// Keep a periodic timer going once its event has been consumed
    fn check_and_reset_timer_wait(&mut self, inst: &mut ScriptInstance) {
        let interval = inst.state.timer_interval_ms;
        if interval > 0
            && inst.timer_wake.is_none()
            && !inst.state.is_event_queued(EventKind::Timer)
        {
            inst.state.timer_last_scheduled_on = self.now;
            self.arm(inst, WakeAction::Timer, self.now + interval);
        }
    }

    fn stop_touch(&mut self, inst: &mut ScriptInstance) {
        inst.state.touch_active = false;
        inst.state.current_touch_detect.clear();
        self.disarm(inst, WakeAction::Touch);
    }

    fn enter_state(&mut self, inst: &mut ScriptInstance, target: u32) -> Result<(), VmFault> {
        if target as usize >= inst.unit.states.len() {
            return Err(VmFault::BadState(u64::from(target)));
        }
        debug!(target: "scheduler", "{} entering state {}", inst.item_id, inst.unit.states[target as usize].name);
        inst.state.state_index = target;
        inst.state.event_mask = inst.unit.event_mask(target);
        self.comm.remove_listeners(inst.item_id);
        self.check_and_reset_timer_wait(inst);
        Ok(())
    }

    /// Apply any state transition the event carries, then start its handler.
    /// Returns whether a handler was started; a missing handler just means
    /// the event is not observed in the current state.
    fn dispatch_event(
        &mut self,
        inst: &mut ScriptInstance,
        event: PostedEvent,
    ) -> Result<bool, VmFault> {
        if let Some(target) = event.transition_to {
            self.enter_state(inst, target)?;
        }

        let kind = event.kind;
        if kind == EventKind::TouchEnd {
            self.stop_touch(inst);
        }
        let touch_detect = (kind == EventKind::TouchStart).then(|| event.detect.clone());

        let started = match inst.unit.find_event(inst.state.state_index, kind).copied() {
            Some(handler) => {
                let interpreter = self.interpreter.clone();
                let unit = inst.unit.clone();
                let state = &mut inst.state;
                guarded(|| interpreter.start_event(&unit, state, &handler, event))?;
                self.run_queue.push_back(inst.item_id);
                true
            }
            None => false,
        };

        match kind {
            EventKind::Timer => self.check_and_reset_timer_wait(inst),
            EventKind::TouchStart
                if started && inst.state.event_mask & EventKind::Touch.bit() != 0 =>
            {
                inst.state.touch_active = true;
                inst.state.current_touch_detect = touch_detect.unwrap_or_default();
                let ready_on = self.now + self.config.touch_repeat_ms;
                self.arm(inst, WakeAction::Touch, ready_on);
            }
            _ => {}
        }

        self.changed.insert(inst.item_id);
        Ok(started)
    }

    /// Start queued events until one of them actually runs
    fn process_event_queue(&mut self, inst: &mut ScriptInstance) {
        while inst.state.run_state == RunState::Waiting {
            let Some(event) = inst.state.event_queue.pop_front() else {
                break;
            };
            if let Err(fault) = self.dispatch_event(inst, event) {
                self.terminate(inst, fault);
                return;
            }
        }
    }

    /// Queue an event for an enabled instance, starting it at once if the
    /// instance is idle. Returns false if the event was dropped.
    fn queue_or_start(&mut self, inst: &mut ScriptInstance, event: PostedEvent) -> bool {
        let kind = event.kind;
        if !has_handler(&inst.unit, &inst.state, &event) {
            trace!(target: "scheduler", "{} has no {} handler, dropping", inst.item_id, kind);
            return false;
        }

        // Clients resend zero-change control events; any queued control is enough
        if event.is_null_control() && inst.state.is_event_queued(EventKind::Control) {
            return true;
        }

        if !inst
            .state
            .queue_event(event, self.config.max_queued_events)
        {
            debug!(target: "scheduler", "Event queue full for {}, dropping {}", inst.item_id, kind);
            return false;
        }
        self.changed.insert(inst.item_id);

        if inst.state.run_state == RunState::Waiting {
            self.process_event_queue(inst);
        }
        true
    }

    fn apply_effect(&mut self, inst: &mut ScriptInstance, effect: VmEffect) -> Result<(), VmFault> {
        match effect {
            VmEffect::SetTimer { interval_ms } => self.set_timer(inst, interval_ms),
            VmEffect::ChangeState(target) => {
                if target as usize >= inst.unit.states.len() {
                    return Err(VmFault::BadState(u64::from(target)));
                }
                inst.state.state_change_prep();
                self.disarm(inst, WakeAction::Touch);
                self.inbox.post_state_change(inst.item_id, target);
            }
            VmEffect::Syscall(call) => {
                inst.state.run_state = RunState::Syscall;
                self.syscall_seq += 1;
                inst.syscall_in_flight = true;
                inst.syscall_seq = self.syscall_seq;
                self.syscalls.spawn(inst.item_id, self.syscall_seq, call);
            }
            VmEffect::Say { channel, message } => self.comm.say(inst.item_id, channel, &message),
            VmEffect::Listen { channel } => self.comm.listen(inst.item_id, channel),
            VmEffect::Reset => self.reset_now(inst),
        }
        Ok(())
    }

    /// Execute up to `limit` steps of one instance. Returns the steps used.
    fn run_quantum(&mut self, inst: &mut ScriptInstance, limit: u32) -> u32 {
        let started = Instant::now();
        let unit = inst.unit.clone();
        let interpreter = self.interpreter.clone();
        let now = self.now;
        let mut steps = 0;

        while steps < limit && inst.state.run_state == RunState::Running {
            steps += 1;
            let state = &mut inst.state;
            let outcome = guarded(|| interpreter.tick(&unit, state, now));
            if inst.trace {
                trace!(target: "scheduler", "{} ip={:#x} {:?}", inst.item_id, inst.state.ip, outcome);
            }

            let applied = match outcome {
                Ok(Some(effect)) => self.apply_effect(inst, effect),
                Ok(None) => Ok(()),
                Err(fault) => Err(fault),
            };
            if let Err(fault) = applied {
                self.terminate(inst, fault);
                break;
            }

            match inst.state.run_state {
                RunState::Running | RunState::Killed => {}
                RunState::Waiting => {
                    self.process_event_queue(inst);
                    if inst.state.run_state != RunState::Running {
                        self.run_queue.remove(inst.item_id);
                    }
                }
                RunState::Sleeping => {
                    self.run_queue.remove(inst.item_id);
                    let ready_on = inst.state.next_wakeup;
                    self.arm(inst, WakeAction::None, ready_on);
                }
                RunState::Syscall => {
                    self.run_queue.remove(inst.item_id);
                }
            }
        }

        let elapsed = started.elapsed();
        inst.total_runtime += elapsed;
        if elapsed > Duration::from_millis(self.config.slow_timeslice_ms) {
            warn!(
                target: "scheduler",
                "Slow timeslice: {} (asset {}) ran {}ms; bytecode before ip {:#x}: {}",
                inst.item_id,
                unit.asset_id,
                elapsed.as_millis(),
                inst.state.ip,
                unit.backtrace(inst.state.ip, 32)
            );
        }
        self.changed.insert(inst.item_id);
        steps
    }
}

// ============================================================================
// ExecutionCore
// ============================================================================

/// Owns the run queue, the sleep heap, event routing and the enable/disable
/// state machine for every resident instance.
pub struct ExecutionCore {
    instances: HashMap<ItemId, ScriptInstance>,
    deferred: DeferredEventBuffer,
    /// Snapshot requests waiting for a syscall to return
    parked: HashMap<ItemId, Vec<StateDataRequest>>,
    dispatch: Dispatcher,
    clock: SharedClock,
    persistence: PersistenceHandle,
}

impl ExecutionCore {
    pub fn new(
        config: EngineConfig,
        collaborators: CoreCollaborators,
        inbox: Arc<CoreInbox>,
        syscalls: SyscallPool,
        persistence: PersistenceHandle,
    ) -> Self {
        let clock = inbox.clock().clone();
        let deferred = DeferredEventBuffer::new(config.deferred_ttl_ms, config.max_deferred_events);
        Self {
            instances: HashMap::new(),
            deferred,
            parked: HashMap::new(),
            dispatch: Dispatcher {
                config,
                run_queue: RunQueue::new(),
                sleepers: IndexedHeap::new(),
                host: collaborators.host,
                comm: collaborators.comm,
                faults: collaborators.faults,
                interpreter: collaborators.interpreter,
                syscalls,
                inbox,
                changed: HashSet::new(),
                now: 0,
                syscall_seq: 0,
            },
            clock,
            persistence,
        }
    }

    pub fn inbox(&self) -> &Arc<CoreInbox> {
        &self.dispatch.inbox
    }

    pub fn is_resident(&self, item_id: ItemId) -> bool {
        self.instances.contains_key(&item_id)
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn resident_ids(&self) -> Vec<ItemId> {
        self.instances.keys().copied().collect()
    }

    pub fn run_queue_len(&self) -> usize {
        self.dispatch.run_queue.len()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Read-only view of one instance's state
    pub fn runtime_state(&self, item_id: ItemId) -> Option<&RuntimeState> {
        self.instances.get(&item_id).map(|inst| &inst.state)
    }

    /// One scheduling pass
    pub fn do_work(&mut self) -> WorkStatus {
        let now = self.clock.now_ms();
        self.dispatch.now = now;
        let inbox = self.dispatch.inbox.clone();
        let mut did_work = false;

        if let Some(request) = inbox.pop_state_request() {
            self.service_state_request(request);
            did_work = true;
        }

        did_work |= self.wake_sleepers(now);

        if let Some(message) = self.dispatch.comm.next_message() {
            let item_id = message.item_id;
            self.deliver(item_id, listen_event(message));
            did_work = true;
        }

        let events = inbox.take_events();
        if !events.is_empty() {
            did_work = true;
            for (item_id, event) in events {
                self.deliver(item_id, event);
            }
        }

        if let Some(request) = inbox.pop_info_request() {
            self.answer_info_request(request);
            did_work = true;
        }

        if let Some((item_id, flag)) = inbox.pop_enable_disable() {
            self.change_enabled_status(item_id, flag);
            did_work = true;
        }

        if let Some(item_id) = inbox.pop_reset() {
            self.reset_script(item_id);
            did_work = true;
        }

        let returns = inbox.take_syscall_returns();
        if !returns.is_empty() {
            did_work = true;
            for (item_id, seq, result) in returns {
                self.resume_from_syscall(item_id, seq, result);
            }
        }
        self.sweep_parked_requests(now);

        self.deferred.expire(now);

        for (item_id, avatar) in inbox.take_avatars_ready() {
            did_work = true;
            if self.instances.contains_key(&item_id) {
                self.dispatch.host.crossed_avatar_ready(item_id, avatar);
            } else {
                self.deferred.add_avatar_ready(item_id, avatar, now);
            }
        }

        for (item_id, detect) in inbox.take_touch_updates() {
            if let Some(inst) = self.instances.get_mut(&item_id) {
                if inst.state.touch_active {
                    inst.state.current_touch_detect = detect;
                }
            }
        }

        for command in inbox.take_commands() {
            did_work = true;
            self.run_command(command);
        }

        did_work |= self.do_timeslices();

        for item_id in self.dispatch.changed.drain() {
            self.persistence.changed(item_id);
        }

        WorkStatus {
            work_was_done: did_work,
            work_is_pending: !self.dispatch.run_queue.is_empty() || inbox.has_pending(),
            next_wakeup: self
                .dispatch
                .sleepers
                .peek()
                .map_or(u64::MAX, |entry| entry.ready_on),
        }
    }

    fn wake_sleepers(&mut self, now: u64) -> bool {
        let mut woke = false;
        while let Some(entry) = self.dispatch.sleepers.peek().copied() {
            if entry.ready_on > now {
                break;
            }
            self.dispatch.sleepers.pop();
            woke = true;

            let Some(inst) = self.instances.get_mut(&entry.item_id) else {
                continue;
            };
            *inst.wake_slot(entry.action) = None;
            if inst.state.run_state == RunState::Killed || !inst.state.is_enabled() {
                continue;
            }

            let d = &mut self.dispatch;
            match entry.action {
                WakeAction::None => {
                    if inst.state.run_state == RunState::Sleeping {
                        inst.state.run_state = RunState::Running;
                        d.run_queue.push_back(inst.item_id);
                        d.changed.insert(inst.item_id);
                    }
                }
                WakeAction::Timer => {
                    inst.state.timer_last_scheduled_on = entry.ready_on;
                    if !inst.state.is_event_queued(EventKind::Timer)
                        && !d.queue_or_start(inst, PostedEvent::new(EventKind::Timer))
                    {
                        d.check_and_reset_timer_wait(inst);
                    }
                }
                WakeAction::Touch => {
                    if inst.state.touch_active {
                        if !inst.state.is_event_queued(EventKind::Touch) {
                            let event = PostedEvent::new(EventKind::Touch)
                                .with_detect(inst.state.current_touch_detect.clone());
                            d.queue_or_start(inst, event);
                        }
                        if inst.state.touch_active {
                            let ready_on = now + d.config.touch_repeat_ms;
                            d.arm(inst, WakeAction::Touch, ready_on);
                        }
                    }
                }
            }
        }
        woke
    }

    /// Route one event. Non-resident targets are deferred. Killed and
    /// disabled targets drop it unless it is a `state_entry` or the only thing
    /// holding them is the crossing wait.
    fn deliver(&mut self, item_id: ItemId, event: PostedEvent) {
        let Some(inst) = self.instances.get_mut(&item_id) else {
            self.deferred.add_event(item_id, event, self.dispatch.now);
            return;
        };

        if inst.state.run_state != RunState::Killed && inst.state.is_enabled() {
            self.dispatch.queue_or_start(inst, event);
            return;
        }

        let crossing_only =
            inst.state.general_enable && inst.state.local_disable == LocalDisable::CROSSING_WAIT;
        if event.kind == EventKind::StateEntry || crossing_only {
            if inst
                .state
                .queue_event(event, self.dispatch.config.max_queued_events)
            {
                self.dispatch.changed.insert(item_id);
            }
        } else {
            trace!(target: "scheduler", "Dropping {} for disabled {}", event.kind, item_id);
        }
    }

    fn service_state_request(&mut self, request: StateDataRequest) {
        let Some(inst) = self.instances.get_mut(&request.item_id) else {
            request.respond_empty();
            return;
        };
        if inst.syscall_in_flight && inst.state.run_state == RunState::Syscall {
            debug!(target: "scheduler", "Parking state request for {} until its syscall returns", request.item_id);
            self.parked.entry(request.item_id).or_default().push(request);
            return;
        }
        Self::answer_state_request(&mut self.dispatch, inst, request);
    }

    fn answer_state_request(
        dispatch: &mut Dispatcher,
        inst: &mut ScriptInstance,
        request: StateDataRequest,
    ) {
        if inst.state.is_enabled() {
            inst.state.state_captured_on = dispatch.now;
        }

        let snapshot = match request.form {
            StateForm::Raw => Some(StateSnapshot::Raw(inst.state.clone())),
            StateForm::Serialized => match inst.state.to_bytes() {
                Ok(bytes) => Some(StateSnapshot::Serialized(bytes)),
                Err(e) => {
                    warn!(target: "scheduler", "Failed to serialize state for {}: {}", inst.item_id, e);
                    None
                }
            },
        };

        let stop_reason = request.stop_reason;
        request.reply.send(StateData {
            item_id: inst.item_id,
            snapshot,
        });

        match stop_reason {
            StopScriptReason::None => {}
            StopScriptReason::Derez => {
                dispatch.change_enabled(inst, EnableDisableFlag::DerezDisable)
            }
            StopScriptReason::Crossing => {
                dispatch.change_enabled(inst, EnableDisableFlag::CrossingWaitDisable)
            }
        }
    }

    fn answer_info_request(&self, request: ScriptInfoRequest) {
        match request {
            ScriptInfoRequest::Running { item_id, reply } => {
                let info = self.instances.get(&item_id).map(|inst| ScriptRunningInfo {
                    item_id,
                    asset_id: inst.unit.asset_id,
                    run_state: inst.state.run_state,
                    state_index: inst.state.state_index,
                    queued_events: inst.state.event_queue.len(),
                    enabled: inst.state.is_enabled(),
                    total_runtime: inst.total_runtime,
                });
                reply.send(info);
            }
            ScriptInfoRequest::EnabledDetails { item_ids, reply } => {
                let details = item_ids
                    .iter()
                    .filter_map(|id| self.instances.get(id))
                    .map(|inst| EnabledDetail {
                        item_id: inst.item_id,
                        general_enable: inst.state.general_enable,
                        local_disable: inst.state.local_disable,
                    })
                    .collect();
                reply.send(details);
            }
        }
    }

    fn change_enabled_status(&mut self, item_id: ItemId, flag: EnableDisableFlag) {
        match self.instances.get_mut(&item_id) {
            Some(inst) => self.dispatch.change_enabled(inst, flag),
            None => self
                .deferred
                .add_enable_flag(item_id, flag, self.dispatch.now),
        }
    }

    fn reset_script(&mut self, item_id: ItemId) {
        let Some(inst) = self.instances.get_mut(&item_id) else {
            debug!(target: "scheduler", "Reset for {} ignored, not resident", item_id);
            return;
        };
        self.dispatch.reset_now(inst);
        if let Some(requests) = self.parked.remove(&item_id) {
            for request in requests {
                Self::answer_state_request(&mut self.dispatch, inst, request);
            }
        }
    }

    fn resume_from_syscall(&mut self, item_id: ItemId, seq: u64, result: SyscallResult) {
        let Some(inst) = self.instances.get_mut(&item_id) else {
            return;
        };
        if !inst.syscall_in_flight || inst.syscall_seq != seq {
            debug!(target: "scheduler", "Discarding stale syscall return {} for {}", seq, item_id);
            return;
        }
        inst.syscall_in_flight = false;
        let d = &mut self.dispatch;

        if inst.state.run_state == RunState::Syscall {
            if let Some(value) = result.value {
                inst.state.operands.push(value);
            }
            if result.delay_ms > 0 {
                inst.state.run_state = RunState::Sleeping;
                inst.state.next_wakeup = d.now + result.delay_ms;
            } else {
                inst.state.run_state = RunState::Running;
            }

            // A disabled instance keeps its result and is admitted on enable
            if inst.state.is_enabled() {
                match inst.state.run_state {
                    RunState::Running => {
                        d.run_queue.push_back(item_id);
                    }
                    _ => {
                        let ready_on = inst.state.next_wakeup;
                        d.arm(inst, WakeAction::None, ready_on);
                    }
                }
            }
            d.changed.insert(item_id);
        }

        if let Some(requests) = self.parked.remove(&item_id) {
            for request in requests {
                Self::answer_state_request(d, inst, request);
            }
        }
    }

    fn sweep_parked_requests(&mut self, now: u64) {
        if self.parked.is_empty() {
            return;
        }
        let timeout = self.dispatch.config.syscall_timeout_ms;
        let mut expired = Vec::new();
        for requests in self.parked.values_mut() {
            let mut i = 0;
            while i < requests.len() {
                if now.saturating_sub(requests[i].issued_at) > timeout {
                    expired.push(requests.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        self.parked.retain(|_, requests| !requests.is_empty());

        for request in expired {
            warn!(target: "scheduler", "Discarding state request for {} parked on a syscall", request.item_id);
            request.respond_empty();
        }
    }

    fn run_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::StartTrace(item_id) => {
                if let Some(inst) = self.instances.get_mut(&item_id) {
                    inst.trace = true;
                }
            }
            EngineCommand::StopAllTraces => {
                for inst in self.instances.values_mut() {
                    inst.trace = false;
                }
            }
        }
    }

    /// Run bounded quanta round-robin from the cursor until the pass budget
    /// is spent or nothing is runnable.
    fn do_timeslices(&mut self) -> bool {
        let slice = self.dispatch.config.script_timeslice.max(1);
        let mut budget = self.dispatch.config.instruction_frequency;
        let mut ran = false;

        while budget > 0 {
            let Some(item_id) = self.dispatch.run_queue.cursor() else {
                break;
            };
            let Some(inst) = self.instances.get_mut(&item_id) else {
                self.dispatch.run_queue.remove(item_id);
                continue;
            };

            let steps = self.dispatch.run_quantum(inst, slice.min(budget));
            budget = budget.saturating_sub(steps.max(1));
            ran = true;

            if self.dispatch.run_queue.cursor() == Some(item_id) {
                self.dispatch.run_queue.advance();
            }
        }
        ran
    }

    // ========================================================================
    // Load pipeline hand-off
    // ========================================================================

    /// Turn a resolved load into a resident instance and admit it
    pub fn finished_loading(&mut self, admission: Admission) -> Result<(), LoadError> {
        let item_id = admission.item_id;
        if self.instances.contains_key(&item_id) {
            return Err(LoadError::AlreadyRunning(item_id));
        }
        self.dispatch.now = self.clock.now_ms();

        let fresh = admission.state.is_none();
        let mut state = admission.state.unwrap_or_else(RuntimeState::fresh);
        if fresh || admission.post_on_rez {
            state.start_param = admission.start_param;
        }
        if admission.start_global_disabled {
            state.general_enable = false;
        }
        let host = &self.dispatch.host;
        let parcel_blocked = admission.start_local_disabled
            || !host.parcel_allows_scripts(admission.object_id);
        if parcel_blocked && !host.has_avatar_controls(admission.object_id, item_id) {
            state.local_disable.insert(LocalDisable::PARCEL);
        }
        if admission.from_crossing {
            state.local_disable.insert(LocalDisable::CROSSING_WAIT);
        }
        state.event_mask = admission.unit.event_mask(state.state_index);

        let max_queued = self.dispatch.config.max_queued_events;
        if fresh {
            state.queue_event(PostedEvent::new(EventKind::StateEntry), max_queued);
        }
        if admission.post_on_rez {
            state.queue_event(
                PostedEvent::with_args(EventKind::OnRez, vec![Value::Int(admission.start_param)]),
                max_queued,
            );
        }
        if admission.changed_region_start && state.event_mask & EventKind::Changed.bit() != 0 {
            state.queue_event(
                PostedEvent::with_args(EventKind::Changed, vec![Value::Int(CHANGED_REGION_START)]),
                max_queued,
            );
        }

        if let Some(bundle) = self.deferred.take(item_id) {
            debug!(
                target: "scheduler",
                "Injecting {} deferred events and {} flags into {}",
                bundle.events.len(),
                bundle.enable_flags.len(),
                item_id
            );
            for flag in bundle.enable_flags {
                apply_flag(&mut state, flag);
            }
            for avatar in bundle.avatars_ready {
                self.dispatch.host.crossed_avatar_ready(item_id, avatar);
            }
            for event in bundle.events {
                if has_handler(&admission.unit, &state, &event) {
                    state.queue_event(event, max_queued);
                }
            }
        }

        let mut inst =
            ScriptInstance::new(item_id, admission.object_id, admission.unit, state);
        info!(
            target: "scheduler",
            "Loaded {} (asset {}, {}, enabled {})",
            item_id,
            inst.unit.asset_id,
            if fresh { "fresh" } else { "restored" },
            inst.state.is_enabled()
        );
        if inst.state.is_enabled() {
            self.dispatch.admit(&mut inst);
        }
        self.dispatch.changed.insert(item_id);
        self.instances.insert(item_id, inst);
        Ok(())
    }

    /// Release an instance entirely. Returns its compiled unit so the loader
    /// can drop its reference.
    pub fn do_unload(&mut self, item_id: ItemId) -> Option<Arc<CompiledUnit>> {
        let mut inst = self.instances.remove(&item_id)?;
        self.dispatch.disarm_all(&mut inst);
        self.dispatch.run_queue.remove(item_id);
        self.dispatch.comm.remove_listeners(item_id);
        self.dispatch.changed.remove(&item_id);
        if let Some(requests) = self.parked.remove(&item_id) {
            for request in requests {
                request.respond_empty();
            }
        }
        self.persistence.unloaded(item_id);
        info!(target: "scheduler", "Unloaded {}", item_id);
        Some(inst.unit)
    }

    /// Direct snapshot for the shutdown flush. Only valid once the
    /// scheduling thread has stopped.
    pub fn snapshot_now(&mut self, item_id: ItemId) -> Option<RuntimeState> {
        let now = self.clock.now_ms();
        let inst = self.instances.get_mut(&item_id)?;
        if inst.state.is_enabled() {
            inst.state.state_captured_on = now;
        }
        Some(inst.state.clone())
    }
}
