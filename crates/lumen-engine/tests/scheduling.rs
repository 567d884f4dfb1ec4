mod common;

use common::Harness;
use lumen_engine::requests::{Reply, StateDataRequest, StateForm, StateSnapshot};
use lumen_engine::runtime::{LocalDisable, RunState};
use lumen_events::{
    DetectVariables, EnableDisableFlag, EventKind, ItemId, PostedEvent, StopScriptReason, Value,
};
use std::time::Duration;

const GREETER: &str = "\
@state default
@on state_entry
    say entered
@on touch_start
    say touched
";

const TICKER: &str = "\
@state default
@on state_entry
    timer 1000
@on timer
    say tick
@on touch_start
    say touched
";

fn touch() -> PostedEvent {
    PostedEvent::new(EventKind::TouchStart)
}

#[test]
fn test_end_to_end_shared_unit_and_deferred_replay() {
    let mut h = Harness::new();
    let (a, asset) = h.add_script(1, GREETER);
    let b = h.add_item(2, asset);

    h.load(a, 1).unwrap();
    assert_eq!(h.said_by(a), vec!["entered"]);
    h.persist();
    assert!(h.store.contains(a));

    h.load(b, 2).unwrap();
    assert_eq!(h.pipeline.refcount(asset), Some(2));
    assert_eq!(h.pipeline.compilations(), 1);
    assert_eq!(h.assets.fetches(), 1);

    h.core_inbox
        .push_enable_disable(a, EnableDisableFlag::GeneralDisable);
    h.pump();
    h.unload(a);
    h.manager.run_cycle();
    assert!(!h.core.is_resident(a));
    assert!(h.core.is_resident(b));
    assert!(!h.store.contains(a));
    assert_eq!(h.pipeline.refcount(asset), Some(1));

    h.core_inbox.post_event(b, touch());
    h.pump();
    assert_eq!(h.said_by(b), vec!["entered", "touched"]);

    let c = h.add_item(3, asset);
    for _ in 0..40 {
        h.core_inbox.post_event(c, touch());
    }
    h.pump();
    assert_eq!(h.core.deferred_len(), 1);

    h.load(c, 3).unwrap();
    let said = h.said_by(c);
    assert_eq!(said[0], "entered");
    assert_eq!(said.iter().filter(|m| *m == "touched").count(), 32);
    assert_eq!(h.core.deferred_len(), 0);
}

#[test]
fn test_deferred_events_expire() {
    let mut h = Harness::with_config(|c| c.deferred_ttl_ms = 1_000);
    let (item, _) = h.add_script(1, GREETER);

    h.core_inbox.post_event(item, touch());
    h.pump();
    h.advance(1_001);
    assert_eq!(h.core.deferred_len(), 0);

    h.load(item, 1).unwrap();
    assert_eq!(h.said_by(item), vec!["entered"]);
}

#[test]
fn test_enable_resumes_queued_events_and_timer_phase() {
    let mut h = Harness::new();
    let (item, _) = h.add_script(1, TICKER);
    h.load(item, 1).unwrap();

    h.advance(400);
    h.core_inbox
        .push_enable_disable(item, EnableDisableFlag::CrossingWaitDisable);
    h.pump();
    assert!(!h.core.runtime_state(item).unwrap().is_enabled());

    h.core_inbox.post_event(item, touch());
    h.core_inbox.post_event(item, touch());
    h.advance(5_000);
    assert!(h.said_by(item).is_empty());
    assert_eq!(h.core.runtime_state(item).unwrap().event_queue.len(), 2);

    h.core_inbox
        .push_enable_disable(item, EnableDisableFlag::CrossingWaitEnable);
    h.pump();
    assert_eq!(h.said_by(item), vec!["touched", "touched"]);

    h.advance(599);
    assert_eq!(h.said_by(item).len(), 2);
    h.advance(1);
    assert_eq!(h.said_by(item), vec!["touched", "touched", "tick"]);
    h.advance(1_000);
    assert_eq!(h.said_by(item).last().map(String::as_str), Some("tick"));
    assert_eq!(h.said_by(item).len(), 4);
}

#[test]
fn test_disabled_instance_drops_events() {
    let mut h = Harness::new();
    let (item, _) = h.add_script(1, GREETER);
    h.load(item, 1).unwrap();

    h.core_inbox
        .push_enable_disable(item, EnableDisableFlag::GeneralDisable);
    h.pump();
    h.core_inbox.post_event(item, touch());
    h.pump();
    h.core_inbox
        .push_enable_disable(item, EnableDisableFlag::GeneralEnable);
    h.pump();

    assert_eq!(h.said_by(item), vec!["entered"]);
}

#[test]
fn test_state_exit_precedes_state_entry() {
    let mut h = Harness::new();
    let (item, _) = h.add_script(
        1,
        "\
@state default
@on state_entry
    say default_entry
@on state_exit
    say default_exit
@on touch_start
    state other
    say unreachable
@state other
@on state_entry
    say other_entry
@on touch_start
    say other_touched
",
    );
    h.load(item, 1).unwrap();

    h.core_inbox.post_event(item, touch());
    h.core_inbox.post_event(item, touch());
    h.pump();

    assert_eq!(
        h.said_by(item),
        vec!["default_entry", "default_exit", "other_entry"]
    );
    assert_eq!(h.core.runtime_state(item).unwrap().state_index, 1);

    h.core_inbox.post_event(item, touch());
    h.pump();
    assert_eq!(h.said_by(item).last().map(String::as_str), Some("other_touched"));
}

#[test]
fn test_syscall_resumes_running_or_sleeping() {
    let mut h = Harness::new();
    let (item, _) = h.add_script(
        1,
        "\
@state default
@on state_entry
    call 20
    say resumed
@on touch_start
    call 0 500
    say slept
",
    );
    h.load(item, 1).unwrap();
    h.pump();
    if h.said_by(item).is_empty() {
        assert_eq!(h.core.runtime_state(item).unwrap().run_state, RunState::Syscall);
        assert_eq!(h.core.run_queue_len(), 0);
    }
    h.pump_until(|h| h.said_by(item) == vec!["resumed"]);

    h.core_inbox.post_event(item, touch());
    h.pump_until(|h| h.core.runtime_state(item).unwrap().run_state == RunState::Sleeping);
    assert_eq!(h.said_by(item), vec!["resumed"]);

    h.advance(499);
    assert_eq!(h.said_by(item), vec!["resumed"]);
    h.advance(1);
    assert_eq!(h.said_by(item), vec!["resumed", "slept"]);
}

#[test]
fn test_snapshot_round_trip_keeps_timer_phase() {
    let mut h = Harness::new();
    let (item, asset) = h.add_script(1, TICKER);
    h.load(item, 1).unwrap();
    h.advance(300);

    let (reply, rx) = Reply::channel();
    h.core_inbox.push_state_request(
        StateDataRequest::new(item, StateForm::Serialized, reply).with_stop(StopScriptReason::Crossing),
    );
    h.pump();
    let bytes = match rx.try_recv().unwrap().snapshot {
        Some(StateSnapshot::Serialized(bytes)) => bytes,
        other => panic!("unexpected snapshot {:?}", other),
    };
    let detail = h.core.runtime_state(item).unwrap();
    assert!(detail.local_disable.contains(LocalDisable::CROSSING_WAIT));
    h.unload(item);

    let moved = h.add_item(2, asset);
    h.submit(
        lumen_engine::LoadRequest::load(moved, 2)
            .with_state_source(lumen_engine::StateSource::Embedded(bytes))
            .from_crossing(),
    )
    .unwrap();
    let restored = h.core.runtime_state(moved).unwrap();
    assert!(restored.general_enable);
    assert_eq!(restored.timer_interval_ms, 1_000);
    assert!(h.said_by(moved).is_empty());

    h.advance(10_000);
    h.core_inbox
        .push_enable_disable(moved, EnableDisableFlag::CrossingWaitEnable);
    h.pump();
    h.advance(699);
    assert!(h.said_by(moved).is_empty());
    h.advance(1);
    assert_eq!(h.said_by(moved), vec!["tick"]);
}

#[test]
fn test_null_control_events_coalesce() {
    let mut h = Harness::new();
    let (item, _) = h.add_script(
        1,
        "\
@state default
@on control
    sleep 100
    say control
",
    );
    h.load(item, 1).unwrap();

    let null_control = || {
        PostedEvent::with_args(
            EventKind::Control,
            vec![Value::Key(ItemId::nil().0), Value::Int(0), Value::Int(0)],
        )
    };
    for _ in 0..4 {
        h.core_inbox.post_event(item, null_control());
    }
    h.pump();
    assert_eq!(h.core.runtime_state(item).unwrap().event_queue.len(), 1);

    h.advance(100);
    h.advance(100);
    assert_eq!(h.said_by(item), vec!["control", "control"]);
}

#[test]
fn test_null_control_coalesces_with_any_queued_control() {
    let mut h = Harness::new();
    let (item, _) = h.add_script(
        1,
        "\
@state default
@on control
    sleep 100
    say control
",
    );
    h.load(item, 1).unwrap();

    let control = |change| {
        PostedEvent::with_args(
            EventKind::Control,
            vec![Value::Key(ItemId::nil().0), Value::Int(1), Value::Int(change)],
        )
    };
    h.core_inbox.post_event(item, control(0));
    h.core_inbox.post_event(item, control(1));
    h.core_inbox.post_event(item, control(0));
    h.pump();
    let queue = &h.core.runtime_state(item).unwrap().event_queue;
    assert_eq!(queue.len(), 1);
    assert!(!queue[0].is_null_control());

    h.advance(100);
    h.advance(100);
    h.advance(100);
    assert_eq!(h.said_by(item), vec!["control", "control"]);
}

#[test]
fn test_unhandled_events_do_not_fill_the_queue() {
    let mut h = Harness::with_config(|c| c.max_queued_events = 4);
    let (item, _) = h.add_script(
        1,
        "\
@state default
@on touch_start
    sleep 1000
    say touched
",
    );
    h.load(item, 1).unwrap();

    h.core_inbox.post_event(item, touch());
    for _ in 0..4 {
        h.core_inbox
            .post_event(item, PostedEvent::new(EventKind::Money));
    }
    h.core_inbox.post_event(item, touch());
    h.pump();
    let queue = &h.core.runtime_state(item).unwrap().event_queue;
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].kind, EventKind::TouchStart);

    h.advance(1_000);
    h.advance(1_000);
    assert_eq!(h.said_by(item), vec!["touched", "touched"]);
}

#[test]
fn test_queued_transition_decides_the_handler() {
    let mut h = Harness::new();
    let (item, _) = h.add_script(
        1,
        "\
@state default
@on touch_start
    state other
@on state_exit
    sleep 100
    say default_exit
@state other
@on state_entry
    say other_entry
@on money
    say paid
",
    );
    h.load(item, 1).unwrap();

    h.core_inbox.post_event(item, touch());
    h.pump();
    assert_eq!(h.core.runtime_state(item).unwrap().event_queue.len(), 1);
    h.core_inbox
        .post_event(item, PostedEvent::new(EventKind::Money));
    h.pump();
    let state = h.core.runtime_state(item).unwrap();
    assert_eq!(state.state_index, 0);
    assert_eq!(state.event_queue.len(), 2);

    h.advance(100);
    assert_eq!(h.said_by(item), vec!["default_exit", "other_entry", "paid"]);
}

#[test]
fn test_touch_repeats_until_touch_end() {
    let mut h = Harness::new();
    let (item, _) = h.add_script(
        1,
        "\
@state default
@on touch_start
    say start
@on touch
    say repeat
@on touch_end
    say end
",
    );
    h.load(item, 1).unwrap();

    let toucher = |name: &str| {
        vec![DetectVariables {
            name: name.to_string(),
            link_number: 1,
            ..Default::default()
        }]
    };
    h.core_inbox.post_event(item, touch().with_detect(toucher("alice")));
    h.pump();
    let state = h.core.runtime_state(item).unwrap();
    assert!(state.touch_active);
    assert_eq!(state.current_touch_detect, toucher("alice"));

    h.advance(99);
    assert_eq!(h.said_by(item), vec!["start"]);
    h.advance(1);
    assert_eq!(h.said_by(item), vec!["start", "repeat"]);

    h.core_inbox.push_touch_update(item, toucher("bob"));
    h.pump();
    assert_eq!(h.core.runtime_state(item).unwrap().current_touch_detect, toucher("bob"));
    h.advance(100);
    assert_eq!(h.said_by(item), vec!["start", "repeat", "repeat"]);

    h.core_inbox
        .post_event(item, PostedEvent::new(EventKind::TouchEnd));
    h.pump();
    let state = h.core.runtime_state(item).unwrap();
    assert!(!state.touch_active);
    assert!(state.current_touch_detect.is_empty());

    h.advance(500);
    assert_eq!(h.said_by(item), vec!["start", "repeat", "repeat", "end"]);

    h.core_inbox.push_touch_update(item, toucher("carol"));
    h.pump();
    assert!(h.core.runtime_state(item).unwrap().current_touch_detect.is_empty());
}

#[test]
fn test_state_request_waits_for_syscall() {
    let mut h = Harness::new();
    let (item, _) = h.add_script(
        1,
        "\
@state default
@on touch_start
    call 300
    say back
",
    );
    h.load(item, 1).unwrap();
    h.core_inbox.post_event(item, touch());
    h.pump();
    assert_eq!(h.core.runtime_state(item).unwrap().run_state, RunState::Syscall);

    let (reply, rx) = Reply::channel();
    h.core_inbox
        .push_state_request(StateDataRequest::new(item, StateForm::Raw, reply));
    h.pump();
    assert!(rx.try_recv().is_err());

    h.pump_until(|h| h.said_by(item) == vec!["back"]);
    let answer = rx.try_recv().unwrap();
    assert_eq!(answer.item_id, item);
    assert!(matches!(answer.snapshot, Some(StateSnapshot::Raw(_))));
}

#[test]
fn test_parked_state_request_times_out() {
    let mut h = Harness::with_config(|c| c.syscall_timeout_ms = 1_000);
    let (item, _) = h.add_script(
        1,
        "\
@state default
@on touch_start
    call 300
    say back
",
    );
    h.load(item, 1).unwrap();
    h.core_inbox.post_event(item, touch());
    h.pump();

    let (reply, rx) = Reply::channel();
    h.core_inbox
        .push_state_request(StateDataRequest::new(item, StateForm::Raw, reply));
    h.advance(1_000);
    assert!(rx.try_recv().is_err());
    h.advance(1);
    assert_eq!(rx.try_recv().unwrap().snapshot, None);

    h.pump_until(|h| h.said_by(item) == vec!["back"]);
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_syscall_return_from_before_reset_is_discarded() {
    let mut h = Harness::new();
    let (item, _) = h.add_script(
        1,
        "\
@state default
@on touch_start
    call 100
    say first
@on collision_start
    call 1000
    say second
",
    );
    h.load(item, 1).unwrap();
    h.core_inbox.post_event(item, touch());
    h.pump();
    h.core_inbox.push_reset(item);
    h.pump();

    h.core_inbox
        .post_event(item, PostedEvent::new(EventKind::CollisionStart));
    h.pump();
    std::thread::sleep(Duration::from_millis(300));
    h.pump();
    assert!(h.said_by(item).is_empty());
    assert_eq!(h.core.runtime_state(item).unwrap().run_state, RunState::Syscall);

    h.pump_until(|h| h.said_by(item) == vec!["second"]);
}

#[test]
fn test_fault_kills_only_that_instance() {
    let mut h = Harness::new();
    let (bad, _) = h.add_script(
        1,
        "\
@state default
@on state_entry
    fault boom
",
    );
    let (good, _) = h.add_script(2, GREETER);
    h.load(bad, 1).unwrap();
    h.load(good, 2).unwrap();

    assert_eq!(h.core.runtime_state(bad).unwrap().run_state, RunState::Killed);
    let reports = h.faults.reports.lock().clone();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, bad);
    assert!(reports[0].1.contains("boom"));

    h.core_inbox.post_event(good, touch());
    h.core_inbox.post_event(bad, touch());
    h.pump();
    assert_eq!(h.said_by(good), vec!["entered", "touched"]);
    assert!(h.core.runtime_state(bad).unwrap().event_queue.is_empty());

    h.core_inbox
        .post_event(bad, PostedEvent::new(EventKind::StateEntry));
    h.core_inbox.post_event(bad, touch());
    h.pump();
    let state = h.core.runtime_state(bad).unwrap();
    assert_eq!(state.run_state, RunState::Killed);
    assert_eq!(state.event_queue.len(), 1);
    assert_eq!(state.event_queue[0].kind, EventKind::StateEntry);
}

#[test]
fn test_reset_reenters_default_state() {
    let mut h = Harness::new();
    let (item, _) = h.add_script(1, TICKER);
    h.load(item, 1).unwrap();
    h.advance(1_000);
    assert_eq!(h.said_by(item), vec!["tick"]);

    h.core_inbox.push_reset(item);
    h.pump();
    let state = h.core.runtime_state(item).unwrap();
    assert_eq!(state.timer_interval_ms, 1_000);

    h.advance(999);
    assert_eq!(h.said_by(item), vec!["tick"]);
    h.advance(1);
    assert_eq!(h.said_by(item), vec!["tick", "tick"]);
}

#[test]
fn test_parcel_disable_unless_avatar_controls() {
    let mut h = Harness::new();
    *h.host.parcel_blocked.lock() = true;
    let (blocked, asset) = h.add_script(1, GREETER);
    h.load(blocked, 1).unwrap();
    let state = h.core.runtime_state(blocked).unwrap();
    assert!(state.local_disable.contains(LocalDisable::PARCEL));
    assert!(h.said_by(blocked).is_empty());

    *h.host.avatar_controls.lock() = true;
    let allowed = h.add_item(2, asset);
    h.load(allowed, 2).unwrap();
    assert_eq!(h.said_by(allowed), vec!["entered"]);
}

#[test]
fn test_info_requests() {
    let mut h = Harness::new();
    let (item, asset) = h.add_script(1, GREETER);
    h.load(item, 1).unwrap();

    let (reply, running) = Reply::channel();
    h.core_inbox
        .push_info_request(lumen_engine::requests::ScriptInfoRequest::Running { item_id: item, reply });
    let (reply, details) = Reply::channel();
    h.core_inbox
        .push_info_request(lumen_engine::requests::ScriptInfoRequest::EnabledDetails {
            item_ids: vec![item, ItemId::new_v4()],
            reply,
        });
    h.pump();

    let info = running.try_recv().unwrap().unwrap();
    assert_eq!(info.asset_id, asset);
    assert_eq!(info.run_state, RunState::Waiting);
    assert!(info.enabled);
    let details = details.try_recv().unwrap();
    assert_eq!(details.len(), 1);
    assert!(details[0].general_enable);
}
