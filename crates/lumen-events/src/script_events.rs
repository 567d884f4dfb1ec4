use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::value::Value;

// ============================================================================
// Event Kinds
// ============================================================================

/// Every event a script may handle.
///
/// The discriminant doubles as the bit position in a state's subscribed
/// event mask, so the order here is part of the persisted format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventKind {
    StateEntry = 0,
    StateExit = 1,
    TouchStart = 2,
    Touch = 3,
    TouchEnd = 4,
    CollisionStart = 5,
    Collision = 6,
    CollisionEnd = 7,
    Timer = 8,
    Listen = 9,
    Sensor = 10,
    NoSensor = 11,
    Control = 12,
    Money = 13,
    RunTimePermissions = 14,
    Changed = 15,
    Attach = 16,
    Dataserver = 17,
    LinkMessage = 18,
    OnRez = 19,
    ObjectRez = 20,
    HttpResponse = 21,
}

impl EventKind {
    pub const ALL: [EventKind; 22] = [
        EventKind::StateEntry,
        EventKind::StateExit,
        EventKind::TouchStart,
        EventKind::Touch,
        EventKind::TouchEnd,
        EventKind::CollisionStart,
        EventKind::Collision,
        EventKind::CollisionEnd,
        EventKind::Timer,
        EventKind::Listen,
        EventKind::Sensor,
        EventKind::NoSensor,
        EventKind::Control,
        EventKind::Money,
        EventKind::RunTimePermissions,
        EventKind::Changed,
        EventKind::Attach,
        EventKind::Dataserver,
        EventKind::LinkMessage,
        EventKind::OnRez,
        EventKind::ObjectRez,
        EventKind::HttpResponse,
    ];

    /// Bit for this event in a subscribed-event mask
    pub fn bit(self) -> u64 {
        1u64 << (self as u8)
    }

    /// Source-level handler name
    pub fn name(self) -> &'static str {
        match self {
            EventKind::StateEntry => "state_entry",
            EventKind::StateExit => "state_exit",
            EventKind::TouchStart => "touch_start",
            EventKind::Touch => "touch",
            EventKind::TouchEnd => "touch_end",
            EventKind::CollisionStart => "collision_start",
            EventKind::Collision => "collision",
            EventKind::CollisionEnd => "collision_end",
            EventKind::Timer => "timer",
            EventKind::Listen => "listen",
            EventKind::Sensor => "sensor",
            EventKind::NoSensor => "no_sensor",
            EventKind::Control => "control",
            EventKind::Money => "money",
            EventKind::RunTimePermissions => "run_time_permissions",
            EventKind::Changed => "changed",
            EventKind::Attach => "attach",
            EventKind::Dataserver => "dataserver",
            EventKind::LinkMessage => "link_message",
            EventKind::OnRez => "on_rez",
            EventKind::ObjectRez => "object_rez",
            EventKind::HttpResponse => "http_response",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| format!("unknown event '{}'", s))
    }
}

// ============================================================================
// Posted Events
// ============================================================================

/// Detection data attached to touch, collision and sensor events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectVariables {
    pub key: Uuid,
    pub name: String,
    pub owner: Uuid,
    pub position: [f32; 3],
    pub link_number: i32,
    pub touch_face: i32,
    /// Set when the detected entity is a bot rather than a prim or avatar
    pub bot_id: Option<Uuid>,
}

/// One stimulus addressed to a script instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostedEvent {
    pub kind: EventKind,
    pub args: Vec<Value>,
    pub detect: Vec<DetectVariables>,
    /// When set, the instance switches to this state before the handler is looked up
    pub transition_to: Option<u32>,
}

impl PostedEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            args: Vec::new(),
            detect: Vec::new(),
            transition_to: None,
        }
    }

    pub fn with_args(kind: EventKind, args: Vec<Value>) -> Self {
        Self {
            args,
            ..Self::new(kind)
        }
    }

    pub fn with_detect(mut self, detect: Vec<DetectVariables>) -> Self {
        self.detect = detect;
        self
    }

    /// The `state_entry` half of a state change
    pub fn entering_state(state: u32) -> Self {
        Self {
            transition_to: Some(state),
            ..Self::new(EventKind::StateEntry)
        }
    }

    /// A control event whose "changed" argument is zero, which carries no new
    /// key information.
    pub fn is_null_control(&self) -> bool {
        self.kind == EventKind::Control && self.args.get(2).and_then(Value::as_int) == Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_round_trip_through_from_str() {
        for kind in EventKind::ALL {
            assert_eq!(kind.name().parse::<EventKind>(), Ok(kind));
        }
        assert!("no_such_event".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_event_bits_are_distinct() {
        let mask = EventKind::ALL.iter().fold(0u64, |acc, k| {
            assert_eq!(acc & k.bit(), 0);
            acc | k.bit()
        });
        assert_eq!(mask.count_ones() as usize, EventKind::ALL.len());
    }

    #[test]
    fn test_null_control_detection() {
        let key = Value::Key(Uuid::new_v4());
        let null = PostedEvent::with_args(
            EventKind::Control,
            vec![key.clone(), Value::Int(1), Value::Int(0)],
        );
        let held = PostedEvent::with_args(EventKind::Control, vec![key, Value::Int(1), Value::Int(4)]);

        assert!(null.is_null_control());
        assert!(!held.is_null_control());
        assert!(!PostedEvent::new(EventKind::Touch).is_null_control());
    }
}
