/// Event vocabulary for the lumen script engine
///
/// This crate holds the types that cross the boundary between the host
/// simulator and the engine, so hosts can post stimuli without depending on
/// the scheduler itself.
pub mod control;
pub mod ids;
pub mod script_events;
pub mod value;

pub use control::{EnableDisableFlag, EngineCommand, ListenMessage, StopScriptReason};
pub use ids::{AssetId, ItemId, ObjectId};
pub use script_events::{DetectVariables, EventKind, PostedEvent};
pub use value::Value;
