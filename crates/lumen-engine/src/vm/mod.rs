//! Interpreter seam and the reference bytecode implementation
//!
//! The scheduler only talks to [`Interpreter`]. It never inspects opcodes;
//! everything it needs to know about a step comes back as a run-state change
//! on [`RuntimeState`] or as a [`VmEffect`].

pub mod asm;
pub mod interp;

use lumen_events::{PostedEvent, Value};
use std::fmt;

use crate::error::VmFault;
use crate::runtime::RuntimeState;
use crate::unit::{CompiledUnit, EventHandler};

pub use asm::Assembler;
pub use interp::BytecodeInterpreter;

/// Work handed to the syscall pool. Runs off the scheduling thread.
pub type AsyncCall = Box<dyn FnOnce() -> SyscallResult + Send + 'static>;

/// Value produced by a long-running call
#[derive(Debug, Clone, PartialEq)]
pub struct SyscallResult {
    /// Pushed onto the operand stack when the instance resumes
    pub value: Option<Value>,
    /// 0 resumes immediately, otherwise the instance sleeps this long first
    pub delay_ms: u64,
}

/// Side effects a single step asks the scheduler to perform
pub enum VmEffect {
    SetTimer { interval_ms: u64 },
    ChangeState(u32),
    Syscall(AsyncCall),
    Say { channel: i32, message: String },
    Listen { channel: i32 },
    Reset,
}

impl fmt::Debug for VmEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmEffect::SetTimer { interval_ms } => f
                .debug_struct("SetTimer")
                .field("interval_ms", interval_ms)
                .finish(),
            VmEffect::ChangeState(state) => f.debug_tuple("ChangeState").field(state).finish(),
            VmEffect::Syscall(_) => f.write_str("Syscall(..)"),
            VmEffect::Say { channel, message } => f
                .debug_struct("Say")
                .field("channel", channel)
                .field("message", message)
                .finish(),
            VmEffect::Listen { channel } => {
                f.debug_struct("Listen").field("channel", channel).finish()
            }
            VmEffect::Reset => f.write_str("Reset"),
        }
    }
}

/// Executes compiled units one instruction at a time.
///
/// Implementations must not block: anything slow is returned as
/// [`VmEffect::Syscall`] with the instance moved to `RunState::Syscall`.
pub trait Interpreter: Send + Sync {
    /// Execute one instruction of the running handler
    fn tick(
        &self,
        unit: &CompiledUnit,
        state: &mut RuntimeState,
        now: u64,
    ) -> Result<Option<VmEffect>, VmFault>;

    /// Point the instance at `handler` and make it runnable
    fn start_event(
        &self,
        unit: &CompiledUnit,
        state: &mut RuntimeState,
        handler: &EventHandler,
        event: PostedEvent,
    ) -> Result<(), VmFault>;

    /// Return the instance to its just-loaded state
    fn reset(&self, _unit: &CompiledUnit, state: &mut RuntimeState) {
        state.reset();
    }
}
