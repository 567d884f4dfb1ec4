use lumen_events::{PostedEvent, Value};
use std::time::Duration;

use super::{Interpreter, SyscallResult, VmEffect};
use crate::error::VmFault;
use crate::runtime::{RunState, RuntimeState};
use crate::unit::{CompiledUnit, EventHandler};

/// Every instruction is one opcode byte followed by a little-endian u64 operand
pub const INSTRUCTION_LEN: usize = 9;

pub mod op {
    pub const NOP: u8 = 0x00;
    pub const END: u8 = 0x01;
    pub const SLEEP: u8 = 0x02;
    pub const TIMER: u8 = 0x03;
    /// Low 32 bits: simulated work in ms. High 32 bits: resume delay in ms.
    pub const CALL: u8 = 0x04;
    pub const STATE: u8 = 0x05;
    pub const SAY: u8 = 0x06;
    pub const FAULT: u8 = 0x07;
    pub const JMP: u8 = 0x08;
    pub const RESET: u8 = 0x09;
    pub const PUSH: u8 = 0x0A;
    pub const POP: u8 = 0x0B;
    pub const LISTEN: u8 = 0x0C;
}

/// Reference interpreter for the fixed-width instruction set
#[derive(Debug, Clone)]
pub struct BytecodeInterpreter {
    max_operand_depth: usize,
}

impl BytecodeInterpreter {
    pub fn new(max_operand_depth: usize) -> Self {
        Self { max_operand_depth }
    }

    fn push(&self, state: &mut RuntimeState, value: Value) -> Result<(), VmFault> {
        if state.operands.len() >= self.max_operand_depth {
            return Err(VmFault::StackOverflow {
                depth: state.operands.len(),
            });
        }
        state.operands.push(value);
        Ok(())
    }

    fn constant(unit: &CompiledUnit, index: u64) -> Result<String, VmFault> {
        unit.constants
            .get(index as usize)
            .cloned()
            .ok_or(VmFault::BadConstant(index))
    }
}

impl Default for BytecodeInterpreter {
    fn default() -> Self {
        Self::new(4096)
    }
}

fn decode(bytecode: &[u8], ip: usize) -> Result<(u8, u64), VmFault> {
    let instr = bytecode
        .get(ip..ip + INSTRUCTION_LEN)
        .ok_or(VmFault::IpOutOfBounds(ip))?;
    let mut operand = [0u8; 8];
    operand.copy_from_slice(&instr[1..]);
    Ok((instr[0], u64::from_le_bytes(operand)))
}

impl Interpreter for BytecodeInterpreter {
    fn tick(
        &self,
        unit: &CompiledUnit,
        state: &mut RuntimeState,
        now: u64,
    ) -> Result<Option<VmEffect>, VmFault> {
        let ip = state.ip;
        let (opcode, operand) = decode(&unit.bytecode, ip)?;
        state.ip = ip + INSTRUCTION_LEN;

        match opcode {
            op::NOP => Ok(None),
            op::END => {
                state.running_event = None;
                state.operands.clear();
                state.run_state = RunState::Waiting;
                Ok(None)
            }
            op::SLEEP => {
                state.run_state = RunState::Sleeping;
                state.next_wakeup = now.saturating_add(operand);
                Ok(None)
            }
            op::TIMER => Ok(Some(VmEffect::SetTimer {
                interval_ms: operand,
            })),
            op::CALL => {
                let work_ms = operand & 0xFFFF_FFFF;
                let delay_ms = operand >> 32;
                state.run_state = RunState::Syscall;
                Ok(Some(VmEffect::Syscall(Box::new(move || {
                    if work_ms > 0 {
                        std::thread::sleep(Duration::from_millis(work_ms));
                    }
                    SyscallResult {
                        value: Some(Value::Int(work_ms as i32)),
                        delay_ms,
                    }
                }))))
            }
            op::STATE => {
                if operand as usize >= unit.states.len() {
                    return Err(VmFault::BadState(operand));
                }
                Ok(Some(VmEffect::ChangeState(operand as u32)))
            }
            op::SAY => Ok(Some(VmEffect::Say {
                channel: 0,
                message: Self::constant(unit, operand)?,
            })),
            op::FAULT => Err(VmFault::Script(Self::constant(unit, operand)?)),
            op::JMP => {
                state.ip = operand as usize;
                Ok(None)
            }
            op::RESET => Ok(Some(VmEffect::Reset)),
            op::PUSH => {
                self.push(state, Value::Int(operand as i32))?;
                Ok(None)
            }
            op::POP => {
                state.operands.pop().ok_or(VmFault::StackUnderflow)?;
                Ok(None)
            }
            op::LISTEN => Ok(Some(VmEffect::Listen {
                channel: operand as i32,
            })),
            opcode => Err(VmFault::InvalidOpcode { opcode, ip }),
        }
    }

    fn start_event(
        &self,
        unit: &CompiledUnit,
        state: &mut RuntimeState,
        handler: &EventHandler,
        event: PostedEvent,
    ) -> Result<(), VmFault> {
        if handler.entry >= unit.bytecode.len() {
            return Err(VmFault::IpOutOfBounds(handler.entry));
        }
        state.operands.clear();
        for arg in &event.args {
            self.push(state, arg.clone())?;
        }
        state.ip = handler.entry;
        state.running_event = Some(event);
        state.run_state = RunState::Running;
        Ok(())
    }
}
