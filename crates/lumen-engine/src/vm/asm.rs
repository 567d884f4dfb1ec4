//! Assembler for the line-oriented script source format
//!
//! ```text
//! # comment
//! @init
//!     say booting
//! @state default
//! @on state_entry
//!     timer 1000
//! @on timer
//!     say tick
//!     state idle
//! @state idle
//! ```
//!
//! The `@init` block is placed at offset 0 so a fresh instance runs it before
//! anything else. Every block gets an implicit `end`.

use lumen_events::{AssetId, EventKind};
use std::collections::HashMap;

use super::interp::{op, INSTRUCTION_LEN};
use crate::error::CompileError;
use crate::host::Compiler;
use crate::unit::{CompiledUnit, EventHandler, StateDef};

#[derive(Debug, Clone, Copy, Default)]
pub struct Assembler;

struct Line<'a> {
    number: usize,
    text: &'a str,
}

struct Handler<'a> {
    kind: EventKind,
    body: Vec<Line<'a>>,
}

struct State<'a> {
    name: &'a str,
    handlers: Vec<Handler<'a>>,
}

enum Section {
    None,
    Init,
    StateHeader,
    Handler,
}

fn syntax(number: usize, message: impl Into<String>) -> CompileError {
    CompileError::Syntax {
        line: number,
        message: message.into(),
    }
}

fn parse_sections(source: &str) -> Result<(Vec<Line<'_>>, Vec<State<'_>>), CompileError> {
    let mut init = Vec::new();
    let mut states: Vec<State> = Vec::new();
    let mut section = Section::None;

    for (index, raw) in source.lines().enumerate() {
        let number = index + 1;
        let text = raw.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }

        if let Some(directive) = text.strip_prefix('@') {
            let (keyword, arg) = split_word(directive);
            match keyword {
                "init" => section = Section::Init,
                "state" => {
                    if arg.is_empty() {
                        return Err(syntax(number, "@state needs a name"));
                    }
                    if states.iter().any(|s| s.name == arg) {
                        return Err(syntax(number, format!("state '{}' defined twice", arg)));
                    }
                    states.push(State {
                        name: arg,
                        handlers: Vec::new(),
                    });
                    section = Section::StateHeader;
                }
                "on" => {
                    let kind: EventKind = arg.parse().map_err(|e: String| syntax(number, e))?;
                    let state = states
                        .last_mut()
                        .ok_or_else(|| syntax(number, "@on outside of a state"))?;
                    if state.handlers.iter().any(|h| h.kind == kind) {
                        return Err(syntax(number, format!("duplicate handler for {}", kind)));
                    }
                    state.handlers.push(Handler {
                        kind,
                        body: Vec::new(),
                    });
                    section = Section::Handler;
                }
                other => return Err(syntax(number, format!("unknown directive @{}", other))),
            }
            continue;
        }

        let line = Line { number, text };
        match section {
            Section::Init => init.push(line),
            Section::Handler => {
                if let Some(handler) = states.last_mut().and_then(|s| s.handlers.last_mut()) {
                    handler.body.push(line);
                }
            }
            Section::None | Section::StateHeader => {
                return Err(syntax(number, "instruction outside of @init or @on"));
            }
        }
    }

    Ok((init, states))
}

fn split_word(text: &str) -> (&str, &str) {
    match text.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (text, ""),
    }
}

fn parse_number(number: usize, text: &str) -> Result<i64, CompileError> {
    text.parse::<i64>()
        .map_err(|_| syntax(number, format!("expected a number, found '{}'", text)))
}

fn parse_u32(number: usize, text: &str) -> Result<u64, CompileError> {
    let value = parse_number(number, text)?;
    u32::try_from(value)
        .map(u64::from)
        .map_err(|_| syntax(number, format!("{} is out of range", value)))
}

fn parse_i32(number: usize, text: &str) -> Result<u64, CompileError> {
    let value = parse_number(number, text)?;
    i32::try_from(value)
        .map(|v| u64::from(v as u32))
        .map_err(|_| syntax(number, format!("{} is out of range", value)))
}

struct Emitter<'a> {
    bytecode: Vec<u8>,
    constants: Vec<String>,
    labels: HashMap<&'a str, usize>,
    fixups: Vec<(usize, &'a str, usize)>,
    state_names: Vec<&'a str>,
}

impl<'a> Emitter<'a> {
    fn emit(&mut self, opcode: u8, operand: u64) {
        self.bytecode.push(opcode);
        self.bytecode.extend_from_slice(&operand.to_le_bytes());
    }

    fn intern(&mut self, text: &str) -> u64 {
        let index = match self.constants.iter().position(|c| c == text) {
            Some(index) => index,
            None => {
                self.constants.push(text.to_string());
                self.constants.len() - 1
            }
        };
        index as u64
    }

    fn block(&mut self, lines: &[Line<'a>]) -> Result<(), CompileError> {
        for line in lines {
            self.instruction(line)?;
        }
        self.emit(op::END, 0);
        Ok(())
    }

    fn instruction(&mut self, line: &Line<'a>) -> Result<(), CompileError> {
        let n = line.number;
        if let Some(label) = line.text.strip_prefix(':') {
            if self.labels.insert(label.trim(), self.bytecode.len()).is_some() {
                return Err(syntax(n, format!("label '{}' defined twice", label)));
            }
            return Ok(());
        }

        let (mnemonic, arg) = split_word(line.text);
        let needs_arg = || {
            if arg.is_empty() {
                Err(syntax(n, format!("{} needs an operand", mnemonic)))
            } else {
                Ok(arg)
            }
        };

        match mnemonic {
            "nop" => self.emit(op::NOP, 0),
            "end" => self.emit(op::END, 0),
            "reset" => self.emit(op::RESET, 0),
            "pop" => self.emit(op::POP, 0),
            "sleep" => self.emit(op::SLEEP, parse_u32(n, needs_arg()?)?),
            "timer" => self.emit(op::TIMER, parse_u32(n, needs_arg()?)?),
            "push" => self.emit(op::PUSH, parse_i32(n, needs_arg()?)?),
            "listen" => self.emit(op::LISTEN, parse_i32(n, needs_arg()?)?),
            "call" => {
                let (work, delay) = split_word(needs_arg()?);
                let work = parse_u32(n, work)?;
                let delay = if delay.is_empty() {
                    0
                } else {
                    parse_u32(n, delay)?
                };
                self.emit(op::CALL, work | (delay << 32));
            }
            "state" => {
                let name = needs_arg()?;
                let index = self
                    .state_names
                    .iter()
                    .position(|s| *s == name)
                    .ok_or_else(|| syntax(n, format!("unknown state '{}'", name)))?;
                self.emit(op::STATE, index as u64);
            }
            "say" => {
                let index = self.intern(needs_arg()?);
                self.emit(op::SAY, index);
            }
            "fault" => {
                let index = self.intern(needs_arg()?);
                self.emit(op::FAULT, index);
            }
            "jmp" => {
                let label = needs_arg()?;
                self.fixups.push((self.bytecode.len() + 1, label, n));
                self.emit(op::JMP, 0);
            }
            other => return Err(syntax(n, format!("unknown instruction '{}'", other))),
        }
        Ok(())
    }

    fn resolve_fixups(&mut self) -> Result<(), CompileError> {
        for (offset, label, n) in std::mem::take(&mut self.fixups) {
            let target = *self
                .labels
                .get(label)
                .ok_or_else(|| syntax(n, format!("unknown label '{}'", label)))?;
            self.bytecode[offset..offset + 8].copy_from_slice(&(target as u64).to_le_bytes());
        }
        Ok(())
    }
}

impl Assembler {
    pub fn assemble(&self, asset_id: AssetId, source: &str) -> Result<CompiledUnit, CompileError> {
        let (init, states) = parse_sections(source)?;
        if states.is_empty() {
            return Err(CompileError::NoStates);
        }

        let mut emitter = Emitter {
            bytecode: Vec::new(),
            constants: Vec::new(),
            labels: HashMap::new(),
            fixups: Vec::new(),
            state_names: states.iter().map(|s| s.name).collect(),
        };

        emitter.block(&init)?;

        let mut defs = Vec::with_capacity(states.len());
        for state in &states {
            let mut handlers = Vec::with_capacity(state.handlers.len());
            for handler in &state.handlers {
                let entry = emitter.bytecode.len();
                emitter.block(&handler.body)?;
                handlers.push(EventHandler {
                    kind: handler.kind,
                    entry,
                });
            }
            defs.push(StateDef {
                name: state.name.to_string(),
                handlers,
            });
        }
        emitter.resolve_fixups()?;
        debug_assert_eq!(emitter.bytecode.len() % INSTRUCTION_LEN, 0);

        Ok(CompiledUnit {
            asset_id,
            bytecode: emitter.bytecode,
            constants: emitter.constants,
            states: defs,
        })
    }
}

impl Compiler for Assembler {
    fn compile(&self, asset_id: AssetId, source: &[u8]) -> Result<CompiledUnit, CompileError> {
        let source = std::str::from_utf8(source).map_err(|_| CompileError::InvalidEncoding)?;
        self.assemble(asset_id, source)
    }
}
