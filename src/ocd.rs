// Copyright 2023 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Xtensa OCD state machine and instruction injection.
//!
//! `Ocd` drives any `DebugRegisterProtocol` through the normal, halted and
//! running states, and executes instructions on the halted core. Values move
//! between host and core through DDR, and memory and register access are
//! built from the canned programs in `program`.

use std::fmt;
use std::time::{Duration, Instant};

use crate::program::{self, Program, RFDO0, RFDO1};
use crate::protocol::{DebugRegisterProtocol, Error as ProtocolError, Status};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Timed out waiting for {operation} after {polls} polls.")]
    Timeout { operation: &'static str, polls: usize },
    #[error("Injected instruction 0x{opcode:06X} raised an exception.")]
    InjectedInstructionFault { opcode: u32 },
    #[error("Injected instruction 0x{opcode:06X} was written before the previous one completed.")]
    ExecutionOverrun { opcode: u32 },
    #[error("Fault from instruction 0x{opcode:06X} must be cleared before executing more.")]
    UnclearedFault { opcode: u32 },
    #[error("Fault flags ({status}) were already set before injecting 0x{opcode:06X}.")]
    StaleFault { opcode: u32, status: Status },
    #[error("Instructions can only be executed on a halted core, but it is {state}.")]
    NotHalted { state: OcdState },
    #[error("Program takes {expected} DDR inputs but {provided} were provided.")]
    ArityMismatch { expected: usize, provided: usize },
    #[error("Address 0x{address:08X} is not aligned for a {width} access.")]
    Misaligned { address: u32, width: Width },
    #[error("Value 0x{value:X} does not fit in a {width} access.")]
    ValueTooWide { value: u32, width: Width },
    #[error("Reading {count} words from 0x{address:08X} runs past the end of memory.")]
    AddressOverflow { address: u32, count: usize },
    #[error("Protocol error")]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether the core reported an execution fault that `clear_faults` resets.
    pub fn is_fault(&self) -> bool {
        matches!(self, Error::InjectedInstructionFault { .. } | Error::ExecutionOverrun { .. }
                     | Error::StaleFault { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Number of words read by one block read.
pub const BLOCK_WORDS: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OcdState {
    /// OCD disabled, core running normally.
    Normal,
    /// Core stopped in OCD mode, accepting injected instructions.
    Halted,
    /// OCD enabled, core running.
    Running,
}

impl fmt::Display for OcdState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OcdState::Normal => write!(f, "normal"),
            OcdState::Halted => write!(f, "halted"),
            OcdState::Running => write!(f, "running"),
        }
    }
}

/// Bounds on every status polling loop.
///
/// A poll gives up when either limit is reached first.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PollConfig {
    pub max_polls: usize,
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig { max_polls: 1000, timeout: Duration::from_secs(1) }
    }
}

/// Size of a memory access.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Width {
    U8,
    U16,
    U32,
}

impl Width {
    pub fn bytes(&self) -> u32 {
        match self {
            Width::U8 => 1,
            Width::U16 => 2,
            Width::U32 => 4,
        }
    }

    pub fn mask(&self) -> u32 {
        match self {
            Width::U8 => 0xFF,
            Width::U16 => 0xFFFF,
            Width::U32 => 0xFFFF_FFFF,
        }
    }

    fn read_program(&self) -> Program {
        match self {
            Width::U8 => program::RD8,
            Width::U16 => program::RD16,
            Width::U32 => program::RD32,
        }
    }

    fn write_program(&self) -> Program {
        match self {
            Width::U8 => program::WR8,
            Width::U16 => program::WR16,
            Width::U32 => program::WR32,
        }
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", self.bytes() * 8)
    }
}

/// On-chip debug session for one core.
pub struct Ocd<P> {
    protocol: P,
    state: OcdState,
    poll: PollConfig,
    pending_fault: Option<u32>,
}

impl<P: DebugRegisterProtocol> Ocd<P> {
    /// Start a debug session, enabling OCD and reading whether the core
    /// is already halted.
    pub fn new(protocol: P, poll: PollConfig) -> Result<Self> {
        let mut ocd = Ocd { protocol, state: OcdState::Normal, poll, pending_fault: None };
        ocd.sync_state()?;
        Ok(ocd)
    }

    /// Re-read the state from hardware.
    pub fn sync_state(&mut self) -> Result<OcdState> {
        self.protocol.enable_ocd()?;
        let status = self.protocol.status()?;
        self.state = if status.in_debug_mode() { OcdState::Halted } else { OcdState::Running };
        log::debug!("OCD state is {} ({})", self.state, status);
        Ok(self.state)
    }

    pub fn state(&self) -> OcdState {
        self.state
    }

    pub fn protocol(&mut self) -> &mut P {
        &mut self.protocol
    }

    pub fn into_inner(self) -> P {
        self.protocol
    }

    /// Read the current status flags.
    pub fn status(&mut self) -> Result<Status> {
        Ok(self.protocol.status()?)
    }

    /// Move to `new_state`, performing the hardware actions for the transition.
    ///
    /// The recorded state only changes if every action succeeds.
    pub fn enter_state(&mut self, new_state: OcdState) -> Result<()> {
        use OcdState::*;
        if self.state == new_state {
            return Ok(());
        }
        log::debug!("OCD transition {} -> {}", self.state, new_state);
        match (self.state, new_state) {
            (Normal, Running) => self.protocol.enable_ocd()?,
            (Normal, Halted) => {
                self.protocol.enable_ocd()?;
                self.break_in()?;
            },
            (Running, Normal) => {
                self.break_in()?;
                self.inject(RFDO0)?;
            },
            (Running, Halted) => self.break_in()?,
            (Halted, Running) => self.inject(RFDO1)?,
            (Halted, Normal) => self.inject(RFDO0)?,
            (Normal, Normal) | (Halted, Halted) | (Running, Running) => (),
        }
        self.state = new_state;
        Ok(())
    }

    pub fn halt(&mut self) -> Result<()> {
        self.enter_state(OcdState::Halted)
    }

    pub fn run(&mut self) -> Result<()> {
        self.enter_state(OcdState::Running)
    }

    /// Resume the core and leave OCD mode.
    pub fn release(&mut self) -> Result<()> {
        self.enter_state(OcdState::Normal)
    }

    /// Assert a debug interrupt and wait for the core to stop.
    fn break_in(&mut self) -> Result<()> {
        self.protocol.debug_interrupt()?;
        self.poll("debug mode", |status| Ok(status.in_debug_mode()))?;
        Ok(())
    }

    /// Read status until `done` returns true or errors, within the poll bounds.
    fn poll<F>(&mut self, operation: &'static str, mut done: F) -> Result<Status>
        where F: FnMut(Status) -> Result<bool>
    {
        let start = Instant::now();
        let mut polls = 0;
        while polls < self.poll.max_polls {
            polls += 1;
            let status = self.protocol.status()?;
            if done(status)? {
                return Ok(status);
            }
            if start.elapsed() >= self.poll.timeout {
                break;
            }
        }
        log::warn!("Gave up waiting for {} after {} polls", operation, polls);
        Err(Error::Timeout { operation, polls })
    }

    fn require_halted(&self) -> Result<()> {
        match self.state {
            OcdState::Halted => Ok(()),
            state => Err(Error::NotHalted { state }),
        }
    }

    fn require_no_fault(&self) -> Result<()> {
        match self.pending_fault {
            Some(opcode) => Err(Error::UnclearedFault { opcode }),
            None => Ok(()),
        }
    }

    /// Execute one instruction without checking the recorded state.
    fn inject(&mut self, opcode: u32) -> Result<()> {
        self.require_no_fault()?;
        log::trace!("Executing 0x{:06X}", opcode);
        let status = self.protocol.clear_status(Status::NEXT_INSTRUCTION_READY)?;
        if status.exception() || status.overrun() {
            log::warn!("Fault flags set before executing 0x{:06X}: {}", opcode, status);
            return Err(Error::StaleFault { opcode, status });
        }
        self.protocol.write_instruction(opcode)?;
        let result = self.poll("instruction execution", |status| {
            if status.exception() {
                Err(Error::InjectedInstructionFault { opcode })
            } else if status.overrun() {
                Err(Error::ExecutionOverrun { opcode })
            } else {
                Ok(status.next_instruction_ready() && !status.busy())
            }
        });
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                if let Error::InjectedInstructionFault { .. } | Error::ExecutionOverrun { .. } = e {
                    log::warn!("{}", e);
                    self.pending_fault = Some(opcode);
                }
                Err(e)
            },
        }
    }

    /// Execute a single instruction on the halted core.
    pub fn execute_opcode(&mut self, opcode: u32) -> Result<()> {
        self.require_halted()?;
        self.require_no_fault()?;
        self.inject(opcode)
    }

    /// Execute `opcodes` on the halted core.
    ///
    /// Before each instruction that reads DDR the next value from `inputs` is
    /// written to DDR, and after each instruction that writes DDR it is read
    /// and appended to the returned outputs. `inputs` must hold exactly one
    /// value per DDR-reading instruction.
    pub fn execute(&mut self, opcodes: &[u32], inputs: &[u32]) -> Result<Vec<u32>> {
        self.require_halted()?;
        self.require_no_fault()?;
        let arity = program::arity(opcodes);
        if inputs.len() != arity.inputs {
            return Err(Error::ArityMismatch { expected: arity.inputs, provided: inputs.len() });
        }
        let mut inputs = inputs.iter();
        let mut outputs = Vec::with_capacity(arity.outputs);
        for &opcode in opcodes {
            let role = program::classify(opcode).map(|p| p.role);
            if role.map_or(false, |r| r.takes_input()) {
                match inputs.next() {
                    Some(&value) => self.protocol.write_ddr(value)?,
                    None => return Err(Error::ArityMismatch {
                        expected: arity.inputs, provided: 0
                    }),
                }
            }
            self.inject(opcode)?;
            if role.map_or(false, |r| r.produces_output()) {
                outputs.push(self.protocol.read_ddr()?);
            }
        }
        Ok(outputs)
    }

    /// Execute a canned program.
    pub fn run_program(&mut self, program: &Program, inputs: &[u32]) -> Result<Vec<u32>> {
        log::debug!("Running {} with inputs {:X?}", program.name, inputs);
        self.execute(program.opcodes, inputs)
    }

    /// Clear the exception, overrun and done flags after a fault.
    pub fn clear_faults(&mut self) -> Result<()> {
        log::debug!("Clearing execution fault flags");
        let flags = Status::NEXT_INSTRUCTION_READY | Status::EXEC_EXCEPTION | Status::EXEC_OVERRUN;
        self.protocol.clear_status(flags)?;
        self.pending_fault = None;
        Ok(())
    }

    /// Read a0 and a1, which memory access programs overwrite.
    pub fn save_scratch(&mut self) -> Result<[u32; 2]> {
        let saved = self.run_program(&program::SAVE_REGS, &[])?;
        Ok([saved[0], saved[1]])
    }

    pub fn restore_scratch(&mut self, saved: [u32; 2]) -> Result<()> {
        self.run_program(&program::RESTORE_REGS, &saved)?;
        Ok(())
    }

    /// Run `f` with a0 and a1 saved beforehand and restored afterwards.
    ///
    /// An instruction fault inside `f` is cleared so the registers can be
    /// restored, then returned. A timeout is returned without restoring.
    /// Errors from `f` take precedence over errors while restoring.
    fn with_scratch<T, F>(&mut self, f: F) -> Result<T>
        where F: FnOnce(&mut Self) -> Result<T>
    {
        let saved = self.save_scratch()?;
        let err = match f(self) {
            Ok(value) => {
                self.restore_scratch(saved)?;
                return Ok(value);
            },
            Err(e @ Error::Timeout { .. }) => return Err(e),
            Err(e) => e,
        };
        let restored = if err.is_fault() || self.pending_fault.is_some() {
            log::warn!("Clearing fault to restore a0 and a1");
            self.clear_faults().and_then(|()| self.restore_scratch(saved))
        } else {
            self.restore_scratch(saved)
        };
        if let Err(restore_err) = restored {
            log::error!("Could not restore a0 and a1 after error ({}): {}", err, restore_err);
        }
        Err(err)
    }

    fn check_alignment(&self, address: u32, width: Width) -> Result<()> {
        if address % width.bytes() == 0 {
            Ok(())
        } else {
            Err(Error::Misaligned { address, width })
        }
    }

    /// Read one aligned value from target memory.
    pub fn read_memory(&mut self, address: u32, width: Width) -> Result<u32> {
        self.require_halted()?;
        self.check_alignment(address, width)?;
        let program = width.read_program();
        let value = self.with_scratch(|ocd| ocd.run_program(&program, &[address]))?;
        Ok(value[0] & width.mask())
    }

    /// Write one aligned value to target memory.
    pub fn write_memory(&mut self, address: u32, width: Width, value: u32) -> Result<()> {
        self.require_halted()?;
        self.check_alignment(address, width)?;
        if value & !width.mask() != 0 {
            return Err(Error::ValueTooWide { value, width });
        }
        let program = width.write_program();
        self.with_scratch(|ocd| ocd.run_program(&program, &[address, value]))?;
        Ok(())
    }

    /// Read `BLOCK_WORDS` consecutive words starting at a word-aligned address.
    pub fn read_block(&mut self, address: u32) -> Result<Vec<u32>> {
        self.require_halted()?;
        self.check_alignment(address, Width::U32)?;
        self.with_scratch(|ocd| ocd.run_program(&program::RD32_X16, &[address]))
    }

    /// Read `count` words starting at a word-aligned address.
    pub fn read_words(&mut self, address: u32, count: usize) -> Result<Vec<u32>> {
        self.read_words_cb(address, count, |_| {})
    }

    /// Read `count` words starting at a word-aligned address.
    ///
    /// The callback is called with the number of words read so far after
    /// each block.
    pub fn read_words_cb<F: Fn(usize)>(&mut self, address: u32, count: usize, cb: F)
        -> Result<Vec<u32>>
    {
        self.require_halted()?;
        self.check_alignment(address, Width::U32)?;
        let end = (count as u64).checked_mul(4).and_then(|n| n.checked_add(address as u64));
        if end.map_or(true, |end| end > 1 << 32) {
            return Err(Error::AddressOverflow { address, count });
        }
        self.with_scratch(|ocd| {
            let mut words = Vec::with_capacity(count);
            cb(0);
            while words.len() < count {
                let addr = address + 4 * words.len() as u32;
                if count - words.len() >= BLOCK_WORDS {
                    words.extend(ocd.run_program(&program::RD32_X16, &[addr])?);
                } else {
                    words.extend(ocd.run_program(&program::RD32, &[addr])?);
                }
                cb(words.len());
            }
            Ok(words)
        })
    }

    /// Read address registers a0 to a15.
    pub fn read_registers(&mut self) -> Result<Vec<u32>> {
        self.run_program(&program::RD_REGS, &[])
    }
}
