// Copyright 2023 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Access to the on-chip debug registers of an Xtensa core.
//!
//! Two register interfaces exist in silicon. The `direct` variant selects
//! each debug register with its own TAP instruction. The `routed` variant
//! selects a single Nexus address/data window and addresses registers
//! through it. Both implement `DebugRegisterProtocol`, which is all the
//! `ocd` engine needs.

use std::fmt;
use std::ops::{BitAnd, BitOr};

use crate::bitvec::{BitVec, Error as BitVecError};
use crate::chain::{ChainDevice, Error as ChainError};
use crate::driver::ScanDriver;

pub mod direct;
pub mod routed;

pub use direct::Direct;
pub use routed::Routed;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Data register accessed before any instruction was selected.")]
    NoInstructionSelected,
    #[error("No debug register named {0}.")]
    UnknownRegister(String),
    #[error("Debug register {0} is read-only.")]
    ReadOnlyRegister(&'static str),
    #[error("Debug register {0} is write-only.")]
    WriteOnlyRegister(&'static str),
    #[error("Debug register 0x{address:02X} was busy.")]
    RegisterBusy { address: u8 },
    #[error("Debug register 0x{address:02X} access reported an error.")]
    RegisterError { address: u8 },
    #[error("Debug register 0x{address:02X} access returned unexpected status {status:02b}.")]
    UnexpectedRegisterStatus { address: u8, status: u8 },
    #[error("SRselect must be between 0 and 3, not {0}.")]
    InvalidSrSelect(u8),
    #[error("Chain error")]
    Chain(#[from] ChainError),
    #[error("Bit vector error")]
    BitVec(#[from] BitVecError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Debug status flags, read fresh from hardware on every call.
///
/// Both register variants are mapped onto this layout, which follows the
/// Xtensa debug status register.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Status(pub u32);

impl Status {
    /// The last injected instruction completed and another may be written.
    pub const NEXT_INSTRUCTION_READY: Status = Status(1 << 0);
    /// The last injected instruction raised an exception.
    pub const EXEC_EXCEPTION: Status = Status(1 << 1);
    /// An injected instruction is still executing.
    pub const EXEC_BUSY: Status = Status(1 << 2);
    /// An instruction was written while the previous one was still executing.
    pub const EXEC_OVERRUN: Status = Status(1 << 3);
    /// The core is stopped in OCD mode.
    pub const IN_DEBUG_MODE: Status = Status(1 << 4);
    /// The core has written the debug data register since it was last read.
    pub const DDR_READY: Status = Status(1 << 10);
    /// The debug module is powered.
    pub const DEBUG_POWERED: Status = Status(1 << 31);

    /// Flags describing the outcome of instruction execution.
    pub const EXEC_FLAGS: Status = Status(0b1111);

    pub fn empty() -> Self {
        Status(0)
    }

    pub fn contains(&self, flags: Status) -> bool {
        self.0 & flags.0 == flags.0
    }

    pub fn intersects(&self, flags: Status) -> bool {
        self.0 & flags.0 != 0
    }

    pub fn next_instruction_ready(&self) -> bool {
        self.contains(Self::NEXT_INSTRUCTION_READY)
    }

    pub fn exception(&self) -> bool {
        self.contains(Self::EXEC_EXCEPTION)
    }

    pub fn busy(&self) -> bool {
        self.contains(Self::EXEC_BUSY)
    }

    pub fn overrun(&self) -> bool {
        self.contains(Self::EXEC_OVERRUN)
    }

    pub fn in_debug_mode(&self) -> bool {
        self.contains(Self::IN_DEBUG_MODE)
    }
}

impl BitOr for Status {
    type Output = Status;
    fn bitor(self, rhs: Status) -> Status {
        Status(self.0 | rhs.0)
    }
}

impl BitAnd for Status {
    type Output = Status;
    fn bitand(self, rhs: Status) -> Status {
        Status(self.0 & rhs.0)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::NEXT_INSTRUCTION_READY, "NextInstructionReady"),
            (Self::EXEC_EXCEPTION, "ExecException"),
            (Self::EXEC_BUSY, "ExecBusy"),
            (Self::EXEC_OVERRUN, "ExecOverrun"),
            (Self::IN_DEBUG_MODE, "InDebugMode"),
            (Self::DDR_READY, "DDRReady"),
            (Self::DEBUG_POWERED, "DebugPowered"),
        ];
        let set: Vec<&str> = names.iter()
                                  .filter(|(flag, _)| self.contains(*flag))
                                  .map(|(_, name)| *name)
                                  .collect();
        if set.is_empty() {
            write!(f, "no flags")
        } else {
            write!(f, "{}", set.join(", "))
        }
    }
}

/// Which directions a debug register may be accessed in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    pub fn readable(&self) -> bool {
        !matches!(self, Access::WriteOnly)
    }

    pub fn writable(&self) -> bool {
        !matches!(self, Access::ReadOnly)
    }
}

/// One named debug register.
///
/// `address` is the TAP instruction for the direct variant and the Nexus
/// register address for the routed variant.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RegisterDescriptor {
    pub name: &'static str,
    pub address: u8,
    pub width: usize,
    pub access: Access,
    pub description: &'static str,
}

/// Lookup table from debug register name to descriptor.
#[derive(Copy, Clone, Debug)]
pub struct RegisterMap {
    registers: &'static [RegisterDescriptor],
}

impl RegisterMap {
    pub const fn new(registers: &'static [RegisterDescriptor]) -> Self {
        RegisterMap { registers }
    }

    /// Find a register by name, ignoring case.
    pub fn get(&self, name: &str) -> Result<&'static RegisterDescriptor> {
        self.registers.iter()
                      .find(|r| r.name.eq_ignore_ascii_case(name))
                      .ok_or_else(|| Error::UnknownRegister(name.to_string()))
    }

    pub fn by_address(&self, address: u8) -> Option<&'static RegisterDescriptor> {
        self.registers.iter().find(|r| r.address == address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static RegisterDescriptor> {
        self.registers.iter()
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }
}

/// Register-level access to an Xtensa debug module.
///
/// The low-level methods select TAP instructions and scan data registers.
/// The OCD methods are what instruction injection is built from, and each
/// variant maps them onto its own registers.
pub trait DebugRegisterProtocol {
    /// TAP instructions understood by this variant.
    type Instruction: Copy + fmt::Debug;

    /// Scan `instruction` into the IR. Always performs the scan.
    fn select_instruction(&mut self, instruction: Self::Instruction) -> Result<()>;

    /// Read `width` bits from the currently selected data register.
    fn read_data(&mut self, width: usize) -> Result<u32>;

    /// Write `width` bits to the currently selected data register.
    fn write_data(&mut self, width: usize, value: u32) -> Result<()>;

    /// Write `width` bits to the currently selected data register,
    /// returning the value captured from it.
    fn read_modify_write_data(&mut self, width: usize, value: u32) -> Result<u32>;

    /// Table of named registers for this variant.
    fn register_map(&self) -> &RegisterMap;

    /// Read the register described by `register`.
    fn read_register(&mut self, register: &RegisterDescriptor) -> Result<u32>;

    /// Write the register described by `register`.
    fn write_register(&mut self, register: &RegisterDescriptor, value: u32) -> Result<()>;

    /// Read a debug register by name.
    fn read_named(&mut self, name: &str) -> Result<u32> {
        let register = self.register_map().get(name)?;
        if !register.access.readable() {
            return Err(Error::WriteOnlyRegister(register.name));
        }
        let value = self.read_register(register)?;
        log::debug!("Read {} = 0x{:08X}", register.name, value);
        Ok(value)
    }

    /// Write a debug register by name.
    fn write_named(&mut self, name: &str, value: u32) -> Result<()> {
        let register = self.register_map().get(name)?;
        if !register.access.writable() {
            return Err(Error::ReadOnlyRegister(register.name));
        }
        log::debug!("Write {} = 0x{:08X}", register.name, value);
        self.write_register(register, value)
    }

    /// Enable the on-chip debug module.
    fn enable_ocd(&mut self) -> Result<()>;

    /// Request the core break into OCD mode.
    fn debug_interrupt(&mut self) -> Result<()>;

    /// Read the current status flags.
    fn status(&mut self) -> Result<Status>;

    /// Clear the given status flags, returning the status seen just before.
    ///
    /// Variants whose flags clear on read may clear more than `flags`, so the
    /// returned status is the only record of what was set.
    fn clear_status(&mut self, flags: Status) -> Result<Status>;

    /// Write an instruction word to be executed by the halted core.
    fn write_instruction(&mut self, opcode: u32) -> Result<()>;

    /// Read the debug data register.
    fn read_ddr(&mut self) -> Result<u32>;

    /// Write the debug data register.
    fn write_ddr(&mut self, value: u32) -> Result<()>;
}

impl<P: DebugRegisterProtocol + ?Sized> DebugRegisterProtocol for Box<P> {
    type Instruction = P::Instruction;

    fn select_instruction(&mut self, instruction: Self::Instruction) -> Result<()> {
        (**self).select_instruction(instruction)
    }

    fn read_data(&mut self, width: usize) -> Result<u32> {
        (**self).read_data(width)
    }

    fn write_data(&mut self, width: usize, value: u32) -> Result<()> {
        (**self).write_data(width, value)
    }

    fn read_modify_write_data(&mut self, width: usize, value: u32) -> Result<u32> {
        (**self).read_modify_write_data(width, value)
    }

    fn register_map(&self) -> &RegisterMap {
        (**self).register_map()
    }

    fn read_register(&mut self, register: &RegisterDescriptor) -> Result<u32> {
        (**self).read_register(register)
    }

    fn write_register(&mut self, register: &RegisterDescriptor, value: u32) -> Result<()> {
        (**self).write_register(register, value)
    }

    fn enable_ocd(&mut self) -> Result<()> {
        (**self).enable_ocd()
    }

    fn debug_interrupt(&mut self) -> Result<()> {
        (**self).debug_interrupt()
    }

    fn status(&mut self) -> Result<Status> {
        (**self).status()
    }

    fn clear_status(&mut self, flags: Status) -> Result<Status> {
        (**self).clear_status(flags)
    }

    fn write_instruction(&mut self, opcode: u32) -> Result<()> {
        (**self).write_instruction(opcode)
    }

    fn read_ddr(&mut self) -> Result<u32> {
        (**self).read_ddr()
    }

    fn write_ddr(&mut self, value: u32) -> Result<()> {
        (**self).write_ddr(value)
    }
}

/// IR select followed by DR access on one chain device.
///
/// Shared by both register variants. Every select performs an IR scan, and
/// data register accesses are refused until something has been selected.
pub struct RegisterAccess<D> {
    device: ChainDevice<D>,
    selected: Option<u32>,
}

impl<D: ScanDriver> RegisterAccess<D> {
    pub fn new(device: ChainDevice<D>) -> Self {
        RegisterAccess { device, selected: None }
    }

    pub fn device(&self) -> &ChainDevice<D> {
        &self.device
    }

    /// Most recently selected instruction, if any.
    pub fn selected(&self) -> Option<u32> {
        self.selected
    }

    pub fn select(&mut self, instruction: u32) -> Result<()> {
        let ir_len = self.device.topology().ir_len();
        let bits = BitVec::from_word(ir_len, instruction as u64)?;
        self.device.write_ir(&bits)?;
        self.selected = Some(instruction);
        Ok(())
    }

    pub fn read_modify_write(&mut self, width: usize, value: u32) -> Result<u32> {
        let instruction = self.selected.ok_or(Error::NoInstructionSelected)?;
        let tdi = BitVec::from_word(width, value as u64)?;
        let tdo = self.device.read_write_dr(&tdi)?;
        let old = tdo.to_word()? as u32;
        log::trace!("IR 0x{:02X} DR[{}]: wrote 0x{:X} read 0x{:X}", instruction, width, value, old);
        Ok(old)
    }

    pub fn read(&mut self, width: usize) -> Result<u32> {
        self.read_modify_write(width, 0)
    }

    pub fn write(&mut self, width: usize, value: u32) -> Result<()> {
        self.read_modify_write(width, value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use crate::chain::ChainConfig;
    use crate::sim::{Register, RegisterTap, SimChain};

    #[test]
    fn test_status_flags() {
        let status = Status::NEXT_INSTRUCTION_READY | Status::IN_DEBUG_MODE;
        assert!(status.next_instruction_ready());
        assert!(status.in_debug_mode());
        assert!(!status.exception());
        assert!(status.intersects(Status::EXEC_FLAGS));
        assert_eq!(status.to_string(), "NextInstructionReady, InDebugMode");
        assert_eq!(Status::empty().to_string(), "no flags");
    }

    #[test]
    fn test_register_map_lookup() {
        static REGS: [RegisterDescriptor; 1] = [RegisterDescriptor {
            name: "DDR", address: 0x17, width: 32, access: Access::ReadWrite, description: "",
        }];
        let map = RegisterMap::new(&REGS);
        assert_eq!(map.get("ddr").unwrap().address, 0x17);
        assert!(matches!(map.get("nope"), Err(Error::UnknownRegister(ref n)) if n == "nope"));
    }

    #[test]
    fn test_register_access_requires_select() {
        let tap = RegisterTap::new(5, Some(0x1234_5679)).register(0x17, 32, 0xCAFE);
        let sim = Rc::new(RefCell::new(SimChain::new(vec![Box::new(tap)])));
        let dev = ChainDevice::new(sim.clone(), 0, &[5], 0x1234_5679, &ChainConfig::default())
            .unwrap();
        let mut access = RegisterAccess::new(dev);
        assert!(matches!(access.read(32), Err(Error::NoInstructionSelected)));

        sim.borrow_mut().clear_log();
        access.select(0x17).unwrap();
        assert_eq!(access.read_modify_write(32, 0xBEEF).unwrap(), 0xCAFE);
        assert_eq!(access.read(32).unwrap(), 0xBEEF);
        let registers: Vec<Register> = sim.borrow().scans().iter().map(|s| s.register).collect();
        assert_eq!(registers, vec![Register::Instruction, Register::Data, Register::Data]);
    }
}
