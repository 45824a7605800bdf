// Copyright 2023 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Debug registers selected directly by TAP instruction.
//!
//! Used by cores such as the LX106, where each debug register has its own
//! IR opcode and is then scanned as the data register.

use std::fmt;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::driver::ScanDriver;
use crate::chain::ChainDevice;
use super::{Access, DebugRegisterProtocol, Error, RegisterAccess, RegisterDescriptor,
            RegisterMap, Result, Status};

pub const IR_LENGTH: usize = 5;
pub const DOSR_LENGTH: usize = 8;
pub const DCR_LENGTH: usize = 8;
pub const DIR_LENGTH: usize = 24;
pub const DDR_LENGTH: usize = 32;
pub const PWR_LENGTH: usize = 8;

#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Instruction {
    PowerControl = 0x08,
    PowerStatus = 0x09,
    EnableOCD = 0x11,
    DebugInt = 0x12,
    ExecuteDI = 0x15,
    LoadDI = 0x16,
    ScanDDR = 0x17,
    ReadDOSR = 0x18,
    ScanDCR = 0x19,
    LoadWDI = 0x1A,
    TRAX = 0x1C,
    Bypass = 0x1F,
}

static REGISTERS: [RegisterDescriptor; 6] = [
    RegisterDescriptor {
        name: "PWRCTL", address: 0x08, width: PWR_LENGTH, access: Access::ReadWrite,
        description: "Power control",
    },
    RegisterDescriptor {
        name: "PWRSTAT", address: 0x09, width: PWR_LENGTH, access: Access::ReadWrite,
        description: "Power status",
    },
    RegisterDescriptor {
        name: "DIR", address: 0x16, width: DIR_LENGTH, access: Access::WriteOnly,
        description: "Debug instruction register, executes on load",
    },
    RegisterDescriptor {
        name: "DDR", address: 0x17, width: DDR_LENGTH, access: Access::ReadWrite,
        description: "Debug data register",
    },
    RegisterDescriptor {
        name: "DOSR", address: 0x18, width: DOSR_LENGTH, access: Access::ReadOnly,
        description: "Debug output status register, some flags clear on read",
    },
    RegisterDescriptor {
        name: "DCR", address: 0x19, width: DCR_LENGTH, access: Access::ReadWrite,
        description: "Debug control register",
    },
];

pub static REGISTER_MAP: RegisterMap = RegisterMap::new(&REGISTERS);

/// Debug output status register.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Dosr(pub u8);

impl Dosr {
    /// Cleared on read.
    pub const NEXT_DI: u8 = 1 << 0;
    /// Cleared on read.
    pub const EXCEPTION: u8 = 1 << 1;
    pub const IN_OCD_MODE: u8 = 1 << 2;
    /// Cleared on read.
    pub const DOD_READY: u8 = 1 << 3;
    pub const MASK: u8 = 0b1111;
}

impl From<Dosr> for Status {
    fn from(dosr: Dosr) -> Status {
        let mut status = Status::empty();
        if dosr.0 & Dosr::NEXT_DI != 0 {
            status = status | Status::NEXT_INSTRUCTION_READY;
        }
        if dosr.0 & Dosr::EXCEPTION != 0 {
            status = status | Status::EXEC_EXCEPTION;
        }
        if dosr.0 & Dosr::IN_OCD_MODE != 0 {
            status = status | Status::IN_DEBUG_MODE;
        }
        if dosr.0 & Dosr::DOD_READY != 0 {
            status = status | Status::DDR_READY;
        }
        status
    }
}

impl fmt::Display for Dosr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut flags = Vec::new();
        if self.0 & Self::NEXT_DI != 0 {
            flags.push("NextDI");
        }
        if self.0 & Self::EXCEPTION != 0 {
            flags.push("Exception");
        }
        if self.0 & Self::IN_OCD_MODE != 0 {
            flags.push("InOCDMode");
        }
        if self.0 & Self::DOD_READY != 0 {
            flags.push("DODReady");
        }
        if flags.is_empty() {
            flags.push("no flags");
        }
        write!(f, "dosr: {}", flags.join(", "))
    }
}

/// Debug control register.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Dcr(pub u8);

impl Dcr {
    pub const EXT_DBG_INT_EN: u8 = 1 << 0;
    pub const XOCD_MODE_PULSE_EN: u8 = 1 << 1;
    pub const SR_SELECT_MASK: u8 = 0b11 << 2;
    pub const OCD_OVERRIDE: u8 = 1 << 4;
    pub const MASK: u8 = 0b1_1111;

    /// Which special register DDR is aliased to.
    pub fn sr_select(&self) -> u8 {
        (self.0 & Self::SR_SELECT_MASK) >> 2
    }

    pub fn with_sr_select(self, n: u8) -> Result<Dcr> {
        if n > 3 {
            return Err(Error::InvalidSrSelect(n));
        }
        Ok(Dcr((self.0 & !Self::SR_SELECT_MASK) | (n << 2)))
    }
}

impl fmt::Display for Dcr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut flags = Vec::new();
        if self.0 & Self::EXT_DBG_INT_EN != 0 {
            flags.push("extDbgIntEn".to_string());
        }
        if self.0 & Self::XOCD_MODE_PULSE_EN != 0 {
            flags.push("xOCDModePulseEn".to_string());
        }
        if self.0 & Self::OCD_OVERRIDE != 0 {
            flags.push("OCDOverride".to_string());
        }
        flags.push(format!("SRselect {}", self.sr_select()));
        write!(f, "dcr: {}", flags.join(", "))
    }
}

/// Direct-select debug register interface to one core.
pub struct Direct<D> {
    access: RegisterAccess<D>,
}

impl<D: ScanDriver> Direct<D> {
    pub fn new(device: ChainDevice<D>) -> Self {
        Direct { access: RegisterAccess::new(device) }
    }

    pub fn device(&self) -> &ChainDevice<D> {
        self.access.device()
    }

    fn read_reg(&mut self, instruction: Instruction, width: usize) -> Result<u32> {
        self.access.select(u8::from(instruction) as u32)?;
        self.access.read(width)
    }

    fn write_reg(&mut self, instruction: Instruction, width: usize, value: u32) -> Result<()> {
        self.access.select(u8::from(instruction) as u32)?;
        self.access.write(width, value)
    }

    /// Read the DOSR. This clears its clear-on-read flags.
    pub fn dosr(&mut self) -> Result<Dosr> {
        let dosr = Dosr(self.read_reg(Instruction::ReadDOSR, DOSR_LENGTH)? as u8);
        log::trace!("{}", dosr);
        Ok(dosr)
    }

    pub fn dcr(&mut self) -> Result<Dcr> {
        Ok(Dcr(self.read_reg(Instruction::ScanDCR, DCR_LENGTH)? as u8))
    }

    pub fn write_dcr(&mut self, dcr: Dcr) -> Result<()> {
        log::debug!("Writing {}", dcr);
        self.write_reg(Instruction::ScanDCR, DCR_LENGTH, dcr.0 as u32)
    }

    /// Set the SRselect field of the DCR, preserving its other bits.
    pub fn set_sr_select(&mut self, n: u8) -> Result<()> {
        let dcr = self.dcr()?.with_sr_select(n)?;
        self.write_dcr(dcr)
    }
}

impl<D: ScanDriver> DebugRegisterProtocol for Direct<D> {
    type Instruction = Instruction;

    fn select_instruction(&mut self, instruction: Instruction) -> Result<()> {
        self.access.select(u8::from(instruction) as u32)
    }

    fn read_data(&mut self, width: usize) -> Result<u32> {
        self.access.read(width)
    }

    fn write_data(&mut self, width: usize, value: u32) -> Result<()> {
        self.access.write(width, value)
    }

    fn read_modify_write_data(&mut self, width: usize, value: u32) -> Result<u32> {
        self.access.read_modify_write(width, value)
    }

    fn register_map(&self) -> &RegisterMap {
        &REGISTER_MAP
    }

    fn read_register(&mut self, register: &RegisterDescriptor) -> Result<u32> {
        self.access.select(register.address as u32)?;
        self.access.read(register.width)
    }

    fn write_register(&mut self, register: &RegisterDescriptor, value: u32) -> Result<()> {
        self.access.select(register.address as u32)?;
        self.access.write(register.width, value)
    }

    fn enable_ocd(&mut self) -> Result<()> {
        log::debug!("Enabling OCD");
        self.select_instruction(Instruction::EnableOCD)
    }

    fn debug_interrupt(&mut self) -> Result<()> {
        log::debug!("Asserting debug interrupt");
        self.select_instruction(Instruction::DebugInt)
    }

    fn status(&mut self) -> Result<Status> {
        Ok(self.dosr()?.into())
    }

    fn clear_status(&mut self, _flags: Status) -> Result<Status> {
        // Everything clearable in the DOSR is cleared by reading it.
        self.status()
    }

    fn write_instruction(&mut self, opcode: u32) -> Result<()> {
        self.write_reg(Instruction::LoadDI, DIR_LENGTH, opcode)
    }

    fn read_ddr(&mut self) -> Result<u32> {
        self.read_reg(Instruction::ScanDDR, DDR_LENGTH)
    }

    fn write_ddr(&mut self, value: u32) -> Result<()> {
        self.write_reg(Instruction::ScanDDR, DDR_LENGTH, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::convert::TryFrom;
    use std::rc::Rc;
    use crate::bitvec::BitVec;
    use crate::chain::ChainConfig;
    use crate::sim::{Register, RegisterTap, SimChain};

    const IDCODE: u32 = 0x1000_0001;

    fn direct(tap: RegisterTap) -> (Rc<RefCell<SimChain>>, Direct<SimChain>) {
        let sim = Rc::new(RefCell::new(SimChain::new(vec![Box::new(tap)])));
        let dev = ChainDevice::new(sim.clone(), 0, &[IR_LENGTH], IDCODE, &ChainConfig::default())
            .unwrap();
        sim.borrow_mut().clear_log();
        (sim, Direct::new(dev))
    }

    fn lx106() -> RegisterTap {
        RegisterTap::new(IR_LENGTH, Some(IDCODE))
            .read_only(0x18, DOSR_LENGTH, 0)
            .register(0x19, DCR_LENGTH, 0b1_0011)
            .register(0x16, DIR_LENGTH, 0)
            .register(0x17, DDR_LENGTH, 0)
    }

    #[test]
    fn test_instruction_codes() {
        assert_eq!(u8::from(Instruction::LoadDI), 0x16);
        assert_eq!(Instruction::try_from(0x18).unwrap(), Instruction::ReadDOSR);
        assert!(Instruction::try_from(0x00).is_err());
    }

    #[test]
    fn test_dosr_to_status() {
        let status: Status = Dosr(Dosr::NEXT_DI | Dosr::IN_OCD_MODE).into();
        assert_eq!(status, Status::NEXT_INSTRUCTION_READY | Status::IN_DEBUG_MODE);
        assert_eq!(Dosr(0).to_string(), "dosr: no flags");
        assert_eq!(Dosr(0b0110).to_string(), "dosr: Exception, InOCDMode");
    }

    #[test]
    fn test_dcr_decode() {
        let dcr = Dcr(0b1_1011);
        assert_eq!(dcr.sr_select(), 2);
        assert_eq!(dcr.to_string(), "dcr: extDbgIntEn, xOCDModePulseEn, OCDOverride, SRselect 2");
        assert!(matches!(dcr.with_sr_select(4), Err(Error::InvalidSrSelect(4))));
    }

    #[test]
    fn test_set_sr_select() {
        let (_sim, mut ocd) = direct(lx106());
        ocd.set_sr_select(2).unwrap();
        assert_eq!(ocd.dcr().unwrap(), Dcr(0b1_1011));
    }

    #[test]
    fn test_status_reads_dosr() {
        let tap = lx106().script(0x18, &[(Dosr::IN_OCD_MODE | Dosr::NEXT_DI) as u64]);
        let (sim, mut ocd) = direct(tap);
        let status = ocd.status().unwrap();
        assert!(status.in_debug_mode() && status.next_instruction_ready());
        let sim = sim.borrow();
        assert_eq!(sim.scans()[0].tdi, BitVec::from_word(5, 0x18).unwrap());
        assert_eq!(sim.scans()[1].register, Register::Data);
        assert_eq!(sim.scans()[1].tdi.len(), DOSR_LENGTH);
    }

    #[test]
    fn test_write_instruction_loads_dir() {
        let (sim, mut ocd) = direct(lx106());
        ocd.write_instruction(0xF1E100).unwrap();
        let sim = sim.borrow();
        assert_eq!(sim.ir(0), Some(0x16));
        assert_eq!(sim.scans()[1].tdi, BitVec::from_word(24, 0xF1E100).unwrap());
    }

    #[test]
    fn test_named_registers() {
        let (_sim, mut ocd) = direct(lx106());
        ocd.write_named("ddr", 0x1234_5678).unwrap();
        assert_eq!(ocd.read_ddr().unwrap(), 0x1234_5678);
        assert!(matches!(ocd.write_named("DOSR", 0), Err(Error::ReadOnlyRegister("DOSR"))));
        assert!(matches!(ocd.read_named("DIR"), Err(Error::WriteOnlyRegister("DIR"))));
        assert!(matches!(ocd.read_named("PC"), Err(Error::UnknownRegister(_))));
    }
}
