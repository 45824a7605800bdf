// Copyright 2023 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Debug registers reached through the Nexus address/data window.
//!
//! Used by the Diamond 108Mini cores in the ESP32. The NARSEL instruction
//! presents the 8-bit Nexus Address Register (NAR) and the 32-bit Nexus Data
//! Register (NDR) as alternating data registers. The NAR takes a register
//! address in bits 7:1 and a write flag in bit 0, and captures the status of
//! the access. The NDR then carries the register value in either direction.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::driver::ScanDriver;
use crate::chain::ChainDevice;
use super::{Access, DebugRegisterProtocol, Error, RegisterAccess, RegisterDescriptor,
            RegisterMap, Result, Status};
use super::Access::{ReadOnly as RO, ReadWrite as RW, WriteOnly as WO};

pub const IR_LENGTH: usize = 5;
pub const NAR_LENGTH: usize = 8;
pub const NDR_LENGTH: usize = 32;
pub const PWR_LENGTH: usize = 8;
pub const IDCODE_LENGTH: usize = 32;

/// IDCODE of the cores in an ESP32.
pub const ESP32_IDCODE: u32 = 0x120034E5;

#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Instruction {
    PowerControl = 0x08,
    PowerStatus = 0x09,
    NarSel = 0x1C,
    IdCode = 0x1E,
    Bypass = 0x1F,
}

pub const PWRCTL_JTAGDEBUGUSE: u8 = 1 << 7;
pub const PWRCTL_DEBUGRESET: u8 = 1 << 6;
pub const PWRCTL_CORERESET: u8 = 1 << 4;
pub const PWRCTL_DEBUGWAKEUP: u8 = 1 << 2;
pub const PWRCTL_MEMWAKEUP: u8 = 1 << 1;
pub const PWRCTL_COREWAKEUP: u8 = 1 << 0;
pub const PWRCTL_WAKEUP: u8 = PWRCTL_DEBUGWAKEUP | PWRCTL_MEMWAKEUP | PWRCTL_COREWAKEUP;

pub const PWRSTAT_DEBUGWASRESET: u8 = 1 << 6;
pub const PWRSTAT_COREWASRESET: u8 = 1 << 4;
pub const PWRSTAT_CORESTILLNEEDED: u8 = 1 << 3;
pub const PWRSTAT_DEBUGDOMAINON: u8 = 1 << 2;
pub const PWRSTAT_MEMDOMAINON: u8 = 1 << 1;
pub const PWRSTAT_COREDOMAINON: u8 = 1 << 0;

pub const DCR_ENABLEOCD: u32 = 1 << 0;
pub const DCR_DEBUGINTERRUPT: u32 = 1 << 1;
pub const DCR_INTERRUPTALLCONDS: u32 = 1 << 2;
pub const DCR_BREAKINEN: u32 = 1 << 16;
pub const DCR_BREAKOUTEN: u32 = 1 << 17;
pub const DCR_DEBUGSWACTIVE: u32 = 1 << 20;
pub const DCR_RUNSTALLINEN: u32 = 1 << 21;
pub const DCR_DEBUGMODEOUTEN: u32 = 1 << 22;

/// Nexus register addresses.
pub mod naradr {
    pub const TRAXID: u8 = 0x00;
    pub const TRAXCTRL: u8 = 0x01;
    pub const TRAXSTAT: u8 = 0x02;
    pub const TRAXDATA: u8 = 0x03;
    pub const TRAXADDR: u8 = 0x04;
    pub const TRIGGERPC: u8 = 0x05;
    pub const PCMATCHCTRL: u8 = 0x06;
    pub const DELAYCNT: u8 = 0x07;
    pub const MEMADDRSTART: u8 = 0x08;
    pub const MEMADDREND: u8 = 0x09;
    pub const PMG: u8 = 0x20;
    pub const INTPC: u8 = 0x24;
    pub const PM0: u8 = 0x28;
    pub const PMCTRL0: u8 = 0x30;
    pub const PMSTAT0: u8 = 0x38;
    pub const OCDID: u8 = 0x40;
    pub const DCRCLR: u8 = 0x42;
    pub const DCRSET: u8 = 0x43;
    pub const DSR: u8 = 0x44;
    pub const DDR: u8 = 0x45;
    pub const DDREXEC: u8 = 0x46;
    pub const DIR0EXEC: u8 = 0x47;
    pub const DIR0: u8 = 0x48;
    pub const PWRCTL: u8 = 0x58;
    pub const PWRSTAT: u8 = 0x59;
    pub const ERISTAT: u8 = 0x5A;
    pub const ITCTRL: u8 = 0x60;
    pub const CLAIMSET: u8 = 0x68;
    pub const CLAIMCLR: u8 = 0x69;
    pub const LOCKACCESS: u8 = 0x6C;
    pub const LOCKSTATUS: u8 = 0x6D;
    pub const AUTHSTATUS: u8 = 0x6E;
    pub const DEVID: u8 = 0x72;
    pub const DEVTYPE: u8 = 0x73;
    pub const PERID4: u8 = 0x74;
    pub const PERID0: u8 = 0x78;
    pub const COMPID0: u8 = 0x7C;
}

const fn reg(name: &'static str, address: u8, access: Access, description: &'static str)
    -> RegisterDescriptor
{
    RegisterDescriptor { name, address, width: NDR_LENGTH, access, description }
}

static REGISTERS: [RegisterDescriptor; 71] = [
    reg("TRAXID", 0x00, RO, "TRAX ID"),
    reg("TRAXCTRL", 0x01, RW, "TRAX control"),
    reg("TRAXSTAT", 0x02, RO, "TRAX status"),
    reg("TRAXDATA", 0x03, RW, "TRAX data"),
    reg("TRAXADDR", 0x04, RW, "TRAX address"),
    reg("TRIGGERPC", 0x05, RW, "TRAX stop PC"),
    reg("PCMATCHCTRL", 0x06, RW, "TRAX stop PC match control"),
    reg("DELAYCNT", 0x07, RW, "TRAX post-stop trigger capture count"),
    reg("MEMADDRSTART", 0x08, RW, "TRAX memory start address"),
    reg("MEMADDREND", 0x09, RW, "TRAX memory end address"),
    reg("PMG", 0x20, RW, "Performance monitor global control"),
    reg("INTPC", 0x24, RO, "Performance monitor interrupt PC"),
    reg("PM0", 0x28, RW, "Performance counter 0"),
    reg("PM1", 0x29, RW, "Performance counter 1"),
    reg("PM2", 0x2A, RW, "Performance counter 2"),
    reg("PM3", 0x2B, RW, "Performance counter 3"),
    reg("PM4", 0x2C, RW, "Performance counter 4"),
    reg("PM5", 0x2D, RW, "Performance counter 5"),
    reg("PM6", 0x2E, RW, "Performance counter 6"),
    reg("PM7", 0x2F, RW, "Performance counter 7"),
    reg("PMCTRL0", 0x30, RW, "Performance counter 0 control"),
    reg("PMCTRL1", 0x31, RW, "Performance counter 1 control"),
    reg("PMCTRL2", 0x32, RW, "Performance counter 2 control"),
    reg("PMCTRL3", 0x33, RW, "Performance counter 3 control"),
    reg("PMCTRL4", 0x34, RW, "Performance counter 4 control"),
    reg("PMCTRL5", 0x35, RW, "Performance counter 5 control"),
    reg("PMCTRL6", 0x36, RW, "Performance counter 6 control"),
    reg("PMCTRL7", 0x37, RW, "Performance counter 7 control"),
    reg("PMSTAT0", 0x38, RW, "Performance counter 0 status"),
    reg("PMSTAT1", 0x39, RW, "Performance counter 1 status"),
    reg("PMSTAT2", 0x3A, RW, "Performance counter 2 status"),
    reg("PMSTAT3", 0x3B, RW, "Performance counter 3 status"),
    reg("PMSTAT4", 0x3C, RW, "Performance counter 4 status"),
    reg("PMSTAT5", 0x3D, RW, "Performance counter 5 status"),
    reg("PMSTAT6", 0x3E, RW, "Performance counter 6 status"),
    reg("PMSTAT7", 0x3F, RW, "Performance counter 7 status"),
    reg("OCDID", 0x40, RO, "OCD ID"),
    reg("DCRCLR", 0x42, RW, "Debug control register, write 1 to clear"),
    reg("DCRSET", 0x43, RW, "Debug control register, write 1 to set"),
    reg("DSR", 0x44, RW, "Debug status register, write 1 to clear"),
    reg("DDR", 0x45, RW, "Debug data register"),
    reg("DDREXEC", 0x46, RW, "Debug data register, access executes DIR"),
    reg("DIR0EXEC", 0x47, RW, "Debug instruction register word 0, write executes"),
    reg("DIR0", 0x48, RW, "Debug instruction register word 0"),
    reg("DIR1", 0x49, RW, "Debug instruction register word 1"),
    reg("DIR2", 0x4A, RW, "Debug instruction register word 2"),
    reg("DIR3", 0x4B, RW, "Debug instruction register word 3"),
    reg("DIR4", 0x4C, RW, "Debug instruction register word 4"),
    reg("DIR5", 0x4D, RW, "Debug instruction register word 5"),
    reg("DIR6", 0x4E, RW, "Debug instruction register word 6"),
    reg("DIR7", 0x4F, RW, "Debug instruction register word 7"),
    reg("PWRCTL", 0x58, RW, "Power control"),
    reg("PWRSTAT", 0x59, RW, "Power status"),
    reg("ERISTAT", 0x5A, RW, "ERI transaction status"),
    reg("ITCTRL", 0x60, RW, "Integration mode control"),
    reg("CLAIMSET", 0x68, RW, "Claim tag set"),
    reg("CLAIMCLR", 0x69, RW, "Claim tag clear"),
    reg("LOCKACCESS", 0x6C, WO, "Lock access"),
    reg("LOCKSTATUS", 0x6D, RO, "Lock status"),
    reg("AUTHSTATUS", 0x6E, RO, "Authentication status"),
    reg("DEVID", 0x72, RO, "Device ID"),
    reg("DEVTYPE", 0x73, RO, "Device type"),
    reg("PERID4", 0x74, RO, "Peripheral ID 4"),
    reg("PERID5", 0x75, RO, "Peripheral ID 5"),
    reg("PERID6", 0x76, RO, "Peripheral ID 6"),
    reg("PERID7", 0x77, RO, "Peripheral ID 7"),
    reg("PERID0", 0x78, RO, "Peripheral ID 0"),
    reg("PERID1", 0x79, RO, "Peripheral ID 1"),
    reg("PERID2", 0x7A, RO, "Peripheral ID 2"),
    reg("PERID3", 0x7B, RO, "Peripheral ID 3"),
    reg("COMPID0", 0x7C, RO, "Component ID 0"),
];

pub static REGISTER_MAP: RegisterMap = RegisterMap::new(&REGISTERS);

/// Status captured from the NAR during an access.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NexusStatus(pub u8);

impl NexusStatus {
    pub const ERROR: u8 = 1 << 0;
    pub const BUSY: u8 = 1 << 1;

    /// Convert the status of an access to `address` into a result.
    pub fn check(&self, address: u8) -> Result<()> {
        match self.0 & 0b11 {
            0 => Ok(()),
            Self::ERROR => Err(Error::RegisterError { address }),
            Self::BUSY => Err(Error::RegisterBusy { address }),
            status => Err(Error::UnexpectedRegisterStatus { address, status }),
        }
    }
}

/// Nexus-routed debug register interface to one core.
pub struct Routed<D> {
    access: RegisterAccess<D>,
}

impl<D: ScanDriver> Routed<D> {
    pub fn new(device: ChainDevice<D>) -> Self {
        Routed { access: RegisterAccess::new(device) }
    }

    pub fn device(&self) -> &ChainDevice<D> {
        self.access.device()
    }

    fn nexus_access(&mut self, address: u8, write: bool, value: u32) -> Result<u32> {
        self.select_instruction(Instruction::NarSel)?;
        let nar = ((address as u32) << 1) | write as u32;
        let status = NexusStatus(self.access.read_modify_write(NAR_LENGTH, nar)? as u8);
        let data = self.access.read_modify_write(NDR_LENGTH, value)?;
        // The NDR must be scanned even on error, or the window is left
        // expecting a data phase.
        status.check(address)?;
        Ok(data)
    }

    /// Read Nexus register `address`.
    pub fn nexus_read(&mut self, address: u8) -> Result<u32> {
        let value = self.nexus_access(address, false, 0)?;
        log::trace!("Nexus read 0x{:02X} = 0x{:08X}", address, value);
        Ok(value)
    }

    /// Write Nexus register `address`.
    pub fn nexus_write(&mut self, address: u8, value: u32) -> Result<()> {
        log::trace!("Nexus write 0x{:02X} = 0x{:08X}", address, value);
        self.nexus_access(address, true, value)?;
        Ok(())
    }

    /// Write the power control register through its own TAP instruction,
    /// returning the previous value.
    pub fn power_control(&mut self, value: u8) -> Result<u8> {
        self.select_instruction(Instruction::PowerControl)?;
        Ok(self.access.read_modify_write(PWR_LENGTH, value as u32)? as u8)
    }

    /// Read the power status register.
    ///
    /// The sticky was-reset flags are cleared by writing them back.
    pub fn power_status(&mut self) -> Result<u8> {
        self.select_instruction(Instruction::PowerStatus)?;
        Ok(self.access.read(PWR_LENGTH)? as u8)
    }

    pub fn ocd_id(&mut self) -> Result<u32> {
        self.nexus_read(naradr::OCDID)
    }

    pub fn idcode(&mut self) -> Result<u32> {
        self.select_instruction(Instruction::IdCode)?;
        self.access.read(IDCODE_LENGTH)
    }
}

impl<D: ScanDriver> DebugRegisterProtocol for Routed<D> {
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
        self.nexus_read(register.address)
    }

    fn write_register(&mut self, register: &RegisterDescriptor, value: u32) -> Result<()> {
        self.nexus_write(register.address, value)
    }

    fn enable_ocd(&mut self) -> Result<()> {
        log::debug!("Waking debug module and enabling OCD");
        self.power_control(PWRCTL_WAKEUP)?;
        self.power_control(PWRCTL_WAKEUP | PWRCTL_JTAGDEBUGUSE)?;
        self.nexus_write(naradr::DCRSET, DCR_ENABLEOCD)
    }

    fn debug_interrupt(&mut self) -> Result<()> {
        log::debug!("Asserting debug interrupt");
        self.nexus_write(naradr::DCRSET, DCR_DEBUGINTERRUPT)
    }

    fn status(&mut self) -> Result<Status> {
        // The DSR already uses the status flag layout.
        Ok(Status(self.nexus_read(naradr::DSR)?))
    }

    fn clear_status(&mut self, flags: Status) -> Result<Status> {
        let status = self.status()?;
        self.nexus_write(naradr::DSR, flags.0)?;
        Ok(status)
    }

    fn write_instruction(&mut self, opcode: u32) -> Result<()> {
        self.nexus_write(naradr::DIR0EXEC, opcode)
    }

    fn read_ddr(&mut self) -> Result<u32> {
        self.nexus_read(naradr::DDR)
    }

    fn write_ddr(&mut self, value: u32) -> Result<()> {
        self.nexus_write(naradr::DDR, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use crate::chain::ChainConfig;
    use crate::sim::SimChain;
    use crate::sim::nexus::NexusTap;

    fn routed(tap: NexusTap) -> Routed<SimChain> {
        let sim = Rc::new(RefCell::new(SimChain::new(vec![Box::new(tap)])));
        let dev = ChainDevice::new(sim, 0, &[IR_LENGTH], ESP32_IDCODE, &ChainConfig::default())
            .unwrap();
        Routed::new(dev)
    }

    #[test]
    fn test_nexus_read_write() {
        let mut ocd = routed(NexusTap::default());
        ocd.nexus_write(naradr::DDR, 0xDEAD_BEEF).unwrap();
        assert_eq!(ocd.read_ddr().unwrap(), 0xDEAD_BEEF);
        ocd.write_named("PM3", 7).unwrap();
        assert_eq!(ocd.read_named("pm3").unwrap(), 7);
    }

    #[test]
    fn test_nar_status_checked() {
        let mut ocd = routed(NexusTap { nar_status: NexusStatus::BUSY, ..Default::default() });
        assert!(matches!(ocd.nexus_read(naradr::DSR),
                         Err(Error::RegisterBusy { address: naradr::DSR })));
        let mut ocd = routed(NexusTap { nar_status: NexusStatus::ERROR, ..Default::default() });
        assert!(matches!(ocd.ocd_id(), Err(Error::RegisterError { address: naradr::OCDID })));
        assert!(matches!(NexusStatus(3).check(1),
                         Err(Error::UnexpectedRegisterStatus { address: 1, status: 3 })));
    }

    #[test]
    fn test_enable_and_interrupt() {
        let mut ocd = routed(NexusTap::default());
        ocd.enable_ocd().unwrap();
        assert_eq!(ocd.power_control(0).unwrap(), PWRCTL_WAKEUP | PWRCTL_JTAGDEBUGUSE);
        assert!(!ocd.status().unwrap().in_debug_mode());
        ocd.debug_interrupt().unwrap();
        assert!(ocd.status().unwrap().in_debug_mode());
        assert_eq!(ocd.read_named("DCRSET").unwrap(), DCR_ENABLEOCD | DCR_DEBUGINTERRUPT);
    }

    #[test]
    fn test_instruction_execution_and_clear() {
        let executed = Rc::new(RefCell::new(Vec::new()));
        let mut ocd = routed(NexusTap { executed: executed.clone(), ..Default::default() });
        ocd.write_instruction(0xF1E000).unwrap();
        assert_eq!(*executed.borrow(), vec![0xF1E000]);
        assert!(ocd.status().unwrap().next_instruction_ready());
        ocd.clear_status(Status::EXEC_FLAGS).unwrap();
        assert!(!ocd.status().unwrap().next_instruction_ready());
    }

    #[test]
    fn test_idcode_and_power_status() {
        let mut ocd = routed(NexusTap::default());
        assert_eq!(ocd.idcode().unwrap(), ESP32_IDCODE);
        assert_eq!(ocd.power_status().unwrap(), 0);
        ocd.power_control(PWRCTL_WAKEUP).unwrap();
        assert_eq!(ocd.power_status().unwrap(), PWRSTAT_DEBUGDOMAINON);
    }

    #[test]
    fn test_register_map_addresses_unique() {
        let map = &REGISTER_MAP;
        for reg in map.iter() {
            assert_eq!(map.by_address(reg.address).map(|r| r.name), Some(reg.name));
        }
        assert_eq!(map.get("pwrstat").unwrap().address, naradr::PWRSTAT);
    }
}
