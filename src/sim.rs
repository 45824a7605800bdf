// Copyright 2023 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! A simulated JTAG scan chain.
//!
//! `SimChain` implements `ScanDriver` by modelling the shift registers of a
//! chain of TAPs. Each TAP's behaviour is provided by a `SimTap`; the chain
//! handles capture, shifting, update, bypass and the IDCODE-after-reset
//! behaviour common to all devices. Every scan is recorded for inspection.

use std::collections::{HashMap, VecDeque};

use crate::bitvec::BitVec;
use crate::driver::{Result, ScanDriver};

/// Behaviour of one simulated TAP.
pub trait SimTap {
    /// Length of this TAP's instruction register.
    fn ir_len(&self) -> usize;

    /// IDCODE loaded into the data register by a reset, or `None` if the
    /// device selects BYPASS on reset.
    fn idcode(&self) -> Option<u32>;

    /// Length of the data register selected by `ir`, or `None` to act as BYPASS.
    fn dr_len(&self, ir: u64) -> Option<usize>;

    /// Value loaded into the data register at Capture-DR.
    fn capture_dr(&mut self, ir: u64) -> u64;

    /// Value shifted into the data register, at Update-DR.
    fn update_dr(&mut self, ir: u64, value: u64);

    /// Instruction shifted into the instruction register, at Update-IR.
    fn update_ir(&mut self, _ir: u64) {}
}

/// Which register chain a recorded scan went through.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Register {
    Instruction,
    Data,
}

/// One recorded scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scan {
    pub register: Register,
    pub tdi: BitVec,
    pub tdo: BitVec,
}

struct SimDevice {
    tap: Box<dyn SimTap>,
    ir: u64,
    in_reset: bool,
}

impl SimDevice {
    fn bypass_ir(&self) -> u64 {
        mask(self.tap.ir_len())
    }

    /// Current data register length and captured contents.
    fn capture_dr(&mut self) -> (usize, u64) {
        if self.in_reset {
            return match self.tap.idcode() {
                Some(idcode) => (32, idcode as u64),
                None => (1, 0),
            };
        }
        if self.ir == self.bypass_ir() {
            return (1, 0);
        }
        match self.tap.dr_len(self.ir) {
            Some(len) => (len, self.tap.capture_dr(self.ir) & mask(len)),
            None => (1, 0),
        }
    }

    fn update_dr(&mut self, len: usize, value: u64) {
        if self.in_reset || self.ir == self.bypass_ir() {
            return;
        }
        if self.tap.dr_len(self.ir) == Some(len) {
            self.tap.update_dr(self.ir, value);
        }
    }
}

fn mask(len: usize) -> u64 {
    if len >= 64 { u64::MAX } else { (1 << len) - 1 }
}

/// A simulated chain of TAPs. TAP 0 is closest to TDO.
pub struct SimChain {
    devices: Vec<SimDevice>,
    scans: Vec<Scan>,
    resets: usize,
}

impl SimChain {
    pub fn new(taps: Vec<Box<dyn SimTap>>) -> Self {
        let devices = taps.into_iter().map(|tap| SimDevice { tap, ir: 0, in_reset: true }).collect();
        SimChain { devices, scans: Vec::new(), resets: 0 }
    }

    /// Create a chain of devices which only support IDCODE and BYPASS.
    pub fn with_idcodes(devices: &[(usize, u32)]) -> Self {
        let taps = devices.iter()
            .map(|&(ir_len, idcode)| Box::new(IdTap::new(ir_len, idcode)) as Box<dyn SimTap>)
            .collect();
        Self::new(taps)
    }

    /// All scans performed so far, in order.
    pub fn scans(&self) -> &[Scan] {
        &self.scans
    }

    /// Number of test-logic-resets performed.
    pub fn resets(&self) -> usize {
        self.resets
    }

    /// Forget all recorded scans.
    pub fn clear_log(&mut self) {
        self.scans.clear();
    }

    /// Current instruction register value of TAP `idx`.
    pub fn ir(&self, idx: usize) -> Option<u64> {
        self.devices.get(idx).map(|d| d.ir)
    }

    /// Shift `tdi` through a chain whose captured contents are `captured`,
    /// returning TDO and the final register contents.
    fn shift(captured: &BitVec, tdi: &BitVec) -> (BitVec, BitVec) {
        let mut stream = captured.clone();
        stream.append(tdi);
        let tdo = stream.iter().take(tdi.len()).collect();
        let contents = stream.iter().skip(tdi.len()).take(captured.len()).collect();
        (tdo, contents)
    }

    fn record(&mut self, register: Register, tdi: &BitVec, tdo: &BitVec) {
        log::trace!("sim {:?} scan: tdi={} tdo={}", register, tdi, tdo);
        self.scans.push(Scan { register, tdi: tdi.clone(), tdo: tdo.clone() });
    }
}

impl ScanDriver for SimChain {
    fn scan_ir(&mut self, tdi: &BitVec) -> Result<BitVec> {
        // Every IR captures the mandatory ...01 pattern.
        let mut captured = BitVec::new();
        for device in self.devices.iter() {
            let len = device.tap.ir_len();
            captured.append_word(len, 0b01);
        }
        let (tdo, contents) = Self::shift(&captured, tdi);
        let lens: Vec<usize> = self.devices.iter().map(|d| d.tap.ir_len()).collect();
        let values = contents.to_uint(&lens)?;
        for (device, ir) in self.devices.iter_mut().zip(values) {
            device.ir = ir;
            device.in_reset = false;
            device.tap.update_ir(ir);
        }
        self.record(Register::Instruction, tdi, &tdo);
        Ok(tdo)
    }

    fn scan_dr(&mut self, tdi: &BitVec) -> Result<BitVec> {
        let mut captured = BitVec::new();
        let mut lens = Vec::with_capacity(self.devices.len());
        for device in self.devices.iter_mut() {
            let (len, value) = device.capture_dr();
            captured.append_word(len, value);
            lens.push(len);
        }
        let (tdo, contents) = Self::shift(&captured, tdi);
        let values = contents.to_uint(&lens)?;
        for ((device, len), value) in self.devices.iter_mut().zip(lens).zip(values) {
            device.update_dr(len, value);
        }
        self.record(Register::Data, tdi, &tdo);
        Ok(tdo)
    }

    fn test_logic_reset(&mut self) -> Result<()> {
        log::trace!("sim test-logic-reset");
        for device in self.devices.iter_mut() {
            device.in_reset = true;
        }
        self.resets += 1;
        Ok(())
    }
}

/// A TAP supporting only IDCODE (after reset) and BYPASS.
pub struct IdTap {
    ir_len: usize,
    idcode: u32,
}

impl IdTap {
    pub fn new(ir_len: usize, idcode: u32) -> Self {
        IdTap { ir_len, idcode }
    }
}

impl SimTap for IdTap {
    fn ir_len(&self) -> usize {
        self.ir_len
    }

    fn idcode(&self) -> Option<u32> {
        Some(self.idcode)
    }

    fn dr_len(&self, _ir: u64) -> Option<usize> {
        None
    }

    fn capture_dr(&mut self, _ir: u64) -> u64 {
        0
    }

    fn update_dr(&mut self, _ir: u64, _value: u64) {}
}

struct SimRegister {
    len: usize,
    value: u64,
    writable: bool,
    script: VecDeque<u64>,
    writes: Vec<u64>,
}

/// A TAP with a table of plain data registers selected by instruction.
///
/// Each register holds its last written value. Captures can be scripted to
/// return a sequence of values first, which is how status registers that
/// change between polls are simulated.
pub struct RegisterTap {
    ir_len: usize,
    idcode: Option<u32>,
    registers: HashMap<u64, SimRegister>,
}

impl RegisterTap {
    pub fn new(ir_len: usize, idcode: Option<u32>) -> Self {
        RegisterTap { ir_len, idcode, registers: HashMap::new() }
    }

    /// Add a readable and writable register of `len` bits selected by `ir`.
    pub fn register(mut self, ir: u64, len: usize, value: u64) -> Self {
        self.registers.insert(ir, SimRegister {
            len, value, writable: true, script: VecDeque::new(), writes: Vec::new()
        });
        self
    }

    /// Add a register whose updates are ignored.
    pub fn read_only(mut self, ir: u64, len: usize, value: u64) -> Self {
        self.registers.insert(ir, SimRegister {
            len, value, writable: false, script: VecDeque::new(), writes: Vec::new()
        });
        self
    }

    /// Values returned by the next captures of register `ir`, before
    /// falling back to its stored value.
    pub fn script(mut self, ir: u64, values: &[u64]) -> Self {
        if let Some(reg) = self.registers.get_mut(&ir) {
            reg.script.extend(values.iter().copied());
        }
        self
    }
}

impl SimTap for RegisterTap {
    fn ir_len(&self) -> usize {
        self.ir_len
    }

    fn idcode(&self) -> Option<u32> {
        self.idcode
    }

    fn dr_len(&self, ir: u64) -> Option<usize> {
        self.registers.get(&ir).map(|reg| reg.len)
    }

    fn capture_dr(&mut self, ir: u64) -> u64 {
        match self.registers.get_mut(&ir) {
            Some(reg) => reg.script.pop_front().unwrap_or(reg.value),
            None => 0,
        }
    }

    fn update_dr(&mut self, ir: u64, value: u64) {
        if let Some(reg) = self.registers.get_mut(&ir) {
            reg.writes.push(value);
            if reg.writable {
                reg.value = value;
            }
        }
    }
}

/// Model of a 108Mini Nexus window, shared by the register and engine tests.
#[cfg(test)]
pub(crate) mod nexus {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    use crate::program::{RFDO0, RFDO1};
    use crate::protocol::Status;
    use crate::protocol::routed::*;
    use super::SimTap;

    /// Writes to the DSR clear the written bits. A write to DIR0EXEC is
    /// recorded as executed and sets `NEXT_INSTRUCTION_READY`, and an `rfdo`
    /// also leaves debug mode. Every Nexus write is logged.
    #[derive(Default)]
    pub(crate) struct NexusTap {
        pub ndr_phase: bool,
        pub address: u8,
        pub write: bool,
        pub nar_status: u8,
        pub pwrctl: u8,
        pub registers: HashMap<u8, u32>,
        pub executed: Rc<RefCell<Vec<u32>>>,
        pub writes: Rc<RefCell<Vec<(u8, u32)>>>,
    }

    impl NexusTap {
        pub fn reg(&self, address: u8) -> u32 {
            self.registers.get(&address).copied().unwrap_or(0)
        }

        fn set_dsr(&mut self, set: Status, clear: Status) {
            let dsr = (self.reg(naradr::DSR) | set.0) & !clear.0;
            self.registers.insert(naradr::DSR, dsr);
        }

        fn nexus_write(&mut self, address: u8, value: u32) {
            self.writes.borrow_mut().push((address, value));
            match address {
                naradr::DCRSET => {
                    let dcr = self.reg(naradr::DCRSET) | value;
                    self.registers.insert(naradr::DCRSET, dcr);
                    if value & DCR_DEBUGINTERRUPT != 0 {
                        self.set_dsr(Status::IN_DEBUG_MODE, Status::empty());
                    }
                }
                naradr::DSR => self.set_dsr(Status::empty(), Status(value)),
                naradr::DIR0EXEC => {
                    self.executed.borrow_mut().push(value);
                    self.set_dsr(Status::NEXT_INSTRUCTION_READY, Status::empty());
                    if value == RFDO0 || value == RFDO1 {
                        self.set_dsr(Status::empty(), Status::IN_DEBUG_MODE);
                    }
                }
                _ => {
                    self.registers.insert(address, value);
                }
            }
        }
    }

    impl SimTap for NexusTap {
        fn ir_len(&self) -> usize {
            IR_LENGTH
        }

        fn idcode(&self) -> Option<u32> {
            Some(ESP32_IDCODE)
        }

        fn dr_len(&self, ir: u64) -> Option<usize> {
            match ir {
                0x08 | 0x09 => Some(PWR_LENGTH),
                0x1C if self.ndr_phase => Some(NDR_LENGTH),
                0x1C => Some(NAR_LENGTH),
                0x1E => Some(IDCODE_LENGTH),
                _ => None,
            }
        }

        fn capture_dr(&mut self, ir: u64) -> u64 {
            match ir {
                0x08 => self.pwrctl as u64,
                0x09 if self.pwrctl & PWRCTL_DEBUGWAKEUP != 0 => PWRSTAT_DEBUGDOMAINON as u64,
                0x1C if self.ndr_phase => self.reg(self.address) as u64,
                0x1C => self.nar_status as u64,
                0x1E => ESP32_IDCODE as u64,
                _ => 0,
            }
        }

        fn update_dr(&mut self, ir: u64, value: u64) {
            match ir {
                0x08 => self.pwrctl = value as u8,
                0x1C if self.ndr_phase => {
                    if self.write {
                        self.nexus_write(self.address, value as u32);
                    }
                    self.ndr_phase = false;
                }
                0x1C => {
                    self.address = (value >> 1) as u8;
                    self.write = value & 1 == 1;
                    self.ndr_phase = true;
                }
                _ => (),
            }
        }

        fn update_ir(&mut self, _ir: u64) {
            self.ndr_phase = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ir_scan_sets_instructions() {
        let mut sim = SimChain::with_idcodes(&[(5, 0x1111_1111), (4, 0x2222_2222)]);
        let mut tdi = BitVec::from_word(5, 0x1C).unwrap();
        tdi.append(&BitVec::from_word(4, 0x3).unwrap());
        let tdo = sim.scan_ir(&tdi).unwrap();
        assert_eq!(sim.ir(0), Some(0x1C));
        assert_eq!(sim.ir(1), Some(0x3));
        // Captured IRs are shifted out first: 00001 then 0001.
        assert_eq!(tdo, crate::bv![1, 0, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn test_idcodes_after_reset() {
        let mut sim = SimChain::with_idcodes(&[(5, 0x1111_1111), (4, 0x2222_2222)]);
        sim.test_logic_reset().unwrap();
        let tdo = sim.scan_dr(&BitVec::zeros(64)).unwrap();
        assert_eq!(tdo.to_uint(&[32, 32]).unwrap(), vec![0x1111_1111, 0x2222_2222]);
        assert_eq!(sim.resets(), 1);
    }

    #[test]
    fn test_bypass_delays_by_one_bit_per_device() {
        let mut sim = SimChain::with_idcodes(&[(5, 1), (5, 3), (4, 5)]);
        sim.scan_ir(&BitVec::ones(14)).unwrap();
        let mut tdi = BitVec::new();
        tdi.append_ones(1);
        tdi.append_zeros(7);
        let tdo = sim.scan_dr(&tdi).unwrap();
        assert_eq!(tdo.first_one(), Some(3));
    }

    #[test]
    fn test_register_tap_script_and_update() {
        let tap = RegisterTap::new(5, None).register(0x18, 8, 0x04).script(0x18, &[0x01, 0x02]);
        let mut sim = SimChain::new(vec![Box::new(tap)]);
        sim.scan_ir(&BitVec::from_word(5, 0x18).unwrap()).unwrap();
        let read = |sim: &mut SimChain| sim.scan_dr(&BitVec::zeros(8)).unwrap().to_word().unwrap();
        assert_eq!(read(&mut sim), 0x01);
        assert_eq!(read(&mut sim), 0x02);
        // The zeros shifted in by the reads have been stored.
        assert_eq!(read(&mut sim), 0x00);
        assert_eq!(sim.scans().len(), 4);
    }
}
