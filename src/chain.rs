// Copyright 2023 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Addressing a single TAP on a multi-device scan chain.
//!
//! Devices are numbered from 0, closest to TDO. Bits for device 0 are the
//! first shifted into TDI and the first captured out of TDO, so padding for
//! the devices "before" a device always precedes its own bits in a scan.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::bitvec::{BitVec, Error as BitVecError};
use crate::driver::{self, Error as DriverError, ScanDriver};

pub use jtagdap::jtag::IDCODE as IdCode;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Device index {index} is outside a chain of {devices} devices.")]
    InvalidDeviceIndex { index: usize, devices: usize },
    #[error("Expected {expected} devices on the scan chain but found {found}.")]
    DeviceCountMismatch { expected: usize, found: usize },
    #[error("Expected total IR length {expected} but scan chain has {found}.")]
    IrLengthMismatch { expected: usize, found: usize },
    #[error("Bad IDCODE: expected 0x{expected:08X}, found 0x{found:08X}.")]
    IdentityMismatch { expected: u32, found: u32 },
    #[error("Unexpected result from scan chain: {set_bits} set bits in flush pattern.")]
    AmbiguousChainLength { set_bits: usize },
    #[error("Scan chain is longer than the flush length of {flush} bits.")]
    ChainTooLong { flush: usize },
    #[error("Driver error")]
    Driver(#[from] DriverError),
    #[error("Bit vector error")]
    BitVec(#[from] BitVecError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Length of the IDCODE register of every device after reset.
pub const IDCODE_LENGTH: usize = 32;

/// Limits used when measuring an unknown chain.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChainConfig {
    /// Maximum number of devices expected on the chain.
    pub max_devices: usize,
    /// Maximum instruction register length of any one device.
    pub max_ir_length: usize,
}

impl ChainConfig {
    /// Number of zero bits either side of the marker bit when measuring a chain.
    pub fn flush_length(&self) -> usize {
        4 * self.max_devices * self.max_ir_length
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig { max_devices: 4, max_ir_length: 8 }
    }
}

/// Chain properties measured from hardware.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChainLayout {
    /// Number of devices, from the length of the all-BYPASS data register chain.
    pub devices: usize,
    /// Total length of the instruction register chain.
    pub ir_length: usize,
}

/// Position of one device on the chain, fixed for the life of a `ChainDevice`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChainTopology {
    index: usize,
    devices: usize,
    ir_len_before: usize,
    ir_len: usize,
    ir_len_after: usize,
}

impl ChainTopology {
    /// Compute the topology of device `index` given every device's IR length.
    pub fn from_ir_lengths(index: usize, ir_lengths: &[usize]) -> Result<Self> {
        if index >= ir_lengths.len() {
            return Err(Error::InvalidDeviceIndex { index, devices: ir_lengths.len() });
        }
        Ok(ChainTopology {
            index,
            devices: ir_lengths.len(),
            ir_len_before: ir_lengths[..index].iter().sum(),
            ir_len: ir_lengths[index],
            ir_len_after: ir_lengths[index + 1..].iter().sum(),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn devices(&self) -> usize {
        self.devices
    }

    pub fn devices_before(&self) -> usize {
        self.index
    }

    pub fn devices_after(&self) -> usize {
        self.devices - self.index - 1
    }

    pub fn ir_len(&self) -> usize {
        self.ir_len
    }

    pub fn ir_len_before(&self) -> usize {
        self.ir_len_before
    }

    pub fn ir_len_after(&self) -> usize {
        self.ir_len_after
    }

    pub fn total_ir_length(&self) -> usize {
        self.ir_len_before + self.ir_len + self.ir_len_after
    }

    /// Check this topology against the measured chain.
    pub fn validate(&self, layout: &ChainLayout) -> Result<()> {
        if layout.devices != self.devices {
            return Err(Error::DeviceCountMismatch { expected: self.devices, found: layout.devices });
        }
        if layout.ir_length != self.total_ir_length() {
            return Err(Error::IrLengthMismatch {
                expected: self.total_ir_length(), found: layout.ir_length
            });
        }
        Ok(())
    }
}

impl fmt::Display for ChainTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ir_len_before > 0 {
            write!(f, "{},", self.ir_len_before)?;
        }
        write!(f, "({})", self.ir_len)?;
        if self.ir_len_after > 0 {
            write!(f, ",{}", self.ir_len_after)?;
        }
        Ok(())
    }
}

/// Everything learned from scanning an unknown chain.
#[derive(Clone, Debug, PartialEq)]
pub struct ChainInfo {
    pub layout: ChainLayout,
    pub idcodes: Vec<IdCode>,
}

/// Shift a single set bit through the chain using `scan` and measure how many
/// bits it was delayed by.
fn measure<F>(flush: usize, mut scan: F) -> Result<usize>
    where F: FnMut(&BitVec) -> driver::Result<BitVec>
{
    let mut tdi = BitVec::zeros(flush);
    tdi.append_ones(1);
    tdi.append_zeros(flush);
    let mut tdo = scan(&tdi)?;
    driver::check_length(&tdi, &tdo)?;

    // The first bits out are the chain's captured contents, so discard them.
    tdo.drop_lsb(flush)?;
    match tdo.count_ones() {
        1 => tdo.first_one().ok_or(Error::AmbiguousChainLength { set_bits: 0 }),
        0 => Err(Error::ChainTooLong { flush }),
        set_bits => Err(Error::AmbiguousChainLength { set_bits }),
    }
}

/// Count the devices on the chain by putting them all in BYPASS
/// and measuring the data register chain length.
pub fn count_devices<D: ScanDriver + ?Sized>(driver: &mut D, config: &ChainConfig) -> Result<usize> {
    let flush = config.flush_length();
    driver.scan_ir(&BitVec::ones(flush))?;
    measure(flush, |tdi| driver.scan_dr(tdi))
}

/// Measure the total length of the instruction register chain.
///
/// This leaves every device's IR holding zeros, so a reset or a new IR scan
/// is required afterwards.
pub fn ir_chain_length<D: ScanDriver + ?Sized>(driver: &mut D, config: &ChainConfig) -> Result<usize> {
    measure(config.flush_length(), |tdi| driver.scan_ir(tdi))
}

/// Measure the number of devices and total IR length of the chain.
pub fn discover<D: ScanDriver + ?Sized>(driver: &mut D, config: &ChainConfig) -> Result<ChainLayout> {
    driver.test_logic_reset()?;
    let devices = count_devices(driver, config)?;
    let ir_length = ir_chain_length(driver, config)?;
    log::info!("Found {} devices on scan chain with total IR length {}", devices, ir_length);
    Ok(ChainLayout { devices, ir_length })
}

/// Reset the chain and read the IDCODE of each of `devices` devices.
pub fn reset_idcodes<D: ScanDriver + ?Sized>(driver: &mut D, devices: usize) -> Result<Vec<IdCode>> {
    driver.test_logic_reset()?;
    let tdi = BitVec::zeros(devices * IDCODE_LENGTH);
    let tdo = driver.scan_dr(&tdi)?;
    driver::check_length(&tdi, &tdo)?;
    let widths = vec![IDCODE_LENGTH; devices];
    let idcodes = tdo.to_uint(&widths)?.into_iter().map(|code| IdCode(code as u32)).collect();
    Ok(idcodes)
}

/// Discover the chain and read every device's IDCODE.
pub fn scan<D: ScanDriver + ?Sized>(driver: &mut D, config: &ChainConfig) -> Result<ChainInfo> {
    let layout = discover(driver, config)?;
    let idcodes = reset_idcodes(driver, layout.devices)?;
    for (idx, idcode) in idcodes.iter().enumerate() {
        log::debug!("Device {}: IDCODE {}", idx, idcode);
    }
    Ok(ChainInfo { layout, idcodes })
}

/// One TAP on a scan chain, with every other device held in BYPASS.
///
/// The driver is shared with any other `ChainDevice` on the same chain, but
/// only one scan is in flight at a time. Cloning a `ChainDevice` gives
/// another handle to the same device.
pub struct ChainDevice<D> {
    driver: Rc<RefCell<D>>,
    topology: ChainTopology,
    idcode: u32,
}

impl<D> Clone for ChainDevice<D> {
    fn clone(&self) -> Self {
        ChainDevice { driver: Rc::clone(&self.driver), topology: self.topology, idcode: self.idcode }
    }
}

impl<D: ScanDriver> ChainDevice<D> {
    /// Open device `index` on a chain with the given per-device IR lengths.
    ///
    /// The chain is measured and must match `ir_lengths`, and the device's
    /// IDCODE must equal `idcode`.
    pub fn new(driver: Rc<RefCell<D>>, index: usize, ir_lengths: &[usize], idcode: u32,
               config: &ChainConfig) -> Result<Self>
    {
        let topology = ChainTopology::from_ir_lengths(index, ir_lengths)?;
        let layout = discover(&mut *driver.borrow_mut(), config)?;
        topology.validate(&layout)?;
        let device = ChainDevice { driver, topology, idcode };
        device.verify_identity(idcode)?;
        log::debug!("Opened {}", device);
        Ok(device)
    }

    /// Reset the chain and check this device reports the `expected` IDCODE.
    pub fn verify_identity(&self, expected: u32) -> Result<()> {
        let idcodes = reset_idcodes(&mut *self.driver.borrow_mut(), self.topology.devices)?;
        let found = idcodes[self.topology.index].0;
        if found == expected {
            Ok(())
        } else {
            Err(Error::IdentityMismatch { expected, found })
        }
    }

    pub fn topology(&self) -> &ChainTopology {
        &self.topology
    }

    pub fn idcode(&self) -> IdCode {
        IdCode(self.idcode)
    }

    /// The shared driver for this chain.
    pub fn driver(&self) -> &Rc<RefCell<D>> {
        &self.driver
    }

    fn pad_ir(&self, bits: &BitVec) -> BitVec {
        let mut tdi = BitVec::ones(self.topology.ir_len_before);
        tdi.append(bits);
        tdi.append_ones(self.topology.ir_len_after);
        tdi
    }

    fn pad_dr(&self, bits: &BitVec) -> BitVec {
        let mut tdi = BitVec::ones(self.topology.devices_before());
        tdi.append(bits);
        tdi.append_ones(self.topology.devices_after());
        tdi
    }

    /// Write `bits` to this device's IR, placing all other devices in BYPASS.
    pub fn write_ir(&self, bits: &BitVec) -> Result<()> {
        self.read_write_ir(bits)?;
        Ok(())
    }

    /// Write `bits` to this device's IR and return the bits captured from it.
    pub fn read_write_ir(&self, bits: &BitVec) -> Result<BitVec> {
        let tdi = self.pad_ir(bits);
        let mut tdo = self.driver.borrow_mut().scan_ir(&tdi)?;
        driver::check_length(&tdi, &tdo)?;
        tdo.drop_lsb(self.topology.ir_len_before)?;
        tdo.drop_msb(self.topology.ir_len_after)?;
        log::trace!("Device {} IR: wrote {} read {}", self.topology.index, bits, tdo);
        Ok(tdo)
    }

    /// Write `bits` to this device's current DR.
    ///
    /// Other devices are assumed to be in BYPASS, which holds as long as
    /// only this `ChainDevice` has written the IR since the last reset.
    pub fn write_dr(&self, bits: &BitVec) -> Result<()> {
        self.read_write_dr(bits)?;
        Ok(())
    }

    /// Write `bits` to this device's current DR and return the bits captured from it.
    pub fn read_write_dr(&self, bits: &BitVec) -> Result<BitVec> {
        let tdi = self.pad_dr(bits);
        let mut tdo = self.driver.borrow_mut().scan_dr(&tdi)?;
        driver::check_length(&tdi, &tdo)?;
        tdo.drop_lsb(self.topology.devices_before())?;
        tdo.drop_msb(self.topology.devices_after())?;
        log::trace!("Device {} DR: wrote {} read {}", self.topology.index, bits, tdo);
        Ok(tdo)
    }
}

impl<D> fmt::Display for ChainDevice<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device {} idcode 0x{:08X} irchain {}",
               self.topology.index, self.idcode, self.topology)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Register, SimChain};

    const XTENSA: u32 = 0x120034E5;
    const OTHER: u32 = 0x4BA00477;

    fn shared(sim: SimChain) -> Rc<RefCell<SimChain>> {
        Rc::new(RefCell::new(sim))
    }

    #[test]
    fn test_topology() {
        let t = ChainTopology::from_ir_lengths(1, &[4, 5, 6, 7]).unwrap();
        assert_eq!(t.ir_len_before(), 4);
        assert_eq!(t.ir_len(), 5);
        assert_eq!(t.ir_len_after(), 13);
        assert_eq!(t.devices_before() + 1 + t.devices_after(), t.devices());
        assert_eq!(t.to_string(), "4,(5),13");
        assert_eq!(ChainTopology::from_ir_lengths(0, &[5]).unwrap().to_string(), "(5)");
        assert!(matches!(ChainTopology::from_ir_lengths(2, &[5, 5]),
                         Err(Error::InvalidDeviceIndex { index: 2, devices: 2 })));
    }

    #[test]
    fn test_count_devices() {
        for n in 1..=4 {
            let devices: Vec<(usize, u32)> = (0..n).map(|i| (5, XTENSA + 2 * i as u32)).collect();
            let mut sim = SimChain::with_idcodes(&devices);
            assert_eq!(count_devices(&mut sim, &ChainConfig::default()).unwrap(), n);
        }
    }

    #[test]
    fn test_discover() {
        let mut sim = SimChain::with_idcodes(&[(5, XTENSA), (4, OTHER), (8, XTENSA)]);
        let layout = discover(&mut sim, &ChainConfig::default()).unwrap();
        assert_eq!(layout, ChainLayout { devices: 3, ir_length: 17 });
    }

    /// A chain whose TDO is held at a constant level.
    struct Stuck(bool);

    impl ScanDriver for Stuck {
        fn scan_ir(&mut self, tdi: &BitVec) -> driver::Result<BitVec> {
            Ok(BitVec::from(vec![self.0; tdi.len()]))
        }

        fn scan_dr(&mut self, tdi: &BitVec) -> driver::Result<BitVec> {
            Ok(BitVec::from(vec![self.0; tdi.len()]))
        }

        fn test_logic_reset(&mut self) -> driver::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_chain_too_long() {
        let config = ChainConfig { max_devices: 1, max_ir_length: 2 };
        assert!(matches!(ir_chain_length(&mut Stuck(false), &config),
                         Err(Error::ChainTooLong { flush: 8 })));
    }

    #[test]
    fn test_ambiguous_chain_length() {
        let result = count_devices(&mut Stuck(true), &ChainConfig::default());
        assert!(matches!(result, Err(Error::AmbiguousChainLength { set_bits: 129 })));
    }

    #[test]
    fn test_scan() {
        let mut sim = SimChain::with_idcodes(&[(5, XTENSA), (4, OTHER)]);
        let info = scan(&mut sim, &ChainConfig::default()).unwrap();
        assert_eq!(info.layout.devices, 2);
        assert_eq!(info.idcodes, vec![IdCode(XTENSA), IdCode(OTHER)]);
    }

    #[test]
    fn test_idcode_fields() {
        let idcode = IdCode(XTENSA);
        assert_eq!(idcode.manufacturer(), 0x272);
        assert_eq!(idcode.part_number(), 0x2003);
        assert_eq!(idcode.version(), 1);
        assert!(idcode.valid());
        assert!(idcode.to_string().starts_with("0x120034E5"));
        assert!(!IdCode(0x0000_00FF).valid());
        assert!(!IdCode(0x1200_34E4).valid());
    }

    #[test]
    fn test_scan_names_manufacturer() {
        let arm = 0x3BA0_0477;
        let mut sim = SimChain::with_idcodes(&[(4, arm), (5, XTENSA)]);
        let info = scan(&mut sim, &ChainConfig::default()).unwrap();
        assert_eq!(info.idcodes[0].manufacturer_name(), Some("ARM Ltd"));
        assert_eq!(info.idcodes[0].to_string(), "0x3BA00477 (ARM Ltd)");
        assert_eq!(info.idcodes[1].part_number(), 0x2003);
    }

    #[test]
    fn test_new_device() {
        let sim = shared(SimChain::with_idcodes(&[(5, XTENSA), (5, XTENSA + 2)]));
        let dev = ChainDevice::new(sim, 1, &[5, 5], XTENSA + 2, &ChainConfig::default()).unwrap();
        assert_eq!(dev.topology().devices_before(), 1);
        assert_eq!(dev.to_string(), "device 1 idcode 0x120034E7 irchain 5,(5)");
    }

    #[test]
    fn test_new_device_mismatches() {
        let config = ChainConfig::default();
        let sim = shared(SimChain::with_idcodes(&[(5, XTENSA), (5, XTENSA)]));
        assert!(matches!(ChainDevice::new(sim.clone(), 0, &[5], XTENSA, &config),
                         Err(Error::DeviceCountMismatch { expected: 1, found: 2 })));
        assert!(matches!(ChainDevice::new(sim.clone(), 0, &[5, 4], XTENSA, &config),
                         Err(Error::IrLengthMismatch { expected: 9, found: 10 })));
        assert!(matches!(ChainDevice::new(sim, 1, &[5, 5], OTHER, &config),
                         Err(Error::IdentityMismatch { expected: OTHER, found: XTENSA })));
    }

    #[test]
    fn test_write_ir_pads_before() {
        let sim = shared(SimChain::with_idcodes(&[(5, XTENSA), (5, XTENSA)]));
        let dev = ChainDevice::new(sim.clone(), 1, &[5, 5], XTENSA, &ChainConfig::default()).unwrap();
        sim.borrow_mut().clear_log();
        dev.write_ir(&BitVec::from_word(5, 0x1C).unwrap()).unwrap();

        let sim = sim.borrow();
        assert_eq!(sim.scans().len(), 1);
        let scan = &sim.scans()[0];
        assert_eq!(scan.register, Register::Instruction);
        assert_eq!(scan.tdi, crate::bv![1, 1, 1, 1, 1, 0, 0, 1, 1, 1]);
        assert_eq!(sim.ir(0), Some(0x1F));
        assert_eq!(sim.ir(1), Some(0x1C));
    }

    #[test]
    fn test_read_write_strips_padding() {
        let sim = shared(SimChain::with_idcodes(&[(4, OTHER), (5, XTENSA), (3, 0x0000_0001)]));
        let dev = ChainDevice::new(sim.clone(), 1, &[4, 5, 3], XTENSA, &ChainConfig::default())
            .unwrap();
        let captured = dev.read_write_ir(&BitVec::ones(5)).unwrap();
        assert_eq!(captured, crate::bv![1, 0, 0, 0, 0]);

        // In BYPASS the data register captures zero and is one bit long.
        let captured = dev.read_write_dr(&crate::bv![1, 1, 0]).unwrap();
        assert_eq!(captured.len(), 3);
        let sim = sim.borrow();
        let tdi = &sim.scans().last().unwrap().tdi;
        assert_eq!(tdi, &crate::bv![1, 1, 1, 0, 1]);
    }
}
