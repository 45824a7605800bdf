// Copyright 2023 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! The scan driver capability the rest of the crate is built on.
//!
//! A driver shifts complete instruction or data register scans through the
//! whole chain and returns what came out of TDO. It has no knowledge of how
//! many devices are on the chain. Implementations include the CMSIS-DAP
//! `jtagdap::jtag::JTAG` driver and the `sim::SimChain` simulator.

use crate::bitvec::{BitVec, Error as BitVecError};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("JTAG error")]
    JTAG(#[from] jtagdap::jtag::Error),
    #[error("Probe returned {received} bits for a {expected} bit scan.")]
    UnexpectedLength { expected: usize, received: usize },
    #[error("Bit vector error")]
    BitVec(#[from] BitVecError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Bit-serial access to a JTAG scan chain.
///
/// Every method starts and finishes in Run-Test/Idle. The returned vector is
/// always the same length as `tdi`, with the first captured bit at index 0.
pub trait ScanDriver {
    /// Shift `tdi` through the instruction register chain, returning TDO.
    fn scan_ir(&mut self, tdi: &BitVec) -> Result<BitVec>;

    /// Shift `tdi` through the data register chain, returning TDO.
    fn scan_dr(&mut self, tdi: &BitVec) -> Result<BitVec>;

    /// Move every TAP on the chain to Test-Logic-Reset and then Run-Test/Idle.
    ///
    /// After this the data register of every device holds its IDCODE
    /// (or a bypass bit for devices without one).
    fn test_logic_reset(&mut self) -> Result<()>;
}

impl<T: ScanDriver + ?Sized> ScanDriver for Box<T> {
    fn scan_ir(&mut self, tdi: &BitVec) -> Result<BitVec> {
        (**self).scan_ir(tdi)
    }

    fn scan_dr(&mut self, tdi: &BitVec) -> Result<BitVec> {
        (**self).scan_dr(tdi)
    }

    fn test_logic_reset(&mut self) -> Result<()> {
        (**self).test_logic_reset()
    }
}

impl<T: ScanDriver + ?Sized> ScanDriver for &mut T {
    fn scan_ir(&mut self, tdi: &BitVec) -> Result<BitVec> {
        (**self).scan_ir(tdi)
    }

    fn scan_dr(&mut self, tdi: &BitVec) -> Result<BitVec> {
        (**self).scan_dr(tdi)
    }

    fn test_logic_reset(&mut self) -> Result<()> {
        (**self).test_logic_reset()
    }
}

/// Check a driver returned exactly as many bits as were shifted in.
pub(crate) fn check_length(tdi: &BitVec, tdo: &BitVec) -> Result<()> {
    if tdi.len() == tdo.len() {
        Ok(())
    } else {
        Err(Error::UnexpectedLength { expected: tdi.len(), received: tdo.len() })
    }
}
