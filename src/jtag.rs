// Copyright 2023 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Scan driver for CMSIS-DAP adapters.
//!
//! `jtagdap` tracks the TAP state and fits sequences into DAP packets.
//! This adds the whole-chain scans the rest of the crate is built on, each
//! returning to Run-Test/Idle.

use jtagdap::jtag::JTAG;

use crate::bitvec::BitVec;
use crate::driver::{Result, ScanDriver};

/// Open a scan driver on `jtag`, leaving every TAP in Run-Test/Idle.
pub fn open(mut jtag: JTAG) -> Result<JTAG> {
    jtag.test_logic_reset()?;
    Ok(jtag)
}

impl ScanDriver for JTAG {
    fn scan_ir(&mut self, tdi: &BitVec) -> Result<BitVec> {
        let tdo = self.exchange_ir(tdi.as_slice())?;
        self.enter_run_test_idle()?;
        Ok(BitVec::from(tdo))
    }

    fn scan_dr(&mut self, tdi: &BitVec) -> Result<BitVec> {
        let tdo = self.exchange_dr(tdi.as_slice())?;
        self.enter_run_test_idle()?;
        Ok(BitVec::from(tdo))
    }

    fn test_logic_reset(&mut self) -> Result<()> {
        self.enter_test_logic_reset()?;
        self.enter_run_test_idle()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Error;

    fn driver<T: ScanDriver>() {}

    #[test]
    fn test_jtag_is_scan_driver() {
        driver::<JTAG>();
        driver::<Box<JTAG>>();
    }

    #[test]
    fn test_jtag_error_converts() {
        let err: Error = jtagdap::jtag::Error::BadState.into();
        assert!(matches!(err, Error::JTAG(jtagdap::jtag::Error::BadState)));
        assert_eq!(err.to_string(), "JTAG error");
    }
}
