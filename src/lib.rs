// Copyright 2023 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! xtdap
//!
//! Xtensa on-chip debug over JTAG using CMSIS-DAP probes.
//!
//! Layers, from the wire up: `jtag` drives the probe, `chain` isolates one
//! device on a multi-device scan chain, `protocol` reaches the debug
//! registers of an Xtensa core, and `ocd` halts the core and injects
//! instructions into it. `sim` provides a simulated scan chain for tests.

#[macro_use]
pub mod bitvec;

pub mod driver;
pub mod sim;
pub mod chain;
pub mod protocol;
pub mod program;
pub mod ocd;
pub mod jtag;

pub use chain::{ChainConfig, ChainDevice, ChainInfo, ChainTopology, IdCode};
pub use driver::ScanDriver;
pub use jtagdap::jtag::JTAG;
pub use ocd::{Ocd, OcdState, PollConfig, Width};
pub use protocol::{DebugRegisterProtocol, Direct, Routed, Status};
