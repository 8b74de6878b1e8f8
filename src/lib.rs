//! Probe discovery and firmware provisioning for ARM microcontrollers.
//!
//! The engine talks to targets through USB debug probes (CMSIS-DAP,
//! ST-Link, J-Link, FTDI), drives the debug port directly and carries its
//! own flash handling, so no vendor tooling is required on the host.
//!
//! The high level entry points live in [`ops`]:
//!
//! - [`ops::list_all_probes`] enumerates connected probes,
//! - [`ops::erase_target`] blanks a chip and verifies it,
//! - [`ops::identify_target`] reads the unique id and flash size,
//! - [`ops::flash_firmware_file`] programs a BIN, HEX or ELF image and
//!   verifies it byte for byte.
//!
//! Underneath, a [`probe::Probe`] wraps one of the per-family adapters
//! behind a uniform register/memory interface, a [`session::Session`]
//! binds an attached probe to a verified [`target::TargetFamily`], and
//! [`flashing`] stages image bytes and moves them through the halt,
//! erase, program, verify, resume sequence.

pub mod error;
pub mod flashing;
pub mod ops;
pub mod probe;
pub mod session;
pub mod target;

pub use error::Error;
pub use ops::{
    erase_target, flash_firmware_file, identify_target, list_all_probes, FlashOptions,
};
pub use probe::{DebugProbeInfo, DebugProbeSelector, DebugProbeType, Probe, Probes};
pub use session::Session;
pub use target::{TargetFamily, TargetIdentity};
