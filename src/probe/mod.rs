pub mod cmsisdap;
pub mod fake_probe;
pub mod ftdi;
pub mod jlink;
mod memory;
mod stlink;
mod swd;
mod usb;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use fake_probe::FakeProbe;

#[derive(Error, Debug)]
pub enum DebugProbeError {
    #[error("USB Communication Error")]
    Usb(#[source] Option<Box<dyn std::error::Error + Send + Sync>>),
    #[error("Probe could not be created")]
    ProbeCouldNotBeCreated(#[from] ProbeCreationError),
    #[error("The firmware on the probe is outdated")]
    ProbeFirmwareOutdated,
    #[error("Operation timed out")]
    Timeout,
    #[error("An error specific to a probe type occurred")]
    ProbeSpecific(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("The requested speed setting ({0} kHz) is not supported by the probe")]
    UnsupportedSpeed(u32),
    #[error("You need to be attached to the target to perform this action")]
    NotAttached,
    #[error("You need to be detached from the target to perform this action")]
    Attached,
    #[error("Command not supported by probe")]
    CommandNotSupportedByProbe,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum ProbeCreationError {
    #[error("Probe was not found.")]
    NotFound,
    #[error("Probe is already in use by another process.")]
    Busy,
    #[error("USB device could not be opened. Please check the permissions.")]
    CouldNotOpen,
    #[error("{0}")]
    HidApi(#[from] hidapi::HidError),
    #[error("{0}")]
    Rusb(#[from] rusb::Error),
    #[error("An error specific to a probe type occurred: {0}")]
    ProbeSpecific(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("{0}")]
    Other(&'static str),
}

/// The port of the debug-access-port address space a register access targets.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PortType {
    DebugPort,
    AccessPort,
}

/// The uniform primitive set every probe family implements.
///
/// Each adapter hides its wire framing (CMSIS-DAP packets, the ST-Link
/// command set, ...) behind these operations. Transport timeouts are
/// reported as [`DebugProbeError::Timeout`], protocol-level faults as
/// [`DebugProbeError::ProbeSpecific`], so callers can decide retry vs abort.
pub trait DebugProbe: Send + fmt::Debug {
    /// Get human readable name for the probe.
    fn get_name(&self) -> &str;

    /// The currently configured debug-clock frequency in kHz.
    fn speed(&self) -> u32;

    /// Set the debug-clock frequency in kHz.
    ///
    /// If the requested speed is not supported,
    /// `DebugProbeError::UnsupportedSpeed` is returned; callers that treat
    /// the speed as a hint are expected to ignore that error.
    fn set_speed(&mut self, speed_khz: u32) -> Result<u32, DebugProbeError>;

    /// Enter debug mode: target power-up and debug-port reset.
    fn attach(&mut self) -> Result<(), DebugProbeError>;

    /// Leave debug mode.
    fn detach(&mut self) -> Result<(), DebugProbeError>;

    /// Hard-reset the target device.
    fn target_reset(&mut self) -> Result<(), DebugProbeError>;

    /// Read a register of the debug-access-port address space.
    fn read_register(&mut self, port: PortType, addr: u8) -> Result<u32, DebugProbeError>;

    /// Write a register of the debug-access-port address space.
    fn write_register(&mut self, port: PortType, addr: u8, value: u32)
        -> Result<(), DebugProbeError>;

    /// Read target memory into `data`, starting at `address`.
    fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), DebugProbeError>;

    /// Write `data` to target memory, starting at `address`.
    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), DebugProbeError>;

    /// The largest memory block this probe can move in one transfer.
    fn max_block_size(&self) -> usize;
}

/// The Probe struct is a generic wrapper over the different
/// probe families supported.
#[derive(Debug)]
pub struct Probe {
    inner: Box<dyn DebugProbe>,
    attached: bool,
}

impl Probe {
    pub fn new(probe: impl DebugProbe + 'static) -> Self {
        Self {
            inner: Box::new(probe),
            attached: false,
        }
    }

    pub fn from_specific_probe(probe: Box<dyn DebugProbe>) -> Self {
        Probe {
            inner: probe,
            attached: false,
        }
    }

    /// Get a list of all debug probes found, over all supported families.
    ///
    /// Enumeration failure on the underlying transport yields an empty
    /// result: absence of probes is a normal state, not a fault. Short ids
    /// are assigned in enumeration order and are only unique within one
    /// call's result set.
    pub fn list_all() -> Vec<DebugProbeInfo> {
        let mut list = cmsisdap::tools::list_cmsisdap_devices();
        list.extend(stlink::tools::list_stlink_devices());
        list.extend(jlink::tools::list_jlink_devices());
        list.extend(ftdi::tools::list_ftdi_devices());

        assign_short_ids(&mut list);

        list
    }

    /// Create a `Probe` from a selector. Every family gets a chance to claim
    /// the device; a family that does not recognize the VID/PID reports
    /// `NotFound` and the next one is tried.
    pub fn open(selector: impl Into<DebugProbeSelector> + Clone) -> Result<Self, DebugProbeError> {
        match cmsisdap::CmsisDap::new_from_selector(selector.clone()) {
            Ok(link) => return Ok(Probe { inner: link, attached: false }),
            Err(DebugProbeError::ProbeCouldNotBeCreated(ProbeCreationError::NotFound)) => {}
            Err(e) => return Err(e),
        };
        match stlink::StLink::new_from_selector(selector.clone()) {
            Ok(link) => return Ok(Probe { inner: link, attached: false }),
            Err(DebugProbeError::ProbeCouldNotBeCreated(ProbeCreationError::NotFound)) => {}
            Err(e) => return Err(e),
        };
        match jlink::JLink::new_from_selector(selector.clone()) {
            Ok(link) => return Ok(Probe { inner: link, attached: false }),
            Err(DebugProbeError::ProbeCouldNotBeCreated(ProbeCreationError::NotFound)) => {}
            Err(e) => return Err(e),
        };
        match ftdi::FtdiProbe::new_from_selector(selector) {
            Ok(link) => return Ok(Probe { inner: link, attached: false }),
            Err(DebugProbeError::ProbeCouldNotBeCreated(ProbeCreationError::NotFound)) => {}
            Err(e) => return Err(e),
        };

        Err(DebugProbeError::ProbeCouldNotBeCreated(
            ProbeCreationError::NotFound,
        ))
    }

    /// Get human readable name for the probe.
    pub fn get_name(&self) -> String {
        self.inner.get_name().to_string()
    }

    /// Enters debug mode.
    pub fn attach(&mut self) -> Result<(), DebugProbeError> {
        self.inner.attach()?;
        self.attached = true;
        Ok(())
    }

    /// Leave debug mode.
    pub fn detach(&mut self) -> Result<(), DebugProbeError> {
        self.attached = false;
        self.inner.detach()?;
        Ok(())
    }

    /// Resets the target device.
    pub fn target_reset(&mut self) -> Result<(), DebugProbeError> {
        self.inner.target_reset()
    }

    /// Configure protocol speed to use in kHz.
    pub fn set_speed(&mut self, speed_khz: u32) -> Result<u32, DebugProbeError> {
        if !self.attached {
            self.inner.set_speed(speed_khz)
        } else {
            Err(DebugProbeError::Attached)
        }
    }

    /// Configured protocol speed in kHz.
    pub fn speed_khz(&self) -> u32 {
        self.inner.speed()
    }

    pub fn read_register(&mut self, port: PortType, addr: u8) -> Result<u32, DebugProbeError> {
        self.ensure_attached()?;
        self.inner.read_register(port, addr)
    }

    pub fn write_register(
        &mut self,
        port: PortType,
        addr: u8,
        value: u32,
    ) -> Result<(), DebugProbeError> {
        self.ensure_attached()?;
        self.inner.write_register(port, addr, value)
    }

    /// Read a 32 bit word from `address`, which has to be 4-byte aligned.
    pub fn read_word_32(&mut self, address: u32) -> Result<u32, DebugProbeError> {
        let mut buf = [0u8; 4];
        self.read_memory(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Write a 32 bit word to `address`, which has to be 4-byte aligned.
    pub fn write_word_32(&mut self, address: u32, value: u32) -> Result<(), DebugProbeError> {
        self.write_memory(address, &value.to_le_bytes())
    }

    pub fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), DebugProbeError> {
        self.ensure_attached()?;
        self.inner.read_memory(address, data)
    }

    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), DebugProbeError> {
        self.ensure_attached()?;
        self.inner.write_memory(address, data)
    }

    /// The largest memory block the active adapter can move in one transfer.
    pub fn max_block_size(&self) -> usize {
        self.inner.max_block_size()
    }

    fn ensure_attached(&self) -> Result<(), DebugProbeError> {
        if self.attached {
            Ok(())
        } else {
            Err(DebugProbeError::NotAttached)
        }
    }
}

fn assign_short_ids(list: &mut [DebugProbeInfo]) {
    for (short_id, probe) in list.iter_mut().enumerate() {
        probe.short_id = short_id as u32;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebugProbeType {
    CmsisDap,
    StLink,
    Ftdi,
    JLink,
}

/// Identifies a physical probe found during discovery, not a live
/// connection. Stale descriptors (device unplugged since discovery) fail
/// to open with `ProbeUnavailable`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugProbeInfo {
    /// Human readable name of the probe, not part of the wire contract.
    #[serde(skip)]
    pub identifier: String,
    #[serde(rename = "vid")]
    pub vendor_id: u16,
    #[serde(rename = "pid")]
    pub product_id: u16,
    #[serde(rename = "serialNum")]
    pub serial_number: Option<String>,
    pub probe_type: DebugProbeType,
    /// Ordinal of the probe within one discovery call's result set.
    pub short_id: u32,
}

impl fmt::Debug for DebugProbeInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} (VID: {:04x}, PID: {:04x}, {}{:?})",
            self.identifier,
            self.vendor_id,
            self.product_id,
            self.serial_number
                .clone()
                .map_or("".to_owned(), |v| format!("Serial: {}, ", v)),
            self.probe_type
        )
    }
}

impl DebugProbeInfo {
    /// Creates a new info struct that uniquely identifies a probe.
    pub fn new<S: Into<String>>(
        identifier: S,
        vendor_id: u16,
        product_id: u16,
        serial_number: Option<String>,
        probe_type: DebugProbeType,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            vendor_id,
            product_id,
            serial_number,
            probe_type,
            short_id: 0,
        }
    }

    /// Open the probe described by this `DebugProbeInfo`.
    pub fn open(&self) -> Result<Probe, DebugProbeError> {
        Probe::open(self)
    }
}

/// The result of one discovery call.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Probes {
    pub probes: Vec<DebugProbeInfo>,
}

#[derive(Error, Debug)]
pub enum DebugProbeSelectorParseError {
    #[error("The VID or PID could not be parsed: {0}")]
    ParseInt(#[from] std::num::ParseIntError),
    #[error("Please use a string in the form `VID:PID:<Serial>` where Serial is optional.")]
    Format,
}

/// A struct to describe the way a probe should be selected.
#[derive(Debug, Clone)]
pub struct DebugProbeSelector {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
}

impl TryFrom<&str> for DebugProbeSelector {
    type Error = DebugProbeSelectorParseError;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let split = value.split(':').collect::<Vec<_>>();
        let mut selector = if split.len() > 1 {
            DebugProbeSelector {
                vendor_id: u16::from_str_radix(split[0], 16)?,
                product_id: u16::from_str_radix(split[1], 16)?,
                serial_number: None,
            }
        } else {
            return Err(DebugProbeSelectorParseError::Format);
        };

        if split.len() == 3 {
            selector.serial_number = Some(split[2].to_string());
        }

        Ok(selector)
    }
}

impl std::str::FromStr for DebugProbeSelector {
    type Err = DebugProbeSelectorParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s)
    }
}

impl From<DebugProbeInfo> for DebugProbeSelector {
    fn from(info: DebugProbeInfo) -> Self {
        DebugProbeSelector {
            vendor_id: info.vendor_id,
            product_id: info.product_id,
            serial_number: info.serial_number,
        }
    }
}

impl From<&DebugProbeInfo> for DebugProbeSelector {
    fn from(info: &DebugProbeInfo) -> Self {
        DebugProbeSelector {
            vendor_id: info.vendor_id,
            product_id: info.product_id,
            serial_number: info.serial_number.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_selector_with_serial() {
        let selector: DebugProbeSelector = "0483:3748:0670FF55".parse().unwrap();
        assert_eq!(selector.vendor_id, 0x0483);
        assert_eq!(selector.product_id, 0x3748);
        assert_eq!(selector.serial_number.as_deref(), Some("0670FF55"));
    }

    #[test]
    fn parse_selector_without_serial() {
        let selector: DebugProbeSelector = "1366:0101".parse().unwrap();
        assert_eq!(selector.vendor_id, 0x1366);
        assert_eq!(selector.product_id, 0x0101);
        assert!(selector.serial_number.is_none());
    }

    #[test]
    fn parse_selector_rejects_bare_vid() {
        assert!("0483".parse::<DebugProbeSelector>().is_err());
    }

    #[test]
    fn short_ids_follow_enumeration_order() {
        let mut list = vec![
            DebugProbeInfo::new("ST-Link V2", 0x0483, 0x3748, None, DebugProbeType::StLink),
            DebugProbeInfo::new(
                "J-Link",
                0x1366,
                0x0101,
                Some("123456".into()),
                DebugProbeType::JLink,
            ),
            DebugProbeInfo::new("FTDI", 0x0403, 0x6010, None, DebugProbeType::Ftdi),
        ];
        assign_short_ids(&mut list);

        assert_eq!(
            list.iter().map(|p| p.short_id).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(list[0].probe_type, DebugProbeType::StLink);
    }

    #[test]
    fn probe_info_serializes_camel_case() {
        let mut probe =
            DebugProbeInfo::new("ST-Link V2", 0x0483, 0x3748, Some("0670FF55".into()), DebugProbeType::StLink);
        probe.short_id = 3;

        let json = serde_json::to_value(&probe).unwrap();
        assert_eq!(json["vid"], 0x0483);
        assert_eq!(json["pid"], 0x3748);
        assert_eq!(json["serialNum"], "0670FF55");
        assert_eq!(json["probeType"], "StLink");
        assert_eq!(json["shortId"], 3);
        // The human readable name stays off the wire.
        assert!(json.get("identifier").is_none());
    }
}
