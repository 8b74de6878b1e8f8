use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::probe::usb::UsbDevice;
use crate::probe::{DebugProbeError, DebugProbeSelector, ProbeCreationError};

use super::StlinkError;

/// The USB Command packet size.
const CMD_LEN: usize = 16;

/// The USB VendorID.
pub const USB_VID: u16 = 0x0483;

pub const TIMEOUT: Duration = Duration::from_millis(1000);

/// Map of USB PID to firmware version name and device endpoints.
pub static USB_PID_EP_MAP: Lazy<HashMap<u16, StLinkInfo>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(0x3748, StLinkInfo::new("V2", 0x3748, 0x02, 0x81));
    m.insert(0x374b, StLinkInfo::new("V2-1", 0x374b, 0x01, 0x81));
    m.insert(0x374a, StLinkInfo::new("V2-1", 0x374a, 0x01, 0x81)); // Audio
    m.insert(0x3742, StLinkInfo::new("V2-1", 0x3742, 0x01, 0x81)); // No MSD
    m.insert(0x374e, StLinkInfo::new("V3", 0x374e, 0x01, 0x81));
    m.insert(0x374f, StLinkInfo::new("V3", 0x374f, 0x01, 0x81)); // Bridge
    m.insert(0x3753, StLinkInfo::new("V3", 0x3753, 0x01, 0x81)); // 2VCP
    m
});

/// A helper struct to match ST-Link device info.
#[derive(Clone, Default, Debug)]
pub struct StLinkInfo {
    pub version_name: String,
    pub usb_pid: u16,
    ep_out: u8,
    ep_in: u8,
}

impl StLinkInfo {
    pub fn new<V: Into<String>>(version_name: V, usb_pid: u16, ep_out: u8, ep_in: u8) -> Self {
        Self {
            version_name: version_name.into(),
            usb_pid,
            ep_out,
            ep_in,
        }
    }
}

/// The transport seam of the ST-Link driver: command/data exchange over
/// the probe's bulk endpoints. Tests substitute a mock for this.
pub trait StLinkUsb: fmt::Debug + Send {
    /// Writes to the out EP and reads back data if needed.
    /// First the `cmd` is sent, zero-padded to the command length.
    /// In a second step `write_data` is transmitted.
    /// And lastly, data will be read back until `read_data` is filled.
    fn write(
        &mut self,
        cmd: &[u8],
        write_data: &[u8],
        read_data: &mut [u8],
        timeout: Duration,
    ) -> Result<(), DebugProbeError>;

    /// Reset the USB device. This can be used to recover when the
    /// ST-Link does not respond to USB requests.
    fn reset(&mut self) -> Result<(), DebugProbeError>;
}

pub struct StLinkUsbDevice {
    device: UsbDevice,
    pub info: StLinkInfo,
}

impl fmt::Debug for StLinkUsbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StLinkUsbDevice")
            .field("info", &self.info)
            .finish()
    }
}

impl StLinkUsbDevice {
    /// Creates and initializes a new USB device.
    pub fn new_from_selector(
        selector: impl Into<DebugProbeSelector>,
    ) -> Result<Self, DebugProbeError> {
        let selector = selector.into();

        if selector.vendor_id != USB_VID {
            return Err(ProbeCreationError::NotFound.into());
        }
        let info = USB_PID_EP_MAP
            .get(&selector.product_id)
            .ok_or(ProbeCreationError::NotFound)?
            .clone();

        let device = UsbDevice::open(&selector, 0, info.ep_out, info.ep_in)?;

        tracing::debug!("Successfully attached to ST-Link.");

        Ok(Self { device, info })
    }
}

impl StLinkUsb for StLinkUsbDevice {
    fn write(
        &mut self,
        cmd: &[u8],
        write_data: &[u8],
        read_data: &mut [u8],
        timeout: Duration,
    ) -> Result<(), DebugProbeError> {
        tracing::trace!("Sending command {:x?} to ST-Link, timeout: {:?}", cmd, timeout);

        if cmd.len() > CMD_LEN {
            return Err(StlinkError::CommandTooLong.into());
        }

        // Command phase: all commands are padded to a fixed frame length.
        let mut padded_cmd = [0u8; CMD_LEN];
        padded_cmd[..cmd.len()].copy_from_slice(cmd);

        self.device.write_bulk(&padded_cmd, timeout)?;

        // Optional data out phase.
        if !write_data.is_empty() {
            self.device.write_bulk(write_data, timeout)?;
        }

        // Optional data in phase.
        if !read_data.is_empty() {
            self.device.read_bulk(read_data, timeout)?;
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<(), DebugProbeError> {
        tracing::debug!("Resetting USB device of ST-Link.");
        self.device.reset()
    }
}
