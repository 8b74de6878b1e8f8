use std::time::Duration;

use thiserror::Error;

use crate::probe::DebugProbeError;

pub const USB_TIMEOUT: Duration = Duration::from_millis(1000);

/// Command ids of the subset of the CMSIS-DAP protocol this driver uses.
pub mod ids {
    pub const DAP_INFO: u8 = 0x00;
    pub const DAP_CONNECT: u8 = 0x02;
    pub const DAP_DISCONNECT: u8 = 0x03;
    pub const DAP_TRANSFER_CONFIGURE: u8 = 0x04;
    pub const DAP_TRANSFER: u8 = 0x05;
    pub const DAP_WRITE_ABORT: u8 = 0x08;
    pub const DAP_SWJ_PINS: u8 = 0x10;
    pub const DAP_SWJ_CLOCK: u8 = 0x11;
    pub const DAP_SWJ_SEQUENCE: u8 = 0x12;
}

/// DAP_Info IDs.
pub mod info {
    pub const PACKET_SIZE: u8 = 0xff;
}

#[derive(Debug, Error)]
pub enum CmsisDapError {
    #[error("Error handling CMSIS-DAP command {command_id:02x}")]
    Send {
        command_id: u8,
        #[source]
        source: DebugProbeError,
    },
    #[error("CMSIS-DAP responded with an error")]
    ErrorResponse,
    #[error("Too much data to be sent in one packet")]
    TooMuchData,
    #[error("Unexpected answer to command")]
    UnexpectedAnswer,
    #[error("Target did not respond to the transfer")]
    NoAcknowledge,
    #[error("Target responded with a FAULT acknowledge")]
    FaultResponse,
    #[error("Target kept responding WAIT")]
    WaitRetriesExceeded,
}

impl From<CmsisDapError> for DebugProbeError {
    fn from(e: CmsisDapError) -> Self {
        DebugProbeError::ProbeSpecific(Box::new(e))
    }
}

/// A CMSIS-DAP probe in either of its two transport flavors.
///
/// V1 devices speak the protocol over HID reports, V2 devices over a
/// vendor bulk interface. The command encoding is identical.
pub enum CmsisDapDevice {
    /// CMSIS-DAP v1 over HID. Stores a HID device handle and the size of
    /// the HID report in bytes.
    V1 {
        handle: hidapi::HidDevice,
        report_size: usize,
    },
    /// CMSIS-DAP v2 over WinUSB/Bulk. Stores an rusb device handle, out/in
    /// endpoint addresses and the maximum packet size in bytes.
    V2 {
        handle: rusb::DeviceHandle<rusb::Context>,
        out_ep: u8,
        in_ep: u8,
        max_packet_size: usize,
    },
}

impl std::fmt::Debug for CmsisDapDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CmsisDapDevice::V1 { report_size, .. } => f
                .debug_struct("CmsisDapDevice::V1")
                .field("report_size", report_size)
                .finish(),
            CmsisDapDevice::V2 {
                out_ep,
                in_ep,
                max_packet_size,
                ..
            } => f
                .debug_struct("CmsisDapDevice::V2")
                .field("out_ep", out_ep)
                .field("in_ep", in_ep)
                .field("max_packet_size", max_packet_size)
                .finish(),
        }
    }
}

impl CmsisDapDevice {
    /// The largest command payload a single packet can carry.
    pub(super) fn packet_size(&self) -> usize {
        match self {
            CmsisDapDevice::V1 { report_size, .. } => *report_size,
            CmsisDapDevice::V2 {
                max_packet_size, ..
            } => *max_packet_size,
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), DebugProbeError> {
        match self {
            CmsisDapDevice::V1 {
                handle,
                report_size,
            } => {
                // HID writes are always the full report, prefixed with a
                // zero report id.
                let mut report = vec![0u8; *report_size + 1];
                report[1..=data.len()].copy_from_slice(data);
                handle
                    .write(&report)
                    .map_err(|e| DebugProbeError::ProbeSpecific(Box::new(e)))?;
                Ok(())
            }
            CmsisDapDevice::V2 { handle, out_ep, .. } => {
                let written = handle
                    .write_bulk(*out_ep, data, USB_TIMEOUT)
                    .map_err(|e| DebugProbeError::Usb(Some(Box::new(e))))?;
                if written != data.len() {
                    return Err(DebugProbeError::Usb(None));
                }
                Ok(())
            }
        }
    }

    fn read(&mut self, data: &mut [u8]) -> Result<usize, DebugProbeError> {
        match self {
            CmsisDapDevice::V1 { handle, .. } => handle
                .read_timeout(data, USB_TIMEOUT.as_millis() as i32)
                .map_err(|e| DebugProbeError::ProbeSpecific(Box::new(e))),
            CmsisDapDevice::V2 { handle, in_ep, .. } => {
                match handle.read_bulk(*in_ep, data, USB_TIMEOUT) {
                    Ok(n) => Ok(n),
                    Err(rusb::Error::Timeout) => Err(DebugProbeError::Timeout),
                    Err(e) => Err(DebugProbeError::Usb(Some(Box::new(e)))),
                }
            }
        }
    }

    /// Drains any pending reports or packets left over from a previous,
    /// possibly crashed, client.
    pub(super) fn drain(&mut self) {
        let mut discard = vec![0u8; self.packet_size().max(64)];
        match self {
            CmsisDapDevice::V1 { handle, .. } => {
                while let Ok(n) = handle.read_timeout(&mut discard, 1) {
                    if n == 0 {
                        break;
                    }
                }
            }
            CmsisDapDevice::V2 { handle, in_ep, .. } => {
                while let Ok(n) =
                    handle.read_bulk(*in_ep, &mut discard, Duration::from_millis(1))
                {
                    if n == 0 {
                        break;
                    }
                }
            }
        }
    }
}

/// Sends a single command packet and returns the response payload with the
/// echoed command id stripped.
pub(super) fn send_command(
    device: &mut CmsisDapDevice,
    command_id: u8,
    request: &[u8],
) -> Result<Vec<u8>, CmsisDapError> {
    let packet_size = device.packet_size();
    if request.len() + 1 > packet_size {
        return Err(CmsisDapError::TooMuchData);
    }

    let mut packet = Vec::with_capacity(request.len() + 1);
    packet.push(command_id);
    packet.extend_from_slice(request);

    let send = |e| CmsisDapError::Send {
        command_id,
        source: e,
    };

    device.write(&packet).map_err(send)?;

    let mut response = vec![0u8; packet_size];
    let read = device.read(&mut response).map_err(send)?;
    response.truncate(read);

    if response.first() != Some(&command_id) {
        return Err(CmsisDapError::UnexpectedAnswer);
    }
    response.remove(0);

    Ok(response)
}
