use crate::probe::usb::{filter_devices, read_serial_number};
use crate::probe::{DebugProbeInfo, DebugProbeType};

use super::{MPSSE_PIDS, USB_VID};

pub fn list_ftdi_devices() -> Vec<DebugProbeInfo> {
    filter_devices(
        |device| {
            device
                .device_descriptor()
                .map(|d| d.vendor_id() == USB_VID && MPSSE_PIDS.contains(&d.product_id()))
                .unwrap_or(false)
        },
        |device| {
            let descriptor = device.device_descriptor().ok()?;
            Some(DebugProbeInfo::new(
                "FTDI",
                descriptor.vendor_id(),
                descriptor.product_id(),
                read_serial_number(device),
                DebugProbeType::Ftdi,
            ))
        },
    )
}
