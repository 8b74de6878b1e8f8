use crate::probe::usb::{filter_devices, read_serial_number};
use crate::probe::{DebugProbeInfo, DebugProbeType};

use super::USB_VID;

/// Product ids SEGGER assigns to plain J-Link probes.
fn is_jlink_pid(pid: u16) -> bool {
    (0x0101..=0x0108).contains(&pid) || (0x1001..=0x1061).contains(&pid)
}

pub fn list_jlink_devices() -> Vec<DebugProbeInfo> {
    filter_devices(
        |device| {
            device
                .device_descriptor()
                .map(|d| d.vendor_id() == USB_VID && is_jlink_pid(d.product_id()))
                .unwrap_or(false)
        },
        |device| {
            let descriptor = device.device_descriptor().ok()?;
            Some(DebugProbeInfo::new(
                "J-Link",
                descriptor.vendor_id(),
                descriptor.product_id(),
                read_serial_number(device),
                DebugProbeType::JLink,
            ))
        },
    )
}
