use rusb::{Context, Device};

use crate::probe::usb::{filter_devices, read_serial_number};
use crate::probe::{DebugProbeInfo, DebugProbeType};

use super::usb_interface::{USB_PID_EP_MAP, USB_VID};

pub(super) fn is_stlink_device(device: &Device<Context>) -> bool {
    // Check the VID/PID.
    if let Ok(descriptor) = device.device_descriptor() {
        (descriptor.vendor_id() == USB_VID)
            && (USB_PID_EP_MAP.contains_key(&descriptor.product_id()))
    } else {
        false
    }
}

pub fn list_stlink_devices() -> Vec<DebugProbeInfo> {
    filter_devices(is_stlink_device, |device| {
        let descriptor = device.device_descriptor().ok()?;
        Some(DebugProbeInfo::new(
            format!(
                "ST-Link {}",
                &USB_PID_EP_MAP[&descriptor.product_id()].version_name
            ),
            descriptor.vendor_id(),
            descriptor.product_id(),
            read_serial_number(device),
            DebugProbeType::StLink,
        ))
    })
}
