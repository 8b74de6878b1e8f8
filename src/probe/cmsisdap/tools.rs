use rusb::{Context, Device, UsbContext};

use super::commands::CmsisDapDevice;
use crate::probe::usb::{device_matches, read_serial_number};
use crate::probe::{DebugProbeInfo, DebugProbeSelector, DebugProbeType, ProbeCreationError};

/// Finds all CMSIS-DAP devices, either v1 (HID) or v2 (WinUSB Bulk).
///
/// v2 devices are enumerated first so they are preferred when a probe
/// offers both interfaces under the same VID/PID/serial.
pub fn list_cmsisdap_devices() -> Vec<DebugProbeInfo> {
    tracing::debug!("Searching for CMSIS-DAP probes using libusb");
    let mut probes = match Context::new().and_then(|ctx| ctx.devices()) {
        Ok(devices) => devices
            .iter()
            .filter_map(|device| get_cmsisdap_info(&device))
            .collect(),
        Err(_) => vec![],
    };

    tracing::debug!(
        "Found {} CMSIS-DAP probes using libusb, searching HID",
        probes.len()
    );

    if let Ok(api) = hidapi::HidApi::new() {
        for device in api.device_list() {
            if let Some(info) = get_cmsisdap_hid_info(device) {
                if !probes.iter().any(|p| {
                    p.vendor_id == info.vendor_id
                        && p.product_id == info.product_id
                        && p.serial_number == info.serial_number
                }) {
                    tracing::trace!("Adding new HID-only probe {:?}", info);
                    probes.push(info)
                }
            }
        }
    }

    tracing::debug!("Found {} CMSIS-DAP probes total", probes.len());
    probes
}

/// Checks if a given device matches a CMSIS-DAP v2 probe: any interface
/// whose string descriptor contains "CMSIS-DAP".
fn get_cmsisdap_info(device: &Device<Context>) -> Option<DebugProbeInfo> {
    let descriptor = device.device_descriptor().ok()?;
    let handle = device.open().ok()?;
    let timeout = std::time::Duration::from_millis(100);
    let language = *handle.read_languages(timeout).ok()?.first()?;

    let config = device.active_config_descriptor().ok()?;
    let is_cmsisdap = config.interfaces().any(|interface| {
        interface.descriptors().any(|desc| {
            handle
                .read_interface_string(language, &desc, timeout)
                .map(|s| s.contains("CMSIS-DAP"))
                .unwrap_or(false)
        })
    });

    if !is_cmsisdap {
        return None;
    }

    Some(DebugProbeInfo::new(
        handle
            .read_product_string(language, &descriptor, timeout)
            .unwrap_or_else(|_| "CMSIS-DAP".into()),
        descriptor.vendor_id(),
        descriptor.product_id(),
        read_serial_number(device),
        DebugProbeType::CmsisDap,
    ))
}

/// Checks if a given HID device is a CMSIS-DAP v1 probe, based on the
/// product string.
fn get_cmsisdap_hid_info(device: &hidapi::DeviceInfo) -> Option<DebugProbeInfo> {
    let prod_str = device.product_string()?;
    if !prod_str.contains("CMSIS-DAP") {
        return None;
    }

    Some(DebugProbeInfo::new(
        prod_str,
        device.vendor_id(),
        device.product_id(),
        device.serial_number().map(Into::into),
        DebugProbeType::CmsisDap,
    ))
}

/// Attempts to open the device matching `selector` as CMSIS-DAP v2 over a
/// bulk interface, falling back to v1 over HID.
pub(super) fn open_device_from_selector(
    selector: &DebugProbeSelector,
) -> Result<CmsisDapDevice, ProbeCreationError> {
    if let Some(device) = open_v2_device(selector) {
        return Ok(device);
    }

    open_v1_device(selector)
}

fn open_v2_device(selector: &DebugProbeSelector) -> Option<CmsisDapDevice> {
    let context = Context::new().ok()?;
    let device = context
        .devices()
        .ok()?
        .iter()
        .find(|device| device_matches(device, selector))?;

    let handle = device.open().ok()?;
    let timeout = std::time::Duration::from_millis(100);
    let language = *handle.read_languages(timeout).ok()?.first()?;
    let config = device.active_config_descriptor().ok()?;

    // Look for a vendor-specific interface whose string marks it as
    // CMSIS-DAP, with a bulk out/in endpoint pair.
    for interface in config.interfaces() {
        for desc in interface.descriptors() {
            let is_cmsisdap = handle
                .read_interface_string(language, &desc, timeout)
                .map(|s| s.contains("CMSIS-DAP"))
                .unwrap_or(false);
            if !is_cmsisdap || desc.class_code() != 0xff {
                continue;
            }

            let mut out_ep = None;
            let mut in_ep = None;
            let mut max_packet_size = 64usize;
            for endpoint in desc.endpoint_descriptors() {
                if endpoint.transfer_type() != rusb::TransferType::Bulk {
                    continue;
                }
                match endpoint.direction() {
                    rusb::Direction::Out => out_ep = Some(endpoint.address()),
                    rusb::Direction::In => {
                        in_ep = Some(endpoint.address());
                        max_packet_size = endpoint.max_packet_size() as usize;
                    }
                }
            }

            if let (Some(out_ep), Some(in_ep)) = (out_ep, in_ep) {
                let handle = device.open().ok()?;
                handle.claim_interface(desc.interface_number()).ok()?;
                tracing::debug!(
                    "Opened CMSIS-DAP v2 device on interface {}",
                    desc.interface_number()
                );
                return Some(CmsisDapDevice::V2 {
                    handle,
                    out_ep,
                    in_ep,
                    max_packet_size,
                });
            }
        }
    }

    None
}

fn open_v1_device(selector: &DebugProbeSelector) -> Result<CmsisDapDevice, ProbeCreationError> {
    // A host without a HID stack has no HID probes.
    let api = hidapi::HidApi::new().map_err(|_| ProbeCreationError::NotFound)?;

    let device_info = api
        .device_list()
        .find(|info| {
            info.vendor_id() == selector.vendor_id
                && info.product_id() == selector.product_id
                && match &selector.serial_number {
                    Some(serial) => info.serial_number() == Some(serial.as_str()),
                    None => true,
                }
                && info
                    .product_string()
                    .map(|s| s.contains("CMSIS-DAP"))
                    .unwrap_or(false)
        })
        .ok_or(ProbeCreationError::NotFound)?;

    let handle = device_info.open_device(&api)?;

    Ok(CmsisDapDevice::V1 {
        handle,
        // The protocol does not advertise the report size over HID; 64 is
        // what every known v1 firmware uses.
        report_size: 64,
    })
}
