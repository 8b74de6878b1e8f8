//! Shared rusb plumbing below the protocol adapters.
//!
//! This is the byte-oriented endpoint abstraction: match a device by
//! VID/PID/serial, claim it exclusively, move bytes over bulk endpoints
//! with a bounded timeout. Everything protocol-shaped lives above it.

use std::time::Duration;

use rusb::{Context, Device, DeviceHandle, UsbContext};

use super::{DebugProbeError, DebugProbeSelector, ProbeCreationError};

const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Returns the serial number string of a device, if it has one and it is
/// readable without special permissions.
pub(crate) fn read_serial_number<T: UsbContext>(device: &Device<T>) -> Option<String> {
    let descriptor = device.device_descriptor().ok()?;
    let handle = device.open().ok()?;
    let language = *handle.read_languages(SERIAL_READ_TIMEOUT).ok()?.first()?;
    handle
        .read_serial_number_string(language, &descriptor, SERIAL_READ_TIMEOUT)
        .ok()
}

/// Checks whether `device` matches the selector, including the serial
/// number when the selector carries one.
pub(crate) fn device_matches<T: UsbContext>(
    device: &Device<T>,
    selector: &DebugProbeSelector,
) -> bool {
    let Ok(descriptor) = device.device_descriptor() else {
        return false;
    };

    if descriptor.vendor_id() != selector.vendor_id
        || descriptor.product_id() != selector.product_id
    {
        return false;
    }

    match &selector.serial_number {
        Some(serial) => read_serial_number(device).as_deref() == Some(serial.as_str()),
        None => true,
    }
}

/// An exclusively claimed USB device with a pair of bulk endpoints.
///
/// Only one session per physical probe can exist at a time: the interface
/// claim fails with [`ProbeCreationError::Busy`] while another handle is
/// open.
pub(crate) struct UsbDevice {
    handle: DeviceHandle<Context>,
    interface: u8,
    ep_out: u8,
    ep_in: u8,
}

impl std::fmt::Debug for UsbDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbDevice")
            .field("interface", &self.interface)
            .field("ep_out", &self.ep_out)
            .field("ep_in", &self.ep_in)
            .finish()
    }
}

impl UsbDevice {
    /// Opens the first device matching `selector` and claims `interface`.
    pub(crate) fn open(
        selector: &DebugProbeSelector,
        interface: u8,
        ep_out: u8,
        ep_in: u8,
    ) -> Result<Self, ProbeCreationError> {
        let context = Context::new()?;

        tracing::debug!("Acquired libusb context.");

        let device = context
            .devices()?
            .iter()
            .find(|device| device_matches(device, selector))
            .ok_or(ProbeCreationError::NotFound)?;

        let handle = device.open().map_err(|e| match e {
            rusb::Error::Busy => ProbeCreationError::Busy,
            rusb::Error::Access => ProbeCreationError::CouldNotOpen,
            other => ProbeCreationError::Rusb(other),
        })?;

        tracing::debug!("Acquired handle for probe.");

        handle.claim_interface(interface).map_err(|e| match e {
            rusb::Error::Busy => ProbeCreationError::Busy,
            other => ProbeCreationError::Rusb(other),
        })?;

        tracing::debug!("Claimed interface {} of USB device.", interface);

        Ok(Self {
            handle,
            interface,
            ep_out,
            ep_in,
        })
    }

    /// Writes `data` to the out endpoint, requiring the full buffer to be
    /// accepted.
    pub(crate) fn write_bulk(
        &mut self,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), DebugProbeError> {
        let written = self
            .handle
            .write_bulk(self.ep_out, data, timeout)
            .map_err(map_rusb_io_error)?;

        if written != data.len() {
            return Err(DebugProbeError::Usb(None));
        }
        Ok(())
    }

    /// Reads from the in endpoint until `data` is filled.
    pub(crate) fn read_bulk(
        &mut self,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<(), DebugProbeError> {
        let mut offset = 0;
        while offset < data.len() {
            let read = self
                .handle
                .read_bulk(self.ep_in, &mut data[offset..], timeout)
                .map_err(map_rusb_io_error)?;
            if read == 0 {
                return Err(DebugProbeError::Usb(None));
            }
            offset += read;
        }
        Ok(())
    }

    /// Reset the USB device. This can be used to recover when the probe
    /// stops responding to requests.
    pub(crate) fn reset(&mut self) -> Result<(), DebugProbeError> {
        tracing::debug!("Resetting USB device.");
        self.handle
            .reset()
            .map_err(|e| DebugProbeError::Usb(Some(Box::new(e))))
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        // We ignore the error case as we can't do much about it anyways.
        let _ = self.handle.release_interface(self.interface);
    }
}

/// Transport timeouts must stay distinguishable from other USB faults so
/// the layers above can retry them.
fn map_rusb_io_error(error: rusb::Error) -> DebugProbeError {
    match error {
        rusb::Error::Timeout => DebugProbeError::Timeout,
        rusb::Error::NoDevice => DebugProbeError::ProbeCouldNotBeCreated(
            ProbeCreationError::NotFound,
        ),
        other => DebugProbeError::Usb(Some(Box::new(other))),
    }
}

/// Enumerates devices matching `filter`, mapping each to a probe info via
/// `f`. Any enumeration failure yields an empty list: absence of probes is
/// a normal state.
pub(crate) fn filter_devices<F, M, R>(filter: F, f: M) -> Vec<R>
where
    F: Fn(&Device<Context>) -> bool,
    M: Fn(&Device<Context>) -> Option<R>,
{
    let Ok(context) = Context::new() else {
        return vec![];
    };
    let Ok(devices) = context.devices() else {
        return vec![];
    };

    devices
        .iter()
        .filter(|device| filter(device))
        .filter_map(|device| f(&device))
        .collect()
}
