pub mod tools;

use std::time::Duration;

use rusb::{Context, DeviceHandle, UsbContext};

use crate::probe::memory::{self, DapAccess};
use crate::probe::swd::{attach_swd, RawSwdIo};
use crate::probe::usb::device_matches;
use crate::probe::{
    DebugProbe, DebugProbeError, DebugProbeSelector, PortType, ProbeCreationError,
};

pub const USB_VID: u16 = 0x0403;

/// Product ids of MPSSE-capable FTDI chips (FT2232D/H, FT4232H, FT232H).
pub(crate) const MPSSE_PIDS: &[u16] = &[0x6010, 0x6011, 0x6014];

const EP_OUT: u8 = 0x02;
const EP_IN: u8 = 0x81;
const INTERFACE: u8 = 0;

const TIMEOUT: Duration = Duration::from_millis(1000);

// FTDI vendor requests.
const SIO_RESET: u8 = 0x00;
const SIO_SET_LATENCY_TIMER: u8 = 0x09;
const SIO_SET_BITMODE: u8 = 0x0b;

const BITMODE_MPSSE: u16 = 0x02;

// MPSSE opcodes.
const MPSSE_WRITE_BITS_LSB_NEG: u8 = 0x1b;
const MPSSE_READ_BITS_LSB: u8 = 0x2e;
const MPSSE_SET_BITS_LOW: u8 = 0x80;
const MPSSE_SET_CLK_DIVISOR: u8 = 0x86;
const MPSSE_SEND_IMMEDIATE: u8 = 0x87;

// ADBUS pin assignment: TCK on bit 0, DO on bit 1 driving SWDIO, DI on
// bit 2 reading it back.
const DIR_HOST_DRIVES: u8 = 0x0b;
const DIR_TARGET_DRIVES: u8 = 0x09;

/// An FTDI chip in MPSSE mode used as an SWD probe.
///
/// SWDIO is wired to both DO and DI; the DO pin is tristated whenever the
/// target drives the line.
pub(crate) struct FtdiProbe {
    handle: DeviceHandle<Context>,
    name: String,
    speed_khz: u32,
}

impl std::fmt::Debug for FtdiProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtdiProbe")
            .field("name", &self.name)
            .field("speed_khz", &self.speed_khz)
            .finish()
    }
}

impl FtdiProbe {
    pub fn new_from_selector(
        selector: impl Into<DebugProbeSelector>,
    ) -> Result<Box<Self>, DebugProbeError> {
        let selector = selector.into();
        if selector.vendor_id != USB_VID || !MPSSE_PIDS.contains(&selector.product_id) {
            return Err(ProbeCreationError::NotFound.into());
        }

        let context = Context::new().map_err(ProbeCreationError::Rusb)?;
        let device = context
            .devices()
            .map_err(ProbeCreationError::Rusb)?
            .iter()
            .find(|device| device_matches(device, &selector))
            .ok_or(ProbeCreationError::NotFound)?;

        let handle = device.open().map_err(|e| match e {
            rusb::Error::Busy => ProbeCreationError::Busy,
            rusb::Error::Access => ProbeCreationError::CouldNotOpen,
            other => ProbeCreationError::Rusb(other),
        })?;
        handle
            .claim_interface(INTERFACE)
            .map_err(|e| match e {
                rusb::Error::Busy => ProbeCreationError::Busy,
                other => ProbeCreationError::Rusb(other),
            })?;

        let mut probe = Self {
            handle,
            name: format!("FTDI ({:04x}:{:04x})", selector.vendor_id, selector.product_id),
            speed_khz: 1_000,
        };

        probe.enter_mpsse()?;
        probe.apply_speed(probe.speed_khz)?;

        Ok(Box::new(probe))
    }

    fn vendor_request(&mut self, request: u8, value: u16) -> Result<(), DebugProbeError> {
        self.handle
            .write_control(0x40, request, value, INTERFACE as u16 + 1, &[], TIMEOUT)
            .map_err(|e| DebugProbeError::Usb(Some(Box::new(e))))?;
        Ok(())
    }

    fn enter_mpsse(&mut self) -> Result<(), DebugProbeError> {
        self.vendor_request(SIO_RESET, 0)?;
        self.vendor_request(SIO_SET_LATENCY_TIMER, 1)?;
        self.vendor_request(SIO_SET_BITMODE, (BITMODE_MPSSE << 8) | DIR_HOST_DRIVES as u16)?;

        // Idle state: clock low, SWDIO driven low.
        self.send(&[MPSSE_SET_BITS_LOW, 0x00, DIR_HOST_DRIVES])?;
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), DebugProbeError> {
        let written = self
            .handle
            .write_bulk(EP_OUT, data, TIMEOUT)
            .map_err(|e| DebugProbeError::Usb(Some(Box::new(e))))?;
        if written != data.len() {
            return Err(DebugProbeError::Usb(None));
        }
        Ok(())
    }

    /// Reads `count` payload bytes, stripping the two modem status bytes
    /// the chip prepends to every packet.
    fn receive(&mut self, count: usize) -> Result<Vec<u8>, DebugProbeError> {
        let mut payload = Vec::with_capacity(count);
        let mut packet = [0u8; 64];
        while payload.len() < count {
            let read = match self.handle.read_bulk(EP_IN, &mut packet, TIMEOUT) {
                Ok(n) => n,
                Err(rusb::Error::Timeout) => return Err(DebugProbeError::Timeout),
                Err(e) => return Err(DebugProbeError::Usb(Some(Box::new(e)))),
            };
            if read <= 2 {
                continue;
            }
            payload.extend_from_slice(&packet[2..read]);
        }
        payload.truncate(count);
        Ok(payload)
    }

    fn apply_speed(&mut self, speed_khz: u32) -> Result<(), DebugProbeError> {
        // TCK = 12 MHz / ((1 + divisor) * 2)
        if speed_khz == 0 || speed_khz > 6_000 {
            return Err(DebugProbeError::UnsupportedSpeed(speed_khz));
        }
        let divisor = (6_000 / speed_khz - 1) as u16;
        self.send(&[
            MPSSE_SET_CLK_DIVISOR,
            divisor as u8,
            (divisor >> 8) as u8,
        ])
    }
}

impl RawSwdIo for FtdiProbe {
    fn swd_io(&mut self, dir: &[bool], swdio: &[bool]) -> Result<Vec<bool>, DebugProbeError> {
        debug_assert_eq!(dir.len(), swdio.len());

        let mut commands = Vec::new();
        // (driven run?, bit count) per queued shift command.
        let mut shifts: Vec<(bool, usize)> = Vec::new();

        let mut i = 0;
        while i < dir.len() {
            let driven = dir[i];
            let mut run = 1;
            while i + run < dir.len() && dir[i + run] == driven && run < 8 {
                run += 1;
            }

            if driven {
                let mut byte = 0u8;
                for bit in 0..run {
                    if swdio[i + bit] {
                        byte |= 1 << bit;
                    }
                }
                commands.extend_from_slice(&[
                    MPSSE_SET_BITS_LOW,
                    0x00,
                    DIR_HOST_DRIVES,
                    MPSSE_WRITE_BITS_LSB_NEG,
                    (run - 1) as u8,
                    byte,
                ]);
            } else {
                commands.extend_from_slice(&[
                    MPSSE_SET_BITS_LOW,
                    0x00,
                    DIR_TARGET_DRIVES,
                    MPSSE_READ_BITS_LSB,
                    (run - 1) as u8,
                ]);
            }
            shifts.push((driven, run));
            i += run;
        }

        commands.push(MPSSE_SEND_IMMEDIATE);
        self.send(&commands)?;

        let read_count = shifts.iter().filter(|(driven, _)| !driven).count();
        let response = self.receive(read_count)?;

        // Reassemble the sampled bit stream; driven cycles echo the output.
        let mut sampled = Vec::with_capacity(dir.len());
        let mut response_iter = response.iter();
        let mut cursor = 0;
        for (driven, run) in shifts {
            if driven {
                sampled.extend_from_slice(&swdio[cursor..cursor + run]);
            } else {
                let Some(byte) = response_iter.next() else {
                    return Err(DebugProbeError::Usb(None));
                };
                // Bits are shifted in from the top of the byte.
                let byte = byte >> (8 - run);
                for bit in 0..run {
                    sampled.push(byte & (1 << bit) != 0);
                }
            }
            cursor += run;
        }

        Ok(sampled)
    }
}

impl DebugProbe for FtdiProbe {
    fn get_name(&self) -> &str {
        &self.name
    }

    fn speed(&self) -> u32 {
        self.speed_khz
    }

    fn set_speed(&mut self, speed_khz: u32) -> Result<u32, DebugProbeError> {
        self.apply_speed(speed_khz)?;
        self.speed_khz = speed_khz;
        Ok(speed_khz)
    }

    fn attach(&mut self) -> Result<(), DebugProbeError> {
        tracing::debug!("Attaching via FTDI MPSSE");
        attach_swd(self)
    }

    fn detach(&mut self) -> Result<(), DebugProbeError> {
        Ok(())
    }

    fn target_reset(&mut self) -> Result<(), DebugProbeError> {
        // No reset pin in this wiring.
        Err(DebugProbeError::CommandNotSupportedByProbe)
    }

    fn read_register(&mut self, port: PortType, addr: u8) -> Result<u32, DebugProbeError> {
        self.read_dap_register(port, addr)
    }

    fn write_register(
        &mut self,
        port: PortType,
        addr: u8,
        value: u32,
    ) -> Result<(), DebugProbeError> {
        self.write_dap_register(port, addr, value)
    }

    fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), DebugProbeError> {
        memory::read_memory(self, address, data)
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), DebugProbeError> {
        memory::write_memory(self, address, data)
    }

    fn max_block_size(&self) -> usize {
        256
    }
}

impl Drop for FtdiProbe {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(INTERFACE);
    }
}
