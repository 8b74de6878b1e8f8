pub mod tools;

use std::time::Duration;

use crate::probe::memory::{self, DapAccess};
use crate::probe::swd::{attach_swd, RawSwdIo};
use crate::probe::usb::UsbDevice;
use crate::probe::{
    DebugProbe, DebugProbeError, DebugProbeSelector, PortType, ProbeCreationError,
};

pub const USB_VID: u16 = 0x1366;

const EP_OUT: u8 = 0x02;
const EP_IN: u8 = 0x81;

const TIMEOUT: Duration = Duration::from_millis(1000);

/// The subset of the J-Link vendor command set this driver uses.
mod commands {
    pub const VERSION: u8 = 0x01;
    pub const SET_SPEED: u8 = 0x05;
    pub const GET_CAPS: u8 = 0xe8;
    pub const SELECT_IF: u8 = 0xc7;
    pub const HW_JTAG3: u8 = 0xcf;
    pub const HW_RESET0: u8 = 0xdc;
    pub const HW_RESET1: u8 = 0xdd;

    /// GET_CAPS bit: SELECT_IF is available.
    pub const CAP_SELECT_IF: u32 = 1 << 17;

    /// SELECT_IF parameter for SWD.
    pub const INTERFACE_SWD: u8 = 1;
}

#[derive(Debug)]
pub(crate) struct JLink {
    device: UsbDevice,
    name: String,
    speed_khz: u32,
}

impl JLink {
    pub fn new_from_selector(
        selector: impl Into<DebugProbeSelector>,
    ) -> Result<Box<Self>, DebugProbeError> {
        let selector = selector.into();
        if selector.vendor_id != USB_VID {
            return Err(ProbeCreationError::NotFound.into());
        }

        let device = UsbDevice::open(&selector, 0, EP_OUT, EP_IN)?;

        let mut jlink = Self {
            device,
            name: "J-Link".into(),
            speed_khz: 1_000,
        };

        jlink.read_firmware_version()?;

        // Older hardware revisions only speak JTAG.
        let caps = jlink.read_caps()?;
        if caps & commands::CAP_SELECT_IF == 0 {
            return Err(ProbeCreationError::Other(
                "J-Link hardware does not support interface selection",
            )
            .into());
        }
        jlink.select_swd()?;

        Ok(Box::new(jlink))
    }

    fn read_firmware_version(&mut self) -> Result<(), DebugProbeError> {
        self.device.write_bulk(&[commands::VERSION], TIMEOUT)?;

        let mut length = [0u8; 2];
        self.device.read_bulk(&mut length, TIMEOUT)?;
        let mut version = vec![0u8; u16::from_le_bytes(length) as usize];
        self.device.read_bulk(&mut version, TIMEOUT)?;

        if let Some(name) = version
            .split(|b| *b == 0)
            .next()
            .and_then(|s| std::str::from_utf8(s).ok())
        {
            tracing::debug!("J-Link firmware: {}", name.trim());
            self.name = name.trim().to_string();
        }
        Ok(())
    }

    fn read_caps(&mut self) -> Result<u32, DebugProbeError> {
        self.device.write_bulk(&[commands::GET_CAPS], TIMEOUT)?;
        let mut caps = [0u8; 4];
        self.device.read_bulk(&mut caps, TIMEOUT)?;
        Ok(u32::from_le_bytes(caps))
    }

    fn select_swd(&mut self) -> Result<(), DebugProbeError> {
        self.device
            .write_bulk(&[commands::SELECT_IF, commands::INTERFACE_SWD], TIMEOUT)?;
        // The reply reports the previously selected interface.
        let mut previous = [0u8; 4];
        self.device.read_bulk(&mut previous, TIMEOUT)?;
        Ok(())
    }
}

fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; (bits.len() + 7) / 8];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

impl RawSwdIo for JLink {
    fn swd_io(&mut self, dir: &[bool], swdio: &[bool]) -> Result<Vec<bool>, DebugProbeError> {
        debug_assert_eq!(dir.len(), swdio.len());

        // HW_JTAG3 in SWD mode: the TMS field carries the direction bits,
        // the TDI field the output levels, and the reply the sampled line.
        let dir_bytes = pack_bits(dir);
        let out_bytes = pack_bits(swdio);

        let mut command = Vec::with_capacity(4 + dir_bytes.len() + out_bytes.len());
        command.push(commands::HW_JTAG3);
        command.push(0);
        command.extend_from_slice(&(dir.len() as u16).to_le_bytes());
        command.extend_from_slice(&dir_bytes);
        command.extend_from_slice(&out_bytes);

        self.device.write_bulk(&command, TIMEOUT)?;

        let mut reply = vec![0u8; dir_bytes.len() + 1];
        self.device.read_bulk(&mut reply, TIMEOUT)?;

        let status = reply[reply.len() - 1];
        if status != 0 {
            tracing::warn!("J-Link bit transfer failed with status {}", status);
            return Err(DebugProbeError::Usb(None));
        }

        let mut sampled = Vec::with_capacity(dir.len());
        for i in 0..dir.len() {
            sampled.push(reply[i / 8] & (1 << (i % 8)) != 0);
        }
        Ok(sampled)
    }
}

impl DebugProbe for JLink {
    fn get_name(&self) -> &str {
        &self.name
    }

    fn speed(&self) -> u32 {
        self.speed_khz
    }

    fn set_speed(&mut self, speed_khz: u32) -> Result<u32, DebugProbeError> {
        // The wire format carries the speed as a 16 bit kHz value; 0xFFFF
        // selects adaptive clocking, which this driver does not use.
        if speed_khz == 0 || speed_khz >= 0xFFFF {
            return Err(DebugProbeError::UnsupportedSpeed(speed_khz));
        }

        let mut command = vec![commands::SET_SPEED];
        command.extend_from_slice(&(speed_khz as u16).to_le_bytes());
        self.device.write_bulk(&command, TIMEOUT)?;

        self.speed_khz = speed_khz;
        Ok(speed_khz)
    }

    fn attach(&mut self) -> Result<(), DebugProbeError> {
        tracing::debug!("Attaching via J-Link");
        attach_swd(self)
    }

    fn detach(&mut self) -> Result<(), DebugProbeError> {
        Ok(())
    }

    fn target_reset(&mut self) -> Result<(), DebugProbeError> {
        self.device.write_bulk(&[commands::HW_RESET0], TIMEOUT)?;
        std::thread::sleep(Duration::from_millis(20));
        self.device.write_bulk(&[commands::HW_RESET1], TIMEOUT)?;
        Ok(())
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
        512
    }
}

#[cfg(test)]
mod tests {
    use super::pack_bits;

    #[test]
    fn bit_packing_is_lsb_first() {
        assert_eq!(pack_bits(&[true, false, false, false, false, false, false, false, true]),
            vec![0x01, 0x01]);
        assert_eq!(pack_bits(&[false, true, true]), vec![0x06]);
        assert!(pack_bits(&[]).is_empty());
    }
}
