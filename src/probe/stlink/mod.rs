pub mod constants;
pub mod tools;
mod usb_interface;

use std::cmp;
use std::time::Duration;

use scroll::{Pread, LE};
use thiserror::Error;

use self::constants::{commands, Mode, Status, SwdFrequencyToDelayCount};
use self::usb_interface::{StLinkUsb, StLinkUsbDevice, TIMEOUT};
use super::{DebugProbe, DebugProbeError, DebugProbeSelector, PortType};

/// Maximum length of 32 bit reads in bytes.
///
/// Length has been determined by experimenting with a ST-Link v2.
const STLINK_MAX_READ_LEN: usize = 6144;

/// Maximum length of 8 bit transfers in bytes on V2 probes.
const STLINK_MAX_8BIT_LEN: usize = 64;

/// DAP-port selector value for the debug port itself.
const DP_PORT: u16 = 0xFFFF;
/// DAP-port selector value for the default access port.
const AP_PORT: u16 = 0x0000;

#[derive(Error, Debug)]
pub(crate) enum StlinkError {
    #[error("Invalid voltage values returned by probe.")]
    VoltageDivisionByZero,
    #[error("Probe is in an unknown mode ({0:?}).")]
    UnknownMode(u8),
    #[error("Command too long for the ST-Link command frame")]
    CommandTooLong,
    #[error("Command failed with status {0:?}")]
    CommandFailed(Status),
    #[error("Unaligned address for a 32 bit memory access")]
    UnalignedAddress,
}

impl From<StlinkError> for DebugProbeError {
    fn from(e: StlinkError) -> Self {
        DebugProbeError::ProbeSpecific(Box::new(e))
    }
}

#[derive(Debug)]
pub(crate) struct StLink<D: StLinkUsb> {
    device: D,
    name: String,
    hw_version: u8,
    jtag_version: u8,
    swd_speed_khz: u32,
}

impl StLink<StLinkUsbDevice> {
    pub fn new_from_selector(
        selector: impl Into<DebugProbeSelector>,
    ) -> Result<Box<Self>, DebugProbeError> {
        let device = StLinkUsbDevice::new_from_selector(selector)?;
        let mut stlink = Self {
            name: format!("ST-Link {}", &device.info.version_name),
            device,
            hw_version: 0,
            jtag_version: 0,
            swd_speed_khz: 1_800,
        };

        stlink.init()?;

        Ok(Box::new(stlink))
    }
}

impl<D: StLinkUsb> StLink<D> {
    /// Minimum required JTAG firmware version; the DAP register commands
    /// this driver relies on appeared in V2J24.
    const MIN_JTAG_VERSION: u8 = 24;

    /// Reads the probe firmware version and leaves any non-debug mode.
    pub(crate) fn init(&mut self) -> Result<(), DebugProbeError> {
        let (hw_version, jtag_version) = self.get_version()?;

        if jtag_version < Self::MIN_JTAG_VERSION {
            tracing::warn!(
                "ST-Link firmware J{} is older than the required J{}.",
                jtag_version,
                Self::MIN_JTAG_VERSION
            );
            return Err(DebugProbeError::ProbeFirmwareOutdated);
        }

        self.hw_version = hw_version;
        self.jtag_version = jtag_version;

        self.enter_idle()?;

        Ok(())
    }

    /// GET_VERSION response structure:
    ///   Byte 0-1:
    ///     [15:12] Major/HW version
    ///     [11:6]  JTAG/SWD version
    ///     [5:0]   SWIM or MSC version
    ///   Byte 2-3: ST_VID
    ///   Byte 4-5: STLINK_PID
    fn get_version(&mut self) -> Result<(u8, u8), DebugProbeError> {
        let mut buf = [0; 6];
        self.device
            .write(&[commands::GET_VERSION], &[], &mut buf, TIMEOUT)?;

        let version: u16 = (&buf[0..2]).pread_with(0, scroll::BE).unwrap();
        let hw_version = (version >> 12) as u8;
        let jtag_version = ((version >> 6) & 0x3f) as u8;

        tracing::debug!("ST-Link version: V{}J{}", hw_version, jtag_version);

        Ok((hw_version, jtag_version))
    }

    /// Leaves DFU or SWIM mode so JTAG/SWD commands are accepted.
    fn enter_idle(&mut self) -> Result<(), DebugProbeError> {
        let mut buf = [0; 2];
        self.device
            .write(&[commands::GET_CURRENT_MODE], &[], &mut buf, TIMEOUT)?;

        match Mode::from(buf[0]) {
            Mode::Dfu => self.device.write(
                &[commands::DFU_COMMAND, commands::DFU_EXIT],
                &[],
                &mut [],
                TIMEOUT,
            ),
            Mode::Swim => self.device.write(
                &[commands::SWIM_COMMAND, commands::SWIM_EXIT],
                &[],
                &mut [],
                TIMEOUT,
            ),
            _ => Ok(()),
        }
    }

    fn send_jtag_command(
        &mut self,
        cmd: &[u8],
        write_data: &[u8],
        read_data: &mut [u8],
        timeout: Duration,
    ) -> Result<(), DebugProbeError> {
        for attempt in 0..13 {
            self.device.write(cmd, write_data, read_data, timeout)?;

            match Status::from(read_data[0]) {
                Status::JtagOk => return Ok(()),
                Status::SwdDpWait | Status::SwdApWait | Status::JtagCmdWait => {
                    tracing::warn!("send_jtag_command {:02x} got WAIT, retrying", cmd[0]);
                }
                status => {
                    tracing::warn!("send_jtag_command {:02x} failed: {:?}", cmd[0], status);
                    return Err(StlinkError::CommandFailed(status).into());
                }
            }

            // Sleep with exponential backoff.
            std::thread::sleep(Duration::from_micros(100 << attempt));
        }

        tracing::warn!("too many retries, giving up");

        // Return the last error (will be a WAIT status).
        let status = Status::from(read_data[0]);
        Err(StlinkError::CommandFailed(status).into())
    }

    fn get_last_rw_status(&mut self) -> Result<(), DebugProbeError> {
        let mut receive_buffer = [0u8; 12];
        self.send_jtag_command(
            &[commands::JTAG_COMMAND, commands::JTAG_GETLASTRWSTATUS2],
            &[],
            &mut receive_buffer,
            TIMEOUT,
        )
    }

    fn read_mem_32bit(&mut self, address: u32, data: &mut [u8]) -> Result<(), DebugProbeError> {
        debug_assert!(data.len() <= STLINK_MAX_READ_LEN);
        debug_assert!(data.len() % 4 == 0);

        if address % 4 != 0 {
            return Err(StlinkError::UnalignedAddress.into());
        }

        tracing::trace!("read_mem_32bit, address={:08x}, length={}", address, data.len());

        let addbytes = address.to_le_bytes();
        let lenbytes = (data.len() as u16).to_le_bytes();
        self.device.write(
            &[
                commands::JTAG_COMMAND,
                commands::JTAG_READMEM_32BIT,
                addbytes[0],
                addbytes[1],
                addbytes[2],
                addbytes[3],
                lenbytes[0],
                lenbytes[1],
                0,
            ],
            &[],
            data,
            TIMEOUT,
        )?;

        self.get_last_rw_status()
    }

    fn write_mem_32bit(&mut self, address: u32, data: &[u8]) -> Result<(), DebugProbeError> {
        debug_assert!(data.len() <= STLINK_MAX_READ_LEN);
        debug_assert!(data.len() % 4 == 0);

        if address % 4 != 0 {
            return Err(StlinkError::UnalignedAddress.into());
        }

        tracing::trace!("write_mem_32bit, address={:08x}, length={}", address, data.len());

        let addbytes = address.to_le_bytes();
        let lenbytes = (data.len() as u16).to_le_bytes();
        self.device.write(
            &[
                commands::JTAG_COMMAND,
                commands::JTAG_WRITEMEM_32BIT,
                addbytes[0],
                addbytes[1],
                addbytes[2],
                addbytes[3],
                lenbytes[0],
                lenbytes[1],
                0,
            ],
            data,
            &mut [],
            TIMEOUT,
        )?;

        self.get_last_rw_status()
    }

    fn read_mem_8bit(&mut self, address: u32, data: &mut [u8]) -> Result<(), DebugProbeError> {
        debug_assert!(data.len() <= STLINK_MAX_8BIT_LEN);

        tracing::trace!("read_mem_8bit, address={:08x}, length={}", address, data.len());

        // The receive buffer must be at least two bytes in size, otherwise
        // a USB overflow error occurs.
        let buffer_len = cmp::max(data.len(), 2);
        let mut receive_buffer = vec![0u8; buffer_len];

        let addbytes = address.to_le_bytes();
        let lenbytes = (data.len() as u16).to_le_bytes();
        self.device.write(
            &[
                commands::JTAG_COMMAND,
                commands::JTAG_READMEM_8BIT,
                addbytes[0],
                addbytes[1],
                addbytes[2],
                addbytes[3],
                lenbytes[0],
                lenbytes[1],
                0,
            ],
            &[],
            &mut receive_buffer,
            TIMEOUT,
        )?;

        data.copy_from_slice(&receive_buffer[..data.len()]);

        self.get_last_rw_status()
    }

    fn write_mem_8bit(&mut self, address: u32, data: &[u8]) -> Result<(), DebugProbeError> {
        debug_assert!(data.len() <= STLINK_MAX_8BIT_LEN);

        tracing::trace!("write_mem_8bit, address={:08x}, length={}", address, data.len());

        let addbytes = address.to_le_bytes();
        let lenbytes = (data.len() as u16).to_le_bytes();
        self.device.write(
            &[
                commands::JTAG_COMMAND,
                commands::JTAG_WRITEMEM_8BIT,
                addbytes[0],
                addbytes[1],
                addbytes[2],
                addbytes[3],
                lenbytes[0],
                lenbytes[1],
                0,
            ],
            data,
            &mut [],
            TIMEOUT,
        )?;

        self.get_last_rw_status()
    }
}

impl<D: StLinkUsb + 'static> DebugProbe for StLink<D> {
    fn get_name(&self) -> &str {
        &self.name
    }

    fn speed(&self) -> u32 {
        self.swd_speed_khz
    }

    fn set_speed(&mut self, speed_khz: u32) -> Result<u32, DebugProbeError> {
        let Some(setting) = SwdFrequencyToDelayCount::find_setting(speed_khz) else {
            return Err(DebugProbeError::UnsupportedSpeed(speed_khz));
        };

        // V3 probes run a fixed communication frequency table in hardware;
        // the V2 delay-count command is not accepted there.
        if self.hw_version >= 3 {
            self.swd_speed_khz = setting.to_khz();
            return Ok(self.swd_speed_khz);
        }

        let delay = (setting as u16).to_le_bytes();
        let mut buf = [0; 2];
        self.send_jtag_command(
            &[
                commands::JTAG_COMMAND,
                commands::SWD_SET_FREQ,
                delay[0],
                delay[1],
            ],
            &[],
            &mut buf,
            TIMEOUT,
        )?;

        self.swd_speed_khz = setting.to_khz();
        Ok(self.swd_speed_khz)
    }

    fn attach(&mut self) -> Result<(), DebugProbeError> {
        tracing::debug!("Attaching to target via SWD");

        self.enter_idle()?;

        let mut buf = [0; 2];
        self.send_jtag_command(
            &[
                commands::JTAG_COMMAND,
                commands::JTAG_ENTER2,
                commands::JTAG_ENTER_SWD,
                0,
            ],
            &[],
            &mut buf,
            TIMEOUT,
        )
    }

    fn detach(&mut self) -> Result<(), DebugProbeError> {
        tracing::debug!("Detaching from ST-Link.");
        self.device.write(
            &[commands::JTAG_COMMAND, commands::JTAG_EXIT],
            &[],
            &mut [],
            TIMEOUT,
        )
    }

    fn target_reset(&mut self) -> Result<(), DebugProbeError> {
        let mut buf = [0; 2];
        self.send_jtag_command(
            &[
                commands::JTAG_COMMAND,
                commands::JTAG_DRIVE_NRST,
                commands::JTAG_DRIVE_NRST_PULSE,
            ],
            &[],
            &mut buf,
            TIMEOUT,
        )
    }

    fn read_register(&mut self, port: PortType, addr: u8) -> Result<u32, DebugProbeError> {
        let port = match port {
            PortType::DebugPort => DP_PORT,
            PortType::AccessPort => AP_PORT,
        }
        .to_le_bytes();

        let cmd = &[
            commands::JTAG_COMMAND,
            commands::JTAG_READ_DAP_REG,
            port[0],
            port[1],
            addr,
            0, // Maximum address for DAP registers is 0xFC
        ];
        let mut buf = [0; 8];
        self.send_jtag_command(cmd, &[], &mut buf, TIMEOUT)?;
        // Unwrap is ok, the buffer is large enough.
        Ok((&buf[4..8]).pread_with(0, LE).unwrap())
    }

    fn write_register(
        &mut self,
        port: PortType,
        addr: u8,
        value: u32,
    ) -> Result<(), DebugProbeError> {
        let port = match port {
            PortType::DebugPort => DP_PORT,
            PortType::AccessPort => AP_PORT,
        }
        .to_le_bytes();
        let bytes = value.to_le_bytes();

        let cmd = &[
            commands::JTAG_COMMAND,
            commands::JTAG_WRITE_DAP_REG,
            port[0],
            port[1],
            addr,
            0,
            bytes[0],
            bytes[1],
            bytes[2],
            bytes[3],
        ];
        let mut buf = [0; 2];
        self.send_jtag_command(cmd, &[], &mut buf, TIMEOUT)
    }

    fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), DebugProbeError> {
        let mut address = address;
        let mut data = data;

        // Unaligned prefix, byte by byte command.
        let prefix_len = cmp::min(((4 - (address % 4)) % 4) as usize, data.len());
        if prefix_len > 0 {
            let (prefix, rest) = data.split_at_mut(prefix_len);
            self.read_mem_8bit(address, prefix)?;
            address += prefix_len as u32;
            data = rest;
        }

        // Aligned middle in maximum sized 32 bit chunks.
        while data.len() >= 4 {
            let chunk_len = cmp::min(data.len() & !3, STLINK_MAX_READ_LEN);
            let (chunk, rest) = data.split_at_mut(chunk_len);
            self.read_mem_32bit(address, chunk)?;
            address += chunk_len as u32;
            data = rest;
        }

        // Remaining tail.
        if !data.is_empty() {
            self.read_mem_8bit(address, data)?;
        }

        Ok(())
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), DebugProbeError> {
        let mut address = address;
        let mut data = data;

        let prefix_len = cmp::min(((4 - (address % 4)) % 4) as usize, data.len());
        if prefix_len > 0 {
            let (prefix, rest) = data.split_at(prefix_len);
            self.write_mem_8bit(address, prefix)?;
            address += prefix_len as u32;
            data = rest;
        }

        while data.len() >= 4 {
            let chunk_len = cmp::min(data.len() & !3, STLINK_MAX_READ_LEN);
            let (chunk, rest) = data.split_at(chunk_len);
            self.write_mem_32bit(address, chunk)?;
            address += chunk_len as u32;
            data = rest;
        }

        if !data.is_empty() {
            self.write_mem_8bit(address, data)?;
        }

        Ok(())
    }

    fn max_block_size(&self) -> usize {
        STLINK_MAX_READ_LEN
    }
}

#[cfg(test)]
mod test {
    use super::constants::commands;
    use super::usb_interface::StLinkUsb;
    use super::StLink;
    use crate::probe::{DebugProbe, DebugProbeError, PortType};

    #[derive(Debug)]
    struct MockUsb {
        hw_version: u8,
        jtag_version: u8,
        swim_version: u8,

        memory: Vec<u8>,
        memory_base: u32,
    }

    impl MockUsb {
        fn build(self) -> StLink<MockUsb> {
            StLink {
                device: self,
                name: "Mock ST-Link".into(),
                hw_version: 0,
                jtag_version: 0,
                swd_speed_khz: 0,
            }
        }
    }

    impl StLinkUsb for MockUsb {
        fn write(
            &mut self,
            cmd: &[u8],
            write_data: &[u8],
            read_data: &mut [u8],
            _timeout: std::time::Duration,
        ) -> Result<(), DebugProbeError> {
            match cmd[0] {
                commands::GET_VERSION => {
                    let version: u16 = ((self.hw_version as u16) << 12)
                        | ((self.jtag_version as u16) << 6)
                        | (self.swim_version as u16);

                    read_data[0] = (version >> 8) as u8;
                    read_data[1] = version as u8;

                    Ok(())
                }
                commands::GET_CURRENT_MODE => {
                    // Report JTAG mode, so no mode exit is attempted.
                    read_data[0] = 0x02;
                    Ok(())
                }
                commands::JTAG_COMMAND => {
                    // Status OK for JTAG commands.
                    if !read_data.is_empty() {
                        read_data[0] = 0x80;
                    }

                    match cmd[1] {
                        commands::JTAG_WRITEMEM_32BIT => {
                            let address =
                                u32::from_le_bytes([cmd[2], cmd[3], cmd[4], cmd[5]]);
                            let offset = (address - self.memory_base) as usize;
                            self.memory[offset..offset + write_data.len()]
                                .copy_from_slice(write_data);
                        }
                        commands::JTAG_READMEM_32BIT => {
                            let address =
                                u32::from_le_bytes([cmd[2], cmd[3], cmd[4], cmd[5]]);
                            let len =
                                u16::from_le_bytes([cmd[6], cmd[7]]) as usize;
                            let offset = (address - self.memory_base) as usize;
                            read_data[..len]
                                .copy_from_slice(&self.memory[offset..offset + len]);
                        }
                        _ => (),
                    }

                    Ok(())
                }
                _ => Ok(()),
            }
        }

        fn reset(&mut self) -> Result<(), DebugProbeError> {
            Ok(())
        }
    }

    fn mock(jtag_version: u8) -> MockUsb {
        MockUsb {
            hw_version: 2,
            jtag_version,
            swim_version: 0,
            memory: vec![0xff; 256],
            memory_base: 0x2000_0000,
        }
    }

    #[test]
    fn detect_old_firmware() {
        // Test that the init function detects old, unsupported firmware.
        let mut probe = mock(20).build();

        match probe.init().unwrap_err() {
            DebugProbeError::ProbeFirmwareOutdated => (),
            other => panic!("Expected firmware outdated error, got {}", other),
        }
    }

    #[test]
    fn init_accepts_current_firmware() {
        let mut probe = mock(30).build();
        probe.init().expect("Init function failed");
        assert_eq!(probe.hw_version, 2);
        assert_eq!(probe.jtag_version, 30);
    }

    #[test]
    fn memory_round_trip_through_mock() {
        let mut probe = mock(30).build();
        probe.init().unwrap();

        let pattern = [0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03, 0x04];
        probe.write_memory(0x2000_0000, &pattern).unwrap();

        let mut readback = [0u8; 8];
        probe.read_memory(0x2000_0000, &mut readback).unwrap();
        assert_eq!(pattern, readback);
    }

    #[test]
    fn unaligned_32bit_access_is_rejected() {
        let mut probe = mock(30).build();
        probe.init().unwrap();

        let mut buf = [0u8; 8];
        assert!(probe.read_mem_32bit(0x2000_0001, &mut buf).is_err());
    }

    #[test]
    fn register_write_frames_status_ok() {
        let mut probe = mock(30).build();
        probe.init().unwrap();

        probe
            .write_register(PortType::DebugPort, 0x8, 0x0000_0000)
            .expect("DP register write failed");
    }
}
