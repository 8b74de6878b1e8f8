pub mod commands;
pub mod tools;

use std::time::{Duration, Instant};

use self::commands::{ids, info, send_command, CmsisDapDevice, CmsisDapError};
use super::memory::{self, dp, DapAccess};
use super::{DebugProbe, DebugProbeError, DebugProbeSelector, PortType};

/// DAP_Connect port parameter for SWD.
const CONNECT_SWD: u8 = 1;

/// DAP status byte for a successfully executed command.
const DAP_OK: u8 = 0x00;

/// ABORT value clearing all sticky error flags.
const ABORT_CLEAR_STICKY: u32 = 0x1e;

/// CTRL/STAT: request debug and system power.
const POWER_UP_REQUEST: u32 = 0x5000_0000;
/// CTRL/STAT: both power-up acknowledge bits.
const POWER_UP_ACK: u32 = 0xa000_0000;

#[derive(Debug)]
pub(crate) struct CmsisDap {
    device: CmsisDapDevice,
    name: String,
    speed_khz: u32,
}

impl CmsisDap {
    pub fn new_from_selector(
        selector: impl Into<DebugProbeSelector>,
    ) -> Result<Box<Self>, DebugProbeError> {
        let selector = selector.into();
        let mut device = tools::open_device_from_selector(&selector)?;

        device.drain();

        // The advertised packet size is authoritative over what the
        // endpoint descriptor claims.
        if let Ok(response) = send_command(&mut device, ids::DAP_INFO, &[info::PACKET_SIZE]) {
            if response.first() == Some(&2) && response.len() >= 3 {
                let size = u16::from_le_bytes([response[1], response[2]]) as usize;
                if let CmsisDapDevice::V2 {
                    max_packet_size, ..
                } = &mut device
                {
                    *max_packet_size = size;
                }
            }
        }

        Ok(Box::new(Self {
            device,
            name: format!(
                "CMSIS-DAP ({:04x}:{:04x})",
                selector.vendor_id, selector.product_id
            ),
            speed_khz: 1_000,
        }))
    }

    fn command(&mut self, command_id: u8, request: &[u8]) -> Result<Vec<u8>, DebugProbeError> {
        Ok(send_command(&mut self.device, command_id, request)?)
    }

    /// Sends a command whose one-byte response must be DAP_OK.
    fn command_status(&mut self, command_id: u8, request: &[u8]) -> Result<(), DebugProbeError> {
        let response = self.command(command_id, request)?;
        if response.first() != Some(&DAP_OK) {
            return Err(CmsisDapError::ErrorResponse.into());
        }
        Ok(())
    }

    /// Clocks out raw bits on SWDIO via DAP_SWJ_Sequence.
    fn swj_sequence(&mut self, bit_count: usize, data: &[u8]) -> Result<(), DebugProbeError> {
        let mut request = Vec::with_capacity(data.len() + 1);
        // A count of 0 encodes 256 bits.
        request.push(if bit_count == 256 { 0 } else { bit_count as u8 });
        request.extend_from_slice(data);
        self.command_status(ids::DAP_SWJ_SEQUENCE, &request)
    }

    /// Switches the target's SWJ-DP from its reset state to SWD: line
    /// reset, the JTAG-to-SWD select sequence, line reset again, idle.
    fn jtag_to_swd(&mut self) -> Result<(), DebugProbeError> {
        self.swj_sequence(51, &[0xff; 7])?;
        self.swj_sequence(16, &[0x9e, 0xe7])?;
        self.swj_sequence(51, &[0xff; 7])?;
        self.swj_sequence(8, &[0x00])?;
        Ok(())
    }

    /// One DAP_Transfer with a single request, retried on WAIT.
    fn transfer(&mut self, request: u8, value: u32) -> Result<u32, DebugProbeError> {
        const READ: u8 = 0x02;

        for _ in 0..5 {
            let mut packet = vec![0x00, 0x01, request];
            if request & READ == 0 {
                packet.extend_from_slice(&value.to_le_bytes());
            }

            let response = self.command(ids::DAP_TRANSFER, &packet)?;
            if response.len() < 2 {
                return Err(CmsisDapError::UnexpectedAnswer.into());
            }

            match response[1] & 0x07 {
                0x01 => {
                    if request & READ != 0 {
                        if response.len() < 6 {
                            return Err(CmsisDapError::UnexpectedAnswer.into());
                        }
                        return Ok(u32::from_le_bytes([
                            response[2],
                            response[3],
                            response[4],
                            response[5],
                        ]));
                    }
                    return Ok(0);
                }
                0x02 => {
                    tracing::trace!("DAP transfer got WAIT, retrying");
                    continue;
                }
                0x04 => {
                    // Clear the sticky error so later transfers can succeed.
                    let mut abort = vec![0x00];
                    abort.extend_from_slice(&ABORT_CLEAR_STICKY.to_le_bytes());
                    let _ = self.command(ids::DAP_WRITE_ABORT, &abort);
                    return Err(CmsisDapError::FaultResponse.into());
                }
                _ => return Err(CmsisDapError::NoAcknowledge.into()),
            }
        }

        Err(CmsisDapError::WaitRetriesExceeded.into())
    }

    fn power_up_debug_domain(&mut self) -> Result<(), DebugProbeError> {
        self.write_dap_register(PortType::DebugPort, dp::CTRL_STAT, POWER_UP_REQUEST)?;

        let deadline = Instant::now() + Duration::from_millis(100);
        loop {
            let status = self.read_dap_register(PortType::DebugPort, dp::CTRL_STAT)?;
            if status & POWER_UP_ACK == POWER_UP_ACK {
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(DebugProbeError::Timeout);
            }
        }
    }
}

impl DapAccess for CmsisDap {
    fn read_dap_register(&mut self, port: PortType, addr: u8) -> Result<u32, DebugProbeError> {
        let request = match port {
            PortType::DebugPort => 0x02,
            PortType::AccessPort => 0x03,
        } | (addr & 0x0c);
        self.transfer(request, 0)
    }

    fn write_dap_register(
        &mut self,
        port: PortType,
        addr: u8,
        value: u32,
    ) -> Result<(), DebugProbeError> {
        let request = match port {
            PortType::DebugPort => 0x00,
            PortType::AccessPort => 0x01,
        } | (addr & 0x0c);
        self.transfer(request, value).map(|_| ())
    }
}

impl DebugProbe for CmsisDap {
    fn get_name(&self) -> &str {
        &self.name
    }

    fn speed(&self) -> u32 {
        self.speed_khz
    }

    fn set_speed(&mut self, speed_khz: u32) -> Result<u32, DebugProbeError> {
        let request = (speed_khz * 1_000).to_le_bytes();
        match self.command_status(ids::DAP_SWJ_CLOCK, &request) {
            Ok(()) => {
                self.speed_khz = speed_khz;
                Ok(speed_khz)
            }
            Err(_) => Err(DebugProbeError::UnsupportedSpeed(speed_khz)),
        }
    }

    fn attach(&mut self) -> Result<(), DebugProbeError> {
        tracing::debug!("Attaching via CMSIS-DAP");

        let response = self.command(ids::DAP_CONNECT, &[CONNECT_SWD])?;
        if response.first() != Some(&CONNECT_SWD) {
            return Err(CmsisDapError::ErrorResponse.into());
        }

        // Idle cycles 0, 80 WAIT retries in firmware, no match retries.
        self.command_status(ids::DAP_TRANSFER_CONFIGURE, &[0, 80, 0, 0, 0])?;

        self.jtag_to_swd()?;

        // DPIDR read completes the line reset handshake.
        let dpidr = self.read_dap_register(PortType::DebugPort, 0x0)?;
        tracing::debug!("DPIDR: {:08x}", dpidr);

        let mut abort = vec![0x00];
        abort.extend_from_slice(&ABORT_CLEAR_STICKY.to_le_bytes());
        self.command(ids::DAP_WRITE_ABORT, &abort)?;

        self.power_up_debug_domain()
    }

    fn detach(&mut self) -> Result<(), DebugProbeError> {
        self.command_status(ids::DAP_DISCONNECT, &[])
    }

    fn target_reset(&mut self) -> Result<(), DebugProbeError> {
        const PIN_NRESET: u8 = 0x80;

        // Assert nRESET, release it after a short hold.
        let mut request = vec![0x00, PIN_NRESET];
        request.extend_from_slice(&0u32.to_le_bytes());
        self.command(ids::DAP_SWJ_PINS, &request)?;

        std::thread::sleep(Duration::from_millis(20));

        let mut request = vec![PIN_NRESET, PIN_NRESET];
        request.extend_from_slice(&0u32.to_le_bytes());
        self.command(ids::DAP_SWJ_PINS, &request)?;
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
        1024
    }
}
