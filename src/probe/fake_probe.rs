//! An in-process probe backed by a simulated target.
//!
//! The simulation covers what the engine touches: core debug registers,
//! the STM32L0 flash controller with its key-based unlock protocol, the
//! device id block and a flash array with the family's program-without-
//! erase behavior (bits can be set, never cleared). Tests keep a handle
//! to the shared state and inspect it after the session is gone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{DebugProbe, DebugProbeError, PortType};
use crate::target::{cortex_m, stm32l0};

const RAM_BASE: u32 = 0x2000_0000;
const RAM_SIZE: usize = 8 * 1024;

#[derive(Debug)]
pub struct FakeState {
    pub flash: Vec<u8>,
    pub flash_base: u32,
    ram: Vec<u8>,
    cpuid: u32,
    c_debugen: bool,
    c_halt: bool,
    pecr: u32,
    sr_errors: u32,
    optr: u32,
    uid: [u32; 3],
    pekey_stage: u8,
    prgkey_stage: u8,
    dap_registers: HashMap<(bool, u8), u32>,

    /// Keeps BSY asserted forever, for erase-timeout tests.
    pub stuck_busy: bool,
    /// Fails every transfer, for transport-fault tests.
    pub fail_transport: bool,
    /// Times out this many transfers before succeeding.
    pub timeouts_remaining: usize,
}

impl FakeState {
    /// Overrides the CPUID value, to simulate a foreign core.
    pub fn set_cpuid(&mut self, cpuid: u32) {
        self.cpuid = cpuid;
    }

    /// Overrides the read-out protection byte in the option registers.
    pub fn set_rdp(&mut self, level: u8) {
        self.optr = (self.optr & !0xff) | level as u32;
    }

    fn flash_contains(&self, address: u32, len: usize) -> bool {
        address >= self.flash_base
            && (address - self.flash_base) as usize + len <= self.flash.len()
    }

    fn ram_contains(&self, address: u32, len: usize) -> bool {
        address >= RAM_BASE && (address - RAM_BASE) as usize + len <= RAM_SIZE
    }

    fn pe_unlocked(&self) -> bool {
        self.pecr & stm32l0::PECR_PELOCK == 0
    }

    fn prg_unlocked(&self) -> bool {
        self.pe_unlocked() && self.pecr & stm32l0::PECR_PRGLOCK == 0
    }

    fn read_register(&self, address: u32) -> u32 {
        match address {
            cortex_m::CPUID => self.cpuid,
            cortex_m::DHCSR => {
                let mut dhcsr = cortex_m::Dhcsr(0);
                dhcsr.set_c_debugen(self.c_debugen);
                dhcsr.set_c_halt(self.c_halt);
                let halted = self.c_debugen && self.c_halt;
                u32::from(dhcsr) | ((halted as u32) << 17)
            }
            stm32l0::PECR => self.pecr,
            stm32l0::SR => {
                if self.stuck_busy {
                    stm32l0::SR_BSY
                } else {
                    self.sr_errors
                }
            }
            stm32l0::OPTR => self.optr,
            a if a == stm32l0::UID[0] => self.uid[0],
            a if a == stm32l0::UID[1] => self.uid[1],
            a if a == stm32l0::UID[2] => self.uid[2],
            stm32l0::FLASH_SIZE => (self.flash.len() / 1024) as u32,
            _ => 0,
        }
    }

    fn write_register(&mut self, address: u32, value: u32) {
        match address {
            cortex_m::DHCSR => {
                if value >> 16 == 0xa05f {
                    let dhcsr = cortex_m::Dhcsr(value);
                    self.c_debugen = dhcsr.c_debugen();
                    self.c_halt = dhcsr.c_halt();
                }
            }
            stm32l0::PKEYR => {
                if value == stm32l0::PEKEY1 {
                    self.pekey_stage = 1;
                } else if self.pekey_stage == 1 && value == stm32l0::PEKEY2 {
                    self.pecr &= !stm32l0::PECR_PELOCK;
                    self.pekey_stage = 0;
                } else {
                    self.pekey_stage = 0;
                }
            }
            stm32l0::PRGKEYR => {
                if !self.pe_unlocked() {
                    return;
                }
                if value == stm32l0::PRGKEY1 {
                    self.prgkey_stage = 1;
                } else if self.prgkey_stage == 1 && value == stm32l0::PRGKEY2 {
                    self.pecr &= !stm32l0::PECR_PRGLOCK;
                    self.prgkey_stage = 0;
                } else {
                    self.prgkey_stage = 0;
                }
            }
            stm32l0::PECR => {
                if self.pe_unlocked() {
                    // Setting the lock bit relocks everything else too.
                    if value & stm32l0::PECR_PELOCK != 0 {
                        self.pecr = stm32l0::PECR_PELOCK | stm32l0::PECR_PRGLOCK;
                    } else {
                        self.pecr = (self.pecr
                            & (stm32l0::PECR_PELOCK | stm32l0::PECR_PRGLOCK))
                            | (value & !(stm32l0::PECR_PELOCK | stm32l0::PECR_PRGLOCK));
                    }
                }
            }
            stm32l0::SR => {
                // Write-one-to-clear error flags.
                self.sr_errors &= !value;
            }
            _ => (),
        }
    }

    fn write_flash(&mut self, address: u32, data: &[u8]) {
        if !self.prg_unlocked() {
            self.sr_errors |= stm32l0::SR_WRPERR;
            return;
        }

        // A zero word written with ERASE set blanks the containing page.
        if self.pecr & stm32l0::PECR_ERASE != 0 && data == [0, 0, 0, 0] {
            let page = (address - self.flash_base) & !(stm32l0::PAGE_SIZE - 1);
            let page = page as usize;
            self.flash[page..page + stm32l0::PAGE_SIZE as usize].fill(0x00);
            return;
        }

        // Programming can only set bits; clearing needs an erase.
        let offset = (address - self.flash_base) as usize;
        for (byte, value) in self.flash[offset..offset + data.len()].iter_mut().zip(data) {
            *byte |= value;
        }
    }
}

#[derive(Debug)]
pub struct FakeProbe {
    state: Arc<Mutex<FakeState>>,
    speed_khz: u32,
}

impl FakeProbe {
    /// A 64 KiB STM32L051 with blank flash and no read-out protection.
    pub fn stm32l051() -> Self {
        Self::with_state(FakeState {
            flash: vec![0x00; 64 * 1024],
            flash_base: 0x0800_0000,
            ram: vec![0x00; RAM_SIZE],
            // Cortex-M0+ r0p1
            cpuid: 0x410c_c601,
            c_debugen: false,
            c_halt: false,
            pecr: stm32l0::PECR_PELOCK | stm32l0::PECR_PRGLOCK,
            sr_errors: 0,
            optr: stm32l0::RDP_LEVEL_0 as u32,
            uid: [0x0011_0022, 0x3344_5566, 0x7788_9900],
            pekey_stage: 0,
            prgkey_stage: 0,
            dap_registers: HashMap::new(),
            stuck_busy: false,
            fail_transport: false,
            timeouts_remaining: 0,
        })
    }

    pub fn with_state(state: FakeState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            speed_khz: 1_800,
        }
    }

    /// A handle to the simulated target, valid beyond the probe's
    /// lifetime.
    pub fn state(&self) -> Arc<Mutex<FakeState>> {
        Arc::clone(&self.state)
    }

    fn checked_state(&self) -> Result<std::sync::MutexGuard<'_, FakeState>, DebugProbeError> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.fail_transport {
            return Err(DebugProbeError::Usb(None));
        }
        if state.timeouts_remaining > 0 {
            state.timeouts_remaining -= 1;
            return Err(DebugProbeError::Timeout);
        }
        Ok(state)
    }
}

impl DebugProbe for FakeProbe {
    fn get_name(&self) -> &str {
        "Fake probe"
    }

    fn speed(&self) -> u32 {
        self.speed_khz
    }

    fn set_speed(&mut self, speed_khz: u32) -> Result<u32, DebugProbeError> {
        if speed_khz == 0 || speed_khz > 4_600 {
            return Err(DebugProbeError::UnsupportedSpeed(speed_khz));
        }
        self.speed_khz = speed_khz;
        Ok(speed_khz)
    }

    fn attach(&mut self) -> Result<(), DebugProbeError> {
        self.checked_state().map(|_| ())
    }

    fn detach(&mut self) -> Result<(), DebugProbeError> {
        Ok(())
    }

    fn target_reset(&mut self) -> Result<(), DebugProbeError> {
        let mut state = self.checked_state()?;
        state.c_debugen = false;
        state.c_halt = false;
        Ok(())
    }

    fn read_register(&mut self, port: PortType, addr: u8) -> Result<u32, DebugProbeError> {
        let state = self.checked_state()?;
        let key = (port == PortType::AccessPort, addr);
        Ok(*state.dap_registers.get(&key).unwrap_or(&0))
    }

    fn write_register(
        &mut self,
        port: PortType,
        addr: u8,
        value: u32,
    ) -> Result<(), DebugProbeError> {
        let mut state = self.checked_state()?;
        state
            .dap_registers
            .insert((port == PortType::AccessPort, addr), value);
        Ok(())
    }

    fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), DebugProbeError> {
        let state = self.checked_state()?;

        if state.flash_contains(address, data.len()) {
            let offset = (address - state.flash_base) as usize;
            data.copy_from_slice(&state.flash[offset..offset + data.len()]);
        } else if state.ram_contains(address, data.len()) {
            let offset = (address - RAM_BASE) as usize;
            data.copy_from_slice(&state.ram[offset..offset + data.len()]);
        } else {
            // Word-register space.
            for (i, chunk) in data.chunks_mut(4).enumerate() {
                let word = state.read_register(address + (i * 4) as u32);
                let bytes = word.to_le_bytes();
                chunk.copy_from_slice(&bytes[..chunk.len()]);
            }
        }
        Ok(())
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), DebugProbeError> {
        let mut state = self.checked_state()?;

        if state.flash_contains(address, data.len()) {
            // Flash programming happens word-wise through the NVM
            // controller.
            for (i, chunk) in data.chunks(4).enumerate() {
                state.write_flash(address + (i * 4) as u32, chunk);
            }
        } else if state.ram_contains(address, data.len()) {
            let offset = (address - RAM_BASE) as usize;
            state.ram[offset..offset + data.len()].copy_from_slice(data);
        } else {
            for (i, chunk) in data.chunks(4).enumerate() {
                let mut bytes = [0u8; 4];
                bytes[..chunk.len()].copy_from_slice(chunk);
                state.write_register(address + (i * 4) as u32, u32::from_le_bytes(bytes));
            }
        }
        Ok(())
    }

    fn max_block_size(&self) -> usize {
        1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::Probe;

    #[test]
    fn flash_requires_unlocking() {
        let fake = FakeProbe::stm32l051();
        let state = fake.state();
        let mut probe = Probe::new(fake);
        probe.attach().unwrap();

        probe.write_memory(0x0800_0000, &[0xff; 4]).unwrap();
        assert_eq!(state.lock().unwrap().flash[..4], [0x00; 4]);

        // Unlock PECR and program memory.
        probe.write_word_32(stm32l0::PKEYR, stm32l0::PEKEY1).unwrap();
        probe.write_word_32(stm32l0::PKEYR, stm32l0::PEKEY2).unwrap();
        probe.write_word_32(stm32l0::PRGKEYR, stm32l0::PRGKEY1).unwrap();
        probe.write_word_32(stm32l0::PRGKEYR, stm32l0::PRGKEY2).unwrap();
        probe.write_word_32(stm32l0::PECR, stm32l0::PECR_PROG).unwrap();

        probe.write_memory(0x0800_0000, &[0xff; 4]).unwrap();
        assert_eq!(state.lock().unwrap().flash[..4], [0xff; 4]);
    }

    #[test]
    fn programming_only_sets_bits() {
        let fake = FakeProbe::stm32l051();
        let state = fake.state();
        {
            let mut state = state.lock().unwrap();
            state.pecr = stm32l0::PECR_PROG;
            state.flash[0] = 0xf0;
        }
        let mut probe = Probe::new(fake);
        probe.attach().unwrap();

        probe.write_memory(0x0800_0000, &[0x0f, 0x0f, 0x0f, 0x0f]).unwrap();
        assert_eq!(state.lock().unwrap().flash[0], 0xff);
    }

    #[test]
    fn halt_state_tracks_dhcsr() {
        let mut probe = Probe::new(FakeProbe::stm32l051());
        probe.attach().unwrap();

        probe
            .write_word_32(cortex_m::DHCSR, (0xa05f << 16) | 0b11)
            .unwrap();
        let dhcsr = probe.read_word_32(cortex_m::DHCSR).unwrap();
        assert_ne!(dhcsr & (1 << 17), 0, "S_HALT should be set");

        probe
            .write_word_32(cortex_m::DHCSR, (0xa05f << 16) | 0b01)
            .unwrap();
        let dhcsr = probe.read_word_32(cortex_m::DHCSR).unwrap();
        assert_eq!(dhcsr & (1 << 17), 0, "S_HALT should be clear");
    }
}
