//! A debug session: an attached probe bound to a verified target.
//!
//! The session is the only path to target memory for the layers above.
//! It verifies at attach time that the connected core belongs to the
//! selected family, retries transient transport timeouts, and poisons
//! itself on unrecoverable faults so no further half-valid accesses reach
//! the wire.

use std::time::{Duration, Instant};

use crate::error::Error;
use crate::probe::{DebugProbe, DebugProbeError, Probe};
use crate::target::{cortex_m, TargetFamily};

/// Transient timeouts are retried this many times before the session
/// gives up and poisons itself.
const TRANSPORT_RETRIES: usize = 3;

pub struct Session {
    probe: Probe,
    family: &'static TargetFamily,
    poisoned: bool,
}

impl Session {
    /// Attaches the probe and verifies the connected core.
    ///
    /// A core that does not match the family is detached again and
    /// reported as [`Error::UnsupportedTarget`]: continuing against an
    /// unexpected chip risks flashing the wrong memory map.
    pub fn attach(mut probe: Probe, family: &'static TargetFamily) -> Result<Self, Error> {
        probe.attach().map_err(Error::from)?;

        let mut session = Self {
            probe,
            family,
            poisoned: false,
        };

        let cpuid = match session.read_word_32(cortex_m::CPUID) {
            Ok(cpuid) => cpuid,
            Err(e) => {
                let _ = session.probe.detach();
                return Err(e);
            }
        };

        if !family.matches_core(cpuid) {
            let _ = session.probe.detach();
            return Err(Error::UnsupportedTarget(format!(
                "CPUID {:08x} does not match a {} core",
                cpuid, family.name
            )));
        }

        tracing::debug!("Attached to {} target, CPUID {:08x}", family.name, cpuid);

        Ok(session)
    }

    /// Creates a session around an already constructed probe without
    /// opening USB devices. The core check still applies.
    pub fn attach_probe(
        probe: impl DebugProbe + 'static,
        family: &'static TargetFamily,
    ) -> Result<Self, Error> {
        Self::attach(Probe::new(probe), family)
    }

    pub fn family(&self) -> &'static TargetFamily {
        self.family
    }

    pub fn speed_khz(&self) -> u32 {
        self.probe.speed_khz()
    }

    /// The largest block the underlying probe moves per transfer; flash
    /// programming chunks writes at this granularity.
    pub fn max_block_size(&self) -> usize {
        self.probe.max_block_size()
    }

    fn with_retry<T>(
        &mut self,
        mut op: impl FnMut(&mut Probe) -> Result<T, DebugProbeError>,
    ) -> Result<T, Error> {
        if self.poisoned {
            return Err(Error::Transport(DebugProbeError::NotAttached));
        }

        let mut attempt = 0;
        loop {
            match op(&mut self.probe) {
                Ok(value) => return Ok(value),
                Err(DebugProbeError::Timeout) if attempt + 1 < TRANSPORT_RETRIES => {
                    attempt += 1;
                    tracing::warn!("Transport timeout, retry {}", attempt);
                }
                Err(e) => {
                    self.poisoned = true;
                    return Err(Error::Transport(e));
                }
            }
        }
    }

    pub fn read_word_32(&mut self, address: u32) -> Result<u32, Error> {
        self.with_retry(|probe| probe.read_word_32(address))
    }

    pub fn write_word_32(&mut self, address: u32, value: u32) -> Result<(), Error> {
        self.with_retry(|probe| probe.write_word_32(address, value))
    }

    pub fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error> {
        self.with_retry(|probe| probe.read_memory(address, data))
    }

    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        self.with_retry(|probe| probe.write_memory(address, data))
    }

    /// Halts the core, waiting up to `timeout` for the halt to take
    /// effect.
    pub fn halt_core(&mut self, timeout: Duration) -> Result<(), Error> {
        let mut dhcsr = cortex_m::Dhcsr(0);
        dhcsr.set_c_debugen(true);
        dhcsr.set_c_halt(true);
        dhcsr.enable_write();
        self.write_word_32(cortex_m::DHCSR, dhcsr.into())?;

        let deadline = Instant::now() + timeout;
        while !self.core_halted()? {
            if Instant::now() > deadline {
                return Err(Error::Transport(DebugProbeError::Timeout));
            }
        }
        Ok(())
    }

    /// Resumes execution. Debug stays enabled so the core can be halted
    /// again without renegotiating.
    pub fn resume_core(&mut self) -> Result<(), Error> {
        let mut dhcsr = cortex_m::Dhcsr(0);
        dhcsr.set_c_debugen(true);
        dhcsr.enable_write();
        self.write_word_32(cortex_m::DHCSR, dhcsr.into())
    }

    pub fn core_halted(&mut self) -> Result<bool, Error> {
        let dhcsr = cortex_m::Dhcsr(self.read_word_32(cortex_m::DHCSR)?);
        Ok(dhcsr.s_halt())
    }

    /// Ends the session, leaving the target running.
    pub fn detach(mut self) -> Result<(), Error> {
        let result = self.probe.detach().map_err(Error::from);
        // Suppresses the second detach in Drop.
        self.poisoned = true;
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.poisoned {
            let _ = self.probe.detach();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("family", &self.family.name)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}
