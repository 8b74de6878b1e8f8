//! Target families and chip identification.
//!
//! A family bundles everything the engine needs to know about a line of
//! chips: where flash lives, how big its pages are, which erased value it
//! reads back, and which core ids are plausible for it. Chip names select
//! a family by prefix; an unknown name falls back to a generic Cortex-M
//! profile that can flash but not erase.

use serde::Serialize;

use crate::error::Error;
use crate::session::Session;

/// Cortex-M core debug registers.
pub mod cortex_m {
    use bitfield::bitfield;

    pub const CPUID: u32 = 0xE000_ED00;
    pub const DHCSR: u32 = 0xE000_EDF0;

    bitfield! {
        #[derive(Copy, Clone)]
        pub struct Dhcsr(u32);
        impl Debug;
        pub c_debugen, set_c_debugen: 0;
        pub c_halt, set_c_halt: 1;
        pub c_step, set_c_step: 2;
        pub s_regrdy, _: 16;
        pub s_halt, _: 17;
        pub s_lockup, _: 19;
    }

    impl Dhcsr {
        /// Writes to this register are ignored unless the upper half
        /// carries the debug key.
        pub fn enable_write(&mut self) {
            self.0 = (self.0 & 0xffff) | (0xa05f << 16);
        }
    }

    impl From<u32> for Dhcsr {
        fn from(value: u32) -> Self {
            Self(value)
        }
    }

    impl From<Dhcsr> for u32 {
        fn from(value: Dhcsr) -> Self {
            value.0
        }
    }

    bitfield! {
        #[derive(Copy, Clone)]
        pub struct Cpuid(u32);
        impl Debug;
        pub implementer, _: 31, 24;
        pub variant, _: 23, 20;
        pub partno, _: 15, 4;
    }

    impl From<u32> for Cpuid {
        fn from(value: u32) -> Self {
            Self(value)
        }
    }
}

/// STM32L0 flash controller interface.
pub mod stm32l0 {
    pub const PECR: u32 = 0x4002_2004;
    pub const PKEYR: u32 = 0x4002_200C;
    pub const PRGKEYR: u32 = 0x4002_2010;
    pub const SR: u32 = 0x4002_2018;
    pub const OPTR: u32 = 0x4002_201C;

    pub const PEKEY1: u32 = 0x89AB_CDEF;
    pub const PEKEY2: u32 = 0x0203_0405;
    pub const PRGKEY1: u32 = 0x8C9D_AEBF;
    pub const PRGKEY2: u32 = 0x1314_1516;

    pub const PECR_PELOCK: u32 = 1 << 0;
    pub const PECR_PRGLOCK: u32 = 1 << 1;
    pub const PECR_PROG: u32 = 1 << 3;
    pub const PECR_ERASE: u32 = 1 << 9;

    pub const SR_BSY: u32 = 1 << 0;
    pub const SR_EOP: u32 = 1 << 1;
    pub const SR_WRPERR: u32 = 1 << 8;

    /// Read-out protection byte in OPTR. 0xAA is level 0 (none), 0xCC is
    /// level 2 (permanent).
    pub const RDP_LEVEL_0: u8 = 0xAA;
    pub const RDP_LEVEL_2: u8 = 0xCC;

    /// 96 bit unique device id.
    pub const UID: [u32; 3] = [0x1FF8_0050, 0x1FF8_0054, 0x1FF8_0058];
    /// Flash size in KiB, 16 bit.
    pub const FLASH_SIZE: u32 = 0x1FF8_007C;

    pub const PAGE_SIZE: u32 = 128;
}

/// CPUID part numbers for the Cortex-M cores.
mod partno {
    pub const CORTEX_M0: u32 = 0xC20;
    pub const CORTEX_M0_PLUS: u32 = 0xC60;
    pub const CORTEX_M3: u32 = 0xC23;
    pub const CORTEX_M4: u32 = 0xC24;
    pub const CORTEX_M7: u32 = 0xC27;
    pub const CORTEX_M33: u32 = 0xD21;

    pub const ALL: &[u32] = &[
        CORTEX_M0,
        CORTEX_M0_PLUS,
        CORTEX_M3,
        CORTEX_M4,
        CORTEX_M7,
        CORTEX_M33,
    ];
}

/// Static description of a chip family.
#[derive(Debug)]
pub struct TargetFamily {
    pub name: &'static str,
    /// Chip name prefixes selecting this family, matched case-insensitively.
    prefixes: &'static [&'static str],
    /// CPUID part numbers a chip of this family can report.
    core_partnos: &'static [u32],
    pub flash_base: u32,
    pub page_size: u32,
    /// The value every flash byte reads back as after an erase.
    pub erased_byte: u8,
    /// Whether the built-in erase algorithm applies to this family.
    pub has_eraser: bool,
    /// Device-id and flash-size registers, when the family has them.
    pub uid_addresses: Option<[u32; 3]>,
    pub flash_size_address: Option<u32>,
}

static STM32L0: TargetFamily = TargetFamily {
    name: "STM32L0",
    prefixes: &["stm32l0"],
    core_partnos: &[partno::CORTEX_M0_PLUS],
    flash_base: 0x0800_0000,
    page_size: stm32l0::PAGE_SIZE,
    erased_byte: 0x00,
    has_eraser: true,
    uid_addresses: Some(stm32l0::UID),
    flash_size_address: Some(stm32l0::FLASH_SIZE),
};

/// Fallback profile: flashing with a caller-supplied erase state, no
/// erase algorithm, no id registers.
static GENERIC: TargetFamily = TargetFamily {
    name: "Generic Cortex-M",
    prefixes: &[],
    core_partnos: partno::ALL,
    flash_base: 0x0800_0000,
    page_size: 1024,
    erased_byte: 0xFF,
    has_eraser: false,
    uid_addresses: None,
    flash_size_address: None,
};

static FAMILIES: &[&TargetFamily] = &[&STM32L0];

impl TargetFamily {
    /// Selects the family for a chip name by prefix. `None` or an unknown
    /// name yields the generic profile.
    pub fn from_chip_name(name: Option<&str>) -> &'static TargetFamily {
        let Some(name) = name else {
            return &GENERIC;
        };
        let lowered = name.to_lowercase();
        FAMILIES
            .iter()
            .find(|family| {
                family
                    .prefixes
                    .iter()
                    .any(|prefix| lowered.starts_with(prefix))
            })
            .copied()
            .unwrap_or(&GENERIC)
    }

    /// Checks a CPUID value read from the target against the cores this
    /// family ships with.
    pub fn matches_core(&self, cpuid: u32) -> bool {
        let cpuid = cortex_m::Cpuid::from(cpuid);
        self.core_partnos.contains(&cpuid.partno())
    }
}

/// What could be read off a connected chip. Fields are independently
/// optional: a family without id registers still identifies, with both
/// fields empty.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetIdentity {
    pub unique_id: Option<String>,
    pub flash_size: Option<u32>,
}

/// Reads the unique device id and flash size of the connected chip.
///
/// The target must be halted so the reads cannot race the application.
pub fn identify(session: &mut Session) -> Result<TargetIdentity, Error> {
    let family = session.family();

    let unique_id = match family.uid_addresses {
        Some(addresses) => {
            let mut words = [0u32; 3];
            for (word, address) in words.iter_mut().zip(addresses) {
                *word = session.read_word_32(address)?;
            }
            Some(format!("{:08x}{:08x}{:08x}", words[2], words[1], words[0]))
        }
        None => None,
    };

    let flash_size = match family.flash_size_address {
        Some(address) => {
            let kib = session.read_word_32(address)? & 0xffff;
            Some(kib * 1024)
        }
        None => None,
    };

    Ok(TargetIdentity {
        unique_id,
        flash_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chip_name_prefix_selects_family() {
        assert_eq!(TargetFamily::from_chip_name(Some("STM32L051K8")).name, "STM32L0");
        assert_eq!(TargetFamily::from_chip_name(Some("stm32l072cz")).name, "STM32L0");
        assert_eq!(
            TargetFamily::from_chip_name(Some("nRF52840")).name,
            "Generic Cortex-M"
        );
        assert_eq!(TargetFamily::from_chip_name(None).name, "Generic Cortex-M");
    }

    #[test]
    fn dhcsr_write_needs_debug_key() {
        let mut dhcsr = cortex_m::Dhcsr(0);
        dhcsr.set_c_debugen(true);
        dhcsr.set_c_halt(true);
        dhcsr.enable_write();
        assert_eq!(u32::from(dhcsr), 0xa05f_0003);
    }

    #[test]
    fn core_check_uses_partno() {
        // Cortex-M0+ r0p1 CPUID as an STM32L051 reports it.
        assert!(STM32L0.matches_core(0x410C_C601));
        // A Cortex-M4 does not belong to the L0 family.
        assert!(!STM32L0.matches_core(0x410F_C241));
        // The generic profile accepts either.
        assert!(GENERIC.matches_core(0x410C_C601));
        assert!(GENERIC.matches_core(0x410F_C241));
    }
}
