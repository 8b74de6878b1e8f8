pub mod commands {
    // Common commands.
    pub const GET_VERSION: u8 = 0xf1;
    pub const JTAG_COMMAND: u8 = 0xf2;
    pub const DFU_COMMAND: u8 = 0xf3;
    pub const SWIM_COMMAND: u8 = 0xf4;
    pub const GET_CURRENT_MODE: u8 = 0xf5;

    // Commands to exit other modes.
    pub const DFU_EXIT: u8 = 0x07;
    pub const SWIM_EXIT: u8 = 0x01;

    // JTAG commands.
    pub const JTAG_READMEM_32BIT: u8 = 0x07;
    pub const JTAG_WRITEMEM_32BIT: u8 = 0x08;
    pub const JTAG_READMEM_8BIT: u8 = 0x0c;
    pub const JTAG_WRITEMEM_8BIT: u8 = 0x0d;
    pub const JTAG_EXIT: u8 = 0x21;
    pub const JTAG_ENTER2: u8 = 0x30;
    pub const JTAG_GETLASTRWSTATUS2: u8 = 0x3e; // From V2J15
    pub const JTAG_DRIVE_NRST: u8 = 0x3c;
    pub const SWD_SET_FREQ: u8 = 0x43; // From V2J20
    pub const JTAG_READ_DAP_REG: u8 = 0x45; // From V2J24
    pub const JTAG_WRITE_DAP_REG: u8 = 0x46; // From V2J24

    // Parameter for JTAG_ENTER2.
    pub const JTAG_ENTER_SWD: u8 = 0xa3;

    // Parameters for JTAG_DRIVE_NRST.
    pub const JTAG_DRIVE_NRST_LOW: u8 = 0x00;
    pub const JTAG_DRIVE_NRST_HIGH: u8 = 0x01;
    pub const JTAG_DRIVE_NRST_PULSE: u8 = 0x02;
}

/// STLink status codes and messages.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    JtagOk,
    JtagUnknownError,
    JtagSpiError,
    JtagDmaError,
    JtagUnknownJtagChain,
    JtagNoDeviceConnected,
    JtagInternalError,
    JtagCmdWait,
    JtagCmdError,
    JtagGetIdcodeError,
    JtagAlignmentError,
    JtagDbgPowerError,
    JtagWriteError,
    JtagWriteVerifError,
    JtagAlreadyOpenedInOtherMode,
    SwdApWait,
    SwdApFault,
    SwdApError,
    SwdApParityError,
    SwdDpWait,
    SwdDpFault,
    SwdDpError,
    SwdDpParityError,
    SwdApWdataError,
    SwdApStickyError,
    SwdApStickyorunError,
    JtagFreqNotSupported,
    JtagUnknownCmd,
    Other(u8),
}

impl From<u8> for Status {
    fn from(value: u8) -> Status {
        use Status::*;
        match value {
            0x80 => JtagOk,
            0x01 => JtagUnknownError,
            0x02 => JtagSpiError,
            0x03 => JtagDmaError,
            0x04 => JtagUnknownJtagChain,
            0x05 => JtagNoDeviceConnected,
            0x06 => JtagInternalError,
            0x07 => JtagCmdWait,
            0x08 => JtagCmdError,
            0x09 => JtagGetIdcodeError,
            0x0A => JtagAlignmentError,
            0x0B => JtagDbgPowerError,
            0x0C => JtagWriteError,
            0x0D => JtagWriteVerifError,
            0x0E => JtagAlreadyOpenedInOtherMode,
            0x10 => SwdApWait,
            0x11 => SwdApFault,
            0x12 => SwdApError,
            0x13 => SwdApParityError,
            0x14 => SwdDpWait,
            0x15 => SwdDpFault,
            0x16 => SwdDpError,
            0x17 => SwdDpParityError,
            0x18 => SwdApWdataError,
            0x19 => SwdApStickyError,
            0x1A => SwdApStickyorunError,
            0x41 => JtagFreqNotSupported,
            0x42 => JtagUnknownCmd,
            v => Other(v),
        }
    }
}

/// Map from SWD frequency in Hertz to delay loop count.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SwdFrequencyToDelayCount {
    Hz4600000 = 0,
    Hz1800000 = 1, // Default
    Hz1200000 = 2,
    Hz950000 = 3,
    Hz650000 = 5,
    Hz480000 = 7,
    Hz400000 = 9,
    Hz360000 = 10,
    Hz240000 = 15,
    Hz150000 = 25,
    Hz125000 = 31,
    Hz100000 = 40,
}

impl SwdFrequencyToDelayCount {
    /// Try to find an appropriate setting for the given frequency in kHz.
    ///
    /// If a direct match is not found, return the setting for a lower
    /// frequency if possible. If this is not possible, returns `None`.
    pub(crate) fn find_setting(frequency: u32) -> Option<SwdFrequencyToDelayCount> {
        use SwdFrequencyToDelayCount::*;

        Some(match frequency {
            _ if frequency >= 4_600 => Hz4600000,
            _ if frequency >= 1_800 => Hz1800000,
            _ if frequency >= 1_200 => Hz1200000,
            _ if frequency >= 950 => Hz950000,
            _ if frequency >= 650 => Hz650000,
            _ if frequency >= 480 => Hz480000,
            _ if frequency >= 400 => Hz400000,
            _ if frequency >= 360 => Hz360000,
            _ if frequency >= 240 => Hz240000,
            _ if frequency >= 150 => Hz150000,
            _ if frequency >= 125 => Hz125000,
            _ if frequency >= 100 => Hz100000,
            _ => {
                return None;
            }
        })
    }

    /// Get the SWD frequency in kHz.
    pub(crate) fn to_khz(self) -> u32 {
        use SwdFrequencyToDelayCount::*;

        match self {
            Hz4600000 => 4600,
            Hz1800000 => 1800,
            Hz1200000 => 1200,
            Hz950000 => 950,
            Hz650000 => 650,
            Hz480000 => 480,
            Hz400000 => 400,
            Hz360000 => 360,
            Hz240000 => 240,
            Hz150000 => 150,
            Hz125000 => 125,
            Hz100000 => 100,
        }
    }
}

/// Modes returned by GET_CURRENT_MODE.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Device is in DFU (Device Firmware Update) mode.
    Dfu,
    /// Device is in mass storage mode.
    MassStorage,
    /// Device is in JTAG/SWD mode.
    Jtag,
    /// Device is in SWIM (Single Wire Interface) mode.
    Swim,
    Other(u8),
}

impl From<u8> for Mode {
    fn from(value: u8) -> Mode {
        match value {
            0x00 => Mode::Dfu,
            0x01 => Mode::MassStorage,
            0x02 => Mode::Jtag,
            0x03 => Mode::Swim,
            v => Mode::Other(v),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_too_low_swd_speed() {
        assert!(SwdFrequencyToDelayCount::find_setting(0).is_none());
        assert!(SwdFrequencyToDelayCount::find_setting(99).is_none());
    }

    #[test]
    fn test_swd_speed() {
        assert_eq!(
            SwdFrequencyToDelayCount::find_setting(100).unwrap(),
            SwdFrequencyToDelayCount::Hz100000
        );
        assert_eq!(
            SwdFrequencyToDelayCount::find_setting(1_800).unwrap(),
            SwdFrequencyToDelayCount::Hz1800000
        );
        assert_eq!(
            SwdFrequencyToDelayCount::find_setting(u32::MAX).unwrap(),
            SwdFrequencyToDelayCount::Hz4600000
        );
    }
}
