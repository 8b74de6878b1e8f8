use thiserror::Error;

use crate::flashing::FileDownloadError;
use crate::probe::{DebugProbeError, ProbeCreationError};

/// The error surface of the engine.
///
/// Every failure an operation can report maps to exactly one variant, so
/// callers can branch on kind without string matching. Addresses are
/// included where the failure is tied to a flash location.
#[derive(Error, Debug)]
pub enum Error {
    #[error("The probe could not be found. It may have been disconnected.")]
    ProbeUnavailable,
    #[error("The probe is already in use by another process.")]
    ProbeBusy,
    #[error("Communication with the probe failed")]
    Transport(#[source] DebugProbeError),
    #[error("The connected target is not supported: {0}")]
    UnsupportedTarget(String),
    #[error("The target's flash is read-out protected and cannot be accessed")]
    TargetProtected,
    #[error("Timed out waiting for the erase operation to finish")]
    EraseTimeout,
    #[error("Flash not blank after erase, first non-erased byte at {address:#010x}")]
    EraseVerifyFailed { address: u32 },
    #[error("Writing flash failed at address {address:#010x}")]
    FlashWriteFailed {
        address: u32,
        #[source]
        source: DebugProbeError,
    },
    #[error("Flash verification failed at address {address:#010x}")]
    FlashVerifyFailed { address: u32 },
    #[error("The image ends at {end:#010x}, past the end of flash at {flash_end:#010x}")]
    ImageTooLarge { end: u32, flash_end: u32 },
    #[error("The operation was cancelled")]
    Cancelled,
    #[error("Failed to load the firmware image")]
    Parse(#[from] FileDownloadError),
    #[error("Reading the firmware file failed")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<DebugProbeError> for Error {
    fn from(error: DebugProbeError) -> Self {
        match error {
            DebugProbeError::ProbeCouldNotBeCreated(ProbeCreationError::NotFound) => {
                Error::ProbeUnavailable
            }
            DebugProbeError::ProbeCouldNotBeCreated(ProbeCreationError::Busy) => Error::ProbeBusy,
            DebugProbeError::ProbeCouldNotBeCreated(ProbeCreationError::CouldNotOpen) => {
                Error::ProbeUnavailable
            }
            other => Error::Transport(other),
        }
    }
}
