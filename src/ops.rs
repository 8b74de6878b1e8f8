//! The operations exposed to embedding applications: probe discovery,
//! erase, identify and flash.
//!
//! Each target-touching operation opens its own probe, runs on a blocking
//! worker thread and tears the session down before returning. The
//! `*_with_session` variants carry the actual logic and work against any
//! session, including ones built around in-process probes.

use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::flashing::{self, DownloadOptions, FlashLoader, Format};
use crate::probe::{DebugProbeError, DebugProbeSelector, Probe, Probes};
use crate::session::Session;
use crate::target::{identify, TargetFamily, TargetIdentity};

/// Debug-clock default, a conservative speed every supported probe and
/// target can run.
pub const DEFAULT_SPEED_KHZ: u32 = 1_800;

/// Identification is a handful of register reads; a probe that cannot
/// finish within this deadline is considered wedged.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(3);

const HALT_TIMEOUT: Duration = Duration::from_millis(500);

/// Lists all connected debug probes across all supported families.
pub fn list_all_probes() -> Probes {
    Probes {
        probes: Probe::list_all(),
    }
}

/// The probe speed is a hint: a probe that rejects the requested value
/// keeps its default instead of failing the whole operation.
fn apply_speed(probe: &mut Probe, speed_khz: Option<u32>) {
    let requested = speed_khz.unwrap_or(DEFAULT_SPEED_KHZ);
    match probe.set_speed(requested) {
        Ok(actual) => tracing::debug!("Probe speed set to {} kHz", actual),
        Err(e) => tracing::warn!(
            "Requested probe speed {} kHz not applied: {}",
            requested,
            e
        ),
    }
}

fn open_session(
    selector: DebugProbeSelector,
    chip: Option<&str>,
    speed_khz: Option<u32>,
) -> Result<Session, Error> {
    let mut probe = Probe::open(selector)?;
    apply_speed(&mut probe, speed_khz);
    Session::attach(probe, TargetFamily::from_chip_name(chip))
}

/// Halts, erases all of flash, confirms it blank and resumes.
///
/// A cancelled token stops the erase between pages, leaving the target
/// halted and the flash partially erased.
pub fn erase_with_session(session: &mut Session, cancel: &CancellationToken) -> Result<(), Error> {
    session.halt_core(HALT_TIMEOUT)?;
    flashing::erase_all(session, cancel)?;
    flashing::blank_check(session)?;
    session.resume_core()
}

/// Halts, reads the chip's identity registers and resumes.
pub fn identify_with_session(session: &mut Session) -> Result<TargetIdentity, Error> {
    session.halt_core(HALT_TIMEOUT)?;
    let identity = identify(session)?;
    session.resume_core()?;
    Ok(identity)
}

/// Erases the target connected to the selected probe.
pub async fn erase_target(
    selector: DebugProbeSelector,
    chip: Option<String>,
    speed_khz: Option<u32>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    run_blocking(move || {
        let mut session = open_session(selector, chip.as_deref(), speed_khz)?;
        erase_with_session(&mut session, &cancel)?;
        session.detach()
    })
    .await
}

/// Reads the identity of the target connected to the selected probe.
pub async fn identify_target(
    selector: DebugProbeSelector,
    chip: Option<String>,
    speed_khz: Option<u32>,
) -> Result<TargetIdentity, Error> {
    let work = run_blocking(move || {
        let mut session = open_session(selector, chip.as_deref(), speed_khz)?;
        let identity = identify_with_session(&mut session)?;
        session.detach()?;
        Ok(identity)
    });

    match tokio::time::timeout(IDENTIFY_TIMEOUT, work).await {
        Ok(result) => result,
        Err(_) => Err(Error::Transport(DebugProbeError::Timeout)),
    }
}

/// Options for [`flash_firmware_file`].
#[derive(Debug, Clone, Default)]
pub struct FlashOptions {
    /// Chip name selecting the target family, e.g. "STM32L051K8".
    pub chip: Option<String>,
    /// Image format; inferred from the file extension when `None`.
    pub format: Option<Format>,
    /// Skip the full-chip erase before programming.
    pub skip_erase: bool,
    /// Debug-clock speed hint in kHz.
    pub speed_khz: Option<u32>,
    /// Cancelling aborts between write chunks, leaving the target halted.
    pub cancel: CancellationToken,
}

/// Loads a firmware file and programs it to the target connected to the
/// selected probe, verifying the result.
pub async fn flash_firmware_file(
    selector: DebugProbeSelector,
    path: PathBuf,
    options: FlashOptions,
) -> Result<(), Error> {
    run_blocking(move || {
        let format = match options.format {
            Some(format) => format,
            None => Format::from_path(&path)?,
        };
        let data = std::fs::read(&path)?;

        let family = TargetFamily::from_chip_name(options.chip.as_deref());
        let mut loader = FlashLoader::new();
        flashing::load_image(&mut loader, &data, format, family.flash_base)?;

        let mut session = open_session(selector, options.chip.as_deref(), options.speed_khz)?;
        let download_options = DownloadOptions {
            skip_erase: options.skip_erase,
            cancel: options.cancel.clone(),
        };
        flashing::download(&mut session, &loader, &download_options)?;
        session.detach()
    })
    .await
}

async fn run_blocking<T, F>(f: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Error> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => Err(Error::Other(anyhow::anyhow!("worker task failed: {e}"))),
    }
}
