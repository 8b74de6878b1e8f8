use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::erase;
use super::loader::FlashLoader;
use crate::error::Error;
use crate::flashing::FileDownloadError;
use crate::session::Session;
use crate::target::stm32l0;

const HALT_TIMEOUT: Duration = Duration::from_millis(500);

/// Options for a flash download.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Skip the full-chip erase before programming. Only correct when the
    /// written range is known to be blank; verification will catch it
    /// otherwise.
    pub skip_erase: bool,
    /// Checked between write chunks; a cancelled token aborts the
    /// download with [`Error::Cancelled`], leaving the target halted.
    pub cancel: CancellationToken,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            skip_erase: false,
            cancel: CancellationToken::new(),
        }
    }
}

/// Writes the staged image to the target and verifies it.
///
/// Sequence: halt, erase (unless skipped), program, byte-exact readback
/// verify, resume. Any failure returns with the target still halted so a
/// half-programmed chip cannot start executing.
pub fn download(
    session: &mut Session,
    loader: &FlashLoader,
    options: &DownloadOptions,
) -> Result<(), Error> {
    if loader.is_empty() {
        return Err(FileDownloadError::NoLoadableSegments.into());
    }

    if let Some((start, end)) = loader.extent() {
        tracing::info!(
            "Downloading {} bytes to {:#010x}..{:#010x}",
            loader.total_len(),
            start,
            end
        );

        // An image past the end of flash can never verify; reject it
        // before touching the chip.
        if let Some(size) = erase::flash_size(session)? {
            let flash_end = session.family().flash_base + size;
            if end > flash_end {
                return Err(Error::ImageTooLarge { end, flash_end });
            }
        }
    }

    session.halt_core(HALT_TIMEOUT)?;

    if !options.skip_erase {
        erase::erase_all(session, &options.cancel)?;
    }

    let has_nvm_lock = session.family().has_eraser;
    if has_nvm_lock {
        erase::unlock(session)?;
        session.write_word_32(stm32l0::PECR, stm32l0::PECR_PROG)?;
    }

    let result = program(session, loader, options);

    let lock_result = if has_nvm_lock {
        erase::lock(session)
    } else {
        Ok(())
    };
    result?;
    lock_result?;

    verify(session, loader)?;

    session.resume_core()
}

fn program(
    session: &mut Session,
    loader: &FlashLoader,
    options: &DownloadOptions,
) -> Result<(), Error> {
    let block_size = session.max_block_size();

    for (address, data) in loader.segments() {
        for (i, chunk) in data.chunks(block_size).enumerate() {
            if options.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let chunk_address = address + (i * block_size) as u32;
            session.write_memory(chunk_address, chunk).map_err(|e| match e {
                Error::Transport(source) => Error::FlashWriteFailed {
                    address: chunk_address,
                    source,
                },
                other => other,
            })?;
        }
    }
    Ok(())
}

/// Byte-exact comparison of flash contents against the staged image.
fn verify(session: &mut Session, loader: &FlashLoader) -> Result<(), Error> {
    let block_size = session.max_block_size();
    let mut readback = vec![0u8; block_size];

    for (address, data) in loader.segments() {
        for (i, chunk) in data.chunks(block_size).enumerate() {
            let chunk_address = address + (i * block_size) as u32;
            let readback = &mut readback[..chunk.len()];
            session.read_memory(chunk_address, readback)?;

            if let Some(index) = readback
                .iter()
                .zip(chunk.iter())
                .position(|(actual, expected)| actual != expected)
            {
                return Err(Error::FlashVerifyFailed {
                    address: chunk_address + index as u32,
                });
            }
        }
    }
    Ok(())
}
