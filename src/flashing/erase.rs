use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::session::Session;
use crate::target::stm32l0;

/// A single page erase finishes in tens of microseconds; anything beyond
/// this means the controller is wedged.
const PAGE_ERASE_TIMEOUT: Duration = Duration::from_millis(200);

/// Unlocks the program memory of the flash controller via its two key
/// registers. Safe to call when already unlocked.
pub(super) fn unlock(session: &mut Session) -> Result<(), Error> {
    session.write_word_32(stm32l0::PKEYR, stm32l0::PEKEY1)?;
    session.write_word_32(stm32l0::PKEYR, stm32l0::PEKEY2)?;
    session.write_word_32(stm32l0::PRGKEYR, stm32l0::PRGKEY1)?;
    session.write_word_32(stm32l0::PRGKEYR, stm32l0::PRGKEY2)?;
    Ok(())
}

/// Relocks the flash controller. Every path out of an erase or program
/// sequence ends here, error paths included.
pub(super) fn lock(session: &mut Session) -> Result<(), Error> {
    session.write_word_32(stm32l0::PECR, stm32l0::PECR_PELOCK)
}

fn wait_while_busy(
    session: &mut Session,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let deadline = Instant::now() + timeout;
    loop {
        let sr = session.read_word_32(stm32l0::SR)?;
        if sr & stm32l0::SR_BSY == 0 {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if Instant::now() > deadline {
            return Err(Error::EraseTimeout);
        }
    }
}

/// The flash size as the chip reports it, falling back to nothing when
/// the family has no size register.
pub(super) fn flash_size(session: &mut Session) -> Result<Option<u32>, Error> {
    match session.family().flash_size_address {
        Some(address) => {
            let kib = session.read_word_32(address)? & 0xffff;
            Ok(Some(kib * 1024))
        }
        None => Ok(None),
    }
}

/// Erases all of program flash, page by page. The core must already be
/// halted.
///
/// Erasing an already blank chip is a no-op that still succeeds, so
/// callers can erase unconditionally. A cancelled token stops the erase
/// between pages and between busy-poll iterations; already erased pages
/// stay erased.
pub fn erase_all(session: &mut Session, cancel: &CancellationToken) -> Result<(), Error> {
    let family = session.family();
    if !family.has_eraser {
        return Err(Error::UnsupportedTarget(format!(
            "no erase algorithm for {}",
            family.name
        )));
    }

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    // A permanently protected chip ignores erase requests; fail up front
    // instead of timing out against it.
    let rdp = session.read_word_32(stm32l0::OPTR)? & 0xff;
    if rdp == stm32l0::RDP_LEVEL_2 as u32 {
        return Err(Error::TargetProtected);
    }

    let size = flash_size(session)?.ok_or_else(|| {
        Error::UnsupportedTarget(format!("{} does not report its flash size", family.name))
    })?;
    let pages = size / family.page_size;

    tracing::info!(
        "Erasing {} KiB of flash ({} pages of {} bytes)",
        size / 1024,
        pages,
        family.page_size
    );

    unlock(session)?;

    let result: Result<(), Error> = (|| {
        session.write_word_32(stm32l0::PECR, stm32l0::PECR_ERASE | stm32l0::PECR_PROG)?;

        for page in 0..pages {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let address = family.flash_base + page * family.page_size;
            session.write_word_32(address, 0)?;
            wait_while_busy(session, PAGE_ERASE_TIMEOUT, cancel)?;
        }
        Ok(())
    })();

    let lock_result = lock(session);
    result?;
    lock_result
}

/// Reads back the whole flash and checks it against the family's erased
/// value.
pub fn blank_check(session: &mut Session) -> Result<(), Error> {
    let family = session.family();
    let Some(size) = flash_size(session)? else {
        return Ok(());
    };
    let erased = family.erased_byte;

    let mut buffer = vec![0u8; 1024];
    let mut address = family.flash_base;
    let end = family.flash_base + size;

    while address < end {
        let chunk = buffer.len().min((end - address) as usize);
        session.read_memory(address, &mut buffer[..chunk])?;

        if let Some(index) = buffer[..chunk].iter().position(|byte| *byte != erased) {
            return Err(Error::EraseVerifyFailed {
                address: address + index as u32,
            });
        }
        address += chunk as u32;
    }
    Ok(())
}
