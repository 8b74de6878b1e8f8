//! Everything from firmware image bytes to programmed, verified flash.

mod download;
mod erase;
mod flasher;
mod loader;

pub use download::{load_bin, load_elf, load_hex, load_image, FileDownloadError, Format};
pub use erase::{blank_check, erase_all};
pub use flasher::{download, DownloadOptions};
pub use loader::FlashLoader;
