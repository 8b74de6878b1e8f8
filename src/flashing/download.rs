use std::path::Path;
use std::str::FromStr;

use ihex::Record;
use object::elf::{FileHeader32, PT_LOAD};
use object::read::elf::{FileHeader, ProgramHeader};
use object::Endianness;
use thiserror::Error;

use super::loader::FlashLoader;

/// The firmware image formats the engine accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Raw binary, flashed to the family's flash base.
    Bin,
    /// Intel HEX, addresses taken from the records.
    Hex,
    /// 32 bit ELF, loadable segments at their physical addresses.
    Elf,
}

impl FromStr for Format {
    type Err = FileDownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bin" | "binary" => Ok(Format::Bin),
            "hex" | "ihex" | "intelhex" => Ok(Format::Hex),
            "elf" => Ok(Format::Elf),
            other => Err(FileDownloadError::UnknownFormat(other.to_string())),
        }
    }
}

impl Format {
    /// Infers the format from a file extension.
    pub fn from_path(path: &Path) -> Result<Format, FileDownloadError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(extension) => extension.parse(),
            None => Err(FileDownloadError::UnknownFormat(
                path.display().to_string(),
            )),
        }
    }
}

#[derive(Error, Debug)]
pub enum FileDownloadError {
    #[error("Unknown image format '{0}'")]
    UnknownFormat(String),
    #[error("The image contains no loadable data")]
    NoLoadableSegments,
    #[error("Image segments overlap at address {address:#010x}")]
    Overlap { address: u32 },
    #[error("Failed to parse ELF file: {0}")]
    Object(&'static str),
    #[error(transparent)]
    Elf(#[from] object::Error),
    #[error("Failed to parse Intel HEX file: {0}")]
    IhexRead(#[from] ihex::ReaderError),
    #[error("Intel HEX file is not valid UTF-8")]
    IhexEncoding,
}

/// Stages a raw binary at `base`.
pub fn load_bin(
    loader: &mut FlashLoader,
    data: &[u8],
    base: u32,
) -> Result<(), FileDownloadError> {
    if data.is_empty() {
        return Err(FileDownloadError::NoLoadableSegments);
    }
    loader.add_data(base, data)
}

/// Stages an Intel HEX image. Extended linear and extended segment
/// address records move the 64 KiB window; data records land inside it.
pub fn load_hex(loader: &mut FlashLoader, data: &[u8]) -> Result<(), FileDownloadError> {
    let text = std::str::from_utf8(data).map_err(|_| FileDownloadError::IhexEncoding)?;

    let mut base_address: u32 = 0;
    let mut any_data = false;

    for record in ihex::Reader::new(text) {
        match record? {
            Record::Data { offset, value } => {
                loader.add_data(base_address + offset as u32, &value)?;
                any_data = true;
            }
            Record::ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            Record::ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            Record::EndOfFile => break,
            Record::StartLinearAddress(_) | Record::StartSegmentAddress { .. } => (),
        }
    }

    if !any_data {
        return Err(FileDownloadError::NoLoadableSegments);
    }
    Ok(())
}

/// Stages the loadable segments of a 32 bit ELF at their physical (load)
/// addresses. A `p_memsz` beyond `p_filesz` is zero-filled, matching what
/// a loader would do for `.bss`-like regions placed in flash.
pub fn load_elf(loader: &mut FlashLoader, data: &[u8]) -> Result<(), FileDownloadError> {
    let elf = FileHeader32::<Endianness>::parse(data)?;
    let endian = elf.endian()?;

    let mut any_data = false;

    for header in elf.program_headers(endian, data)? {
        if header.p_type(endian) != PT_LOAD {
            continue;
        }

        let address = header.p_paddr(endian);
        let segment = header
            .data(endian, data)
            .map_err(|_| FileDownloadError::Object("segment data out of bounds"))?;
        let memsz = header.p_memsz(endian);

        if !segment.is_empty() {
            loader.add_data(address, segment)?;
            any_data = true;
        }

        if memsz > segment.len() as u32 {
            let fill = vec![0u8; (memsz - segment.len() as u32) as usize];
            loader.add_data(address + segment.len() as u32, &fill)?;
            any_data = true;
        }
    }

    if !any_data {
        return Err(FileDownloadError::NoLoadableSegments);
    }
    Ok(())
}

/// Stages image bytes of the given format into the loader.
pub fn load_image(
    loader: &mut FlashLoader,
    data: &[u8],
    format: Format,
    bin_base: u32,
) -> Result<(), FileDownloadError> {
    match format {
        Format::Bin => load_bin(loader, data, bin_base),
        Format::Hex => load_hex(loader, data),
        Format::Elf => load_elf(loader, data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn format_parsing() {
        assert_eq!("bin".parse::<Format>().unwrap(), Format::Bin);
        assert_eq!("IHEX".parse::<Format>().unwrap(), Format::Hex);
        assert_eq!("elf".parse::<Format>().unwrap(), Format::Elf);
        assert!("exe".parse::<Format>().is_err());

        assert_eq!(
            Format::from_path(Path::new("firmware.hex")).unwrap(),
            Format::Hex
        );
        assert!(Format::from_path(Path::new("firmware")).is_err());
    }

    #[test]
    fn bin_lands_at_base() {
        let mut loader = FlashLoader::new();
        load_bin(&mut loader, &[1, 2, 3, 4], 0x0800_0000).unwrap();

        let segments: Vec<_> = loader.segments().collect();
        assert_eq!(segments, vec![(0x0800_0000, &[1u8, 2, 3, 4][..])]);
    }

    #[test]
    fn hex_with_extended_linear_address() {
        // Four data records covering 0x08000000..0x08000100.
        let records = vec![
            Record::ExtendedLinearAddress(0x0800),
            Record::Data {
                offset: 0x0000,
                value: (0..64).collect(),
            },
            Record::Data {
                offset: 0x0040,
                value: (64..128).collect(),
            },
            Record::Data {
                offset: 0x0080,
                value: (128..192).collect(),
            },
            Record::Data {
                offset: 0x00C0,
                value: (192..=255).collect(),
            },
            Record::EndOfFile,
        ];
        let text = ihex::create_object_file_representation(&records).unwrap();

        let mut loader = FlashLoader::new();
        load_hex(&mut loader, text.as_bytes()).unwrap();

        let segments: Vec<_> = loader.segments().collect();
        assert_eq!(segments.len(), 1, "contiguous records must merge");
        let (address, data) = segments[0];
        assert_eq!(address, 0x0800_0000);
        assert_eq!(data, (0..=255).collect::<Vec<u8>>().as_slice());
    }

    #[test]
    fn hex_without_data_is_rejected() {
        let records = vec![Record::EndOfFile];
        let text = ihex::create_object_file_representation(&records).unwrap();

        let mut loader = FlashLoader::new();
        assert!(matches!(
            load_hex(&mut loader, text.as_bytes()),
            Err(FileDownloadError::NoLoadableSegments)
        ));
    }

    #[test]
    fn hex_with_bad_checksum_is_rejected() {
        // Four data bytes at offset 0; the correct checksum would be 0xF2.
        let text = ":04000000010203045A\n:00000001FF\n";

        let mut loader = FlashLoader::new();
        assert!(matches!(
            load_hex(&mut loader, text.as_bytes()),
            Err(FileDownloadError::IhexRead(_))
        ));
    }

    /// A minimal little-endian ELF32 with a single PT_LOAD segment at
    /// 0x08000000. `memsz` beyond the payload models a `.bss`-like tail.
    fn little_endian_elf(payload: &[u8], memsz: u32) -> Vec<u8> {
        let mut elf = Vec::new();
        // e_ident: magic, ELFCLASS32, ELFDATA2LSB, version 1.
        elf.extend_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]);
        elf.extend_from_slice(&[0u8; 8]);
        elf.extend_from_slice(&2u16.to_le_bytes()); // e_type: ET_EXEC
        elf.extend_from_slice(&40u16.to_le_bytes()); // e_machine: EM_ARM
        elf.extend_from_slice(&1u32.to_le_bytes()); // e_version
        elf.extend_from_slice(&0x0800_0000u32.to_le_bytes()); // e_entry
        elf.extend_from_slice(&52u32.to_le_bytes()); // e_phoff
        elf.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
        elf.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        elf.extend_from_slice(&52u16.to_le_bytes()); // e_ehsize
        elf.extend_from_slice(&32u16.to_le_bytes()); // e_phentsize
        elf.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
        elf.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
        elf.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        elf.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

        elf.extend_from_slice(&1u32.to_le_bytes()); // p_type: PT_LOAD
        elf.extend_from_slice(&84u32.to_le_bytes()); // p_offset
        elf.extend_from_slice(&0x0800_0000u32.to_le_bytes()); // p_vaddr
        elf.extend_from_slice(&0x0800_0000u32.to_le_bytes()); // p_paddr
        elf.extend_from_slice(&(payload.len() as u32).to_le_bytes()); // p_filesz
        elf.extend_from_slice(&memsz.to_le_bytes()); // p_memsz
        elf.extend_from_slice(&5u32.to_le_bytes()); // p_flags: R+X
        elf.extend_from_slice(&4u32.to_le_bytes()); // p_align

        elf.extend_from_slice(payload);
        elf
    }

    #[test]
    fn elf_segment_lands_at_load_address() {
        let elf = little_endian_elf(&[0xDE, 0xAD, 0xBE, 0xEF], 4);

        let mut loader = FlashLoader::new();
        load_elf(&mut loader, &elf).unwrap();

        let segments: Vec<_> = loader.segments().collect();
        assert_eq!(
            segments,
            vec![(0x0800_0000, &[0xDEu8, 0xAD, 0xBE, 0xEF][..])]
        );
    }

    #[test]
    fn elf_memsz_tail_is_zero_filled() {
        let elf = little_endian_elf(&[0xDE, 0xAD, 0xBE, 0xEF], 8);

        let mut loader = FlashLoader::new();
        load_elf(&mut loader, &elf).unwrap();

        let segments: Vec<_> = loader.segments().collect();
        assert_eq!(
            segments,
            vec![(0x0800_0000, &[0xDEu8, 0xAD, 0xBE, 0xEF, 0, 0, 0, 0][..])]
        );
    }

    #[test]
    fn garbage_elf_is_rejected() {
        let mut loader = FlashLoader::new();
        assert!(load_elf(&mut loader, b"not an elf").is_err());
    }
}
