//! Memory access through a MEM-AP, for adapters that only expose raw
//! debug-port transfers.
//!
//! The ST-Link moves memory with native probe commands; every other family
//! goes through the default access port here: CSW configures word-sized
//! auto-incrementing transfers, TAR holds the address, DRW moves the data.

use super::{DebugProbeError, PortType};

/// Debug-port register addresses.
pub(crate) mod dp {
    pub const ABORT: u8 = 0x0;
    pub const CTRL_STAT: u8 = 0x4;
    pub const SELECT: u8 = 0x8;
    pub const RDBUFF: u8 = 0xC;
}

/// MEM-AP register addresses within bank 0.
pub(crate) mod ap {
    pub const CSW: u8 = 0x0;
    pub const TAR: u8 = 0x4;
    pub const DRW: u8 = 0xC;
}

/// CSW value for 32-bit, single auto-increment transfers with debug
/// software access enabled.
const CSW_WORD_INCR: u32 = 0x2300_0052;

/// TAR auto-increment is only guaranteed within a 1 KiB region.
const TAR_WRAP: u32 = 0x400;

/// Raw register access to the debug port and the default access port.
///
/// Implementors must return AP read data unposted: if the underlying wire
/// protocol posts AP reads (raw SWD does), the implementation is expected
/// to chase them with an RDBUFF read itself.
pub(crate) trait DapAccess {
    fn read_dap_register(&mut self, port: PortType, addr: u8) -> Result<u32, DebugProbeError>;

    fn write_dap_register(
        &mut self,
        port: PortType,
        addr: u8,
        value: u32,
    ) -> Result<(), DebugProbeError>;
}

/// Selects AP 0, bank 0 and configures word transfers.
fn prepare<P: DapAccess + ?Sized>(probe: &mut P) -> Result<(), DebugProbeError> {
    probe.write_dap_register(PortType::DebugPort, dp::SELECT, 0)?;
    probe.write_dap_register(PortType::AccessPort, ap::CSW, CSW_WORD_INCR)
}

fn read_words<P: DapAccess + ?Sized>(
    probe: &mut P,
    mut address: u32,
    words: &mut [u32],
) -> Result<(), DebugProbeError> {
    let mut i = 0;
    while i < words.len() {
        probe.write_dap_register(PortType::AccessPort, ap::TAR, address)?;

        // Words until the next auto-increment wrap boundary.
        let in_block = ((TAR_WRAP - (address % TAR_WRAP)) / 4) as usize;
        let chunk = in_block.min(words.len() - i);

        for word in &mut words[i..i + chunk] {
            *word = probe.read_dap_register(PortType::AccessPort, ap::DRW)?;
        }

        address += (chunk * 4) as u32;
        i += chunk;
    }
    Ok(())
}

fn write_words<P: DapAccess + ?Sized>(
    probe: &mut P,
    mut address: u32,
    words: &[u32],
) -> Result<(), DebugProbeError> {
    let mut i = 0;
    while i < words.len() {
        probe.write_dap_register(PortType::AccessPort, ap::TAR, address)?;

        let in_block = ((TAR_WRAP - (address % TAR_WRAP)) / 4) as usize;
        let chunk = in_block.min(words.len() - i);

        for word in &words[i..i + chunk] {
            probe.write_dap_register(PortType::AccessPort, ap::DRW, *word)?;
        }

        address += (chunk * 4) as u32;
        i += chunk;
    }
    Ok(())
}

/// Reads `data.len()` bytes from `address`, at any alignment.
///
/// The transfer is widened to the covering word-aligned range and the
/// requested slice extracted, so unaligned edges cost one extra word.
pub(crate) fn read_memory<P: DapAccess + ?Sized>(
    probe: &mut P,
    address: u32,
    data: &mut [u8],
) -> Result<(), DebugProbeError> {
    if data.is_empty() {
        return Ok(());
    }

    prepare(probe)?;

    let start = address & !3;
    let end = (address + data.len() as u32 + 3) & !3;
    let mut words = vec![0u32; ((end - start) / 4) as usize];
    read_words(probe, start, &mut words)?;

    let mut bytes = Vec::with_capacity(words.len() * 4);
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    let offset = (address - start) as usize;
    data.copy_from_slice(&bytes[offset..offset + data.len()]);

    Ok(())
}

/// Writes `data` to `address`, at any alignment.
///
/// Unaligned head and tail words are read back first and merged, so the
/// neighbouring bytes keep their value.
pub(crate) fn write_memory<P: DapAccess + ?Sized>(
    probe: &mut P,
    address: u32,
    data: &[u8],
) -> Result<(), DebugProbeError> {
    if data.is_empty() {
        return Ok(());
    }

    prepare(probe)?;

    let start = address & !3;
    let end = (address + data.len() as u32 + 3) & !3;

    let mut bytes = vec![0u8; (end - start) as usize];

    // Merge partially covered edge words.
    if address != start {
        let mut head = [0u32];
        read_words(probe, start, &mut head)?;
        bytes[..4].copy_from_slice(&head[0].to_le_bytes());
    }
    if (address + data.len() as u32) != end {
        let mut tail = [0u32];
        read_words(probe, end - 4, &mut tail)?;
        let len = bytes.len();
        bytes[len - 4..].copy_from_slice(&tail[0].to_le_bytes());
    }

    let offset = (address - start) as usize;
    bytes[offset..offset + data.len()].copy_from_slice(data);

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    write_words(probe, start, &words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// A word-addressed fake bus implementing just enough of the DP/AP
    /// register file for the MEM-AP algorithms.
    #[derive(Default)]
    struct FakeDap {
        memory: HashMap<u32, u32>,
        select: u32,
        csw: u32,
        tar: u32,
    }

    impl DapAccess for FakeDap {
        fn read_dap_register(
            &mut self,
            port: PortType,
            addr: u8,
        ) -> Result<u32, DebugProbeError> {
            match (port, addr) {
                (PortType::AccessPort, ap::DRW) => {
                    let value = *self.memory.get(&self.tar).unwrap_or(&0xffff_ffff);
                    if self.csw & 0x10 != 0 {
                        self.tar = self.tar.wrapping_add(4);
                    }
                    Ok(value)
                }
                (PortType::AccessPort, ap::TAR) => Ok(self.tar),
                (PortType::DebugPort, dp::SELECT) => Ok(self.select),
                _ => Ok(0),
            }
        }

        fn write_dap_register(
            &mut self,
            port: PortType,
            addr: u8,
            value: u32,
        ) -> Result<(), DebugProbeError> {
            match (port, addr) {
                (PortType::AccessPort, ap::CSW) => self.csw = value,
                (PortType::AccessPort, ap::TAR) => self.tar = value,
                (PortType::AccessPort, ap::DRW) => {
                    self.memory.insert(self.tar, value);
                    if self.csw & 0x10 != 0 {
                        self.tar = self.tar.wrapping_add(4);
                    }
                }
                (PortType::DebugPort, dp::SELECT) => self.select = value,
                _ => (),
            }
            Ok(())
        }
    }

    #[test]
    fn aligned_round_trip() {
        let mut dap = FakeDap::default();
        let data = [1, 2, 3, 4, 5, 6, 7, 8];
        write_memory(&mut dap, 0x2000_0000, &data).unwrap();

        let mut readback = [0u8; 8];
        read_memory(&mut dap, 0x2000_0000, &mut readback).unwrap();
        assert_eq!(data, readback);
    }

    #[test]
    fn unaligned_write_preserves_neighbours() {
        let mut dap = FakeDap::default();
        write_memory(&mut dap, 0x2000_0000, &[0xAA; 12]).unwrap();

        // Overwrite the middle at odd offsets.
        write_memory(&mut dap, 0x2000_0003, &[0x55; 5]).unwrap();

        let mut readback = [0u8; 12];
        read_memory(&mut dap, 0x2000_0000, &mut readback).unwrap();
        assert_eq!(
            readback,
            [0xAA, 0xAA, 0xAA, 0x55, 0x55, 0x55, 0x55, 0x55, 0xAA, 0xAA, 0xAA, 0xAA]
        );
    }

    #[test]
    fn crosses_autoincrement_boundary() {
        let mut dap = FakeDap::default();
        let data: Vec<u8> = (0..=255).collect();

        // Start just below a 1 KiB wrap boundary.
        write_memory(&mut dap, 0x2000_03F0, &data).unwrap();

        let mut readback = vec![0u8; data.len()];
        read_memory(&mut dap, 0x2000_03F0, &mut readback).unwrap();
        assert_eq!(data, readback);
    }
}
