use std::collections::BTreeMap;

use super::download::FileDownloadError;

/// Staging area for firmware data before it is written to the target.
///
/// Data is collected as sorted, non-overlapping, maximally merged
/// segments. Overlapping adds are rejected: two image parts claiming the
/// same address is a broken image, and silently letting one win would
/// flash something neither the file nor the caller describes.
#[derive(Debug, Default)]
pub struct FlashLoader {
    segments: BTreeMap<u32, Vec<u8>>,
}

impl FlashLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages `data` at `address`, merging with adjacent segments.
    pub fn add_data(&mut self, address: u32, data: &[u8]) -> Result<(), FileDownloadError> {
        if data.is_empty() {
            return Ok(());
        }

        let end = address as u64 + data.len() as u64;

        // The previous segment must end at or before our start.
        if let Some((start, segment)) = self.segments.range(..=address).next_back() {
            let segment_end = *start as u64 + segment.len() as u64;
            if segment_end > address as u64 {
                return Err(FileDownloadError::Overlap { address });
            }
        }
        // The next segment must start at or after our end.
        if let Some((start, _)) = self.segments.range(address..).next() {
            if (*start as u64) < end {
                return Err(FileDownloadError::Overlap { address: *start });
            }
        }

        // Merge with a directly preceding segment.
        let mut address = address;
        let mut merged: Vec<u8>;
        if let Some((start, segment)) = self.segments.range_mut(..address).next_back() {
            if *start as u64 + segment.len() as u64 == address as u64 {
                let start = *start;
                merged = self.segments.remove(&start).unwrap_or_default();
                merged.extend_from_slice(data);
                address = start;
            } else {
                merged = data.to_vec();
            }
        } else {
            merged = data.to_vec();
        }

        // Merge with a directly following segment.
        let merged_end = address as u64 + merged.len() as u64;
        if let Some((&next_start, _)) = self.segments.range(address..).next() {
            if next_start as u64 == merged_end {
                let next = self.segments.remove(&next_start).unwrap_or_default();
                merged.extend_from_slice(&next);
            }
        }

        self.segments.insert(address, merged);
        Ok(())
    }

    /// The staged segments, sorted by address.
    pub fn segments(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.segments
            .iter()
            .map(|(address, data)| (*address, data.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Total number of staged bytes.
    pub fn total_len(&self) -> usize {
        self.segments.values().map(Vec::len).sum()
    }

    /// The address range covered by the staged data, as `(first, last + 1)`.
    pub fn extent(&self) -> Option<(u32, u32)> {
        let (first, _) = self.segments.iter().next()?;
        let (last_start, last) = self.segments.iter().next_back()?;
        Some((*first, last_start + last.len() as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn contiguous_segments_merge() {
        let mut loader = FlashLoader::new();
        loader.add_data(0x100, &[1, 2]).unwrap();
        loader.add_data(0x104, &[5, 6]).unwrap();
        loader.add_data(0x102, &[3, 4]).unwrap();

        let segments: Vec<_> = loader.segments().collect();
        assert_eq!(segments, vec![(0x100, &[1u8, 2, 3, 4, 5, 6][..])]);
    }

    #[test]
    fn disjoint_segments_stay_separate() {
        let mut loader = FlashLoader::new();
        loader.add_data(0x100, &[1]).unwrap();
        loader.add_data(0x200, &[2]).unwrap();

        assert_eq!(loader.segments().count(), 2);
        assert_eq!(loader.total_len(), 2);
        assert_eq!(loader.extent(), Some((0x100, 0x201)));
    }

    #[test]
    fn overlap_is_rejected() {
        let mut loader = FlashLoader::new();
        loader.add_data(0x100, &[0; 8]).unwrap();

        assert!(matches!(
            loader.add_data(0x104, &[0; 8]),
            Err(FileDownloadError::Overlap { .. })
        ));
        // Overlap from below.
        assert!(matches!(
            loader.add_data(0x0FC, &[0; 8]),
            Err(FileDownloadError::Overlap { .. })
        ));
        // Exact duplicate.
        assert!(matches!(
            loader.add_data(0x100, &[0; 8]),
            Err(FileDownloadError::Overlap { .. })
        ));

        // The staged data is unchanged after rejected adds.
        assert_eq!(loader.total_len(), 8);
    }

    #[test]
    fn empty_add_is_a_no_op() {
        let mut loader = FlashLoader::new();
        loader.add_data(0x100, &[]).unwrap();
        assert!(loader.is_empty());
        assert_eq!(loader.extent(), None);
    }
}
