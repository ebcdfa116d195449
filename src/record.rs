use log::debug;
use std::fmt::Display;

/// A contiguous span of target memory and its contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryRecord {
    pub address: u32,
    pub data: Vec<u8>,
}

impl MemoryRecord {
    pub fn new(address: u32, data: Vec<u8>) -> Self {
        MemoryRecord { address, data }
    }

    /// A zero-filled record, used as the receive buffer when reading memory back from a device.
    pub fn zeroed(address: u32, size: u32) -> Self {
        MemoryRecord {
            address,
            data: vec![0u8; size as usize],
        }
    }

    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// First address past the end of this record, or [None] if that lies beyond 32 bits.
    pub fn end(&self) -> Option<u32> {
        self.address.checked_add(self.size())
    }
}

impl Display for MemoryRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:#010x} +{:#x}", self.address, self.data.len())
    }
}

/// Stable sort by address, then by size. Zero-sized records therefore come first at a given
/// address, which lets [merge_adjacent] fold them into their neighbour.
pub fn sort(records: &mut [MemoryRecord]) {
    records.sort_by_key(|r| (r.address, r.size()));
}

/// Coalesce each run of records where one ends exactly where the next begins. Only neighbours in
/// sequence order are considered, so unsorted input is merged only where it already happens to be
/// contiguous.
pub fn merge_adjacent(records: Vec<MemoryRecord>) -> Vec<MemoryRecord> {
    let before = records.len();
    let mut merged: Vec<MemoryRecord> = Vec::with_capacity(before);

    for mut next in records {
        match merged.last_mut() {
            Some(prev) if prev.end() == Some(next.address) => prev.data.append(&mut next.data),
            _ => merged.push(next),
        }
    }

    debug!("Merged {before} records into {}", merged.len());
    merged
}
