use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Smallest unit the storage device can program. Every write issued to a
/// [`Partition`] starts on a multiple of this and covers exactly this many bytes.
pub const WRITE_GRANULARITY: usize = 4;

pub const DEFAULT_SECTOR_SIZE: u32 = 4096;

/// Location of a partition in device address space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub name: String,
    pub address: u32,
    pub size: u32,
}

impl PartitionInfo {
    pub fn new(name: impl Into<String>, address: u32, size: u32) -> Self {
        Self {
            name: name.into(),
            address,
            size,
        }
    }

    pub fn end(&self) -> u64 {
        self.address as u64 + self.size as u64
    }

    pub fn overlaps(&self, other: &PartitionInfo) -> bool {
        (self.address as u64) < other.end() && (other.address as u64) < self.end()
    }

    pub fn same_region(&self, other: &PartitionInfo) -> bool {
        self.address == other.address && self.size == other.size
    }

    pub fn is_aligned(&self) -> bool {
        self.address as usize % WRITE_GRANULARITY == 0 && self.size as usize % WRITE_GRANULARITY == 0
    }
}

impl fmt::Display for PartitionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@0x{:08x}+0x{:x}", self.name, self.address, self.size)
    }
}

/// Handle to one region of raw storage. Offsets are relative to the start of
/// the partition. The handle does not own the device; cloning it yields
/// another view of the same bytes.
pub trait Partition {
    fn info(&self) -> PartitionInfo;

    fn address(&self) -> u32 {
        self.info().address
    }

    fn size(&self) -> u32 {
        self.info().size
    }

    fn sector_size(&self) -> u32 {
        DEFAULT_SECTOR_SIZE
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError>;

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), StorageError>;

    /// Erases the sector starting at `offset`, which must be sector aligned.
    fn erase(&mut self, offset: u32) -> Result<(), StorageError>;

    /// Makes every prior write durable.
    fn sync(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

pub(crate) fn check_bounds(
    info: &PartitionInfo,
    offset: u32,
    len: usize,
) -> Result<(), StorageError> {
    if offset as u64 + len as u64 > info.size as u64 {
        return Err(StorageError::OutOfBounds { offset, len });
    }
    Ok(())
}
