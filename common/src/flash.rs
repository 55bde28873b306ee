//! In-memory NOR flash used for simulation and tests.
//!
//! Erased bytes read as `0xFF` and programming can only clear bits, so a
//! missing erase shows up as [`StorageError::NotErased`] instead of silently
//! producing the right bytes. Every program/erase is recorded.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{
    error::StorageError,
    partition::{check_bounds, Partition, PartitionInfo, DEFAULT_SECTOR_SIZE, WRITE_GRANULARITY},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashOp {
    Write { address: u32, len: usize },
    Erase { address: u32 },
    Sync,
}

#[derive(Debug)]
struct FlashState {
    data: Vec<u8>,
    ops: Vec<FlashOp>,
    fault_address: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct MemoryFlash {
    state: Arc<Mutex<FlashState>>,
    sector_size: u32,
}

impl MemoryFlash {
    pub fn new(size: u32) -> Self {
        Self::with_sector_size(size, DEFAULT_SECTOR_SIZE)
    }

    pub fn with_sector_size(size: u32, sector_size: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(FlashState {
                data: vec![0xFF; size as usize],
                ops: Vec::new(),
                fault_address: None,
            })),
            sector_size,
        }
    }

    pub fn size(&self) -> u32 {
        self.lock().data.len() as u32
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub fn partition(&self, info: PartitionInfo) -> Result<MemoryPartition, StorageError> {
        if info.end() > self.size() as u64 {
            return Err(StorageError::OutOfBounds {
                offset: info.address,
                len: info.size as usize,
            });
        }
        Ok(MemoryPartition {
            flash: self.clone(),
            info,
        })
    }

    pub fn read_range(&self, address: u32, len: usize) -> Vec<u8> {
        let state = self.lock();
        let start = address as usize;
        state.data[start..start + len].to_vec()
    }

    pub fn ops(&self) -> Vec<FlashOp> {
        self.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }

    /// Makes any program or erase touching `address` fail with a device error.
    pub fn inject_fault(&self, address: u32) {
        self.lock().fault_address = Some(address);
    }

    pub fn clear_fault(&self) {
        self.lock().fault_address = None;
    }

    fn lock(&self) -> MutexGuard<'_, FlashState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FlashState {
    fn check_fault(&self, address: u32, len: usize) -> Result<(), StorageError> {
        match self.fault_address {
            Some(fault) if fault >= address && (fault as u64) < address as u64 + len as u64 => Err(
                StorageError::Device(format!("injected fault at 0x{fault:08x}")),
            ),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryPartition {
    flash: MemoryFlash,
    info: PartitionInfo,
}

impl Partition for MemoryPartition {
    fn info(&self) -> PartitionInfo {
        self.info.clone()
    }

    fn sector_size(&self) -> u32 {
        self.flash.sector_size
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        check_bounds(&self.info, offset, buf.len())?;
        let state = self.flash.lock();
        let start = (self.info.address + offset) as usize;
        buf.copy_from_slice(&state.data[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        let absolute = self.info.address + offset;
        if absolute as usize % WRITE_GRANULARITY != 0 || data.len() % WRITE_GRANULARITY != 0 {
            return Err(StorageError::Misaligned {
                offset,
                len: data.len(),
            });
        }
        check_bounds(&self.info, offset, data.len())?;

        let mut state = self.flash.lock();
        state.check_fault(absolute, data.len())?;

        let start = absolute as usize;
        let target = &mut state.data[start..start + data.len()];
        if let Some(pos) = target
            .iter()
            .zip(data)
            .position(|(old, new)| old & new != *new)
        {
            return Err(StorageError::NotErased {
                offset: offset + pos as u32,
            });
        }
        for (old, new) in target.iter_mut().zip(data) {
            *old &= *new;
        }

        state.ops.push(FlashOp::Write {
            address: absolute,
            len: data.len(),
        });
        Ok(())
    }

    fn erase(&mut self, offset: u32) -> Result<(), StorageError> {
        let sector = self.flash.sector_size;
        let absolute = self.info.address + offset;
        if absolute % sector != 0 {
            return Err(StorageError::Misaligned {
                offset,
                len: sector as usize,
            });
        }
        check_bounds(&self.info, offset, sector as usize)?;

        let mut state = self.flash.lock();
        state.check_fault(absolute, sector as usize)?;

        let start = absolute as usize;
        state.data[start..start + sector as usize].fill(0xFF);
        state.ops.push(FlashOp::Erase { address: absolute });
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        self.flash.lock().ops.push(FlashOp::Sync);
        Ok(())
    }
}
