use std::sync::{Arc, Mutex, PoisonError};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    error::BootError,
    partition::{Partition, PartitionInfo, WRITE_GRANULARITY},
};

pub const BOOT_CONFIG_MAGIC: u8 = 0xE1;
pub const BOOT_CONFIG_VERSION: u8 = 0x01;
pub const MAX_SLOTS: usize = 4;

const CHECKSUM_INIT: u8 = 0xEF;
const HEADER_LEN: usize = 8;
const SLOT_ENTRY_LEN: usize = 8;
const MAX_RECORD_LEN: usize = HEADER_LEN + MAX_SLOTS * SLOT_ENTRY_LEN + 1;

/// Boot-slot selection. `NoSwitch` leaves the boot record alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootTarget {
    #[default]
    NoSwitch,
    Slot(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotEntry {
    pub address: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootConfig {
    pub mode: u8,
    pub current: u8,
    pub slots: Vec<SlotEntry>,
}

impl BootConfig {
    pub fn new(slots: Vec<SlotEntry>) -> Result<Self, BootError> {
        let config = Self {
            mode: 0,
            current: 0,
            slots,
        };
        config.check_slot_count()?;
        Ok(config)
    }

    /// The on-flash count field and slot table hold at most `MAX_SLOTS` entries.
    pub fn check_slot_count(&self) -> Result<(), BootError> {
        let count = self.slots.len();
        if count == 0 || count > MAX_SLOTS {
            return Err(BootError::SlotCount {
                count,
                max: MAX_SLOTS,
            });
        }
        Ok(())
    }

    /// Length of the encoded record after padding to the write granularity.
    pub fn record_len(&self) -> usize {
        let len = HEADER_LEN + self.slots.len() * SLOT_ENTRY_LEN + 1;
        len.div_ceil(WRITE_GRANULARITY) * WRITE_GRANULARITY
    }

    pub fn count(&self) -> u8 {
        self.slots.len() as u8
    }

    pub fn slot_partition(&self, slot: u8) -> Option<PartitionInfo> {
        self.slots
            .get(slot as usize)
            .map(|entry| PartitionInfo::new(slot_name(slot), entry.address, entry.size))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAX_RECORD_LEN);
        out.extend_from_slice(&[
            BOOT_CONFIG_MAGIC,
            BOOT_CONFIG_VERSION,
            self.mode,
            self.current,
            self.count(),
            0,
            0,
            0,
        ]);
        for entry in &self.slots {
            out.extend_from_slice(&entry.address.to_le_bytes());
            out.extend_from_slice(&entry.size.to_le_bytes());
        }
        out.push(checksum(&out));
        out
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() < HEADER_LEN + 1
            || raw[0] != BOOT_CONFIG_MAGIC
            || raw[1] != BOOT_CONFIG_VERSION
        {
            return None;
        }

        let count = raw[4] as usize;
        if count == 0 || count > MAX_SLOTS {
            return None;
        }

        let body_len = HEADER_LEN + count * SLOT_ENTRY_LEN;
        if raw.len() < body_len + 1 || raw[body_len] != checksum(&raw[..body_len]) {
            return None;
        }

        let slots = raw[HEADER_LEN..body_len]
            .chunks_exact(SLOT_ENTRY_LEN)
            .map(|entry| SlotEntry {
                address: u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]),
                size: u32::from_le_bytes([entry[4], entry[5], entry[6], entry[7]]),
            })
            .collect();

        Some(Self {
            mode: raw[2],
            current: raw[3],
            slots,
        })
    }
}

pub fn slot_name(slot: u8) -> String {
    format!("rom{slot}")
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(CHECKSUM_INIT, |acc, byte| acc ^ byte)
}

/// Persisted record of which slot is executing and which one boots next.
pub trait BootConfigStore {
    /// Slot the device is executing from right now.
    fn current(&self) -> Result<u8, BootError>;

    fn next_boot(&self) -> Result<u8, BootError>;

    fn slot_count(&self) -> Result<u8, BootError>;

    fn complementary(&self, current: u8) -> Result<u8, BootError> {
        let count = self.slot_count()?;
        if current >= count {
            return Err(BootError::UnknownSlot {
                slot: current,
                count,
            });
        }
        Ok((current + 1) % count)
    }

    /// Selects the slot for the next boot. Durable once this returns `Ok`.
    fn set_current(&mut self, slot: u8) -> Result<(), BootError>;

    fn slot_partition(&self, slot: u8) -> Result<PartitionInfo, BootError>;

    fn running_partition(&self) -> Result<PartitionInfo, BootError> {
        self.slot_partition(self.current()?)
    }

    /// Regions no update may ever target.
    fn reserved(&self) -> Vec<PartitionInfo> {
        Vec::new()
    }

    /// A restart would boot a different image than the one executing. Also
    /// true when the running image is not a slot (factory app).
    fn switch_pending(&self) -> bool {
        match (self.current(), self.next_boot()) {
            (Ok(current), Ok(next)) => current != next,
            (Err(_), Ok(_)) => true,
            (_, Err(_)) => false,
        }
    }
}

impl<S: BootConfigStore> BootConfigStore for Arc<Mutex<S>> {
    fn current(&self) -> Result<u8, BootError> {
        self.lock().unwrap_or_else(PoisonError::into_inner).current()
    }

    fn next_boot(&self) -> Result<u8, BootError> {
        self.lock().unwrap_or_else(PoisonError::into_inner).next_boot()
    }

    fn slot_count(&self) -> Result<u8, BootError> {
        self.lock().unwrap_or_else(PoisonError::into_inner).slot_count()
    }

    fn complementary(&self, current: u8) -> Result<u8, BootError> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .complementary(current)
    }

    fn set_current(&mut self, slot: u8) -> Result<(), BootError> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_current(slot)
    }

    fn slot_partition(&self, slot: u8) -> Result<PartitionInfo, BootError> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .slot_partition(slot)
    }

    fn running_partition(&self) -> Result<PartitionInfo, BootError> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .running_partition()
    }

    fn reserved(&self) -> Vec<PartitionInfo> {
        self.lock().unwrap_or_else(PoisonError::into_inner).reserved()
    }
}

/// Boot record kept in a dedicated flash sector.
#[derive(Debug)]
pub struct FlashBootConfigStore<P: Partition> {
    partition: P,
    config: BootConfig,
    running: u8,
}

impl<P: Partition> FlashBootConfigStore<P> {
    /// Reads the record, replacing a blank or corrupt one with `default`. The
    /// slot selected at this point is treated as the running slot.
    pub fn open(partition: P, default: BootConfig) -> Result<Self, BootError> {
        default.check_slot_count()?;
        let needed = default.record_len();
        if needed > partition.size() as usize {
            return Err(BootError::RecordTooLarge {
                needed,
                available: partition.size(),
            });
        }

        let mut raw = [0xFF_u8; MAX_RECORD_LEN];
        let len = raw.len().min(partition.size() as usize);
        partition.read(0, &mut raw[..len])?;

        let mut store = Self {
            partition,
            config: default.clone(),
            running: 0,
        };

        let mut config = match BootConfig::decode(&raw[..len]) {
            Some(config) => config,
            None => {
                warn!("boot config missing or corrupt; writing default");
                store.persist(&default)?;
                default
            }
        };

        if config.current >= config.count() {
            warn!(
                "boot config selects unknown slot {}; defaulting to 0",
                config.current
            );
            config.current = 0;
            store.persist(&config)?;
        }

        store.running = config.current;
        store.config = config;
        Ok(store)
    }

    pub fn config(&self) -> &BootConfig {
        &self.config
    }

    fn persist(&mut self, config: &BootConfig) -> Result<(), BootError> {
        let mut record = config.encode();
        record.resize(config.record_len(), 0xFF);

        self.partition.erase(0)?;
        self.partition.write(0, &record)?;
        self.partition.sync()?;

        let mut readback = vec![0_u8; record.len()];
        self.partition.read(0, &mut readback)?;
        if readback != record {
            return Err(BootError::NotPersisted);
        }
        Ok(())
    }
}

impl<P: Partition> BootConfigStore for FlashBootConfigStore<P> {
    fn current(&self) -> Result<u8, BootError> {
        Ok(self.running)
    }

    fn next_boot(&self) -> Result<u8, BootError> {
        Ok(self.config.current)
    }

    fn slot_count(&self) -> Result<u8, BootError> {
        Ok(self.config.count())
    }

    fn set_current(&mut self, slot: u8) -> Result<(), BootError> {
        let count = self.config.count();
        if slot >= count {
            return Err(BootError::UnknownSlot { slot, count });
        }

        let mut next = self.config.clone();
        next.current = slot;
        self.persist(&next)?;
        self.config = next;

        info!("boot slot set to {slot} (running {})", self.running);
        Ok(())
    }

    fn slot_partition(&self, slot: u8) -> Result<PartitionInfo, BootError> {
        self.config
            .slot_partition(slot)
            .ok_or(BootError::UnknownSlot {
                slot,
                count: self.config.count(),
            })
    }

    fn reserved(&self) -> Vec<PartitionInfo> {
        let mut info = self.partition.info();
        info.name = "bootconfig".to_string();
        vec![info]
    }
}
