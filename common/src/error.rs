use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::partition::PartitionInfo;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("access at 0x{offset:x} (+{len}) is outside the partition")]
    OutOfBounds { offset: u32, len: usize },
    #[error("access at 0x{offset:x} (+{len}) is not aligned to the write granularity")]
    Misaligned { offset: u32, len: usize },
    #[error("program at 0x{offset:x} needs an erase first")]
    NotErased { offset: u32 },
    #[error("device error: {0}")]
    Device(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::Device(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("write of {attempted} bytes would exceed capacity of {capacity} bytes")]
    OverCapacity { capacity: u32, attempted: u64 },
    #[error(transparent)]
    Write(#[from] StorageError),
    #[error("stream is closed")]
    Closed,
    #[error("partition {0} is the running partition")]
    TargetsRunning(PartitionInfo),
    #[error("partition {0} is not aligned to the write granularity")]
    Misaligned(PartitionInfo),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("http status {0}")]
    Status(u16),
    #[error("transfer timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("response body is empty")]
    EmptyBody,
    #[error("transfer cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BootError {
    #[error("slot {slot} does not exist ({count} configured)")]
    UnknownSlot { slot: u8, count: u8 },
    #[error("boot record did not persist")]
    NotPersisted,
    #[error("boot layout has {count} slots, expected 1 to {max}")]
    SlotCount { count: usize, max: usize },
    #[error("boot record needs {needed} bytes but the partition holds {available}")]
    RecordTooLarge { needed: usize, available: u32 },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("update plan has no items")]
    Empty,
    #[error("update plan was already started")]
    AlreadyStarted,
    #[error("item {item} has an invalid url: {reason}")]
    InvalidUrl { item: usize, reason: &'static str },
    #[error("item {item} has an invalid sha256 digest")]
    InvalidDigest { item: usize },
    #[error("items {first} and {second} target overlapping partitions")]
    Overlapping { first: usize, second: usize },
    #[error("item {item} targets the running partition {partition}")]
    TargetsRunning { item: usize, partition: PartitionInfo },
    #[error("item {item} targets reserved region {region}")]
    TargetsReserved { item: usize, region: PartitionInfo },
    #[error("item {item} target {partition} is not aligned to the write granularity")]
    Misaligned { item: usize, partition: PartitionInfo },
    #[error("boot slot {0} does not exist")]
    UnknownSlot(u8),
    #[error("boot slot {0} is already running")]
    SlotAlreadyRunning(u8),
    #[error("plan has {count} items, limit is {limit}")]
    TooManyItems { count: usize, limit: usize },
    #[error("boot configuration unavailable: {0}")]
    BootConfig(BootError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Write,
    OverCapacity,
    PlanValidation,
    BootSwitch,
    Verification,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateError {
    #[error("item {item} transfer failed: {source}")]
    Transport {
        item: usize,
        #[source]
        source: TransportError,
    },
    #[error("item {item} storage write failed: {source}")]
    Write {
        item: usize,
        #[source]
        source: StorageError,
    },
    #[error("item {item} exceeds partition capacity of {capacity} bytes")]
    OverCapacity { item: usize, capacity: u32 },
    #[error("invalid update plan: {0}")]
    Plan(#[from] PlanError),
    #[error("boot slot switch failed: {0}")]
    BootSwitch(#[source] BootError),
    #[error("item {item} sha256 mismatch (expected {expected}, got {actual})")]
    Verification {
        item: usize,
        expected: String,
        actual: String,
    },
    #[error("update cancelled")]
    Cancelled,
}

impl UpdateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Write { .. } => ErrorKind::Write,
            Self::OverCapacity { .. } => ErrorKind::OverCapacity,
            Self::Plan(_) => ErrorKind::PlanValidation,
            Self::BootSwitch(_) => ErrorKind::BootSwitch,
            Self::Verification { .. } => ErrorKind::Verification,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub(crate) fn from_stream(item: usize, err: StreamError) -> Self {
        match err {
            StreamError::OverCapacity { capacity, .. } => Self::OverCapacity { item, capacity },
            StreamError::Write(source) => Self::Write { item, source },
            StreamError::Closed => Self::Write {
                item,
                source: StorageError::Device("write stream already closed".to_string()),
            },
            StreamError::TargetsRunning(partition) => {
                Self::Plan(PlanError::TargetsRunning { item, partition })
            }
            StreamError::Misaligned(partition) => {
                Self::Plan(PlanError::Misaligned { item, partition })
            }
        }
    }
}
