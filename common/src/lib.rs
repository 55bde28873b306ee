pub mod boot;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod flash;
pub mod partition;
pub mod plan;
pub mod stream;
pub mod transport;
pub mod types;

pub use boot::{BootConfig, BootConfigStore, BootTarget, FlashBootConfigStore, SlotEntry};
pub use config::{FlashLayout, UpdaterConfig};
pub use coordinator::{Completion, CompletionCallback, CoordinatorState, Outcome, UpdateCoordinator};
pub use error::{
    BootError, ErrorKind, PlanError, StorageError, StreamError, TransportError, UpdateError,
};
pub use flash::{FlashOp, MemoryFlash, MemoryPartition};
pub use partition::{Partition, PartitionInfo, DEFAULT_SECTOR_SIZE, WRITE_GRANULARITY};
pub use plan::{CompletionState, ItemDescriptor, UpdatePlan};
pub use stream::PartitionWriteStream;
pub use transport::{FetchRequest, FetchTransport, ItemOutcome, RequestTemplate, TransferEvent};
pub use types::{BootStatus, ErrorReport, ItemStatus, UpdateStatus};
