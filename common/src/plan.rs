use serde::{Deserialize, Serialize};

use crate::{
    boot::BootTarget,
    error::PlanError,
    partition::{Partition, PartitionInfo},
    stream::PartitionWriteStream,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionState {
    Pending,
    InProgress,
    Complete,
    Failed,
}

/// One image of an update: where it comes from and which partition it lands in.
///
/// The partition handle is moved into a write stream when the item starts.
#[derive(Debug)]
pub struct ItemDescriptor<P: Partition> {
    source_url: String,
    target: PartitionInfo,
    expected_sha256: Option<String>,
    partition: Option<P>,
    stream: Option<PartitionWriteStream<P>>,
    bytes_written: u64,
    state: CompletionState,
}

impl<P: Partition> ItemDescriptor<P> {
    fn new(source_url: String, partition: P, expected_sha256: Option<String>) -> Self {
        Self {
            source_url,
            target: partition.info(),
            expected_sha256,
            partition: Some(partition),
            stream: None,
            bytes_written: 0,
            state: CompletionState::Pending,
        }
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn target(&self) -> &PartitionInfo {
        &self.target
    }

    pub fn expected_sha256(&self) -> Option<&str> {
        self.expected_sha256.as_deref()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn state(&self) -> CompletionState {
        self.state
    }

    pub(crate) fn sector_size(&self) -> Option<u32> {
        self.partition.as_ref().map(Partition::sector_size)
    }

    pub(crate) fn take_partition(&mut self) -> Option<P> {
        self.partition.take()
    }

    pub(crate) fn stream_mut(&mut self) -> Option<&mut PartitionWriteStream<P>> {
        self.stream.as_mut()
    }

    pub(crate) fn begin(&mut self, stream: PartitionWriteStream<P>) {
        self.stream = Some(stream);
        self.state = CompletionState::InProgress;
    }

    pub(crate) fn record_written(&mut self, total: u64) {
        self.bytes_written = total;
    }

    pub(crate) fn set_state(&mut self, state: CompletionState) {
        self.state = state;
    }

    /// Terminates the stream without flushing its partial word.
    pub(crate) fn abandon(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            stream.abandon();
        }
    }
}

/// Ordered list of items plus the boot slot to select once all of them land.
#[derive(Debug)]
pub struct UpdatePlan<P: Partition> {
    items: Vec<ItemDescriptor<P>>,
    target: BootTarget,
}

impl<P: Partition> Default for UpdatePlan<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Partition> UpdatePlan<P> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            target: BootTarget::NoSwitch,
        }
    }

    /// Appends an item and returns its index in transfer order.
    pub fn add_item(&mut self, url: impl Into<String>, partition: P) -> usize {
        self.add_item_with_digest(url, partition, None)
    }

    pub fn add_item_with_digest(
        &mut self,
        url: impl Into<String>,
        partition: P,
        sha256: Option<String>,
    ) -> usize {
        let sha256 = sha256.map(|value| value.trim().to_ascii_lowercase());
        self.items
            .push(ItemDescriptor::new(url.into().trim().to_string(), partition, sha256));
        self.items.len() - 1
    }

    pub fn set_target_slot(&mut self, target: BootTarget) {
        self.target = target;
    }

    pub fn target(&self) -> BootTarget {
        self.target
    }

    pub fn items(&self) -> &[ItemDescriptor<P>] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn item_mut(&mut self, index: usize) -> Option<&mut ItemDescriptor<P>> {
        self.items.get_mut(index)
    }

    /// Checks that need nothing but the plan itself.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.items.is_empty() {
            return Err(PlanError::Empty);
        }

        for (index, item) in self.items.iter().enumerate() {
            validate_url(&item.source_url).map_err(|reason| PlanError::InvalidUrl {
                item: index,
                reason,
            })?;

            if let Some(sha256) = item.expected_sha256.as_deref() {
                if !is_sha256_hex(sha256) {
                    return Err(PlanError::InvalidDigest { item: index });
                }
            }

            let sector_aligned = item
                .sector_size()
                .map(|sector| {
                    sector != 0 && item.target.address % sector == 0 && item.target.size % sector == 0
                })
                .unwrap_or(true);
            if !item.target.is_aligned() || !sector_aligned || item.target.size == 0 {
                return Err(PlanError::Misaligned {
                    item: index,
                    partition: item.target.clone(),
                });
            }
        }

        for (first, a) in self.items.iter().enumerate() {
            for (offset, b) in self.items[first + 1..].iter().enumerate() {
                if a.target.overlaps(&b.target) {
                    return Err(PlanError::Overlapping {
                        first,
                        second: first + 1 + offset,
                    });
                }
            }
        }

        Ok(())
    }
}

pub fn validate_url(url: &str) -> Result<(), &'static str> {
    let url = url.trim();
    if url.is_empty() {
        return Err("url cannot be empty");
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err("url must start with http:// or https://");
    }
    Ok(())
}

pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::flash::{MemoryFlash, MemoryPartition};

    fn part(flash: &MemoryFlash, name: &str, address: u32, size: u32) -> MemoryPartition {
        flash
            .partition(PartitionInfo::new(name, address, size))
            .unwrap()
    }

    #[test]
    fn items_keep_insertion_order() {
        let flash = MemoryFlash::new(0x10000);
        let mut plan = UpdatePlan::new();

        assert_eq!(plan.add_item("http://h/a.bin", part(&flash, "a", 0x2000, 0x1000)), 0);
        assert_eq!(plan.add_item(" https://h/b.bin ", part(&flash, "b", 0x4000, 0x1000)), 1);

        let urls: Vec<_> = plan.items().iter().map(|item| item.source_url()).collect();
        assert_eq!(urls, vec!["http://h/a.bin", "https://h/b.bin"]);
        assert!(plan
            .items()
            .iter()
            .all(|item| item.state() == CompletionState::Pending && item.bytes_written() == 0));
        assert_eq!(plan.target(), BootTarget::NoSwitch);
        plan.validate().unwrap();
    }

    #[test]
    fn empty_plan_is_rejected() {
        let plan: UpdatePlan<MemoryPartition> = UpdatePlan::new();
        assert_eq!(plan.validate(), Err(PlanError::Empty));
    }

    #[test]
    fn overlapping_targets_are_rejected() {
        let flash = MemoryFlash::new(0x10000);
        let mut plan = UpdatePlan::new();
        plan.add_item("http://h/a", part(&flash, "a", 0x2000, 0x2000));
        plan.add_item("http://h/b", part(&flash, "b", 0x8000, 0x1000));
        plan.add_item("http://h/c", part(&flash, "c", 0x3000, 0x1000));

        assert_eq!(
            plan.validate(),
            Err(PlanError::Overlapping {
                first: 0,
                second: 2
            })
        );
    }

    #[test]
    fn bad_urls_and_digests_are_rejected() {
        let flash = MemoryFlash::new(0x10000);

        let mut plan = UpdatePlan::new();
        plan.add_item("ftp://h/a", part(&flash, "a", 0x2000, 0x1000));
        assert_eq!(
            plan.validate(),
            Err(PlanError::InvalidUrl {
                item: 0,
                reason: "url must start with http:// or https://"
            })
        );

        let mut plan = UpdatePlan::new();
        plan.add_item_with_digest(
            "http://h/a",
            part(&flash, "a", 0x2000, 0x1000),
            Some("abc".to_string()),
        );
        assert_eq!(plan.validate(), Err(PlanError::InvalidDigest { item: 0 }));
    }

    #[test]
    fn digest_is_normalised_to_lowercase() {
        let flash = MemoryFlash::new(0x10000);
        let mut plan = UpdatePlan::new();
        plan.add_item_with_digest(
            "http://h/a",
            part(&flash, "a", 0x2000, 0x1000),
            Some(format!(" {} ", "AB".repeat(32))),
        );

        assert_eq!(plan.items()[0].expected_sha256(), Some("ab".repeat(32).as_str()));
        plan.validate().unwrap();
    }

    #[test]
    fn unaligned_target_is_rejected() {
        let flash = MemoryFlash::new(0x10000);
        let mut plan = UpdatePlan::new();
        plan.add_item("http://h/a", part(&flash, "a", 0x2000, 0x1800));

        assert!(matches!(
            plan.validate(),
            Err(PlanError::Misaligned { item: 0, .. })
        ));
    }
}
