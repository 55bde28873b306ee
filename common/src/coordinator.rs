use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    boot::{BootConfigStore, BootTarget},
    error::{ErrorKind, PlanError, StorageError, TransportError, UpdateError},
    partition::{Partition, PartitionInfo},
    plan::{CompletionState, ItemDescriptor, UpdatePlan},
    stream::PartitionWriteStream,
    transport::{FetchRequest, FetchTransport, ItemOutcome, RequestTemplate, TransferEvent},
    types::{ErrorReport, ItemStatus, UpdateStatus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Running { item: usize },
    AllSucceeded,
    Aborted,
}

impl CoordinatorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::AllSucceeded | Self::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    NotStarted,
    Running,
    Succeeded,
    Failed,
}

/// Final report of an attempt, handed to the completion callback once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub success: bool,
    pub error: Option<ErrorKind>,
    pub message: Option<String>,
    /// The boot slot changed and the host should restart into it.
    #[serde(rename = "restartRequested")]
    pub restart_requested: bool,
    /// Slot whose switch failed after every item was written. The switch can
    /// be retried on its own.
    #[serde(rename = "unappliedSlot")]
    pub unapplied_slot: Option<u8>,
}

pub type CompletionCallback = Box<dyn FnOnce(&Completion) + Send>;

/// Drives one update attempt. Every transition happens in [`Self::start`],
/// [`Self::apply`] or [`Self::abort`]; nothing blocks.
pub struct UpdateCoordinator<P: Partition, S: BootConfigStore, T: FetchTransport> {
    plan: UpdatePlan<P>,
    store: S,
    transport: T,
    template: Arc<RequestTemplate>,
    max_items: Option<usize>,
    state: CoordinatorState,
    running: Option<PartitionInfo>,
    callback: Option<CompletionCallback>,
    completion: Option<Completion>,
    last_error: Option<UpdateError>,
}

impl<P: Partition, S: BootConfigStore, T: FetchTransport> UpdateCoordinator<P, S, T> {
    pub fn new(plan: UpdatePlan<P>, store: S, transport: T) -> Self {
        Self {
            plan,
            store,
            transport,
            template: Arc::new(RequestTemplate::default()),
            max_items: None,
            state: CoordinatorState::Idle,
            running: None,
            callback: None,
            completion: None,
            last_error: None,
        }
    }

    pub fn set_completion_callback<F>(&mut self, callback: F)
    where
        F: FnOnce(&Completion) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
    }

    pub fn set_request_template(&mut self, template: RequestTemplate) {
        self.template = Arc::new(template);
    }

    pub fn set_max_items(&mut self, limit: usize) {
        self.max_items = Some(limit);
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn outcome(&self) -> Outcome {
        match self.state {
            CoordinatorState::Idle => Outcome::NotStarted,
            CoordinatorState::Running { .. } => Outcome::Running,
            CoordinatorState::AllSucceeded => Outcome::Succeeded,
            CoordinatorState::Aborted => Outcome::Failed,
        }
    }

    pub fn items(&self) -> &[ItemDescriptor<P>] {
        self.plan.items()
    }

    pub fn completion(&self) -> Option<&Completion> {
        self.completion.as_ref()
    }

    pub fn last_error(&self) -> Option<&UpdateError> {
        self.last_error.as_ref()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn status(&self) -> UpdateStatus {
        UpdateStatus {
            outcome: self.outcome(),
            current_item: match self.state {
                CoordinatorState::Running { item } => Some(item),
                _ => None,
            },
            target_slot: match self.plan.target() {
                BootTarget::NoSwitch => None,
                BootTarget::Slot(slot) => Some(slot),
            },
            items: self
                .plan
                .items()
                .iter()
                .map(|item| ItemStatus {
                    url: item.source_url().to_string(),
                    partition: item.target().clone(),
                    state: item.state(),
                    bytes_written: item.bytes_written(),
                })
                .collect(),
            last_error: self.last_error.as_ref().map(ErrorReport::from),
            restart_requested: self
                .completion
                .as_ref()
                .is_some_and(|completion| completion.restart_requested),
        }
    }

    /// Validates the plan against the boot store and issues the fetch for
    /// item 0. Any validation failure is returned here and nothing is fetched.
    pub fn start(&mut self) -> Result<(), UpdateError> {
        if self.state != CoordinatorState::Idle {
            return Err(PlanError::AlreadyStarted.into());
        }
        self.validate()?;

        info!(
            "ota update starting: {} item(s), target {:?}",
            self.plan.len(),
            self.plan.target()
        );
        self.begin_item(0);
        Ok(())
    }

    /// Single entry point for transport events.
    pub fn apply(&mut self, event: TransferEvent) {
        let current = match self.state {
            CoordinatorState::Running { item } => item,
            state => {
                debug!(
                    "ignoring event for item {} in state {:?}",
                    event.item(),
                    state
                );
                return;
            }
        };
        if event.item() != current {
            warn!(
                "ignoring stale event for item {} (current item {current})",
                event.item()
            );
            return;
        }

        match event {
            TransferEvent::Chunk { data, .. } => self.on_chunk(current, &data),
            TransferEvent::Finished { outcome, .. } => self.on_item_result(current, outcome),
        }
    }

    pub fn on_item_result(&mut self, index: usize, outcome: ItemOutcome) {
        if self.state != (CoordinatorState::Running { item: index }) {
            debug!("ignoring result for item {index} in state {:?}", self.state);
            return;
        }

        if let ItemOutcome::Failure(source) = outcome {
            self.fail(UpdateError::Transport {
                item: index,
                source,
            });
            return;
        }

        match self.finish_item(index) {
            Ok(bytes) => info!("ota item {index} complete ({bytes} bytes)"),
            Err(err) => {
                self.fail(err);
                return;
            }
        }

        if index + 1 < self.plan.len() {
            self.begin_item(index + 1);
        } else {
            self.finish_plan();
        }
    }

    /// Stops the attempt. The open stream is abandoned and the boot store is
    /// left alone. No-op once the attempt has reached a terminal state.
    pub fn abort(&mut self) {
        match self.state {
            CoordinatorState::AllSucceeded | CoordinatorState::Aborted => {
                debug!("abort ignored in state {:?}", self.state);
            }
            CoordinatorState::Idle => {
                info!("ota update aborted before start");
                self.fail(UpdateError::Cancelled);
            }
            CoordinatorState::Running { item } => {
                info!("ota update aborted during item {item}");
                self.transport.cancel(item);
                self.fail(UpdateError::Cancelled);
            }
        }
    }

    fn validate(&mut self) -> Result<(), UpdateError> {
        if let Some(limit) = self.max_items {
            if self.plan.len() > limit {
                return Err(PlanError::TooManyItems {
                    count: self.plan.len(),
                    limit,
                }
                .into());
            }
        }
        self.plan.validate()?;

        let running = self
            .store
            .running_partition()
            .map_err(PlanError::BootConfig)?;
        let reserved = self.store.reserved();
        for (index, item) in self.plan.items().iter().enumerate() {
            if item.target().overlaps(&running) {
                return Err(PlanError::TargetsRunning {
                    item: index,
                    partition: item.target().clone(),
                }
                .into());
            }
            if let Some(region) = reserved.iter().find(|region| item.target().overlaps(region)) {
                return Err(PlanError::TargetsReserved {
                    item: index,
                    region: region.clone(),
                }
                .into());
            }
        }

        if let BootTarget::Slot(slot) = self.plan.target() {
            let count = self.store.slot_count().map_err(PlanError::BootConfig)?;
            if slot >= count {
                return Err(PlanError::UnknownSlot(slot).into());
            }
            let partition = self
                .store
                .slot_partition(slot)
                .map_err(PlanError::BootConfig)?;
            if partition.same_region(&running) {
                return Err(PlanError::SlotAlreadyRunning(slot).into());
            }
        }

        self.running = Some(running);
        Ok(())
    }

    fn begin_item(&mut self, index: usize) {
        let stream = match self.open_stream(index) {
            Ok(stream) => stream,
            Err(err) => {
                self.state = CoordinatorState::Running { item: index };
                self.fail(err);
                return;
            }
        };

        let Some(item) = self.plan.item_mut(index) else {
            return;
        };
        item.begin(stream);
        let request = FetchRequest {
            item: index,
            url: item.source_url().to_string(),
            template: Arc::clone(&self.template),
        };
        self.state = CoordinatorState::Running { item: index };

        debug!("ota item {index} fetching {}", request.url);
        if let Err(source) = self.transport.issue(request) {
            self.fail(UpdateError::Transport {
                item: index,
                source,
            });
        }
    }

    fn open_stream(&mut self, index: usize) -> Result<PartitionWriteStream<P>, UpdateError> {
        let running = self.running.clone().ok_or_else(|| unavailable(index))?;
        let partition = self
            .plan
            .item_mut(index)
            .and_then(ItemDescriptor::take_partition)
            .ok_or_else(|| unavailable(index))?;
        PartitionWriteStream::new(partition, &running)
            .map_err(|err| UpdateError::from_stream(index, err))
    }

    fn on_chunk(&mut self, index: usize, data: &[u8]) {
        let Some(item) = self.plan.item_mut(index) else {
            return;
        };
        let Some(stream) = item.stream_mut() else {
            return;
        };

        let written = stream.write(data).map(|_| stream.total_written());
        match written {
            Ok(total) => item.record_written(total),
            Err(err) => {
                self.transport.cancel(index);
                self.fail(UpdateError::from_stream(index, err));
            }
        }
    }

    fn finish_item(&mut self, index: usize) -> Result<u64, UpdateError> {
        let item = self.plan.item_mut(index).ok_or_else(|| unavailable(index))?;
        if item.bytes_written() == 0 {
            return Err(UpdateError::Transport {
                item: index,
                source: TransportError::EmptyBody,
            });
        }

        let expected = item.expected_sha256().map(str::to_string);
        let stream = item.stream_mut().ok_or_else(|| unavailable(index))?;
        let bytes = stream
            .close()
            .map_err(|err| UpdateError::from_stream(index, err))?;
        let actual = stream.digest_hex();

        if let Some(expected) = expected {
            if expected != actual {
                return Err(UpdateError::Verification {
                    item: index,
                    expected,
                    actual,
                });
            }
        }

        item.record_written(bytes);
        item.set_state(CompletionState::Complete);
        Ok(bytes)
    }

    fn finish_plan(&mut self) {
        let mut completion = Completion {
            success: true,
            error: None,
            message: None,
            restart_requested: false,
            unapplied_slot: None,
        };

        if let BootTarget::Slot(slot) = self.plan.target() {
            if let Err(err) = self.store.set_current(slot) {
                warn!("ota boot switch to slot {slot} failed: {err}");
                let err = UpdateError::BootSwitch(err);
                completion.success = false;
                completion.error = Some(err.kind());
                completion.message = Some(err.to_string());
                completion.unapplied_slot = Some(slot);
                self.last_error = Some(err);
                self.state = CoordinatorState::Aborted;
                self.complete(completion);
                return;
            }
            info!("ota boot slot switched to {slot}");
            completion.restart_requested = true;
        }

        self.state = CoordinatorState::AllSucceeded;
        info!("ota update succeeded");
        self.complete(completion);
    }

    fn fail(&mut self, err: UpdateError) {
        if let CoordinatorState::Running { item } = self.state {
            if let Some(descriptor) = self.plan.item_mut(item) {
                descriptor.abandon();
                descriptor.set_state(CompletionState::Failed);
            }
        }

        warn!("ota update failed: {err}");
        self.state = CoordinatorState::Aborted;
        let completion = Completion {
            success: false,
            error: Some(err.kind()),
            message: Some(err.to_string()),
            restart_requested: false,
            unapplied_slot: None,
        };
        self.last_error = Some(err);
        self.complete(completion);
    }

    fn complete(&mut self, completion: Completion) {
        if self.completion.is_some() {
            return;
        }
        if let Some(callback) = self.callback.take() {
            callback(&completion);
        }
        self.completion = Some(completion);
    }
}

fn unavailable(item: usize) -> UpdateError {
    UpdateError::Write {
        item,
        source: StorageError::Device("partition handle unavailable".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        boot::{BootConfig, FlashBootConfigStore, SlotEntry},
        error::BootError,
        flash::{MemoryFlash, MemoryPartition},
    };

    const ROM0: u32 = 0x2000;
    const ROM1: u32 = 0x10000;
    const ROM_SIZE: u32 = 0xE000;
    const DATA: u32 = 0x20000;
    const DATA_SIZE: u32 = 0x4000;

    #[derive(Debug, Default)]
    struct RecordingTransport {
        issued: Vec<FetchRequest>,
        cancelled: Vec<usize>,
        refuse: bool,
    }

    impl FetchTransport for RecordingTransport {
        fn issue(&mut self, request: FetchRequest) -> Result<(), TransportError> {
            if self.refuse {
                return Err(TransportError::Connection("refused".to_string()));
            }
            self.issued.push(request);
            Ok(())
        }

        fn cancel(&mut self, item: usize) {
            self.cancelled.push(item);
        }
    }

    /// Wraps the flash store and counts switch attempts.
    struct CountingStore {
        inner: FlashBootConfigStore<MemoryPartition>,
        switches: Arc<Mutex<Vec<u8>>>,
        fail_switch: bool,
    }

    impl BootConfigStore for CountingStore {
        fn current(&self) -> Result<u8, BootError> {
            self.inner.current()
        }

        fn next_boot(&self) -> Result<u8, BootError> {
            self.inner.next_boot()
        }

        fn slot_count(&self) -> Result<u8, BootError> {
            self.inner.slot_count()
        }

        fn set_current(&mut self, slot: u8) -> Result<(), BootError> {
            self.switches.lock().unwrap().push(slot);
            if self.fail_switch {
                return Err(BootError::NotPersisted);
            }
            self.inner.set_current(slot)
        }

        fn slot_partition(&self, slot: u8) -> Result<PartitionInfo, BootError> {
            self.inner.slot_partition(slot)
        }

        fn reserved(&self) -> Vec<PartitionInfo> {
            self.inner.reserved()
        }
    }

    struct Rig {
        flash: MemoryFlash,
        switches: Arc<Mutex<Vec<u8>>>,
        completions: Arc<Mutex<Vec<Completion>>>,
    }

    type Coordinator = UpdateCoordinator<MemoryPartition, CountingStore, RecordingTransport>;

    impl Rig {
        fn new() -> Self {
            Self {
                flash: MemoryFlash::new(0x40000),
                switches: Arc::new(Mutex::new(Vec::new())),
                completions: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn part(&self, name: &str, address: u32, size: u32) -> MemoryPartition {
            self.flash
                .partition(PartitionInfo::new(name, address, size))
                .unwrap()
        }

        fn store(&self, fail_switch: bool) -> CountingStore {
            let config = self.part("bootconfig", 0x1000, 0x1000);
            let layout = BootConfig::new(vec![
                SlotEntry {
                    address: ROM0,
                    size: ROM_SIZE,
                },
                SlotEntry {
                    address: ROM1,
                    size: ROM_SIZE,
                },
            ])
            .unwrap();
            CountingStore {
                inner: FlashBootConfigStore::open(config, layout).unwrap(),
                switches: Arc::clone(&self.switches),
                fail_switch,
            }
        }

        fn coordinator(&self, plan: UpdatePlan<MemoryPartition>, fail_switch: bool) -> Coordinator {
            let mut coordinator =
                UpdateCoordinator::new(plan, self.store(fail_switch), RecordingTransport::default());
            let completions = Arc::clone(&self.completions);
            coordinator.set_completion_callback(move |completion| {
                completions.lock().unwrap().push(completion.clone());
            });
            coordinator
        }

        fn completions(&self) -> Vec<Completion> {
            self.completions.lock().unwrap().clone()
        }

        fn switches(&self) -> Vec<u8> {
            self.switches.lock().unwrap().clone()
        }
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed)).collect()
    }

    fn feed(coordinator: &mut Coordinator, item: usize, data: &[u8], chunk: usize) {
        for piece in data.chunks(chunk) {
            coordinator.apply(TransferEvent::Chunk {
                item,
                data: piece.to_vec(),
            });
        }
    }

    fn finish(coordinator: &mut Coordinator, item: usize) {
        coordinator.apply(TransferEvent::Finished {
            item,
            outcome: ItemOutcome::Success,
        });
    }

    fn issued_urls(coordinator: &Coordinator) -> Vec<String> {
        coordinator
            .transport()
            .issued
            .iter()
            .map(|request| request.url.clone())
            .collect()
    }

    fn two_item_plan(rig: &Rig, target: BootTarget) -> UpdatePlan<MemoryPartition> {
        let mut plan = UpdatePlan::new();
        plan.add_item("http://host/rom1.bin", rig.part("rom1", ROM1, ROM_SIZE));
        plan.add_item("http://host/data.bin", rig.part("spiffs", DATA, DATA_SIZE));
        plan.set_target_slot(target);
        plan
    }

    #[test]
    fn all_items_succeed_then_switch_once() {
        let rig = Rig::new();
        let mut coordinator = rig.coordinator(two_item_plan(&rig, BootTarget::Slot(1)), false);
        coordinator.start().unwrap();
        assert_eq!(issued_urls(&coordinator), vec!["http://host/rom1.bin"]);

        let rom = pattern(3001, 1);
        feed(&mut coordinator, 0, &rom, 97);
        finish(&mut coordinator, 0);
        assert_eq!(coordinator.state(), CoordinatorState::Running { item: 1 });
        assert!(rig.switches().is_empty());

        let data = pattern(1024, 7);
        feed(&mut coordinator, 1, &data, 256);
        finish(&mut coordinator, 1);

        assert_eq!(coordinator.state(), CoordinatorState::AllSucceeded);
        assert_eq!(rig.switches(), vec![1]);
        assert_eq!(
            rig.completions(),
            vec![Completion {
                success: true,
                error: None,
                message: None,
                restart_requested: true,
                unapplied_slot: None,
            }]
        );

        let mut expected = rom.clone();
        expected.extend_from_slice(&[0xFF, 0xFF, 0xFF]);
        assert_eq!(rig.flash.read_range(ROM1, expected.len()), expected);
        assert_eq!(rig.flash.read_range(DATA, data.len()), data);
        assert_eq!(coordinator.items()[0].bytes_written(), 3001);
        assert_eq!(coordinator.store().next_boot().unwrap(), 1);
        assert_eq!(coordinator.store().current().unwrap(), 0);
    }

    #[test]
    fn no_switch_plan_never_touches_store() {
        let rig = Rig::new();
        let mut coordinator = rig.coordinator(two_item_plan(&rig, BootTarget::NoSwitch), false);
        coordinator.start().unwrap();
        feed(&mut coordinator, 0, &pattern(16, 0), 16);
        finish(&mut coordinator, 0);
        feed(&mut coordinator, 1, &pattern(16, 0), 16);
        finish(&mut coordinator, 1);

        assert_eq!(coordinator.outcome(), Outcome::Succeeded);
        assert!(rig.switches().is_empty());
        assert!(!rig.completions()[0].restart_requested);
    }

    #[test]
    fn second_item_failure_after_500_bytes() {
        let rig = Rig::new();
        let mut plan = UpdatePlan::new();
        plan.add_item("http://host/a", rig.part("a", 0x20000, 0x1000));
        plan.add_item("http://host/b", rig.part("b", 0x22000, 0x1000));
        plan.set_target_slot(BootTarget::Slot(1));
        let mut coordinator = rig.coordinator(plan, false);
        coordinator.start().unwrap();

        let first = pattern(1000, 3);
        feed(&mut coordinator, 0, &first, 64);
        finish(&mut coordinator, 0);

        let second = pattern(2000, 9);
        feed(&mut coordinator, 1, &second[..500], 50);
        coordinator.apply(TransferEvent::Finished {
            item: 1,
            outcome: ItemOutcome::Failure(TransportError::Timeout),
        });

        assert_eq!(coordinator.state(), CoordinatorState::Aborted);
        assert_eq!(rig.flash.read_range(0x20000, 1000), first);
        assert_eq!(
            rig.flash.read_range(0x20000 + 1000, 8),
            vec![0xFF; 8]
        );
        assert_eq!(rig.flash.read_range(0x22000, 500), second[..500].to_vec());
        assert_eq!(rig.flash.read_range(0x22000 + 500, 16), vec![0xFF; 16]);
        assert!(rig.switches().is_empty());
        assert_eq!(coordinator.store().next_boot().unwrap(), 0);
        assert_eq!(coordinator.items()[1].state(), CompletionState::Failed);

        let completions = rig.completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].error, Some(ErrorKind::Transport));
    }

    #[test]
    fn first_item_failure_never_fetches_later_items() {
        let rig = Rig::new();
        let mut coordinator = rig.coordinator(two_item_plan(&rig, BootTarget::Slot(1)), false);
        coordinator.start().unwrap();
        feed(&mut coordinator, 0, &pattern(40, 0), 8);
        coordinator.apply(TransferEvent::Finished {
            item: 0,
            outcome: ItemOutcome::Failure(TransportError::Status(404)),
        });

        assert_eq!(issued_urls(&coordinator), vec!["http://host/rom1.bin"]);
        assert_eq!(coordinator.items()[1].state(), CompletionState::Pending);
        assert!(rig.switches().is_empty());
    }

    #[test]
    fn running_partition_is_rejected_without_network() {
        let rig = Rig::new();
        let mut plan = UpdatePlan::new();
        plan.add_item("http://host/rom0.bin", rig.part("rom0", ROM0, ROM_SIZE));
        let mut coordinator = rig.coordinator(plan, false);

        let err = coordinator.start().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PlanValidation);
        assert!(matches!(
            err,
            UpdateError::Plan(PlanError::TargetsRunning { item: 0, .. })
        ));
        assert!(coordinator.transport().issued.is_empty());
        assert!(rig.completions().is_empty());
        assert_eq!(coordinator.state(), CoordinatorState::Idle);
    }

    #[test]
    fn partial_overlap_with_running_partition_is_rejected() {
        let rig = Rig::new();
        let mut plan = UpdatePlan::new();
        plan.add_item("http://host/x", rig.part("x", ROM0 + ROM_SIZE - 0x1000, 0x2000));
        let mut coordinator = rig.coordinator(plan, false);

        assert!(matches!(
            coordinator.start(),
            Err(UpdateError::Plan(PlanError::TargetsRunning { .. }))
        ));
    }

    #[test]
    fn reserved_region_and_bad_slots_are_rejected() {
        let rig = Rig::new();

        let mut plan = UpdatePlan::new();
        plan.add_item("http://host/x", rig.part("x", 0x1000, 0x1000));
        assert!(matches!(
            rig.coordinator(plan, false).start(),
            Err(UpdateError::Plan(PlanError::TargetsReserved { item: 0, .. }))
        ));

        let mut plan = UpdatePlan::new();
        plan.add_item("http://host/x", rig.part("rom1", ROM1, ROM_SIZE));
        plan.set_target_slot(BootTarget::Slot(0));
        assert_eq!(
            rig.coordinator(plan, false).start(),
            Err(UpdateError::Plan(PlanError::SlotAlreadyRunning(0)))
        );

        let mut plan = UpdatePlan::new();
        plan.add_item("http://host/x", rig.part("rom1", ROM1, ROM_SIZE));
        plan.set_target_slot(BootTarget::Slot(5));
        assert_eq!(
            rig.coordinator(plan, false).start(),
            Err(UpdateError::Plan(PlanError::UnknownSlot(5)))
        );
    }

    #[test]
    fn empty_and_overlapping_plans_are_rejected() {
        let rig = Rig::new();
        let mut coordinator = rig.coordinator(UpdatePlan::new(), false);
        assert_eq!(coordinator.start(), Err(UpdateError::Plan(PlanError::Empty)));

        let mut plan = UpdatePlan::new();
        plan.add_item("http://host/a", rig.part("a", 0x20000, 0x2000));
        plan.add_item("http://host/b", rig.part("b", 0x21000, 0x2000));
        let mut coordinator = rig.coordinator(plan, false);
        assert_eq!(
            coordinator.start(),
            Err(UpdateError::Plan(PlanError::Overlapping {
                first: 0,
                second: 1
            }))
        );
        assert!(coordinator.transport().issued.is_empty());
    }

    #[test]
    fn item_limit_and_double_start() {
        let rig = Rig::new();
        let mut coordinator = rig.coordinator(two_item_plan(&rig, BootTarget::NoSwitch), false);
        coordinator.set_max_items(1);
        assert_eq!(
            coordinator.start(),
            Err(UpdateError::Plan(PlanError::TooManyItems { count: 2, limit: 1 }))
        );

        let mut coordinator = rig.coordinator(two_item_plan(&rig, BootTarget::NoSwitch), false);
        coordinator.start().unwrap();
        assert_eq!(
            coordinator.start(),
            Err(UpdateError::Plan(PlanError::AlreadyStarted))
        );
        assert_eq!(coordinator.transport().issued.len(), 1);
    }

    #[test]
    fn stale_events_are_ignored() {
        let rig = Rig::new();
        let mut coordinator = rig.coordinator(two_item_plan(&rig, BootTarget::NoSwitch), false);
        coordinator.start().unwrap();

        feed(&mut coordinator, 1, &pattern(32, 0), 32);
        finish(&mut coordinator, 1);
        assert_eq!(coordinator.state(), CoordinatorState::Running { item: 0 });
        assert_eq!(coordinator.items()[1].bytes_written(), 0);

        feed(&mut coordinator, 0, &pattern(8, 0), 8);
        finish(&mut coordinator, 0);
        feed(&mut coordinator, 0, &pattern(8, 0), 8);
        assert_eq!(coordinator.items()[0].bytes_written(), 8);
    }

    #[test]
    fn abort_fires_callback_once_and_leaves_store() {
        let rig = Rig::new();
        let mut coordinator = rig.coordinator(two_item_plan(&rig, BootTarget::Slot(1)), false);
        coordinator.start().unwrap();
        feed(&mut coordinator, 0, &[1, 2, 3, 4, 5, 6], 6);

        coordinator.abort();
        coordinator.abort();
        finish(&mut coordinator, 0);

        assert_eq!(coordinator.state(), CoordinatorState::Aborted);
        assert_eq!(coordinator.transport().cancelled, vec![0]);
        assert_eq!(rig.flash.read_range(ROM1, 8), vec![1, 2, 3, 4, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(rig.switches().is_empty());

        let completions = rig.completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].error, Some(ErrorKind::Cancelled));
    }

    #[test]
    fn overflowing_chunk_aborts_and_cancels_transfer() {
        let rig = Rig::new();
        let mut plan = UpdatePlan::new();
        plan.add_item("http://host/a", rig.part("a", 0x20000, 0x1000));
        let mut coordinator = rig.coordinator(plan, false);
        coordinator.start().unwrap();

        feed(&mut coordinator, 0, &pattern(0x1001, 0), 0x1001);

        assert_eq!(coordinator.state(), CoordinatorState::Aborted);
        assert_eq!(coordinator.transport().cancelled, vec![0]);
        assert_eq!(rig.completions()[0].error, Some(ErrorKind::OverCapacity));
    }

    #[test]
    fn storage_fault_is_a_write_error() {
        let rig = Rig::new();
        let mut plan = UpdatePlan::new();
        plan.add_item("http://host/a", rig.part("a", 0x20000, 0x2000));
        let mut coordinator = rig.coordinator(plan, false);
        coordinator.start().unwrap();
        rig.flash.inject_fault(0x21000);

        feed(&mut coordinator, 0, &pattern(0x1800, 0), 0x400);

        assert_eq!(coordinator.outcome(), Outcome::Failed);
        assert_eq!(
            coordinator.last_error().map(UpdateError::kind),
            Some(ErrorKind::Write)
        );
    }

    #[test]
    fn empty_body_is_a_transport_error() {
        let rig = Rig::new();
        let mut coordinator = rig.coordinator(two_item_plan(&rig, BootTarget::Slot(1)), false);
        coordinator.start().unwrap();
        finish(&mut coordinator, 0);

        assert_eq!(
            coordinator.last_error(),
            Some(&UpdateError::Transport {
                item: 0,
                source: TransportError::EmptyBody
            })
        );
        assert_eq!(coordinator.transport().issued.len(), 1);
    }

    #[test]
    fn digest_mismatch_is_a_verification_error() {
        let rig = Rig::new();
        let mut plan = UpdatePlan::new();
        plan.add_item_with_digest(
            "http://host/a",
            rig.part("a", 0x20000, 0x1000),
            Some("0".repeat(64)),
        );
        plan.add_item_with_digest(
            "http://host/b",
            rig.part("b", 0x22000, 0x1000),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".to_string()),
        );
        let mut coordinator = rig.coordinator(plan, false);
        coordinator.start().unwrap();

        feed(&mut coordinator, 0, b"abc", 1);
        finish(&mut coordinator, 0);

        assert_eq!(rig.completions()[0].error, Some(ErrorKind::Verification));
        assert_eq!(coordinator.transport().issued.len(), 1);
    }

    #[test]
    fn matching_digest_passes() {
        let rig = Rig::new();
        let mut plan = UpdatePlan::new();
        plan.add_item_with_digest(
            "http://host/a",
            rig.part("a", 0x20000, 0x1000),
            Some("BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD".to_string()),
        );
        let mut coordinator = rig.coordinator(plan, false);
        coordinator.start().unwrap();
        feed(&mut coordinator, 0, b"abc", 2);
        finish(&mut coordinator, 0);

        assert_eq!(coordinator.state(), CoordinatorState::AllSucceeded);
    }

    #[test]
    fn boot_switch_failure_is_reported_with_slot() {
        let rig = Rig::new();
        let mut plan = UpdatePlan::new();
        plan.add_item("http://host/rom1.bin", rig.part("rom1", ROM1, ROM_SIZE));
        plan.set_target_slot(BootTarget::Slot(1));
        let mut coordinator = rig.coordinator(plan, true);
        coordinator.start().unwrap();
        feed(&mut coordinator, 0, &pattern(64, 0), 64);
        finish(&mut coordinator, 0);

        assert_eq!(coordinator.outcome(), Outcome::Failed);
        assert_eq!(coordinator.items()[0].state(), CompletionState::Complete);
        let completion = &rig.completions()[0];
        assert_eq!(completion.error, Some(ErrorKind::BootSwitch));
        assert_eq!(completion.unapplied_slot, Some(1));
        assert!(!completion.restart_requested);
        assert_eq!(rig.flash.read_range(ROM1, 64), pattern(64, 0));
    }

    #[test]
    fn refused_issue_reports_transport_failure() {
        let rig = Rig::new();
        let mut coordinator = UpdateCoordinator::new(
            two_item_plan(&rig, BootTarget::NoSwitch),
            rig.store(false),
            RecordingTransport {
                refuse: true,
                ..Default::default()
            },
        );

        coordinator.start().unwrap();
        assert_eq!(coordinator.outcome(), Outcome::Failed);
        assert_eq!(
            coordinator.completion().and_then(|c| c.error),
            Some(ErrorKind::Transport)
        );
    }

    #[test]
    fn status_snapshot_tracks_progress() {
        let rig = Rig::new();
        let mut coordinator = rig.coordinator(two_item_plan(&rig, BootTarget::Slot(1)), false);
        coordinator.set_request_template(RequestTemplate {
            timeout_ms: 5_000,
            ..Default::default()
        });
        coordinator.start().unwrap();
        feed(&mut coordinator, 0, &pattern(10, 0), 3);

        let status = coordinator.status();
        assert_eq!(status.outcome, Outcome::Running);
        assert_eq!(status.current_item, Some(0));
        assert_eq!(status.target_slot, Some(1));
        assert_eq!(status.items[0].bytes_written, 10);
        assert_eq!(status.items[0].state, CompletionState::InProgress);
        assert_eq!(status.items[1].state, CompletionState::Pending);
        assert_eq!(coordinator.transport().issued[0].template.timeout_ms, 5_000);
    }
}
