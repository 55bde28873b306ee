use core::{ffi::c_void, ptr};
use std::{
    ffi::CString,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, SyncSender},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::EspOta,
    sys::{self, esp, esp_partition_t},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use ota_common::{
    boot::{slot_name, MAX_SLOTS},
    plan::{is_sha256_hex, validate_url},
    BootConfigStore, BootError, BootStatus, BootTarget, Completion, FetchRequest, FetchTransport,
    ItemOutcome, Partition, PartitionInfo, StorageError, TransferEvent, TransportError,
    UpdateCoordinator, UpdatePlan, UpdateStatus, UpdaterConfig, DEFAULT_SECTOR_SIZE, WRITE_GRANULARITY,
};

const NVS_NAMESPACE: &str = "ota";
const NVS_CONFIG_KEY: &str = "updater_json";
const NVS_WIFI_SSID_KEY: &str = "wifi_ssid";
const NVS_WIFI_PASS_KEY: &str = "wifi_pass";
const MAX_HTTP_BODY: usize = 4096;
const FETCH_CHUNK_SIZE: usize = 4096;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;

type SharedBootStore = Arc<Mutex<EspOtaBootStore>>;
type DeviceCoordinator = UpdateCoordinator<EspPartition, SharedBootStore, EspHttpTransport>;

#[derive(Clone)]
struct SharedState {
    config: Arc<UpdaterConfig>,
    boot: SharedBootStore,
    ota: Arc<Mutex<OtaRuntimeState>>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

#[derive(Default)]
struct OtaRuntimeState {
    in_progress: bool,
    driver: Option<SyncSender<DriverMessage>>,
    attempt: Option<UpdateStatus>,
    completion: Option<Completion>,
    last_completed_epoch: Option<i64>,
}

enum DriverMessage {
    Event(TransferEvent),
    Abort,
}

#[derive(Debug, Deserialize)]
struct OtaItemRequest {
    url: String,
    partition: String,
    #[serde(default)]
    sha256: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SlotSelector {
    Index(u8),
    Keyword(String),
}

#[derive(Debug, Deserialize)]
struct OtaApplyRequest {
    items: Vec<OtaItemRequest>,
    #[serde(default)]
    slot: Option<SlotSelector>,
    #[serde(default)]
    reboot: Option<bool>,
}

#[derive(Debug, Serialize)]
struct OtaApplyResponse {
    accepted: bool,
    #[serde(rename = "inProgress")]
    in_progress: bool,
    #[serde(rename = "targetSlot")]
    target_slot: Option<u8>,
}

#[derive(Debug, Serialize)]
struct OtaStatusResponse {
    supported: bool,
    #[serde(rename = "inProgress")]
    in_progress: bool,
    #[serde(rename = "runningSlot")]
    running_slot: Option<u8>,
    #[serde(rename = "nextBootSlot")]
    next_boot_slot: Option<u8>,
    attempt: Option<UpdateStatus>,
    completion: Option<Completion>,
    #[serde(rename = "lastCompletedEpoch")]
    last_completed_epoch: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct BootSwitchRequest {
    slot: u8,
    #[serde(default)]
    reboot: Option<bool>,
}

#[derive(Debug, Serialize)]
struct BootSwitchResponse {
    #[serde(rename = "restartRequested")]
    restart_requested: bool,
    boot: Option<BootStatus>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut config = nvs_store.load_config().unwrap_or_else(|err| {
        warn!("failed to load updater config from NVS: {err:#}");
        UpdaterConfig::default()
    });
    config.sanitize();

    let Peripherals { modem, .. } = Peripherals::take()?;
    let (ssid, pass) = nvs_store
        .load_wifi_credentials()
        .context("failed to read wifi credentials")?;
    let _wifi = connect_wifi(modem, sys_loop, nvs_partition, &ssid, &pass)
        .context("wifi startup failed")?;

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let boot = EspOtaBootStore::open().context("failed to read OTA partitions")?;
    info!(
        "boot slots: {} configured, running {:?}, next boot {:?}",
        boot.slots.len(),
        boot.current().ok(),
        boot.next_boot().ok()
    );

    let state = SharedState {
        config: Arc::new(config),
        boot: Arc::new(Mutex::new(boot)),
        ota: Arc::new(Mutex::new(OtaRuntimeState::default())),
    };
    let _server = create_http_server(state)?;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    {
        let state = state.clone();
        server.fn_handler("/api/ota/status", Method::Get, move |req| {
            let payload = build_ota_status_response(&state);
            write_json(req, 200, &payload)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/ota/apply", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let request: OtaApplyRequest =
                serde_json::from_slice(&body).context("invalid ota payload")?;

            if let Err(message) = validate_ota_apply_request(&request, &state.config) {
                return write_error(req, 400, &message);
            }

            match start_update(&state, request) {
                Ok(response) => write_json(req, 202, &response),
                Err((status, message)) => write_error(req, status, &message),
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/ota/abort", Method::Post, move |req| {
            let driver = {
                let ota = lock(&state.ota);
                ota.driver.clone().filter(|_| ota.in_progress)
            };
            match driver {
                Some(driver) => {
                    if driver.send(DriverMessage::Abort).is_err() {
                        debug!("ota update ended before abort was delivered");
                    }
                    write_json(req, 202, &serde_json::json!({ "aborting": true }))
                }
                None => write_error(req, 409, "no ota update in progress"),
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/boot", Method::Get, move |req| {
            match boot_status(&state.boot) {
                Ok(status) => write_json(req, 200, &status),
                Err(err) => {
                    warn!("failed to read boot config: {err}");
                    write_error(req, 500, "Failed to read boot config")
                }
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/boot/switch", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let request: BootSwitchRequest =
                serde_json::from_slice(&body).context("invalid boot switch payload")?;

            if lock(&state.ota).in_progress {
                return write_error(req, 409, "ota update already in progress");
            }

            let mut boot = state.boot.clone();
            match boot.set_current(request.slot) {
                Ok(()) => {}
                Err(err @ BootError::UnknownSlot { .. }) => {
                    return write_error(req, 400, &err.to_string());
                }
                Err(err) => {
                    warn!("boot switch to slot {} failed: {err}", request.slot);
                    return write_error(req, 500, "Failed to persist boot slot");
                }
            }

            let restart_requested = request
                .reboot
                .unwrap_or(state.config.reboot_after_apply)
                && state.boot.switch_pending();
            let response = BootSwitchResponse {
                restart_requested,
                boot: boot_status(&state.boot).ok(),
            };
            write_json(req, 200, &response)?;
            if restart_requested {
                restart_after(state.config.restart_delay_ms);
            }
            Ok(())
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/partitions", Method::Get, move |req| {
            let partitions = device_partitions(&state);
            write_json(req, 200, &partitions)
        })?;
    }

    Ok(server)
}

fn validate_ota_apply_request(
    request: &OtaApplyRequest,
    config: &UpdaterConfig,
) -> Result<(), String> {
    if request.items.is_empty() {
        return Err("items cannot be empty".to_string());
    }
    if request.items.len() > config.max_items {
        return Err(format!("at most {} items per update", config.max_items));
    }

    for (index, item) in request.items.iter().enumerate() {
        validate_url(&item.url).map_err(|reason| format!("item {index}: {reason}"))?;
        if let Some(sha256) = item.sha256.as_ref() {
            if !is_sha256_hex(sha256.trim()) {
                return Err(format!("item {index}: sha256 must be 64 hex characters"));
            }
        }
    }

    if let Some(SlotSelector::Keyword(keyword)) = request.slot.as_ref() {
        if keyword != "next" {
            return Err("slot must be a slot number, \"next\" or null".to_string());
        }
    }

    Ok(())
}

fn start_update(
    state: &SharedState,
    request: OtaApplyRequest,
) -> Result<OtaApplyResponse, (u16, String)> {
    let mut ota = lock(&state.ota);
    if ota.in_progress {
        return Err((409, "ota update already in progress".to_string()));
    }

    let mut plan = UpdatePlan::new();
    for item in &request.items {
        let partition = resolve_partition(&state.boot, &item.partition)
            .ok_or_else(|| (400, format!("unknown partition `{}`", item.partition)))?;
        plan.add_item_with_digest(item.url.as_str(), partition, item.sha256.clone());
    }

    let target = match &request.slot {
        None => BootTarget::NoSwitch,
        Some(SlotSelector::Index(slot)) => BootTarget::Slot(*slot),
        Some(SlotSelector::Keyword(_)) => {
            BootTarget::Slot(lock(&state.boot).next_update_slot().map_err(|err| (500, err.to_string()))?)
        }
    };
    plan.set_target_slot(target);

    let (driver_tx, driver_rx) = mpsc::sync_channel(1);
    let (done_tx, done_rx) = mpsc::channel();

    let mut coordinator = UpdateCoordinator::new(
        plan,
        state.boot.clone(),
        EspHttpTransport::new(driver_tx.clone()),
    );
    coordinator.set_request_template(state.config.request.clone());
    coordinator.set_max_items(state.config.max_items);
    coordinator.set_completion_callback(move |completion| {
        if done_tx.send(completion.clone()).is_err() {
            debug!("ota completion receiver dropped");
        }
    });

    if let Err(err) = coordinator.start() {
        warn!("ota plan rejected: {err}");
        return Err((400, err.to_string()));
    }

    let status = coordinator.status();
    let target_slot = status.target_slot;
    let reboot = request.reboot.unwrap_or(state.config.reboot_after_apply);

    let driver_state = state.clone();
    thread::Builder::new()
        .name("ota-driver".into())
        .stack_size(16 * 1024)
        .spawn(move || drive_update(driver_state, coordinator, driver_rx, done_rx, reboot))
        .map_err(|err| (500, format!("failed to spawn OTA driver thread: {err}")))?;

    ota.in_progress = true;
    ota.driver = Some(driver_tx);
    ota.attempt = Some(status);
    ota.completion = None;

    Ok(OtaApplyResponse {
        accepted: true,
        in_progress: true,
        target_slot,
    })
}

fn drive_update(
    state: SharedState,
    mut coordinator: DeviceCoordinator,
    messages: Receiver<DriverMessage>,
    done: Receiver<Completion>,
    reboot: bool,
) {
    while !coordinator.state().is_terminal() {
        match messages.recv() {
            Ok(DriverMessage::Event(event)) => coordinator.apply(event),
            Ok(DriverMessage::Abort) | Err(_) => coordinator.abort(),
        }
        lock(&state.ota).attempt = Some(coordinator.status());
    }

    let status = coordinator.status();
    drop(coordinator);
    let completion = done.try_recv().ok();
    let restart = reboot
        && completion
            .as_ref()
            .is_some_and(|completion| completion.restart_requested);

    match completion.as_ref() {
        Some(completion) if completion.success => info!("OTA update applied"),
        Some(completion) => warn!(
            "OTA update failed: {}",
            completion.message.as_deref().unwrap_or("unknown error")
        ),
        None => warn!("OTA update ended without a completion report"),
    }

    {
        let mut ota = lock(&state.ota);
        ota.in_progress = false;
        ota.driver = None;
        ota.attempt = Some(status);
        ota.completion = completion;
        ota.last_completed_epoch = Some(Utc::now().timestamp());
    }

    if restart {
        restart_after(state.config.restart_delay_ms);
    }
}

fn restart_after(delay_ms: u64) {
    info!("restarting in {delay_ms}ms");
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(delay_ms));
        unsafe { sys::esp_restart() };
    });
}

fn build_ota_status_response(state: &SharedState) -> OtaStatusResponse {
    let ota = lock(&state.ota);
    OtaStatusResponse {
        supported: true,
        in_progress: ota.in_progress,
        running_slot: state.boot.current().ok(),
        next_boot_slot: state.boot.next_boot().ok(),
        attempt: ota.attempt.clone(),
        completion: ota.completion.clone(),
        last_completed_epoch: ota.last_completed_epoch,
    }
}

fn boot_status(boot: &SharedBootStore) -> Result<BootStatus, BootError> {
    let count = boot.slot_count()?;
    let slots = (0..count)
        .map(|slot| boot.slot_partition(slot))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(BootStatus {
        running: boot.current()?,
        next_boot: boot.next_boot()?,
        slots,
    })
}

fn device_partitions(state: &SharedState) -> Vec<PartitionInfo> {
    let boot = lock(&state.boot);
    let mut partitions = boot.reserved();
    partitions.extend(boot.slots.iter().enumerate().map(|(slot, raw)| raw.info(slot_name(slot as u8))));
    partitions.extend(
        state
            .config
            .flash
            .data_partitions
            .iter()
            .filter_map(|configured| find_data_partition(&configured.name))
            .map(|partition| partition.info()),
    );
    partitions
}

/// `romN` names an app slot; anything else is looked up as a data partition label.
fn resolve_partition(boot: &SharedBootStore, name: &str) -> Option<EspPartition> {
    let name = name.trim();
    let slot = name
        .strip_prefix("rom")
        .and_then(|index| index.parse::<u8>().ok());
    match slot {
        Some(slot) => {
            let boot = lock(boot);
            let raw = *boot.slots.get(slot as usize)?;
            Some(EspPartition {
                info: raw.info(slot_name(slot)),
                raw,
            })
        }
        None => find_data_partition(name),
    }
}

fn find_data_partition(label: &str) -> Option<EspPartition> {
    let label_c = CString::new(label).ok()?;
    let found = unsafe {
        sys::esp_partition_find_first(
            sys::esp_partition_type_t_ESP_PARTITION_TYPE_DATA,
            sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY,
            label_c.as_ptr(),
        )
    };
    let raw = RawPartition::new(found)?;
    Some(EspPartition {
        info: raw.info(label.to_string()),
        raw,
    })
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pointer into the partition table, which lives for the whole program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RawPartition(*const esp_partition_t);

// The partition table is static and read-only once the app is running.
unsafe impl Send for RawPartition {}

impl RawPartition {
    fn new(raw: *const esp_partition_t) -> Option<Self> {
        (!raw.is_null()).then_some(Self(raw))
    }

    fn info(&self, name: String) -> PartitionInfo {
        let partition = unsafe { &*self.0 };
        PartitionInfo::new(name, partition.address, partition.size)
    }
}

#[derive(Debug)]
struct EspPartition {
    raw: RawPartition,
    info: PartitionInfo,
}

fn device_error(err: sys::EspError) -> StorageError {
    StorageError::Device(err.to_string())
}

impl Partition for EspPartition {
    fn info(&self) -> PartitionInfo {
        self.info.clone()
    }

    fn sector_size(&self) -> u32 {
        DEFAULT_SECTOR_SIZE
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        if offset as u64 + buf.len() as u64 > self.info.size as u64 {
            return Err(StorageError::OutOfBounds {
                offset,
                len: buf.len(),
            });
        }
        esp!(unsafe {
            sys::esp_partition_read(
                self.raw.0,
                offset as usize,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
            )
        })
        .map_err(device_error)
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        if offset as usize % WRITE_GRANULARITY != 0 || data.len() % WRITE_GRANULARITY != 0 {
            return Err(StorageError::Misaligned {
                offset,
                len: data.len(),
            });
        }
        if offset as u64 + data.len() as u64 > self.info.size as u64 {
            return Err(StorageError::OutOfBounds {
                offset,
                len: data.len(),
            });
        }
        esp!(unsafe {
            sys::esp_partition_write(
                self.raw.0,
                offset as usize,
                data.as_ptr() as *const c_void,
                data.len(),
            )
        })
        .map_err(device_error)
    }

    fn erase(&mut self, offset: u32) -> Result<(), StorageError> {
        let sector = self.sector_size();
        if offset % sector != 0 {
            return Err(StorageError::Misaligned {
                offset,
                len: sector as usize,
            });
        }
        esp!(unsafe {
            sys::esp_partition_erase_range(self.raw.0, offset as usize, sector as usize)
        })
        .map_err(device_error)
    }
}

/// Boot selection through the ESP-IDF `otadata` partition.
struct EspOtaBootStore {
    slots: Vec<RawPartition>,
    running: RawPartition,
}

impl EspOtaBootStore {
    fn open() -> anyhow::Result<Self> {
        let mut slots = Vec::new();
        for index in 0..MAX_SLOTS as u32 {
            let found = unsafe {
                sys::esp_partition_find_first(
                    sys::esp_partition_type_t_ESP_PARTITION_TYPE_APP,
                    sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_0 + index,
                    ptr::null(),
                )
            };
            match RawPartition::new(found) {
                Some(raw) => slots.push(raw),
                None => break,
            }
        }
        if slots.is_empty() {
            return Err(anyhow!("partition table has no OTA app slots"));
        }

        let running = RawPartition::new(unsafe { sys::esp_ota_get_running_partition() })
            .ok_or_else(|| anyhow!("running partition unknown"))?;
        Ok(Self { slots, running })
    }

    fn slot_of(&self, raw: RawPartition) -> Result<u8, BootError> {
        self.slots
            .iter()
            .position(|slot| *slot == raw)
            .map(|index| index as u8)
            .ok_or_else(|| StorageError::Device("partition is not an OTA slot".to_string()).into())
    }

    /// Slot after the running one, or slot 0 when running from the factory app.
    fn next_update_slot(&self) -> Result<u8, BootError> {
        match self.current() {
            Ok(current) => self.complementary(current),
            Err(_) => Ok(0),
        }
    }
}

impl BootConfigStore for EspOtaBootStore {
    fn current(&self) -> Result<u8, BootError> {
        self.slot_of(self.running)
    }

    fn next_boot(&self) -> Result<u8, BootError> {
        let boot = RawPartition::new(unsafe { sys::esp_ota_get_boot_partition() })
            .ok_or(BootError::NotPersisted)?;
        self.slot_of(boot)
    }

    fn slot_count(&self) -> Result<u8, BootError> {
        Ok(self.slots.len() as u8)
    }

    fn set_current(&mut self, slot: u8) -> Result<(), BootError> {
        let raw = *self
            .slots
            .get(slot as usize)
            .ok_or(BootError::UnknownSlot {
                slot,
                count: self.slots.len() as u8,
            })?;
        esp!(unsafe { sys::esp_ota_set_boot_partition(raw.0) })
            .map_err(|err| BootError::Storage(device_error(err)))?;

        if self.next_boot()? != slot {
            return Err(BootError::NotPersisted);
        }
        info!("boot slot set to {slot}");
        Ok(())
    }

    fn slot_partition(&self, slot: u8) -> Result<PartitionInfo, BootError> {
        self.slots
            .get(slot as usize)
            .map(|raw| raw.info(slot_name(slot)))
            .ok_or(BootError::UnknownSlot {
                slot,
                count: self.slots.len() as u8,
            })
    }

    fn running_partition(&self) -> Result<PartitionInfo, BootError> {
        let name = match self.current() {
            Ok(slot) => slot_name(slot),
            Err(_) => "factory".to_string(),
        };
        Ok(self.running.info(name))
    }

    fn reserved(&self) -> Vec<PartitionInfo> {
        let otadata = unsafe {
            sys::esp_partition_find_first(
                sys::esp_partition_type_t_ESP_PARTITION_TYPE_DATA,
                sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_DATA_OTA,
                ptr::null(),
            )
        };
        RawPartition::new(otadata)
            .map(|raw| vec![raw.info("otadata".to_string())])
            .unwrap_or_default()
    }
}

/// Runs each item on its own short-lived thread. Events reach the driver
/// through a depth-1 channel, so at most one chunk is buffered.
struct EspHttpTransport {
    driver: SyncSender<DriverMessage>,
    active: Option<(usize, Arc<AtomicBool>)>,
}

impl EspHttpTransport {
    fn new(driver: SyncSender<DriverMessage>) -> Self {
        Self {
            driver,
            active: None,
        }
    }
}

impl FetchTransport for EspHttpTransport {
    fn issue(&mut self, request: FetchRequest) -> Result<(), TransportError> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let driver = self.driver.clone();
        let flag = cancelled.clone();
        let item = request.item;

        thread::Builder::new()
            .name("ota-fetch".into())
            .stack_size(12 * 1024)
            .spawn(move || fetch_item(request, driver, flag))
            .map_err(|err| TransportError::Connection(format!("failed to spawn fetch thread: {err}")))?;

        if let Some((_, previous)) = self.active.replace((item, cancelled)) {
            previous.store(true, Ordering::Relaxed);
        }
        Ok(())
    }

    fn cancel(&mut self, item: usize) {
        if let Some((active, flag)) = self.active.as_ref() {
            if *active == item {
                flag.store(true, Ordering::Relaxed);
            }
        }
    }
}

impl Drop for EspHttpTransport {
    fn drop(&mut self) {
        if let Some((_, flag)) = self.active.take() {
            flag.store(true, Ordering::Relaxed);
        }
    }
}

fn fetch_item(request: FetchRequest, driver: SyncSender<DriverMessage>, cancelled: Arc<AtomicBool>) {
    let item = request.item;
    let outcome = match stream_item(&request, &driver, &cancelled) {
        Ok(bytes) => {
            debug!("OTA item {item} download finished ({bytes} bytes)");
            ItemOutcome::Success
        }
        Err(err) => {
            warn!("OTA item {item} download failed: {err}");
            ItemOutcome::Failure(err)
        }
    };
    let event = TransferEvent::Finished { item, outcome };
    if driver.send(DriverMessage::Event(event)).is_err() {
        debug!("OTA item {item} finished after the update ended");
    }
}

fn stream_item(
    request: &FetchRequest,
    driver: &SyncSender<DriverMessage>,
    cancelled: &AtomicBool,
) -> Result<u64, TransportError> {
    let template = &request.template;
    let http_conf = HttpClientConfiguration {
        timeout: Some(Duration::from_millis(template.timeout_ms)),
        crt_bundle_attach: Some(sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let connection = EspHttpConnection::new(&http_conf)
        .map_err(|err| TransportError::Connection(format!("{err:?}")))?;
    let mut client = HttpClient::wrap(connection);

    let mut headers: Vec<(&str, &str)> = template
        .headers
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_str()))
        .collect();
    if let Some(agent) = template.user_agent.as_deref() {
        headers.push(("User-Agent", agent));
    }

    let http_request = client
        .request(Method::Get, &request.url, &headers)
        .map_err(|err| TransportError::Connection(format!("{err:?}")))?;
    let mut response = http_request
        .submit()
        .map_err(|err| TransportError::Connection(format!("{err:?}")))?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(TransportError::Status(status));
    }

    let mut chunk = [0_u8; FETCH_CHUNK_SIZE];
    let mut total = 0_u64;
    loop {
        if cancelled.load(Ordering::Relaxed) {
            return Err(TransportError::Cancelled);
        }
        let read = response
            .read(&mut chunk)
            .map_err(|err| TransportError::Connection(format!("{err:?}")))?;
        if read == 0 {
            break;
        }

        total = total.saturating_add(read as u64);
        let event = TransferEvent::Chunk {
            item: request.item,
            data: chunk[..read].to_vec(),
        };
        if driver.send(DriverMessage::Event(event)).is_err() {
            return Err(TransportError::Cancelled);
        }
    }
    Ok(total)
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    ssid: &str,
    pass: &str,
) -> anyhow::Result<EspWifi<'static>> {
    if ssid.is_empty() {
        return Err(anyhow!("wifi credentials missing from NVS"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
        password: pass
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{ssid}`");

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|_| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }
        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok(esp_wifi),
        Some(err) => Err(anyhow!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed: {err:#}")),
    }
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    write_json(req, status_code, &payload)
}

impl NvsStore {
    fn load_config(&self) -> anyhow::Result<UpdaterConfig> {
        let _guard = lock(&self.lock);
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_CONFIG_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<UpdaterConfig>(value)?),
            None => Ok(UpdaterConfig::default()),
        }
    }

    fn load_wifi_credentials(&self) -> anyhow::Result<(String, String)> {
        let _guard = lock(&self.lock);
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 128];

        let ssid = nvs
            .get_str(NVS_WIFI_SSID_KEY, &mut buffer)?
            .unwrap_or_default()
            .to_string();
        let pass = nvs
            .get_str(NVS_WIFI_PASS_KEY, &mut buffer)?
            .unwrap_or_default()
            .to_string();
        Ok((ssid, pass))
    }
}
