use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{ErrorKind, Read, Seek, SeekFrom, Write},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, Mutex, Notify},
    task::{block_in_place, JoinHandle},
};
use tracing::{debug, info, warn};

use ota_common::{
    plan::{is_sha256_hex, validate_url},
    BootConfigStore, BootError, BootStatus, BootTarget, Completion, FetchRequest, FetchTransport,
    FlashBootConfigStore, ItemOutcome, Partition, PartitionInfo, StorageError, TransferEvent,
    TransportError, UpdateCoordinator, UpdateError, UpdatePlan, UpdateStatus, UpdaterConfig,
    WRITE_GRANULARITY,
};

type SharedBootStore = Arc<StdMutex<FlashBootConfigStore<FilePartition>>>;
type HostCoordinator = UpdateCoordinator<FilePartition, SharedBootStore, ReqwestTransport>;

#[derive(Clone)]
struct AppState {
    config: Arc<UpdaterConfig>,
    flash: FileFlash,
    boot: SharedBootStore,
    client: reqwest::Client,
    ota: Arc<Mutex<OtaRuntimeState>>,
    shutdown: Arc<Notify>,
}

#[derive(Clone)]
struct AppStore {
    config_path: Arc<PathBuf>,
    flash_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Default)]
struct OtaRuntimeState {
    in_progress: bool,
    abort: Option<mpsc::Sender<()>>,
    attempt: Option<UpdateStatus>,
    completion: Option<Completion>,
    last_completed_epoch: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct OtaItemRequest {
    url: String,
    partition: String,
    #[serde(default)]
    sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
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
    boot: BootStatus,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut config = store.load_config().await.unwrap_or_else(|err| {
        warn!("failed to load updater config from store: {err:#}");
        UpdaterConfig::default()
    });
    config.sanitize();
    if let Err(err) = store.save_config(&config).await {
        warn!("failed to persist updater config: {err:#}");
    }

    let flash = FileFlash::open(
        store.flash_path.as_ref(),
        config.flash.image_size,
        config.flash.sector_size,
    )?;
    let boot_partition = flash
        .partition(config.flash.boot_config())
        .context("boot config sector is outside the flash image")?;
    let default_boot = config
        .flash
        .default_boot_config()
        .context("invalid boot slot layout")?;
    let boot = FlashBootConfigStore::open(boot_partition, default_boot)
        .context("failed to open boot config")?;
    info!(
        "boot config loaded: running slot {}, next boot {}",
        boot.current()?,
        boot.next_boot()?
    );

    let client = reqwest::Client::builder()
        .build()
        .context("failed to build http client")?;

    let app_state = AppState {
        config: Arc::new(config),
        flash,
        boot: Arc::new(StdMutex::new(boot)),
        client,
        ota: Arc::new(Mutex::new(OtaRuntimeState::default())),
        shutdown: Arc::new(Notify::new()),
    };
    let shutdown = app_state.shutdown.clone();

    let app = Router::new()
        .route("/api/ota/status", get(handle_get_ota_status))
        .route("/api/ota/apply", post(handle_post_ota_apply))
        .route("/api/ota/abort", post(handle_post_ota_abort))
        .route("/api/boot", get(handle_get_boot))
        .route("/api/boot/switch", post(handle_post_boot_switch))
        .route("/api/partitions", get(handle_get_partitions))
        .with_state(app_state);

    let port = std::env::var("OTA_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind updater server at {addr}"))?;

    info!("updater listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;
    Ok(())
}

async fn shutdown_signal(shutdown: Arc<Notify>) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!("failed to listen for ctrl-c: {err}");
                shutdown.notified().await;
            }
            info!("interrupt received; shutting down");
        }
        _ = shutdown.notified() => {
            info!("exiting so the host restarts into the selected boot slot");
        }
    }
}

async fn handle_get_ota_status(State(state): State<AppState>) -> impl IntoResponse {
    let ota = state.ota.lock().await;
    Json(OtaStatusResponse {
        supported: true,
        in_progress: ota.in_progress,
        running_slot: state.boot.current().ok(),
        next_boot_slot: state.boot.next_boot().ok(),
        attempt: ota.attempt.clone(),
        completion: ota.completion.clone(),
        last_completed_epoch: ota.last_completed_epoch,
    })
}

async fn handle_post_ota_apply(
    State(state): State<AppState>,
    Json(request): Json<OtaApplyRequest>,
) -> axum::response::Response {
    if let Err(message) = validate_ota_apply_request(&request, &state.config) {
        return error_response(StatusCode::BAD_REQUEST, &message);
    }

    let mut ota = state.ota.lock().await;
    if ota.in_progress {
        return error_response(StatusCode::CONFLICT, "ota update already in progress");
    }

    let attempt = match prepare_attempt(&state, &request) {
        Ok(attempt) => attempt,
        Err((status, message)) => return error_response(status, &message),
    };
    let Attempt {
        mut coordinator,
        events,
        aborts,
        abort_tx,
        done,
    } = attempt;

    if let Err(err) = block_in_place(|| coordinator.start()) {
        warn!("ota plan rejected: {err}");
        let status = match err {
            UpdateError::Plan(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        return error_response(status, &err.to_string());
    }

    let status = coordinator.status();
    let target_slot = status.target_slot;
    ota.in_progress = true;
    ota.abort = Some(abort_tx);
    ota.attempt = Some(status);
    ota.completion = None;
    drop(ota);

    let reboot = request
        .reboot
        .unwrap_or(state.config.reboot_after_apply);
    tokio::spawn(drive_update(
        state.clone(),
        coordinator,
        events,
        aborts,
        done,
        reboot,
    ));

    (
        StatusCode::ACCEPTED,
        Json(OtaApplyResponse {
            accepted: true,
            in_progress: true,
            target_slot,
        }),
    )
        .into_response()
}

async fn handle_post_ota_abort(State(state): State<AppState>) -> axum::response::Response {
    let ota = state.ota.lock().await;
    match ota.abort.as_ref() {
        Some(abort) if ota.in_progress => {
            if let Err(err) = abort.try_send(()) {
                debug!("abort already pending: {err}");
            }
            (StatusCode::ACCEPTED, Json(serde_json::json!({ "aborting": true }))).into_response()
        }
        _ => error_response(StatusCode::CONFLICT, "no ota update in progress"),
    }
}

async fn handle_get_boot(State(state): State<AppState>) -> axum::response::Response {
    match boot_status(&state.boot) {
        Ok(status) => Json(status).into_response(),
        Err(err) => {
            warn!("failed to read boot config: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read boot config")
        }
    }
}

async fn handle_post_boot_switch(
    State(state): State<AppState>,
    Json(request): Json<BootSwitchRequest>,
) -> axum::response::Response {
    let ota = state.ota.lock().await;
    if ota.in_progress {
        return error_response(StatusCode::CONFLICT, "ota update already in progress");
    }

    let mut boot = state.boot.clone();
    match block_in_place(|| boot.set_current(request.slot)) {
        Ok(()) => {}
        Err(err @ BootError::UnknownSlot { .. }) => {
            return error_response(StatusCode::BAD_REQUEST, &err.to_string());
        }
        Err(err) => {
            warn!("boot switch to slot {} failed: {err}", request.slot);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to persist boot slot",
            );
        }
    }
    drop(ota);

    let status = match boot_status(&state.boot) {
        Ok(status) => status,
        Err(err) => {
            warn!("failed to read boot config: {err}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read boot config");
        }
    };

    let restart_requested = request
        .reboot
        .unwrap_or(state.config.reboot_after_apply)
        && state.boot.switch_pending();
    if restart_requested {
        schedule_restart(&state);
    }

    Json(BootSwitchResponse {
        restart_requested,
        boot: status,
    })
    .into_response()
}

async fn handle_get_partitions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.config.flash.partitions())
}

struct Attempt {
    coordinator: HostCoordinator,
    events: mpsc::Receiver<TransferEvent>,
    aborts: mpsc::Receiver<()>,
    abort_tx: mpsc::Sender<()>,
    done: oneshot::Receiver<Completion>,
}

fn prepare_attempt(
    state: &AppState,
    request: &OtaApplyRequest,
) -> Result<Attempt, (StatusCode, String)> {
    let mut plan = UpdatePlan::new();
    for item in &request.items {
        let info = state
            .config
            .flash
            .resolve(&item.partition)
            .ok_or_else(|| {
                (
                    StatusCode::BAD_REQUEST,
                    format!("unknown partition `{}`", item.partition),
                )
            })?;
        let partition = state
            .flash
            .partition(info)
            .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
        plan.add_item_with_digest(item.url.as_str(), partition, item.sha256.clone());
    }

    let target = match &request.slot {
        None => BootTarget::NoSwitch,
        Some(SlotSelector::Index(slot)) => BootTarget::Slot(*slot),
        Some(SlotSelector::Keyword(_)) => {
            let next = state
                .boot
                .current()
                .and_then(|current| state.boot.complementary(current))
                .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
            BootTarget::Slot(next)
        }
    };
    plan.set_target_slot(target);

    // Depth 1 keeps a single chunk buffer in flight.
    let (events_tx, events) = mpsc::channel(1);
    let (abort_tx, aborts) = mpsc::channel(1);
    let (done_tx, done) = oneshot::channel();

    let mut coordinator = UpdateCoordinator::new(
        plan,
        state.boot.clone(),
        ReqwestTransport::new(state.client.clone(), events_tx),
    );
    coordinator.set_request_template(state.config.request.clone());
    coordinator.set_max_items(state.config.max_items);
    coordinator.set_completion_callback(move |completion| {
        if done_tx.send(completion.clone()).is_err() {
            debug!("ota completion receiver dropped");
        }
    });

    Ok(Attempt {
        coordinator,
        events,
        aborts,
        abort_tx,
        done,
    })
}

async fn drive_update(
    state: AppState,
    mut coordinator: HostCoordinator,
    mut events: mpsc::Receiver<TransferEvent>,
    mut aborts: mpsc::Receiver<()>,
    done: oneshot::Receiver<Completion>,
    reboot: bool,
) {
    // Coordinator calls write the flash file synchronously.
    while !coordinator.state().is_terminal() {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => block_in_place(|| coordinator.apply(event)),
                None => block_in_place(|| coordinator.abort()),
            },
            Some(()) = aborts.recv() => block_in_place(|| coordinator.abort()),
        }
        state.ota.lock().await.attempt = Some(coordinator.status());
    }

    let status = coordinator.status();
    drop(coordinator);
    let completion = done.await.ok();
    let restart = reboot
        && completion
            .as_ref()
            .is_some_and(|completion| completion.restart_requested);

    match completion.as_ref() {
        Some(completion) if completion.success => info!("ota update applied"),
        Some(completion) => warn!(
            "ota update failed: {}",
            completion.message.as_deref().unwrap_or("unknown error")
        ),
        None => warn!("ota update ended without a completion report"),
    }

    {
        let mut ota = state.ota.lock().await;
        ota.in_progress = false;
        ota.abort = None;
        ota.attempt = Some(status);
        ota.completion = completion;
        ota.last_completed_epoch = Some(Utc::now().timestamp());
    }

    if restart {
        schedule_restart(&state);
    }
}

fn schedule_restart(state: &AppState) {
    let delay = Duration::from_millis(state.config.restart_delay_ms);
    let shutdown = state.shutdown.clone();
    info!("restart requested; exiting in {}ms", delay.as_millis());
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        shutdown.notify_one();
    });
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
        if config.flash.resolve(&item.partition).is_none() {
            return Err(format!(
                "item {index}: unknown partition `{}`",
                item.partition
            ));
        }
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

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("OTA_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.ota"));

        Self {
            config_path: Arc::new(data_dir.join("updater.json")),
            flash_path: Arc::new(data_dir.join("flash.bin")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_config(&self) -> anyhow::Result<UpdaterConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.config_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<UpdaterConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(UpdaterConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_config(&self, config: &UpdaterConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.config_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(config)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

/// Flash image kept in a regular file. Programming overwrites bytes in place.
#[derive(Debug, Clone)]
struct FileFlash {
    file: Arc<StdMutex<File>>,
    size: u32,
    sector_size: u32,
}

impl FileFlash {
    fn open(path: &Path, size: u32, sector_size: u32) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open flash image {}", path.display()))?;

        let len = file.metadata()?.len();
        if len < size as u64 {
            info!(
                "extending flash image {} from {len} to {size} bytes",
                path.display()
            );
            file.seek(SeekFrom::Start(len))?;
            let fill = vec![0xFF_u8; sector_size as usize];
            let mut remaining = size as u64 - len;
            while remaining > 0 {
                let take = remaining.min(fill.len() as u64) as usize;
                file.write_all(&fill[..take])?;
                remaining -= take as u64;
            }
            file.sync_data()?;
        }

        Ok(Self {
            file: Arc::new(StdMutex::new(file)),
            size,
            sector_size,
        })
    }

    fn partition(&self, info: PartitionInfo) -> Result<FilePartition, StorageError> {
        if info.end() > self.size as u64 {
            return Err(StorageError::OutOfBounds {
                offset: info.address,
                len: info.size as usize,
            });
        }
        Ok(FilePartition {
            flash: self.clone(),
            info,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, File> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone)]
struct FilePartition {
    flash: FileFlash,
    info: PartitionInfo,
}

impl FilePartition {
    fn check_range(&self, offset: u32, len: usize) -> Result<u64, StorageError> {
        if offset as u64 + len as u64 > self.info.size as u64 {
            return Err(StorageError::OutOfBounds { offset, len });
        }
        Ok(self.info.address as u64 + offset as u64)
    }
}

impl Partition for FilePartition {
    fn info(&self) -> PartitionInfo {
        self.info.clone()
    }

    fn sector_size(&self) -> u32 {
        self.flash.sector_size
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        let absolute = self.check_range(offset, buf.len())?;
        let mut file = self.flash.lock();
        file.seek(SeekFrom::Start(absolute))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        let absolute = self.check_range(offset, data.len())?;
        if absolute as usize % WRITE_GRANULARITY != 0 || data.len() % WRITE_GRANULARITY != 0 {
            return Err(StorageError::Misaligned {
                offset,
                len: data.len(),
            });
        }
        let mut file = self.flash.lock();
        file.seek(SeekFrom::Start(absolute))?;
        file.write_all(data)?;
        Ok(())
    }

    fn erase(&mut self, offset: u32) -> Result<(), StorageError> {
        let sector = self.flash.sector_size;
        let absolute = self.check_range(offset, sector as usize)?;
        if absolute % sector as u64 != 0 {
            return Err(StorageError::Misaligned {
                offset,
                len: sector as usize,
            });
        }
        let mut file = self.flash.lock();
        file.seek(SeekFrom::Start(absolute))?;
        file.write_all(&vec![0xFF; sector as usize])?;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        self.flash.lock().sync_data()?;
        Ok(())
    }
}

/// Streams each item with reqwest from a spawned task. Events go through a
/// bounded channel, so a slow flash write backs up the download.
struct ReqwestTransport {
    client: reqwest::Client,
    events: mpsc::Sender<TransferEvent>,
    tasks: HashMap<usize, JoinHandle<()>>,
}

impl ReqwestTransport {
    fn new(client: reqwest::Client, events: mpsc::Sender<TransferEvent>) -> Self {
        Self {
            client,
            events,
            tasks: HashMap::new(),
        }
    }
}

impl FetchTransport for ReqwestTransport {
    fn issue(&mut self, request: FetchRequest) -> Result<(), TransportError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| TransportError::Connection(err.to_string()))?;
        let item = request.item;
        let task = runtime.spawn(fetch_item(self.client.clone(), request, self.events.clone()));
        if let Some(previous) = self.tasks.insert(item, task) {
            previous.abort();
        }
        Ok(())
    }

    fn cancel(&mut self, item: usize) {
        if let Some(task) = self.tasks.remove(&item) {
            debug!("cancelling fetch for ota item {item}");
            task.abort();
        }
    }
}

impl Drop for ReqwestTransport {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

async fn fetch_item(
    client: reqwest::Client,
    request: FetchRequest,
    events: mpsc::Sender<TransferEvent>,
) {
    let item = request.item;
    let outcome = match stream_item(&client, &request, &events).await {
        Ok(bytes) => {
            debug!("ota item {item} download finished ({bytes} bytes)");
            ItemOutcome::Success
        }
        Err(err) => {
            warn!("ota item {item} download failed: {err}");
            ItemOutcome::Failure(err)
        }
    };
    if events
        .send(TransferEvent::Finished { item, outcome })
        .await
        .is_err()
    {
        debug!("ota item {item} finished after the update ended");
    }
}

async fn stream_item(
    client: &reqwest::Client,
    request: &FetchRequest,
    events: &mpsc::Sender<TransferEvent>,
) -> Result<u64, TransportError> {
    let template = &request.template;
    let mut builder = client
        .get(&request.url)
        .timeout(Duration::from_millis(template.timeout_ms));
    for (name, value) in &template.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(agent) = template.user_agent.as_deref() {
        builder = builder.header(reqwest::header::USER_AGENT, agent);
    }

    let mut response = builder.send().await.map_err(transport_error)?;
    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::Status(status.as_u16()));
    }

    let mut total = 0_u64;
    while let Some(chunk) = response.chunk().await.map_err(transport_error)? {
        if chunk.is_empty() {
            continue;
        }
        total += chunk.len() as u64;
        let event = TransferEvent::Chunk {
            item: request.item,
            data: chunk.to_vec(),
        };
        if events.send(event).await.is_err() {
            return Err(TransportError::Cancelled);
        }
    }
    Ok(total)
}

fn transport_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Connection(err.to_string())
    }
}
