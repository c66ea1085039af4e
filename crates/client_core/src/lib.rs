use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use shared::{
    domain::{AttemptId, ColourEncoding, MAX_COLOURS, MIN_COLOURS},
    error::ErrorCode,
    protocol::{GenerationAck, StoreReceipt, SubmissionPayload},
};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};
use url::Url;

/// Synthetic progress cadence: the store call is a single opaque request, so
/// progress is display-only and advances on a timer until the call resolves.
const PROGRESS_TICK: Duration = Duration::from_millis(200);
const PROGRESS_STEP: u8 = 10;
const PROGRESS_CEILING: u8 = 90;
const PROGRESS_COMPLETE: u8 = 100;

const NOTICE_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_STORE_FOLDER: &str = "pbn-uploads";

pub const UPLOAD_SUCCESS_MESSAGE: &str = "Image uploaded successfully!";
pub const UPLOAD_FAILURE_MESSAGE: &str = "Failed to upload image. Please try again.";
pub const MISSING_IMAGE_MESSAGE: &str = "Please upload an image first.";

/// A byte-bearing file reference handed to the coordinator by the intake
/// surface (drop zone or file picker).
#[derive(Debug, Clone)]
pub struct LocalFile {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Opaque handle to the locally rendered preview of the selected file.
/// Exists only while an upload is in flight or has succeeded.
#[derive(Debug, Clone)]
pub struct PreviewHandle {
    filename: String,
    mime_type: Option<String>,
    bytes: Arc<Vec<u8>>,
}

impl PreviewHandle {
    fn new(file: &LocalFile) -> Self {
        Self {
            filename: file.filename.clone(),
            mime_type: file.mime_type.clone(),
            bytes: Arc::new(file.bytes.clone()),
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Idle,
    Uploading,
    Success,
    Error,
}

/// Caller-visible copy of the coordinator state at one point in time.
#[derive(Debug, Clone)]
pub struct UploadSnapshot {
    pub status: UploadStatus,
    pub preview: Option<PreviewHandle>,
    pub progress: u8,
    pub remote_url: Option<String>,
    pub generation: u64,
}

impl UploadSnapshot {
    pub fn idle() -> Self {
        Self {
            status: UploadStatus::Idle,
            preview: None,
            progress: 0,
            remote_url: None,
            generation: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("an upload is already in flight; intake is disabled")]
    AlreadyUploading,
    #[error("file rejected by intake policy: {0}")]
    RejectedByPolicy(String),
    #[error("no upload to reset")]
    NothingToReset,
}

/// Optional hard intake checks. Both limits default to `None`: the UI shows
/// "JPG, PNG (max 10MB)" as guidance only, and callers opt in to enforcement.
#[derive(Debug, Clone, Default)]
pub struct IntakePolicy {
    pub max_bytes: Option<u64>,
    pub accept_mime_prefix: Option<String>,
}

impl IntakePolicy {
    fn check(&self, file: &LocalFile) -> Result<(), String> {
        if let Some(max_bytes) = self.max_bytes {
            if file.bytes.len() as u64 > max_bytes {
                return Err(format!(
                    "file is {} bytes, larger than the {} byte limit",
                    file.bytes.len(),
                    max_bytes
                ));
            }
        }
        if let Some(prefix) = &self.accept_mime_prefix {
            match &file.mime_type {
                Some(mime) if mime.starts_with(prefix.as_str()) => {}
                Some(mime) => {
                    return Err(format!("mime type {mime:?} does not match {prefix:?}"));
                }
                None => {
                    return Err(format!("missing mime type, expected {prefix:?}"));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct UploadCoordinatorConfig {
    pub intake: IntakePolicy,
    /// No timeout by default; expiry is classified as an upload failure.
    pub upload_timeout: Option<Duration>,
}

/// Descriptive fields forwarded to the remote store alongside the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMetadata {
    pub filename: String,
    pub mime_type: Option<String>,
}

/// The external media-hosting service. One call, one result; retries are the
/// caller's responsibility.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn store(&self, bytes: Vec<u8>, metadata: StoreMetadata) -> Result<StoreReceipt>;
}

pub struct MissingRemoteStore;

#[async_trait]
impl RemoteStore for MissingRemoteStore {
    async fn store(&self, _bytes: Vec<u8>, metadata: StoreMetadata) -> Result<StoreReceipt> {
        Err(anyhow!(
            "remote store is unavailable for file {}",
            metadata.filename
        ))
    }
}

/// The external canvas-generation service. Receives one finalized payload
/// per submission attempt.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(&self, payload: &SubmissionPayload) -> Result<GenerationAck>;
}

pub struct MissingGenerationBackend;

#[async_trait]
impl GenerationBackend for MissingGenerationBackend {
    async fn generate(&self, _payload: &SubmissionPayload) -> Result<GenerationAck> {
        Err(anyhow!("generation backend is unavailable"))
    }
}

/// Explicitly constructed store client configuration. Injected per
/// coordinator instance rather than set process-wide.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub base_url: Url,
    pub api_key: Option<String>,
    pub folder: String,
    pub request_timeout: Option<Duration>,
}

impl StoreConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            api_key: None,
            folder: DEFAULT_STORE_FOLDER.to_string(),
            request_timeout: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StoreUploadResponse {
    url: String,
}

/// HTTP-backed remote store: POSTs the raw bytes to `{base_url}/upload` with
/// the file metadata as query parameters and expects `{"url": ...}` back.
pub struct HttpRemoteStore {
    http: Client,
    config: StoreConfig,
}

impl HttpRemoteStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn store(&self, bytes: Vec<u8>, metadata: StoreMetadata) -> Result<StoreReceipt> {
        let endpoint = self.config.base_url.join("upload")?;
        let mut request = self
            .http
            .post(endpoint)
            .query(&[
                ("filename", metadata.filename.clone()),
                (
                    "mime_type",
                    metadata
                        .mime_type
                        .clone()
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                ),
                ("folder", self.config.folder.clone()),
            ])
            .body(bytes);
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }
        if let Some(timeout) = self.config.request_timeout {
            request = request.timeout(timeout);
        }
        let response: StoreUploadResponse = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(StoreReceipt { url: response.url })
    }
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: Url,
    pub request_timeout: Option<Duration>,
}

impl BackendConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            request_timeout: None,
        }
    }
}

/// HTTP-backed generation backend: POSTs the payload as JSON to
/// `{base_url}/generate`.
pub struct HttpGenerationBackend {
    http: Client,
    config: BackendConfig,
}

impl HttpGenerationBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }
}

#[async_trait]
impl GenerationBackend for HttpGenerationBackend {
    async fn generate(&self, payload: &SubmissionPayload) -> Result<GenerationAck> {
        let endpoint = self.config.base_url.join("generate")?;
        let mut request = self.http.post(endpoint).json(payload);
        if let Some(timeout) = self.config.request_timeout {
            request = request.timeout(timeout);
        }
        let ack: GenerationAck = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(ack)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    UploadSucceeded,
    UploadFailed,
    SubmissionAccepted,
    MissingImage,
    SubmissionFailed,
}

impl NoticeKind {
    pub fn error_code(self) -> Option<ErrorCode> {
        match self {
            NoticeKind::UploadSucceeded | NoticeKind::SubmissionAccepted => None,
            NoticeKind::UploadFailed => Some(ErrorCode::UploadFailed),
            NoticeKind::MissingImage => Some(ErrorCode::MissingImage),
            NoticeKind::SubmissionFailed => Some(ErrorCode::SubmissionFailed),
        }
    }

    pub fn is_failure(self) -> bool {
        self.error_code().is_some()
    }
}

/// One user-facing toast. Exactly one is published per upload attempt and
/// per submission attempt, keyed by the attempt's outcome.
#[derive(Debug, Clone)]
pub struct Notification {
    pub attempt: AttemptId,
    pub kind: NoticeKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Notification {
    fn now(attempt: AttemptId, kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            attempt,
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

struct UploadInner {
    status: UploadStatus,
    preview: Option<PreviewHandle>,
    progress: u8,
    remote_url: Option<String>,
    generation: u64,
}

impl UploadInner {
    fn new() -> Self {
        Self {
            status: UploadStatus::Idle,
            preview: None,
            progress: 0,
            remote_url: None,
            generation: 0,
        }
    }
}

/// Owns the lifecycle of a single in-flight upload: intake, local preview,
/// delegation to the remote store, synthetic progress, and a terminal URL or
/// failure. At most one upload is in flight per instance; a second intake is
/// rejected rather than queued. The generation counter is bumped on every
/// intake and reset so stale completions from abandoned uploads are
/// discarded instead of overwriting newer state.
pub struct UploadCoordinator {
    store: Arc<dyn RemoteStore>,
    config: UploadCoordinatorConfig,
    inner: Mutex<UploadInner>,
    notices: broadcast::Sender<Notification>,
}

impl UploadCoordinator {
    pub fn new(store: Arc<dyn RemoteStore>) -> Arc<Self> {
        Self::with_config(store, UploadCoordinatorConfig::default())
    }

    pub fn with_config(store: Arc<dyn RemoteStore>, config: UploadCoordinatorConfig) -> Arc<Self> {
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        Arc::new(Self {
            store,
            config,
            inner: Mutex::new(UploadInner::new()),
            notices,
        })
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notices.subscribe()
    }

    pub async fn snapshot(&self) -> UploadSnapshot {
        let inner = self.inner.lock().await;
        UploadSnapshot {
            status: inner.status,
            preview: inner.preview.clone(),
            progress: inner.progress,
            remote_url: inner.remote_url.clone(),
            generation: inner.generation,
        }
    }

    /// Multi-file intake: only the first file is taken. An empty drop is a
    /// no-op, matching the drop-zone behaviour.
    pub async fn accept_first(self: &Arc<Self>, files: Vec<LocalFile>) -> Result<(), UploadError> {
        match files.into_iter().next() {
            Some(file) => self.accept_file(file).await,
            None => {
                debug!("empty intake; nothing to upload");
                Ok(())
            }
        }
    }

    /// Begins an upload: transitions Idle/Success/Error -> Uploading,
    /// allocates the preview handle, and starts the store call plus the
    /// synthetic progress ticker. Rejected while another upload is in
    /// flight.
    pub async fn accept_file(self: &Arc<Self>, file: LocalFile) -> Result<(), UploadError> {
        if let Err(reason) = self.config.intake.check(&file) {
            warn!(filename = %file.filename, %reason, "upload intake rejected by policy");
            return Err(UploadError::RejectedByPolicy(reason));
        }

        let generation = {
            let mut inner = self.inner.lock().await;
            if inner.status == UploadStatus::Uploading {
                warn!(
                    filename = %file.filename,
                    "upload intake disabled while another upload is in flight"
                );
                return Err(UploadError::AlreadyUploading);
            }
            inner.generation += 1;
            inner.status = UploadStatus::Uploading;
            inner.progress = 0;
            inner.remote_url = None;
            inner.preview = Some(PreviewHandle::new(&file));
            inner.generation
        };

        let attempt = AttemptId::new();
        info!(
            %attempt,
            generation,
            filename = %file.filename,
            size_bytes = file.bytes.len(),
            "upload started"
        );
        self.spawn_progress_ticker(generation);
        self.spawn_store_task(generation, attempt, file);
        Ok(())
    }

    /// Returns to Idle, releasing the preview handle. Legal from Success and
    /// Error, and from Uploading as abandonment: the in-flight result is
    /// discarded when it eventually arrives.
    pub async fn reset(&self) -> Result<(), UploadError> {
        let mut inner = self.inner.lock().await;
        match inner.status {
            UploadStatus::Idle => Err(UploadError::NothingToReset),
            status => {
                if status == UploadStatus::Uploading {
                    info!(generation = inner.generation, "abandoning in-flight upload");
                }
                inner.generation += 1;
                inner.status = UploadStatus::Idle;
                inner.progress = 0;
                inner.remote_url = None;
                inner.preview = None;
                Ok(())
            }
        }
    }

    /// Display-only progress: +10 points every 200ms, capped at 90, until
    /// the store call resolves. The task is keyed to the upload's generation
    /// and stops deterministically on resolution and on abandonment.
    fn spawn_progress_ticker(self: &Arc<Self>, generation: u64) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROGRESS_TICK);
            // The first tick of an interval completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut inner = coordinator.inner.lock().await;
                if inner.generation != generation || inner.status != UploadStatus::Uploading {
                    break;
                }
                if inner.progress < PROGRESS_CEILING {
                    inner.progress = (inner.progress + PROGRESS_STEP).min(PROGRESS_CEILING);
                }
            }
        });
    }

    fn spawn_store_task(self: &Arc<Self>, generation: u64, attempt: AttemptId, file: LocalFile) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let metadata = StoreMetadata {
                filename: file.filename,
                mime_type: file.mime_type,
            };
            let upload = coordinator.store.store(file.bytes, metadata);
            let outcome = match coordinator.config.upload_timeout {
                Some(limit) => match tokio::time::timeout(limit, upload).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!(
                        "remote store did not respond within {}ms",
                        limit.as_millis()
                    )),
                },
                None => upload.await,
            };
            coordinator.finish_upload(generation, attempt, outcome).await;
        });
    }

    async fn finish_upload(
        &self,
        generation: u64,
        attempt: AttemptId,
        outcome: Result<StoreReceipt>,
    ) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            debug!(
                stale_generation = generation,
                current_generation = inner.generation,
                "discarding stale store completion"
            );
            return;
        }
        match outcome {
            Ok(receipt) => {
                inner.status = UploadStatus::Success;
                inner.progress = PROGRESS_COMPLETE;
                inner.remote_url = Some(receipt.url.clone());
                info!(%attempt, generation, url = %receipt.url, "upload completed");
                drop(inner);
                self.notify(attempt, NoticeKind::UploadSucceeded, UPLOAD_SUCCESS_MESSAGE);
            }
            Err(err) => {
                inner.status = UploadStatus::Error;
                inner.progress = 0;
                inner.remote_url = None;
                inner.preview = None;
                error!(%attempt, generation, error = %err, "upload failed");
                drop(inner);
                self.notify(attempt, NoticeKind::UploadFailed, UPLOAD_FAILURE_MESSAGE);
            }
        }
    }

    fn notify(&self, attempt: AttemptId, kind: NoticeKind, message: impl Into<String>) {
        let _ = self.notices.send(Notification::now(attempt, kind, message));
    }
}

/// Phases of one submission attempt. Rejected, Succeeded, and Failed are
/// terminal for the attempt but the gate itself stays retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionPhase {
    Idle,
    Validating,
    Building,
    Rejected,
    Dispatched,
    Succeeded,
    Failed,
}

impl SubmissionPhase {
    fn is_in_flight(self) -> bool {
        matches!(
            self,
            SubmissionPhase::Validating | SubmissionPhase::Building | SubmissionPhase::Dispatched
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubmissionGateConfig {
    /// No timeout by default; expiry is classified as a submission failure.
    pub dispatch_timeout: Option<Duration>,
}

/// Per-attempt result record handed back to the UI layer. The gate never
/// returns an `Err` past its boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionOutcome {
    pub success: bool,
    pub message: String,
}

impl SubmissionOutcome {
    fn succeeded(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Owns the form-level state machine: blocks submission until an upload has
/// succeeded, merges advanced-option defaults, dispatches the payload to the
/// generation backend, and reports per-attempt success or failure.
pub struct SubmissionGate {
    backend: Arc<dyn GenerationBackend>,
    config: SubmissionGateConfig,
    phase: Mutex<SubmissionPhase>,
    notices: broadcast::Sender<Notification>,
}

impl SubmissionGate {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self::with_config(backend, SubmissionGateConfig::default())
    }

    pub fn with_config(backend: Arc<dyn GenerationBackend>, config: SubmissionGateConfig) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        Self {
            backend,
            config,
            phase: Mutex::new(SubmissionPhase::Idle),
            notices,
        }
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notices.subscribe()
    }

    pub async fn phase(&self) -> SubmissionPhase {
        *self.phase.lock().await
    }

    /// One submission attempt. Builds exactly one payload or fails before
    /// building one; all internal failures are converted into the failure
    /// variant of the outcome record.
    pub async fn submit(
        &self,
        fields: BTreeMap<String, Value>,
        upload: &UploadSnapshot,
    ) -> SubmissionOutcome {
        let attempt = AttemptId::new();

        {
            let mut phase = self.phase.lock().await;
            if phase.is_in_flight() {
                // The UI disables the submit affordance while an attempt is
                // outstanding; refusing here is a backstop, not an outcome,
                // so no notification is published.
                warn!(%attempt, current_phase = ?*phase, "submission refused while another attempt is outstanding");
                return SubmissionOutcome::failed("A submission is already in progress.");
            }
            *phase = SubmissionPhase::Validating;
        }

        let image_url = match (upload.status, &upload.remote_url) {
            (UploadStatus::Success, Some(url)) => url.clone(),
            (status, _) => {
                self.set_phase(SubmissionPhase::Rejected).await;
                warn!(%attempt, ?status, "submission rejected: no uploaded image");
                self.notify(attempt, NoticeKind::MissingImage, MISSING_IMAGE_MESSAGE);
                return SubmissionOutcome::failed(MISSING_IMAGE_MESSAGE);
            }
        };

        if let Err(reason) = validate_form_fields(&fields) {
            self.set_phase(SubmissionPhase::Rejected).await;
            warn!(%attempt, %reason, "submission rejected: invalid form fields");
            self.notify(attempt, NoticeKind::SubmissionFailed, reason.clone());
            return SubmissionOutcome::failed(reason);
        }

        self.set_phase(SubmissionPhase::Building).await;
        let payload = SubmissionPayload::build(image_url, fields);

        self.set_phase(SubmissionPhase::Dispatched).await;
        info!(%attempt, image_url = payload.image_url(), "submission dispatched");

        let dispatch = self.backend.generate(&payload);
        let result = match self.config.dispatch_timeout {
            Some(limit) => match tokio::time::timeout(limit, dispatch).await {
                Ok(result) => result,
                Err(_) => Err(anyhow!(
                    "generation backend did not respond within {}ms",
                    limit.as_millis()
                )),
            },
            None => dispatch.await,
        };

        match result {
            Ok(ack) if ack.success => {
                self.set_phase(SubmissionPhase::Succeeded).await;
                info!(%attempt, message = %ack.message, "submission accepted");
                self.notify(attempt, NoticeKind::SubmissionAccepted, ack.message.clone());
                SubmissionOutcome::succeeded(ack.message)
            }
            Ok(ack) => {
                self.set_phase(SubmissionPhase::Failed).await;
                warn!(%attempt, message = %ack.message, "submission rejected by backend");
                self.notify(attempt, NoticeKind::SubmissionFailed, ack.message.clone());
                SubmissionOutcome::failed(ack.message)
            }
            Err(err) => {
                self.set_phase(SubmissionPhase::Failed).await;
                error!(%attempt, error = %err, "submission dispatch failed");
                let message = format!("Canvas generation failed: {err}");
                self.notify(attempt, NoticeKind::SubmissionFailed, message.clone());
                SubmissionOutcome::failed(message)
            }
        }
    }

    async fn set_phase(&self, phase: SubmissionPhase) {
        *self.phase.lock().await = phase;
    }

    fn notify(&self, attempt: AttemptId, kind: NoticeKind, message: impl Into<String>) {
        let _ = self.notices.send(Notification::now(attempt, kind, message));
    }
}

/// Form rules carried over from the configuration panel: `k_colours` is a
/// required integer within the selectable range and `encoding` a required
/// channel order. Browser form data is stringly typed, so numeric fields are
/// accepted as JSON numbers or numeric strings.
fn validate_form_fields(fields: &BTreeMap<String, Value>) -> Result<(), String> {
    let k_colours = fields
        .get("k_colours")
        .ok_or_else(|| "k_colours is required".to_string())?;
    let k_colours = value_as_i64(k_colours)
        .ok_or_else(|| format!("k_colours must be an integer, got {k_colours}"))?;
    if !(MIN_COLOURS..=MAX_COLOURS).contains(&k_colours) {
        return Err(format!(
            "k_colours must be between {MIN_COLOURS} and {MAX_COLOURS}, got {k_colours}"
        ));
    }

    let encoding = fields
        .get("encoding")
        .ok_or_else(|| "encoding is required".to_string())?;
    let encoding = encoding
        .as_str()
        .ok_or_else(|| format!("encoding must be a string, got {encoding}"))?;
    encoding
        .parse::<ColourEncoding>()
        .map_err(|err| err.to_string())?;

    Ok(())
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
