use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex as ParkingMutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::archive::DownloadArchive;
use crate::config::Config;
use crate::error::{AuthError, DownloadError, RequestError};
use crate::fetch::{HelperFetcher, MediaFetcher, MediaStream};
use crate::guard::{SessionGuard, SessionProbe, SessionStatus};
use crate::identifier;
use crate::reporter::ProgressReporter;
use crate::resolver::{
    CollectionResolver, PlayableItem, PlayableKind, ResolveOptions, ResolvedCollection,
    WebApiResolver,
};
use crate::session::{Session, SessionCell};
use crate::webapi::WebApiClient;
use crate::writer::{FsOutputWriter, OutputWriter};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "Pending",
            JobStatus::Running => "Running",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
            JobStatus::Cancelled => "Cancelled",
        }
    }
}

/// Position of a run in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Idle,
    Validating,
    Resolving,
    Downloading(usize),
    Completed,
    Failed,
    Cancelled,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobPhase::Completed | JobPhase::Failed | JobPhase::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Parse,
    Authentication,
    Resolution,
    Download,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Started,
    ItemProgress { index: usize, total: usize },
    ItemDone { index: usize, name: String },
    ItemSkipped { index: usize, reason: String },
    JobDone,
    JobFailed { kind: FailureKind, reason: String },
    JobCancelled,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::JobDone | ProgressEvent::JobFailed { .. } | ProgressEvent::JobCancelled
        )
    }
}

/// A resolved collection and how far the run has got through it.
#[derive(Debug)]
pub struct DownloadJob {
    collection: ResolvedCollection,
    cursor: usize,
    status: JobStatus,
}

impl DownloadJob {
    pub fn new(collection: ResolvedCollection) -> Self {
        Self {
            collection,
            cursor: 0,
            status: JobStatus::Pending,
        }
    }

    pub fn total(&self) -> usize {
        self.collection.len()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn set_status(&mut self, status: JobStatus) {
        self.status = status;
    }

    pub fn next_item(&mut self) -> Option<(usize, PlayableItem)> {
        let item = self.collection.get(self.cursor)?.clone();
        let index = self.cursor;
        self.cursor += 1;
        Some((index, item))
    }
}

/// Everything a run talks to besides the session.
pub struct Collaborators {
    pub probe: Arc<dyn SessionProbe>,
    pub resolver: Arc<dyn CollectionResolver>,
    pub fetcher: Arc<dyn MediaFetcher>,
    pub writer: Arc<dyn OutputWriter>,
    pub archive: Option<DownloadArchive>,
}

impl Collaborators {
    /// Web API backed collaborators. A download archive that cannot be opened
    /// is logged and left out.
    pub fn from_config(config: &Config) -> Self {
        let api = WebApiClient::new(config.advanced.api_base_url.clone());
        let archive = match DownloadArchive::open(config.archive_path()) {
            Ok(archive) => Some(archive),
            Err(error) => {
                warn!("download archive disabled: {error}");
                None
            }
        };

        Self {
            probe: Arc::new(api.clone()),
            resolver: Arc::new(WebApiResolver::new(api.clone())),
            fetcher: Arc::new(HelperFetcher::new(api, &config.advanced)),
            writer: Arc::new(FsOutputWriter::new()),
            archive,
        }
    }
}

pub struct JobHandle {
    pub id: Uuid,
    pub reference: String,
    phase_rx: watch::Receiver<JobPhase>,
    reporter: ParkingMutex<Option<ProgressReporter>>,
    cancel_token: CancellationToken,
}

impl JobHandle {
    pub fn phase(&self) -> JobPhase {
        *self.phase_rx.borrow()
    }

    pub fn phase_receiver(&self) -> watch::Receiver<JobPhase> {
        self.phase_rx.clone()
    }

    pub fn take_reporter(&self) -> Option<ProgressReporter> {
        self.reporter.lock().take()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("reference", &self.reference)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Runs at most one download job at a time.
pub struct DownloadService {
    inner: Arc<ServiceInner>,
    runtime: Handle,
}

struct ServiceInner {
    config: RwLock<Config>,
    sessions: SessionCell,
    guard: SessionGuard,
    resolver: Arc<dyn CollectionResolver>,
    fetcher: Arc<dyn MediaFetcher>,
    writer: Arc<dyn OutputWriter>,
    archive: Option<DownloadArchive>,
    active: AtomicBool,
}

/// Held by the running job; frees the service when dropped.
struct JobSlot {
    inner: Arc<ServiceInner>,
}

impl JobSlot {
    fn acquire(inner: &Arc<ServiceInner>) -> Option<Self> {
        inner
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                inner: inner.clone(),
            })
    }
}

impl Drop for JobSlot {
    fn drop(&mut self) {
        self.inner.active.store(false, Ordering::Release);
    }
}

struct JobRuntime {
    id: Uuid,
    reference: String,
    session: Arc<Session>,
    config: Config,
    phase_tx: watch::Sender<JobPhase>,
    events_tx: mpsc::Sender<ProgressEvent>,
    cancel_token: CancellationToken,
    service: Arc<ServiceInner>,
}

enum Interrupt {
    Cancelled,
    Failed { kind: FailureKind, reason: String },
}

impl Interrupt {
    fn failed(kind: FailureKind, error: impl fmt::Display) -> Self {
        Interrupt::Failed {
            kind,
            reason: error.to_string(),
        }
    }
}

enum ItemOutcome {
    Done(String),
    Skipped(String),
}

impl DownloadService {
    /// Must be called from within a Tokio runtime; jobs are spawned on it.
    pub fn new(config: Config, sessions: SessionCell, collaborators: Collaborators) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                config: RwLock::new(config),
                sessions,
                guard: SessionGuard::new(collaborators.probe),
                resolver: collaborators.resolver,
                fetcher: collaborators.fetcher,
                writer: collaborators.writer,
                archive: collaborators.archive,
                active: AtomicBool::new(false),
            }),
            runtime: Handle::current(),
        }
    }

    /// Applies to jobs started afterwards.
    pub fn update_config(&self, config: Config) {
        *self.inner.config.write() = config;
    }

    pub fn config(&self) -> Config {
        self.inner.config.read().clone()
    }

    pub fn sessions(&self) -> &SessionCell {
        &self.inner.sessions
    }

    pub fn is_busy(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Starts a run for `reference`. Rejections happen before any state
    /// change or background work.
    pub fn start(&self, reference: &str) -> Result<JobHandle, RequestError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(RequestError::EmptyReference);
        }
        let session = self
            .inner
            .sessions
            .current()
            .ok_or(RequestError::NotLoggedIn)?;
        let slot = JobSlot::acquire(&self.inner).ok_or(RequestError::Busy)?;

        let id = Uuid::new_v4();
        let (phase_tx, phase_rx) = watch::channel(JobPhase::Idle);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel_token = CancellationToken::new();

        let job = JobRuntime {
            id,
            reference: reference.to_string(),
            session,
            config: self.config(),
            phase_tx,
            events_tx,
            cancel_token: cancel_token.clone(),
            service: self.inner.clone(),
        };
        self.runtime.spawn(run_job(job, slot));

        Ok(JobHandle {
            id,
            reference: reference.to_string(),
            phase_rx,
            reporter: ParkingMutex::new(Some(ProgressReporter::new(events_rx))),
            cancel_token,
        })
    }
}

impl JobRuntime {
    async fn emit(&self, event: ProgressEvent) {
        self.events_tx.send(event).await.ok();
    }

    fn progress(&self, index: usize, total: usize) {
        if self
            .events_tx
            .try_send(ProgressEvent::ItemProgress { index, total })
            .is_err()
        {
            debug!("job {} dropped progress update for item {}", self.id, index + 1);
        }
    }

    fn set_phase(&self, phase: JobPhase) {
        self.phase_tx.send_replace(phase);
    }

    async fn until_cancelled<F: Future>(&self, future: F) -> Result<F::Output, Interrupt> {
        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => Err(Interrupt::Cancelled),
            output = future => Ok(output),
        }
    }
}

async fn run_job(job: JobRuntime, slot: JobSlot) {
    info!("starting download job {} for {}", job.id, job.reference);
    job.emit(ProgressEvent::Started).await;

    let outcome = AssertUnwindSafe(drive(&job))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            Err(Interrupt::failed(
                FailureKind::Download,
                format!("internal error: {}", panic_message(payload.as_ref())),
            ))
        });

    let (phase, event) = match outcome {
        Ok(total) => {
            info!("download job {} finished {total} items", job.id);
            (JobPhase::Completed, ProgressEvent::JobDone)
        }
        Err(Interrupt::Cancelled) => {
            warn!("download job {} canceled", job.id);
            (JobPhase::Cancelled, ProgressEvent::JobCancelled)
        }
        Err(Interrupt::Failed { kind, reason }) => {
            error!("download job {} failed: {reason}", job.id);
            (JobPhase::Failed, ProgressEvent::JobFailed { kind, reason })
        }
    };

    drop(slot);
    job.set_phase(phase);
    job.emit(event).await;
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("job task panicked")
}

async fn drive(job: &JobRuntime) -> Result<usize, Interrupt> {
    job.set_phase(JobPhase::Validating);
    let status = job
        .until_cancelled(job.service.guard.ensure_usable(&job.session))
        .await?;
    if status == SessionStatus::Expired {
        return Err(Interrupt::failed(
            FailureKind::Authentication,
            AuthError::SessionExpired,
        ));
    }

    job.set_phase(JobPhase::Resolving);
    let identifier = identifier::parse(&job.reference)
        .map_err(|error| Interrupt::failed(FailureKind::Parse, error))?;
    let options = ResolveOptions::from_config(&job.config);
    let items = job
        .until_cancelled(
            job.service
                .resolver
                .resolve(&identifier, &job.session, &options),
        )
        .await?
        .map_err(|error| Interrupt::failed(FailureKind::Resolution, error))?;
    let collection = ResolvedCollection::new(items)
        .map_err(|error| Interrupt::failed(FailureKind::Resolution, error))?;

    let mut download = DownloadJob::new(collection);
    let total = download.total();
    download.set_status(JobStatus::Running);
    info!("download job {} resolved {identifier} to {total} items", job.id);

    while let Some((index, item)) = download.next_item() {
        if job.cancel_token.is_cancelled() {
            download.set_status(JobStatus::Cancelled);
            return Err(Interrupt::Cancelled);
        }
        let wait = job.config.download.bulk_wait_sec;
        if index > 0 && wait > 0 {
            job.until_cancelled(time::sleep(Duration::from_secs(wait)))
                .await?;
        }

        job.set_phase(JobPhase::Downloading(index));
        job.progress(index, total);

        match download_item(job, index, &item, &options).await {
            Ok(ItemOutcome::Done(name)) => {
                debug!("job {} finished item {}/{total}: {name}", job.id, index + 1);
                job.emit(ProgressEvent::ItemDone { index, name }).await;
            }
            Ok(ItemOutcome::Skipped(reason)) => {
                job.emit(ProgressEvent::ItemSkipped { index, reason }).await;
            }
            Err(error) => {
                download.set_status(JobStatus::Failed);
                return Err(Interrupt::failed(
                    FailureKind::Download,
                    format!("item {} of {total} ({}): {error}", index + 1, item.id),
                ));
            }
        }
    }

    download.set_status(JobStatus::Completed);
    debug!(
        "download job {} {} after {} items",
        job.id,
        download.status().as_str(),
        download.cursor()
    );
    Ok(total)
}

async fn download_item(
    job: &JobRuntime,
    index: usize,
    item: &PlayableItem,
    options: &ResolveOptions,
) -> Result<ItemOutcome, DownloadError> {
    let fetcher: &dyn MediaFetcher = job.service.fetcher.as_ref();
    let writer: &dyn OutputWriter = job.service.writer.as_ref();
    let session: &Session = &job.session;
    let id: &str = &item.id;

    if let PlayableKind::Unknown(kind) = &item.kind {
        warn!("skipping item {} ({id}) of unsupported type {kind}", index + 1);
        return Ok(ItemOutcome::Skipped(format!("unsupported item type {kind}")));
    }

    if job.config.download.skip_previously_downloaded && archived(job, id).await {
        debug!("skipping item {} ({id}): already downloaded", index + 1);
        return Ok(ItemOutcome::Skipped("already downloaded".to_string()));
    }

    let stream = match &item.kind {
        PlayableKind::Episode => {
            with_retries(job, index, move || fetcher.fetch_episode(session, id)).await?
        }
        _ => {
            let quality = job.config.download.quality;
            with_retries(job, index, move || fetcher.fetch_track(session, id, quality)).await?
        }
    };

    let metadata = stream.metadata.clone();
    let target = writer
        .create_output(&item.library, &item.output_template, &metadata)
        .await?;
    let file = writer.write_stream(&target, stream).await?;

    if options.save_metadata {
        writer.write_metadata_tags(&file, &metadata).await?;
        match fetcher.cover_art(session, &metadata).await {
            Ok(Some(image)) => writer.write_cover_art(&file, &image).await?,
            Ok(None) => {}
            Err(error) => warn!("cover art for {id} unavailable: {error}"),
        }
    }

    if let Some(archive) = job.service.archive.clone() {
        let item_id = item.id.clone();
        let kind = item.kind.clone();
        let name = metadata.name.clone();
        let path = file.path.clone();
        let recorded = tokio::task::spawn_blocking(move || {
            archive.record(&item_id, &kind, &name, Some(&path))
        })
        .await;
        match recorded {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!("failed to record {id} in download archive: {error}"),
            Err(error) => warn!("failed to record {id} in download archive: {error}"),
        }
    }

    Ok(ItemOutcome::Done(metadata.name))
}

async fn archived(job: &JobRuntime, id: &str) -> bool {
    let Some(archive) = job.service.archive.clone() else {
        return false;
    };
    let item_id = id.to_string();
    match tokio::task::spawn_blocking(move || archive.contains(&item_id)).await {
        Ok(Ok(found)) => found,
        Ok(Err(error)) => {
            warn!("download archive lookup failed for {id}: {error}");
            false
        }
        Err(error) => {
            warn!("download archive lookup failed for {id}: {error}");
            false
        }
    }
}

async fn with_retries<'a, F>(
    job: &JobRuntime,
    index: usize,
    mut fetch: F,
) -> Result<MediaStream, DownloadError>
where
    F: FnMut() -> BoxFuture<'a, Result<MediaStream, DownloadError>>,
{
    let attempts = job.config.download.retry_attempts;
    let mut attempt = 0u8;
    loop {
        match fetch().await {
            Ok(stream) => return Ok(stream),
            Err(DownloadError::MissingHelper(helper)) => {
                return Err(DownloadError::MissingHelper(helper))
            }
            Err(error) if attempt < attempts && !job.cancel_token.is_cancelled() => {
                attempt += 1;
                warn!(
                    "fetching item {} failed ({error}), retry {attempt}/{attempts}",
                    index + 1
                );
                time::sleep(RETRY_DELAY).await;
            }
            Err(error) => return Err(error),
        }
    }
}
