use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::{self, TryStreamExt};
use seedbridge_remote::{RemoteError, SeedboxClient};
use seedbridge_storage::{ClaimState, ClaimStore};
use seedbridge_transfer::{Transfer, TransferFile, TransferId};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{EventSender, TransferEvent};
use crate::supervisor::run_guarded;
use crate::watchers::{watch_import, watch_seeding, ImportSignal};

#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    pub download_dir: PathBuf,
    pub concurrency: usize,
    pub import_interval: Duration,
    pub seed_interval: Duration,
    /// Drop the claim after a failed download so a later tick retries it.
    pub release_claim_on_failure: bool,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("unsafe local path {0:?}")]
    Directory(String),
    #[error("local i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("download cancelled")]
    Cancelled,
}

/// Which watcher triggered cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupTrigger {
    Imported,
    SeedingStopped,
}

/// Shared state of the two watchers of one downloaded transfer.
pub(crate) struct WatchedTransfer {
    pub(crate) transfer: Transfer,
    pub(crate) local_files: Vec<PathBuf>,
    pub(crate) token: CancellationToken,
    cleaned: AtomicBool,
    live_watchers: AtomicUsize,
}

/// Held by a running watcher; the last one to finish unregisters the
/// transfer, including when it unwinds from a panic.
pub(crate) struct WatcherSlot {
    downloader: Arc<Downloader>,
    watched: Arc<WatchedTransfer>,
}

impl WatcherSlot {
    pub(crate) fn new(downloader: Arc<Downloader>, watched: Arc<WatchedTransfer>) -> Self {
        Self {
            downloader,
            watched,
        }
    }
}

impl Drop for WatcherSlot {
    fn drop(&mut self) {
        if self.watched.live_watchers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.downloader.registry().remove(&self.watched.transfer.id);
            debug!(transfer_id = %self.watched.transfer.id, "watchers finished");
        }
    }
}

/// Registry entry for a transfer being downloaded. Unregisters on drop
/// unless ownership passed to the watchers.
struct Registration {
    downloader: Arc<Downloader>,
    transfer_id: TransferId,
    token: CancellationToken,
    handed_off: bool,
}

impl Registration {
    fn into_token(mut self) -> CancellationToken {
        self.handed_off = true;
        self.token.clone()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.handed_off {
            self.downloader.registry().remove(&self.transfer_id);
        }
    }
}

/// Retrieves claimed transfers and owns their per-transfer watchers.
pub struct Downloader {
    pub(crate) client: Arc<dyn SeedboxClient>,
    claims: Arc<dyn ClaimStore>,
    pub(crate) import_signal: Arc<dyn ImportSignal>,
    events: EventSender,
    pub(crate) config: DownloaderConfig,
    shutdown: CancellationToken,
    watchers: Mutex<HashMap<TransferId, CancellationToken>>,
}

impl Downloader {
    pub fn new(
        client: Arc<dyn SeedboxClient>,
        claims: Arc<dyn ClaimStore>,
        import_signal: Arc<dyn ImportSignal>,
        events: EventSender,
        config: DownloaderConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            claims,
            import_signal,
            events,
            config,
            shutdown,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<TransferId, CancellationToken>> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(self: &Arc<Self>, transfer_id: &str) -> Option<Registration> {
        let mut registry = self.registry();
        if registry.contains_key(transfer_id) {
            return None;
        }
        let token = self.shutdown.child_token();
        registry.insert(transfer_id.to_string(), token.clone());
        Some(Registration {
            downloader: self.clone(),
            transfer_id: transfer_id.to_string(),
            token,
            handed_off: false,
        })
    }

    /// True while the transfer is downloading or watched.
    pub fn is_watching(&self, transfer_id: &str) -> bool {
        self.registry().contains_key(transfer_id)
    }

    pub fn active_watchers(&self) -> usize {
        self.registry().len()
    }

    /// Cancels the download or the watchers of one transfer.
    pub fn stop_watching(&self, transfer_id: &str) -> bool {
        match self.registry().get(transfer_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Processes a claimed transfer on its own task behind a recovery barrier.
    pub fn spawn(self: &Arc<Self>, transfer: Transfer) {
        let downloader = self.clone();
        tokio::spawn(async move {
            run_guarded("download_transfer", async move {
                downloader.process(transfer).await;
                Ok::<(), anyhow::Error>(())
            })
            .await;
        });
    }

    /// Restarts the watchers of an already claimed transfer on its own task,
    /// unless they are running.
    pub fn spawn_resume(self: &Arc<Self>, transfer: Transfer) {
        if self.is_watching(&transfer.id) {
            return;
        }
        let downloader = self.clone();
        tokio::spawn(async move {
            run_guarded("resume_transfer", async move {
                downloader.resume(transfer).await;
                Ok::<(), anyhow::Error>(())
            })
            .await;
        });
    }

    /// Downloads every file, records the claim as fetched, then starts the
    /// watchers. Failures and cancellation are reported as a download-failed
    /// event; the claim stays in place unless the release policy is enabled.
    pub async fn process(self: Arc<Self>, transfer: Transfer) {
        if !transfer.is_downloadable() {
            warn!(transfer_id = %transfer.id, "claimed transfer has no files; nothing to download");
            return;
        }
        let Some(registration) = self.register(&transfer.id) else {
            debug!(transfer_id = %transfer.id, "transfer already in progress");
            return;
        };

        info!(
            transfer_id = %transfer.id,
            name = %transfer.name,
            files = transfer.files.len(),
            "downloading transfer"
        );

        match self.download_all(&transfer, &registration.token).await {
            Ok(local_files) => {
                if let Err(err) = self.claims.mark_fetched(&transfer.id).await {
                    error!(transfer_id = %transfer.id, error = %format!("{err:#}"), "failed to mark claim fetched");
                }
                self.events
                    .emit(TransferEvent::Downloaded {
                        transfer_id: transfer.id.clone(),
                        name: transfer.name.clone(),
                        files: local_files.len(),
                        bytes: transfer.total_file_size(),
                    })
                    .await;
                self.start_watchers(transfer, local_files, registration.into_token());
            }
            Err(err) => {
                if matches!(err, DownloadError::Cancelled) {
                    warn!(transfer_id = %transfer.id, name = %transfer.name, "transfer download cancelled");
                } else {
                    error!(transfer_id = %transfer.id, name = %transfer.name, error = %err, "transfer download failed");
                }
                self.events
                    .emit(TransferEvent::DownloadFailed {
                        transfer_id: transfer.id.clone(),
                        name: transfer.name.clone(),
                        reason: err.to_string(),
                    })
                    .await;
                if self.config.release_claim_on_failure {
                    match self.claims.release_claim(&transfer.id).await {
                        Ok(released) => debug!(transfer_id = %transfer.id, released, "claim released for retry"),
                        Err(err) => error!(transfer_id = %transfer.id, error = %format!("{err:#}"), "failed to release claim"),
                    }
                }
            }
        }
    }

    /// Starts watchers for a transfer whose files were fetched by an earlier
    /// run, without downloading again. Returns `true` if watchers started.
    pub async fn resume(self: Arc<Self>, transfer: Transfer) -> bool {
        // Checked on both sides of registering: before, so an in-flight
        // download is never shadowed; after, in case cleanup just finished.
        if !self.is_fetched(&transfer.id).await {
            return false;
        }
        let Some(registration) = self.register(&transfer.id) else {
            return false;
        };
        if !self.is_fetched(&transfer.id).await {
            return false;
        }

        let local_files = match transfer
            .files
            .iter()
            .map(|file| local_path(&self.config.download_dir, &file.path))
            .collect::<Result<Vec<_>, DownloadError>>()
        {
            Ok(local_files) => local_files,
            Err(err) => {
                error!(transfer_id = %transfer.id, error = %err, "cannot resume transfer");
                return false;
            }
        };

        info!(transfer_id = %transfer.id, name = %transfer.name, "resuming watchers");
        self.start_watchers(transfer, local_files, registration.into_token());
        true
    }

    async fn is_fetched(&self, transfer_id: &str) -> bool {
        match self.claims.claim_state(transfer_id).await {
            Ok(Some(ClaimState::Fetched)) => true,
            Ok(_) => false,
            Err(err) => {
                warn!(transfer_id = %transfer_id, error = %format!("{err:#}"), "claim state lookup failed");
                false
            }
        }
    }

    /// Retrieves all files with at most `concurrency` in flight; the first
    /// failure fails the whole transfer. No partial file outlives a failure.
    pub async fn download_all(
        &self,
        transfer: &Transfer,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>, DownloadError> {
        let plan = transfer
            .files
            .iter()
            .map(|file| Ok((file, local_path(&self.config.download_dir, &file.path)?)))
            .collect::<Result<Vec<_>, DownloadError>>()?;

        let limit = self.config.concurrency.max(1);
        let downloads = stream::iter(plan.iter().map(Ok::<_, DownloadError>))
            .try_for_each_concurrent(limit, |(file, destination)| self.fetch_file(file, destination));

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
            result = downloads => result,
        };

        if let Err(err) = outcome {
            for (_, destination) in &plan {
                discard_partial(&partial_path(destination)).await;
            }
            return Err(err);
        }
        Ok(plan.into_iter().map(|(_, destination)| destination).collect())
    }

    async fn fetch_file(&self, file: &TransferFile, destination: &Path) -> Result<(), DownloadError> {
        let partial = partial_path(destination);
        let written = match self.client.download_file(file, &partial).await {
            Ok(written) => written,
            Err(err) => {
                discard_partial(&partial).await;
                return Err(err.into());
            }
        };
        if written != file.size {
            warn!(file = %file.path, expected = file.size, written, "downloaded size differs from remote size");
        }
        if let Err(err) = tokio::fs::rename(&partial, destination).await {
            discard_partial(&partial).await;
            return Err(err.into());
        }
        debug!(file = %file.path, bytes = written, "file downloaded");
        Ok(())
    }

    fn start_watchers(self: &Arc<Self>, transfer: Transfer, local_files: Vec<PathBuf>, token: CancellationToken) {
        let watched = Arc::new(WatchedTransfer {
            transfer,
            local_files,
            token,
            cleaned: AtomicBool::new(false),
            live_watchers: AtomicUsize::new(2),
        });

        let import = watch_import(self.clone(), watched.clone());
        tokio::spawn(async move {
            run_guarded("import_watcher", import).await;
        });
        let seed = watch_seeding(self.clone(), watched);
        tokio::spawn(async move {
            run_guarded("seed_watcher", seed).await;
        });
    }

    /// Marks the claim downloaded and removes the transfer remotely. Runs at
    /// most once per transfer; later callers get `false` and do nothing.
    pub(crate) async fn cleanup(&self, watched: &WatchedTransfer, trigger: CleanupTrigger) -> bool {
        if watched.cleaned.swap(true, Ordering::SeqCst) {
            debug!(transfer_id = %watched.transfer.id, ?trigger, "cleanup already done");
            return false;
        }
        watched.token.cancel();

        let transfer = &watched.transfer;
        let event = match trigger {
            CleanupTrigger::Imported => TransferEvent::Imported {
                transfer_id: transfer.id.clone(),
                name: transfer.name.clone(),
            },
            CleanupTrigger::SeedingStopped => TransferEvent::SeedingStopped {
                transfer_id: transfer.id.clone(),
                name: transfer.name.clone(),
            },
        };
        self.events.emit(event).await;

        if let Err(err) = self.claims.mark_downloaded(&transfer.id).await {
            error!(transfer_id = %transfer.id, error = %format!("{err:#}"), "failed to mark claim downloaded");
        }

        match self.client.remove_transfer(&transfer.id).await {
            Ok(true) => {
                info!(transfer_id = %transfer.id, ?trigger, "remote transfer removed");
                self.events
                    .emit(TransferEvent::Removed {
                        transfer_id: transfer.id.clone(),
                        name: transfer.name.clone(),
                    })
                    .await;
            }
            Ok(false) => debug!(transfer_id = %transfer.id, "remote transfer already gone"),
            Err(err) => error!(transfer_id = %transfer.id, error = %err, "remote removal failed"),
        }
        true
    }
}

/// Joins a remote relative path onto the download root, refusing anything
/// that could land outside it.
pub fn local_path(root: &Path, relative: &str) -> Result<PathBuf, DownloadError> {
    let mut path = root.to_path_buf();
    let mut components = 0;
    for part in relative.split('/') {
        let candidate = Path::new(part);
        let safe = !part.is_empty()
            && !part.contains('\\')
            && matches!(
                candidate.components().collect::<Vec<_>>().as_slice(),
                [Component::Normal(_)]
            );
        if !safe {
            return Err(DownloadError::Directory(relative.to_string()));
        }
        path.push(part);
        components += 1;
    }
    if components == 0 {
        return Err(DownloadError::Directory(relative.to_string()));
    }
    Ok(path)
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut partial = destination.as_os_str().to_owned();
    partial.push(".part");
    PathBuf::from(partial)
}

async fn discard_partial(partial: &Path) {
    match tokio::fs::remove_file(partial).await {
        Ok(()) => debug!(path = %partial.display(), "partial file removed"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %partial.display(), error = %err, "failed to remove partial file"),
    }
}
