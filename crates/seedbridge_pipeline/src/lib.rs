//! Discovery, retrieval and cleanup of remote transfers.
//!
//! The orchestrator claims finished transfers and hands them over the event
//! queue; the event consumer starts the downloader for each one and forwards
//! terminal events to the notifier. Transfers claimed by an earlier process
//! whose files are already local get their watchers back without a second
//! download.

mod downloader;
mod events;
mod orchestrator;
mod supervisor;
mod watchers;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use seedbridge_remote::SeedboxClient;
use seedbridge_storage::ClaimStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use downloader::{local_path, CleanupTrigger, DownloadError, Downloader, DownloaderConfig};
pub use events::{
    event_queue, EventConsumer, EventSender, Notifier, TracingNotifier, TransferEvent,
    EVENT_QUEUE_CAPACITY,
};
pub use orchestrator::{Orchestrator, OrchestratorConfig, TickReport};
pub use supervisor::{
    install_panic_hook, run_guarded, supervise, RestartPolicy, SupervisorExit, TaskOutcome,
};
pub use watchers::{ImportSignal, LocalFilesImportSignal};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub tag: String,
    pub download_dir: PathBuf,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub import_interval: Duration,
    pub seed_interval: Duration,
    pub release_claim_on_failure: bool,
    pub restart: RestartPolicy,
}

/// The two process-wide tasks plus the downloader they share.
pub struct Pipeline {
    orchestrator: Arc<Orchestrator>,
    consumer: Arc<EventConsumer>,
    downloader: Arc<Downloader>,
    restart: RestartPolicy,
    shutdown: CancellationToken,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        client: Arc<dyn SeedboxClient>,
        claims: Arc<dyn ClaimStore>,
        import_signal: Arc<dyn ImportSignal>,
        notifier: Arc<dyn Notifier>,
        shutdown: CancellationToken,
    ) -> Self {
        let (events, receiver) = event_queue(&shutdown);
        let downloader = Arc::new(Downloader::new(
            client.clone(),
            claims.clone(),
            import_signal,
            events.clone(),
            DownloaderConfig {
                download_dir: config.download_dir,
                concurrency: config.concurrency,
                import_interval: config.import_interval,
                seed_interval: config.seed_interval,
                release_claim_on_failure: config.release_claim_on_failure,
            },
            shutdown.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            client,
            claims,
            events,
            OrchestratorConfig {
                tag: config.tag,
                interval: config.poll_interval,
            },
        ));
        let consumer = Arc::new(EventConsumer::new(receiver, downloader.clone(), notifier));

        Self {
            orchestrator,
            consumer,
            downloader,
            restart: config.restart,
            shutdown,
        }
    }

    pub fn downloader(&self) -> Arc<Downloader> {
        self.downloader.clone()
    }

    /// Starts the orchestrator and the event consumer under supervision.
    pub fn spawn(&self) -> Vec<JoinHandle<SupervisorExit>> {
        let orchestrator = self.orchestrator.clone();
        let orchestrator_shutdown = self.shutdown.clone();
        let orchestrator_task = tokio::spawn(supervise(
            "orchestrator",
            self.restart,
            self.shutdown.clone(),
            move || {
                let orchestrator = orchestrator.clone();
                let shutdown = orchestrator_shutdown.clone();
                async move { orchestrator.run(shutdown).await }
            },
        ));

        let consumer = self.consumer.clone();
        let consumer_shutdown = self.shutdown.clone();
        let consumer_task = tokio::spawn(supervise(
            "event_consumer",
            self.restart,
            self.shutdown.clone(),
            move || {
                let consumer = consumer.clone();
                let shutdown = consumer_shutdown.clone();
                async move { consumer.run(shutdown).await }
            },
        ));

        vec![orchestrator_task, consumer_task]
    }
}
