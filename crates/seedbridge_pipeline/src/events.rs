use std::sync::Arc;

use seedbridge_transfer::{Transfer, TransferId};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::downloader::Downloader;

pub const EVENT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Handed from the orchestrator to the downloader.
    Claimed(Transfer),
    /// Claimed earlier; its watchers may need restarting.
    Resumable(Transfer),
    Downloaded {
        transfer_id: TransferId,
        name: String,
        files: usize,
        bytes: u64,
    },
    DownloadFailed {
        transfer_id: TransferId,
        name: String,
        reason: String,
    },
    Imported {
        transfer_id: TransferId,
        name: String,
    },
    SeedingStopped {
        transfer_id: TransferId,
        name: String,
    },
    Removed {
        transfer_id: TransferId,
        name: String,
    },
}

impl TransferEvent {
    pub fn transfer_id(&self) -> &str {
        match self {
            Self::Claimed(transfer) | Self::Resumable(transfer) => &transfer.id,
            Self::Downloaded { transfer_id, .. }
            | Self::DownloadFailed { transfer_id, .. }
            | Self::Imported { transfer_id, .. }
            | Self::SeedingStopped { transfer_id, .. }
            | Self::Removed { transfer_id, .. } => transfer_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Claimed(_) => "transfer.claimed",
            Self::Resumable(_) => "transfer.resumable",
            Self::Downloaded { .. } => "transfer.downloaded",
            Self::DownloadFailed { .. } => "transfer.download_failed",
            Self::Imported { .. } => "transfer.imported",
            Self::SeedingStopped { .. } => "transfer.seeding_stopped",
            Self::Removed { .. } => "transfer.removed",
        }
    }

    /// Everything except the internal hand-offs is reported to the sink.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Claimed(_) | Self::Resumable(_))
    }
}

/// Producer side of the event queue. Sends give up once shutdown starts, so
/// a full queue whose consumer has stopped never blocks a producer.
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<TransferEvent>,
    shutdown: CancellationToken,
}

impl EventSender {
    /// Returns `false` when the event was dropped.
    pub async fn emit(&self, event: TransferEvent) -> bool {
        let kind = event.kind();
        tokio::select! {
            biased;
            sent = self.sender.send(event) => match sent {
                Ok(()) => true,
                Err(_) => {
                    warn!(event = kind, "event queue closed; event dropped");
                    false
                }
            },
            _ = self.shutdown.cancelled() => {
                warn!(event = kind, "shutting down; event dropped");
                false
            }
        }
    }
}

pub fn event_queue(shutdown: &CancellationToken) -> (EventSender, mpsc::Receiver<TransferEvent>) {
    let (sender, receiver) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let events = EventSender {
        sender,
        shutdown: shutdown.clone(),
    };
    (events, receiver)
}

/// Fire-and-forget consumer of terminal transfer events.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &TransferEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: &TransferEvent) {
        match event {
            TransferEvent::DownloadFailed {
                transfer_id,
                name,
                reason,
            } => warn!(transfer_id = %transfer_id, name = %name, reason = %reason, event = event.kind(), "transfer event"),
            _ => info!(transfer_id = %event.transfer_id(), event = event.kind(), "transfer event"),
        }
    }
}

/// Drains the event queue: hand-offs go to the downloader, terminal events
/// go to the notifier.
pub struct EventConsumer {
    receiver: Arc<Mutex<mpsc::Receiver<TransferEvent>>>,
    downloader: Arc<Downloader>,
    notifier: Arc<dyn Notifier>,
}

impl EventConsumer {
    pub fn new(
        receiver: mpsc::Receiver<TransferEvent>,
        downloader: Arc<Downloader>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            receiver: Arc::new(Mutex::new(receiver)),
            downloader,
            notifier,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut receiver = self.receiver.lock().await;
        info!("event consumer started");
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("event consumer shutting down");
                    return Ok(());
                }
                event = receiver.recv() => event,
            };
            match event {
                Some(event) => self.dispatch(event),
                None => {
                    debug!("event queue closed");
                    return Ok(());
                }
            }
        }
    }

    fn dispatch(&self, event: TransferEvent) {
        if event.is_terminal() {
            self.notifier.notify(&event);
            return;
        }
        match event {
            TransferEvent::Claimed(transfer) => self.downloader.spawn(transfer),
            TransferEvent::Resumable(transfer) => self.downloader.spawn_resume(transfer),
            _ => {}
        }
    }
}
