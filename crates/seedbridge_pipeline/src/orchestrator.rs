use std::sync::Arc;
use std::time::Duration;

use seedbridge_remote::{fetch_tagged_transfers, RemoteError, SeedboxClient};
use seedbridge_storage::{ClaimOutcome, ClaimStore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{EventSender, TransferEvent};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub tag: String,
    pub interval: Duration,
}

/// What one polling cycle did with the transfers it saw.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub listed: usize,
    pub unavailable: usize,
    pub not_downloadable: usize,
    /// Downloaded and cleaned up already.
    pub already_taken: usize,
    /// Claimed on an earlier tick or by an earlier process.
    pub resumable: usize,
    pub claimed: usize,
    pub claim_errors: usize,
}

/// Discovers finished remote transfers and claims each one exactly once.
pub struct Orchestrator {
    client: Arc<dyn SeedboxClient>,
    claims: Arc<dyn ClaimStore>,
    events: EventSender,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn SeedboxClient>,
        claims: Arc<dyn ClaimStore>,
        events: EventSender,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            client,
            claims,
            events,
            config,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(
            tag = %self.config.tag,
            interval_secs = self.config.interval.as_secs(),
            "orchestrator started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("orchestrator shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            match self.tick().await {
                Ok(report) => debug!(?report, "orchestrator tick finished"),
                Err(err) => warn!(
                    tag = %self.config.tag,
                    error = %err,
                    "listing tagged transfers failed; retrying next tick"
                ),
            }
        }
    }

    /// One polling cycle. Only a listing failure aborts the cycle; a failed
    /// claim is logged and the remaining transfers are still processed.
    pub async fn tick(&self) -> Result<TickReport, RemoteError> {
        let transfers = fetch_tagged_transfers(self.client.as_ref(), &self.config.tag).await?;
        let mut report = TickReport {
            listed: transfers.len(),
            ..TickReport::default()
        };

        for transfer in transfers {
            if !transfer.is_available() {
                debug!(transfer_id = %transfer.id, status = %transfer.status, "skipping transfer: not available");
                report.unavailable += 1;
                continue;
            }
            if !transfer.is_downloadable() {
                debug!(transfer_id = %transfer.id, "skipping transfer: no files yet");
                report.not_downloadable += 1;
                continue;
            }

            match self.claims.claim_transfer(&transfer.id).await {
                Ok(ClaimOutcome::Claimed) => {
                    info!(transfer_id = %transfer.id, name = %transfer.name, "transfer claimed");
                    report.claimed += 1;
                    self.events.emit(TransferEvent::Claimed(transfer)).await;
                }
                Ok(ClaimOutcome::AlreadyClaimed) => {
                    // The downloader decides whether its watchers are gone.
                    report.resumable += 1;
                    self.events.emit(TransferEvent::Resumable(transfer)).await;
                }
                Ok(ClaimOutcome::AlreadyDownloaded) => {
                    report.already_taken += 1;
                }
                Err(err) => {
                    error!(transfer_id = %transfer.id, error = %format!("{err:#}"), "claim attempt failed");
                    report.claim_errors += 1;
                }
            }
        }

        Ok(report)
    }
}
