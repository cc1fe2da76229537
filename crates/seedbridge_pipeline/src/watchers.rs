//! Per-transfer polling tasks that detect the end of a transfer's local life.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use seedbridge_transfer::Transfer;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::downloader::{CleanupTrigger, Downloader, WatchedTransfer, WatcherSlot};

/// External signal telling whether the front end has consumed a transfer's
/// downloaded files.
#[async_trait]
pub trait ImportSignal: Send + Sync {
    async fn is_imported(&self, transfer: &Transfer, local_files: &[PathBuf]) -> anyhow::Result<bool>;
}

/// Considers a transfer imported once none of its downloaded files remain
/// where they were written.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFilesImportSignal;

#[async_trait]
impl ImportSignal for LocalFilesImportSignal {
    async fn is_imported(&self, _transfer: &Transfer, local_files: &[PathBuf]) -> anyhow::Result<bool> {
        if local_files.is_empty() {
            return Ok(false);
        }
        for path in local_files {
            if tokio::fs::try_exists(path).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// First tick one full period from now: the files were only just written.
fn poll_timer(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

pub(crate) async fn watch_import(
    downloader: Arc<Downloader>,
    watched: Arc<WatchedTransfer>,
) -> anyhow::Result<()> {
    let _slot = WatcherSlot::new(downloader.clone(), watched.clone());
    let transfer_id = watched.transfer.id.as_str();
    let mut timer = poll_timer(downloader.config.import_interval);

    loop {
        tokio::select! {
            _ = watched.token.cancelled() => {
                debug!(transfer_id = %transfer_id, "import watcher stopped");
                return Ok(());
            }
            _ = timer.tick() => {}
        }

        match downloader
            .import_signal
            .is_imported(&watched.transfer, &watched.local_files)
            .await
        {
            Ok(true) => {
                info!(transfer_id = %transfer_id, "transfer imported");
                downloader.cleanup(&watched, CleanupTrigger::Imported).await;
                return Ok(());
            }
            Ok(false) => debug!(transfer_id = %transfer_id, "transfer not imported yet"),
            Err(err) => warn!(transfer_id = %transfer_id, error = %format!("{err:#}"), "import check failed"),
        }
    }
}

pub(crate) async fn watch_seeding(
    downloader: Arc<Downloader>,
    watched: Arc<WatchedTransfer>,
) -> anyhow::Result<()> {
    let _slot = WatcherSlot::new(downloader.clone(), watched.clone());
    let transfer_id = watched.transfer.id.as_str();
    let mut timer = poll_timer(downloader.config.seed_interval);

    loop {
        tokio::select! {
            _ = watched.token.cancelled() => {
                debug!(transfer_id = %transfer_id, "seed watcher stopped");
                return Ok(());
            }
            _ = timer.tick() => {}
        }

        match downloader.client.get_transfer(transfer_id).await {
            Ok(None) => {
                debug!(transfer_id = %transfer_id, "transfer already removed remotely");
                return Ok(());
            }
            Ok(Some(remote)) if remote.is_seeding() => {
                debug!(transfer_id = %transfer_id, status = %remote.status, "still seeding");
            }
            Ok(Some(remote)) => {
                info!(transfer_id = %transfer_id, status = %remote.status, "seeding stopped");
                downloader.cleanup(&watched, CleanupTrigger::SeedingStopped).await;
                return Ok(());
            }
            Err(err) => warn!(transfer_id = %transfer_id, error = %err, "seeding status check failed"),
        }
    }
}
