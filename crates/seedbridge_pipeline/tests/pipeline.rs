use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use seedbridge_pipeline::{
    event_queue, Downloader, DownloaderConfig, ImportSignal, LocalFilesImportSignal, Notifier,
    Orchestrator, OrchestratorConfig, Pipeline, PipelineConfig, RestartPolicy, SupervisorExit,
    TransferEvent,
};
use seedbridge_remote::{fetch_tagged_transfers, InMemorySeedboxClient, SeedboxClient};
use seedbridge_storage::{ClaimOutcome, ClaimState, ClaimStore, SqliteClaimStore, StorageConfig};
use seedbridge_transfer::Transfer;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const TAG: &str = "seedbridge";
const SHORT: Duration = Duration::from_millis(20);
const LONG: Duration = Duration::from_secs(3600);

struct CountingClaims {
    inner: SqliteClaimStore,
    attempts: AtomicUsize,
    broken_id: Option<String>,
}

impl CountingClaims {
    async fn new(broken_id: Option<&str>) -> Arc<Self> {
        let inner = SqliteClaimStore::connect(&StorageConfig {
            sqlite_path: ":memory:".to_string(),
        })
        .await
        .expect("claim store");
        Arc::new(Self {
            inner,
            attempts: AtomicUsize::new(0),
            broken_id: broken_id.map(str::to_string),
        })
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClaimStore for CountingClaims {
    async fn claim_transfer(&self, transfer_id: &str) -> anyhow::Result<ClaimOutcome> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.broken_id.as_deref() == Some(transfer_id) {
            anyhow::bail!("claim store unavailable for {transfer_id}");
        }
        self.inner.claim_transfer(transfer_id).await
    }

    async fn mark_fetched(&self, transfer_id: &str) -> anyhow::Result<bool> {
        self.inner.mark_fetched(transfer_id).await
    }

    async fn mark_downloaded(&self, transfer_id: &str) -> anyhow::Result<bool> {
        self.inner.mark_downloaded(transfer_id).await
    }

    async fn release_claim(&self, transfer_id: &str) -> anyhow::Result<bool> {
        self.inner.release_claim(transfer_id).await
    }

    async fn claim_state(&self, transfer_id: &str) -> anyhow::Result<Option<ClaimState>> {
        self.inner.claim_state(transfer_id).await
    }
}

struct FixedSignal(AtomicBool);

#[async_trait]
impl ImportSignal for FixedSignal {
    async fn is_imported(&self, _transfer: &Transfer, _local_files: &[PathBuf]) -> anyhow::Result<bool> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
struct RecordingNotifier {
    kinds: Mutex<Vec<&'static str>>,
}

impl RecordingNotifier {
    fn kinds(&self) -> Vec<&'static str> {
        self.kinds.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: &TransferEvent) {
        self.kinds.lock().unwrap().push(event.kind());
    }
}

async fn remote_transfer(client: &InMemorySeedboxClient, id: &str, status: &str) -> Transfer {
    let name = format!("{id}-pack");
    let folder = client.add_folder(None, &name).await;
    client.add_file(Some(&folder), "one.bin", vec![1; 16]).await;
    client.add_file(Some(&folder), "two.bin", vec![2; 8]).await;

    let mut transfer = Transfer::new(id, name, status);
    transfer.size = 24;
    transfer.downloaded = 24;
    transfer.file_handle = Some(folder);
    client.insert_transfer(TAG, transfer).await;

    fetch_tagged_transfers(client, TAG)
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.id == id)
        .unwrap()
}

fn downloader_config(dir: &Path, import_interval: Duration, seed_interval: Duration) -> DownloaderConfig {
    DownloaderConfig {
        download_dir: dir.to_path_buf(),
        concurrency: 2,
        import_interval,
        seed_interval,
        release_claim_on_failure: false,
    }
}

async fn drain(rx: &mut mpsc::Receiver<TransferEvent>) -> Vec<&'static str> {
    let mut kinds = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
        kinds.push(event.kind());
    }
    kinds
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn in_progress_transfers_are_never_claimed() {
    let client = Arc::new(InMemorySeedboxClient::new());
    remote_transfer(&client, "busy", "downloading").await;
    client
        .insert_transfer(TAG, Transfer::new("empty", "empty", "completed"))
        .await;
    let claims = CountingClaims::new(None).await;
    let (events, mut rx) = event_queue(&CancellationToken::new());

    let orchestrator = Orchestrator::new(
        client.clone(),
        claims.clone(),
        events,
        OrchestratorConfig {
            tag: TAG.to_string(),
            interval: SHORT,
        },
    );

    for _ in 0..5 {
        let report = orchestrator.tick().await.unwrap();
        assert_eq!(report.listed, 2);
        assert_eq!(report.unavailable, 1);
        assert_eq!(report.not_downloadable, 1);
        assert_eq!(report.claimed, 0);
    }

    assert_eq!(claims.attempts(), 0);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn ready_transfer_is_claimed_once() {
    let client = Arc::new(InMemorySeedboxClient::new());
    remote_transfer(&client, "ready", "seeding").await;
    let claims = CountingClaims::new(None).await;
    let (events, mut rx) = event_queue(&CancellationToken::new());
    let orchestrator = Orchestrator::new(
        client.clone(),
        claims.clone(),
        events,
        OrchestratorConfig {
            tag: TAG.to_string(),
            interval: SHORT,
        },
    );

    let first = orchestrator.tick().await.unwrap();
    let second = orchestrator.tick().await.unwrap();
    assert_eq!(first.claimed, 1);
    assert_eq!(second.claimed, 0);
    assert_eq!(second.resumable, 1);
    assert_eq!(second.already_taken, 0);
    assert_eq!(claims.attempts(), 2);

    match rx.recv().await {
        Some(TransferEvent::Claimed(transfer)) => {
            assert_eq!(transfer.id, "ready");
            assert_eq!(transfer.files.len(), 2);
        }
        other => panic!("unexpected event {other:?}"),
    }
    match rx.recv().await {
        Some(TransferEvent::Resumable(transfer)) => assert_eq!(transfer.id, "ready"),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn one_failed_claim_does_not_abort_the_tick() {
    let client = Arc::new(InMemorySeedboxClient::new());
    remote_transfer(&client, "a-broken", "completed").await;
    remote_transfer(&client, "b-fine", "completed").await;
    let claims = CountingClaims::new(Some("a-broken")).await;
    let (events, _rx) = event_queue(&CancellationToken::new());
    let orchestrator = Orchestrator::new(
        client.clone(),
        claims.clone(),
        events,
        OrchestratorConfig {
            tag: TAG.to_string(),
            interval: SHORT,
        },
    );

    let report = orchestrator.tick().await.unwrap();
    assert_eq!(report.claim_errors, 1);
    assert_eq!(report.claimed, 1);
    assert_eq!(
        claims.claim_state("b-fine").await.unwrap(),
        Some(ClaimState::Claimed)
    );
}

#[tokio::test]
async fn listing_failures_are_retried_next_tick() {
    let client = Arc::new(InMemorySeedboxClient::new());
    client.set_listing_failure(true);
    let claims = CountingClaims::new(None).await;
    let (events, _rx) = event_queue(&CancellationToken::new());
    let orchestrator = Arc::new(Orchestrator::new(
        client.clone(),
        claims,
        events,
        OrchestratorConfig {
            tag: TAG.to_string(),
            interval: SHORT,
        },
    ));

    assert!(orchestrator.tick().await.is_err());

    let shutdown = CancellationToken::new();
    let runner = {
        let orchestrator = orchestrator.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { orchestrator.run(shutdown).await })
    };
    let watched = client.clone();
    wait_for(move || watched.list_calls() >= 4).await;
    shutdown.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn download_writes_files_and_starts_watchers() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(InMemorySeedboxClient::new());
    let transfer = remote_transfer(&client, "dl", "seeding").await;
    let claims = CountingClaims::new(None).await;
    claims.claim_transfer("dl").await.unwrap();
    let (events, mut rx) = event_queue(&CancellationToken::new());
    let downloader = Arc::new(Downloader::new(
        client.clone(),
        claims.clone(),
        Arc::new(FixedSignal(AtomicBool::new(false))),
        events,
        downloader_config(dir.path(), LONG, LONG),
        CancellationToken::new(),
    ));

    downloader.clone().process(transfer).await;

    let one = dir.path().join("dl-pack/one.bin");
    let two = dir.path().join("dl-pack/two.bin");
    assert_eq!(std::fs::read(&one).unwrap(), vec![1; 16]);
    assert_eq!(std::fs::read(&two).unwrap(), vec![2; 8]);
    assert!(!dir.path().join("dl-pack/one.bin.part").exists());

    assert_eq!(drain(&mut rx).await, vec!["transfer.downloaded"]);
    assert!(downloader.is_watching("dl"));
    assert_eq!(downloader.active_watchers(), 1);

    assert!(downloader.stop_watching("dl"));
    let observed = downloader.clone();
    wait_for(move || !observed.is_watching("dl")).await;
    assert_eq!(
        claims.claim_state("dl").await.unwrap(),
        Some(ClaimState::Fetched)
    );
}

#[tokio::test]
async fn failed_file_fails_transfer_and_keeps_claim() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(InMemorySeedboxClient::new());
    let transfer = remote_transfer(&client, "bad", "completed").await;
    client.fail_file(&transfer.files[1].file_id).await;
    let claims = CountingClaims::new(None).await;
    claims.claim_transfer("bad").await.unwrap();
    let (events, mut rx) = event_queue(&CancellationToken::new());
    let downloader = Arc::new(Downloader::new(
        client.clone(),
        claims.clone(),
        Arc::new(FixedSignal(AtomicBool::new(true))),
        events,
        downloader_config(dir.path(), SHORT, SHORT),
        CancellationToken::new(),
    ));

    downloader.clone().process(transfer).await;

    assert_eq!(drain(&mut rx).await, vec!["transfer.download_failed"]);
    assert!(!downloader.is_watching("bad"));
    assert_eq!(client.remove_calls(), 0);
    assert_eq!(
        claims.claim_state("bad").await.unwrap(),
        Some(ClaimState::Claimed)
    );
}

#[tokio::test]
async fn release_policy_frees_failed_claims() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(InMemorySeedboxClient::new());
    let transfer = remote_transfer(&client, "retry", "completed").await;
    client.fail_file(&transfer.files[0].file_id).await;
    let claims = CountingClaims::new(None).await;
    claims.claim_transfer("retry").await.unwrap();
    let (events, _rx) = event_queue(&CancellationToken::new());
    let mut config = downloader_config(dir.path(), LONG, LONG);
    config.release_claim_on_failure = true;
    let downloader = Arc::new(Downloader::new(
        client.clone(),
        claims.clone(),
        Arc::new(LocalFilesImportSignal),
        events,
        config,
        CancellationToken::new(),
    ));

    downloader.process(transfer).await;

    assert_eq!(claims.claim_state("retry").await.unwrap(), None);
}

#[tokio::test]
async fn cancelled_download_reports_failure_and_discards_partials() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(InMemorySeedboxClient::new());
    let transfer = remote_transfer(&client, "slow", "completed").await;
    client.stall_file(&transfer.files[0].file_id).await;
    let claims = CountingClaims::new(None).await;
    claims.claim_transfer("slow").await.unwrap();
    let (events, mut rx) = event_queue(&CancellationToken::new());
    let mut config = downloader_config(dir.path(), LONG, LONG);
    config.release_claim_on_failure = true;
    let downloader = Arc::new(Downloader::new(
        client.clone(),
        claims.clone(),
        Arc::new(LocalFilesImportSignal),
        events,
        config,
        CancellationToken::new(),
    ));

    let partial = PathBuf::from(format!(
        "{}.part",
        dir.path().join(&transfer.files[0].path).display()
    ));
    let running = tokio::spawn(downloader.clone().process(transfer));
    let stalled = partial.clone();
    wait_for(move || std::fs::metadata(&stalled).map(|m| m.len() > 0).unwrap_or(false)).await;
    assert!(downloader.is_watching("slow"));

    assert!(downloader.stop_watching("slow"));
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("cancelled download returns")
        .unwrap();

    assert_eq!(drain(&mut rx).await, vec!["transfer.download_failed"]);
    assert!(!partial.exists());
    assert!(!downloader.is_watching("slow"));
    assert_eq!(claims.claim_state("slow").await.unwrap(), None);
    assert_eq!(client.remove_calls(), 0);
}

#[tokio::test]
async fn failed_rename_leaves_no_partial_file() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(InMemorySeedboxClient::new());
    let transfer = remote_transfer(&client, "blocked", "completed").await;
    let target = dir.path().join(&transfer.files[0].path);
    std::fs::create_dir_all(target.join("occupied")).unwrap();
    let claims = CountingClaims::new(None).await;
    claims.claim_transfer("blocked").await.unwrap();
    let (events, mut rx) = event_queue(&CancellationToken::new());
    let downloader = Arc::new(Downloader::new(
        client.clone(),
        claims.clone(),
        Arc::new(LocalFilesImportSignal),
        events,
        downloader_config(dir.path(), LONG, LONG),
        CancellationToken::new(),
    ));

    downloader.clone().process(transfer).await;

    assert_eq!(drain(&mut rx).await, vec!["transfer.download_failed"]);
    assert!(!PathBuf::from(format!("{}.part", target.display())).exists());
    assert!(target.is_dir());
    assert!(!downloader.is_watching("blocked"));
}

#[tokio::test]
async fn restart_resumes_watchers_without_downloading() {
    let state = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let storage = StorageConfig {
        sqlite_path: state.path().join("claims.db").display().to_string(),
    };
    let client = Arc::new(InMemorySeedboxClient::new());
    let remote = remote_transfer(&client, "kept", "seeding").await;
    let orchestrator_config = OrchestratorConfig {
        tag: TAG.to_string(),
        interval: SHORT,
    };

    // First process: claim and download, then shut down before cleanup.
    {
        let claims = Arc::new(SqliteClaimStore::connect(&storage).await.unwrap());
        let shutdown = CancellationToken::new();
        let (events, mut rx) = event_queue(&shutdown);
        let orchestrator = Orchestrator::new(
            client.clone(),
            claims.clone(),
            events.clone(),
            orchestrator_config.clone(),
        );
        let downloader = Arc::new(Downloader::new(
            client.clone(),
            claims.clone(),
            Arc::new(FixedSignal(AtomicBool::new(false))),
            events,
            downloader_config(downloads.path(), LONG, LONG),
            shutdown.clone(),
        ));

        assert_eq!(orchestrator.tick().await.unwrap().claimed, 1);
        let Some(TransferEvent::Claimed(transfer)) = rx.recv().await else {
            panic!("expected a claimed transfer");
        };
        downloader.clone().process(transfer).await;
        assert!(downloader.is_watching("kept"));

        shutdown.cancel();
        let observed = downloader.clone();
        wait_for(move || !observed.is_watching("kept")).await;
        assert_eq!(
            claims.claim_state("kept").await.unwrap(),
            Some(ClaimState::Fetched)
        );
    }
    assert!(downloads.path().join("kept-pack/one.bin").exists());
    // A second download would now fail.
    for file in &remote.files {
        client.fail_file(&file.file_id).await;
    }

    let claims = Arc::new(SqliteClaimStore::connect(&storage).await.unwrap());
    let shutdown = CancellationToken::new();
    let (events, mut rx) = event_queue(&shutdown);
    let orchestrator = Orchestrator::new(
        client.clone(),
        claims.clone(),
        events.clone(),
        orchestrator_config,
    );
    let downloader = Arc::new(Downloader::new(
        client.clone(),
        claims.clone(),
        Arc::new(FixedSignal(AtomicBool::new(true))),
        events,
        downloader_config(downloads.path(), SHORT, LONG),
        shutdown.clone(),
    ));

    let report = orchestrator.tick().await.unwrap();
    assert_eq!(report.claimed, 0);
    assert_eq!(report.resumable, 1);
    let Some(TransferEvent::Resumable(transfer)) = rx.recv().await else {
        panic!("expected a resumable transfer");
    };
    assert!(downloader.clone().resume(transfer.clone()).await);
    assert!(!downloader.clone().resume(transfer).await);

    let observed = downloader.clone();
    wait_for(move || !observed.is_watching("kept")).await;

    assert_eq!(drain(&mut rx).await, vec!["transfer.imported", "transfer.removed"]);
    assert_eq!(client.remove_calls(), 1);
    assert!(!client.contains_transfer("kept").await);
    assert_eq!(
        claims.claim_state("kept").await.unwrap(),
        Some(ClaimState::Downloaded)
    );
    shutdown.cancel();
}

#[tokio::test]
async fn unfetched_claims_are_not_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(InMemorySeedboxClient::new());
    let transfer = remote_transfer(&client, "half", "completed").await;
    let claims = CountingClaims::new(None).await;
    claims.claim_transfer("half").await.unwrap();
    let (events, mut rx) = event_queue(&CancellationToken::new());
    let downloader = Arc::new(Downloader::new(
        client.clone(),
        claims.clone(),
        Arc::new(FixedSignal(AtomicBool::new(true))),
        events,
        downloader_config(dir.path(), SHORT, SHORT),
        CancellationToken::new(),
    ));

    assert!(!downloader.clone().resume(transfer).await);
    assert!(!downloader.is_watching("half"));
    assert!(drain(&mut rx).await.is_empty());
    assert_eq!(client.remove_calls(), 0);
}

#[tokio::test]
async fn claimed_transfer_without_files_is_not_downloaded() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(InMemorySeedboxClient::new());
    let claims = CountingClaims::new(None).await;
    let (events, mut rx) = event_queue(&CancellationToken::new());
    let downloader = Arc::new(Downloader::new(
        client.clone(),
        claims,
        Arc::new(LocalFilesImportSignal),
        events,
        downloader_config(dir.path(), SHORT, SHORT),
        CancellationToken::new(),
    ));

    downloader
        .clone()
        .process(Transfer::new("hollow", "hollow", "completed"))
        .await;

    assert!(drain(&mut rx).await.is_empty());
    assert!(!downloader.is_watching("hollow"));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn racing_watchers_clean_up_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(InMemorySeedboxClient::new());
    // Not seeding and already imported: both watchers fire on their first tick.
    let transfer = remote_transfer(&client, "race", "completed").await;
    let claims = CountingClaims::new(None).await;
    claims.claim_transfer("race").await.unwrap();
    let (events, mut rx) = event_queue(&CancellationToken::new());
    let downloader = Arc::new(Downloader::new(
        client.clone(),
        claims.clone(),
        Arc::new(FixedSignal(AtomicBool::new(true))),
        events,
        downloader_config(dir.path(), SHORT, SHORT),
        CancellationToken::new(),
    ));

    downloader.clone().process(transfer).await;
    let observed = downloader.clone();
    wait_for(move || !observed.is_watching("race")).await;

    let kinds = drain(&mut rx).await;
    let triggers = kinds
        .iter()
        .filter(|k| **k == "transfer.imported" || **k == "transfer.seeding_stopped")
        .count();
    assert_eq!(triggers, 1, "{kinds:?}");
    assert_eq!(kinds.iter().filter(|k| **k == "transfer.removed").count(), 1);
    assert_eq!(client.remove_calls(), 1);
    assert!(!client.contains_transfer("race").await);
    assert_eq!(
        claims.claim_state("race").await.unwrap(),
        Some(ClaimState::Downloaded)
    );
}

#[tokio::test]
async fn seed_watcher_cleans_up_when_seeding_stops() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(InMemorySeedboxClient::new());
    let transfer = remote_transfer(&client, "seed", "seeding").await;
    let claims = CountingClaims::new(None).await;
    claims.claim_transfer("seed").await.unwrap();
    let (events, mut rx) = event_queue(&CancellationToken::new());
    let downloader = Arc::new(Downloader::new(
        client.clone(),
        claims.clone(),
        Arc::new(FixedSignal(AtomicBool::new(false))),
        events,
        downloader_config(dir.path(), LONG, SHORT),
        CancellationToken::new(),
    ));

    downloader.clone().process(transfer).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(downloader.is_watching("seed"));
    assert_eq!(client.remove_calls(), 0);

    client.set_status("seed", "completed").await;
    let observed = downloader.clone();
    wait_for(move || !observed.is_watching("seed")).await;

    let kinds = drain(&mut rx).await;
    assert_eq!(
        kinds,
        vec!["transfer.downloaded", "transfer.seeding_stopped", "transfer.removed"]
    );
    assert_eq!(
        claims.claim_state("seed").await.unwrap(),
        Some(ClaimState::Downloaded)
    );
}

#[tokio::test]
async fn import_watcher_cleans_up_after_files_move() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(InMemorySeedboxClient::new());
    let transfer = remote_transfer(&client, "imp", "seeding").await;
    let claims = CountingClaims::new(None).await;
    claims.claim_transfer("imp").await.unwrap();
    let (events, mut rx) = event_queue(&CancellationToken::new());
    let downloader = Arc::new(Downloader::new(
        client.clone(),
        claims.clone(),
        Arc::new(LocalFilesImportSignal),
        events,
        downloader_config(dir.path(), SHORT, LONG),
        CancellationToken::new(),
    ));

    downloader.clone().process(transfer).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(downloader.is_watching("imp"));

    std::fs::remove_dir_all(dir.path().join("imp-pack")).unwrap();
    let observed = downloader.clone();
    wait_for(move || !observed.is_watching("imp")).await;

    let kinds = drain(&mut rx).await;
    assert_eq!(
        kinds,
        vec!["transfer.downloaded", "transfer.imported", "transfer.removed"]
    );
    assert!(!client.contains_transfer("imp").await);
}

#[tokio::test]
async fn seed_watcher_exits_quietly_when_transfer_vanishes() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(InMemorySeedboxClient::new());
    let transfer = remote_transfer(&client, "gone", "seeding").await;
    let claims = CountingClaims::new(None).await;
    let (events, mut rx) = event_queue(&CancellationToken::new());
    let downloader = Arc::new(Downloader::new(
        client.clone(),
        claims.clone(),
        Arc::new(FixedSignal(AtomicBool::new(false))),
        events,
        downloader_config(dir.path(), LONG, SHORT),
        CancellationToken::new(),
    ));

    downloader.clone().process(transfer).await;
    client.remove_transfer("gone").await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    // The import watcher is still waiting for its own condition.
    assert!(downloader.is_watching("gone"));
    assert_eq!(drain(&mut rx).await, vec!["transfer.downloaded"]);
    assert_eq!(claims.claim_state("gone").await.unwrap(), None);
}

#[tokio::test]
async fn pipeline_runs_end_to_end_and_stops_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(InMemorySeedboxClient::new());
    remote_transfer(&client, "e2e", "seeding").await;
    remote_transfer(&client, "later", "downloading").await;
    let claims = CountingClaims::new(None).await;
    let notifier = Arc::new(RecordingNotifier::default());
    let shutdown = CancellationToken::new();

    let pipeline = Pipeline::new(
        PipelineConfig {
            tag: TAG.to_string(),
            download_dir: dir.path().to_path_buf(),
            concurrency: 4,
            poll_interval: SHORT,
            import_interval: SHORT,
            seed_interval: LONG,
            release_claim_on_failure: false,
            restart: RestartPolicy {
                max_restarts: 3,
                delay: SHORT,
            },
        },
        client.clone(),
        claims.clone(),
        Arc::new(LocalFilesImportSignal),
        notifier.clone(),
        shutdown.clone(),
    );
    let handles = pipeline.spawn();
    let downloader = pipeline.downloader();

    let downloaded = dir.path().join("e2e-pack/two.bin");
    let written = downloaded.clone();
    wait_for(move || written.exists()).await;
    let observed = downloader.clone();
    wait_for(move || observed.is_watching("e2e")).await;

    std::fs::remove_dir_all(dir.path().join("e2e-pack")).unwrap();
    let observed = downloader.clone();
    wait_for(move || !observed.is_watching("e2e")).await;
    let recorder = notifier.clone();
    wait_for(move || recorder.kinds().contains(&"transfer.removed")).await;

    assert_eq!(
        notifier.kinds(),
        vec!["transfer.downloaded", "transfer.imported", "transfer.removed"]
    );
    assert_eq!(claims.claim_state("later").await.unwrap(), None);

    shutdown.cancel();
    for handle in handles {
        let exit = handle.await.unwrap();
        assert!(matches!(exit, SupervisorExit::Completed | SupervisorExit::Cancelled));
    }
}
