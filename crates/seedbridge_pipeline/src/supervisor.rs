//! Recovery barrier and restart loop for long-running tasks.

use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 10,
            delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed(String),
    Panicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    Completed,
    Cancelled,
    GaveUp,
}

/// Logs panics through `tracing` with a backtrace captured at the panic site.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = Backtrace::force_capture();
        error!(panic = %info, backtrace = %backtrace, "unexpected panic");
    }));
}

/// Runs `task` on its own tokio task so that errors and panics are captured
/// and logged as an operation/reason pair instead of propagating.
pub async fn run_guarded<Fut>(operation: &'static str, task: Fut) -> TaskOutcome
where
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    match tokio::spawn(task).await {
        Ok(Ok(())) => TaskOutcome::Completed,
        Ok(Err(err)) => {
            let reason = format!("{err:#}");
            error!(operation = operation, reason = %reason, "task failed");
            TaskOutcome::Failed(reason)
        }
        Err(join_error) if join_error.is_panic() => {
            let reason = panic_reason(join_error.into_panic());
            error!(operation = operation, reason = %reason, "task panicked");
            TaskOutcome::Panicked(reason)
        }
        Err(_) => {
            warn!(operation = operation, "task aborted");
            TaskOutcome::Completed
        }
    }
}

/// Restarts a process-wide task after failures, at most
/// `policy.max_restarts` times and never once `shutdown` has fired.
pub async fn supervise<F, Fut>(
    operation: &'static str,
    policy: RestartPolicy,
    shutdown: CancellationToken,
    mut task: F,
) -> SupervisorExit
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut restarts = 0u32;
    loop {
        if let TaskOutcome::Completed = run_guarded(operation, task()).await {
            info!(operation = operation, "task finished");
            return SupervisorExit::Completed;
        }

        if shutdown.is_cancelled() {
            return SupervisorExit::Cancelled;
        }
        if restarts >= policy.max_restarts {
            error!(operation = operation, restarts, "restart budget exhausted; giving up");
            return SupervisorExit::GaveUp;
        }
        restarts += 1;
        warn!(
            operation = operation,
            restarts,
            delay_ms = policy.delay.as_millis() as u64,
            "restarting task"
        );

        tokio::select! {
            _ = tokio::time::sleep(policy.delay) => {}
            _ = shutdown.cancelled() => return SupervisorExit::Cancelled,
        }
    }
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
