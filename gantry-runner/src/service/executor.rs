//! Step executor
//!
//! Runs the commands of a step one after another through a shell, streaming
//! stdout and stderr into the step's log buffer. A step fails on the first
//! command that exits non-zero.

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use gantry_core::domain::execution::{Step, StepStatus};
use gantry_core::domain::log::LogSource;

use crate::podman::ContainerManager;
use crate::service::log_buffer::LogBuffer;

/// Output readers get this long to drain after the process exits
const READER_GRACE: Duration = Duration::from_secs(5);

/// Everything a step needs besides its definition
pub struct StepContext {
    pub env: HashMap<String, String>,
    pub logs: LogBuffer,
    /// Flips to true when the stage must stop
    pub cancel: watch::Receiver<bool>,
    pub timeout: Duration,
    pub containers: Arc<ContainerManager>,
}

/// Final state of a step as reported to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl StepOutcome {
    /// Outcome of a step that never started
    pub fn without_run(status: StepStatus) -> Self {
        Self {
            status,
            exit_code: None,
            error: None,
        }
    }

    fn success() -> Self {
        Self {
            status: StepStatus::Success,
            exit_code: Some(0),
            error: None,
        }
    }

    fn canceled() -> Self {
        Self::without_run(StepStatus::Canceled)
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Error,
            exit_code: None,
            error: Some(message.into()),
        }
    }
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn run(&self, step: &Step, ctx: &StepContext) -> StepOutcome;
}

/// Runs commands with `/bin/sh -c` on the host, or inside a podman
/// container when the step names an image
pub struct ShellExecutor;

#[async_trait]
impl StepExecutor for ShellExecutor {
    async fn run(&self, step: &Step, ctx: &StepContext) -> StepOutcome {
        let container = match &step.image {
            Some(image) => match ctx.containers.ensure_running(image).await {
                Ok(name) => Some(name),
                Err(e) => {
                    ctx.logs.system(format!("{:#}", e));
                    return StepOutcome::error(format!("container for {} failed to start", image));
                }
            },
            None => None,
        };

        for script in &step.commands {
            if *ctx.cancel.borrow() {
                return StepOutcome::canceled();
            }
            ctx.logs.system(format!("+ {}", script));

            let mut command = match &container {
                Some(name) => ContainerManager::exec_command(name, script, &ctx.env),
                None => {
                    let mut command = Command::new("/bin/sh");
                    command
                        .arg("-c")
                        .arg(script)
                        .current_dir(ctx.containers.workspace())
                        .envs(&ctx.env);
                    command
                }
            };

            let outcome = run_command(&mut command, ctx).await;
            if outcome.status != StepStatus::Success {
                return outcome;
            }
        }
        StepOutcome::success()
    }
}

async fn run_command(command: &mut Command, ctx: &StepContext) -> StepOutcome {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return StepOutcome::error(format!("failed to start command: {}", e)),
    };

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(forward(stdout, LogSource::Stdout, ctx.logs.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(forward(stderr, LogSource::Stderr, ctx.logs.clone()));
    }

    let mut cancel = ctx.cancel.clone();
    let ended = tokio::select! {
        status = child.wait() => Ended::Exited(status),
        _ = canceled(&mut cancel) => Ended::Canceled,
        _ = tokio::time::sleep(ctx.timeout) => Ended::TimedOut,
    };

    let outcome = match ended {
        Ended::Exited(Ok(status)) if status.success() => StepOutcome::success(),
        Ended::Exited(Ok(status)) => StepOutcome {
            status: StepStatus::Failure,
            exit_code: status.code(),
            error: None,
        },
        Ended::Exited(Err(e)) => StepOutcome::error(format!("failed to wait for command: {}", e)),
        Ended::Canceled => {
            debug!("Killing command after cancel signal");
            ctx.logs.system("canceled");
            if let Err(e) = child.kill().await {
                warn!("Failed to kill canceled command: {}", e);
            }
            StepOutcome::canceled()
        }
        Ended::TimedOut => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill timed out command: {}", e);
            }
            StepOutcome::error(format!("timed out after {}s", ctx.timeout.as_secs()))
        }
    };

    // Background processes may keep the pipes open past the shell's exit
    for reader in readers {
        if tokio::time::timeout(READER_GRACE, reader).await.is_err() {
            debug!("Output reader still open after command exit");
        }
    }
    outcome
}

enum Ended {
    Exited(std::io::Result<std::process::ExitStatus>),
    Canceled,
    TimedOut,
}

fn forward<R>(stream: R, source: LogSource, logs: LogBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            logs.push(source, line);
        }
    })
}

/// Resolves once cancellation is signaled; never if the sender is gone
async fn canceled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn step(commands: &[&str]) -> Step {
        Step {
            id: Uuid::new_v4(),
            stage_id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            number: 0,
            name: "test".to_string(),
            image: None,
            commands: commands.iter().map(|c| c.to_string()).collect(),
            env: HashMap::new(),
            secrets: vec![],
            status: StepStatus::Pending,
            exit_code: None,
            error: None,
            started_at: Some(Utc::now()),
            finished_at: None,
        }
    }

    fn context(dir: &std::path::Path) -> (StepContext, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let ctx = StepContext {
            env: HashMap::from([("GREETING".to_string(), "hello".to_string())]),
            logs: LogBuffer::new(),
            cancel: rx,
            timeout: Duration::from_secs(10),
            containers: Arc::new(ContainerManager::new(Uuid::new_v4(), dir)),
        };
        (ctx, tx)
    }

    #[tokio::test]
    async fn test_commands_run_in_order_with_env() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _tx) = context(dir.path());

        let outcome = ShellExecutor
            .run(&step(&["echo $GREETING", "echo oops >&2", "touch marker"]), &ctx)
            .await;
        assert_eq!(outcome, StepOutcome::success());
        assert!(dir.path().join("marker").exists());

        let lines = ctx.logs.drain();
        let messages: Vec<_> = lines.iter().map(|l| l.message.as_str()).collect();
        assert!(messages.contains(&"hello"));
        let stderr = lines.iter().find(|l| l.source == LogSource::Stderr).unwrap();
        assert_eq!(stderr.message, "oops");
        assert_eq!(lines[0].message, "+ echo $GREETING");
    }

    #[tokio::test]
    async fn test_first_failing_command_stops_the_step() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _tx) = context(dir.path());

        let outcome = ShellExecutor
            .run(&step(&["exit 3", "touch never"]), &ctx)
            .await;
        assert_eq!(outcome.status, StepStatus::Failure);
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!dir.path().join("never").exists());
    }

    #[tokio::test]
    async fn test_cancel_kills_running_command() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, tx) = context(dir.path());

        let step = step(&["exec sleep 30"]);
        let started = std::time::Instant::now();
        let run = ShellExecutor.run(&step, &ctx);
        let signal = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send(true).unwrap();
        };
        let (outcome, _) = tokio::join!(run, signal);

        assert_eq!(outcome.status, StepStatus::Canceled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_timeout_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, _tx) = context(dir.path());
        ctx.timeout = Duration::from_millis(100);

        let outcome = ShellExecutor.run(&step(&["exec sleep 30"]), &ctx).await;
        assert_eq!(outcome.status, StepStatus::Error);
        assert!(outcome.error.unwrap().contains("timed out"));
    }
}
