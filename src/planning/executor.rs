//! Action executor
//!
//! Runs one action's bound process with a timeout and bounded output
//! capture, and classifies how it ended. There are no retries here; only
//! the plan engine knows whether running a tool twice is safe.
//!
//! Every spawned tool gets its own process group. On timeout or cancel the
//! whole group receives SIGTERM, then SIGKILL after the grace period, and the
//! child is reaped before a result is returned. A result therefore never
//! exists while the process that produced it is still alive.

use chrono::Utc;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::config::ExecutorConfig;
use crate::tools::{ToolBinding, ToolOutput};

use super::types::{Action, ActionResult, CapturedOutput, ExitOutcome};

const READ_CHUNK: usize = 8192;

/// How the wait for the child ended
enum Ending {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    WaitFailed(std::io::Error),
}

pub struct Executor {
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Per-action override, then the tool's default, then the configured default
    pub fn effective_timeout(&self, action: &Action, tool: &dyn ToolBinding) -> Duration {
        let secs = action
            .timeout_secs
            .or(tool.schema().timeout_secs)
            .unwrap_or(self.config.default_timeout_secs);
        Duration::from_secs(secs.max(1))
    }

    /// Result for an action whose tool cannot be resolved at run time
    pub fn unavailable(&self, action: &Action, reason: impl Into<String>) -> ActionResult {
        ActionResult::without_process(
            action,
            ExitOutcome::Crashed {
                reason: reason.into(),
            },
            action
                .timeout_secs
                .unwrap_or(self.config.default_timeout_secs),
        )
    }

    /// Run the action to completion. `on_spawn` receives the child's pid as
    /// soon as it exists. If the returned future is dropped mid-run the whole
    /// process group is killed.
    pub async fn run(
        &self,
        action: &Action,
        tool: &dyn ToolBinding,
        cancel: &CancellationToken,
        on_spawn: impl FnOnce(u32) + Send,
    ) -> ActionResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let timeout = self.effective_timeout(action, tool);

        let finish = |outcome: ExitOutcome,
                      command_line: String,
                      pid: Option<u32>,
                      stdout: CapturedOutput,
                      stderr: CapturedOutput,
                      structured: Option<serde_json::Value>| ActionResult {
            outcome,
            command_line,
            pid,
            stdout,
            stderr,
            structured,
            timeout_secs: timeout.as_secs(),
            duration_ms: clock.elapsed().as_millis() as u64,
            started_at,
            finished_at: Utc::now(),
        };

        let invocation = match tool.build_command(&action.args) {
            Ok(inv) => inv,
            Err(reason) => {
                tracing::error!("Could not build command for {}: {}", action.tool, reason);
                return finish(
                    ExitOutcome::Crashed {
                        reason: format!("invalid invocation: {}", reason),
                    },
                    action.describe(),
                    None,
                    CapturedOutput::default(),
                    CapturedOutput::default(),
                    None,
                );
            }
        };
        let command_line = invocation.command_line();

        if cancel.is_cancelled() {
            return finish(
                ExitOutcome::Cancelled,
                command_line,
                None,
                CapturedOutput::default(),
                CapturedOutput::default(),
                None,
            );
        }

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        tracing::debug!(
            "Executing {} with {}s timeout: {}",
            action.tool,
            timeout.as_secs(),
            command_line
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("Failed to spawn {}: {}", invocation.program, e);
                return finish(
                    ExitOutcome::Crashed {
                        reason: format!("failed to start '{}': {}", invocation.program, e),
                    },
                    command_line,
                    None,
                    CapturedOutput::default(),
                    CapturedOutput::default(),
                    None,
                );
            }
        };

        let pid = child.id();
        let group = GroupKill(pid);
        if let Some(pid) = pid {
            on_spawn(pid);
        }
        let max_bytes = self.config.max_output_bytes;
        let stdout_task = tokio::spawn(capture(child.stdout.take(), max_bytes));
        let stderr_task = tokio::spawn(capture(child.stderr.take(), max_bytes));

        let ending = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Ending::Exited(status),
                Err(e) => Ending::WaitFailed(e),
            },
            _ = tokio::time::sleep(timeout) => Ending::TimedOut,
            _ = cancel.cancelled() => Ending::Cancelled,
        };

        match ending {
            Ending::TimedOut => {
                tracing::warn!(
                    "{} timed out after {}s, terminating process group",
                    action.tool,
                    timeout.as_secs()
                );
                self.terminate(&mut child, pid).await;
            }
            Ending::Cancelled => {
                tracing::warn!("{} cancelled by operator, terminating process group", action.tool);
                self.terminate(&mut child, pid).await;
            }
            Ending::WaitFailed(_) => self.terminate(&mut child, pid).await,
            // Sweep anything the tool left running in its group
            Ending::Exited(_) => signal_group(pid, GroupSignal::Kill),
        }
        group.disarm();

        let grace = Duration::from_millis(self.config.kill_grace_ms.max(100));
        let stdout = join_capture(stdout_task, grace).await;
        let stderr = join_capture(stderr_task, grace).await;

        let outcome = match ending {
            Ending::Exited(status) => classify(status),
            Ending::TimedOut => ExitOutcome::Timeout,
            Ending::Cancelled => ExitOutcome::Cancelled,
            Ending::WaitFailed(e) => ExitOutcome::Crashed {
                reason: format!("failed to wait for process: {}", e),
            },
        };

        let structured = match outcome {
            ExitOutcome::Success | ExitOutcome::NonZero { .. } => {
                match tool.parse_output(&stdout.text) {
                    ToolOutput::Structured(value) => Some(value),
                    ToolOutput::Text(_) => None,
                }
            }
            _ => None,
        };

        finish(outcome, command_line, pid, stdout, stderr, structured)
    }

    /// SIGTERM the group, wait out the grace period, SIGKILL, then reap
    async fn terminate(&self, child: &mut Child, pid: Option<u32>) {
        signal_group(pid, GroupSignal::Term);

        let grace = Duration::from_millis(self.config.kill_grace_ms);
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            signal_group(pid, GroupSignal::Kill);
            if let Err(e) = child.start_kill() {
                tracing::debug!("start_kill after SIGKILL: {}", e);
            }
        }

        if let Err(e) = child.wait().await {
            tracing::error!("Failed to reap terminated process: {}", e);
        }
        signal_group(pid, GroupSignal::Kill);
    }
}

/// Kills the process group when dropped unless disarmed after a reap
struct GroupKill(Option<u32>);

impl GroupKill {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for GroupKill {
    fn drop(&mut self) {
        if self.0.is_some() {
            tracing::warn!("Action abandoned mid-run, killing process group {:?}", self.0);
            signal_group(self.0, GroupSignal::Kill);
        }
    }
}

#[derive(Clone, Copy)]
enum GroupSignal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, sig: GroupSignal) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return;
    };
    let signal = match sig {
        GroupSignal::Term => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => tracing::warn!("Failed to send {} to process group {}: {}", signal, pid, e),
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _sig: GroupSignal) {}

fn classify(status: ExitStatus) -> ExitOutcome {
    if status.success() {
        return ExitOutcome::Success;
    }
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ExitOutcome::NonZero {
        code: status.code(),
        signal,
    }
}

/// Read a stream to EOF, keeping at most `max_bytes`. Overflow is drained
/// so the process never blocks on a full pipe, and is counted.
async fn capture<R: AsyncRead + Unpin>(reader: Option<R>, max_bytes: usize) -> CapturedOutput {
    let Some(mut reader) = reader else {
        return CapturedOutput::default();
    };

    let mut kept: Vec<u8> = Vec::new();
    let mut total: u64 = 0;
    let mut buf = [0u8; READ_CHUNK];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                total += n as u64;
                let room = max_bytes.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
            Err(e) => {
                tracing::warn!("Error reading tool output: {}", e);
                break;
            }
        }
    }

    bounded_output(kept, total, max_bytes)
}

fn bounded_output(kept: Vec<u8>, total: u64, max_bytes: usize) -> CapturedOutput {
    let truncated_bytes = total.saturating_sub(kept.len() as u64);
    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if truncated_bytes > 0 {
        text.push_str(&format!(
            "\n\n[OUTPUT TRUNCATED: {} bytes omitted. Total output was {} bytes, limit is {} bytes]",
            truncated_bytes, total, max_bytes
        ));
    }
    CapturedOutput {
        text,
        total_bytes: total,
        truncated_bytes,
    }
}

async fn join_capture(
    task: tokio::task::JoinHandle<CapturedOutput>,
    grace: Duration,
) -> CapturedOutput {
    let abort = task.abort_handle();
    match tokio::time::timeout(grace, task).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            tracing::error!("Output capture task failed: {}", e);
            CapturedOutput::default()
        }
        Err(_) => {
            abort.abort();
            CapturedOutput {
                text: "[OUTPUT UNAVAILABLE: pipe held open by a detached process]".to_string(),
                ..Default::default()
            }
        }
    }
}
