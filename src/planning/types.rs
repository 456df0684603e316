//! Core types for plans and actions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::tools::schema::{scalar_text, Arguments};

/// Status of a single action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl ActionStatus {
    pub fn icon(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "◯",
            ActionStatus::Running => "◐",
            ActionStatus::Completed => "✓",
            ActionStatus::Failed => "✗",
            ActionStatus::Skipped => "−",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Completed | ActionStatus::Failed | ActionStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Running => "running",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
            ActionStatus::Skipped => "skipped",
        }
    }
}

/// How a tool process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitOutcome {
    /// Exited 0 within the timeout
    Success,
    /// Ran but exited nonzero or was killed by a signal it did not get from us
    NonZero {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// Exceeded its timeout and was terminated
    Timeout,
    /// Terminated on operator request; halts the plan exactly like a timeout
    Cancelled,
    /// Not run to completion by the executor: missing binary, permission
    /// denied, refused arguments, or a runner that went away mid-action
    Crashed { reason: String },
}

impl ExitOutcome {
    /// Whether this outcome fails the action and halts the plan
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ExitOutcome::Timeout | ExitOutcome::Cancelled | ExitOutcome::Crashed { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ExitOutcome::Success => "success",
            ExitOutcome::NonZero { .. } => "nonzero",
            ExitOutcome::Timeout => "timeout",
            ExitOutcome::Cancelled => "cancelled",
            ExitOutcome::Crashed { .. } => "crashed",
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Success => write!(f, "success (exit 0)"),
            ExitOutcome::NonZero {
                code: Some(code), ..
            } => write!(f, "nonzero (exit {})", code),
            ExitOutcome::NonZero {
                signal: Some(sig), ..
            } => write!(f, "nonzero (killed by signal {})", sig),
            ExitOutcome::NonZero { .. } => write!(f, "nonzero"),
            ExitOutcome::Timeout => write!(f, "timeout"),
            ExitOutcome::Cancelled => write!(f, "cancelled by operator"),
            ExitOutcome::Crashed { reason } => write!(f, "crashed ({})", reason),
        }
    }
}

/// One captured output stream, bounded in size
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CapturedOutput {
    /// Captured text; ends with an explicit marker when truncated
    pub text: String,
    /// Bytes the process actually wrote
    pub total_bytes: u64,
    /// Bytes dropped beyond the capture limit
    pub truncated_bytes: u64,
}

impl CapturedOutput {
    pub fn is_truncated(&self) -> bool {
        self.truncated_bytes > 0
    }
}

/// Outcome of running one action. Written once by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub outcome: ExitOutcome,
    /// Rendered command line, for display
    pub command_line: String,
    /// Process id of the spawned tool, if it started
    pub pid: Option<u32>,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    /// Structured interpretation of stdout, when the tool provides one
    pub structured: Option<serde_json::Value>,
    pub timeout_secs: u64,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ActionResult {
    /// Result for an action that ended without a reaped process of its own
    pub fn without_process(action: &Action, outcome: ExitOutcome, timeout_secs: u64) -> Self {
        let now = Utc::now();
        Self {
            outcome,
            command_line: action.describe(),
            pid: None,
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
            structured: None,
            timeout_secs,
            duration_ms: 0,
            started_at: now,
            finished_at: now,
        }
    }
}

/// A validated tool invocation owned by a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub tool: String,
    pub args: Arguments,
    /// Model's stated reason for proposing this step
    #[serde(default)]
    pub thought: Option<String>,
    /// Per-invocation timeout override in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    pub status: ActionStatus,
    pub result: Option<ActionResult>,
    /// Results of earlier attempts, kept when the operator re-queues the action
    #[serde(default)]
    pub previous_attempts: Vec<ActionResult>,
}

impl Action {
    pub fn new(tool: impl Into<String>, args: Arguments) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tool: tool.into(),
            args,
            thought: None,
            timeout_secs: None,
            status: ActionStatus::Pending,
            result: None,
            previous_attempts: Vec::new(),
        }
    }

    pub fn with_thought(mut self, thought: impl Into<String>) -> Self {
        self.thought = Some(thought.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Short form like `nmap target=10.0.0.5 ports=22,80`
    pub fn describe(&self) -> String {
        let mut out = self.tool.clone();
        for (key, value) in &self.args {
            let text = scalar_text(value).unwrap_or_else(|_| value.to_string());
            if text.chars().any(char::is_whitespace) {
                out.push_str(&format!(" {}=\"{}\"", key, text));
            } else {
                out.push_str(&format!(" {}={}", key, text));
            }
        }
        out
    }
}

/// Overall plan status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Actions are being appended, nothing has run
    #[default]
    Draft,
    /// Pending actions are being driven in order
    Executing,
    /// An action failed; remaining pending actions are untouched
    Halted,
    /// Every action is completed or skipped. Terminal.
    Completed,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Draft => "draft",
            PlanStatus::Executing => "executing",
            PlanStatus::Halted => "halted",
            PlanStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator decision when resuming a halted plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeChoice {
    /// Mark the failed action skipped and continue with the next one
    Skip,
    /// Re-queue the failed action as pending and run it again
    Retry,
}

/// An ordered, named list of actions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub actions: Vec<Action>,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Plan {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            actions: Vec::new(),
            status: PlanStatus::Draft,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = actions;
        self
    }

    fn transition_error(&self, reason: &str) -> Error {
        Error::InvalidTransition {
            plan: self.name.clone(),
            reason: reason.to_string(),
        }
    }

    /// Append to the tail. Legal in Draft and Halted; status is unchanged.
    pub fn append(&mut self, action: Action) -> Result<()> {
        match self.status {
            PlanStatus::Executing => Err(Error::ConcurrentExecution(self.name.clone())),
            PlanStatus::Completed => {
                Err(self.transition_error("plan is completed; start a new plan"))
            }
            PlanStatus::Draft | PlanStatus::Halted => {
                self.actions.push(action);
                Ok(())
            }
        }
    }

    /// Draft → Executing
    pub fn begin_execution(&mut self) -> Result<()> {
        match self.status {
            PlanStatus::Executing => Err(Error::ConcurrentExecution(self.name.clone())),
            PlanStatus::Completed => {
                Err(self.transition_error("plan is completed; start a new plan"))
            }
            PlanStatus::Halted => Err(self.transition_error("plan is halted; resume it instead")),
            PlanStatus::Draft => {
                if self.next_pending().is_none() {
                    return Err(self.transition_error("no pending actions"));
                }
                self.status = PlanStatus::Executing;
                self.started_at.get_or_insert_with(Utc::now);
                Ok(())
            }
        }
    }

    /// Halted → Executing, applying the operator's choice to the failed
    /// action. Returns the index of the action the choice applied to.
    pub fn resume(&mut self, choice: ResumeChoice) -> Result<Option<usize>> {
        match self.status {
            PlanStatus::Executing => return Err(Error::ConcurrentExecution(self.name.clone())),
            PlanStatus::Halted => {}
            _ => return Err(self.transition_error("only a halted plan can be resumed")),
        }

        let failed = self.failed_index();
        if let Some(idx) = failed {
            let action = &mut self.actions[idx];
            match choice {
                ResumeChoice::Skip => action.status = ActionStatus::Skipped,
                ResumeChoice::Retry => {
                    if let Some(previous) = action.result.take() {
                        action.previous_attempts.push(previous);
                    }
                    action.status = ActionStatus::Pending;
                }
            }
        }
        self.status = PlanStatus::Executing;
        Ok(failed)
    }

    /// Mark the action at `idx` running
    pub fn start_action(&mut self, idx: usize) {
        self.actions[idx].status = ActionStatus::Running;
    }

    /// Record a result for the running action at `idx`. A failing outcome
    /// halts the plan. Returns true when the plan halted.
    pub fn finish_action(&mut self, idx: usize, result: ActionResult) -> bool {
        let failed = result.outcome.is_failure();
        let action = &mut self.actions[idx];
        action.status = if failed {
            ActionStatus::Failed
        } else {
            ActionStatus::Completed
        };
        action.result = Some(result);

        if failed {
            self.status = PlanStatus::Halted;
        }
        failed
    }

    /// End an execution pass that cannot finish normally. The running
    /// action, if any, fails with `outcome` and the plan halts. Returns the
    /// index of the interrupted action.
    pub fn interrupt(&mut self, outcome: ExitOutcome, pid: Option<u32>) -> Option<usize> {
        if self.status != PlanStatus::Executing {
            return None;
        }
        self.status = PlanStatus::Halted;

        let idx = self
            .actions
            .iter()
            .position(|a| a.status == ActionStatus::Running)?;
        let action = &mut self.actions[idx];
        let timeout = action.timeout_secs.unwrap_or(0);
        let mut result = ActionResult::without_process(action, outcome, timeout);
        result.pid = pid;
        action.status = ActionStatus::Failed;
        action.result = Some(result);
        Some(idx)
    }

    /// Close out an execution pass: Completed when every action is
    /// completed or skipped.
    pub fn finalize(&mut self) {
        if self.status == PlanStatus::Executing && self.is_finished() {
            self.status = PlanStatus::Completed;
            self.completed_at = Some(Utc::now());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.actions
            .iter()
            .all(|a| matches!(a.status, ActionStatus::Completed | ActionStatus::Skipped))
    }

    pub fn next_pending(&self) -> Option<usize> {
        self.actions
            .iter()
            .position(|a| a.status == ActionStatus::Pending)
    }

    pub fn failed_index(&self) -> Option<usize> {
        self.actions
            .iter()
            .position(|a| a.status == ActionStatus::Failed)
    }

    pub fn count(&self, status: ActionStatus) -> usize {
        self.actions.iter().filter(|a| a.status == status).count()
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            total: self.actions.len(),
            pending: self.count(ActionStatus::Pending),
            completed: self.count(ActionStatus::Completed),
            failed: self.count(ActionStatus::Failed),
            skipped: self.count(ActionStatus::Skipped),
        }
    }
}

/// One row of the `plans` listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub id: String,
    pub name: String,
    pub status: PlanStatus,
    pub total: usize,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}/{} completed",
            self.name, self.status, self.completed, self.total
        )?;
        if self.failed > 0 {
            write!(f, ", {} failed", self.failed)?;
        }
        if self.skipped > 0 {
            write!(f, ", {} skipped", self.skipped)?;
        }
        Ok(())
    }
}
