//! Plan engine
//!
//! Ties parser, plans and executor together over a [`SharedSession`]:
//! model output is parsed and appended to the active plan, `exec` drives the
//! pending actions strictly in order, and every transition is written back
//! into the session history for the next model turn.
//!
//! The session lock is only held between steps. While a tool process runs
//! the session is free, so the plan's `Executing` status is what keeps a
//! second `exec`/`append` out.
//!
//! With a [`SessionStore`] attached, starting a run claims the stored session
//! and every finished action is checkpointed, so other processes sharing the
//! database see the plan as executing too.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, EngineConfig};
use crate::error::{Error, Result};
use crate::persistence::SessionStore;
use crate::session::{Session, SharedSession};
use crate::tools::ToolRegistry;
use crate::utils::truncate_with_marker;

use super::executor::Executor;
use super::parser::{ActionParser, ParseWarning};
use super::types::{
    Action, ActionResult, ActionStatus, ExitOutcome, Plan, PlanStatus, ResumeChoice,
};

/// Progress events for an operator surface
#[derive(Debug, Clone)]
pub enum PlanEvent {
    PlanStarted {
        plan_id: String,
        name: String,
        pending: usize,
    },
    ActionStarted {
        plan_id: String,
        index: usize,
        description: String,
    },
    ActionFinished {
        plan_id: String,
        index: usize,
        outcome: ExitOutcome,
        duration_ms: u64,
    },
    PlanHalted {
        plan_id: String,
        index: usize,
    },
    PlanCompleted {
        plan_id: String,
    },
}

/// What `ingest` did with one model completion
#[derive(Debug, Clone)]
pub struct IngestReport {
    /// Plan the actions went to, if any were accepted
    pub plan_id: Option<String>,
    pub appended: usize,
    pub warnings: Vec<ParseWarning>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedAction {
    pub index: usize,
    pub tool: String,
    pub outcome: ExitOutcome,
    pub duration_ms: u64,
}

/// What one `exec`/`resume` pass did
#[derive(Debug, Clone)]
pub struct ExecReport {
    pub plan_id: String,
    pub plan_name: String,
    pub status: PlanStatus,
    pub executed: Vec<ExecutedAction>,
}

impl fmt::Display for ExecReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Plan {} is {}", self.plan_name, self.status)?;
        for action in &self.executed {
            writeln!(
                f,
                "  #{} {} {} ({} ms)",
                action.index + 1,
                action.tool,
                action.outcome,
                action.duration_ms
            )?;
        }
        Ok(())
    }
}

pub struct PlanEngine {
    registry: Arc<ToolRegistry>,
    executor: Executor,
    config: EngineConfig,
    /// Cancellation handles for plans currently being driven, by plan id
    running: Mutex<HashMap<String, CancellationToken>>,
    events: Option<mpsc::UnboundedSender<PlanEvent>>,
    store: Option<Arc<dyn SessionStore>>,
}

impl PlanEngine {
    pub fn new(registry: Arc<ToolRegistry>, executor: Executor, config: EngineConfig) -> Self {
        Self {
            registry,
            executor,
            config,
            running: Mutex::new(HashMap::new()),
            events: None,
            store: None,
        }
    }

    /// Engine with the registry and limits described by configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let registry = ToolRegistry::from_config(&config.tools)?;
        Ok(Self::new(
            Arc::new(registry),
            Executor::new(config.executor.clone()),
            config.engine.clone(),
        ))
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<PlanEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Claim and checkpoint sessions in `store` while driving their plans
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    fn emit(&self, event: PlanEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Parse a model completion and append its valid actions to the active
    /// plan. A new `plan-N` is started when there is no active plan or the
    /// active one is completed.
    pub async fn ingest(&self, session: &SharedSession, text: &str) -> Result<IngestReport> {
        let outcome = ActionParser::new(&self.registry).parse(text);
        let mut session = session.lock().await;
        session.record_assistant(text);

        if !outcome.warnings.is_empty() {
            for warning in &outcome.warnings {
                tracing::warn!("Dropped proposal: {}", warning);
            }
            if self.config.surface_parse_warnings {
                session.record_tool(format!(
                    "{} proposed action(s) were rejected and not added to any plan:\n{}",
                    outcome.warnings.len(),
                    outcome.render_warnings()
                ));
            }
        }

        if outcome.actions.is_empty() {
            return Ok(IngestReport {
                plan_id: None,
                appended: 0,
                warnings: outcome.warnings,
            });
        }

        if let Some(plan) = session
            .active_plan()
            .filter(|p| p.status == PlanStatus::Executing)
        {
            let name = plan.name.clone();
            session.record_tool(format!(
                "Plan {} is executing; {} proposed action(s) were not added",
                name,
                outcome.actions.len()
            ));
            return Err(Error::ConcurrentExecution(name));
        }

        let plan_id = target_plan(&mut session);
        let plan = session.plan_mut(&plan_id)?;
        // Draft and Halted accept every append, so this is all or nothing
        let mut lines = Vec::with_capacity(outcome.actions.len());
        for action in outcome.actions {
            lines.push(format!("  #{} {}", plan.actions.len() + 1, action.describe()));
            plan.append(action)?;
        }
        let name = plan.name.clone();
        let appended = lines.len();
        tracing::info!("Appended {} action(s) to plan {}", appended, name);
        session.record_tool(format!(
            "Plan {}: {} action(s) appended\n{}",
            name,
            appended,
            lines.join("\n")
        ));

        Ok(IngestReport {
            plan_id: Some(plan_id),
            appended,
            warnings: outcome.warnings,
        })
    }

    /// Validate and append one action to the active plan. Returns the plan id.
    pub async fn append(&self, session: &SharedSession, action: Action) -> Result<String> {
        self.registry.validate(&action.tool, &action.args)?;

        let mut session = session.lock().await;
        let plan_id = target_plan(&mut session);
        let plan = session.plan_mut(&plan_id)?;
        let description = action.describe();
        plan.append(action)?;
        let message = format!(
            "Plan {}: action #{} appended: {}",
            plan.name,
            plan.actions.len(),
            description
        );
        session.record_tool(message);
        Ok(plan_id)
    }

    /// Drive the active plan from Draft through its pending actions
    pub async fn exec(&self, shared: &SharedSession) -> Result<ExecReport> {
        let (run, cancel) = {
            let mut session = shared.lock().await;
            let plan_id = session.active_plan.clone().ok_or(Error::NoActivePlan)?;
            let plan = session.plan_mut(&plan_id)?;
            let before = plan.clone();
            plan.begin_execution()?;
            let run = RunGuard::new(self, shared, &plan_id);
            self.claim(&mut session, before, &run).await?;

            let plan = session.plan_mut(&plan_id)?;
            let name = plan.name.clone();
            let pending = plan.count(ActionStatus::Pending);

            tracing::info!("Executing plan {} ({} pending)", name, pending);
            session.record_tool(format!(
                "Plan {} started: {} pending action(s)",
                name, pending
            ));
            self.emit(PlanEvent::PlanStarted {
                plan_id: plan_id.clone(),
                name,
                pending,
            });
            let cancel = run.register();
            (run, cancel)
        };

        self.drive(shared, run, cancel).await
    }

    /// Continue a halted active plan after the operator's decision on the
    /// failed action
    pub async fn resume(&self, shared: &SharedSession, choice: ResumeChoice) -> Result<ExecReport> {
        let (run, cancel) = {
            let mut session = shared.lock().await;
            let plan_id = session.active_plan.clone().ok_or(Error::NoActivePlan)?;
            let plan = session.plan_mut(&plan_id)?;
            let before = plan.clone();
            let affected = plan.resume(choice)?;
            let run = RunGuard::new(self, shared, &plan_id);
            self.claim(&mut session, before, &run).await?;
            let name = session.plan(&plan_id)?.name.clone();

            let message = match (affected, choice) {
                (Some(idx), ResumeChoice::Skip) => {
                    format!("Plan {} resumed: action #{} skipped", name, idx + 1)
                }
                (Some(idx), ResumeChoice::Retry) => {
                    format!("Plan {} resumed: action #{} re-queued", name, idx + 1)
                }
                (None, _) => format!("Plan {} resumed", name),
            };
            tracing::info!("{}", message);
            session.record_tool(message);
            let cancel = run.register();
            (run, cancel)
        };

        self.drive(shared, run, cancel).await
    }

    /// Cancel the in-flight action of an executing plan. The plan halts once
    /// the process has been terminated and reaped.
    pub async fn cancel(&self, plan_id: &str) -> Result<()> {
        let running = self.running();
        match running.get(plan_id) {
            Some(token) => {
                tracing::info!("Cancelling plan {}", plan_id);
                token.cancel();
                Ok(())
            }
            None => Err(Error::NotExecuting(plan_id.to_string())),
        }
    }

    /// Cancel every plan this engine is driving. Returns how many were signalled.
    pub async fn cancel_all(&self) -> usize {
        let running = self.running();
        for token in running.values() {
            token.cancel();
        }
        running.len()
    }

    pub async fn is_running(&self, plan_id: &str) -> bool {
        self.running().contains_key(plan_id)
    }

    fn running(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the transition just made on the session's plan in the store.
    /// On a conflict the plan is put back the way it was.
    async fn claim(&self, session: &mut Session, before: Plan, run: &RunGuard<'_>) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        if let Err(e) = store.claim(session, &before.id, before.status).await {
            tracing::warn!("Could not claim plan {}: {}", before.name, e);
            run.settle();
            let plan_id = before.id.clone();
            *session.plan_mut(&plan_id)? = before;
            return Err(e);
        }
        Ok(())
    }

    /// Persist progress. `running` keeps the claim on the stored session.
    async fn checkpoint(&self, session: &Session, running: bool) -> Result<()> {
        match &self.store {
            Some(store) => store.checkpoint(session, running).await,
            None => Ok(()),
        }
    }

    async fn drive(
        &self,
        session: &SharedSession,
        run: RunGuard<'_>,
        cancel: CancellationToken,
    ) -> Result<ExecReport> {
        let result = self.drive_pending(session, &run, &cancel).await;
        result
    }

    async fn drive_pending(
        &self,
        session: &SharedSession,
        run: &RunGuard<'_>,
        cancel: &CancellationToken,
    ) -> Result<ExecReport> {
        let plan_id = run.plan_id.as_str();
        let mut executed = Vec::new();

        loop {
            let (idx, total, action, plan_name) = {
                let mut session = session.lock().await;
                let plan = session.plan_mut(plan_id)?;
                let Some(idx) = plan.next_pending() else {
                    plan.finalize();
                    run.settle();
                    let report = ExecReport {
                        plan_id: plan_id.to_string(),
                        plan_name: plan.name.clone(),
                        status: plan.status,
                        executed,
                    };
                    let summary = plan.summary();
                    tracing::info!("Plan {} completed", report.plan_name);
                    session.record_tool(format!("Plan completed: {}", summary));
                    self.emit(PlanEvent::PlanCompleted {
                        plan_id: plan_id.to_string(),
                    });
                    self.checkpoint(&session, false).await?;
                    return Ok(report);
                };
                plan.start_action(idx);
                (idx, plan.actions.len(), plan.actions[idx].clone(), plan.name.clone())
            };

            self.emit(PlanEvent::ActionStarted {
                plan_id: plan_id.to_string(),
                index: idx,
                description: action.describe(),
            });

            // Actions can reach a plan without passing `append`, so arguments
            // are checked against the current schema right before the run
            let mut refusal = None;
            let result = match self.registry.lookup(&action.tool) {
                Ok(tool) => match self.registry.validate(&action.tool, &action.args) {
                    Ok(()) => {
                        let result = self
                            .executor
                            .run(&action, tool.as_ref(), cancel, |pid| {
                                run.pid.store(pid, Ordering::SeqCst)
                            })
                            .await;
                        run.pid.store(0, Ordering::SeqCst);
                        result
                    }
                    Err(e) => {
                        tracing::error!("Refusing to run {}: {}", action.tool, e);
                        let result = self.executor.unavailable(&action, format!("refused: {}", e));
                        refusal = Some(e);
                        result
                    }
                },
                Err(e) => self.executor.unavailable(&action, e.to_string()),
            };

            executed.push(ExecutedAction {
                index: idx,
                tool: action.tool.clone(),
                outcome: result.outcome.clone(),
                duration_ms: result.duration_ms,
            });
            self.emit(PlanEvent::ActionFinished {
                plan_id: plan_id.to_string(),
                index: idx,
                outcome: result.outcome.clone(),
                duration_ms: result.duration_ms,
            });

            let mut session = session.lock().await;
            session.record_tool(self.summarize(&plan_name, idx, total, &action, &result));
            let plan = session.plan_mut(plan_id)?;
            let crashed = match &result.outcome {
                ExitOutcome::Crashed { reason } => Some(reason.clone()),
                _ => None,
            };
            let halted = plan.finish_action(idx, result);
            if plan.status != PlanStatus::Executing {
                run.settle();
            }
            if !halted {
                if let Err(e) = self.checkpoint(&session, true).await {
                    tracing::warn!("Failed to checkpoint plan {}: {}", plan_name, e);
                }
                continue;
            }

            let report = ExecReport {
                plan_id: plan_id.to_string(),
                plan_name: plan.name.clone(),
                status: plan.status,
                executed,
            };
            tracing::warn!("Plan {} halted at action #{}", plan_name, idx + 1);
            session.record_tool(format!(
                "Plan {} halted at action #{} ({}). Remaining actions were not run; \
                 the operator may skip or retry it.",
                plan_name,
                idx + 1,
                action.tool
            ));
            self.emit(PlanEvent::PlanHalted {
                plan_id: plan_id.to_string(),
                index: idx,
            });
            self.checkpoint(&session, false).await?;

            if let Some(e) = refusal {
                return Err(e);
            }
            return match crashed {
                Some(reason) => Err(Error::SpawnFailed {
                    tool: action.tool,
                    reason,
                }),
                None => Ok(report),
            };
        }
    }

    /// History entry for one finished action
    fn summarize(
        &self,
        plan_name: &str,
        idx: usize,
        total: usize,
        action: &Action,
        result: &ActionResult,
    ) -> String {
        let limit = self.config.history_output_chars;
        let mut out = format!(
            "[{} #{}/{}] {}: {} after {} ms\n$ {}",
            plan_name,
            idx + 1,
            total,
            action.tool,
            result.outcome,
            result.duration_ms,
            result.command_line
        );

        if let Some(structured) = &result.structured {
            let json = serde_json::to_string_pretty(structured).unwrap_or_default();
            out.push_str(&format!("\nparsed output:\n{}", truncate_with_marker(&json, limit)));
        } else if !result.stdout.text.trim().is_empty() {
            out.push_str(&format!(
                "\nstdout:\n{}",
                truncate_with_marker(result.stdout.text.trim_end(), limit)
            ));
        }
        if !result.stderr.text.trim().is_empty() {
            out.push_str(&format!(
                "\nstderr:\n{}",
                truncate_with_marker(result.stderr.text.trim_end(), limit)
            ));
        }
        out
    }
}

/// Bookkeeping for one execution pass, from the transition into `Executing`
/// until the plan halts or completes. Dropping it unsettled (the exec future
/// was dropped, or the pass bailed out with an error) halts the plan with its
/// running action failed as `Cancelled`.
struct RunGuard<'a> {
    engine: &'a PlanEngine,
    session: SharedSession,
    plan_id: String,
    /// Pid of the action process currently alive, 0 when there is none
    pid: AtomicU32,
    /// The plan left `Executing` under this pass, or never entered it
    settled: AtomicBool,
    registered: AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn new(engine: &'a PlanEngine, session: &SharedSession, plan_id: &str) -> Self {
        Self {
            engine,
            session: session.clone(),
            plan_id: plan_id.to_string(),
            pid: AtomicU32::new(0),
            settled: AtomicBool::new(false),
            registered: AtomicBool::new(false),
        }
    }

    /// Publish the pass's cancellation handle
    fn register(&self) -> CancellationToken {
        let token = CancellationToken::new();
        self.engine
            .running()
            .insert(self.plan_id.clone(), token.clone());
        self.registered.store(true, Ordering::SeqCst);
        token
    }

    fn settle(&self) {
        self.settled.store(true, Ordering::SeqCst);
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.registered.load(Ordering::SeqCst) {
            self.engine.running().remove(&self.plan_id);
        }
        if self.settled.load(Ordering::SeqCst) {
            return;
        }

        let pid = match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        };
        let store = self.engine.store.clone();
        let halted = match self.session.try_lock() {
            Ok(mut session) => {
                let Some(index) = halt_abandoned(&mut session, &self.plan_id, pid) else {
                    return;
                };
                self.engine.emit(PlanEvent::PlanHalted {
                    plan_id: self.plan_id.clone(),
                    index,
                });
                if store.is_none() {
                    return;
                }
                true
            }
            Err(_) => false,
        };

        // Finish on the runtime when the session is busy or must be persisted
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("Run of plan {} dropped outside a runtime", self.plan_id);
            return;
        };
        let session = self.session.clone();
        let plan_id = self.plan_id.clone();
        handle.spawn(async move {
            let mut session = session.lock().await;
            let halted = halt_abandoned(&mut session, &plan_id, pid).is_some() || halted;
            if let (true, Some(store)) = (halted, store) {
                if let Err(e) = store.checkpoint(&session, false).await {
                    tracing::error!("Failed to persist abandoned plan {}: {}", plan_id, e);
                }
            }
        });
    }
}

/// Halt a plan whose run went away. Returns the index of the action it was on,
/// or `None` when the plan was not executing. A plan stopped between actions
/// reports the next pending index.
fn halt_abandoned(session: &mut Session, plan_id: &str, pid: Option<u32>) -> Option<usize> {
    let plan = session.plan_mut(plan_id).ok()?;
    if plan.status != PlanStatus::Executing {
        return None;
    }
    let name = plan.name.clone();
    let (index, message) = match plan.interrupt(ExitOutcome::Cancelled, pid) {
        Some(idx) => (
            idx,
            format!(
                "Plan {} halted at action #{}: the run was abandoned and its processes killed. \
                 The operator may skip or retry it.",
                name,
                idx + 1
            ),
        ),
        None => (
            plan.next_pending().unwrap_or(0),
            format!("Plan {} halted: the run was abandoned between actions", name),
        ),
    };
    tracing::warn!("{}", message);
    session.record_tool(message);
    Some(index)
}

/// Id of the plan new actions go to, starting a fresh one when needed
fn target_plan(session: &mut Session) -> String {
    match session.active_plan() {
        Some(plan) if plan.status != PlanStatus::Completed => plan.id.clone(),
        _ => {
            let plan = Plan::new(session.next_plan_name());
            tracing::info!("Starting plan {}", plan.name);
            session.add_plan(plan)
        }
    }
}
