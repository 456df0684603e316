//! Sessions: the conversational and work context a plan engine acts on.
//!
//! A session owns its message history and its plans. The active plan is a
//! lookup key into the plan list, never a second owner. The engine receives
//! a [`SharedSession`] per call, so several sessions can execute at once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::planning::{ExitOutcome, Plan, PlanStatus, PlanSummary};

pub mod codec;

pub use codec::{deserialize, serialize, SESSION_FORMAT, SESSION_VERSION};

/// Session handle shared between the operator surface and the plan engine
pub type SharedSession = Arc<Mutex<Session>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Engine-generated summaries of what ran and how it ended
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Token count reported by the model backend, when known
    #[serde(default)]
    pub tokens: Option<usize>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tokens: None,
        }
    }

    pub fn with_tokens(mut self, tokens: usize) -> Self {
        self.tokens = Some(tokens);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    /// Append-only history: chat turns and tool-result summaries
    pub messages: Vec<Message>,
    /// Insertion-ordered
    pub plans: Vec<Plan>,
    /// Id of the active plan
    pub active_plan: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            messages: Vec::new(),
            plans: Vec::new(),
            active_plan: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Start the history with a system prompt
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.messages.push(Message::new(Role::System, prompt));
        self
    }

    pub fn into_shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    // ===== History =====

    pub fn record(&mut self, message: Message) {
        self.messages.push(message);
        self.touch();
    }

    pub fn record_user(&mut self, content: impl Into<String>) {
        self.record(Message::new(Role::User, content));
    }

    pub fn record_assistant(&mut self, content: impl Into<String>) {
        self.record(Message::new(Role::Assistant, content));
    }

    pub fn record_tool(&mut self, content: impl Into<String>) {
        self.record(Message::new(Role::Tool, content));
    }

    /// Sum of the known token counts in the history
    pub fn token_length(&self) -> usize {
        self.messages.iter().filter_map(|m| m.tokens).sum()
    }

    /// History as `(role, content)` pairs in order, ready for a prompt
    pub fn render_prompt(&self) -> Vec<(Role, String)> {
        self.messages
            .iter()
            .map(|m| (m.role, m.content.clone()))
            .collect()
    }

    // ===== Plans =====

    /// Index of the plan whose id or name is `key`
    fn plan_index(&self, key: &str) -> Option<usize> {
        self.plans
            .iter()
            .position(|p| p.id == key)
            .or_else(|| self.plans.iter().position(|p| p.name == key))
    }

    pub fn plan(&self, key: &str) -> Result<&Plan> {
        self.plan_index(key)
            .map(|idx| &self.plans[idx])
            .ok_or_else(|| Error::PlanNotFound(key.to_string()))
    }

    pub fn plan_mut(&mut self, key: &str) -> Result<&mut Plan> {
        match self.plan_index(key) {
            Some(idx) => Ok(&mut self.plans[idx]),
            None => Err(Error::PlanNotFound(key.to_string())),
        }
    }

    pub fn active_plan(&self) -> Option<&Plan> {
        let id = self.active_plan.as_deref()?;
        self.plans.iter().find(|p| p.id == id)
    }

    pub fn set_active_plan(&mut self, key: &str) -> Result<()> {
        let id = self.plan(key)?.id.clone();
        self.active_plan = Some(id);
        self.touch();
        Ok(())
    }

    /// Add a plan and make it active. Returns its id.
    pub fn add_plan(&mut self, plan: Plan) -> String {
        let id = plan.id.clone();
        self.plans.push(plan);
        self.active_plan = Some(id.clone());
        self.touch();
        id
    }

    /// First unused `plan-N` name
    pub fn next_plan_name(&self) -> String {
        let mut n = self.plans.len() + 1;
        loop {
            let name = format!("plan-{}", n);
            if !self.plans.iter().any(|p| p.name == name) {
                return name;
            }
            n += 1;
        }
    }

    pub fn rename_plan(&mut self, key: &str, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        let idx = self
            .plan_index(key)
            .ok_or_else(|| Error::PlanNotFound(key.to_string()))?;
        if name.trim().is_empty() {
            return Err(Error::InvalidTransition {
                plan: self.plans[idx].name.clone(),
                reason: "plan name cannot be empty".to_string(),
            });
        }
        if self
            .plans
            .iter()
            .enumerate()
            .any(|(i, p)| i != idx && (p.name == name || p.id == name))
        {
            return Err(Error::InvalidTransition {
                plan: self.plans[idx].name.clone(),
                reason: format!("name '{}' is already in use", name),
            });
        }
        self.plans[idx].name = name;
        self.touch();
        Ok(())
    }

    /// Remove a plan. An executing plan cannot be deleted.
    pub fn delete_plan(&mut self, key: &str) -> Result<Plan> {
        let idx = self
            .plan_index(key)
            .ok_or_else(|| Error::PlanNotFound(key.to_string()))?;
        if self.plans[idx].status == PlanStatus::Executing {
            return Err(Error::ConcurrentExecution(self.plans[idx].name.clone()));
        }
        let plan = self.plans.remove(idx);
        if self.active_plan.as_deref() == Some(plan.id.as_str()) {
            self.active_plan = None;
        }
        self.touch();
        Ok(plan)
    }

    pub fn plan_summaries(&self) -> Vec<PlanSummary> {
        self.plans.iter().map(Plan::summary).collect()
    }

    /// Halt every plan left `Executing` by a process that is gone. The action
    /// it was running fails as `Crashed`. Returns the names of halted plans.
    pub fn recover_interrupted(&mut self) -> Vec<String> {
        let mut notes = Vec::new();
        for plan in &mut self.plans {
            if plan.status != PlanStatus::Executing {
                continue;
            }
            let outcome = ExitOutcome::Crashed {
                reason: "interrupted: the process driving the plan exited".to_string(),
            };
            let note = match plan.interrupt(outcome, None) {
                Some(idx) => format!(
                    "Plan {} halted at action #{}: the process driving it exited mid-run. \
                     The operator may skip or retry it.",
                    plan.name,
                    idx + 1
                ),
                None => format!("Plan {} halted: the process driving it exited", plan.name),
            };
            notes.push((plan.name.clone(), note));
        }

        let mut halted = Vec::with_capacity(notes.len());
        for (name, note) in notes {
            tracing::warn!("{}", note);
            self.record_tool(note);
            halted.push(name);
        }
        halted
    }
}
