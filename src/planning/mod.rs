//! Plan/execution engine
//!
//! Model output is parsed into validated actions, collected into plans, and
//! executed in order against real tool processes.

pub mod engine;
pub mod executor;
pub mod parser;
pub mod types;

pub use engine::{ExecReport, ExecutedAction, IngestReport, PlanEngine, PlanEvent};
pub use executor::Executor;
pub use parser::{ActionParser, ParseOutcome, ParseWarning, WarningKind};
pub use types::{
    Action, ActionResult, ActionStatus, CapturedOutput, ExitOutcome, Plan, PlanStatus,
    PlanSummary, ResumeChoice,
};
