mod db;
pub mod models;

pub use db::SessionDatabase;
pub use models::StoredSession;

use async_trait::async_trait;

use crate::error::Result;
use crate::planning::PlanStatus;
use crate::session::Session;
use crate::utils::process_alive;

/// Storage collaborator for saved sessions. Sessions are stored as opaque
/// versioned blobs produced by [`crate::session::serialize`].
///
/// A store also records which process is driving a session's plan, so a
/// second process cannot start the same plan and a plan left `Executing` by
/// a process that died can be recovered.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or replace the session with the same id. Fails with
    /// `SessionBusy` while another live process is driving one of its plans.
    async fn save(&self, session: &Session) -> Result<()>;

    /// Load by id, or by name (most recently updated wins)
    async fn load(&self, id_or_name: &str) -> Result<Session>;

    /// Saved sessions, most recently updated first
    async fn list(&self) -> Result<Vec<StoredSession>>;

    /// Delete one session, resolved the way `load` resolves it. The
    /// session's plans go with it.
    async fn delete(&self, id_or_name: &str) -> Result<()>;

    /// Save `session`, whose plan `plan_id` just left `expected` for
    /// `Executing`, and record this process as its runner. Fails with
    /// `ConcurrentExecution` when the stored plan is already executing under
    /// a live process or has moved on from `expected`.
    async fn claim(&self, session: &Session, plan_id: &str, expected: PlanStatus) -> Result<()>;

    /// Save the progress of a claimed run. Without `running` the claim is
    /// released.
    async fn checkpoint(&self, session: &Session, running: bool) -> Result<()>;

    /// Pid of the process recorded as driving the session with this id
    async fn runner(&self, id: &str) -> Result<Option<u32>>;

    /// Load a session, halting plans left `Executing` by a process that no
    /// longer exists
    async fn open(&self, id_or_name: &str) -> Result<Session> {
        let mut session = self.load(id_or_name).await?;
        if !session
            .plans
            .iter()
            .any(|p| p.status == PlanStatus::Executing)
        {
            return Ok(session);
        }
        if let Some(pid) = self.runner(&session.id).await? {
            if process_alive(pid) {
                return Ok(session);
            }
        }

        let halted = session.recover_interrupted();
        tracing::warn!(
            "Session {}: recovered {} plan(s) left executing by a dead process",
            session.name,
            halted.len()
        );
        self.checkpoint(&session, false).await?;
        Ok(session)
    }
}
