use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, SqliteConnection, SqlitePool};
use std::path::Path;

use super::models::StoredSession;
use super::SessionStore;
use crate::error::{Error, Result};
use crate::planning::PlanStatus;
use crate::session::{self, Session};
use crate::utils::process_alive;

/// SQLite database for session persistence
pub struct SessionDatabase {
    pool: SqlitePool,
    /// Pid recorded as the runner of plans claimed through this handle
    runner: u32,
}

/// What a write does to a row's runner
enum Runner {
    Keep,
    Set(u32),
    Clear,
}

impl SessionDatabase {
    /// Open (creating if needed) the database file at `path`
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Use ?mode=rwc to create the database file if it doesn't exist
        let database_url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await?;

        Self::migrate(&pool).await?;
        tracing::debug!("Session database opened at {}", path.display());

        Ok(Self {
            pool,
            runner: std::process::id(),
        })
    }

    /// Private in-memory database
    pub async fn in_memory() -> Result<Self> {
        // Every connection to :memory: is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Self::migrate(&pool).await?;
        Ok(Self {
            pool,
            runner: std::process::id(),
        })
    }

    /// Record `pid` instead of this process as the runner of claimed plans
    pub fn with_runner(mut self, pid: u32) -> Self {
        self.runner = pid;
        self
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                blob BLOB NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                runner_pid INTEGER
            )
            "#,
        )
        .execute(pool)
        .await?;

        // Databases created before runners were tracked
        let columns = sqlx::query_as::<_, (String,)>(
            "SELECT name FROM pragma_table_info('sessions')",
        )
        .fetch_all(pool)
        .await?;
        if !columns.iter().any(|(name,)| name == "runner_pid") {
            sqlx::query("ALTER TABLE sessions ADD COLUMN runner_pid INTEGER")
                .execute(pool)
                .await?;
        }

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sessions_updated_at
            ON sessions(updated_at DESC)
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// A live runner other than this handle's
    fn held_elsewhere(&self, runner: Option<u32>) -> Option<u32> {
        runner.filter(|&pid| pid != self.runner && process_alive(pid))
    }

    async fn write_checked(&self, session: &Session, runner: Runner) -> Result<()> {
        let blob = session::serialize(session)?;
        let mut tx = self.pool.begin().await?;

        if let Some((_, stored_runner)) = locked_row(&mut tx, &session.id).await? {
            if let Some(pid) = self.held_elsewhere(stored_runner) {
                return Err(Error::SessionBusy {
                    session: session.name.clone(),
                    pid,
                });
            }
        }

        write_row(&mut tx, session, blob, runner).await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Take the database write lock, then read the blob and runner of `id`
async fn locked_row(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Option<(Vec<u8>, Option<u32>)>> {
    sqlx::query("UPDATE sessions SET runner_pid = runner_pid WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;

    let row = sqlx::query_as::<_, (Vec<u8>, Option<i64>)>(
        "SELECT blob, runner_pid FROM sessions WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|(blob, runner)| (blob, runner.map(|pid| pid as u32))))
}

async fn write_row(
    conn: &mut SqliteConnection,
    session: &Session,
    blob: Vec<u8>,
    runner: Runner,
) -> Result<()> {
    let (set_runner, pid) = match runner {
        Runner::Keep => (false, None),
        Runner::Set(pid) => (true, Some(pid as i64)),
        Runner::Clear => (true, None),
    };

    sqlx::query(
        r#"
        INSERT INTO sessions (id, name, version, blob, created_at, updated_at, runner_pid)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            version = excluded.version,
            blob = excluded.blob,
            updated_at = excluded.updated_at,
            runner_pid = CASE WHEN ? THEN excluded.runner_pid ELSE sessions.runner_pid END
        "#,
    )
    .bind(&session.id)
    .bind(&session.name)
    .bind(session::SESSION_VERSION as i64)
    .bind(blob)
    .bind(session.created_at.to_rfc3339())
    .bind(session.updated_at.to_rfc3339())
    .bind(pid)
    .bind(set_runner)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .map_err(|e| Error::Storage(sqlx::Error::Decode(Box::new(e))))
}

#[async_trait]
impl SessionStore for SessionDatabase {
    async fn save(&self, session: &Session) -> Result<()> {
        self.write_checked(session, Runner::Keep).await?;
        tracing::debug!("Saved session {} ({})", session.name, session.id);
        Ok(())
    }

    async fn load(&self, id_or_name: &str) -> Result<Session> {
        let row = sqlx::query_as::<_, (Vec<u8>,)>(
            r#"
            SELECT blob
            FROM sessions
            WHERE id = ? OR name = ?
            ORDER BY (id = ?) DESC, updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(id_or_name)
        .bind(id_or_name)
        .bind(id_or_name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((blob,)) => session::deserialize(&blob),
            None => Err(Error::SessionNotFound(id_or_name.to_string())),
        }
    }

    async fn list(&self) -> Result<Vec<StoredSession>> {
        let rows = sqlx::query_as::<_, (String, String, i64, String, String)>(
            r#"
            SELECT id, name, version, created_at, updated_at
            FROM sessions
            ORDER BY updated_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(StoredSession {
                    id: row.0,
                    name: row.1,
                    version: row.2 as u32,
                    created_at: parse_timestamp(&row.3)?,
                    updated_at: parse_timestamp(&row.4)?,
                })
            })
            .collect()
    }

    async fn delete(&self, id_or_name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE sessions SET runner_pid = runner_pid WHERE id = ? OR name = ?")
            .bind(id_or_name)
            .bind(id_or_name)
            .execute(&mut *tx)
            .await?;

        // Same resolution as `load`: an id match, else the newest name match
        let row = sqlx::query_as::<_, (String, String, Option<i64>)>(
            r#"
            SELECT id, name, runner_pid
            FROM sessions
            WHERE id = ? OR name = ?
            ORDER BY (id = ?) DESC, updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(id_or_name)
        .bind(id_or_name)
        .bind(id_or_name)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id, name, runner)) = row else {
            return Err(Error::SessionNotFound(id_or_name.to_string()));
        };
        if let Some(pid) = self.held_elsewhere(runner.map(|pid| pid as u32)) {
            return Err(Error::SessionBusy { session: name, pid });
        }

        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::debug!("Deleted session {} ({})", name, id);
        Ok(())
    }

    async fn claim(&self, session: &Session, plan_id: &str, expected: PlanStatus) -> Result<()> {
        let blob = session::serialize(session)?;
        let mut tx = self.pool.begin().await?;

        if let Some((stored, runner)) = locked_row(&mut tx, &session.id).await? {
            let stored = session::deserialize(&stored)?;
            if let Ok(plan) = stored.plan(plan_id) {
                let live = runner.filter(|&pid| process_alive(pid));
                let executing = plan.status == PlanStatus::Executing;
                // A plan left executing by a dead runner may be taken over
                let stale = executing && live.is_none();
                if (executing && live.is_some()) || (plan.status != expected && !stale) {
                    tracing::warn!(
                        "Plan {} is {} in the store (runner {:?})",
                        plan.name,
                        plan.status,
                        live
                    );
                    return Err(Error::ConcurrentExecution(plan.name.clone()));
                }
            }
            if let Some(pid) = self.held_elsewhere(runner) {
                return Err(Error::SessionBusy {
                    session: session.name.clone(),
                    pid,
                });
            }
        }

        write_row(&mut tx, session, blob, Runner::Set(self.runner)).await?;
        tx.commit().await?;
        tracing::debug!("Session {} claimed by process {}", session.name, self.runner);
        Ok(())
    }

    async fn checkpoint(&self, session: &Session, running: bool) -> Result<()> {
        let runner = if running {
            Runner::Set(self.runner)
        } else {
            Runner::Clear
        };
        self.write_checked(session, runner).await
    }

    async fn runner(&self, id: &str) -> Result<Option<u32>> {
        let row = sqlx::query_as::<_, (Option<i64>,)>(
            "SELECT runner_pid FROM sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|(pid,)| pid).map(|pid| pid as u32))
    }
}
