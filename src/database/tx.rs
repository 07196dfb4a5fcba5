//! Transaction context with deferred post-commit/post-rollback tasks
//!
//! Audit events and cache invalidations must never run while the domain's
//! row lock is held: audit writes can themselves touch provisioned tables and
//! a second lock acquisition under the first would deadlock. `TxContext`
//! accumulates those tasks during a save and hands them back only after the
//! underlying COMMIT or ROLLBACK has returned.

use crate::models::domain_models::NewDomainAuditEvent;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

/// A task deferred until the transaction outcome is known.
#[derive(Debug, Clone)]
pub enum PostTask {
    /// Insert a domain audit event (commit only).
    Audit(NewDomainAuditEvent),
    /// Evict a cached domain snapshot, keyed by (container, domain URI).
    /// Runs on both commit and rollback so no stale optimistic view survives.
    InvalidateDomain {
        container: uuid::Uuid,
        domain_uri: String,
    },
    /// Evict every container-scoped cache entry: validators, formats, and
    /// all of the container's domain snapshots (commit only).
    InvalidateContainer { container: uuid::Uuid },
}

/// An open transaction plus the tasks accumulated against it.
pub struct TxContext<'c> {
    tx: Transaction<'c, Postgres>,
    post_commit: Vec<PostTask>,
    post_rollback: Vec<PostTask>,
}

/// Tasks to run now that the transaction has resolved.
#[must_use = "deferred tasks must be executed by the caller"]
pub struct ResolvedTasks(pub Vec<PostTask>);

impl<'c> TxContext<'c> {
    pub async fn begin(pool: &PgPool) -> Result<TxContext<'static>, sqlx::Error> {
        let tx = pool.begin().await?;
        Ok(TxContext {
            tx,
            post_commit: Vec::new(),
            post_rollback: Vec::new(),
        })
    }

    /// Access the underlying transaction for query execution.
    pub fn tx(&mut self) -> &mut Transaction<'c, Postgres> {
        &mut self.tx
    }

    pub fn on_commit(&mut self, task: PostTask) {
        self.post_commit.push(task);
    }

    /// Register an invalidation that must run whichever way the transaction
    /// resolves.
    pub fn invalidate_always(&mut self, container: uuid::Uuid, domain_uri: &str) {
        let task = PostTask::InvalidateDomain {
            container,
            domain_uri: domain_uri.to_string(),
        };
        self.post_commit.push(task.clone());
        self.post_rollback.push(task);
    }

    /// Commit and return the deferred commit tasks.
    pub async fn commit(self) -> Result<ResolvedTasks, sqlx::Error> {
        self.tx.commit().await?;
        debug!(tasks = self.post_commit.len(), "transaction committed");
        Ok(ResolvedTasks(self.post_commit))
    }

    /// Roll back and return the deferred rollback tasks (invalidations only).
    pub async fn rollback(self) -> Result<ResolvedTasks, sqlx::Error> {
        self.tx.rollback().await?;
        debug!(tasks = self.post_rollback.len(), "transaction rolled back");
        Ok(ResolvedTasks(self.post_rollback))
    }
}
