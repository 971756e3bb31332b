// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle sweeper.
//!
//! Periodically finishes deployment work nothing else drives: rows left
//! `awaiting_computation` or `computed` by an interrupted TreeKeeper, and
//! `blocked` rows whose blocker is already gone.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::{Instrument, debug, error, info, info_span};
use uuid::Uuid;

use crate::db::Database;
use crate::deployment::{self, WorkflowStatus, release_successors, set_status};
use crate::error::Result;
use crate::handler::{self, Handler, HandlerContext, HandlerKind};

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Rows that received a payload.
    pub built: usize,
    /// Rows ordered.
    pub ordered: usize,
    /// Blocked rows released.
    pub released: usize,
}

/// Spawn the lifecycle worker.
pub fn spawn(ctx: &HandlerContext) -> Handler {
    let token = ctx.root.child_token();
    let task_token = token.clone();
    let db = ctx.db.clone();
    let interval = ctx.config.lifecycle_interval;
    let default_dc = ctx.config.default_datacenter.clone();

    let task = tokio::spawn(
        async move {
            info!(poll_interval_secs = interval.as_secs(), "Lifecycle started");
            loop {
                tokio::select! {
                    biased;

                    _ = task_token.cancelled() => break,

                    _ = tokio::time::sleep(interval) => {
                        match sweep(&db, default_dc.as_deref()).await {
                            Ok(summary) if summary != SweepSummary::default() => info!(
                                built = summary.built,
                                ordered = summary.ordered,
                                released = summary.released,
                                "Lifecycle sweep"
                            ),
                            Ok(_) => debug!("Nothing to sweep"),
                            Err(e) => error!(error = %e, "Lifecycle sweep failed"),
                        }
                    }
                }
            }
            info!("Lifecycle stopped");
        }
        .instrument(info_span!("lifecycle")),
    );

    Handler::new(handler::LIFECYCLE, HandlerKind::Worker, token, task)
}

/// Run one sweep over every repository.
pub async fn sweep(db: &Database, default_datacenter: Option<&str>) -> Result<SweepSummary> {
    let mut summary = SweepSummary::default();

    let unbuilt = repositories_with(db, WorkflowStatus::AwaitingComputation).await?;
    for repository_id in unbuilt {
        summary.built += deployment::build(db, repository_id, default_datacenter).await?;
    }
    let unordered = repositories_with(db, WorkflowStatus::Computed).await?;
    for repository_id in unordered {
        summary.ordered += deployment::order(db, repository_id).await?.total();
    }

    let mut tx = db.begin_write().await?;
    summary.released = release_stale(tx.conn(), Utc::now()).await?;
    tx.commit().await?;
    Ok(summary)
}

async fn repositories_with(db: &Database, status: WorkflowStatus) -> Result<Vec<Uuid>> {
    let ids: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT DISTINCT repository_id FROM check_instance_configurations WHERE status = ?",
    )
    .bind(status.as_str())
    .fetch_all(db.pool())
    .await?;
    Ok(ids.into_iter().map(|(id,)| id).collect())
}

/// Release blocked rows whose blocker is deprovisioned or gone, and blocked
/// rows that wait on nothing.
async fn release_stale(conn: &mut SqliteConnection, now: DateTime<Utc>) -> Result<usize> {
    let blockers: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT d.blocking_instance_config_id
        FROM check_instance_configuration_dependencies d
        LEFT JOIN check_instance_configurations b ON b.id = d.blocking_instance_config_id
        WHERE b.id IS NULL OR b.status = 'deprovisioned'
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    let mut released = 0;
    for (blocker,) in blockers {
        released += release_successors(&mut *conn, blocker, now).await?;
    }

    let orphans: Vec<(Uuid, Uuid)> = sqlx::query_as(
        r#"
        SELECT id, check_instance_id FROM check_instance_configurations
        WHERE status = 'blocked'
          AND id NOT IN (
              SELECT blocked_instance_config_id FROM check_instance_configuration_dependencies
          )
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;
    for (id, check_instance_id) in orphans {
        set_status(
            &mut *conn,
            id,
            WorkflowStatus::AwaitingRollout,
            WorkflowStatus::RolloutInProgress,
            now,
        )
        .await?;
        sqlx::query(
            r#"
            UPDATE check_instances
            SET current_instance_config_id = ?, update_available = 1
            WHERE id = ?
            "#,
        )
        .bind(id)
        .bind(check_instance_id)
        .execute(&mut *conn)
        .await?;
        debug!(instance_config_id = %id, "Released orphaned blocked row");
        released += 1;
    }
    Ok(released)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sweep_on_empty_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("soma.db")).await.unwrap();
        let summary = sweep(&db, None).await.unwrap();
        assert_eq!(summary, SweepSummary::default());
    }
}
