// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment Orderer.
//!
//! Links each freshly `computed` row to the previous version of its check
//! instance. Identical payloads are dropped; a changed payload waits in
//! `blocked` until the previous version is deprovisioned.

use chrono::Utc;
use serde_json::Value;
use sqlx::SqliteConnection;
use tracing::{debug, info};
use uuid::Uuid;

use super::{CONFIG_ROW_COLUMNS, ConfigRow, WorkflowStatus, fetch_row, retire, set_status};
use crate::db::Database;
use crate::error::{Result, SomaError};

/// What one orderer pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrderSummary {
    /// Rows that went straight to `awaiting_rollout`.
    pub rolled_out: usize,
    /// Rows that now wait on a previous version.
    pub blocked: usize,
    /// Rows dropped because the previous version carries the same payload.
    pub deduplicated: usize,
}

impl OrderSummary {
    /// Rows handled in total.
    pub fn total(&self) -> usize {
        self.rolled_out + self.blocked + self.deduplicated
    }
}

enum Outcome {
    RolledOut,
    Blocked,
    Deduplicated,
    Skipped,
}

/// Order every `computed` row of a repository.
pub async fn order(db: &Database, repository_id: Uuid) -> Result<OrderSummary> {
    let candidates: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT id FROM check_instance_configurations
        WHERE repository_id = ? AND status = ?
        ORDER BY check_instance_id, version
        "#,
    )
    .bind(repository_id)
    .bind(WorkflowStatus::Computed.as_str())
    .fetch_all(db.pool())
    .await?;

    let mut summary = OrderSummary::default();
    for (id,) in candidates {
        let mut tx = db.begin_write().await?;
        let outcome = order_row(tx.conn(), id).await?;
        tx.commit().await?;
        match outcome {
            Outcome::RolledOut => summary.rolled_out += 1,
            Outcome::Blocked => summary.blocked += 1,
            Outcome::Deduplicated => summary.deduplicated += 1,
            Outcome::Skipped => {}
        }
    }

    if summary.total() > 0 {
        info!(
            repository_id = %repository_id,
            rolled_out = summary.rolled_out,
            blocked = summary.blocked,
            deduplicated = summary.deduplicated,
            "Deployments ordered"
        );
    }
    Ok(summary)
}

async fn order_row(conn: &mut SqliteConnection, id: Uuid) -> Result<Outcome> {
    // Claim: another pass may have handled the row since it was listed.
    let Some(row) = fetch_row(&mut *conn, id).await? else {
        return Ok(Outcome::Skipped);
    };
    if row.workflow_status()? != WorkflowStatus::Computed {
        return Ok(Outcome::Skipped);
    }
    let now = Utc::now();

    let previous = sqlx::query_as::<_, ConfigRow>(&format!(
        r#"
        SELECT {} FROM check_instance_configurations
        WHERE check_instance_id = ? AND version < ?
          AND status NOT IN ('awaiting_computation', 'computed')
        ORDER BY version DESC
        LIMIT 1
        "#,
        CONFIG_ROW_COLUMNS
    ))
    .bind(row.check_instance_id)
    .bind(row.version)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(previous) = previous else {
        roll_out(conn, &row, now).await?;
        return Ok(Outcome::RolledOut);
    };

    let status = previous.workflow_status()?;
    if status == WorkflowStatus::Deprovisioned {
        roll_out(conn, &row, now).await?;
        return Ok(Outcome::RolledOut);
    }

    let equal = payload(&row)? == payload(&previous)?;
    if status.is_rollout_path() {
        if equal {
            drop_row(conn, &row).await?;
            return Ok(Outcome::Deduplicated);
        }
        block(conn, &row, previous.id, now).await?;
        retire(conn, &previous, now).await?;
        return Ok(Outcome::Blocked);
    }

    match status {
        WorkflowStatus::Blocked if equal => {
            drop_row(conn, &row).await?;
            Ok(Outcome::Deduplicated)
        }
        WorkflowStatus::Blocked => {
            // The new row takes over the previous row's place in the queue.
            sqlx::query(
                r#"
                UPDATE check_instance_configuration_dependencies
                SET blocked_instance_config_id = ?
                WHERE blocked_instance_config_id = ?
                "#,
            )
            .bind(row.id)
            .bind(previous.id)
            .execute(&mut *conn)
            .await?;
            set_status(
                &mut *conn,
                row.id,
                WorkflowStatus::Blocked,
                WorkflowStatus::AwaitingRollout,
                now,
            )
            .await?;
            drop_row(conn, &previous).await?;
            Ok(Outcome::Blocked)
        }
        _ if status.is_deprovision_path() => {
            block(conn, &row, previous.id, now).await?;
            Ok(Outcome::Blocked)
        }
        other => Err(SomaError::invariant(format!(
            "previous deployment {} in status {}",
            previous.id, other
        ))),
    }
}

fn payload(row: &ConfigRow) -> Result<Value> {
    let details = row.deployment_details.as_deref().ok_or_else(|| {
        SomaError::invariant(format!("deployment {} has no payload", row.id))
    })?;
    Ok(serde_json::from_str(details)?)
}

async fn roll_out(
    conn: &mut SqliteConnection,
    row: &ConfigRow,
    now: chrono::DateTime<Utc>,
) -> Result<()> {
    set_status(
        &mut *conn,
        row.id,
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
    .bind(row.id)
    .bind(row.check_instance_id)
    .execute(conn)
    .await?;
    debug!(instance_config_id = %row.id, "Deployment awaiting rollout");
    Ok(())
}

async fn block(
    conn: &mut SqliteConnection,
    row: &ConfigRow,
    blocking_id: Uuid,
    now: chrono::DateTime<Utc>,
) -> Result<()> {
    set_status(
        &mut *conn,
        row.id,
        WorkflowStatus::Blocked,
        WorkflowStatus::AwaitingRollout,
        now,
    )
    .await?;
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO check_instance_configuration_dependencies
            (blocked_instance_config_id, blocking_instance_config_id, unblocking_state)
        VALUES (?, ?, ?)
        "#,
    )
    .bind(row.id)
    .bind(blocking_id)
    .bind(WorkflowStatus::Deprovisioned.as_str())
    .execute(&mut *conn)
    .await?;
    sqlx::query("UPDATE check_instances SET update_available = 1 WHERE id = ?")
        .bind(row.check_instance_id)
        .execute(conn)
        .await?;
    debug!(
        instance_config_id = %row.id,
        blocked_on = %blocking_id,
        "Deployment blocked on previous version"
    );
    Ok(())
}

async fn drop_row(conn: &mut SqliteConnection, row: &ConfigRow) -> Result<()> {
    sqlx::query("DELETE FROM check_instance_configurations WHERE id = ?")
        .bind(row.id)
        .execute(conn)
        .await?;
    debug!(instance_config_id = %row.id, "Dropped deployment row");
    Ok(())
}
