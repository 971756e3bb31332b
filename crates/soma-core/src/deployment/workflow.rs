// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow engine: the pull-based deployment protocol monitoring systems speak.
//!
//! A deployment id is a check instance id; every operation acts on the
//! instance's current configuration row. Each transition runs in one write
//! transaction, so a row is read and moved without interleaving.

use chrono::Utc;
use serde_json::{Value, json};
use sqlx::SqliteConnection;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    ConfigRow, Task, WorkflowStatus, fetch_row, flag_update, has_successor,
    release_successors, set_status, strip_credentials,
};
use crate::db::Database;
use crate::error::{Result, SomaError};
use crate::handler::{self, Handler, HandlerContext, Serve};
use crate::msg::{DeploymentRequest, HostRequest, Payload, RequestAction, RequestHead, Response};

/// Current configuration row of a deployment.
async fn current_row(conn: &mut SqliteConnection, deployment_id: Uuid) -> Result<ConfigRow> {
    let current: Option<(Option<Uuid>,)> =
        sqlx::query_as("SELECT current_instance_config_id FROM check_instances WHERE id = ?")
            .bind(deployment_id)
            .fetch_optional(&mut *conn)
            .await?;
    let Some((Some(config_id),)) = current else {
        return Err(SomaError::not_found(format!("deployment {}", deployment_id)));
    };
    fetch_row(conn, config_id).await?.ok_or_else(|| {
        SomaError::invariant(format!(
            "deployment {} points at missing row {}",
            deployment_id, config_id
        ))
    })
}

async fn deprovision_task(conn: &mut SqliteConnection, row: &ConfigRow) -> Result<Task> {
    Ok(if has_successor(conn, row.id).await? {
        Task::Deprovision
    } else {
        Task::Delete
    })
}

fn illegal(row: &ConfigRow, operation: &str, status: WorkflowStatus) -> SomaError {
    SomaError::validation(format!(
        "cannot {} deployment {} in status {}",
        operation, row.check_instance_id, status
    ))
}

/// Return the deployment and advance its row towards the monitoring system.
///
/// The payload is only returned once the transition has committed.
pub async fn show(db: &Database, deployment_id: Uuid) -> Result<Value> {
    let now = Utc::now();
    let mut tx = db.begin_write().await?;
    let row = current_row(tx.conn(), deployment_id).await?;
    let status = row.workflow_status()?;

    let (status, task) = match status {
        WorkflowStatus::AwaitingRollout | WorkflowStatus::RolloutFailed => {
            set_status(
                tx.conn(),
                row.id,
                WorkflowStatus::RolloutInProgress,
                WorkflowStatus::Active,
                now,
            )
            .await?;
            (WorkflowStatus::RolloutInProgress, Task::Rollout)
        }
        WorkflowStatus::RolloutInProgress | WorkflowStatus::Active => (status, Task::Rollout),
        WorkflowStatus::AwaitingDeprovision | WorkflowStatus::DeprovisionFailed => {
            set_status(
                tx.conn(),
                row.id,
                WorkflowStatus::DeprovisionInProgress,
                WorkflowStatus::Deprovisioned,
                now,
            )
            .await?;
            let task = deprovision_task(tx.conn(), &row).await?;
            (WorkflowStatus::DeprovisionInProgress, task)
        }
        WorkflowStatus::DeprovisionInProgress => {
            let task = deprovision_task(tx.conn(), &row).await?;
            (status, task)
        }
        other => {
            return Err(SomaError::invariant(format!(
                "deployment {} current row {} in status {}",
                deployment_id, row.id, other
            )));
        }
    };
    tx.commit().await?;

    let deployment: Value = match row.deployment_details.as_deref() {
        Some(details) => serde_json::from_str(details)?,
        None => Value::Null,
    };
    debug!(deployment_id = %deployment_id, status = %status, task = task.as_str(), "Deployment shown");
    Ok(json!({
        "deployment_id": deployment_id,
        "instance_config_id": row.id,
        "version": row.version,
        "status": status,
        "task": task,
        "deployment": deployment,
    }))
}

/// The monitoring system finished the task it was shown.
pub async fn success(db: &Database, deployment_id: Uuid) -> Result<Value> {
    let now = Utc::now();
    let mut tx = db.begin_write().await?;
    let row = current_row(tx.conn(), deployment_id).await?;
    let status = row.workflow_status()?;

    let reached = match status {
        WorkflowStatus::RolloutInProgress => {
            // Retired while rolling out: straight on to deprovisioning.
            if row.workflow_next_status()? == WorkflowStatus::AwaitingDeprovision {
                set_status(
                    tx.conn(),
                    row.id,
                    WorkflowStatus::AwaitingDeprovision,
                    WorkflowStatus::DeprovisionInProgress,
                    now,
                )
                .await?;
                flag_update(tx.conn(), row.check_instance_id).await?;
                WorkflowStatus::AwaitingDeprovision
            } else {
                set_status(
                    tx.conn(),
                    row.id,
                    WorkflowStatus::Active,
                    WorkflowStatus::AwaitingDeprovision,
                    now,
                )
                .await?;
                sqlx::query(
                    "UPDATE check_instance_configurations SET activated_at = ? WHERE id = ?",
                )
                .bind(now)
                .bind(row.id)
                .execute(tx.conn())
                .await?;
                WorkflowStatus::Active
            }
        }
        WorkflowStatus::DeprovisionInProgress => {
            set_status(
                tx.conn(),
                row.id,
                WorkflowStatus::Deprovisioned,
                WorkflowStatus::Deprovisioned,
                now,
            )
            .await?;
            sqlx::query(
                "UPDATE check_instance_configurations SET deprovisioned_at = ? WHERE id = ?",
            )
            .bind(now)
            .bind(row.id)
            .execute(tx.conn())
            .await?;
            let released = release_successors(tx.conn(), row.id, now).await?;
            if released > 0 {
                info!(deployment_id = %deployment_id, released, "Released blocked successor");
            }
            WorkflowStatus::Deprovisioned
        }
        other => return Err(illegal(&row, "confirm", other)),
    };
    tx.commit().await?;

    Ok(json!({
        "deployment_id": deployment_id,
        "instance_config_id": row.id,
        "status": reached,
    }))
}

/// The monitoring system failed the task it was shown.
pub async fn failed(db: &Database, deployment_id: Uuid) -> Result<Value> {
    let now = Utc::now();
    let mut tx = db.begin_write().await?;
    let row = current_row(tx.conn(), deployment_id).await?;
    let status = row.workflow_status()?;

    let (reached, next) = match status {
        WorkflowStatus::RolloutInProgress => {
            (WorkflowStatus::RolloutFailed, WorkflowStatus::RolloutInProgress)
        }
        WorkflowStatus::DeprovisionInProgress => (
            WorkflowStatus::DeprovisionFailed,
            WorkflowStatus::DeprovisionInProgress,
        ),
        other => return Err(illegal(&row, "fail", other)),
    };
    set_status(tx.conn(), row.id, reached, next, now).await?;
    tx.commit().await?;

    info!(deployment_id = %deployment_id, status = %reached, "Deployment failed");
    Ok(json!({
        "deployment_id": deployment_id,
        "instance_config_id": row.id,
        "status": reached,
    }))
}

/// Re-arm a failed deployment.
pub async fn retry(db: &Database, deployment_id: Uuid) -> Result<Value> {
    let now = Utc::now();
    let mut tx = db.begin_write().await?;
    let row = current_row(tx.conn(), deployment_id).await?;
    let status = row.workflow_status()?;

    let (reached, next) = match status {
        WorkflowStatus::RolloutFailed => (
            WorkflowStatus::AwaitingRollout,
            WorkflowStatus::RolloutInProgress,
        ),
        WorkflowStatus::DeprovisionFailed => (
            WorkflowStatus::AwaitingDeprovision,
            WorkflowStatus::DeprovisionInProgress,
        ),
        other => return Err(illegal(&row, "retry", other)),
    };
    set_status(tx.conn(), row.id, reached, next, now).await?;
    flag_update(tx.conn(), row.check_instance_id).await?;
    tx.commit().await?;

    Ok(json!({
        "deployment_id": deployment_id,
        "instance_config_id": row.id,
        "status": reached,
    }))
}

/// Force a status on the current row.
pub async fn set(
    db: &Database,
    deployment_id: Uuid,
    status: WorkflowStatus,
    next_status: WorkflowStatus,
) -> Result<Value> {
    let now = Utc::now();
    let mut tx = db.begin_write().await?;
    let row = current_row(tx.conn(), deployment_id).await?;
    set_status(tx.conn(), row.id, status, next_status, now).await?;
    flag_update(tx.conn(), row.check_instance_id).await?;
    tx.commit().await?;

    info!(
        deployment_id = %deployment_id,
        from = %row.status,
        status = %status,
        next_status = %next_status,
        "Deployment status forced"
    );
    Ok(json!({
        "deployment_id": deployment_id,
        "instance_config_id": row.id,
        "status": status,
        "next_status": next_status,
    }))
}

/// Deployment ids of a monitoring system, clearing their update flags.
///
/// With `only_updates` just the ids with unseen updates are returned.
pub async fn poll(db: &Database, monitoring_id: Uuid, only_updates: bool) -> Result<Vec<Uuid>> {
    let mut tx = db.begin_write().await?;
    let ids: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT ci.id
        FROM check_instances ci
        JOIN check_instance_configurations cic ON cic.id = ci.current_instance_config_id
        WHERE ci.monitoring_id = ?
          AND (? = 0 OR ci.update_available = 1)
          AND cic.status != 'deprovisioned'
        ORDER BY ci.id
        "#,
    )
    .bind(monitoring_id)
    .bind(only_updates)
    .fetch_all(tx.conn())
    .await?;
    for (id,) in &ids {
        sqlx::query("UPDATE check_instances SET update_available = 0 WHERE id = ?")
            .bind(id)
            .execute(tx.conn())
            .await?;
    }
    tx.commit().await?;
    Ok(ids.into_iter().map(|(id,)| id).collect())
}

// ----------------------------------------------------------------------------
// Host views
// ----------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct HostRow {
    check_instance_id: Uuid,
    id: Uuid,
    version: i64,
    status: String,
    deployment_details: Option<String>,
}

fn host_task(status: WorkflowStatus) -> Task {
    if status.is_rollout_path() {
        Task::Rollout
    } else if status.is_deprovision_path() {
        Task::Deprovision
    } else {
        Task::Pending
    }
}

async fn host_deployments(
    db: &Database,
    asset_id: i64,
    monitoring_id: Uuid,
) -> Result<Vec<(Uuid, Value)>> {
    let node: Option<(Uuid,)> =
        sqlx::query_as("SELECT id FROM nodes WHERE asset_id = ? AND is_deleted = 0")
            .bind(asset_id)
            .fetch_optional(db.pool())
            .await?;
    let Some((node_id,)) = node else {
        return Err(SomaError::not_found(format!("node with asset id {}", asset_id)));
    };

    let rows = sqlx::query_as::<_, HostRow>(
        r#"
        SELECT ci.id AS check_instance_id, cic.id, cic.version, cic.status, cic.deployment_details
        FROM check_instances ci
        JOIN check_instance_configurations cic ON cic.id = ci.current_instance_config_id
        WHERE ci.object_id = ? AND ci.monitoring_id = ? AND cic.status != 'deprovisioned'
        ORDER BY ci.id
        "#,
    )
    .bind(node_id)
    .bind(monitoring_id)
    .fetch_all(db.pool())
    .await?;

    let mut deployments = Vec::with_capacity(rows.len());
    for row in rows {
        let status: WorkflowStatus = row.status.parse()?;
        let mut deployment: Value = match row.deployment_details.as_deref() {
            Some(details) => serde_json::from_str(details)?,
            None => Value::Null,
        };
        strip_credentials(&mut deployment);
        deployments.push((
            row.check_instance_id,
            json!({
                "deployment_id": row.check_instance_id,
                "instance_config_id": row.id,
                "version": row.version,
                "status": status,
                "task": host_task(status),
                "deployment": deployment,
            }),
        ));
    }
    Ok(deployments)
}

/// Current deployments of a node for one monitoring system, credentials stripped.
pub async fn host_get(db: &Database, asset_id: i64, monitoring_id: Uuid) -> Result<Value> {
    let deployments: Vec<Value> = host_deployments(db, asset_id, monitoring_id)
        .await?
        .into_iter()
        .map(|(_, deployment)| deployment)
        .collect();
    Ok(json!({ "deployments": deployments }))
}

/// [`host_get`] plus the ids from `known` the node no longer carries.
pub async fn host_assemble(
    db: &Database,
    asset_id: i64,
    monitoring_id: Uuid,
    known: &[Uuid],
) -> Result<Value> {
    let current = host_deployments(db, asset_id, monitoring_id).await?;
    let delete: Vec<Value> = known
        .iter()
        .filter(|id| !current.iter().any(|(present, _)| present == *id))
        .map(|id| json!({ "deployment_id": id, "task": Task::Delete }))
        .collect();
    let deployments: Vec<Value> = current.into_iter().map(|(_, d)| d).collect();
    Ok(json!({ "deployments": deployments, "delete": delete }))
}

// ----------------------------------------------------------------------------
// Handler
// ----------------------------------------------------------------------------

/// Spawn the `deployment` service.
pub fn spawn(ctx: &HandlerContext) -> Handler {
    let db = ctx.db.clone();
    let observer = ctx.config.observer;
    handler::spawn_service(ctx, handler::DEPLOYMENT, Serve::Concurrent, move |head| {
        let db = db.clone();
        async move { serve(&db, observer, head).await }
    })
}

fn deployment_id(request: &DeploymentRequest) -> Result<Uuid> {
    request
        .deployment_id
        .ok_or_else(|| SomaError::validation("deployment id required"))
}

fn monitoring_id(request: &DeploymentRequest) -> Result<Uuid> {
    request
        .monitoring_id
        .ok_or_else(|| SomaError::validation("monitoring id required"))
}

async fn serve(db: &Database, observer: bool, head: RequestHead) -> Result<Response> {
    match head.payload {
        Payload::Host(HostRequest {
            asset_id,
            monitoring_id,
            known,
        }) => match head.action {
            RequestAction::Get => Ok(Response::ok(host_get(db, asset_id, monitoring_id).await?)),
            RequestAction::Assemble => Ok(Response::ok(
                host_assemble(db, asset_id, monitoring_id, &known).await?,
            )),
            other => Err(SomaError::validation(format!("host {} not supported", other))),
        },
        Payload::Deployment(request) => {
            if observer {
                return Err(SomaError::Unavailable(
                    "deployments are not advanced in observer mode".to_string(),
                ));
            }
            let body = match head.action {
                RequestAction::Show => show(db, deployment_id(&request)?).await?,
                RequestAction::Success => success(db, deployment_id(&request)?).await?,
                RequestAction::Failed => failed(db, deployment_id(&request)?).await?,
                RequestAction::Retry => retry(db, deployment_id(&request)?).await?,
                RequestAction::Set => {
                    let (Some(status), Some(next_status)) = (request.status, request.next_status)
                    else {
                        return Err(SomaError::validation("status and next status required"));
                    };
                    set(db, deployment_id(&request)?, status, next_status).await?
                }
                RequestAction::Pending | RequestAction::List => {
                    let only_updates = head.action == RequestAction::Pending;
                    let ids = poll(db, monitoring_id(&request)?, only_updates).await?;
                    json!({ "deployments": ids })
                }
                other => {
                    return Err(SomaError::validation(format!(
                        "deployment {} not supported",
                        other
                    )));
                }
            };
            Ok(Response::ok(body))
        }
        _ => Err(SomaError::validation("deployment payload required")),
    }
}
