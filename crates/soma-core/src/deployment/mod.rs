// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployments: the JSON payload handed to monitoring systems, the workflow
//! status of each stored version, and the row transitions shared by the
//! builder, the orderer, the workflow engine and the lifecycle sweeper.

pub mod builder;
pub mod orderer;
pub mod workflow;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, SomaError};

pub use builder::build;
pub use orderer::{OrderSummary, order};

/// Lifecycle position of a check instance configuration row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum WorkflowStatus {
    AwaitingComputation,
    Computed,
    AwaitingRollout,
    RolloutInProgress,
    Active,
    RolloutFailed,
    Blocked,
    AwaitingDeprovision,
    DeprovisionInProgress,
    Deprovisioned,
    DeprovisionFailed,
}

impl WorkflowStatus {
    /// Database string.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::AwaitingComputation => "awaiting_computation",
            WorkflowStatus::Computed => "computed",
            WorkflowStatus::AwaitingRollout => "awaiting_rollout",
            WorkflowStatus::RolloutInProgress => "rollout_in_progress",
            WorkflowStatus::Active => "active",
            WorkflowStatus::RolloutFailed => "rollout_failed",
            WorkflowStatus::Blocked => "blocked",
            WorkflowStatus::AwaitingDeprovision => "awaiting_deprovision",
            WorkflowStatus::DeprovisionInProgress => "deprovision_in_progress",
            WorkflowStatus::Deprovisioned => "deprovisioned",
            WorkflowStatus::DeprovisionFailed => "deprovision_failed",
        }
    }

    /// Rows a monitoring system has seen or is about to see for rollout.
    pub fn is_rollout_path(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::AwaitingRollout
                | WorkflowStatus::RolloutInProgress
                | WorkflowStatus::Active
                | WorkflowStatus::RolloutFailed
        )
    }

    /// Rows on their way out.
    pub fn is_deprovision_path(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::AwaitingDeprovision
                | WorkflowStatus::DeprovisionInProgress
                | WorkflowStatus::DeprovisionFailed
        )
    }

    /// Rows no monitoring system has been told about.
    pub fn is_undelivered(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::AwaitingComputation | WorkflowStatus::Computed | WorkflowStatus::Blocked
        )
    }

    /// Statuses a row can move to in one step.
    pub fn successors(&self) -> &'static [WorkflowStatus] {
        use WorkflowStatus::*;
        match self {
            AwaitingComputation => &[Computed],
            Computed => &[AwaitingRollout, Blocked],
            Blocked => &[AwaitingRollout],
            AwaitingRollout => &[RolloutInProgress, AwaitingDeprovision],
            RolloutInProgress => &[Active, RolloutFailed, AwaitingDeprovision],
            Active => &[AwaitingDeprovision],
            RolloutFailed => &[RolloutInProgress, AwaitingRollout, AwaitingDeprovision],
            AwaitingDeprovision => &[DeprovisionInProgress],
            DeprovisionInProgress => &[Deprovisioned, DeprovisionFailed],
            DeprovisionFailed => &[DeprovisionInProgress, AwaitingDeprovision],
            Deprovisioned => &[],
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = SomaError;

    fn from_str(s: &str) -> Result<Self> {
        use WorkflowStatus::*;
        Ok(match s {
            "awaiting_computation" => AwaitingComputation,
            "computed" => Computed,
            "awaiting_rollout" => AwaitingRollout,
            "rollout_in_progress" => RolloutInProgress,
            "active" => Active,
            "rollout_failed" => RolloutFailed,
            "blocked" => Blocked,
            "awaiting_deprovision" => AwaitingDeprovision,
            "deprovision_in_progress" => DeprovisionInProgress,
            "deprovisioned" => Deprovisioned,
            "deprovision_failed" => DeprovisionFailed,
            other => {
                return Err(SomaError::invariant(format!(
                    "unknown workflow status '{}'",
                    other
                )));
            }
        })
    }
}

/// What a monitoring system is asked to do with a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    /// Configure the check.
    Rollout,
    /// Remove the check; a successor version follows.
    Deprovision,
    /// Remove the check for good.
    Delete,
    /// Nothing to do yet.
    Pending,
}

impl Task {
    /// Wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Task::Rollout => "rollout",
            Task::Deprovision => "deprovision",
            Task::Delete => "delete",
            Task::Pending => "pending",
        }
    }
}

// ----------------------------------------------------------------------------
// Payload
// ----------------------------------------------------------------------------

/// Self-contained description of one check instance version.
///
/// Field order and list order are fixed so equal deployments serialize to
/// equal JSON. Nothing time-dependent is included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    /// Check instance id; also the deployment id.
    pub check_instance_id: Uuid,
    /// Repository name.
    pub repository: String,
    /// Bucket name.
    pub bucket: String,
    /// Bucket environment.
    pub environment: String,
    /// Resolved datacenter; empty when unknown.
    pub datacenter: String,
    /// The monitored element.
    pub object: DeploymentObject,
    /// Server details, nodes only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerInfo>,
    /// Owning team of the element.
    pub team: TeamInfo,
    /// Oncall duty, if one applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oncall: Option<OncallInfo>,
    /// Selected service, for service-bound checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceInfo>,
    /// System and custom properties visible in the capability view.
    pub properties: PropertyInfo,
    /// Check configuration settings.
    pub check: CheckInfo,
    /// Capability and thresholds.
    pub capability: CapabilityInfo,
    /// Monitoring system.
    pub monitoring: MonitoringInfo,
    /// Metric metadata.
    pub metric: MetricInfo,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentObject {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub state: String,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: Uuid,
    pub asset_id: i64,
    pub name: String,
    pub location: String,
    pub online: bool,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamInfo {
    pub id: Uuid,
    pub name: String,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OncallInfo {
    pub id: Uuid,
    pub name: String,
    pub number: String,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub attributes: Vec<NameValue>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyInfo {
    pub system: Vec<NameValue>,
    pub custom: Vec<NameValue>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInfo {
    pub name: String,
    pub interval: i64,
    pub enabled: bool,
    pub external_id: String,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityInfo {
    pub id: Uuid,
    pub view: String,
    pub metric: String,
    pub thresholds: Vec<ThresholdInfo>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdInfo {
    pub predicate: String,
    pub level: String,
    pub numeric_level: i64,
    pub value: i64,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringInfo {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_uri: Option<String>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricInfo {
    pub path: String,
    pub description: String,
    pub unit: String,
    pub unit_name: String,
    pub packages: Vec<PackageInfo>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub provider: String,
    pub package: String,
}

/// Attribute name prefix of secrets that never leave through host endpoints.
pub const CREDENTIAL_PREFIX: &str = "credential_";

/// Remove credential attributes from a serialized deployment.
pub fn strip_credentials(deployment: &mut serde_json::Value) {
    if let Some(attributes) = deployment
        .get_mut("service")
        .and_then(|s| s.get_mut("attributes"))
        .and_then(|a| a.as_array_mut())
    {
        attributes.retain(|attribute| {
            attribute
                .get("name")
                .and_then(|n| n.as_str())
                .is_none_or(|name| !name.starts_with(CREDENTIAL_PREFIX))
        });
    }
}

// ----------------------------------------------------------------------------
// Rows and shared transitions
// ----------------------------------------------------------------------------

/// A check instance configuration row as the workflow sees it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ConfigRow {
    /// Instance config id.
    pub id: Uuid,
    /// Check instance the row belongs to.
    pub check_instance_id: Uuid,
    /// Version.
    pub version: i64,
    /// Workflow status.
    pub status: String,
    /// Status the row moves to on success.
    pub next_status: String,
    /// Deployment JSON, once built.
    pub deployment_details: Option<String>,
}

impl ConfigRow {
    /// Parsed workflow status.
    pub fn workflow_status(&self) -> Result<WorkflowStatus> {
        self.status.parse()
    }

    /// Parsed next status.
    pub fn workflow_next_status(&self) -> Result<WorkflowStatus> {
        self.next_status.parse()
    }
}

pub(crate) const CONFIG_ROW_COLUMNS: &str =
    "id, check_instance_id, version, status, next_status, deployment_details";

pub(crate) async fn fetch_row(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<ConfigRow>> {
    let row = sqlx::query_as::<_, ConfigRow>(&format!(
        "SELECT {} FROM check_instance_configurations WHERE id = ?",
        CONFIG_ROW_COLUMNS
    ))
    .bind(id)
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

pub(crate) async fn set_status(
    conn: &mut SqliteConnection,
    id: Uuid,
    status: WorkflowStatus,
    next_status: WorkflowStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE check_instance_configurations
        SET status = ?, next_status = ?, status_last_updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(status.as_str())
    .bind(next_status.as_str())
    .bind(now)
    .bind(id)
    .execute(conn)
    .await?;
    Ok(())
}

pub(crate) async fn flag_update(conn: &mut SqliteConnection, check_instance_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE check_instances SET update_available = 1 WHERE id = ?")
        .bind(check_instance_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Take a row off the rollout path.
///
/// Rows no monitoring system knows about are dropped; delivered rows move
/// towards deprovisioning. A rollout in flight finishes first and then lands
/// in `awaiting_deprovision`.
pub(crate) async fn retire(
    conn: &mut SqliteConnection,
    row: &ConfigRow,
    now: DateTime<Utc>,
) -> Result<()> {
    let status = row.workflow_status()?;
    match status {
        WorkflowStatus::AwaitingComputation | WorkflowStatus::Computed | WorkflowStatus::Blocked => {
            sqlx::query("DELETE FROM check_instance_configurations WHERE id = ?")
                .bind(row.id)
                .execute(&mut *conn)
                .await?;
            debug!(instance_config_id = %row.id, status = %status, "Dropped undelivered row");
        }
        WorkflowStatus::AwaitingRollout | WorkflowStatus::Active | WorkflowStatus::RolloutFailed => {
            set_status(
                &mut *conn,
                row.id,
                WorkflowStatus::AwaitingDeprovision,
                WorkflowStatus::DeprovisionInProgress,
                now,
            )
            .await?;
            flag_update(&mut *conn, row.check_instance_id).await?;
        }
        WorkflowStatus::RolloutInProgress => {
            set_status(
                &mut *conn,
                row.id,
                WorkflowStatus::RolloutInProgress,
                WorkflowStatus::AwaitingDeprovision,
                now,
            )
            .await?;
        }
        WorkflowStatus::AwaitingDeprovision
        | WorkflowStatus::DeprovisionInProgress
        | WorkflowStatus::DeprovisionFailed
        | WorkflowStatus::Deprovisioned => {}
    }
    Ok(())
}

/// Retire every live row of a check instance that is no longer computed.
pub(crate) async fn schedule_deprovision(
    conn: &mut SqliteConnection,
    check_instance_id: Uuid,
    now: DateTime<Utc>,
) -> Result<()> {
    let rows = sqlx::query_as::<_, ConfigRow>(&format!(
        r#"
        SELECT {} FROM check_instance_configurations
        WHERE check_instance_id = ? AND status != 'deprovisioned'
        ORDER BY version DESC
        "#,
        CONFIG_ROW_COLUMNS
    ))
    .bind(check_instance_id)
    .fetch_all(&mut *conn)
    .await?;

    for row in &rows {
        retire(&mut *conn, row, now).await?;
    }

    // The current pointer must not dangle on a dropped row.
    sqlx::query(
        r#"
        UPDATE check_instances
        SET current_instance_config_id = NULL
        WHERE id = ?
          AND current_instance_config_id IS NOT NULL
          AND current_instance_config_id NOT IN (
              SELECT id FROM check_instance_configurations WHERE check_instance_id = ?
          )
        "#,
    )
    .bind(check_instance_id)
    .bind(check_instance_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Whether a blocked row waits on `blocking_id`.
pub(crate) async fn has_successor(conn: &mut SqliteConnection, blocking_id: Uuid) -> Result<bool> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM check_instance_configuration_dependencies WHERE blocking_instance_config_id = ?",
    )
    .bind(blocking_id)
    .fetch_one(conn)
    .await?;
    Ok(count > 0)
}

/// Release rows blocked on `blocking_id`, which just reached `deprovisioned`.
///
/// A released row becomes the current configuration of its check instance.
pub(crate) async fn release_successors(
    conn: &mut SqliteConnection,
    blocking_id: Uuid,
    now: DateTime<Utc>,
) -> Result<usize> {
    let blocked: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT blocked_instance_config_id
        FROM check_instance_configuration_dependencies
        WHERE blocking_instance_config_id = ?
        "#,
    )
    .bind(blocking_id)
    .fetch_all(&mut *conn)
    .await?;

    sqlx::query(
        "DELETE FROM check_instance_configuration_dependencies WHERE blocking_instance_config_id = ?",
    )
    .bind(blocking_id)
    .execute(&mut *conn)
    .await?;

    let mut released = 0;
    for (id,) in blocked {
        let (remaining,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM check_instance_configuration_dependencies WHERE blocked_instance_config_id = ?",
        )
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
        if remaining > 0 {
            continue;
        }
        let Some(row) = fetch_row(&mut *conn, id).await? else {
            continue;
        };
        if row.workflow_status()? != WorkflowStatus::Blocked {
            continue;
        }
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
        .bind(row.check_instance_id)
        .execute(&mut *conn)
        .await?;
        debug!(instance_config_id = %id, "Released blocked deployment");
        released += 1;
    }
    Ok(released)
}
