// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment Builder.
//!
//! Turns every `awaiting_computation` row of a repository into a stored
//! deployment payload and moves it to `computed`. Each row is updated in its
//! own write transaction.

use chrono::Utc;
use soma_tree::{ObjectKind, PropertyValue, ServiceConfig, VIEW_ANY};
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    CapabilityInfo, CheckInfo, Deployment, DeploymentObject, MetricInfo, MonitoringInfo,
    NameValue, OncallInfo, PackageInfo, PropertyInfo, ServerInfo, ServiceInfo, TeamInfo,
    ThresholdInfo, WorkflowStatus,
};
use crate::db::Database;
use crate::error::{Result, SomaError};

#[derive(Debug, sqlx::FromRow)]
struct PendingRow {
    id: Uuid,
    check_instance_id: Uuid,
    instance_service_cfg: Option<String>,
    object_id: Uuid,
    object_type: String,
    configuration_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct CheckRow {
    name: String,
    interval: i64,
    is_enabled: bool,
    external_id: String,
    capability_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct CapabilityRow {
    view: String,
    metric: String,
    monitoring_id: Uuid,
    monitoring_name: String,
    callback_uri: Option<String>,
    description: String,
    unit: String,
    unit_name: String,
}

#[derive(Debug, sqlx::FromRow)]
struct ObjectRow {
    name: String,
    object_state: String,
    team_id: Uuid,
    bucket_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct ServerRow {
    id: Uuid,
    asset_id: i64,
    name: String,
    datacenter: Option<String>,
    location: String,
    is_online: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct PropertyRow {
    value: String,
    view: String,
    inherited_from: Option<Uuid>,
    children_only: bool,
}

/// Build deployments for every row awaiting computation. Returns the number built.
pub async fn build(
    db: &Database,
    repository_id: Uuid,
    default_datacenter: Option<&str>,
) -> Result<usize> {
    let pending = sqlx::query_as::<_, PendingRow>(
        r#"
        SELECT cic.id, cic.check_instance_id, cic.instance_service_cfg,
               ci.object_id, ci.object_type, ci.configuration_id
        FROM check_instance_configurations cic
        JOIN check_instances ci ON ci.id = cic.check_instance_id
        WHERE cic.repository_id = ? AND cic.status = ?
        ORDER BY cic.check_instance_id, cic.version
        "#,
    )
    .bind(repository_id)
    .bind(WorkflowStatus::AwaitingComputation.as_str())
    .fetch_all(db.pool())
    .await?;

    let mut built = 0;
    for row in &pending {
        let deployment = assemble(db.pool(), row, default_datacenter).await?;
        let details = serde_json::to_string(&deployment)?;

        let mut tx = db.begin_write().await?;
        let updated = sqlx::query(
            r#"
            UPDATE check_instance_configurations
            SET deployment_details = ?, status = ?, next_status = ?, status_last_updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(&details)
        .bind(WorkflowStatus::Computed.as_str())
        .bind(WorkflowStatus::AwaitingRollout.as_str())
        .bind(Utc::now())
        .bind(row.id)
        .bind(WorkflowStatus::AwaitingComputation.as_str())
        .execute(tx.conn())
        .await?;
        tx.commit().await?;

        if updated.rows_affected() == 1 {
            built += 1;
            debug!(
                instance_config_id = %row.id,
                check_instance_id = %row.check_instance_id,
                "Deployment computed"
            );
        }
    }

    if built > 0 {
        info!(repository_id = %repository_id, built, "Deployments built");
    }
    Ok(built)
}

async fn assemble(
    pool: &SqlitePool,
    row: &PendingRow,
    default_datacenter: Option<&str>,
) -> Result<Deployment> {
    let check = sqlx::query_as::<_, CheckRow>(
        r#"
        SELECT name, interval, is_enabled, external_id, capability_id
        FROM check_configurations WHERE id = ?
        "#,
    )
    .bind(row.configuration_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| SomaError::invariant(format!("check configuration {} missing", row.configuration_id)))?;

    let capability = sqlx::query_as::<_, CapabilityRow>(
        r#"
        SELECT c.view, c.metric, m.id AS monitoring_id, m.name AS monitoring_name,
               m.callback_uri, me.description, me.unit, u.name AS unit_name
        FROM capabilities c
        JOIN monitoring_systems m ON m.id = c.monitoring_id
        JOIN metrics me ON me.path = c.metric
        JOIN units u ON u.unit = me.unit
        WHERE c.id = ?
        "#,
    )
    .bind(check.capability_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| SomaError::invariant(format!("capability {} missing", check.capability_id)))?;

    let thresholds: Vec<(String, String, i64, i64)> = sqlx::query_as(
        r#"
        SELECT t.predicate, t.level, l.numeric, t.threshold
        FROM configuration_thresholds t
        JOIN levels l ON l.name = t.level
        WHERE t.configuration_id = ?
        ORDER BY l.numeric, t.predicate, t.threshold
        "#,
    )
    .bind(row.configuration_id)
    .fetch_all(pool)
    .await?;

    let packages: Vec<(String, String)> = sqlx::query_as(
        "SELECT provider, package FROM metric_packages WHERE metric = ? ORDER BY provider",
    )
    .bind(&capability.metric)
    .fetch_all(pool)
    .await?;

    let kind: ObjectKind = row
        .object_type
        .parse()
        .map_err(SomaError::Invariant)?;
    let (object, server) = match kind {
        ObjectKind::Node => {
            let object = sqlx::query_as::<_, ObjectRow>(
                r#"
                SELECT n.name, n.object_state, n.team_id, a.bucket_id
                FROM nodes n
                JOIN node_bucket_assignment a ON a.node_id = n.id
                WHERE n.id = ?
                "#,
            )
            .bind(row.object_id)
            .fetch_optional(pool)
            .await?;
            let server = sqlx::query_as::<_, ServerRow>(
                r#"
                SELECT s.id, s.asset_id, s.name, s.datacenter, s.location, s.is_online
                FROM servers s
                JOIN nodes n ON n.server_id = s.id
                WHERE n.id = ?
                "#,
            )
            .bind(row.object_id)
            .fetch_optional(pool)
            .await?;
            (object, server)
        }
        ObjectKind::Group | ObjectKind::Cluster => {
            let table = if kind == ObjectKind::Group {
                "groups"
            } else {
                "clusters"
            };
            let object = sqlx::query_as::<_, ObjectRow>(&format!(
                "SELECT name, object_state, team_id, bucket_id FROM {} WHERE id = ?",
                table
            ))
            .bind(row.object_id)
            .fetch_optional(pool)
            .await?;
            (object, None)
        }
        other => {
            return Err(SomaError::invariant(format!(
                "check instance {} on {} element",
                row.check_instance_id, other
            )));
        }
    };
    let object = object.ok_or_else(|| {
        SomaError::invariant(format!("{} {} missing", row.object_type, row.object_id))
    })?;

    let (bucket, environment, repository): (String, String, String) = sqlx::query_as(
        r#"
        SELECT b.name, b.environment, r.name
        FROM buckets b
        JOIN repositories r ON r.id = b.repository_id
        WHERE b.id = ?
        "#,
    )
    .bind(object.bucket_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| SomaError::invariant(format!("bucket {} missing", object.bucket_id)))?;

    let (team_id, team_name): (Uuid, String) =
        sqlx::query_as("SELECT id, name FROM teams WHERE id = ?")
            .bind(object.team_id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| SomaError::invariant(format!("team {} missing", object.team_id)))?;

    let datacenter = match server.as_ref().and_then(|s| s.datacenter.clone()) {
        Some(dc) => dc,
        None => {
            let fallback: Option<(String,)> =
                sqlx::query_as("SELECT name FROM datacenters WHERE is_default = 1 ORDER BY name LIMIT 1")
                    .fetch_optional(pool)
                    .await?;
            fallback
                .map(|(name,)| name)
                .or_else(|| default_datacenter.map(str::to_string))
                .unwrap_or_default()
        }
    };

    let properties = sqlx::query_as::<_, PropertyRow>(
        r#"
        SELECT value, view, inherited_from, children_only
        FROM property_instances
        WHERE object_id = ?
        "#,
    )
    .bind(row.object_id)
    .fetch_all(pool)
    .await?;

    let mut info = PropertyInfo::default();
    let mut oncall: Option<OncallInfo> = None;
    for property in properties {
        let local_children_only = property.inherited_from.is_none() && property.children_only;
        if local_children_only || !(property.view == capability.view || property.view == VIEW_ANY)
        {
            continue;
        }
        match serde_json::from_str::<PropertyValue>(&property.value)? {
            PropertyValue::System { name, value } => info.system.push(NameValue { name, value }),
            PropertyValue::Custom { name, value, .. } => {
                info.custom.push(NameValue { name, value })
            }
            PropertyValue::Oncall {
                oncall_id,
                name,
                number,
            } => {
                let candidate = OncallInfo {
                    id: oncall_id,
                    name,
                    number,
                };
                if oncall.as_ref().is_none_or(|o| candidate.name < o.name) {
                    oncall = Some(candidate);
                }
            }
            PropertyValue::Service { .. } => {}
        }
    }
    info.system.sort();
    info.system.dedup();
    info.custom.sort();
    info.custom.dedup();

    let service = match &row.instance_service_cfg {
        Some(cfg) => {
            let service: ServiceConfig = serde_json::from_str(cfg)?;
            Some(ServiceInfo {
                name: service.name,
                attributes: service
                    .attributes
                    .into_iter()
                    .map(|a| NameValue {
                        name: a.name,
                        value: a.value,
                    })
                    .collect(),
            })
        }
        None => None,
    };

    Ok(Deployment {
        check_instance_id: row.check_instance_id,
        repository,
        bucket,
        environment,
        datacenter,
        object: DeploymentObject {
            id: row.object_id,
            kind: row.object_type.clone(),
            name: object.name,
            state: object.object_state,
        },
        server: server.map(|s| ServerInfo {
            id: s.id,
            asset_id: s.asset_id,
            name: s.name,
            location: s.location,
            online: s.is_online,
        }),
        team: TeamInfo {
            id: team_id,
            name: team_name,
        },
        oncall,
        service,
        properties: info,
        check: CheckInfo {
            name: check.name,
            interval: check.interval,
            enabled: check.is_enabled,
            external_id: check.external_id,
        },
        capability: CapabilityInfo {
            id: check.capability_id,
            view: capability.view,
            metric: capability.metric.clone(),
            thresholds: thresholds
                .into_iter()
                .map(|(predicate, level, numeric_level, value)| ThresholdInfo {
                    predicate,
                    level,
                    numeric_level,
                    value,
                })
                .collect(),
        },
        monitoring: MonitoringInfo {
            id: capability.monitoring_id,
            name: capability.monitoring_name,
            callback_uri: capability.callback_uri,
        },
        metric: MetricInfo {
            path: capability.metric,
            description: capability.description,
            unit: capability.unit,
            unit_name: capability.unit_name,
            packages: packages
                .into_iter()
                .map(|(provider, package)| PackageInfo { provider, package })
                .collect(),
        },
    })
}
