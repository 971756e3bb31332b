// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replay of a repository from the database into a fresh tree.
//!
//! Structure first (repository, buckets, groups, clusters, nodes, then
//! memberships), then source properties, check configurations and stored
//! check instances. The tree is in load mode throughout, so a recomputed
//! instance set that differs from the stored one surfaces as errors.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::Utc;
use soma_tree::{
    Action, CheckInstance, CheckSpec, Constraint, ElementDetail, NewElement, ObjectKind,
    ObjectRef, PropertySpec, PropertyValue, ServiceConfig, Tree,
};
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::RebuildLevel;
use super::persist::Writer;
use crate::db::Database;
use crate::deployment::schedule_deprovision;
use crate::error::{Result, SomaError};

/// Outcome of a startup load.
#[derive(Debug)]
pub(crate) struct Startup {
    pub tree: Tree,
    /// Errors and invariant violations; any entry means the repository is broken.
    pub problems: Vec<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct RepositoryRow {
    id: Uuid,
    name: String,
    team_id: Uuid,
    is_active: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct BucketRow {
    id: Uuid,
    name: String,
    environment: String,
    team_id: Uuid,
    is_frozen: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct ContainerRow {
    id: Uuid,
    name: String,
    team_id: Uuid,
    bucket_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct NodeRow {
    id: Uuid,
    name: String,
    team_id: Uuid,
    asset_id: i64,
    server_id: Uuid,
    is_online: bool,
    bucket_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct PropertyRow {
    instance_id: Uuid,
    object_id: Uuid,
    object_type: String,
    view: String,
    inheritance: bool,
    children_only: bool,
    value: String,
}

#[derive(Debug, sqlx::FromRow)]
struct ConfigRow {
    id: Uuid,
    name: String,
    object_id: Uuid,
    object_type: String,
    capability_id: Uuid,
    view: String,
    inheritance: bool,
    children_only: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct InstanceRow {
    id: Uuid,
    check_id: Uuid,
    configuration_id: Uuid,
    object_id: Uuid,
    object_type: String,
    version: i64,
    constraint_hash: String,
    constraint_val_hash: String,
    instance_svc_cfg_hash: String,
    instance_service_cfg: Option<String>,
}

/// Feeds rows into a tree, discarding the actions replay produces or
/// keeping the check actions of a rebuild.
struct Loader<'a> {
    pool: &'a SqlitePool,
    repository_id: Uuid,
    tree: Tree,
    kept: Option<Vec<Action>>,
}

impl<'a> Loader<'a> {
    fn new(pool: &'a SqlitePool, repository_id: Uuid, keep_check_actions: bool) -> Self {
        Self {
            pool,
            repository_id,
            tree: Tree::new(),
            kept: keep_check_actions.then(Vec::new),
        }
    }

    fn settle(&mut self) {
        let actions = self.tree.drain_actions();
        if let Some(kept) = self.kept.as_mut() {
            kept.extend(actions.into_iter().filter(Action::is_check_action));
        }
    }

    async fn structure(&mut self) -> Result<String> {
        let repository = sqlx::query_as::<_, RepositoryRow>(
            "SELECT id, name, team_id, is_active FROM repositories WHERE id = ? AND is_deleted = 0",
        )
        .bind(self.repository_id)
        .fetch_optional(self.pool)
        .await?
        .ok_or_else(|| SomaError::not_found(format!("repository {}", self.repository_id)))?;
        let repository_ref = ObjectRef::new(ObjectKind::Repository, repository.id);
        self.tree.attach(
            NewElement {
                id: repository.id,
                name: repository.name.clone(),
                team_id: repository.team_id,
                detail: ElementDetail::Repository {
                    active: repository.is_active,
                },
            },
            ObjectRef::new(ObjectKind::Root, Tree::ROOT_ID),
        );

        let buckets = sqlx::query_as::<_, BucketRow>(
            r#"
            SELECT id, name, environment, team_id, is_frozen
            FROM buckets
            WHERE repository_id = ? AND is_deleted = 0
            "#,
        )
        .bind(self.repository_id)
        .fetch_all(self.pool)
        .await?;
        for bucket in &buckets {
            self.tree.attach(
                NewElement {
                    id: bucket.id,
                    name: bucket.name.clone(),
                    team_id: bucket.team_id,
                    detail: ElementDetail::Bucket {
                        environment: bucket.environment.clone(),
                        frozen: bucket.is_frozen,
                    },
                },
                repository_ref,
            );
        }
        self.settle();

        for (table, detail) in [
            ("groups", ElementDetail::Group),
            ("clusters", ElementDetail::Cluster),
        ] {
            let rows = sqlx::query_as::<_, ContainerRow>(&format!(
                r#"
                SELECT c.id, c.name, c.team_id, c.bucket_id
                FROM {} c
                JOIN buckets b ON b.id = c.bucket_id
                WHERE b.repository_id = ? AND b.is_deleted = 0
                "#,
                table
            ))
            .bind(self.repository_id)
            .fetch_all(self.pool)
            .await?;
            for row in rows {
                self.tree.attach(
                    NewElement {
                        id: row.id,
                        name: row.name,
                        team_id: row.team_id,
                        detail: detail.clone(),
                    },
                    ObjectRef::new(ObjectKind::Bucket, row.bucket_id),
                );
            }
            self.settle();
        }

        let nodes = sqlx::query_as::<_, NodeRow>(
            r#"
            SELECT n.id, n.name, n.team_id, n.asset_id, n.server_id, n.is_online, nba.bucket_id
            FROM node_bucket_assignment nba
            JOIN nodes n ON n.id = nba.node_id
            WHERE nba.repository_id = ?
            "#,
        )
        .bind(self.repository_id)
        .fetch_all(self.pool)
        .await?;
        for node in nodes {
            let asset_id = u64::try_from(node.asset_id).map_err(|_| {
                SomaError::invariant(format!("node {} has negative asset id", node.id))
            })?;
            self.tree.attach(
                NewElement {
                    id: node.id,
                    name: node.name,
                    team_id: node.team_id,
                    detail: ElementDetail::Node {
                        asset_id,
                        server_id: node.server_id,
                        online: node.is_online,
                    },
                },
                ObjectRef::new(ObjectKind::Bucket, node.bucket_id),
            );
        }
        self.settle();

        for (table, parent_column, parent_kind, child_column, child_kind) in [
            (
                "group_membership_groups",
                "group_id",
                ObjectKind::Group,
                "child_group_id",
                ObjectKind::Group,
            ),
            (
                "group_membership_clusters",
                "group_id",
                ObjectKind::Group,
                "child_cluster_id",
                ObjectKind::Cluster,
            ),
            (
                "group_membership_nodes",
                "group_id",
                ObjectKind::Group,
                "child_node_id",
                ObjectKind::Node,
            ),
            (
                "cluster_membership",
                "cluster_id",
                ObjectKind::Cluster,
                "node_id",
                ObjectKind::Node,
            ),
        ] {
            let rows: Vec<(Uuid, Uuid)> = sqlx::query_as(&format!(
                r#"
                SELECT m.{parent}, m.{child}
                FROM {table} m
                JOIN buckets b ON b.id = m.bucket_id
                WHERE b.repository_id = ? AND b.is_deleted = 0
                "#,
                parent = parent_column,
                child = child_column,
                table = table
            ))
            .bind(self.repository_id)
            .fetch_all(self.pool)
            .await?;
            for (parent, child) in rows {
                self.tree.reattach(
                    ObjectRef::new(child_kind, child),
                    ObjectRef::new(parent_kind, parent),
                );
            }
            self.settle();
        }

        debug!(
            buckets = buckets.len(),
            elements = self.tree.len(),
            "Loaded structure"
        );
        Ok(repository.name)
    }

    async fn properties(&mut self) -> Result<()> {
        let rows = sqlx::query_as::<_, PropertyRow>(
            r#"
            SELECT instance_id, object_id, object_type, view, inheritance, children_only, value
            FROM property_instances
            WHERE repository_id = ? AND inherited_from IS NULL
            "#,
        )
        .bind(self.repository_id)
        .fetch_all(self.pool)
        .await?;
        let count = rows.len();
        for row in rows {
            let value: PropertyValue = serde_json::from_str(&row.value)?;
            self.tree.set_property(
                ObjectRef::new(parse_kind(&row.object_type)?, row.object_id),
                PropertySpec {
                    source_instance_id: row.instance_id,
                    view: row.view,
                    inheritance: row.inheritance,
                    children_only: row.children_only,
                    value,
                },
            );
        }
        self.settle();
        debug!(properties = count, "Loaded properties");
        Ok(())
    }

    async fn configurations(&mut self) -> Result<()> {
        let configs = sqlx::query_as::<_, ConfigRow>(
            r#"
            SELECT cc.id, cc.name, cc.object_id, cc.object_type, cc.capability_id, cap.view,
                   cc.inheritance, cc.children_only
            FROM check_configurations cc
            JOIN capabilities cap ON cap.id = cc.capability_id
            WHERE cc.repository_id = ? AND cc.is_deleted = 0
            "#,
        )
        .bind(self.repository_id)
        .fetch_all(self.pool)
        .await?;

        let constraint_rows: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT c.configuration_id, c.spec
            FROM configuration_constraints c
            JOIN check_configurations cc ON cc.id = c.configuration_id
            WHERE cc.repository_id = ? AND cc.is_deleted = 0
            ORDER BY c.configuration_id, c.position
            "#,
        )
        .bind(self.repository_id)
        .fetch_all(self.pool)
        .await?;
        let mut constraints: BTreeMap<Uuid, Vec<Constraint>> = BTreeMap::new();
        for (config_id, spec) in constraint_rows {
            constraints
                .entry(config_id)
                .or_default()
                .push(serde_json::from_str(&spec)?);
        }

        let count = configs.len();
        for config in configs {
            let object = ObjectRef::new(parse_kind(&config.object_type)?, config.object_id);
            self.tree.set_check(
                object,
                CheckSpec {
                    config_id: config.id,
                    name: config.name,
                    capability_id: config.capability_id,
                    view: config.view,
                    inheritance: config.inheritance,
                    children_only: config.children_only,
                    constraints: constraints.remove(&config.id).unwrap_or_default(),
                },
            );
        }
        self.settle();
        debug!(configurations = count, "Loaded check configurations");
        Ok(())
    }

    /// Seed the versions of stored instances the tree will not load, so a
    /// revived instance id keeps counting upwards. A rebuild recomputes every
    /// instance and seeds the live ones too.
    async fn retired_versions(&mut self, include_live: bool) -> Result<()> {
        let rows: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT id, version FROM check_instances
            WHERE repository_id = ? AND (is_deleted = 1 OR ?)
            "#,
        )
        .bind(self.repository_id)
        .bind(include_live)
        .fetch_all(self.pool)
        .await?;
        for (id, version) in rows {
            let version = u32::try_from(version).map_err(|_| {
                SomaError::invariant(format!("check instance {} has version {}", id, version))
            })?;
            self.tree.retire_version(id, version);
        }
        Ok(())
    }

    async fn instances(&mut self) -> Result<()> {
        let rows = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT id, check_id, configuration_id, object_id, object_type, version,
                   constraint_hash, constraint_val_hash, instance_svc_cfg_hash,
                   instance_service_cfg
            FROM check_instances
            WHERE repository_id = ? AND is_deleted = 0
            "#,
        )
        .bind(self.repository_id)
        .fetch_all(self.pool)
        .await?;
        for row in rows {
            let version = u32::try_from(row.version).map_err(|_| {
                SomaError::invariant(format!(
                    "check instance {} has version {}",
                    row.id, row.version
                ))
            })?;
            let service = row
                .instance_service_cfg
                .as_deref()
                .map(serde_json::from_str::<ServiceConfig>)
                .transpose()?;
            self.tree.load_instance(CheckInstance {
                instance_id: row.id,
                check_id: row.check_id,
                config_id: row.configuration_id,
                object: ObjectRef::new(parse_kind(&row.object_type)?, row.object_id),
                version,
                constraint_hash: row.constraint_hash,
                constraint_val_hash: row.constraint_val_hash,
                service,
                service_cfg_hash: row.instance_svc_cfg_hash,
            });
        }
        debug!(instances = self.tree.loaded_count(), "Loaded check instances");
        Ok(())
    }
}

fn parse_kind(s: &str) -> Result<ObjectKind> {
    ObjectKind::from_str(s).map_err(SomaError::invariant)
}

/// Load a repository for normal operation.
///
/// Database errors are returned; divergence between stored and recomputed
/// state is reported through [`Startup::problems`].
pub(crate) async fn startup(
    pool: &SqlitePool,
    repository_id: Uuid,
    print_channels: bool,
) -> Result<Startup> {
    let mut loader = Loader::new(pool, repository_id, false);
    let name = loader.structure().await?;
    loader.properties().await?;
    loader.configurations().await?;
    loader.retired_versions(false).await?;
    loader.instances().await?;
    let loaded = loader.tree.loaded_count();
    loader.tree.compute_check_instances();

    let mut tree = loader.tree;
    let mut problems: Vec<String> = Vec::new();
    for err in tree.drain_errors() {
        error!(repository = %name, error = %err, "Load error");
        problems.push(err.to_string());
    }
    for violation in tree.invariant_violations() {
        error!(repository = %name, violation = %violation, "Tree invariant violated");
        problems.push(violation);
    }

    let leftovers = tree.drain_actions();
    if print_channels {
        info!(
            repository = %name,
            leftover_actions = leftovers.len(),
            errors = problems.len(),
            "Stream contents after load"
        );
        for action in &leftovers {
            info!(repository = %name, action = action.kind(), "Leftover action");
        }
    }
    tree.clear_load_info();

    info!(
        repository = %name,
        elements = tree.len(),
        instances = loaded,
        problems = problems.len(),
        "Repository loaded"
    );
    Ok(Startup { tree, problems })
}

/// Recompute checks or check instances from the stored configurations.
///
/// Stored instances (and checks, at [`RebuildLevel::Checks`]) are marked
/// deleted and revived by the recomputed actions in the same transaction.
/// Only check actions are written. Instances that were not recomputed stay
/// deleted and have their deployments retired. Returns the number of actions
/// written.
pub(crate) async fn rebuild(db: &Database, repository_id: Uuid, level: RebuildLevel) -> Result<usize> {
    let now = Utc::now();
    let mut loader = Loader::new(db.pool(), repository_id, true);
    let name = loader.structure().await?;
    loader.properties().await?;
    loader.configurations().await?;
    loader.retired_versions(true).await?;
    loader.tree.clear_load_info();
    loader.tree.compute_check_instances();
    loader.settle();

    let errors = loader.tree.drain_errors();
    if let Some(first) = errors.first() {
        for err in &errors {
            error!(repository = %name, error = %err, "Rebuild error");
        }
        return Err(SomaError::invariant(format!("rebuild of {}: {}", name, first)));
    }
    let actions = loader.kept.take().unwrap_or_default();

    let writer = Writer {
        repository_id,
        user_id: None,
        now,
    };
    let mut tx = db.begin_write().await?;
    sqlx::query(
        "UPDATE check_instances SET is_deleted = 1, deleted_at = ? WHERE repository_id = ? AND is_deleted = 0",
    )
    .bind(now)
    .bind(repository_id)
    .execute(tx.conn())
    .await?;
    if level == RebuildLevel::Checks {
        sqlx::query("UPDATE checks SET is_deleted = 1 WHERE repository_id = ?")
            .bind(repository_id)
            .execute(tx.conn())
            .await?;
    }
    for action in &actions {
        writer.apply(tx.conn(), action).await?;
    }

    let retired: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT ci.id
        FROM check_instances ci
        JOIN check_instance_configurations cic ON cic.check_instance_id = ci.id
        WHERE ci.repository_id = ? AND ci.is_deleted = 1 AND cic.status != 'deprovisioned'
        "#,
    )
    .bind(repository_id)
    .fetch_all(tx.conn())
    .await?;
    for (instance_id,) in &retired {
        schedule_deprovision(tx.conn(), *instance_id, now).await?;
    }
    tx.commit().await?;

    if !retired.is_empty() {
        warn!(
            repository = %name,
            retired = retired.len(),
            "Rebuild retired check instances"
        );
    }
    info!(
        repository = %name,
        level = ?level,
        actions = actions.len(),
        "Repository rebuilt"
    );
    Ok(actions.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kind() {
        assert_eq!(parse_kind("cluster").unwrap(), ObjectKind::Cluster);
        assert!(matches!(parse_kind("server"), Err(SomaError::Invariant(_))));
    }
}
