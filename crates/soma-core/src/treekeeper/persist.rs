// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mirror tree actions into the database.
//!
//! Each action kind maps to one family of statements. Everything runs on the
//! job's write transaction, so a job is stored completely or not at all.

use chrono::{DateTime, Utc};
use soma_tree::{
    Action, Check, CheckInstance, ElementDetail, ElementSnapshot, ObjectKind, ObjectRef, Property,
};
use sqlx::SqliteConnection;
use tracing::trace;
use uuid::Uuid;

use crate::deployment::{WorkflowStatus, schedule_deprovision};
use crate::error::{Result, SomaError};
use crate::job::CheckConfigDef;

/// Who and when, for the rows an action writes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Writer {
    pub repository_id: Uuid,
    pub user_id: Option<Uuid>,
    pub now: DateTime<Utc>,
}

impl Writer {
    pub(crate) fn new(repository_id: Uuid, user_id: Option<Uuid>) -> Self {
        Self {
            repository_id,
            user_id,
            now: Utc::now(),
        }
    }

    /// Persist one action.
    pub(crate) async fn apply(&self, conn: &mut SqliteConnection, action: &Action) -> Result<()> {
        trace!(action = action.kind(), "Persisting action");
        match action {
            Action::Create { element, parent } => self.create(conn, element, *parent).await,
            Action::Delete { element } => self.delete(conn, element).await,
            Action::Update { element } => self.update_state(conn, element).await,
            Action::Rename { element, .. } => self.rename(conn, element).await,
            Action::MemberNew {
                parent,
                child,
                bucket_id,
            } => self.member_new(conn, *parent, *child, *bucket_id).await,
            Action::MemberRemoved { parent, child, .. } => {
                self.member_removed(conn, *parent, *child).await
            }
            Action::NodeAssignment { element, bucket_id } => {
                self.node_assignment(conn, element, *bucket_id).await
            }
            Action::Attached { .. } => Ok(()),
            Action::PropertyNew { object, property } => {
                self.property_new(conn, *object, property).await
            }
            Action::PropertyDelete { property, .. } => self.property_delete(conn, property).await,
            Action::PropertyUpdate { property, .. } => self.property_update(conn, property).await,
            Action::CheckNew { object, check } => self.check_new(conn, *object, check).await,
            Action::CheckRemoved { check, .. } => self.check_removed(conn, check).await,
            Action::CheckInstanceCreate { instance } => self.instance_create(conn, instance).await,
            Action::CheckInstanceUpdate { instance } => self.instance_update(conn, instance).await,
            Action::CheckInstanceDelete { instance } => self.instance_delete(conn, instance).await,
        }
    }

    // ------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------

    async fn create(
        &self,
        conn: &mut SqliteConnection,
        element: &ElementSnapshot,
        parent: ObjectRef,
    ) -> Result<()> {
        match &element.detail {
            ElementDetail::Repository { active } => {
                sqlx::query(
                    r#"
                    INSERT INTO repositories (id, name, team_id, is_active, created_by, created_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(element.id)
                .bind(&element.name)
                .bind(element.team_id)
                .bind(*active)
                .bind(self.user_id)
                .bind(self.now)
                .execute(conn)
                .await?;
            }
            ElementDetail::Bucket {
                environment,
                frozen,
            } => {
                sqlx::query(
                    r#"
                    INSERT INTO buckets (id, name, repository_id, environment, team_id,
                                         is_frozen, created_by, created_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(element.id)
                .bind(&element.name)
                .bind(element.repository_id.unwrap_or(parent.id))
                .bind(environment)
                .bind(element.team_id)
                .bind(*frozen)
                .bind(self.user_id)
                .bind(self.now)
                .execute(conn)
                .await?;
            }
            ElementDetail::Group | ElementDetail::Cluster => {
                sqlx::query(&format!(
                    r#"
                    INSERT INTO {} (id, bucket_id, name, object_state, team_id, created_by, created_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    "#,
                    container_table(element.kind)?
                ))
                .bind(element.id)
                .bind(element.bucket_id.unwrap_or(parent.id))
                .bind(&element.name)
                .bind(element.state.as_str())
                .bind(element.team_id)
                .bind(self.user_id)
                .bind(self.now)
                .execute(conn)
                .await?;
            }
            ElementDetail::Root | ElementDetail::Node { .. } | ElementDetail::Fault => {
                return Err(SomaError::invariant(format!(
                    "create action for {} {}",
                    element.kind, element.id
                )));
            }
        }
        Ok(())
    }

    async fn delete(&self, conn: &mut SqliteConnection, element: &ElementSnapshot) -> Result<()> {
        match element.kind {
            ObjectKind::Repository => {
                sqlx::query("UPDATE repositories SET is_deleted = 1, is_active = 0 WHERE id = ?")
                    .bind(element.id)
                    .execute(conn)
                    .await?;
            }
            ObjectKind::Bucket => {
                sqlx::query("UPDATE buckets SET is_deleted = 1 WHERE id = ?")
                    .bind(element.id)
                    .execute(conn)
                    .await?;
            }
            ObjectKind::Group => {
                for statement in [
                    "DELETE FROM group_membership_groups WHERE group_id = ?1 OR child_group_id = ?1",
                    "DELETE FROM group_membership_clusters WHERE group_id = ?1",
                    "DELETE FROM group_membership_nodes WHERE group_id = ?1",
                    "DELETE FROM property_instances WHERE object_id = ?1",
                    "DELETE FROM groups WHERE id = ?1",
                ] {
                    sqlx::query(statement)
                        .bind(element.id)
                        .execute(&mut *conn)
                        .await?;
                }
            }
            ObjectKind::Cluster => {
                for statement in [
                    "DELETE FROM group_membership_clusters WHERE child_cluster_id = ?1",
                    "DELETE FROM cluster_membership WHERE cluster_id = ?1",
                    "DELETE FROM property_instances WHERE object_id = ?1",
                    "DELETE FROM clusters WHERE id = ?1",
                ] {
                    sqlx::query(statement)
                        .bind(element.id)
                        .execute(&mut *conn)
                        .await?;
                }
            }
            ObjectKind::Node => {
                for statement in [
                    "DELETE FROM node_bucket_assignment WHERE node_id = ?1",
                    "DELETE FROM group_membership_nodes WHERE child_node_id = ?1",
                    "DELETE FROM cluster_membership WHERE node_id = ?1",
                    "DELETE FROM property_instances WHERE object_id = ?1",
                ] {
                    sqlx::query(statement)
                        .bind(element.id)
                        .execute(&mut *conn)
                        .await?;
                }
                sqlx::query("UPDATE nodes SET object_state = ? WHERE id = ?")
                    .bind(element.state.as_str())
                    .bind(element.id)
                    .execute(conn)
                    .await?;
            }
            ObjectKind::Root | ObjectKind::Fault => {
                return Err(SomaError::invariant(format!(
                    "delete action for {} {}",
                    element.kind, element.id
                )));
            }
        }
        Ok(())
    }

    async fn update_state(
        &self,
        conn: &mut SqliteConnection,
        element: &ElementSnapshot,
    ) -> Result<()> {
        let table = match element.kind {
            ObjectKind::Group => "groups",
            ObjectKind::Cluster => "clusters",
            ObjectKind::Node => "nodes",
            // Repositories and buckets carry no object state.
            _ => return Ok(()),
        };
        sqlx::query(&format!("UPDATE {} SET object_state = ? WHERE id = ?", table))
            .bind(element.state.as_str())
            .bind(element.id)
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn rename(&self, conn: &mut SqliteConnection, element: &ElementSnapshot) -> Result<()> {
        let table = match element.kind {
            ObjectKind::Repository => "repositories",
            ObjectKind::Bucket => "buckets",
            ObjectKind::Group => "groups",
            ObjectKind::Cluster => "clusters",
            ObjectKind::Node => "nodes",
            ObjectKind::Root | ObjectKind::Fault => {
                return Err(SomaError::invariant(format!(
                    "rename action for {} {}",
                    element.kind, element.id
                )));
            }
        };
        sqlx::query(&format!("UPDATE {} SET name = ? WHERE id = ?", table))
            .bind(&element.name)
            .bind(element.id)
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn member_new(
        &self,
        conn: &mut SqliteConnection,
        parent: ObjectRef,
        child: ObjectRef,
        bucket_id: Uuid,
    ) -> Result<()> {
        let (table, parent_column, child_column) = membership_table(parent, child)?;
        sqlx::query(&format!(
            "INSERT INTO {} ({}, {}, bucket_id) VALUES (?, ?, ?)",
            table, parent_column, child_column
        ))
        .bind(parent.id)
        .bind(child.id)
        .bind(bucket_id)
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn member_removed(
        &self,
        conn: &mut SqliteConnection,
        parent: ObjectRef,
        child: ObjectRef,
    ) -> Result<()> {
        let (table, parent_column, child_column) = membership_table(parent, child)?;
        sqlx::query(&format!(
            "DELETE FROM {} WHERE {} = ? AND {} = ?",
            table, parent_column, child_column
        ))
        .bind(parent.id)
        .bind(child.id)
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn node_assignment(
        &self,
        conn: &mut SqliteConnection,
        element: &ElementSnapshot,
        bucket_id: Uuid,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO node_bucket_assignment (node_id, bucket_id, repository_id, team_id)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(element.id)
        .bind(bucket_id)
        .bind(element.repository_id.unwrap_or(self.repository_id))
        .bind(element.team_id)
        .execute(&mut *conn)
        .await?;
        sqlx::query("UPDATE nodes SET object_state = ? WHERE id = ?")
            .bind(element.state.as_str())
            .bind(element.id)
            .execute(conn)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    async fn property_new(
        &self,
        conn: &mut SqliteConnection,
        object: ObjectRef,
        property: &Property,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO property_instances (instance_id, source_instance_id, repository_id,
                                            object_id, object_type, inherited_from, view,
                                            inheritance, children_only, property_type, value)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (instance_id) DO UPDATE SET
                inherited_from = excluded.inherited_from,
                view = excluded.view,
                inheritance = excluded.inheritance,
                children_only = excluded.children_only,
                property_type = excluded.property_type,
                value = excluded.value
            "#,
        )
        .bind(property.instance_id)
        .bind(property.source_instance_id)
        .bind(self.repository_id)
        .bind(object.id)
        .bind(object.kind.as_str())
        .bind(property.inherited_from)
        .bind(&property.view)
        .bind(property.inheritance)
        .bind(property.children_only)
        .bind(property.value.type_str())
        .bind(serde_json::to_string(&property.value)?)
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn property_delete(&self, conn: &mut SqliteConnection, property: &Property) -> Result<()> {
        sqlx::query("DELETE FROM property_instances WHERE instance_id = ?")
            .bind(property.instance_id)
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn property_update(&self, conn: &mut SqliteConnection, property: &Property) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE property_instances
            SET inherited_from = ?, view = ?, inheritance = ?, children_only = ?,
                property_type = ?, value = ?
            WHERE instance_id = ?
            "#,
        )
        .bind(property.inherited_from)
        .bind(&property.view)
        .bind(property.inheritance)
        .bind(property.children_only)
        .bind(property.value.type_str())
        .bind(serde_json::to_string(&property.value)?)
        .bind(property.instance_id)
        .execute(conn)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Checks and check instances
    // ------------------------------------------------------------------

    async fn check_new(
        &self,
        conn: &mut SqliteConnection,
        object: ObjectRef,
        check: &Check,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO checks (id, repository_id, source_check_id, source_object_type,
                                configuration_id, capability_id, object_id, object_type,
                                inherited_from, is_deleted)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT (id) DO UPDATE SET
                configuration_id = excluded.configuration_id,
                capability_id = excluded.capability_id,
                inherited_from = excluded.inherited_from,
                is_deleted = 0
            "#,
        )
        .bind(check.check_id)
        .bind(self.repository_id)
        .bind(check.source_check_id)
        .bind(check.source_kind.as_str())
        .bind(check.config_id)
        .bind(check.capability_id)
        .bind(object.id)
        .bind(object.kind.as_str())
        .bind(check.inherited_from)
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn check_removed(&self, conn: &mut SqliteConnection, check: &Check) -> Result<()> {
        sqlx::query("UPDATE checks SET is_deleted = 1 WHERE id = ?")
            .bind(check.check_id)
            .execute(&mut *conn)
            .await?;
        // A source check only disappears with its configuration or its element.
        if check.is_source() {
            sqlx::query("UPDATE check_configurations SET is_deleted = 1 WHERE id = ?")
                .bind(check.config_id)
                .execute(conn)
                .await?;
        }
        Ok(())
    }

    async fn instance_create(
        &self,
        conn: &mut SqliteConnection,
        instance: &CheckInstance,
    ) -> Result<()> {
        // Instance ids are stable, so a recomputed instance revives its old row.
        sqlx::query(
            r#"
            INSERT INTO check_instances (id, check_id, configuration_id, repository_id,
                                         monitoring_id, object_id, object_type, version,
                                         constraint_hash, constraint_val_hash, instance_service,
                                         instance_svc_cfg_hash, instance_service_cfg,
                                         update_available, is_deleted, deleted_at)
            VALUES (?1, ?2, ?3, ?4,
                    (SELECT cap.monitoring_id FROM check_configurations cc
                     JOIN capabilities cap ON cap.id = cc.capability_id
                     WHERE cc.id = ?3),
                    ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, 0, NULL)
            ON CONFLICT (id) DO UPDATE SET
                check_id = excluded.check_id,
                configuration_id = excluded.configuration_id,
                monitoring_id = excluded.monitoring_id,
                version = MAX(excluded.version, check_instances.version + 1),
                constraint_hash = excluded.constraint_hash,
                constraint_val_hash = excluded.constraint_val_hash,
                instance_service = excluded.instance_service,
                instance_svc_cfg_hash = excluded.instance_svc_cfg_hash,
                instance_service_cfg = excluded.instance_service_cfg,
                is_deleted = 0,
                deleted_at = NULL
            "#,
        )
        .bind(instance.instance_id)
        .bind(instance.check_id)
        .bind(instance.config_id)
        .bind(self.repository_id)
        .bind(instance.object.id)
        .bind(instance.object.kind.as_str())
        .bind(i64::from(instance.version))
        .bind(&instance.constraint_hash)
        .bind(&instance.constraint_val_hash)
        .bind(instance.instance_service())
        .bind(&instance.service_cfg_hash)
        .bind(instance.service_cfg_json())
        .execute(&mut *conn)
        .await?;
        self.new_configuration(conn, instance).await
    }

    async fn instance_update(
        &self,
        conn: &mut SqliteConnection,
        instance: &CheckInstance,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE check_instances
            SET check_id = ?, configuration_id = ?, version = MAX(?, version + 1), constraint_hash = ?,
                constraint_val_hash = ?, instance_service = ?, instance_svc_cfg_hash = ?,
                instance_service_cfg = ?
            WHERE id = ?
            "#,
        )
        .bind(instance.check_id)
        .bind(instance.config_id)
        .bind(i64::from(instance.version))
        .bind(&instance.constraint_hash)
        .bind(&instance.constraint_val_hash)
        .bind(instance.instance_service())
        .bind(&instance.service_cfg_hash)
        .bind(instance.service_cfg_json())
        .bind(instance.instance_id)
        .execute(&mut *conn)
        .await?;
        self.new_configuration(conn, instance).await
    }

    async fn instance_delete(
        &self,
        conn: &mut SqliteConnection,
        instance: &CheckInstance,
    ) -> Result<()> {
        sqlx::query("UPDATE check_instances SET is_deleted = 1, deleted_at = ? WHERE id = ?")
            .bind(self.now)
            .bind(instance.instance_id)
            .execute(&mut *conn)
            .await?;
        schedule_deprovision(conn, instance.instance_id, self.now).await
    }

    /// Queue a new configuration row for the builder.
    async fn new_configuration(
        &self,
        conn: &mut SqliteConnection,
        instance: &CheckInstance,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO check_instance_configurations (
                id, check_instance_id, repository_id, version, constraint_hash,
                constraint_val_hash, instance_svc_cfg_hash, instance_service,
                instance_service_cfg, status, next_status, created_at)
            VALUES (?1, ?2, ?3,
                    (SELECT COALESCE(MAX(version), 0) + 1 FROM check_instance_configurations
                     WHERE check_instance_id = ?2),
                    ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(instance.instance_id)
        .bind(self.repository_id)
        .bind(&instance.constraint_hash)
        .bind(&instance.constraint_val_hash)
        .bind(&instance.service_cfg_hash)
        .bind(instance.instance_service())
        .bind(instance.service_cfg_json())
        .bind(WorkflowStatus::AwaitingComputation.as_str())
        .bind(WorkflowStatus::Computed.as_str())
        .bind(self.now)
        .execute(conn)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Check configurations
    // ------------------------------------------------------------------

    /// Store a new check configuration with its thresholds and constraints.
    pub(crate) async fn insert_configuration(
        &self,
        conn: &mut SqliteConnection,
        config: &CheckConfigDef,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO check_configurations (id, name, repository_id, bucket_id, object_id,
                                              object_type, capability_id, interval, is_enabled,
                                              inheritance, children_only, external_id,
                                              created_by, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(config.id)
        .bind(&config.name)
        .bind(config.repository_id)
        .bind(config.bucket_id)
        .bind(config.object.id)
        .bind(config.object.kind.as_str())
        .bind(config.capability_id)
        .bind(config.interval)
        .bind(config.enabled)
        .bind(config.inheritance)
        .bind(config.children_only)
        .bind(&config.external_id)
        .bind(self.user_id)
        .bind(self.now)
        .execute(&mut *conn)
        .await?;

        for threshold in &config.thresholds {
            sqlx::query(
                r#"
                INSERT INTO configuration_thresholds (configuration_id, predicate, threshold, level)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(config.id)
            .bind(&threshold.predicate)
            .bind(threshold.value)
            .bind(&threshold.level)
            .execute(&mut *conn)
            .await?;
        }

        for (position, constraint) in config.constraints.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO configuration_constraints (configuration_id, position, constraint_type, spec)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(config.id)
            .bind(position as i64)
            .bind(constraint.type_str())
            .bind(serde_json::to_string(constraint)?)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    /// Logically delete a check configuration.
    pub(crate) async fn delete_configuration(
        &self,
        conn: &mut SqliteConnection,
        config_id: Uuid,
    ) -> Result<()> {
        sqlx::query("UPDATE check_configurations SET is_deleted = 1 WHERE id = ?")
            .bind(config_id)
            .execute(conn)
            .await?;
        Ok(())
    }
}

fn container_table(kind: ObjectKind) -> Result<&'static str> {
    match kind {
        ObjectKind::Group => Ok("groups"),
        ObjectKind::Cluster => Ok("clusters"),
        other => Err(SomaError::invariant(format!("{} is not a container", other))),
    }
}

fn membership_table(
    parent: ObjectRef,
    child: ObjectRef,
) -> Result<(&'static str, &'static str, &'static str)> {
    match (parent.kind, child.kind) {
        (ObjectKind::Group, ObjectKind::Group) => {
            Ok(("group_membership_groups", "group_id", "child_group_id"))
        }
        (ObjectKind::Group, ObjectKind::Cluster) => {
            Ok(("group_membership_clusters", "group_id", "child_cluster_id"))
        }
        (ObjectKind::Group, ObjectKind::Node) => {
            Ok(("group_membership_nodes", "group_id", "child_node_id"))
        }
        (ObjectKind::Cluster, ObjectKind::Node) => {
            Ok(("cluster_membership", "cluster_id", "node_id"))
        }
        (p, c) => Err(SomaError::invariant(format!(
            "no membership of {} in {}",
            c, p
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_tables() {
        let group = ObjectRef::new(ObjectKind::Group, Uuid::new_v4());
        let cluster = ObjectRef::new(ObjectKind::Cluster, Uuid::new_v4());
        let node = ObjectRef::new(ObjectKind::Node, Uuid::new_v4());
        assert_eq!(
            membership_table(group, node).unwrap().0,
            "group_membership_nodes"
        );
        assert_eq!(
            membership_table(cluster, node).unwrap(),
            ("cluster_membership", "cluster_id", "node_id")
        );
        assert!(membership_table(cluster, group).is_err());
    }

    #[test]
    fn test_container_table_rejects_nodes() {
        assert_eq!(container_table(ObjectKind::Cluster).unwrap(), "clusters");
        assert!(container_table(ObjectKind::Node).is_err());
    }
}
