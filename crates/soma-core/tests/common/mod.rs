// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for soma-core integration tests.
//!
//! Provides TestContext: a temporary SQLite database seeded with metadata
//! fixtures and a running [`SomaRuntime`] on top of it.

#![allow(dead_code)]

use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use soma_tree::{ObjectKind, ObjectRef};
use uuid::Uuid;

use soma_core::msg::{
    BucketRequest, CheckConfigRequest, JobQuery, NodeConfigRequest, RepositoryRequest,
    ThresholdSpec,
};
use soma_core::{Config, Database, Payload, RequestAction, Response, Section, SomaRuntime};

/// How long helpers wait for asynchronous state.
const PATIENCE: Duration = Duration::from_secs(10);

/// Seeded database plus a running runtime.
pub struct TestContext {
    pub runtime: SomaRuntime,
    pub db: Database,
    pub team_id: Uuid,
    pub admin_id: Uuid,
    pub user_id: Uuid,
    pub server_id: Uuid,
    pub node_id: Uuid,
    pub node_asset_id: i64,
    pub monitoring_id: Uuid,
    pub capability_id: Uuid,
    _temp_dir: tempfile::TempDir,
}

/// Configuration tuned for tests: no shutdown delay, no background sweeps.
pub fn test_config() -> Config {
    Config {
        shutdown_delay: Duration::ZERO,
        stop_grace: Duration::from_secs(2),
        lifecycle_interval: Duration::from_secs(3600),
        ..Config::default()
    }
}

impl TestContext {
    /// Create a context with the default test configuration.
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    /// Create a context with a custom configuration.
    pub async fn with_config(config: Config) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("temp dir");
        let db = Database::open(temp_dir.path().join("soma.db"))
            .await
            .expect("open database");

        let team_id = Uuid::new_v4();
        let admin_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let server_id = Uuid::new_v4();
        let node_id = Uuid::new_v4();
        let monitoring_id = Uuid::new_v4();
        let capability_id = Uuid::new_v4();
        let node_asset_id = 42;
        seed(
            &db,
            team_id,
            admin_id,
            user_id,
            server_id,
            node_id,
            node_asset_id,
            monitoring_id,
            capability_id,
        )
        .await;

        let runtime = SomaRuntime::builder()
            .config(config)
            .database(db.clone())
            .build()
            .expect("build runtime")
            .start()
            .await
            .expect("start runtime");

        Self {
            runtime,
            db,
            team_id,
            admin_id,
            user_id,
            server_id,
            node_id,
            node_asset_id,
            monitoring_id,
            capability_id,
            _temp_dir: temp_dir,
        }
    }

    /// Shut the runtime down and start a fresh one on the same database file.
    pub async fn restart(self) -> Self {
        let Self {
            runtime,
            db: _,
            team_id,
            admin_id,
            user_id,
            server_id,
            node_id,
            node_asset_id,
            monitoring_id,
            capability_id,
            _temp_dir,
        } = self;
        let config = runtime.context().config.as_ref().clone();
        runtime.shutdown().await.expect("shutdown");

        let db = Database::open(_temp_dir.path().join("soma.db"))
            .await
            .expect("reopen database");
        let runtime = SomaRuntime::builder()
            .config(config)
            .database(db.clone())
            .build()
            .expect("build runtime")
            .start()
            .await
            .expect("start runtime");
        Self {
            runtime,
            db,
            team_id,
            admin_id,
            user_id,
            server_id,
            node_id,
            node_asset_id,
            monitoring_id,
            capability_id,
            _temp_dir,
        }
    }

    /// Dispatch a request as the admin user.
    pub async fn admin(&self, section: Section, action: RequestAction, payload: Payload) -> Response {
        self.runtime
            .request(section, action, self.admin_id, payload)
            .await
    }

    /// Dispatch a request as the regular user.
    pub async fn user(&self, section: Section, action: RequestAction, payload: Payload) -> Response {
        self.runtime
            .request(section, action, self.user_id, payload)
            .await
    }

    /// Wait for a job through JobBlock and return its record.
    pub async fn wait_job(&self, job_id: Uuid) -> Value {
        let query = || {
            Payload::Job(JobQuery {
                job_id: Some(job_id),
                repository_id: None,
            })
        };
        let waited = tokio::time::timeout(
            PATIENCE,
            self.admin(Section::Job, RequestAction::Wait, query()),
        )
        .await
        .expect("job wait timed out");
        assert!(waited.is_ok(), "job wait failed: {:?}", waited);
        assert_eq!(waited.body["state"], "released", "job {} not released", job_id);

        let shown = self.admin(Section::Job, RequestAction::Show, query()).await;
        assert!(shown.is_ok(), "job show failed: {:?}", shown);
        shown.body
    }

    /// Run an admitted mutation to completion and assert it succeeded.
    pub async fn run_job(&self, section: Section, action: RequestAction, payload: Payload) -> Value {
        let accepted = self.admin(section, action, payload).await;
        assert!(accepted.is_ok(), "{} {} rejected: {:?}", section, action, accepted);
        let job_id = accepted.job_id.expect("accepted response carries a job id");
        let job = self.wait_job(job_id).await;
        assert_eq!(job["status"], "success", "job failed: {}", job);
        job
    }

    /// Block until the repository's keeper reports `ready`.
    pub async fn wait_ready(&self, repository_id: Uuid) {
        let deadline = tokio::time::Instant::now() + PATIENCE;
        loop {
            let shown = self
                .admin(
                    Section::Repository,
                    RequestAction::Show,
                    Payload::Repository(RepositoryRequest {
                        id: Some(repository_id),
                        ..Default::default()
                    }),
                )
                .await;
            if shown.is_ok() && shown.body["keeper"] == "ready" {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "keeper of {} never became ready: {:?}",
                repository_id,
                shown
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Create a repository and wait for its keeper.
    pub async fn create_repository(&self, name: &str) -> Uuid {
        let created = self
            .admin(
                Section::Repository,
                RequestAction::Create,
                Payload::Repository(RepositoryRequest {
                    id: None,
                    name: name.to_string(),
                    team_id: None,
                }),
            )
            .await;
        assert!(created.is_ok(), "repository create failed: {:?}", created);
        let id: Uuid = serde_json::from_value(created.body["id"].clone()).expect("repository id");
        self.wait_ready(id).await;
        id
    }

    /// Create a bucket and return its id.
    pub async fn create_bucket(&self, repository_id: Uuid, name: &str) -> Uuid {
        self.run_job(
            Section::Bucket,
            RequestAction::Create,
            Payload::Bucket(BucketRequest {
                id: None,
                name: name.to_string(),
                repository_id: Some(repository_id),
                environment: "prod".to_string(),
                team_id: None,
            }),
        )
        .await;
        let (id,): (Uuid,) =
            sqlx::query_as("SELECT id FROM buckets WHERE name = ? AND is_deleted = 0")
                .bind(name)
                .fetch_one(self.db.pool())
                .await
                .expect("bucket row");
        id
    }

    /// Assign the fixture node to a bucket.
    pub async fn assign_node(&self, bucket_id: Uuid) {
        self.run_job(
            Section::NodeConfig,
            RequestAction::Assign,
            Payload::NodeConfig(NodeConfigRequest {
                node_id: self.node_id,
                bucket_id,
                repository_id: None,
            }),
        )
        .await;
    }

    /// Check configuration request on the fixture node.
    pub fn node_check(&self, repository_id: Uuid, name: &str, interval: u64) -> CheckConfigRequest {
        CheckConfigRequest {
            id: None,
            name: name.to_string(),
            repository_id,
            bucket_id: None,
            object: ObjectRef::new(ObjectKind::Node, self.node_id),
            capability_id: self.capability_id,
            interval,
            enabled: true,
            inheritance: true,
            children_only: false,
            external_id: String::new(),
            thresholds: vec![ThresholdSpec {
                predicate: ">".to_string(),
                level: "warning".to_string(),
                value: 4,
            }],
            constraints: Vec::new(),
        }
    }

    /// Create a check configuration and return its id.
    pub async fn create_check(&self, request: CheckConfigRequest) -> Uuid {
        let name = request.name.clone();
        let object_id = request.object.id;
        self.run_job(
            Section::CheckConfig,
            RequestAction::Create,
            Payload::CheckConfig(request),
        )
        .await;
        let (id,): (Uuid,) = sqlx::query_as(
            "SELECT id FROM check_configurations WHERE name = ? AND object_id = ? AND is_deleted = 0",
        )
        .bind(name)
        .bind(object_id)
        .fetch_one(self.db.pool())
        .await
        .expect("check configuration row");
        id
    }

    /// Live check instances on an object.
    pub async fn instances_on(&self, object_id: Uuid) -> Vec<Uuid> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM check_instances WHERE object_id = ? AND is_deleted = 0 ORDER BY id",
        )
        .bind(object_id)
        .fetch_all(self.db.pool())
        .await
        .expect("check instances");
        rows.into_iter().map(|(id,)| id).collect()
    }

    /// Status of every configuration row of an instance, oldest first.
    pub async fn row_statuses(&self, check_instance_id: Uuid) -> Vec<String> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT status FROM check_instance_configurations WHERE check_instance_id = ? ORDER BY version",
        )
        .bind(check_instance_id)
        .fetch_all(self.db.pool())
        .await
        .expect("configuration rows");
        rows.into_iter().map(|(status,)| status).collect()
    }

    /// Stored version of a check instance, deleted or not.
    pub async fn instance_version(&self, check_instance_id: Uuid) -> i64 {
        let (version,): (i64,) =
            sqlx::query_as("SELECT version FROM check_instances WHERE id = ?")
                .bind(check_instance_id)
                .fetch_one(self.db.pool())
                .await
                .expect("check instance row");
        version
    }
}

#[allow(clippy::too_many_arguments)]
async fn seed(
    db: &Database,
    team_id: Uuid,
    admin_id: Uuid,
    user_id: Uuid,
    server_id: Uuid,
    node_id: Uuid,
    node_asset_id: i64,
    monitoring_id: Uuid,
    capability_id: Uuid,
) {
    let pool = db.pool();

    sqlx::query("INSERT INTO teams (id, name) VALUES (?, 'ops')")
        .bind(team_id)
        .execute(pool)
        .await
        .expect("team");
    for (id, name, admin) in [(admin_id, "root", true), (user_id, "jane", false)] {
        sqlx::query("INSERT INTO users (id, name, team_id, is_active, is_admin) VALUES (?, ?, ?, 1, ?)")
            .bind(id)
            .bind(name)
            .bind(team_id)
            .bind(admin)
            .execute(pool)
            .await
            .expect("user");
    }
    sqlx::query("INSERT INTO datacenters (name, is_default) VALUES ('dc1', 1)")
        .execute(pool)
        .await
        .expect("datacenter");
    sqlx::query("INSERT INTO servers (id, asset_id, name, datacenter) VALUES (?, 1001, 'srv1', 'dc1')")
        .bind(server_id)
        .execute(pool)
        .await
        .expect("server");
    sqlx::query(
        r#"
        INSERT INTO nodes (id, asset_id, name, team_id, server_id, object_state, created_at)
        VALUES (?, ?, 'n1', ?, ?, 'unassigned', ?)
        "#,
    )
    .bind(node_id)
    .bind(node_asset_id)
    .bind(team_id)
    .bind(server_id)
    .bind(Utc::now())
    .execute(pool)
    .await
    .expect("node");
    sqlx::query("INSERT INTO monitoring_systems (id, name, team_id) VALUES (?, 'm1', ?)")
        .bind(monitoring_id)
        .bind(team_id)
        .execute(pool)
        .await
        .expect("monitoring system");
    sqlx::query("INSERT INTO metrics (path, unit, description) VALUES ('cpu.load', 'load', 'CPU load')")
        .execute(pool)
        .await
        .expect("metric");
    sqlx::query(
        "INSERT INTO capabilities (id, monitoring_id, metric, view, threshold_amount) VALUES (?, ?, 'cpu.load', 'internal', 3)",
    )
    .bind(capability_id)
    .bind(monitoring_id)
    .execute(pool)
    .await
    .expect("capability");
}
