// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persisted mutation jobs.
//!
//! GuidePost records every admitted mutation as a `queued` job carrying the
//! fully filled [`JobSpec`]; the owning TreeKeeper moves it through
//! `in_progress` to `success` or `failed`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use soma_tree::{CheckSpec, Constraint, NewElement, ObjectRef, PropertySpec};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::{Result, SomaError};
use crate::msg::ThresholdSpec;

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Admitted, waiting for the TreeKeeper.
    Queued,
    /// Being applied.
    InProgress,
    /// Applied and committed.
    Success,
    /// Rejected or rolled back; see the error text.
    Failed,
}

impl JobStatus {
    /// Database string.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A check configuration with every server-side field filled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckConfigDef {
    /// Configuration id.
    pub id: Uuid,
    /// Configuration name.
    pub name: String,
    /// Repository id.
    pub repository_id: Uuid,
    /// Bucket id when the target lives below the repository.
    pub bucket_id: Option<Uuid>,
    /// Target element.
    pub object: ObjectRef,
    /// Capability id.
    pub capability_id: Uuid,
    /// Capability view.
    pub view: String,
    /// Interval in seconds.
    pub interval: i64,
    /// Enabled flag.
    pub enabled: bool,
    /// Inheritance flag.
    pub inheritance: bool,
    /// Children-only flag.
    pub children_only: bool,
    /// External identifier.
    pub external_id: String,
    /// Thresholds.
    pub thresholds: Vec<ThresholdSpec>,
    /// Constraints.
    pub constraints: Vec<Constraint>,
}

impl CheckConfigDef {
    /// The tree-side view of the configuration.
    pub fn check_spec(&self) -> CheckSpec {
        CheckSpec {
            config_id: self.id,
            name: self.name.clone(),
            capability_id: self.capability_id,
            view: self.view.clone(),
            inheritance: self.inheritance,
            children_only: self.children_only,
            constraints: self.constraints.clone(),
        }
    }
}

/// The tree operation a job performs, with all authoritative fields filled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum JobSpec {
    /// Recorded by ForestCustodian; never sent to a TreeKeeper.
    RepositoryCreate { repository: NewElement },
    /// Bucket, group or cluster creation.
    Create {
        element: NewElement,
        parent: ObjectRef,
    },
    Destroy { object: ObjectRef },
    Rename { object: ObjectRef, name: String },
    MemberAssign { parent: ObjectRef, member: ObjectRef },
    MemberUnassign { parent: ObjectRef, member: ObjectRef },
    NodeAssign { node: NewElement, bucket_id: Uuid },
    NodeUnassign { node: ObjectRef },
    PropertyAdd { object: ObjectRef, property: PropertySpec },
    PropertyRemove {
        object: ObjectRef,
        source_instance_id: Uuid,
        view: String,
    },
    PropertyUpdate { object: ObjectRef, property: PropertySpec },
    CheckConfigCreate { config: CheckConfigDef },
    CheckConfigDestroy { config_id: Uuid, object: ObjectRef },
}

/// A mutation job as handed to a TreeKeeper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Job id.
    pub id: Uuid,
    /// `section::action`, e.g. `bucket::create`.
    pub job_type: String,
    /// Repository the job applies to.
    pub repository_id: Uuid,
    /// Requesting user.
    pub user_id: Uuid,
    /// Team of the requesting user.
    pub team_id: Uuid,
    /// The operation.
    pub spec: JobSpec,
}

/// A stored job row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRecord {
    /// Job id.
    pub id: Uuid,
    /// Status string.
    pub status: String,
    /// Job type.
    pub job_type: String,
    /// Global admission order.
    pub serial: i64,
    /// Repository id.
    pub repository_id: Uuid,
    /// Requesting user.
    pub user_id: Uuid,
    /// Requesting team.
    pub team_id: Uuid,
    /// Admission time.
    pub queued_at: DateTime<Utc>,
    /// Processing start.
    pub started_at: Option<DateTime<Utc>>,
    /// Processing end.
    pub finished_at: Option<DateTime<Utc>>,
    /// Error text of failed jobs.
    pub error: String,
    /// Serialized job.
    pub job: String,
}

impl JobRecord {
    /// JSON body for job show/list responses.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "status": self.status,
            "type": self.job_type,
            "serial": self.serial,
            "repository_id": self.repository_id,
            "user_id": self.user_id,
            "team_id": self.team_id,
            "queued_at": self.queued_at,
            "started_at": self.started_at,
            "finished_at": self.finished_at,
            "error": self.error,
            "job": serde_json::from_str::<Value>(&self.job).unwrap_or(Value::Null),
        })
    }
}

const JOB_COLUMNS: &str = "id, status, job_type, serial, repository_id, user_id, team_id, \
     queued_at, started_at, finished_at, error, job";

/// Record a job with the given status.
pub async fn insert(conn: &mut SqliteConnection, job: &Job, status: JobStatus) -> Result<()> {
    let now = Utc::now();
    let finished_at = matches!(status, JobStatus::Success | JobStatus::Failed).then_some(now);
    sqlx::query(
        r#"
        INSERT INTO jobs (id, status, job_type, serial, repository_id, user_id, team_id,
                          queued_at, started_at, finished_at, job)
        VALUES (?, ?, ?, (SELECT COALESCE(MAX(serial), 0) + 1 FROM jobs), ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(job.id)
    .bind(status.as_str())
    .bind(&job.job_type)
    .bind(job.repository_id)
    .bind(job.user_id)
    .bind(job.team_id)
    .bind(now)
    .bind(finished_at)
    .bind(finished_at)
    .bind(serde_json::to_string(job)?)
    .execute(conn)
    .await?;
    Ok(())
}

/// Move a queued job to `in_progress`.
pub async fn start(conn: &mut SqliteConnection, id: Uuid) -> Result<()> {
    sqlx::query("UPDATE jobs SET status = ?, started_at = ? WHERE id = ? AND status = ?")
        .bind(JobStatus::InProgress.as_str())
        .bind(Utc::now())
        .bind(id)
        .bind(JobStatus::Queued.as_str())
        .execute(conn)
        .await?;
    Ok(())
}

/// Finish a job as `success` or `failed` with an error text.
pub async fn finish(conn: &mut SqliteConnection, id: Uuid, error: Option<&str>) -> Result<()> {
    let status = if error.is_some() {
        JobStatus::Failed
    } else {
        JobStatus::Success
    };
    sqlx::query("UPDATE jobs SET status = ?, finished_at = ?, error = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(error.unwrap_or(""))
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Fetch one job.
pub async fn get(pool: &SqlitePool, id: Uuid) -> Result<JobRecord> {
    sqlx::query_as::<_, JobRecord>(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| SomaError::not_found(format!("job {}", id)))
}

/// Jobs in admission order, optionally restricted to one repository.
pub async fn list(pool: &SqlitePool, repository_id: Option<Uuid>) -> Result<Vec<JobRecord>> {
    let jobs = match repository_id {
        Some(repository_id) => {
            sqlx::query_as::<_, JobRecord>(&format!(
                "SELECT {} FROM jobs WHERE repository_id = ? ORDER BY serial",
                JOB_COLUMNS
            ))
            .bind(repository_id)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, JobRecord>(&format!(
                "SELECT {} FROM jobs ORDER BY serial",
                JOB_COLUMNS
            ))
            .fetch_all(pool)
            .await?
        }
    };
    Ok(jobs)
}

/// Ids of jobs still queued for a repository, in admission order.
pub async fn queued(pool: &SqlitePool, repository_id: Uuid) -> Result<Vec<Job>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT job FROM jobs WHERE repository_id = ? AND status IN (?, ?) ORDER BY serial",
    )
    .bind(repository_id)
    .bind(JobStatus::Queued.as_str())
    .bind(JobStatus::InProgress.as_str())
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|(job,)| serde_json::from_str(&job).map_err(SomaError::from))
        .collect()
}
