// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! GuidePost: admission of tree mutations.
//!
//! Each mutation request is validated against the database, filled with its
//! authoritative server-side fields (fresh ids, registry data, capability
//! views, team service attributes), recorded as a `queued` job and handed to
//! the repository's TreeKeeper. The caller receives the job id at once and
//! can wait for the outcome through JobBlock.

use serde_json::json;
use soma_tree::{
    Constraint, ElementDetail, NewElement, ObjectKind, ObjectRef, PropertySpec, PropertyValue,
    ServiceAttribute,
};
use sqlx::SqlitePool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, SomaError};
use crate::handler::{self, Handler, HandlerContext, Serve};
use crate::job::{self, CheckConfigDef, Job, JobSpec, JobStatus};
use crate::msg::{
    BucketRequest, CheckConfigRequest, ContainerRequest, NodeConfigRequest, Payload,
    PropertyRequest, RepositoryRequest, RequestAction, RequestHead, Response, Section,
    ThresholdSpec,
};
use crate::supervisor::{self, User};

/// Native constraint attributes.
const NATIVE_ATTRIBUTES: [&str; 3] = ["object_type", "object_state", "environment"];

/// Spawn GuidePost.
pub fn spawn(ctx: &HandlerContext) -> Handler {
    let shared = ctx.clone();
    handler::spawn_service(ctx, handler::GUIDEPOST, Serve::Serial, move |head| {
        let ctx = shared.clone();
        async move { admit(&ctx, head).await }
    })
}

/// Validate, fill, record and forward one mutation.
pub async fn admit(ctx: &HandlerContext, head: RequestHead) -> Result<Response> {
    if ctx.config.observer {
        return Err(SomaError::Unavailable(
            "mutations are disabled in observer mode".to_string(),
        ));
    }
    let pool = ctx.db.pool();
    let user = supervisor::active_user(pool, head.user_id).await?;
    let job_type = format!("{}::{}", head.section, head.action);
    let (repository_id, spec) = fill(pool, &user, head.section, head.action, head.payload).await?;

    let keeper = ctx.handlers.keeper_for(repository_id).ok_or_else(|| {
        SomaError::Unavailable(format!("no TreeKeeper for repository {}", repository_id))
    })?;
    let Some(handle) = keeper.keeper() else {
        return Err(SomaError::invariant(format!(
            "handler {} is not a TreeKeeper",
            keeper.name()
        )));
    };
    handle.ensure_accepting()?;

    let job = Job {
        id: head.job_id.unwrap_or_else(Uuid::new_v4),
        job_type,
        repository_id,
        user_id: user.id,
        team_id: user.team_id,
        spec,
    };
    let mut tx = ctx.db.begin_write().await?;
    job::insert(tx.conn(), &job, JobStatus::Queued).await?;
    tx.commit().await?;

    if let Err(e) = handle.submit(job.clone()).await {
        warn!(job_id = %job.id, error = %e, "TreeKeeper refused admitted job");
        let mut tx = ctx.db.begin_write().await?;
        job::finish(tx.conn(), job.id, Some(&e.to_string())).await?;
        tx.commit().await?;
        ctx.notify_job_done(job.id).await;
        return Err(e);
    }

    debug!(job_id = %job.id, job_type = %job.job_type, "Job admitted");
    Ok(Response::accepted(
        job.id,
        json!({
            "job_id": job.id,
            "type": job.job_type,
            "repository_id": repository_id,
        }),
    ))
}

/// Turn a request into the repository it targets and a fully filled job.
async fn fill(
    pool: &SqlitePool,
    user: &User,
    section: Section,
    action: RequestAction,
    payload: Payload,
) -> Result<(Uuid, JobSpec)> {
    use RequestAction as A;

    match (section, action, payload) {
        (Section::Repository, A::Rename, Payload::Repository(request)) => {
            rename_repository(pool, request).await
        }
        (Section::Bucket, A::Create, Payload::Bucket(request)) => {
            create_bucket(pool, user, request).await
        }
        (Section::Bucket, A::Destroy | A::Rename, Payload::Bucket(request)) => {
            let id = request
                .id
                .ok_or_else(|| SomaError::validation("bucket id required"))?;
            let object = ObjectRef::new(ObjectKind::Bucket, id);
            let located = locate(pool, object).await?;
            let spec = if action == A::Destroy {
                JobSpec::Destroy { object }
            } else {
                let prefix = format!("{}_", located.repository_name);
                if !request.name.starts_with(&prefix) {
                    return Err(SomaError::validation(format!(
                        "bucket name '{}' must start with '{}'",
                        request.name, prefix
                    )));
                }
                JobSpec::Rename {
                    object,
                    name: request.name,
                }
            };
            Ok((located.repository_id, spec))
        }
        (Section::Group | Section::Cluster, _, Payload::Container(request))
            if !matches!(action, A::Add | A::Remove | A::Update) =>
        {
            container(pool, user, section, action, request).await
        }
        (Section::NodeConfig, A::Assign, Payload::NodeConfig(request)) => {
            assign_node(pool, request).await
        }
        (Section::NodeConfig, A::Unassign, Payload::NodeConfig(request)) => {
            unassign_node(pool, request).await
        }
        (
            Section::Repository
            | Section::Bucket
            | Section::Group
            | Section::Cluster
            | Section::NodeConfig,
            A::Add | A::Remove | A::Update,
            Payload::Property(request),
        ) => property(pool, section, action, request).await,
        (Section::CheckConfig, A::Create, Payload::CheckConfig(request)) => {
            create_check_config(pool, request).await
        }
        (Section::CheckConfig, A::Destroy, Payload::CheckConfig(request)) => {
            destroy_check_config(pool, request).await
        }
        (section, action, _) => Err(SomaError::validation(format!(
            "{} {} needs a matching payload",
            section, action
        ))),
    }
}

// ----------------------------------------------------------------------------
// Lookups
// ----------------------------------------------------------------------------

/// Where an element lives and who owns it.
#[derive(Debug, Clone)]
struct Located {
    repository_id: Uuid,
    repository_name: String,
    bucket_id: Option<Uuid>,
    team_id: Uuid,
}

async fn locate(pool: &SqlitePool, object: ObjectRef) -> Result<Located> {
    let sql = match object.kind {
        ObjectKind::Repository => {
            r#"
            SELECT r.id, r.name, NULL AS bucket_id, r.team_id
            FROM repositories r
            WHERE r.id = ? AND r.is_deleted = 0
            "#
        }
        ObjectKind::Bucket => {
            r#"
            SELECT r.id, r.name, b.id AS bucket_id, b.team_id
            FROM buckets b JOIN repositories r ON r.id = b.repository_id
            WHERE b.id = ? AND b.is_deleted = 0
            "#
        }
        ObjectKind::Group => {
            r#"
            SELECT r.id, r.name, g.bucket_id, g.team_id
            FROM groups g
            JOIN buckets b ON b.id = g.bucket_id
            JOIN repositories r ON r.id = b.repository_id
            WHERE g.id = ?
            "#
        }
        ObjectKind::Cluster => {
            r#"
            SELECT r.id, r.name, c.bucket_id, c.team_id
            FROM clusters c
            JOIN buckets b ON b.id = c.bucket_id
            JOIN repositories r ON r.id = b.repository_id
            WHERE c.id = ?
            "#
        }
        ObjectKind::Node => {
            r#"
            SELECT r.id, r.name, a.bucket_id, n.team_id
            FROM nodes n
            JOIN node_bucket_assignment a ON a.node_id = n.id
            JOIN repositories r ON r.id = a.repository_id
            WHERE n.id = ? AND n.is_deleted = 0
            "#
        }
        ObjectKind::Root | ObjectKind::Fault => {
            return Err(SomaError::validation(format!(
                "{} is not addressable",
                object.kind
            )));
        }
    };
    let row: Option<(Uuid, String, Option<Uuid>, Uuid)> = sqlx::query_as(sql)
        .bind(object.id)
        .fetch_optional(pool)
        .await?;
    let (repository_id, repository_name, bucket_id, team_id) =
        row.ok_or_else(|| SomaError::not_found(object.to_string()))?;
    Ok(Located {
        repository_id,
        repository_name,
        bucket_id,
        team_id,
    })
}

async fn exists(pool: &SqlitePool, sql: &str, value: &str) -> Result<bool> {
    let (count,): (i64,) = sqlx::query_as(sql).bind(value).fetch_one(pool).await?;
    Ok(count > 0)
}

fn require_name(name: &str, what: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(SomaError::validation(format!("{} name required", what)));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Structure
// ----------------------------------------------------------------------------

async fn rename_repository(pool: &SqlitePool, request: RepositoryRequest) -> Result<(Uuid, JobSpec)> {
    let id = request
        .id
        .ok_or_else(|| SomaError::validation("repository id required"))?;
    require_name(&request.name, "repository")?;
    let object = ObjectRef::new(ObjectKind::Repository, id);
    let located = locate(pool, object).await?;
    if exists(
        pool,
        "SELECT COUNT(*) FROM repositories WHERE name = ? AND is_deleted = 0",
        &request.name,
    )
    .await?
    {
        return Err(SomaError::validation(format!(
            "repository {} already exists",
            request.name
        )));
    }
    Ok((
        located.repository_id,
        JobSpec::Rename {
            object,
            name: request.name,
        },
    ))
}

async fn create_bucket(
    pool: &SqlitePool,
    user: &User,
    request: BucketRequest,
) -> Result<(Uuid, JobSpec)> {
    let repository_id = request
        .repository_id
        .ok_or_else(|| SomaError::validation("repository id required"))?;
    require_name(&request.name, "bucket")?;
    let parent = ObjectRef::new(ObjectKind::Repository, repository_id);
    let located = locate(pool, parent).await?;

    let prefix = format!("{}_", located.repository_name);
    if !request.name.starts_with(&prefix) {
        return Err(SomaError::validation(format!(
            "bucket name '{}' must start with '{}'",
            request.name, prefix
        )));
    }
    if !exists(
        pool,
        "SELECT COUNT(*) FROM environments WHERE name = ?",
        &request.environment,
    )
    .await?
    {
        return Err(SomaError::validation(format!(
            "unknown environment '{}'",
            request.environment
        )));
    }
    if exists(
        pool,
        "SELECT COUNT(*) FROM buckets WHERE name = ? AND is_deleted = 0",
        &request.name,
    )
    .await?
    {
        return Err(SomaError::validation(format!(
            "bucket {} already exists",
            request.name
        )));
    }

    let element = NewElement {
        id: Uuid::new_v4(),
        name: request.name,
        team_id: request.team_id.unwrap_or(user.team_id),
        detail: ElementDetail::Bucket {
            environment: request.environment,
            frozen: false,
        },
    };
    Ok((repository_id, JobSpec::Create { element, parent }))
}

fn container_kind(section: Section) -> ObjectKind {
    if section == Section::Cluster {
        ObjectKind::Cluster
    } else {
        ObjectKind::Group
    }
}

async fn container(
    pool: &SqlitePool,
    user: &User,
    section: Section,
    action: RequestAction,
    request: ContainerRequest,
) -> Result<(Uuid, JobSpec)> {
    let kind = container_kind(section);
    let table = if kind == ObjectKind::Cluster {
        "clusters"
    } else {
        "groups"
    };

    if action == RequestAction::Create {
        require_name(&request.name, kind.as_str())?;
        let parent = ObjectRef::new(ObjectKind::Bucket, request.bucket_id);
        let located = locate(pool, parent).await?;
        let (taken,): (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM {} WHERE bucket_id = ? AND name = ?",
            table
        ))
        .bind(request.bucket_id)
        .bind(&request.name)
        .fetch_one(pool)
        .await?;
        if taken > 0 {
            return Err(SomaError::validation(format!(
                "{} {} already exists in bucket",
                kind, request.name
            )));
        }
        let detail = if kind == ObjectKind::Cluster {
            ElementDetail::Cluster
        } else {
            ElementDetail::Group
        };
        let element = NewElement {
            id: Uuid::new_v4(),
            name: request.name,
            team_id: request.team_id.unwrap_or(user.team_id),
            detail,
        };
        return Ok((located.repository_id, JobSpec::Create { element, parent }));
    }

    let id = request
        .id
        .ok_or_else(|| SomaError::validation(format!("{} id required", kind)))?;
    let object = ObjectRef::new(kind, id);
    let located = locate(pool, object).await?;
    if located.bucket_id != Some(request.bucket_id) {
        return Err(SomaError::validation(format!(
            "{} does not live in bucket {}",
            object, request.bucket_id
        )));
    }

    let spec = match action {
        RequestAction::Destroy => JobSpec::Destroy { object },
        RequestAction::Rename => {
            require_name(&request.name, kind.as_str())?;
            JobSpec::Rename {
                object,
                name: request.name,
            }
        }
        RequestAction::MemberAssign | RequestAction::MemberUnassign => {
            let member = request
                .member
                .ok_or_else(|| SomaError::validation("member required"))?;
            let allowed = match kind {
                ObjectKind::Cluster => member.kind == ObjectKind::Node,
                _ => matches!(
                    member.kind,
                    ObjectKind::Group | ObjectKind::Cluster | ObjectKind::Node
                ),
            };
            if !allowed {
                return Err(SomaError::validation(format!(
                    "{} cannot be a member of a {}",
                    member.kind, kind
                )));
            }
            let member_located = locate(pool, member).await?;
            if member_located.bucket_id != located.bucket_id {
                return Err(SomaError::validation(format!(
                    "{} and {} live in different buckets",
                    member, object
                )));
            }
            if action == RequestAction::MemberAssign {
                JobSpec::MemberAssign {
                    parent: object,
                    member,
                }
            } else {
                JobSpec::MemberUnassign {
                    parent: object,
                    member,
                }
            }
        }
        other => {
            return Err(SomaError::validation(format!(
                "{} {} not supported",
                kind, other
            )));
        }
    };
    Ok((located.repository_id, spec))
}

#[derive(Debug, sqlx::FromRow)]
struct RegistryNode {
    name: String,
    asset_id: i64,
    team_id: Uuid,
    server_id: Uuid,
    is_online: bool,
}

async fn assign_node(pool: &SqlitePool, request: NodeConfigRequest) -> Result<(Uuid, JobSpec)> {
    let node = sqlx::query_as::<_, RegistryNode>(
        "SELECT name, asset_id, team_id, server_id, is_online FROM nodes WHERE id = ? AND is_deleted = 0",
    )
    .bind(request.node_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| SomaError::not_found(format!("node {}", request.node_id)))?;

    let assigned: Option<(Uuid,)> =
        sqlx::query_as("SELECT bucket_id FROM node_bucket_assignment WHERE node_id = ?")
            .bind(request.node_id)
            .fetch_optional(pool)
            .await?;
    if let Some((bucket_id,)) = assigned {
        return Err(SomaError::validation(format!(
            "node {} is already assigned to bucket {}, unassign it first",
            node.name, bucket_id
        )));
    }

    let bucket = locate(pool, ObjectRef::new(ObjectKind::Bucket, request.bucket_id)).await?;
    if let Some(repository_id) = request.repository_id
        && repository_id != bucket.repository_id
    {
        return Err(SomaError::validation(format!(
            "bucket {} is not part of repository {}",
            request.bucket_id, repository_id
        )));
    }
    let asset_id = u64::try_from(node.asset_id)
        .map_err(|_| SomaError::invariant(format!("node {} has a negative asset id", node.name)))?;

    let element = NewElement {
        id: request.node_id,
        name: node.name,
        team_id: node.team_id,
        detail: ElementDetail::Node {
            asset_id,
            server_id: node.server_id,
            online: node.is_online,
        },
    };
    Ok((
        bucket.repository_id,
        JobSpec::NodeAssign {
            node: element,
            bucket_id: request.bucket_id,
        },
    ))
}

async fn unassign_node(pool: &SqlitePool, request: NodeConfigRequest) -> Result<(Uuid, JobSpec)> {
    let node = ObjectRef::new(ObjectKind::Node, request.node_id);
    let located = locate(pool, node).await?;
    if located.bucket_id != Some(request.bucket_id) {
        return Err(SomaError::validation(format!(
            "node {} is not assigned to bucket {}",
            request.node_id, request.bucket_id
        )));
    }
    Ok((located.repository_id, JobSpec::NodeUnassign { node }))
}

// ----------------------------------------------------------------------------
// Properties
// ----------------------------------------------------------------------------

fn section_kinds(section: Section) -> &'static [ObjectKind] {
    match section {
        Section::Repository => &[ObjectKind::Repository],
        Section::Bucket => &[ObjectKind::Bucket],
        Section::Group => &[ObjectKind::Group],
        Section::Cluster => &[ObjectKind::Cluster],
        Section::NodeConfig => &[ObjectKind::Node],
        _ => &[],
    }
}

async fn property(
    pool: &SqlitePool,
    section: Section,
    action: RequestAction,
    request: PropertyRequest,
) -> Result<(Uuid, JobSpec)> {
    let object = request.object;
    if !section_kinds(section).contains(&object.kind) {
        return Err(SomaError::validation(format!(
            "{} properties cannot be set through {}",
            object.kind, section
        )));
    }
    let located = locate(pool, object).await?;

    let spec = match action {
        RequestAction::Add => JobSpec::PropertyAdd {
            object,
            property: property_spec(pool, &located, Uuid::new_v4(), request).await?,
        },
        RequestAction::Remove => {
            let source_instance_id = request
                .source_instance_id
                .ok_or_else(|| SomaError::validation("source instance id required"))?;
            let view = source_view(pool, object, source_instance_id).await?;
            JobSpec::PropertyRemove {
                object,
                source_instance_id,
                view,
            }
        }
        RequestAction::Update => {
            let source_instance_id = request
                .source_instance_id
                .ok_or_else(|| SomaError::validation("source instance id required"))?;
            source_view(pool, object, source_instance_id).await?;
            JobSpec::PropertyUpdate {
                object,
                property: property_spec(pool, &located, source_instance_id, request).await?,
            }
        }
        other => {
            return Err(SomaError::validation(format!(
                "property {} not supported",
                other
            )));
        }
    };
    Ok((located.repository_id, spec))
}

/// View of a locally set property.
async fn source_view(pool: &SqlitePool, object: ObjectRef, source_instance_id: Uuid) -> Result<String> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        SELECT view FROM property_instances
        WHERE instance_id = ? AND object_id = ? AND inherited_from IS NULL
        "#,
    )
    .bind(source_instance_id)
    .bind(object.id)
    .fetch_optional(pool)
    .await?;
    row.map(|(view,)| view).ok_or_else(|| {
        SomaError::not_found(format!("property {} on {}", source_instance_id, object))
    })
}

async fn property_spec(
    pool: &SqlitePool,
    located: &Located,
    source_instance_id: Uuid,
    request: PropertyRequest,
) -> Result<PropertySpec> {
    if !exists(pool, "SELECT COUNT(*) FROM views WHERE name = ?", &request.view).await? {
        return Err(SomaError::validation(format!(
            "unknown view '{}'",
            request.view
        )));
    }
    let mut value = fill_value(pool, located, request.value).await?;
    value.canonicalize();
    Ok(PropertySpec {
        source_instance_id,
        view: request.view,
        inheritance: request.inheritance,
        children_only: request.children_only,
        value,
    })
}

/// Replace client-supplied property details with the stored ones.
async fn fill_value(pool: &SqlitePool, located: &Located, value: PropertyValue) -> Result<PropertyValue> {
    match value {
        PropertyValue::System { name, value } => {
            if !exists(
                pool,
                "SELECT COUNT(*) FROM system_properties WHERE name = ?",
                &name,
            )
            .await?
            {
                return Err(SomaError::validation(format!(
                    "unknown system property '{}'",
                    name
                )));
            }
            Ok(PropertyValue::System { name, value })
        }
        PropertyValue::Custom {
            custom_id, value, ..
        } => {
            let name = custom_name(pool, located.repository_id, custom_id).await?;
            Ok(PropertyValue::Custom {
                custom_id,
                name,
                value,
            })
        }
        PropertyValue::Service { name, .. } => {
            let rows: Vec<(String, String)> = sqlx::query_as(
                r#"
                SELECT attribute, value FROM team_service_property_attributes
                WHERE team_id = ? AND service = ?
                ORDER BY attribute, value
                "#,
            )
            .bind(located.team_id)
            .bind(&name)
            .fetch_all(pool)
            .await?;
            let (defined,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM team_service_properties WHERE team_id = ? AND name = ?",
            )
            .bind(located.team_id)
            .bind(&name)
            .fetch_one(pool)
            .await?;
            if defined == 0 {
                return Err(SomaError::not_found(format!(
                    "service '{}' of team {}",
                    name, located.team_id
                )));
            }
            let attributes = rows
                .into_iter()
                .map(|(attribute, value)| ServiceAttribute::new(attribute, value))
                .collect();
            Ok(PropertyValue::Service { name, attributes })
        }
        PropertyValue::Oncall { oncall_id, .. } => {
            let row: Option<(String, String)> = sqlx::query_as(
                "SELECT name, phone_number FROM oncall_duty_teams WHERE id = ?",
            )
            .bind(oncall_id)
            .fetch_optional(pool)
            .await?;
            let (name, number) =
                row.ok_or_else(|| SomaError::not_found(format!("oncall duty {}", oncall_id)))?;
            Ok(PropertyValue::Oncall {
                oncall_id,
                name,
                number,
            })
        }
    }
}

async fn custom_name(pool: &SqlitePool, repository_id: Uuid, custom_id: Uuid) -> Result<String> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT name FROM custom_properties WHERE id = ? AND repository_id = ?")
            .bind(custom_id)
            .bind(repository_id)
            .fetch_optional(pool)
            .await?;
    row.map(|(name,)| name)
        .ok_or_else(|| SomaError::not_found(format!("custom property {}", custom_id)))
}

// ----------------------------------------------------------------------------
// Check configurations
// ----------------------------------------------------------------------------

/// Threshold list checks that need no database.
fn check_thresholds(thresholds: &[ThresholdSpec], allowed: i64) -> Result<()> {
    if thresholds.is_empty() {
        return Err(SomaError::validation("at least one threshold required"));
    }
    if thresholds.len() as i64 > allowed {
        return Err(SomaError::validation(format!(
            "capability allows {} threshold(s), {} given",
            allowed,
            thresholds.len()
        )));
    }
    for (i, threshold) in thresholds.iter().enumerate() {
        if thresholds[..i].iter().any(|t| t.level == threshold.level) {
            return Err(SomaError::validation(format!(
                "duplicate threshold level '{}'",
                threshold.level
            )));
        }
    }
    Ok(())
}

async fn create_check_config(
    pool: &SqlitePool,
    request: CheckConfigRequest,
) -> Result<(Uuid, JobSpec)> {
    require_name(&request.name, "check configuration")?;
    if request.interval == 0 {
        return Err(SomaError::validation("interval must be positive"));
    }
    let interval = i64::try_from(request.interval)
        .map_err(|_| SomaError::validation("interval out of range"))?;

    let located = locate(pool, request.object).await?;
    if located.repository_id != request.repository_id {
        return Err(SomaError::validation(format!(
            "{} is not part of repository {}",
            request.object, request.repository_id
        )));
    }

    let capability: Option<(String, i64)> =
        sqlx::query_as("SELECT view, threshold_amount FROM capabilities WHERE id = ?")
            .bind(request.capability_id)
            .fetch_optional(pool)
            .await?;
    let (view, threshold_amount) = capability
        .ok_or_else(|| SomaError::not_found(format!("capability {}", request.capability_id)))?;

    let (taken,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM check_configurations
        WHERE repository_id = ? AND object_id = ? AND name = ? AND is_deleted = 0
        "#,
    )
    .bind(request.repository_id)
    .bind(request.object.id)
    .bind(&request.name)
    .fetch_one(pool)
    .await?;
    if taken > 0 {
        return Err(SomaError::validation(format!(
            "check configuration {} already exists on {}",
            request.name, request.object
        )));
    }

    check_thresholds(&request.thresholds, threshold_amount)?;
    for threshold in &request.thresholds {
        if !exists(
            pool,
            "SELECT COUNT(*) FROM predicates WHERE symbol = ?",
            &threshold.predicate,
        )
        .await?
        {
            return Err(SomaError::validation(format!(
                "unknown predicate '{}'",
                threshold.predicate
            )));
        }
        if !exists(pool, "SELECT COUNT(*) FROM levels WHERE name = ?", &threshold.level).await? {
            return Err(SomaError::validation(format!(
                "unknown level '{}'",
                threshold.level
            )));
        }
    }

    let mut constraints = Vec::with_capacity(request.constraints.len());
    for constraint in request.constraints {
        constraints.push(fill_constraint(pool, &located, constraint).await?);
    }

    let config = CheckConfigDef {
        id: Uuid::new_v4(),
        name: request.name,
        repository_id: request.repository_id,
        bucket_id: located.bucket_id,
        object: request.object,
        capability_id: request.capability_id,
        view,
        interval,
        enabled: request.enabled,
        inheritance: request.inheritance,
        children_only: request.children_only,
        external_id: request.external_id,
        thresholds: request.thresholds,
        constraints,
    };
    Ok((located.repository_id, JobSpec::CheckConfigCreate { config }))
}

async fn fill_constraint(
    pool: &SqlitePool,
    located: &Located,
    constraint: Constraint,
) -> Result<Constraint> {
    match constraint {
        Constraint::Native { name, value } => {
            if !NATIVE_ATTRIBUTES.contains(&name.as_str()) {
                return Err(SomaError::validation(format!(
                    "unknown native attribute '{}'",
                    name
                )));
            }
            Ok(Constraint::Native { name, value })
        }
        Constraint::System { name, value } => {
            if !exists(
                pool,
                "SELECT COUNT(*) FROM system_properties WHERE name = ?",
                &name,
            )
            .await?
            {
                return Err(SomaError::validation(format!(
                    "unknown system property '{}'",
                    name
                )));
            }
            Ok(Constraint::System { name, value })
        }
        Constraint::Custom {
            custom_id, value, ..
        } => {
            let name = custom_name(pool, located.repository_id, custom_id).await?;
            Ok(Constraint::Custom {
                custom_id,
                name,
                value,
            })
        }
        Constraint::Oncall { oncall_id, .. } => {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT name FROM oncall_duty_teams WHERE id = ?")
                    .bind(oncall_id)
                    .fetch_optional(pool)
                    .await?;
            let (name,) =
                row.ok_or_else(|| SomaError::not_found(format!("oncall duty {}", oncall_id)))?;
            Ok(Constraint::Oncall { oncall_id, name })
        }
        Constraint::Service { name } => Ok(Constraint::Service { name }),
        Constraint::Attribute { name, value } => {
            if !exists(
                pool,
                "SELECT COUNT(*) FROM service_property_attributes WHERE name = ?",
                &name,
            )
            .await?
            {
                return Err(SomaError::validation(format!(
                    "unknown service attribute '{}'",
                    name
                )));
            }
            Ok(Constraint::Attribute { name, value })
        }
    }
}

async fn destroy_check_config(
    pool: &SqlitePool,
    request: CheckConfigRequest,
) -> Result<(Uuid, JobSpec)> {
    let id = request
        .id
        .ok_or_else(|| SomaError::validation("check configuration id required"))?;
    let row: Option<(Uuid, Uuid, String)> = sqlx::query_as(
        r#"
        SELECT repository_id, object_id, object_type FROM check_configurations
        WHERE id = ? AND is_deleted = 0
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    let (repository_id, object_id, object_type) =
        row.ok_or_else(|| SomaError::not_found(format!("check configuration {}", id)))?;
    let kind: ObjectKind = object_type.parse().map_err(SomaError::invariant)?;
    Ok((
        repository_id,
        JobSpec::CheckConfigDestroy {
            config_id: id,
            object: ObjectRef::new(kind, object_id),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn threshold(level: &str) -> ThresholdSpec {
        ThresholdSpec {
            predicate: ">".to_string(),
            level: level.to_string(),
            value: 5,
        }
    }

    #[test]
    fn test_threshold_count_is_capped() {
        let three = vec![threshold("info"), threshold("warning"), threshold("critical")];
        assert!(check_thresholds(&three, 3).is_ok());
        assert!(matches!(
            check_thresholds(&three, 2),
            Err(SomaError::Validation(_))
        ));
        assert!(check_thresholds(&[], 3).is_err());
    }

    #[test]
    fn test_duplicate_threshold_levels() {
        let twice = vec![threshold("warning"), threshold("warning")];
        let err = check_thresholds(&twice, 3).unwrap_err();
        assert_eq!(err.to_string(), "duplicate threshold level 'warning'");
    }

    #[test]
    fn test_property_sections() {
        assert_eq!(section_kinds(Section::NodeConfig), &[ObjectKind::Node]);
        assert!(section_kinds(Section::Job).is_empty());
    }

    #[tokio::test]
    async fn test_locate_missing_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let db = crate::db::Database::open(dir.path().join("soma.db"))
            .await
            .unwrap();
        let err = locate(db.pool(), ObjectRef::new(ObjectKind::Bucket, Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, SomaError::NotFound(_)));
    }
}
