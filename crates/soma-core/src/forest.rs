// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! ForestCustodian: owner of the TreeKeepers.
//!
//! Spawns a keeper per repository at startup, creates new repositories and
//! stops, restarts or rebuilds keepers on request. Requests are served one at
//! a time so two operations never race on the same keeper.

use serde_json::json;
use soma_tree::{ElementDetail, NewElement, ObjectKind, ObjectRef, Tree};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{Result, SomaError};
use crate::handler::{self, Handler, HandlerContext, Serve};
use crate::job::{self, Job, JobSpec, JobStatus};
use crate::msg::{
    Payload, RepositoryRequest, RequestAction, RequestHead, Response, Section, SystemRequest,
};
use crate::supervisor;
use crate::treekeeper::{self, load, persist::Writer};

/// Spawn the custodian.
pub fn spawn(ctx: &HandlerContext) -> Handler {
    let shared = ctx.clone();
    handler::spawn_service(ctx, handler::FOREST_CUSTODIAN, Serve::Serial, move |head| {
        let ctx = shared.clone();
        async move { serve(&ctx, head).await }
    })
}

/// Spawn and register a keeper for every active repository.
///
/// With `observer_repo` set only that repository is loaded. A repository whose
/// keeper cannot be spawned is logged and skipped.
pub async fn start_keepers(ctx: &HandlerContext) -> Result<usize> {
    let repositories: Vec<(Uuid, String)> = sqlx::query_as(
        "SELECT id, name FROM repositories WHERE is_deleted = 0 AND is_active = 1 ORDER BY name",
    )
    .fetch_all(ctx.db.pool())
    .await?;

    let mut started = 0;
    for (id, name) in repositories {
        if let Some(only) = ctx.config.observer_repo.as_deref()
            && only != name
        {
            continue;
        }
        match treekeeper::spawn(ctx, id, &name).await {
            Ok(keeper) => {
                ctx.handlers.register(keeper);
                started += 1;
            }
            Err(e) => error!(repository = %name, error = %e, "Failed to spawn TreeKeeper"),
        }
    }
    info!(keepers = started, "TreeKeepers started");
    Ok(started)
}

async fn serve(ctx: &HandlerContext, head: RequestHead) -> Result<Response> {
    match (head.section, head.action, head.payload) {
        (Section::Repository, RequestAction::Create, Payload::Repository(request)) => {
            create(ctx, head.user_id, request).await
        }
        (Section::System, RequestAction::Stop, Payload::System(request)) => {
            let repository_id = repository_id(&request)?;
            stop(ctx, repository_id).await?;
            Ok(Response::ok(json!({
                "repository_id": repository_id,
                "status": "stopped",
            })))
        }
        (Section::System, RequestAction::Restart, Payload::System(request)) => {
            let repository_id = repository_id(&request)?;
            restart(ctx, repository_id).await?;
            Ok(Response::ok(json!({
                "repository_id": repository_id,
                "status": "restarted",
            })))
        }
        (Section::System, RequestAction::Rebuild, Payload::System(request)) => {
            if ctx.config.observer {
                return Err(SomaError::Forbidden(
                    "rebuild in observer mode".to_string(),
                ));
            }
            let repository_id = repository_id(&request)?;
            let level = request
                .rebuild_level
                .ok_or_else(|| SomaError::validation("rebuild level required"))?;
            let actions = rebuild(ctx, repository_id, level).await?;
            Ok(Response::ok(json!({
                "repository_id": repository_id,
                "level": level,
                "actions": actions,
            })))
        }
        (section, action, _) => Err(SomaError::validation(format!(
            "{} {} needs a matching payload",
            section, action
        ))),
    }
}

fn repository_id(request: &SystemRequest) -> Result<Uuid> {
    request
        .repository_id
        .ok_or_else(|| SomaError::validation("repository id required"))
}

/// Create a repository, record its job and start its keeper.
async fn create(
    ctx: &HandlerContext,
    user_id: Uuid,
    request: RepositoryRequest,
) -> Result<Response> {
    if ctx.config.observer {
        return Err(SomaError::Forbidden(
            "repository create in observer mode".to_string(),
        ));
    }
    let name = request.name.trim();
    if name.is_empty() {
        return Err(SomaError::validation("repository name required"));
    }
    let user = supervisor::active_user(ctx.db.pool(), user_id).await?;
    let team_id = request.team_id.unwrap_or(user.team_id);

    let (taken,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM repositories WHERE name = ? AND is_deleted = 0")
            .bind(name)
            .fetch_one(ctx.db.pool())
            .await?;
    if taken > 0 {
        return Err(SomaError::validation(format!(
            "repository {} already exists",
            name
        )));
    }
    let (team,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM teams WHERE id = ?")
        .bind(team_id)
        .fetch_one(ctx.db.pool())
        .await?;
    if team == 0 {
        return Err(SomaError::not_found(format!("team {}", team_id)));
    }

    let repository = NewElement {
        id: Uuid::new_v4(),
        name: name.to_string(),
        team_id,
        detail: ElementDetail::Repository { active: true },
    };

    let mut tree = Tree::new();
    tree.clear_load_info();
    tree.attach(
        repository.clone(),
        ObjectRef::new(ObjectKind::Root, Tree::ROOT_ID),
    );
    if let Some(err) = tree.drain_errors().into_iter().next() {
        return Err(SomaError::from(err));
    }
    let actions = tree.drain_actions();

    let job = Job {
        id: Uuid::new_v4(),
        job_type: format!("{}::{}", Section::Repository, RequestAction::Create),
        repository_id: repository.id,
        user_id,
        team_id: user.team_id,
        spec: JobSpec::RepositoryCreate {
            repository: repository.clone(),
        },
    };

    let writer = Writer::new(repository.id, Some(user_id));
    let mut tx = ctx.db.begin_write().await?;
    for action in &actions {
        writer.apply(tx.conn(), action).await?;
    }
    job::insert(tx.conn(), &job, JobStatus::Success).await?;
    tx.commit().await?;

    let keeper = treekeeper::spawn(ctx, repository.id, &repository.name).await?;
    ctx.handlers.register(keeper);
    ctx.notify_job_done(job.id).await;

    info!(repository = %repository.name, repository_id = %repository.id, "Repository created");
    Ok(Response::accepted(
        job.id,
        json!({ "id": repository.id, "name": repository.name }),
    ))
}

/// Unregister a keeper and wait for it to drain.
pub async fn stop(ctx: &HandlerContext, repository_id: Uuid) -> Result<()> {
    let keeper = ctx
        .handlers
        .keeper_for(repository_id)
        .ok_or_else(|| SomaError::not_found(format!("TreeKeeper of repository {}", repository_id)))?;
    ctx.handlers.remove(keeper.name());
    keeper.shutdown(ctx.config.stop_grace).await;
    info!(handler = %keeper.name(), "TreeKeeper stopped on request");
    Ok(())
}

/// Stop the keeper if it runs, then spawn a fresh one from storage.
pub async fn restart(ctx: &HandlerContext, repository_id: Uuid) -> Result<()> {
    let name = repository_name(ctx, repository_id).await?;
    if ctx.handlers.keeper_for(repository_id).is_some() {
        stop(ctx, repository_id).await?;
    }
    let keeper = treekeeper::spawn(ctx, repository_id, &name).await?;
    ctx.handlers.register(keeper);
    Ok(())
}

/// Stop the keeper, recompute stored checks or instances and start it again.
///
/// The keeper is restarted even when the rebuild fails, so a failed rebuild
/// leaves the repository as it was.
pub async fn rebuild(
    ctx: &HandlerContext,
    repository_id: Uuid,
    level: treekeeper::RebuildLevel,
) -> Result<usize> {
    let name = repository_name(ctx, repository_id).await?;
    if ctx.handlers.keeper_for(repository_id).is_some() {
        stop(ctx, repository_id).await?;
    }
    let result = load::rebuild(&ctx.db, repository_id, level).await;
    if let Err(e) = &result {
        warn!(repository = %name, error = %e, "Rebuild failed, restarting unchanged");
    }
    let keeper = treekeeper::spawn(ctx, repository_id, &name).await?;
    ctx.handlers.register(keeper);
    result
}

async fn repository_name(ctx: &HandlerContext, repository_id: Uuid) -> Result<String> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT name FROM repositories WHERE id = ? AND is_deleted = 0")
            .bind(repository_id)
            .fetch_optional(ctx.db.pool())
            .await?;
    row.map(|(name,)| name)
        .ok_or_else(|| SomaError::not_found(format!("repository {}", repository_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::Database;

    #[tokio::test]
    async fn test_stop_unknown_repository() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("soma.db")).await.unwrap();
        let ctx = HandlerContext::new(Config::default(), db);
        let err = stop(&ctx, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SomaError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_create_is_forbidden_for_observers() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("soma.db")).await.unwrap();
        let config = Config {
            observer: true,
            ..Config::default()
        };
        let ctx = HandlerContext::new(config, db);
        let err = create(
            &ctx,
            Uuid::new_v4(),
            RepositoryRequest {
                name: "alpha".to_string(),
                ..RepositoryRequest::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SomaError::Forbidden(_)));
    }
}
