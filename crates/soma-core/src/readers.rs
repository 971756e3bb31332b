// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Read handlers: job records and repositories.

use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::{Result, SomaError};
use crate::handler::{self, Handler, HandlerContext, HandlerMap, Serve};
use crate::job;
use crate::msg::{Payload, RepositoryRequest, RequestAction, RequestHead, Response};

/// Spawn `job_r`.
pub fn spawn_job_reader(ctx: &HandlerContext) -> Handler {
    let pool = ctx.db.pool().clone();
    handler::spawn_service(ctx, handler::JOB_R, Serve::Concurrent, move |head| {
        let pool = pool.clone();
        async move {
            let query = match head.payload {
                Payload::Job(query) => query,
                Payload::Empty => Default::default(),
                _ => return Err(SomaError::validation("job query required")),
            };
            match head.action {
                RequestAction::Show => {
                    let job_id = query
                        .job_id
                        .ok_or_else(|| SomaError::validation("job id required"))?;
                    Ok(Response::ok(job::get(&pool, job_id).await?.to_json()))
                }
                RequestAction::List => {
                    let jobs: Vec<Value> = job::list(&pool, query.repository_id)
                        .await?
                        .iter()
                        .map(job::JobRecord::to_json)
                        .collect();
                    Ok(Response::ok(json!({ "jobs": jobs })))
                }
                other => Err(SomaError::validation(format!("job {} not supported", other))),
            }
        }
    })
}

#[derive(Debug, sqlx::FromRow)]
struct RepositoryRow {
    id: Uuid,
    name: String,
    team_id: Uuid,
    is_active: bool,
}

fn keeper_state(handlers: &HandlerMap, repository_id: Uuid) -> &'static str {
    handlers
        .keeper_for(repository_id)
        .and_then(|h| h.keeper().map(|k| k.status().as_str()))
        .unwrap_or("stopped")
}

/// Spawn `repository_r`.
pub fn spawn_repository_reader(ctx: &HandlerContext) -> Handler {
    let shared = ctx.clone();
    handler::spawn_service(ctx, handler::REPOSITORY_R, Serve::Concurrent, move |head| {
        let ctx = shared.clone();
        async move { serve_repository(&ctx, head).await }
    })
}

async fn serve_repository(ctx: &HandlerContext, head: RequestHead) -> Result<Response> {
    let pool = ctx.db.pool();
    match head.action {
        RequestAction::List => {
            let rows = sqlx::query_as::<_, RepositoryRow>(
                "SELECT id, name, team_id, is_active FROM repositories WHERE is_deleted = 0 ORDER BY name",
            )
            .fetch_all(pool)
            .await?;
            let repositories: Vec<Value> = rows
                .iter()
                .map(|r| {
                    json!({
                        "id": r.id,
                        "name": r.name,
                        "team_id": r.team_id,
                        "active": r.is_active,
                        "keeper": keeper_state(&ctx.handlers, r.id),
                    })
                })
                .collect();
            Ok(Response::ok(json!({ "repositories": repositories })))
        }
        RequestAction::Show => {
            let Payload::Repository(RepositoryRequest { id: Some(id), .. }) = head.payload else {
                return Err(SomaError::validation("repository id required"));
            };
            let row = sqlx::query_as::<_, RepositoryRow>(
                "SELECT id, name, team_id, is_active FROM repositories WHERE id = ? AND is_deleted = 0",
            )
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| SomaError::not_found(format!("repository {}", id)))?;

            let (buckets,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM buckets WHERE repository_id = ? AND is_deleted = 0")
                    .bind(id)
                    .fetch_one(pool)
                    .await?;
            let (nodes,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM node_bucket_assignment WHERE repository_id = ?")
                    .bind(id)
                    .fetch_one(pool)
                    .await?;
            let (configurations,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM check_configurations WHERE repository_id = ? AND is_deleted = 0",
            )
            .bind(id)
            .fetch_one(pool)
            .await?;
            let (instances,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM check_instances WHERE repository_id = ? AND is_deleted = 0",
            )
            .bind(id)
            .fetch_one(pool)
            .await?;

            Ok(Response::ok(json!({
                "id": row.id,
                "name": row.name,
                "team_id": row.team_id,
                "active": row.is_active,
                "keeper": keeper_state(&ctx.handlers, row.id),
                "buckets": buckets,
                "nodes": nodes,
                "check_configurations": configurations,
                "check_instances": instances,
            })))
        }
        other => Err(SomaError::validation(format!(
            "repository {} not supported",
            other
        ))),
    }
}
