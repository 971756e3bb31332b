// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node registry writes (`node_w`).
//!
//! Nodes enter the registry unassigned. Assignment to a bucket goes through
//! GuidePost and the owning TreeKeeper; the registry only adds, logically
//! removes and purges nodes no bucket holds.

use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::db::Database;
use crate::error::{Result, SomaError};
use crate::handler::{self, Handler, HandlerContext, Serve};
use crate::msg::{NodeRequest, Payload, RequestAction, RequestHead, Response};

/// Spawn `node_w`.
pub fn spawn(ctx: &HandlerContext) -> Handler {
    let db = ctx.db.clone();
    handler::spawn_service(ctx, handler::NODE_W, Serve::Serial, move |head| {
        let db = db.clone();
        async move { serve(&db, head).await }
    })
}

async fn serve(db: &Database, head: RequestHead) -> Result<Response> {
    let Payload::Node(request) = head.payload else {
        return Err(SomaError::validation("node payload required"));
    };
    match head.action {
        RequestAction::Add => add(db, head.user_id, request).await,
        RequestAction::Remove => remove(db, node_id(&request)?).await,
        RequestAction::Purge => purge(db, node_id(&request)?).await,
        other => Err(SomaError::validation(format!("node {} not supported", other))),
    }
}

fn node_id(request: &NodeRequest) -> Result<Uuid> {
    request
        .id
        .ok_or_else(|| SomaError::validation("node id required"))
}

/// Register a node.
pub async fn add(db: &Database, user_id: Uuid, request: NodeRequest) -> Result<Response> {
    let pool = db.pool();
    if request.name.trim().is_empty() {
        return Err(SomaError::validation("node name required"));
    }
    if request.asset_id <= 0 {
        return Err(SomaError::validation("asset id must be positive"));
    }

    let server: Option<(bool,)> = sqlx::query_as("SELECT is_deleted FROM servers WHERE id = ?")
        .bind(request.server_id)
        .fetch_optional(pool)
        .await?;
    match server {
        None => return Err(SomaError::not_found(format!("server {}", request.server_id))),
        Some((true,)) => {
            return Err(SomaError::validation(format!(
                "server {} is deleted",
                request.server_id
            )));
        }
        Some((false,)) => {}
    }
    let (team,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM teams WHERE id = ?")
        .bind(request.team_id)
        .fetch_one(pool)
        .await?;
    if team == 0 {
        return Err(SomaError::not_found(format!("team {}", request.team_id)));
    }

    let by_asset: Option<(Uuid, bool)> =
        sqlx::query_as("SELECT id, is_deleted FROM nodes WHERE asset_id = ?")
            .bind(request.asset_id)
            .fetch_optional(pool)
            .await?;
    if let Some((id, deleted)) = by_asset {
        return Err(SomaError::validation(if deleted {
            format!(
                "asset id {} belongs to removed node {}, purge it first",
                request.asset_id, id
            )
        } else {
            format!("asset id {} already registered", request.asset_id)
        }));
    }
    let (taken,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM nodes WHERE name = ? AND is_deleted = 0")
            .bind(&request.name)
            .fetch_one(pool)
            .await?;
    if taken > 0 {
        return Err(SomaError::validation(format!(
            "node {} already exists",
            request.name
        )));
    }

    let id = Uuid::new_v4();
    let mut tx = db.begin_write().await?;
    sqlx::query(
        r#"
        INSERT INTO nodes (id, asset_id, name, team_id, server_id, object_state, created_by, created_at)
        VALUES (?, ?, ?, ?, ?, 'unassigned', ?, ?)
        "#,
    )
    .bind(id)
    .bind(request.asset_id)
    .bind(&request.name)
    .bind(request.team_id)
    .bind(request.server_id)
    .bind(user_id)
    .bind(Utc::now())
    .execute(tx.conn())
    .await?;
    tx.commit().await?;

    info!(node = %request.name, node_id = %id, asset_id = request.asset_id, "Node added");
    Ok(Response::ok(json!({
        "id": id,
        "name": request.name,
        "asset_id": request.asset_id,
        "team_id": request.team_id,
        "server_id": request.server_id,
    })))
}

async fn ensure_unassigned(pool: &SqlitePool, id: Uuid) -> Result<()> {
    let assigned: Option<(Uuid,)> =
        sqlx::query_as("SELECT bucket_id FROM node_bucket_assignment WHERE node_id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
    if let Some((bucket_id,)) = assigned {
        return Err(SomaError::validation(format!(
            "node {} is assigned to bucket {}, unassign it first",
            id, bucket_id
        )));
    }
    Ok(())
}

/// Mark an unassigned node deleted.
pub async fn remove(db: &Database, id: Uuid) -> Result<Response> {
    ensure_unassigned(db.pool(), id).await?;
    let mut tx = db.begin_write().await?;
    let done = sqlx::query("UPDATE nodes SET is_deleted = 1 WHERE id = ? AND is_deleted = 0")
        .bind(id)
        .execute(tx.conn())
        .await?;
    if done.rows_affected() == 0 {
        return Err(SomaError::not_found(format!("node {}", id)));
    }
    tx.commit().await?;
    info!(node_id = %id, "Node removed");
    Ok(Response::ok(json!({ "id": id, "deleted": true })))
}

/// Physically delete a removed node.
pub async fn purge(db: &Database, id: Uuid) -> Result<Response> {
    ensure_unassigned(db.pool(), id).await?;
    let mut tx = db.begin_write().await?;
    let done = sqlx::query("DELETE FROM nodes WHERE id = ? AND is_deleted = 1")
        .bind(id)
        .execute(tx.conn())
        .await?;
    if done.rows_affected() == 0 {
        return Err(SomaError::validation(format!(
            "node {} does not exist or was not removed",
            id
        )));
    }
    tx.commit().await?;
    info!(node_id = %id, "Node purged");
    Ok(Response::ok(json!({ "id": id, "purged": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed(db: &Database) -> (Uuid, Uuid) {
        let team = Uuid::new_v4();
        let server = Uuid::new_v4();
        sqlx::query("INSERT INTO teams (id, name) VALUES (?, 'ops')")
            .bind(team)
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query("INSERT INTO servers (id, asset_id, name) VALUES (?, 4711, 'srv1')")
            .bind(server)
            .execute(db.pool())
            .await
            .unwrap();
        (team, server)
    }

    fn request(team_id: Uuid, server_id: Uuid) -> NodeRequest {
        NodeRequest {
            id: None,
            asset_id: 42,
            name: "n1".to_string(),
            team_id,
            server_id,
        }
    }

    #[tokio::test]
    async fn test_add_remove_purge() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("soma.db")).await.unwrap();
        let (team, server) = seed(&db).await;

        let response = add(&db, Uuid::nil(), request(team, server)).await.unwrap();
        let id: Uuid = serde_json::from_value(response.body["id"].clone()).unwrap();

        let err = add(&db, Uuid::nil(), request(team, server)).await.unwrap_err();
        assert!(matches!(err, SomaError::Validation(_)));

        let err = purge(&db, id).await.unwrap_err();
        assert!(matches!(err, SomaError::Validation(_)));

        remove(&db, id).await.unwrap();
        let err = add(&db, Uuid::nil(), request(team, server)).await.unwrap_err();
        assert!(err.to_string().contains("purge it first"));

        purge(&db, id).await.unwrap();
        add(&db, Uuid::nil(), request(team, server)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_server() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("soma.db")).await.unwrap();
        let (team, _) = seed(&db).await;
        let err = add(&db, Uuid::nil(), request(team, Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, SomaError::NotFound(_)));
    }
}
