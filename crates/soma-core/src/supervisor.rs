// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request authorization.
//!
//! Every request needs an active user. Administrative requests (the `system`
//! section and forced deployment status changes) need an admin. TreeKeepers
//! repeat the user check when a queued job is executed.

use serde_json::json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{Result, SomaError};
use crate::handler::{self, Handler, HandlerContext, Serve};
use crate::msg::{Payload, RequestAction, RequestHead, Response, Section};

/// An authenticated user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct User {
    /// User id.
    pub id: Uuid,
    /// Team the user belongs to.
    pub team_id: Uuid,
    /// Admin flag.
    pub is_admin: bool,
}

/// Look up an active user.
pub async fn active_user(pool: &SqlitePool, user_id: Uuid) -> Result<User> {
    sqlx::query_as::<_, User>(
        "SELECT id, team_id, is_admin FROM users WHERE id = ? AND is_active = 1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| SomaError::Unauthorized(format!("no active user {}", user_id)))
}

/// Whether `user` may run `action` in `section`.
pub fn permits(user: &User, section: Section, action: RequestAction) -> Result<()> {
    let admin_only = matches!(section, Section::System)
        || matches!((section, action), (Section::Deployment, RequestAction::Set));
    if admin_only && !user.is_admin {
        return Err(SomaError::Forbidden(format!("{} {}", section, action)));
    }
    Ok(())
}

/// Authenticate and authorize in one step.
pub async fn authorize(
    pool: &SqlitePool,
    user_id: Uuid,
    section: Section,
    action: RequestAction,
) -> Result<User> {
    let user = active_user(pool, user_id).await?;
    permits(&user, section, action)?;
    Ok(user)
}

/// Spawn the `supervisor` service.
pub fn spawn(ctx: &HandlerContext) -> Handler {
    let pool = ctx.db.pool().clone();
    handler::spawn_service(ctx, handler::SUPERVISOR, Serve::Concurrent, move |head| {
        let pool = pool.clone();
        async move { serve(&pool, head).await }
    })
}

async fn serve(pool: &SqlitePool, head: RequestHead) -> Result<Response> {
    let Payload::Authorize { section, action } = head.payload else {
        return Err(SomaError::validation("authorize needs a section and action"));
    };
    let user = authorize(pool, head.user_id, section, action).await?;
    Ok(Response::ok(json!({
        "user_id": user.id,
        "team_id": user.team_id,
        "admin": user.is_admin,
    })))
}
