// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! GrimReaper: ordered shutdown.
//!
//! Once shutdown starts the dispatcher refuses new requests. After the
//! configured delay handlers are torn down in phases: TreeKeepers first so
//! their queues drain while everything else still runs, then writers,
//! readers, the core services and finally the supervisor and the reaper's
//! own request queue.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinSet;
use tracing::{Instrument, info, info_span, warn};

use crate::error::Result;
use crate::handler::{self, Handler, HandlerContext, Serve};
use crate::msg::Response;

/// Handlers stopped in the fourth phase.
const CORE_SERVICES: [&str; 5] = [
    handler::JOB_BLOCK,
    handler::FOREST_CUSTODIAN,
    handler::GUIDEPOST,
    handler::LIFECYCLE,
    handler::DEPLOYMENT,
];

/// Spawn GrimReaper.
pub fn spawn(ctx: &HandlerContext) -> Handler {
    let shared = ctx.clone();
    handler::spawn_service(ctx, handler::GRIM_REAPER, Serve::Serial, move |_head| {
        let ctx = shared.clone();
        async move { request_shutdown(&ctx) }
    })
}

fn request_shutdown(ctx: &HandlerContext) -> Result<Response> {
    let first = !ctx.shutting_down.swap(true, Ordering::SeqCst);
    if first {
        let ctx = ctx.clone();
        tokio::spawn(async move { teardown(&ctx).await }.instrument(info_span!("grim_reaper")));
    }
    Ok(Response::ok(json!({
        "status": "shutting down",
        "delay_secs": ctx.config.shutdown_delay.as_secs(),
    })))
}

/// Run the full shutdown sequence and return once the root token is cancelled.
///
/// Safe to call more than once; later calls wait for the first to finish.
pub async fn reap(ctx: &HandlerContext) {
    if ctx.shutting_down.swap(true, Ordering::SeqCst) {
        ctx.root.cancelled().await;
        return;
    }
    teardown(ctx).instrument(info_span!("grim_reaper")).await;
}

async fn teardown(ctx: &HandlerContext) {
    info!(
        delay_secs = ctx.config.shutdown_delay.as_secs(),
        "Shutdown requested"
    );
    tokio::time::sleep(ctx.config.shutdown_delay).await;

    let phases: [(&str, fn(&str) -> bool); 5] = [
        ("treekeepers", |n| n.starts_with(handler::TREEKEEPER_PREFIX)),
        ("writers", |n| n.ends_with("_w")),
        ("readers", |n| n.ends_with("_r")),
        ("services", |n| CORE_SERVICES.contains(&n)),
        ("supervisor", |n| n == handler::SUPERVISOR || n == handler::GRIM_REAPER),
    ];
    for (phase, matches) in phases {
        let handlers = ctx.handlers.take_matching(matches);
        if handlers.is_empty() {
            continue;
        }
        info!(phase, handlers = handlers.len(), "Stopping handlers");
        stop_all(handlers, ctx.config.stop_grace).await;
    }

    let residual = ctx.handlers.names();
    if !residual.is_empty() {
        warn!(handlers = ?residual, "Handlers left after shutdown phases");
    }
    info!("Shutdown complete");
    ctx.root.cancel();
}

async fn stop_all(handlers: Vec<Arc<Handler>>, grace: Duration) {
    let mut set = JoinSet::new();
    for handler in handlers {
        set.spawn(async move { handler.shutdown(grace).await });
    }
    while set.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::Config;
    use crate::db::Database;
    use crate::handler::HandlerKind;

    fn worker(ctx: &HandlerContext, name: &str) -> Handler {
        let token = ctx.root.child_token();
        let child: CancellationToken = token.clone();
        let task = tokio::spawn(async move { child.cancelled().await });
        Handler::new(name, HandlerKind::Worker, token, task)
    }

    #[tokio::test]
    async fn test_reap_empties_registry_and_cancels_root() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("soma.db")).await.unwrap();
        let config = Config {
            shutdown_delay: Duration::from_millis(10),
            ..Config::default()
        };
        let ctx = HandlerContext::new(config, db);
        for name in ["treekeeper_alpha", "node_w", "job_r", "guidepost", "supervisor"] {
            ctx.handlers.register(worker(&ctx, name));
        }

        reap(&ctx).await;

        assert!(ctx.is_shutting_down());
        assert!(ctx.handlers.is_empty());
        assert!(ctx.root.is_cancelled());
        // A second call returns at once.
        reap(&ctx).await;
    }

    #[tokio::test]
    async fn test_unphased_handlers_survive_to_root_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("soma.db")).await.unwrap();
        let config = Config {
            shutdown_delay: Duration::ZERO,
            ..Config::default()
        };
        let ctx = HandlerContext::new(config, db);
        ctx.handlers.register(worker(&ctx, "stray"));

        reap(&ctx).await;

        assert_eq!(ctx.handlers.names(), vec!["stray"]);
        let stray = ctx.handlers.get("stray").unwrap();
        assert!(stray.token().is_cancelled());
    }
}
