// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable soma runtime.
//!
//! [`SomaRuntime`] registers every handler on one [`HandlerContext`], starts
//! the repository TreeKeepers and dispatches requests through the routing
//! table.
//!
//! ```rust,ignore
//! use soma_core::{Config, Database, SomaRuntime};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let db = Database::connect(&config).await?;
//!
//!     let runtime = SomaRuntime::builder()
//!         .config(config)
//!         .database(db)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... hand requests to runtime.dispatch(...) ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use anyhow::Result;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::Database;
use crate::deployment::workflow;
use crate::error::SomaError;
use crate::handler::{self, HandlerContext};
use crate::msg::{Payload, Request, RequestAction, Response, Section, Status};
use crate::{forest, guidepost, jobblock, lifecycle, nodes, readers, reaper, supervisor};

/// Builder for a [`SomaRuntime`].
#[derive(Default)]
pub struct SomaRuntimeBuilder {
    config: Option<Config>,
    database: Option<Database>,
}

impl SomaRuntimeBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Connected and migrated database.
    pub fn database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    /// Build the runtime configuration.
    ///
    /// The database is required; the configuration falls back to defaults.
    pub fn build(self) -> Result<SomaRuntimeConfig> {
        let database = self
            .database
            .ok_or_else(|| anyhow::anyhow!("database is required"))?;
        Ok(SomaRuntimeConfig {
            config: self.config.unwrap_or_default(),
            database,
        })
    }
}

/// Configuration for a [`SomaRuntime`].
pub struct SomaRuntimeConfig {
    config: Config,
    database: Database,
}

impl SomaRuntimeConfig {
    /// Register the handlers and start the TreeKeepers.
    pub async fn start(self) -> Result<SomaRuntime> {
        let ctx = HandlerContext::new(self.config, self.database);
        let config = ctx.config.clone();
        info!(
            observer = config.observer,
            read_only = config.read_only,
            queue_length = config.queue_length,
            "Starting soma"
        );

        ctx.handlers.register(supervisor::spawn(&ctx));
        ctx.handlers.register(jobblock::spawn(&ctx));
        ctx.handlers.register(workflow::spawn(&ctx));
        ctx.handlers.register(readers::spawn_job_reader(&ctx));
        ctx.handlers.register(readers::spawn_repository_reader(&ctx));
        ctx.handlers.register(reaper::spawn(&ctx));

        if config.read_only {
            info!("Read-only mode, write handlers and TreeKeepers not started");
        } else {
            ctx.handlers.register(nodes::spawn(&ctx));
            ctx.handlers.register(forest::spawn(&ctx));
            ctx.handlers.register(guidepost::spawn(&ctx));
            if !config.observer {
                ctx.handlers.register(lifecycle::spawn(&ctx));
            }
            forest::start_keepers(&ctx).await?;
        }

        info!(handlers = ?ctx.handlers.names(), "soma started");
        Ok(SomaRuntime { ctx })
    }
}

/// A running soma instance.
pub struct SomaRuntime {
    ctx: HandlerContext,
}

impl SomaRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> SomaRuntimeBuilder {
        SomaRuntimeBuilder::new()
    }

    /// Shared handler context.
    pub fn context(&self) -> &HandlerContext {
        &self.ctx
    }

    /// Route a request to its handler.
    ///
    /// The request is answered on its own reply channel exactly once: by the
    /// handler, or here when it cannot be routed, authorized or delivered.
    pub async fn dispatch(&self, request: Request) {
        if self.ctx.is_shutting_down() {
            request.respond(Response::failure(Status::Unavailable, "shutting down"));
            return;
        }
        let Some(name) = handler::route(request.section, request.action) else {
            let err = SomaError::UnknownRequest {
                section: request.section.to_string(),
                action: request.action.to_string(),
            };
            request.respond_with(Err(err));
            return;
        };

        // Authorization requests are answered by the supervisor itself.
        if name != handler::SUPERVISOR {
            let (check, verdict) = Request::new(
                Section::Supervisor,
                RequestAction::Authorize,
                request.user_id,
                Payload::Authorize {
                    section: request.section,
                    action: request.action,
                },
            );
            self.forward(handler::SUPERVISOR, check).await;
            let verdict = verdict.await.unwrap_or_else(|_| {
                Response::failure(Status::Unavailable, "supervisor dropped the request")
            });
            if !verdict.is_ok() {
                debug!(
                    section = %request.section,
                    action = %request.action,
                    status = %verdict.status,
                    "Request not authorized"
                );
                request.respond(verdict);
                return;
            }
        }
        self.forward(name, request).await;
    }

    /// Build a request, dispatch it and wait for the answer.
    pub async fn request(
        &self,
        section: Section,
        action: RequestAction,
        user_id: Uuid,
        payload: Payload,
    ) -> Response {
        let (request, reply) = Request::new(section, action, user_id, payload);
        self.dispatch(request).await;
        reply.await.unwrap_or_else(|_| {
            Response::failure(Status::Unavailable, format!("{} {} dropped", section, action))
        })
    }

    async fn forward(&self, name: &str, request: Request) {
        let Some(handler) = self.ctx.handlers.get(name) else {
            request.respond(Response::failure(
                Status::Unavailable,
                format!("{} is not running", name),
            ));
            return;
        };
        let Some(intake) = handler.intake() else {
            request.respond(Response::failure(
                Status::Unavailable,
                format!("{} takes no requests", name),
            ));
            return;
        };
        if let Err(refused) = intake.send(request).await {
            refused.0.respond(Response::failure(
                Status::Unavailable,
                format!("{} is shutting down", name),
            ));
        }
    }

    /// Run GrimReaper and wait for every handler to stop.
    pub async fn shutdown(self) -> Result<()> {
        info!("soma shutting down...");
        reaper::reap(&self.ctx).await;
        let residual = self.ctx.handlers.names();
        if !residual.is_empty() {
            warn!(handlers = ?residual, "Handlers still registered after shutdown");
        }
        self.ctx.db.close().await;
        info!("soma shutdown complete");
        Ok(())
    }

    /// Resolve once shutdown has completed, whoever requested it.
    pub async fn wait(&self) {
        self.ctx.root.cancelled().await;
    }

    /// Whether shutdown has started.
    pub fn is_shutting_down(&self) -> bool {
        self.ctx.is_shutting_down()
    }
}
