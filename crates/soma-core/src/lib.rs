// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! soma-core - repository keepers, deployment workflow and request admission.
//!
//! Every repository is served by one TreeKeeper that owns the repository's
//! in-memory [`soma_tree::Tree`] and applies queued jobs against it. Check
//! instances computed by the tree are turned into deployments, ordered into
//! version chains and handed to monitoring systems through the workflow
//! engine.
//!
//! # Architecture
//!
//! ```text
//!   caller ──► SomaRuntime::dispatch ──► supervisor (authorize)
//!                     │
//!                     ├──► guidepost ──► treekeeper_<id>   ──► builder ──► orderer
//!                     │                        │
//!                     │                        └──► job_block (completion)
//!                     ├──► forest_custodian (create, stop, restart, rebuild)
//!                     ├──► deployment (workflow, host endpoints)
//!                     ├──► job_r, repository_r, node_w
//!                     └──► grim_reaper (shutdown)
//! ```
//!
//! # Handlers
//!
//! | Handler | Serves |
//! |---------|--------|
//! | `guidepost` | mutations on repositories, buckets, groups, clusters, nodes and check configurations |
//! | `treekeeper_<repository id>` | queued jobs of one repository |
//! | `forest_custodian` | repository creation, keeper stop, restart and rebuild |
//! | `job_block` | `job wait` |
//! | `deployment` | deployment workflow transitions and host views |
//! | `lifecycle` | periodic build, order and release sweep |
//! | `grim_reaper` | ordered shutdown |
//! | `supervisor` | authorization |
//! | `job_r`, `repository_r` | reads |
//! | `node_w` | node registry |

#![deny(missing_docs)]

/// Environment based configuration.
pub mod config;

/// Shared SQLite pool and the write gate.
pub mod db;

/// Deployment builder, orderer and workflow engine.
pub mod deployment;

/// Error types for soma-core.
pub mod error;

/// ForestCustodian: keeper lifecycle and repository creation.
pub mod forest;

/// GuidePost: request validation and job admission.
pub mod guidepost;

/// Handler registry, routing table and service loop.
pub mod handler;

/// Jobs and their persisted records.
pub mod job;

/// JobBlock: waiting for job completion.
pub mod jobblock;

/// Periodic deployment sweeper.
pub mod lifecycle;

/// Embedded database migrations.
pub mod migrations;

/// Requests, responses and payloads.
pub mod msg;

/// Node registry writes.
pub mod nodes;

/// Job and repository reads.
pub mod readers;

/// GrimReaper: ordered shutdown.
pub mod reaper;

/// The embeddable runtime.
pub mod soma;

/// Authorization.
pub mod supervisor;

/// TreeKeeper: one repository's tree and job queue.
pub mod treekeeper;

pub use config::Config;
pub use db::Database;
pub use error::{Result, SomaError};
pub use msg::{Payload, Request, RequestAction, Response, Section, Status};
pub use soma::SomaRuntime;
