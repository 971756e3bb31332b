// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TreeKeeper: the per-repository actor that owns the tree.
//!
//! A keeper loads its repository at startup and then applies jobs one at a
//! time in arrival order. Each job runs against a buffered tree transaction
//! and a single database transaction; either both commit or both roll back
//! and the job row records the error.
//!
//! A keeper whose stored and recomputed state disagree is *broken*: it stays
//! registered, fails every job it receives and logs its condition until it is
//! stopped.

pub(crate) mod dispatch;
pub(crate) mod load;
pub(crate) mod persist;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use soma_tree::{Action, Tree};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::deployment;
use crate::error::{Result, SomaError};
use crate::handler::{Handler, HandlerContext, HandlerKind, keeper_name};
use crate::job::{self, Job, JobSpec};
use crate::supervisor;

use self::persist::Writer;

/// How often a broken keeper reports its condition.
const BROKEN_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Connections in a keeper's dedicated pool.
const KEEPER_POOL_SIZE: u32 = 2;

/// What a rebuild recomputes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebuildLevel {
    /// Drop and recompute checks and check instances.
    Checks,
    /// Drop and recompute check instances only.
    Instances,
}

/// Status flags shared between a keeper and its handle.
#[derive(Debug, Default)]
pub struct KeeperStatus {
    ready: AtomicBool,
    broken: AtomicBool,
    stopped: AtomicBool,
}

impl KeeperStatus {
    /// Loaded and accepting jobs.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Stored and in-memory state diverged.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Stopping or stopped; no new work.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Short state name for status output.
    pub fn as_str(&self) -> &'static str {
        if self.is_stopped() {
            "stopped"
        } else if self.is_broken() {
            "broken"
        } else if self.is_ready() {
            "ready"
        } else {
            "loading"
        }
    }

    fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
    }

    fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
    }
}

/// The sending side of a keeper, as stored in the handler map.
#[derive(Debug, Clone)]
pub struct KeeperHandle {
    /// Repository id.
    pub repository_id: Uuid,
    /// Repository name at spawn time.
    pub repository_name: String,
    input: mpsc::Sender<Job>,
    status: Arc<KeeperStatus>,
}

impl KeeperHandle {
    /// Current status flags.
    pub fn status(&self) -> &KeeperStatus {
        &self.status
    }

    /// Fail unless the keeper is ready and neither stopped nor broken.
    pub fn ensure_accepting(&self) -> Result<()> {
        let status = &self.status;
        if status.is_stopped() {
            return Err(SomaError::Unavailable(format!(
                "repository {} stopped",
                self.repository_name
            )));
        }
        if status.is_broken() {
            return Err(SomaError::Unavailable(format!(
                "repository {} broken",
                self.repository_name
            )));
        }
        if !status.is_ready() {
            return Err(SomaError::Unavailable(format!(
                "repository {} not ready",
                self.repository_name
            )));
        }
        Ok(())
    }

    /// Hand a persisted job to the keeper. Blocks while the input queue is full.
    pub async fn submit(&self, job: Job) -> Result<()> {
        self.ensure_accepting()?;
        self.input.send(job).await.map_err(|_| {
            SomaError::Unavailable(format!("repository {} stopped", self.repository_name))
        })
    }
}

/// Spawn the keeper of a repository. The caller registers the returned handler.
pub async fn spawn(ctx: &HandlerContext, repository_id: Uuid, repository_name: &str) -> Result<Handler> {
    let db = ctx.db.dedicated(KEEPER_POOL_SIZE).await?;
    let (input, rx) = mpsc::channel(ctx.config.queue_length);
    let status = Arc::new(KeeperStatus::default());
    let token = ctx.root.child_token();

    let handle = KeeperHandle {
        repository_id,
        repository_name: repository_name.to_string(),
        input,
        status: status.clone(),
    };
    let keeper = TreeKeeper {
        ctx: ctx.clone(),
        db,
        repository_id,
        name: repository_name.to_string(),
        tree: Tree::new(),
        status,
        input: rx,
        token: token.clone(),
    };
    let span = info_span!("treekeeper", repository = %repository_name);
    let task = tokio::spawn(keeper.run().instrument(span));

    Ok(Handler::new(
        keeper_name(repository_id),
        HandlerKind::TreeKeeper(handle),
        token,
        task,
    ))
}

struct TreeKeeper {
    ctx: HandlerContext,
    db: Database,
    repository_id: Uuid,
    name: String,
    tree: Tree,
    status: Arc<KeeperStatus>,
    input: mpsc::Receiver<Job>,
    token: CancellationToken,
}

impl TreeKeeper {
    async fn run(mut self) {
        let observer = self.ctx.config.observer;
        match self.startup().instrument(info_span!("startup")).await {
            Ok(()) => {
                self.status.mark_ready();
                info!(observer, "TreeKeeper ready");
            }
            Err(e) => {
                self.status.mark_broken();
                error!(error = %e, "TreeKeeper failed to load, repository broken");
            }
        }

        if observer {
            self.token.cancelled().await;
        } else {
            self.resume_jobs().await;
            self.serve().await;
        }

        self.status.mark_stopped();
        self.input.close();
        let mut drained = 0usize;
        while let Some(job) = self.input.recv().await {
            self.process(job).await;
            drained += 1;
        }
        self.db.close().await;
        info!(drained, "TreeKeeper stopped");
    }

    async fn serve(&mut self) {
        let mut hover = tokio::time::interval(BROKEN_LOG_INTERVAL);
        hover.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;

                _ = self.token.cancelled() => break,

                _ = hover.tick(), if self.status.is_broken() => {
                    warn!(repository = %self.name, "Repository broken, rejecting jobs");
                }

                job = self.input.recv() => {
                    match job {
                        Some(job) => self.process(job).await,
                        None => break,
                    }
                }
            }
        }
    }

    async fn startup(&mut self) -> Result<()> {
        let loaded =
            load::startup(self.db.pool(), self.repository_id, self.ctx.config.print_channels)
                .await?;
        self.tree = loaded.tree;
        if let Some(first) = loaded.problems.first() {
            return Err(SomaError::invariant(format!(
                "{} problem(s) during load, first: {}",
                loaded.problems.len(),
                first
            )));
        }
        if !self.ctx.config.observer {
            self.deploy().await?;
        }
        Ok(())
    }

    /// Jobs admitted before a previous stop that never finished.
    async fn resume_jobs(&mut self) {
        let jobs = match job::queued(self.db.pool(), self.repository_id).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Failed to read unfinished jobs");
                return;
            }
        };
        if !jobs.is_empty() {
            info!(jobs = jobs.len(), "Resuming unfinished jobs");
        }
        for job in jobs {
            self.process(job).await;
        }
    }

    async fn process(&mut self, job: Job) {
        let span = info_span!("job", job_id = %job.id, job_type = %job.job_type);
        async {
            if self.status.is_broken() {
                self.fail(&job, "repository broken").await;
            } else {
                match self.apply(&job).await {
                    Ok(instance_changes) => {
                        info!("Job succeeded");
                        if instance_changes && let Err(e) = self.deploy().await {
                            self.status.mark_broken();
                            error!(error = %e, "Deployment build failed, repository broken");
                        }
                    }
                    Err(e) => {
                        if e.is_server_error() {
                            error!(error = %e, "Job failed");
                        } else {
                            info!(error = %e, "Job rejected");
                        }
                        self.fail(&job, &e.to_string()).await;
                    }
                }
            }
            self.ctx.notify_job_done(job.id).await;
        }
        .instrument(span)
        .await
    }

    /// Apply a job to tree and database. Returns whether check instances changed.
    async fn apply(&mut self, job: &Job) -> Result<bool> {
        supervisor::active_user(self.db.pool(), job.user_id).await?;

        let mut tx = self.db.begin_write().await?;
        job::start(tx.conn(), job.id).await?;
        tx.commit().await?;

        self.tree.begin();
        if let Err(e) = dispatch::apply(&mut self.tree, &job.spec) {
            self.tree.rollback();
            return Err(e);
        }
        self.tree.compute_check_instances();

        let errors = self.tree.drain_errors();
        if let Some(first) = errors.first() {
            for err in &errors {
                debug!(error = %err, "Tree error");
            }
            let err = SomaError::from(first.clone());
            self.tree.rollback();
            return Err(err);
        }

        let actions = self.tree.drain_actions();
        match self.persist(job, &actions).await {
            Ok(()) => {
                self.tree.commit();
                debug!(actions = actions.len(), "Job committed");
                Ok(actions.iter().any(Action::is_instance_action))
            }
            Err(e) => {
                self.tree.rollback();
                Err(e)
            }
        }
    }

    async fn persist(&self, job: &Job, actions: &[Action]) -> Result<()> {
        let writer = Writer::new(self.repository_id, Some(job.user_id));
        let mut tx = self.db.begin_write().await?;
        match &job.spec {
            JobSpec::CheckConfigCreate { config } => {
                writer.insert_configuration(tx.conn(), config).await?;
            }
            JobSpec::CheckConfigDestroy { config_id, .. } => {
                writer.delete_configuration(tx.conn(), *config_id).await?;
            }
            _ => {}
        }
        for action in actions {
            writer.apply(tx.conn(), action).await?;
        }
        job::finish(tx.conn(), job.id, None).await?;
        tx.commit().await
    }

    async fn fail(&self, job: &Job, error: &str) {
        let result = async {
            let mut tx = self.db.begin_write().await?;
            job::finish(tx.conn(), job.id, Some(error)).await?;
            tx.commit().await
        }
        .await;
        if let Err(e) = result {
            error!(error = %e, "Failed to record job failure");
        }
    }

    /// Build and order deployments for rows the last commit produced.
    async fn deploy(&self) -> Result<()> {
        let built = deployment::build(
            &self.db,
            self.repository_id,
            self.ctx.config.default_datacenter.as_deref(),
        )
        .await?;
        let ordered = deployment::order(&self.db, self.repository_id).await?;
        if built > 0 || ordered.total() > 0 {
            debug!(
                built,
                rolled_out = ordered.rolled_out,
                blocked = ordered.blocked,
                deduplicated = ordered.deduplicated,
                "Deployments updated"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(status: Arc<KeeperStatus>) -> (KeeperHandle, mpsc::Receiver<Job>) {
        let (input, rx) = mpsc::channel(4);
        (
            KeeperHandle {
                repository_id: Uuid::new_v4(),
                repository_name: "alpha".to_string(),
                input,
                status,
            },
            rx,
        )
    }

    #[test]
    fn test_status_names() {
        let status = KeeperStatus::default();
        assert_eq!(status.as_str(), "loading");
        status.mark_ready();
        assert_eq!(status.as_str(), "ready");
        status.mark_broken();
        assert_eq!(status.as_str(), "broken");
        assert!(!status.is_ready());
        status.mark_stopped();
        assert_eq!(status.as_str(), "stopped");
    }

    #[test]
    fn test_handle_rejects_unless_ready() {
        let status = Arc::new(KeeperStatus::default());
        let (handle, _rx) = handle(status.clone());
        assert!(matches!(
            handle.ensure_accepting(),
            Err(SomaError::Unavailable(_))
        ));
        status.mark_ready();
        assert!(handle.ensure_accepting().is_ok());
        status.mark_broken();
        let err = handle.ensure_accepting().unwrap_err();
        assert_eq!(err.to_string(), "unavailable: repository alpha broken");
    }

    #[test]
    fn test_rebuild_level_names() {
        assert_eq!(
            serde_json::to_string(&RebuildLevel::Instances).unwrap(),
            "\"instances\""
        );
        let level: RebuildLevel = serde_json::from_str("\"checks\"").unwrap();
        assert_eq!(level, RebuildLevel::Checks);
    }
}
