// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handler registry and request routing.
//!
//! Every long-lived actor registers a [`Handler`] under a unique name. The
//! dispatcher resolves `(section, action)` to a handler name through
//! [`route`] and looks the handler up in the [`HandlerMap`]; GrimReaper tears
//! handlers down by name pattern.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::msg::{Request, RequestAction, RequestHead, Response, Section, Status};
use crate::treekeeper::KeeperHandle;

/// Name prefix of every TreeKeeper.
pub const TREEKEEPER_PREFIX: &str = "treekeeper_";
/// Admission layer in front of the TreeKeepers.
pub const GUIDEPOST: &str = "guidepost";
/// Owner of the TreeKeepers.
pub const FOREST_CUSTODIAN: &str = "forest_custodian";
/// Job completion rendezvous.
pub const JOB_BLOCK: &str = "job_block";
/// Shutdown sequencer.
pub const GRIM_REAPER: &str = "grim_reaper";
/// Authorization.
pub const SUPERVISOR: &str = "supervisor";
/// Workflow engine and host endpoints.
pub const DEPLOYMENT: &str = "deployment";
/// Periodic deployment sweeper.
pub const LIFECYCLE: &str = "lifecycle";
/// Job reads.
pub const JOB_R: &str = "job_r";
/// Repository reads.
pub const REPOSITORY_R: &str = "repository_r";
/// Node registry writes.
pub const NODE_W: &str = "node_w";

/// Handler name of the TreeKeeper serving a repository.
///
/// Keyed by id: repository names change on rename and may be reused.
pub fn keeper_name(repository_id: Uuid) -> String {
    format!("{}{}", TREEKEEPER_PREFIX, repository_id)
}

/// The handler serving a `(section, action)` pair, if any.
pub fn route(section: Section, action: RequestAction) -> Option<&'static str> {
    use RequestAction as A;
    use Section as S;

    let name = match (section, action) {
        (S::Repository, A::Create) => FOREST_CUSTODIAN,
        (S::Repository, A::Rename | A::Add | A::Remove | A::Update) => GUIDEPOST,
        (S::Repository, A::List | A::Show) => REPOSITORY_R,

        (S::Bucket, A::Create | A::Destroy | A::Rename | A::Add | A::Remove | A::Update) => {
            GUIDEPOST
        }
        (
            S::Group | S::Cluster,
            A::Create
            | A::Destroy
            | A::Rename
            | A::MemberAssign
            | A::MemberUnassign
            | A::Add
            | A::Remove
            | A::Update,
        ) => GUIDEPOST,
        (S::NodeConfig, A::Assign | A::Unassign | A::Add | A::Remove | A::Update) => GUIDEPOST,
        (S::CheckConfig, A::Create | A::Destroy) => GUIDEPOST,

        (S::Job, A::Show | A::List) => JOB_R,
        (S::Job, A::Wait) => JOB_BLOCK,

        (S::Node, A::Add | A::Remove | A::Purge) => NODE_W,

        (
            S::Deployment,
            A::Show | A::Success | A::Failed | A::Pending | A::List | A::Retry | A::Set,
        ) => DEPLOYMENT,
        (S::Host, A::Get | A::Assemble) => DEPLOYMENT,

        (S::System, A::Stop | A::Restart | A::Rebuild) => FOREST_CUSTODIAN,
        (S::System, A::Shutdown) => GRIM_REAPER,

        (S::Supervisor, A::Authorize) => SUPERVISOR,
        _ => return None,
    };
    Some(name)
}

/// What a handler is and how it takes input.
#[derive(Debug, Clone)]
pub enum HandlerKind {
    /// A repository TreeKeeper; input arrives as jobs from GuidePost.
    TreeKeeper(KeeperHandle),
    /// JobBlock: waits on `intake`, completions on the priority `notify` queue.
    JobBlock {
        /// Wait requests.
        intake: mpsc::Sender<Request>,
        /// Completed job ids.
        notify: mpsc::Sender<Uuid>,
    },
    /// A request-driven actor.
    Service {
        /// Request queue.
        intake: mpsc::Sender<Request>,
    },
    /// A background loop without input.
    Worker,
}

/// A registered actor: its input, its stop token and its task.
#[derive(Debug)]
pub struct Handler {
    name: String,
    kind: HandlerKind,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Handler {
    /// Wrap a spawned actor.
    pub fn new(
        name: impl Into<String>,
        kind: HandlerKind,
        token: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            token,
            task: Mutex::new(Some(task)),
        }
    }

    /// Registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handler kind.
    pub fn kind(&self) -> &HandlerKind {
        &self.kind
    }

    /// Request queue, for handlers that take requests.
    pub fn intake(&self) -> Option<&mpsc::Sender<Request>> {
        match &self.kind {
            HandlerKind::JobBlock { intake, .. } | HandlerKind::Service { intake } => Some(intake),
            HandlerKind::TreeKeeper(_) | HandlerKind::Worker => None,
        }
    }

    /// Priority queue; JobBlock drains it before waits.
    pub fn priority_intake(&self) -> Option<&mpsc::Sender<Uuid>> {
        match &self.kind {
            HandlerKind::JobBlock { notify, .. } => Some(notify),
            _ => None,
        }
    }

    /// The TreeKeeper handle, for keepers.
    pub fn keeper(&self) -> Option<&KeeperHandle> {
        match &self.kind {
            HandlerKind::TreeKeeper(keeper) => Some(keeper),
            _ => None,
        }
    }

    /// Stop token of the actor.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether the actor's task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.lock().as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Cancel the actor and wait up to `grace` for it to exit; abort it after that.
    pub async fn shutdown(&self, grace: Duration) {
        self.token.cancel();
        let task = self.task.lock().take();
        let Some(mut task) = task else {
            return;
        };
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(())) => debug!(handler = %self.name, "Handler stopped"),
            Ok(Err(e)) if e.is_panic() => warn!(handler = %self.name, "Handler task panicked"),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(
                    handler = %self.name,
                    grace_ms = grace.as_millis() as u64,
                    "Handler did not stop in time, aborting"
                );
                task.abort();
            }
        }
    }
}

/// Name to handler map; many readers, writes at registration and shutdown.
#[derive(Debug, Default)]
pub struct HandlerMap {
    handlers: RwLock<BTreeMap<String, Arc<Handler>>>,
}

impl HandlerMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, returning the one it replaced.
    pub fn register(&self, handler: Handler) -> Option<Arc<Handler>> {
        let handler = Arc::new(handler);
        debug!(handler = %handler.name, "Handler registered");
        self.handlers
            .write()
            .insert(handler.name.clone(), handler)
    }

    /// Look a handler up by name.
    pub fn get(&self, name: &str) -> Option<Arc<Handler>> {
        self.handlers.read().get(name).cloned()
    }

    /// Unregister a handler.
    pub fn remove(&self, name: &str) -> Option<Arc<Handler>> {
        self.handlers.write().remove(name)
    }

    /// Registered names in order.
    pub fn names(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Every TreeKeeper.
    pub fn keepers(&self) -> Vec<Arc<Handler>> {
        self.handlers
            .read()
            .values()
            .filter(|h| h.keeper().is_some())
            .cloned()
            .collect()
    }

    /// The TreeKeeper of a repository.
    pub fn keeper_for(&self, repository_id: Uuid) -> Option<Arc<Handler>> {
        self.handlers
            .read()
            .values()
            .find(|h| h.keeper().is_some_and(|k| k.repository_id == repository_id))
            .cloned()
    }

    /// Remove and return every handler whose name matches.
    pub fn take_matching(&self, matches: impl Fn(&str) -> bool) -> Vec<Arc<Handler>> {
        let mut handlers = self.handlers.write();
        let names: Vec<String> = handlers.keys().filter(|n| matches(n)).cloned().collect();
        names
            .into_iter()
            .filter_map(|name| handlers.remove(&name))
            .collect()
    }
}

/// Shared state every actor is started with.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Process configuration.
    pub config: Arc<Config>,
    /// Shared pool and write gate.
    pub db: Database,
    /// The handler registry.
    pub handlers: Arc<HandlerMap>,
    /// Parent of every actor's stop token.
    pub root: CancellationToken,
    /// Set once shutdown starts; the dispatcher then rejects requests.
    pub shutting_down: Arc<AtomicBool>,
}

impl HandlerContext {
    /// Build a context with a fresh registry and root token.
    pub fn new(config: Config, db: Database) -> Self {
        Self {
            config: Arc::new(config),
            db,
            handlers: Arc::new(HandlerMap::new()),
            root: CancellationToken::new(),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether shutdown has started.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Tell JobBlock a job finished.
    ///
    /// Waits for room on the priority queue; the notification is only lost
    /// when JobBlock has stopped, and its waiters are disconnected then.
    pub async fn notify_job_done(&self, job_id: Uuid) {
        let Some(notify) = self
            .handlers
            .get(JOB_BLOCK)
            .and_then(|job_block| job_block.priority_intake().cloned())
        else {
            return;
        };
        if notify.send(job_id).await.is_err() {
            warn!(job_id = %job_id, "JobBlock stopped before job completion was delivered");
        }
    }

    /// Bounded request queue sized from the configuration.
    pub fn request_channel(&self) -> (mpsc::Sender<Request>, mpsc::Receiver<Request>) {
        mpsc::channel(self.config.queue_length)
    }
}

/// How a service works through its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serve {
    /// One request at a time, in arrival order.
    Serial,
    /// Every request on its own task.
    Concurrent,
}

/// Spawn a request-driven actor that answers each request with `serve_fn`.
///
/// On cancellation the queue is closed and whatever is still in it is
/// answered with `unavailable`.
pub fn spawn_service<F, Fut>(
    ctx: &HandlerContext,
    name: impl Into<String>,
    serve: Serve,
    serve_fn: F,
) -> Handler
where
    F: Fn(RequestHead) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    let name = name.into();
    let token = ctx.root.child_token();
    let (intake, mut rx) = ctx.request_channel();

    let task_token = token.clone();
    let task_name = name.clone();
    let span = info_span!("service", handler = %name);
    let task = tokio::spawn(
        async move {
            debug!(mode = ?serve, "Service started");
            loop {
                tokio::select! {
                    biased;

                    _ = task_token.cancelled() => break,

                    request = rx.recv() => {
                        let Some(request) = request else {
                            break;
                        };
                        let (head, reply) = request.into_parts();
                        let action = format!("{}::{}", head.section, head.action);
                        match serve {
                            Serve::Serial => {
                                let response = answer(&action, serve_fn(head).await);
                                let _ = reply.send(response);
                            }
                            Serve::Concurrent => {
                                let fut = serve_fn(head);
                                tokio::spawn(
                                    async move {
                                        let _ = reply.send(answer(&action, fut.await));
                                    }
                                    .in_current_span(),
                                );
                            }
                        }
                    }
                }
            }

            rx.close();
            let mut refused = 0usize;
            while let Ok(request) = rx.try_recv() {
                request.respond(Response::failure(
                    Status::Unavailable,
                    format!("{} is shutting down", task_name),
                ));
                refused += 1;
            }
            info!(refused, "Service stopped");
        }
        .instrument(span),
    );

    Handler::new(name, HandlerKind::Service { intake }, token, task)
}

fn answer(action: &str, result: Result<Response>) -> Response {
    match result {
        Ok(response) => response,
        Err(e) => {
            if e.is_server_error() {
                error!(action, error = %e, "Request failed");
            } else {
                debug!(action, error = %e, "Request rejected");
            }
            Response::from_error(&e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(name: &str) -> Handler {
        let token = CancellationToken::new();
        let child = token.clone();
        let task = tokio::spawn(async move { child.cancelled().await });
        Handler::new(name, HandlerKind::Worker, token, task)
    }

    #[test]
    fn test_routing_table() {
        assert_eq!(
            route(Section::Repository, RequestAction::Create),
            Some(FOREST_CUSTODIAN)
        );
        assert_eq!(
            route(Section::Bucket, RequestAction::Create),
            Some(GUIDEPOST)
        );
        assert_eq!(
            route(Section::Group, RequestAction::MemberAssign),
            Some(GUIDEPOST)
        );
        assert_eq!(route(Section::Job, RequestAction::Wait), Some(JOB_BLOCK));
        assert_eq!(route(Section::Host, RequestAction::Assemble), Some(DEPLOYMENT));
        assert_eq!(
            route(Section::System, RequestAction::Shutdown),
            Some(GRIM_REAPER)
        );
        assert_eq!(
            route(Section::System, RequestAction::Rebuild),
            Some(FOREST_CUSTODIAN)
        );
    }

    #[test]
    fn test_unknown_combinations_have_no_route() {
        assert_eq!(route(Section::Cluster, RequestAction::Wait), None);
        assert_eq!(route(Section::Bucket, RequestAction::MemberAssign), None);
        assert_eq!(route(Section::Deployment, RequestAction::Create), None);
    }

    #[test]
    fn test_keeper_name() {
        let id = Uuid::nil();
        assert_eq!(
            keeper_name(id),
            "treekeeper_00000000-0000-0000-0000-000000000000"
        );
    }

    #[tokio::test]
    async fn test_register_lookup_and_take() {
        let map = HandlerMap::new();
        map.register(worker("job_r"));
        map.register(worker("node_w"));
        map.register(worker("guidepost"));

        assert!(map.get("job_r").is_some());
        assert_eq!(map.names(), vec!["guidepost", "job_r", "node_w"]);

        let writers = map.take_matching(|n| n.ends_with("_w"));
        assert_eq!(writers.len(), 1);
        assert!(map.get("node_w").is_none());
        for handler in writers {
            handler.shutdown(Duration::from_secs(1)).await;
            assert!(handler.is_finished());
        }
    }

    #[tokio::test]
    async fn test_service_answers_and_refuses_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("soma.db")).await.unwrap();
        let ctx = HandlerContext::new(Config::default(), db);
        let handler = spawn_service(&ctx, "echo", Serve::Serial, |head: RequestHead| async move {
            match head.action {
                RequestAction::Show => Ok(Response::ok(serde_json::json!({"echo": true}))),
                _ => Err(crate::error::SomaError::validation("only show")),
            }
        });
        let intake = handler.intake().unwrap().clone();

        let (request, rx) = Request::new(
            Section::Job,
            RequestAction::Show,
            Uuid::nil(),
            crate::msg::Payload::Empty,
        );
        intake.send(request).await.unwrap();
        assert!(rx.await.unwrap().is_ok());

        let (request, rx) = Request::new(
            Section::Job,
            RequestAction::List,
            Uuid::nil(),
            crate::msg::Payload::Empty,
        );
        intake.send(request).await.unwrap();
        assert_eq!(rx.await.unwrap().status, Status::BadRequest);

        handler.shutdown(Duration::from_secs(1)).await;
        let (request, _rx) = Request::new(
            Section::Job,
            RequestAction::Show,
            Uuid::nil(),
            crate::msg::Payload::Empty,
        );
        assert!(intake.send(request).await.is_err());
    }

    #[tokio::test]
    async fn test_job_completions_wait_for_queue_room() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("soma.db")).await.unwrap();
        let ctx = HandlerContext::new(Config::default(), db);
        let (intake, _waits) = mpsc::channel(1);
        let (notify, mut done) = mpsc::channel(1);
        let token = CancellationToken::new();
        let task = tokio::spawn(std::future::pending::<()>());
        ctx.handlers.register(Handler::new(
            JOB_BLOCK,
            HandlerKind::JobBlock { intake, notify },
            token,
            task,
        ));

        // Three completions through a queue of one: none may be dropped.
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let sender = ctx.clone();
        let sent = ids.clone();
        let producer = tokio::spawn(async move {
            for id in sent {
                sender.notify_job_done(id).await;
            }
        });
        let mut received = Vec::new();
        for _ in 0..ids.len() {
            received.push(done.recv().await.unwrap());
        }
        producer.await.unwrap();
        assert_eq!(received, ids);

        if let Some(job_block) = ctx.handlers.remove(JOB_BLOCK) {
            job_block.shutdown(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stuck_handler() {
        let token = CancellationToken::new();
        let task = tokio::spawn(std::future::pending::<()>());
        let handler = Handler::new("stuck", HandlerKind::Worker, token, task);
        handler.shutdown(Duration::from_millis(20)).await;
        assert!(handler.token().is_cancelled());
        assert!(handler.is_finished());
    }
}
