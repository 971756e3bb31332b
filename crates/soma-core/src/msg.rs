// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process request/result contract between the transport and the handlers.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use soma_tree::{Constraint, ObjectRef, PropertyValue};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::deployment::WorkflowStatus;
use crate::error::SomaError;
use crate::treekeeper::RebuildLevel;

/// Result status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    /// Request succeeded.
    Ok,
    /// A referenced entity does not exist.
    NotFound,
    /// The request is invalid.
    BadRequest,
    /// The user is unknown or inactive.
    Unauthorized,
    /// The user lacks the required privilege.
    Forbidden,
    /// The target cannot take work right now.
    Unavailable,
    /// Infrastructure or invariant failure.
    ServerError,
    /// Recognized but not implemented.
    NotImplemented,
    /// No handler serves the section/action pair.
    UnknownRequest,
}

impl Status {
    /// Kebab-case status name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::NotFound => "not-found",
            Status::BadRequest => "bad-request",
            Status::Unauthorized => "unauthorized",
            Status::Forbidden => "forbidden",
            Status::Unavailable => "unavailable",
            Status::ServerError => "server-error",
            Status::NotImplemented => "not-implemented",
            Status::UnknownRequest => "unknown-request",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Section {
    /// Repositories and their properties.
    Repository,
    /// Buckets and their properties.
    Bucket,
    /// Groups, membership and properties.
    Group,
    /// Clusters, membership and properties.
    Cluster,
    /// Node assignment and node properties.
    NodeConfig,
    /// Check configurations.
    CheckConfig,
    /// Job records and waits.
    Job,
    /// Node registry.
    Node,
    /// Deployment workflow.
    Deployment,
    /// Per-host deployment views.
    Host,
    /// Administrative operations.
    System,
    /// Authorization.
    Supervisor,
}

impl Section {
    /// Kebab-case section name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Repository => "repository",
            Section::Bucket => "bucket",
            Section::Group => "group",
            Section::Cluster => "cluster",
            Section::NodeConfig => "node-config",
            Section::CheckConfig => "check-config",
            Section::Job => "job",
            Section::Node => "node",
            Section::Deployment => "deployment",
            Section::Host => "host",
            Section::System => "system",
            Section::Supervisor => "supervisor",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[allow(missing_docs)]
pub enum RequestAction {
    Create,
    Destroy,
    Rename,
    Add,
    Remove,
    Update,
    Assign,
    Unassign,
    MemberAssign,
    MemberUnassign,
    Purge,
    List,
    Show,
    Wait,
    Shutdown,
    Retry,
    Set,
    Success,
    Failed,
    Pending,
    Get,
    Assemble,
    Rebuild,
    Restart,
    Stop,
    Authorize,
}

impl RequestAction {
    /// Kebab-case action name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestAction::Create => "create",
            RequestAction::Destroy => "destroy",
            RequestAction::Rename => "rename",
            RequestAction::Add => "add",
            RequestAction::Remove => "remove",
            RequestAction::Update => "update",
            RequestAction::Assign => "assign",
            RequestAction::Unassign => "unassign",
            RequestAction::MemberAssign => "member-assign",
            RequestAction::MemberUnassign => "member-unassign",
            RequestAction::Purge => "purge",
            RequestAction::List => "list",
            RequestAction::Show => "show",
            RequestAction::Wait => "wait",
            RequestAction::Shutdown => "shutdown",
            RequestAction::Retry => "retry",
            RequestAction::Set => "set",
            RequestAction::Success => "success",
            RequestAction::Failed => "failed",
            RequestAction::Pending => "pending",
            RequestAction::Get => "get",
            RequestAction::Assemble => "assemble",
            RequestAction::Rebuild => "rebuild",
            RequestAction::Restart => "restart",
            RequestAction::Stop => "stop",
            RequestAction::Authorize => "authorize",
        }
    }

    /// Whether the action changes repository state.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            RequestAction::Create
                | RequestAction::Destroy
                | RequestAction::Rename
                | RequestAction::Add
                | RequestAction::Remove
                | RequestAction::Update
                | RequestAction::Assign
                | RequestAction::Unassign
                | RequestAction::MemberAssign
                | RequestAction::MemberUnassign
                | RequestAction::Purge
        )
    }
}

impl fmt::Display for RequestAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Payloads
// ----------------------------------------------------------------------------

/// Repository create/rename/show.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryRequest {
    /// Repository id (rename, show).
    pub id: Option<Uuid>,
    /// Repository name (create, rename).
    pub name: String,
    /// Owning team (create).
    pub team_id: Option<Uuid>,
}

/// Bucket create/destroy/rename.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketRequest {
    /// Bucket id (destroy, rename).
    pub id: Option<Uuid>,
    /// Bucket name.
    pub name: String,
    /// Repository the bucket lives in.
    pub repository_id: Option<Uuid>,
    /// Environment (create).
    pub environment: String,
    /// Owning team (create).
    pub team_id: Option<Uuid>,
}

/// Group or cluster create/destroy/rename/membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRequest {
    /// Group or cluster id; absent on create.
    pub id: Option<Uuid>,
    /// Name (create, rename).
    pub name: String,
    /// Bucket the container lives in.
    pub bucket_id: Uuid,
    /// Owning team (create).
    pub team_id: Option<Uuid>,
    /// Member to assign or unassign.
    pub member: Option<ObjectRef>,
}

/// Node assignment to a bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfigRequest {
    /// Node id.
    pub node_id: Uuid,
    /// Target bucket (assign) or current bucket (unassign).
    pub bucket_id: Uuid,
    /// Repository the bucket belongs to.
    pub repository_id: Option<Uuid>,
}

/// Property add/remove/update on any tree element.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyRequest {
    /// Element the property is attached to.
    pub object: ObjectRef,
    /// Repository id, for repository properties.
    pub repository_id: Option<Uuid>,
    /// Bucket id, for everything below a repository.
    pub bucket_id: Option<Uuid>,
    /// Source instance id (remove, update).
    pub source_instance_id: Option<Uuid>,
    /// View.
    pub view: String,
    /// Inheritance flag.
    pub inheritance: bool,
    /// Children-only flag.
    pub children_only: bool,
    /// Property payload.
    pub value: PropertyValue,
}

/// One threshold of a check configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdSpec {
    /// Comparison predicate, e.g. `>`.
    pub predicate: String,
    /// Severity level name.
    pub level: String,
    /// Threshold value.
    pub value: i64,
}

/// Check configuration create/destroy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfigRequest {
    /// Configuration id (destroy).
    pub id: Option<Uuid>,
    /// Configuration name.
    pub name: String,
    /// Repository id.
    pub repository_id: Uuid,
    /// Bucket id when the target is below a repository.
    pub bucket_id: Option<Uuid>,
    /// Target element.
    pub object: ObjectRef,
    /// Capability id.
    pub capability_id: Uuid,
    /// Check interval in seconds.
    pub interval: u64,
    /// Enabled flag.
    pub enabled: bool,
    /// Inheritance flag.
    pub inheritance: bool,
    /// Children-only flag.
    pub children_only: bool,
    /// Identifier in an external system.
    pub external_id: String,
    /// Thresholds.
    pub thresholds: Vec<ThresholdSpec>,
    /// Constraints.
    pub constraints: Vec<Constraint>,
}

/// Node registry add/remove/purge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRequest {
    /// Node id (remove, purge).
    pub id: Option<Uuid>,
    /// Asset id.
    pub asset_id: i64,
    /// Node name.
    pub name: String,
    /// Owning team.
    pub team_id: Uuid,
    /// Server the node runs on.
    pub server_id: Uuid,
}

/// Job show/list/wait.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobQuery {
    /// Job id (show, wait).
    pub job_id: Option<Uuid>,
    /// Repository filter (list).
    pub repository_id: Option<Uuid>,
}

/// Deployment workflow operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentRequest {
    /// Deployment id, i.e. the check instance id.
    pub deployment_id: Option<Uuid>,
    /// Monitoring system (pending, list).
    pub monitoring_id: Option<Uuid>,
    /// Forced status (set).
    pub status: Option<WorkflowStatus>,
    /// Forced next status (set).
    pub next_status: Option<WorkflowStatus>,
}

/// Per-host deployment views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRequest {
    /// Asset id of the node.
    pub asset_id: i64,
    /// Monitoring system asking.
    pub monitoring_id: Uuid,
    /// Deployment ids the monitoring system currently runs (assemble).
    #[serde(default)]
    pub known: Vec<Uuid>,
}

/// Repository stop/restart/rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemRequest {
    /// Repository to operate on.
    pub repository_id: Option<Uuid>,
    /// Rebuild level.
    pub rebuild_level: Option<RebuildLevel>,
}

/// Typed request payload.
#[derive(Debug, Clone, Default)]
#[allow(missing_docs)]
pub enum Payload {
    #[default]
    Empty,
    Repository(RepositoryRequest),
    Bucket(BucketRequest),
    Container(ContainerRequest),
    NodeConfig(NodeConfigRequest),
    Property(PropertyRequest),
    CheckConfig(CheckConfigRequest),
    Node(NodeRequest),
    Job(JobQuery),
    Deployment(DeploymentRequest),
    Host(HostRequest),
    System(SystemRequest),
    Authorize {
        section: Section,
        action: RequestAction,
    },
}

// ----------------------------------------------------------------------------
// Request / Response
// ----------------------------------------------------------------------------

/// A request routed to exactly one handler, answered with exactly one [`Response`].
#[derive(Debug)]
pub struct Request {
    /// Section.
    pub section: Section,
    /// Action.
    pub action: RequestAction,
    /// Authenticated user.
    pub user_id: Uuid,
    /// Job id, populated by GuidePost for asynchronous actions.
    pub job_id: Option<Uuid>,
    /// Typed payload.
    pub payload: Payload,
    reply: oneshot::Sender<Response>,
}

impl Request {
    /// Build a request and the receiver its response arrives on.
    pub fn new(
        section: Section,
        action: RequestAction,
        user_id: Uuid,
        payload: Payload,
    ) -> (Self, oneshot::Receiver<Response>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                section,
                action,
                user_id,
                job_id: None,
                payload,
                reply,
            },
            rx,
        )
    }

    /// Answer the request. A caller that went away is not an error.
    pub fn respond(self, response: Response) {
        let _ = self.reply.send(response);
    }

    /// Answer with the result of a handler.
    pub fn respond_with(self, result: Result<Response, SomaError>) {
        match result {
            Ok(response) => self.respond(response),
            Err(err) => self.respond(Response::from_error(&err)),
        }
    }

    /// Split off the reply channel.
    pub fn into_parts(self) -> (RequestHead, oneshot::Sender<Response>) {
        (
            RequestHead {
                section: self.section,
                action: self.action,
                user_id: self.user_id,
                job_id: self.job_id,
                payload: self.payload,
            },
            self.reply,
        )
    }
}

/// A request without its reply channel.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Section.
    pub section: Section,
    /// Action.
    pub action: RequestAction,
    /// Authenticated user.
    pub user_id: Uuid,
    /// Job id.
    pub job_id: Option<Uuid>,
    /// Typed payload.
    pub payload: Payload,
}

/// The single result of a request.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    /// Status code.
    pub status: Status,
    /// Section-typed body.
    pub body: Value,
    /// Job id for asynchronous operations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    /// Error text for failed requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// Successful response with a body.
    pub fn ok(body: Value) -> Self {
        Self {
            status: Status::Ok,
            body,
            job_id: None,
            error: None,
        }
    }

    /// Accepted asynchronous operation.
    pub fn accepted(job_id: Uuid, body: Value) -> Self {
        Self {
            job_id: Some(job_id),
            ..Self::ok(body)
        }
    }

    /// Failure response.
    pub fn failure(status: Status, error: impl Into<String>) -> Self {
        Self {
            status,
            body: Value::Null,
            job_id: None,
            error: Some(error.into()),
        }
    }

    /// Failure response derived from an error.
    pub fn from_error(err: &SomaError) -> Self {
        Self::failure(err.status(), err.to_string())
    }

    /// Whether the status is `ok`.
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}
