// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests: tree mutations through GuidePost and TreeKeeper down to
//! the deployment workflow a monitoring system drives.

mod common;

use common::TestContext;
use serde_json::Value;
use uuid::Uuid;

use soma_core::msg::{CheckConfigRequest, DeploymentRequest, NodeConfigRequest, ThresholdSpec};
use soma_core::{Payload, RequestAction, Section, Status};

/// Repository `acme` with bucket `acme_live` holding the fixture node.
async fn assigned_node(ctx: &TestContext) -> (Uuid, Uuid) {
    let repository_id = ctx.create_repository("acme").await;
    let bucket_id = ctx.create_bucket(repository_id, "acme_live").await;
    ctx.assign_node(bucket_id).await;
    (repository_id, bucket_id)
}

async fn deployment(
    ctx: &TestContext,
    action: RequestAction,
    deployment_id: Uuid,
) -> soma_core::Response {
    ctx.admin(
        Section::Deployment,
        action,
        Payload::Deployment(DeploymentRequest {
            deployment_id: Some(deployment_id),
            ..Default::default()
        }),
    )
    .await
}

async fn pending(ctx: &TestContext) -> Vec<Uuid> {
    let response = ctx
        .admin(
            Section::Deployment,
            RequestAction::Pending,
            Payload::Deployment(DeploymentRequest {
                monitoring_id: Some(ctx.monitoring_id),
                ..Default::default()
            }),
        )
        .await;
    assert!(response.is_ok(), "pending failed: {:?}", response);
    serde_json::from_value(response.body["deployments"].clone()).unwrap()
}

/// Show, then confirm: the deployment ends up active.
async fn roll_out(ctx: &TestContext, deployment_id: Uuid) -> Value {
    let shown = deployment(ctx, RequestAction::Show, deployment_id).await;
    assert!(shown.is_ok(), "show failed: {:?}", shown);
    assert_eq!(shown.body["status"], "rollout_in_progress");
    assert_eq!(shown.body["task"], "rollout");

    let confirmed = deployment(ctx, RequestAction::Success, deployment_id).await;
    assert!(confirmed.is_ok(), "success failed: {:?}", confirmed);
    assert_eq!(confirmed.body["status"], "active");
    shown.body
}

#[tokio::test]
async fn test_check_on_node_is_rolled_out() {
    let ctx = TestContext::new().await;
    let (repository_id, _) = assigned_node(&ctx).await;

    ctx.create_check(ctx.node_check(repository_id, "load", 60)).await;

    let instances = ctx.instances_on(ctx.node_id).await;
    assert_eq!(instances.len(), 1);
    let deployment_id = instances[0];
    assert_eq!(ctx.row_statuses(deployment_id).await, vec!["awaiting_rollout"]);

    assert_eq!(pending(&ctx).await, vec![deployment_id]);
    // The update flag is consumed by polling.
    assert!(pending(&ctx).await.is_empty());

    let shown = roll_out(&ctx, deployment_id).await;
    assert_eq!(shown["version"], 1);
    assert!(shown["deployment"].is_object());
    assert_eq!(ctx.row_statuses(deployment_id).await, vec!["active"]);

    // Confirming twice is not a legal transition.
    let again = deployment(&ctx, RequestAction::Success, deployment_id).await;
    assert_eq!(again.status, Status::BadRequest);
}

#[tokio::test]
async fn test_recreated_check_waits_for_deprovision() {
    let ctx = TestContext::new().await;
    let (repository_id, _) = assigned_node(&ctx).await;

    let config_id = ctx.create_check(ctx.node_check(repository_id, "load", 60)).await;
    let deployment_id = ctx.instances_on(ctx.node_id).await[0];
    roll_out(&ctx, deployment_id).await;

    ctx.run_job(
        Section::CheckConfig,
        RequestAction::Destroy,
        Payload::CheckConfig(CheckConfigRequest {
            id: Some(config_id),
            ..ctx.node_check(repository_id, "load", 60)
        }),
    )
    .await;
    assert!(ctx.instances_on(ctx.node_id).await.is_empty());
    assert_eq!(ctx.row_statuses(deployment_id).await, vec!["awaiting_deprovision"]);

    // Same name and object, new interval: the instance comes back under the
    // same id and its new version queues behind the old one.
    ctx.create_check(ctx.node_check(repository_id, "load", 300)).await;
    assert_eq!(ctx.instances_on(ctx.node_id).await, vec![deployment_id]);
    assert_eq!(ctx.instance_version(deployment_id).await, 1);
    assert_eq!(
        ctx.row_statuses(deployment_id).await,
        vec!["awaiting_deprovision", "blocked"]
    );

    let shown = deployment(&ctx, RequestAction::Show, deployment_id).await;
    assert!(shown.is_ok(), "show failed: {:?}", shown);
    assert_eq!(shown.body["status"], "deprovision_in_progress");
    assert_eq!(shown.body["task"], "deprovision");
    assert_eq!(shown.body["version"], 1);

    let confirmed = deployment(&ctx, RequestAction::Success, deployment_id).await;
    assert_eq!(confirmed.body["status"], "deprovisioned");
    assert_eq!(
        ctx.row_statuses(deployment_id).await,
        vec!["deprovisioned", "awaiting_rollout"]
    );
    assert_eq!(pending(&ctx).await, vec![deployment_id]);

    let shown = roll_out(&ctx, deployment_id).await;
    assert_eq!(shown["version"], 2);
}

async fn destroy_check(ctx: &TestContext, repository_id: Uuid, config_id: Uuid) {
    ctx.run_job(
        Section::CheckConfig,
        RequestAction::Destroy,
        Payload::CheckConfig(CheckConfigRequest {
            id: Some(config_id),
            ..ctx.node_check(repository_id, "load", 60)
        }),
    )
    .await;
}

#[tokio::test]
async fn test_revived_instance_version_survives_restart() {
    let ctx = TestContext::new().await;
    let (repository_id, _) = assigned_node(&ctx).await;

    let config_id = ctx.create_check(ctx.node_check(repository_id, "load", 60)).await;
    let deployment_id = ctx.instances_on(ctx.node_id).await[0];
    assert_eq!(ctx.instance_version(deployment_id).await, 0);
    destroy_check(&ctx, repository_id, config_id).await;
    let config_id = ctx.create_check(ctx.node_check(repository_id, "load", 120)).await;
    assert_eq!(ctx.instance_version(deployment_id).await, 1);

    // After a restart the deleted row's version is only known to the database.
    destroy_check(&ctx, repository_id, config_id).await;
    let ctx = ctx.restart().await;
    ctx.wait_ready(repository_id).await;
    ctx.create_check(ctx.node_check(repository_id, "load", 300)).await;
    assert_eq!(ctx.instances_on(ctx.node_id).await, vec![deployment_id]);
    assert_eq!(ctx.instance_version(deployment_id).await, 2);
}

#[tokio::test]
async fn test_unassigned_node_deployment_is_deleted() {
    let ctx = TestContext::new().await;
    let (repository_id, bucket_id) = assigned_node(&ctx).await;
    ctx.create_check(ctx.node_check(repository_id, "load", 60)).await;
    let deployment_id = ctx.instances_on(ctx.node_id).await[0];
    roll_out(&ctx, deployment_id).await;

    ctx.run_job(
        Section::NodeConfig,
        RequestAction::Unassign,
        Payload::NodeConfig(NodeConfigRequest {
            node_id: ctx.node_id,
            bucket_id,
            repository_id: Some(repository_id),
        }),
    )
    .await;

    let shown = deployment(&ctx, RequestAction::Show, deployment_id).await;
    assert!(shown.is_ok(), "show failed: {:?}", shown);
    assert_eq!(shown.body["status"], "deprovision_in_progress");
    assert_eq!(shown.body["task"], "delete");

    let confirmed = deployment(&ctx, RequestAction::Success, deployment_id).await;
    assert_eq!(confirmed.body["status"], "deprovisioned");
    // Nothing left to poll.
    let listed = ctx
        .admin(
            Section::Deployment,
            RequestAction::List,
            Payload::Deployment(DeploymentRequest {
                monitoring_id: Some(ctx.monitoring_id),
                ..Default::default()
            }),
        )
        .await;
    assert_eq!(listed.body["deployments"], serde_json::json!([]));
}

#[tokio::test]
async fn test_failed_rollout_can_be_retried() {
    let ctx = TestContext::new().await;
    let (repository_id, _) = assigned_node(&ctx).await;
    ctx.create_check(ctx.node_check(repository_id, "load", 60)).await;
    let deployment_id = ctx.instances_on(ctx.node_id).await[0];

    deployment(&ctx, RequestAction::Show, deployment_id).await;
    let failed = deployment(&ctx, RequestAction::Failed, deployment_id).await;
    assert_eq!(failed.body["status"], "rollout_failed");

    let retried = deployment(&ctx, RequestAction::Retry, deployment_id).await;
    assert_eq!(retried.body["status"], "awaiting_rollout");

    roll_out(&ctx, deployment_id).await;
}

#[tokio::test]
async fn test_thresholds_are_listed_by_level() {
    let ctx = TestContext::new().await;
    let (repository_id, _) = assigned_node(&ctx).await;
    let threshold = |predicate: &str, level: &str, value| ThresholdSpec {
        predicate: predicate.to_string(),
        level: level.to_string(),
        value,
    };
    ctx.create_check(CheckConfigRequest {
        thresholds: vec![
            threshold(">", "critical", 10),
            threshold(">=", "info", 2),
            threshold(">", "warning", 4),
        ],
        ..ctx.node_check(repository_id, "load", 60)
    })
    .await;
    let deployment_id = ctx.instances_on(ctx.node_id).await[0];

    let shown = roll_out(&ctx, deployment_id).await;
    let levels: Vec<&str> = shown["deployment"]["capability"]["thresholds"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["level"].as_str().unwrap())
        .collect();
    assert_eq!(levels, vec!["info", "warning", "critical"]);
}

#[tokio::test]
async fn test_unknown_deployment() {
    let ctx = TestContext::new().await;
    let response = deployment(&ctx, RequestAction::Show, Uuid::new_v4()).await;
    assert_eq!(response.status, Status::NotFound);
}
