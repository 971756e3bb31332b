// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Repository-level scenarios: property inheritance across reloads, rebuilds
//! and keepers refusing work after their stored state diverged.

mod common;

use common::TestContext;
use soma_tree::{Constraint, ObjectKind, ObjectRef, PropertyValue};
use uuid::Uuid;

use soma_core::msg::{DeploymentRequest, PropertyRequest, RepositoryRequest, SystemRequest};
use soma_core::treekeeper::RebuildLevel;
use soma_core::{Payload, RequestAction, Section, Status};

fn retention(repository_id: Uuid, bucket_id: Uuid, days: &str) -> PropertyRequest {
    PropertyRequest {
        object: ObjectRef::new(ObjectKind::Bucket, bucket_id),
        repository_id: Some(repository_id),
        bucket_id: Some(bucket_id),
        source_instance_id: None,
        view: "internal".to_string(),
        inheritance: true,
        children_only: false,
        value: PropertyValue::System {
            name: "retention_days".to_string(),
            value: days.to_string(),
        },
    }
}

/// (source instance id, inherited from, value) of every property on an object.
async fn properties_on(ctx: &TestContext, object_id: Uuid) -> Vec<(Uuid, Option<Uuid>, PropertyValue)> {
    let rows: Vec<(Uuid, Option<Uuid>, String)> = sqlx::query_as(
        r#"
        SELECT source_instance_id, inherited_from, value FROM property_instances
        WHERE object_id = ?
        ORDER BY instance_id
        "#,
    )
    .bind(object_id)
    .fetch_all(ctx.db.pool())
    .await
    .unwrap();
    rows.into_iter()
        .map(|(source, from, value)| (source, from, serde_json::from_str(&value).unwrap()))
        .collect()
}

async fn show_repository(ctx: &TestContext, repository_id: Uuid) -> serde_json::Value {
    let shown = ctx
        .admin(
            Section::Repository,
            RequestAction::Show,
            Payload::Repository(RepositoryRequest {
                id: Some(repository_id),
                ..Default::default()
            }),
        )
        .await;
    assert!(shown.is_ok(), "repository show failed: {:?}", shown);
    shown.body
}

/// Wait until the keeper has left its loading state and return that state.
async fn settled_state(ctx: &TestContext, repository_id: Uuid) -> String {
    for _ in 0..500 {
        let state = show_repository(ctx, repository_id).await["keeper"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        if state != "loading" {
            return state;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("keeper of {} never finished loading", repository_id);
}

fn system(repository_id: Uuid, rebuild_level: Option<RebuildLevel>) -> Payload {
    Payload::System(SystemRequest {
        repository_id: Some(repository_id),
        rebuild_level,
    })
}

#[tokio::test]
async fn test_bucket_property_is_inherited_and_reloaded() {
    let ctx = TestContext::new().await;
    let repository_id = ctx.create_repository("alpha").await;
    let bucket_id = ctx.create_bucket(repository_id, "alpha_prod").await;
    ctx.assign_node(bucket_id).await;

    ctx.run_job(
        Section::Bucket,
        RequestAction::Add,
        Payload::Property(retention(repository_id, bucket_id, "30")),
    )
    .await;
    let expected = PropertyValue::System {
        name: "retention_days".to_string(),
        value: "30".to_string(),
    };

    let on_bucket = properties_on(&ctx, bucket_id).await;
    assert_eq!(on_bucket.len(), 1);
    let (source, from, value) = &on_bucket[0];
    assert_eq!(*from, None);
    assert_eq!(*value, expected);
    let on_node = properties_on(&ctx, ctx.node_id).await;
    assert_eq!(on_node, vec![(*source, Some(bucket_id), expected.clone())]);

    // A check constrained on the inherited value lands on the node.
    let mut request = ctx.node_check(repository_id, "retained", 60);
    request.constraints = vec![Constraint::System {
        name: "retention_days".to_string(),
        value: "30".to_string(),
    }];
    ctx.create_check(request).await;
    let instances = ctx.instances_on(ctx.node_id).await;
    assert_eq!(instances.len(), 1);

    let ctx = ctx.restart().await;
    assert_eq!(settled_state(&ctx, repository_id).await, "ready");
    assert_eq!(properties_on(&ctx, ctx.node_id).await, on_node);
    assert_eq!(ctx.instances_on(ctx.node_id).await, instances);

    // The reloaded tree still knows where the property came from.
    ctx.run_job(
        Section::Bucket,
        RequestAction::Remove,
        Payload::Property(PropertyRequest {
            source_instance_id: Some(*source),
            ..retention(repository_id, bucket_id, "30")
        }),
    )
    .await;
    assert!(properties_on(&ctx, ctx.node_id).await.is_empty());
    assert!(ctx.instances_on(ctx.node_id).await.is_empty());
}

#[tokio::test]
async fn test_rebuild_of_instances_causes_no_churn() {
    let ctx = TestContext::new().await;
    let repository_id = ctx.create_repository("alpha").await;
    let bucket_id = ctx.create_bucket(repository_id, "alpha_prod").await;
    ctx.assign_node(bucket_id).await;
    ctx.create_check(ctx.node_check(repository_id, "load-high", 60)).await;
    let deployment_id = ctx.instances_on(ctx.node_id).await[0];

    let deployment = |action| {
        ctx.admin(
            Section::Deployment,
            action,
            Payload::Deployment(DeploymentRequest {
                deployment_id: Some(deployment_id),
                ..Default::default()
            }),
        )
    };
    let poll = || {
        ctx.admin(
            Section::Deployment,
            RequestAction::Pending,
            Payload::Deployment(DeploymentRequest {
                monitoring_id: Some(ctx.monitoring_id),
                ..Default::default()
            }),
        )
    };
    assert!(deployment(RequestAction::Show).await.is_ok());
    assert!(deployment(RequestAction::Success).await.is_ok());
    poll().await;

    let rebuilt = ctx
        .admin(
            Section::System,
            RequestAction::Rebuild,
            system(repository_id, Some(RebuildLevel::Instances)),
        )
        .await;
    assert!(rebuilt.is_ok(), "rebuild failed: {:?}", rebuilt);
    ctx.wait_ready(repository_id).await;

    assert_eq!(ctx.instances_on(ctx.node_id).await, vec![deployment_id]);
    assert_eq!(ctx.row_statuses(deployment_id).await, vec!["active"]);
    let polled = poll().await;
    assert_eq!(polled.body["deployments"], serde_json::json!([]));
    let shown = deployment(RequestAction::Show).await;
    assert_eq!(shown.body["status"], "active");
    assert_eq!(shown.body["version"], 1);
}

#[tokio::test]
async fn test_rebuild_needs_a_level() {
    let ctx = TestContext::new().await;
    let repository_id = ctx.create_repository("alpha").await;
    let response = ctx
        .admin(
            Section::System,
            RequestAction::Rebuild,
            system(repository_id, None),
        )
        .await;
    assert_eq!(response.status, Status::BadRequest);
}

#[tokio::test]
async fn test_diverged_repository_is_broken_after_restart() {
    let ctx = TestContext::new().await;
    let repository_id = ctx.create_repository("alpha").await;
    let bucket_id = ctx.create_bucket(repository_id, "alpha_prod").await;
    ctx.assign_node(bucket_id).await;
    ctx.create_check(ctx.node_check(repository_id, "load-high", 60)).await;
    let instance_id = ctx.instances_on(ctx.node_id).await[0];

    // Remove the stored instance behind the keeper's back.
    sqlx::query("DELETE FROM check_instance_configurations WHERE check_instance_id = ?")
        .bind(instance_id)
        .execute(ctx.db.pool())
        .await
        .unwrap();
    sqlx::query("DELETE FROM check_instances WHERE id = ?")
        .bind(instance_id)
        .execute(ctx.db.pool())
        .await
        .unwrap();

    let restarted = ctx
        .admin(
            Section::System,
            RequestAction::Restart,
            system(repository_id, None),
        )
        .await;
    assert!(restarted.is_ok(), "restart failed: {:?}", restarted);
    assert_eq!(settled_state(&ctx, repository_id).await, "broken");

    let refused = ctx
        .admin(
            Section::Bucket,
            RequestAction::Create,
            Payload::Bucket(soma_core::msg::BucketRequest {
                id: None,
                name: "alpha_qa".to_string(),
                repository_id: Some(repository_id),
                environment: "qa".to_string(),
                team_id: None,
            }),
        )
        .await;
    assert_eq!(refused.status, Status::Unavailable);
    assert_eq!(
        refused.error.as_deref(),
        Some("unavailable: repository alpha broken")
    );
    // Nothing was recomputed into the database.
    assert!(ctx.instances_on(ctx.node_id).await.is_empty());
}
