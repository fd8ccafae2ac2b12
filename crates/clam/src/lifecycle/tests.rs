//! Tests for the sandbox manager against the in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use futures::StreamExt;

use super::*;
use crate::audit::AuditAction;
use crate::backends::MemoryBackends;
use crate::clock::{Clock, ManualClock};
use crate::error::{ErrorCode, NodeError, ObjectStorageError};
use crate::model::{ExecStatus, SessionStatus};
use crate::node_client::{
    CollectedArtifact, CreateSessionRequest, ExecRequest, ExecResult, FileEntry, NodeClient,
    NodeOp, NodeResult, SessionExecRequest,
};
use crate::object_store::{ObjectResult, ObjectStorage};
use crate::repo::{ActivityRepository, IdempotencyRepository, NodeRepository, SandboxRepository};

const ORG: &str = "org_a";

struct Harness {
    memory: MemoryBackends,
    clock: Arc<ManualClock>,
    manager: SandboxManager,
}

async fn harness() -> Harness {
    let clock = Arc::new(ManualClock::default());
    let memory = MemoryBackends::new(clock.clone());
    memory
        .add_node("node_1", 8, Duration::from_secs(45))
        .await
        .unwrap();
    let manager = SandboxManager::new(memory.backends(), ControlPlaneConfig::default());
    Harness {
        memory,
        clock,
        manager,
    }
}

fn with_quota(h: &Harness, quota: OrgQuota) {
    h.memory.quotas.set_org_quota(ORG, quota);
}

async fn create(h: &Harness) -> Sandbox {
    h.manager
        .create(ORG, CreateSandboxParams::default())
        .await
        .unwrap()
}

/// Object storage that rejects every call.
#[derive(Debug)]
struct FailingObjects;

#[async_trait::async_trait]
impl ObjectStorage for FailingObjects {
    async fn put_object(&self, key: &str, _: Vec<u8>, _: &str) -> ObjectResult<()> {
        Err(ObjectStorageError::Backend(format!("put {key} refused")))
    }

    async fn get_object(&self, key: &str) -> ObjectResult<Vec<u8>> {
        Err(ObjectStorageError::Backend(format!("get {key} refused")))
    }

    async fn delete_object(&self, key: &str) -> ObjectResult<()> {
        Err(ObjectStorageError::Backend(format!("delete {key} refused")))
    }

    async fn get_presigned_url(&self, key: &str, _: Duration) -> ObjectResult<String> {
        Err(ObjectStorageError::Backend(format!("presign {key} refused")))
    }
}

async fn lifecycle_targets(h: &Harness, id: &str) -> Vec<String> {
    h.manager
        .events()
        .events_after(&EventKey::Sandbox(id.to_string()), None)
        .await
        .unwrap()
        .into_iter()
        .map(|event| event.payload["to"].as_str().unwrap_or_default().to_string())
        .collect()
}

// ==================== Create Tests ====================

#[tokio::test]
async fn test_create_with_defaults_runs_on_a_node() {
    let h = harness().await;
    let sandbox = create(&h).await;

    assert_eq!(sandbox.status, SandboxStatus::Running);
    assert_eq!(sandbox.node_id.as_deref(), Some("node_1"));
    assert_eq!(sandbox.image_id, "img_ubuntu-22.04");
    assert_eq!(sandbox.profile_name, DEFAULT_PROFILE);
    assert_eq!(sandbox.ttl_seconds, 3600);
    assert_eq!(sandbox.root_id, sandbox.id);
    assert_eq!(sandbox.fork_depth, 0);
    assert_eq!(sandbox.started_at, Some(h.clock.now()));
    assert!(h.memory.node.is_running(&sandbox.id));

    assert_eq!(
        lifecycle_targets(&h, &sandbox.id).await,
        ["provisioning", "running"]
    );
    let audit = h.memory.audit.entries();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, AuditAction::SandboxCreate);
    assert_eq!(
        h.memory.billing.usage(ORG, BillableAction::SandboxCreate),
        1
    );
}

#[tokio::test]
async fn test_create_rejects_unknown_catalog_entries() {
    let h = harness().await;
    let err = h
        .manager
        .create(
            ORG,
            CreateSandboxParams {
                image: Some("windows-95".to_string()),
                ..CreateSandboxParams::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);

    let err = h
        .manager
        .create(
            ORG,
            CreateSandboxParams {
                profile: Some("huge".to_string()),
                ..CreateSandboxParams::default()
            },
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("huge"));
    assert_eq!(h.memory.repo.sandbox_count().unwrap(), 0);
}

#[tokio::test]
async fn test_create_accepts_named_profile() {
    let h = harness().await;
    let sandbox = h
        .manager
        .create(
            ORG,
            CreateSandboxParams {
                profile: Some("large".to_string()),
                ..CreateSandboxParams::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(sandbox.profile_name, "large");
    assert_eq!(sandbox.profile_id, "prof_large");
}

#[tokio::test]
async fn test_create_ttl_bounded_by_org_max() {
    let h = harness().await;
    with_quota(
        &h,
        OrgQuota {
            max_ttl_seconds: 600,
            ..OrgQuota::default()
        },
    );

    let err = h
        .manager
        .create(
            ORG,
            CreateSandboxParams {
                ttl_seconds: Some(601),
                ..CreateSandboxParams::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
    assert!(err.to_string().contains("600"), "{err}");

    let ok = h
        .manager
        .create(
            ORG,
            CreateSandboxParams {
                ttl_seconds: Some(600),
                ..CreateSandboxParams::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(ok.ttl_seconds, 600);
}

#[tokio::test]
async fn test_create_rejects_invalid_env_names() {
    let h = harness().await;
    let err = h
        .manager
        .create(
            ORG,
            CreateSandboxParams {
                env: BTreeMap::from([("A=B".to_string(), "x".to_string())]),
                ..CreateSandboxParams::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Validation(_)));
}

#[tokio::test]
async fn test_create_at_concurrency_limit_is_quota_error() {
    let h = harness().await;
    with_quota(
        &h,
        OrgQuota {
            max_concurrent_sandboxes: 2,
            ..OrgQuota::default()
        },
    );
    create(&h).await;
    create(&h).await;

    let err = h
        .manager
        .create(ORG, CreateSandboxParams::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ControlError::QuotaExceeded {
            active: 2,
            limit: 2
        }
    ));
    assert_eq!(h.memory.repo.sandbox_count().unwrap(), 2);

    // Other orgs are unaffected.
    h.manager
        .create("org_b", CreateSandboxParams::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_create_denied_by_billing_writes_nothing() {
    let h = harness().await;
    h.memory.billing.deny(ORG);
    let err = h
        .manager
        .create(ORG, CreateSandboxParams::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BillingLimit);
    assert_eq!(h.memory.repo.sandbox_count().unwrap(), 0);
}

#[tokio::test]
async fn test_create_without_capacity_leaves_sandbox_queued() {
    let h = harness().await;
    h.clock.advance(TimeDelta::seconds(60));

    let err = h
        .manager
        .create(ORG, CreateSandboxParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::NoCapacity));
    assert_eq!(err.code(), ErrorCode::ServiceUnavailable);

    let queued = h
        .memory
        .repo
        .list_by_status(SandboxStatus::Queued)
        .await
        .unwrap();
    assert_eq!(queued.len(), 1);
    assert!(queued[0].node_id.is_none());
}

#[tokio::test]
async fn test_create_skips_full_and_draining_nodes() {
    let h = harness().await;
    h.memory
        .add_node("node_2", 1, Duration::from_secs(45))
        .await
        .unwrap();
    h.memory
        .repo
        .upsert_node(Node {
            id: "node_1".to_string(),
            status: NodeStatus::Draining,
            slots_total: 8,
        })
        .await
        .unwrap();

    let first = create(&h).await;
    assert_eq!(first.node_id.as_deref(), Some("node_2"));

    let err = h
        .manager
        .create(ORG, CreateSandboxParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::NoCapacity));
}

#[tokio::test]
async fn test_create_spreads_over_least_loaded_node() {
    let h = harness().await;
    h.memory
        .add_node("node_2", 8, Duration::from_secs(45))
        .await
        .unwrap();

    let a = create(&h).await;
    let b = create(&h).await;
    assert_ne!(a.node_id, b.node_id);
}

#[tokio::test]
async fn test_create_provision_failure_fails_sandbox() {
    let h = harness().await;
    h.memory.node.fail(NodeOp::CreateSandbox);

    let err = h
        .manager
        .create(ORG, CreateSandboxParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Node(_)));

    let failed = h
        .memory
        .repo
        .list_by_status(SandboxStatus::Failed)
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].failure_reason, Some(FailureReason::ProvisionFailed));
    assert!(failed[0].ended_at.is_some());
}

/// Loopback node that lets a delete land while a VM is booting.
#[derive(Debug)]
struct DeleteDuringBoot {
    inner: Arc<crate::node_client::LoopbackNodeClient>,
    repo: Arc<crate::repo::InMemoryRepository>,
    clock: Arc<ManualClock>,
}

impl DeleteDuringBoot {
    async fn delete_row(&self, sandbox_id: &str) -> NodeResult<()> {
        self.repo
            .soft_delete(sandbox_id, self.clock.now(), FailureReason::SandboxDeleted)
            .await
            .map(|_| ())
            .map_err(|err| NodeError::Rejected(err.to_string()))
    }
}

#[async_trait::async_trait]
impl NodeClient for DeleteDuringBoot {
    async fn create_sandbox(&self, node_id: &str, request: &CreateSandboxRequest) -> NodeResult<()> {
        self.inner.create_sandbox(node_id, request).await?;
        self.delete_row(&request.sandbox_id).await
    }

    async fn fork_sandbox(&self, node_id: &str, request: &ForkSandboxRequest) -> NodeResult<()> {
        self.inner.fork_sandbox(node_id, request).await?;
        self.delete_row(&request.new_sandbox_id).await
    }

    async fn stop_sandbox(&self, node_id: &str, sandbox_id: &str) -> NodeResult<()> {
        self.inner.stop_sandbox(node_id, sandbox_id).await
    }

    async fn destroy_sandbox(&self, node_id: &str, sandbox_id: &str) -> NodeResult<()> {
        self.inner.destroy_sandbox(node_id, sandbox_id).await
    }

    async fn exec(&self, node_id: &str, request: &ExecRequest) -> NodeResult<ExecResult> {
        self.inner.exec(node_id, request).await
    }

    async fn create_session(&self, node_id: &str, request: &CreateSessionRequest) -> NodeResult<()> {
        self.inner.create_session(node_id, request).await
    }

    async fn session_exec(
        &self,
        node_id: &str,
        request: &SessionExecRequest,
    ) -> NodeResult<ExecResult> {
        self.inner.session_exec(node_id, request).await
    }

    async fn session_input(
        &self,
        node_id: &str,
        sandbox_id: &str,
        session_id: &str,
        data: &str,
    ) -> NodeResult<()> {
        crate::node_client::NodeClient::session_input(
            &*self.inner,
            node_id,
            sandbox_id,
            session_id,
            data,
        )
        .await
    }

    async fn destroy_session(
        &self,
        node_id: &str,
        sandbox_id: &str,
        session_id: &str,
    ) -> NodeResult<()> {
        self.inner
            .destroy_session(node_id, sandbox_id, session_id)
            .await
    }

    async fn put_file(
        &self,
        node_id: &str,
        sandbox_id: &str,
        path: &str,
        data: Vec<u8>,
    ) -> NodeResult<u64> {
        self.inner.put_file(node_id, sandbox_id, path, data).await
    }

    async fn get_file(&self, node_id: &str, sandbox_id: &str, path: &str) -> NodeResult<Vec<u8>> {
        self.inner.get_file(node_id, sandbox_id, path).await
    }

    async fn list_files(
        &self,
        node_id: &str,
        sandbox_id: &str,
        path: &str,
    ) -> NodeResult<Vec<FileEntry>> {
        self.inner.list_files(node_id, sandbox_id, path).await
    }

    async fn delete_file(&self, node_id: &str, sandbox_id: &str, path: &str) -> NodeResult<()> {
        self.inner.delete_file(node_id, sandbox_id, path).await
    }

    async fn collect_artifacts(
        &self,
        node_id: &str,
        sandbox_id: &str,
        paths: &[String],
    ) -> NodeResult<Vec<CollectedArtifact>> {
        self.inner
            .collect_artifacts(node_id, sandbox_id, paths)
            .await
    }
}

fn racing_manager(h: &Harness) -> SandboxManager {
    let mut backends = h.memory.backends();
    backends.node_client = Arc::new(DeleteDuringBoot {
        inner: h.memory.node.clone(),
        repo: h.memory.repo.clone(),
        clock: h.clock.clone(),
    });
    SandboxManager::new(backends, ControlPlaneConfig::default())
}

#[tokio::test]
async fn test_create_destroys_vm_when_deleted_during_boot() {
    let h = harness().await;
    let manager = racing_manager(&h);

    let err = manager
        .create(ORG, CreateSandboxParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Conflict(_)), "{err}");

    let page = h.manager.list(ORG, SandboxFilter::for_org(ORG)).await.unwrap();
    let sandbox = &page.sandboxes[0];
    assert_eq!(sandbox.status, SandboxStatus::Deleted);
    assert_eq!(h.memory.node.calls(NodeOp::DestroySandbox), 1);
    assert!(!h.memory.node.is_running(&sandbox.id));
    assert!(h.memory.audit.entries().is_empty());
}

#[tokio::test]
async fn test_fork_destroys_vm_when_child_deleted_during_boot() {
    let h = harness().await;
    let parent = create(&h).await;
    let manager = racing_manager(&h);

    let err = manager
        .fork(ORG, &parent.id, ForkSandboxParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Conflict(_)), "{err}");

    let mut filter = SandboxFilter::for_org(ORG);
    filter.forked_from = Some(parent.id.clone());
    let page = h.manager.list(ORG, filter).await.unwrap();
    let child_id = page.sandboxes[0].id.clone();
    assert_eq!(page.sandboxes[0].status, SandboxStatus::Deleted);
    assert_eq!(h.memory.node.calls(NodeOp::DestroySandbox), 1);
    assert!(!h.memory.node.is_running(&child_id));
    assert!(h.memory.node.is_running(&parent.id));
}

// ==================== Idempotency Tests ====================

#[tokio::test]
async fn test_create_with_same_key_returns_same_sandbox() {
    let h = harness().await;
    let params = CreateSandboxParams {
        idempotency_key: Some("req-1".to_string()),
        ..CreateSandboxParams::default()
    };

    let first = h.manager.create(ORG, params.clone()).await.unwrap();
    let second = h.manager.create(ORG, params.clone()).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(h.memory.repo.sandbox_count().unwrap(), 1);

    // Keys are scoped per org.
    let other = h.manager.create("org_b", params).await.unwrap();
    assert_ne!(other.id, first.id);
}

#[tokio::test]
async fn test_create_with_in_flight_key_conflicts() {
    let h = harness().await;
    h.memory
        .repo
        .reserve(ORG, "req-1", h.clock.now(), TimeDelta::hours(24))
        .await
        .unwrap();

    let err = h
        .manager
        .create(
            ORG,
            CreateSandboxParams {
                idempotency_key: Some("req-1".to_string()),
                ..CreateSandboxParams::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Conflict(_)));
}

#[tokio::test]
async fn test_failed_create_releases_key_for_retry() {
    let h = harness().await;
    h.memory.billing.deny(ORG);
    let params = CreateSandboxParams {
        idempotency_key: Some("req-1".to_string()),
        ..CreateSandboxParams::default()
    };
    assert!(h.manager.create(ORG, params.clone()).await.is_err());
    assert!(h.memory.repo.idempotency_records().unwrap().is_empty());
}

// ==================== Fork Tests ====================

#[tokio::test]
async fn test_fork_inherits_and_merges_env() {
    let h = harness().await;
    let parent = h
        .manager
        .create(
            ORG,
            CreateSandboxParams {
                env: BTreeMap::from([
                    ("A".to_string(), "1".to_string()),
                    ("B".to_string(), "1".to_string()),
                ]),
                ttl_seconds: Some(1200),
                ..CreateSandboxParams::default()
            },
        )
        .await
        .unwrap();

    let child = h
        .manager
        .fork(
            ORG,
            &parent.id,
            ForkSandboxParams {
                env: BTreeMap::from([("B".to_string(), "2".to_string())]),
                ..ForkSandboxParams::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(child.status, SandboxStatus::Running);
    assert_eq!(child.forked_from.as_deref(), Some(parent.id.as_str()));
    assert_eq!(child.root_id, parent.id);
    assert_eq!(child.fork_depth, parent.fork_depth + 1);
    assert_eq!(child.node_id, parent.node_id);
    assert_eq!(child.ttl_seconds, 1200);
    assert_eq!(child.env["A"], "1");
    assert_eq!(child.env["B"], "2");
    assert_eq!(h.memory.node.node_of(&child.id), parent.node_id);

    let parent = h.manager.get(ORG, &parent.id).await.unwrap();
    assert_eq!(parent.fork_count, 1);
}

#[tokio::test]
async fn test_fork_tree_shows_single_running_child() {
    let h = harness().await;
    let parent = create(&h).await;
    let child = h
        .manager
        .fork(ORG, &parent.id, ForkSandboxParams::default())
        .await
        .unwrap();

    let tree = h.manager.fork_tree(ORG, &parent.id).await.unwrap();
    assert_eq!(tree.root, parent.id);
    let root = tree.node(&parent.id).unwrap();
    assert_eq!(root.children, [child.id.clone()]);
    let node = tree.node(&child.id).unwrap();
    assert_eq!(node.status, SandboxStatus::Running);
    assert_eq!(node.forked_from.as_deref(), Some(parent.id.as_str()));

    // Same tree from the child's side.
    let from_child = h.manager.fork_tree(ORG, &child.id).await.unwrap();
    assert_eq!(from_child, tree);
}

#[tokio::test]
async fn test_fork_requires_running_parent() {
    let h = harness().await;
    let parent = create(&h).await;
    h.manager.stop(ORG, &parent.id).await.unwrap();

    let err = h
        .manager
        .fork(ORG, &parent.id, ForkSandboxParams::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ControlError::NotRunning {
            status: SandboxStatus::Stopped,
            ..
        }
    ));
}

#[tokio::test]
async fn test_fork_depth_limit() {
    let h = harness().await;
    with_quota(
        &h,
        OrgQuota {
            max_fork_depth: 2,
            ..OrgQuota::default()
        },
    );
    let root = create(&h).await;
    let one = h
        .manager
        .fork(ORG, &root.id, ForkSandboxParams::default())
        .await
        .unwrap();
    let two = h
        .manager
        .fork(ORG, &one.id, ForkSandboxParams::default())
        .await
        .unwrap();
    assert_eq!(two.fork_depth, 2);

    let err = h
        .manager
        .fork(ORG, &two.id, ForkSandboxParams::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ControlError::ForkDepthExceeded { depth: 3, limit: 2 }
    ));
    let two = h.manager.get(ORG, &two.id).await.unwrap();
    assert_eq!(two.fork_count, 0);
}

#[tokio::test]
async fn test_fork_count_limit() {
    let h = harness().await;
    with_quota(
        &h,
        OrgQuota {
            max_forks_per_sandbox: 2,
            ..OrgQuota::default()
        },
    );
    let parent = create(&h).await;
    for _ in 0..2 {
        h.manager
            .fork(ORG, &parent.id, ForkSandboxParams::default())
            .await
            .unwrap();
    }

    let err = h
        .manager
        .fork(ORG, &parent.id, ForkSandboxParams::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ForkLimitExceeded);
    assert_eq!(h.memory.repo.sandbox_count().unwrap(), 3);
}

#[tokio::test]
async fn test_fork_counts_against_concurrency() {
    let h = harness().await;
    with_quota(
        &h,
        OrgQuota {
            max_concurrent_sandboxes: 1,
            ..OrgQuota::default()
        },
    );
    let parent = create(&h).await;
    let err = h
        .manager
        .fork(ORG, &parent.id, ForkSandboxParams::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::QuotaExceeded);
    let parent = h.manager.get(ORG, &parent.id).await.unwrap();
    assert_eq!(parent.fork_count, 0);
}

#[tokio::test]
async fn test_fork_rpc_failure_keeps_accounting() {
    let h = harness().await;
    let parent = create(&h).await;
    h.memory.node.fail(NodeOp::ForkSandbox);

    let err = h
        .manager
        .fork(ORG, &parent.id, ForkSandboxParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Node(_)));

    let parent = h.manager.get(ORG, &parent.id).await.unwrap();
    assert_eq!(parent.fork_count, 1);
    let queued = h
        .memory
        .repo
        .list_by_status(SandboxStatus::Queued)
        .await
        .unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].forked_from.as_deref(), Some(parent.id.as_str()));
}

#[tokio::test]
async fn test_fork_of_other_orgs_sandbox_is_not_found() {
    let h = harness().await;
    let parent = create(&h).await;
    let err = h
        .manager
        .fork("org_b", &parent.id, ForkSandboxParams::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

// ==================== Stop Tests ====================

#[tokio::test]
async fn test_stop_is_idempotent() {
    let h = harness().await;
    let sandbox = create(&h).await;

    let first = h.manager.stop(ORG, &sandbox.id).await.unwrap();
    assert_eq!(first.disposition, StopDisposition::Stopped);
    assert_eq!(first.disposition.http_status(), 200);
    assert_eq!(first.sandbox.status, SandboxStatus::Stopped);
    assert_eq!(
        first.sandbox.failure_reason,
        Some(FailureReason::SandboxStopped)
    );
    assert!(first.sandbox.ended_at.is_some());
    assert!(!h.memory.node.is_running(&sandbox.id));

    let second = h.manager.stop(ORG, &sandbox.id).await.unwrap();
    assert_eq!(second.disposition, StopDisposition::AlreadyTerminal);
    assert_eq!(second.sandbox.status, SandboxStatus::Stopped);
    assert_eq!(second.sandbox.ended_at, first.sandbox.ended_at);
    assert_eq!(h.memory.node.calls(NodeOp::StopSandbox), 1);

    assert_eq!(
        lifecycle_targets(&h, &sandbox.id).await,
        ["provisioning", "running", "stopping", "stopped"]
    );
    let stops = h
        .memory
        .audit
        .entries()
        .into_iter()
        .filter(|e| e.action == AuditAction::SandboxStop)
        .count();
    assert_eq!(stops, 1);
}

#[tokio::test]
async fn test_stop_in_flight_returns_accepted() {
    let h = harness().await;
    let mut sandbox = create(&h).await;
    sandbox.status = SandboxStatus::Stopping;
    h.memory.repo.put_sandbox(sandbox.clone()).unwrap();

    let outcome = h.manager.stop(ORG, &sandbox.id).await.unwrap();
    assert_eq!(outcome.disposition, StopDisposition::InProgress);
    assert_eq!(outcome.disposition.http_status(), 202);
    assert_eq!(h.memory.node.calls(NodeOp::StopSandbox), 0);
}

#[tokio::test]
async fn test_stop_completes_when_node_is_unreachable() {
    let h = harness().await;
    let sandbox = create(&h).await;
    h.manager
        .register_artifacts(ORG, &sandbox.id, &["/out/report.txt".to_string()])
        .await
        .unwrap();
    h.memory.node.set_unreachable("node_1", true);

    let outcome = h.manager.stop(ORG, &sandbox.id).await.unwrap();
    assert_eq!(outcome.sandbox.status, SandboxStatus::Stopped);
    let artifacts = h.manager.list_artifacts(ORG, &sandbox.id).await.unwrap();
    assert!(artifacts[0].storage_ref.is_none());
}

#[tokio::test]
async fn test_stop_collects_registered_artifacts() {
    let h = harness().await;
    let sandbox = create(&h).await;
    h.manager
        .put_file(ORG, &sandbox.id, "/out/report.txt", b"hello".to_vec())
        .await
        .unwrap();
    let registered = h
        .manager
        .register_artifacts(
            ORG,
            &sandbox.id,
            &["/out/report.txt".to_string(), "/out/missing.bin".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(registered.len(), 2);

    h.manager.stop(ORG, &sandbox.id).await.unwrap();

    let artifacts = h.manager.list_artifacts(ORG, &sandbox.id).await.unwrap();
    let report = artifacts
        .iter()
        .find(|a| a.name == "/out/report.txt")
        .unwrap();
    assert_eq!(report.bytes, 5);
    assert_eq!(
        report.sha256.as_deref(),
        Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
    );
    assert_eq!(
        report.storage_ref.as_deref(),
        Some(format!("{}/artifacts/report.txt", sandbox.id).as_str())
    );
    assert_eq!(
        report.retention_until,
        Some(h.clock.now() + TimeDelta::days(30))
    );
    let missing = artifacts
        .iter()
        .find(|a| a.name == "/out/missing.bin")
        .unwrap();
    assert!(missing.storage_ref.is_none());
}

#[tokio::test]
async fn test_stop_archives_lifecycle_events() {
    let h = harness().await;
    let sandbox = create(&h).await;
    h.manager.stop(ORG, &sandbox.id).await.unwrap();

    let key = crate::object_store::event_log_key(&sandbox.id);
    assert!(h.memory.objects.contains(&key));
    assert_eq!(
        h.memory.objects.content_type(&key).as_deref(),
        Some(crate::events::EVENT_LOG_CONTENT_TYPE)
    );
}

async fn logged_targets(h: &Harness, id: &str) -> Vec<String> {
    let body = h
        .memory
        .objects
        .get_object(&crate::object_store::event_log_key(id))
        .await
        .unwrap();
    String::from_utf8(body)
        .unwrap()
        .lines()
        .map(|line| {
            let event: crate::store::BufferedEvent = serde_json::from_str(line).unwrap();
            event.payload["to"].as_str().unwrap_or_default().to_string()
        })
        .collect()
}

#[tokio::test]
async fn test_event_log_keeps_transitions_older_than_buffer() {
    let h = harness().await;
    let sandbox = create(&h).await;

    // Nothing enforces the TTL here, so the sandbox outlives its buffer.
    h.clock.advance(TimeDelta::hours(2));
    assert!(lifecycle_targets(&h, &sandbox.id).await.is_empty());
    h.manager.stop(ORG, &sandbox.id).await.unwrap();

    assert_eq!(
        logged_targets(&h, &sandbox.id).await,
        ["provisioning", "running", "stopping", "stopped"]
    );
}

// ==================== Delete Tests ====================

#[tokio::test]
async fn test_delete_is_idempotent_and_destroys_once() {
    let h = harness().await;
    let sandbox = create(&h).await;

    let first = h.manager.delete(ORG, &sandbox.id).await.unwrap();
    assert_eq!(first.status, SandboxStatus::Deleted);
    assert_eq!(first.failure_reason, Some(FailureReason::SandboxDeleted));
    assert!(first.ended_at.is_some());
    assert!(h.memory.node.node_of(&sandbox.id).is_none());

    let second = h.manager.delete(ORG, &sandbox.id).await.unwrap();
    assert_eq!(second.status, SandboxStatus::Deleted);
    assert_eq!(second.ended_at, first.ended_at);
    assert_eq!(h.memory.node.calls(NodeOp::DestroySandbox), 1);
}

#[tokio::test]
async fn test_delete_of_stopped_sandbox_keeps_end_state() {
    let h = harness().await;
    let sandbox = create(&h).await;
    let stopped = h.manager.stop(ORG, &sandbox.id).await.unwrap().sandbox;
    h.clock.advance(TimeDelta::minutes(5));

    let deleted = h.manager.delete(ORG, &sandbox.id).await.unwrap();
    assert_eq!(deleted.status, SandboxStatus::Deleted);
    assert_eq!(deleted.ended_at, stopped.ended_at);
    assert_eq!(deleted.failure_reason, Some(FailureReason::SandboxStopped));
    assert_eq!(h.memory.node.calls(NodeOp::DestroySandbox), 0);
}

#[tokio::test]
async fn test_delete_after_buffer_expiry_appends_to_log() {
    let h = harness().await;
    let sandbox = create(&h).await;
    h.manager.stop(ORG, &sandbox.id).await.unwrap();

    h.clock.advance(TimeDelta::hours(2));
    h.manager.delete(ORG, &sandbox.id).await.unwrap();

    assert_eq!(
        logged_targets(&h, &sandbox.id).await,
        ["provisioning", "running", "stopping", "stopped", "deleted"]
    );
}

#[tokio::test]
async fn test_delete_survives_node_failure() {
    let h = harness().await;
    let sandbox = create(&h).await;
    h.memory.node.fail(NodeOp::DestroySandbox);

    let deleted = h.manager.delete(ORG, &sandbox.id).await.unwrap();
    assert_eq!(deleted.status, SandboxStatus::Deleted);
}

// ==================== Read Tests ====================

#[tokio::test]
async fn test_get_and_list_are_org_scoped() {
    let h = harness().await;
    let mine = create(&h).await;
    h.manager
        .create("org_b", CreateSandboxParams::default())
        .await
        .unwrap();

    assert!(matches!(
        h.manager.get("org_b", &mine.id).await.unwrap_err(),
        ControlError::NotFound { .. }
    ));

    let mut filter = SandboxFilter::for_org("org_b");
    filter.statuses = vec![SandboxStatus::Running];
    let page = h.manager.list(ORG, filter).await.unwrap();
    assert_eq!(page.sandboxes.len(), 1);
    assert_eq!(page.sandboxes[0].id, mine.id);
}

#[tokio::test]
async fn test_set_replay_visibility() {
    let h = harness().await;
    let sandbox = create(&h).await;
    let public = h
        .manager
        .set_replay_visibility(ORG, &sandbox.id, true)
        .await
        .unwrap();
    assert!(public.replay_public);

    let err = h
        .manager
        .set_replay_visibility("org_b", &sandbox.id, false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

// ==================== Exec Tests ====================

#[tokio::test]
async fn test_exec_buffers_output_and_records_row() {
    let h = harness().await;
    let sandbox = create(&h).await;
    h.clock.advance(TimeDelta::seconds(30));

    let outcome = h
        .manager
        .exec(
            ORG,
            &sandbox.id,
            ExecParams {
                cmd: vec!["echo".to_string(), "hello".to_string()],
                ..ExecParams::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.stdout, "hello\n");
    assert!(outcome.stderr.is_empty());

    let events = h
        .manager
        .events()
        .events_after(&EventKey::Exec(outcome.exec_id.clone()), None)
        .await
        .unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].payload["t"], "stdout");
    assert_eq!(events[1].payload["t"], "exit");
    assert_eq!(events[1].payload["code"], 0);

    let execs = h.memory.repo.list_execs(&sandbox.id).await.unwrap();
    assert_eq!(execs[0].status, ExecStatus::Done);
    assert_eq!(execs[0].exit_code, Some(0));

    let touched = h.manager.get(ORG, &sandbox.id).await.unwrap();
    assert_eq!(touched.last_activity_at, h.clock.now());
}

#[tokio::test]
async fn test_exec_log_ref_outlives_buffer() {
    let h = harness().await;
    let sandbox = create(&h).await;
    let outcome = h
        .manager
        .exec(
            ORG,
            &sandbox.id,
            ExecParams {
                cmd: vec!["echo".to_string(), "hello".to_string()],
                ..ExecParams::default()
            },
        )
        .await
        .unwrap();

    h.clock.advance(TimeDelta::hours(2));
    assert!(
        h.manager
            .events()
            .events_after(&EventKey::Exec(outcome.exec_id.clone()), None)
            .await
            .unwrap()
            .is_empty()
    );

    let execs = h.memory.repo.list_execs(&sandbox.id).await.unwrap();
    let log_ref = execs[0].log_ref.clone().unwrap();
    assert_eq!(
        log_ref,
        crate::object_store::exec_log_key(&sandbox.id, &outcome.exec_id)
    );
    let body = String::from_utf8(h.memory.objects.get_object(&log_ref).await.unwrap()).unwrap();
    let lines: Vec<crate::store::BufferedEvent> = body
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0].payload["data"], "hello\n");
    assert_eq!(lines[1].payload["t"], "exit");
}

#[tokio::test]
async fn test_exec_log_ref_unset_when_log_write_fails() {
    let h = harness().await;
    let sandbox = create(&h).await;

    let mut backends = h.memory.backends();
    backends.objects = Arc::new(FailingObjects);
    let manager = SandboxManager::new(backends, ControlPlaneConfig::default());

    let outcome = manager
        .exec(
            ORG,
            &sandbox.id,
            ExecParams {
                cmd: vec!["true".to_string()],
                ..ExecParams::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.exit_code, 0);
    let execs = h.memory.repo.list_execs(&sandbox.id).await.unwrap();
    assert!(execs[0].log_ref.is_none());
}

#[tokio::test]
async fn test_exec_seq_is_monotonic_per_sandbox() {
    let h = harness().await;
    let sandbox = create(&h).await;
    for _ in 0..3 {
        h.manager
            .exec(
                ORG,
                &sandbox.id,
                ExecParams {
                    cmd: vec!["true".to_string()],
                    ..ExecParams::default()
                },
            )
            .await
            .unwrap();
    }
    let seqs: Vec<u64> = h
        .memory
        .repo
        .list_execs(&sandbox.id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.seq)
        .collect();
    assert_eq!(seqs, [1, 2, 3]);
}

#[tokio::test]
async fn test_exec_timeout_bounds() {
    let h = harness().await;
    let sandbox = create(&h).await;
    let max = h.manager.config().max_exec_timeout.as_secs();

    let err = h
        .manager
        .exec(
            ORG,
            &sandbox.id,
            ExecParams {
                cmd: vec!["true".to_string()],
                timeout_seconds: Some(max + 1),
                ..ExecParams::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
    assert!(err.to_string().contains(&max.to_string()));

    let timed_out = h
        .manager
        .exec(
            ORG,
            &sandbox.id,
            ExecParams {
                cmd: vec!["sleep".to_string(), "10".to_string()],
                timeout_seconds: Some(2),
                ..ExecParams::default()
            },
        )
        .await
        .unwrap();
    assert!(timed_out.timed_out);
    let execs = h.memory.repo.list_execs(&sandbox.id).await.unwrap();
    assert_eq!(execs[0].status, ExecStatus::TimedOut);
}

#[tokio::test]
async fn test_exec_node_failure_marks_row_failed() {
    let h = harness().await;
    let sandbox = create(&h).await;
    h.memory.node.fail(NodeOp::Exec);

    let err = h
        .manager
        .exec(
            ORG,
            &sandbox.id,
            ExecParams {
                cmd: vec!["true".to_string()],
                ..ExecParams::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Node(_)));
    let execs = h.memory.repo.list_execs(&sandbox.id).await.unwrap();
    assert_eq!(execs[0].status, ExecStatus::Failed);
    assert!(execs[0].ended_at.is_some());
}

#[tokio::test]
async fn test_exec_requires_running_sandbox() {
    let h = harness().await;
    let sandbox = create(&h).await;
    h.manager.stop(ORG, &sandbox.id).await.unwrap();

    let err = h
        .manager
        .exec(
            ORG,
            &sandbox.id,
            ExecParams {
                cmd: vec!["true".to_string()],
                ..ExecParams::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::SandboxNotRunning);
}

// ==================== Session Tests ====================

#[tokio::test]
async fn test_session_limit_and_exec() {
    let h = harness().await;
    with_quota(
        &h,
        OrgQuota {
            max_sessions_per_sandbox: 1,
            ..OrgQuota::default()
        },
    );
    let sandbox = create(&h).await;

    let session = h
        .manager
        .create_session(ORG, &sandbox.id, SessionParams::default())
        .await
        .unwrap();
    assert_eq!(session.shell, "/bin/bash");

    let err = h
        .manager
        .create_session(ORG, &sandbox.id, SessionParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Conflict(_)));

    let outcome = h
        .manager
        .session_exec(
            ORG,
            &sandbox.id,
            &session.id,
            SessionExecParams {
                cmd: "echo hi there".to_string(),
                ..SessionExecParams::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.stdout, "hi there\n");
    let buffered = h
        .manager
        .events()
        .events_after(&EventKey::Session(session.id.clone()), None)
        .await
        .unwrap();
    assert_eq!(buffered.len(), 2);
    let execs = h.memory.repo.list_execs(&sandbox.id).await.unwrap();
    assert_eq!(execs[0].session_id.as_deref(), Some(session.id.as_str()));

    h.manager
        .session_input(ORG, &sandbox.id, &session.id, "ls\n")
        .await
        .unwrap();
    assert_eq!(
        h.memory.node.session_input(&sandbox.id, &session.id).as_deref(),
        Some("ls\n")
    );

    // Destroying frees the slot, and is idempotent.
    let destroyed = h
        .manager
        .destroy_session(ORG, &sandbox.id, &session.id)
        .await
        .unwrap();
    assert_eq!(destroyed.status, SessionStatus::Destroyed);
    let again = h
        .manager
        .destroy_session(ORG, &sandbox.id, &session.id)
        .await
        .unwrap();
    assert_eq!(again.destroyed_at, destroyed.destroyed_at);
    assert_eq!(h.memory.node.calls(NodeOp::DestroySession), 1);

    h.manager
        .create_session(ORG, &sandbox.id, SessionParams::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_session_node_failure_frees_slot() {
    let h = harness().await;
    let sandbox = create(&h).await;
    h.memory.node.fail(NodeOp::CreateSession);

    assert!(
        h.manager
            .create_session(ORG, &sandbox.id, SessionParams::default())
            .await
            .is_err()
    );
    let sessions = h.manager.list_sessions(ORG, &sandbox.id).await.unwrap();
    assert!(sessions.iter().all(|s| s.status == SessionStatus::Destroyed));
}

// ==================== File Tests ====================

#[tokio::test]
async fn test_file_round_trip() {
    let h = harness().await;
    let sandbox = create(&h).await;

    let written = h
        .manager
        .put_file(ORG, &sandbox.id, "/work/a.txt", b"abc".to_vec())
        .await
        .unwrap();
    assert_eq!(written.bytes, 3);
    assert_eq!(
        h.manager
            .get_file(ORG, &sandbox.id, "/work/a.txt")
            .await
            .unwrap(),
        b"abc"
    );
    let entries = h
        .manager
        .list_files(ORG, &sandbox.id, "/work")
        .await
        .unwrap();
    assert!(entries.iter().any(|e| e.path == "/work/a.txt"));

    h.manager
        .delete_file(ORG, &sandbox.id, "/work/a.txt")
        .await
        .unwrap();
    assert!(
        h.manager
            .get_file(ORG, &sandbox.id, "/work/a.txt")
            .await
            .is_err()
    );

    let err = h
        .manager
        .put_file(ORG, &sandbox.id, "relative.txt", Vec::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
}

#[tokio::test]
async fn test_fork_copies_guest_files() {
    let h = harness().await;
    let parent = create(&h).await;
    h.manager
        .put_file(ORG, &parent.id, "/state.json", b"{}".to_vec())
        .await
        .unwrap();
    let child = h
        .manager
        .fork(ORG, &parent.id, ForkSandboxParams::default())
        .await
        .unwrap();
    assert_eq!(
        h.manager.get_file(ORG, &child.id, "/state.json").await.unwrap(),
        b"{}"
    );
}

// ==================== Stream Tests ====================

#[tokio::test(start_paused = true)]
async fn test_stream_resumes_after_last_event_id() {
    let h = harness().await;
    let sandbox = create(&h).await;

    let stream = h
        .manager
        .stream(
            ORG,
            &sandbox.id,
            EventKey::Sandbox(sandbox.id.clone()),
            Some("1"),
        )
        .await
        .unwrap();
    tokio::pin!(stream);
    let frame = stream.next().await.unwrap().unwrap();
    assert!(frame.starts_with("id: 2\n"), "{frame}");
    assert!(frame.contains("\"to\":\"running\""));
}

#[tokio::test]
async fn test_stream_rejects_foreign_keys() {
    let h = harness().await;
    let a = create(&h).await;
    let b = create(&h).await;
    let outcome = h
        .manager
        .exec(
            ORG,
            &b.id,
            ExecParams {
                cmd: vec!["true".to_string()],
                ..ExecParams::default()
            },
        )
        .await
        .unwrap();

    let err = h
        .manager
        .stream(ORG, &a.id, EventKey::Exec(outcome.exec_id), None)
        .await
        .err()
        .unwrap();
    assert_eq!(err.code(), ErrorCode::NotFound);
}
