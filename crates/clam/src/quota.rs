//! Per-organization admission limits.
//!
//! Every create and fork passes through [`OrgQuota`] checks before anything is
//! written. Orgs without an explicit quota get [`OrgQuota::default`].

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};
use crate::model::Sandbox;

/// TTL applied when a create request does not name one.
pub const DEFAULT_TTL_SECONDS: u64 = 60 * 60;

/// Admission limits for one organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrgQuota {
    /// Maximum sandboxes in queued/provisioning/running/stopping at once.
    pub max_concurrent_sandboxes: u64,
    /// Largest TTL a sandbox may request.
    pub max_ttl_seconds: u64,
    /// Deepest fork chain allowed (roots are depth 0).
    pub max_fork_depth: u32,
    /// Direct children one sandbox may have.
    pub max_forks_per_sandbox: u32,
    /// Days a replay is served after the sandbox ends.
    pub replay_retention_days: u32,
    /// Seconds without activity before a running sandbox is stopped.
    pub idle_timeout_seconds: u64,
    /// Concurrent running sessions per sandbox.
    pub max_sessions_per_sandbox: u32,
}

impl Default for OrgQuota {
    fn default() -> Self {
        Self {
            max_concurrent_sandboxes: 10,
            max_ttl_seconds: 4 * 60 * 60,
            max_fork_depth: 5,
            max_forks_per_sandbox: 10,
            replay_retention_days: 30,
            idle_timeout_seconds: 15 * 60,
            max_sessions_per_sandbox: 5,
        }
    }
}

impl OrgQuota {
    /// The TTL to use when the caller did not supply one.
    pub fn default_ttl(&self) -> u64 {
        DEFAULT_TTL_SECONDS.min(self.max_ttl_seconds)
    }

    /// Validate a requested TTL.
    pub fn check_ttl(&self, ttl_seconds: u64) -> Result<()> {
        if ttl_seconds == 0 {
            return Err(ControlError::Validation(
                "ttl_seconds must be greater than zero".to_string(),
            ));
        }
        if ttl_seconds > self.max_ttl_seconds {
            return Err(ControlError::Validation(format!(
                "ttl_seconds {ttl_seconds} exceeds the org maximum of {}",
                self.max_ttl_seconds
            )));
        }
        Ok(())
    }

    /// Reject when `active` sandboxes already fill the quota.
    pub fn check_concurrency(&self, active: u64) -> Result<()> {
        if active >= self.max_concurrent_sandboxes {
            return Err(ControlError::QuotaExceeded {
                active,
                limit: self.max_concurrent_sandboxes,
            });
        }
        Ok(())
    }

    /// Check whether `parent` may be forked, returning the child's depth.
    pub fn check_fork(&self, parent: &Sandbox) -> Result<u32> {
        let depth = parent.fork_depth.saturating_add(1);
        if depth > self.max_fork_depth {
            return Err(ControlError::ForkDepthExceeded {
                depth,
                limit: self.max_fork_depth,
            });
        }
        if parent.fork_count >= self.max_forks_per_sandbox {
            return Err(ControlError::ForkLimitExceeded {
                id: parent.id.clone(),
                limit: self.max_forks_per_sandbox,
            });
        }
        Ok(depth)
    }

    /// How long replays are kept after a sandbox ends.
    pub fn replay_retention(&self) -> TimeDelta {
        TimeDelta::days(i64::from(self.replay_retention_days))
    }

    /// How long a running sandbox may go without activity.
    pub fn idle_timeout(&self) -> TimeDelta {
        TimeDelta::try_seconds(i64::try_from(self.idle_timeout_seconds).unwrap_or(i64::MAX))
            .unwrap_or(TimeDelta::MAX)
    }
}

/// Looks up the admission limits for an org.
#[async_trait]
pub trait QuotaResolver: Send + Sync + std::fmt::Debug {
    /// The org's quota, or the defaults if none is configured.
    async fn get_org_quota(&self, org_id: &str) -> Result<OrgQuota>;
}

/// Quotas held in memory, registered per org.
#[derive(Debug, Default)]
pub struct StaticQuotaResolver {
    quotas: RwLock<HashMap<String, OrgQuota>>,
    fallback: OrgQuota,
}

impl StaticQuotaResolver {
    /// Create a resolver that answers `fallback` for unknown orgs.
    pub fn new(fallback: OrgQuota) -> Self {
        Self {
            quotas: RwLock::new(HashMap::new()),
            fallback,
        }
    }

    /// Register (or replace) an org's quota.
    pub fn set_org_quota(&self, org_id: impl Into<String>, quota: OrgQuota) {
        self.quotas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(org_id.into(), quota);
    }
}

#[async_trait]
impl QuotaResolver for StaticQuotaResolver {
    async fn get_org_quota(&self, org_id: &str) -> Result<OrgQuota> {
        let quotas = self.quotas.read().unwrap_or_else(PoisonError::into_inner);
        Ok(quotas
            .get(org_id)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== OrgQuota Tests ====================

    #[test]
    fn test_default_quota() {
        let quota = OrgQuota::default();

        assert_eq!(quota.replay_retention_days, 30);
        assert_eq!(quota.max_sessions_per_sandbox, 5);
        assert_eq!(quota.default_ttl(), DEFAULT_TTL_SECONDS);
    }

    #[test]
    fn test_default_ttl_capped_by_max() {
        let quota = OrgQuota {
            max_ttl_seconds: 600,
            ..OrgQuota::default()
        };
        assert_eq!(quota.default_ttl(), 600);
    }

    #[test]
    fn test_ttl_boundary() {
        let quota = OrgQuota {
            max_ttl_seconds: 600,
            ..OrgQuota::default()
        };

        assert!(quota.check_ttl(600).is_ok());
        let err = quota.check_ttl(601).unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));
        assert!(err.to_string().contains("600"));
        assert!(quota.check_ttl(0).is_err());
    }

    #[test]
    fn test_concurrency_at_limit_is_rejected() {
        let quota = OrgQuota {
            max_concurrent_sandboxes: 2,
            ..OrgQuota::default()
        };

        assert!(quota.check_concurrency(1).is_ok());
        assert!(matches!(
            quota.check_concurrency(2),
            Err(ControlError::QuotaExceeded {
                active: 2,
                limit: 2
            })
        ));
    }

    #[test]
    fn test_partial_quota_deserializes_with_defaults() {
        let quota: OrgQuota = serde_json::from_str(r#"{"max_fork_depth": 1}"#).unwrap();
        assert_eq!(quota.max_fork_depth, 1);
        assert_eq!(quota.max_concurrent_sandboxes, 10);
    }

    // ==================== Resolver Tests ====================

    #[tokio::test]
    async fn test_resolver_falls_back_to_default() {
        let resolver = StaticQuotaResolver::default();
        let quota = resolver.get_org_quota("org_unknown").await.unwrap();
        assert_eq!(quota, OrgQuota::default());
    }

    #[tokio::test]
    async fn test_resolver_returns_registered_quota() {
        let resolver = StaticQuotaResolver::default();
        resolver.set_org_quota(
            "org_a",
            OrgQuota {
                max_ttl_seconds: 600,
                ..OrgQuota::default()
            },
        );

        let quota = resolver.get_org_quota("org_a").await.unwrap();
        assert_eq!(quota.max_ttl_seconds, 600);
    }
}
