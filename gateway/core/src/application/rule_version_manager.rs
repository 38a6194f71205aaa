// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Rule Version Manager
//!
//! Owns every tenant's rule versions: creation from approved patterns,
//! progressive (canary) deployment, promotion, live metrics and rollback.
//!
//! Each tenant has its own scope: an async write mutex serialising every
//! read-modify-write, a hot [`VersionIndex`], and the active stable/canary
//! rule sets behind a `parking_lot::RwLock` for the per-request read path.
//! All mutations are persisted before the call returns.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Safe deployment of discovered rules
//!
//! # Invariants
//!
//! - at most one canary and one stable per tenant
//! - a canary's percentage never decreases; stable is always at 100%
//! - rollback reinstates the highest deprecated version below the failing one
//!   that was not itself rolled back

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::events::RolloutEvent;
use crate::domain::gateway_config::RolloutConfig;
use crate::domain::pattern::{CandidatePattern, PatternId, PatternStatus};
use crate::domain::repository::{RepositoryError, RuleVersionRepository};
use crate::domain::rule_version::{
    DeploymentError, DeploymentStatus, PerformanceMetrics, RuleSet, RuleVersion, SemanticVersion,
};
use crate::domain::tenant::TenantId;
use crate::domain::version_index::VersionIndex;
use crate::infrastructure::event_bus::EventBus;

#[derive(Debug, thiserror::Error)]
pub enum RolloutError {
    #[error("rule version {version} not found for tenant {tenant}")]
    VersionNotFound { tenant: TenantId, version: SemanticVersion },

    #[error("invalid deployment percentage {0}: expected 1-100")]
    InvalidPercentage(u8),

    #[error("canary percentage cannot decrease from {current}% to {requested}%")]
    PercentageDecrease { current: u8, requested: u8 },

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("pattern {id} cannot be deployed: {reason}")]
    InvalidPattern { id: PatternId, reason: String },

    #[error("invalid metrics: {0}")]
    InvalidMetrics(String),

    #[error("version {version} is not newer than the current stable {stable}")]
    NotNewerThanStable { version: SemanticVersion, stable: SemanticVersion },

    #[error("tenant {tenant} already has an active canary {version}")]
    CanaryAlreadyActive { tenant: TenantId, version: SemanticVersion },

    #[error("data integrity violation: {0}")]
    Integrity(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<DeploymentError> for RolloutError {
    fn from(err: DeploymentError) -> Self {
        match err {
            DeploymentError::InvalidPercentage(p) => RolloutError::InvalidPercentage(p),
            DeploymentError::PercentageDecrease { current, requested } => {
                RolloutError::PercentageDecrease { current, requested }
            }
            other @ DeploymentError::InvalidTransition { .. } => RolloutError::InvalidTransition(other.to_string()),
        }
    }
}

/// Which versions currently serve a tenant's traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActiveVersions {
    pub stable: Option<SemanticVersion>,
    pub canary: Option<SemanticVersion>,
    pub canary_percentage: u8,
}

#[derive(Clone, Default)]
struct ActiveRules {
    stable: Option<(SemanticVersion, Arc<RuleSet>)>,
    canary: Option<(SemanticVersion, u8, Arc<RuleSet>)>,
}

struct TenantScope {
    write: tokio::sync::Mutex<()>,
    active: RwLock<ActiveRules>,
    index: RwLock<VersionIndex>,
}

pub struct RuleVersionManager {
    versions: Arc<dyn RuleVersionRepository>,
    event_bus: Arc<EventBus>,
    config: RolloutConfig,
    scopes: DashMap<TenantId, Arc<TenantScope>>,
    empty: Arc<RuleSet>,
}

impl RuleVersionManager {
    pub fn new(versions: Arc<dyn RuleVersionRepository>, event_bus: Arc<EventBus>, config: RolloutConfig) -> Self {
        Self {
            versions,
            event_bus,
            config,
            scopes: DashMap::new(),
            empty: Arc::new(RuleSet::default()),
        }
    }

    pub fn config(&self) -> &RolloutConfig {
        &self.config
    }

    /// Load a tenant's versions into memory so the synchronous read path serves them.
    pub async fn warm(&self, tenant: &TenantId) -> Result<(), RolloutError> {
        self.scope(tenant).await.map(|_| ())
    }

    async fn scope(&self, tenant: &TenantId) -> Result<Arc<TenantScope>, RolloutError> {
        if let Some(scope) = self.scopes.get(tenant) {
            return Ok(scope.clone());
        }

        let stored = self.versions.list_by_tenant(tenant).await?;
        let mut index = VersionIndex::new(self.config.history_depth);
        let mut active = ActiveRules::default();
        for version in stored.iter().rev() {
            if &version.tenant_id != tenant {
                return Err(RolloutError::Integrity(format!(
                    "version {} stored under tenant {} belongs to {}",
                    version.version, tenant, version.tenant_id
                )));
            }
            match version.status {
                DeploymentStatus::Stable => {
                    if let Some((existing, _)) = &active.stable {
                        return Err(RolloutError::Integrity(format!(
                            "tenant {tenant} has two stable versions: {existing} and {}",
                            version.version
                        )));
                    }
                    active.stable = Some((version.version, Arc::new(version.rule_set.clone())));
                }
                DeploymentStatus::Canary => {
                    if let Some((existing, _, _)) = &active.canary {
                        return Err(RolloutError::Integrity(format!(
                            "tenant {tenant} has two canary versions: {existing} and {}",
                            version.version
                        )));
                    }
                    active.canary = Some((
                        version.version,
                        version.deployment_percentage,
                        Arc::new(version.rule_set.clone()),
                    ));
                }
                DeploymentStatus::Pending | DeploymentStatus::Deprecated => {}
            }
            index.upsert(version);
        }

        info!(tenant = %tenant, versions = stored.len(), "Loaded rule versions");
        let scope = Arc::new(TenantScope {
            write: tokio::sync::Mutex::new(()),
            active: RwLock::new(active),
            index: RwLock::new(index),
        });
        // A concurrent loader may have won; keep whichever landed first
        Ok(self.scopes.entry(tenant.clone()).or_insert(scope).clone())
    }

    async fn load(&self, tenant: &TenantId, version: SemanticVersion) -> Result<RuleVersion, RolloutError> {
        self.versions
            .find(tenant, version)
            .await?
            .ok_or_else(|| RolloutError::VersionNotFound { tenant: tenant.clone(), version })
    }

    /// Load a version the index says exists; absence is an integrity failure.
    async fn load_indexed(&self, tenant: &TenantId, version: SemanticVersion) -> Result<RuleVersion, RolloutError> {
        self.versions.find(tenant, version).await?.ok_or_else(|| {
            RolloutError::Integrity(format!("indexed version {version} of tenant {tenant} missing from store"))
        })
    }

    async fn persist(&self, scope: &TenantScope, version: &RuleVersion) -> Result<(), RolloutError> {
        self.versions.save(version).await?;
        scope.index.write().upsert(version);
        Ok(())
    }

    /// Create a pending version from approved patterns on top of the current stable.
    pub async fn create_version(
        &self,
        tenant: &TenantId,
        approved: &[CandidatePattern],
        author: &str,
        changelog: &str,
    ) -> Result<RuleVersion, RolloutError> {
        for pattern in approved {
            if pattern.status != PatternStatus::Approved {
                return Err(RolloutError::InvalidPattern {
                    id: pattern.id.clone(),
                    reason: format!("status is {}", pattern.status),
                });
            }
            if &pattern.tenant_id != tenant {
                return Err(RolloutError::InvalidPattern {
                    id: pattern.id.clone(),
                    reason: format!("belongs to tenant {}", pattern.tenant_id),
                });
            }
        }

        let scope = self.scope(tenant).await?;
        let _guard = scope.write.lock().await;

        let (stable, highest) = {
            let index = scope.index.read();
            (index.find_status(DeploymentStatus::Stable), index.highest())
        };
        let parent = match stable {
            Some(v) => Some(self.load_indexed(tenant, v).await?),
            None => None,
        };

        // Above everything ever created, not just the stable, so numbers never repeat
        let number = highest.unwrap_or(SemanticVersion::ZERO).next_patch();
        let base = parent.as_ref().map(|p| p.rule_set.clone()).unwrap_or_default();
        let version = RuleVersion::new(
            tenant.clone(),
            number,
            parent.as_ref(),
            base.merge(approved),
            author,
            changelog,
            approved.iter().map(|p| p.id.clone()).collect(),
            Utc::now(),
        );
        self.persist(&scope, &version).await?;

        metrics::counter!("warden_rule_versions_created_total").increment(1);
        info!(
            tenant = %tenant,
            version = %version.version,
            parent = ?version.parent.map(|p| p.to_string()),
            added = version.patterns_added.len(),
            rules = version.rule_set.len(),
            "Created rule version"
        );
        Ok(version)
    }

    /// Start serving a pending version to `percentage`% of traffic.
    pub async fn deploy_canary(
        &self,
        tenant: &TenantId,
        version: SemanticVersion,
        percentage: u8,
    ) -> Result<RuleVersion, RolloutError> {
        if percentage == 0 || percentage > 100 {
            return Err(RolloutError::InvalidPercentage(percentage));
        }

        let scope = self.scope(tenant).await?;
        let _guard = scope.write.lock().await;

        let mut target = self.load(tenant, version).await?;
        let active_canary = scope.index.read().find_status(DeploymentStatus::Canary);
        if let Some(existing) = active_canary.filter(|v| *v != version) {
            return Err(RolloutError::CanaryAlreadyActive { tenant: tenant.clone(), version: existing });
        }
        // Rollback reinstates only versions below the failing one
        let stable = scope.index.read().find_status(DeploymentStatus::Stable);
        if let Some(stable) = stable.filter(|s| *s >= version) {
            return Err(RolloutError::NotNewerThanStable { version, stable });
        }

        let now = Utc::now();
        target.start_canary(percentage, now)?;
        self.persist(&scope, &target).await?;
        scope.active.write().canary = Some((version, percentage, Arc::new(target.rule_set.clone())));

        metrics::counter!("warden_rollout_transitions_total", "to" => "canary").increment(1);
        info!(tenant = %tenant, version = %version, percentage, "Canary deployed");
        self.event_bus.publish_rollout_event(RolloutEvent::CanaryDeployed {
            tenant_id: tenant.clone(),
            version,
            percentage,
            deployed_at: now,
        });
        Ok(target)
    }

    pub async fn expand_canary(
        &self,
        tenant: &TenantId,
        version: SemanticVersion,
        percentage: u8,
    ) -> Result<RuleVersion, RolloutError> {
        let scope = self.scope(tenant).await?;
        let _guard = scope.write.lock().await;

        let mut target = self.load(tenant, version).await?;
        let from = target.deployment_percentage;
        target.expand(percentage)?;
        self.persist(&scope, &target).await?;
        if let Some((_, pct, _)) = scope.active.write().canary.as_mut() {
            *pct = percentage;
        }

        info!(tenant = %tenant, version = %version, from, to = percentage, "Canary expanded");
        self.event_bus.publish_rollout_event(RolloutEvent::CanaryExpanded {
            tenant_id: tenant.clone(),
            version,
            from_percentage: from,
            to_percentage: percentage,
            expanded_at: Utc::now(),
        });
        Ok(target)
    }

    /// Make the active canary the stable version, deprecating the previous stable.
    pub async fn promote_to_stable(&self, tenant: &TenantId, version: SemanticVersion) -> Result<RuleVersion, RolloutError> {
        let scope = self.scope(tenant).await?;
        let _guard = scope.write.lock().await;

        let mut target = self.load(tenant, version).await?;
        if target.status != DeploymentStatus::Canary {
            return Err(RolloutError::InvalidTransition(format!(
                "version {version} is {}, only the active canary can be promoted",
                target.status
            )));
        }

        let now = Utc::now();
        let previous_stable = scope.index.read().find_status(DeploymentStatus::Stable);
        if let Some(previous) = previous_stable {
            let mut old = self.load_indexed(tenant, previous).await?;
            old.deprecate(now, None)?;
            self.persist(&scope, &old).await?;
        }

        target.promote(now)?;
        self.persist(&scope, &target).await?;
        {
            let mut active = scope.active.write();
            active.stable = Some((version, Arc::new(target.rule_set.clone())));
            active.canary = None;
        }

        metrics::counter!("warden_rollout_transitions_total", "to" => "stable").increment(1);
        info!(
            tenant = %tenant,
            version = %version,
            previous = ?previous_stable.map(|v| v.to_string()),
            "Rule version promoted to stable"
        );
        self.event_bus.publish_rollout_event(RolloutEvent::VersionPromoted {
            tenant_id: tenant.clone(),
            version,
            previous: previous_stable,
            promoted_at: now,
        });
        Ok(target)
    }

    /// Overwrite the recorded metrics of a version. Repeating a call is a no-op.
    pub async fn update_metrics(
        &self,
        tenant: &TenantId,
        version: SemanticVersion,
        metrics: PerformanceMetrics,
    ) -> Result<RuleVersion, RolloutError> {
        metrics.validate().map_err(RolloutError::InvalidMetrics)?;

        let scope = self.scope(tenant).await?;
        let _guard = scope.write.lock().await;

        let mut target = self.load(tenant, version).await?;
        if target.metrics == Some(metrics) {
            return Ok(target);
        }
        target.metrics = Some(metrics);
        self.persist(&scope, &target).await?;
        Ok(target)
    }

    /// Compare `metrics` of `version` against the stable baseline.
    ///
    /// Returns whether a rollback is warranted and every violated threshold,
    /// joined with "; ".
    pub async fn should_rollback(
        &self,
        tenant: &TenantId,
        version: SemanticVersion,
        metrics: &PerformanceMetrics,
    ) -> Result<(bool, String), RolloutError> {
        metrics.validate().map_err(RolloutError::InvalidMetrics)?;
        self.load(tenant, version).await?;

        let baseline = match self.current_stable(tenant).await? {
            Some(stable) if stable.version != version => stable.metrics.unwrap_or(PerformanceMetrics::DEFAULT_BASELINE),
            _ => PerformanceMetrics::DEFAULT_BASELINE,
        };
        let thresholds = &self.config.thresholds;

        let mut reasons = Vec::new();
        let fp_limit = baseline.false_positive_rate * thresholds.false_positive_ratio;
        if metrics.false_positive_rate > fp_limit {
            reasons.push(format!(
                "false positive rate {:.4} exceeds {:.4} ({}x baseline {:.4})",
                metrics.false_positive_rate, fp_limit, thresholds.false_positive_ratio, baseline.false_positive_rate
            ));
        }
        let latency_limit = baseline.mean_latency_ms + thresholds.latency_delta_ms;
        if metrics.mean_latency_ms > latency_limit {
            reasons.push(format!(
                "mean latency {:.1}ms exceeds {:.1}ms (baseline {:.1}ms + {:.1}ms)",
                metrics.mean_latency_ms, latency_limit, baseline.mean_latency_ms, thresholds.latency_delta_ms
            ));
        }
        let detection_floor = baseline.detection_rate - thresholds.detection_drop;
        if metrics.detection_rate < detection_floor {
            reasons.push(format!(
                "detection rate {:.4} below {:.4} (baseline {:.4} - {:.4})",
                metrics.detection_rate, detection_floor, baseline.detection_rate, thresholds.detection_drop
            ));
        }

        Ok((!reasons.is_empty(), reasons.join("; ")))
    }

    /// Deprecate the failing version and reinstate the most recent surviving one.
    ///
    /// The failing version is the active canary, or the stable when no canary
    /// is live; it keeps `reason` for audit. Returns the reinstated version, or
    /// `None` when there is nothing to fall back to.
    pub async fn rollback(&self, tenant: &TenantId, reason: &str) -> Result<Option<RuleVersion>, RolloutError> {
        let scope = self.scope(tenant).await?;
        let _guard = scope.write.lock().await;

        let (canary, stable) = {
            let index = scope.index.read();
            (index.find_status(DeploymentStatus::Canary), index.find_status(DeploymentStatus::Stable))
        };
        let Some(failing) = canary.or(stable) else {
            warn!(target: "warden::control", tenant = %tenant, reason, "Rollback requested with nothing deployed");
            return Ok(None);
        };

        let now = Utc::now();
        let mut failed = self.load_indexed(tenant, failing).await?;
        failed.deprecate(now, Some(reason.to_string()))?;
        self.persist(&scope, &failed).await?;
        if let Some(stable) = stable.filter(|v| *v != failing) {
            let mut old = self.load_indexed(tenant, stable).await?;
            old.deprecate(now, None)?;
            self.persist(&scope, &old).await?;
        }

        let target = match self.find_rollback_target(tenant, &scope, failing).await? {
            Some(number) => {
                let mut restored = self.load_indexed(tenant, number).await?;
                restored.reinstate(now)?;
                self.persist(&scope, &restored).await?;
                Some(restored)
            }
            None => None,
        };

        {
            let mut active = scope.active.write();
            active.canary = None;
            active.stable = target.as_ref().map(|t| (t.version, Arc::new(t.rule_set.clone())));
        }

        metrics::counter!("warden_rollbacks_total").increment(1);
        warn!(
            target: "warden::control",
            tenant = %tenant,
            failed_version = %failing,
            restored_version = ?target.as_ref().map(|t| t.version.to_string()),
            reason,
            "Rule version rolled back"
        );
        self.event_bus.publish_rollout_event(RolloutEvent::RollbackTriggered {
            tenant_id: tenant.clone(),
            failed_version: Some(failing),
            restored_version: target.as_ref().map(|t| t.version),
            reason: reason.to_string(),
            triggered_at: now,
        });
        Ok(target)
    }

    async fn find_rollback_target(
        &self,
        tenant: &TenantId,
        scope: &TenantScope,
        failing: SemanticVersion,
    ) -> Result<Option<SemanticVersion>, RolloutError> {
        let (hot, archived) = {
            let index = scope.index.read();
            (index.rollback_target(failing), index.has_archived())
        };
        if hot.is_some() || !archived {
            return Ok(hot);
        }

        // Evicted versions live only in the store
        Ok(self
            .versions
            .list_by_tenant(tenant)
            .await?
            .into_iter()
            .find(|v| v.version < failing && v.status == DeploymentStatus::Deprecated && !v.was_rolled_back())
            .map(|v| v.version))
    }

    /// Stable rule set of a loaded tenant; empty when none is deployed or the
    /// tenant was never warmed.
    pub fn active_rule_set(&self, tenant: &TenantId) -> Arc<RuleSet> {
        self.scopes
            .get(tenant)
            .and_then(|scope| scope.active.read().stable.as_ref().map(|(_, rules)| rules.clone()))
            .unwrap_or_else(|| self.empty.clone())
    }

    /// Rule set for one request: the canary for its share of routing keys, else stable.
    pub fn rule_set_for_request(&self, tenant: &TenantId, routing_key: &str) -> Arc<RuleSet> {
        let Some(scope) = self.scopes.get(tenant).map(|s| s.clone()) else {
            return self.empty.clone();
        };
        let active = scope.active.read();
        if let Some((_, percentage, rules)) = &active.canary {
            if routing_bucket(tenant, routing_key) < *percentage {
                return rules.clone();
            }
        }
        active
            .stable
            .as_ref()
            .map(|(_, rules)| rules.clone())
            .unwrap_or_else(|| self.empty.clone())
    }

    pub fn active_versions(&self, tenant: &TenantId) -> ActiveVersions {
        let Some(scope) = self.scopes.get(tenant).map(|s| s.clone()) else {
            return ActiveVersions::default();
        };
        let active = scope.active.read();
        ActiveVersions {
            stable: active.stable.as_ref().map(|(v, _)| *v),
            canary: active.canary.as_ref().map(|(v, _, _)| *v),
            canary_percentage: active.canary.as_ref().map(|(_, p, _)| *p).unwrap_or(0),
        }
    }

    pub async fn get_version(&self, tenant: &TenantId, version: SemanticVersion) -> Result<RuleVersion, RolloutError> {
        self.load(tenant, version).await
    }

    /// All versions of a tenant, highest first.
    pub async fn list_versions(&self, tenant: &TenantId) -> Result<Vec<RuleVersion>, RolloutError> {
        Ok(self.versions.list_by_tenant(tenant).await?)
    }

    pub async fn current_stable(&self, tenant: &TenantId) -> Result<Option<RuleVersion>, RolloutError> {
        self.current(tenant, DeploymentStatus::Stable).await
    }

    pub async fn current_canary(&self, tenant: &TenantId) -> Result<Option<RuleVersion>, RolloutError> {
        self.current(tenant, DeploymentStatus::Canary).await
    }

    async fn current(&self, tenant: &TenantId, status: DeploymentStatus) -> Result<Option<RuleVersion>, RolloutError> {
        let scope = self.scope(tenant).await?;
        let found = scope.index.read().find_status(status);
        match found {
            Some(v) => Ok(Some(self.load_indexed(tenant, v).await?)),
            None => Ok(None),
        }
    }
}

/// Stable 0-99 bucket for a routing key.
fn routing_bucket(tenant: &TenantId, routing_key: &str) -> u8 {
    let mut hasher = Sha256::new();
    hasher.update(tenant.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(routing_key.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::GatewayEvent;
    use crate::domain::pattern::{LogPartition, PatternKind, PatternSource};
    use crate::infrastructure::repositories::InMemoryRuleVersionRepository;

    const TENANT: &str = "acme";

    fn tenant() -> TenantId {
        TenantId::new(TENANT)
    }

    fn approved(value: &str, kind: PatternKind) -> CandidatePattern {
        let mut p = CandidatePattern::new(
            tenant(),
            kind,
            value,
            PatternSource::NgramMined { n: 3, partition: LogPartition::BlockedInjection },
            0.9,
            5,
            Utc::now(),
        );
        p.approve("alice", Utc::now(), None);
        p
    }

    fn manager_with(config: RolloutConfig) -> (RuleVersionManager, Arc<InMemoryRuleVersionRepository>, Arc<EventBus>) {
        let repo = Arc::new(InMemoryRuleVersionRepository::new());
        let bus = Arc::new(EventBus::with_default_capacity());
        (RuleVersionManager::new(repo.clone(), bus.clone(), config), repo, bus)
    }

    fn manager() -> RuleVersionManager {
        manager_with(RolloutConfig::default()).0
    }

    async fn stable_v1(m: &RuleVersionManager) -> RuleVersion {
        let v1 = m.create_version(&tenant(), &[approved("(?i)a", PatternKind::AttackVariant)], "alice", "v1").await.unwrap();
        m.deploy_canary(&tenant(), v1.version, 10).await.unwrap();
        m.promote_to_stable(&tenant(), v1.version).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_version_merges_onto_stable() {
        let m = manager();
        let v1 = stable_v1(&m).await;
        assert_eq!(v1.version, SemanticVersion::new(0, 0, 1));
        assert_eq!(v1.status, DeploymentStatus::Stable);
        assert_eq!(v1.deployment_percentage, 100);

        let v2 = m
            .create_version(
                &tenant(),
                &[
                    approved("(?i)a", PatternKind::AttackVariant),
                    approved("(?i)b", PatternKind::AttackVariant),
                    approved(r"\d{4}", PatternKind::PiiVariant),
                ],
                "bob",
                "more",
            )
            .await
            .unwrap();
        assert_eq!(v2.version, SemanticVersion::new(0, 0, 2));
        assert_eq!(v2.parent, Some(v1.version));
        assert_eq!(v2.rule_set.injection_patterns, vec!["(?i)a", "(?i)b"]);
        assert_eq!(v2.patterns_added.len(), 2);
        assert_eq!(v2.status, DeploymentStatus::Pending);
        assert_eq!(v2.deployment_percentage, 0);
    }

    #[tokio::test]
    async fn test_create_version_rejects_unapproved_or_foreign_patterns() {
        let m = manager();
        let mut pending = approved("x", PatternKind::AttackVariant);
        pending.status = PatternStatus::PendingReview;
        assert!(matches!(
            m.create_version(&tenant(), &[pending], "a", "").await,
            Err(RolloutError::InvalidPattern { .. })
        ));

        let mut foreign = approved("x", PatternKind::AttackVariant);
        foreign.tenant_id = TenantId::new("other");
        assert!(matches!(
            m.create_version(&tenant(), &[foreign], "a", "").await,
            Err(RolloutError::InvalidPattern { .. })
        ));
    }

    #[tokio::test]
    async fn test_canary_rules() {
        let m = manager();
        let v1 = m.create_version(&tenant(), &[], "a", "").await.unwrap();
        let v2 = m.create_version(&tenant(), &[], "a", "").await.unwrap();
        assert!(matches!(m.deploy_canary(&tenant(), v1.version, 0).await, Err(RolloutError::InvalidPercentage(0))));
        assert!(matches!(m.deploy_canary(&tenant(), v1.version, 101).await, Err(RolloutError::InvalidPercentage(101))));

        m.deploy_canary(&tenant(), v1.version, 20).await.unwrap();
        assert!(matches!(
            m.deploy_canary(&tenant(), v2.version, 5).await,
            Err(RolloutError::CanaryAlreadyActive { .. })
        ));
        assert!(matches!(
            m.expand_canary(&tenant(), v1.version, 10).await,
            Err(RolloutError::PercentageDecrease { current: 20, requested: 10 })
        ));
        let expanded = m.expand_canary(&tenant(), v1.version, 50).await.unwrap();
        assert_eq!(expanded.deployment_percentage, 50);
        assert_eq!(m.active_versions(&tenant()).canary_percentage, 50);
        assert!(matches!(
            m.expand_canary(&tenant(), v2.version, 60).await,
            Err(RolloutError::InvalidTransition(_))
        ));
        assert!(matches!(
            m.promote_to_stable(&tenant(), v2.version).await,
            Err(RolloutError::InvalidTransition(_))
        ));
        assert!(matches!(
            m.deploy_canary(&tenant(), SemanticVersion::new(9, 9, 9), 10).await,
            Err(RolloutError::VersionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_promote_deprecates_previous_stable() {
        let (m, _, bus) = manager_with(RolloutConfig::default());
        let mut events = bus.subscribe();
        let v1 = stable_v1(&m).await;
        let v2 = m.create_version(&tenant(), &[approved("(?i)b", PatternKind::AttackVariant)], "a", "").await.unwrap();
        m.deploy_canary(&tenant(), v2.version, 10).await.unwrap();
        m.promote_to_stable(&tenant(), v2.version).await.unwrap();

        assert_eq!(m.get_version(&tenant(), v1.version).await.unwrap().status, DeploymentStatus::Deprecated);
        assert_eq!(m.current_stable(&tenant()).await.unwrap().unwrap().version, v2.version);
        assert!(m.current_canary(&tenant()).await.unwrap().is_none());
        assert_eq!(m.active_rule_set(&tenant()).injection_patterns, vec!["(?i)a", "(?i)b"]);

        let mut promoted = 0;
        while let Ok(event) = events.try_recv() {
            if let GatewayEvent::Rollout(RolloutEvent::VersionPromoted { .. }) = event {
                promoted += 1;
            }
        }
        assert_eq!(promoted, 2);
    }

    #[tokio::test]
    async fn test_should_rollback_against_defaults_and_stable() {
        let m = manager();
        let v1 = m.create_version(&tenant(), &[], "a", "").await.unwrap();

        // No stable: default baseline
        let healthy = PerformanceMetrics::new(0.95, 0.03, 100.0);
        assert_eq!(m.should_rollback(&tenant(), v1.version, &healthy).await.unwrap(), (false, String::new()));

        let bad = PerformanceMetrics::new(0.80, 0.10, 200.0);
        let (rollback, reason) = m.should_rollback(&tenant(), v1.version, &bad).await.unwrap();
        assert!(rollback);
        assert_eq!(reason.split("; ").count(), 3);
        assert!(reason.starts_with("false positive"));

        let invalid = PerformanceMetrics::new(1.5, 0.0, 1.0);
        assert!(matches!(
            m.should_rollback(&tenant(), v1.version, &invalid).await,
            Err(RolloutError::InvalidMetrics(_))
        ));
    }

    #[tokio::test]
    async fn test_update_metrics_is_idempotent() {
        let m = manager();
        let v1 = m.create_version(&tenant(), &[], "a", "").await.unwrap();
        let metrics = PerformanceMetrics::new(0.9, 0.02, 80.0);
        let first = m.update_metrics(&tenant(), v1.version, metrics).await.unwrap();
        let second = m.update_metrics(&tenant(), v1.version, metrics).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(second.metrics, Some(metrics));
    }

    #[tokio::test]
    async fn test_rollback_without_canary_fails_stable_back() {
        let m = manager();
        let v1 = stable_v1(&m).await;
        let v2 = m.create_version(&tenant(), &[], "a", "").await.unwrap();
        m.deploy_canary(&tenant(), v2.version, 10).await.unwrap();
        m.promote_to_stable(&tenant(), v2.version).await.unwrap();

        let restored = m.rollback(&tenant(), "latency").await.unwrap().unwrap();
        assert_eq!(restored.version, v1.version);
        assert_eq!(restored.deployment_percentage, 100);
        let failed = m.get_version(&tenant(), v2.version).await.unwrap();
        assert_eq!(failed.status, DeploymentStatus::Deprecated);
        assert_eq!(failed.rollback_reason.as_deref(), Some("latency"));

        // v1 is now the stable and the only thing left; rolling it back leaves nothing
        assert!(m.rollback(&tenant(), "again").await.unwrap().is_none());
        assert!(m.active_rule_set(&tenant()).is_empty());
        assert!(m.rollback(&tenant(), "nothing deployed").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_canary_must_be_newer_than_stable() {
        let m = manager();
        let v1 = m.create_version(&tenant(), &[], "a", "").await.unwrap();
        let v2 = m.create_version(&tenant(), &[], "a", "").await.unwrap();
        m.deploy_canary(&tenant(), v2.version, 10).await.unwrap();
        m.promote_to_stable(&tenant(), v2.version).await.unwrap();

        let err = m.deploy_canary(&tenant(), v1.version, 10).await.unwrap_err();
        assert!(matches!(
            err,
            RolloutError::NotNewerThanStable { version, stable } if version == v1.version && stable == v2.version
        ));
        assert_eq!(m.get_version(&tenant(), v1.version).await.unwrap().status, DeploymentStatus::Pending);
        assert_eq!(m.active_versions(&tenant()).canary, None);

        assert_eq!(m.active_versions(&tenant()).stable, Some(v2.version));
    }

    #[tokio::test]
    async fn test_new_versions_never_reuse_rolled_back_numbers() {
        let m = manager();
        let v1 = stable_v1(&m).await;
        let v2 = m.create_version(&tenant(), &[], "a", "").await.unwrap();
        m.deploy_canary(&tenant(), v2.version, 10).await.unwrap();
        m.rollback(&tenant(), "fp").await.unwrap();

        let v3 = m.create_version(&tenant(), &[], "a", "").await.unwrap();
        assert_eq!(v3.version, SemanticVersion::new(0, 0, 3));
        assert_eq!(v3.parent, Some(v1.version));
    }

    #[tokio::test]
    async fn test_rollback_consults_store_for_evicted_versions() {
        let (m, _, _) = manager_with(RolloutConfig { history_depth: 1, ..RolloutConfig::default() });
        let v1 = stable_v1(&m).await;
        let v2 = m.create_version(&tenant(), &[], "a", "").await.unwrap();
        m.deploy_canary(&tenant(), v2.version, 10).await.unwrap();
        // Promotion deprecates v1, which drops out of the one-slot hot index
        m.promote_to_stable(&tenant(), v2.version).await.unwrap();

        let restored = m.rollback(&tenant(), "fp").await.unwrap().unwrap();
        assert_eq!(restored.version, v1.version);
        assert_eq!(m.active_versions(&tenant()).stable, Some(v1.version));
        assert!(m.get_version(&tenant(), v2.version).await.unwrap().was_rolled_back());
    }

    #[tokio::test]
    async fn test_warm_restores_active_rules_and_detects_corruption() {
        let (m, repo, bus) = manager_with(RolloutConfig::default());
        stable_v1(&m).await;

        let fresh = RuleVersionManager::new(repo.clone(), bus.clone(), RolloutConfig::default());
        assert!(fresh.active_rule_set(&tenant()).is_empty());
        fresh.warm(&tenant()).await.unwrap();
        assert_eq!(fresh.active_rule_set(&tenant()).injection_patterns, vec!["(?i)a"]);

        let mut rogue = RuleVersion::new(tenant(), SemanticVersion::new(0, 0, 7), None, RuleSet::default(), "x", "", vec![], Utc::now());
        rogue.status = DeploymentStatus::Stable;
        repo.save(&rogue).await.unwrap();
        let corrupted = RuleVersionManager::new(repo, bus, RolloutConfig::default());
        assert!(matches!(corrupted.warm(&tenant()).await, Err(RolloutError::Integrity(_))));
    }

    #[tokio::test]
    async fn test_canary_serves_its_share_of_traffic() {
        let m = manager();
        stable_v1(&m).await;
        let v2 = m.create_version(&tenant(), &[approved("(?i)b", PatternKind::AttackVariant)], "a", "").await.unwrap();
        m.deploy_canary(&tenant(), v2.version, 30).await.unwrap();

        let canary_hits = (0..1000)
            .filter(|i| m.rule_set_for_request(&tenant(), &format!("session-{i}")).injection_patterns.len() == 2)
            .count();
        assert!((200..400).contains(&canary_hits), "canary served {canary_hits} of 1000");

        // Same key, same answer
        let a = m.rule_set_for_request(&tenant(), "session-7");
        let b = m.rule_set_for_request(&tenant(), "session-7");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
