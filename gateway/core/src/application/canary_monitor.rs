// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Canary Monitor - Background task closing the metrics → rollback loop
//!
//! Each cycle reads live metrics for every tenant's active canary, records
//! them on the version and rolls the canary back when it underperforms the
//! stable baseline.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Automatic rollback of degraded canaries

use std::sync::Arc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::rule_version_manager::{RolloutError, RuleVersionManager};
use crate::domain::gateway_config::CanaryMonitorConfig;
use crate::domain::rule_version::{MetricsSource, SemanticVersion};
use crate::domain::tenant::TenantId;

/// What one tenant's check decided
#[derive(Debug, Clone, PartialEq)]
pub enum CanaryVerdict {
    NoCanary,
    NoMetrics(SemanticVersion),
    Healthy(SemanticVersion),
    RolledBack {
        failed: SemanticVersion,
        restored: Option<SemanticVersion>,
        reason: String,
    },
}

pub struct CanaryMonitor {
    manager: Arc<RuleVersionManager>,
    metrics: Arc<dyn MetricsSource>,
    tenants: Vec<TenantId>,
    config: CanaryMonitorConfig,
    shutdown_token: CancellationToken,
}

impl CanaryMonitor {
    pub fn new(
        manager: Arc<RuleVersionManager>,
        metrics: Arc<dyn MetricsSource>,
        tenants: Vec<TenantId>,
        config: CanaryMonitorConfig,
    ) -> Self {
        Self {
            manager,
            metrics,
            tenants,
            config,
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown_token = token;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        if !self.config.enabled {
            info!("Canary monitor is disabled");
            return;
        }

        info!(
            interval_secs = self.config.interval.as_secs(),
            tenants = self.tenants.len(),
            "Starting canary monitor background task"
        );
        let mut tick = interval(self.config.interval);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    for tenant in &self.tenants {
                        if let Err(e) = self.check_tenant(tenant).await {
                            warn!(tenant = %tenant, "Canary check failed: {}", e);
                        }
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping canary monitor");
                    break;
                }
            }
        }

        info!("Canary monitor background task stopped");
    }

    /// Check one tenant's active canary once.
    pub async fn check_tenant(&self, tenant: &TenantId) -> Result<CanaryVerdict, RolloutError> {
        let Some(canary) = self.manager.current_canary(tenant).await? else {
            return Ok(CanaryVerdict::NoCanary);
        };
        let version = canary.version;

        let Some(metrics) = self.metrics.current_metrics(tenant, version).await? else {
            debug!(tenant = %tenant, version = %version, "No metrics yet for canary");
            return Ok(CanaryVerdict::NoMetrics(version));
        };

        self.manager.update_metrics(tenant, version, metrics).await?;
        let (rollback, reason) = self.manager.should_rollback(tenant, version, &metrics).await?;
        if !rollback {
            return Ok(CanaryVerdict::Healthy(version));
        }

        let restored = self.manager.rollback(tenant, &reason).await?;
        Ok(CanaryVerdict::RolledBack {
            failed: version,
            restored: restored.map(|v| v.version),
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::gateway_config::RolloutConfig;
    use crate::domain::repository::RepositoryError;
    use crate::domain::rule_version::{DeploymentStatus, PerformanceMetrics};
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::repositories::InMemoryRuleVersionRepository;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    #[derive(Default)]
    struct FixedMetrics {
        by_version: Mutex<HashMap<SemanticVersion, PerformanceMetrics>>,
    }

    #[async_trait]
    impl MetricsSource for FixedMetrics {
        async fn current_metrics(
            &self,
            _tenant: &TenantId,
            version: SemanticVersion,
        ) -> Result<Option<PerformanceMetrics>, RepositoryError> {
            Ok(self.by_version.lock().get(&version).copied())
        }
    }

    async fn setup() -> (Arc<RuleVersionManager>, Arc<FixedMetrics>, CanaryMonitor, SemanticVersion, SemanticVersion) {
        let tenant = TenantId::new("acme");
        let manager = Arc::new(RuleVersionManager::new(
            Arc::new(InMemoryRuleVersionRepository::new()),
            Arc::new(EventBus::with_default_capacity()),
            RolloutConfig::default(),
        ));
        let v1 = manager.create_version(&tenant, &[], "ops", "baseline").await.unwrap();
        manager.deploy_canary(&tenant, v1.version, 10).await.unwrap();
        manager.promote_to_stable(&tenant, v1.version).await.unwrap();
        manager
            .update_metrics(&tenant, v1.version, PerformanceMetrics::new(0.95, 0.03, 90.0))
            .await
            .unwrap();
        let v2 = manager.create_version(&tenant, &[], "ops", "candidate").await.unwrap();
        manager.deploy_canary(&tenant, v2.version, 10).await.unwrap();

        let metrics = Arc::new(FixedMetrics::default());
        let monitor = CanaryMonitor::new(
            manager.clone(),
            metrics.clone(),
            vec![tenant],
            CanaryMonitorConfig {
                enabled: true,
                interval: Duration::from_millis(10),
            },
        );
        (manager, metrics, monitor, v1.version, v2.version)
    }

    #[tokio::test]
    async fn test_healthy_canary_is_kept() {
        let (manager, metrics, monitor, _, v2) = setup().await;
        let tenant = TenantId::new("acme");
        assert_eq!(monitor.check_tenant(&tenant).await.unwrap(), CanaryVerdict::NoMetrics(v2));

        metrics.by_version.lock().insert(v2, PerformanceMetrics::new(0.96, 0.03, 95.0));
        assert_eq!(monitor.check_tenant(&tenant).await.unwrap(), CanaryVerdict::Healthy(v2));
        assert!(manager.get_version(&tenant, v2).await.unwrap().metrics.is_some());
    }

    #[tokio::test]
    async fn test_degraded_canary_is_rolled_back() {
        let (manager, metrics, monitor, v1, v2) = setup().await;
        let tenant = TenantId::new("acme");
        metrics.by_version.lock().insert(v2, PerformanceMetrics::new(0.95, 0.06, 95.0));

        match monitor.check_tenant(&tenant).await.unwrap() {
            CanaryVerdict::RolledBack { failed, restored, reason } => {
                assert_eq!(failed, v2);
                assert_eq!(restored, Some(v1));
                assert!(reason.contains("false positive"));
            }
            other => panic!("expected rollback, got {other:?}"),
        }
        assert_eq!(manager.get_version(&tenant, v2).await.unwrap().status, DeploymentStatus::Deprecated);
        assert_eq!(monitor.check_tenant(&tenant).await.unwrap(), CanaryVerdict::NoCanary);
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_shutdown() {
        let (_, _, monitor, _, _) = setup().await;
        let monitor = Arc::new(monitor);
        let token = monitor.shutdown_token();
        let handle = monitor.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
