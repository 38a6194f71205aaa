// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Latest performance metrics pushed by the detection layer, per tenant and
//! version. Read by the canary monitor.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::repository::RepositoryError;
use crate::domain::rule_version::{MetricsSource, PerformanceMetrics, SemanticVersion};
use crate::domain::tenant::TenantId;

#[derive(Default)]
pub struct InMemoryMetricsStore {
    latest: DashMap<(TenantId, SemanticVersion), PerformanceMetrics>,
}

impl InMemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the reported metrics for a version.
    pub fn report(&self, tenant: TenantId, version: SemanticVersion, metrics: PerformanceMetrics) {
        self.latest.insert((tenant, version), metrics);
    }
}

#[async_trait]
impl MetricsSource for InMemoryMetricsStore {
    async fn current_metrics(
        &self,
        tenant: &TenantId,
        version: SemanticVersion,
    ) -> Result<Option<PerformanceMetrics>, RepositoryError> {
        Ok(self.latest.get(&(tenant.clone(), version)).map(|m| *m))
    }
}
