// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Discovery Scheduler - Background task feeding the approval queue
//!
//! Each cycle refreshes threat feeds (when configured), mines every tenant's
//! recent audit log and submits the resulting candidates for review.
//! Candidates already known to the approval workflow are counted and skipped.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Periodic pattern discovery per tenant

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::approval_workflow::{ApprovalError, ApprovalWorkflow, SubmissionOutcome};
use crate::application::pattern_discovery::{DiscoveryError, PatternDiscoverer};
use crate::application::threat_fusion::ThreatFusion;
use crate::domain::pattern::{CandidatePattern, PatternSource};
use crate::domain::repository::AuditLogSource;
use crate::domain::tenant::TenantId;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),
}

/// Submission counts for one tenant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TenantDiscoveryReport {
    pub discovered: usize,
    pub queued: usize,
    pub auto_approved: usize,
    pub already_known: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryCycleReport {
    pub started_at: Option<DateTime<Utc>>,
    pub tenants: BTreeMap<String, TenantDiscoveryReport>,
    pub failed: BTreeMap<String, String>,
    pub feeds_failed: BTreeMap<String, String>,
}

impl DiscoveryCycleReport {
    pub fn total_submitted(&self) -> usize {
        self.tenants.values().map(|t| t.queued + t.auto_approved).sum()
    }
}

pub struct DiscoveryScheduler {
    discoverer: PatternDiscoverer,
    source: Arc<dyn AuditLogSource>,
    workflow: Arc<ApprovalWorkflow>,
    fusion: Option<Arc<ThreatFusion>>,
    tenants: Vec<TenantId>,
    shutdown_token: CancellationToken,
}

impl DiscoveryScheduler {
    pub fn new(
        discoverer: PatternDiscoverer,
        source: Arc<dyn AuditLogSource>,
        workflow: Arc<ApprovalWorkflow>,
        tenants: Vec<TenantId>,
    ) -> Self {
        Self {
            discoverer,
            source,
            workflow,
            fusion: None,
            tenants,
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn with_threat_fusion(mut self, fusion: Arc<ThreatFusion>) -> Self {
        self.fusion = Some(fusion);
        self
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
        let config = self.discoverer.config();
        if !config.enabled {
            info!("Discovery scheduler is disabled");
            return;
        }

        info!(
            interval_secs = config.interval.as_secs(),
            lookback_hours = config.lookback_hours,
            tenants = self.tenants.len(),
            "Starting discovery scheduler background task"
        );
        let mut tick = interval(config.interval);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    debug!("Running discovery cycle");
                    let report = self.run_cycle(Utc::now()).await;
                    info!(
                        submitted = report.total_submitted(),
                        failed_tenants = report.failed.len(),
                        "Discovery cycle completed"
                    );
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping discovery scheduler");
                    break;
                }
            }
        }

        info!("Discovery scheduler background task stopped");
    }

    /// One discovery pass over every tenant. Tenant failures are reported, not raised.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> DiscoveryCycleReport {
        let mut report = DiscoveryCycleReport {
            started_at: Some(now),
            ..DiscoveryCycleReport::default()
        };

        if let Some(fusion) = &self.fusion {
            report.feeds_failed = fusion.refresh(now).await.failed;
        }

        for tenant in &self.tenants {
            if self.shutdown_token.is_cancelled() {
                break;
            }
            match self.discover_tenant(tenant, now).await {
                Ok(tenant_report) => {
                    report.tenants.insert(tenant.to_string(), tenant_report);
                }
                Err(SchedulerError::Discovery(DiscoveryError::Cancelled)) => break,
                Err(e) => {
                    warn!(tenant = %tenant, "Discovery failed for tenant: {}", e);
                    report.failed.insert(tenant.to_string(), e.to_string());
                }
            }
        }
        report
    }

    async fn discover_tenant(&self, tenant: &TenantId, now: DateTime<Utc>) -> Result<TenantDiscoveryReport, SchedulerError> {
        let mut candidates = self
            .discoverer
            .discover_from_source(self.source.as_ref(), tenant, now, &self.shutdown_token)
            .await?;
        if let Some(fusion) = &self.fusion {
            candidates.extend(fusion.to_candidates(tenant, now));
        }

        let mut report = TenantDiscoveryReport {
            discovered: candidates.len(),
            ..TenantDiscoveryReport::default()
        };
        for candidate in candidates {
            let context = review_context(&candidate);
            match self.workflow.submit(candidate, None, Some(context)).await? {
                SubmissionOutcome::Queued(_) => report.queued += 1,
                SubmissionOutcome::AutoApproved(_) => report.auto_approved += 1,
                SubmissionOutcome::AlreadyKnown(_) => report.already_known += 1,
            }
        }

        debug!(
            tenant = %tenant,
            discovered = report.discovered,
            queued = report.queued,
            auto_approved = report.auto_approved,
            already_known = report.already_known,
            "Tenant discovery submitted"
        );
        Ok(report)
    }
}

fn review_context(candidate: &CandidatePattern) -> String {
    match &candidate.source {
        PatternSource::NgramMined { n, partition } => format!(
            "{n}-word phrase seen in {} {:?} inputs ({:.0}% of partition)",
            candidate.occurrence_count,
            partition,
            candidate.confidence * 100.0
        ),
        PatternSource::ThreatDerived { feed_id, indicator_id } => {
            format!("threat indicator {indicator_id} from feed {feed_id}")
        }
    }
}
