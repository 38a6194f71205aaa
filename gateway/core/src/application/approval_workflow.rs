// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Approval Workflow
//!
//! Human-in-the-loop gate between discovery and deployment.
//!
//! ```text
//! discovered ──submit──▶ pending_review ──approve (threshold)──▶ approved
//!                          │    ▲
//!                          │    └── request_changes / defer
//!                          └──reject──▶ rejected
//! ```
//!
//! Every decision is appended to the review log before the pattern snapshot is
//! updated, so `rebuild` can always repair a snapshot from the log.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Submission, review and audit of candidate patterns

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::events::ReviewEvent;
use crate::domain::gateway_config::ApprovalConfig;
use crate::domain::pattern::{CandidatePattern, PatternId, PatternKind, PatternStatus, ReviewPriority};
use crate::domain::repository::{PatternRepository, RepositoryError, ReviewRepository};
use crate::domain::review::{approval_count, replay_status, resolving_record, ReviewAction, ReviewRecord, AUTO_APPROVER};
use crate::domain::tenant::TenantId;
use crate::infrastructure::event_bus::EventBus;

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("pattern not found: {0}")]
    NotFound(PatternId),

    #[error("pattern {id} is already {status}")]
    AlreadyResolved { id: PatternId, status: PatternStatus },

    #[error("pattern {id} is {status}, not pending review")]
    NotPending { id: PatternId, status: PatternStatus },

    #[error("reviewer {reviewer} already approved pattern {id}")]
    DuplicateApproval { id: PatternId, reviewer: String },

    #[error("invalid reviewer identity: '{0}'")]
    InvalidReviewer(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    AutoApproved(CandidatePattern),
    Queued(CandidatePattern),
    /// The pattern id already exists; nothing was written
    AlreadyKnown(PatternStatus),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewOutcome {
    pub pattern: CandidatePattern,
    pub record: ReviewRecord,
    pub approvals: u32,
    pub approvals_needed: u32,
}

/// Filter for the pending queue; every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PendingFilter {
    pub tenant: Option<TenantId>,
    pub kind: Option<PatternKind>,
    pub priority: Option<ReviewPriority>,
    pub min_confidence: Option<f64>,
}

impl PendingFilter {
    pub fn matches(&self, pattern: &CandidatePattern) -> bool {
        self.tenant.as_ref().is_none_or(|t| &pattern.tenant_id == t)
            && self.kind.is_none_or(|k| pattern.kind == k)
            && self.priority.is_none_or(|p| pattern.priority == Some(p))
            && self.min_confidence.is_none_or(|c| pattern.confidence >= c)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingReviewItem {
    pub pattern: CandidatePattern,
    pub approvals: u32,
    pub approvals_needed: u32,
}

pub struct ApprovalWorkflow {
    patterns: Arc<dyn PatternRepository>,
    reviews: Arc<dyn ReviewRepository>,
    event_bus: Arc<EventBus>,
    config: ApprovalConfig,
    tenant_locks: DashMap<TenantId, Arc<tokio::sync::Mutex<()>>>,
}

impl ApprovalWorkflow {
    pub fn new(
        patterns: Arc<dyn PatternRepository>,
        reviews: Arc<dyn ReviewRepository>,
        event_bus: Arc<EventBus>,
        config: ApprovalConfig,
    ) -> Self {
        Self {
            patterns,
            reviews,
            event_bus,
            config,
            tenant_locks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ApprovalConfig {
        &self.config
    }

    fn tenant_lock(&self, tenant: &TenantId) -> Arc<tokio::sync::Mutex<()>> {
        self.tenant_locks.entry(tenant.clone()).or_default().clone()
    }

    fn required_approvals(&self) -> u32 {
        self.config.required_approvals.max(1)
    }

    /// Queue a candidate for review, or approve it outright when auto-approval
    /// is on and its confidence reaches the threshold.
    pub async fn submit(
        &self,
        mut pattern: CandidatePattern,
        priority: Option<ReviewPriority>,
        context: Option<String>,
    ) -> Result<SubmissionOutcome, ApprovalError> {
        let lock = self.tenant_lock(&pattern.tenant_id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.patterns.find_by_id(&pattern.id).await? {
            return Ok(SubmissionOutcome::AlreadyKnown(existing.status));
        }

        let now = Utc::now();
        let priority = priority.unwrap_or_else(|| ReviewPriority::for_confidence(pattern.confidence));
        pattern.mark_pending(priority, context, now);
        self.patterns.save(&pattern).await?;

        if !(self.config.auto_approve && pattern.confidence >= self.config.auto_approve_threshold) {
            metrics::counter!("warden_patterns_submitted_total", "outcome" => "queued").increment(1);
            info!(
                tenant = %pattern.tenant_id,
                pattern_id = %pattern.id,
                kind = %pattern.kind,
                confidence = pattern.confidence,
                "Pattern queued for review"
            );
            return Ok(SubmissionOutcome::Queued(pattern));
        }

        let notes = format!(
            "confidence {:.3} >= auto-approve threshold {:.3}",
            pattern.confidence, self.config.auto_approve_threshold
        );
        let record = ReviewRecord::new(pattern.id.clone(), AUTO_APPROVER, ReviewAction::Approve, Some(notes.clone()), now);
        self.reviews.append(&record).await?;
        pattern.approve(AUTO_APPROVER, now, Some(notes));
        self.patterns.save(&pattern).await?;

        metrics::counter!("warden_patterns_submitted_total", "outcome" => "auto_approved").increment(1);
        info!(
            tenant = %pattern.tenant_id,
            pattern_id = %pattern.id,
            confidence = pattern.confidence,
            "Pattern auto-approved"
        );
        self.publish_approved(&pattern, AUTO_APPROVER, now);
        Ok(SubmissionOutcome::AutoApproved(pattern))
    }

    /// Record a reviewer decision and apply any resulting transition.
    pub async fn review(
        &self,
        pattern_id: &PatternId,
        reviewer: &str,
        action: ReviewAction,
        notes: Option<String>,
    ) -> Result<ReviewOutcome, ApprovalError> {
        let reviewer = reviewer.trim();
        if reviewer.is_empty() || reviewer == AUTO_APPROVER {
            return Err(ApprovalError::InvalidReviewer(reviewer.to_string()));
        }

        let tenant = self
            .patterns
            .find_by_id(pattern_id)
            .await?
            .ok_or_else(|| ApprovalError::NotFound(pattern_id.clone()))?
            .tenant_id;
        let lock = self.tenant_lock(&tenant);
        let _guard = lock.lock().await;

        // Re-read under the lock; another review may have resolved it meanwhile
        let mut pattern = self
            .patterns
            .find_by_id(pattern_id)
            .await?
            .ok_or_else(|| ApprovalError::NotFound(pattern_id.clone()))?;
        if pattern.status.is_resolved() {
            return Err(ApprovalError::AlreadyResolved { id: pattern.id, status: pattern.status });
        }
        if pattern.status != PatternStatus::PendingReview {
            return Err(ApprovalError::NotPending { id: pattern.id, status: pattern.status });
        }

        let mut history = self.reviews.find_by_pattern(pattern_id).await?;
        if action == ReviewAction::Approve
            && history.iter().any(|r| r.action == ReviewAction::Approve && r.reviewer == reviewer)
        {
            return Err(ApprovalError::DuplicateApproval { id: pattern.id, reviewer: reviewer.to_string() });
        }

        let now = Utc::now();
        let record = ReviewRecord::new(pattern.id.clone(), reviewer, action, notes.clone(), now);
        self.reviews.append(&record).await?;
        history.push(record.clone());
        metrics::counter!("warden_reviews_total", "action" => action.to_string()).increment(1);

        match replay_status(&history, self.required_approvals()) {
            Some(PatternStatus::Approved) => {
                pattern.approve(reviewer, now, notes);
                self.patterns.save(&pattern).await?;
                info!(tenant = %pattern.tenant_id, pattern_id = %pattern.id, reviewer, "Pattern approved");
                self.publish_approved(&pattern, reviewer, now);
            }
            Some(PatternStatus::Rejected) => {
                pattern.reject(reviewer, now, notes.clone());
                self.patterns.save(&pattern).await?;
                info!(tenant = %pattern.tenant_id, pattern_id = %pattern.id, reviewer, "Pattern rejected");
                self.event_bus.publish_review_event(ReviewEvent::PatternRejected {
                    tenant_id: pattern.tenant_id.clone(),
                    pattern_id: pattern.id.clone(),
                    value: pattern.value.clone(),
                    rejected_by: reviewer.to_string(),
                    reason: notes,
                    rejected_at: now,
                });
            }
            _ => {
                info!(
                    tenant = %pattern.tenant_id,
                    pattern_id = %pattern.id,
                    reviewer,
                    action = %action,
                    "Review recorded, pattern stays pending"
                );
            }
        }

        let approvals = approval_count(&history);
        Ok(ReviewOutcome {
            approvals_needed: self.approvals_needed(&pattern, approvals),
            approvals,
            pattern,
            record,
        })
    }

    /// Pending patterns, highest priority first, newest first within a priority.
    pub async fn list_pending(&self, filter: &PendingFilter) -> Result<Vec<PendingReviewItem>, ApprovalError> {
        let mut items = Vec::new();
        for pattern in self.patterns.find_by_status(PatternStatus::PendingReview).await? {
            if !filter.matches(&pattern) {
                continue;
            }
            let history = self.reviews.find_by_pattern(&pattern.id).await?;
            let approvals = approval_count(&history);
            items.push(PendingReviewItem {
                approvals_needed: self.approvals_needed(&pattern, approvals),
                approvals,
                pattern,
            });
        }

        items.sort_by(|a, b| {
            b.pattern
                .priority
                .cmp(&a.pattern.priority)
                .then_with(|| b.pattern.submitted_at.cmp(&a.pattern.submitted_at))
                .then_with(|| a.pattern.id.cmp(&b.pattern.id))
        });
        Ok(items)
    }

    pub async fn get(&self, pattern_id: &PatternId) -> Result<CandidatePattern, ApprovalError> {
        self.patterns
            .find_by_id(pattern_id)
            .await?
            .ok_or_else(|| ApprovalError::NotFound(pattern_id.clone()))
    }

    /// The review log of one pattern in timestamp order.
    pub async fn history(&self, pattern_id: &PatternId) -> Result<Vec<ReviewRecord>, ApprovalError> {
        self.get(pattern_id).await?;
        Ok(self.reviews.find_by_pattern(pattern_id).await?)
    }

    pub async fn approved_patterns(&self, tenant: &TenantId) -> Result<Vec<CandidatePattern>, ApprovalError> {
        Ok(self
            .patterns
            .find_by_tenant(tenant)
            .await?
            .into_iter()
            .filter(|p| p.status == PatternStatus::Approved)
            .collect())
    }

    /// Replay every pattern's review log over its snapshot and repair drift.
    /// Returns the number of snapshots rewritten.
    pub async fn rebuild(&self) -> Result<usize, ApprovalError> {
        let required = self.required_approvals();
        let mut repaired = 0;

        for mut pattern in self.patterns.list_all().await? {
            let history = self.reviews.find_by_pattern(&pattern.id).await?;
            let Some(status) = replay_status(&history, required) else {
                continue;
            };
            if status == pattern.status {
                continue;
            }

            warn!(
                tenant = %pattern.tenant_id,
                pattern_id = %pattern.id,
                snapshot = %pattern.status,
                replayed = %status,
                "Pattern snapshot disagrees with review log, repairing"
            );
            match resolving_record(&history, required) {
                Some(record) => {
                    let (reviewer, at, notes) = (record.reviewer.clone(), record.timestamp, record.notes.clone());
                    if record.action == ReviewAction::Reject {
                        pattern.reject(&reviewer, at, notes);
                    } else {
                        pattern.approve(&reviewer, at, notes);
                    }
                }
                None => {
                    pattern.status = PatternStatus::PendingReview;
                    pattern.reviewed_by = None;
                    pattern.reviewed_at = None;
                }
            }
            self.patterns.save(&pattern).await?;
            repaired += 1;
        }

        info!(repaired, "Review state rebuilt from log");
        Ok(repaired)
    }

    fn approvals_needed(&self, pattern: &CandidatePattern, approvals: u32) -> u32 {
        match pattern.status {
            PatternStatus::PendingReview => self.required_approvals().saturating_sub(approvals),
            _ => 0,
        }
    }

    fn publish_approved(&self, pattern: &CandidatePattern, reviewer: &str, at: DateTime<Utc>) {
        self.event_bus.publish_review_event(ReviewEvent::PatternApproved {
            tenant_id: pattern.tenant_id.clone(),
            pattern_id: pattern.id.clone(),
            kind: pattern.kind,
            value: pattern.value.clone(),
            approved_by: reviewer.to_string(),
            automatic: reviewer == AUTO_APPROVER,
            approved_at: at,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::GatewayEvent;
    use crate::domain::pattern::{LogPartition, PatternSource};
    use crate::infrastructure::repositories::{InMemoryPatternRepository, InMemoryReviewRepository};

    fn candidate(tenant: &str, value: &str, confidence: f64) -> CandidatePattern {
        CandidatePattern::new(
            TenantId::new(tenant),
            PatternKind::AttackVariant,
            value,
            PatternSource::NgramMined { n: 3, partition: LogPartition::BlockedInjection },
            confidence,
            5,
            Utc::now(),
        )
    }

    struct Harness {
        workflow: ApprovalWorkflow,
        patterns: Arc<InMemoryPatternRepository>,
        reviews: Arc<InMemoryReviewRepository>,
        bus: Arc<EventBus>,
    }

    fn harness(config: ApprovalConfig) -> Harness {
        let patterns = Arc::new(InMemoryPatternRepository::new());
        let reviews = Arc::new(InMemoryReviewRepository::new());
        let bus = Arc::new(EventBus::with_default_capacity());
        Harness {
            workflow: ApprovalWorkflow::new(patterns.clone(), reviews.clone(), bus.clone(), config),
            patterns,
            reviews,
            bus,
        }
    }

    fn auto(threshold: f64) -> ApprovalConfig {
        ApprovalConfig {
            auto_approve: true,
            auto_approve_threshold: threshold,
            required_approvals: 1,
        }
    }

    #[tokio::test]
    async fn test_submit_auto_approves_at_threshold() {
        let h = harness(auto(0.9));
        let mut events = h.bus.subscribe();

        let outcome = h.workflow.submit(candidate("t", "a", 0.9), None, None).await.unwrap();
        let SubmissionOutcome::AutoApproved(pattern) = outcome else {
            panic!("expected auto-approval");
        };
        assert_eq!(pattern.status, PatternStatus::Approved);
        assert_eq!(pattern.reviewed_by.as_deref(), Some(AUTO_APPROVER));

        let log = h.workflow.history(&pattern.id).await.unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].is_automatic());

        match events.try_recv().unwrap() {
            GatewayEvent::Review(ReviewEvent::PatternApproved { automatic, .. }) => assert!(automatic),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_submit_queues_below_threshold_or_when_disabled() {
        let h = harness(auto(0.9));
        let outcome = h.workflow.submit(candidate("t", "a", 0.89), None, None).await.unwrap();
        assert!(matches!(outcome, SubmissionOutcome::Queued(ref p) if p.status == PatternStatus::PendingReview));

        let h = harness(ApprovalConfig::default());
        let outcome = h.workflow.submit(candidate("t", "a", 1.0), None, None).await.unwrap();
        let SubmissionOutcome::Queued(pattern) = outcome else {
            panic!("expected queueing");
        };
        assert_eq!(pattern.priority, Some(ReviewPriority::Critical));
        assert!(h.reviews.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resubmission_is_a_noop() {
        let h = harness(ApprovalConfig::default());
        h.workflow.submit(candidate("t", "a", 0.7), None, None).await.unwrap();
        let outcome = h.workflow.submit(candidate("t", "a", 0.7), None, None).await.unwrap();
        assert_eq!(outcome, SubmissionOutcome::AlreadyKnown(PatternStatus::PendingReview));
    }

    #[tokio::test]
    async fn test_dual_control_requires_distinct_reviewers() {
        let h = harness(ApprovalConfig { required_approvals: 2, ..ApprovalConfig::default() });
        let pattern = candidate("t", "a", 0.7);
        let id = pattern.id.clone();
        h.workflow.submit(pattern, None, None).await.unwrap();

        let first = h.workflow.review(&id, "alice", ReviewAction::Approve, None).await.unwrap();
        assert_eq!(first.pattern.status, PatternStatus::PendingReview);
        assert_eq!(first.approvals_needed, 1);

        let dup = h.workflow.review(&id, "alice", ReviewAction::Approve, None).await;
        assert!(matches!(dup, Err(ApprovalError::DuplicateApproval { .. })));

        let second = h.workflow.review(&id, "bob", ReviewAction::Approve, Some("lgtm".into())).await.unwrap();
        assert_eq!(second.pattern.status, PatternStatus::Approved);
        assert_eq!(second.approvals, 2);
        assert_eq!(second.approvals_needed, 0);

        let late = h.workflow.review(&id, "carol", ReviewAction::Reject, None).await;
        assert!(matches!(late, Err(ApprovalError::AlreadyResolved { status: PatternStatus::Approved, .. })));
    }

    #[tokio::test]
    async fn test_reject_and_defer() {
        let h = harness(ApprovalConfig::default());
        let pattern = candidate("t", "a", 0.7);
        let id = pattern.id.clone();
        h.workflow.submit(pattern, None, None).await.unwrap();

        let deferred = h.workflow.review(&id, "alice", ReviewAction::Defer, None).await.unwrap();
        assert_eq!(deferred.pattern.status, PatternStatus::PendingReview);
        let changes = h.workflow.review(&id, "alice", ReviewAction::RequestChanges, None).await.unwrap();
        assert_eq!(changes.pattern.status, PatternStatus::PendingReview);

        let rejected = h.workflow.review(&id, "bob", ReviewAction::Reject, Some("too broad".into())).await.unwrap();
        assert_eq!(rejected.pattern.status, PatternStatus::Rejected);
        assert_eq!(rejected.pattern.review_notes.as_deref(), Some("too broad"));
        assert_eq!(h.workflow.history(&id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_review_validation_errors() {
        let h = harness(ApprovalConfig::default());
        let missing = PatternId::from("missing");
        assert!(matches!(
            h.workflow.review(&missing, "alice", ReviewAction::Approve, None).await,
            Err(ApprovalError::NotFound(_))
        ));

        let pattern = candidate("t", "a", 0.7);
        let id = pattern.id.clone();
        h.workflow.submit(pattern, None, None).await.unwrap();
        for reviewer in ["", "   ", AUTO_APPROVER] {
            assert!(matches!(
                h.workflow.review(&id, reviewer, ReviewAction::Approve, None).await,
                Err(ApprovalError::InvalidReviewer(_))
            ));
        }

        // Saved straight to the store, never submitted
        let raw = candidate("t", "raw", 0.7);
        h.patterns.save(&raw).await.unwrap();
        assert!(matches!(
            h.workflow.review(&raw.id, "alice", ReviewAction::Approve, None).await,
            Err(ApprovalError::NotPending { status: PatternStatus::Discovered, .. })
        ));
    }

    #[tokio::test]
    async fn test_list_pending_orders_and_filters() {
        let h = harness(ApprovalConfig { required_approvals: 2, ..ApprovalConfig::default() });
        let low = candidate("t", "low", 0.5);
        let critical = candidate("t", "critical", 0.99);
        let other_tenant = candidate("u", "other", 0.99);
        let (low_id, critical_id) = (low.id.clone(), critical.id.clone());
        h.workflow.submit(low, None, None).await.unwrap();
        h.workflow.submit(critical, None, None).await.unwrap();
        h.workflow.submit(other_tenant, Some(ReviewPriority::Low), None).await.unwrap();
        h.workflow.review(&critical_id, "alice", ReviewAction::Approve, None).await.unwrap();

        let filter = PendingFilter { tenant: Some(TenantId::new("t")), ..PendingFilter::default() };
        let items = h.workflow.list_pending(&filter).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].pattern.id, critical_id);
        assert_eq!(items[0].approvals, 1);
        assert_eq!(items[0].approvals_needed, 1);
        assert_eq!(items[1].pattern.id, low_id);

        let filter = PendingFilter { min_confidence: Some(0.9), ..PendingFilter::default() };
        assert_eq!(h.workflow.list_pending(&filter).await.unwrap().len(), 2);

        let filter = PendingFilter { priority: Some(ReviewPriority::Low), ..PendingFilter::default() };
        assert_eq!(h.workflow.list_pending(&filter).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rebuild_repairs_snapshot_drift() {
        let h = harness(ApprovalConfig::default());
        let pattern = candidate("t", "a", 0.7);
        let id = pattern.id.clone();
        h.workflow.submit(pattern, None, None).await.unwrap();
        h.workflow.review(&id, "alice", ReviewAction::Approve, None).await.unwrap();

        // Simulate a crash between log append and snapshot write
        let mut stale = h.patterns.find_by_id(&id).await.unwrap().unwrap();
        stale.status = PatternStatus::PendingReview;
        h.patterns.save(&stale).await.unwrap();

        assert_eq!(h.workflow.rebuild().await.unwrap(), 1);
        let repaired = h.workflow.get(&id).await.unwrap();
        assert_eq!(repaired.status, PatternStatus::Approved);
        assert_eq!(repaired.reviewed_by.as_deref(), Some("alice"));
        assert_eq!(h.workflow.rebuild().await.unwrap(), 0);
        assert_eq!(h.workflow.approved_patterns(&TenantId::new("t")).await.unwrap().len(), 1);
    }
}
