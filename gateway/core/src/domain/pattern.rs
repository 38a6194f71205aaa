// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Candidate Pattern
//!
//! A detection rule proposed by discovery or threat fusion, waiting for (or
//! past) human review. Patterns are never deleted; only their review state moves.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Candidate pattern aggregate and its lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use super::tenant::TenantId;

/// Maximum number of example inputs attached to a candidate.
pub const MAX_EXAMPLE_INPUTS: usize = 5;

/// Stable identity derived from tenant, kind and value, so re-discovering the
/// same phrase yields the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatternId(String);

impl PatternId {
    pub fn derive(tenant: &TenantId, kind: PatternKind, value: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(tenant.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(kind.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(value.as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PatternId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for PatternId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for PatternId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// Recurring phrase in blocked injection attempts
    AttackVariant,
    /// Recurring phrase in low-confidence blocks; candidate for an allow rule
    FalsePositive,
    /// Recurring phrase in PII blocks
    PiiVariant,
    /// Converted from an external threat indicator
    IntelDerived,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::AttackVariant => "attack_variant",
            PatternKind::FalsePositive => "false_positive",
            PatternKind::PiiVariant => "pii_variant",
            PatternKind::IntelDerived => "intel_derived",
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    NgramFrequency,
    ThreatIntel,
}

/// Log partition an n-gram was mined from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogPartition {
    BlockedInjection,
    SuspectedFalsePositive,
    BlockedPii,
}

impl LogPartition {
    pub fn pattern_kind(&self) -> PatternKind {
        match self {
            LogPartition::BlockedInjection => PatternKind::AttackVariant,
            LogPartition::SuspectedFalsePositive => PatternKind::FalsePositive,
            LogPartition::BlockedPii => PatternKind::PiiVariant,
        }
    }
}

/// Where a candidate came from. Both arms produce the same aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PatternSource {
    NgramMined { n: usize, partition: LogPartition },
    ThreatDerived { feed_id: String, indicator_id: String },
}

impl PatternSource {
    pub fn method(&self) -> DiscoveryMethod {
        match self {
            PatternSource::NgramMined { .. } => DiscoveryMethod::NgramFrequency,
            PatternSource::ThreatDerived { .. } => DiscoveryMethod::ThreatIntel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternStatus {
    Discovered,
    PendingReview,
    Approved,
    Rejected,
}

impl PatternStatus {
    pub fn is_resolved(&self) -> bool {
        matches!(self, PatternStatus::Approved | PatternStatus::Rejected)
    }
}

impl fmt::Display for PatternStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PatternStatus::Discovered => "discovered",
            PatternStatus::PendingReview => "pending_review",
            PatternStatus::Approved => "approved",
            PatternStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Review queue priority. Declaration order gives `Critical > High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl ReviewPriority {
    /// Default queue priority for a candidate of the given confidence.
    pub fn for_confidence(confidence: f64) -> Self {
        if confidence >= 0.95 {
            ReviewPriority::Critical
        } else if confidence >= 0.8 {
            ReviewPriority::High
        } else if confidence >= 0.6 {
            ReviewPriority::Medium
        } else {
            ReviewPriority::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePattern {
    pub id: PatternId,
    pub tenant_id: TenantId,
    pub kind: PatternKind,
    /// Regex as it would be deployed
    pub value: String,
    pub source: PatternSource,
    pub method: DiscoveryMethod,
    pub confidence: f64,
    pub occurrence_count: u64,
    pub example_inputs: Vec<String>,
    #[serde(default)]
    pub pii_category: Option<String>,
    pub status: PatternStatus,
    pub discovered_at: DateTime<Utc>,
    #[serde(default)]
    pub priority: Option<ReviewPriority>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub submission_context: Option<String>,
    #[serde(default)]
    pub reviewed_by: Option<String>,
    #[serde(default)]
    pub reviewed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub review_notes: Option<String>,
}

impl CandidatePattern {
    pub fn new(
        tenant_id: TenantId,
        kind: PatternKind,
        value: impl Into<String>,
        source: PatternSource,
        confidence: f64,
        occurrence_count: u64,
        discovered_at: DateTime<Utc>,
    ) -> Self {
        let value = value.into();
        let method = source.method();
        Self {
            id: PatternId::derive(&tenant_id, kind, &value),
            tenant_id,
            kind,
            value,
            source,
            method,
            confidence: confidence.clamp(0.0, 1.0),
            occurrence_count,
            example_inputs: Vec::new(),
            pii_category: None,
            status: PatternStatus::Discovered,
            discovered_at,
            priority: None,
            submitted_at: None,
            submission_context: None,
            reviewed_by: None,
            reviewed_at: None,
            review_notes: None,
        }
    }

    pub fn with_examples<I>(mut self, examples: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.example_inputs = examples.into_iter().take(MAX_EXAMPLE_INPUTS).collect();
        self
    }

    pub fn with_pii_category(mut self, category: impl Into<String>) -> Self {
        self.pii_category = Some(category.into());
        self
    }

    pub fn mark_pending(
        &mut self,
        priority: ReviewPriority,
        context: Option<String>,
        at: DateTime<Utc>,
    ) {
        self.status = PatternStatus::PendingReview;
        self.priority = Some(priority);
        self.submission_context = context;
        self.submitted_at = Some(at);
    }

    pub fn approve(&mut self, reviewer: &str, at: DateTime<Utc>, notes: Option<String>) {
        self.resolve(PatternStatus::Approved, reviewer, at, notes);
    }

    pub fn reject(&mut self, reviewer: &str, at: DateTime<Utc>, notes: Option<String>) {
        self.resolve(PatternStatus::Rejected, reviewer, at, notes);
    }

    fn resolve(&mut self, status: PatternStatus, reviewer: &str, at: DateTime<Utc>, notes: Option<String>) {
        self.status = status;
        self.reviewed_by = Some(reviewer.to_string());
        self.reviewed_at = Some(at);
        self.review_notes = notes;
    }
}
