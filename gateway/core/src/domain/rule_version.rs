// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Rule Versions
//!
//! Immutable, monotonically numbered rule sets and their deployment lifecycle
//! (pending → canary → stable → deprecated). Only status, percentage, metrics,
//! timestamps and the rollback reason change after creation.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Rule set value object, version aggregate, deployment transitions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use super::pattern::{CandidatePattern, PatternId, PatternKind};
use super::repository::RepositoryError;
use super::tenant::TenantId;

/// PII group used when a discovered PII pattern carries no category.
pub const DISCOVERED_PII_CATEGORY: &str = "discovered";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SemanticVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SemanticVersion {
    pub const ZERO: SemanticVersion = SemanticVersion { major: 0, minor: 0, patch: 0 };

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    pub fn next_patch(&self) -> Self {
        Self { patch: self.patch + 1, ..*self }
    }
}

impl fmt::Display for SemanticVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid semantic version '{0}': expected major.minor.patch")]
pub struct VersionParseError(String);

impl FromStr for SemanticVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('v');
        let parts: Vec<&str> = trimmed.split('.').collect();
        if parts.len() != 3 {
            return Err(VersionParseError(s.to_string()));
        }
        let parse = |p: &str| p.parse::<u32>().map_err(|_| VersionParseError(s.to_string()));
        Ok(Self::new(parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
    }
}

impl TryFrom<String> for SemanticVersion {
    type Error = VersionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SemanticVersion> for String {
    fn from(value: SemanticVersion) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Canary,
    Stable,
    Deprecated,
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Canary => "canary",
            DeploymentStatus::Stable => "stable",
            DeploymentStatus::Deprecated => "deprecated",
        };
        f.write_str(s)
    }
}

/// Rolling performance of a deployed version, as reported by the detection layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub detection_rate: f64,
    pub false_positive_rate: f64,
    pub mean_latency_ms: f64,
}

impl PerformanceMetrics {
    /// Baseline used when no stable version (or no stable metrics) exists.
    pub const DEFAULT_BASELINE: PerformanceMetrics = PerformanceMetrics {
        detection_rate: 0.95,
        false_positive_rate: 0.03,
        mean_latency_ms: 100.0,
    };

    pub fn new(detection_rate: f64, false_positive_rate: f64, mean_latency_ms: f64) -> Self {
        Self { detection_rate, false_positive_rate, mean_latency_ms }
    }

    pub fn validate(&self) -> Result<(), String> {
        let rate_ok = |r: f64| r.is_finite() && (0.0..=1.0).contains(&r);
        if !rate_ok(self.detection_rate) {
            return Err(format!("detection_rate {} outside [0, 1]", self.detection_rate));
        }
        if !rate_ok(self.false_positive_rate) {
            return Err(format!("false_positive_rate {} outside [0, 1]", self.false_positive_rate));
        }
        if !self.mean_latency_ms.is_finite() || self.mean_latency_ms < 0.0 {
            return Err(format!("mean_latency_ms {} must be non-negative", self.mean_latency_ms));
        }
        Ok(())
    }
}

/// Fully materialized rules for one version: ancestors merged in, duplicates removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub pii_patterns: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub injection_patterns: Vec<String>,
    /// Approved false-positive phrases; matching inputs are exempt from blocking.
    #[serde(default)]
    pub allow_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSetDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl RuleSet {
    /// Returns a copy of `self` with the given approved patterns merged in by category.
    pub fn merge<'a, I>(&self, patterns: I) -> RuleSet
    where
        I: IntoIterator<Item = &'a CandidatePattern>,
    {
        let mut merged = self.clone();
        for pattern in patterns {
            match pattern.kind {
                PatternKind::AttackVariant | PatternKind::IntelDerived => {
                    push_unique(&mut merged.injection_patterns, &pattern.value)
                }
                PatternKind::PiiVariant => {
                    let category = pattern
                        .pii_category
                        .clone()
                        .unwrap_or_else(|| DISCOVERED_PII_CATEGORY.to_string());
                    push_unique(merged.pii_patterns.entry(category).or_default(), &pattern.value)
                }
                PatternKind::FalsePositive => push_unique(&mut merged.allow_patterns, &pattern.value),
            }
        }
        merged
    }

    pub fn diff(&self, parent: &RuleSet) -> RuleSetDiff {
        let ours = self.entries();
        let theirs = parent.entries();
        RuleSetDiff {
            added: ours.difference(&theirs).map(|(_, v)| v.clone()).collect(),
            removed: theirs.difference(&ours).map(|(_, v)| v.clone()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.injection_patterns.len()
            + self.allow_patterns.len()
            + self.pii_patterns.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> BTreeSet<(String, String)> {
        let mut entries = BTreeSet::new();
        for value in &self.injection_patterns {
            entries.insert(("injection".to_string(), value.clone()));
        }
        for value in &self.allow_patterns {
            entries.insert(("allow".to_string(), value.clone()));
        }
        for (category, values) in &self.pii_patterns {
            for value in values {
                entries.insert((format!("pii:{category}"), value.clone()));
            }
        }
        entries
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|existing| existing == value) {
        list.push(value.to_string());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeploymentError {
    #[error("invalid deployment percentage {0}: expected 1-100")]
    InvalidPercentage(u8),

    #[error("version {version} cannot move from {from} to {to}")]
    InvalidTransition {
        version: SemanticVersion,
        from: DeploymentStatus,
        to: DeploymentStatus,
    },

    #[error("canary percentage cannot decrease from {current}% to {requested}%")]
    PercentageDecrease { current: u8, requested: u8 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleVersion {
    pub tenant_id: TenantId,
    pub version: SemanticVersion,
    pub parent: Option<SemanticVersion>,
    pub created_by: String,
    pub changelog: String,
    pub rule_set: RuleSet,
    pub patterns_added: Vec<String>,
    pub patterns_removed: Vec<String>,
    #[serde(default)]
    pub source_patterns: Vec<PatternId>,
    pub status: DeploymentStatus,
    pub deployment_percentage: u8,
    #[serde(default)]
    pub metrics: Option<PerformanceMetrics>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deployed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub promoted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deprecated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rollback_reason: Option<String>,
}

impl RuleVersion {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: TenantId,
        version: SemanticVersion,
        parent: Option<&RuleVersion>,
        rule_set: RuleSet,
        created_by: impl Into<String>,
        changelog: impl Into<String>,
        source_patterns: Vec<PatternId>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let empty = RuleSet::default();
        let diff = rule_set.diff(parent.map(|p| &p.rule_set).unwrap_or(&empty));
        Self {
            tenant_id,
            version,
            parent: parent.map(|p| p.version),
            created_by: created_by.into(),
            changelog: changelog.into(),
            rule_set,
            patterns_added: diff.added,
            patterns_removed: diff.removed,
            source_patterns,
            status: DeploymentStatus::Pending,
            deployment_percentage: 0,
            metrics: None,
            created_at,
            deployed_at: None,
            promoted_at: None,
            deprecated_at: None,
            rollback_reason: None,
        }
    }

    pub fn start_canary(&mut self, percentage: u8, at: DateTime<Utc>) -> Result<(), DeploymentError> {
        check_percentage(percentage)?;
        self.require(DeploymentStatus::Pending, DeploymentStatus::Canary)?;
        self.status = DeploymentStatus::Canary;
        self.deployment_percentage = percentage;
        self.deployed_at = Some(at);
        Ok(())
    }

    pub fn expand(&mut self, percentage: u8) -> Result<(), DeploymentError> {
        check_percentage(percentage)?;
        self.require(DeploymentStatus::Canary, DeploymentStatus::Canary)?;
        if percentage < self.deployment_percentage {
            return Err(DeploymentError::PercentageDecrease {
                current: self.deployment_percentage,
                requested: percentage,
            });
        }
        self.deployment_percentage = percentage;
        Ok(())
    }

    pub fn promote(&mut self, at: DateTime<Utc>) -> Result<(), DeploymentError> {
        self.require(DeploymentStatus::Canary, DeploymentStatus::Stable)?;
        self.status = DeploymentStatus::Stable;
        self.deployment_percentage = 100;
        self.promoted_at = Some(at);
        Ok(())
    }

    pub fn deprecate(&mut self, at: DateTime<Utc>, reason: Option<String>) -> Result<(), DeploymentError> {
        if self.status == DeploymentStatus::Deprecated {
            return Err(DeploymentError::InvalidTransition {
                version: self.version,
                from: self.status,
                to: DeploymentStatus::Deprecated,
            });
        }
        self.status = DeploymentStatus::Deprecated;
        self.deployment_percentage = 0;
        self.deprecated_at = Some(at);
        if reason.is_some() {
            self.rollback_reason = reason;
        }
        Ok(())
    }

    /// Brings a deprecated version back as the stable one.
    pub fn reinstate(&mut self, at: DateTime<Utc>) -> Result<(), DeploymentError> {
        self.require(DeploymentStatus::Deprecated, DeploymentStatus::Stable)?;
        self.status = DeploymentStatus::Stable;
        self.deployment_percentage = 100;
        self.promoted_at = Some(at);
        self.deprecated_at = None;
        Ok(())
    }

    /// A version deprecated because it failed. Never reinstated by rollback.
    pub fn was_rolled_back(&self) -> bool {
        self.rollback_reason.is_some()
    }

    fn require(&self, expected: DeploymentStatus, to: DeploymentStatus) -> Result<(), DeploymentError> {
        if self.status != expected {
            return Err(DeploymentError::InvalidTransition {
                version: self.version,
                from: self.status,
                to,
            });
        }
        Ok(())
    }
}

fn check_percentage(percentage: u8) -> Result<(), DeploymentError> {
    if percentage == 0 || percentage > 100 {
        return Err(DeploymentError::InvalidPercentage(percentage));
    }
    Ok(())
}

/// Live metrics for a deployed version, provided by the detection layer.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn current_metrics(
        &self,
        tenant: &TenantId,
        version: SemanticVersion,
    ) -> Result<Option<PerformanceMetrics>, RepositoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pattern::{LogPartition, PatternSource};

    fn approved(kind: PatternKind, value: &str) -> CandidatePattern {
        CandidatePattern::new(
            TenantId::default(),
            kind,
            value,
            PatternSource::NgramMined { n: 3, partition: LogPartition::BlockedInjection },
            0.9,
            5,
            Utc::now(),
        )
    }

    fn version(patch: u32) -> RuleVersion {
        RuleVersion::new(
            TenantId::default(),
            SemanticVersion::new(0, 0, patch),
            None,
            RuleSet::default(),
            "tester",
            "test",
            vec![],
            Utc::now(),
        )
    }

    #[test]
    fn test_version_parse_and_order() {
        let v: SemanticVersion = "1.2.3".parse().unwrap();
        assert_eq!(v, SemanticVersion::new(1, 2, 3));
        assert_eq!(v.next_patch().to_string(), "1.2.4");
        assert!(SemanticVersion::new(0, 0, 10) > SemanticVersion::new(0, 0, 9));
        assert!(SemanticVersion::new(0, 1, 0) > SemanticVersion::new(0, 0, 99));
        assert!("1.2".parse::<SemanticVersion>().is_err());
        assert_eq!(SemanticVersion::ZERO.next_patch(), SemanticVersion::new(0, 0, 1));
    }

    #[test]
    fn test_version_serde_as_string() {
        let json = serde_json::to_string(&SemanticVersion::new(0, 0, 2)).unwrap();
        assert_eq!(json, "\"0.0.2\"");
        let back: SemanticVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SemanticVersion::new(0, 0, 2));
    }

    #[test]
    fn test_merge_dedups_and_groups() {
        let base = RuleSet::default().merge(&[approved(PatternKind::AttackVariant, "a")]);
        let pii = approved(PatternKind::PiiVariant, "p").with_pii_category("email");
        let merged = base.merge(&[
            approved(PatternKind::AttackVariant, "a"),
            approved(PatternKind::IntelDerived, "b"),
            approved(PatternKind::FalsePositive, "f"),
            approved(PatternKind::PiiVariant, "q"),
            pii,
        ]);
        assert_eq!(merged.injection_patterns, vec!["a", "b"]);
        assert_eq!(merged.allow_patterns, vec!["f"]);
        assert_eq!(merged.pii_patterns["email"], vec!["p"]);
        assert_eq!(merged.pii_patterns[DISCOVERED_PII_CATEGORY], vec!["q"]);
        assert_eq!(merged.len(), 5);

        let diff = merged.diff(&base);
        assert_eq!(diff.added.len(), 4);
        assert!(diff.removed.is_empty());
        assert!(!diff.added.contains(&"a".to_string()));
    }

    #[test]
    fn test_canary_lifecycle() {
        let mut v = version(1);
        assert_eq!(v.start_canary(0, Utc::now()), Err(DeploymentError::InvalidPercentage(0)));
        v.start_canary(10, Utc::now()).unwrap();
        assert!(matches!(v.expand(5), Err(DeploymentError::PercentageDecrease { current: 10, requested: 5 })));
        assert_eq!(v.expand(101), Err(DeploymentError::InvalidPercentage(101)));
        v.expand(50).unwrap();
        v.promote(Utc::now()).unwrap();
        assert_eq!(v.status, DeploymentStatus::Stable);
        assert_eq!(v.deployment_percentage, 100);
        assert!(v.expand(60).is_err());
    }

    #[test]
    fn test_deprecate_and_reinstate() {
        let mut v = version(1);
        v.start_canary(10, Utc::now()).unwrap();
        v.deprecate(Utc::now(), Some("fp spike".into())).unwrap();
        assert!(v.was_rolled_back());
        assert!(v.deprecate(Utc::now(), None).is_err());
        v.reinstate(Utc::now()).unwrap();
        assert_eq!(v.status, DeploymentStatus::Stable);
        assert!(v.deprecated_at.is_none());
    }

    #[test]
    fn test_metrics_validation() {
        assert!(PerformanceMetrics::DEFAULT_BASELINE.validate().is_ok());
        assert!(PerformanceMetrics::new(1.2, 0.0, 1.0).validate().is_err());
        assert!(PerformanceMetrics::new(0.9, 0.0, -1.0).validate().is_err());
    }
}
