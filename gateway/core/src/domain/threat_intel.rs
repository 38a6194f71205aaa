// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Threat Intelligence
//!
//! Indicators pulled from external threat feeds and the feed interface itself.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Indicator value objects, severity scale, `ThreatFeed` port

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Risk weight used by the rule-based fallback analyses.
    pub fn weight(&self) -> f64 {
        match self {
            Severity::Critical => 0.9,
            Severity::High => 0.7,
            Severity::Medium => 0.5,
            Severity::Low => 0.3,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorType {
    /// Ready-made regex
    Pattern,
    /// Literal attack text
    Signature,
    Ip,
    Domain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatIndicator {
    pub feed_id: String,
    pub indicator_id: String,
    #[serde(rename = "type")]
    pub indicator_type: IndicatorType,
    pub value: String,
    pub severity: Severity,
    pub confidence: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ThreatIndicator {
    pub fn key(&self) -> (String, String) {
        (self.feed_id.clone(), self.indicator_id.clone())
    }

    /// Folds a newer sighting of the same indicator into this one.
    pub fn absorb(&mut self, newer: ThreatIndicator) {
        let first_seen = self.first_seen.min(newer.first_seen);
        let last_seen = self.last_seen.max(newer.last_seen);
        *self = newer;
        self.first_seen = first_seen;
        self.last_seen = last_seen;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Feed is disabled: {0}")]
    Disabled(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error: {0}")]
    Http(u16),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Source of threat indicators.
#[async_trait]
pub trait ThreatFeed: Send + Sync {
    fn feed_id(&self) -> &str;

    /// Indicators updated since `since` (all indicators when `None`).
    async fn fetch_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<ThreatIndicator>, FeedError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn indicator(first: DateTime<Utc>, last: DateTime<Utc>, confidence: f64) -> ThreatIndicator {
        ThreatIndicator {
            feed_id: "f".into(),
            indicator_id: "i".into(),
            indicator_type: IndicatorType::Signature,
            value: "drop table".into(),
            severity: Severity::High,
            confidence,
            first_seen: first,
            last_seen: last,
            description: None,
            tags: vec![],
        }
    }

    #[test]
    fn test_absorb_keeps_sighting_window() {
        let now = Utc::now();
        let mut old = indicator(now - Duration::days(3), now - Duration::days(2), 0.5);
        old.absorb(indicator(now - Duration::days(1), now, 0.8));
        assert_eq!(old.first_seen, now - Duration::days(3));
        assert_eq!(old.last_seen, now);
        assert_eq!(old.confidence, 0.8);
    }

    #[test]
    fn test_severity_weights_are_ordered() {
        assert!(Severity::Critical.weight() > Severity::High.weight());
        assert!(Severity::Critical > Severity::Low);
        let parsed: Severity = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(parsed, Severity::Critical);
    }
}
