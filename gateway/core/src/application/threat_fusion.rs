// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Threat Fusion
//!
//! Pulls indicators from every configured feed, keeps the latest sighting of
//! each, and turns them into candidate patterns or correlates them against
//! session activity. Feeds are fetched concurrently; one failing feed is
//! reported and skipped, never blocking the others.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Secondary candidate source alongside log mining

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::pattern_discovery::{tokenize, to_regex};
use crate::domain::audit_log::AuditLogRecord;
use crate::domain::gateway_config::ThreatFeedsConfig;
use crate::domain::pattern::{CandidatePattern, PatternKind, PatternSource};
use crate::domain::tenant::TenantId;
use crate::domain::threat_intel::{IndicatorType, Severity, ThreatFeed, ThreatIndicator};

/// Outcome of one refresh across all feeds
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedSyncReport {
    pub fetched: BTreeMap<String, usize>,
    pub failed: BTreeMap<String, String>,
}

/// A session whose inputs matched one or more indicators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionCorrelation {
    pub tenant_id: TenantId,
    pub session_id: String,
    /// `(feed_id, indicator_id)` pairs, sorted
    pub indicators: Vec<(String, String)>,
    pub max_severity: Severity,
    pub score: f64,
}

pub struct ThreatFusion {
    feeds: Vec<Arc<dyn ThreatFeed>>,
    indicators: DashMap<(String, String), ThreatIndicator>,
    last_sync: DashMap<String, DateTime<Utc>>,
    config: ThreatFeedsConfig,
}

impl ThreatFusion {
    pub fn new(feeds: Vec<Arc<dyn ThreatFeed>>, config: ThreatFeedsConfig) -> Self {
        Self {
            feeds,
            indicators: DashMap::new(),
            last_sync: DashMap::new(),
            config,
        }
    }

    pub fn indicator_count(&self) -> usize {
        self.indicators.len()
    }

    pub fn last_sync(&self, feed_id: &str) -> Option<DateTime<Utc>> {
        self.last_sync.get(feed_id).map(|entry| *entry)
    }

    /// Fetch from every feed concurrently; each feed resumes from its last successful sync.
    pub async fn refresh(&self, now: DateTime<Utc>) -> FeedSyncReport {
        let fetches = self.feeds.iter().map(|feed| {
            let since = self.last_sync(feed.feed_id());
            async move { (feed.feed_id().to_string(), feed.fetch_since(since).await) }
        });

        let mut report = FeedSyncReport::default();
        for (feed_id, result) in join_all(fetches).await {
            match result {
                Ok(indicators) => {
                    report.fetched.insert(feed_id.clone(), indicators.len());
                    self.ingest(indicators);
                    self.last_sync.insert(feed_id, now);
                }
                Err(e) => {
                    warn!(feed = %feed_id, error = %e, "Threat feed refresh failed");
                    metrics::counter!("warden_threat_feed_failures_total", "feed" => feed_id.clone()).increment(1);
                    report.failed.insert(feed_id, e.to_string());
                }
            }
        }

        metrics::gauge!("warden_threat_indicators").set(self.indicators.len() as f64);
        info!(
            feeds_ok = report.fetched.len(),
            feeds_failed = report.failed.len(),
            indicators = self.indicators.len(),
            "Threat feed refresh complete"
        );
        report
    }

    pub fn ingest(&self, indicators: Vec<ThreatIndicator>) {
        for indicator in indicators {
            match self.indicators.get_mut(&indicator.key()) {
                Some(mut existing) => existing.absorb(indicator),
                None => {
                    self.indicators.insert(indicator.key(), indicator);
                }
            }
        }
    }

    /// Candidates for indicators above the configured confidence and severity floors.
    pub fn to_candidates(&self, tenant: &TenantId, now: DateTime<Utc>) -> Vec<CandidatePattern> {
        let mut eligible: Vec<ThreatIndicator> = self
            .indicators
            .iter()
            .filter(|entry| {
                entry.confidence >= self.config.min_confidence && entry.severity >= self.config.min_severity
            })
            .map(|entry| entry.value().clone())
            .collect();
        eligible.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| b.confidence.total_cmp(&a.confidence))
                .then_with(|| a.key().cmp(&b.key()))
        });

        eligible
            .into_iter()
            .filter_map(|indicator| {
                let Some(value) = indicator_regex(&indicator) else {
                    debug!(
                        feed = %indicator.feed_id,
                        indicator = %indicator.indicator_id,
                        "Skipping indicator without a usable pattern"
                    );
                    return None;
                };
                let examples = indicator.description.clone().into_iter();
                Some(
                    CandidatePattern::new(
                        tenant.clone(),
                        PatternKind::IntelDerived,
                        value,
                        PatternSource::ThreatDerived {
                            feed_id: indicator.feed_id.clone(),
                            indicator_id: indicator.indicator_id.clone(),
                        },
                        indicator.confidence,
                        1,
                        now,
                    )
                    .with_examples(examples),
                )
            })
            .collect()
    }

    /// Match every indicator against the records, grouped by session.
    pub fn correlate(&self, records: &[AuditLogRecord]) -> Vec<SessionCorrelation> {
        let matchers: Vec<(Regex, ThreatIndicator)> = self
            .indicators
            .iter()
            .filter_map(|entry| {
                let pattern = indicator_regex(entry.value())?;
                Regex::new(&pattern).ok().map(|re| (re, entry.value().clone()))
            })
            .collect();

        let mut sessions: BTreeMap<(TenantId, String), Vec<&ThreatIndicator>> = BTreeMap::new();
        for record in records {
            for (re, indicator) in &matchers {
                if re.is_match(&record.input_text) {
                    let hits = sessions
                        .entry((record.tenant_id.clone(), record.session_id.clone()))
                        .or_default();
                    if !hits.iter().any(|h| h.key() == indicator.key()) {
                        hits.push(indicator);
                    }
                }
            }
        }

        let mut correlations: Vec<SessionCorrelation> = sessions
            .into_iter()
            .filter_map(|((tenant_id, session_id), hits)| {
                let max_severity = hits.iter().map(|h| h.severity).max()?;
                let base = hits
                    .iter()
                    .map(|h| h.severity.weight() * h.confidence)
                    .fold(0.0_f64, f64::max);
                // Each corroborating indicator adds a little
                let score = (base + 0.05 * (hits.len() - 1) as f64).min(1.0);
                let mut indicators: Vec<(String, String)> = hits.iter().map(|h| h.key()).collect();
                indicators.sort();
                Some(SessionCorrelation {
                    tenant_id,
                    session_id,
                    indicators,
                    max_severity,
                    score,
                })
            })
            .collect();

        correlations.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        correlations
    }
}

/// Regex matching an indicator, or `None` when the indicator carries no usable pattern.
fn indicator_regex(indicator: &ThreatIndicator) -> Option<String> {
    let value = indicator.value.trim();
    if value.is_empty() {
        return None;
    }
    match indicator.indicator_type {
        IndicatorType::Pattern => Regex::new(value).ok().map(|_| value.to_string()),
        IndicatorType::Signature => {
            let tokens = tokenize(value);
            (!tokens.is_empty()).then(|| to_regex(&tokens))
        }
        IndicatorType::Ip => Some(format!(r"\b{}\b", regex::escape(value))),
        IndicatorType::Domain => Some(format!(r"(?i)\b{}\b", regex::escape(value))),
    }
}
