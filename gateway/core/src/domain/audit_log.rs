// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Audit Log
//!
//! Read-only view of the risk-scored interaction records written by the
//! detection layer. The core never mutates these; it pulls windows of them for
//! pattern discovery and threat correlation.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** External record shape and partition predicates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::tenant::TenantId;

/// Aggregate risk below which a blocked request is treated as a suspected false positive.
pub const FALSE_POSITIVE_RISK_CEILING: f64 = 0.5;

/// One interaction as scored by the detection layer. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    #[serde(default)]
    pub tenant_id: TenantId,
    pub input_text: String,
    pub blocked: bool,
    #[serde(default)]
    pub injection_detected: bool,
    #[serde(default)]
    pub pii_detected: bool,
    pub risk_score: f64,
}

impl AuditLogRecord {
    pub fn new(
        tenant_id: TenantId,
        session_id: impl Into<String>,
        input_text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp,
            session_id: session_id.into(),
            tenant_id,
            input_text: input_text.into(),
            blocked: false,
            injection_detected: false,
            pii_detected: false,
            risk_score: 0.0,
        }
    }

    /// Marks the record as blocked with the given flags and aggregate score.
    pub fn blocked(mut self, injection: bool, pii: bool, risk_score: f64) -> Self {
        self.blocked = true;
        self.injection_detected = injection;
        self.pii_detected = pii;
        self.risk_score = risk_score;
        self
    }

    pub fn is_blocked_injection(&self) -> bool {
        self.blocked && self.injection_detected
    }

    /// Blocked with a low aggregate score. This is a proxy: nothing in the log
    /// says the block was wrong, only that the detectors were not confident.
    pub fn is_suspected_false_positive(&self) -> bool {
        self.blocked && self.risk_score < FALSE_POSITIVE_RISK_CEILING
    }

    pub fn is_blocked_pii(&self) -> bool {
        self.blocked && self.pii_detected
    }

    pub fn within(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> bool {
        self.timestamp >= since && self.timestamp <= until
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_predicates() {
        let now = Utc::now();
        let injection = AuditLogRecord::new(TenantId::default(), "s1", "x", now).blocked(true, false, 0.9);
        assert!(injection.is_blocked_injection());
        assert!(!injection.is_suspected_false_positive());

        let low = AuditLogRecord::new(TenantId::default(), "s2", "x", now).blocked(false, true, 0.2);
        assert!(low.is_suspected_false_positive());
        assert!(low.is_blocked_pii());
        assert!(!low.is_blocked_injection());

        let clean = AuditLogRecord::new(TenantId::default(), "s3", "x", now);
        assert!(!clean.is_suspected_false_positive());
    }

    #[test]
    fn test_deserialize_defaults_tenant() {
        let json = r#"{"timestamp":"2026-01-01T00:00:00Z","session_id":"s","input_text":"hi","blocked":true,"risk_score":0.4}"#;
        let record: AuditLogRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.tenant_id, TenantId::default());
        assert!(!record.injection_detected);
    }
}
