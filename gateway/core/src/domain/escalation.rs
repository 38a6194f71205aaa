// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Escalation
//!
//! Request context handed to the secondary-opinion path and the assessment it
//! returns. The context carries only what the detection layer already knows;
//! session ids and timestamps never influence the cached result.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Escalation value objects

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::tenant::TenantId;
use super::threat_intel::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationKind {
    InputIntent,
    Behavioral,
    OutputLeak,
}

impl EscalationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationKind::InputIntent => "input_intent",
            EscalationKind::Behavioral => "behavioral",
            EscalationKind::OutputLeak => "output_leak",
        }
    }
}

impl fmt::Display for EscalationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedThreat {
    pub label: String,
    pub severity: Severity,
}

impl DetectedThreat {
    pub fn new(label: impl Into<String>, severity: Severity) -> Self {
        Self { label: label.into(), severity }
    }
}

/// Rate counters for the agent's recent activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BehaviorSignals {
    pub repeated_actions: u32,
    pub tokens_per_minute: f64,
    pub calls_per_minute: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationContext {
    pub tenant_id: TenantId,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub input_text: String,
    #[serde(default)]
    pub output_text: Option<String>,
    pub primary_risk_score: f64,
    #[serde(default)]
    pub detected_threats: Vec<DetectedThreat>,
    /// 0.0 (untrusted) to 1.0 (fully trusted)
    pub trust_score: f64,
    #[serde(default)]
    pub prior_violations: u32,
    #[serde(default)]
    pub behavior: BehaviorSignals,
}

impl EscalationContext {
    pub fn new(tenant_id: TenantId, session_id: impl Into<String>, input_text: impl Into<String>) -> Self {
        Self {
            tenant_id,
            session_id: session_id.into(),
            timestamp: Utc::now(),
            input_text: input_text.into(),
            output_text: None,
            primary_risk_score: 0.5,
            detected_threats: Vec::new(),
            trust_score: 1.0,
            prior_violations: 0,
            behavior: BehaviorSignals::default(),
        }
    }

    pub fn with_threat(mut self, label: impl Into<String>, severity: Severity) -> Self {
        self.detected_threats.push(DetectedThreat::new(label, severity));
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output_text = Some(output.into());
        self
    }

    pub fn with_primary_score(mut self, score: f64) -> Self {
        self.primary_risk_score = score;
        self
    }

    pub fn with_trust(mut self, trust_score: f64, prior_violations: u32) -> Self {
        self.trust_score = trust_score;
        self.prior_violations = prior_violations;
        self
    }

    pub fn with_behavior(mut self, behavior: BehaviorSignals) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn max_threat_severity(&self) -> Option<Severity> {
        self.detected_threats.iter().map(|t| t.severity).max()
    }

    /// Threat labels sorted and de-duplicated.
    pub fn sorted_threat_labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = self.detected_threats.iter().map(|t| t.label.as_str()).collect();
        labels.sort_unstable();
        labels.dedup();
        labels
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.85 {
            RiskLevel::Critical
        } else if score >= 0.7 {
            RiskLevel::High
        } else if score >= 0.4 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            other => Err(format!("unknown risk level '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EscalationMetadata {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationResult {
    pub kind: EscalationKind,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub confidence: f64,
    pub threats: Vec<String>,
    pub rationale: String,
    pub recommendations: Vec<String>,
    pub fallback_used: bool,
    #[serde(default)]
    pub cached: bool,
    pub metadata: EscalationMetadata,
    pub analyzed_at: DateTime<Utc>,
}
