// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Entities, value objects and the interfaces the core consumes from its
//! collaborators (log store, reasoning service, cache, threat feeds).
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure types and invariants, no I/O

pub mod tenant;
pub mod audit_log;
pub mod pattern;
pub mod review;
pub mod rule_version;
pub mod version_index;
pub mod threat_intel;
pub mod circuit_breaker;
pub mod escalation;
pub mod cache;
pub mod events;
pub mod llm;
pub mod repository;
pub mod gateway_config;

pub use tenant::TenantId;
pub use audit_log::AuditLogRecord;
pub use pattern::{CandidatePattern, PatternId, PatternKind, PatternStatus, ReviewPriority};
pub use review::{ReviewAction, ReviewRecord};
pub use rule_version::{DeploymentStatus, PerformanceMetrics, RuleSet, RuleVersion, SemanticVersion};
pub use threat_intel::{IndicatorType, Severity, ThreatIndicator};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use escalation::{EscalationContext, EscalationKind, EscalationResult, RiskLevel};
pub use events::GatewayEvent;
