// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Application
//!
//! Use cases composing the domain: discovery, review, deployment and
//! escalation, plus the background workers that drive them.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Orchestration of domain objects and infrastructure ports

pub mod approval_workflow;
pub mod canary_monitor;
pub mod discovery_scheduler;
pub mod escalation;
pub mod pattern_discovery;
pub mod rule_version_manager;
pub mod threat_fusion;

pub use approval_workflow::ApprovalWorkflow;
pub use escalation::EscalationAgent;
pub use pattern_discovery::PatternDiscoverer;
pub use rule_version_manager::RuleVersionManager;
pub use threat_fusion::ThreatFusion;
