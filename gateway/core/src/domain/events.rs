// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::pattern::{PatternId, PatternKind};
use crate::domain::rule_version::SemanticVersion;
use crate::domain::tenant::TenantId;

/// Review decisions on candidate patterns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReviewEvent {
    PatternApproved {
        tenant_id: TenantId,
        pattern_id: PatternId,
        kind: PatternKind,
        value: String,
        approved_by: String,
        automatic: bool,
        approved_at: DateTime<Utc>,
    },
    PatternRejected {
        tenant_id: TenantId,
        pattern_id: PatternId,
        value: String,
        rejected_by: String,
        reason: Option<String>,
        rejected_at: DateTime<Utc>,
    },
}

/// Rule version deployment lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RolloutEvent {
    CanaryDeployed {
        tenant_id: TenantId,
        version: SemanticVersion,
        percentage: u8,
        deployed_at: DateTime<Utc>,
    },
    CanaryExpanded {
        tenant_id: TenantId,
        version: SemanticVersion,
        from_percentage: u8,
        to_percentage: u8,
        expanded_at: DateTime<Utc>,
    },
    VersionPromoted {
        tenant_id: TenantId,
        version: SemanticVersion,
        previous: Option<SemanticVersion>,
        promoted_at: DateTime<Utc>,
    },
    RollbackTriggered {
        tenant_id: TenantId,
        failed_version: Option<SemanticVersion>,
        restored_version: Option<SemanticVersion>,
        reason: String,
        triggered_at: DateTime<Utc>,
    },
}

/// External dependency health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResilienceEvent {
    CircuitOpened {
        channel: String,
        consecutive_failures: u32,
        open_cycles: u32,
        opened_at: DateTime<Utc>,
    },
}

/// Everything the notification layer can receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    Review(ReviewEvent),
    Rollout(RolloutEvent),
    Resilience(ResilienceEvent),
}

impl GatewayEvent {
    pub fn tenant_id(&self) -> Option<&TenantId> {
        match self {
            GatewayEvent::Review(ReviewEvent::PatternApproved { tenant_id, .. })
            | GatewayEvent::Review(ReviewEvent::PatternRejected { tenant_id, .. })
            | GatewayEvent::Rollout(RolloutEvent::CanaryDeployed { tenant_id, .. })
            | GatewayEvent::Rollout(RolloutEvent::CanaryExpanded { tenant_id, .. })
            | GatewayEvent::Rollout(RolloutEvent::VersionPromoted { tenant_id, .. })
            | GatewayEvent::Rollout(RolloutEvent::RollbackTriggered { tenant_id, .. }) => Some(tenant_id),
            GatewayEvent::Resilience(_) => None,
        }
    }

    /// One-line text suitable for a chat alert.
    pub fn summary(&self) -> String {
        match self {
            GatewayEvent::Review(ReviewEvent::PatternApproved { tenant_id, kind, value, approved_by, automatic, .. }) => {
                let how = if *automatic { "auto-approved" } else { "approved" };
                format!("[{tenant_id}] {kind} pattern `{value}` {how} by {approved_by}")
            }
            GatewayEvent::Review(ReviewEvent::PatternRejected { tenant_id, value, rejected_by, reason, .. }) => {
                let reason = reason.as_deref().unwrap_or("no reason given");
                format!("[{tenant_id}] pattern `{value}` rejected by {rejected_by}: {reason}")
            }
            GatewayEvent::Rollout(RolloutEvent::CanaryDeployed { tenant_id, version, percentage, .. }) => {
                format!("[{tenant_id}] rules v{version} deployed as canary at {percentage}%")
            }
            GatewayEvent::Rollout(RolloutEvent::CanaryExpanded { tenant_id, version, from_percentage, to_percentage, .. }) => {
                format!("[{tenant_id}] canary v{version} expanded {from_percentage}% -> {to_percentage}%")
            }
            GatewayEvent::Rollout(RolloutEvent::VersionPromoted { tenant_id, version, previous, .. }) => match previous {
                Some(prev) => format!("[{tenant_id}] rules v{version} promoted to stable, replacing v{prev}"),
                None => format!("[{tenant_id}] rules v{version} promoted to stable"),
            },
            GatewayEvent::Rollout(RolloutEvent::RollbackTriggered { tenant_id, failed_version, restored_version, reason, .. }) => {
                let failed = failed_version.map(|v| format!("v{v}")).unwrap_or_else(|| "none".to_string());
                let restored = restored_version.map(|v| format!("v{v}")).unwrap_or_else(|| "nothing".to_string());
                format!("[{tenant_id}] ROLLBACK of {failed}, restored {restored}: {reason}")
            }
            GatewayEvent::Resilience(ResilienceEvent::CircuitOpened { channel, consecutive_failures, open_cycles, .. }) => {
                format!("circuit `{channel}` opened after {consecutive_failures} failures (cycle {open_cycles})")
            }
        }
    }
}
