// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Review Records
//!
//! Append-only log of reviewer decisions. A pattern's status is a pure
//! function of its snapshot plus this log, see [`replay_status`].
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Review log entries and replay

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

use super::pattern::{PatternId, PatternStatus};

/// Reviewer identity recorded for threshold-based auto-approval.
pub const AUTO_APPROVER: &str = "system:auto-approver";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Approve,
    Reject,
    RequestChanges,
    Defer,
}

impl fmt::Display for ReviewAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReviewAction::Approve => "approve",
            ReviewAction::Reject => "reject",
            ReviewAction::RequestChanges => "request_changes",
            ReviewAction::Defer => "defer",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub id: Uuid,
    pub pattern_id: PatternId,
    pub reviewer: String,
    pub action: ReviewAction,
    pub notes: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ReviewRecord {
    pub fn new(
        pattern_id: PatternId,
        reviewer: impl Into<String>,
        action: ReviewAction,
        notes: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            pattern_id,
            reviewer: reviewer.into(),
            action,
            notes,
            timestamp,
        }
    }

    pub fn is_automatic(&self) -> bool {
        self.reviewer == AUTO_APPROVER
    }
}

/// Number of distinct reviewers who approved.
pub fn approval_count(records: &[ReviewRecord]) -> u32 {
    records
        .iter()
        .filter(|r| r.action == ReviewAction::Approve)
        .map(|r| r.reviewer.as_str())
        .collect::<HashSet<_>>()
        .len() as u32
}

/// The entry that resolved the pattern, if any.
///
/// Entries are taken in timestamp order; entries after the first resolving one
/// are ignored. An auto-approver entry resolves on its own regardless of
/// `required_approvals`.
pub fn resolving_record(records: &[ReviewRecord], required_approvals: u32) -> Option<&ReviewRecord> {
    let mut ordered: Vec<&ReviewRecord> = records.iter().collect();
    ordered.sort_by_key(|r| r.timestamp);

    let mut approvers: HashSet<&str> = HashSet::new();
    for record in ordered {
        match record.action {
            ReviewAction::Approve => {
                approvers.insert(record.reviewer.as_str());
                if record.is_automatic() || approvers.len() as u32 >= required_approvals.max(1) {
                    return Some(record);
                }
            }
            ReviewAction::Reject => return Some(record),
            ReviewAction::RequestChanges | ReviewAction::Defer => {}
        }
    }
    None
}

/// Replays a review log and returns the resulting status.
///
/// An empty log yields `None`: the snapshot status stands.
pub fn replay_status(records: &[ReviewRecord], required_approvals: u32) -> Option<PatternStatus> {
    if records.is_empty() {
        return None;
    }

    match resolving_record(records, required_approvals) {
        Some(record) if record.action == ReviewAction::Reject => Some(PatternStatus::Rejected),
        Some(_) => Some(PatternStatus::Approved),
        None => Some(PatternStatus::PendingReview),
    }
}
