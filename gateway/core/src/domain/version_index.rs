// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Version Index
//!
//! In-memory index of a tenant's recent rule versions ordered by version
//! number. Rollback searches it in descending order instead of walking parent
//! pointers. Depth is capped; evicted (deprecated) versions remain in the
//! durable store and `has_archived` tells callers to consult it.

use std::collections::BTreeMap;

use super::rule_version::{DeploymentStatus, RuleVersion, SemanticVersion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub status: DeploymentStatus,
    pub parent: Option<SemanticVersion>,
    pub rolled_back: bool,
}

#[derive(Debug, Clone)]
pub struct VersionIndex {
    depth: usize,
    entries: BTreeMap<SemanticVersion, IndexEntry>,
    highest: Option<SemanticVersion>,
    archived: bool,
}

impl VersionIndex {
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            entries: BTreeMap::new(),
            highest: None,
            archived: false,
        }
    }

    pub fn upsert(&mut self, version: &RuleVersion) {
        self.highest = self.highest.max(Some(version.version));
        self.entries.insert(
            version.version,
            IndexEntry {
                status: version.status,
                parent: version.parent,
                rolled_back: version.was_rolled_back(),
            },
        );

        while self.entries.len() > self.depth {
            // Only deprecated versions leave the hot index; live ones must stay addressable.
            let evictable = self
                .entries
                .iter()
                .find(|(_, e)| e.status == DeploymentStatus::Deprecated)
                .map(|(v, _)| *v);
            match evictable {
                Some(v) => {
                    self.entries.remove(&v);
                    self.archived = true;
                }
                None => break,
            }
        }
    }

    pub fn get(&self, version: SemanticVersion) -> Option<&IndexEntry> {
        self.entries.get(&version)
    }

    /// Highest version ever indexed, evicted ones included.
    pub fn highest(&self) -> Option<SemanticVersion> {
        self.highest
    }

    pub fn oldest(&self) -> Option<SemanticVersion> {
        self.entries.keys().next().copied()
    }

    /// Highest indexed version currently in `status`.
    pub fn find_status(&self, status: DeploymentStatus) -> Option<SemanticVersion> {
        self.entries
            .iter()
            .rev()
            .find(|(_, e)| e.status == status)
            .map(|(v, _)| *v)
    }

    /// Most recent deprecated, never-rolled-back version strictly below `failing`.
    pub fn rollback_target(&self, failing: SemanticVersion) -> Option<SemanticVersion> {
        self.entries
            .range(..failing)
            .rev()
            .find(|(_, e)| e.status == DeploymentStatus::Deprecated && !e.rolled_back)
            .map(|(v, _)| *v)
    }

    pub fn has_archived(&self) -> bool {
        self.archived
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
