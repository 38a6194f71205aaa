// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the repository traits defined in
//! `crate::domain::repository`.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve domain aggregates
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! ## Sled
//!
//! - **SledStore** - embedded durable store implementing all three write-side
//!   repositories; every write is flushed before returning
//!
//! ## In-Memory
//!
//! Lightweight implementations for tests and development:
//! - **InMemoryPatternRepository**
//! - **InMemoryReviewRepository**
//! - **InMemoryRuleVersionRepository**
//! - **InMemoryAuditLogStore** - also the backing store for `warden discover`

pub mod sled_store;

pub use sled_store::SledStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::domain::audit_log::AuditLogRecord;
use crate::domain::pattern::{CandidatePattern, PatternId, PatternStatus};
use crate::domain::repository::{
    AuditLogSource, PatternRepository, RepositoryError, ReviewRepository, RuleVersionRepository,
    StorageBackend,
};
use crate::domain::review::ReviewRecord;
use crate::domain::rule_version::{DeploymentStatus, RuleVersion, SemanticVersion};
use crate::domain::tenant::TenantId;

/// Repositories selected by the configured storage backend.
#[derive(Clone)]
pub struct Repositories {
    pub patterns: Arc<dyn PatternRepository>,
    pub reviews: Arc<dyn ReviewRepository>,
    pub versions: Arc<dyn RuleVersionRepository>,
}

impl Repositories {
    pub fn in_memory() -> Self {
        Self {
            patterns: Arc::new(InMemoryPatternRepository::new()),
            reviews: Arc::new(InMemoryReviewRepository::new()),
            versions: Arc::new(InMemoryRuleVersionRepository::new()),
        }
    }

    pub fn from_backend(backend: &StorageBackend) -> Result<Self, RepositoryError> {
        match backend {
            StorageBackend::InMemory => Ok(Self::in_memory()),
            StorageBackend::Sled(config) => {
                let store = Arc::new(SledStore::open(&config.path)?);
                Ok(Self {
                    patterns: store.clone(),
                    reviews: store.clone(),
                    versions: store,
                })
            }
        }
    }
}

fn sort_patterns(patterns: &mut [CandidatePattern]) {
    patterns.sort_by(|a, b| a.discovered_at.cmp(&b.discovered_at).then_with(|| a.id.cmp(&b.id)));
}

#[derive(Clone, Default)]
pub struct InMemoryPatternRepository {
    patterns: Arc<RwLock<HashMap<PatternId, CandidatePattern>>>,
}

impl InMemoryPatternRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect<F>(&self, predicate: F) -> Vec<CandidatePattern>
    where
        F: Fn(&CandidatePattern) -> bool,
    {
        let mut found: Vec<CandidatePattern> =
            self.patterns.read().values().filter(|p| predicate(p)).cloned().collect();
        sort_patterns(&mut found);
        found
    }
}

#[async_trait]
impl PatternRepository for InMemoryPatternRepository {
    async fn save(&self, pattern: &CandidatePattern) -> Result<(), RepositoryError> {
        self.patterns.write().insert(pattern.id.clone(), pattern.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &PatternId) -> Result<Option<CandidatePattern>, RepositoryError> {
        Ok(self.patterns.read().get(id).cloned())
    }

    async fn find_by_status(&self, status: PatternStatus) -> Result<Vec<CandidatePattern>, RepositoryError> {
        Ok(self.collect(|p| p.status == status))
    }

    async fn find_by_tenant(&self, tenant: &TenantId) -> Result<Vec<CandidatePattern>, RepositoryError> {
        Ok(self.collect(|p| &p.tenant_id == tenant))
    }

    async fn list_all(&self) -> Result<Vec<CandidatePattern>, RepositoryError> {
        Ok(self.collect(|_| true))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryReviewRepository {
    records: Arc<RwLock<Vec<ReviewRecord>>>,
}

impl InMemoryReviewRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReviewRepository for InMemoryReviewRepository {
    async fn append(&self, record: &ReviewRecord) -> Result<(), RepositoryError> {
        self.records.write().push(record.clone());
        Ok(())
    }

    async fn find_by_pattern(&self, pattern_id: &PatternId) -> Result<Vec<ReviewRecord>, RepositoryError> {
        let mut found: Vec<ReviewRecord> = self
            .records
            .read()
            .iter()
            .filter(|r| &r.pattern_id == pattern_id)
            .cloned()
            .collect();
        // Stable sort keeps append order for equal timestamps
        found.sort_by_key(|r| r.timestamp);
        Ok(found)
    }

    async fn list_all(&self) -> Result<Vec<ReviewRecord>, RepositoryError> {
        let mut all = self.records.read().clone();
        all.sort_by_key(|r| r.timestamp);
        Ok(all)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryRuleVersionRepository {
    versions: Arc<RwLock<HashMap<TenantId, BTreeMap<SemanticVersion, RuleVersion>>>>,
}

impl InMemoryRuleVersionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleVersionRepository for InMemoryRuleVersionRepository {
    async fn save(&self, version: &RuleVersion) -> Result<(), RepositoryError> {
        self.versions
            .write()
            .entry(version.tenant_id.clone())
            .or_default()
            .insert(version.version, version.clone());
        Ok(())
    }

    async fn find(&self, tenant: &TenantId, version: SemanticVersion) -> Result<Option<RuleVersion>, RepositoryError> {
        Ok(self
            .versions
            .read()
            .get(tenant)
            .and_then(|versions| versions.get(&version))
            .cloned())
    }

    async fn find_by_status(&self, tenant: &TenantId, status: DeploymentStatus) -> Result<Vec<RuleVersion>, RepositoryError> {
        Ok(self
            .versions
            .read()
            .get(tenant)
            .map(|versions| versions.values().rev().filter(|v| v.status == status).cloned().collect())
            .unwrap_or_default())
    }

    async fn list_by_tenant(&self, tenant: &TenantId) -> Result<Vec<RuleVersion>, RepositoryError> {
        Ok(self
            .versions
            .read()
            .get(tenant)
            .map(|versions| versions.values().rev().cloned().collect())
            .unwrap_or_default())
    }
}

/// Append-only audit log held in memory.
#[derive(Clone, Default)]
pub struct InMemoryAuditLogStore {
    records: Arc<RwLock<Vec<AuditLogRecord>>>,
}

impl InMemoryAuditLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<AuditLogRecord>) -> Self {
        Self {
            records: Arc::new(RwLock::new(records)),
        }
    }

    pub fn append(&self, record: AuditLogRecord) {
        self.records.write().push(record);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditLogSource for InMemoryAuditLogStore {
    async fn fetch(
        &self,
        tenant: &TenantId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<AuditLogRecord>, RepositoryError> {
        let mut found: Vec<AuditLogRecord> = self
            .records
            .read()
            .iter()
            .filter(|r| &r.tenant_id == tenant && r.within(since, until))
            .cloned()
            .collect();
        found.sort_by_key(|r| r.timestamp);
        Ok(found)
    }
}
