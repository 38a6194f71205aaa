// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Sled-backed durable store
//
// One embedded database with a tree per aggregate:
// - `patterns`: pattern id -> CandidatePattern (JSON)
// - `reviews`:  pattern id \0 monotonic id -> ReviewRecord (JSON), append-only
// - `versions`: tenant \0 zero-padded version -> RuleVersion (JSON)
//
// Keys are laid out so prefix scans return a pattern's reviews in append order
// and a tenant's versions in version order. Each write is flushed before the
// call returns.

use async_trait::async_trait;
use std::path::Path;
use tracing::debug;

use crate::domain::pattern::{CandidatePattern, PatternId, PatternStatus};
use crate::domain::repository::{PatternRepository, RepositoryError, ReviewRepository, RuleVersionRepository};
use crate::domain::review::ReviewRecord;
use crate::domain::rule_version::{DeploymentStatus, RuleVersion, SemanticVersion};
use crate::domain::tenant::TenantId;

const SEPARATOR: u8 = 0;

pub struct SledStore {
    db: sled::Db,
    patterns: sled::Tree,
    reviews: sled::Tree,
    versions: sled::Tree,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let db = sled::open(path.as_ref())?;
        debug!(path = ?path.as_ref(), "Opened sled store");
        Self::from_db(db)
    }

    /// Throwaway store that lives only as long as the process
    pub fn temporary() -> Result<Self, RepositoryError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, RepositoryError> {
        Ok(Self {
            patterns: db.open_tree("patterns")?,
            reviews: db.open_tree("reviews")?,
            versions: db.open_tree("versions")?,
            db,
        })
    }

    async fn flush(&self) -> Result<(), RepositoryError> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn decode_all<T, I>(iter: I) -> Result<Vec<T>, RepositoryError>
    where
        T: serde::de::DeserializeOwned,
        I: Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>,
    {
        iter.map(|entry| {
            let (_, value) = entry?;
            Ok(serde_json::from_slice(&value)?)
        })
        .collect()
    }

    fn all_patterns(&self) -> Result<Vec<CandidatePattern>, RepositoryError> {
        let mut patterns: Vec<CandidatePattern> = Self::decode_all(self.patterns.iter())?;
        patterns.sort_by(|a, b| a.discovered_at.cmp(&b.discovered_at).then_with(|| a.id.cmp(&b.id)));
        Ok(patterns)
    }

    fn tenant_versions(&self, tenant: &TenantId) -> Result<Vec<RuleVersion>, RepositoryError> {
        let mut versions: Vec<RuleVersion> = Self::decode_all(self.versions.scan_prefix(tenant_prefix(tenant)))?;
        versions.reverse();
        Ok(versions)
    }
}

fn tenant_prefix(tenant: &TenantId) -> Vec<u8> {
    let mut key = tenant.as_str().as_bytes().to_vec();
    key.push(SEPARATOR);
    key
}

fn version_key(tenant: &TenantId, version: SemanticVersion) -> Vec<u8> {
    let mut key = tenant_prefix(tenant);
    key.extend_from_slice(
        format!("{:010}.{:010}.{:010}", version.major, version.minor, version.patch).as_bytes(),
    );
    key
}

fn review_prefix(pattern_id: &PatternId) -> Vec<u8> {
    let mut key = pattern_id.as_str().as_bytes().to_vec();
    key.push(SEPARATOR);
    key
}

#[async_trait]
impl PatternRepository for SledStore {
    async fn save(&self, pattern: &CandidatePattern) -> Result<(), RepositoryError> {
        let value = serde_json::to_vec(pattern)?;
        self.patterns.insert(pattern.id.as_str().as_bytes(), value)?;
        self.flush().await
    }

    async fn find_by_id(&self, id: &PatternId) -> Result<Option<CandidatePattern>, RepositoryError> {
        match self.patterns.get(id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn find_by_status(&self, status: PatternStatus) -> Result<Vec<CandidatePattern>, RepositoryError> {
        Ok(self.all_patterns()?.into_iter().filter(|p| p.status == status).collect())
    }

    async fn find_by_tenant(&self, tenant: &TenantId) -> Result<Vec<CandidatePattern>, RepositoryError> {
        Ok(self.all_patterns()?.into_iter().filter(|p| &p.tenant_id == tenant).collect())
    }

    async fn list_all(&self) -> Result<Vec<CandidatePattern>, RepositoryError> {
        self.all_patterns()
    }
}

#[async_trait]
impl ReviewRepository for SledStore {
    async fn append(&self, record: &ReviewRecord) -> Result<(), RepositoryError> {
        let mut key = review_prefix(&record.pattern_id);
        key.extend_from_slice(format!("{:020}", self.db.generate_id()?).as_bytes());
        self.reviews.insert(key, serde_json::to_vec(record)?)?;
        self.flush().await
    }

    async fn find_by_pattern(&self, pattern_id: &PatternId) -> Result<Vec<ReviewRecord>, RepositoryError> {
        let mut records: Vec<ReviewRecord> = Self::decode_all(self.reviews.scan_prefix(review_prefix(pattern_id)))?;
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }

    async fn list_all(&self) -> Result<Vec<ReviewRecord>, RepositoryError> {
        let mut records: Vec<ReviewRecord> = Self::decode_all(self.reviews.iter())?;
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }
}

#[async_trait]
impl RuleVersionRepository for SledStore {
    async fn save(&self, version: &RuleVersion) -> Result<(), RepositoryError> {
        let key = version_key(&version.tenant_id, version.version);
        self.versions.insert(key, serde_json::to_vec(version)?)?;
        self.flush().await
    }

    async fn find(&self, tenant: &TenantId, version: SemanticVersion) -> Result<Option<RuleVersion>, RepositoryError> {
        match self.versions.get(version_key(tenant, version))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn find_by_status(&self, tenant: &TenantId, status: DeploymentStatus) -> Result<Vec<RuleVersion>, RepositoryError> {
        Ok(self.tenant_versions(tenant)?.into_iter().filter(|v| v.status == status).collect())
    }

    async fn list_by_tenant(&self, tenant: &TenantId) -> Result<Vec<RuleVersion>, RepositoryError> {
        self.tenant_versions(tenant)
    }
}
