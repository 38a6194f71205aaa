// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts for each aggregate, defined here and implemented in
//! `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `PatternRepository` | `CandidatePattern` | `InMemoryPatternRepository`, `SledStore` |
//! | `ReviewRepository` | `ReviewRecord` (append-only) | `InMemoryReviewRepository`, `SledStore` |
//! | `RuleVersionRepository` | `RuleVersion` | `InMemoryRuleVersionRepository`, `SledStore` |
//! | `AuditLogSource` | `AuditLogRecord` (read-only) | `InMemoryAuditLogStore` |
//!
//! ## Storage Backend Abstraction
//!
//! The backend is chosen at startup from the `storage` section of the gateway
//! config. In-memory for development and tests; sled for a durable single-node
//! deployment. Every write is durable before the call returns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::audit_log::AuditLogRecord;
use crate::domain::pattern::{CandidatePattern, PatternId, PatternStatus};
use crate::domain::review::ReviewRecord;
use crate::domain::rule_version::{DeploymentStatus, RuleVersion, SemanticVersion};
use crate::domain::tenant::TenantId;

/// Storage backend enum for pluggable persistence
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    InMemory,
    Sled(SledConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SledConfig {
    pub path: PathBuf,
}

#[async_trait]
pub trait PatternRepository: Send + Sync {
    /// Save pattern (create or update)
    async fn save(&self, pattern: &CandidatePattern) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: &PatternId) -> Result<Option<CandidatePattern>, RepositoryError>;

    async fn find_by_status(&self, status: PatternStatus) -> Result<Vec<CandidatePattern>, RepositoryError>;

    async fn find_by_tenant(&self, tenant: &TenantId) -> Result<Vec<CandidatePattern>, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<CandidatePattern>, RepositoryError>;
}

#[async_trait]
pub trait ReviewRepository: Send + Sync {
    /// Append a record. Records are never updated or removed.
    async fn append(&self, record: &ReviewRecord) -> Result<(), RepositoryError>;

    /// Records for one pattern in timestamp order
    async fn find_by_pattern(&self, pattern_id: &PatternId) -> Result<Vec<ReviewRecord>, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<ReviewRecord>, RepositoryError>;
}

#[async_trait]
pub trait RuleVersionRepository: Send + Sync {
    /// Save version (create or update)
    async fn save(&self, version: &RuleVersion) -> Result<(), RepositoryError>;

    async fn find(&self, tenant: &TenantId, version: SemanticVersion) -> Result<Option<RuleVersion>, RepositoryError>;

    async fn find_by_status(&self, tenant: &TenantId, status: DeploymentStatus) -> Result<Vec<RuleVersion>, RepositoryError>;

    /// All versions of a tenant, highest version first
    async fn list_by_tenant(&self, tenant: &TenantId) -> Result<Vec<RuleVersion>, RepositoryError>;
}

/// Read side of the detection layer's audit log.
#[async_trait]
pub trait AuditLogSource: Send + Sync {
    /// Records for `tenant` with `since <= timestamp <= until`, oldest first
    async fn fetch(
        &self,
        tenant: &TenantId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<AuditLogRecord>, RepositoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<sled::Error> for RepositoryError {
    fn from(err: sled::Error) -> Self {
        RepositoryError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
