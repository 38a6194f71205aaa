// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// JSON-lines audit log reader
//
// One `AuditLogRecord` per line; blank lines are skipped. Parse failures name
// the offending line so an operator can fix the export.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tracing::debug;

use crate::domain::audit_log::AuditLogRecord;
use crate::domain::repository::RepositoryError;

use super::repositories::InMemoryAuditLogStore;

pub fn parse_jsonl<R: Read>(reader: R) -> Result<Vec<AuditLogRecord>, RepositoryError> {
    let mut records = Vec::new();
    for (index, line) in BufReader::new(reader).lines().enumerate() {
        let line = line.map_err(|e| RepositoryError::Database(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: AuditLogRecord = serde_json::from_str(&line)
            .map_err(|e| RepositoryError::Serialization(format!("line {}: {}", index + 1, e)))?;
        records.push(record);
    }
    Ok(records)
}

/// Loads a JSON-lines export into an in-memory log store.
pub fn load_jsonl(path: impl AsRef<Path>) -> Result<InMemoryAuditLogStore, RepositoryError> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .map_err(|e| RepositoryError::NotFound(format!("{}: {}", path.display(), e)))?;
    let records = parse_jsonl(file)?;
    debug!(path = %path.display(), count = records.len(), "Loaded audit log");
    Ok(InMemoryAuditLogStore::with_records(records))
}
