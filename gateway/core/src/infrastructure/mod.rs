// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod audit_log_file;
pub mod cache;
pub mod event_bus;
pub mod llm;
pub mod metrics_store;
pub mod repositories;
pub mod threat_feed;
