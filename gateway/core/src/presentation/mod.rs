// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`warden-core`)
//!
//! HTTP surface translating requests into application service calls. No
//! business logic lives here.
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`api`] | HTTP (Axum) | Active rules, review queue, deployment controls, escalation |

pub mod api;
