// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Warden Core
//!
//! Adaptive decision core of the Warden AI-agent security gateway. Turns
//! risk-scored interaction logs into reviewed, versioned rule sets and provides a
//! breaker-guarded secondary-opinion path for inconclusive requests.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Crate root wiring the domain, application, infrastructure and
//!   presentation layers

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
