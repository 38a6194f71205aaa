// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Reasoning Provider Infrastructure - Anti-Corruption Layer Implementations
//
// Each adapter translates between the domain `LLMProvider` interface and one
// vendor API. The factory builds exactly one provider at startup from
// `ReasoningConfig`.

pub mod openai;
pub mod ollama;
pub mod anthropic;
pub mod factory;

pub use factory::build_provider;

use crate::domain::llm::LLMError;
use reqwest::StatusCode;

/// Maps a non-success HTTP status to the domain error.
pub(crate) fn status_error(status: StatusCode, body: String, model: &str) -> LLMError {
    match status.as_u16() {
        401 | 403 => LLMError::Authentication(body),
        429 => LLMError::RateLimit,
        404 => LLMError::ModelNotFound(model.to_string()),
        _ => LLMError::Provider(format!("HTTP {}: {}", status, body)),
    }
}
