// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Reasoning Provider Factory
//
// Builds the single reasoning provider from `ReasoningConfig` at startup. A
// misconfigured provider is a startup error, never a per-request one.

use crate::domain::gateway_config::ReasoningConfig;
use crate::domain::llm::{GenerationOptions, LLMProvider};
use std::sync::Arc;
use tracing::info;

use super::anthropic::{AnthropicAdapter, DEFAULT_ENDPOINT as ANTHROPIC_ENDPOINT};
use super::ollama::OllamaAdapter;
use super::openai::OpenAIAdapter;

pub fn build_provider(config: &ReasoningConfig) -> anyhow::Result<Arc<dyn LLMProvider>> {
    let api_key = resolve_api_key(&config.api_key)?;

    info!(
        provider = %config.provider,
        model = %config.model,
        endpoint = %config.endpoint,
        "Initializing reasoning provider"
    );

    let provider: Arc<dyn LLMProvider> = match config.provider.as_str() {
        "openai" => {
            if api_key.is_empty() {
                anyhow::bail!("openai provider requires an api_key");
            }
            Arc::new(OpenAIAdapter::new(config.endpoint.clone(), api_key, config.model.clone()))
        }
        "openai-compatible" => Arc::new(OpenAIAdapter::with_label(
            config.endpoint.clone(),
            api_key,
            config.model.clone(),
            "openai-compatible",
        )),
        "ollama" => Arc::new(OllamaAdapter::new(config.endpoint.clone(), config.model.clone())),
        "anthropic" => {
            if api_key.is_empty() {
                anyhow::bail!("anthropic provider requires an api_key");
            }
            let endpoint = if config.endpoint.is_empty() {
                ANTHROPIC_ENDPOINT.to_string()
            } else {
                config.endpoint.clone()
            };
            Arc::new(AnthropicAdapter::new(endpoint, api_key, config.model.clone()))
        }
        other => anyhow::bail!("Unsupported provider type: {}", other),
    };

    Ok(provider)
}

/// Generation options derived from the provider config.
pub fn generation_options(config: &ReasoningConfig) -> GenerationOptions {
    GenerationOptions {
        max_tokens: Some(config.max_tokens),
        temperature: Some(config.temperature),
        ..GenerationOptions::default()
    }
}

/// Resolve API key from config (supports "env:VAR_NAME" syntax)
fn resolve_api_key(key: &Option<String>) -> anyhow::Result<String> {
    match key.as_deref() {
        Some(k) => match k.strip_prefix("env:") {
            Some(var_name) => std::env::var(var_name)
                .map_err(|_| anyhow::anyhow!("Environment variable not set: {}", var_name)),
            None => Ok(k.to_string()),
        },
        // Local providers run without auth
        None => Ok(String::new()),
    }
}
