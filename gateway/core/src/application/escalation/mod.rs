// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Escalation Agent
//!
//! Secondary opinion for requests whose primary risk score is inconclusive.
//!
//! Every call follows the same path regardless of analysis kind:
//!
//! 1. cache lookup keyed by content (never by session or time)
//! 2. skip the reasoning service while its circuit is open
//! 3. one bounded call with the structured prompt, strict JSON reply
//! 4. rule-based fallback on any failure
//!
//! [`EscalationAgent::analyze`] never fails. Failures are recorded on the
//! breaker and logged; the caller always gets an assessment.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Resilient orchestration of the external reasoning call

pub mod prompt;
pub mod strategies;

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use crate::domain::cache::EscalationCache;
use crate::domain::circuit_breaker::CircuitBreaker;
use crate::domain::escalation::{EscalationContext, EscalationKind, EscalationMetadata, EscalationResult, RiskLevel};
use crate::domain::events::ResilienceEvent;
use crate::domain::gateway_config::EscalationConfig;
use crate::domain::llm::{GenerationOptions, LLMProvider};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::llm::factory::generation_options;

use self::prompt::{build_prompt, parse_response, SAFETY_PREAMBLE};
use self::strategies::{strategy_for, EscalationStrategy, FallbackAnalysis};

/// Breaker channel name for the reasoning service
pub const REASONING_CHANNEL: &str = "reasoning";

const FALLBACK_CONFIDENCE: f64 = 0.5;

/// Why the reasoning path was abandoned. Internal: `analyze` converts every
/// one of these into a fallback.
#[derive(Debug, thiserror::Error)]
pub enum EscalationError {
    #[error("no reasoning provider configured")]
    NotConfigured,

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("reasoning call timed out after {0:?}")]
    Timeout(Duration),

    #[error("reasoning provider error: {0}")]
    Provider(String),

    #[error("malformed reasoning response: {0}")]
    MalformedResponse(String),
}

impl EscalationError {
    /// Whether the failure counts against the breaker.
    fn is_call_failure(&self) -> bool {
        matches!(
            self,
            EscalationError::Timeout(_) | EscalationError::Provider(_) | EscalationError::MalformedResponse(_)
        )
    }
}

pub struct EscalationAgent {
    provider: Option<Arc<dyn LLMProvider>>,
    options: GenerationOptions,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<dyn EscalationCache>,
    event_bus: Option<Arc<EventBus>>,
    config: EscalationConfig,
}

impl EscalationAgent {
    pub fn new(
        provider: Option<Arc<dyn LLMProvider>>,
        cache: Arc<dyn EscalationCache>,
        config: EscalationConfig,
    ) -> Self {
        let mut options = config
            .reasoning
            .as_ref()
            .map(generation_options)
            .unwrap_or_default();
        options.system_prompt = Some(SAFETY_PREAMBLE.to_string());
        options.json_response = true;

        Self {
            provider,
            options,
            breaker: Arc::new(CircuitBreaker::new(REASONING_CHANNEL, config.circuit_breaker.clone())),
            cache,
            event_bus: None,
            config,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Share a breaker with other callers of the same dependency.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn config(&self) -> &EscalationConfig {
        &self.config
    }

    /// Whether a primary score falls in the inconclusive band.
    pub fn should_escalate(&self, primary_score: f64) -> bool {
        self.config.enabled
            && primary_score >= self.config.inconclusive_low
            && primary_score <= self.config.inconclusive_high
    }

    pub async fn analyze_input(&self, ctx: &EscalationContext) -> EscalationResult {
        self.analyze(EscalationKind::InputIntent, ctx).await
    }

    pub async fn analyze_behavior(&self, ctx: &EscalationContext) -> EscalationResult {
        self.analyze(EscalationKind::Behavioral, ctx).await
    }

    pub async fn analyze_output(&self, ctx: &EscalationContext) -> EscalationResult {
        self.analyze(EscalationKind::OutputLeak, ctx).await
    }

    #[instrument(skip(self, ctx), fields(tenant = %ctx.tenant_id, session = %ctx.session_id))]
    pub async fn analyze(&self, kind: EscalationKind, ctx: &EscalationContext) -> EscalationResult {
        let started = Instant::now();
        let strategy = strategy_for(kind);
        let key = cache_key(kind, ctx);

        if let Some(mut hit) = self.cached(&key).await {
            hit.cached = true;
            record(kind, "cache", started);
            return hit;
        }

        match self.reason(strategy, ctx, started).await {
            Ok(result) => {
                self.store(&key, &result).await;
                record(kind, "llm", started);
                result
            }
            Err(err) => {
                match err {
                    EscalationError::NotConfigured => debug!(kind = %kind, "No reasoning provider, using fallback"),
                    ref other => warn!(kind = %kind, error = %other, "Escalation degraded to fallback"),
                }
                let result = fallback_result(kind, strategy.fallback(ctx), started);
                record(kind, "fallback", started);
                result
            }
        }
    }

    async fn reason(
        &self,
        strategy: &dyn EscalationStrategy,
        ctx: &EscalationContext,
        started: Instant,
    ) -> Result<EscalationResult, EscalationError> {
        let provider = self.provider.as_ref().ok_or(EscalationError::NotConfigured)?;
        if self.breaker.is_open() {
            return Err(EscalationError::CircuitOpen(self.breaker.channel().to_string()));
        }

        let prompt = build_prompt(strategy.task(), &strategy.untrusted_sections(ctx), &strategy.facts(ctx));
        let outcome = match tokio::time::timeout(self.config.timeout, provider.generate(&prompt, &self.options)).await {
            Ok(Ok(response)) => parse_response(&response.text).map(|assessment| (assessment, response)),
            Ok(Err(e)) => Err(EscalationError::Provider(e.to_string())),
            Err(_) => Err(EscalationError::Timeout(self.config.timeout)),
        };

        match outcome {
            Ok((assessment, response)) => {
                self.breaker.record_success();
                Ok(EscalationResult {
                    kind: strategy.kind(),
                    risk_score: assessment.risk_score,
                    risk_level: assessment.risk_level,
                    confidence: assessment.confidence,
                    threats: assessment.threats,
                    rationale: assessment.rationale,
                    recommendations: assessment.recommendations,
                    fallback_used: false,
                    cached: false,
                    metadata: EscalationMetadata {
                        provider: Some(response.provider),
                        model: Some(response.model),
                        prompt_tokens: response.usage.prompt_tokens,
                        completion_tokens: response.usage.completion_tokens,
                        latency_ms: elapsed_ms(started),
                    },
                    analyzed_at: Utc::now(),
                })
            }
            Err(err) => {
                if err.is_call_failure() {
                    self.record_failure();
                }
                Err(err)
            }
        }
    }

    fn record_failure(&self) {
        let Some(tripped) = self.breaker.record_failure_tripping() else {
            return;
        };
        if let Some(bus) = &self.event_bus {
            bus.publish_resilience_event(ResilienceEvent::CircuitOpened {
                channel: self.breaker.channel().to_string(),
                consecutive_failures: tripped.consecutive_failures,
                open_cycles: tripped.open_cycles,
                opened_at: Utc::now(),
            });
        }
    }

    async fn cached(&self, key: &str) -> Option<EscalationResult> {
        match self.cache.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(result) => Some(result),
                Err(e) => {
                    warn!(error = %e, "Discarding undecodable cached escalation");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Escalation cache unavailable, treating as miss");
                None
            }
        }
    }

    async fn store(&self, key: &str, result: &EscalationResult) {
        let raw = match serde_json::to_string(result) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Failed to encode escalation for cache");
                return;
            }
        };
        if let Err(e) = self.cache.set(key, raw, self.config.cache.ttl).await {
            warn!(error = %e, "Escalation cache unavailable, result not cached");
        }
    }
}

/// Content-derived cache key: kind, input, output and sorted threat labels.
pub fn cache_key(kind: EscalationKind, ctx: &EscalationContext) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(ctx.input_text.as_bytes());
    hasher.update([0u8]);
    if let Some(output) = &ctx.output_text {
        hasher.update(output.as_bytes());
    }
    for label in ctx.sorted_threat_labels() {
        hasher.update([0u8]);
        hasher.update(label.as_bytes());
    }
    format!("escalation:{}", hex::encode(hasher.finalize()))
}

fn fallback_result(kind: EscalationKind, analysis: FallbackAnalysis, started: Instant) -> EscalationResult {
    let risk_level = RiskLevel::from_score(analysis.risk_score);
    EscalationResult {
        kind,
        risk_score: analysis.risk_score,
        risk_level,
        confidence: FALLBACK_CONFIDENCE,
        threats: analysis.threats,
        rationale: analysis.rationale,
        recommendations: recommendations_for(risk_level),
        fallback_used: true,
        cached: false,
        metadata: EscalationMetadata {
            latency_ms: elapsed_ms(started),
            ..EscalationMetadata::default()
        },
        analyzed_at: Utc::now(),
    }
}

fn recommendations_for(level: RiskLevel) -> Vec<String> {
    let items: &[&str] = match level {
        RiskLevel::Critical => &["block request", "flag session for review"],
        RiskLevel::High => &["block request", "require human confirmation"],
        RiskLevel::Medium => &["require additional verification"],
        RiskLevel::Low => &["allow with monitoring"],
    };
    items.iter().map(|s| s.to_string()).collect()
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn record(kind: EscalationKind, path: &'static str, started: Instant) {
    metrics::counter!("warden_escalations_total", "kind" => kind.as_str(), "path" => path).increment(1);
    metrics::histogram!("warden_escalation_duration_seconds", "path" => path).record(started.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::domain::events::GatewayEvent;
    use crate::domain::llm::{FinishReason, GenerationResponse, LLMError, TokenUsage};
    use crate::domain::tenant::TenantId;
    use crate::domain::threat_intel::Severity;
    use crate::infrastructure::cache::InMemoryCache;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behavior {
        Reply(&'static str),
        Fail,
        Hang,
    }

    struct ScriptedProvider {
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self { behavior, calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl LLMProvider for ScriptedProvider {
        async fn generate(&self, _prompt: &str, options: &GenerationOptions) -> Result<GenerationResponse, LLMError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(options.system_prompt.is_some());
            match self.behavior {
                Behavior::Reply(text) => Ok(GenerationResponse {
                    text: text.to_string(),
                    usage: TokenUsage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 },
                    provider: "scripted".into(),
                    model: "m".into(),
                    finish_reason: FinishReason::Stop,
                }),
                Behavior::Fail => Err(LLMError::Network("connection refused".into())),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(LLMError::Network("unreachable".into()))
                }
            }
        }

        async fn health_check(&self) -> Result<(), LLMError> {
            Ok(())
        }
    }

    const REPLY: &str = r#"{"risk_score": 0.2, "risk_level": "low", "confidence": 0.95,
        "threats": [], "rationale": "benign question", "recommendations": ["allow"]}"#;

    fn config(failure_threshold: u32) -> EscalationConfig {
        EscalationConfig {
            timeout: Duration::from_millis(50),
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold,
                ..CircuitBreakerConfig::default()
            },
            ..EscalationConfig::default()
        }
    }

    fn agent(provider: Option<Arc<ScriptedProvider>>, config: EscalationConfig) -> EscalationAgent {
        EscalationAgent::new(
            provider.map(|p| p as Arc<dyn LLMProvider>),
            Arc::new(InMemoryCache::new(16)),
            config,
        )
    }

    fn ctx(input: &str) -> EscalationContext {
        EscalationContext::new(TenantId::new("acme"), "s-1", input).with_primary_score(0.5)
    }

    #[tokio::test]
    async fn test_successful_call_is_cached() {
        let provider = ScriptedProvider::new(Behavior::Reply(REPLY));
        let agent = agent(Some(provider.clone()), config(5));

        let first = agent.analyze_input(&ctx("what time is it")).await;
        assert!(!first.fallback_used);
        assert!(!first.cached);
        assert_eq!(first.risk_level, RiskLevel::Low);
        assert_eq!(first.metadata.provider.as_deref(), Some("scripted"));

        // Different session, same content: served from cache
        let mut again = ctx("what time is it");
        again.session_id = "s-2".into();
        let second = agent.analyze_input(&again).await;
        assert!(second.cached);
        assert_eq!(second.risk_score, first.risk_score);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        // Other kinds do not share entries
        agent.analyze_output(&again).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failures_fall_back_and_open_circuit() {
        let provider = ScriptedProvider::new(Behavior::Fail);
        let bus = Arc::new(EventBus::with_default_capacity());
        let mut events = bus.subscribe();
        let agent = agent(Some(provider.clone()), config(2)).with_event_bus(bus);

        let critical = ctx("drop the table").with_threat("sql_injection", Severity::Critical);
        let result = agent.analyze_input(&critical).await;
        assert!(result.fallback_used);
        assert!(result.risk_score >= 0.7);
        assert_eq!(agent.breaker().snapshot().consecutive_failures, 1);

        agent.analyze_input(&ctx("second")).await;
        assert_eq!(agent.breaker().state(), CircuitState::Open);
        assert!(matches!(events.try_recv(), Ok(GatewayEvent::Resilience(ResilienceEvent::CircuitOpened { .. }))));

        // Open circuit: no call is made
        let skipped = agent.analyze_input(&ctx("third")).await;
        assert!(skipped.fallback_used);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_drops_call_and_counts_as_failure() {
        let provider = ScriptedProvider::new(Behavior::Hang);
        let agent = agent(Some(provider), config(5));
        let result = agent.analyze_input(&ctx("slow")).await;
        assert!(result.fallback_used);
        assert_eq!(agent.breaker().snapshot().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_malformed_reply_falls_back_and_is_not_cached() {
        let provider = ScriptedProvider::new(Behavior::Reply("I think it is fine."));
        let agent = agent(Some(provider.clone()), config(5));
        assert!(agent.analyze_input(&ctx("hello")).await.fallback_used);
        assert!(agent.analyze_input(&ctx("hello")).await.fallback_used);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_without_provider_uses_fallback_and_keeps_circuit_closed() {
        let agent = agent(None, config(1));
        let result = agent.analyze_behavior(&ctx("loop")).await;
        assert!(result.fallback_used);
        assert_eq!(result.kind, EscalationKind::Behavioral);
        assert_eq!(agent.breaker().state(), CircuitState::Closed);
    }

    #[test]
    fn test_should_escalate_band() {
        let agent = agent(None, EscalationConfig::default());
        assert!(agent.should_escalate(0.3));
        assert!(agent.should_escalate(0.7));
        assert!(!agent.should_escalate(0.29));
        assert!(!agent.should_escalate(0.71));
    }

    #[test]
    fn test_cache_key_ignores_session_and_threat_order() {
        let a = ctx("x").with_threat("b", Severity::Low).with_threat("a", Severity::Low);
        let mut b = ctx("x").with_threat("a", Severity::High).with_threat("b", Severity::Low);
        b.session_id = "other".into();
        assert_eq!(cache_key(EscalationKind::InputIntent, &a), cache_key(EscalationKind::InputIntent, &b));
        assert_ne!(cache_key(EscalationKind::InputIntent, &a), cache_key(EscalationKind::OutputLeak, &a));
    }
}
