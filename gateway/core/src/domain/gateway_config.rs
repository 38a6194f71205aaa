// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Gateway Configuration Types
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) configuring:
// - pattern discovery windows and thresholds
// - approval gate (auto-approval, dual control)
// - rollout (canary defaults, rollback thresholds, canary monitor)
// - escalation (reasoning provider, timeout, cache, circuit breaker)
// - threat feeds, storage backend, HTTP API and observability

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::circuit_breaker::CircuitBreakerConfig;
use crate::domain::repository::StorageBackend;
use crate::domain::tenant::TenantId;
use crate::domain::threat_intel::Severity;

pub const API_VERSION: &str = "warden.dev/v1";
pub const KIND: &str = "GatewayConfig";

/// Provider types accepted in `escalation.reasoning.provider`.
pub const REASONING_PROVIDERS: &[&str] = &["openai", "openai-compatible", "ollama", "anthropic"];

/// Top-level gateway configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfigManifest {
    /// API version (must be "warden.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "GatewayConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: GatewayConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable gateway name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfigSpec {
    /// Tenants the background workers run for
    #[serde(default = "default_tenants")]
    pub tenants: Vec<TenantId>,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub approval: ApprovalConfig,

    #[serde(default)]
    pub rollout: RolloutConfig,

    #[serde(default)]
    pub escalation: EscalationConfig,

    #[serde(default)]
    pub threat_feeds: ThreatFeedsConfig,

    #[serde(default)]
    pub storage: StorageBackend,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for GatewayConfigSpec {
    fn default() -> Self {
        Self {
            tenants: default_tenants(),
            discovery: DiscoveryConfig::default(),
            approval: ApprovalConfig::default(),
            rollout: RolloutConfig::default(),
            escalation: EscalationConfig::default(),
            threat_feeds: ThreatFeedsConfig::default(),
            storage: StorageBackend::default(),
            network: NetworkConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Inclusive n-gram length range in words
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NgramRange {
    pub min: usize,
    pub max: usize,
}

impl NgramRange {
    pub const fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often the scheduler runs a discovery cycle
    #[serde(default = "default_discovery_interval", with = "humantime_serde")]
    pub interval: Duration,

    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u32,

    /// Window size used when paging the log store
    #[serde(default = "default_fetch_window_hours")]
    pub fetch_window_hours: u32,

    #[serde(default = "default_min_occurrences")]
    pub min_occurrences: u64,

    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Minimum share of a partition an n-gram must appear in (never fewer than 2 inputs)
    #[serde(default = "default_min_partition_share")]
    pub min_partition_share: f64,

    #[serde(default = "default_attack_ngram")]
    pub attack_ngram: NgramRange,

    #[serde(default = "default_false_positive_ngram")]
    pub false_positive_ngram: NgramRange,

    /// Drop n-grams fully explained by a longer surviving phrase
    #[serde(default)]
    pub prune_subsumed: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_discovery_interval(),
            lookback_hours: default_lookback_hours(),
            fetch_window_hours: default_fetch_window_hours(),
            min_occurrences: default_min_occurrences(),
            min_confidence: default_min_confidence(),
            min_partition_share: default_min_partition_share(),
            attack_ngram: default_attack_ngram(),
            false_positive_ngram: default_false_positive_ngram(),
            prune_subsumed: false,
        }
    }
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.lookback_hours == 0 {
            return Err("discovery.lookback_hours must be positive".into());
        }
        if self.fetch_window_hours == 0 {
            return Err("discovery.fetch_window_hours must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(format!("discovery.min_confidence {} outside [0, 1]", self.min_confidence));
        }
        if !(0.0..=1.0).contains(&self.min_partition_share) {
            return Err(format!(
                "discovery.min_partition_share {} outside [0, 1]",
                self.min_partition_share
            ));
        }
        for (name, range) in [("attack_ngram", self.attack_ngram), ("false_positive_ngram", self.false_positive_ngram)] {
            if range.min == 0 || range.min > range.max {
                return Err(format!("discovery.{name} must satisfy 1 <= min <= max"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default)]
    pub auto_approve: bool,

    #[serde(default = "default_auto_approve_threshold")]
    pub auto_approve_threshold: f64,

    /// Distinct APPROVE records needed before a pattern is approved
    #[serde(default = "default_required_approvals")]
    pub required_approvals: u32,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            auto_approve: false,
            auto_approve_threshold: default_auto_approve_threshold(),
            required_approvals: default_required_approvals(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackThresholds {
    /// Canary FP rate above `baseline * ratio` triggers rollback
    #[serde(default = "default_fp_ratio")]
    pub false_positive_ratio: f64,

    /// Canary latency above `baseline + delta` triggers rollback
    #[serde(default = "default_latency_delta_ms")]
    pub latency_delta_ms: f64,

    /// Canary detection below `baseline - drop` triggers rollback
    #[serde(default = "default_detection_drop")]
    pub detection_drop: f64,
}

impl Default for RollbackThresholds {
    fn default() -> Self {
        Self {
            false_positive_ratio: default_fp_ratio(),
            latency_delta_ms: default_latency_delta_ms(),
            detection_drop: default_detection_drop(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryMonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_monitor_interval", with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for CanaryMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_monitor_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutConfig {
    #[serde(default = "default_canary_percentage")]
    pub default_canary_percentage: u8,

    /// Versions kept in the hot index per tenant
    #[serde(default = "default_history_depth")]
    pub history_depth: usize,

    #[serde(default)]
    pub thresholds: RollbackThresholds,

    #[serde(default)]
    pub monitor: CanaryMonitorConfig,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            default_canary_percentage: default_canary_percentage(),
            history_depth: default_history_depth(),
            thresholds: RollbackThresholds::default(),
            monitor: CanaryMonitorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    /// "openai", "openai-compatible", "ollama" or "anthropic"
    pub provider: String,

    pub endpoint: String,

    /// API key (supports "env:VAR_NAME" for environment variables)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationCacheConfig {
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

impl Default for EscalationCacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_cache_ttl(),
            capacity: default_cache_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Primary scores in [low, high] are inconclusive and escalated
    #[serde(default = "default_inconclusive_low")]
    pub inconclusive_low: f64,

    #[serde(default = "default_inconclusive_high")]
    pub inconclusive_high: f64,

    /// Hard limit on one reasoning call
    #[serde(default = "default_escalation_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default)]
    pub cache: EscalationCacheConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Without a provider every escalation takes the rule-based path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningConfig>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            inconclusive_low: default_inconclusive_low(),
            inconclusive_high: default_inconclusive_high(),
            timeout: default_escalation_timeout(),
            cache: EscalationCacheConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            reasoning: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatFeedConfig {
    pub id: String,

    /// JSON endpoint returning an array of indicators
    pub url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatFeedsConfig {
    /// Indicators below this confidence never become candidates
    #[serde(default = "default_feed_min_confidence")]
    pub min_confidence: f64,

    #[serde(default = "default_feed_min_severity")]
    pub min_severity: Severity,

    #[serde(default)]
    pub feeds: Vec<ThreatFeedConfig>,
}

impl Default for ThreatFeedsConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_feed_min_confidence(),
            min_severity: default_feed_min_severity(),
            feeds: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Prometheus exporter port
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_tenants() -> Vec<TenantId> {
    vec![TenantId::default()]
}

fn default_discovery_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_lookback_hours() -> u32 {
    24
}

fn default_fetch_window_hours() -> u32 {
    6
}

fn default_min_occurrences() -> u64 {
    3
}

fn default_min_confidence() -> f64 {
    0.5
}

fn default_min_partition_share() -> f64 {
    0.1
}

fn default_attack_ngram() -> NgramRange {
    NgramRange::new(3, 8)
}

fn default_false_positive_ngram() -> NgramRange {
    NgramRange::new(2, 5)
}

fn default_auto_approve_threshold() -> f64 {
    0.95
}

fn default_required_approvals() -> u32 {
    1
}

fn default_fp_ratio() -> f64 {
    1.5
}

fn default_latency_delta_ms() -> f64 {
    50.0
}

fn default_detection_drop() -> f64 {
    0.05
}

fn default_monitor_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_canary_percentage() -> u8 {
    10
}

fn default_history_depth() -> usize {
    50
}

fn default_temperature() -> f32 {
    0.0
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_cache_capacity() -> usize {
    10_000
}

fn default_inconclusive_low() -> f64 {
    0.3
}

fn default_inconclusive_high() -> f64 {
    0.7
}

fn default_escalation_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_feed_min_confidence() -> f64 {
    0.6
}

fn default_feed_min_severity() -> Severity {
    Severity::Medium
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_port() -> u16 {
    9091
}

impl Default for GatewayConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "warden-gateway".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: GatewayConfigSpec::default(),
        }
    }
}

impl GatewayConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. WARDEN_CONFIG_PATH environment variable
    /// 2. ./warden-config.yaml (working directory)
    /// 3. ~/.warden/config.yaml (user home)
    /// 4. /etc/warden/config.yaml (system, Unix) or C:\ProgramData\Warden\config.yaml (Windows)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("WARDEN_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./warden-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".warden").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/warden/config.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\Warden\\config.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // An explicit path must exist and parse
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("WARDEN_AUTO_APPROVE") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => {
                    tracing::info!("Environment override: WARDEN_AUTO_APPROVE=true");
                    self.spec.approval.auto_approve = true;
                }
                "false" | "0" | "no" | "off" => {
                    tracing::info!("Environment override: WARDEN_AUTO_APPROVE=false");
                    self.spec.approval.auto_approve = false;
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for WARDEN_AUTO_APPROVE: '{}'. Expected true/false. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Some(val) = lookup("WARDEN_ESCALATION_TIMEOUT_MS") {
            match val.parse::<u64>() {
                Ok(ms) if ms > 0 => {
                    tracing::info!("Environment override: WARDEN_ESCALATION_TIMEOUT_MS={}", ms);
                    self.spec.escalation.timeout = Duration::from_millis(ms);
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for WARDEN_ESCALATION_TIMEOUT_MS: '{}'. Expected positive integer. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!("Invalid apiVersion: '{}'. Must be '{}'", self.api_version, API_VERSION);
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let spec = &self.spec;
        if spec.tenants.is_empty() {
            anyhow::bail!("spec.tenants must list at least one tenant");
        }
        if spec.tenants.iter().any(|t| t.as_str().is_empty()) {
            anyhow::bail!("spec.tenants cannot contain an empty tenant id");
        }

        spec.discovery.validate().map_err(|e| anyhow::anyhow!(e))?;

        let approval = &spec.approval;
        if !(0.0..=1.0).contains(&approval.auto_approve_threshold) {
            anyhow::bail!(
                "approval.auto_approve_threshold {} outside [0, 1]",
                approval.auto_approve_threshold
            );
        }
        if approval.required_approvals == 0 {
            anyhow::bail!("approval.required_approvals must be at least 1");
        }

        let rollout = &spec.rollout;
        if rollout.default_canary_percentage == 0 || rollout.default_canary_percentage > 100 {
            anyhow::bail!(
                "rollout.default_canary_percentage {} must be within 1-100",
                rollout.default_canary_percentage
            );
        }
        if rollout.history_depth == 0 {
            anyhow::bail!("rollout.history_depth must be positive");
        }
        if rollout.thresholds.false_positive_ratio < 1.0 {
            anyhow::bail!("rollout.thresholds.false_positive_ratio must be >= 1.0");
        }

        let escalation = &spec.escalation;
        if !(0.0..=1.0).contains(&escalation.inconclusive_low)
            || !(0.0..=1.0).contains(&escalation.inconclusive_high)
            || escalation.inconclusive_low > escalation.inconclusive_high
        {
            anyhow::bail!("escalation inconclusive band must satisfy 0 <= low <= high <= 1");
        }
        if escalation.timeout.is_zero() {
            anyhow::bail!("escalation.timeout must be positive");
        }
        if escalation.circuit_breaker.failure_threshold == 0 || escalation.circuit_breaker.success_threshold == 0 {
            anyhow::bail!("escalation.circuit_breaker thresholds must be positive");
        }
        if let Some(reasoning) = &escalation.reasoning {
            if !REASONING_PROVIDERS.contains(&reasoning.provider.as_str()) {
                anyhow::bail!(
                    "Unsupported reasoning provider '{}'. Expected one of: {}",
                    reasoning.provider,
                    REASONING_PROVIDERS.join(", ")
                );
            }
            if reasoning.endpoint.is_empty() {
                anyhow::bail!("escalation.reasoning.endpoint cannot be empty");
            }
            if reasoning.model.is_empty() {
                anyhow::bail!("escalation.reasoning.model cannot be empty");
            }
        }

        let mut feed_ids = HashSet::new();
        for feed in &spec.threat_feeds.feeds {
            if feed.id.is_empty() || feed.url.is_empty() {
                anyhow::bail!("threat feed id and url cannot be empty");
            }
            if !feed_ids.insert(feed.id.as_str()) {
                anyhow::bail!("Duplicate threat feed id: {}", feed.id);
            }
        }

        if let StorageBackend::Sled(sled) = &spec.storage {
            if sled.path.as_os_str().is_empty() {
                anyhow::bail!("storage.path cannot be empty for the sled backend");
            }
        }

        Ok(())
    }
}
