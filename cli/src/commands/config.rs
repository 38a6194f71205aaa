// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use warden_core::domain::gateway_config::GatewayConfigManifest;
use warden_core::domain::repository::StorageBackend;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the effective manifest as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate a configuration file with every default spelled out
    Generate {
        /// Output path
        #[arg(short, long, default_value = "./warden-config.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate { output, force } => generate(output, force),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = GatewayConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        match &config_override {
            Some(path) => println!("  1. --config flag: {}", path.display()),
            None => println!("  1. --config flag: {}", "(not set)".dimmed()),
        }
        println!(
            "  2. WARDEN_CONFIG_PATH: {}",
            std::env::var("WARDEN_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./warden-config.yaml");
        println!("  4. ~/.warden/config.yaml");
        println!("  5. /etc/warden/config.yaml");
        println!();
    }

    if as_yaml {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!("  Name: {}", config.metadata.name);
    println!(
        "  Tenants: {}",
        spec.tenants.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(", ")
    );
    println!();

    println!("{}", "Discovery:".bold());
    println!("  Enabled: {}", spec.discovery.enabled);
    println!("  Interval: {:?}", spec.discovery.interval);
    println!("  Lookback: {}h", spec.discovery.lookback_hours);
    println!(
        "  Thresholds: >= {} occurrences, confidence >= {}",
        spec.discovery.min_occurrences, spec.discovery.min_confidence
    );
    println!();

    println!("{}", "Approval:".bold());
    if spec.approval.auto_approve {
        println!("  Auto-approve: at confidence >= {}", spec.approval.auto_approve_threshold);
    } else {
        println!("  Auto-approve: {}", "off".dimmed());
    }
    println!("  Required approvals: {}", spec.approval.required_approvals);
    println!();

    println!("{}", "Rollout:".bold());
    println!("  Default canary: {}%", spec.rollout.default_canary_percentage);
    println!(
        "  Rollback when FP > {}x, latency > +{}ms, detection < -{}",
        spec.rollout.thresholds.false_positive_ratio,
        spec.rollout.thresholds.latency_delta_ms,
        spec.rollout.thresholds.detection_drop
    );
    println!(
        "  Canary monitor: {} every {:?}",
        if spec.rollout.monitor.enabled { "on" } else { "off" },
        spec.rollout.monitor.interval
    );
    println!();

    println!("{}", "Escalation:".bold());
    println!(
        "  Inconclusive band: [{}, {}]",
        spec.escalation.inconclusive_low, spec.escalation.inconclusive_high
    );
    match &spec.escalation.reasoning {
        Some(reasoning) => println!("  Reasoning: {} ({}) at {}", reasoning.provider, reasoning.model, reasoning.endpoint),
        None => println!("  Reasoning: {}", "rule-based fallback only".dimmed()),
    }
    println!(
        "  Breaker: opens after {} failures, cooldown {:?}",
        spec.escalation.circuit_breaker.failure_threshold, spec.escalation.circuit_breaker.cooldown
    );
    println!();

    println!("{}", "Threat feeds:".bold());
    if spec.threat_feeds.feeds.is_empty() {
        println!("  {}", "(none)".dimmed());
    }
    for feed in &spec.threat_feeds.feeds {
        let state = if feed.enabled { "enabled".green() } else { "disabled".dimmed() };
        println!("  {} {} [{}]", feed.id.bold(), feed.url, state);
    }
    println!();

    println!("{}", "Storage:".bold());
    match &spec.storage {
        StorageBackend::InMemory => println!("  Backend: in-memory"),
        StorageBackend::Sled(sled) => println!("  Backend: sled at {}", sled.path.display()),
    }
    println!("  API: {}:{}", spec.network.bind_address, spec.network.port);

    Ok(())
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = GatewayConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;

    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

fn generate(output: PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }

    GatewayConfigManifest::default()
        .to_yaml_file(&output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!("{}", format!("✓ Configuration generated: {}", output.display()).green());

    Ok(())
}
