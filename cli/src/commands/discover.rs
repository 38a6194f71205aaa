// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! One-off pattern discovery over a JSON-lines audit log export.
//!
//! Nothing is submitted for review; candidates are printed so an operator can
//! tune discovery thresholds before turning the scheduler on.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use warden_core::application::pattern_discovery::PatternDiscoverer;
use warden_core::domain::gateway_config::GatewayConfigManifest;
use warden_core::domain::pattern::CandidatePattern;
use warden_core::domain::tenant::TenantId;
use warden_core::infrastructure::audit_log_file::parse_jsonl;
use warden_core::infrastructure::repositories::InMemoryAuditLogStore;

#[derive(Args)]
pub struct DiscoverArgs {
    /// JSON-lines file, one audit record per line
    #[arg(long, value_name = "FILE")]
    logs: PathBuf,

    /// Tenant whose records are mined
    #[arg(long, default_value = TenantId::DEFAULT)]
    tenant: String,

    /// End of the lookback window, RFC 3339 (default: newest record in the file)
    #[arg(long, value_name = "TIMESTAMP")]
    now: Option<DateTime<Utc>>,

    /// Override discovery.lookback_hours
    #[arg(long)]
    lookback_hours: Option<u32>,

    /// Print candidates as a JSON array
    #[arg(long)]
    json: bool,
}

pub async fn run(args: DiscoverArgs, config_path: Option<PathBuf>) -> Result<()> {
    let manifest = GatewayConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    let mut config = manifest.spec.discovery;
    if let Some(hours) = args.lookback_hours {
        config.lookback_hours = hours;
    }
    let discoverer = PatternDiscoverer::new(config).context("Invalid discovery configuration")?;

    let file = std::fs::File::open(&args.logs).with_context(|| format!("Failed to open {}", args.logs.display()))?;
    let records = parse_jsonl(file).with_context(|| format!("Failed to parse {}", args.logs.display()))?;

    let tenant = TenantId::new(args.tenant);
    let Some(now) = args.now.or_else(|| {
        records
            .iter()
            .filter(|r| r.tenant_id == tenant)
            .map(|r| r.timestamp)
            .max()
    }) else {
        anyhow::bail!("{} holds no records for tenant {}", args.logs.display(), tenant);
    };

    let source = InMemoryAuditLogStore::with_records(records);
    let candidates = discoverer
        .discover_from_source(&source, &tenant, now, &CancellationToken::new())
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&candidates)?);
    } else {
        print_table(&tenant, now, &candidates);
    }
    Ok(())
}

fn print_table(tenant: &TenantId, now: DateTime<Utc>, candidates: &[CandidatePattern]) {
    println!(
        "{} {} candidate(s) for tenant {} (window ending {})",
        "Discovered".bold(),
        candidates.len(),
        tenant,
        now.to_rfc3339()
    );
    for candidate in candidates {
        println!();
        println!(
            "  {} {}  confidence {:.3}, {} occurrence(s)",
            candidate.kind.to_string().cyan(),
            candidate.value.bold(),
            candidate.confidence,
            candidate.occurrence_count
        );
        for example in candidate.example_inputs.iter().take(3) {
            println!("    {} {}", "e.g.".dimmed(), example);
        }
    }
}
