// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `warden serve`: HTTP API plus the two background workers.
//!
//! Startup order matters: review snapshots are repaired from the review log
//! and each tenant's rule versions are loaded before the API accepts traffic.

use anyhow::{Context, Result};
use clap::Args;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use warden_core::application::approval_workflow::ApprovalWorkflow;
use warden_core::application::canary_monitor::CanaryMonitor;
use warden_core::application::discovery_scheduler::DiscoveryScheduler;
use warden_core::application::escalation::EscalationAgent;
use warden_core::application::pattern_discovery::PatternDiscoverer;
use warden_core::application::rule_version_manager::RuleVersionManager;
use warden_core::application::threat_fusion::ThreatFusion;
use warden_core::domain::gateway_config::GatewayConfigManifest;
use warden_core::domain::threat_intel::ThreatFeed;
use warden_core::infrastructure::audit_log_file::load_jsonl;
use warden_core::infrastructure::cache::InMemoryCache;
use warden_core::infrastructure::event_bus::{EventBus, EventBusError};
use warden_core::infrastructure::llm::build_provider;
use warden_core::infrastructure::metrics_store::InMemoryMetricsStore;
use warden_core::infrastructure::repositories::{InMemoryAuditLogStore, Repositories};
use warden_core::infrastructure::threat_feed::HttpThreatFeed;
use warden_core::presentation::api::{app, AppState};

#[derive(Args)]
pub struct ServeArgs {
    /// Override network.port
    #[arg(long, env = "WARDEN_PORT")]
    port: Option<u16>,

    /// Override network.bind_address
    #[arg(long, env = "WARDEN_HOST")]
    host: Option<String>,

    /// JSON-lines audit log the discovery scheduler mines
    #[arg(long, value_name = "FILE")]
    audit_log: Option<PathBuf>,
}

pub async fn run(args: ServeArgs, config_path: Option<PathBuf>) -> Result<()> {
    let mut manifest = GatewayConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        manifest.spec.network.port = port;
    }
    if let Some(host) = args.host {
        manifest.spec.network.bind_address = host;
    }
    manifest.validate().context("Configuration validation failed")?;
    let spec = manifest.spec;

    info!(name = %manifest.metadata.name, tenants = spec.tenants.len(), "Starting Warden gateway core");

    if spec.observability.metrics.enabled {
        let addr: SocketAddr = ([0, 0, 0, 0], spec.observability.metrics.port).into();
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(%addr, "Prometheus exporter listening");
    }

    let repos = Repositories::from_backend(&spec.storage).context("Failed to open storage backend")?;
    let event_bus = Arc::new(EventBus::with_default_capacity());

    let workflow = Arc::new(ApprovalWorkflow::new(
        repos.patterns.clone(),
        repos.reviews.clone(),
        event_bus.clone(),
        spec.approval.clone(),
    ));
    let repaired = workflow.rebuild().await.context("Failed to replay review log")?;
    if repaired > 0 {
        warn!(repaired, "Repaired pattern snapshots from the review log");
    }

    let versions = Arc::new(RuleVersionManager::new(
        repos.versions.clone(),
        event_bus.clone(),
        spec.rollout.clone(),
    ));
    for tenant in &spec.tenants {
        versions
            .warm(tenant)
            .await
            .with_context(|| format!("Failed to load rule versions for tenant {tenant}"))?;
    }

    let provider = match &spec.escalation.reasoning {
        Some(reasoning) if spec.escalation.enabled => Some(build_provider(reasoning)?),
        _ => {
            info!("No reasoning provider configured, escalations use rule-based analysis");
            None
        }
    };
    let escalation = Arc::new(
        EscalationAgent::new(
            provider,
            Arc::new(InMemoryCache::new(spec.escalation.cache.capacity)),
            spec.escalation.clone(),
        )
        .with_event_bus(event_bus.clone()),
    );

    let feeds: Vec<Arc<dyn ThreatFeed>> = spec
        .threat_feeds
        .feeds
        .iter()
        .map(|feed| Arc::new(HttpThreatFeed::from_config(feed)) as Arc<dyn ThreatFeed>)
        .collect();
    let fusion = Arc::new(ThreatFusion::new(feeds, spec.threat_feeds.clone()));

    let audit_log = match &args.audit_log {
        Some(path) => load_jsonl(path).with_context(|| format!("Failed to load audit log {}", path.display()))?,
        None => InMemoryAuditLogStore::new(),
    };
    let metrics = Arc::new(InMemoryMetricsStore::new());

    let shutdown = CancellationToken::new();
    let discoverer = PatternDiscoverer::new(spec.discovery.clone()).context("Invalid discovery configuration")?;
    let scheduler = Arc::new(
        DiscoveryScheduler::new(discoverer, Arc::new(audit_log), workflow.clone(), spec.tenants.clone())
            .with_threat_fusion(fusion)
            .with_shutdown_token(shutdown.clone()),
    );
    let monitor = Arc::new(
        CanaryMonitor::new(versions.clone(), metrics.clone(), spec.tenants.clone(), spec.rollout.monitor.clone())
            .with_shutdown_token(shutdown.clone()),
    );
    let workers = [
        scheduler.start(),
        monitor.start(),
        spawn_event_log(&event_bus, shutdown.clone()),
    ];

    let router = app(AppState {
        workflow,
        versions,
        escalation,
        metrics,
    });
    let addr = format!("{}:{}", spec.network.bind_address, spec.network.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("API listening on {}", addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await
        .context("HTTP server failed")?;

    shutdown.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    info!("Warden gateway core stopped");
    Ok(())
}

/// Log every gateway event as a one-line alert until shutdown.
fn spawn_event_log(event_bus: &EventBus, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    let mut events = event_bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => info!(target: "warden::events", "{}", event.summary()),
                    Err(EventBusError::Lagged(_)) => continue,
                    Err(_) => break,
                },
                _ = shutdown.cancelled() => break,
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
