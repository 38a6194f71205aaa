// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// HTTP API
//
// Thin axum layer over the application services: active rules for the
// detection layer, the review queue for humans, deployment controls, metric
// reports and on-demand escalation. Handlers only translate; every rule lives
// in the application layer.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::error;

use crate::application::approval_workflow::{ApprovalError, ApprovalWorkflow, PendingFilter};
use crate::application::escalation::EscalationAgent;
use crate::application::rule_version_manager::{RolloutError, RuleVersionManager};
use crate::domain::escalation::{EscalationContext, EscalationKind};
use crate::domain::pattern::PatternId;
use crate::domain::review::ReviewAction;
use crate::domain::rule_version::{PerformanceMetrics, SemanticVersion};
use crate::domain::tenant::TenantId;
use crate::infrastructure::metrics_store::InMemoryMetricsStore;

pub struct AppState {
    pub workflow: Arc<ApprovalWorkflow>,
    pub versions: Arc<RuleVersionManager>,
    pub escalation: Arc<EscalationAgent>,
    pub metrics: Arc<InMemoryMetricsStore>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/tenants/{tenant}/rules", get(active_rules))
        .route("/v1/tenants/{tenant}/versions", get(list_versions).post(create_version))
        .route("/v1/tenants/{tenant}/versions/{version}/canary", post(deploy_canary))
        .route("/v1/tenants/{tenant}/versions/{version}/promote", post(promote))
        .route("/v1/tenants/{tenant}/versions/{version}/metrics", post(report_metrics))
        .route("/v1/tenants/{tenant}/rollback", post(rollback))
        .route("/v1/reviews/pending", get(pending_reviews))
        .route("/v1/reviews/{pattern_id}", post(review_pattern))
        .route("/v1/reviews/{pattern_id}/history", get(review_history))
        .route("/v1/escalations", post(escalate))
        .with_state(Arc::new(state))
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Validation(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => {
                error!("Internal API error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<ApprovalError> for ApiError {
    fn from(err: ApprovalError) -> Self {
        match err {
            ApprovalError::NotFound(_) => ApiError::NotFound(err.to_string()),
            ApprovalError::AlreadyResolved { .. }
            | ApprovalError::NotPending { .. }
            | ApprovalError::DuplicateApproval { .. } => ApiError::Conflict(err.to_string()),
            ApprovalError::InvalidReviewer(_) => ApiError::Validation(err.to_string()),
            ApprovalError::Repository(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<RolloutError> for ApiError {
    fn from(err: RolloutError) -> Self {
        match err {
            RolloutError::VersionNotFound { .. } => ApiError::NotFound(err.to_string()),
            RolloutError::InvalidPercentage(_)
            | RolloutError::PercentageDecrease { .. }
            | RolloutError::InvalidPattern { .. }
            | RolloutError::InvalidMetrics(_)
            | RolloutError::NotNewerThanStable { .. } => ApiError::Validation(err.to_string()),
            RolloutError::InvalidTransition(_) | RolloutError::CanaryAlreadyActive { .. } => {
                ApiError::Conflict(err.to_string())
            }
            RolloutError::Integrity(_) | RolloutError::Repository(_) => ApiError::Internal(err.to_string()),
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn parse_version(raw: &str) -> Result<SemanticVersion, ApiError> {
    raw.parse().map_err(|e| ApiError::Validation(format!("{e}")))
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let breaker = state.escalation.breaker().snapshot();
    Json(json!({
        "status": "ok",
        "reasoning_circuit": breaker.state,
        "open_cycles": breaker.open_cycles,
    }))
}

async fn active_rules(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
) -> ApiResult<serde_json::Value> {
    let tenant = TenantId::new(tenant);
    state.versions.warm(&tenant).await?;
    Ok(Json(json!({
        "tenant": tenant,
        "active": state.versions.active_versions(&tenant),
        "rules": state.versions.active_rule_set(&tenant).as_ref(),
    })))
}

async fn list_versions(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
) -> ApiResult<serde_json::Value> {
    let versions = state.versions.list_versions(&TenantId::new(tenant)).await?;
    Ok(Json(json!({ "versions": versions })))
}

#[derive(Debug, Deserialize)]
pub struct CreateVersionRequest {
    pub author: String,
    #[serde(default)]
    pub changelog: String,
}

/// Build a new pending version from every approved pattern of the tenant.
async fn create_version(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
    Json(req): Json<CreateVersionRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let tenant = TenantId::new(tenant);
    let approved = state.workflow.approved_patterns(&tenant).await?;
    let version = state
        .versions
        .create_version(&tenant, &approved, &req.author, &req.changelog)
        .await?;
    Ok((StatusCode::CREATED, Json(json!(version))))
}

#[derive(Debug, Deserialize)]
pub struct CanaryRequest {
    pub percentage: Option<u8>,
}

/// Deploys a pending version, or expands it if it is already the canary.
async fn deploy_canary(
    State(state): State<Arc<AppState>>,
    Path((tenant, version)): Path<(String, String)>,
    Json(req): Json<CanaryRequest>,
) -> ApiResult<serde_json::Value> {
    let tenant = TenantId::new(tenant);
    let version = parse_version(&version)?;
    let percentage = req
        .percentage
        .unwrap_or(state.versions.config().default_canary_percentage);

    let current = state.versions.current_canary(&tenant).await?;
    let deployed = if current.as_ref().is_some_and(|c| c.version == version) {
        state.versions.expand_canary(&tenant, version, percentage).await?
    } else {
        state.versions.deploy_canary(&tenant, version, percentage).await?
    };
    Ok(Json(json!(deployed)))
}

async fn promote(
    State(state): State<Arc<AppState>>,
    Path((tenant, version)): Path<(String, String)>,
) -> ApiResult<serde_json::Value> {
    let version = parse_version(&version)?;
    let promoted = state.versions.promote_to_stable(&TenantId::new(tenant), version).await?;
    Ok(Json(json!(promoted)))
}

async fn report_metrics(
    State(state): State<Arc<AppState>>,
    Path((tenant, version)): Path<(String, String)>,
    Json(metrics): Json<PerformanceMetrics>,
) -> Result<StatusCode, ApiError> {
    let version = parse_version(&version)?;
    metrics.validate().map_err(ApiError::Validation)?;
    state.metrics.report(TenantId::new(tenant), version, metrics);
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub reason: String,
}

async fn rollback(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
    Json(req): Json<RollbackRequest>,
) -> ApiResult<serde_json::Value> {
    let restored = state.versions.rollback(&TenantId::new(tenant), &req.reason).await?;
    Ok(Json(json!({ "restored": restored })))
}

async fn pending_reviews(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<PendingFilter>,
) -> ApiResult<serde_json::Value> {
    let items = state.workflow.list_pending(&filter).await?;
    Ok(Json(json!({ "count": items.len(), "items": items })))
}

#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    pub reviewer: String,
    pub action: ReviewAction,
    #[serde(default)]
    pub notes: Option<String>,
}

async fn review_pattern(
    State(state): State<Arc<AppState>>,
    Path(pattern_id): Path<String>,
    Json(req): Json<ReviewRequest>,
) -> ApiResult<serde_json::Value> {
    let outcome = state
        .workflow
        .review(&PatternId::from(pattern_id), &req.reviewer, req.action, req.notes)
        .await?;
    Ok(Json(json!(outcome)))
}

async fn review_history(
    State(state): State<Arc<AppState>>,
    Path(pattern_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let records = state.workflow.history(&PatternId::from(pattern_id)).await?;
    Ok(Json(json!({ "records": records })))
}

#[derive(Debug, Deserialize)]
pub struct EscalationRequest {
    pub kind: EscalationKind,
    pub context: EscalationContext,
}

async fn escalate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EscalationRequest>,
) -> impl IntoResponse {
    Json(state.escalation.analyze(req.kind, &req.context).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::gateway_config::{ApprovalConfig, EscalationConfig, RolloutConfig};
    use crate::domain::pattern::{CandidatePattern, LogPartition, PatternKind, PatternSource};
    use crate::infrastructure::cache::InMemoryCache;
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::repositories::Repositories;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use tower::ServiceExt;

    struct Harness {
        router: Router,
        workflow: Arc<ApprovalWorkflow>,
    }

    fn harness() -> Harness {
        let repos = Repositories::in_memory();
        let bus = Arc::new(EventBus::with_default_capacity());
        let workflow = Arc::new(ApprovalWorkflow::new(
            repos.patterns.clone(),
            repos.reviews.clone(),
            bus.clone(),
            ApprovalConfig::default(),
        ));
        let versions = Arc::new(RuleVersionManager::new(repos.versions.clone(), bus, RolloutConfig::default()));
        let escalation = Arc::new(EscalationAgent::new(
            None,
            Arc::new(InMemoryCache::new(8)),
            EscalationConfig::default(),
        ));
        let router = app(AppState {
            workflow: workflow.clone(),
            versions,
            escalation,
            metrics: Arc::new(InMemoryMetricsStore::new()),
        });
        Harness { router, workflow }
    }

    async fn call(router: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn queue_pattern(workflow: &ApprovalWorkflow, value: &str) -> PatternId {
        let pattern = CandidatePattern::new(
            TenantId::new("acme"),
            PatternKind::AttackVariant,
            value,
            PatternSource::NgramMined { n: 3, partition: LogPartition::BlockedInjection },
            0.8,
            4,
            Utc::now(),
        );
        let id = pattern.id.clone();
        workflow.submit(pattern, None, None).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness();
        let (status, body) = call(&h.router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["reasoning_circuit"], "closed");
    }

    #[tokio::test]
    async fn test_review_flow_to_active_rules() {
        let h = harness();
        let id = queue_pattern(&h.workflow, r"(?i)reveal\s+secrets").await;

        let (status, body) = call(&h.router, "GET", "/v1/reviews/pending?tenant=acme&min_confidence=0.5", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);

        let (status, body) = call(
            &h.router,
            "POST",
            &format!("/v1/reviews/{id}"),
            Some(json!({ "reviewer": "alice", "action": "approve" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pattern"]["status"], "approved");

        let (status, _) = call(
            &h.router,
            "POST",
            &format!("/v1/reviews/{id}"),
            Some(json!({ "reviewer": "bob", "action": "approve" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, version) = call(&h.router, "POST", "/v1/tenants/acme/versions", Some(json!({ "author": "alice" }))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(version["version"], "0.0.1");

        let (status, _) = call(&h.router, "POST", "/v1/tenants/acme/versions/0.0.1/canary", Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&h.router, "POST", "/v1/tenants/acme/versions/0.0.1/promote", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, rules) = call(&h.router, "GET", "/v1/tenants/acme/rules", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(rules["active"]["stable"], "0.0.1");
        assert_eq!(rules["rules"]["injection_patterns"][0], r"(?i)reveal\s+secrets");
    }

    #[tokio::test]
    async fn test_errors_map_to_status_codes() {
        let h = harness();
        let (status, _) = call(
            &h.router,
            "POST",
            "/v1/reviews/unknown",
            Some(json!({ "reviewer": "alice", "action": "approve" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&h.router, "POST", "/v1/tenants/acme/versions/not-a-version/promote", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &h.router,
            "POST",
            "/v1/tenants/acme/versions/0.0.1/metrics",
            Some(json!({ "detection_rate": 2.0, "false_positive_rate": 0.0, "mean_latency_ms": 1.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&h.router, "POST", "/v1/tenants/acme/rollback", Some(json!({ "reason": "manual" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["restored"].is_null());
    }

    #[tokio::test]
    async fn test_escalation_endpoint_falls_back_without_provider() {
        let h = harness();
        let ctx = EscalationContext::new(TenantId::new("acme"), "s-1", "hello");
        let (status, body) = call(
            &h.router,
            "POST",
            "/v1/escalations",
            Some(json!({ "kind": "input_intent", "context": ctx })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["fallback_used"], true);
    }
}
