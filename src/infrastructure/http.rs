//! Operational HTTP surface.
//!
//! `/health` and `/health/graph` for probes, plus the inbound agent
//! message endpoint. Auth failures of any kind answer an undifferentiated
//! 401 with an empty body.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;

use crate::domain::errors::CoreError;
use crate::domain::models::{AgentId, NewNotification, NotificationKind};
use crate::domain::ports::GraphStore;
use crate::services::cancel::CancelToken;
use crate::services::delegation::DelegationMessage;

use super::signing::MessageVerifier;

/// Inbound per-sender message budget.
pub const INBOUND_MESSAGE_LIMIT_PER_HOUR: u32 = 600;

#[derive(Clone)]
pub struct AppState {
    pub graph: Arc<dyn GraphStore>,
    pub verifier: Arc<MessageVerifier>,
    pub gateway_token: Arc<str>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/graph", get(health_graph))
        .route("/agent/{agent_id}/message", post(agent_message))
        .with_state(state)
}

/// Bind and serve until the token fires.
pub async fn serve(state: AppState, bind: &str, cancel: CancelToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "http surface listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn health(State(state): State<AppState>) -> Response {
    let graph_dep = match state.graph.ping().await {
        Ok(()) => "ok",
        Err(CoreError::Degraded(_)) => "degraded",
        Err(_) => "error",
    };
    let status = if graph_dep == "ok" { "ok" } else { "degraded" };
    Json(json!({
        "status": status,
        "deps": { "graph": graph_dep, "gateway": "configured" },
    }))
    .into_response()
}

async fn health_graph(State(state): State<AppState>) -> Response {
    match state.graph.node_counts().await {
        Ok(counts) => Json(json!({ "status": "ok", "counts": counts })).into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "error": err.to_string() })),
        )
            .into_response(),
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn agent_message(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Unknown recipient is a routing error, not an auth failure.
    let Some(target) = AgentId::from_str(&agent_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let bearer_ok = header(&headers, "authorization")
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == state.gateway_token.as_ref());
    if !bearer_ok {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let (Some(sender), Some(timestamp), Some(nonce), Some(signature)) = (
        header(&headers, "x-agent-id"),
        header(&headers, "x-timestamp").and_then(|v| v.parse::<i64>().ok()),
        header(&headers, "x-nonce"),
        header(&headers, "x-signature"),
    ) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let path = format!("/agent/{agent_id}/message");
    let sender = match state
        .verifier
        .verify(sender, timestamp, nonce, signature, "POST", &path, &body)
        .await
    {
        Ok(agent) => agent,
        // All integrity failures are indistinguishable to the caller.
        Err(_) => return StatusCode::UNAUTHORIZED.into_response(),
    };

    match state
        .graph
        .check_rate_limit(sender, "message", INBOUND_MESSAGE_LIMIT_PER_HOUR)
        .await
    {
        Ok(decision) if decision.is_allowed() => {}
        Ok(_) => return StatusCode::TOO_MANY_REQUESTS.into_response(),
        Err(_) => return StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }

    let Ok(message) = serde_json::from_slice::<DelegationMessage>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let note = NewNotification::new(
        target,
        NotificationKind::Info,
        format!(
            "delegation received: {} from {}",
            message.task_type.as_str(),
            message.delegated_by
        ),
    )
    .with_task(message.task_id);

    match state.graph.publish_notification(note).await {
        Ok(_) => (StatusCode::ACCEPTED, Json(json!({ "task_id": message.task_id })))
            .into_response(),
        Err(CoreError::Degraded(_)) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Err(err) => {
            tracing::error!(error = %err, "failed to record inbound delegation");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}
