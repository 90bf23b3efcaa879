//! HTTP endpoints for health checks, event and notification lookups, and
//! follow-change intake.

use std::{future::Future, net::SocketAddr};

use anyhow::Result;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{
    bus::Publisher,
    event::EventId,
    filter::FilterSet,
    follow_change::FollowChangeBatch,
    storage::{QueryItem, Store},
};

#[derive(Clone)]
struct HttpState {
    store: Store,
    follow_changes: Publisher<FollowChangeBatch>,
}

/// Response body for the `/healthz` endpoint.
#[derive(Serialize, Deserialize)]
struct Health {
    /// Always "ok" when the server is running.
    status: String,
}

/// Start the HTTP server on `addr`.
pub async fn serve_http(
    addr: SocketAddr,
    store: Store,
    follow_changes: Publisher<FollowChangeBatch>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http listening");
    axum::serve(listener, router(store, follow_changes).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn router(store: Store, follow_changes: Publisher<FollowChangeBatch>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/events", get(events))
        .route("/notifications/:event_id", get(notifications))
        .route("/follow-changes", post(follow_changes_intake))
        .with_state(HttpState {
            store,
            follow_changes,
        })
}

async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

fn bad_request(msg: impl ToString) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": msg.to_string() }))).into_response()
}

#[derive(Deserialize)]
struct EventsParams {
    /// JSON filter object or array of filter objects.
    filters: Option<String>,
}

/// Stream matching events as NDJSON.
///
/// Every line is an event, or `{"error": ..}` for an event that could not be
/// read. The last line is always `{"eose":true}`.
///
/// Example: `/events?filters=[{"kinds":[1],"limit":10}]`
async fn events(State(state): State<HttpState>, Query(params): Query<EventsParams>) -> Response {
    let raw = params.filters.unwrap_or_else(|| "[]".into());
    let val: Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => return bad_request(format!("filters: {e}")),
    };
    let filters = match FilterSet::from_value(&val) {
        Ok(f) => f,
        Err(e) => return bad_request(e),
    };

    let mut lines = Vec::new();
    for item in state.store.get_events(filters) {
        let line = match item {
            QueryItem::Event(ev) => ev.raw().to_string(),
            QueryItem::Error(e) => {
                warn!("event query item failed: {e:#}");
                json!({ "error": format!("{e:#}") }).to_string()
            }
            QueryItem::EndOfStoredEvents => json!({ "eose": true }).to_string(),
        };
        lines.push(line);
    }
    let mut body = lines.join("\n");
    body.push('\n');
    ([(header::CONTENT_TYPE, "application/x-ndjson")], Body::from(body)).into_response()
}

/// Notifications generated for one event, oldest first.
async fn notifications(State(state): State<HttpState>, Path(event_id): Path<String>) -> Response {
    let id = match EventId::from_hex(&event_id) {
        Ok(id) => id,
        Err(e) => return bad_request(e),
    };
    match state.store.get_notifications(&id) {
        Ok(list) => Json(list).into_response(),
        Err(e) => {
            warn!(event_id = %id, "error reading notifications: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "storage" }))).into_response()
        }
    }
}

/// Queue a follow-change batch for delivery.
async fn follow_changes_intake(
    State(state): State<HttpState>,
    Json(batch): Json<FollowChangeBatch>,
) -> Response {
    info!("{batch}");
    match state.follow_changes.publish(batch).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            warn!("error queueing follow change: {e:#}");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}
