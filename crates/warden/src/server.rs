//! HTTP server for change events and fleet administration.
//!
//! Provides REST API endpoints for:
//! - Health checks
//! - Receiving change events (single event or array)
//! - Listing, removing and reconciling managed resources
//!
//! Resource ids are ARNs and must be percent-encoded in paths.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::outcome::Trigger;
use crate::scheduler::{JobOutcome, Scheduler};
use crate::trigger::ChangeEvent;

/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Server state shared across handlers.
#[derive(Debug)]
pub struct ServerState {
    /// Scheduler running the jobs
    pub scheduler: Arc<Scheduler>,
    /// Queue feeding the event trigger
    pub events: mpsc::Sender<ChangeEvent>,
}

/// Build the HTTP router.
pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/events", post(events_handler))
        .route("/api/resources", get(list_resources_handler))
        .route("/api/resources/{id}", delete(remove_resource_handler))
        .route("/api/resources/{id}/reconcile", post(reconcile_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server and serve until `shutdown` fires.
///
/// # Errors
///
/// Returns an error if the server fails to start or bind to the address.
pub async fn run_server(
    state: Arc<ServerState>,
    addr: &str,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Warden listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}

// ============================================================================
// Request/Response types
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    resources: usize,
    in_flight: usize,
}

/// One event or a batch.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EventBatch {
    Many(Vec<ChangeEvent>),
    One(ChangeEvent),
}

/// Response to an event delivery.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventsResponse {
    /// Events queued for the trigger
    pub accepted: usize,
    /// Events dropped because the queue was full
    pub dropped: usize,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    status: &'static str,
    resource_id: String,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        resources: state.scheduler.fleet().len().await,
        in_flight: state.scheduler.registry().len(),
    })
}

async fn events_handler(
    State(state): State<Arc<ServerState>>,
    Json(batch): Json<EventBatch>,
) -> Response {
    let events = match batch {
        EventBatch::Many(events) => events,
        EventBatch::One(event) => vec![event],
    };

    let mut response = EventsResponse {
        accepted: 0,
        dropped: 0,
    };
    for event in events {
        match state.events.try_send(event) {
            Ok(()) => response.accepted += 1,
            Err(TrySendError::Full(event)) => {
                warn!(resource_id = %event.resource_arn, "Event queue full, dropping event");
                response.dropped += 1;
            }
            Err(TrySendError::Closed(_)) => {
                return (StatusCode::SERVICE_UNAVAILABLE, "event trigger stopped").into_response();
            }
        }
    }

    (StatusCode::ACCEPTED, Json(response)).into_response()
}

async fn list_resources_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.scheduler.fleet().snapshot().await)
}

async fn remove_resource_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Response {
    match state.scheduler.fleet().remove(&id).await {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => not_found(id),
    }
}

async fn reconcile_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Response {
    match state.scheduler.run_one(&id, Trigger::Manual).await {
        JobOutcome::Completed(record) => Json(record).into_response(),
        JobOutcome::Coalesced => (
            StatusCode::ACCEPTED,
            Json(MessageResponse {
                status: "coalesced",
                resource_id: id,
            }),
        )
            .into_response(),
        JobOutcome::Unmanaged => not_found(id),
    }
}

fn not_found(resource_id: String) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(MessageResponse {
            status: "not_managed",
            resource_id,
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::Fleet;
    use crate::outcome::{OutcomeRecord, OutcomeSink, OutcomeStatus};
    use crate::policy::{Policy, PolicySet};
    use crate::scheduler::SchedulerSettings;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;
    use warden_cloud::memory::InMemoryProvider;
    use warden_cloud::{ObservedState, ResourceKind, ResourceRef};

    fn state(capacity: usize) -> (Arc<ServerState>, mpsc::Receiver<ChangeEvent>) {
        let provider = Arc::new(InMemoryProvider::new().with_resource("alb-1", ObservedState::new()));
        let fleet = Arc::new(Fleet::from_refs([ResourceRef::new(
            "alb-1",
            ResourceKind::ApplicationLoadBalancer,
        )]));
        let policies = PolicySet::new([Policy::web_acl(
            ResourceKind::ApplicationLoadBalancer,
            "waf-default",
        )])
        .unwrap();
        let scheduler = Arc::new(Scheduler::new(
            fleet,
            Arc::new(policies),
            provider,
            Arc::new(OutcomeSink::disabled()),
            &SchedulerSettings::default(),
        ));
        let (tx, rx) = mpsc::channel(capacity);
        (
            Arc::new(ServerState {
                scheduler,
                events: tx,
            }),
            rx,
        )
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = to_bytes(response.into_body(), MAX_BODY_BYTES).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _rx) = state(4);
        let response = build_router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["resources"], 1);
    }

    #[tokio::test]
    async fn test_events_are_queued() {
        let (state, mut rx) = state(4);
        let response = build_router(state)
            .oneshot(post_json(
                "/events",
                r#"[{"eventName":"DisassociateWebACL","resourceArn":"alb-1"},
                    {"detail":{"eventName":"AssociateWebACL","requestParameters":{"resourceArn":"alb-1"}}}]"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body: EventsResponse = body_json(response).await;
        assert_eq!(body, EventsResponse { accepted: 2, dropped: 0 });
        assert_eq!(rx.recv().await.unwrap().event_name, "DisassociateWebACL");
        assert_eq!(rx.recv().await.unwrap().event_name, "AssociateWebACL");
    }

    #[tokio::test]
    async fn test_full_queue_drops_events() {
        let (state, _rx) = state(1);
        let response = build_router(state)
            .oneshot(post_json(
                "/events",
                r#"[{"eventName":"DisassociateWebACL","resourceArn":"alb-1"},
                    {"eventName":"DisassociateWebACL","resourceArn":"alb-1"}]"#,
            ))
            .await
            .unwrap();

        let body: EventsResponse = body_json(response).await;
        assert_eq!(body, EventsResponse { accepted: 1, dropped: 1 });
    }

    #[tokio::test]
    async fn test_malformed_event_is_rejected() {
        let (state, _rx) = state(4);
        let response = build_router(state)
            .oneshot(post_json("/events", r#"{"eventName":"DisassociateWebACL"}"#))
            .await
            .unwrap();

        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_manual_reconcile() {
        let (state, _rx) = state(4);
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(post_json("/api/resources/alb-1/reconcile", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let record: OutcomeRecord = body_json(response).await;
        assert_eq!(record.status, OutcomeStatus::Remediated);
        assert_eq!(record.trigger, Trigger::Manual);

        let response = app
            .oneshot(post_json("/api/resources/alb-9/reconcile", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_remove_and_list_resources() {
        let (state, _rx) = state(4);
        let app = build_router(Arc::clone(&state));

        let response = app
            .clone()
            .oneshot(
                Request::delete("/api/resources/alb-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(Request::get("/api/resources").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let resources: serde_json::Value = body_json(response).await;
        assert_eq!(resources, serde_json::json!([]));
        assert!(state.scheduler.fleet().is_empty().await);
    }
}
