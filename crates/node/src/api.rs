//! Admission API.
//!
//! HTTP boundary translating authenticated external calls into engine
//! operations. Handlers only validate and enqueue; provisioning and
//! decommissioning happen asynchronously, observable through
//! `GET /api/v1/reservations/{id}`.
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | POST   | `/api/v1/reservations` | submit a signed reservation |
//! | GET    | `/api/v1/reservations` | list ids, filter by twin/type |
//! | GET    | `/api/v1/reservations/{id}` | full reservation incl. result |
//! | DELETE | `/api/v1/reservations/{id}` | signed decommission request |
//! | GET    | `/api/v1/counters` | capacity ledger snapshot |
//! | GET    | `/api/v1/health` | daemon liveness |

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use weft_common::time::now_unix;
use weft_common::{Reservation, TwinId, WorkloadType};
use weft_engine::auth::verify_delete;
use weft_engine::{Admitted, AuthError, CreateError, DeleteError, EngineHandle};
use weft_store::StoreError;

/// Shared application state.
pub struct ApiState {
    pub handle: EngineHandle,
    pub node_id: String,
    pub start_time: u64,
}

/// Body of a DELETE request: who asks, and their signature over the
/// delete challenge for this reservation id.
#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub twin_id: TwinId,
    pub signature: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub twin: Option<TwinId>,
    #[serde(rename = "type")]
    pub workload_type: Option<WorkloadType>,
}

/// GET /api/v1/health response
#[derive(Debug, Serialize)]
pub struct HealthResp {
    pub healthy: bool,
    pub node_id: String,
    pub version: String,
    pub uptime_secs: u64,
}

pub fn build_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route(
            "/api/v1/reservations",
            axum::routing::post(submit).get(list),
        )
        .route(
            "/api/v1/reservations/{id}",
            get(get_reservation).delete(delete_reservation),
        )
        .route("/api/v1/counters", get(counters))
        .route("/api/v1/health", get(health))
        .with_state(state)
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn submit(
    State(state): State<Arc<ApiState>>,
    Json(reservation): Json<Reservation>,
) -> Response {
    let id = reservation.id.clone();
    match state.handle.create(reservation) {
        Ok(admitted) => {
            let status = match admitted {
                Admitted::Queued => "queued",
                Admitted::Duplicate => "duplicate",
                Admitted::CapacityExhausted => "capacity_exhausted",
            };
            debug!(%id, status, "submission accepted");
            (
                StatusCode::ACCEPTED,
                Json(json!({ "id": id, "status": status })),
            )
                .into_response()
        }
        Err(CreateError::Validation(message)) => error(StatusCode::BAD_REQUEST, message),
        Err(CreateError::Auth(err)) => auth_error(err),
        Err(err @ CreateError::Terminal(_)) => error(StatusCode::CONFLICT, err.to_string()),
        Err(CreateError::Store(err)) => {
            error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn get_reservation(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Response {
    match state.handle.get(&id) {
        Ok(reservation) => Json(reservation).into_response(),
        Err(StoreError::NotFound(_)) => error(StatusCode::NOT_FOUND, format!("{id} not found")),
        Err(err) => error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn list(State(state): State<Arc<ApiState>>, Query(query): Query<ListQuery>) -> Response {
    let ids = match (query.twin, query.workload_type) {
        (Some(twin), workload_type) => state.handle.list_by_twin(twin, workload_type),
        (None, Some(workload_type)) => state.handle.list_by_type(workload_type),
        (None, None) => state.handle.list_all(),
    };
    // a record removed between listing and reading is simply omitted
    let reservations: Vec<Reservation> = ids
        .iter()
        .filter_map(|id| state.handle.get(id).ok())
        .collect();
    Json(reservations).into_response()
}

async fn delete_reservation(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(request): Json<DeleteRequest>,
) -> Response {
    let reservation = match state.handle.get(&id) {
        Ok(r) => r,
        Err(StoreError::NotFound(_)) => {
            return error(StatusCode::NOT_FOUND, format!("{id} not found"))
        }
        Err(err) => return error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };

    if let Err(err) = verify_delete(
        state.handle.twins().as_ref(),
        state.handle.admins().as_ref(),
        &id,
        reservation.twin_id,
        request.twin_id,
        &request.signature,
    ) {
        return auth_error(err);
    }

    match state.handle.delete(&id) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({ "id": id, "status": "deleting" })),
        )
            .into_response(),
        Err(DeleteError::NotFound(_)) => error(StatusCode::NOT_FOUND, format!("{id} not found")),
        Err(DeleteError::Store(err)) => {
            error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn counters(State(state): State<Arc<ApiState>>) -> Response {
    Json(state.handle.counters()).into_response()
}

async fn health(State(state): State<Arc<ApiState>>) -> Response {
    Json(HealthResp {
        healthy: true,
        node_id: state.node_id.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: now_unix().saturating_sub(state.start_time),
    })
    .into_response()
}

fn auth_error(err: AuthError) -> Response {
    match err {
        AuthError::Unauthorized { .. } => error(StatusCode::FORBIDDEN, err.to_string()),
        AuthError::Unauthenticated(_) | AuthError::BadSignature { .. } => {
            error(StatusCode::UNAUTHORIZED, err.to_string())
        }
    }
}
