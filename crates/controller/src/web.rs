use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::db::{Db, WateringEvent};
use crate::dispatcher::{ControllerStatus, Dispatcher};
use crate::error::ControllerError;
use crate::state::{SharedState, SystemEvent};
use crate::zone::Overrides;

const DEFAULT_HISTORY_LIMIT: i64 = 20;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub events: SharedState,
    pub db: Option<Db>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct StatusResponse {
    uptime_secs: u64,
    mqtt_connected: bool,
    #[serde(flatten)]
    entities: ControllerStatus,
    events: Vec<SystemEvent>,
}

struct ApiError(ControllerError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            ControllerError::UnknownZone(_) | ControllerError::UnknownProgram(_) => StatusCode::NOT_FOUND,
            ControllerError::InvalidOverride { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<ControllerError> for ApiError {
    fn from(e: ControllerError) -> Self {
        Self(e)
    }
}

fn accepted(detail: String) -> Response {
    (StatusCode::ACCEPTED, Json(json!({ "accepted": detail }))).into_response()
}

// ---------------------------------------------------------------------------
// Query parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct ProgramRunQuery {
    #[serde(default)]
    skip_predicate: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ZoneRunQuery {
    water: Option<u32>,
    wait: Option<u32>,
    repeat: Option<u32>,
    #[serde(default)]
    skip_predicate: bool,
}

#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/programs/{id}/run", post(run_program))
        .route("/api/programs/{id}/refresh", post(refresh_program))
        .route("/api/zones/{id}/run", post(run_zone))
        .route("/api/zones/{id}/history", get(zone_history))
        .route("/api/stop", post(stop_all))
        .with_state(state)
}

async fn api_status(State(app): State<AppState>) -> Json<StatusResponse> {
    let entities = app.dispatcher.status();
    let st = app.events.read().await;
    Json(StatusResponse {
        uptime_secs: st.uptime_secs(),
        mqtt_connected: st.mqtt_connected,
        entities,
        events: st.recent_events(),
    })
}

async fn run_program(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<ProgramRunQuery>,
) -> Result<Response, ApiError> {
    app.dispatcher.run_program(&id, q.skip_predicate).await?;
    Ok(accepted(format!("run_program {id}")))
}

async fn refresh_program(State(app): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    app.dispatcher.refresh_program(&id).await?;
    Ok(accepted(format!("refresh_program {id}")))
}

async fn run_zone(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<ZoneRunQuery>,
) -> Result<Response, ApiError> {
    let overrides = Overrides {
        water: q.water,
        wait: q.wait,
        repeat: q.repeat,
    };
    app.dispatcher
        .run_zone(&id, overrides, q.skip_predicate)
        .await?;
    Ok(accepted(format!("run_zone {id}")))
}

async fn stop_all(State(app): State<AppState>) -> Response {
    app.dispatcher.stop_all().await;
    accepted("stop_all".to_string())
}

async fn zone_history(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<WateringEvent>>, Response> {
    app.dispatcher
        .registry()
        .zone(&id)
        .map_err(|e| ApiError(e).into_response())?;

    let Some(db) = &app.db else {
        return Ok(Json(Vec::new()));
    };
    let limit = q.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 500);
    db.recent_watering_events(&id, limit)
        .await
        .map(Json)
        .map_err(|e| {
            error!(zone = %id, "history query failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response()
        })
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!("web api listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
