use std::sync::Arc;
use std::time::Duration;

use axum::error_handling::HandleErrorLayer;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::handler::Handler;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower::timeout::TimeoutLayer;
use tower::{BoxError, ServiceBuilder};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::events::{BusError, Event, EventBus};
use crate::flag::{normalize_service_name, Flag};
use crate::store::{Store, StoreError};

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const SAVE_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_SAVE_TIMEOUT: Duration = Duration::from_secs(12);

#[derive(Clone)]
struct ApiState {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
}

/// Builds the flag API router mounted at `base_path`.
///
/// Successful saves and deletes publish the corresponding event to the bus;
/// the initial save does not publish and answers with the merged flag set
/// instead.
pub fn router(base_path: &str, store: Arc<dyn Store>, bus: Arc<dyn EventBus>) -> Router {
    let state = ApiState { store, bus };

    // The timeout layer fails with a BoxError, so every route stacks an
    // error handler ahead of it to turn the failure into a response.
    let flags = Router::new()
        .route(
            "/",
            get(list_all_flags.layer(
                ServiceBuilder::new()
                    .layer(HandleErrorLayer::new(handle_timeout_error))
                    .layer(TimeoutLayer::new(READ_TIMEOUT)),
            )),
        )
        .route(
            "/{service}",
            get(list_flags.layer(
                ServiceBuilder::new()
                    .layer(HandleErrorLayer::new(handle_timeout_error))
                    .layer(TimeoutLayer::new(READ_TIMEOUT)),
            ))
            .post(save_flags.layer(
                ServiceBuilder::new()
                    .layer(HandleErrorLayer::new(handle_timeout_error))
                    .layer(TimeoutLayer::new(SAVE_TIMEOUT)),
            ))
            .delete(delete_flags.layer(
                ServiceBuilder::new()
                    .layer(HandleErrorLayer::new(handle_timeout_error))
                    .layer(TimeoutLayer::new(SAVE_TIMEOUT)),
            )),
        )
        .route(
            "/{service}/initial",
            post(save_initial_flags.layer(
                ServiceBuilder::new()
                    .layer(HandleErrorLayer::new(handle_timeout_error))
                    .layer(TimeoutLayer::new(INITIAL_SAVE_TIMEOUT)),
            )),
        )
        .with_state(state);

    Router::new()
        .nest(base_path, flags)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

async fn handle_timeout_error(err: BoxError) -> (StatusCode, String) {
    if err.is::<tower::timeout::error::Elapsed>() {
        (StatusCode::REQUEST_TIMEOUT, "request timed out".to_string())
    } else {
        error!("request middleware failed: {err}");
        (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("{0}")]
    InvalidInput(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(_) | ApiError::Bus(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("request failed: {self}");
        }
        (status, self.to_string()).into_response()
    }
}

async fn list_all_flags(State(state): State<ApiState>) -> Result<Json<Vec<Flag>>, ApiError> {
    Ok(Json(state.store.get("").await?))
}

async fn list_flags(
    State(state): State<ApiState>,
    Path(service): Path<String>,
) -> Result<Json<Vec<Flag>>, ApiError> {
    Ok(Json(state.store.get(&normalize_service_name(&service)).await?))
}

async fn save_flags(
    State(state): State<ApiState>,
    Path(service): Path<String>,
    payload: Result<Json<Vec<Flag>>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let flags = validated_flags(&service, payload)?;

    state.store.save(&flags, false).await?;
    state.bus.send(&Event::save(flags)).await?;

    Ok(StatusCode::NO_CONTENT)
}

async fn delete_flags(
    State(state): State<ApiState>,
    Path(service): Path<String>,
    payload: Result<Json<Vec<Flag>>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let flags = validated_flags(&service, payload)?;

    state.store.delete(&flags).await?;
    state.bus.send(&Event::delete(flags)).await?;

    Ok(StatusCode::NO_CONTENT)
}

async fn save_initial_flags(
    State(state): State<ApiState>,
    Path(service): Path<String>,
    payload: Result<Json<Vec<Flag>>, JsonRejection>,
) -> Result<Json<Vec<Flag>>, ApiError> {
    let flags = validated_flags(&service, payload)?;

    state.store.save(&flags, true).await?;
    Ok(Json(state.store.get(&normalize_service_name(&service)).await?))
}

/// Decodes and checks a write body: non-empty, every flag normalized, every
/// flag owned by the addressed service or global, every condition valid.
fn validated_flags(
    service: &str,
    payload: Result<Json<Vec<Flag>>, JsonRejection>,
) -> Result<Vec<Flag>, ApiError> {
    let Json(flags) = payload.map_err(|rejection| ApiError::InvalidInput(rejection.body_text()))?;
    if flags.is_empty() {
        return Err(ApiError::InvalidInput("no flags given".to_string()));
    }

    let service = normalize_service_name(service);
    flags
        .into_iter()
        .map(|flag| {
            let flag = flag.normalized();
            if !flag.service_name.is_empty() && flag.service_name != service {
                return Err(ApiError::InvalidInput(format!("invalid flag: {flag}")));
            }
            flag.condition
                .validate()
                .map_err(|err| ApiError::InvalidInput(format!("invalid flag {flag}: {err}")))?;
            Ok(flag)
        })
        .collect()
}
