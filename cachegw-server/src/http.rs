//! # HTTP Surface
//!
//! Thin axum layer over the gateway: cache reads and writes, Prometheus
//! metrics and a health check. Every handler reaches the gateway through the
//! shared `LifecycleManager`; there is no global state.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use cachegw_client::Connector;
use cachegw_common::GatewayError;

use crate::lifecycle::{LifecycleManager, LifecycleState};

/// Content type of the Prometheus text exposition format.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

pub struct AppState<C: Connector> {
    lifecycle: Arc<LifecycleManager<C>>,
    default_key: Arc<str>,
}

impl<C: Connector> Clone for AppState<C> {
    fn clone(&self) -> Self {
        AppState {
            lifecycle: self.lifecycle.clone(),
            default_key: self.default_key.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValueResponse {
    pub value: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoredResponse {
    pub stored: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub state: LifecycleState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

/// Gateway failure rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self.0 {
            GatewayError::PoolExhausted
            | GatewayError::PoolClosed
            | GatewayError::ServiceShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BackendUnavailable(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.0.code().to_string(),
                message: self.0.to_string(),
            },
        };
        (self.status_code(), Json(body)).into_response()
    }
}

/// Builds the router for one lifecycle.
pub fn router<C: Connector>(lifecycle: Arc<LifecycleManager<C>>, default_key: &str) -> Router {
    let state = AppState {
        lifecycle,
        default_key: Arc::from(default_key),
    };
    Router::new()
        .route("/cache", get(get_default::<C>))
        .route("/cache/{key}", get(get_key::<C>).put(put_key::<C>))
        .route("/metrics", get(metrics::<C>))
        .route("/health", get(health::<C>))
        .with_state(state)
}

async fn get_default<C: Connector>(
    State(state): State<AppState<C>>,
) -> Result<Json<ValueResponse>, ApiError> {
    read(&state, &state.default_key).await
}

async fn get_key<C: Connector>(
    State(state): State<AppState<C>>,
    Path(key): Path<String>,
) -> Result<Json<ValueResponse>, ApiError> {
    read(&state, &key).await
}

async fn read<C: Connector>(state: &AppState<C>, key: &str) -> Result<Json<ValueResponse>, ApiError> {
    let value = state.lifecycle.gateway().get(key).await?;
    Ok(Json(ValueResponse {
        value: value.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
    }))
}

async fn put_key<C: Connector>(
    State(state): State<AppState<C>>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<Json<StoredResponse>, ApiError> {
    let stored = state.lifecycle.gateway().set(&key, &body).await?;
    Ok(Json(StoredResponse { stored }))
}

async fn metrics<C: Connector>(State(state): State<AppState<C>>) -> Response {
    let gateway = state.lifecycle.gateway();
    let text = gateway.metrics().render_prometheus(&gateway.pool().stats());
    ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], text).into_response()
}

async fn health<C: Connector>(State(state): State<AppState<C>>) -> (StatusCode, Json<HealthResponse>) {
    let current = state.lifecycle.state();
    let status = if current == LifecycleState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(HealthResponse { state: current }))
}
