use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{ConnectInfo, FromRequest, Request, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tracing::warn;

use crate::join::{
    JoinError, JoinErrorKind, JoinProtocol, JoinRequest, JoinResponse, MembershipNegotiator,
};

pub const LEGACY_JOIN_PATH: &str = "/cluster/api/v1.0/join";
pub const JOIN_PATH: &str = "/cluster/api/v2.0/join";
pub const ETCD_JOIN_PATH: &str = "/cluster/api/v2.0/etcd/join";
pub const HEALTH_PATH: &str = "/cluster/api/v1.0/health";

#[derive(Clone)]
pub struct AppState {
    pub negotiator: Arc<MembershipNegotiator>,
    pub join_timeout: Duration,
}

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl From<JoinError> for ApiError {
    fn from(value: JoinError) -> Self {
        let status = match value.kind() {
            JoinErrorKind::Authentication => StatusCode::UNAUTHORIZED,
            JoinErrorKind::Precondition => StatusCode::BAD_REQUEST,
            JoinErrorKind::Consistency => StatusCode::CONFLICT,
            JoinErrorKind::TransientStore => StatusCode::SERVICE_UNAVAILABLE,
            JoinErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(value.code(), status, value.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    code: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: &self.message,
            code: self.code,
        };
        (self.status, Json(body)).into_response()
    }
}

pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S>,
    <axum::Json<T> as FromRequest<S>>::Rejection: std::fmt::Display,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::invalid_request(e.to_string()))?;
        Ok(Self(value))
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(LEGACY_JOIN_PATH, post(join_legacy))
        .route(JOIN_PATH, post(join_replicated_store))
        .route(ETCD_JOIN_PATH, post(join_etcd_ha))
        .route(HEALTH_PATH, get(health))
        .with_state(state)
}

async fn join_legacy(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<JoinRequest>,
) -> Result<Json<JoinResponse>, ApiError> {
    run_join(&state, JoinProtocol::Legacy, peer, &headers, req).await
}

async fn join_replicated_store(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<JoinRequest>,
) -> Result<Json<JoinResponse>, ApiError> {
    run_join(&state, JoinProtocol::ReplicatedStore, peer, &headers, req).await
}

async fn join_etcd_ha(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<JoinRequest>,
) -> Result<Json<JoinResponse>, ApiError> {
    run_join(&state, JoinProtocol::EtcdHa, peer, &headers, req).await
}

/// Fills the transport-derived fields and runs the join under the configured deadline.
async fn run_join(
    state: &AppState,
    protocol: JoinProtocol,
    peer: SocketAddr,
    headers: &HeaderMap,
    mut req: JoinRequest,
) -> Result<Json<JoinResponse>, ApiError> {
    req.request_host_port = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| ApiError::invalid_request("missing Host header"))?;
    req.remote_address = peer.ip().to_canonical().to_string();

    let result = tokio::time::timeout(state.join_timeout, state.negotiator.join(protocol, req))
        .await
        .unwrap_or(Err(JoinError::Timeout));
    match result {
        Ok(resp) => Ok(Json(resp)),
        Err(err) => {
            warn!(
                protocol = protocol.as_str(),
                remote_ip = %peer.ip(),
                code = err.code(),
                error = %err,
                "join rejected"
            );
            Err(err.into())
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    backend: &'static str,
    version: &'static str,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        backend: state.negotiator.state().backend_mode().as_str(),
        version: crate::version::VERSION,
    })
}

#[cfg(test)]
mod tests;
