//! Webhook HTTP surface: handshake, event delivery, and the pairing-approval API.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use mpgate_access::PairingApprovalError;
use mpgate_channel::{
    select_handshake_target, select_post_target, ChannelPipeline, EnvelopeError, RouteMatch,
    WebhookQuery,
};
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::api_error::GatewayApiError;
use crate::rate_limit::{
    FixedWindowRateLimiter, RateLimitDecision, DEFAULT_RATE_LIMIT_MAX_REQUESTS,
    DEFAULT_RATE_LIMIT_WINDOW_MS,
};

pub const HEALTHZ_ENDPOINT: &str = "/healthz";
pub const PAIR_API_SUBPATH: &str = "/api/pair";
pub const DEFAULT_MAX_WEBHOOK_BODY_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MAX_PAIR_BODY_BYTES: usize = 32 * 1024;
const WEBHOOK_SUCCESS_BODY: &str = "success";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayServerConfig {
    pub bind: String,
    pub max_webhook_body_bytes: usize,
    pub max_pair_body_bytes: usize,
    pub pair_rate_limit_window_ms: u64,
    pub pair_rate_limit_max_requests: usize,
}

impl Default for GatewayServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
            max_webhook_body_bytes: DEFAULT_MAX_WEBHOOK_BODY_BYTES,
            max_pair_body_bytes: DEFAULT_MAX_PAIR_BODY_BYTES,
            pair_rate_limit_window_ms: DEFAULT_RATE_LIMIT_WINDOW_MS,
            pair_rate_limit_max_requests: DEFAULT_RATE_LIMIT_MAX_REQUESTS,
        }
    }
}

/// Shared state handed to every request handler.
pub struct GatewayServerState {
    config: GatewayServerConfig,
    pipeline: Arc<ChannelPipeline>,
    pair_rate_limiter: FixedWindowRateLimiter,
}

impl GatewayServerState {
    pub fn new(config: GatewayServerConfig, pipeline: Arc<ChannelPipeline>) -> Self {
        let pair_rate_limiter = FixedWindowRateLimiter::new(
            config.pair_rate_limit_window_ms,
            config.pair_rate_limit_max_requests,
        );
        Self {
            config,
            pipeline,
            pair_rate_limiter,
        }
    }
}

pub fn build_gateway_router(state: Arc<GatewayServerState>) -> Router {
    Router::new()
        .route(HEALTHZ_ENDPOINT, get(handle_healthz))
        .fallback(handle_webhook_request)
        .with_state(state)
}

/// Binds `config.bind` and serves until Ctrl-C.
pub async fn run_gateway_server(
    config: GatewayServerConfig,
    pipeline: Arc<ChannelPipeline>,
) -> Result<()> {
    let bind_addr = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address '{}'", config.bind))?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind webhook gateway on {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound gateway address")?;
    info!(
        addr = %local_addr,
        paths = ?pipeline.targets().paths(),
        "webhook gateway listening"
    );

    let state = Arc::new(GatewayServerState::new(config, pipeline));
    serve_gateway(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await
}

/// Serves on an already-bound listener until `shutdown` resolves.
pub async fn serve_gateway<F>(
    listener: TcpListener,
    state: Arc<GatewayServerState>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_gateway_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("webhook gateway exited unexpectedly")
}

async fn handle_healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn handle_webhook_request(
    State(state): State<Arc<GatewayServerState>>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let Some(route) = state.pipeline.targets().resolve(parts.uri.path()) else {
        return GatewayApiError::not_found("not_found", "no webhook registered for path")
            .into_response();
    };

    let result = if route.is_exact() {
        match parts.method {
            Method::GET => handle_handshake(&route, &parts.uri),
            Method::POST => handle_delivery(&state, &route, &parts.uri, body).await,
            _ => Err(GatewayApiError::method_not_allowed("GET, POST")),
        }
    } else if route.sub_path == PAIR_API_SUBPATH {
        if parts.method == Method::POST {
            let remote = parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            handle_pair_approval(&state, &route, &remote, body).await
        } else {
            Err(GatewayApiError::method_not_allowed("POST"))
        }
    } else {
        Err(GatewayApiError::not_found(
            "not_found",
            "unknown webhook sub-route",
        ))
    };

    match result {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

fn parse_query(uri: &Uri) -> Result<WebhookQuery, GatewayApiError> {
    Query::<WebhookQuery>::try_from_uri(uri)
        .map(|Query(query)| query)
        .map_err(|error| GatewayApiError::bad_request("invalid_query", error.body_text()))
}

fn handle_handshake(route: &RouteMatch, uri: &Uri) -> Result<Response, GatewayApiError> {
    let query = parse_query(uri)
        .map_err(|_| GatewayApiError::forbidden("handshake verification failed"))?;
    match select_handshake_target(&route.targets, &query) {
        Ok((account, echo)) => {
            info!(account_id = %account.account_id, "webhook handshake verified");
            Ok((StatusCode::OK, echo).into_response())
        }
        Err(error) => {
            warn!(path = %route.base_path, %error, "webhook handshake rejected");
            Err(GatewayApiError::forbidden("handshake verification failed"))
        }
    }
}

async fn handle_delivery(
    state: &GatewayServerState,
    route: &RouteMatch,
    uri: &Uri,
    body: Body,
) -> Result<Response, GatewayApiError> {
    let limit = state.config.max_webhook_body_bytes;
    let body = to_bytes(body, limit)
        .await
        .map_err(|_| GatewayApiError::payload_too_large(limit))?;
    let query = parse_query(uri)?;
    match select_post_target(&route.targets, &query, &body) {
        Ok((account, event)) => {
            debug!(
                account_id = %account.account_id,
                msg_type = %event.msg_type,
                "webhook event accepted"
            );
            state.pipeline.accept(account, event);
            Ok((StatusCode::OK, WEBHOOK_SUCCESS_BODY).into_response())
        }
        Err(EnvelopeError::Authentication(detail)) => {
            warn!(
                path = %route.base_path,
                detail = %detail,
                "webhook delivery failed authentication"
            );
            Err(GatewayApiError::forbidden("webhook authentication failed"))
        }
        Err(EnvelopeError::Malformed(detail)) => {
            debug!(path = %route.base_path, detail = %detail, "malformed webhook delivery");
            Err(GatewayApiError::bad_request("malformed_payload", detail))
        }
    }
}

async fn handle_pair_approval(
    state: &GatewayServerState,
    route: &RouteMatch,
    remote: &str,
    body: Body,
) -> Result<Response, GatewayApiError> {
    let candidates = route
        .targets
        .iter()
        .filter_map(|target| {
            target
                .account
                .pairing_token
                .as_deref()
                .map(|token| (target.account_id(), token))
        })
        .collect::<Vec<_>>();
    if candidates.is_empty() {
        return Err(GatewayApiError::not_found(
            "not_configured",
            "pairing api is not enabled for this path",
        ));
    }

    if let RateLimitDecision::Limited { retry_after_secs } =
        state.pair_rate_limiter.check(remote)
    {
        warn!(remote, retry_after_secs, "pairing api rate limited");
        return Err(GatewayApiError::rate_limited(retry_after_secs));
    }

    let limit = state.config.max_pair_body_bytes;
    let body = to_bytes(body, limit)
        .await
        .map_err(|_| GatewayApiError::payload_too_large(limit))?;
    let payload: Value = serde_json::from_slice(&body)
        .map_err(|_| GatewayApiError::bad_request("invalid_json", "body must be a JSON object"))?;
    let code = required_string_field(&payload, "code")?;
    let token = required_string_field(&payload, "token")?;

    let permitted = candidates
        .iter()
        .filter(|(_, expected)| bool::from(token.as_bytes().ct_eq(expected.as_bytes())))
        .map(|(account_id, _)| *account_id)
        .collect::<Vec<_>>();
    if permitted.is_empty() {
        warn!(remote, path = %route.base_path, "pairing api token rejected");
        return Err(GatewayApiError::unauthorized("invalid pairing token"));
    }

    match state
        .pipeline
        .resolver()
        .approve_code(code, &permitted)
        .await
    {
        Ok(subject) => Ok(Json(json!({
            "ok": true,
            "accountId": subject.account_id,
            "openId": subject.open_id,
        }))
        .into_response()),
        Err(PairingApprovalError::InvalidOrExpired) => Err(GatewayApiError::bad_request(
            "invalid_code",
            "invalid or expired pairing code",
        )),
        Err(PairingApprovalError::ExecutorFailed { detail }) => {
            warn!(remote, detail = %detail, "pairing approval executor failed");
            Err(GatewayApiError::new(
                StatusCode::BAD_GATEWAY,
                "approval_failed",
                "pairing approval failed",
            ))
        }
        Err(storage @ PairingApprovalError::Storage(_)) => {
            error!(error = %storage, "pairing storage failure");
            Err(GatewayApiError::internal("pairing storage unavailable"))
        }
    }
}

fn required_string_field<'a>(payload: &'a Value, field: &str) -> Result<&'a str, GatewayApiError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            GatewayApiError::bad_request("missing_field", format!("'{field}' is required"))
        })
}
