//! HTTP server implementation using Axum.

use crate::command;
use crate::dispatch::{Stage, StageHandler, INVOCATION_TYPE_HEADER, STAGE_TOKEN_HEADER};
use crate::error::{AuthenticationError, DispatchFailure, IntakeError, ValidationError};
use crate::modal::{self, InboundCommand, Intake, ViewSubmission};
use crate::signature::{self, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::state::AppState;
use crate::types::ExecutionRequest;
use crate::webhook::WebhookBody;
use axum::{
    body::{Body, Bytes},
    extract::{Path, Request, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Webhook bodies are small; anything bigger is not a chat command.
const MAX_BODY_BYTES: usize = 1024 * 1024;

pub fn router(state: AppState) -> Router {
    let signed = Router::new()
        .route("/run", post(intake))
        .route("/modal", post(intake))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            verify_signature,
        ));

    let mut app = Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .merge(signed);
    if state.stage_token.is_some() {
        app = app.route("/stages/:stage", post(stage_entry));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await
}

async fn health() -> &'static str {
    "OK"
}

async fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

async fn verify_signature(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, IntakeError> {
    let (parts, body) = request.into_parts();
    // Nothing is known about an oversized body, not even whether it is signed.
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(uri = %parts.uri, error = %e, "Rejected oversized webhook");
            return Ok(StatusCode::PAYLOAD_TOO_LARGE.into_response());
        }
    };

    let header = |name: &str| parts.headers.get(name).and_then(|v| v.to_str().ok());
    let timestamp = header(TIMESTAMP_HEADER)
        .ok_or_else(|| AuthenticationError::MalformedTimestamp(String::new()))?;
    let presented = header(SIGNATURE_HEADER).unwrap_or_default();

    match signature::verify(
        timestamp,
        presented,
        &bytes,
        state.signing_secret.as_bytes(),
        signature::unix_now(),
    ) {
        Ok(authenticated) => debug!(timestamp = authenticated.timestamp, "Webhook verified"),
        Err(e) => {
            warn!(uri = %parts.uri, error = %e, "Rejected unsigned webhook");
            return Err(e.into());
        }
    }

    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}

async fn intake(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, IntakeError> {
    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    match WebhookBody::parse(content_type, &body)? {
        WebhookBody::Command(inbound) => handle_command(&state, inbound).await,
        WebhookBody::Submission(submission) => handle_submission(&state, &submission).await,
    }
}

async fn handle_command(state: &AppState, inbound: InboundCommand) -> Result<Response, IntakeError> {
    let parsed = command::parse(&inbound.raw_text, &state.registry)?;
    match modal::coordinate(parsed, &inbound, &state.registry)? {
        Intake::Direct(request) => {
            forward(state, &request).await?;
            Ok(Json(json!({ "response_type": "in_channel" })).into_response())
        }
        Intake::AwaitingInput(session) => {
            let runtime = state
                .registry
                .get(&session.language_key)
                .ok_or_else(|| ValidationError::UnsupportedLanguage(session.language_key.clone()))?;
            if let Err(e) = state.forms.open(&session, runtime).await {
                warn!(language = %session.language_key, error = %e, "Could not open form");
                if !inbound.callback_url.is_empty() {
                    let request = ExecutionRequest {
                        language_key: session.language_key.clone(),
                        code: String::new(),
                        callback_url: inbound.callback_url.clone(),
                        user_id: inbound.user_id.clone(),
                        is_modal_round_trip: false,
                    };
                    state.stages.responder().report_failure(&request).await;
                }
                return Err(e.into());
            }
            debug!(language = %session.language_key, "Form opened");
            Ok(StatusCode::OK.into_response())
        }
    }
}

async fn handle_submission(
    state: &AppState,
    submission: &ViewSubmission,
) -> Result<Response, IntakeError> {
    let request = modal::resume(submission, &state.registry)?;
    forward(state, &request).await?;
    Ok(Json(json!({ "response_action": "clear" })).into_response())
}

/// Hands the request to the responder stage. If that fails the user still hears
/// about it.
async fn forward(state: &AppState, request: &ExecutionRequest) -> Result<(), IntakeError> {
    if let Err(e) = state.stages.dispatcher().send(Stage::Responder, request).await {
        state.stages.responder().report_failure(request).await;
        return Err(e.into());
    }
    Ok(())
}

async fn stage_entry(
    State(state): State<AppState>,
    Path(stage): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(expected) = &state.stage_token else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let presented = headers
        .get(STAGE_TOKEN_HEADER)
        .map(|v| v.as_bytes())
        .unwrap_or_default();
    if !bool::from(expected.as_bytes().ct_eq(presented)) {
        warn!(stage = %stage, "Rejected stage invocation with bad token");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let Ok(stage) = stage.parse::<Stage>() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let fire_and_forget = headers
        .get(INVOCATION_TYPE_HEADER)
        .map(|v| v == "event")
        .unwrap_or(false);
    let stages = state.stages.clone();
    if fire_and_forget {
        tokio::spawn(async move {
            if let Err(e) = stages.handle(stage, body.to_vec()).await {
                warn!(%stage, error = %e, "Stage invocation failed");
            }
        });
        return StatusCode::ACCEPTED.into_response();
    }

    match stages.handle(stage, body.to_vec()).await {
        Ok(reply) => (StatusCode::OK, [(CONTENT_TYPE, "application/json")], reply).into_response(),
        Err(DispatchFailure::Codec(reason)) => (StatusCode::BAD_REQUEST, reason).into_response(),
        Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    }
}
