//! axum routes for `/webhooks/{provider}`

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;

use super::handlers::HandshakeResponse;
use super::ingest::WebhookIngestor;
use crate::error::{CrosspostError, WebhookError};

pub fn router(ingestor: Arc<WebhookIngestor>) -> Router {
    Router::new()
        .route("/webhooks/{provider}", get(handshake).post(deliver))
        .with_state(ingestor)
}

async fn handshake(
    State(ingestor): State<Arc<WebhookIngestor>>,
    Path(provider): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    match ingestor.handle_get(&provider, &query) {
        Ok(HandshakeResponse::Text(challenge)) => (StatusCode::OK, challenge).into_response(),
        Ok(HandshakeResponse::Json(body)) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn deliver(
    State(ingestor): State<Arc<WebhookIngestor>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match ingestor.handle_post(&provider, &headers, &body).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => error_response(&e),
    }
}

fn error_response(error: &CrosspostError) -> Response {
    let status = match error {
        CrosspostError::Webhook(WebhookError::NoHandler(_)) => StatusCode::NOT_FOUND,
        CrosspostError::Webhook(WebhookError::HandshakeRejected(_))
        | CrosspostError::Webhook(WebhookError::MissingSecret(_)) => StatusCode::FORBIDDEN,
        _ => {
            tracing::error!(error = %error, "Webhook processing failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}
