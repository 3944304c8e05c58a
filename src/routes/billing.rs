use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{error, info, warn};

use crate::responses::JsonResponse;
use crate::services::webhook::{WebhookError, WebhookOutcome};
use crate::state::AppState;
use crate::utils::webhook_signature::{verify_signature, SIGNATURE_HEADER};

/// Subscription lifecycle webhook. Anything past the signature check is
/// acknowledged, so the provider will not redeliver an event that failed
/// here. The failed event's marker is released so a manual or provider
/// replay of the same payload can still apply it.
pub async fn billing_webhook(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(secret) = app_state.config.webhook_secret.as_deref() {
        let provided = headers
            .get(SIGNATURE_HEADER)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default();
        if !verify_signature(secret, &body, provided) {
            warn!("billing webhook signature verification failed");
            return JsonResponse::unauthorized("Invalid webhook signature").into_response();
        }
    }

    match app_state.reconciler().reconcile(&body).await {
        Ok(WebhookOutcome::Applied {
            tenant_id, status, ..
        }) => {
            info!(%tenant_id, status = status.as_str(), "applied billing webhook");
        }
        Ok(WebhookOutcome::Recorded { tenant_id, status }) => {
            info!(%tenant_id, status = status.as_str(), "recorded billing webhook");
        }
        Ok(WebhookOutcome::Duplicate { event_id }) => {
            info!(%event_id, "duplicate billing webhook");
        }
        Err(WebhookError::PayloadInvalid(reason)) => {
            warn!(%reason, "ignoring invalid billing webhook payload");
        }
        Err(err) => {
            error!(?err, "failed to process billing webhook");
        }
    }

    Json(json!({ "received": true })).into_response()
}
