use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{error, info};
use uuid::Uuid;

use crate::models::consumption::{ConsumptionOutcome, ConsumptionReport};
use crate::responses::JsonResponse;
use crate::services::consumption::ConsumptionError;
use crate::state::AppState;

use super::ledger_error_response;

fn consumption_error_response(err: ConsumptionError) -> Response {
    match err {
        ConsumptionError::InsufficientCredits { remaining } => (
            StatusCode::PAYMENT_REQUIRED,
            Json(json!({
                "status": "error",
                "success": false,
                "granted": false,
                "remaining": remaining,
                "message": "No credits left for this billing period",
                "code": "insufficient_credits",
            })),
        )
            .into_response(),
        ConsumptionError::FeatureDisabled(_) => {
            JsonResponse::forbidden_with_code("Metering is disabled for this tenant", "feature_disabled")
                .into_response()
        }
        ConsumptionError::UnknownReservation(_) => {
            JsonResponse::not_found("Unknown reservation").into_response()
        }
        ConsumptionError::Ledger(err) => ledger_error_response(&err),
        ConsumptionError::Audit(err) => {
            error!(?err, "consumption audit error");
            JsonResponse::server_error("Failed to access consumption log").into_response()
        }
    }
}

pub async fn consume_credit(
    State(app_state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Response {
    match app_state.consumption_gate().try_consume(&tenant_id).await {
        Ok(reservation) => {
            info!(
                %tenant_id,
                reservation_id = %reservation.id,
                remaining = reservation.remaining,
                "granted metered call"
            );
            (
                StatusCode::OK,
                Json(json!({
                    "granted": true,
                    "remaining": reservation.remaining,
                    "reservationId": reservation.id,
                })),
            )
                .into_response()
        }
        Err(err) => consumption_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomePayload {
    pub success: bool,
    #[serde(default)]
    pub latency_ms: i64,
    pub error: Option<String>,
    pub result_ref: Option<String>,
}

pub async fn record_outcome(
    State(app_state): State<AppState>,
    Path((tenant_id, reservation_id)): Path<(String, Uuid)>,
    Json(payload): Json<OutcomePayload>,
) -> Response {
    if payload.latency_ms < 0 {
        return JsonResponse::bad_request("latencyMs must not be negative").into_response();
    }
    let report = ConsumptionReport {
        reservation_id,
        tenant_id,
        outcome: if payload.success {
            ConsumptionOutcome::Success
        } else {
            ConsumptionOutcome::Failure
        },
        latency_ms: payload.latency_ms,
        error: payload.error,
        result_ref: payload.result_ref,
    };

    match app_state.consumption_gate().record_outcome(&report).await {
        Ok(recorded) => (StatusCode::OK, Json(json!({ "recorded": recorded }))).into_response(),
        Err(err) => consumption_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub from: Option<String>,
    pub to: Option<String>,
    pub limit: Option<i64>,
}

fn parse_bound(raw: Option<&str>, name: &str) -> Result<Option<OffsetDateTime>, Response> {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(value) => OffsetDateTime::parse(value, &Rfc3339).map(Some).map_err(|_| {
            JsonResponse::bad_request(&format!("`{name}` must be an RFC 3339 timestamp"))
                .into_response()
        }),
    }
}

pub async fn list_consumptions(
    State(app_state): State<AppState>,
    Path(tenant_id): Path<String>,
    Query(query): Query<AuditQuery>,
) -> Response {
    let from = match parse_bound(query.from.as_deref(), "from") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let to = match parse_bound(query.to.as_deref(), "to") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match app_state
        .consumption_gate()
        .audit_for_tenant(&tenant_id, from, to, query.limit)
        .await
    {
        Ok(entries) => (
            StatusCode::OK,
            Json(json!({ "success": true, "entries": entries })),
        )
            .into_response(),
        Err(err) => consumption_error_response(err),
    }
}
