use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::responses::JsonResponse;
use crate::services::purchase::{PurchaseError, PurchaseRequest};
use crate::state::AppState;

use super::ledger_error_response;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchasePayload {
    pub plan_id: String,
    pub charge_id: String,
}

pub async fn confirm_purchase(
    State(app_state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(payload): Json<PurchasePayload>,
) -> Response {
    let request = PurchaseRequest {
        tenant_id,
        plan_id: payload.plan_id,
        charge_id: payload.charge_id,
    };

    match app_state.purchases().confirm(&request).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "balance": outcome.balance(),
                "quotaSet": outcome.quota_set(),
                "duplicate": outcome.is_duplicate(),
            })),
        )
            .into_response(),
        Err(PurchaseError::UnknownPlan(plan_id)) => {
            JsonResponse::bad_request(&format!("Unknown plan `{plan_id}`")).into_response()
        }
        Err(PurchaseError::MissingField(field)) => {
            JsonResponse::bad_request(&format!("`{field}` is required")).into_response()
        }
        Err(PurchaseError::Ledger(err)) => ledger_error_response(&err),
        Err(PurchaseError::Database(err)) => {
            error!(?err, tenant_id = %request.tenant_id, "failed to record purchase");
            JsonResponse::server_error("Failed to record purchase").into_response()
        }
    }
}
