use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::responses::JsonResponse;
use crate::services::renewal::RenewalOutcome;
use crate::state::AppState;

use super::ledger_error_response;

/// Registers a tenant the first time it is seen. Existing accounts are
/// returned unchanged.
pub async fn register_tenant(
    State(app_state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Response {
    let tenant_id = tenant_id.trim().to_string();
    if tenant_id.is_empty() {
        return JsonResponse::bad_request("tenant_id is required").into_response();
    }
    match app_state
        .ledger()
        .ensure_account(&tenant_id, time::OffsetDateTime::now_utc())
        .await
    {
        Ok(account) => {
            info!(%tenant_id, balance = account.balance, "registered tenant");
            (
                StatusCode::OK,
                Json(json!({ "success": true, "account": account })),
            )
                .into_response()
        }
        Err(err) => ledger_error_response(&err),
    }
}

/// Account snapshot. A read in a new period applies the renewal first.
pub async fn get_account(
    State(app_state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Response {
    let ledger = app_state.ledger();
    let account = match ledger.account(&tenant_id).await {
        Ok(account) => account,
        Err(err) => return ledger_error_response(&err),
    };

    let account = match app_state
        .renewal()
        .apply(&account, time::OffsetDateTime::now_utc())
        .await
    {
        Ok(RenewalOutcome::Current { .. }) => account,
        Ok(RenewalOutcome::Renewed { .. }) => match ledger.account(&tenant_id).await {
            Ok(account) => account,
            Err(err) => return ledger_error_response(&err),
        },
        Err(err) => return ledger_error_response(&err),
    };

    (
        StatusCode::OK,
        Json(json!({ "success": true, "account": account })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct EnabledPayload {
    pub enabled: bool,
}

pub async fn set_enabled(
    State(app_state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(payload): Json<EnabledPayload>,
) -> Response {
    match app_state
        .ledger()
        .set_enabled(&tenant_id, payload.enabled)
        .await
    {
        Ok(account) => {
            info!(%tenant_id, enabled = account.is_enabled, "updated metering flag");
            (
                StatusCode::OK,
                Json(json!({ "success": true, "account": account })),
            )
                .into_response()
        }
        Err(err) => ledger_error_response(&err),
    }
}

/// Removes the tenant's account, audit trail and billing receipts.
pub async fn offboard_tenant(
    State(app_state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Response {
    match app_state.ledger().offboard(&tenant_id).await {
        Ok(true) => {
            info!(%tenant_id, "offboarded tenant");
            JsonResponse::success("Tenant removed").into_response()
        }
        Ok(false) => JsonResponse::not_found("Unknown tenant").into_response(),
        Err(err) => ledger_error_response(&err),
    }
}
