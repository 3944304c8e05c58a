pub mod account;
pub mod billing;
pub mod consumption;
pub mod purchases;

use axum::{
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::responses::JsonResponse;
use crate::services::ledger::LedgerError;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let tenant_routes = Router::new()
        .route(
            "/{tenant_id}",
            post(account::register_tenant).delete(account::offboard_tenant),
        )
        .route("/{tenant_id}/account", get(account::get_account))
        .route("/{tenant_id}/enabled", put(account::set_enabled))
        .route("/{tenant_id}/consume", post(consumption::consume_credit))
        .route(
            "/{tenant_id}/consumptions",
            get(consumption::list_consumptions),
        )
        .route(
            "/{tenant_id}/consumptions/{reservation_id}/outcome",
            post(consumption::record_outcome),
        )
        .route("/{tenant_id}/purchases", post(purchases::confirm_purchase));

    Router::new()
        .route("/", get(root))
        .nest("/api/tenants", tenant_routes)
        .route("/api/billing/webhook", post(billing::billing_webhook))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn root() -> Response {
    JsonResponse::success("creditmeter is running").into_response()
}

/// Shared mapping for ledger failures at the HTTP boundary.
pub(crate) fn ledger_error_response(err: &LedgerError) -> Response {
    match err {
        LedgerError::TenantNotFound(_) => JsonResponse::not_found("Unknown tenant").into_response(),
        LedgerError::ConcurrentModification { .. } => {
            JsonResponse::service_unavailable("Ledger is busy, please retry").into_response()
        }
        LedgerError::Database(db_err) => {
            error!(?db_err, "ledger database error");
            JsonResponse::server_error("Database error").into_response()
        }
    }
}
