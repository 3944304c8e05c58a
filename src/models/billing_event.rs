use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;

/// Idempotency marker for a credited plan purchase.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseEvent {
    pub charge_id: String,
    pub tenant_id: String,
    pub plan_id: String,
    pub credits: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewPurchaseEvent {
    pub charge_id: String,
    pub tenant_id: String,
    pub plan_id: String,
    pub credits: i32,
}

/// Idempotency marker for a processed subscription lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionEvent {
    pub event_id: String,
    pub subscription_id: Option<String>,
    pub tenant_id: String,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub processed_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewSubscriptionEvent {
    pub event_id: String,
    pub subscription_id: Option<String>,
    pub tenant_id: String,
    pub status: String,
}
