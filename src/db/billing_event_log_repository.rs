use async_trait::async_trait;

use crate::models::billing_event::{NewPurchaseEvent, NewSubscriptionEvent};

/// Uniqueness-enforced markers for purchase confirmations and subscription
/// webhooks. `record_*` is insert-or-ignore and reports whether the marker
/// was newly written.
#[async_trait]
pub trait BillingEventLogRepository: Send + Sync {
    async fn record_purchase_event(&self, event: &NewPurchaseEvent) -> Result<bool, sqlx::Error>;

    async fn remove_purchase_event(&self, charge_id: &str) -> Result<(), sqlx::Error>;

    async fn record_subscription_event(
        &self,
        event: &NewSubscriptionEvent,
    ) -> Result<bool, sqlx::Error>;

    async fn remove_subscription_event(&self, event_id: &str) -> Result<(), sqlx::Error>;
}
