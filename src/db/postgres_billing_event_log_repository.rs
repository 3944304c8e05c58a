use crate::db::billing_event_log_repository::BillingEventLogRepository;
use crate::models::billing_event::{NewPurchaseEvent, NewSubscriptionEvent};
use async_trait::async_trait;
use sqlx::PgPool;

pub struct PostgresBillingEventLogRepository {
    pub pool: PgPool,
}

#[async_trait]
impl BillingEventLogRepository for PostgresBillingEventLogRepository {
    async fn record_purchase_event(&self, event: &NewPurchaseEvent) -> Result<bool, sqlx::Error> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO purchase_events (charge_id, tenant_id, plan_id, credits)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (charge_id) DO NOTHING
            "#,
        )
        .bind(&event.charge_id)
        .bind(&event.tenant_id)
        .bind(&event.plan_id)
        .bind(event.credits)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted == 1)
    }

    async fn remove_purchase_event(&self, charge_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM purchase_events WHERE charge_id = $1")
            .bind(charge_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_subscription_event(
        &self,
        event: &NewSubscriptionEvent,
    ) -> Result<bool, sqlx::Error> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO subscription_events (event_id, subscription_id, tenant_id, status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.subscription_id)
        .bind(&event.tenant_id)
        .bind(&event.status)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted == 1)
    }

    async fn remove_subscription_event(&self, event_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM subscription_events WHERE event_id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
