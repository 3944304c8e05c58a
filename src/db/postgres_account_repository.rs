use async_trait::async_trait;
use sqlx::PgPool;

use crate::models::account::{Account, ConsumeResult, Credited, QuotaReset, SubscriptionStatus};
use crate::utils::billing_period::BillingPeriod;

use super::account_repository::AccountRepository;

const ACCOUNT_COLUMNS: &str = r#"
    tenant_id, balance, monthly_quota, last_reset_period, lifetime_credits,
    total_consumed, total_conversions, subscription_status, is_enabled,
    created_at, updated_at
"#;

pub struct PostgresAccountRepository {
    pub pool: PgPool,
}

impl PostgresAccountRepository {
    async fn current_balance(&self, tenant_id: &str) -> Result<Option<i32>, sqlx::Error> {
        sqlx::query_scalar::<_, i32>("SELECT balance FROM accounts WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await
    }
}

#[async_trait]
impl AccountRepository for PostgresAccountRepository {
    async fn find_account(&self, tenant_id: &str) -> Result<Option<Account>, sqlx::Error> {
        sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE tenant_id = $1"
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn ensure_account(
        &self,
        tenant_id: &str,
        period: &BillingPeriod,
    ) -> Result<Account, sqlx::Error> {
        sqlx::query_as::<_, Account>(&format!(
            r#"
            INSERT INTO accounts (tenant_id, last_reset_period)
            VALUES ($1, $2)
            ON CONFLICT (tenant_id) DO UPDATE SET tenant_id = accounts.tenant_id
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(tenant_id)
        .bind(period)
        .fetch_one(&self.pool)
        .await
    }

    async fn consume(&self, tenant_id: &str) -> Result<Option<ConsumeResult>, sqlx::Error> {
        let decremented = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE accounts
            SET balance = balance - 1, updated_at = now()
            WHERE tenant_id = $1 AND balance > 0
            RETURNING balance
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(remaining) = decremented {
            return Ok(Some(ConsumeResult {
                granted: true,
                remaining,
            }));
        }

        // Nothing was decremented; the read only reports why.
        Ok(self
            .current_balance(tenant_id)
            .await?
            .map(|remaining| ConsumeResult {
                granted: false,
                remaining,
            }))
    }

    async fn credit(
        &self,
        tenant_id: &str,
        amount: i32,
        monthly_quota: Option<i32>,
        period: &BillingPeriod,
    ) -> Result<Credited, sqlx::Error> {
        sqlx::query_as::<_, Credited>(
            r#"
            INSERT INTO accounts (tenant_id, balance, monthly_quota, last_reset_period, lifetime_credits)
            VALUES ($1, $2, COALESCE($3::INT, 0), $4, $2)
            ON CONFLICT (tenant_id) DO UPDATE
            SET balance = accounts.balance + EXCLUDED.balance,
                monthly_quota = COALESCE($3::INT, accounts.monthly_quota),
                lifetime_credits = accounts.lifetime_credits + EXCLUDED.balance,
                updated_at = now()
            RETURNING balance, monthly_quota
            "#,
        )
        .bind(tenant_id)
        .bind(amount)
        .bind(monthly_quota)
        .bind(period)
        .fetch_one(&self.pool)
        .await
    }

    async fn reset_to_quota(
        &self,
        tenant_id: &str,
        period: &BillingPeriod,
    ) -> Result<Option<QuotaReset>, sqlx::Error> {
        let reset = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE accounts
            SET balance = monthly_quota, last_reset_period = $2, updated_at = now()
            WHERE tenant_id = $1 AND last_reset_period < $2
            RETURNING balance
            "#,
        )
        .bind(tenant_id)
        .bind(period)
        .fetch_optional(&self.pool)
        .await?;

        match reset {
            Some(balance) => Ok(Some(QuotaReset {
                balance,
                renewed: true,
            })),
            None => Ok(self
                .current_balance(tenant_id)
                .await?
                .map(|balance| QuotaReset {
                    balance,
                    renewed: false,
                })),
        }
    }

    async fn activate(
        &self,
        tenant_id: &str,
        quota: i32,
        period: &BillingPeriod,
    ) -> Result<Credited, sqlx::Error> {
        sqlx::query_as::<_, Credited>(
            r#"
            INSERT INTO accounts
                (tenant_id, balance, monthly_quota, last_reset_period, lifetime_credits, subscription_status)
            VALUES ($1, $2, $2, $3, $2, 'ACTIVE')
            ON CONFLICT (tenant_id) DO UPDATE
            SET monthly_quota = EXCLUDED.monthly_quota,
                lifetime_credits = accounts.lifetime_credits
                    + GREATEST(EXCLUDED.monthly_quota - accounts.balance, 0),
                balance = GREATEST(accounts.balance, EXCLUDED.monthly_quota),
                subscription_status = 'ACTIVE',
                updated_at = now()
            RETURNING balance, monthly_quota
            "#,
        )
        .bind(tenant_id)
        .bind(quota)
        .bind(period)
        .fetch_one(&self.pool)
        .await
    }

    async fn demote(
        &self,
        tenant_id: &str,
        free_quota: i32,
        status: SubscriptionStatus,
        period: &BillingPeriod,
    ) -> Result<Credited, sqlx::Error> {
        sqlx::query_as::<_, Credited>(
            r#"
            INSERT INTO accounts (tenant_id, balance, monthly_quota, last_reset_period, subscription_status)
            VALUES ($1, 0, $2, $3, $4)
            ON CONFLICT (tenant_id) DO UPDATE
            SET monthly_quota = EXCLUDED.monthly_quota,
                balance = LEAST(accounts.balance, EXCLUDED.monthly_quota),
                subscription_status = EXCLUDED.subscription_status,
                updated_at = now()
            RETURNING balance, monthly_quota
            "#,
        )
        .bind(tenant_id)
        .bind(free_quota)
        .bind(period)
        .bind(status)
        .fetch_one(&self.pool)
        .await
    }

    async fn increment_consumed(&self, tenant_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE accounts SET total_consumed = total_consumed + 1, updated_at = now() WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn increment_conversions(&self, tenant_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE accounts SET total_conversions = total_conversions + 1, updated_at = now() WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_enabled(
        &self,
        tenant_id: &str,
        enabled: bool,
    ) -> Result<Option<Account>, sqlx::Error> {
        sqlx::query_as::<_, Account>(&format!(
            r#"
            UPDATE accounts
            SET is_enabled = $2, updated_at = now()
            WHERE tenant_id = $1
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(tenant_id)
        .bind(enabled)
        .fetch_optional(&self.pool)
        .await
    }

    async fn purge_tenant(&self, tenant_id: &str) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        for statement in [
            "DELETE FROM consumption_audit WHERE tenant_id = $1",
            "DELETE FROM purchase_events WHERE tenant_id = $1",
            "DELETE FROM subscription_events WHERE tenant_id = $1",
        ] {
            sqlx::query(statement)
                .bind(tenant_id)
                .execute(&mut *tx)
                .await?;
        }

        let deleted = sqlx::query("DELETE FROM accounts WHERE tenant_id = $1")
            .bind(tenant_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(deleted > 0)
    }
}
