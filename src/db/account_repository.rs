use async_trait::async_trait;

use crate::models::account::{Account, ConsumeResult, Credited, QuotaReset, SubscriptionStatus};
use crate::utils::billing_period::BillingPeriod;

/// Durable per-tenant ledger state.
///
/// Every mutating method is a single indivisible store operation. None of
/// them may be implemented as a read followed by a separate write.
#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn find_account(&self, tenant_id: &str) -> Result<Option<Account>, sqlx::Error>;

    /// Creates the account (balance 0, quota 0) if the tenant is new.
    async fn ensure_account(
        &self,
        tenant_id: &str,
        period: &BillingPeriod,
    ) -> Result<Account, sqlx::Error>;

    /// Decrements the balance by one only when it is positive.
    /// Returns `None` when the tenant has no account.
    async fn consume(&self, tenant_id: &str) -> Result<Option<ConsumeResult>, sqlx::Error>;

    /// Adds `amount` to the balance, optionally replacing the monthly quota.
    /// Creates the account when absent, stamped with `period`.
    async fn credit(
        &self,
        tenant_id: &str,
        amount: i32,
        monthly_quota: Option<i32>,
        period: &BillingPeriod,
    ) -> Result<Credited, sqlx::Error>;

    /// Sets `balance = monthly_quota` and stamps `period` when the stored
    /// period is older. Returns the balance afterwards and whether the row
    /// changed, or `None` when the tenant has no account.
    async fn reset_to_quota(
        &self,
        tenant_id: &str,
        period: &BillingPeriod,
    ) -> Result<Option<QuotaReset>, sqlx::Error>;

    /// Sets the quota and raises the balance to at least the quota.
    async fn activate(
        &self,
        tenant_id: &str,
        quota: i32,
        period: &BillingPeriod,
    ) -> Result<Credited, sqlx::Error>;

    /// Sets the quota to `free_quota` and caps the balance at it.
    async fn demote(
        &self,
        tenant_id: &str,
        free_quota: i32,
        status: SubscriptionStatus,
        period: &BillingPeriod,
    ) -> Result<Credited, sqlx::Error>;

    async fn increment_consumed(&self, tenant_id: &str) -> Result<(), sqlx::Error>;

    async fn increment_conversions(&self, tenant_id: &str) -> Result<(), sqlx::Error>;

    async fn set_enabled(
        &self,
        tenant_id: &str,
        enabled: bool,
    ) -> Result<Option<Account>, sqlx::Error>;

    /// Removes the account together with its audit and idempotency records.
    /// Returns whether an account existed.
    async fn purge_tenant(&self, tenant_id: &str) -> Result<bool, sqlx::Error>;
}
