use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{error, warn};

use crate::config::LedgerSettings;
use crate::db::account_repository::AccountRepository;
use crate::models::account::{Account, ConsumeResult, Credited, QuotaReset, SubscriptionStatus};
use crate::utils::billing_period::BillingPeriod;

#[cfg(test)]
const LEDGER_INITIAL_BACKOFF: Duration = Duration::from_millis(1);
#[cfg(not(test))]
const LEDGER_INITIAL_BACKOFF: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("tenant `{0}` has no account")]
    TenantNotFound(String),
    #[error("ledger operation `{operation}` for tenant `{tenant_id}` kept conflicting after {attempts} attempts")]
    ConcurrentModification {
        tenant_id: String,
        operation: &'static str,
        attempts: usize,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// PostgreSQL serialization failures and deadlocks leave nothing applied, so
/// the conditional statement can simply run again.
pub fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err.as_database_error()
            .and_then(|db| db.code())
            .as_deref(),
        Some("40001") | Some("40P01")
    )
}

/// Atomic ledger primitives over the account store.
#[derive(Clone)]
pub struct Ledger {
    accounts: Arc<dyn AccountRepository>,
    max_retries: usize,
}

impl Ledger {
    pub fn new(accounts: Arc<dyn AccountRepository>, settings: &LedgerSettings) -> Self {
        Self {
            accounts,
            max_retries: settings.max_retries,
        }
    }

    pub async fn find_account(&self, tenant_id: &str) -> Result<Option<Account>, LedgerError> {
        Ok(self.accounts.find_account(tenant_id).await?)
    }

    pub async fn account(&self, tenant_id: &str) -> Result<Account, LedgerError> {
        self.find_account(tenant_id)
            .await?
            .ok_or_else(|| LedgerError::TenantNotFound(tenant_id.to_string()))
    }

    pub async fn ensure_account(
        &self,
        tenant_id: &str,
        now: OffsetDateTime,
    ) -> Result<Account, LedgerError> {
        let period = BillingPeriod::containing(now);
        self.with_retry(tenant_id, "ensure_account", || {
            self.accounts.ensure_account(tenant_id, &period)
        })
        .await
    }

    pub async fn consume(&self, tenant_id: &str) -> Result<ConsumeResult, LedgerError> {
        self.with_retry(tenant_id, "consume", || self.accounts.consume(tenant_id))
            .await?
            .ok_or_else(|| LedgerError::TenantNotFound(tenant_id.to_string()))
    }

    pub async fn credit(
        &self,
        tenant_id: &str,
        amount: i32,
        monthly_quota: Option<i32>,
        now: OffsetDateTime,
    ) -> Result<Credited, LedgerError> {
        let period = BillingPeriod::containing(now);
        self.with_retry(tenant_id, "credit", || {
            self.accounts
                .credit(tenant_id, amount, monthly_quota, &period)
        })
        .await
    }

    pub async fn reset_to_quota(
        &self,
        tenant_id: &str,
        period: &BillingPeriod,
    ) -> Result<QuotaReset, LedgerError> {
        self.with_retry(tenant_id, "reset_to_quota", || {
            self.accounts.reset_to_quota(tenant_id, period)
        })
        .await?
        .ok_or_else(|| LedgerError::TenantNotFound(tenant_id.to_string()))
    }

    pub async fn activate(
        &self,
        tenant_id: &str,
        quota: i32,
        now: OffsetDateTime,
    ) -> Result<Credited, LedgerError> {
        let period = BillingPeriod::containing(now);
        self.with_retry(tenant_id, "activate", || {
            self.accounts.activate(tenant_id, quota, &period)
        })
        .await
    }

    pub async fn demote(
        &self,
        tenant_id: &str,
        free_quota: i32,
        status: SubscriptionStatus,
        now: OffsetDateTime,
    ) -> Result<Credited, LedgerError> {
        let period = BillingPeriod::containing(now);
        self.with_retry(tenant_id, "demote", || {
            self.accounts.demote(tenant_id, free_quota, status, &period)
        })
        .await
    }

    /// Advisory counters. Failures are logged and never surface to callers.
    pub async fn note_consumed(&self, tenant_id: &str) {
        if let Err(err) = self.accounts.increment_consumed(tenant_id).await {
            warn!(?err, tenant_id, "failed to bump total_consumed");
        }
    }

    pub async fn note_conversion(&self, tenant_id: &str) {
        if let Err(err) = self.accounts.increment_conversions(tenant_id).await {
            warn!(?err, tenant_id, "failed to bump total_conversions");
        }
    }

    pub async fn set_enabled(&self, tenant_id: &str, enabled: bool) -> Result<Account, LedgerError> {
        self.accounts
            .set_enabled(tenant_id, enabled)
            .await?
            .ok_or_else(|| LedgerError::TenantNotFound(tenant_id.to_string()))
    }

    pub async fn offboard(&self, tenant_id: &str) -> Result<bool, LedgerError> {
        Ok(self.accounts.purge_tenant(tenant_id).await?)
    }

    async fn with_retry<T, F, Fut>(
        &self,
        tenant_id: &str,
        operation: &'static str,
        mut op: F,
    ) -> Result<T, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 0usize;
        let mut backoff = LEDGER_INITIAL_BACKOFF;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) && attempt <= self.max_retries => {
                    warn!(
                        tenant_id,
                        operation,
                        attempt,
                        ?err,
                        "ledger write conflicted; retrying"
                    );
                    sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(err) if is_transient(&err) => {
                    error!(
                        tenant_id,
                        operation,
                        attempt,
                        ?err,
                        "ledger write exhausted retries"
                    );
                    return Err(LedgerError::ConcurrentModification {
                        tenant_id: tenant_id.to_string(),
                        operation,
                        attempts: attempt,
                    });
                }
                Err(err) => return Err(LedgerError::Database(err)),
            }
        }
    }
}
