use async_trait::async_trait;
use sqlx::error::{DatabaseError, ErrorKind};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use time::OffsetDateTime;

use super::account_repository::AccountRepository;
use super::billing_event_log_repository::BillingEventLogRepository;
use super::consumption_audit_repository::ConsumptionAuditRepository;
use crate::models::account::{Account, ConsumeResult, Credited, QuotaReset, SubscriptionStatus};
use crate::models::billing_event::{
    NewPurchaseEvent, NewSubscriptionEvent, PurchaseEvent, SubscriptionEvent,
};
use crate::models::consumption::{
    ConsumptionAuditEntry, ConsumptionReport, OutcomeRecord, Reservation,
};
use crate::utils::billing_period::BillingPeriod;

/// Stand-in for PostgreSQL `40001 serialization_failure`.
#[derive(Debug, thiserror::Error)]
#[error("could not serialize access due to concurrent update")]
pub struct MockSerializationFailure;

impl DatabaseError for MockSerializationFailure {
    fn message(&self) -> &str {
        "could not serialize access due to concurrent update"
    }

    fn code(&self) -> Option<Cow<'_, str>> {
        Some(Cow::Borrowed("40001"))
    }

    fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self
    }

    fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
        self
    }

    fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
        self
    }

    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

/// In-memory ledger store. Each primitive runs under a single lock so it is
/// as indivisible as the conditional statements of the Postgres store.
#[derive(Default)]
pub struct MockDb {
    pub accounts: Mutex<HashMap<String, Account>>,
    pub purchase_events: Mutex<HashMap<String, PurchaseEvent>>,
    pub subscription_events: Mutex<HashMap<String, SubscriptionEvent>>,
    pub audit_entries: Mutex<Vec<ConsumptionAuditEntry>>,
    /// Number of upcoming ledger writes that fail with a serialization failure.
    pub transient_failures: AtomicUsize,
    /// When set, every ledger write fails with a non-transient error.
    pub should_fail: AtomicBool,
    pub ledger_writes: AtomicUsize,
}

impl MockDb {
    pub fn with_account(self, account: Account) -> Self {
        self.accounts
            .lock()
            .unwrap()
            .insert(account.tenant_id.clone(), account);
        self
    }

    pub fn account(&self, tenant_id: &str) -> Option<Account> {
        self.accounts.lock().unwrap().get(tenant_id).cloned()
    }

    pub fn fail_next_writes_transiently(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<(), sqlx::Error> {
        self.ledger_writes.fetch_add(1, Ordering::SeqCst);
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(sqlx::Error::Protocol("Mock DB failure".into()));
        }
        let pending = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            return Err(sqlx::Error::Database(Box::new(MockSerializationFailure)));
        }
        Ok(())
    }
}

#[async_trait]
impl AccountRepository for MockDb {
    async fn find_account(&self, tenant_id: &str) -> Result<Option<Account>, sqlx::Error> {
        Ok(self.account(tenant_id))
    }

    async fn ensure_account(
        &self,
        tenant_id: &str,
        period: &BillingPeriod,
    ) -> Result<Account, sqlx::Error> {
        self.check_write()?;
        let mut accounts = self.accounts.lock().unwrap();
        Ok(accounts
            .entry(tenant_id.to_string())
            .or_insert_with(|| {
                Account::new(tenant_id, period.clone(), OffsetDateTime::now_utc())
            })
            .clone())
    }

    async fn consume(&self, tenant_id: &str) -> Result<Option<ConsumeResult>, sqlx::Error> {
        self.check_write()?;
        let mut accounts = self.accounts.lock().unwrap();
        Ok(accounts.get_mut(tenant_id).map(|account| {
            if account.balance > 0 {
                account.balance -= 1;
                account.updated_at = OffsetDateTime::now_utc();
                ConsumeResult {
                    granted: true,
                    remaining: account.balance,
                }
            } else {
                ConsumeResult {
                    granted: false,
                    remaining: account.balance,
                }
            }
        }))
    }

    async fn credit(
        &self,
        tenant_id: &str,
        amount: i32,
        monthly_quota: Option<i32>,
        period: &BillingPeriod,
    ) -> Result<Credited, sqlx::Error> {
        self.check_write()?;
        let now = OffsetDateTime::now_utc();
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts
            .entry(tenant_id.to_string())
            .or_insert_with(|| Account::new(tenant_id, period.clone(), now));
        account.balance += amount;
        account.lifetime_credits += i64::from(amount);
        if let Some(quota) = monthly_quota {
            account.monthly_quota = quota;
        }
        account.updated_at = now;
        Ok(Credited {
            balance: account.balance,
            monthly_quota: account.monthly_quota,
        })
    }

    async fn reset_to_quota(
        &self,
        tenant_id: &str,
        period: &BillingPeriod,
    ) -> Result<Option<QuotaReset>, sqlx::Error> {
        self.check_write()?;
        let mut accounts = self.accounts.lock().unwrap();
        Ok(accounts.get_mut(tenant_id).map(|account| {
            let renewed = account.last_reset_period < *period;
            if renewed {
                account.balance = account.monthly_quota;
                account.last_reset_period = period.clone();
                account.updated_at = OffsetDateTime::now_utc();
            }
            QuotaReset {
                balance: account.balance,
                renewed,
            }
        }))
    }

    async fn activate(
        &self,
        tenant_id: &str,
        quota: i32,
        period: &BillingPeriod,
    ) -> Result<Credited, sqlx::Error> {
        self.check_write()?;
        let now = OffsetDateTime::now_utc();
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts
            .entry(tenant_id.to_string())
            .or_insert_with(|| Account::new(tenant_id, period.clone(), now));
        account.monthly_quota = quota;
        if account.balance < quota {
            account.lifetime_credits += i64::from(quota - account.balance);
            account.balance = quota;
        }
        account.subscription_status = SubscriptionStatus::Active;
        account.updated_at = now;
        Ok(Credited {
            balance: account.balance,
            monthly_quota: account.monthly_quota,
        })
    }

    async fn demote(
        &self,
        tenant_id: &str,
        free_quota: i32,
        status: SubscriptionStatus,
        period: &BillingPeriod,
    ) -> Result<Credited, sqlx::Error> {
        self.check_write()?;
        let now = OffsetDateTime::now_utc();
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts
            .entry(tenant_id.to_string())
            .or_insert_with(|| Account::new(tenant_id, period.clone(), now));
        account.monthly_quota = free_quota;
        account.balance = account.balance.min(free_quota);
        account.subscription_status = status;
        account.updated_at = now;
        Ok(Credited {
            balance: account.balance,
            monthly_quota: account.monthly_quota,
        })
    }

    async fn increment_consumed(&self, tenant_id: &str) -> Result<(), sqlx::Error> {
        if let Some(account) = self.accounts.lock().unwrap().get_mut(tenant_id) {
            account.total_consumed += 1;
        }
        Ok(())
    }

    async fn increment_conversions(&self, tenant_id: &str) -> Result<(), sqlx::Error> {
        if let Some(account) = self.accounts.lock().unwrap().get_mut(tenant_id) {
            account.total_conversions += 1;
        }
        Ok(())
    }

    async fn set_enabled(
        &self,
        tenant_id: &str,
        enabled: bool,
    ) -> Result<Option<Account>, sqlx::Error> {
        let mut accounts = self.accounts.lock().unwrap();
        Ok(accounts.get_mut(tenant_id).map(|account| {
            account.is_enabled = enabled;
            account.clone()
        }))
    }

    async fn purge_tenant(&self, tenant_id: &str) -> Result<bool, sqlx::Error> {
        self.audit_entries
            .lock()
            .unwrap()
            .retain(|entry| entry.tenant_id != tenant_id);
        self.purchase_events
            .lock()
            .unwrap()
            .retain(|_, event| event.tenant_id != tenant_id);
        self.subscription_events
            .lock()
            .unwrap()
            .retain(|_, event| event.tenant_id != tenant_id);
        Ok(self.accounts.lock().unwrap().remove(tenant_id).is_some())
    }
}

#[async_trait]
impl BillingEventLogRepository for MockDb {
    async fn record_purchase_event(&self, event: &NewPurchaseEvent) -> Result<bool, sqlx::Error> {
        let mut events = self.purchase_events.lock().unwrap();
        if events.contains_key(&event.charge_id) {
            return Ok(false);
        }
        events.insert(
            event.charge_id.clone(),
            PurchaseEvent {
                charge_id: event.charge_id.clone(),
                tenant_id: event.tenant_id.clone(),
                plan_id: event.plan_id.clone(),
                credits: event.credits,
                created_at: OffsetDateTime::now_utc(),
            },
        );
        Ok(true)
    }

    async fn remove_purchase_event(&self, charge_id: &str) -> Result<(), sqlx::Error> {
        self.purchase_events.lock().unwrap().remove(charge_id);
        Ok(())
    }

    async fn record_subscription_event(
        &self,
        event: &NewSubscriptionEvent,
    ) -> Result<bool, sqlx::Error> {
        let mut events = self.subscription_events.lock().unwrap();
        if events.contains_key(&event.event_id) {
            return Ok(false);
        }
        events.insert(
            event.event_id.clone(),
            SubscriptionEvent {
                event_id: event.event_id.clone(),
                subscription_id: event.subscription_id.clone(),
                tenant_id: event.tenant_id.clone(),
                status: event.status.clone(),
                processed_at: OffsetDateTime::now_utc(),
            },
        );
        Ok(true)
    }

    async fn remove_subscription_event(&self, event_id: &str) -> Result<(), sqlx::Error> {
        self.subscription_events.lock().unwrap().remove(event_id);
        Ok(())
    }
}

#[async_trait]
impl ConsumptionAuditRepository for MockDb {
    async fn open_reservation(&self, reservation: &Reservation) -> Result<(), sqlx::Error> {
        self.audit_entries
            .lock()
            .unwrap()
            .push(ConsumptionAuditEntry::pending(reservation));
        Ok(())
    }

    async fn record_outcome(
        &self,
        report: &ConsumptionReport,
        reported_at: OffsetDateTime,
    ) -> Result<OutcomeRecord, sqlx::Error> {
        let mut entries = self.audit_entries.lock().unwrap();
        let Some(entry) = entries
            .iter_mut()
            .find(|entry| entry.id == report.reservation_id && entry.tenant_id == report.tenant_id)
        else {
            return Ok(OutcomeRecord::UnknownReservation);
        };
        if entry.outcome.is_some() {
            return Ok(OutcomeRecord::AlreadyReported);
        }
        entry.outcome = Some(report.outcome);
        entry.latency_ms = Some(report.latency_ms);
        entry.error = report.error.clone();
        entry.result_ref = report.result_ref.clone();
        entry.reported_at = Some(reported_at);
        Ok(OutcomeRecord::Recorded)
    }

    async fn list_for_tenant(
        &self,
        tenant_id: &str,
        from: Option<OffsetDateTime>,
        to: Option<OffsetDateTime>,
        limit: i64,
    ) -> Result<Vec<ConsumptionAuditEntry>, sqlx::Error> {
        let mut matching: Vec<ConsumptionAuditEntry> = self
            .audit_entries
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.tenant_id == tenant_id)
            .filter(|entry| from.map_or(true, |from| entry.created_at >= from))
            .filter(|entry| to.map_or(true, |to| entry.created_at < to))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(matching)
    }
}
