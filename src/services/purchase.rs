use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::db::billing_event_log_repository::BillingEventLogRepository;
use crate::models::billing_event::NewPurchaseEvent;
use crate::models::plan::PlanCatalog;

use super::ledger::{Ledger, LedgerError};

#[derive(Debug, Error)]
pub enum PurchaseError {
    #[error("unknown plan `{0}`")]
    UnknownPlan(String),
    #[error("purchase request is missing `{0}`")]
    MissingField(&'static str),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRequest {
    pub tenant_id: String,
    pub plan_id: String,
    pub charge_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurchaseOutcome {
    Applied { balance: i32, quota_set: i32 },
    /// The charge was credited before; nothing changed.
    Duplicate { balance: i32, quota_set: i32 },
}

impl PurchaseOutcome {
    pub fn balance(&self) -> i32 {
        match self {
            PurchaseOutcome::Applied { balance, .. } | PurchaseOutcome::Duplicate { balance, .. } => {
                *balance
            }
        }
    }

    pub fn quota_set(&self) -> i32 {
        match self {
            PurchaseOutcome::Applied { quota_set, .. }
            | PurchaseOutcome::Duplicate { quota_set, .. } => *quota_set,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, PurchaseOutcome::Duplicate { .. })
    }
}

/// Credits a plan purchase at most once per charge id. Purchased credits are
/// added to whatever balance the tenant already holds.
#[derive(Clone)]
pub struct PurchaseAccumulator {
    ledger: Ledger,
    events: Arc<dyn BillingEventLogRepository>,
    plans: Arc<PlanCatalog>,
}

impl PurchaseAccumulator {
    pub fn new(
        ledger: Ledger,
        events: Arc<dyn BillingEventLogRepository>,
        plans: Arc<PlanCatalog>,
    ) -> Self {
        Self {
            ledger,
            events,
            plans,
        }
    }

    pub async fn confirm(&self, request: &PurchaseRequest) -> Result<PurchaseOutcome, PurchaseError> {
        self.confirm_at(request, OffsetDateTime::now_utc()).await
    }

    pub async fn confirm_at(
        &self,
        request: &PurchaseRequest,
        now: OffsetDateTime,
    ) -> Result<PurchaseOutcome, PurchaseError> {
        let tenant_id = request.tenant_id.trim();
        let charge_id = request.charge_id.trim();
        if tenant_id.is_empty() {
            return Err(PurchaseError::MissingField("tenantId"));
        }
        if charge_id.is_empty() {
            return Err(PurchaseError::MissingField("chargeId"));
        }
        let plan = self
            .plans
            .lookup(&request.plan_id)
            .ok_or_else(|| PurchaseError::UnknownPlan(request.plan_id.clone()))?;

        let marker = NewPurchaseEvent {
            charge_id: charge_id.to_string(),
            tenant_id: tenant_id.to_string(),
            plan_id: plan.id.clone(),
            credits: plan.credits,
        };
        if !self.events.record_purchase_event(&marker).await? {
            let (balance, quota_set) = match self.ledger.find_account(tenant_id).await? {
                Some(account) => (account.balance, account.monthly_quota),
                None => (0, 0),
            };
            info!(
                tenant_id,
                charge_id, balance, "ignoring already credited purchase confirmation"
            );
            return Ok(PurchaseOutcome::Duplicate { balance, quota_set });
        }

        let credited = match self
            .ledger
            .credit(tenant_id, plan.credits, Some(plan.credits), now)
            .await
        {
            Ok(credited) => credited,
            Err(err) => {
                error!(?err, tenant_id, charge_id, "failed to credit purchase");
                // Let a retried confirmation apply the charge.
                if let Err(release_err) = self.events.remove_purchase_event(charge_id).await {
                    warn!(
                        ?release_err,
                        tenant_id, charge_id, "failed to release purchase marker"
                    );
                }
                return Err(err.into());
            }
        };
        self.ledger.note_conversion(tenant_id).await;

        info!(
            tenant_id,
            charge_id,
            plan_id = %plan.id,
            credits = plan.credits,
            balance = credited.balance,
            "credited plan purchase"
        );
        Ok(PurchaseOutcome::Applied {
            balance: credited.balance,
            quota_set: credited.monthly_quota,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerSettings;
    use crate::db::mock_db::MockDb;
    use crate::models::account::Account;
    use crate::utils::billing_period::BillingPeriod;
    use std::sync::atomic::Ordering;
    use time::macros::datetime;

    fn accumulator(db: Arc<MockDb>) -> PurchaseAccumulator {
        let ledger = Ledger::new(db.clone(), &LedgerSettings::default());
        PurchaseAccumulator::new(ledger, db, Arc::new(PlanCatalog::default()))
    }

    fn request(tenant_id: &str, plan_id: &str, charge_id: &str) -> PurchaseRequest {
        PurchaseRequest {
            tenant_id: tenant_id.into(),
            plan_id: plan_id.into(),
            charge_id: charge_id.into(),
        }
    }

    fn seeded(balance: i32) -> Arc<MockDb> {
        let mut account = Account::new(
            "shop-1",
            BillingPeriod::parse("2024-01").unwrap(),
            OffsetDateTime::now_utc(),
        );
        account.balance = balance;
        Arc::new(MockDb::default().with_account(account))
    }

    #[tokio::test]
    async fn purchase_adds_to_existing_balance() {
        let db = seeded(2);
        let outcome = accumulator(db.clone())
            .confirm_at(
                &request("shop-1", "starter", "c1"),
                datetime!(2024-01-20 09:00 UTC),
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            PurchaseOutcome::Applied {
                balance: 52,
                quota_set: 50
            }
        );
        let stored = db.account("shop-1").unwrap();
        assert_eq!(stored.balance, 52);
        assert_eq!(stored.monthly_quota, 50);
        assert_eq!(stored.total_conversions, 1);
    }

    #[tokio::test]
    async fn same_charge_is_credited_once() {
        let db = seeded(2);
        let purchases = accumulator(db.clone());
        let now = datetime!(2024-01-20 09:00 UTC);

        purchases
            .confirm_at(&request("shop-1", "starter", "c1"), now)
            .await
            .unwrap();
        let replay = purchases
            .confirm_at(&request("shop-1", "starter", "c1"), now)
            .await
            .unwrap();

        assert!(replay.is_duplicate());
        assert_eq!(replay.balance(), 52);
        assert_eq!(replay.quota_set(), 50);
        assert_eq!(db.account("shop-1").unwrap().balance, 52);
        assert_eq!(db.account("shop-1").unwrap().total_conversions, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_confirmations_credit_once() {
        let db = seeded(0);
        let purchases = accumulator(db.clone());
        let now = datetime!(2024-01-20 09:00 UTC);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let purchases = purchases.clone();
            handles.push(tokio::spawn(async move {
                purchases
                    .confirm_at(&request("shop-1", "growth", "ch_same"), now)
                    .await
                    .unwrap()
            }));
        }
        let mut applied = 0;
        for handle in handles {
            if !handle.await.unwrap().is_duplicate() {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
        assert_eq!(db.account("shop-1").unwrap().balance, 200);
    }

    #[tokio::test]
    async fn first_purchase_creates_the_account() {
        let db = Arc::new(MockDb::default());
        let outcome = accumulator(db.clone())
            .confirm_at(
                &request("new-shop", "pro", "c9"),
                datetime!(2024-05-01 00:00 UTC),
            )
            .await
            .unwrap();
        assert_eq!(outcome.balance(), 1000);
        let stored = db.account("new-shop").unwrap();
        assert_eq!(stored.last_reset_period.as_str(), "2024-05");
    }

    #[tokio::test]
    async fn unknown_plan_writes_nothing() {
        let db = seeded(2);
        let err = accumulator(db.clone())
            .confirm(&request("shop-1", "enterprise", "c1"))
            .await
            .unwrap_err();
        assert!(matches!(err, PurchaseError::UnknownPlan(ref p) if p == "enterprise"));
        assert!(db.purchase_events.lock().unwrap().is_empty());
        assert_eq!(db.account("shop-1").unwrap().balance, 2);
    }

    #[tokio::test]
    async fn blank_charge_id_is_rejected() {
        let db = seeded(2);
        let err = accumulator(db)
            .confirm(&request("shop-1", "starter", "  "))
            .await
            .unwrap_err();
        assert!(matches!(err, PurchaseError::MissingField("chargeId")));
    }

    #[tokio::test]
    async fn failed_credit_releases_the_marker_for_retry() {
        let db = seeded(2);
        let purchases = accumulator(db.clone());
        let now = datetime!(2024-01-20 09:00 UTC);

        db.should_fail.store(true, Ordering::SeqCst);
        assert!(purchases
            .confirm_at(&request("shop-1", "starter", "c1"), now)
            .await
            .is_err());
        assert!(db.purchase_events.lock().unwrap().is_empty());

        db.should_fail.store(false, Ordering::SeqCst);
        let outcome = purchases
            .confirm_at(&request("shop-1", "starter", "c1"), now)
            .await
            .unwrap();
        assert!(!outcome.is_duplicate());
        assert_eq!(outcome.balance(), 52);
    }
}
