use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::consumption_audit_repository::ConsumptionAuditRepository;
use crate::models::consumption::{
    ConsumptionAuditEntry, ConsumptionReport, OutcomeRecord, Reservation,
};

use super::ledger::{Ledger, LedgerError};
use super::renewal::RenewalPolicy;

pub const DEFAULT_AUDIT_PAGE: i64 = 100;
pub const MAX_AUDIT_PAGE: i64 = 1_000;

#[derive(Debug, Error)]
pub enum ConsumptionError {
    #[error("insufficient credits (remaining {remaining})")]
    InsufficientCredits { remaining: i32 },
    #[error("metering is disabled for tenant `{0}`")]
    FeatureDisabled(String),
    #[error("no reservation `{0}` was granted to this tenant")]
    UnknownReservation(Uuid),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("audit log error: {0}")]
    Audit(sqlx::Error),
}

/// Guards a metered operation: renew if the period rolled over, then take
/// exactly one credit. Failed operations are not refunded.
#[derive(Clone)]
pub struct ConsumptionGate {
    ledger: Ledger,
    renewal: RenewalPolicy,
    audit: Arc<dyn ConsumptionAuditRepository>,
}

impl ConsumptionGate {
    pub fn new(
        ledger: Ledger,
        renewal: RenewalPolicy,
        audit: Arc<dyn ConsumptionAuditRepository>,
    ) -> Self {
        Self {
            ledger,
            renewal,
            audit,
        }
    }

    pub async fn try_consume(&self, tenant_id: &str) -> Result<Reservation, ConsumptionError> {
        self.try_consume_at(tenant_id, OffsetDateTime::now_utc())
            .await
    }

    pub async fn try_consume_at(
        &self,
        tenant_id: &str,
        now: OffsetDateTime,
    ) -> Result<Reservation, ConsumptionError> {
        let account = self.ledger.account(tenant_id).await?;
        if !account.is_enabled {
            return Err(ConsumptionError::FeatureDisabled(tenant_id.to_string()));
        }

        self.renewal.apply(&account, now).await?;

        let result = self.ledger.consume(tenant_id).await?;
        if !result.granted {
            info!(tenant_id, "denied metered call: no credits left");
            return Err(ConsumptionError::InsufficientCredits {
                remaining: result.remaining,
            });
        }

        let reservation = Reservation {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            remaining: result.remaining,
            reserved_at: now,
        };
        // The credit is spent either way; without the row the caller has
        // nothing to report against.
        if let Err(err) = self.audit.open_reservation(&reservation).await {
            error!(
                ?err,
                tenant_id,
                reservation_id = %reservation.id,
                "failed to open reservation audit row"
            );
            return Err(ConsumptionError::Audit(err));
        }
        Ok(reservation)
    }

    /// Records the outcome of a granted reservation. Returns `false` when the
    /// reservation was already reported; an id never granted to the tenant
    /// is `UnknownReservation`.
    pub async fn record_outcome(&self, report: &ConsumptionReport) -> Result<bool, ConsumptionError> {
        self.record_outcome_at(report, OffsetDateTime::now_utc())
            .await
    }

    pub async fn record_outcome_at(
        &self,
        report: &ConsumptionReport,
        now: OffsetDateTime,
    ) -> Result<bool, ConsumptionError> {
        let record = self
            .audit
            .record_outcome(report, now)
            .await
            .map_err(ConsumptionError::Audit)?;
        match record {
            OutcomeRecord::Recorded => {
                if report.is_success() {
                    self.ledger.note_consumed(&report.tenant_id).await;
                }
                Ok(true)
            }
            OutcomeRecord::AlreadyReported => {
                warn!(
                    tenant_id = %report.tenant_id,
                    reservation_id = %report.reservation_id,
                    "ignoring repeated outcome report"
                );
                Ok(false)
            }
            OutcomeRecord::UnknownReservation => {
                warn!(
                    tenant_id = %report.tenant_id,
                    reservation_id = %report.reservation_id,
                    "rejecting outcome for unknown reservation"
                );
                Err(ConsumptionError::UnknownReservation(report.reservation_id))
            }
        }
    }

    /// Reserves a credit, runs `operation`, and records its outcome. The
    /// operation's own result is handed back untouched.
    pub async fn run_metered<F, E>(
        &self,
        tenant_id: &str,
        operation: F,
    ) -> Result<Result<Option<String>, E>, ConsumptionError>
    where
        F: Future<Output = Result<Option<String>, E>>,
        E: std::fmt::Display,
    {
        let reservation = self.try_consume(tenant_id).await?;
        let started = Instant::now();
        let result = operation.await;
        let latency_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        let report = match &result {
            Ok(result_ref) => ConsumptionReport::success(&reservation, latency_ms, result_ref.clone()),
            Err(err) => ConsumptionReport::failure(&reservation, latency_ms, err.to_string()),
        };
        // The credit is already spent; an audit failure must not hide the result.
        if let Err(err) = self.record_outcome(&report).await {
            warn!(
                ?err,
                tenant_id,
                reservation_id = %reservation.id,
                "failed to record metered call outcome"
            );
        }
        Ok(result)
    }

    pub async fn audit_for_tenant(
        &self,
        tenant_id: &str,
        from: Option<OffsetDateTime>,
        to: Option<OffsetDateTime>,
        limit: Option<i64>,
    ) -> Result<Vec<ConsumptionAuditEntry>, ConsumptionError> {
        let limit = limit.unwrap_or(DEFAULT_AUDIT_PAGE).clamp(1, MAX_AUDIT_PAGE);
        self.audit
            .list_for_tenant(tenant_id, from, to, limit)
            .await
            .map_err(ConsumptionError::Audit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerSettings;
    use crate::db::mock_db::MockDb;
    use crate::models::account::Account;
    use crate::models::consumption::ConsumptionOutcome;
    use crate::models::plan::PlanCatalog;
    use crate::services::purchase::{PurchaseAccumulator, PurchaseRequest};
    use crate::utils::billing_period::BillingPeriod;
    use time::macros::datetime;

    fn gate(db: Arc<MockDb>) -> ConsumptionGate {
        let ledger = Ledger::new(db.clone(), &LedgerSettings::default());
        ConsumptionGate::new(ledger.clone(), RenewalPolicy::new(ledger), db)
    }

    fn seeded(balance: i32, quota: i32, period: &str) -> Arc<MockDb> {
        let mut account = Account::new(
            "shop-1",
            BillingPeriod::parse(period).unwrap(),
            OffsetDateTime::now_utc(),
        );
        account.balance = balance;
        account.monthly_quota = quota;
        Arc::new(MockDb::default().with_account(account))
    }

    #[tokio::test]
    async fn purchase_then_rollover_then_consume() {
        let db = seeded(2, 0, "2024-01");
        let ledger = Ledger::new(db.clone(), &LedgerSettings::default());
        let purchases =
            PurchaseAccumulator::new(ledger, db.clone(), Arc::new(PlanCatalog::default()));
        let gate = gate(db.clone());

        let outcome = purchases
            .confirm_at(
                &PurchaseRequest {
                    tenant_id: "shop-1".into(),
                    plan_id: "starter".into(),
                    charge_id: "c1".into(),
                },
                datetime!(2024-01-20 09:00 UTC),
            )
            .await
            .unwrap();
        assert_eq!(outcome.balance(), 52);

        // First call of February resets to quota before taking a credit.
        let reservation = gate
            .try_consume_at("shop-1", datetime!(2024-02-01 00:05 UTC))
            .await
            .unwrap();
        assert_eq!(reservation.remaining, 49);

        let stored = db.account("shop-1").unwrap();
        assert_eq!(stored.balance, 49);
        assert_eq!(stored.last_reset_period.as_str(), "2024-02");
    }

    #[tokio::test]
    async fn empty_balance_is_denied_without_writes() {
        let db = seeded(0, 0, "2024-01");
        let err = gate(db.clone())
            .try_consume_at("shop-1", datetime!(2024-01-10 10:00 UTC))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConsumptionError::InsufficientCredits { remaining: 0 }
        ));
        let stored = db.account("shop-1").unwrap();
        assert_eq!(stored.balance, 0);
        assert_eq!(stored.total_consumed, 0);
        assert!(db.audit_entries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_tenant_is_not_found() {
        let err = gate(Arc::new(MockDb::default()))
            .try_consume("ghost")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConsumptionError::Ledger(LedgerError::TenantNotFound(_))
        ));
    }

    #[tokio::test]
    async fn disabled_tenant_is_rejected() {
        let db = seeded(10, 50, "2024-01");
        db.accounts
            .lock()
            .unwrap()
            .get_mut("shop-1")
            .unwrap()
            .is_enabled = false;
        let err = gate(db.clone())
            .try_consume_at("shop-1", datetime!(2024-01-10 10:00 UTC))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumptionError::FeatureDisabled(_)));
        assert_eq!(db.account("shop-1").unwrap().balance, 10);
    }

    #[tokio::test]
    async fn failed_operation_keeps_the_credit_spent() {
        let db = seeded(3, 0, &BillingPeriod::current().to_string());
        let gate = gate(db.clone());

        let result = gate
            .run_metered("shop-1", async { Err::<Option<String>, _>("upstream timed out") })
            .await
            .unwrap();
        assert_eq!(result, Err("upstream timed out"));

        let stored = db.account("shop-1").unwrap();
        assert_eq!(stored.balance, 2);
        assert_eq!(stored.total_consumed, 0);

        let entries = db.audit_entries.lock().unwrap().clone();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, Some(ConsumptionOutcome::Failure));
        assert_eq!(entries[0].error.as_deref(), Some("upstream timed out"));
    }

    #[tokio::test]
    async fn successful_operation_is_counted() {
        let db = seeded(3, 0, &BillingPeriod::current().to_string());
        let gate = gate(db.clone());

        let result = gate
            .run_metered("shop-1", async {
                Ok::<_, String>(Some("img_42".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(result, Ok(Some("img_42".to_string())));

        let stored = db.account("shop-1").unwrap();
        assert_eq!(stored.balance, 2);
        assert_eq!(stored.total_consumed, 1);
        let entries = db.audit_entries.lock().unwrap().clone();
        assert_eq!(entries[0].result_ref.as_deref(), Some("img_42"));
    }

    #[tokio::test]
    async fn metered_call_without_credit_never_runs() {
        let db = seeded(0, 0, &BillingPeriod::current().to_string());
        let ran = std::sync::atomic::AtomicBool::new(false);
        let err = gate(db)
            .run_metered("shop-1", async {
                ran.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<Option<String>, String>(None)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumptionError::InsufficientCredits { .. }));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn outcome_is_recorded_once_per_reservation() {
        let db = seeded(3, 0, "2024-01");
        let gate = gate(db.clone());
        let now = datetime!(2024-01-10 10:00 UTC);
        let reservation = gate.try_consume_at("shop-1", now).await.unwrap();
        let report = ConsumptionReport::success(&reservation, 120, None);

        assert!(gate.record_outcome_at(&report, now).await.unwrap());
        assert!(!gate.record_outcome_at(&report, now).await.unwrap());

        assert_eq!(db.account("shop-1").unwrap().total_consumed, 1);
        assert_eq!(db.audit_entries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn granted_reservation_opens_a_pending_entry() {
        let db = seeded(3, 0, "2024-01");
        let now = datetime!(2024-01-10 10:00 UTC);
        let reservation = gate(db.clone()).try_consume_at("shop-1", now).await.unwrap();

        let entries = db.audit_entries.lock().unwrap().clone();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, reservation.id);
        assert_eq!(entries[0].outcome, None);
        assert_eq!(entries[0].created_at, now);
    }

    #[tokio::test]
    async fn outcome_for_ungranted_reservation_is_rejected() {
        let db = Arc::new(MockDb::default());
        let gate = gate(db.clone());
        let report = ConsumptionReport {
            reservation_id: Uuid::new_v4(),
            tenant_id: "ghost".into(),
            outcome: ConsumptionOutcome::Success,
            latency_ms: 10,
            error: None,
            result_ref: None,
        };

        let err = gate.record_outcome(&report).await.unwrap_err();
        assert!(matches!(
            err,
            ConsumptionError::UnknownReservation(id) if id == report.reservation_id
        ));
        assert!(db.audit_entries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn outcome_cannot_target_another_tenants_reservation() {
        let db = seeded(3, 0, "2024-01");
        let gate = gate(db.clone());
        let now = datetime!(2024-01-10 10:00 UTC);
        let reservation = gate.try_consume_at("shop-1", now).await.unwrap();

        let mut report = ConsumptionReport::success(&reservation, 10, None);
        report.tenant_id = "shop-2".into();
        assert!(matches!(
            gate.record_outcome_at(&report, now).await,
            Err(ConsumptionError::UnknownReservation(_))
        ));
        assert_eq!(db.audit_entries.lock().unwrap()[0].outcome, None);
        assert_eq!(db.account("shop-1").unwrap().total_consumed, 0);
    }

    #[tokio::test]
    async fn purchase_surplus_is_discarded_by_a_later_renewal() {
        // Last renewed in January; the purchase in February adds to the
        // balance but does not stamp the period, so the first metered call
        // of February replaces the balance with the quota.
        let db = seeded(50, 50, "2024-01");
        let ledger = Ledger::new(db.clone(), &LedgerSettings::default());
        let purchases =
            PurchaseAccumulator::new(ledger, db.clone(), Arc::new(PlanCatalog::default()));

        let outcome = purchases
            .confirm_at(
                &PurchaseRequest {
                    tenant_id: "shop-1".into(),
                    plan_id: "starter".into(),
                    charge_id: "c-feb".into(),
                },
                datetime!(2024-02-03 09:00 UTC),
            )
            .await
            .unwrap();
        assert_eq!(outcome.balance(), 100);

        let reservation = gate(db.clone())
            .try_consume_at("shop-1", datetime!(2024-02-03 10:00 UTC))
            .await
            .unwrap();
        assert_eq!(reservation.remaining, 49);
        assert_eq!(db.account("shop-1").unwrap().lifetime_credits, 50);
    }

    #[tokio::test]
    async fn audit_listing_is_filtered_and_newest_first() {
        let db = seeded(10, 0, "2024-01");
        let gate = gate(db.clone());
        let times = [
            datetime!(2024-01-05 10:00 UTC),
            datetime!(2024-01-06 10:00 UTC),
            datetime!(2024-01-07 10:00 UTC),
        ];
        for at in times {
            let reservation = gate.try_consume_at("shop-1", at).await.unwrap();
            gate.record_outcome_at(&ConsumptionReport::success(&reservation, 5, None), at)
                .await
                .unwrap();
        }

        let entries = gate
            .audit_for_tenant("shop-1", Some(times[1]), None, None)
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].created_at, times[2]);
        assert_eq!(entries[1].created_at, times[1]);

        let limited = gate
            .audit_for_tenant("shop-1", None, None, Some(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].created_at, times[2]);
    }
}
