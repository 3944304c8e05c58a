use time::OffsetDateTime;
use tracing::info;

use crate::models::account::Account;
use crate::utils::billing_period::BillingPeriod;

use super::ledger::{Ledger, LedgerError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// The account was already stamped with the current period.
    Current { balance: i32 },
    /// The period rolled over; `balance` is the post-reset balance.
    Renewed { period: BillingPeriod, balance: i32 },
}

impl RenewalOutcome {
    pub fn balance(&self) -> i32 {
        match self {
            RenewalOutcome::Current { balance } | RenewalOutcome::Renewed { balance, .. } => {
                *balance
            }
        }
    }
}

/// Monthly quota reset. Balance is replaced with the quota, never added to,
/// and tenants without a plan are clamped to zero.
#[derive(Clone)]
pub struct RenewalPolicy {
    ledger: Ledger,
}

impl RenewalPolicy {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    pub async fn apply(
        &self,
        account: &Account,
        now: OffsetDateTime,
    ) -> Result<RenewalOutcome, LedgerError> {
        let period = BillingPeriod::containing(now);
        // A stored period ahead of `now` means clock skew; never reset backwards.
        if account.last_reset_period >= period {
            return Ok(RenewalOutcome::Current {
                balance: account.balance,
            });
        }

        // reset_to_quota re-checks the period itself, so racing callers
        // converge on a single reset.
        let reset = self
            .ledger
            .reset_to_quota(&account.tenant_id, &period)
            .await?;
        if !reset.renewed {
            return Ok(RenewalOutcome::Current {
                balance: reset.balance,
            });
        }
        let balance = reset.balance;
        info!(
            tenant_id = %account.tenant_id,
            previous_period = %account.last_reset_period,
            %period,
            monthly_quota = account.monthly_quota,
            balance,
            "applied renewal check for new billing period"
        );
        Ok(RenewalOutcome::Renewed { period, balance })
    }

    /// Loads the account fresh from the store and applies the policy.
    pub async fn apply_for(
        &self,
        tenant_id: &str,
        now: OffsetDateTime,
    ) -> Result<RenewalOutcome, LedgerError> {
        let account = self.ledger.account(tenant_id).await?;
        self.apply(&account, now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerSettings;
    use crate::db::mock_db::MockDb;
    use std::sync::Arc;
    use time::macros::datetime;

    fn setup(balance: i32, quota: i32, period: &str) -> (Arc<MockDb>, RenewalPolicy) {
        let mut account = Account::new(
            "shop-1",
            BillingPeriod::parse(period).unwrap(),
            OffsetDateTime::now_utc(),
        );
        account.balance = balance;
        account.monthly_quota = quota;
        let db = Arc::new(MockDb::default().with_account(account));
        let ledger = Ledger::new(db.clone(), &LedgerSettings::default());
        (db, RenewalPolicy::new(ledger))
    }

    #[tokio::test]
    async fn same_period_is_a_no_op() {
        let (db, policy) = setup(7, 50, "2024-01");
        let outcome = policy
            .apply_for("shop-1", datetime!(2024-01-31 23:59 UTC))
            .await
            .unwrap();
        assert_eq!(outcome, RenewalOutcome::Current { balance: 7 });
        assert_eq!(db.account("shop-1").unwrap().balance, 7);
    }

    #[tokio::test]
    async fn rollover_replaces_balance_with_quota() {
        let (db, policy) = setup(52, 50, "2024-01");
        let outcome = policy
            .apply_for("shop-1", datetime!(2024-02-01 00:00 UTC))
            .await
            .unwrap();
        assert_eq!(outcome.balance(), 50);
        let stored = db.account("shop-1").unwrap();
        assert_eq!(stored.balance, 50);
        assert_eq!(stored.last_reset_period.as_str(), "2024-02");
    }

    #[tokio::test]
    async fn rollover_without_plan_clamps_to_zero() {
        let (db, policy) = setup(9, 0, "2024-01");
        let outcome = policy
            .apply_for("shop-1", datetime!(2024-03-15 08:00 UTC))
            .await
            .unwrap();
        assert_eq!(outcome.balance(), 0);
        assert_eq!(db.account("shop-1").unwrap().balance, 0);
    }

    #[tokio::test]
    async fn stale_snapshot_does_not_reset_twice() {
        let (db, policy) = setup(20, 50, "2024-01");
        let stale = db.account("shop-1").unwrap();
        let now = datetime!(2024-02-02 10:00 UTC);

        policy.apply(&stale, now).await.unwrap();
        db.accounts.lock().unwrap().get_mut("shop-1").unwrap().balance -= 10;

        // A second caller still holding the pre-reset snapshot.
        let outcome = policy.apply(&stale, now).await.unwrap();
        assert_eq!(outcome, RenewalOutcome::Current { balance: 40 });
        assert_eq!(db.account("shop-1").unwrap().balance, 40);
    }

    #[tokio::test]
    async fn stored_period_ahead_of_clock_is_current() {
        let (db, policy) = setup(12, 50, "2024-03");
        let outcome = policy
            .apply_for("shop-1", datetime!(2024-02-28 23:59 UTC))
            .await
            .unwrap();
        assert_eq!(outcome, RenewalOutcome::Current { balance: 12 });
        let stored = db.account("shop-1").unwrap();
        assert_eq!(stored.balance, 12);
        assert_eq!(stored.last_reset_period.as_str(), "2024-03");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_renewals_converge() {
        let (db, policy) = setup(3, 50, "2024-01");
        let now = datetime!(2024-02-02 10:00 UTC);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let policy = policy.clone();
            handles.push(tokio::spawn(async move {
                policy.apply_for("shop-1", now).await.unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().balance(), 50);
        }
        assert_eq!(db.account("shop-1").unwrap().balance, 50);
    }
}
