use std::sync::Arc;

use crate::config::Config;
use crate::db::{
    account_repository::AccountRepository,
    billing_event_log_repository::BillingEventLogRepository,
    consumption_audit_repository::ConsumptionAuditRepository,
};
use crate::services::{
    consumption::ConsumptionGate, ledger::Ledger, purchase::PurchaseAccumulator,
    renewal::RenewalPolicy, webhook::WebhookReconciler,
};

#[derive(Clone)]
pub struct AppState {
    pub accounts: Arc<dyn AccountRepository>,
    pub billing_events: Arc<dyn BillingEventLogRepository>,
    pub audit_log: Arc<dyn ConsumptionAuditRepository>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn ledger(&self) -> Ledger {
        Ledger::new(self.accounts.clone(), &self.config.ledger)
    }

    pub fn renewal(&self) -> RenewalPolicy {
        RenewalPolicy::new(self.ledger())
    }

    pub fn consumption_gate(&self) -> ConsumptionGate {
        ConsumptionGate::new(self.ledger(), self.renewal(), self.audit_log.clone())
    }

    pub fn purchases(&self) -> PurchaseAccumulator {
        PurchaseAccumulator::new(
            self.ledger(),
            self.billing_events.clone(),
            Arc::new(self.config.plans.clone()),
        )
    }

    pub fn reconciler(&self) -> WebhookReconciler {
        WebhookReconciler::new(
            self.ledger(),
            self.billing_events.clone(),
            self.config.ledger.free_tier_quota,
        )
    }
}

#[cfg(test)]
pub fn test_config(webhook_secret: Option<&str>) -> Arc<Config> {
    use crate::config::LedgerSettings;
    use crate::models::plan::PlanCatalog;

    Arc::new(Config {
        database_url: String::new(),
        database_max_connections: 1,
        bind_addr: ([127, 0, 0, 1], 0).into(),
        ledger: LedgerSettings::default(),
        plans: PlanCatalog::default(),
        webhook_secret: webhook_secret.map(str::to_string),
    })
}

#[cfg(test)]
pub fn test_state(db: Arc<crate::db::mock_db::MockDb>, webhook_secret: Option<&str>) -> AppState {
    AppState {
        accounts: db.clone(),
        billing_events: db.clone(),
        audit_log: db,
        config: test_config(webhook_secret),
    }
}
