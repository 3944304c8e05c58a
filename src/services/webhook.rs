use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::db::billing_event_log_repository::BillingEventLogRepository;
use crate::models::account::SubscriptionStatus;
use crate::models::billing_event::NewSubscriptionEvent;

use super::ledger::{Ledger, LedgerError};

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook payload invalid: {0}")]
    PayloadInvalid(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Lifecycle status as reported by the billing provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookStatus {
    Active,
    Cancelled,
    Expired,
    Declined,
    /// Statuses the ledger does not act on (PENDING, FROZEN, ...).
    Other(String),
}

impl WebhookStatus {
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_uppercase();
        match normalized.as_str() {
            "ACTIVE" => WebhookStatus::Active,
            "CANCELLED" | "CANCELED" => WebhookStatus::Cancelled,
            "EXPIRED" => WebhookStatus::Expired,
            "DECLINED" => WebhookStatus::Declined,
            _ => WebhookStatus::Other(normalized),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            WebhookStatus::Active => "ACTIVE",
            WebhookStatus::Cancelled => "CANCELLED",
            WebhookStatus::Expired => "EXPIRED",
            WebhookStatus::Declined => "DECLINED",
            WebhookStatus::Other(raw) => raw.as_str(),
        }
    }

    fn terminal_status(&self) -> Option<SubscriptionStatus> {
        match self {
            WebhookStatus::Cancelled => Some(SubscriptionStatus::Cancelled),
            WebhookStatus::Expired => Some(SubscriptionStatus::Expired),
            WebhookStatus::Declined => Some(SubscriptionStatus::Declined),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionWebhookPayload {
    #[serde(default)]
    pub subscription_event_id: Option<String>,
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub plan_quota: Option<i32>,
    /// Provider version or timestamp of the status change.
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// A payload that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionChange {
    pub event_id: String,
    pub subscription_id: Option<String>,
    pub tenant_id: String,
    pub status: WebhookStatus,
    pub plan_quota: Option<i32>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl SubscriptionChange {
    pub fn from_payload(payload: SubscriptionWebhookPayload) -> Result<Self, WebhookError> {
        let tenant_id = payload.tenant_id.trim().to_string();
        if tenant_id.is_empty() {
            return Err(WebhookError::PayloadInvalid("missing tenantId".into()));
        }
        if payload.status.trim().is_empty() {
            return Err(WebhookError::PayloadInvalid("missing status".into()));
        }
        let status = WebhookStatus::parse(&payload.status);

        if status == WebhookStatus::Active && payload.plan_quota.is_none() {
            return Err(WebhookError::PayloadInvalid(
                "ACTIVE event without planQuota".into(),
            ));
        }
        if matches!(payload.plan_quota, Some(quota) if quota < 0) {
            return Err(WebhookError::PayloadInvalid(
                "planQuota must not be negative".into(),
            ));
        }

        let subscription_id = non_empty(payload.subscription_id.as_deref()).map(str::to_string);
        // Identity is the provider's event id, or subscription + status + version.
        let event_id = match non_empty(payload.subscription_event_id.as_deref()) {
            Some(id) => id.to_string(),
            None => match (
                subscription_id.as_deref(),
                non_empty(payload.updated_at.as_deref()),
            ) {
                (Some(sub), Some(version)) => format!("{}:{}:{}", sub, status.as_str(), version),
                _ => {
                    return Err(WebhookError::PayloadInvalid(
                        "missing subscriptionEventId (or subscriptionId and updatedAt)".into(),
                    ))
                }
            },
        };

        Ok(Self {
            event_id,
            subscription_id,
            tenant_id,
            status,
            plan_quota: payload.plan_quota,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied {
        tenant_id: String,
        status: WebhookStatus,
        balance: i32,
        monthly_quota: i32,
    },
    /// Receipt recorded; the status does not touch the ledger.
    Recorded {
        tenant_id: String,
        status: WebhookStatus,
    },
    Duplicate {
        event_id: String,
    },
}

/// Applies subscription lifecycle events to the ledger, once per event
/// identity. Events are not sequenced by version.
#[derive(Clone)]
pub struct WebhookReconciler {
    ledger: Ledger,
    events: Arc<dyn BillingEventLogRepository>,
    free_tier_quota: i32,
}

impl WebhookReconciler {
    pub fn new(
        ledger: Ledger,
        events: Arc<dyn BillingEventLogRepository>,
        free_tier_quota: i32,
    ) -> Self {
        Self {
            ledger,
            events,
            free_tier_quota,
        }
    }

    pub async fn reconcile(&self, body: &[u8]) -> Result<WebhookOutcome, WebhookError> {
        self.reconcile_at(body, OffsetDateTime::now_utc()).await
    }

    pub async fn reconcile_at(
        &self,
        body: &[u8],
        now: OffsetDateTime,
    ) -> Result<WebhookOutcome, WebhookError> {
        let payload: SubscriptionWebhookPayload = serde_json::from_slice(body)
            .map_err(|e| WebhookError::PayloadInvalid(e.to_string()))?;
        let change = SubscriptionChange::from_payload(payload)?;
        self.apply(change, now).await
    }

    pub async fn apply(
        &self,
        change: SubscriptionChange,
        now: OffsetDateTime,
    ) -> Result<WebhookOutcome, WebhookError> {
        let marker = NewSubscriptionEvent {
            event_id: change.event_id.clone(),
            subscription_id: change.subscription_id.clone(),
            tenant_id: change.tenant_id.clone(),
            status: change.status.as_str().to_string(),
        };
        if !self.events.record_subscription_event(&marker).await? {
            info!(
                event_id = %change.event_id,
                tenant_id = %change.tenant_id,
                "dropping duplicate subscription event"
            );
            return Ok(WebhookOutcome::Duplicate {
                event_id: change.event_id,
            });
        }

        match self.apply_to_ledger(&change, now).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                error!(
                    ?err,
                    event_id = %change.event_id,
                    tenant_id = %change.tenant_id,
                    "failed to apply subscription event"
                );
                // A redelivery should get another chance.
                if let Err(release_err) = self
                    .events
                    .remove_subscription_event(&change.event_id)
                    .await
                {
                    warn!(
                        ?release_err,
                        event_id = %change.event_id,
                        "failed to release subscription event marker"
                    );
                }
                Err(err)
            }
        }
    }

    async fn apply_to_ledger(
        &self,
        change: &SubscriptionChange,
        now: OffsetDateTime,
    ) -> Result<WebhookOutcome, WebhookError> {
        let tenant_id = change.tenant_id.as_str();

        if change.status == WebhookStatus::Active {
            let quota = change.plan_quota.unwrap_or_default();
            let credited = self.ledger.activate(tenant_id, quota, now).await?;
            self.ledger.note_conversion(tenant_id).await;
            info!(
                tenant_id,
                quota,
                balance = credited.balance,
                "activated subscription"
            );
            return Ok(WebhookOutcome::Applied {
                tenant_id: tenant_id.to_string(),
                status: change.status.clone(),
                balance: credited.balance,
                monthly_quota: credited.monthly_quota,
            });
        }

        if let Some(terminal) = change.status.terminal_status() {
            let credited = self
                .ledger
                .demote(tenant_id, self.free_tier_quota, terminal, now)
                .await?;
            info!(
                tenant_id,
                status = terminal.as_str(),
                free_tier_quota = self.free_tier_quota,
                balance = credited.balance,
                "demoted tenant to free tier"
            );
            return Ok(WebhookOutcome::Applied {
                tenant_id: tenant_id.to_string(),
                status: change.status.clone(),
                balance: credited.balance,
                monthly_quota: credited.monthly_quota,
            });
        }

        info!(
            tenant_id,
            status = change.status.as_str(),
            "recorded subscription event without ledger change"
        );
        Ok(WebhookOutcome::Recorded {
            tenant_id: tenant_id.to_string(),
            status: change.status.clone(),
        })
    }
}
