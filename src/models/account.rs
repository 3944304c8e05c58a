use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use time::OffsetDateTime;

use crate::utils::billing_period::BillingPeriod;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "subscription_status")]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum SubscriptionStatus {
    None,
    Active,
    Cancelled,
    Expired,
    Declined,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::None => "NONE",
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::Cancelled => "CANCELLED",
            SubscriptionStatus::Expired => "EXPIRED",
            SubscriptionStatus::Declined => "DECLINED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub tenant_id: String,
    pub balance: i32,
    pub monthly_quota: i32,
    pub last_reset_period: BillingPeriod,
    pub lifetime_credits: i64,
    pub total_consumed: i64,
    pub total_conversions: i64,
    pub subscription_status: SubscriptionStatus,
    pub is_enabled: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Account {
    /// A freshly observed tenant: no balance, no plan.
    pub fn new(tenant_id: &str, period: BillingPeriod, now: OffsetDateTime) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            balance: 0,
            monthly_quota: 0,
            last_reset_period: period,
            lifetime_credits: 0,
            total_consumed: 0,
            total_conversions: 0,
            subscription_status: SubscriptionStatus::None,
            is_enabled: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of the conditional decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsumeResult {
    pub granted: bool,
    pub remaining: i32,
}

/// Result of a quota reset. `renewed` is false when the stored period was
/// already current (or ahead) and nothing changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaReset {
    pub balance: i32,
    pub renewed: bool,
}

/// Balance and quota after a crediting write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Credited {
    pub balance: i32,
    pub monthly_quota: i32,
}
