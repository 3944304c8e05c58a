use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "consumption_outcome")]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConsumptionOutcome {
    Success,
    Failure,
}

/// One metered attempt, keyed by the reservation id. The row is opened when
/// the credit is granted; `outcome` stays empty until the single report.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ConsumptionAuditEntry {
    pub id: Uuid,
    pub tenant_id: String,
    pub outcome: Option<ConsumptionOutcome>,
    pub latency_ms: Option<i64>,
    pub error: Option<String>,
    pub result_ref: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub reported_at: Option<OffsetDateTime>,
}

impl ConsumptionAuditEntry {
    pub fn pending(reservation: &Reservation) -> Self {
        Self {
            id: reservation.id,
            tenant_id: reservation.tenant_id.clone(),
            outcome: None,
            latency_ms: None,
            error: None,
            result_ref: None,
            created_at: reservation.reserved_at,
            reported_at: None,
        }
    }
}

/// What happened to an outcome report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeRecord {
    Recorded,
    AlreadyReported,
    /// No reservation with this id was granted to the tenant.
    UnknownReservation,
}

/// A granted credit reservation. The metered operation may only run while
/// holding one, and its outcome is reported exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: Uuid,
    pub tenant_id: String,
    pub remaining: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub reserved_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumptionReport {
    pub reservation_id: Uuid,
    pub tenant_id: String,
    pub outcome: ConsumptionOutcome,
    pub latency_ms: i64,
    pub error: Option<String>,
    pub result_ref: Option<String>,
}

impl ConsumptionReport {
    pub fn success(reservation: &Reservation, latency_ms: i64, result_ref: Option<String>) -> Self {
        Self {
            reservation_id: reservation.id,
            tenant_id: reservation.tenant_id.clone(),
            outcome: ConsumptionOutcome::Success,
            latency_ms,
            error: None,
            result_ref,
        }
    }

    pub fn failure(reservation: &Reservation, latency_ms: i64, error: impl Into<String>) -> Self {
        Self {
            reservation_id: reservation.id,
            tenant_id: reservation.tenant_id.clone(),
            outcome: ConsumptionOutcome::Failure,
            latency_ms,
            error: Some(error.into()),
            result_ref: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == ConsumptionOutcome::Success
    }
}
