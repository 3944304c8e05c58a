use async_trait::async_trait;
use time::OffsetDateTime;

use crate::models::consumption::{
    ConsumptionAuditEntry, ConsumptionReport, OutcomeRecord, Reservation,
};

#[async_trait]
pub trait ConsumptionAuditRepository: Send + Sync {
    /// Opens the audit row for a granted reservation, without an outcome.
    async fn open_reservation(&self, reservation: &Reservation) -> Result<(), sqlx::Error>;

    /// Fills in the outcome of an open reservation. Only the first report for
    /// a reservation of the same tenant is recorded.
    async fn record_outcome(
        &self,
        report: &ConsumptionReport,
        reported_at: OffsetDateTime,
    ) -> Result<OutcomeRecord, sqlx::Error>;

    /// Entries for a tenant within `[from, to)`, newest first.
    async fn list_for_tenant(
        &self,
        tenant_id: &str,
        from: Option<OffsetDateTime>,
        to: Option<OffsetDateTime>,
        limit: i64,
    ) -> Result<Vec<ConsumptionAuditEntry>, sqlx::Error>;
}
