use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::models::consumption::{
    ConsumptionAuditEntry, ConsumptionReport, OutcomeRecord, Reservation,
};

use super::consumption_audit_repository::ConsumptionAuditRepository;

pub struct PostgresConsumptionAuditRepository {
    pub pool: PgPool,
}

#[async_trait]
impl ConsumptionAuditRepository for PostgresConsumptionAuditRepository {
    async fn open_reservation(&self, reservation: &Reservation) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO consumption_audit (id, tenant_id, created_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(reservation.id)
        .bind(&reservation.tenant_id)
        .bind(reservation.reserved_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_outcome(
        &self,
        report: &ConsumptionReport,
        reported_at: OffsetDateTime,
    ) -> Result<OutcomeRecord, sqlx::Error> {
        let updated = sqlx::query(
            r#"
            UPDATE consumption_audit
            SET outcome = $3, latency_ms = $4, error = $5, result_ref = $6, reported_at = $7
            WHERE id = $1 AND tenant_id = $2 AND outcome IS NULL
            "#,
        )
        .bind(report.reservation_id)
        .bind(&report.tenant_id)
        .bind(report.outcome)
        .bind(report.latency_ms)
        .bind(&report.error)
        .bind(&report.result_ref)
        .bind(reported_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 1 {
            return Ok(OutcomeRecord::Recorded);
        }

        // Nothing updated; the read only tells a repeat from a bogus id.
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM consumption_audit WHERE id = $1 AND tenant_id = $2)",
        )
        .bind(report.reservation_id)
        .bind(&report.tenant_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(if exists {
            OutcomeRecord::AlreadyReported
        } else {
            OutcomeRecord::UnknownReservation
        })
    }

    async fn list_for_tenant(
        &self,
        tenant_id: &str,
        from: Option<OffsetDateTime>,
        to: Option<OffsetDateTime>,
        limit: i64,
    ) -> Result<Vec<ConsumptionAuditEntry>, sqlx::Error> {
        sqlx::query_as::<_, ConsumptionAuditEntry>(
            r#"
            SELECT id, tenant_id, outcome, latency_ms, error, result_ref, created_at, reported_at
            FROM consumption_audit
            WHERE tenant_id = $1
              AND ($2::TIMESTAMPTZ IS NULL OR created_at >= $2)
              AND ($3::TIMESTAMPTZ IS NULL OR created_at < $3)
            ORDER BY created_at DESC
            LIMIT $4
            "#,
        )
        .bind(tenant_id)
        .bind(from)
        .bind(to)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }
}
