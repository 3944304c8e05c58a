pub mod account_repository;
pub mod billing_event_log_repository;
pub mod consumption_audit_repository;
pub mod mock_db;
pub mod postgres_account_repository;
pub mod postgres_billing_event_log_repository;
pub mod postgres_consumption_audit_repository;
