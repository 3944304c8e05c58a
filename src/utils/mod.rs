pub mod billing_period;
pub mod webhook_signature;
