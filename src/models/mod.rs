pub mod account;
pub mod billing_event;
pub mod consumption;
pub mod plan;
