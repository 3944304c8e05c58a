pub mod consumption;
pub mod ledger;
pub mod purchase;
pub mod renewal;
pub mod webhook;
