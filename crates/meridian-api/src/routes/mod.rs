//! API route modules.

pub mod bridges;
pub mod federation;
pub mod health;
pub mod key_audits;
pub mod peers;
pub mod receipts;
