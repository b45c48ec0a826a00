//! Database module for fleetwatch.
//!
//! Provides SQLite storage for hosts, users, alert rules and tiered stats records.

mod models;
mod store;

pub use models::*;
pub use store::*;
