//! fleetwatch: a lightweight fleet monitor.
//!
//! Agents collect host metrics and serve them over an authenticated
//! channel; the hub polls every agent, tracks up/down status, sends delayed
//! connectivity alerts and keeps tiered history.

pub mod agent;
pub mod alerts;
pub mod collector;
pub mod config;
pub mod db;
pub mod hub;
pub mod records;
pub mod stats;
pub mod systems;
pub mod transport;
pub mod web;
