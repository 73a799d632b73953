//! Property Reconciliation - bank statement matching for property payments.

pub mod config;
pub mod error;
pub mod models;
pub mod observability;
pub mod services;
pub mod startup;
