//! Core data models for the chunked-object ledger.
//!
//! These entities describe a logical file and the ordered parts it was split
//! into. They map onto ledger tables via `sqlx::FromRow` and serialize as JSON
//! via `serde` for the CLI.

pub mod file_object;
pub mod part;
