//! Domain layer types and invariants.

pub mod error;
pub mod queries;
pub mod table;
pub mod types;
