//! Application services: query registry, executor seam and dashboard reads.

pub mod dashboard;
pub mod error;
pub mod registry;
pub mod repos;
pub mod view;
