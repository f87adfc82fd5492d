//! Database module for fleetdeploy.
//!
//! Provides SQLite storage with an embedded schema migration.

mod deployments;
mod models;
mod store;

#[cfg(test)]
pub(crate) mod fixtures;

pub use deployments::*;
pub use models::*;
pub use store::*;
