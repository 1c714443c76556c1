//! Database module: row views and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: row views returned by repositories.
//! - `repo`: SQL-only functions for the share queue and endpoint link records.
//!
//! External modules should import from `wings::db`; the repository API and
//! the row views are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{LinkRecord, ShareCounts};
