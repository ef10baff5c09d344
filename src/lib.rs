//! Consolidation of the legacy employee, freelancer and partner staff
//! tables into unified personnel storage.
//!
//! The pass is driven by [`engine::run`]; [`rollback::rollback`] undoes an
//! applied run and [`adapter`] keeps legacy-shaped callers working against
//! the unified tables.

pub mod adapter;
pub mod config;
pub mod coordinator;
pub mod db;
mod error;
pub mod engine;
pub mod guard;
pub mod legacy;
pub mod logging;
pub mod mapper;
pub mod model;
pub mod reader;
pub mod repo;
pub mod repoint;
pub mod rollback;
pub mod runlog;
pub mod schema_plan;
pub mod snapshot;
pub mod time;
pub mod verify;

pub use error::{AppError, AppResult};
