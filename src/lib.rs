//! envkiln: declarative ML runtime provisioning.
//!
//! Merges component catalogs, resolves layered recipes, materializes
//! conda-style environments idempotently, and drives failed attempts
//! through a bounded retry and escalation loop.

pub mod advisor;
pub mod assets;
pub mod catalog;
pub mod cli;
pub mod core;
pub mod resources;
pub mod transport;
pub mod tripwire;
