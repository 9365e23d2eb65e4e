//! Engine core: manifests, resolution, dispatch, retry control.

pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod hardware;
pub mod parser;
pub mod recipe;
pub mod report;
pub mod state;
pub mod types;
