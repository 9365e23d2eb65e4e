//! Resource handlers: converge one kind of component each.
//!
//! Handlers build typed invocations and run them through a
//! [`crate::transport::CommandRunner`]; each decides install-or-skip from
//! what is already on disk or in the environment.

pub mod catalog_component;
pub mod environment;
pub mod package;
pub mod repository;
