//! Stateless helpers used across the crate.

pub mod bootstrap;
pub mod retry;
