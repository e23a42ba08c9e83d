//! Utilities shared across the messaging roles.

pub mod bootstrap;
pub mod retry;
