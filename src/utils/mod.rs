//! Shared helpers

pub mod retry;
