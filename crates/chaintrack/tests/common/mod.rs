//! Shared test utilities for chaintrack integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated tests against an on-disk registry
//! - Builders for configurations and stage payloads

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
