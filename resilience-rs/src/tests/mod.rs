//! End-to-end tests for the resilience layer
//!
//! These exercise several components together through the in-memory
//! adapters.

pub mod breaker_tests;
