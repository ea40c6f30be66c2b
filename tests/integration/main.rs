//! Integration tests for langbridge
//!
//! These tests drive the server manager against an in-process fake language
//! server and check the protocol traffic it produces.

// Test utilities and common setup
mod common;

mod config_tests;
mod edit_tests;
mod sync_tests;

// Re-export common utilities for use by test modules
pub use common::*;
