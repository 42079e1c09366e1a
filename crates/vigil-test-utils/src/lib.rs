#![deny(unsafe_code)]

//! Shared test utilities for the Vigil workspace.
//!
//! Provides config builders, throwaway socket paths, stand-ins for the rule
//! compiler and tracing helpers so that individual crate tests stay concise.
//!
//! This crate deliberately does not depend on `vigil-core`, so that core's
//! own unit tests can use it without ending up with two copies of core types.
//!
//! ```toml
//! [dev-dependencies]
//! vigil-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod fake_tool;
pub mod socket;
pub mod tracing_setup;
