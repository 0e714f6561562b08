// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Unit tests for the OLM operator
//!
//! This module contains unit tests for:
//! - Requirement evaluation against a fake cluster
//! - The CSV lifecycle state machine
//! - Install planning and component health
//! - Replacement chains and garbage collection
//! - API service serving resources
//! - Copied ClusterServiceVersions

#[path = "../common/mod.rs"]
mod common;

mod copied;
mod install;
mod status;
