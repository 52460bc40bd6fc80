//! REST API client module for the school sync backend.
//!
//! This module provides the `ApiClient` for downloading schools, groups and
//! subject instances by alias. Requests are authenticated with the access
//! credentials of the school the entity belongs to.

pub mod client;

pub use client::ApiClient;
