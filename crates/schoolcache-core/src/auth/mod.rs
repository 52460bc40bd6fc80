//! Access credentials for authenticated downloads.
//!
//! Providers hand out school data only to clients that present the school's
//! access credentials. This module provides:
//! - `SchoolCredentials`: a username/password pair for one school
//! - `CredentialSource`: lookup seam used by the download adapters
//! - `CredentialStore`: secure OS-level credential storage via keyring

pub mod credentials;

pub use credentials::{CredentialSource, CredentialStore, MemoryCredentials, SchoolCredentials};
