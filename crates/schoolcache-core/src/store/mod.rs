//! Local persistent storage for offline access.
//!
//! This module provides the `JsonEntityStore`, which keeps one JSON file per
//! entity under `<cache_dir>/<kind>/<local_id>.json` together with the alias
//! table of that entity kind in `<cache_dir>/<kind>/aliases.json`.

pub mod json_store;

pub use json_store::JsonEntityStore;
