//! Policy-driven orchestration between the entity cache, local storage and
//! the remote API.
//!
//! An `EntitySource` hands out one shared stream of `SourceState`s per key.
//! Every subscriber of a key observes the same execution; the execution is
//! torn down a short grace period after its last subscriber leaves.

pub mod adapter;
pub mod entity_source;
pub mod state;
pub mod stream;

use std::fmt::{Debug, Display};
use std::hash::Hash;

pub use adapter::EntityAdapter;
pub use entity_source::{EntitySource, SourceConfig};
pub use state::{RefreshPolicy, SourceState};
pub use stream::SourceStream;

/// Bounds shared by every key an `EntitySource` is addressed with.
pub trait EntityKey: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static {}

impl<K> EntityKey for K where K: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static {}

/// Bounds shared by every value an `EntitySource` produces.
pub trait EntityValue: Clone + Send + Sync + 'static {}

impl<T> EntityValue for T where T: Clone + Send + Sync + 'static {}
