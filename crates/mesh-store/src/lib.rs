//! Declarative object store
//!
//! The operator never talks to the Kubernetes API directly; every read and
//! write goes through [`ObjectStore`]. Objects are keyed by kind, namespace and
//! name, updates carry the object's `resourceVersion` for optimistic
//! concurrency, and status is written independently of spec.
//!
//! - [`KubeStore`] implements the trait against a live cluster.
//! - `MockStore` (feature `test-util`) keeps everything in memory for tests.

pub mod error;
pub mod kube_store;
#[path = "trait.rs"]
pub mod store_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use error::{StoreError, StoreResultExt};
pub use kube_store::KubeStore;
pub use store_trait::ObjectStore;
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockStore;
