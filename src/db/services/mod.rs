//! The `services` module provides a high-level API for interacting with the database.
//! It encapsulates the query logic so the engine and the web layer work with
//! domain models without knowing the schema.

pub mod access_log_service;
pub mod accounting;
pub mod binding_service;
pub mod node_service;
pub mod subscription_service;

pub use access_log_service::*;
pub use binding_service::*;
pub use node_service::*;
pub use subscription_service::*;

use serde::{Deserialize, Deserializer};

/// Distinguishes an absent field (`None`) from an explicit `null` (`Some(None)`).
pub(crate) fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
