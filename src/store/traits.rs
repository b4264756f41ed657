//! `KeyValueStore` trait, the persistence seam for cached entity context.

use async_trait::async_trait;

use crate::error::StoreError;

/// Minimal async key-value interface.
///
/// The engine only ever stores JSON strings here; the store itself is
/// content-agnostic. Implementations must be safe for concurrent use.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Value for `key`, if present.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Insert or replace the value for `key`.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}
