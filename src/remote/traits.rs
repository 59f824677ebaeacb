//! Adapter traits for the remote document store.
//!
//! Implementations own the network client; the sync engine only sees these
//! traits, injected as `Arc<dyn _>`.

use async_trait::async_trait;

use crate::error::RemoteError;
use crate::schema::document::RawFields;

use super::types::RawChangeStream;

// ============================================================================
// ChangeStream
// ============================================================================

/// Subscription to a remote collection's change notifications.
pub trait ChangeStream: Send + Sync {
    /// Start a subscription for `parent_id`.
    ///
    /// The returned stream is lazy and normally infinite. Dropping it cancels
    /// the subscription; calling `subscribe` again restarts it.
    fn subscribe(&self, parent_id: &str) -> RawChangeStream;
}

// ============================================================================
// RemoteWriter
// ============================================================================

#[async_trait]
pub trait RemoteWriter: Send + Sync {
    /// Create-if-absent, else merge `updates` into the existing document.
    async fn merge_write(
        &self,
        parent_id: &str,
        entity_id: &str,
        updates: &RawFields,
    ) -> Result<(), RemoteError>;

    /// Create a document with a server-assigned id and return that id.
    async fn create_document(&self, parent_id: &str, fields: &RawFields)
        -> Result<String, RemoteError>;

    /// Remove a document. Deleting a missing document is not an error.
    async fn delete_document(&self, parent_id: &str, entity_id: &str) -> Result<(), RemoteError>;
}

// ============================================================================
// RemoteReader
// ============================================================================

#[async_trait]
pub trait RemoteReader: Send + Sync {
    /// Fetch one document's raw fields. A missing id is
    /// [`RemoteError::DocumentNotFound`].
    async fn fetch_document(&self, parent_id: &str, entity_id: &str)
        -> Result<RawFields, RemoteError>;
}
