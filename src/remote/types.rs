use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::schema::document::RawFields;

/// Change type reported by the remote store for one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Modified,
    Removed,
}

/// One document change as delivered by the remote store, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub document_id: String,
    pub change_type: ChangeType,
    /// The snapshot still contains local writes the server has not acknowledged.
    pub has_pending_writes: bool,
    pub raw_fields: RawFields,
}

impl RawChange {
    pub fn new(
        document_id: impl Into<String>,
        change_type: ChangeType,
        raw_fields: RawFields,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            change_type,
            has_pending_writes: false,
            raw_fields,
        }
    }

    pub fn pending(mut self) -> Self {
        self.has_pending_writes = true;
        self
    }
}

/// All changes from one remote snapshot, in delivery order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawChangeBatch {
    pub changes: Vec<RawChange>,
}

impl RawChangeBatch {
    pub fn new(changes: Vec<RawChange>) -> Self {
        Self { changes }
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Lazy sequence of change batches for one parent collection.
pub type RawChangeStream = Pin<Box<dyn Stream<Item = RawChangeBatch> + Send>>;
