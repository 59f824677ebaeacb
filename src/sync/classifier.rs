//! ChangeClassifier: raw remote notifications → typed change events.
//!
//! Conversion failures never escape: a notification that cannot be turned
//! into an entity becomes an [`EventKind::Invalid`] event, and
//! [`ChangeClassifier::accept`] drops those before anything is merged.

use tracing::warn;

use crate::remote::{ChangeType, RawChange, RawChangeBatch};
use crate::schema::{decode_document, FieldSchema};

use super::types::{ChangeEvent, EventKind, EventSource};

#[derive(Debug, Clone)]
pub struct ChangeClassifier {
    parent_id: String,
    schema: FieldSchema,
}

impl ChangeClassifier {
    pub fn new(parent_id: impl Into<String>, schema: FieldSchema) -> Self {
        Self {
            parent_id: parent_id.into(),
            schema,
        }
    }

    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    /// One event per notification, in input order, `Invalid` included.
    pub fn classify(&self, batch: &RawChangeBatch) -> Vec<ChangeEvent> {
        batch.changes.iter().map(|c| self.classify_one(c)).collect()
    }

    /// Like [`classify`](Self::classify) but without `Invalid` events.
    pub fn accept(&self, batch: &RawChangeBatch) -> Vec<ChangeEvent> {
        self.classify(batch)
            .into_iter()
            .filter(|e| !e.is_invalid())
            .collect()
    }

    pub fn classify_one(&self, change: &RawChange) -> ChangeEvent {
        let source = if change.has_pending_writes {
            EventSource::LocalPending
        } else {
            EventSource::RemoteConfirmed
        };
        let invalid = || ChangeEvent {
            entity_id: change.document_id.clone(),
            kind: EventKind::Invalid,
            source,
            payload: None,
        };

        if change.document_id.is_empty() {
            warn!(parent_id = %self.parent_id, "Change notification without a document id");
            return invalid();
        }

        let kind = match change.change_type {
            ChangeType::Added => EventKind::Added,
            ChangeType::Modified => EventKind::Modified,
            ChangeType::Removed => {
                return ChangeEvent {
                    entity_id: change.document_id.clone(),
                    kind: EventKind::Removed,
                    source,
                    payload: None,
                }
            }
        };

        match decode_document(
            &self.parent_id,
            &change.document_id,
            &change.raw_fields,
            &self.schema,
        ) {
            Ok(entity) => ChangeEvent {
                entity_id: change.document_id.clone(),
                kind,
                source,
                payload: Some(entity),
            },
            Err(e) => {
                warn!(
                    parent_id = %self.parent_id,
                    document_id = %change.document_id,
                    error = %e,
                    "Invalid remote document"
                );
                invalid()
            }
        }
    }
}
