//! StoreEvent: what changed in the local store.

/// Emitted by [`super::ObservableStore`] after each successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// An entity snapshot was inserted or replaced.
    EntityWritten { parent_id: String, id: String },
    /// An entity snapshot was removed.
    EntityDeleted { parent_id: String, id: String },
    /// The mutation queue of one entity changed (append, status, removal).
    QueueChanged { parent_id: String, entity_id: String },
}

impl StoreEvent {
    pub fn parent_id(&self) -> &str {
        match self {
            Self::EntityWritten { parent_id, .. }
            | Self::EntityDeleted { parent_id, .. }
            | Self::QueueChanged { parent_id, .. } => parent_id,
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            Self::EntityWritten { id, .. } | Self::EntityDeleted { id, .. } => id,
            Self::QueueChanged { entity_id, .. } => entity_id,
        }
    }

    /// Whether the entity snapshot itself changed (as opposed to its queue).
    pub fn touches_snapshot(&self) -> bool {
        !matches!(self, Self::QueueChanged { .. })
    }
}
