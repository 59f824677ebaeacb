//! Queued changes to an entity awaiting remote confirmation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FieldSyncError, Result, StorageError};
use crate::schema::codec::{encode, TOMBSTONE};
use crate::schema::document::{encode_audit, RawFields, CREATED_KEY, LAST_MODIFIED_KEY};
use crate::types::{AuditInfo, Entity, FieldValue};

// ============================================================================
// Enums
// ============================================================================

/// What a mutation does to the entity as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// What one field update does to its field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldOperation {
    Create,
    Update,
    Delete,
}

/// Lifecycle of a queued mutation.
///
/// `Pending → InProgress → {Completed | Failed}`, and `Failed → Pending` on
/// retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    InProgress,
    Failed,
    Completed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "failed" => Some(Self::Failed),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

// ============================================================================
// FieldUpdate
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdate {
    pub field_id: String,
    pub operation: FieldOperation,
    pub value: Option<FieldValue>,
}

impl FieldUpdate {
    pub fn create(field_id: impl Into<String>, value: FieldValue) -> Self {
        Self {
            field_id: field_id.into(),
            operation: FieldOperation::Create,
            value: Some(value),
        }
    }

    pub fn update(field_id: impl Into<String>, value: FieldValue) -> Self {
        Self {
            field_id: field_id.into(),
            operation: FieldOperation::Update,
            value: Some(value),
        }
    }

    pub fn delete(field_id: impl Into<String>) -> Self {
        Self {
            field_id: field_id.into(),
            operation: FieldOperation::Delete,
            value: None,
        }
    }
}

// ============================================================================
// Mutation
// ============================================================================

/// A pending change to one entity.
///
/// `id` is zero until the local store assigns one on enqueue; queue order is
/// the order of assigned ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub id: i64,
    pub entity_id: String,
    pub parent_id: String,
    pub kind: MutationKind,
    pub field_updates: Vec<FieldUpdate>,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub status: SyncStatus,
    pub last_error: Option<String>,
}

impl Mutation {
    fn build(
        kind: MutationKind,
        entity_id: impl Into<String>,
        parent_id: impl Into<String>,
        author: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            entity_id: entity_id.into(),
            parent_id: parent_id.into(),
            kind,
            field_updates: Vec::new(),
            author: author.into(),
            created_at: Utc::now(),
            retry_count: 0,
            status: SyncStatus::Pending,
            last_error: None,
        }
    }

    pub fn create(
        entity_id: impl Into<String>,
        parent_id: impl Into<String>,
        author: impl Into<String>,
    ) -> Self {
        Self::build(MutationKind::Create, entity_id, parent_id, author)
    }

    pub fn update(
        entity_id: impl Into<String>,
        parent_id: impl Into<String>,
        author: impl Into<String>,
    ) -> Self {
        Self::build(MutationKind::Update, entity_id, parent_id, author)
    }

    pub fn delete(
        entity_id: impl Into<String>,
        parent_id: impl Into<String>,
        author: impl Into<String>,
    ) -> Self {
        Self::build(MutationKind::Delete, entity_id, parent_id, author)
    }

    /// Append a field update, builder-style.
    pub fn with_update(mut self, update: FieldUpdate) -> Self {
        self.field_updates.push(update);
        self
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn audit(&self) -> AuditInfo {
        AuditInfo::new(self.author.clone(), self.created_at)
    }

    /// Whether the drain loop may send this mutation without a manual retry.
    pub fn is_sendable(&self) -> bool {
        matches!(self.status, SyncStatus::Pending | SyncStatus::InProgress)
    }

    pub fn validate(&self) -> Result<()> {
        if self.entity_id.is_empty() {
            return Err(FieldSyncError::InvalidMutation(
                "entity id must not be empty".to_string(),
            ));
        }
        if self.parent_id.is_empty() {
            return Err(FieldSyncError::InvalidMutation(
                "parent id must not be empty".to_string(),
            ));
        }
        for update in &self.field_updates {
            if update.field_id.is_empty() {
                return Err(FieldSyncError::InvalidMutation(
                    "field id must not be empty".to_string(),
                ));
            }
            if update.operation != FieldOperation::Delete && update.value.is_none() {
                return Err(FieldSyncError::InvalidMutation(format!(
                    "{:?} of \"{}\" carries no value",
                    update.operation, update.field_id
                )));
            }
            if update.value.as_ref().is_some_and(|v| !v.is_storable()) {
                return Err(FieldSyncError::InvalidMutation(format!(
                    "\"{}\" carries a non-finite number",
                    update.field_id
                )));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Local application
    // -----------------------------------------------------------------------

    /// The optimistic snapshot this mutation produces over `base`.
    ///
    /// Returns `Ok(None)` for entity deletes: the local row stays until the
    /// remote acknowledges the delete.
    pub fn apply_to(&self, base: Option<&Entity>) -> Result<Option<Entity>> {
        let audit = self.audit();
        let mut next = match (self.kind, base) {
            (MutationKind::Delete, _) => return Ok(None),
            (MutationKind::Create, Some(existing)) => existing.touched(audit),
            (MutationKind::Create, None) => {
                Entity::with_id(self.entity_id.clone(), self.parent_id.clone(), audit)
            }
            (MutationKind::Update, Some(existing)) => existing.touched(audit),
            (MutationKind::Update, None) => {
                return Err(StorageError::NotFound {
                    id: self.entity_id.clone(),
                }
                .into())
            }
        };

        for update in &self.field_updates {
            next = match (update.operation, &update.value) {
                (FieldOperation::Delete, _) => next.without_field(&update.field_id),
                (_, Some(value)) => next.with_field(update.field_id.clone(), value.clone()),
                (_, None) => next,
            };
        }
        Ok(Some(next))
    }

    // -----------------------------------------------------------------------
    // Wire form
    // -----------------------------------------------------------------------

    /// Field-update map for a merge-write. Deletes become the tombstone.
    pub fn to_wire_updates(&self) -> RawFields {
        let mut out = RawFields::new();
        for update in &self.field_updates {
            let wire = match (update.operation, &update.value) {
                (FieldOperation::Delete, _) => TOMBSTONE,
                (_, Some(value)) => encode(value),
                (_, None) => continue,
            };
            out.insert(update.field_id.clone(), wire);
        }
        let audit = encode_audit(&self.audit());
        if self.kind == MutationKind::Create {
            out.insert(CREATED_KEY.to_string(), audit.clone());
        }
        out.insert(LAST_MODIFIED_KEY.to_string(), audit);
        out
    }
}
