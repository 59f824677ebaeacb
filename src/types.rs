//! Core value types: entities, their audit metadata, and typed field values.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// FieldValue
// ============================================================================

/// A typed value held by one field of an entity.
///
/// Local rows store this through serde; the remote wire form is produced by
/// [`crate::schema::codec`], which is a different (shape-dispatched) mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    /// Free text.
    Text(String),
    /// A single free-form token, e.g. a code or short label.
    Single(String),
    /// Ordered set of selected option ids.
    MultipleChoice(Vec<String>),
    /// A point in time.
    DateTime(DateTime<Utc>),
    /// A numeric reading.
    Number(f64),
}

impl FieldValue {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Build a multiple-choice value. Duplicate ids are dropped, keeping the
    /// first occurrence, so the result is an ordered set.
    pub fn multiple_choice<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for id in ids {
            let id = id.into();
            if !out.contains(&id) {
                out.push(id);
            }
        }
        Self::MultipleChoice(out)
    }

    /// Short name of the variant, used in logs and errors.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Single(_) => "single",
            Self::MultipleChoice(_) => "multiple_choice",
            Self::DateTime(_) => "date_time",
            Self::Number(_) => "number",
        }
    }

    /// Whether the value survives a JSON round trip. Non-finite numbers
    /// serialize as `null` and cannot be read back.
    pub fn is_storable(&self) -> bool {
        match self {
            Self::Number(n) => n.is_finite(),
            _ => true,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) | Self::Single(s) => Some(s),
            _ => None,
        }
    }
}

/// Field id → value. Ordered so snapshots compare and serialize stably.
pub type FieldMap = BTreeMap<String, FieldValue>;

// ============================================================================
// AuditInfo
// ============================================================================

/// Who touched an entity and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditInfo {
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditInfo {
    pub fn new(user_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            timestamp,
        }
    }

    /// Placeholder for documents that arrive without audit metadata.
    pub fn unknown() -> Self {
        Self {
            user_id: String::new(),
            timestamp: DateTime::<Utc>::default(),
        }
    }
}

// ============================================================================
// Entity
// ============================================================================

/// An immutable snapshot of a synchronized record.
///
/// Every change produces a new `Entity`; nothing mutates a stored snapshot in
/// place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub parent_id: String,
    pub fields: FieldMap,
    pub created: AuditInfo,
    pub last_modified: AuditInfo,
}

impl Entity {
    /// A new, empty entity with a freshly generated id.
    pub fn new(parent_id: impl Into<String>, audit: AuditInfo) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), parent_id, audit)
    }

    pub fn with_id(id: impl Into<String>, parent_id: impl Into<String>, audit: AuditInfo) -> Self {
        Self {
            id: id.into(),
            parent_id: parent_id.into(),
            fields: FieldMap::new(),
            created: audit.clone(),
            last_modified: audit,
        }
    }

    pub fn field(&self, field_id: &str) -> Option<&FieldValue> {
        self.fields.get(field_id)
    }

    /// Copy of this snapshot with `field_id` set to `value`.
    pub fn with_field(&self, field_id: impl Into<String>, value: FieldValue) -> Self {
        let mut next = self.clone();
        next.fields.insert(field_id.into(), value);
        next
    }

    /// Copy of this snapshot without `field_id`.
    pub fn without_field(&self, field_id: &str) -> Self {
        let mut next = self.clone();
        next.fields.remove(field_id);
        next
    }

    /// Copy of this snapshot stamped as modified by `audit`.
    pub fn touched(&self, audit: AuditInfo) -> Self {
        let mut next = self.clone();
        next.last_modified = audit;
        next
    }
}
