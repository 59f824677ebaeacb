use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ============================================================================
// FieldKind
// ============================================================================

/// The declared type of a field, as known from the (externally defined) form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Single,
    MultipleChoice,
    DateTime,
    Number,
}

impl FieldKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Single => "single",
            Self::MultipleChoice => "multiple_choice",
            Self::DateTime => "date_time",
            Self::Number => "number",
        }
    }

    /// Whether values of this kind travel as a JSON string.
    pub fn is_string_shaped(&self) -> bool {
        !matches!(self, Self::MultipleChoice)
    }
}

// ============================================================================
// FieldDescriptor
// ============================================================================

/// What the decoder knows about one field. `kind` is `None` when the field is
/// not declared, in which case decoding goes by wire shape alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub id: String,
    pub kind: Option<FieldKind>,
}

impl FieldDescriptor {
    pub fn untyped(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: None,
        }
    }

    pub fn typed(id: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            id: id.into(),
            kind: Some(kind),
        }
    }
}

// ============================================================================
// FieldSchema
// ============================================================================

/// Declared field kinds for one parent collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    fields: HashMap<String, FieldKind>,
}

impl FieldSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style declaration.
    pub fn field(mut self, id: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(id.into(), kind);
        self
    }

    pub fn kind_of(&self, id: &str) -> Option<FieldKind> {
        self.fields.get(id).copied()
    }

    pub fn descriptor(&self, id: &str) -> FieldDescriptor {
        FieldDescriptor {
            id: id.to_string(),
            kind: self.kind_of(id),
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
