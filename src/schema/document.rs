//! Whole-document conversion between remote documents and [`Entity`]
//! snapshots.
//!
//! A remote document is a flat JSON object: every key is a field id, except
//! the reserved audit keys [`CREATED_KEY`] and [`LAST_MODIFIED_KEY`], which
//! hold `{"user": <id>, "at": <RFC 3339>}`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::error::{DecodeError, DocumentError};
use crate::types::{AuditInfo, Entity, FieldMap};

use super::codec::{decode, encode, is_tombstone};
use super::field::FieldSchema;

pub const CREATED_KEY: &str = "created";
pub const LAST_MODIFIED_KEY: &str = "lastModified";

/// Raw document body as received from or sent to the remote store.
pub type RawFields = Map<String, Value>;

pub fn is_reserved_key(key: &str) -> bool {
    key == CREATED_KEY || key == LAST_MODIFIED_KEY
}

// ============================================================================
// Decoding
// ============================================================================

/// Convert a remote document into an entity snapshot.
///
/// Fields that fail to decode are logged and dropped. The document as a whole
/// is rejected only when it is structurally broken (empty id, malformed audit
/// metadata) or when it carried fields and not one of them decoded.
pub fn decode_document(
    parent_id: &str,
    document_id: &str,
    raw: &RawFields,
    schema: &FieldSchema,
) -> Result<Entity, DocumentError> {
    if document_id.is_empty() {
        return Err(DocumentError::MissingId);
    }

    let last_modified = match raw.get(LAST_MODIFIED_KEY) {
        Some(v) => decode_audit(document_id, LAST_MODIFIED_KEY, v)?,
        None => AuditInfo::unknown(),
    };
    let created = match raw.get(CREATED_KEY) {
        Some(v) => decode_audit(document_id, CREATED_KEY, v)?,
        None => last_modified.clone(),
    };

    let mut fields = FieldMap::new();
    let mut failures: Vec<DecodeError> = Vec::new();

    for (key, wire) in raw {
        if is_reserved_key(key) || is_tombstone(wire) {
            continue;
        }
        match decode(&schema.descriptor(key), wire) {
            Ok(value) => {
                fields.insert(key.clone(), value);
            }
            Err(e) => {
                warn!(document_id, field = %key, error = %e, "Dropping undecodable field");
                failures.push(e);
            }
        }
    }

    if fields.is_empty() && !failures.is_empty() {
        return Err(DocumentError::Unusable {
            id: document_id.to_string(),
            failures,
        });
    }

    Ok(Entity {
        id: document_id.to_string(),
        parent_id: parent_id.to_string(),
        fields,
        created,
        last_modified,
    })
}

fn decode_audit(document_id: &str, key: &str, value: &Value) -> Result<AuditInfo, DocumentError> {
    let malformed = |reason: &str| DocumentError::MalformedAudit {
        id: document_id.to_string(),
        key: key.to_string(),
        reason: reason.to_string(),
    };

    let obj = value.as_object().ok_or_else(|| malformed("expected an object"))?;
    let user = obj
        .get("user")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing \"user\""))?;
    let at = obj
        .get("at")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing \"at\""))?;
    let at = DateTime::parse_from_rfc3339(at)
        .map_err(|e| malformed(&format!("bad timestamp: {e}")))?
        .with_timezone(&Utc);

    Ok(AuditInfo::new(user, at))
}

// ============================================================================
// Encoding
// ============================================================================

pub fn encode_audit(audit: &AuditInfo) -> Value {
    json!({
        "user": audit.user_id,
        "at": audit.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

/// Full document body for an entity: every field plus both audit keys.
pub fn encode_document(entity: &Entity) -> RawFields {
    let mut out = RawFields::new();
    for (id, value) in &entity.fields {
        out.insert(id.clone(), encode(value));
    }
    out.insert(CREATED_KEY.to_string(), encode_audit(&entity.created));
    out.insert(LAST_MODIFIED_KEY.to_string(), encode_audit(&entity.last_modified));
    out
}
