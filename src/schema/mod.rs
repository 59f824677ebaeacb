//! Field descriptors and the wire codec.
//!
//! - [`field`]: [`FieldKind`], [`FieldDescriptor`], [`FieldSchema`].
//! - [`codec`]: per-field `encode` / `decode` against [`WireValue`].
//! - [`document`]: whole-document conversion to and from [`crate::types::Entity`].

pub mod codec;
pub mod document;
pub mod field;

pub use codec::{decode, encode, is_tombstone, WireValue, TOMBSTONE};
pub use document::{decode_document, encode_document, RawFields};
pub use field::{FieldDescriptor, FieldKind, FieldSchema};
