//! Remote document store seam: raw change types and adapter traits.

pub mod traits;
pub mod types;

pub use traits::{ChangeStream, RemoteReader, RemoteWriter};
pub use types::{ChangeType, RawChange, RawChangeBatch, RawChangeStream};
