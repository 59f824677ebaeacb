//! Reactive layer: store change events and live read models.
//!
//! [`ObservableStore`] wraps any [`crate::storage::LocalStore`] and emits a
//! [`StoreEvent`] after each write. [`live_view`] turns those events into a
//! [`LiveView`] carrying a [`Loadable`] state.

pub mod event;
pub mod live;
pub mod store;

pub use event::StoreEvent;
pub use live::{live_view, LiveView, Loadable};
pub use store::{EventFilter, ObservableStore, Unsubscribe};
