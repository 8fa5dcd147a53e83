//! Owner-scoped shared state store (`spec.md` §4.2).

mod entry;
mod error;
mod store;

pub use entry::{StateDelta, StateEntry};
pub use error::StoreError;
pub use store::{ListenerId, Listener, StateStore};
