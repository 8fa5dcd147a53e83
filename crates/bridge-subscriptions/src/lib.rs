//! Subscription tracking and pattern matching (`spec.md` §4.3).

mod manager;
mod subscription;

pub use manager::SubscriptionManager;
pub use subscription::{CompiledPattern, Subscription, SubscriptionId};
