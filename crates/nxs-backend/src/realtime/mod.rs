//! Row-level change feeds.

pub mod client;
pub mod filter;
pub mod protocol;
pub mod subscription;

pub use client::RealtimeClient;
pub use filter::{ChangeFilter, EventFilter};
pub use protocol::{ChangeEvent, ChangeKind, PhoenixMessage};
pub use subscription::{ChangeStream, SubscriptionGuard, SubscriptionStatus};
