//! # nxs-backend
//!
//! Client for the hosted backend NXS Chat runs on: filtered row reads and
//! writes, password auth, blob storage and row-level change feeds over the
//! realtime socket.
//!
//! Domain code depends only on the [`Backend`] and [`AuthBackend`] traits.
//! [`HostedBackend`] speaks to the platform; [`MemoryBackend`] keeps
//! everything in process.
//!
//! ```ignore
//! use nxs_backend::{Backend, ClientConfig, HostedBackend, Query};
//!
//! let backend = HostedBackend::new(ClientConfig::from_env()?)?;
//! let rows = backend
//!     .select("messages", &Query::new().eq("chat_id", chat_id).order("created_at", true))
//!     .await?;
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod hosted;
pub mod memory;
pub mod query;
pub mod realtime;
pub mod rest;
pub mod retry;
pub mod storage;
pub mod traits;

pub use auth::{AuthResponse, AuthUser, Session};
pub use config::ClientConfig;
pub use error::{BackendError, Result};
pub use hosted::HostedBackend;
pub use memory::{ColumnDefault, MemoryBackend};
pub use query::{Filter, Op, Order, Query, Row};
pub use realtime::{
    ChangeEvent, ChangeFilter, ChangeKind, ChangeStream, EventFilter, SubscriptionGuard,
    SubscriptionStatus,
};
pub use retry::{RetryConfig, RetryDecision, RetryState};
pub use traits::{decode_row, decode_rows, row, to_row, AuthBackend, Backend};
