//! nxs-chat: the messaging domain of NXS Chat.
//!
//! Everything here runs over the [`nxs_backend::Backend`] trait, so the same
//! code drives the hosted platform and the in-memory backend used in tests.
//!
//! - **messaging / session**: conversations, sending, and live per-chat
//!   timelines reconciled against realtime change events.
//! - **conversations**: the chat list with unread counts and activity order.
//! - **status**: 24h statuses, view recording and the timed viewer.
//! - **random**: anonymous random pairing through the waiting queue.
//! - **account / admin**: sign-up, sessions, profiles and the admin console.

pub mod account;
pub mod admin;
pub mod blocks;
pub mod client;
pub mod conversations;
pub mod error;
pub mod events;
pub mod messaging;
pub mod models;
pub mod profiles;
pub mod random;
pub mod schema;
pub mod session;
pub mod settings;
pub mod status;
pub mod timeline;
pub mod validation;

pub use account::{AccountService, ProfilePatch, SignUpOutcome};
pub use admin::{AdminService, AdminSession, ContentKind, DashboardStats, Period};
pub use blocks::Blocks;
pub use client::AppContext;
pub use conversations::{ConversationList, ListChange};
pub use error::{ChatError, Result};
pub use events::{ChatEvent, EventBus};
pub use messaging::{ChatService, NewMessage};
pub use models::*;
pub use profiles::Profiles;
pub use random::{RandomChat, RandomMatch, RandomPairing, RandomState, StartOutcome};
pub use session::{ChatSession, ConversationFeed};
pub use settings::SystemSettings;
pub use status::{StatusFeed, StatusService, StatusViewer, ViewerStep};
pub use timeline::{Applied, MessageTimeline};
pub use validation::{FieldErrors, SignUpForm};
