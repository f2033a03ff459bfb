//! # parley-core
//!
//! Conversation state and authorized event fan-out for the Parley realtime
//! backend.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Store** - Transactional access to users, conversations, participants and messages
//! - **Membership** - Participant-set authorization checks
//! - **Engine** - Conversation state transitions and the events they produce
//! - **Bus** - Topic-based pub/sub with per-subscriber filters and bounded queues
//! - **Session** - Caller identity and per-connection subscription scope
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Session   │────▶│   Engine    │────▶│    Store    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                   │ publish (under conversation lock)
//!        │ subscribe         ▼
//!        │            ┌─────────────┐     ┌─────────────┐
//!        └───────────▶│  EventBus   │────▶│Subscription │
//!                     └─────────────┘     └─────────────┘
//! ```

pub mod bus;
pub mod engine;
pub mod error;
pub mod event;
pub mod locks;
pub mod membership;
pub mod model;
pub mod session;
pub mod store;

#[cfg(test)]
mod test_support;

pub use bus::{
    BusConfig, BusStats, CloseReason, EventBus, Subscription, SubscriptionError, SubscriptionId,
};
pub use engine::{Engine, SendMessage};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use event::{Event, Filter};
pub use membership::{is_authorized, Member};
pub use model::{
    Conversation, ConversationId, ConversationView, Message, MessageId, MessageView, Participant,
    ParticipantView, User, UserId, UserSummary,
};
pub use session::{Session, SubscriptionRequest, SubscriptionSession};
pub use store::{EntityStore, MemoryStore, StoreError, StoreResult, Write, WriteBatch};
