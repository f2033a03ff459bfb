//! Events published by the engine and the predicates that gate their delivery.

use crate::membership::is_authorized;
use crate::model::{ConversationId, ConversationView, MessageView, UserId};
use parley_protocol::Topic;
use serde::Serialize;

/// An event produced by a committed state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum Event {
    ConversationCreated(ConversationView),
    ConversationUpdated(ConversationView),
    /// Carries the participant set captured before the rows were deleted.
    ConversationDeleted(ConversationView),
    MessageSent(MessageView),
}

impl Event {
    /// The topic this event is published on.
    #[must_use]
    pub fn topic(&self) -> Topic {
        match self {
            Event::ConversationCreated(_) => Topic::ConversationCreated,
            Event::ConversationUpdated(_) => Topic::ConversationUpdated,
            Event::ConversationDeleted(_) => Topic::ConversationDeleted,
            Event::MessageSent(_) => Topic::MessageSent,
        }
    }

    /// The conversation the event concerns.
    #[must_use]
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            Event::ConversationCreated(c)
            | Event::ConversationUpdated(c)
            | Event::ConversationDeleted(c) => c.id,
            Event::MessageSent(m) => m.conversation_id,
        }
    }
}

/// Per-subscriber delivery predicate, stored with the subscription and
/// evaluated by the bus on every publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// Accept conversation events whose participant set contains the user.
    Participant(UserId),
    /// Accept messages sent into one conversation.
    Conversation(ConversationId),
}

impl Filter {
    #[must_use]
    pub fn accepts(&self, event: &Event) -> bool {
        match (self, event) {
            (
                Filter::Participant(user_id),
                Event::ConversationCreated(c)
                | Event::ConversationUpdated(c)
                | Event::ConversationDeleted(c),
            ) => is_authorized(&c.participants, *user_id),
            (Filter::Conversation(conversation_id), Event::MessageSent(m)) => {
                m.conversation_id == *conversation_id
            }
            _ => false,
        }
    }
}
