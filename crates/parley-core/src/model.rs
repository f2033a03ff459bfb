//! Entity rows and the populated views carried by events and query results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user identifier.
pub type UserId = Uuid;

/// A conversation identifier.
pub type ConversationId = Uuid;

/// A participant row identifier.
pub type ParticipantId = Uuid;

/// A message identifier.
pub type MessageId = Uuid;

/// A user account. Owned by the identity layer; the engine only reads it,
/// apart from username assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub image: Option<String>,
}

impl User {
    /// Create a user with only an id.
    #[must_use]
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            username: None,
            name: None,
            email: None,
            image: None,
        }
    }

    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    #[must_use]
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            username: self.username.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    /// Always references a message of this conversation when set.
    pub latest_message_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Create a fresh conversation with no messages.
    #[must_use]
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            latest_message_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

/// One user's membership in one conversation, with their read state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub has_seen_latest_message: bool,
    pub created_at: DateTime<Utc>,
}

impl Participant {
    #[must_use]
    pub fn new(conversation_id: ConversationId, user_id: UserId, has_seen: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            user_id,
            has_seen_latest_message: has_seen,
            created_at: Utc::now(),
        }
    }
}

/// A message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    #[must_use]
    pub fn new(conversation_id: ConversationId, sender_id: UserId, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            body: body.into(),
            created_at: Utc::now(),
        }
    }
}

/// The public face of a user inside conversation payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub id: ParticipantId,
    pub user: UserSummary,
    pub has_seen_latest_message: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: UserSummary,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// A conversation populated with its participants and latest message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub id: ConversationId,
    pub latest_message: Option<MessageView>,
    pub participants: Vec<ParticipantView>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationView {
    /// The participant view of `user_id`, if they belong to the conversation.
    #[must_use]
    pub fn participant(&self, user_id: UserId) -> Option<&ParticipantView> {
        self.participants.iter().find(|p| p.user.id == user_id)
    }
}
