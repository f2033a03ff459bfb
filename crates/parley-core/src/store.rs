//! Entity store interface and an in-memory transactional implementation.
//!
//! The engine reads through the [`EntityStore`] trait and writes only by
//! handing the store a [`WriteBatch`], which is applied atomically. The
//! [`MemoryStore`] enforces the same relational constraints a SQL schema would:
//! unique memberships, foreign keys, and deletion in dependency order.

use crate::model::{
    Conversation, ConversationId, Message, MessageId, Participant, User, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, trace};

/// Store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The row a write targets does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A unique constraint would be violated.
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// A row references a missing row, or a referenced row would be removed.
    #[error("Foreign key constraint violated: {0}")]
    ForeignKey(String),

    /// The backing store could not serve the request.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A single write inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    InsertConversation(Conversation),
    InsertParticipant(Participant),
    InsertMessage(Message),
    SetLatestMessage {
        conversation_id: ConversationId,
        message_id: Option<MessageId>,
        at: DateTime<Utc>,
    },
    /// Set the seen flag of one participant.
    SetSeen {
        conversation_id: ConversationId,
        user_id: UserId,
        seen: bool,
    },
    /// Set the seen flag of every participant except `user_id`.
    SetSeenExcept {
        conversation_id: ConversationId,
        user_id: UserId,
        seen: bool,
    },
    DeleteParticipants { conversation_id: ConversationId },
    DeleteMessages { conversation_id: ConversationId },
    DeleteConversation { conversation_id: ConversationId },
    /// Insert a user row; fails if the id is already taken.
    InsertUser(User),
    /// Insert or replace a user row.
    PutUser(User),
}

/// An ordered list of writes applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    writes: Vec<Write>,
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn push(mut self, write: Write) -> Self {
        self.writes.push(write);
        self
    }

    #[must_use]
    pub fn insert_conversation(self, conversation: Conversation) -> Self {
        self.push(Write::InsertConversation(conversation))
    }

    #[must_use]
    pub fn insert_participant(self, participant: Participant) -> Self {
        self.push(Write::InsertParticipant(participant))
    }

    #[must_use]
    pub fn insert_message(self, message: Message) -> Self {
        self.push(Write::InsertMessage(message))
    }

    #[must_use]
    pub fn set_latest_message(
        self,
        conversation_id: ConversationId,
        message_id: Option<MessageId>,
        at: DateTime<Utc>,
    ) -> Self {
        self.push(Write::SetLatestMessage {
            conversation_id,
            message_id,
            at,
        })
    }

    #[must_use]
    pub fn set_seen(self, conversation_id: ConversationId, user_id: UserId, seen: bool) -> Self {
        self.push(Write::SetSeen {
            conversation_id,
            user_id,
            seen,
        })
    }

    #[must_use]
    pub fn set_seen_except(
        self,
        conversation_id: ConversationId,
        user_id: UserId,
        seen: bool,
    ) -> Self {
        self.push(Write::SetSeenExcept {
            conversation_id,
            user_id,
            seen,
        })
    }

    #[must_use]
    pub fn delete_participants(self, conversation_id: ConversationId) -> Self {
        self.push(Write::DeleteParticipants { conversation_id })
    }

    #[must_use]
    pub fn delete_messages(self, conversation_id: ConversationId) -> Self {
        self.push(Write::DeleteMessages { conversation_id })
    }

    #[must_use]
    pub fn delete_conversation(self, conversation_id: ConversationId) -> Self {
        self.push(Write::DeleteConversation { conversation_id })
    }

    #[must_use]
    pub fn insert_user(self, user: User) -> Self {
        self.push(Write::InsertUser(user))
    }

    #[must_use]
    pub fn put_user(self, user: User) -> Self {
        self.push(Write::PutUser(user))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Write> {
        self.writes.iter()
    }
}

impl IntoIterator for WriteBatch {
    type Item = Write;
    type IntoIter = std::vec::IntoIter<Write>;

    fn into_iter(self) -> Self::IntoIter {
        self.writes.into_iter()
    }
}

/// Transactional access to users, conversations, participants and messages.
///
/// Reads observe committed state only. Writes go through [`transaction`],
/// which either applies every write of the batch or none of them.
///
/// [`transaction`]: EntityStore::transaction
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn user(&self, id: UserId) -> StoreResult<Option<User>>;

    /// Users for the given ids; unknown ids are skipped.
    async fn users(&self, ids: &[UserId]) -> StoreResult<Vec<User>>;

    async fn user_by_username(&self, username: &str) -> StoreResult<Option<User>>;

    /// Users whose username contains `fragment`, ignoring case.
    async fn search_users(&self, fragment: &str) -> StoreResult<Vec<User>>;

    async fn conversation(&self, id: ConversationId) -> StoreResult<Option<Conversation>>;

    /// Conversations `user_id` participates in, most recently updated first.
    async fn conversations_for_user(&self, user_id: UserId) -> StoreResult<Vec<Conversation>>;

    /// Participants of a conversation in insertion order.
    async fn participants(&self, conversation_id: ConversationId) -> StoreResult<Vec<Participant>>;

    async fn participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> StoreResult<Option<Participant>>;

    async fn message(&self, id: MessageId) -> StoreResult<Option<Message>>;

    /// Messages of a conversation, newest first.
    async fn messages(&self, conversation_id: ConversationId) -> StoreResult<Vec<Message>>;

    /// Apply `batch` atomically.
    async fn transaction(&self, batch: WriteBatch) -> StoreResult<()>;
}

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<UserId, User>,
    conversations: HashMap<ConversationId, Conversation>,
    participants: HashMap<ConversationId, Vec<Participant>>,
    messages: HashMap<ConversationId, Vec<Message>>,
    message_index: HashMap<MessageId, ConversationId>,
}

/// Prior state of one row group, recorded before it is overwritten.
enum Undo {
    User(UserId, Option<User>),
    Conversation(ConversationId, Option<Conversation>),
    Participants(ConversationId, Option<Vec<Participant>>),
    Messages(ConversationId, Option<Vec<Message>>),
}

fn not_found(entity: &'static str, id: impl ToString) -> StoreError {
    StoreError::NotFound {
        entity,
        id: id.to_string(),
    }
}

impl Tables {
    fn require_conversation(&self, id: ConversationId) -> StoreResult<&Conversation> {
        self.conversations
            .get(&id)
            .ok_or_else(|| not_found("conversation", id))
    }

    fn participants_undo(&self, id: ConversationId) -> Undo {
        Undo::Participants(id, self.participants.get(&id).cloned())
    }

    fn messages_undo(&self, id: ConversationId) -> Undo {
        Undo::Messages(id, self.messages.get(&id).cloned())
    }

    fn check_username(&self, user: &User) -> StoreResult<()> {
        let Some(username) = user.username.as_deref() else {
            return Ok(());
        };
        let taken = self
            .users
            .values()
            .any(|u| u.id != user.id && u.username.as_deref() == Some(username));
        if taken {
            return Err(StoreError::UniqueViolation(format!("username {username}")));
        }
        Ok(())
    }

    fn apply(&mut self, write: Write, undo: &mut Vec<Undo>) -> StoreResult<()> {
        match write {
            Write::InsertConversation(conversation) => {
                if self.conversations.contains_key(&conversation.id) {
                    return Err(StoreError::UniqueViolation(format!(
                        "conversation {}",
                        conversation.id
                    )));
                }
                if conversation.latest_message_id.is_some() {
                    return Err(StoreError::ForeignKey(format!(
                        "new conversation {} cannot reference a message",
                        conversation.id
                    )));
                }
                undo.push(Undo::Conversation(conversation.id, None));
                self.conversations.insert(conversation.id, conversation);
            }

            Write::InsertParticipant(participant) => {
                let conversation_id = participant.conversation_id;
                if !self.conversations.contains_key(&conversation_id) {
                    return Err(StoreError::ForeignKey(format!(
                        "participant references missing conversation {conversation_id}"
                    )));
                }
                if !self.users.contains_key(&participant.user_id) {
                    return Err(StoreError::ForeignKey(format!(
                        "participant references missing user {}",
                        participant.user_id
                    )));
                }
                let existing = self.participants.get(&conversation_id);
                if existing.is_some_and(|rows| rows.iter().any(|p| p.user_id == participant.user_id)) {
                    return Err(StoreError::UniqueViolation(format!(
                        "participant ({conversation_id}, {})",
                        participant.user_id
                    )));
                }
                undo.push(self.participants_undo(conversation_id));
                self.participants
                    .entry(conversation_id)
                    .or_default()
                    .push(participant);
            }

            Write::InsertMessage(message) => {
                let conversation_id = message.conversation_id;
                if !self.conversations.contains_key(&conversation_id) {
                    return Err(StoreError::ForeignKey(format!(
                        "message references missing conversation {conversation_id}"
                    )));
                }
                if !self.users.contains_key(&message.sender_id) {
                    return Err(StoreError::ForeignKey(format!(
                        "message references missing user {}",
                        message.sender_id
                    )));
                }
                if self.message_index.contains_key(&message.id) {
                    return Err(StoreError::UniqueViolation(format!("message {}", message.id)));
                }
                undo.push(self.messages_undo(conversation_id));
                self.message_index.insert(message.id, conversation_id);
                self.messages.entry(conversation_id).or_default().push(message);
            }

            Write::SetLatestMessage {
                conversation_id,
                message_id,
                at,
            } => {
                let previous = self.require_conversation(conversation_id)?.clone();
                if let Some(message_id) = message_id {
                    if self.message_index.get(&message_id) != Some(&conversation_id) {
                        return Err(StoreError::ForeignKey(format!(
                            "message {message_id} does not belong to conversation {conversation_id}"
                        )));
                    }
                }
                undo.push(Undo::Conversation(conversation_id, Some(previous)));
                if let Some(conversation) = self.conversations.get_mut(&conversation_id) {
                    conversation.latest_message_id = message_id;
                    conversation.updated_at = at;
                }
            }

            Write::SetSeen {
                conversation_id,
                user_id,
                seen,
            } => {
                let exists = self
                    .participants
                    .get(&conversation_id)
                    .is_some_and(|rows| rows.iter().any(|p| p.user_id == user_id));
                if !exists {
                    return Err(not_found(
                        "participant",
                        format!("({conversation_id}, {user_id})"),
                    ));
                }
                undo.push(self.participants_undo(conversation_id));
                if let Some(rows) = self.participants.get_mut(&conversation_id) {
                    for row in rows.iter_mut().filter(|p| p.user_id == user_id) {
                        row.has_seen_latest_message = seen;
                    }
                }
            }

            Write::SetSeenExcept {
                conversation_id,
                user_id,
                seen,
            } => {
                undo.push(self.participants_undo(conversation_id));
                if let Some(rows) = self.participants.get_mut(&conversation_id) {
                    for row in rows.iter_mut().filter(|p| p.user_id != user_id) {
                        row.has_seen_latest_message = seen;
                    }
                }
            }

            Write::DeleteParticipants { conversation_id } => {
                undo.push(self.participants_undo(conversation_id));
                self.participants.remove(&conversation_id);
            }

            Write::DeleteMessages { conversation_id } => {
                let still_referenced = self
                    .conversations
                    .get(&conversation_id)
                    .is_some_and(|c| c.latest_message_id.is_some());
                if still_referenced {
                    return Err(StoreError::ForeignKey(format!(
                        "conversation {conversation_id} still references its latest message"
                    )));
                }
                undo.push(self.messages_undo(conversation_id));
                if let Some(rows) = self.messages.remove(&conversation_id) {
                    for message in rows {
                        self.message_index.remove(&message.id);
                    }
                }
            }

            Write::DeleteConversation { conversation_id } => {
                let previous = self.require_conversation(conversation_id)?.clone();
                let has_participants = self
                    .participants
                    .get(&conversation_id)
                    .is_some_and(|rows| !rows.is_empty());
                let has_messages = self
                    .messages
                    .get(&conversation_id)
                    .is_some_and(|rows| !rows.is_empty());
                if has_participants || has_messages {
                    return Err(StoreError::ForeignKey(format!(
                        "conversation {conversation_id} is still referenced by participants or messages"
                    )));
                }
                undo.push(Undo::Conversation(conversation_id, Some(previous)));
                self.conversations.remove(&conversation_id);
            }

            Write::InsertUser(user) => {
                if self.users.contains_key(&user.id) {
                    return Err(StoreError::UniqueViolation(format!("user {}", user.id)));
                }
                self.check_username(&user)?;
                undo.push(Undo::User(user.id, None));
                self.users.insert(user.id, user);
            }

            Write::PutUser(user) => {
                self.check_username(&user)?;
                undo.push(Undo::User(user.id, self.users.get(&user.id).cloned()));
                self.users.insert(user.id, user);
            }
        }

        Ok(())
    }

    fn restore(&mut self, undo: Undo) {
        match undo {
            Undo::User(id, row) => match row {
                Some(user) => {
                    self.users.insert(id, user);
                }
                None => {
                    self.users.remove(&id);
                }
            },
            Undo::Conversation(id, row) => match row {
                Some(conversation) => {
                    self.conversations.insert(id, conversation);
                }
                None => {
                    self.conversations.remove(&id);
                }
            },
            Undo::Participants(id, rows) => match rows {
                Some(rows) => {
                    self.participants.insert(id, rows);
                }
                None => {
                    self.participants.remove(&id);
                }
            },
            Undo::Messages(id, rows) => {
                if let Some(current) = self.messages.remove(&id) {
                    for message in current {
                        self.message_index.remove(&message.id);
                    }
                }
                if let Some(rows) = rows {
                    for message in &rows {
                        self.message_index.insert(message.id, id);
                    }
                    self.messages.insert(id, rows);
                }
            }
        }
    }
}

/// In-process [`EntityStore`].
///
/// A batch holds the table write lock from its first write until it has
/// either fully applied or been rolled back, so readers never see a partial
/// batch.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn user(&self, id: UserId) -> StoreResult<Option<User>> {
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn users(&self, ids: &[UserId]) -> StoreResult<Vec<User>> {
        let tables = self.tables.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.users.get(id).cloned())
            .collect())
    }

    async fn user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .values()
            .find(|u| u.username.as_deref() == Some(username))
            .cloned())
    }

    async fn search_users(&self, fragment: &str) -> StoreResult<Vec<User>> {
        let needle = fragment.to_lowercase();
        let tables = self.tables.read().await;
        let mut found: Vec<User> = tables
            .users
            .values()
            .filter(|u| {
                u.username
                    .as_deref()
                    .is_some_and(|name| name.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(found)
    }

    async fn conversation(&self, id: ConversationId) -> StoreResult<Option<Conversation>> {
        Ok(self.tables.read().await.conversations.get(&id).cloned())
    }

    async fn conversations_for_user(&self, user_id: UserId) -> StoreResult<Vec<Conversation>> {
        let tables = self.tables.read().await;
        let mut found: Vec<Conversation> = tables
            .participants
            .iter()
            .filter(|(_, rows)| rows.iter().any(|p| p.user_id == user_id))
            .filter_map(|(id, _)| tables.conversations.get(id).cloned())
            .collect();
        found.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(found)
    }

    async fn participants(&self, conversation_id: ConversationId) -> StoreResult<Vec<Participant>> {
        let tables = self.tables.read().await;
        Ok(tables
            .participants
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> StoreResult<Option<Participant>> {
        let tables = self.tables.read().await;
        Ok(tables
            .participants
            .get(&conversation_id)
            .and_then(|rows| rows.iter().find(|p| p.user_id == user_id))
            .cloned())
    }

    async fn message(&self, id: MessageId) -> StoreResult<Option<Message>> {
        let tables = self.tables.read().await;
        Ok(tables
            .message_index
            .get(&id)
            .and_then(|conversation_id| tables.messages.get(conversation_id))
            .and_then(|rows| rows.iter().find(|m| m.id == id))
            .cloned())
    }

    async fn messages(&self, conversation_id: ConversationId) -> StoreResult<Vec<Message>> {
        let tables = self.tables.read().await;
        Ok(tables
            .messages
            .get(&conversation_id)
            .map(|rows| rows.iter().rev().cloned().collect())
            .unwrap_or_default())
    }

    async fn transaction(&self, batch: WriteBatch) -> StoreResult<()> {
        let writes = batch.len();
        let mut tables = self.tables.write().await;
        let mut undo = Vec::with_capacity(writes);

        for write in batch {
            if let Err(e) = tables.apply(write, &mut undo) {
                while let Some(step) = undo.pop() {
                    tables.restore(step);
                }
                debug!(error = %e, writes, "Transaction rolled back");
                return Err(e);
            }
        }

        trace!(writes, "Transaction committed");
        Ok(())
    }
}
