//! Caller identity and per-connection subscription scope.

use crate::bus::{EventBus, Subscription};
use crate::error::{EngineError, EngineResult};
use crate::event::Filter;
use crate::model::{ConversationId, UserId};
use parley_protocol::Topic;
use tracing::{debug, warn};

/// The identity the API layer authenticated for a call. The engine never
/// authenticates; it only checks what it is given.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Session {
    user_id: Option<UserId>,
}

impl Session {
    #[must_use]
    pub fn authenticated(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
        }
    }

    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    /// The session's user, or `Unauthorized` for an anonymous session.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Unauthorized`] if no user is attached.
    pub fn require_user(&self) -> EngineResult<UserId> {
        self.user_id.ok_or_else(EngineError::unauthorized)
    }
}

/// What a client asks to be told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionRequest {
    ConversationCreated,
    ConversationUpdated,
    ConversationDeleted,
    MessageSent { conversation_id: ConversationId },
}

impl SubscriptionRequest {
    #[must_use]
    pub fn topic(&self) -> Topic {
        match self {
            SubscriptionRequest::ConversationCreated => Topic::ConversationCreated,
            SubscriptionRequest::ConversationUpdated => Topic::ConversationUpdated,
            SubscriptionRequest::ConversationDeleted => Topic::ConversationDeleted,
            SubscriptionRequest::MessageSent { .. } => Topic::MessageSent,
        }
    }

    /// Build a request from a wire topic and optional conversation filter.
    /// `MessageSent` needs the filter; the others ignore it.
    #[must_use]
    pub fn from_topic(topic: Topic, conversation_id: Option<ConversationId>) -> Option<Self> {
        match topic {
            Topic::ConversationCreated => Some(SubscriptionRequest::ConversationCreated),
            Topic::ConversationUpdated => Some(SubscriptionRequest::ConversationUpdated),
            Topic::ConversationDeleted => Some(SubscriptionRequest::ConversationDeleted),
            Topic::MessageSent => {
                conversation_id.map(|conversation_id| SubscriptionRequest::MessageSent { conversation_id })
            }
        }
    }

    fn filter(&self, user_id: UserId) -> Filter {
        match self {
            SubscriptionRequest::MessageSent { conversation_id } => {
                Filter::Conversation(*conversation_id)
            }
            _ => Filter::Participant(user_id),
        }
    }
}

/// One live client connection's view of the bus.
///
/// Every subscription opened through the session is tagged with its
/// connection id; dropping the session releases all of them, whichever way
/// the connection ended.
pub struct SubscriptionSession {
    connection_id: String,
    session: Session,
    bus: EventBus,
}

impl SubscriptionSession {
    #[must_use]
    pub fn new(bus: EventBus, connection_id: impl Into<String>, session: Session) -> Self {
        let connection_id = connection_id.into();
        debug!(
            connection = %connection_id,
            authenticated = session.user_id().is_some(),
            "Subscription session opened"
        );
        Self {
            connection_id,
            session,
            bus,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Register a subscription with its predicate bound to this session's user.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Unauthorized`] if the session is anonymous.
    pub fn subscribe(&self, request: SubscriptionRequest) -> EngineResult<Subscription> {
        let user_id = match self.session.require_user() {
            Ok(user_id) => user_id,
            Err(e) => {
                warn!(connection = %self.connection_id, topic = %request.topic(), "Anonymous subscribe rejected");
                return Err(e);
            }
        };

        Ok(self
            .bus
            .subscribe_for(&self.connection_id, request.topic(), request.filter(user_id)))
    }
}

impl Drop for SubscriptionSession {
    fn drop(&mut self) {
        let released = self.bus.unsubscribe_connection(&self.connection_id);
        debug!(connection = %self.connection_id, released, "Subscription session closed");
    }
}
