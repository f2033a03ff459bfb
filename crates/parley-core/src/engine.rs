//! State transition engine.
//!
//! Every mutating operation follows the same shape:
//!
//! 1. check the caller against the [`Session`],
//! 2. take the conversation's lock,
//! 3. read what the transition needs,
//! 4. commit one [`WriteBatch`],
//! 5. publish the resulting events,
//! 6. release the lock.
//!
//! Publishing while the lock is still held makes the event order for a
//! conversation equal to its commit order. A failed commit returns before
//! step 5, so a rejected transition is never observable on the bus.

use crate::bus::{EventBus, Subscription};
use crate::error::{EngineError, EngineResult};
use crate::event::Event;
use crate::locks::ConversationLocks;
use crate::membership::is_authorized;
use crate::model::{
    Conversation, ConversationId, ConversationView, Message, MessageView, Participant,
    ParticipantView, User, UserId, UserSummary,
};
use crate::session::{Session, SubscriptionRequest, SubscriptionSession};
use crate::store::{EntityStore, StoreError, WriteBatch};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Arguments of [`Engine::send_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
}

/// Applies conversation state transitions and publishes their events.
pub struct Engine {
    store: Arc<dyn EntityStore>,
    bus: EventBus,
    locks: ConversationLocks,
}

impl Engine {
    #[must_use]
    pub fn new(store: Arc<dyn EntityStore>, bus: EventBus) -> Self {
        info!(
            subscriber_capacity = bus.config().subscriber_capacity,
            "Creating engine"
        );
        Self {
            store,
            bus,
            locks: ConversationLocks::new(),
        }
    }

    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    /// Make sure a user row exists for an identity the API layer vouches for.
    /// An existing row is returned untouched.
    pub async fn register_user(&self, user: User) -> EngineResult<User> {
        if let Some(existing) = self.store.user(user.id).await? {
            return Ok(existing);
        }

        let user_id = user.id;
        match self
            .commit("register_user", WriteBatch::new().insert_user(user.clone()))
            .await
        {
            Ok(()) => {
                info!(user = %user_id, "Registered user");
                Ok(user)
            }
            // Lost a race with another registration of the same id.
            Err(EngineError::Conflict(what)) => match self.store.user(user_id).await? {
                Some(existing) => Ok(existing),
                None => Err(EngineError::Conflict(what)),
            },
            Err(e) => Err(e),
        }
    }

    /// Create a conversation between the caller and `participant_ids`.
    ///
    /// The caller is always a participant and the only one who starts out
    /// having seen the (empty) conversation. Repeated ids collapse into one
    /// membership.
    pub async fn create_conversation(
        &self,
        session: &Session,
        participant_ids: Vec<UserId>,
    ) -> EngineResult<ConversationView> {
        let creator = session.require_user()?;

        let mut member_ids: Vec<UserId> = Vec::with_capacity(participant_ids.len() + 1);
        for id in participant_ids.into_iter().chain(std::iter::once(creator)) {
            if !member_ids.contains(&id) {
                member_ids.push(id);
            }
        }

        let users = self.store.users(&member_ids).await?;
        if let Some(missing) = member_ids
            .iter()
            .find(|id| !users.iter().any(|u| u.id == **id))
        {
            warn!(creator = %creator, user = %missing, "Conversation with unknown user rejected");
            return Err(EngineError::NotFound(format!("user {missing}")));
        }

        let conversation = Conversation::new();
        let participants: Vec<Participant> = member_ids
            .iter()
            .map(|id| Participant::new(conversation.id, *id, *id == creator))
            .collect();

        let batch = participants.iter().cloned().fold(
            WriteBatch::new().insert_conversation(conversation.clone()),
            WriteBatch::insert_participant,
        );

        // No lock: the conversation id is fresh, nobody else can reference it yet.
        self.commit("create_conversation", batch).await?;

        let view = conversation_view(&conversation, &participants, &users, None);
        info!(
            conversation = %view.id,
            creator = %creator,
            participants = view.participants.len(),
            "Conversation created"
        );
        self.bus.publish(Event::ConversationCreated(view.clone()));
        Ok(view)
    }

    /// Append a message, move the conversation's latest-message pointer and
    /// reset everyone's seen flag except the sender's.
    pub async fn send_message(
        &self,
        session: &Session,
        args: SendMessage,
    ) -> EngineResult<MessageView> {
        let caller = session.require_user()?;
        let SendMessage {
            conversation_id,
            sender_id,
            body,
        } = args;

        if caller != sender_id {
            warn!(caller = %caller, sender = %sender_id, "Sender does not match session");
            return Err(EngineError::unauthorized());
        }

        let _guard = self.locks.acquire(conversation_id).await;

        let mut conversation = self.require_conversation(conversation_id).await?;
        let participants = self.store.participants(conversation_id).await?;
        if !is_authorized(&participants, sender_id) {
            warn!(conversation = %conversation_id, sender = %sender_id, "Send by non-participant rejected");
            return Err(EngineError::Unauthorized(
                "not a participant of this conversation".to_string(),
            ));
        }
        let users = self.store.users(&member_ids(&participants)).await?;

        let message = Message::new(conversation_id, sender_id, body);
        let batch = WriteBatch::new()
            .insert_message(message.clone())
            .set_latest_message(conversation_id, Some(message.id), message.created_at)
            .set_seen(conversation_id, sender_id, true)
            .set_seen_except(conversation_id, sender_id, false);
        self.commit("send_message", batch).await?;

        // The lock is held, so the committed state is exactly the pre-read
        // state with this batch applied.
        conversation.latest_message_id = Some(message.id);
        conversation.updated_at = message.created_at;
        let participants: Vec<Participant> = participants
            .into_iter()
            .map(|mut p| {
                p.has_seen_latest_message = p.user_id == sender_id;
                p
            })
            .collect();

        let message_view = message_view(&message, &users);
        let updated = conversation_view(
            &conversation,
            &participants,
            &users,
            Some(message_view.clone()),
        );

        debug!(
            conversation = %conversation_id,
            message = %message.id,
            sender = %sender_id,
            "Message sent"
        );
        self.bus.publish(Event::MessageSent(message_view.clone()));
        self.bus.publish(Event::ConversationUpdated(updated));
        Ok(message_view)
    }

    /// Mark the conversation's latest message as seen by `user_id`.
    ///
    /// Touches only that participant's flag and publishes nothing.
    pub async fn mark_conversation_as_read(
        &self,
        session: &Session,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> EngineResult<bool> {
        let caller = session.require_user()?;
        if caller != user_id {
            warn!(caller = %caller, user = %user_id, "Mark-as-read for another user rejected");
            return Err(EngineError::unauthorized());
        }

        let _guard = self.locks.acquire(conversation_id).await;

        if self
            .store
            .participant(conversation_id, user_id)
            .await?
            .is_none()
        {
            return Err(EngineError::NotFound("Participant entity".to_string()));
        }

        self.commit(
            "mark_conversation_as_read",
            WriteBatch::new().set_seen(conversation_id, user_id, true),
        )
        .await?;

        debug!(conversation = %conversation_id, user = %user_id, "Conversation marked as read");
        Ok(true)
    }

    /// Delete a conversation with all of its participants and messages.
    ///
    /// The returned view, and the published event, carry the participant set
    /// as it was immediately before the delete.
    pub async fn delete_conversation(
        &self,
        session: &Session,
        conversation_id: ConversationId,
    ) -> EngineResult<ConversationView> {
        let caller = session.require_user()?;

        let _guard = self.locks.acquire(conversation_id).await;

        let conversation = self.require_conversation(conversation_id).await?;
        let snapshot = self.store.participants(conversation_id).await?;
        let users = self.store.users(&member_ids(&snapshot)).await?;

        let batch = WriteBatch::new()
            .delete_participants(conversation_id)
            .set_latest_message(conversation_id, None, conversation.updated_at)
            .delete_messages(conversation_id)
            .delete_conversation(conversation_id);
        self.commit("delete_conversation", batch).await?;

        let deleted = Conversation {
            latest_message_id: None,
            ..conversation
        };
        let view = conversation_view(&deleted, &snapshot, &users, None);

        info!(
            conversation = %conversation_id,
            deleted_by = %caller,
            participants = view.participants.len(),
            "Conversation deleted"
        );
        self.bus.publish(Event::ConversationDeleted(view.clone()));
        Ok(view)
    }

    /// Conversations the caller participates in, most recently updated first.
    pub async fn conversations(&self, session: &Session) -> EngineResult<Vec<ConversationView>> {
        let user_id = session.require_user()?;

        let mut views = Vec::new();
        for candidate in self.store.conversations_for_user(user_id).await? {
            let _guard = self.locks.acquire(candidate.id).await;
            // Re-read under the lock; it may have changed or gone since the listing.
            let Some(conversation) = self.store.conversation(candidate.id).await? else {
                continue;
            };
            views.push(self.load_view(&conversation).await?);
        }
        views.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(views)
    }

    /// Messages of a conversation, newest first. Only participants may read them.
    pub async fn messages(
        &self,
        session: &Session,
        conversation_id: ConversationId,
    ) -> EngineResult<Vec<MessageView>> {
        let user_id = session.require_user()?;

        self.require_conversation(conversation_id).await?;
        let participants = self.store.participants(conversation_id).await?;
        if !is_authorized(&participants, user_id) {
            return Err(EngineError::unauthorized());
        }

        let messages = self.store.messages(conversation_id).await?;
        let mut sender_ids: Vec<UserId> = Vec::new();
        for message in &messages {
            if !sender_ids.contains(&message.sender_id) {
                sender_ids.push(message.sender_id);
            }
        }
        let users = self.store.users(&sender_ids).await?;

        Ok(messages.iter().map(|m| message_view(m, &users)).collect())
    }

    /// Users whose username contains `username`, ignoring case. The caller is
    /// never part of the result.
    pub async fn search_users(
        &self,
        session: &Session,
        username: &str,
    ) -> EngineResult<Vec<UserSummary>> {
        let user_id = session.require_user()?;

        Ok(self
            .store
            .search_users(username)
            .await?
            .iter()
            .filter(|u| u.id != user_id)
            .map(User::summary)
            .collect())
    }

    /// Claim `username` for the caller.
    pub async fn create_username(&self, session: &Session, username: &str) -> EngineResult<()> {
        let user_id = session.require_user()?;

        if let Some(holder) = self.store.user_by_username(username).await? {
            if holder.id == user_id {
                return Ok(());
            }
            return Err(EngineError::Conflict("Username already taken.".to_string()));
        }

        let user = self
            .store
            .user(user_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("user {user_id}")))?
            .with_username(username);

        match self
            .commit("create_username", WriteBatch::new().put_user(user))
            .await
        {
            // Lost a race for the same name.
            Err(EngineError::Conflict(_)) => {
                Err(EngineError::Conflict("Username already taken.".to_string()))
            }
            other => other,
        }?;

        info!(user = %user_id, username, "Username created");
        Ok(())
    }

    /// Open a subscription for a connection.
    ///
    /// Conversation-level topics are filtered to the session user's
    /// conversations; `MessageSent` additionally requires the user to be a
    /// participant of the requested conversation at subscribe time.
    pub async fn subscribe(
        &self,
        session: &SubscriptionSession,
        request: SubscriptionRequest,
    ) -> EngineResult<Subscription> {
        let user_id = session.session().require_user()?;

        if let SubscriptionRequest::MessageSent { conversation_id } = request {
            if self
                .store
                .participant(conversation_id, user_id)
                .await?
                .is_none()
            {
                warn!(
                    connection = session.connection_id(),
                    conversation = %conversation_id,
                    "Message subscription by non-participant rejected"
                );
                return Err(EngineError::Unauthorized(
                    "not a participant of this conversation".to_string(),
                ));
            }
        }

        session.subscribe(request)
    }

    async fn require_conversation(&self, id: ConversationId) -> EngineResult<Conversation> {
        self.store
            .conversation(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("conversation {id}")))
    }

    async fn commit(&self, operation: &'static str, batch: WriteBatch) -> EngineResult<()> {
        let writes = batch.len();
        self.store.transaction(batch).await.map_err(|e| {
            match e {
                StoreError::Unavailable(_) | StoreError::ForeignKey(_) => {
                    error!(operation, writes, error = %e, "Transaction failed");
                }
                _ => debug!(operation, writes, error = %e, "Transaction rejected"),
            }
            EngineError::from(e)
        })
    }

    async fn load_view(&self, conversation: &Conversation) -> EngineResult<ConversationView> {
        let participants = self.store.participants(conversation.id).await?;
        let latest = match conversation.latest_message_id {
            Some(id) => self.store.message(id).await?,
            None => None,
        };

        let mut ids = member_ids(&participants);
        if let Some(message) = &latest {
            if !ids.contains(&message.sender_id) {
                ids.push(message.sender_id);
            }
        }
        let users = self.store.users(&ids).await?;

        let latest = latest.map(|m| message_view(&m, &users));
        Ok(conversation_view(conversation, &participants, &users, latest))
    }
}

fn member_ids(participants: &[Participant]) -> Vec<UserId> {
    participants.iter().map(|p| p.user_id).collect()
}

fn summary(user_id: UserId, users: &[User]) -> UserSummary {
    users
        .iter()
        .find(|u| u.id == user_id)
        .map_or(
            UserSummary {
                id: user_id,
                username: None,
            },
            User::summary,
        )
}

fn message_view(message: &Message, users: &[User]) -> MessageView {
    MessageView {
        id: message.id,
        conversation_id: message.conversation_id,
        sender: summary(message.sender_id, users),
        body: message.body.clone(),
        created_at: message.created_at,
    }
}

fn conversation_view(
    conversation: &Conversation,
    participants: &[Participant],
    users: &[User],
    latest_message: Option<MessageView>,
) -> ConversationView {
    ConversationView {
        id: conversation.id,
        latest_message,
        participants: participants
            .iter()
            .map(|p| ParticipantView {
                id: p.id,
                user: summary(p.user_id, users),
                has_seen_latest_message: p.has_seen_latest_message,
            })
            .collect(),
        created_at: conversation.created_at,
        updated_at: conversation.updated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use crate::error::ErrorKind;
    use crate::model::MessageId;
    use crate::store::{MemoryStore, StoreResult};
    use async_trait::async_trait;
    use parley_protocol::Topic;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use uuid::Uuid;

    struct Fixture {
        engine: Arc<Engine>,
        store: Arc<MemoryStore>,
        alice: UserId,
        bob: UserId,
        carol: UserId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(Engine::new(store.clone(), EventBus::new()));

        let mut ids = Vec::new();
        for name in ["alice", "bob", "carol"] {
            let user = engine
                .register_user(User::new(Uuid::new_v4()).with_username(name))
                .await
                .unwrap();
            ids.push(user.id);
        }

        Fixture {
            engine,
            store,
            alice: ids[0],
            bob: ids[1],
            carol: ids[2],
        }
    }

    fn as_user(user_id: UserId) -> Session {
        Session::authenticated(user_id)
    }

    fn send(conversation_id: ConversationId, sender_id: UserId, body: &str) -> SendMessage {
        SendMessage {
            conversation_id,
            sender_id,
            body: body.to_string(),
        }
    }

    fn seen_flags(view: &ConversationView) -> Vec<(UserId, bool)> {
        view.participants
            .iter()
            .map(|p| (p.user.id, p.has_seen_latest_message))
            .collect()
    }

    async fn stored_flags(store: &MemoryStore, conversation_id: ConversationId) -> Vec<(UserId, bool)> {
        store
            .participants(conversation_id)
            .await
            .unwrap()
            .iter()
            .map(|p| (p.user_id, p.has_seen_latest_message))
            .collect()
    }

    #[tokio::test]
    async fn test_create_conversation() {
        let f = fixture().await;
        let mut alice_feed = f.engine.bus().subscribe(
            Topic::ConversationCreated,
            crate::event::Filter::Participant(f.alice),
        );
        let mut carol_feed = f.engine.bus().subscribe(
            Topic::ConversationCreated,
            crate::event::Filter::Participant(f.carol),
        );

        let view = f
            .engine
            .create_conversation(&as_user(f.alice), vec![f.bob])
            .await
            .unwrap();

        assert_eq!(seen_flags(&view), vec![(f.bob, false), (f.alice, true)]);
        assert_eq!(view.latest_message, None);
        assert_eq!(
            view.participant(f.bob).unwrap().user.username.as_deref(),
            Some("bob")
        );
        assert_eq!(stored_flags(&f.store, view.id).await, seen_flags(&view));

        match alice_feed.try_recv().as_deref() {
            Some(Event::ConversationCreated(c)) => assert_eq!(c, &view),
            other => panic!("unexpected {:?}", other),
        }
        assert!(carol_feed.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_create_collapses_duplicate_members() {
        let f = fixture().await;

        let view = f
            .engine
            .create_conversation(&as_user(f.alice), vec![f.bob, f.alice, f.bob])
            .await
            .unwrap();

        assert_eq!(seen_flags(&view), vec![(f.bob, false), (f.alice, true)]);
    }

    #[tokio::test]
    async fn test_create_with_unknown_user_applies_nothing() {
        let f = fixture().await;
        let mut feed = f.engine.bus().subscribe(
            Topic::ConversationCreated,
            crate::event::Filter::Participant(f.alice),
        );

        let result = f
            .engine
            .create_conversation(&as_user(f.alice), vec![Uuid::new_v4()])
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::NotFound);
        assert!(f.store.conversations_for_user(f.alice).await.unwrap().is_empty());
        assert!(feed.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_anonymous_caller_rejected() {
        let f = fixture().await;
        let anonymous = Session::anonymous();
        let conversation = f
            .engine
            .create_conversation(&as_user(f.alice), vec![f.bob])
            .await
            .unwrap();

        let created = f.engine.create_conversation(&anonymous, vec![f.bob]).await;
        let sent = f
            .engine
            .send_message(&anonymous, send(conversation.id, f.alice, "hi"))
            .await;
        let read = f
            .engine
            .mark_conversation_as_read(&anonymous, f.alice, conversation.id)
            .await;
        let deleted = f.engine.delete_conversation(&anonymous, conversation.id).await;

        assert_eq!(created.unwrap_err(), EngineError::unauthorized());
        assert_eq!(sent.unwrap_err(), EngineError::unauthorized());
        assert_eq!(read.unwrap_err(), EngineError::unauthorized());
        assert_eq!(deleted.unwrap_err(), EngineError::unauthorized());
        assert!(f.store.conversation(conversation.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_send_message_updates_state_and_fans_out() {
        let f = fixture().await;
        let conversation = f
            .engine
            .create_conversation(&as_user(f.alice), vec![f.bob, f.carol])
            .await
            .unwrap();

        let bob = SubscriptionSession::new(f.engine.bus().clone(), "bob", as_user(f.bob));
        let mut bob_messages = f
            .engine
            .subscribe(
                &bob,
                SubscriptionRequest::MessageSent {
                    conversation_id: conversation.id,
                },
            )
            .await
            .unwrap();
        let mut bob_updates = f
            .engine
            .subscribe(&bob, SubscriptionRequest::ConversationUpdated)
            .await
            .unwrap();

        let message = f
            .engine
            .send_message(&as_user(f.alice), send(conversation.id, f.alice, "hi"))
            .await
            .unwrap();

        assert_eq!(message.body, "hi");
        assert_eq!(message.sender.username.as_deref(), Some("alice"));

        let stored = f.store.conversation(conversation.id).await.unwrap().unwrap();
        assert_eq!(stored.latest_message_id, Some(message.id));
        assert_eq!(
            stored_flags(&f.store, conversation.id).await,
            vec![(f.bob, false), (f.carol, false), (f.alice, true)]
        );

        match bob_messages.try_recv().as_deref() {
            Some(Event::MessageSent(m)) => assert_eq!(m, &message),
            other => panic!("unexpected {:?}", other),
        }
        match bob_updates.try_recv().as_deref() {
            Some(Event::ConversationUpdated(c)) => {
                assert_eq!(c.latest_message.as_ref(), Some(&message));
                assert_eq!(seen_flags(c), stored_flags(&f.store, conversation.id).await);
                assert_eq!(c.updated_at, stored.updated_at);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_outsider_sees_nothing() {
        let f = fixture().await;
        let conversation = f
            .engine
            .create_conversation(&as_user(f.alice), vec![f.bob])
            .await
            .unwrap();

        let carol = SubscriptionSession::new(f.engine.bus().clone(), "carol", as_user(f.carol));
        let mut carol_updates = f
            .engine
            .subscribe(&carol, SubscriptionRequest::ConversationUpdated)
            .await
            .unwrap();
        let messages = f
            .engine
            .subscribe(
                &carol,
                SubscriptionRequest::MessageSent {
                    conversation_id: conversation.id,
                },
            )
            .await;
        assert!(matches!(messages, Err(e) if e.kind() == ErrorKind::Authorization));

        f.engine
            .send_message(&as_user(f.alice), send(conversation.id, f.alice, "hi"))
            .await
            .unwrap();

        assert!(carol_updates.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_send_message_rejections() {
        let f = fixture().await;
        let conversation = f
            .engine
            .create_conversation(&as_user(f.alice), vec![f.bob])
            .await
            .unwrap();

        let impersonated = f
            .engine
            .send_message(&as_user(f.bob), send(conversation.id, f.alice, "hi"))
            .await;
        assert_eq!(impersonated.unwrap_err().kind(), ErrorKind::Authorization);

        let outsider = f
            .engine
            .send_message(&as_user(f.carol), send(conversation.id, f.carol, "hi"))
            .await;
        assert_eq!(outsider.unwrap_err().kind(), ErrorKind::Authorization);

        let missing = f
            .engine
            .send_message(&as_user(f.alice), send(Uuid::new_v4(), f.alice, "hi"))
            .await;
        assert_eq!(missing.unwrap_err().kind(), ErrorKind::NotFound);

        assert!(f.store.messages(conversation.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_only_latest_sender_has_seen() {
        let f = fixture().await;
        let conversation = f
            .engine
            .create_conversation(&as_user(f.alice), vec![f.bob, f.carol])
            .await
            .unwrap();

        for sender in [f.bob, f.alice, f.carol, f.bob] {
            f.engine
                .send_message(&as_user(sender), send(conversation.id, sender, "x"))
                .await
                .unwrap();

            let seen: Vec<UserId> = stored_flags(&f.store, conversation.id)
                .await
                .into_iter()
                .filter(|(_, seen)| *seen)
                .map(|(id, _)| id)
                .collect();
            assert_eq!(seen, vec![sender]);
        }
    }

    #[tokio::test]
    async fn test_mark_as_read_touches_one_flag() {
        let f = fixture().await;
        let conversation = f
            .engine
            .create_conversation(&as_user(f.alice), vec![f.bob, f.carol])
            .await
            .unwrap();
        f.engine
            .send_message(&as_user(f.alice), send(conversation.id, f.alice, "hi"))
            .await
            .unwrap();

        let mut updates = f.engine.bus().subscribe(
            Topic::ConversationUpdated,
            crate::event::Filter::Participant(f.bob),
        );

        let read = f
            .engine
            .mark_conversation_as_read(&as_user(f.bob), f.bob, conversation.id)
            .await
            .unwrap();

        assert!(read);
        assert_eq!(
            stored_flags(&f.store, conversation.id).await,
            vec![(f.bob, true), (f.carol, false), (f.alice, true)]
        );
        assert!(updates.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_mark_as_read_rejections() {
        let f = fixture().await;
        let conversation = f
            .engine
            .create_conversation(&as_user(f.alice), vec![f.bob])
            .await
            .unwrap();

        let for_someone_else = f
            .engine
            .mark_conversation_as_read(&as_user(f.alice), f.bob, conversation.id)
            .await;
        assert_eq!(for_someone_else.unwrap_err().kind(), ErrorKind::Authorization);

        let outsider = f
            .engine
            .mark_conversation_as_read(&as_user(f.carol), f.carol, conversation.id)
            .await;
        assert_eq!(
            outsider.unwrap_err(),
            EngineError::NotFound("Participant entity".to_string())
        );
    }

    #[tokio::test]
    async fn test_delete_conversation() {
        let f = fixture().await;
        let conversation = f
            .engine
            .create_conversation(&as_user(f.alice), vec![f.bob])
            .await
            .unwrap();
        f.engine
            .send_message(&as_user(f.bob), send(conversation.id, f.bob, "bye"))
            .await
            .unwrap();

        let mut bob_feed = f.engine.bus().subscribe(
            Topic::ConversationDeleted,
            crate::event::Filter::Participant(f.bob),
        );
        let mut carol_feed = f.engine.bus().subscribe(
            Topic::ConversationDeleted,
            crate::event::Filter::Participant(f.carol),
        );

        let deleted = f
            .engine
            .delete_conversation(&as_user(f.alice), conversation.id)
            .await
            .unwrap();

        let members: HashSet<UserId> = deleted.participants.iter().map(|p| p.user.id).collect();
        assert_eq!(members, HashSet::from([f.alice, f.bob]));
        assert_eq!(deleted.latest_message, None);

        assert!(f.store.conversation(conversation.id).await.unwrap().is_none());
        assert!(f.store.participants(conversation.id).await.unwrap().is_empty());
        assert!(f.store.messages(conversation.id).await.unwrap().is_empty());

        match bob_feed.try_recv().as_deref() {
            Some(Event::ConversationDeleted(c)) => assert_eq!(c, &deleted),
            other => panic!("unexpected {:?}", other),
        }
        assert!(carol_feed.try_recv().is_none());

        let again = f
            .engine
            .delete_conversation(&as_user(f.alice), conversation.id)
            .await;
        assert_eq!(again.unwrap_err().kind(), ErrorKind::NotFound);
        assert!(f
            .engine
            .conversations(&as_user(f.alice))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sends_serialize() {
        let f = fixture().await;
        let conversation = f
            .engine
            .create_conversation(&as_user(f.alice), vec![f.bob])
            .await
            .unwrap();

        let mut messages = f.engine.bus().subscribe(
            Topic::MessageSent,
            crate::event::Filter::Conversation(conversation.id),
        );
        let mut updates = f.engine.bus().subscribe(
            Topic::ConversationUpdated,
            crate::event::Filter::Participant(f.alice),
        );

        let mut handles = Vec::new();
        for i in 0..40 {
            let engine = f.engine.clone();
            let sender = if i % 2 == 0 { f.alice } else { f.bob };
            let conversation_id = conversation.id;
            handles.push(tokio::spawn(async move {
                engine
                    .send_message(&as_user(sender), send(conversation_id, sender, &i.to_string()))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut order: Vec<MessageId> = Vec::new();
        while let Some(event) = messages.try_recv() {
            if let Event::MessageSent(m) = event.as_ref() {
                order.push(m.id);
            }
        }
        assert_eq!(order.len(), 40);

        let mut update_order: Vec<MessageId> = Vec::new();
        while let Some(event) = updates.try_recv() {
            if let Event::ConversationUpdated(c) = event.as_ref() {
                let latest = c.latest_message.as_ref().unwrap();
                let seen: Vec<UserId> = c
                    .participants
                    .iter()
                    .filter(|p| p.has_seen_latest_message)
                    .map(|p| p.user.id)
                    .collect();
                assert_eq!(seen, vec![latest.sender.id]);
                update_order.push(latest.id);
            }
        }
        assert_eq!(update_order, order);

        let stored = f.store.conversation(conversation.id).await.unwrap().unwrap();
        assert_eq!(stored.latest_message_id, order.last().copied());

        let last = f.store.message(stored.latest_message_id.unwrap()).await.unwrap().unwrap();
        let seen: Vec<UserId> = stored_flags(&f.store, conversation.id)
            .await
            .into_iter()
            .filter(|(_, seen)| *seen)
            .map(|(id, _)| id)
            .collect();
        assert_eq!(seen, vec![last.sender_id]);
    }

    /// Delegates reads and fails every transaction once switched on.
    struct FailingStore {
        inner: MemoryStore,
        failing: AtomicBool,
        /// Answer the next user lookup as if the row were not there yet.
        stale_user_read: AtomicBool,
    }

    impl FailingStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                failing: AtomicBool::new(false),
                stale_user_read: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl EntityStore for FailingStore {
        async fn user(&self, id: UserId) -> StoreResult<Option<User>> {
            if self.stale_user_read.swap(false, Ordering::SeqCst) {
                return Ok(None);
            }
            self.inner.user(id).await
        }

        async fn users(&self, ids: &[UserId]) -> StoreResult<Vec<User>> {
            self.inner.users(ids).await
        }

        async fn user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
            self.inner.user_by_username(username).await
        }

        async fn search_users(&self, fragment: &str) -> StoreResult<Vec<User>> {
            self.inner.search_users(fragment).await
        }

        async fn conversation(&self, id: ConversationId) -> StoreResult<Option<Conversation>> {
            self.inner.conversation(id).await
        }

        async fn conversations_for_user(&self, user_id: UserId) -> StoreResult<Vec<Conversation>> {
            self.inner.conversations_for_user(user_id).await
        }

        async fn participants(&self, conversation_id: ConversationId) -> StoreResult<Vec<Participant>> {
            self.inner.participants(conversation_id).await
        }

        async fn participant(
            &self,
            conversation_id: ConversationId,
            user_id: UserId,
        ) -> StoreResult<Option<Participant>> {
            self.inner.participant(conversation_id, user_id).await
        }

        async fn message(&self, id: MessageId) -> StoreResult<Option<Message>> {
            self.inner.message(id).await
        }

        async fn messages(&self, conversation_id: ConversationId) -> StoreResult<Vec<Message>> {
            self.inner.messages(conversation_id).await
        }

        async fn transaction(&self, batch: WriteBatch) -> StoreResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection reset".to_string()));
            }
            self.inner.transaction(batch).await
        }
    }

    #[tokio::test]
    async fn test_failed_commit_publishes_nothing() {
        let store = Arc::new(FailingStore::new());
        let bus = EventBus::with_config(BusConfig {
            subscriber_capacity: 8,
        });
        let engine = Engine::new(store.clone(), bus);

        let alice = engine.register_user(User::new(Uuid::new_v4())).await.unwrap().id;
        let bob = engine.register_user(User::new(Uuid::new_v4())).await.unwrap().id;
        let conversation = engine
            .create_conversation(&as_user(alice), vec![bob])
            .await
            .unwrap();

        let mut messages = engine.bus().subscribe(
            Topic::MessageSent,
            crate::event::Filter::Conversation(conversation.id),
        );
        let mut deletions = engine.bus().subscribe(
            Topic::ConversationDeleted,
            crate::event::Filter::Participant(bob),
        );
        store.failing.store(true, Ordering::SeqCst);

        let sent = engine
            .send_message(&as_user(alice), send(conversation.id, alice, "lost"))
            .await;
        assert_eq!(sent.unwrap_err().kind(), ErrorKind::Store);

        let deleted = engine.delete_conversation(&as_user(alice), conversation.id).await;
        assert_eq!(deleted.unwrap_err().kind(), ErrorKind::Store);

        assert!(messages.try_recv().is_none());
        assert!(deletions.try_recv().is_none());

        let stored = store.conversation(conversation.id).await.unwrap().unwrap();
        assert_eq!(stored.latest_message_id, None);
        assert_eq!(store.participants(conversation.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_queries() {
        let f = fixture().await;
        let first = f
            .engine
            .create_conversation(&as_user(f.alice), vec![f.bob])
            .await
            .unwrap();
        let second = f
            .engine
            .create_conversation(&as_user(f.alice), vec![f.carol])
            .await
            .unwrap();

        f.engine
            .send_message(&as_user(f.bob), send(first.id, f.bob, "one"))
            .await
            .unwrap();
        f.engine
            .send_message(&as_user(f.alice), send(first.id, f.alice, "two"))
            .await
            .unwrap();

        let listed = f.engine.conversations(&as_user(f.alice)).await.unwrap();
        let ids: Vec<ConversationId> = listed.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert_eq!(
            listed[0].latest_message.as_ref().map(|m| m.body.as_str()),
            Some("two")
        );

        let messages = f.engine.messages(&as_user(f.bob), first.id).await.unwrap();
        let bodies: Vec<&str> = messages.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["two", "one"]);
        assert_eq!(messages[1].sender.username.as_deref(), Some("bob"));

        let outsider = f.engine.messages(&as_user(f.carol), first.id).await;
        assert_eq!(outsider.unwrap_err().kind(), ErrorKind::Authorization);

        let missing = f.engine.messages(&as_user(f.carol), Uuid::new_v4()).await;
        assert_eq!(missing.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_search_users_excludes_caller() {
        let f = fixture().await;

        let found = f.engine.search_users(&as_user(f.alice), "A").await.unwrap();
        let names: Vec<Option<&str>> = found.iter().map(|u| u.username.as_deref()).collect();
        assert_eq!(names, vec![Some("carol")]);
    }

    #[tokio::test]
    async fn test_create_username() {
        let f = fixture().await;
        let dave = f
            .engine
            .register_user(User::new(Uuid::new_v4()))
            .await
            .unwrap()
            .id;

        let taken = f.engine.create_username(&as_user(dave), "bob").await;
        assert_eq!(
            taken.unwrap_err(),
            EngineError::Conflict("Username already taken.".to_string())
        );

        f.engine.create_username(&as_user(dave), "dave").await.unwrap();
        f.engine.create_username(&as_user(dave), "dave").await.unwrap();
        assert_eq!(
            f.store.user(dave).await.unwrap().unwrap().username.as_deref(),
            Some("dave")
        );

        let unknown = f
            .engine
            .create_username(&as_user(Uuid::new_v4()), "ghost")
            .await;
        assert_eq!(unknown.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_register_user_is_idempotent() {
        let f = fixture().await;

        let again = f
            .engine
            .register_user(User::new(f.alice).with_username("someone-else"))
            .await
            .unwrap();
        assert_eq!(again.username.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_register_user_race_keeps_first_row() {
        let store = Arc::new(FailingStore::new());
        let engine = Engine::new(store.clone(), EventBus::new());
        let id = Uuid::new_v4();

        engine
            .register_user(User::new(id).with_username("first"))
            .await
            .unwrap();

        // The second registration reads before the first one commits.
        store.stale_user_read.store(true, Ordering::SeqCst);
        let second = engine
            .register_user(User::new(id).with_username("second"))
            .await
            .unwrap();

        assert_eq!(second.username.as_deref(), Some("first"));
        assert_eq!(
            store.inner.user(id).await.unwrap().unwrap().username.as_deref(),
            Some("first")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registrations_agree() {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(Engine::new(store.clone(), EventBus::new()));
        let id = Uuid::new_v4();

        let handles: Vec<_> = ["a", "b", "c", "d"]
            .into_iter()
            .map(|name| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine
                        .register_user(User::new(id).with_username(name))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut returned = Vec::new();
        for handle in handles {
            returned.push(handle.await.unwrap());
        }

        let stored = store.user(id).await.unwrap().unwrap();
        assert!(returned.iter().all(|user| *user == stored));
    }
}
