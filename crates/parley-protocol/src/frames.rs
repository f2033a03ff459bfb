//! Frame types for the Parley protocol.
//!
//! Frames are the unit of communication between a client connection and the
//! server. Each frame is serialized using MessagePack with named fields.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Current protocol version. Clients must share the major version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Error codes carried by [`Frame::Error`] and [`Frame::Closed`].
pub mod codes {
    pub const INVALID_FRAME: u16 = 1001;
    pub const SUBSCRIBE_FAILED: u16 = 1002;
    pub const NOT_CONNECTED: u16 = 1003;
    pub const UNSUPPORTED_VERSION: u16 = 1004;
    pub const SUBSCRIPTION_OVERFLOW: u16 = 1010;
    pub const SHUTTING_DOWN: u16 = 1011;
    pub const UNAUTHORIZED: u16 = 4001;
    pub const NOT_FOUND: u16 = 4004;
    pub const CONFLICT: u16 = 4009;
    pub const STORE_FAILURE: u16 = 5000;
    pub const INTERNAL_ERROR: u16 = 5001;
}

/// Event topics. Topics are coarse-grained by event kind; per-subscriber
/// filtering happens inside the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Topic {
    ConversationCreated,
    ConversationUpdated,
    ConversationDeleted,
    MessageSent,
}

impl Topic {
    /// Every topic, in a stable order.
    pub const ALL: [Topic; 4] = [
        Topic::ConversationCreated,
        Topic::ConversationUpdated,
        Topic::ConversationDeleted,
        Topic::MessageSent,
    ];

    /// Get the topic name as it appears on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ConversationCreated => "CONVERSATION_CREATED",
            Topic::ConversationUpdated => "CONVERSATION_UPDATED",
            Topic::ConversationDeleted => "CONVERSATION_DELETED",
            Topic::MessageSent => "MESSAGE_SENT",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state transition or query requested by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Operation {
    /// Create a conversation with the given participants.
    #[serde(rename_all = "camelCase")]
    CreateConversation { participant_ids: Vec<Uuid> },

    /// Send a message into a conversation.
    #[serde(rename_all = "camelCase")]
    SendMessage {
        conversation_id: Uuid,
        sender_id: Uuid,
        body: String,
    },

    /// Mark a conversation as read for a user.
    #[serde(rename_all = "camelCase")]
    MarkConversationAsRead { user_id: Uuid, conversation_id: Uuid },

    /// Delete a conversation with its participants and messages.
    #[serde(rename_all = "camelCase")]
    DeleteConversation { conversation_id: Uuid },

    /// List the caller's conversations.
    Conversations,

    /// List the messages of a conversation, newest first.
    #[serde(rename_all = "camelCase")]
    Messages { conversation_id: Uuid },

    /// Search other users by username fragment.
    SearchUsers { username: String },

    /// Claim a username for the caller.
    CreateUsername { username: String },
}

impl Operation {
    /// Operation name, used for logging and metrics labels.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Operation::CreateConversation { .. } => "createConversation",
            Operation::SendMessage { .. } => "sendMessage",
            Operation::MarkConversationAsRead { .. } => "markConversationAsRead",
            Operation::DeleteConversation { .. } => "deleteConversation",
            Operation::Conversations => "conversations",
            Operation::Messages { .. } => "messages",
            Operation::SearchUsers { .. } => "searchUsers",
            Operation::CreateUsername { .. } => "createUsername",
        }
    }
}

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Request,
    Reply,
    Event,
    Closed,
    Ack,
    Error,
    Ping,
    Pong,
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Initial handshake.
    #[serde(rename = "connect")]
    Connect {
        /// Protocol version.
        version: u8,
        /// Authenticated user id, as issued by the upstream session service.
        #[serde(skip_serializing_if = "Option::is_none")]
        session: Option<Uuid>,
    },

    /// Handshake accepted.
    #[serde(rename = "connected")]
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Open a live event stream.
    #[serde(rename = "subscribe")]
    Subscribe {
        /// Request ID; also identifies the subscription afterwards.
        id: u64,
        /// Topic to subscribe to.
        topic: Topic,
        /// Conversation filter, required for `MESSAGE_SENT`.
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<Uuid>,
    },

    /// Close a live event stream.
    #[serde(rename = "unsubscribe")]
    Unsubscribe {
        /// Request ID for acknowledgment.
        id: u64,
        /// ID of the subscribe request that opened the stream.
        subscription: u64,
    },

    /// Invoke an operation.
    #[serde(rename = "request")]
    Request {
        /// Request ID, echoed in the reply.
        id: u64,
        /// The operation.
        op: Operation,
    },

    /// Successful operation result.
    #[serde(rename = "reply")]
    Reply {
        /// ID of the request.
        id: u64,
        /// Result payload.
        data: serde_json::Value,
    },

    /// An event delivered on a subscription.
    #[serde(rename = "event")]
    Event {
        /// ID of the subscribe request that opened the stream.
        subscription: u64,
        /// Topic of the event.
        topic: Topic,
        /// Event payload.
        payload: serde_json::Value,
    },

    /// A subscription was terminated by the server.
    #[serde(rename = "closed")]
    Closed {
        /// ID of the subscribe request that opened the stream.
        subscription: u64,
        /// Reason code.
        code: u16,
        /// Human-readable reason.
        reason: String,
    },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged request.
        id: u64,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code, see [`codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Subscribe { .. } => FrameType::Subscribe,
            Frame::Unsubscribe { .. } => FrameType::Unsubscribe,
            Frame::Request { .. } => FrameType::Request,
            Frame::Reply { .. } => FrameType::Reply,
            Frame::Event { .. } => FrameType::Event,
            Frame::Closed { .. } => FrameType::Closed,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    #[must_use]
    pub fn connect(version: u8, session: Option<Uuid>) -> Self {
        Frame::Connect { version, session }
    }

    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        }
    }

    #[must_use]
    pub fn subscribe(id: u64, topic: Topic, conversation_id: Option<Uuid>) -> Self {
        Frame::Subscribe {
            id,
            topic,
            conversation_id,
        }
    }

    #[must_use]
    pub fn unsubscribe(id: u64, subscription: u64) -> Self {
        Frame::Unsubscribe { id, subscription }
    }

    #[must_use]
    pub fn request(id: u64, op: Operation) -> Self {
        Frame::Request { id, op }
    }

    #[must_use]
    pub fn reply(id: u64, data: serde_json::Value) -> Self {
        Frame::Reply { id, data }
    }

    #[must_use]
    pub fn event(subscription: u64, topic: Topic, payload: serde_json::Value) -> Self {
        Frame::Event {
            subscription,
            topic,
            payload,
        }
    }

    #[must_use]
    pub fn closed(subscription: u64, code: u16, reason: impl Into<String>) -> Self {
        Frame::Closed {
            subscription,
            code,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}

/// Check whether a client's protocol version can talk to this server.
#[must_use]
pub fn is_compatible(version: u8) -> bool {
    version == PROTOCOL_VERSION
}
