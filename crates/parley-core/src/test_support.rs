//! Builders for event payloads used across unit tests.

use crate::model::{ConversationId, ConversationView, MessageView, ParticipantView, UserId, UserSummary};
use chrono::Utc;
use uuid::Uuid;

pub(crate) fn conversation_view(members: &[UserId]) -> ConversationView {
    ConversationView {
        id: Uuid::new_v4(),
        latest_message: None,
        participants: members
            .iter()
            .map(|id| ParticipantView {
                id: Uuid::new_v4(),
                user: UserSummary {
                    id: *id,
                    username: None,
                },
                has_seen_latest_message: false,
            })
            .collect(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub(crate) fn message_view(conversation_id: ConversationId, body: &str) -> MessageView {
    MessageView {
        id: Uuid::new_v4(),
        conversation_id,
        sender: UserSummary {
            id: Uuid::new_v4(),
            username: None,
        },
        body: body.to_string(),
        created_at: Utc::now(),
    }
}
