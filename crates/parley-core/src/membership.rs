//! Membership checks.
//!
//! Authorization for conversation events is a pure lookup over a participant
//! set. The set may be live store data or a snapshot captured before the rows
//! were deleted; the check does not care which.

use crate::model::{Participant, ParticipantView, UserId};

/// Anything that names the user it belongs to.
pub trait Member {
    fn member_id(&self) -> UserId;
}

impl Member for Participant {
    fn member_id(&self) -> UserId {
        self.user_id
    }
}

impl Member for ParticipantView {
    fn member_id(&self) -> UserId {
        self.user.id
    }
}

impl Member for UserId {
    fn member_id(&self) -> UserId {
        *self
    }
}

/// Returns `true` iff some member of `participants` is `user_id`.
#[must_use]
pub fn is_authorized<M: Member>(participants: &[M], user_id: UserId) -> bool {
    participants.iter().any(|p| p.member_id() == user_id)
}
