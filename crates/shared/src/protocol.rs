use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ChannelId, ChatId, MessageId, SequencePosition, UserId};

fn default_pts_count() -> i64 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    pub text: String,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum UpdatePayload {
    NewMessage {
        message: MessagePayload,
    },
    EditMessage {
        message: MessagePayload,
    },
    DeleteMessages {
        chat_id: ChatId,
        message_ids: Vec<MessageId>,
    },
    ParticipantAdded {
        chat_id: ChatId,
        user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        inviter_id: Option<UserId>,
    },
    ParticipantRemoved {
        chat_id: ChatId,
        user_id: UserId,
    },
    ChatTitleChanged {
        chat_id: ChatId,
        title: String,
    },
    /// Anything this client does not model. Still consumes a pts slot.
    Other {
        name: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewMessage,
    EditMessage,
    DeleteMessages,
    ParticipantAdded,
    ParticipantRemoved,
    ChatTitleChanged,
    Other,
}

impl UpdatePayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::NewMessage { .. } => EventKind::NewMessage,
            Self::EditMessage { .. } => EventKind::EditMessage,
            Self::DeleteMessages { .. } => EventKind::DeleteMessages,
            Self::ParticipantAdded { .. } => EventKind::ParticipantAdded,
            Self::ParticipantRemoved { .. } => EventKind::ParticipantRemoved,
            Self::ChatTitleChanged { .. } => EventKind::ChatTitleChanged,
            Self::Other { .. } => EventKind::Other,
        }
    }
}

/// One pushed or fetched update together with its sequence metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEnvelope {
    pub channel_id: ChannelId,
    pub pts: i64,
    /// Number of pts slots this update occupies.
    #[serde(default = "default_pts_count")]
    pub pts_count: i64,
    pub date: DateTime<Utc>,
    pub payload: UpdatePayload,
}

impl UpdateEnvelope {
    pub fn new(channel_id: ChannelId, pts: i64, payload: UpdatePayload) -> Self {
        Self {
            channel_id,
            pts,
            pts_count: 1,
            date: Utc::now(),
            payload,
        }
    }

    pub fn position(&self) -> SequencePosition {
        SequencePosition::new(self.channel_id, self.pts, self.date)
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CodeDelivery {
    #[default]
    App,
    Sms,
    Call,
    Email,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentCode {
    pub phone_code_hash: String,
    #[serde(default)]
    pub delivery: CodeDelivery,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum AuthStep {
    SendCode {
        phone: String,
    },
    SignIn {
        phone: String,
        phone_code_hash: String,
        code: String,
    },
    CheckPassword {
        password: String,
    },
    SignUp {
        phone: String,
        /// Absent when the server asked for sign-up before sending a code.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phone_code_hash: Option<String>,
        first_name: String,
        last_name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizedUser {
    pub user_id: UserId,
    pub is_bot: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum AuthResponse {
    CodeSent(SentCode),
    Authorized(AuthorizedUser),
    PasswordRequired {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
    },
    SignUpRequired {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        terms_of_service: Option<String>,
    },
    PhoneInvalid,
    CodeInvalid,
    PasswordInvalid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DifferenceRequest {
    pub channel_id: ChannelId,
    pub pts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResyncRequest {
    pub channel_id: ChannelId,
}

/// Server answer to a differential fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Difference {
    /// Nothing missed; `position` is the server's current state.
    Empty { position: SequencePosition },
    /// Part of the missed range; fetch again from `next`.
    Slice {
        updates: Vec<UpdateEnvelope>,
        next: SequencePosition,
    },
    /// The full missed range.
    Complete {
        updates: Vec<UpdateEnvelope>,
        position: SequencePosition,
    },
    /// The gap is too wide to replay; the stream has to be resynced.
    TooLong { position: SequencePosition },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub position: SequencePosition,
    #[serde(default)]
    pub updates: Vec<UpdateEnvelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendTextRequest {
    pub chat_id: ChatId,
    pub text: String,
    pub random_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentMessage {
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<UpdateEnvelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteRequest {
    pub username: String,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
