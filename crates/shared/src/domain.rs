use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ChatId);
id_newtype!(ChannelId);
id_newtype!(MessageId);

impl ChannelId {
    /// The account-wide update stream (private chats and basic groups).
    pub const COMMON: ChannelId = ChannelId(0);

    pub fn is_common(self) -> bool {
        self == Self::COMMON
    }
}

/// Progress marker of one update stream.
///
/// Only `pts` takes part in ordering decisions. `date` is carried for
/// telemetry and is never compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencePosition {
    pub channel_id: ChannelId,
    pub pts: i64,
    pub date: DateTime<Utc>,
}

impl SequencePosition {
    pub fn new(channel_id: ChannelId, pts: i64, date: DateTime<Utc>) -> Self {
        Self {
            channel_id,
            pts,
            date,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Basic,
    Supergroup,
    Broadcast,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub chat_id: ChatId,
    pub title: String,
    pub kind: ChatKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}
