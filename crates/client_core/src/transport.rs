use async_trait::async_trait;
use shared::{
    domain::{ChannelId, ChatId, ChatSummary, ParticipantSummary, SequencePosition},
    protocol::{
        AuthResponse, AuthStep, AuthorizedUser, ChannelSnapshot, Difference, SentMessage,
        UpdateEnvelope,
    },
};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::TransportError;

/// Push updates in arrival order. Ends when the underlying connection does.
pub type UpdateStream = ReceiverStream<UpdateEnvelope>;

#[async_trait]
pub trait AuthApi: Send + Sync {
    /// The user the transport is currently authorized as, if any.
    async fn auth_status(&self) -> Result<Option<AuthorizedUser>, TransportError>;
    async fn send_auth_step(&self, step: AuthStep) -> Result<AuthResponse, TransportError>;
}

#[async_trait]
pub trait UpdatesApi: Send + Sync {
    /// Current position of the common update stream.
    async fn get_state(&self) -> Result<SequencePosition, TransportError>;
    async fn fetch_difference(
        &self,
        channel_id: ChannelId,
        from_pts: i64,
    ) -> Result<Difference, TransportError>;
    async fn resync_channel(&self, channel_id: ChannelId)
        -> Result<ChannelSnapshot, TransportError>;
    async fn subscribe(&self) -> Result<UpdateStream, TransportError>;
}

#[async_trait]
pub trait MessagesApi: Send + Sync {
    async fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
        random_id: i64,
    ) -> Result<SentMessage, TransportError>;
    async fn list_chats(&self) -> Result<Vec<ChatSummary>, TransportError>;
    async fn list_participants(
        &self,
        chat_id: ChatId,
    ) -> Result<Vec<ParticipantSummary>, TransportError>;
    async fn invite_user(&self, chat_id: ChatId, username: &str) -> Result<(), TransportError>;
}
