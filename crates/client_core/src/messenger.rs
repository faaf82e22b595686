use std::sync::Arc;

use shared::domain::{ChatId, ChatSummary, MessageId, ParticipantSummary};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    error::CommandError,
    recovery::RecoveryCoordinator,
    retry::{retry_transient, RetryOutcome, RetryPolicy},
    transport::MessagesApi,
};

/// Outbound commands issued on behalf of the authenticated user.
///
/// Updates a command returns are fed through the same ordering path as pushed
/// ones, so handlers observe the bot's own messages exactly once.
pub struct Messenger {
    api: Arc<dyn MessagesApi>,
    coordinator: Arc<RecoveryCoordinator>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl Messenger {
    pub fn new(
        api: Arc<dyn MessagesApi>,
        coordinator: Arc<RecoveryCoordinator>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            coordinator,
            retry,
            cancel,
        }
    }

    /// Sends `text` to `chat_id` and returns the new message id.
    ///
    /// Retries reuse one `random_id`, which the server uses to deduplicate.
    pub async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageId, CommandError> {
        if text.trim().is_empty() {
            return Err(CommandError::EmptyText);
        }
        let random_id: i64 = rand::random();
        let sent = self
            .call("send_text", || self.api.send_text(chat_id, text, random_id))
            .await?;
        info!(chat_id = chat_id.0, message_id = sent.message_id.0, "message sent");

        if let Some(update) = sent.update {
            debug!(
                channel_id = update.channel_id.0,
                pts = update.pts,
                "ingesting update returned by send"
            );
            self.coordinator.ingest(update).await;
        }
        Ok(sent.message_id)
    }

    pub async fn list_chats(&self) -> Result<Vec<ChatSummary>, CommandError> {
        self.call("list_chats", || self.api.list_chats()).await
    }

    /// Resolves a chat by exact title. Titles are not unique; the first match
    /// in server order wins.
    pub async fn find_chat_by_title(&self, title: &str) -> Result<ChatSummary, CommandError> {
        self.list_chats()
            .await?
            .into_iter()
            .find(|chat| chat.title == title)
            .ok_or_else(|| CommandError::ChatNotFound(title.to_string()))
    }

    pub async fn list_participants(
        &self,
        chat_id: ChatId,
    ) -> Result<Vec<ParticipantSummary>, CommandError> {
        self.call("list_participants", || self.api.list_participants(chat_id))
            .await
    }

    pub async fn invite_user(&self, chat_id: ChatId, username: &str) -> Result<(), CommandError> {
        self.call("invite_user", || self.api.invite_user(chat_id, username))
            .await?;
        info!(chat_id = chat_id.0, username, "user invited");
        Ok(())
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T, CommandError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, crate::error::TransportError>>,
    {
        match retry_transient(&self.retry, &self.cancel, operation, op).await {
            RetryOutcome::Done(value) => Ok(value),
            RetryOutcome::Failed { last, .. } => Err(CommandError::Transport(last)),
            RetryOutcome::Cancelled => Err(CommandError::Cancelled),
        }
    }
}

#[cfg(test)]
#[path = "tests/messenger_tests.rs"]
mod tests;
