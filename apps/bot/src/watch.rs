//! Keeps a watched user in the target chat.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use client_core::Messenger;
use rand::Rng;
use shared::domain::{ChatId, ParticipantSummary};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[async_trait]
pub trait Roster: Send + Sync {
    async fn members(&self, chat_id: ChatId) -> anyhow::Result<Vec<ParticipantSummary>>;
    async fn invite(&self, chat_id: ChatId, username: &str) -> anyhow::Result<()>;
}

#[async_trait]
impl Roster for Messenger {
    async fn members(&self, chat_id: ChatId) -> anyhow::Result<Vec<ParticipantSummary>> {
        Ok(self.list_participants(chat_id).await?)
    }

    async fn invite(&self, chat_id: ChatId, username: &str) -> anyhow::Result<()> {
        Ok(self.invite_user(chat_id, username).await?)
    }
}

pub struct MembershipWatcher {
    roster: Arc<dyn Roster>,
    chat_id: ChatId,
    username: String,
    min_interval: Duration,
    max_interval: Duration,
    wake: Notify,
}

impl MembershipWatcher {
    pub fn new(
        roster: Arc<dyn Roster>,
        chat_id: ChatId,
        username: impl Into<String>,
        min_interval: Duration,
        max_interval: Duration,
    ) -> Self {
        Self {
            roster,
            chat_id,
            username: username.into(),
            min_interval,
            max_interval: max_interval.max(min_interval),
            wake: Notify::new(),
        }
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    /// Runs a check right away instead of waiting for the next tick.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    fn next_interval(&self) -> Duration {
        let min = self.min_interval.as_millis() as u64;
        let max = self.max_interval.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Invites the watched user when missing. Returns whether an invite went out.
    pub async fn check(&self) -> anyhow::Result<bool> {
        let members = self.roster.members(self.chat_id).await?;
        let present = members.iter().any(|member| {
            member
                .username
                .as_deref()
                .is_some_and(|name| name.eq_ignore_ascii_case(&self.username))
        });
        if present {
            debug!(chat_id = self.chat_id.0, username = %self.username, "watched user present");
            return Ok(false);
        }

        info!(
            chat_id = self.chat_id.0,
            username = %self.username,
            "watched user missing from chat; inviting"
        );
        self.roster.invite(self.chat_id, &self.username).await?;
        Ok(true)
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            chat_id = self.chat_id.0,
            username = %self.username,
            "membership watcher started"
        );
        loop {
            let interval = self.next_interval();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => debug!("membership check requested"),
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(err) = self.check().await {
                warn!(error = %format!("{err:#}"), "membership check failed");
            }
        }
        debug!("membership watcher stopped");
    }
}

#[cfg(test)]
#[path = "tests/watch_tests.rs"]
mod tests;
