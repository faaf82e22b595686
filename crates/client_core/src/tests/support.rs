//! Scripted fakes for the transport and credential seams.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{
        ChannelId, ChatId, ChatKind, ChatSummary, MessageId, ParticipantSummary, SequencePosition,
        UserId,
    },
    protocol::{
        AuthResponse, AuthStep, AuthorizedUser, ChannelSnapshot, Difference, EventKind,
        MessagePayload, SentCode, SentMessage, UpdateEnvelope, UpdatePayload,
    },
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    auth::CredentialProvider,
    dispatcher::Dispatcher,
    error::TransportError,
    recovery::UpdatesConfig,
    retry::RetryPolicy,
    transport::{AuthApi, MessagesApi, UpdateStream, UpdatesApi},
};

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(5))
}

pub fn test_config() -> UpdatesConfig {
    UpdatesConfig {
        pending_capacity: 64,
        max_recovery_rounds: 3,
        max_difference_pages: 8,
        fetch_retry: fast_retry(3),
        shutdown_grace: Duration::from_millis(200),
    }
}

pub fn message(channel: i64, pts: i64) -> UpdateEnvelope {
    UpdateEnvelope::new(
        ChannelId(channel),
        pts,
        UpdatePayload::NewMessage {
            message: MessagePayload {
                message_id: MessageId(pts),
                chat_id: ChatId(channel),
                sender_id: Some(UserId(7)),
                text: format!("message {pts}"),
                date: Utc::now(),
            },
        },
    )
}

pub fn position(channel: i64, pts: i64) -> SequencePosition {
    SequencePosition::new(ChannelId(channel), pts, Utc::now())
}

pub fn user(id: i64) -> AuthorizedUser {
    AuthorizedUser {
        user_id: UserId(id),
        is_bot: false,
        username: Some(format!("user{id}")),
        access_token: Some(format!("token-{id}")),
    }
}

pub fn sent_code() -> SentCode {
    SentCode {
        phone_code_hash: "hash-1".into(),
        delivery: Default::default(),
        length: Some(5),
    }
}

/// Registers a handler for new messages that records `(channel, pts)`.
pub fn record_messages(dispatcher: &Dispatcher) -> Arc<Mutex<Vec<(i64, i64)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    dispatcher.register_handler(EventKind::NewMessage, move |update: UpdateEnvelope| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock()
                .unwrap()
                .push((update.channel_id.0, update.pts));
            Ok::<(), anyhow::Error>(())
        }
    });
    seen
}

pub fn pts_of(seen: &Mutex<Vec<(i64, i64)>>, channel: i64) -> Vec<i64> {
    seen.lock()
        .unwrap()
        .iter()
        .filter(|(c, _)| *c == channel)
        .map(|(_, pts)| *pts)
        .collect()
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[derive(Default)]
pub struct ScriptedCredentials {
    pub phones: Mutex<VecDeque<String>>,
    pub codes: Mutex<VecDeque<String>>,
    pub passwords: Mutex<VecDeque<String>>,
    /// When set, `code` never returns.
    pub hang_on_code: bool,
    pub code_prompts: Mutex<u32>,
}

impl ScriptedCredentials {
    pub fn new(phones: &[&str], codes: &[&str], passwords: &[&str]) -> Self {
        Self {
            phones: Mutex::new(queue(phones)),
            codes: Mutex::new(queue(codes)),
            passwords: Mutex::new(queue(passwords)),
            ..Self::default()
        }
    }
}

fn queue(items: &[&str]) -> VecDeque<String> {
    items.iter().map(|item| item.to_string()).collect()
}

fn next_answer(queue: &Mutex<VecDeque<String>>, what: &str) -> anyhow::Result<String> {
    queue
        .lock()
        .unwrap()
        .pop_front()
        .ok_or_else(|| anyhow!("no scripted {what} left"))
}

#[async_trait]
impl CredentialProvider for ScriptedCredentials {
    async fn phone(&self) -> anyhow::Result<String> {
        next_answer(&self.phones, "phone")
    }

    async fn code(&self, _sent: &SentCode) -> anyhow::Result<String> {
        *self.code_prompts.lock().unwrap() += 1;
        if self.hang_on_code {
            std::future::pending::<()>().await;
        }
        next_answer(&self.codes, "code")
    }

    async fn password(&self, _hint: Option<&str>) -> anyhow::Result<String> {
        next_answer(&self.passwords, "password")
    }
}

#[derive(Default)]
pub struct ScriptedAuthApi {
    pub status: Mutex<Option<AuthorizedUser>>,
    pub responses: Mutex<VecDeque<Result<AuthResponse, TransportError>>>,
    pub steps: Mutex<Vec<AuthStep>>,
    pub status_calls: Mutex<u32>,
}

impl ScriptedAuthApi {
    pub fn with_responses(responses: Vec<AuthResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Ok).collect()),
            ..Self::default()
        }
    }

    pub fn steps(&self) -> Vec<AuthStep> {
        self.steps.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuthApi for ScriptedAuthApi {
    async fn auth_status(&self) -> Result<Option<AuthorizedUser>, TransportError> {
        *self.status_calls.lock().unwrap() += 1;
        Ok(self.status.lock().unwrap().clone())
    }

    async fn send_auth_step(&self, step: AuthStep) -> Result<AuthResponse, TransportError> {
        self.steps.lock().unwrap().push(step);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Decode("no scripted response".into())))
    }
}

#[derive(Default)]
pub struct ScriptedUpdates {
    pub state: Mutex<Option<SequencePosition>>,
    pub differences: Mutex<HashMap<ChannelId, VecDeque<Result<Difference, TransportError>>>>,
    pub snapshots: Mutex<HashMap<ChannelId, ChannelSnapshot>>,
    pub fetches: Mutex<Vec<(ChannelId, i64)>>,
    pub resyncs: Mutex<Vec<ChannelId>>,
    /// Channels whose fetches never complete.
    pub stalled: Mutex<HashSet<ChannelId>>,
    pub streams: Mutex<VecDeque<mpsc::Receiver<UpdateEnvelope>>>,
    pub subscribe_calls: Mutex<u32>,
}

impl ScriptedUpdates {
    pub fn push_difference(&self, channel: i64, result: Result<Difference, TransportError>) {
        self.differences
            .lock()
            .unwrap()
            .entry(ChannelId(channel))
            .or_default()
            .push_back(result);
    }

    pub fn stall(&self, channel: i64) {
        self.stalled.lock().unwrap().insert(ChannelId(channel));
    }

    /// Prepares the next subscription and returns its sending half.
    pub fn add_stream(&self) -> mpsc::Sender<UpdateEnvelope> {
        let (tx, rx) = mpsc::channel(64);
        self.streams.lock().unwrap().push_back(rx);
        tx
    }

    pub fn fetches_for(&self, channel: i64) -> Vec<i64> {
        self.fetches
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c.0 == channel)
            .map(|(_, pts)| *pts)
            .collect()
    }
}

#[async_trait]
impl UpdatesApi for ScriptedUpdates {
    async fn get_state(&self) -> Result<SequencePosition, TransportError> {
        self.state
            .lock()
            .unwrap()
            .ok_or_else(|| TransportError::Decode("no scripted state".into()))
    }

    async fn fetch_difference(
        &self,
        channel_id: ChannelId,
        from_pts: i64,
    ) -> Result<Difference, TransportError> {
        self.fetches.lock().unwrap().push((channel_id, from_pts));
        let stalled = self.stalled.lock().unwrap().contains(&channel_id);
        if stalled {
            std::future::pending::<()>().await;
        }
        let scripted = self
            .differences
            .lock()
            .unwrap()
            .get_mut(&channel_id)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| {
            Ok(Difference::Empty {
                position: SequencePosition::new(channel_id, from_pts, Utc::now()),
            })
        })
    }

    async fn resync_channel(
        &self,
        channel_id: ChannelId,
    ) -> Result<ChannelSnapshot, TransportError> {
        self.resyncs.lock().unwrap().push(channel_id);
        self.snapshots
            .lock()
            .unwrap()
            .get(&channel_id)
            .cloned()
            .ok_or_else(|| TransportError::Decode("no scripted snapshot".into()))
    }

    async fn subscribe(&self) -> Result<UpdateStream, TransportError> {
        *self.subscribe_calls.lock().unwrap() += 1;
        self.streams
            .lock()
            .unwrap()
            .pop_front()
            .map(ReceiverStream::new)
            .ok_or_else(|| TransportError::Unavailable("connection refused".into()))
    }
}

#[derive(Default)]
pub struct ScriptedMessages {
    pub chats: Vec<ChatSummary>,
    pub participants: Mutex<HashMap<ChatId, Vec<ParticipantSummary>>>,
    pub send_failures: Mutex<VecDeque<TransportError>>,
    pub send_update: Mutex<Option<UpdateEnvelope>>,
    pub sent: Mutex<Vec<(ChatId, String, i64)>>,
    pub invites: Mutex<Vec<(ChatId, String)>>,
}

impl ScriptedMessages {
    pub fn with_chats(titles: &[(i64, &str)]) -> Self {
        Self {
            chats: titles
                .iter()
                .map(|(id, title)| ChatSummary {
                    chat_id: ChatId(*id),
                    title: title.to_string(),
                    kind: ChatKind::Supergroup,
                })
                .collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl MessagesApi for ScriptedMessages {
    async fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
        random_id: i64,
    ) -> Result<SentMessage, TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((chat_id, text.to_string(), random_id));
        if let Some(err) = self.send_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let id = self.sent.lock().unwrap().len() as i64;
        Ok(SentMessage {
            message_id: MessageId(100 + id),
            update: self.send_update.lock().unwrap().take(),
        })
    }

    async fn list_chats(&self) -> Result<Vec<ChatSummary>, TransportError> {
        Ok(self.chats.clone())
    }

    async fn list_participants(
        &self,
        chat_id: ChatId,
    ) -> Result<Vec<ParticipantSummary>, TransportError> {
        Ok(self
            .participants
            .lock()
            .unwrap()
            .get(&chat_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn invite_user(&self, chat_id: ChatId, username: &str) -> Result<(), TransportError> {
        self.invites
            .lock()
            .unwrap()
            .push((chat_id, username.to_string()));
        Ok(())
    }
}
