use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ChannelId, ChatId, ChatSummary, ParticipantSummary, SequencePosition},
    error::{ApiError, ErrorCode},
    protocol::{
        AuthResponse, AuthStep, AuthorizedUser, ChannelSnapshot, Difference, DifferenceRequest,
        InviteRequest, ResyncRequest, SendTextRequest, SentMessage, UpdateEnvelope,
    },
};
use storage::{SessionStore, StoredSession};
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::TransportError,
    transport::{AuthApi, MessagesApi, UpdateStream, UpdatesApi},
};

const APP_ID_HEADER: &str = "x-app-id";
const APP_HASH_HEADER: &str = "x-app-hash";

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub server_url: String,
    pub app_id: i32,
    pub app_hash: String,
    pub request_timeout: Duration,
    /// Envelopes buffered between the socket reader and the consumer.
    pub subscription_buffer: usize,
}

impl HttpTransportConfig {
    pub fn new(server_url: impl Into<String>, app_id: i32, app_hash: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            app_id,
            app_hash: app_hash.into(),
            request_timeout: Duration::from_secs(30),
            subscription_buffer: 256,
        }
    }
}

/// JSON over HTTP for requests, a WebSocket for pushed updates.
pub struct HttpTransport {
    http: Client,
    base_url: Url,
    config: HttpTransportConfig,
    sessions: Arc<dyn SessionStore>,
    access_token: RwLock<Option<String>>,
}

impl HttpTransport {
    /// Builds the transport and restores a previously persisted access token.
    pub async fn connect(
        config: HttpTransportConfig,
        sessions: Arc<dyn SessionStore>,
    ) -> Result<Arc<Self>> {
        let base_url = Url::parse(config.server_url.trim_end_matches('/'))
            .with_context(|| format!("invalid server url '{}'", config.server_url))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(anyhow!("server_url must start with http:// or https://"));
        }
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to build http client")?;
        let access_token = sessions
            .load_session()
            .await?
            .and_then(|session| session.access_token);
        if access_token.is_some() {
            info!("restored persisted session token");
        }

        Ok(Arc::new(Self {
            http,
            base_url,
            config,
            sessions,
            access_token: RwLock::new(access_token),
        }))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.as_str().trim_end_matches('/'))
    }

    fn ws_endpoint(&self, path: &str) -> Result<String, TransportError> {
        let http_url = self.endpoint(path);
        if let Some(rest) = http_url.strip_prefix("https://") {
            Ok(format!("wss://{rest}"))
        } else if let Some(rest) = http_url.strip_prefix("http://") {
            Ok(format!("ws://{rest}"))
        } else {
            Err(TransportError::Unavailable(format!(
                "cannot derive websocket url from {http_url}"
            )))
        }
    }

    async fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder
            .header(APP_ID_HEADER, self.config.app_id)
            .header(APP_HASH_HEADER, &self.config.app_hash);
        match self.access_token.read().await.as_deref() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, TransportError> {
        let builder = self.authorized(self.http.get(self.endpoint(path))).await;
        execute_json(builder).await
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, TransportError>
    where
        B: serde::Serialize + Sync,
        T: DeserializeOwned,
    {
        let builder = self
            .authorized(self.http.post(self.endpoint(path)))
            .await
            .json(body);
        execute_json(builder).await
    }

    async fn remember_user(&self, user: &AuthorizedUser) {
        let Some(token) = user.access_token.clone() else {
            return;
        };
        *self.access_token.write().await = Some(token.clone());
        let session = StoredSession {
            user_id: user.user_id,
            is_bot: user.is_bot,
            username: user.username.clone(),
            access_token: Some(token),
            updated_at: Utc::now(),
        };
        if let Err(err) = self.sessions.save_session(&session).await {
            warn!(error = %err, "failed to persist session; next start will re-authenticate");
        }
    }

    async fn forget_token(&self) {
        self.access_token.write().await.take();
        if let Err(err) = self.sessions.clear_session().await {
            warn!(error = %err, "failed to clear persisted session");
        }
    }
}

async fn execute_json<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, TransportError> {
    let response = builder.send().await.map_err(map_reqwest_error)?;
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|err| TransportError::Decode(err.to_string()));
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(TransportError::Unauthorized);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Rejected(api_error_from(status, &body)))
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_decode() {
        TransportError::Decode(err.to_string())
    } else {
        TransportError::Unavailable(err.to_string())
    }
}

fn api_error_from(status: StatusCode, body: &str) -> ApiError {
    if let Ok(api) = serde_json::from_str::<ApiError>(body) {
        return api;
    }
    let code = match status {
        StatusCode::FORBIDDEN => ErrorCode::Forbidden,
        StatusCode::NOT_FOUND => ErrorCode::NotFound,
        StatusCode::TOO_MANY_REQUESTS => ErrorCode::RateLimited,
        status if status.is_server_error() => ErrorCode::Internal,
        _ => ErrorCode::Validation,
    };
    ApiError::new(code, format!("http {status}: {body}"))
}

#[async_trait]
impl AuthApi for HttpTransport {
    async fn auth_status(&self) -> Result<Option<AuthorizedUser>, TransportError> {
        if self.access_token.read().await.is_none() {
            return Ok(None);
        }
        match self.get_json::<AuthorizedUser>("/auth/status").await {
            Ok(user) => Ok(Some(user)),
            Err(TransportError::Unauthorized) => {
                info!("persisted session is no longer authorized");
                self.forget_token().await;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn send_auth_step(&self, step: AuthStep) -> Result<AuthResponse, TransportError> {
        let response: AuthResponse = self.post_json("/auth/step", &step).await?;
        if let AuthResponse::Authorized(user) = &response {
            self.remember_user(user).await;
        }
        Ok(response)
    }
}

#[async_trait]
impl UpdatesApi for HttpTransport {
    async fn get_state(&self) -> Result<SequencePosition, TransportError> {
        self.get_json("/updates/state").await
    }

    async fn fetch_difference(
        &self,
        channel_id: ChannelId,
        from_pts: i64,
    ) -> Result<Difference, TransportError> {
        self.post_json(
            "/updates/difference",
            &DifferenceRequest {
                channel_id,
                pts: from_pts,
            },
        )
        .await
    }

    async fn resync_channel(
        &self,
        channel_id: ChannelId,
    ) -> Result<ChannelSnapshot, TransportError> {
        self.post_json("/updates/resync", &ResyncRequest { channel_id })
            .await
    }

    async fn subscribe(&self) -> Result<UpdateStream, TransportError> {
        let ws_url = self.ws_endpoint("/updates/ws")?;
        let mut request = ws_url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::Unavailable(err.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(APP_ID_HEADER, HeaderValue::from(self.config.app_id));
        headers.insert(
            APP_HASH_HEADER,
            HeaderValue::from_str(&self.config.app_hash)
                .map_err(|err| TransportError::Unavailable(err.to_string()))?,
        );
        if let Some(token) = self.access_token.read().await.as_deref() {
            headers.insert(
                "authorization",
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|err| TransportError::Unavailable(err.to_string()))?,
            );
        }

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|err| TransportError::Unavailable(format!("websocket connect failed: {err}")))?;
        let (_, mut ws_reader) = ws_stream.split();
        let (tx, rx) = mpsc::channel(self.config.subscription_buffer.max(1));

        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<UpdateEnvelope>(&text) {
                        Ok(envelope) => {
                            if tx.send(envelope).await.is_err() {
                                debug!("update consumer dropped; closing websocket reader");
                                break;
                            }
                        }
                        Err(err) => warn!(error = %err, "ignoring malformed update frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "websocket receive failed");
                        break;
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }
}

#[async_trait]
impl MessagesApi for HttpTransport {
    async fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
        random_id: i64,
    ) -> Result<SentMessage, TransportError> {
        self.post_json(
            "/messages/send",
            &SendTextRequest {
                chat_id,
                text: text.to_string(),
                random_id,
            },
        )
        .await
    }

    async fn list_chats(&self) -> Result<Vec<ChatSummary>, TransportError> {
        self.get_json("/chats").await
    }

    async fn list_participants(
        &self,
        chat_id: ChatId,
    ) -> Result<Vec<ParticipantSummary>, TransportError> {
        self.get_json(&format!("/chats/{}/participants", chat_id.0))
            .await
    }

    async fn invite_user(&self, chat_id: ChatId, username: &str) -> Result<(), TransportError> {
        let builder = self
            .authorized(
                self.http
                    .post(self.endpoint(&format!("/chats/{}/invite", chat_id.0))),
            )
            .await
            .json(&InviteRequest {
                username: username.to_string(),
            });
        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(TransportError::Unauthorized);
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Rejected(api_error_from(status, &body)))
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
