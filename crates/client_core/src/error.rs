use std::time::Duration;

use shared::{
    domain::ChannelId,
    error::{ApiError, ErrorCode},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network unavailable: {0}")]
    Unavailable(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("server rejected request: {0}")]
    Rejected(ApiError),
    #[error("not authorized")]
    Unauthorized,
    #[error("invalid server response: {0}")]
    Decode(String),
    #[error("update subscription closed")]
    SubscriptionClosed,
}

impl TransportError {
    /// Whether retrying the same request later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Timeout(_) | Self::SubscriptionClosed => true,
            Self::Rejected(api) => api.is_retryable(),
            Self::Unauthorized | Self::Decode(_) => false,
        }
    }

    /// Server-mandated wait, when the server asked for one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Rejected(ApiError {
                code: ErrorCode::RateLimited,
                retry_after_secs: Some(secs),
                ..
            }) => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("account is not registered and sign-up is disabled")]
    SignUpRequired,
    #[error("invalid phone number '{phone}': {reason}")]
    InvalidPhone { phone: String, reason: &'static str },
    #[error("login code rejected after {attempts} attempts")]
    InvalidCode { attempts: u32 },
    #[error("2FA password rejected after {attempts} attempts")]
    InvalidPassword { attempts: u32 },
    #[error("failed to read credentials: {0}")]
    Credential(#[source] anyhow::Error),
    #[error("sign-up handler failed: {0}")]
    SignUp(#[source] anyhow::Error),
    #[error("authentication cancelled")]
    Cancelled,
    #[error("unexpected auth response in state {state}: {response}")]
    UnexpectedResponse {
        state: &'static str,
        response: String,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A channel's update stream was abandoned after recovery failed.
#[derive(Debug, Clone, Error)]
#[error("update stream for channel {channel_id} is unrecoverable: {reason}")]
pub struct GapUnrecoverable {
    pub channel_id: ChannelId,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("dispatcher is stopped")]
    Stopped,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("state store failure: {0}")]
    Store(#[source] anyhow::Error),
    #[error("update subscription lost after {attempts} reconnect attempts: {source}")]
    SubscriptionLost {
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("application task failed: {0}")]
    Application(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("message text is empty")]
    EmptyText,
    #[error("no chat titled '{0}'")]
    ChatNotFound(String),
    #[error("command cancelled")]
    Cancelled,
    #[error(transparent)]
    Transport(#[from] TransportError),
}
