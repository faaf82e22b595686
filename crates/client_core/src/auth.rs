//! Interactive login state machine.
//!
//! [`AuthFlow`] walks phone → code → optional 2FA password against an
//! [`AuthApi`], prompting through a [`CredentialProvider`]. Accounts that would
//! need registering are handled according to [`SignUpPolicy`].

use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex},
};

use anyhow::anyhow;
use async_trait::async_trait;
use shared::{
    domain::UserId,
    protocol::{AuthResponse, AuthStep, AuthorizedUser, SentCode},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    error::AuthError,
    retry::{retry_transient, RetryOutcome, RetryPolicy},
    transport::AuthApi,
};

/// Source of user-supplied credentials. Each call may block on user input.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn phone(&self) -> anyhow::Result<String>;
    async fn code(&self, sent: &SentCode) -> anyhow::Result<String>;
    async fn password(&self, hint: Option<&str>) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignUpDetails {
    pub first_name: String,
    pub last_name: String,
}

#[async_trait]
pub trait SignUpHandler: Send + Sync {
    async fn sign_up_details(
        &self,
        terms_of_service: Option<&str>,
    ) -> anyhow::Result<SignUpDetails>;
}

/// What to do when the server reports the phone has no account.
#[derive(Clone, Default)]
pub enum SignUpPolicy {
    #[default]
    Reject,
    Allow(Arc<dyn SignUpHandler>),
}

impl fmt::Debug for SignUpPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reject => f.write_str("Reject"),
            Self::Allow(_) => f.write_str("Allow(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    SignUpRequired,
    InvalidPhone,
    InvalidCode,
    InvalidPassword,
    Credential,
    Transport,
    Protocol,
}

impl AuthFailure {
    fn of(err: &AuthError) -> Self {
        match err {
            AuthError::SignUpRequired => Self::SignUpRequired,
            AuthError::InvalidPhone { .. } => Self::InvalidPhone,
            AuthError::InvalidCode { .. } => Self::InvalidCode,
            AuthError::InvalidPassword { .. } => Self::InvalidPassword,
            AuthError::Credential(_) | AuthError::SignUp(_) | AuthError::Cancelled => {
                Self::Credential
            }
            AuthError::Transport(_) => Self::Transport,
            AuthError::UnexpectedResponse { .. } => Self::Protocol,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    AwaitingCode,
    AwaitingPassword,
    AwaitingSignUp,
    Authenticated,
    Failed(AuthFailure),
}

impl AuthState {
    fn label(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::AwaitingCode => "awaiting_code",
            Self::AwaitingPassword => "awaiting_password",
            Self::AwaitingSignUp => "awaiting_sign_up",
            Self::Authenticated => "authenticated",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub is_bot: bool,
    pub username: Option<String>,
    pub authenticated: bool,
}

impl From<AuthorizedUser> for Session {
    fn from(user: AuthorizedUser) -> Self {
        Self {
            user_id: user.user_id,
            is_bot: user.is_bot,
            username: user.username,
            authenticated: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthOptions {
    pub max_phone_attempts: u32,
    pub max_code_attempts: u32,
    pub max_password_attempts: u32,
    pub network_retry: RetryPolicy,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            max_phone_attempts: 3,
            max_code_attempts: 3,
            max_password_attempts: 3,
            network_retry: RetryPolicy::default(),
        }
    }
}

/// Checks the shape of a phone number before it is sent anywhere.
pub fn validate_phone(phone: &str) -> Result<(), &'static str> {
    if !phone.starts_with('+') {
        return Err("country code is required (start with '+')");
    }
    if phone.contains(char::is_whitespace) {
        return Err("no spaces allowed between country code and number");
    }
    if phone.len() < 4 || !phone[1..].chars().all(|c| c.is_ascii_digit()) {
        return Err("only digits may follow the '+'");
    }
    Ok(())
}

pub struct AuthFlow {
    api: Arc<dyn AuthApi>,
    credentials: Arc<dyn CredentialProvider>,
    sign_up: SignUpPolicy,
    options: AuthOptions,
    state: Mutex<AuthState>,
    session: Mutex<Option<Session>>,
    gate: tokio::sync::Mutex<()>,
}

impl AuthFlow {
    pub fn new(
        api: Arc<dyn AuthApi>,
        credentials: Arc<dyn CredentialProvider>,
        sign_up: SignUpPolicy,
        options: AuthOptions,
    ) -> Self {
        Self {
            api,
            credentials,
            sign_up,
            options,
            state: Mutex::new(AuthState::Unauthenticated),
            session: Mutex::new(None),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> AuthState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn session(&self) -> Option<Session> {
        self.session.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn set_state(&self, state: AuthState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    /// Drops the cached session so the next call authenticates again.
    pub fn release(&self) {
        self.session.lock().unwrap_or_else(|p| p.into_inner()).take();
        self.set_state(AuthState::Unauthenticated);
    }

    /// Returns the authenticated session, logging in first when necessary.
    ///
    /// A cached session is returned without any network call. On
    /// cancellation nothing is published and the state is reset to
    /// `Unauthenticated`.
    pub async fn authenticate(&self, cancel: &CancellationToken) -> Result<Session, AuthError> {
        let _gate = cancellable(cancel, self.gate.lock()).await?;
        if let Some(session) = self.session() {
            return Ok(session);
        }

        self.set_state(AuthState::Unauthenticated);
        match self.login(cancel).await {
            Ok(session) => {
                *self.session.lock().unwrap_or_else(|p| p.into_inner()) = Some(session.clone());
                self.set_state(AuthState::Authenticated);
                Ok(session)
            }
            Err(AuthError::Cancelled) => {
                self.set_state(AuthState::Unauthenticated);
                Err(AuthError::Cancelled)
            }
            Err(err) => {
                warn!(error = %err, "authentication failed");
                self.set_state(AuthState::Failed(AuthFailure::of(&err)));
                Err(err)
            }
        }
    }

    async fn login(&self, cancel: &CancellationToken) -> Result<Session, AuthError> {
        let status = self.call(cancel, "auth_status", || self.api.auth_status()).await?;
        if let Some(user) = status {
            info!(user_id = user.user_id.0, "restored authorized session");
            return Ok(user.into());
        }

        let (phone, sent) = match self.request_code(cancel).await? {
            CodeRequest::Sent { phone, sent } => (phone, sent),
            CodeRequest::Authorized(user) => return Ok(user.into()),
            CodeRequest::SignUp {
                phone,
                terms_of_service,
            } => {
                return self
                    .sign_up(cancel, &phone, None, terms_of_service.as_deref())
                    .await
            }
        };

        self.set_state(AuthState::AwaitingCode);
        let mut attempts = 0;
        let password_hint = loop {
            attempts += 1;
            let code = self.prompt(cancel, self.credentials.code(&sent), "code").await?;
            let step = AuthStep::SignIn {
                phone: phone.clone(),
                phone_code_hash: sent.phone_code_hash.clone(),
                code,
            };
            match self.step(cancel, step).await? {
                AuthResponse::Authorized(user) => return Ok(user.into()),
                AuthResponse::PasswordRequired { hint } => break hint,
                AuthResponse::SignUpRequired { terms_of_service } => {
                    return self
                        .sign_up(
                            cancel,
                            &phone,
                            Some(&sent.phone_code_hash),
                            terms_of_service.as_deref(),
                        )
                        .await;
                }
                AuthResponse::CodeInvalid if attempts < self.options.max_code_attempts => {
                    warn!(attempts, "login code rejected; asking again");
                }
                AuthResponse::CodeInvalid => return Err(AuthError::InvalidCode { attempts }),
                other => return Err(self.unexpected(other)),
            }
        };

        self.set_state(AuthState::AwaitingPassword);
        let mut attempts = 0;
        loop {
            attempts += 1;
            let password = self
                .prompt(
                    cancel,
                    self.credentials.password(password_hint.as_deref()),
                    "password",
                )
                .await?;
            match self.step(cancel, AuthStep::CheckPassword { password }).await? {
                AuthResponse::Authorized(user) => return Ok(user.into()),
                AuthResponse::PasswordInvalid if attempts < self.options.max_password_attempts => {
                    warn!(attempts, "2FA password rejected; asking again");
                }
                AuthResponse::PasswordInvalid => {
                    return Err(AuthError::InvalidPassword { attempts })
                }
                other => return Err(self.unexpected(other)),
            }
        }
    }

    async fn request_code(&self, cancel: &CancellationToken) -> Result<CodeRequest, AuthError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let phone = self.prompt(cancel, self.credentials.phone(), "phone").await?;
            if let Err(reason) = validate_phone(&phone) {
                if attempts < self.options.max_phone_attempts {
                    warn!(attempts, reason, "invalid phone number; asking again");
                    continue;
                }
                return Err(AuthError::InvalidPhone { phone, reason });
            }

            match self
                .step(cancel, AuthStep::SendCode { phone: phone.clone() })
                .await?
            {
                AuthResponse::CodeSent(sent) => {
                    info!(delivery = ?sent.delivery, "login code sent");
                    return Ok(CodeRequest::Sent { phone, sent });
                }
                AuthResponse::Authorized(user) => return Ok(CodeRequest::Authorized(user)),
                AuthResponse::SignUpRequired { terms_of_service } => {
                    return Ok(CodeRequest::SignUp {
                        phone,
                        terms_of_service,
                    })
                }
                AuthResponse::PhoneInvalid if attempts < self.options.max_phone_attempts => {
                    warn!(attempts, "server rejected phone number; asking again");
                }
                AuthResponse::PhoneInvalid => {
                    return Err(AuthError::InvalidPhone {
                        phone,
                        reason: "rejected by server",
                    })
                }
                other => return Err(self.unexpected(other)),
            }
        }
    }

    async fn sign_up(
        &self,
        cancel: &CancellationToken,
        phone: &str,
        phone_code_hash: Option<&str>,
        terms_of_service: Option<&str>,
    ) -> Result<Session, AuthError> {
        self.set_state(AuthState::AwaitingSignUp);
        let handler = match &self.sign_up {
            SignUpPolicy::Reject => {
                info!("account requires sign-up; refusing by policy");
                return Err(AuthError::SignUpRequired);
            }
            SignUpPolicy::Allow(handler) => Arc::clone(handler),
        };

        let details = cancellable(cancel, handler.sign_up_details(terms_of_service))
            .await?
            .map_err(AuthError::SignUp)?;
        let step = AuthStep::SignUp {
            phone: phone.to_string(),
            phone_code_hash: phone_code_hash.map(str::to_string),
            first_name: details.first_name,
            last_name: details.last_name,
        };
        match self.step(cancel, step).await? {
            AuthResponse::Authorized(user) => Ok(user.into()),
            other => Err(self.unexpected(other)),
        }
    }

    async fn prompt<F>(
        &self,
        cancel: &CancellationToken,
        read: F,
        what: &'static str,
    ) -> Result<String, AuthError>
    where
        F: Future<Output = anyhow::Result<String>>,
    {
        let value = cancellable(cancel, read).await?.map_err(AuthError::Credential)?;
        let value = value.trim().to_string();
        if value.is_empty() {
            return Err(AuthError::Credential(anyhow!("empty {what} entered")));
        }
        Ok(value)
    }

    async fn step(
        &self,
        cancel: &CancellationToken,
        step: AuthStep,
    ) -> Result<AuthResponse, AuthError> {
        self.call(cancel, "send_auth_step", || self.api.send_auth_step(step.clone()))
            .await
    }

    async fn call<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &'static str,
        op: F,
    ) -> Result<T, AuthError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, crate::error::TransportError>>,
    {
        match retry_transient(&self.options.network_retry, cancel, operation, op).await {
            RetryOutcome::Done(value) => Ok(value),
            RetryOutcome::Failed { last, .. } => Err(AuthError::Transport(last)),
            RetryOutcome::Cancelled => Err(AuthError::Cancelled),
        }
    }

    fn unexpected(&self, response: AuthResponse) -> AuthError {
        AuthError::UnexpectedResponse {
            state: self.state().label(),
            response: format!("{response:?}"),
        }
    }
}

enum CodeRequest {
    Sent { phone: String, sent: SentCode },
    Authorized(AuthorizedUser),
    SignUp {
        phone: String,
        terms_of_service: Option<String>,
    },
}

async fn cancellable<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, AuthError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AuthError::Cancelled),
        value = fut => Ok(value),
    }
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
