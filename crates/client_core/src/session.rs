//! Top-level driver: authenticate, go live, run until cancelled.

use std::{future::Future, sync::Arc, time::Duration};

use futures::StreamExt;
use storage::StateStore;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    auth::{AuthFlow, Session},
    dispatcher::Dispatcher,
    error::SessionError,
    messenger::Messenger,
    recovery::{RecoveryCoordinator, UpdatesConfig},
    retry::{retry_transient, RetryOutcome, RetryPolicy},
    transport::{MessagesApi, UpdatesApi},
};

/// How the receive task re-establishes a dropped push subscription.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub retry: RetryPolicy,
    /// Pause after a subscription ends before subscribing again.
    pub resubscribe_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(30)),
            resubscribe_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Discard stored positions and start from the server's current state.
    pub forget_state: bool,
    pub reconnect: ReconnectPolicy,
}

/// Everything application code needs once the session is live.
#[derive(Clone)]
pub struct LiveContext {
    pub session: Session,
    pub messenger: Arc<Messenger>,
    pub coordinator: Arc<RecoveryCoordinator>,
    /// Fires when the session starts shutting down.
    pub cancel: CancellationToken,
}

pub struct SessionLoop {
    auth: Arc<AuthFlow>,
    updates: Arc<dyn UpdatesApi>,
    messages: Arc<dyn MessagesApi>,
    store: Arc<dyn StateStore>,
    dispatcher: Arc<Dispatcher>,
    config: UpdatesConfig,
    options: SessionOptions,
}

impl SessionLoop {
    pub fn new(
        auth: Arc<AuthFlow>,
        updates: Arc<dyn UpdatesApi>,
        messages: Arc<dyn MessagesApi>,
        store: Arc<dyn StateStore>,
        dispatcher: Arc<Dispatcher>,
        config: UpdatesConfig,
        options: SessionOptions,
    ) -> Self {
        Self {
            auth,
            updates,
            messages,
            store,
            dispatcher,
            config,
            options,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Runs one session to completion.
    ///
    /// `on_live` is started once updates flow; its failure ends the session,
    /// its success does not. Returns `Ok(())` when `cancel` fires after the
    /// session went live. A cancel during login surfaces as
    /// [`crate::error::AuthError::Cancelled`].
    pub async fn run<F, Fut>(
        &self,
        cancel: &CancellationToken,
        on_live: F,
    ) -> Result<(), SessionError>
    where
        F: FnOnce(LiveContext) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let session = self.auth.authenticate(cancel).await?;
        info!(
            user_id = session.user_id.0,
            is_bot = session.is_bot,
            "session authenticated"
        );

        // A previous run closed the dispatcher on its way out.
        self.dispatcher.open();
        let live = cancel.child_token();
        let coordinator = RecoveryCoordinator::new(
            Arc::clone(&self.store),
            Arc::clone(&self.updates),
            Arc::clone(&self.dispatcher),
            self.config.clone(),
            live.clone(),
        );

        let result = self.drive(&live, &coordinator, session, on_live).await;

        live.cancel();
        coordinator.shutdown().await;
        self.auth.release();
        match &result {
            Ok(()) => info!("session stopped"),
            Err(err) => error!(error = %err, "session terminated"),
        }
        result
    }

    async fn drive<F, Fut>(
        &self,
        live: &CancellationToken,
        coordinator: &Arc<RecoveryCoordinator>,
        session: Session,
        on_live: F,
    ) -> Result<(), SessionError>
    where
        F: FnOnce(LiveContext) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        coordinator
            .establish_baseline(self.options.forget_state)
            .await?;

        let (fatal_tx, mut fatal_rx) = oneshot::channel();
        let receiver = tokio::spawn(receive_updates(
            Arc::clone(&self.updates),
            Arc::clone(coordinator),
            self.options.reconnect.clone(),
            live.clone(),
            fatal_tx,
        ));

        let messenger = Arc::new(Messenger::new(
            Arc::clone(&self.messages),
            Arc::clone(coordinator),
            self.config.fetch_retry.clone(),
            live.clone(),
        ));
        let app = on_live(LiveContext {
            session,
            messenger,
            coordinator: Arc::clone(coordinator),
            cancel: live.clone(),
        });
        tokio::pin!(app);

        let mut app_running = true;
        let result = loop {
            tokio::select! {
                biased;
                _ = live.cancelled() => break Ok(()),
                fatal = &mut fatal_rx => match fatal {
                    Ok(err) => break Err(err),
                    Err(_) => break Ok(()),
                },
                outcome = &mut app, if app_running => {
                    app_running = false;
                    if let Err(err) = outcome {
                        break Err(SessionError::Application(err));
                    }
                    info!("application task finished; running until cancelled");
                }
            }
        };

        live.cancel();
        if let Err(err) = receiver.await {
            warn!(error = %err, "update receive task panicked");
        }
        result
    }
}

/// Feeds pushed envelopes into the coordinator, re-subscribing whenever the
/// stream ends. Reports exhaustion on `fatal`.
async fn receive_updates(
    updates: Arc<dyn UpdatesApi>,
    coordinator: Arc<RecoveryCoordinator>,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
    fatal: oneshot::Sender<SessionError>,
) {
    let mut reconnecting = false;
    loop {
        let outcome =
            retry_transient(&policy.retry, &cancel, "subscribe", || updates.subscribe()).await;
        let mut stream = match outcome {
            RetryOutcome::Done(stream) => stream,
            RetryOutcome::Cancelled => return,
            RetryOutcome::Failed { attempts, last } => {
                error!(attempts, error = %last, "could not subscribe to updates");
                let _ = fatal.send(SessionError::SubscriptionLost {
                    attempts,
                    source: last,
                });
                return;
            }
        };

        if reconnecting {
            info!("update subscription re-established; catching up");
            coordinator.catch_up_known().await;
        } else {
            info!("update subscription established");
        }
        reconnecting = true;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                next = stream.next() => match next {
                    Some(envelope) => coordinator.ingest(envelope).await,
                    None => break,
                },
            }
        }

        warn!(
            delay_ms = policy.resubscribe_delay.as_millis() as u64,
            "update subscription closed; reconnecting"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(policy.resubscribe_delay) => {}
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
