use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};

use async_trait::async_trait;
use shared::protocol::{EventKind, UpdateEnvelope};
use tracing::warn;

use crate::error::DispatchError;

#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn handle(&self, update: &UpdateEnvelope) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> UpdateHandler for F
where
    F: Fn(UpdateEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, update: &UpdateEnvelope) -> anyhow::Result<()> {
        (self)(update.clone()).await
    }
}

/// Fans ordered updates out to the handlers registered for their kind.
///
/// Handler failures are logged and never stop the remaining handlers.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<EventKind, Vec<Arc<dyn UpdateHandler>>>>,
    closed: AtomicBool,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(&self, kind: EventKind, handler: impl UpdateHandler + 'static) {
        self.handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&kind)
            .map_or(0, Vec::len)
    }

    pub async fn deliver(&self, update: &UpdateEnvelope) -> Result<(), DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::Stopped);
        }
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&update.kind())
            .cloned()
            .unwrap_or_default();

        for (index, handler) in handlers.iter().enumerate() {
            if let Err(err) = handler.handle(update).await {
                warn!(
                    kind = ?update.kind(),
                    channel_id = update.channel_id.0,
                    pts = update.pts,
                    handler = index,
                    error = %format!("{err:#}"),
                    "update handler failed"
                );
            }
        }
        Ok(())
    }

    /// Stops accepting updates. Deliveries already running finish.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Accepts updates again after [`Dispatcher::close`].
    pub fn open(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
