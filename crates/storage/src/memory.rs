use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use shared::domain::{ChannelId, SequencePosition};
use tokio::sync::Mutex;

use crate::{ensure_channel_matches, SessionStore, StateStore, StoredSession};

type Slot = Arc<Mutex<Option<SequencePosition>>>;

/// Process-local store. Each channel owns its own slot so a swap on one
/// channel never waits for another.
#[derive(Default)]
pub struct MemoryStore {
    slots: std::sync::Mutex<HashMap<ChannelId, Slot>>,
    session: Mutex<Option<StoredSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_positions(positions: impl IntoIterator<Item = SequencePosition>) -> Self {
        let store = Self::default();
        {
            let mut slots = store.slots_guard();
            for position in positions {
                slots.insert(position.channel_id, Arc::new(Mutex::new(Some(position))));
            }
        }
        store
    }

    fn slots_guard(&self) -> std::sync::MutexGuard<'_, HashMap<ChannelId, Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, channel_id: ChannelId) -> Slot {
        Arc::clone(self.slots_guard().entry(channel_id).or_default())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, channel_id: ChannelId) -> Result<Option<SequencePosition>> {
        let slot = self.slot(channel_id);
        let current = *slot.lock().await;
        Ok(current)
    }

    async fn compare_and_set(
        &self,
        channel_id: ChannelId,
        expected: Option<i64>,
        new: SequencePosition,
    ) -> Result<bool> {
        ensure_channel_matches(channel_id, &new)?;
        let slot = self.slot(channel_id);
        let mut current = slot.lock().await;
        if current.map(|position| position.pts) != expected {
            return Ok(false);
        }
        *current = Some(new);
        Ok(true)
    }

    async fn positions(&self) -> Result<Vec<SequencePosition>> {
        let slots: Vec<Slot> = self.slots_guard().values().cloned().collect();
        let mut positions = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(position) = *slot.lock().await {
                positions.push(position);
            }
        }
        positions.sort_by_key(|position| position.channel_id);
        Ok(positions)
    }

    async fn forget(&self, channel_id: ChannelId) -> Result<()> {
        let slot = self.slot(channel_id);
        *slot.lock().await = None;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load_session(&self) -> Result<Option<StoredSession>> {
        Ok(self.session.lock().await.clone())
    }

    async fn save_session(&self, session: &StoredSession) -> Result<()> {
        *self.session.lock().await = Some(session.clone());
        Ok(())
    }

    async fn clear_session(&self) -> Result<()> {
        self.session.lock().await.take();
        Ok(())
    }
}
