use std::sync::Arc;

use anyhow::Result;
use shared::protocol::UpdateEnvelope;
use storage::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    InOrder,
    Duplicate,
    Gap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub classification: Classification,
    /// Stored pts the verdict was computed against; `None` for a stream seen
    /// for the first time.
    pub current: Option<i64>,
}

/// Classifies `envelope` against the stored pts of its stream.
///
/// The envelope is in order when it lands exactly `pts_count` past the
/// current position, already applied when it does not get past it, and a gap
/// otherwise. A stream with nothing stored accepts its first update as the
/// baseline. The `date` field is never consulted.
pub fn classify(current: Option<i64>, envelope: &UpdateEnvelope) -> Classification {
    let Some(current) = current else {
        return Classification::InOrder;
    };
    let expected = current.saturating_add(envelope.pts_count.max(1));
    if envelope.pts < expected {
        Classification::Duplicate
    } else if envelope.pts == expected {
        Classification::InOrder
    } else {
        Classification::Gap
    }
}

#[derive(Clone)]
pub struct GapDetector {
    store: Arc<dyn StateStore>,
}

impl GapDetector {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub async fn classify(&self, envelope: &UpdateEnvelope) -> Result<Verdict> {
        let current = self
            .store
            .get(envelope.channel_id)
            .await?
            .map(|position| position.pts);
        Ok(Verdict {
            classification: classify(current, envelope),
            current,
        })
    }
}

#[cfg(test)]
#[path = "tests/gaps_tests.rs"]
mod tests;
