//! Per-channel ordering and gap recovery.
//!
//! Every channel gets a lane: a bounded queue drained by one worker task. The
//! worker is the only writer of that channel's stored position, which keeps
//! dispatch and acknowledgement linearized per channel while channels never
//! wait on each other. A gap parks the lane in `Recovering`, closes the gap
//! with differential fetches and then replays whatever queued up meanwhile.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use shared::{
    domain::{ChannelId, SequencePosition},
    protocol::{Difference, UpdateEnvelope},
};
use storage::StateStore;
use tokio::{
    sync::{broadcast, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    dispatcher::Dispatcher,
    error::{GapUnrecoverable, SessionError},
    gaps::{Classification, GapDetector},
    retry::{retry_transient, RetryOutcome, RetryPolicy},
    transport::UpdatesApi,
};

#[derive(Debug, Clone)]
pub struct UpdatesConfig {
    /// Envelopes held per channel; the oldest is dropped beyond this.
    pub pending_capacity: usize,
    /// Fetch-then-replay rounds before a channel is given up.
    pub max_recovery_rounds: u32,
    /// Bound on `Slice` pages followed within one fetch.
    pub max_difference_pages: u32,
    pub fetch_retry: RetryPolicy,
    pub shutdown_grace: Duration,
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            pending_capacity: 1024,
            max_recovery_rounds: 3,
            max_difference_pages: 64,
            fetch_retry: RetryPolicy::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RecoveryEvent {
    Recovered {
        channel_id: ChannelId,
        pts: i64,
        fetched: usize,
    },
    Resynced {
        channel_id: ChannelId,
        pts: i64,
    },
    PendingOverflow {
        channel_id: ChannelId,
        dropped_pts: i64,
    },
    Unrecoverable(GapUnrecoverable),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Live,
    Recovering,
    Unrecoverable,
}

/// Bounded FIFO of envelopes waiting for their lane.
#[derive(Debug)]
pub struct PendingBuffer {
    items: VecDeque<UpdateEnvelope>,
    capacity: usize,
}

impl PendingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Appends `envelope`, returning the oldest entry if it had to be evicted.
    pub fn push(&mut self, envelope: UpdateEnvelope) -> Option<UpdateEnvelope> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(envelope);
        evicted
    }

    /// Puts `envelopes` back in front of anything queued since they were taken.
    pub fn requeue_front(&mut self, envelopes: Vec<UpdateEnvelope>) -> Vec<UpdateEnvelope> {
        for envelope in envelopes.into_iter().rev() {
            self.items.push_front(envelope);
        }
        let mut evicted = Vec::new();
        while self.items.len() > self.capacity {
            if let Some(envelope) = self.items.pop_front() {
                evicted.push(envelope);
            }
        }
        evicted
    }

    pub fn pop_front(&mut self) -> Option<UpdateEnvelope> {
        self.items.pop_front()
    }

    /// Empties the buffer, returning its contents in ascending pts order.
    pub fn drain_sorted(&mut self) -> Vec<UpdateEnvelope> {
        let mut drained: Vec<_> = self.items.drain(..).collect();
        drained.sort_by_key(|envelope| envelope.pts);
        drained
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

struct LaneState {
    status: ChannelStatus,
    pending: PendingBuffer,
    catch_up: bool,
}

struct Lane {
    state: Mutex<LaneState>,
    notify: Notify,
}

impl Lane {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LaneState {
                status: ChannelStatus::Live,
                pending: PendingBuffer::new(capacity),
                catch_up: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LaneState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn status(&self) -> ChannelStatus {
        self.lock().status
    }

    fn set_status(&self, status: ChannelStatus) {
        self.lock().status = status;
    }

    fn next_work(&self) -> Option<Work> {
        let mut state = self.lock();
        if state.status == ChannelStatus::Unrecoverable {
            return None;
        }
        if std::mem::take(&mut state.catch_up) {
            return Some(Work::CatchUp);
        }
        state.pending.pop_front().map(Work::Envelope)
    }
}

enum Work {
    Envelope(UpdateEnvelope),
    CatchUp,
}

/// Why a lane worker stopped processing.
enum Halt {
    Stopped,
    Unrecoverable(String),
}

pub struct RecoveryCoordinator {
    detector: GapDetector,
    store: Arc<dyn StateStore>,
    updates: Arc<dyn UpdatesApi>,
    dispatcher: Arc<Dispatcher>,
    config: UpdatesConfig,
    lanes: Mutex<HashMap<ChannelId, Arc<Lane>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<RecoveryEvent>,
    cancel: CancellationToken,
}

impl RecoveryCoordinator {
    pub fn new(
        store: Arc<dyn StateStore>,
        updates: Arc<dyn UpdatesApi>,
        dispatcher: Arc<Dispatcher>,
        config: UpdatesConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            detector: GapDetector::new(Arc::clone(&store)),
            store,
            updates,
            dispatcher,
            config,
            lanes: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            events,
            cancel,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RecoveryEvent> {
        self.events.subscribe()
    }

    pub fn status(&self, channel_id: ChannelId) -> Option<ChannelStatus> {
        self.existing_lane(channel_id).map(|lane| lane.status())
    }

    pub fn pending_len(&self, channel_id: ChannelId) -> usize {
        self.existing_lane(channel_id)
            .map_or(0, |lane| lane.lock().pending.len())
    }

    fn existing_lane(&self, channel_id: ChannelId) -> Option<Arc<Lane>> {
        self.lanes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&channel_id)
            .cloned()
    }

    fn lane(self: &Arc<Self>, channel_id: ChannelId) -> Arc<Lane> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(lane) = lanes.get(&channel_id) {
            return Arc::clone(lane);
        }
        let lane = Arc::new(Lane::new(self.config.pending_capacity));
        lanes.insert(channel_id, Arc::clone(&lane));
        drop(lanes);

        let coordinator = Arc::clone(self);
        let worker_lane = Arc::clone(&lane);
        let handle = tokio::spawn(async move {
            coordinator.run_lane(channel_id, worker_lane).await;
        });
        self.workers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(handle);
        lane
    }

    /// Queues a pushed (or command-returned) envelope for its channel.
    ///
    /// Never blocks on dispatch or recovery of any channel.
    pub async fn ingest(self: &Arc<Self>, envelope: UpdateEnvelope) {
        if self.cancel.is_cancelled() {
            debug!(
                channel_id = envelope.channel_id.0,
                pts = envelope.pts,
                "shutting down; update not accepted"
            );
            return;
        }
        let channel_id = envelope.channel_id;
        let lane = self.lane(channel_id);
        match lane.status() {
            ChannelStatus::Unrecoverable => {
                debug!(
                    channel_id = channel_id.0,
                    pts = envelope.pts,
                    "channel is unrecoverable; dropping update"
                );
                return;
            }
            ChannelStatus::Recovering => match self.detector.classify(&envelope).await {
                Ok(verdict) if verdict.classification == Classification::Duplicate => {
                    debug!(
                        channel_id = channel_id.0,
                        pts = envelope.pts,
                        "dropping duplicate while recovering"
                    );
                    return;
                }
                Ok(_) => {}
                Err(err) => warn!(
                    channel_id = channel_id.0,
                    error = %err,
                    "failed to classify update while recovering; buffering it"
                ),
            },
            ChannelStatus::Live => {}
        }

        let evicted = lane.lock().pending.push(envelope);
        if let Some(evicted) = evicted {
            self.report_overflow(channel_id, &evicted);
        }
        lane.notify.notify_one();
    }

    /// Schedules a differential fetch for `channel_id` even without a gap.
    pub fn request_catch_up(self: &Arc<Self>, channel_id: ChannelId) {
        if self.cancel.is_cancelled() {
            return;
        }
        let lane = self.lane(channel_id);
        {
            let mut state = lane.lock();
            if state.status == ChannelStatus::Unrecoverable {
                return;
            }
            state.catch_up = true;
        }
        lane.notify.notify_one();
    }

    /// Schedules catch-up for every stored and every active channel.
    pub async fn catch_up_known(self: &Arc<Self>) {
        let mut channels: Vec<ChannelId> = self
            .lanes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .copied()
            .collect();
        match self.store.positions().await {
            Ok(positions) => channels.extend(positions.iter().map(|p| p.channel_id)),
            Err(err) => warn!(error = %err, "failed to list stored positions for catch-up"),
        }
        channels.sort();
        channels.dedup();
        for channel_id in channels {
            self.request_catch_up(channel_id);
        }
    }

    /// Makes sure the common stream has a position to detect gaps against.
    ///
    /// With nothing stored (or `forget` set) the server's current state
    /// becomes the baseline; otherwise every stored channel catches up from
    /// where it left off.
    pub async fn establish_baseline(self: &Arc<Self>, forget: bool) -> Result<(), SessionError> {
        let stored = self
            .store
            .get(ChannelId::COMMON)
            .await
            .map_err(SessionError::Store)?;

        if stored.is_some() && !forget {
            info!(
                pts = stored.map(|p| p.pts),
                "resuming from stored update state"
            );
            self.catch_up_known().await;
            return Ok(());
        }

        if forget {
            let positions = self.store.positions().await.map_err(SessionError::Store)?;
            for position in positions.iter().filter(|p| !p.channel_id.is_common()) {
                self.store
                    .forget(position.channel_id)
                    .await
                    .map_err(SessionError::Store)?;
            }
        }

        let outcome = retry_transient(
            &self.config.fetch_retry,
            &self.cancel,
            "get_state",
            move || self.updates.get_state(),
        )
        .await;
        let state = match outcome {
            RetryOutcome::Done(state) => state,
            RetryOutcome::Failed { last, .. } => return Err(SessionError::Transport(last)),
            RetryOutcome::Cancelled => return Ok(()),
        };
        let state = SequencePosition::new(ChannelId::COMMON, state.pts, state.date);
        let swapped = self
            .store
            .compare_and_set(ChannelId::COMMON, stored.map(|p| p.pts), state)
            .await
            .map_err(SessionError::Store)?;
        if !swapped {
            warn!("common update state changed while establishing baseline");
        }
        info!(pts = state.pts, "update baseline established");
        Ok(())
    }

    /// Stops every lane, waiting up to the configured grace period.
    ///
    /// Workers only stop between items, so no position is ever acknowledged
    /// without its dispatch. Queued envelopes are discarded; they are fetched
    /// again through catch-up on the next start.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        let aborts: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();
        let joined = tokio::time::timeout(
            self.config.shutdown_grace,
            futures::future::join_all(workers),
        )
        .await;
        if joined.is_err() {
            warn!(
                grace_ms = self.config.shutdown_grace.as_millis() as u64,
                "update workers did not stop in time; aborting"
            );
            for abort in aborts {
                abort.abort();
            }
        }
        self.dispatcher.close();

        let lanes = self.lanes.lock().unwrap_or_else(|p| p.into_inner());
        for (channel_id, lane) in lanes.iter() {
            let pending = lane.lock().pending.len();
            if pending > 0 {
                info!(
                    channel_id = channel_id.0,
                    pending, "discarding buffered updates on shutdown"
                );
            }
        }
    }

    async fn run_lane(self: Arc<Self>, channel_id: ChannelId, lane: Arc<Lane>) {
        debug!(channel_id = channel_id.0, "update lane started");
        loop {
            let work = loop {
                if self.cancel.is_cancelled() {
                    return;
                }
                if let Some(work) = lane.next_work() {
                    break work;
                }
                if lane.status() == ChannelStatus::Unrecoverable {
                    return;
                }
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return,
                    _ = lane.notify.notified() => {}
                }
            };

            let result = match work {
                Work::Envelope(envelope) => self.process(channel_id, &lane, envelope).await,
                Work::CatchUp => self.recover(channel_id, &lane, None).await,
            };
            match result {
                Ok(()) => {}
                Err(Halt::Stopped) => {
                    debug!(channel_id = channel_id.0, "update lane stopped");
                    return;
                }
                Err(Halt::Unrecoverable(reason)) => {
                    self.abandon(channel_id, &lane, reason);
                    return;
                }
            }
        }
    }

    async fn process(
        &self,
        channel_id: ChannelId,
        lane: &Lane,
        envelope: UpdateEnvelope,
    ) -> Result<(), Halt> {
        let verdict = self
            .detector
            .classify(&envelope)
            .await
            .map_err(|err| Halt::Unrecoverable(format!("state store read failed: {err}")))?;
        match verdict.classification {
            Classification::Duplicate => {
                debug!(
                    channel_id = channel_id.0,
                    pts = envelope.pts,
                    current = verdict.current,
                    "dropping duplicate update"
                );
                Ok(())
            }
            Classification::InOrder => self.apply(&envelope, verdict.current).await,
            Classification::Gap => {
                info!(
                    channel_id = channel_id.0,
                    pts = envelope.pts,
                    current = verdict.current,
                    "update gap detected"
                );
                self.recover(channel_id, lane, Some(envelope)).await
            }
        }
    }

    /// Delivers `envelope`, then acknowledges it in the store.
    async fn apply(&self, envelope: &UpdateEnvelope, expected: Option<i64>) -> Result<(), Halt> {
        self.dispatcher
            .deliver(envelope)
            .await
            .map_err(|_| Halt::Stopped)?;
        self.acknowledge(envelope.channel_id, expected, envelope.position())
            .await
    }

    async fn acknowledge(
        &self,
        channel_id: ChannelId,
        expected: Option<i64>,
        position: SequencePosition,
    ) -> Result<(), Halt> {
        let swapped = self
            .store
            .compare_and_set(channel_id, expected, position)
            .await
            .map_err(|err| Halt::Unrecoverable(format!("state store write failed: {err}")))?;
        if !swapped {
            warn!(
                channel_id = channel_id.0,
                expected,
                pts = position.pts,
                "stored position moved underneath the update lane"
            );
        }
        Ok(())
    }

    async fn current_pts(&self, channel_id: ChannelId) -> Result<Option<i64>, Halt> {
        self.store
            .get(channel_id)
            .await
            .map(|position| position.map(|p| p.pts))
            .map_err(|err| Halt::Unrecoverable(format!("state store read failed: {err}")))
    }

    async fn recover(
        &self,
        channel_id: ChannelId,
        lane: &Lane,
        trigger: Option<UpdateEnvelope>,
    ) -> Result<(), Halt> {
        {
            let mut state = lane.lock();
            state.status = ChannelStatus::Recovering;
            state.catch_up = false;
            if let Some(trigger) = trigger {
                if let Some(evicted) = state.pending.push(trigger) {
                    drop(state);
                    self.report_overflow(channel_id, &evicted);
                }
            }
        }

        for round in 1..=self.config.max_recovery_rounds {
            let fetched = self.fetch_and_apply(channel_id).await?;

            let mut replay = lane.lock().pending.drain_sorted().into_iter();
            let mut unresolved = None;
            while let Some(envelope) = replay.next() {
                let verdict = self
                    .detector
                    .classify(&envelope)
                    .await
                    .map_err(|err| Halt::Unrecoverable(format!("state store read failed: {err}")))?;
                match verdict.classification {
                    Classification::Duplicate => {}
                    Classification::InOrder => self.apply(&envelope, verdict.current).await?,
                    Classification::Gap => {
                        unresolved = Some(envelope.pts);
                        let mut rest = vec![envelope];
                        rest.extend(replay.by_ref());
                        let evicted = lane.lock().pending.requeue_front(rest);
                        for envelope in evicted {
                            self.report_overflow(channel_id, &envelope);
                        }
                        break;
                    }
                }
            }

            let Some(gap_pts) = unresolved else {
                lane.set_status(ChannelStatus::Live);
                let pts = self.current_pts(channel_id).await?.unwrap_or_default();
                info!(channel_id = channel_id.0, pts, fetched, round, "channel recovered");
                let _ = self.events.send(RecoveryEvent::Recovered {
                    channel_id,
                    pts,
                    fetched,
                });
                return Ok(());
            };
            info!(
                channel_id = channel_id.0,
                round,
                gap_pts,
                "gap remains after replay; fetching again"
            );
        }

        Err(Halt::Unrecoverable(format!(
            "gap still open after {} recovery rounds",
            self.config.max_recovery_rounds
        )))
    }

    /// Pulls the missed range for `channel_id` and applies it in pts order.
    /// Returns the number of fetched updates that were dispatched.
    async fn fetch_and_apply(&self, channel_id: ChannelId) -> Result<usize, Halt> {
        let mut applied = 0;
        for _ in 0..self.config.max_difference_pages {
            let Some(from_pts) = self.current_pts(channel_id).await? else {
                return Ok(applied + self.resync(channel_id).await?);
            };

            let outcome = retry_transient(
                &self.config.fetch_retry,
                &self.cancel,
                "fetch_difference",
                move || self.updates.fetch_difference(channel_id, from_pts),
            )
            .await;
            let difference = match outcome {
                RetryOutcome::Done(difference) => difference,
                RetryOutcome::Cancelled => return Err(Halt::Stopped),
                RetryOutcome::Failed { attempts, last } => {
                    return Err(Halt::Unrecoverable(format!(
                        "differential fetch failed after {attempts} attempts: {last}"
                    )))
                }
            };

            match difference {
                Difference::Empty { position } => {
                    self.advance_to(channel_id, position).await?;
                    return Ok(applied);
                }
                Difference::Complete { updates, position } => {
                    applied += self.apply_fetched(channel_id, updates).await?;
                    self.advance_to(channel_id, position).await?;
                    return Ok(applied);
                }
                Difference::Slice { updates, next } => {
                    applied += self.apply_fetched(channel_id, updates).await?;
                    self.advance_to(channel_id, next).await?;
                }
                Difference::TooLong { position } => {
                    info!(
                        channel_id = channel_id.0,
                        from_pts,
                        server_pts = position.pts,
                        "difference too long; resyncing channel"
                    );
                    return Ok(applied + self.resync(channel_id).await?);
                }
            }
        }

        Err(Halt::Unrecoverable(format!(
            "difference did not complete within {} pages",
            self.config.max_difference_pages
        )))
    }

    async fn apply_fetched(
        &self,
        channel_id: ChannelId,
        mut updates: Vec<UpdateEnvelope>,
    ) -> Result<usize, Halt> {
        updates.sort_by_key(|envelope| envelope.pts);
        let mut applied = 0;
        for mut envelope in updates {
            envelope.channel_id = channel_id;
            let current = self.current_pts(channel_id).await?;
            if current.is_some_and(|pts| envelope.pts <= pts) {
                continue;
            }
            self.apply(&envelope, current).await?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Moves the stored position forward to the server-reported one once
    /// everything before it has been applied. Never moves backwards.
    async fn advance_to(
        &self,
        channel_id: ChannelId,
        position: SequencePosition,
    ) -> Result<(), Halt> {
        let current = self.current_pts(channel_id).await?;
        if current.is_some_and(|pts| pts >= position.pts) {
            return Ok(());
        }
        let position = SequencePosition::new(channel_id, position.pts, position.date);
        self.acknowledge(channel_id, current, position).await
    }

    /// Full resync: applies the snapshot's updates and adopts its position
    /// unconditionally.
    async fn resync(&self, channel_id: ChannelId) -> Result<usize, Halt> {
        let outcome = retry_transient(
            &self.config.fetch_retry,
            &self.cancel,
            "resync_channel",
            move || self.updates.resync_channel(channel_id),
        )
        .await;
        let snapshot = match outcome {
            RetryOutcome::Done(snapshot) => snapshot,
            RetryOutcome::Cancelled => return Err(Halt::Stopped),
            RetryOutcome::Failed { attempts, last } => {
                return Err(Halt::Unrecoverable(format!(
                    "channel resync failed after {attempts} attempts: {last}"
                )))
            }
        };

        let applied = self.apply_fetched(channel_id, snapshot.updates).await?;
        let current = self.current_pts(channel_id).await?;
        if current != Some(snapshot.position.pts) {
            let position =
                SequencePosition::new(channel_id, snapshot.position.pts, snapshot.position.date);
            self.acknowledge(channel_id, current, position).await?;
        }
        info!(
            channel_id = channel_id.0,
            pts = snapshot.position.pts,
            applied,
            "channel resynced"
        );
        let _ = self.events.send(RecoveryEvent::Resynced {
            channel_id,
            pts: snapshot.position.pts,
        });
        Ok(applied)
    }

    fn abandon(&self, channel_id: ChannelId, lane: &Lane, reason: String) {
        let dropped = {
            let mut state = lane.lock();
            state.status = ChannelStatus::Unrecoverable;
            state.catch_up = false;
            state.pending.drain_sorted().len()
        };
        let failure = GapUnrecoverable { channel_id, reason };
        error!(
            channel_id = channel_id.0,
            dropped,
            error = %failure,
            "abandoning channel update stream"
        );
        let _ = self.events.send(RecoveryEvent::Unrecoverable(failure));
    }

    fn report_overflow(&self, channel_id: ChannelId, evicted: &UpdateEnvelope) {
        warn!(
            channel_id = channel_id.0,
            dropped_pts = evicted.pts,
            capacity = self.config.pending_capacity,
            "pending buffer full; dropped oldest update"
        );
        let _ = self.events.send(RecoveryEvent::PendingOverflow {
            channel_id,
            dropped_pts: evicted.pts,
        });
    }
}

#[cfg(test)]
#[path = "tests/recovery_tests.rs"]
mod tests;
