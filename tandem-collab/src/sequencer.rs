//! Per-document sequencers.
//!
//! ```text
//!   submit ──┐                        ┌──► CheckpointStore (append, flush)
//!   subscribe├─► mpsc (bounded) ─► DocumentActor
//!   cursor ──┘                        └──► SessionBroadcaster (ack / fan-out)
//! ```
//!
//! Each loaded document is owned by one tokio task that processes commands
//! strictly one at a time, so ordering, transformation and the
//! append-before-ack rule need no locks. Store calls run on the blocking
//! pool. The [`DocumentRegistry`] spawns actors on first use and replaces
//! ones that have hibernated.
//!
//! A submission whose `(author, client_op_id)` was already sequenced is not
//! applied again; its author is re-acked with the original version. Callers
//! that time out waiting for a reply can therefore retry safely.
//!
//! Lifecycle: `Unloaded → Loading → Active ⇄ Hibernating → Unloaded`, with
//! `Active → Loading → Active` while a document is reloaded from the store.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use crate::broadcast::SessionBroadcaster;
use crate::checkpoint::{CheckpointStore, FlushSchedule};
use crate::config::SequencerConfig;
use crate::connection::ConnectionHandle;
use crate::document::{AppliedOperation, Bootstrap, Document};
use crate::error::CollabError;
use crate::observer::{EngineEvent, EventBus};
use crate::storage::StoreError;
use crate::protocol::{
    ConnectionId, DocumentId, ParticipantInfo, ResyncReason, Selection, ServerMessage, UserId,
    VersionedOperation,
};

/// How often a request is re-routed when it races an actor shutting down.
const ROUTE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Unloaded,
    Loading,
    Active,
    /// No participants; evicted once idle for `hibernate_after`.
    Hibernating,
}

/// An operation submitted for sequencing, still in wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub operation: Vec<u8>,
    pub base_version: u64,
    pub author_id: UserId,
    pub client_op_id: Option<u64>,
    /// Connection that receives the `Ack` instead of the broadcast.
    pub origin: Option<ConnectionId>,
}

/// Point-in-time view of a loaded document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    pub document_id: DocumentId,
    pub version: u64,
    pub content: String,
    pub checkpoint_version: u64,
    /// Applied operations not yet in the durable log.
    pub unpersisted: usize,
    pub degraded: bool,
    pub state: SequencerState,
}

type Reply<T> = oneshot::Sender<Result<T, CollabError>>;

enum Command {
    Submit {
        submission: Submission,
        reply: Reply<u64>,
    },
    Subscribe {
        connection: Arc<ConnectionHandle>,
        last_seen_version: Option<u64>,
        reply: Reply<ParticipantInfo>,
    },
    Cursor {
        connection_id: ConnectionId,
        version: u64,
        selection: Selection,
        reply: Reply<()>,
    },
    Flush {
        reply: Reply<u64>,
    },
    Reload {
        reply: Reply<u64>,
    },
    Snapshot {
        reply: Reply<DocumentSnapshot>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Why a command never reached a running actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Routed {
    Busy,
    Gone,
}

/// Sending side of a document actor.
#[derive(Clone)]
pub struct SequencerHandle {
    document_id: DocumentId,
    tx: mpsc::Sender<Command>,
    state: watch::Receiver<SequencerState>,
    submit_timeout: Duration,
    reply_timeout: Duration,
}

impl SequencerHandle {
    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn state(&self) -> SequencerState {
        *self.state.borrow()
    }

    fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<Result<T, CollabError>, Routed> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send_timeout(build(reply), self.submit_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => Routed::Busy,
                SendTimeoutError::Closed(_) => Routed::Gone,
            })?;
        match tokio::time::timeout(self.reply_timeout, rx).await {
            Ok(reply) => reply.map_err(|_| Routed::Gone),
            // Still queued or running; a retry is deduplicated.
            Err(_) => Err(Routed::Busy),
        }
    }

    /// Wait until the actor behind this handle has finished its final flush.
    async fn stopped(&self) {
        let mut state = self.state.clone();
        // An actor that died without reporting has nothing left to flush.
        let _ = state
            .wait_for(|state| *state == SequencerState::Unloaded)
            .await;
    }
}

/// Owns the set of running document actors.
pub struct DocumentRegistry {
    store: CheckpointStore,
    broadcaster: Arc<SessionBroadcaster>,
    events: EventBus,
    config: SequencerConfig,
    sequencers: Mutex<HashMap<DocumentId, SequencerHandle>>,
}

impl DocumentRegistry {
    pub fn new(
        store: CheckpointStore,
        broadcaster: Arc<SessionBroadcaster>,
        events: EventBus,
        config: SequencerConfig,
    ) -> Self {
        Self {
            store,
            broadcaster,
            events,
            config,
            sequencers: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Handle to the document's running actor, loading it if needed.
    ///
    /// The registry lock is held across loading so two callers never spawn
    /// two actors for one document.
    pub async fn handle(&self, document_id: DocumentId) -> Result<SequencerHandle, CollabError> {
        let mut sequencers = self.sequencers.lock().await;
        if let Some(handle) = sequencers.get(&document_id) {
            if handle.is_running() {
                return Ok(handle.clone());
            }
            // Hibernated or stopped; its final flush must land before reload.
            handle.stopped().await;
            sequencers.remove(&document_id);
        }

        let handle = self.spawn(document_id).await?;
        sequencers.insert(document_id, handle.clone());
        Ok(handle)
    }

    async fn spawn(&self, document_id: DocumentId) -> Result<SequencerHandle, CollabError> {
        let (state_tx, state_rx) = watch::channel(SequencerState::Loading);
        let document = match load(&self.store, document_id, self.config.transform_window).await {
            Ok(document) => document,
            Err(e) => {
                log::warn!("Failed to load document {document_id}: {e}");
                return Err(e);
            }
        };
        self.events.emit(EngineEvent::DocumentLoaded {
            document_id,
            version: document.version(),
        });

        let (tx, rx) = mpsc::channel(self.config.queue_depth.max(1));
        let actor = DocumentActor {
            schedule: FlushSchedule::new(self.config.checkpoint.clone()),
            document,
            store: self.store.clone(),
            broadcaster: self.broadcaster.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
            unpersisted: VecDeque::new(),
            degraded: false,
            reload_pending: false,
            idle_since: None,
            stopping: false,
            state: state_tx,
        };
        tokio::spawn(actor.run(rx));

        Ok(SequencerHandle {
            document_id,
            tx,
            state: state_rx,
            submit_timeout: self.config.submit_timeout,
            reply_timeout: self.config.reply_timeout,
        })
    }

    /// Route a command to the document's actor, retrying once more if the
    /// actor shut down while the command was queued.
    async fn route<T>(
        &self,
        document_id: DocumentId,
        build: impl Fn(Reply<T>) -> Command,
    ) -> Result<T, CollabError> {
        for _ in 0..ROUTE_ATTEMPTS {
            let handle = self.handle(document_id).await?;
            match handle.call(&build).await {
                Ok(result) => return result,
                Err(Routed::Busy) => return Err(CollabError::SequencerBusy(document_id)),
                Err(Routed::Gone) => {
                    log::debug!("Sequencer for {document_id} stopped mid-request; rerouting");
                }
            }
        }
        Err(CollabError::DocumentUnavailable {
            document_id,
            detail: "sequencer keeps restarting".to_string(),
        })
    }

    /// Sequence an operation. Returns the version it was applied at.
    pub async fn submit(
        &self,
        document_id: DocumentId,
        submission: Submission,
    ) -> Result<u64, CollabError> {
        self.route(document_id, |reply| Command::Submit {
            submission: submission.clone(),
            reply,
        })
        .await
    }

    /// Bootstrap `connection` and add it to the document's session.
    pub async fn subscribe(
        &self,
        document_id: DocumentId,
        connection: Arc<ConnectionHandle>,
        last_seen_version: Option<u64>,
    ) -> Result<ParticipantInfo, CollabError> {
        self.route(document_id, |reply| Command::Subscribe {
            connection: connection.clone(),
            last_seen_version,
            reply,
        })
        .await
    }

    /// Record a selection made at `version`, moved up to the current version.
    pub async fn update_cursor(
        &self,
        document_id: DocumentId,
        connection_id: ConnectionId,
        version: u64,
        selection: Selection,
    ) -> Result<(), CollabError> {
        self.route(document_id, |reply| Command::Cursor {
            connection_id,
            version,
            selection,
            reply,
        })
        .await
    }

    /// Checkpoint now. Returns the checkpointed version.
    pub async fn flush(&self, document_id: DocumentId) -> Result<u64, CollabError> {
        self.route(document_id, |reply| Command::Flush { reply })
            .await
    }

    /// Rebuild the document from the store and ask its participants to
    /// resubscribe. Refused, and retried by the actor, while acked
    /// operations are not yet durable. Returns the reloaded version.
    pub async fn reload(&self, document_id: DocumentId) -> Result<u64, CollabError> {
        self.route(document_id, |reply| Command::Reload { reply })
            .await
    }

    pub async fn snapshot(&self, document_id: DocumentId) -> Result<DocumentSnapshot, CollabError> {
        self.route(document_id, |reply| Command::Snapshot { reply })
            .await
    }

    /// Lifecycle state without loading the document.
    pub async fn state(&self, document_id: DocumentId) -> SequencerState {
        match self.sequencers.lock().await.get(&document_id) {
            Some(handle) if handle.is_running() => handle.state(),
            _ => SequencerState::Unloaded,
        }
    }

    pub async fn loaded_documents(&self) -> Vec<DocumentId> {
        self.sequencers
            .lock()
            .await
            .values()
            .filter(|handle| handle.is_running())
            .map(SequencerHandle::document_id)
            .collect()
    }

    /// Flush and stop every actor.
    pub async fn shutdown(&self) {
        let handles: Vec<SequencerHandle> = self
            .sequencers
            .lock()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            match handle.call(|reply| Command::Shutdown { reply }).await {
                Ok(Ok(())) | Err(Routed::Gone) => {}
                Ok(Err(e)) => {
                    log::error!("Final flush of {} failed: {e}", handle.document_id());
                }
                Err(Routed::Busy) => {
                    log::warn!("Sequencer for {} busy at shutdown", handle.document_id());
                }
            }
            handle.stopped().await;
        }
    }
}

async fn load(
    store: &CheckpointStore,
    document_id: DocumentId,
    window: usize,
) -> Result<Document, CollabError> {
    let store = store.clone();
    tokio::task::spawn_blocking(move || store.load_document(document_id, window))
        .await
        .map_err(|e| CollabError::DocumentUnavailable {
            document_id,
            detail: e.to_string(),
        })?
}

/// Run a store call on the blocking pool.
async fn blocking<T, F>(store: &CheckpointStore, call: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&CheckpointStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || call(&store))
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
}

/// The single writer of one document.
struct DocumentActor {
    document: Document,
    store: CheckpointStore,
    broadcaster: Arc<SessionBroadcaster>,
    events: EventBus,
    config: SequencerConfig,
    schedule: FlushSchedule,
    /// Applied operations whose durable append failed, oldest first. Later
    /// operations queue behind them so the durable log never has gaps.
    unpersisted: VecDeque<AppliedOperation>,
    degraded: bool,
    /// A reload is waiting for `unpersisted` to drain.
    reload_pending: bool,
    idle_since: Option<Instant>,
    stopping: bool,
    state: watch::Sender<SequencerState>,
}

impl DocumentActor {
    fn id(&self) -> DocumentId {
        self.document.id()
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        self.set_state(SequencerState::Active);
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !self.stopping {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        let _ = reply.send(self.flush().await.map(|_| ()));
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        if let Err(e) = self.flush().await {
                            log::error!("Final flush of {} failed: {e}", self.id());
                        }
                        break;
                    }
                },
                _ = ticker.tick() => self.housekeeping().await,
            }
        }

        // Refuse new work; anything still queued is rerouted by its caller
        // to the next actor once this one reports Unloaded.
        rx.close();
        while let Some(command) = rx.recv().await {
            drop(command);
        }
        self.set_state(SequencerState::Unloaded);
        log::debug!("Sequencer for {} stopped at v{}", self.id(), self.document.version());
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Submit { submission, reply } => {
                self.wake();
                let result = self.submit(submission).await;
                let _ = reply.send(result);
            }
            Command::Subscribe {
                connection,
                last_seen_version,
                reply,
            } => {
                self.wake();
                let result = self.subscribe(connection, last_seen_version).await;
                let _ = reply.send(result);
            }
            Command::Cursor {
                connection_id,
                version,
                selection,
                reply,
            } => {
                let result = self.update_cursor(connection_id, version, selection).await;
                let _ = reply.send(result);
            }
            Command::Flush { reply } => {
                let result = self.flush().await;
                self.refresh_degraded().await;
                let _ = reply.send(result);
            }
            Command::Reload { reply } => {
                log::info!("Reload of {} requested", self.id());
                self.reload_pending = true;
                let result = self.try_reload().await;
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(self.snapshot()));
            }
            Command::Shutdown { reply } => {
                // Handled by the run loop.
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn submit(&mut self, submission: Submission) -> Result<u64, CollabError> {
        if let Some(client_op_id) = submission.client_op_id {
            if let Some(version) = self
                .document
                .applied_version(submission.author_id, client_op_id)
            {
                log::debug!(
                    "Operation {client_op_id} of {} already sequenced into {} at v{version}",
                    submission.author_id,
                    self.id()
                );
                if let Some(origin) = submission.origin {
                    self.broadcaster
                        .acknowledge(self.id(), origin, version, client_op_id)
                        .await;
                }
                return Ok(version);
            }
        }

        let current = self.document.version();
        let operation =
            tandem_ot::decode_with_limits(&submission.operation, &self.config.codec_limits)
                .map_err(|e| CollabError::MalformedOperation {
                    reason: e.to_string(),
                    current,
                })?;

        let applied = match self.document.submit(
            operation,
            submission.base_version,
            submission.author_id,
            submission.client_op_id,
        ) {
            Ok(applied) => applied,
            Err(e @ CollabError::BaseVersionMismatch { .. }) => {
                self.reload(&e).await;
                return Err(e);
            }
            Err(e) => {
                log::debug!("Rejected submission to {}: {e}", self.id());
                return Err(e);
            }
        };

        // Durable before anyone hears about it.
        self.persist(&applied).await;
        self.schedule.record_op();

        if let Err(e) = self.broadcaster.publish(&applied, submission.origin).await {
            log::error!("Failed to publish v{} of {}: {e}", applied.version, self.id());
        }
        self.events.emit(EngineEvent::OperationApplied {
            document_id: applied.document_id,
            version: applied.version,
            author_id: applied.author_id,
        });

        if self.schedule.is_due() {
            // Failures are retried with backoff from housekeeping.
            let _ = self.flush().await;
        }
        self.refresh_degraded().await;
        Ok(applied.version)
    }

    async fn subscribe(
        &mut self,
        connection: Arc<ConnectionHandle>,
        last_seen_version: Option<u64>,
    ) -> Result<ParticipantInfo, CollabError> {
        let subscriber = connection.user_id();
        let (checkpoint, replay) = match self.document.bootstrap(last_seen_version, subscriber)? {
            Bootstrap::Replay(operations) => (None, operations),
            Bootstrap::Checkpoint {
                checkpoint,
                operations,
            } => (Some(checkpoint), operations),
        };
        let replay_operations = replay
            .iter()
            .map(AppliedOperation::to_versioned)
            .collect::<Result<Vec<VersionedOperation>, CollabError>>()?;

        let version = self.document.version();
        let subscribed = ServerMessage::Subscribed {
            document_id: self.id(),
            current_version: version,
            checkpoint,
            replay_operations,
        };
        let participant = self
            .broadcaster
            .join(self.id(), &connection, version, self.degraded, &subscribed)
            .await?;
        self.set_state(SequencerState::Active);
        Ok(participant)
    }

    async fn update_cursor(
        &mut self,
        connection_id: ConnectionId,
        version: u64,
        selection: Selection,
    ) -> Result<(), CollabError> {
        let current = self.document.version();
        if version > current {
            return Err(CollabError::InvalidBaseVersion {
                base: version,
                current,
            });
        }
        let moved = match self.document.history_since(version) {
            Some(operations) => operations.fold(selection, |sel, op| sel.transform(&op.operation)),
            // Too old to transform; keep it inside the document at least.
            None => Selection {
                anchor: selection.anchor.min(self.document.len()),
                head: selection.head.min(self.document.len()),
            },
        };
        self.broadcaster
            .update_cursor(self.id(), connection_id, current, moved)
            .await
    }

    /// Append `applied` to the durable log behind any earlier failed appends.
    async fn persist(&mut self, applied: &AppliedOperation) {
        while let Some(pending) = self.unpersisted.front().cloned() {
            if blocking(&self.store, move |store| store.append(&pending))
                .await
                .is_err()
            {
                break;
            }
            self.unpersisted.pop_front();
        }
        if self.unpersisted.is_empty() {
            let record = applied.clone();
            match blocking(&self.store, move |store| store.append(&record)).await {
                Ok(()) => return,
                Err(e) => log::warn!(
                    "Append of v{} for {} failed, keeping it in memory: {e}",
                    applied.version,
                    self.id()
                ),
            }
        }
        self.unpersisted.push_back(applied.clone());
        self.schedule.on_failure();
    }

    /// Checkpoint the document. A checkpoint covers every applied version,
    /// so it also settles anything left unpersisted.
    async fn flush(&mut self) -> Result<u64, CollabError> {
        let before = self.document.checkpoint_version();
        let written = if self.document.ops_since_checkpoint() == 0 {
            Ok(before)
        } else {
            let checkpoint = self.document.snapshot();
            blocking(&self.store, move |store| {
                store.write_checkpoint(&checkpoint).map(|()| checkpoint)
            })
            .await
            .map(|checkpoint| {
                self.document.mark_checkpointed(&checkpoint);
                checkpoint.version
            })
        };
        match written {
            Ok(version) => {
                if !self.unpersisted.is_empty() {
                    log::info!(
                        "Checkpoint of {} settled {} unpersisted operations",
                        self.id(),
                        self.unpersisted.len()
                    );
                    self.unpersisted.clear();
                }
                self.schedule.on_success();
                if version > before {
                    self.events.emit(EngineEvent::CheckpointWritten {
                        document_id: self.id(),
                        version,
                    });
                }
                Ok(version)
            }
            Err(e) => {
                self.schedule.on_failure();
                log::warn!(
                    "Checkpoint of {} failed (attempt {}, retry in {:?}): {e}",
                    self.id(),
                    self.schedule.failures(),
                    self.schedule.backoff()
                );
                Err(e.into())
            }
        }
    }

    /// Rebuild the document from the store after an internal inconsistency
    /// and tell every participant to resubscribe.
    async fn reload(&mut self, cause: &CollabError) {
        log::error!("Reloading document {}: {cause}", self.id());
        self.reload_pending = true;
        let _ = self.try_reload().await;
    }

    /// Carry out a pending reload once every acked operation is durable.
    /// Until then the in-memory document keeps serving, degraded, and
    /// housekeeping retries.
    async fn try_reload(&mut self) -> Result<u64, CollabError> {
        if !self.unpersisted.is_empty() {
            if let Err(e) = self.flush().await {
                log::warn!(
                    "Deferring reload of {}: {} acked operations not durable yet",
                    self.id(),
                    self.unpersisted.len()
                );
                self.refresh_degraded().await;
                return Err(e);
            }
        }
        self.reload_pending = false;
        self.set_state(SequencerState::Loading);
        self.broadcaster
            .resynchronize(self.id(), ResyncReason::Reloaded)
            .await;

        match load(&self.store, self.id(), self.config.transform_window).await {
            Ok(document) => {
                self.events.emit(EngineEvent::DocumentLoaded {
                    document_id: document.id(),
                    version: document.version(),
                });
                let version = document.version();
                self.document = document;
                self.schedule = FlushSchedule::new(self.config.checkpoint.clone());
                self.refresh_degraded().await;
                self.set_state(SequencerState::Active);
                Ok(version)
            }
            Err(e) => {
                log::error!("Reload of {} failed, unloading: {e}", self.id());
                self.stopping = true;
                Err(e)
            }
        }
    }

    async fn housekeeping(&mut self) {
        let now = Instant::now();
        if self.schedule.is_due_at(now) {
            let _ = self.flush().await;
        }
        if self.reload_pending && self.unpersisted.is_empty() {
            let _ = self.try_reload().await;
            if self.stopping {
                return;
            }
        }
        self.refresh_degraded().await;

        if self.broadcaster.participant_count(self.id()).await > 0 {
            self.wake();
            return;
        }
        let idle_since = *self.idle_since.get_or_insert(now);
        self.set_state(SequencerState::Hibernating);

        if now.duration_since(idle_since) >= self.config.hibernate_after
            && self.unpersisted.is_empty()
            && !self.reload_pending
        {
            self.evict().await;
        }
    }

    async fn evict(&mut self) {
        match self.flush().await {
            Ok(version) => {
                log::info!("Evicting idle document {} at v{version}", self.id());
                self.events.emit(EngineEvent::DocumentEvicted {
                    document_id: self.id(),
                    version: self.document.version(),
                });
                self.stopping = true;
            }
            Err(e) => {
                log::warn!("Keeping {} loaded, final flush failed: {e}", self.id());
            }
        }
    }

    async fn refresh_degraded(&mut self) {
        let degraded =
            !self.unpersisted.is_empty() || self.schedule.is_degraded_at(Instant::now());
        if degraded == self.degraded {
            return;
        }
        self.degraded = degraded;
        if degraded {
            log::warn!("Document {} is degraded: store writes failing", self.id());
        } else {
            log::info!("Document {} recovered", self.id());
        }
        self.broadcaster.set_degraded(self.id(), degraded).await;
        self.events.emit(EngineEvent::DocumentDegraded {
            document_id: self.id(),
            degraded,
        });
    }

    fn wake(&mut self) {
        self.idle_since = None;
        self.set_state(SequencerState::Active);
    }

    fn set_state(&self, state: SequencerState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            document_id: self.id(),
            version: self.document.version(),
            content: self.document.state().to_string(),
            checkpoint_version: self.document.checkpoint_version(),
            unpersisted: self.unpersisted.len(),
            degraded: self.degraded,
            state: *self.state.borrow(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckpointPolicy;
    use crate::connection::AcceptedConnection;
    use crate::storage::MemoryStore;
    use tandem_ot::Operation;
    use uuid::Uuid;

    struct Fixture {
        backend: Arc<MemoryStore>,
        registry: DocumentRegistry,
        events: EventBus,
    }

    fn config() -> SequencerConfig {
        SequencerConfig {
            queue_depth: 16,
            submit_timeout: Duration::from_millis(100),
            reply_timeout: Duration::from_secs(1),
            hibernate_after: Duration::from_millis(100),
            transform_window: 32,
            checkpoint: CheckpointPolicy {
                max_ops: 1000,
                max_interval: Duration::from_secs(60),
                retry_base: Duration::from_millis(10),
                retry_max: Duration::from_millis(40),
                degraded_after: Duration::from_millis(30),
            },
            codec_limits: Default::default(),
        }
    }

    fn fixture(config: SequencerConfig) -> Fixture {
        let backend = Arc::new(MemoryStore::new());
        let events = EventBus::default();
        let registry = DocumentRegistry::new(
            CheckpointStore::new(backend.clone()),
            Arc::new(SessionBroadcaster::new(8)),
            events.clone(),
            config,
        );
        Fixture {
            backend,
            registry,
            events,
        }
    }

    fn insert(doc_len: usize, pos: usize, text: &str, base: u64) -> Submission {
        Submission {
            operation: tandem_ot::encode(&Operation::insert_at(doc_len, pos, text).unwrap())
                .unwrap(),
            base_version: base,
            author_id: Uuid::new_v4(),
            client_op_id: None,
            origin: None,
        }
    }

    fn drain(conn: &mut AcceptedConnection) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = conn.outbound.try_recv() {
            out.push(ServerMessage::decode(&frame).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_concurrent_inserts_converge() {
        let f = fixture(config());
        let doc = Uuid::new_v4();
        assert_eq!(f.registry.submit(doc, insert(0, 0, "Hello", 0)).await.unwrap(), 1);
        assert_eq!(f.registry.submit(doc, insert(0, 0, "World", 0)).await.unwrap(), 2);

        let snapshot = f.registry.snapshot(doc).await.unwrap();
        assert_eq!(snapshot.content, "HelloWorld");
        assert_eq!(snapshot.version, 2);
        assert_eq!(f.backend.log_len(doc), 2);
    }

    #[tokio::test]
    async fn test_rejection_leaves_version_unchanged() {
        let f = fixture(config());
        let doc = Uuid::new_v4();
        for i in 0..3 {
            f.registry.submit(doc, insert(i, i, "x", i as u64)).await.unwrap();
        }
        let err = f.registry.submit(doc, insert(3, 0, "y", 5)).await.unwrap_err();
        assert_eq!(err, CollabError::InvalidBaseVersion { base: 5, current: 3 });

        let mut garbage = insert(3, 0, "y", 3);
        garbage.operation = vec![0xff, 0xff, 0xff];
        assert!(matches!(
            f.registry.submit(doc, garbage).await,
            Err(CollabError::MalformedOperation { current: 3, .. })
        ));
        assert_eq!(f.registry.snapshot(doc).await.unwrap().version, 3);
    }

    #[tokio::test]
    async fn test_subscribe_bootstraps_and_acks_author() {
        let f = fixture(config());
        let doc = Uuid::new_v4();
        f.registry.submit(doc, insert(0, 0, "abc", 0)).await.unwrap();

        let mut conn = ConnectionHandle::open(Uuid::new_v4(), 32);
        f.registry
            .subscribe(doc, conn.handle.clone(), None)
            .await
            .unwrap();
        match &drain(&mut conn)[0] {
            ServerMessage::Subscribed {
                current_version,
                checkpoint,
                replay_operations,
                ..
            } => {
                assert_eq!(*current_version, 1);
                assert_eq!(checkpoint.as_ref().map(|c| c.version), Some(0));
                assert_eq!(replay_operations.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut own = insert(3, 3, "d", 1);
        own.client_op_id = Some(7);
        own.origin = Some(conn.handle.id());
        f.registry.submit(doc, own).await.unwrap();
        assert_eq!(
            drain(&mut conn),
            vec![ServerMessage::Ack {
                document_id: doc,
                version: 2,
                client_op_id: 7
            }]
        );
    }

    #[tokio::test]
    async fn test_flush_emits_checkpoint_event() {
        let f = fixture(config());
        let mut events = f.events.subscribe();
        let doc = Uuid::new_v4();
        f.registry.submit(doc, insert(0, 0, "abc", 0)).await.unwrap();
        assert_eq!(f.registry.flush(doc).await.unwrap(), 1);
        assert_eq!(f.backend.log_len(doc), 0);

        let mut saw_checkpoint = false;
        while let Ok(event) = events.try_recv() {
            if event == (EngineEvent::CheckpointWritten { document_id: doc, version: 1 }) {
                saw_checkpoint = true;
            }
        }
        assert!(saw_checkpoint);
    }

    #[tokio::test]
    async fn test_flush_without_changes_writes_nothing() {
        let f = fixture(config());
        let doc = Uuid::new_v4();
        assert_eq!(f.registry.flush(doc).await.unwrap(), 0);
        assert_eq!(f.backend.flush_count(), 0);
    }

    #[tokio::test]
    async fn test_max_ops_triggers_checkpoint() {
        let mut cfg = config();
        cfg.checkpoint.max_ops = 2;
        let f = fixture(cfg);
        let doc = Uuid::new_v4();
        f.registry.submit(doc, insert(0, 0, "a", 0)).await.unwrap();
        f.registry.submit(doc, insert(1, 1, "b", 1)).await.unwrap();
        assert_eq!(f.backend.flush_count(), 1);
        assert_eq!(f.registry.snapshot(doc).await.unwrap().checkpoint_version, 2);
    }

    #[tokio::test]
    async fn test_store_outage_degrades_then_recovers() {
        let f = fixture(config());
        let doc = Uuid::new_v4();
        f.registry.submit(doc, insert(0, 0, "a", 0)).await.unwrap();

        f.backend.set_available(false);
        f.registry.submit(doc, insert(1, 1, "b", 1)).await.unwrap();
        let snapshot = f.registry.snapshot(doc).await.unwrap();
        assert_eq!(snapshot.unpersisted, 1);
        assert!(snapshot.degraded);

        f.backend.set_available(true);
        assert_eq!(f.registry.flush(doc).await.unwrap(), 2);
        let snapshot = f.registry.snapshot(doc).await.unwrap();
        assert_eq!(snapshot.unpersisted, 0);
        assert!(!snapshot.degraded);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_load() {
        let f = fixture(config());
        f.backend.set_available(false);
        let doc = Uuid::new_v4();
        assert!(matches!(
            f.registry.submit(doc, insert(0, 0, "a", 0)).await,
            Err(CollabError::DocumentUnavailable { .. })
        ));
        assert_eq!(f.registry.state(doc).await, SequencerState::Unloaded);
    }

    #[tokio::test]
    async fn test_idle_document_is_evicted_and_reloaded() {
        let f = fixture(config());
        let mut events = f.events.subscribe();
        let doc = Uuid::new_v4();
        f.registry.submit(doc, insert(0, 0, "persist me", 0)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(EngineEvent::DocumentEvicted { version, .. }) = events.recv().await {
                    break version;
                }
            }
        })
        .await
        .unwrap();

        let snapshot = f.registry.snapshot(doc).await.unwrap();
        assert_eq!(snapshot.content, "persist me");
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.checkpoint_version, 1);
    }

    #[tokio::test]
    async fn test_cursor_moves_to_current_version() {
        let f = fixture(config());
        let doc = Uuid::new_v4();
        let conn = ConnectionHandle::open(Uuid::new_v4(), 32);
        f.registry.submit(doc, insert(0, 0, "world", 0)).await.unwrap();
        f.registry
            .subscribe(doc, conn.handle.clone(), Some(1))
            .await
            .unwrap();
        f.registry.submit(doc, insert(5, 0, "hello ", 1)).await.unwrap();

        // Caret placed before "world" at v1.
        f.registry
            .update_cursor(doc, conn.handle.id(), 1, Selection::caret(0))
            .await
            .unwrap();
        let participants = f.registry.broadcaster.participants(doc).await;
        assert_eq!(participants[0].selection, Some(Selection::caret(6)));
    }

    #[tokio::test]
    async fn test_duplicate_submission_acked_not_reapplied() {
        let f = fixture(config());
        let doc = Uuid::new_v4();
        let mut conn = ConnectionHandle::open(Uuid::new_v4(), 32);
        f.registry
            .subscribe(doc, conn.handle.clone(), None)
            .await
            .unwrap();
        drain(&mut conn);

        let mut own = insert(0, 0, "abc", 0);
        own.author_id = conn.handle.user_id();
        own.client_op_id = Some(7);
        own.origin = Some(conn.handle.id());
        assert_eq!(f.registry.submit(doc, own.clone()).await.unwrap(), 1);
        assert_eq!(f.registry.submit(doc, own.clone()).await.unwrap(), 1);
        let ack = ServerMessage::Ack {
            document_id: doc,
            version: 1,
            client_op_id: 7,
        };
        assert_eq!(drain(&mut conn), vec![ack.clone(), ack]);

        // Still recognised once the log entry is folded into a checkpoint
        // and the document is rebuilt from the store.
        f.registry.flush(doc).await.unwrap();
        assert_eq!(f.backend.log_len(doc), 0);
        assert_eq!(f.registry.reload(doc).await.unwrap(), 1);
        assert_eq!(f.registry.submit(doc, own).await.unwrap(), 1);

        let snapshot = f.registry.snapshot(doc).await.unwrap();
        assert_eq!(snapshot.content, "abc");
        assert_eq!(snapshot.version, 1);
        assert_eq!(f.backend.append_count(), 1);
    }

    #[tokio::test]
    async fn test_stalled_store_reports_busy_and_retry_is_idempotent() {
        let mut cfg = config();
        cfg.queue_depth = 1;
        cfg.submit_timeout = Duration::from_millis(50);
        cfg.reply_timeout = Duration::from_millis(100);
        let f = fixture(cfg);
        let doc = Uuid::new_v4();
        f.registry.snapshot(doc).await.unwrap();
        f.backend.set_latency(Duration::from_millis(300));

        let author = Uuid::new_v4();
        let tagged = |text: &str, id: u64| {
            let mut submission = insert(0, 0, text, 0);
            submission.author_id = author;
            submission.client_op_id = Some(id);
            submission
        };
        let (first, second, third) = tokio::join!(
            f.registry.submit(doc, tagged("a", 1)),
            f.registry.submit(doc, tagged("b", 2)),
            f.registry.submit(doc, tagged("c", 3)),
        );
        // One is being appended, one waits in the queue, one finds no room.
        for result in [first, second, third] {
            assert_eq!(result, Err(CollabError::SequencerBusy(doc)));
        }

        f.backend.set_latency(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(f.registry.submit(doc, tagged("a", 1)).await.unwrap(), 1);
        assert_eq!(f.registry.submit(doc, tagged("b", 2)).await.unwrap(), 2);

        let snapshot = f.registry.snapshot(doc).await.unwrap();
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.content, "ab");
        assert_eq!(f.backend.append_count(), 2);
    }

    #[tokio::test]
    async fn test_reload_waits_for_unpersisted_operations() {
        let f = fixture(config());
        let doc = Uuid::new_v4();
        let conn = ConnectionHandle::open(Uuid::new_v4(), 32);
        f.registry
            .subscribe(doc, conn.handle.clone(), None)
            .await
            .unwrap();
        f.registry.submit(doc, insert(0, 0, "a", 0)).await.unwrap();

        f.backend.set_available(false);
        f.registry.submit(doc, insert(1, 1, "b", 1)).await.unwrap();
        assert!(matches!(
            f.registry.reload(doc).await,
            Err(CollabError::Store(_))
        ));
        let snapshot = f.registry.snapshot(doc).await.unwrap();
        assert_eq!(snapshot.content, "ab");
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.unpersisted, 1);
        assert!(f.registry.broadcaster.is_participant(doc, conn.handle.id()).await);

        f.backend.set_available(true);
        assert_eq!(f.registry.reload(doc).await.unwrap(), 2);
        let snapshot = f.registry.snapshot(doc).await.unwrap();
        assert_eq!(snapshot.content, "ab");
        assert_eq!(snapshot.unpersisted, 0);
        assert!(!f.registry.broadcaster.is_participant(doc, conn.handle.id()).await);
    }

    #[tokio::test]
    async fn test_reload_reports_loading_state() {
        let f = fixture(config());
        let doc = Uuid::new_v4();
        f.registry.submit(doc, insert(0, 0, "abc", 0)).await.unwrap();
        f.backend.set_latency(Duration::from_millis(200));

        let (reloaded, during) = tokio::join!(f.registry.reload(doc), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            f.registry.state(doc).await
        });
        assert_eq!(reloaded.unwrap(), 1);
        assert_eq!(during, SequencerState::Loading);
        assert_ne!(f.registry.state(doc).await, SequencerState::Loading);
    }

    #[tokio::test]
    async fn test_shutdown_flushes() {
        let f = fixture(config());
        let doc = Uuid::new_v4();
        f.registry.submit(doc, insert(0, 0, "abc", 0)).await.unwrap();
        f.registry.shutdown().await;
        assert_eq!(f.backend.flush_count(), 1);
        assert!(f.registry.loaded_documents().await.is_empty());
    }
}
