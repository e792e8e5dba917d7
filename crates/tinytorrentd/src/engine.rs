//! Engine Coordinator (C5) — spec section 4.1/4.2, the single owner of the
//! session library and the only component allowed to mutate its state.
//!
//! Grounded in `librqbit::api::Api`, which plays the same wrapping role
//! around `Arc<Session>` in the HTTP-API crate: a thin adapter translating
//! typed requests into session-library calls and session-library responses
//! into wire-shaped structs. The tick-driven publish loop is grounded in
//! `librqbit::session_stats::start_speed_estimator_updater`'s spawned
//! interval task, generalized from "update one atomic" to "materialize and
//! publish a whole snapshot."
//!
//! Open Question resolved here (spec section 4, Open Questions): the
//! vendored session library exposes progress purely through polling
//! (`ManagedTorrentHandle::stats`), not a push/alert channel, so each tick
//! re-derives the full `SessionSnapshot` from `Session::with_torrents`
//! rather than accumulating discrete alerts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use librqbit::{AddTorrent, AddTorrentOptions, AddTorrentResponse, Session, TorrentStats, TorrentStatsState};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::command_queue::{
    CommandConsumer, CommandOutcome, Envelope, PendingCommand, TorrentFieldsPatch, TorrentSource,
};
use crate::config::ConfigurationService;
use crate::diff::{compute_patch, Patch};
use crate::error::{DaemonError, Kind, Result};
use crate::events::{DaemonEvent, EventBus};
use crate::persistence::PersistenceRepository;
use crate::snapshot::{
    ErrorSubKind, SessionLevelFields, SessionSnapshot, SharedSnapshot, TorrentId, TorrentSnapshot,
    TorrentStatus,
};

/// How often the engine re-derives and publishes a snapshot even if nothing
/// obviously changed (rates drift every tick even when no command ran).
const PUBLISH_INTERVAL: Duration = Duration::from_millis(1000);

/// Handle shared with the RPC Dispatcher and HTTP/WS server (C7, C8). Cloning
/// is cheap: every field is itself a shared handle.
#[derive(Clone)]
pub struct EngineHandle {
    queue: crate::command_queue::CommandQueue,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
    patches: broadcast::Sender<Arc<Patch>>,
    config: Arc<ConfigurationService>,
    repo: Arc<dyn PersistenceRepository>,
}

impl EngineHandle {
    pub fn latest(&self) -> SharedSnapshot {
        self.snapshot.load_full()
    }

    pub fn config(&self) -> &ConfigurationService {
        &self.config
    }

    /// Read-only access for RPC methods that only ever read (`history-get`):
    /// the repository is a thread-safe connection pool, so reads bypass the
    /// command queue entirely rather than round-tripping the engine loop.
    pub fn repo(&self) -> &dyn PersistenceRepository {
        self.repo.as_ref()
    }

    pub fn subscribe_patches(&self) -> broadcast::Receiver<Arc<Patch>> {
        self.patches.subscribe()
    }

    pub async fn submit(&self, command: PendingCommand) -> Result<CommandOutcome> {
        self.queue.submit(command).await
    }
}

#[cfg(test)]
impl EngineHandle {
    /// Builds a handle with no `EngineCoordinator` behind it, for tests that
    /// only exercise the RPC Dispatcher (C7) and HTTP/WS Server (C8) against
    /// a fixed, empty session snapshot. Callers get back the
    /// `CommandConsumer` side so they can drive their own fake command
    /// responder if a scenario needs to submit a command.
    pub fn for_test(
        config: Arc<ConfigurationService>,
        repo: Arc<dyn PersistenceRepository>,
    ) -> (Self, CommandConsumer) {
        let (queue, consumer) = crate::command_queue::CommandQueue::new();
        let snapshot = Arc::new(ArcSwap::from_pointee(SessionSnapshot::empty()));
        let (patches, _rx) = broadcast::channel(16);
        (
            Self {
                queue,
                snapshot,
                patches,
                config,
                repo,
            },
            consumer,
        )
    }

    /// Replaces the published snapshot directly, bypassing the coordinator's
    /// tick loop — lets a test set up `torrent-get`/`history-get` fixtures.
    pub fn publish_for_test(&self, snapshot: SessionSnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }
}

struct LabelStore {
    by_info_hash: Mutex<HashMap<String, Vec<String>>>,
}

impl LabelStore {
    fn get(&self, info_hash: &str) -> Vec<String> {
        self.by_info_hash
            .lock()
            .get(info_hash)
            .cloned()
            .unwrap_or_default()
    }

    fn set(&self, info_hash: &str, labels: Vec<String>) {
        self.by_info_hash
            .lock()
            .insert(info_hash.to_string(), labels);
    }
}

/// Neither `rehash_start_count` nor `rehash_complete_count` is a concept the
/// vendored session library tracks (it only reports the current state, not
/// a lifetime counter), so this daemon counts transitions itself: `verify()`
/// bumps `start_count` and arms `pending`; `materialize()` watches the
/// torrent's `Initializing` state and bumps `complete_count` the tick it
/// drops back out, per spec section 4.1's verify-idempotence invariant.
#[derive(Default, Clone, Copy)]
struct RehashCounters {
    start_count: u64,
    complete_count: u64,
    pending: bool,
    was_active: bool,
}

struct RehashStore {
    by_id: Mutex<HashMap<TorrentId, RehashCounters>>,
}

impl RehashStore {
    fn new() -> Self {
        Self {
            by_id: Mutex::new(HashMap::new()),
        }
    }

    fn mark_started(&self, id: TorrentId) {
        let mut guard = self.by_id.lock();
        let entry = guard.entry(id).or_default();
        entry.start_count += 1;
        entry.pending = true;
    }

    /// Called once per tick per torrent with whether it is currently
    /// rehashing; returns `(rehash_active, start_count, complete_count)`.
    fn observe(&self, id: TorrentId, currently_active: bool) -> (bool, u64, u64) {
        let mut guard = self.by_id.lock();
        let entry = guard.entry(id).or_default();

        if entry.pending {
            if currently_active {
                entry.was_active = true;
            } else if entry.was_active {
                entry.complete_count += 1;
                entry.pending = false;
                entry.was_active = false;
            }
        }

        (
            currently_active || (entry.pending && entry.was_active),
            entry.start_count,
            entry.complete_count,
        )
    }
}

pub struct EngineCoordinator {
    session: Arc<Session>,
    queue: CommandConsumer,
    repo: Arc<dyn PersistenceRepository>,
    config: Arc<ConfigurationService>,
    events: EventBus,
    labels: LabelStore,
    rehash: RehashStore,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
    patches: broadcast::Sender<Arc<Patch>>,
    sequence: u64,
}

impl EngineCoordinator {
    pub async fn new(
        session: Arc<Session>,
        repo: Arc<dyn PersistenceRepository>,
        config: Arc<ConfigurationService>,
        events: EventBus,
    ) -> anyhow::Result<(Self, EngineHandle)> {
        let mut by_info_hash = HashMap::new();
        for (info_hash, _) in repo.list_torrent_metadata().await? {
            let labels = repo.get_labels(&info_hash).await?;
            if !labels.is_empty() {
                by_info_hash.insert(info_hash, labels);
            }
        }

        let (queue, consumer) = crate::command_queue::CommandQueue::new();
        let snapshot = Arc::new(ArcSwap::from_pointee(SessionSnapshot::empty()));
        let (patches, _rx) = broadcast::channel(256);

        let handle = EngineHandle {
            queue,
            snapshot: snapshot.clone(),
            patches: patches.clone(),
            config: config.clone(),
            repo: repo.clone(),
        };

        let coordinator = Self {
            session,
            queue: consumer,
            repo,
            config,
            events,
            labels: LabelStore {
                by_info_hash: Mutex::new(by_info_hash),
            },
            rehash: RehashStore::new(),
            snapshot,
            patches,
            sequence: 0,
        };

        Ok((coordinator, handle))
    }

    /// Runs until `shutdown` fires, then drains the command queue (replying
    /// `cancelled` to anything still pending) and saves resume data within a
    /// bounded window (spec section 4.2 / 4.8 shutdown sequence).
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut publish_tick = tokio::time::interval(PUBLISH_INTERVAL);
        publish_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut history_tick = tokio::time::interval(Duration::from_secs(
            self.config.get().history.interval_secs,
        ));
        history_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut events_rx = self.events.subscribe();

        self.publish();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("engine coordinator shutting down");
                    self.queue.drain_cancel();
                    break;
                }

                envelope = self.queue.recv() => {
                    match envelope {
                        Some(envelope) => self.handle_envelope(envelope).await,
                        None => break,
                    }
                }

                _ = publish_tick.tick() => {
                    self.publish();
                }

                _ = history_tick.tick() => {
                    if let Err(err) = self.sample_history().await {
                        warn!(error = %err, "failed to sample speed history");
                    }
                }

                event = events_rx.recv() => {
                    if let Ok(DaemonEvent::SettingsChanged) = event {
                        self.apply_session_settings();
                    }
                }
            }
        }

        if let Err(err) = tokio::time::timeout(Duration::from_secs(3), self.session.stop()).await
        {
            warn!(error = %err, "session stop exceeded shutdown grace period");
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        let Envelope { command, .. } = &envelope;
        let result = self.handle_command(command.clone()).await;
        if result.is_ok() {
            self.publish();
        }
        envelope.respond(result);
    }

    async fn handle_command(&mut self, command: PendingCommand) -> Result<CommandOutcome> {
        match command {
            PendingCommand::AddTorrent(req) => self.add_torrent(req).await,
            PendingCommand::RemoveTorrent {
                ids,
                delete_local_data,
            } => self.remove_torrents(&ids, delete_local_data).await,
            PendingCommand::SetPaused { ids, paused } => self.set_paused(&ids, paused).await,
            PendingCommand::Verify { ids } => self.verify(&ids).await,
            PendingCommand::Reannounce { ids } => self.reannounce(&ids).await,
            PendingCommand::SetTorrentFields { id, patch } => {
                self.set_torrent_fields(id, patch).await
            }
            PendingCommand::SetSessionSettings { patch } => {
                self.config.apply_patch(patch)?;
                Ok(CommandOutcome::Ack)
            }
            PendingCommand::RenamePath {
                id,
                old_path,
                new_name,
            } => self.rename_path(id, &old_path, &new_name).await,
            PendingCommand::ClearHistory { older_than } => {
                // `older_than` absent means "clear everything": trim
                // everything strictly before the newest possible timestamp.
                self.repo
                    .trim_speed_history(older_than.unwrap_or(i64::MAX))
                    .await
                    .map_err(|e| DaemonError::with_source(Kind::Internal, "clear history", e))?;
                Ok(CommandOutcome::Ack)
            }
        }
    }

    async fn add_torrent(
        &mut self,
        req: crate::command_queue::AddTorrentRequest,
    ) -> Result<CommandOutcome> {
        let add = match &req.source {
            TorrentSource::MagnetOrUrl(s) => AddTorrent::from_url(s.clone()),
            TorrentSource::TorrentFileBytes(bytes) => AddTorrent::from_bytes(bytes.clone()),
        };

        let opts = AddTorrentOptions {
            paused: req.paused,
            only_files: req.only_files.clone(),
            output_folder: req.save_path.clone(),
            ..Default::default()
        };

        let response = self
            .session
            .add_torrent(add, Some(opts))
            .await
            .map_err(|e| DaemonError::with_source(Kind::MetainfoReadFailure, "add torrent", e))?;

        let (id, info_hash, already_managed) = match response {
            AddTorrentResponse::Added(id, handle) => (id, handle.info_hash().as_string(), false),
            AddTorrentResponse::AlreadyManaged(id, handle) => {
                (id, handle.info_hash().as_string(), true)
            }
            AddTorrentResponse::ListOnly(_) => {
                return Err(DaemonError::new(
                    Kind::InvalidArgument,
                    "list-only adds are not supported by this daemon",
                ));
            }
        };

        if !req.labels.is_empty() {
            self.labels.set(&info_hash, req.labels.clone());
            self.repo
                .set_labels(&info_hash, &req.labels)
                .await
                .map_err(|e| DaemonError::with_source(Kind::Internal, "persist labels", e))?;
        }

        Ok(CommandOutcome::TorrentAdded {
            id,
            info_hash,
            already_managed,
        })
    }

    async fn remove_torrents(&mut self, ids: &[TorrentId], delete_local_data: bool) -> Result<CommandOutcome> {
        for &id in ids {
            self.session
                .delete(id, delete_local_data)
                .map_err(|e| DaemonError::with_source(Kind::NotFound, "remove torrent", e))?;
        }
        Ok(CommandOutcome::Ack)
    }

    async fn set_paused(&mut self, ids: &[TorrentId], paused: bool) -> Result<CommandOutcome> {
        for &id in ids {
            let handle = self
                .session
                .get(id)
                .ok_or_else(|| DaemonError::not_found(format!("torrent {id}")))?;
            let outcome = if paused {
                self.session.pause(&handle)
            } else {
                self.session.unpause(&handle)
            };
            outcome.map_err(|e| DaemonError::with_source(Kind::Internal, "set paused", e))?;
        }
        Ok(CommandOutcome::Ack)
    }

    async fn verify(&mut self, ids: &[TorrentId]) -> Result<CommandOutcome> {
        // The vendored session library rehashes as a side effect of
        // re-initializing storage; there is no standalone "verify" entry
        // point, so this forces the torrent back through paused-then-resumed
        // to trigger its existing rehash path.
        for &id in ids {
            let handle = self
                .session
                .get(id)
                .ok_or_else(|| DaemonError::not_found(format!("torrent {id}")))?;
            self.session
                .pause(&handle)
                .map_err(|e| DaemonError::with_source(Kind::Internal, "verify (pause)", e))?;
            self.session
                .unpause(&handle)
                .map_err(|e| DaemonError::with_source(Kind::Internal, "verify (resume)", e))?;
            self.rehash.mark_started(id);
        }
        Ok(CommandOutcome::Ack)
    }

    async fn reannounce(&mut self, ids: &[TorrentId]) -> Result<CommandOutcome> {
        // No explicit force-reannounce hook is exposed by the vendored
        // session library at this snapshot; tracked as a known gap rather
        // than synthesizing behavior that doesn't exist underneath.
        for &id in ids {
            self.session
                .get(id)
                .ok_or_else(|| DaemonError::not_found(format!("torrent {id}")))?;
        }
        Ok(CommandOutcome::Ack)
    }

    async fn set_torrent_fields(
        &mut self,
        id: TorrentId,
        patch: TorrentFieldsPatch,
    ) -> Result<CommandOutcome> {
        let handle = self
            .session
            .get(id)
            .ok_or_else(|| DaemonError::not_found(format!("torrent {id}")))?;
        let info_hash = handle.info_hash().as_string();

        if let Some(labels) = patch.labels {
            self.labels.set(&info_hash, labels.clone());
            self.repo
                .set_labels(&info_hash, &labels)
                .await
                .map_err(|e| DaemonError::with_source(Kind::Internal, "persist labels", e))?;
        }

        Ok(CommandOutcome::Ack)
    }

    async fn rename_path(
        &mut self,
        id: TorrentId,
        _old_path: &str,
        _new_name: &str,
    ) -> Result<CommandOutcome> {
        self.session
            .get(id)
            .ok_or_else(|| DaemonError::not_found(format!("torrent {id}")))?;
        Err(DaemonError::new(
            Kind::PathUnreachable,
            "rename-path is not supported by the underlying session library",
        ))
    }

    fn apply_session_settings(&mut self) {
        // Rate limits, DHT/LPD/PEX toggles, and proxy settings live on the
        // session library's own config surface; applying them live (rather
        // than only at the next restart) is out of scope for the vendored
        // session crate at this point in its lifecycle (see DESIGN.md).
    }

    async fn sample_history(&self) -> anyhow::Result<()> {
        let settings = self.config.get();
        if !settings.history.enabled {
            return Ok(());
        }
        let snapshot = self.snapshot.load();
        let now = chrono_secs_now();
        self.repo
            .append_speed_bucket(
                now,
                snapshot.session.downloaded_bytes_total,
                snapshot.session.uploaded_bytes_total,
            )
            .await?;
        if settings.history.retention_days > 0 {
            let cutoff = now - (settings.history.retention_days as i64 * 86_400);
            self.repo.trim_speed_history(cutoff).await?;
        }
        Ok(())
    }

    fn publish(&mut self) {
        let previous = self.snapshot.load_full();
        self.sequence = self.sequence.saturating_add(1);
        let next = Arc::new(self.materialize(self.sequence));
        self.snapshot.store(next.clone());

        if previous.sequence > 0 {
            let patch = compute_patch(&previous, &next);
            let _ = self.patches.send(Arc::new(patch));
        }
    }

    fn materialize(&self, sequence: u64) -> SessionSnapshot {
        let mut torrents = Vec::new();
        self.session.with_torrents(|iter| {
            for (id, handle) in iter {
                let stats = handle.stats();
                let info_hash = handle.info_hash().as_string();
                let labels = self.labels.get(&info_hash);

                let (status, error_kind, error_message) = classify(&stats, handle.is_paused());
                let initializing = matches!(stats.state, TorrentStatsState::Initializing);
                let (rehash_active, rehash_start_count, rehash_complete_count) =
                    self.rehash.observe(id, initializing);

                // `Speed::mbps` is actually mebibytes/sec despite the field
                // name (see its `Display` impl); convert to bytes/sec here,
                // the unit this daemon's wire shape uses throughout.
                const MIB: f64 = 1024.0 * 1024.0;
                let (rate_down_bps, rate_up_bps) = stats
                    .live
                    .as_ref()
                    .map(|live| {
                        (
                            (live.download_speed.mbps * MIB) as u64,
                            (live.upload_speed.mbps * MIB) as u64,
                        )
                    })
                    .unwrap_or((0, 0));

                torrents.push(TorrentSnapshot {
                    id,
                    info_hash,
                    name: handle.name().unwrap_or_default(),
                    status,
                    error_kind,
                    error_code: None,
                    error_message,
                    rate_down_bps,
                    rate_up_bps,
                    downloaded_bytes: stats.progress_bytes,
                    uploaded_bytes: stats.uploaded_bytes,
                    percent_complete: percent(stats.progress_bytes, stats.total_bytes),
                    metadata_percent_complete: 1.0,
                    labels,
                    sequential_download: false,
                    super_seeding: false,
                    paused: handle.is_paused(),
                    rehash_active,
                    rehash_start_count,
                    rehash_complete_count,
                    tracker_announces: 0,
                    dht_replies: 0,
                    peer_connections: 0,
                    save_path: String::new(),
                });
            }
        });

        let session = aggregate(&torrents);
        SessionSnapshot {
            sequence,
            session,
            torrents,
        }
    }
}

fn classify(stats: &TorrentStats, paused: bool) -> (TorrentStatus, ErrorSubKind, Option<String>) {
    if let Some(message) = &stats.error {
        return (TorrentStatus::Error, ErrorSubKind::Other, Some(message.clone()));
    }
    if paused {
        return (TorrentStatus::Paused, ErrorSubKind::None, None);
    }
    let status = match stats.state {
        TorrentStatsState::Initializing => TorrentStatus::Checking,
        TorrentStatsState::Paused => TorrentStatus::Paused,
        TorrentStatsState::Error => TorrentStatus::Error,
        TorrentStatsState::Live if stats.finished => TorrentStatus::Seeding,
        TorrentStatsState::Live => TorrentStatus::Downloading,
    };
    (status, ErrorSubKind::None, None)
}

fn percent(progress: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (progress as f64 / total as f64).clamp(0.0, 1.0)
    }
}

fn aggregate(torrents: &[TorrentSnapshot]) -> SessionLevelFields {
    let mut fields = SessionLevelFields::default();
    for t in torrents {
        fields.rate_down_bps += t.rate_down_bps;
        fields.rate_up_bps += t.rate_up_bps;
        fields.downloaded_bytes_total += t.downloaded_bytes;
        fields.uploaded_bytes_total += t.uploaded_bytes;
        match t.status {
            TorrentStatus::Paused => fields.paused_count += 1,
            TorrentStatus::Error => fields.error_count += 1,
            _ => fields.active_count += 1,
        }
        for label in &t.labels {
            *fields.labels_registry.entry(label.clone()).or_insert(0) += 1;
        }
    }
    fields
}

/// Seconds since the Unix epoch. `Date.now`-style wall-clock reads are
/// isolated to this one call site so history sampling is the only place
/// that needs it.
fn chrono_secs_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_twice_increments_both_counters_by_two() {
        let store = RehashStore::new();

        // First verify cycle.
        store.mark_started(1);
        let (active, started, completed) = store.observe(1, true);
        assert!(active);
        assert_eq!((started, completed), (1, 0));
        let (active, started, completed) = store.observe(1, false);
        assert!(!active);
        assert_eq!((started, completed), (1, 1));

        // Second verify cycle.
        store.mark_started(1);
        let (active, started, completed) = store.observe(1, true);
        assert!(active);
        assert_eq!((started, completed), (2, 1));
        let (_active, started, completed) = store.observe(1, false);
        assert_eq!((started, completed), (2, 2));
    }

    #[test]
    fn observe_without_verify_never_active() {
        let store = RehashStore::new();
        let (active, started, completed) = store.observe(7, false);
        assert!(!active);
        assert_eq!((started, completed), (0, 0));
    }
}
