//! Command Queue (C6) — spec section 4.2.
//!
//! A bounded multi-producer, single-consumer queue with a completion channel
//! per item, grounded in `librqbit::watch::watch_adder`'s
//! `UnboundedReceiver`-driven consumer loop, generalized to a bounded channel
//! (back-pressure matters here — a stuck engine must not let callers queue
//! unbounded work) plus a per-item `oneshot` reply, the shape
//! `rqbit::main::start_http_api` uses when it has one `Api` handle shared
//! across many concurrent HTTP requests.

use tokio::sync::{mpsc, oneshot};

use crate::config::SettingsPatch;
use crate::error::{DaemonError, Result};
use crate::snapshot::{InfoHash, TorrentId};

const QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum TorrentSource {
    MagnetOrUrl(String),
    TorrentFileBytes(Vec<u8>),
}

#[derive(Debug, Clone, Default)]
pub struct TorrentFieldsPatch {
    pub labels: Option<Vec<String>>,
    pub sequential_download: Option<bool>,
    pub download_rate_limit_kbps: Option<Option<u32>>,
    pub upload_rate_limit_kbps: Option<Option<u32>>,
    pub queue_position: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct AddTorrentRequest {
    pub source: TorrentSource,
    pub paused: bool,
    pub save_path: Option<String>,
    pub labels: Vec<String>,
    pub only_files: Option<Vec<usize>>,
    pub sequential_download: bool,
}

/// One unit of mutating work accepted from the RPC Dispatcher (C7). Read-only
/// operations (torrent-get, session-get, stats, history-get) never enter this
/// queue — they read straight off the latest published `SharedSnapshot`.
#[derive(Debug, Clone)]
pub enum PendingCommand {
    AddTorrent(AddTorrentRequest),
    RemoveTorrent {
        ids: Vec<TorrentId>,
        delete_local_data: bool,
    },
    SetPaused {
        ids: Vec<TorrentId>,
        paused: bool,
    },
    Verify {
        ids: Vec<TorrentId>,
    },
    Reannounce {
        ids: Vec<TorrentId>,
    },
    SetTorrentFields {
        id: TorrentId,
        patch: TorrentFieldsPatch,
    },
    SetSessionSettings {
        patch: SettingsPatch,
    },
    RenamePath {
        id: TorrentId,
        old_path: String,
        new_name: String,
    },
    ClearHistory {
        older_than: Option<i64>,
    },
}

#[derive(Debug, Clone)]
pub enum CommandOutcome {
    TorrentAdded {
        id: TorrentId,
        info_hash: InfoHash,
        already_managed: bool,
    },
    Ack,
}

pub struct Envelope {
    pub command: PendingCommand,
    reply: oneshot::Sender<Result<CommandOutcome>>,
}

impl Envelope {
    pub fn respond(self, result: Result<CommandOutcome>) {
        // The caller may have dropped its receiver (e.g. HTTP client
        // disconnected); a failed send here is not this queue's problem.
        let _ = self.reply.send(result);
    }
}

#[derive(Clone)]
pub struct CommandQueue {
    tx: mpsc::Sender<Envelope>,
}

pub struct CommandConsumer {
    rx: mpsc::Receiver<Envelope>,
}

impl CommandQueue {
    pub fn new() -> (Self, CommandConsumer) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (Self { tx }, CommandConsumer { rx })
    }

    /// Enqueues `command` and awaits its completion. Never blocks on a full
    /// queue: a full queue fails fast with `engine-busy` (spec section 4.2)
    /// rather than letting the caller pile up behind a stalled engine.
    pub async fn submit(&self, command: PendingCommand) -> Result<CommandOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = Envelope {
            command,
            reply: reply_tx,
        };
        self.tx.try_send(envelope).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DaemonError::engine_busy(),
            mpsc::error::TrySendError::Closed(_) => DaemonError::engine_unavailable(),
        })?;

        reply_rx
            .await
            .unwrap_or_else(|_| Err(DaemonError::cancelled()))
    }
}

impl CommandConsumer {
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Shutdown path (spec section 4.2): stop accepting new submissions and
    /// reply `cancelled` to everything still sitting in the buffer.
    pub fn drain_cancel(&mut self) {
        self.rx.close();
        while let Ok(envelope) = self.rx.try_recv() {
            envelope.respond(Err(DaemonError::cancelled()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_queue_reports_engine_busy() {
        let (queue, mut consumer) = CommandQueue::new();
        // Fill the channel's buffer without a consumer draining it.
        let mut handles = Vec::new();
        for _ in 0..QUEUE_CAPACITY {
            let queue = queue.clone();
            handles.push(tokio::spawn(
                async move { queue.submit(PendingCommand::ClearHistory { older_than: None }).await },
            ));
        }
        // Give the spawned submits a chance to land in the buffer.
        tokio::task::yield_now().await;
        let result = queue.submit(PendingCommand::ClearHistory { older_than: None }).await;
        assert!(matches!(
            result,
            Err(e) if e.kind == crate::error::Kind::EngineBusy
        ));

        consumer.drain_cancel();
        for handle in handles {
            let _ = handle.await;
        }
    }

    #[tokio::test]
    async fn shutdown_drain_cancels_pending() {
        let (queue, mut consumer) = CommandQueue::new();
        let handle = tokio::spawn(async move { queue.submit(PendingCommand::ClearHistory { older_than: None }).await });
        tokio::task::yield_now().await;
        consumer.drain_cancel();
        let result = handle.await.unwrap();
        assert!(matches!(
            result,
            Err(e) if e.kind == crate::error::Kind::Cancelled
        ));
    }
}
