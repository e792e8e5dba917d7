//! State Model & Snapshots (C4) — spec section 3/4.
//!
//! `SessionSnapshot` and `TorrentSnapshot` are immutable value objects,
//! replaced atomically. Grounded in `librqbit::limits::Limit`'s use of
//! `arc_swap::ArcSwapOption` for cheap atomic swap of shared, short-lived
//! state — the same shape this module needs for "readers take a reference,
//! use it, release it" (spec section 5).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

pub type TorrentId = usize;
/// Hex-encoded 40-character BitTorrent info hash.
pub type InfoHash = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TorrentStatus {
    Added,
    Checking,
    Downloading,
    Seeding,
    Paused,
    Error,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorSubKind {
    None,
    AccessDenied,
    PathLoss,
    VolumeLoss,
    Other,
}

/// Wire shape is Transmission-style camelCase (spec section 8's testable
/// properties spell out `hashString`, `trackerAnnounces`, `dhtReplies`,
/// `rehashStartCount`, …), matching the rename scheme already used for the
/// one-off RPC `Args` structs in `dispatcher.rs`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentSnapshot {
    pub id: TorrentId,
    #[serde(rename = "hashString")]
    pub info_hash: InfoHash,
    pub name: String,
    pub status: TorrentStatus,
    pub error_kind: ErrorSubKind,
    /// Verbatim code/text from the underlying session library when the error
    /// is unclassifiable (spec section 9 design note: never invent a kind).
    pub error_code: Option<i64>,
    pub error_message: Option<String>,
    pub rate_down_bps: u64,
    pub rate_up_bps: u64,
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    pub percent_complete: f64,
    pub metadata_percent_complete: f64,
    pub labels: Vec<String>,
    pub sequential_download: bool,
    pub super_seeding: bool,
    pub paused: bool,
    pub rehash_active: bool,
    pub rehash_start_count: u64,
    pub rehash_complete_count: u64,
    pub tracker_announces: u64,
    pub dht_replies: u64,
    pub peer_connections: u64,
    pub save_path: String,
}

impl TorrentSnapshot {
    /// Multiset-equality comparison for label sets (spec section 8: "value
    /// equal as multisets").
    pub fn labels_equal_as_multiset(&self, other: &[String]) -> bool {
        let mut a = self.labels.clone();
        let mut b = other.to_vec();
        a.sort();
        b.sort();
        a == b
    }
}

/// Session-level fields are kebab-case on the wire, matching spec.md's own
/// naming for this aggregate (section 3: "labels-registry") and the
/// kebab-case RPC argument convention used elsewhere (e.g. `delete-local-data`).
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SessionLevelFields {
    pub rate_down_bps: u64,
    pub rate_up_bps: u64,
    pub downloaded_bytes_total: u64,
    pub uploaded_bytes_total: u64,
    pub active_count: usize,
    pub paused_count: usize,
    pub error_count: usize,
    /// label -> number of torrents carrying it.
    pub labels_registry: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SessionSnapshot {
    pub sequence: u64,
    pub session: SessionLevelFields,
    pub torrents: Vec<TorrentSnapshot>,
}

impl SessionSnapshot {
    pub fn empty() -> Self {
        Self {
            sequence: 0,
            session: SessionLevelFields::default(),
            torrents: Vec::new(),
        }
    }

    pub fn get(&self, id: TorrentId) -> Option<&TorrentSnapshot> {
        self.torrents.iter().find(|t| t.id == id)
    }
}

/// Shared-ownership handle: readers and the broadcaster share a lifetime
/// at least as long as the longest holder (spec section 3 invariant).
pub type SharedSnapshot = Arc<SessionSnapshot>;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SpeedHistoryBucket {
    pub timestamp: i64,
    pub down_bytes: u64,
    pub up_bytes: u64,
}
