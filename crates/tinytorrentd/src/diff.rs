//! Diff & Patch Engine (C9) — spec section 4.3.
//!
//! Pure, synchronous, no I/O: a plain function from two `SessionSnapshot`s to
//! a `Patch`. There is no teacher file that does exactly this (the session
//! library publishes whole snapshots, not diffs), so this module is built
//! from the general "compute the delta against the last broadcast state"
//! shape already present in `librqbit::session_stats::snapshot` generalized
//! to the three-way removed/added/updated split spec.md calls for.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::snapshot::{SessionSnapshot, TorrentId, TorrentSnapshot};

#[derive(Debug, Clone, Serialize)]
pub struct Patch {
    pub sequence: u64,
    pub removed: Vec<TorrentId>,
    pub added: Vec<TorrentSnapshot>,
    pub updated: Vec<TorrentFieldUpdate>,
    pub session: BTreeMap<&'static str, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TorrentFieldUpdate {
    pub id: TorrentId,
    pub fields: BTreeMap<&'static str, Value>,
}

/// Computes the patch taking `last` (sequence N) to `next` (sequence N+1).
///
/// Caller must ensure `next.sequence == last.sequence + 1`; the diff engine
/// itself is stateless and does not enforce monotonicity (spec section 4.3 —
/// that invariant is the Engine Coordinator's responsibility when it
/// publishes).
pub fn compute_patch(last: &SessionSnapshot, next: &SessionSnapshot) -> Patch {
    let mut removed = Vec::new();
    let mut added = Vec::new();
    let mut updated = Vec::new();

    for old in &last.torrents {
        match next.get(old.id) {
            None => removed.push(old.id),
            Some(new) if new.info_hash != old.info_hash => {
                // id reuse: prefer removed+added over a field-level update.
                removed.push(old.id);
                added.push(new.clone());
            }
            Some(new) => {
                if let Some(fields) = diff_torrent_fields(old, new) {
                    updated.push(fields);
                }
            }
        }
    }

    for new in &next.torrents {
        if last.get(new.id).is_none() {
            added.push(new.clone());
        }
    }

    removed.sort_unstable();
    // `added` must preserve S's order (spec section 4.3); re-sort by position in `next.torrents`.
    let order: BTreeMap<TorrentId, usize> = next
        .torrents
        .iter()
        .enumerate()
        .map(|(idx, t)| (t.id, idx))
        .collect();
    added.sort_by_key(|t| order.get(&t.id).copied().unwrap_or(usize::MAX));

    Patch {
        sequence: next.sequence,
        removed,
        added,
        updated,
        session: diff_session_fields(&last.session, &next.session),
    }
}

fn diff_torrent_fields(old: &TorrentSnapshot, new: &TorrentSnapshot) -> Option<TorrentFieldUpdate> {
    let mut fields = BTreeMap::new();

    macro_rules! track {
        ($name:literal, $accessor:ident) => {
            if old.$accessor != new.$accessor {
                fields.insert($name, serde_json::to_value(&new.$accessor).unwrap());
            }
        };
    }

    // Key names mirror `TorrentSnapshot`'s own `#[serde(rename_all =
    // "camelCase")]` wire shape, so a `sync-patch`'s `updated` fields line up
    // with a `sync-snapshot`'s torrent objects.
    track!("status", status);
    track!("errorKind", error_kind);
    track!("errorCode", error_code);
    track!("errorMessage", error_message);
    track!("rateDownBps", rate_down_bps);
    track!("rateUpBps", rate_up_bps);
    track!("downloadedBytes", downloaded_bytes);
    track!("uploadedBytes", uploaded_bytes);
    track!("sequentialDownload", sequential_download);
    track!("superSeeding", super_seeding);
    track!("paused", paused);
    track!("rehashActive", rehash_active);
    track!("rehashStartCount", rehash_start_count);
    track!("rehashCompleteCount", rehash_complete_count);
    track!("trackerAnnounces", tracker_announces);
    track!("dhtReplies", dht_replies);
    track!("peerConnections", peer_connections);
    track!("savePath", save_path);
    track!("name", name);

    // Floats compared by bitwise-equal on their serialized bit pattern, per
    // spec section 4.3 ("floats by bitwise-equal on serialized value").
    if old.percent_complete.to_bits() != new.percent_complete.to_bits() {
        fields.insert(
            "percentComplete",
            serde_json::to_value(new.percent_complete).unwrap(),
        );
    }
    if old.metadata_percent_complete.to_bits() != new.metadata_percent_complete.to_bits() {
        fields.insert(
            "metadataPercentComplete",
            serde_json::to_value(new.metadata_percent_complete).unwrap(),
        );
    }

    // Labels compared as multisets, not by order.
    if !old.labels_equal_as_multiset(&new.labels) {
        fields.insert("labels", serde_json::to_value(&new.labels).unwrap());
    }

    if fields.is_empty() {
        None
    } else {
        Some(TorrentFieldUpdate { id: new.id, fields })
    }
}

fn diff_session_fields(
    old: &crate::snapshot::SessionLevelFields,
    new: &crate::snapshot::SessionLevelFields,
) -> BTreeMap<&'static str, Value> {
    let mut out = BTreeMap::new();
    macro_rules! track {
        ($name:literal, $accessor:ident) => {
            if old.$accessor != new.$accessor {
                out.insert($name, serde_json::to_value(&new.$accessor).unwrap());
            }
        };
    }
    // Key names mirror `SessionLevelFields`'s own kebab-case wire shape.
    track!("rate-down-bps", rate_down_bps);
    track!("rate-up-bps", rate_up_bps);
    track!("downloaded-bytes-total", downloaded_bytes_total);
    track!("uploaded-bytes-total", uploaded_bytes_total);
    track!("active-count", active_count);
    track!("paused-count", paused_count);
    track!("error-count", error_count);
    track!("labels-registry", labels_registry);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{ErrorSubKind, TorrentStatus};

    fn base_torrent(id: TorrentId, info_hash: &str) -> TorrentSnapshot {
        TorrentSnapshot {
            id,
            info_hash: info_hash.to_string(),
            name: "test".to_string(),
            status: TorrentStatus::Downloading,
            error_kind: ErrorSubKind::None,
            error_code: None,
            error_message: None,
            rate_down_bps: 0,
            rate_up_bps: 0,
            downloaded_bytes: 0,
            uploaded_bytes: 0,
            percent_complete: 0.0,
            metadata_percent_complete: 1.0,
            labels: vec![],
            sequential_download: false,
            super_seeding: false,
            paused: false,
            rehash_active: false,
            rehash_start_count: 0,
            rehash_complete_count: 0,
            tracker_announces: 0,
            dht_replies: 0,
            peer_connections: 0,
            save_path: "/tmp".to_string(),
        }
    }

    #[test]
    fn removed_then_added_preferred_on_id_reuse() {
        let last = SessionSnapshot {
            sequence: 1,
            session: Default::default(),
            torrents: vec![base_torrent(1, "aaaa")],
        };
        let next = SessionSnapshot {
            sequence: 2,
            session: Default::default(),
            torrents: vec![base_torrent(1, "bbbb")],
        };
        let patch = compute_patch(&last, &next);
        assert_eq!(patch.removed, vec![1]);
        assert_eq!(patch.added.len(), 1);
        assert_eq!(patch.added[0].info_hash, "bbbb");
        assert!(patch.updated.is_empty());
    }

    #[test]
    fn order_removed_added_updated_is_stable() {
        let mut t1 = base_torrent(1, "aaaa");
        t1.rate_down_bps = 10;
        let last = SessionSnapshot {
            sequence: 5,
            session: Default::default(),
            torrents: vec![base_torrent(1, "aaaa"), base_torrent(2, "cccc")],
        };
        let next = SessionSnapshot {
            sequence: 6,
            session: Default::default(),
            torrents: vec![t1, base_torrent(3, "dddd")],
        };
        let patch = compute_patch(&last, &next);
        assert_eq!(patch.removed, vec![2]);
        assert_eq!(patch.added.len(), 1);
        assert_eq!(patch.added[0].id, 3);
        assert_eq!(patch.updated.len(), 1);
        assert_eq!(patch.updated[0].id, 1);
        assert!(patch.updated[0].fields.contains_key("rateDownBps"));
    }

    #[test]
    fn no_changes_yields_empty_patch() {
        let snap = SessionSnapshot {
            sequence: 1,
            session: Default::default(),
            torrents: vec![base_torrent(1, "aaaa")],
        };
        let mut next = snap.clone();
        next.sequence = 2;
        let patch = compute_patch(&snap, &next);
        assert!(patch.removed.is_empty());
        assert!(patch.added.is_empty());
        assert!(patch.updated.is_empty());
    }
}
