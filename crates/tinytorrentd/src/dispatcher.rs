//! RPC Dispatcher (C7) — spec section 4.4.
//!
//! A static method table in the same spirit as `librqbit::http_api`'s
//! `Router::route` list (see the `api_root` handler's own self-description
//! map): every method name this daemon understands is enumerated once, in
//! one place, so `tt-get-capabilities` and the dispatcher can never drift
//! apart. Argument parsing/normalization lives here; `engine.rs` never sees
//! raw JSON.

use std::collections::HashSet;
use std::sync::LazyLock;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::command_queue::{
    AddTorrentRequest, CommandOutcome, PendingCommand, TorrentFieldsPatch, TorrentSource,
};
use crate::config::SettingsPatch;
use crate::engine::EngineHandle;
use crate::error::{DaemonError, Kind, Result};
use crate::snapshot::{SpeedHistoryBucket, TorrentId};
use crate::wire::{RpcRequest, RpcResponse};

/// Every method this daemon answers. Transmission-compatible names are
/// listed as-is; daemon-native additions are marked ★ in spec section 4.4
/// and keep Transmission-shaped names except `tt-get-capabilities`, which
/// spec.md gives the `tt-` prefix explicitly so clients can probe for it
/// without risking a collision with a real Transmission server.
pub static SUPPORTED_METHODS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "session-get",
        "session-set",
        "session-stats",
        "session-close",
        "session-tray-status",
        "session-pause-all",
        "session-resume-all",
        "tt-get-capabilities",
        "torrent-get",
        "torrent-add",
        "torrent-remove",
        "torrent-start",
        "torrent-start-now",
        "torrent-stop",
        "torrent-verify",
        "torrent-reannounce",
        "torrent-set",
        "torrent-rename-path",
        "free-space",
        "blocklist-update",
        "history-get",
        "history-clear",
        "group-set",
    ]
    .into_iter()
    .collect()
});

pub async fn dispatch(engine: &EngineHandle, request: RpcRequest) -> RpcResponse {
    let tag = request.tag;
    match handle(engine, &request.method, request.arguments).await {
        Ok(arguments) => RpcResponse::success(arguments, tag),
        Err(err) => RpcResponse {
            result: "error",
            arguments: err.to_rpc_body(tag)["arguments"].clone(),
            tag,
        },
    }
}

async fn handle(engine: &EngineHandle, method: &str, args: Value) -> Result<Value> {
    if !SUPPORTED_METHODS.contains(method) {
        return Err(DaemonError::new(
            Kind::UnsupportedMethod,
            format!("unsupported method: {method}"),
        ));
    }

    match method {
        "session-get" => session_get(engine),
        "session-set" => session_set(engine, args).await,
        "session-stats" => session_stats(engine),
        "session-close" => Ok(json!({})),
        "session-tray-status" => session_tray_status(engine),
        "session-pause-all" => set_all_paused(engine, true).await,
        "session-resume-all" => set_all_paused(engine, false).await,
        "tt-get-capabilities" => Ok(capabilities()),
        "torrent-get" => torrent_get(engine, args),
        "torrent-add" => torrent_add(engine, args).await,
        "torrent-remove" => torrent_remove(engine, args).await,
        "torrent-start" | "torrent-start-now" => set_paused(engine, args, false).await,
        "torrent-stop" => set_paused(engine, args, true).await,
        "torrent-verify" => verify(engine, args).await,
        "torrent-reannounce" => reannounce(engine, args).await,
        "torrent-set" => torrent_set(engine, args).await,
        "torrent-rename-path" => torrent_rename_path(engine, args).await,
        "free-space" => free_space(args),
        "blocklist-update" => Ok(json!({ "blocklist-size": 0 })),
        "history-get" => history_get(engine, args).await,
        "history-clear" => history_clear(engine, args).await,
        "group-set" => group_set(engine, args).await,
        _ => unreachable!("method allow-listed above"),
    }
}

fn capabilities() -> Value {
    json!({
        "rpc-version": 17,
        "methods": SUPPORTED_METHODS.iter().collect::<Vec<_>>(),
        "sync": { "transport": "websocket", "path": "/ws" },
    })
}

fn session_get(engine: &EngineHandle) -> Result<Value> {
    let settings = engine.config().get().redacted();
    Ok(serde_json::to_value(settings).map_err(|e| DaemonError::with_source(
        Kind::Internal,
        "serialize settings",
        e.into(),
    ))?)
}

async fn session_set(engine: &EngineHandle, args: Value) -> Result<Value> {
    let patch: SettingsPatch = parse_args(args)?;
    engine
        .submit(PendingCommand::SetSessionSettings { patch })
        .await?;
    Ok(json!({}))
}

fn session_stats(engine: &EngineHandle) -> Result<Value> {
    let snapshot = engine.latest();
    Ok(serde_json::to_value(&snapshot.session).map_err(|e| {
        DaemonError::with_source(Kind::Internal, "serialize session stats", e.into())
    })?)
}

/// ★ daemon extension: a compact summary for a tray/menu-bar icon — counts
/// only, no per-torrent detail (spec section 4.4 method surface).
fn session_tray_status(engine: &EngineHandle) -> Result<Value> {
    let snapshot = engine.latest();
    Ok(json!({
        "active-count": snapshot.session.active_count,
        "paused-count": snapshot.session.paused_count,
        "error-count": snapshot.session.error_count,
        "rate-down-bps": snapshot.session.rate_down_bps,
        "rate-up-bps": snapshot.session.rate_up_bps,
    }))
}

async fn set_all_paused(engine: &EngineHandle, paused: bool) -> Result<Value> {
    let ids: Vec<TorrentId> = engine.latest().torrents.iter().map(|t| t.id).collect();
    engine
        .submit(PendingCommand::SetPaused { ids, paused })
        .await?;
    Ok(json!({}))
}

fn torrent_get(engine: &EngineHandle, args: Value) -> Result<Value> {
    #[derive(Deserialize, Default)]
    struct Args {
        ids: Option<IdSelector>,
        fields: Option<Vec<String>>,
    }
    let args: Args = parse_args(args)?;
    let snapshot = engine.latest();
    let torrents: Vec<_> = match args.ids {
        None | Some(IdSelector::RecentlyActive) => snapshot.torrents.clone(),
        Some(IdSelector::Ids(ids)) => snapshot
            .torrents
            .iter()
            .filter(|t| ids.contains(&t.id))
            .cloned()
            .collect(),
    };
    let torrents = torrents
        .into_iter()
        .map(|t| {
            let value = serde_json::to_value(t).map_err(|e| {
                DaemonError::with_source(Kind::Internal, "serialize torrent", e.into())
            })?;
            Ok(project_fields(value, args.fields.as_deref()))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(json!({ "torrents": torrents }))
}

/// Projects a serialized torrent object down to the requested field names
/// (spec section 4.4 step 5). `None` means "all fields", matching Transmission's
/// own `fields`-omitted-means-everything convention.
fn project_fields(value: Value, fields: Option<&[String]>) -> Value {
    let Some(fields) = fields else { return value };
    let Value::Object(mut map) = value else { return value };
    let wanted: HashSet<&str> = fields.iter().map(String::as_str).collect();
    map.retain(|key, _| wanted.contains(key.as_str()));
    Value::Object(map)
}

async fn torrent_add(engine: &EngineHandle, args: Value) -> Result<Value> {
    #[derive(Deserialize, Default)]
    struct Args {
        #[serde(default)]
        filename: Option<String>,
        #[serde(default)]
        metainfo: Option<String>,
        #[serde(default)]
        paused: bool,
        #[serde(default)]
        download_dir: Option<String>,
        #[serde(default)]
        labels: Vec<String>,
        #[serde(default)]
        files_wanted: Option<Vec<usize>>,
    }
    let args: Args = parse_args(args)?;

    let source = if let Some(metainfo) = args.metainfo {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(metainfo)
            .map_err(|e| {
                DaemonError::with_source(Kind::InvalidArgument, "invalid base64 metainfo", e.into())
            })?;
        TorrentSource::TorrentFileBytes(bytes)
    } else if let Some(filename) = args.filename {
        TorrentSource::MagnetOrUrl(filename)
    } else {
        return Err(DaemonError::new(
            Kind::InvalidArgument,
            "torrent-add requires either filename or metainfo",
        ));
    };

    let outcome = engine
        .submit(PendingCommand::AddTorrent(AddTorrentRequest {
            source,
            paused: args.paused,
            save_path: args.download_dir,
            labels: args.labels,
            only_files: args.files_wanted,
            sequential_download: false,
        }))
        .await?;

    match outcome {
        CommandOutcome::TorrentAdded {
            id,
            info_hash,
            already_managed,
        } => {
            let key = if already_managed {
                "torrent-duplicate"
            } else {
                "torrent-added"
            };
            Ok(json!({ key: { "id": id, "hashString": info_hash } }))
        }
        CommandOutcome::Ack => Ok(json!({})),
    }
}

async fn torrent_remove(engine: &EngineHandle, args: Value) -> Result<Value> {
    #[derive(Deserialize, Default)]
    struct Args {
        ids: Vec<TorrentId>,
        #[serde(default, rename = "delete-local-data")]
        delete_local_data: bool,
    }
    let args: Args = parse_args(args)?;
    engine
        .submit(PendingCommand::RemoveTorrent {
            ids: args.ids,
            delete_local_data: args.delete_local_data,
        })
        .await?;
    Ok(json!({}))
}

async fn set_paused(engine: &EngineHandle, args: Value, paused: bool) -> Result<Value> {
    let ids = parse_ids(args)?;
    engine
        .submit(PendingCommand::SetPaused { ids, paused })
        .await?;
    Ok(json!({}))
}

async fn verify(engine: &EngineHandle, args: Value) -> Result<Value> {
    let ids = parse_ids(args)?;
    engine.submit(PendingCommand::Verify { ids }).await?;
    Ok(json!({}))
}

async fn reannounce(engine: &EngineHandle, args: Value) -> Result<Value> {
    let ids = parse_ids(args)?;
    engine.submit(PendingCommand::Reannounce { ids }).await?;
    Ok(json!({}))
}

async fn torrent_set(engine: &EngineHandle, args: Value) -> Result<Value> {
    #[derive(Deserialize, Default)]
    struct Args {
        ids: Vec<TorrentId>,
        #[serde(default)]
        labels: Option<Vec<String>>,
        #[serde(default, rename = "sequentialDownload")]
        sequential_download: Option<bool>,
        #[serde(default, rename = "downloadLimit")]
        download_limit_kbps: Option<Option<u32>>,
        #[serde(default, rename = "uploadLimit")]
        upload_limit_kbps: Option<Option<u32>>,
    }
    let args: Args = parse_args(args)?;
    for id in args.ids {
        let patch = TorrentFieldsPatch {
            labels: args.labels.clone(),
            sequential_download: args.sequential_download,
            download_rate_limit_kbps: args.download_limit_kbps.clone(),
            upload_rate_limit_kbps: args.upload_limit_kbps.clone(),
            queue_position: None,
        };
        engine
            .submit(PendingCommand::SetTorrentFields { id, patch })
            .await?;
    }
    Ok(json!({}))
}

async fn torrent_rename_path(engine: &EngineHandle, args: Value) -> Result<Value> {
    #[derive(Deserialize, Default)]
    struct Args {
        ids: Vec<TorrentId>,
        path: String,
        name: String,
    }
    let args: Args = parse_args(args)?;
    let id = *args
        .ids
        .first()
        .ok_or_else(|| DaemonError::new(Kind::InvalidArgument, "rename-path requires one id"))?;
    engine
        .submit(PendingCommand::RenamePath {
            id,
            old_path: args.path,
            new_name: args.name,
        })
        .await?;
    Ok(json!({}))
}

fn free_space(args: Value) -> Result<Value> {
    #[derive(Deserialize, Default)]
    struct Args {
        path: String,
    }
    let args: Args = parse_args(args)?;
    let bytes = statvfs_available_bytes(&args.path)
        .map_err(|e| DaemonError::with_source(Kind::PathUnreachable, "free-space", e))?;
    Ok(json!({ "path": args.path, "size-bytes": bytes }))
}

#[cfg(unix)]
fn statvfs_available_bytes(path: &str) -> anyhow::Result<u64> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;

    let c_path = CString::new(path)?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        anyhow::bail!("statvfs failed for {path}: {}", std::io::Error::last_os_error());
    }
    let stat = unsafe { stat.assume_init() };
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn statvfs_available_bytes(_path: &str) -> anyhow::Result<u64> {
    anyhow::bail!("free-space is only supported on unix targets")
}

async fn history_get(engine: &EngineHandle, args: Value) -> Result<Value> {
    #[derive(Deserialize, Default)]
    struct Args {
        start: i64,
        #[serde(default)]
        end: Option<i64>,
        #[serde(default)]
        step: Option<i64>,
        #[serde(default)]
        limit: Option<usize>,
    }
    let args: Args = parse_args(args)?;
    let recording_interval = engine.config().get().history.interval_secs as i64;
    let end = args.end.unwrap_or(args.start + recording_interval);

    let step = effective_step(args.start, end, args.step, args.limit, recording_interval);

    let raw = engine
        .repo()
        .query_speed_history(args.start, end)
        .await
        .map_err(|e| DaemonError::with_source(Kind::Internal, "query history", e))?;
    let rows = snap_to_step(raw, step);
    Ok(json!({
        "step": step,
        "recording-interval": recording_interval,
        "data": rows,
    }))
}

/// Spec section 4.4 "step snapping": the effective step is the requested
/// step rounded up to a multiple of `interval`, then (if `limit` is set)
/// widened further so the series never exceeds `limit` buckets.
fn effective_step(
    start: i64,
    end: i64,
    requested: Option<i64>,
    limit: Option<usize>,
    interval: i64,
) -> i64 {
    let interval = interval.max(1);
    let requested = requested.unwrap_or(interval).max(1);
    let mut step = requested.div_ceil(interval) * interval;

    if let Some(limit) = limit.filter(|&l| l > 0) {
        let span = (end - start).max(0);
        let min_step_for_limit = span.div_euclid(limit as i64).max(0) + interval;
        let min_step_for_limit = min_step_for_limit.div_ceil(interval) * interval;
        step = step.max(min_step_for_limit);
    }
    step
}

/// One dense `[ts, sumDown, sumUp, peakDown, peakUp]` row per spec section
/// 4.4's `history-get` response shape.
#[derive(serde::Serialize)]
struct HistoryRow(i64, u64, u64, u64, u64);

/// Groups raw samples into fixed-width buckets aligned to `step`, summing
/// throughput and tracking the per-bucket peak sample.
fn snap_to_step(raw: Vec<SpeedHistoryBucket>, step: i64) -> Vec<HistoryRow> {
    use std::collections::BTreeMap;
    let mut grouped: BTreeMap<i64, (u64, u64, u64, u64)> = BTreeMap::new();
    for sample in raw {
        let bucket_ts = sample.timestamp.div_euclid(step) * step;
        let entry = grouped.entry(bucket_ts).or_insert((0, 0, 0, 0));
        entry.0 += sample.down_bytes;
        entry.1 += sample.up_bytes;
        entry.2 = entry.2.max(sample.down_bytes);
        entry.3 = entry.3.max(sample.up_bytes);
    }
    grouped
        .into_iter()
        .map(|(ts, (sum_down, sum_up, peak_down, peak_up))| {
            HistoryRow(ts, sum_down, sum_up, peak_down, peak_up)
        })
        .collect()
}

async fn history_clear(engine: &EngineHandle, args: Value) -> Result<Value> {
    #[derive(Deserialize, Default)]
    struct Args {
        #[serde(default, rename = "older-than")]
        older_than: Option<i64>,
    }
    let args: Args = parse_args(args)?;
    engine
        .submit(PendingCommand::ClearHistory {
            older_than: args.older_than,
        })
        .await?;
    Ok(json!({}))
}

async fn group_set(engine: &EngineHandle, args: Value) -> Result<Value> {
    #[derive(Deserialize, Default)]
    struct Args {
        #[serde(default, rename = "queue-download-limit")]
        queue_download_limit: Option<Option<u32>>,
        #[serde(default, rename = "queue-seed-limit")]
        queue_seed_limit: Option<Option<u32>>,
    }
    let args: Args = parse_args(args)?;
    let patch = SettingsPatch {
        queue_download_limit: args.queue_download_limit,
        queue_seed_limit: args.queue_seed_limit,
        ..Default::default()
    };
    engine
        .submit(PendingCommand::SetSessionSettings { patch })
        .await?;
    Ok(json!({}))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdSelector {
    Ids(Vec<TorrentId>),
    #[serde(rename = "recently-active")]
    RecentlyActive,
}

/// Normalizes the `ids` argument: a bare id, an array of ids, or the literal
/// string `"recently-active"` (spec section 4.4). Missing `ids` means "all".
fn parse_ids(args: Value) -> Result<Vec<TorrentId>> {
    let ids_value = args.get("ids").cloned().unwrap_or(Value::Null);
    match ids_value {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s == "recently-active" => Ok(Vec::new()),
        Value::Number(n) => Ok(vec![n.as_u64().unwrap_or(0) as TorrentId]),
        Value::Array(items) => items
            .into_iter()
            .map(|v| {
                v.as_u64()
                    .map(|n| n as TorrentId)
                    .ok_or_else(|| DaemonError::new(Kind::InvalidArgument, "ids must be numeric"))
            })
            .collect(),
        _ => Err(DaemonError::new(Kind::InvalidArgument, "invalid ids argument")),
    }
}

fn parse_args<T: serde::de::DeserializeOwned + Default>(args: Value) -> Result<T> {
    if args.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(args)
        .map_err(|e| DaemonError::with_source(Kind::InvalidArgument, "invalid arguments", e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_list_matches_supported_methods() {
        let caps = capabilities();
        let listed = caps["methods"].as_array().unwrap().len();
        assert_eq!(listed, SUPPORTED_METHODS.len());
    }

    #[test]
    fn snap_to_step_sums_and_peaks_within_bucket() {
        let raw = vec![
            SpeedHistoryBucket { timestamp: 0, down_bytes: 10, up_bytes: 1 },
            SpeedHistoryBucket { timestamp: 30, down_bytes: 20, up_bytes: 2 },
            SpeedHistoryBucket { timestamp: 61, down_bytes: 5, up_bytes: 0 },
        ];
        let snapped = snap_to_step(raw, 60);
        assert_eq!(snapped.len(), 2);
        assert_eq!(snapped[0].1, 30); // sumDown
        assert_eq!(snapped[0].3, 20); // peakDown
        assert_eq!(snapped[1].1, 5);
    }

    #[test]
    fn history_bucketing_scenario_from_spec() {
        // spec section 8 scenario 6: interval=300, samples at 0/300/600,
        // start=0 end=900 step=600 -> exactly 2 rows, each summing two
        // underlying buckets.
        let raw = vec![
            SpeedHistoryBucket { timestamp: 0, down_bytes: 100, up_bytes: 10 },
            SpeedHistoryBucket { timestamp: 300, down_bytes: 200, up_bytes: 20 },
            SpeedHistoryBucket { timestamp: 600, down_bytes: 50, up_bytes: 5 },
        ];
        let step = effective_step(0, 900, Some(600), None, 300);
        assert_eq!(step, 600);
        let rows = snap_to_step(raw, step);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].1, 300); // 100 + 200
        assert_eq!(rows[0].3, 200); // peak
        assert_eq!(rows[1].1, 50);
    }

    #[test]
    fn effective_step_snaps_up_to_a_multiple_of_interval() {
        assert_eq!(effective_step(0, 100, Some(100), None, 60), 120);
        assert_eq!(effective_step(0, 100, None, None, 60), 60);
    }

    #[test]
    fn effective_step_widens_to_respect_limit() {
        // span=3600, limit=4 buckets, interval=60 -> step must be >= 900, snapped to 60 -> 960.
        let step = effective_step(0, 3600, Some(60), Some(4), 60);
        assert!(step >= 900);
        assert_eq!(step % 60, 0);
    }
}
