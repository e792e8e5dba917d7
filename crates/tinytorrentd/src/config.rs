//! Configuration Service (C3) — spec section 4.6.
//!
//! `CoreSettings` is the authoritative, persisted configuration. Mutations go
//! through typed setters that flip a dirty bit and publish a change event to
//! the event bus (C2), mirroring how `librqbit::limits::Limits` keeps an
//! atomically-swappable live value next to the config struct that produced
//! it, and how `librqbit::session_persistence` treats persistence as a
//! separate, explicit flush step rather than a side effect of every setter.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::events::{DaemonEvent, EventBus};
use crate::persistence::PersistenceRepository;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyKind {
    None,
    Http,
    Socks4,
    Socks5,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub url: Option<String>,
    pub auth_enabled: bool,
    pub username: Option<String>,
    /// Never serialized in cleartext across a wire boundary; see
    /// `TorrentSnapshot`/`session-get` redaction in spec section 3 invariant (iii).
    pub password: Option<String>,
    /// When true, peer connections (not just tracker/HTTP traffic) go through the proxy.
    pub peer_proxy: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            kind: ProxyKind::None,
            url: None,
            auth_enabled: false,
            username: None,
            password: None,
            peer_proxy: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    pub enabled: bool,
    /// Seconds between speed-history samples. Invariant: >= 60.
    pub interval_secs: u64,
    /// Days of history to retain. 0 means keep forever.
    pub retention_days: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreSettings {
    pub listen_addr: SocketAddr,
    pub download_dir: PathBuf,
    pub incomplete_dir: Option<PathBuf>,
    pub watch_dir: Option<PathBuf>,
    pub download_rate_limit_kbps: Option<u32>,
    pub upload_rate_limit_kbps: Option<u32>,
    pub dht_enabled: bool,
    pub lpd_enabled: bool,
    pub pex_enabled: bool,
    pub proxy: ProxyConfig,
    pub queue_download_limit: Option<u32>,
    pub queue_seed_limit: Option<u32>,
    pub history: HistoryConfig,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            download_dir: PathBuf::from("."),
            incomplete_dir: None,
            watch_dir: None,
            download_rate_limit_kbps: None,
            upload_rate_limit_kbps: None,
            dht_enabled: true,
            lpd_enabled: true,
            pex_enabled: true,
            proxy: ProxyConfig::default(),
            queue_download_limit: Some(5),
            queue_seed_limit: Some(10),
            history: HistoryConfig::default(),
        }
    }
}

impl CoreSettings {
    /// Masks the proxy password for any value that crosses a wire boundary
    /// (spec section 3 invariant (iii); tested in section 8).
    pub fn redacted(&self) -> Self {
        let mut clone = self.clone();
        if clone.proxy.password.is_some() {
            clone.proxy.password = Some("<REDACTED>".to_string());
        }
        clone
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !is_loopback(&self.listen_addr) {
            anyhow::bail!("listen address must be loopback");
        }
        if self.history.interval_secs < 60 {
            anyhow::bail!("history interval must be >= 60s");
        }
        Ok(())
    }
}

pub fn is_loopback(addr: &SocketAddr) -> bool {
    addr.ip().is_loopback()
}

const LISTEN_CHANGE_COOLDOWN: Duration = Duration::from_secs(1);

struct Inner {
    settings: CoreSettings,
    dirty: bool,
    last_listen_change: Option<Instant>,
    last_listen_error: Option<String>,
}

/// Guards `CoreSettings` behind a single mutex (the whole struct is cheap to
/// clone, so `get()` just clones it out, matching the "cheap copy" contract
/// from spec section 4.6).
pub struct ConfigurationService {
    inner: Mutex<Inner>,
    events: EventBus,
}

impl ConfigurationService {
    pub fn new(initial: CoreSettings, events: EventBus) -> Self {
        Self {
            inner: Mutex::new(Inner {
                settings: initial,
                dirty: false,
                last_listen_change: None,
                last_listen_error: None,
            }),
            events,
        }
    }

    /// Loads persisted key/value overlay atop `CoreSettings::default()` at startup.
    pub async fn load(
        repo: &dyn PersistenceRepository,
        events: EventBus,
    ) -> anyhow::Result<Self> {
        let mut settings = CoreSettings::default();
        if let Some(v) = repo.get_setting("listen_addr").await? {
            settings.listen_addr = v.parse()?;
        }
        if let Some(v) = repo.get_setting("download_dir").await? {
            settings.download_dir = PathBuf::from(v);
        }
        if let Some(v) = repo.get_setting("dht_enabled").await? {
            settings.dht_enabled = v == "true";
        }
        if let Some(v) = repo.get_setting("lpd_enabled").await? {
            settings.lpd_enabled = v == "true";
        }
        if let Some(v) = repo.get_setting("pex_enabled").await? {
            settings.pex_enabled = v == "true";
        }
        if let Some(v) = repo.get_setting("history_interval_secs").await? {
            settings.history.interval_secs = v.parse()?;
        }
        if let Some(v) = repo.get_setting("history_retention_days").await? {
            settings.history.retention_days = v.parse()?;
        }
        settings.validate()?;
        Ok(Self::new(settings, events))
    }

    pub fn get(&self) -> CoreSettings {
        self.inner.lock().settings.clone()
    }

    /// Applies a patch of settings fields (as used by `session-set`). Returns
    /// `Err` without mutating anything if the patch would violate an invariant.
    pub fn apply_patch(&self, patch: SettingsPatch) -> anyhow::Result<()> {
        let mut guard = self.inner.lock();
        let mut next = guard.settings.clone();
        let listen_changed = patch.apply(&mut next)?;
        next.validate()?;

        if listen_changed {
            let now = Instant::now();
            if let Some(last) = guard.last_listen_change
                && now.duration_since(last) < LISTEN_CHANGE_COOLDOWN
            {
                anyhow::bail!("listen address changed too recently, cooling down");
            }
            guard.last_listen_change = Some(now);
        }

        guard.settings = next;
        guard.dirty = true;
        drop(guard);
        self.events.publish(DaemonEvent::SettingsChanged);
        Ok(())
    }

    pub fn record_listen_failure(&self, message: String) {
        self.inner.lock().last_listen_error = Some(message);
    }

    pub fn last_listen_error(&self) -> Option<String> {
        self.inner.lock().last_listen_error.clone()
    }

    pub async fn persist_if_dirty(&self, repo: &dyn PersistenceRepository) -> anyhow::Result<()> {
        let (dirty, settings) = {
            let guard = self.inner.lock();
            (guard.dirty, guard.settings.clone())
        };
        if !dirty {
            return Ok(());
        }
        repo.set_setting("listen_addr", &settings.listen_addr.to_string())
            .await?;
        repo.set_setting("download_dir", &settings.download_dir.to_string_lossy())
            .await?;
        repo.set_setting("dht_enabled", &settings.dht_enabled.to_string())
            .await?;
        repo.set_setting("lpd_enabled", &settings.lpd_enabled.to_string())
            .await?;
        repo.set_setting("pex_enabled", &settings.pex_enabled.to_string())
            .await?;
        repo.set_setting(
            "history_interval_secs",
            &settings.history.interval_secs.to_string(),
        )
        .await?;
        repo.set_setting(
            "history_retention_days",
            &settings.history.retention_days.to_string(),
        )
        .await?;
        self.inner.lock().dirty = false;
        Ok(())
    }
}

/// Partial update applied by `session-set`. `None` fields are left untouched.
///
/// Wire keys are kebab-case, mirroring `ProxyKind`'s own rename scheme and
/// spec section 8 scenario 5's literal `proxy-password`/`proxy-auth-enabled`
/// argument names.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SettingsPatch {
    pub listen_addr: Option<SocketAddr>,
    pub download_dir: Option<PathBuf>,
    pub incomplete_dir: Option<Option<PathBuf>>,
    pub watch_dir: Option<Option<PathBuf>>,
    pub download_rate_limit_kbps: Option<Option<u32>>,
    pub upload_rate_limit_kbps: Option<Option<u32>>,
    pub dht_enabled: Option<bool>,
    pub lpd_enabled: Option<bool>,
    pub pex_enabled: Option<bool>,
    pub proxy_kind: Option<ProxyKind>,
    pub proxy_url: Option<Option<String>>,
    pub proxy_auth_enabled: Option<bool>,
    pub proxy_username: Option<Option<String>>,
    pub proxy_password: Option<Option<String>>,
    pub proxy_peer_proxy: Option<bool>,
    pub queue_download_limit: Option<Option<u32>>,
    pub queue_seed_limit: Option<Option<u32>>,
    pub history_enabled: Option<bool>,
    pub history_interval_secs: Option<u64>,
    pub history_retention_days: Option<u32>,
}

impl SettingsPatch {
    /// Applies `self` onto `next`, returning whether the listen address changed.
    fn apply(&self, next: &mut CoreSettings) -> anyhow::Result<bool> {
        let mut listen_changed = false;
        if let Some(v) = self.listen_addr {
            if v != next.listen_addr {
                listen_changed = true;
            }
            next.listen_addr = v;
        }
        if let Some(v) = self.download_dir.clone() {
            next.download_dir = v;
        }
        if let Some(v) = self.incomplete_dir.clone() {
            next.incomplete_dir = v;
        }
        if let Some(v) = self.watch_dir.clone() {
            next.watch_dir = v;
        }
        if let Some(v) = self.download_rate_limit_kbps {
            next.download_rate_limit_kbps = v;
        }
        if let Some(v) = self.upload_rate_limit_kbps {
            next.upload_rate_limit_kbps = v;
        }
        if let Some(v) = self.dht_enabled {
            next.dht_enabled = v;
        }
        if let Some(v) = self.lpd_enabled {
            next.lpd_enabled = v;
        }
        if let Some(v) = self.pex_enabled {
            next.pex_enabled = v;
        }
        if let Some(v) = self.proxy_kind {
            next.proxy.kind = v;
        }
        if let Some(v) = self.proxy_url.clone() {
            next.proxy.url = v;
        }
        if let Some(v) = self.proxy_auth_enabled {
            next.proxy.auth_enabled = v;
        }
        if let Some(v) = self.proxy_username.clone() {
            next.proxy.username = v;
        }
        if let Some(v) = self.proxy_password.clone() {
            next.proxy.password = v;
        }
        if let Some(v) = self.proxy_peer_proxy {
            next.proxy.peer_proxy = v;
        }
        if let Some(v) = self.queue_download_limit {
            next.queue_download_limit = v;
        }
        if let Some(v) = self.queue_seed_limit {
            next.queue_seed_limit = v;
        }
        if let Some(v) = self.history_enabled {
            next.history.enabled = v;
        }
        if let Some(v) = self.history_interval_secs {
            next.history.interval_secs = v;
        }
        if let Some(v) = self.history_retention_days {
            next.history.retention_days = v;
        }
        Ok(listen_changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacted_masks_proxy_password_when_set() {
        let mut settings = CoreSettings::default();
        settings.proxy.auth_enabled = true;
        settings.proxy.password = Some("hunter2".to_string());

        let redacted = settings.redacted();
        assert_eq!(redacted.proxy.password.as_deref(), Some("<REDACTED>"));
        // Original is untouched — redaction only happens at the wire boundary.
        assert_eq!(settings.proxy.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn redacted_leaves_absent_password_alone() {
        let settings = CoreSettings::default();
        assert_eq!(settings.redacted().proxy.password, None);
    }

    #[test]
    fn apply_patch_rejects_non_loopback_listen_addr() {
        let service = ConfigurationService::new(CoreSettings::default(), EventBus::new());
        let patch = SettingsPatch {
            listen_addr: Some("93.184.216.34:9000".parse().unwrap()),
            ..Default::default()
        };
        assert!(service.apply_patch(patch).is_err());
        // Rejected patch must not have mutated anything.
        assert!(is_loopback(&service.get().listen_addr));
    }

    #[test]
    fn apply_patch_rejects_short_history_interval() {
        let service = ConfigurationService::new(CoreSettings::default(), EventBus::new());
        let patch = SettingsPatch {
            history_interval_secs: Some(30),
            ..Default::default()
        };
        assert!(service.apply_patch(patch).is_err());
        assert_eq!(service.get().history.interval_secs, 300);
    }

    #[test]
    fn apply_patch_sets_dirty_and_publishes_event() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let service = ConfigurationService::new(CoreSettings::default(), events);

        let patch = SettingsPatch {
            dht_enabled: Some(false),
            ..Default::default()
        };
        service.apply_patch(patch).unwrap();
        assert!(!service.get().dht_enabled);
        assert!(matches!(
            rx.try_recv().unwrap(),
            DaemonEvent::SettingsChanged
        ));
    }

    #[test]
    fn second_listen_change_within_cooldown_is_rejected() {
        let service = ConfigurationService::new(CoreSettings::default(), EventBus::new());
        let first = SettingsPatch {
            listen_addr: Some("127.0.0.1:9001".parse().unwrap()),
            ..Default::default()
        };
        service.apply_patch(first).unwrap();

        let second = SettingsPatch {
            listen_addr: Some("127.0.0.1:9002".parse().unwrap()),
            ..Default::default()
        };
        assert!(service.apply_patch(second).is_err());
        assert_eq!(service.get().listen_addr.port(), 9001);
    }
}
