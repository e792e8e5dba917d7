//! Persistence Repository (C1) — spec section 4.7.
//!
//! Exposes a narrow, storage-agnostic interface; no SQL leaks above this
//! layer. Backed by `sqlx::SqlitePool`, grounded in
//! `librqbit::session_persistence::json::JsonSessionPersistenceStore`'s
//! atomic-write discipline (that store uses a tmp-file + rename instead of a
//! transaction because it's flat JSON; here we have a real transactional
//! store, so every write method below runs inside a single
//! `sqlx::Transaction`, same intent, idiomatic-for-sqlite mechanism) and on
//! `Dastari-librarian`'s `sqlx::sqlite` feature usage for an embedded,
//! file-backed relational store behind a narrow repository trait.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

use crate::snapshot::SpeedHistoryBucket;

#[async_trait]
pub trait PersistenceRepository: Send + Sync {
    async fn get_setting(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set_setting(&self, key: &str, value: &str) -> anyhow::Result<()>;

    async fn list_torrent_metadata(&self) -> anyhow::Result<Vec<(String, Vec<u8>)>>;
    async fn save_torrent_metadata(&self, info_hash: &str, blob: &[u8]) -> anyhow::Result<()>;
    async fn delete_torrent_metadata(&self, info_hash: &str) -> anyhow::Result<()>;

    async fn set_labels(&self, info_hash: &str, labels: &[String]) -> anyhow::Result<()>;
    async fn get_labels(&self, info_hash: &str) -> anyhow::Result<Vec<String>>;

    async fn append_speed_bucket(&self, ts: i64, down: u64, up: u64) -> anyhow::Result<()>;
    async fn query_speed_history(
        &self,
        start: i64,
        end: i64,
    ) -> anyhow::Result<Vec<SpeedHistoryBucket>>;
    async fn trim_speed_history(&self, before_ts: i64) -> anyhow::Result<()>;
}

pub struct SqlitePersistenceRepository {
    pool: SqlitePool,
}

impl SqlitePersistenceRepository {
    pub async fn open(data_dir: &Path) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("state.db");
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(5).connect_with(opts).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS settings (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS torrents (
                info_hash TEXT PRIMARY KEY,
                metadata BLOB NOT NULL,
                labels TEXT NOT NULL DEFAULT ''
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS speed_history (
                ts INTEGER NOT NULL,
                down_bytes INTEGER NOT NULL,
                up_bytes INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_speed_history_ts ON speed_history (ts)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl PersistenceRepository for SqlitePersistenceRepository {
    async fn get_setting(&self, key: &str) -> anyhow::Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    async fn set_setting(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_torrent_metadata(&self) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let rows: Vec<(String, Vec<u8>)> =
            sqlx::query_as("SELECT info_hash, metadata FROM torrents")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    async fn save_torrent_metadata(&self, info_hash: &str, blob: &[u8]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO torrents (info_hash, metadata) VALUES (?, ?)
             ON CONFLICT(info_hash) DO UPDATE SET metadata = excluded.metadata",
        )
        .bind(info_hash)
        .bind(blob)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_torrent_metadata(&self, info_hash: &str) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM torrents WHERE info_hash = ?")
            .bind(info_hash)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_labels(&self, info_hash: &str, labels: &[String]) -> anyhow::Result<()> {
        let joined = labels.join("\u{1f}");
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO torrents (info_hash, metadata, labels) VALUES (?, x'', ?)
             ON CONFLICT(info_hash) DO UPDATE SET labels = excluded.labels",
        )
        .bind(info_hash)
        .bind(&joined)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_labels(&self, info_hash: &str) -> anyhow::Result<Vec<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT labels FROM torrents WHERE info_hash = ?")
                .bind(info_hash)
                .fetch_optional(&self.pool)
                .await?;
        Ok(match row {
            Some((s,)) if !s.is_empty() => s.split('\u{1f}').map(str::to_string).collect(),
            _ => Vec::new(),
        })
    }

    async fn append_speed_bucket(&self, ts: i64, down: u64, up: u64) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO speed_history (ts, down_bytes, up_bytes) VALUES (?, ?, ?)")
            .bind(ts)
            .bind(down as i64)
            .bind(up as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn query_speed_history(
        &self,
        start: i64,
        end: i64,
    ) -> anyhow::Result<Vec<SpeedHistoryBucket>> {
        let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
            "SELECT ts, down_bytes, up_bytes FROM speed_history
             WHERE ts >= ? AND ts <= ? ORDER BY ts ASC",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(ts, down, up)| SpeedHistoryBucket {
                timestamp: ts,
                down_bytes: down as u64,
                up_bytes: up as u64,
            })
            .collect())
    }

    async fn trim_speed_history(&self, before_ts: i64) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM speed_history WHERE ts < ?")
            .bind(before_ts)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_test_repo() -> (tempfile::TempDir, SqlitePersistenceRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = SqlitePersistenceRepository::open(dir.path()).await.unwrap();
        (dir, repo)
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let (_dir, repo) = open_test_repo().await;
        assert_eq!(repo.get_setting("dht_enabled").await.unwrap(), None);
        repo.set_setting("dht_enabled", "false").await.unwrap();
        assert_eq!(
            repo.get_setting("dht_enabled").await.unwrap(),
            Some("false".to_string())
        );
        // Overwrite is an upsert, not a duplicate row.
        repo.set_setting("dht_enabled", "true").await.unwrap();
        assert_eq!(
            repo.get_setting("dht_enabled").await.unwrap(),
            Some("true".to_string())
        );
    }

    #[tokio::test]
    async fn labels_survive_reload_as_a_multiset() {
        let dir = tempfile::tempdir().unwrap();
        let info_hash = "abc123";
        {
            let repo = SqlitePersistenceRepository::open(dir.path()).await.unwrap();
            repo.set_labels(info_hash, &["movies".to_string(), "linux-isos".to_string()])
                .await
                .unwrap();
        }
        // Reopen against the same data dir, as spec section 8's "restart" property demands.
        let repo = SqlitePersistenceRepository::open(dir.path()).await.unwrap();
        let mut labels = repo.get_labels(info_hash).await.unwrap();
        labels.sort();
        assert_eq!(labels, vec!["linux-isos".to_string(), "movies".to_string()]);
    }

    #[tokio::test]
    async fn missing_labels_return_empty_not_error() {
        let (_dir, repo) = open_test_repo().await;
        assert_eq!(repo.get_labels("nonexistent").await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn torrent_metadata_save_list_delete() {
        let (_dir, repo) = open_test_repo().await;
        repo.save_torrent_metadata("aaaa", b"blob-a").await.unwrap();
        repo.save_torrent_metadata("bbbb", b"blob-b").await.unwrap();

        let mut all = repo.list_torrent_metadata().await.unwrap();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(all, vec![
            ("aaaa".to_string(), b"blob-a".to_vec()),
            ("bbbb".to_string(), b"blob-b".to_vec()),
        ]);

        repo.delete_torrent_metadata("aaaa").await.unwrap();
        let remaining = repo.list_torrent_metadata().await.unwrap();
        assert_eq!(remaining, vec![("bbbb".to_string(), b"blob-b".to_vec())]);
    }

    #[tokio::test]
    async fn speed_history_query_respects_window_and_trim() {
        let (_dir, repo) = open_test_repo().await;
        repo.append_speed_bucket(0, 10, 1).await.unwrap();
        repo.append_speed_bucket(300, 20, 2).await.unwrap();
        repo.append_speed_bucket(600, 30, 3).await.unwrap();

        let windowed = repo.query_speed_history(250, 650).await.unwrap();
        assert_eq!(windowed.len(), 2);
        assert_eq!(windowed[0].timestamp, 300);

        repo.trim_speed_history(350).await.unwrap();
        let remaining = repo.query_speed_history(0, 1000).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].timestamp, 600);
    }
}
