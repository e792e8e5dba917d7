//! Handover & Token (C10) — spec section 4.9.
//!
//! Writes the listening port and an ephemeral per-process auth token to
//! `connection.json` in the data directory so a co-located UI can discover
//! both without a fixed, guessable port. The write itself follows
//! `librqbit::session_persistence::json::JsonSessionPersistenceStore::flush`'s
//! tmp-file-then-rename discipline (same crash-safety property: a reader
//! never observes a half-written file), with file permissions additionally
//! narrowed to owner-only since this file carries a bearer token.

use std::path::{Path, PathBuf};

use rand::RngCore;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub port: u16,
    pub token: String,
    pub pid: u32,
}

/// Generates a 128-bit token, hex-encoded, fresh per process (spec section
/// 4.9: "never persisted across restarts").
pub fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub async fn write_connection_file(data_dir: &Path, info: &ConnectionInfo) -> anyhow::Result<PathBuf> {
    let path = data_dir.join("connection.json");
    let tmp_path = data_dir.join("connection.json.tmp");

    let body = serde_json::to_vec_pretty(info)?;

    let mut tmp = tokio::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&tmp_path)
        .await?;
    tmp.write_all(&body).await?;
    tmp.flush().await?;
    drop(tmp);

    set_owner_only_permissions(&tmp_path).await?;
    tokio::fs::rename(&tmp_path, &path).await?;
    Ok(path)
}

#[cfg(unix)]
async fn set_owner_only_permissions(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_owner_only_permissions(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_32_hex_chars() {
        let token = generate_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn writes_connection_file_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let info = ConnectionInfo {
            port: 51413,
            token: generate_token(),
            pid: std::process::id(),
        };
        let path = write_connection_file(dir.path(), &info).await.unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("connection.json.tmp").exists());

        let read_back: ConnectionInfo =
            serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
        assert_eq!(read_back.port, 51413);
        assert_eq!(read_back.token, info.token);
    }
}
