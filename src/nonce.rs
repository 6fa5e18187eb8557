//! The pairing nonce: 16 random bytes generated by the outer bridge,
//! persisted to a user-readable file, and presented by the inner bridge
//! as proof of co-location (spec.md §4.4).

use std::path::Path;

use log::debug;
use rand::RngCore;
use tokio::fs;
use tokio::io::AsyncReadExt;

use crate::error::{BridgeError, Result};

pub const NONCE_LEN: usize = 16;
pub type Nonce = [u8; NONCE_LEN];

/// Generates 16 cryptographically random bytes and writes them to
/// `path`, creating parent directories as needed and restricting
/// permissions to the owning user.
pub async fn generate_and_persist(path: &Path) -> Result<Nonce> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, &nonce).await?;
    restrict_permissions(path).await?;
    debug!("wrote pairing nonce to {}", path.display());
    Ok(nonce)
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(windows)]
async fn restrict_permissions(_path: &Path) -> Result<()> {
    // ACL restriction on Windows is handled by the per-user profile
    // directory the nonce file lives under; nothing further to do here.
    Ok(())
}

/// Reads the nonce file. Per spec.md §4.4/§8: if fewer than 16 bytes are
/// present, this is a boundary condition the caller logs and abandons,
/// not a panic.
pub async fn read(path: &Path) -> Result<Nonce> {
    let mut f = fs::File::open(path).await?;
    let mut buf = Vec::with_capacity(NONCE_LEN);
    f.read_to_end(&mut buf).await?;
    if buf.len() < NONCE_LEN {
        return Err(BridgeError::Auth(format!(
            "nonce file {} contains {} bytes, need {}",
            path.display(),
            buf.len(),
            NONCE_LEN
        )));
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&buf[..NONCE_LEN]);
    Ok(nonce)
}

/// Removes the nonce file on clean exit. Idempotent: a missing file is
/// not an error.
pub async fn remove(path: &Path) {
    let _ = fs::remove_file(path).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn round_trips_through_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("nonce");
        let written = generate_and_persist(&path).await.unwrap();
        let read_back = read(&path).await.unwrap();
        assert_eq!(written, read_back);
    }

    #[tokio::test]
    async fn short_file_is_an_auth_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nonce");
        tokio::fs::write(&path, &[1u8, 2, 3]).await.unwrap();
        let err = read(&path).await.unwrap_err();
        assert!(matches!(err, BridgeError::Auth(_)));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nonce");
        remove(&path).await;
        generate_and_persist(&path).await.unwrap();
        remove(&path).await;
        remove(&path).await;
        assert!(!path.exists());
    }
}
