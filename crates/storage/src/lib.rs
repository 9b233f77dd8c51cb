use std::{
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};
use zeroize::Zeroize;

const CREDENTIALS_FILE: &str = "creds.bin";
const CREDENTIALS_TMP_FILE: &str = "creds.bin.tmp";

/// Opaque authentication material produced by the session library.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialBlob(Vec<u8>);

impl CredentialBlob {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for CredentialBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CredentialBlob({} bytes)", self.0.len())
    }
}

impl Drop for CredentialBlob {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Persists the credential blob of one session directory.
///
/// A directory that exists means the account is paired; `delete` removes the
/// whole directory and is a forced logout.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, dir: &Path) -> Result<Option<CredentialBlob>>;
    async fn save(&self, dir: &Path, blob: &CredentialBlob) -> Result<()>;
    /// Idempotent: a missing directory is not an error.
    async fn delete(&self, dir: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FsCredentialStore;

impl FsCredentialStore {
    pub fn new() -> Self {
        Self
    }

    pub fn credentials_path(dir: &Path) -> PathBuf {
        dir.join(CREDENTIALS_FILE)
    }

    pub async fn is_paired(dir: &Path) -> bool {
        tokio::fs::metadata(dir)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    }
}

#[async_trait]
impl CredentialStore for FsCredentialStore {
    async fn load(&self, dir: &Path) -> Result<Option<CredentialBlob>> {
        let path = Self::credentials_path(dir);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                debug!(path = %path.display(), len = bytes.len(), "credentials: loaded");
                Ok(Some(CredentialBlob(bytes)))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err)
                .with_context(|| format!("failed to read credentials '{}'", path.display())),
        }
    }

    async fn save(&self, dir: &Path, blob: &CredentialBlob) -> Result<()> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create session directory '{}'", dir.display()))?;

        let tmp = dir.join(CREDENTIALS_TMP_FILE);
        let path = Self::credentials_path(dir);
        tokio::fs::write(&tmp, blob.as_bytes())
            .await
            .with_context(|| format!("failed to write credentials '{}'", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to move credentials into '{}'", path.display()))?;

        debug!(path = %path.display(), len = blob.len(), "credentials: saved");
        Ok(())
    }

    async fn delete(&self, dir: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {
                info!(dir = %dir.display(), "credentials: session directory removed");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| {
                format!("failed to remove session directory '{}'", dir.display())
            }),
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
