//! Credential value and the stores that own it
//!
//! The store is the only holder of the current access credential. The
//! pipeline reads it on every request; only the refresh coordinator writes
//! it (`persist` after a successful refresh, `invalidate` after a rejected
//! one). Credentials are replaced wholesale, never edited in place.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::constants::BEARER_PREFIX;
use crate::error::{Error, Result};

/// An issued access credential.
///
/// `issued_at` is a unix timestamp in milliseconds, stamped when the
/// refresh response was received.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub issued_at: u64,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, issued_at: u64) -> Self {
        Self {
            access_token: access_token.into(),
            issued_at,
        }
    }

    /// Credential stamped with the current wall-clock time.
    pub fn issued_now(access_token: impl Into<String>) -> Self {
        Self::new(access_token, now_millis())
    }

    /// Value for the Authorization header.
    pub fn bearer(&self) -> String {
        format!("{BEARER_PREFIX}{}", self.access_token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Holder of the session's access credential.
///
/// Uses `Pin<Box<dyn Future>>` return types so the pipeline and coordinator
/// can share one `Arc<dyn CredentialStore>`.
pub trait CredentialStore: Send + Sync {
    /// The credential to attach to outgoing requests, if any.
    fn current(&self) -> Pin<Box<dyn Future<Output = Option<Credential>> + Send + '_>>;

    /// Replace the stored credential with a newly issued one.
    fn persist(&self, credential: Credential)
    -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Drop the stored credential; subsequent `current()` calls return `None`.
    fn invalidate(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryCredentialStore {
    state: RwLock<Option<Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            state: RwLock::new(Some(credential)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn current(&self) -> Pin<Box<dyn Future<Output = Option<Credential>> + Send + '_>> {
        Box::pin(async move { self.state.read().await.clone() })
    }

    fn persist(
        &self,
        credential: Credential,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            *self.state.write().await = Some(credential);
            Ok(())
        })
    }

    fn invalidate(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            *self.state.write().await = None;
            Ok(())
        })
    }
}

/// Store backed by a JSON file holding a single credential.
///
/// All writes use atomic temp-file + rename. The Mutex serializes writes;
/// reads take it briefly to clone the in-memory copy. The in-memory copy is
/// updated before the file, so `current()` reflects a persisted credential
/// even when the disk write fails.
pub struct FileCredentialStore {
    path: PathBuf,
    state: Mutex<Option<Credential>>,
}

impl FileCredentialStore {
    /// Load the credential file at `path`.
    ///
    /// A missing or blank file is a signed-out session, not an error. The
    /// file is only created once a credential is persisted.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|e| Error::Io(format!("checking credential file: {e}")))?;
        let state = if exists {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            if contents.trim().is_empty() {
                None
            } else {
                let credential: Credential = serde_json::from_str(&contents)
                    .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
                info!(path = %path.display(), issued_at = credential.issued_at, "loaded credential");
                Some(credential)
            }
        } else {
            info!(path = %path.display(), "credential file not found, starting signed out");
            None
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn current(&self) -> Pin<Box<dyn Future<Output = Option<Credential>> + Send + '_>> {
        Box::pin(async move { self.state.lock().await.clone() })
    }

    fn persist(
        &self,
        credential: Credential,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let written = write_atomic(&self.path, &credential).await;
            *state = Some(credential);
            written
        })
    }

    fn invalidate(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            *state = None;
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => {
                    debug!(path = %self.path.display(), "removed credential file");
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::Io(format!("removing credential file: {e}"))),
            }
        })
    }
}

/// Write the credential to a file atomically.
///
/// Writes a temporary file in the same directory, then renames it over the
/// target. Permissions are 0600 since the file holds a bearer token.
async fn write_atomic(path: &Path, credential: &Credential) -> Result<()> {
    let json = serde_json::to_string_pretty(credential)
        .map_err(|e| Error::CredentialParse(format!("serializing credential: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("credential");
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credential");
    Ok(())
}
