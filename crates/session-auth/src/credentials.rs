//! Credential storage for one authenticated session
//!
//! The in-memory snapshot is the source of truth for request-time reads and
//! is guarded by a `std::sync::RwLock` held only long enough to clone, so
//! `get()` never waits on disk. Mutations are serialized by a tokio Mutex and
//! mirrored to a JSON key-value file using atomic temp-file + rename, so a
//! fresh process observes the last written credential.
//!
//! Every login and every clear that removes a session starts a new
//! generation. A writer that read the store earlier (a refresh in flight)
//! uses `set_if_generation`/`clear_if_generation` so its result cannot
//! resurrect a logged-out session or wipe a newer login.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use common::Secret;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::constants::{REFRESH_COOKIE_KEY, TOKEN_KEY, USER_KEY};
use crate::error::{Error, Result};

/// Snapshot of the session credential.
///
/// The client never looks inside either token; expiry is only discovered when
/// the server rejects a request.
#[derive(Debug, Clone, Default)]
pub struct Credential {
    pub access_token: Option<Secret<String>>,
    pub refresh_token: Option<Secret<String>>,
    /// Serialized user profile written at login
    pub user: Option<Value>,
}

impl Credential {
    /// Whether an access token is present.
    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    /// The access token as a plain string, for building the Authorization header.
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_ref().map(|t| t.expose().as_str())
    }

    /// The refresh token as a plain string, for building the refresh cookie.
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_ref().map(|t| t.expose().as_str())
    }

    fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none() && self.user.is_none()
    }

    fn from_entries(entries: &BTreeMap<String, Value>) -> Result<Self> {
        let string_entry = |key: &str| -> Result<Option<Secret<String>>> {
            match entries.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::String(s)) if s.is_empty() => Ok(None),
                Some(Value::String(s)) => Ok(Some(Secret::new(s.clone()))),
                Some(other) => Err(Error::CredentialParse(format!(
                    "{key} must be a string, got {other}"
                ))),
            }
        };

        Ok(Self {
            access_token: string_entry(TOKEN_KEY)?,
            refresh_token: string_entry(REFRESH_COOKIE_KEY)?,
            user: entries.get(USER_KEY).filter(|v| !v.is_null()).cloned(),
        })
    }

    fn to_entries(&self) -> BTreeMap<String, Value> {
        let mut entries = BTreeMap::new();
        if let Some(token) = &self.access_token {
            entries.insert(TOKEN_KEY.to_string(), Value::String(token.expose().clone()));
        }
        if let Some(user) = &self.user {
            entries.insert(USER_KEY.to_string(), user.clone());
        }
        if let Some(refresh) = &self.refresh_token {
            entries.insert(
                REFRESH_COOKIE_KEY.to_string(),
                Value::String(refresh.expose().clone()),
            );
        }
        entries
    }
}

/// Thread-safe credential store for a single session.
pub struct CredentialStore {
    /// `None` keeps the store in memory only.
    path: Option<PathBuf>,
    snapshot: RwLock<Credential>,
    /// Only changed while `write_lock` is held
    generation: AtomicU64,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    /// Load the credential from the given file path.
    ///
    /// If the file doesn't exist it is created as `{}` and the store starts
    /// unauthenticated.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let credential = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let entries: BTreeMap<String, Value> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            let credential = Credential::from_entries(&entries)?;
            info!(
                path = %path.display(),
                authenticated = credential.is_authenticated(),
                "loaded credentials"
            );
            credential
        } else {
            info!(path = %path.display(), "credential file not found, starting unauthenticated");
            write_atomic(&path, &BTreeMap::new()).await?;
            Credential::default()
        };

        Ok(Self {
            path: Some(path),
            snapshot: RwLock::new(credential),
            generation: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            snapshot: RwLock::new(Credential::default()),
            generation: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    /// Current credential snapshot.
    pub fn get(&self) -> Credential {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current session generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Install a fresh session (initial acquisition of both tokens).
    ///
    /// Token and user profile are written together.
    pub async fn login(
        &self,
        access_token: String,
        refresh_token: Option<String>,
        user: Option<Value>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let credential = Credential {
            access_token: Some(Secret::new(access_token)),
            refresh_token: refresh_token.map(Secret::new),
            user,
        };
        let entries = credential.to_entries();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.replace(credential);
        info!("session credentials installed");
        self.persist(&entries).await
    }

    /// Replace the access token, and the refresh token when one is given.
    ///
    /// The user profile is kept and rewritten alongside the token. The new
    /// pair is visible to `get()` before the file write starts; a write
    /// failure is returned but does not roll the in-memory value back.
    pub async fn set(&self, access_token: String, refresh_token: Option<String>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_token(access_token, refresh_token).await
    }

    /// `set`, applied only if no login or clear happened since `generation`
    /// was read.
    ///
    /// Returns `Ok(false)` without writing anything when the session changed.
    /// An `Err` means the new token is in memory but the file write failed.
    pub async fn set_if_generation(
        &self,
        generation: u64,
        access_token: String,
        refresh_token: Option<String>,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        if self.generation() != generation {
            debug!(generation, current = self.generation(), "session changed, token not applied");
            return Ok(false);
        }
        self.write_token(access_token, refresh_token).await?;
        Ok(true)
    }

    /// Remove both tokens and the user profile.
    ///
    /// Calling this on an already empty store does nothing and never fails.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.remove_session().await
    }

    /// `clear`, applied only if no login or clear happened since `generation`
    /// was read. Returns `Ok(false)` when the session changed.
    pub async fn clear_if_generation(&self, generation: u64) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        if self.generation() != generation {
            debug!(generation, current = self.generation(), "session changed, not clearing");
            return Ok(false);
        }
        self.remove_session().await?;
        Ok(true)
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Caller holds `write_lock`.
    async fn write_token(&self, access_token: String, refresh_token: Option<String>) -> Result<()> {
        let mut credential = self.get();
        credential.access_token = Some(Secret::new(access_token));
        if let Some(refresh) = refresh_token {
            credential.refresh_token = Some(Secret::new(refresh));
        }
        let entries = credential.to_entries();
        self.replace(credential);
        debug!("updated access token");
        self.persist(&entries).await
    }

    /// Caller holds `write_lock`.
    async fn remove_session(&self) -> Result<()> {
        if self.get().is_empty() {
            return Ok(());
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.replace(Credential::default());
        info!("session credentials cleared");
        self.persist(&BTreeMap::new()).await
    }

    fn replace(&self, credential: Credential) {
        *self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = credential;
    }

    async fn persist(&self, entries: &BTreeMap<String, Value>) -> Result<()> {
        match &self.path {
            Some(path) => write_atomic(path, entries).await,
            None => Ok(()),
        }
    }
}

/// Temp file next to `path`, unique per target file and per write.
fn temp_path_for(path: &Path) -> Result<PathBuf> {
    static SEQ: AtomicU64 = AtomicU64::new(0);

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;
    let name = path
        .file_name()
        .ok_or_else(|| Error::Io("credential path has no file name".into()))?
        .to_string_lossy();
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    Ok(dir.join(format!(".{name}.{}.{seq}.tmp", std::process::id())))
}

/// Write the key-value map to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Permissions are 0600 since the file holds tokens.
async fn write_atomic(path: &Path, entries: &BTreeMap<String, Value>) -> Result<()> {
    let json = serde_json::to_string_pretty(entries)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let tmp_path = temp_path_for(path)?;

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

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}
