use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::AuthError;

/// Authenticated handle for the remote service.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    scopes: Vec<String>,
}

impl Session {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
            scopes: Vec::new(),
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Single-assignment slot holding the current session.
///
/// Readers take an `Arc` snapshot; re-authentication swaps the whole value.
#[derive(Clone, Default)]
pub struct SessionCell {
    inner: Arc<RwLock<Option<Arc<Session>>>>,
}

impl SessionCell {
    pub fn new(session: Option<Session>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(session.map(Arc::new))),
        }
    }

    pub fn current(&self) -> Option<Arc<Session>> {
        self.inner.read().clone()
    }

    pub fn is_present(&self) -> bool {
        self.inner.read().is_some()
    }

    /// Installs `session`, returning the handle it replaced.
    pub fn replace(&self, session: Session) -> Option<Arc<Session>> {
        self.inner.write().replace(Arc::new(session))
    }

    pub fn clear(&self) -> Option<Arc<Session>> {
        self.inner.write().take()
    }
}

impl fmt::Debug for SessionCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCell")
            .field("present", &self.is_present())
            .finish()
    }
}

/// JSON file holding the last session so a restart does not require a login.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<Session>, AuthError> {
        if !self.path.exists() {
            debug!("no saved credentials at {:?}", self.path);
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path).map_err(|source| AuthError::CredentialsIo {
            path: self.path.clone(),
            source,
        })?;
        let session =
            serde_json::from_str::<Session>(&content).map_err(|source| AuthError::Credentials {
                path: self.path.clone(),
                source,
            })?;
        info!("loaded saved credentials from {:?}", self.path);
        Ok(Some(session))
    }

    pub fn save(&self, session: &Session) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| AuthError::CredentialsIo {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let serialized =
            serde_json::to_string_pretty(session).map_err(|source| AuthError::Credentials {
                path: self.path.clone(),
                source,
            })?;
        fs::write(&self.path, serialized).map_err(|source| AuthError::CredentialsIo {
            path: self.path.clone(),
            source,
        })
    }

    pub fn remove(&self) -> Result<(), AuthError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(AuthError::CredentialsIo {
                path: self.path.clone(),
                source,
            }),
        }
    }
}
