//! Local identity cache
//!
//! Holds the last known user profile so a client can render optimistically
//! before the server confirms the session. Never holds tokens; the session
//! itself lives in the HTTP-only cookie.

use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

use crate::identity::User;
use crate::types::CasebookError;

pub trait IdentityCache: Send + Sync {
    /// Synchronous read; may be stale
    fn load(&self) -> Option<User>;

    fn store(&self, user: &User) -> Result<(), CasebookError>;

    fn clear(&self);
}

/// JSON file on disk
pub struct FileIdentityCache {
    path: PathBuf,
}

impl FileIdentityCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl IdentityCache for FileIdentityCache {
    fn load(&self) -> Option<User> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Discarding unreadable identity cache");
                self.clear();
                None
            }
        }
    }

    fn store(&self, user: &User) -> Result<(), CasebookError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(user)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to clear identity cache");
            }
        }
    }
}

/// In-process cache
#[derive(Default)]
pub struct MemoryIdentityCache {
    user: Mutex<Option<User>>,
}

impl MemoryIdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(user: User) -> Self {
        Self {
            user: Mutex::new(Some(user)),
        }
    }
}

impl IdentityCache for MemoryIdentityCache {
    fn load(&self) -> Option<User> {
        self.user.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn store(&self, user: &User) -> Result<(), CasebookError> {
        *self.user.lock().unwrap_or_else(|e| e.into_inner()) = Some(user.clone());
        Ok(())
    }

    fn clear(&self) {
        *self.user.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}
