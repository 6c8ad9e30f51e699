//! Raw response dumps for responses that should never happen.

use std::path::PathBuf;

use tracing::warn;

use crate::entity::EntityId;

pub const LOGIN_BROKEN: &str = "login_broken.bin";
pub const NOTIFS_BROKEN: &str = "notifs_broken.bin";
pub const UPDATE_BROKEN: &str = "update_broken.bin";

pub fn thread_broken(id: EntityId) -> String {
    format!("{id}_broken.html")
}

#[derive(Debug, Clone)]
pub struct Diagnostics {
    dir: PathBuf,
}

impl Diagnostics {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Write `raw` to `<dir>/<name>`, replacing any previous dump.
    pub async fn dump(&self, name: &str, raw: &[u8]) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(name);
        tokio::fs::write(&path, raw).await?;
        warn!(path = %path.display(), bytes = raw.len(), "response body saved for diagnosis");
        Ok(path)
    }

    /// Like [`Self::dump`] but never fails; the error is logged instead.
    pub async fn try_dump(&self, name: &str, raw: &[u8]) -> Option<PathBuf> {
        match self.dump(name, raw).await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(name, error = %e, "could not save diagnostic dump");
                None
            }
        }
    }
}
