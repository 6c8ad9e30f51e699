use std::path::PathBuf;

use thiserror::Error;
use threadwatch_fetch::FetchError;

use crate::entity::EntityId;

/// Errors produced by a [`Store`](crate::store::Store) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("corrupt stored value for {field}: {message}")]
    Corrupt { field: String, message: String },
}

impl StoreError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        StoreError::Backend(Box::new(err))
    }
}

/// Errors from the login/session lifecycle.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("login session expired")]
    LoginExpired,

    #[error("upstream is running maintenance, retry in a few minutes")]
    Maintenance,

    #[error("unexpected HTTP {status} checking the login session at {url} (body saved to {})", dump.display())]
    Assertion {
        status: u16,
        url: String,
        dump: PathBuf,
    },

    #[error("login helper failed: {0}")]
    LoginHelper(String),

    #[error("still not logged in after a fresh login")]
    LoginRejected,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by a refresh run and the tracker operations around it.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("unexpected redirect checking {id}: landed on {location}")]
    Redirect { id: EntityId, location: String },

    #[error("parser timed out on {id}")]
    ParseTimeout { id: EntityId },

    #[error("thread {id} is gone (HTTP {status})")]
    RemoteNotFound { id: EntityId, status: u16 },

    #[error("failed to parse thread {id}: {message}")]
    Parse {
        id: EntityId,
        message: String,
        dump: Option<PathBuf>,
    },

    #[error("notifications check failed: {message}")]
    Notifications {
        message: String,
        dump: Option<PathBuf>,
    },

    #[error("update check failed: {message}")]
    Update {
        message: String,
        dump: Option<PathBuf>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("refresh cancelled")]
    Cancelled,

    #[error("worker task failed: {0}")]
    Worker(String),
}

impl RefreshError {
    /// Soft failures are recorded per entity and do not stop the run.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            RefreshError::ParseTimeout { .. } | RefreshError::RemoteNotFound { .. }
        )
    }
}
