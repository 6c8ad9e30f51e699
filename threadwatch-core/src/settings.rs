//! User settings kept in the store's key/value table.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::store::Store;

pub const REQUEST_TIMEOUT: &str = "request_timeout";
pub const MAX_RETRIES: &str = "max_retries";
pub const REFRESH_WORKERS: &str = "refresh_workers";
pub const IMAGE_WORKER_DIVISOR: &str = "image_worker_divisor";
pub const REFRESH_COMPLETED: &str = "refresh_completed";
pub const KEEP_IMAGE_ON_UPDATE: &str = "keep_image_on_update";
pub const CHECK_NOTIFS: &str = "check_notifs";
pub const LAST_REFRESH: &str = "last_refresh";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub request_timeout: Duration,
    /// Extra attempts after the first on network failures.
    pub max_retries: u32,
    pub refresh_workers: usize,
    pub image_worker_divisor: usize,
    pub refresh_completed: bool,
    pub keep_image_on_update: bool,
    pub check_notifs: bool,
    pub last_refresh: Option<DateTime<Utc>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_retries: 2,
            refresh_workers: 20,
            image_worker_divisor: 10,
            refresh_completed: true,
            keep_image_on_update: false,
            check_notifs: true,
            last_refresh: None,
        }
    }
}

impl Settings {
    /// Read every setting, falling back to the default for missing keys.
    pub async fn load(store: &impl Store) -> Result<Self, StoreError> {
        let defaults = Self::default();
        let timeout_secs = parse(store, REQUEST_TIMEOUT, defaults.request_timeout.as_secs()).await?;
        let last_refresh: Option<i64> = match store.get_setting(LAST_REFRESH).await? {
            Some(raw) => Some(parse_value(LAST_REFRESH, &raw)?),
            None => None,
        };
        Ok(Self {
            request_timeout: Duration::from_secs(timeout_secs.max(1)),
            max_retries: parse(store, MAX_RETRIES, defaults.max_retries).await?,
            refresh_workers: parse(store, REFRESH_WORKERS, defaults.refresh_workers)
                .await?
                .max(1),
            image_worker_divisor: parse(store, IMAGE_WORKER_DIVISOR, defaults.image_worker_divisor)
                .await?
                .max(1),
            refresh_completed: parse(store, REFRESH_COMPLETED, defaults.refresh_completed).await?,
            keep_image_on_update: parse(store, KEEP_IMAGE_ON_UPDATE, defaults.keep_image_on_update)
                .await?,
            check_notifs: parse(store, CHECK_NOTIFS, defaults.check_notifs).await?,
            last_refresh: last_refresh.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        })
    }

    /// Capacity of the image gate for the configured worker count.
    pub fn image_slots(&self) -> usize {
        (self.refresh_workers / self.image_worker_divisor).max(1)
    }
}

async fn parse<T>(store: &impl Store, key: &str, default: T) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match store.get_setting(key).await? {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| StoreError::Corrupt {
        field: key.to_owned(),
        message: format!("{raw:?}: {e}"),
    })
}
