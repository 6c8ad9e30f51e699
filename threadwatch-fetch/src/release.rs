//! Self-update channel: release metadata, asset download and extraction.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use reqwest::Method;
use serde::Deserialize;
use tracing::info;

use crate::client::{FetchOptions, ResilientClient};
use crate::error::FetchError;
use crate::version;

const CHANGELOG_HEADING: &str = "## 🚀 Changelog";
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(3600);

/// A single downloadable asset attached to a release.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
    pub size: u64,
}

/// The subset of the release metadata document we consume.
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
    #[serde(default)]
    pub body: String,
}

impl Release {
    pub fn parse(raw: &[u8]) -> Result<Self, FetchError> {
        let value: serde_json::Value = serde_json::from_slice(raw)?;
        if value.get("tag_name").is_none() {
            return Err(FetchError::InvalidResponse {
                message: "release metadata has no tag_name".to_owned(),
            });
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// What the running build is, for deciding whether a release applies.
#[derive(Debug, Clone)]
pub struct RunningBuild {
    pub version: String,
    /// `false` for beta builds, which are offered the release even at the
    /// same version number.
    pub is_release: bool,
    /// Substring that selects the asset, e.g. `"linux"` or `"source"`.
    pub asset_kind: String,
}

/// An update that can be installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableUpdate {
    pub version: String,
    pub asset: ReleaseAsset,
    pub changelog: String,
}

/// Decide whether `release` is an update for `build`.
pub fn evaluate(release: &Release, build: &RunningBuild) -> Option<AvailableUpdate> {
    if release.prerelease {
        return None;
    }
    let ordering = version::compare(&release.tag_name, &build.version);
    let available = match ordering {
        std::cmp::Ordering::Equal => !build.is_release,
        other => other.is_gt(),
    };
    if !available {
        return None;
    }

    let kind = build.asset_kind.to_lowercase();
    let asset = release
        .assets
        .iter()
        .find(|asset| asset.name.to_lowercase().contains(&kind))?
        .clone();
    if asset.browser_download_url.is_empty() || asset.size == 0 {
        return None;
    }

    let body = release.body.trim_matches('\n');
    let changelog = match body.find(CHANGELOG_HEADING) {
        Some(at) => body[at + CHANGELOG_HEADING.len()..].trim().to_owned(),
        None => body.to_owned(),
    };

    Some(AvailableUpdate {
        version: release.tag_name.clone(),
        asset,
        changelog,
    })
}

/// Fetch the release metadata document from `endpoint`.
///
/// Returns the raw body alongside the parse result so callers can keep it
/// for diagnostics.
pub async fn fetch_latest(
    client: &ResilientClient,
    endpoint: &str,
) -> Result<(bytes::Bytes, Result<Release, FetchError>), FetchError> {
    let (raw, meta) = client
        .fetch(
            Method::GET,
            endpoint,
            FetchOptions::default().header("Accept", "application/vnd.github+json"),
        )
        .await?;
    if !meta.is_success() {
        let parsed = Err(FetchError::Status {
            status: meta.status.as_u16(),
            url: endpoint.to_owned(),
        });
        return Ok((raw, parsed));
    }
    let parsed = Release::parse(&raw);
    Ok((raw, parsed))
}

/// Download `update` into memory, reporting `(received, total)` as it goes.
///
/// Checks `cancel` between chunks.
pub async fn download_asset(
    client: &ResilientClient,
    update: &AvailableUpdate,
    cancel: &AtomicBool,
    mut progress: impl FnMut(u64, u64),
) -> Result<Vec<u8>, FetchError> {
    let url = &update.asset.browser_download_url;
    let response = client
        .open(
            Method::GET,
            url,
            FetchOptions::default().timeout(DOWNLOAD_TIMEOUT),
        )
        .await?;
    if !response.status().is_success() {
        return Err(FetchError::Status {
            status: response.status().as_u16(),
            url: url.clone(),
        });
    }

    let total = update.asset.size;
    let mut data = Vec::with_capacity(usize::try_from(total).unwrap_or(0));
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if cancel.load(Ordering::Relaxed) {
            return Err(FetchError::Cancelled);
        }
        let chunk = chunk.map_err(|e| FetchError::from_reqwest(url, e))?;
        data.extend_from_slice(&chunk);
        progress(data.len() as u64, total);
    }
    info!(asset = %update.asset.name, bytes = data.len(), "update asset downloaded");
    Ok(data)
}

/// Extract a ZIP archive into `dest`, keeping unix permissions.
///
/// Returns the extracted file paths.
pub fn extract_zip(
    bytes: &[u8],
    dest: &Path,
    cancel: &AtomicBool,
) -> Result<Vec<PathBuf>, FetchError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let mut extracted = Vec::with_capacity(archive.len());

    for i in 0..archive.len() {
        if cancel.load(Ordering::Relaxed) {
            std::fs::remove_dir_all(dest).ok();
            return Err(FetchError::Cancelled);
        }
        let mut file = archive.by_index(i)?;
        let Some(rel_path) = file.enclosed_name() else {
            continue;
        };
        let dest_path = dest.join(rel_path);

        if file.is_dir() {
            std::fs::create_dir_all(&dest_path)?;
            continue;
        }
        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&dest_path)?;
        std::io::copy(&mut file, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dest_path, std::fs::Permissions::from_mode(mode))?;
        }
        extracted.push(dest_path);
    }

    Ok(extracted)
}
