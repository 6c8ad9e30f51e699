//! Self-update check around the release channel.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use threadwatch_fetch::release::{self, AvailableUpdate, RunningBuild};
use threadwatch_fetch::{FetchError, ResilientClient};
use tracing::{info, warn};

use crate::diagnostics::{self, Diagnostics};
use crate::error::RefreshError;

/// Look for a newer release.
///
/// Returns `Ok(None)` when running from a git checkout, when the channel
/// has no usable answer right now, or when nothing newer applies.
pub async fn check_for_update(
    client: &ResilientClient,
    endpoint: &str,
    build: &RunningBuild,
    install_dir: &Path,
    diagnostics: &Diagnostics,
) -> Result<Option<AvailableUpdate>, RefreshError> {
    if install_dir.join(".git").is_dir() {
        info!(dir = %install_dir.display(), "running from a git checkout, skipping update check");
        return Ok(None);
    }

    let (raw, parsed) = release::fetch_latest(client, endpoint).await?;
    let latest = match parsed {
        Ok(latest) => latest,
        Err(FetchError::InvalidResponse { message }) => {
            warn!(%message, "release information unavailable, this might be temporary");
            return Ok(None);
        }
        Err(e) => {
            let dump = diagnostics.try_dump(diagnostics::UPDATE_BROKEN, &raw).await;
            return Err(RefreshError::Update {
                message: e.to_string(),
                dump,
            });
        }
    };

    let update = release::evaluate(&latest, build);
    match &update {
        Some(update) => info!(version = %update.version, asset = %update.asset.name, "update available"),
        None => info!(latest = %latest.tag_name, current = %build.version, "up to date"),
    }
    Ok(update)
}

/// Download `update` and unpack it into `dest`.
pub async fn download_update(
    client: &ResilientClient,
    update: &AvailableUpdate,
    dest: &Path,
    cancel: &AtomicBool,
    progress: impl FnMut(u64, u64),
) -> Result<Vec<PathBuf>, RefreshError> {
    let data = release::download_asset(client, update, cancel, progress).await?;
    let files = release::extract_zip(&data, dest, cancel)?;
    info!(files = files.len(), dest = %dest.display(), "update extracted");
    Ok(files)
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::routing::get;
    use threadwatch_fetch::{ClientConfig, SessionContext};

    use super::*;
    use crate::testing::serve;

    fn build() -> RunningBuild {
        RunningBuild {
            version: "1.0".into(),
            is_release: true,
            asset_kind: "linux".into(),
        }
    }

    fn client() -> ResilientClient {
        ResilientClient::new(ClientConfig::default(), SessionContext::default()).unwrap()
    }

    #[tokio::test]
    async fn git_checkout_skips_the_network() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join(".git")).unwrap();
        let update = check_for_update(
            &client(),
            "http://127.0.0.1:9/never",
            &build(),
            tmp.path(),
            &Diagnostics::new(tmp.path()),
        )
        .await
        .unwrap();
        assert!(update.is_none());
    }

    #[tokio::test]
    async fn newer_release_is_found_and_garbage_is_dumped() {
        let app = Router::new()
            .route(
                "/latest",
                get(|| async {
                    r#"{"tag_name":"1.2","prerelease":false,"body":"x\n## 🚀 Changelog\n- new",
                        "assets":[{"name":"tw-linux.zip","browser_download_url":"http://x/tw.zip","size":5}]}"#
                }),
            )
            .route("/broken", get(|| async { "<html>rate limited</html>" }))
            .route("/empty", get(|| async { r#"{"message":"Not Found"}"# }));
        let base = serve(app).await;
        let tmp = tempfile::tempdir().unwrap();
        let diagnostics = Diagnostics::new(tmp.path().join("diag"));

        let update = check_for_update(&client(), &format!("{base}/latest"), &build(), tmp.path(), &diagnostics)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.version, "1.2");
        assert_eq!(update.changelog, "- new");

        let none = check_for_update(&client(), &format!("{base}/empty"), &build(), tmp.path(), &diagnostics)
            .await
            .unwrap();
        assert!(none.is_none());

        let err = check_for_update(&client(), &format!("{base}/broken"), &build(), tmp.path(), &diagnostics)
            .await
            .unwrap_err();
        assert!(matches!(err, RefreshError::Update { dump: Some(_), .. }));
        assert!(tmp.path().join("diag/update_broken.bin").exists());
    }
}
