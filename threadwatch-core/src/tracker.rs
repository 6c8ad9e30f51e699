//! The tracker facade: one handle over the store, the session and the
//! refresh machinery, with the calls a front end needs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use threadwatch_fetch::release::{AvailableUpdate, RunningBuild};
use threadwatch_fetch::{ClientConfig, ResilientClient, SessionContext};
use tokio::sync::broadcast;
use tracing::{info, instrument};

use crate::diagnostics::Diagnostics;
use crate::entity::{Entity, EntityId};
use crate::error::{RefreshError, SessionError, StoreError};
use crate::events::{EventBus, RefreshEvent};
use crate::images::ImageStore;
use crate::import::{self, ThreadMatch};
use crate::notifs::{self, NotifCounts};
use crate::parser::{ParseDispatcher, Parser};
use crate::refresh::{RefreshOrchestrator, RefreshRun, RefreshServices};
use crate::session::{BrowserLogin, SessionGuard};
use crate::settings::Settings;
use crate::site::Site;
use crate::store::Store;
use crate::updates;

#[derive(Debug, Clone)]
pub struct TrackerOptions {
    pub site: Site,
    /// Holds `images/` and the diagnostic dumps.
    pub data_dir: PathBuf,
    /// Version of the running application.
    pub app_version: String,
    pub parser_workers: usize,
}

pub struct Tracker<S, L> {
    refresh: RefreshOrchestrator<S, L>,
}

impl<S, L> Clone for Tracker<S, L> {
    fn clone(&self) -> Self {
        Self {
            refresh: self.refresh.clone(),
        }
    }
}

impl<S: Store, L: BrowserLogin> Tracker<S, L> {
    /// Wire everything up from the stored settings and cookies.
    ///
    /// Must be called inside a tokio runtime; the parser pool is spawned here.
    pub async fn open<P: Parser>(
        store: S,
        login: L,
        parser: P,
        options: TrackerOptions,
    ) -> Result<Self, RefreshError> {
        let settings = Settings::load(&store).await?;
        let session = SessionContext::new(store.load_cookies().await?);
        let client = ResilientClient::new(
            ClientConfig {
                timeout: settings.request_timeout,
                max_retries: settings.max_retries,
                challenge: options.site.challenge.clone(),
                ..ClientConfig::default()
            },
            session,
        )?;

        let store = Arc::new(store);
        let diagnostics = Diagnostics::new(&options.data_dir);
        let session = SessionGuard::new(
            client.clone(),
            options.site.check_login_page.clone(),
            options.site.login_page.clone(),
            login,
            Arc::clone(&store),
            diagnostics.clone(),
        );
        let parser = ParseDispatcher::start(parser, options.parser_workers);
        info!(
            domain = %options.site.domain,
            data_dir = %options.data_dir.display(),
            "tracker opened"
        );

        Ok(Self {
            refresh: RefreshOrchestrator::new(RefreshServices {
                client,
                store,
                session,
                parser,
                images: ImageStore::new(options.data_dir.join("images")),
                diagnostics,
                events: EventBus::new(),
                app_version: options.app_version,
                site: options.site,
            }),
        })
    }

    fn services(&self) -> &RefreshServices<S, L> {
        self.refresh.services()
    }

    pub fn client(&self) -> &ResilientClient {
        &self.services().client
    }

    pub fn site(&self) -> &Site {
        &self.services().site
    }

    pub fn images(&self) -> &ImageStore {
        &self.services().images
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
        self.services().events.subscribe()
    }

    pub async fn list(&self) -> Result<Vec<Entity>, StoreError> {
        self.services().store.load_entities().await
    }

    /// Track every thread referenced in `text`. Already tracked ids are
    /// skipped; the new entities are returned.
    pub async fn add(&self, text: &str) -> Result<Vec<Entity>, StoreError> {
        self.add_matches(import::extract_thread_matches(text)).await
    }

    /// Track the threads referenced by a shortcut, bookmarks export or text file.
    pub async fn import_file(&self, path: &Path) -> Result<Vec<Entity>, RefreshError> {
        let matches = import::from_file(path).await?;
        Ok(self.add_matches(matches).await?)
    }

    async fn add_matches(&self, matches: Vec<ThreadMatch>) -> Result<Vec<Entity>, StoreError> {
        let store = &self.services().store;
        let mut added = Vec::new();
        for thread in matches {
            if store.get_entity(thread.id).await?.is_some() {
                continue;
            }
            let url = import::clean_thread_url(&self.site().threads_page, &thread);
            let entity = Entity::new(thread.id, url, Utc::now());
            store.upsert_entity(&entity).await?;
            info!(id = entity.id, url = %entity.url, "thread added");
            added.push(entity);
        }
        Ok(added)
    }

    /// Stop tracking `id` and delete its local image. `false` if it was not
    /// tracked.
    pub async fn remove(&self, id: EntityId) -> Result<bool, RefreshError> {
        let removed = self.services().store.delete_entity(id).await?;
        if removed {
            self.images().remove(id).await?;
            info!(id, "thread removed");
        }
        Ok(removed)
    }

    /// Clear the `updated` flag. `false` if `id` is not tracked.
    pub async fn acknowledge(&self, id: EntityId) -> Result<bool, StoreError> {
        let store = &self.services().store;
        let Some(mut entity) = store.get_entity(id).await? else {
            return Ok(false);
        };
        if entity.updated {
            entity.updated = false;
            store.upsert_entity(&entity).await?;
        }
        Ok(true)
    }

    /// Refresh every tracked thread.
    #[instrument(skip(self))]
    pub async fn refresh(&self, full: bool) -> Result<RefreshRun, RefreshError> {
        let entities = self.list().await?;
        self.refresh.run(entities, full).await
    }

    /// Ask a running refresh to stop. `false` if none is running.
    pub fn cancel(&self) -> bool {
        self.refresh.cancel()
    }

    /// Count unread alerts and conversations, logging in first if needed.
    pub async fn check_notifs(&self) -> Result<NotifCounts, RefreshError> {
        let services = self.services();
        if !services.session.ensure().await? {
            return Err(SessionError::LoginRejected.into());
        }
        notifs::check(&services.client, &services.site.notif_endpoint, &services.diagnostics).await
    }

    pub async fn check_update(
        &self,
        build: &RunningBuild,
        install_dir: &Path,
    ) -> Result<Option<AvailableUpdate>, RefreshError> {
        let services = self.services();
        updates::check_for_update(
            &services.client,
            &services.site.update_endpoint,
            build,
            install_dir,
            &services.diagnostics,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use threadwatch_fetch::CookieMap;

    use super::*;
    use crate::parser::{ParseFailure, ParsedFields};
    use crate::store::MemoryStore;

    struct NoBrowser;

    impl BrowserLogin for NoBrowser {
        async fn login(&self, _login_page: &str) -> Result<CookieMap, SessionError> {
            Err(SessionError::LoginHelper("no browser here".into()))
        }
    }

    struct NoParser;

    impl Parser for NoParser {
        async fn parse(&self, _id: EntityId, _raw: Bytes) -> Result<ParsedFields, ParseFailure> {
            Err(ParseFailure::Internal("not used".into()))
        }
    }

    async fn open(store: MemoryStore, dir: &Path) -> Tracker<MemoryStore, NoBrowser> {
        Tracker::open(
            store,
            NoBrowser,
            NoParser,
            TrackerOptions {
                site: Site::default(),
                data_dir: dir.to_path_buf(),
                app_version: "11.0".into(),
                parser_workers: 1,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn stored_settings_and_cookies_reach_the_client() {
        let store = MemoryStore::new();
        store.set_setting(crate::settings::REQUEST_TIMEOUT, "7").await.unwrap();
        store
            .save_cookies(&CookieMap::from([("xf_user".to_owned(), "1".to_owned())]))
            .await
            .unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let tracker = open(store, tmp.path()).await;

        assert_eq!(tracker.client().config().timeout, Duration::from_secs(7));
        assert_eq!(tracker.client().session().base_cookies()["xf_user"], "1");
    }

    #[tokio::test]
    async fn add_skips_known_threads() {
        let tmp = tempfile::tempdir().unwrap();
        let tracker = open(MemoryStore::new(), tmp.path()).await;

        let added = tracker
            .add("https://f95zone.to/threads/some-game.12/ https://f95zone.to/threads/34/")
            .await
            .unwrap();
        assert_eq!(added.len(), 2);
        assert_eq!(added[0].url, "https://f95zone.to/threads/some-game.12/");
        assert_eq!(added[0].status, crate::entity::Status::Unchecked);

        let again = tracker.add("threads/some-game.12/ threads/other.56/").await.unwrap();
        assert_eq!(again.iter().map(|e| e.id).collect::<Vec<_>>(), vec![56]);
        assert_eq!(tracker.list().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn remove_deletes_the_image_too() {
        let tmp = tempfile::tempdir().unwrap();
        let tracker = open(MemoryStore::new(), tmp.path()).await;
        tracker.add("threads/9/").await.unwrap();
        tracker.images().replace(9, Some(b"GIF89a....")).await.unwrap();
        assert!(!tracker.images().missing(9).await.unwrap());

        assert!(tracker.remove(9).await.unwrap());
        assert!(tracker.images().missing(9).await.unwrap());
        assert!(!tracker.remove(9).await.unwrap());
    }

    #[tokio::test]
    async fn acknowledge_clears_updated() {
        let mut entity = Entity::new(5, "https://f95zone.to/threads/5/", Utc::now());
        entity.updated = true;
        let store = MemoryStore::with_entities([entity]);
        let tmp = tempfile::tempdir().unwrap();
        let tracker = open(store.clone(), tmp.path()).await;

        assert!(tracker.acknowledge(5).await.unwrap());
        assert!(!store.get_entity(5).await.unwrap().unwrap().updated);
        assert!(!tracker.acknowledge(6).await.unwrap());
        assert!(!tracker.cancel());
    }
}
