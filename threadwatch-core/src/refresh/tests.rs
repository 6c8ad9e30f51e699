use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{Method as HttpMethod, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use bytes::Bytes;
use threadwatch_fetch::{ClientConfig, CookieMap, ResilientClient, SessionContext};

use super::*;
use crate::entity::{EntityId, Status};
use crate::error::SessionError;
use crate::parser::{ParseFailure, ParsedFields, Parser};
use crate::session::BrowserLogin;
use crate::store::MemoryStore;
use crate::testing::serve;

const LOGGED_IN: &str = r#"<html><input type="hidden" name="_xfToken" value="tok" />"#;

struct NoBrowser;

impl BrowserLogin for NoBrowser {
    async fn login(&self, _login_page: &str) -> Result<CookieMap, SessionError> {
        Err(SessionError::LoginHelper("no browser here".into()))
    }
}

/// Thread pages in these tests are the parsed fields as JSON.
struct JsonParser;

/// Pages of this thread take longer to parse than any request timeout used here.
const SLOW_TO_PARSE: EntityId = 900;

impl Parser for JsonParser {
    async fn parse(&self, id: EntityId, raw: Bytes) -> Result<ParsedFields, ParseFailure> {
        if id == SLOW_TO_PARSE {
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
        serde_json::from_slice(&raw).map_err(|e| ParseFailure::Malformed(e.to_string()))
    }
}

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

#[derive(Clone, Default)]
struct Upstream {
    heads: Arc<AtomicUsize>,
    gets: Arc<AtomicUsize>,
    /// Thread slugs fetched with GET, in order.
    fetched: Arc<Mutex<Vec<String>>>,
    /// Root URL of the server, known once it is listening.
    base: Arc<Mutex<String>>,
    images_served: Arc<AtomicUsize>,
    images_in_flight: Arc<AtomicUsize>,
    images_peak: Arc<AtomicUsize>,
}

fn page(id: &str, version: &str) -> String {
    page_with_image(id, version, r#"{"kind":"absent"}"#)
}

fn page_with_image(id: &str, version: &str, image: &str) -> String {
    format!(
        r#"{{"name":"Game {id}","version":"{version}","status":"Normal",
            "url":"/threads/game.{id}/","image_url":{image}}}"#
    )
}

/// Threads 50 to 59 have a cover served by this server; thread 60's cover
/// lives on a host that does not exist.
fn image_for(base: &str, id: &str) -> Option<String> {
    match id.parse::<EntityId>().ok()? {
        50..=59 => Some(format!(r#"{{"kind":"remote","url":"{base}/img/{id}.png"}}"#)),
        60 => Some(r#"{"kind":"remote","url":"http://dead-host.invalid/60.png"}"#.to_owned()),
        _ => None,
    }
}

async fn image(State(up): State<Upstream>) -> &'static [u8] {
    let in_flight = up.images_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    up.images_peak.fetch_max(in_flight, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    up.images_in_flight.fetch_sub(1, Ordering::SeqCst);
    up.images_served.fetch_add(1, Ordering::SeqCst);
    PNG_MAGIC
}

async fn thread(State(up): State<Upstream>, method: HttpMethod, Path(slug): Path<String>) -> Response {
    if method == HttpMethod::HEAD {
        up.heads.fetch_add(1, Ordering::SeqCst);
    } else {
        up.gets.fetch_add(1, Ordering::SeqCst);
        up.fetched.lock().unwrap().push(slug.clone());
    }
    let id = slug.rsplit('.').next().unwrap_or_default().to_owned();
    let base = up.base.lock().unwrap().clone();
    if let Some(image) = image_for(&base, &id) {
        return page_with_image(&id, "1.0", &image).into_response();
    }
    match slug.as_str() {
        "game.404" => (StatusCode::NOT_FOUND, "gone").into_response(),
        "game.301" => Redirect::temporary("/threads/renamed.301/").into_response(),
        "game.302" => Redirect::temporary("/somewhere-else/").into_response(),
        "game.500" => "this is not json".into_response(),
        "game.800" => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            page(&id, "1.0").into_response()
        }
        "game.7" => page(&id, "2.0").into_response(),
        _ => page(&id, "1.0").into_response(),
    }
}

async fn upstream() -> (String, Upstream) {
    let up = Upstream::default();
    let app = Router::new()
        .route("/account/security", get(|| async { LOGGED_IN }))
        .route("/somewhere-else/", get(|| async { "hello" }))
        .route(
            "/conversations/popup",
            get(|| async { r#"{"visitor":{"alerts_unread":1,"conversations_unread":2}}"# }),
        )
        .route("/threads/{slug}/", get(thread))
        .route("/img/{file}", get(image))
        .with_state(up.clone());
    let base = serve(app).await;
    *up.base.lock().unwrap() = base.clone();
    (base, up)
}

struct Harness {
    orchestrator: RefreshOrchestrator<MemoryStore, NoBrowser>,
    store: Arc<MemoryStore>,
    images: ImageStore,
    _tmp: tempfile::TempDir,
}

async fn harness(base: &str, overrides: &[(&str, &str)]) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    for (key, value) in overrides {
        store.set_setting(key, value).await.unwrap();
    }
    let site = Site::new(base).unwrap();
    let client = ResilientClient::new(ClientConfig::default(), SessionContext::default()).unwrap();
    let diagnostics = Diagnostics::new(tmp.path().join("diag"));
    let session = SessionGuard::new(
        client.clone(),
        site.check_login_page.clone(),
        site.login_page.clone(),
        NoBrowser,
        Arc::clone(&store),
        diagnostics.clone(),
    );
    let images = ImageStore::new(tmp.path().join("images"));
    let orchestrator = RefreshOrchestrator::new(RefreshServices {
        client,
        site,
        store: Arc::clone(&store),
        session,
        parser: ParseDispatcher::start(JsonParser, 2),
        images: images.clone(),
        diagnostics,
        events: EventBus::new(),
        app_version: "11.0".into(),
    });
    Harness {
        orchestrator,
        store,
        images,
        _tmp: tmp,
    }
}

/// A recently checked entity whose stored fields match `page(id, "1.0")`.
fn tracked(base: &str, id: EntityId) -> Entity {
    let mut entity = Entity::new(id, format!("{base}/threads/game.{id}/"), Utc::now());
    entity.name = format!("Game {id}");
    entity.version = "1.0".into();
    entity.status = Status::Normal;
    entity.last_full_refresh = Some(Utc::now());
    entity.last_refresh_version = "11.0".into();
    entity.image_url = ImageRef::Absent;
    entity
}

const QUIET: &[(&str, &str)] = &[(settings::CHECK_NOTIFS, "false")];

#[tokio::test]
async fn unchanged_threads_cost_one_head_and_no_writes() {
    let (base, up) = upstream().await;
    let h = harness(&base, QUIET).await;
    let entities: Vec<_> = (1..=3).map(|id| tracked(&base, id)).collect();

    let run = h.orchestrator.run(entities, false).await.unwrap();
    assert_eq!((run.total, run.completed, run.committed), (3, 3, 0));
    assert_eq!(up.heads.load(Ordering::SeqCst), 3);
    assert_eq!(up.gets.load(Ordering::SeqCst), 0);
    assert_eq!(h.store.entity_writes(), 0);
    assert!(run.changes.is_empty());
}

#[tokio::test]
async fn every_entity_is_fetched_exactly_once() {
    let (base, up) = upstream().await;
    let h = harness(&base, &[(settings::CHECK_NOTIFS, "false"), (settings::REFRESH_WORKERS, "4")]).await;
    let entities: Vec<_> = (1..=25).map(|id| tracked(&base, id)).collect();

    let run = h.orchestrator.run(entities, true).await.unwrap();
    assert_eq!(run.completed, 25);
    assert_eq!(run.committed, 25);
    let fetched = up.fetched.lock().unwrap().clone();
    assert_eq!(fetched.len(), 25);
    assert_eq!(fetched.iter().collect::<HashSet<_>>().len(), 25);
    assert_eq!(h.store.entity_writes(), 25);

    let stored = h.store.get_entity(3).await.unwrap().unwrap();
    assert_eq!(stored.last_refresh_version, "11.0");
    assert!(!stored.updated);
}

#[tokio::test]
async fn version_change_is_reported_with_old_values() {
    let (base, _) = upstream().await;
    let h = harness(&base, QUIET).await;
    let mut events = h.orchestrator.services().events.subscribe();

    let run = h.orchestrator.run(vec![tracked(&base, 7)], true).await.unwrap();
    assert_eq!(run.changes.len(), 1);
    assert_eq!(run.changes[0].version, "1.0");
    let stored = h.store.get_entity(7).await.unwrap().unwrap();
    assert_eq!(stored.version, "2.0");
    assert!(stored.updated);

    let mut saw_change = false;
    let mut last_progress = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            RefreshEvent::Changed(old) => saw_change = old.id == 7,
            RefreshEvent::Progress { completed, .. } => last_progress = completed,
            _ => {}
        }
    }
    assert!(saw_change);
    assert_eq!(last_progress, 1);
}

#[tokio::test]
async fn missing_thread_is_soft_and_the_run_continues() {
    let (base, _) = upstream().await;
    let h = harness(&base, QUIET).await;
    let mut events = h.orchestrator.services().events.subscribe();

    let run = h
        .orchestrator
        .run(vec![tracked(&base, 404), tracked(&base, 1)], true)
        .await
        .unwrap();
    assert_eq!(run.completed, 2);
    assert_eq!(run.committed, 1);
    assert!(matches!(
        run.soft_failures.as_slice(),
        [RefreshError::RemoteNotFound { id: 404, status: 404 }]
    ));

    let mut reported = false;
    while let Ok(event) = events.try_recv() {
        if let RefreshEvent::RemoteNotFound { id, status, .. } = event {
            reported = id == 404 && status == 404;
        }
    }
    assert!(reported);
}

#[tokio::test]
async fn moved_thread_is_fetched_in_full() {
    let (base, up) = upstream().await;
    let h = harness(&base, QUIET).await;

    let run = h.orchestrator.run(vec![tracked(&base, 301)], false).await.unwrap();
    assert_eq!(run.committed, 1);
    assert_eq!(up.gets.load(Ordering::SeqCst), 2);
    assert_eq!(
        up.fetched.lock().unwrap().last().map(String::as_str),
        Some("renamed.301")
    );
}

#[tokio::test]
async fn unexpected_redirect_fails_the_run() {
    let (base, _) = upstream().await;
    let h = harness(&base, QUIET).await;

    let err = h.orchestrator.run(vec![tracked(&base, 302)], false).await.unwrap_err();
    match err {
        RefreshError::Redirect { id, location } => {
            assert_eq!(id, 302);
            assert!(location.ends_with("/somewhere-else/"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.store.entity_writes(), 0);
}

#[tokio::test]
async fn unparseable_page_is_dumped() {
    let (base, _) = upstream().await;
    let h = harness(&base, QUIET).await;

    let err = h.orchestrator.run(vec![tracked(&base, 500)], true).await.unwrap_err();
    match err {
        RefreshError::Parse { id, dump, .. } => {
            assert_eq!(id, 500);
            let dump = dump.unwrap();
            assert!(dump.ends_with("500_broken.html"));
            assert_eq!(std::fs::read(dump).unwrap(), b"this is not json");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn completed_threads_can_be_left_out() {
    let (base, up) = upstream().await;
    let h = harness(
        &base,
        &[(settings::CHECK_NOTIFS, "false"), (settings::REFRESH_COMPLETED, "false")],
    )
    .await;
    let mut done = tracked(&base, 2);
    done.status = Status::Completed;

    let run = h.orchestrator.run(vec![tracked(&base, 1), done], true).await.unwrap();
    assert_eq!(run.total, 1);
    assert_eq!(up.fetched.lock().unwrap().as_slice(), ["game.1"]);
}

#[tokio::test]
async fn notifications_and_last_refresh_follow_a_clean_run() {
    let (base, _) = upstream().await;
    let h = harness(&base, &[]).await;

    let run = h.orchestrator.run(vec![tracked(&base, 1)], false).await.unwrap();
    let counts = run.notifications.unwrap();
    assert_eq!((counts.alerts, counts.conversations), (1, 2));
    assert!(h.store.get_setting(settings::LAST_REFRESH).await.unwrap().is_some());
    assert!(!h.orchestrator.cancel());
}

#[test]
fn redirect_classification() {
    let threads = "https://f95zone.to/threads/";
    let original = "https://f95zone.to/threads/game.10/";
    assert!(!classify_redirect(10, original, original, threads).unwrap());
    assert!(classify_redirect(10, original, "https://f95zone.to/threads/new-name.10/", threads).unwrap());
    assert!(matches!(
        classify_redirect(10, original, "https://f95zone.to/login/", threads),
        Err(RefreshError::Redirect { id: 10, .. })
    ));
    assert!(classify_redirect(10, original, "https://elsewhere.example/threads/10/", threads).is_err());
}

#[test]
fn stale_records_need_a_full_fetch() {
    let now = Utc::now();
    let mut entity = Entity::new(1, "u", now);
    entity.last_refresh_version = "11.0".into();
    assert!(needs_full(&entity, now));
    entity.last_full_refresh = Some(now - chrono::Duration::days(3));
    assert!(!needs_full(&entity, now));
    entity.last_full_refresh = Some(now - full_interval());
    assert!(needs_full(&entity, now));
}

#[test]
fn records_from_builds_before_the_parsing_changes_need_a_full_fetch() {
    let now = Utc::now();
    let mut entity = Entity::new(1, "u", now);
    entity.last_full_refresh = Some(now);
    for (version, full) in [("", true), ("9.0", true), ("9.3.9", true), ("9.4", false), ("11.0", false)] {
        entity.last_refresh_version = version.into();
        assert_eq!(needs_full(&entity, now), full, "last refreshed by {version:?}");
    }
}

#[tokio::test]
async fn record_from_9_0_is_fetched_in_full_despite_a_recent_check() {
    let (base, up) = upstream().await;
    let h = harness(&base, QUIET).await;
    let mut old = tracked(&base, 1);
    old.last_refresh_version = "9.0".into();

    let run = h.orchestrator.run(vec![old], false).await.unwrap();
    assert_eq!(run.committed, 1);
    assert_eq!(up.heads.load(Ordering::SeqCst), 0);
    assert_eq!(up.gets.load(Ordering::SeqCst), 1);
    let stored = h.store.get_entity(1).await.unwrap().unwrap();
    assert_eq!(stored.last_refresh_version, "11.0");
}

#[tokio::test]
async fn new_cover_is_downloaded_and_stored_with_the_record() {
    let (base, up) = upstream().await;
    let h = harness(&base, QUIET).await;

    let run = h.orchestrator.run(vec![tracked(&base, 50)], true).await.unwrap();
    assert_eq!(run.committed, 1);
    assert_eq!(up.images_served.load(Ordering::SeqCst), 1);

    let path = h.images.path_for(50).await.unwrap().unwrap();
    assert!(path.ends_with("50.png"));
    assert_eq!(std::fs::read(path).unwrap(), PNG_MAGIC);
    let stored = h.store.get_entity(50).await.unwrap().unwrap();
    assert_eq!(stored.image_url, ImageRef::Remote(format!("{base}/img/50.png")));
    assert_eq!(h.store.entity_writes(), 1);
}

#[tokio::test]
async fn cover_on_a_dead_foreign_host_is_dropped() {
    let (base, _) = upstream().await;
    let h = harness(&base, &[(settings::CHECK_NOTIFS, "false"), (settings::MAX_RETRIES, "0")]).await;

    let run = h.orchestrator.run(vec![tracked(&base, 60)], true).await.unwrap();
    assert_eq!(run.committed, 1);
    assert!(run.soft_failures.is_empty());
    let stored = h.store.get_entity(60).await.unwrap().unwrap();
    assert_eq!(stored.image_url, ImageRef::Absent);
    assert!(h.images.missing(60).await.unwrap());
}

#[tokio::test]
async fn image_downloads_share_a_smaller_pool() {
    let (base, up) = upstream().await;
    let h = harness(
        &base,
        &[
            (settings::CHECK_NOTIFS, "false"),
            (settings::REFRESH_WORKERS, "4"),
            (settings::IMAGE_WORKER_DIVISOR, "4"),
        ],
    )
    .await;
    let entities: Vec<_> = (50..=55).map(|id| tracked(&base, id)).collect();

    let run = h.orchestrator.run(entities, true).await.unwrap();
    assert_eq!(run.committed, 6);
    assert_eq!(up.images_served.load(Ordering::SeqCst), 6);
    assert_eq!(up.images_peak.load(Ordering::SeqCst), 1);
    for id in 50..=55 {
        assert!(!h.images.missing(id).await.unwrap());
    }
}

#[tokio::test]
async fn hard_failure_stops_the_run_but_keeps_earlier_commits() {
    let (base, up) = upstream().await;
    let h = harness(&base, &[(settings::CHECK_NOTIFS, "false"), (settings::REFRESH_WORKERS, "1")]).await;
    let entities: Vec<_> = [1, 2, 500, 3, 4].into_iter().map(|id| tracked(&base, id)).collect();

    let err = h.orchestrator.run(entities, true).await.unwrap_err();
    assert!(matches!(err, RefreshError::Parse { id: 500, .. }));
    assert_eq!(up.fetched.lock().unwrap().as_slice(), ["game.1", "game.2", "game.500"]);
    assert_eq!(h.store.entity_writes(), 2);
    assert!(h.store.get_entity(1).await.unwrap().is_some());
    assert!(h.store.get_entity(2).await.unwrap().is_some());
    assert!(h.store.get_entity(3).await.unwrap().is_none());
    assert!(h.store.get_setting(settings::LAST_REFRESH).await.unwrap().is_none());
}

#[tokio::test]
async fn cancel_stops_a_run_in_progress() {
    let (base, up) = upstream().await;
    let h = harness(&base, &[(settings::CHECK_NOTIFS, "false"), (settings::REFRESH_WORKERS, "1")]).await;
    let entities: Vec<_> = [800, 1, 2].into_iter().map(|id| tracked(&base, id)).collect();

    let canceller = async {
        while !h.orchestrator.cancel() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    let (result, ()) = tokio::time::timeout(
        Duration::from_secs(3),
        async { tokio::join!(h.orchestrator.run(entities, true), canceller) },
    )
    .await
    .expect("cancelled run should stop before the slow thread answers");

    assert!(matches!(result, Err(RefreshError::Cancelled)));
    assert!(!up.fetched.lock().unwrap().iter().any(|slug| slug == "game.2"));
    assert_eq!(h.store.entity_writes(), 0);
    assert!(!h.orchestrator.cancel());
}

#[tokio::test]
async fn parse_timeout_skips_the_thread_and_the_run_goes_on() {
    let (base, _) = upstream().await;
    let h = harness(&base, &[(settings::CHECK_NOTIFS, "false"), (settings::REQUEST_TIMEOUT, "1")]).await;
    let mut events = h.orchestrator.services().events.subscribe();
    let entities = vec![tracked(&base, SLOW_TO_PARSE), tracked(&base, 1)];

    let run = h.orchestrator.run(entities, true).await.unwrap();
    assert_eq!(run.completed, 2);
    assert_eq!(run.committed, 1);
    assert!(matches!(
        run.soft_failures.as_slice(),
        [RefreshError::ParseTimeout { id: SLOW_TO_PARSE }]
    ));
    assert!(h.store.get_entity(SLOW_TO_PARSE).await.unwrap().is_none());

    let mut reported = false;
    while let Ok(event) = events.try_recv() {
        if let RefreshEvent::ParseTimeout { id } = event {
            reported = id == SLOW_TO_PARSE;
        }
    }
    assert!(reported);
}
