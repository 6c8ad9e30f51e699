//! The refresh run: a worker pool walking every tracked entity.
//!
//! Workers pull entities from a shared FIFO queue. Each entity is either
//! confirmed unchanged with a cheap HEAD probe or fully fetched, parsed,
//! merged and committed. The first hard failure cancels the run and is
//! returned; soft failures are recorded and the run goes on.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use threadwatch_fetch::{FetchOptions, Method, ReadMode, ResilientClient, Url};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::diagnostics::{self, Diagnostics};
use crate::entity::{Entity, EntityId, ImageRef, OldEntitySnapshot, Status};
use crate::error::{RefreshError, SessionError};
use crate::events::{EventBus, RefreshEvent};
use crate::images::ImageStore;
use crate::limiter::ResourceLimiters;
use crate::merge::{self, BreakingChecks, MergeContext, MergeOutcome};
use crate::notifs::{self, NotifCounts};
use crate::parser::ParseDispatcher;
use crate::session::{self, BrowserLogin, SessionGuard};
use crate::settings::{self, Settings};
use crate::site::Site;
use crate::store::Store;

/// A record not fully fetched for this long gets a full fetch.
pub fn full_interval() -> chrono::Duration {
    chrono::Duration::days(7)
}

/// Outcome of a finished run.
#[derive(Debug)]
pub struct RefreshRun {
    pub total: usize,
    pub completed: usize,
    /// Entities whose merged record was written.
    pub committed: usize,
    pub changes: Vec<OldEntitySnapshot>,
    /// `ParseTimeout` and `RemoteNotFound` failures, in the order seen.
    pub soft_failures: Vec<RefreshError>,
    pub notifications: Option<NotifCounts>,
}

/// Shared state of the run in progress.
struct RunState {
    total: usize,
    completed: AtomicUsize,
    committed: AtomicUsize,
    cancel_tx: watch::Sender<bool>,
    changes: Mutex<Vec<OldEntitySnapshot>>,
    soft_failures: Mutex<Vec<RefreshError>>,
    events: EventBus,
}

impl RunState {
    fn new(total: usize, events: EventBus) -> Self {
        Self {
            total,
            completed: AtomicUsize::new(0),
            committed: AtomicUsize::new(0),
            cancel_tx: watch::Sender::new(false),
            changes: Mutex::new(Vec::new()),
            soft_failures: Mutex::new(Vec::new()),
            events,
        }
    }

    fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    fn record_change(&self, change: OldEntitySnapshot) {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(change.clone());
        self.events.publish(RefreshEvent::Changed(change));
    }

    fn record_soft_failure(&self, err: RefreshError) {
        self.soft_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(err);
    }

    fn finish(&self, notifications: Option<NotifCounts>) -> RefreshRun {
        RefreshRun {
            total: self.total,
            completed: self.completed.load(Ordering::SeqCst),
            committed: self.committed.load(Ordering::SeqCst),
            changes: std::mem::take(&mut *self.changes.lock().unwrap_or_else(PoisonError::into_inner)),
            soft_failures: std::mem::take(
                &mut *self.soft_failures.lock().unwrap_or_else(PoisonError::into_inner),
            ),
            notifications,
        }
    }
}

/// Counts one dequeued entity when dropped, including when the worker is
/// aborted mid-check.
struct Tick<'a>(&'a RunState);

impl Drop for Tick<'_> {
    fn drop(&mut self) {
        let completed = self.0.completed.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.events.publish(RefreshEvent::Progress {
            completed,
            total: self.0.total,
        });
    }
}

/// Everything a refresh run talks to.
pub struct RefreshServices<S, L> {
    pub client: ResilientClient,
    pub site: Site,
    pub store: Arc<S>,
    pub session: SessionGuard<L, S>,
    pub parser: ParseDispatcher,
    pub images: ImageStore,
    pub diagnostics: Diagnostics,
    pub events: EventBus,
    /// Stamped on every merged record.
    pub app_version: String,
}

pub struct RefreshOrchestrator<S, L> {
    services: Arc<RefreshServices<S, L>>,
    current: Arc<Mutex<Option<Arc<RunState>>>>,
}

impl<S, L> Clone for RefreshOrchestrator<S, L> {
    fn clone(&self) -> Self {
        Self {
            services: Arc::clone(&self.services),
            current: Arc::clone(&self.current),
        }
    }
}

impl<S: Store, L: BrowserLogin> RefreshOrchestrator<S, L> {
    pub fn new(services: RefreshServices<S, L>) -> Self {
        Self {
            services: Arc::new(services),
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn services(&self) -> &RefreshServices<S, L> {
        &self.services
    }

    /// Ask the run in progress to stop. Returns `false` if none is running.
    pub fn cancel(&self) -> bool {
        match &*self.current.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(run) => {
                info!("refresh cancellation requested");
                run.cancel();
                true
            }
            None => false,
        }
    }

    /// Refresh `entities`. `full` forces a full fetch for every entity.
    #[instrument(skip_all, fields(entities = entities.len(), full))]
    pub async fn run(&self, entities: Vec<Entity>, full: bool) -> Result<RefreshRun, RefreshError> {
        let services = &self.services;
        let settings = Arc::new(Settings::load(&*services.store).await?);

        if !services.session.ensure().await? {
            return Err(SessionError::LoginRejected.into());
        }

        let (tx, rx) = flume::unbounded::<Entity>();
        for entity in entities {
            if entity.status == Status::Completed && !settings.refresh_completed {
                continue;
            }
            // Unbounded and the receiver is alive.
            let _ = tx.send(entity);
        }
        drop(tx);

        let run = Arc::new(RunState::new(rx.len(), services.events.clone()));
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&run));
        let result = self.drive(&run, rx, full, settings).await;
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = None;
        result
    }

    async fn drive(
        &self,
        run: &Arc<RunState>,
        rx: flume::Receiver<Entity>,
        full: bool,
        settings: Arc<Settings>,
    ) -> Result<RefreshRun, RefreshError> {
        let services = &self.services;
        let limiters = ResourceLimiters::new(settings.image_slots());
        info!(
            total = run.total,
            workers = settings.refresh_workers,
            image_slots = settings.image_slots(),
            "refresh started"
        );
        services.events.publish(RefreshEvent::Started { total: run.total });

        let mut workers = JoinSet::new();
        for _ in 0..settings.refresh_workers {
            workers.spawn(worker(
                Arc::clone(&self.services),
                rx.clone(),
                Arc::clone(run),
                full,
                Arc::clone(&settings),
                limiters.clone(),
            ));
        }
        drop(rx);

        let mut cancel_rx = run.cancel_tx.subscribe();
        let mut aborted = run.is_cancelled();
        let mut first_error: Option<RefreshError> = None;
        loop {
            let joined = if aborted {
                workers.join_next().await
            } else {
                let next = tokio::select! {
                    joined = workers.join_next() => Some(joined),
                    changed = cancel_rx.changed() => {
                        // A closed channel cannot be waited on again.
                        if changed.is_err() || *cancel_rx.borrow_and_update() {
                            None
                        } else {
                            continue;
                        }
                    }
                };
                match next {
                    Some(joined) => joined,
                    None => {
                        aborted = true;
                        workers.abort_all();
                        continue;
                    }
                }
            };
            let failure = match joined {
                None => break,
                Some(Ok(Ok(()))) => continue,
                Some(Ok(Err(e))) => e,
                Some(Err(e)) if e.is_cancelled() => continue,
                Some(Err(e)) => RefreshError::Worker(e.to_string()),
            };
            if first_error.is_none() {
                warn!(error = %failure, "refresh failed, cancelling remaining work");
                first_error = Some(failure);
            }
            run.cancel();
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if run.is_cancelled() {
            return Err(RefreshError::Cancelled);
        }

        let notifications = if settings.check_notifs {
            let counts =
                notifs::check(&services.client, &services.site.notif_endpoint, &services.diagnostics).await?;
            services.events.publish(RefreshEvent::Notifications(counts));
            Some(counts)
        } else {
            None
        };

        services
            .store
            .set_setting(settings::LAST_REFRESH, &Utc::now().timestamp().to_string())
            .await?;

        let outcome = run.finish(notifications);
        info!(
            completed = outcome.completed,
            committed = outcome.committed,
            changes = outcome.changes.len(),
            soft_failures = outcome.soft_failures.len(),
            "refresh finished"
        );
        services.events.publish(RefreshEvent::Finished {
            completed: outcome.completed,
            total: outcome.total,
        });
        Ok(outcome)
    }
}

async fn worker<S: Store, L: BrowserLogin>(
    services: Arc<RefreshServices<S, L>>,
    rx: flume::Receiver<Entity>,
    run: Arc<RunState>,
    full: bool,
    settings: Arc<Settings>,
    limiters: ResourceLimiters,
) -> Result<(), RefreshError> {
    loop {
        if run.is_cancelled() {
            return Ok(());
        }
        let Ok(entity) = rx.recv_async().await else {
            return Ok(());
        };
        let _tick = Tick(&run);
        let (id, name) = (entity.id, entity.name.clone());

        match check(&services, entity, full, &settings, &limiters, &run).await {
            Ok(()) => {}
            Err(err) if err.is_soft() => {
                warn!(id, error = %err, "entity skipped");
                match &err {
                    RefreshError::RemoteNotFound { status, .. } => {
                        services.events.publish(RefreshEvent::RemoteNotFound {
                            id,
                            name,
                            status: *status,
                        });
                    }
                    RefreshError::ParseTimeout { .. } => {
                        services.events.publish(RefreshEvent::ParseTimeout { id });
                    }
                    _ => {}
                }
                run.record_soft_failure(err);
            }
            Err(err) => {
                run.cancel();
                return Err(err);
            }
        }
    }
}

/// Refresh one entity.
#[instrument(skip_all, fields(id = old.id))]
async fn check<S: Store, L: BrowserLogin>(
    services: &RefreshServices<S, L>,
    old: Entity,
    full: bool,
    settings: &Settings,
    limiters: &ResourceLimiters,
    run: &RunState,
) -> Result<(), RefreshError> {
    let now = Utc::now();
    let image_missing = services.images.missing(old.id).await?;

    let mut full = full || needs_full(&old, now) || (image_missing && old.image_url != ImageRef::Absent);
    if !full {
        let (_, meta) = services
            .client
            .fetch(
                Method::HEAD,
                &old.url,
                FetchOptions::default().read(ReadMode::HeadersOnly),
            )
            .await?;
        full = classify_redirect(old.id, &old.url, meta.url.as_str(), &services.site.threads_page)?;
    }
    if !full {
        debug!("unchanged");
        return Ok(());
    }

    let _full = limiters.fulls.acquire().await;
    let (raw, meta) = services
        .client
        .fetch(
            Method::GET,
            &old.url,
            FetchOptions::default().timeout(settings.request_timeout * 2),
        )
        .await?;
    session::check_signatures(&raw)?;
    let status = meta.status.as_u16();
    if status == 404 || status == 403 {
        return Err(RefreshError::RemoteNotFound { id: old.id, status });
    }

    let parsed = match services
        .parser
        .parse(old.id, raw.clone(), settings.request_timeout)
        .await?
    {
        Ok(parsed) => parsed,
        Err(failure) => {
            let dump = services
                .diagnostics
                .try_dump(&diagnostics::thread_broken(old.id), &raw)
                .await;
            return Err(RefreshError::Parse {
                id: old.id,
                message: failure.to_string(),
                dump,
            });
        }
    };

    let ctx = MergeContext {
        now,
        app_version: services.app_version.clone(),
        keep_image_on_update: settings.keep_image_on_update,
        image_missing,
    };
    let MergeOutcome {
        mut entity,
        change,
        fetch_image,
    } = merge::merge(&old, &parsed, &ctx);

    // `Some(data)` replaces the stored image; `None` leaves it alone.
    let mut image = None;
    if let Some(url) = fetch_image {
        let _slot = limiters.images.acquire().await;
        let data = download_image(services, &url, settings).await?;
        if data.is_none() {
            entity.image_url = ImageRef::Absent;
        }
        image = Some(data);
    }

    let images = services.images.clone();
    let store = Arc::clone(&services.store);
    shielded(async move {
        if let Some(data) = image {
            images.replace(entity.id, data.as_deref()).await.map_err(RefreshError::from)?;
        }
        store.upsert_entity(&entity).await.map_err(RefreshError::from)
    })
    .await?;
    run.committed.fetch_add(1, Ordering::SeqCst);

    if let Some(change) = change {
        info!(name = %change.name, old_version = %change.version, "thread changed");
        run.record_change(change);
    }
    Ok(())
}

/// Whether `entity` gets a full fetch regardless of what a HEAD request says:
/// it is stale, or was last refreshed by a build whose parsed fields are
/// obsolete.
fn needs_full(entity: &Entity, now: DateTime<Utc>) -> bool {
    BreakingChecks::for_version(&entity.last_refresh_version).parsing_changes
        || entity
            .last_full_refresh
            .is_none_or(|at| now - at >= full_interval())
}

/// Decide what a HEAD probe that landed on `landed` means.
///
/// `Ok(false)`: unchanged. `Ok(true)`: the thread moved (new slug or page),
/// fetch it in full. Anything else is an unexpected redirect.
pub fn classify_redirect(
    id: EntityId,
    original: &str,
    landed: &str,
    threads_page: &str,
) -> Result<bool, RefreshError> {
    if landed == original {
        Ok(false)
    } else if landed.contains(&id.to_string()) && landed.starts_with(threads_page) {
        Ok(true)
    } else {
        Err(RefreshError::Redirect {
            id,
            location: landed.to_owned(),
        })
    }
}

/// Download an image with four times the request timeout.
///
/// `Ok(None)` means the image lives on a foreign host that no longer
/// resolves while the site itself does; the image is then considered gone.
async fn download_image<S, L>(
    services: &RefreshServices<S, L>,
    url: &str,
    settings: &Settings,
) -> Result<Option<Bytes>, RefreshError> {
    let options = FetchOptions::default().timeout(settings.request_timeout * 4);
    match services.client.fetch(Method::GET, url, options).await {
        Ok((raw, _)) => Ok(Some(raw)),
        Err(e) if e.is_connect() && !services.site.owns(url) => {
            let site_ok = resolves(&services.site.host).await;
            let foreign_host = Url::parse(url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_owned));
            let foreign_ok = match &foreign_host {
                Some(host) => resolves(host).await,
                None => false,
            };
            if site_ok && !foreign_ok {
                warn!(url, "image host no longer resolves, dropping image");
                Ok(None)
            } else {
                Err(e.into())
            }
        }
        Err(e) => Err(e.into()),
    }
}

async fn resolves(host: &str) -> bool {
    tokio::net::lookup_host((host, 80))
        .await
        .map(|mut addrs| addrs.next().is_some())
        .unwrap_or(false)
}

/// Run `fut` on its own task so it completes even if the caller is dropped.
async fn shielded<T, F>(fut: F) -> Result<T, RefreshError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, RefreshError>> + Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|e| RefreshError::Worker(format!("commit task failed: {e}")))?
}

#[cfg(test)]
mod tests;
