//! Source-pool state machine and request dispatch.
//!
//! A [`RequestManager`] owns one logical open file, backed by up to two
//! concurrently active replicas drawn from a dynamic pool:
//!
//! ```text
//!                 promote (periodic check)
//!          ┌──────────────────────────────┐
//!          ▼                              │
//!     activeSources ──────────────► inactiveSources
//!          │        demote (quality)
//!          │ read error
//!          ▼
//!     disabledSources ── never reused; fed to the redirector as `tried=`
//! ```
//!
//! Single-range reads alternate between the two active sources; vector reads
//! are split across them in proportion to measured quality. A failed read
//! disables its source and retries on a replacement, waiting on the open
//! handler when the pool runs empty.

mod open_handler;

use crate::client::{url, AccessMode, FileClient, OpenFlags, RemoteFile, Status, StatusCode};
use crate::config::{
    Settings, LONG_OPEN_DELAY, OPEN_PROBE_PERCENT, OPEN_RETRIES, OPEN_WAIT_GRACE,
    QUALITY_HARD_LIMIT, QUALITY_SOFT_LIMIT, SHORT_OPEN_DELAY, SOURCE_QUALITY_FUDGE,
};
use crate::error::{ErrorDetails, XrdError};
use crate::monitor;
use crate::request::{ClientRequest, IoSegment};
use crate::source::Source;
use crate::split;
use open_handler::{OpenHandler, OpenOutcome};
use rand::Rng;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// The three source pools plus the rebalancing schedule.
///
/// Everything here is guarded by the manager's pool mutex, which is never
/// held across an await point.
struct SourcePool {
    /// Sources currently serving reads; positions 0 and 1 are meaningful to
    /// the vector-read splitter. Never more than two entries.
    active: Vec<Arc<Source>>,
    /// Warm candidates for promotion.
    inactive: Vec<Arc<Source>>,
    /// Sources that failed hard. References are parked here rather than
    /// dropped, so a handle is never destroyed from its own dispatch task.
    disabled: Vec<Arc<Source>>,
    /// Ids of servers that must not be reused, including servers that failed
    /// during the initial open and never became a `Source`.
    disabled_ids: HashSet<String>,
    last_source_check: Instant,
    next_active_source_check: Instant,
    /// Alternates which active source takes the next single-range read.
    next_initial_source_toggle: bool,
}

/// Adaptive multi-source request manager for one logical open file.
pub struct RequestManager {
    name: String,
    flags: OpenFlags,
    perms: AccessMode,
    /// Stream-error window; recovery waits are bounded by this plus a fixed
    /// grace.
    timeout: Duration,
    client: Arc<dyn FileClient>,
    pool: Mutex<SourcePool>,
    open_handler: OpenHandler,
    /// Back-reference handed to dispatch tasks and the open handler.
    self_ref: Weak<RequestManager>,
}

impl RequestManager {
    /// Opens `name` through the redirector and returns a manager with one
    /// active source. Tunables are read from the environment.
    pub async fn open(
        name: impl Into<String>,
        flags: OpenFlags,
        perms: AccessMode,
        client: Arc<dyn FileClient>,
    ) -> Result<Arc<Self>, XrdError> {
        Self::open_with_settings(name, flags, perms, client, Settings::from_env()).await
    }

    /// Opens `name` with explicit settings.
    ///
    /// The open is retried up to five times. Every attempt carries the
    /// `tried=` opaque naming the servers that already failed, so the
    /// redirector routes around them. An attempt that lands on an
    /// already-failed server, or that the redirector refuses to redirect,
    /// is terminal.
    pub async fn open_with_settings(
        name: impl Into<String>,
        flags: OpenFlags,
        perms: AccessMode,
        client: Arc<dyn FileClient>,
        settings: Settings,
    ) -> Result<Arc<Self>, XrdError> {
        let name = name.into();
        let mut disabled_ids: HashSet<String> = HashSet::new();
        let mut file: Option<Arc<dyn RemoteFile>> = None;
        let mut last_error: Option<XrdError> = None;

        for attempt in 0..OPEN_RETRIES {
            let opaque = url::tried_param(disabled_ids.iter().map(String::as_str));
            let request_url = url::append_opaque(&name, &opaque);
            debug!(url = %request_url, attempt, "Opening file");
            match client.open(&request_url, flags, perms).await {
                Ok(handle) => {
                    file = Some(handle);
                    break;
                }
                Err(open_error) => {
                    let mut details = ErrorDetails {
                        operation: "open".to_string(),
                        name: name.clone(),
                        flags,
                        perms,
                        status: open_error.status.clone(),
                        active_sources: Vec::new(),
                        disabled_sources: disabled_ids.iter().cloned().collect(),
                        info: Vec::new(),
                    };
                    if let Some(server) = &open_error.data_server {
                        details.info.push(format!("problematic data server: {}", server));
                    }
                    if let Some(last_url) = &open_error.last_url {
                        details.info.push(format!("last URL tried: {}", last_url));
                        warn!(url = %last_url, "Failed to open file at URL");
                    }
                    if let Some(server) = &open_error.data_server {
                        if disabled_ids.contains(server) {
                            details
                                .info
                                .push("no additional data servers were found".to_string());
                            return Err(XrdError::FileOpen(Box::new(details)));
                        }
                        disabled_ids.insert(server.clone());
                    }
                    // Staying at the redirector means there is nowhere else
                    // to go for this file.
                    if open_error.last_url.as_deref() == Some(request_url.as_str()) {
                        details.info.push("redirector did not redirect".to_string());
                        return Err(XrdError::FileOpen(Box::new(details)));
                    }
                    last_error = Some(XrdError::FileOpen(Box::new(details)));
                }
            }
        }

        let file = match file {
            Some(file) => file,
            None => return Err(last_error.expect("a failed open records an error")),
        };
        monitor::send_monitoring_info(&client, file.as_ref());

        let now = Instant::now();
        let source = Arc::new(Source::new(now, file));
        info!(source = %source.id(), "Opened initial source");
        let pool = SourcePool {
            active: vec![source],
            inactive: Vec::new(),
            disabled: Vec::new(),
            disabled_ids,
            last_source_check: now,
            next_active_source_check: now + SHORT_OPEN_DELAY,
            next_initial_source_toggle: false,
        };
        Ok(Arc::new_cyclic(|self_ref| Self {
            name,
            flags,
            perms,
            timeout: settings.timeout,
            client,
            pool: Mutex::new(pool),
            open_handler: OpenHandler::new(),
            self_ref: self_ref.clone(),
        }))
    }

    /// Reads `len` bytes at `offset`; resolves to the byte count.
    pub async fn read(&self, offset: u64, len: u64) -> Result<u64, XrdError> {
        let request = ClientRequest::single(offset, len);
        let source = {
            let mut pool = self.lock_pool();
            let now = Instant::now();
            self.check_sources(&mut pool, now, request.size());
            Self::pick_single_source(&mut pool)
        };
        source.handle(Arc::clone(&request), self.shared());
        self.wait_request(request).await
    }

    /// Issues a scatter read; resolves to the total byte count.
    ///
    /// Entries must be strictly offset-ascending and no larger than
    /// [`crate::config::MAX_CHUNK`]. With two active sources the list is
    /// split between them in proportion to quality and both halves run
    /// concurrently.
    pub async fn read_vector(&self, iolist: Vec<IoSegment>) -> Result<u64, XrdError> {
        enum Dispatch {
            Single(Arc<Source>),
            Split {
                first: Arc<Source>,
                second: Arc<Source>,
                req1: Vec<IoSegment>,
                req2: Vec<IoSegment>,
            },
        }

        let total: u64 = iolist.iter().map(|io| io.len).sum();
        let dispatch = {
            let mut pool = self.lock_pool();
            assert!(!pool.active.is_empty(), "read_vector requires an open file");
            let now = Instant::now();
            self.check_sources(&mut pool, now, total);
            // The check may have shrunk the pool back to one source.
            if pool.active.len() == 1 {
                Dispatch::Single(Arc::clone(&pool.active[0]))
            } else {
                let (req1, req2) = split::split_client_request(
                    &iolist,
                    pool.active[0].quality(),
                    pool.active[1].quality(),
                );
                Dispatch::Split {
                    first: Arc::clone(&pool.active[0]),
                    second: Arc::clone(&pool.active[1]),
                    req1,
                    req2,
                }
            }
        };

        match dispatch {
            Dispatch::Single(source) => {
                let request = ClientRequest::vector(iolist);
                source.handle(Arc::clone(&request), self.shared());
                self.wait_request(request).await
            }
            Dispatch::Split {
                first,
                second,
                req1,
                req2,
            } => match (req1.is_empty(), req2.is_empty()) {
                // Degenerate case: no bytes to read.
                (true, true) => Ok(0),
                (false, true) => {
                    let request = ClientRequest::vector(req1);
                    first.handle(Arc::clone(&request), self.shared());
                    self.wait_request(request).await
                }
                (true, false) => {
                    let request = ClientRequest::vector(req2);
                    second.handle(Arc::clone(&request), self.shared());
                    self.wait_request(request).await
                }
                (false, false) => {
                    let request1 = ClientRequest::vector(req1);
                    let request2 = ClientRequest::vector(req2);
                    first.handle(Arc::clone(&request1), self.shared());
                    second.handle(Arc::clone(&request2), self.shared());
                    let bytes1 = self.wait_request(request1).await?;
                    let bytes2 = self.wait_request(request2).await?;
                    Ok(bytes1 + bytes2)
                }
            },
        }
    }

    /// Ids of the currently active sources.
    pub fn active_source_names(&self) -> Vec<String> {
        self.lock_pool()
            .active
            .iter()
            .map(|source| source.id().to_string())
            .collect()
    }

    /// Ids of the servers excluded for this file.
    pub fn disabled_source_names(&self) -> Vec<String> {
        self.lock_pool().disabled_ids.iter().cloned().collect()
    }

    /// Raw handle of the first active source, when one exists.
    pub fn active_file(&self) -> Option<Arc<dyn RemoteFile>> {
        self.lock_pool().active.first().map(|source| source.file())
    }

    /// Waits out any in-flight open; completions arriving afterwards are
    /// dropped without touching the pool.
    pub async fn shutdown(&self) {
        self.open_handler.shutdown(self.timeout + OPEN_WAIT_GRACE).await;
    }

    /// Entry point for failed dispatches, called from the dispatch task of
    /// the failing source.
    ///
    /// Invalid responses are returned to the caller on their own path. Any
    /// other failure disables the source and retries the request on a
    /// replacement, synchronously waiting for an open (bounded by the
    /// stream-error window plus grace) when the active pool runs empty.
    pub(crate) async fn request_failure(
        &self,
        request: Arc<ClientRequest>,
        status: Status,
    ) -> Result<(), XrdError> {
        let source = request
            .current_source()
            .expect("failed request carries its source");

        if status.code == StatusCode::InvalidResponse {
            warn!(source = %source.id(), "Invalid response when reading");
            let details = self.error_details(
                "readv",
                status,
                vec![format!("old source: {}", source.id())],
            );
            return Err(XrdError::FileRead(Box::new(details)));
        }

        enum Recovery {
            Retry(Arc<Source>),
            AwaitOpen(broadcast::Receiver<OpenOutcome>),
        }

        let recovery = {
            let mut pool = self.lock_pool();
            // The source reference is parked, not dropped: this function runs
            // on the dispatch task, and destroying the handle from its own
            // callback context can deadlock the client library.
            pool.disabled_ids.insert(source.id().to_string());
            pool.disabled.push(Arc::clone(&source));
            Self::remove_by_identity(&mut pool.active, &source);
            debug!(
                source = %source.id(),
                disabled = pool.disabled.len(),
                "Parked failed source in the disabled set"
            );

            if pool.active.is_empty() {
                let open_url = self.open_url(&pool);
                let receiver = self.open_handler.open(self.shared(), open_url);
                pool.last_source_check = Instant::now();
                Recovery::AwaitOpen(receiver)
            } else {
                Recovery::Retry(Arc::clone(&pool.active[0]))
            }
        };

        let retry_source = match recovery {
            Recovery::Retry(replacement) => replacement,
            Recovery::AwaitOpen(mut receiver) => {
                // We have already failed once; fail hard rather than risk a
                // deadlock. The pool lock is released while waiting so the
                // open task can publish and integrate its completion.
                let outcome =
                    tokio::time::timeout(self.timeout + OPEN_WAIT_GRACE, receiver.recv()).await;
                let opened = match outcome {
                    Err(_elapsed) => {
                        let details = self.error_details(
                            "open",
                            status,
                            vec![
                                format!("old source: {}", source.id()),
                                format!("current server: {}", self.open_handler.current_source()),
                                "timeout when waiting for file open".to_string(),
                            ],
                        );
                        return Err(XrdError::FileOpen(Box::new(details)));
                    }
                    Ok(Err(_closed)) => {
                        let details = self.error_details(
                            "open",
                            status,
                            vec![
                                format!("old source: {}", source.id()),
                                "open handler shut down while waiting for file open".to_string(),
                            ],
                        );
                        return Err(XrdError::FileOpen(Box::new(details)));
                    }
                    Ok(Ok(Err(error))) => {
                        let mut error = (*error).clone();
                        match &mut error {
                            XrdError::FileOpen(details) | XrdError::FileRead(details) => details
                                .info
                                .push(format!("original failed source: {}", source.id())),
                        }
                        return Err(error);
                    }
                    Ok(Ok(Ok(opened))) => opened,
                };

                let mut pool = self.lock_pool();
                if pool.disabled_ids.contains(opened.id()) {
                    // The redirector handed back a server we asked it to
                    // avoid. Fatal.
                    let details = self.error_details_locked(
                        &pool,
                        "open",
                        status,
                        vec![
                            format!("old source: {}", source.id()),
                            format!("new source: {}", opened.id()),
                            "server returned an excluded source".to_string(),
                        ],
                    );
                    return Err(XrdError::FileOpen(Box::new(details)));
                }
                // The open completion may already have appended it.
                if !pool.active.iter().any(|s| s.id() == opened.id()) {
                    pool.active.push(Arc::clone(&opened));
                }
                Arc::clone(&pool.active[0])
            }
        };

        info!(source = %retry_source.id(), "Retrying failed request on replacement source");
        retry_source.handle(request, self.shared());
        Ok(())
    }

    /// Integrates an open-handler completion into the pool.
    pub(crate) fn handle_open(&self, outcome: OpenOutcome) {
        let mut pool = self.lock_pool();
        match outcome {
            Ok(source) => {
                info!(source = %source.id(), "Successfully opened new source");
                let excluded = pool
                    .active
                    .iter()
                    .chain(pool.inactive.iter())
                    .any(|existing| existing.id() == source.id());
                if excluded {
                    warn!(source = %source.id(), "Server returned an excluded source; ignoring");
                    pool.next_active_source_check += LONG_OPEN_DELAY - SHORT_OPEN_DELAY;
                    return;
                }
                if pool.active.len() < 2 {
                    pool.active.push(source);
                } else {
                    pool.inactive.push(source);
                }
            }
            Err(error) => {
                // Wait out a failed open before the next attempt.
                debug!(error = %error, "Open of a new source failed");
                pool.next_active_source_check += LONG_OPEN_DELAY - SHORT_OPEN_DELAY;
            }
        }
    }

    /// Runs the pool check when due: at most once a second, and no earlier
    /// than the scheduled next check.
    fn check_sources(&self, pool: &mut SourcePool, now: Instant, request_size: u64) {
        trace!(
            since_last_check_ms =
                now.saturating_duration_since(pool.last_source_check).as_millis() as u64,
            request_size,
            "Source check"
        );
        if now.saturating_duration_since(pool.last_source_check) > Duration::from_secs(1)
            && now >= pool.next_active_source_check
        {
            self.check_sources_impl(pool, now);
        }
    }

    fn check_sources_impl(&self, pool: &mut SourcePool, now: Instant) {
        let mut find_new_source = false;
        if pool.active.len() <= 1 {
            find_new_source = true;
        } else {
            debug!(
                quality0 = pool.active[0].quality(),
                quality1 = pool.active[1].quality(),
                "Active source qualities"
            );
            find_new_source |= Self::compare_sources(pool, now, 0, 1);
            find_new_source |= Self::compare_sources(pool, now, 1, 0);

            // First admission into the active set uses the short window;
            // churn inside the swap loop below uses the long one.
            let mut eligible = Self::eligible_inactive(
                pool,
                now,
                SHORT_OPEN_DELAY - Duration::from_secs(1),
            );
            if let Some(best) = Self::best_source(&eligible) {
                debug!(source = %best.id(), quality = best.quality(), "Best inactive source");
            }
            if let Some((_, worst_quality, worst_id)) = Self::worst_active(pool) {
                debug!(source = %worst_id, quality = worst_quality, "Worst active source");
            }

            if pool.active.len() == 1 {
                if let Some(best) = Self::best_source(&eligible) {
                    info!(
                        source = %best.id(),
                        quality = best.quality(),
                        "Promoting inactive source to refill the active set"
                    );
                    Self::remove_by_identity(&mut pool.inactive, &best);
                    pool.active.push(best);
                }
            } else {
                while let Some(best) = Self::best_source(&eligible) {
                    let (worst_index, worst_quality, _) =
                        Self::worst_active(pool).expect("two active sources in swap loop");
                    if worst_quality <= best.quality() + SOURCE_QUALITY_FUDGE {
                        break;
                    }
                    info!(
                        demoted = %pool.active[worst_index].id(),
                        demoted_quality = worst_quality,
                        promoted = %best.id(),
                        promoted_quality = best.quality(),
                        "Swapping active source for a better inactive source"
                    );
                    let worst = pool.active.remove(worst_index);
                    worst.set_last_downgrade(now);
                    Self::remove_by_identity(&mut pool.inactive, &best);
                    pool.inactive.push(worst);
                    pool.active.push(best);
                    eligible = Self::eligible_inactive(
                        pool,
                        now,
                        LONG_OPEN_DELAY - Duration::from_secs(1),
                    );
                }
            }
        }

        // A stable pair still gets an occasional speculative probe, in case
        // a far better replica has appeared.
        if !find_new_source
            && now.saturating_duration_since(pool.last_source_check) > LONG_OPEN_DELAY
        {
            let roll: u32 = rand::thread_rng().gen_range(0..100);
            if roll < OPEN_PROBE_PERCENT {
                debug!(roll, "Probing for a new source");
                find_new_source = true;
            }
        }

        if find_new_source {
            let open_url = self.open_url(pool);
            self.open_handler.open(self.shared(), open_url);
            pool.last_source_check = now;
        }

        // Only look aggressively for new sources while short of a pair.
        let delay = if pool.active.len() == 2 {
            LONG_OPEN_DELAY - SHORT_OPEN_DELAY
        } else {
            SHORT_OPEN_DELAY
        };
        pool.next_active_source_check = now + delay;
    }

    /// Demotes active source `a` when its quality is bad in absolute terms,
    /// or markedly worse than its peer `b`. Returns whether a replacement
    /// should be requested (the source had been downgraded before).
    fn compare_sources(pool: &mut SourcePool, now: Instant, a: usize, b: usize) -> bool {
        if pool.active.len() < a.max(b) + 1 {
            return false;
        }
        let quality_a = pool.active[a].quality();
        let quality_b = pool.active[b].quality();
        let poor = quality_a > QUALITY_HARD_LIMIT
            || (quality_a > QUALITY_SOFT_LIMIT && quality_b.saturating_mul(4) < quality_a);
        if !poor {
            return false;
        }
        info!(
            source = %pool.active[a].id(),
            quality = quality_a,
            peer_quality = quality_b,
            "Removing source from active set due to poor quality"
        );
        let source = pool.active.remove(a);
        let find_new_source = source.last_downgrade().is_some();
        source.set_last_downgrade(now);
        pool.inactive.push(source);
        find_new_source
    }

    /// Picks the source for a single-range read, alternating between the two
    /// active sources for fairness. The active set must not be empty.
    fn pick_single_source(pool: &mut SourcePool) -> Arc<Source> {
        assert!(
            !pool.active.is_empty(),
            "pick_single_source requires an active source"
        );
        if pool.active.len() == 2 {
            if pool.next_initial_source_toggle {
                pool.next_initial_source_toggle = false;
                Arc::clone(&pool.active[0])
            } else {
                pool.next_initial_source_toggle = true;
                Arc::clone(&pool.active[1])
            }
        } else {
            Arc::clone(&pool.active[0])
        }
    }

    /// Inactive sources whose last downgrade is older than `window`.
    fn eligible_inactive(pool: &SourcePool, now: Instant, window: Duration) -> Vec<Arc<Source>> {
        pool.inactive
            .iter()
            .filter(|source| match source.last_downgrade() {
                Some(at) => now.saturating_duration_since(at) > window,
                None => true,
            })
            .cloned()
            .collect()
    }

    fn best_source(candidates: &[Arc<Source>]) -> Option<Arc<Source>> {
        candidates
            .iter()
            .min_by_key(|source| source.quality())
            .cloned()
    }

    fn worst_active(pool: &SourcePool) -> Option<(usize, u32, String)> {
        pool.active
            .iter()
            .enumerate()
            .max_by_key(|(_, source)| source.quality())
            .map(|(index, source)| (index, source.quality(), source.id().to_string()))
    }

    fn remove_by_identity(sources: &mut Vec<Arc<Source>>, target: &Arc<Source>) {
        if let Some(index) = sources.iter().position(|s| Arc::ptr_eq(s, target)) {
            sources.remove(index);
        }
    }

    /// The open URL carrying the current exclusion opaque.
    fn open_url(&self, pool: &SourcePool) -> String {
        url::append_opaque(&self.name, &Self::prepare_opaque(pool))
    }

    /// Builds the `tried=` opaque from every source the manager knows about.
    fn prepare_opaque(pool: &SourcePool) -> String {
        let ids = pool
            .active
            .iter()
            .map(|source| source.id())
            .chain(pool.inactive.iter().map(|source| source.id()))
            .chain(pool.disabled_ids.iter().map(String::as_str));
        url::tried_param(ids)
    }

    async fn wait_request(&self, request: Arc<ClientRequest>) -> Result<u64, XrdError> {
        match request.wait().await {
            Some(result) => result,
            None => Err(XrdError::FileOpen(Box::new(self.error_details(
                "read",
                Status::error(
                    StatusCode::ConnectionError,
                    "dispatch dropped without completing the request",
                ),
                Vec::new(),
            )))),
        }
    }

    /// Snapshot of the open parameters and pools for an error report.
    pub(crate) fn error_details(
        &self,
        operation: &str,
        status: Status,
        info: Vec<String>,
    ) -> ErrorDetails {
        let pool = self.lock_pool();
        self.error_details_locked(&pool, operation, status, info)
    }

    fn error_details_locked(
        &self,
        pool: &SourcePool,
        operation: &str,
        status: Status,
        info: Vec<String>,
    ) -> ErrorDetails {
        ErrorDetails {
            operation: operation.to_string(),
            name: self.name.clone(),
            flags: self.flags,
            perms: self.perms,
            status,
            active_sources: pool.active.iter().map(|s| s.id().to_string()).collect(),
            disabled_sources: pool.disabled_ids.iter().cloned().collect(),
            info,
        }
    }

    fn lock_pool(&self) -> MutexGuard<'_, SourcePool> {
        self.pool.lock().expect("source pool mutex poisoned")
    }

    /// A strong handle to self for dispatch tasks and the open handler.
    fn shared(&self) -> Arc<RequestManager> {
        self.self_ref
            .upgrade()
            .expect("manager outlives its dispatch entry points")
    }
}
