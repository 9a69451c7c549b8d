//! Per-replica read dispatch and quality tracking.
//!
//! A `Source` is one bound replica: an open file handle on one specific
//! storage server. Each dispatched request is timed, and the observed latency
//! feeds the source's quality scalar (lower is better). Failed requests are
//! reported into the manager's recovery path from the dispatch task, which
//! plays the role of the client library's callback thread.

use crate::client::{RemoteFile, Status};
use crate::manager::RequestManager;
use crate::request::{ClientRequest, RequestKind};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Quality assigned to a freshly bound replica.
const INITIAL_QUALITY: u32 = 100;

/// Quality sample contributed by a failed request, in place of its latency.
const FAILURE_SAMPLE: u32 = 4000;

/// Quality ceiling; the floor of 1 keeps split weights positive.
const MAX_QUALITY: u32 = 10_000;

/// One bound replica of the open file.
pub struct Source {
    id: String,
    file: Arc<dyn RemoteFile>,
    quality: AtomicU32,
    last_downgrade: Mutex<Option<Instant>>,
    opened_at: Instant,
}

impl Source {
    /// Binds a replica around a freshly opened handle.
    ///
    /// The id is the handle's `DataServer` property (`host:port`).
    pub(crate) fn new(now: Instant, file: Arc<dyn RemoteFile>) -> Self {
        let id = file
            .property("DataServer")
            .filter(|server| !server.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        debug!(source = %id, "Bound new source");
        Self {
            id,
            file,
            quality: AtomicU32::new(INITIAL_QUALITY),
            last_downgrade: Mutex::new(None),
            opened_at: now,
        }
    }

    /// Printable identifier; the substring before the first `:` is the server
    /// name used in exclusion lists.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current quality; non-negative, lower is better.
    pub fn quality(&self) -> u32 {
        self.quality.load(Ordering::Relaxed)
    }

    /// Raw handle accessor.
    pub fn file(&self) -> Arc<dyn RemoteFile> {
        Arc::clone(&self.file)
    }

    /// When the replica was bound.
    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Last time the source was demoted out of the active set, if ever.
    pub(crate) fn last_downgrade(&self) -> Option<Instant> {
        *self.last_downgrade.lock().expect("source mutex poisoned")
    }

    pub(crate) fn set_last_downgrade(&self, now: Instant) {
        *self.last_downgrade.lock().expect("source mutex poisoned") = Some(now);
    }

    /// Folds one request outcome into the quality scalar.
    ///
    /// Successful requests contribute their latency in milliseconds; failures
    /// contribute a fixed penalty sample. The moving average keeps 3/4 of the
    /// previous value, clamped to [1, 10000].
    pub(crate) fn record_request(&self, latency: Duration, ok: bool) {
        let sample = if ok {
            (latency.as_millis() as u64).clamp(1, MAX_QUALITY as u64) as u32
        } else {
            FAILURE_SAMPLE
        };
        let old = self.quality.load(Ordering::Relaxed);
        let updated = ((3 * old as u64 + sample as u64) / 4).clamp(1, MAX_QUALITY as u64) as u32;
        self.quality.store(updated, Ordering::Relaxed);
        trace!(source = %self.id, quality = updated, sample, "Updated source quality");
    }

    /// Dispatches a request against this replica.
    ///
    /// The spawned task times the transfer, feeds the quality scalar, and
    /// resolves the request's waiter. A failed transfer is handed to the
    /// manager's recovery path instead; the waiter then resolves from the
    /// retry, or with the recovery error.
    pub(crate) fn handle(self: Arc<Self>, request: Arc<ClientRequest>, manager: Arc<RequestManager>) {
        request.set_current_source(Arc::clone(&self));
        tokio::spawn(async move {
            let start = Instant::now();
            let result = match request.kind() {
                RequestKind::Single { offset, len } => self.file.read(*offset, *len).await,
                RequestKind::Vector(segments) => self.file.vector_read(segments).await,
            };
            match result {
                Ok(bytes) => {
                    self.record_request(start.elapsed(), true);
                    request.complete(Ok(bytes));
                }
                Err(status) => {
                    self.record_request(start.elapsed(), false);
                    warn!(source = %self.id, error = %status, "Request failure when reading");
                    if let Err(err) = manager.request_failure(Arc::clone(&request), status).await {
                        request.complete(Err(err));
                    }
                }
            }
        });
    }

    /// Test hook: pins the quality to a known value.
    #[cfg(test)]
    pub(crate) fn set_quality(&self, quality: u32) {
        self.quality.store(quality, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::MockRemoteFile;

    fn test_source(id: &str) -> Source {
        Source::new(Instant::now(), MockRemoteFile::new(id))
    }

    #[test]
    fn test_id_from_data_server_property() {
        let source = test_source("host1.example.org:1094");
        assert_eq!(source.id(), "host1.example.org:1094");
    }

    #[test]
    fn test_quality_moving_average() {
        let source = test_source("host1:1094");
        assert_eq!(source.quality(), INITIAL_QUALITY);

        // Steady 100 ms latency holds the quality at 100.
        source.record_request(Duration::from_millis(100), true);
        assert_eq!(source.quality(), 100);

        // A failure pulls the quality sharply up.
        source.record_request(Duration::from_millis(100), false);
        assert_eq!(source.quality(), (3 * 100 + 4000) / 4);
    }

    #[test]
    fn test_quality_clamped_to_floor() {
        let source = test_source("host1:1094");
        source.set_quality(1);
        source.record_request(Duration::from_micros(10), true);
        assert!(source.quality() >= 1);
    }

    #[test]
    fn test_last_downgrade_starts_unset() {
        let source = test_source("host1:1094");
        assert!(source.last_downgrade().is_none());
        let now = Instant::now();
        source.set_last_downgrade(now);
        assert_eq!(source.last_downgrade(), Some(now));
    }
}
