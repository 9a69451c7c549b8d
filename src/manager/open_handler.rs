//! Single-slot asynchronous open driver.
//!
//! At most one open is in flight at a time. Callers that ask for an open
//! while one is already running coalesce onto the same broadcast channel and
//! all receive the one completion, in the manner of a shared future. The
//! completion is published on the channel first and only then integrated
//! into the manager's pool, so a waiter blocked in failure recovery never
//! races the pool update for the handle.

use super::RequestManager;
use crate::error::XrdError;
use crate::monitor;
use crate::source::Source;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Completion of one open attempt, shared between all coalesced waiters.
pub(crate) type OpenOutcome = Result<Arc<Source>, Arc<XrdError>>;

pub(crate) struct OpenHandler {
    state: Mutex<OpenState>,
    /// Set while the owning manager shuts down; a completion arriving after
    /// that must not touch the manager.
    ignore_response: CancellationToken,
}

struct OpenState {
    in_flight: Option<InFlight>,
}

struct InFlight {
    url: String,
    sender: broadcast::Sender<OpenOutcome>,
}

impl OpenHandler {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(OpenState { in_flight: None }),
            ignore_response: CancellationToken::new(),
        }
    }

    /// Starts an open, or joins the one already in flight.
    ///
    /// Never blocks: the open itself runs on its own task. The caller may
    /// hold the manager's pool lock; this function only takes the handler's
    /// own lock. `open_url` carries the already-assembled exclusion opaque.
    pub(crate) fn open(
        &self,
        manager: Arc<RequestManager>,
        open_url: String,
    ) -> broadcast::Receiver<OpenOutcome> {
        let mut state = self.lock_state();
        if let Some(in_flight) = &state.in_flight {
            return in_flight.sender.subscribe();
        }

        info!(url = %open_url, "Trying to open URL");
        let (sender, receiver) = broadcast::channel(4);
        state.in_flight = Some(InFlight {
            url: open_url.clone(),
            sender: sender.clone(),
        });
        let ignore_response = self.ignore_response.clone();
        tokio::spawn(async move {
            let outcome = run_open(&manager, &open_url).await;
            {
                let mut state = manager.open_handler.lock_state();
                state.in_flight = None;
                if ignore_response.is_cancelled() {
                    // Owner is shutting down; dropping the sender wakes any
                    // waiter with a closed channel.
                    return;
                }
                let _ = sender.send(outcome.clone());
            }
            manager.handle_open(outcome);
        });
        receiver
    }

    /// Name of the URL the in-flight open is targeting.
    pub(crate) fn current_source(&self) -> String {
        match &self.lock_state().in_flight {
            Some(in_flight) => in_flight.url.clone(),
            None => "(no open in progress)".to_string(),
        }
    }

    /// Stops accepting completions and waits out any in-flight open.
    pub(crate) async fn shutdown(&self, wait: Duration) {
        let receiver = {
            let state = self.lock_state();
            self.ignore_response.cancel();
            state.in_flight.as_ref().map(|f| f.sender.subscribe())
        };
        if let Some(mut receiver) = receiver {
            warn!("Waiting until the outstanding open completes before shutdown");
            let _ = tokio::time::timeout(wait, receiver.recv()).await;
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, OpenState> {
        self.state.lock().expect("open handler mutex poisoned")
    }
}

/// Runs one open attempt against the client library.
async fn run_open(manager: &Arc<RequestManager>, open_url: &str) -> OpenOutcome {
    match manager.client.open(open_url, manager.flags, manager.perms).await {
        Ok(file) => {
            monitor::send_monitoring_info(&manager.client, file.as_ref());
            Ok(Arc::new(Source::new(Instant::now(), file)))
        }
        Err(open_error) => {
            let mut info = Vec::new();
            if let Some(server) = &open_error.data_server {
                info.push(format!("problematic data server: {}", server));
            }
            if let Some(last_url) = &open_error.last_url {
                info.push(format!("last URL tried: {}", last_url));
            }
            let details = manager.error_details("open", open_error.status, info);
            Err(Arc::new(XrdError::FileOpen(Box::new(details))))
        }
    }
}
