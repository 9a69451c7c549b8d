//! Read requests and their completion plumbing.

use crate::error::XrdError;
use crate::source::Source;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// One entry of a vector read: `len` bytes at file offset `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoSegment {
    pub offset: u64,
    pub len: u64,
}

impl IoSegment {
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    /// First offset past the segment.
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// The shape of a client read.
#[derive(Debug, Clone)]
pub(crate) enum RequestKind {
    Single { offset: u64, len: u64 },
    Vector(Vec<IoSegment>),
}

/// A dispatched read carrying its one-shot completion channel.
///
/// The request outlives individual dispatch attempts: on failover the same
/// request is re-issued against the replacement source, and the waiter
/// resolves from whichever attempt completes it.
pub(crate) struct ClientRequest {
    kind: RequestKind,
    size: u64,
    sender: Mutex<Option<oneshot::Sender<Result<u64, XrdError>>>>,
    receiver: Mutex<Option<oneshot::Receiver<Result<u64, XrdError>>>>,
    current_source: Mutex<Option<Arc<Source>>>,
}

impl ClientRequest {
    pub(crate) fn single(offset: u64, len: u64) -> Arc<Self> {
        Self::new(RequestKind::Single { offset, len })
    }

    pub(crate) fn vector(segments: Vec<IoSegment>) -> Arc<Self> {
        Self::new(RequestKind::Vector(segments))
    }

    fn new(kind: RequestKind) -> Arc<Self> {
        let size = match &kind {
            RequestKind::Single { len, .. } => *len,
            RequestKind::Vector(segments) => segments.iter().map(|io| io.len).sum(),
        };
        let (sender, receiver) = oneshot::channel();
        Arc::new(Self {
            kind,
            size,
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            current_source: Mutex::new(None),
        })
    }

    pub(crate) fn kind(&self) -> &RequestKind {
        &self.kind
    }

    /// Total bytes the request covers.
    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    /// The source the request is currently dispatched against.
    pub(crate) fn current_source(&self) -> Option<Arc<Source>> {
        self.current_source.lock().expect("request mutex poisoned").clone()
    }

    pub(crate) fn set_current_source(&self, source: Arc<Source>) {
        *self.current_source.lock().expect("request mutex poisoned") = Some(source);
    }

    /// Resolves the waiter. Only the first completion counts; a late one from
    /// a superseded dispatch attempt is dropped.
    pub(crate) fn complete(&self, result: Result<u64, XrdError>) {
        if let Some(sender) = self.sender.lock().expect("request mutex poisoned").take() {
            let _ = sender.send(result);
        }
    }

    /// Waits for the request to complete.
    ///
    /// Returns `None` if every dispatch attempt was dropped without
    /// completing the request. Awaiting twice is a bug in the caller.
    pub(crate) async fn wait(&self) -> Option<Result<u64, XrdError>> {
        let receiver = self
            .receiver
            .lock()
            .expect("request mutex poisoned")
            .take()
            .expect("request awaited twice");
        receiver.await.ok()
    }
}
