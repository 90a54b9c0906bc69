//! Requests: the unit of work traversing the pipeline.
//!
//! A [`Request`] wraps a URL from submission to terminal outcome. Roots are
//! created by [`Client::add_urls`](crate::client::Client::add_urls);
//! container expansion creates children that share the root's
//! [`BatchSignal`]. Requests are shared between the queues and the workers
//! via `Arc`, with interior mutability for the fields the resolver rewrites.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

use tokio::sync::watch;
use url::Url;

use crate::file::{File, url_id};
use crate::provider::Provider;

/// Completion signal for a submitted batch of URLs.
///
/// Counts the outstanding work of a batch: the enqueue task plus one slot
/// per root, growing as containers expand. [`BatchSignal::wait`] resolves
/// once every descendant has terminated (resolved, retrieved, offline or
/// errored, depending on mode).
#[derive(Debug)]
pub struct BatchSignal {
    remaining: watch::Sender<usize>,
}

impl BatchSignal {
    pub(crate) fn new(initial: usize) -> Self {
        Self {
            remaining: watch::Sender::new(initial),
        }
    }

    pub(crate) fn add(&self, count: usize) {
        self.remaining.send_modify(|remaining| *remaining += count);
    }

    pub(crate) fn done(&self) {
        self.remaining.send_modify(|remaining| {
            debug_assert!(*remaining > 0, "completion signal underflow");
            *remaining = remaining.saturating_sub(1);
        });
    }

    /// Number of outstanding descendants.
    #[must_use]
    pub fn remaining(&self) -> usize {
        *self.remaining.borrow()
    }

    /// Waits until every descendant of the batch has terminated.
    pub async fn wait(&self) {
        let mut receiver = self.remaining.subscribe();
        // The sender lives in self, so the channel cannot close under us.
        let _ = receiver.wait_for(|&remaining| remaining == 0).await;
    }
}

/// A URL traversing the pipeline.
pub struct Request {
    original: Url,
    current: RwLock<Url>,
    priority: AtomicI32,
    parent: Option<Arc<Request>>,
    signal: Arc<BatchSignal>,
    provider: OnceLock<Arc<dyn Provider>>,
    file: OnceLock<File>,
    expanded: AtomicBool,
    completed: AtomicBool,
    last_provider: Mutex<Option<String>>,
}

impl Request {
    /// Creates a root request with default priority.
    pub(crate) fn new_root(url: Url, signal: Arc<BatchSignal>) -> Arc<Self> {
        Arc::new(Self {
            original: url.clone(),
            current: RwLock::new(url),
            priority: AtomicI32::new(0),
            parent: None,
            signal,
            provider: OnceLock::new(),
            file: OnceLock::new(),
            expanded: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            last_provider: Mutex::new(None),
        })
    }

    /// Creates a child of a container request.
    ///
    /// Children inherit the parent's signal and one priority tier below the
    /// parent, so expansions drain before their peers.
    pub(crate) fn new_child(parent: &Arc<Request>, url: Url) -> Arc<Self> {
        Arc::new(Self {
            original: url.clone(),
            current: RwLock::new(url),
            priority: AtomicI32::new(parent.priority().saturating_sub(1)),
            parent: Some(Arc::clone(parent)),
            signal: Arc::clone(&parent.signal),
            provider: OnceLock::new(),
            file: OnceLock::new(),
            expanded: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            last_provider: Mutex::new(None),
        })
    }

    /// The URL originally submitted for this request. Never mutated.
    #[must_use]
    pub fn original_url(&self) -> &Url {
        &self.original
    }

    /// The current URL, possibly rewritten by provider redirection.
    #[must_use]
    pub fn current_url(&self) -> Url {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_current_url(&self, url: Url) {
        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = url;
    }

    /// Queue priority; lower is served first.
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::SeqCst)
    }

    pub(crate) fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::SeqCst);
    }

    /// Identifier for this request: the hex sha256 of its current URL.
    #[must_use]
    pub fn id(&self) -> String {
        url_id(&self.current_url())
    }

    /// The parent request, for children of a container.
    #[must_use]
    pub fn parent(&self) -> Option<&Arc<Request>> {
        self.parent.as_ref()
    }

    /// The request at the top of this request's fan-out tree. A root's root
    /// is itself.
    #[must_use]
    pub fn root(&self) -> &Request {
        let mut node = self;
        while let Some(parent) = &node.parent {
            node = parent.as_ref();
        }
        node
    }

    /// The terminal file this request resolved into, if any.
    #[must_use]
    pub fn file(&self) -> Option<&File> {
        self.file.get()
    }

    /// The provider that claimed this request, once resolved.
    #[must_use]
    pub fn provider(&self) -> Option<&Arc<dyn Provider>> {
        self.provider.get()
    }

    /// Whether this request has reached a terminal state (bound to a file,
    /// or expanded into children).
    #[must_use]
    pub fn resolved(&self) -> bool {
        self.file.get().is_some() || self.expanded.load(Ordering::SeqCst)
    }

    pub(crate) fn bind_provider(&self, provider: Arc<dyn Provider>) {
        let _ = self.provider.set(provider);
    }

    pub(crate) fn bind_file(&self, file: File) {
        debug_assert!(self.file.get().is_none(), "request resolved twice");
        let _ = self.file.set(file);
    }

    pub(crate) fn mark_expanded(&self) {
        self.expanded.store(true, Ordering::SeqCst);
    }

    /// Releases this request's slot in the batch signal. Idempotent: the
    /// `done()` callback of the bound file and the retrieval error path may
    /// both land here, but only the first decrements.
    pub(crate) fn finish(&self) {
        if !self.completed.swap(true, Ordering::SeqCst) {
            self.signal.done();
        }
    }

    pub(crate) fn signal(&self) -> &Arc<BatchSignal> {
        &self.signal
    }

    /// Records the provider now attempting this request, returning the name
    /// recorded by the previous attempt. Used to break rewrite loops.
    pub(crate) fn record_attempt(&self, provider: &str) -> Option<String> {
        let mut last = self
            .last_provider
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        last.replace(provider.to_string())
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("original", &self.original.as_str())
            .field("current", &self.current_url().as_str())
            .field("priority", &self.priority())
            .field("resolved", &self.resolved())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn root_request(s: &str) -> Arc<Request> {
        Request::new_root(url(s), Arc::new(BatchSignal::new(1)))
    }

    #[test]
    fn test_root_is_its_own_root() {
        let root = root_request("https://host/a");
        assert!(std::ptr::eq(root.root(), &*root));
        assert!(root.parent().is_none());
    }

    #[test]
    fn test_child_inherits_signal_and_priority_tier() {
        let root = root_request("https://host/album");
        let child = Request::new_child(&root, url("https://host/album/1"));
        let grandchild = Request::new_child(&child, url("https://host/album/1/a"));

        assert_eq!(child.priority(), -1);
        assert_eq!(grandchild.priority(), -2);
        assert!(std::ptr::eq(grandchild.root(), &*root));
        assert!(Arc::ptr_eq(child.parent().unwrap(), &root));
    }

    #[test]
    fn test_rewrite_changes_current_but_not_original() {
        let request = root_request("https://host/a");
        let before = request.id();
        request.set_current_url(url("https://cdn/a"));
        assert_eq!(request.original_url().as_str(), "https://host/a");
        assert_eq!(request.current_url().as_str(), "https://cdn/a");
        assert_ne!(request.id(), before);
    }

    #[test]
    fn test_finish_decrements_signal_once() {
        let signal = Arc::new(BatchSignal::new(2));
        let request = Request::new_root(url("https://host/a"), Arc::clone(&signal));
        request.finish();
        request.finish();
        assert_eq!(signal.remaining(), 1);
    }

    #[test]
    fn test_record_attempt_returns_previous_provider() {
        let request = root_request("https://host/a");
        assert_eq!(request.record_attempt("direct"), None);
        assert_eq!(request.record_attempt("direct").as_deref(), Some("direct"));
    }

    #[tokio::test]
    async fn test_signal_wait_resolves_at_zero() {
        let signal = Arc::new(BatchSignal::new(2));
        let waiter = Arc::clone(&signal);
        let handle = tokio::spawn(async move { waiter.wait().await });
        signal.done();
        assert!(!handle.is_finished());
        signal.done();
        handle.await.unwrap();
        assert_eq!(signal.remaining(), 0);
    }

    #[tokio::test]
    async fn test_signal_add_extends_wait() {
        let signal = BatchSignal::new(1);
        signal.add(2);
        signal.done();
        signal.done();
        assert_eq!(signal.remaining(), 1);
        signal.done();
        signal.wait().await;
    }
}
