//! The resolver worker: provider dispatch and recursive expansion.
//!
//! A single cooperative task drains the resolver queue, partitions each
//! snapshot by first-match provider and invokes the providers' batched
//! resolution. Each outcome either re-enters the resolver queue (rewrites,
//! expanded children), lands on the resolved queue (online files), or
//! terminates with an event (offline, errored). Completion accounting runs
//! alongside: every terminal outcome and every container expansion releases
//! one slot of the root's batch signal.
//!
//! Batching by provider lets a provider amortize expensive operations over
//! many URLs; within a batch, output order matches input order, and across
//! batches global priority order is honored modulo the grouping.

use std::sync::{Arc, Weak};

use tracing::{debug, error, warn};
use url::Url;

use crate::client::Shared;
use crate::file::File;
use crate::provider::{Provider, ProviderError, Resolution};
use crate::queue::QueueLease;
use crate::request::Request;

/// Worker loop: drains the resolver queue until it closes.
///
/// Holds a lease on the resolved queue for its lifetime, so a finalized
/// resolved queue cannot close while this worker may still produce files.
pub(crate) async fn run(shared: Arc<Shared>, resolved_lease: QueueLease) {
    debug!("resolver starting");
    while let Some((batch, lease)) = shared.resolver_queue.drain_all().await {
        process_batch(&shared, batch).await;
        // Any re-enqueues from this batch have landed; let a finalized
        // resolver queue close.
        drop(lease);
    }
    drop(resolved_lease);
    debug!("resolver exiting");
}

async fn process_batch(shared: &Arc<Shared>, batch: Vec<Arc<Request>>) {
    for (provider, requests) in partition(shared, batch) {
        debug!(
            provider = provider.name(),
            requests = requests.len(),
            "resolving batch"
        );
        let resolutions = provider.resolve(&requests).await;
        if resolutions.len() != requests.len() {
            error!(
                provider = provider.name(),
                expected = requests.len(),
                returned = resolutions.len(),
                "provider returned a mismatched resolution count"
            );
        }
        let mut resolutions = resolutions.into_iter();
        for request in &requests {
            let resolution = resolutions.next().unwrap_or_else(|| {
                Resolution::Error(ProviderError::resolution(
                    &request.current_url(),
                    "provider returned no resolution for this request",
                ))
            });
            apply(shared, &provider, request, resolution).await;
        }
    }
}

/// Partitions a priority-ordered snapshot into per-provider groups,
/// preserving order within each group. Unmatched requests land with the
/// fallback.
fn partition(
    shared: &Shared,
    batch: Vec<Arc<Request>>,
) -> Vec<(Arc<dyn Provider>, Vec<Arc<Request>>)> {
    let mut groups: Vec<(Arc<dyn Provider>, Vec<Arc<Request>>)> = Vec::new();
    for request in batch {
        let provider = shared.providers.resolver_for(&request.current_url());
        match groups.iter_mut().find(|(candidate, _)| {
            candidate.name() == provider.name()
        }) {
            Some((_, requests)) => requests.push(request),
            None => groups.push((provider, vec![request])),
        }
    }
    groups
}

async fn apply(
    shared: &Arc<Shared>,
    provider: &Arc<dyn Provider>,
    request: &Arc<Request>,
    resolution: Resolution,
) {
    let original = request.original_url().clone();
    let current = request.current_url();
    let previous = request.record_attempt(provider.name());

    match resolution {
        Resolution::Rewrite(url) => {
            if url == current && previous.as_deref() == Some(provider.name()) {
                // Same provider, same URL: this would loop forever.
                let error = ProviderError::resolution(&url, "rewrite did not advance the url");
                terminal_error(shared, request, &original, current, error);
            } else {
                debug!(
                    provider = provider.name(),
                    from = %current,
                    to = %url,
                    "rewriting request"
                );
                request.set_current_url(url);
                shared.resolver_queue.enqueue(Arc::clone(request)).await;
            }
        }
        Resolution::Expand(urls) => {
            debug!(
                provider = provider.name(),
                container = %current,
                children = urls.len(),
                "expanding container"
            );
            let children: Vec<Arc<Request>> = urls
                .into_iter()
                .map(|url| Request::new_child(request, url))
                .collect();
            request.signal().add(children.len());
            request.mark_expanded();
            shared.resolver_queue.enqueue_all(children).await;
            // The container contributes nothing to the resolved queue; its
            // own slot terminates here.
            request.finish();
        }
        Resolution::Online(meta) => {
            debug!(provider = provider.name(), url = %meta.url, "resolved online file");
            let file = File::online(meta, provider.name(), original.clone(), done_hook(request));
            request.bind_provider(Arc::clone(provider));
            request.bind_file(file.clone());
            // Re-enter at the root's priority so retrieval preserves the
            // submission order of roots.
            request.set_priority(request.root().priority());
            shared.events.emit_resolve(&original, Some(&file), None);
            shared.resolved_queue.enqueue(Arc::clone(request)).await;
            if shared.resolve_only {
                // No retriever will ever call done() on this file.
                request.finish();
            }
        }
        Resolution::Offline => {
            debug!(url = %current, "resource is offline");
            let file = File::offline(original.clone(), current);
            shared.events.emit_resolve(&original, Some(&file), None);
            shared.events.emit_deadend(&original);
            request.finish();
        }
        Resolution::Error(error) => terminal_error(shared, request, &original, current, error),
    }
}

fn terminal_error(
    shared: &Shared,
    request: &Arc<Request>,
    original: &Url,
    current: Url,
    error: ProviderError,
) {
    warn!(url = %current, error = %error, "resolution failed");
    let file = File::errored(original.clone(), current, error.clone());
    shared.events.emit_resolve(original, None, Some(&error));
    shared.events.emit_error(&file, &error);
    request.finish();
}

/// Completion callback for an online file. Holds a weak reference: the
/// request owns the file, and the file must not keep the request alive.
fn done_hook(request: &Arc<Request>) -> Box<dyn Fn() + Send + Sync> {
    let request: Weak<Request> = Arc::downgrade(request);
    Box::new(move || {
        if let Some(request) = request.upgrade() {
            request.finish();
        }
    })
}
