//! Retriever workers: the download side of the pipeline.
//!
//! N retriever workers pop resolved requests from the resolved queue and
//! execute the owning provider's transfer protocol into the configured
//! directory. Each worker runs in its own task; they share the HTTP client,
//! the destination directory and the event bus, but no per-file state.
//!
//! A popped file takes one of three paths:
//! - **skip** — the skip policy applies (skip flag set and the provider
//!   reports the file already retrieved): emit `skip`, complete the file.
//! - **dry-run** — print a one-line description, complete the file without
//!   transferring bytes.
//! - **transfer** — emit `download` with a [`Download`] handle, run the
//!   provider's retrieval, then complete the file (or emit `error`).

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::client::Shared;
use crate::file::File;
use crate::provider::Provider;
use crate::request::Request;
use crate::units;

/// Byte-level progress of one transfer, shared with `download` observers.
#[derive(Debug)]
pub struct TransferProgress {
    transferred: AtomicU64,
    total: Option<u64>,
}

impl TransferProgress {
    pub(crate) fn new(total: Option<u64>) -> Arc<Self> {
        Arc::new(Self {
            transferred: AtomicU64::new(0),
            total,
        })
    }

    /// Bytes transferred so far, including any resumed prefix.
    #[must_use]
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }

    /// Expected total bytes, `None` when the length is unknown.
    #[must_use]
    pub fn total(&self) -> Option<u64> {
        self.total
    }

    pub(crate) fn add(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::SeqCst);
    }

    pub(crate) fn start_at(&self, bytes: u64) {
        self.transferred.store(bytes, Ordering::SeqCst);
    }
}

/// A started download: the file plus its progress source.
pub struct Download {
    file: File,
    progress: Arc<TransferProgress>,
}

impl Download {
    pub(crate) fn new(file: File, progress: Arc<TransferProgress>) -> Self {
        Self { file, progress }
    }

    /// The file being transferred.
    #[must_use]
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Progress of the transfer.
    #[must_use]
    pub fn progress(&self) -> &TransferProgress {
        &self.progress
    }
}

/// Everything a provider needs to perform one transfer.
pub struct RetrieveContext<'a> {
    /// Shared HTTP dispatcher; safe for concurrent use.
    pub client: &'a reqwest::Client,
    /// Directory the file is written into.
    pub dest_dir: &'a Path,
    /// Disables HTTP range-resume of partial files.
    pub no_continue: bool,
    /// Progress sink for the transfer.
    pub progress: &'a TransferProgress,
}

/// Worker loop: pops resolved requests until the resolved queue closes.
pub(crate) async fn run(shared: Arc<Shared>, worker: usize) {
    debug!(worker, "retriever starting");
    while let Some(request) = shared.resolved_queue.dequeue().await {
        let Some(file) = request.file().cloned() else {
            warn!(
                url = %request.current_url(),
                "resolved queue delivered an unresolved request"
            );
            request.finish();
            continue;
        };
        let provider = request
            .provider()
            .cloned()
            .unwrap_or_else(|| Arc::clone(shared.providers.fallback()));
        retrieve_one(&shared, &request, &file, &provider).await;
    }
    debug!(worker, "retriever exiting");
}

async fn retrieve_one(
    shared: &Shared,
    request: &Arc<Request>,
    file: &File,
    provider: &Arc<dyn Provider>,
) {
    if shared.skip && provider.is_retrieved(file, &shared.directory).await {
        debug!(file = file.name(), "skipping already retrieved file");
        shared.events.emit_skip(file);
        file.done();
        return;
    }

    let host = file.url().host_str().unwrap_or("remote").to_string();
    let line = format!(
        "download {} ({}) from {}",
        file.name(),
        size_label(file),
        host
    );
    if shared.announce(&line) {
        // Dry-run: described, not transferred.
        file.done();
        return;
    }

    let progress = TransferProgress::new(file.size());
    let download = Download::new(file.clone(), Arc::clone(&progress));
    shared.events.emit_download(&download);

    let ctx = RetrieveContext {
        client: &shared.http,
        dest_dir: &shared.directory,
        no_continue: shared.no_continue,
        progress: &progress,
    };
    match provider.retrieve(file, &ctx).await {
        Ok(path) => {
            debug!(
                file = file.name(),
                path = %path.display(),
                "retrieval complete"
            );
            file.done();
        }
        Err(error) => {
            warn!(file = file.name(), error = %error, "retrieval failed");
            shared.events.emit_error(file, &error);
            // The batch signal releases independently of the error count.
            request.finish();
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn size_label(file: &File) -> String {
    match file.size() {
        Some(size) => units::bytes_size(size as f64),
        None => "unknown size".to_string(),
    }
}
