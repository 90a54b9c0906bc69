//! The client facade: lifecycle, configuration and event hooks.
//!
//! A [`Client`] owns the two queues, the provider registry, the shared HTTP
//! dispatcher and the event bus. Configure it (directory, skip/no-continue
//! flags, providers, accounts), submit URLs with [`Client::add_urls`], then
//! [`Client::start`] the workers. [`Client::finalize`] shuts the pipeline
//! down gracefully once drained; [`Client::stop`] cuts it off immediately.
//!
//! ```no_run
//! use fetchq::Client;
//! use url::Url;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = Client::new();
//! client.directory = "/tmp/downloads".into();
//! client.on_deadend(|url| eprintln!("offline: {url}"));
//!
//! let batch = client.add_urls(vec![Url::parse("https://example.com/a.bin")?]);
//! client.start();
//! batch.wait().await;
//! client.finalize().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};
use url::Url;

use crate::events::EventBus;
use crate::file::File;
use crate::provider::{Account, Config, DirectProvider, Provider, ProviderError, ProviderRegistry};
use crate::queue::Queue;
use crate::request::{BatchSignal, Request};
use crate::resolver;
use crate::retriever::{self, Download};

/// Default number of retriever workers.
pub const DEFAULT_RETRIEVERS: usize = 3;

/// Orchestrates the resolve/retrieve pipeline.
///
/// Must be created and started within a Tokio runtime; the queues and
/// workers run as spawned tasks.
pub struct Client {
    /// Directory downloads are written into.
    pub directory: PathBuf,
    /// Skip files the provider reports as already retrieved.
    pub skip: bool,
    /// Disable HTTP range-resume of partial files.
    pub no_continue: bool,
    providers: ProviderRegistry,
    accounts: Mutex<HashMap<String, Vec<Arc<dyn Account>>>>,
    http: reqwest::Client,
    resolver_queue: Arc<Queue>,
    resolved_queue: Arc<Queue>,
    retrievers: usize,
    dry_run: bool,
    events: Arc<EventBus>,
}

impl Client {
    /// Creates a client with [`DEFAULT_RETRIEVERS`] retriever workers.
    #[must_use]
    pub fn new() -> Self {
        Self::with_retrievers(DEFAULT_RETRIEVERS)
    }

    /// Creates a client with the given number of retriever workers.
    /// With 0, the client works in resolve-only mode.
    #[must_use]
    pub fn with_retrievers(retrievers: usize) -> Self {
        let http = reqwest::Client::new();
        let fallback: Arc<dyn Provider> = Arc::new(DirectProvider::new(http.clone()));
        Self {
            directory: PathBuf::from("."),
            skip: false,
            no_continue: false,
            providers: ProviderRegistry::new(fallback),
            accounts: Mutex::new(HashMap::new()),
            http,
            resolver_queue: Queue::new("resolver"),
            resolved_queue: Queue::new("resolved"),
            retrievers,
            dry_run: false,
            events: Arc::new(EventBus::new()),
        }
    }

    /// Registers a site provider. Registration order is dispatch order.
    pub fn register_provider(&mut self, provider: Arc<dyn Provider>) {
        self.providers.register(provider);
    }

    /// The provider registry.
    #[must_use]
    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// The queue of resolved files awaiting retrieval. Observable (and
    /// drainable by the caller) in resolve-only mode.
    #[must_use]
    pub fn resolved_queue(&self) -> &Arc<Queue> {
        &self.resolved_queue
    }

    /// The queue of unresolved requests awaiting provider dispatch.
    #[must_use]
    pub fn resolver_queue(&self) -> &Arc<Queue> {
        &self.resolver_queue
    }

    /// Changes the priority of a pending unresolved request;
    /// see [`Queue::set_priority`].
    pub async fn set_priority(&self, id: &str, priority: i32) {
        self.resolver_queue.set_priority(id, priority).await;
    }

    /// Submits a batch of URLs, returning its completion signal.
    ///
    /// The signal starts at `urls.len() + 1`; the extra slot is released by
    /// the enqueue task itself. [`BatchSignal::wait`] resolves once every
    /// descendant of the batch has terminated.
    pub fn add_urls(&self, urls: Vec<Url>) -> Arc<BatchSignal> {
        let signal = Arc::new(BatchSignal::new(urls.len() + 1));
        let queue = Arc::clone(&self.resolver_queue);
        let batch = Arc::clone(&signal);
        tokio::spawn(async move {
            let requests: Vec<Arc<Request>> = urls
                .into_iter()
                .map(|url| Request::new_root(url, Arc::clone(&batch)))
                .collect();
            queue.enqueue_all(requests).await;
            batch.done();
        });
        signal
    }

    /// Registers an account with its matching provider.
    ///
    /// # Panics
    ///
    /// Panics when no provider carries the account's declared provider
    /// name; pairing an account with a client that lacks its provider is a
    /// programming error.
    pub fn use_account(&self, account: Arc<dyn Account>) {
        let Some(provider) = self.providers.by_name(account.provider_name()) else {
            panic!(
                "no provider named {:?} in this client",
                account.provider_name()
            );
        };
        debug!(
            provider = provider.name(),
            account = account.id(),
            "registering account"
        );
        lock(&self.accounts)
            .entry(provider.name().to_string())
            .or_default()
            .push(account);
    }

    fn configure(&self) {
        let accounts = lock(&self.accounts);
        for provider in self.providers.iter() {
            let bound = accounts.get(provider.name()).cloned().unwrap_or_default();
            provider.configure(&Config { accounts: bound });
        }
    }

    /// Configures providers with their bound accounts and spawns the
    /// resolver and the retriever workers.
    pub fn start(&self) {
        debug!(retrievers = self.retrievers, "client starting");
        self.configure();
        let shared = Arc::new(Shared {
            directory: self.directory.clone(),
            skip: self.skip,
            no_continue: self.no_continue,
            dry_run: self.dry_run,
            resolve_only: self.retrievers == 0,
            http: self.http.clone(),
            events: Arc::clone(&self.events),
            providers: self.providers.clone(),
            resolver_queue: Arc::clone(&self.resolver_queue),
            resolved_queue: Arc::clone(&self.resolved_queue),
        });
        // Taken before the resolver task exists, so a finalized resolved
        // queue cannot close before the resolver holds it open.
        let resolved_lease = self.resolved_queue.lease();
        tokio::spawn(resolver::run(Arc::clone(&shared), resolved_lease));
        for worker in 0..self.retrievers {
            tokio::spawn(retriever::run(Arc::clone(&shared), worker));
        }
    }

    /// Starts in dry-run mode: files are described on stdout instead of
    /// downloaded.
    pub fn dry_run(&mut self) {
        self.dry_run = true;
        self.start();
    }

    /// Starts in resolve-only mode: no retrievers run, and batch signals do
    /// not wait for retrieval. The resolved queue remains observable via
    /// [`Client::resolved_queue`].
    pub fn resolve(&mut self) {
        self.retrievers = 0;
        self.start();
    }

    /// Marks both queues finalized; once drained, the pipeline terminates
    /// and the workers exit.
    pub async fn finalize(&self) {
        self.resolved_queue.finalize().await;
        self.resolver_queue.finalize().await;
    }

    /// Closes both queues immediately. Workers observe the closure and
    /// exit; pending requests are dropped without further events.
    pub fn stop(&self) {
        self.resolved_queue.stop();
        self.resolver_queue.stop();
    }

    /// Calls the given hook when a download starts.
    pub fn on_download(&self, hook: impl Fn(&Download) + Send + Sync + 'static) {
        self.events.on_download(hook);
    }

    /// Calls the given hook when a download is skipped.
    pub fn on_skip(&self, hook: impl Fn(&File) + Send + Sync + 'static) {
        self.events.on_skip(hook);
    }

    /// Calls the given hook when resolution or retrieval errors.
    pub fn on_error(&self, hook: impl Fn(&File, &ProviderError) + Send + Sync + 'static) {
        self.events.on_error(hook);
    }

    /// Calls the given hook when a resolve job finishes. It receives the
    /// original URL, the file if successful, and the error if not.
    pub fn on_resolve(
        &self,
        hook: impl Fn(&Url, Option<&File>, Option<&ProviderError>) + Send + Sync + 'static,
    ) {
        self.events.on_resolve(hook);
    }

    /// Calls the given hook when a file is offline.
    pub fn on_deadend(&self, hook: impl Fn(&Url) + Send + Sync + 'static) {
        self.events.on_deadend(hook);
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by the resolver and retriever workers.
pub(crate) struct Shared {
    pub(crate) directory: PathBuf,
    pub(crate) skip: bool,
    pub(crate) no_continue: bool,
    pub(crate) dry_run: bool,
    pub(crate) resolve_only: bool,
    pub(crate) http: reqwest::Client,
    pub(crate) events: Arc<EventBus>,
    pub(crate) providers: ProviderRegistry,
    pub(crate) resolver_queue: Arc<Queue>,
    pub(crate) resolved_queue: Arc<Queue>,
}

impl Shared {
    /// In dry-run mode, prints `Would <message>` to stdout and returns
    /// true; otherwise logs the capitalized message and returns false.
    pub(crate) fn announce(&self, message: &str) -> bool {
        if self.dry_run {
            println!("Would {message}");
        } else {
            info!("{}", capitalize(message));
        }
        self.dry_run
    }
}

fn capitalize(message: &str) -> String {
    let mut chars = message.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn lock<'a>(
    accounts: &'a Mutex<HashMap<String, Vec<Arc<dyn Account>>>>,
) -> std::sync::MutexGuard<'a, HashMap<String, Vec<Arc<dyn Account>>>> {
    accounts.lock().unwrap_or_else(PoisonError::into_inner)
}
