//! Provider plugins: site-specific URL resolution and retrieval.
//!
//! A [`Provider`] recognizes URLs from a specific site, resolves them into
//! file metadata, child URLs or rewrites, and optionally performs the byte
//! transfer itself. Providers are collected in a [`ProviderRegistry`] that
//! dispatches each URL to the first provider whose [`Provider::can_resolve`]
//! matches; a last-resort [`DirectProvider`] accepts any HTTP(S) URL and
//! treats it as a plain download, so resolution always terminates.
//!
//! # Accounts
//!
//! Providers that support authenticated access accept [`Account`] values
//! through [`Provider::configure`]. An account self-declares the provider it
//! belongs to via [`Account::provider_name`]; the client binds accounts to
//! providers by that name before starting the pipeline.

mod direct;
mod error;
mod http;
mod registry;

pub use direct::DirectProvider;
pub use error::ProviderError;
pub use registry::ProviderRegistry;

use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::file::{File, FileMeta};
use crate::request::Request;
use crate::retriever::RetrieveContext;

/// Outcome of resolving a single request, one per input.
#[derive(Debug)]
pub enum Resolution {
    /// The URL was rewritten (possibly unchanged) and needs another
    /// resolution pass.
    Rewrite(Url),
    /// The URL is a container that expands into child URLs.
    Expand(Vec<Url>),
    /// The URL resolved into an online file with the given metadata.
    Online(FileMeta),
    /// The resource is confirmed offline.
    Offline,
    /// Resolution failed.
    Error(ProviderError),
}

/// An account a provider can authenticate with.
///
/// Implementations declare the provider they belong to by name; binding is
/// a plain name lookup in the registry. Use [`Account::as_any`] to downcast
/// to the concrete account type inside the owning provider.
pub trait Account: fmt::Debug + Send + Sync {
    /// Name of the provider this account belongs to.
    fn provider_name(&self) -> &str;

    /// Display identity of this account (username, email, ...).
    fn id(&self) -> &str;

    /// Downcasting hook for the owning provider.
    fn as_any(&self) -> &dyn Any;
}

/// Configuration handed to a provider before the pipeline starts.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// The accounts bound to this provider.
    pub accounts: Vec<Arc<dyn Account>>,
}

/// A site-specific plugin that resolves and retrieves files.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier for this provider.
    fn name(&self) -> &'static str;

    /// Returns true if this provider recognizes the given URL.
    fn can_resolve(&self, url: &Url) -> bool;

    /// Resolves a batch of same-provider requests.
    ///
    /// Must return exactly one [`Resolution`] per input request, in input
    /// order. Batching lets a provider amortize expensive work (e.g. one
    /// API call for many URLs). A transport failure for one request is
    /// reported as [`Resolution::Error`] for that request; it must not
    /// abort the batch.
    async fn resolve(&self, requests: &[Arc<Request>]) -> Vec<Resolution>;

    /// Accepts the accounts bound to this provider. Called once before the
    /// pipeline starts; the default ignores the configuration.
    fn configure(&self, _config: &Config) {}

    /// Transfers the file into `ctx.dest_dir`, returning the written path.
    ///
    /// The default performs a plain streaming HTTP GET of the file URL with
    /// range-resume (unless disabled) and checksum verification. Providers
    /// with authenticated or multi-step transfers override this.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] when the transfer or its verification
    /// fails.
    async fn retrieve(
        &self,
        file: &File,
        ctx: &RetrieveContext<'_>,
    ) -> Result<PathBuf, ProviderError> {
        http::fetch_to_file(file, ctx).await
    }

    /// Returns true when the file is already present in `dest_dir`, for the
    /// skip-existing policy. The default accepts an existing file whose
    /// length matches the advertised size (any length when the size is
    /// unknown).
    async fn is_retrieved(&self, file: &File, dest_dir: &Path) -> bool {
        http::matches_existing(file, dest_dir).await
    }
}
