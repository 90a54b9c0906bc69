//! Fallback provider treating any HTTP(S) URL as a direct download.
//!
//! [`DirectProvider`] is the registry's last resort: it accepts every
//! HTTP(S) URL, probes it with a HEAD request for name and size, and relies
//! on the default streaming retrieval. It doubles as the reference
//! implementation for provider authors.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use crate::file::FileMeta;
use crate::request::Request;

use super::{Provider, ProviderError, Resolution};

/// The last-resort provider: plain HTTP downloads.
pub struct DirectProvider {
    client: reqwest::Client,
}

impl DirectProvider {
    /// Creates a direct provider sharing the client's HTTP dispatcher.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn probe(&self, url: Url) -> Resolution {
        debug!(url = %url, "probing direct url");
        match self.client.head(url.clone()).send().await {
            Ok(response) => {
                let status = response.status();
                if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
                    return Resolution::Offline;
                }
                if !status.is_success() {
                    return Resolution::Error(ProviderError::status(&url, status));
                }
                // The probe may have been redirected; keep the final URL so
                // the retrieval doesn't repeat the hops.
                let resolved = response.url().clone();
                Resolution::Online(FileMeta {
                    name: filename_from(&resolved),
                    size: response.content_length(),
                    url: resolved,
                    checksum: None,
                })
            }
            Err(error) => Resolution::Error(ProviderError::transport(&url, &error)),
        }
    }
}

#[async_trait]
impl Provider for DirectProvider {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn can_resolve(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
    }

    async fn resolve(&self, requests: &[Arc<Request>]) -> Vec<Resolution> {
        join_all(
            requests
                .iter()
                .map(|request| self.probe(request.current_url())),
        )
        .await
    }
}

/// Derives a display name from the last non-empty path segment, falling
/// back to the host.
fn filename_from(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| url.host_str().unwrap_or("download").to_string())
}
