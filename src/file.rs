//! Remote file objects produced by resolution.
//!
//! A [`File`] is the terminal outcome of resolving a URL: online with
//! provider metadata, confirmed offline, or errored. The three states share
//! a strict call-order contract:
//!
//! 1. [`File::err`] — only if this returns `None` may you continue with
//! 2. [`File::is_offline`] — and only if this also returns `false` is the
//!    file valid and available.
//!
//! Calling a metadata accessor (or [`File::done`]) on an offline or errored
//! file, or [`File::is_offline`] on an errored file, is a programming error
//! and panics.

use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::ser::{Serialize, SerializeMap, Serializer};
use sha2::{Digest, Sha256};
use url::Url;

use crate::provider::ProviderError;

/// JSON sentinel for a file whose length is not known.
pub const SIZE_UNKNOWN: i64 = -1;

/// A checksum advertised by a provider, verified after retrieval.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Checksum {
    /// Lowercase algorithm name (e.g. `sha256`).
    pub algo: String,
    /// Lowercase hex digest.
    pub sum: String,
}

impl Checksum {
    /// Creates a checksum, normalizing algorithm and digest to lowercase.
    #[must_use]
    pub fn new(algo: impl Into<String>, sum: impl Into<String>) -> Self {
        Self {
            algo: algo.into().to_lowercase(),
            sum: sum.into().to_lowercase(),
        }
    }
}

/// Metadata a provider reports for an online file.
#[derive(Debug, Clone)]
pub struct FileMeta {
    /// Display name, typically the basename of the download URL.
    pub name: String,
    /// Length in bytes, `None` when the remote did not advertise one.
    pub size: Option<u64>,
    /// The authenticated download URL.
    pub url: Url,
    /// Optional checksum for post-retrieval verification.
    pub checksum: Option<Checksum>,
}

type DoneFn = Box<dyn Fn() + Send + Sync>;

enum State {
    Online {
        meta: FileMeta,
        provider: String,
        done: DoneFn,
    },
    Offline {
        current: Url,
    },
    Errored {
        current: Url,
        error: ProviderError,
    },
}

struct Inner {
    original: Url,
    state: State,
    pop_order: AtomicI64,
}

/// A remote file object. Cheap to clone; clones share state.
///
/// See the module documentation for the call-order contract.
#[derive(Clone)]
pub struct File {
    inner: Arc<Inner>,
}

impl File {
    pub(crate) fn online(
        meta: FileMeta,
        provider: impl Into<String>,
        original: Url,
        done: DoneFn,
    ) -> Self {
        Self::with_state(
            original,
            State::Online {
                meta,
                provider: provider.into(),
                done,
            },
        )
    }

    pub(crate) fn offline(original: Url, current: Url) -> Self {
        Self::with_state(original, State::Offline { current })
    }

    pub(crate) fn errored(original: Url, current: Url, error: ProviderError) -> Self {
        Self::with_state(original, State::Errored { current, error })
    }

    fn with_state(original: Url, state: State) -> Self {
        Self {
            inner: Arc::new(Inner {
                original,
                state,
                pop_order: AtomicI64::new(-1),
            }),
        }
    }

    /// Returns the error associated with this file, if there is any.
    ///
    /// This is the first call in the contract; see the module docs.
    #[must_use]
    pub fn err(&self) -> Option<&ProviderError> {
        match &self.inner.state {
            State::Errored { error, .. } => Some(error),
            State::Online { .. } | State::Offline { .. } => None,
        }
    }

    /// Returns whether this file is offline.
    ///
    /// # Panics
    ///
    /// Panics when called on an errored file; check [`File::err`] first.
    #[must_use]
    pub fn is_offline(&self) -> bool {
        match &self.inner.state {
            State::Online { .. } => false,
            State::Offline { .. } => true,
            State::Errored { .. } => panic!("is_offline() on errored file {}", self.inner.original),
        }
    }

    /// Display name of the file.
    ///
    /// # Panics
    ///
    /// Panics unless the file is online.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.online_meta("name").name
    }

    /// Length in bytes, `None` when unknown.
    ///
    /// # Panics
    ///
    /// Panics unless the file is online.
    #[must_use]
    pub fn size(&self) -> Option<u64> {
        self.online_meta("size").size
    }

    /// Returns whether this file's length is unknown, e.g. a HEAD response
    /// without `Content-Length`.
    ///
    /// # Panics
    ///
    /// Panics unless the file is online.
    #[must_use]
    pub fn length_unknown(&self) -> bool {
        self.online_meta("length_unknown").size.is_none()
    }

    /// Checksum advertised by the provider, if any.
    ///
    /// # Panics
    ///
    /// Panics unless the file is online.
    #[must_use]
    pub fn checksum(&self) -> Option<&Checksum> {
        self.online_meta("checksum").checksum.as_ref()
    }

    /// Name of the provider that produced this file.
    ///
    /// # Panics
    ///
    /// Panics unless the file is online.
    #[must_use]
    pub fn provider(&self) -> &str {
        match &self.inner.state {
            State::Online { provider, .. } => provider,
            State::Offline { .. } | State::Errored { .. } => {
                panic!("provider() on unavailable file {}", self.inner.original)
            }
        }
    }

    /// The current URL of this file: the download URL when online, the last
    /// resolved URL otherwise.
    #[must_use]
    pub fn url(&self) -> &Url {
        match &self.inner.state {
            State::Online { meta, .. } => &meta.url,
            State::Offline { current } | State::Errored { current, .. } => current,
        }
    }

    /// The original URL that ultimately yielded this file.
    #[must_use]
    pub fn original_url(&self) -> &Url {
        &self.inner.original
    }

    /// Identifier for this file: the hex sha256 of its URL string.
    #[must_use]
    pub fn id(&self) -> String {
        url_id(self.url())
    }

    /// The order in which the file was popped from the resolved queue, or
    /// `-1` if it has not been popped yet.
    #[must_use]
    pub fn seq_num(&self) -> i64 {
        self.inner.pop_order.load(Ordering::SeqCst)
    }

    pub(crate) fn set_pop_order(&self, order: i64) {
        self.inner.pop_order.store(order, Ordering::SeqCst);
    }

    /// Marks this file as done downloading, releasing its slot in the
    /// submitting batch's completion signal.
    ///
    /// # Panics
    ///
    /// Panics unless the file is online.
    pub fn done(&self) {
        match &self.inner.state {
            State::Online { done, .. } => done(),
            State::Offline { .. } | State::Errored { .. } => {
                panic!("done() on unavailable file {}", self.inner.original)
            }
        }
    }

    /// Renders the caller-facing JSON form:
    /// `{id, provider, name, url, size, checksum?}`.
    ///
    /// # Errors
    ///
    /// Errors for offline and errored files, which have no caller-facing
    /// form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    fn online_meta(&self, what: &str) -> &FileMeta {
        match &self.inner.state {
            State::Online { meta, .. } => meta,
            State::Offline { .. } | State::Errored { .. } => {
                panic!("{what}() on unavailable file {}", self.inner.original)
            }
        }
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.inner.state {
            State::Online { .. } => "online",
            State::Offline { .. } => "offline",
            State::Errored { .. } => "errored",
        };
        f.debug_struct("File")
            .field("state", &state)
            .field("url", &self.url().as_str())
            .finish()
    }
}

impl Serialize for File {
    /// Serializes the caller-facing form of an online file:
    /// `{id, provider, name, url, size, checksum?}` with `-1` for an
    /// unknown size.
    ///
    /// Offline and errored files have no caller-facing form; serializing
    /// one is an error.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let State::Online { meta, provider, .. } = &self.inner.state else {
            return Err(serde::ser::Error::custom(
                "cannot serialize an offline or errored file",
            ));
        };
        let entries = if meta.checksum.is_some() { 6 } else { 5 };
        let mut map = serializer.serialize_map(Some(entries))?;
        map.serialize_entry("id", &self.id())?;
        map.serialize_entry("provider", provider)?;
        map.serialize_entry("name", &meta.name)?;
        map.serialize_entry("url", meta.url.as_str())?;
        let size = meta
            .size
            .and_then(|size| i64::try_from(size).ok())
            .unwrap_or(SIZE_UNKNOWN);
        map.serialize_entry("size", &size)?;
        if let Some(checksum) = &meta.checksum {
            map.serialize_entry("checksum", checksum)?;
        }
        map.end()
    }
}

/// Stable identifier for a URL: the hex sha256 of its string form.
pub(crate) fn url_id(url: &Url) -> String {
    hex_encode(&Sha256::digest(url.as_str().as_bytes()))
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(encoded, "{byte:02x}");
    }
    encoded
}
