//! Named-event hooks for pipeline observers.
//!
//! Consumers register hooks for the pipeline's terminal events; workers
//! invoke them synchronously. Synchronous dispatch is part of the contract:
//! a slow handler blocks the emitting worker, applying backpressure to the
//! pipeline instead of silently dropping or buffering events.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use url::Url;

use crate::file::File;
use crate::provider::ProviderError;
use crate::retriever::Download;

type DownloadHook = Box<dyn Fn(&Download) + Send + Sync>;
type SkipHook = Box<dyn Fn(&File) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&File, &ProviderError) + Send + Sync>;
type ResolveHook = Box<dyn Fn(&Url, Option<&File>, Option<&ProviderError>) + Send + Sync>;
type DeadendHook = Box<dyn Fn(&Url) + Send + Sync>;

/// Hook table for the pipeline's events.
///
/// Hooks may be registered at any time, though ordering with respect to
/// in-flight emissions is not guaranteed. Within one event, hooks run in
/// registration order.
#[derive(Default)]
pub struct EventBus {
    download: RwLock<Vec<DownloadHook>>,
    skip: RwLock<Vec<SkipHook>>,
    error: RwLock<Vec<ErrorHook>>,
    resolve: RwLock<Vec<ResolveHook>>,
    deadend: RwLock<Vec<DeadendHook>>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a hook for started downloads.
    pub fn on_download(&self, hook: impl Fn(&Download) + Send + Sync + 'static) {
        write(&self.download).push(Box::new(hook));
    }

    /// Registers a hook for skipped files.
    pub fn on_skip(&self, hook: impl Fn(&File) + Send + Sync + 'static) {
        write(&self.skip).push(Box::new(hook));
    }

    /// Registers a hook for failed resolutions and retrievals.
    pub fn on_error(&self, hook: impl Fn(&File, &ProviderError) + Send + Sync + 'static) {
        write(&self.error).push(Box::new(hook));
    }

    /// Registers a hook for finished resolve jobs. It receives the original
    /// URL, the file if resolution succeeded, and the error if it did not.
    pub fn on_resolve(
        &self,
        hook: impl Fn(&Url, Option<&File>, Option<&ProviderError>) + Send + Sync + 'static,
    ) {
        write(&self.resolve).push(Box::new(hook));
    }

    /// Registers a hook for offline files; it receives the original URL.
    pub fn on_deadend(&self, hook: impl Fn(&Url) + Send + Sync + 'static) {
        write(&self.deadend).push(Box::new(hook));
    }

    pub(crate) fn emit_download(&self, download: &Download) {
        for hook in read(&self.download).iter() {
            hook(download);
        }
    }

    pub(crate) fn emit_skip(&self, file: &File) {
        for hook in read(&self.skip).iter() {
            hook(file);
        }
    }

    pub(crate) fn emit_error(&self, file: &File, error: &ProviderError) {
        for hook in read(&self.error).iter() {
            hook(file, error);
        }
    }

    pub(crate) fn emit_resolve(
        &self,
        original: &Url,
        file: Option<&File>,
        error: Option<&ProviderError>,
    ) {
        for hook in read(&self.resolve).iter() {
            hook(original, file, error);
        }
    }

    pub(crate) fn emit_deadend(&self, original: &Url) {
        for hook in read(&self.deadend).iter() {
            hook(original);
        }
    }
}

fn read<T>(hooks: &RwLock<Vec<T>>) -> RwLockReadGuard<'_, Vec<T>> {
    hooks.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(hooks: &RwLock<Vec<T>>) -> RwLockWriteGuard<'_, Vec<T>> {
    hooks.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_deadend_hooks_receive_the_original_url() {
        let bus = EventBus::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.on_deadend(move |url| sink.lock().unwrap().push(url.to_string()));

        let url = Url::parse("https://host/dead").unwrap();
        bus.emit_deadend(&url);

        assert_eq!(*seen.lock().unwrap(), vec!["https://host/dead".to_string()]);
    }

    #[test]
    fn test_hooks_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let sink = Arc::clone(&order);
            bus.on_deadend(move |_| sink.lock().unwrap().push(tag));
        }

        bus.emit_deadend(&Url::parse("https://host/x").unwrap());
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_emission_without_hooks_is_a_no_op() {
        let bus = EventBus::new();
        bus.emit_deadend(&Url::parse("https://host/x").unwrap());
    }

    #[test]
    fn test_resolve_hook_sees_error_slot() {
        let bus = EventBus::new();
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        bus.on_resolve(move |_, file, error| {
            assert!(file.is_none());
            if error.is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let url = Url::parse("https://host/x").unwrap();
        let error = ProviderError::resolution(&url, "boom");
        bus.emit_resolve(&url, None, Some(&error));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }
}
