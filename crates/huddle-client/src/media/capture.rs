//! Capture backends
//!
//! A [`CaptureBackend`] turns a logical source into a [`LocalTrack`] backed by
//! a hardware (or virtual) capture handle. Releasing a track frees its handle
//! exactly once, however many times release is called.

use async_trait::async_trait;
use huddle_protocol::{MediaKind, ProducerSource};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("no capture device for {0}")]
    Unavailable(ProducerSource),

    #[error("capture permission denied: {0}")]
    Denied(String),

    #[error("capture failed: {0}")]
    Failed(String),
}

/// What to capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub source: ProducerSource,
    /// Page to load, for shared-browser sources
    pub url: Option<String>,
}

impl CaptureRequest {
    pub fn new(source: ProducerSource) -> Self {
        Self { source, url: None }
    }

    pub fn browser(source: ProducerSource, url: impl Into<String>) -> Self {
        Self {
            source,
            url: Some(url.into()),
        }
    }
}

/// Invoked once when a track is released
pub type ReleaseHook = Box<dyn FnOnce() + Send + Sync>;

/// A captured local track
pub struct LocalTrack {
    id: Uuid,
    source: ProducerSource,
    label: String,
    released: AtomicBool,
    on_release: Mutex<Option<ReleaseHook>>,
}

impl LocalTrack {
    pub fn new(source: ProducerSource, label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            label: label.into(),
            released: AtomicBool::new(false),
            on_release: Mutex::new(None),
        }
    }

    pub fn with_release_hook(self, hook: ReleaseHook) -> Self {
        if let Ok(mut slot) = self.on_release.lock() {
            *slot = Some(hook);
        }
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source(&self) -> ProducerSource {
        self.source
    }

    pub fn kind(&self) -> MediaKind {
        self.source.kind()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Free the capture handle. Returns `false` if it was already released.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }

        let hook = self.on_release.lock().ok().and_then(|mut slot| slot.take());
        if let Some(hook) = hook {
            hook();
        }
        tracing::debug!(source = %self.source, label = %self.label, "Released capture");
        true
    }
}

impl Drop for LocalTrack {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("label", &self.label)
            .field("released", &self.is_released())
            .finish()
    }
}

#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn open(&self, request: &CaptureRequest) -> Result<LocalTrack, CaptureError>;
}

/// Backend producing placeholder tracks, for headless runs and tests.
///
/// Counts open handles so callers can check nothing leaks.
#[derive(Default)]
pub struct SyntheticCapture {
    open: Arc<AtomicUsize>,
    unavailable: Mutex<HashSet<ProducerSource>>,
}

impl SyntheticCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make future opens of `source` fail
    pub fn disable(&self, source: ProducerSource) {
        if let Ok(mut unavailable) = self.unavailable.lock() {
            unavailable.insert(source);
        }
    }

    pub fn open_handles(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }
}

#[async_trait]
impl CaptureBackend for SyntheticCapture {
    async fn open(&self, request: &CaptureRequest) -> Result<LocalTrack, CaptureError> {
        let disabled = self
            .unavailable
            .lock()
            .map(|unavailable| unavailable.contains(&request.source))
            .unwrap_or(false);
        if disabled {
            return Err(CaptureError::Unavailable(request.source));
        }

        let label = match &request.url {
            Some(url) => format!("synthetic {} ({})", request.source, url),
            None => format!("synthetic {}", request.source),
        };

        self.open.fetch_add(1, Ordering::AcqRel);
        let open = self.open.clone();
        Ok(LocalTrack::new(request.source, label).with_release_hook(Box::new(move || {
            open.fetch_sub(1, Ordering::AcqRel);
        })))
    }
}
