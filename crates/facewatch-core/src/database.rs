//! The database handle: owns the current snapshot and the watcher.
//!
//! Readers load the current [`IdentityStore`] through an `ArcSwapOption`
//! and never take a lock. Writers (initial load, background reloads,
//! explicit installs, shutdown) serialize on a single mutex; the store with
//! the higher version always wins.

use crate::backend::{BackendError, FaceBackend};
use crate::descriptor::Descriptor;
use crate::loader::{CancelToken, LoadError, LoadSummary, LoadWarning, Loader};
use crate::matcher::{match_one, MatchResult};
use crate::store::IdentityStore;
use crate::watcher::{ChangeWatcher, WatchStatus};
use arc_swap::{ArcSwap, ArcSwapOption};
use image::DynamicImage;
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("identity database not loaded")]
    NotLoaded,
    #[error("identity database not available: engine stopped")]
    NotAvailable,
    #[error("identity database already initialized from {}", .0.display())]
    AlreadyInitialized(PathBuf),
    #[error("load failed: {0}")]
    Load(#[from] LoadError),
    #[error("face backend: {0}")]
    Backend(#[from] BackendError),
}

/// Lifecycle of a [`Database`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum DatabaseState {
    Uninitialized,
    Ready,
    /// Terminal: every call fails with [`DatabaseError::NotAvailable`].
    Stopped,
}

impl DatabaseState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Ready,
            2 => Self::Stopped,
            _ => Self::Uninitialized,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Uninitialized => 0,
            Self::Ready => 1,
            Self::Stopped => 2,
        }
    }
}

impl fmt::Display for DatabaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "NOT_LOADED"),
            Self::Ready => write!(f, "LOADED"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// What happened to a store handed to [`Database::install`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed { version: u64 },
    /// A store with an equal or higher version was already current.
    Superseded { current: u64 },
}

struct Shared {
    backend: FaceBackend,
    loader: Loader,
    root: OnceLock<PathBuf>,
    current: ArcSwapOption<IdentityStore>,
    warnings: ArcSwap<Vec<LoadWarning>>,
    state: AtomicU8,
    next_version: AtomicU64,
    /// Cancels `reload_now` loads on shutdown.
    stop: CancelToken,
    /// Serializes every write to `current` and `state`.
    writer: Mutex<()>,
}

impl Shared {
    fn state(&self) -> DatabaseState {
        DatabaseState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn unavailable(&self) -> DatabaseError {
        match self.state() {
            DatabaseState::Stopped => DatabaseError::NotAvailable,
            _ => DatabaseError::NotLoaded,
        }
    }

    fn ensure_ready(&self) -> Result<(), DatabaseError> {
        match self.state() {
            DatabaseState::Ready => Ok(()),
            _ => Err(self.unavailable()),
        }
    }

    fn snapshot(&self) -> Result<Arc<IdentityStore>, DatabaseError> {
        self.current.load_full().ok_or_else(|| self.unavailable())
    }

    /// Build a new store from the root and install it.
    fn reload(&self, cancel: &CancelToken) -> Result<(LoadSummary, InstallOutcome), DatabaseError> {
        self.ensure_ready()?;
        let root = self.root.get().ok_or(DatabaseError::NotLoaded)?;
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let report = self.loader.load_cancellable(root, version, cancel)?;
        let summary = report.summary();
        let outcome = self.install(report.store, report.warnings)?;
        Ok((summary, outcome))
    }

    fn install(
        &self,
        store: IdentityStore,
        warnings: Vec<LoadWarning>,
    ) -> Result<InstallOutcome, DatabaseError> {
        let _writer = self.writer.lock();
        self.ensure_ready()?;

        let version = store.version();
        let current = self.current.load();
        if let Some(current) = &*current {
            if current.version() >= version {
                tracing::debug!(version, current = current.version(), "discarding superseded snapshot");
                return Ok(InstallOutcome::Superseded {
                    current: current.version(),
                });
            }
        }

        self.next_version.fetch_max(version + 1, Ordering::SeqCst);
        self.current.store(Some(Arc::new(store)));
        self.warnings.store(Arc::new(warnings));
        Ok(InstallOutcome::Installed { version })
    }

    fn on_watch_event(&self, cancel: &CancelToken) {
        match self.reload(cancel) {
            Ok((summary, InstallOutcome::Installed { version })) => tracing::info!(
                version,
                identities = summary.identities,
                descriptors = summary.descriptors,
                warnings = summary.warnings,
                "installed reloaded snapshot"
            ),
            Ok((summary, InstallOutcome::Superseded { current })) => tracing::debug!(
                version = summary.version,
                current,
                "reloaded snapshot superseded"
            ),
            Err(DatabaseError::Load(LoadError::Cancelled)) | Err(DatabaseError::NotAvailable) => {
                tracing::debug!("reload discarded after shutdown")
            }
            Err(e) => {
                tracing::warn!(error = %e, "reload failed; keeping current snapshot")
            }
        }
    }
}

/// Identity database with hot reload.
///
/// `Uninitialized -> Ready` on [`load_initial`](Self::load_initial),
/// `Ready -> Stopped` on [`shutdown`](Self::shutdown) or drop.
pub struct Database {
    shared: Arc<Shared>,
    watcher: Mutex<Option<ChangeWatcher>>,
}

impl Database {
    pub fn new(backend: FaceBackend) -> Self {
        Self {
            shared: Arc::new(Shared {
                loader: Loader::new(backend.clone()),
                backend,
                root: OnceLock::new(),
                current: ArcSwapOption::empty(),
                warnings: ArcSwap::from_pointee(Vec::new()),
                state: AtomicU8::new(DatabaseState::Uninitialized.as_u8()),
                next_version: AtomicU64::new(0),
                stop: CancelToken::new(),
                writer: Mutex::new(()),
            }),
            watcher: Mutex::new(None),
        }
    }

    /// Create a handle and load `root` synchronously.
    pub fn open(backend: FaceBackend, root: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let db = Self::new(backend);
        db.load_initial(root)?;
        Ok(db)
    }

    /// First, synchronous load. Structural errors are returned and the
    /// handle stays uninitialized.
    pub fn load_initial(&self, root: impl AsRef<Path>) -> Result<LoadSummary, DatabaseError> {
        let root = root.as_ref();
        let shared = &self.shared;
        let _writer = shared.writer.lock();

        match shared.state() {
            DatabaseState::Uninitialized => {}
            DatabaseState::Ready => {
                let current = shared.root.get().cloned().unwrap_or_default();
                return Err(DatabaseError::AlreadyInitialized(current));
            }
            DatabaseState::Stopped => return Err(DatabaseError::NotAvailable),
        }

        let report = shared.loader.load(root, 0)?;
        let summary = report.summary();

        let _ = shared.root.set(root.to_path_buf());
        shared.next_version.store(1, Ordering::SeqCst);
        shared.current.store(Some(Arc::new(report.store)));
        shared.warnings.store(Arc::new(report.warnings));
        shared
            .state
            .store(DatabaseState::Ready.as_u8(), Ordering::SeqCst);

        tracing::info!(root = %root.display(), identities = summary.identities, "identity database ready");
        Ok(summary)
    }

    /// Begin hot reload with the given quiet period. Calling it again while
    /// a watcher exists has no effect and returns its status.
    pub fn start_watching(&self, debounce: Duration) -> Result<WatchStatus, DatabaseError> {
        let mut slot = self.watcher.lock();
        self.shared.ensure_ready()?;

        if let Some(watcher) = slot.as_ref() {
            tracing::debug!("watcher already running");
            return Ok(watcher.status());
        }

        let root = self.shared.root.get().ok_or(DatabaseError::NotLoaded)?;
        let shared = Arc::clone(&self.shared);
        let watcher = ChangeWatcher::spawn(root, debounce, move |cancel| {
            shared.on_watch_event(cancel);
        });
        let status = watcher.status();
        *slot = Some(watcher);
        Ok(status)
    }

    /// Disable hot reload, joining the watcher. The handle stays ready.
    pub fn stop_watching(&self) {
        let watcher = self.watcher.lock().take();
        if let Some(mut watcher) = watcher {
            watcher.stop();
        }
    }

    pub fn watch_status(&self) -> Option<WatchStatus> {
        self.watcher.lock().as_ref().map(ChangeWatcher::status)
    }

    /// The installed snapshot. Lock-free.
    pub fn current_snapshot(&self) -> Result<Arc<IdentityStore>, DatabaseError> {
        self.shared.snapshot()
    }

    /// Replace the current snapshot unless one with an equal or higher
    /// version is already installed.
    pub fn install(&self, store: IdentityStore) -> Result<InstallOutcome, DatabaseError> {
        self.shared.install(store, Vec::new())
    }

    /// Rebuild from disk now, bypassing the debounce. A structural error
    /// leaves the current snapshot in place.
    pub fn reload_now(&self) -> Result<LoadSummary, DatabaseError> {
        let (summary, _) = self.shared.reload(&self.shared.stop)?;
        Ok(summary)
    }

    /// Identify the most confident face in `image`.
    ///
    /// Never fails because of the image or the models: no face, or a model
    /// error, yields `("unknown", 0.0)`. Only an unusable handle is an error.
    pub fn identify(&self, image: &DynamicImage, threshold: f32) -> Result<MatchResult, DatabaseError> {
        let store = self.shared.snapshot()?;
        Ok(self.identify_in(&store, image, threshold))
    }

    /// Like [`identify`](Self::identify), paired with the version of the
    /// snapshot the result was matched against.
    pub fn identify_with_version(
        &self,
        image: &DynamicImage,
        threshold: f32,
    ) -> Result<(u64, MatchResult), DatabaseError> {
        let store = self.shared.snapshot()?;
        Ok((store.version(), self.identify_in(&store, image, threshold)))
    }

    fn identify_in(&self, store: &IdentityStore, image: &DynamicImage, threshold: f32) -> MatchResult {
        let faces = match self.shared.backend.detect_faces(image) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed for query");
                return MatchResult::unknown();
            }
        };
        let Some(face) = faces.first() else {
            tracing::debug!("no face in query image");
            return MatchResult::unknown();
        };

        match self.shared.backend.embed(image, face) {
            Ok(descriptor) => match_one(&descriptor, store, threshold),
            Err(e) => {
                tracing::warn!(error = %e, "descriptor extraction failed for query");
                MatchResult::unknown()
            }
        }
    }

    /// One result per detected face, in detector order.
    pub fn identify_all(
        &self,
        image: &DynamicImage,
        threshold: f32,
    ) -> Result<Vec<MatchResult>, DatabaseError> {
        let store = self.shared.snapshot()?;

        let faces = match self.shared.backend.detect_faces(image) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed for query");
                return Ok(Vec::new());
            }
        };

        Ok(faces
            .iter()
            .enumerate()
            .map(|(i, face)| match self.shared.backend.embed(image, face) {
                Ok(descriptor) => {
                    let result = match_one(&descriptor, &store, threshold);
                    tracing::debug!(face = i, %result, "face matched");
                    result
                }
                Err(e) => {
                    tracing::warn!(face = i, error = %e, "descriptor extraction failed for query");
                    MatchResult::unknown()
                }
            })
            .collect())
    }

    /// Match a precomputed descriptor.
    pub fn identify_descriptor(
        &self,
        descriptor: &Descriptor,
        threshold: f32,
    ) -> Result<MatchResult, DatabaseError> {
        let store = self.shared.snapshot()?;
        Ok(match_one(descriptor, &store, threshold))
    }

    /// Detection only.
    pub fn count_faces(&self, image: &DynamicImage) -> Result<usize, DatabaseError> {
        if self.state() == DatabaseState::Stopped {
            return Err(DatabaseError::NotAvailable);
        }
        Ok(self.shared.backend.detect_faces(image)?.len())
    }

    pub fn state(&self) -> DatabaseState {
        self.shared.state()
    }

    pub fn root(&self) -> Option<&Path> {
        self.shared.root.get().map(PathBuf::as_path)
    }

    /// Warnings of the load behind the current snapshot.
    pub fn last_warnings(&self) -> Arc<Vec<LoadWarning>> {
        self.shared.warnings.load_full()
    }

    /// Stop the watcher and release every snapshot. Idempotent; later calls
    /// fail with [`DatabaseError::NotAvailable`]. Returns after the watcher
    /// thread has exited.
    pub fn shutdown(&self) {
        {
            let _writer = self.shared.writer.lock();
            if self.shared.state() == DatabaseState::Stopped {
                return;
            }
            self.shared
                .state
                .store(DatabaseState::Stopped.as_u8(), Ordering::SeqCst);
            self.shared.stop.cancel();
            self.shared.current.store(None);
            self.shared.warnings.store(Arc::new(Vec::new()));
        }

        self.stop_watching();
        tracing::info!("identity database stopped");
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("state", &self.state())
            .field("root", &self.root())
            .field("version", &self.shared.current.load_full().map(|s| s.version()))
            .finish()
    }
}
