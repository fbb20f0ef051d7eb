//! Filesystem observation with debounced reload requests.
//!
//! `notify` delivers raw events into a channel; a dedicated thread waits for
//! a quiet period with no further relevant events and then invokes the
//! reload callback once.

use crate::loader::CancelToken;
use crossbeam_channel::{Receiver, Sender};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Whether the watcher is observing the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum WatchStatus {
    Active,
    /// Observation could not be set up. Hot reload stays off; the last
    /// installed snapshot keeps serving.
    Dormant,
}

/// Background observer of a database root.
///
/// Dropping or [`stop`](Self::stop)ping it cancels any in-flight reload and
/// joins the thread.
pub struct ChangeWatcher {
    root: PathBuf,
    status: WatchStatus,
    cancel: CancelToken,
    fs_watcher: Option<RecommendedWatcher>,
    shutdown_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ChangeWatcher {
    /// Start watching `root`. After `quiet` elapses with no further change,
    /// `on_quiet` runs on the watcher thread with the watcher's cancel token.
    ///
    /// Setup failures are logged once and yield a [`WatchStatus::Dormant`]
    /// watcher instead of an error.
    pub fn spawn<F>(root: &Path, quiet: Duration, on_quiet: F) -> Self
    where
        F: FnMut(&CancelToken) + Send + 'static,
    {
        let cancel = CancelToken::new();
        let mut watcher = Self {
            root: root.to_path_buf(),
            status: WatchStatus::Dormant,
            cancel: cancel.clone(),
            fs_watcher: None,
            shutdown_tx: None,
            thread: None,
        };

        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let mut fs_watcher = match notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = event_tx.send(res);
        }) {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "cannot create filesystem watcher; hot reload disabled");
                return watcher;
            }
        };
        if let Err(e) = fs_watcher.watch(root, RecursiveMode::Recursive) {
            tracing::warn!(root = %root.display(), error = %e, "cannot watch database root; hot reload disabled");
            return watcher;
        }

        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(0);
        let spawned = std::thread::Builder::new()
            .name("facewatch-watcher".into())
            .spawn(move || {
                tracing::debug!("watcher thread started");
                match run_debounce_loop(&event_rx, &shutdown_rx, quiet, &cancel, on_quiet) {
                    LoopExit::Disconnected => {
                        tracing::warn!("filesystem event source disconnected; hot reload stopped");
                    }
                    exit => tracing::debug!(?exit, "watcher thread exiting"),
                }
            });

        match spawned {
            Ok(handle) => {
                tracing::info!(root = %root.display(), quiet_ms = quiet.as_millis() as u64, "watching database root");
                watcher.status = WatchStatus::Active;
                watcher.fs_watcher = Some(fs_watcher);
                watcher.shutdown_tx = Some(shutdown_tx);
                watcher.thread = Some(handle);
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot spawn watcher thread; hot reload disabled");
            }
        }
        watcher
    }

    pub fn status(&self) -> WatchStatus {
        self.status
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cancel, stop observing and join the thread. Idempotent.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        self.shutdown_tx.take();
        self.fs_watcher.take();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::warn!("watcher thread panicked");
            }
            tracing::info!(root = %self.root.display(), "stopped watching database root");
        }
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Create, modify and remove count as changes. Reads and attribute-only
/// changes do not, so a reload never re-triggers itself.
fn is_relevant(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) | EventKind::Remove(_) => true,
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Modify(_) => true,
        _ => false,
    }
}

/// Why the debounce loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopExit {
    /// The shutdown channel fired or closed.
    Shutdown,
    /// `cancel` was set and the loop noticed it, either at a deadline or
    /// through the event source closing during a stop.
    Cancelled,
    /// The event source closed while nobody asked the loop to stop.
    Disconnected,
}

/// Debounce loop: waits for a quiet period after each burst of relevant
/// events, then calls `on_quiet`.
pub(crate) fn run_debounce_loop<F>(
    events: &Receiver<notify::Result<Event>>,
    shutdown: &Receiver<()>,
    quiet: Duration,
    cancel: &CancelToken,
    mut on_quiet: F,
) -> LoopExit
where
    F: FnMut(&CancelToken),
{
    let mut deadline: Option<Instant> = None;
    let mut error_reported = false;

    loop {
        let timer = match deadline {
            Some(at) => crossbeam_channel::at(at),
            None => crossbeam_channel::never(),
        };

        crossbeam_channel::select! {
            recv(shutdown) -> _ => return LoopExit::Shutdown,
            recv(events) -> msg => match msg {
                Ok(Ok(event)) => {
                    if is_relevant(&event.kind) {
                        tracing::trace!(kind = ?event.kind, paths = ?event.paths, "database change");
                        deadline = Some(Instant::now() + quiet);
                    }
                }
                Ok(Err(e)) if !error_reported => {
                    tracing::warn!(error = %e, "filesystem watcher error");
                    error_reported = true;
                }
                Ok(Err(e)) => tracing::debug!(error = %e, "filesystem watcher error"),
                Err(_) if cancel.is_cancelled() => return LoopExit::Cancelled,
                Err(_) => return LoopExit::Disconnected,
            },
            recv(timer) -> _ => {
                deadline = None;
                if cancel.is_cancelled() {
                    return LoopExit::Cancelled;
                }
                tracing::info!("database changed, reloading");
                on_quiet(cancel);
            }
        }
    }
}
