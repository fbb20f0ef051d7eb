//! facewatch-core: face identity database with hot reload.
//!
//! A directory of reference photos (one subdirectory per person) is turned
//! into an immutable [`IdentityStore`] snapshot. A [`Database`] serves
//! lock-free queries against the current snapshot while a background
//! watcher rebuilds and atomically swaps it when the directory changes.
//!
//! Detection and descriptor extraction sit behind the [`FaceDetector`] and
//! [`FaceEmbedder`] traits; the bundled implementations run SCRFD and
//! ArcFace via ONNX Runtime.

mod alignment;
pub mod backend;
pub mod config;
pub mod database;
pub mod descriptor;
pub mod detector;
pub mod loader;
pub mod matcher;
pub mod recognizer;
pub mod store;
pub mod watcher;

pub use backend::{BackendError, FaceBackend, FaceDetector, FaceEmbedder, FaceRegion};
pub use config::{Config, ConfigError};
pub use database::{Database, DatabaseError, DatabaseState, InstallOutcome};
pub use descriptor::Descriptor;
pub use loader::{CancelToken, LoadError, LoadReport, LoadSummary, LoadWarning, Loader};
pub use matcher::{match_one, MatchResult, UNKNOWN};
pub use store::{Identity, IdentityStore};
pub use watcher::{ChangeWatcher, WatchStatus};
