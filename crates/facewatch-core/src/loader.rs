//! Builds an [`IdentityStore`] from a directory of reference photos.
//!
//! Layout: every immediate subdirectory of the root is one identity, named
//! after the directory. Each image inside it must contain exactly one face.
//! Only a missing or unreadable root fails the load; everything else is
//! reported as a [`LoadWarning`].

use crate::backend::FaceBackend;
use crate::descriptor::Descriptor;
use crate::store::{Identity, IdentityStore};
use image::ImageFormat;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("database root does not exist: {}", .0.display())]
    RootMissing(PathBuf),
    #[error("database root is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("cannot read database root {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("load cancelled")]
    Cancelled,
}

/// Non-fatal problem found while loading. The affected photo or identity is
/// left out of the store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadWarning {
    #[error("unsupported image format: {}", path.display())]
    UnsupportedFormat { path: PathBuf },
    #[error("cannot read image {}: {reason}", path.display())]
    Unreadable { path: PathBuf, reason: String },
    #[error("no face detected in {}", path.display())]
    NoFace { path: PathBuf },
    #[error("{count} faces detected in {}, reference photos must show one face", path.display())]
    MultipleFaces { path: PathBuf, count: usize },
    #[error("face detection failed for {}: {reason}", path.display())]
    DetectionFailed { path: PathBuf, reason: String },
    #[error("descriptor extraction failed for {}: {reason}", path.display())]
    EmbeddingFailed { path: PathBuf, reason: String },
    #[error("identity {name:?} has no usable reference photo")]
    EmptyIdentity { name: String },
    #[error("invalid identity directory name: {}", path.display())]
    InvalidName { path: PathBuf },
    #[error("cannot read identity directory {}: {reason}", path.display())]
    UnreadableIdentity { path: PathBuf, reason: String },
    #[error("identity directory {} duplicates the name {name:?}", path.display())]
    DuplicateName { name: String, path: PathBuf },
}

/// Cooperative cancellation flag shared between a load and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A freshly built store plus everything that was skipped building it.
#[derive(Debug)]
pub struct LoadReport {
    pub store: IdentityStore,
    pub warnings: Vec<LoadWarning>,
}

impl LoadReport {
    pub fn summary(&self) -> LoadSummary {
        LoadSummary {
            version: self.store.version(),
            identities: self.store.len(),
            descriptors: self.store.descriptor_count(),
            warnings: self.warnings.len(),
        }
    }
}

/// Counts describing one completed load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct LoadSummary {
    pub version: u64,
    pub identities: usize,
    pub descriptors: usize,
    pub warnings: usize,
}

/// Scans a database root with a given face backend.
pub struct Loader {
    backend: FaceBackend,
}

impl Loader {
    pub fn new(backend: FaceBackend) -> Self {
        Self { backend }
    }

    /// Load `root` into a store tagged with `version`.
    pub fn load(&self, root: &Path, version: u64) -> Result<LoadReport, LoadError> {
        self.load_cancellable(root, version, &CancelToken::new())
    }

    /// Like [`load`](Self::load), but gives up with [`LoadError::Cancelled`]
    /// as soon as `cancel` is set. The token is checked between photos.
    pub fn load_cancellable(
        &self,
        root: &Path,
        version: u64,
        cancel: &CancelToken,
    ) -> Result<LoadReport, LoadError> {
        let identity_dirs = list_identity_dirs(root)?;
        tracing::info!(root = %root.display(), version, candidates = identity_dirs.len(), "loading identity database");

        let mut warnings = Vec::new();
        let mut identities = Vec::with_capacity(identity_dirs.len());
        let mut seen = BTreeSet::new();

        for dir in identity_dirs {
            if cancel.is_cancelled() {
                return Err(LoadError::Cancelled);
            }

            let Some(name) = identity_name(&dir) else {
                warn(&mut warnings, LoadWarning::InvalidName { path: dir });
                continue;
            };
            // Directories are sorted, so the first spelling of a name keeps it.
            if !seen.insert(name.clone()) {
                warn(&mut warnings, LoadWarning::DuplicateName { name, path: dir });
                continue;
            }

            let descriptors = self.load_identity(&dir, cancel, &mut warnings)?;
            tracing::debug!(identity = %name, descriptors = descriptors.len(), "identity scanned");

            match Identity::new(name.clone(), descriptors) {
                Some(identity) => identities.push(identity),
                None => warn(&mut warnings, LoadWarning::EmptyIdentity { name }),
            }
        }

        let report = LoadReport {
            store: IdentityStore::new(version, identities),
            warnings,
        };
        let summary = report.summary();
        tracing::info!(
            version = summary.version,
            identities = summary.identities,
            descriptors = summary.descriptors,
            warnings = summary.warnings,
            "identity database loaded"
        );
        Ok(report)
    }

    fn load_identity(
        &self,
        dir: &Path,
        cancel: &CancelToken,
        warnings: &mut Vec<LoadWarning>,
    ) -> Result<Vec<Descriptor>, LoadError> {
        let photos = match list_photos(dir) {
            Ok(photos) => photos,
            Err(e) => {
                warn(
                    warnings,
                    LoadWarning::UnreadableIdentity {
                        path: dir.to_path_buf(),
                        reason: e.to_string(),
                    },
                );
                return Ok(Vec::new());
            }
        };

        let mut descriptors = Vec::with_capacity(photos.len());
        for path in photos {
            if cancel.is_cancelled() {
                return Err(LoadError::Cancelled);
            }
            match self.load_photo(&path) {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(warning) => warn(warnings, warning),
            }
        }
        Ok(descriptors)
    }

    fn load_photo(&self, path: &Path) -> Result<Descriptor, LoadWarning> {
        if ImageFormat::from_path(path).is_err() {
            return Err(LoadWarning::UnsupportedFormat {
                path: path.to_path_buf(),
            });
        }

        let image = image::open(path).map_err(|e| LoadWarning::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let faces = self
            .backend
            .detect_faces(&image)
            .map_err(|e| LoadWarning::DetectionFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let face = match faces.as_slice() {
            [face] => face,
            [] => {
                return Err(LoadWarning::NoFace {
                    path: path.to_path_buf(),
                })
            }
            _ => {
                return Err(LoadWarning::MultipleFaces {
                    path: path.to_path_buf(),
                    count: faces.len(),
                })
            }
        };

        self.backend
            .embed(&image, face)
            .map_err(|e| LoadWarning::EmbeddingFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }
}

fn warn(warnings: &mut Vec<LoadWarning>, warning: LoadWarning) {
    tracing::warn!("{warning}");
    warnings.push(warning);
}

/// Immediate subdirectories of `root`, sorted by path.
fn list_identity_dirs(root: &Path) -> Result<Vec<PathBuf>, LoadError> {
    let metadata = fs::metadata(root).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => LoadError::RootMissing(root.to_path_buf()),
        _ => LoadError::Unreadable {
            path: root.to_path_buf(),
            source: e,
        },
    })?;
    if !metadata.is_dir() {
        return Err(LoadError::NotADirectory(root.to_path_buf()));
    }

    let unreadable = |source: std::io::Error| LoadError::Unreadable {
        path: root.to_path_buf(),
        source,
    };

    let mut dirs = Vec::new();
    for entry in fs::read_dir(root).map_err(unreadable)? {
        let entry = entry.map_err(unreadable)?;
        let path = entry.path();
        if is_hidden(&path) {
            continue;
        }
        // Follows symlinks: a linked identity directory counts.
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Regular files inside an identity directory, sorted by path. Annotated
/// `*_visualize*` renderings are not reference photos.
fn list_photos(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut photos = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !is_hidden(&path) && !is_visualization(&path) && path.is_file() {
            photos.push(path);
        }
    }
    photos.sort();
    Ok(photos)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

fn is_visualization(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.contains("_visualize"))
}

/// Directory name, trimmed. `None` for non-UTF-8 or blank names.
fn identity_name(dir: &Path) -> Option<String> {
    let name = dir.file_name()?.to_str()?.trim();
    (!name.is_empty()).then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake;
    use tempfile::tempdir;

    fn loader() -> Loader {
        Loader::new(fake::backend())
    }

    #[test]
    fn test_missing_root_is_structural() {
        let dir = tempdir().unwrap();
        let err = loader().load(&dir.path().join("nope"), 0).unwrap_err();
        assert!(matches!(err, LoadError::RootMissing(_)), "{err}");
    }

    #[test]
    fn test_file_root_is_structural() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("db.png");
        fake::write_photo(&file, 1, &[1, 2, 3]);
        let err = loader().load(&file, 0).unwrap_err();
        assert!(matches!(err, LoadError::NotADirectory(_)), "{err}");
    }

    #[test]
    fn test_empty_root_loads_empty_store() {
        let dir = tempdir().unwrap();
        let report = loader().load(dir.path(), 0).unwrap();
        assert!(report.store.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_loads_identities_and_ignores_root_files() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fake::write_photo(&root.join("alice/1.png"), 1, &[10, 0, 0]);
        fake::write_photo(&root.join("alice/2.png"), 1, &[12, 1, 0]);
        fake::write_photo(&root.join("bob/a.png"), 1, &[0, 10, 0]);
        fake::write_photo(&root.join("stray.png"), 1, &[0, 0, 10]);

        let report = loader().load(root, 7).unwrap();
        let store = &report.store;

        assert_eq!(store.version(), 7);
        assert_eq!(store.names().collect::<Vec<_>>(), ["alice", "bob"]);
        assert_eq!(store.get("alice").unwrap().descriptors().len(), 2);
        assert_eq!(
            store.get("bob").unwrap().descriptors()[0],
            fake::descriptor(&[0, 10, 0])
        );
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }

    #[test]
    fn test_ambiguous_photos_are_skipped() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fake::write_photo(&root.join("alice/none.png"), 0, &[1, 1, 1]);
        fake::write_photo(&root.join("alice/group.png"), 3, &[2, 2, 2]);
        fake::write_photo(&root.join("alice/good.png"), 1, &[9, 9, 9]);

        let report = loader().load(root, 0).unwrap();
        let alice = report.store.get("alice").unwrap();

        assert_eq!(alice.descriptors(), &[fake::descriptor(&[9, 9, 9])]);
        assert_eq!(report.warnings.len(), 2);
        assert!(report
            .warnings
            .iter()
            .any(|w| matches!(w, LoadWarning::NoFace { .. })));
        assert!(report
            .warnings
            .iter()
            .any(|w| matches!(w, LoadWarning::MultipleFaces { count: 3, .. })));
    }

    #[test]
    fn test_identity_without_usable_photo_is_dropped() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fake::write_photo(&root.join("ghost/blank.png"), 0, &[1, 1, 1]);
        fake::write_photo(&root.join("crowd/party.png"), 2, &[1, 1, 1]);
        fake::write_photo(&root.join("bob/ok.png"), 1, &[5, 5, 5]);
        fs::create_dir_all(root.join("empty")).unwrap();

        let report = loader().load(root, 0).unwrap();

        assert_eq!(report.store.names().collect::<Vec<_>>(), ["bob"]);
        for name in ["crowd", "empty", "ghost"] {
            assert!(
                report
                    .warnings
                    .contains(&LoadWarning::EmptyIdentity { name: name.into() }),
                "missing EmptyIdentity for {name}"
            );
        }
    }

    #[test]
    fn test_unsupported_and_corrupt_files_warn() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fake::write_photo(&root.join("alice/ok.png"), 1, &[3, 3, 3]);
        fs::write(root.join("alice/notes.txt"), "not a photo").unwrap();
        fs::write(root.join("alice/broken.png"), b"\x89PNG garbage").unwrap();
        fs::write(root.join("alice/.DS_Store"), b"").unwrap();

        let report = loader().load(root, 0).unwrap();

        assert_eq!(report.store.get("alice").unwrap().descriptors().len(), 1);
        assert_eq!(report.warnings.len(), 2, "{:?}", report.warnings);
        assert!(report
            .warnings
            .iter()
            .any(|w| matches!(w, LoadWarning::UnsupportedFormat { .. })));
        assert!(report
            .warnings
            .iter()
            .any(|w| matches!(w, LoadWarning::Unreadable { .. })));
    }

    #[test]
    fn test_backend_failure_is_a_warning() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let path = root.join("alice/bad.png");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fake::image_with_mode(1, fake::MODE_ERROR, &[1, 2, 3])
            .save(&path)
            .unwrap();

        let report = loader().load(root, 0).unwrap();
        assert!(report.store.is_empty());
        assert!(matches!(
            report.warnings[0],
            LoadWarning::DetectionFailed { .. }
        ));
    }

    #[test]
    fn test_identity_name_is_trimmed() {
        let dir = tempdir().unwrap();
        fake::write_photo(&dir.path().join(" Jane Doe /p.png"), 1, &[4, 4, 4]);

        let report = loader().load(dir.path(), 0).unwrap();
        assert!(report.store.contains("Jane Doe"));
    }

    #[test]
    fn test_names_equal_after_trimming_are_reported() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fake::write_photo(&root.join("alice/1.png"), 1, &[10, 0, 0]);
        fake::write_photo(&root.join("alice /1.png"), 1, &[0, 10, 0]);

        let report = loader().load(root, 0).unwrap();

        let alice = report.store.get("alice").unwrap();
        assert_eq!(alice.descriptors(), &[fake::descriptor(&[10, 0, 0])]);
        assert_eq!(
            report.warnings,
            [LoadWarning::DuplicateName {
                name: "alice".into(),
                path: root.join("alice "),
            }]
        );
    }

    #[test]
    fn test_visualizations_are_not_reference_photos() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fake::write_photo(&root.join("alice/ref.png"), 1, &[7, 7, 7]);
        fake::write_photo(&root.join("alice/ref_visualize.png"), 2, &[1, 1, 1]);

        let report = loader().load(root, 0).unwrap();

        assert_eq!(report.store.descriptor_count(), 1);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }

    #[test]
    fn test_cancelled_load() {
        let dir = tempdir().unwrap();
        fake::write_photo(&dir.path().join("alice/p.png"), 1, &[4, 4, 4]);

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = loader()
            .load_cancellable(dir.path(), 0, &cancel)
            .unwrap_err();
        assert!(matches!(err, LoadError::Cancelled));
    }

    #[test]
    fn test_summary_counts() {
        let dir = tempdir().unwrap();
        fake::write_photo(&dir.path().join("a/1.png"), 1, &[1, 0, 0]);
        fake::write_photo(&dir.path().join("a/2.png"), 1, &[0, 1, 0]);
        fake::write_photo(&dir.path().join("b/1.png"), 0, &[0, 1, 0]);

        let summary = loader().load(dir.path(), 4).unwrap().summary();
        assert_eq!(
            summary,
            LoadSummary {
                version: 4,
                identities: 1,
                descriptors: 2,
                warnings: 2,
            }
        );
    }
}
