//! Detection and embedding capability consumed by the loader and queries.
//!
//! The core never looks inside a face model. It asks a [`FaceDetector`] for
//! regions and a [`FaceEmbedder`] for one descriptor per accepted region.

use crate::descriptor::Descriptor;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("model panicked: {0}")]
    Panicked(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Bounding box of a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl FaceRegion {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another region.
    pub fn iou(&self, other: &FaceRegion) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Locates faces in an image.
pub trait FaceDetector: Send + Sync {
    /// Detected regions, sorted by descending confidence.
    fn detect_faces(&self, image: &DynamicImage) -> Result<Vec<FaceRegion>, BackendError>;
}

/// Turns one detected face into a descriptor.
pub trait FaceEmbedder: Send + Sync {
    fn embed(&self, image: &DynamicImage, face: &FaceRegion) -> Result<Descriptor, BackendError>;
}

/// Shared handle to a detector/embedder pair.
///
/// Cloning is cheap; the loader thread and query callers hold clones of the
/// same models.
#[derive(Clone)]
pub struct FaceBackend {
    detector: Arc<dyn FaceDetector>,
    embedder: Arc<dyn FaceEmbedder>,
}

impl FaceBackend {
    pub fn new(detector: Arc<dyn FaceDetector>, embedder: Arc<dyn FaceEmbedder>) -> Self {
        Self { detector, embedder }
    }

    /// Load the SCRFD detector and ArcFace embedder from ONNX files.
    pub fn onnx(
        detector_path: &str,
        embedder_path: &str,
        intra_threads: usize,
    ) -> Result<Self, BackendError> {
        let detector = crate::detector::ScrfdDetector::load(detector_path, intra_threads)?;
        let embedder = crate::recognizer::ArcFaceEmbedder::load(embedder_path, intra_threads)?;
        Ok(Self::new(Arc::new(detector), Arc::new(embedder)))
    }

    /// Run the detector. A panic inside the model is returned as
    /// [`BackendError::Panicked`].
    pub fn detect_faces(&self, image: &DynamicImage) -> Result<Vec<FaceRegion>, BackendError> {
        contain_panic(|| self.detector.detect_faces(image))
    }

    /// Run the embedder on one region. A panic inside the model is returned
    /// as [`BackendError::Panicked`].
    pub fn embed(
        &self,
        image: &DynamicImage,
        face: &FaceRegion,
    ) -> Result<Descriptor, BackendError> {
        contain_panic(|| self.embedder.embed(image, face))
    }
}

fn contain_panic<T>(
    f: impl FnOnce() -> Result<T, BackendError>,
) -> Result<T, BackendError> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(BackendError::Panicked(msg))
    })
}

impl std::fmt::Debug for FaceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaceBackend").finish_non_exhaustive()
    }
}

/// Deterministic stand-in for the face models.
///
/// Pixel (0, 0) carries the face count in red and a failure mode in green
/// (1 = error, 2 = panic). Every following pixel contributes its three
/// channels to the descriptor.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::path::Path;

    pub const MODE_ERROR: u8 = 1;
    pub const MODE_PANIC: u8 = 2;

    pub struct PixelModel;

    impl FaceDetector for PixelModel {
        fn detect_faces(&self, image: &DynamicImage) -> Result<Vec<FaceRegion>, BackendError> {
            let rgb = image.to_rgb8();
            let header = rgb.get_pixel(0, 0);
            match header.0[1] {
                MODE_ERROR => {
                    return Err(BackendError::InferenceFailed("fake detector failure".into()))
                }
                MODE_PANIC => panic!("fake detector panic"),
                _ => {}
            }
            Ok((0..header.0[0])
                .map(|i| FaceRegion {
                    x: 0.0,
                    y: 0.0,
                    width: rgb.width() as f32,
                    height: rgb.height() as f32,
                    confidence: 1.0 - i as f32 * 0.1,
                    landmarks: None,
                })
                .collect())
        }
    }

    impl FaceEmbedder for PixelModel {
        fn embed(&self, image: &DynamicImage, _face: &FaceRegion) -> Result<Descriptor, BackendError> {
            let rgb = image.to_rgb8();
            let values = rgb
                .pixels()
                .skip(1)
                .flat_map(|p| p.0)
                .map(f32::from)
                .collect();
            Ok(Descriptor::new(values))
        }
    }

    pub fn backend() -> FaceBackend {
        FaceBackend::new(Arc::new(PixelModel), Arc::new(PixelModel))
    }

    /// Image with `faces` detections whose descriptor is `values`, zero-padded
    /// to a multiple of three.
    pub fn image(faces: u8, values: &[u8]) -> DynamicImage {
        image_with_mode(faces, 0, values)
    }

    pub fn image_with_mode(faces: u8, mode: u8, values: &[u8]) -> DynamicImage {
        let pixels = values.len().div_ceil(3);
        let mut img = RgbImage::new(pixels as u32 + 1, 1);
        img.put_pixel(0, 0, Rgb([faces, mode, 0]));
        for (i, chunk) in values.chunks(3).enumerate() {
            let mut px = [0u8; 3];
            px[..chunk.len()].copy_from_slice(chunk);
            img.put_pixel(i as u32 + 1, 0, Rgb(px));
        }
        DynamicImage::ImageRgb8(img)
    }

    pub fn descriptor(values: &[u8]) -> Descriptor {
        let mut padded: Vec<f32> = values.iter().copied().map(f32::from).collect();
        padded.resize(values.len().div_ceil(3) * 3, 0.0);
        Descriptor::new(padded)
    }

    /// Write a PNG reference photo.
    pub fn write_photo(path: &Path, faces: u8, values: &[u8]) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        image(faces, values).save(path).unwrap();
    }
}
