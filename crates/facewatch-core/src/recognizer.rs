//! ArcFace embedder via ONNX Runtime.
//!
//! Produces L2-normalized 512-dimensional descriptors from aligned
//! 112×112 RGB crops, using the w600k_r50 model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::backend::{BackendError, FaceEmbedder, FaceRegion};
use crate::descriptor::Descriptor;
use image::{DynamicImage, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use parking_lot::Mutex;
use std::path::Path;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_DESCRIPTOR_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

pub struct ArcFaceEmbedder {
    session: Mutex<Session>,
}

impl ArcFaceEmbedder {
    pub fn load(model_path: &str, intra_threads: usize) -> Result<Self, BackendError> {
        if !Path::new(model_path).exists() {
            return Err(BackendError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads).map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded ArcFace model");

        Ok(Self {
            session: Mutex::new(session),
        })
    }
}

impl FaceEmbedder for ArcFaceEmbedder {
    fn embed(&self, image: &DynamicImage, face: &FaceRegion) -> Result<Descriptor, BackendError> {
        if face.landmarks.is_none() {
            tracing::debug!("face has no landmarks; embedding bounding-box crop");
        }
        let aligned = alignment::align(&image.to_rgb8(), face);
        let input = preprocess(&aligned);

        let raw: Vec<f32> = {
            let mut session = self.session.lock();
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            let (_, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| BackendError::InferenceFailed(format!("descriptor extraction: {e}")))?;
            data.to_vec()
        };

        if raw.len() != ARCFACE_DESCRIPTOR_DIM {
            return Err(BackendError::InferenceFailed(format!(
                "expected {ARCFACE_DESCRIPTOR_DIM}-dim descriptor, got {}",
                raw.len()
            )));
        }

        Ok(Descriptor::with_model_version(raw, ARCFACE_MODEL_VERSION).normalized())
    }
}

/// 112×112 RGB crop to a normalized NCHW tensor.
fn preprocess(aligned: &RgbImage) -> Array4<f32> {
    let size = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, px) in aligned.enumerate_pixels() {
        if x as usize >= size || y as usize >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px.0[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}
