//! SCRFD face detector via ONNX Runtime.
//!
//! Three-stride anchor decoding over a top-left letterboxed 640×640 RGB
//! input, followed by NMS.

use crate::backend::{BackendError, FaceDetector, FaceRegion};
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use parking_lot::Mutex;
use std::path::Path;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_SCORE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Kind of an SCRFD output tensor, told apart by its last dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Head {
    Score,
    Bbox,
    Kps,
}

/// Output indices for one stride.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    score: Option<usize>,
    bbox: Option<usize>,
    kps: Option<usize>,
}

/// Image scale into the network input. Padding is bottom/right only.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
}

/// SCRFD `det_10g` detector.
pub struct ScrfdDetector {
    session: Mutex<Session>,
}

impl ScrfdDetector {
    pub fn load(model_path: &str, intra_threads: usize) -> Result<Self, BackendError> {
        if !Path::new(model_path).exists() {
            return Err(BackendError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads).map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let outputs = session.outputs().len();
        tracing::info!(
            path = model_path,
            outputs,
            "loaded SCRFD model"
        );
        if outputs < 9 {
            return Err(BackendError::InferenceFailed(format!(
                "SCRFD model needs 9 outputs (score/bbox/kps per stride), got {outputs}"
            )));
        }

        Ok(Self {
            session: Mutex::new(session),
        })
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect_faces(&self, image: &DynamicImage) -> Result<Vec<FaceRegion>, BackendError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(BackendError::InvalidImage("empty image".into()));
        }
        let (input, letterbox) = preprocess(&image.to_rgb8());

        let mut session = self.session.lock();
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut tensors = Vec::with_capacity(outputs.len());
        for i in 0..outputs.len() {
            let (shape, data) = outputs[i]
                .try_extract_tensor::<f32>()
                .map_err(|e| BackendError::InferenceFailed(format!("output {i}: {e}")))?;
            tensors.push((shape.to_vec(), data));
        }

        let shapes: Vec<&[i64]> = tensors.iter().map(|(s, _)| s.as_slice()).collect();
        let layout = classify_outputs(&shapes)?;

        let mut candidates = Vec::new();
        for (slot, &stride) in layout.iter().zip(SCRFD_STRIDES.iter()) {
            let (Some(score), Some(bbox)) = (slot.score, slot.bbox) else {
                return Err(BackendError::InferenceFailed(format!(
                    "missing score/bbox output for stride {stride}"
                )));
            };
            let kps = slot.kps.map(|k| tensors[k].1).unwrap_or(&[]);
            candidates.extend(decode_stride(
                tensors[score].1,
                tensors[bbox].1,
                kps,
                stride,
                letterbox,
                SCRFD_SCORE_THRESHOLD,
            ));
        }
        drop(tensors);
        drop(outputs);
        drop(session);

        let faces = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = faces.len(), "SCRFD detection");
        Ok(faces)
    }
}

/// Resize into the top-left corner of a 640×640 canvas and normalize to NCHW.
/// Padding normalizes to zero.
fn preprocess(rgb: &RgbImage) -> (Array4<f32>, Letterbox) {
    let (w, h) = rgb.dimensions();
    let size = SCRFD_INPUT_SIZE as f32;
    let scale = (size / w as f32).min(size / h as f32);
    let new_w = ((w as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let new_h = ((h as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);

    let resized = imageops::resize(rgb, new_w, new_h, FilterType::Triangle);

    let n = SCRFD_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, n, n));
    for (x, y, px) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px.0[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, Letterbox { scale })
}

fn anchors_for(stride: usize) -> usize {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    grid * grid * SCRFD_ANCHORS_PER_CELL
}

/// Assign every output to a stride and head by its shape: the last dimension
/// is 1, 4 or 10 and the remaining elements count the anchors.
fn classify_outputs(shapes: &[&[i64]]) -> Result<[StrideOutputs; 3], BackendError> {
    let mut layout = [StrideOutputs::default(); 3];

    for (i, shape) in shapes.iter().enumerate() {
        let Some(&last) = shape.last() else { continue };
        let head = match last {
            1 => Head::Score,
            4 => Head::Bbox,
            10 => Head::Kps,
            _ => continue,
        };
        let total: i64 = shape.iter().product();
        let anchors = (total / last) as usize;
        let Some(pos) = SCRFD_STRIDES.iter().position(|&s| anchors_for(s) == anchors) else {
            continue;
        };

        let slot = &mut layout[pos];
        let target = match head {
            Head::Score => &mut slot.score,
            Head::Bbox => &mut slot.bbox,
            Head::Kps => &mut slot.kps,
        };
        if target.replace(i).is_some() {
            return Err(BackendError::InferenceFailed(format!(
                "duplicate {head:?} output for stride {}",
                SCRFD_STRIDES[pos]
            )));
        }
    }

    Ok(layout)
}

/// Decode one stride level into regions in source image coordinates.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: Letterbox,
    threshold: f32,
) -> Vec<FaceRegion> {
    let grid_w = SCRFD_INPUT_SIZE as usize / stride;
    let s = stride as f32;
    let unmap = |v: f32| v / letterbox.scale;

    let mut regions = Vec::new();
    for idx in 0..anchors_for(stride).min(scores.len()) {
        let score = scores[idx];
        if score < threshold {
            continue;
        }
        let Some(d) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let ax = (cell % grid_w) as f32 * s;
        let ay = (cell / grid_w) as f32 * s;

        let x1 = unmap(ax - d[0] * s);
        let y1 = unmap(ay - d[1] * s);
        let x2 = unmap(ax + d[2] * s);
        let y2 = unmap(ay + d[3] * s);

        let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|p| (unmap(ax + k[p * 2] * s), unmap(ay + k[p * 2 + 1] * s)))
        });

        regions.push(FaceRegion {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }
    regions
}

/// Greedy non-maximum suppression; output sorted by descending confidence.
fn nms(mut regions: Vec<FaceRegion>, iou_threshold: f32) -> Vec<FaceRegion> {
    regions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceRegion> = Vec::new();
    for region in regions {
        if keep.iter().all(|k| k.iou(&region) <= iou_threshold) {
            keep.push(region);
        }
    }
    keep
}
