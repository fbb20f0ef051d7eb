//! Five-point face alignment to the ArcFace 112×112 template.

use crate::backend::FaceRegion;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

pub const ALIGNED_SIZE: u32 = 112;

/// InsightFace reference landmarks for a 112×112 crop.
const TEMPLATE: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Similarity transform `dst = [a -b; b a] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit from `src` to `dst`. `None` when `src` is degenerate.
    fn fit(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(x, y), p| (x + p.0, y + p.1));
            (sx / 5.0, sy / 5.0)
        };
        let (smx, smy) = mean(src);
        let (dmx, dmy) = mean(dst);

        let mut var = 0.0f32;
        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        for (s, d) in src.iter().zip(dst) {
            let (sx, sy) = (s.0 - smx, s.1 - smy);
            let (dx, dy) = (d.0 - dmx, d.1 - dmy);
            var += sx * sx + sy * sy;
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
        }
        if var < 1e-6 {
            return None;
        }

        let a = dot / var;
        let b = cross / var;
        Some(Self {
            a,
            b,
            tx: dmx - (a * smx - b * smy),
            ty: dmy - (b * smx + a * smy),
        })
    }

    fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let a = self.a / det;
        let b = -self.b / det;
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

/// Produce the 112×112 crop for `face`: warped to the template when
/// landmarks are present, otherwise the bounding box resized.
pub fn align(image: &RgbImage, face: &FaceRegion) -> RgbImage {
    let warped = face
        .landmarks
        .as_ref()
        .and_then(|lm| Similarity::fit(lm, &TEMPLATE))
        .and_then(|m| m.inverse())
        .map(|inv| warp(image, &inv));

    warped.unwrap_or_else(|| crop(image, face))
}

/// Sample the output grid through `inv` (output to source) with bilinear
/// interpolation; outside pixels are black.
fn warp(image: &RgbImage, inv: &Similarity) -> RgbImage {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let fetch = |x: i64, y: i64| -> [f32; 3] {
        if x < 0 || y < 0 || x >= w || y >= h {
            return [0.0; 3];
        }
        image.get_pixel(x as u32, y as u32).0.map(f32::from)
    };

    RgbImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |ox, oy| {
        let (sx, sy) = inv.apply((ox as f32, oy as f32));
        let (x0, y0) = (sx.floor() as i64, sy.floor() as i64);
        let (fx, fy) = (sx - x0 as f32, sy - y0 as f32);

        let tl = fetch(x0, y0);
        let tr = fetch(x0 + 1, y0);
        let bl = fetch(x0, y0 + 1);
        let br = fetch(x0 + 1, y0 + 1);

        Rgb(std::array::from_fn(|c| {
            let v = tl[c] * (1.0 - fx) * (1.0 - fy)
                + tr[c] * fx * (1.0 - fy)
                + bl[c] * (1.0 - fx) * fy
                + br[c] * fx * fy;
            v.round().clamp(0.0, 255.0) as u8
        }))
    })
}

fn crop(image: &RgbImage, face: &FaceRegion) -> RgbImage {
    let (w, h) = image.dimensions();
    let x = face.x.max(0.0).min(w.saturating_sub(1) as f32) as u32;
    let y = face.y.max(0.0).min(h.saturating_sub(1) as f32) as u32;
    let cw = (face.width.max(1.0) as u32).min(w - x).max(1);
    let ch = (face.height.max(1.0) as u32).min(h - y).max(1);

    let region = imageops::crop_imm(image, x, y, cw, ch).to_image();
    imageops::resize(&region, ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle)
}
