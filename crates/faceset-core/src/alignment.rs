//! Face alignment via 4-DOF similarity transform, plus encode-time jitter.
//!
//! Aligns detected faces to a canonical 112×112 crop using the five
//! InsightFace reference landmarks and least-squares estimation. Jitter
//! perturbs that transform with a small random rotation, scale and shift,
//! and optionally mirrors the crop.

use image::{Rgb, RgbImage};
use rand::Rng;

/// ArcFace reference landmarks for a 112×112 output.
pub const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

const JITTER_MAX_ROTATION_DEG: f32 = 3.0;
const JITTER_MAX_SCALE: f32 = 0.05;
const JITTER_MAX_SHIFT_FRAC: f32 = 0.02;
const JITTER_FLIP_PROBABILITY: f64 = 0.5;

/// Similarity transform mapping `(x, y)` to:
/// ```text
/// | a  -b  tx |   | x |
/// | b   a  ty | * | y |
///                 | 1 |
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl SimilarityTransform {
    pub const IDENTITY: Self = Self { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 };

    /// Least-squares estimate of the transform taking `src` onto `dst`.
    ///
    /// Each point pair (sx, sy) -> (dx, dy) contributes two rows:
    ///   sx * a - sy * b + tx = dx
    ///   sy * a + sx * b + ty = dy
    pub fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let mut ata = [[0.0f32; 4]; 4];
        let mut atb = [0.0f32; 4];

        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let r1 = [sx, -sy, 1.0, 0.0];
            let r2 = [sy, sx, 0.0, 1.0];

            for j in 0..4 {
                for k in 0..4 {
                    ata[j][k] += r1[j] * r1[k] + r2[j] * r2[k];
                }
                atb[j] += r1[j] * dx + r2[j] * dy;
            }
        }

        match solve_4x4(ata, atb) {
            Some([a, b, tx, ty]) => Self { a, b, tx, ty },
            None => Self::IDENTITY,
        }
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// Rotation + uniform scale by `scale` about `center`, then a shift.
    pub fn about_center(rotation_rad: f32, scale: f32, center: (f32, f32), shift: (f32, f32)) -> Self {
        let a = scale * rotation_rad.cos();
        let b = scale * rotation_rad.sin();
        let (cx, cy) = center;
        Self {
            a,
            b,
            tx: cx - (a * cx - b * cy) + shift.0,
            ty: cy - (b * cx + a * cy) + shift.1,
        }
    }

    /// Composition `outer ∘ self`: apply `self` first, then `outer`.
    pub fn then(&self, outer: &Self) -> Self {
        let (tx, ty) = outer.apply((self.tx, self.ty));
        Self {
            a: outer.a * self.a - outer.b * self.b,
            b: outer.a * self.b + outer.b * self.a,
            tx,
            ty,
        }
    }

    /// Warp `image` into an `out_size` square crop with bilinear sampling.
    ///
    /// Output pixels that map outside the source are black.
    pub fn warp(&self, image: &RgbImage, out_size: u32) -> RgbImage {
        let det = self.a * self.a + self.b * self.b;
        if det.abs() < 1e-12 {
            return RgbImage::new(out_size, out_size);
        }
        let ia = self.a / det;
        let ib = self.b / det;
        let (w, h) = (image.width() as i64, image.height() as i64);

        RgbImage::from_fn(out_size, out_size, |ox, oy| {
            // Map output pixel back to source: src = M_inv * (dst - t)
            let dx = ox as f32 - self.tx;
            let dy = oy as f32 - self.ty;
            let sx = ia * dx + ib * dy;
            let sy = -ib * dx + ia * dy;

            let x0 = sx.floor() as i64;
            let y0 = sy.floor() as i64;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let sample = |x: i64, y: i64, c: usize| -> f32 {
                if x >= 0 && x < w && y >= 0 && y < h {
                    image.get_pixel(x as u32, y as u32)[c] as f32
                } else {
                    0.0
                }
            };

            let mut px = [0u8; 3];
            for (c, out) in px.iter_mut().enumerate() {
                let val = sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                    + sample(x0 + 1, y0, c) * fx * (1.0 - fy)
                    + sample(x0, y0 + 1, c) * (1.0 - fx) * fy
                    + sample(x0 + 1, y0 + 1, c) * fx * fy;
                *out = val.round().clamp(0.0, 255.0) as u8;
            }
            Rgb(px)
        })
    }
}

/// Solve a 4×4 linear system via Gaussian elimination with partial pivoting.
///
/// Returns `None` for a singular system (e.g. all landmarks coincide).
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: [[f32; 4]; 4], atb: [f32; 4]) -> Option<[f32; 4]> {
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        m[i][..4].copy_from_slice(&ata[i]);
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let max_row = (col..4)
            .max_by(|&r1, &r2| m[r1][col].abs().total_cmp(&m[r2][col].abs()))
            .unwrap_or(col);
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-6 {
            return None;
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    Some(x)
}

/// One random distortion applied on top of the alignment transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jitter {
    pub transform: SimilarityTransform,
    pub flip: bool,
}

impl Jitter {
    pub fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let size = ALIGNED_SIZE as f32;
        let rotation = rng
            .gen_range(-JITTER_MAX_ROTATION_DEG..=JITTER_MAX_ROTATION_DEG)
            .to_radians();
        let scale = 1.0 + rng.gen_range(-JITTER_MAX_SCALE..=JITTER_MAX_SCALE);
        let max_shift = JITTER_MAX_SHIFT_FRAC * size;
        let shift = (
            rng.gen_range(-max_shift..=max_shift),
            rng.gen_range(-max_shift..=max_shift),
        );
        let center = (size / 2.0, size / 2.0);

        Self {
            transform: SimilarityTransform::about_center(rotation, scale, center, shift),
            flip: rng.gen_bool(JITTER_FLIP_PROBABILITY),
        }
    }
}

/// Align a detected face to a canonical 112×112 crop.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    SimilarityTransform::estimate(landmarks, &REFERENCE_LANDMARKS_112).warp(image, ALIGNED_SIZE)
}

/// Align a face and apply `jitter` to the aligned crop.
pub fn align_face_jittered(
    image: &RgbImage,
    landmarks: &[(f32, f32); 5],
    jitter: &Jitter,
) -> RgbImage {
    let transform = SimilarityTransform::estimate(landmarks, &REFERENCE_LANDMARKS_112)
        .then(&jitter.transform);
    let mut crop = transform.warp(image, ALIGNED_SIZE);
    if jitter.flip {
        image::imageops::flip_horizontal_in_place(&mut crop);
    }
    crop
}
