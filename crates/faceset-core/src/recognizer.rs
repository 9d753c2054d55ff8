//! ArcFace face encoder via ONNX Runtime.
//!
//! Produces 512-dimensional encodings from landmark-aligned 112×112 crops.
//! With more than one jitter, each crop is randomly distorted and the
//! per-crop encodings are averaged.

use crate::alignment::{self, Jitter, ALIGNED_SIZE};
use crate::models::EncodingModel;
use crate::types::{l2_normalize, BoundingBox, Encoding, FaceEncoder};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // NOT 128.0 — ArcFace uses symmetric normalization
const ARCFACE_ENCODING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} — download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks — detector must return landmarks for alignment")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based face encoder.
pub struct FaceRecognizer {
    session: Session,
    model_version: String,
    rng: StdRng,
}

impl FaceRecognizer {
    /// Load the ArcFace variant `model` from `model_dir`.
    pub fn load_model(model_dir: &Path, model: EncodingModel) -> Result<Self, RecognizerError> {
        Self::load(&model.path_in(model_dir), model.id())
    }

    /// Load an ArcFace ONNX model; `model_version` is stamped on every encoding.
    pub fn load(model_path: &Path, model_version: &str) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self {
            session,
            model_version: model_version.to_string(),
            rng: StdRng::from_entropy(),
        })
    }

    /// Reseed the jitter sampler so repeated runs produce identical encodings.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Encode one located face, averaging over `jitters` distorted crops.
    pub fn extract(
        &mut self,
        image: &RgbImage,
        face: &BoundingBox,
        jitters: u32,
    ) -> Result<Encoding, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;

        let values = if jitters <= 1 {
            let crop = alignment::align_face(image, landmarks);
            self.infer(&crop)?
        } else {
            let mut encodings = Vec::with_capacity(jitters as usize);
            for _ in 0..jitters {
                let jitter = Jitter::sample(&mut self.rng);
                let crop = alignment::align_face_jittered(image, landmarks, &jitter);
                encodings.push(self.infer(&crop)?);
            }
            mean_encoding(&encodings)
        };

        Ok(Encoding {
            values,
            model_version: Some(self.model_version.clone()),
        })
    }

    /// Run the model on one aligned crop, returning an L2-normalised vector.
    fn infer(&mut self, crop: &RgbImage) -> Result<Vec<f32>, RecognizerError> {
        let input = preprocess(crop);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("encoding extraction: {e}")))?;

        if raw.len() != ARCFACE_ENCODING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_ENCODING_DIM}-dim encoding, got {}",
                raw.len()
            )));
        }

        let mut values = raw.to_vec();
        l2_normalize(&mut values);
        Ok(values)
    }
}

impl FaceEncoder for FaceRecognizer {
    fn encode(
        &mut self,
        image: &RgbImage,
        face: &BoundingBox,
        jitters: u32,
    ) -> Result<Encoding, RecognizerError> {
        self.extract(image, face, jitters)
    }
}

/// Preprocess a 112×112 RGB aligned face crop into a NCHW float tensor.
fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let size = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in crop.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        if x >= size || y >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, y, x]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }

    tensor
}

/// Element-wise mean of unit vectors, renormalised to unit length.
fn mean_encoding(encodings: &[Vec<f32>]) -> Vec<f32> {
    let Some(dim) = encodings.first().map(Vec::len) else {
        return Vec::new();
    };

    let mut mean = vec![0.0f32; dim];
    for enc in encodings {
        for (m, v) in mean.iter_mut().zip(enc) {
            *m += v;
        }
    }
    let n = encodings.len() as f32;
    mean.iter_mut().for_each(|m| *m /= n);
    l2_normalize(&mut mean);
    mean
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_output_shape() {
        let crop = RgbImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Rgb([128, 128, 128]));
        let tensor = preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let crop = RgbImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Rgb([128, 0, 255]));
        let tensor = preprocess(&crop);
        let expected = |p: f32| (p - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((tensor[[0, 0, 5, 7]] - expected(128.0)).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 7]] - expected(0.0)).abs() < 1e-6);
        assert!((tensor[[0, 2, 5, 7]] - expected(255.0)).abs() < 1e-6);
    }

    #[test]
    fn test_mean_encoding_is_unit_length() {
        let encodings = vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0]];
        let mean = mean_encoding(&encodings);
        let norm = mean.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!(mean.iter().all(|&v| (v - mean[0]).abs() < 1e-6));
    }

    #[test]
    fn test_mean_encoding_of_identical_vectors() {
        let v = vec![0.6, 0.8];
        let mean = mean_encoding(&[v.clone(), v.clone(), v.clone()]);
        assert!((mean[0] - 0.6).abs() < 1e-6);
        assert!((mean[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_mean_encoding_empty() {
        assert!(mean_encoding(&[]).is_empty());
    }

    #[test]
    fn test_load_missing_model() {
        let err = FaceRecognizer::load_model(Path::new("/nonexistent"), EncodingModel::W600kR50)
            .err()
            .expect("missing model must fail");
        assert!(matches!(err, RecognizerError::ModelNotFound(p) if p.ends_with("w600k_r50.onnx")));
    }
}
