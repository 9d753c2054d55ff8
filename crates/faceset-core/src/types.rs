use crate::detector::DetectorError;
use crate::recognizer::RecognizerError;
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face encoding vector (512-dimensional for the shipped ArcFace models).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Encoding {
    pub values: Vec<f32>,
    /// Encoding model that produced this vector (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

/// Scale `values` to unit length in place. Zero vectors are left untouched.
pub(crate) fn l2_normalize(values: &mut [f32]) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
}

/// Finds faces in a decoded image.
///
/// Implementations return boxes sorted by confidence, highest first.
pub trait FaceLocator {
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Turns one located face into an encoding.
///
/// `jitters` is the number of randomly distorted re-samplings averaged into
/// the result; 0 and 1 both mean a single undistorted pass.
pub trait FaceEncoder {
    fn encode(
        &mut self,
        image: &RgbImage,
        face: &BoundingBox,
        jitters: u32,
    ) -> Result<Encoding, RecognizerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero_vector() {
        let mut v = vec![0.0; 4];
        l2_normalize(&mut v);
        assert!(v.iter().all(|&x| x == 0.0));
    }
}
