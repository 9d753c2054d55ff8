//! Model identifiers and on-disk model resolution.
//!
//! Both detector and encoder models are InsightFace ONNX exports stored as
//! `<model_dir>/<id>.onnx`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelIdError {
    #[error("unknown detection model '{0}' (expected det_10g, det_2.5g or det_500m)")]
    UnknownDetection(String),
    #[error("unknown encoding model '{0}' (expected w600k_r50 or w600k_mbf)")]
    UnknownEncoding(String),
}

/// SCRFD face detection model variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DetectionModel {
    /// SCRFD-10GF, most accurate.
    #[default]
    Scrfd10g,
    Scrfd2_5g,
    /// SCRFD-500MF, fastest.
    Scrfd500m,
}

impl DetectionModel {
    pub fn id(self) -> &'static str {
        match self {
            Self::Scrfd10g => "det_10g",
            Self::Scrfd2_5g => "det_2.5g",
            Self::Scrfd500m => "det_500m",
        }
    }

    pub fn path_in(self, model_dir: &Path) -> PathBuf {
        model_dir.join(format!("{}.onnx", self.id()))
    }
}

impl FromStr for DetectionModel {
    type Err = ModelIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "det_10g" => Ok(Self::Scrfd10g),
            "det_2.5g" => Ok(Self::Scrfd2_5g),
            "det_500m" => Ok(Self::Scrfd500m),
            other => Err(ModelIdError::UnknownDetection(other.to_string())),
        }
    }
}

impl TryFrom<String> for DetectionModel {
    type Error = ModelIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DetectionModel> for String {
    fn from(m: DetectionModel) -> Self {
        m.id().to_string()
    }
}

impl fmt::Display for DetectionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// ArcFace encoding model variant. Both produce 512-dim encodings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EncodingModel {
    /// ResNet-50 backbone trained on WebFace600K.
    #[default]
    W600kR50,
    /// MobileFaceNet backbone trained on WebFace600K.
    W600kMbf,
}

impl EncodingModel {
    pub fn id(self) -> &'static str {
        match self {
            Self::W600kR50 => "w600k_r50",
            Self::W600kMbf => "w600k_mbf",
        }
    }

    pub fn path_in(self, model_dir: &Path) -> PathBuf {
        model_dir.join(format!("{}.onnx", self.id()))
    }
}

impl FromStr for EncodingModel {
    type Err = ModelIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "w600k_r50" => Ok(Self::W600kR50),
            "w600k_mbf" => Ok(Self::W600kMbf),
            other => Err(ModelIdError::UnknownEncoding(other.to_string())),
        }
    }
}

impl TryFrom<String> for EncodingModel {
    type Error = ModelIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EncodingModel> for String {
    fn from(m: EncodingModel) -> Self {
        m.id().to_string()
    }
}

impl fmt::Display for EncodingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Default model directory: `$XDG_DATA_HOME/faceset/models`, falling back to
/// `~/.local/share/faceset/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceset")
        .join("models")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_model_ids_parse_back() {
        for m in [DetectionModel::Scrfd10g, DetectionModel::Scrfd2_5g, DetectionModel::Scrfd500m] {
            assert_eq!(m.id().parse::<DetectionModel>(), Ok(m));
        }
    }

    #[test]
    fn test_encoding_model_ids_parse_back() {
        for m in [EncodingModel::W600kR50, EncodingModel::W600kMbf] {
            assert_eq!(m.to_string().parse::<EncodingModel>(), Ok(m));
        }
    }

    #[test]
    fn test_unknown_ids_rejected() {
        assert_eq!(
            "hog".parse::<DetectionModel>(),
            Err(ModelIdError::UnknownDetection("hog".into()))
        );
        assert!("large".parse::<EncodingModel>().is_err());
    }

    #[test]
    fn test_model_paths() {
        let dir = Path::new("/models");
        assert_eq!(DetectionModel::default().path_in(dir), Path::new("/models/det_10g.onnx"));
        assert_eq!(EncodingModel::W600kMbf.path_in(dir), Path::new("/models/w600k_mbf.onnx"));
    }
}
