//! faceset-core — Training-set preparation for face classifiers.
//!
//! Walks a folder of images per person, keeps only images with exactly one
//! detectable face, and pairs each face encoding with the person's name.
//! Detection uses SCRFD and encoding uses ArcFace, both via ONNX Runtime.

pub mod alignment;
pub mod dataset;
pub mod detector;
pub mod images;
pub mod models;
pub mod recognizer;
pub mod types;

pub use dataset::{
    discover_people, encode_folder, encode_image, merge, BuildReport, Dataset, DatasetError,
    ImageOutcome, Person,
};
pub use detector::FaceDetector;
pub use models::{default_model_dir, DetectionModel, EncodingModel};
pub use recognizer::FaceRecognizer;
pub use types::{BoundingBox, Encoding, FaceEncoder, FaceLocator};
