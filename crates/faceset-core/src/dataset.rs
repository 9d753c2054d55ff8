//! Per-person training datasets.
//!
//! A [`Person`] owns a folder of images. Building the dataset keeps only the
//! images in which exactly one face is found and pairs each face encoding
//! with the person's name.

use crate::detector::DetectorError;
use crate::images;
use crate::recognizer::RecognizerError;
use crate::types::{Encoding, FaceEncoder, FaceLocator};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("cannot list {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("misaligned dataset: {encodings} encodings but {labels} labels")]
    Misaligned { encodings: usize, labels: usize },
}

/// Index-aligned training samples: `X[i]` was encoded from an image of `Y[i]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDataset")]
pub struct Dataset {
    #[serde(rename = "X")]
    x: Vec<Encoding>,
    #[serde(rename = "Y")]
    y: Vec<String>,
}

/// Unchecked wire form of [`Dataset`].
#[derive(Deserialize)]
struct RawDataset {
    #[serde(rename = "X")]
    x: Vec<Encoding>,
    #[serde(rename = "Y")]
    y: Vec<String>,
}

impl TryFrom<RawDataset> for Dataset {
    type Error = DatasetError;

    fn try_from(raw: RawDataset) -> Result<Self, Self::Error> {
        if raw.x.len() != raw.y.len() {
            return Err(DatasetError::Misaligned {
                encodings: raw.x.len(),
                labels: raw.y.len(),
            });
        }
        Ok(Self { x: raw.x, y: raw.y })
    }
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one sample. Encodings and labels only ever grow together.
    pub fn push(&mut self, encoding: Encoding, label: impl Into<String>) {
        self.x.push(encoding);
        self.y.push(label.into());
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    pub fn encodings(&self) -> &[Encoding] {
        &self.x
    }

    pub fn labels(&self) -> &[String] {
        &self.y
    }

    /// Iterate (encoding, label) pairs in insertion order.
    pub fn samples(&self) -> impl Iterator<Item = (&Encoding, &str)> {
        self.x.iter().zip(self.y.iter().map(String::as_str))
    }

    /// Append every sample of `other`.
    pub fn extend_from(&mut self, other: &Dataset) {
        self.x.extend_from_slice(&other.x);
        self.y.extend_from_slice(&other.y);
    }

    pub fn clear(&mut self) {
        self.x.clear();
        self.y.clear();
    }

    pub fn into_parts(self) -> (Vec<Encoding>, Vec<String>) {
        (self.x, self.y)
    }
}

/// What happened to a single image during a build.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageOutcome {
    Accepted(Encoding),
    NoFace,
    MultipleFaces(usize),
    Unreadable,
}

/// Per-folder tally of image outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub accepted: usize,
    pub no_face: usize,
    pub multiple_faces: usize,
    pub unreadable: usize,
}

impl BuildReport {
    fn record(&mut self, outcome: &ImageOutcome) {
        match outcome {
            ImageOutcome::Accepted(_) => self.accepted += 1,
            ImageOutcome::NoFace => self.no_face += 1,
            ImageOutcome::MultipleFaces(_) => self.multiple_faces += 1,
            ImageOutcome::Unreadable => self.unreadable += 1,
        }
    }

    /// Number of images examined.
    pub fn total(&self) -> usize {
        self.accepted + self.no_face + self.multiple_faces + self.unreadable
    }

    pub fn discarded(&self) -> usize {
        self.total() - self.accepted
    }

    /// Combine two tallies.
    pub fn merged(self, other: BuildReport) -> BuildReport {
        BuildReport {
            accepted: self.accepted + other.accepted,
            no_face: self.no_face + other.no_face,
            multiple_faces: self.multiple_faces + other.multiple_faces,
            unreadable: self.unreadable + other.unreadable,
        }
    }
}

/// Load one image and encode it if it contains exactly one face.
///
/// An unreadable or corrupt file is reported as [`ImageOutcome::Unreadable`];
/// detector and encoder failures are returned as errors.
pub fn encode_image<L, E>(
    path: &Path,
    locator: &mut L,
    encoder: &mut E,
    jitters: u32,
) -> Result<ImageOutcome, DatasetError>
where
    L: FaceLocator + ?Sized,
    E: FaceEncoder + ?Sized,
{
    let image = match images::load_rgb(path) {
        Ok(image) => image,
        Err(e) => {
            error!(path = %path.display(), error = %e, "image is corrupted, skipping");
            return Ok(ImageOutcome::Unreadable);
        }
    };

    let faces = locator.locate(&image)?;
    match faces.as_slice() {
        [face] => {
            info!(
                path = %path.display(),
                confidence = face.confidence,
                "image has exactly one face, encoding for training"
            );
            let encoding = encoder.encode(&image, face, jitters)?;
            Ok(ImageOutcome::Accepted(encoding))
        }
        [] => {
            warn!(path = %path.display(), "image not suitable for training: no face found");
            Ok(ImageOutcome::NoFace)
        }
        many => {
            warn!(
                path = %path.display(),
                faces = many.len(),
                "image not suitable for training: more than one face found"
            );
            Ok(ImageOutcome::MultipleFaces(many.len()))
        }
    }
}

/// Encode every image in `dir`, keeping the single-face ones in listing order.
pub fn encode_folder<L, E>(
    dir: &Path,
    locator: &mut L,
    encoder: &mut E,
    jitters: u32,
) -> Result<(Vec<Encoding>, BuildReport), DatasetError>
where
    L: FaceLocator + ?Sized,
    E: FaceEncoder + ?Sized,
{
    let files = images::list_image_files(dir).map_err(|source| DatasetError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;
    debug!(dir = %dir.display(), images = files.len(), "iterating images");

    let mut encodings = Vec::new();
    let mut report = BuildReport::default();

    for path in &files {
        let outcome = encode_image(path, locator, encoder, jitters)?;
        report.record(&outcome);
        if let ImageOutcome::Accepted(encoding) = outcome {
            encodings.push(encoding);
        }
    }

    Ok((encodings, report))
}

/// One person to classify: a name and the folder holding their face images.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Person {
    pub name: String,
    pub path: PathBuf,
    dataset: Dataset,
}

impl Person {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            dataset: Dataset::new(),
        }
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn into_dataset(self) -> Dataset {
        self.dataset
    }

    /// Populate the dataset from the images under `path`.
    ///
    /// Replaces any previous samples. When `path` is empty or not a directory
    /// the dataset is left empty.
    pub fn init_dataset<L, E>(
        &mut self,
        locator: &mut L,
        encoder: &mut E,
        jitters: u32,
    ) -> Result<BuildReport, DatasetError>
    where
        L: FaceLocator + ?Sized,
        E: FaceEncoder + ?Sized,
    {
        self.dataset.clear();

        if self.path.as_os_str().is_empty() || !self.path.is_dir() {
            warn!(person = %self.name, path = %self.path.display(), "no image directory, dataset left empty");
            return Ok(BuildReport::default());
        }

        let (encodings, report) = encode_folder(&self.path, locator, encoder, jitters)?;
        for encoding in encodings {
            self.dataset.push(encoding, self.name.as_str());
        }

        debug!(
            person = %self.name,
            entries = self.dataset.len(),
            discarded = report.discarded(),
            "dataset initialised"
        );
        Ok(report)
    }
}

/// One [`Person`] per immediate subdirectory of `root`, named after it.
pub fn discover_people(root: &Path) -> Result<Vec<Person>, DatasetError> {
    let read_dir_err = |source| DatasetError::ReadDir {
        path: root.to_path_buf(),
        source,
    };

    let mut people = Vec::new();
    for entry in std::fs::read_dir(root).map_err(read_dir_err)? {
        let path = entry.map_err(read_dir_err)?.path();
        if !path.is_dir() {
            continue;
        }
        match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => people.push(Person::new(name, &path)),
            None => warn!(path = %path.display(), "skipping directory with non-UTF-8 name"),
        }
    }
    people.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(people)
}

/// Concatenate every person's samples into one training set.
pub fn merge(people: &[Person]) -> Dataset {
    let mut all = Dataset::new();
    for person in people {
        all.extend_from(&person.dataset);
    }
    all
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(v: f32) -> Encoding {
        Encoding { values: vec![v], model_version: None }
    }

    #[test]
    fn test_push_keeps_lists_aligned() {
        let mut ds = Dataset::new();
        ds.push(enc(1.0), "alice");
        ds.push(enc(2.0), String::from("alice"));
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.encodings().len(), ds.labels().len());
        let pairs: Vec<_> = ds.samples().map(|(e, l)| (e.values[0], l)).collect();
        assert_eq!(pairs, [(1.0, "alice"), (2.0, "alice")]);
    }

    #[test]
    fn test_deserialize_aligned_dataset() {
        let json = r#"{"X": [{"values": [0.6, 0.8], "model_version": "w600k_r50"}], "Y": ["alice"]}"#;
        let ds: Dataset = serde_json::from_str(json).unwrap();
        assert_eq!(ds.len(), 1);
        assert_eq!(ds.labels(), ["alice"]);

        let back: Dataset = serde_json::from_str(&serde_json::to_string(&ds).unwrap()).unwrap();
        assert_eq!(back, ds);
    }

    #[test]
    fn test_deserialize_rejects_misaligned_lists() {
        let json = r#"{"X": [{"values": [1.0], "model_version": null}], "Y": ["a", "b", "c"]}"#;
        let err = serde_json::from_str::<Dataset>(json).unwrap_err();
        assert!(err.to_string().contains("1 encodings but 3 labels"), "{err}");
    }

    #[test]
    fn test_report_counts() {
        let mut report = BuildReport::default();
        for outcome in [
            ImageOutcome::Accepted(enc(0.0)),
            ImageOutcome::NoFace,
            ImageOutcome::MultipleFaces(3),
            ImageOutcome::Unreadable,
            ImageOutcome::NoFace,
        ] {
            report.record(&outcome);
        }
        assert_eq!(report, BuildReport { accepted: 1, no_face: 2, multiple_faces: 1, unreadable: 1 });
        assert_eq!(report.total(), 5);
        assert_eq!(report.discarded(), 4);
        assert_eq!(report.merged(report).total(), 10);
    }

    #[test]
    fn test_merge_concatenates_people() {
        let mut alice = Person::new("alice", "");
        alice.dataset.push(enc(1.0), "alice");
        let mut bob = Person::new("bob", "");
        bob.dataset.push(enc(2.0), "bob");
        bob.dataset.push(enc(3.0), "bob");

        let (x, y) = merge(&[alice, bob]).into_parts();
        assert_eq!(x.len(), 3);
        assert_eq!(y, ["alice", "bob", "bob"]);
    }

    #[test]
    fn test_discover_people_missing_root() {
        let err = discover_people(Path::new("/nonexistent/faceset-root")).unwrap_err();
        assert!(matches!(err, DatasetError::ReadDir { .. }));
    }
}
