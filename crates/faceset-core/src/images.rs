//! Image folder listing and decoding.

use image::{ImageError, ImageReader, RgbImage};
use std::io;
use std::path::{Path, PathBuf};

/// Extensions treated as candidate face images (compared case-insensitively).
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Whether `path` has one of the [`IMAGE_EXTENSIONS`].
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.iter().any(|ext| e.eq_ignore_ascii_case(ext)))
}

/// List the image files directly inside `dir`, sorted by path.
///
/// Subdirectories are not descended into.
pub fn list_image_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_image_file(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Decode an image file into 8-bit RGB.
///
/// The format is sniffed from the file contents, so a PNG saved with a
/// `.jpg` extension still decodes.
pub fn load_rgb(path: &Path) -> Result<RgbImage, ImageError> {
    let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    Ok(image.to_rgb8())
}
