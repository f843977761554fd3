//! Image file resolution, decoding and transport encoding.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use base64::Engine;
use image::{ImageFormat, RgbImage};

use crate::error::InferenceError;

/// Resolve a record's stored path against the uploads root.
///
/// Absolute paths are used as-is; relative ones are joined onto `uploads_root`
/// when it is configured.
pub fn resolve_path(uploads_root: Option<&Path>, stored: &str) -> PathBuf {
    let stored = Path::new(stored);
    match uploads_root {
        Some(root) if stored.is_relative() => root.join(stored),
        _ => stored.to_path_buf(),
    }
}

/// Whether the file at `path` exists and can be opened for reading
pub fn is_readable(path: &Path) -> bool {
    std::fs::File::open(path)
        .and_then(|file| file.metadata())
        .is_ok_and(|meta| meta.is_file())
}

/// Decode any supported image format to 8-bit RGB
pub fn decode_image(path: &Path) -> Result<RgbImage, InferenceError> {
    let image = image::ImageReader::open(path)
        .map_err(|e| InferenceError::ImageDecode {
            path: path.display().to_string(),
            source: image::ImageError::IoError(e),
        })?
        .with_guessed_format()
        .map_err(|e| InferenceError::ImageDecode {
            path: path.display().to_string(),
            source: image::ImageError::IoError(e),
        })?
        .decode()
        .map_err(|e| InferenceError::ImageDecode {
            path: path.display().to_string(),
            source: e,
        })?;

    Ok(image.to_rgb8())
}

/// PNG-encode and base64 the pixels for a vision model request
pub fn to_base64_png(image: &RgbImage) -> Result<String, InferenceError> {
    let mut png = Cursor::new(Vec::new());
    image
        .write_to(&mut png, ImageFormat::Png)
        .map_err(InferenceError::ImageEncode)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(png.into_inner()))
}
