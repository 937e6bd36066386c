//! Image preparation for the OCR engine
//!
//! The engine only reads common raster formats. Anything else is decoded
//! here and written to a temporary PNG that the engine can open; the
//! preprocessor remembers those temporary files so they can be removed once
//! recognition for the image is over.

use image::{DynamicImage, ImageFormat, ImageReader, RgbImage};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{OcrRenameError, Result};

/// Formats the engine decodes natively
const ENGINE_READABLE: [ImageFormat; 5] = [
    ImageFormat::Png,
    ImageFormat::Jpeg,
    ImageFormat::Bmp,
    ImageFormat::Tiff,
    ImageFormat::WebP,
];

/// Prefix for converted copies in the temp directory
const TEMP_PREFIX: &str = "ocr_temp_";

/// Converts unreadable images and tracks the temporary copies it creates
pub struct ImagePreprocessor {
    /// Lowercase extensions that always need conversion
    convert_extensions: HashSet<String>,
    /// Where converted copies are written
    temp_dir: PathBuf,
    /// Temporary files created and not yet released
    created: Mutex<HashSet<PathBuf>>,
}

impl ImagePreprocessor {
    pub fn new<I, S>(convert_extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::with_temp_dir(convert_extensions, std::env::temp_dir())
    }

    pub fn with_temp_dir<I, S>(convert_extensions: I, temp_dir: PathBuf) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            convert_extensions: convert_extensions
                .into_iter()
                .map(|ext| ext.as_ref().trim_start_matches('.').to_lowercase())
                .collect(),
            temp_dir,
            created: Mutex::new(HashSet::new()),
        }
    }

    /// Path the engine can read: the input itself, or a converted temporary PNG
    pub fn ensure_readable(&self, path: &Path) -> Result<PathBuf> {
        let path = std::path::absolute(path)?;
        if !path.is_file() {
            return Err(OcrRenameError::unsupported(&path, "file does not exist"));
        }

        if !self.needs_conversion(&path) {
            return Ok(path);
        }

        let image = decode(&path)?;
        let rgb = flatten_onto_white(image);

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        let temp_path = self
            .temp_dir
            .join(format!("{}{}_{}.png", TEMP_PREFIX, stem, uuid::Uuid::new_v4().simple()));

        rgb.save_with_format(&temp_path, ImageFormat::Png)
            .map_err(|e| OcrRenameError::unsupported(&path, format!("failed to write PNG copy: {e}")))?;

        info!(
            "Converted {} -> PNG for OCR",
            path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        );
        self.created.lock().insert(temp_path.clone());
        Ok(temp_path)
    }

    /// Delete `path` only if `ensure_readable` created it; repeated calls are no-ops
    pub fn release_if_temporary(&self, path: &Path) {
        if !self.created.lock().remove(path) {
            return;
        }
        match std::fs::remove_file(path) {
            Ok(()) => debug!("Removed temporary image {:?}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove temporary image {:?}: {}", path, e),
        }
    }

    /// Number of temporary files still outstanding
    pub fn outstanding(&self) -> usize {
        self.created.lock().len()
    }

    /// Remove every temporary file that was never released
    pub fn release_all(&self) {
        let paths: Vec<PathBuf> = self.created.lock().iter().cloned().collect();
        for path in paths {
            self.release_if_temporary(&path);
        }
    }

    fn needs_conversion(&self, path: &Path) -> bool {
        let by_extension = path
            .extension()
            .map(|ext| self.convert_extensions.contains(&ext.to_string_lossy().to_lowercase()))
            .unwrap_or(false);
        if by_extension {
            return true;
        }

        // Extension lies sometimes: trust the signature when it is recognizable
        match sniff_format(path) {
            Some(format) => !ENGINE_READABLE.contains(&format),
            None => false,
        }
    }
}

impl Drop for ImagePreprocessor {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Pixel dimensions from the image header, if the format is understood
pub fn image_dimensions(path: &Path) -> Option<(u32, u32)> {
    image::image_dimensions(path).ok()
}

fn sniff_format(path: &Path) -> Option<ImageFormat> {
    let mut header = [0u8; 32];
    let mut file = File::open(path).ok()?;
    let n = file.read(&mut header).ok()?;
    image::guess_format(&header[..n]).ok()
}

fn decode(path: &Path) -> Result<DynamicImage> {
    let reader = ImageReader::open(path)
        .map_err(|e| OcrRenameError::unsupported(path, e.to_string()))?
        .with_guessed_format()
        .map_err(|e| OcrRenameError::unsupported(path, e.to_string()))?;
    reader
        .decode()
        .map_err(|e| OcrRenameError::unsupported(path, e.to_string()))
}

/// Drop alpha by compositing onto a white background
fn flatten_onto_white(image: DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }

    let rgba = image.to_rgba8();
    let mut rgb = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let alpha = a as u32;
        let blend = |c: u8| ((c as u32 * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
        rgb.put_pixel(x, y, image::Rgb([blend(r), blend(g), blend(b)]));
    }
    rgb
}
