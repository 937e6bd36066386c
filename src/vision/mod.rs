//! Image Layer
//!
//! Prepares image files for the OCR engine.

pub mod preprocess;

pub use preprocess::{image_dimensions, ImagePreprocessor};
