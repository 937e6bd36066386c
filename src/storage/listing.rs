//! Image folder listing

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Result;

/// Image files directly inside `dir`, sorted by file name
///
/// `extensions` are matched case-insensitively, with or without a leading dot.
/// Subdirectories are not descended into.
pub fn scan_folder(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    let wanted: Vec<String> = extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .collect();

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() && !path.is_file() {
            continue;
        }
        let matches = path
            .extension()
            .map(|ext| wanted.contains(&ext.to_string_lossy().to_lowercase()))
            .unwrap_or(false);
        if matches {
            files.push(path);
        }
    }

    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    debug!("Found {} images in {:?}", files.len(), dir);
    Ok(files)
}
