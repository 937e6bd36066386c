//! Storage Layer
//!
//! Application directories, image folder listings, and the recognition cache.

pub mod cache;
pub mod listing;

pub use cache::RecognitionCache;
pub use listing::scan_folder;

use anyhow::Result;
use std::path::PathBuf;

/// File name of the recognition cache inside the data directory
pub const CACHE_FILE: &str = "recognition_cache.json";

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "ocrrename", "OcrRename")
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))
}

/// Get the application data directory
pub fn get_data_dir() -> Result<PathBuf> {
    let data_dir = project_dirs()?.data_dir().to_path_buf();
    std::fs::create_dir_all(&data_dir)?;
    Ok(data_dir)
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = project_dirs()?.config_dir().to_path_buf();
    std::fs::create_dir_all(&config_dir)?;
    Ok(config_dir)
}

/// Default location of the recognition cache
pub fn default_cache_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join(CACHE_FILE))
}
