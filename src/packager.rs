use async_trait::async_trait;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{GalleryError, Result};

/// Turns a job's gallery tree into one compressed artifact.
#[async_trait]
pub trait Packager: Send + Sync {
    /// Returns the artifact size in bytes.
    async fn package(&self, src_dir: &Path, dest: &Path) -> Result<u64>;

    fn extension(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ZipPackager;

#[async_trait]
impl Packager for ZipPackager {
    async fn package(&self, src_dir: &Path, dest: &Path) -> Result<u64> {
        let src_dir = src_dir.to_path_buf();
        let dest = dest.to_path_buf();
        let size = tokio::task::spawn_blocking(move || write_zip(&src_dir, &dest))
            .await
            .map_err(|e| GalleryError::Packaging(format!("packaging task failed: {}", e)))??;
        Ok(size)
    }

    fn extension(&self) -> &'static str {
        "zip"
    }
}

fn write_zip(src_dir: &Path, dest: &Path) -> Result<u64> {
    let mut entries = Vec::new();
    collect_files(src_dir, &mut entries)?;
    entries.sort();

    let file = File::create(dest)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    for path in &entries {
        let relative = path
            .strip_prefix(src_dir)
            .map_err(|e| GalleryError::Packaging(e.to_string()))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        zip.start_file(name, options).map_err(zip_err)?;
        let mut input = File::open(path)?;
        io::copy(&mut input, &mut zip)?;
    }

    let mut file = zip.finish().map_err(zip_err)?;
    file.flush()?;
    let size = fs::metadata(dest)?.len();
    info!(entries = entries.len(), bytes = size, path = %dest.display(), "archive written");
    Ok(size)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

fn zip_err(err: zip::result::ZipError) -> GalleryError {
    GalleryError::Packaging(err.to_string())
}
