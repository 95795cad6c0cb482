use std::path::PathBuf;

use crate::cli::Args;
use crate::discovery::DEFAULT_MIN_IMAGES;
use crate::downloader::DEFAULT_CONCURRENCY;

/// Operator settings consumed by the job pipeline.
#[derive(Debug, Clone)]
pub struct Settings {
    pub concurrency: usize,
    pub min_images: usize,
    pub proxy: Option<String>,
    pub archives_dir: PathBuf,
    pub work_dir: PathBuf,
    pub public_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            min_images: DEFAULT_MIN_IMAGES,
            proxy: None,
            archives_dir: PathBuf::from("./archives"),
            work_dir: std::env::temp_dir(),
            public_url: "http://localhost:8080/files".to_string(),
        }
    }
}

impl Settings {
    pub fn download_url(&self, file_name: &str) -> String {
        format!("{}/{}", self.public_url.trim_end_matches('/'), file_name)
    }
}

impl From<&Args> for Settings {
    fn from(args: &Args) -> Self {
        Self {
            concurrency: args.concurrency.max(1) as usize,
            min_images: args.min_images,
            proxy: args.proxy.clone().filter(|p| !p.trim().is_empty()),
            archives_dir: args.archives.clone(),
            work_dir: args.work_dir.clone().unwrap_or_else(std::env::temp_dir),
            public_url: args.public_url.clone(),
        }
    }
}
