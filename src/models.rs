use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Per-domain extraction recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyRule {
    pub domain: String,
    pub display_name: String,
    pub selector: String,
    pub attribute: String,
    pub exclude_patterns: Vec<String>,
    pub extra_headers: BTreeMap<String, String>,
    pub requires_proxy: bool,
}

/// One submitted URL's extracted image set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gallery {
    pub name: String,
    pub source_url: String,
    pub image_urls: Vec<String>,
    pub uses_proxy: bool,
    /// Domain of the rule that produced `image_urls`.
    pub strategy: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GalleryResult {
    pub name: String,
    pub total: usize,
    pub succeeded: usize,
    /// Includes items that were never attempted because of cancellation.
    pub failed: usize,
    pub not_attempted: usize,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadResult {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub galleries: Vec<GalleryResult>,
}

impl DownloadResult {
    pub fn push(&mut self, gallery: GalleryResult) {
        self.total += gallery.total;
        self.succeeded += gallery.succeeded;
        self.failed += gallery.failed;
        self.galleries.push(gallery);
    }

    pub fn files(&self) -> impl Iterator<Item = &PathBuf> {
        self.galleries.iter().flat_map(|g| g.files.iter())
    }
}

/// Sidecar metadata written next to every produced archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub archive_name: String,
    pub file_name: String,
    pub urls: Vec<String>,
    pub created_at: String,
    pub size_bytes: u64,
    pub image_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Extracting,
    Downloading,
    Packaging,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: JobPhase,
    pub galleries_done: usize,
    pub galleries_total: usize,
    pub current_gallery: Option<String>,
    pub images_done: usize,
    pub images_total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Done,
    Partial,
    Cancelled,
    Failed,
}

/// Why a submitted URL contributed no gallery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlFailure {
    /// Not a well-formed URL.
    Malformed,
    /// No strategy produced any image from it.
    NoImages,
    /// Skipped because the job was cancelled first.
    Cancelled,
}

impl std::fmt::Display for UrlFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            UrlFailure::Malformed => "invalid URL",
            UrlFailure::NoImages => "no images extracted",
            UrlFailure::Cancelled => "skipped after cancel",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedUrl {
    pub url: String,
    pub reason: UrlFailure,
}

impl FailedUrl {
    pub fn new(url: impl Into<String>, reason: UrlFailure) -> Self {
        Self {
            url: url.into(),
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GalleryReport {
    pub name: String,
    pub strategy: String,
    pub succeeded: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub status: JobStatus,
    pub success_count: usize,
    pub total_count: usize,
    pub failed_urls: Vec<FailedUrl>,
    pub galleries: Vec<GalleryReport>,
    pub archive_file: Option<String>,
    pub artifact_size_bytes: Option<u64>,
    pub download_url: Option<String>,
    pub error: Option<String>,
}

impl JobSummary {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            success_count: 0,
            total_count: 0,
            failed_urls: Vec::new(),
            galleries: Vec::new(),
            archive_file: None,
            artifact_size_bytes: None,
            download_url: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Progress(ProgressEvent),
    Finished(JobSummary),
}

/// Human-readable size, one decimal place above bytes.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
