use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{GalleryError, Result};
use crate::models::ArchiveRecord;

const MIN_NAME_LEN: usize = 2;
const MAX_NAME_LEN: usize = 80;

/// Letters, digits, `-`, `_`, `.`; 2 to 80 characters; not a dot path.
pub fn is_valid_archive_name(name: &str) -> bool {
    (MIN_NAME_LEN..=MAX_NAME_LEN).contains(&name.chars().count())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.')
        && !name.contains("..")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// `{archive_name}_{millis}`, shared by the artifact and its sidecar.
    pub base: String,
    pub file_name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
    pub record: Option<ArchiveRecord>,
}

/// Owns the archives directory: artifacts plus their JSON sidecar records.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    root: PathBuf,
    extension: String,
}

impl ArchiveStore {
    pub fn new(root: &Path, extension: &str) -> Result<Self> {
        if !root.exists() {
            fs::create_dir_all(root)?;
        }
        Ok(Self {
            root: root.to_path_buf(),
            extension: extension.to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn base_name(archive_name: &str, created_millis: i64) -> String {
        format!("{}_{}", archive_name, created_millis)
    }

    pub fn artifact_path(&self, base: &str) -> PathBuf {
        self.root.join(format!("{}.{}", base, self.extension))
    }

    fn record_path(&self, base: &str) -> PathBuf {
        self.root.join(format!("{}.json", base))
    }

    fn check_base(&self, base: &str) -> Result<()> {
        let valid = !base.is_empty()
            && base.len() <= MAX_NAME_LEN + 20
            && base
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !base.starts_with('.')
            && !base.contains("..");
        if valid {
            Ok(())
        } else {
            Err(GalleryError::InvalidArchiveName(base.to_string()))
        }
    }

    pub fn save_record(&self, base: &str, record: &ArchiveRecord) -> Result<()> {
        self.check_base(base)?;
        let content = serde_json::to_string_pretty(record)?;
        fs::write(self.record_path(base), content)?;
        debug!(base, "archive record saved");
        Ok(())
    }

    pub fn load_record(&self, base: &str) -> Result<Option<ArchiveRecord>> {
        self.check_base(base)?;
        let path = self.record_path(base);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Artifacts, newest first.
    pub fn list(&self) -> Result<Vec<ArchiveEntry>> {
        let suffix = format!(".{}", self.extension);
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(base) = file_name.strip_suffix(&suffix) else {
                continue;
            };
            if self.check_base(base).is_err() {
                continue;
            }
            entries.push(self.entry(base, &entry.path())?);
        }
        entries.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.base.cmp(&a.base)));
        Ok(entries)
    }

    pub fn get(&self, base: &str) -> Result<ArchiveEntry> {
        self.check_base(base)?;
        let path = self.artifact_path(base);
        if !path.is_file() {
            return Err(GalleryError::ArchiveNotFound(base.to_string()));
        }
        self.entry(base, &path)
    }

    fn entry(&self, base: &str, path: &Path) -> Result<ArchiveEntry> {
        let metadata = fs::metadata(path)?;
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(ArchiveEntry {
            base: base.to_string(),
            file_name: format!("{}.{}", base, self.extension),
            path: path.to_path_buf(),
            size_bytes: metadata.len(),
            modified,
            record: self.load_record(base).unwrap_or(None),
        })
    }

    /// Removes the artifact and its sidecar record.
    pub fn delete(&self, base: &str) -> Result<()> {
        self.check_base(base)?;
        let artifact = self.artifact_path(base);
        if !artifact.exists() {
            return Err(GalleryError::ArchiveNotFound(base.to_string()));
        }
        fs::remove_file(&artifact)?;
        let record = self.record_path(base);
        if record.exists() {
            fs::remove_file(record)?;
        }
        info!(base, "archive deleted");
        Ok(())
    }

    pub fn delete_all(&self) -> Result<usize> {
        let entries = self.list()?;
        for entry in &entries {
            self.delete(&entry.base)?;
        }
        Ok(entries.len())
    }
}
