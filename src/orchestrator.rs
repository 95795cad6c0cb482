use chrono::Utc;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::discovery::discover;
use crate::downloader::{DownloadProgress, Downloader};
use crate::error::{GalleryError, Result};
use crate::extractor::{GalleryExtractor, gallery_slug};
use crate::models::{
    ArchiveRecord, DownloadResult, FailedUrl, Gallery, GalleryReport, JobEvent, JobPhase,
    JobStatus, JobSummary, ProgressEvent, UrlFailure,
};
use crate::packager::Packager;
use crate::registry::StrategyRegistry;
use crate::session::SessionStore;
use crate::state::{ArchiveStore, is_valid_archive_name};

pub type EventSender = mpsc::UnboundedSender<JobEvent>;

/// Lines that look like gallery URLs: trimmed and starting with `http`.
pub fn parse_urls(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| line.starts_with("http"))
        .map(str::to_string)
        .collect()
}

/// An absolute `http(s)://` URL, as opposed to text that merely starts
/// with `http`.
pub fn is_link(line: &str) -> bool {
    url::Url::parse(line.trim()).is_ok_and(|u| matches!(u.scheme(), "http" | "https"))
}

pub fn default_archive_name() -> String {
    format!("gallery_{}", Utc::now().timestamp_millis())
}

/// Resets the user's session when a job ends, however it ends.
struct SessionGuard<'a> {
    sessions: &'a SessionStore,
    user: &'a str,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.sessions.finish(self.user);
    }
}

pub struct Orchestrator {
    registry: Arc<StrategyRegistry>,
    extractor: GalleryExtractor,
    downloader: Downloader,
    packager: Arc<dyn Packager>,
    store: ArchiveStore,
    sessions: Arc<SessionStore>,
    settings: Settings,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<StrategyRegistry>,
        extractor: GalleryExtractor,
        downloader: Downloader,
        packager: Arc<dyn Packager>,
        store: ArchiveStore,
        sessions: Arc<SessionStore>,
        settings: Settings,
    ) -> Self {
        Self {
            registry,
            extractor,
            downloader,
            packager,
            store,
            sessions,
            settings,
        }
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn store(&self) -> &ArchiveStore {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Starts a job in the background. Rejected while the user already has
    /// one processing; the running job is left untouched.
    pub fn submit(
        self: &Arc<Self>,
        user: &str,
        urls: Vec<String>,
        archive_name: Option<String>,
        events: EventSender,
    ) -> Result<JoinHandle<JobSummary>> {
        let archive_name = match archive_name {
            Some(name) if !is_valid_archive_name(&name) => {
                return Err(GalleryError::InvalidArchiveName(name));
            }
            Some(name) => name,
            None => default_archive_name(),
        };
        let token = self.sessions.begin(user, urls.clone(), &archive_name)?;
        info!(user, archive = %archive_name, urls = urls.len(), "job accepted");

        let this = Arc::clone(self);
        let user = user.to_string();
        Ok(tokio::spawn(async move {
            this.run_job(&user, urls, &archive_name, token, events).await
        }))
    }

    pub fn cancel(&self, user: &str) -> bool {
        let cancelled = self.sessions.cancel(user);
        if cancelled {
            info!(user, "cancellation requested");
        }
        cancelled
    }

    /// Runs one job to its terminal summary. The temporary tree is gone and
    /// the session is back to idle before the summary is emitted.
    pub async fn run_job(
        &self,
        user: &str,
        urls: Vec<String>,
        archive_name: &str,
        token: CancellationToken,
        events: EventSender,
    ) -> JobSummary {
        let guard = SessionGuard {
            sessions: &self.sessions,
            user,
        };

        let summary = match self.execute(&urls, archive_name, &token, &events).await {
            Ok(summary) => summary,
            Err(e) => {
                error!(user, error = %e, "job failed");
                JobSummary::failed(e.to_string())
            }
        };
        drop(guard);

        info!(user, status = ?summary.status, succeeded = summary.success_count, "job finished");
        let _ = events.send(JobEvent::Finished(summary.clone()));
        summary
    }

    async fn execute(
        &self,
        urls: &[String],
        archive_name: &str,
        token: &CancellationToken,
        events: &EventSender,
    ) -> Result<JobSummary> {
        tokio::fs::create_dir_all(&self.settings.work_dir).await?;
        let work_dir = tempfile::Builder::new()
            .prefix("gallery-job-")
            .tempdir_in(&self.settings.work_dir)?;

        let (galleries, failed_urls) = self.extract_all(urls, token, events).await;
        let total_images: usize = galleries.iter().map(|g| g.image_urls.len()).sum();
        if total_images == 0 {
            if token.is_cancelled() {
                return Ok(cancelled_summary(failed_urls, 0));
            }
            return Ok(failed_summary(GalleryError::NoImagesFound, failed_urls, 0));
        }

        let galleries_total = galleries.len();
        let on_progress = |p: &DownloadProgress| {
            let _ = events.send(JobEvent::Progress(ProgressEvent {
                phase: JobPhase::Downloading,
                galleries_done: p.gallery_index,
                galleries_total,
                current_gallery: Some(p.gallery_name.clone()),
                images_done: p.current,
                images_total: p.total,
            }));
        };
        let result = self
            .downloader
            .download_all(&galleries, work_dir.path(), token, &on_progress)
            .await;

        if result.succeeded == 0 {
            if result.cancelled {
                return Ok(cancelled_summary(failed_urls, result.total));
            }
            return Ok(failed_summary(
                GalleryError::NoImagesDownloaded,
                failed_urls,
                result.total,
            ));
        }

        let root = work_dir.path().to_path_buf();
        let keep: HashSet<PathBuf> = result.files().cloned().collect();
        tokio::task::spawn_blocking(move || prune_unlisted(&root, &keep))
            .await
            .map_err(|e| GalleryError::Packaging(format!("prune task failed: {}", e)))??;

        let _ = events.send(JobEvent::Progress(ProgressEvent {
            phase: JobPhase::Packaging,
            galleries_done: galleries_total,
            galleries_total,
            current_gallery: None,
            images_done: result.succeeded,
            images_total: result.total,
        }));

        let created = Utc::now();
        let base = ArchiveStore::base_name(archive_name, created.timestamp_millis());
        let artifact = self.store.artifact_path(&base);
        let size = match self.packager.package(work_dir.path(), &artifact).await {
            Ok(size) => size,
            Err(e) => {
                let _ = tokio::fs::remove_file(&artifact).await;
                return Err(e);
            }
        };

        let file_name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| base.clone());
        let record = ArchiveRecord {
            archive_name: archive_name.to_string(),
            file_name: file_name.clone(),
            urls: urls.to_vec(),
            created_at: created.to_rfc3339(),
            size_bytes: size,
            image_count: result.succeeded,
        };
        if let Err(e) = self.store.save_record(&base, &record) {
            let _ = tokio::fs::remove_file(&artifact).await;
            return Err(e);
        }

        let status = if result.cancelled || result.failed > 0 || !failed_urls.is_empty() {
            JobStatus::Partial
        } else {
            JobStatus::Done
        };

        Ok(JobSummary {
            status,
            success_count: result.succeeded,
            total_count: result.total,
            failed_urls,
            galleries: reports(&galleries, &result),
            download_url: Some(self.settings.download_url(&file_name)),
            archive_file: Some(file_name),
            artifact_size_bytes: Some(size),
            error: None,
        })
    }

    /// Resolves and extracts each URL in order. Returns the galleries with
    /// at least one image and the URLs that produced nothing.
    async fn extract_all(
        &self,
        urls: &[String],
        token: &CancellationToken,
        events: &EventSender,
    ) -> (Vec<Gallery>, Vec<FailedUrl>) {
        let mut galleries = Vec::new();
        let mut failed = Vec::new();
        let mut used_names = HashSet::new();
        let mut images_found = 0usize;

        for (index, url) in urls.iter().enumerate() {
            if token.is_cancelled() {
                info!("cancelled during extraction");
                failed.extend(
                    urls[index..]
                        .iter()
                        .map(|url| FailedUrl::new(url.as_str(), UrlFailure::Cancelled)),
                );
                break;
            }

            match self.extract_one(url).await {
                Ok(mut gallery) => {
                    gallery.name = unique_name(&gallery.name, &mut used_names);
                    images_found += gallery.image_urls.len();
                    galleries.push(gallery);
                }
                Err(reason) => failed.push(FailedUrl::new(url.as_str(), reason)),
            }

            let _ = events.send(JobEvent::Progress(ProgressEvent {
                phase: JobPhase::Extracting,
                galleries_done: index + 1,
                galleries_total: urls.len(),
                current_gallery: galleries.last().map(|g: &Gallery| g.name.clone()),
                images_done: images_found,
                images_total: images_found,
            }));
        }

        (galleries, failed)
    }

    /// Mapped rule first; discovery when unmapped, failing, or below the
    /// threshold. A low but non-empty yield is kept if discovery finds
    /// nothing better.
    async fn extract_one(&self, url: &str) -> std::result::Result<Gallery, UrlFailure> {
        let min_images = self.settings.min_images;
        let mut fallback = None;

        match self.registry.resolve(url) {
            Ok(Some(rule)) => match self.extractor.extract(url, rule).await {
                Ok(images) if images.len() >= min_images => {
                    return Ok(build_gallery(url, images, rule.requires_proxy, &rule.domain));
                }
                Ok(images) => {
                    info!(url, count = images.len(), "low yield from mapped strategy; trying discovery");
                    if !images.is_empty() {
                        fallback = Some(build_gallery(url, images, rule.requires_proxy, &rule.domain));
                    }
                }
                Err(e) => warn!(url, error = %e, "mapped strategy failed; trying discovery"),
            },
            Ok(None) => info!(url, "no strategy mapped; trying discovery"),
            Err(e) => {
                warn!(url, error = %e, "skipping url");
                return Err(UrlFailure::Malformed);
            }
        }

        match discover(&self.registry, &self.extractor, url, min_images).await {
            Some(found) => Ok(build_gallery(
                url,
                found.images,
                found.rule.requires_proxy,
                &found.rule.domain,
            )),
            None => fallback.ok_or(UrlFailure::NoImages),
        }
    }
}

fn build_gallery(url: &str, images: Vec<String>, uses_proxy: bool, strategy: &str) -> Gallery {
    Gallery {
        name: gallery_slug(url),
        source_url: url.to_string(),
        image_urls: images,
        uses_proxy,
        strategy: strategy.to_string(),
    }
}

fn unique_name(name: &str, used: &mut HashSet<String>) -> String {
    let mut candidate = name.to_string();
    let mut suffix = 2;
    while !used.insert(candidate.clone()) {
        candidate = format!("{}-{}", name, suffix);
        suffix += 1;
    }
    candidate
}

fn reports(galleries: &[Gallery], result: &DownloadResult) -> Vec<GalleryReport> {
    galleries
        .iter()
        .zip(&result.galleries)
        .map(|(gallery, outcome)| GalleryReport {
            name: gallery.name.clone(),
            strategy: gallery.strategy.clone(),
            succeeded: outcome.succeeded,
            total: outcome.total,
        })
        .collect()
}

fn failed_summary(error: GalleryError, failed_urls: Vec<FailedUrl>, total: usize) -> JobSummary {
    error!(error = %error, "job failed");
    JobSummary {
        total_count: total,
        failed_urls,
        ..JobSummary::failed(error.to_string())
    }
}

fn cancelled_summary(failed_urls: Vec<FailedUrl>, total: usize) -> JobSummary {
    JobSummary {
        status: JobStatus::Cancelled,
        total_count: total,
        failed_urls,
        error: Some("cancelled before any image was downloaded".to_string()),
        ..JobSummary::failed("")
    }
}

/// Leaves only the files the download engine reported as written.
fn prune_unlisted(root: &Path, keep: &HashSet<PathBuf>) -> Result<()> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if !keep.contains(&path) {
                std::fs::remove_file(&path)?;
            }
        }
    }
    Ok(())
}
