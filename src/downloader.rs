use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::header::REFERER;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::FetchError;
use crate::http::HttpClients;
use crate::models::{DownloadResult, Gallery, GalleryResult};
use crate::retry::RetryPolicy;

pub const DEFAULT_CONCURRENCY: usize = 5;
const MAX_STEM_LEN: usize = 50;
const DEFAULT_EXTENSION: &str = "jpg";

/// One attempt at fetching `url` into `dest`.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        use_proxy: bool,
        cancel: &CancellationToken,
    ) -> Result<u64, FetchError>;
}

pub struct HttpImageFetcher {
    clients: HttpClients,
}

impl HttpImageFetcher {
    pub fn new(clients: HttpClients) -> Self {
        Self { clients }
    }

    async fn stream_to_file(
        &self,
        url: &str,
        dest: &Path,
        use_proxy: bool,
    ) -> Result<u64, FetchError> {
        let mut request = self.clients.pick(use_proxy).get(url);
        if let Some(referer) = referer_for(url) {
            request = request.header(REFERER, referer);
        }

        let mut response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::from_status(status));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        use_proxy: bool,
        cancel: &CancellationToken,
    ) -> Result<u64, FetchError> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = self.stream_to_file(url, dest, use_proxy) => result,
        };
        if result.is_err() {
            let _ = tokio::fs::remove_file(dest).await;
        }
        result
    }
}

/// Running totals for the gallery currently downloading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadProgress {
    pub gallery_index: usize,
    pub gallery_name: String,
    pub current: usize,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub type ProgressFn<'a> = &'a (dyn Fn(&DownloadProgress) + Send + Sync);

#[derive(Clone)]
pub struct Downloader {
    fetcher: Arc<dyn ImageFetcher>,
    retry: RetryPolicy,
    concurrency: usize,
}

impl Downloader {
    pub fn new(fetcher: Arc<dyn ImageFetcher>, concurrency: usize) -> Self {
        Self {
            fetcher,
            retry: RetryPolicy::image_fetch(),
            concurrency: concurrency.max(1),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Never fails: returns whether the file ended up on disk. Cancellation
    /// ends the loop immediately without spending further attempts.
    pub async fn download_one(
        &self,
        url: &str,
        dest: &Path,
        use_proxy: bool,
        cancel: &CancellationToken,
    ) -> bool {
        for attempt in 1..=self.retry.max_attempts {
            if cancel.is_cancelled() {
                return false;
            }

            match self.fetcher.fetch(url, dest, use_proxy, cancel).await {
                Ok(bytes) => {
                    debug!(url, bytes, attempt, "image downloaded");
                    return true;
                }
                Err(FetchError::Cancelled) => return false,
                Err(e) => {
                    debug!(url, attempt, error = %e, "image download attempt failed");
                    if attempt == self.retry.max_attempts {
                        warn!(url, error = %e, "giving up on image");
                        break;
                    }
                    let delay = self.retry.delay_for(attempt, None);
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        false
    }

    /// Windows of `concurrency` items; a window fully settles before the next
    /// one is considered.
    async fn download_gallery(
        &self,
        index: usize,
        gallery: &Gallery,
        dest_dir: &Path,
        cancel: &CancellationToken,
        on_progress: ProgressFn<'_>,
    ) -> GalleryResult {
        let total = gallery.image_urls.len();
        let mut result = GalleryResult {
            name: gallery.name.clone(),
            total,
            ..Default::default()
        };

        if let Err(e) = tokio::fs::create_dir_all(dest_dir).await {
            warn!(gallery = %gallery.name, error = %e, "failed to create gallery directory");
            result.failed = total;
            result.not_attempted = total;
            return result;
        }

        let mut attempted = 0usize;
        for (window_index, window) in gallery.image_urls.chunks(self.concurrency).enumerate() {
            if cancel.is_cancelled() {
                info!(gallery = %gallery.name, "cancelled; no further windows scheduled");
                break;
            }

            let offset = window_index * self.concurrency;
            let mut in_flight: FuturesUnordered<_> = window
                .iter()
                .enumerate()
                .map(|(i, url)| {
                    let path = dest_dir.join(image_file_name(offset + i + 1, url));
                    async move {
                        let ok = self.download_one(url, &path, gallery.uses_proxy, cancel).await;
                        (path, ok)
                    }
                })
                .collect();

            while let Some((path, ok)) = in_flight.next().await {
                attempted += 1;
                if ok {
                    result.succeeded += 1;
                    result.files.push(path);
                } else {
                    result.failed += 1;
                }
                on_progress(&DownloadProgress {
                    gallery_index: index,
                    gallery_name: gallery.name.clone(),
                    current: attempted,
                    total,
                    succeeded: result.succeeded,
                    failed: result.failed,
                });
            }
        }

        result.not_attempted = total - attempted;
        result.failed += result.not_attempted;
        result.files.sort();
        result
    }

    /// Galleries strictly in order, each into `root/<gallery name>`.
    pub async fn download_all(
        &self,
        galleries: &[Gallery],
        root: &Path,
        cancel: &CancellationToken,
        on_progress: ProgressFn<'_>,
    ) -> DownloadResult {
        let mut aggregate = DownloadResult::default();

        for (index, gallery) in galleries.iter().enumerate() {
            if cancel.is_cancelled() {
                let total = gallery.image_urls.len();
                aggregate.push(GalleryResult {
                    name: gallery.name.clone(),
                    total,
                    failed: total,
                    not_attempted: total,
                    ..Default::default()
                });
                continue;
            }

            info!(
                gallery = %gallery.name,
                images = gallery.image_urls.len(),
                concurrency = self.concurrency,
                "downloading gallery"
            );
            let dest_dir = root.join(&gallery.name);
            let result = self
                .download_gallery(index, gallery, &dest_dir, cancel, on_progress)
                .await;
            info!(
                gallery = %gallery.name,
                succeeded = result.succeeded,
                failed = result.failed,
                "gallery finished"
            );
            aggregate.push(result);
        }

        aggregate.cancelled = cancel.is_cancelled();
        aggregate
    }
}

/// `Referer` is the image URL's own origin.
pub fn referer_for(url: &str) -> Option<String> {
    let origin = Url::parse(url).ok()?.origin();
    if !origin.is_tuple() {
        return None;
    }
    Some(format!("{}/", origin.ascii_serialization()))
}

/// `NNN_<stem>.<ext>` with a 1-based, zero-padded sequence index.
pub fn image_file_name(index: usize, url: &str) -> String {
    let last_segment = Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(str::to_string))
        })
        .unwrap_or_default();

    let (stem, extension) = match last_segment.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && (1..=5).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            (stem, ext.to_ascii_lowercase())
        }
        _ => (last_segment.as_str(), DEFAULT_EXTENSION.to_string()),
    };

    let stem: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(MAX_STEM_LEN)
        .collect();
    let stem = stem.trim_matches('_');
    let stem = if stem.is_empty() { "image" } else { stem };

    format!("{:03}_{}.{}", index, stem, extension)
}
