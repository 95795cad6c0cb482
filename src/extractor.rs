use scraper::{Html, Selector};
use std::collections::HashSet;
use tracing::{debug, info};
use url::Url;

use crate::error::{FetchError, GalleryError, Result};
use crate::http::{HttpClients, fetch_text, merge_headers};
use crate::models::StrategyRule;
use crate::retry::RetryPolicy;

const MAX_SLUG_LEN: usize = 60;

#[derive(Clone)]
pub struct GalleryExtractor {
    clients: HttpClients,
    retry: RetryPolicy,
}

impl GalleryExtractor {
    pub fn new(clients: HttpClients) -> Self {
        Self {
            clients,
            retry: RetryPolicy::page_fetch(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Ordered, de-duplicated absolute image URLs found at `url` under `rule`.
    /// An empty result is not an error.
    pub async fn extract(&self, url: &str, rule: &StrategyRule) -> Result<Vec<String>> {
        let client = self.clients.pick(rule.requires_proxy);
        let headers = merge_headers(&rule.extra_headers);

        let body = self
            .retry
            .run(move |attempt| {
                let headers = headers.clone();
                async move {
                    debug!(url, attempt, domain = %rule.domain, "fetching gallery page");
                    fetch_text(client, url, headers).await
                }
            })
            .await
            .map_err(|source| GalleryError::ExtractionFailed {
                url: url.to_string(),
                source,
            })?;

        let images = parse_image_urls(&body, url, rule).map_err(|source| {
            GalleryError::ExtractionFailed {
                url: url.to_string(),
                source,
            }
        })?;
        info!(url, domain = %rule.domain, count = images.len(), "extracted image urls");
        Ok(images)
    }
}

/// Applies `rule` to an already fetched document.
pub fn parse_image_urls(
    html: &str,
    page_url: &str,
    rule: &StrategyRule,
) -> std::result::Result<Vec<String>, FetchError> {
    let base = Url::parse(page_url).map_err(|e| FetchError::Other(format!("bad page url: {}", e)))?;
    let selector = Selector::parse(&rule.selector)
        .map_err(|e| FetchError::Other(format!("invalid selector {}: {}", rule.selector, e)))?;
    let document = Html::parse_document(html);

    let mut seen = HashSet::new();
    let images = document
        .select(&selector)
        .filter_map(|element| element.value().attr(&rule.attribute))
        .filter_map(|raw| resolve_url(raw, &base))
        .filter(|candidate| {
            !rule
                .exclude_patterns
                .iter()
                .any(|pattern| candidate.contains(pattern.as_str()))
        })
        .filter(|candidate| seen.insert(candidate.clone()))
        .collect();
    Ok(images)
}

/// `//host/x` gets `https:`; absolute http(s) is kept as is; anything else is
/// joined onto the page URL. Unresolvable values yield `None`.
pub fn resolve_url(raw: &str, base: &Url) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.starts_with("//") {
        let candidate = format!("https:{}", raw);
        return Url::parse(&candidate).ok().map(|_| candidate);
    }
    match Url::parse(raw) {
        Ok(absolute) if matches!(absolute.scheme(), "http" | "https") => Some(raw.to_string()),
        Ok(_) => None,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            base.join(raw).ok().map(|joined| joined.to_string())
        }
        Err(_) => None,
    }
}

/// Filesystem-safe name from the URL's last path segment.
pub fn gallery_slug(url: &str) -> String {
    let parsed = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(_) => return "gallery".to_string(),
    };
    let segment = parsed
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).next_back())
        .map(str::to_string)
        .or_else(|| parsed.host_str().map(str::to_string))
        .unwrap_or_default();

    let slug: String = segment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .take(MAX_SLUG_LEN)
        .collect();
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() { "gallery".to_string() } else { slug }
}
