use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, redirect};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

use crate::error::{FetchError, Result};

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REDIRECTS: usize = 5;

/// Direct client plus an optional client routed through the forward proxy.
#[derive(Clone)]
pub struct HttpClients {
    direct: Client,
    proxied: Option<Client>,
}

impl HttpClients {
    pub fn new(proxy: Option<&str>) -> Result<Self> {
        let direct = base_builder().build()?;
        let proxied = match proxy {
            Some(proxy_url) => Some(
                base_builder()
                    .proxy(reqwest::Proxy::all(proxy_url)?)
                    .build()?,
            ),
            None => None,
        };
        Ok(Self { direct, proxied })
    }

    /// Falls back to the direct client when a proxy is wanted but not configured.
    pub fn pick(&self, wants_proxy: bool) -> &Client {
        match (&self.proxied, wants_proxy) {
            (Some(proxied), true) => proxied,
            (None, true) => {
                warn!("strategy requires a proxy but none is configured; fetching directly");
                &self.direct
            }
            _ => &self.direct,
        }
    }
}

fn base_builder() -> reqwest::ClientBuilder {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .redirect(redirect::Policy::limited(MAX_REDIRECTS))
        .user_agent(USER_AGENT)
}

pub fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        reqwest::header::ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(
        reqwest::header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.9"),
    );
    headers.insert(reqwest::header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
    headers
}

/// Defaults overridden key-by-key by `overrides`. Invalid pairs are skipped.
pub fn merge_headers(overrides: &BTreeMap<String, String>) -> HeaderMap {
    let mut headers = default_headers();
    for (name, value) in overrides {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "skipping invalid header override"),
        }
    }
    headers
}

/// Single attempt; the caller owns retries.
pub async fn fetch_text(
    client: &Client,
    url: &str,
    headers: HeaderMap,
) -> std::result::Result<String, FetchError> {
    let response = client.get(url).headers(headers).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::from_status(status));
    }
    Ok(response.text().await?)
}
