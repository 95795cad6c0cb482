use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;
use tracing::info;
use url::Url;

use crate::error::{GalleryError, Result};
use crate::models::StrategyRule;

/// Rule as written in the strategies file. The domain is the map key.
#[derive(Debug, Deserialize)]
struct RuleSpec {
    #[serde(default, alias = "displayName")]
    name: Option<String>,
    selector: String,
    #[serde(default = "default_attribute")]
    attribute: String,
    #[serde(default, alias = "excludePatterns")]
    exclude: Vec<String>,
    #[serde(default, alias = "extraHeaders")]
    headers: BTreeMap<String, String>,
    #[serde(default, alias = "requiresProxy")]
    proxy: bool,
}

fn default_attribute() -> String {
    "src".to_string()
}

/// Read-only domain → rule table, populated once.
#[derive(Debug, Default)]
pub struct StrategyRegistry {
    rules: OnceLock<Vec<StrategyRule>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rules(rules: Vec<StrategyRule>) -> Result<Self> {
        let registry = Self::new();
        registry.init(rules)?;
        Ok(registry)
    }

    pub fn init(&self, rules: Vec<StrategyRule>) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        let mut normalized = Vec::with_capacity(rules.len());
        for mut rule in rules {
            rule.domain = normalize_domain(&rule.domain);
            if !seen.insert(rule.domain.clone()) {
                return Err(GalleryError::Config(format!(
                    "duplicate strategy domain: {}",
                    rule.domain
                )));
            }
            scraper::Selector::parse(&rule.selector).map_err(|e| {
                GalleryError::Config(format!("invalid selector for {}: {}", rule.domain, e))
            })?;
            normalized.push(rule);
        }

        let count = normalized.len();
        self.rules
            .set(normalized)
            .map_err(|_| GalleryError::Config("strategy registry already initialized".into()))?;
        info!(rules = count, "strategy registry initialized");
        Ok(())
    }

    pub fn load_json(&self, content: &str) -> Result<()> {
        let specs: serde_json::Map<String, serde_json::Value> = serde_json::from_str(content)?;
        let mut rules = Vec::with_capacity(specs.len());
        for (domain, value) in specs {
            let spec: RuleSpec = serde_json::from_value(value).map_err(|e| {
                GalleryError::Config(format!("invalid strategy for {}: {}", domain, e))
            })?;
            rules.push(StrategyRule {
                display_name: spec.name.unwrap_or_else(|| domain.clone()),
                domain,
                selector: spec.selector,
                attribute: spec.attribute,
                exclude_patterns: spec.exclude,
                extra_headers: spec.headers,
                requires_proxy: spec.proxy,
            });
        }
        self.init(rules)
    }

    pub fn load_file(&self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GalleryError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        self.load_json(&content)
    }

    /// Rules in registry (file) order.
    pub fn all(&self) -> Result<&[StrategyRule]> {
        self.rules
            .get()
            .map(Vec::as_slice)
            .ok_or(GalleryError::NotInitialized)
    }

    pub fn list_domains(&self) -> Result<Vec<&str>> {
        Ok(self.all()?.iter().map(|r| r.domain.as_str()).collect())
    }

    /// Exact match on the hostname with `www.` stripped. `None` means unmapped.
    pub fn resolve(&self, url: &str) -> Result<Option<&StrategyRule>> {
        let rules = self.all()?;
        let domain = domain_of(url)?;
        Ok(rules.iter().find(|r| r.domain == domain))
    }
}

pub fn domain_of(url: &str) -> Result<String> {
    let parsed = Url::parse(url).map_err(|_| GalleryError::InvalidUrl(url.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| GalleryError::InvalidUrl(url.to_string()))?;
    Ok(normalize_domain(host))
}

fn normalize_domain(host: &str) -> String {
    let host = host.trim().to_lowercase();
    match host.strip_prefix("www.") {
        Some(stripped) => stripped.to_string(),
        None => host,
    }
}
