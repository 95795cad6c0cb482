use tracing::{debug, info, warn};

use crate::extractor::GalleryExtractor;
use crate::models::StrategyRule;
use crate::registry::StrategyRegistry;

pub const DEFAULT_MIN_IMAGES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    pub rule: StrategyRule,
    pub images: Vec<String>,
}

/// Tries every known rule against `url`, in registry order, and returns the
/// first whose yield reaches `min_images`. Per-rule failures are logged and
/// skipped.
pub async fn discover(
    registry: &StrategyRegistry,
    extractor: &GalleryExtractor,
    url: &str,
    min_images: usize,
) -> Option<Discovered> {
    let rules = match registry.all() {
        Ok(rules) => rules,
        Err(e) => {
            warn!(error = %e, "discovery skipped");
            return None;
        }
    };

    for rule in rules {
        match extractor.extract(url, rule).await {
            Ok(images) if images.len() >= min_images => {
                info!(url, domain = %rule.domain, count = images.len(), "discovery matched strategy");
                return Some(Discovered {
                    rule: rule.clone(),
                    images,
                });
            }
            Ok(images) => {
                debug!(url, domain = %rule.domain, count = images.len(), "strategy below threshold");
            }
            Err(e) => {
                debug!(url, domain = %rule.domain, error = %e, "strategy failed during discovery");
            }
        }
    }

    warn!(url, "no strategy produced enough images");
    None
}
