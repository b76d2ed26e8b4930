//! robots.txt preflight for the portal. The portal publishes public data and
//! has historically served no robots.txt at all; an unreachable or missing
//! file is therefore treated as "no restriction", while an explicit Disallow
//! is surfaced to the caller.

use anyhow::{Context, Result};
use robotstxt::DefaultMatcher;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

use crate::config::PortalConfig;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Check whether `path` on the portal may be crawled by agent `*`.
/// Returns `Ok(false)` only on an explicit Disallow match.
pub async fn preflight(portal: &PortalConfig, path: &str) -> Result<bool> {
    let base = Url::parse(&portal.base_url)
        .with_context(|| format!("invalid portal base url {}", portal.base_url))?;
    let robots_url = base.join("/robots.txt").context("could not derive robots.txt url")?;
    let target_url = base.join(path).context("could not derive target url")?;

    info!("robots.txt preflight: {}", robots_url);

    let client = reqwest::Client::builder()
        .user_agent(&portal.user_agent)
        .timeout(FETCH_TIMEOUT)
        .build()
        .context("failed to build robots client")?;

    let resp = match client.get(robots_url.clone()).send().await {
        Ok(resp) => resp,
        Err(e) => {
            warn!("robots.txt unreachable ({}), continuing", e);
            return Ok(true);
        }
    };

    if resp.status() == reqwest::StatusCode::NOT_FOUND {
        info!("robots.txt missing (404), no crawl restrictions");
        return Ok(true);
    }
    if !resp.status().is_success() {
        warn!("robots.txt fetch returned {}, continuing", resp.status());
        return Ok(true);
    }

    let body = resp.text().await.context("failed to read robots.txt body")?;
    let allowed =
        DefaultMatcher::default().one_agent_allowed_by_robots(&body, "*", target_url.as_str());

    if allowed {
        info!("robots.txt allows {}", path);
    } else {
        warn!("robots.txt disallows {}", path);
    }
    Ok(allowed)
}
