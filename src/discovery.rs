//! Listing link discovery on an index page.

use serde_json::json;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::browser::{goto, PageError, PageSession, PageTimings, WaitCondition};

/// Scroll in fixed steps so lazy-loaded cards render, then park at the bottom.
pub const LAZY_LOAD_SCRIPT: &str = r#"
async (steps, distance, delay, settle) => {
    for (let i = 0; i < steps; i++) {
        window.scrollBy(0, distance);
        await new Promise(resolve => setTimeout(resolve, delay));
    }
    window.scrollTo(0, document.body.scrollHeight);
    await new Promise(resolve => setTimeout(resolve, settle));
    return true;
}
"#;

/// Raw `href` of every anchor matched by any selector. A selector that
/// throws is skipped.
pub const HARVEST_LINKS_SCRIPT: &str = r#"
(selectors) => {
    const hrefs = [];
    selectors.forEach(selector => {
        try {
            document.querySelectorAll(selector).forEach(link => {
                const href = link.getAttribute('href');
                if (href) hrefs.push(href);
            });
        } catch (e) {}
    });
    return hrefs;
}
"#;

/// Path fragments that mark a link as a vehicle listing rather than site chrome.
const LISTING_KEYWORDS: &[&str] = &["veiculo", "carro", "anuncio", "automovel", "vehicle", "listing"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredLinks {
    /// Absolute listing URLs in discovery order, already capped.
    pub links: Vec<String>,
    /// Distinct listing URLs seen before the cap was applied.
    pub total_found: usize,
}

/// Collect listing URLs from `index_url`.
///
/// Load and selector problems yield an empty result; only an error that
/// kills the session is returned.
pub async fn discover_links(
    page: &mut dyn PageSession,
    index_url: &str,
    chain: &[String],
    max_links: usize,
    timings: &PageTimings,
) -> Result<DiscoveredLinks, PageError> {
    info!("🔎 Extracting links from {}", index_url);

    let base = match Url::parse(index_url) {
        Ok(base) => base,
        Err(e) => {
            error!("Invalid index URL {}: {}", index_url, e);
            return Ok(DiscoveredLinks::default());
        }
    };

    if let Err(e) = goto(page, index_url, WaitCondition::NetworkIdle, timings.index_timeout).await {
        if e.is_fatal() {
            return Err(e);
        }
        error!("Failed to load index page {}: {}", index_url, e);
        return Ok(DiscoveredLinks::default());
    }
    tokio::time::sleep(timings.settle).await;

    let lazy_args = json!([
        timings.lazy_load_steps,
        timings.lazy_load_step_px,
        timings.lazy_load_step_pause.as_millis() as u64,
        timings.lazy_load_final_pause.as_millis() as u64,
    ]);
    match page.evaluate(LAZY_LOAD_SCRIPT, lazy_args).await {
        Ok(_) => {}
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => debug!("Lazy-load scroll failed on {}: {}", index_url, e),
    }

    let hrefs: Vec<String> = match page.evaluate(HARVEST_LINKS_SCRIPT, json!([chain])).await {
        Ok(value) => serde_json::from_value(value).unwrap_or_else(|e| {
            warn!("Link harvest returned unexpected data: {}", e);
            Vec::new()
        }),
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            error!("Link harvest failed on {}: {}", index_url, e);
            Vec::new()
        }
    };

    let mut links = filter_listing_links(&base, hrefs);
    let total_found = links.len();
    links.truncate(max_links);

    info!("Found {} listing links ({} kept)", total_found, links.len());
    Ok(DiscoveredLinks { links, total_found })
}

/// Resolve, filter and deduplicate raw hrefs, keeping first-seen order.
pub fn filter_listing_links<I>(base: &Url, hrefs: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = std::collections::HashSet::new();
    hrefs
        .into_iter()
        .filter_map(|href| resolve_link(base, &href))
        .filter(|url| is_listing_path(url.path()))
        .map(String::from)
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

fn resolve_link(base: &Url, href: &str) -> Option<Url> {
    let mut url = base.join(href.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    Some(url)
}

fn is_listing_path(path: &str) -> bool {
    let path = path.to_lowercase();
    LISTING_KEYWORDS.iter().any(|keyword| path.contains(keyword))
}
