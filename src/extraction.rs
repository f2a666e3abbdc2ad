//! Per-listing field extraction.
//!
//! A listing page is captured with a single in-page script into a
//! [`PageSnapshot`]: selector-chain hits plus the raw body text. Everything
//! after that (currency scans, spec inference, image filtering, contact
//! lookup) runs host-side on the snapshot, so each heuristic is a plain
//! function over strings.

use std::collections::{BTreeMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;
use url::Url;

use crate::browser::{goto, PageError, PageSession, PageTimings, WaitCondition};
use crate::listing::{known, ListingRecord, UNKNOWN};
use crate::selectors::{self, SelectorSet};

pub const SCROLL_TO_BOTTOM_SCRIPT: &str = r#"
() => {
    window.scrollTo(0, document.body.scrollHeight);
    return true;
}
"#;

/// Captures everything the host-side extractors need in one evaluation.
pub const SNAPSHOT_SCRIPT: &str = r#"
(query) => {
    const clean = (text) => text ? text.trim().replace(/\s+/g, ' ') : '';
    const first = (selectors) => {
        for (const selector of selectors) {
            try {
                const el = document.querySelector(selector);
                if (el && el.textContent.trim()) return clean(el.textContent);
            } catch (e) {}
        }
        return null;
    };
    const collect = (selectors, read) => {
        const out = [];
        for (const selector of selectors) {
            try {
                document.querySelectorAll(selector).forEach(el => {
                    const value = read(el);
                    if (value) out.push(value);
                });
            } catch (e) {}
        }
        return out;
    };

    const specMatches = {};
    for (const [field, selectors] of Object.entries(query.specs)) {
        const hit = first(selectors);
        if (hit) specMatches[field] = hit;
    }

    const optionalItems = [];
    for (const selector of query.optionals_sections) {
        try {
            const section = document.querySelector(selector);
            if (!section) continue;
            section.querySelectorAll('li, .item, span, p').forEach(item => {
                const text = clean(item.textContent);
                if (text) optionalItems.push(text);
            });
        } catch (e) {}
    }

    // Contact buttons often carry the messaging link outside an anchor.
    const contactLinks = collect(query.contact_buttons, el =>
        ['href', 'data-href', 'data-url', 'onclick']
            .map(name => el.getAttribute(name))
            .find(value => value && /whatsapp|wa\.me/.test(value)));

    return {
        url: window.location.href,
        hostname: window.location.hostname,
        document_title: clean(document.title),
        body_text: document.body ? document.body.textContent : '',
        title_match: first(query.title),
        price_texts: collect(query.price, el => clean(el.textContent)),
        spec_matches: specMatches,
        image_sources: collect(query.images, img =>
            img.src || img.getAttribute('data-src') || img.getAttribute('data-lazy')),
        optional_items: optionalItems,
        messaging_links: Array.from(
            document.querySelectorAll('a[href*="whatsapp"], a[href*="wa.me"]')
        ).map(a => a.href).concat(contactLinks),
        seller_match: first(query.seller),
        description_match: first(query.description),
        views_match: first(query.views),
    };
}
"#;

/// Selector chains handed to [`SNAPSHOT_SCRIPT`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotQuery {
    pub title: Vec<String>,
    pub price: Vec<String>,
    pub specs: BTreeMap<String, Vec<String>>,
    pub images: Vec<String>,
    pub optionals_sections: Vec<String>,
    pub contact_buttons: Vec<String>,
    pub seller: Vec<String>,
    pub description: Vec<String>,
    pub views: Vec<String>,
}

impl SnapshotQuery {
    pub fn from_selectors(set: &SelectorSet) -> Self {
        let chain = |field: &str| set.chain(field).to_vec();
        Self {
            title: chain(selectors::TITLE),
            price: chain(selectors::PRICE),
            specs: selectors::SPEC_FIELDS
                .iter()
                .map(|field| (field.to_string(), chain(field)))
                .filter(|(_, chain)| !chain.is_empty())
                .collect(),
            images: chain(selectors::IMAGES),
            optionals_sections: chain(selectors::OPTIONALS_SECTION),
            contact_buttons: chain(selectors::CONTACT_BUTTON),
            seller: chain(selectors::SELLER),
            description: chain(selectors::DESCRIPTION),
            views: chain(selectors::VIEWS),
        }
    }
}

/// What the page looked like once loaded, as returned by [`SNAPSHOT_SCRIPT`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PageSnapshot {
    pub url: String,
    pub hostname: String,
    pub document_title: String,
    pub body_text: String,
    pub title_match: Option<String>,
    pub price_texts: Vec<String>,
    pub spec_matches: BTreeMap<String, String>,
    pub image_sources: Vec<String>,
    pub optional_items: Vec<String>,
    pub messaging_links: Vec<String>,
    pub seller_match: Option<String>,
    pub description_match: Option<String>,
    pub views_match: Option<String>,
}

/// Which optional extractors run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractOptions {
    pub images: bool,
    pub optionals: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            images: true,
            optionals: true,
        }
    }
}

enum Inference {
    Pattern(Regex),
    Vocabulary(&'static [&'static str]),
}

/// Text inference per spec field, tried in this order. Matching runs on
/// the lowercased body text and the first occurrence wins.
static SPEC_INFERENCE: Lazy<Vec<(&'static str, Inference)>> = Lazy::new(|| {
    vec![
        (selectors::MILEAGE, Inference::Pattern(Regex::new(r"\d[\d.,]*\s*km").unwrap())),
        (
            selectors::FUEL,
            Inference::Vocabulary(&["flex", "gasolina", "etanol", "diesel", "gnv"]),
        ),
        (
            selectors::TRANSMISSION,
            Inference::Vocabulary(&["automático", "manual", "cvt"]),
        ),
        (
            selectors::YEAR,
            Inference::Pattern(Regex::new(r"\b(?:19|20)\d{2}(?:/(?:19|20)\d{2})?\b").unwrap()),
        ),
        (selectors::DOORS, Inference::Pattern(Regex::new(r"\d\s*portas?").unwrap())),
        (
            selectors::COLOR,
            Inference::Vocabulary(&["preta", "branca", "prata", "vermelha", "azul", "cinza"]),
        ),
        (
            selectors::PLATE,
            Inference::Pattern(Regex::new(r"(?i)\b[a-z]{3}-?\d{4}\b|\b[a-z]{3}\d[a-z]\d{2}\b").unwrap()),
        ),
    ]
});

static PRICE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"R\$\s*[\d.,]+").unwrap());
static PHONE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(?\d{2}\)?\s*\d{4,5}-?\d{4}").unwrap());
static MESSAGING_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{11,}").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".webp"];
const IMAGE_EXCLUDE_MARKERS: &[&str] = &["logo", "icon", "btn", "button"];
const MIN_IMAGE_URL_LEN: usize = 21;

const COMMON_OPTIONALS: &[&str] = &[
    "air bag",
    "abs",
    "direção hidráulica",
    "ar condicionado",
    "vidros elétricos",
    "travas elétricas",
    "alarme",
    "som",
    "cd player",
    "mp3",
    "bluetooth",
    "gps",
    "câmera de ré",
    "sensor de estacionamento",
    "teto solar",
    "banco de couro",
];
const MAX_OPTIONALS: usize = 20;

/// Load one listing page and build its record.
///
/// A navigation or script failure drops the listing; the caller counts it.
pub async fn extract_listing(
    page: &mut dyn PageSession,
    url: &str,
    selectors: &SelectorSet,
    options: ExtractOptions,
    timings: &PageTimings,
) -> Result<ListingRecord, PageError> {
    goto(page, url, WaitCondition::DomReady, timings.listing_timeout).await?;
    tokio::time::sleep(timings.settle).await;

    page.evaluate(SCROLL_TO_BOTTOM_SCRIPT, Value::Null).await?;
    tokio::time::sleep(timings.scroll_settle).await;

    let query = SnapshotQuery::from_selectors(selectors);
    let raw = page.evaluate(SNAPSHOT_SCRIPT, json!([query])).await?;
    let snapshot: PageSnapshot =
        serde_json::from_value(raw).map_err(|e| PageError::Script(e.to_string()))?;

    let record = assemble_record(url, &snapshot, options);
    info!("✓ Extracted: {}", record.title.chars().take(50).collect::<String>());
    Ok(record)
}

/// Turn a snapshot into a fully populated record.
pub fn assemble_record(requested_url: &str, snapshot: &PageSnapshot, options: ExtractOptions) -> ListingRecord {
    let final_url = known(&snapshot.url).unwrap_or(requested_url).to_string();
    let page_url = Url::parse(&final_url).ok();
    let domain = known(&snapshot.hostname)
        .map(str::to_string)
        .or_else(|| page_url.as_ref().and_then(|u| u.host_str()).map(str::to_string))
        .unwrap_or_else(|| UNKNOWN.to_string());

    let mut record = ListingRecord::empty(final_url, domain);

    record.title = extract_title(snapshot.title_match.as_deref(), &snapshot.document_title)
        .unwrap_or_else(|| UNKNOWN.to_string());
    if let Some(price) = extract_price(&snapshot.price_texts, &snapshot.body_text) {
        record.price = price;
    }

    let specs = extract_specs(&snapshot.spec_matches, &snapshot.body_text);
    for (field, value) in specs {
        let slot = match field {
            selectors::MILEAGE => &mut record.mileage,
            selectors::FUEL => &mut record.fuel,
            selectors::TRANSMISSION => &mut record.transmission,
            selectors::YEAR => &mut record.year,
            selectors::DOORS => &mut record.doors,
            selectors::COLOR => &mut record.color,
            selectors::PLATE => &mut record.plate,
            _ => continue,
        };
        *slot = value;
    }

    if let Some((brand, model)) = split_brand_model(&record.title) {
        record.brand = brand;
        record.model = model;
    }

    if options.images {
        record.set_photos(extract_images(&snapshot.image_sources, page_url.as_ref()));
    }
    if options.optionals {
        record.set_optionals(extract_optionals(&snapshot.optional_items, &snapshot.body_text));
    }

    if let Some(phone) = extract_phone(&snapshot.body_text) {
        record.phone = phone;
    }
    if let Some(number) = extract_messaging_number(&snapshot.messaging_links) {
        record.whatsapp = number;
    }

    let matched = |value: &Option<String>| value.as_deref().and_then(known).map(clean_text);
    if let Some(seller) = matched(&snapshot.seller_match) {
        record.seller = seller;
    }
    if let Some(description) = matched(&snapshot.description_match) {
        record.description = description;
    }
    if let Some(views) = matched(&snapshot.views_match) {
        record.views = views;
    }

    record
}

/// First selector hit, falling back to the document title.
pub fn extract_title(selector_match: Option<&str>, document_title: &str) -> Option<String> {
    selector_match
        .and_then(known)
        .or_else(|| known(document_title))
        .map(clean_text)
}

/// The first price element showing a currency marker; otherwise the largest
/// `R$` amount anywhere in the text. Equal amounts keep the earliest.
pub fn extract_price(price_texts: &[String], body_text: &str) -> Option<String> {
    if let Some(text) = price_texts
        .iter()
        .find(|text| text.contains("R$") || text.contains('$'))
    {
        return Some(clean_text(text));
    }

    let mut best: Option<(u128, &str)> = None;
    for found in PRICE_PATTERN.find_iter(body_text) {
        let amount = found.as_str().trim_end_matches(['.', ',']);
        let digits: String = amount.chars().filter(char::is_ascii_digit).collect();
        let Ok(value) = digits.parse::<u128>() else {
            continue;
        };
        if best.map_or(true, |(top, _)| value > top) {
            best = Some((value, amount));
        }
    }
    best.map(|(_, text)| clean_text(text))
}

/// Spec values keyed by field: selector hits first, text inference for the rest.
pub fn extract_specs(
    selector_hits: &BTreeMap<String, String>,
    body_text: &str,
) -> Vec<(&'static str, String)> {
    let lowered = body_text.to_lowercase();
    SPEC_INFERENCE
        .iter()
        .filter_map(|(field, inference)| {
            if let Some(hit) = selector_hits.get(*field).map(String::as_str).and_then(known) {
                return Some((*field, clean_text(hit)));
            }
            let inferred = match inference {
                Inference::Pattern(regex) => regex.find(&lowered).map(|m| m.as_str().to_string()),
                Inference::Vocabulary(words) => words
                    .iter()
                    .find(|word| lowered.contains(*word))
                    .map(|word| word.to_string()),
            }?;
            let inferred = if *field == selectors::PLATE {
                inferred.to_uppercase()
            } else {
                inferred
            };
            Some((*field, inferred))
        })
        .collect()
}

/// Vehicle photos: image files only, no logos or icons, absolute, unique.
pub fn extract_images(sources: &[String], page_url: Option<&Url>) -> Vec<String> {
    let mut seen = HashSet::new();
    sources
        .iter()
        .map(|src| src.trim())
        .filter(|src| is_vehicle_image(src))
        .filter_map(|src| match Url::parse(src) {
            Ok(url) => Some(url.to_string()),
            Err(_) => page_url.and_then(|base| base.join(src).ok()).map(String::from),
        })
        .filter(|src| seen.insert(src.clone()))
        .collect()
}

fn is_vehicle_image(src: &str) -> bool {
    let lowered = src.to_lowercase();
    src.len() >= MIN_IMAGE_URL_LEN
        && IMAGE_EXTENSIONS.iter().any(|ext| lowered.contains(ext))
        && !IMAGE_EXCLUDE_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Feature list items of 3 to 49 characters, else vocabulary hits from the
/// page text.
pub fn extract_optionals(section_items: &[String], body_text: &str) -> Vec<String> {
    let mut found: Vec<String> = section_items
        .iter()
        .map(|item| clean_text(item))
        .filter(|item| (3..50).contains(&item.chars().count()))
        .collect();

    if found.is_empty() {
        let lowered = body_text.to_lowercase();
        found = COMMON_OPTIONALS
            .iter()
            .filter(|optional| lowered.contains(*optional))
            .map(|optional| optional.to_string())
            .collect();
    }

    let mut seen = HashSet::new();
    found.retain(|item| seen.insert(item.clone()));
    found.truncate(MAX_OPTIONALS);
    found
}

pub fn extract_phone(body_text: &str) -> Option<String> {
    PHONE_PATTERN.find(body_text).map(|m| m.as_str().to_string())
}

/// Number from the first messaging deep link on the page. Anchors come
/// before contact buttons.
pub fn extract_messaging_number(links: &[String]) -> Option<String> {
    let link = links.first()?;
    MESSAGING_NUMBER.find(link).map(|m| m.as_str().to_string())
}

/// First title word as brand, the next one or two as model. Crude, but no
/// selector reliably marks either across sites.
pub fn split_brand_model(title: &str) -> Option<(String, String)> {
    let title = known(title)?;
    let words: Vec<String> = title.to_uppercase().split_whitespace().map(str::to_string).collect();
    if words.len() < 2 {
        return None;
    }
    let model_end = words.len().min(3);
    Some((words[0].clone(), words[1..model_end].join(" ")))
}

fn clean_text(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}
