//! In-memory page sessions for tests.
//!
//! `FakePage` serves static HTML per URL and emulates the engine's page
//! scripts with `scraper`, recognising each script by its constant.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use crate::browser::{PageError, PageSession, PageTimings, SessionLauncher, WaitCondition};
use crate::discovery::{HARVEST_LINKS_SCRIPT, LAZY_LOAD_SCRIPT};
use crate::extraction::{PageSnapshot, SnapshotQuery, SCROLL_TO_BOTTOM_SCRIPT, SNAPSHOT_SCRIPT};
use crate::webhook::JobNotification;

/// Timings with every pause removed.
pub fn fast_timings() -> PageTimings {
    PageTimings {
        index_timeout: Duration::from_secs(1),
        listing_timeout: Duration::from_secs(1),
        settle: Duration::ZERO,
        scroll_settle: Duration::ZERO,
        lazy_load_steps: 0,
        lazy_load_step_px: 0,
        lazy_load_step_pause: Duration::ZERO,
        lazy_load_final_pause: Duration::ZERO,
    }
}

/// A local endpoint answering `status` to every notification it receives.
/// Returns its `/hook` URL and the stream of received payloads.
pub async fn webhook_receiver(status: StatusCode) -> (String, mpsc::Receiver<JobNotification>) {
    let (tx, rx) = mpsc::channel(4);
    let app = Router::new()
        .route(
            "/hook",
            post(
                move |State(tx): State<mpsc::Sender<JobNotification>>, Json(body): Json<JobNotification>| async move {
                    let _ = tx.send(body).await;
                    status
                },
            ),
        )
        .with_state(tx);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/hook", addr), rx)
}

#[derive(Debug, Clone, Default)]
struct Fixture {
    html: String,
    unreachable: bool,
    slow: bool,
    disconnect: bool,
    script_failure: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FakePage {
    fixtures: HashMap<String, Fixture>,
    current: Option<String>,
    visits: Arc<Mutex<Vec<String>>>,
    closes: Arc<AtomicUsize>,
}

impl FakePage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: &str, html: &str) -> Self {
        self.fixture(url).html = html.to_string();
        self
    }

    /// Navigation fails outright.
    pub fn with_unreachable(mut self, url: &str) -> Self {
        self.fixture(url).unreachable = true;
        self
    }

    /// Navigation times out, but the document is still readable.
    pub fn with_slow(mut self, url: &str) -> Self {
        self.fixture(url).slow = true;
        self
    }

    /// The browser connection drops when this URL is requested.
    pub fn with_disconnect_on(mut self, url: &str) -> Self {
        self.fixture(url).disconnect = true;
        self
    }

    /// Every script evaluated on this page throws.
    pub fn with_script_failure(mut self, url: &str) -> Self {
        self.fixture(url).script_failure = true;
        self
    }

    /// URLs navigated to, across every clone of this page.
    pub fn visits(&self) -> Vec<String> {
        self.visits.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn fixture(&mut self, url: &str) -> &mut Fixture {
        self.fixtures.entry(url.to_string()).or_default()
    }

    fn run_script(&self, script: &str, args: &Value) -> Result<Value, PageError> {
        let url = self
            .current
            .as_deref()
            .ok_or_else(|| PageError::Script("no document loaded".into()))?;
        let fixture = &self.fixtures[url];
        if fixture.script_failure {
            return Err(PageError::Script("TypeError: Cannot read properties of null".into()));
        }

        let document = Html::parse_document(&fixture.html);
        let first_arg = args.get(0).cloned().unwrap_or(Value::Null);

        if script == LAZY_LOAD_SCRIPT || script == SCROLL_TO_BOTTOM_SCRIPT {
            Ok(Value::Bool(true))
        } else if script == HARVEST_LINKS_SCRIPT {
            let selectors: Vec<String> =
                serde_json::from_value(first_arg).map_err(|e| PageError::Script(e.to_string()))?;
            let hrefs: Vec<String> = parsed(&selectors)
                .iter()
                .flat_map(|selector| document.select(selector))
                .filter_map(|link| link.value().attr("href").map(str::to_string))
                .collect();
            Ok(Value::from(hrefs))
        } else if script == SNAPSHOT_SCRIPT {
            let query: SnapshotQuery =
                serde_json::from_value(first_arg).map_err(|e| PageError::Script(e.to_string()))?;
            let snapshot = snapshot(url, &document, &query);
            serde_json::to_value(snapshot).map_err(|e| PageError::Script(e.to_string()))
        } else {
            Err(PageError::Script("unrecognised script".into()))
        }
    }
}

#[async_trait]
impl PageSession for FakePage {
    async fn navigate(&mut self, url: &str, _wait: WaitCondition, _timeout: Duration) -> Result<(), PageError> {
        self.visits.lock().unwrap().push(url.to_string());
        let Some(fixture) = self.fixtures.get(url) else {
            self.current = None;
            return Err(PageError::Navigation {
                url: url.to_string(),
                reason: "net::ERR_NAME_NOT_RESOLVED".into(),
            });
        };
        if fixture.disconnect {
            return Err(PageError::Disconnected("connection is closed".into()));
        }
        if fixture.unreachable {
            self.current = None;
            return Err(PageError::Navigation {
                url: url.to_string(),
                reason: "net::ERR_CONNECTION_REFUSED".into(),
            });
        }
        self.current = Some(url.to_string());
        if fixture.slow {
            return Err(PageError::Timeout { url: url.to_string() });
        }
        Ok(())
    }

    async fn evaluate(&mut self, script: &str, args: Value) -> Result<Value, PageError> {
        self.run_script(script, &args)
    }

    async fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out clones of one `FakePage`, or refuses to launch.
pub struct FakeLauncher {
    page: Option<FakePage>,
}

impl FakeLauncher {
    pub fn new(page: FakePage) -> Self {
        Self { page: Some(page) }
    }

    pub fn failing() -> Self {
        Self { page: None }
    }
}

#[async_trait]
impl SessionLauncher for FakeLauncher {
    async fn launch(&self) -> Result<Box<dyn PageSession>, PageError> {
        match &self.page {
            Some(page) => Ok(Box::new(page.clone())),
            None => Err(PageError::Launch("Could not auto detect a chrome executable".into())),
        }
    }
}

fn parsed(chain: &[String]) -> Vec<Selector> {
    chain.iter().filter_map(|s| Selector::parse(s).ok()).collect()
}

fn text_of(element: ElementRef<'_>) -> String {
    let raw: String = element.text().collect();
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn first_text(document: &Html, chain: &[String]) -> Option<String> {
    parsed(chain).iter().find_map(|selector| {
        document
            .select(selector)
            .next()
            .map(text_of)
            .filter(|text| !text.is_empty())
    })
}

fn snapshot(url: &str, document: &Html, query: &SnapshotQuery) -> PageSnapshot {
    let select_all = |css: &str| Selector::parse(css).ok();

    let body_text = select_all("body")
        .and_then(|body| document.select(&body).next().map(|b| b.text().collect::<String>()))
        .unwrap_or_default();
    let document_title = select_all("title")
        .and_then(|title| document.select(&title).next().map(text_of))
        .unwrap_or_default();

    let price_texts = parsed(&query.price)
        .iter()
        .flat_map(|selector| document.select(selector).map(text_of).collect::<Vec<_>>())
        .filter(|text| !text.is_empty())
        .collect();

    let spec_matches = query
        .specs
        .iter()
        .filter_map(|(field, chain)| first_text(document, chain).map(|hit| (field.clone(), hit)))
        .collect();

    let image_sources = parsed(&query.images)
        .iter()
        .flat_map(|selector| document.select(selector).collect::<Vec<_>>())
        .filter_map(|img| {
            let attrs = img.value();
            ["src", "data-src", "data-lazy"]
                .iter()
                .find_map(|name| attrs.attr(name).filter(|v| !v.is_empty()))
                .map(str::to_string)
        })
        .collect();

    let items = select_all("li, .item, span, p");
    let optional_items = match items {
        Some(items) => parsed(&query.optionals_sections)
            .iter()
            .filter_map(|selector| document.select(selector).next())
            .flat_map(|section| section.select(&items).map(text_of).collect::<Vec<_>>())
            .filter(|text| !text.is_empty())
            .collect(),
        None => Vec::new(),
    };

    let mut messaging_links: Vec<String> = select_all(r#"a[href*="whatsapp"], a[href*="wa.me"]"#)
        .map(|links| {
            document
                .select(&links)
                .filter_map(|a| a.value().attr("href").map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    messaging_links.extend(
        parsed(&query.contact_buttons)
            .iter()
            .flat_map(|selector| document.select(selector).collect::<Vec<_>>())
            .filter_map(|button| {
                ["href", "data-href", "data-url", "onclick"]
                    .iter()
                    .filter_map(|name| button.value().attr(name))
                    .find(|value| value.contains("whatsapp") || value.contains("wa.me"))
                    .map(str::to_string)
            }),
    );

    PageSnapshot {
        url: url.to_string(),
        hostname: Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default(),
        document_title,
        body_text,
        title_match: first_text(document, &query.title),
        price_texts,
        spec_matches,
        image_sources,
        optional_items,
        messaging_links,
        seller_match: first_text(document, &query.seller),
        description_match: first_text(document, &query.description),
        views_match: first_text(document, &query.views),
    }
}
