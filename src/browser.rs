//! Page automation port.
//!
//! The engine only needs three things from a browser: load a URL, run a
//! script in the page and get JSON back, and release everything when done.
//! `ChromeLauncher` / `ChromeSession` provide that on top of headless Chrome.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use once_cell::sync::Lazy;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

static USER_AGENTS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Edge/123.0.0.0 Safari/537.36",
    ]
});

/// When a navigation counts as loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    /// Navigation finished and the network went quiet.
    NetworkIdle,
    /// The document body exists; trackers may still be polling.
    DomReady,
}

#[derive(Debug, Error)]
pub enum PageError {
    #[error("failed to start browser session: {0}")]
    Launch(String),
    #[error("timed out waiting for {url}")]
    Timeout { url: String },
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("page script failed: {0}")]
    Script(String),
    #[error("browser session lost: {0}")]
    Disconnected(String),
}

impl PageError {
    /// Errors that leave the session unusable for the rest of the job.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PageError::Launch(_) | PageError::Disconnected(_))
    }
}

/// One exclusive browser page.
#[async_trait]
pub trait PageSession: Send {
    async fn navigate(
        &mut self,
        url: &str,
        wait: WaitCondition,
        timeout: Duration,
    ) -> Result<(), PageError>;

    /// Run `script` (a JS function expression) with `args` spread as its
    /// parameters and return its JSON-serialisable result.
    async fn evaluate(&mut self, script: &str, args: Value) -> Result<Value, PageError>;

    async fn close(&mut self);
}

/// Acquires a fresh page session for a job.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn PageSession>, PageError>;
}

/// Load timeouts and pauses used while driving pages.
#[derive(Debug, Clone)]
pub struct PageTimings {
    pub index_timeout: Duration,
    pub listing_timeout: Duration,
    /// Pause after a page reports loaded, before anything is read.
    pub settle: Duration,
    /// Pause after the final scroll-to-bottom on a listing page.
    pub scroll_settle: Duration,
    pub lazy_load_steps: u32,
    pub lazy_load_step_px: u32,
    pub lazy_load_step_pause: Duration,
    pub lazy_load_final_pause: Duration,
}

impl Default for PageTimings {
    fn default() -> Self {
        Self {
            index_timeout: Duration::from_secs(30),
            listing_timeout: Duration::from_secs(15),
            settle: Duration::from_millis(3000),
            scroll_settle: Duration::from_millis(1000),
            lazy_load_steps: 10,
            lazy_load_step_px: 300,
            lazy_load_step_pause: Duration::from_millis(200),
            lazy_load_final_pause: Duration::from_millis(1000),
        }
    }
}

/// Navigate, treating a load timeout as "work with what rendered".
pub async fn goto(
    page: &mut dyn PageSession,
    url: &str,
    wait: WaitCondition,
    timeout: Duration,
) -> Result<(), PageError> {
    match page.navigate(url, wait, timeout).await {
        Err(PageError::Timeout { .. }) => {
            warn!("⏱️ {} did not settle within {:?}, continuing with current DOM", url, timeout);
            Ok(())
        }
        other => other,
    }
}

#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
}

impl ChromeLauncher {
    pub fn new(headless: bool, chrome_path: Option<PathBuf>) -> Self {
        Self { headless, chrome_path }
    }
}

#[async_trait]
impl SessionLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Box<dyn PageSession>, PageError> {
        use rand::seq::SliceRandom;

        let user_agent = USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36");
        let headless = self.headless;
        let path = self.chrome_path.clone();

        info!("🚀 Launching Chrome (headless={})", headless);
        let session = tokio::task::spawn_blocking(move || -> anyhow::Result<ChromeSession> {
            let ua_arg = format!("--user-agent={}", user_agent);
            let args = vec![
                OsStr::new("--no-sandbox"),
                OsStr::new("--disable-dev-shm-usage"),
                OsStr::new("--disable-gpu"),
                OsStr::new("--disable-web-security"),
                OsStr::new("--disable-features=VizDisplayCompositor"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--lang=pt-BR"),
                OsStr::new(&ua_arg),
            ];
            let browser = Browser::new(LaunchOptions {
                headless,
                window_size: Some((1920, 1080)),
                path,
                args,
                idle_browser_timeout: Duration::from_secs(300),
                ..Default::default()
            })?;
            let tab = browser.new_tab()?;
            Ok(ChromeSession {
                browser: Some(browser),
                tab,
            })
        })
        .await
        .map_err(|e| PageError::Launch(e.to_string()))?
        .map_err(|e| PageError::Launch(e.to_string()))?;

        Ok(Box::new(session))
    }
}

/// A Chrome process with a single tab. Dropping it kills the process.
pub struct ChromeSession {
    browser: Option<Browser>,
    tab: Arc<Tab>,
}

impl ChromeSession {
    fn classify(url: &str, err: anyhow::Error) -> PageError {
        // headless_chrome reports every failure as an opaque anyhow error
        let reason = err.to_string();
        let lowered = reason.to_lowercase();
        if lowered.contains("connection is closed") || lowered.contains("connection closed") {
            PageError::Disconnected(reason)
        } else if lowered.contains("never came") || lowered.contains("timeout") || lowered.contains("timed out") {
            PageError::Timeout { url: url.to_string() }
        } else {
            PageError::Navigation {
                url: url.to_string(),
                reason,
            }
        }
    }
}

#[async_trait]
impl PageSession for ChromeSession {
    async fn navigate(
        &mut self,
        url: &str,
        wait: WaitCondition,
        timeout: Duration,
    ) -> Result<(), PageError> {
        let tab = self.tab.clone();
        let target = url.to_string();
        debug!("Navigating to {} ({:?}, {:?})", url, wait, timeout);

        tokio::task::spawn_blocking(move || {
            tab.set_default_timeout(timeout);
            tab.navigate_to(&target)
                .map_err(|e| Self::classify(&target, e))?;
            let waited = match wait {
                WaitCondition::NetworkIdle => tab.wait_until_navigated().map(|_| ()),
                WaitCondition::DomReady => tab
                    .wait_for_element_with_custom_timeout("body", timeout)
                    .map(|_| ()),
            };
            waited.map_err(|e| Self::classify(&target, e))
        })
        .await
        .map_err(|e| PageError::Disconnected(e.to_string()))?
    }

    async fn evaluate(&mut self, script: &str, args: Value) -> Result<Value, PageError> {
        let expression = wrap_script(script, &args);
        let tab = self.tab.clone();

        let remote = tokio::task::spawn_blocking(move || tab.evaluate(&expression, true))
            .await
            .map_err(|e| PageError::Disconnected(e.to_string()))?
            .map_err(|e| {
                let reason = e.to_string();
                if reason.to_lowercase().contains("connection is closed") {
                    PageError::Disconnected(reason)
                } else {
                    PageError::Script(reason)
                }
            })?;

        match remote.value {
            Some(Value::String(json)) => {
                serde_json::from_str(&json).map_err(|e| PageError::Script(e.to_string()))
            }
            other => Err(PageError::Script(format!("unexpected script result: {:?}", other))),
        }
    }

    async fn close(&mut self) {
        let Some(browser) = self.browser.take() else {
            return;
        };
        let tab = self.tab.clone();
        let closed = tokio::task::spawn_blocking(move || {
            let _ = tab.close(false);
            drop(browser);
        })
        .await;
        if let Err(e) = closed {
            warn!("Browser close task failed: {}", e);
        }
        info!("🧹 Browser session closed");
    }
}

/// Wrap a function expression so the page awaits it and hands back a JSON
/// string; CDP only returns primitives by value.
fn wrap_script(script: &str, args: &Value) -> String {
    let args = match args {
        Value::Null => "[]".to_string(),
        Value::Array(_) => args.to_string(),
        other => format!("[{}]", other),
    };
    format!(
        "(async () => {{ const __r = await ({})(...{}); return JSON.stringify(__r === undefined ? null : __r); }})()",
        script.trim(),
        args
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wrap_script_spreads_arguments() {
        let wrapped = wrap_script("(a, b) => a + b", &json!([1, 2]));
        assert!(wrapped.contains("((a, b) => a + b)(...[1,2])"));
        assert!(wrapped.contains("JSON.stringify"));
    }

    #[test]
    fn wrap_script_wraps_single_argument() {
        let wrapped = wrap_script("(s) => s", &json!({"k": 1}));
        assert!(wrapped.contains(r#"(...[{"k":1}])"#));
        assert!(wrap_script("() => 1", &Value::Null).contains("(...[])"));
    }

    #[test]
    fn only_session_errors_are_fatal() {
        assert!(PageError::Launch("no chrome".into()).is_fatal());
        assert!(PageError::Disconnected("gone".into()).is_fatal());
        assert!(!PageError::Script("boom".into()).is_fatal());
        assert!(!PageError::Timeout { url: "u".into() }.is_fatal());
        assert!(!PageError::Navigation { url: "u".into(), reason: "dns".into() }.is_fatal());
    }

    #[test]
    fn classify_maps_chrome_messages() {
        let timeout = ChromeSession::classify("http://x", anyhow::anyhow!("The event waited for never came"));
        assert!(matches!(timeout, PageError::Timeout { .. }));

        let closed = ChromeSession::classify(
            "http://x",
            anyhow::anyhow!("Unable to make method calls because underlying connection is closed"),
        );
        assert!(matches!(closed, PageError::Disconnected(_)));

        let failed = ChromeSession::classify("http://x", anyhow::anyhow!("net::ERR_NAME_NOT_RESOLVED"));
        assert!(matches!(failed, PageError::Navigation { .. }));
    }
}
