use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::browser::PageTimings;

/// Runtime settings, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub chrome_path: Option<PathBuf>,
    pub headless: bool,
    pub listing_settle: Duration,
    /// Prefix for download links in notifications.
    pub public_base_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            data_dir: PathBuf::from("data"),
            chrome_path: None,
            headless: true,
            listing_settle: Duration::from_millis(3000),
            public_base_url: String::new(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = get("PORT") {
            config.port = port.parse().with_context(|| format!("PORT={port}"))?;
        }
        if let Some(dir) = get("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config.chrome_path = get("CHROME_PATH").filter(|p| !p.is_empty()).map(PathBuf::from);
        if let Some(headless) = get("HEADLESS") {
            config.headless = !matches!(headless.to_lowercase().as_str(), "0" | "false" | "no");
        }
        if let Some(ms) = get("LISTING_SETTLE_MS") {
            let ms: u64 = ms.parse().with_context(|| format!("LISTING_SETTLE_MS={ms}"))?;
            config.listing_settle = Duration::from_millis(ms);
        }
        if let Some(base) = get("PUBLIC_BASE_URL") {
            config.public_base_url = base;
        }

        Ok(config)
    }

    pub fn page_timings(&self) -> PageTimings {
        PageTimings {
            settle: self.listing_settle,
            ..PageTimings::default()
        }
    }
}
