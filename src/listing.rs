use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Placeholder for any field the extractors could not find.
pub const UNKNOWN: &str = "N/A";

/// One extracted vehicle listing. Every field is always present; missing
/// values carry [`UNKNOWN`] or an empty list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ListingRecord {
    pub url: String,
    pub timestamp: DateTime<Utc>,
    pub domain: String,

    pub title: String,
    /// Raw price text, currency prefix included.
    pub price: String,

    pub brand: String,
    pub model: String,
    pub year: String,
    pub mileage: String,
    pub fuel: String,
    pub transmission: String,
    pub color: String,
    pub plate: String,
    pub doors: String,

    // Not populated yet; reserved for geocoding.
    pub city: String,
    pub state: String,

    pub photos: Vec<String>,
    pub total_photos: usize,

    pub optionals: Vec<String>,
    pub total_optionals: usize,

    pub phone: String,
    pub whatsapp: String,

    pub description: String,
    pub seller: String,
    pub views: String,

    pub extraction_success: bool,
}

impl ListingRecord {
    /// A record for `url` with every field set to its unknown value.
    pub fn empty(url: impl Into<String>, domain: impl Into<String>) -> Self {
        let unknown = || UNKNOWN.to_string();
        Self {
            url: url.into(),
            timestamp: Utc::now(),
            domain: domain.into(),
            title: unknown(),
            price: unknown(),
            brand: unknown(),
            model: unknown(),
            year: unknown(),
            mileage: unknown(),
            fuel: unknown(),
            transmission: unknown(),
            color: unknown(),
            plate: unknown(),
            doors: unknown(),
            city: unknown(),
            state: unknown(),
            photos: Vec::new(),
            total_photos: 0,
            optionals: Vec::new(),
            total_optionals: 0,
            phone: unknown(),
            whatsapp: unknown(),
            description: unknown(),
            seller: unknown(),
            views: unknown(),
            extraction_success: true,
        }
    }

    pub fn set_photos(&mut self, photos: Vec<String>) {
        self.total_photos = photos.len();
        self.photos = photos;
    }

    pub fn set_optionals(&mut self, optionals: Vec<String>) {
        self.total_optionals = optionals.len();
        self.optionals = optionals;
    }
}

/// `Some(value)` unless the value is empty or the unknown sentinel.
pub fn known(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty() && trimmed != UNKNOWN).then_some(trimmed)
}
