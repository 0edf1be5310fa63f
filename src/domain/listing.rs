//! Vehicle listing entity
//!
//! A listing is identified by the marketplace-assigned id. Everything the
//! collector learns about it is normalized here and fingerprinted with a
//! content hash so the store can tell a real change from a re-sighting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::PipelineError;

/// Lifecycle status of a stored listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Active,
    Removed,
    PriceChanged,
}

impl ListingStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Removed => "removed",
            Self::PriceChanged => "price_changed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, PipelineError> {
        match value {
            "active" => Ok(Self::Active),
            "removed" => Ok(Self::Removed),
            "price_changed" => Ok(Self::PriceChanged),
            other => Err(PipelineError::Serialization(format!(
                "unknown listing status '{other}'"
            ))),
        }
    }
}

/// Record handed back by the fetcher, exactly as the page parser produced it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub id: String,
    pub title: String,
    /// Asking price in minor currency units
    #[serde(default)]
    pub price: Option<i64>,
    #[serde(default)]
    pub mileage: Option<i64>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub make: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    /// Set when the marketplace reports the listing as sold or withdrawn
    #[serde(default)]
    pub removed: bool,
}

/// Normalized, fingerprinted listing as owned by the listing store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub title: String,
    pub price: Option<i64>,
    pub mileage: Option<i64>,
    pub year: Option<i32>,
    pub make: String,
    pub model: String,
    pub location: String,
    pub url: Option<String>,
    pub image_urls: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: ListingStatus,
    pub content_hash: String,
}

/// Fields that are only ever read back whole; stored as one compressed blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingBody {
    pub title: String,
    pub location: String,
    pub url: Option<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
}

pub const UNKNOWN_LABEL: &str = "unknown";

impl Listing {
    /// Normalize a raw record observed at `seen_at`
    pub fn from_raw(raw: RawListing, seen_at: DateTime<Utc>) -> Result<Self, PipelineError> {
        let id = raw.id.trim().to_string();
        if id.is_empty() {
            return Err(PipelineError::InvalidRecord("listing id is empty".to_string()));
        }
        if matches!(raw.price, Some(p) if p < 0) {
            return Err(PipelineError::InvalidRecord(format!(
                "listing {id} has a negative price"
            )));
        }

        let status = if raw.removed {
            ListingStatus::Removed
        } else {
            ListingStatus::Active
        };

        let mut listing = Self {
            id,
            title: collapse_whitespace(&raw.title),
            price: raw.price,
            mileage: raw.mileage.filter(|m| *m >= 0),
            year: raw.year,
            make: normalize_label(raw.make.as_deref()),
            model: normalize_label(raw.model.as_deref()),
            location: raw.location.as_deref().map(collapse_whitespace).unwrap_or_default(),
            url: raw.url.filter(|u| !u.trim().is_empty()),
            image_urls: raw.image_urls,
            first_seen: seen_at,
            last_seen: seen_at,
            status,
            content_hash: String::new(),
        };
        listing.content_hash = listing.compute_content_hash();
        Ok(listing)
    }

    /// Fingerprint of every field a reader would consider part of the listing.
    ///
    /// Sighting timestamps and the derived `price_changed` status are excluded;
    /// image URLs are excluded because marketplaces rotate CDN links.
    pub fn compute_content_hash(&self) -> String {
        let removed = if self.status == ListingStatus::Removed { "1" } else { "0" };
        let fields = [
            self.id.as_str(),
            self.title.as_str(),
            &opt_to_string(self.price),
            &opt_to_string(self.mileage),
            &opt_to_string(self.year),
            self.make.as_str(),
            self.model.as_str(),
            self.location.as_str(),
            self.url.as_deref().unwrap_or_default(),
            removed,
        ];

        let mut hasher = blake3::Hasher::new();
        for field in fields {
            hasher.update(field.as_bytes());
            hasher.update(&[0x1f]);
        }
        hasher.finalize().to_hex().to_string()
    }

    pub fn body(&self) -> ListingBody {
        ListingBody {
            title: self.title.clone(),
            location: self.location.clone(),
            url: self.url.clone(),
            image_urls: self.image_urls.clone(),
        }
    }

    pub fn is_removed(&self) -> bool {
        self.status == ListingStatus::Removed
    }
}

/// Lowercase, trim, collapse internal whitespace and drop punctuation so that
/// "Toyota ", "TOYOTA" and "toyota." land in the same bucket.
pub fn normalize_label(value: Option<&str>) -> String {
    let cleaned: String = value
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-')
        .collect::<String>()
        .to_lowercase();
    let collapsed = collapse_whitespace(&cleaned);
    if collapsed.is_empty() {
        UNKNOWN_LABEL.to_string()
    } else {
        collapsed
    }
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn opt_to_string<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: &str, price: i64) -> RawListing {
        RawListing {
            id: id.to_string(),
            title: "2018 Toyota  Camry LE".to_string(),
            price: Some(price),
            mileage: Some(64_000),
            year: Some(2018),
            make: Some(" Toyota ".to_string()),
            model: Some("CAMRY".to_string()),
            location: Some("Austin,  TX".to_string()),
            url: Some("https://example.test/item/1".to_string()),
            image_urls: vec!["https://cdn.test/a.jpg".to_string()],
            removed: false,
        }
    }

    #[test]
    fn normalizes_labels_and_text() {
        let listing = Listing::from_raw(raw("1", 1_500_000), Utc::now()).unwrap();
        assert_eq!(listing.make, "toyota");
        assert_eq!(listing.model, "camry");
        assert_eq!(listing.title, "2018 Toyota Camry LE");
        assert_eq!(listing.location, "Austin, TX");
        assert_eq!(normalize_label(None), UNKNOWN_LABEL);
        assert_eq!(normalize_label(Some("Mercedes-Benz.")), "mercedes-benz");
    }

    #[test]
    fn content_hash_ignores_sighting_time_and_images() {
        let a = Listing::from_raw(raw("1", 1_500_000), Utc::now()).unwrap();
        let mut other = raw("1", 1_500_000);
        other.image_urls = vec!["https://cdn.test/rotated.jpg".to_string()];
        let b = Listing::from_raw(other, Utc::now() + chrono::Duration::days(3)).unwrap();
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[test]
    fn content_hash_tracks_price_and_removal() {
        let base = Listing::from_raw(raw("1", 1_500_000), Utc::now()).unwrap();
        let repriced = Listing::from_raw(raw("1", 1_450_000), Utc::now()).unwrap();
        let mut gone = raw("1", 1_500_000);
        gone.removed = true;
        let removed = Listing::from_raw(gone, Utc::now()).unwrap();

        assert_ne!(base.content_hash, repriced.content_hash);
        assert_ne!(base.content_hash, removed.content_hash);
        assert_eq!(removed.status, ListingStatus::Removed);
    }

    #[test]
    fn rejects_empty_id_and_negative_price() {
        assert!(Listing::from_raw(raw("  ", 10), Utc::now()).is_err());
        assert!(Listing::from_raw(raw("1", -5), Utc::now()).is_err());
    }

    #[test]
    fn status_round_trips_through_storage_text() {
        for status in [ListingStatus::Active, ListingStatus::Removed, ListingStatus::PriceChanged] {
            assert_eq!(ListingStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(ListingStatus::parse("archived").is_err());
    }
}
