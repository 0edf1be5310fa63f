//! Pre-aggregated metric snapshots
//!
//! A bucket is a `(metric, dimension, window)` key. Its statistics are merged
//! with commutative, associative operators so that batches may be folded in
//! any order and any partition.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::PipelineError;
use crate::domain::listing::Listing;
use crate::domain::task::TaskId;

/// Listing attribute a snapshot summarizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Price,
    Mileage,
}

impl Metric {
    pub const ALL: [Metric; 2] = [Metric::Price, Metric::Mileage];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Mileage => "mileage",
        }
    }

    pub fn parse(value: &str) -> Result<Self, PipelineError> {
        match value {
            "price" => Ok(Self::Price),
            "mileage" => Ok(Self::Mileage),
            other => Err(PipelineError::Serialization(format!("unknown metric '{other}'"))),
        }
    }

}

/// Dimension label for a make/model pair, e.g. `toyota/camry`
pub fn model_dimension(make: &str, model: &str) -> String {
    format!("{make}/{model}")
}

/// Dimension label rolling up every model of a make, e.g. `toyota/*`
pub fn make_dimension(make: &str) -> String {
    format!("{make}/*")
}

/// ISO week label used as the time window, e.g. `2024-W03`
pub fn window_for(at: DateTime<Utc>) -> String {
    at.format("%G-W%V").to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    pub metric: Metric,
    pub dimension: String,
    pub window: String,
}

impl BucketKey {
    pub fn new(metric: Metric, dimension: impl Into<String>, window: impl Into<String>) -> Self {
        Self {
            metric,
            dimension: dimension.into(),
            window: window.into(),
        }
    }

    /// Make label of the dimension (`toyota` for both `toyota/camry` and `toyota/*`)
    pub fn make(&self) -> &str {
        self.dimension.split('/').next().unwrap_or_default()
    }

    /// Model label, `None` for a make roll-up
    pub fn model(&self) -> Option<&str> {
        self.dimension.split_once('/').map(|(_, model)| model).filter(|m| *m != "*")
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.metric.as_str(), self.dimension, self.window)
    }
}

/// Mergeable running statistics for one bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub count: u64,
    pub sum: i64,
    pub sum_squares: f64,
    pub min: Option<i64>,
    pub max: Option<i64>,
}

impl MetricStats {
    pub fn observe(&mut self, value: i64) {
        self.count += 1;
        self.sum = self.sum.saturating_add(value);
        self.sum_squares += (value as f64) * (value as f64);
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    pub fn merge(&mut self, other: &MetricStats) {
        self.count += other.count;
        self.sum = self.sum.saturating_add(other.sum);
        self.sum_squares += other.sum_squares;
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum as f64 / self.count as f64)
    }

    /// Population variance
    pub fn variance(&self) -> Option<f64> {
        let mean = self.mean()?;
        let variance = self.sum_squares / self.count as f64 - mean * mean;
        Some(variance.max(0.0))
    }

    pub fn std_dev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }
}

impl FromIterator<i64> for MetricStats {
    fn from_iter<I: IntoIterator<Item = i64>>(iter: I) -> Self {
        let mut stats = Self::default();
        for value in iter {
            stats.observe(value);
        }
        stats
    }
}

/// Persisted aggregate for one bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub key: BucketKey,
    pub stats: MetricStats,
    /// Incremented on every write of this bucket
    pub version: i64,
    /// Provenance: the last task whose contribution is included
    pub last_task_id: Option<TaskId>,
    pub updated_at: DateTime<Utc>,
    pub checksum: String,
}

impl AggregateSnapshot {
    pub fn new(key: BucketKey, stats: MetricStats, last_task_id: Option<TaskId>) -> Self {
        let mut snapshot = Self {
            key,
            stats,
            version: 0,
            last_task_id,
            updated_at: Utc::now().trunc_subsecs(3),
            checksum: String::new(),
        };
        snapshot.seal();
        snapshot
    }

    pub fn compute_checksum(&self) -> String {
        let s = &self.stats;
        let material = format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.key.metric.as_str(),
            self.key.dimension,
            self.key.window,
            s.count,
            s.sum,
            s.sum_squares.to_bits(),
            s.min.map(|v| v.to_string()).unwrap_or_default(),
            s.max.map(|v| v.to_string()).unwrap_or_default(),
            self.version,
            self.last_task_id.map(|v| v.to_string()).unwrap_or_default(),
        );
        blake3::hash(material.as_bytes()).to_hex().to_string()
    }

    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    pub fn verify(&self) -> bool {
        self.checksum == self.compute_checksum()
    }
}

/// One listing's share of the statistics, recorded when its change is aggregated
///
/// The window is fixed at that moment; later sightings of the same content do
/// not move it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contribution {
    pub listing_id: String,
    pub make: String,
    pub model: String,
    pub window: String,
    pub price: Option<i64>,
    pub mileage: Option<i64>,
}

impl Contribution {
    pub fn of(listing: &Listing) -> Self {
        Self {
            listing_id: listing.id.clone(),
            make: listing.make.clone(),
            model: listing.model.clone(),
            window: window_for(listing.last_seen),
            price: listing.price,
            mileage: listing.mileage,
        }
    }

    pub fn value(&self, metric: Metric) -> Option<i64> {
        match metric {
            Metric::Price => self.price,
            Metric::Mileage => self.mileage,
        }
    }
}

/// Fold listings into per-bucket statistics
///
/// Each listing contributes once to its make/model bucket and once to the
/// make roll-up, in the week it was last seen, for every metric it carries.
pub fn accumulate<'a, I>(listings: I) -> BTreeMap<BucketKey, MetricStats>
where
    I: IntoIterator<Item = &'a Listing>,
{
    let contributions: Vec<Contribution> = listings.into_iter().map(Contribution::of).collect();
    fold_contributions(&contributions)
}

pub fn fold_contributions<'a, I>(contributions: I) -> BTreeMap<BucketKey, MetricStats>
where
    I: IntoIterator<Item = &'a Contribution>,
{
    let mut buckets: BTreeMap<BucketKey, MetricStats> = BTreeMap::new();
    for contribution in contributions {
        let dimensions = [
            model_dimension(&contribution.make, &contribution.model),
            make_dimension(&contribution.make),
        ];
        for metric in Metric::ALL {
            let Some(value) = contribution.value(metric) else {
                continue;
            };
            for dimension in &dimensions {
                buckets
                    .entry(BucketKey::new(metric, dimension.clone(), contribution.window.clone()))
                    .or_default()
                    .observe(value);
            }
        }
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn camry(id: &str, price: i64) -> Listing {
        let seen = Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap();
        let raw = crate::domain::listing::RawListing {
            id: id.to_string(),
            title: format!("Camry {id}"),
            price: Some(price),
            mileage: None,
            year: Some(2019),
            make: Some("Toyota".to_string()),
            model: Some("Camry".to_string()),
            location: None,
            url: None,
            image_urls: vec![],
            removed: false,
        };
        Listing::from_raw(raw, seen).unwrap()
    }

    #[test]
    fn camry_week_one_example() {
        let first = [camry("a", 10_000), camry("b", 12_000), camry("c", 9_500)];
        let buckets = accumulate(&first);
        let key = BucketKey::new(Metric::Price, "toyota/camry", "2024-W01");
        let mut stats = buckets[&key];
        assert_eq!((stats.count, stats.sum, stats.min, stats.max), (3, 31_500, Some(9_500), Some(12_000)));

        let second = accumulate(&[camry("d", 11_000)]);
        stats.merge(&second[&key]);
        assert_eq!((stats.count, stats.sum, stats.min, stats.max), (4, 42_500, Some(9_500), Some(12_000)));
    }

    #[test]
    fn listings_roll_up_into_make_dimension() {
        let buckets = accumulate(&[camry("a", 10_000)]);
        assert!(buckets.contains_key(&BucketKey::new(Metric::Price, "toyota/*", "2024-W01")));
        assert!(!buckets.keys().any(|k| k.metric == Metric::Mileage));
    }

    #[test]
    fn merging_empty_stats_is_identity() {
        let stats: MetricStats = [5, 7].into_iter().collect();
        let mut merged = stats;
        merged.merge(&MetricStats::default());
        assert_eq!(merged, stats);
        assert_eq!(stats.mean(), Some(6.0));
        assert_eq!(stats.variance(), Some(1.0));
    }

    #[test]
    fn checksum_detects_tampering() {
        let key = BucketKey::new(Metric::Price, "toyota/camry", "2024-W01");
        let mut snapshot = AggregateSnapshot::new(key, [100, 200].into_iter().collect(), Some(1));
        assert!(snapshot.verify());
        snapshot.stats.sum += 1;
        assert!(!snapshot.verify());
    }

    #[test]
    fn windows_sort_chronologically_across_years() {
        let late = window_for(Utc.with_ymd_and_hms(2023, 12, 20, 0, 0, 0).unwrap());
        let early = window_for(Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap());
        assert_eq!(late, "2023-W51");
        assert!(late < early);
        assert_eq!(BucketKey::new(Metric::Price, "bmw/*", &early).make(), "bmw");
    }

    #[test]
    fn sums_saturate_instead_of_overflowing() {
        let mut stats: MetricStats = [i64::MAX - 10, 20].into_iter().collect();
        assert_eq!(stats.sum, i64::MAX);
        stats.merge(&[i64::MAX].into_iter().collect());
        assert_eq!((stats.count, stats.sum), (3, i64::MAX));
        assert_eq!(stats.max, Some(i64::MAX));
    }

    #[test]
    fn contribution_keeps_the_window_it_was_recorded_in() {
        let listing = camry("a", 10_000);
        let contribution = Contribution::of(&listing);
        assert_eq!(contribution.window, "2024-W01");
        assert_eq!(contribution.value(Metric::Price), Some(10_000));
        assert_eq!(contribution.value(Metric::Mileage), None);
        assert_eq!(fold_contributions([&contribution]), accumulate([&listing]));
    }

    #[test]
    fn dimension_labels_split_into_make_and_model() {
        let model = BucketKey::new(Metric::Price, model_dimension("toyota", "camry"), "2024-W01");
        let make = BucketKey::new(Metric::Price, make_dimension("toyota"), "2024-W01");
        assert_eq!(model.model(), Some("camry"));
        assert_eq!(make.model(), None);
    }
}
