//! Listing and snapshot persistence
//!
//! Listing bodies (title, location, url, images) are zstd-compressed JSON; the
//! columns used for filtering stay plain and indexed. Every mutating operation
//! has an `_in` form taking a connection so callers can compose it into one
//! transaction with the matching work-queue transition.
//!
//! Each aggregated change is also kept as a contribution row (listing, window,
//! metric values). Rebuilds fold those rows instead of the listings, so a
//! listing keeps counting in the week it changed however often it is re-sighted.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use tracing::{debug, info, warn};

use crate::domain::constants::meta_keys;
use crate::domain::errors::{PipelineError, PipelineResult};
use crate::domain::listing::{Listing, ListingBody, ListingStatus};
use crate::domain::snapshot::{AggregateSnapshot, BucketKey, Contribution, Metric, MetricStats};
use crate::domain::task::TaskId;
use crate::infrastructure::codec::{compress_json, decompress_json, from_millis, to_millis};
use crate::infrastructure::database_connection::DatabaseConnection;

const LISTING_COLUMNS: &str = "id, make, model, year, price, mileage, status, content_hash, first_seen, last_seen, body";
const CONTRIBUTION_COLUMNS: &str = "id, listing_id, make, model, time_window, price, mileage";
const SNAPSHOT_COLUMNS: &str = "metric, dimension, time_window, count, sum, sum_squares, min_value, max_value, \
     version, last_task_id, updated_at, checksum";

/// Outcome of an upsert keyed by listing id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

impl UpsertOutcome {
    /// Inserted and updated listings are forwarded to aggregation
    pub fn is_change(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Listing as it stands in the store after an upsert
#[derive(Debug, Clone, PartialEq)]
pub struct Upserted {
    pub outcome: UpsertOutcome,
    pub stored: Listing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingFilter {
    pub make: Option<String>,
    pub model: Option<String>,
    pub year_min: Option<i32>,
    pub year_max: Option<i32>,
    pub price_min: Option<i64>,
    pub price_max: Option<i64>,
    pub seen_since: Option<DateTime<Utc>>,
    pub seen_before: Option<DateTime<Utc>>,
    pub status: Option<ListingStatus>,
}

impl ListingFilter {
    pub fn make(make: impl Into<String>) -> Self {
        Self {
            make: Some(make.into()),
            ..Self::default()
        }
    }

    pub fn make_model(make: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            make: Some(make.into()),
            model: Some(model.into()),
            ..Self::default()
        }
    }
}

/// Narrows a contribution scan; `None` fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContributionFilter {
    pub make: Option<String>,
    pub model: Option<String>,
    pub window: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: u32,
    pub limit: u32,
}

impl Page {
    pub const fn first(limit: u32) -> Self {
        Self { offset: 0, limit }
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self {
            offset: self.offset + self.limit,
            limit: self.limit,
        }
    }
}

/// Listings removed by retention pruning
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneOutcome {
    pub removed: u64,
    pub contributions_removed: u64,
    /// Makes whose snapshots now include stale contributions
    pub affected_makes: BTreeSet<String>,
}

/// Snapshots of a window range, with buckets that failed verification split out
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotRange {
    pub snapshots: Vec<AggregateSnapshot>,
    pub corrupt: Vec<BucketKey>,
}

#[derive(Clone)]
pub struct ListingStore {
    db: DatabaseConnection,
    compression_level: i32,
}

impl ListingStore {
    pub fn new(db: DatabaseConnection, compression_level: i32) -> Self {
        Self { db, compression_level }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn compression_level(&self) -> i32 {
        self.compression_level
    }

    pub async fn upsert(&self, listing: &Listing) -> PipelineResult<Upserted> {
        let mut tx = self.db.begin_write().await?;
        let result = upsert_in(tx.conn(), listing, self.compression_level).await?;
        tx.commit().await?;
        Ok(result)
    }

    pub async fn get(&self, id: &str) -> PipelineResult<Option<Listing>> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(self.db.pool()).await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    /// Newest sightings first; the sequence is not stable across concurrent writes
    pub async fn query(&self, filter: &ListingFilter, page: Page) -> PipelineResult<Vec<Listing>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {LISTING_COLUMNS} FROM listings"));
        push_filter(&mut builder, filter);
        builder.push(" ORDER BY last_seen DESC, id ASC LIMIT ");
        builder.push_bind(i64::from(page.limit));
        builder.push(" OFFSET ");
        builder.push_bind(i64::from(page.offset));

        let rows = builder.build().fetch_all(self.db.pool()).await?;
        rows.iter().map(listing_from_row).collect()
    }

    pub async fn count(&self, filter: &ListingFilter) -> PipelineResult<u64> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM listings");
        push_filter(&mut builder, filter);
        let n: i64 = builder.build_query_scalar().fetch_one(self.db.pool()).await?;
        Ok(n as u64)
    }

    /// Delete listings last seen before `older_than`
    ///
    /// Snapshots are left alone; the caller rebuilds the affected makes.
    pub async fn prune(&self, older_than: DateTime<Utc>) -> PipelineResult<PruneOutcome> {
        let cutoff = to_millis(older_than);
        let mut tx = self.db.begin_write().await?;
        let contributions = sqlx::query(
            "DELETE FROM contributions WHERE listing_id IN (SELECT id FROM listings WHERE last_seen < ?)",
        )
        .bind(cutoff)
        .execute(tx.conn())
        .await?;
        let makes: Vec<String> = sqlx::query_scalar("DELETE FROM listings WHERE last_seen < ? RETURNING make")
            .bind(cutoff)
            .fetch_all(tx.conn())
            .await?;
        tx.commit().await?;

        let outcome = PruneOutcome {
            removed: makes.len() as u64,
            contributions_removed: contributions.rows_affected(),
            affected_makes: makes.into_iter().collect(),
        };
        if outcome.removed > 0 {
            info!(
                "Pruned {} listing(s) last seen before {} across {} make(s)",
                outcome.removed,
                older_than,
                outcome.affected_makes.len()
            );
        }
        Ok(outcome)
    }

    pub async fn read_snapshot(&self, key: &BucketKey) -> PipelineResult<Option<AggregateSnapshot>> {
        let mut conn = self.db.pool().acquire().await?;
        read_snapshot_in(&mut conn, key).await
    }

    pub async fn write_snapshot(&self, snapshot: &AggregateSnapshot) -> PipelineResult<AggregateSnapshot> {
        let mut tx = self.db.begin_write().await?;
        let written = write_snapshot_in(tx.conn(), snapshot).await?;
        tx.commit().await?;
        Ok(written)
    }

    /// Snapshots of one metric and dimension for windows in `[from, to]`
    pub async fn snapshots_in_range(&self, metric: Metric, dimension: &str, from: &str, to: &str) -> PipelineResult<SnapshotRange> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM snapshots
             WHERE metric = ? AND dimension = ? AND time_window >= ? AND time_window <= ?
             ORDER BY time_window"
        );
        let rows = sqlx::query(&sql)
            .bind(metric.as_str())
            .bind(dimension)
            .bind(from)
            .bind(to)
            .fetch_all(self.db.pool())
            .await?;

        verified_range(&rows)
    }

    /// Snapshots of every metric and dimension for windows in `[from, to]`
    pub async fn snapshots_in_windows(&self, from: &str, to: &str) -> PipelineResult<SnapshotRange> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM snapshots
             WHERE time_window >= ? AND time_window <= ?
             ORDER BY dimension, time_window, metric"
        );
        let rows = sqlx::query(&sql).bind(from).bind(to).fetch_all(self.db.pool()).await?;
        verified_range(&rows)
    }

    /// Distinct dimension labels with at least one snapshot, in label order
    pub async fn dimensions(&self) -> PipelineResult<Vec<String>> {
        let dimensions: Vec<String> = sqlx::query_scalar("SELECT DISTINCT dimension FROM snapshots ORDER BY dimension")
            .fetch_all(self.db.pool())
            .await?;
        Ok(dimensions)
    }

    /// Distinct dimension labels of one make, the roll-up included
    pub async fn dimensions_for_make(&self, make: &str) -> PipelineResult<Vec<String>> {
        let (low, high) = make_range(make);
        let dimensions: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT dimension FROM snapshots WHERE dimension >= ? AND dimension < ? ORDER BY dimension",
        )
        .bind(low)
        .bind(high)
        .fetch_all(self.db.pool())
        .await?;
        Ok(dimensions)
    }

    /// Oldest and newest model year among stored listings matching `filter`
    pub async fn year_range(&self, filter: &ListingFilter) -> PipelineResult<Option<(i32, i32)>> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT MIN(year), MAX(year) FROM listings");
        let has_where = push_filter(&mut builder, filter);
        builder.push(if has_where { " AND " } else { " WHERE " });
        builder.push("year IS NOT NULL");

        let (min, max): (Option<i32>, Option<i32>) = builder.build_query_as().fetch_one(self.db.pool()).await?;
        Ok(min.zip(max))
    }

    /// Keyset scan of contributions whose listing is still stored, in id order
    pub async fn scan_contributions(
        &self,
        filter: &ContributionFilter,
        after_id: Option<i64>,
        limit: usize,
    ) -> PipelineResult<Vec<(i64, Contribution)>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {CONTRIBUTION_COLUMNS} FROM contributions c
             WHERE EXISTS (SELECT 1 FROM listings l WHERE l.id = c.listing_id)"
        ));
        if let Some(make) = &filter.make {
            builder.push(" AND make = ");
            builder.push_bind(make.clone());
        }
        if let Some(model) = &filter.model {
            builder.push(" AND model = ");
            builder.push_bind(model.clone());
        }
        if let Some(window) = &filter.window {
            builder.push(" AND time_window = ");
            builder.push_bind(window.clone());
        }
        if let Some(after) = after_id {
            builder.push(" AND id > ");
            builder.push_bind(after);
        }
        builder.push(" ORDER BY id ASC LIMIT ");
        builder.push_bind(limit as i64);

        let rows = builder.build().fetch_all(self.db.pool()).await?;
        rows.iter()
            .map(|row| -> PipelineResult<(i64, Contribution)> { Ok((row.try_get("id")?, contribution_from_row(row)?)) })
            .collect()
    }

    pub async fn contribution_count(&self) -> PipelineResult<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM contributions")
            .fetch_one(self.db.pool())
            .await?;
        Ok(n as u64)
    }

    /// Keys of every stored snapshot whose dimension belongs to `make`
    pub async fn snapshot_keys_for_make(&self, make: &str) -> PipelineResult<Vec<BucketKey>> {
        let (low, high) = make_range(make);
        let rows = sqlx::query("SELECT metric, dimension, time_window FROM snapshots WHERE dimension >= ? AND dimension < ?")
            .bind(low)
            .bind(high)
            .fetch_all(self.db.pool())
            .await?;
        rows.iter().map(key_from_row).collect()
    }

    pub async fn snapshot_keys(&self) -> PipelineResult<Vec<BucketKey>> {
        let rows = sqlx::query("SELECT metric, dimension, time_window FROM snapshots")
            .fetch_all(self.db.pool())
            .await?;
        rows.iter().map(key_from_row).collect()
    }

    pub async fn snapshot_count(&self) -> PipelineResult<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM snapshots")
            .fetch_one(self.db.pool())
            .await?;
        Ok(n as u64)
    }

    pub async fn get_meta(&self, key: &str) -> PipelineResult<Option<String>> {
        let mut conn = self.db.pool().acquire().await?;
        get_meta_in(&mut conn, key).await
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> PipelineResult<()> {
        let mut tx = self.db.begin_write().await?;
        set_meta_in(tx.conn(), key, value).await?;
        tx.commit().await
    }

    pub async fn get_meta_time(&self, key: &str) -> PipelineResult<Option<DateTime<Utc>>> {
        self.get_meta(key)
            .await?
            .map(|v| parse_meta_millis(key, &v))
            .transpose()
    }

    /// Global version Display uses to detect stale results
    pub async fn snapshot_version(&self) -> PipelineResult<i64> {
        let value = self.get_meta(meta_keys::SNAPSHOT_VERSION).await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }
}

pub async fn upsert_in(conn: &mut SqliteConnection, listing: &Listing, compression_level: i32) -> PipelineResult<Upserted> {
    if listing.last_seen < listing.first_seen {
        return Err(PipelineError::InvalidRecord(format!(
            "listing {} last seen before first seen",
            listing.id
        )));
    }

    let existing = sqlx::query("SELECT content_hash, first_seen, last_seen, price, status FROM listings WHERE id = ?")
        .bind(&listing.id)
        .fetch_optional(&mut *conn)
        .await?;

    let Some(existing) = existing else {
        insert_listing(conn, listing, compression_level).await?;
        debug!(listing_id = %listing.id, "Inserted listing");
        return Ok(Upserted {
            outcome: UpsertOutcome::Inserted,
            stored: listing.clone(),
        });
    };

    let stored_hash: String = existing.try_get("content_hash")?;
    let first_seen = from_millis(existing.try_get("first_seen")?)?;
    let last_seen = from_millis(existing.try_get("last_seen")?)?.max(listing.last_seen);
    let stored_price: Option<i64> = existing.try_get("price")?;
    let stored_status: String = existing.try_get("status")?;

    if stored_hash == listing.content_hash {
        sqlx::query("UPDATE listings SET last_seen = ? WHERE id = ?")
            .bind(to_millis(last_seen))
            .bind(&listing.id)
            .execute(&mut *conn)
            .await?;

        let mut stored = listing.clone();
        stored.first_seen = first_seen;
        stored.last_seen = last_seen;
        stored.status = ListingStatus::parse(&stored_status)?;
        return Ok(Upserted {
            outcome: UpsertOutcome::Unchanged,
            stored,
        });
    }

    let mut stored = listing.clone();
    stored.first_seen = first_seen.min(listing.first_seen);
    stored.last_seen = last_seen;
    stored.status = if listing.is_removed() {
        ListingStatus::Removed
    } else if stored_price != listing.price {
        ListingStatus::PriceChanged
    } else {
        ListingStatus::Active
    };

    let body = compress_json(&stored.body(), compression_level)?;
    sqlx::query(
        "UPDATE listings SET make = ?, model = ?, year = ?, price = ?, mileage = ?, status = ?,
             content_hash = ?, first_seen = ?, last_seen = ?, body = ?
         WHERE id = ?",
    )
    .bind(&stored.make)
    .bind(&stored.model)
    .bind(stored.year)
    .bind(stored.price)
    .bind(stored.mileage)
    .bind(stored.status.as_str())
    .bind(&stored.content_hash)
    .bind(to_millis(stored.first_seen))
    .bind(to_millis(stored.last_seen))
    .bind(body)
    .bind(&stored.id)
    .execute(&mut *conn)
    .await?;

    debug!(listing_id = %stored.id, status = stored.status.as_str(), "Updated listing");
    Ok(Upserted {
        outcome: UpsertOutcome::Updated,
        stored,
    })
}

async fn insert_listing(conn: &mut SqliteConnection, listing: &Listing, compression_level: i32) -> PipelineResult<()> {
    let body = compress_json(&listing.body(), compression_level)?;
    sqlx::query(
        "INSERT INTO listings (id, make, model, year, price, mileage, status, content_hash, first_seen, last_seen, body)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&listing.id)
    .bind(&listing.make)
    .bind(&listing.model)
    .bind(listing.year)
    .bind(listing.price)
    .bind(listing.mileage)
    .bind(listing.status.as_str())
    .bind(&listing.content_hash)
    .bind(to_millis(listing.first_seen))
    .bind(to_millis(listing.last_seen))
    .bind(body)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Record the contributions of one aggregate task
pub async fn record_contributions_in(
    conn: &mut SqliteConnection,
    task_id: TaskId,
    contributions: &[Contribution],
    at: DateTime<Utc>,
) -> PipelineResult<()> {
    for contribution in contributions {
        sqlx::query(
            "INSERT INTO contributions (listing_id, task_id, make, model, time_window, price, mileage, recorded_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&contribution.listing_id)
        .bind(task_id)
        .bind(&contribution.make)
        .bind(&contribution.model)
        .bind(&contribution.window)
        .bind(contribution.price)
        .bind(contribution.mileage)
        .bind(to_millis(at))
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Read one bucket, failing with `CorruptSnapshot` when its checksum does not match
pub async fn read_snapshot_in(conn: &mut SqliteConnection, key: &BucketKey) -> PipelineResult<Option<AggregateSnapshot>> {
    let sql = format!("SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE metric = ? AND dimension = ? AND time_window = ?");
    let row = sqlx::query(&sql)
        .bind(key.metric.as_str())
        .bind(&key.dimension)
        .bind(&key.window)
        .fetch_optional(&mut *conn)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let snapshot = snapshot_from_row(&row)?;
    if !snapshot.verify() {
        return Err(PipelineError::CorruptSnapshot(key.clone()));
    }
    Ok(Some(snapshot))
}

/// Persist `snapshot` as the next version of its bucket and return what was stored
pub async fn write_snapshot_in(conn: &mut SqliteConnection, snapshot: &AggregateSnapshot) -> PipelineResult<AggregateSnapshot> {
    let previous: Option<i64> =
        sqlx::query_scalar("SELECT version FROM snapshots WHERE metric = ? AND dimension = ? AND time_window = ?")
            .bind(snapshot.key.metric.as_str())
            .bind(&snapshot.key.dimension)
            .bind(&snapshot.key.window)
            .fetch_optional(&mut *conn)
            .await?;

    let mut written = snapshot.clone();
    written.version = previous.unwrap_or(0).max(snapshot.version) + 1;
    written.updated_at = crate::infrastructure::codec::now();
    written.seal();

    let stats = &written.stats;
    sqlx::query(
        "INSERT INTO snapshots (metric, dimension, time_window, count, sum, sum_squares, min_value, max_value,
                                version, last_task_id, updated_at, checksum)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (metric, dimension, time_window) DO UPDATE SET
             count = excluded.count,
             sum = excluded.sum,
             sum_squares = excluded.sum_squares,
             min_value = excluded.min_value,
             max_value = excluded.max_value,
             version = excluded.version,
             last_task_id = excluded.last_task_id,
             updated_at = excluded.updated_at,
             checksum = excluded.checksum",
    )
    .bind(written.key.metric.as_str())
    .bind(&written.key.dimension)
    .bind(&written.key.window)
    .bind(stats.count as i64)
    .bind(stats.sum)
    .bind(stats.sum_squares)
    .bind(stats.min)
    .bind(stats.max)
    .bind(written.version)
    .bind(written.last_task_id)
    .bind(to_millis(written.updated_at))
    .bind(&written.checksum)
    .execute(&mut *conn)
    .await?;

    Ok(written)
}

pub async fn delete_snapshot_in(conn: &mut SqliteConnection, key: &BucketKey) -> PipelineResult<bool> {
    let result = sqlx::query("DELETE FROM snapshots WHERE metric = ? AND dimension = ? AND time_window = ?")
        .bind(key.metric.as_str())
        .bind(&key.dimension)
        .bind(&key.window)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get_meta_in(conn: &mut SqliteConnection, key: &str) -> PipelineResult<Option<String>> {
    let value = sqlx::query_scalar("SELECT value FROM pipeline_meta WHERE key = ?")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(value)
}

pub async fn set_meta_in(conn: &mut SqliteConnection, key: &str, value: &str) -> PipelineResult<()> {
    sqlx::query(
        "INSERT INTO pipeline_meta (key, value) VALUES (?, ?)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn set_meta_time_in(conn: &mut SqliteConnection, key: &str, at: DateTime<Utc>) -> PipelineResult<()> {
    set_meta_in(conn, key, &to_millis(at).to_string()).await
}

/// Advance the global snapshot version and stamp the last snapshot time
pub async fn bump_snapshot_version_in(conn: &mut SqliteConnection, at: DateTime<Utc>) -> PipelineResult<i64> {
    let current = get_meta_in(conn, meta_keys::SNAPSHOT_VERSION)
        .await?
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0);
    let next = current + 1;
    set_meta_in(conn, meta_keys::SNAPSHOT_VERSION, &next.to_string()).await?;
    set_meta_time_in(conn, meta_keys::LAST_SNAPSHOT_AT, at).await?;
    Ok(next)
}

/// Half-open label range holding `make/*` and every `make/<model>`
///
/// `/` is immediately followed by `0` in byte order, and SQLite compares text
/// bytewise, so the range holds for any UTF-8 make label.
fn make_range(make: &str) -> (String, String) {
    (format!("{make}/"), format!("{make}0"))
}

fn verified_range(rows: &[SqliteRow]) -> PipelineResult<SnapshotRange> {
    let mut range = SnapshotRange::default();
    for row in rows {
        let snapshot = snapshot_from_row(row)?;
        if snapshot.verify() {
            range.snapshots.push(snapshot);
        } else {
            warn!(bucket = %snapshot.key, "Snapshot failed checksum verification");
            range.corrupt.push(snapshot.key);
        }
    }
    Ok(range)
}

fn parse_meta_millis(key: &str, value: &str) -> PipelineResult<DateTime<Utc>> {
    let millis = value
        .parse::<i64>()
        .map_err(|e| PipelineError::Serialization(format!("meta '{key}' is not a timestamp: {e}")))?;
    from_millis(millis)
}

/// Returns whether a WHERE clause was opened
fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &ListingFilter) -> bool {
    let mut has_where = false;
    let mut clause = |builder: &mut QueryBuilder<'_, Sqlite>, sql: &str| {
        builder.push(if has_where { " AND " } else { " WHERE " });
        builder.push(sql);
        has_where = true;
    };

    if let Some(make) = &filter.make {
        clause(builder, "make = ");
        builder.push_bind(make.clone());
    }
    if let Some(model) = &filter.model {
        clause(builder, "model = ");
        builder.push_bind(model.clone());
    }
    if let Some(year) = filter.year_min {
        clause(builder, "year >= ");
        builder.push_bind(year);
    }
    if let Some(year) = filter.year_max {
        clause(builder, "year <= ");
        builder.push_bind(year);
    }
    if let Some(price) = filter.price_min {
        clause(builder, "price >= ");
        builder.push_bind(price);
    }
    if let Some(price) = filter.price_max {
        clause(builder, "price <= ");
        builder.push_bind(price);
    }
    if let Some(since) = filter.seen_since {
        clause(builder, "last_seen >= ");
        builder.push_bind(to_millis(since));
    }
    if let Some(before) = filter.seen_before {
        clause(builder, "last_seen < ");
        builder.push_bind(to_millis(before));
    }
    if let Some(status) = filter.status {
        clause(builder, "status = ");
        builder.push_bind(status.as_str());
    }
    has_where
}

fn listing_from_row(row: &SqliteRow) -> PipelineResult<Listing> {
    let body_blob: Vec<u8> = row.try_get("body")?;
    let body: ListingBody = decompress_json(&body_blob)?;
    let status: String = row.try_get("status")?;

    Ok(Listing {
        id: row.try_get("id")?,
        title: body.title,
        price: row.try_get("price")?,
        mileage: row.try_get("mileage")?,
        year: row.try_get("year")?,
        make: row.try_get("make")?,
        model: row.try_get("model")?,
        location: body.location,
        url: body.url,
        image_urls: body.image_urls,
        first_seen: from_millis(row.try_get("first_seen")?)?,
        last_seen: from_millis(row.try_get("last_seen")?)?,
        status: ListingStatus::parse(&status)?,
        content_hash: row.try_get("content_hash")?,
    })
}

fn contribution_from_row(row: &SqliteRow) -> PipelineResult<Contribution> {
    Ok(Contribution {
        listing_id: row.try_get("listing_id")?,
        make: row.try_get("make")?,
        model: row.try_get("model")?,
        window: row.try_get("time_window")?,
        price: row.try_get("price")?,
        mileage: row.try_get("mileage")?,
    })
}

fn key_from_row(row: &SqliteRow) -> PipelineResult<BucketKey> {
    let metric: String = row.try_get("metric")?;
    Ok(BucketKey {
        metric: Metric::parse(&metric)?,
        dimension: row.try_get("dimension")?,
        window: row.try_get("time_window")?,
    })
}

fn snapshot_from_row(row: &SqliteRow) -> PipelineResult<AggregateSnapshot> {
    let count: i64 = row.try_get("count")?;
    Ok(AggregateSnapshot {
        key: key_from_row(row)?,
        stats: MetricStats {
            count: count as u64,
            sum: row.try_get("sum")?,
            sum_squares: row.try_get("sum_squares")?,
            min: row.try_get("min_value")?,
            max: row.try_get("max_value")?,
        },
        version: row.try_get("version")?,
        last_task_id: row.try_get("last_task_id")?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
        checksum: row.try_get("checksum")?,
    })
}
