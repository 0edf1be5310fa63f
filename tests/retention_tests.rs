//! Retention pruning and the rebuild that follows it
mod common;

use car_market_pipeline::application::RebuildScope;
use car_market_pipeline::domain::snapshot::{make_dimension, model_dimension, window_for};
use car_market_pipeline::domain::{BucketKey, Listing, Metric};
use car_market_pipeline::infrastructure::codec::now;
use chrono::{DateTime, Utc};
use common::{TestPipeline, aggregate, car, open_with, test_config};

fn listing(id: &str, make: &str, model: &str, price: i64, seen: DateTime<Utc>) -> Listing {
    Listing::from_raw(car(id, make, model, price, 10_000), seen).unwrap()
}

async fn empty(vacuum_threshold: f64) -> TestPipeline {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), 10);
    config.store.vacuum_threshold = vacuum_threshold;
    open_with(dir, config, Vec::new()).await
}

/// Two listings past retention, one fresh, all three aggregated when first seen
async fn seeded(vacuum_threshold: f64) -> (TestPipeline, DateTime<Utc>, DateTime<Utc>) {
    let t = empty(vacuum_threshold).await;
    let fresh = now();
    let old = fresh - chrono::Duration::days(200);
    aggregate(
        &t.pipeline,
        &[
            listing("old-h", "Hyundai", "Avante", 9_000, old),
            listing("old-t", "Toyota", "Camry", 8_000, old),
            listing("new-t", "Toyota", "Camry", 12_000, fresh),
        ],
    )
    .await;
    (t, old, fresh)
}

fn price(dimension: String, at: DateTime<Utc>) -> BucketKey {
    BucketKey::new(Metric::Price, dimension, window_for(at))
}

#[tokio::test]
async fn prune_alone_leaves_snapshots_untouched() {
    let (t, old, fresh) = seeded(0.0).await;
    let store = t.pipeline.store();
    let before = store.snapshot_count().await.unwrap();

    let pruned = store.prune(fresh - chrono::Duration::days(90)).await.unwrap();
    assert_eq!(pruned.removed, 2);
    assert_eq!(pruned.affected_makes.iter().map(String::as_str).collect::<Vec<_>>(), ["hyundai", "toyota"]);
    assert_eq!(store.snapshot_count().await.unwrap(), before);
    assert!(store.get("new-t").await.unwrap().is_some());

    // Snapshots only move once the affected make is rebuilt
    let old_camry = price(model_dimension("toyota", "camry"), old);
    assert!(store.read_snapshot(&old_camry).await.unwrap().is_some());
    t.pipeline
        .aggregator()
        .rebuild(RebuildScope::Make("toyota".into()))
        .await
        .unwrap();
    assert!(store.read_snapshot(&old_camry).await.unwrap().is_none());
    assert!(
        store
            .read_snapshot(&price(make_dimension("hyundai"), old))
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn maintenance_prunes_and_rebuilds_affected_makes() {
    let (t, old, fresh) = seeded(0.0).await;
    let version = t.pipeline.snapshot_version().await.unwrap();

    let report = t.pipeline.maintenance().await.unwrap();
    assert_eq!(report.listings_pruned, 2);
    assert_eq!(report.makes_rebuilt, 2);
    assert_eq!(report.makes_deferred, 0);
    assert!(!report.vacuumed);
    assert_eq!(t.pipeline.snapshot_version().await.unwrap(), version + 2);

    let store = t.pipeline.store();
    assert!(store.read_snapshot(&price(make_dimension("hyundai"), old)).await.unwrap().is_none());
    assert!(
        store
            .read_snapshot(&price(model_dimension("toyota", "camry"), old))
            .await
            .unwrap()
            .is_none()
    );
    let current = store
        .read_snapshot(&price(model_dimension("toyota", "camry"), fresh))
        .await
        .unwrap()
        .unwrap();
    assert_eq!((current.stats.count, current.stats.sum), (1, 12_000));
    assert!(t.pipeline.aggregator().pending_rebuilds().await.unwrap().is_empty());
}

#[tokio::test]
async fn maintenance_vacuums_when_the_draw_allows() {
    let (t, _, _) = seeded(1.0).await;
    let report = t.pipeline.maintenance().await.unwrap();
    assert!(report.vacuumed);
}

#[tokio::test]
async fn maintenance_skips_vacuum_outside_full_tier() {
    let (t, _, _) = seeded(1.0).await;
    t.sampler.set_cpu(70.0);
    let report = t.pipeline.maintenance().await.unwrap();
    assert!(!report.vacuumed);
    assert_eq!(report.listings_pruned, 2);
}

#[tokio::test]
async fn surviving_listings_keep_their_history_through_retention() {
    let t = empty(0.0).await;
    let fresh = now();
    let earlier = fresh - chrono::Duration::days(60);
    let expired = fresh - chrono::Duration::days(200);
    aggregate(&t.pipeline, &[listing("kept", "Toyota", "Camry", 11_000, earlier)]).await;
    aggregate(&t.pipeline, &[listing("gone", "Toyota", "Camry", 8_000, expired)]).await;

    // Re-sighted unchanged: only last_seen moves, nothing is aggregated
    t.pipeline
        .store()
        .upsert(&listing("kept", "Toyota", "Camry", 11_000, fresh))
        .await
        .unwrap();

    let report = t.pipeline.maintenance().await.unwrap();
    assert_eq!((report.listings_pruned, report.makes_rebuilt), (1, 1));

    let store = t.pipeline.store();
    let camry = |at| price(model_dimension("toyota", "camry"), at);
    let history = store.read_snapshot(&camry(earlier)).await.unwrap().unwrap();
    assert_eq!((history.stats.count, history.stats.sum), (1, 11_000));
    assert!(store.read_snapshot(&camry(fresh)).await.unwrap().is_none());
    assert!(store.read_snapshot(&camry(expired)).await.unwrap().is_none());
}

#[tokio::test]
async fn retention_rebuild_reaches_model_buckets_of_non_ascii_makes() {
    let t = empty(0.0).await;
    let fresh = now();
    let old = fresh - chrono::Duration::days(200);
    aggregate(
        &t.pipeline,
        &[
            listing("c3-old", "Citroën", "C3", 6_000, old),
            listing("c4-new", "Citroën", "C4", 9_000, fresh),
        ],
    )
    .await;
    assert_eq!(t.pipeline.makes().await.unwrap().labels, ["citroën"]);

    let report = t.pipeline.maintenance().await.unwrap();
    assert_eq!((report.listings_pruned, report.makes_rebuilt), (1, 1));

    let store = t.pipeline.store();
    assert!(store.read_snapshot(&price(model_dimension("citroën", "c3"), old)).await.unwrap().is_none());
    assert!(store.read_snapshot(&price(make_dimension("citroën"), old)).await.unwrap().is_none());
    assert_eq!(t.pipeline.models_for_make("Citroën").await.unwrap().labels, ["c4"]);
}
