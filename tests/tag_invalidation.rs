//! Tag-based invalidation through the public surface.

use std::sync::Arc;
use std::time::Duration;

use strata_cache::{
    CacheError, EntryOptions, InMemoryRemoteStore, ManualClock, StrataCache, WILDCARD_TAG,
};

fn cache_with_clock(clock: Arc<ManualClock>) -> StrataCache {
    StrataCache::builder().clock(clock).build()
}

async fn get_counted(cache: &StrataCache, key: &str, tags: &[&str], next: u64) -> u64 {
    cache
        .get_or_create_with(
            key,
            move |_cancel| async move { Ok(next) },
            tags.iter().copied(),
            &EntryOptions::default(),
            None,
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn invalidating_a_tag_evicts_matching_entries() {
    let clock = Arc::new(ManualClock::new(1_000));
    let cache = cache_with_clock(Arc::clone(&clock));

    assert_eq!(get_counted(&cache, "k", &["session"], 1).await, 1);
    assert_eq!(get_counted(&cache, "k", &["session"], 2).await, 1);

    clock.advance_ms(10);
    cache.remove_by_tag("session").unwrap();
    clock.advance_ms(10);

    // Stale entry is gone; the factory repopulates.
    assert_eq!(get_counted(&cache, "k", &["session"], 3).await, 3);
    // The repopulated entry postdates the invalidation and sticks.
    assert_eq!(get_counted(&cache, "k", &["session"], 4).await, 3);
}

#[tokio::test]
async fn unrelated_tags_are_untouched() {
    let clock = Arc::new(ManualClock::new(1_000));
    let cache = cache_with_clock(Arc::clone(&clock));

    assert_eq!(get_counted(&cache, "a", &["users"], 1).await, 1);
    assert_eq!(get_counted(&cache, "b", &["orders"], 2).await, 2);

    clock.advance_ms(10);
    cache.remove_by_tag("users").unwrap();
    clock.advance_ms(10);

    assert_eq!(get_counted(&cache, "a", &["users"], 3).await, 3);
    assert_eq!(get_counted(&cache, "b", &["orders"], 4).await, 2);
}

#[tokio::test]
async fn one_stale_tag_is_enough() {
    let clock = Arc::new(ManualClock::new(1_000));
    let cache = cache_with_clock(Arc::clone(&clock));

    assert_eq!(get_counted(&cache, "k", &["a", "b", "c"], 1).await, 1);
    clock.advance_ms(10);
    cache.remove_by_tag("b").unwrap();
    clock.advance_ms(10);
    assert_eq!(get_counted(&cache, "k", &["a", "b", "c"], 2).await, 2);
}

#[tokio::test]
async fn the_wildcard_invalidates_untagged_entries_too() {
    let clock = Arc::new(ManualClock::new(1_000));
    let cache = cache_with_clock(Arc::clone(&clock));

    assert_eq!(get_counted(&cache, "plain", &[], 1).await, 1);
    assert_eq!(get_counted(&cache, "tagged", &["t"], 2).await, 2);

    clock.advance_ms(10);
    cache.remove_by_tag(WILDCARD_TAG).unwrap();
    clock.advance_ms(10);

    assert_eq!(get_counted(&cache, "plain", &[], 3).await, 3);
    assert_eq!(get_counted(&cache, "tagged", &["t"], 4).await, 4);
}

#[tokio::test]
async fn entries_created_at_the_invalidation_instant_are_stale() {
    let clock = Arc::new(ManualClock::new(1_000));
    let cache = cache_with_clock(Arc::clone(&clock));

    assert_eq!(get_counted(&cache, "k", &["t"], 1).await, 1);
    // Same tick as creation: ties go to the invalidation.
    cache.remove_by_tag("t").unwrap();
    assert_eq!(get_counted(&cache, "k", &["t"], 2).await, 2);
}

#[tokio::test]
async fn wildcard_cannot_be_attached_to_an_entry() {
    let cache = cache_with_clock(Arc::new(ManualClock::new(1_000)));
    let err = cache
        .get_or_create_with(
            "k",
            |_cancel| async { Ok(1u64) },
            [WILDCARD_TAG],
            &EntryOptions::default(),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::InvalidTag(_)));
}

#[tokio::test]
async fn a_remote_invalidation_is_never_served_past() {
    // Instance A writes a tagged entry through a shared distributed tier;
    // instance B invalidates the tag. A fresh instance C must not serve A's
    // entry: either the stamp has propagated (provably stale) or it is still
    // resolving (fail closed). Both paths run the factory.
    let remote = Arc::new(InMemoryRemoteStore::new());
    let clock = Arc::new(ManualClock::new(1_000));

    let a = StrataCache::builder()
        .clock(clock.clone())
        .remote_store(remote.clone())
        .build();
    a.set_with("k", 1u64, ["promo"], &EntryOptions::default())
        .await
        .unwrap();

    clock.advance_ms(10);
    let b = StrataCache::builder()
        .clock(clock.clone())
        .remote_store(remote.clone())
        .build();
    b.remove_by_tag("promo").unwrap();
    // The stamp write is asynchronous.
    tokio::time::sleep(Duration::from_millis(50)).await;

    clock.advance_ms(10);
    let c = StrataCache::builder()
        .clock(clock.clone())
        .remote_store(remote.clone())
        .build();
    let value: u64 = c
        .get_or_create_with(
            "k",
            |_cancel| async { Ok(99) },
            ["promo"],
            &EntryOptions::default(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(value, 99);
}
