//! Request coalescing across concurrent callers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strata_cache::{
    CacheError, CancellationToken, EntryFlags, EntryOptions, ManualClock, StrataCache,
};

fn local_only_cache() -> StrataCache {
    StrataCache::builder()
        .clock(Arc::new(ManualClock::new(1_000)))
        .build()
}

#[tokio::test]
async fn an_uncontended_call_completes_immediately() {
    // The common case: one caller, no coalescing. Must resolve promptly
    // rather than waiting on peers that will never come.
    let cache = local_only_cache();
    let value: u64 = tokio::time::timeout(
        Duration::from_secs(2),
        cache.get_or_create("solo", |_cancel| async { Ok(42u64) }),
    )
    .await
    .expect("uncontended lookup must not stall")
    .unwrap();
    assert_eq!(value, 42);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropping_the_first_caller_leaves_joiners_unharmed() {
    // The population outlives the caller that started it: aborting that
    // caller's task must not cancel the work other joiners are waiting on.
    let cache = local_only_cache();
    let started = Arc::new(tokio::sync::Notify::new());
    let release = Arc::new(tokio::sync::Notify::new());

    let first = {
        let cache = cache.clone();
        let started = Arc::clone(&started);
        let release = Arc::clone(&release);
        tokio::spawn(async move {
            cache
                .get_or_create("slow", move |_cancel| async move {
                    started.notify_one();
                    release.notified().await;
                    Ok(31u64)
                })
                .await
        })
    };
    started.notified().await;

    let joiner = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get_or_create("slow", |_cancel| async { Ok(0u64) }).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    first.abort();
    release.notify_one();
    assert_eq!(joiner.await.unwrap().unwrap(), 31);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_factory_invocation() {
    let cache = local_only_cache();
    let calls = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let cache = cache.clone();
        let calls = Arc::clone(&calls);
        handles.push(tokio::spawn(async move {
            cache
                .get_or_create("hot", move |_cancel| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(1234u64)
                })
                .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 1234);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_keys_do_not_coalesce() {
    let cache = local_only_cache();
    let calls = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for i in 0..4 {
        let cache = cache.clone();
        let calls = Arc::clone(&calls);
        handles.push(tokio::spawn(async move {
            cache
                .get_or_create(&format!("key-{}", i), move |_cancel| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(i)
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn different_flags_populate_separately() {
    let cache = local_only_cache();
    let calls = Arc::new(AtomicU32::new(0));

    let counted = |calls: &Arc<AtomicU32>| {
        let calls = Arc::clone(calls);
        move |_cancel: CancellationToken| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(1u64)
        }
    };

    let _: u64 = cache.get_or_create("k", counted(&calls)).await.unwrap();
    // A caller bypassing the in-process tier cannot share the cached entry
    // and runs its own population.
    let options = EntryOptions::with_flags(EntryFlags::DISABLE_LOCAL_CACHE);
    let _: u64 = cache
        .get_or_create_with("k", counted(&calls), Vec::<&str>::new(), &options, None)
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn a_failed_population_does_not_poison_the_key() {
    let cache = local_only_cache();
    let err = cache
        .get_or_create::<u64, _, _>("k", |_cancel| async {
            Err(CacheError::storage("backend down"))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::StorageError(_)));

    let value: u64 = cache.get_or_create("k", |_cancel| async { Ok(8) }).await.unwrap();
    assert_eq!(value, 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_one_joiner_leaves_the_population_running() {
    let cache = local_only_cache();
    let release = Arc::new(tokio::sync::Notify::new());

    let creator = {
        let cache = cache.clone();
        let release = Arc::clone(&release);
        tokio::spawn(async move {
            cache
                .get_or_create("slow", move |_cancel| async move {
                    release.notified().await;
                    Ok(77u64)
                })
                .await
        })
    };
    // Let the creator take ownership of the population.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(cache.in_flight(), 1);

    let token = CancellationToken::new();
    token.cancel();
    let err = cache
        .get_or_create_with::<u64, _, _, _, &str>(
            "slow",
            |_cancel| async { Ok(0) },
            Vec::new(),
            &EntryOptions::default(),
            Some(&token),
        )
        .await
        .unwrap_err();
    assert_eq!(err, CacheError::OperationCancelled);

    release.notify_one();
    assert_eq!(creator.await.unwrap().unwrap(), 77);
}
