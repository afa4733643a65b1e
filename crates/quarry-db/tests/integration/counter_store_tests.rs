use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use quarry_core::rate_limit::{
    CounterStore, ProviderLimits, RateLimitConfig, RateLimiter, ScopeKey, WindowLimit,
    WindowLimits,
};
use quarry_core::{AppError, ManualClock};

use crate::common::setup_test_db;

fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .unwrap()
        .with_timezone(&Utc)
}

fn limits(per_minute: u32, per_day: u32) -> WindowLimits {
    WindowLimits::new(
        WindowLimit::per_minute(per_minute),
        WindowLimit::per_day(per_day),
    )
}

#[tokio::test]
async fn acquire_enforces_ceiling_and_rolls_over() {
    let (db, _container) = setup_test_db().await;
    let store = db.counter_store();
    let scope = vec![(ScopeKey::provider("adzuna"), limits(2, 100))];
    let now = at("2024-06-01T12:00:10Z");

    assert!(store.try_acquire(&scope, now).await.unwrap());
    assert!(store.try_acquire(&scope, now).await.unwrap());
    assert!(!store.try_acquire(&scope, now).await.unwrap());

    let usage = store.usage(&scope[0].0, &scope[0].1, now).await.unwrap();
    assert_eq!((usage.short_count, usage.long_count), (2, 2));

    let next_minute = at("2024-06-01T12:01:00Z");
    assert!(store.try_acquire(&scope, next_minute).await.unwrap());
    let usage = store.usage(&scope[0].0, &scope[0].1, next_minute).await.unwrap();
    assert_eq!((usage.short_count, usage.long_count), (1, 3));
}

#[tokio::test]
async fn rejection_changes_nothing() {
    let (db, _container) = setup_test_db().await;
    let store = db.counter_store();
    let now = at("2024-06-01T12:00:00Z");
    let provider = (ScopeKey::provider("adzuna"), limits(10, 100));
    let user = (ScopeKey::user("adzuna", "u-1"), limits(1, 100));

    store.increment(&user.0, &user.1, now).await.unwrap();
    assert!(
        !store
            .try_acquire(&[provider.clone(), user.clone()], now)
            .await
            .unwrap()
    );

    let usage = store.usage(&provider.0, &provider.1, now).await.unwrap();
    assert_eq!(usage.short_count, 0, "provider scope must not be charged");
}

#[tokio::test]
async fn concurrent_acquirers_never_exceed_ceiling() {
    let (db, _container) = setup_test_db().await;
    let store = db.counter_store();
    let now = at("2024-06-01T12:00:00Z");
    let scope = Arc::new(vec![(ScopeKey::provider("remoteok"), limits(7, 100))]);

    let handles: Vec<_> = (0..30)
        .map(|_| {
            let store = store.clone();
            let scope = scope.clone();
            tokio::spawn(async move { store.try_acquire(&scope, now).await.unwrap() })
        })
        .collect();

    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 7);
}

#[tokio::test]
async fn limiter_over_shared_store() {
    let (db, _container) = setup_test_db().await;
    let clock = Arc::new(ManualClock::new(at("2024-06-01T12:00:30Z")));
    let config = RateLimitConfig::new(ProviderLimits::new(limits(1, 100)));

    // Two limiters standing in for two processes.
    let a = RateLimiter::with_store(Arc::new(db.counter_store()), config.clone())
        .with_clock(clock.clone());
    let b = RateLimiter::with_store(Arc::new(db.counter_store()), config).with_clock(clock.clone());

    a.acquire("indeed", None).await.unwrap();
    match b.acquire("indeed", None).await.unwrap_err() {
        AppError::RateLimitExceeded { scope, retry_after } => {
            assert_eq!(scope, "indeed");
            assert_eq!(retry_after.as_secs(), 30);
        }
        other => panic!("expected RateLimitExceeded, got {other:?}"),
    }

    clock.advance(std::time::Duration::from_secs(30));
    assert!(b.try_acquire("indeed", None).await.unwrap());
}

#[tokio::test]
async fn purge_removes_idle_counters() {
    let (db, _container) = setup_test_db().await;
    let store = db.counter_store();
    let now = at("2024-06-01T12:00:00Z");
    store
        .increment(&ScopeKey::provider("usajobs"), &limits(5, 5), now)
        .await
        .unwrap();

    assert_eq!(store.purge_stale(Utc::now() - TimeDelta::hours(1)).await.unwrap(), 0);
    assert_eq!(store.purge_stale(Utc::now() + TimeDelta::hours(1)).await.unwrap(), 1);
}

#[tokio::test]
async fn long_user_ids_fit_the_scope_column() {
    let (db, _container) = setup_test_db().await;
    let store = db.counter_store();
    let now = at("2024-06-01T12:00:00Z");
    let user = (ScopeKey::user("adzuna", &"u".repeat(1_000)), limits(1, 100));

    assert!(store.try_acquire(&[user.clone()], now).await.unwrap());
    assert!(!store.try_acquire(&[user.clone()], now).await.unwrap());
    let usage = store.usage(&user.0, &user.1, now).await.unwrap();
    assert_eq!(usage.short_count, 1);
}
