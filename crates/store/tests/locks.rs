#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keel_store::ReleaseLocks;

#[tokio::test]
async fn same_release_is_exclusive() {
    let locks = Arc::new(ReleaseLocks::new(4));
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let (locks, inside, peak) = (locks.clone(), inside.clone(), peak.clone());
        tasks.push(tokio::spawn(async move {
            let guard = locks.acquire("ns/web").await.unwrap();
            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            inside.fetch_sub(1, Ordering::SeqCst);
            locks.release(guard);
        }));
    }
    for t in tasks { t.await.unwrap(); }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(locks.len(), 1);
}

#[tokio::test]
async fn distinct_releases_run_in_parallel() {
    let locks = ReleaseLocks::new(4);
    let a = locks.acquire("ns/a").await.unwrap();
    // Would hang if keys shared a lock.
    let b = tokio::time::timeout(Duration::from_secs(1), locks.acquire("ns/b")).await.expect("b blocked").unwrap();
    assert_eq!(a.key(), "ns/a");
    assert_eq!(b.key(), "ns/b");
    assert_eq!(locks.available_permits(), 2);
}

#[tokio::test]
async fn limiter_bounds_total_concurrency() {
    let locks = Arc::new(ReleaseLocks::new(2));
    let _a = locks.acquire("ns/a").await.unwrap();
    let _b = locks.acquire("ns/b").await.unwrap();

    let waiter = {
        let locks = locks.clone();
        tokio::spawn(async move { locks.acquire("ns/c").await.map(|g| g.key().to_string()) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    drop(_a);
    let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.expect("c never admitted").unwrap();
    assert_eq!(got.unwrap(), "ns/c");
}

#[tokio::test]
async fn release_lock_does_not_hold_a_global_slot_while_waiting() {
    let locks = Arc::new(ReleaseLocks::new(1));
    let held = locks.acquire("ns/a").await.unwrap();

    // Queued behind ns/a; must not consume the single permit.
    let queued = {
        let locks = locks.clone();
        tokio::spawn(async move { locks.acquire("ns/a").await.is_ok() })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(locks.available_permits(), 0);
    locks.release(held);

    assert!(tokio::time::timeout(Duration::from_secs(1), queued).await.unwrap().unwrap());
    assert_eq!(locks.available_permits(), 1);
}

#[tokio::test]
async fn close_fails_waiters() {
    let locks = Arc::new(ReleaseLocks::new(1));
    let held = locks.acquire("ns/a").await.unwrap();
    let waiter = {
        let locks = locks.clone();
        tokio::spawn(async move { locks.acquire("ns/b").await.is_err() })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    locks.close();
    assert!(waiter.await.unwrap());
    assert!(locks.acquire("ns/c").await.is_err());
    drop(held);
}
