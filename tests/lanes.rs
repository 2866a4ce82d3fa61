//! Lane scheduling integration tests

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use switchboard_gateway::lanes::CommandState;
use switchboard_gateway::{CommandQueue, Error, LaneRegistry, SerialLock};
use tokio::sync::oneshot;

mod common;
use common::wait_until;

fn queue_with(lane: &str, max_concurrent: usize) -> (LaneRegistry, CommandQueue) {
    let lanes = LaneRegistry::new();
    lanes.set_concurrency(lane, max_concurrent).unwrap();
    let queue = CommandQueue::new(lanes.clone());
    (lanes, queue)
}

#[tokio::test]
async fn slow_item_holds_back_the_next_one() {
    let (lanes, queue) = queue_with("cron", 1);
    let log = Arc::new(Mutex::new(Vec::new()));
    let (release_a, gate_a) = oneshot::channel::<()>();

    let a = queue.enqueue("cron", {
        let log = log.clone();
        move |_| async move {
            log.lock().unwrap().push("a:start");
            let _ = gate_a.await;
            log.lock().unwrap().push("a:done");
            Ok::<_, Infallible>("a")
        }
    });
    let b = queue.enqueue("cron", {
        let log = log.clone();
        move |_| async move {
            log.lock().unwrap().push("b:start");
            log.lock().unwrap().push("b:done");
            Ok::<_, Infallible>("b")
        }
    });

    wait_until(|| log.lock().unwrap().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(*log.lock().unwrap(), vec!["a:start"]);
    assert_eq!(b.state(), CommandState::Pending);
    assert_eq!(lanes.active("cron"), 1);
    assert_eq!(lanes.queued("cron"), 1);
    assert_eq!(queue.depth("cron"), 2);

    release_a.send(()).unwrap();
    assert_eq!(a.await.unwrap(), "a");
    assert_eq!(b.await.unwrap(), "b");
    assert_eq!(
        *log.lock().unwrap(),
        vec!["a:start", "a:done", "b:start", "b:done"]
    );
    assert_eq!(queue.depth("cron"), 0);
}

#[tokio::test]
async fn raising_the_ceiling_admits_queued_items() {
    let (lanes, queue) = queue_with("main", 1);
    let started = Arc::new(AtomicUsize::new(0));
    let mut gates = Vec::new();
    let mut handles = Vec::new();

    for _ in 0..3 {
        let (tx, rx) = oneshot::channel::<()>();
        gates.push(tx);
        let started = started.clone();
        handles.push(queue.enqueue("main", move |_| async move {
            started.fetch_add(1, Ordering::SeqCst);
            let _ = rx.await;
            Ok::<_, Infallible>(())
        }));
    }

    wait_until(|| started.load(Ordering::SeqCst) == 1).await;
    assert_eq!(lanes.queued("main"), 2);

    // The first item is still running
    lanes.set_concurrency("main", 3).unwrap();
    wait_until(|| started.load(Ordering::SeqCst) == 3).await;
    assert_eq!(lanes.active("main"), 3);
    assert_eq!(lanes.queued("main"), 0);

    for gate in gates {
        let _ = gate.send(());
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(lanes.active("main"), 0);
}

#[tokio::test]
async fn admission_follows_enqueue_order() {
    let (_lanes, queue) = queue_with("session:telegram:42", 1);
    let order = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..10u64)
        .map(|i| {
            let order = order.clone();
            queue.enqueue("session:telegram:42", move |_| async move {
                order.lock().unwrap().push(i);
                // Earlier items take longer
                tokio::time::sleep(Duration::from_millis(10 - i)).await;
                Ok::<_, Infallible>(())
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn ceiling_is_never_exceeded() {
    let (lanes, queue) = queue_with("subagent", 3);
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..20u64)
        .map(|i| {
            let active = active.clone();
            let peak = peak.clone();
            queue.enqueue("subagent", move |_| async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1 + i % 4)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                if i % 5 == 0 {
                    return Err(format!("item {i} failed"));
                }
                Ok(i)
            })
        })
        .collect();

    let mut failures = 0;
    for handle in handles {
        if handle.await.is_err() {
            failures += 1;
        }
    }
    assert_eq!(failures, 4);
    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert_eq!(lanes.active("subagent"), 0);
}

#[tokio::test]
async fn lanes_do_not_block_each_other() {
    let (lanes, queue) = queue_with("cron", 1);
    let (release, gate) = oneshot::channel::<()>();

    let blocked = queue.enqueue("cron", move |_| async move {
        let _ = gate.await;
        Ok::<_, Infallible>(())
    });
    wait_until(|| lanes.active("cron") == 1).await;

    let other = queue.enqueue("main", |_| async { Ok::<_, Infallible>(7) });
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(1), other)
            .await
            .unwrap()
            .unwrap(),
        7
    );

    release.send(()).unwrap();
    blocked.await.unwrap();
}

#[test]
fn zero_ceiling_is_rejected() {
    let lanes = LaneRegistry::new();
    let err = lanes.set_concurrency("cron", 0).unwrap_err();
    assert!(matches!(err, Error::InvalidConcurrency { .. }));
    assert_eq!(lanes.concurrency("cron"), 1);
}

#[tokio::test]
async fn serial_lock_isolates_failures() {
    let lock = SerialLock::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    let first = lock.run_exclusive({
        let log = log.clone();
        move || async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            log.lock().unwrap().push("first");
            Err::<(), _>("boom")
        }
    });
    let second = lock.run_exclusive({
        let log = log.clone();
        move || async move {
            log.lock().unwrap().push("second");
            Ok::<_, &str>(2)
        }
    });

    let (first, second) = tokio::join!(first, second);
    assert_eq!(first, Err("boom"));
    assert_eq!(second, Ok(2));
    assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
}
