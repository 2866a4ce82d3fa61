//! Serialized operation lock
//!
//! Forces a sequence of asynchronous operations that share state to run one
//! at a time, in the order they were submitted. Each submission takes the
//! place of the chain's tail: it waits for the previous tail to settle,
//! runs, and settles in turn regardless of its own outcome. A failing or
//! dropped operation never blocks its successors.

use std::future::Future;
use std::sync::{Mutex, PoisonError};

use futures::FutureExt;
use futures::future::{self, BoxFuture, Shared};
use tokio::sync::oneshot;

/// Settles once every operation submitted so far has settled
type Tail = Shared<BoxFuture<'static, ()>>;

/// One-at-a-time, submission-ordered execution of async operations
///
/// The chain position is taken when [`SerialLock::run_exclusive`] is
/// *called*, not when the returned future is first polled, so call order is
/// execution order even if the futures are spawned onto different tasks.
pub struct SerialLock {
    tail: Mutex<Tail>,
}

impl Default for SerialLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SerialLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLock").finish_non_exhaustive()
    }
}

impl SerialLock {
    /// Create a lock whose chain starts out settled
    #[must_use]
    pub fn new() -> Self {
        Self {
            tail: Mutex::new(future::ready(()).boxed().shared()),
        }
    }

    /// Queue `operation` behind every operation submitted before it
    ///
    /// The returned future resolves to the operation's own output; outcomes
    /// of predecessors are never observed by the caller. No timeout is
    /// applied here.
    pub fn run_exclusive<F, Fut, T>(&self, operation: F) -> impl Future<Output = T> + use<F, Fut, T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let (settled_tx, settled_rx) = oneshot::channel::<()>();
        let previous = {
            let mut tail = self.tail.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = tail.clone();
            let chained = previous.clone();
            // A link settles only after its predecessor, even if its own
            // future is dropped before running
            *tail = async move {
                chained.await;
                let _ = settled_rx.await;
            }
            .boxed()
            .shared();
            previous
        };

        async move {
            previous.await;
            let output = operation().await;
            drop(settled_tx);
            output
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::Mutex as AsyncMutex;

    use super::*;

    #[tokio::test]
    async fn runs_in_submission_order() {
        let lock = SerialLock::new();
        let log = Arc::new(AsyncMutex::new(Vec::new()));

        let slow = {
            let log = log.clone();
            lock.run_exclusive(move || async move {
                log.lock().await.push("a:start");
                tokio::time::sleep(Duration::from_millis(40)).await;
                log.lock().await.push("a:end");
            })
        };
        let fast = {
            let log = log.clone();
            lock.run_exclusive(move || async move {
                log.lock().await.push("b:start");
                log.lock().await.push("b:end");
            })
        };

        // Poll the second one first: order is fixed at submission
        let b = tokio::spawn(fast);
        let a = tokio::spawn(slow);
        a.await.unwrap();
        b.await.unwrap();

        assert_eq!(
            *log.lock().await,
            vec!["a:start", "a:end", "b:start", "b:end"]
        );
    }

    #[tokio::test]
    async fn failure_does_not_break_chain() {
        let lock = SerialLock::new();

        let first = lock.run_exclusive(|| async { Err::<u32, &str>("boom") });
        let second = lock.run_exclusive(|| async { Ok::<u32, &str>(7) });

        assert_eq!(first.await, Err("boom"));
        assert_eq!(second.await, Ok(7));
    }

    #[tokio::test]
    async fn dropped_operation_releases_successor() {
        let lock = SerialLock::new();

        let abandoned = lock.run_exclusive(|| async { 1 });
        let next = lock.run_exclusive(|| async { 2 });
        drop(abandoned);

        let value = tokio::time::timeout(Duration::from_secs(1), next)
            .await
            .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn dropped_waiter_still_waits_for_running_predecessor() {
        let lock = SerialLock::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let running = {
            let finished = finished.clone();
            tokio::spawn(lock.run_exclusive(move || async move {
                let _ = release_rx.await;
                finished.store(true, std::sync::atomic::Ordering::SeqCst);
            }))
        };
        let abandoned = lock.run_exclusive(|| async {});
        let observer = {
            let finished = finished.clone();
            lock.run_exclusive(move || async move {
                finished.load(std::sync::atomic::Ordering::SeqCst)
            })
        };
        drop(abandoned);

        let observer = tokio::spawn(observer);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!observer.is_finished());

        release_tx.send(()).unwrap();
        running.await.unwrap();
        assert!(observer.await.unwrap());
    }

    #[tokio::test]
    async fn never_overlaps() {
        let lock = Arc::new(SerialLock::new());
        let running = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let running = running.clone();
            handles.push(tokio::spawn(lock.run_exclusive(move || async move {
                let now = running.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                assert_eq!(now, 0, "operations overlapped");
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            })));
        }

        for handle in handles {
            handle.await.unwrap();
        }
    }
}
