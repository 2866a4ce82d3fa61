//! Command dispatcher
//!
//! Wraps units of work so they only start once their lane admits them and
//! always give the slot back when they settle. Each enqueued item runs on
//! its own task; the returned [`CommandHandle`] resolves to the item's own
//! outcome.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::registry::LaneRegistry;

/// Queue wait after which an admission is logged as slow
pub const DEFAULT_WARN_AFTER: Duration = Duration::from_secs(2);

/// Lifecycle of one work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl CommandState {
    /// Whether the item has reached its final state
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Outcome of a work item that did not produce a value
#[derive(Debug, Error)]
pub enum CommandError<E> {
    /// The work item's own failure, unchanged
    #[error("{0}")]
    Failed(E),

    /// Cancelled while still queued; the work never ran
    #[error("command cancelled before admission")]
    Cancelled,

    /// The task running the item panicked or was aborted
    #[error("command aborted: {0}")]
    Aborted(String),
}

impl<E> CommandError<E> {
    /// Whether the item was cancelled before it ran
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The work item's own error, if that is what this is
    #[must_use]
    pub fn into_failure(self) -> Option<E> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Per-item enqueue options
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Cancelling this token removes the item if it is still queued, and is
    /// forwarded to the work once running
    pub cancel: Option<CancellationToken>,
    /// Warn when admission takes longer than this
    pub warn_after: Option<Duration>,
}

impl EnqueueOptions {
    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    #[must_use]
    pub const fn with_warn_after(mut self, after: Duration) -> Self {
        self.warn_after = Some(after);
        self
    }
}

struct Queued {
    lane: String,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Book {
    depth: HashMap<String, usize>,
    queued: HashMap<Uuid, Queued>,
}

/// Lane-aware command dispatcher
#[derive(Clone)]
pub struct CommandQueue {
    lanes: LaneRegistry,
    book: Arc<Mutex<Book>>,
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("lanes", &self.lanes)
            .finish_non_exhaustive()
    }
}

impl CommandQueue {
    /// Create a dispatcher on top of a lane registry
    #[must_use]
    pub fn new(lanes: LaneRegistry) -> Self {
        Self {
            lanes,
            book: Arc::default(),
        }
    }

    /// The registry this dispatcher admits through
    #[must_use]
    pub const fn lanes(&self) -> &LaneRegistry {
        &self.lanes
    }

    fn lock(&self) -> MutexGuard<'_, Book> {
        lock_book(&self.book)
    }

    /// Enqueue `work` on `lane` with default options
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue<F, Fut, T, E>(&self, lane: &str, work: F) -> CommandHandle<T, E>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.enqueue_with(lane, EnqueueOptions::default(), work)
    }

    /// Enqueue `work` on `lane`
    ///
    /// The item's place in the lane's FIFO queue is fixed by this call. The
    /// work receives a token that is cancelled if the item is cancelled
    /// after admission; honouring it is up to the work.
    pub fn enqueue_with<F, Fut, T, E>(
        &self,
        lane: &str,
        options: EnqueueOptions,
        work: F,
    ) -> CommandHandle<T, E>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let id = Uuid::new_v4();
        let cancel = options
            .cancel
            .map_or_else(CancellationToken::new, |parent| parent.child_token());
        let warn_after = options.warn_after.unwrap_or(DEFAULT_WARN_AFTER);
        let enqueued_at = Instant::now();
        let (state_tx, state_rx) = watch::channel(CommandState::Pending);

        let tracked = self.track(id, lane, &cancel);
        let admission = self.lanes.admit(lane);
        let lane_name = lane.to_string();
        let token = cancel.clone();

        tracing::debug!(command_id = %id, lane, immediate = admission.is_immediate(), "command enqueued");

        let join = tokio::spawn(async move {
            let ticket = tokio::select! {
                biased;
                () = token.cancelled() => {
                    state_tx.send_replace(CommandState::Cancelled);
                    tracing::debug!(command_id = %id, lane = %lane_name, "command cancelled while queued");
                    return Err(CommandError::Cancelled);
                }
                ticket = admission => ticket,
            };
            tracked.admitted();

            let waited = enqueued_at.elapsed();
            if waited >= warn_after {
                tracing::warn!(
                    command_id = %id,
                    lane = %lane_name,
                    waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                    "command waited in lane queue"
                );
            }

            state_tx.send_replace(CommandState::Running);
            let result = work(token.child_token()).await;
            drop(ticket);

            match result {
                Ok(value) => {
                    state_tx.send_replace(CommandState::Completed);
                    Ok(value)
                }
                Err(e) => {
                    state_tx.send_replace(CommandState::Failed);
                    tracing::debug!(command_id = %id, lane = %lane_name, "command failed");
                    Err(CommandError::Failed(e))
                }
            }
        });

        CommandHandle {
            id,
            lane: lane.to_string(),
            cancel,
            state: state_rx,
            join,
        }
    }

    fn track(&self, id: Uuid, lane: &str, cancel: &CancellationToken) -> Tracked {
        let mut book = self.lock();
        *book.depth.entry(lane.to_string()).or_insert(0) += 1;
        book.queued.insert(
            id,
            Queued {
                lane: lane.to_string(),
                cancel: cancel.clone(),
            },
        );
        Tracked {
            book: self.book.clone(),
            id,
            lane: lane.to_string(),
        }
    }

    /// Items queued or running on `lane`
    #[must_use]
    pub fn depth(&self, lane: &str) -> usize {
        self.lock().depth.get(lane).copied().unwrap_or(0)
    }

    /// Items queued or running across every lane
    #[must_use]
    pub fn total_depth(&self) -> usize {
        self.lock().depth.values().sum()
    }

    /// Cancel every item still waiting for admission on `lane`
    ///
    /// Running items are left alone. Returns how many items were cancelled.
    pub fn clear_lane(&self, lane: &str) -> usize {
        let tokens: Vec<_> = self
            .lock()
            .queued
            .values()
            .filter(|q| q.lane == lane)
            .map(|q| q.cancel.clone())
            .collect();
        for token in &tokens {
            token.cancel();
        }
        if !tokens.is_empty() {
            tracing::info!(lane, cancelled = tokens.len(), "lane queue cleared");
        }
        tokens.len()
    }
}

fn lock_book(book: &Mutex<Book>) -> MutexGuard<'_, Book> {
    book.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bookkeeping for one item; removes it from the depth count when dropped
struct Tracked {
    book: Arc<Mutex<Book>>,
    id: Uuid,
    lane: String,
}

impl Tracked {
    fn admitted(&self) {
        lock_book(&self.book).queued.remove(&self.id);
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        let mut book = lock_book(&self.book);
        book.queued.remove(&self.id);
        if let Some(depth) = book.depth.get_mut(&self.lane) {
            *depth = depth.saturating_sub(1);
            if *depth == 0 {
                book.depth.remove(&self.lane);
            }
        }
    }
}

/// Handle to an enqueued work item
///
/// Awaiting the handle yields the item's outcome. Dropping it does not
/// cancel the item.
#[must_use = "dropping a command handle detaches the command"]
pub struct CommandHandle<T, E> {
    id: Uuid,
    lane: String,
    cancel: CancellationToken,
    state: watch::Receiver<CommandState>,
    join: JoinHandle<Result<T, CommandError<E>>>,
}

impl<T, E> std::fmt::Debug for CommandHandle<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandle")
            .field("id", &self.id)
            .field("lane", &self.lane)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<T, E> CommandHandle<T, E> {
    /// Correlation id of the item
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Lane the item was enqueued on
    #[must_use]
    pub fn lane(&self) -> &str {
        &self.lane
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> CommandState {
        *self.state.borrow()
    }

    /// Subscribe to state transitions
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<CommandState> {
        self.state.clone()
    }

    /// Request cancellation
    ///
    /// A queued item resolves as [`CommandError::Cancelled`] without running.
    /// A running item only sees its token fire.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl<T, E> Future for CommandHandle<T, E> {
    type Output = Result<T, CommandError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.join).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(e)) => {
                let reason = if e.is_panic() {
                    "work panicked"
                } else {
                    "task cancelled"
                };
                tracing::error!(command_id = %self.id, lane = %self.lane, reason, "command aborted");
                Poll::Ready(Err(CommandError::Aborted(reason.to_string())))
            }
        }
    }
}
