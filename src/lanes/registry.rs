//! Lane registry and concurrency gate
//!
//! Every lane has its own ceiling, in-flight count and FIFO wait queue.
//! Lanes are created on first reference and live for the life of the
//! registry. Counters and queues are only touched by [`LaneRegistry::admit`],
//! [`LaneRegistry::release`] and [`LaneRegistry::set_concurrency`].

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use serde::Serialize;
use tokio::sync::oneshot;

use crate::{Error, Result};

/// Ceiling used for lanes that were never configured
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Point-in-time view of one lane
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneSnapshot {
    pub lane: String,
    pub max_concurrent: usize,
    pub active: usize,
    pub queued: usize,
}

struct Waiter {
    id: u64,
    grant: oneshot::Sender<()>,
}

struct LaneState {
    max_concurrent: usize,
    active: usize,
    waiters: VecDeque<Waiter>,
}

impl LaneState {
    const fn new() -> Self {
        Self {
            max_concurrent: DEFAULT_CONCURRENCY,
            active: 0,
            waiters: VecDeque::new(),
        }
    }

    /// Hand free slots to the longest-waiting callers
    fn pump(&mut self) -> usize {
        let mut admitted = 0;
        while self.active < self.max_concurrent {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            // A closed receiver means the waiter gave up; its slot stays free
            if waiter.grant.send(()).is_ok() {
                self.active += 1;
                admitted += 1;
            }
        }
        admitted
    }
}

#[derive(Default)]
struct Lanes {
    lanes: HashMap<String, LaneState>,
    next_waiter_id: u64,
}

impl Lanes {
    fn lane_mut(&mut self, lane: &str) -> &mut LaneState {
        self.lanes
            .entry(lane.to_string())
            .or_insert_with(LaneState::new)
    }

    fn release(&mut self, lane: &str) {
        let Some(state) = self.lanes.get_mut(lane) else {
            tracing::debug!(lane, "release on unknown lane ignored");
            return;
        };
        if state.active == 0 {
            tracing::debug!(lane, "release on idle lane ignored");
            return;
        }
        state.active -= 1;
        let admitted = state.pump();
        tracing::trace!(
            lane,
            active = state.active,
            queued = state.waiters.len(),
            admitted,
            "lane slot released"
        );
    }
}

/// Registry of named lanes with independent concurrency ceilings
///
/// Cheap to clone; all clones share the same lanes.
#[derive(Clone, Default)]
pub struct LaneRegistry {
    inner: Arc<Mutex<Lanes>>,
}

impl std::fmt::Debug for LaneRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaneRegistry")
            .field("lanes", &self.snapshots())
            .finish()
    }
}

impl LaneRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Lanes> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the maximum number of concurrent admissions for a lane
    ///
    /// Lowering the ceiling below the in-flight count never preempts running
    /// work; it only holds back new admissions. Raising it admits queued
    /// callers immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConcurrency`] if `max_concurrent` is zero
    pub fn set_concurrency(&self, lane: &str, max_concurrent: usize) -> Result<()> {
        if max_concurrent == 0 {
            return Err(Error::InvalidConcurrency {
                lane: lane.to_string(),
                value: max_concurrent,
            });
        }

        let mut lanes = self.lock();
        let state = lanes.lane_mut(lane);
        let previous = state.max_concurrent;
        state.max_concurrent = max_concurrent;
        let admitted = state.pump();

        if previous != max_concurrent {
            tracing::info!(
                lane,
                from = previous,
                to = max_concurrent,
                admitted,
                "lane concurrency updated"
            );
        }
        Ok(())
    }

    /// Configured ceiling for a lane
    #[must_use]
    pub fn concurrency(&self, lane: &str) -> usize {
        self.lock()
            .lanes
            .get(lane)
            .map_or(DEFAULT_CONCURRENCY, |s| s.max_concurrent)
    }

    /// Admit immediately if the lane has spare capacity and nobody is waiting
    #[must_use]
    pub fn try_admit(&self, lane: &str) -> Option<LaneTicket> {
        let mut lanes = self.lock();
        let state = lanes.lane_mut(lane);
        if state.active < state.max_concurrent && state.waiters.is_empty() {
            state.active += 1;
            drop(lanes);
            Some(LaneTicket::new(self.clone(), lane))
        } else {
            None
        }
    }

    /// Claim a slot in `lane`, waiting in FIFO order if the lane is full
    ///
    /// The caller's place in the queue is taken by this call, before the
    /// returned future is polled. Dropping the future gives the place (or an
    /// already granted slot) back.
    pub fn admit(&self, lane: &str) -> Admission {
        let mut lanes = self.lock();
        let waiter_id = lanes.next_waiter_id;
        lanes.next_waiter_id += 1;

        let state = lanes.lane_mut(lane);
        let pending = if state.active < state.max_concurrent && state.waiters.is_empty() {
            state.active += 1;
            Pending::Granted
        } else {
            let (grant, granted) = oneshot::channel();
            state.waiters.push_back(Waiter {
                id: waiter_id,
                grant,
            });
            tracing::trace!(
                lane,
                active = state.active,
                queued = state.waiters.len(),
                "lane full, caller queued"
            );
            Pending::Queued {
                id: waiter_id,
                granted,
            }
        };
        drop(lanes);

        Admission {
            registry: self.clone(),
            lane: lane.to_string(),
            pending,
        }
    }

    /// Give back one slot and admit the longest-waiting caller, if any
    ///
    /// Releasing a lane with nothing in flight is a no-op.
    pub fn release(&self, lane: &str) {
        self.lock().release(lane);
    }

    /// Number of admitted, not yet released callers
    #[must_use]
    pub fn active(&self, lane: &str) -> usize {
        self.lock().lanes.get(lane).map_or(0, |s| s.active)
    }

    /// Number of callers waiting for admission
    #[must_use]
    pub fn queued(&self, lane: &str) -> usize {
        self.lock().lanes.get(lane).map_or(0, |s| s.waiters.len())
    }

    /// Snapshot of one lane (defaults if it was never referenced)
    #[must_use]
    pub fn snapshot(&self, lane: &str) -> LaneSnapshot {
        let lanes = self.lock();
        lanes.lanes.get(lane).map_or_else(
            || LaneSnapshot {
                lane: lane.to_string(),
                max_concurrent: DEFAULT_CONCURRENCY,
                active: 0,
                queued: 0,
            },
            |state| snapshot_of(lane, state),
        )
    }

    /// Snapshots of every known lane, sorted by name
    #[must_use]
    pub fn snapshots(&self) -> Vec<LaneSnapshot> {
        let lanes = self.lock();
        let mut all: Vec<_> = lanes
            .lanes
            .iter()
            .map(|(name, state)| snapshot_of(name, state))
            .collect();
        all.sort_by(|a, b| a.lane.cmp(&b.lane));
        all
    }
}

fn snapshot_of(lane: &str, state: &LaneState) -> LaneSnapshot {
    LaneSnapshot {
        lane: lane.to_string(),
        max_concurrent: state.max_concurrent,
        active: state.active,
        queued: state.waiters.len(),
    }
}

enum Pending {
    Granted,
    Queued {
        id: u64,
        granted: oneshot::Receiver<()>,
    },
    Taken,
}

/// Future returned by [`LaneRegistry::admit`]
#[must_use = "dropping an admission gives its place in the lane back"]
pub struct Admission {
    registry: LaneRegistry,
    lane: String,
    pending: Pending,
}

impl Admission {
    /// Lane this admission is waiting on
    #[must_use]
    pub fn lane(&self) -> &str {
        &self.lane
    }

    /// Whether the slot was granted without waiting
    #[must_use]
    pub const fn is_immediate(&self) -> bool {
        matches!(self.pending, Pending::Granted)
    }

    fn into_pending(mut self) -> Pending {
        std::mem::replace(&mut self.pending, Pending::Taken)
    }
}

impl Future for Admission {
    type Output = LaneTicket;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        loop {
            match &mut this.pending {
                Pending::Granted => {
                    this.pending = Pending::Taken;
                    return Poll::Ready(LaneTicket::new(this.registry.clone(), &this.lane));
                }
                Pending::Queued { granted, .. } => match Pin::new(granted).poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(())) => this.pending = Pending::Granted,
                    Poll::Ready(Err(_)) => {
                        // Grant dropped without being sent; take a fresh place
                        this.pending = this.registry.admit(&this.lane).into_pending();
                    }
                },
                Pending::Taken => return Poll::Pending,
            }
        }
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.pending, Pending::Taken) {
            Pending::Granted => self.registry.release(&self.lane),
            Pending::Queued { id, .. } => {
                let mut lanes = self.registry.lock();
                let still_queued = lanes.lanes.get_mut(&self.lane).is_some_and(|state| {
                    let before = state.waiters.len();
                    state.waiters.retain(|w| w.id != id);
                    state.waiters.len() != before
                });
                // Not in the queue any more: a slot was granted under the lock
                if !still_queued {
                    lanes.release(&self.lane);
                }
            }
            Pending::Taken => {}
        }
    }
}

/// Proof of admission into a lane; releases its slot when dropped
#[derive(Debug)]
#[must_use = "dropping a ticket releases the lane slot immediately"]
pub struct LaneTicket {
    registry: LaneRegistry,
    lane: String,
    released: bool,
}

impl LaneTicket {
    fn new(registry: LaneRegistry, lane: &str) -> Self {
        Self {
            registry,
            lane: lane.to_string(),
            released: false,
        }
    }

    /// Lane this ticket holds a slot in
    #[must_use]
    pub fn lane(&self) -> &str {
        &self.lane
    }

    /// Release the slot now
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.registry.release(&self.lane);
        }
    }
}

impl Drop for LaneTicket {
    fn drop(&mut self) {
        self.release_once();
    }
}
