//! Delay queue and its background sender loop.
//!
//! Delay-family plans hand every chunk to a [`DelayQueue`] instead of
//! sending it. One sender loop per queue drains it in arrival order,
//! holding each element until `arrived_at + delay` has passed.
//!
//! The queue outlives individual connections. [`DelayQueue::clear`]
//! drops everything pending and bumps a generation counter, so an
//! element the loop had already dequeued (and is sleeping on) is
//! discarded instead of being written into a torn-down phase.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::socket::PeerSocket;

/// How long each queued element is held before sending.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DelaySchedule {
    Constant(Duration),
    /// Drawn independently per element, at send time.
    Uniform { lower: Duration, upper: Duration },
}

impl DelaySchedule {
    pub fn sample(&self) -> Duration {
        match *self {
            DelaySchedule::Constant(delay) => delay,
            DelaySchedule::Uniform { lower, upper } if lower >= upper => lower,
            DelaySchedule::Uniform { lower, upper } => {
                let secs = rand::rng().random_range(lower.as_secs_f64()..=upper.as_secs_f64());
                // Float rounding near `Duration::MAX` can land out of range.
                Duration::try_from_secs_f64(secs).unwrap_or(upper)
            }
        }
    }
}

/// Stand-in deadline for delays too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// A chunk waiting for its scheduled send time.
#[derive(Debug)]
pub(crate) struct DelayQueueElement {
    data: Vec<u8>,
    dest: Arc<PeerSocket>,
    arrived_at: Instant,
    generation: u64,
}

impl DelayQueueElement {
    fn due(&self, delay: Duration) -> Instant {
        self.arrived_at
            .checked_add(delay)
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE)
    }
}

#[derive(Debug, Default)]
struct Pending {
    items: VecDeque<DelayQueueElement>,
    generation: u64,
}

#[derive(Debug, Default)]
struct Shared {
    pending: Mutex<Pending>,
    ready: Notify,
    /// Wakes the sender loop out of its wait when the queue is cleared.
    cleared: Notify,
}

impl Shared {
    async fn next(&self) -> DelayQueueElement {
        loop {
            let popped = self.pending.lock().expect("delay queue lock").items.pop_front();
            if let Some(element) = popped {
                return element;
            }
            self.ready.notified().await;
        }
    }

    fn is_stale(&self, element: &DelayQueueElement) -> bool {
        let generation = self.pending.lock().expect("delay queue lock").generation;
        element.generation != generation || element.dest.is_closed()
    }
}

/// FIFO of delayed sends plus the task that drains it.
///
/// Dropping the queue stops its sender loop.
#[derive(Debug)]
pub struct DelayQueue {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl DelayQueue {
    /// Create a queue and spawn its sender loop.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(schedule: DelaySchedule) -> Self {
        let shared = Arc::new(Shared::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(sender_loop(Arc::clone(&shared), schedule, shutdown_rx));

        Self {
            shared,
            shutdown_tx,
            handle,
        }
    }

    /// Queue `data` for delivery to `dest`, stamped with the current time.
    pub fn enqueue(&self, data: Vec<u8>, dest: Arc<PeerSocket>) {
        {
            let mut pending = self.shared.pending.lock().expect("delay queue lock");
            let generation = pending.generation;
            pending.items.push_back(DelayQueueElement {
                data,
                dest,
                arrived_at: Instant::now(),
                generation,
            });
        }
        self.shared.ready.notify_one();
    }

    /// Discard everything not yet sent, including an element the sender
    /// loop is currently holding.
    pub fn clear(&self) {
        let mut pending = self.shared.pending.lock().expect("delay queue lock");
        let dropped = pending.items.len();
        pending.items.clear();
        pending.generation += 1;
        drop(pending);
        self.shared.cleared.notify_one();
        if dropped > 0 {
            debug!(dropped, "discarded queued sends for closed connection");
        }
    }

    /// Number of elements waiting (not counting one in flight).
    pub fn len(&self) -> usize {
        self.shared.pending.lock().expect("delay queue lock").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for DelayQueue {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
    }
}

async fn sender_loop(
    shared: Arc<Shared>,
    schedule: DelaySchedule,
    mut shutdown: watch::Receiver<bool>,
) {
    'elements: loop {
        let element = tokio::select! {
            element = shared.next() => element,
            _ = shutdown.changed() => break,
        };

        let sleep = tokio::time::sleep_until(element.due(schedule.sample()));
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                // A leftover wakeup from an earlier clear is harmless: the
                // element is only abandoned if it really went stale.
                _ = shared.cleared.notified() => {
                    if shared.is_stale(&element) {
                        break;
                    }
                }
                _ = shutdown.changed() => break 'elements,
            }
        }

        if shared.is_stale(&element) {
            trace!(bytes = element.data.len(), "dropping delayed send for closed connection");
            continue;
        }

        // The owning connection may be gone by now; that is not our error.
        if let Err(e) = element.dest.send(&element.data).await {
            debug!(
                peer = %element.dest.peer_addr(),
                phase = element.dest.phase(),
                error = %e,
                "delayed send failed"
            );
        }
    }

    trace!("delay sender loop stopped");
}
