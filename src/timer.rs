// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Proxy timer management.
//!
//! Timers live in a priority queue ordered by fire time. Each timer is
//! identified by its [`TimerType`]; scheduling a type that is already
//! pending replaces it, and cancelled or replaced entries are discarded
//! lazily when they reach the head of the queue.
//!
//! Firings carry the generation the owner stamped on the request, so the
//! receiver can reject a firing that raced with a state change.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Notify};
use tokio::time::sleep;

use crate::logging::{Facility, Logger};
use crate::membership::GroupMembershipKey;
use crate::{log_debug, log_info};

/// Current time on the runtime's clock. Follows tokio's paused clock in
/// tests and matches [`Instant::now`] otherwise.
pub fn clock_now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Types of timers used by the proxy
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerType {
    /// Steady-state membership expiry for one key
    MembershipExpiry(GroupMembershipKey),
    /// Last-member query retransmission / leave confirmation for one key
    LastMemberQuery(GroupMembershipKey),
    /// Deferred answer to an upstream query for one key
    QueryResponse(GroupMembershipKey),
    /// Periodic general query toward subscribers
    PeriodicQuery,
    /// Periodic sweep of due per-key timers
    Sweep,
    /// Periodic statistics publication
    PublishStatistics,
}

impl TimerType {
    /// The membership key this timer belongs to, if any
    pub fn key(&self) -> Option<&GroupMembershipKey> {
        match self {
            TimerType::MembershipExpiry(key)
            | TimerType::LastMemberQuery(key)
            | TimerType::QueryResponse(key) => Some(key),
            _ => None,
        }
    }
}

/// Request to schedule a timer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRequest {
    pub timer_type: TimerType,
    pub fire_at: Instant,
    /// Owner's generation at arm time, echoed back on firing
    pub generation: u64,
    /// Re-arm every `period` after firing
    pub period: Option<Duration>,
}

impl TimerRequest {
    pub fn once(timer_type: TimerType, fire_at: Instant, generation: u64) -> Self {
        Self {
            timer_type,
            fire_at,
            generation,
            period: None,
        }
    }

    pub fn periodic(timer_type: TimerType, first_at: Instant, period: Duration) -> Self {
        Self {
            timer_type,
            fire_at: first_at,
            generation: 0,
            period: Some(period),
        }
    }
}

/// A timer that reached its fire time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredTimer {
    pub timer_type: TimerType,
    pub generation: u64,
    pub fire_at: Instant,
}

/// Handle returned by [`TimerService::schedule`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerHandle {
    timer_type: TimerType,
    seq: u64,
}

#[derive(Debug, Clone)]
struct ScheduledTimer {
    fire_at: Instant,
    seq: u64,
    request: TimerRequest,
}

impl PartialEq for ScheduledTimer {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for ScheduledTimer {}

impl PartialOrd for ScheduledTimer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTimer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fire_at
            .cmp(&other.fire_at)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct TimerQueue {
    heap: BinaryHeap<Reverse<ScheduledTimer>>,
    /// Sequence number of the live entry for each timer type
    live: HashMap<TimerType, u64>,
    next_seq: u64,
}

impl TimerQueue {
    fn is_live(&self, timer: &ScheduledTimer) -> bool {
        self.live.get(&timer.request.timer_type) == Some(&timer.seq)
    }

    /// Drop dead entries from the head so `peek` sees a live timer
    fn prune_head(&mut self) {
        while let Some(Reverse(head)) = self.heap.peek() {
            if self.is_live(head) {
                break;
            }
            self.heap.pop();
        }
    }
}

/// Timer service shared between the proxy and its timer task.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct TimerService {
    queue: Arc<Mutex<TimerQueue>>,
    notify: Arc<Notify>,
    logger: Logger,
}

impl TimerService {
    pub fn new(logger: Logger) -> Self {
        Self {
            queue: Arc::new(Mutex::new(TimerQueue::default())),
            notify: Arc::new(Notify::new()),
            logger,
        }
    }

    fn queue(&self) -> MutexGuard<'_, TimerQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedule a timer, replacing any pending timer of the same type
    pub fn schedule(&self, request: TimerRequest) -> TimerHandle {
        let handle = {
            let mut queue = self.queue();
            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.live.insert(request.timer_type.clone(), seq);
            let handle = TimerHandle {
                timer_type: request.timer_type.clone(),
                seq,
            };
            queue.heap.push(Reverse(ScheduledTimer {
                fire_at: request.fire_at,
                seq,
                request,
            }));
            handle
        };
        self.notify.notify_one();
        handle
    }

    /// Cancel whatever timer of this type is pending
    pub fn cancel(&self, timer_type: &TimerType) -> bool {
        self.queue().live.remove(timer_type).is_some()
    }

    /// Cancel the timer behind `handle`, unless it has since been replaced
    pub fn cancel_handle(&self, handle: &TimerHandle) -> bool {
        let mut queue = self.queue();
        if queue.live.get(&handle.timer_type) == Some(&handle.seq) {
            queue.live.remove(&handle.timer_type);
            true
        } else {
            false
        }
    }

    /// Cancel every pending timer
    pub fn cancel_all(&self) {
        let mut queue = self.queue();
        queue.live.clear();
        queue.heap.clear();
    }

    pub fn is_pending(&self, timer_type: &TimerType) -> bool {
        self.queue().live.contains_key(timer_type)
    }

    pub fn pending_count(&self) -> usize {
        self.queue().live.len()
    }

    /// Fire time of the earliest live timer
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut queue = self.queue();
        queue.prune_head();
        queue.heap.peek().map(|Reverse(t)| t.fire_at)
    }

    /// Pop every live timer due at `now`, re-arming periodic ones
    pub fn pop_due(&self, now: Instant) -> Vec<FiredTimer> {
        let mut fired = Vec::new();
        let mut queue = self.queue();

        loop {
            queue.prune_head();
            let due = matches!(queue.heap.peek(), Some(Reverse(head)) if head.fire_at <= now);
            if !due {
                break;
            }
            let Some(Reverse(timer)) = queue.heap.pop() else {
                break;
            };

            fired.push(FiredTimer {
                timer_type: timer.request.timer_type.clone(),
                generation: timer.request.generation,
                fire_at: timer.fire_at,
            });

            match timer.request.period {
                Some(period) if !period.is_zero() => {
                    let seq = queue.next_seq;
                    queue.next_seq += 1;
                    queue.live.insert(timer.request.timer_type.clone(), seq);
                    // Skip missed periods instead of firing a burst
                    let mut next = timer.fire_at + period;
                    while next <= now {
                        next += period;
                    }
                    queue.heap.push(Reverse(ScheduledTimer {
                        fire_at: next,
                        seq,
                        request: TimerRequest {
                            fire_at: next,
                            ..timer.request
                        },
                    }));
                }
                _ => {
                    queue.live.remove(&timer.request.timer_type);
                }
            }
        }

        fired
    }

    /// Run the timer loop, delivering firings on `event_tx` until the
    /// receiver goes away.
    pub async fn run(self, event_tx: mpsc::Sender<FiredTimer>) {
        log_info!(self.logger, Facility::Timer, "Timer service started");

        loop {
            let sleep_duration = match self.next_deadline() {
                Some(deadline) => deadline.saturating_duration_since(clock_now()),
                // No timers, sleep until a new one is scheduled
                None => Duration::from_secs(3600),
            };

            tokio::select! {
                _ = sleep(sleep_duration) => {
                    for timer in self.pop_due(clock_now()) {
                        log_debug!(
                            self.logger,
                            Facility::Timer,
                            &format!("Timer expired: {:?}", timer.timer_type)
                        );
                        if event_tx.send(timer).await.is_err() {
                            log_info!(
                                self.logger,
                                Facility::Timer,
                                "Timer event channel closed, timer service exiting"
                            );
                            return;
                        }
                    }
                }
                _ = self.notify.notified() => {
                    // Schedule changed; recompute the sleep
                }
                _ = event_tx.closed() => {
                    log_info!(
                        self.logger,
                        Facility::Timer,
                        "Timer event channel closed, timer service exiting"
                    );
                    return;
                }
            }
        }
    }
}
