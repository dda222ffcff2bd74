//! Priority timer queue driving the background flushes.
//!
//! The queue does not own recurring work: an action that wants to run again
//! re-enters itself for the next occurrence. While an action runs the queue
//! lock is released, so actions are free to call [`Scheduler::enter`].

use crate::core::ticker::{millis_to_nanos, Ticker};
use crate::statistics::Statistics;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

type Action = Box<dyn FnOnce() + Send>;

struct ScheduledEvent {
    due_nanos: u64,
    priority: i32,
    /// Entry order, so same-time same-priority events run FIFO.
    seq: u64,
    action: Action,
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due_nanos, self.priority, self.seq).cmp(&(
            other.due_nanos,
            other.priority,
            other.seq,
        ))
    }
}

enum Step {
    Run(ScheduledEvent),
    Wait(u64),
    Done,
}

/// Runs scheduled actions in (due time, priority) order.
pub struct Scheduler {
    queue: Mutex<BinaryHeap<Reverse<ScheduledEvent>>>,
    next_seq: Mutex<u64>,
    ticker: Arc<dyn Ticker>,
    statistics: Mutex<Option<Arc<Statistics>>>,
    nudge_tx: Sender<()>,
    nudge_rx: Receiver<()>,
}

impl Scheduler {
    /// Creates an empty scheduler reading time from `ticker`.
    pub fn new(ticker: Arc<dyn Ticker>) -> Self {
        let (nudge_tx, nudge_rx) = bounded(1);
        Self {
            queue: Mutex::new(BinaryHeap::new()),
            next_seq: Mutex::new(0),
            ticker,
            statistics: Mutex::new(None),
            nudge_tx,
            nudge_rx,
        }
    }

    /// Attaches the counter bag updated per event.
    pub fn set_statistics(&self, statistics: Arc<Statistics>) {
        *self.statistics.lock() = Some(statistics);
    }

    /// Schedules `action` to run `delta_millis` from now.
    ///
    /// When two actions share a due time, the lower `priority` value runs
    /// first. A blocked [`Self::run`] is woken so it notices heads that now
    /// come earlier than the one it was sleeping towards.
    pub fn enter<F>(&self, action: F, delta_millis: i64, priority: i32)
    where
        F: FnOnce() + Send + 'static,
    {
        let due_nanos = self.ticker.now_nanos() + millis_to_nanos(delta_millis.max(0));
        let seq = {
            let mut next_seq = self.next_seq.lock();
            let seq = *next_seq;
            *next_seq += 1;
            seq
        };
        self.queue.lock().push(Reverse(ScheduledEvent {
            due_nanos,
            priority,
            seq,
            action: Box::new(action),
        }));
        let _ = self.nudge_tx.try_send(());
    }

    /// Number of events waiting in the queue.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Runs due events until the queue is empty.
    ///
    /// When the head event lies in the future: with `block` set, sleeps
    /// until it is due (or an [`Self::enter`] nudges the queue); otherwise
    /// returns immediately. The queue lock is never held while an action
    /// runs.
    pub fn run(&self, block: bool) {
        loop {
            let step = {
                let mut queue = self.queue.lock();
                match queue.peek() {
                    None => Step::Done,
                    Some(Reverse(head)) => {
                        let now = self.ticker.now_nanos();
                        if head.due_nanos <= now {
                            match queue.pop() {
                                Some(Reverse(event)) => Step::Run(event),
                                None => Step::Done,
                            }
                        } else {
                            Step::Wait(head.due_nanos - now)
                        }
                    },
                }
            };
            match step {
                Step::Done => return,
                Step::Run(event) => {
                    let started = self.ticker.now_nanos();
                    (event.action)();
                    if let Some(stats) = self.statistics.lock().as_ref() {
                        stats
                            .total_scheduler_runs
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        stats.total_scheduler_run_millis.fetch_add(
                            self.ticker.now_nanos().saturating_sub(started) / 1_000_000,
                            std::sync::atomic::Ordering::Relaxed,
                        );
                    }
                },
                Step::Wait(gap_nanos) => {
                    let gap_millis = gap_nanos / 1_000_000;
                    if let Some(stats) = self.statistics.lock().as_ref() {
                        stats
                            .total_scheduler_skips
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        stats
                            .total_scheduler_skip_millis
                            .fetch_add(gap_millis, std::sync::atomic::Ordering::Relaxed);
                    }
                    if !block {
                        tracing::debug!(gap_millis, "scheduler not blocking, next event in future");
                        return;
                    }
                    let _ = self.nudge_rx.recv_timeout(Duration::from_nanos(gap_nanos));
                },
            }
        }
    }

    /// Runs until the queue is empty, sleeping between due times.
    pub fn run_blocking(&self) {
        self.run(true);
    }
}
