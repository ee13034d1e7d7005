//! # Fixed-Interval Poller
//!
//! A self-scheduling loop for REST-style sources that offer no streaming
//! interface. Each `PollSession` runs on its own task and alternates between
//! invoking the operation and sleeping.
//!
//! ## Key Design Principles:
//! - **No Overlap**: the sleep starts only after the operation settles, so at
//!   most one call is in flight per session no matter how slow the source is.
//! - **Non-Fatal Failures**: a failed tick is handed to the error sink and the
//!   loop moves on to the next tick.
//! - **Predicate Cancellation**: the stop predicate is evaluated before every
//!   tick and is the only way to end a session. An operation already in flight
//!   always runs to completion.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};

/// Lifecycle of a `PollSession`. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Created, first tick not yet started.
    Idle,
    /// The loop is running.
    Polling,
    /// The loop has exited and will never tick again.
    Stopped,
}

/// Why a session reached `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The stop predicate returned `true`.
    Predicate,
    /// The item receiver was dropped, so results had nowhere to go.
    ReceiverClosed,
}

/// Counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    /// Number of times the operation was invoked.
    pub invocations: u64,
    /// Number of invocations that returned an error.
    pub failures: u64,
}

/// Final report returned by [`PollSession::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    /// Why the loop ended.
    pub reason: StopReason,
    /// Counters at the time the loop ended.
    pub stats: PollStats,
}

/// A failed tick, as delivered to the error sink.
#[derive(Debug)]
pub struct TickError<E> {
    /// 1-based tick number.
    pub tick: u64,
    /// The error the operation returned.
    pub error: E,
}

/// # Stop Flag
///
/// A shared boolean that backs a side-effect free stop predicate. Clones
/// observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    /// A flag that is not yet set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag. Sessions stop before their next tick.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Pure query of the flag.
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// A predicate suitable for [`Poller::start`].
    pub fn predicate(&self) -> impl Fn() -> bool + Send + 'static {
        let flag = self.clone();
        move || flag.is_stopped()
    }
}

#[derive(Default)]
struct Counters {
    invocations: AtomicU64,
    failures: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PollStats {
        PollStats {
            invocations: self.invocations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// # Poller
///
/// Factory for poll sessions sharing an interval and an item-queue capacity.
#[derive(Debug, Clone)]
pub struct Poller {
    interval: Duration,
    capacity: usize,
}

impl Poller {
    /// Interval used by the reference deployment.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(5000);

    /// Creates a poller. A zero interval is raised to one millisecond so the
    /// loop always yields between ticks.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            capacity: 16,
        }
    }

    /// Sets the capacity of the item queue handed back by `start`. A full queue
    /// delays the next tick until the consumer catches up.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// The delay between the end of one tick and the start of the next.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// # Start
    ///
    /// Spawns a new session. The first tick runs immediately.
    ///
    /// ## Workflow per tick:
    /// 1.  Evaluate `should_stop`; exit with `StopReason::Predicate` if it holds.
    /// 2.  Invoke `operation` and await it.
    /// 3.  On success, push the item onto the returned receiver. A dropped
    ///     receiver ends the session with `StopReason::ReceiverClosed`.
    /// 4.  On failure, hand a [`TickError`] to `error_sink`.
    /// 5.  Sleep for the interval.
    pub fn start<T, E, Op, Fut, Stop, Sink>(
        &self,
        mut operation: Op,
        should_stop: Stop,
        mut error_sink: Sink,
    ) -> (PollSession, mpsc::Receiver<T>)
    where
        T: Send + 'static,
        E: Send + 'static,
        Op: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        Stop: Fn() -> bool + Send + 'static,
        Sink: FnMut(TickError<E>) + Send + 'static,
    {
        let (items_tx, items_rx) = mpsc::channel(self.capacity);
        let (state_tx, state_rx) = watch::channel(PollState::Idle);
        let counters = Arc::new(Counters::default());
        let interval = self.interval;

        let task_counters = Arc::clone(&counters);
        let handle = tokio::spawn(async move {
            state_tx.send_replace(PollState::Polling);
            let mut tick: u64 = 0;

            let reason = loop {
                if should_stop() {
                    break StopReason::Predicate;
                }

                tick += 1;
                task_counters.invocations.fetch_add(1, Ordering::Relaxed);

                match operation().await {
                    Ok(item) => {
                        if items_tx.send(item).await.is_err() {
                            log::warn!("Poll session item receiver dropped after tick {}. Stopping.", tick);
                            break StopReason::ReceiverClosed;
                        }
                    }
                    Err(error) => {
                        task_counters.failures.fetch_add(1, Ordering::Relaxed);
                        error_sink(TickError { tick, error });
                    }
                }

                tokio::time::sleep(interval).await;
            };

            state_tx.send_replace(PollState::Stopped);
            log::info!("Poll session stopped after {} tick(s): {:?}", tick, reason);
            reason
        });

        let session = PollSession {
            interval,
            state: state_rx,
            counters,
            handle,
        };
        (session, items_rx)
    }
}

/// # Poll Session
///
/// Handle to one running loop. Dropping the handle does not stop the loop;
/// use the stop predicate for that.
pub struct PollSession {
    interval: Duration,
    state: watch::Receiver<PollState>,
    counters: Arc<Counters>,
    handle: JoinHandle<StopReason>,
}

impl PollSession {
    /// Current lifecycle state.
    pub fn state(&self) -> PollState {
        *self.state.borrow()
    }

    /// The interval this session was started with.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Counters so far.
    pub fn stats(&self) -> PollStats {
        self.counters.snapshot()
    }

    /// Resolves once the session reaches `Stopped`.
    pub async fn stopped(&mut self) {
        // The sender lives inside the task and publishes `Stopped` before it
        // exits, so a closed channel also means the loop is gone.
        let _ = self.state.wait_for(|state| *state == PollState::Stopped).await;
    }

    /// Waits for the loop to exit and returns its final report.
    pub async fn join(self) -> Result<PollOutcome, JoinError> {
        let reason = self.handle.await?;
        Ok(PollOutcome {
            reason,
            stats: self.counters.snapshot(),
        })
    }
}
