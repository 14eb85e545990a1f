//! Timer callbacks behind a `Scheduler` trait (design note, spec §9), so the
//! lease-deadline timer (§4.4) and the cleanup sweep's periodic tick (§4.8)
//! can be driven deterministically in tests instead of racing real time.

use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pubsub_support::cancel::CancellationToken;

/// Handle to a scheduled callback. Dropping it does *not* cancel the timer —
/// call `cancel()` explicitly, matching the lease/subscriber cancellation
/// discipline elsewhere in this crate (cancellation is always an explicit
/// act paired with state removal, never implicit on drop).
#[derive(Clone, Debug)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

pub trait Scheduler: Send + Sync + Debug {
    /// Run `callback` once after `delay`, unless the returned handle is
    /// cancelled first.
    fn schedule_once(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) -> TimerHandle;

    /// Run `callback` every `period`, starting one `period` from now, until
    /// the returned handle is cancelled.
    fn schedule_interval(&self, period: Duration, callback: Arc<dyn Fn() + Send + Sync>) -> TimerHandle;

    /// Monotonic time since this scheduler was constructed. All of the
    /// broker's internal timestamps (lease deadlines, backoff
    /// availability, publish time, retention cutoffs) are expressed in
    /// this clock rather than wall-clock time, so that a `ManualScheduler`
    /// can drive every time-dependent code path deterministically.
    fn now(&self) -> Duration;
}

/// Production scheduler backed by `tokio::time`.
#[derive(Debug)]
pub struct TokioScheduler {
    start: std::time::Instant,
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_once(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => callback(),
            }
        });
        TimerHandle::new(token)
    }

    fn schedule_interval(&self, period: Duration, callback: Arc<dyn Fn() + Send + Sync>) -> TimerHandle {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // the first tick fires immediately; consume it
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => callback(),
                }
            }
        });
        TimerHandle::new(token)
    }

    fn now(&self) -> Duration {
        self.start.elapsed()
    }
}

struct PendingOnce {
    deadline: Duration,
    seq: u64,
    token: CancellationToken,
    callback: Option<Box<dyn FnOnce() + Send>>,
}

struct PendingInterval {
    period: Duration,
    next: Duration,
    token: CancellationToken,
    callback: Arc<dyn Fn() + Send + Sync>,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    seq: u64,
    once: Vec<PendingOnce>,
    intervals: Vec<PendingInterval>,
}

/// Test-only scheduler: no real sleeping. `advance(duration)` moves the
/// virtual clock forward and synchronously fires every callback whose
/// deadline has passed (in deadline order, oldest first).
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualScheduler").finish()
    }
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the virtual clock forward and run every callback now due, in
    /// deadline order. Interval callbacks that fell behind (e.g. a single
    /// large `advance` spanning several periods) fire once per elapsed
    /// period, oldest first.
    pub fn advance(&self, by: Duration) {
        let mut due: Vec<(Duration, u64, Box<dyn FnOnce() + Send>)> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.now += by;
            let now = state.now;

            state.once.retain_mut(|pending| {
                if pending.token.is_cancelled() {
                    return false;
                }
                if pending.deadline <= now {
                    if let Some(callback) = pending.callback.take() {
                        due.push((pending.deadline, pending.seq, callback));
                    }
                    false
                } else {
                    true
                }
            });

            for interval in state.intervals.iter_mut() {
                if interval.token.is_cancelled() {
                    continue;
                }
                while interval.next <= now {
                    let callback = interval.callback.clone();
                    let deadline = interval.next;
                    let seq = {
                        state.seq += 1;
                        state.seq
                    };
                    due.push((deadline, seq, Box::new(move || callback())));
                    interval.next += interval.period;
                }
            }
        }
        due.sort_by_key(|(deadline, seq, _)| (*deadline, *seq));
        for (_, _, callback) in due {
            callback();
        }
    }

}

impl Scheduler for ManualScheduler {
    fn schedule_once(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let mut state = self.state.lock().unwrap();
        let deadline = state.now + delay;
        state.seq += 1;
        let token = CancellationToken::new();
        state.once.push(PendingOnce {
            deadline,
            seq: state.seq,
            token: token.clone(),
            callback: Some(callback),
        });
        TimerHandle::new(token)
    }

    fn schedule_interval(&self, period: Duration, callback: Arc<dyn Fn() + Send + Sync>) -> TimerHandle {
        let mut state = self.state.lock().unwrap();
        let next = state.now + period;
        let token = CancellationToken::new();
        state.intervals.push(PendingInterval {
            period,
            next,
            token: token.clone(),
            callback,
        });
        TimerHandle::new(token)
    }

    fn now(&self) -> Duration {
        self.state.lock().unwrap().now
    }
}
