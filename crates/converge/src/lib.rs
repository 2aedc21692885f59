//! kform converge: block a lifecycle call until the remote system's observed
//! state matches what was submitted, or the operation's budget runs out.
//!
//! The waiter is a three-state machine. It starts in `Polling`; every tick
//! reads the observed status and classifies it:
//!
//! - read error: `Failed`, returned as-is (never assumed transient)
//! - converged: `Converged`
//! - pending: stay in `Polling`, sleep with exponential backoff, retry until
//!   the deadline, then `Failed` with [`Error::Timeout`]

#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use kform_core::{Error, Progress, Result};
use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    /// Wall-clock budget for the whole wait.
    pub timeout: Duration,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl WaitOptions {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, initial_interval: DEFAULT_INITIAL_INTERVAL, max_interval: DEFAULT_MAX_INTERVAL }
    }

    pub fn with_intervals(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_interval = initial;
        self.max_interval = max.max(initial);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    Polling,
    Converged,
    Failed,
}

/// Classification of a single status read.
#[derive(Debug)]
pub enum Poll<T> {
    Converged(T),
    Pending(Progress),
    Failed(Error),
}

pub fn classify<T>(status: Result<T>, check: impl Fn(&T) -> Progress) -> Poll<T> {
    match status {
        Err(e) => Poll::Failed(e),
        Ok(obs) => {
            let progress = check(&obs);
            if progress.converged() {
                Poll::Converged(obs)
            } else {
                Poll::Pending(progress)
            }
        }
    }
}

#[derive(Debug)]
pub struct Waiter {
    opts: WaitOptions,
    state: WaitState,
    polls: u32,
    last: Option<Progress>,
}

impl Waiter {
    pub fn new(opts: WaitOptions) -> Self {
        Self { opts, state: WaitState::Polling, polls: 0, last: None }
    }

    pub fn state(&self) -> WaitState {
        self.state
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }

    /// Poll `get_status` until `check` reports convergence. Returns the
    /// converged observation.
    pub async fn run<T, F, Fut, C>(&mut self, what: &str, mut get_status: F, check: C) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&T) -> Progress,
    {
        let started = Instant::now();
        let deadline = started + self.opts.timeout;
        let mut interval = self.opts.initial_interval;
        loop {
            self.polls += 1;
            counter!("converge_polls_total", 1u64);
            match classify(get_status().await, &check) {
                Poll::Converged(obs) => {
                    self.state = WaitState::Converged;
                    histogram!("converge_wait_ms", started.elapsed().as_secs_f64() * 1000.0);
                    debug!(what, polls = self.polls, "converged");
                    return Ok(obs);
                }
                Poll::Failed(e) => {
                    self.state = WaitState::Failed;
                    debug!(what, polls = self.polls, error = %e, "status read failed");
                    return Err(e);
                }
                Poll::Pending(progress) => {
                    self.last = Some(progress);
                    debug!(what, observed = progress.observed, desired = progress.desired, "waiting for convergence");
                    let now = Instant::now();
                    if now >= deadline {
                        self.state = WaitState::Failed;
                        counter!("converge_timeouts_total", 1u64);
                        return Err(Error::Timeout { what: what.to_string(), timeout: self.opts.timeout, last: self.last });
                    }
                    tokio::time::sleep(interval.min(deadline - now)).await;
                    interval = (interval * 2).min(self.opts.max_interval);
                }
            }
        }
    }
}

/// Convenience wrapper around [`Waiter::run`].
pub async fn wait_for_convergence<T, F, Fut, C>(what: &str, get_status: F, check: C, opts: WaitOptions) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    C: Fn(&T) -> Progress,
{
    Waiter::new(opts).run(what, get_status, check).await
}
