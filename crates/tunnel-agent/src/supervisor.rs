//! Keep-alive supervisor: runs a long-lived function forever, catching any
//! panic and pacing restarts with burst-aware backoff.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tracing::error;

use crate::error::{AgentError, AgentResult};

const FAILURE_WINDOW_CAPACITY: usize = 5;
const BURST_SPAN: Duration = Duration::from_secs(5);
const BURST_RECENCY: Duration = Duration::from_secs(11);
const BURST_COOLDOWN: Duration = Duration::from_secs(10);
const NORMAL_BACKOFF: Duration = Duration::from_secs(1);

/// Fixed-capacity ring of the last [`FAILURE_WINDOW_CAPACITY`] failure
/// timestamps, used to classify a failure as isolated or part of a burst.
struct FailureWindow {
    slots: [Option<Instant>; FAILURE_WINDOW_CAPACITY],
}

impl FailureWindow {
    fn new() -> Self {
        Self {
            slots: [None; FAILURE_WINDOW_CAPACITY],
        }
    }

    fn record(&mut self, now: Instant) {
        self.slots.rotate_left(1);
        self.slots[FAILURE_WINDOW_CAPACITY - 1] = Some(now);
    }

    /// All five slots populated, the oldest-to-newest span under 5s, and the
    /// two most recent failures within 11s of each other. The thresholds
    /// are deliberately asymmetric: a single slow failure never triggers
    /// extra wait, only a sustained high-frequency burst does.
    fn is_bursting(&self) -> bool {
        let oldest = self.slots[0];
        let second_newest = self.slots[FAILURE_WINDOW_CAPACITY - 2];
        let newest = self.slots[FAILURE_WINDOW_CAPACITY - 1];

        match (oldest, second_newest, newest) {
            (Some(oldest), Some(second_newest), Some(newest)) => {
                newest.duration_since(oldest) < BURST_SPAN
                    && newest.duration_since(second_newest) < BURST_RECENCY
            }
            _ => false,
        }
    }

    fn backoff(&self) -> Duration {
        if self.is_bursting() {
            BURST_COOLDOWN
        } else {
            NORMAL_BACKOFF
        }
    }
}

/// Run `run` under a fault barrier, converting any unrecovered panic into
/// an [`AgentError::UnknownFault`].
async fn run_under_barrier<Fut>(fut: Fut) -> AgentResult<()>
where
    Fut: Future<Output = AgentResult<()>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(AgentError::UnknownFault(panic_message(&panic))),
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Keep `make_run` alive forever: invoke it under the fault barrier, and on
/// any failure record the timestamp, log it, and sleep for a
/// burst-classified backoff before looping.
///
/// `make_run` is called once per iteration, freshly producing the future to
/// run — this lets callers close over mutable state (e.g. the current
/// `SecureChannel`) without fighting borrowck across iterations.
pub async fn keepalive<F, Fut>(mut make_run: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AgentResult<()>>,
{
    let mut window = FailureWindow::new();
    loop {
        if let Err(e) = run_under_barrier(make_run()).await {
            window.record(Instant::now());
            error!(error = %e, "supervised pipeline failed");
            tokio::time::sleep(window.backoff()).await;
        }
    }
}
