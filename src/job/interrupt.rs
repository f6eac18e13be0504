//! Cooperative cancellation of a running job.
//!
//! A stop request cancels the run's token and then waits for the body to
//! notice. Bodies notice by polling `JobContext::is_cancelled`, which moves
//! the state to `Acknowledged`; returning moves it to `Cancelled`. A body that
//! outlives every retry stays armed so that the next request tries again.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptState {
    /// No stop was requested for the current run.
    Idle,
    Requested { attempts: u32 },
    /// The body observed the request and is winding down.
    Acknowledged,
    /// The body returned after the request.
    Cancelled,
    /// The body survived every retry; the next request tries again.
    StillRunning,
}

/// Interrupt state of one run, shared between the run and whoever stops it.
pub struct InterruptCell {
    state: Mutex<InterruptState>,
    changed: Condvar,
}

impl InterruptCell {
    fn new() -> Self {
        Self {
            state: Mutex::new(InterruptState::Idle),
            changed: Condvar::new(),
        }
    }

    pub fn state(&self) -> InterruptState {
        *self.state.lock().unwrap()
    }

    fn transition(&self, f: impl FnOnce(InterruptState) -> InterruptState) -> InterruptState {
        let mut state = self.state.lock().unwrap();
        *state = f(*state);
        self.changed.notify_all();
        *state
    }

    pub(crate) fn acknowledge(&self) {
        self.transition(|state| match state {
            InterruptState::Requested { .. } | InterruptState::StillRunning => {
                InterruptState::Acknowledged
            }
            other => other,
        });
    }

    fn request(&self, attempts: u32) {
        self.transition(|state| match state {
            InterruptState::Cancelled | InterruptState::Acknowledged => state,
            _ => InterruptState::Requested { attempts },
        });
    }

    fn finish(&self) {
        self.transition(|state| match state {
            InterruptState::Idle => InterruptState::Idle,
            _ => InterruptState::Cancelled,
        });
    }

    /// Waits up to `timeout` for the run to finish.
    fn wait_for_finish(&self, timeout: Duration) -> InterruptState {
        let state = self.state.lock().unwrap();
        let (state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |s| *s != InterruptState::Cancelled)
            .unwrap();
        *state
    }
}

struct RunHandle {
    token: CancellationToken,
    cell: Arc<InterruptCell>,
}

/// Tracks the current run of one job and stops it on request.
pub struct Interrupter {
    current: Mutex<Option<RunHandle>>,
    max_retries: AtomicU32,
    poll: Duration,
}

impl Interrupter {
    pub fn new(max_retries: u32, poll: Duration) -> Self {
        Self {
            current: Mutex::new(None),
            max_retries: AtomicU32::new(max_retries),
            poll,
        }
    }

    pub fn set_max_retries(&self, max_retries: u32) {
        self.max_retries.store(max_retries, Ordering::Relaxed);
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.load(Ordering::Relaxed)
    }

    /// Arms a new run. The token is a child of `parent`, so shutdown reaches it.
    pub(crate) fn begin(&self, parent: &CancellationToken) -> (CancellationToken, Arc<InterruptCell>) {
        let token = parent.child_token();
        let cell = Arc::new(InterruptCell::new());
        *self.current.lock().unwrap() = Some(RunHandle {
            token: token.clone(),
            cell: cell.clone(),
        });
        (token, cell)
    }

    pub(crate) fn end(&self, cell: &Arc<InterruptCell>) {
        cell.finish();
        let mut current = self.current.lock().unwrap();
        if current
            .as_ref()
            .is_some_and(|run| Arc::ptr_eq(&run.cell, cell))
        {
            *current = None;
        }
    }

    pub fn is_running(&self) -> bool {
        self.current.lock().unwrap().is_some()
    }

    /// Cancels the current run's token without waiting.
    pub fn request_cancel(&self) -> bool {
        match self.current.lock().unwrap().as_ref() {
            Some(run) => {
                run.cell.request(1);
                run.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stops the current run, blocking for up to `max_retries` poll periods.
    pub fn interrupt(&self) -> InterruptState {
        let Some(run) = self.current.lock().unwrap().take() else {
            warn!("No running execution to interrupt");
            return InterruptState::Idle;
        };

        let retries = self.max_retries().max(1);
        for attempt in 1..=retries {
            run.cell.request(attempt);
            run.token.cancel();
            if run.cell.wait_for_finish(self.poll) == InterruptState::Cancelled {
                info!("Execution stopped after {} attempt(s)", attempt);
                return InterruptState::Cancelled;
            }
        }

        // still alive: keep it armed for the next stop request
        let state = run.cell.transition(|state| match state {
            InterruptState::Requested { .. } => InterruptState::StillRunning,
            other => other,
        });
        if state != InterruptState::Cancelled {
            let mut current = self.current.lock().unwrap();
            if current.is_none() {
                *current = Some(run);
            }
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_interrupt_without_run_is_idle() {
        let interrupter = Interrupter::new(1, Duration::from_millis(10));
        assert_eq!(interrupter.interrupt(), InterruptState::Idle);
        assert!(!interrupter.request_cancel());
    }

    #[test]
    fn test_cooperative_body_is_cancelled() {
        let interrupter = Arc::new(Interrupter::new(3, Duration::from_millis(200)));
        let (token, cell) = interrupter.begin(&CancellationToken::new());

        let runner = {
            let interrupter = interrupter.clone();
            thread::spawn(move || {
                while !token.is_cancelled() {
                    thread::sleep(Duration::from_millis(5));
                }
                cell.acknowledge();
                interrupter.end(&cell);
            })
        };

        assert_eq!(interrupter.interrupt(), InterruptState::Cancelled);
        runner.join().unwrap();
        assert!(!interrupter.is_running());
    }

    #[test]
    fn test_stubborn_body_is_rearmed() {
        let interrupter = Interrupter::new(2, Duration::from_millis(10));
        let (token, cell) = interrupter.begin(&CancellationToken::new());

        assert_eq!(interrupter.interrupt(), InterruptState::StillRunning);
        assert!(token.is_cancelled());
        // re-armed: a later request still finds the run
        assert!(interrupter.is_running());

        cell.acknowledge();
        assert_eq!(cell.state(), InterruptState::Acknowledged);
        interrupter.end(&cell);
        assert_eq!(cell.state(), InterruptState::Cancelled);
        assert!(!interrupter.is_running());
    }

    #[test]
    fn test_parent_cancellation_reaches_run() {
        let interrupter = Interrupter::new(1, Duration::from_millis(10));
        let shutdown = CancellationToken::new();
        let (token, _cell) = interrupter.begin(&shutdown);
        shutdown.cancel();
        assert!(token.is_cancelled());
    }
}
