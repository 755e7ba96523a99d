// Copyright (c) Facebook, Inc. and its affiliates.

//! Cooperative cancellation shared between a controlling thread and the
//! periodic loops it spawned.
//!
//! A loop sleeps through `CancelToken::wait()` instead of `thread::sleep()`
//! so that `cancel()` wakes it up immediately. Work which is already in
//! progress is never interrupted; the loop observes cancellation at its next
//! wait.
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct CancelState {
    cancelled: Mutex<bool>,
    waitq: Condvar,
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn cancel(&self) {
        *self.state.cancelled.lock().unwrap() = true;
        self.state.waitq.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.cancelled.lock().unwrap()
    }

    /// Sleep for `dur` or until cancelled, whichever comes first. Returns
    /// whether the token is cancelled.
    pub fn wait(&self, dur: Duration) -> bool {
        let deadline = Instant::now() + dur;
        let mut cancelled = self.state.cancelled.lock().unwrap();
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            cancelled = self
                .state
                .waitq
                .wait_timeout(cancelled, deadline - now)
                .unwrap()
                .0;
        }
        *cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::CancelToken;
    use std::thread::{sleep, spawn};
    use std::time::{Duration, Instant};

    #[test]
    fn test_wait_times_out() {
        let _ = ::env_logger::try_init();
        let token = CancelToken::new();
        let started_at = Instant::now();
        assert!(!token.wait(Duration::from_millis(50)));
        assert!(started_at.elapsed() >= Duration::from_millis(50));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let _ = ::env_logger::try_init();
        let token = CancelToken::new();
        let waiter = token.clone();
        let jh = spawn(move || {
            let started_at = Instant::now();
            let cancelled = waiter.wait(Duration::from_secs(60));
            (cancelled, started_at.elapsed())
        });

        sleep(Duration::from_millis(50));
        token.cancel();
        let (cancelled, waited) = jh.join().unwrap();
        println!("waited {:?}", waited);
        assert!(cancelled);
        assert!(waited < Duration::from_secs(10));

        // Stays cancelled.
        assert!(token.wait(Duration::from_secs(60)));
    }
}
