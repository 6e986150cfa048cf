//! A re-entrant, token-keyed counting semaphore (component C2).
//!
//! SQLite only allows one write transaction at a time, but the connection
//! actor needs nested transactions to work from within a single logical
//! operation (a `save` that itself calls `save` on related objects). A plain
//! mutex would deadlock the moment the same caller tried to enter a second
//! `SAVEPOINT` while already holding the first. Keying the hold on an opaque
//! `token` lets the same caller re-enter for free while every other token
//! still blocks until the holder's outermost transaction releases it.

use std::sync::{Condvar, Mutex};

struct State {
    holder: Option<u64>,
    depth: u32,
}

/// A counting semaphore with exactly one critical section, re-entrant for
/// whichever token currently holds it.
pub struct ReentrantSemaphore {
    state: Mutex<State>,
    condvar: Condvar,
}

impl ReentrantSemaphore {
    pub fn new() -> Self {
        ReentrantSemaphore {
            state: Mutex::new(State { holder: None, depth: 0 }),
            condvar: Condvar::new(),
        }
    }

    /// Block until `token` holds the critical section, entering one level
    /// deeper if it already does. Waiters for other tokens are served in the
    /// rough order the OS wakes blocked threads in (best effort, not a
    /// strict FIFO queue — this crate never cancels a waiter, so starvation
    /// would require a pathological caller that never releases).
    pub fn wait(&self, token: u64) {
        let mut state = self.state.lock().unwrap();
        loop {
            match state.holder {
                Some(holder) if holder == token => {
                    state.depth += 1;
                    return;
                }
                None => {
                    state.holder = Some(token);
                    state.depth = 1;
                    return;
                }
                Some(_) => {
                    state = self.condvar.wait(state).unwrap();
                }
            }
        }
    }

    /// Release one level of `token`'s hold. Once depth reaches zero the
    /// critical section is free and every waiter is woken to race for it.
    ///
    /// Panics if `token` does not currently hold the section — that would
    /// mean a caller signaled without a matching `wait`, a programming
    /// error in this crate rather than a condition callers can trigger.
    pub fn signal(&self, token: u64) {
        let mut state = self.state.lock().unwrap();
        assert_eq!(state.holder, Some(token), "signal from a token that isn't holding the semaphore");
        state.depth -= 1;
        if state.depth == 0 {
            state.holder = None;
            self.condvar.notify_all();
        }
    }

    /// Current re-entrancy depth for `token`, `0` if it doesn't hold the
    /// section. Used by the database actor to decide whether it's entering
    /// an outermost transaction (and must issue `BEGIN`) or a nested one
    /// (issues a named `SAVEPOINT` instead).
    pub fn depth_for(&self, token: u64) -> u32 {
        let state = self.state.lock().unwrap();
        if state.holder == Some(token) {
            state.depth
        } else {
            0
        }
    }
}

impl Default for ReentrantSemaphore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn same_token_reenters_without_blocking() {
        let sem = ReentrantSemaphore::new();
        sem.wait(1);
        sem.wait(1);
        assert_eq!(sem.depth_for(1), 2);
        sem.signal(1);
        assert_eq!(sem.depth_for(1), 1);
        sem.signal(1);
        assert_eq!(sem.depth_for(1), 0);
    }

    #[test]
    fn other_token_blocks_until_released() {
        let sem = Arc::new(ReentrantSemaphore::new());
        sem.wait(1);

        let sem2 = sem.clone();
        let handle = thread::spawn(move || {
            sem2.wait(2);
            sem2.signal(2);
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(sem.depth_for(2), 0, "token 2 must still be waiting");

        sem.signal(1);
        handle.join().unwrap();
    }

    #[test]
    #[should_panic]
    fn signal_without_wait_panics() {
        let sem = ReentrantSemaphore::new();
        sem.signal(1);
    }
}
