use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Allows `max_requests` per `window`; the count resets when a window ends.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    window: Duration,
    max_requests: u32,
    state: Mutex<Window>,
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

impl FixedWindowLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            state: Mutex::new(Window {
                started: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Take one slot in the current window.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&self, now: Instant) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return true;
        };

        if now.saturating_duration_since(state.started) >= self.window {
            state.started = now;
            state.count = 0;
        }

        if state.count >= self.max_requests {
            return false;
        }
        state.count += 1;
        true
    }

    /// Time until the current window ends.
    pub fn retry_after(&self) -> Duration {
        self.state
            .lock()
            .map(|s| self.window.saturating_sub(s.started.elapsed()))
            .unwrap_or_default()
    }
}
