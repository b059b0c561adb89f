//! Sliding one-minute dispatch budget.

use crate::config::RateLimitConfig;
use haven_types::Timestamp;
use std::collections::VecDeque;
use std::time::Duration;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    max_per_window: usize,
    sent: VecDeque<Timestamp>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_per_window: config.max_operations_per_minute as usize,
            sent: VecDeque::new(),
        }
    }

    fn expire(&mut self, now: Timestamp) {
        while let Some(oldest) = self.sent.front() {
            if now.saturating_duration_since(*oldest) >= WINDOW {
                self.sent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Takes one slot if the window has room.
    pub fn try_acquire(&mut self, now: Timestamp) -> bool {
        if !self.enabled {
            return true;
        }
        self.expire(now);
        if self.sent.len() >= self.max_per_window {
            return false;
        }
        self.sent.push_back(now);
        true
    }

    /// Slots left in the current window.
    pub fn remaining(&mut self, now: Timestamp) -> usize {
        if !self.enabled {
            return usize::MAX;
        }
        self.expire(now);
        self.max_per_window.saturating_sub(self.sent.len())
    }

    /// When the next slot frees up, or `None` if one is free now.
    pub fn next_slot(&mut self, now: Timestamp) -> Option<Timestamp> {
        if self.remaining(now) > 0 {
            return None;
        }
        self.sent.front().map(|oldest| oldest.saturating_add(WINDOW))
    }
}
