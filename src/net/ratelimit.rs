//! Pacing of outgoing requests.
//!
//! A [`RateLimiter`] hands out permission to send in ticks. Each tick
//! allows a fixed number of requests. Requests beyond that wait for a
//! later tick in the order they arrived. A low rate uses short ticks of a
//! single request each. A high rate uses ticks of ten requests so that
//! the timer doesn't have to fire too often.

use core::time::Duration;
use parking_lot::Mutex;
use tokio::time::{sleep_until, Instant};

//------------ RateLimiter ---------------------------------------------------

#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    /// The length of a tick. `None` means no limit.
    interval: Option<Duration>,

    /// How many requests a tick allows.
    per_tick: u32,

    /// The start of the tick the last request was scheduled into.
    tick: Option<Instant>,

    /// How many requests the tick has been used for.
    used: u32,
}

impl RateLimiter {
    /// Creates a limiter for the given number of requests per second.
    ///
    /// A rate of zero means unlimited.
    pub fn new(rate: u32) -> Self {
        let (interval, per_tick) = Self::tick_for_rate(rate);
        RateLimiter {
            state: Mutex::new(State {
                interval,
                per_tick,
                tick: None,
                used: 0,
            }),
        }
    }

    /// Changes the rate.
    ///
    /// Requests already waiting keep the slot they were given.
    pub fn set_rate(&self, rate: u32) {
        let (interval, per_tick) = Self::tick_for_rate(rate);
        let mut state = self.state.lock();
        state.interval = interval;
        state.per_tick = per_tick;
    }

    /// Returns the length of a tick and the requests allowed per tick.
    pub fn tick_for_rate(rate: u32) -> (Option<Duration>, u32) {
        match rate {
            0 => (None, 1),
            1 => (Some(Duration::from_secs(1)), 1),
            2..=10 => (Some(Duration::from_nanos(1_000_000_000 / u64::from(rate))), 1),
            _ => (
                Some(Duration::from_nanos(
                    (1_000_000_000 / u64::from(rate)) * 10,
                )),
                10,
            ),
        }
    }

    /// Returns the instant at which the next request may be sent.
    ///
    /// The slot is reserved for the caller.
    pub fn reserve(&self) -> Instant {
        let now = Instant::now();
        let mut state = self.state.lock();
        let Some(interval) = state.interval else {
            return now;
        };
        match state.tick {
            // The latest tick hasn't passed yet.
            Some(tick) if tick + interval > now => {
                if state.used < state.per_tick {
                    state.used += 1;
                    tick
                } else {
                    let next = tick + interval;
                    state.tick = Some(next);
                    state.used = 1;
                    next
                }
            }
            _ => {
                state.tick = Some(now);
                state.used = 1;
                now
            }
        }
    }

    /// Waits until a request may be sent.
    pub async fn acquire(&self) {
        let when = self.reserve();
        if when > Instant::now() {
            sleep_until(when).await
        }
    }
}

//============ Testing =======================================================
