//! Zone timers.
//!
//! Every zone keeps a number of independent deadlines. Only one timer per
//! zone actually runs, armed for the earliest deadline that is active
//! given the zone's type and state. When it fires, the zone's maintenance
//! looks at all deadlines again and re-arms the timer.
//!
//! Deadlines use the monotonic clock of the runtime so that tests can
//! pause and advance time.

use super::flags::ZoneFlags;
use crate::base::rdata::Soa;
use crate::base::time::UnixTime;
use crate::config::{
    ZoneConfig, ZoneType, DEFAULT_REFRESH, DEFAULT_RETRY, MAX_EXPIRE,
};
use core::time::Duration;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;

/// The longest retry interval reached by backing off.
pub const MAX_BACKOFF_RETRY: u32 = 6 * 3600;

//------------ Timers --------------------------------------------------------

/// The deadlines of a zone. `None` means inactive.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Timers {
    /// Next SOA check. After a failed check this is the retry time.
    pub refresh: Option<Instant>,
    pub expire: Option<Instant>,
    pub dump: Option<Instant>,
    pub notify: Option<Instant>,
    pub resign: Option<Instant>,
    pub key_warn: Option<Instant>,
    pub signing: Option<Instant>,
    pub nsec3chain: Option<Instant>,
    pub refresh_key: Option<Instant>,
    pub rekey: Option<Instant>,
}

impl Timers {
    /// Returns the deadline the zone timer should be armed for.
    ///
    /// Which deadlines are considered depends on the zone type and its
    /// flags. A redirect zone behaves like a slave zone if it has masters
    /// and like a master zone otherwise. Deadlines in the past are
    /// returned as `now`.
    pub fn next(
        &self,
        zone_type: ZoneType,
        has_masters: bool,
        flags: ZoneFlags,
        now: Instant,
    ) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut consider = |when: Option<Instant>| {
            if let Some(when) = when {
                next = Some(next.map_or(when, |next| next.min(when)));
            }
        };
        let zone_type = match zone_type {
            ZoneType::Redirect if has_masters => ZoneType::Slave,
            ZoneType::Redirect => ZoneType::Master,
            other => other,
        };
        let dump_active = flags.contains(ZoneFlags::NEEDDUMP)
            && !flags.contains(ZoneFlags::DUMPING);
        match zone_type {
            ZoneType::Master => {
                if flags.contains(ZoneFlags::NEEDNOTIFY) {
                    consider(self.notify);
                }
                if dump_active {
                    consider(self.dump);
                }
                consider(self.refresh_key);
                consider(self.key_warn);
                // A running quantum re-arms the timer when it is done.
                if !flags.contains(ZoneFlags::SIGNING) {
                    consider(self.rekey);
                    consider(self.resign);
                    consider(self.signing);
                    consider(self.nsec3chain);
                }
            }
            ZoneType::Slave | ZoneType::Stub => {
                if zone_type == ZoneType::Slave
                    && flags.contains(ZoneFlags::NEEDNOTIFY)
                {
                    consider(self.notify);
                }
                let refresh_blocked = flags.intersects(
                    ZoneFlags::REFRESH
                        | ZoneFlags::NOREFRESH
                        | ZoneFlags::LOADING,
                );
                if has_masters && !refresh_blocked {
                    consider(self.refresh);
                }
                if flags.contains(ZoneFlags::LOADED) {
                    consider(self.expire);
                }
                if dump_active {
                    consider(self.dump);
                }
            }
            ZoneType::Key => {
                consider(self.refresh_key);
                if dump_active {
                    consider(self.dump);
                }
            }
            ZoneType::Redirect => {}
        }
        next.map(|next| next.max(now))
    }
}

//------------ SoaTimers -----------------------------------------------------

/// Refresh timing learned from an SOA record, in seconds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SoaTimers {
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
}

impl Default for SoaTimers {
    fn default() -> Self {
        SoaTimers {
            refresh: DEFAULT_REFRESH,
            retry: DEFAULT_RETRY,
            expire: 0,
        }
    }
}

impl SoaTimers {
    /// Takes the timers from an SOA, clamped to the configured bounds.
    ///
    /// The expire interval is at least as long as refresh and retry
    /// together.
    pub fn from_soa(soa: &Soa, config: &ZoneConfig) -> Self {
        let refresh = clamp(
            soa.refresh.as_secs(),
            config.min_refresh,
            config.max_refresh,
        );
        let retry =
            clamp(soa.retry.as_secs(), config.min_retry, config.max_retry);
        let expire = clamp(
            soa.expire.as_secs(),
            refresh.saturating_add(retry),
            MAX_EXPIRE,
        );
        SoaTimers {
            refresh,
            retry,
            expire,
        }
    }

    /// Doubles the retry interval up to six hours.
    pub fn back_off(&mut self) {
        self.retry = self.retry.saturating_mul(2).min(MAX_BACKOFF_RETRY);
    }
}

/// Clamps `value` to `[min, max]`. A lower bound above the upper wins.
fn clamp(value: u32, min: u32, max: u32) -> u32 {
    value.min(max).max(min)
}

//------------ Jitter --------------------------------------------------------

/// Returns a random duration between three quarters of `secs` and `secs`.
pub fn jitter(secs: u32) -> Duration {
    if secs == 0 {
        return Duration::ZERO;
    }
    let low = secs - secs / 4;
    Duration::from_secs(rand::thread_rng().gen_range(low..=secs).into())
}

pub fn secs(secs: u32) -> Duration {
    Duration::from_secs(secs.into())
}

/// Translates a wall clock time into a deadline.
///
/// Times in the past become now.
pub fn instant_for(when: UnixTime) -> Instant {
    let now = UnixTime::now();
    let instant = Instant::now();
    if when <= now {
        instant
    } else {
        instant + when.since(now)
    }
}

//------------ ZoneTimer -----------------------------------------------------

/// The single running timer of a zone.
///
/// The instant the timer is armed for is published through a watch
/// channel to the zone's timer task.
#[derive(Debug)]
pub struct ZoneTimer {
    tx: watch::Sender<Option<Instant>>,
}

impl ZoneTimer {
    pub fn new() -> (Self, watch::Receiver<Option<Instant>>) {
        let (tx, rx) = watch::channel(None);
        (ZoneTimer { tx }, rx)
    }

    /// Arms the timer for `when` or disarms it for `None`.
    ///
    /// Returns whether anything changed. Arming for the instant the timer
    /// is already armed for does nothing.
    pub fn arm(&self, when: Option<Instant>) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == when {
                false
            } else {
                *current = when;
                true
            }
        })
    }

    /// Returns the instant the timer is armed for.
    pub fn armed(&self) -> Option<Instant> {
        *self.tx.borrow()
    }

    /// Forgets the armed instant after the timer fired.
    ///
    /// The timer task is not woken up since it is the one calling this.
    pub fn fired(&self) {
        self.tx.send_if_modified(|current| {
            *current = None;
            false
        });
    }
}

//============ Testing =======================================================
