//! Remembering servers that didn't answer.
//!
//! Before talking to an upstream server, the zone maintenance code checks
//! whether the server recently failed to answer. A single failure isn't
//! enough to mark a server as unreachable. Only once it failed again
//! while the earlier failure is still remembered is it skipped until the
//! entry expires.

use crate::base::time::UnixTime;
use core::time::Duration;
use heapless::Vec;
use std::net::SocketAddr;

//------------ Constants -----------------------------------------------------

/// The number of servers remembered.
pub const UNREACH_CACHE_SIZE: usize = 10;

/// How long a failure is remembered.
pub const UNREACH_HOLD_TIME: Duration = Duration::from_secs(600);

//------------ UnreachableCache ----------------------------------------------

/// A small LRU cache of unreachable servers.
///
/// Servers are identified by their address together with the local
/// address used to contact them since a different source address may
/// well result in a different outcome.
#[derive(Clone, Debug, Default)]
pub struct UnreachableCache {
    entries: Vec<Entry, UNREACH_CACHE_SIZE>,
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    remote: SocketAddr,
    local: Option<SocketAddr>,

    /// When the entry was last used.
    last: UnixTime,

    /// When the entry stops being valid.
    expire: UnixTime,

    /// How often the server failed while the entry was valid.
    count: u32,
}

impl Entry {
    fn matches(&self, remote: &SocketAddr, local: &Option<SocketAddr>) -> bool {
        &self.remote == remote && &self.local == local
    }
}

impl UnreachableCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the server is currently considered unreachable.
    pub fn is_unreachable(
        &mut self,
        remote: &SocketAddr,
        local: &Option<SocketAddr>,
        now: UnixTime,
    ) -> bool {
        for entry in self.entries.iter_mut() {
            if entry.matches(remote, local) && entry.expire >= now {
                entry.last = now;
                return entry.count > 1;
            }
        }
        false
    }

    /// Records a failure of the server.
    pub fn add(
        &mut self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        now: UnixTime,
    ) {
        let expire = now.add(UNREACH_HOLD_TIME);

        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.matches(&remote, &local))
        {
            // Only count failures of an entry that is still valid.
            if entry.expire < now {
                entry.count = 1;
            } else {
                entry.count += 1;
            }
            entry.expire = expire;
            entry.last = now;
            return;
        }

        let entry = Entry {
            remote,
            local,
            last: now,
            expire,
            count: 1,
        };

        // Reuse an expired slot before pushing a new one.
        if let Some(slot) =
            self.entries.iter_mut().find(|entry| entry.expire < now)
        {
            *slot = entry;
            return;
        }
        if let Err(entry) = self.entries.push(entry) {
            // Full: replace the least recently used entry.
            if let Some(oldest) = self.entries.iter_mut().min_by_key(|e| e.last)
            {
                *oldest = entry;
            }
        }
    }

    /// Forgets a server, for instance because it answered after all.
    pub fn delete(&mut self, remote: &SocketAddr, local: &Option<SocketAddr>) {
        if let Some(pos) = self
            .entries
            .iter()
            .position(|entry| entry.matches(remote, local))
        {
            self.entries.swap_remove(pos);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::from(([192, 0, 2, n], 53))
    }

    #[test]
    fn single_failure_is_forgiven() {
        let mut cache = UnreachableCache::new();
        let now = UnixTime::from_secs(1000);
        cache.add(addr(1), None, now);
        assert!(!cache.is_unreachable(&addr(1), &None, now));
        cache.add(addr(1), None, now);
        assert!(cache.is_unreachable(&addr(1), &None, now));
        // A different source address is a different entry.
        assert!(!cache.is_unreachable(&addr(1), &Some(addr(9)), now));
        cache.delete(&addr(1), &None);
        assert!(!cache.is_unreachable(&addr(1), &None, now));
    }

    #[test]
    fn entries_expire() {
        let mut cache = UnreachableCache::new();
        let now = UnixTime::from_secs(1000);
        cache.add(addr(1), None, now);
        cache.add(addr(1), None, now);
        let later = now.add(UNREACH_HOLD_TIME + Duration::from_secs(1));
        assert!(!cache.is_unreachable(&addr(1), &None, later));
        // A failure after expiry starts counting afresh.
        cache.add(addr(1), None, later);
        assert!(!cache.is_unreachable(&addr(1), &None, later));
    }

    #[test]
    fn least_recently_used_is_evicted() {
        let mut cache = UnreachableCache::new();
        for n in 0..UNREACH_CACHE_SIZE as u8 {
            let now = UnixTime::from_secs(1000 + u32::from(n));
            cache.add(addr(n), None, now);
            cache.add(addr(n), None, now);
        }
        let now = UnixTime::from_secs(1100);
        // Touch the oldest so that the second oldest gets evicted.
        assert!(cache.is_unreachable(&addr(0), &None, now));
        cache.add(addr(200), None, now);
        assert_eq!(cache.len(), UNREACH_CACHE_SIZE);
        assert!(cache.is_unreachable(&addr(0), &None, now));
        assert!(!cache.is_unreachable(&addr(1), &None, now));
    }
}
