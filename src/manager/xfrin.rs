//! Admission control for inbound zone transfers.
//!
//! Only so many transfers may run at the same time overall and only so
//! many against the same upstream server. A transfer that can't start
//! right away waits in a queue. Whenever a transfer finishes, the whole
//! queue is scanned in order and every waiter that fits the limits is
//! started. A zone whose upstream is busy thus doesn't block zones
//! behind it that use a different upstream.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::trace;

//------------ XfrinQuota ----------------------------------------------------

#[derive(Debug)]
pub struct XfrinQuota {
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    /// Transfers allowed overall.
    total: usize,

    /// Transfers allowed per upstream.
    per_ns: usize,

    /// The running transfers by zone and upstream.
    running: Vec<(usize, SocketAddr)>,

    waiting: VecDeque<Waiting>,
}

#[derive(Debug)]
struct Waiting {
    zone: usize,
    addr: SocketAddr,
    tx: oneshot::Sender<()>,
}

impl State {
    fn fits(&self, addr: &SocketAddr) -> bool {
        self.running.len() < self.total
            && self.running.iter().filter(|(_, known)| known == addr).count()
                < self.per_ns
    }

    /// Starts all waiters that fit, in queue order.
    fn rescan(&mut self) {
        let mut idx = 0;
        while idx < self.waiting.len() && self.running.len() < self.total {
            if !self.fits(&self.waiting[idx].addr) {
                idx += 1;
                continue;
            }
            let Some(waiting) = self.waiting.remove(idx) else {
                break;
            };
            if waiting.tx.send(()).is_ok() {
                self.running.push((waiting.zone, waiting.addr));
            }
        }
    }

    fn finish(&mut self, zone: usize, addr: &SocketAddr) {
        if let Some(pos) = self
            .running
            .iter()
            .position(|(known_zone, known)| *known_zone == zone && known == addr)
        {
            self.running.swap_remove(pos);
        }
        self.rescan();
    }
}

impl XfrinQuota {
    pub fn new(total: usize, per_ns: usize) -> Arc<Self> {
        Arc::new(XfrinQuota {
            state: Mutex::new(State {
                total: total.max(1),
                per_ns: per_ns.max(1),
                running: Vec::new(),
                waiting: VecDeque::new(),
            }),
        })
    }

    /// Changes the limits. Raising them starts waiting transfers.
    pub fn set_limits(&self, total: usize, per_ns: usize) {
        let mut state = self.state.lock();
        state.total = total.max(1);
        state.per_ns = per_ns.max(1);
        state.rescan();
    }

    /// Returns the number of running and of waiting transfers.
    pub fn counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.running.len(), state.waiting.len())
    }

    /// Returns whether the zone is transferring or waiting to.
    pub fn is_active<T>(&self, zone: &Arc<T>) -> (bool, bool) {
        let id = zone_id(zone);
        let state = self.state.lock();
        (
            state.running.iter().any(|(known, _)| *known == id),
            state.waiting.iter().any(|waiting| waiting.zone == id),
        )
    }

    /// Waits for permission to transfer a zone from `addr`.
    ///
    /// The transfer may run while the returned permit is kept. Dropping
    /// the future gives up the place in the queue.
    pub async fn acquire<T>(self: &Arc<Self>, zone: &Arc<T>, addr: SocketAddr) -> XfrinPermit {
        let zone = zone_id(zone);
        let rx = {
            let mut state = self.state.lock();
            if state.waiting.is_empty() && state.fits(&addr) {
                state.running.push((zone, addr));
                return XfrinPermit {
                    quota: self.clone(),
                    zone,
                    addr,
                    granted: true,
                };
            }
            let (tx, rx) = oneshot::channel();
            state.waiting.push_back(Waiting { zone, addr, tx });
            state.rescan();
            trace!("transfer from {addr} queued");
            rx
        };
        let mut waiter = Waiter {
            quota: self.clone(),
            zone,
            addr,
            rx: Some(rx),
        };
        let granted = waiter.wait().await;
        XfrinPermit {
            quota: self.clone(),
            zone,
            addr,
            granted,
        }
    }

    /// Drops the waiting transfers of a zone.
    pub fn cancel<T>(&self, zone: &Arc<T>) {
        let id = zone_id(zone);
        self.state.lock().waiting.retain(|waiting| waiting.zone != id);
    }

    fn release(&self, zone: usize, addr: &SocketAddr) {
        self.state.lock().finish(zone, addr)
    }
}

fn zone_id<T>(zone: &Arc<T>) -> usize {
    Arc::as_ptr(zone) as *const () as usize
}

//------------ Waiter --------------------------------------------------------

struct Waiter {
    quota: Arc<XfrinQuota>,
    zone: usize,
    addr: SocketAddr,
    rx: Option<oneshot::Receiver<()>>,
}

impl Waiter {
    /// Waits for the go. Returns `false` if the wait was canceled.
    async fn wait(&mut self) -> bool {
        let granted = match self.rx.as_mut() {
            Some(rx) => rx.await.is_ok(),
            None => false,
        };
        self.rx = None;
        granted
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                self.quota.release(self.zone, &self.addr);
            }
        }
    }
}

//------------ XfrinPermit ---------------------------------------------------

/// Permission to run a transfer.
#[derive(Debug)]
pub struct XfrinPermit {
    quota: Arc<XfrinQuota>,
    zone: usize,
    addr: SocketAddr,
    granted: bool,
}

impl XfrinPermit {
    /// Returns whether the transfer may go ahead.
    ///
    /// A permit for a wait that was canceled isn't granted.
    pub fn is_granted(&self) -> bool {
        self.granted
    }
}

impl Drop for XfrinPermit {
    fn drop(&mut self) {
        if self.granted {
            self.quota.release(self.zone, &self.addr);
        }
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use futures_util::FutureExt;

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::from(([192, 0, 2, n], 53))
    }

    #[tokio::test]
    async fn per_server_limit() {
        let quota = XfrinQuota::new(10, 2);
        let zones: Vec<_> = (0..4).map(Arc::new).collect();
        let _first = quota.acquire(&zones[0], addr(1)).await;
        let second = quota.acquire(&zones[1], addr(1)).await;
        let mut third = Box::pin(quota.acquire(&zones[2], addr(1)));
        assert!((&mut third).now_or_never().is_none());
        assert_eq!(quota.counts(), (2, 1));
        assert_eq!(quota.is_active(&zones[2]), (false, true));

        drop(second);
        let _third = third.await;
        assert_eq!(quota.counts(), (2, 0));
        assert_eq!(quota.is_active(&zones[2]), (true, false));
    }

    #[tokio::test]
    async fn busy_server_does_not_block_others() {
        let quota = XfrinQuota::new(3, 1);
        let zones: Vec<_> = (0..4).map(Arc::new).collect();
        let first = quota.acquire(&zones[0], addr(1)).await;
        let mut same = Box::pin(quota.acquire(&zones[1], addr(1)));
        assert!((&mut same).now_or_never().is_none());
        let _other = quota.acquire(&zones[2], addr(2)).await;
        assert_eq!(quota.counts(), (2, 1));

        drop(first);
        let _same = (&mut same).now_or_never().unwrap();
        assert_eq!(quota.counts(), (2, 0));
    }

    #[tokio::test]
    async fn canceled_waiters_give_up_their_place() {
        let quota = XfrinQuota::new(1, 1);
        let zones: Vec<_> = (0..3).map(Arc::new).collect();
        let first = quota.acquire(&zones[0], addr(1)).await;
        let mut gone = Box::pin(quota.acquire(&zones[1], addr(1)));
        assert!((&mut gone).now_or_never().is_none());
        drop(gone);
        quota.cancel(&zones[1]);
        drop(first);
        assert_eq!(quota.counts(), (0, 0));
        let _again = quota.acquire(&zones[2], addr(1)).await;
        assert_eq!(quota.counts(), (1, 0));
    }

    #[tokio::test]
    async fn canceled_wait_is_not_granted() {
        let quota = XfrinQuota::new(1, 1);
        let zones: Vec<_> = (0..2).map(Arc::new).collect();
        let first = quota.acquire(&zones[0], addr(1)).await;
        assert!(first.is_granted());
        let mut waiting = Box::pin(quota.acquire(&zones[1], addr(1)));
        assert!((&mut waiting).now_or_never().is_none());
        quota.cancel(&zones[1]);
        let permit = waiting.await;
        assert!(!permit.is_granted());
        drop(permit);
        // Only the first transfer counts against the quota.
        assert_eq!(quota.counts(), (1, 0));
        drop(first);
        assert_eq!(quota.counts(), (0, 0));
    }
}
