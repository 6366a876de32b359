//! The list of masters a refresh cycle works through.

use crate::config::RemoteAddr;
use std::net::IpAddr;

//------------ Upstreams -----------------------------------------------------

/// The masters of a zone and how far a refresh cycle got with them.
///
/// A cycle starts at the first master, or at the one that sent the notify
/// that triggered it, and moves on to the next one whenever a master
/// failed or had nothing new. Masters that answered are marked as good.
#[derive(Clone, Debug, Default)]
pub struct Upstreams {
    masters: Vec<RemoteAddr>,

    /// The order in which the masters are tried, as indexes.
    order: Vec<usize>,

    /// Which masters answered during the current cycle.
    ok: Vec<bool>,

    /// The position in `order`. Equal to its length when exhausted.
    pos: usize,
}

impl Upstreams {
    pub fn new(masters: Vec<RemoteAddr>) -> Self {
        let len = masters.len();
        Upstreams {
            masters,
            order: (0..len).collect(),
            ok: vec![false; len],
            pos: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.masters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masters.is_empty()
    }

    /// Starts a new cycle.
    ///
    /// If `first` is the address of one of the masters, that master is
    /// tried first and the others follow in their configured order.
    pub fn reset(&mut self, first: Option<IpAddr>) {
        self.ok.iter_mut().for_each(|ok| *ok = false);
        self.pos = 0;
        self.order = (0..self.masters.len()).collect();
        if let Some(ip) = first {
            if let Some(idx) =
                self.masters.iter().position(|m| m.addr.ip() == ip)
            {
                self.order.remove(idx);
                self.order.insert(0, idx);
            }
        }
    }

    /// Returns the master to talk to, if any are left.
    pub fn current(&self) -> Option<&RemoteAddr> {
        self.order.get(self.pos).map(|idx| &self.masters[*idx])
    }

    /// Marks the current master as having answered.
    pub fn mark_ok(&mut self) {
        if let Some(idx) = self.order.get(self.pos) {
            self.ok[*idx] = true;
        }
    }

    /// Moves on to the next master that hasn't answered yet.
    ///
    /// Returns whether there is one.
    pub fn advance(&mut self) -> bool {
        if self.pos < self.order.len() {
            self.pos += 1;
        }
        while self.pos < self.order.len() && self.ok[self.order[self.pos]] {
            self.pos += 1;
        }
        self.pos < self.order.len()
    }

    /// Goes back to the first master that hasn't answered yet.
    ///
    /// Returns whether there is one.
    pub fn restart_failed(&mut self) -> bool {
        match self.order.iter().position(|idx| !self.ok[*idx]) {
            Some(pos) => {
                self.pos = pos;
                true
            }
            None => {
                self.pos = self.order.len();
                false
            }
        }
    }

    /// Returns whether all masters answered.
    pub fn all_ok(&self) -> bool {
        self.ok.iter().all(|ok| *ok)
    }

    /// Returns whether at least one master answered.
    pub fn any_ok(&self) -> bool {
        self.ok.iter().any(|ok| *ok)
    }

    /// Returns whether the address is the address of one of the masters.
    ///
    /// IPv4 addresses mapped into IPv6 match their IPv4 form.
    pub fn contains_ip(&self, ip: IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .map(IpAddr::V4)
                .unwrap_or(IpAddr::V6(v6)),
            v4 => v4,
        };
        self.masters.iter().any(|m| m.addr.ip() == ip)
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    fn masters() -> Upstreams {
        Upstreams::new(
            ["192.0.2.1:53", "192.0.2.2:53", "192.0.2.3:53"]
                .iter()
                .map(|s| RemoteAddr::new(s.parse().unwrap()))
                .collect(),
        )
    }

    fn current(upstreams: &Upstreams) -> Option<String> {
        upstreams.current().map(|m| m.addr.to_string())
    }

    #[test]
    fn walks_in_order() {
        let mut upstreams = masters();
        assert_eq!(current(&upstreams).as_deref(), Some("192.0.2.1:53"));
        assert!(upstreams.advance());
        upstreams.mark_ok();
        assert!(upstreams.advance());
        assert!(!upstreams.advance());
        assert_eq!(current(&upstreams), None);
        assert!(upstreams.any_ok());
        assert!(!upstreams.all_ok());

        // The second round only visits masters that failed.
        assert!(upstreams.restart_failed());
        assert_eq!(current(&upstreams).as_deref(), Some("192.0.2.1:53"));
        assert!(upstreams.advance());
        assert_eq!(current(&upstreams).as_deref(), Some("192.0.2.3:53"));
    }

    #[test]
    fn notifier_goes_first() {
        let mut upstreams = masters();
        upstreams.reset(Some("192.0.2.3".parse().unwrap()));
        assert_eq!(current(&upstreams).as_deref(), Some("192.0.2.3:53"));
        upstreams.advance();
        assert_eq!(current(&upstreams).as_deref(), Some("192.0.2.1:53"));
        upstreams.advance();
        assert_eq!(current(&upstreams).as_deref(), Some("192.0.2.2:53"));
        assert!(!upstreams.advance());

        upstreams.reset(Some("198.51.100.1".parse().unwrap()));
        assert_eq!(current(&upstreams).as_deref(), Some("192.0.2.1:53"));
    }

    #[test]
    fn mapped_addresses_match() {
        let upstreams = masters();
        assert!(upstreams.contains_ip("::ffff:192.0.2.2".parse().unwrap()));
        assert!(!upstreams.contains_ip("192.0.2.9".parse().unwrap()));
        assert!(Upstreams::new(Vec::new()).is_empty());
    }
}
