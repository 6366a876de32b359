//! Checking masters for newer versions of a zone.
//!
//! A refresh cycle asks the masters of a slave or stub zone for their SOA
//! record, one after the other. A master with a newer serial is asked for
//! the new content. The cycle ends once a transfer succeeded or all
//! masters have been tried. Masters that didn't answer at all are tried
//! once more from the alternate transfer source if one is configured.
//!
//! Only one cycle runs per zone at a time. A refresh asked for while a
//! cycle is running is remembered and started right after it.

use super::XfrError;
use crate::base::iana::{Rcode, Rtype};
use crate::base::message::Message;
use crate::base::name::Name;
use crate::base::rdata::Soa;
use crate::base::record::Record;
use crate::base::serial::Serial;
use crate::config::{RemoteAddr, ZoneType};
use crate::net::{Protocol, Request, TransportError};
use crate::zone::maintenance::effective_type;
use crate::zone::timers::{jitter, secs};
use crate::zone::{SoaTimers, Zone, ZoneError, ZoneFlags, ZoneState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

//------------ Attempt -------------------------------------------------------

/// How to talk to the current master.
#[derive(Clone, Debug)]
pub(crate) struct Attempt {
    pub master: RemoteAddr,
    pub source: Option<SocketAddr>,
    pub edns: bool,
    pub protocol: Protocol,
}

impl Attempt {
    /// Returns a query to the master.
    pub fn request(&self, message: Message) -> Request {
        Request::new(self.master.addr, message)
            .with_source(self.source)
            .with_key(self.master.key.clone())
            .with_edns(self.edns)
            .with_protocol(self.protocol)
    }
}

//------------ SoaContext ----------------------------------------------------

/// What we need to know to judge the answer to an SOA query.
#[derive(Clone, Debug)]
pub(crate) struct SoaContext<'a> {
    pub origin: &'a Name,

    /// Either slave or stub.
    pub zone_type: ZoneType,
    pub edns: bool,
    pub protocol: Protocol,
    pub try_tcp_refresh: bool,

    /// The serial we have, `None` if the zone isn't loaded.
    pub current: Option<Serial>,

    /// Transfer even if the serial isn't newer.
    pub force: bool,
}

//------------ SoaVerdict ----------------------------------------------------

/// What to do after an SOA query.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum SoaVerdict {
    /// Ask the same master again without EDNS.
    RetryWithoutEdns,

    /// Ask the same master again over TCP.
    RetryOverTcp,

    /// Fetch the content from this master.
    ///
    /// The SOA record is missing if the check was skipped.
    Transfer {
        soa: Option<Record>,
        soa_before_axfr: bool,
    },

    /// The master has our serial.
    UpToDate(Soa),

    /// The master is behind us.
    Older(Serial),

    /// The master couldn't be reached.
    Unreachable(TransportError),

    /// The master gave an unusable answer.
    Failed(XfrError),
}

/// Judges the outcome of an SOA query.
pub(crate) fn classify(
    ctx: &SoaContext,
    res: &Result<Message, TransportError>,
) -> SoaVerdict {
    let slave = ctx.zone_type == ZoneType::Slave;
    let msg = match res {
        Ok(msg) => msg,
        Err(TransportError::Timeout) if ctx.edns => {
            return SoaVerdict::RetryWithoutEdns
        }
        Err(TransportError::Timeout)
            if slave && ctx.protocol == Protocol::Udp && ctx.try_tcp_refresh =>
        {
            return SoaVerdict::Transfer {
                soa: None,
                soa_before_axfr: true,
            }
        }
        Err(err) => return SoaVerdict::Unreachable(err.clone()),
    };

    let rcode = msg.rcode();
    if rcode != Rcode::NOERROR {
        if ctx.edns
            && matches!(rcode, Rcode::SERVFAIL | Rcode::NOTIMP | Rcode::FORMERR)
        {
            return SoaVerdict::RetryWithoutEdns;
        }
        if slave && rcode == Rcode::REFUSED {
            return SoaVerdict::Transfer {
                soa: None,
                soa_before_axfr: false,
            };
        }
        return SoaVerdict::Failed(XfrError::Rcode(rcode));
    }

    if msg.header.tc {
        if slave {
            return SoaVerdict::Transfer {
                soa: None,
                soa_before_axfr: false,
            };
        }
        if ctx.protocol == Protocol::Udp {
            return SoaVerdict::RetryOverTcp;
        }
        return SoaVerdict::Failed(XfrError::Malformed("truncated TCP answer"));
    }

    if !msg.header.aa {
        return SoaVerdict::Failed(XfrError::Malformed("non-authoritative answer"));
    }
    if Message::count(&msg.answer, ctx.origin, Rtype::CNAME) > 0 {
        return SoaVerdict::Failed(XfrError::Malformed("CNAME in answer"));
    }
    if msg.answer.is_empty() {
        if msg.authority.iter().any(|r| r.rtype() == Rtype::NS) {
            return SoaVerdict::Failed(XfrError::Malformed("referral"));
        }
        return SoaVerdict::Failed(XfrError::NoSoa);
    }
    if Message::count(&msg.answer, ctx.origin, Rtype::SOA) != 1 {
        return SoaVerdict::Failed(XfrError::Malformed("not exactly one SOA"));
    }
    let Some(record) = msg.answers(ctx.origin, Rtype::SOA).next() else {
        return SoaVerdict::Failed(XfrError::NoSoa);
    };
    let Some(soa) = record.data.as_soa() else {
        return SoaVerdict::Failed(XfrError::NoSoa);
    };

    match ctx.current {
        None => SoaVerdict::Transfer {
            soa: Some(record.clone()),
            soa_before_axfr: false,
        },
        Some(_) if ctx.force => SoaVerdict::Transfer {
            soa: Some(record.clone()),
            soa_before_axfr: false,
        },
        Some(current) if soa.serial.is_newer_than(current) => {
            SoaVerdict::Transfer {
                soa: Some(record.clone()),
                soa_before_axfr: false,
            }
        }
        Some(current) if soa.serial == current => {
            SoaVerdict::UpToDate(soa.clone())
        }
        Some(_) => SoaVerdict::Older(soa.serial),
    }
}

/// What the cycle does after talking to a master.
enum Step {
    /// Talk to the same master again.
    Again,

    /// Go on with the next master.
    Next,

    /// The cycle is over.
    Done,
}

//------------ Zone: Refresh -------------------------------------------------

impl Zone {
    /// Checks the masters for a newer version now.
    ///
    /// Does nothing if a refresh is running already.
    pub fn refresh(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.flags.contains(ZoneFlags::EXITING)
            || !state.config.is_transferred()
        {
            return;
        }
        if state.flags.intersects(
            ZoneFlags::REFRESH | ZoneFlags::LOADING | ZoneFlags::NOREFRESH,
        ) {
            debug!(
                "Zone '{}': refresh already running or not possible now",
                self.name()
            );
            return;
        }
        self.start_refresh(&mut state);
        self.set_timer(&state);
    }

    /// Starts a refresh cycle.
    ///
    /// Until the cycle succeeds, the next refresh is due after the retry
    /// interval. Without timers learned from an SOA record, the retry
    /// interval doubles each time.
    pub(crate) fn start_refresh(self: &Arc<Self>, state: &mut ZoneState) {
        if state.config.masters.is_empty() {
            state.flags.insert(ZoneFlags::NOMASTERS);
            state.timers.refresh = None;
            return;
        }
        state.flags.insert(ZoneFlags::REFRESH);
        state.flags.remove(
            ZoneFlags::NOEDNS
                | ZoneFlags::USEVC
                | ZoneFlags::USEALTXFRSRC
                | ZoneFlags::SOABEFOREAXFR,
        );
        state.timers.refresh =
            Some(Instant::now() + jitter(state.soa_timers.retry));
        if !state.flags.contains(ZoneFlags::HAVETIMERS) {
            state.soa_timers.back_off();
        }
        let first = state.notify_from.take().map(|addr| addr.ip());
        state.upstreams.reset(first);
        let zone = self.clone();
        let handle = tokio::spawn(async move { zone.refresh_cycle().await });
        state.tasks.refresh = Some(handle.abort_handle());
        debug!("Zone '{}': refresh started", self.name());
    }

    async fn refresh_cycle(self: Arc<Self>) {
        while let Some(attempt) = self.next_attempt() {
            match self.check_master(&attempt).await {
                Step::Again => {}
                Step::Next => self.next_master(),
                Step::Done => break,
            }
        }
        self.finish_refresh();
    }

    /// Returns how to talk to the next master worth trying.
    fn next_attempt(&self) -> Option<Attempt> {
        loop {
            let attempt = {
                let mut state = self.state.lock();
                if state.flags.contains(ZoneFlags::EXITING) {
                    return None;
                }
                match state.upstreams.current().cloned() {
                    Some(master) => Attempt {
                        master,
                        source: state.transfer_source(),
                        edns: !state.flags.contains(ZoneFlags::NOEDNS),
                        protocol: if state.flags.contains(ZoneFlags::USEVC) {
                            Protocol::Tcp
                        } else {
                            Protocol::Udp
                        },
                    },
                    None => {
                        if state.config.use_alt_transfer_source
                            && state.config.alt_transfer_source.is_some()
                            && !state.flags.contains(ZoneFlags::USEALTXFRSRC)
                            && state.upstreams.restart_failed()
                        {
                            debug!(
                                "Zone '{}': trying failed masters from alternate source",
                                self.name()
                            );
                            state.flags.insert(ZoneFlags::USEALTXFRSRC);
                            continue;
                        }
                        return None;
                    }
                }
            };
            if !self
                .shared
                .is_unreachable(&attempt.master.addr, &attempt.source)
            {
                return Some(attempt);
            }
            info!(
                "Zone '{}': skipping unreachable master {}",
                self.name(),
                attempt.master.addr
            );
            self.next_master();
        }
    }

    fn next_master(&self) {
        let mut state = self.state.lock();
        state.upstreams.advance();
        state.flags.remove(
            ZoneFlags::NOEDNS | ZoneFlags::USEVC | ZoneFlags::SOABEFOREAXFR,
        );
    }

    /// Asks a master for its SOA record and acts on the answer.
    async fn check_master(self: &Arc<Self>, attempt: &Attempt) -> Step {
        self.shared.limiters.serial_query.acquire().await;
        let addr = attempt.master.addr;
        let (zone_type, try_tcp_refresh, current, force) = {
            let state = self.state.lock();
            if state.flags.contains(ZoneFlags::EXITING) {
                return Step::Done;
            }
            (
                effective_type(&state.config),
                state.config.try_tcp_refresh,
                state.serial(),
                state.flags.contains(ZoneFlags::FORCEXFER),
            )
        };
        trace!(
            "Zone '{}': sending SOA query to {addr} over {}",
            self.name(),
            attempt.protocol
        );
        let request = attempt.request(Message::query(
            self.name().clone(),
            Rtype::SOA,
            self.class(),
        ));
        let res = self.query(request).await;
        if res.is_ok() {
            self.shared.delete_unreachable(&addr, &attempt.source);
        }
        let ctx = SoaContext {
            origin: self.name(),
            zone_type,
            edns: attempt.edns,
            protocol: attempt.protocol,
            try_tcp_refresh,
            current,
            force,
        };
        match classify(&ctx, &res) {
            SoaVerdict::RetryWithoutEdns => {
                debug!("Zone '{}': retrying {addr} without EDNS", self.name());
                self.state.lock().flags.insert(ZoneFlags::NOEDNS);
                Step::Again
            }
            SoaVerdict::RetryOverTcp => {
                debug!("Zone '{}': truncated answer, retrying {addr} over TCP", self.name());
                self.state.lock().flags.insert(ZoneFlags::USEVC);
                Step::Again
            }
            SoaVerdict::Unreachable(err) => {
                info!(
                    "Zone '{}': refresh: failure trying master {addr}: {err}",
                    self.name()
                );
                self.shared.add_unreachable(addr, attempt.source);
                Step::Next
            }
            SoaVerdict::Failed(err) => {
                info!(
                    "Zone '{}': refresh: unusable answer from master {addr}: {err}",
                    self.name()
                );
                Step::Next
            }
            SoaVerdict::UpToDate(soa) => {
                self.up_to_date(&soa, addr);
                Step::Next
            }
            SoaVerdict::Older(serial) => {
                info!(
                    "Zone '{}': serial {serial} received from master {addr} < ours ({})",
                    self.name(),
                    current.map(|s| s.to_string()).unwrap_or_default()
                );
                self.state.lock().upstreams.mark_ok();
                Step::Next
            }
            SoaVerdict::Transfer {
                soa,
                soa_before_axfr,
            } => {
                if soa_before_axfr {
                    self.state.lock().flags.insert(ZoneFlags::SOABEFOREAXFR);
                }
                let res = match (zone_type, soa) {
                    (ZoneType::Stub, Some(soa)) => {
                        self.fetch_stub(attempt, soa).await
                    }
                    (ZoneType::Stub, None) => Err(XfrError::NoSoa.into()),
                    _ => self.transfer_from(attempt).await,
                };
                self.after_transfer(res, addr)
            }
        }
    }

    /// Decides how to go on after fetching content from a master.
    fn after_transfer(&self, res: Result<(), ZoneError>, addr: SocketAddr) -> Step {
        match res {
            Ok(()) => Step::Done,
            Err(ZoneError::Exiting) => Step::Done,
            Err(ZoneError::Xfr(XfrError::BadIxfr(msg))) => {
                let mut state = self.state.lock();
                if state.flags.contains(ZoneFlags::FORCEXFER) {
                    warn!(
                        "Zone '{}': bad IXFR from {addr} despite asking for AXFR: {msg}",
                        self.name()
                    );
                    return Step::Next;
                }
                info!(
                    "Zone '{}': bad IXFR from {addr} ({msg}), trying AXFR",
                    self.name()
                );
                state.flags.insert(ZoneFlags::FORCEXFER);
                Step::Again
            }
            Err(err) => {
                warn!("Zone '{}': transfer from {addr} failed: {err}", self.name());
                Step::Next
            }
        }
    }

    /// Learns the timers of an SOA record that matched ours.
    fn up_to_date(&self, soa: &Soa, addr: SocketAddr) {
        let mut state = self.state.lock();
        state.upstreams.mark_ok();
        state.soa_timers = SoaTimers::from_soa(soa, &state.config);
        state.flags.insert(ZoneFlags::HAVETIMERS);
        let now = Instant::now();
        state.timers.refresh = Some(now + jitter(state.soa_timers.refresh));
        state.timers.expire = Some(now + secs(state.soa_timers.expire));
        debug!(
            "Zone '{}': master {addr} has serial {}, zone is up to date",
            self.name(),
            soa.serial
        );
    }

    fn finish_refresh(&self) {
        let mut state = self.state.lock();
        state.tasks.refresh = None;
        state.flags.remove(
            ZoneFlags::REFRESH
                | ZoneFlags::NOEDNS
                | ZoneFlags::USEVC
                | ZoneFlags::SOABEFOREAXFR
                | ZoneFlags::USEALTXFRSRC,
        );
        if state.flags.contains(ZoneFlags::EXITING) {
            return;
        }
        if state.upstreams.any_ok() {
            state.flags.remove(ZoneFlags::NOMASTERS);
        } else {
            state.flags.insert(ZoneFlags::NOMASTERS);
            warn!(
                "Zone '{}': none of {} masters answered, retrying in {}s",
                self.name(),
                state.upstreams.len(),
                state.soa_timers.retry
            );
        }
        if state.flags.contains(ZoneFlags::NEEDREFRESH) {
            state.flags.remove(ZoneFlags::NEEDREFRESH);
            state.timers.refresh = Some(Instant::now());
        }
        self.set_timer(&state);
    }

    /// Sends a query, giving up after the request's timeout.
    pub(crate) async fn query(
        &self,
        request: Request,
    ) -> Result<Message, TransportError> {
        let timeout = request.timeout;
        match tokio::time::timeout(
            timeout,
            self.shared.services.transport.query(request),
        )
        .await
        {
            Ok(res) => res,
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

//------------ Zone: Incoming Notify -----------------------------------------

impl Zone {
    /// Handles a NOTIFY message received from `from`.
    ///
    /// Returns the response code to answer with. A notify from one of the
    /// masters with a serial newer than ours, or without one, starts a
    /// refresh. A running refresh is followed by another one instead.
    pub fn notify_received(self: &Arc<Self>, from: SocketAddr, msg: &Message) -> Rcode {
        let Some(question) = msg.question.as_ref() else {
            info!("Zone '{}': NOTIFY without question from {from}", self.name());
            return Rcode::FORMERR;
        };
        if &question.qname != self.name() || question.qtype != Rtype::SOA {
            info!("Zone '{}': NOTIFY for other zone from {from}", self.name());
            return Rcode::NOTIMP;
        }

        let mut state = self.state.lock();
        if effective_type(&state.config) == ZoneType::Master {
            return Rcode::NOERROR;
        }
        if !state.upstreams.contains_ip(from.ip()) {
            info!("Zone '{}': refused notify from non-master {from}", self.name());
            return Rcode::REFUSED;
        }
        if state.flags.contains(ZoneFlags::LOADED)
            && !state.flags.contains(ZoneFlags::NOREFRESH)
        {
            let theirs = msg
                .answers(self.name(), Rtype::SOA)
                .find_map(|record| record.data.as_soa())
                .map(|soa| soa.serial);
            if let (Some(theirs), Some(ours)) = (theirs, state.serial()) {
                if !theirs.is_newer_than(ours) {
                    info!("Zone '{}': notify from {from}: zone is up to date", self.name());
                    return Rcode::NOERROR;
                }
            }
        }
        state.notify_from = Some(from);
        if state.flags.contains(ZoneFlags::REFRESH) {
            state.flags.insert(ZoneFlags::NEEDREFRESH);
            info!(
                "Zone '{}': notify from {from}: refresh in progress, refresh check queued",
                self.name()
            );
            return Rcode::NOERROR;
        }
        drop(state);
        info!("Zone '{}': notify from {from}, checking masters", self.name());
        self.refresh();
        Rcode::NOERROR
    }
}

//============ Testing =======================================================
