//! A transport talking to made-up servers.
//!
//! [`MockTransport`] answers requests from zone content kept in memory.
//! Every server keeps the history of the versions it served so that it
//! can answer IXFR requests with the differences between them. Servers
//! can be taken down and individual answers can be scripted.
//!
//! All requests are recorded for later inspection.

use super::{Request, Transport, TransportError, TransportFuture, XfrRequest};
use crate::base::iana::{Opcode, Rcode, Rtype};
use crate::base::message::Message;
use crate::base::name::Name;
use crate::base::rdata::Rdata;
use crate::base::serial::Serial;
use crate::store::ZoneVersion;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// A scripted answer to a query. Returning `None` falls back to the
/// server's content.
pub type QueryHook =
    Arc<dyn Fn(&Request) -> Option<Result<Message, TransportError>> + Send + Sync>;

/// A scripted answer to a transfer request.
pub type TransferHook = Arc<
    dyn Fn(&XfrRequest) -> Option<Result<Vec<Message>, TransportError>>
        + Send
        + Sync,
>;

//------------ MockTransport -------------------------------------------------

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    servers: HashMap<SocketAddr, Server>,
    queries: Vec<Request>,
    transfers: Vec<XfrRequest>,
}

#[derive(Default)]
struct Server {
    /// The versions served per zone, oldest first.
    zones: HashMap<Name, Vec<Arc<ZoneVersion>>>,
    down: bool,
    no_ixfr: bool,
    on_query: Option<QueryHook>,
    on_transfer: Option<TransferHook>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `addr` serve `version` as the newest version of its zone.
    pub fn serve(&self, addr: SocketAddr, version: ZoneVersion) {
        self.state
            .lock()
            .servers
            .entry(addr)
            .or_default()
            .zones
            .entry(version.origin().clone())
            .or_default()
            .push(Arc::new(version));
    }

    /// Makes a server stop or start answering.
    pub fn set_down(&self, addr: SocketAddr, down: bool) {
        self.state.lock().servers.entry(addr).or_default().down = down;
    }

    /// Makes a server answer IXFR requests with NOTIMP.
    pub fn disable_ixfr(&self, addr: SocketAddr) {
        self.state.lock().servers.entry(addr).or_default().no_ixfr = true;
    }

    pub fn on_query(&self, addr: SocketAddr, hook: QueryHook) {
        self.state.lock().servers.entry(addr).or_default().on_query = Some(hook);
    }

    pub fn on_transfer(&self, addr: SocketAddr, hook: TransferHook) {
        self.state.lock().servers.entry(addr).or_default().on_transfer =
            Some(hook);
    }

    /// Returns all queries sent so far.
    pub fn queries(&self) -> Vec<Request> {
        self.state.lock().queries.clone()
    }

    /// Returns all transfer requests sent so far.
    pub fn transfers(&self) -> Vec<XfrRequest> {
        self.state.lock().transfers.clone()
    }

    /// Returns the queries of the given opcode sent to a server.
    pub fn queries_to(&self, addr: SocketAddr, opcode: Opcode) -> usize {
        self.state
            .lock()
            .queries
            .iter()
            .filter(|req| req.server == addr && req.message.header.opcode == opcode)
            .count()
    }

    fn answer_query(&self, request: &Request) -> Result<Message, TransportError> {
        let mut state = self.state.lock();
        state.queries.push(request.clone());
        let Some(server) = state.servers.get(&request.server) else {
            return Err(TransportError::Unreachable);
        };
        if server.down {
            return Err(TransportError::Timeout);
        }
        if let Some(res) = server.on_query.as_ref().and_then(|hook| hook(request)) {
            return res;
        }
        let msg = &request.message;
        let mut res = reply(msg);
        match msg.header.opcode {
            Opcode::QUERY => {}
            _ => return Ok(res),
        }
        let Some(question) = msg.question.as_ref() else {
            res.header.rcode = Rcode::FORMERR;
            return Ok(res);
        };
        let Some(version) = server.find_zone(&question.qname) else {
            res.header.rcode = Rcode::REFUSED;
            return Ok(res);
        };
        res.header.aa = true;
        if let Some(rrset) = version.find(&question.qname, question.qtype) {
            res.answer.extend(rrset.records());
        } else if version.node(&question.qname).is_none() {
            res.header.rcode = Rcode::NXDOMAIN;
        }
        if question.qtype == Rtype::NS {
            for record in res.answer.clone() {
                let Rdata::Ns(target) = record.data else {
                    continue;
                };
                for rtype in [Rtype::A, Rtype::AAAA] {
                    if let Some(rrset) = version.find(&target, rtype) {
                        res.additional.extend(rrset.records());
                    }
                }
            }
        }
        Ok(res)
    }

    fn answer_transfer(
        &self,
        request: &XfrRequest,
    ) -> Result<Vec<Message>, TransportError> {
        let mut state = self.state.lock();
        state.transfers.push(request.clone());
        let Some(server) = state.servers.get(&request.server) else {
            return Err(TransportError::Unreachable);
        };
        if server.down {
            return Err(TransportError::Timeout);
        }
        if let Some(res) =
            server.on_transfer.as_ref().and_then(|hook| hook(request))
        {
            return res;
        }
        let query = request.message();
        let mut res = reply(&query);
        let history = match server.zones.get(&request.zone) {
            Some(history) if !history.is_empty() => history,
            _ => {
                res.header.rcode = Rcode::NOTAUTH;
                return Ok(vec![res]);
            }
        };
        if request.rtype == Rtype::IXFR && server.no_ixfr {
            res.header.rcode = Rcode::NOTIMP;
            return Ok(vec![res]);
        }
        res.header.aa = true;
        let latest = &history[history.len() - 1];
        let Some(soa) = latest.soa_record() else {
            res.header.rcode = Rcode::SERVFAIL;
            return Ok(vec![res]);
        };
        res.answer.push(soa.clone());

        let current = request
            .current
            .as_ref()
            .and_then(|record| record.data.as_soa())
            .map(|soa| soa.serial);
        if request.rtype == Rtype::IXFR {
            if current == latest.serial() {
                return Ok(vec![res]);
            }
            if let Some(start) = current.and_then(|serial| position(history, serial)) {
                for pair in history[start..].windows(2) {
                    let diff = pair[0].diff_to(&pair[1]);
                    res.answer
                        .extend(diff.into_ixfr_order().into_iter().map(|t| t.record));
                }
                res.answer.push(soa);
                return Ok(vec![res]);
            }
        }

        // Full content, split over two messages.
        res.answer
            .extend(latest.records().filter(|r| r.rtype() != Rtype::SOA));
        let mut last = reply(&query);
        last.header.aa = true;
        last.answer.push(soa);
        Ok(vec![res, last])
    }
}

impl Server {
    /// Returns the newest version of the closest enclosing zone.
    fn find_zone(&self, qname: &Name) -> Option<&Arc<ZoneVersion>> {
        self.zones
            .iter()
            .filter(|(origin, _)| qname.ends_with(origin))
            .max_by_key(|(origin, _)| origin.label_count())
            .and_then(|(_, history)| history.last())
    }
}

fn position(history: &[Arc<ZoneVersion>], serial: Serial) -> Option<usize> {
    history
        .iter()
        .position(|version| version.serial() == Some(serial))
}

fn reply(msg: &Message) -> Message {
    let mut res = Message {
        question: msg.question.clone(),
        ..Default::default()
    };
    res.header.id = msg.header.id;
    res.header.opcode = msg.header.opcode;
    res.header.qr = true;
    res
}

impl Transport for MockTransport {
    fn query(&self, request: Request) -> TransportFuture<Message> {
        let res = self.answer_query(&request);
        Box::pin(async move { res })
    }

    fn transfer(&self, request: XfrRequest) -> TransportFuture<Vec<Message>> {
        let res = self.answer_transfer(&request);
        Box::pin(async move { res })
    }
}

impl core::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockTransport")
            .field("servers", &state.servers.len())
            .field("queries", &state.queries.len())
            .finish()
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::base::iana::Class;
    use crate::base::rdata::Soa;
    use crate::base::record::{Record, Ttl};
    use crate::xfr::interpret::{interpret, XfrContent};
    use core::str::FromStr;
    use std::net::Ipv4Addr;

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    fn version(serial: u32, hosts: u8) -> ZoneVersion {
        let record = |owner: &str, data| {
            Record::new(name(owner), Class::IN, Ttl::from_secs(3600), data)
        };
        let mut records = vec![
            record(
                "example.",
                Rdata::Soa(Soa {
                    mname: name("ns1.example."),
                    rname: name("hostmaster.example."),
                    serial: Serial(serial),
                    refresh: Ttl::from_secs(3600),
                    retry: Ttl::from_secs(600),
                    expire: Ttl::from_secs(86400),
                    minimum: Ttl::from_secs(300),
                }),
            ),
            record("example.", Rdata::Ns(name("ns1.example."))),
        ];
        for i in 0..hosts {
            records.push(record(
                "ns1.example.",
                Rdata::A(Ipv4Addr::new(192, 0, 2, i + 1)),
            ));
        }
        ZoneVersion::from_records(name("example."), Class::IN, records).unwrap()
    }

    fn addr() -> SocketAddr {
        "192.0.2.53:53".parse().unwrap()
    }

    fn ixfr(serial: u32) -> XfrRequest {
        XfrRequest {
            server: addr(),
            source: None,
            zone: name("example."),
            class: Class::IN,
            rtype: Rtype::IXFR,
            current: version(serial, 1).soa_record(),
            tsig_key: None,
            edns: true,
            timeout: crate::net::DEFAULT_XFR_TIMEOUT,
        }
    }

    #[tokio::test]
    async fn answers_from_content() {
        let mock = MockTransport::new();
        mock.serve(addr(), version(10, 1));
        let msg = mock
            .query(Request::new(
                addr(),
                Message::query(name("example."), Rtype::NS, Class::IN),
            ))
            .await
            .unwrap();
        assert!(msg.header.aa);
        assert_eq!(msg.answer.len(), 1);
        assert_eq!(msg.additional.len(), 1);

        mock.set_down(addr(), true);
        let err = mock
            .query(Request::new(
                addr(),
                Message::query(name("example."), Rtype::SOA, Class::IN),
            ))
            .await;
        assert_eq!(err, Err(TransportError::Timeout));
        assert_eq!(mock.queries_to(addr(), Opcode::QUERY), 2);
    }

    #[tokio::test]
    async fn ixfr_from_history() {
        let mock = MockTransport::new();
        mock.serve(addr(), version(10, 1));
        mock.serve(addr(), version(11, 2));
        let messages = mock.transfer(ixfr(10)).await.unwrap();
        let content = interpret(
            &name("example."),
            Class::IN,
            Rtype::IXFR,
            Some(Serial(10)),
            &messages,
        )
        .unwrap();
        assert!(matches!(content, XfrContent::Incremental(diffs) if diffs.len() == 1));

        let messages = mock.transfer(ixfr(11)).await.unwrap();
        assert_eq!(messages[0].answer.len(), 1);

        // Unknown serial: full content.
        let messages = mock.transfer(ixfr(5)).await.unwrap();
        assert_eq!(messages.len(), 2);

        mock.disable_ixfr(addr());
        let messages = mock.transfer(ixfr(10)).await.unwrap();
        assert_eq!(messages[0].rcode(), Rcode::NOTIMP);
    }
}
