//! Talking to other servers.
//!
//! Encoding and decoding messages, signing them with TSIG and managing
//! connections is left to an implementation of the [`Transport`] trait
//! provided by the embedding server. The zone maintenance code describes
//! what to send with a [`Request`] and gets back structured messages.

pub use self::ratelimit::RateLimiter;

pub mod mock;
pub mod ratelimit;

use crate::base::iana::{Class, Rtype};
use crate::base::message::Message;
use crate::base::name::Name;
use crate::base::record::Record;
use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::time::Duration;
use std::boxed::Box;
use std::net::{IpAddr, SocketAddr};
use std::vec::Vec;

//------------ Constants -----------------------------------------------------

pub const IANA_DNS_PORT_NUMBER: u16 = 53;

/// How long to wait for the answer to a single query.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a zone transfer may take at most.
pub const DEFAULT_XFR_TIMEOUT: Duration = Duration::from_secs(2 * 3600);

//------------ Type Aliases --------------------------------------------------

pub type TransportFuture<T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'static>>;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

//------------ Protocol ------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum Protocol {
    #[default]
    Udp,
    Tcp,
}

//--- Display

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => f.write_str("UDP"),
            Protocol::Tcp => f.write_str("TCP"),
        }
    }
}

//------------ Request -------------------------------------------------------

/// A single request to a remote server.
#[derive(Clone, Debug)]
pub struct Request {
    pub server: SocketAddr,

    /// The local address to send from, if it matters.
    pub source: Option<SocketAddr>,

    pub message: Message,

    /// The name of the TSIG key to sign the request with.
    pub tsig_key: Option<Name>,

    /// Whether to include an OPT record.
    pub edns: bool,

    pub protocol: Protocol,

    pub timeout: Duration,
}

impl Request {
    pub fn new(server: SocketAddr, message: Message) -> Self {
        Request {
            server,
            source: None,
            message,
            tsig_key: None,
            edns: true,
            protocol: Protocol::Udp,
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_source(mut self, source: Option<SocketAddr>) -> Self {
        self.source = source;
        self
    }

    pub fn with_key(mut self, key: Option<Name>) -> Self {
        self.tsig_key = key;
        self
    }

    pub fn with_edns(mut self, edns: bool) -> Self {
        self.edns = edns;
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }
}

//------------ XfrRequest ----------------------------------------------------

/// A request for a zone transfer.
#[derive(Clone, Debug)]
pub struct XfrRequest {
    pub server: SocketAddr,
    pub source: Option<SocketAddr>,
    pub zone: Name,
    pub class: Class,

    /// Either `Rtype::AXFR` or `Rtype::IXFR`.
    pub rtype: Rtype,

    /// The current SOA record, sent in the authority section of an IXFR.
    pub current: Option<Record>,

    pub tsig_key: Option<Name>,
    pub edns: bool,
    pub timeout: Duration,
}

impl XfrRequest {
    /// Returns the request message.
    pub fn message(&self) -> Message {
        let mut msg = Message::query(self.zone.clone(), self.rtype, self.class);
        if self.rtype == Rtype::IXFR {
            msg.authority.extend(self.current.clone());
        }
        msg
    }
}

//------------ Transport -----------------------------------------------------

/// Sends requests and receives their responses.
pub trait Transport: fmt::Debug + Send + Sync {
    /// Sends a request and returns the response.
    ///
    /// A response with the TC bit set is returned as is. It is up to the
    /// caller to retry over TCP.
    fn query(&self, request: Request) -> TransportFuture<Message>;

    /// Performs a zone transfer over TCP.
    ///
    /// Returns the sequence of response messages up to and including the
    /// one that finished the transfer, or the first error response.
    fn transfer(&self, request: XfrRequest) -> TransportFuture<Vec<Message>>;
}

//------------ AddressResolver -----------------------------------------------

/// Looks up the addresses of a host name.
pub trait AddressResolver: fmt::Debug + Send + Sync {
    fn resolve(&self, name: &Name) -> BoxFuture<Vec<IpAddr>>;
}

/// A resolver that never finds anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoResolver;

impl AddressResolver for NoResolver {
    fn resolve(&self, _name: &Name) -> BoxFuture<Vec<IpAddr>> {
        Box::pin(async { Vec::new() })
    }
}

//------------ IsSelf --------------------------------------------------------

/// Decides whether an address belongs to this server.
pub trait IsSelf: fmt::Debug + Send + Sync {
    fn is_self(&self, addr: &SocketAddr) -> bool;
}

/// Considers only the given addresses as our own.
#[derive(Clone, Debug, Default)]
pub struct OwnAddrs(pub Vec<IpAddr>);

impl IsSelf for OwnAddrs {
    fn is_self(&self, addr: &SocketAddr) -> bool {
        self.0.contains(&addr.ip())
    }
}

//------------ TransportError ------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransportError {
    /// No answer arrived in time.
    Timeout,

    /// The remote refused the connection.
    ConnectionRefused,

    /// There is no route to the remote.
    Unreachable,

    /// The connection was closed before the exchange finished.
    Closed,

    /// The request was abandoned.
    Canceled,

    /// Some other error.
    Other(String),
}

//--- Display and Error

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout => f.write_str("timed out"),
            TransportError::ConnectionRefused => {
                f.write_str("connection refused")
            }
            TransportError::Unreachable => f.write_str("host unreachable"),
            TransportError::Closed => f.write_str("connection closed"),
            TransportError::Canceled => f.write_str("canceled"),
            TransportError::Other(err) => f.write_str(err),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::TimedOut => TransportError::Timeout,
            ErrorKind::ConnectionRefused => TransportError::ConnectionRefused,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::UnexpectedEof => TransportError::Closed,
            _ => TransportError::Other(err.to_string()),
        }
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::base::iana::Opcode;
    use core::str::FromStr;

    #[test]
    fn ixfr_request_carries_soa() {
        let req = XfrRequest {
            server: "192.0.2.1:53".parse().unwrap(),
            source: None,
            zone: Name::from_str("example.com").unwrap(),
            class: Class::IN,
            rtype: Rtype::AXFR,
            current: None,
            tsig_key: None,
            edns: true,
            timeout: DEFAULT_XFR_TIMEOUT,
        };
        let msg = req.message();
        assert_eq!(msg.header.opcode, Opcode::QUERY);
        assert!(msg.authority.is_empty());
    }

    #[test]
    fn io_errors_map() {
        let err = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(TransportError::from(err), TransportError::ConnectionRefused);
        assert!(OwnAddrs(vec!["192.0.2.1".parse().unwrap()])
            .is_self(&"192.0.2.1:5353".parse().unwrap()));
    }
}
