//! Keeping zones in sync with other servers.
//!
//! This module contains the protocol side of zone maintenance: checking
//! upstream servers for newer serials and transferring zones from them,
//! fetching the delegation of stub zones, sending and receiving NOTIFY
//! messages and forwarding dynamic updates to the masters of a slave
//! zone.
//!
//! All of these run as tokio tasks owned by their zone. The network
//! exchanges themselves are left to the [`Transport`] provided with the
//! zone manager's services.
//!
//! [`Transport`]: crate::net::Transport

pub mod forward;
pub mod interpret;
pub mod notify;
pub mod refresh;
pub mod stub;
pub mod transfer;
pub mod upstream;

use crate::base::iana::Rcode;
use crate::net::TransportError;
use core::fmt;

//------------ XfrError ------------------------------------------------------

/// Something went wrong talking to an upstream server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum XfrError {
    /// The exchange itself failed.
    Transport(TransportError),

    /// The server answered with an error.
    Rcode(Rcode),

    /// An incremental transfer didn't fit our content.
    BadIxfr(&'static str),

    /// The answer didn't make sense.
    Malformed(&'static str),

    /// The answer lacked the zone's SOA record.
    NoSoa,

    /// The transfer took longer than allowed.
    Timeout,

    /// The operation was abandoned because the zone is shutting down.
    Canceled,

    /// None of the masters gave a usable answer.
    Exhausted,
}

impl From<TransportError> for XfrError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => XfrError::Timeout,
            TransportError::Canceled => XfrError::Canceled,
            err => XfrError::Transport(err),
        }
    }
}

//--- Display and Error

impl fmt::Display for XfrError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            XfrError::Transport(err) => write!(f, "{err}"),
            XfrError::Rcode(rcode) => write!(f, "server answered {rcode}"),
            XfrError::BadIxfr(msg) => write!(f, "bad IXFR: {msg}"),
            XfrError::Malformed(msg) => write!(f, "malformed answer: {msg}"),
            XfrError::NoSoa => f.write_str("no SOA record in answer"),
            XfrError::Timeout => f.write_str("timed out"),
            XfrError::Canceled => f.write_str("canceled"),
            XfrError::Exhausted => f.write_str("no master answered"),
        }
    }
}

impl std::error::Error for XfrError {}
