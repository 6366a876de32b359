//! Basic DNS data types.
//!
//! This module provides the types for the DNS data the zone maintenance
//! code handles: domain names, serial numbers, records and their data,
//! as well as a structured form of the messages exchanged with upstream
//! and downstream servers.

pub use self::iana::{Class, Nsec3HashAlg, Opcode, Rcode, Rtype, SecAlg};
pub use self::message::{Header, Message, Question};
pub use self::name::{Name, NameError};
pub use self::rdata::Rdata;
pub use self::record::{Record, Rrset, RrsetKey, Ttl};
pub use self::serial::{Serial, SerialUpdateMethod};
pub use self::time::UnixTime;

pub mod iana;
pub mod message;
pub mod name;
pub mod rdata;
pub mod record;
pub mod serial;
pub mod time;
