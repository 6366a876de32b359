//! Resource records.

use super::iana::{Class, Rtype};
use super::name::Name;
use super::rdata::Rdata;
use core::fmt;
use core::time::Duration;
use serde::{Deserialize, Serialize};

//------------ Ttl -----------------------------------------------------------

/// A time-to-live value in seconds.
///
/// Also used for the timer fields of the SOA record which share the
/// same representation.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Ttl(u32);

impl Ttl {
    pub const ZERO: Self = Self(0);

    pub const fn from_secs(secs: u32) -> Self {
        Self(secs)
    }

    pub const fn as_secs(self) -> u32 {
        self.0
    }

    pub fn into_duration(self) -> Duration {
        Duration::from_secs(u64::from(self.0))
    }

    /// Converts a duration, saturating at the largest value.
    pub fn from_duration(duration: Duration) -> Self {
        Self(u32::try_from(duration.as_secs()).unwrap_or(u32::MAX))
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

//------------ Record --------------------------------------------------------

/// A resource record.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Record {
    pub owner: Name,
    pub class: Class,
    pub ttl: Ttl,
    pub data: Rdata,
}

impl Record {
    pub fn new(owner: Name, class: Class, ttl: Ttl, data: Rdata) -> Self {
        Record {
            owner,
            class,
            ttl,
            data,
        }
    }

    pub fn rtype(&self) -> Rtype {
        self.data.rtype()
    }

    /// Returns the type this record covers if it is an RRSIG.
    pub fn covers(&self) -> Option<Rtype> {
        match &self.data {
            Rdata::Rrsig(sig) => Some(sig.type_covered),
            _ => None,
        }
    }

    /// Returns the key identifying the record set this record belongs to.
    pub fn rrset_key(&self) -> RrsetKey {
        RrsetKey::new(self.rtype(), self.covers())
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.owner,
            self.ttl,
            self.class,
            self.rtype(),
            self.data
        )
    }
}

//------------ RrsetKey ------------------------------------------------------

/// Identifies a record set within a node.
///
/// Signatures are kept in separate record sets per covered type, so
/// that the signatures over one record set can be replaced without
/// touching the others.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RrsetKey {
    pub rtype: Rtype,
    pub covers: Option<Rtype>,
}

impl RrsetKey {
    pub fn new(rtype: Rtype, covers: Option<Rtype>) -> Self {
        RrsetKey { rtype, covers }
    }

    pub fn plain(rtype: Rtype) -> Self {
        RrsetKey {
            rtype,
            covers: None,
        }
    }

    pub fn sigs(covers: Rtype) -> Self {
        RrsetKey {
            rtype: Rtype::RRSIG,
            covers: Some(covers),
        }
    }
}

//------------ Rrset ---------------------------------------------------------

/// A set of records with the same owner, class and type.
///
/// All records of a set share one TTL. Duplicate data is never stored.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Rrset {
    pub owner: Name,
    pub class: Class,
    pub key: RrsetKey,
    pub ttl: Ttl,
    pub data: Vec<Rdata>,
}

impl Rrset {
    pub fn new(owner: Name, class: Class, key: RrsetKey, ttl: Ttl) -> Self {
        Rrset {
            owner,
            class,
            key,
            ttl,
            data: Vec::new(),
        }
    }

    pub fn rtype(&self) -> Rtype {
        self.key.rtype
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Adds data, returning whether it was not present yet.
    pub fn insert(&mut self, data: Rdata) -> bool {
        if self.data.contains(&data) {
            false
        } else {
            self.data.push(data);
            true
        }
    }

    /// Removes data, returning whether it was present.
    pub fn remove(&mut self, data: &Rdata) -> bool {
        let len = self.data.len();
        self.data.retain(|item| item != data);
        self.data.len() != len
    }

    pub fn records(&self) -> impl Iterator<Item = Record> + '_ {
        self.data.iter().map(move |data| {
            Record::new(self.owner.clone(), self.class, self.ttl, data.clone())
        })
    }

    /// Returns the data sorted in canonical order as needed for signing.
    pub fn canonical_data(&self) -> Vec<Vec<u8>> {
        let mut res: Vec<_> = self.data.iter().map(Rdata::to_wire).collect();
        res.sort();
        res.dedup();
        res
    }
}

//============ Testing =======================================================
