//! Private records tracking the progress of the signing engine.
//!
//! Walking a large zone takes many quanta and may well be interrupted by
//! a restart. The engine therefore records what it is doing in records
//! of a private type at the apex of the zone. After loading a zone, any
//! incomplete work found there is queued again.
//!
//! Two kinds of records share the private type. A signing marker is five
//! octets long: the algorithm and tag of a key, whether its signatures
//! are being removed, and whether the walk is complete. A chain marker
//! starts with a zero octet followed by NSEC3PARAM data whose flags field
//! carries the state of the chain.

use crate::base::iana::{Rtype, SecAlg};
use crate::base::rdata::{Nsec3param, Rdata, UnknownRdata};
use crate::store::ZoneVersion;
use octseq::parse::Parser;

//------------ SigningMarker -------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SigningMarker {
    pub algorithm: SecAlg,
    pub key_tag: u16,

    /// Whether the signatures of the key are being removed.
    pub removal: bool,

    /// Whether the walk over the zone has finished.
    pub complete: bool,
}

impl SigningMarker {
    pub fn new(algorithm: SecAlg, key_tag: u16, removal: bool) -> Self {
        SigningMarker {
            algorithm,
            key_tag,
            removal,
            complete: false,
        }
    }

    pub fn completed(mut self) -> Self {
        self.complete = true;
        self
    }

    pub fn to_rdata(self, rtype: Rtype) -> Rdata {
        let tag = self.key_tag.to_be_bytes();
        Rdata::Unknown(UnknownRdata::new(
            rtype,
            vec![
                self.algorithm.to_int(),
                tag[0],
                tag[1],
                self.removal.into(),
                self.complete.into(),
            ],
        ))
    }

    fn from_octets(data: &[u8]) -> Option<Self> {
        match *data {
            [alg, hi, lo, removal, complete] if alg != 0 => Some(SigningMarker {
                algorithm: SecAlg::from_int(alg),
                key_tag: u16::from_be_bytes([hi, lo]),
                removal: removal != 0,
                complete: complete != 0,
            }),
            _ => None,
        }
    }

    /// Returns whether this marker is about the given key.
    pub fn is_for(&self, algorithm: SecAlg, key_tag: u16) -> bool {
        self.algorithm == algorithm && self.key_tag == key_tag
    }
}

//------------ ChainMarker ---------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChainMarker {
    /// The parameters of the chain.
    ///
    /// The flags field only carries the opt-out flag.
    pub param: Nsec3param,

    /// The state flags.
    pub state: u8,
}

impl ChainMarker {
    /// The chain is being built.
    pub const CREATE: u8 = 0x80;

    /// The chain is being removed.
    pub const REMOVE: u8 = 0x40;

    /// The chain is the first one of a zone.
    pub const INITIAL: u8 = 0x20;

    /// No NSEC chain is to be built when the chain is removed.
    pub const NONSEC: u8 = 0x10;

    const STATE_MASK: u8 = 0xf0;

    pub fn new(param: Nsec3param, state: u8) -> Self {
        let mut param = param;
        param.flags &= !Self::STATE_MASK;
        ChainMarker { param, state }
    }

    pub fn is_create(&self) -> bool {
        self.state & Self::CREATE != 0
    }

    pub fn is_remove(&self) -> bool {
        self.state & Self::REMOVE != 0
    }

    pub fn is_nonsec(&self) -> bool {
        self.state & Self::NONSEC != 0
    }

    pub fn to_rdata(&self, rtype: Rtype) -> Rdata {
        let mut param = self.param.clone();
        param.flags |= self.state;
        let mut data = vec![0];
        data.extend_from_slice(&param.to_wire());
        Rdata::Unknown(UnknownRdata::new(rtype, data))
    }

    fn from_octets(data: &[u8]) -> Option<Self> {
        let (&first, rest) = data.split_first()?;
        if first != 0 {
            return None;
        }
        let mut parser = Parser::from_ref(rest);
        let param = Nsec3param::parse(&mut parser).ok()?;
        let state = param.flags & Self::STATE_MASK;
        Some(ChainMarker::new(param, state))
    }
}

//------------ Marker --------------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Marker {
    Signing(SigningMarker),
    Chain(ChainMarker),
}

impl Marker {
    pub fn from_rdata(data: &Rdata, rtype: Rtype) -> Option<Self> {
        match data {
            Rdata::Unknown(data) if data.rtype == rtype => {
                if let Some(marker) = SigningMarker::from_octets(&data.data) {
                    Some(Marker::Signing(marker))
                } else {
                    ChainMarker::from_octets(&data.data).map(Marker::Chain)
                }
            }
            _ => None,
        }
    }

    pub fn to_rdata(&self, rtype: Rtype) -> Rdata {
        match self {
            Marker::Signing(marker) => marker.to_rdata(rtype),
            Marker::Chain(marker) => marker.to_rdata(rtype),
        }
    }
}

/// Returns all markers at the apex of a zone.
pub fn markers(version: &ZoneVersion, rtype: Rtype) -> Vec<Marker> {
    version
        .find(version.origin(), rtype)
        .into_iter()
        .flat_map(|rrset| rrset.data.iter())
        .filter_map(|data| Marker::from_rdata(data, rtype))
        .collect()
}

//============ Testing =======================================================
