//! Record data.
//!
//! Only the record types zone maintenance has to look into are modelled
//! explicitly. Everything else is carried around as opaque octets.
//!
//! All types can be composed into and parsed from their uncompressed wire
//! format. Since names are always lowercased, the composed format is the
//! canonical format of [RFC 4034, section 6.2] which is what signatures
//! and key tags are calculated over.
//!
//! [RFC 4034, section 6.2]: https://tools.ietf.org/html/rfc4034#section-6.2

use super::iana::{Nsec3HashAlg, Rtype, SecAlg};
use super::name::{Name, NameError};
use super::record::Ttl;
use super::serial::Serial;
use super::time::UnixTime;
use crate::utils::{base16, base32hex, base64, DisplayWith};
use bytes::{BufMut, Bytes};
use core::fmt;
use octseq::parse::{Parser, ShortInput};
use std::collections::BTreeSet;
use std::net::{Ipv4Addr, Ipv6Addr};

//------------ Rdata ---------------------------------------------------------

/// The data of a resource record.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Rdata {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ns(Name),
    Cname(Name),
    Mx(Mx),
    Txt(Bytes),
    Soa(Soa),
    Ds(Ds),
    Dnskey(Dnskey),
    Rrsig(Rrsig),
    Nsec(Nsec),
    Nsec3(Nsec3),
    Nsec3param(Nsec3param),
    Keydata(Keydata),
    Unknown(UnknownRdata),
}

impl Rdata {
    pub fn rtype(&self) -> Rtype {
        match self {
            Rdata::A(_) => Rtype::A,
            Rdata::Aaaa(_) => Rtype::AAAA,
            Rdata::Ns(_) => Rtype::NS,
            Rdata::Cname(_) => Rtype::CNAME,
            Rdata::Mx(_) => Rtype::MX,
            Rdata::Txt(_) => Rtype::TXT,
            Rdata::Soa(_) => Rtype::SOA,
            Rdata::Ds(_) => Rtype::DS,
            Rdata::Dnskey(_) => Rtype::DNSKEY,
            Rdata::Rrsig(_) => Rtype::RRSIG,
            Rdata::Nsec(_) => Rtype::NSEC,
            Rdata::Nsec3(_) => Rtype::NSEC3,
            Rdata::Nsec3param(_) => Rtype::NSEC3PARAM,
            Rdata::Keydata(_) => Rtype::KEYDATA,
            Rdata::Unknown(data) => data.rtype,
        }
    }

    pub fn as_soa(&self) -> Option<&Soa> {
        match self {
            Rdata::Soa(soa) => Some(soa),
            _ => None,
        }
    }

    pub fn as_dnskey(&self) -> Option<&Dnskey> {
        match self {
            Rdata::Dnskey(key) => Some(key),
            _ => None,
        }
    }

    pub fn as_rrsig(&self) -> Option<&Rrsig> {
        match self {
            Rdata::Rrsig(sig) => Some(sig),
            _ => None,
        }
    }

    /// Appends the canonical wire format of the data.
    pub fn compose(&self, target: &mut impl BufMut) {
        match self {
            Rdata::A(addr) => target.put_slice(&addr.octets()),
            Rdata::Aaaa(addr) => target.put_slice(&addr.octets()),
            Rdata::Ns(name) | Rdata::Cname(name) => name.compose(target),
            Rdata::Mx(mx) => {
                target.put_u16(mx.preference);
                mx.exchange.compose(target);
            }
            Rdata::Txt(data) => target.put_slice(data),
            Rdata::Soa(soa) => soa.compose(target),
            Rdata::Ds(ds) => {
                target.put_u16(ds.key_tag);
                target.put_u8(ds.algorithm.to_int());
                target.put_u8(ds.digest_type);
                target.put_slice(&ds.digest);
            }
            Rdata::Dnskey(key) => key.compose(target),
            Rdata::Rrsig(sig) => {
                sig.compose_unsigned(target);
                target.put_slice(&sig.signature);
            }
            Rdata::Nsec(nsec) => {
                nsec.next_name.compose(target);
                nsec.types.compose(target);
            }
            Rdata::Nsec3(nsec3) => nsec3.compose(target),
            Rdata::Nsec3param(param) => param.compose(target),
            Rdata::Keydata(data) => {
                target.put_u32(data.refresh.as_secs());
                target.put_u32(data.add_hold_down.as_secs());
                target.put_u32(data.remove_hold_down.as_secs());
                data.key.compose(target);
            }
            Rdata::Unknown(data) => target.put_slice(&data.data),
        }
    }

    /// Returns the canonical wire format of the data.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut res = Vec::new();
        self.compose(&mut res);
        res
    }

    /// Parses data of the given type from its complete wire format.
    pub fn parse(rtype: Rtype, data: &[u8]) -> Result<Self, RdataError> {
        let mut parser = Parser::from_ref(data);
        let res = Self::parse_inner(rtype, &mut parser)?;
        if parser.remaining() != 0 {
            return Err(RdataError::TrailingData);
        }
        Ok(res)
    }

    fn parse_inner(
        rtype: Rtype,
        parser: &mut Parser<[u8]>,
    ) -> Result<Self, RdataError> {
        let res = match rtype {
            Rtype::A => {
                let mut buf = [0u8; 4];
                parser.parse_buf(&mut buf)?;
                Rdata::A(buf.into())
            }
            Rtype::AAAA => {
                let mut buf = [0u8; 16];
                parser.parse_buf(&mut buf)?;
                Rdata::Aaaa(buf.into())
            }
            Rtype::NS => Rdata::Ns(Name::parse(parser)?),
            Rtype::CNAME => Rdata::Cname(Name::parse(parser)?),
            Rtype::MX => Rdata::Mx(Mx {
                preference: parser.parse_u16_be()?,
                exchange: Name::parse(parser)?,
            }),
            Rtype::TXT => Rdata::Txt(take_rest(parser)?),
            Rtype::SOA => Rdata::Soa(Soa::parse(parser)?),
            Rtype::DS => Rdata::Ds(Ds {
                key_tag: parser.parse_u16_be()?,
                algorithm: parser.parse_u8()?.into(),
                digest_type: parser.parse_u8()?,
                digest: take_rest(parser)?,
            }),
            Rtype::DNSKEY => Rdata::Dnskey(Dnskey::parse(parser)?),
            Rtype::RRSIG => Rdata::Rrsig(Rrsig::parse(parser)?),
            Rtype::NSEC => Rdata::Nsec(Nsec {
                next_name: Name::parse(parser)?,
                types: RtypeBitmap::parse(parser)?,
            }),
            Rtype::NSEC3 => Rdata::Nsec3(Nsec3::parse(parser)?),
            Rtype::NSEC3PARAM => Rdata::Nsec3param(Nsec3param::parse(parser)?),
            Rtype::KEYDATA => Rdata::Keydata(Keydata {
                refresh: UnixTime::from_secs(parser.parse_u32_be()?),
                add_hold_down: UnixTime::from_secs(parser.parse_u32_be()?),
                remove_hold_down: UnixTime::from_secs(parser.parse_u32_be()?),
                key: Dnskey::parse(parser)?,
            }),
            _ => Rdata::Unknown(UnknownRdata {
                rtype,
                data: take_rest(parser)?,
            }),
        };
        Ok(res)
    }
}

impl fmt::Display for Rdata {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Rdata::A(addr) => write!(f, "{}", addr),
            Rdata::Aaaa(addr) => write!(f, "{}", addr),
            Rdata::Ns(name) | Rdata::Cname(name) => write!(f, "{}", name),
            Rdata::Mx(mx) => write!(f, "{} {}", mx.preference, mx.exchange),
            Rdata::Txt(data) => {
                f.write_str("\"")?;
                for &ch in data.iter() {
                    if ch == b'"' || ch == b'\\' {
                        write!(f, "\\{}", ch as char)?;
                    } else if ch == b' ' || ch.is_ascii_graphic() {
                        write!(f, "{}", ch as char)?;
                    } else {
                        write!(f, "\\{:03}", ch)?;
                    }
                }
                f.write_str("\"")
            }
            Rdata::Soa(soa) => write!(
                f,
                "{} {} {} {} {} {} {}",
                soa.mname,
                soa.rname,
                soa.serial,
                soa.refresh,
                soa.retry,
                soa.expire,
                soa.minimum
            ),
            Rdata::Ds(ds) => write!(
                f,
                "{} {} {} {}",
                ds.key_tag,
                ds.algorithm.to_int(),
                ds.digest_type,
                DisplayWith(&ds.digest, base16::display)
            ),
            Rdata::Dnskey(key) => write!(f, "{}", key),
            Rdata::Rrsig(sig) => write!(
                f,
                "{} {} {} {} {} {} {} {} {}",
                sig.type_covered,
                sig.algorithm.to_int(),
                sig.labels,
                sig.original_ttl,
                sig.expiration,
                sig.inception,
                sig.key_tag,
                sig.signer_name,
                DisplayWith(&sig.signature, base64::display)
            ),
            Rdata::Nsec(nsec) => write!(f, "{} {}", nsec.next_name, nsec.types),
            Rdata::Nsec3(nsec3) => {
                write!(
                    f,
                    "{} {} {} {} ",
                    nsec3.hash_algorithm.to_int(),
                    nsec3.flags,
                    nsec3.iterations,
                    DisplaySalt(&nsec3.salt),
                )?;
                for ch in base32hex::encode(&nsec3.next_owner) {
                    write!(f, "{}", ch.to_ascii_uppercase() as char)?;
                }
                if !nsec3.types.is_empty() {
                    write!(f, " {}", nsec3.types)?;
                }
                Ok(())
            }
            Rdata::Nsec3param(param) => write!(f, "{}", param),
            Rdata::Keydata(data) => write!(
                f,
                "{} {} {} {}",
                data.refresh, data.add_hold_down, data.remove_hold_down, data.key
            ),
            Rdata::Unknown(data) => {
                write!(f, "\\# {}", data.data.len())?;
                if !data.data.is_empty() {
                    write!(f, " {}", DisplayWith(&data.data, base16::display))?;
                }
                Ok(())
            }
        }
    }
}

//------------ Soa -----------------------------------------------------------

/// Start of authority data.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Soa {
    pub mname: Name,
    pub rname: Name,
    pub serial: Serial,
    pub refresh: Ttl,
    pub retry: Ttl,
    pub expire: Ttl,
    pub minimum: Ttl,
}

impl Soa {
    /// Returns a copy with the serial replaced.
    pub fn with_serial(&self, serial: Serial) -> Self {
        let mut res = self.clone();
        res.serial = serial;
        res
    }

    fn compose(&self, target: &mut impl BufMut) {
        self.mname.compose(target);
        self.rname.compose(target);
        self.serial.compose(target);
        target.put_u32(self.refresh.as_secs());
        target.put_u32(self.retry.as_secs());
        target.put_u32(self.expire.as_secs());
        target.put_u32(self.minimum.as_secs());
    }

    fn parse(parser: &mut Parser<[u8]>) -> Result<Self, RdataError> {
        Ok(Soa {
            mname: Name::parse(parser)?,
            rname: Name::parse(parser)?,
            serial: Serial::parse(parser)?,
            refresh: Ttl::from_secs(parser.parse_u32_be()?),
            retry: Ttl::from_secs(parser.parse_u32_be()?),
            expire: Ttl::from_secs(parser.parse_u32_be()?),
            minimum: Ttl::from_secs(parser.parse_u32_be()?),
        })
    }
}

//------------ Mx ------------------------------------------------------------

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Mx {
    pub preference: u16,
    pub exchange: Name,
}

//------------ Ds ------------------------------------------------------------

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Ds {
    pub key_tag: u16,
    pub algorithm: SecAlg,
    pub digest_type: u8,
    pub digest: Bytes,
}

//------------ Dnskey --------------------------------------------------------

/// A DNSSEC public key.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Dnskey {
    pub flags: u16,
    pub protocol: u8,
    pub algorithm: SecAlg,
    pub public_key: Bytes,
}

impl Dnskey {
    pub const FLAG_ZONE: u16 = 0x0100;
    pub const FLAG_REVOKE: u16 = 0x0080;
    pub const FLAG_SEP: u16 = 0x0001;

    pub fn new(flags: u16, algorithm: SecAlg, public_key: Bytes) -> Self {
        Dnskey {
            flags,
            protocol: 3,
            algorithm,
            public_key,
        }
    }

    pub fn is_zone_key(&self) -> bool {
        self.flags & Self::FLAG_ZONE != 0
    }

    pub fn is_revoked(&self) -> bool {
        self.flags & Self::FLAG_REVOKE != 0
    }

    pub fn is_sep(&self) -> bool {
        self.flags & Self::FLAG_SEP != 0
    }

    /// Returns the same key with the revoke flag set.
    pub fn revoked(&self) -> Self {
        let mut res = self.clone();
        res.flags |= Self::FLAG_REVOKE;
        res
    }

    /// Returns whether `other` is the same key except for the revoke flag.
    pub fn same_key(&self, other: &Dnskey) -> bool {
        self.algorithm == other.algorithm
            && self.protocol == other.protocol
            && self.public_key == other.public_key
            && (self.flags | Self::FLAG_REVOKE)
                == (other.flags | Self::FLAG_REVOKE)
    }

    /// Calculates the key tag of [RFC 4034, appendix B].
    ///
    /// [RFC 4034, appendix B]: https://tools.ietf.org/html/rfc4034#appendix-B
    pub fn key_tag(&self) -> u16 {
        if self.algorithm == SecAlg::RSAMD5 {
            // The least significant 16 bits of the modulus.
            let len = self.public_key.len();
            if len < 3 {
                return 0;
            }
            return u16::from_be_bytes([
                self.public_key[len - 3],
                self.public_key[len - 2],
            ]);
        }
        let mut buf = Vec::with_capacity(4 + self.public_key.len());
        self.compose(&mut buf);
        let mut acc: u32 = 0;
        for (i, &ch) in buf.iter().enumerate() {
            if i & 1 == 0 {
                acc += u32::from(ch) << 8;
            } else {
                acc += u32::from(ch);
            }
        }
        acc += (acc >> 16) & 0xFFFF;
        (acc & 0xFFFF) as u16
    }

    fn compose(&self, target: &mut impl BufMut) {
        target.put_u16(self.flags);
        target.put_u8(self.protocol);
        target.put_u8(self.algorithm.to_int());
        target.put_slice(&self.public_key);
    }

    fn parse(parser: &mut Parser<[u8]>) -> Result<Self, RdataError> {
        Ok(Dnskey {
            flags: parser.parse_u16_be()?,
            protocol: parser.parse_u8()?,
            algorithm: parser.parse_u8()?.into(),
            public_key: take_rest(parser)?,
        })
    }
}

impl fmt::Display for Dnskey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.flags,
            self.protocol,
            self.algorithm.to_int(),
            DisplayWith(&self.public_key, base64::display)
        )
    }
}

//------------ Rrsig ---------------------------------------------------------

/// A signature over a record set.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Rrsig {
    pub type_covered: Rtype,
    pub algorithm: SecAlg,
    pub labels: u8,
    pub original_ttl: Ttl,
    pub expiration: Serial,
    pub inception: Serial,
    pub key_tag: u16,
    pub signer_name: Name,
    pub signature: Bytes,
}

impl Rrsig {
    /// Appends everything but the signature.
    ///
    /// This is the first part of the data a signature is calculated over.
    pub fn compose_unsigned(&self, target: &mut impl BufMut) {
        target.put_u16(self.type_covered.to_int());
        target.put_u8(self.algorithm.to_int());
        target.put_u8(self.labels);
        target.put_u32(self.original_ttl.as_secs());
        self.expiration.compose(target);
        self.inception.compose(target);
        target.put_u16(self.key_tag);
        self.signer_name.compose(target);
    }

    fn parse(parser: &mut Parser<[u8]>) -> Result<Self, RdataError> {
        Ok(Rrsig {
            type_covered: parser.parse_u16_be()?.into(),
            algorithm: parser.parse_u8()?.into(),
            labels: parser.parse_u8()?,
            original_ttl: Ttl::from_secs(parser.parse_u32_be()?),
            expiration: Serial::parse(parser)?,
            inception: Serial::parse(parser)?,
            key_tag: parser.parse_u16_be()?,
            signer_name: Name::parse(parser)?,
            signature: take_rest(parser)?,
        })
    }
}

//------------ Nsec ----------------------------------------------------------

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Nsec {
    pub next_name: Name,
    pub types: RtypeBitmap,
}

//------------ Nsec3 ---------------------------------------------------------

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Nsec3 {
    pub hash_algorithm: Nsec3HashAlg,
    pub flags: u8,
    pub iterations: u16,
    pub salt: Bytes,
    pub next_owner: Bytes,
    pub types: RtypeBitmap,
}

impl Nsec3 {
    pub const FLAG_OPT_OUT: u8 = 0x01;

    pub fn opt_out(&self) -> bool {
        self.flags & Self::FLAG_OPT_OUT != 0
    }

    /// Returns whether this record belongs to the chain of `param`.
    ///
    /// The flags are not part of the chain identity.
    pub fn matches(&self, param: &Nsec3param) -> bool {
        self.hash_algorithm == param.hash_algorithm
            && self.iterations == param.iterations
            && self.salt == param.salt
    }

    fn compose(&self, target: &mut impl BufMut) {
        target.put_u8(self.hash_algorithm.to_int());
        target.put_u8(self.flags);
        target.put_u16(self.iterations);
        target.put_u8(self.salt.len() as u8);
        target.put_slice(&self.salt);
        target.put_u8(self.next_owner.len() as u8);
        target.put_slice(&self.next_owner);
        self.types.compose(target);
    }

    fn parse(parser: &mut Parser<[u8]>) -> Result<Self, RdataError> {
        let hash_algorithm = parser.parse_u8()?.into();
        let flags = parser.parse_u8()?;
        let iterations = parser.parse_u16_be()?;
        let salt = take_len(parser)?;
        let next_owner = take_len(parser)?;
        Ok(Nsec3 {
            hash_algorithm,
            flags,
            iterations,
            salt,
            next_owner,
            types: RtypeBitmap::parse(parser)?,
        })
    }
}

//------------ Nsec3param ----------------------------------------------------

/// The parameters of an NSEC3 chain.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Nsec3param {
    pub hash_algorithm: Nsec3HashAlg,
    pub flags: u8,
    pub iterations: u16,
    pub salt: Bytes,
}

impl Nsec3param {
    pub fn new(
        hash_algorithm: Nsec3HashAlg,
        flags: u8,
        iterations: u16,
        salt: Bytes,
    ) -> Self {
        Nsec3param {
            hash_algorithm,
            flags,
            iterations,
            salt,
        }
    }

    /// Returns whether both describe the same chain, ignoring flags.
    pub fn same_chain(&self, other: &Nsec3param) -> bool {
        self.hash_algorithm == other.hash_algorithm
            && self.iterations == other.iterations
            && self.salt == other.salt
    }

    fn compose(&self, target: &mut impl BufMut) {
        target.put_u8(self.hash_algorithm.to_int());
        target.put_u8(self.flags);
        target.put_u16(self.iterations);
        target.put_u8(self.salt.len() as u8);
        target.put_slice(&self.salt);
    }

    pub fn parse(parser: &mut Parser<[u8]>) -> Result<Self, RdataError> {
        Ok(Nsec3param {
            hash_algorithm: parser.parse_u8()?.into(),
            flags: parser.parse_u8()?,
            iterations: parser.parse_u16_be()?,
            salt: take_len(parser)?,
        })
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut res = Vec::new();
        self.compose(&mut res);
        res
    }
}

impl fmt::Display for Nsec3param {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.hash_algorithm.to_int(),
            self.flags,
            self.iterations,
            DisplaySalt(&self.salt)
        )
    }
}

struct DisplaySalt<'a>(&'a [u8]);

impl fmt::Display for DisplaySalt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("-")
        } else {
            base16::display(self.0, f)
        }
    }
}

//------------ Keydata -------------------------------------------------------

/// The state of a managed trust anchor.
///
/// This is the private KEYDATA record type kept in key zones. Besides
/// the key itself it carries the time of the next refresh and the two
/// RFC 5011 hold-down timers. A zero hold-down is unset.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Keydata {
    pub refresh: UnixTime,
    pub add_hold_down: UnixTime,
    pub remove_hold_down: UnixTime,
    pub key: Dnskey,
}

//------------ UnknownRdata --------------------------------------------------

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct UnknownRdata {
    pub rtype: Rtype,
    pub data: Bytes,
}

impl UnknownRdata {
    pub fn new(rtype: Rtype, data: impl Into<Bytes>) -> Self {
        UnknownRdata {
            rtype,
            data: data.into(),
        }
    }
}

//------------ RtypeBitmap ---------------------------------------------------

/// The set of types present at a name as used by NSEC and NSEC3.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct RtypeBitmap(BTreeSet<Rtype>);

impl RtypeBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rtype: Rtype) {
        self.0.insert(rtype);
    }

    pub fn contains(&self, rtype: Rtype) -> bool {
        self.0.contains(&rtype)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Rtype> + '_ {
        self.0.iter().copied()
    }

    /// Appends the window block encoding of RFC 4034, section 4.1.2.
    fn compose(&self, target: &mut impl BufMut) {
        let mut current: Option<(u8, [u8; 32])> = None;
        for rtype in &self.0 {
            let value = rtype.to_int();
            let window = (value >> 8) as u8;
            match current {
                Some((w, _)) if w == window => {}
                _ => {
                    if let Some((w, bits)) = current.take() {
                        put_window(target, w, &bits);
                    }
                    current = Some((window, [0u8; 32]));
                }
            }
            if let Some((_, bits)) = current.as_mut() {
                let low = usize::from(value & 0xFF);
                bits[low / 8] |= 0x80 >> (low % 8);
            }
        }
        if let Some((w, bits)) = current {
            put_window(target, w, &bits);
        }
    }

    fn parse(parser: &mut Parser<[u8]>) -> Result<Self, RdataError> {
        let mut res = RtypeBitmap::new();
        while parser.remaining() > 0 {
            let window = u16::from(parser.parse_u8()?);
            let len = usize::from(parser.parse_u8()?);
            if len == 0 || len > 32 {
                return Err(RdataError::BadBitmap);
            }
            let mut bits = [0u8; 32];
            parser.parse_buf(&mut bits[..len])?;
            for (i, byte) in bits[..len].iter().enumerate() {
                for bit in 0..8 {
                    if byte & (0x80 >> bit) != 0 {
                        let value = (window << 8) | (i as u16 * 8 + bit);
                        res.insert(Rtype::from_int(value));
                    }
                }
            }
        }
        Ok(res)
    }
}

fn put_window(target: &mut impl BufMut, window: u8, bits: &[u8; 32]) {
    let len = match bits.iter().rposition(|b| *b != 0) {
        Some(pos) => pos + 1,
        None => return,
    };
    target.put_u8(window);
    target.put_u8(len as u8);
    target.put_slice(&bits[..len]);
}

impl FromIterator<Rtype> for RtypeBitmap {
    fn from_iter<T: IntoIterator<Item = Rtype>>(iter: T) -> Self {
        RtypeBitmap(iter.into_iter().collect())
    }
}

impl fmt::Display for RtypeBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for rtype in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "{}", rtype)?;
        }
        Ok(())
    }
}

//------------ Helper Functions ----------------------------------------------

fn take_rest(parser: &mut Parser<[u8]>) -> Result<Bytes, RdataError> {
    let mut buf = vec![0u8; parser.remaining()];
    parser.parse_buf(&mut buf)?;
    Ok(buf.into())
}

fn take_len(parser: &mut Parser<[u8]>) -> Result<Bytes, RdataError> {
    let len = usize::from(parser.parse_u8()?);
    let mut buf = vec![0u8; len];
    parser.parse_buf(&mut buf)?;
    Ok(buf.into())
}

/// Returns the NSEC3 owner label for a hash.
pub fn nsec3_label(hash: &[u8]) -> Vec<u8> {
    base32hex::encode(hash)
}

//------------ RdataError ----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RdataError {
    ShortInput,
    TrailingData,
    BadBitmap,
    Name(NameError),
}

impl From<ShortInput> for RdataError {
    fn from(_: ShortInput) -> Self {
        RdataError::ShortInput
    }
}

impl From<NameError> for RdataError {
    fn from(err: NameError) -> Self {
        RdataError::Name(err)
    }
}

impl fmt::Display for RdataError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RdataError::ShortInput => f.write_str("short record data"),
            RdataError::TrailingData => f.write_str("trailing record data"),
            RdataError::BadBitmap => f.write_str("malformed type bitmap"),
            RdataError::Name(err) => write!(f, "bad name in record data: {}", err),
        }
    }
}

impl std::error::Error for RdataError {}

//============ Testing =======================================================
