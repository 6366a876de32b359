//! Online DNSSEC signing.
//!
//! The signing engine keeps the signatures of a zone current while the
//! zone is being served. It consists of three resumable procedures that
//! each do a bounded amount of work per call:
//!
//! * [`resign`] renews signatures that are about to expire,
//! * [`keywalk`] walks the zone adding the signatures of a new key or
//!   removing those of a retired one,
//! * [`chain`] builds and removes NSEC and NSEC3 chains.
//!
//! Key management, i.e., publishing and removing keys according to their
//! timing metadata, lives in [`rekey`].
//!
//! All procedures collect their changes in a [`Batch`], a private working
//! copy of the zone. When the batch is finished, the SOA serial is
//! increased exactly once and the accumulated [`Diff`] is returned for the
//! zone to commit and journal.

pub use self::keys::{
    Ed25519Key, KeyPair, KeyStore, KeyTiming, MemoryKeyStore, ZoneKey,
};

pub mod chain;
pub mod keys;
pub mod keywalk;
pub mod marker;
pub mod nsec;
pub mod nsec3;
pub mod rekey;
pub mod resign;
pub mod update;

use crate::base::iana::{Class, Rtype, SecAlg};
use crate::base::name::Name;
use crate::base::rdata::{Rdata, Rrsig};
use crate::base::record::{Record, Rrset};
use crate::base::serial::{Serial, SerialUpdateMethod};
use crate::base::time::UnixTime;
use crate::store::{DbError, Diff, ZoneVersion};
use core::fmt;
use core::time::Duration;
use tracing::{debug, warn};

//------------ Constants -----------------------------------------------------

/// How far back the inception of new signatures lies to allow for clock
/// skew.
pub const INCEPTION_SKEW: Duration = Duration::from_secs(3600);

/// Delay before the next quantum of unfinished work.
pub const QUANTUM_DELAY: Duration = Duration::from_millis(10);

//------------ Signer --------------------------------------------------------

/// Creates and removes signatures according to the keys of a zone.
///
/// A signer is created for one unit of work with the keys as they are at
/// that moment. A key counts as usable for signing if its private half
/// is available and it is active. Keys that have been deleted are
/// ignored entirely.
#[derive(Clone, Debug)]
pub struct Signer {
    origin: Name,
    class: Class,
    keys: Vec<ZoneKey>,
    now: UnixTime,

    /// The signature validity interval in seconds.
    validity: u32,

    inception: Serial,

    /// Expiration for all signatures but those of the SOA.
    expiration: Serial,

    /// Expiration for the SOA signatures.
    ///
    /// The SOA is re-signed whenever anything changes, so it always gets
    /// the full validity.
    soa_expiration: Serial,

    check_ksk: bool,
    keyset_kskonly: bool,
    serial_method: SerialUpdateMethod,
}

impl Signer {
    pub fn new(
        origin: Name,
        class: Class,
        mut keys: Vec<ZoneKey>,
        now: UnixTime,
        validity: u32,
    ) -> Self {
        keys.retain(|key| !key.is_deleted(now));
        let expiration = now.add(Duration::from_secs(validity.into()));
        Signer {
            origin,
            class,
            keys,
            now,
            validity,
            inception: now.sub(INCEPTION_SKEW).to_serial(),
            expiration: expiration.to_serial(),
            soa_expiration: expiration.to_serial(),
            check_ksk: true,
            keyset_kskonly: false,
            serial_method: SerialUpdateMethod::Increment,
        }
    }

    /// Sets whether KSKs sign only the DNSKEY set when there are ZSKs.
    pub fn with_check_ksk(mut self, check_ksk: bool) -> Self {
        self.check_ksk = check_ksk;
        self
    }

    /// Sets whether only KSKs sign the DNSKEY set.
    pub fn with_keyset_kskonly(mut self, kskonly: bool) -> Self {
        self.keyset_kskonly = kskonly;
        self
    }

    pub fn with_serial_method(mut self, method: SerialUpdateMethod) -> Self {
        self.serial_method = method;
        self
    }

    /// Spreads out the expiration of ordinary signatures.
    ///
    /// Signatures made at the same time would otherwise all expire at
    /// the same time, too. Expiration is brought forward by less than a
    /// quarter of the validity interval. The SOA is not affected.
    pub fn with_jitter(mut self, jitter: u32) -> Self {
        let window = self.validity / 4;
        let offset = if window == 0 { 0 } else { jitter % window };
        self.expiration =
            Serial(self.soa_expiration.into_int().wrapping_sub(offset));
        self
    }

    pub fn origin(&self) -> &Name {
        &self.origin
    }

    pub fn class(&self) -> Class {
        self.class
    }

    pub fn keys(&self) -> &[ZoneKey] {
        &self.keys
    }

    pub fn now(&self) -> UnixTime {
        self.now
    }

    pub fn serial_method(&self) -> SerialUpdateMethod {
        self.serial_method
    }

    /// Returns whether any key can currently sign.
    pub fn can_sign(&self) -> bool {
        self.keys.iter().any(|key| key.can_sign(self.now))
    }

    /// Returns whether a key has the given algorithm and tag.
    ///
    /// Revoking a key changes its tag, so both tags match.
    pub fn key_matches(&self, key: &ZoneKey, alg: SecAlg, tag: u16) -> bool {
        key.algorithm() == alg
            && (key.key_tag() == tag || key.dnskey_at(self.now).key_tag() == tag)
    }

    fn is_revoked(&self, key: &ZoneKey) -> bool {
        key.is_revoked(self.now)
    }

    /// Returns whether the key at `idx` signs record sets of `rtype`.
    ///
    /// A revoked key only signs the DNSKEY set. If there are both KSKs and
    /// ZSKs of an algorithm, KSKs only sign the DNSKEY set and ZSKs sign
    /// everything else, including the DNSKEY set unless that is to be
    /// signed by KSKs only.
    fn signs(&self, idx: usize, rtype: Rtype) -> bool {
        let key = &self.keys[idx];
        if !key.can_sign(self.now) {
            return false;
        }
        let mut both = false;
        if self.check_ksk && !self.is_revoked(key) {
            let (mut have_ksk, mut have_nonksk) = (key.is_ksk(), !key.is_ksk());
            for (j, other) in self.keys.iter().enumerate() {
                if j == idx
                    || other.algorithm() != key.algorithm()
                    || self.is_revoked(other)
                {
                    continue;
                }
                if other.is_ksk() {
                    have_ksk = true;
                } else {
                    have_nonksk = true;
                }
                both = have_ksk && have_nonksk;
                if both {
                    break;
                }
            }
        }
        if both {
            if rtype == Rtype::DNSKEY {
                key.is_ksk() || !self.keyset_kskonly
            } else {
                !key.is_ksk()
            }
        } else {
            !self.is_revoked(key) || rtype == Rtype::DNSKEY
        }
    }

    /// Creates the signature of a record set with the given key.
    pub fn sign_rrset(
        &self,
        rrset: &Rrset,
        key: &ZoneKey,
        expiration: Serial,
    ) -> Result<Record, SignError> {
        if !rrset.rtype().is_signable() {
            return Err(SignError::Unsignable(rrset.rtype()));
        }
        let mut labels = rrset.owner.label_count();
        if rrset.owner.is_wildcard() {
            labels -= 1;
        }
        let mut rrsig = Rrsig {
            type_covered: rrset.rtype(),
            algorithm: key.algorithm(),
            labels: labels as u8,
            original_ttl: rrset.ttl,
            expiration,
            inception: self.inception,
            key_tag: key.dnskey_at(self.now).key_tag(),
            signer_name: self.origin.clone(),
            signature: Default::default(),
        };

        rrsig.signature = key.sign(&signed_data(&rrsig, rrset))?;

        Ok(Record::new(
            rrset.owner.clone(),
            rrset.class,
            rrset.ttl,
            Rdata::Rrsig(rrsig),
        ))
    }

    fn expiration_for(&self, rtype: Rtype) -> Serial {
        if rtype == Rtype::SOA {
            self.soa_expiration
        } else {
            self.expiration
        }
    }

    /// Adds the signatures for a record set to `diff`.
    ///
    /// Returns the number of signatures created. A missing record set is
    /// not an error.
    pub fn add_sigs(
        &self,
        version: &ZoneVersion,
        owner: &Name,
        rtype: Rtype,
        diff: &mut Diff,
    ) -> Result<usize, SignError> {
        let Some(rrset) = version.find(owner, rtype) else {
            return Ok(0);
        };
        let mut count = 0;
        for idx in 0..self.keys.len() {
            if !self.signs(idx, rtype) {
                continue;
            }
            let sig = self.sign_rrset(
                rrset,
                &self.keys[idx],
                self.expiration_for(rtype),
            )?;
            diff.add(sig);
            count += 1;
        }
        Ok(count)
    }

    /// Adds the signature of a single key to a record set.
    ///
    /// Nothing is added if the set is already signed by the key or if the
    /// key doesn't sign sets of this type.
    pub fn add_sig_with_key(
        &self,
        version: &ZoneVersion,
        owner: &Name,
        rtype: Rtype,
        alg: SecAlg,
        tag: u16,
        diff: &mut Diff,
    ) -> Result<usize, SignError> {
        let Some(rrset) = version.find(owner, rtype) else {
            return Ok(0);
        };
        let Some(idx) = self
            .keys
            .iter()
            .position(|key| self.key_matches(key, alg, tag))
        else {
            return Ok(0);
        };
        if !self.signs(idx, rtype) || self.is_signed_with(version, owner, rtype, alg, tag)
        {
            return Ok(0);
        }
        let sig =
            self.sign_rrset(rrset, &self.keys[idx], self.expiration_for(rtype))?;
        diff.add(sig);
        Ok(1)
    }

    /// Returns whether a record set carries a signature by the given key.
    pub fn is_signed_with(
        &self,
        version: &ZoneVersion,
        owner: &Name,
        rtype: Rtype,
        alg: SecAlg,
        tag: u16,
    ) -> bool {
        let key = self.keys.iter().find(|key| self.key_matches(key, alg, tag));
        version
            .signatures(owner, rtype)
            .into_iter()
            .flat_map(|rrset| rrset.data.iter())
            .filter_map(Rdata::as_rrsig)
            .any(|sig| match key {
                Some(key) => self.key_matches(key, sig.algorithm, sig.key_tag),
                None => sig.algorithm == alg && sig.key_tag == tag,
            })
    }

    /// Decides whether an existing signature may be deleted.
    ///
    /// It is okay to delete a signature if there is a usable key with the
    /// same algorithm to replace it or if the key that made it is gone.
    /// Returns the decision and whether a warning about a missing
    /// replacement is in order.
    fn delsig_ok(&self, sig: &Rrsig) -> (bool, bool) {
        let (mut have_ksk, mut have_zsk) = (false, false);
        let (mut have_pksk, mut have_pzsk) = (false, false);
        for key in &self.keys {
            if key.algorithm() != sig.algorithm {
                continue;
            }
            let private = key.can_sign(self.now);
            if key.is_ksk() {
                have_ksk = true;
                have_pksk |= private;
            } else {
                have_zsk = true;
                have_pzsk |= private;
            }
        }
        let warn = have_zsk && have_ksk && !have_pzsk;
        if have_pksk || have_pzsk {
            return (true, warn);
        }
        let present = self
            .keys
            .iter()
            .any(|key| self.key_matches(key, sig.algorithm, sig.key_tag));
        (!present, warn)
    }

    /// Removes the signatures of a record set that are to be replaced.
    ///
    /// Signatures that cannot be replaced because only the public half of
    /// their key is around stay in place and are marked offline. Expired
    /// signatures are always removed.
    pub fn del_sigs(
        &self,
        version: &ZoneVersion,
        owner: &Name,
        covers: Rtype,
        diff: &mut Diff,
    ) {
        let Some(rrset) = version.signatures(owner, covers) else {
            return;
        };
        for record in rrset.records() {
            let Some(sig) = record.data.as_rrsig() else {
                continue;
            };
            let expired =
                UnixTime::from_secs(sig.expiration.into_int()) <= self.now;
            let delete = if expired {
                true
            } else if covers == Rtype::DNSKEY {
                // Signatures over the key set are only kept while their
                // key is around without its private half.
                match self
                    .keys
                    .iter()
                    .find(|key| self.key_matches(key, sig.algorithm, sig.key_tag))
                {
                    Some(key) => key.can_sign(self.now),
                    None => true,
                }
            } else {
                let (ok, warn) = self.delsig_ok(sig);
                if warn {
                    warn!(
                        "Zone '{}': key {}/{} missing or inactive and has no \
                         replacement: retaining signatures",
                        self.origin, sig.algorithm, sig.key_tag
                    );
                }
                ok
            };
            if delete {
                diff.delete(record.clone());
            } else {
                debug!(
                    "Zone '{}': keeping offline signature {}/{} over {} {}",
                    self.origin, sig.algorithm, sig.key_tag, owner, covers
                );
                diff.mark_offline(owner.clone(), covers);
            }
        }
    }

    /// Replaces the signatures of a record set.
    pub fn resign_rrset(
        &self,
        version: &ZoneVersion,
        owner: &Name,
        rtype: Rtype,
        diff: &mut Diff,
    ) -> Result<usize, SignError> {
        self.del_sigs(version, owner, rtype, diff);
        self.add_sigs(version, owner, rtype, diff)
    }

    /// Returns whether the record set at `owner` is signed at all.
    ///
    /// Data below a zone cut is glue and isn't signed. At a delegation
    /// only DS and the denial of existence records are.
    pub fn is_signed_rrset(version: &ZoneVersion, owner: &Name, rtype: Rtype) -> bool {
        if !rtype.is_signable() || version.is_occluded(owner) {
            return false;
        }
        if version.is_delegation(owner) {
            return matches!(rtype, Rtype::DS | Rtype::NSEC | Rtype::NSEC3);
        }
        true
    }
}

//------------ signed_data ---------------------------------------------------

/// Returns the data covered by a signature over a record set.
///
/// This is the RRSIG RDATA without the signature followed by the records
/// in canonical form and order, using the original TTL of the signature.
pub fn signed_data(rrsig: &Rrsig, rrset: &Rrset) -> Vec<u8> {
    let mut data = Vec::new();
    rrsig.compose_unsigned(&mut data);
    let mut owner = Vec::with_capacity(rrset.owner.wire_len());
    rrset.owner.compose(&mut owner);
    for rdata in rrset.canonical_data() {
        data.extend_from_slice(&owner);
        data.extend_from_slice(&rrset.rtype().to_int().to_be_bytes());
        data.extend_from_slice(&rrset.class.to_int().to_be_bytes());
        data.extend_from_slice(&rrsig.original_ttl.as_secs().to_be_bytes());
        data.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        data.extend_from_slice(&rdata);
    }
    data
}

//------------ Batch ---------------------------------------------------------

/// A set of changes made on a private copy of a zone version.
///
/// Every change is applied to the working copy right away so that later
/// steps see the effects of earlier ones.
#[derive(Clone, Debug)]
pub struct Batch {
    version: ZoneVersion,
    diff: Diff,
    bumped: bool,
}

impl Batch {
    pub fn new(base: &ZoneVersion) -> Self {
        Batch {
            version: base.fork(),
            diff: Diff::new(),
            bumped: false,
        }
    }

    /// Returns the working copy.
    pub fn version(&self) -> &ZoneVersion {
        &self.version
    }

    pub fn diff(&self) -> &Diff {
        &self.diff
    }

    pub fn is_empty(&self) -> bool {
        self.diff.is_empty()
    }

    /// Applies a diff to the working copy and adds it to the batch.
    pub fn apply(&mut self, diff: Diff) -> Result<(), SignError> {
        if diff.is_empty() {
            return Ok(());
        }
        self.version.update(&diff)?;
        self.diff.extend(diff);
        Ok(())
    }

    /// Replaces the signatures of a record set in the working copy.
    pub fn resign_rrset(
        &mut self,
        signer: &Signer,
        owner: &Name,
        rtype: Rtype,
    ) -> Result<usize, SignError> {
        let mut diff = Diff::new();
        let count = signer.resign_rrset(&self.version, owner, rtype, &mut diff)?;
        self.apply(diff)?;
        Ok(count)
    }

    /// Brings the signatures of a record set in line with its data.
    ///
    /// If the set is gone, so are its signatures.
    pub fn update_sigs(
        &mut self,
        signer: &Signer,
        owner: &Name,
        rtype: Rtype,
    ) -> Result<usize, SignError> {
        if self.version.find(owner, rtype).is_some() {
            if signer.can_sign()
                && Signer::is_signed_rrset(&self.version, owner, rtype)
            {
                return self.resign_rrset(signer, owner, rtype);
            }
            return Ok(0);
        }
        let mut diff = Diff::new();
        if let Some(sigs) = self.version.signatures(owner, rtype) {
            for record in sigs.records() {
                diff.delete(record);
            }
        }
        self.apply(diff)?;
        Ok(0)
    }

    /// Increases the SOA serial and re-signs the SOA.
    pub fn bump_serial(&mut self, signer: &Signer) -> Result<Serial, SignError> {
        let origin = self.version.origin().clone();
        let (old, ttl) = match self.version.soa() {
            Some((soa, ttl)) => (soa.clone(), ttl),
            None => return Err(SignError::NoSoa),
        };
        let serial = old.serial.next(signer.serial_method(), signer.now());
        let class = self.version.class();
        let mut diff = Diff::new();
        diff.delete(Record::new(origin.clone(), class, ttl, Rdata::Soa(old.clone())));
        diff.add(Record::new(
            origin.clone(),
            class,
            ttl,
            Rdata::Soa(old.with_serial(serial)),
        ));
        self.apply(diff)?;
        if signer.can_sign() && self.version.find(&origin, Rtype::DNSKEY).is_some()
        {
            self.resign_rrset(signer, &origin, Rtype::SOA)?;
        }
        self.bumped = true;
        Ok(serial)
    }

    /// Finishes the batch.
    ///
    /// Returns `None` if nothing changed. Otherwise the serial is bumped
    /// and the complete diff is returned.
    pub fn finish(mut self, signer: &Signer) -> Result<Option<Diff>, SignError> {
        if self.diff.is_empty() {
            return Ok(None);
        }
        if !self.bumped {
            self.bump_serial(signer)?;
        }
        Ok(Some(self.diff))
    }
}

//------------ SignError -----------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SignError {
    /// The key data is malformed.
    BadKey,

    /// The cryptographic backend failed.
    Crypto,

    /// A signature did not verify.
    BadSignature,

    UnsupportedAlgorithm(SecAlg),

    /// Signing was requested with a key that only has its public half.
    NoPrivateKey(u16),

    /// Records of this type are never signed.
    Unsignable(Rtype),

    /// An NSEC3 chain was requested while keys of an algorithm that
    /// doesn't support NSEC3 are present.
    Nsec3Incompatible(SecAlg),

    /// The NSEC3 parameters can't be used.
    BadNsec3Params,

    /// The zone has no SOA record.
    NoSoa,

    /// The key store failed.
    KeyStore(String),

    Db(DbError),
}

impl From<DbError> for SignError {
    fn from(err: DbError) -> Self {
        SignError::Db(err)
    }
}

//--- Display

impl fmt::Display for SignError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SignError::BadKey => f.write_str("malformed key"),
            SignError::Crypto => f.write_str("cryptographic operation failed"),
            SignError::BadSignature => f.write_str("bad signature"),
            SignError::UnsupportedAlgorithm(alg) => {
                write!(f, "unsupported algorithm {}", alg)
            }
            SignError::NoPrivateKey(tag) => {
                write!(f, "private key {} not available", tag)
            }
            SignError::Unsignable(rtype) => {
                write!(f, "{} records are not signed", rtype)
            }
            SignError::Nsec3Incompatible(alg) => write!(
                f,
                "NSEC3 chain not allowed with NSEC only algorithm {}",
                alg
            ),
            SignError::BadNsec3Params => {
                f.write_str("unusable NSEC3 parameters")
            }
            SignError::NoSoa => f.write_str("zone has no SOA record"),
            SignError::KeyStore(msg) => write!(f, "key store: {}", msg),
            SignError::Db(err) => write!(f, "database: {}", err),
        }
    }
}

impl std::error::Error for SignError {}

//============ Testing =======================================================

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::base::record::Ttl;
    use crate::base::rdata::{Dnskey, Soa};
    use core::str::FromStr;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    pub const NOW: u32 = 1_700_000_000;

    pub fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    pub fn record(owner: &str, data: Rdata) -> Record {
        Record::new(name(owner), Class::IN, Ttl::from_secs(3600), data)
    }

    pub fn soa(serial: u32) -> Rdata {
        Rdata::Soa(Soa {
            mname: name("ns1.example."),
            rname: name("hostmaster.example."),
            serial: Serial(serial),
            refresh: Ttl::from_secs(3600),
            retry: Ttl::from_secs(600),
            expire: Ttl::from_secs(86400),
            minimum: Ttl::from_secs(300),
        })
    }

    /// A small zone with a delegation and some glue.
    pub fn zone(serial: u32) -> ZoneVersion {
        let a = |n| Rdata::A(Ipv4Addr::new(192, 0, 2, n));
        ZoneVersion::from_records(
            name("example."),
            Class::IN,
            [
                record("example.", soa(serial)),
                record("example.", Rdata::Ns(name("ns1.example."))),
                record("ns1.example.", a(1)),
                record("www.example.", a(2)),
                record("a.b.c.example.", a(3)),
                record("sub.example.", Rdata::Ns(name("ns.sub.example."))),
                record("ns.sub.example.", a(4)),
            ],
        )
        .unwrap()
    }

    pub fn ed_key(seed: u8, flags: u16) -> ZoneKey {
        let key = Ed25519Key::from_seed(&[seed; 32]).unwrap();
        let dnskey = key.dnskey(flags);
        ZoneKey::new(dnskey, Some(Arc::new(key)))
    }

    pub fn public_key(alg: SecAlg, seed: u8, flags: u16) -> ZoneKey {
        ZoneKey::new(
            Dnskey::new(flags, alg, bytes::Bytes::from(vec![seed; 32])),
            None,
        )
    }

    /// Adds the DNSKEY set for the keys to a version.
    pub fn with_keys(version: &ZoneVersion, keys: &[ZoneKey]) -> ZoneVersion {
        let mut diff = Diff::new();
        for key in keys {
            diff.add(record(
                "example.",
                Rdata::Dnskey(key.dnskey_at(UnixTime::from_secs(NOW))),
            ));
        }
        version.apply(&diff).unwrap().0
    }

    pub fn signer(keys: Vec<ZoneKey>) -> Signer {
        Signer::new(
            name("example."),
            Class::IN,
            keys,
            UnixTime::from_secs(NOW),
            30 * 86400,
        )
    }
}

#[cfg(test)]
mod test {
    use super::test_util::*;
    use super::*;
    use crate::base::rdata::Dnskey;
    use crate::sign::keys::verify;

    fn sigs_by(version: &ZoneVersion, owner: &str, covers: Rtype) -> Vec<u16> {
        let mut res: Vec<_> = version
            .signatures(&name(owner), covers)
            .into_iter()
            .flat_map(|rrset| rrset.data.iter())
            .filter_map(Rdata::as_rrsig)
            .map(|sig| sig.key_tag)
            .collect();
        res.sort();
        res
    }

    #[test]
    fn jitter_follows_the_validity_interval() {
        let week = 7 * 86400;
        let signer = Signer::new(
            name("example."),
            Class::IN,
            Vec::new(),
            UnixTime::from_secs(NOW),
            week,
        );
        let full = Serial(NOW + week);
        assert_eq!(signer.clone().with_jitter(0).expiration_for(Rtype::A), full);

        let jittered = signer.clone().with_jitter(week / 4 + 100);
        assert_eq!(jittered.expiration_for(Rtype::A), Serial(NOW + week - 100));
        assert_eq!(jittered.expiration_for(Rtype::SOA), full);

        // Never earlier than three quarters into the interval.
        let jittered = signer.with_jitter(u32::MAX);
        let earliest = NOW + week - week / 4;
        assert!(jittered.expiration_for(Rtype::A).into_int() > earliest);

        let short = Signer::new(
            name("example."),
            Class::IN,
            Vec::new(),
            UnixTime::from_secs(NOW),
            3,
        );
        assert_eq!(
            short.with_jitter(12345).expiration_for(Rtype::A),
            Serial(NOW + 3)
        );
    }

    #[test]
    fn signatures_verify() {
        let key = ed_key(1, Dnskey::FLAG_ZONE);
        let version = with_keys(&zone(1), &[key.clone()]);
        let signer = signer(vec![key.clone()]);
        let rrset = version.find(&name("www.example."), Rtype::A).unwrap();
        let sig = signer
            .sign_rrset(rrset, &key, Serial(NOW + 86400))
            .unwrap();
        let rrsig = sig.data.as_rrsig().unwrap();
        assert_eq!(rrsig.labels, 2);

        let mut data = Vec::new();
        rrsig.compose_unsigned(&mut data);
        let mut owner = Vec::new();
        rrset.owner.compose(&mut owner);
        for rdata in rrset.canonical_data() {
            data.extend_from_slice(&owner);
            data.extend_from_slice(&[0, 1, 0, 1]);
            data.extend_from_slice(&3600u32.to_be_bytes());
            data.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            data.extend_from_slice(&rdata);
        }
        verify(&key.dnskey, &data, &rrsig.signature).unwrap();
    }

    #[test]
    fn ksk_and_zsk_split_the_work() {
        let ksk = ed_key(1, Dnskey::FLAG_ZONE | Dnskey::FLAG_SEP);
        let zsk = ed_key(2, Dnskey::FLAG_ZONE);
        let version = with_keys(&zone(1), &[ksk.clone(), zsk.clone()]);
        let signer = signer(vec![ksk.clone(), zsk.clone()]);
        let mut batch = Batch::new(&version);
        batch.resign_rrset(&signer, &name("example."), Rtype::DNSKEY).unwrap();
        batch.resign_rrset(&signer, &name("www.example."), Rtype::A).unwrap();
        let mut both = vec![ksk.key_tag(), zsk.key_tag()];
        both.sort();
        assert_eq!(sigs_by(batch.version(), "example.", Rtype::DNSKEY), both);
        assert_eq!(
            sigs_by(batch.version(), "www.example.", Rtype::A),
            vec![zsk.key_tag()]
        );

        let kskonly = signer.clone().with_keyset_kskonly(true);
        let mut batch = Batch::new(&version);
        batch.resign_rrset(&kskonly, &name("example."), Rtype::DNSKEY).unwrap();
        assert_eq!(
            sigs_by(batch.version(), "example.", Rtype::DNSKEY),
            vec![ksk.key_tag()]
        );
    }

    #[test]
    fn revoked_key_signs_only_the_key_set() {
        let key = ed_key(1, Dnskey::FLAG_ZONE | Dnskey::FLAG_SEP).with_timing(
            KeyTiming {
                revoke: Some(UnixTime::from_secs(NOW - 10)),
                ..Default::default()
            },
        );
        let version = with_keys(&zone(1), &[key.clone()]);
        let signer = signer(vec![key.clone()]);
        let mut batch = Batch::new(&version);
        batch.resign_rrset(&signer, &name("example."), Rtype::DNSKEY).unwrap();
        batch.resign_rrset(&signer, &name("www.example."), Rtype::A).unwrap();
        let revoked_tag = key.dnskey.revoked().key_tag();
        assert_eq!(
            sigs_by(batch.version(), "example.", Rtype::DNSKEY),
            vec![revoked_tag]
        );
        assert!(sigs_by(batch.version(), "www.example.", Rtype::A).is_empty());
    }

    #[test]
    fn revoked_key_with_pending_successor() {
        let old = ed_key(1, Dnskey::FLAG_ZONE);
        let new = ed_key(2, Dnskey::FLAG_ZONE).with_timing(KeyTiming {
            activate: Some(UnixTime::from_secs(NOW + 86400)),
            ..Default::default()
        });
        let version = with_keys(&zone(1), &[old.clone(), new.clone()]);
        let mut batch = Batch::new(&version);
        batch
            .resign_rrset(&signer(vec![old.clone()]), &name("www.example."), Rtype::A)
            .unwrap();
        let signed = batch.version().clone();
        assert_eq!(
            sigs_by(&signed, "www.example.", Rtype::A),
            vec![old.key_tag()]
        );

        let revoked = old.with_timing(KeyTiming {
            revoke: Some(UnixTime::from_secs(NOW - 10)),
            ..Default::default()
        });
        let signer = signer(vec![revoked, new]);
        let mut batch = Batch::new(&signed);
        batch.resign_rrset(&signer, &name("www.example."), Rtype::A).unwrap();
        assert!(sigs_by(batch.version(), "www.example.", Rtype::A).is_empty());
        assert!(!batch.version().is_offline(&name("www.example."), Rtype::A));
    }

    #[test]
    fn signatures_without_replacement_go_offline() {
        let key = ed_key(1, Dnskey::FLAG_ZONE);
        let version = with_keys(&zone(1), &[key.clone()]);
        let mut batch = Batch::new(&version);
        batch
            .resign_rrset(&signer(vec![key.clone()]), &name("www.example."), Rtype::A)
            .unwrap();
        let signed = batch.version().clone();

        // The private half is gone now.
        let public = ZoneKey::new(key.dnskey.clone(), None);
        let signer = signer(vec![public]);
        let mut batch = Batch::new(&signed);
        batch.resign_rrset(&signer, &name("www.example."), Rtype::A).unwrap();
        assert_eq!(
            sigs_by(batch.version(), "www.example.", Rtype::A),
            vec![key.key_tag()]
        );
        assert!(batch.version().is_offline(&name("www.example."), Rtype::A));
    }

    #[test]
    fn finishing_bumps_the_serial_once() {
        let key = ed_key(1, Dnskey::FLAG_ZONE);
        let version = with_keys(&zone(7), &[key.clone()]);
        let signer = signer(vec![key]);
        let mut batch = Batch::new(&version);
        batch.resign_rrset(&signer, &name("www.example."), Rtype::A).unwrap();
        batch.resign_rrset(&signer, &name("ns1.example."), Rtype::A).unwrap();
        let diff = batch.finish(&signer).unwrap().unwrap();
        let (old, new) = diff.soa_change();
        assert_eq!(old.unwrap().serial, Serial(7));
        assert_eq!(new.unwrap().serial, Serial(8));

        assert!(Batch::new(&version).finish(&signer).unwrap().is_none());
    }
}
