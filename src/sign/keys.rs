//! Signing keys.
//!
//! The signing engine learns about the keys of a zone from a
//! [`KeyStore`]. Each [`ZoneKey`] carries the public DNSKEY data, the
//! private half if it is available, and the timing metadata that decides
//! when the key is published, used, revoked and removed.

use super::SignError;
use crate::base::iana::SecAlg;
use crate::base::name::Name;
use crate::base::rdata::Dnskey;
use crate::base::time::UnixTime;
use bytes::Bytes;
use core::fmt;
use parking_lot::Mutex;
use ring::rand::SystemRandom;
use ring::signature::{self, Ed25519KeyPair, KeyPair as _};
use std::collections::HashMap;
use std::sync::Arc;

//------------ KeyPair -------------------------------------------------------

/// The private half of a key.
pub trait KeyPair: fmt::Debug + Send + Sync {
    fn algorithm(&self) -> SecAlg;

    /// Signs the data and returns the raw signature.
    fn sign(&self, data: &[u8]) -> Result<Bytes, SignError>;
}

//------------ Ed25519Key ----------------------------------------------------

/// An Ed25519 key pair backed by _ring._
pub struct Ed25519Key {
    pair: Ed25519KeyPair,
}

impl Ed25519Key {
    /// Creates a key from a 32 byte seed.
    pub fn from_seed(seed: &[u8]) -> Result<Self, SignError> {
        Ed25519KeyPair::from_seed_unchecked(seed)
            .map(|pair| Ed25519Key { pair })
            .map_err(|_| SignError::BadKey)
    }

    /// Creates a new random key.
    pub fn generate() -> Result<Self, SignError> {
        let rng = SystemRandom::new();
        let doc = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|_| SignError::Crypto)?;
        Ed25519KeyPair::from_pkcs8(doc.as_ref())
            .map(|pair| Ed25519Key { pair })
            .map_err(|_| SignError::BadKey)
    }

    /// Returns the DNSKEY record data with the given flags.
    pub fn dnskey(&self, flags: u16) -> Dnskey {
        Dnskey::new(
            flags,
            SecAlg::ED25519,
            Bytes::copy_from_slice(self.pair.public_key().as_ref()),
        )
    }
}

impl KeyPair for Ed25519Key {
    fn algorithm(&self) -> SecAlg {
        SecAlg::ED25519
    }

    fn sign(&self, data: &[u8]) -> Result<Bytes, SignError> {
        Ok(Bytes::copy_from_slice(self.pair.sign(data).as_ref()))
    }
}

impl fmt::Debug for Ed25519Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Ed25519Key")
            .field("public_key", &self.pair.public_key())
            .finish()
    }
}

//------------ verify --------------------------------------------------------

/// Verifies a signature made by the key in `dnskey`.
pub fn verify(
    dnskey: &Dnskey,
    data: &[u8],
    sig: &[u8],
) -> Result<(), SignError> {
    let public_key = dnskey.public_key.as_ref();
    let res = match dnskey.algorithm {
        SecAlg::RSASHA1
        | SecAlg::RSASHA1_NSEC3_SHA1
        | SecAlg::RSASHA256
        | SecAlg::RSASHA512 => {
            let params = match dnskey.algorithm {
                SecAlg::RSASHA256 => {
                    &signature::RSA_PKCS1_1024_8192_SHA256_FOR_LEGACY_USE_ONLY
                }
                SecAlg::RSASHA512 => {
                    &signature::RSA_PKCS1_1024_8192_SHA512_FOR_LEGACY_USE_ONLY
                }
                _ => &signature::RSA_PKCS1_1024_8192_SHA1_FOR_LEGACY_USE_ONLY,
            };
            let (e, n) = rsa_exponent_modulus(public_key)?;
            signature::RsaPublicKeyComponents { n, e }.verify(params, data, sig)
        }
        SecAlg::ECDSAP256SHA256 | SecAlg::ECDSAP384SHA384 => {
            let alg = if dnskey.algorithm == SecAlg::ECDSAP256SHA256 {
                &signature::ECDSA_P256_SHA256_FIXED
            } else {
                &signature::ECDSA_P384_SHA384_FIXED
            };
            // Ring wants the uncompressed point marker in front.
            let mut key = Vec::with_capacity(public_key.len() + 1);
            key.push(4);
            key.extend_from_slice(public_key);
            signature::UnparsedPublicKey::new(alg, key).verify(data, sig)
        }
        SecAlg::ED25519 => {
            signature::UnparsedPublicKey::new(&signature::ED25519, public_key)
                .verify(data, sig)
        }
        alg => return Err(SignError::UnsupportedAlgorithm(alg)),
    };
    res.map_err(|_| SignError::BadSignature)
}

fn rsa_exponent_modulus(key: &[u8]) -> Result<(&[u8], &[u8]), SignError> {
    if key.len() <= 3 {
        return Err(SignError::BadKey);
    }
    let (pos, exp_len) = match key[0] {
        0 => (3, (usize::from(key[1]) << 8) | usize::from(key[2])),
        len => (1, usize::from(len)),
    };
    if key.len() < pos + exp_len {
        return Err(SignError::BadKey);
    }
    Ok(key[pos..].split_at(exp_len))
}

//------------ KeyTiming -----------------------------------------------------

/// When a key enters and leaves service.
///
/// A missing time means the event either happened long ago (publish and
/// activate) or isn't scheduled (the others).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct KeyTiming {
    pub publish: Option<UnixTime>,
    pub activate: Option<UnixTime>,
    pub revoke: Option<UnixTime>,
    pub inactive: Option<UnixTime>,
    pub delete: Option<UnixTime>,
}

impl KeyTiming {
    /// Returns all scheduled events.
    pub fn events(&self) -> impl Iterator<Item = UnixTime> {
        [
            self.publish,
            self.activate,
            self.revoke,
            self.inactive,
            self.delete,
        ]
        .into_iter()
        .flatten()
    }
}

//------------ ZoneKey -------------------------------------------------------

/// A key of a zone as known to the key store.
#[derive(Clone)]
pub struct ZoneKey {
    pub dnskey: Dnskey,
    pub signer: Option<Arc<dyn KeyPair>>,
    pub timing: KeyTiming,
}

impl ZoneKey {
    pub fn new(dnskey: Dnskey, signer: Option<Arc<dyn KeyPair>>) -> Self {
        ZoneKey {
            dnskey,
            signer,
            timing: KeyTiming::default(),
        }
    }

    pub fn with_timing(mut self, timing: KeyTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn algorithm(&self) -> SecAlg {
        self.dnskey.algorithm
    }

    pub fn key_tag(&self) -> u16 {
        self.dnskey.key_tag()
    }

    pub fn is_ksk(&self) -> bool {
        self.dnskey.is_sep()
    }

    pub fn has_private(&self) -> bool {
        self.signer.is_some()
    }

    /// Returns whether the key has been revoked at `now`.
    pub fn is_revoked(&self, now: UnixTime) -> bool {
        self.dnskey.is_revoked()
            || self.timing.revoke.map_or(false, |when| when <= now)
    }

    /// Returns the DNSKEY data as it should be published at `now`.
    pub fn dnskey_at(&self, now: UnixTime) -> Dnskey {
        if self.is_revoked(now) && !self.dnskey.is_revoked() {
            self.dnskey.revoked()
        } else {
            self.dnskey.clone()
        }
    }

    /// Returns whether the key should be in the DNSKEY set at `now`.
    pub fn is_published(&self, now: UnixTime) -> bool {
        self.timing.publish.map_or(true, |when| when <= now)
            && !self.is_deleted(now)
    }

    /// Returns whether the key should sign at `now`.
    pub fn is_active(&self, now: UnixTime) -> bool {
        self.timing.activate.map_or(true, |when| when <= now)
            && self.timing.inactive.map_or(true, |when| when > now)
            && !self.is_deleted(now)
    }

    pub fn is_deleted(&self, now: UnixTime) -> bool {
        self.timing.delete.map_or(false, |when| when <= now)
    }

    /// Returns whether the key may sign at `now`.
    ///
    /// Only published keys sign.
    pub fn can_sign(&self, now: UnixTime) -> bool {
        self.has_private() && self.is_active(now) && self.is_published(now)
    }

    pub fn sign(&self, data: &[u8]) -> Result<Bytes, SignError> {
        match &self.signer {
            Some(signer) => signer.sign(data),
            None => Err(SignError::NoPrivateKey(self.key_tag())),
        }
    }
}

impl fmt::Debug for ZoneKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ZoneKey")
            .field("algorithm", &self.algorithm())
            .field("key_tag", &self.key_tag())
            .field("ksk", &self.is_ksk())
            .field("private", &self.has_private())
            .field("timing", &self.timing)
            .finish()
    }
}

impl fmt::Display for ZoneKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.algorithm(), self.key_tag())
    }
}

//------------ KeyStore ------------------------------------------------------

/// Provides the keys of zones.
pub trait KeyStore: fmt::Debug + Send + Sync {
    fn keys(&self, zone: &Name) -> Result<Vec<ZoneKey>, SignError>;
}

//------------ MemoryKeyStore ------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    keys: Mutex<HashMap<Name, Vec<ZoneKey>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, zone: &Name, key: ZoneKey) {
        self.keys.lock().entry(zone.clone()).or_default().push(key);
    }

    /// Removes the key with the given algorithm and tag.
    pub fn remove(&self, zone: &Name, algorithm: SecAlg, key_tag: u16) {
        if let Some(keys) = self.keys.lock().get_mut(zone) {
            keys.retain(|key| {
                key.algorithm() != algorithm || key.key_tag() != key_tag
            });
        }
    }

    /// Changes the timing of the key with the given algorithm and tag.
    pub fn set_timing(
        &self,
        zone: &Name,
        algorithm: SecAlg,
        key_tag: u16,
        timing: KeyTiming,
    ) {
        if let Some(keys) = self.keys.lock().get_mut(zone) {
            for key in keys.iter_mut() {
                if key.algorithm() == algorithm && key.key_tag() == key_tag {
                    key.timing = timing;
                }
            }
        }
    }
}

impl KeyStore for MemoryKeyStore {
    fn keys(&self, zone: &Name) -> Result<Vec<ZoneKey>, SignError> {
        Ok(self.keys.lock().get(zone).cloned().unwrap_or_default())
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ed25519_sign_and_verify() {
        let key = Ed25519Key::from_seed(&[7u8; 32]).unwrap();
        let dnskey = key.dnskey(Dnskey::FLAG_ZONE);
        let sig = key.sign(b"some data").unwrap();
        assert!(verify(&dnskey, b"some data", &sig).is_ok());
        assert!(matches!(
            verify(&dnskey, b"other data", &sig),
            Err(SignError::BadSignature)
        ));
    }

    #[test]
    fn timing() {
        let key = Ed25519Key::from_seed(&[1u8; 32]).unwrap();
        let dnskey = key.dnskey(Dnskey::FLAG_ZONE | Dnskey::FLAG_SEP);
        let zone_key = ZoneKey::new(dnskey, Some(Arc::new(key))).with_timing(
            KeyTiming {
                publish: Some(UnixTime::from_secs(100)),
                activate: Some(UnixTime::from_secs(200)),
                revoke: Some(UnixTime::from_secs(300)),
                inactive: Some(UnixTime::from_secs(400)),
                delete: Some(UnixTime::from_secs(500)),
            },
        );
        assert!(zone_key.is_ksk());
        assert!(!zone_key.is_published(UnixTime::from_secs(50)));
        assert!(zone_key.is_published(UnixTime::from_secs(150)));
        assert!(!zone_key.can_sign(UnixTime::from_secs(150)));
        assert!(zone_key.can_sign(UnixTime::from_secs(250)));
        assert!(!zone_key.is_revoked(UnixTime::from_secs(250)));
        assert!(zone_key.dnskey_at(UnixTime::from_secs(350)).is_revoked());
        assert!(!zone_key.is_active(UnixTime::from_secs(450)));
        assert!(!zone_key.is_published(UnixTime::from_secs(500)));
        assert_eq!(zone_key.timing.events().count(), 5);
    }
}
