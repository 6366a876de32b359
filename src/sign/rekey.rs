//! Publishing and retiring keys according to their timing metadata.
//!
//! A rekey compares the DNSKEY set of the zone with what the key store
//! says should be published right now and fixes the difference. Keys
//! that start signing get a walk adding their signatures, keys that were
//! removed get one removing them. A zone that gets its first keys also
//! gets an NSEC chain.

use super::chain::{self, ChainRequest};
use super::keywalk::{self, SigningRequest};
use super::marker::{markers, Marker};
use super::nsec3::denial_ttl;
use super::{Batch, SignError, Signer, ZoneKey};
use crate::base::iana::Rtype;
use crate::base::rdata::{Dnskey, Rdata};
use crate::base::record::Record;
use crate::base::time::UnixTime;
use crate::store::{Diff, ZoneVersion};
use core::time::Duration;
use tracing::{error, info};

/// How long before a key becomes inactive a missing successor is
/// reported.
pub const KEY_WARN_LEAD: Duration = Duration::from_secs(7 * 86400);

//------------ RekeyOutcome --------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct RekeyOutcome {
    /// The changes to commit.
    pub diff: Option<Diff>,

    /// Walks to start.
    pub signing: Vec<SigningRequest>,

    /// A chain to build.
    pub chain: Option<ChainRequest>,

    /// The next time a key changes state.
    pub next_event: Option<UnixTime>,

    /// When to warn about keys about to become inactive.
    pub key_warn: Option<UnixTime>,
}

//------------ rekey ---------------------------------------------------------

/// Brings the DNSKEY set of a zone in line with its keys.
///
/// The `keys` are all keys of the zone as provided by the key store,
/// including deleted ones. With `full_sign`, walks are started for all
/// keys that can sign regardless of whether they already sign the zone.
pub fn rekey(
    version: &ZoneVersion,
    signer: &Signer,
    keys: &[ZoneKey],
    private_type: Rtype,
    full_sign: bool,
) -> Result<RekeyOutcome, SignError> {
    let now = signer.now();
    let origin = signer.origin().clone();
    let class = version.class();
    let published: Vec<Dnskey> = version
        .find(&origin, Rtype::DNSKEY)
        .into_iter()
        .flat_map(|rrset| rrset.data.iter())
        .filter_map(Rdata::as_dnskey)
        .cloned()
        .collect();
    let ttl = version
        .find(&origin, Rtype::DNSKEY)
        .or_else(|| version.find(&origin, Rtype::SOA))
        .map(|rrset| rrset.ttl)
        .ok_or(SignError::NoSoa)?;
    let record =
        |key: Dnskey| Record::new(origin.clone(), class, ttl, Rdata::Dnskey(key));

    let mut diff = Diff::new();
    let mut added: Vec<&ZoneKey> = Vec::new();
    let mut removed: Vec<Dnskey> = Vec::new();
    for key in keys.iter().filter(|key| key.dnskey.is_zone_key()) {
        let forms = [key.dnskey.clone(), key.dnskey.revoked()];
        if key.is_published(now) {
            let wanted = key.dnskey_at(now);
            if !published.contains(&wanted) {
                info!("Zone '{}': publishing key {}", origin, key);
                diff.add(record(wanted.clone()));
                added.push(key);
            }
            for form in forms.into_iter().filter(|form| form != &wanted) {
                if published.contains(&form) {
                    diff.delete(record(form));
                }
            }
        } else {
            for form in forms {
                if published.contains(&form) {
                    info!("Zone '{}': removing key {}", origin, key);
                    diff.delete(record(form.clone()));
                    removed.push(form);
                }
            }
        }
    }

    let nsec3 = !version.nsec3params().is_empty()
        || markers(version, private_type).iter().any(|marker| {
            matches!(marker, Marker::Chain(marker) if marker.is_create())
        });
    if nsec3 {
        if let Some(key) =
            added.iter().find(|key| !key.algorithm().supports_nsec3())
        {
            error!(
                "Zone '{}': NSEC only DNSKEY {} and NSEC3 chains not allowed",
                origin, key
            );
            return Err(SignError::Nsec3Incompatible(key.algorithm()));
        }
    }

    let mut batch = Batch::new(version);
    let changed = !diff.is_empty();
    batch.apply(diff)?;
    if changed {
        batch.update_sigs(signer, &origin, Rtype::DNSKEY)?;
    }

    // Start walks for keys that don't sign the zone yet and for those
    // that went away.
    let pending = keywalk::pending_requests(version, private_type);
    let mut signing = Vec::new();
    for key in signer.keys() {
        if !key.can_sign(now) || key.is_revoked(now) {
            continue;
        }
        let (alg, tag) = (key.algorithm(), key.key_tag());
        let signs_apex = [Rtype::SOA, Rtype::DNSKEY]
            .into_iter()
            .any(|rtype| signer.is_signed_with(version, &origin, rtype, alg, tag));
        if full_sign || !signs_apex {
            signing.push(SigningRequest::new(alg, tag, false));
        }
    }
    for key in &removed {
        signing.push(SigningRequest::new(key.algorithm, key.key_tag(), true));
    }
    signing.retain(|request| {
        full_sign || !pending.iter().any(|known| known.same_as(request))
    });
    let mut markers_diff = Diff::new();
    for request in &signing {
        if !pending.iter().any(|known| known.same_as(request)) {
            markers_diff.add(Record::new(
                origin.clone(),
                class,
                denial_ttl(version),
                request.marker().to_rdata(private_type),
            ));
        }
    }
    if !markers_diff.is_empty() {
        batch.apply(markers_diff)?;
        batch.update_sigs(signer, &origin, private_type)?;
    }

    // A zone that just got keys needs a chain.
    let chain = chain::pending_requests(batch.version(), private_type)
        .into_iter()
        .find(|request| request.kind() == &chain::ChainKind::Nsec);

    Ok(RekeyOutcome {
        diff: batch.finish(signer)?,
        signing,
        chain,
        next_event: next_event(keys, now),
        key_warn: key_warn(keys, now),
    })
}

/// Returns the next time any key changes state.
pub fn next_event(keys: &[ZoneKey], now: UnixTime) -> Option<UnixTime> {
    keys.iter()
        .flat_map(|key| key.timing.events())
        .filter(|when| *when > now)
        .min()
}

/// Returns the signing keys that will become inactive with no successor.
pub fn keys_without_successor(keys: &[ZoneKey], now: UnixTime) -> Vec<&ZoneKey> {
    keys.iter()
        .filter(|key| key.can_sign(now))
        .filter(|key| {
            let Some(inactive) = key.timing.inactive else {
                return false;
            };
            !keys.iter().any(|other| {
                other.algorithm() == key.algorithm()
                    && other.is_ksk() == key.is_ksk()
                    && other.key_tag() != key.key_tag()
                    && other.has_private()
                    && other.is_active(inactive)
            })
        })
        .collect()
}

/// Returns when to warn about keys without a successor.
pub fn key_warn(keys: &[ZoneKey], now: UnixTime) -> Option<UnixTime> {
    keys_without_successor(keys, now)
        .into_iter()
        .filter_map(|key| key.timing.inactive)
        .map(|inactive| inactive.sub(KEY_WARN_LEAD).max(now))
        .min()
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::base::iana::{Nsec3HashAlg, SecAlg};
    use crate::base::rdata::Nsec3param;
    use crate::sign::test_util::*;
    use crate::sign::KeyTiming;
    use bytes::Bytes;

    const PRIVATE: Rtype = Rtype::DEFAULT_PRIVATE;

    fn now() -> UnixTime {
        UnixTime::from_secs(NOW)
    }

    fn dnskeys(version: &ZoneVersion) -> Vec<Dnskey> {
        version
            .find(&name("example."), Rtype::DNSKEY)
            .into_iter()
            .flat_map(|rrset| rrset.data.iter())
            .filter_map(Rdata::as_dnskey)
            .cloned()
            .collect()
    }

    #[test]
    fn first_key_makes_the_zone_signed() {
        let key = ed_key(1, Dnskey::FLAG_ZONE);
        let version = zone(1);
        let signer = signer(vec![key.clone()]);
        let outcome =
            rekey(&version, &signer, &[key.clone()], PRIVATE, false).unwrap();
        let version = version.apply(&outcome.diff.unwrap()).unwrap().0;
        assert_eq!(dnskeys(&version), vec![key.dnskey.clone()]);
        assert_eq!(
            outcome.signing,
            vec![SigningRequest::new(key.algorithm(), key.key_tag(), false)]
        );
        assert_eq!(
            keywalk::pending_requests(&version, PRIVATE),
            outcome.signing
        );
        assert_eq!(outcome.chain, Some(ChainRequest::nsec()));
        assert_eq!(outcome.next_event, None);

        // Nothing more to do the second time around.
        let again = rekey(&version, &signer, &[key], PRIVATE, false).unwrap();
        assert!(again.signing.is_empty());
        assert!(again.diff.is_none());
    }

    #[test]
    fn timing_drives_publication() {
        let old = ed_key(1, Dnskey::FLAG_ZONE).with_timing(KeyTiming {
            delete: Some(now()),
            ..Default::default()
        });
        let new = ed_key(2, Dnskey::FLAG_ZONE).with_timing(KeyTiming {
            publish: Some(now().add(Duration::from_secs(3600))),
            ..Default::default()
        });
        let version = with_keys(&zone(1), &[old.clone()]);
        let keys = vec![old.clone(), new.clone()];
        let signer = signer(keys.clone());
        let outcome = rekey(&version, &signer, &keys, PRIVATE, false).unwrap();
        let version = version.apply(&outcome.diff.unwrap()).unwrap().0;
        assert!(dnskeys(&version).is_empty());
        assert_eq!(
            outcome.signing,
            vec![SigningRequest::new(old.algorithm(), old.key_tag(), true)]
        );
        assert_eq!(
            outcome.next_event,
            Some(now().add(Duration::from_secs(3600)))
        );
    }

    #[test]
    fn revoked_key_is_published_revoked() {
        let key = ed_key(1, Dnskey::FLAG_ZONE | Dnskey::FLAG_SEP);
        let version = with_keys(&zone(1), &[key.clone()]);
        let key = key.with_timing(KeyTiming {
            revoke: Some(now()),
            ..Default::default()
        });
        let signer = signer(vec![key.clone()]);
        let outcome =
            rekey(&version, &signer, &[key.clone()], PRIVATE, false).unwrap();
        let version = version.apply(&outcome.diff.unwrap()).unwrap().0;
        assert_eq!(dnskeys(&version), vec![key.dnskey.revoked()]);
    }

    #[test]
    fn nsec_only_keys_refused_with_nsec3() {
        let key = ed_key(1, Dnskey::FLAG_ZONE);
        let mut diff = Diff::new();
        diff.add(record(
            "example.",
            Rdata::Nsec3param(Nsec3param::new(
                Nsec3HashAlg::SHA1,
                0,
                0,
                Bytes::new(),
            )),
        ));
        let version = with_keys(&zone(1), &[key.clone()]);
        let version = version.apply(&diff).unwrap().0;
        let old = public_key(SecAlg::RSASHA1, 9, Dnskey::FLAG_ZONE);
        let keys = vec![key, old];
        let signer = signer(keys.clone());
        assert!(matches!(
            rekey(&version, &signer, &keys, PRIVATE, false),
            Err(SignError::Nsec3Incompatible(SecAlg::RSASHA1))
        ));
    }

    #[test]
    fn warns_about_keys_without_successor() {
        let inactive = now().add(Duration::from_secs(30 * 86400));
        let key = ed_key(1, Dnskey::FLAG_ZONE).with_timing(KeyTiming {
            inactive: Some(inactive),
            ..Default::default()
        });
        assert_eq!(
            key_warn(&[key.clone()], now()),
            Some(inactive.sub(KEY_WARN_LEAD))
        );
        let successor = ed_key(2, Dnskey::FLAG_ZONE).with_timing(KeyTiming {
            activate: Some(inactive.sub(Duration::from_secs(86400))),
            ..Default::default()
        });
        assert_eq!(key_warn(&[key, successor], now()), None);
    }
}
