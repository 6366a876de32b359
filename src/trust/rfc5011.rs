//! Automated updates of trust anchors.
//!
//! This implements the trust anchor maintenance of [RFC 5011]. A managed
//! key goes through these states:
//!
//! * _pending_: the key was seen in the DNSKEY set of its trust point
//!   but the add hold-down hasn't passed yet,
//! * _trusted_: the key has been seen continuously for the whole add
//!   hold-down or was configured as an initial key,
//! * _revoked_: the key was published with the revoke bit, signing the
//!   DNSKEY set with itself. It is removed when the remove hold-down
//!   has passed.
//!
//! The state is kept in [`Keydata`] records. An add hold-down of zero
//! means the key is trusted. A remove hold-down of zero means the key
//! hasn't been revoked.
//!
//! [RFC 5011]: https://tools.ietf.org/html/rfc5011

use super::TrustError;
use crate::base::iana::Rtype;
use crate::base::rdata::{Dnskey, Keydata, Rdata, Rrsig};
use crate::base::record::Rrset;
use crate::base::time::UnixTime;
use crate::sign::{keys, signed_data};
use core::time::Duration;

//------------ Constants -----------------------------------------------------

/// How long a new key has to be seen before it is trusted.
pub const ADD_HOLD_DOWN: Duration = Duration::from_secs(30 * 86400);

/// How long a revoked key is kept around.
pub const REMOVE_HOLD_DOWN: Duration = Duration::from_secs(30 * 86400);

const MIN_REFRESH: Duration = Duration::from_secs(3600);
const MAX_REFRESH: Duration = Duration::from_secs(15 * 86400);
const MAX_RETRY: Duration = Duration::from_secs(86400);

//------------ KeyFetch ------------------------------------------------------

/// The DNSKEY set of a trust point as fetched from its servers.
#[derive(Clone, Debug)]
pub struct KeyFetch {
    pub dnskeys: Rrset,

    /// The signatures covering the DNSKEY set.
    pub sigs: Vec<Rrsig>,
}

impl KeyFetch {
    pub fn keys(&self) -> impl Iterator<Item = &Dnskey> {
        self.dnskeys.data.iter().filter_map(|data| match data {
            Rdata::Dnskey(key) => Some(key),
            _ => None,
        })
    }

    /// Returns whether a valid signature by `key` covers the set.
    pub fn is_signed_by(&self, key: &Dnskey, now: UnixTime) -> bool {
        let tag = key.key_tag();
        self.sigs.iter().any(|sig| {
            sig.type_covered == Rtype::DNSKEY
                && sig.algorithm == key.algorithm
                && sig.key_tag == tag
                && is_current(sig, now)
                && keys::verify(
                    key,
                    &signed_data(sig, &self.dnskeys),
                    &sig.signature,
                )
                .is_ok()
        })
    }

    /// Returns the earliest expiration of the signatures.
    fn expiration(&self, now: UnixTime) -> Option<UnixTime> {
        self.sigs
            .iter()
            .map(|sig| UnixTime::from_serial(sig.expiration, now))
            .min()
    }

    /// Returns the shortest validity period of the signatures.
    fn validity(&self, now: UnixTime) -> Option<Duration> {
        self.sigs
            .iter()
            .map(|sig| {
                UnixTime::from_serial(sig.expiration, now)
                    .since(UnixTime::from_serial(sig.inception, now))
            })
            .min()
    }
}

fn is_current(sig: &Rrsig, now: UnixTime) -> bool {
    UnixTime::from_serial(sig.inception, now) <= now
        && now <= UnixTime::from_serial(sig.expiration, now)
}

//------------ KeyEvent ------------------------------------------------------

/// Something noteworthy that happened to a managed key.
///
/// Each event carries the key tag.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyEvent {
    /// A key was seen for the first time and its hold-down started.
    New(u16),

    /// A key's add hold-down passed or it was the first key seen.
    Trusted(u16),

    /// A pending key vanished, its hold-down starts over.
    PendingMissing(u16),

    /// A trusted key vanished without having been revoked.
    ActiveMissing(u16),

    /// A key was revoked.
    Revoked(u16),

    /// A revoked key's remove hold-down passed.
    Removed(u16),
}

//------------ Anchors -------------------------------------------------------

/// What to use for validating below a trust point.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Anchors {
    /// Use these keys.
    Keys(Vec<Dnskey>),

    /// All validation fails.
    ///
    /// This is used when no key is trusted anymore but replacements are
    /// waiting for their hold-down.
    FailClosed,

    /// There is nothing to validate with.
    Nothing,
}

/// Returns whether a key is trusted at `now`.
pub fn is_trusted(data: &Keydata, now: UnixTime) -> bool {
    !data.key.is_revoked()
        && (data.add_hold_down.is_epoch() || data.add_hold_down <= now)
}

/// Returns whether a key waits for its add hold-down at `now`.
pub fn is_pending(data: &Keydata, now: UnixTime) -> bool {
    !data.key.is_revoked()
        && !data.add_hold_down.is_epoch()
        && data.add_hold_down > now
}

/// Returns the anchors resulting from the managed keys of a trust point.
pub fn anchors(keys: &[Keydata], now: UnixTime) -> Anchors {
    let trusted: Vec<_> = keys
        .iter()
        .filter(|data| is_trusted(data, now))
        .map(|data| data.key.clone())
        .collect();
    if !trusted.is_empty() {
        Anchors::Keys(trusted)
    } else if keys.iter().any(|data| is_pending(data, now)) {
        Anchors::FailClosed
    } else {
        Anchors::Nothing
    }
}

//------------ Refreshed -----------------------------------------------------

/// The result of processing a fetched DNSKEY set.
#[derive(Clone, Debug)]
pub struct Refreshed {
    pub keys: Vec<Keydata>,
    pub events: Vec<KeyEvent>,

    /// When to fetch next.
    pub next: UnixTime,
}

/// Updates the managed keys of a trust point with a fetched key set.
///
/// The set has to be signed by one of the trusted keys, possibly in its
/// revoked form. Only if no key is known yet, the set is taken as is and
/// all its keys are trusted right away.
pub fn process(
    existing: &[Keydata],
    fetch: &KeyFetch,
    now: UnixTime,
) -> Result<Refreshed, TrustError> {
    if fetch.keys().next().is_none() {
        return Err(TrustError::NoKeys);
    }
    let initial = existing.is_empty();
    if !initial
        && !existing.iter().any(|data| {
            is_trusted(data, now)
                && (fetch.is_signed_by(&data.key, now)
                    || fetch.is_signed_by(&data.key.revoked(), now))
        })
    {
        return Err(TrustError::Unverified);
    }

    let next = refresh_after_success(
        fetch.dnskeys.ttl.into_duration(),
        fetch.expiration(now),
        now,
    );
    let mut events = Vec::new();
    let mut keys = Vec::new();

    for data in existing {
        let mut data = data.clone();
        let tag = data.key.key_tag();
        if !data.remove_hold_down.is_epoch() && data.remove_hold_down <= now {
            events.push(KeyEvent::Removed(tag));
            continue;
        }
        match fetch.keys().find(|key| key.same_key(&data.key)) {
            None => {
                if is_pending(&data, now) {
                    events.push(KeyEvent::PendingMissing(tag));
                    data.add_hold_down = now.add(ADD_HOLD_DOWN);
                } else if is_trusted(&data, now) {
                    events.push(KeyEvent::ActiveMissing(tag));
                }
            }
            Some(key) if key.is_revoked() => {
                if !data.key.is_revoked() && fetch.is_signed_by(key, now) {
                    events.push(KeyEvent::Revoked(tag));
                    data.key = key.clone();
                    data.add_hold_down = UnixTime::EPOCH;
                    data.remove_hold_down = now.add(REMOVE_HOLD_DOWN);
                }
            }
            Some(_) => {
                if !data.key.is_revoked()
                    && !data.add_hold_down.is_epoch()
                    && data.add_hold_down <= now
                {
                    events.push(KeyEvent::Trusted(tag));
                    data.add_hold_down = UnixTime::EPOCH;
                }
            }
        }
        data.refresh = next;
        keys.push(data);
    }

    for key in fetch.keys() {
        if !key.is_sep()
            || key.is_revoked()
            || keys.iter().any(|data| data.key.same_key(key))
            || existing.iter().any(|data| data.key.same_key(key))
        {
            continue;
        }
        let tag = key.key_tag();
        let add_hold_down = if initial {
            events.push(KeyEvent::Trusted(tag));
            UnixTime::EPOCH
        } else {
            events.push(KeyEvent::New(tag));
            now.add(ADD_HOLD_DOWN)
        };
        keys.push(Keydata {
            refresh: next,
            add_hold_down,
            remove_hold_down: UnixTime::EPOCH,
            key: key.clone(),
        });
    }

    Ok(Refreshed { keys, events, next })
}

/// Reschedules the managed keys of a trust point after a failed fetch.
///
/// Returns the time of the next attempt.
pub fn retry(
    keys: &mut [Keydata],
    fetch: Option<&KeyFetch>,
    now: UnixTime,
) -> UnixTime {
    let next = refresh_after_failure(
        fetch.map(|fetch| fetch.dnskeys.ttl.into_duration()),
        fetch.and_then(|fetch| fetch.validity(now)),
        now,
    );
    for data in keys {
        data.refresh = next;
    }
    next
}

//------------ Refresh Timing ------------------------------------------------

/// Returns the time of the next fetch after a successful one.
///
/// That is the smallest of half the TTL, half the time until the
/// signatures expire and 15 days but at least an hour.
pub fn refresh_after_success(
    ttl: Duration,
    expiration: Option<UnixTime>,
    now: UnixTime,
) -> UnixTime {
    let mut wait = MAX_REFRESH.min(ttl / 2);
    if let Some(expiration) = expiration {
        wait = wait.min(expiration.since(now) / 2);
    }
    now.add(wait.max(MIN_REFRESH))
}

/// Returns the time of the next fetch after a failed one.
///
/// That is the smallest of a day, a tenth of the TTL and a tenth of the
/// signature validity but at least an hour.
pub fn refresh_after_failure(
    ttl: Option<Duration>,
    validity: Option<Duration>,
    now: UnixTime,
) -> UnixTime {
    let mut wait = MAX_RETRY;
    if let Some(ttl) = ttl {
        wait = wait.min(ttl / 10);
    }
    if let Some(validity) = validity {
        wait = wait.min(validity / 10);
    }
    now.add(wait.max(MIN_REFRESH))
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::base::iana::Class;
    use crate::base::name::Name;
    use crate::base::record::{RrsetKey, Ttl};
    use crate::sign::keys::{Ed25519Key, KeyPair};
    use core::str::FromStr;
    use mock_instant::thread_local::MockClock;

    const DAY: u32 = 86400;

    struct Key {
        pair: Ed25519Key,
        dnskey: Dnskey,
    }

    impl Key {
        fn new(seed: u8) -> Self {
            let pair = Ed25519Key::from_seed(&[seed; 32]).unwrap();
            let dnskey = pair.dnskey(Dnskey::FLAG_ZONE | Dnskey::FLAG_SEP);
            Key { pair, dnskey }
        }

        fn revoked(&self) -> Dnskey {
            self.dnskey.revoked()
        }

        fn managed(&self, add_hold_down: u32) -> Keydata {
            Keydata {
                refresh: UnixTime::EPOCH,
                add_hold_down: UnixTime::from_secs(add_hold_down),
                remove_hold_down: UnixTime::EPOCH,
                key: self.dnskey.clone(),
            }
        }
    }

    /// Builds a fetched key set signed by `signers`.
    fn fetch(
        published: &[Dnskey],
        signers: &[(&Key, &Dnskey)],
        now: UnixTime,
    ) -> KeyFetch {
        let mut dnskeys = Rrset::new(
            Name::from_str("example.").unwrap(),
            Class::IN,
            RrsetKey::plain(Rtype::DNSKEY),
            Ttl::from_secs(2 * DAY),
        );
        for key in published {
            dnskeys.insert(Rdata::Dnskey(key.clone()));
        }
        let sigs = signers
            .iter()
            .map(|(key, as_published)| {
                let mut sig = Rrsig {
                    type_covered: Rtype::DNSKEY,
                    algorithm: as_published.algorithm,
                    labels: 1,
                    original_ttl: dnskeys.ttl,
                    expiration: now.add(Duration::from_secs(u64::from(10 * DAY))).to_serial(),
                    inception: now.sub(Duration::from_secs(3600)).to_serial(),
                    key_tag: as_published.key_tag(),
                    signer_name: dnskeys.owner.clone(),
                    signature: Default::default(),
                };
                sig.signature = key.pair.sign(&signed_data(&sig, &dnskeys)).unwrap();
                sig
            })
            .collect();
        KeyFetch { dnskeys, sigs }
    }

    fn at(secs: u32) -> UnixTime {
        UnixTime::from_secs(secs)
    }

    #[test]
    fn first_key_is_trusted_right_away() {
        let now = at(1_000 * DAY);
        let k1 = Key::new(1);
        let res = process(&[], &fetch(&[k1.dnskey.clone()], &[], now), now).unwrap();
        assert_eq!(res.events, vec![KeyEvent::Trusted(k1.dnskey.key_tag())]);
        assert_eq!(anchors(&res.keys, now), Anchors::Keys(vec![k1.dnskey.clone()]));
    }

    #[test]
    fn new_key_waits_for_hold_down() {
        let now = at(1_000 * DAY);
        let (k1, k2) = (Key::new(1), Key::new(2));
        let existing = [k1.managed(0)];
        let published = [k1.dnskey.clone(), k2.dnskey.clone()];
        let res = process(&existing, &fetch(&published, &[(&k1, &k1.dnskey)], now), now)
            .unwrap();
        assert_eq!(res.events, vec![KeyEvent::New(k2.dnskey.key_tag())]);
        assert!(is_pending(&res.keys[1], now));
        assert_eq!(anchors(&res.keys, now), Anchors::Keys(vec![k1.dnskey.clone()]));

        // Thirty days later it is trusted.
        let later = now.add(ADD_HOLD_DOWN);
        let res = process(
            &res.keys,
            &fetch(&published, &[(&k1, &k1.dnskey)], later),
            later,
        )
        .unwrap();
        assert_eq!(res.events, vec![KeyEvent::Trusted(k2.dnskey.key_tag())]);
        assert!(res.keys[1].add_hold_down.is_epoch());
    }

    #[test]
    fn missing_keys() {
        let now = at(1_000 * DAY);
        let (k1, k2) = (Key::new(1), Key::new(2));
        let existing = [k1.managed(0), k2.managed(1_010 * DAY)];
        let res = process(
            &existing,
            &fetch(&[k1.dnskey.clone()], &[(&k1, &k1.dnskey)], now),
            now,
        )
        .unwrap();
        assert_eq!(
            res.events,
            vec![KeyEvent::PendingMissing(k2.dnskey.key_tag())]
        );
        assert_eq!(res.keys[1].add_hold_down, now.add(ADD_HOLD_DOWN));

        let k3 = Key::new(3);
        let existing = [k1.managed(0), k3.managed(0)];
        let res = process(
            &existing,
            &fetch(&[k1.dnskey.clone()], &[(&k1, &k1.dnskey)], now),
            now,
        )
        .unwrap();
        assert_eq!(res.events, vec![KeyEvent::ActiveMissing(k3.dnskey.key_tag())]);
        assert_eq!(res.keys.len(), 2);
    }

    #[test]
    fn revoked_key_leaves_after_hold_down() {
        let now = at(1_000 * DAY);
        let (k1, k2) = (Key::new(1), Key::new(2));
        let existing = [k1.managed(0), k2.managed(0)];
        let published = [k1.revoked(), k2.dnskey.clone()];
        let signers = [(&k1, &k1.revoked()), (&k2, &k2.dnskey)];
        let res = process(&existing, &fetch(&published, &signers, now), now).unwrap();
        assert_eq!(res.events, vec![KeyEvent::Revoked(k1.dnskey.key_tag())]);
        assert!(res.keys[0].key.is_revoked());
        assert_eq!(anchors(&res.keys, now), Anchors::Keys(vec![k2.dnskey.clone()]));

        let later = now.add(REMOVE_HOLD_DOWN);
        let res = process(&res.keys, &fetch(&published, &signers, later), later).unwrap();
        assert_eq!(res.events, vec![KeyEvent::Removed(k1.revoked().key_tag())]);
        assert_eq!(res.keys.len(), 1);
    }

    #[test]
    fn revocation_needs_self_signature() {
        let now = at(1_000 * DAY);
        let (k1, k2) = (Key::new(1), Key::new(2));
        let existing = [k1.managed(0), k2.managed(0)];
        let published = [k1.revoked(), k2.dnskey.clone()];
        let res = process(&existing, &fetch(&published, &[(&k2, &k2.dnskey)], now), now)
            .unwrap();
        assert!(res.events.is_empty());
        assert!(!res.keys[0].key.is_revoked());
    }

    #[test]
    fn all_revoked_with_pending_fails_closed() {
        let now = at(1_000 * DAY);
        let (k1, k2) = (Key::new(1), Key::new(2));
        let existing = [k1.managed(0), k2.managed(1_020 * DAY)];
        let published = [k1.revoked(), k2.dnskey.clone()];
        let res = process(
            &existing,
            &fetch(&published, &[(&k1, &k1.revoked())], now),
            now,
        )
        .unwrap();
        assert_eq!(res.events, vec![KeyEvent::Revoked(k1.dnskey.key_tag())]);
        assert_eq!(anchors(&res.keys, now), Anchors::FailClosed);
    }

    #[test]
    fn unsigned_set_is_rejected() {
        let now = at(1_000 * DAY);
        let (k1, k2) = (Key::new(1), Key::new(2));
        let existing = [k1.managed(0)];
        let res = process(
            &existing,
            &fetch(&[k1.dnskey.clone(), k2.dnskey.clone()], &[(&k2, &k2.dnskey)], now),
            now,
        );
        assert_eq!(res.unwrap_err(), TrustError::Unverified);

        let mut keys = existing.to_vec();
        let next = retry(&mut keys, None, now);
        assert_eq!(next, now.add(MAX_RETRY));
        assert_eq!(keys[0].refresh, next);
    }

    #[test]
    fn refresh_timing() {
        MockClock::set_system_time(Duration::from_secs(1_700_000_000));
        let now = UnixTime::now();
        assert_eq!(now, at(1_700_000_000));
        let hour = Duration::from_secs(3600);

        // Half the TTL.
        assert_eq!(
            refresh_after_success(hour * 48, None, now),
            now.add(hour * 24)
        );
        // Capped at 15 days.
        assert_eq!(
            refresh_after_success(hour * 24 * 60, None, now),
            now.add(MAX_REFRESH)
        );
        // Half the time until the signatures expire.
        assert_eq!(
            refresh_after_success(hour * 48, Some(now.add(hour * 10)), now),
            now.add(hour * 5)
        );
        // Never sooner than an hour.
        assert_eq!(
            refresh_after_success(Duration::from_secs(60), None, now),
            now.add(hour)
        );
        assert_eq!(
            refresh_after_failure(Some(hour * 48), Some(hour * 24 * 30), now),
            now.add(Duration::from_secs(48 * 360))
        );
        assert_eq!(
            refresh_after_failure(Some(Duration::from_secs(600)), None, now),
            now.add(hour)
        );
    }
}
