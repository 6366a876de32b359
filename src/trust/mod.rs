//! Maintaining DNSSEC trust anchors.
//!
//! Managed trust anchors live in a zone of type key. For every trust
//! point the zone holds a set of [`Keydata`] records at the trust point's
//! name, one per known key, recording the key and its [RFC 5011] timers.
//! A key zone therefore needs to be an ancestor of all its trust points,
//! usually it is the root zone.
//!
//! Whenever a trust point is due, its DNSKEY set is fetched through the
//! [`KeyFetcher`] service and the managed keys are updated as described
//! in [`rfc5011`]. The resulting anchors are handed to the
//! [`TrustAnchorTable`] service used by the validator.
//!
//! [RFC 5011]: https://tools.ietf.org/html/rfc5011

pub use self::rfc5011::{Anchors, KeyEvent, KeyFetch};

pub mod rfc5011;

use crate::base::iana::{Class, Rtype};
use crate::base::name::Name;
use crate::base::rdata::{Dnskey, Keydata, Rdata};
use crate::base::record::{Record, Ttl};
use crate::base::serial::SerialUpdateMethod;
use crate::base::time::UnixTime;
use crate::config::ZoneType;
use crate::net::BoxFuture;
use crate::store::{Diff, ZoneVersion};
use crate::zone::timers::instant_for;
use crate::zone::{Zone, ZoneError, ZoneState};
use core::fmt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

//------------ KeyFetcher ----------------------------------------------------

/// Fetches the DNSKEY set of a trust point.
pub trait KeyFetcher: fmt::Debug + Send + Sync {
    fn fetch(&self, name: &Name, class: Class) -> BoxFuture<Result<KeyFetch, TrustError>>;
}

/// A fetcher that never finds anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoFetcher;

impl KeyFetcher for NoFetcher {
    fn fetch(&self, _name: &Name, _class: Class) -> BoxFuture<Result<KeyFetch, TrustError>> {
        Box::pin(async { Err(TrustError::Fetch("no key fetcher".into())) })
    }
}

//------------ TrustAnchorTable ----------------------------------------------

/// Where the anchors for validation go.
pub trait TrustAnchorTable: fmt::Debug + Send + Sync {
    /// Replaces the anchors of a trust point.
    fn install(&self, name: &Name, anchors: Anchors);
}

/// A trust anchor table in memory.
#[derive(Debug, Default)]
pub struct MemoryAnchors {
    table: Mutex<HashMap<Name, Anchors>>,
}

impl MemoryAnchors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &Name) -> Option<Anchors> {
        self.table.lock().get(name).cloned()
    }

    pub fn is_fail_closed(&self, name: &Name) -> bool {
        matches!(self.get(name), Some(Anchors::FailClosed))
    }
}

impl TrustAnchorTable for MemoryAnchors {
    fn install(&self, name: &Name, anchors: Anchors) {
        let mut table = self.table.lock();
        if anchors == Anchors::Nothing {
            table.remove(name);
        } else {
            table.insert(name.clone(), anchors);
        }
    }
}

//------------ Zone: Trust Anchors -------------------------------------------

impl Zone {
    /// Returns the managed keys of a trust point.
    pub fn managed_keys(&self, name: &Name) -> Vec<Keydata> {
        self.version()
            .map(|version| managed_keys(&version, name))
            .unwrap_or_default()
    }

    /// Adds a configured initial key for a trust point.
    ///
    /// The key is trusted right away. Its trust point is refreshed next.
    pub async fn add_initial_key(
        self: &Arc<Self>,
        name: Name,
        key: Dnskey,
    ) -> Result<(), ZoneError> {
        let zone_type = self.zone_type();
        if zone_type != ZoneType::Key {
            return Err(ZoneError::WrongType(zone_type));
        }
        if !name.ends_with(self.name()) {
            return Err(ZoneError::BadZone(format!(
                "trust point {name} outside of key zone"
            )));
        }
        let _writer = self.writer.lock().await;
        let version = self.version().ok_or(ZoneError::NotLoaded)?;
        if managed_keys(&version, &name)
            .iter()
            .any(|data| data.key.same_key(&key))
        {
            return Ok(());
        }
        let tag = key.key_tag();
        let mut diff = Diff::new();
        diff.add(keydata_record(
            &name,
            self.class(),
            Keydata {
                refresh: UnixTime::EPOCH,
                add_hold_down: UnixTime::EPOCH,
                remove_hold_down: UnixTime::EPOCH,
                key,
            },
        ));
        bump_serial(&version, &mut diff)?;
        let version = self.commit(&diff)?;
        self.install_anchors(&version);
        info!("Zone '{}': initial key {tag} added for {name}", self.name());

        let mut state = self.state.lock();
        state.timers.refresh_key = Some(Instant::now());
        self.set_timer(&state);
        Ok(())
    }

    /// Fetches the key sets of all trust points now, due or not.
    pub fn refresh_keys(self: &Arc<Self>) -> Result<(), ZoneError> {
        let mut state = self.state.lock();
        if state.config.zone_type != ZoneType::Key {
            return Err(ZoneError::WrongType(state.config.zone_type));
        }
        if state.version().is_none() {
            return Err(ZoneError::NotLoaded);
        }
        self.start_key_refresh(&mut state, true);
        self.set_timer(&state);
        Ok(())
    }

    /// Starts fetching the key sets of all trust points that are due.
    pub(crate) fn start_key_refresh(
        self: &Arc<Self>,
        state: &mut ZoneState,
        all: bool,
    ) {
        state.timers.refresh_key = None;
        if state.tasks.trust.is_some() {
            return;
        }
        let Some(version) = state.version() else {
            return;
        };
        let now = UnixTime::now();
        let points = trust_points(&version);
        let due: Vec<Name> = points
            .iter()
            .filter(|(_, keys)| {
                all || next_refresh(keys).map_or(false, |next| next <= now)
            })
            .map(|(name, _)| name.clone())
            .collect();
        if due.is_empty() {
            state.timers.refresh_key = points
                .iter()
                .filter_map(|(_, keys)| next_refresh(keys))
                .min()
                .map(instant_for);
            return;
        }
        debug!("Zone '{}': refreshing {} trust points", self.name(), due.len());
        let zone = self.clone();
        let handle = tokio::spawn(async move { zone.refresh_trust_points(due).await });
        state.tasks.trust = Some(handle.abort_handle());
    }

    async fn refresh_trust_points(self: Arc<Self>, names: Vec<Name>) {
        let mut fetched = Vec::with_capacity(names.len());
        for name in names {
            let res = self
                .shared
                .services
                .key_fetcher
                .fetch(&name, self.class())
                .await;
            fetched.push((name, res));
        }
        if let Err(err) = self.apply_key_fetches(fetched).await {
            error!("Zone '{}': updating managed keys failed: {err}", self.name());
        }
        let mut state = self.state.lock();
        state.tasks.trust = None;
        if let Some(version) = state.version() {
            state.timers.refresh_key = trust_points(&version)
                .iter()
                .filter_map(|(_, keys)| next_refresh(keys))
                .min()
                .map(instant_for);
        }
        self.set_timer(&state);
    }

    /// Writes the outcome of fetching key sets to the key zone.
    async fn apply_key_fetches(
        self: &Arc<Self>,
        fetched: Vec<(Name, Result<KeyFetch, TrustError>)>,
    ) -> Result<(), ZoneError> {
        let _writer = self.writer.lock().await;
        let version = self.version().ok_or(ZoneError::NotLoaded)?;
        let now = UnixTime::now();
        let mut diff = Diff::new();
        let mut emptied = Vec::new();

        for (name, res) in fetched {
            let existing = managed_keys(&version, &name);
            let outcome = match &res {
                Ok(fetch) => rfc5011::process(&existing, fetch, now)
                    .map_err(|err| (err, Some(fetch))),
                Err(err) => Err((err.clone(), None)),
            };
            let keys = match outcome {
                Ok(refreshed) => {
                    for event in &refreshed.events {
                        self.log_key_event(&name, *event);
                    }
                    refreshed.keys
                }
                Err((err, fetch)) => {
                    warn!(
                        "Zone '{}': fetching DNSKEY set for {name} failed: {err}",
                        self.name()
                    );
                    let mut keys = existing.clone();
                    rfc5011::retry(&mut keys, fetch, now);
                    keys
                }
            };
            if keys.is_empty() {
                emptied.push(name.clone());
            }
            for data in existing {
                diff.delete(keydata_record(&name, self.class(), data));
            }
            for data in keys {
                diff.add(keydata_record(&name, self.class(), data));
            }
        }

        bump_serial(&version, &mut diff)?;
        let version = self.commit(&diff)?;
        for name in emptied {
            warn!("Zone '{}': no managed keys left for {name}", self.name());
            self.shared.services.anchors.install(&name, Anchors::Nothing);
        }
        self.install_anchors(&version);
        Ok(())
    }

    /// Hands the anchors of all trust points to the anchor table.
    pub(crate) fn install_anchors(&self, version: &ZoneVersion) {
        let now = UnixTime::now();
        for (name, keys) in trust_points(version) {
            let anchors = rfc5011::anchors(&keys, now);
            match &anchors {
                Anchors::Keys(keys) => debug!(
                    "Zone '{}': {} trusted keys for {name}",
                    self.name(),
                    keys.len()
                ),
                Anchors::FailClosed => error!(
                    "Zone '{}': all trust anchors for {name} have been revoked, \
                     failing closed until a pending key is accepted",
                    self.name()
                ),
                Anchors::Nothing => {
                    warn!("Zone '{}': no trust anchors for {name}", self.name())
                }
            }
            self.shared.services.anchors.install(&name, anchors);
        }
    }

    fn log_key_event(&self, name: &Name, event: KeyEvent) {
        match event {
            KeyEvent::New(tag) => info!(
                "Zone '{}': new key {tag} observed for {name}, entering acceptance timer",
                self.name()
            ),
            KeyEvent::Trusted(tag) => {
                info!("Zone '{}': key {tag} for {name} is now trusted", self.name())
            }
            KeyEvent::PendingMissing(tag) => warn!(
                "Zone '{}': pending key {tag} for {name} unexpectedly missing, \
                 restarting acceptance timer",
                self.name()
            ),
            KeyEvent::ActiveMissing(tag) => warn!(
                "Zone '{}': active key {tag} for {name} unexpectedly missing",
                self.name()
            ),
            KeyEvent::Revoked(tag) => {
                info!("Zone '{}': key {tag} for {name} has been revoked", self.name())
            }
            KeyEvent::Removed(tag) => info!(
                "Zone '{}': revoked key {tag} for {name} removed",
                self.name()
            ),
        }
    }
}

//------------ Helpers -------------------------------------------------------

/// Returns the managed keys at a name.
fn managed_keys(version: &ZoneVersion, name: &Name) -> Vec<Keydata> {
    version
        .find(name, Rtype::KEYDATA)
        .map(|rrset| {
            rrset
                .data
                .iter()
                .filter_map(|data| match data {
                    Rdata::Keydata(data) => Some(data.clone()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Returns all trust points with their managed keys.
fn trust_points(version: &ZoneVersion) -> Vec<(Name, Vec<Keydata>)> {
    version
        .names()
        .filter_map(|(name, _)| {
            let keys = managed_keys(version, name);
            (!keys.is_empty()).then(|| (name.clone(), keys))
        })
        .collect()
}

fn next_refresh(keys: &[Keydata]) -> Option<UnixTime> {
    keys.iter().map(|data| data.refresh).min()
}

fn keydata_record(name: &Name, class: Class, data: Keydata) -> Record {
    Record::new(name.clone(), class, Ttl::ZERO, Rdata::Keydata(data))
}

/// Adds an increment of the SOA serial to a diff.
fn bump_serial(version: &ZoneVersion, diff: &mut Diff) -> Result<(), ZoneError> {
    let old = version
        .soa_record()
        .ok_or_else(|| ZoneError::BadZone("no SOA".into()))?;
    let Some(soa) = old.data.as_soa() else {
        return Err(ZoneError::BadZone("no SOA".into()));
    };
    let serial = soa.serial.next(SerialUpdateMethod::Increment, UnixTime::now());
    let new = Record::new(
        old.owner.clone(),
        old.class,
        old.ttl,
        Rdata::Soa(soa.with_serial(serial)),
    );
    diff.delete(old);
    diff.add(new);
    Ok(())
}

//------------ TrustError ----------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TrustError {
    /// The key set couldn't be fetched.
    Fetch(String),

    /// The fetched key set was empty.
    NoKeys,

    /// The fetched key set isn't signed by a trusted key.
    Unverified,
}

//--- Display and Error

impl fmt::Display for TrustError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TrustError::Fetch(err) => write!(f, "fetch failed: {err}"),
            TrustError::NoKeys => f.write_str("no DNSKEY records"),
            TrustError::Unverified => {
                f.write_str("DNSKEY set not signed by a trusted key")
            }
        }
    }
}

impl std::error::Error for TrustError {}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::base::iana::SecAlg;
    use crate::base::rdata::Soa;
    use crate::base::serial::Serial;
    use core::str::FromStr;

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    fn keydata(byte: u8, add_hold_down: u32) -> Keydata {
        Keydata {
            refresh: UnixTime::from_secs(500),
            add_hold_down: UnixTime::from_secs(add_hold_down),
            remove_hold_down: UnixTime::EPOCH,
            key: Dnskey::new(257, SecAlg::ED25519, vec![byte; 32].into()),
        }
    }

    #[test]
    fn trust_points_of_key_zone() {
        let soa = Record::new(
            Name::root(),
            Class::IN,
            Ttl::ZERO,
            Rdata::Soa(Soa {
                mname: Name::root(),
                rname: Name::root(),
                serial: Serial(1),
                refresh: Ttl::ZERO,
                retry: Ttl::ZERO,
                expire: Ttl::ZERO,
                minimum: Ttl::ZERO,
            }),
        );
        let version = ZoneVersion::from_records(
            Name::root(),
            Class::IN,
            [
                soa,
                keydata_record(&name("example."), Class::IN, keydata(1, 0)),
                keydata_record(&name("example."), Class::IN, keydata(2, 100)),
                keydata_record(&name("example.org."), Class::IN, keydata(3, 0)),
            ],
        )
        .unwrap();
        let points = trust_points(&version);
        assert_eq!(points.len(), 2);
        assert_eq!(managed_keys(&version, &name("example.")).len(), 2);
        assert_eq!(next_refresh(&points[0].1), Some(UnixTime::from_secs(500)));

        let mut diff = Diff::new();
        bump_serial(&version, &mut diff).unwrap();
        let (old, new) = diff.soa_change();
        assert_eq!(old.map(|soa| soa.serial), Some(Serial(1)));
        assert_eq!(new.map(|soa| soa.serial), Some(Serial(2)));
    }

    #[test]
    fn memory_anchors() {
        let anchors = MemoryAnchors::new();
        let example = name("example.");
        anchors.install(&example, Anchors::FailClosed);
        assert!(anchors.is_fail_closed(&example));
        anchors.install(&example, Anchors::Keys(vec![keydata(1, 0).key]));
        assert!(!anchors.is_fail_closed(&example));
        anchors.install(&example, Anchors::Nothing);
        assert_eq!(anchors.get(&example), None);
    }
}
