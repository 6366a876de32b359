//! Managing a set of zones.
//!
//! The [`ZoneManager`] creates zones and owns everything zones share: the
//! services provided by the embedding server, the quota for inbound
//! transfers, the queue for file operations, the rate limiters for
//! outgoing queries and the cache of unreachable servers.
//!
//! The lock order is manager, then zone, then the zone's partner. Zones
//! only ever call into the shared state while not holding their own lock
//! or through operations that don't take another lock.

pub use self::io::{IoPermit, IoQueue};
pub use self::unreachable::UnreachableCache;
pub use self::xfrin::{XfrinPermit, XfrinQuota};

pub mod io;
pub mod unreachable;
pub mod xfrin;

use crate::base::iana::Class;
use crate::base::name::Name;
use crate::base::time::UnixTime;
use crate::config::{ManagerConfig, ZoneConfig};
use crate::net::{
    AddressResolver, IsSelf, NoResolver, OwnAddrs, RateLimiter, Transport,
};
use crate::sign::keys::{KeyStore, MemoryKeyStore};
use crate::store::{DatabaseBackend, MemoryBackend, ZoneFileParser};
use crate::trust::{KeyFetcher, MemoryAnchors, NoFetcher, TrustAnchorTable};
use crate::zone::{RecordCheck, Zone, ZoneError, ZoneFlags, ZoneRef};
use arc_swap::ArcSwap;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

//------------ Services ------------------------------------------------------

/// What the embedding server provides to the zones.
#[derive(Clone, Debug)]
pub struct Services {
    pub transport: Arc<dyn Transport>,
    pub backend: Arc<dyn DatabaseBackend>,

    /// Parser for master files in text format.
    pub parser: Option<Arc<dyn ZoneFileParser>>,

    pub record_check: Option<Arc<dyn RecordCheck>>,
    pub keys: Arc<dyn KeyStore>,
    pub resolver: Arc<dyn AddressResolver>,
    pub is_self: Arc<dyn IsSelf>,
    pub key_fetcher: Arc<dyn KeyFetcher>,
    pub anchors: Arc<dyn TrustAnchorTable>,
}

impl Services {
    /// Creates the services with in-memory defaults for everything but
    /// the transport.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Services {
            transport,
            backend: Arc::new(MemoryBackend),
            parser: None,
            record_check: None,
            keys: Arc::new(MemoryKeyStore::new()),
            resolver: Arc::new(NoResolver),
            is_self: Arc::new(OwnAddrs::default()),
            key_fetcher: Arc::new(NoFetcher),
            anchors: Arc::new(MemoryAnchors::new()),
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn DatabaseBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn ZoneFileParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn with_record_check(mut self, check: Arc<dyn RecordCheck>) -> Self {
        self.record_check = Some(check);
        self
    }

    pub fn with_keys(mut self, keys: Arc<dyn KeyStore>) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn AddressResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_is_self(mut self, is_self: Arc<dyn IsSelf>) -> Self {
        self.is_self = is_self;
        self
    }

    pub fn with_key_fetcher(mut self, fetcher: Arc<dyn KeyFetcher>) -> Self {
        self.key_fetcher = fetcher;
        self
    }

    pub fn with_anchors(mut self, anchors: Arc<dyn TrustAnchorTable>) -> Self {
        self.anchors = anchors;
        self
    }
}

//------------ Shared --------------------------------------------------------

/// The state all zones of a manager share.
pub(crate) struct Shared {
    pub services: Services,
    pub config: ArcSwap<ManagerConfig>,
    pub xfrin: Arc<XfrinQuota>,
    pub io: Arc<IoQueue>,
    pub limiters: Limiters,
    unreachable: Mutex<UnreachableCache>,
    zones: Mutex<HashMap<ZoneKey, Weak<Zone>>>,
    exiting: AtomicBool,
}

/// Zones are kept by name, class and whether they are a raw zone.
type ZoneKey = (Name, Class, bool);

/// Rate limiters for outgoing queries.
#[derive(Debug)]
pub(crate) struct Limiters {
    pub serial_query: RateLimiter,
    pub notify: RateLimiter,
    pub startup_notify: RateLimiter,
}

impl Shared {
    fn new(config: ManagerConfig, services: Services) -> Self {
        Shared {
            services,
            xfrin: XfrinQuota::new(config.transfers_in, config.transfers_per_ns),
            io: IoQueue::new(config.io_limit),
            limiters: Limiters {
                serial_query: RateLimiter::new(config.serial_query_rate),
                notify: RateLimiter::new(config.notify_rate),
                startup_notify: RateLimiter::new(config.startup_notify_rate),
            },
            config: ArcSwap::from_pointee(config),
            unreachable: Mutex::new(UnreachableCache::new()),
            zones: Mutex::new(HashMap::new()),
            exiting: AtomicBool::new(false),
        }
    }

    pub fn is_unreachable(
        &self,
        remote: &SocketAddr,
        local: &Option<SocketAddr>,
    ) -> bool {
        self.unreachable
            .lock()
            .is_unreachable(remote, local, UnixTime::now())
    }

    pub fn add_unreachable(&self, remote: SocketAddr, local: Option<SocketAddr>) {
        self.unreachable.lock().add(remote, local, UnixTime::now())
    }

    pub fn delete_unreachable(
        &self,
        remote: &SocketAddr,
        local: &Option<SocketAddr>,
    ) {
        self.unreachable.lock().delete(remote, local)
    }

    /// Drops the queued transfers of a zone that is going away.
    pub fn xfrin_cancel(&self, zone: &Arc<Zone>) {
        self.xfrin.cancel(zone)
    }

    /// Removes a zone from the registry.
    pub fn unregister(&self, zone: &Arc<Zone>) {
        self.zones
            .lock()
            .retain(|_, known| !core::ptr::eq(known.as_ptr(), Arc::as_ptr(zone)));
    }

    fn update_config(&self, op: impl Fn(&mut ManagerConfig)) -> ManagerConfig {
        let mut config = ManagerConfig::clone(&self.config.load());
        op(&mut config);
        self.config.store(Arc::new(config.clone()));
        config
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Shared")
            .field("config", &self.config.load())
            .field("zones", &self.zones.lock().len())
            .finish()
    }
}

//------------ ZoneManager ---------------------------------------------------

#[derive(Debug)]
pub struct ZoneManager {
    shared: Arc<Shared>,
}

impl ZoneManager {
    pub fn new(config: ManagerConfig, services: Services) -> Self {
        ZoneManager {
            shared: Arc::new(Shared::new(config, services)),
        }
    }

    /// Creates a zone.
    ///
    /// The zone starts out unloaded. Must be called from within a tokio
    /// runtime.
    pub fn create_zone(
        &self,
        name: Name,
        class: Class,
        config: ZoneConfig,
    ) -> Result<ZoneRef, ManagerError> {
        self.create(name, class, config, false)
    }

    /// Creates a raw zone to be signed by a secure zone of the same name.
    pub fn create_raw_zone(
        &self,
        name: Name,
        class: Class,
        config: ZoneConfig,
    ) -> Result<ZoneRef, ManagerError> {
        self.create(name, class, config, true)
    }

    fn create(
        &self,
        name: Name,
        class: Class,
        config: ZoneConfig,
        raw: bool,
    ) -> Result<ZoneRef, ManagerError> {
        if self.shared.exiting.load(Ordering::SeqCst) {
            return Err(ManagerError::Exiting);
        }
        let mut zones = self.shared.zones.lock();
        let key = (name.clone(), class, raw);
        if zones.get(&key).and_then(Weak::upgrade).is_some() {
            return Err(ManagerError::Exists(name, class));
        }
        let zone = Zone::new(name, class, config, self.shared.clone())?;
        zones.insert(key, Arc::downgrade(&zone));
        debug!(
            "Zone '{}': added to manager{}",
            zone.name(),
            if raw { " as raw zone" } else { "" }
        );
        Ok(ZoneRef::attach(zone))
    }

    /// Returns a reference to a zone if it is managed.
    pub fn find_zone(&self, name: &Name, class: Class) -> Option<ZoneRef> {
        self.find(&(name.clone(), class, false))
    }

    pub fn find_raw_zone(&self, name: &Name, class: Class) -> Option<ZoneRef> {
        self.find(&(name.clone(), class, true))
    }

    fn find(&self, key: &ZoneKey) -> Option<ZoneRef> {
        let zone = self.shared.zones.lock().get(key)?.upgrade()?;
        if zone.flags().contains(ZoneFlags::EXITING) {
            return None;
        }
        Some(ZoneRef::attach(zone))
    }

    /// Returns references to all managed zones.
    pub fn zones(&self) -> Vec<ZoneRef> {
        self.live_zones()
            .into_iter()
            .filter(|zone| !zone.flags().contains(ZoneFlags::EXITING))
            .map(ZoneRef::attach)
            .collect()
    }

    fn live_zones(&self) -> Vec<Arc<Zone>> {
        self.shared
            .zones
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Returns the number of zones in various states.
    pub fn counts(&self) -> ZoneCounts {
        let mut res = ZoneCounts::default();
        let (running, deferred) = self.shared.xfrin.counts();
        res.xfr_running = running;
        res.xfr_deferred = deferred;
        for zone in self.live_zones() {
            res.any += 1;
            let (xfr, waiting) = self.shared.xfrin.is_active(&zone);
            if zone.flags().contains(ZoneFlags::REFRESH) && !xfr && !waiting {
                res.soa_query += 1;
            }
        }
        res
    }

    pub fn config(&self) -> ManagerConfig {
        ManagerConfig::clone(&self.shared.config.load())
    }

    /// Sets the number of concurrent inbound transfers.
    pub fn set_transfers_in(&self, value: usize) {
        let config = self.shared.update_config(|config| config.transfers_in = value);
        self.shared
            .xfrin
            .set_limits(config.transfers_in, config.transfers_per_ns);
    }

    /// Sets the number of concurrent inbound transfers per upstream.
    pub fn set_transfers_per_ns(&self, value: usize) {
        let config =
            self.shared.update_config(|config| config.transfers_per_ns = value);
        self.shared
            .xfrin
            .set_limits(config.transfers_in, config.transfers_per_ns);
    }

    pub fn set_serial_query_rate(&self, rate: u32) {
        self.shared
            .update_config(|config| config.serial_query_rate = rate);
        self.shared.limiters.serial_query.set_rate(rate);
    }

    pub fn set_notify_rate(&self, rate: u32) {
        self.shared.update_config(|config| config.notify_rate = rate);
        self.shared.limiters.notify.set_rate(rate);
    }

    pub fn set_startup_notify_rate(&self, rate: u32) {
        self.shared
            .update_config(|config| config.startup_notify_rate = rate);
        self.shared.limiters.startup_notify.set_rate(rate);
    }

    /// Sets the number of concurrent master file operations.
    pub fn set_io_limit(&self, limit: usize) {
        self.shared.update_config(|config| config.io_limit = limit);
        self.shared.io.set_limit(limit);
    }

    /// Shuts down all zones.
    ///
    /// Timers stop, running tasks are aborted and no new zones can be
    /// created.
    pub fn shutdown(&self) {
        if self.shared.exiting.swap(true, Ordering::SeqCst) {
            return;
        }
        let zones = self.live_zones();
        info!("shutting down {} zones", zones.len());
        for zone in zones {
            zone.shutdown();
        }
    }
}

//------------ ZoneCounts ----------------------------------------------------

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ZoneCounts {
    /// All managed zones.
    pub any: usize,

    /// Zones checking the serial of their masters.
    pub soa_query: usize,

    pub xfr_running: usize,

    /// Transfers waiting for the quota.
    pub xfr_deferred: usize,
}

//------------ ManagerError --------------------------------------------------

#[derive(Debug)]
pub enum ManagerError {
    /// A zone of that name and class already exists.
    Exists(Name, Class),

    /// The manager is shutting down.
    Exiting,

    /// The zone couldn't be created.
    Zone(ZoneError),
}

impl From<ZoneError> for ManagerError {
    fn from(err: ZoneError) -> Self {
        ManagerError::Zone(err)
    }
}

//--- Display and Error

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ManagerError::Exists(name, class) => {
                write!(f, "zone {name} {class} exists already")
            }
            ManagerError::Exiting => f.write_str("manager is shutting down"),
            ManagerError::Zone(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for ManagerError {}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ZoneType;
    use crate::net::mock::MockTransport;
    use core::str::FromStr;

    fn manager() -> ZoneManager {
        ZoneManager::new(
            ManagerConfig::default(),
            Services::new(Arc::new(MockTransport::new())),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn zones_are_unique() {
        let manager = manager();
        let name = Name::from_str("example.com").unwrap();
        let _zone = manager
            .create_zone(name.clone(), Class::IN, ZoneConfig::default())
            .unwrap();
        assert!(matches!(
            manager.create_zone(name.clone(), Class::IN, ZoneConfig::default()),
            Err(ManagerError::Exists(..))
        ));
        let _raw = manager
            .create_raw_zone(name.clone(), Class::IN, ZoneConfig::default())
            .unwrap();
        assert!(manager.find_zone(&name, Class::IN).is_some());
        assert!(manager.find_raw_zone(&name, Class::IN).is_some());
        assert!(manager.find_zone(&name, Class::CH).is_none());
        assert_eq!(manager.counts().any, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_everything() {
        let manager = manager();
        let zone = manager
            .create_zone(
                Name::from_str("example.com").unwrap(),
                Class::IN,
                ZoneConfig::new(ZoneType::Master),
            )
            .unwrap();
        manager.shutdown();
        assert!(zone.flags().contains(ZoneFlags::EXITING));
        assert!(zone.next_wakeup().is_none());
        assert!(manager.zones().is_empty());
        assert!(matches!(
            manager.create_zone(
                Name::from_str("example.org").unwrap(),
                Class::IN,
                ZoneConfig::default()
            ),
            Err(ManagerError::Exiting)
        ));
    }

    #[tokio::test]
    async fn limits_follow_config() {
        let manager = manager();
        manager.set_transfers_in(20);
        manager.set_transfers_per_ns(5);
        manager.set_io_limit(3);
        manager.set_notify_rate(50);
        let config = manager.config();
        assert_eq!(config.transfers_in, 20);
        assert_eq!(config.transfers_per_ns, 5);
        assert_eq!(config.io_limit, 3);
        assert_eq!(config.notify_rate, 50);
        assert_eq!(config.serial_query_rate, 20);
    }

    #[test]
    fn unreachable_after_second_failure() {
        let shared = Shared::new(
            ManagerConfig::default(),
            Services::new(Arc::new(MockTransport::new())),
        );
        let addr: SocketAddr = "192.0.2.1:53".parse().unwrap();
        shared.add_unreachable(addr, None);
        assert!(!shared.is_unreachable(&addr, &None));
        shared.add_unreachable(addr, None);
        assert!(shared.is_unreachable(&addr, &None));
        assert!(!shared.is_unreachable(&addr, &Some("192.0.2.9:0".parse().unwrap())));
        shared.delete_unreachable(&addr, &None);
        assert!(!shared.is_unreachable(&addr, &None));
    }
}
