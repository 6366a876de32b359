//! Inline signing.
//!
//! A secure zone can be linked to a raw zone holding the unsigned data.
//! Whenever the raw zone's content changes, the secure zone applies the
//! same changes to its own content and signs them. The secure zone keeps
//! the serial of the raw zone it was made from as its source serial.
//!
//! The secure zone holds a strong reference to the raw zone, the raw
//! zone only a weak one back. Locking always takes the raw zone first.
//! Since linking is started from the secure zone, its lock is only ever
//! tried and the attempt repeated after a short pause.

use super::maintenance::effective_type;
use super::{Zone, ZoneError, ZoneFlags};
use crate::base::iana::Rtype;
use crate::base::serial::Serial;
use crate::config::{ZoneConfig, ZoneType};
use crate::sign::update::update_signatures;
use crate::sign::Batch;
use crate::store::ZoneVersion;
use core::time::Duration;
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info};

/// How long to wait before trying to get both locks again.
const LINK_BACKOFF: Duration = Duration::from_millis(10);

impl Zone {
    /// Makes this zone the signed version of `raw`.
    ///
    /// Both zones must have the same name and class and this zone must be
    /// a master zone. Neither zone may be linked already.
    pub async fn link(self: &Arc<Self>, raw: &Arc<Zone>) -> Result<(), ZoneError> {
        if Arc::ptr_eq(self, raw) {
            return Err(ZoneError::Link("zone can't sign itself"));
        }
        if self.name != raw.name || self.class != raw.class {
            return Err(ZoneError::Link("zones differ in name or class"));
        }
        loop {
            {
                let mut raw_state = raw.state.lock();
                if let Some(mut state) = self.state.try_lock() {
                    if state.flags.contains(ZoneFlags::EXITING)
                        || raw_state.flags.contains(ZoneFlags::EXITING)
                    {
                        return Err(ZoneError::Exiting);
                    }
                    if effective_type(&state.config) != ZoneType::Master {
                        return Err(ZoneError::WrongType(state.config.zone_type));
                    }
                    if state.raw.is_some()
                        || raw_state.raw.is_some()
                        || raw_state.secure.upgrade().is_some()
                        || state.secure.upgrade().is_some()
                    {
                        return Err(ZoneError::Link("already linked"));
                    }
                    state.raw = Some(raw.clone());
                    raw_state.secure = Arc::downgrade(self);
                    break;
                }
            }
            sleep(LINK_BACKOFF).await;
        }
        debug!("Zone '{}': linked to raw zone", self.name);
        raw.content_changed();
        Ok(())
    }

    /// Returns the raw zone this zone signs.
    pub fn raw(&self) -> Option<Arc<Zone>> {
        self.state.lock().raw.clone()
    }

    /// Returns the zone signing this zone.
    pub fn secure(&self) -> Option<Arc<Zone>> {
        self.state.lock().secure.upgrade()
    }

    /// Tells a secure partner that the content changed.
    pub(crate) fn content_changed(&self) {
        let secure = self.state.lock().secure.upgrade();
        if let Some(secure) = secure {
            secure.schedule_sync();
        }
    }

    /// Makes sure a sync with the raw zone runs.
    ///
    /// If one is running already, it runs once more when done.
    fn schedule_sync(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.flags.contains(ZoneFlags::EXITING) {
            return;
        }
        if state.tasks.sync.is_some() {
            state.resync = true;
            return;
        }
        let zone = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                if let Err(err) = zone.sync_from_raw().await {
                    error!(
                        "Zone '{}': updating from raw zone failed: {err}",
                        zone.name
                    );
                }
                let mut state = zone.state.lock();
                if !core::mem::take(&mut state.resync) {
                    state.tasks.sync = None;
                    break;
                }
            }
        });
        state.tasks.sync = Some(handle.abort_handle());
    }

    /// Brings the content in line with the raw zone.
    async fn sync_from_raw(self: &Arc<Self>) -> Result<(), ZoneError> {
        let _writer = self.writer.lock().await;
        let (raw, version, config, source_serial) = {
            let state = self.state.lock();
            let Some(raw) = state.raw.clone() else {
                return Ok(());
            };
            (raw, state.version(), state.config.clone(), state.source_serial)
        };
        let Some(raw_version) = raw.version() else {
            return Ok(());
        };
        let raw_serial = raw_version
            .serial()
            .ok_or_else(|| ZoneError::BadZone("raw zone has no SOA".into()))?;
        match version {
            None => self.sync_initial(&raw_version, raw_serial),
            Some(_) if source_serial == Some(raw_serial) => Ok(()),
            Some(version) => {
                self.sync_changes(&version, &raw_version, raw_serial, &config)
            }
        }
    }

    /// Takes the raw content as the first content of this zone.
    ///
    /// Signing starts with an immediate rekey.
    fn sync_initial(
        &self,
        raw_version: &ZoneVersion,
        raw_serial: Serial,
    ) -> Result<(), ZoneError> {
        let private_type = self.state.lock().config.private_type();
        let version = unsigned(raw_version, private_type, true)?;
        let mut state = self.state.lock();
        let db = self.new_db(&state)?;
        db.replace(version)?;
        state.db = Some(db);
        state.flags.insert(ZoneFlags::LOADED);
        state.source_serial = Some(raw_serial);
        state.timers.rekey = Some(Instant::now());
        let delay = state.config.dump_delay;
        state.need_dump(delay);
        state.need_notify();
        self.set_timer(&state);
        info!(
            "Zone '{}': initial content from raw zone serial {raw_serial}",
            self.name
        );
        Ok(())
    }

    /// Applies the changes of the raw zone and signs them.
    fn sync_changes(
        self: &Arc<Self>,
        version: &ZoneVersion,
        raw_version: &ZoneVersion,
        raw_serial: Serial,
        config: &ZoneConfig,
    ) -> Result<(), ZoneError> {
        let private_type = config.private_type();
        let mine = unsigned(version, private_type, false)?;
        let theirs = unsigned(raw_version, private_type, false)?;
        let diff = mine.diff_to(&theirs);
        let prev = {
            let mut state = self.state.lock();
            core::mem::replace(&mut state.source_serial, Some(raw_serial))
        };
        if diff.is_empty() {
            return Ok(());
        }
        let res = (|| {
            let signer = self.signer(config)?;
            let mut batch = Batch::new(version);
            batch.apply(diff.clone())?;
            update_signatures(&mut batch, &signer, &diff)?;
            if let Some(diff) = batch.finish(&signer)? {
                self.commit(&diff)?;
            }
            Ok::<_, ZoneError>(())
        })();
        match res {
            Ok(()) => {
                info!(
                    "Zone '{}': applied {} changes from raw zone serial {raw_serial}",
                    self.name,
                    diff.len()
                );
                self.update_resign_timer();
                Ok(())
            }
            Err(err) => {
                self.state.lock().source_serial = prev;
                Err(err)
            }
        }
    }
}

/// Returns the records of a version that don't belong to signing.
///
/// Without `with_soa` the SOA is left out as well since both zones keep
/// their own serial.
fn unsigned(
    version: &ZoneVersion,
    private_type: Rtype,
    with_soa: bool,
) -> Result<ZoneVersion, ZoneError> {
    let records = version.records().filter(|record| {
        let rtype = record.rtype();
        !(matches!(
            rtype,
            Rtype::RRSIG
                | Rtype::NSEC
                | Rtype::NSEC3
                | Rtype::NSEC3PARAM
                | Rtype::DNSKEY
        ) || rtype == private_type
            || (!with_soa && rtype == Rtype::SOA))
    });
    Ok(ZoneVersion::from_records(
        version.origin().clone(),
        version.class(),
        records,
    )?)
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::base::iana::Class;
    use crate::base::name::Name;
    use crate::base::rdata::{Rdata, Soa};
    use crate::base::record::{Record, Ttl};
    use crate::config::ManagerConfig;
    use crate::manager::{Services, ZoneManager};
    use crate::net::mock::MockTransport;
    use core::str::FromStr;
    use std::net::Ipv4Addr;

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    fn record(owner: &str, data: Rdata) -> Record {
        Record::new(name(owner), Class::IN, Ttl::from_secs(3600), data)
    }

    fn soa(serial: u32) -> Rdata {
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

    #[test]
    fn unsigned_drops_dnssec_records() {
        let version = ZoneVersion::from_records(
            name("example."),
            Class::IN,
            [
                record("example.", soa(1)),
                record("example.", Rdata::Ns(name("ns1.example."))),
                record("ns1.example.", Rdata::A(Ipv4Addr::new(192, 0, 2, 1))),
            ],
        )
        .unwrap();
        let plain = unsigned(&version, Rtype::DEFAULT_PRIVATE, false).unwrap();
        assert!(plain.find(&name("example."), Rtype::SOA).is_none());
        assert!(plain.find(&name("example."), Rtype::NS).is_some());
        let with_soa = unsigned(&version, Rtype::DEFAULT_PRIVATE, true).unwrap();
        assert_eq!(with_soa.serial(), Some(Serial(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn link_is_symmetric_and_exclusive() {
        let manager = ZoneManager::new(
            ManagerConfig::default(),
            Services::new(Arc::new(MockTransport::new())),
        );
        let raw = manager
            .create_raw_zone(name("example."), Class::IN, ZoneConfig::new(ZoneType::Master))
            .unwrap();
        let secure = manager
            .create_zone(name("example."), Class::IN, ZoneConfig::new(ZoneType::Master))
            .unwrap();
        secure.link(&raw).await.unwrap();
        assert!(Arc::ptr_eq(&secure.raw().unwrap(), raw.zone()));
        assert!(Arc::ptr_eq(&raw.secure().unwrap(), secure.zone()));
        assert!(matches!(
            secure.link(&raw).await,
            Err(ZoneError::Link(_))
        ));
        assert!(matches!(raw.link(&raw).await, Err(ZoneError::Link(_))));

        secure.shutdown();
        assert!(raw.secure().is_none());
    }
}
