//! Loading a zone from its master file.

use super::maintenance::effective_type;
use super::timers::{jitter, secs, SoaTimers};
use super::{check_apex, Zone, ZoneError, ZoneFlags};
use crate::base::iana::Class;
use crate::base::name::Name;
use crate::base::rdata::{Rdata, Soa};
use crate::base::record::{Record, Ttl};
use crate::base::serial::Serial;
use crate::config::ZoneType;
use crate::sign::{chain, keywalk};
use crate::store::{Journal, JournalError, Loaded, MasterFile, ZoneVersion};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

//------------ LoadStatus ----------------------------------------------------

/// What came of a load.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoadStatus {
    /// The zone was loaded with the given serial.
    Loaded(Serial),

    /// The master file didn't change since it was last loaded.
    Unchanged,

    /// Another load is in progress.
    Pending,

    /// There is no master file. A transferred zone will refresh.
    NoFile,
}

//------------ Loading -------------------------------------------------------

impl Zone {
    /// Loads the zone from its master file.
    ///
    /// A slave zone whose master file hasn't changed since it was last
    /// loaded is left alone.
    pub async fn load(self: &Arc<Self>) -> Result<LoadStatus, ZoneError> {
        self.do_load(false).await
    }

    /// Loads the zone even if the master file didn't change.
    pub async fn force_reload(self: &Arc<Self>) -> Result<LoadStatus, ZoneError> {
        self.do_load(true).await
    }

    /// Starts loading the zone in the background.
    pub fn start_load(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.flags.intersects(ZoneFlags::LOADING | ZoneFlags::EXITING) {
            return;
        }
        let zone = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = zone.load().await {
                error!("Zone '{}': loading failed: {err}", zone.name);
            }
            zone.state.lock().tasks.load = None;
        });
        state.tasks.load = Some(handle.abort_handle());
    }

    async fn do_load(
        self: &Arc<Self>,
        force: bool,
    ) -> Result<LoadStatus, ZoneError> {
        let (file, zone_type, known_modified, journal) = {
            let mut state = self.state.lock();
            if state.flags.contains(ZoneFlags::EXITING) {
                return Err(ZoneError::Exiting);
            }
            if state.flags.contains(ZoneFlags::LOADING) {
                debug!("Zone '{}': already loading", self.name);
                return Ok(LoadStatus::Pending);
            }
            let zone_type = effective_type(&state.config);
            let Some(path) = state.config.master_file.clone() else {
                return self.load_without_file(&mut state, zone_type);
            };
            state.flags.insert(ZoneFlags::LOADING);
            self.set_timer(&state);
            (
                MasterFile::new(path, state.config.master_format),
                zone_type,
                if force || zone_type != ZoneType::Slave {
                    None
                } else {
                    state.file_modified
                },
                state.journal.clone(),
            )
        };

        let res = self
            .read_master_file(file, zone_type, known_modified, journal)
            .await;
        let mut state = self.state.lock();
        state.flags.remove(ZoneFlags::LOADING);
        let res = match res {
            Ok(Some(loaded)) => self.install(&mut state, zone_type, loaded),
            Ok(None) => {
                debug!("Zone '{}': master file unchanged", self.name);
                Ok(LoadStatus::Unchanged)
            }
            Err(err) => {
                if matches!(zone_type, ZoneType::Slave | ZoneType::Stub) {
                    // The masters will have it.
                    warn!(
                        "Zone '{}': loading master file failed: {err}",
                        self.name
                    );
                    state.timers.refresh = Some(Instant::now());
                } else {
                    error!(
                        "Zone '{}': loading master file failed: {err}",
                        self.name
                    );
                }
                Err(err)
            }
        };
        self.set_timer(&state);
        drop(state);
        if matches!(res, Ok(LoadStatus::Loaded(_))) {
            self.content_changed();
        }
        res
    }

    /// Handles a zone without master file.
    fn load_without_file(
        &self,
        state: &mut super::ZoneState,
        zone_type: ZoneType,
    ) -> Result<LoadStatus, ZoneError> {
        match zone_type {
            ZoneType::Slave | ZoneType::Stub => {
                state.timers.refresh = Some(Instant::now());
                self.set_timer(state);
                Ok(LoadStatus::NoFile)
            }
            ZoneType::Key if state.db.is_none() => {
                let version = key_zone_skeleton(&self.name, self.class)?;
                let serial = version.serial().unwrap_or(Serial(0));
                let db = self.new_db(state)?;
                db.replace(version)?;
                state.db = Some(db);
                state.flags.insert(ZoneFlags::LOADED);
                state.timers.refresh_key = Some(Instant::now());
                self.set_timer(state);
                Ok(LoadStatus::Loaded(serial))
            }
            ZoneType::Key => Ok(LoadStatus::Unchanged),
            _ => Err(ZoneError::NoMasterFile),
        }
    }

    /// Reads the master file and rolls the journal forward.
    ///
    /// Returns `None` if the file is unchanged since `known_modified`.
    async fn read_master_file(
        self: &Arc<Self>,
        file: MasterFile,
        zone_type: ZoneType,
        known_modified: Option<SystemTime>,
        journal: Option<Arc<dyn Journal>>,
    ) -> Result<Option<Loaded>, ZoneError> {
        let _permit = self.shared.io.acquire(false).await;
        let zone = self.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(known) = known_modified {
                if file.modified()? == known {
                    return Ok(None);
                }
            }
            let parser = zone.shared.services.parser.as_deref();
            let mut loaded = file.load(&zone.name, zone.class, parser)?;
            if let Some(journal) = journal {
                zone.roll_forward(&mut loaded, journal.as_ref())?;
            }
            check_apex(&loaded.version, zone_type != ZoneType::Key)?;
            if let Some(check) = zone.shared.services.record_check.as_ref() {
                check.check(&loaded.version).map_err(ZoneError::BadZone)?;
            }
            Ok(Some(loaded))
        })
        .await
        .map_err(|_| ZoneError::Invariant("load task failed"))?
    }

    /// Applies the journal to freshly loaded content.
    ///
    /// A journal that doesn't continue from the loaded serial is out of
    /// sync and gets discarded.
    fn roll_forward(
        &self,
        loaded: &mut Loaded,
        journal: &dyn Journal,
    ) -> Result<(), ZoneError> {
        if journal.is_empty() {
            return Ok(());
        }
        let serial = loaded
            .version
            .serial()
            .ok_or_else(|| ZoneError::BadZone("no SOA".into()))?;
        let txns = match journal.transactions(serial, None) {
            Ok(txns) => txns,
            Err(JournalError::NotFound(_)) => {
                warn!(
                    "Zone '{}': journal out of sync with zone, discarding it",
                    self.name
                );
                journal.clear()?;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let count = txns.len();
        for txn in txns {
            loaded.version.update(&txn.to_diff())?;
            if txn.source_serial.is_some() {
                loaded.source_serial = txn.source_serial;
            }
        }
        if count > 0 {
            info!(
                "Zone '{}': applied {count} journal transactions from serial {serial}",
                self.name
            );
        }
        Ok(())
    }

    /// Makes loaded content current.
    fn install(
        self: &Arc<Self>,
        state: &mut super::ZoneState,
        zone_type: ZoneType,
        loaded: Loaded,
    ) -> Result<LoadStatus, ZoneError> {
        let Loaded {
            version,
            source_serial,
            modified,
        } = loaded;
        let (soa, _) = version
            .soa()
            .ok_or_else(|| ZoneError::BadZone("no SOA".into()))?;
        let soa = soa.clone();
        let serial = soa.serial;
        let db = self.new_db(state)?;
        let private_type = state.config.private_type();
        let signing = keywalk::pending_requests(&version, private_type);
        let chains = chain::pending_requests(&version, private_type);
        let anchors = (zone_type == ZoneType::Key).then(|| version.clone());
        db.replace(version)?;

        state.db = Some(db);
        state.flags.insert(ZoneFlags::LOADED);
        state.flags.remove(ZoneFlags::EXPIRED);
        state.file_modified = Some(modified);
        state.source_serial = source_serial;
        state.soa_timers = SoaTimers::from_soa(&soa, &state.config);
        let now = Instant::now();

        match zone_type {
            ZoneType::Slave | ZoneType::Stub => {
                self.schedule_after_load(state, modified, now);
            }
            ZoneType::Master => {
                for request in signing {
                    if !state.signing.iter().any(|known| known.same_as(&request)) {
                        state.signing.push_back(request);
                    }
                }
                for request in chains {
                    if !state.chains.iter().any(|known| known.same_chain(&request)) {
                        state.chains.push_back(request);
                    }
                }
                if !state.signing.is_empty() {
                    state.timers.signing = Some(now);
                }
                if !state.chains.is_empty() {
                    state.timers.nsec3chain = Some(now);
                }
                match self.shared.services.keys.keys(&self.name) {
                    Ok(keys) if !keys.is_empty() => {
                        state.timers.rekey = Some(now)
                    }
                    Ok(_) => {}
                    Err(err) => {
                        error!("Zone '{}': reading keys failed: {err}", self.name)
                    }
                }
            }
            ZoneType::Key => {
                state.timers.refresh_key = Some(now);
            }
            ZoneType::Redirect => {}
        }

        if matches!(zone_type, ZoneType::Master | ZoneType::Slave) {
            state.need_notify();
            state.flags.insert(ZoneFlags::STARTUPNOTIFY);
        }
        if let Some(version) = anchors {
            self.install_anchors(&version);
        }
        info!("Zone '{}': loaded serial {serial}", self.name);
        Ok(LoadStatus::Loaded(serial))
    }

    /// Sets expiry and first refresh of a transferred zone.
    ///
    /// The zone expires counting from when the master file was last
    /// written. The first refresh happens after a jittered retry interval
    /// unless the zone expires earlier.
    fn schedule_after_load(
        &self,
        state: &mut super::ZoneState,
        modified: SystemTime,
        now: Instant,
    ) {
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();
        let lifetime = secs(state.soa_timers.expire);
        let expire = match lifetime.checked_sub(age) {
            Some(left) => now + left,
            None => now,
        };
        state.timers.expire = Some(expire);
        let refresh = now + jitter(state.soa_timers.retry);
        state.timers.refresh = Some(refresh.min(expire));
        debug!(
            "Zone '{}': expires in {}s",
            self.name,
            expire.saturating_duration_since(now).as_secs()
        );
    }
}

/// Creates the content of a fresh key zone.
///
/// A key zone only has an SOA at its apex and the key data records of
/// the managed keys.
fn key_zone_skeleton(
    origin: &Name,
    class: Class,
) -> Result<ZoneVersion, ZoneError> {
    let soa = Soa {
        mname: origin.clone(),
        rname: origin.clone(),
        serial: Serial(1),
        refresh: Ttl::from_secs(0),
        retry: Ttl::from_secs(0),
        expire: Ttl::from_secs(0),
        minimum: Ttl::from_secs(0),
    };
    let record = Record::new(origin.clone(), class, Ttl::from_secs(0), Rdata::Soa(soa));
    Ok(ZoneVersion::from_records(origin.clone(), class, [record])?)
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::base::iana::Rtype;
    use crate::config::{ManagerConfig, RemoteAddr, ZoneConfig};
    use crate::manager::{Services, ZoneManager};
    use crate::net::mock::MockTransport;
    use crate::store::{Diff, MasterFormat, MemoryJournal, Transaction};
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

    fn content(serial: u32) -> ZoneVersion {
        ZoneVersion::from_records(
            name("example."),
            Class::IN,
            [
                record("example.", soa(serial)),
                record("example.", Rdata::Ns(name("ns1.example."))),
                record("ns1.example.", Rdata::A(Ipv4Addr::new(192, 0, 2, 1))),
            ],
        )
        .unwrap()
    }

    fn write_file(dir: &std::path::Path, version: &ZoneVersion) -> std::path::PathBuf {
        let path = dir.join(format!("example-{}.zone", version.id()));
        MasterFile::new(&path, MasterFormat::Raw)
            .dump(version, None)
            .unwrap();
        path
    }

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "zonekeeper-load-{tag}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager() -> ZoneManager {
        ZoneManager::new(
            ManagerConfig::default(),
            Services::new(Arc::new(MockTransport::new())),
        )
    }

    fn config(zone_type: ZoneType, path: Option<std::path::PathBuf>) -> ZoneConfig {
        let mut config = ZoneConfig::new(zone_type);
        config.master_file = path;
        config.master_format = MasterFormat::Raw;
        config
    }

    #[tokio::test]
    async fn master_loads_and_rolls_journal_forward() {
        let dir = temp_dir("master");
        let path = write_file(&dir, &content(10));
        let manager = manager();
        let zone = manager
            .create_zone(name("example."), Class::IN, config(ZoneType::Master, Some(path)))
            .unwrap();
        let journal = Arc::new(MemoryJournal::new());
        let mut diff = Diff::new();
        diff.delete(record("example.", soa(10)));
        diff.add(record("example.", soa(11)));
        diff.add(record("www.example.", Rdata::A(Ipv4Addr::new(192, 0, 2, 8))));
        journal
            .write(&Transaction::from_diff(&diff, None).unwrap())
            .unwrap();
        zone.set_journal(Some(journal));

        assert_eq!(zone.load().await.unwrap(), LoadStatus::Loaded(Serial(11)));
        let version = zone.version().unwrap();
        assert!(version.find(&name("www.example."), Rtype::A).is_some());
        let flags = zone.flags();
        assert!(flags.contains(ZoneFlags::LOADED | ZoneFlags::STARTUPNOTIFY));
        assert!(!flags.contains(ZoneFlags::LOADING));
    }

    #[tokio::test]
    async fn stale_journal_is_discarded() {
        let dir = temp_dir("stale");
        let path = write_file(&dir, &content(20));
        let manager = manager();
        let zone = manager
            .create_zone(name("example."), Class::IN, config(ZoneType::Master, Some(path)))
            .unwrap();
        let journal = Arc::new(MemoryJournal::new());
        let mut diff = Diff::new();
        diff.delete(record("example.", soa(5)));
        diff.add(record("example.", soa(6)));
        journal
            .write(&Transaction::from_diff(&diff, None).unwrap())
            .unwrap();
        zone.set_journal(Some(journal.clone()));

        assert_eq!(zone.load().await.unwrap(), LoadStatus::Loaded(Serial(20)));
        assert!(journal.is_empty());
    }

    #[tokio::test]
    async fn bad_zone_keeps_previous_content() {
        let dir = temp_dir("bad");
        let good = write_file(&dir, &content(1));
        let manager = manager();
        let zone = manager
            .create_zone(
                name("example."),
                Class::IN,
                config(ZoneType::Master, Some(good)),
            )
            .unwrap();
        zone.load().await.unwrap();

        let no_ns = ZoneVersion::from_records(
            name("example."),
            Class::IN,
            [record("example.", soa(2))],
        )
        .unwrap();
        let bad = write_file(&dir, &no_ns);
        zone.set_config(config(ZoneType::Master, Some(bad))).unwrap();
        assert!(matches!(
            zone.force_reload().await,
            Err(ZoneError::BadZone(_))
        ));
        assert_eq!(zone.serial(), Some(Serial(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn slave_without_file_refreshes() {
        let manager = manager();
        let master = RemoteAddr::new("192.0.2.1:53".parse().unwrap());
        let zone = manager
            .create_zone(
                name("example."),
                Class::IN,
                config(ZoneType::Slave, None).with_masters(vec![master]),
            )
            .unwrap();
        assert_eq!(zone.load().await.unwrap(), LoadStatus::NoFile);
        assert!(zone.timers().refresh.is_some());
    }

    #[tokio::test]
    async fn slave_skips_unchanged_file() {
        let dir = temp_dir("slave");
        let path = write_file(&dir, &content(3));
        let manager = manager();
        let master = RemoteAddr::new("192.0.2.1:53".parse().unwrap());
        let zone = manager
            .create_zone(
                name("example."),
                Class::IN,
                config(ZoneType::Slave, Some(path)).with_masters(vec![master]),
            )
            .unwrap();
        zone.set_refresh_enabled(false);
        assert_eq!(zone.load().await.unwrap(), LoadStatus::Loaded(Serial(3)));
        assert_eq!(zone.load().await.unwrap(), LoadStatus::Unchanged);
        assert_eq!(
            zone.force_reload().await.unwrap(),
            LoadStatus::Loaded(Serial(3))
        );
        let timers = zone.timers();
        assert!(timers.expire.is_some());
        assert!(timers.refresh.unwrap() <= timers.expire.unwrap());
    }

    #[tokio::test]
    async fn master_without_file_fails() {
        let manager = manager();
        let zone = manager
            .create_zone(name("example."), Class::IN, config(ZoneType::Master, None))
            .unwrap();
        assert!(matches!(zone.load().await, Err(ZoneError::NoMasterFile)));
    }
}
