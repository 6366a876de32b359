//! Zones and their maintenance.
//!
//! A [`Zone`] holds the runtime state of a single zone: its type and
//! configuration, a set of state flags, the deadlines of the various
//! maintenance activities and a handle to the database holding its
//! current content.
//!
//! All state lives behind a single lock that is never held across an
//! `.await`. Long running activities such as refreshing, transferring,
//! loading, dumping and signing run as tokio tasks. They take the lock
//! briefly when they start and again when they are done. Each zone has
//! one timer task that wakes up when the earliest active deadline has
//! passed and runs the zone's maintenance.
//!
//! Zones are created through the [`ZoneManager`][crate::manager::ZoneManager]
//! which hands out counted references in the form of [`ZoneRef`]s. When
//! the last of them goes away, the zone shuts down.

pub use self::flags::ZoneFlags;
pub use self::load::LoadStatus;
pub use self::timers::{SoaTimers, Timers};

pub mod flags;
mod load;
pub(crate) mod maintenance;
mod pair;
pub mod timers;

use self::timers::{secs, ZoneTimer};
use crate::base::iana::{Class, Rtype};
use crate::base::name::Name;
use crate::base::serial::Serial;
use crate::config::{NotifyType, RemoteAddr, ZoneConfig, ZoneType};
use crate::manager::Shared;
use crate::sign::chain::ChainRequest;
use crate::sign::keywalk::SigningRequest;
use crate::sign::SignError;
use crate::store::{
    Database, DbError, Diff, FileJournal, Journal, JournalError,
    MasterFileError, Transaction, ZoneVersion,
};
use crate::trust::TrustError;
use crate::xfr::upstream::Upstreams;
use crate::xfr::XfrError;
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicUsize, Ordering};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::SystemTime;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

//------------ RecordCheck ---------------------------------------------------

/// Additional checks of zone content before it is accepted.
///
/// The embedding server can use this to apply its own policies, such as
/// checking MX or SRV targets, to loaded and transferred zones.
pub trait RecordCheck: fmt::Debug + Send + Sync {
    fn check(&self, version: &ZoneVersion) -> Result<(), String>;
}

//------------ Zone ----------------------------------------------------------

pub struct Zone {
    name: Name,
    class: Class,
    pub(crate) shared: Arc<Shared>,
    pub(crate) state: Mutex<ZoneState>,
    pub(crate) timer: ZoneTimer,

    /// Held while computing and committing a change of content.
    pub(crate) writer: tokio::sync::Mutex<()>,

    /// The number of outstanding [`ZoneRef`]s.
    erefs: AtomicUsize,
}

/// The mutable state of a zone.
pub(crate) struct ZoneState {
    pub config: ZoneConfig,
    pub flags: ZoneFlags,
    pub timers: Timers,
    pub soa_timers: SoaTimers,

    /// The database with the current content, if loaded.
    pub db: Option<Arc<dyn Database>>,
    pub journal: Option<Arc<dyn Journal>>,
    pub upstreams: Upstreams,

    /// The master that sent the last notify, tried first.
    pub notify_from: Option<SocketAddr>,

    /// Modification time of the master file when it was last loaded.
    pub file_modified: Option<SystemTime>,

    pub last_notify: Option<Instant>,

    /// For a signed zone, the serial of the raw zone it was made from.
    pub source_serial: Option<Serial>,

    pub tasks: Tasks,

    /// The next rekey re-signs the zone with all keys.
    pub full_sign: bool,

    pub signing: VecDeque<SigningRequest>,
    pub chains: VecDeque<ChainRequest>,

    /// The unsigned zone this zone signs.
    pub raw: Option<Arc<Zone>>,

    /// The signed zone made from this zone.
    pub secure: Weak<Zone>,

    /// The raw zone changed while syncing from it.
    pub resync: bool,
}

impl ZoneState {
    fn new(config: ZoneConfig, journal: Option<Arc<dyn Journal>>) -> Self {
        ZoneState {
            upstreams: Upstreams::new(config.masters.clone()),
            config,
            flags: ZoneFlags::empty(),
            timers: Timers::default(),
            soa_timers: SoaTimers::default(),
            db: None,
            journal,
            notify_from: None,
            file_modified: None,
            last_notify: None,
            source_serial: None,
            tasks: Tasks::default(),
            full_sign: false,
            signing: VecDeque::new(),
            chains: VecDeque::new(),
            raw: None,
            secure: Weak::new(),
            resync: false,
        }
    }

    /// Returns the current version if the zone is loaded.
    pub fn version(&self) -> Option<Arc<ZoneVersion>> {
        if self.flags.contains(ZoneFlags::LOADED) {
            self.db.as_ref().map(|db| db.current())
        } else {
            None
        }
    }

    pub fn serial(&self) -> Option<Serial> {
        self.version().and_then(|version| version.serial())
    }

    /// Schedules a dump `delay` seconds from now.
    ///
    /// An earlier scheduled dump stays.
    pub fn need_dump(&mut self, delay: u32) {
        if self.config.master_file.is_none() {
            return;
        }
        self.flags.insert(ZoneFlags::NEEDDUMP);
        let when = Instant::now() + secs(delay);
        if self.timers.dump.map_or(true, |dump| dump > when) {
            self.timers.dump = Some(when);
        }
    }

    /// Schedules sending notifies.
    ///
    /// A notify round never follows the previous one sooner than the
    /// configured delay.
    pub fn need_notify(&mut self) {
        if self.config.notify_type == NotifyType::No {
            return;
        }
        self.flags.insert(ZoneFlags::NEEDNOTIFY);
        let now = Instant::now();
        let earliest = self
            .last_notify
            .map_or(now, |last| last + secs(self.config.notify_delay))
            .max(now);
        self.timers.notify = Some(
            self.timers
                .notify
                .map_or(earliest, |notify| notify.max(earliest)),
        );
    }

    /// Returns the address of the master to talk to next.
    pub fn current_master(&self) -> Option<SocketAddr> {
        self.upstreams.current().map(|remote| remote.addr)
    }

    /// Returns the source address for talking to masters.
    pub fn transfer_source(&self) -> Option<SocketAddr> {
        if self.flags.contains(ZoneFlags::USEALTXFRSRC) {
            self.config.alt_transfer_source
        } else {
            self.config.transfer_source
        }
    }
}

//------------ Tasks ---------------------------------------------------------

/// The tasks a zone has running.
#[derive(Debug, Default)]
pub(crate) struct Tasks {
    /// The refresh cycle or the transfer it started.
    pub refresh: Option<AbortHandle>,
    pub load: Option<AbortHandle>,
    pub dump: Option<AbortHandle>,
    pub signing: Option<AbortHandle>,
    pub trust: Option<AbortHandle>,
    pub sync: Option<AbortHandle>,
    pub notifies: TaskList<NotifyTarget>,
    pub forwards: TaskList<()>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for handle in [
            self.refresh.take(),
            self.load.take(),
            self.dump.take(),
            self.signing.take(),
            self.trust.take(),
            self.sync.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
        self.notifies.abort_all();
        self.forwards.abort_all();
    }
}

/// Where a notify goes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum NotifyTarget {
    /// An address, possibly with a TSIG key.
    Addr(RemoteAddr),

    /// A name server whose addresses still need to be looked up.
    Name(Name),
}

//------------ TaskList ------------------------------------------------------

/// A list of transient tasks of the same kind.
///
/// Every task gets an id when it is registered so that it can remove
/// itself when it is done. Tasks are spawned and registered while
/// holding the zone lock, so a task can't try to remove itself before
/// it was added.
#[derive(Debug)]
pub(crate) struct TaskList<K> {
    next_id: u64,
    entries: Vec<(u64, K, AbortHandle)>,
}

impl<K> Default for TaskList<K> {
    fn default() -> Self {
        TaskList {
            next_id: 0,
            entries: Vec::new(),
        }
    }
}

impl<K: PartialEq> TaskList<K> {
    pub fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.iter().any(|(_, known, _)| known == key)
    }

    pub fn insert(&mut self, id: u64, key: K, handle: AbortHandle) {
        self.entries.push((id, key, handle))
    }

    pub fn remove(&mut self, id: u64) {
        self.entries.retain(|(known, _, _)| *known != id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn abort_all(&mut self) {
        for (_, _, handle) in self.entries.drain(..) {
            handle.abort();
        }
    }
}

//------------ Zone: Creation and Accessors ----------------------------------

impl Zone {
    /// Creates a new zone and starts its timer task.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn new(
        name: Name,
        class: Class,
        config: ZoneConfig,
        shared: Arc<Shared>,
    ) -> Result<Arc<Self>, ZoneError> {
        let journal = match config.journal.as_ref() {
            Some(path) => Some(open_journal(path)?),
            None => None,
        };
        let (timer, rx) = ZoneTimer::new();
        let zone = Arc::new(Zone {
            name,
            class,
            shared,
            state: Mutex::new(ZoneState::new(config, journal)),
            timer,
            writer: tokio::sync::Mutex::new(()),
            erefs: AtomicUsize::new(0),
        });
        tokio::spawn(maintenance::run_timer(Arc::downgrade(&zone), rx));
        debug!("Zone '{}': created", zone.name);
        Ok(zone)
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn class(&self) -> Class {
        self.class
    }

    pub fn zone_type(&self) -> ZoneType {
        self.state.lock().config.zone_type
    }

    pub fn flags(&self) -> ZoneFlags {
        self.state.lock().flags
    }

    pub fn config(&self) -> ZoneConfig {
        self.state.lock().config.clone()
    }

    /// Returns the current content if the zone is loaded.
    pub fn version(&self) -> Option<Arc<ZoneVersion>> {
        self.state.lock().version()
    }

    pub fn serial(&self) -> Option<Serial> {
        self.state.lock().serial()
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().flags.contains(ZoneFlags::LOADED)
    }

    pub fn timers(&self) -> Timers {
        self.state.lock().timers
    }

    pub fn soa_timers(&self) -> SoaTimers {
        self.state.lock().soa_timers
    }

    pub fn journal(&self) -> Option<Arc<dyn Journal>> {
        self.state.lock().journal.clone()
    }

    /// Returns the instant the zone's timer is armed for.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.timer.armed()
    }

    pub fn pending_signing(&self) -> Vec<SigningRequest> {
        self.state.lock().signing.iter().cloned().collect()
    }

    pub fn pending_chains(&self) -> Vec<ChainRequest> {
        self.state.lock().chains.iter().cloned().collect()
    }

    /// Returns the number of outstanding notifies.
    pub fn pending_notifies(&self) -> usize {
        self.state.lock().tasks.notifies.len()
    }

    pub fn status(&self) -> ZoneStatus {
        let state = self.state.lock();
        ZoneStatus {
            name: self.name.clone(),
            class: self.class,
            zone_type: state.config.zone_type,
            flags: state.flags,
            serial: state.serial(),
            current_master: state.current_master(),
            next_refresh: state.timers.refresh,
            expires: state.timers.expire,
            pending_signing: state.signing.len(),
            pending_chains: state.chains.len(),
            pending_notifies: state.tasks.notifies.len(),
        }
    }

    /// Returns the number of outstanding [`ZoneRef`]s.
    pub fn references(&self) -> usize {
        self.erefs.load(Ordering::SeqCst)
    }
}

//------------ Zone: Configuration -------------------------------------------

impl Zone {
    /// Replaces the configuration.
    ///
    /// Changing the masters restarts the search for a working one with
    /// the next refresh.
    pub fn set_config(&self, config: ZoneConfig) -> Result<(), ZoneError> {
        let journal = match config.journal.as_ref() {
            Some(path) => Some(open_journal(path)?),
            None => None,
        };
        let mut state = self.state.lock();
        if state.config.journal != config.journal {
            state.journal = journal;
        }
        if state.config.masters != config.masters {
            state.upstreams = Upstreams::new(config.masters.clone());
            state.flags.remove(ZoneFlags::NOMASTERS);
        }
        state.config = config;
        if let Some(db) = state.db.as_ref() {
            db.set_resign_interval(state.config.resign_interval());
        }
        self.set_timer(&state);
        Ok(())
    }

    pub fn set_type(&self, zone_type: ZoneType) {
        let mut state = self.state.lock();
        state.config.zone_type = zone_type;
        self.set_timer(&state);
    }

    /// Sets the masters, each with an optional TSIG key.
    pub fn set_masters(&self, masters: Vec<RemoteAddr>) {
        let mut state = self.state.lock();
        if state.config.masters == masters {
            return;
        }
        state.upstreams = Upstreams::new(masters.clone());
        state.config.masters = masters;
        state.flags.remove(ZoneFlags::NOMASTERS);
        self.set_timer(&state);
    }

    /// Sets the additional notify targets.
    pub fn set_also_notify(&self, targets: Vec<RemoteAddr>) {
        self.state.lock().config.also_notify = targets;
    }

    /// Sets the arguments for the database backend.
    ///
    /// They are used the next time a database is created.
    pub fn set_db_args(&self, args: Vec<String>) {
        self.state.lock().config.database = args;
    }

    pub fn set_journal(&self, journal: Option<Arc<dyn Journal>>) {
        self.state.lock().journal = journal;
    }

    /// Enables or disables refreshing.
    pub fn set_refresh_enabled(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.flags.set(ZoneFlags::NOREFRESH, !enabled);
        self.set_timer(&state);
    }
}

//------------ Zone: Internals -----------------------------------------------

impl Zone {
    /// Re-arms the timer for the earliest active deadline.
    ///
    /// This is cheap and can be called whenever state changed.
    pub(crate) fn set_timer(&self, state: &ZoneState) {
        let next = if state.flags.contains(ZoneFlags::EXITING) {
            None
        } else {
            state.timers.next(
                state.config.zone_type,
                !state.config.masters.is_empty(),
                state.flags,
                Instant::now(),
            )
        };
        if self.timer.arm(next) {
            trace!("Zone '{}': timer armed for {:?}", self.name, next);
        }
    }

    /// Creates a new empty database for the zone.
    pub(crate) fn new_db(
        &self,
        state: &ZoneState,
    ) -> Result<Arc<dyn Database>, ZoneError> {
        let db = self.shared.services.backend.create(
            &self.name,
            self.class,
            &state.config.database,
        )?;
        db.set_resign_interval(state.config.resign_interval());
        Ok(db)
    }

    /// Commits a change of content.
    ///
    /// The change is written to the journal first. Afterwards a dump and
    /// notifies are scheduled and a signed partner zone is told about the
    /// change. Callers hold the writer lock.
    pub(crate) fn commit(
        self: &Arc<Self>,
        diff: &Diff,
    ) -> Result<Arc<ZoneVersion>, ZoneError> {
        let (db, journal, source_serial) = {
            let state = self.state.lock();
            (
                state.db.clone().ok_or(ZoneError::NotLoaded)?,
                state.journal.clone(),
                state.source_serial,
            )
        };
        if let Some(journal) = journal.as_ref() {
            if let Some(txn) = Transaction::from_diff(diff, source_serial) {
                self.journal_write(journal.as_ref(), &txn)?;
            }
        }
        let version = db.commit(diff)?;
        {
            let mut state = self.state.lock();
            let delay = state.config.dump_delay;
            state.need_dump(delay);
            state.need_notify();
            if let (Some(journal), Some(max)) =
                (journal.as_ref(), state.config.max_journal_size)
            {
                if journal.size() > max {
                    state.flags.insert(ZoneFlags::NEEDCOMPACT);
                }
            }
            self.set_timer(&state);
        }
        debug!(
            "Zone '{}': committed serial {}",
            self.name,
            version.serial().map(|s| s.to_string()).unwrap_or_default()
        );
        self.content_changed();
        Ok(version)
    }

    /// Writes a transaction, discarding a journal that is out of sync.
    pub(crate) fn journal_write(
        &self,
        journal: &dyn Journal,
        txn: &Transaction,
    ) -> Result<(), ZoneError> {
        match journal.write(txn) {
            Err(JournalError::OutOfSequence { .. }) => {
                warn!(
                    "Zone '{}': journal out of sync with zone, discarding it",
                    self.name
                );
                journal.clear()?;
                journal.write(txn)?;
                Ok(())
            }
            res => Ok(res?),
        }
    }

    /// Compacts the journal if it asked for it.
    pub(crate) fn compact_journal(&self, state: &mut ZoneState) {
        if !state.flags.contains(ZoneFlags::NEEDCOMPACT) {
            return;
        }
        state.flags.remove(ZoneFlags::NEEDCOMPACT);
        let (Some(journal), Some(max)) =
            (state.journal.as_ref(), state.config.max_journal_size)
        else {
            return;
        };
        match journal.compact(max) {
            Ok(()) => debug!("Zone '{}': journal compacted", self.name),
            Err(err) => {
                error!("Zone '{}': compacting journal failed: {err}", self.name)
            }
        }
    }

    /// Drops the content of the zone because it expired.
    pub(crate) fn expire(&self, state: &mut ZoneState) {
        warn!("Zone '{}': expired", self.name);
        state.flags.insert(ZoneFlags::EXPIRED);
        state.soa_timers = SoaTimers::default();
        state.flags.remove(ZoneFlags::HAVETIMERS);
        state.timers.expire = None;
        Self::unload(state);
    }

    pub(crate) fn unload(state: &mut ZoneState) {
        state.db = None;
        state.flags.remove(ZoneFlags::LOADED | ZoneFlags::NEEDDUMP);
        state.timers.dump = None;
    }

    /// Shuts the zone down.
    ///
    /// Running tasks are aborted and queued work is dropped. The zone
    /// leaves the manager's registry and the pairing with a partner
    /// zone is dissolved.
    pub fn shutdown(self: &Arc<Self>) {
        let (raw, secure) = {
            let mut state = self.state.lock();
            if state.flags.contains(ZoneFlags::EXITING) {
                return;
            }
            state.flags.insert(ZoneFlags::EXITING);
            state.tasks.abort_all();
            state.flags.remove(ZoneFlags::SIGNING | ZoneFlags::DUMPING);
            self.set_timer(&state);
            (state.raw.take(), core::mem::take(&mut state.secure))
        };
        self.shared.xfrin_cancel(self);
        self.shared.unregister(self);
        if let Some(raw) = raw {
            raw.state.lock().secure = Weak::new();
        }
        if let Some(secure) = secure.upgrade() {
            secure.state.lock().raw = None;
        }
        debug!("Zone '{}': shut down", self.name);
    }

    /// Drops one external reference.
    fn release(self: &Arc<Self>) -> Result<(), ZoneError> {
        let prev = self
            .erefs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            })
            .map_err(|_| {
                ZoneError::Invariant("external reference count underflow")
            })?;
        if prev == 1 {
            self.shutdown();
        }
        Ok(())
    }
}

fn open_journal(path: &Path) -> Result<Arc<dyn Journal>, ZoneError> {
    Ok(Arc::new(FileJournal::open(path)?))
}

//--- Debug

impl fmt::Debug for Zone {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Zone")
            .field("name", &self.name)
            .field("class", &self.class)
            .finish()
    }
}

//------------ ZoneRef -------------------------------------------------------

/// A counted reference to a zone.
///
/// Cloning attaches another reference, dropping detaches it. Once the
/// last reference is gone, the zone shuts down. Tasks working on the
/// zone keep it alive until they notice.
pub struct ZoneRef {
    zone: Arc<Zone>,
    attached: bool,
}

impl ZoneRef {
    pub(crate) fn attach(zone: Arc<Zone>) -> Self {
        zone.erefs.fetch_add(1, Ordering::SeqCst);
        ZoneRef {
            zone,
            attached: true,
        }
    }

    /// Detaches the reference, reporting a broken reference count.
    pub fn detach(mut self) -> Result<(), ZoneError> {
        self.attached = false;
        self.zone.release()
    }

    pub fn zone(&self) -> &Arc<Zone> {
        &self.zone
    }
}

impl Clone for ZoneRef {
    fn clone(&self) -> Self {
        Self::attach(self.zone.clone())
    }
}

impl Drop for ZoneRef {
    fn drop(&mut self) {
        if self.attached {
            if let Err(err) = self.zone.release() {
                error!("Zone '{}': {err}", self.zone.name);
            }
        }
    }
}

impl Deref for ZoneRef {
    type Target = Arc<Zone>;

    fn deref(&self) -> &Self::Target {
        &self.zone
    }
}

impl fmt::Debug for ZoneRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("ZoneRef").field(&self.zone).finish()
    }
}

//------------ ZoneStatus ----------------------------------------------------

/// A snapshot of a zone's state for reporting.
#[derive(Clone, Debug)]
pub struct ZoneStatus {
    pub name: Name,
    pub class: Class,
    pub zone_type: ZoneType,
    pub flags: ZoneFlags,
    pub serial: Option<Serial>,
    pub current_master: Option<SocketAddr>,
    pub next_refresh: Option<Instant>,
    pub expires: Option<Instant>,
    pub pending_signing: usize,
    pub pending_chains: usize,
    pub pending_notifies: usize,
}

impl fmt::Display for ZoneStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Zone '{}' {} ({})", self.name, self.class, self.zone_type)?;
        match self.serial {
            Some(serial) => write!(f, " serial {serial}")?,
            None => f.write_str(" not loaded")?,
        }
        write!(f, " [{}]", self.flags)?;
        if let Some(master) = self.current_master {
            write!(f, " master {master}")?;
        }
        if self.pending_signing + self.pending_chains > 0 {
            write!(
                f,
                " signing {}/{}",
                self.pending_signing, self.pending_chains
            )?;
        }
        Ok(())
    }
}

//------------ ZoneError -----------------------------------------------------

#[derive(Debug)]
pub enum ZoneError {
    /// Internal bookkeeping is broken.
    Invariant(&'static str),

    /// The zone is shutting down.
    Exiting,

    /// The zone has no content.
    NotLoaded,

    /// The zone has no master file configured.
    NoMasterFile,

    /// A load is already in progress.
    Loading,

    /// The content failed validation.
    BadZone(String),

    /// The operation doesn't apply to zones of this type.
    WrongType(ZoneType),

    /// Two zones can't be linked for inline signing.
    Link(&'static str),

    Db(DbError),
    Journal(JournalError),
    MasterFile(MasterFileError),
    Sign(SignError),
    Xfr(XfrError),
    Trust(TrustError),
}

impl From<DbError> for ZoneError {
    fn from(err: DbError) -> Self {
        ZoneError::Db(err)
    }
}

impl From<JournalError> for ZoneError {
    fn from(err: JournalError) -> Self {
        ZoneError::Journal(err)
    }
}

impl From<MasterFileError> for ZoneError {
    fn from(err: MasterFileError) -> Self {
        ZoneError::MasterFile(err)
    }
}

impl From<SignError> for ZoneError {
    fn from(err: SignError) -> Self {
        ZoneError::Sign(err)
    }
}

impl From<XfrError> for ZoneError {
    fn from(err: XfrError) -> Self {
        ZoneError::Xfr(err)
    }
}

impl From<TrustError> for ZoneError {
    fn from(err: TrustError) -> Self {
        ZoneError::Trust(err)
    }
}

//--- Display and Error

impl fmt::Display for ZoneError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ZoneError::Invariant(what) => {
                write!(f, "invariant violated: {what}")
            }
            ZoneError::Exiting => f.write_str("zone is shutting down"),
            ZoneError::NotLoaded => f.write_str("zone not loaded"),
            ZoneError::NoMasterFile => f.write_str("no master file"),
            ZoneError::Loading => f.write_str("zone is loading"),
            ZoneError::BadZone(msg) => write!(f, "bad zone: {msg}"),
            ZoneError::WrongType(zone_type) => {
                write!(f, "not supported for {zone_type} zones")
            }
            ZoneError::Link(msg) => write!(f, "can't link zones: {msg}"),
            ZoneError::Db(err) => write!(f, "database: {err}"),
            ZoneError::Journal(err) => write!(f, "journal: {err}"),
            ZoneError::MasterFile(err) => write!(f, "master file: {err}"),
            ZoneError::Sign(err) => write!(f, "signing: {err}"),
            ZoneError::Xfr(err) => write!(f, "transfer: {err}"),
            ZoneError::Trust(err) => write!(f, "trust anchors: {err}"),
        }
    }
}

impl std::error::Error for ZoneError {}

/// Returns whether the version has exactly one SOA and some NS records.
pub(crate) fn check_apex(
    version: &ZoneVersion,
    need_ns: bool,
) -> Result<(), ZoneError> {
    let (soa, ns) = version.apex_counts();
    if soa != 1 {
        return Err(ZoneError::BadZone(format!("has {soa} SOA records")));
    }
    if need_ns && ns == 0 {
        return Err(ZoneError::BadZone("has no NS records".into()));
    }
    if version.find(version.origin(), Rtype::CNAME).is_some() {
        return Err(ZoneError::BadZone("CNAME at the apex".into()));
    }
    Ok(())
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::manager::{Services, ZoneManager};
    use crate::config::ManagerConfig;
    use crate::net::mock::MockTransport;
    use core::str::FromStr;
    use core::time::Duration;

    fn manager() -> ZoneManager {
        ZoneManager::new(
            ManagerConfig::default(),
            Services::new(Arc::new(MockTransport::new())),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn last_reference_shuts_down() {
        let manager = manager();
        let name = Name::from_str("example.com").unwrap();
        let zone = manager
            .create_zone(name.clone(), Class::IN, ZoneConfig::default())
            .unwrap();
        let other = zone.clone();
        assert_eq!(zone.references(), 2);
        let inner = zone.zone().clone();
        zone.detach().unwrap();
        assert!(!inner.flags().contains(ZoneFlags::EXITING));
        drop(other);
        assert!(inner.flags().contains(ZoneFlags::EXITING));
        assert!(manager.find_zone(&name, Class::IN).is_none());
        assert!(matches!(inner.release(), Err(ZoneError::Invariant(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn notify_respects_delay() {
        let manager = manager();
        let zone = manager
            .create_zone(
                Name::from_str("example.com").unwrap(),
                Class::IN,
                ZoneConfig::default(),
            )
            .unwrap();
        let mut state = zone.state.lock();
        let now = Instant::now();
        state.last_notify = Some(now);
        state.need_notify();
        assert_eq!(state.timers.notify, Some(now + Duration::from_secs(5)));
        assert!(state.flags.contains(ZoneFlags::NEEDNOTIFY));

        state.config.notify_type = NotifyType::No;
        state.flags.remove(ZoneFlags::NEEDNOTIFY);
        state.need_notify();
        assert!(!state.flags.contains(ZoneFlags::NEEDNOTIFY));
    }

    #[tokio::test(start_paused = true)]
    async fn dump_needs_a_master_file() {
        let manager = manager();
        let zone = manager
            .create_zone(
                Name::from_str("example.com").unwrap(),
                Class::IN,
                ZoneConfig::default(),
            )
            .unwrap();
        let mut state = zone.state.lock();
        state.need_dump(900);
        assert!(!state.flags.contains(ZoneFlags::NEEDDUMP));
        state.config.master_file = Some("example.com.zone".into());
        state.need_dump(900);
        let first = state.timers.dump.unwrap();
        state.need_dump(1800);
        assert_eq!(state.timers.dump, Some(first));
        state.need_dump(0);
        assert!(state.timers.dump.unwrap() < first);
    }

    #[test]
    fn status_display() {
        let status = ZoneStatus {
            name: Name::from_str("example.com").unwrap(),
            class: Class::IN,
            zone_type: ZoneType::Slave,
            flags: ZoneFlags::LOADED | ZoneFlags::REFRESH,
            serial: Some(Serial(10)),
            current_master: Some("192.0.2.1:53".parse().unwrap()),
            next_refresh: None,
            expires: None,
            pending_signing: 0,
            pending_chains: 0,
            pending_notifies: 0,
        };
        assert_eq!(
            status.to_string(),
            "Zone 'example.com.' IN (slave) serial 10 [loaded|refresh] \
             master 192.0.2.1:53"
        );
    }
}
