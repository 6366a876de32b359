//! The timer task and the activities it dispatches to.

use super::timers::instant_for;
use super::{Zone, ZoneError, ZoneFlags, ZoneState};
use crate::base::iana::SecAlg;
use crate::base::rdata::Nsec3param;
use crate::base::time::UnixTime;
use crate::config::{ZoneConfig, ZoneType};
use crate::sign::chain::{chain_quantum, ChainRequest};
use crate::sign::keywalk::{sign_quantum, SigningRequest};
use crate::sign::marker::{Marker, SigningMarker};
use crate::sign::nsec3::{check_algorithms, check_params, zone_algorithms};
use crate::sign::rekey::{keys_without_successor, rekey};
use crate::sign::resign::{next_resign, resign_quantum};
use crate::sign::{Batch, Signer, ZoneKey, QUANTUM_DELAY};
use crate::store::{Diff, MasterFile, ZoneVersion};
use core::fmt;
use core::time::Duration;
use rand::Rng;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// How often the key store is checked for changes without a known event.
const REKEY_INTERVAL: Duration = Duration::from_secs(3600);

/// When to try again after signing failed.
const SIGNING_RETRY: Duration = Duration::from_secs(300);

//------------ Timer Task ----------------------------------------------------

/// Runs the timer of a zone.
///
/// Waits for the instant published by the zone's [`ZoneTimer`] and runs
/// the zone's maintenance when it arrives. Ends once the zone is gone.
///
/// [`ZoneTimer`]: super::timers::ZoneTimer
pub(super) async fn run_timer(
    zone: Weak<Zone>,
    mut rx: watch::Receiver<Option<Instant>>,
) {
    loop {
        let deadline = *rx.borrow_and_update();
        match deadline {
            None => {
                if rx.changed().await.is_err() {
                    return;
                }
            }
            Some(deadline) => {
                tokio::select! {
                    _ = sleep_until(deadline) => {
                        let Some(zone) = zone.upgrade() else {
                            return;
                        };
                        zone.timer.fired();
                        zone.maintenance();
                    }
                    res = rx.changed() => {
                        if res.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

//------------ SignWork ------------------------------------------------------

/// The kinds of signing work that share a zone's signing slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SignWork {
    Rekey { full: bool },
    Keys,
    Chains,
    Resign,
}

impl fmt::Display for SignWork {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SignWork::Rekey { .. } => f.write_str("rekey"),
            SignWork::Keys => f.write_str("signing with keys"),
            SignWork::Chains => f.write_str("building chains"),
            SignWork::Resign => f.write_str("resigning"),
        }
    }
}

//------------ Maintenance ---------------------------------------------------

impl Zone {
    /// Does whatever is due.
    ///
    /// The activities are looked at in a fixed order. Each one that is
    /// started moves its deadline out of the way, so running maintenance
    /// more often than necessary is harmless.
    pub(crate) fn maintenance(self: &Arc<Self>) {
        let now = Instant::now();
        let due = |when: Option<Instant>| when.map_or(false, |when| when <= now);
        let mut state = self.state.lock();
        if state.flags.contains(ZoneFlags::EXITING) {
            return;
        }
        let zone_type = effective_type(&state.config);
        let transferred =
            matches!(zone_type, ZoneType::Slave | ZoneType::Stub);

        if transferred
            && state.flags.contains(ZoneFlags::LOADED)
            && due(state.timers.expire)
        {
            self.expire(&mut state);
            state.timers.refresh = Some(now);
        }

        if transferred
            && !state.config.masters.is_empty()
            && !state.flags.intersects(
                ZoneFlags::REFRESH | ZoneFlags::NOREFRESH | ZoneFlags::LOADING,
            )
            && due(state.timers.refresh)
        {
            self.start_refresh(&mut state);
        }

        if matches!(zone_type, ZoneType::Master | ZoneType::Slave)
            && state.flags.contains(ZoneFlags::NEEDNOTIFY)
            && due(state.timers.notify)
        {
            self.start_notify(&mut state);
        }

        if state.flags.contains(ZoneFlags::NEEDDUMP)
            && !state.flags.contains(ZoneFlags::DUMPING)
            && due(state.timers.dump)
        {
            self.start_dump(&mut state);
        }

        if zone_type == ZoneType::Key && due(state.timers.refresh_key) {
            self.start_key_refresh(&mut state, false);
        }

        if zone_type == ZoneType::Master {
            if due(state.timers.key_warn) {
                self.warn_keys(&mut state);
            }
            if !state.flags.contains(ZoneFlags::SIGNING) {
                let work = if due(state.timers.rekey) {
                    Some(SignWork::Rekey {
                        full: core::mem::take(&mut state.full_sign),
                    })
                } else if due(state.timers.signing) {
                    Some(SignWork::Keys)
                } else if due(state.timers.nsec3chain) {
                    Some(SignWork::Chains)
                } else if due(state.timers.resign) {
                    Some(SignWork::Resign)
                } else {
                    None
                };
                if let Some(work) = work {
                    self.start_signing(&mut state, work);
                }
            }
        }

        self.set_timer(&state);
    }
}

/// Returns the type a zone behaves as.
pub(crate) fn effective_type(config: &ZoneConfig) -> ZoneType {
    match config.zone_type {
        ZoneType::Redirect if config.masters.is_empty() => ZoneType::Master,
        ZoneType::Redirect => ZoneType::Slave,
        other => other,
    }
}

//------------ Triggers ------------------------------------------------------

impl Zone {
    /// Sends notifies right away.
    pub fn notify(&self) {
        let mut state = self.state.lock();
        state.need_notify();
        if state.flags.contains(ZoneFlags::NEEDNOTIFY) {
            state.timers.notify = Some(Instant::now());
        }
        self.set_timer(&state);
    }

    /// Dumps the zone as soon as possible.
    pub fn dump(&self) {
        let mut state = self.state.lock();
        state.need_dump(0);
        self.set_timer(&state);
    }

    /// Dumps the zone now and waits for the dump to finish.
    ///
    /// If a dump is running already, another one is scheduled to follow
    /// it right away.
    pub async fn flush(self: &Arc<Self>) -> Result<(), ZoneError> {
        {
            let mut state = self.state.lock();
            if state.config.master_file.is_none() {
                return Err(ZoneError::NoMasterFile);
            }
            if !state.flags.contains(ZoneFlags::LOADED) {
                return Err(ZoneError::NotLoaded);
            }
            if state.flags.contains(ZoneFlags::DUMPING) {
                state.need_dump(0);
                self.set_timer(&state);
                return Ok(());
            }
            state.flags.insert(ZoneFlags::DUMPING);
            state.flags.remove(ZoneFlags::NEEDDUMP);
            state.timers.dump = None;
        }
        let res = self.write_master_file().await;
        self.finish_dump(&res);
        res
    }

    /// Checks the key store for changes.
    ///
    /// With `full`, the zone is completely re-signed with all keys.
    pub fn rekey(&self, full: bool) {
        let mut state = self.state.lock();
        if full {
            state.full_sign = true;
        }
        state.timers.rekey = Some(Instant::now());
        self.set_timer(&state);
    }

    /// Starts adding the signatures of a key or removing them.
    pub fn sign_with_key(
        &self,
        algorithm: SecAlg,
        key_tag: u16,
        delete: bool,
    ) -> Result<(), ZoneError> {
        let mut state = self.state.lock();
        Self::check_signable(&state)?;
        let request = SigningRequest::new(algorithm, key_tag, delete);
        if !state.signing.iter().any(|known| known.same_as(&request)) {
            state.signing.push_back(request);
        }
        state.timers.signing = Some(Instant::now());
        self.set_timer(&state);
        Ok(())
    }

    /// Starts building an NSEC3 chain with the given parameters.
    ///
    /// The chain is refused if the zone has keys whose algorithm can't be
    /// used with NSEC3. In this case the zone isn't changed at all.
    pub fn add_nsec3param(
        &self,
        param: Nsec3param,
    ) -> Result<(), ZoneError> {
        let mut state = self.state.lock();
        let version = Self::check_signable(&state)?;
        check_params(&param)?;
        if let Err(err) = check_algorithms(zone_algorithms(&version)) {
            error!(
                "Zone '{}': NSEC3 chain {} refused: {err}",
                self.name, param
            );
            return Err(err.into());
        }
        let request = ChainRequest::add_nsec3(param);
        if !state.chains.iter().any(|known| known == &request) {
            state.chains.push_back(request);
        }
        state.timers.nsec3chain = Some(Instant::now());
        self.set_timer(&state);
        Ok(())
    }

    /// Starts removing the NSEC3 chain with the given parameters.
    ///
    /// With `nonsec`, no NSEC chain is built in its place.
    pub fn remove_nsec3param(
        &self,
        param: Nsec3param,
        nonsec: bool,
    ) -> Result<(), ZoneError> {
        let mut state = self.state.lock();
        Self::check_signable(&state)?;
        let request = ChainRequest::remove_nsec3(param, nonsec);
        if !state.chains.iter().any(|known| known == &request) {
            state.chains.push_back(request);
        }
        state.timers.nsec3chain = Some(Instant::now());
        self.set_timer(&state);
        Ok(())
    }

    /// Removes the completed signing markers of a key.
    ///
    /// Without a key, the completed markers of all keys go. Returns
    /// whether anything was removed.
    pub async fn key_done(
        self: &Arc<Self>,
        key: Option<(SecAlg, u16)>,
    ) -> Result<bool, ZoneError> {
        let _writer = self.writer.lock().await;
        let (version, config) = {
            let state = self.state.lock();
            (Self::check_signable(&state)?, state.config.clone())
        };
        let private_type = config.private_type();
        let Some(rrset) = version.find(&self.name, private_type) else {
            return Ok(false);
        };
        let mut diff = Diff::new();
        for record in rrset.records() {
            let done = matches!(
                Marker::from_rdata(&record.data, private_type),
                Some(Marker::Signing(SigningMarker { complete: true, algorithm, key_tag, .. }))
                    if key.map_or(true, |key| key == (algorithm, key_tag))
            );
            if done {
                diff.delete(record);
            }
        }
        if diff.is_empty() {
            return Ok(false);
        }
        let signer = self.signer(&config)?;
        let mut batch = Batch::new(&version);
        batch.apply(diff)?;
        batch.update_sigs(&signer, &self.name, private_type)?;
        if let Some(diff) = batch.finish(&signer)? {
            self.commit(&diff)?;
        }
        Ok(true)
    }

    /// Checks that the zone can be signed and returns its content.
    fn check_signable(
        state: &ZoneState,
    ) -> Result<Arc<ZoneVersion>, ZoneError> {
        if state.flags.contains(ZoneFlags::EXITING) {
            return Err(ZoneError::Exiting);
        }
        if effective_type(&state.config) != ZoneType::Master {
            return Err(ZoneError::WrongType(state.config.zone_type));
        }
        state.version().ok_or(ZoneError::NotLoaded)
    }
}

//------------ Dumping -------------------------------------------------------

impl Zone {
    fn start_dump(self: &Arc<Self>, state: &mut ZoneState) {
        state.flags.remove(ZoneFlags::NEEDDUMP);
        state.timers.dump = None;
        if !state.flags.contains(ZoneFlags::LOADED)
            || state.config.master_file.is_none()
        {
            return;
        }
        state.flags.insert(ZoneFlags::DUMPING);
        let zone = self.clone();
        let handle = tokio::spawn(async move {
            let res = zone.write_master_file().await;
            zone.finish_dump(&res);
        });
        state.tasks.dump = Some(handle.abort_handle());
    }

    /// Writes the current content to the master file.
    async fn write_master_file(self: &Arc<Self>) -> Result<(), ZoneError> {
        let _permit = self.shared.io.acquire(true).await;
        let (file, version, source_serial) = {
            let state = self.state.lock();
            let path = state
                .config
                .master_file
                .clone()
                .ok_or(ZoneError::NoMasterFile)?;
            let version = state.version().ok_or(ZoneError::NotLoaded)?;
            (
                MasterFile::new(path, state.config.master_format),
                version,
                state.source_serial,
            )
        };
        let res = tokio::task::spawn_blocking(move || {
            file.dump(&version, source_serial)?;
            file.modified()
        })
        .await
        .map_err(|_| ZoneError::Invariant("dump task failed"))?;
        let modified = res?;
        self.state.lock().file_modified = Some(modified);
        Ok(())
    }

    fn finish_dump(&self, res: &Result<(), ZoneError>) {
        let mut state = self.state.lock();
        state.flags.remove(ZoneFlags::DUMPING);
        state.tasks.dump = None;
        match res {
            Ok(()) => {
                debug!("Zone '{}': dumped", self.name);
                self.compact_journal(&mut state);
            }
            Err(err) => {
                error!("Zone '{}': dump failed: {err}", self.name);
                let delay = state.config.dump_delay;
                state.need_dump(delay);
            }
        }
        self.set_timer(&state);
    }
}

//------------ Signing -------------------------------------------------------

impl Zone {
    /// Creates a signer with the zone's current keys.
    pub(crate) fn signer(&self, config: &ZoneConfig) -> Result<Signer, ZoneError> {
        let keys = self.shared.services.keys.keys(&self.name)?;
        Ok(self.signer_with(config, keys))
    }

    fn signer_with(&self, config: &ZoneConfig, keys: Vec<ZoneKey>) -> Signer {
        Signer::new(
            self.name.clone(),
            self.class,
            keys,
            UnixTime::now(),
            config.sig_validity,
        )
        .with_check_ksk(config.update_check_ksk)
        .with_keyset_kskonly(config.dnskey_ksk_only)
        .with_serial_method(config.serial_update_method)
        .with_jitter(rand::thread_rng().gen())
    }

    fn start_signing(self: &Arc<Self>, state: &mut ZoneState, work: SignWork) {
        state.flags.insert(ZoneFlags::SIGNING);
        match work {
            SignWork::Rekey { .. } => state.timers.rekey = None,
            SignWork::Keys => state.timers.signing = None,
            SignWork::Chains => state.timers.nsec3chain = None,
            SignWork::Resign => state.timers.resign = None,
        }
        let zone = self.clone();
        let handle = tokio::spawn(async move {
            let res = {
                let _writer = zone.writer.lock().await;
                zone.sign_step(work)
            };
            zone.finish_signing(work, res);
        });
        state.tasks.signing = Some(handle.abort_handle());
    }

    fn finish_signing(&self, work: SignWork, res: Result<(), ZoneError>) {
        let mut state = self.state.lock();
        state.flags.remove(ZoneFlags::SIGNING);
        state.tasks.signing = None;
        if let Err(err) = res {
            error!("Zone '{}': {work} failed: {err}", self.name);
            let retry = Some(Instant::now() + SIGNING_RETRY);
            match work {
                SignWork::Rekey { .. } => state.timers.rekey = retry,
                SignWork::Keys if !state.signing.is_empty() => {
                    state.timers.signing = retry
                }
                SignWork::Chains if !state.chains.is_empty() => {
                    state.timers.nsec3chain = retry
                }
                SignWork::Resign => state.timers.resign = retry,
                _ => {}
            }
        }
        self.set_timer(&state);
    }

    /// Does one piece of signing work. Called with the writer lock held.
    fn sign_step(self: &Arc<Self>, work: SignWork) -> Result<(), ZoneError> {
        let (version, config) = {
            let state = self.state.lock();
            (
                state.version().ok_or(ZoneError::NotLoaded)?,
                state.config.clone(),
            )
        };
        let keys = self.shared.services.keys.keys(&self.name)?;
        let signer = self.signer_with(&config, keys.clone());
        let private_type = config.private_type();
        let nodes = config.sig_signing_nodes as usize;
        let signatures = config.sig_signing_signatures as usize;

        match work {
            SignWork::Rekey { full } => {
                let outcome =
                    rekey(&version, &signer, &keys, private_type, full)?;
                if let Some(diff) = outcome.diff.as_ref() {
                    self.commit(diff)?;
                }
                let mut state = self.state.lock();
                let now = Instant::now();
                for request in outcome.signing {
                    if !state.signing.iter().any(|known| known.same_as(&request)) {
                        state.signing.push_back(request);
                    }
                }
                if let Some(chain) = outcome.chain {
                    if !state.chains.iter().any(|known| known.same_chain(&chain)) {
                        state.chains.push_back(chain);
                    }
                }
                if !state.signing.is_empty() {
                    state.timers.signing = Some(now);
                }
                if !state.chains.is_empty() {
                    state.timers.nsec3chain = Some(now);
                }
                let next = outcome
                    .next_event
                    .map(instant_for)
                    .map_or(now + REKEY_INTERVAL, |next| {
                        next.min(now + REKEY_INTERVAL)
                    });
                state.timers.rekey = Some(next);
                state.timers.key_warn = outcome.key_warn.map(instant_for);
                info!("Zone '{}': reconfiguring zone keys", self.name);
            }
            SignWork::Keys => {
                let mut queue = core::mem::take(&mut self.state.lock().signing);
                let res = sign_quantum(
                    &version,
                    &signer,
                    &mut queue,
                    private_type,
                    nodes,
                    signatures,
                );
                let more = {
                    let mut state = self.state.lock();
                    let added = core::mem::replace(&mut state.signing, queue);
                    for request in added {
                        if !state.signing.iter().any(|known| known.same_as(&request)) {
                            state.signing.push_back(request);
                        }
                    }
                    !state.signing.is_empty()
                };
                if let Some(diff) = res? {
                    self.commit(&diff)?;
                }
                if more {
                    self.state.lock().timers.signing =
                        Some(Instant::now() + QUANTUM_DELAY);
                }
            }
            SignWork::Chains => {
                let mut queue = core::mem::take(&mut self.state.lock().chains);
                let res = chain_quantum(
                    &version,
                    &signer,
                    &mut queue,
                    private_type,
                    nodes,
                    signatures,
                );
                let more = {
                    let mut state = self.state.lock();
                    let added = core::mem::replace(&mut state.chains, queue);
                    for request in added {
                        if !state.chains.iter().any(|known| known == &request) {
                            state.chains.push_back(request);
                        }
                    }
                    !state.chains.is_empty()
                };
                let res = res.map_err(|err| {
                    if matches!(err, crate::sign::SignError::Nsec3Incompatible(_)) {
                        error!(
                            "Zone '{}': NSEC only DNSKEYs and NSEC3 chains \
                             not allowed",
                            self.name
                        );
                    }
                    err
                });
                if let Some(diff) = res? {
                    self.commit(&diff)?;
                }
                if more {
                    self.state.lock().timers.nsec3chain =
                        Some(Instant::now() + QUANTUM_DELAY);
                }
            }
            SignWork::Resign => {
                if let Some(diff) = resign_quantum(&version, &signer, signatures)? {
                    self.commit(&diff)?;
                }
            }
        }
        self.update_resign_timer();
        Ok(())
    }

    /// Sets the resign deadline from the signing-time index.
    pub(crate) fn update_resign_timer(&self) {
        let mut state = self.state.lock();
        state.timers.resign = state
            .version()
            .and_then(|version| next_resign(&version))
            .map(instant_for);
    }

    fn warn_keys(&self, state: &mut ZoneState) {
        state.timers.key_warn = None;
        match self.shared.services.keys.keys(&self.name) {
            Ok(keys) => {
                let now = UnixTime::now();
                for key in keys_without_successor(&keys, now) {
                    let inactive = key.timing.inactive.unwrap_or(now);
                    warn!(
                        "Zone '{}': key {} becomes inactive at {} \
                         with no replacement",
                        self.name, key, inactive
                    );
                }
            }
            Err(err) => {
                error!("Zone '{}': reading keys failed: {err}", self.name)
            }
        }
    }
}

//============ Testing =======================================================
