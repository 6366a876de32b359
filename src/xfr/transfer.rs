//! Transferring zone content from a master.

use super::interpret::{interpret, XfrContent};
use super::refresh::Attempt;
use super::XfrError;
use crate::base::iana::{Rcode, Rtype};
use crate::base::message::Message;
use crate::base::record::Record;
use crate::base::serial::Serial;
use crate::config::XfrStrategy;
use crate::net::{TransportError, XfrRequest};
use crate::store::{Diff, Transaction, ZoneVersion};
use crate::zone::timers::{jitter, secs};
use crate::zone::{check_apex, SoaTimers, Zone, ZoneError, ZoneFlags};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

//------------ Zone: Transfer In ---------------------------------------------

impl Zone {
    /// Transfers the zone from the master of `attempt`.
    ///
    /// Waits for a slot in the manager's transfer quota first. An IXFR
    /// the master doesn't implement is retried once as an AXFR if the
    /// strategy allows it.
    pub(crate) async fn transfer_from(
        self: &Arc<Self>,
        attempt: &Attempt,
    ) -> Result<(), ZoneError> {
        let addr = attempt.master.addr;
        let (strategy, mut rtype, timeout, current) = {
            let state = self.state.lock();
            if state.flags.contains(ZoneFlags::EXITING) {
                return Err(ZoneError::Exiting);
            }
            let current = state.version().and_then(|v| v.soa_record());
            let strategy = state.config.xfr_strategy;
            let rtype = strategy.rtype(
                current.is_some(),
                state.flags.contains(ZoneFlags::FORCEXFER),
            );
            (
                strategy,
                rtype,
                secs(state.config.max_transfer_time_in),
                current,
            )
        };

        let permit = self.shared.xfrin.acquire(self, addr).await;
        if !permit.is_granted() {
            debug!("Zone '{}': queued transfer from {addr} canceled", self.name());
            return Err(ZoneError::Exiting);
        }
        debug!("Zone '{}': starting {rtype} from {addr}", self.name());

        let mut request = XfrRequest {
            server: addr,
            source: attempt.source,
            zone: self.name().clone(),
            class: self.class(),
            rtype,
            current,
            tsig_key: attempt.master.key.clone(),
            edns: attempt.edns,
            timeout,
        };
        let content = loop {
            let serial = request
                .current
                .as_ref()
                .and_then(|soa| soa.data.as_soa())
                .map(|soa| soa.serial);
            let messages = self.fetch(request.clone()).await?;
            match interpret(self.name(), self.class(), rtype, serial, &messages) {
                Err(XfrError::Rcode(Rcode::NOTIMP))
                    if rtype == Rtype::IXFR
                        && strategy == XfrStrategy::IxfrWithAxfrFallback =>
                {
                    info!(
                        "Zone '{}': {addr} doesn't do IXFR, trying AXFR",
                        self.name()
                    );
                    rtype = Rtype::AXFR;
                    request.rtype = rtype;
                }
                res => break res?,
            }
        };

        let _writer = self.writer.lock().await;
        let serial = match content {
            XfrContent::UpToDate => {
                info!("Zone '{}': {rtype} from {addr}: already up to date", self.name());
                None
            }
            XfrContent::Incremental(diffs) => Some(self.apply_ixfr(diffs)?),
            XfrContent::Full(records) => Some(self.replace_content(records)?),
        };
        self.restart_timers();
        if let Some(serial) = serial {
            info!(
                "Zone '{}': transferred serial {serial} from {addr} ({rtype})",
                self.name()
            );
        }
        Ok(())
    }

    async fn fetch(
        &self,
        request: XfrRequest,
    ) -> Result<Vec<Message>, XfrError> {
        let timeout = request.timeout;
        match tokio::time::timeout(
            timeout,
            self.shared.services.transport.transfer(request),
        )
        .await
        {
            Ok(res) => Ok(res?),
            Err(_) => Err(TransportError::Timeout.into()),
        }
    }

    /// Applies the differences of an IXFR one after the other.
    ///
    /// Each difference is checked on a copy before it is committed.
    fn apply_ixfr(
        self: &Arc<Self>,
        diffs: Vec<Diff>,
    ) -> Result<Serial, ZoneError> {
        let mut serial = None;
        for diff in diffs {
            let current = self.version().ok_or(ZoneError::NotLoaded)?;
            let (next, _) = current.apply(&diff)?;
            self.validate(&next)?;
            serial = self.commit(&diff)?.serial();
        }
        serial.ok_or(ZoneError::Xfr(XfrError::NoSoa))
    }

    /// Replaces the content with the result of an AXFR.
    ///
    /// With `ixfr-from-differences` the change is recorded in the journal.
    /// Otherwise the journal no longer matches and is cleared.
    pub(crate) fn replace_content(
        self: &Arc<Self>,
        records: Vec<Record>,
    ) -> Result<Serial, ZoneError> {
        let version =
            ZoneVersion::from_records(self.name().clone(), self.class(), records)?;
        self.validate(&version)?;
        let serial = version.serial().ok_or(XfrError::NoSoa)?;

        let (old, journal, from_differences, source_serial) = {
            let state = self.state.lock();
            (
                state.version(),
                state.journal.clone(),
                state.config.ixfr_from_differences,
                state.source_serial,
            )
        };
        let mut journal_cleared = false;
        if let Some(journal) = journal.as_ref() {
            match old.as_ref().filter(|_| from_differences) {
                Some(old) => {
                    let old_serial = old.serial().ok_or(XfrError::NoSoa)?;
                    if !serial.is_newer_than(old_serial) {
                        return Err(ZoneError::BadZone(format!(
                            "new serial {serial} is not newer than {old_serial}"
                        )));
                    }
                    let diff = old.diff_to(&version);
                    if let Some(txn) = Transaction::from_diff(&diff, source_serial) {
                        self.journal_write(journal.as_ref(), &txn)?;
                    }
                }
                None => {
                    journal.clear()?;
                    journal_cleared = true;
                }
            }
        }

        let mut state = self.state.lock();
        if state.flags.contains(ZoneFlags::EXITING) {
            return Err(ZoneError::Exiting);
        }
        let db = match state.db.clone() {
            Some(db) => db,
            None => self.new_db(&state)?,
        };
        db.replace(version)?;
        state.db = Some(db);
        state.flags.insert(ZoneFlags::LOADED);
        state.flags.remove(ZoneFlags::EXPIRED);
        let delay = if journal_cleared {
            0
        } else {
            state.config.dump_delay
        };
        state.need_dump(delay);
        state.need_notify();
        self.set_timer(&state);
        drop(state);
        self.content_changed();
        Ok(serial)
    }

    /// Checks transferred content before it becomes current.
    fn validate(&self, version: &ZoneVersion) -> Result<(), ZoneError> {
        check_apex(version, true)?;
        if let Some(check) = self.shared.services.record_check.as_ref() {
            check.check(version).map_err(ZoneError::BadZone)?;
        }
        Ok(())
    }

    /// Restarts the refresh timers after fetching content.
    pub(crate) fn restart_timers(&self) {
        let mut state = self.state.lock();
        if let Some(soa) = state
            .version()
            .and_then(|v| v.soa().map(|(soa, _)| soa.clone()))
        {
            state.soa_timers = SoaTimers::from_soa(&soa, &state.config);
            state.flags.insert(ZoneFlags::HAVETIMERS);
        }
        let now = Instant::now();
        state.timers.refresh = Some(now + jitter(state.soa_timers.refresh));
        state.timers.expire = Some(now + secs(state.soa_timers.expire));
        state.flags.remove(ZoneFlags::FORCEXFER | ZoneFlags::NOMASTERS);
        state.upstreams.mark_ok();
        self.set_timer(&state);
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::base::iana::Class;
    use crate::base::name::Name;
    use crate::config::{ManagerConfig, RemoteAddr, ZoneConfig, ZoneType};
    use crate::manager::{Services, ZoneManager};
    use crate::net::mock::MockTransport;
    use crate::net::Protocol;
    use core::str::FromStr;
    use std::net::SocketAddr;

    #[tokio::test(start_paused = true)]
    async fn canceled_queued_transfer_does_not_run() {
        let mock = MockTransport::new();
        let master: SocketAddr = "192.0.2.1:53".parse().unwrap();
        let config = ManagerConfig {
            transfers_in: 1,
            ..Default::default()
        };
        let manager =
            ZoneManager::new(config, Services::new(Arc::new(mock.clone())));
        let zone = manager
            .create_zone(
                Name::from_str("example.").unwrap(),
                Class::IN,
                ZoneConfig::new(ZoneType::Slave)
                    .with_masters(vec![RemoteAddr::new(master)]),
            )
            .unwrap();

        // Someone else holds the only transfer slot.
        let other = Arc::new(());
        let busy = zone.shared.xfrin.acquire(&other, master).await;
        assert!(busy.is_granted());

        let attempt = Attempt {
            master: RemoteAddr::new(master),
            source: None,
            edns: true,
            protocol: Protocol::Udp,
        };
        let task = {
            let zone = zone.zone().clone();
            tokio::spawn(async move { zone.transfer_from(&attempt).await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(zone.shared.xfrin.counts(), (1, 1));

        zone.shared.xfrin.cancel(zone.zone());
        let res = task.await.unwrap();
        assert!(matches!(res, Err(ZoneError::Exiting)));
        assert!(mock.transfers().is_empty());
        assert_eq!(zone.shared.xfrin.counts(), (1, 0));
        drop(busy);
        assert_eq!(zone.shared.xfrin.counts(), (0, 0));
    }
}
