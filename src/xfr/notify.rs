//! Sending NOTIFY messages.
//!
//! When the content of a zone changed, the servers that may have a copy
//! are told about it. These are the explicitly configured targets and,
//! unless only those should be notified, the name servers listed in the
//! zone's apex NS records. The primary master named in the SOA record is
//! left out unless asked for.
//!
//! Every target is handled by its own task. Notifies sent right after
//! startup go through their own, usually slower, rate limiter.

use crate::base::iana::{Rcode, Rtype};
use crate::base::message::Message;
use crate::base::name::Name;
use crate::base::rdata::Rdata;
use crate::base::record::Record;
use crate::config::{NotifyType, RemoteAddr, ZoneConfig, ZoneType};
use crate::net::{Request, TransportError, IANA_DNS_PORT_NUMBER};
use crate::store::ZoneVersion;
use crate::zone::maintenance::effective_type;
use crate::zone::{NotifyTarget, Zone, ZoneFlags, ZoneState};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

//------------ Zone: Outgoing Notify -----------------------------------------

impl Zone {
    /// Starts sending notifies for the current version.
    pub(crate) fn start_notify(self: &Arc<Self>, state: &mut ZoneState) {
        state.flags.remove(ZoneFlags::NEEDNOTIFY);
        state.timers.notify = None;
        state.last_notify = Some(Instant::now());
        let startup = state.flags.contains(ZoneFlags::STARTUPNOTIFY);
        state.flags.remove(ZoneFlags::STARTUPNOTIFY);

        let Some(version) = state.version() else {
            return;
        };
        let Some(soa) = version.soa_record() else {
            return;
        };
        let targets = notify_targets(&state.config, &version);
        let serial = version.serial().map(|s| s.to_string()).unwrap_or_default();
        let mut count = 0;
        for target in targets {
            if state.tasks.notifies.contains(&target) {
                continue;
            }
            let id = state.tasks.notifies.next_id();
            let zone = self.clone();
            let job = NotifyJob {
                target: target.clone(),
                soa: soa.clone(),
                version: version.clone(),
                source: state.config.notify_source,
                startup,
            };
            let handle = tokio::spawn(async move {
                zone.run_notify(job).await;
                zone.state.lock().tasks.notifies.remove(id);
            });
            state.tasks.notifies.insert(id, target, handle.abort_handle());
            count += 1;
        }
        if count > 0 {
            info!("Zone '{}': sending notifies (serial {serial})", self.name());
        }
    }

    async fn run_notify(&self, job: NotifyJob) {
        let addrs = match &job.target {
            NotifyTarget::Addr(remote) => vec![remote.clone()],
            NotifyTarget::Name(name) => self.resolve_target(name, &job.version).await,
        };
        if addrs.is_empty() {
            if let NotifyTarget::Name(name) = &job.target {
                info!("Zone '{}': no addresses for notify target {name}", self.name());
            }
            return;
        }
        for remote in addrs {
            if self.shared.services.is_self.is_self(&remote.addr) {
                debug!("Zone '{}': not notifying ourselves at {}", self.name(), remote.addr);
                continue;
            }
            if is_v4_mapped(&remote.addr) {
                continue;
            }
            self.send_notify(&remote, &job).await;
        }
    }

    /// Finds the addresses of a name server.
    ///
    /// Address records in the zone itself are used before asking the
    /// resolver.
    async fn resolve_target(&self, name: &Name, version: &ZoneVersion) -> Vec<RemoteAddr> {
        let mut ips: Vec<IpAddr> = [Rtype::A, Rtype::AAAA]
            .into_iter()
            .filter_map(|rtype| version.find(name, rtype))
            .flat_map(|rrset| rrset.records().collect::<Vec<_>>())
            .filter_map(|record| match record.data {
                Rdata::A(addr) => Some(IpAddr::V4(addr)),
                Rdata::Aaaa(addr) => Some(IpAddr::V6(addr)),
                _ => None,
            })
            .collect();
        if ips.is_empty() {
            ips = self.shared.services.resolver.resolve(name).await;
        }
        ips.into_iter()
            .map(|ip| RemoteAddr::new(SocketAddr::new(ip, IANA_DNS_PORT_NUMBER)))
            .collect()
    }

    async fn send_notify(&self, remote: &RemoteAddr, job: &NotifyJob) {
        let mut with_soa = true;
        loop {
            if job.startup {
                self.shared.limiters.startup_notify.acquire().await;
            } else {
                self.shared.limiters.notify.acquire().await;
            }
            let msg = Message::notify(
                self.name().clone(),
                self.class(),
                with_soa.then(|| job.soa.clone()),
            );
            let request = Request::new(remote.addr, msg)
                .with_source(job.source)
                .with_key(remote.key.clone());
            match self.query(request).await {
                Ok(answer) if answer.rcode() == Rcode::NOERROR => {
                    debug!("Zone '{}': notify to {} acknowledged", self.name(), remote.addr);
                    return;
                }
                Ok(answer) if answer.rcode() == Rcode::FORMERR && with_soa => {
                    debug!(
                        "Zone '{}': {} rejected notify with SOA, retrying without",
                        self.name(),
                        remote.addr
                    );
                    with_soa = false;
                }
                Ok(answer) => {
                    info!(
                        "Zone '{}': notify to {} answered {}",
                        self.name(),
                        remote.addr,
                        answer.rcode()
                    );
                    return;
                }
                Err(TransportError::Canceled) => return,
                Err(err) => {
                    warn!(
                        "Zone '{}': notify to {} failed: {err}",
                        self.name(),
                        remote.addr
                    );
                    return;
                }
            }
        }
    }
}

/// What a notify task needs to know.
struct NotifyJob {
    target: NotifyTarget,
    soa: Record,
    version: Arc<ZoneVersion>,
    source: Option<SocketAddr>,
    startup: bool,
}

/// Returns the targets to notify about a version.
pub(crate) fn notify_targets(
    config: &ZoneConfig,
    version: &ZoneVersion,
) -> Vec<NotifyTarget> {
    let mut res = Vec::new();
    match config.notify_type {
        NotifyType::No => return res,
        NotifyType::MasterOnly if effective_type(config) != ZoneType::Master => {
            return res
        }
        _ => {}
    }
    for remote in &config.also_notify {
        let target = NotifyTarget::Addr(remote.clone());
        if !res.contains(&target) {
            res.push(target);
        }
    }
    if config.notify_type == NotifyType::Explicit {
        return res;
    }
    let mname = version.soa().map(|(soa, _)| soa.mname.clone());
    if let Some(ns) = version.find(version.origin(), Rtype::NS) {
        for record in ns.records() {
            let Rdata::Ns(target) = record.data else {
                continue;
            };
            if !config.notify_to_soa && Some(&target) == mname.as_ref() {
                continue;
            }
            let target = NotifyTarget::Name(target);
            if !res.contains(&target) {
                res.push(target);
            }
        }
    }
    res
}

fn is_v4_mapped(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V6(ip) => ip.to_ipv4_mapped().is_some(),
        IpAddr::V4(_) => false,
    }
}

//============ Testing =======================================================
