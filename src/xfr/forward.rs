//! Forwarding dynamic updates to the masters of a slave zone.

use super::XfrError;
use crate::base::iana::Rcode;
use crate::base::message::Message;
use crate::net::{Protocol, Request};
use crate::zone::{Zone, ZoneError, ZoneFlags};
use std::sync::Arc;
use tracing::{debug, info, warn};

impl Zone {
    /// Forwards an UPDATE message to the masters.
    ///
    /// The masters are tried in order over TCP until one of them gives a
    /// definite answer, which is returned as is. Answers claiming the
    /// master isn't authoritative for the zone count as failures.
    pub async fn forward_update(
        self: &Arc<Self>,
        msg: Message,
    ) -> Result<Message, ZoneError> {
        let (masters, source) = {
            let state = self.state.lock();
            if state.flags.contains(ZoneFlags::EXITING) {
                return Err(ZoneError::Exiting);
            }
            if !state.config.is_slave_like() {
                return Err(ZoneError::WrongType(state.config.zone_type));
            }
            if !state.config.forward_updates {
                return Err(XfrError::Rcode(Rcode::REFUSED).into());
            }
            (state.config.masters.clone(), state.config.transfer_source)
        };

        let (tx, rx) = tokio::sync::oneshot::channel();
        {
            let mut state = self.state.lock();
            let id = state.tasks.forwards.next_id();
            let zone = self.clone();
            let handle = tokio::spawn(async move {
                let mut res = Err(XfrError::Exhausted);
                for master in masters {
                    let request = Request::new(master.addr, msg.clone())
                        .with_source(source)
                        .with_key(master.key.clone())
                        .with_protocol(Protocol::Tcp);
                    let answer = match zone.query(request).await {
                        Ok(answer) => answer,
                        Err(err) => {
                            info!(
                                "Zone '{}': forwarding update to {} failed: {err}",
                                zone.name(),
                                master.addr
                            );
                            continue;
                        }
                    };
                    match answer.rcode() {
                        Rcode::NOERROR
                        | Rcode::YXDOMAIN
                        | Rcode::YXRRSET
                        | Rcode::NXRRSET
                        | Rcode::REFUSED
                        | Rcode::NXDOMAIN => {
                            debug!(
                                "Zone '{}': forwarded update answered {} by {}",
                                zone.name(),
                                answer.rcode(),
                                master.addr
                            );
                            res = Ok(answer);
                            break;
                        }
                        Rcode::NOTZONE | Rcode::NOTAUTH => {
                            warn!(
                                "Zone '{}': master {} not authoritative, answered {}",
                                zone.name(),
                                master.addr,
                                answer.rcode()
                            );
                        }
                        rcode => {
                            info!(
                                "Zone '{}': forwarded update answered {rcode} by {}, trying next master",
                                zone.name(),
                                master.addr
                            );
                        }
                    }
                }
                zone.state.lock().tasks.forwards.remove(id);
                let _ = tx.send(res);
            });
            state.tasks.forwards.insert(id, (), handle.abort_handle());
        }
        match rx.await {
            Ok(res) => Ok(res?),
            Err(_) => Err(XfrError::Canceled.into()),
        }
    }
}
