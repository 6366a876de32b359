//! Fetching the delegation of a stub zone.
//!
//! A stub zone only keeps the SOA and NS records of the zone's apex plus
//! the addresses of those name servers that live inside the zone. The NS
//! set is queried from a master. Addresses missing from the additional
//! section of its answer are queried separately.

use super::refresh::Attempt;
use super::XfrError;
use crate::base::iana::{Rcode, Rtype};
use crate::base::message::Message;
use crate::base::name::Name;
use crate::base::rdata::Rdata;
use crate::base::record::Record;
use crate::net::Protocol;
use crate::zone::{Zone, ZoneError};
use std::sync::Arc;
use tracing::{debug, info};

impl Zone {
    /// Builds the stub content from the master of `attempt`.
    pub(crate) async fn fetch_stub(
        self: &Arc<Self>,
        attempt: &Attempt,
        soa: Record,
    ) -> Result<(), ZoneError> {
        let addr = attempt.master.addr;
        let answer = self.ask(attempt, self.name(), Rtype::NS).await?;
        let ns: Vec<_> = answer
            .answers(self.name(), Rtype::NS)
            .cloned()
            .collect();
        if ns.is_empty() {
            return Err(XfrError::Malformed("no NS records").into());
        }

        let mut records = vec![soa];
        for record in &ns {
            let Rdata::Ns(target) = &record.data else {
                continue;
            };
            if !target.ends_with(self.name()) {
                continue;
            }
            let mut glue = glue_for(&answer.additional, target);
            if glue.is_empty() {
                debug!(
                    "Zone '{}': stub: no glue for {target}, asking {addr}",
                    self.name()
                );
                for rtype in [Rtype::A, Rtype::AAAA] {
                    match self.ask(attempt, target, rtype).await {
                        Ok(msg) => glue.extend(msg.answers(target, rtype).cloned()),
                        Err(err) => debug!(
                            "Zone '{}': stub: {rtype} query for {target} failed: {err}",
                            self.name()
                        ),
                    }
                }
            }
            for record in glue {
                if !records.contains(&record) {
                    records.push(record);
                }
            }
        }
        records.extend(ns);

        let _writer = self.writer.lock().await;
        let serial = self.replace_content(records)?;
        self.restart_timers();
        info!("Zone '{}': stub serial {serial} from {addr}", self.name());
        Ok(())
    }

    /// Sends a query for the stub's data and checks the answer.
    async fn ask(
        &self,
        attempt: &Attempt,
        qname: &Name,
        qtype: Rtype,
    ) -> Result<Message, XfrError> {
        let mut protocol = attempt.protocol;
        loop {
            let request = attempt
                .request(Message::query(qname.clone(), qtype, self.class()))
                .with_protocol(protocol);
            let msg = self.query(request).await?;
            if msg.header.tc {
                if protocol == Protocol::Udp {
                    protocol = Protocol::Tcp;
                    continue;
                }
                return Err(XfrError::Malformed("truncated TCP answer"));
            }
            if msg.rcode() != Rcode::NOERROR {
                return Err(XfrError::Rcode(msg.rcode()));
            }
            if !msg.header.aa {
                return Err(XfrError::Malformed("non-authoritative answer"));
            }
            return Ok(msg);
        }
    }
}

/// Returns the address records for `target` in a section.
fn glue_for(section: &[Record], target: &Name) -> Vec<Record> {
    section
        .iter()
        .filter(|r| {
            &r.owner == target && matches!(r.rtype(), Rtype::A | Rtype::AAAA)
        })
        .cloned()
        .collect()
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::base::iana::Class;
    use crate::base::record::Ttl;
    use core::str::FromStr;
    use std::net::Ipv4Addr;

    #[test]
    fn glue_only_for_target() {
        let target = Name::from_str("ns1.example.").unwrap();
        let a = |owner: &str| {
            Record::new(
                Name::from_str(owner).unwrap(),
                Class::IN,
                Ttl::from_secs(60),
                Rdata::A(Ipv4Addr::new(192, 0, 2, 1)),
            )
        };
        let section = vec![a("ns1.example."), a("ns2.example.")];
        assert_eq!(glue_for(&section, &target), vec![a("ns1.example.")]);
    }
}
