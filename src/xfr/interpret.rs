//! Making sense of transfer responses.
//!
//! Both AXFR and IXFR responses start and end with the SOA record of the
//! version being transferred. An AXFR has the complete content in between.
//! An IXFR has a sequence of differences instead, each consisting of the
//! old SOA record followed by the deleted records and the new SOA record
//! followed by the added records. A server that can't provide the
//! differences answers an IXFR like an AXFR. A server that has nothing
//! newer answers with just its SOA record.

use super::XfrError;
use crate::base::iana::{Class, Rcode, Rtype};
use crate::base::message::Message;
use crate::base::name::Name;
use crate::base::record::Record;
use crate::base::serial::Serial;
use crate::store::Diff;

//------------ XfrContent ----------------------------------------------------

/// What a transfer delivered.
#[derive(Clone, Debug)]
pub enum XfrContent {
    /// We already have the server's version.
    UpToDate,

    /// The complete content of the zone.
    Full(Vec<Record>),

    /// Differences to apply in order, each bumping the serial.
    Incremental(Vec<Diff>),
}

//------------ interpret -----------------------------------------------------

/// Turns the response messages of a transfer into zone content.
///
/// `current` is the serial of the version we have, if any.
pub fn interpret(
    origin: &Name,
    class: Class,
    rtype: Rtype,
    current: Option<Serial>,
    messages: &[Message],
) -> Result<XfrContent, XfrError> {
    let mut records = Vec::new();
    for msg in messages {
        if msg.rcode() != Rcode::NOERROR {
            return Err(XfrError::Rcode(msg.rcode()));
        }
        records.extend(msg.answer.iter().cloned());
    }
    if let Some(record) = records
        .iter()
        .find(|record| record.class != class || !record.owner.ends_with(origin))
    {
        if record.class != class {
            return Err(XfrError::Malformed("record of wrong class"));
        }
        return Err(XfrError::Malformed("record outside the zone"));
    }

    let first = records.first().ok_or(XfrError::NoSoa)?;
    let serial = soa_serial(first, origin).ok_or(XfrError::NoSoa)?;

    if records.len() == 1 {
        return match current {
            Some(current) if rtype == Rtype::IXFR && !serial.is_newer_than(current) => {
                Ok(XfrContent::UpToDate)
            }
            _ if rtype == Rtype::IXFR => {
                Err(XfrError::BadIxfr("single SOA with newer serial"))
            }
            _ => Err(XfrError::Malformed("transfer ended early")),
        };
    }

    let last = &records[records.len() - 1];
    if last.data != first.data {
        return Err(XfrError::Malformed("transfer ended early"));
    }

    let inner = &records[1..records.len() - 1];
    let is_ixfr = rtype == Rtype::IXFR
        && inner.first().map_or(false, |record| record.rtype() == Rtype::SOA);
    if !is_ixfr {
        if inner.iter().any(|record| record.rtype() == Rtype::SOA) {
            return Err(XfrError::Malformed("SOA record inside AXFR"));
        }
        let mut content = records;
        content.pop();
        return Ok(XfrContent::Full(content));
    }

    let current = current.ok_or(XfrError::BadIxfr("nothing to apply to"))?;
    let diffs = differences(inner, origin, current)?;
    match diffs.last().and_then(|(_, to)| *to) {
        Some(to) if to == serial => {}
        _ => return Err(XfrError::BadIxfr("differences end at wrong serial")),
    }
    Ok(XfrContent::Incremental(
        diffs.into_iter().map(|(diff, _)| diff).collect(),
    ))
}

/// Whether records are currently deleted or added.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Mode {
    Deleting,
    Adding,
}

/// Splits the inner records of an IXFR into differences.
///
/// Every difference has to start at the serial the previous one ended
/// at, the first one at `current`, and has to move the serial forward.
fn differences(
    records: &[Record],
    origin: &Name,
    current: Serial,
) -> Result<Vec<(Diff, Option<Serial>)>, XfrError> {
    let mut res: Vec<(Diff, Option<Serial>)> = Vec::new();
    let mut mode = Mode::Adding;
    let mut at = current;
    for record in records {
        if let Some(serial) = soa_serial(record, origin) {
            match mode {
                Mode::Adding => {
                    if serial != at {
                        return Err(XfrError::BadIxfr(
                            "difference starts at wrong serial",
                        ));
                    }
                    let mut diff = Diff::new();
                    diff.delete(record.clone());
                    res.push((diff, None));
                    mode = Mode::Deleting;
                }
                Mode::Deleting => {
                    if !serial.is_newer_than(at) {
                        return Err(XfrError::BadIxfr(
                            "difference doesn't increase serial",
                        ));
                    }
                    if let Some((diff, to)) = res.last_mut() {
                        diff.add(record.clone());
                        *to = Some(serial);
                    }
                    at = serial;
                    mode = Mode::Adding;
                }
            }
            continue;
        }
        if record.rtype() == Rtype::SOA {
            return Err(XfrError::Malformed("SOA record for other name"));
        }
        let Some((diff, _)) = res.last_mut() else {
            return Err(XfrError::Malformed("record before first SOA"));
        };
        match mode {
            Mode::Deleting => diff.delete(record.clone()),
            Mode::Adding => diff.add(record.clone()),
        }
    }
    if mode == Mode::Deleting {
        return Err(XfrError::BadIxfr("difference without new SOA"));
    }
    Ok(res)
}

/// Returns the serial if the record is the zone's SOA record.
fn soa_serial(record: &Record, origin: &Name) -> Option<Serial> {
    if &record.owner != origin {
        return None;
    }
    record.data.as_soa().map(|soa| soa.serial)
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::base::rdata::{Rdata, Soa};
    use crate::base::record::Ttl;
    use core::str::FromStr;
    use std::net::Ipv4Addr;

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    fn record(owner: &str, data: Rdata) -> Record {
        Record::new(name(owner), Class::IN, Ttl::from_secs(3600), data)
    }

    fn soa(serial: u32) -> Record {
        record(
            "example.",
            Rdata::Soa(Soa {
                mname: name("ns1.example."),
                rname: name("hostmaster.example."),
                serial: Serial(serial),
                refresh: Ttl::from_secs(3600),
                retry: Ttl::from_secs(600),
                expire: Ttl::from_secs(86400),
                minimum: Ttl::from_secs(300),
            }),
        )
    }

    fn a(owner: &str, last: u8) -> Record {
        record(owner, Rdata::A(Ipv4Addr::new(192, 0, 2, last)))
    }

    fn response(answer: Vec<Record>) -> Vec<Message> {
        vec![Message {
            answer,
            ..Default::default()
        }]
    }

    fn run(
        rtype: Rtype,
        current: Option<u32>,
        answer: Vec<Record>,
    ) -> Result<XfrContent, XfrError> {
        interpret(
            &name("example."),
            Class::IN,
            rtype,
            current.map(Serial),
            &response(answer),
        )
    }

    #[test]
    fn axfr() {
        let ns = record("example.", Rdata::Ns(name("ns1.example.")));
        let res =
            run(Rtype::AXFR, None, vec![soa(5), ns.clone(), a("ns1.example.", 1), soa(5)])
                .unwrap();
        let XfrContent::Full(records) = res else {
            panic!("not a full transfer");
        };
        assert_eq!(records, vec![soa(5), ns, a("ns1.example.", 1)]);
    }

    #[test]
    fn ixfr_answered_with_full_zone() {
        let res = run(Rtype::IXFR, Some(4), vec![soa(5), a("www.example.", 1), soa(5)])
            .unwrap();
        assert!(matches!(res, XfrContent::Full(records) if records.len() == 2));
    }

    #[test]
    fn ixfr_differences() {
        let res = run(
            Rtype::IXFR,
            Some(10),
            vec![
                soa(12),
                soa(10),
                a("old.example.", 1),
                soa(11),
                a("new.example.", 2),
                soa(11),
                soa(12),
                a("newer.example.", 3),
                soa(12),
            ],
        )
        .unwrap();
        let XfrContent::Incremental(diffs) = res else {
            panic!("not incremental");
        };
        assert_eq!(diffs.len(), 2);
        let (old, new) = diffs[0].soa_change();
        assert_eq!(old.map(|soa| soa.serial), Some(Serial(10)));
        assert_eq!(new.map(|soa| soa.serial), Some(Serial(11)));
        assert_eq!(diffs[0].len(), 4);
        assert_eq!(diffs[1].len(), 3);
    }

    #[test]
    fn single_soa_means_up_to_date() {
        assert!(matches!(
            run(Rtype::IXFR, Some(10), vec![soa(10)]),
            Ok(XfrContent::UpToDate)
        ));
        assert!(matches!(
            run(Rtype::IXFR, Some(10), vec![soa(11)]),
            Err(XfrError::BadIxfr(_))
        ));
        assert!(matches!(
            run(Rtype::AXFR, None, vec![soa(10)]),
            Err(XfrError::Malformed(_))
        ));
    }

    #[test]
    fn inconsistent_differences() {
        // Starts at a serial we don't have.
        assert!(matches!(
            run(
                Rtype::IXFR,
                Some(9),
                vec![soa(11), soa(10), soa(11), a("x.example.", 1), soa(11)]
            ),
            Err(XfrError::BadIxfr(_))
        ));
        // Goes backwards.
        assert!(matches!(
            run(
                Rtype::IXFR,
                Some(10),
                vec![soa(10), soa(10), soa(10), soa(10)]
            ),
            Err(XfrError::BadIxfr(_))
        ));
    }

    #[test]
    fn broken_responses() {
        assert!(matches!(
            run(Rtype::AXFR, None, vec![a("www.example.", 1), soa(1)]),
            Err(XfrError::NoSoa)
        ));
        assert!(matches!(
            run(Rtype::AXFR, None, vec![soa(1), a("www.example.", 1)]),
            Err(XfrError::Malformed(_))
        ));
        assert!(matches!(
            run(Rtype::AXFR, None, vec![soa(1), a("www.example.org.", 1), soa(1)]),
            Err(XfrError::Malformed(_))
        ));
        let mut refused = response(Vec::new());
        refused[0].header.rcode = Rcode::NOTAUTH;
        assert_eq!(
            interpret(&name("example."), Class::IN, Rtype::AXFR, None, &refused)
                .unwrap_err(),
            XfrError::Rcode(Rcode::NOTAUTH)
        );
    }
}
