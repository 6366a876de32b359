//! Differences between zone versions.

use crate::base::iana::Rtype;
use crate::base::name::Name;
use crate::base::rdata::Soa;
use crate::base::record::Record;
use crate::base::serial::Serial;
use core::fmt;

//------------ DiffOp --------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DiffOp {
    Add,
    Delete,
}

impl DiffOp {
    fn opposite(self) -> Self {
        match self {
            DiffOp::Add => DiffOp::Delete,
            DiffOp::Delete => DiffOp::Add,
        }
    }
}

impl fmt::Display for DiffOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DiffOp::Add => f.write_str("add"),
            DiffOp::Delete => f.write_str("del"),
        }
    }
}

//------------ DiffTuple -----------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiffTuple {
    pub op: DiffOp,
    pub record: Record,
}

impl fmt::Display for DiffTuple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.op, self.record)
    }
}

//------------ Diff ----------------------------------------------------------

/// A list of record additions and deletions.
///
/// Appending an operation that undoes an earlier one removes the earlier
/// one instead, so a diff never contains both the addition and deletion
/// of the same record.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Diff {
    tuples: Vec<DiffTuple>,

    /// Signature sets that are to keep their signatures until expiry.
    offline: Vec<(Name, Rtype)>,
}

impl Diff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty() && self.offline.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn tuples(&self) -> &[DiffTuple] {
        &self.tuples
    }

    pub fn offline(&self) -> &[(Name, Rtype)] {
        &self.offline
    }

    pub fn add(&mut self, record: Record) {
        self.append(DiffOp::Add, record)
    }

    pub fn delete(&mut self, record: Record) {
        self.append(DiffOp::Delete, record)
    }

    pub fn append(&mut self, op: DiffOp, record: Record) {
        let opposite = op.opposite();
        if let Some(pos) = self
            .tuples
            .iter()
            .position(|t| t.op == opposite && t.record == record)
        {
            self.tuples.remove(pos);
            return;
        }
        if self.tuples.iter().any(|t| t.op == op && t.record == record) {
            return;
        }
        self.tuples.push(DiffTuple { op, record });
    }

    /// Marks the signatures covering `rtype` at `owner` as offline.
    pub fn mark_offline(&mut self, owner: Name, rtype: Rtype) {
        if !self.offline.contains(&(owner.clone(), rtype)) {
            self.offline.push((owner, rtype));
        }
    }

    /// Appends all tuples of `other`.
    pub fn extend(&mut self, other: Diff) {
        for tuple in other.tuples {
            self.append(tuple.op, tuple.record);
        }
        for (owner, rtype) in other.offline {
            self.mark_offline(owner, rtype);
        }
    }

    /// Returns the deleted and added SOA records, if any.
    pub fn soa_change(&self) -> (Option<&Soa>, Option<&Soa>) {
        let find = |op| {
            self.tuples
                .iter()
                .filter(|t| t.op == op)
                .find_map(|t| t.record.data.as_soa())
        };
        (find(DiffOp::Delete), find(DiffOp::Add))
    }

    /// Returns whether the diff changes anything but the SOA record.
    pub fn has_content_change(&self) -> bool {
        self.tuples.iter().any(|t| t.record.rtype() != Rtype::SOA)
    }

    /// Returns whether the diff touches the given record set.
    pub fn touches(&self, owner: &Name, rtype: Rtype) -> bool {
        self.tuples
            .iter()
            .any(|t| &t.record.owner == owner && t.record.rtype() == rtype)
    }

    /// Returns the diff in the order used for IXFR and the journal.
    ///
    /// That is, all deletions first starting with the old SOA, then all
    /// additions starting with the new SOA.
    pub fn into_ixfr_order(self) -> Vec<DiffTuple> {
        let (mut deletes, mut adds): (Vec<_>, Vec<_>) =
            self.tuples.into_iter().partition(|t| t.op == DiffOp::Delete);
        let soa_first = |tuples: &mut Vec<DiffTuple>| {
            if let Some(pos) =
                tuples.iter().position(|t| t.record.rtype() == Rtype::SOA)
            {
                let soa = tuples.remove(pos);
                tuples.insert(0, soa);
            }
        };
        soa_first(&mut deletes);
        soa_first(&mut adds);
        deletes.extend(adds);
        deletes
    }

    /// Returns the names of the records touched, in canonical order.
    pub fn owners(&self) -> Vec<Name> {
        let mut res: Vec<_> =
            self.tuples.iter().map(|t| t.record.owner.clone()).collect();
        res.sort();
        res.dedup();
        res
    }
}

impl FromIterator<DiffTuple> for Diff {
    fn from_iter<T: IntoIterator<Item = DiffTuple>>(iter: T) -> Self {
        let mut res = Diff::new();
        for tuple in iter {
            res.append(tuple.op, tuple.record);
        }
        res
    }
}

//------------ Transaction ---------------------------------------------------

/// One committed change of a zone as recorded in its journal.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub from: Serial,
    pub to: Serial,

    /// The serial of the unsigned zone this change was derived from.
    ///
    /// Only set for the signed half of an inline-signing pair.
    pub source_serial: Option<Serial>,

    pub tuples: Vec<DiffTuple>,
}

impl Transaction {
    /// Creates a transaction from a diff that changes the SOA record.
    ///
    /// Returns `None` if the diff doesn't both delete and add an SOA.
    pub fn from_diff(diff: &Diff, source_serial: Option<Serial>) -> Option<Self> {
        let (old, new) = diff.soa_change();
        let (from, to) = (old?.serial, new?.serial);
        Some(Transaction {
            from,
            to,
            source_serial,
            tuples: diff.clone().into_ixfr_order(),
        })
    }

    pub fn to_diff(&self) -> Diff {
        self.tuples.iter().cloned().collect()
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::base::iana::Class;
    use crate::base::rdata::Rdata;
    use crate::base::record::Ttl;
    use core::str::FromStr;
    use std::net::Ipv4Addr;

    fn a(owner: &str, last: u8) -> Record {
        Record::new(
            Name::from_str(owner).unwrap(),
            Class::IN,
            Ttl::from_secs(300),
            Rdata::A(Ipv4Addr::new(192, 0, 2, last)),
        )
    }

    #[test]
    fn opposite_operations_cancel() {
        let mut diff = Diff::new();
        diff.add(a("a.example", 1));
        diff.delete(a("b.example", 2));
        diff.delete(a("a.example", 1));
        assert_eq!(diff.len(), 1);
        assert_eq!(diff.tuples()[0].op, DiffOp::Delete);
        diff.add(a("b.example", 2));
        assert!(diff.is_empty());
    }

    #[test]
    fn duplicates_are_dropped() {
        let mut diff = Diff::new();
        diff.add(a("a.example", 1));
        diff.add(a("a.example", 1));
        assert_eq!(diff.len(), 1);
    }
}
