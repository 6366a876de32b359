//! Immutable snapshots of zone content.

use super::diff::{Diff, DiffOp};
use super::DbError;
use crate::base::iana::{Class, Rtype};
use crate::base::name::Name;
use crate::base::rdata::{Nsec3param, Rdata, Soa};
use crate::base::record::{Record, Rrset, RrsetKey, Ttl};
use crate::base::serial::Serial;
use crate::base::time::UnixTime;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_VERSION_ID: AtomicU64 = AtomicU64::new(1);

//------------ Node ----------------------------------------------------------

/// All record sets at one owner name.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Node {
    rrsets: BTreeMap<RrsetKey, Rrset>,
}

impl Node {
    pub fn is_empty(&self) -> bool {
        self.rrsets.is_empty()
    }

    pub fn get(&self, key: RrsetKey) -> Option<&Rrset> {
        self.rrsets.get(&key)
    }

    pub fn has(&self, rtype: Rtype) -> bool {
        self.rrsets.contains_key(&RrsetKey::plain(rtype))
    }

    pub fn rrsets(&self) -> impl Iterator<Item = &Rrset> {
        self.rrsets.values()
    }

    /// Returns the types present, not counting signatures.
    pub fn types(&self) -> impl Iterator<Item = Rtype> + '_ {
        self.rrsets
            .keys()
            .filter(|k| k.covers.is_none())
            .map(|k| k.rtype)
    }

    /// Returns the types covered by signatures present.
    pub fn signed_types(&self) -> impl Iterator<Item = Rtype> + '_ {
        self.rrsets.keys().filter_map(|k| k.covers)
    }
}

//------------ ZoneVersion ---------------------------------------------------

/// One version of the content of a zone.
///
/// Versions are immutable once they have been published by a database.
/// A new version is created by cloning the current one and applying a
/// [`Diff`]. Nodes are shared between versions until they are changed.
///
/// Besides the records, a version maintains the signing-time index: for
/// every signed record set the time at which its signatures are due for
/// renewal. This is the resign interval before the earliest expiration
/// or, for signatures marked offline, the expiration itself.
#[derive(Clone, Debug)]
pub struct ZoneVersion {
    id: u64,
    origin: Name,
    class: Class,
    nodes: BTreeMap<Name, Arc<Node>>,
    resign_interval: u32,
    resign_index: BTreeSet<(UnixTime, Name, Rtype)>,
    resign_times: HashMap<(Name, Rtype), UnixTime>,
    offline: HashSet<(Name, Rtype)>,
}

impl ZoneVersion {
    /// Creates a new, empty version.
    pub fn new(origin: Name, class: Class) -> Self {
        ZoneVersion {
            id: NEXT_VERSION_ID.fetch_add(1, Ordering::Relaxed),
            origin,
            class,
            nodes: BTreeMap::new(),
            resign_interval: 0,
            resign_index: BTreeSet::new(),
            resign_times: HashMap::new(),
            offline: HashSet::new(),
        }
    }

    /// Creates a version from a sequence of records.
    ///
    /// Records outside the zone or of the wrong class are rejected as are
    /// exact duplicates.
    pub fn from_records(
        origin: Name,
        class: Class,
        records: impl IntoIterator<Item = Record>,
    ) -> Result<Self, DbError> {
        let mut res = ZoneVersion::new(origin, class);
        for record in records {
            if !res.add_record(record.clone())? {
                return Err(DbError::Duplicate(record));
            }
        }
        Ok(res)
    }

    /// Returns a unique identifier of this version.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn origin(&self) -> &Name {
        &self.origin
    }

    pub fn class(&self) -> Class {
        self.class
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn set_resign_interval(&mut self, interval: u32) {
        if interval != self.resign_interval {
            self.resign_interval = interval;
            let keys: Vec<_> = self.resign_times.keys().cloned().collect();
            for (owner, rtype) in keys {
                self.update_resign(&owner, rtype);
            }
        }
    }

    pub fn resign_interval(&self) -> u32 {
        self.resign_interval
    }

    //--- Lookups

    pub fn node(&self, name: &Name) -> Option<&Node> {
        self.nodes.get(name).map(AsRef::as_ref)
    }

    pub fn rrset(&self, name: &Name, key: RrsetKey) -> Option<&Rrset> {
        self.node(name).and_then(|node| node.get(key))
    }

    pub fn find(&self, name: &Name, rtype: Rtype) -> Option<&Rrset> {
        self.rrset(name, RrsetKey::plain(rtype))
    }

    pub fn signatures(&self, name: &Name, covers: Rtype) -> Option<&Rrset> {
        self.rrset(name, RrsetKey::sigs(covers))
    }

    /// Returns the SOA record data and its TTL.
    pub fn soa(&self) -> Option<(&Soa, Ttl)> {
        let rrset = self.find(&self.origin, Rtype::SOA)?;
        rrset
            .data
            .first()
            .and_then(Rdata::as_soa)
            .map(|soa| (soa, rrset.ttl))
    }

    pub fn soa_record(&self) -> Option<Record> {
        let rrset = self.find(&self.origin, Rtype::SOA)?;
        rrset.records().next()
    }

    pub fn serial(&self) -> Option<Serial> {
        self.soa().map(|(soa, _)| soa.serial)
    }

    /// Counts the SOA and apex NS records.
    pub fn apex_counts(&self) -> (usize, usize) {
        let count = |rtype| self.find(&self.origin, rtype).map_or(0, Rrset::len);
        (count(Rtype::SOA), count(Rtype::NS))
    }

    /// Returns the NSEC3 parameters published at the apex.
    pub fn nsec3params(&self) -> Vec<Nsec3param> {
        self.find(&self.origin, Rtype::NSEC3PARAM)
            .map(|rrset| {
                rrset
                    .data
                    .iter()
                    .filter_map(|data| match data {
                        Rdata::Nsec3param(param) => Some(param.clone()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns whether the zone has an NSEC chain.
    pub fn has_nsec_chain(&self) -> bool {
        self.find(&self.origin, Rtype::NSEC).is_some()
    }

    /// Returns whether the zone is signed.
    ///
    /// That is the case if there are keys at the apex and one form of
    /// authenticated denial of existence is in place.
    pub fn is_secure(&self) -> bool {
        self.find(&self.origin, Rtype::DNSKEY).is_some()
            && (self.has_nsec_chain() || !self.nsec3params().is_empty())
    }

    /// Returns whether `name` is a delegation point.
    pub fn is_delegation(&self, name: &Name) -> bool {
        name != &self.origin
            && self.node(name).map_or(false, |node| node.has(Rtype::NS))
    }

    /// Returns whether `name` is below a delegation or DNAME.
    ///
    /// Data at such names is not authoritative. It is neither signed nor
    /// covered by the denial of existence chains.
    pub fn is_occluded(&self, name: &Name) -> bool {
        name.ancestors_until(&self.origin).iter().any(|ancestor| {
            self.node(ancestor).map_or(false, |node| {
                node.has(Rtype::NS) || node.has(Rtype::DNAME)
            })
        }) || (name.is_below(&self.origin)
            && self
                .node(&self.origin)
                .map_or(false, |node| node.has(Rtype::DNAME)))
    }

    /// Returns whether `name` has children but no data.
    pub fn is_empty_non_terminal(&self, name: &Name) -> bool {
        self.node(name).is_none() && self.has_children(name)
    }

    /// Returns whether there are names below `name`.
    pub fn has_children(&self, name: &Name) -> bool {
        self.nodes
            .range((Bound::Excluded(name.clone()), Bound::Unbounded))
            .next()
            .map_or(false, |(next, _)| next.is_below(name))
    }

    //--- Iteration

    /// Iterates over all names in canonical order.
    pub fn names(&self) -> impl Iterator<Item = (&Name, &Node)> {
        self.nodes.iter().map(|(name, node)| (name, node.as_ref()))
    }

    /// Iterates over the names following `cursor`.
    ///
    /// With no cursor iteration starts at the beginning. Since the cursor
    /// is a name rather than a position, iteration can be resumed on a
    /// later version.
    pub fn names_after<'a>(
        &'a self,
        cursor: Option<&Name>,
    ) -> impl Iterator<Item = (&'a Name, &'a Node)> + 'a {
        let lower = match cursor {
            Some(name) => Bound::Excluded(name.clone()),
            None => Bound::Unbounded,
        };
        self.nodes
            .range((lower, Bound::Unbounded))
            .map(|(name, node)| (name, node.as_ref()))
    }

    /// Iterates over the names preceding `name` backwards.
    pub fn names_before<'a>(
        &'a self,
        name: &Name,
    ) -> impl Iterator<Item = (&'a Name, &'a Node)> + 'a {
        self.nodes
            .range((Bound::Unbounded, Bound::Excluded(name.clone())))
            .rev()
            .map(|(name, node)| (name, node.as_ref()))
    }

    /// Iterates over all records.
    pub fn records(&self) -> impl Iterator<Item = Record> + '_ {
        self.nodes
            .values()
            .flat_map(|node| node.rrsets.values())
            .flat_map(Rrset::records)
    }

    pub fn record_count(&self) -> usize {
        self.nodes
            .values()
            .flat_map(|node| node.rrsets.values())
            .map(Rrset::len)
            .sum()
    }

    //--- Signing-time index

    /// Returns the record set whose signatures are due first.
    pub fn next_resign(&self) -> Option<(UnixTime, &Name, Rtype)> {
        self.resign_index
            .iter()
            .next()
            .map(|(when, name, rtype)| (*when, name, *rtype))
    }

    /// Iterates over the signing-time index, earliest first.
    pub fn resign_entries(
        &self,
    ) -> impl Iterator<Item = (UnixTime, &Name, Rtype)> {
        self.resign_index
            .iter()
            .map(|(when, name, rtype)| (*when, name, *rtype))
    }

    /// Returns whether the signatures over a record set are offline.
    pub fn is_offline(&self, name: &Name, covers: Rtype) -> bool {
        self.offline.contains(&(name.clone(), covers))
    }

    fn update_resign(&mut self, owner: &Name, covers: Rtype) {
        let key = (owner.clone(), covers);
        if let Some(old) = self.resign_times.remove(&key) {
            self.resign_index.remove(&(old, owner.clone(), covers));
        }
        let offline = self.offline.contains(&key);
        let expiration = self
            .signatures(owner, covers)
            .into_iter()
            .flat_map(|rrset| rrset.data.iter())
            .filter_map(Rdata::as_rrsig)
            .map(|sig| sig.expiration.into_int())
            .min();
        match expiration {
            Some(expiration) => {
                let when = if offline {
                    expiration
                } else {
                    expiration.saturating_sub(self.resign_interval)
                };
                let when = UnixTime::from_secs(when);
                self.resign_index.insert((when, owner.clone(), covers));
                self.resign_times.insert(key, when);
            }
            None => {
                self.offline.remove(&key);
            }
        }
    }

    //--- Modification

    /// Adds a record, returning whether it wasn't present yet.
    fn add_record(&mut self, record: Record) -> Result<bool, DbError> {
        self.check_record(&record)?;
        let key = record.rrset_key();
        let owner = record.owner.clone();
        let node = Arc::make_mut(self.nodes.entry(owner.clone()).or_default());
        let rrset = node.rrsets.entry(key).or_insert_with(|| {
            Rrset::new(owner.clone(), record.class, key, record.ttl)
        });
        // The most recently added record determines the TTL of the set.
        rrset.ttl = record.ttl;
        let added = rrset.insert(record.data);
        if let Some(covers) = key.covers {
            self.update_resign(&owner, covers);
        }
        Ok(added)
    }

    /// Deletes a record, returning whether it was present.
    fn delete_record(&mut self, record: &Record) -> bool {
        let key = record.rrset_key();
        let Some(node) = self.nodes.get_mut(&record.owner) else {
            return false;
        };
        let node = Arc::make_mut(node);
        let removed = match node.rrsets.get_mut(&key) {
            Some(rrset) => {
                let removed = rrset.remove(&record.data);
                if rrset.is_empty() {
                    node.rrsets.remove(&key);
                }
                removed
            }
            None => false,
        };
        if node.is_empty() {
            self.nodes.remove(&record.owner);
        }
        if let Some(covers) = key.covers {
            self.update_resign(&record.owner, covers);
        }
        removed
    }

    fn check_record(&self, record: &Record) -> Result<(), DbError> {
        if !record.owner.ends_with(&self.origin) {
            return Err(DbError::OutOfZone(record.owner.clone()));
        }
        if record.class != self.class {
            return Err(DbError::WrongClass(record.class));
        }
        if record.rtype().is_meta() {
            return Err(DbError::MetaType(record.rtype()));
        }
        Ok(())
    }

    /// Creates a new version by applying a diff.
    ///
    /// Deleting records that don't exist and adding records that do
    /// exist already are not errors. The number of such operations is
    /// returned alongside the new version.
    pub fn apply(&self, diff: &Diff) -> Result<(ZoneVersion, usize), DbError> {
        let mut res = self.fork();
        let no_effect = res.update(diff)?;
        Ok((res, no_effect))
    }

    /// Applies a diff to this version in place.
    ///
    /// This is meant for working copies that haven't been published. If
    /// an error is returned, the version is left partially updated.
    pub fn update(&mut self, diff: &Diff) -> Result<usize, DbError> {
        let mut no_effect = 0;
        for tuple in diff.tuples() {
            let changed = match tuple.op {
                DiffOp::Add => self.add_record(tuple.record.clone())?,
                DiffOp::Delete => {
                    self.check_record(&tuple.record)?;
                    self.delete_record(&tuple.record)
                }
            };
            if !changed {
                no_effect += 1;
            }
        }
        for (owner, covers) in diff.offline() {
            if self.signatures(owner, *covers).is_some() {
                self.offline.insert((owner.clone(), *covers));
                self.update_resign(owner, *covers);
            }
        }
        Ok(no_effect)
    }

    /// Returns the diff that turns `self` into `other`.
    pub fn diff_to(&self, other: &ZoneVersion) -> Diff {
        let mut res = Diff::new();
        let mine: HashSet<Record> = self.records().collect();
        let theirs: HashSet<Record> = other.records().collect();
        let mut deleted: Vec<_> = mine.difference(&theirs).cloned().collect();
        let mut added: Vec<_> = theirs.difference(&mine).cloned().collect();
        deleted.sort_by(|l, r| l.owner.cmp(&r.owner));
        added.sort_by(|l, r| l.owner.cmp(&r.owner));
        for record in deleted {
            res.delete(record);
        }
        for record in added {
            res.add(record);
        }
        res
    }

    /// Returns a fresh copy of this version with a new identifier.
    pub fn fork(&self) -> ZoneVersion {
        let mut res = self.clone();
        res.id = NEXT_VERSION_ID.fetch_add(1, Ordering::Relaxed);
        res
    }
}

impl PartialEq for ZoneVersion {
    /// Versions are equal if they have the same content.
    fn eq(&self, other: &Self) -> bool {
        self.origin == other.origin
            && self.class == other.class
            && self.nodes == other.nodes
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::base::rdata::Rrsig;
    use crate::base::iana::SecAlg;
    use bytes::Bytes;
    use core::str::FromStr;
    use std::net::Ipv4Addr;

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    fn rec(owner: &str, data: Rdata) -> Record {
        Record::new(name(owner), Class::IN, Ttl::from_secs(300), data)
    }

    fn sig(owner: &str, covers: Rtype, expiration: u32) -> Record {
        rec(
            owner,
            Rdata::Rrsig(Rrsig {
                type_covered: covers,
                algorithm: SecAlg::ED25519,
                labels: 2,
                original_ttl: Ttl::from_secs(300),
                expiration: Serial(expiration),
                inception: Serial(0),
                key_tag: 1,
                signer_name: name("example"),
                signature: Bytes::from_static(b"sig"),
            }),
        )
    }

    fn version() -> ZoneVersion {
        ZoneVersion::from_records(
            name("example"),
            Class::IN,
            [
                rec("example", Rdata::Ns(name("ns.example"))),
                rec("ns.example", Rdata::A(Ipv4Addr::new(192, 0, 2, 1))),
                rec("sub.example", Rdata::Ns(name("ns.sub.example"))),
                rec("ns.sub.example", Rdata::A(Ipv4Addr::new(192, 0, 2, 2))),
                rec("a.b.example", Rdata::A(Ipv4Addr::new(192, 0, 2, 3))),
            ],
        )
        .unwrap()
    }

    #[test]
    fn rejects_bad_records() {
        let v = ZoneVersion::new(name("example"), Class::IN);
        let mut diff = Diff::new();
        diff.add(rec("example.org", Rdata::Ns(name("ns.example"))));
        assert!(matches!(v.apply(&diff), Err(DbError::OutOfZone(_))));
        let dup = rec("example", Rdata::Ns(name("ns.example")));
        assert!(matches!(
            ZoneVersion::from_records(name("example"), Class::IN, [dup.clone(), dup]),
            Err(DbError::Duplicate(_))
        ));
    }

    #[test]
    fn structure() {
        let v = version();
        assert!(v.is_delegation(&name("sub.example")));
        assert!(!v.is_delegation(&name("example")));
        assert!(v.is_occluded(&name("ns.sub.example")));
        assert!(!v.is_occluded(&name("sub.example")));
        assert!(v.is_empty_non_terminal(&name("b.example")));
        assert!(!v.is_empty_non_terminal(&name("a.b.example")));
        assert_eq!(v.apex_counts(), (0, 1));
    }

    #[test]
    fn resumable_iteration() {
        let v = version();
        let all: Vec<_> = v.names().map(|(n, _)| n.clone()).collect();
        let rest: Vec<_> = v
            .names_after(Some(&all[1]))
            .map(|(n, _)| n.clone())
            .collect();
        assert_eq!(rest, all[2..].to_vec());
        // A cursor that no longer exists still works.
        let mut diff = Diff::new();
        diff.delete(rec("a.b.example", Rdata::A(Ipv4Addr::new(192, 0, 2, 3))));
        let (newer, _) = v.apply(&diff).unwrap();
        let rest: Vec<_> = newer
            .names_after(Some(&name("a.b.example")))
            .map(|(n, _)| n.clone())
            .collect();
        assert_eq!(rest, vec![name("ns.example"), name("sub.example"), name("ns.sub.example")]);
    }

    #[test]
    fn signing_time_index() {
        let mut v = version();
        v.set_resign_interval(100);
        let mut diff = Diff::new();
        diff.add(sig("ns.example", Rtype::A, 1000));
        diff.add(sig("ns.example", Rtype::A, 900));
        diff.add(sig("example", Rtype::NS, 2000));
        let (v, _) = v.apply(&diff).unwrap();
        assert_eq!(
            v.next_resign(),
            Some((UnixTime::from_secs(800), &name("ns.example"), Rtype::A))
        );
        let mut diff = Diff::new();
        diff.mark_offline(name("ns.example"), Rtype::A);
        let (v, _) = v.apply(&diff).unwrap();
        assert_eq!(v.next_resign().unwrap().0, UnixTime::from_secs(900));
        let mut diff = Diff::new();
        diff.delete(sig("ns.example", Rtype::A, 1000));
        diff.delete(sig("ns.example", Rtype::A, 900));
        let (v, _) = v.apply(&diff).unwrap();
        assert_eq!(
            v.next_resign(),
            Some((UnixTime::from_secs(1900), &name("example"), Rtype::NS))
        );
        assert!(!v.is_offline(&name("ns.example"), Rtype::A));
    }

    #[test]
    fn diff_between_versions() {
        let old = version();
        let mut diff = Diff::new();
        diff.delete(rec("ns.example", Rdata::A(Ipv4Addr::new(192, 0, 2, 1))));
        diff.add(rec("ns.example", Rdata::A(Ipv4Addr::new(192, 0, 2, 9))));
        let (new, no_effect) = old.apply(&diff).unwrap();
        assert_eq!(no_effect, 0);
        let computed = old.diff_to(&new);
        assert_eq!(computed.len(), 2);
        let (again, _) = old.apply(&computed).unwrap();
        assert!(again == new);
        assert!(old != new);
    }
}
