//! NSEC chain maintenance.

use super::nsec3::{denial_ttl, is_nsec3_node};
use super::{Batch, SignError, Signer};
use crate::base::iana::Rtype;
use crate::base::name::Name;
use crate::base::rdata::{Nsec, Rdata, RtypeBitmap};
use crate::base::record::Record;
use crate::store::{Diff, Node, ZoneVersion};

/// Returns whether a name is part of the NSEC chain.
///
/// Every authoritative name with data is, including delegations. Glue,
/// empty non-terminals, and the owners of NSEC3 records are not.
pub fn is_active(version: &ZoneVersion, name: &Name, node: &Node) -> bool {
    !node.is_empty() && !is_nsec3_node(node) && !version.is_occluded(name)
}

/// Returns the name following `name` in the NSEC chain.
///
/// The last name points back to the apex.
pub fn next_active(version: &ZoneVersion, name: &Name) -> Name {
    version
        .names_after(Some(name))
        .find(|(next, node)| is_active(version, next, node))
        .map(|(next, _)| next.clone())
        .unwrap_or_else(|| version.origin().clone())
}

/// Returns the type bitmap of the NSEC record for a name.
pub fn nsec_types(node: &Node, signed: bool) -> RtypeBitmap {
    let mut res: RtypeBitmap = node
        .types()
        .filter(|rtype| !matches!(*rtype, Rtype::RRSIG | Rtype::NSEC3))
        .collect();
    res.insert(Rtype::NSEC);
    if signed {
        res.insert(Rtype::RRSIG);
    }
    res
}

/// Brings the NSEC record of a name up to date.
///
/// Returns whether the record changed. Signatures are not touched.
pub fn update_name(
    batch: &mut Batch,
    name: &Name,
    signed: bool,
) -> Result<bool, SignError> {
    let version = batch.version();
    let Some(node) = version.node(name) else {
        return Ok(false);
    };
    if !is_active(version, name, node) {
        return Ok(false);
    }
    let wanted = Nsec {
        next_name: next_active(version, name),
        types: nsec_types(node, signed),
    };
    let existing = version.find(name, Rtype::NSEC);
    if existing.map_or(false, |rrset| {
        rrset.data.len() == 1
            && rrset.data[0] == Rdata::Nsec(wanted.clone())
    }) {
        return Ok(false);
    }
    let class = version.class();
    let ttl = denial_ttl(version);
    let mut diff = Diff::new();
    if let Some(rrset) = existing {
        for record in rrset.records() {
            diff.delete(record);
        }
    }
    diff.add(Record::new(name.clone(), class, ttl, Rdata::Nsec(wanted)));
    batch.apply(diff)?;
    Ok(true)
}

/// Brings the NSEC record of a name up to date and re-signs it.
///
/// Returns the number of signatures created.
pub fn update_name_signed(
    batch: &mut Batch,
    signer: &Signer,
    name: &Name,
) -> Result<usize, SignError> {
    let signed = signer.can_sign();
    if update_name(batch, name, signed)? && signed {
        batch.resign_rrset(signer, name, Rtype::NSEC)
    } else {
        Ok(0)
    }
}

/// Removes the NSEC record of a name together with its signatures.
///
/// Returns whether there was anything to remove.
pub fn remove_name(batch: &mut Batch, name: &Name) -> Result<bool, SignError> {
    let version = batch.version();
    let mut diff = Diff::new();
    let sets = [
        version.find(name, Rtype::NSEC),
        version.signatures(name, Rtype::NSEC),
    ];
    for rrset in sets.into_iter().flatten() {
        rrset.records().for_each(|record| diff.delete(record));
    }
    if diff.is_empty() {
        return Ok(false);
    }
    batch.apply(diff)?;
    Ok(true)
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::sign::test_util::*;

    fn nsec_at(version: &ZoneVersion, owner: &str) -> Option<Nsec> {
        version
            .find(&name(owner), Rtype::NSEC)
            .and_then(|rrset| match rrset.data.first() {
                Some(Rdata::Nsec(nsec)) => Some(nsec.clone()),
                _ => None,
            })
    }

    #[test]
    fn chain_skips_glue_and_wraps() {
        let version = zone(1);
        let mut batch = Batch::new(&version);
        let names: Vec<Name> =
            version.names().map(|(name, _)| name.clone()).collect();
        for name in &names {
            update_name(&mut batch, name, false).unwrap();
        }
        let version = batch.version();
        assert_eq!(
            nsec_at(version, "example.").unwrap().next_name,
            name("a.b.c.example.")
        );
        // The delegation is in the chain, its glue is not.
        assert_eq!(
            nsec_at(version, "ns1.example.").unwrap().next_name,
            name("sub.example.")
        );
        assert_eq!(
            nsec_at(version, "sub.example.").unwrap().next_name,
            name("www.example.")
        );
        assert!(nsec_at(version, "ns.sub.example.").is_none());
        assert_eq!(
            nsec_at(version, "www.example.").unwrap().next_name,
            name("example.")
        );
        let types = nsec_at(version, "sub.example.").unwrap().types;
        assert!(types.contains(Rtype::NS));
        assert!(types.contains(Rtype::NSEC));
        assert!(!types.contains(Rtype::RRSIG));
    }

    #[test]
    fn updating_twice_changes_nothing() {
        let version = zone(1);
        let mut batch = Batch::new(&version);
        assert!(update_name(&mut batch, &name("www.example."), true).unwrap());
        assert!(!update_name(&mut batch, &name("www.example."), true).unwrap());
        assert!(remove_name(&mut batch, &name("www.example.")).unwrap());
        assert!(!remove_name(&mut batch, &name("www.example.")).unwrap());
    }
}
