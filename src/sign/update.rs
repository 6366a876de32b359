//! Keeping a signed zone consistent after its data changed.
//!
//! When records are added to or removed from a signed zone from the
//! outside, the signatures of the affected record sets and the denial of
//! existence records of the affected names need to follow.

use super::nsec3::{needs_nsec3, nsec3_hash, nsec3_of, nsec3_owner};
use super::{nsec, nsec3, Batch, SignError, Signer};
use crate::base::iana::Rtype;
use crate::base::name::Name;
use crate::base::rdata::{Nsec3, Nsec3param};
use crate::store::Diff;

/// Updates signatures and chains for a diff already applied to `batch`.
///
/// Returns the number of signatures created.
pub fn update_signatures(
    batch: &mut Batch,
    signer: &Signer,
    diff: &Diff,
) -> Result<usize, SignError> {
    let mut sets: Vec<(Name, Rtype)> = diff
        .tuples()
        .iter()
        .map(|t| (t.record.owner.clone(), t.record.rtype()))
        .filter(|(_, rtype)| {
            !matches!(*rtype, Rtype::RRSIG | Rtype::NSEC | Rtype::NSEC3)
        })
        .collect();
    sets.sort();
    sets.dedup();

    let mut count = 0;
    for (owner, rtype) in &sets {
        let version = batch.version();
        if version.find(owner, *rtype).is_some()
            && signer.can_sign()
            && Signer::is_signed_rrset(version, owner, *rtype)
        {
            count += batch.resign_rrset(signer, owner, *rtype)?;
        } else {
            count += batch.update_sigs(signer, owner, *rtype)?;
        }
    }

    let owners = diff.owners();
    if batch.version().has_nsec_chain() {
        for owner in &owners {
            count += update_nsec(batch, signer, owner)?;
        }
    }
    for param in batch.version().nsec3params() {
        let optout = chain_optout(batch, &param);
        for owner in &owners {
            count += update_nsec3(batch, signer, &param, optout, owner)?;
        }
    }
    Ok(count)
}

/// Fixes the NSEC chain around a changed name.
fn update_nsec(
    batch: &mut Batch,
    signer: &Signer,
    name: &Name,
) -> Result<usize, SignError> {
    let version = batch.version();
    let active = version
        .node(name)
        .map_or(false, |node| nsec::is_active(version, name, node));
    let mut count = 0;
    if active {
        count += nsec::update_name_signed(batch, signer, name)?;
    } else {
        nsec::remove_name(batch, name)?;
    }
    let version = batch.version();
    let pred = version
        .names_before(name)
        .find(|(pred, node)| nsec::is_active(version, pred, node))
        .map(|(pred, _)| pred.clone());
    if let Some(pred) = pred {
        count += nsec::update_name_signed(batch, signer, &pred)?;
    }
    Ok(count)
}

/// Fixes an NSEC3 chain for a changed name.
fn update_nsec3(
    batch: &mut Batch,
    signer: &Signer,
    param: &Nsec3param,
    optout: bool,
    name: &Name,
) -> Result<usize, SignError> {
    let version = batch.version();
    let wanted = version.node(name).map_or(false, |node| {
        !node.is_empty() && needs_nsec3(version, name, node, optout)
    });
    if wanted {
        return nsec3::add_name_signed(batch, signer, param, optout, name);
    }
    if version.has_children(name) {
        // Still an empty non-terminal.
        return Ok(0);
    }
    let origin = version.origin().clone();
    let mut count = nsec3::remove_name(batch, signer, param, name)?;
    for ancestor in name.ancestors_until(&origin) {
        let version = batch.version();
        if version.node(&ancestor).map_or(false, |node| !node.is_empty())
            || version.has_children(&ancestor)
        {
            break;
        }
        count += nsec3::remove_name(batch, signer, param, &ancestor)?;
    }
    Ok(count)
}

/// Returns whether the chain of the apex NSEC3 record uses opt-out.
fn chain_optout(batch: &Batch, param: &Nsec3param) -> bool {
    let version = batch.version();
    let origin = version.origin();
    nsec3_hash(origin, param)
        .and_then(|hash| nsec3_owner(origin, &hash))
        .ok()
        .and_then(|owner| {
            version
                .node(&owner)
                .and_then(|node| nsec3_of(node, param))
                .map(|nsec3| nsec3.flags & Nsec3::FLAG_OPT_OUT != 0)
        })
        .unwrap_or(false)
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::base::iana::Nsec3HashAlg;
    use crate::base::rdata::{Dnskey, Rdata};
    use crate::sign::chain::{chain_quantum, ChainRequest};
    use crate::sign::test_util::*;
    use crate::store::ZoneVersion;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;

    const PRIVATE: Rtype = Rtype::DEFAULT_PRIVATE;

    fn build(version: &ZoneVersion, signer: &Signer, request: ChainRequest) -> ZoneVersion {
        let mut version = version.clone();
        let mut requests = VecDeque::from([request]);
        while !requests.is_empty() {
            if let Some(diff) = chain_quantum(
                &version, signer, &mut requests, PRIVATE, 1000, 1000,
            )
            .unwrap()
            {
                version = version.apply(&diff).unwrap().0;
            }
        }
        version
    }

    fn change(
        version: &ZoneVersion,
        signer: &Signer,
        diff: Diff,
    ) -> ZoneVersion {
        let mut batch = Batch::new(version);
        batch.apply(diff.clone()).unwrap();
        update_signatures(&mut batch, signer, &diff).unwrap();
        let diff = batch.finish(signer).unwrap().unwrap();
        version.apply(&diff).unwrap().0
    }

    fn host(owner: &str, last: u8) -> Diff {
        let mut diff = Diff::new();
        diff.add(record(owner, Rdata::A(Ipv4Addr::new(192, 0, 2, last))));
        diff
    }

    #[test]
    fn added_name_joins_the_nsec_chain() {
        let key = ed_key(1, Dnskey::FLAG_ZONE);
        let signer = signer(vec![key.clone()]);
        let version = with_keys(&zone(1), &[key]);
        let version = build(&version, &signer, ChainRequest::nsec());
        let changed = change(&version, &signer, host("new.example.", 9));

        assert!(changed.find(&name("new.example."), Rtype::NSEC).is_some());
        assert!(changed
            .signatures(&name("new.example."), Rtype::A)
            .is_some());
        for (owner, node) in changed.names() {
            if !nsec::is_active(&changed, owner, node) {
                continue;
            }
            let rrset = changed.find(owner, Rtype::NSEC).unwrap();
            let Rdata::Nsec(ref nsec) = rrset.data[0] else {
                panic!("not an NSEC");
            };
            assert_eq!(nsec.next_name, nsec::next_active(&changed, owner));
        }
        assert!(changed
            .serial()
            .unwrap()
            .is_newer_than(version.serial().unwrap()));
    }

    #[test]
    fn removed_name_leaves_the_nsec3_chain() {
        let key = ed_key(1, Dnskey::FLAG_ZONE);
        let signer = signer(vec![key.clone()]);
        let param =
            Nsec3param::new(Nsec3HashAlg::SHA1, 0, 1, Bytes::from_static(b"\xab"));
        let version = with_keys(&zone(1), &[key]);
        let version = change(&version, &signer, host("gone.example.", 7));
        let version = build(&version, &signer, ChainRequest::add_nsec3(param.clone()));
        let hash = nsec3_hash(&name("gone.example."), &param).unwrap();
        let owner = nsec3_owner(&name("example."), &hash).unwrap();
        assert!(version.node(&owner).and_then(|node| nsec3_of(node, &param)).is_some());

        let mut diff = Diff::new();
        for record in version.find(&name("gone.example."), Rtype::A).unwrap().records() {
            diff.delete(record);
        }
        let version = change(&version, &signer, diff);
        assert!(version.node(&owner).and_then(|node| nsec3_of(node, &param)).is_none());

        // The chain is still closed.
        let chain: Vec<_> = version
            .names()
            .filter_map(|(_, node)| nsec3_of(node, &param))
            .cloned()
            .collect();
        assert!(!chain.is_empty());
        for nsec3 in &chain {
            assert!(chain.iter().any(|other| {
                nsec3_owner(&name("example."), &nsec3.next_owner)
                    .ok()
                    .and_then(|next| version.node(&next))
                    .and_then(|node| nsec3_of(node, &param))
                    == Some(other)
            }));
        }
    }
}
