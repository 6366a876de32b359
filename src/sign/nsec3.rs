//! NSEC3 hashing and incremental chain maintenance.
//!
//! NSEC3 records live at hashed owner names directly below the apex. The
//! chain is kept in hash order which, because all owner labels have the
//! same length and base32hex preserves order, is the canonical order of
//! the owner names. Inserting a name thus only needs the record of the
//! predecessor in canonical order.

use super::{Batch, SignError, Signer};
use crate::base::iana::{Nsec3HashAlg, Rtype, SecAlg};
use crate::base::name::Name;
use crate::base::rdata::{nsec3_label, Nsec3, Nsec3param, Rdata, RtypeBitmap};
use crate::base::record::{Record, RrsetKey, Ttl};
use crate::store::{Diff, Node, ZoneVersion};
use ring::digest;

/// The largest number of extra iterations accepted.
pub const MAX_ITERATIONS: u16 = 2500;

//------------ Hashing -------------------------------------------------------

/// Calculates the NSEC3 hash of a name.
pub fn nsec3_hash(
    owner: &Name,
    param: &Nsec3param,
) -> Result<Vec<u8>, SignError> {
    check_params(param)?;
    let mut wire = Vec::with_capacity(owner.wire_len() + param.salt.len());
    owner.compose(&mut wire);
    wire.extend_from_slice(&param.salt);
    let mut hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &wire);
    for _ in 0..param.iterations {
        let mut ctx = digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
        ctx.update(hash.as_ref());
        ctx.update(&param.salt);
        hash = ctx.finish();
    }
    Ok(hash.as_ref().to_vec())
}

/// Returns the owner name of the NSEC3 record for a hash.
pub fn nsec3_owner(origin: &Name, hash: &[u8]) -> Result<Name, SignError> {
    origin
        .prepend(&nsec3_label(hash))
        .map_err(|_| SignError::BadNsec3Params)
}

/// Checks that NSEC3 parameters can be used for a chain.
pub fn check_params(param: &Nsec3param) -> Result<(), SignError> {
    if param.hash_algorithm != Nsec3HashAlg::SHA1
        || param.iterations > MAX_ITERATIONS
    {
        return Err(SignError::BadNsec3Params);
    }
    Ok(())
}

/// Checks that all keys in the zone may be used with NSEC3.
pub fn check_algorithms(
    algorithms: impl IntoIterator<Item = SecAlg>,
) -> Result<(), SignError> {
    match algorithms.into_iter().find(|alg| !alg.supports_nsec3()) {
        Some(alg) => Err(SignError::Nsec3Incompatible(alg)),
        None => Ok(()),
    }
}

/// Returns the algorithms of the keys published in a zone.
pub fn zone_algorithms(version: &ZoneVersion) -> Vec<SecAlg> {
    version
        .find(version.origin(), Rtype::DNSKEY)
        .into_iter()
        .flat_map(|rrset| rrset.data.iter())
        .filter_map(Rdata::as_dnskey)
        .map(|key| key.algorithm)
        .collect()
}

//------------ Chain membership ----------------------------------------------

/// Returns whether a node only holds NSEC3 records.
pub fn is_nsec3_node(node: &Node) -> bool {
    node.types().all(|rtype| rtype == Rtype::NSEC3)
}

/// Returns the NSEC3 record of a chain at a node, if any.
pub fn nsec3_of<'a>(node: &'a Node, param: &Nsec3param) -> Option<&'a Nsec3> {
    node.get(RrsetKey::plain(Rtype::NSEC3))?
        .data
        .iter()
        .find_map(|data| match data {
            Rdata::Nsec3(nsec3) if nsec3.matches(param) => Some(nsec3),
            _ => None,
        })
}

/// Returns whether a name needs an NSEC3 record in a chain.
///
/// With opt-out, insecure delegations are left out.
pub fn needs_nsec3(
    version: &ZoneVersion,
    name: &Name,
    node: &Node,
    optout: bool,
) -> bool {
    if is_nsec3_node(node) || version.is_occluded(name) {
        return false;
    }
    if optout && version.is_delegation(name) && !node.has(Rtype::DS) {
        return false;
    }
    true
}

/// Returns the type bitmap of the NSEC3 record for a name.
pub fn nsec3_types(
    version: &ZoneVersion,
    name: &Name,
    signed: bool,
) -> RtypeBitmap {
    let Some(node) = version.node(name) else {
        return RtypeBitmap::new();
    };
    let mut res: RtypeBitmap = node
        .types()
        .filter(|rtype| {
            !matches!(*rtype, Rtype::RRSIG | Rtype::NSEC | Rtype::NSEC3)
        })
        .collect();
    if signed
        && !res.is_empty()
        && (!version.is_delegation(name) || node.has(Rtype::DS))
    {
        res.insert(Rtype::RRSIG);
    }
    res
}

/// The TTL of denial of existence records.
pub fn denial_ttl(version: &ZoneVersion) -> Ttl {
    version
        .soa()
        .map(|(soa, _)| soa.minimum)
        .unwrap_or(Ttl::ZERO)
}

//------------ Insertion -----------------------------------------------------

/// Makes sure a name is covered by an NSEC3 chain.
///
/// Adds or updates the record for `name` and links it into the chain.
/// Returns the owners of all NSEC3 records that changed. Their signatures
/// are not touched.
pub fn add_name(
    batch: &mut Batch,
    param: &Nsec3param,
    optout: bool,
    name: &Name,
    types: RtypeBitmap,
) -> Result<Vec<Name>, SignError> {
    let version = batch.version();
    let origin = version.origin().clone();
    let class = version.class();
    let ttl = denial_ttl(version);
    let hash = nsec3_hash(name, param)?;
    let owner = nsec3_owner(&origin, &hash)?;
    let flags = if optout { Nsec3::FLAG_OPT_OUT } else { 0 };
    let record = |owner: &Name, nsec3: Nsec3| {
        Record::new(owner.clone(), class, ttl, Rdata::Nsec3(nsec3))
    };

    let mut diff = Diff::new();
    let mut changed = Vec::new();
    if let Some(existing) =
        version.node(&owner).and_then(|node| nsec3_of(node, param))
    {
        if existing.types == types && existing.flags == flags {
            return Ok(changed);
        }
        let mut updated = existing.clone();
        updated.types = types;
        updated.flags = flags;
        diff.delete(record(&owner, existing.clone()));
        diff.add(record(&owner, updated));
        changed.push(owner);
        batch.apply(diff)?;
        return Ok(changed);
    }

    let next_owner = match predecessor(version, param, &owner) {
        Some((pred, nsec3)) => {
            let mut updated = nsec3.clone();
            let next = std::mem::replace(&mut updated.next_owner, hash.into());
            diff.delete(record(&pred, nsec3.clone()));
            diff.add(record(&pred, updated));
            changed.push(pred);
            next
        }
        // The first record of a chain points to itself.
        None => hash.into(),
    };
    diff.add(record(
        &owner,
        Nsec3 {
            hash_algorithm: param.hash_algorithm,
            flags,
            iterations: param.iterations,
            salt: param.salt.clone(),
            next_owner,
            types,
        },
    ));
    changed.push(owner);
    batch.apply(diff)?;
    Ok(changed)
}

/// Finds the record preceding `owner` in the chain.
///
/// If there is no record before `owner`, the chain wraps around and the
/// last record is the predecessor.
fn predecessor(
    version: &ZoneVersion,
    param: &Nsec3param,
    owner: &Name,
) -> Option<(Name, Nsec3)> {
    let in_chain = |(name, node): (&Name, &Node)| {
        nsec3_of(node, param).map(|nsec3| (name.clone(), nsec3.clone()))
    };
    version
        .names_before(owner)
        .filter(|(name, _)| name.is_below(version.origin()))
        .find_map(in_chain)
        .or_else(|| version.names_after(Some(owner)).filter_map(in_chain).last())
}

/// Adds a name and its empty non-terminal ancestors to a chain.
///
/// Re-signs all NSEC3 records that changed and returns the number of
/// signatures created.
pub fn add_name_signed(
    batch: &mut Batch,
    signer: &Signer,
    param: &Nsec3param,
    optout: bool,
    name: &Name,
) -> Result<usize, SignError> {
    let signed = signer.can_sign();
    let origin = batch.version().origin().clone();
    let mut changed = Vec::new();
    let types = nsec3_types(batch.version(), name, signed);
    changed.extend(add_name(batch, param, optout, name, types)?);
    for ancestor in name.ancestors_until(&origin) {
        if batch.version().node(&ancestor).is_some() {
            continue;
        }
        changed.extend(add_name(
            batch,
            param,
            optout,
            &ancestor,
            RtypeBitmap::new(),
        )?);
    }
    let mut count = 0;
    if signed {
        changed.sort();
        changed.dedup();
        for owner in changed {
            count += batch.resign_rrset(signer, &owner, Rtype::NSEC3)?;
        }
    }
    Ok(count)
}

/// Removes the NSEC3 records of a chain at a name.
///
/// Returns whether anything was removed. This doesn't relink the chain
/// and is meant for removing an entire chain.
pub fn remove_at(
    batch: &mut Batch,
    signer: &Signer,
    param: &Nsec3param,
    name: &Name,
) -> Result<bool, SignError> {
    let Some(node) = batch.version().node(name) else {
        return Ok(false);
    };
    let Some(rrset) = node.get(RrsetKey::plain(Rtype::NSEC3))
    else {
        return Ok(false);
    };
    let mut diff = Diff::new();
    for record in rrset.records() {
        if let Rdata::Nsec3(ref nsec3) = record.data {
            if nsec3.matches(param) {
                diff.delete(record.clone());
            }
        }
    }
    if diff.is_empty() {
        return Ok(false);
    }
    batch.apply(diff)?;
    batch.update_sigs(signer, name, Rtype::NSEC3)?;
    Ok(true)
}

/// Takes a name that went away out of a chain.
///
/// The predecessor is relinked to the successor and re-signed. Returns
/// the number of signatures created.
pub fn remove_name(
    batch: &mut Batch,
    signer: &Signer,
    param: &Nsec3param,
    name: &Name,
) -> Result<usize, SignError> {
    let version = batch.version();
    let origin = version.origin().clone();
    let class = version.class();
    let hash = nsec3_hash(name, param)?;
    let owner = nsec3_owner(&origin, &hash)?;
    let Some(existing) =
        version.node(&owner).and_then(|node| nsec3_of(node, param)).cloned()
    else {
        return Ok(0);
    };
    let ttl = denial_ttl(version);
    let record = |owner: &Name, nsec3: Nsec3| {
        Record::new(owner.clone(), class, ttl, Rdata::Nsec3(nsec3))
    };
    let mut diff = Diff::new();
    let pred = predecessor(version, param, &owner)
        .filter(|(pred, _)| pred != &owner);
    if let Some((pred, nsec3)) = pred.as_ref() {
        let mut updated = nsec3.clone();
        updated.next_owner = existing.next_owner.clone();
        diff.delete(record(pred, nsec3.clone()));
        diff.add(record(pred, updated));
    }
    diff.delete(record(&owner, existing));
    batch.apply(diff)?;
    batch.update_sigs(signer, &owner, Rtype::NSEC3)?;
    match pred {
        Some((pred, _)) if signer.can_sign() => {
            batch.resign_rrset(signer, &pred, Rtype::NSEC3)
        }
        _ => Ok(0),
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::sign::test_util::*;
    use crate::utils::base32hex;
    use bytes::Bytes;

    fn param(iterations: u16, salt: &'static [u8]) -> Nsec3param {
        Nsec3param::new(
            Nsec3HashAlg::SHA1,
            0,
            iterations,
            Bytes::from_static(salt),
        )
    }

    #[test]
    fn rfc5155_hashes() {
        // Appendix A of RFC 5155.
        let param = param(12, b"\xaa\xbb\xcc\xdd");
        let hash = nsec3_hash(&name("example."), &param).unwrap();
        assert_eq!(
            base32hex::encode(&hash),
            b"0p9mhaveqvm6t7vbl5lop2u3t2rp3tom".to_vec()
        );
        let hash = nsec3_hash(&name("a.example."), &param).unwrap();
        assert_eq!(
            base32hex::encode(&hash),
            b"35mthgpgcu1qg68fab165klnsnk3dpvl".to_vec()
        );
    }

    #[test]
    fn unusable_params() {
        let mut bad = param(0, b"");
        bad.hash_algorithm = Nsec3HashAlg::from_int(2);
        assert_eq!(
            nsec3_hash(&name("example."), &bad),
            Err(SignError::BadNsec3Params)
        );
        assert_eq!(
            check_params(&param(MAX_ITERATIONS + 1, b"")),
            Err(SignError::BadNsec3Params)
        );
        assert_eq!(
            check_algorithms([SecAlg::ED25519, SecAlg::RSASHA1]),
            Err(SignError::Nsec3Incompatible(SecAlg::RSASHA1))
        );
    }

    #[test]
    fn chain_stays_closed() {
        let param = param(0, b"");
        let version = zone(1);
        let mut batch = Batch::new(&version);
        let names: Vec<Name> = version
            .names()
            .map(|(name, _)| name.clone())
            .filter(|name| !version.is_occluded(name))
            .collect();
        for name in &names {
            let types = nsec3_types(batch.version(), name, false);
            add_name(&mut batch, &param, false, name, types).unwrap();
        }

        // Follow the chain from the first record and make sure it visits
        // every record exactly once.
        let records: Vec<(Name, Nsec3)> = batch
            .version()
            .names()
            .filter_map(|(name, node)| {
                nsec3_of(node, &param).map(|n| (name.clone(), n.clone()))
            })
            .collect();
        assert_eq!(records.len(), names.len());
        let mut current = records[0].clone();
        for _ in 0..records.len() {
            let next = nsec3_owner(&name("example."), &current.1.next_owner)
                .unwrap();
            current = records
                .iter()
                .find(|(owner, _)| owner == &next)
                .cloned()
                .unwrap();
        }
        assert_eq!(current.0, records[0].0);

        // The apex record lists the apex types.
        let apex = nsec3_hash(&name("example."), &param).unwrap();
        let apex = nsec3_owner(&name("example."), &apex).unwrap();
        let node = batch.version().node(&apex).unwrap();
        let types = &nsec3_of(node, &param).unwrap().types;
        assert!(types.contains(Rtype::SOA));
        assert!(types.contains(Rtype::NS));
        assert!(!types.contains(Rtype::RRSIG));
    }

    #[test]
    fn opt_out_skips_insecure_delegations() {
        let version = zone(1);
        let node = version.node(&name("sub.example.")).unwrap();
        assert!(!needs_nsec3(&version, &name("sub.example."), node, true));
        assert!(needs_nsec3(&version, &name("sub.example."), node, false));
        let glue = version.node(&name("ns.sub.example.")).unwrap();
        assert!(!needs_nsec3(&version, &name("ns.sub.example."), glue, false));
    }
}
