//! Walking a zone to add or remove the signatures of one key.
//!
//! When a key becomes active, every signed record set of the zone needs
//! a signature by it. When a key is removed, its signatures go. Both are
//! done by walking the zone in quanta. The progress of each walk is
//! recorded in a signing marker at the apex.

use super::marker::{markers, Marker, SigningMarker};
use super::nsec3::denial_ttl;
use super::{Batch, SignError, Signer};
use crate::base::iana::{Rtype, SecAlg};
use crate::base::name::Name;
use crate::base::rdata::Rdata;
use crate::base::record::Record;
use crate::store::{Diff, ZoneVersion};
use std::collections::VecDeque;
use tracing::info;

//------------ SigningRequest ------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SigningRequest {
    pub algorithm: SecAlg,
    pub key_tag: u16,

    /// Whether the signatures of the key are to be removed.
    pub delete: bool,

    cursor: Option<Name>,
}

impl SigningRequest {
    pub fn new(algorithm: SecAlg, key_tag: u16, delete: bool) -> Self {
        SigningRequest {
            algorithm,
            key_tag,
            delete,
            cursor: None,
        }
    }

    pub fn from_marker(marker: &SigningMarker) -> Self {
        Self::new(marker.algorithm, marker.key_tag, marker.removal)
    }

    pub fn marker(&self) -> SigningMarker {
        SigningMarker::new(self.algorithm, self.key_tag, self.delete)
    }

    /// Returns whether the request is about the same key and operation.
    pub fn same_as(&self, other: &SigningRequest) -> bool {
        self.algorithm == other.algorithm
            && self.key_tag == other.key_tag
            && self.delete == other.delete
    }
}

/// Returns the unfinished signing requests recorded in a zone.
pub fn pending_requests(
    version: &ZoneVersion,
    private_type: Rtype,
) -> Vec<SigningRequest> {
    markers(version, private_type)
        .iter()
        .filter_map(|marker| match marker {
            Marker::Signing(marker) if !marker.complete => {
                Some(SigningRequest::from_marker(marker))
            }
            _ => None,
        })
        .collect()
}

//------------ sign_quantum --------------------------------------------------

/// Works on the pending signing requests for one quantum.
///
/// At most `nodes` names are visited and at most about `signatures`
/// signatures created. Finished requests are removed from the queue.
pub fn sign_quantum(
    version: &ZoneVersion,
    signer: &Signer,
    requests: &mut VecDeque<SigningRequest>,
    private_type: Rtype,
    nodes: usize,
    signatures: usize,
) -> Result<Option<Diff>, SignError> {
    let saved = requests.clone();
    let res = run_quantum(version, signer, requests, private_type, nodes, signatures);
    if res.is_err() {
        *requests = saved;
    }
    res
}

fn run_quantum(
    version: &ZoneVersion,
    signer: &Signer,
    requests: &mut VecDeque<SigningRequest>,
    private_type: Rtype,
    mut nodes: usize,
    mut signatures: usize,
) -> Result<Option<Diff>, SignError> {
    let mut batch = Batch::new(version);
    while nodes > 0 && signatures > 0 {
        let Some(request) = requests.front_mut() else {
            break;
        };
        let next = batch
            .version()
            .names_after(request.cursor.as_ref())
            .next()
            .map(|(name, _)| name.clone());
        match next {
            Some(name) => {
                let count = if request.delete {
                    delete_sigs(&mut batch, request, &name)?
                } else {
                    add_sigs(&mut batch, signer, request, &name)?
                };
                nodes -= 1;
                signatures = signatures.saturating_sub(count);
                request.cursor = Some(name);
            }
            None => {
                complete(&mut batch, signer, request, private_type)?;
                info!(
                    "Zone '{}': {} signatures of key {}/{} complete",
                    signer.origin(),
                    if request.delete { "removing" } else { "adding" },
                    request.algorithm,
                    request.key_tag
                );
                requests.pop_front();
            }
        }
    }
    batch.finish(signer)
}

fn add_sigs(
    batch: &mut Batch,
    signer: &Signer,
    request: &SigningRequest,
    name: &Name,
) -> Result<usize, SignError> {
    let types: Vec<Rtype> = match batch.version().node(name) {
        Some(node) => node.types().collect(),
        None => return Ok(0),
    };
    let mut diff = Diff::new();
    let mut count = 0;
    for rtype in types {
        if !Signer::is_signed_rrset(batch.version(), name, rtype) {
            continue;
        }
        count += signer.add_sig_with_key(
            batch.version(),
            name,
            rtype,
            request.algorithm,
            request.key_tag,
            &mut diff,
        )?;
    }
    batch.apply(diff)?;
    Ok(count)
}

fn delete_sigs(
    batch: &mut Batch,
    request: &SigningRequest,
    name: &Name,
) -> Result<usize, SignError> {
    let Some(node) = batch.version().node(name) else {
        return Ok(0);
    };
    let mut diff = Diff::new();
    for rrset in node.rrsets().filter(|rrset| rrset.key.covers.is_some()) {
        for record in rrset.records() {
            let by_key = matches!(
                record.data,
                Rdata::Rrsig(ref sig)
                    if sig.algorithm == request.algorithm
                        && sig.key_tag == request.key_tag
            );
            if by_key {
                diff.delete(record.clone());
            }
        }
    }
    batch.apply(diff)?;
    Ok(0)
}

/// Updates the markers once a walk is done.
///
/// After adding signatures, the incomplete marker is replaced with a
/// complete one. After removing them, all markers of the key go.
fn complete(
    batch: &mut Batch,
    signer: &Signer,
    request: &SigningRequest,
    private_type: Rtype,
) -> Result<(), SignError> {
    let origin = signer.origin().clone();
    let mut diff = Diff::new();
    let mut have_complete = false;
    if let Some(rrset) = batch.version().find(&origin, private_type) {
        for record in rrset.records() {
            let Some(Marker::Signing(marker)) =
                Marker::from_rdata(&record.data, private_type)
            else {
                continue;
            };
            if !marker.is_for(request.algorithm, request.key_tag) {
                continue;
            }
            if request.delete || !marker.complete {
                diff.delete(record.clone());
            } else {
                have_complete = true;
            }
        }
    }
    if !request.delete && !have_complete {
        diff.add(Record::new(
            origin.clone(),
            batch.version().class(),
            denial_ttl(batch.version()),
            request.marker().completed().to_rdata(private_type),
        ));
    }
    batch.apply(diff)?;
    batch.update_sigs(signer, &origin, private_type)?;
    Ok(())
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::base::rdata::Dnskey;
    use crate::sign::test_util::*;
    use crate::sign::ZoneKey;

    const PRIVATE: Rtype = Rtype::DEFAULT_PRIVATE;

    fn run(
        mut version: ZoneVersion,
        signer: &Signer,
        mut requests: VecDeque<SigningRequest>,
        nodes: usize,
    ) -> ZoneVersion {
        for _ in 0..1000 {
            if requests.is_empty() {
                return version;
            }
            let diff =
                sign_quantum(&version, signer, &mut requests, PRIVATE, nodes, 1000)
                    .unwrap();
            if let Some(diff) = diff {
                version = version.apply(&diff).unwrap().0;
            }
        }
        panic!("walk never completed");
    }

    fn tags(version: &ZoneVersion, owner: &str, covers: Rtype) -> Vec<u16> {
        version
            .signatures(&name(owner), covers)
            .into_iter()
            .flat_map(|rrset| rrset.data.iter())
            .filter_map(Rdata::as_rrsig)
            .map(|sig| sig.key_tag)
            .collect()
    }

    fn request_for(key: &ZoneKey, delete: bool) -> SigningRequest {
        SigningRequest::new(key.algorithm(), key.key_tag(), delete)
    }

    #[test]
    fn walk_signs_authoritative_data_only() {
        let key = ed_key(1, Dnskey::FLAG_ZONE);
        let version = with_keys(&zone(1), &[key.clone()]);
        let signer = signer(vec![key.clone()]);
        let request = request_for(&key, false);
        let mut diff = Diff::new();
        diff.add(record("example.", request.marker().to_rdata(PRIVATE)));
        let version = version.apply(&diff).unwrap().0;
        assert_eq!(pending_requests(&version, PRIVATE), vec![request.clone()]);

        let version = run(version, &signer, [request].into(), 2);
        assert_eq!(tags(&version, "www.example.", Rtype::A), vec![key.key_tag()]);
        assert_eq!(tags(&version, "example.", Rtype::NS), vec![key.key_tag()]);
        // Delegation NS and glue stay unsigned.
        assert!(tags(&version, "sub.example.", Rtype::NS).is_empty());
        assert!(tags(&version, "ns.sub.example.", Rtype::A).is_empty());

        // The marker is now complete.
        assert!(pending_requests(&version, PRIVATE).is_empty());
        assert_eq!(
            markers(&version, PRIVATE),
            vec![Marker::Signing(
                SigningMarker::new(key.algorithm(), key.key_tag(), false)
                    .completed()
            )]
        );
    }

    #[test]
    fn removal_drops_signatures_and_markers() {
        let key = ed_key(1, Dnskey::FLAG_ZONE);
        let version = with_keys(&zone(1), &[key.clone()]);
        let signer = signer(vec![key.clone()]);
        let version = run(version, &signer, [request_for(&key, false)].into(), 100);
        assert!(!tags(&version, "www.example.", Rtype::A).is_empty());

        let version = run(version, &signer, [request_for(&key, true)].into(), 100);
        assert!(tags(&version, "www.example.", Rtype::A).is_empty());
        assert!(markers(&version, PRIVATE).is_empty());
    }
}
