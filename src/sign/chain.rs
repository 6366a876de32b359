//! Building and removing NSEC and NSEC3 chains.
//!
//! A chain change is a [`ChainRequest`] that is worked on in quanta. Each
//! request moves through a number of phases, each of which walks the
//! zone once. The position of the walk is a name so that work can resume
//! on a newer version of the zone.
//!
//! Adding an NSEC3 chain walks the zone adding NSEC3 records, then
//! removes the NSEC chain if there is one, and finally publishes the
//! NSEC3PARAM record. Removing an NSEC3 chain first withdraws the
//! NSEC3PARAM record, builds an NSEC chain if this was the last NSEC3
//! chain of a signed zone, and then walks the zone removing the NSEC3
//! records. The state of NSEC3 changes is kept in a chain marker at the
//! apex so it survives restarts.

use super::marker::{markers, ChainMarker, Marker};
use super::nsec3::{
    check_algorithms, check_params, needs_nsec3, zone_algorithms,
};
use super::{nsec, nsec3, Batch, SignError, Signer};
use crate::base::iana::Rtype;
use crate::base::name::Name;
use crate::base::rdata::{Nsec3, Nsec3param, Rdata};
use crate::base::record::Record;
use crate::store::{Diff, ZoneVersion};
use core::fmt;
use std::collections::VecDeque;
use tracing::{debug, info};

//------------ ChainKind -----------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChainKind {
    Nsec,

    /// An NSEC3 chain.
    ///
    /// The flags of the parameters carry the opt-out flag only.
    Nsec3(Nsec3param),
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChainKind::Nsec => f.write_str("NSEC"),
            ChainKind::Nsec3(param) => write!(f, "NSEC3 {}", param),
        }
    }
}

//------------ ChainPhase ----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChainPhase {
    /// Nothing has been done yet.
    Start,

    /// Walking the zone adding records of the chain.
    Build,

    /// Walking the zone removing the NSEC chain.
    RemoveNsec,

    /// Walking the zone adding an NSEC chain.
    BuildNsec,

    /// Walking the zone removing records of the chain.
    Remove,

    /// Publishing the result.
    Finish,
}

//------------ ChainRequest --------------------------------------------------

/// A pending change to the denial of existence chains of a zone.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChainRequest {
    kind: ChainKind,
    remove: bool,

    /// Don't build an NSEC chain when removing the last NSEC3 chain.
    nonsec: bool,

    phase: ChainPhase,

    /// The last name processed in the current phase.
    cursor: Option<Name>,
}

impl ChainRequest {
    /// Requests building an NSEC chain.
    pub fn nsec() -> Self {
        Self::new(ChainKind::Nsec, false, false)
    }

    pub fn add_nsec3(param: Nsec3param) -> Self {
        Self::new(ChainKind::Nsec3(param), false, false)
    }

    pub fn remove_nsec3(param: Nsec3param, nonsec: bool) -> Self {
        Self::new(ChainKind::Nsec3(param), true, nonsec)
    }

    fn new(kind: ChainKind, remove: bool, nonsec: bool) -> Self {
        ChainRequest {
            kind,
            remove,
            nonsec,
            phase: ChainPhase::Start,
            cursor: None,
        }
    }

    /// Recreates the request recorded in a chain marker.
    pub fn from_marker(marker: &ChainMarker) -> Option<Self> {
        if marker.is_create() {
            Some(Self::add_nsec3(marker.param.clone()))
        } else if marker.is_remove() {
            Some(Self::remove_nsec3(marker.param.clone(), marker.is_nonsec()))
        } else {
            None
        }
    }

    /// Returns the marker recording this request.
    pub fn marker(&self) -> Option<ChainMarker> {
        let ChainKind::Nsec3(ref param) = self.kind else {
            return None;
        };
        let state = if self.remove {
            ChainMarker::REMOVE
                | if self.nonsec { ChainMarker::NONSEC } else { 0 }
        } else {
            ChainMarker::CREATE
        };
        Some(ChainMarker::new(param.clone(), state))
    }

    pub fn kind(&self) -> &ChainKind {
        &self.kind
    }

    pub fn is_remove(&self) -> bool {
        self.remove
    }

    pub fn phase(&self) -> ChainPhase {
        self.phase
    }

    /// Returns whether two requests are about the same chain.
    pub fn same_chain(&self, other: &ChainRequest) -> bool {
        match (&self.kind, &other.kind) {
            (ChainKind::Nsec, ChainKind::Nsec) => true,
            (ChainKind::Nsec3(left), ChainKind::Nsec3(right)) => {
                left.same_chain(right)
            }
            _ => false,
        }
    }

    fn enter(&mut self, phase: ChainPhase) {
        self.phase = phase;
        self.cursor = None;
    }
}

/// Returns the chain requests recorded in the markers of a zone.
///
/// If the zone is signed but lacks any chain, an NSEC chain is requested
/// as well: its build was interrupted before it could be recorded.
pub fn pending_requests(
    version: &ZoneVersion,
    private_type: Rtype,
) -> Vec<ChainRequest> {
    let mut res: Vec<_> = markers(version, private_type)
        .iter()
        .filter_map(|marker| match marker {
            Marker::Chain(marker) => ChainRequest::from_marker(marker),
            Marker::Signing(_) => None,
        })
        .collect();
    let has_dnskey = version.find(version.origin(), Rtype::DNSKEY).is_some();
    if has_dnskey
        && !version.is_secure()
        && !res.iter().any(|req| !req.remove)
    {
        res.push(ChainRequest::nsec());
    }
    res
}

//------------ Quota ---------------------------------------------------------

/// The amount of work a quantum may do.
#[derive(Clone, Copy, Debug)]
struct Quota {
    nodes: usize,
    signatures: usize,
}

impl Quota {
    fn exhausted(&self) -> bool {
        self.nodes == 0 || self.signatures == 0
    }

    fn spend(&mut self, signatures: usize) {
        self.nodes = self.nodes.saturating_sub(1);
        self.signatures = self.signatures.saturating_sub(signatures);
    }
}

//------------ chain_quantum -------------------------------------------------

/// Works on the pending chain requests for one quantum.
///
/// Processes at most `nodes` names and creates roughly at most
/// `signatures` signatures. Finished requests are removed from the
/// queue. Returns the changes to commit, if any.
///
/// If a new request can't be carried out, it is removed from the queue
/// and an error is returned without any changes to the zone.
pub fn chain_quantum(
    version: &ZoneVersion,
    signer: &Signer,
    requests: &mut VecDeque<ChainRequest>,
    private_type: Rtype,
    nodes: usize,
    signatures: usize,
) -> Result<Option<Diff>, SignError> {
    let mut refused = None;
    requests.retain(|request| {
        if request.phase != ChainPhase::Start {
            return true;
        }
        match check_request(version, request) {
            Ok(()) => true,
            Err(err) => {
                refused.get_or_insert(err);
                false
            }
        }
    });
    if let Some(err) = refused {
        return Err(err);
    }

    // Progress is only kept if the whole quantum succeeds.
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
    requests: &mut VecDeque<ChainRequest>,
    private_type: Rtype,
    nodes: usize,
    signatures: usize,
) -> Result<Option<Diff>, SignError> {
    let mut batch = Batch::new(version);
    let mut quota = Quota { nodes, signatures };
    while !quota.exhausted() {
        let Some(request) = requests.front_mut() else {
            break;
        };
        if step(&mut batch, signer, request, private_type, &mut quota)? {
            info!(
                "Zone '{}': {} {} chain complete",
                signer.origin(),
                if request.remove { "removing" } else { "creating" },
                request.kind
            );
            requests.pop_front();
        }
    }
    batch.finish(signer)
}

fn check_request(
    version: &ZoneVersion,
    request: &ChainRequest,
) -> Result<(), SignError> {
    if let (ChainKind::Nsec3(param), false) = (&request.kind, request.remove) {
        check_params(param)?;
        check_algorithms(zone_algorithms(version))?;
    }
    Ok(())
}

/// Advances a request as far as the quota allows.
///
/// Returns whether the request is complete.
fn step(
    batch: &mut Batch,
    signer: &Signer,
    request: &mut ChainRequest,
    private_type: Rtype,
    quota: &mut Quota,
) -> Result<bool, SignError> {
    loop {
        if quota.exhausted() {
            return Ok(false);
        }
        match (request.kind.clone(), request.remove, request.phase) {
            (_, _, ChainPhase::Start) => {
                if request.remove {
                    if let ChainKind::Nsec3(param) = &request.kind {
                        let last = withdraw_param(batch, signer, param)?;
                        let signed =
                            batch.version().find(signer.origin(), Rtype::DNSKEY).is_some();
                        if last && !request.nonsec && signed {
                            request.enter(ChainPhase::BuildNsec);
                        } else {
                            request.enter(ChainPhase::Remove);
                        }
                    } else {
                        request.enter(ChainPhase::Remove);
                    }
                } else {
                    request.enter(ChainPhase::Build);
                }
            }
            (ChainKind::Nsec, false, ChainPhase::Build)
            | (_, true, ChainPhase::BuildNsec) => {
                if walk(batch, request, quota, |batch, name| {
                    nsec::update_name_signed(batch, signer, name)
                })? {
                    let next = if request.remove {
                        ChainPhase::Remove
                    } else {
                        ChainPhase::Finish
                    };
                    request.enter(next);
                }
            }
            (ChainKind::Nsec3(param), false, ChainPhase::Build) => {
                let optout = param.flags & Nsec3::FLAG_OPT_OUT != 0;
                if walk(batch, request, quota, |batch, name| {
                    let version = batch.version();
                    let wanted = version
                        .node(name)
                        .map_or(false, |node| needs_nsec3(version, name, node, optout));
                    if !wanted {
                        return Ok(0);
                    }
                    nsec3::add_name_signed(batch, signer, &param, optout, name)
                })? {
                    if batch.version().has_nsec_chain() {
                        request.enter(ChainPhase::RemoveNsec);
                    } else {
                        request.enter(ChainPhase::Finish);
                    }
                }
            }
            (_, false, ChainPhase::RemoveNsec) => {
                if walk(batch, request, quota, |batch, name| {
                    nsec::remove_name(batch, name).map(|_| 0)
                })? {
                    request.enter(ChainPhase::Finish);
                }
            }
            (ChainKind::Nsec3(param), true, ChainPhase::Remove) => {
                if walk(batch, request, quota, |batch, name| {
                    nsec3::remove_at(batch, signer, &param, name).map(|_| 0)
                })? {
                    request.enter(ChainPhase::Finish);
                }
            }
            (ChainKind::Nsec, true, ChainPhase::Remove) => {
                if walk(batch, request, quota, |batch, name| {
                    nsec::remove_name(batch, name).map(|_| 0)
                })? {
                    request.enter(ChainPhase::Finish);
                }
            }
            (_, _, ChainPhase::Finish) => {
                finish(batch, signer, request, private_type)?;
                return Ok(true);
            }
            (kind, remove, phase) => {
                // Phases that don't apply to a request are skipped.
                debug!(
                    "Zone '{}': skipping phase {:?} of {} (remove {})",
                    signer.origin(),
                    phase,
                    kind,
                    remove
                );
                request.enter(ChainPhase::Finish);
            }
        }
    }
}

/// Walks the zone from the cursor of a request.
///
/// Calls `op` for every name until the quota runs out. Returns whether
/// the walk reached the end of the zone.
fn walk(
    batch: &mut Batch,
    request: &mut ChainRequest,
    quota: &mut Quota,
    mut op: impl FnMut(&mut Batch, &Name) -> Result<usize, SignError>,
) -> Result<bool, SignError> {
    while !quota.exhausted() {
        let next = batch
            .version()
            .names_after(request.cursor.as_ref())
            .next()
            .map(|(name, _)| name.clone());
        let Some(name) = next else {
            return Ok(true);
        };
        let signatures = op(batch, &name)?;
        quota.spend(signatures);
        request.cursor = Some(name);
    }
    Ok(false)
}

/// Removes the NSEC3PARAM record of a chain from the apex.
///
/// Returns whether no NSEC3 chain is published anymore.
fn withdraw_param(
    batch: &mut Batch,
    signer: &Signer,
    param: &Nsec3param,
) -> Result<bool, SignError> {
    let origin = signer.origin().clone();
    let mut diff = Diff::new();
    if let Some(rrset) = batch.version().find(&origin, Rtype::NSEC3PARAM) {
        for record in rrset.records() {
            if let Rdata::Nsec3param(ref published) = record.data {
                if published.same_chain(param) {
                    diff.delete(record.clone());
                }
            }
        }
    }
    batch.apply(diff)?;
    batch.update_sigs(signer, &origin, Rtype::NSEC3PARAM)?;
    refresh_apex(batch, signer)?;
    Ok(batch.version().nsec3params().is_empty())
}

/// Completes a request.
fn finish(
    batch: &mut Batch,
    signer: &Signer,
    request: &ChainRequest,
    private_type: Rtype,
) -> Result<(), SignError> {
    let origin = signer.origin().clone();
    let class = batch.version().class();
    if let (ChainKind::Nsec3(param), false) = (&request.kind, request.remove) {
        let published = batch
            .version()
            .nsec3params()
            .iter()
            .any(|existing| existing.same_chain(param));
        if !published {
            let mut public = param.clone();
            public.flags = 0;
            let mut diff = Diff::new();
            diff.add(Record::new(
                origin.clone(),
                class,
                nsec3::denial_ttl(batch.version()),
                Rdata::Nsec3param(public),
            ));
            batch.apply(diff)?;
            batch.update_sigs(signer, &origin, Rtype::NSEC3PARAM)?;
        }
    }

    if let Some(marker) = request.marker() {
        let mut diff = Diff::new();
        if let Some(rrset) = batch.version().find(&origin, private_type) {
            for record in rrset.records() {
                let done = matches!(
                    Marker::from_rdata(&record.data, private_type),
                    Some(Marker::Chain(ref found))
                        if found.param.same_chain(&marker.param)
                            && found.is_remove() == request.remove
                );
                if done {
                    diff.delete(record.clone());
                }
            }
        }
        batch.apply(diff)?;
        batch.update_sigs(signer, &origin, private_type)?;
    }
    refresh_apex(batch, signer)
}

/// Updates the denial of existence records of the apex.
///
/// The apex type bitmaps change when NSEC3PARAM records come and go.
fn refresh_apex(batch: &mut Batch, signer: &Signer) -> Result<(), SignError> {
    let origin = signer.origin().clone();
    if batch.version().has_nsec_chain() {
        nsec::update_name_signed(batch, signer, &origin)?;
    }
    for param in apex_chains(batch.version()) {
        let optout = param.flags & Nsec3::FLAG_OPT_OUT != 0;
        nsec3::add_name_signed(batch, signer, &param, optout, &origin)?;
    }
    Ok(())
}

/// Returns the published NSEC3 chains with their opt-out flag.
fn apex_chains(version: &ZoneVersion) -> Vec<Nsec3param> {
    let origin = version.origin();
    version
        .nsec3params()
        .into_iter()
        .filter_map(|mut param| {
            let hash = nsec3::nsec3_hash(origin, &param).ok()?;
            let owner = nsec3::nsec3_owner(origin, &hash).ok()?;
            let apex = nsec3::nsec3_of(version.node(&owner)?, &param)?;
            param.flags = apex.flags & Nsec3::FLAG_OPT_OUT;
            Some(param)
        })
        .collect()
}

//============ Testing =======================================================
