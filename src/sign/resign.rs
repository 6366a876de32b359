//! Renewing signatures before they expire.

use super::{Batch, SignError, Signer};
use crate::base::iana::Rtype;
use crate::base::name::Name;
use crate::base::time::UnixTime;
use crate::store::{Diff, ZoneVersion};
use tracing::debug;

/// Renews the signatures that are due.
///
/// Works through the signing-time index of `version` in order, renewing
/// every record set whose signatures are due by `signer.now()`. Stops
/// after about `quota` signatures. The SOA is not renewed on its own but
/// as part of finishing the batch.
///
/// Returns the changes to commit or `None` if nothing was due.
pub fn resign_quantum(
    version: &ZoneVersion,
    signer: &Signer,
    quota: usize,
) -> Result<Option<Diff>, SignError> {
    let now = signer.now();
    let mut soa_due = false;
    let mut due: Vec<(Name, Rtype)> = Vec::new();
    let mut expected = 0;
    for (when, name, rtype) in version.resign_entries() {
        if when > now || expected >= quota {
            break;
        }
        if rtype == Rtype::SOA && name == version.origin() {
            soa_due = true;
            continue;
        }
        expected += version
            .signatures(name, rtype)
            .map_or(1, |rrset| rrset.len());
        due.push((name.clone(), rtype));
    }

    let mut batch = Batch::new(version);
    for (name, rtype) in &due {
        if batch.version().find(name, *rtype).is_none() {
            // Orphaned signatures.
            batch.update_sigs(signer, name, *rtype)?;
            continue;
        }
        batch.resign_rrset(signer, name, *rtype)?;
    }
    if batch.is_empty() && !soa_due {
        return Ok(None);
    }
    if !due.is_empty() {
        debug!(
            "Zone '{}': renewed signatures of {} record sets",
            signer.origin(),
            due.len()
        );
    }
    if batch.is_empty() {
        batch.bump_serial(signer)?;
    }
    batch.finish(signer)
}

/// Returns when signatures are next due in a version.
pub fn next_resign(version: &ZoneVersion) -> Option<UnixTime> {
    version.next_resign().map(|(when, _, _)| when)
}

//============ Testing =======================================================
