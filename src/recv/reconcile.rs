//! Incremental replication reconciliation.
//!
//! Before the substreams of an incremental package are applied, the
//! destination tree is massaged to match the sender's picture at the
//! "from" snapshot: snapshots and filesystems renamed on the sender are
//! renamed here, clones promoted the other way around are promoted
//! back, and (with force) things deleted there are deleted here.
//!
//! Renames and promotes invalidate the gathered snapshot lists, so the
//! whole thing runs as passes over a freshly gathered local topology
//! until a pass needs nothing more. A pass that needs another round but
//! made no progress gives up and reports the package as incomplete
//! rather than looping forever.

use crate::engine::PoolEngine;
use crate::error::{Error, Result};
use crate::topology::{gather, FsNode, GuidIndex, Topology};

/// What a reconciliation pass set accomplished.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Some fixups could not be made; the package may still apply the
    /// substreams that do line up.
    pub incomplete: bool,
    /// Filesystems that ended up under a new name, for remount
    /// bookkeeping.
    pub renamed: Vec<String>,
}

/// Outcome of a rename attempt during reconciliation.
enum RenameOutcome {
    Renamed(String),
    /// The wanted name was not available; the dataset may have been
    /// parked under a temporary name for a later pass.
    Deferred(Option<String>),
}

fn tail(name: &str) -> Option<&str> {
    name.rfind('/').map(|i| &name[i + 1..])
}

/// Move `name` to `tryname`, falling back to a `recv-<pid>-<seq>`
/// temporary under the same parent when that fails or no target is
/// known. Only a successful move to `tryname` counts as done; a parked
/// dataset still needs another pass.
fn recv_rename(
    engine: &dyn PoolEngine,
    name: &str,
    tryname: Option<&str>,
    baselen: usize,
) -> RenameOutcome {
    let _ = engine.unmount(name);

    if let Some(target) = tryname {
        match engine.rename(name, target) {
            Ok(()) => {
                tracing::debug!(from = %name, to = %target, "reconciliation rename");
                let _ = engine.mount(target);
                return RenameOutcome::Renamed(target.to_string());
            }
            Err(e) => {
                tracing::debug!(from = %name, to = %target, error = %e,
                    "reconciliation rename failed");
            }
        }
    }

    // Park under a temporary name unless it already is one.
    let comp = &name[baselen.min(name.len())..];
    if comp.starts_with("recv-") {
        return RenameOutcome::Deferred(None);
    }
    let temp = format!(
        "{}recv-{}-{}",
        &name[..baselen.min(name.len())],
        std::process::id(),
        crate::engine::next_seq()
    );
    match engine.rename(name, &temp) {
        Ok(()) => {
            tracing::debug!(from = %name, to = %temp, "parked under temporary name");
            RenameOutcome::Deferred(Some(temp))
        }
        Err(e) => {
            tracing::debug!(from = %name, error = %e, "temporary rename failed");
            RenameOutcome::Deferred(None)
        }
    }
}

/// Destroy `name`; a busy dataset (held snapshot, populated clone) gets
/// parked under a temporary name instead so the rest of the pass can
/// proceed.
fn recv_destroy(engine: &dyn PoolEngine, name: &str, baselen: usize) -> RenameOutcome {
    let defer = name.contains('@');
    if !defer && engine.unmount(name).is_err() {
        return RenameOutcome::Deferred(None);
    }
    let gone = match engine.destroy(name, defer) {
        Ok(()) => !(defer && engine.dataset_exists(name)),
        Err(e) => {
            tracing::debug!(dataset = %name, error = %e, "reconciliation destroy failed");
            false
        }
    };
    if gone {
        tracing::debug!(dataset = %name, "destroyed by reconciliation");
        RenameOutcome::Renamed(String::new())
    } else {
        recv_rename(engine, name, None, baselen)
    }
}

/// Was the snapshot with `guid1` created before the one with `guid2`?
/// Both resolved against the local side; a missing snapshot is an error
/// for the caller to defer on. A zero `guid2` never loses, a zero
/// `guid1` always does.
fn created_before(
    engine: &dyn PoolEngine,
    local: &Topology,
    local_index: &GuidIndex,
    guid1: u64,
    guid2: u64,
) -> Result<bool> {
    if guid2 == 0 {
        return Ok(false);
    }
    if guid1 == 0 {
        return Ok(true);
    }
    let txg = |guid: u64| -> Result<u64> {
        let (fs, snap) = local_index
            .resolve(local, guid)
            .ok_or_else(|| Error::NotFound(format!("snapshot with guid {guid:#x}")))?;
        engine
            .snapshots(&fs.name)?
            .iter()
            .find(|s| s.name == snap)
            .map(|s| s.createtxg)
            .ok_or_else(|| Error::NotFound(format!("{}@{snap}", fs.name)))
    };
    Ok(txg(guid1)? < txg(guid2)?)
}

/// Bring the local tree under `tofs` in line with the stream's "from"
/// side. `isprefix` is true when the destination was given with a
/// prefix/tail name mode, which widens the rename checks to lineage
/// differences.
#[allow(clippy::too_many_arguments)]
pub fn reconcile(
    engine: &dyn PoolEngine,
    tofs: &str,
    stream: &Topology,
    stream_index: &GuidIndex,
    force: bool,
    isprefix: bool,
    dry_run: bool,
    collect_renamed: bool,
) -> Result<ReconcileReport> {
    let fromsnap = match stream.fromsnap.as_deref() {
        Some(s) => s,
        None => return Ok(ReconcileReport::default()),
    };
    if dry_run {
        return Ok(ReconcileReport::default());
    }

    let mut report = ReconcileReport::default();
    loop {
        let mut needagain = false;
        let mut progress = false;

        let local = match gather(engine, tofs, Some(fromsnap), None, stream.recursive, false) {
            Ok(t) => t,
            Err(e) => {
                // The destination tree may simply not exist yet.
                tracing::debug!(dataset = %tofs, error = %e,
                    "could not gather destination for reconciliation");
                report.incomplete = true;
                return Ok(report);
            }
        };
        let local_index = local.index();

        for node in &local.nodes {
            // Match this filesystem to its stream counterpart through
            // any shared snapshot guid.
            let mut stream_fs: Option<&FsNode> = None;
            for snap in &node.snaps {
                if let Some((fs, _)) = stream_index.resolve(stream, snap.guid) {
                    stream_fs = Some(fs);
                    break;
                }
            }

            // A clone promoted on the sender has a different origin
            // there; promote locally to match before anything else, the
            // snapshot lists shift underneath a promote.
            if let Some(sfs) = stream_fs {
                let stream_origin = sfs.origin.unwrap_or(0);
                let local_origin = node.origin.unwrap_or(0);
                if stream_origin != local_origin {
                    match created_before(engine, &local, &local_index, stream_origin, local_origin)
                    {
                        Ok(true) => match engine.promote(&node.name) {
                            Ok(()) => {
                                tracing::debug!(clone = %node.name, "promoted to match sender");
                                progress = true;
                            }
                            Err(e) => {
                                tracing::debug!(clone = %node.name, error = %e, "promote failed");
                            }
                        },
                        Ok(false) => {}
                        Err(e) => {
                            tracing::debug!(clone = %node.name, error = %e,
                                "could not order clone origins");
                        }
                    }
                    needagain = true;
                    continue;
                }
            }

            let mut fromguid = 0u64;
            for snap in &node.snaps {
                let full = format!("{}@{}", node.name, snap.name);
                let (sfs, stream_snap) = match stream_index.resolve(stream, snap.guid) {
                    Some((sfs, sname)) => (sfs, sname),
                    None => {
                        // Deleted on the sender.
                        if force {
                            match recv_destroy(engine, &full, node.name.len() + 1) {
                                RenameOutcome::Renamed(_) => progress = true,
                                RenameOutcome::Deferred(_) => needagain = true,
                            }
                        }
                        continue;
                    }
                };

                // Stamp the sender's snapshot properties before any
                // rename, while the local name is still known.
                if let Some(sp) = sfs.snapprops.get(stream_snap) {
                    if !sp.is_empty() {
                        if let Err(e) = engine.set_props(&full, sp, true) {
                            tracing::debug!(snapshot = %full, error = %e,
                                "could not set received snapshot properties");
                        }
                    }
                }

                if snap.name != stream_snap {
                    let target = format!("{}@{stream_snap}", node.name);
                    match recv_rename(engine, &full, Some(&target), node.name.len() + 1) {
                        RenameOutcome::Renamed(_) => progress = true,
                        RenameOutcome::Deferred(_) => needagain = true,
                    }
                }

                if stream_snap == fromsnap {
                    fromguid = snap.guid;
                }
            }

            let sfs = match stream_fs {
                Some(sfs) => sfs,
                None => {
                    // No snapshot in common with the stream: this
                    // filesystem does not exist on the sender.
                    if force {
                        match recv_destroy(engine, &node.name, tofs.len() + 1) {
                            RenameOutcome::Renamed(_) => progress = true,
                            RenameOutcome::Deferred(_) => needagain = true,
                        }
                    }
                    continue;
                }
            };

            if fromguid == 0 {
                tracing::debug!(filesystem = %node.name,
                    "local filesystem does not have the from snapshot; will create anew");
                continue;
            }

            // Renamed on the sender: either its position in the tree
            // changed (different parent "from" guid) or, for non-exact
            // destinations, its last name component differs.
            let lineage_moved = node.parent_fromsnap_guid != 0
                && sfs.parent_fromsnap_guid != 0
                && node.parent_fromsnap_guid != sfs.parent_fromsnap_guid;
            let tail_differs = (isprefix || node.name != tofs)
                && matches!((tail(&node.name), tail(&sfs.name)),
                    (Some(a), Some(b)) if a != b);
            if lineage_moved || tail_differs {
                let tryname = local_index
                    .resolve(&local, sfs.parent_fromsnap_guid)
                    .and_then(|(parent, _)| {
                        tail(&sfs.name).map(|t| format!("{}/{t}", parent.name))
                    });
                match recv_rename(engine, &node.name, tryname.as_deref(), tofs.len() + 1) {
                    RenameOutcome::Renamed(newname) => {
                        progress = true;
                        if collect_renamed {
                            report.renamed.push(newname);
                        }
                    }
                    RenameOutcome::Deferred(parked) => {
                        needagain = true;
                        if collect_renamed {
                            if let Some(p) = parked {
                                report.renamed.push(p);
                            }
                        }
                    }
                }
            }
        }

        if !needagain {
            break;
        }
        if !progress {
            tracing::warn!(dataset = %tofs,
                "reconciliation could not fully match the sender's layout");
            report.incomplete = true;
            break;
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_component() {
        assert_eq!(tail("tank/a/b"), Some("b"));
        assert_eq!(tail("tank"), None);
    }
}
