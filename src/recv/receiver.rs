//! Single-substream receive: destination naming, preflight checks and
//! the hand-off to the engine's apply step.

use std::collections::BTreeMap;
use std::io::Read;

use crate::engine::{ApplyRequest, PoolEngine, PropValue};
use crate::error::{Error, Result};
use crate::recv::decoder::{skip_substream, StreamHeader};
use crate::recv::{NameMode, PropOverride, RecvFlags};
use crate::stream::DatasetKind;
use crate::topology::{GuidIndex, Topology};

const MAX_NAME_LEN: usize = 256;

/// What one substream did to the pool.
#[derive(Debug, Default)]
pub(crate) struct SubstreamOutcome {
    /// False when the substream was consumed without applying it
    /// (dry run, or a snapshot that already arrived another way).
    pub received: bool,
    pub bytes: u64,
}

/// Find the dataset or snapshot carrying `guid`, searching under
/// `base`'s filesystem first and then the whole pool. Renames on the
/// receiving side make name-based lookups lie; guids do not.
pub(crate) fn guid_to_name(engine: &dyn PoolEngine, base: &str, guid: u64) -> Option<String> {
    fn search(engine: &dyn PoolEngine, ds: &str, guid: u64) -> Option<String> {
        if let Ok(stat) = engine.stat(ds) {
            if stat.guid == guid {
                return Some(ds.to_string());
            }
        }
        if let Ok(snaps) = engine.snapshots(ds) {
            for s in snaps {
                if s.guid == guid {
                    return Some(format!("{ds}@{}", s.name));
                }
            }
        }
        if let Ok(children) = engine.children(ds) {
            for child in children {
                if let Some(found) = search(engine, &child, guid) {
                    return Some(found);
                }
            }
        }
        None
    }

    let fsname = match base.find('@') {
        Some(at) => &base[..at],
        None => base,
    };
    if engine.dataset_exists(fsname) {
        if let Some(found) = search(engine, fsname, guid) {
            return Some(found);
        }
    }
    let pool = match fsname.find('/') {
        Some(i) => &fsname[..i],
        None => return None,
    };
    search(engine, pool, guid)
}

fn validate_snapshot_name(name: &str) -> Result<()> {
    let bad = || Error::InvalidName(name.to_string());
    if name.len() >= MAX_NAME_LEN {
        return Err(bad());
    }
    let at = name.find('@').ok_or_else(bad)?;
    let (fs, snap) = (&name[..at], &name[at + 1..]);
    if fs.is_empty() || snap.is_empty() || snap.contains('@') || snap.contains('/') {
        return Err(bad());
    }
    if fs.split('/').any(str::is_empty) {
        return Err(bad());
    }
    Ok(())
}

/// Destination snapshot name for a substream, from the receive target,
/// the sender's snapshot name and the name mode.
pub(crate) fn destination(
    tosnap: &str,
    toname: &str,
    sendfs: &str,
    name_mode: NameMode,
    package: bool,
) -> Result<String> {
    // Substream names inside a package must extend the package's
    // filesystem; anything else is a forged or corrupted header.
    let bad_toname = || {
        Error::BadStream(format!(
            "snapshot name '{toname}' does not belong to stream '{sendfs}'"
        ))
    };
    let dest = match name_mode {
        NameMode::Tail => {
            if tosnap.contains('@') {
                return Err(Error::InvalidName(format!(
                    "cannot receive into snapshot '{tosnap}' with a tail destination"
                )));
            }
            if !toname.starts_with(sendfs) {
                return Err(bad_toname());
            }
            match sendfs.rfind('/') {
                Some(i) => format!("{tosnap}{}", &toname[i..]),
                None => format!("{tosnap}/{toname}"),
            }
        }
        NameMode::Prefix => {
            if tosnap.contains('@') {
                return Err(Error::InvalidName(format!(
                    "cannot receive into snapshot '{tosnap}' with a prefix destination"
                )));
            }
            // Drop the sender's pool name, keep the rest.
            let i = match toname.find('/') {
                Some(i) => i,
                None => match toname.find('@') {
                    Some(i) => i,
                    None => toname.len(),
                },
            };
            format!("{tosnap}{}", &toname[i..])
        }
        NameMode::Exact => {
            if tosnap.contains('@') {
                if package {
                    return Err(Error::BadStream(
                        "cannot specify snapshot name for multi-snapshot stream".into(),
                    ));
                }
                tosnap.to_string()
            } else {
                let rest = toname.strip_prefix(sendfs).ok_or_else(bad_toname)?;
                format!("{tosnap}{rest}")
            }
        }
    };
    validate_snapshot_name(&dest)?;
    Ok(dest)
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn receive_one(
    engine: &dyn PoolEngine,
    flags: &RecvFlags,
    overrides: &BTreeMap<String, PropOverride>,
    tosnap: &str,
    header: &StreamHeader,
    sendfs: &str,
    stream: Option<(&Topology, &GuidIndex)>,
    input: &mut dyn Read,
    top_fs: &mut Option<String>,
) -> Result<SubstreamOutcome> {
    let begin = &header.begin;
    let mut dest = destination(
        tosnap,
        &begin.toname,
        sendfs,
        flags.name_mode,
        stream.is_some(),
    )?;

    // The stream-side node for this filesystem, when the package header
    // described it.
    let stream_node = stream.and_then(|(t, i)| i.resolve(t, begin.toguid));

    // A full stream or a clone clobbers the destination rather than
    // extending it.
    let wants_newfs = begin.fromguid == 0 || begin.is_clone();

    let origin = if begin.is_clone() {
        match guid_to_name(engine, &dest, begin.fromguid) {
            Some(name) => Some(name),
            None => {
                return Err(Error::NotFound(format!(
                    "local origin for clone {dest} does not exist"
                )))
            }
        }
    } else {
        None
    };

    // The destination may have been renamed locally since the sender's
    // "from" snapshot; chase guids instead of trusting names.
    if wants_newfs {
        let fs_end = dest.find('@').unwrap_or(dest.len());
        let fs = dest[..fs_end].to_string();
        if let Some(slash) = fs.rfind('/') {
            let parent = &fs[..slash];
            let parent_guid = stream_node.map_or(0, |(n, _)| n.parent_fromsnap_guid);
            if parent_guid != 0 && !engine.dataset_exists(parent) {
                if let Some(found) = guid_to_name(engine, parent, parent_guid) {
                    let parent_fs = match found.find('@') {
                        Some(at) => found[..at].to_string(),
                        None => found,
                    };
                    dest = format!("{parent_fs}{}", &dest[slash..]);
                }
            }
        }
    } else {
        let fs_end = dest.find('@').unwrap_or(dest.len());
        let fs = dest[..fs_end].to_string();
        if !engine.dataset_exists(&fs) {
            if let Some(found) = guid_to_name(engine, &fs, begin.fromguid) {
                let found_fs = match found.find('@') {
                    Some(at) => found[..at].to_string(),
                    None => found,
                };
                dest = format!("{found_fs}{}", &dest[fs_end..]);
            }
        }
    }

    let at = match dest.find('@') {
        Some(at) => at,
        None => return Err(Error::InvalidName(dest)),
    };
    let fs = dest[..at].to_string();

    let mut newfs = false;
    let mut remount = false;
    if engine.dataset_exists(&fs) {
        let stat = engine.stat(&fs)?;
        if wants_newfs {
            if !flags.force {
                return Err(Error::Exists(format!(
                    "destination '{fs}' exists; it must be destroyed or forcibly overwritten"
                )));
            }
            let snaps = engine.snapshots(&fs)?;
            if let Some(first) = snaps.first() {
                return Err(Error::Exists(format!(
                    "destination has snapshots (eg. {fs}@{}); they must be destroyed first",
                    first.name
                )));
            }
            if stat.origin.is_some() {
                return Err(Error::Exists(format!(
                    "destination '{fs}' is a clone; it must be destroyed first"
                )));
            }
            if !flags.dry_run {
                let _ = engine.unmount(&fs);
            }
        } else if !flags.dry_run {
            // An incoming mountpoint value remounts the filesystem
            // somewhere else; unmount the old place first.
            let current = engine
                .props(&fs)?
                .get("mountpoint")
                .map(|p| p.value.clone());
            let incoming = match overrides.get("mountpoint") {
                Some(PropOverride::Set(v)) => Some(v.clone()),
                Some(PropOverride::KeepLocal) => current.clone(),
                None => stream_node
                    .and_then(|(n, _)| n.props.get("mountpoint").cloned())
                    .or_else(|| current.clone()),
            };
            if incoming != current && engine.is_mounted(&fs) {
                let _ = engine.unmount(&fs);
                remount = true;
            }
        }
    } else {
        if !wants_newfs || !fs.contains('/') {
            let what = if wants_newfs {
                "stream"
            } else {
                "incremental stream"
            };
            return Err(Error::NotFound(format!(
                "cannot receive {what}: destination '{fs}' does not exist"
            )));
        }
        if flags.name_mode == NameMode::Prefix && !flags.dry_run {
            engine.create_ancestors(&fs)?;
        }
        newfs = true;
    }

    if flags.dry_run {
        tracing::info!(snapshot = %dest, "would receive");
        skip_substream(input, header.swap)?;
        return Ok(SubstreamOutcome {
            received: false,
            bytes: 0,
        });
    }

    // The same snapshot may have landed through a concurrent receive;
    // that is not an error, just nothing left to do.
    if engine.dataset_exists(&fs) {
        if let Ok(snaps) = engine.snapshots(&fs) {
            if snaps.iter().any(|s| s.guid == begin.toguid) {
                tracing::debug!(snapshot = %dest, "destination snapshot already present");
                skip_substream(input, header.swap)?;
                return Ok(SubstreamOutcome {
                    received: false,
                    bytes: 0,
                });
            }
        }
    }

    let mut received_props: BTreeMap<String, PropValue> = stream_node
        .map(|(n, _)| n.props.clone())
        .unwrap_or_default();
    for (name, ov) in overrides {
        if matches!(ov, PropOverride::KeepLocal) {
            received_props.remove(name);
        }
    }

    tracing::info!(snapshot = %dest, incremental = begin.fromguid != 0, "receiving");

    let req = ApplyRequest {
        snapshot: dest.clone(),
        origin,
        raw_begin: header.raw_begin.clone(),
        props: received_props,
        force: flags.force,
    };
    let stats = match engine.apply(&req, input) {
        Ok(stats) => stats,
        Err(Error::Exists(_)) => {
            // The snapshot landed between the preflight and the apply;
            // consume the rest of the substream and move on.
            tracing::debug!(snapshot = %dest, "destination snapshot already present");
            skip_substream(input, header.swap)?;
            if remount {
                let _ = engine.mount(&fs);
            }
            return Ok(SubstreamOutcome {
                received: false,
                bytes: 0,
            });
        }
        Err(e) => {
            if newfs {
                // Leave no half-made filesystem behind.
                let _ = engine.destroy(&fs, false);
            } else if remount {
                let _ = engine.mount(&fs);
            }
            return Err(e);
        }
    };

    // Snapshot properties ride in the package header, not the
    // substream; stamp them now that the snapshot exists.
    if let Some((node, sname)) = stream_node {
        if let Some(sp) = node.snapprops.get(sname) {
            if !sp.is_empty() {
                if let Err(e) = engine.set_props(&dest, sp, true) {
                    tracing::debug!(snapshot = %dest, error = %e,
                        "could not set received snapshot properties");
                }
            }
        }
    }

    // Command-line overrides become local values on top of the
    // received layer.
    let locals: BTreeMap<String, PropValue> = overrides
        .iter()
        .filter_map(|(k, v)| match v {
            PropOverride::Set(val) => Some((k.clone(), val.clone())),
            PropOverride::KeepLocal => None,
        })
        .collect();
    if !locals.is_empty() {
        engine.set_props(&fs, &locals, false)?;
    }

    if remount {
        let _ = engine.mount(&fs);
    }

    if top_fs.is_none() {
        let kind = engine.stat(&fs)?.kind;
        if kind == DatasetKind::Filesystem {
            *top_fs = Some(fs);
        }
    }

    Ok(SubstreamOutcome {
        received: true,
        bytes: stats.bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_destination_appends_suffix() {
        let d = destination(
            "backup/data",
            "tank/data/sub@s1",
            "tank/data",
            NameMode::Exact,
            true,
        )
        .unwrap();
        assert_eq!(d, "backup/data/sub@s1");
    }

    #[test]
    fn exact_snapshot_destination_replaces_name() {
        let d = destination("backup/data@x", "tank/data@s1", "tank/data", NameMode::Exact, false)
            .unwrap();
        assert_eq!(d, "backup/data@x");
    }

    #[test]
    fn snapshot_destination_rejected_for_package() {
        match destination("backup/data@x", "tank/data@s1", "tank/data", NameMode::Exact, true) {
            Err(Error::BadStream(_)) => {}
            other => panic!("expected BadStream, got {other:?}"),
        }
    }

    #[test]
    fn prefix_destination_drops_sender_pool() {
        let d = destination(
            "backup",
            "tank/data/sub@s1",
            "tank/data",
            NameMode::Prefix,
            true,
        )
        .unwrap();
        assert_eq!(d, "backup/data/sub@s1");

        // Pool-level sender snapshot keeps only the snap part.
        let d = destination("backup", "tank@s1", "tank", NameMode::Prefix, false).unwrap();
        assert_eq!(d, "backup@s1");
    }

    #[test]
    fn tail_destination_keeps_last_component() {
        let d = destination(
            "backup",
            "tank/data/sub@s1",
            "tank/data/sub",
            NameMode::Tail,
            false,
        )
        .unwrap();
        assert_eq!(d, "backup/sub@s1");

        let d = destination("backup", "tank@s1", "tank", NameMode::Tail, false).unwrap();
        assert_eq!(d, "backup/tank@s1");
    }

    #[test]
    fn snapshot_target_invalid_with_prefix_modes() {
        for mode in [NameMode::Prefix, NameMode::Tail] {
            match destination("backup@x", "tank/data@s1", "tank/data", mode, false) {
                Err(Error::InvalidName(_)) => {}
                other => panic!("expected InvalidName, got {other:?}"),
            }
        }
    }

    #[test]
    fn toname_outside_stream_filesystem_rejected() {
        // An inner header whose name is shorter than (or unrelated to)
        // the package filesystem must not be spliced onto the target.
        for mode in [NameMode::Exact, NameMode::Tail] {
            match destination("backup/data", "a@s", "tank/data", mode, true) {
                Err(Error::BadStream(_)) => {}
                other => panic!("expected BadStream, got {other:?}"),
            }
            match destination("backup/data", "other/fs@s", "tank/data", mode, true) {
                Err(Error::BadStream(_)) => {}
                other => panic!("expected BadStream, got {other:?}"),
            }
        }
    }

    #[test]
    fn name_validation() {
        assert!(validate_snapshot_name("tank/a@s").is_ok());
        assert!(validate_snapshot_name("tank/a").is_err());
        assert!(validate_snapshot_name("tank//a@s").is_err());
        assert!(validate_snapshot_name("@s").is_err());
        assert!(validate_snapshot_name("tank/a@").is_err());
        assert!(validate_snapshot_name(&format!("tank/{}@s", "x".repeat(300))).is_err());
    }
}
