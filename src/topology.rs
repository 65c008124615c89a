//! Dataset topology gathering.
//!
//! A `Topology` is the packed header of a compound stream and the
//! reconciler's picture of either side: every filesystem in scope with
//! its properties, creation-ordered snapshots, per-snapshot properties,
//! clone origin and the guid of the "from" snapshot in its parent.
//! A `GuidIndex` maps any snapshot guid back to its containing
//! filesystem and short name.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::engine::{prop_is_quota_class, prop_is_readonly, PoolEngine, Prop, PropSource, PropValue};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapEntry {
    /// Short name, after the `@`.
    pub name: String,
    pub guid: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsNode {
    /// Full name at the gathering side.
    pub name: String,
    pub guid: u64,
    /// Guid of the "from" snapshot in this filesystem's parent; zero
    /// for the root of the gather or a non-incremental one.
    pub parent_fromsnap_guid: u64,
    /// Guid of the clone origin snapshot, if this is a clone.
    pub origin: Option<u64>,
    pub props: BTreeMap<String, PropValue>,
    /// Creation order.
    pub snaps: Vec<SnapEntry>,
    pub snapprops: BTreeMap<String, BTreeMap<String, PropValue>>,
}

impl FsNode {
    pub fn snap_guid(&self, name: &str) -> Option<u64> {
        self.snaps.iter().find(|s| s.name == name).map(|s| s.guid)
    }

    pub fn has_snap_guid(&self, guid: u64) -> bool {
        self.snaps.iter().any(|s| s.guid == guid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub fromsnap: Option<String>,
    pub tosnap: Option<String>,
    pub recursive: bool,
    /// Depth-first, parents before children.
    pub nodes: Vec<FsNode>,
}

impl Topology {
    pub fn fs_by_guid(&self, guid: u64) -> Option<&FsNode> {
        self.nodes.iter().find(|n| n.guid == guid)
    }

    pub fn fs_by_name(&self, name: &str) -> Option<&FsNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Pack for the compound stream header.
    pub fn pack(&self) -> Result<Bytes> {
        let buf = bincode::serialize(self)
            .map_err(|e| Error::NoMemory(format!("couldn't pack topology: {e}")))?;
        Ok(Bytes::from(buf))
    }

    pub fn unpack(buf: &[u8]) -> Result<Topology> {
        bincode::deserialize(buf)
            .map_err(|e| Error::BadStream(format!("malformed topology header: {e}")))
    }

    pub fn index(&self) -> GuidIndex {
        let mut snaps = BTreeMap::new();
        for node in &self.nodes {
            for snap in &node.snaps {
                // Duplicate guids keep the first entry seen.
                snaps.entry(snap.guid).or_insert_with(|| SnapLocation {
                    fs_guid: node.guid,
                    snap_name: snap.name.clone(),
                });
            }
        }
        GuidIndex { snaps }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapLocation {
    pub fs_guid: u64,
    pub snap_name: String,
}

/// Snapshot guid -> containing filesystem, for both sides of a
/// replication.
#[derive(Debug, Clone, Default)]
pub struct GuidIndex {
    snaps: BTreeMap<u64, SnapLocation>,
}

impl GuidIndex {
    pub fn find(&self, snap_guid: u64) -> Option<&SnapLocation> {
        self.snaps.get(&snap_guid)
    }

    pub fn contains(&self, snap_guid: u64) -> bool {
        self.snaps.contains_key(&snap_guid)
    }

    /// Resolve a snapshot guid to `(filesystem node, snapshot name)`.
    pub fn resolve<'t>(&self, topo: &'t Topology, snap_guid: u64) -> Option<(&'t FsNode, &str)> {
        let loc = self.snaps.get(&snap_guid)?;
        let node = topo.fs_by_guid(loc.fs_guid)?;
        Some((node, loc.snap_name.as_str()))
    }
}

/// Walk `root` (and children when `recursive`) building the topology.
///
/// `received` selects received rather than effective property values
/// when the dataset has a received layer (`send -b` semantics). Any
/// engine failure aborts the whole gather.
pub fn gather(
    engine: &dyn PoolEngine,
    root: &str,
    fromsnap: Option<&str>,
    tosnap: Option<&str>,
    recursive: bool,
    received: bool,
) -> Result<Topology> {
    if root.contains('@') || !engine.dataset_exists(root) {
        return Err(Error::BadType(root.to_string()));
    }

    let mut topo = Topology {
        fromsnap: fromsnap.map(str::to_string),
        tosnap: tosnap.map(str::to_string),
        recursive,
        nodes: Vec::new(),
    };
    iterate_fs(engine, root, 0, fromsnap, tosnap, recursive, received, &mut topo)?;
    Ok(topo)
}

#[allow(clippy::too_many_arguments)]
fn iterate_fs(
    engine: &dyn PoolEngine,
    name: &str,
    parent_fromsnap_guid: u64,
    fromsnap: Option<&str>,
    tosnap: Option<&str>,
    recursive: bool,
    received: bool,
    topo: &mut Topology,
) -> Result<()> {
    let stat = engine.stat(name)?;

    let origin = match &stat.origin {
        Some(origin_snap) => Some(engine.stat(origin_snap)?.guid),
        None => None,
    };

    let props = select_props(engine, name, received, false)?;

    // Determine the guid this fs contributes as "parentfromsnap" for
    // its children: the fromsnap if present, else the tosnap (a newly
    // created fs in an incremental replication has no fromsnap).
    let mut own_fromsnap_guid = 0u64;
    let mut snaps = Vec::new();
    let mut snapprops = BTreeMap::new();
    for snap in engine.snapshots(name)? {
        if fromsnap == Some(snap.name.as_str())
            || (own_fromsnap_guid == 0 && tosnap == Some(snap.name.as_str()))
        {
            own_fromsnap_guid = snap.guid;
        }
        let full = format!("{name}@{}", snap.name);
        let sp = filter_props(engine.snapshot_props(&full)?, name, true);
        snapprops.insert(snap.name.clone(), sp);
        snaps.push(SnapEntry {
            name: snap.name,
            guid: snap.guid,
        });
    }

    topo.nodes.push(FsNode {
        name: name.to_string(),
        guid: stat.guid,
        parent_fromsnap_guid,
        origin,
        props,
        snaps,
        snapprops,
    });

    if recursive {
        for child in engine.children(name)? {
            iterate_fs(
                engine,
                &child,
                own_fromsnap_guid,
                fromsnap,
                tosnap,
                recursive,
                received,
                topo,
            )?;
        }
    }

    Ok(())
}

fn select_props(
    engine: &dyn PoolEngine,
    name: &str,
    received: bool,
    snapshot: bool,
) -> Result<BTreeMap<String, PropValue>> {
    // Sending received values only makes sense once the dataset has a
    // received layer; before that the effective values are the
    // originals.
    let props = if received {
        let recvd = engine.received_props(name)?;
        if recvd.is_empty() {
            engine.props(name)?
        } else {
            recvd
        }
    } else {
        engine.props(name)?
    };
    Ok(filter_props(props, name, snapshot))
}

fn filter_props(
    props: BTreeMap<String, Prop>,
    _name: &str,
    snapshot: bool,
) -> BTreeMap<String, PropValue> {
    let mut out = BTreeMap::new();
    for (pname, prop) in props {
        let user_prop = pname.contains(':');
        if !user_prop {
            // Encryption is set-once and reads as readonly, but it has
            // to travel so the received prop set stays consistent.
            if pname != "encryption" && prop_is_readonly(&pname) {
                continue;
            }
            if prop_is_quota_class(&pname) && snapshot {
                continue;
            }
        }
        // Only values set here or received here travel; inherited and
        // default values are reconstructed on the other side.
        if !matches!(prop.source, PropSource::Local | PropSource::Received) {
            continue;
        }
        out.insert(pname, prop.value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, guid: u64, snaps: &[(&str, u64)]) -> FsNode {
        FsNode {
            name: name.into(),
            guid,
            parent_fromsnap_guid: 0,
            origin: None,
            props: BTreeMap::new(),
            snaps: snaps
                .iter()
                .map(|(n, g)| SnapEntry {
                    name: (*n).into(),
                    guid: *g,
                })
                .collect(),
            snapprops: BTreeMap::new(),
        }
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let topo = Topology {
            fromsnap: Some("base".into()),
            tosnap: Some("latest".into()),
            recursive: true,
            nodes: vec![
                node("tank/a", 10, &[("base", 100), ("latest", 101)]),
                node("tank/a/b", 11, &[("latest", 111)]),
            ],
        };
        let packed = topo.pack().unwrap();
        assert_eq!(Topology::unpack(&packed).unwrap(), topo);
    }

    #[test]
    fn unpack_garbage_is_bad_stream() {
        match Topology::unpack(&[0xff; 7]) {
            Err(Error::BadStream(_)) => {}
            other => panic!("expected BadStream, got {other:?}"),
        }
    }

    #[test]
    fn index_first_seen_wins_on_duplicate_guid() {
        let topo = Topology {
            fromsnap: None,
            tosnap: None,
            recursive: true,
            nodes: vec![
                node("tank/a", 10, &[("snap", 500)]),
                node("tank/b", 11, &[("other", 500)]),
            ],
        };
        let index = topo.index();
        let loc = index.find(500).unwrap();
        assert_eq!(loc.fs_guid, 10);
        assert_eq!(loc.snap_name, "snap");
    }

    #[test]
    fn resolve_returns_node_and_name() {
        let topo = Topology {
            fromsnap: None,
            tosnap: None,
            recursive: false,
            nodes: vec![node("tank/a", 10, &[("s1", 100), ("s2", 101)])],
        };
        let index = topo.index();
        let (fs, snap) = index.resolve(&topo, 101).unwrap();
        assert_eq!(fs.name, "tank/a");
        assert_eq!(snap, "s2");
        assert!(index.resolve(&topo, 999).is_none());
    }

    #[test]
    fn filter_drops_inherited_and_readonly() {
        let mut props = BTreeMap::new();
        props.insert(
            "compression".to_string(),
            Prop::local(PropValue::String("on".into())),
        );
        props.insert(
            "guid".to_string(),
            Prop::local(PropValue::Number(42)),
        );
        props.insert(
            "atime".to_string(),
            Prop {
                value: PropValue::String("off".into()),
                source: PropSource::Inherited,
            },
        );
        props.insert(
            "quota".to_string(),
            Prop::local(PropValue::Number(1 << 30)),
        );
        props.insert(
            "com.example:note".to_string(),
            Prop::local(PropValue::String("kept".into())),
        );

        let fs = filter_props(props.clone(), "tank/a", false);
        assert!(fs.contains_key("compression"));
        assert!(fs.contains_key("quota"));
        assert!(fs.contains_key("com.example:note"));
        assert!(!fs.contains_key("guid"));
        assert!(!fs.contains_key("atime"));

        let snap = filter_props(props, "tank/a", true);
        assert!(!snap.contains_key("quota"));
    }
}
