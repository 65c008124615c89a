//! In-memory pool engine.
//!
//! `MemPool` implements [`PoolEngine`] over plain maps: datasets keyed
//! by name, block data keyed by `(object, offset)`. It exists so the
//! whole send/receive path can run in tests without a kernel, but it
//! honors the semantics the orchestration relies on: creation-ordered
//! snapshots, guid stability across renames, clone origins, holds that
//! keep snapshots alive, and checksum-verified substream replay.

use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::engine::{
    ApplyRequest, ApplyStats, DatasetStat, PoolEngine, Prop, PropValue, SnapshotStat,
};
use crate::error::{Error, Result};
use crate::stream::checksum::{content_checksum, ContentChecksum, Fletcher4};
use crate::stream::record::{
    magic_is_swapped, versioninfo, BeginFlags, BeginRecord, ChecksumFlags, Codec, DatasetKind,
    EndRecord, FeatureFlags, FreeObjectsRecord, FreeRecord, HeaderKind, ObjectRecord, Record,
    SpillRecord, WriteRecord, STREAM_MAGIC, TONAME_LEN,
};

/// Spill blocks ride in the block map at a reserved offset.
const SPILL_OFFSET: u64 = u64::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ObjectMeta {
    dnode_type: u32,
    bonus_type: u32,
    blksz: u32,
    bonus: Bytes,
}

impl Default for ObjectMeta {
    fn default() -> Self {
        ObjectMeta {
            dnode_type: 0x13,
            bonus_type: 0x11,
            blksz: 4096,
            bonus: Bytes::new(),
        }
    }
}

type BlockMap = BTreeMap<(u64, u64), Bytes>;

#[derive(Debug, Clone)]
struct Snapshot {
    name: String,
    guid: u64,
    createtxg: u64,
    objects: BTreeMap<u64, ObjectMeta>,
    data: BlockMap,
    local_props: BTreeMap<String, PropValue>,
    received_props: BTreeMap<String, PropValue>,
    holds: BTreeSet<String>,
    defer_destroy: bool,
}

#[derive(Debug, Clone)]
struct Dataset {
    guid: u64,
    createtxg: u64,
    kind: DatasetKind,
    /// Full snapshot name of the clone origin.
    origin: Option<String>,
    local_props: BTreeMap<String, PropValue>,
    received_props: BTreeMap<String, PropValue>,
    objects: BTreeMap<u64, ObjectMeta>,
    data: BlockMap,
    snaps: Vec<Snapshot>,
    mounted: bool,
}

impl Dataset {
    fn snap(&self, name: &str) -> Option<&Snapshot> {
        self.snaps.iter().find(|s| s.name == name)
    }

    fn snap_mut(&mut self, name: &str) -> Option<&mut Snapshot> {
        self.snaps.iter_mut().find(|s| s.name == name)
    }
}

#[derive(Debug, Default)]
struct Inner {
    datasets: BTreeMap<String, Dataset>,
    next_txg: u64,
}

/// Guids identify datasets across pools, so they come from a
/// process-global counter rather than a per-pool one.
fn next_guid() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(0x1000);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

impl Inner {
    fn txg(&mut self) -> u64 {
        self.next_txg += 1;
        self.next_txg
    }

    fn dataset(&self, name: &str) -> Result<&Dataset> {
        self.datasets
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("dataset does not exist: {name}")))
    }

    fn dataset_mut(&mut self, name: &str) -> Result<&mut Dataset> {
        self.datasets
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("dataset does not exist: {name}")))
    }

    /// Find the snapshot with `guid` anywhere in the pool.
    fn snapshot_by_guid(&self, guid: u64) -> Option<(&str, &Snapshot)> {
        for (name, ds) in &self.datasets {
            for snap in &ds.snaps {
                if snap.guid == guid {
                    return Some((name.as_str(), snap));
                }
            }
        }
        None
    }

    fn children_of(&self, name: &str) -> Vec<String> {
        let prefix = format!("{name}/");
        self.datasets
            .keys()
            .filter(|k| {
                k.starts_with(&prefix) && !k[prefix.len()..].contains('/')
            })
            .cloned()
            .collect()
    }

    fn has_clones(&self, snapshot: &str) -> bool {
        self.datasets
            .values()
            .any(|ds| ds.origin.as_deref() == Some(snapshot))
    }
}

fn split_snap(name: &str) -> Option<(&str, &str)> {
    let at = name.find('@')?;
    Some((&name[..at], &name[at + 1..]))
}

/// An in-memory pool. Cheap to create, safe to share across threads.
#[derive(Debug, Default)]
pub struct MemPool {
    inner: Mutex<Inner>,
}

impl MemPool {
    pub fn new() -> Self {
        MemPool::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Create a filesystem; ancestors must already exist except for a
    /// pool root.
    pub fn create_fs(&self, name: &str) -> Result<()> {
        self.create_dataset(name, DatasetKind::Filesystem)
    }

    pub fn create_volume(&self, name: &str) -> Result<()> {
        self.create_dataset(name, DatasetKind::Volume)
    }

    fn create_dataset(&self, name: &str, kind: DatasetKind) -> Result<()> {
        let mut inner = self.lock();
        if inner.datasets.contains_key(name) {
            return Err(Error::Exists(name.to_string()));
        }
        if let Some(slash) = name.rfind('/') {
            if !inner.datasets.contains_key(&name[..slash]) {
                return Err(Error::NotFound(format!(
                    "parent does not exist: {}",
                    &name[..slash]
                )));
            }
        }
        let guid = next_guid();
        let createtxg = inner.txg();
        inner.datasets.insert(
            name.to_string(),
            Dataset {
                guid,
                createtxg,
                kind,
                origin: None,
                local_props: BTreeMap::new(),
                received_props: BTreeMap::new(),
                objects: BTreeMap::new(),
                data: BlockMap::new(),
                snaps: Vec::new(),
                mounted: kind == DatasetKind::Filesystem,
            },
        );
        Ok(())
    }

    /// Take a snapshot of `fs` named `snap`.
    pub fn snapshot(&self, fs: &str, snap: &str) -> Result<u64> {
        let mut inner = self.lock();
        let guid = next_guid();
        let createtxg = inner.txg();
        let ds = inner.dataset_mut(fs)?;
        if ds.snap(snap).is_some() {
            return Err(Error::Exists(format!("{fs}@{snap}")));
        }
        ds.snaps.push(Snapshot {
            name: snap.to_string(),
            guid,
            createtxg,
            objects: ds.objects.clone(),
            data: ds.data.clone(),
            local_props: BTreeMap::new(),
            received_props: BTreeMap::new(),
            holds: BTreeSet::new(),
            defer_destroy: false,
        });
        Ok(guid)
    }

    /// Clone `origin` (a full snapshot name) into a new filesystem.
    pub fn clone_from(&self, origin: &str, newfs: &str) -> Result<()> {
        let mut inner = self.lock();
        let (ofs, osnap) = split_snap(origin)
            .ok_or_else(|| Error::BadType(origin.to_string()))?;
        let (objects, data, kind) = {
            let ds = inner.dataset(ofs)?;
            let snap = ds
                .snap(osnap)
                .ok_or_else(|| Error::NotFound(origin.to_string()))?;
            (snap.objects.clone(), snap.data.clone(), ds.kind)
        };
        if inner.datasets.contains_key(newfs) {
            return Err(Error::Exists(newfs.to_string()));
        }
        if let Some(slash) = newfs.rfind('/') {
            if !inner.datasets.contains_key(&newfs[..slash]) {
                return Err(Error::NotFound(format!(
                    "parent does not exist: {}",
                    &newfs[..slash]
                )));
            }
        }
        let guid = next_guid();
        let createtxg = inner.txg();
        inner.datasets.insert(
            newfs.to_string(),
            Dataset {
                guid,
                createtxg,
                kind,
                origin: Some(origin.to_string()),
                local_props: BTreeMap::new(),
                received_props: BTreeMap::new(),
                objects,
                data,
                snaps: Vec::new(),
                mounted: kind == DatasetKind::Filesystem,
            },
        );
        Ok(())
    }

    /// Write a block into the live tree of `fs`, creating the object
    /// record if needed.
    pub fn write_block(&self, fs: &str, object: u64, offset: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        let ds = inner.dataset_mut(fs)?;
        ds.objects.entry(object).or_default();
        ds.data
            .insert((object, offset), Bytes::copy_from_slice(data));
        Ok(())
    }

    pub fn free_block(&self, fs: &str, object: u64, offset: u64) -> Result<()> {
        let mut inner = self.lock();
        let ds = inner.dataset_mut(fs)?;
        ds.data.remove(&(object, offset));
        Ok(())
    }

    /// Read a block from a live tree or a snapshot.
    pub fn read_block(&self, name: &str, object: u64, offset: u64) -> Option<Bytes> {
        let inner = self.lock();
        match split_snap(name) {
            Some((fs, snap)) => inner
                .datasets
                .get(fs)?
                .snap(snap)?
                .data
                .get(&(object, offset))
                .cloned(),
            None => inner.datasets.get(name)?.data.get(&(object, offset)).cloned(),
        }
    }

    pub fn set_local_prop(&self, name: &str, prop: &str, value: PropValue) -> Result<()> {
        let mut props = BTreeMap::new();
        props.insert(prop.to_string(), value);
        self.set_props(name, &props, false)
    }

    fn effective_props(ds: &Dataset, name: &str) -> BTreeMap<String, Prop> {
        let mut out = BTreeMap::new();
        out.insert(
            "mountpoint".to_string(),
            Prop {
                value: PropValue::String(format!("/{name}")),
                source: crate::engine::PropSource::Default,
            },
        );
        for (k, v) in &ds.received_props {
            out.insert(k.clone(), Prop::received(v.clone()));
        }
        for (k, v) in &ds.local_props {
            out.insert(k.clone(), Prop::local(v.clone()));
        }
        out
    }
}

impl PoolEngine for MemPool {
    fn dataset_exists(&self, name: &str) -> bool {
        let inner = self.lock();
        match split_snap(name) {
            Some((fs, snap)) => inner
                .datasets
                .get(fs)
                .map_or(false, |ds| ds.snap(snap).is_some()),
            None => inner.datasets.contains_key(name),
        }
    }

    fn stat(&self, name: &str) -> Result<DatasetStat> {
        let inner = self.lock();
        match split_snap(name) {
            Some((fs, snap)) => {
                let ds = inner.dataset(fs)?;
                let s = ds
                    .snap(snap)
                    .ok_or_else(|| Error::NotFound(name.to_string()))?;
                Ok(DatasetStat {
                    name: name.to_string(),
                    guid: s.guid,
                    createtxg: s.createtxg,
                    kind: ds.kind,
                    origin: None,
                })
            }
            None => {
                let ds = inner.dataset(name)?;
                Ok(DatasetStat {
                    name: name.to_string(),
                    guid: ds.guid,
                    createtxg: ds.createtxg,
                    kind: ds.kind,
                    origin: ds.origin.clone(),
                })
            }
        }
    }

    fn children(&self, name: &str) -> Result<Vec<String>> {
        let inner = self.lock();
        inner.dataset(name)?;
        Ok(inner.children_of(name))
    }

    fn snapshots(&self, name: &str) -> Result<Vec<SnapshotStat>> {
        let inner = self.lock();
        let ds = inner.dataset(name)?;
        Ok(ds
            .snaps
            .iter()
            .filter(|s| !s.defer_destroy)
            .map(|s| SnapshotStat {
                name: s.name.clone(),
                guid: s.guid,
                createtxg: s.createtxg,
            })
            .collect())
    }

    fn props(&self, name: &str) -> Result<BTreeMap<String, Prop>> {
        let inner = self.lock();
        let ds = inner.dataset(name)?;
        Ok(MemPool::effective_props(ds, name))
    }

    fn received_props(&self, name: &str) -> Result<BTreeMap<String, Prop>> {
        let inner = self.lock();
        let ds = inner.dataset(name)?;
        Ok(ds
            .received_props
            .iter()
            .map(|(k, v)| (k.clone(), Prop::received(v.clone())))
            .collect())
    }

    fn snapshot_props(&self, snapshot: &str) -> Result<BTreeMap<String, Prop>> {
        let inner = self.lock();
        let (fs, snap) = split_snap(snapshot)
            .ok_or_else(|| Error::BadType(snapshot.to_string()))?;
        let ds = inner.dataset(fs)?;
        let s = ds
            .snap(snap)
            .ok_or_else(|| Error::NotFound(snapshot.to_string()))?;
        let mut out = BTreeMap::new();
        for (k, v) in &s.received_props {
            out.insert(k.clone(), Prop::received(v.clone()));
        }
        for (k, v) in &s.local_props {
            out.insert(k.clone(), Prop::local(v.clone()));
        }
        Ok(out)
    }

    fn set_props(
        &self,
        name: &str,
        props: &BTreeMap<String, PropValue>,
        received: bool,
    ) -> Result<()> {
        let mut inner = self.lock();
        match split_snap(name) {
            Some((fs, snap)) => {
                let ds = inner.dataset_mut(fs)?;
                let s = ds
                    .snap_mut(snap)
                    .ok_or_else(|| Error::NotFound(name.to_string()))?;
                let layer = if received {
                    &mut s.received_props
                } else {
                    &mut s.local_props
                };
                for (k, v) in props {
                    layer.insert(k.clone(), v.clone());
                }
            }
            None => {
                let ds = inner.dataset_mut(name)?;
                let layer = if received {
                    &mut ds.received_props
                } else {
                    &mut ds.local_props
                };
                for (k, v) in props {
                    layer.insert(k.clone(), v.clone());
                }
            }
        }
        Ok(())
    }

    fn send_changes(
        &self,
        tosnap: &str,
        from: Option<&str>,
        from_origin: bool,
        out: &mut dyn Write,
    ) -> Result<()> {
        if tosnap.len() >= TONAME_LEN {
            return Err(Error::InvalidName(tosnap.to_string()));
        }
        let inner = self.lock();
        let (fs, snap) = split_snap(tosnap)
            .ok_or_else(|| Error::BadType(tosnap.to_string()))?;
        let ds = inner.dataset(fs)?;
        let to = ds
            .snap(snap)
            .ok_or_else(|| Error::NotFound(tosnap.to_string()))?;

        let mut flags = BeginFlags::empty();
        // from_origin on a non-clone degrades to a full stream.
        let (fromguid, base_objects, base_data): (u64, _, _) = if let Some(short) = from {
            let f = ds.snap(short).ok_or_else(|| {
                Error::NotFound(format!("incremental source (@{short}) does not exist"))
            })?;
            (f.guid, f.objects.clone(), f.data.clone())
        } else if let Some(origin) = ds.origin.as_deref().filter(|_| from_origin) {
            let (ofs, osnap) = split_snap(origin)
                .ok_or_else(|| Error::BadType(origin.to_string()))?;
            let osnap = inner
                .dataset(ofs)?
                .snap(osnap)
                .ok_or_else(|| Error::NotFound(origin.to_string()))?;
            flags |= BeginFlags::CLONE;
            (osnap.guid, osnap.objects.clone(), osnap.data.clone())
        } else {
            (0, BTreeMap::new(), BlockMap::new())
        };

        let codec = Codec::native();
        let mut cksum = Fletcher4::new();
        let emit = |rec: &Record, out: &mut dyn Write, cksum: &mut Fletcher4| -> Result<()> {
            let wire = codec.encode(rec);
            cksum.update(&wire);
            out.write_all(&wire)?;
            Ok(())
        };

        let mut features = FeatureFlags::empty();
        if ds.kind == DatasetKind::Filesystem {
            features |= FeatureFlags::SA_SPILL;
        }
        emit(
            &Record::Begin(BeginRecord {
                magic: STREAM_MAGIC,
                versioninfo: versioninfo(HeaderKind::Substream, features),
                creation_time: to.createtxg,
                kind: ds.kind,
                flags,
                toguid: to.guid,
                fromguid,
                toname: tosnap.to_string(),
                payload: Bytes::new(),
            }),
            out,
            &mut cksum,
        )?;

        for (object, meta) in &to.objects {
            if base_objects.get(object) == Some(meta) {
                continue;
            }
            emit(
                &Record::Object(ObjectRecord {
                    object: *object,
                    dnode_type: meta.dnode_type,
                    bonus_type: meta.bonus_type,
                    blksz: meta.blksz,
                    toguid: to.guid,
                    bonus: meta.bonus.clone(),
                }),
                out,
                &mut cksum,
            )?;
        }
        for object in base_objects.keys() {
            if !to.objects.contains_key(object) {
                emit(
                    &Record::FreeObjects(FreeObjectsRecord {
                        firstobj: *object,
                        numobjs: 1,
                        toguid: to.guid,
                    }),
                    out,
                    &mut cksum,
                )?;
            }
        }

        for ((object, offset), data) in &to.data {
            if base_data.get(&(*object, *offset)) == Some(data) {
                continue;
            }
            let rec = if *offset == SPILL_OFFSET {
                Record::Spill(SpillRecord {
                    object: *object,
                    toguid: to.guid,
                    data: data.clone(),
                })
            } else {
                Record::Write(WriteRecord {
                    object: *object,
                    offset: *offset,
                    toguid: to.guid,
                    checksum_type: ContentChecksum::Strong256,
                    checksum_flags: ChecksumFlags::DEDUP,
                    key_checksum: content_checksum(data),
                    key_prop: *object,
                    data: data.clone(),
                })
            };
            emit(&rec, out, &mut cksum)?;
        }
        for (object, offset) in base_data.keys() {
            if !to.data.contains_key(&(*object, *offset)) {
                emit(
                    &Record::Free(FreeRecord {
                        object: *object,
                        offset: *offset,
                        length: base_data
                            .get(&(*object, *offset))
                            .map_or(0, |d| d.len() as u64),
                        toguid: to.guid,
                    }),
                    out,
                    &mut cksum,
                )?;
            }
        }

        // The END carries the accumulated checksum and stays out of it.
        let end = Record::End(EndRecord {
            checksum: cksum.value(),
            toguid: to.guid,
        });
        out.write_all(&codec.encode(&end))?;
        Ok(())
    }

    fn apply(&self, req: &ApplyRequest, input: &mut dyn Read) -> Result<ApplyStats> {
        let (fs, snap) = split_snap(&req.snapshot)
            .ok_or_else(|| Error::BadType(req.snapshot.clone()))?;

        // Re-read the sender's BEGIN to learn byte order, guids and the
        // clone flag.
        let magic_probe = {
            let mut b = [0u8; 8];
            if req.raw_begin.len() < 16 {
                return Err(Error::BadStream("short begin record".into()));
            }
            b.copy_from_slice(&req.raw_begin[8..16]);
            u64::from_ne_bytes(b)
        };
        let swap = magic_is_swapped(magic_probe)
            .ok_or_else(|| Error::BadStream("bad magic number".into()))?;
        let codec = if swap { Codec::swapped() } else { Codec::native() };
        let begin = {
            let mut rd = &req.raw_begin[..];
            match codec.read_record(&mut rd)? {
                Some(raw) => match raw.record {
                    Record::Begin(b) => b,
                    _ => return Err(Error::BadStream("expected begin record".into())),
                },
                None => return Err(Error::BadStream("short begin record".into())),
            }
        };

        let mut cksum = Fletcher4::new();
        if swap {
            cksum.update_byteswap(&req.raw_begin);
        } else {
            cksum.update(&req.raw_begin);
        }

        // Stage the working tree the records replay onto.
        let (mut objects, mut data) = {
            let inner = self.lock();
            if begin.fromguid != 0 && !begin.is_clone() {
                let ds = inner.dataset(fs)?;
                if ds.snap(snap).is_some() {
                    return Err(Error::Exists(req.snapshot.clone()));
                }
                let newest = ds
                    .snaps
                    .iter()
                    .rev()
                    .find(|s| !s.defer_destroy)
                    .ok_or_else(|| {
                        Error::NotFound(format!(
                            "most recent snapshot of {fs} does not match incremental source"
                        ))
                    })?;
                if newest.guid != begin.fromguid {
                    return Err(Error::NotFound(format!(
                        "most recent snapshot of {fs} does not match incremental source"
                    )));
                }
                // An incremental replays on top of the from snapshot;
                // local changes after it are discarded (the caller
                // checked force).
                (newest.objects.clone(), newest.data.clone())
            } else if let Some(origin) = &req.origin {
                let (ofs, osnap) = split_snap(origin)
                    .ok_or_else(|| Error::BadType(origin.clone()))?;
                let snapref = inner
                    .dataset(ofs)?
                    .snap(osnap)
                    .ok_or_else(|| Error::NotFound(origin.clone()))?;
                (snapref.objects.clone(), snapref.data.clone())
            } else {
                if let Some(ds) = inner.datasets.get(fs) {
                    if ds.snap(snap).is_some() {
                        return Err(Error::Exists(req.snapshot.clone()));
                    }
                }
                (BTreeMap::new(), BlockMap::new())
            }
        };

        let mut bytes = 0u64;
        let end = loop {
            let raw = codec
                .read_record(input)?
                .ok_or_else(|| Error::BadStream("failed to read from stream".into()))?;
            match raw.record {
                Record::End(e) => break e,
                _ => {
                    if swap {
                        cksum.update_byteswap(&raw.bytes);
                    } else {
                        cksum.update(&raw.bytes);
                    }
                }
            }
            match raw.record {
                Record::Begin(_) => {
                    return Err(Error::BadStream("invalid substream header".into()))
                }
                Record::Object(r) => {
                    if r.toguid != begin.toguid {
                        return Err(Error::BadStream("record for wrong snapshot".into()));
                    }
                    objects.insert(
                        r.object,
                        ObjectMeta {
                            dnode_type: r.dnode_type,
                            bonus_type: r.bonus_type,
                            blksz: r.blksz,
                            bonus: r.bonus,
                        },
                    );
                }
                Record::FreeObjects(r) => {
                    let last = r.firstobj.saturating_add(r.numobjs);
                    objects.retain(|o, _| *o < r.firstobj || *o >= last);
                    data.retain(|(o, _), _| *o < r.firstobj || *o >= last);
                }
                Record::Write(r) => {
                    if r.checksum_type == ContentChecksum::Strong256
                        && content_checksum(&r.data) != r.key_checksum
                    {
                        return Err(Error::BadStream("checksum mismatch".into()));
                    }
                    bytes += r.data.len() as u64;
                    data.insert((r.object, r.offset), r.data);
                }
                Record::WriteByref(r) => {
                    let block = if r.refguid == begin.toguid {
                        data.get(&(r.refobject, r.refoffset)).cloned()
                    } else {
                        let inner = self.lock();
                        inner
                            .snapshot_by_guid(r.refguid)
                            .and_then(|(_, s)| s.data.get(&(r.refobject, r.refoffset)).cloned())
                    };
                    let block = block.ok_or_else(|| {
                        Error::BadStream(format!(
                            "backreference to unknown block {:#x}/{}/{}",
                            r.refguid, r.refobject, r.refoffset
                        ))
                    })?;
                    if r.checksum_type == ContentChecksum::Strong256
                        && content_checksum(&block) != r.key_checksum
                    {
                        return Err(Error::BadStream("checksum mismatch".into()));
                    }
                    bytes += block.len() as u64;
                    data.insert((r.object, r.offset), block);
                }
                Record::Free(r) => {
                    data.remove(&(r.object, r.offset));
                }
                Record::Spill(r) => {
                    bytes += r.data.len() as u64;
                    data.insert((r.object, SPILL_OFFSET), r.data);
                }
                Record::End(_) => unreachable!(),
            }
        };

        if end.checksum != cksum.value() {
            return Err(Error::BadStream("checksum mismatch".into()));
        }

        // Commit: the working tree becomes the filesystem's live tree
        // plus a snapshot carrying the sender's guid.
        let mut inner = self.lock();
        let createtxg = inner.txg();
        let kind = begin.kind;
        let origin = req.origin.clone();
        let received = req.props.clone();
        match inner.datasets.get_mut(fs) {
            Some(ds) => {
                if ds.snap(snap).is_some() {
                    return Err(Error::Exists(req.snapshot.clone()));
                }
                ds.objects = objects.clone();
                ds.data = data.clone();
                if begin.fromguid == 0 {
                    // A full stream redefines the filesystem.
                    ds.origin = origin;
                    ds.received_props = received;
                } else {
                    for (k, v) in received {
                        ds.received_props.insert(k, v);
                    }
                }
                ds.snaps.push(Snapshot {
                    name: snap.to_string(),
                    guid: begin.toguid,
                    createtxg,
                    objects,
                    data,
                    local_props: BTreeMap::new(),
                    received_props: BTreeMap::new(),
                    holds: BTreeSet::new(),
                    defer_destroy: false,
                });
            }
            None => {
                if let Some(slash) = fs.rfind('/') {
                    if !inner.datasets.contains_key(&fs[..slash]) {
                        return Err(Error::NotFound(format!(
                            "parent does not exist: {}",
                            &fs[..slash]
                        )));
                    }
                }
                let guid = next_guid();
                let fs_txg = createtxg;
                let snap_txg = inner.txg();
                inner.datasets.insert(
                    fs.to_string(),
                    Dataset {
                        guid,
                        createtxg: fs_txg,
                        kind,
                        origin,
                        local_props: BTreeMap::new(),
                        received_props: received,
                        objects: objects.clone(),
                        data: data.clone(),
                        snaps: vec![Snapshot {
                            name: snap.to_string(),
                            guid: begin.toguid,
                            createtxg: snap_txg,
                            objects,
                            data,
                            local_props: BTreeMap::new(),
                            received_props: BTreeMap::new(),
                            holds: BTreeSet::new(),
                            defer_destroy: false,
                        }],
                        mounted: false,
                    },
                );
            }
        }

        Ok(ApplyStats { bytes })
    }

    fn create_ancestors(&self, name: &str) -> Result<()> {
        let mut missing = Vec::new();
        {
            let inner = self.lock();
            let mut cur = name;
            while let Some(slash) = cur.rfind('/') {
                cur = &cur[..slash];
                if inner.datasets.contains_key(cur) {
                    break;
                }
                missing.push(cur.to_string());
            }
        }
        for ancestor in missing.iter().rev() {
            self.create_fs(ancestor)?;
        }
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut inner = self.lock();
        if let (Some((ffs, fsnap)), Some((tfs, tsnap))) = (split_snap(from), split_snap(to)) {
            if ffs != tfs {
                return Err(Error::CrossTarget(from.to_string(), to.to_string()));
            }
            let ds = inner.dataset_mut(ffs)?;
            if ds.snap(tsnap).is_some() {
                return Err(Error::Exists(to.to_string()));
            }
            let s = ds
                .snap_mut(fsnap)
                .ok_or_else(|| Error::NotFound(from.to_string()))?;
            s.name = tsnap.to_string();
            return Ok(());
        }
        if from.contains('@') != to.contains('@') {
            return Err(Error::BadType(to.to_string()));
        }

        let from_pool = from.split('/').next().unwrap_or(from);
        let to_pool = to.split('/').next().unwrap_or(to);
        if from_pool != to_pool {
            return Err(Error::CrossTarget(from.to_string(), to.to_string()));
        }
        if !inner.datasets.contains_key(from) {
            return Err(Error::NotFound(from.to_string()));
        }
        if inner.datasets.contains_key(to) {
            return Err(Error::Exists(to.to_string()));
        }
        if let Some(slash) = to.rfind('/') {
            if !inner.datasets.contains_key(&to[..slash]) {
                return Err(Error::NotFound(format!(
                    "parent does not exist: {}",
                    &to[..slash]
                )));
            }
        }

        // Move the dataset and every descendant; clone origins pointing
        // into the moved subtree follow it.
        let prefix = format!("{from}/");
        let moved: Vec<String> = inner
            .datasets
            .keys()
            .filter(|k| *k == from || k.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            let new = format!("{to}{}", &old[from.len()..]);
            if let Some(ds) = inner.datasets.remove(&old) {
                inner.datasets.insert(new, ds);
            }
        }
        let origins: Vec<(String, String)> = inner
            .datasets
            .iter()
            .filter_map(|(k, ds)| {
                let o = ds.origin.as_deref()?;
                let ofs = &o[..o.find('@').unwrap_or(o.len())];
                if ofs == from || ofs.starts_with(&prefix) {
                    Some((k.clone(), format!("{to}{}", &o[from.len()..])))
                } else {
                    None
                }
            })
            .collect();
        for (k, new_origin) in origins {
            if let Some(ds) = inner.datasets.get_mut(&k) {
                ds.origin = Some(new_origin);
            }
        }
        Ok(())
    }

    fn destroy(&self, name: &str, defer: bool) -> Result<()> {
        let mut inner = self.lock();
        if let Some((fs, snap)) = split_snap(name) {
            if inner.has_clones(name) {
                return Err(Error::Exists(format!("snapshot has clones: {name}")));
            }
            let ds = inner.dataset_mut(fs)?;
            let idx = ds
                .snaps
                .iter()
                .position(|s| s.name == snap)
                .ok_or_else(|| Error::NotFound(name.to_string()))?;
            if !ds.snaps[idx].holds.is_empty() {
                if defer {
                    ds.snaps[idx].defer_destroy = true;
                    return Ok(());
                }
                return Err(Error::Exists(format!("snapshot is held: {name}")));
            }
            ds.snaps.remove(idx);
            return Ok(());
        }

        if !inner.children_of(name).is_empty() {
            return Err(Error::Exists(format!("filesystem has children: {name}")));
        }
        let ds = inner.dataset(name)?;
        for s in &ds.snaps {
            let full = format!("{name}@{}", s.name);
            if inner.has_clones(&full) {
                return Err(Error::Exists(format!("snapshot has clones: {full}")));
            }
            if !s.holds.is_empty() {
                return Err(Error::Exists(format!("snapshot is held: {full}")));
            }
        }
        inner.datasets.remove(name);
        Ok(())
    }

    fn promote(&self, clone: &str) -> Result<()> {
        let mut inner = self.lock();
        let (ofs, origin_txg, origin_full) = {
            let ds = inner.dataset(clone)?;
            let origin = ds
                .origin
                .clone()
                .ok_or_else(|| Error::BadType(format!("not a clone: {clone}")))?;
            let (ofs, osnap) = split_snap(&origin)
                .ok_or_else(|| Error::BadType(origin.clone()))?;
            let txg = inner
                .dataset(ofs)?
                .snap(osnap)
                .ok_or_else(|| Error::NotFound(origin.clone()))?
                .createtxg;
            (ofs.to_string(), txg, origin)
        };

        // Snapshots up to and including the origin move to the clone;
        // the former origin filesystem becomes a clone of the youngest
        // moved snapshot.
        let moved: Vec<Snapshot> = {
            let ds = inner.dataset_mut(&ofs)?;
            let keep: Vec<Snapshot> = ds
                .snaps
                .iter()
                .filter(|s| s.createtxg > origin_txg)
                .cloned()
                .collect();
            let moved = ds
                .snaps
                .iter()
                .filter(|s| s.createtxg <= origin_txg)
                .cloned()
                .collect();
            ds.snaps = keep;
            moved
        };
        let new_origin_snap = split_snap(&origin_full)
            .map(|(_, s)| s.to_string())
            .ok_or_else(|| Error::BadType(origin_full.clone()))?;

        {
            let ds = inner.dataset_mut(&ofs)?;
            ds.origin = Some(format!("{clone}@{new_origin_snap}"));
        }
        {
            let ds = inner.dataset_mut(clone)?;
            let mut snaps = moved;
            snaps.extend(ds.snaps.drain(..));
            ds.snaps = snaps;
            ds.origin = None;
        }

        // Other clones of the moved snapshots now hang off this one.
        let moved_prefix = format!("{ofs}@");
        let updates: Vec<(String, String)> = inner
            .datasets
            .iter()
            .filter_map(|(k, ds)| {
                if k == clone || k == &ofs {
                    return None;
                }
                let o = ds.origin.as_deref()?;
                if !o.starts_with(&moved_prefix) {
                    return None;
                }
                let snap_name = &o[moved_prefix.len()..];
                let on_clone = inner
                    .datasets
                    .get(clone)
                    .map_or(false, |c| c.snap(snap_name).is_some());
                if on_clone {
                    Some((k.clone(), format!("{clone}@{snap_name}")))
                } else {
                    None
                }
            })
            .collect();
        for (k, new_origin) in updates {
            if let Some(ds) = inner.datasets.get_mut(&k) {
                ds.origin = Some(new_origin);
            }
        }
        Ok(())
    }

    fn hold(&self, snapshot: &str, tag: &str) -> Result<()> {
        let mut inner = self.lock();
        let (fs, snap) = split_snap(snapshot)
            .ok_or_else(|| Error::BadType(snapshot.to_string()))?;
        let ds = inner.dataset_mut(fs)?;
        let s = ds
            .snap_mut(snap)
            .ok_or_else(|| Error::NotFound(snapshot.to_string()))?;
        s.holds.insert(tag.to_string());
        Ok(())
    }

    fn release(&self, snapshot: &str, tag: &str) -> Result<()> {
        let mut inner = self.lock();
        let (fs, snap) = split_snap(snapshot)
            .ok_or_else(|| Error::BadType(snapshot.to_string()))?;
        let ds = inner.dataset_mut(fs)?;
        let idx = ds
            .snaps
            .iter()
            .position(|s| s.name == snap)
            .ok_or_else(|| Error::NotFound(snapshot.to_string()))?;
        ds.snaps[idx].holds.remove(tag);
        if ds.snaps[idx].defer_destroy && ds.snaps[idx].holds.is_empty() {
            ds.snaps.remove(idx);
        }
        Ok(())
    }

    fn is_mounted(&self, name: &str) -> bool {
        let inner = self.lock();
        inner.datasets.get(name).map_or(false, |ds| ds.mounted)
    }

    fn mount(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        let ds = inner.dataset_mut(name)?;
        if ds.kind != DatasetKind::Filesystem {
            return Err(Error::BadType(name.to_string()));
        }
        ds.mounted = true;
        Ok(())
    }

    fn unmount(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        let ds = inner.dataset_mut(name)?;
        ds.mounted = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> MemPool {
        let p = MemPool::new();
        p.create_fs("tank").unwrap();
        p.create_fs("tank/data").unwrap();
        p
    }

    #[test]
    fn snapshots_are_creation_ordered() {
        let p = pool();
        p.write_block("tank/data", 1, 0, b"one").unwrap();
        p.snapshot("tank/data", "s1").unwrap();
        p.write_block("tank/data", 1, 4096, b"two").unwrap();
        p.snapshot("tank/data", "s2").unwrap();
        let snaps = p.snapshots("tank/data").unwrap();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].name, "s1");
        assert!(snaps[0].createtxg < snaps[1].createtxg);
    }

    #[test]
    fn snapshot_data_is_frozen() {
        let p = pool();
        p.write_block("tank/data", 1, 0, b"before").unwrap();
        p.snapshot("tank/data", "s1").unwrap();
        p.write_block("tank/data", 1, 0, b"after").unwrap();
        assert_eq!(
            p.read_block("tank/data@s1", 1, 0).unwrap(),
            Bytes::from_static(b"before")
        );
        assert_eq!(
            p.read_block("tank/data", 1, 0).unwrap(),
            Bytes::from_static(b"after")
        );
    }

    #[test]
    fn rename_moves_descendants_and_origins() {
        let p = pool();
        p.create_fs("tank/data/sub").unwrap();
        p.snapshot("tank/data/sub", "s1").unwrap();
        p.clone_from("tank/data/sub@s1", "tank/clone").unwrap();
        p.rename("tank/data", "tank/moved").unwrap();
        assert!(p.dataset_exists("tank/moved/sub@s1"));
        assert!(!p.dataset_exists("tank/data"));
        assert_eq!(
            p.stat("tank/clone").unwrap().origin.as_deref(),
            Some("tank/moved/sub@s1")
        );
    }

    #[test]
    fn rename_across_pools_refused() {
        let p = pool();
        p.create_fs("other").unwrap();
        match p.rename("tank/data", "other/data") {
            Err(Error::CrossTarget(_, _)) => {}
            other => panic!("expected CrossTarget, got {other:?}"),
        }
    }

    #[test]
    fn held_snapshot_survives_deferred_destroy() {
        let p = pool();
        p.snapshot("tank/data", "s1").unwrap();
        p.hold("tank/data@s1", "keeper").unwrap();
        match p.destroy("tank/data@s1", false) {
            Err(Error::Exists(_)) => {}
            other => panic!("expected Exists, got {other:?}"),
        }
        p.destroy("tank/data@s1", true).unwrap();
        // Deferred: gone from listings, removed for real on release.
        assert!(p.snapshots("tank/data").unwrap().is_empty());
        p.release("tank/data@s1", "keeper").unwrap();
        assert!(!p.dataset_exists("tank/data@s1"));
    }

    #[test]
    fn promote_moves_shared_snapshots() {
        let p = pool();
        p.write_block("tank/data", 1, 0, b"base").unwrap();
        p.snapshot("tank/data", "s1").unwrap();
        p.snapshot("tank/data", "s2").unwrap();
        p.clone_from("tank/data@s1", "tank/clone").unwrap();
        p.promote("tank/clone").unwrap();

        // s1 moved to the clone; s2 stayed (it is newer than the
        // origin snapshot).
        assert!(p.dataset_exists("tank/clone@s1"));
        assert!(!p.dataset_exists("tank/data@s1"));
        assert!(p.dataset_exists("tank/data@s2"));
        assert_eq!(
            p.stat("tank/data").unwrap().origin.as_deref(),
            Some("tank/clone@s1")
        );
        assert!(p.stat("tank/clone").unwrap().origin.is_none());
    }

    #[test]
    fn guids_are_unique_across_pools() {
        let a = pool();
        let b = pool();
        a.snapshot("tank/data", "s1").unwrap();
        b.snapshot("tank/data", "s1").unwrap();
        assert_ne!(
            a.stat("tank/data@s1").unwrap().guid,
            b.stat("tank/data@s1").unwrap().guid
        );
        assert_ne!(
            a.stat("tank/data").unwrap().guid,
            b.stat("tank/data").unwrap().guid
        );
    }

    #[test]
    fn from_origin_on_non_clone_sends_full_stream() {
        let p = pool();
        p.write_block("tank/data", 1, 0, b"whole").unwrap();
        p.snapshot("tank/data", "s1").unwrap();

        let mut buf = Vec::new();
        PoolEngine::send_changes(&p, "tank/data@s1", None, true, &mut buf).unwrap();

        let mut rd = &buf[..];
        let raw = Codec::native().read_record(&mut rd).unwrap().unwrap();
        match raw.record {
            Record::Begin(b) => {
                assert_eq!(b.fromguid, 0);
                assert!(!b.is_clone());
            }
            other => panic!("expected Begin, got {other:?}"),
        }
    }

    #[test]
    fn send_changes_missing_source_is_not_found() {
        let p = pool();
        p.snapshot("tank/data", "s2").unwrap();
        let mut out = Vec::new();
        match PoolEngine::send_changes(&p, "tank/data@s2", Some("nope"), false, &mut out) {
            Err(Error::NotFound(msg)) => assert!(msg.contains("incremental source")),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn substream_roundtrip_between_pools() {
        let src = pool();
        src.write_block("tank/data", 1, 0, b"hello").unwrap();
        src.write_block("tank/data", 2, 8192, b"world").unwrap();
        src.snapshot("tank/data", "s1").unwrap();

        let mut buf = Vec::new();
        PoolEngine::send_changes(&src, "tank/data@s1", None, false, &mut buf).unwrap();

        let dst = MemPool::new();
        dst.create_fs("backup").unwrap();
        let mut rd = &buf[..];
        let codec = Codec::native();
        let raw = codec.read_record(&mut rd).unwrap().unwrap();
        let req = ApplyRequest {
            snapshot: "backup/data@s1".into(),
            origin: None,
            raw_begin: raw.bytes.clone(),
            props: BTreeMap::new(),
            force: false,
        };
        let stats = dst.apply(&req, &mut rd).unwrap();
        assert_eq!(stats.bytes, 10);
        assert_eq!(
            dst.read_block("backup/data@s1", 1, 0).unwrap(),
            Bytes::from_static(b"hello")
        );
        assert_eq!(
            dst.stat("backup/data@s1").unwrap().guid,
            src.stat("tank/data@s1").unwrap().guid
        );
    }

    #[test]
    fn incremental_apply_requires_matching_source() {
        let src = pool();
        src.write_block("tank/data", 1, 0, b"v1").unwrap();
        src.snapshot("tank/data", "s1").unwrap();
        src.write_block("tank/data", 1, 0, b"v2").unwrap();
        src.snapshot("tank/data", "s2").unwrap();

        let mut inc = Vec::new();
        PoolEngine::send_changes(&src, "tank/data@s2", Some("s1"), false, &mut inc).unwrap();

        // A destination without the s1 snapshot refuses the stream.
        let dst = MemPool::new();
        dst.create_fs("backup").unwrap();
        dst.create_fs("backup/data").unwrap();
        dst.snapshot("backup/data", "unrelated").unwrap();

        let mut rd = &inc[..];
        let raw = Codec::native().read_record(&mut rd).unwrap().unwrap();
        let req = ApplyRequest {
            snapshot: "backup/data@s2".into(),
            origin: None,
            raw_begin: raw.bytes.clone(),
            props: BTreeMap::new(),
            force: false,
        };
        match dst.apply(&req, &mut rd) {
            Err(Error::NotFound(msg)) => {
                assert!(msg.contains("does not match incremental source"))
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }
}
