//! Storage engine abstraction.
//!
//! `PoolEngine` is the seam between the stream orchestration in this
//! crate and whatever actually stores datasets: a kernel driver in
//! production, [`crate::mempool::MemPool`] in tests. The engine owns the
//! per-snapshot-pair record producer (`send_changes`) and the substream
//! apply step; everything above it (topology, dedup, ordering,
//! reconciliation, naming) lives here.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::stream::DatasetKind;

/// Property value as stored on a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropValue {
    String(String),
    Number(u64),
}

impl PropValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::String(s) => Some(s),
            PropValue::Number(_) => None,
        }
    }
}

/// Where an effective property value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropSource {
    Default,
    Local,
    Inherited,
    Received,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prop {
    pub value: PropValue,
    pub source: PropSource,
}

impl Prop {
    pub fn local(value: PropValue) -> Self {
        Prop {
            value,
            source: PropSource::Local,
        }
    }

    pub fn received(value: PropValue) -> Self {
        Prop {
            value,
            source: PropSource::Received,
        }
    }
}

/// Props that only the engine may write.
pub fn prop_is_readonly(name: &str) -> bool {
    matches!(
        name,
        "creation" | "used" | "available" | "referenced" | "origin" | "createtxg" | "guid"
            | "type" | "compressratio"
    )
}

/// Space-accounting props that do not apply to snapshots.
pub fn prop_is_quota_class(name: &str) -> bool {
    matches!(
        name,
        "quota" | "refquota" | "reservation" | "refreservation"
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetStat {
    pub name: String,
    pub guid: u64,
    pub createtxg: u64,
    pub kind: DatasetKind,
    /// Full snapshot name of the clone origin, if any.
    pub origin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotStat {
    /// Short name, after the `@`.
    pub name: String,
    pub guid: u64,
    pub createtxg: u64,
}

/// One substream handed to the engine for replay.
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    /// Full destination snapshot name, `pool/fs@snap`.
    pub snapshot: String,
    /// Clone origin to base a new filesystem on.
    pub origin: Option<String>,
    /// The sender's BEGIN record, byte-for-byte as it arrived.
    pub raw_begin: Bytes,
    /// Properties to stamp on the destination as received values.
    pub props: BTreeMap<String, PropValue>,
    /// Roll the destination back over local changes.
    pub force: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyStats {
    pub bytes: u64,
}

/// The storage layer underneath send/receive.
///
/// Snapshot lists come back in creation order. Names are always full
/// (`pool/fs` or `pool/fs@snap`) except snapshot short names inside
/// `SnapshotStat`.
pub trait PoolEngine {
    fn dataset_exists(&self, name: &str) -> bool;
    fn stat(&self, name: &str) -> Result<DatasetStat>;
    /// Direct child filesystems/volumes, full names.
    fn children(&self, name: &str) -> Result<Vec<String>>;
    fn snapshots(&self, name: &str) -> Result<Vec<SnapshotStat>>;

    /// Effective properties with their sources.
    fn props(&self, name: &str) -> Result<BTreeMap<String, Prop>>;
    /// The received-property layer only.
    fn received_props(&self, name: &str) -> Result<BTreeMap<String, Prop>>;
    fn snapshot_props(&self, snapshot: &str) -> Result<BTreeMap<String, Prop>>;
    fn set_props(
        &self,
        name: &str,
        props: &BTreeMap<String, PropValue>,
        received: bool,
    ) -> Result<()>;

    /// Produce one substream: the changes that turn `from` (an earlier
    /// snapshot of the same filesystem, or the clone origin when
    /// `from_origin`) into `tosnap`. `from: None` writes a full stream,
    /// as does `from_origin` on a dataset that is not a clone.
    fn send_changes(
        &self,
        tosnap: &str,
        from: Option<&str>,
        from_origin: bool,
        out: &mut dyn Write,
    ) -> Result<()>;

    /// Replay one substream onto the destination. Reads records from
    /// `input` until the substream's END, verifying its checksum.
    fn apply(&self, req: &ApplyRequest, input: &mut dyn Read) -> Result<ApplyStats>;

    /// Create missing ancestor filesystems of `name`.
    fn create_ancestors(&self, name: &str) -> Result<()>;
    fn rename(&self, from: &str, to: &str) -> Result<()>;
    fn destroy(&self, name: &str, defer: bool) -> Result<()>;
    fn promote(&self, clone: &str) -> Result<()>;

    fn hold(&self, snapshot: &str, tag: &str) -> Result<()>;
    fn release(&self, snapshot: &str, tag: &str) -> Result<()>;

    fn is_mounted(&self, name: &str) -> bool;
    fn mount(&self, name: &str) -> Result<()>;
    fn unmount(&self, name: &str) -> Result<()>;
}

/// Snapshot hold released on drop, so every exit path (including
/// unwinds) lets go of the snapshot.
pub struct HoldGuard<'a> {
    engine: &'a dyn PoolEngine,
    snapshot: String,
    tag: String,
}

impl<'a> HoldGuard<'a> {
    pub fn new(engine: &'a dyn PoolEngine, snapshot: &str, tag: &str) -> Result<Self> {
        engine.hold(snapshot, tag)?;
        Ok(HoldGuard {
            engine,
            snapshot: snapshot.to_string(),
            tag: tag.to_string(),
        })
    }

    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }
}

impl Drop for HoldGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.engine.release(&self.snapshot, &self.tag) {
            tracing::debug!(snapshot = %self.snapshot, tag = %self.tag, error = %e,
                "failed to release snapshot hold");
        }
    }
}

static SEQ: AtomicU64 = AtomicU64::new(1);

/// Monotonic sequence for hold tags and temporary receive names.
pub(crate) fn next_seq() -> u64 {
    SEQ.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readonly_and_quota_classification() {
        assert!(prop_is_readonly("guid"));
        assert!(prop_is_readonly("origin"));
        assert!(!prop_is_readonly("mountpoint"));
        assert!(prop_is_quota_class("refquota"));
        assert!(!prop_is_quota_class("compression"));
    }

    #[test]
    fn seq_is_monotonic() {
        let a = next_seq();
        let b = next_seq();
        assert!(b > a);
    }
}
