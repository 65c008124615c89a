//! Per-filesystem snapshot walk and clone ordering for send.
//!
//! Each filesystem runs a small state machine over its creation-ordered
//! snapshots: skip until the "from" bound is seen, emit substreams until
//! the "to" bound, then stop. Replication wraps that in a fixpoint loop
//! so a clone is never dumped before its origin.

use std::collections::HashSet;
use std::io::Write;

use crate::engine::{HoldGuard, PoolEngine, SnapshotStat};
use crate::error::{Error, Result};
use crate::topology::{GuidIndex, Topology};

/// One substream the driver decided to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSubstream {
    /// Full snapshot name, `pool/fs@snap`.
    pub snapshot: String,
    /// Short name of the incremental source, if any.
    pub from: Option<String>,
    /// Incremental from the clone origin instead of a sibling snapshot.
    pub from_origin: bool,
}

pub(crate) struct SendDriver<'a> {
    pub engine: &'a dyn PoolEngine,
    pub fromsnap: Option<&'a str>,
    pub tosnap: &'a str,
    pub replicate: bool,
    pub doall: bool,
    pub fromorigin: bool,
    pub self_contained: bool,
    pub dry_run: bool,
    /// Present for replication sends.
    pub topology: Option<&'a Topology>,
    pub index: Option<&'a GuidIndex>,
    /// `.send-<pid>-<seq>`; `None` when holds are not wanted.
    pub hold_tag: Option<String>,

    // per-filesystem walk state
    prevsnap: Option<String>,
    seenfrom: bool,
    seento: bool,

    clone_origin_snaps: HashSet<u64>,
    missing_origin_fs: HashSet<u64>,
    holds: Vec<HoldGuard<'a>>,
    pub plan: Vec<PlannedSubstream>,
    pub substreams: usize,
    /// Per-filesystem warnings were issued; the stream is usable but
    /// not everything asked for was sent.
    pub warned: bool,
}

impl<'a> SendDriver<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: &'a dyn PoolEngine,
        fromsnap: Option<&'a str>,
        tosnap: &'a str,
        replicate: bool,
        doall: bool,
        fromorigin: bool,
        self_contained: bool,
        dry_run: bool,
        topology: Option<&'a Topology>,
        index: Option<&'a GuidIndex>,
        hold_tag: Option<String>,
    ) -> Self {
        SendDriver {
            engine,
            fromsnap,
            tosnap,
            replicate,
            doall,
            fromorigin,
            self_contained,
            dry_run,
            topology,
            index,
            hold_tag,
            prevsnap: None,
            seenfrom: false,
            seento: false,
            clone_origin_snaps: HashSet::new(),
            missing_origin_fs: HashSet::new(),
            holds: Vec::new(),
            plan: Vec::new(),
            substreams: 0,
            warned: false,
        }
    }

    fn hold_for_send(&mut self, snapshot: &str) -> Result<()> {
        let tag = match self.hold_tag.clone() {
            Some(tag) => tag,
            None => return Ok(()),
        };
        match HoldGuard::new(self.engine, snapshot, &tag) {
            Ok(guard) => {
                self.holds.push(guard);
                Ok(())
            }
            // The snapshot or its fs may have gone away under us; the
            // send step will surface that if it matters.
            Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn dump_snapshot(
        &mut self,
        fs: &str,
        fs_guid: u64,
        snap: &SnapshotStat,
        out: &mut dyn Write,
    ) -> Result<()> {
        let thissnap = snap.name.as_str();
        let full = format!("{fs}@{thissnap}");
        let isfromsnap = self.fromsnap == Some(thissnap);

        if !self.seenfrom && isfromsnap {
            self.hold_for_send(&full)?;
            self.seenfrom = true;
            self.prevsnap = Some(thissnap.to_string());
            return Ok(());
        }

        if self.seento || !self.seenfrom {
            return Ok(());
        }

        let istosnap = thissnap == self.tosnap;
        if istosnap {
            self.seento = true;
        }

        // Filter intermediate snapshots unless doall; replication keeps
        // the origin snapshots its clones need.
        if !self.doall && !isfromsnap && !istosnap {
            let keep = self.replicate && self.clone_origin_snaps.contains(&snap.guid);
            if !keep {
                // As if this snapshot didn't exist: prevsnap stays put.
                return Ok(());
            }
        }

        // First snapshot of a clone whose origin is out of scope: a
        // self-contained stream falls back to a full stream, otherwise
        // the stream has a declared gap.
        let mut forcefull = false;
        if self.prevsnap.is_none() && self.replicate && self.missing_origin_fs.contains(&fs_guid)
        {
            if self.self_contained {
                forcefull = true;
            } else {
                tracing::warn!(filesystem = %fs, "origin not included in stream");
                self.warned = true;
            }
        }

        self.hold_for_send(&full)?;

        tracing::debug!(from = self.prevsnap.as_deref().unwrap_or(""), to = %full,
            "sending substream");

        let from_origin =
            !forcefull && self.prevsnap.is_none() && (self.fromorigin || self.replicate);

        if self.dry_run {
            self.plan.push(PlannedSubstream {
                snapshot: full,
                from: self.prevsnap.clone(),
                from_origin,
            });
        } else {
            self.engine
                .send_changes(&full, self.prevsnap.as_deref(), from_origin, out)?;
        }
        self.substreams += 1;

        self.prevsnap = Some(thissnap.to_string());
        Ok(())
    }

    pub fn dump_filesystem(&mut self, fs: &str, out: &mut dyn Write) -> Result<()> {
        if !self.engine.dataset_exists(&format!("{fs}@{}", self.tosnap)) {
            tracing::warn!(filesystem = %fs, tosnap = %self.tosnap,
                "could not send: target snapshot does not exist");
            self.warned = true;
            return Ok(());
        }

        // A filesystem without the fromsnap in a replication gets a
        // full stream instead; a single-fs send surfaces the error.
        let mut missingfrom = false;
        if self.replicate {
            if let Some(from) = self.fromsnap {
                if !self.engine.dataset_exists(&format!("{fs}@{from}")) {
                    missingfrom = true;
                }
            }
        }

        self.seenfrom = self.fromsnap.is_none() || missingfrom;
        self.seento = false;
        self.prevsnap = None;

        let fs_guid = self.engine.stat(fs)?.guid;
        for snap in self.engine.snapshots(fs)? {
            self.dump_snapshot(fs, fs_guid, &snap, out)?;
        }

        if !self.seenfrom {
            tracing::warn!(filesystem = %fs, tosnap = %self.tosnap,
                fromsnap = self.fromsnap.unwrap_or(""),
                "could not send: incremental source does not exist");
            self.warned = true;
        } else if !self.seento {
            if self.fromsnap.is_some() {
                tracing::warn!(filesystem = %fs, tosnap = %self.tosnap,
                    fromsnap = self.fromsnap.unwrap_or(""),
                    "could not send: incremental source is not earlier than target");
            } else {
                tracing::warn!(filesystem = %fs, tosnap = %self.tosnap,
                    "could not send: target snapshot does not exist");
            }
            self.warned = true;
        }

        Ok(())
    }

    pub fn dump_filesystems(&mut self, root: &str, out: &mut dyn Write) -> Result<()> {
        if !self.replicate {
            return self.dump_filesystem(root, out);
        }

        let (topo, index) = match (self.topology, self.index) {
            (Some(t), Some(i)) => (t, i),
            _ => {
                return Err(Error::NotSupported(
                    "replication send requires a gathered topology".into(),
                ))
            }
        };

        // Cross-mark the snapshots that serve as clone origins, and the
        // clones whose origin is outside the stream.
        for node in &topo.nodes {
            if let Some(origin_guid) = node.origin {
                if index.contains(origin_guid) {
                    self.clone_origin_snaps.insert(origin_guid);
                } else {
                    self.missing_origin_fs.insert(node.guid);
                }
            }
        }

        let mut sent: HashSet<u64> = HashSet::new();
        loop {
            let mut needagain = false;
            let mut progress = false;
            for node in &topo.nodes {
                if sent.contains(&node.guid) {
                    continue;
                }
                if let Some(origin_guid) = node.origin {
                    if let Some(loc) = index.find(origin_guid) {
                        if !sent.contains(&loc.fs_guid) {
                            // Origin not dumped yet; come back to this
                            // clone in a later pass.
                            needagain = true;
                            continue;
                        }
                    }
                }
                self.dump_filesystem(&node.name, out)?;
                sent.insert(node.guid);
                progress = true;
            }
            if !needagain {
                break;
            }
            if !progress {
                tracing::warn!("clone origin ordering could not be resolved");
                self.warned = true;
                break;
            }
        }
        Ok(())
    }
}
