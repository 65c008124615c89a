//! Receive orchestration.
//!
//! A stream is either a single substream (one snapshot) or a compound
//! package: a topology header followed by substreams and a zeroed END.
//! Packages with a "from" snapshot first reconcile the destination tree
//! with the sender's layout, then apply each substream, then reconcile
//! once more to resolve names parked during the first pass.
//!
//! Failures inside a package come in two strengths: a hard error stops
//! the package (the stream position is unknowable past a broken
//! substream), while reconciliation shortfalls are soft and surface as
//! [`Error::Incomplete`] after everything receivable was received.

pub mod decoder;
pub mod reconcile;
pub mod receiver;

use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::Read;

use crate::engine::{prop_is_readonly, PoolEngine, PropValue};
use crate::error::{Error, Result};
use crate::stream::HeaderKind;
use crate::topology::{GuidIndex, Topology};

use decoder::{
    read_package_end, read_package_payload, read_stream_start, validate_header, StreamHeader,
    StreamStart,
};
use receiver::{destination, receive_one};

pub use reconcile::ReconcileReport;

/// How the destination name is derived from the sender's snapshot name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NameMode {
    /// The target names the destination outright.
    #[default]
    Exact,
    /// The target replaces the sender's pool name.
    Prefix,
    /// The target becomes the parent of the sent filesystem's tail
    /// component.
    Tail,
}

#[derive(Debug, Clone, Default)]
pub struct RecvFlags {
    /// Roll back or destroy local state that is in the stream's way.
    pub force: bool,
    /// Walk the stream and report, touch nothing.
    pub dry_run: bool,
    /// Leave received filesystems unmounted.
    pub nomount: bool,
    pub name_mode: NameMode,
}

/// Per-property receive override.
#[derive(Debug, Clone)]
pub enum PropOverride {
    /// Set this local value on the destination, shadowing whatever the
    /// stream carries.
    Set(PropValue),
    /// Drop the stream's value for this property entirely.
    KeepLocal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecvSummary {
    /// Substreams applied to the pool.
    pub received: usize,
    /// Substreams consumed without applying (dry run, already present).
    pub skipped: usize,
    pub bytes: u64,
}

/// Some properties are managed by the pool itself and make no sense as
/// receive-time overrides.
fn check_overrides(overrides: &BTreeMap<String, PropOverride>) -> Result<()> {
    for name in overrides.keys() {
        if prop_is_readonly(name) || name == "version" || name == "volsize" {
            return Err(Error::NotSupported(format!(
                "invalid to override received property '{name}'"
            )));
        }
    }
    Ok(())
}

enum Outcome {
    Received,
    EndOfPackage,
}

struct RecvState<'a> {
    engine: &'a dyn PoolEngine,
    flags: &'a RecvFlags,
    overrides: &'a BTreeMap<String, PropOverride>,
    /// Highest filesystem touched, mounted at the end.
    top_fs: Option<String>,
    summary: RecvSummary,
}

impl RecvState<'_> {
    fn receive_stream(
        &mut self,
        tosnap: &str,
        input: &mut dyn Read,
        sendfs: Option<&str>,
        stream: Option<(&Topology, &GuidIndex)>,
    ) -> Result<(Outcome, bool)> {
        let header = match read_stream_start(input)? {
            StreamStart::EndOfPackage => return Ok((Outcome::EndOfPackage, false)),
            StreamStart::Header(h) => h,
        };
        validate_header(&header)?;

        match header.kind() {
            HeaderKind::Compound => {
                if stream.is_some() {
                    return Err(Error::BadStream("nested replication package".into()));
                }
                let soft = self.receive_package(tosnap, input, *header)?;
                Ok((Outcome::Received, soft))
            }
            HeaderKind::Substream => {
                if header.payload_len != 0 {
                    return Err(Error::BadStream("invalid substream header".into()));
                }
                let owned_sendfs;
                let sendfs = match sendfs {
                    Some(s) => s,
                    None => {
                        owned_sendfs = header.begin.sender_fs().to_string();
                        &owned_sendfs
                    }
                };
                let out = receive_one(
                    self.engine,
                    self.flags,
                    self.overrides,
                    tosnap,
                    &header,
                    sendfs,
                    stream,
                    input,
                    &mut self.top_fs,
                )?;
                if out.received {
                    self.summary.received += 1;
                    self.summary.bytes += out.bytes;
                } else {
                    self.summary.skipped += 1;
                }
                Ok((Outcome::Received, false))
            }
        }
    }

    fn receive_package(
        &mut self,
        tosnap: &str,
        input: &mut dyn Read,
        mut header: StreamHeader,
    ) -> Result<bool> {
        let payload = if header.payload_len > 0 {
            read_package_payload(input, header.payload_len, header.swap, &mut header.cksum)?
        } else {
            Bytes::new()
        };
        read_package_end(input, header.swap, &header.cksum)?;

        let topo = if payload.is_empty() {
            None
        } else {
            Some(Topology::unpack(&payload)?)
        };
        let index = topo.as_ref().map(|t| t.index());
        let recursive = topo.as_ref().map_or(false, |t| t.recursive);

        if recursive && tosnap.contains('@') {
            return Err(Error::BadStream(
                "cannot specify snapshot name for multi-snapshot stream".into(),
            ));
        }

        let sendfs = header.begin.sender_fs().to_string();
        let isprefix = self.flags.name_mode != NameMode::Exact;
        let mut softerr = false;

        // Incremental packages first line the destination up with the
        // sender's tree at the "from" snapshot.
        if let (Some(t), Some(idx)) = (&topo, &index) {
            if t.fromsnap.is_some() {
                let tofs = self.package_tofs(tosnap, &header, &sendfs)?;
                let collect = recursive && !self.flags.dry_run && !self.flags.nomount;
                let report = reconcile::reconcile(
                    self.engine,
                    &tofs,
                    t,
                    idx,
                    self.flags.force,
                    isprefix,
                    self.flags.dry_run,
                    collect,
                )?;
                softerr |= report.incomplete;
                // Datasets that moved are unmounted until the package
                // is done and the top filesystem is remounted.
                for name in report.renamed {
                    if !name.is_empty() {
                        let _ = self.engine.unmount(&name);
                    }
                }
            }
        }

        let mut hard_err: Option<Error> = None;
        loop {
            let stream_ref = match (&topo, &index) {
                (Some(t), Some(i)) => Some((t, i)),
                _ => None,
            };
            match self.receive_stream(tosnap, input, Some(&sendfs), stream_ref) {
                Ok((Outcome::EndOfPackage, _)) => break,
                Ok((Outcome::Received, _)) => {}
                Err(e) => {
                    hard_err = Some(e);
                    break;
                }
            }
        }

        // A second pass resolves names parked while their final spot
        // was still occupied.
        if hard_err.is_none() {
            if let (Some(t), Some(idx)) = (&topo, &index) {
                if t.fromsnap.is_some() {
                    let tofs = self.package_tofs(tosnap, &header, &sendfs)?;
                    let report = reconcile::reconcile(
                        self.engine,
                        &tofs,
                        t,
                        idx,
                        self.flags.force,
                        isprefix,
                        self.flags.dry_run,
                        false,
                    )?;
                    softerr |= report.incomplete;
                }
            }
        }

        match hard_err {
            Some(e) => Err(e),
            None => Ok(softerr),
        }
    }

    /// The destination filesystem the package as a whole lands on.
    fn package_tofs(&self, tosnap: &str, header: &StreamHeader, sendfs: &str) -> Result<String> {
        let dest = destination(
            tosnap,
            &header.begin.toname,
            sendfs,
            self.flags.name_mode,
            true,
        )?;
        let fs = match dest.find('@') {
            Some(at) => dest[..at].to_string(),
            None => dest,
        };
        Ok(fs)
    }
}

/// Receive a stream onto `tosnap`.
///
/// `tosnap` is a filesystem (or, for a plain substream in exact mode, a
/// full snapshot name). Property overrides apply to every filesystem
/// the stream creates or updates.
pub fn receive(
    engine: &dyn PoolEngine,
    tosnap: &str,
    flags: &RecvFlags,
    overrides: &BTreeMap<String, PropOverride>,
    input: &mut dyn Read,
) -> Result<RecvSummary> {
    check_overrides(overrides)?;

    if flags.name_mode != NameMode::Exact && !engine.dataset_exists(tosnap) {
        return Err(Error::NotFound(format!(
            "specified filesystem '{tosnap}' does not exist"
        )));
    }

    let mut state = RecvState {
        engine,
        flags,
        overrides,
        top_fs: None,
        summary: RecvSummary::default(),
    };

    let (_, soft) = state.receive_stream(tosnap, input, None, None)?;

    if soft {
        return Err(Error::Incomplete);
    }

    if !flags.nomount && !flags.dry_run {
        if let Some(top) = &state.top_fs {
            engine.mount(top)?;
        }
    }

    Ok(state.summary)
}
