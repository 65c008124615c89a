//! Send orchestration.
//!
//! ```text
//! +----------+    +-------------+    +--------------+
//! | topology | -> | send driver | -> | dedup worker | -> out
//! | gather   |    | (substreams)|    |  (optional)  |
//! +----------+    +-------------+    +--------------+
//! ```
//!
//! Compound streams (replicate / doall / props) get a packed-topology
//! header before the substreams and a zeroed END record after them.

pub mod dedup;
pub mod driver;

use bytes::Bytes;
use std::io::Write;
use std::thread;

use crate::engine::PoolEngine;
use crate::error::{Error, Result};
use crate::stream::checksum::{Checksum256, Fletcher4};
use crate::stream::record::{
    versioninfo, BeginFlags, BeginRecord, Codec, DatasetKind, EndRecord, FeatureFlags, HeaderKind,
    Record, STREAM_MAGIC, TONAME_LEN,
};
use crate::topology::{gather, Topology};

pub use dedup::{dedup_stream, default_table_budget, DataRef, DedupTable};
pub use driver::PlannedSubstream;

use driver::SendDriver;

/// Pipe depth between the driver and the dedup worker, in record-sized
/// chunks.
const DEDUP_PIPE_DEPTH: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct SendFlags {
    /// Recursive package of every descendant filesystem.
    pub replicate: bool,
    /// Send all intermediate snapshots, not just the from/to bound.
    pub doall: bool,
    /// Include properties in a compound header.
    pub props: bool,
    /// Incremental from the dataset's clone origin.
    pub fromorigin: bool,
    /// Rewrite duplicate blocks as references.
    pub dedup: bool,
    /// Never let a clone depend on an origin outside the stream.
    pub self_contained: bool,
    /// Send received property values rather than effective ones.
    pub received: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SendSummary {
    pub substreams: usize,
}

/// What a send would emit, without emitting it.
#[derive(Debug, Clone)]
pub struct SendPlan {
    pub topology: Option<Topology>,
    pub substreams: Vec<PlannedSubstream>,
}

struct SendSetup {
    props: bool,
    compound: bool,
    features: FeatureFlags,
    topology: Option<Topology>,
    hold_tag: Option<String>,
}

fn prepare(
    engine: &dyn PoolEngine,
    dataset: &str,
    fromsnap: Option<&str>,
    tosnap: &str,
    flags: &SendFlags,
) -> Result<SendSetup> {
    if fromsnap == Some("") {
        return Err(Error::NotFound(format!(
            "cannot send '{dataset}': zero-length incremental source"
        )));
    }
    if dataset.len() + 1 + tosnap.len() >= TONAME_LEN {
        return Err(Error::InvalidName(format!("{dataset}@{tosnap}")));
    }
    let stat = engine.stat(dataset)?;

    let props = flags.props || flags.replicate || flags.received;
    let compound = flags.doall || props;

    let mut features = FeatureFlags::empty();
    if stat.kind == DatasetKind::Filesystem {
        features |= FeatureFlags::SA_SPILL;
        let ds_props = engine.props(dataset)?;
        if let Some(p) = ds_props.get("encryption") {
            if p.value.as_str().map_or(false, |v| v != "off") {
                features |= FeatureFlags::ENCRYPT;
            }
        }
    }
    if flags.dedup {
        features |= FeatureFlags::DEDUP | FeatureFlags::DEDUP_PROPS;
    }

    let topology = if props {
        Some(gather(
            engine,
            dataset,
            fromsnap,
            Some(tosnap),
            flags.replicate,
            flags.received,
        )?)
    } else {
        None
    };

    let hold_tag = if flags.doall || flags.replicate {
        Some(format!(
            ".send-{}-{}",
            std::process::id(),
            crate::engine::next_seq()
        ))
    } else {
        None
    };

    Ok(SendSetup {
        props,
        compound,
        features,
        topology,
        hold_tag,
    })
}

fn write_compound_header(
    out: &mut dyn Write,
    dataset: &str,
    tosnap: &str,
    features: FeatureFlags,
    topology: Option<&Topology>,
) -> Result<()> {
    let payload = match topology {
        Some(t) => t.pack()?,
        None => Bytes::new(),
    };
    let codec = Codec::native();
    let begin = Record::Begin(BeginRecord {
        magic: STREAM_MAGIC,
        versioninfo: versioninfo(HeaderKind::Compound, features),
        creation_time: 0,
        kind: DatasetKind::None,
        flags: BeginFlags::empty(),
        toguid: 0,
        fromguid: 0,
        toname: format!("{dataset}@{tosnap}"),
        payload,
    });

    let mut cksum = Fletcher4::new();
    let wire = codec.encode(&begin);
    cksum.update(&wire);
    out.write_all(&wire)?;

    // The END carries the header checksum and is not folded in itself.
    let end = Record::End(EndRecord {
        checksum: cksum.value(),
        toguid: 0,
    });
    out.write_all(&codec.encode(&end))?;
    Ok(())
}

fn write_trailing_end(out: &mut dyn Write) -> Result<()> {
    let end = Record::End(EndRecord {
        checksum: Checksum256::ZERO,
        toguid: 0,
    });
    out.write_all(&Codec::native().encode(&end))?;
    Ok(())
}

/// Generate a send stream for `dataset` up to `tosnap`, incremental
/// from `fromsnap` (or the clone origin with `fromorigin`).
///
/// Per-filesystem problems in a replication (target snapshot missing,
/// incremental source missing) are warned about and the rest of the
/// package is still produced; they surface as the soft
/// [`Error::Incomplete`].
pub fn send<W: Write + Send>(
    engine: &dyn PoolEngine,
    dataset: &str,
    fromsnap: Option<&str>,
    tosnap: &str,
    flags: &SendFlags,
    out: &mut W,
) -> Result<SendSummary> {
    let setup = prepare(engine, dataset, fromsnap, tosnap, flags)?;
    let index = setup.topology.as_ref().map(|t| t.index());

    if setup.compound {
        write_compound_header(
            out,
            dataset,
            tosnap,
            setup.features,
            if setup.props {
                setup.topology.as_ref()
            } else {
                None
            },
        )?;
    }

    let mut drv = SendDriver::new(
        engine,
        fromsnap,
        tosnap,
        flags.replicate,
        flags.doall,
        flags.fromorigin,
        flags.self_contained,
        false,
        setup.topology.as_ref(),
        index.as_ref(),
        setup.hold_tag,
    );

    let drive_res = if flags.dedup {
        let (mut pw, mut pr) = dedup::record_pipe(DEDUP_PIPE_DEPTH);
        let budget = default_table_budget();
        let mut worker_res: Result<()> = Ok(());
        let mut drive_res: Result<()> = Ok(());
        thread::scope(|s| {
            let handle = s.spawn(|| dedup_stream(&mut pr, budget, &mut *out));
            drive_res = drv.dump_filesystems(dataset, &mut pw);
            // Closing the pipe lets the worker drain and exit.
            drop(pw);
            worker_res = match handle.join() {
                Ok(r) => r,
                Err(_) => Err(Error::PipeFailed("dedup worker terminated abnormally".into())),
            };
        });
        // A driver failure caused by the worker's death is less
        // interesting than why the worker died.
        match (drive_res, worker_res) {
            (Err(e), Ok(())) => Err(e),
            (Ok(()), Err(e)) => Err(e),
            (Err(Error::Io(_)), Err(we)) => Err(we),
            (Err(de), Err(_)) => Err(de),
            (Ok(()), Ok(())) => Ok(()),
        }
    } else {
        drv.dump_filesystems(dataset, out)
    };

    let warned = drv.warned;
    let substreams = drv.substreams;
    drop(drv); // release snapshot holds

    // The trailing END goes out even after a partial failure; the
    // stream may still be usable up to the failure point.
    if setup.compound {
        let end_res = write_trailing_end(out);
        drive_res?;
        end_res?;
    } else {
        drive_res?;
    }

    if warned {
        return Err(Error::Incomplete);
    }
    Ok(SendSummary { substreams })
}

/// Dry-run: compute the topology and substream sequence a send with
/// these flags would produce.
pub fn plan(
    engine: &dyn PoolEngine,
    dataset: &str,
    fromsnap: Option<&str>,
    tosnap: &str,
    flags: &SendFlags,
) -> Result<SendPlan> {
    let setup = prepare(engine, dataset, fromsnap, tosnap, flags)?;
    let index = setup.topology.as_ref().map(|t| t.index());

    let mut drv = SendDriver::new(
        engine,
        fromsnap,
        tosnap,
        flags.replicate,
        flags.doall,
        flags.fromorigin,
        flags.self_contained,
        true,
        setup.topology.as_ref(),
        index.as_ref(),
        // Planning takes no holds.
        None,
    );
    drv.dump_filesystems(dataset, &mut std::io::sink())?;
    let substreams = std::mem::take(&mut drv.plan);
    drop(drv);

    Ok(SendPlan {
        topology: setup.topology,
        substreams,
    })
}
