//! Snapshot replication streams for copy-on-write storage pools.
//!
//! A pool's snapshot history is serialized into a self-describing byte
//! stream and replayed on another pool (or the same one, later). One
//! snapshot travels as a *substream* of change records; a package of
//! substreams with a topology header replicates whole filesystem trees,
//! incremental history, clones and properties.
//!
//! ```text
//! Send:
//! +----------+    +-------------+    +--------------+
//! | topology | -> | send driver | -> | dedup worker | -> stream
//! | gather   |    | (substreams)|    |  (optional)  |
//! +----------+    +-------------+    +--------------+
//!
//! Receive:
//! +---------+    +------------+    +-----------+
//! | decoder | -> | reconciler | -> | per-sub-  | -> pool
//! | (frames)|    | (renames)  |    | stream rx |
//! +---------+    +------------+    +-----------+
//! ```
//!
//! The storage layer is behind the [`engine::PoolEngine`] trait;
//! [`mempool::MemPool`] is a complete in-memory implementation used by
//! the test suite and usable as a scratch pool.
//!
//! # Example
//!
//! ```no_run
//! use snapsend::{mempool::MemPool, recv, send};
//! use std::collections::BTreeMap;
//!
//! # fn main() -> snapsend::Result<()> {
//! let src = MemPool::new();
//! src.create_fs("tank")?;
//! src.create_fs("tank/data")?;
//! src.write_block("tank/data", 1, 0, b"hello")?;
//! src.snapshot("tank/data", "monday")?;
//!
//! let mut stream = Vec::new();
//! send::send(
//!     &src,
//!     "tank/data",
//!     None,
//!     "monday",
//!     &send::SendFlags::default(),
//!     &mut stream,
//! )?;
//!
//! let dst = MemPool::new();
//! dst.create_fs("backup")?;
//! recv::receive(
//!     &dst,
//!     "backup/data",
//!     &recv::RecvFlags::default(),
//!     &BTreeMap::new(),
//!     &mut &stream[..],
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod mempool;
pub mod recv;
pub mod send;
pub mod stream;
pub mod topology;

pub use engine::{
    ApplyRequest, ApplyStats, DatasetStat, HoldGuard, PoolEngine, Prop, PropSource, PropValue,
    SnapshotStat,
};
pub use error::{Error, Result};
pub use mempool::MemPool;
pub use recv::{receive, NameMode, PropOverride, RecvFlags, RecvSummary};
pub use send::{plan, send, SendFlags, SendPlan, SendSummary};
pub use stream::{
    Checksum256, Codec, DatasetKind, FeatureFlags, HeaderKind, Record, RecordType, STREAM_MAGIC,
};
pub use topology::{gather, FsNode, GuidIndex, Topology};
