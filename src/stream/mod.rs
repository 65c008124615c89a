//! Wire format for replication streams.
//!
//! ```text
//! substream:  BEGIN | OBJECT/WRITE/FREE/... records | END(checksum)
//! compound:   BEGIN(topology payload) | END(checksum)
//!             | substream ... substream | END(zero)
//! ```
//!
//! All integers travel in the sender's native byte order; the receiver
//! detects the order from the BEGIN magic and swaps on its side.

pub mod checksum;
pub mod record;

pub use checksum::{content_checksum, Checksum256, ContentChecksum, Fletcher4};
pub use record::{
    feature_flags, features_supported, header_kind, magic_is_swapped, versioninfo, BeginFlags,
    BeginRecord, ChecksumFlags, Codec, DatasetKind, EndRecord, FeatureFlags, FreeObjectsRecord,
    FreeRecord, HeaderKind, ObjectRecord, RawRecord, Record, RecordType, SpillRecord,
    WriteByrefRecord, WriteRecord, BEGIN_WIRE_LEN, HEADER_LEN, STREAM_MAGIC, TONAME_LEN,
};
