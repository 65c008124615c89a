//! Tagged wire records for replication streams.
//!
//! Frame format: `type:u32 | payload_len:u32 | body | payload`, all
//! integers in the sender's native byte order. The body length is fixed
//! per record type; `payload_len` covers only the variable payload that
//! follows (WRITE data, OBJECT bonus, the packed topology after a
//! compound BEGIN).
//!
//! A `Codec` carries the byte-order decision made once per stream; every
//! multi-byte field goes through it, so no call site swaps fields itself.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Read;

use crate::error::{Error, Result};
use crate::stream::checksum::{Checksum256, ContentChecksum};

/// Stream magic, first field of every BEGIN record.
pub const STREAM_MAGIC: u64 = 0x2F5bacbac;

/// Fixed frame header: type + payload_len.
pub const HEADER_LEN: usize = 8;

/// BEGIN body length (without header or payload).
pub const BEGIN_BODY_LEN: usize = 304;

/// Full wire length of a BEGIN record minus its payload.
pub const BEGIN_WIRE_LEN: usize = HEADER_LEN + BEGIN_BODY_LEN;

/// Fixed size of the toname field in BEGIN.
pub const TONAME_LEN: usize = 256;

/// Upper bound on any single variable payload; larger lengths mean a
/// corrupt stream, not a big block.
pub const MAX_PAYLOAD_LEN: usize = 1 << 28;

/// Stream header kind, low two bits of versioninfo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    /// One snapshot's records, BEGIN through END.
    Substream,
    /// Package of substreams with a packed-topology header.
    Compound,
}

const HDR_SUBSTREAM: u64 = 0x1;
const HDR_COMPOUND: u64 = 0x2;
const HDR_MASK: u64 = 0x3;
const FEATURE_SHIFT: u32 = 2;

bitflags::bitflags! {
    /// Stream feature flags carried in versioninfo above the header kind.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FeatureFlags: u64 {
        const DEDUP = 1 << 0;
        const DEDUP_PROPS = 1 << 1;
        const SA_SPILL = 1 << 2;
        const ENCRYPT = 1 << 3;
    }
}

/// Compose a versioninfo bitfield.
pub fn versioninfo(kind: HeaderKind, features: FeatureFlags) -> u64 {
    let k = match kind {
        HeaderKind::Substream => HDR_SUBSTREAM,
        HeaderKind::Compound => HDR_COMPOUND,
    };
    k | (features.bits() << FEATURE_SHIFT)
}

pub fn header_kind(versioninfo: u64) -> Option<HeaderKind> {
    match versioninfo & HDR_MASK {
        HDR_SUBSTREAM => Some(HeaderKind::Substream),
        HDR_COMPOUND => Some(HeaderKind::Compound),
        _ => None,
    }
}

pub fn feature_bits(versioninfo: u64) -> u64 {
    versioninfo >> FEATURE_SHIFT
}

pub fn feature_flags(versioninfo: u64) -> FeatureFlags {
    FeatureFlags::from_bits_truncate(feature_bits(versioninfo))
}

/// True when every feature bit in versioninfo is one we implement.
pub fn features_supported(versioninfo: u64) -> bool {
    FeatureFlags::from_bits(feature_bits(versioninfo)).is_some()
}

bitflags::bitflags! {
    /// Per-stream flags in the BEGIN record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BeginFlags: u32 {
        /// Incremental from the origin of a clone rather than an
        /// earlier snapshot of the same filesystem.
        const CLONE = 1 << 0;
    }
}

bitflags::bitflags! {
    /// Content-checksum flags on WRITE / WRITE_BYREF records.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChecksumFlags: u8 {
        /// Checksum is strong enough to key dedup on.
        const DEDUP = 1 << 0;
    }
}

/// Dataset kind declared by a BEGIN record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DatasetKind {
    /// Compound headers do not describe a single dataset.
    None = 0,
    Filesystem = 2,
    Volume = 3,
}

impl DatasetKind {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            2 => Some(Self::Filesystem),
            3 => Some(Self::Volume),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RecordType {
    Begin = 0,
    Object = 1,
    FreeObjects = 2,
    Write = 3,
    Free = 4,
    End = 5,
    WriteByref = 6,
    Spill = 7,
}

impl RecordType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Begin),
            1 => Some(Self::Object),
            2 => Some(Self::FreeObjects),
            3 => Some(Self::Write),
            4 => Some(Self::Free),
            5 => Some(Self::End),
            6 => Some(Self::WriteByref),
            7 => Some(Self::Spill),
            _ => None,
        }
    }
}

// =============================================================================
// Record bodies
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginRecord {
    pub magic: u64,
    pub versioninfo: u64,
    pub creation_time: u64,
    pub kind: DatasetKind,
    pub flags: BeginFlags,
    pub toguid: u64,
    pub fromguid: u64,
    /// Full snapshot name at the sender, `pool/fs@snap`.
    pub toname: String,
    /// Packed topology for compound headers, empty for substreams.
    pub payload: Bytes,
}

impl BeginRecord {
    pub fn header_kind(&self) -> Option<HeaderKind> {
        header_kind(self.versioninfo)
    }

    pub fn features(&self) -> FeatureFlags {
        feature_flags(self.versioninfo)
    }

    pub fn is_clone(&self) -> bool {
        self.flags.contains(BeginFlags::CLONE)
    }

    /// The `fs` part of toname, without pool-relative adjustment.
    pub fn sender_fs(&self) -> &str {
        match self.toname.find('@') {
            Some(at) => &self.toname[..at],
            None => &self.toname,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    pub object: u64,
    pub dnode_type: u32,
    pub bonus_type: u32,
    pub blksz: u32,
    pub toguid: u64,
    pub bonus: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeObjectsRecord {
    pub firstobj: u64,
    pub numobjs: u64,
    pub toguid: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub object: u64,
    pub offset: u64,
    pub toguid: u64,
    pub checksum_type: ContentChecksum,
    pub checksum_flags: ChecksumFlags,
    /// Content checksum of `data` under `checksum_type`.
    pub key_checksum: Checksum256,
    /// Property tag distinguishing otherwise-identical blocks whose
    /// interpretation differs.
    pub key_prop: u64,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteByrefRecord {
    pub object: u64,
    pub offset: u64,
    pub length: u64,
    pub toguid: u64,
    /// Where the identical block was first sent.
    pub refguid: u64,
    pub refobject: u64,
    pub refoffset: u64,
    pub checksum_type: ContentChecksum,
    pub checksum_flags: ChecksumFlags,
    pub key_checksum: Checksum256,
    pub key_prop: u64,
}

/// Length of u64::MAX frees to the end of the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRecord {
    pub object: u64,
    pub offset: u64,
    pub length: u64,
    pub toguid: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillRecord {
    pub object: u64,
    pub toguid: u64,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRecord {
    /// Fletcher-4 of every stream byte since (and including) the
    /// enclosing BEGIN. Zero in the trailing package terminator.
    pub checksum: Checksum256,
    pub toguid: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Begin(BeginRecord),
    Object(ObjectRecord),
    FreeObjects(FreeObjectsRecord),
    Write(WriteRecord),
    WriteByref(WriteByrefRecord),
    Free(FreeRecord),
    Spill(SpillRecord),
    End(EndRecord),
}

impl Record {
    pub fn record_type(&self) -> RecordType {
        match self {
            Record::Begin(_) => RecordType::Begin,
            Record::Object(_) => RecordType::Object,
            Record::FreeObjects(_) => RecordType::FreeObjects,
            Record::Write(_) => RecordType::Write,
            Record::WriteByref(_) => RecordType::WriteByref,
            Record::Free(_) => RecordType::Free,
            Record::Spill(_) => RecordType::Spill,
            Record::End(_) => RecordType::End,
        }
    }

    pub fn toguid(&self) -> u64 {
        match self {
            Record::Begin(r) => r.toguid,
            Record::Object(r) => r.toguid,
            Record::FreeObjects(r) => r.toguid,
            Record::Write(r) => r.toguid,
            Record::WriteByref(r) => r.toguid,
            Record::Free(r) => r.toguid,
            Record::Spill(r) => r.toguid,
            Record::End(r) => r.toguid,
        }
    }
}

/// A decoded record plus the exact bytes it occupied on the wire. The
/// raw bytes feed the running checksum and, for BEGIN, the apply step
/// (which wants the sender's unswapped record).
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub record: Record,
    pub bytes: Bytes,
}

impl RawRecord {
    /// The header+body slice of a BEGIN, without its payload.
    pub fn begin_wire(&self) -> Bytes {
        self.bytes.slice(..BEGIN_WIRE_LEN.min(self.bytes.len()))
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Byte-order-aware encoder/decoder. `swap` is decided once, from the
/// magic of the first BEGIN.
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    pub swap: bool,
}

impl Codec {
    pub fn native() -> Self {
        Codec { swap: false }
    }

    pub fn swapped() -> Self {
        Codec { swap: true }
    }

    fn p32(&self, buf: &mut BytesMut, v: u32) {
        buf.put_u32_ne(if self.swap { v.swap_bytes() } else { v });
    }

    fn p64(&self, buf: &mut BytesMut, v: u64) {
        buf.put_u64_ne(if self.swap { v.swap_bytes() } else { v });
    }

    fn g32(&self, buf: &mut impl Buf) -> u32 {
        let v = buf.get_u32_ne();
        if self.swap {
            v.swap_bytes()
        } else {
            v
        }
    }

    fn g64(&self, buf: &mut impl Buf) -> u64 {
        let v = buf.get_u64_ne();
        if self.swap {
            v.swap_bytes()
        } else {
            v
        }
    }

    /// Encode a record into its full wire form.
    pub fn encode(&self, record: &Record) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 64);
        match record {
            Record::Begin(r) => {
                self.p32(&mut buf, RecordType::Begin as u32);
                self.p32(&mut buf, r.payload.len() as u32);
                self.p64(&mut buf, r.magic);
                self.p64(&mut buf, r.versioninfo);
                self.p64(&mut buf, r.creation_time);
                self.p32(&mut buf, r.kind as u32);
                self.p32(&mut buf, r.flags.bits());
                self.p64(&mut buf, r.toguid);
                self.p64(&mut buf, r.fromguid);
                // Producers validate name length; clamp so a bad name
                // can never panic the encoder.
                let name = r.toname.as_bytes();
                let n = name.len().min(TONAME_LEN - 1);
                buf.put_slice(&name[..n]);
                buf.put_bytes(0, TONAME_LEN - n);
                buf.put_slice(&r.payload);
            }
            Record::Object(r) => {
                let padded = pad8(r.bonus.len());
                self.p32(&mut buf, RecordType::Object as u32);
                self.p32(&mut buf, padded as u32);
                self.p64(&mut buf, r.object);
                self.p32(&mut buf, r.dnode_type);
                self.p32(&mut buf, r.bonus_type);
                self.p32(&mut buf, r.blksz);
                self.p32(&mut buf, r.bonus.len() as u32);
                self.p64(&mut buf, r.toguid);
                buf.put_slice(&r.bonus);
                buf.put_bytes(0, padded - r.bonus.len());
            }
            Record::FreeObjects(r) => {
                self.p32(&mut buf, RecordType::FreeObjects as u32);
                self.p32(&mut buf, 0);
                self.p64(&mut buf, r.firstobj);
                self.p64(&mut buf, r.numobjs);
                self.p64(&mut buf, r.toguid);
            }
            Record::Write(r) => {
                self.p32(&mut buf, RecordType::Write as u32);
                self.p32(&mut buf, r.data.len() as u32);
                self.p64(&mut buf, r.object);
                self.p64(&mut buf, r.offset);
                self.p64(&mut buf, r.data.len() as u64);
                self.p64(&mut buf, r.toguid);
                buf.put_u8(r.checksum_type as u8);
                buf.put_u8(r.checksum_flags.bits());
                buf.put_bytes(0, 6);
                self.put_checksum(&mut buf, r.key_checksum);
                self.p64(&mut buf, r.key_prop);
                buf.put_slice(&r.data);
            }
            Record::WriteByref(r) => {
                self.p32(&mut buf, RecordType::WriteByref as u32);
                self.p32(&mut buf, 0);
                self.p64(&mut buf, r.object);
                self.p64(&mut buf, r.offset);
                self.p64(&mut buf, r.length);
                self.p64(&mut buf, r.toguid);
                self.p64(&mut buf, r.refguid);
                self.p64(&mut buf, r.refobject);
                self.p64(&mut buf, r.refoffset);
                buf.put_u8(r.checksum_type as u8);
                buf.put_u8(r.checksum_flags.bits());
                buf.put_bytes(0, 6);
                self.put_checksum(&mut buf, r.key_checksum);
                self.p64(&mut buf, r.key_prop);
            }
            Record::Free(r) => {
                self.p32(&mut buf, RecordType::Free as u32);
                self.p32(&mut buf, 0);
                self.p64(&mut buf, r.object);
                self.p64(&mut buf, r.offset);
                self.p64(&mut buf, r.length);
                self.p64(&mut buf, r.toguid);
            }
            Record::Spill(r) => {
                let padded = pad8(r.data.len());
                self.p32(&mut buf, RecordType::Spill as u32);
                self.p32(&mut buf, padded as u32);
                self.p64(&mut buf, r.object);
                self.p64(&mut buf, r.data.len() as u64);
                self.p64(&mut buf, r.toguid);
                buf.put_slice(&r.data);
                buf.put_bytes(0, padded - r.data.len());
            }
            Record::End(r) => {
                self.p32(&mut buf, RecordType::End as u32);
                self.p32(&mut buf, 0);
                self.put_checksum(&mut buf, r.checksum);
                self.p64(&mut buf, r.toguid);
            }
        }
        buf.freeze()
    }

    fn put_checksum(&self, buf: &mut BytesMut, ck: Checksum256) {
        for w in ck.0 {
            self.p64(buf, w);
        }
    }

    fn get_checksum(&self, buf: &mut impl Buf) -> Checksum256 {
        let mut words = [0u64; 4];
        for w in &mut words {
            *w = self.g64(buf);
        }
        Checksum256(words)
    }

    /// Read one full record. `Ok(None)` means clean EOF at a record
    /// boundary; EOF anywhere else is `BadStream`.
    pub fn read_record(&self, r: &mut dyn Read) -> Result<Option<RawRecord>> {
        let mut header = [0u8; HEADER_LEN];
        if !read_exact_or_eof(r, &mut header)? {
            return Ok(None);
        }
        let mut hb = &header[..];
        let rtype_raw = self.g32(&mut hb);
        let payload_len = self.g32(&mut hb) as usize;
        let rtype = RecordType::from_u32(rtype_raw)
            .ok_or_else(|| Error::BadStream(format!("unknown record type {rtype_raw}")))?;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(Error::BadStream(format!(
                "payload length {payload_len} exceeds limit"
            )));
        }

        let body_len = body_len(rtype);
        let mut raw = BytesMut::with_capacity(HEADER_LEN + body_len + payload_len);
        raw.put_slice(&header);
        raw.resize(HEADER_LEN + body_len + payload_len, 0);
        r.read_exact(&mut raw[HEADER_LEN..])
            .map_err(|e| Error::BadStream(format!("truncated {rtype:?} record: {e}")))?;
        let raw = raw.freeze();

        let mut body = raw.slice(HEADER_LEN..HEADER_LEN + body_len);
        let payload = raw.slice(HEADER_LEN + body_len..);

        let record = match rtype {
            RecordType::Begin => {
                let magic = self.g64(&mut body);
                let versioninfo = self.g64(&mut body);
                let creation_time = self.g64(&mut body);
                let kind_raw = self.g32(&mut body);
                let kind = DatasetKind::from_u32(kind_raw).ok_or_else(|| {
                    Error::BadStream(format!("unknown dataset kind {kind_raw}"))
                })?;
                let flags = BeginFlags::from_bits_truncate(self.g32(&mut body));
                let toguid = self.g64(&mut body);
                let fromguid = self.g64(&mut body);
                let mut name = [0u8; TONAME_LEN];
                body.copy_to_slice(&mut name);
                let nul = name.iter().position(|&b| b == 0).unwrap_or(TONAME_LEN);
                let toname = std::str::from_utf8(&name[..nul])
                    .map_err(|_| Error::BadStream("non-UTF-8 snapshot name".into()))?
                    .to_string();
                Record::Begin(BeginRecord {
                    magic,
                    versioninfo,
                    creation_time,
                    kind,
                    flags,
                    toguid,
                    fromguid,
                    toname,
                    payload,
                })
            }
            RecordType::Object => {
                let object = self.g64(&mut body);
                let dnode_type = self.g32(&mut body);
                let bonus_type = self.g32(&mut body);
                let blksz = self.g32(&mut body);
                let bonuslen = self.g32(&mut body) as usize;
                let toguid = self.g64(&mut body);
                if bonuslen > payload.len() {
                    return Err(Error::BadStream(format!(
                        "object bonus length {bonuslen} exceeds payload {}",
                        payload.len()
                    )));
                }
                Record::Object(ObjectRecord {
                    object,
                    dnode_type,
                    bonus_type,
                    blksz,
                    toguid,
                    bonus: payload.slice(..bonuslen),
                })
            }
            RecordType::FreeObjects => Record::FreeObjects(FreeObjectsRecord {
                firstobj: self.g64(&mut body),
                numobjs: self.g64(&mut body),
                toguid: self.g64(&mut body),
            }),
            RecordType::Write => {
                let object = self.g64(&mut body);
                let offset = self.g64(&mut body);
                let length = self.g64(&mut body);
                let toguid = self.g64(&mut body);
                let cktype_raw = body.get_u8();
                let checksum_type = ContentChecksum::from_u8(cktype_raw).ok_or_else(|| {
                    Error::BadStream(format!("unknown checksum type {cktype_raw}"))
                })?;
                let checksum_flags = ChecksumFlags::from_bits_truncate(body.get_u8());
                body.advance(6);
                let key_checksum = self.get_checksum(&mut body);
                let key_prop = self.g64(&mut body);
                if length != payload.len() as u64 {
                    return Err(Error::BadStream(format!(
                        "write length {length} disagrees with payload {}",
                        payload.len()
                    )));
                }
                Record::Write(WriteRecord {
                    object,
                    offset,
                    toguid,
                    checksum_type,
                    checksum_flags,
                    key_checksum,
                    key_prop,
                    data: payload,
                })
            }
            RecordType::WriteByref => {
                let object = self.g64(&mut body);
                let offset = self.g64(&mut body);
                let length = self.g64(&mut body);
                let toguid = self.g64(&mut body);
                let refguid = self.g64(&mut body);
                let refobject = self.g64(&mut body);
                let refoffset = self.g64(&mut body);
                let cktype_raw = body.get_u8();
                let checksum_type = ContentChecksum::from_u8(cktype_raw).ok_or_else(|| {
                    Error::BadStream(format!("unknown checksum type {cktype_raw}"))
                })?;
                let checksum_flags = ChecksumFlags::from_bits_truncate(body.get_u8());
                body.advance(6);
                let key_checksum = self.get_checksum(&mut body);
                let key_prop = self.g64(&mut body);
                Record::WriteByref(WriteByrefRecord {
                    object,
                    offset,
                    length,
                    toguid,
                    refguid,
                    refobject,
                    refoffset,
                    checksum_type,
                    checksum_flags,
                    key_checksum,
                    key_prop,
                })
            }
            RecordType::Free => Record::Free(FreeRecord {
                object: self.g64(&mut body),
                offset: self.g64(&mut body),
                length: self.g64(&mut body),
                toguid: self.g64(&mut body),
            }),
            RecordType::Spill => {
                let object = self.g64(&mut body);
                let length = self.g64(&mut body) as usize;
                let toguid = self.g64(&mut body);
                if length > payload.len() {
                    return Err(Error::BadStream(format!(
                        "spill length {length} exceeds payload {}",
                        payload.len()
                    )));
                }
                Record::Spill(SpillRecord {
                    object,
                    toguid,
                    data: payload.slice(..length),
                })
            }
            RecordType::End => {
                let checksum = self.get_checksum(&mut body);
                let toguid = self.g64(&mut body);
                Record::End(EndRecord { checksum, toguid })
            }
        };

        Ok(Some(RawRecord { record, bytes: raw }))
    }
}

fn body_len(rtype: RecordType) -> usize {
    match rtype {
        RecordType::Begin => BEGIN_BODY_LEN,
        RecordType::Object => 32,
        RecordType::FreeObjects => 24,
        RecordType::Write => 80,
        RecordType::WriteByref => 104,
        RecordType::Free => 32,
        RecordType::Spill => 24,
        RecordType::End => 40,
    }
}

fn pad8(len: usize) -> usize {
    (len + 7) & !7
}

/// `Ok(false)` when the reader was already at EOF; partial reads are
/// stream corruption.
fn read_exact_or_eof(r: &mut dyn Read, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(Error::BadStream(format!(
                    "record header truncated at {filled} bytes"
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

/// Detect byte order from a BEGIN magic read as native.
pub fn magic_is_swapped(magic: u64) -> Option<bool> {
    if magic == STREAM_MAGIC {
        Some(false)
    } else if magic == STREAM_MAGIC.swap_bytes() {
        Some(true)
    } else {
        None
    }
}
