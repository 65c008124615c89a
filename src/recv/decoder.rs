//! Stream header validation and package framing for receive.
//!
//! The BEGIN record is read field-wise before any byte-order decision
//! can be made: the magic tells us whether the sender ran on the other
//! byte order, and only then can the rest of the record (and stream) be
//! interpreted. The raw unswapped BEGIN bytes are kept verbatim for the
//! apply step.

use bytes::Bytes;
use std::io::Read;

use crate::error::{Error, Result};
use crate::stream::checksum::Fletcher4;
use crate::stream::record::{
    feature_bits, features_supported, header_kind, magic_is_swapped, BeginFlags, BeginRecord,
    Codec, DatasetKind, HeaderKind, Record, RecordType, BEGIN_BODY_LEN, HEADER_LEN,
    MAX_PAYLOAD_LEN, TONAME_LEN,
};

/// Result of reading the first record of a (sub)stream.
#[derive(Debug)]
pub enum StreamStart {
    /// A trailing END where a BEGIN would be: the package is over.
    EndOfPackage,
    Header(Box<StreamHeader>),
}

#[derive(Debug)]
pub struct StreamHeader {
    pub begin: BeginRecord,
    /// The sender's BEGIN bytes, header+body, byte-for-byte.
    pub raw_begin: Bytes,
    pub swap: bool,
    /// Compound payload length declared by the header.
    pub payload_len: usize,
    /// Running checksum with the BEGIN already folded in.
    pub cksum: Fletcher4,
}

impl StreamHeader {
    pub fn kind(&self) -> HeaderKind {
        // validate() already rejected anything else.
        match header_kind(self.begin.versioninfo) {
            Some(k) => k,
            None => HeaderKind::Substream,
        }
    }
}

fn read_exact(input: &mut dyn Read, buf: &mut [u8]) -> Result<()> {
    input
        .read_exact(buf)
        .map_err(|_| Error::BadStream("failed to read from stream".into()))
}

fn get_u32(raw: &[u8], off: usize, swap: bool) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&raw[off..off + 4]);
    let v = u32::from_ne_bytes(b);
    if swap {
        v.swap_bytes()
    } else {
        v
    }
}

fn get_u64(raw: &[u8], off: usize, swap: bool) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&raw[off..off + 8]);
    let v = u64::from_ne_bytes(b);
    if swap {
        v.swap_bytes()
    } else {
        v
    }
}

/// Read the record that starts a stream or substream.
///
/// Returns `EndOfPackage` for the doubled END at the end of a compound
/// package. Anything other than a BEGIN or END is a bad stream.
pub fn read_stream_start(input: &mut dyn Read) -> Result<StreamStart> {
    let mut header = [0u8; HEADER_LEN];
    read_exact(input, &mut header)?;

    let rtype = get_u32(&header, 0, false);
    let end = RecordType::End as u32;
    if rtype == end || rtype == end.swap_bytes() {
        // Consume the END body; its checksum is not interesting here.
        let mut body = [0u8; 40];
        read_exact(input, &mut body)?;
        return Ok(StreamStart::EndOfPackage);
    }

    let mut body = vec![0u8; BEGIN_BODY_LEN];
    read_exact(input, &mut body)?;

    let magic = get_u64(&body, 0, false);
    let swap = match magic_is_swapped(magic) {
        Some(s) => s,
        None => return Err(Error::BadStream("bad magic number".into())),
    };

    let begin_type = get_u32(&header, 0, swap);
    if begin_type != RecordType::Begin as u32 {
        return Err(Error::BadStream("bad magic number".into()));
    }
    let payload_len = get_u32(&header, 4, swap) as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(Error::BadStream(format!(
            "header payload length {payload_len} exceeds limit"
        )));
    }

    let mut raw = Vec::with_capacity(HEADER_LEN + BEGIN_BODY_LEN);
    raw.extend_from_slice(&header);
    raw.extend_from_slice(&body);
    let raw_begin = Bytes::from(raw);

    // The checksum covers the BEGIN bytes in the sender's word order.
    let mut cksum = Fletcher4::new();
    if swap {
        cksum.update_byteswap(&raw_begin);
    } else {
        cksum.update(&raw_begin);
    }

    let kind_raw = get_u32(&body, 24, swap);
    let kind = DatasetKind::from_u32(kind_raw)
        .ok_or_else(|| Error::BadStream(format!("unknown dataset kind {kind_raw}")))?;
    let name_off = 48;
    let name = &body[name_off..name_off + TONAME_LEN];
    let nul = name.iter().position(|&b| b == 0).unwrap_or(TONAME_LEN);
    let toname = std::str::from_utf8(&name[..nul])
        .map_err(|_| Error::BadStream("non-UTF-8 snapshot name".into()))?
        .to_string();

    let begin = BeginRecord {
        magic: if swap { magic.swap_bytes() } else { magic },
        versioninfo: get_u64(&body, 8, swap),
        creation_time: get_u64(&body, 16, swap),
        kind,
        flags: BeginFlags::from_bits_truncate(get_u32(&body, 28, swap)),
        toguid: get_u64(&body, 32, swap),
        fromguid: get_u64(&body, 40, swap),
        toname,
        payload: Bytes::new(),
    };

    Ok(StreamStart::Header(Box::new(StreamHeader {
        begin,
        raw_begin,
        swap,
        payload_len,
        cksum,
    })))
}

/// Reject headers we cannot act on.
pub fn validate_header(h: &StreamHeader) -> Result<()> {
    if !features_supported(h.begin.versioninfo) {
        return Err(Error::BadVersion(feature_bits(h.begin.versioninfo)));
    }
    if header_kind(h.begin.versioninfo).is_none() {
        return Err(Error::BadVersion(h.begin.versioninfo));
    }
    if !h.begin.toname.contains('@') {
        return Err(Error::BadStream("bad snapshot name".into()));
    }
    Ok(())
}

/// Read the packed topology that follows a compound BEGIN, folding it
/// into the running checksum.
pub fn read_package_payload(
    input: &mut dyn Read,
    len: usize,
    swap: bool,
    cksum: &mut Fletcher4,
) -> Result<Bytes> {
    let mut buf = vec![0u8; len];
    read_exact(input, &mut buf)?;
    if swap {
        cksum.update_byteswap(&buf);
    } else {
        cksum.update(&buf);
    }
    Ok(Bytes::from(buf))
}

/// Read the END that closes a compound header and verify its checksum
/// against everything read so far. The END itself is never folded in.
pub fn read_package_end(input: &mut dyn Read, swap: bool, cksum: &Fletcher4) -> Result<()> {
    let codec = if swap { Codec::swapped() } else { Codec::native() };
    let raw = codec
        .read_record(input)?
        .ok_or_else(|| Error::BadStream("failed to read from stream".into()))?;
    let end = match raw.record {
        Record::End(e) => e,
        other => {
            return Err(Error::BadStream(format!(
                "expected end record, found {:?}",
                other.record_type()
            )))
        }
    };
    if end.checksum != cksum.value() {
        return Err(Error::BadStream("incorrect header checksum".into()));
    }
    Ok(())
}

/// Consume and discard a substream's records up to and including its
/// END. Used for dry runs and benign already-exists races.
pub fn skip_substream(input: &mut dyn Read, swap: bool) -> Result<()> {
    let codec = if swap { Codec::swapped() } else { Codec::native() };
    loop {
        let raw = codec
            .read_record(input)?
            .ok_or_else(|| Error::BadStream("failed to read from stream".into()))?;
        match raw.record {
            Record::Begin(b) => {
                if !b.payload.is_empty() {
                    return Err(Error::BadStream("invalid substream header".into()));
                }
            }
            Record::End(_) => return Ok(()),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::checksum::Checksum256;
    use crate::stream::record::{versioninfo, EndRecord, FeatureFlags, STREAM_MAGIC};
    use std::io::Cursor;

    fn begin_record(kind: HeaderKind, features: FeatureFlags) -> BeginRecord {
        BeginRecord {
            magic: STREAM_MAGIC,
            versioninfo: versioninfo(kind, features),
            creation_time: 7,
            kind: DatasetKind::Filesystem,
            flags: BeginFlags::empty(),
            toguid: 11,
            fromguid: 0,
            toname: "tank/fs@s1".into(),
            payload: Bytes::new(),
        }
    }

    #[test]
    fn start_parses_native_begin() {
        let rec = begin_record(HeaderKind::Substream, FeatureFlags::SA_SPILL);
        let wire = Codec::native().encode(&Record::Begin(rec.clone()));
        let mut rd = Cursor::new(wire.to_vec());
        match read_stream_start(&mut rd).unwrap() {
            StreamStart::Header(h) => {
                assert!(!h.swap);
                assert_eq!(h.begin, rec);
                assert_eq!(h.raw_begin, wire);
                validate_header(&h).unwrap();
            }
            StreamStart::EndOfPackage => panic!("expected header"),
        }
    }

    #[test]
    fn start_detects_byteswapped_begin() {
        let rec = begin_record(HeaderKind::Substream, FeatureFlags::empty());
        let wire = Codec::swapped().encode(&Record::Begin(rec.clone()));
        let mut rd = Cursor::new(wire.to_vec());
        match read_stream_start(&mut rd).unwrap() {
            StreamStart::Header(h) => {
                assert!(h.swap);
                assert_eq!(h.begin, rec);
                // Raw bytes stay exactly as the sender wrote them.
                assert_eq!(h.raw_begin, wire);
            }
            StreamStart::EndOfPackage => panic!("expected header"),
        }
    }

    #[test]
    fn start_sees_package_end() {
        let end = Record::End(EndRecord {
            checksum: Checksum256::ZERO,
            toguid: 0,
        });
        let wire = Codec::native().encode(&end);
        let mut rd = Cursor::new(wire.to_vec());
        assert!(matches!(
            read_stream_start(&mut rd).unwrap(),
            StreamStart::EndOfPackage
        ));
    }

    #[test]
    fn bad_magic_rejected() {
        let mut rec = begin_record(HeaderKind::Substream, FeatureFlags::empty());
        rec.magic = 0x1234;
        let wire = Codec::native().encode(&Record::Begin(rec));
        let mut rd = Cursor::new(wire.to_vec());
        match read_stream_start(&mut rd) {
            Err(Error::BadStream(msg)) => assert!(msg.contains("magic")),
            other => panic!("expected BadStream, got {other:?}"),
        }
    }

    #[test]
    fn unknown_feature_flag_is_bad_version() {
        let mut rec = begin_record(HeaderKind::Substream, FeatureFlags::empty());
        rec.versioninfo |= 1 << 40;
        let wire = Codec::native().encode(&Record::Begin(rec));
        let mut rd = Cursor::new(wire.to_vec());
        match read_stream_start(&mut rd).unwrap() {
            StreamStart::Header(h) => match validate_header(&h) {
                Err(Error::BadVersion(_)) => {}
                other => panic!("expected BadVersion, got {other:?}"),
            },
            StreamStart::EndOfPackage => panic!("expected header"),
        }
    }

    #[test]
    fn missing_at_sign_is_bad_stream() {
        let mut rec = begin_record(HeaderKind::Substream, FeatureFlags::empty());
        rec.toname = "tank/fs".into();
        let wire = Codec::native().encode(&Record::Begin(rec));
        let mut rd = Cursor::new(wire.to_vec());
        match read_stream_start(&mut rd).unwrap() {
            StreamStart::Header(h) => match validate_header(&h) {
                Err(Error::BadStream(_)) => {}
                other => panic!("expected BadStream, got {other:?}"),
            },
            StreamStart::EndOfPackage => panic!("expected header"),
        }
    }

    #[test]
    fn package_end_checksum_mismatch() {
        let codec = Codec::native();
        let end = Record::End(EndRecord {
            checksum: Checksum256([9, 9, 9, 9]),
            toguid: 0,
        });
        let wire = codec.encode(&end);
        let mut rd = Cursor::new(wire.to_vec());
        let cksum = Fletcher4::new();
        match read_package_end(&mut rd, false, &cksum) {
            Err(Error::BadStream(msg)) => assert!(msg.contains("header checksum")),
            other => panic!("expected BadStream, got {other:?}"),
        }
    }
}
