//! Stream deduplication.
//!
//! A single worker thread sits between the record producer and the
//! output, rewriting duplicate WRITE records as WRITE_BYREF. The table
//! never evicts: once the memory budget is reached it keeps serving
//! hits from existing entries and new blocks pass through unreplaced.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::io::{Read, Write};
use std::mem;

use crate::error::{Error, Result};
use crate::stream::checksum::{content_checksum, Checksum256, ContentChecksum, Fletcher4};
use crate::stream::record::{
    feature_bits, ChecksumFlags, Codec, FeatureFlags, Record, WriteByrefRecord,
};

const MAX_DDT_PHYSMEM_PERCENT: u64 = 20;
const SMALLEST_POSSIBLE_MAX_DDT_MB: u64 = 128;

/// Where a block was first seen in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRef {
    pub guid: u64,
    pub object: u64,
    pub offset: u64,
}

#[derive(Debug, Clone)]
struct DedupEntry {
    checksum: Checksum256,
    prop: u64,
    dataref: DataRef,
}

/// Checksum-keyed table of blocks already emitted.
pub struct DedupTable {
    buckets: Vec<Vec<DedupEntry>>,
    hash_bits: u32,
    max_size: u64,
    cur_size: u64,
    count: u64,
    full: bool,
}

fn physmem_bytes() -> u64 {
    #[cfg(unix)]
    {
        let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
        let psize = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
        if pages > 0 && psize > 0 {
            return pages as u64 * psize as u64;
        }
    }
    0
}

/// Default memory budget: 20% of physical memory, floor 128 MiB.
pub fn default_table_budget() -> u64 {
    (physmem_bytes() * MAX_DDT_PHYSMEM_PERCENT / 100)
        .max(SMALLEST_POSSIBLE_MAX_DDT_MB << 20)
}

impl DedupTable {
    pub fn with_budget(max_size: u64) -> DedupTable {
        let entry_size = mem::size_of::<DedupEntry>() as u64;
        let numbuckets = (max_size / entry_size).max(1).next_power_of_two();
        let buckets: Vec<Vec<DedupEntry>> = (0..numbuckets).map(|_| Vec::new()).collect();
        let cur_size = numbuckets * mem::size_of::<Vec<DedupEntry>>() as u64;
        DedupTable {
            hash_bits: numbuckets.trailing_zeros(),
            buckets,
            max_size,
            cur_size,
            count: 0,
            full: false,
        }
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    fn bucket(&self, checksum: &Checksum256) -> usize {
        // Low bits of the first checksum word.
        (checksum.0[0] & ((1u64 << self.hash_bits) - 1)) as usize
    }

    /// Look up `(checksum, prop)`. A hit returns where the block first
    /// appeared; a miss records `dataref` if the budget allows.
    pub fn lookup_or_insert(
        &mut self,
        checksum: Checksum256,
        prop: u64,
        dataref: DataRef,
    ) -> Option<DataRef> {
        let idx = self.bucket(&checksum);
        if let Some(e) = self.buckets[idx]
            .iter()
            .find(|e| e.checksum == checksum && e.prop == prop)
        {
            return Some(e.dataref);
        }

        if self.cur_size >= self.max_size {
            if !self.full {
                tracing::warn!(
                    entries = self.count,
                    "dedup table full, deduplication continues with existing entries"
                );
                self.full = true;
            }
            return None;
        }

        self.buckets[idx].push(DedupEntry {
            checksum,
            prop,
            dataref,
        });
        self.cur_size += mem::size_of::<DedupEntry>() as u64;
        self.count += 1;
        None
    }
}

// =============================================================================
// Blocking record pipe
// =============================================================================

/// Bounded in-process pipe carrying raw stream bytes from the driver to
/// the dedup worker. Backpressure comes from the channel bound.
pub(crate) fn record_pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = bounded(capacity);
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            cur: Bytes::new(),
        },
    )
}

pub(crate) struct PipeWriter {
    tx: Sender<Bytes>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tx
            .send(Bytes::copy_from_slice(buf))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "dedup worker gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub(crate) struct PipeReader {
    rx: Receiver<Bytes>,
    cur: Bytes,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.cur.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.cur = chunk,
                // Sender dropped: end of stream.
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.cur.len());
        buf[..n].copy_from_slice(&self.cur[..n]);
        self.cur = self.cur.slice(n..);
        Ok(n)
    }
}

// =============================================================================
// Worker
// =============================================================================

fn cksum_and_write(out: &mut dyn Write, cksum: &mut Fletcher4, bytes: &[u8]) -> Result<()> {
    cksum.update(bytes);
    out.write_all(bytes).map_err(Error::from)
}

/// Rewrite a raw stream, replacing duplicate WRITEs with WRITE_BYREF.
///
/// Every substream's Fletcher-4 is recomputed over the bytes actually
/// emitted and stamped into its END record. BEGIN records gain the
/// DEDUP and DEDUP_PROPS feature flags.
pub fn dedup_stream(input: &mut dyn Read, budget: u64, out: &mut dyn Write) -> Result<()> {
    let codec = Codec::native();
    let mut table = DedupTable::with_budget(budget);
    let mut stream_cksum = Fletcher4::new();

    while let Some(raw) = codec.read_record(input)? {
        match raw.record {
            Record::Begin(mut begin) => {
                stream_cksum.reset();
                let features = begin.features() | FeatureFlags::DEDUP | FeatureFlags::DEDUP_PROPS;
                begin.versioninfo = (begin.versioninfo & !(FeatureFlags::all().bits() << 2))
                    | (features.bits() << 2);
                debug_assert_eq!(feature_bits(begin.versioninfo), features.bits());
                cksum_and_write(out, &mut stream_cksum, &codec.encode(&Record::Begin(begin)))?;
            }
            Record::End(mut end) => {
                // Stamp the recalculated checksum; the END itself is
                // never folded in.
                end.checksum = stream_cksum.value();
                out.write_all(&codec.encode(&Record::End(end)))?;
            }
            Record::Write(mut write) => {
                // Reuse the producer's checksum when it can key dedup,
                // else compute a strong one here.
                if write.key_checksum.is_zero()
                    || !write.checksum_flags.contains(ChecksumFlags::DEDUP)
                {
                    write.key_checksum = content_checksum(&write.data);
                    write.checksum_type = ContentChecksum::Strong256;
                    write.checksum_flags = ChecksumFlags::DEDUP;
                }

                let dataref = DataRef {
                    guid: write.toguid,
                    object: write.object,
                    offset: write.offset,
                };
                match table.lookup_or_insert(write.key_checksum, write.key_prop, dataref) {
                    Some(first) => {
                        let byref = WriteByrefRecord {
                            object: write.object,
                            offset: write.offset,
                            length: write.data.len() as u64,
                            toguid: write.toguid,
                            refguid: first.guid,
                            refobject: first.object,
                            refoffset: first.offset,
                            checksum_type: write.checksum_type,
                            checksum_flags: write.checksum_flags,
                            key_checksum: write.key_checksum,
                            key_prop: write.key_prop,
                        };
                        cksum_and_write(
                            out,
                            &mut stream_cksum,
                            &codec.encode(&Record::WriteByref(byref)),
                        )?;
                    }
                    None => {
                        cksum_and_write(
                            out,
                            &mut stream_cksum,
                            &codec.encode(&Record::Write(write)),
                        )?;
                    }
                }
            }
            // OBJECT, FREEOBJECTS, FREE, SPILL, WRITE_BYREF pass
            // through byte-identical.
            _ => cksum_and_write(out, &mut stream_cksum, &raw.bytes)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::record::{
        versioninfo, BeginFlags, BeginRecord, DatasetKind, EndRecord, HeaderKind, WriteRecord,
        STREAM_MAGIC,
    };
    use std::io::Cursor;

    fn begin(toguid: u64) -> Record {
        Record::Begin(BeginRecord {
            magic: STREAM_MAGIC,
            versioninfo: versioninfo(HeaderKind::Substream, FeatureFlags::empty()),
            creation_time: 0,
            kind: DatasetKind::Filesystem,
            flags: BeginFlags::empty(),
            toguid,
            fromguid: 0,
            toname: "tank/fs@s1".into(),
            payload: Bytes::new(),
        })
    }

    fn write(toguid: u64, object: u64, offset: u64, data: &'static [u8]) -> Record {
        Record::Write(WriteRecord {
            object,
            offset,
            toguid,
            checksum_type: ContentChecksum::None,
            checksum_flags: ChecksumFlags::empty(),
            key_checksum: Checksum256::ZERO,
            key_prop: 0,
            data: Bytes::from_static(data),
        })
    }

    fn run_dedup(records: &[Record], budget: u64) -> Vec<Record> {
        let codec = Codec::native();
        let mut input = Vec::new();
        for r in records {
            input.extend_from_slice(&codec.encode(r));
        }
        let mut out = Vec::new();
        dedup_stream(&mut Cursor::new(input), budget, &mut out).unwrap();

        let mut decoded = Vec::new();
        let mut rd = Cursor::new(out);
        while let Some(raw) = codec.read_record(&mut rd).unwrap() {
            decoded.push(raw.record);
        }
        decoded
    }

    #[test]
    fn duplicate_block_becomes_byref() {
        let block = b"same bytes in both writes";
        let records = vec![
            begin(9),
            write(9, 1, 0, block),
            write(9, 2, 8192, block),
            Record::End(EndRecord {
                checksum: Checksum256::ZERO,
                toguid: 9,
            }),
        ];
        let out = run_dedup(&records, 1 << 20);
        assert_eq!(out.len(), 4);

        match (&out[1], &out[2]) {
            (Record::Write(w), Record::WriteByref(br)) => {
                assert_eq!(w.object, 1);
                assert_eq!(br.object, 2);
                assert_eq!(br.refguid, 9);
                assert_eq!(br.refobject, 1);
                // First occurrence was at offset zero; the reference
                // must say so even though zero looks like a default.
                assert_eq!(br.refoffset, 0);
                assert_eq!(br.length, block.len() as u64);
                assert_eq!(br.key_checksum, w.key_checksum);
            }
            other => panic!("expected Write then WriteByref, got {other:?}"),
        }
    }

    #[test]
    fn begin_gains_dedup_flags_and_end_restamped() {
        let records = vec![
            begin(9),
            write(9, 1, 0, b"data"),
            Record::End(EndRecord {
                checksum: Checksum256::ZERO,
                toguid: 9,
            }),
        ];
        let out = run_dedup(&records, 1 << 20);
        match &out[0] {
            Record::Begin(b) => {
                assert!(b.features().contains(FeatureFlags::DEDUP));
                assert!(b.features().contains(FeatureFlags::DEDUP_PROPS));
            }
            other => panic!("expected Begin, got {other:?}"),
        }

        // END must carry the Fletcher-4 of the rewritten stream.
        let codec = Codec::native();
        let mut expect = Fletcher4::new();
        expect.update(&codec.encode(&out[0]));
        expect.update(&codec.encode(&out[1]));
        match &out[2] {
            Record::End(e) => assert_eq!(e.checksum, expect.value()),
            other => panic!("expected End, got {other:?}"),
        }
    }

    #[test]
    fn distinct_props_do_not_dedup() {
        let mut w1 = write(9, 1, 0, b"block");
        let mut w2 = write(9, 2, 0, b"block");
        if let Record::Write(w) = &mut w1 {
            w.key_prop = 1;
        }
        if let Record::Write(w) = &mut w2 {
            w.key_prop = 2;
        }
        let records = vec![
            begin(9),
            w1,
            w2,
            Record::End(EndRecord {
                checksum: Checksum256::ZERO,
                toguid: 9,
            }),
        ];
        let out = run_dedup(&records, 1 << 20);
        assert!(matches!(out[1], Record::Write(_)));
        assert!(matches!(out[2], Record::Write(_)));
    }

    #[test]
    fn saturated_table_still_dedups_existing_entries() {
        let mut table = DedupTable::with_budget(0);
        let ck_a = content_checksum(b"a");
        let ck_b = content_checksum(b"b");
        let r = DataRef {
            guid: 1,
            object: 1,
            offset: 0,
        };
        // Budget of zero: nothing inserts, nothing hits, no eviction.
        assert_eq!(table.lookup_or_insert(ck_a, 0, r), None);
        assert_eq!(table.lookup_or_insert(ck_a, 0, r), None);
        assert_eq!(table.lookup_or_insert(ck_b, 0, r), None);
        assert!(table.is_full());
        assert!(table.is_empty());
    }

    #[test]
    fn table_hit_returns_first_ref() {
        let mut table = DedupTable::with_budget(1 << 16);
        let ck = content_checksum(b"payload");
        let first = DataRef {
            guid: 1,
            object: 10,
            offset: 0,
        };
        let second = DataRef {
            guid: 1,
            object: 11,
            offset: 512,
        };
        assert_eq!(table.lookup_or_insert(ck, 0, first), None);
        assert_eq!(table.lookup_or_insert(ck, 0, second), Some(first));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn budget_floor_applies() {
        assert!(default_table_budget() >= SMALLEST_POSSIBLE_MAX_DDT_MB << 20);
    }

    #[test]
    fn pipe_moves_bytes_and_signals_eof() {
        let (mut w, mut r) = record_pipe(4);
        std::thread::spawn(move || {
            w.write_all(b"hello ").unwrap();
            w.write_all(b"world").unwrap();
        });
        let mut got = String::new();
        r.read_to_string(&mut got).unwrap();
        assert_eq!(got, "hello world");
    }
}
