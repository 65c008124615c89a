#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use proptest::prelude::*;
    use snapsend::engine::PoolEngine;
    use snapsend::mempool::MemPool;
    use snapsend::recv::{self, RecvFlags};
    use snapsend::send::{self, SendFlags};
    use snapsend::stream::{
        versioninfo, BeginFlags, BeginRecord, ChecksumFlags, Checksum256, Codec, ContentChecksum,
        DatasetKind, EndRecord, FeatureFlags, Fletcher4, HeaderKind, ObjectRecord, Record,
        WriteRecord, BEGIN_WIRE_LEN, STREAM_MAGIC,
    };
    use std::collections::BTreeMap;

    fn send_to_vec(
        pool: &MemPool,
        dataset: &str,
        fromsnap: Option<&str>,
        tosnap: &str,
        flags: &SendFlags,
    ) -> snapsend::Result<Vec<u8>> {
        let mut out = Vec::new();
        send::send(pool, dataset, fromsnap, tosnap, flags, &mut out)?;
        Ok(out)
    }

    fn recv_stream(
        pool: &MemPool,
        tosnap: &str,
        flags: &RecvFlags,
        stream: &[u8],
    ) -> snapsend::Result<recv::RecvSummary> {
        recv::receive(pool, tosnap, flags, &BTreeMap::new(), &mut &stream[..])
    }

    fn records_of(stream: &[u8]) -> Vec<Record> {
        let codec = Codec::native();
        let mut rd = stream;
        let mut out = Vec::new();
        while let Some(raw) = codec.read_record(&mut rd).unwrap() {
            out.push(raw.record);
        }
        out
    }

    #[test]
    fn dedup_send_rewrites_duplicates_and_roundtrips() -> anyhow::Result<()> {
        let src = MemPool::new();
        src.create_fs("tank")?;
        src.create_fs("tank/data")?;
        src.write_block("tank/data", 1, 0, b"duplicated bytes")?;
        src.write_block("tank/data", 1, 8192, b"duplicated bytes")?;
        src.write_block("tank/data", 2, 0, b"one of a kind")?;
        src.snapshot("tank/data", "s1")?;

        let flags = SendFlags {
            dedup: true,
            ..Default::default()
        };
        let stream = send_to_vec(&src, "tank/data", None, "s1", &flags)?;

        let records = records_of(&stream);
        match &records[0] {
            Record::Begin(b) => {
                assert!(b.features().contains(FeatureFlags::DEDUP));
                assert!(b.features().contains(FeatureFlags::DEDUP_PROPS));
            }
            other => panic!("expected Begin first, got {other:?}"),
        }
        let writes = records
            .iter()
            .filter(|r| matches!(r, Record::Write(_)))
            .count();
        let byrefs: Vec<_> = records
            .iter()
            .filter_map(|r| match r {
                Record::WriteByref(br) => Some(br),
                _ => None,
            })
            .collect();
        assert_eq!(writes, 2);
        assert_eq!(byrefs.len(), 1);
        // The second copy points back at the first occurrence.
        assert_eq!(byrefs[0].object, 1);
        assert_eq!(byrefs[0].offset, 8192);
        assert_eq!(byrefs[0].refobject, 1);
        assert_eq!(byrefs[0].refoffset, 0);
        assert_eq!(byrefs[0].refguid, src.stat("tank/data@s1")?.guid);

        let dst = MemPool::new();
        dst.create_fs("backup")?;
        recv_stream(&dst, "backup/data", &RecvFlags::default(), &stream)?;
        assert_eq!(
            dst.read_block("backup/data", 1, 8192).unwrap(),
            Bytes::from_static(b"duplicated bytes")
        );
        assert_eq!(
            dst.read_block("backup/data", 2, 0).unwrap(),
            Bytes::from_static(b"one of a kind")
        );
        Ok(())
    }

    #[test]
    fn replicated_dedup_resolves_cross_filesystem_refs() -> anyhow::Result<()> {
        let src = MemPool::new();
        src.create_fs("tank")?;
        src.create_fs("tank/data")?;
        src.create_fs("tank/data/copy")?;
        src.write_block("tank/data", 1, 0, b"shared everywhere")?;
        src.write_block("tank/data/copy", 1, 0, b"shared everywhere")?;
        src.snapshot("tank/data", "s1")?;
        src.snapshot("tank/data/copy", "s1")?;

        let flags = SendFlags {
            replicate: true,
            dedup: true,
            ..Default::default()
        };
        let stream = send_to_vec(&src, "tank/data", None, "s1", &flags)?;

        // The duplicate in the second filesystem references the first
        // filesystem's substream.
        let first_guid = src.stat("tank/data@s1")?.guid;
        let byref = records_of(&stream)
            .into_iter()
            .find_map(|r| match r {
                Record::WriteByref(br) => Some(br),
                _ => None,
            })
            .expect("no backreference in stream");
        assert_eq!(byref.refguid, first_guid);
        assert_ne!(byref.toguid, first_guid);

        let dst = MemPool::new();
        dst.create_fs("backup")?;
        let summary = recv_stream(&dst, "backup/data", &RecvFlags::default(), &stream)?;
        assert_eq!(summary.received, 2);
        assert_eq!(
            dst.read_block("backup/data/copy", 1, 0).unwrap(),
            Bytes::from_static(b"shared everywhere")
        );
        Ok(())
    }

    #[test]
    fn byteswapped_substream_is_received() -> anyhow::Result<()> {
        // Build the stream an opposite-byte-order sender would emit.
        let codec = Codec::swapped();
        let toguid = 0x1234u64;
        let begin = codec.encode(&Record::Begin(BeginRecord {
            magic: STREAM_MAGIC,
            versioninfo: versioninfo(HeaderKind::Substream, FeatureFlags::SA_SPILL),
            creation_time: 1,
            kind: DatasetKind::Filesystem,
            flags: BeginFlags::empty(),
            toguid,
            fromguid: 0,
            toname: "tank/data@s1".into(),
            payload: Bytes::new(),
        }));
        let object = codec.encode(&Record::Object(ObjectRecord {
            object: 1,
            dnode_type: 0x13,
            bonus_type: 0x11,
            blksz: 4096,
            toguid,
            bonus: Bytes::new(),
        }));
        let write = codec.encode(&Record::Write(WriteRecord {
            object: 1,
            offset: 0,
            toguid,
            checksum_type: ContentChecksum::None,
            checksum_flags: ChecksumFlags::empty(),
            key_checksum: Checksum256::ZERO,
            key_prop: 0,
            data: Bytes::from_static(b"swapped payload!"),
        }));

        // The wire checksum is over the sender's native bytes; folding
        // the swapped wire with the byteswapping update reproduces it.
        let mut cksum = Fletcher4::new();
        cksum.update_byteswap(&begin);
        cksum.update_byteswap(&object);
        cksum.update_byteswap(&write);
        let end = codec.encode(&Record::End(EndRecord {
            checksum: cksum.value(),
            toguid,
        }));

        let mut stream = Vec::new();
        stream.extend_from_slice(&begin);
        stream.extend_from_slice(&object);
        stream.extend_from_slice(&write);
        stream.extend_from_slice(&end);

        let dst = MemPool::new();
        dst.create_fs("backup")?;
        recv_stream(&dst, "backup/data", &RecvFlags::default(), &stream)?;
        assert_eq!(
            dst.read_block("backup/data@s1", 1, 0).unwrap(),
            Bytes::from_static(b"swapped payload!")
        );
        assert_eq!(dst.stat("backup/data@s1")?.guid, toguid);
        Ok(())
    }

    fn checksummed_stream() -> Vec<u8> {
        let src = MemPool::new();
        src.create_fs("tank").unwrap();
        src.create_fs("tank/data").unwrap();
        src.write_block("tank/data", 1, 0, b"first block of data").unwrap();
        src.write_block("tank/data", 1, 4096, b"second block of data").unwrap();
        src.write_block("tank/data", 2, 0, b"third block of data").unwrap();
        src.snapshot("tank/data", "s1").unwrap();
        send_to_vec(&src, "tank/data", None, "s1", &SendFlags::default()).unwrap()
    }

    proptest! {
        // Every byte between the stream header and the END record is
        // covered by either the Fletcher-4 fold or a per-block content
        // checksum; flipping any single bit must fail the receive.
        #[test]
        fn single_bit_corruption_is_detected(
            pos in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let stream = checksummed_stream();
            let start = BEGIN_WIRE_LEN;
            let end = stream.len() - 48; // END frame: 8 header + 40 body
            let idx = start + pos.index(end - start);

            let mut corrupt = stream.clone();
            corrupt[idx] ^= 1 << bit;

            let dst = MemPool::new();
            dst.create_fs("backup").unwrap();
            prop_assert!(recv_stream(&dst, "backup/data", &RecvFlags::default(), &corrupt).is_err());
            prop_assert!(!dst.dataset_exists("backup/data"));
        }
    }
}
