//! Read path
//!
//! A read composes its result from the clean block plus every dirty
//! overlay whose completion has fired, newest last. Regions whose
//! presence bit was never set read as zeros. The reported version is the
//! newest overlaying version; with data checksums enabled, clean-area
//! reads verify each covered checksum block and fail with EDOM on a
//! mismatch so the layer above can reconstruct from peers.

use crate::engine::{BlockStore, OpProgress, OpResult};
use crate::index::{Stage, WriteKind};
use crate::ring::{FileId, OpId};
use blockio_common::bitmap::bit_test;
use blockio_common::{compute_crc32c, Error, ObjVer};
use bytes::Bytes;
use tracing::warn;

impl BlockStore {
    /// Serve a READ in one loop step
    pub(crate) fn dequeue_read(&mut self, id: OpId) -> OpProgress {
        let (oid, offset, len) = {
            let slot = self.slot(id);
            (slot.oid, slot.offset, slot.len)
        };
        let mut buf = vec![0u8; len as usize];
        let mut version = 0u64;
        let bmp_size = self.layout.clean_entry_bitmap_size as usize;
        let mut bitmap = vec![0u8; bmp_size];

        // Clean base
        if let Some(clean) = self.clean.get(oid) {
            version = clean.version;
            let block = clean.location / u64::from(self.layout.data_block_size);
            bitmap.copy_from_slice(self.meta.ext_bitmap(block));
            if let Err(e) = self.read_clean_range(clean.location, block, offset, &mut buf) {
                self.fail_op(id, &e);
                return OpProgress::Done;
            }
        }

        // Dirty overlays, ascending: the newest data wins. An entry is
        // observable once its completion has fired (WRITTEN or later);
        // submitted-but-unfinished writes are invisible.
        let overlays: Vec<ObjVer> = self
            .dirty
            .versions_of(oid)
            .filter(|(_, e)| e.stage >= Stage::Written)
            .map(|(k, _)| *k)
            .collect();
        for key in overlays {
            let entry = self.dirty.get(&key).unwrap();
            version = key.version;
            match entry.kind {
                WriteKind::Delete => {
                    buf.fill(0);
                    bitmap.fill(0);
                }
                WriteKind::Big | WriteKind::Small => {
                    bitmap.copy_from_slice(entry.bitmap(bmp_size));
                    let (e_off, e_len, location, kind) =
                        (entry.offset, entry.len, entry.location, entry.kind);
                    if e_len == 0 {
                        continue;
                    }
                    let from = e_off.max(offset);
                    let to = (e_off + e_len).min(offset + len);
                    if from >= to {
                        continue;
                    }
                    let dst = &mut buf[(from - offset) as usize..(to - offset) as usize];
                    if kind == WriteKind::Big {
                        // Data block region written directly in the data area
                        let pos = self.layout.data_offset + location + u64::from(from);
                        if let Err(e) = self.ring.read_now(FileId::Data, pos, dst) {
                            self.fail_op(id, &e);
                            return OpProgress::Done;
                        }
                    } else {
                        // Journaled payload
                        let rel = u64::from(from - e_off);
                        if let Some(payload) =
                            self.journal.mirror_read(location + rel, dst.len())
                        {
                            dst.copy_from_slice(payload);
                        } else {
                            let pos = self.layout.journal_pos(location + rel);
                            if let Err(e) = self.ring.read_now(FileId::Journal, pos, dst) {
                                self.fail_op(id, &e);
                                return OpProgress::Done;
                            }
                        }
                    }
                }
            }
        }

        self.finish_op_with(
            id,
            OpResult {
                retval: i64::from(len),
                version,
                data: Some(Bytes::from(buf)),
                bitmap: Some(bitmap),
                objects: None,
            },
        );
        OpProgress::Done
    }

    /// Copy the clean block's contribution into `buf`, honoring presence
    /// bits and verifying checksums where enabled
    fn read_clean_range(
        &mut self,
        location: u64,
        block: u64,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        let gran = self.layout.bitmap_granularity;
        let len = buf.len() as u32;
        if self.layout.csum_block_size != 0 {
            return self.read_clean_range_verified(location, block, offset, buf);
        }
        // Coalesce adjacent present granules into single reads
        let first = offset / gran;
        let last = (offset + len - 1) / gran;
        let mut run_start: Option<u32> = None;
        let presence = self.meta.presence(block).to_vec();
        for g in first..=last + 1 {
            let present = g <= last && bit_test(&presence, u64::from(g));
            match (present, run_start) {
                (true, None) => run_start = Some(g),
                (false, Some(start)) => {
                    let from = (start * gran).max(offset);
                    let to = (g * gran).min(offset + len);
                    let dst = &mut buf[(from - offset) as usize..(to - offset) as usize];
                    let pos = self.layout.data_offset + location + u64::from(from);
                    self.ring.read_now(FileId::Data, pos, dst)?;
                    run_start = None;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Checksum-verified variant: whole checksum blocks are read so the
    /// stored CRC32C can be checked before any byte is used
    fn read_clean_range_verified(
        &mut self,
        location: u64,
        block: u64,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        let cbs = self.layout.csum_block_size;
        let gran = self.layout.bitmap_granularity;
        let len = buf.len() as u32;
        let presence = self.meta.presence(block).to_vec();
        let csums = self.meta.csums(block).to_vec();
        let first = offset / cbs;
        let last = (offset + len - 1) / cbs;
        let mut chunk = vec![0u8; cbs as usize];
        for i in first..=last {
            let block_start = i * cbs;
            let any_present = (block_start / gran..(block_start + cbs).div_ceil(gran))
                .any(|g| bit_test(&presence, u64::from(g)));
            if !any_present {
                continue;
            }
            let pos = self.layout.data_offset + location + u64::from(block_start);
            self.ring.read_now(FileId::Data, pos, &mut chunk)?;
            let stored = u32::from_le_bytes(
                csums[(i * 4) as usize..(i * 4 + 4) as usize].try_into().unwrap(),
            );
            if compute_crc32c(&chunk) != stored {
                warn!(
                    "checksum mismatch in clean block {} csum block {}",
                    block, i
                );
                return Err(Error::ChecksumMismatch {
                    block,
                    offset: u64::from(block_start),
                });
            }
            // Copy the requested part, masking never-written granules
            let from = block_start.max(offset);
            let to = (block_start + cbs).min(offset + len);
            for g in from / gran..(to + gran - 1) / gran {
                if !bit_test(&presence, u64::from(g)) {
                    continue;
                }
                let g_from = (g * gran).max(from);
                let g_to = ((g + 1) * gran).min(to);
                buf[(g_from - offset) as usize..(g_to - offset) as usize].copy_from_slice(
                    &chunk[(g_from - block_start) as usize..(g_to - block_start) as usize],
                );
            }
        }
        Ok(())
    }
}
