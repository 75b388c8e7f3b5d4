//! Object enumeration
//!
//! LIST returns the stable objects of an inode range, optionally
//! filtered down to one placement group. An object `(inode, stripe)`
//! belongs to PG `(stripe / pg_stripe_size) % pg_count`; recovery and
//! scrub on the layer above walk PGs one at a time with this.

use crate::engine::{BlockStore, ListFilter, ObjectListing, OpProgress, OpResult};
use crate::index::{Stage, WriteKind};
use crate::ring::OpId;
use blockio_common::Oid;
use std::collections::HashMap;

impl BlockStore {
    /// Serve a LIST in one loop step
    pub(crate) fn dequeue_list(&mut self, id: OpId) -> OpProgress {
        let filter = self.slot(id).filter.expect("LIST filter checked at intake");

        // Clean entries first, then stable dirty entries override:
        // a stable delete removes the object, a stable write bumps it
        let mut objects: HashMap<Oid, Option<u64>> = HashMap::new();
        for (&oid, entry) in self.clean.iter() {
            if Self::filter_match(&filter, oid, self.layout.data_block_size) {
                objects.insert(oid, Some(entry.version));
            }
        }
        for (key, entry) in self.dirty.iter() {
            if entry.stage != Stage::Stable {
                continue;
            }
            if !Self::filter_match(&filter, key.oid, self.layout.data_block_size) {
                continue;
            }
            match entry.kind {
                WriteKind::Delete => {
                    objects.insert(key.oid, None);
                }
                _ => {
                    let slot = objects.entry(key.oid).or_insert(None);
                    *slot = Some(slot.map_or(key.version, |v| v.max(key.version)));
                }
            }
        }

        let mut listing: Vec<ObjectListing> = objects
            .into_iter()
            .filter_map(|(oid, version)| version.map(|version| ObjectListing { oid, version }))
            .collect();
        listing.sort_by_key(|o| o.oid);

        let retval = listing.len() as i64;
        self.finish_op_with(
            id,
            OpResult {
                retval,
                version: 0,
                data: None,
                bitmap: None,
                objects: Some(listing),
            },
        );
        OpProgress::Done
    }

    fn filter_match(filter: &ListFilter, oid: Oid, block_size: u32) -> bool {
        if oid.inode < filter.min_inode {
            return false;
        }
        if filter.max_inode != 0 && oid.inode > filter.max_inode {
            return false;
        }
        if filter.pg_count > 0 {
            let stripe_size = if filter.pg_stripe_size != 0 {
                filter.pg_stripe_size
            } else {
                u64::from(block_size)
            };
            if (oid.stripe / stripe_size) % filter.pg_count != filter.pg_number {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_inode_range() {
        let filter = ListFilter {
            min_inode: 10,
            max_inode: 20,
            ..ListFilter::default()
        };
        assert!(BlockStore::filter_match(&filter, Oid::new(10, 0), 4096));
        assert!(BlockStore::filter_match(&filter, Oid::new(20, 5), 4096));
        assert!(!BlockStore::filter_match(&filter, Oid::new(9, 0), 4096));
        assert!(!BlockStore::filter_match(&filter, Oid::new(21, 0), 4096));
    }

    #[test]
    fn test_filter_pg_selection() {
        let filter = ListFilter {
            pg_count: 4,
            pg_number: 2,
            pg_stripe_size: 4096,
            ..ListFilter::default()
        };
        // stripe 8192 -> pg (8192/4096) % 4 = 2
        assert!(BlockStore::filter_match(&filter, Oid::new(1, 8192), 4096));
        assert!(!BlockStore::filter_match(&filter, Oid::new(1, 4096), 4096));
        assert!(!BlockStore::filter_match(&filter, Oid::new(1, 12288), 4096));
    }
}
