//! Order-independent checksum over ingested pairs, reported per restore so
//! operators can compare runs against the capture side.

use std::fmt;

use crc32fast::Hasher;

use crate::codec::KvPair;

/// Running checksum: pair count, byte total, and an xor-folded crc32 so the
/// result is independent of ingestion order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KvChecksum {
    kvs: u64,
    bytes: u64,
    checksum: u64,
}

impl KvChecksum {
    pub fn update_one(&mut self, pair: &KvPair) {
        let mut hasher = Hasher::new();
        hasher.update(&pair.key);
        hasher.update(&pair.value);
        self.checksum ^= u64::from(hasher.finalize());
        self.bytes += pair.size();
        self.kvs += 1;
    }

    pub fn update(&mut self, pairs: &[KvPair]) {
        for pair in pairs {
            self.update_one(pair);
        }
    }

    pub fn merge(&mut self, other: &KvChecksum) {
        self.kvs += other.kvs;
        self.bytes += other.bytes;
        self.checksum ^= other.checksum;
    }

    pub fn kvs(&self) -> u64 {
        self.kvs
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn checksum(&self) -> u64 {
        self.checksum
    }
}

impl fmt::Display for KvChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "kvs={} bytes={} checksum={:016x}",
            self.kvs, self.bytes, self.checksum
        )
    }
}
