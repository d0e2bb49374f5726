//! Assigned work and nonce range types.

use std::cmp::Ordering;
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// Length of the block header prefix kept from the coordinator's `data`.
pub const HEADER_LEN: usize = 80;

/// Length of a submitted result frame. Results are block headers padded
/// with zeros; coordinators ignore the trailing bytes.
pub const RESULT_FRAME_LEN: usize = 128;

/// Default nonce space exponent when the coordinator omits `mask`.
pub const DEFAULT_MASK: u32 = 32;

/// One unit of work assigned by the coordinator.
///
/// Immutable once parsed. Shared between the work queue and every range
/// carved from it via `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignedWork {
    /// Block header prefix, truncated to 80 bytes
    pub data: [u8; HEADER_LEN],

    /// Difficulty target as sent by the coordinator
    pub target: Vec<u8>,

    /// Nonce space exponent: this work covers `2^mask` nonces
    pub mask: u32,

    /// Block height embedded in the work result, if the coordinator sent one
    pub block: Option<u64>,
}

impl AssignedWork {
    /// Create work with the default mask and no block height.
    pub fn new(data: [u8; HEADER_LEN], target: Vec<u8>) -> Self {
        Self {
            data,
            target,
            mask: DEFAULT_MASK,
            block: None,
        }
    }

    /// Number of nonces this work covers.
    pub fn nonce_space(&self) -> u64 {
        1u64 << self.mask.min(32)
    }

    /// Double SHA-256 of the header with `nonce` in its last word.
    ///
    /// `data` carries each 32-bit header word byte-swapped; they are
    /// restored before hashing. `nonce` is the last word as it reads
    /// little-endian from `data`.
    pub fn hash(&self, nonce: u32) -> [u8; 32] {
        let mut header = [0u8; HEADER_LEN];
        for (dst, src) in header[..NONCE_OFFSET]
            .chunks_exact_mut(4)
            .zip(self.data[..NONCE_OFFSET].chunks_exact(4))
        {
            dst.copy_from_slice(src);
            dst.reverse();
        }
        header[NONCE_OFFSET..].copy_from_slice(&nonce.to_be_bytes());

        let digest = Sha256::digest(Sha256::digest(header));
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&digest);
        hash
    }

    /// Whether `hash` is at or below this work's target.
    pub fn meets_target(&self, hash: &[u8; 32]) -> bool {
        meets_target(hash, &self.target)
    }

    /// Header with `nonce` filled in, in the layout the coordinator expects
    /// back.
    pub fn result_header(&self, nonce: u32) -> [u8; HEADER_LEN] {
        let mut header = self.data;
        header[NONCE_OFFSET..].copy_from_slice(&nonce.to_le_bytes());
        header
    }
}

/// Offset of the nonce word in the header.
const NONCE_OFFSET: usize = 76;

/// Compare a hash against a target, both little-endian 256-bit numbers.
pub fn meets_target(hash: &[u8; 32], target: &[u8]) -> bool {
    for (t, h) in target.iter().rev().zip(hash.iter().rev()) {
        match t.cmp(h) {
            Ordering::Greater => return true,
            Ordering::Less => return false,
            Ordering::Equal => {}
        }
    }
    true
}

/// A contiguous slice of one work unit's nonce space.
///
/// Created by the work queue, handed to exactly one consumer, and discarded
/// once the consumer reports its execution time.
#[derive(Debug, Clone)]
pub struct WorkRange {
    /// Work this range belongs to
    pub work: Arc<AssignedWork>,

    /// First nonce in the range
    pub base: u32,

    /// Number of nonces in the range
    pub size: u64,
}

impl WorkRange {
    /// Hashes performed when this range is fully searched.
    pub fn hash_count(&self) -> u64 {
        self.size
    }
}

/// Frame a result for submission: zero-pad to 128 bytes and hex-encode.
///
/// Returns `None` if the result does not fit in a frame.
pub fn encode_result(result: &[u8]) -> Option<String> {
    if result.len() > RESULT_FRAME_LEN {
        return None;
    }
    let mut frame = [0u8; RESULT_FRAME_LEN];
    frame[..result.len()].copy_from_slice(result);
    Some(hex::encode(frame))
}

/// The genesis block as a coordinator would hand it out (every header word
/// byte-swapped, difficulty 1 target) and its winning nonce.
#[cfg(test)]
pub(crate) fn genesis_work() -> (AssignedWork, u32) {
    const GENESIS_HEADER: &str = "01000000\
        0000000000000000000000000000000000000000000000000000000000000000\
        3ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a\
        29ab5f49ffff001d1dac2b7c";

    let header = hex::decode(GENESIS_HEADER).unwrap();
    let mut data = [0u8; HEADER_LEN];
    for (dst, src) in data.chunks_exact_mut(4).zip(header.chunks_exact(4)) {
        dst.copy_from_slice(src);
        dst.reverse();
    }
    let mut target = vec![0u8; 32];
    target[26] = 0xff;
    target[27] = 0xff;
    let nonce = u32::from_le_bytes([data[76], data[77], data[78], data[79]]);
    (AssignedWork::new(data, target), nonce)
}
