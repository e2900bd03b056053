//! Shared types for the transaction coordination core.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by both server roles and by the collaborator contract layer.

use serde::{Deserialize, Serialize};

/// A database version. Versions are minted by the master and are
/// monotonically non-decreasing across the lifetime of an epoch.
pub type Version = i64;

/// Sentinel for "no version".
pub const INVALID_VERSION: Version = -1;

/// Locality carried by tags that route to the transaction-state log stream.
pub const TAG_LOCALITY_TXS: i8 = -7;
/// Locality carried by the storage-cache tag.
pub const TAG_LOCALITY_CACHE: i8 = -8;
/// Locality used for popping the remote log stream.
pub const TAG_LOCALITY_REMOTE_LOG: i8 = -3;
/// Locality assigned to tags carried over from clusters that predate
/// locality-aware tagging. Rejoining servers with this locality keep it.
pub const TAG_LOCALITY_UPGRADED: i8 = -4;
/// Locality that no real tag carries.
pub const TAG_LOCALITY_INVALID: i8 = -99;

/// Identifies one storage-server log stream. Mutations are tagged with the
/// set of these that must receive them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    pub locality: i8,
    pub id: u16,
}

impl Tag {
    pub const fn new(locality: i8, id: u16) -> Self {
        Self { locality, id }
    }

    /// Tag for the transaction-state store's own log stream.
    pub const fn txs() -> Self {
        Self::new(TAG_LOCALITY_TXS, 0)
    }

    /// Tag added for mutations touching cached key ranges.
    pub const fn cache() -> Self {
        Self::new(TAG_LOCALITY_CACHE, 0)
    }

    pub const fn invalid() -> Self {
        Self::new(TAG_LOCALITY_INVALID, 0)
    }
}

/// Raw database key.
pub type Key = Vec<u8>;

/// A client-supplied label used for throttling and cost attribution.
pub type TransactionTag = String;

/// Lexicographic key range, begin-inclusive and end-exclusive.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub begin: Key,
    pub end: Key,
}

impl KeyRange {
    pub fn new(begin: impl Into<Key>, end: impl Into<Key>) -> Self {
        Self {
            begin: begin.into(),
            end: end.into(),
        }
    }

    /// The range covering exactly `key`.
    pub fn single_key(key: &[u8]) -> Self {
        Self {
            begin: key.to_vec(),
            end: key_after(key),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.begin.as_slice() <= key && key < self.end.as_slice()
    }

    pub fn contains_range(&self, other: &KeyRange) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }

    pub fn intersects(&self, other: &KeyRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    /// The overlap of two ranges; empty if they do not intersect.
    pub fn intersection(&self, other: &KeyRange) -> KeyRange {
        KeyRange {
            begin: self.begin.clone().max(other.begin.clone()),
            end: self.end.clone().min(other.end.clone()),
        }
    }
}

/// The smallest key strictly greater than `key`.
pub fn key_after(key: &[u8]) -> Key {
    let mut out = Vec::with_capacity(key.len() + 1);
    out.extend_from_slice(key);
    out.push(0x00);
    out
}

/// Priority class of a client transaction. Scan order at the GRV server is
/// highest first; rate limits apply to `Default` and `Batch` only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TransactionPriority {
    Batch,
    Default,
    Immediate,
}

/// Operations that read-modify-write a single key on the storage side.
///
/// Arithmetic variants treat operands as little-endian unsigned integers,
/// zero-extended to the longer of the two.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtomicOp {
    Add,
    BitAnd,
    BitOr,
    BitXor,
    Max,
    Min,
    ByteMin,
    ByteMax,
}

impl AtomicOp {
    /// Apply the operation to the existing value (empty if the key is unset).
    pub fn apply(self, existing: &[u8], param: &[u8]) -> Vec<u8> {
        match self {
            AtomicOp::Add => arith(existing, param, u64::wrapping_add),
            AtomicOp::BitAnd => bitwise(existing, param, |a, b| a & b),
            AtomicOp::BitOr => bitwise(existing, param, |a, b| a | b),
            AtomicOp::BitXor => bitwise(existing, param, |a, b| a ^ b),
            AtomicOp::Max => arith(existing, param, u64::max),
            AtomicOp::Min => {
                if existing.is_empty() {
                    // An unset key takes the parameter, matching set-on-missing
                    // semantics for min.
                    param.to_vec()
                } else {
                    arith(existing, param, u64::min)
                }
            }
            AtomicOp::ByteMin => {
                if existing.is_empty() || param < existing {
                    param.to_vec()
                } else {
                    existing.to_vec()
                }
            }
            AtomicOp::ByteMax => {
                if param > existing {
                    param.to_vec()
                } else {
                    existing.to_vec()
                }
            }
        }
    }
}

fn le_to_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(buf)
}

fn arith(existing: &[u8], param: &[u8], op: fn(u64, u64) -> u64) -> Vec<u8> {
    let width = existing.len().max(param.len()).min(8).max(1);
    let result = op(le_to_u64(existing), le_to_u64(param));
    result.to_le_bytes()[..width].to_vec()
}

fn bitwise(existing: &[u8], param: &[u8], op: fn(u8, u8) -> u8) -> Vec<u8> {
    let width = existing.len().max(param.len());
    (0..width)
        .map(|i| {
            op(
                existing.get(i).copied().unwrap_or(0),
                param.get(i).copied().unwrap_or(0),
            )
        })
        .collect()
}

/// One mutation inside a client transaction.
///
/// Versionstamped variants carry a 10-byte placeholder that is rewritten at
/// commit time; see [`transform_versionstamp`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    Set {
        key: Key,
        value: Vec<u8>,
    },
    ClearRange {
        begin: Key,
        end: Key,
    },
    Atomic {
        op: AtomicOp,
        key: Key,
        param: Vec<u8>,
    },
    SetVersionstampedKey {
        key: Key,
        value: Vec<u8>,
    },
    SetVersionstampedValue {
        key: Key,
        value: Vec<u8>,
    },
}

impl Mutation {
    /// True for mutations that target exactly one key.
    pub fn is_single_key(&self) -> bool {
        !matches!(self, Mutation::ClearRange { .. })
    }

    /// The key a single-key mutation targets, or the begin key of a clear.
    pub fn key(&self) -> &[u8] {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Atomic { key, .. }
            | Mutation::SetVersionstampedKey { key, .. }
            | Mutation::SetVersionstampedValue { key, .. } => key,
            Mutation::ClearRange { begin, .. } => begin,
        }
    }

    /// Approximate wire size, used for batching and yield accounting.
    pub fn expected_size(&self) -> usize {
        match self {
            Mutation::Set { key, value }
            | Mutation::SetVersionstampedKey { key, value }
            | Mutation::SetVersionstampedValue { key, value } => key.len() + value.len(),
            Mutation::ClearRange { begin, end } => begin.len() + end.len(),
            Mutation::Atomic { key, param, .. } => key.len() + param.len(),
        }
    }
}

/// Size of the placeholder rewritten at commit time.
pub const VERSIONSTAMP_SIZE: usize = 10;

/// Rewrite a versionstamp placeholder in place.
///
/// The final four bytes of `data` are a little-endian offset naming where the
/// 10-byte slot begins; the offset field is removed and the slot is
/// overwritten with `bigEndian64(version) || bigEndian16(batch_index)`.
pub fn transform_versionstamp(data: &mut Vec<u8>, version: Version, batch_index: u16) {
    debug_assert!(data.len() >= 4, "versionstamped operand too short");
    let tail = data.len() - 4;
    let offset = u32::from_le_bytes([data[tail], data[tail + 1], data[tail + 2], data[tail + 3]])
        as usize;
    data.truncate(tail);
    debug_assert!(offset + VERSIONSTAMP_SIZE <= data.len());
    data[offset..offset + 8].copy_from_slice(&(version as u64).to_be_bytes());
    data[offset + 8..offset + 10].copy_from_slice(&batch_index.to_be_bytes());
}

/// A client transaction as submitted to the commit server.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CommitTransaction {
    pub read_snapshot: Version,
    pub mutations: Vec<Mutation>,
    pub read_conflict_ranges: Vec<KeyRange>,
    pub write_conflict_ranges: Vec<KeyRange>,
    pub report_conflicting_keys: bool,
}

impl CommitTransaction {
    pub fn expected_size(&self) -> usize {
        let mutation_bytes: usize = self.mutations.iter().map(Mutation::expected_size).sum();
        let range_bytes: usize = self
            .read_conflict_ranges
            .iter()
            .chain(self.write_conflict_ranges.iter())
            .map(|r| r.begin.len() + r.end.len())
            .sum();
        mutation_bytes + range_bytes
    }
}

/// Per-transaction verdict from a resolver. The order matters: the combined
/// verdict across resolvers is the minimum, so any conflict wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommitStatus {
    Conflict = 0,
    TooOld = 1,
    Committed = 2,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_after_extends_with_zero_byte() {
        assert_eq!(key_after(b"abc"), b"abc\x00".to_vec());
        assert!(KeyRange::single_key(b"abc").contains_key(b"abc"));
        assert!(!KeyRange::single_key(b"abc").contains_key(b"abd"));
    }

    #[test]
    fn priorities_order_batch_lowest() {
        assert!(TransactionPriority::Batch < TransactionPriority::Default);
        assert!(TransactionPriority::Default < TransactionPriority::Immediate);
    }

    #[test]
    fn commit_status_min_is_most_restrictive() {
        assert_eq!(
            CommitStatus::Committed.min(CommitStatus::Conflict),
            CommitStatus::Conflict
        );
        assert_eq!(
            CommitStatus::Committed.min(CommitStatus::TooOld),
            CommitStatus::TooOld
        );
    }

    #[test]
    fn atomic_add_is_little_endian() {
        // 'a' + 1 == 'b' on a one-byte operand.
        assert_eq!(AtomicOp::Add.apply(b"a", &[0x01]), b"b".to_vec());
        // Carries propagate through the low-order byte.
        assert_eq!(AtomicOp::Add.apply(&[0xff, 0x00], &[0x01]), vec![0x00, 0x01]);
    }

    #[test]
    fn atomic_byte_ops_compare_lexicographically() {
        assert_eq!(AtomicOp::ByteMax.apply(b"abc", b"abd"), b"abd".to_vec());
        assert_eq!(AtomicOp::ByteMin.apply(b"abc", b"abd"), b"abc".to_vec());
        assert_eq!(AtomicOp::ByteMin.apply(b"", b"x"), b"x".to_vec());
    }

    #[test]
    fn versionstamp_rewrite_places_big_endian_stamp() {
        // Key: 2 literal bytes, a 10-byte slot, then the 4-byte offset field
        // naming offset 2.
        let mut key = Vec::new();
        key.extend_from_slice(b"k/");
        key.extend_from_slice(&[0u8; VERSIONSTAMP_SIZE]);
        key.extend_from_slice(&2u32.to_le_bytes());

        transform_versionstamp(&mut key, 0x0102030405060708, 9);

        assert_eq!(key.len(), 2 + VERSIONSTAMP_SIZE);
        assert_eq!(&key[..2], b"k/");
        assert_eq!(&key[2..10], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&key[10..12], &[0, 9]);
    }
}
