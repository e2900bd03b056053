//! System-keyspace layout and codecs.
//!
//! Everything under `\xff` is system space. The subrange `[\xff\x02,
//! \xff\x03)` holds non-metadata system data (backup progress and the like);
//! mutations there are replicated but do not reshape routing state.

use anyhow::{bail, Context};

use crate::types::{Key, KeyRange, Mutation, Tag, Version};

pub const SYSTEM_KEY_PREFIX: &[u8] = b"\xff";
pub const NON_METADATA_SYSTEM_BEGIN: &[u8] = b"\xff\x02";
pub const NON_METADATA_SYSTEM_END: &[u8] = b"\xff\x03";

pub const DATABASE_LOCKED_KEY: &[u8] = b"\xff/dbLocked";
pub const METADATA_VERSION_KEY: &[u8] = b"\xff/metadataVersion";
pub const MUST_CONTAIN_SYSTEM_MUTATIONS_KEY: &[u8] = b"\xff/mustContainSystemMutations";
pub const COORDINATORS_KEY: &[u8] = b"\xff/coordinators";

pub const KEY_SERVERS_PREFIX: &[u8] = b"\xff/keyServers/";
pub const SERVER_LIST_PREFIX: &[u8] = b"\xff/serverList/";
pub const SERVER_TAG_PREFIX: &[u8] = b"\xff/serverTag/";
pub const SERVER_TAG_HISTORY_PREFIX: &[u8] = b"\xff/serverTagHistory/";
pub const TAG_LOCALITY_LIST_PREFIX: &[u8] = b"\xff/tagLocalityList/";
pub const STORAGE_CACHE_PREFIX: &[u8] = b"\xff/storageCache/";
pub const LOG_RANGES_PREFIX: &[u8] = b"\xff/logRanges/";

/// The keyspace clients may use, `["", \xff\xff)` including system space.
pub fn all_keys() -> KeyRange {
    KeyRange::new(Vec::new(), b"\xff\xff".to_vec())
}

/// The keyspace normal (non-system) keys occupy.
pub fn normal_keys() -> KeyRange {
    KeyRange::new(Vec::new(), SYSTEM_KEY_PREFIX.to_vec())
}

/// Single-key range around the database lock marker.
pub fn database_locked_range() -> KeyRange {
    KeyRange::single_key(DATABASE_LOCKED_KEY)
}

fn prefix_range(prefix: &[u8]) -> KeyRange {
    let mut end = prefix.to_vec();
    // Prefixes used here never end in 0xff, so bumping the last byte is safe.
    *end.last_mut().expect("non-empty prefix") += 1;
    KeyRange::new(prefix.to_vec(), end)
}

pub fn server_tag_keys() -> KeyRange {
    prefix_range(SERVER_TAG_PREFIX)
}

pub fn server_tag_history_keys() -> KeyRange {
    prefix_range(SERVER_TAG_HISTORY_PREFIX)
}

pub fn tag_locality_list_keys() -> KeyRange {
    prefix_range(TAG_LOCALITY_LIST_PREFIX)
}

pub fn log_ranges_keys() -> KeyRange {
    prefix_range(LOG_RANGES_PREFIX)
}

fn suffixed(prefix: &[u8], suffix: &[u8]) -> Key {
    let mut key = Vec::with_capacity(prefix.len() + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(suffix);
    key
}

pub fn server_list_key_for(id: u64) -> Key {
    suffixed(SERVER_LIST_PREFIX, &id.to_be_bytes())
}

pub fn server_tag_key_for(id: u64) -> Key {
    suffixed(SERVER_TAG_PREFIX, &id.to_be_bytes())
}

/// History entries live under `serverTagHistory/<id>/<big-endian version>`.
pub fn server_tag_history_key_for(id: u64, version: Version) -> Key {
    let mut key = suffixed(SERVER_TAG_HISTORY_PREFIX, &id.to_be_bytes());
    key.push(b'/');
    key.extend_from_slice(&(version as u64).to_be_bytes());
    key
}

pub fn server_tag_history_range_for(id: u64) -> KeyRange {
    let mut begin = suffixed(SERVER_TAG_HISTORY_PREFIX, &id.to_be_bytes());
    begin.push(b'/');
    let mut end = begin.clone();
    *end.last_mut().expect("non-empty key") += 1;
    KeyRange::new(begin, end)
}

pub fn decode_server_tag_history_key(key: &[u8]) -> anyhow::Result<Version> {
    let suffix = key
        .strip_prefix(SERVER_TAG_HISTORY_PREFIX)
        .context("not a server tag history key")?;
    // <8-byte id> '/' <8-byte version>
    if suffix.len() != 17 {
        bail!("malformed server tag history key");
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&suffix[9..]);
    Ok(u64::from_be_bytes(buf) as Version)
}

pub fn tag_locality_list_key_for(dc_id: &[u8]) -> Key {
    suffixed(TAG_LOCALITY_LIST_PREFIX, dc_id)
}

pub fn key_servers_key(key: &[u8]) -> Key {
    suffixed(KEY_SERVERS_PREFIX, key)
}

pub fn encode_server_tag_value(tag: Tag) -> Vec<u8> {
    let mut out = Vec::with_capacity(3);
    out.push(tag.locality as u8);
    out.extend_from_slice(&tag.id.to_be_bytes());
    out
}

pub fn decode_server_tag_value(value: &[u8]) -> anyhow::Result<Tag> {
    if value.len() != 3 {
        bail!("malformed server tag value of {} bytes", value.len());
    }
    Ok(Tag::new(value[0] as i8, u16::from_be_bytes([value[1], value[2]])))
}

pub fn encode_tag_locality_value(locality: i8) -> Vec<u8> {
    vec![locality as u8]
}

pub fn decode_tag_locality_value(value: &[u8]) -> anyhow::Result<i8> {
    if value.len() != 1 {
        bail!("malformed tag locality value");
    }
    Ok(value[0] as i8)
}

/// Value of a `keyServers/` entry: the source and destination storage-server
/// id sets for the shard starting at the entry's key.
pub fn encode_key_servers_value(src: &[u64], dest: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 8 * (src.len() + dest.len()));
    out.extend_from_slice(&(src.len() as u32).to_be_bytes());
    for id in src {
        out.extend_from_slice(&id.to_be_bytes());
    }
    out.extend_from_slice(&(dest.len() as u32).to_be_bytes());
    for id in dest {
        out.extend_from_slice(&id.to_be_bytes());
    }
    out
}

pub fn decode_key_servers_value(value: &[u8]) -> anyhow::Result<(Vec<u64>, Vec<u64>)> {
    fn take_ids<'a>(data: &'a [u8]) -> anyhow::Result<(Vec<u64>, &'a [u8])> {
        if data.len() < 4 {
            bail!("truncated key servers value");
        }
        let count = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let data = &data[4..];
        if data.len() < count * 8 {
            bail!("truncated key servers id list");
        }
        let ids = data[..count * 8]
            .chunks_exact(8)
            .map(|chunk| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(chunk);
                u64::from_be_bytes(buf)
            })
            .collect();
        Ok((ids, &data[count * 8..]))
    }

    let (src, rest) = take_ids(value)?;
    let (dest, rest) = take_ids(rest)?;
    if !rest.is_empty() {
        bail!("trailing bytes in key servers value");
    }
    Ok((src, dest))
}

/// A backup destination registration: `logRanges/<begin>` maps to the range
/// end and the destination path prefix backup blocks are written under.
pub fn log_ranges_key_for(begin: &[u8]) -> Key {
    suffixed(LOG_RANGES_PREFIX, begin)
}

pub fn encode_log_range_value(end: &[u8], destination: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + end.len() + destination.len());
    out.extend_from_slice(&(end.len() as u32).to_be_bytes());
    out.extend_from_slice(end);
    out.extend_from_slice(destination);
    out
}

pub fn decode_log_range_value(value: &[u8]) -> anyhow::Result<(Key, Key)> {
    if value.len() < 4 {
        bail!("truncated log range value");
    }
    let end_len = u32::from_be_bytes([value[0], value[1], value[2], value[3]]) as usize;
    let rest = &value[4..];
    if rest.len() < end_len {
        bail!("truncated log range end key");
    }
    Ok((rest[..end_len].to_vec(), rest[end_len..].to_vec()))
}

/// Whether a mutation's effects must be applied to the transaction-state
/// store and reshaped into routing state.
///
/// Conservative: everything in system space outside the non-metadata
/// subrange counts.
pub fn is_metadata_mutation(m: &Mutation) -> bool {
    match m {
        Mutation::Set { key, .. } => {
            !key.is_empty()
                && key[0] == SYSTEM_KEY_PREFIX[0]
                && !key.starts_with(NON_METADATA_SYSTEM_BEGIN)
        }
        Mutation::ClearRange { begin, end } => {
            !end.is_empty()
                && end[0] == SYSTEM_KEY_PREFIX[0]
                && !(begin.as_slice() >= NON_METADATA_SYSTEM_BEGIN
                    && end.as_slice() <= NON_METADATA_SYSTEM_END)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_mutation_detection() {
        let set_meta = Mutation::Set {
            key: DATABASE_LOCKED_KEY.to_vec(),
            value: vec![1],
        };
        let set_normal = Mutation::Set {
            key: b"user/key".to_vec(),
            value: vec![1],
        };
        let set_non_meta_system = Mutation::Set {
            key: b"\xff\x02/blog/progress".to_vec(),
            value: vec![1],
        };
        assert!(is_metadata_mutation(&set_meta));
        assert!(!is_metadata_mutation(&set_normal));
        assert!(!is_metadata_mutation(&set_non_meta_system));

        let clear_meta = Mutation::ClearRange {
            begin: b"\xff/serverTag/".to_vec(),
            end: b"\xff/serverTag0".to_vec(),
        };
        let clear_non_meta = Mutation::ClearRange {
            begin: b"\xff\x02/a".to_vec(),
            end: b"\xff\x02/b".to_vec(),
        };
        assert!(is_metadata_mutation(&clear_meta));
        assert!(!is_metadata_mutation(&clear_non_meta));
    }

    #[test]
    fn server_tag_value_round_trips() {
        let tag = Tag::new(1, 42);
        assert_eq!(decode_server_tag_value(&encode_server_tag_value(tag)).unwrap(), tag);
    }

    #[test]
    fn key_servers_value_round_trips() {
        let encoded = encode_key_servers_value(&[1, 2, 3], &[9]);
        let (src, dest) = decode_key_servers_value(&encoded).unwrap();
        assert_eq!(src, vec![1, 2, 3]);
        assert_eq!(dest, vec![9]);
    }

    #[test]
    fn tag_history_key_round_trips() {
        let key = server_tag_history_key_for(7, 1234);
        assert!(server_tag_history_range_for(7).contains_key(&key));
        assert_eq!(decode_server_tag_history_key(&key).unwrap(), 1234);
    }

    #[test]
    fn log_range_value_round_trips() {
        let encoded = encode_log_range_value(b"zz", b"\xff\x02/blog/uid/");
        let (end, dest) = decode_log_range_value(&encoded).unwrap();
        assert_eq!(end, b"zz".to_vec());
        assert_eq!(dest, b"\xff\x02/blog/uid/".to_vec());
    }
}
