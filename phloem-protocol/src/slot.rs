//! Key to hash slot mapping
//!
//! The key space is divided into 16,384 slots. A key maps to
//! `CRC16(key) & 0x3FFF`, except that a non-empty `{tag}` restricts hashing
//! to the bytes between the first `{` and the first `}` after it. Keys that
//! share a tag always land in the same slot, which is how callers co-locate
//! keys for multi-key commands.

use crate::crc16::crc16;

/// Number of hash slots in a cluster
pub const CLUSTER_SLOTS: u16 = 16384;

/// Highest valid slot number
pub const MAX_SLOT: u16 = CLUSTER_SLOTS - 1;

/// Hash slot of a key, honoring hash tags
///
/// ```
/// use phloem_protocol::slot::key_hash_slot;
///
/// assert_eq!(key_hash_slot(b"foo"), 12182);
/// assert_eq!(key_hash_slot(b"{user:1000}.profile"), key_hash_slot(b"user:1000"));
/// ```
pub fn key_hash_slot(key: &[u8]) -> u16 {
    let hashed = extract_hash_tag(key).unwrap_or(key);
    crc16(hashed) & MAX_SLOT
}

/// Convenience wrapper for string keys
pub fn slot_for_key(key: &str) -> u16 {
    key_hash_slot(key.as_bytes())
}

/// The bytes between the first `{` and the next `}`, if that span is non-empty
///
/// `{}` and unterminated braces yield `None`, meaning the whole key is hashed.
pub fn extract_hash_tag(key: &[u8]) -> Option<&[u8]> {
    let open = memchr::memchr(b'{', key)?;
    let rest = &key[open + 1..];
    let close = memchr::memchr(b'}', rest)?;
    if close == 0 {
        return None;
    }
    Some(&rest[..close])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_slots() {
        assert_eq!(key_hash_slot(b"foo"), 12182);
        assert_eq!(key_hash_slot(b"bar"), 5061);
        assert_eq!(key_hash_slot(b"123456789"), 12739);
    }

    #[test]
    fn test_hash_tag_colocates_keys() {
        let bar = key_hash_slot(b"bar");
        assert_eq!(key_hash_slot(b"foo{bar}"), bar);
        assert_eq!(key_hash_slot(b"baz{bar}"), bar);
        assert_eq!(key_hash_slot(b"{bar}"), bar);
    }

    #[test]
    fn test_only_first_tag_counts() {
        assert_eq!(key_hash_slot(b"{a}{b}"), key_hash_slot(b"a"));
        assert_eq!(key_hash_slot(b"x{a}y}"), key_hash_slot(b"a"));
    }

    #[test]
    fn test_empty_tag_hashes_whole_key() {
        assert_eq!(extract_hash_tag(b"foo{}bar"), None);
        assert_eq!(key_hash_slot(b"foo{}bar"), crc16(b"foo{}bar") & MAX_SLOT);
    }

    #[test]
    fn test_unterminated_tag_hashes_whole_key() {
        assert_eq!(extract_hash_tag(b"foo{bar"), None);
        assert_eq!(extract_hash_tag(b"foo}bar{"), None);
    }

    #[test]
    fn test_first_open_brace_wins() {
        // "{{a}" -> tag is "{a"
        assert_eq!(extract_hash_tag(b"{{a}"), Some(&b"{a"[..]));
    }

    #[test]
    fn test_slot_range() {
        for i in 0..2000u32 {
            let key = format!("key:{i}");
            assert!(slot_for_key(&key) < CLUSTER_SLOTS);
        }
    }

    #[test]
    fn test_empty_key() {
        assert_eq!(key_hash_slot(b""), 0);
    }
}
