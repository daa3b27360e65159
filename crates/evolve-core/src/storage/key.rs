//! Key encoding for the record and metadata trees.

/// Separator between key segments.
///
/// Collection names and migration ids are validated to never contain it, so
/// prefix scans over a segment cannot bleed into a neighbouring one.
pub const SEPARATOR: u8 = 0x00;

/// Encode the key of an item inside a collection.
///
/// Key format: `[collection][0x00][item key]`
pub fn record_key(collection: &str, key: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(collection.len() + key.len() + 1);
    buf.extend_from_slice(collection.as_bytes());
    buf.push(SEPARATOR);
    buf.extend_from_slice(key.as_bytes());
    buf
}

/// Prefix covering every item of a collection.
pub fn collection_prefix(collection: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(collection.len() + 1);
    buf.extend_from_slice(collection.as_bytes());
    buf.push(SEPARATOR);
    buf
}

/// Decode a record key into `(collection, item key)`.
pub fn decode_record_key(bytes: &[u8]) -> Option<(String, String)> {
    let pos = bytes.iter().position(|b| *b == SEPARATOR)?;
    let collection = std::str::from_utf8(&bytes[..pos]).ok()?;
    let key = std::str::from_utf8(&bytes[pos + 1..]).ok()?;
    Some((collection.to_string(), key.to_string()))
}

/// Build a metadata key from a namespace and its segments.
///
/// Key format: `[namespace][segment][0x00][segment]...`
pub fn meta_key(namespace: &[u8], segments: &[&[u8]]) -> Vec<u8> {
    let len = namespace.len() + segments.iter().map(|s| s.len() + 1).sum::<usize>();
    let mut buf = Vec::with_capacity(len);
    buf.extend_from_slice(namespace);
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 {
            buf.push(SEPARATOR);
        }
        buf.extend_from_slice(segment);
    }
    buf
}

/// Prefix of every metadata key in `namespace` that starts with `segment`.
pub fn meta_prefix(namespace: &[u8], segment: &[u8]) -> Vec<u8> {
    let mut buf = meta_key(namespace, &[segment]);
    buf.push(SEPARATOR);
    buf
}

/// Returns `true` if the value can be used as a key segment.
pub fn is_valid_segment(value: &str) -> bool {
    !value.is_empty() && !value.as_bytes().contains(&SEPARATOR)
}

/// Get current timestamp in microseconds since Unix epoch.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_key_decode() {
        let key = record_key("documents", "doc-42");
        let (collection, item) = decode_record_key(&key).unwrap();
        assert_eq!(collection, "documents");
        assert_eq!(item, "doc-42");
    }

    #[test]
    fn test_collection_prefix_isolation() {
        // "doc" must not match items of "documents"
        let prefix = collection_prefix("doc");
        let other = record_key("documents", "a");
        assert!(!other.starts_with(&prefix));
        assert!(record_key("doc", "a").starts_with(&prefix));
    }

    #[test]
    fn test_meta_key_ordering() {
        let a = meta_key(b"history:", &[b"m1", &1u32.to_be_bytes()]);
        let b = meta_key(b"history:", &[b"m1", &2u32.to_be_bytes()]);
        let c = meta_key(b"history:", &[b"m1", &256u32.to_be_bytes()]);
        assert!(a < b);
        assert!(b < c);
        assert!(a.starts_with(&meta_prefix(b"history:", b"m1")));
    }

    #[test]
    fn test_segment_validation() {
        assert!(is_valid_segment("0001_add_embeddings"));
        assert!(!is_valid_segment(""));
        assert!(!is_valid_segment("bad\0id"));
    }
}
