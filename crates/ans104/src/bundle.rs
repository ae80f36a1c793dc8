//! The bundle envelope: a header of `(size, id)` pairs followed by the
//! concatenated items in header order.

use models::{BundleId, DataItemId};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum BundleError {
    #[error("bundle header is truncated")]
    Truncated,
    #[error("bundle header declares an implausible item count ({0})")]
    BadCount(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleEntry {
    pub size: u64,
    pub id: DataItemId,
}

/// Serialized length of a header for `count` items.
pub fn header_len(count: u64) -> u64 {
    8 + count * 40
}

/// Encode the header: a u64 little-endian count, then a `(u64 size, 32-byte
/// id)` pair per item, in payload order.
pub fn encode_header(entries: &[BundleEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(header_len(entries.len() as u64) as usize);
    out.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    for entry in entries {
        out.extend_from_slice(&entry.size.to_le_bytes());
        out.extend_from_slice(entry.id.as_bytes());
    }
    out
}

pub fn decode_header(bytes: &[u8]) -> Result<Vec<BundleEntry>, BundleError> {
    let count_bytes: [u8; 8] = bytes
        .get(0..8)
        .ok_or(BundleError::Truncated)?
        .try_into()
        .unwrap();
    let count = u64::from_le_bytes(count_bytes);
    if count > (bytes.len() as u64) / 40 {
        return Err(BundleError::BadCount(count));
    }
    if header_len(count) != bytes.len() as u64 {
        return Err(BundleError::Truncated);
    }

    let mut entries = Vec::with_capacity(count as usize);
    let mut pos = 8usize;
    for _ in 0..count {
        let size = u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap());
        let id = DataItemId(bytes[pos + 8..pos + 40].try_into().unwrap());
        entries.push(BundleEntry { size, id });
        pos += 40;
    }
    Ok(entries)
}

/// Derive the deterministic bundle id for an ordered item set: SHA-256 over
/// the concatenated item ids. Stable before posting, so the payload can be
/// staged under its final key.
pub fn derive_bundle_id(items: &[DataItemId]) -> BundleId {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for id in items {
        hasher.update(id.as_bytes());
    }
    BundleId(hasher.finalize().into())
}

#[cfg(test)]
mod test {
    use super::*;

    fn entries() -> Vec<BundleEntry> {
        vec![
            BundleEntry {
                size: 1024,
                id: DataItemId([1u8; 32]),
            },
            BundleEntry {
                size: 7,
                id: DataItemId([2u8; 32]),
            },
        ]
    }

    #[test]
    fn header_round_trips() {
        let header = encode_header(&entries());
        assert_eq!(header.len() as u64, header_len(2));
        assert_eq!(decode_header(&header).unwrap(), entries());
    }

    #[test]
    fn empty_header_round_trips() {
        let header = encode_header(&[]);
        assert_eq!(header, 0u64.to_le_bytes().to_vec());
        assert_eq!(decode_header(&header).unwrap(), vec![]);
    }

    #[test]
    fn truncated_header_is_rejected() {
        let header = encode_header(&entries());
        assert_eq!(
            decode_header(&header[..header.len() - 1]),
            Err(BundleError::Truncated)
        );
        assert!(decode_header(&[1, 2, 3]).is_err());
    }

    #[test]
    fn implausible_count_is_rejected() {
        let mut header = encode_header(&entries());
        header[0..8].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(
            decode_header(&header),
            Err(BundleError::BadCount(_))
        ));
    }

    #[test]
    fn bundle_id_is_order_sensitive_and_stable() {
        let a = DataItemId([1u8; 32]);
        let b = DataItemId([2u8; 32]);
        assert_eq!(derive_bundle_id(&[a, b]), derive_bundle_id(&[a, b]));
        assert_ne!(derive_bundle_id(&[a, b]), derive_bundle_id(&[b, a]));
    }
}
