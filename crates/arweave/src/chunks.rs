//! Merkle chunking of transaction data. Chunks are at most 256 KiB; the
//! tree's SHA-256 root becomes the transaction's `data_root`, and each chunk
//! carries an inclusion proof the gateway validates on upload.

use sha2::{Digest, Sha256};

pub const MAX_CHUNK_SIZE: usize = 256 * 1024;
pub const MIN_CHUNK_SIZE: usize = 32 * 1024;
const NOTE_SIZE: usize = 32;

type Hash = [u8; 32];

#[derive(Debug, Clone)]
pub struct Chunk {
    pub data_hash: Hash,
    pub min_byte_range: u64,
    pub max_byte_range: u64,
    /// Serialized merkle inclusion proof for this chunk.
    pub proof: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ChunkedData {
    pub data_root: Hash,
    pub data_size: u64,
    pub chunks: Vec<Chunk>,
}

enum Node {
    Leaf {
        id: Hash,
        data_hash: Hash,
        min: u64,
        max: u64,
    },
    Branch {
        id: Hash,
        split: u64,
        max: u64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    fn id(&self) -> Hash {
        match self {
            Node::Leaf { id, .. } | Node::Branch { id, .. } => *id,
        }
    }

    fn max(&self) -> u64 {
        match self {
            Node::Leaf { max, .. } | Node::Branch { max, .. } => *max,
        }
    }
}

fn sha256(parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn note(value: u64) -> [u8; NOTE_SIZE] {
    let mut out = [0u8; NOTE_SIZE];
    out[NOTE_SIZE - 8..].copy_from_slice(&value.to_be_bytes());
    out
}

/// Split a data length into chunk byte-ranges. The final chunk is never
/// smaller than `MIN_CHUNK_SIZE` (when the data itself is larger): a
/// too-small remainder splits the preceding chunk roughly in half instead.
/// Ranges depend only on the total length, so callers may hash chunks
/// straight off a byte stream without buffering the whole payload.
pub fn chunk_ranges(len: u64) -> Vec<(u64, u64)> {
    let max = MAX_CHUNK_SIZE as u64;
    let min = MIN_CHUNK_SIZE as u64;
    let mut ranges = Vec::new();
    let mut start = 0u64;
    let mut rest = len;
    while rest > max {
        let mut size = max;
        let remainder = rest - max;
        if remainder > 0 && remainder < min {
            size = (rest + 1) / 2;
        }
        ranges.push((start, start + size));
        start += size;
        rest -= size;
    }
    ranges.push((start, start + rest));
    ranges
}

fn build_tree(mut nodes: Vec<Node>) -> Node {
    while nodes.len() > 1 {
        let mut next = Vec::with_capacity((nodes.len() + 1) / 2);
        let mut iter = nodes.into_iter();
        while let Some(left) = iter.next() {
            match iter.next() {
                Some(right) => {
                    let id = sha256(&[
                        &sha256(&[&left.id()]),
                        &sha256(&[&right.id()]),
                        &sha256(&[&note(left.max())]),
                    ]);
                    next.push(Node::Branch {
                        id,
                        split: left.max(),
                        max: right.max(),
                        left: Box::new(left),
                        right: Box::new(right),
                    });
                }
                None => next.push(left),
            }
        }
        nodes = next;
    }
    nodes.into_iter().next().expect("at least one chunk exists")
}

fn collect_proofs(node: &Node, prefix: &[u8], out: &mut Vec<Chunk>) {
    match node {
        Node::Leaf {
            data_hash,
            min,
            max,
            ..
        } => {
            let mut proof = prefix.to_vec();
            proof.extend_from_slice(data_hash);
            proof.extend_from_slice(&note(*max));
            out.push(Chunk {
                data_hash: *data_hash,
                min_byte_range: *min,
                max_byte_range: *max,
                proof,
            });
        }
        Node::Branch {
            left, right, split, ..
        } => {
            let mut next = prefix.to_vec();
            next.extend_from_slice(&left.id());
            next.extend_from_slice(&right.id());
            next.extend_from_slice(&note(*split));
            collect_proofs(left, &next, out);
            collect_proofs(right, &next, out);
        }
    }
}

/// Build the tree and proofs from pre-hashed chunks: `(sha256(chunk), min,
/// max)` per chunk range, in order. This is the streaming entry point; the
/// tree itself only ever holds hashes.
pub fn tree_from_leaf_hashes(leaf_hashes: Vec<([u8; 32], u64, u64)>, data_size: u64) -> ChunkedData {
    let leaves: Vec<Node> = leaf_hashes
        .into_iter()
        .map(|(data_hash, min, max)| {
            let id = sha256(&[&sha256(&[&data_hash]), &sha256(&[&note(max)])]);
            Node::Leaf {
                id,
                data_hash,
                min,
                max,
            }
        })
        .collect();

    let root = build_tree(leaves);
    let data_root = root.id();
    let mut chunks = Vec::new();
    collect_proofs(&root, &[], &mut chunks);

    ChunkedData {
        data_root,
        data_size,
        chunks,
    }
}

/// Chunk fully buffered data and compute its merkle root and per-chunk proofs.
pub fn chunk_data(data: &[u8]) -> ChunkedData {
    let leaf_hashes = chunk_ranges(data.len() as u64)
        .into_iter()
        .map(|(min, max)| (sha256(&[&data[min as usize..max as usize]]), min, max))
        .collect();
    tree_from_leaf_hashes(leaf_hashes, data.len() as u64)
}

/// Validate one chunk's proof against a root, the way the gateway does on
/// `POST /chunk`. Used by tests to pin the proof format.
pub fn validate_proof(
    root: Hash,
    dest: u64,
    left_bound: u64,
    right_bound: u64,
    proof: &[u8],
) -> bool {
    const BRANCH_LEN: usize = 32 + 32 + NOTE_SIZE;
    if proof.len() < 32 + NOTE_SIZE {
        return false;
    }
    if proof.len() == 32 + NOTE_SIZE {
        // Leaf record: data_hash ++ note(max).
        let data_hash: &[u8] = &proof[..32];
        let note_bytes = &proof[32..];
        let max = u64::from_be_bytes(note_bytes[NOTE_SIZE - 8..].try_into().unwrap());
        let id = sha256(&[&sha256(&[data_hash]), &sha256(&[note_bytes])]);
        return id == root && max == right_bound && dest >= left_bound && dest < right_bound;
    }
    if proof.len() < BRANCH_LEN {
        return false;
    }
    let left_id: &[u8] = &proof[..32];
    let right_id: &[u8] = &proof[32..64];
    let note_bytes = &proof[64..BRANCH_LEN];
    let split = u64::from_be_bytes(note_bytes[NOTE_SIZE - 8..].try_into().unwrap());

    let id = sha256(&[&sha256(&[left_id]), &sha256(&[right_id]), &sha256(&[note_bytes])]);
    if id != root {
        return false;
    }
    if dest < split {
        validate_proof(
            left_id.try_into().unwrap(),
            dest,
            left_bound,
            split.min(right_bound),
            &proof[BRANCH_LEN..],
        )
    } else {
        validate_proof(
            right_id.try_into().unwrap(),
            dest,
            split.max(left_bound),
            right_bound,
            &proof[BRANCH_LEN..],
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn small_data_is_one_chunk() {
        let chunked = chunk_data(b"tiny");
        assert_eq!(chunked.chunks.len(), 1);
        assert_eq!(chunked.data_size, 4);
        let chunk = &chunked.chunks[0];
        assert_eq!((chunk.min_byte_range, chunk.max_byte_range), (0, 4));
        assert!(validate_proof(chunked.data_root, 0, 0, 4, &chunk.proof));
    }

    #[test]
    fn multi_chunk_proofs_validate() {
        let data = vec![7u8; MAX_CHUNK_SIZE * 2 + MIN_CHUNK_SIZE + 17];
        let chunked = chunk_data(&data);
        assert!(chunked.chunks.len() >= 3);

        let mut covered = 0u64;
        for chunk in &chunked.chunks {
            assert_eq!(chunk.min_byte_range, covered);
            covered = chunk.max_byte_range;
            assert!(validate_proof(
                chunked.data_root,
                chunk.min_byte_range,
                chunk.min_byte_range,
                chunk.max_byte_range,
                &chunk.proof,
            ));
        }
        assert_eq!(covered, data.len() as u64);
    }

    #[test]
    fn no_chunk_is_undersized() {
        // A length that leaves a sub-minimum remainder after full chunks.
        let data = vec![1u8; MAX_CHUNK_SIZE + MIN_CHUNK_SIZE / 2];
        let chunked = chunk_data(&data);
        assert_eq!(chunked.chunks.len(), 2);
        for chunk in &chunked.chunks {
            let size = chunk.max_byte_range - chunk.min_byte_range;
            assert!(size >= MIN_CHUNK_SIZE as u64 / 2);
            assert!(size <= MAX_CHUNK_SIZE as u64);
        }
    }

    #[test]
    fn tampered_proof_fails() {
        let data = vec![9u8; MAX_CHUNK_SIZE + MAX_CHUNK_SIZE];
        let chunked = chunk_data(&data);
        let chunk = &chunked.chunks[0];
        let mut bad = chunk.proof.clone();
        bad[0] ^= 1;
        assert!(!validate_proof(
            chunked.data_root,
            chunk.min_byte_range,
            chunk.min_byte_range,
            chunk.max_byte_range,
            &bad,
        ));
    }
}
