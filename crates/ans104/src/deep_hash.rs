//! Arweave deep hash: a canonical SHA-384 hash over nested lists of byte
//! blobs, used as the message for every signature in the protocol.

use sha2::{Digest, Sha384};

pub const DIGEST_LEN: usize = 48;

pub type DeepHash = [u8; DIGEST_LEN];

#[derive(Debug, Clone)]
pub enum Chunk<'a> {
    Blob(&'a [u8]),
    List(Vec<Chunk<'a>>),
}

fn sha384(parts: &[&[u8]]) -> DeepHash {
    let mut hasher = Sha384::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn blob_tag(len: u64) -> Vec<u8> {
    let mut tag = b"blob".to_vec();
    tag.extend_from_slice(len.to_string().as_bytes());
    tag
}

/// Digest of a blob given its length and the plain SHA-384 of its content.
/// This is the streaming entry point: the content hash may be accumulated
/// incrementally without ever buffering the blob.
pub fn blob_digest_from_hash(len: u64, content_hash: DeepHash) -> DeepHash {
    sha384(&[&sha384(&[&blob_tag(len)]), &content_hash])
}

fn blob_digest(blob: &[u8]) -> DeepHash {
    blob_digest_from_hash(blob.len() as u64, sha384(&[blob]))
}

/// Compute the deep hash of a chunk tree.
pub fn deep_hash(chunk: &Chunk<'_>) -> DeepHash {
    match chunk {
        Chunk::Blob(blob) => blob_digest(blob),
        Chunk::List(items) => {
            let mut tag = b"list".to_vec();
            tag.extend_from_slice(items.len().to_string().as_bytes());
            let mut acc = sha384(&[&tag]);
            for item in items {
                acc = sha384(&[&acc, &deep_hash(item)]);
            }
            acc
        }
    }
}

/// Deep hash of a list whose final element is a streamed blob, known only by
/// its length and content hash. The parser uses this so the payload is
/// hashed as it flows rather than held in memory.
pub fn deep_hash_list_with_streamed_tail(
    head: &[Chunk<'_>],
    tail_len: u64,
    tail_hash: DeepHash,
) -> DeepHash {
    let mut tag = b"list".to_vec();
    tag.extend_from_slice((head.len() + 1).to_string().as_bytes());
    let mut acc = sha384(&[&tag]);
    for item in head {
        acc = sha384(&[&acc, &deep_hash(item)]);
    }
    sha384(&[&acc, &blob_digest_from_hash(tail_len, tail_hash)])
}

/// Incremental SHA-384 over a streamed blob's content.
#[derive(Clone)]
pub struct StreamHasher {
    hasher: Sha384,
    len: u64,
}

impl Default for StreamHasher {
    fn default() -> Self {
        Self {
            hasher: Sha384::new(),
            len: 0,
        }
    }
}

impl StreamHasher {
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize(self) -> (u64, DeepHash) {
        (self.len, self.hasher.finalize().into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn blob_and_list_digests_differ() {
        let blob = deep_hash(&Chunk::Blob(b"hello"));
        let list = deep_hash(&Chunk::List(vec![Chunk::Blob(b"hello")]));
        assert_ne!(blob, list);
    }

    #[test]
    fn empty_blob_and_empty_list_are_distinct() {
        let blob = deep_hash(&Chunk::Blob(b""));
        let list = deep_hash(&Chunk::List(vec![]));
        assert_ne!(blob, list);
    }

    #[test]
    fn digest_depends_on_structure_not_concatenation() {
        let one = deep_hash(&Chunk::List(vec![Chunk::Blob(b"ab"), Chunk::Blob(b"c")]));
        let two = deep_hash(&Chunk::List(vec![Chunk::Blob(b"a"), Chunk::Blob(b"bc")]));
        assert_ne!(one, two);
    }

    #[test]
    fn streamed_tail_matches_buffered() {
        let head = vec![Chunk::Blob(b"dataitem"), Chunk::Blob(b"1")];
        let payload = b"the payload bytes".to_vec();

        let mut all = head.clone();
        all.push(Chunk::Blob(&payload));
        let buffered = deep_hash(&Chunk::List(all));

        let mut stream = StreamHasher::default();
        stream.update(&payload[..5]);
        stream.update(&payload[5..]);
        let (len, hash) = stream.finalize();
        let streamed = deep_hash_list_with_streamed_tail(&head, len, hash);

        assert_eq!(buffered, streamed);
    }
}
