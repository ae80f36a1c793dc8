//! Construction of signed data items, used by raw-mode admission (where the
//! service signs on behalf of the uploader) and by tests.

use crate::deep_hash::{self, DeepHash, StreamHasher};
use crate::signers::ItemSigner;
use crate::tags::{self, Tag, TagError};

#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error(transparent)]
    Tags(#[from] TagError),
}

/// The unsigned parts of a data item under construction.
#[derive(Debug, Clone, Default)]
pub struct ItemDraft {
    pub target: Option<[u8; 32]>,
    pub anchor: Option<[u8; 32]>,
    pub tags: Vec<Tag>,
}

/// Sign a draft against an already-hashed payload and return the serialized
/// item header (everything up to the payload). The caller appends the
/// payload bytes themselves, which allows the payload to be streamed from
/// wherever it is staged.
pub fn sign_header(
    signer: &ItemSigner,
    draft: &ItemDraft,
    payload_len: u64,
    payload_hash: DeepHash,
) -> Result<Vec<u8>, CreateError> {
    let tag_bytes = tags::encode(&draft.tags)?;
    let sigtype_str = signer.signature_type().as_u16().to_string();
    let owner = signer.owner_bytes();
    let target = draft.target.as_ref().map(|t| t.as_slice()).unwrap_or(&[]);
    let anchor = draft.anchor.as_ref().map(|a| a.as_slice()).unwrap_or(&[]);

    let head = [
        deep_hash::Chunk::Blob(b"dataitem"),
        deep_hash::Chunk::Blob(b"1"),
        deep_hash::Chunk::Blob(sigtype_str.as_bytes()),
        deep_hash::Chunk::Blob(&owner),
        deep_hash::Chunk::Blob(target),
        deep_hash::Chunk::Blob(anchor),
        deep_hash::Chunk::Blob(&tag_bytes),
    ];
    let message = deep_hash::deep_hash_list_with_streamed_tail(&head, payload_len, payload_hash);
    let signature = signer.sign(&message);

    let mut out = Vec::new();
    out.extend_from_slice(&signer.signature_type().as_u16().to_le_bytes());
    out.extend_from_slice(&signature);
    out.extend_from_slice(&owner);
    match &draft.target {
        Some(target) => {
            out.push(1);
            out.extend_from_slice(target);
        }
        None => out.push(0),
    }
    match &draft.anchor {
        Some(anchor) => {
            out.push(1);
            out.extend_from_slice(anchor);
        }
        None => out.push(0),
    }
    out.extend_from_slice(&(draft.tags.len() as u64).to_le_bytes());
    out.extend_from_slice(&(tag_bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(&tag_bytes);
    Ok(out)
}

/// Sign a draft over an in-memory payload and return the complete item.
pub fn sign_item(
    signer: &ItemSigner,
    draft: &ItemDraft,
    payload: &[u8],
) -> Result<Vec<u8>, CreateError> {
    let mut hasher = StreamHasher::default();
    hasher.update(payload);
    let (len, hash) = hasher.finalize();

    let mut bytes = sign_header(signer, draft, len, hash)?;
    bytes.extend_from_slice(payload);
    Ok(bytes)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::parse::{parse_bytes, ParseError, Parser};
    use models::{DataItemId, SignatureType};

    fn signer() -> ItemSigner {
        ItemSigner::Ed25519(ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]))
    }

    fn draft() -> ItemDraft {
        ItemDraft {
            target: None,
            anchor: Some([9u8; 32]),
            tags: vec![Tag::new("Content-Type", "text/plain")],
        }
    }

    #[test]
    fn signed_item_parses_and_verifies() {
        let payload = b"hello, permaweb".to_vec();
        let bytes = sign_item(&signer(), &draft(), &payload).unwrap();

        let item = parse_bytes(&bytes, None).unwrap();
        assert_eq!(item.signature_type, SignatureType::Ed25519);
        assert_eq!(item.owner_address, signer().address());
        assert_eq!(item.payload_length, payload.len() as u64);
        assert_eq!(
            item.payload_data_start + item.payload_length,
            bytes.len() as u64
        );
        assert_eq!(item.content_type.as_deref(), Some("text/plain"));
        assert_eq!(item.anchor, Some([9u8; 32]));
        assert_eq!(item.target, None);
    }

    #[test]
    fn id_is_available_at_signature_completion() {
        let bytes = sign_item(&signer(), &draft(), b"payload").unwrap();

        // Feed only the two-byte scheme and the 64-byte signature.
        let mut parser = Parser::new(bytes.len() as u64, None).unwrap();
        parser.push(&bytes[..66]).unwrap();

        let early_id = parser.id().expect("id must be known after the signature");
        let expect = DataItemId::from_signature(&bytes[2..66]);
        assert_eq!(early_id, expect);

        parser.push(&bytes[66..]).unwrap();
        assert_eq!(parser.finish().unwrap().id, early_id);
    }

    #[test]
    fn parse_survives_byte_at_a_time_delivery() {
        let bytes = sign_item(&signer(), &draft(), b"drip").unwrap();
        let mut parser = Parser::new(bytes.len() as u64, None).unwrap();
        for byte in &bytes {
            parser.push(std::slice::from_ref(byte)).unwrap();
        }
        let item = parser.finish().unwrap();
        assert_eq!(item.payload_length, 4);
    }

    #[test]
    fn tampered_payload_fails_signature() {
        let mut bytes = sign_item(&signer(), &draft(), b"payload").unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(
            parse_bytes(&bytes, None),
            Err(ParseError::SignatureInvalid)
        ));
    }

    #[test]
    fn short_stream_is_a_size_mismatch() {
        let bytes = sign_item(&signer(), &draft(), b"payload").unwrap();
        let mut parser = Parser::new(bytes.len() as u64 + 1, None).unwrap();
        parser.push(&bytes).unwrap();
        assert!(matches!(
            parser.finish(),
            Err(ParseError::SizeMismatch { declared, actual })
                if declared == bytes.len() as u64 + 1 && actual == bytes.len() as u64
        ));
    }

    #[test]
    fn long_stream_is_a_size_mismatch() {
        let bytes = sign_item(&signer(), &draft(), b"payload").unwrap();
        let mut parser = Parser::new(bytes.len() as u64 - 1, None).unwrap();
        assert!(matches!(
            parser.push(&bytes),
            Err(ParseError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn item_at_limit_passes_and_over_limit_fails() {
        let bytes = sign_item(&signer(), &draft(), b"xx").unwrap();
        let len = bytes.len() as u64;

        assert!(parse_bytes(&bytes, Some(len)).is_ok());
        assert!(matches!(
            Parser::new(len, Some(len - 1)),
            Err(ParseError::SizeExceeded { .. })
        ));
    }

    #[test]
    fn unknown_signature_type_is_rejected() {
        let mut parser = Parser::new(100, None).unwrap();
        assert!(matches!(
            parser.push(&[0xff, 0xff]),
            Err(ParseError::UnsupportedSignatureType(0xffff))
        ));
    }

    #[test]
    fn bad_target_flag_is_malformed() {
        let bytes = sign_item(&signer(), &ItemDraft::default(), b"x").unwrap();
        let mut bad = bytes.clone();
        bad[2 + 64 + 32] = 2; // target flag
        assert!(matches!(
            parse_bytes(&bad, None),
            Err(ParseError::MalformedHeader(_))
        ));
    }
}
