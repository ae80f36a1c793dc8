//! Streaming parser for signed data items. The parser performs no I/O: feed
//! it bytes with [`Parser::push`] as they arrive, then call
//! [`Parser::finish`] at end of stream. The item id is available from
//! [`Parser::id`] as soon as the signature field has been consumed, long
//! before the payload completes.

use crate::deep_hash::{self, DeepHash, StreamHasher};
use crate::signers;
use crate::tags::{self, Tag, TagError};
use models::{DataItemId, SignatureType};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed data item: {0}")]
    MalformedHeader(&'static str),
    #[error("tag limits exceeded")]
    TagLimitExceeded,
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("data item exceeds the {limit} byte limit")]
    SizeExceeded { limit: u64 },
    #[error("stream length {actual} disagrees with declared length {declared}")]
    SizeMismatch { declared: u64, actual: u64 },
    #[error("unsupported signature type {0}")]
    UnsupportedSignatureType(u16),
}

impl From<TagError> for ParseError {
    fn from(err: TagError) -> Self {
        match err {
            TagError::LimitExceeded(_) => ParseError::TagLimitExceeded,
            TagError::Malformed(_) => ParseError::MalformedHeader("invalid tag section"),
        }
    }
}

/// Fully parsed and signature-verified metadata of one data item.
#[derive(Debug, Clone)]
pub struct ParsedItem {
    pub id: DataItemId,
    pub signature_type: SignatureType,
    pub owner_address: String,
    pub target: Option<[u8; 32]>,
    pub anchor: Option<[u8; 32]>,
    pub tags: Vec<Tag>,
    pub content_type: Option<String>,
    /// Total serialized length, header plus payload.
    pub byte_count: u64,
    /// Offset at which the payload begins.
    pub payload_data_start: u64,
    pub payload_length: u64,
    /// The verified deep hash over the item's signature data.
    pub deep_hash: DeepHash,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Step {
    SignatureType,
    Signature,
    Owner,
    TargetFlag,
    Target,
    AnchorFlag,
    Anchor,
    TagHeader,
    TagBytes,
    Payload,
}

pub struct Parser {
    declared_len: u64,
    max_len: Option<u64>,
    consumed: u64,

    step: Step,
    need: usize,
    buf: Vec<u8>,

    signature_type: Option<SignatureType>,
    signature: Vec<u8>,
    owner: Vec<u8>,
    target: Option<[u8; 32]>,
    anchor: Option<[u8; 32]>,
    declared_tag_count: u64,
    tag_bytes: Vec<u8>,
    tags: Vec<Tag>,
    content_type: Option<String>,
    id: Option<DataItemId>,

    payload_start: u64,
    payload: StreamHasher,
}

impl Parser {
    /// Begin parsing a stream declared to be `declared_len` bytes long.
    /// `max_len`, when set, bounds the accepted item size; a declaration
    /// beyond it fails immediately with `SizeExceeded`.
    pub fn new(declared_len: u64, max_len: Option<u64>) -> Result<Self, ParseError> {
        if let Some(limit) = max_len {
            if declared_len > limit {
                return Err(ParseError::SizeExceeded { limit });
            }
        }
        Ok(Self {
            declared_len,
            max_len,
            consumed: 0,
            step: Step::SignatureType,
            need: 2,
            buf: Vec::new(),
            signature_type: None,
            signature: Vec::new(),
            owner: Vec::new(),
            target: None,
            anchor: None,
            declared_tag_count: 0,
            tag_bytes: Vec::new(),
            tags: Vec::new(),
            content_type: None,
            id: None,
            payload_start: 0,
            payload: StreamHasher::default(),
        })
    }

    /// The item id, available once the signature field has been consumed.
    pub fn id(&self) -> Option<DataItemId> {
        self.id
    }

    /// The scheme and owner address, available once the owner field has been
    /// consumed; used to reserve credit before the body completes.
    pub fn owner_address(&self) -> Option<(SignatureType, String)> {
        let scheme = self.signature_type?;
        if self.owner.is_empty() {
            return None;
        }
        Some((scheme, signers::owner_address(scheme, &self.owner)))
    }

    pub fn bytes_consumed(&self) -> u64 {
        self.consumed
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<(), ParseError> {
        let total = self.consumed + chunk.len() as u64;
        if total > self.declared_len {
            return Err(ParseError::SizeMismatch {
                declared: self.declared_len,
                actual: total,
            });
        }
        if let Some(limit) = self.max_len {
            if total > limit {
                return Err(ParseError::SizeExceeded { limit });
            }
        }

        let mut rest = chunk;
        while !rest.is_empty() {
            if self.step == Step::Payload {
                self.payload.update(rest);
                self.consumed += rest.len() as u64;
                break;
            }

            let take = std::cmp::min(rest.len(), self.need - self.buf.len());
            self.buf.extend_from_slice(&rest[..take]);
            self.consumed += take as u64;
            rest = &rest[take..];

            if self.buf.len() == self.need {
                self.complete_field()?;
            }
        }
        Ok(())
    }

    fn advance(&mut self, step: Step, need: usize) {
        self.step = step;
        self.need = need;
        self.buf.clear();
        if step == Step::Payload {
            self.payload_start = self.consumed;
        }
    }

    fn complete_field(&mut self) -> Result<(), ParseError> {
        match self.step {
            Step::SignatureType => {
                let raw = u16::from_le_bytes([self.buf[0], self.buf[1]]);
                let scheme = SignatureType::from_u16(raw)
                    .ok_or(ParseError::UnsupportedSignatureType(raw))?;
                self.signature_type = Some(scheme);
                self.advance(Step::Signature, scheme.signature_len());
            }
            Step::Signature => {
                self.signature = std::mem::take(&mut self.buf);
                self.id = Some(DataItemId::from_signature(&self.signature));
                let scheme = self.signature_type.expect("scheme is parsed");
                self.advance(Step::Owner, scheme.owner_len());
            }
            Step::Owner => {
                self.owner = std::mem::take(&mut self.buf);
                self.advance(Step::TargetFlag, 1);
            }
            Step::TargetFlag => match self.buf[0] {
                0 => self.advance(Step::AnchorFlag, 1),
                1 => self.advance(Step::Target, 32),
                _ => return Err(ParseError::MalformedHeader("invalid target flag")),
            },
            Step::Target => {
                self.target = Some(self.buf.as_slice().try_into().expect("32 bytes buffered"));
                self.advance(Step::AnchorFlag, 1);
            }
            Step::AnchorFlag => match self.buf[0] {
                0 => self.advance(Step::TagHeader, 16),
                1 => self.advance(Step::Anchor, 32),
                _ => return Err(ParseError::MalformedHeader("invalid anchor flag")),
            },
            Step::Anchor => {
                self.anchor = Some(self.buf.as_slice().try_into().expect("32 bytes buffered"));
                self.advance(Step::TagHeader, 16);
            }
            Step::TagHeader => {
                let count = u64::from_le_bytes(self.buf[0..8].try_into().unwrap());
                let byte_len = u64::from_le_bytes(self.buf[8..16].try_into().unwrap());
                if count > tags::MAX_TAG_COUNT as u64 {
                    return Err(ParseError::TagLimitExceeded);
                }
                if byte_len > tags::MAX_TAG_SECTION_BYTES as u64 {
                    return Err(ParseError::TagLimitExceeded);
                }
                self.declared_tag_count = count;
                if byte_len == 0 {
                    if count != 0 {
                        return Err(ParseError::MalformedHeader("tag count without tag bytes"));
                    }
                    self.advance(Step::Payload, 0);
                } else {
                    self.advance(Step::TagBytes, byte_len as usize);
                }
            }
            Step::TagBytes => {
                self.tag_bytes = std::mem::take(&mut self.buf);
                self.tags = tags::decode(&self.tag_bytes)?;
                if self.tags.len() as u64 != self.declared_tag_count {
                    return Err(ParseError::MalformedHeader("tag count mismatch"));
                }
                self.content_type = tags::find(&self.tags, "content-type").map(str::to_string);
                self.advance(Step::Payload, 0);
            }
            Step::Payload => unreachable!("payload is consumed in push"),
        }
        Ok(())
    }

    /// Finalize the stream: check the declared length, then verify the
    /// signature over the item's deep hash.
    pub fn finish(self) -> Result<ParsedItem, ParseError> {
        if self.consumed != self.declared_len {
            return Err(ParseError::SizeMismatch {
                declared: self.declared_len,
                actual: self.consumed,
            });
        }
        if self.step != Step::Payload {
            return Err(ParseError::MalformedHeader("truncated header"));
        }

        let scheme = self.signature_type.expect("header is complete");
        let sigtype_str = scheme.as_u16().to_string();
        let target = self.target.as_ref().map(|t| t.as_slice()).unwrap_or(&[]);
        let anchor = self.anchor.as_ref().map(|a| a.as_slice()).unwrap_or(&[]);

        let head = [
            deep_hash::Chunk::Blob(b"dataitem"),
            deep_hash::Chunk::Blob(b"1"),
            deep_hash::Chunk::Blob(sigtype_str.as_bytes()),
            deep_hash::Chunk::Blob(&self.owner),
            deep_hash::Chunk::Blob(target),
            deep_hash::Chunk::Blob(anchor),
            deep_hash::Chunk::Blob(&self.tag_bytes),
        ];
        let (payload_length, payload_hash) = self.payload.finalize();
        let message =
            deep_hash::deep_hash_list_with_streamed_tail(&head, payload_length, payload_hash);

        signers::verify(scheme, &self.owner, &message, &self.signature)
            .map_err(|_| ParseError::SignatureInvalid)?;

        Ok(ParsedItem {
            id: self.id.expect("signature is parsed"),
            signature_type: scheme,
            owner_address: signers::owner_address(scheme, &self.owner),
            target: self.target,
            anchor: self.anchor,
            tags: self.tags,
            content_type: self.content_type,
            byte_count: self.consumed,
            payload_data_start: self.payload_start,
            payload_length,
            deep_hash: message,
        })
    }
}

/// Convenience entry point for fully buffered items (tests, unbundling).
pub fn parse_bytes(bytes: &[u8], max_len: Option<u64>) -> Result<ParsedItem, ParseError> {
    let mut parser = Parser::new(bytes.len() as u64, max_len)?;
    parser.push(bytes)?;
    parser.finish()
}
