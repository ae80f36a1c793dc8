//! The on-wire tag section of a data item: an Avro-style array of
//! `{name, value}` string records, using zigzag-varint longs for lengths
//! and block counts.

pub const MAX_TAG_COUNT: usize = 128;
pub const MAX_TAG_NAME_BYTES: usize = 1024;
pub const MAX_TAG_VALUE_BYTES: usize = 3072;
pub const MAX_TAG_SECTION_BYTES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TagError {
    #[error("tag section is malformed: {0}")]
    Malformed(&'static str),
    #[error("tag limits exceeded: {0}")]
    LimitExceeded(&'static str),
}

fn encode_long(value: i64, out: &mut Vec<u8>) {
    let mut zigzag = ((value << 1) ^ (value >> 63)) as u64;
    loop {
        let byte = (zigzag & 0x7f) as u8;
        zigzag >>= 7;
        if zigzag == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn decode_long(input: &[u8], pos: &mut usize) -> Result<i64, TagError> {
    let mut zigzag: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *input
            .get(*pos)
            .ok_or(TagError::Malformed("truncated varint"))?;
        *pos += 1;
        if shift >= 64 {
            return Err(TagError::Malformed("varint overflow"));
        }
        zigzag |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Ok((zigzag >> 1) as i64 ^ -((zigzag & 1) as i64))
}

fn check_tag(tag: &Tag) -> Result<(), TagError> {
    if tag.name.is_empty() || tag.name.len() > MAX_TAG_NAME_BYTES {
        return Err(TagError::LimitExceeded("tag name length"));
    }
    if tag.value.len() > MAX_TAG_VALUE_BYTES {
        return Err(TagError::LimitExceeded("tag value length"));
    }
    Ok(())
}

/// Encode tags into their wire form: a single block of records followed by
/// the zero end-of-blocks marker, or a bare zero when there are no tags.
pub fn encode(tags: &[Tag]) -> Result<Vec<u8>, TagError> {
    if tags.len() > MAX_TAG_COUNT {
        return Err(TagError::LimitExceeded("tag count"));
    }
    let mut out = Vec::new();
    if !tags.is_empty() {
        encode_long(tags.len() as i64, &mut out);
        for tag in tags {
            check_tag(tag)?;
            encode_long(tag.name.len() as i64, &mut out);
            out.extend_from_slice(tag.name.as_bytes());
            encode_long(tag.value.len() as i64, &mut out);
            out.extend_from_slice(tag.value.as_bytes());
        }
    }
    encode_long(0, &mut out);
    if out.len() > MAX_TAG_SECTION_BYTES {
        return Err(TagError::LimitExceeded("tag section length"));
    }
    Ok(out)
}

fn decode_string(input: &[u8], pos: &mut usize, max: usize) -> Result<String, TagError> {
    let len = decode_long(input, pos)?;
    if len < 0 || len as usize > max {
        return Err(TagError::LimitExceeded("string length"));
    }
    let len = len as usize;
    let end = pos
        .checked_add(len)
        .ok_or(TagError::Malformed("string length overflow"))?;
    let bytes = input
        .get(*pos..end)
        .ok_or(TagError::Malformed("truncated string"))?;
    *pos = end;
    String::from_utf8(bytes.to_vec()).map_err(|_| TagError::Malformed("string is not utf-8"))
}

/// Decode the tag section. Handles negative block counts (count followed by
/// a block byte-size, per the Avro block framing) and enforces all limits.
pub fn decode(input: &[u8]) -> Result<Vec<Tag>, TagError> {
    if input.len() > MAX_TAG_SECTION_BYTES {
        return Err(TagError::LimitExceeded("tag section length"));
    }
    let mut tags = Vec::new();
    let mut pos = 0usize;
    loop {
        let mut count = decode_long(input, &mut pos)?;
        if count == 0 {
            break;
        }
        if count < 0 {
            // A negative count is followed by the block's byte size.
            count = -count;
            let _block_bytes = decode_long(input, &mut pos)?;
        }
        for _ in 0..count {
            if tags.len() >= MAX_TAG_COUNT {
                return Err(TagError::LimitExceeded("tag count"));
            }
            let name = decode_string(input, &mut pos, MAX_TAG_NAME_BYTES)?;
            let value = decode_string(input, &mut pos, MAX_TAG_VALUE_BYTES)?;
            if name.is_empty() {
                return Err(TagError::Malformed("empty tag name"));
            }
            tags.push(Tag { name, value });
        }
    }
    if pos != input.len() {
        return Err(TagError::Malformed("trailing bytes after end of blocks"));
    }
    Ok(tags)
}

/// Look up a tag by case-insensitive name.
pub fn find<'t>(tags: &'t [Tag], name: &str) -> Option<&'t str> {
    tags.iter()
        .find(|t| t.name.eq_ignore_ascii_case(name))
        .map(|t| t.value.as_str())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_tags_encode_to_single_zero() {
        let encoded = encode(&[]).unwrap();
        assert_eq!(encoded, vec![0]);
        assert_eq!(decode(&encoded).unwrap(), vec![]);
    }

    #[test]
    fn tags_round_trip() {
        let tags = vec![
            Tag::new("Content-Type", "application/json"),
            Tag::new("App-Name", "bundler"),
            Tag::new("empty-value", ""),
        ];
        let encoded = encode(&tags).unwrap();
        assert_eq!(decode(&encoded).unwrap(), tags);
    }

    #[test]
    fn negative_block_count_with_size_is_accepted() {
        // Encode one tag, then rewrite its block header to the negative form.
        let tags = vec![Tag::new("a", "b")];
        let positive = encode(&tags).unwrap();
        // positive = [count=1][len=1]'a'[len=1]'b'[0]
        let mut negative = Vec::new();
        encode_long(-1, &mut negative);
        encode_long((positive.len() - 2) as i64, &mut negative);
        negative.extend_from_slice(&positive[1..]);
        assert_eq!(decode(&negative).unwrap(), tags);
    }

    #[test]
    fn limits_are_enforced() {
        let too_many: Vec<Tag> = (0..129).map(|i| Tag::new(format!("t{i}"), "")).collect();
        assert!(matches!(
            encode(&too_many),
            Err(TagError::LimitExceeded("tag count"))
        ));

        let long_name = vec![Tag::new("n".repeat(1025), "")];
        assert!(encode(&long_name).is_err());

        let long_value = vec![Tag::new("n", "v".repeat(3073))];
        assert!(encode(&long_value).is_err());
    }

    #[test]
    fn truncated_section_is_malformed() {
        let tags = vec![Tag::new("Content-Type", "text/plain")];
        let encoded = encode(&tags).unwrap();
        assert!(decode(&encoded[..encoded.len() - 3]).is_err());
    }

    #[test]
    fn find_is_case_insensitive() {
        let tags = vec![Tag::new("Content-Type", "text/plain")];
        assert_eq!(find(&tags, "content-type"), Some("text/plain"));
        assert_eq!(find(&tags, "missing"), None);
    }
}
