pub mod bundle;
pub mod create;
pub mod deep_hash;
pub mod parse;
pub mod signers;
pub mod tags;

pub use bundle::{decode_header, derive_bundle_id, encode_header, BundleEntry, BundleError};
pub use create::{sign_header, sign_item, CreateError, ItemDraft};
pub use parse::{parse_bytes, ParseError, ParsedItem, Parser};
pub use signers::{owner_address, verify, ArweaveKey, ItemSigner, SignatureError};
pub use tags::{Tag, TagError};
