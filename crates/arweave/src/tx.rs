//! Format-2 Arweave transactions: the carrier of a posted bundle. The
//! signature covers the transaction's deep hash; the id is the
//! deterministic bundle id assigned when the bundle was prepared.

use crate::wallet::Wallet;
use ans104::deep_hash::{deep_hash, Chunk};
use models::BundleId;

fn b64(bytes: &[u8]) -> String {
    base64::encode_config(bytes, base64::URL_SAFE_NO_PAD)
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TxTag {
    pub name: String,
    pub value: String,
}

impl TxTag {
    fn new(name: &str, value: &str) -> Self {
        Self {
            name: b64(name.as_bytes()),
            value: b64(value.as_bytes()),
        }
    }
}

/// The wire form submitted to `POST /tx`. Data is uploaded separately as
/// chunks, so `data` stays empty.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Transaction {
    pub format: u8,
    pub id: String,
    pub last_tx: String,
    pub owner: String,
    pub tags: Vec<TxTag>,
    pub target: String,
    pub quantity: String,
    pub data: String,
    pub data_size: String,
    pub data_root: String,
    pub reward: String,
    pub signature: String,
}

/// Build and sign the bundle-carrying transaction. The transaction id is the
/// deterministic bundle id fixed at prepare time, so the payload's storage
/// keys and the chain-side id never diverge.
pub fn build_bundle_tx(
    wallet: &Wallet,
    id: BundleId,
    data_size: u64,
    data_root: [u8; 32],
    reward: u64,
    anchor: &str,
    extra_tags: &[(String, String)],
) -> Result<Transaction, base64::DecodeError> {
    let mut tags = vec![
        TxTag::new("Bundle-Format", "binary"),
        TxTag::new("Bundle-Version", "2.0.0"),
    ];
    for (name, value) in extra_tags {
        tags.push(TxTag::new(name, value));
    }

    let owner = wallet.owner_bytes();
    let anchor_raw = base64::decode_config(anchor, base64::URL_SAFE_NO_PAD)?;
    let quantity = "0";
    let reward = reward.to_string();
    let data_size = data_size.to_string();

    // The v2 signature data: tag names and values enter as raw bytes.
    let tag_chunks: Vec<Vec<Vec<u8>>> = tags
        .iter()
        .map(|tag| {
            Ok(vec![
                base64::decode_config(&tag.name, base64::URL_SAFE_NO_PAD)?,
                base64::decode_config(&tag.value, base64::URL_SAFE_NO_PAD)?,
            ])
        })
        .collect::<Result<_, base64::DecodeError>>()?;
    let tag_list: Vec<Chunk> = tag_chunks
        .iter()
        .map(|pair| Chunk::List(vec![Chunk::Blob(&pair[0]), Chunk::Blob(&pair[1])]))
        .collect();

    let message = deep_hash(&Chunk::List(vec![
        Chunk::Blob(b"2"),
        Chunk::Blob(&owner),
        Chunk::Blob(&[]), // target
        Chunk::Blob(quantity.as_bytes()),
        Chunk::Blob(reward.as_bytes()),
        Chunk::Blob(&anchor_raw),
        Chunk::List(tag_list),
        Chunk::Blob(data_size.as_bytes()),
        Chunk::Blob(&data_root),
    ]));

    let signature = wallet.sign(&message);

    Ok(Transaction {
        format: 2,
        id: id.to_string(),
        last_tx: anchor.to_string(),
        owner: b64(&owner),
        tags,
        target: String::new(),
        quantity: quantity.to_string(),
        data: String::new(),
        data_size,
        data_root: b64(&data_root),
        reward,
        signature: b64(&signature),
    })
}

impl Transaction {
    pub fn tx_id(&self) -> Result<BundleId, models::ParseIdError> {
        self.id.parse()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tag_wire_form_is_base64url() {
        let tag = TxTag::new("Bundle-Format", "binary");
        assert_eq!(
            base64::decode_config(&tag.name, base64::URL_SAFE_NO_PAD).unwrap(),
            b"Bundle-Format"
        );
        assert_eq!(
            base64::decode_config(&tag.value, base64::URL_SAFE_NO_PAD).unwrap(),
            b"binary"
        );
    }
}
