use arweave::Wallet;
use models::{Receipt, SignedReceipt};

/// Sign a receipt with the service's bundling key. Callers only reach this
/// after the item's bytes are durable and its row is committed.
pub fn sign_receipt(wallet: &Wallet, receipt: Receipt) -> SignedReceipt {
    let signature = wallet.sign(&receipt.canonical_bytes());
    SignedReceipt {
        receipt,
        signature: base64::encode_config(signature, base64::URL_SAFE_NO_PAD),
        public: wallet.owner_base64(),
    }
}

/// Verify a receipt against its embedded public key, as clients do.
pub fn verify_receipt(signed: &SignedReceipt) -> Result<(), ans104::SignatureError> {
    let owner = base64::decode_config(&signed.public, base64::URL_SAFE_NO_PAD)
        .map_err(|_| ans104::SignatureError::BadOwner)?;
    let signature = base64::decode_config(&signed.signature, base64::URL_SAFE_NO_PAD)
        .map_err(|_| ans104::SignatureError::BadSignature)?;
    ans104::verify(
        models::SignatureType::Arweave,
        &owner,
        &signed.receipt.canonical_bytes(),
        &signature,
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use models::{DataItemId, Winston, RECEIPT_VERSION};

    #[test]
    fn receipt_signs_and_verifies() {
        let key = ans104::ArweaveKey::generate(2048).unwrap();
        let wallet = Wallet::from_key(key);

        let receipt = Receipt {
            id: DataItemId([5u8; 32]),
            timestamp: 1_722_000_000_000,
            winc: Winston(1234),
            version: RECEIPT_VERSION.to_string(),
            deadline_height: 1_500_000,
        };
        let mut signed = sign_receipt(&wallet, receipt);
        verify_receipt(&signed).unwrap();

        signed.receipt.deadline_height += 1;
        assert!(verify_receipt(&signed).is_err());
    }
}
