use ans104::ArweaveKey;

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("failed to read wallet file: {0}")]
    Io(#[from] std::io::Error),
    #[error("wallet JWK is invalid")]
    InvalidJwk,
}

/// The service's RSA-4096 signing identity: signs bundle transactions,
/// receipts, and raw-mode data items.
#[derive(Debug, Clone)]
pub struct Wallet {
    key: ArweaveKey,
}

impl Wallet {
    pub fn from_jwk_json(json: &str) -> Result<Self, WalletError> {
        let key = ArweaveKey::from_jwk_json(json).map_err(|_| WalletError::InvalidJwk)?;
        Ok(Self { key })
    }

    /// Load the JWK from a file path. Read once at boot.
    pub fn load(path: &std::path::Path) -> Result<Self, WalletError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_jwk_json(&json)
    }

    pub fn from_key(key: ArweaveKey) -> Self {
        Self { key }
    }

    /// Base64url address of the wallet.
    pub fn address(&self) -> String {
        self.key.address()
    }

    /// Raw RSA modulus, the `owner` field of signed artifacts.
    pub fn owner_bytes(&self) -> Vec<u8> {
        self.key.owner_bytes()
    }

    pub fn owner_base64(&self) -> String {
        self.key.owner_base64()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.key.sign(message)
    }

    pub fn key(&self) -> &ArweaveKey {
        &self.key
    }
}
