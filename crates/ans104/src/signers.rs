//! Signature verification and local signing for the supported data-item
//! schemes, plus native owner-address derivation.

use models::SignatureType;
use rsa::pss::{Signature as PssSignature, SigningKey as PssSigningKey, VerifyingKey as PssVerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use sha3::Keccak256;

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("signature does not verify against the owner key")]
    Invalid,
    #[error("owner field is not a valid public key")]
    BadOwner,
    #[error("malformed signature field")]
    BadSignature,
}

/// Verify `signature` over `message` for the given scheme, where `owner` is
/// the scheme's raw public key field.
pub fn verify(
    scheme: SignatureType,
    owner: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    match scheme {
        SignatureType::Arweave => {
            let n = BigUint::from_bytes_be(owner);
            let e = BigUint::from(65537u32);
            let key = RsaPublicKey::new(n, e).map_err(|_| SignatureError::BadOwner)?;
            let verifying = PssVerifyingKey::<Sha256>::new(key);
            let signature =
                PssSignature::try_from(signature).map_err(|_| SignatureError::BadSignature)?;
            verifying
                .verify(message, &signature)
                .map_err(|_| SignatureError::Invalid)
        }
        SignatureType::Ed25519 | SignatureType::Solana => {
            let owner: &[u8; 32] = owner.try_into().map_err(|_| SignatureError::BadOwner)?;
            let key = ed25519_dalek::VerifyingKey::from_bytes(owner)
                .map_err(|_| SignatureError::BadOwner)?;
            let signature: &[u8; 64] =
                signature.try_into().map_err(|_| SignatureError::BadSignature)?;
            let signature = ed25519_dalek::Signature::from_bytes(signature);
            key.verify(message, &signature)
                .map_err(|_| SignatureError::Invalid)
        }
        SignatureType::Ethereum => verify_ethereum(owner, message, signature),
    }
}

fn verify_ethereum(owner: &[u8], message: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
    use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};

    if signature.len() != 65 {
        return Err(SignatureError::BadSignature);
    }
    let digest = personal_message_digest(message);

    let v = signature[64];
    let v = if v >= 27 { v - 27 } else { v };
    let recovery = RecoveryId::from_i32(v as i32).map_err(|_| SignatureError::BadSignature)?;
    let recoverable = RecoverableSignature::from_compact(&signature[..64], recovery)
        .map_err(|_| SignatureError::BadSignature)?;

    let secp = secp256k1::Secp256k1::new();
    let recovered = secp
        .recover_ecdsa(&secp256k1::Message::from_digest(digest), &recoverable)
        .map_err(|_| SignatureError::Invalid)?;

    if recovered.serialize_uncompressed().as_slice() == owner {
        Ok(())
    } else {
        Err(SignatureError::Invalid)
    }
}

/// Keccak-256 over the EIP-191 personal-message framing of `message`.
fn personal_message_digest(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n");
    hasher.update(message.len().to_string().as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

/// Derive the native address string for an owner public key.
pub fn owner_address(scheme: SignatureType, owner: &[u8]) -> String {
    match scheme {
        SignatureType::Arweave => {
            let digest: [u8; 32] = Sha256::digest(owner).into();
            base64::encode_config(digest, base64::URL_SAFE_NO_PAD)
        }
        SignatureType::Ed25519 | SignatureType::Solana => bs58::encode(owner).into_string(),
        SignatureType::Ethereum => {
            let digest: [u8; 32] = Keccak256::digest(&owner[1..]).into();
            format!("0x{}", hex::encode(&digest[12..]))
        }
    }
}

/// An RSA-4096 Arweave key, used for signing bundle transactions, receipts,
/// and raw-mode data items.
#[derive(Clone)]
pub struct ArweaveKey {
    key: RsaPrivateKey,
}

/// The subset of RFC 7517 JWK fields an Arweave wallet file carries.
#[derive(serde::Deserialize)]
struct Jwk {
    n: String,
    e: String,
    d: String,
    p: String,
    q: String,
}

fn jwk_uint(field: &str) -> Result<BigUint, SignatureError> {
    let bytes = base64::decode_config(field, base64::URL_SAFE_NO_PAD)
        .map_err(|_| SignatureError::BadOwner)?;
    Ok(BigUint::from_bytes_be(&bytes))
}

impl ArweaveKey {
    pub fn from_jwk_json(json: &str) -> Result<Self, SignatureError> {
        let jwk: Jwk = serde_json::from_str(json).map_err(|_| SignatureError::BadOwner)?;
        let key = RsaPrivateKey::from_components(
            jwk_uint(&jwk.n)?,
            jwk_uint(&jwk.e)?,
            jwk_uint(&jwk.d)?,
            vec![jwk_uint(&jwk.p)?, jwk_uint(&jwk.q)?],
        )
        .map_err(|_| SignatureError::BadOwner)?;
        Ok(Self { key })
    }

    pub fn generate(bits: usize) -> Result<Self, rsa::Error> {
        let key = RsaPrivateKey::new(&mut rand::rngs::OsRng, bits)?;
        Ok(Self { key })
    }

    /// The raw owner field: the key's big-endian modulus.
    pub fn owner_bytes(&self) -> Vec<u8> {
        self.key.to_public_key().n().to_bytes_be()
    }

    pub fn owner_base64(&self) -> String {
        base64::encode_config(self.owner_bytes(), base64::URL_SAFE_NO_PAD)
    }

    pub fn address(&self) -> String {
        owner_address(SignatureType::Arweave, &self.owner_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signing = PssSigningKey::<Sha256>::new(self.key.clone());
        signing
            .sign_with_rng(&mut rand::rngs::OsRng, message)
            .to_vec()
    }
}

impl std::fmt::Debug for ArweaveKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArweaveKey")
            .field("address", &self.address())
            .finish()
    }
}

/// A local signer for constructing data items (raw-mode admission, tests).
#[derive(Clone, Debug)]
pub enum ItemSigner {
    Arweave(ArweaveKey),
    Ed25519(ed25519_dalek::SigningKey),
}

impl ItemSigner {
    pub fn signature_type(&self) -> SignatureType {
        match self {
            Self::Arweave(_) => SignatureType::Arweave,
            Self::Ed25519(_) => SignatureType::Ed25519,
        }
    }

    pub fn owner_bytes(&self) -> Vec<u8> {
        match self {
            Self::Arweave(key) => key.owner_bytes(),
            Self::Ed25519(key) => key.verifying_key().to_bytes().to_vec(),
        }
    }

    pub fn address(&self) -> String {
        owner_address(self.signature_type(), &self.owner_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        match self {
            Self::Arweave(key) => key.sign(message),
            Self::Ed25519(key) => {
                use ed25519_dalek::Signer;
                key.sign(message).to_vec()
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ed25519_signer() -> ItemSigner {
        ItemSigner::Ed25519(ed25519_dalek::SigningKey::from_bytes(&[42u8; 32]))
    }

    #[test]
    fn ed25519_sign_verify_round_trip() {
        let signer = ed25519_signer();
        let message = b"a message to cover";
        let signature = signer.sign(message);

        verify(
            SignatureType::Ed25519,
            &signer.owner_bytes(),
            message,
            &signature,
        )
        .unwrap();

        let mut tampered = signature.clone();
        tampered[0] ^= 1;
        assert!(matches!(
            verify(
                SignatureType::Ed25519,
                &signer.owner_bytes(),
                message,
                &tampered
            ),
            Err(SignatureError::Invalid)
        ));
    }

    #[test]
    fn solana_address_is_base58_of_owner() {
        let owner = [3u8; 32];
        let address = owner_address(SignatureType::Solana, &owner);
        assert_eq!(bs58::decode(&address).into_vec().unwrap(), owner.to_vec());
    }

    #[test]
    fn ethereum_recovery_round_trip() {
        let secp = secp256k1::Secp256k1::new();
        let secret = secp256k1::SecretKey::from_slice(&[9u8; 32]).unwrap();
        let public = secp256k1::PublicKey::from_secret_key(&secp, &secret);
        let owner = public.serialize_uncompressed();

        let message = b"deep hash stand-in";
        let digest = personal_message_digest(message);
        let (recovery, compact) = secp
            .sign_ecdsa_recoverable(&secp256k1::Message::from_digest(digest), &secret)
            .serialize_compact();

        let mut signature = compact.to_vec();
        signature.push(recovery.to_i32() as u8 + 27);

        verify(SignatureType::Ethereum, &owner, message, &signature).unwrap();
        assert!(verify(SignatureType::Ethereum, &owner, b"other", &signature).is_err());
    }

    #[test]
    #[ignore = "4096-bit RSA key generation is slow in debug builds"]
    fn arweave_sign_verify_round_trip() {
        let key = ArweaveKey::generate(4096).unwrap();
        let message = b"receipt bytes";
        let signature = key.sign(message);
        assert_eq!(signature.len(), 512);
        verify(SignatureType::Arweave, &key.owner_bytes(), message, &signature).unwrap();
    }
}
