/// Signature schemes supported for incoming data items. The discriminant is
/// the on-wire `signature_type` field (two bytes, little-endian).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureType {
    Arweave = 1,
    Ed25519 = 2,
    Ethereum = 3,
    Solana = 4,
}

impl SignatureType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Arweave),
            2 => Some(Self::Ed25519),
            3 => Some(Self::Ethereum),
            4 => Some(Self::Solana),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Fixed byte length of the signature field for this scheme.
    pub fn signature_len(&self) -> usize {
        match self {
            Self::Arweave => 512,
            Self::Ed25519 | Self::Solana => 64,
            Self::Ethereum => 65,
        }
    }

    /// Fixed byte length of the owner (public key) field for this scheme.
    pub fn owner_len(&self) -> usize {
        match self {
            Self::Arweave => 512,
            Self::Ed25519 | Self::Solana => 32,
            Self::Ethereum => 65,
        }
    }
}

#[cfg(test)]
mod test {
    use super::SignatureType;

    #[test]
    fn known_schemes_round_trip() {
        for v in [1u16, 2, 3, 4] {
            let scheme = SignatureType::from_u16(v).unwrap();
            assert_eq!(scheme.as_u16(), v);
        }
        assert_eq!(SignatureType::from_u16(0), None);
        assert_eq!(SignatureType::from_u16(99), None);
    }
}
