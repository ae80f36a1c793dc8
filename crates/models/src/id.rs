use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
#[error("invalid id: expected 32 base64url bytes")]
pub struct ParseIdError;

macro_rules! b64url_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn from_base64<T: AsRef<[u8]>>(s: T) -> Result<Self, ParseIdError> {
                let decoded = base64::decode_config(s.as_ref(), base64::URL_SAFE_NO_PAD)
                    .map_err(|_| ParseIdError)?;
                let exact: [u8; 32] = decoded.as_slice().try_into().map_err(|_| ParseIdError)?;
                Ok(Self(exact))
            }
        }

        impl std::str::FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_base64(s)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&base64::encode_config(self.0, base64::URL_SAFE_NO_PAD))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                <Self as std::fmt::Display>::fmt(self, f)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                format!("{self}").serialize(serializer)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                use serde::de::Error;
                let str_val = std::borrow::Cow::<'de, str>::deserialize(deserializer)?;
                Self::from_base64(str_val.as_ref()).map_err(|err| D::Error::custom(format!("{err}")))
            }
        }
    };
}

b64url_id!(
    DataItemId,
    "Identifier of a signed data item: SHA-256 of its signature field, rendered base64url."
);
b64url_id!(
    BundleId,
    "Identifier of a bundle: the Arweave transaction id (SHA-256 of the transaction signature)."
);

impl DataItemId {
    /// Derive the item id from its signature bytes.
    pub fn from_signature(signature: &[u8]) -> Self {
        let digest: [u8; 32] = Sha256::digest(signature).into();
        Self(digest)
    }
}

/// Identifier of a bundle plan, assigned when the planner closes the plan.
pub type PlanId = uuid::Uuid;

/// Identifier of an in-progress multipart upload.
pub type UploadId = uuid::Uuid;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn id_round_trips_through_base64url() {
        let id = DataItemId([7u8; 32]);
        let s = id.to_string();
        assert_eq!(s.len(), 43);
        assert_eq!(s.parse::<DataItemId>().unwrap(), id);
    }

    #[test]
    fn id_rejects_wrong_length() {
        assert!("AAAA".parse::<DataItemId>().is_err());
        assert!(DataItemId::from_base64("").is_err());
    }

    #[test]
    fn id_is_sha256_of_signature() {
        let sig = vec![1u8, 2, 3];
        let id = DataItemId::from_signature(&sig);
        let expect: [u8; 32] = Sha256::digest(&sig).into();
        assert_eq!(id.0, expect);
    }
}
