use crate::DataItemId;

/// Protocol version stamped into every receipt.
pub const RECEIPT_VERSION: &str = "0.2.0";

/// Winston credits: the opaque cost unit of the Credit Service.
/// Serialized as a decimal string on the wire.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Winston(pub u64);

impl std::fmt::Display for Winston {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Winston {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl serde::Serialize for Winston {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        format!("{self}").serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Winston {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        let str_val = std::borrow::Cow::<'de, str>::deserialize(deserializer)?;
        str_val
            .parse()
            .map_err(|err| D::Error::custom(format!("invalid winston amount: {err}")))
    }
}

/// The unsigned body of an upload receipt. Field order is the canonical
/// serialization order: the signature covers exactly these fields, serialized
/// as compact JSON in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Receipt {
    pub id: DataItemId,
    /// Unix epoch milliseconds at which the item was admitted.
    pub timestamp: i64,
    pub winc: Winston,
    pub version: String,
    pub deadline_height: u64,
}

impl Receipt {
    /// The canonical bytes covered by the receipt signature.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // serde_json writes struct fields in declaration order, which makes
        // compact serialization canonical for this fixed shape.
        serde_json::to_vec(self).expect("receipt serialization cannot fail")
    }
}

/// A receipt together with its signature and the signing public key,
/// both base64url.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SignedReceipt {
    #[serde(flatten)]
    pub receipt: Receipt,
    pub signature: String,
    pub public: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn winston_serializes_as_string() {
        let w: Winston = serde_json::from_str(r#""12345""#).unwrap();
        assert_eq!(w, Winston(12345));
        assert_eq!(serde_json::to_string(&w).unwrap(), r#""12345""#);
    }

    #[test]
    fn canonical_bytes_are_stable() {
        let receipt = Receipt {
            id: DataItemId([1u8; 32]),
            timestamp: 1_700_000_000_000,
            winc: Winston(42),
            version: RECEIPT_VERSION.to_string(),
            deadline_height: 1_400_200,
        };
        assert_eq!(receipt.canonical_bytes(), receipt.clone().canonical_bytes());

        let text = String::from_utf8(receipt.canonical_bytes()).unwrap();
        // The id field leads, so verifiers can parse the covered id first.
        assert!(text.starts_with(r#"{"id":""#), "got {text}");
        assert!(text.contains(r#""deadline_height":1400200"#));
    }

    #[test]
    fn signed_receipt_flattens_fields() {
        let signed = SignedReceipt {
            receipt: Receipt {
                id: DataItemId([2u8; 32]),
                timestamp: 1,
                winc: Winston(0),
                version: RECEIPT_VERSION.to_string(),
                deadline_height: 10,
            },
            signature: "c2ln".to_string(),
            public: "cHVi".to_string(),
        };
        let value = serde_json::to_value(&signed).unwrap();
        assert!(value.get("id").is_some());
        assert!(value.get("signature").is_some());
        assert!(value.get("receipt").is_none());
    }
}
