//! The fixed key scheme of the object store. All callers go through these
//! constructors so prefixes stay consistent across components.

use models::{BundleId, DataItemId, UploadId};
use object_store::path::Path;

/// Raw bytes of an admitted data item.
pub fn raw(id: DataItemId) -> Path {
    Path::from(format!("raw/{id}"))
}

/// Holding area for invalid or failed admissions, kept for forensics.
pub fn quarantine(id: &str) -> Path {
    Path::from(format!("quarantine/raw/{id}"))
}

/// Staging key for an in-flight admission whose id is not yet final.
pub fn staging(token: uuid::Uuid) -> Path {
    Path::from(format!("raw/staging/{token}"))
}

/// The bundle's serialized header.
pub fn bundle_header(id: BundleId) -> Path {
    Path::from(format!("bundle/{id}"))
}

/// The bundle's payload: concatenated items in header order.
pub fn bundle_payload(id: BundleId) -> Path {
    Path::from(format!("bundle/{id}/payload"))
}

/// One part of a multipart upload.
pub fn multipart_part(upload_id: UploadId, index: u32) -> Path {
    Path::from(format!("mp/{upload_id}/{index}"))
}

/// Probe object written at boot to verify the store is writable.
pub fn healthcheck() -> Path {
    Path::from("healthcheck/boot")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn keys_use_fixed_prefixes() {
        let id = DataItemId([0u8; 32]);
        assert!(raw(id).as_ref().starts_with("raw/"));
        assert!(quarantine(&id.to_string())
            .as_ref()
            .starts_with("quarantine/raw/"));
        let bundle = BundleId([1u8; 32]);
        assert_eq!(
            bundle_payload(bundle).as_ref(),
            format!("bundle/{bundle}/payload")
        );
        assert!(multipart_part(uuid::Uuid::nil(), 3).as_ref().ends_with("/3"));
    }
}
