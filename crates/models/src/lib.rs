mod id;
mod receipt;
mod signature;
mod state;

pub use id::{BundleId, DataItemId, ParseIdError, PlanId, UploadId};
pub use receipt::{Receipt, SignedReceipt, Winston, RECEIPT_VERSION};
pub use signature::SignatureType;
pub use state::{BundleState, FailureReason, ItemStatus, PriorityClass};
