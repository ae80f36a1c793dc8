pub mod admit;
pub mod api;
pub mod config;
pub mod core;
pub mod credit;
pub mod receipt;
pub mod workers;

pub use admit::{admit_single, AdmitError, AdmitRequest, Admitted, UploadAck};
pub use config::Config;
pub use core::Core;
pub use credit::{CreditError, CreditService, FreeCredit, HttpCreditClient};
pub use receipt::{sign_receipt, verify_receipt};
