pub mod keys;
mod store;

pub use object_store::buffered::BufWriter as BlobWriter;
pub use object_store::path::Path;
pub use store::{BlobError, BlobStore, StoreConfig};
