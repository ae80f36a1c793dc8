pub mod breaker;
pub mod chunks;
pub mod gateway;
pub mod tx;
pub mod wallet;

pub use breaker::{BreakerError, CircuitBreaker};
pub use chunks::{
    chunk_data, chunk_ranges, tree_from_leaf_hashes, ChunkedData, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};
pub use gateway::{ChunkUpload, Gateway, GatewayError, TxStatus};
pub use tx::{build_bundle_tx, Transaction, TxTag};
pub use wallet::{Wallet, WalletError};
