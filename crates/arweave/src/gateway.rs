use crate::breaker::{BreakerError, CircuitBreaker};
use crate::chunks::{Chunk, ChunkedData};
use crate::tx::Transaction;
use bytes::Bytes;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("gateway returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("gateway circuit is open")]
    CircuitOpen,
    #[error("unexpected gateway response: {0}")]
    Decode(String),
}

impl From<BreakerError<GatewayError>> for GatewayError {
    fn from(err: BreakerError<GatewayError>) -> Self {
        match err {
            BreakerError::Open => GatewayError::CircuitOpen,
            BreakerError::Inner(inner) => inner,
        }
    }
}

/// Confirmation state of a transaction, per `GET /tx/:id/status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    NotFound,
    Pending,
    Confirmed {
        block_height: u64,
        confirmations: u64,
    },
}

#[derive(serde::Deserialize)]
struct NetworkInfo {
    height: u64,
}

#[derive(serde::Deserialize)]
struct ConfirmedStatus {
    block_height: u64,
    number_of_confirmations: u64,
}

/// One uploaded chunk of a transaction's data.
#[derive(Debug, serde::Serialize)]
pub struct ChunkUpload {
    pub data_root: String,
    pub data_size: String,
    pub data_path: String,
    pub offset: String,
    pub chunk: String,
}

impl ChunkUpload {
    /// `chunk_bytes` is exactly the chunk's slice, `[min_byte_range,
    /// max_byte_range)` of the transaction data.
    pub fn build(chunked: &ChunkedData, chunk: &Chunk, chunk_bytes: &[u8]) -> Self {
        debug_assert_eq!(
            chunk_bytes.len() as u64,
            chunk.max_byte_range - chunk.min_byte_range
        );
        let b64 = |b: &[u8]| base64::encode_config(b, base64::URL_SAFE_NO_PAD);
        Self {
            data_root: b64(&chunked.data_root),
            data_size: chunked.data_size.to_string(),
            data_path: b64(&chunk.proof),
            offset: (chunk.max_byte_range - 1).to_string(),
            chunk: b64(chunk_bytes),
        }
    }
}

/// HTTP client for an Arweave gateway. Every call runs behind a shared
/// circuit breaker so a sick gateway sheds load fast instead of timing out
/// every worker.
#[derive(Debug)]
pub struct Gateway {
    http: reqwest::Client,
    base: String,
    breaker: CircuitBreaker,
}

impl Gateway {
    pub fn new(base: url::Url) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base: base.as_str().trim_end_matches('/').to_string(),
            breaker: CircuitBreaker::new(5, Duration::from_secs(30)),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    pub async fn current_height(&self) -> Result<u64, GatewayError> {
        let url = self.url("info");
        let info: NetworkInfo = self
            .breaker
            .call(async {
                let resp = self.http.get(&url).send().await?.error_for_status()?;
                Ok::<_, GatewayError>(resp.json().await?)
            })
            .await?;
        Ok(info.height)
    }

    /// A recent block hash usable as a transaction anchor.
    pub async fn tx_anchor(&self) -> Result<String, GatewayError> {
        let url = self.url("tx_anchor");
        let anchor = self
            .breaker
            .call(async {
                let resp = self.http.get(&url).send().await?.error_for_status()?;
                Ok::<_, GatewayError>(resp.text().await?)
            })
            .await?;
        Ok(anchor.trim().to_string())
    }

    /// Winston price of storing `bytes` at the Arweave layer; the bundle
    /// transaction's reward estimate.
    pub async fn price(&self, bytes: u64) -> Result<u64, GatewayError> {
        let url = self.url(&format!("price/{bytes}"));
        let text = self
            .breaker
            .call(async {
                let resp = self.http.get(&url).send().await?.error_for_status()?;
                Ok::<_, GatewayError>(resp.text().await?)
            })
            .await?;
        text.trim()
            .parse()
            .map_err(|_| GatewayError::Decode(format!("price response {text:?}")))
    }

    pub async fn submit_tx(&self, tx: &Transaction) -> Result<(), GatewayError> {
        let url = self.url("tx");
        self.breaker
            .call(async {
                let resp = self.http.post(&url).json(tx).send().await?;
                let status = resp.status();
                // 208 means the gateway already has this transaction, which
                // a retried post job treats as success.
                if status.is_success() || status.as_u16() == 208 {
                    Ok(())
                } else {
                    Err(GatewayError::Status(status))
                }
            })
            .await?;
        Ok(())
    }

    pub async fn post_chunk(&self, chunk: &ChunkUpload) -> Result<(), GatewayError> {
        let url = self.url("chunk");
        self.breaker
            .call(async {
                let resp = self.http.post(&url).json(chunk).send().await?;
                let status = resp.status();
                if status.is_success() {
                    Ok(())
                } else {
                    Err(GatewayError::Status(status))
                }
            })
            .await?;
        Ok(())
    }

    pub async fn tx_status(&self, id: &str) -> Result<TxStatus, GatewayError> {
        let url = self.url(&format!("tx/{id}/status"));
        let status = self
            .breaker
            .call(async {
                let resp = self.http.get(&url).send().await?;
                match resp.status().as_u16() {
                    404 => Ok(TxStatus::NotFound),
                    202 => Ok(TxStatus::Pending),
                    code if (200..300).contains(&code) => {
                        let confirmed: ConfirmedStatus = resp.json().await?;
                        Ok(TxStatus::Confirmed {
                            block_height: confirmed.block_height,
                            confirmations: confirmed.number_of_confirmations,
                        })
                    }
                    _ => Err(GatewayError::Status(resp.status())),
                }
            })
            .await?;
        Ok(status)
    }

    /// Range-read of a confirmed transaction's data; the verifier uses it to
    /// read back the bundle header from the chain.
    pub async fn fetch_data_range(
        &self,
        id: &str,
        start: u64,
        end: u64,
    ) -> Result<Bytes, GatewayError> {
        let url = self.url(id);
        let bytes = self
            .breaker
            .call(async {
                let resp = self
                    .http
                    .get(&url)
                    .header(reqwest::header::RANGE, format!("bytes={start}-{}", end - 1))
                    .send()
                    .await?;
                let status = resp.status();
                if !status.is_success() {
                    return Err(GatewayError::Status(status));
                }
                Ok(resp.bytes().await?)
            })
            .await?;
        if bytes.len() as u64 > end - start {
            // The gateway ignored the range; trim to what was asked for.
            return Ok(bytes.slice(0..(end - start) as usize));
        }
        Ok(bytes)
    }
}
