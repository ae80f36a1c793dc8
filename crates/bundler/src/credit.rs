//! Client for the external Credit Service. The core never computes prices
//! or balances itself; it only reserves, refunds, and finalizes.

use arweave::{BreakerError, CircuitBreaker};
use models::{DataItemId, SignatureType, Winston};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CreditError {
    #[error("insufficient credit")]
    Insufficient,
    #[error("credit service unavailable: {0}")]
    Upstream(String),
}

#[derive(Debug, serde::Serialize)]
pub struct ReserveRequest<'r> {
    pub owner: &'r str,
    pub byte_count: u64,
    pub data_item_id: DataItemId,
    pub signature_type: SignatureType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_by: Option<&'r str>,
}

#[async_trait::async_trait]
pub trait CreditService: Send + Sync + 'static {
    /// Reserve credit for an upload, returning the winston cost held.
    async fn reserve(&self, req: ReserveRequest<'_>) -> Result<Winston, CreditError>;

    /// Release a reservation after a failed admission.
    async fn refund(&self, id: DataItemId) -> Result<(), CreditError>;

    /// Settle a reservation against the actual stored size.
    async fn finalize(&self, id: DataItemId, actual_byte_count: u64) -> Result<(), CreditError>;
}

/// No Credit Service configured: every upload is funded at zero cost.
/// Doubles as the test implementation.
#[derive(Debug, Default)]
pub struct FreeCredit;

#[async_trait::async_trait]
impl CreditService for FreeCredit {
    async fn reserve(&self, _req: ReserveRequest<'_>) -> Result<Winston, CreditError> {
        Ok(Winston(0))
    }

    async fn refund(&self, _id: DataItemId) -> Result<(), CreditError> {
        Ok(())
    }

    async fn finalize(&self, _id: DataItemId, _actual: u64) -> Result<(), CreditError> {
        Ok(())
    }
}

/// HTTP Credit Service client, authenticated by a pre-shared secret.
pub struct HttpCreditClient {
    http: reqwest::Client,
    base: String,
    secret: String,
    breaker: CircuitBreaker,
}

#[derive(serde::Deserialize)]
struct ReserveResponse {
    winc: Winston,
}

impl HttpCreditClient {
    pub fn new(http: reqwest::Client, base: url::Url, secret: String) -> Self {
        Self {
            http,
            base: base.as_str().trim_end_matches('/').to_string(),
            secret,
            breaker: CircuitBreaker::new(5, Duration::from_secs(30)),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }
}

#[async_trait::async_trait]
impl CreditService for HttpCreditClient {
    async fn reserve(&self, req: ReserveRequest<'_>) -> Result<Winston, CreditError> {
        let url = self.url("v1/reserve");
        let result = self
            .breaker
            .call(async {
                let resp = self
                    .http
                    .post(&url)
                    .header("x-api-secret", self.secret.as_str())
                    .json(&req)
                    .send()
                    .await
                    .map_err(|err| CreditError::Upstream(err.to_string()))?;
                match resp.status().as_u16() {
                    402 => Err(CreditError::Insufficient),
                    code if (200..300).contains(&code) => {
                        let body: ReserveResponse = resp
                            .json()
                            .await
                            .map_err(|err| CreditError::Upstream(err.to_string()))?;
                        Ok(body.winc)
                    }
                    code => Err(CreditError::Upstream(format!("status {code}"))),
                }
            })
            .await;
        match result {
            Ok(winc) => Ok(winc),
            Err(BreakerError::Open) => {
                Err(CreditError::Upstream("credit circuit is open".to_string()))
            }
            Err(BreakerError::Inner(err)) => Err(err),
        }
    }

    async fn refund(&self, id: DataItemId) -> Result<(), CreditError> {
        let url = self.url("v1/refund");
        let resp = self
            .http
            .post(&url)
            .header("x-api-secret", self.secret.as_str())
            .json(&serde_json::json!({ "data_item_id": id }))
            .send()
            .await
            .map_err(|err| CreditError::Upstream(err.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(CreditError::Upstream(format!("status {}", resp.status())))
        }
    }

    async fn finalize(&self, id: DataItemId, actual_byte_count: u64) -> Result<(), CreditError> {
        let url = self.url("v1/finalize");
        let resp = self
            .http
            .post(&url)
            .header("x-api-secret", self.secret.as_str())
            .json(&serde_json::json!({
                "data_item_id": id,
                "byte_count": actual_byte_count,
            }))
            .send()
            .await
            .map_err(|err| CreditError::Upstream(err.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(CreditError::Upstream(format!("status {}", resp.status())))
        }
    }
}
