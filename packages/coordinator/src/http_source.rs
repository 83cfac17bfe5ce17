//! HTTP polling adapter
//!
//! Polls a per-chain attestation service:
//!
//! ```text
//! GET {base}/attestations/{operationId}
//! -> {"outcome": "signed" | "failed" | "pending"}
//! ```
//!
//! A 404 means the chain has not seen the operation yet and counts as
//! undecided.

use std::time::Duration;

use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use htlc_core::{Attestation, AttestationSource, ChainId, OperationId};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

/// Per-request HTTP timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum PolledOutcome {
    Signed,
    Failed,
    Pending,
}

#[derive(Debug, Deserialize)]
struct AttestationResponse {
    outcome: PolledOutcome,
}

pub struct HttpAttestationSource {
    chain: ChainId,
    base_url: String,
    client: Client,
}

impl HttpAttestationSource {
    pub fn new(chain: ChainId, base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .wrap_err("Failed to create HTTP client")?;
        Ok(Self {
            chain,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn url_for(&self, operation_id: &OperationId) -> String {
        format!("{}/attestations/{}", self.base_url, operation_id)
    }
}

#[async_trait]
impl AttestationSource for HttpAttestationSource {
    fn chain(&self) -> &ChainId {
        &self.chain
    }

    async fn poll(&self, operation_id: &OperationId) -> Result<Option<Attestation>> {
        let url = self.url_for(operation_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .wrap_err_with(|| format!("Request to {} failed", url))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(chain = %self.chain, operation_id = %operation_id, "Operation not yet seen");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(eyre!("{} returned {}", url, status));
        }

        let body: AttestationResponse = response
            .json()
            .await
            .wrap_err_with(|| format!("Invalid response from {}", url))?;
        Ok(match body.outcome {
            PolledOutcome::Signed => Some(Attestation::Signed),
            PolledOutcome::Failed => Some(Attestation::Failed),
            PolledOutcome::Pending => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_strips_trailing_slash() {
        let source =
            HttpAttestationSource::new(ChainId::new("ton").unwrap(), "http://adapter:8080/").unwrap();
        let url = source.url_for(&OperationId([0xab; 32]));
        assert_eq!(
            url,
            format!("http://adapter:8080/attestations/0x{}", "ab".repeat(32))
        );
    }

    #[test]
    fn test_response_parsing() {
        let signed: AttestationResponse = serde_json::from_str(r#"{"outcome":"signed"}"#).unwrap();
        assert!(matches!(signed.outcome, PolledOutcome::Signed));
        let pending: AttestationResponse =
            serde_json::from_str(r#"{"outcome":"pending"}"#).unwrap();
        assert!(matches!(pending.outcome, PolledOutcome::Pending));
        assert!(serde_json::from_str::<AttestationResponse>(r#"{"outcome":"maybe"}"#).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_adapter_is_an_error() {
        let source =
            HttpAttestationSource::new(ChainId::new("ton").unwrap(), "http://127.0.0.1:1").unwrap();
        assert!(source.poll(&OperationId([1; 32])).await.is_err());
    }
}
