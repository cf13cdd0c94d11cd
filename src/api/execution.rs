//! Execution adapter boundary: what the follower engine needs from a venue.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Side;

/// Default Arbitrum One RPC endpoint.
pub const DEFAULT_RPC_ENDPOINT: &str = "https://arb1.arbitrum.io/rpc";

/// Credential/endpoint pair used to sign and route orders.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Follower private key (hex, with or without 0x prefix)
    pub key: String,

    /// RPC endpoint URL
    pub rpc_endpoint: String,
}

impl Credentials {
    pub fn new(key: impl Into<String>, rpc_endpoint: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            rpc_endpoint: rpc_endpoint.into(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.key.trim().is_empty()
    }

    /// Key masked for display.
    pub fn redacted_key(&self) -> String {
        let key = self.key.trim();
        let chars = key.chars().count();
        if key.is_empty() {
            "<not set>".to_string()
        } else if chars > 10 {
            let head: String = key.chars().take(6).collect();
            let tail: String = key.chars().skip(chars - 4).collect();
            format!("{}...{}", head, tail)
        } else {
            "****".to_string()
        }
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::new("", DEFAULT_RPC_ENDPOINT)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("key", &self.redacted_key())
            .field("rpc_endpoint", &self.rpc_endpoint)
            .finish()
    }
}

/// Venue-side state of an accepted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Filled,
}

/// Receipt for a placed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReceipt {
    /// Venue execution reference (transaction hash)
    pub reference: String,
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
}

/// Result of a cancel-all request. `success == false` is an answer, not a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelReceipt {
    pub success: bool,
}

/// Failures an execution adapter can report.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error("API key / private key missing. Execution halted.")]
    CredentialMissing,

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("venue rejected order: {0}")]
    Venue(String),

    #[error("no response from venue after {0:?}")]
    Timeout(Duration),
}

impl ExecutionError {
    /// True when the user has to fix the credential before anything can work.
    pub fn is_credential(&self) -> bool {
        matches!(
            self,
            ExecutionError::CredentialMissing | ExecutionError::InvalidCredential(_)
        )
    }
}

/// Order placement capability against a venue.
///
/// Implementations must be safe to share between tasks. The replication engine
/// issues at most one call at a time per follower.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    /// Place an order. Fails with [`ExecutionError::CredentialMissing`] without
    /// touching the network when no credential is configured.
    async fn place_order(
        &self,
        side: Side,
        amount: Decimal,
        price: Decimal,
    ) -> Result<OrderReceipt, ExecutionError>;

    /// Cancel every open order. Nothing to cancel is a success; missing
    /// credentials yield `success: false`.
    async fn cancel_all_orders(&self) -> Result<CancelReceipt, ExecutionError>;

    /// Replace the credential/endpoint pair. Calls already in flight finish
    /// under the credential they started with.
    fn update_credentials(&self, credentials: Credentials);

    /// Whether a credential is currently configured.
    fn has_credentials(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_redacted() {
        let creds = Credentials::new("0xac0974bec39a17e36ba4a6b4d238ff944bacb478", DEFAULT_RPC_ENDPOINT);
        assert!(creds.is_configured());
        assert_eq!(creds.redacted_key(), "0xac09...b478");
        assert!(!format!("{:?}", creds).contains("bec39a17"));

        let empty = Credentials::default();
        assert!(!empty.is_configured());
        assert_eq!(empty.redacted_key(), "<not set>");
        assert!(!Credentials::new("   ", DEFAULT_RPC_ENDPOINT).is_configured());
    }

    #[test]
    fn test_redaction_counts_characters_not_bytes() {
        let short = Credentials::new("aéééééé", DEFAULT_RPC_ENDPOINT);
        assert_eq!(short.redacted_key(), "****");

        let long = Credentials::new("été-clé-secrète-über", DEFAULT_RPC_ENDPOINT);
        assert_eq!(long.redacted_key(), "été-cl...über");
        assert!(format!("{:?}", long).contains("été-cl...über"));
    }

    #[test]
    fn test_credential_errors_classified() {
        assert!(ExecutionError::CredentialMissing.is_credential());
        assert!(ExecutionError::InvalidCredential("bad".into()).is_credential());
        assert!(!ExecutionError::Network("down".into()).is_credential());
        assert!(!ExecutionError::Timeout(Duration::from_secs(1)).is_credential());
    }
}
