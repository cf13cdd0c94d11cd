//! Simulated perpetuals venue client (Lighter on Arbitrum).
//!
//! Stands in for the real order API behind [`ExecutionAdapter`]:
//! - credential gating (fails fast when no key is set)
//! - order signing with the follower key so references are deterministic per payload
//! - configurable latency and injected venue rejections
//!
//! Credentials live behind a lock and every call works on the snapshot it took
//! at the start, so a hot swap never changes an order already in flight.

use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use alloy_primitives::{keccak256, Address, B256};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use reqwest::Url;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::models::Side;

use super::execution::{
    CancelReceipt, Credentials, ExecutionAdapter, ExecutionError, OrderReceipt, OrderStatus,
};

/// Latency and failure model for the simulated venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    /// Round-trip latency applied to every authenticated call
    pub latency: Duration,

    /// Probability (0.0 to 1.0) that an order is rejected by the venue
    pub failure_rate: f64,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(800),
            failure_rate: 0.0,
        }
    }
}

/// Simulated venue client with hot-swappable credentials.
pub struct SimulatedVenue {
    config: VenueConfig,
    credentials: RwLock<Arc<Credentials>>,
}

impl SimulatedVenue {
    pub fn new(config: VenueConfig, credentials: Credentials) -> Self {
        Self {
            config,
            credentials: RwLock::new(Arc::new(credentials)),
        }
    }

    /// Address derived from the current key, if it parses.
    pub fn address(&self) -> Option<Address> {
        let credentials = self.snapshot();
        if !credentials.is_configured() {
            return None;
        }
        Self::signer(&credentials).ok().map(|s| s.address())
    }

    pub fn rpc_endpoint(&self) -> String {
        self.snapshot().rpc_endpoint.clone()
    }

    fn snapshot(&self) -> Arc<Credentials> {
        self.credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn signer(credentials: &Credentials) -> Result<PrivateKeySigner, ExecutionError> {
        let key = credentials.key.trim();
        let pk = key.strip_prefix("0x").unwrap_or(key);
        PrivateKeySigner::from_str(pk)
            .map_err(|e| ExecutionError::InvalidCredential(format!("private key rejected: {}", e)))
    }

    fn endpoint(credentials: &Credentials) -> Result<Url, ExecutionError> {
        let url = Url::parse(credentials.rpc_endpoint.trim()).map_err(|e| {
            ExecutionError::Network(format!("invalid RPC endpoint '{}': {}", credentials.rpc_endpoint, e))
        })?;

        match url.scheme() {
            "http" | "https" | "ws" | "wss" => Ok(url),
            other => Err(ExecutionError::Network(format!(
                "unsupported RPC scheme '{}'",
                other
            ))),
        }
    }

    async fn round_trip(&self) {
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }
    }

    fn venue_rejects(&self) -> bool {
        let rate = self.config.failure_rate.clamp(0.0, 1.0);
        rate > 0.0 && rand::thread_rng().gen_bool(rate)
    }

    /// Digest of the order payload that gets signed.
    fn order_digest(
        maker: Address,
        side: Side,
        amount: Decimal,
        price: Decimal,
        nonce: u128,
        endpoint: &Url,
    ) -> B256 {
        let payload = format!(
            "{:?}|{}|{}|{}|{}|{}",
            maker,
            side.as_str(),
            amount.normalize(),
            price.normalize(),
            nonce,
            endpoint
        );
        keccak256(payload.as_bytes())
    }
}

#[async_trait]
impl ExecutionAdapter for SimulatedVenue {
    async fn place_order(
        &self,
        side: Side,
        amount: Decimal,
        price: Decimal,
    ) -> Result<OrderReceipt, ExecutionError> {
        info!(side = %side, amount = %amount, price = %price, "Placing order");

        let credentials = self.snapshot();
        if !credentials.is_configured() {
            return Err(ExecutionError::CredentialMissing);
        }
        let signer = Self::signer(&credentials)?;
        let endpoint = Self::endpoint(&credentials)?;

        self.round_trip().await;

        if self.venue_rejects() {
            warn!(side = %side, amount = %amount, "Venue rejected order");
            return Err(ExecutionError::Venue(
                "insufficient liquidity at limit price".to_string(),
            ));
        }

        let nonce = uuid::Uuid::new_v4().as_u128();
        let digest = Self::order_digest(signer.address(), side, amount, price, nonce, &endpoint);
        let signature = signer
            .sign_hash(&digest)
            .await
            .map_err(|e| ExecutionError::InvalidCredential(format!("signing failed: {}", e)))?;

        let reference = format!("0x{}", hex::encode(keccak256(signature.as_bytes())));
        debug!(reference = %reference, endpoint = %endpoint, "Order accepted");

        Ok(OrderReceipt {
            reference,
            status: OrderStatus::Filled,
            timestamp: Utc::now(),
        })
    }

    async fn cancel_all_orders(&self) -> Result<CancelReceipt, ExecutionError> {
        info!("Cancelling all active orders");

        let credentials = self.snapshot();
        if !credentials.is_configured() {
            warn!("Cancel skipped, no credential configured");
            return Ok(CancelReceipt { success: false });
        }
        Self::endpoint(&credentials)?;

        self.round_trip().await;

        Ok(CancelReceipt { success: true })
    }

    fn update_credentials(&self, credentials: Credentials) {
        info!(
            key = %credentials.redacted_key(),
            rpc = %credentials.rpc_endpoint,
            "Venue credentials updated"
        );
        *self
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(credentials);
    }

    fn has_credentials(&self) -> bool {
        self.snapshot().is_configured()
    }
}
