//! Replication configuration.

use std::time::Duration;

use anyhow::{bail, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::models::Side;

/// How a follower derives its order from a leader signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationPolicy {
    /// Follower size = leader size * multiplier
    pub size_multiplier: Decimal,

    /// Take the opposite side of the leader
    pub inverted: bool,
}

impl Default for ReplicationPolicy {
    fn default() -> Self {
        Self {
            size_multiplier: dec!(5),
            inverted: true,
        }
    }
}

impl ReplicationPolicy {
    pub fn follower_side(&self, leader: Side) -> Side {
        if self.inverted {
            leader.inverse()
        } else {
            leader
        }
    }

    /// Leader size times the multiplier. `None` when the product overflows.
    pub fn follower_amount(&self, leader_amount: Decimal) -> Option<Decimal> {
        leader_amount.checked_mul(self.size_multiplier)
    }

    pub fn validate(&self) -> Result<()> {
        if self.size_multiplier <= Decimal::ZERO {
            bail!(
                "size multiplier must be positive, got {}",
                self.size_multiplier
            );
        }
        Ok(())
    }

    /// Leverage label recorded on follower positions (multiplier, at least 1x).
    pub fn leverage(&self) -> u32 {
        self.size_multiplier.round().to_u32().unwrap_or(1).max(1)
    }
}

/// Follower engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub policy: ReplicationPolicy,

    /// Upper bound on a single adapter call before it is treated as failed
    pub execution_timeout: Duration,

    /// Number of execution log entries retained
    pub log_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: ReplicationPolicy::default(),
            execution_timeout: Duration::from_secs(10),
            log_capacity: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_inverts_and_multiplies() {
        let policy = ReplicationPolicy::default();
        assert_eq!(policy.follower_side(Side::Long), Side::Short);
        assert_eq!(policy.follower_side(Side::Short), Side::Long);
        assert_eq!(policy.follower_amount(dec!(0.1)), Some(dec!(0.5)));
        assert_eq!(policy.leverage(), 5);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_non_inverted_policy() {
        let policy = ReplicationPolicy {
            size_multiplier: dec!(0.4),
            inverted: false,
        };
        assert_eq!(policy.follower_side(Side::Long), Side::Long);
        assert_eq!(policy.follower_amount(dec!(2)), Some(dec!(0.8)));
        assert_eq!(policy.leverage(), 1);
    }

    #[test]
    fn test_non_positive_multiplier_rejected() {
        for multiplier in [dec!(0), dec!(-5)] {
            let policy = ReplicationPolicy {
                size_multiplier: multiplier,
                inverted: true,
            };
            assert!(policy.validate().is_err());
        }
    }

    #[test]
    fn test_oversized_amount_does_not_overflow() {
        let policy = ReplicationPolicy::default();
        assert_eq!(policy.follower_amount(Decimal::MAX), None);
        assert_eq!(policy.follower_amount(dec!(20000000000000000000000000000)), None);
    }
}
