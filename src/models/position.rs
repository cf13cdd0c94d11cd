//! Position model shared by the leader monitor and the follower engine.

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }

    /// The opposite direction.
    pub fn inverse(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// +1 for long, -1 for short.
    pub fn sign(self) -> Decimal {
        match self {
            Side::Long => Decimal::ONE,
            Side::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "long" | "buy" => Ok(Side::Long),
            "short" | "sell" => Ok(Side::Short),
            other => Err(anyhow!("unknown side '{}', expected long or short", other)),
        }
    }
}

/// Lifecycle of a position. `Open -> Closed` happens exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// A single open (or just-closed) position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub side: Side,

    /// Price the position was opened at
    pub entry_price: Decimal,

    /// Size in base units (BTC)
    pub amount: Decimal,

    /// Leverage applied to the percentage return
    pub leverage: u32,

    /// Unrealized P&L in quote units, marked to the latest price
    pub pnl: Decimal,

    /// Leveraged return in percent
    pub pnl_percent: Decimal,

    pub status: PositionStatus,

    /// Venue reference of the order that opened this position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_ref: Option<String>,
}

impl Position {
    /// Open a new position at `entry_price` with zero P&L.
    pub fn open(
        side: Side,
        entry_price: Decimal,
        amount: Decimal,
        leverage: u32,
        execution_ref: Option<String>,
    ) -> Self {
        Self {
            side,
            entry_price,
            amount,
            leverage,
            pnl: Decimal::ZERO,
            pnl_percent: Decimal::ZERO,
            status: PositionStatus::Open,
            execution_ref,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// P&L if the position were marked at `price`, `None` if it overflows.
    pub fn pnl_at(&self, price: Decimal) -> Option<Decimal> {
        price
            .checked_sub(self.entry_price)?
            .checked_mul(self.side.sign())?
            .checked_mul(self.amount)
    }

    /// Leveraged percentage return if the position were marked at `price`.
    pub fn pnl_percent_at(&self, price: Decimal) -> Option<Decimal> {
        if self.entry_price.is_zero() {
            return Some(Decimal::ZERO);
        }
        price
            .checked_sub(self.entry_price)?
            .checked_div(self.entry_price)?
            .checked_mul(self.side.sign())?
            .checked_mul(Decimal::from(self.leverage))?
            .checked_mul(Decimal::ONE_HUNDRED)
    }

    /// Mark-to-market. A closed position is never mutated, and a mark whose
    /// figures do not fit in a `Decimal` leaves the previous mark in place.
    pub fn mark_to_market(&mut self, price: Decimal) {
        if !self.is_open() {
            return;
        }
        if let (Some(pnl), Some(percent)) = (self.pnl_at(price), self.pnl_percent_at(price)) {
            self.pnl = pnl;
            self.pnl_percent = percent;
        }
    }

    /// Mark one last time at `exit_price` and close.
    ///
    /// Consumes the open position; the returned copy carries the realized
    /// figures and is meant to be read and discarded, not archived.
    pub fn close(mut self, exit_price: Decimal) -> Position {
        self.mark_to_market(exit_price);
        self.status = PositionStatus::Closed;
        self
    }

    /// Execution reference shortened for display.
    pub fn short_ref(&self) -> String {
        self.execution_ref
            .as_deref()
            .map(|r| truncate_ref(r, 16))
            .unwrap_or_else(|| "-".to_string())
    }
}

/// Shorten a hash-like reference to `len` characters followed by an ellipsis.
pub fn truncate_ref(reference: &str, len: usize) -> String {
    if reference.chars().count() <= len {
        reference.to_string()
    } else {
        format!("{}...", reference.chars().take(len).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_long_pnl() {
        let mut pos = Position::open(Side::Long, dec!(100), dec!(2), 1, None);
        pos.mark_to_market(dec!(110));

        assert_eq!(pos.pnl, dec!(20));
        assert_eq!(pos.pnl_percent, dec!(10));
    }

    #[test]
    fn test_short_pnl() {
        let mut pos = Position::open(Side::Short, dec!(100), dec!(2), 1, None);
        pos.mark_to_market(dec!(110));

        assert_eq!(pos.pnl, dec!(-20));
        assert_eq!(pos.pnl_percent, dec!(-10));
    }

    #[test]
    fn test_leverage_scales_percent_only() {
        let mut pos = Position::open(Side::Short, dec!(64250.50), dec!(0.5), 5, None);
        pos.mark_to_market(dec!(64300.50));

        assert_eq!(pos.pnl, dec!(-25.00));
        // (50 / 64250.50) * -1 * 5 * 100
        assert_eq!(pos.pnl_percent.round_dp(6), dec!(-0.389102));
    }

    #[test]
    fn test_closed_position_is_frozen() {
        let mut pos = Position::open(Side::Long, dec!(100), dec!(1), 1, None);
        pos.mark_to_market(dec!(105));

        let mut closed = pos.close(dec!(108));
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.pnl, dec!(8));

        closed.mark_to_market(dec!(50));
        assert_eq!(closed.pnl, dec!(8));
    }

    #[test]
    fn test_unrepresentable_mark_keeps_last_figures() {
        let mut pos = Position::open(Side::Long, dec!(100), dec!(20000000000000000000000000000), 1, None);
        pos.mark_to_market(dec!(100));
        assert_eq!(pos.pnl, Decimal::ZERO);

        pos.mark_to_market(dec!(110));
        assert_eq!(pos.pnl, Decimal::ZERO);
        assert_eq!(pos.pnl_at(dec!(110)), None);
        assert!(pos.is_open());
    }

    #[test]
    fn test_side_inverse_and_parse() {
        assert_eq!(Side::Long.inverse(), Side::Short);
        assert_eq!(Side::Short.inverse(), Side::Long);
        assert_eq!("BUY".parse::<Side>().unwrap(), Side::Long);
        assert_eq!("short".parse::<Side>().unwrap(), Side::Short);
        assert!("flat".parse::<Side>().is_err());
    }

    #[test]
    fn test_truncate_ref() {
        assert_eq!(truncate_ref("0x1234567890abcdef", 12), "0x1234567890...");
        assert_eq!(truncate_ref("0xabc", 12), "0xabc");
    }
}
