//! Data models for positions and trade signals.

mod position;
mod signal;

pub use position::{truncate_ref, Position, PositionStatus, Side};
pub use signal::{SignalKind, TradeSignal};
