//! Leader monitor: the leader's own position and the signals it emits.
//!
//! The leader never talks to a venue. Opening or closing publishes a
//! [`TradeSignal`] on the bus, and price ticks only re-mark the open position.

use std::time::Duration;

use alloy_primitives::keccak256;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::SignalBus;
use crate::models::{Position, Side, TradeSignal};

/// Connection status of the leader monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    Scanning,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeaderError {
    #[error("leader already holds a position")]
    AlreadyPositioned,

    #[error("leader has no open position")]
    NotPositioned,

    #[error("amount must be positive, got {0}")]
    InvalidAmount(Decimal),

    #[error("no market price available yet")]
    NoPrice,

    #[error("leader monitor stopped")]
    Stopped,
}

/// Requests accepted by a running leader task.
#[derive(Debug)]
pub enum LeaderCommand {
    Open {
        side: Side,
        amount: Decimal,
        reply: oneshot::Sender<Result<TradeSignal, LeaderError>>,
    },
    Close {
        reply: oneshot::Sender<Result<Decimal, LeaderError>>,
    },
    SetWatchAddress(String),
}

/// Observable leader state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderSnapshot {
    pub position: Option<Position>,
    pub cumulative_pnl: Decimal,
    pub price: Decimal,
    pub status: MonitorStatus,
    pub watch_address: Option<String>,
}

pub struct LeaderStateMachine {
    bus: SignalBus,
    channel: String,
    position: Option<Position>,
    cumulative_pnl: Decimal,
    last_price: Decimal,
    status: MonitorStatus,
    watch_address: Option<String>,
    reconnect_delay: Duration,
    snapshots: watch::Sender<LeaderSnapshot>,
}

impl LeaderStateMachine {
    pub fn new(bus: SignalBus, channel: impl Into<String>) -> Self {
        let (snapshots, _) = watch::channel(LeaderSnapshot {
            position: None,
            cumulative_pnl: Decimal::ZERO,
            price: Decimal::ZERO,
            status: MonitorStatus::Scanning,
            watch_address: None,
        });

        Self {
            bus,
            channel: channel.into(),
            position: None,
            cumulative_pnl: Decimal::ZERO,
            last_price: Decimal::ZERO,
            status: MonitorStatus::Scanning,
            watch_address: None,
            reconnect_delay: Duration::from_millis(1500),
            snapshots,
        }
    }

    pub fn with_watch_address(mut self, address: Option<String>) -> Self {
        self.watch_address = address.filter(|a| !a.trim().is_empty());
        self.publish();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<LeaderSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> LeaderSnapshot {
        LeaderSnapshot {
            position: self.position.clone(),
            cumulative_pnl: self.cumulative_pnl,
            price: self.last_price,
            status: self.status,
            watch_address: self.watch_address.clone(),
        }
    }

    /// Re-mark the open position. No transition.
    pub fn on_price(&mut self, price: Decimal) {
        self.last_price = price;
        if let Some(position) = self.position.as_mut() {
            position.mark_to_market(price);
        }
        self.publish();
    }

    /// Open at the current price and announce it on the bus.
    pub fn open_position(&mut self, side: Side, amount: Decimal) -> Result<TradeSignal, LeaderError> {
        if self.position.is_some() {
            return Err(LeaderError::AlreadyPositioned);
        }
        if amount <= Decimal::ZERO {
            return Err(LeaderError::InvalidAmount(amount));
        }
        if self.last_price <= Decimal::ZERO {
            return Err(LeaderError::NoPrice);
        }

        let tx_hash = observed_tx_hash();
        self.position = Some(Position::open(
            side,
            self.last_price,
            amount,
            1,
            Some(tx_hash.clone()),
        ));

        let signal = TradeSignal::open(side, amount, self.last_price, Some(tx_hash));
        let delivered = self.bus.publish(&self.channel, signal.clone());

        info!(
            side = %side,
            amount = %amount,
            price = %self.last_price,
            delivered = delivered,
            "Leader opened position"
        );
        self.publish();

        Ok(signal)
    }

    /// Realize the open position into the cumulative PnL and announce the close.
    pub fn close_position(&mut self) -> Result<Decimal, LeaderError> {
        let position = self.position.take().ok_or(LeaderError::NotPositioned)?;
        let realized = position.pnl;
        self.cumulative_pnl = self.cumulative_pnl.saturating_add(realized);

        let delivered = self
            .bus
            .publish(&self.channel, TradeSignal::close(self.last_price));

        info!(
            realized = %realized,
            cumulative = %self.cumulative_pnl,
            delivered = delivered,
            "Leader closed position"
        );
        self.publish();

        Ok(realized)
    }

    /// Point the monitor at another leader account. Position and PnL are kept.
    pub fn set_watch_address(&mut self, address: String) {
        info!(address = %address, "Leader watch address changed, reconnecting");
        self.watch_address = Some(address).filter(|a| !a.trim().is_empty());
        self.status = MonitorStatus::Reconnecting;
        self.publish();
    }

    pub fn finish_reconnect(&mut self) {
        if self.status == MonitorStatus::Reconnecting {
            debug!("Leader monitor scanning");
            self.status = MonitorStatus::Scanning;
            self.publish();
        }
    }

    /// Drive the leader from commands and price ticks until shutdown.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<LeaderCommand>,
        mut prices: watch::Receiver<Decimal>,
        mut shutdown: watch::Receiver<bool>,
    ) -> LeaderSnapshot {
        let price = *prices.borrow_and_update();
        self.on_price(price);

        let reconnect = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(reconnect);
        let mut feed_alive = true;

        info!(channel = %self.channel, "Leader monitor started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                changed = prices.changed(), if feed_alive => {
                    match changed {
                        Ok(()) => {
                            let price = *prices.borrow_and_update();
                            self.on_price(price);
                        }
                        Err(_) => {
                            warn!("Price feed closed");
                            feed_alive = false;
                        }
                    }
                }

                command = commands.recv() => {
                    let Some(command) = command else { break };
                    match command {
                        LeaderCommand::Open { side, amount, reply } => {
                            let result = self.open_position(side, amount);
                            if let Err(e) = &result {
                                warn!(error = %e, "Leader open rejected");
                            }
                            let _ = reply.send(result);
                        }
                        LeaderCommand::Close { reply } => {
                            let result = self.close_position();
                            if let Err(e) = &result {
                                warn!(error = %e, "Leader close rejected");
                            }
                            let _ = reply.send(result);
                        }
                        LeaderCommand::SetWatchAddress(address) => {
                            self.set_watch_address(address);
                            reconnect.as_mut().reset(Instant::now() + self.reconnect_delay);
                        }
                    }
                }

                _ = &mut reconnect, if self.status == MonitorStatus::Reconnecting => {
                    self.finish_reconnect();
                }
            }
        }

        info!(cumulative = %self.cumulative_pnl, "Leader monitor stopped");
        self.snapshot()
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }
}

/// Execution reference attributed to the observed leader trade.
fn observed_tx_hash() -> String {
    format!("0x{}", hex::encode(keccak256(Uuid::new_v4().as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SignalKind;
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    const CHANNEL: &str = "test_bridge";

    #[test]
    fn test_open_emits_signal_at_current_price() {
        let bus = SignalBus::new();
        let mut sub = bus.subscribe(CHANNEL);
        let mut leader = LeaderStateMachine::new(bus, CHANNEL);
        leader.on_price(dec!(64250.50));

        let signal = assert_ok!(leader.open_position(Side::Long, dec!(0.1)));
        assert_eq!(signal.kind, SignalKind::Open);
        assert_eq!(signal.side, Some(Side::Long));
        assert_eq!(signal.price, dec!(64250.50));
        assert_eq!(signal.original_amount, dec!(0.1));

        let received = sub.try_recv().unwrap();
        assert_eq!(received.id, signal.id);

        let position = leader.snapshot().position.unwrap();
        assert_eq!(position.leverage, 1);
        assert_eq!(position.entry_price, dec!(64250.50));
        assert!(position.execution_ref.as_deref().unwrap().starts_with("0x"));
    }

    #[test]
    fn test_invalid_transitions_are_errors() {
        let mut leader = LeaderStateMachine::new(SignalBus::new(), CHANNEL);

        assert_eq!(leader.open_position(Side::Long, dec!(1)), Err(LeaderError::NoPrice));
        leader.on_price(dec!(100));
        assert_eq!(
            leader.open_position(Side::Long, dec!(0)),
            Err(LeaderError::InvalidAmount(dec!(0)))
        );
        assert_eq!(leader.close_position(), Err(LeaderError::NotPositioned));

        assert_ok!(leader.open_position(Side::Short, dec!(1)));
        let err = assert_err!(leader.open_position(Side::Short, dec!(1)));
        assert_eq!(err, LeaderError::AlreadyPositioned);
    }

    #[test]
    fn test_close_realizes_pnl_and_emits_close() {
        let bus = SignalBus::new();
        let mut sub = bus.subscribe(CHANNEL);
        let mut leader = LeaderStateMachine::new(bus, CHANNEL);

        leader.on_price(dec!(64250.50));
        assert_ok!(leader.open_position(Side::Long, dec!(0.1)));
        leader.on_price(dec!(64300.50));
        assert_eq!(leader.snapshot().position.unwrap().pnl, dec!(5.00));

        let realized = assert_ok!(leader.close_position());
        assert_eq!(realized, dec!(5.00));
        assert_eq!(leader.snapshot().cumulative_pnl, dec!(5.00));
        assert!(leader.snapshot().position.is_none());

        let _open = sub.try_recv().unwrap();
        let close = sub.try_recv().unwrap();
        assert_eq!(close.kind, SignalKind::Close);
        assert_eq!(close.side, None);
        assert_eq!(close.original_amount, Decimal::ZERO);
    }

    #[test]
    fn test_huge_position_marks_without_panicking() {
        let mut leader = LeaderStateMachine::new(SignalBus::new(), CHANNEL);
        leader.on_price(dec!(100));
        assert_ok!(leader.open_position(Side::Long, dec!(20000000000000000000000000000)));

        leader.on_price(dec!(150));
        assert_eq!(leader.snapshot().price, dec!(150));
        assert_eq!(leader.snapshot().position.unwrap().pnl, Decimal::ZERO);
        assert_ok!(leader.close_position());
    }

    #[test]
    fn test_watch_address_change_keeps_state() {
        let mut leader = LeaderStateMachine::new(SignalBus::new(), CHANNEL);
        leader.on_price(dec!(100));
        assert_ok!(leader.open_position(Side::Long, dec!(1)));

        leader.set_watch_address("0xabc".to_string());
        assert_eq!(leader.snapshot().status, MonitorStatus::Reconnecting);
        assert!(leader.snapshot().position.is_some());

        leader.finish_reconnect();
        assert_eq!(leader.snapshot().status, MonitorStatus::Scanning);
        assert_eq!(leader.snapshot().watch_address.as_deref(), Some("0xabc"));
    }

    #[tokio::test]
    async fn test_run_loop_commands_and_reconnect() {
        let bus = SignalBus::new();
        let mut sub = bus.subscribe(CHANNEL);
        let leader = LeaderStateMachine::new(bus, CHANNEL)
            .with_reconnect_delay(Duration::from_millis(20));
        let mut snapshots = leader.subscribe_snapshots();

        let (price_tx, price_rx) = watch::channel(dec!(200));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(leader.run(cmd_rx, price_rx, shutdown_rx));

        let (reply, rx) = oneshot::channel();
        cmd_tx
            .send(LeaderCommand::Open { side: Side::Short, amount: dec!(2), reply })
            .unwrap();
        let signal = assert_ok!(rx.await.unwrap());
        assert_eq!(signal.price, dec!(200));
        assert!(sub.recv().await.is_some());

        price_tx.send(dec!(190)).unwrap();
        tokio::time::timeout(
            Duration::from_secs(1),
            snapshots.wait_for(|s| s.position.as_ref().map(|p| p.pnl) == Some(dec!(20))),
        )
        .await
        .unwrap()
        .unwrap();

        cmd_tx.send(LeaderCommand::SetWatchAddress("0xdef".into())).unwrap();
        tokio::time::timeout(
            Duration::from_secs(1),
            snapshots.wait_for(|s| s.status == MonitorStatus::Reconnecting),
        )
        .await
        .unwrap()
        .unwrap();
        tokio::time::timeout(
            Duration::from_secs(1),
            snapshots.wait_for(|s| s.status == MonitorStatus::Scanning),
        )
        .await
        .unwrap()
        .unwrap();

        let (reply, rx) = oneshot::channel();
        cmd_tx.send(LeaderCommand::Close { reply }).unwrap();
        assert_eq!(rx.await.unwrap(), Ok(dec!(20)));

        shutdown_tx.send(true).unwrap();
        let last = task.await.unwrap();
        assert_eq!(last.cumulative_pnl, dec!(20));
        assert!(last.position.is_none());
    }
}
