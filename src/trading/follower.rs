//! Follower replication engine.
//!
//! Turns leader signals into venue actions on the opposite side. Each engine
//! handles its signals strictly one at a time: while an adapter call is in
//! flight, later signals wait in the subscription queue.
//!
//! ```text
//! IDLE --OPEN--> EXECUTING --ok--> POSITIONED --CLOSE--> CLOSING --> IDLE
//!                    \--err--> IDLE
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::api::{ExecutionAdapter, ExecutionError};
use crate::bus::Subscription;
use crate::models::{truncate_ref, Position, SignalKind, TradeSignal};

use super::execution_log::{ExecutionLog, LogEntry, Severity};
use super::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FollowerState {
    Idle,
    Executing,
    Positioned,
    Closing,
}

/// What handling a single signal did.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    Opened(Position),
    OpenFailed(ExecutionError),
    Closed {
        realized_pnl: Decimal,
        cancel_confirmed: bool,
    },
    Rejected(String),
    Ignored(String),
}

/// Observable follower state, republished on every transition and tick.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowerSnapshot {
    pub name: String,
    pub state: FollowerState,
    pub position: Option<Position>,
    pub cumulative_pnl: Decimal,
    pub price: Decimal,
    pub logs: Vec<LogEntry>,
    pub credential_configured: bool,
}

pub struct FollowerEngine {
    name: String,
    config: EngineConfig,
    adapter: Arc<dyn ExecutionAdapter>,
    state: FollowerState,
    position: Option<Position>,
    cumulative_pnl: Decimal,
    last_price: Decimal,
    log: ExecutionLog,
    snapshots: watch::Sender<FollowerSnapshot>,
}

impl FollowerEngine {
    pub fn new(name: impl Into<String>, config: EngineConfig, adapter: Arc<dyn ExecutionAdapter>) -> Self {
        let name = name.into();
        let log = ExecutionLog::new(config.log_capacity);
        let (snapshots, _) = watch::channel(FollowerSnapshot {
            name: name.clone(),
            state: FollowerState::Idle,
            position: None,
            cumulative_pnl: Decimal::ZERO,
            price: Decimal::ZERO,
            logs: Vec::new(),
            credential_configured: adapter.has_credentials(),
        });

        Self {
            name,
            config,
            adapter,
            state: FollowerState::Idle,
            position: None,
            cumulative_pnl: Decimal::ZERO,
            last_price: Decimal::ZERO,
            log,
            snapshots,
        }
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<FollowerSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> FollowerSnapshot {
        FollowerSnapshot {
            name: self.name.clone(),
            state: self.state,
            position: self.position.clone(),
            cumulative_pnl: self.cumulative_pnl,
            price: self.last_price,
            logs: self.log.entries(),
            credential_configured: self.adapter.has_credentials(),
        }
    }

    /// Re-mark the held position. No transition, no adapter call.
    pub fn on_price(&mut self, price: Decimal) {
        self.last_price = price;
        if let Some(position) = self.position.as_mut() {
            position.mark_to_market(price);
        }
        self.publish();
    }

    /// Apply one signal. Returns once the resulting transition has settled.
    pub async fn handle_signal(&mut self, signal: &TradeSignal) -> SignalOutcome {
        debug!(
            follower = %self.name,
            signal = %signal.id,
            kind = ?signal.kind,
            state = ?self.state,
            "Handling signal"
        );

        match signal.kind {
            SignalKind::Open => self.handle_open(signal).await,
            SignalKind::Close => self.handle_close(signal).await,
        }
    }

    async fn handle_open(&mut self, signal: &TradeSignal) -> SignalOutcome {
        let leader_side = match signal.side {
            Some(side) if signal.original_amount > Decimal::ZERO => side,
            _ => {
                let reason = format!(
                    "malformed OPEN signal (side {}, amount {})",
                    signal.side_label(),
                    signal.original_amount
                );
                warn!(follower = %self.name, signal = %signal.id, "Rejected {}", reason);
                self.record(format!("REJECTED: {}", reason), Severity::Error);
                return SignalOutcome::Rejected(reason);
            }
        };

        if self.state != FollowerState::Idle {
            let reason = format!("already {:?}, one follower position at a time", self.state);
            warn!(follower = %self.name, signal = %signal.id, state = ?self.state, "OPEN rejected");
            self.record(
                format!(
                    "SIGNAL: Leader {} {} ignored. Follower already positioned.",
                    leader_side,
                    signal.original_amount.normalize()
                ),
                Severity::Info,
            );
            return SignalOutcome::Rejected(reason);
        }

        let policy = self.config.policy.clone();
        let side = policy.follower_side(leader_side);
        let amount = match policy.follower_amount(signal.original_amount) {
            Some(amount) if amount > Decimal::ZERO => amount,
            derived => {
                let reason = match derived {
                    Some(amount) => format!("follower size {} is not positive", amount),
                    None => format!(
                        "follower size {} x {} is out of range",
                        signal.original_amount, policy.size_multiplier
                    ),
                };
                warn!(follower = %self.name, signal = %signal.id, "Rejected {}", reason);
                self.record(format!("REJECTED: {}", reason), Severity::Error);
                return SignalOutcome::Rejected(reason);
            }
        };
        let leverage = policy.leverage();
        let mode = if policy.inverted { "Reverse" } else { "Copy" };

        self.record(
            format!(
                "SIGNAL: Leader {} {}. Initiating {}X {}...",
                leader_side,
                signal.original_amount.normalize(),
                policy.size_multiplier.normalize(),
                mode
            ),
            Severity::Info,
        );
        self.transition(FollowerState::Executing);

        info!(
            follower = %self.name,
            leader_side = %leader_side,
            side = %side,
            amount = %amount,
            price = %signal.price,
            "Placing follower order"
        );

        let adapter = Arc::clone(&self.adapter);
        let result = bounded(
            self.config.execution_timeout,
            adapter.place_order(side, amount, signal.price),
        )
        .await;

        match result {
            Ok(receipt) => {
                let position = Position::open(
                    side,
                    signal.price,
                    amount,
                    leverage,
                    Some(receipt.reference.clone()),
                );
                self.record(
                    format!(
                        "SUCCESS: {} {} placed. Ref: {}",
                        side,
                        amount.normalize(),
                        truncate_ref(&receipt.reference, 14)
                    ),
                    Severity::Success,
                );
                info!(
                    follower = %self.name,
                    reference = %receipt.reference,
                    "Follower position opened"
                );
                self.position = Some(position.clone());
                self.transition(FollowerState::Positioned);
                SignalOutcome::Opened(position)
            }
            Err(e) => {
                if e.is_credential() {
                    warn!(
                        follower = %self.name,
                        error = %e,
                        "Follower order refused, configure a key with 'key <secret>'"
                    );
                } else {
                    error!(follower = %self.name, error = %e, "Follower order failed");
                }
                self.record(format!("API ERROR: {}", e), Severity::Error);
                self.transition(FollowerState::Idle);
                SignalOutcome::OpenFailed(e)
            }
        }
    }

    async fn handle_close(&mut self, signal: &TradeSignal) -> SignalOutcome {
        if self.state != FollowerState::Positioned || self.position.is_none() {
            self.record(
                "SIGNAL: Leader Closed. No follower position to close.",
                Severity::Info,
            );
            debug!(follower = %self.name, signal = %signal.id, "CLOSE ignored, follower flat");
            return SignalOutcome::Ignored("no open follower position".to_string());
        }

        self.record("SIGNAL: Leader Closed. Closing follower...", Severity::Info);
        self.transition(FollowerState::Closing);

        let adapter = Arc::clone(&self.adapter);
        let cancel = bounded(self.config.execution_timeout, adapter.cancel_all_orders()).await;

        let exit_price = if self.last_price > Decimal::ZERO {
            self.last_price
        } else {
            signal.price
        };

        // The position is cleared locally whatever the venue answered.
        let realized_pnl = match self.position.take() {
            Some(position) => position.close(exit_price).pnl,
            None => Decimal::ZERO,
        };
        self.cumulative_pnl = self.cumulative_pnl.saturating_add(realized_pnl);

        let cancel_confirmed = match cancel {
            Ok(receipt) if receipt.success => {
                self.record(
                    format!("SUCCESS: All positions closed. Final PnL: ${:.2}", realized_pnl),
                    Severity::Success,
                );
                true
            }
            Ok(_) => {
                self.record(
                    format!(
                        "API ERROR: Cancel not confirmed (no credential). Position cleared locally. PnL: ${:.2}",
                        realized_pnl
                    ),
                    Severity::Error,
                );
                false
            }
            Err(e) => {
                error!(follower = %self.name, error = %e, "Cancel failed");
                self.record(
                    format!(
                        "API ERROR: {}. Position cleared locally. PnL: ${:.2}",
                        e, realized_pnl
                    ),
                    Severity::Error,
                );
                false
            }
        };

        info!(
            follower = %self.name,
            realized = %realized_pnl,
            cumulative = %self.cumulative_pnl,
            confirmed = cancel_confirmed,
            "Follower position closed"
        );
        self.transition(FollowerState::Idle);

        SignalOutcome::Closed {
            realized_pnl,
            cancel_confirmed,
        }
    }

    /// Consume signals and price ticks until shutdown or the subscription ends.
    pub async fn run(
        mut self,
        mut signals: Subscription,
        mut prices: watch::Receiver<Decimal>,
        mut shutdown: watch::Receiver<bool>,
    ) -> FollowerSnapshot {
        let price = *prices.borrow_and_update();
        self.on_price(price);
        let mut feed_alive = true;

        info!(follower = %self.name, channel = %signals.channel(), "Follower engine started");

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
                        Err(_) => feed_alive = false,
                    }
                }

                signal = signals.recv() => {
                    let Some(signal) = signal else { break };
                    let outcome = self.handle_signal(&signal).await;
                    debug!(follower = %self.name, outcome = ?outcome, "Signal settled");
                }
            }
        }

        signals.unsubscribe();
        info!(
            follower = %self.name,
            cumulative = %self.cumulative_pnl,
            "Follower engine stopped"
        );
        self.snapshot()
    }

    fn record(&mut self, text: impl AsRef<str>, severity: Severity) {
        self.log.push(text, severity);
        self.publish();
    }

    fn transition(&mut self, next: FollowerState) {
        debug!(follower = %self.name, from = ?self.state, to = ?next, "State transition");
        self.state = next;
        self.publish();
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }
}

/// Run an adapter call with an upper bound on its duration.
async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, ExecutionError>>,
) -> Result<T, ExecutionError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ExecutionError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fixtures::TEST_KEY;
    use crate::api::{Credentials, SimulatedVenue, VenueConfig, DEFAULT_RPC_ENDPOINT};
    use crate::bus::SignalBus;
    use crate::models::{PositionStatus, Side};
    use crate::trading::{LeaderStateMachine, ReplicationPolicy};
    use rust_decimal_macros::dec;

    const CHANNEL: &str = "test_bridge";

    fn venue(latency_ms: u64, key: &str) -> Arc<SimulatedVenue> {
        Arc::new(SimulatedVenue::new(
            VenueConfig {
                latency: Duration::from_millis(latency_ms),
                failure_rate: 0.0,
            },
            Credentials::new(key, DEFAULT_RPC_ENDPOINT),
        ))
    }

    fn engine(adapter: Arc<SimulatedVenue>) -> FollowerEngine {
        FollowerEngine::new("follower-1", EngineConfig::default(), adapter)
    }

    #[tokio::test]
    async fn test_open_inverts_and_multiplies() {
        let mut follower = engine(venue(0, TEST_KEY));
        follower.on_price(dec!(64250.50));

        let signal = TradeSignal::open(Side::Long, dec!(0.1), dec!(64250.50), None);
        let outcome = follower.handle_signal(&signal).await;

        let position = match outcome {
            SignalOutcome::Opened(position) => position,
            other => panic!("expected an open, got {:?}", other),
        };
        assert_eq!(position.side, Side::Short);
        assert_eq!(position.amount, dec!(0.5));
        assert_eq!(position.entry_price, dec!(64250.50));
        assert_eq!(position.leverage, 5);
        assert_eq!(position.status, PositionStatus::Open);
        assert_eq!(follower.snapshot().state, FollowerState::Positioned);

        let entries = follower.snapshot().logs;
        assert!(entries[1].message.ends_with("SIGNAL: Leader LONG 0.1. Initiating 5X Reverse..."));
        assert!(entries[0].message.contains("SUCCESS: SHORT 0.5 placed. Ref: 0x"));
        assert_eq!(entries[0].severity, Severity::Success);
    }

    #[tokio::test]
    async fn test_missing_credential_leaves_follower_flat() {
        let mut follower = engine(venue(0, ""));
        assert!(!follower.snapshot().credential_configured);

        let signal = TradeSignal::open(Side::Short, dec!(1), dec!(100), None);
        let outcome = follower.handle_signal(&signal).await;

        assert_eq!(outcome, SignalOutcome::OpenFailed(ExecutionError::CredentialMissing));
        assert_eq!(follower.snapshot().state, FollowerState::Idle);
        assert!(follower.snapshot().position.is_none());

        let latest = follower.snapshot().logs[0].clone();
        assert_eq!(latest.severity, Severity::Error);
        assert!(latest
            .message
            .ends_with("API ERROR: API key / private key missing. Execution halted."));
    }

    #[tokio::test]
    async fn test_close_realizes_even_without_confirmation() {
        let adapter = venue(0, TEST_KEY);
        let mut follower = engine(Arc::clone(&adapter));
        follower.on_price(dec!(64250.50));

        let open = TradeSignal::open(Side::Long, dec!(0.1), dec!(64250.50), None);
        assert!(matches!(follower.handle_signal(&open).await, SignalOutcome::Opened(_)));

        follower.on_price(dec!(64300.50));
        assert_eq!(follower.snapshot().position.unwrap().pnl, dec!(-25.00));

        adapter.update_credentials(Credentials::default());
        let outcome = follower.handle_signal(&TradeSignal::close(dec!(64300.50))).await;

        assert_eq!(
            outcome,
            SignalOutcome::Closed {
                realized_pnl: dec!(-25.00),
                cancel_confirmed: false,
            }
        );
        assert_eq!(follower.snapshot().cumulative_pnl, dec!(-25.00));
        assert!(follower.snapshot().position.is_none());
        assert_eq!(follower.snapshot().state, FollowerState::Idle);
        assert_eq!(follower.snapshot().logs[0].severity, Severity::Error);
    }

    #[tokio::test]
    async fn test_close_while_idle_is_ignored() {
        let mut follower = engine(venue(0, TEST_KEY));
        let outcome = follower.handle_signal(&TradeSignal::close(dec!(100))).await;

        assert!(matches!(outcome, SignalOutcome::Ignored(_)));
        assert_eq!(follower.snapshot().cumulative_pnl, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_open_while_positioned_is_rejected() {
        let mut follower = engine(venue(0, TEST_KEY));
        follower.on_price(dec!(100));

        let first = TradeSignal::open(Side::Long, dec!(1), dec!(100), None);
        assert!(matches!(follower.handle_signal(&first).await, SignalOutcome::Opened(_)));
        let held = follower.snapshot().position;

        let second = TradeSignal::open(Side::Short, dec!(2), dec!(101), None);
        assert!(matches!(follower.handle_signal(&second).await, SignalOutcome::Rejected(_)));
        assert_eq!(follower.snapshot().position, held);
        assert_eq!(follower.snapshot().state, FollowerState::Positioned);
    }

    #[tokio::test]
    async fn test_malformed_open_is_rejected() {
        let mut follower = engine(venue(0, TEST_KEY));
        let mut signal = TradeSignal::open(Side::Long, dec!(0), dec!(100), None);
        assert!(matches!(follower.handle_signal(&signal).await, SignalOutcome::Rejected(_)));

        signal.original_amount = dec!(1);
        signal.side = None;
        assert!(matches!(follower.handle_signal(&signal).await, SignalOutcome::Rejected(_)));
        assert_eq!(follower.snapshot().state, FollowerState::Idle);
    }

    #[tokio::test]
    async fn test_slow_venue_times_out() {
        let config = EngineConfig {
            execution_timeout: Duration::from_millis(50),
            ..EngineConfig::default()
        };
        let mut follower = FollowerEngine::new("slow", config, venue(2_000, TEST_KEY));

        let signal = TradeSignal::open(Side::Long, dec!(1), dec!(100), None);
        let outcome = follower.handle_signal(&signal).await;

        assert_eq!(
            outcome,
            SignalOutcome::OpenFailed(ExecutionError::Timeout(Duration::from_millis(50)))
        );
        assert_eq!(follower.snapshot().state, FollowerState::Idle);
    }

    #[tokio::test]
    async fn test_reverse_round_trip_through_bus() {
        let bus = SignalBus::new();
        let follower = engine(venue(20, TEST_KEY));
        let mut snapshots = follower.subscribe_snapshots();
        let subscription = bus.subscribe(CHANNEL);

        let (price_tx, price_rx) = watch::channel(dec!(64250.50));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(follower.run(subscription, price_rx, shutdown_rx));

        let mut leader = LeaderStateMachine::new(bus, CHANNEL);
        leader.on_price(dec!(64250.50));
        leader.open_position(Side::Long, dec!(0.1)).unwrap();

        let wait = Duration::from_secs(2);
        tokio::time::timeout(wait, snapshots.wait_for(|s| s.state == FollowerState::Positioned))
            .await
            .unwrap()
            .unwrap();

        price_tx.send(dec!(64300.50)).unwrap();
        leader.on_price(dec!(64300.50));
        tokio::time::timeout(
            wait,
            snapshots.wait_for(|s| s.position.as_ref().map(|p| p.pnl) == Some(dec!(-25.00))),
        )
        .await
        .unwrap()
        .unwrap();

        leader.close_position().unwrap();
        tokio::time::timeout(
            wait,
            snapshots.wait_for(|s| s.state == FollowerState::Idle && s.position.is_none()),
        )
        .await
        .unwrap()
        .unwrap();

        shutdown_tx.send(true).unwrap();
        let last = task.await.unwrap();

        assert_eq!(last.cumulative_pnl, dec!(-25.00));
        assert_eq!(leader.snapshot().cumulative_pnl, dec!(5.00));
        assert!(last.logs[0]
            .message
            .ends_with("SUCCESS: All positions closed. Final PnL: $-25.00"));
    }

    #[tokio::test]
    async fn test_at_most_one_position_under_signal_burst() {
        let bus = SignalBus::new();
        let follower = engine(venue(10, TEST_KEY));
        let mut snapshots = follower.subscribe_snapshots();
        let subscription = bus.subscribe(CHANNEL);

        let (_price_tx, price_rx) = watch::channel(dec!(100));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(follower.run(subscription, price_rx, shutdown_rx));

        for _ in 0..3 {
            bus.publish(CHANNEL, TradeSignal::open(Side::Long, dec!(1), dec!(100), None));
        }

        tokio::time::timeout(
            Duration::from_secs(2),
            snapshots.wait_for(|s| s.logs.iter().filter(|e| e.message.contains("ignored")).count() == 2),
        )
        .await
        .unwrap()
        .unwrap();

        shutdown_tx.send(true).unwrap();
        let last = task.await.unwrap();
        assert_eq!(last.state, FollowerState::Positioned);
        assert_eq!(last.position.unwrap().amount, dec!(5));
    }

    #[tokio::test]
    async fn test_non_positive_follower_size_is_rejected() {
        let config = EngineConfig {
            policy: ReplicationPolicy {
                size_multiplier: dec!(-5),
                inverted: true,
            },
            ..EngineConfig::default()
        };
        let mut follower = FollowerEngine::new("negative", config, venue(0, TEST_KEY));

        let signal = TradeSignal::open(Side::Long, dec!(1), dec!(100), None);
        let outcome = follower.handle_signal(&signal).await;

        assert!(matches!(outcome, SignalOutcome::Rejected(_)));
        let snapshot = follower.snapshot();
        assert_eq!(snapshot.state, FollowerState::Idle);
        assert!(snapshot.position.is_none());
        assert_eq!(snapshot.logs[0].severity, Severity::Error);
    }

    #[tokio::test]
    async fn test_oversized_open_is_rejected_without_panicking() {
        let mut follower = engine(venue(0, TEST_KEY));
        follower.on_price(dec!(100));

        let signal = TradeSignal::open(Side::Long, dec!(20000000000000000000000000000), dec!(100), None);
        let outcome = follower.handle_signal(&signal).await;

        assert!(matches!(outcome, SignalOutcome::Rejected(_)));
        let snapshot = follower.snapshot();
        assert_eq!(snapshot.state, FollowerState::Idle);
        assert!(snapshot.logs[0].message.contains("out of range"));

        let normal = TradeSignal::open(Side::Long, dec!(0.1), dec!(100), None);
        assert!(matches!(follower.handle_signal(&normal).await, SignalOutcome::Opened(_)));
    }

    #[tokio::test]
    async fn test_signals_handled_while_prices_stream() {
        let bus = SignalBus::new();
        let follower = engine(venue(0, TEST_KEY));
        let mut snapshots = follower.subscribe_snapshots();
        let subscription = bus.subscribe(CHANNEL);

        let (price_tx, price_rx) = watch::channel(dec!(100));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(follower.run(subscription, price_rx, shutdown_rx));

        let ticker = tokio::spawn(async move {
            let mut price = dec!(100);
            while price_tx.send(price).is_ok() {
                price += dec!(0.01);
                tokio::task::yield_now().await;
            }
        });

        bus.publish(CHANNEL, TradeSignal::open(Side::Long, dec!(1), dec!(100), None));
        tokio::time::timeout(
            Duration::from_secs(2),
            snapshots.wait_for(|s| s.state == FollowerState::Positioned),
        )
        .await
        .unwrap()
        .unwrap();

        shutdown_tx.send(true).unwrap();
        let last = task.await.unwrap();
        ticker.await.unwrap();
        assert_eq!(last.position.unwrap().side, Side::Short);
    }
}
