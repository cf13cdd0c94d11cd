//! Session runner: wires the price feed, signal bus, leader monitor, follower
//! engines and the advisory loop, and exposes them to the operator.
//!
//! Handles:
//! - One task per state machine, each fed by its own queue and the price watch
//! - Operator commands on stdin (open/close the leader, credential hot swap)
//! - The scripted reverse round trip used by `revcopier scenario`
//! - Graceful shutdown with every task joined

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{
    AdvisoryClient, Credentials, ExecutionAdapter, SimulatedVenue, VenueConfig, DEFAULT_MODEL,
};
use crate::bus::SignalBus;
use crate::feed::{FeedConfig, PriceFeed};
use crate::models::{Position, Side, TradeSignal};
use crate::trading::{
    EngineConfig, FollowerEngine, FollowerSnapshot, FollowerState, LeaderCommand, LeaderError,
    LeaderSnapshot, LeaderStateMachine, MonitorStatus, Severity,
};

const NO_ADVICE_YET: &str = "Waiting for first strategy update...";

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bus channel shared by the leader and its followers
    pub channel: String,

    /// Number of follower engines
    pub followers: usize,

    pub feed: FeedConfig,
    pub engine: EngineConfig,
    pub venue: VenueConfig,
    pub credentials: Credentials,

    /// Leader account being watched
    pub leader_address: Option<String>,

    pub advisor_key: Option<String>,
    pub advisor_model: String,

    /// Upper bound on retrying one advisory request
    pub advisory_retry_budget: Duration,

    /// Zero disables the periodic advisory task
    pub advisory_interval: Duration,

    /// Time the leader monitor spends reconnecting after a watch-address change
    pub reconnect_delay: Duration,

    /// Prices are only moved through [`Session::set_price`]
    pub manual_prices: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel: "reverse_copy_bridge".to_string(),
            followers: 1,
            feed: FeedConfig::default(),
            engine: EngineConfig::default(),
            venue: VenueConfig::default(),
            credentials: Credentials::default(),
            leader_address: None,
            advisor_key: None,
            advisor_model: DEFAULT_MODEL.to_string(),
            advisory_retry_budget: Duration::from_secs(10),
            advisory_interval: Duration::from_secs(45),
            reconnect_delay: Duration::from_millis(1500),
            manual_prices: false,
        }
    }
}

/// A running reverse-copy session.
pub struct Session {
    config: SessionConfig,
    bus: SignalBus,
    venue: Arc<SimulatedVenue>,
    feed: Arc<PriceFeed>,
    advisor: Arc<AdvisoryClient>,
    credentials: Credentials,

    leader_commands: mpsc::UnboundedSender<LeaderCommand>,
    leader: watch::Receiver<LeaderSnapshot>,
    followers: Vec<watch::Receiver<FollowerSnapshot>>,
    insight: watch::Receiver<String>,

    shutdown: watch::Sender<bool>,
    leader_task: JoinHandle<LeaderSnapshot>,
    follower_tasks: Vec<JoinHandle<FollowerSnapshot>>,
    background: Vec<JoinHandle<()>>,
}

impl Session {
    /// Spawn every task. Followers subscribe before the leader can publish.
    pub fn start(config: SessionConfig) -> Result<Self> {
        config
            .engine
            .policy
            .validate()
            .context("Invalid replication policy")?;

        let bus = SignalBus::new();
        let venue = Arc::new(SimulatedVenue::new(
            config.venue.clone(),
            config.credentials.clone(),
        ));
        let feed = Arc::new(PriceFeed::new(config.feed.clone()));
        let advisor = Arc::new(
            AdvisoryClient::new(config.advisor_key.clone())
                .context("Failed to create advisory client")?
                .with_model(config.advisor_model.clone())
                .with_retry_budget(config.advisory_retry_budget),
        );
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut followers = Vec::with_capacity(config.followers);
        let mut follower_tasks = Vec::with_capacity(config.followers);
        for i in 0..config.followers.max(1) {
            let adapter: Arc<dyn ExecutionAdapter> = venue.clone();
            let engine = FollowerEngine::new(
                format!("follower-{}", i + 1),
                config.engine.clone(),
                adapter,
            );
            followers.push(engine.subscribe_snapshots());

            let subscription = bus.subscribe(&config.channel);
            follower_tasks.push(tokio::spawn(engine.run(
                subscription,
                feed.subscribe(),
                shutdown_rx.clone(),
            )));
        }

        let leader_machine = LeaderStateMachine::new(bus.clone(), config.channel.clone())
            .with_watch_address(config.leader_address.clone())
            .with_reconnect_delay(config.reconnect_delay);
        let leader = leader_machine.subscribe_snapshots();
        let (leader_commands, commands_rx) = mpsc::unbounded_channel();
        let leader_task = tokio::spawn(leader_machine.run(
            commands_rx,
            feed.subscribe(),
            shutdown_rx.clone(),
        ));

        let mut background = Vec::new();
        if !config.manual_prices {
            let feed = Arc::clone(&feed);
            let shutdown = shutdown_rx.clone();
            background.push(tokio::spawn(async move { feed.run(shutdown).await }));
        }

        let (insight_tx, insight) = watch::channel(NO_ADVICE_YET.to_string());
        if !config.advisory_interval.is_zero() {
            background.push(tokio::spawn(advisory_loop(
                Arc::clone(&advisor),
                config.advisory_interval,
                leader.clone(),
                followers.first().cloned(),
                insight_tx,
                shutdown_rx,
            )));
        }

        info!(
            channel = %config.channel,
            followers = followers.len(),
            subscribers = bus.subscriber_count(&config.channel),
            credential = venue.has_credentials(),
            "Session started"
        );

        Ok(Self {
            credentials: config.credentials.clone(),
            config,
            bus,
            venue,
            feed,
            advisor,
            leader_commands,
            leader,
            followers,
            insight,
            shutdown,
            leader_task,
            follower_tasks,
            background,
        })
    }

    /// Open a leader position at the current price.
    pub async fn open(&self, side: Side, amount: Decimal) -> Result<TradeSignal, LeaderError> {
        let (reply, rx) = oneshot::channel();
        self.leader_commands
            .send(LeaderCommand::Open { side, amount, reply })
            .map_err(|_| LeaderError::Stopped)?;
        rx.await.map_err(|_| LeaderError::Stopped)?
    }

    /// Close the leader position. Returns the leader's realized PnL.
    pub async fn close(&self) -> Result<Decimal, LeaderError> {
        let (reply, rx) = oneshot::channel();
        self.leader_commands
            .send(LeaderCommand::Close { reply })
            .map_err(|_| LeaderError::Stopped)?;
        rx.await.map_err(|_| LeaderError::Stopped)?
    }

    pub fn set_watch_address(&self, address: impl Into<String>) -> Result<(), LeaderError> {
        self.leader_commands
            .send(LeaderCommand::SetWatchAddress(address.into()))
            .map_err(|_| LeaderError::Stopped)
    }

    /// Replace the follower key. An empty key disables execution.
    pub fn set_follower_key(&mut self, key: impl Into<String>) {
        self.credentials.key = key.into();
        self.venue.update_credentials(self.credentials.clone());
    }

    pub fn set_rpc_endpoint(&mut self, endpoint: impl Into<String>) {
        self.credentials.rpc_endpoint = endpoint.into();
        self.venue.update_credentials(self.credentials.clone());
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Move the market directly.
    pub fn set_price(&self, price: Decimal) {
        self.feed.set(price);
    }

    pub fn price(&self) -> Decimal {
        self.feed.current()
    }

    pub fn leader(&self) -> LeaderSnapshot {
        self.leader.borrow().clone()
    }

    pub fn followers(&self) -> Vec<FollowerSnapshot> {
        self.followers.iter().map(|rx| rx.borrow().clone()).collect()
    }

    pub fn follower_updates(&self, index: usize) -> Option<watch::Receiver<FollowerSnapshot>> {
        self.followers.get(index).cloned()
    }

    /// Latest periodic advisory text.
    pub fn insight(&self) -> String {
        self.insight.borrow().clone()
    }

    /// Ask the advisory service now.
    pub async fn advice(&self) -> String {
        let (leader_pnl, follower_pnl, price) = standings(&self.leader, self.followers.first());
        self.advisor.advise(leader_pnl, follower_pnl, price).await
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            channel: self.config.channel.clone(),
            price: self.price(),
            leader: self.leader(),
            followers: self.followers(),
            credential_configured: self.venue.has_credentials(),
            follower_address: self.venue.address().map(|a| a.to_checksum(None)),
            rpc_endpoint: self.venue.rpc_endpoint(),
            insight: self.insight(),
        }
    }

    /// Wait until every follower satisfies `done`.
    pub async fn settle_followers<F>(&self, limit: Duration, done: F) -> Result<()>
    where
        F: Fn(&FollowerSnapshot) -> bool,
    {
        for rx in &self.followers {
            let mut rx = rx.clone();
            let settled = tokio::time::timeout(limit, async {
                rx.wait_for(|s| done(s)).await.map(|_| ())
            })
            .await;

            match settled {
                Ok(Ok(())) => {}
                Ok(Err(_)) => bail!("follower stopped before settling"),
                Err(_) => bail!("follower did not settle within {:?}", limit),
            }
        }
        Ok(())
    }

    /// Wait until the leader satisfies `done`.
    pub async fn settle_leader<F>(&self, limit: Duration, done: F) -> Result<()>
    where
        F: Fn(&LeaderSnapshot) -> bool,
    {
        let mut rx = self.leader.clone();
        let settled = tokio::time::timeout(limit, async {
            rx.wait_for(|s| done(s)).await.map(|_| ())
        })
        .await;

        match settled {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => bail!("leader monitor stopped"),
            Err(_) => bail!("leader did not settle within {:?}", limit),
        }
    }

    /// Signal shutdown and join every task.
    pub async fn shutdown(self) -> Result<SessionReport> {
        info!("Shutting down session...");
        self.shutdown.send_replace(true);
        drop(self.leader_commands);

        let leader = self
            .leader_task
            .await
            .context("Leader task failed")?;

        let mut followers = Vec::with_capacity(self.follower_tasks.len());
        for result in join_all(self.follower_tasks).await {
            followers.push(result.context("Follower task failed")?);
        }

        for result in join_all(self.background).await {
            if let Err(e) = result {
                warn!(error = %e, "Background task failed");
            }
        }

        debug!(
            remaining = self.bus.subscriber_count(&self.config.channel),
            "Bus drained"
        );
        info!("Session shutdown complete");

        Ok(SessionReport { leader, followers })
    }
}

/// Cumulative leader and first-follower PnL plus the current price.
fn standings(
    leader: &watch::Receiver<LeaderSnapshot>,
    follower: Option<&watch::Receiver<FollowerSnapshot>>,
) -> (Decimal, Decimal, Decimal) {
    let leader = leader.borrow();
    let follower_pnl = follower
        .map(|rx| rx.borrow().cumulative_pnl)
        .unwrap_or(Decimal::ZERO);
    (leader.cumulative_pnl, follower_pnl, leader.price)
}

async fn advisory_loop(
    advisor: Arc<AdvisoryClient>,
    every: Duration,
    leader: watch::Receiver<LeaderSnapshot>,
    follower: Option<watch::Receiver<FollowerSnapshot>>,
    insight: watch::Sender<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    info!(interval_secs = every.as_secs(), configured = advisor.is_configured(), "Advisory loop started");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let (leader_pnl, follower_pnl, price) = standings(&leader, follower.as_ref());
                tokio::select! {
                    advice = advisor.advise(leader_pnl, follower_pnl, price) => {
                        debug!(chars = advice.len(), "Strategy advice updated");
                        insight.send_replace(advice);
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }
    }
}

/// Point-in-time view of the whole session.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub channel: String,
    pub price: Decimal,
    pub leader: LeaderSnapshot,
    pub followers: Vec<FollowerSnapshot>,
    pub credential_configured: bool,

    /// Account derived from the follower key, when it parses
    pub follower_address: Option<String>,
    pub rpc_endpoint: String,
    pub insight: String,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Session Status ===")?;
        writeln!(f, "Channel:          {}", self.channel)?;
        writeln!(f, "BTC Price:        ${:.2}", self.price)?;

        let monitor = match self.leader.status {
            MonitorStatus::Scanning => "SCANNING",
            MonitorStatus::Reconnecting => "RECONNECTING...",
        };
        writeln!(
            f,
            "\n--- Leader ({}) ---",
            self.leader.watch_address.as_deref().unwrap_or("unassigned")
        )?;
        writeln!(f, "Monitor:          {}", monitor)?;
        writeln!(f, "Position:         {}", describe(self.leader.position.as_ref()))?;
        writeln!(f, "Cumulative P&L:   ${:.2}", self.leader.cumulative_pnl)?;

        for follower in &self.followers {
            writeln!(f, "\n--- {} ---", follower.name)?;
            writeln!(f, "State:            {:?}", follower.state)?;
            writeln!(f, "Position:         {}", describe(follower.position.as_ref()))?;
            writeln!(f, "Cumulative P&L:   ${:.2}", follower.cumulative_pnl)?;
        }

        writeln!(
            f,
            "\nCredential:       {}",
            if self.credential_configured {
                "configured"
            } else {
                "MISSING (execution halted)"
            }
        )?;
        if let Some(address) = &self.follower_address {
            writeln!(f, "Follower Account: {}", address)?;
        }
        writeln!(f, "RPC Endpoint:     {}", self.rpc_endpoint)?;
        writeln!(f, "Strategy Desk:    {}", self.insight)?;
        Ok(())
    }
}

fn describe(position: Option<&Position>) -> String {
    match position {
        None => "flat".to_string(),
        Some(p) => format!(
            "{} {} @ ${:.2} x{} | P&L ${:.2} ({:.2}%) | Ref {}",
            p.side,
            p.amount.normalize(),
            p.entry_price,
            p.leverage,
            p.pnl,
            p.pnl_percent,
            p.short_ref()
        ),
    }
}

/// Final figures returned by [`Session::shutdown`].
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub leader: LeaderSnapshot,
    pub followers: Vec<FollowerSnapshot>,
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Session Report ===")?;
        writeln!(f, "Leader P&L:       ${:.2}", self.leader.cumulative_pnl)?;
        for follower in &self.followers {
            writeln!(
                f,
                "{:<18}${:.2} ({:?})",
                format!("{} P&L:", follower.name),
                follower.cumulative_pnl,
                follower.state
            )?;
        }
        Ok(())
    }
}

/// Operator console commands.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Open(Side, Decimal),
    Close,
    Status,
    Logs,
    Key(String),
    Rpc(String),
    Watch(String),
    Advice,
    Help,
    Quit,
}

const DEFAULT_AMOUNT: Decimal = dec!(0.1);

impl FromStr for ConsoleCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let verb = parts
            .next()
            .ok_or_else(|| anyhow!("empty command"))?
            .to_ascii_lowercase();
        let arg = parts.next();

        let command = match verb.as_str() {
            "long" | "short" | "buy" | "sell" => {
                let side: Side = verb.parse()?;
                let amount = match arg {
                    Some(raw) => Decimal::from_str(raw)
                        .with_context(|| format!("invalid amount '{}'", raw))?,
                    None => DEFAULT_AMOUNT,
                };
                if amount <= Decimal::ZERO {
                    bail!("amount must be positive");
                }
                ConsoleCommand::Open(side, amount)
            }
            "close" => ConsoleCommand::Close,
            "status" | "s" => ConsoleCommand::Status,
            "logs" | "log" => ConsoleCommand::Logs,
            "key" => ConsoleCommand::Key(arg.unwrap_or_default().to_string()),
            "rpc" => ConsoleCommand::Rpc(
                arg.ok_or_else(|| anyhow!("usage: rpc <url>"))?.to_string(),
            ),
            "watch" => ConsoleCommand::Watch(
                arg.ok_or_else(|| anyhow!("usage: watch <address>"))?.to_string(),
            ),
            "advice" | "ai" => ConsoleCommand::Advice,
            "help" | "?" => ConsoleCommand::Help,
            "quit" | "exit" | "q" => ConsoleCommand::Quit,
            other => bail!("unknown command '{}', type 'help'", other),
        };

        Ok(command)
    }
}

const HELP: &str = "\
Commands:
  long [amount]     Leader opens LONG (default 0.1 BTC)
  short [amount]    Leader opens SHORT (default 0.1 BTC)
  close             Leader closes its position
  status            Show leader, followers and credential state
  logs              Show the follower execution logs
  key [secret]      Set the follower private key (no argument clears it)
  rpc <url>         Set the RPC endpoint
  watch <address>   Watch another leader address
  advice            Ask the strategy desk now
  quit              Stop the session";

/// Interactive operator loop on stdin. Returns on `quit`, EOF or Ctrl+C.
pub async fn run_console(mut session: Session) -> Result<SessionReport> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut updates = session.follower_updates(0);
    let mut last_seen: Option<String> = None;

    println!("{}\n", HELP);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }

            changed = async {
                match updates.as_mut() {
                    Some(rx) => rx.changed().await,
                    None => std::future::pending().await,
                }
            } => {
                if changed.is_err() {
                    updates = None;
                    continue;
                }
                if let Some(rx) = updates.as_mut() {
                    let snapshot = rx.borrow_and_update().clone();
                    print_new_entries(&snapshot, &mut last_seen);
                }
            }

            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "Failed to read stdin");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                match line.parse::<ConsoleCommand>() {
                    Ok(ConsoleCommand::Quit) => break,
                    Ok(command) => execute(&mut session, command).await,
                    Err(e) => println!("{}", e),
                }
            }
        }
    }

    session.shutdown().await
}

async fn execute(session: &mut Session, command: ConsoleCommand) {
    match command {
        ConsoleCommand::Open(side, amount) => match session.open(side, amount).await {
            Ok(signal) => println!(
                "Leader {} {} @ ${:.2} (signal {})",
                side,
                amount.normalize(),
                signal.price,
                signal.id
            ),
            Err(e) => println!("Leader open refused: {}", e),
        },
        ConsoleCommand::Close => match session.close().await {
            Ok(pnl) => println!("Leader closed. Realized P&L: ${:.2}", pnl),
            Err(e) => println!("Leader close refused: {}", e),
        },
        ConsoleCommand::Status => println!("\n{}", session.status()),
        ConsoleCommand::Logs => {
            for follower in session.followers() {
                println!("\n--- {} ---", follower.name);
                if follower.logs.is_empty() {
                    println!("  (no activity)");
                }
                for entry in follower.logs.iter().rev() {
                    println!("  {}", entry.message);
                }
            }
        }
        ConsoleCommand::Key(key) => {
            session.set_follower_key(key);
            println!("Follower key: {}", session.credentials().redacted_key());
        }
        ConsoleCommand::Rpc(url) => {
            session.set_rpc_endpoint(url);
            println!("RPC endpoint: {}", session.credentials().rpc_endpoint);
        }
        ConsoleCommand::Watch(address) => match session.set_watch_address(address) {
            Ok(()) => println!("Reconnecting to new leader..."),
            Err(e) => println!("{}", e),
        },
        ConsoleCommand::Advice => println!("Strategy desk: {}", session.advice().await),
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => {}
    }
}

fn print_new_entries(snapshot: &FollowerSnapshot, last_seen: &mut Option<String>) {
    let fresh: Vec<_> = snapshot
        .logs
        .iter()
        .take_while(|e| Some(&e.message) != last_seen.as_ref())
        .collect();

    for entry in fresh.iter().rev() {
        let marker = match entry.severity {
            Severity::Info => " ",
            Severity::Success => "+",
            Severity::Error => "!",
        };
        println!("{} {} {}", marker, snapshot.name, entry.message);
    }

    if let Some(newest) = snapshot.logs.first() {
        *last_seen = Some(newest.message.clone());
    }
}

/// Scripted round trip: leader LONG 0.1, price +50, leader close.
pub async fn run_scenario(mut config: SessionConfig) -> Result<SessionReport> {
    config.manual_prices = true;
    config.advisory_interval = Duration::ZERO;

    let entry = config.feed.initial_price;
    let exit = entry + dec!(50);
    let amount = dec!(0.1);
    let limit = config.engine.execution_timeout + Duration::from_secs(2);

    let session = Session::start(config)?;
    session.set_price(entry);
    session
        .settle_leader(limit, |s| s.price == entry)
        .await?;

    let signal = session.open(Side::Long, amount).await?;
    println!(
        "Leader LONG {} @ ${:.2} -> signal {}",
        amount.normalize(),
        signal.price,
        signal.id
    );
    session
        .settle_followers(limit, |s| {
            s.state == FollowerState::Positioned
                || (s.state == FollowerState::Idle
                    && s.logs.first().map(|e| e.severity) == Some(Severity::Error))
        })
        .await?;

    session.set_price(exit);
    session.settle_leader(limit, |s| s.price == exit).await?;
    session
        .settle_followers(limit, |s| s.price == exit)
        .await?;
    println!("\n{}", session.status());

    let realized = session.close().await?;
    println!("Leader closed. Realized P&L: ${:.2}", realized);
    session
        .settle_followers(limit, |s| s.state == FollowerState::Idle && s.position.is_none())
        .await?;

    let report = session.shutdown().await?;
    for follower in &report.followers {
        println!("\n--- {} log ---", follower.name);
        for entry in follower.logs.iter().rev() {
            println!("  {}", entry.message);
        }
    }

    Ok(report)
}
