//! Simulated BTC mid-price feed.

use std::time::Duration;

use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

/// Random-walk parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub initial_price: Decimal,

    /// Maximum absolute move per tick
    pub max_step: Decimal,

    pub tick_interval: Duration,

    /// Price never walks below this
    pub floor: Decimal,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            initial_price: dec!(64250.50),
            max_step: dec!(6),
            tick_interval: Duration::from_secs(1),
            floor: dec!(0.01),
        }
    }
}

/// Publishes a new price every tick into a watch channel.
pub struct PriceFeed {
    config: FeedConfig,
    sender: watch::Sender<Decimal>,
}

impl PriceFeed {
    pub fn new(config: FeedConfig) -> Self {
        let (sender, _) = watch::channel(config.initial_price);
        Self { config, sender }
    }

    pub fn subscribe(&self) -> watch::Receiver<Decimal> {
        self.sender.subscribe()
    }

    pub fn current(&self) -> Decimal {
        *self.sender.borrow()
    }

    /// Set the price directly (scripted sessions).
    pub fn set(&self, price: Decimal) {
        self.sender.send_replace(price);
    }

    /// Apply one random step and publish the result.
    pub fn tick(&self) -> Decimal {
        let next = next_price(self.current(), &self.config, &mut rand::thread_rng());
        self.sender.send_replace(next);
        next
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;

        info!(
            price = %self.current(),
            interval_ms = self.config.tick_interval.as_millis() as u64,
            "Price feed started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    let price = self.tick();
                    debug!(price = %price, "Price tick");
                }
            }
        }

        info!("Price feed stopped");
    }
}

/// `current + uniform(-max_step, max_step)`, rounded to cents, clamped at the floor.
pub fn next_price<R: Rng + ?Sized>(current: Decimal, config: &FeedConfig, rng: &mut R) -> Decimal {
    let cents = (config.max_step * Decimal::ONE_HUNDRED).trunc();
    let span = cents.to_i64().unwrap_or(0);
    let step = if span > 0 {
        Decimal::new(rng.gen_range(-span..=span), 2)
    } else {
        Decimal::ZERO
    };

    (current + step).round_dp(2).max(config.floor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_steps_stay_within_bounds() {
        let config = FeedConfig::default();
        let mut rng = StdRng::seed_from_u64(7);
        let mut price = config.initial_price;

        for _ in 0..1_000 {
            let next = next_price(price, &config, &mut rng);
            assert!((next - price).abs() <= config.max_step);
            assert_eq!(next, next.round_dp(2));
            price = next;
        }
    }

    #[test]
    fn test_price_never_below_floor() {
        let config = FeedConfig {
            initial_price: dec!(1),
            max_step: dec!(50),
            ..FeedConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(11);
        let mut price = config.initial_price;

        for _ in 0..200 {
            price = next_price(price, &config, &mut rng);
            assert!(price >= config.floor);
        }
    }

    #[tokio::test]
    async fn test_subscribers_see_ticks() {
        let feed = PriceFeed::new(FeedConfig::default());
        let mut rx = feed.subscribe();

        feed.set(dec!(100));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), dec!(100));

        let next = feed.tick();
        assert_eq!(*rx.borrow_and_update(), next);
    }
}
