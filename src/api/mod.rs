//! Venue execution and advisory service clients.

mod advisor_client;
mod execution;
mod venue_client;

pub use advisor_client::{AdvisoryClient, DEFAULT_MODEL};
pub use execution::{Credentials, ExecutionAdapter, ExecutionError, DEFAULT_RPC_ENDPOINT};
pub use venue_client::{SimulatedVenue, VenueConfig};

#[cfg(test)]
pub(crate) mod fixtures {
    /// Well-known development key (anvil account #0).
    pub const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
}
