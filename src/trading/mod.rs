//! Replication logic: leader monitor, follower engine, policy.

mod config;
mod execution_log;
mod follower;
mod leader;

pub use config::{EngineConfig, ReplicationPolicy};
pub use execution_log::Severity;
pub use follower::{FollowerEngine, FollowerSnapshot, FollowerState};
pub use leader::{
    LeaderCommand, LeaderError, LeaderSnapshot, LeaderStateMachine, MonitorStatus,
};
