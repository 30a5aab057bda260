//! Connection sharding
//!
//! The symbol universe is partitioned across stream clients by channel
//! class and liquidity tier. The supervisor owns client lifecycles,
//! restart-on-failure, per-shard circuit breakers, and minimal-diff
//! rebalancing on configuration change.

mod breaker;
mod plan;
mod supervisor;

pub use breaker::{BreakerState, CircuitBreaker};
pub use plan::{LiquidityTier, PlanDiff, ShardPlan, ShardSpec};
pub use supervisor::{ShardStatus, ShardSupervisor, SupervisorCommand};
