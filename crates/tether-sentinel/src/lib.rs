//! Tether Sentinel: periodic background duties
//!
//! The sentinel keeps the sandbox converged while nobody is connected:
//!
//! ```text
//! every backup_interval_s  ──> mirror gateway state into the bucket
//! every cron_interval_s    ──> re-register scheduled jobs the gateway forgot
//! every health_interval_s  ──> probe an idle gateway, restart if it stopped answering
//! ```
//!
//! Each duty is a [`SentinelTask`] with its own interval loop. Ticks are
//! idempotent, bounded by a timeout, and their failures are logged and
//! retried on the next interval rather than raised.
//!
//! # Example
//!
//! ```no_run
//! use tether_sentinel::{Sentinel, SentinelPolicy, SentinelTask, TaskKind, TickOutcome};
//! use std::sync::Arc;
//!
//! struct Heartbeat;
//!
//! #[async_trait::async_trait]
//! impl SentinelTask for Heartbeat {
//!     fn kind(&self) -> TaskKind {
//!         TaskKind::HealthCheck
//!     }
//!
//!     async fn tick(&self) -> anyhow::Result<TickOutcome> {
//!         Ok(TickOutcome::Idle)
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let sentinel = Sentinel::new(SentinelPolicy::default())?.with_task(Arc::new(Heartbeat))?;
//! tokio::spawn(sentinel.run());
//! # Ok(())
//! # }
//! ```

pub mod daemon;
pub mod metrics;
pub mod policy;

pub use daemon::{Sentinel, SentinelError, SentinelStats, SentinelTask};
pub use metrics::{TickOutcome, TickStats};
pub use policy::{SentinelPolicy, TaskKind};
