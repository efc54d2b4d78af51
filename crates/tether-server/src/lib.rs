//! Tether Server - edge in front of a sandboxed gateway
//!
//! Accepts client WebSockets immediately, bridges each one onto a
//! reconnecting proxy session, and runs the sentinel that keeps backups,
//! scheduled jobs and gateway health converged in the background.

pub mod backend;
pub mod error;
pub mod server;
pub mod state;
pub mod tasks;
pub mod ws;

pub use error::{ServerError, ServerResult};
pub use server::{build_router, build_sentinel, restore_on_boot, run_server};
pub use state::AppState;
