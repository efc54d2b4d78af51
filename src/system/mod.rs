//! Implementations of the `SandboxHost` trait
//!
//! - `LocalHost`: runs inside the sandbox against the real process table
//! - `MockHost`: scriptable in-memory host for tests and dry runs

mod local;
mod mock;

pub use local::LocalHost;
pub use mock::{HttpBehavior, MockHost};
