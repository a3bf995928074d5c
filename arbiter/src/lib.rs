//! Judging worker core for a competitive-programming platform.
//!
//! A worker claims pending attempts from a shared Postgres queue, compiles
//! the submitted source, runs the artifact under a sandboxed executor
//! against the problem's test files, validates output with the problem's
//! checker, and writes verdicts, resource usage and (for school contests)
//! per-test rows back to the queue. Any number of workers may serve the
//! same queue; claiming is serialised by the store.
//!
//! The crate is Unix-only: toolchain discovery relies on execute bits and
//! the worker lifecycle on POSIX signals.

pub mod config;
pub mod judge;
pub mod model;
pub mod protocol;
pub mod store;
pub mod toolchain;
pub mod verdict;
pub mod worker;

pub use self::config::{Config, ConfigError};
pub use self::judge::{JudgeEnv, JudgeError};
pub use self::protocol::{ProtocolError, RunRecord};
pub use self::store::{AttemptStore, PgStore, ResultUpdate, StoreError};
pub use self::toolchain::{ToolchainError, Toolchains};
pub use self::verdict::Verdict;
pub use self::worker::{Lifecycle, WorkerError};
