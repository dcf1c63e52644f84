//! # Pinball Worker
//!
//! The workflow runtime protocol: a stateless loop that claims runnable job
//! tokens from the master, executes them through the `JobExecutor` contract,
//! posts events to successors and advances the instance — every step an
//! atomic master operation guarded by optimistic version checks.
//!
//! Workers coordinate only through the master. Liveness is lease-based: a
//! worker that disappears loses its tokens at their expiration time and
//! someone else picks the work up.

pub mod executor;
pub mod runtime;

pub use executor::{ExecutionReport, ExecutionStatus, JobContext, JobExecutor, ShellExecutor};
pub use pinball_proto::MasterClient;
pub use runtime::{Worker, WorkerConfig, WorkerError, WorkerStep};
