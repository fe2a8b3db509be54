//! Build sessions and build pod garbage collection for repobuild.
//!
//! - [`BuildSession`] drives one executor's submission and log streaming
//!   as separate tasks.
//! - [`BuildPodGc`] deletes finished and stale build pods, either on demand
//!   or periodically through [`run_gc_loop`].

pub mod gc;
pub mod session;

pub use gc::{BuildPodGc, GcSummary, run_gc_loop};
pub use session::BuildSession;
