//! Core domain types and traits for repobuild.
//!
//! This crate contains:
//! - Build names derived from `(repo_url, ref)`
//! - Build specifications and byte sizes
//! - Progress events and build statuses
//! - The build executor trait
//! - The shared error type

pub mod error;
pub mod event;
pub mod executor;
pub mod name;
pub mod spec;

pub use error::{Error, Result};
pub use event::{BuildStatus, LogLine, ProgressEvent};
pub use executor::BuildExecutor;
pub use name::BuildName;
pub use spec::{BuildCredentials, BuildResources, BuildSpec, BuildSpecBuilder, ByteSize};
