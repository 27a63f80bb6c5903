//! # nsinit-core
//!
//! Init process for fresh Linux user and pid namespaces.
//!
//! This crate provides:
//! - `NamespaceLauncher` - clone(2) into new user/pid namespaces on an owned stack
//! - `InitSupervisor` - pid 1 that starts a workload and reaps every descendant
//! - `NamespaceHandle` - parent-side wait, terminate, add_proc and kill
//! - Pipe-based control and report channels between the two sides

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod handle;
pub mod isolation;
pub mod launcher;
pub mod pipe;
pub mod preflight;
pub mod protocol;
pub mod result;
pub mod supervisor;
pub mod workload;

pub use config::LaunchConfig;
pub use error::NsinitError;
pub use handle::NamespaceHandle;
pub use isolation::{NamespaceConfig, Stack};
pub use launcher::NamespaceLauncher;
pub use protocol::{ChildExit, ChildOutcome, SupervisorReport};
pub use result::{InitStatus, NamespaceExit};
pub use supervisor::{InitSupervisor, MAX_AGGREGATE_EXIT, SUPERVISOR_FAULT_EXIT};
pub use workload::{CommandSpec, Redirect};

/// Crate-level result type
pub type Result<T> = std::result::Result<T, NsinitError>;
