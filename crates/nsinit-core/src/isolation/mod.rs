//! Linux isolation primitives
//!
//! This module contains the process-creation mechanisms:
//! - `clone` - clone(2) with a Rust closure as entry point
//! - `namespace` - namespaces requested for the new process (user, pid, ipc, uts)
//! - `stack` - pinned stack region the new process runs on

pub mod clone;
pub mod namespace;
pub mod stack;

pub use self::namespace::NamespaceConfig;
pub use self::stack::Stack;
