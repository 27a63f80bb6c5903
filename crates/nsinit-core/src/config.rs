//! Launch configuration

use crate::isolation::NamespaceConfig;
use crate::isolation::stack::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
use crate::{NsinitError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for launching a namespace init process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Size of the stack the init process starts on
    pub stack_size: usize,

    /// Namespaces to create
    pub namespaces: NamespaceConfig,

    /// Time between SIGTERM and SIGKILL when the namespace is terminated
    pub terminate_grace: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            stack_size: default_stack_size(),
            namespaces: NamespaceConfig::default(),
            terminate_grace: Duration::from_secs(5),
        }
    }
}

impl LaunchConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> LaunchConfigBuilder {
        LaunchConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(NsinitError::Config(format!(
                "stack size {} is below the minimum of {MIN_STACK_SIZE} bytes",
                self.stack_size
            )));
        }
        self.namespaces.validate()
    }
}

/// Builder for LaunchConfig
#[derive(Debug, Default)]
pub struct LaunchConfigBuilder {
    config: LaunchConfig,
}

impl LaunchConfigBuilder {
    #[must_use]
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.config.stack_size = bytes;
        self
    }

    #[must_use]
    pub fn stack_size_kb(self, kb: usize) -> Self {
        self.stack_size(kb.saturating_mul(1024))
    }

    #[must_use]
    pub fn namespaces(mut self, namespaces: NamespaceConfig) -> Self {
        self.config.namespaces = namespaces;
        self
    }

    #[must_use]
    pub fn new_ipc(mut self, enable: bool) -> Self {
        self.config.namespaces.ipc = enable;
        self
    }

    #[must_use]
    pub fn new_uts(mut self, enable: bool) -> Self {
        self.config.namespaces.uts = enable;
        self
    }

    #[must_use]
    pub fn terminate_grace(mut self, grace: Duration) -> Self {
        self.config.terminate_grace = grace;
        self
    }

    #[must_use]
    pub fn build(self) -> LaunchConfig {
        self.config
    }
}

/// Get default stack size from NSINIT_STACK_SIZE env var or the built-in default
///
/// Returns:
/// - `$NSINIT_STACK_SIZE` (bytes) if set and parseable
/// - 1 MiB otherwise
pub fn default_stack_size() -> usize {
    std::env::var("NSINIT_STACK_SIZE")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_STACK_SIZE)
}
