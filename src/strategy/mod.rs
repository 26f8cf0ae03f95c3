//! Provisioning strategies.
//!
//! A strategy turns a [`ProvisionConfig`] into at most one verified,
//! SSH-reachable machine. Every strategy follows the same contract:
//!
//! - expected failures (no offers, rejected creations, timeouts) are
//!   reported in the returned [`ProvisionResult`], never raised;
//! - every instance created during a call is destroyed before the call
//!   returns, except the winner;
//! - a panic inside the strategy body is contained, the instances it
//!   created are destroyed and a failure result is returned.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use crate::config::ProvisionConfig;
use crate::provider::{CloudProvider, PortMappings};
use crate::ssh::SshProbe;

mod candidate;
mod cold_start;
mod lifecycle;
mod progress;
mod race;
mod result;
mod single;

pub use candidate::{CandidateStatus, MachineCandidate};
pub use cold_start::{ColdStartStrategy, ResumeOptions};
pub use progress::{Progress, ProgressReporter, ProgressStatus, ProgressUpdate};
pub use race::RaceStrategy;
pub use result::{CleanupFailure, ProvisionError, ProvisionResult, ProvisionStats, ProvisionedMachine};
pub use single::SingleStrategy;

/// Future returned by [`ProvisionStrategy::provision`].
pub type StrategyFuture<'a> = Pin<Box<dyn Future<Output = ProvisionResult> + Send + 'a>>;

/// An algorithm that acquires one ready machine.
pub trait ProvisionStrategy: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Acquires a machine matching `config`.
    fn provision<'a>(
        &'a self,
        config: &'a ProvisionConfig,
        provider: &'a Arc<dyn CloudProvider>,
        progress: &'a Progress,
    ) -> StrategyFuture<'a>;
}

/// Strategies selectable by name.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StrategyKind {
    /// Speculative parallel acquisition; fastest.
    #[default]
    Race,
    /// One machine at a time; cheapest.
    Single,
}

impl StrategyKind {
    /// Returns the canonical name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Race => "race",
            Self::Single => "single",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a strategy name is not recognised.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown strategy '{0}': expected race or single")]
pub struct UnknownStrategy(pub String);

impl FromStr for StrategyKind {
    type Err = UnknownStrategy;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "race" => Ok(Self::Race),
            "single" => Ok(Self::Single),
            other => Err(UnknownStrategy(other.to_owned())),
        }
    }
}

/// A resolved strategy.
#[derive(Clone, Debug)]
pub enum Strategy {
    /// See [`RaceStrategy`].
    Race(RaceStrategy),
    /// See [`SingleStrategy`].
    Single(SingleStrategy),
}

impl Strategy {
    /// Builds the strategy for `kind`.
    #[must_use]
    pub fn new(kind: StrategyKind, probe: Arc<dyn SshProbe>) -> Self {
        match kind {
            StrategyKind::Race => Self::Race(RaceStrategy::new(probe)),
            StrategyKind::Single => Self::Single(SingleStrategy::new(probe)),
        }
    }
}

impl ProvisionStrategy for Strategy {
    fn name(&self) -> &'static str {
        match self {
            Self::Race(inner) => inner.name(),
            Self::Single(inner) => inner.name(),
        }
    }

    fn provision<'a>(
        &'a self,
        config: &'a ProvisionConfig,
        provider: &'a Arc<dyn CloudProvider>,
        progress: &'a Progress,
    ) -> StrategyFuture<'a> {
        match self {
            Self::Race(inner) => inner.provision(config, provider, progress),
            Self::Single(inner) => inner.provision(config, provider, progress),
        }
    }
}

/// Probes `host:port` under a hard timeout. Never fails; any error or an
/// exceeded bound yields `false`.
pub async fn test_ssh_connection(
    probe: &dyn SshProbe,
    host: &str,
    port: u16,
    limit: Duration,
    run_command: bool,
) -> bool {
    match timeout(limit, probe.verify(host, port, limit, run_command)).await {
        Ok(reachable) => reachable,
        Err(_) => {
            debug!(host, port, "ssh probe exceeded its bound");
            false
        }
    }
}

/// Resolves the host port mapped to `target_port`.
///
/// Looks up `"<port>/tcp"` first and then the bare port key. Returns `None`
/// while the port is not mapped yet.
///
/// # Examples
///
/// ```
/// # use spotbroker::provider::PortMappings;
/// # use spotbroker::strategy::get_mapped_port;
/// let mut table = PortMappings::new();
/// table.insert_tcp(22, 41022);
/// assert_eq!(get_mapped_port(&table, 22), Some(41022));
/// assert_eq!(get_mapped_port(&table, 8080), None);
/// ```
#[must_use]
pub fn get_mapped_port(port_mappings: &PortMappings, target_port: u16) -> Option<u16> {
    [format!("{target_port}/tcp"), target_port.to_string()]
        .iter()
        .filter_map(|key| port_mappings.get(key))
        .flat_map(|bindings| bindings.iter())
        .find_map(|binding| binding.host_port.trim().parse::<u16>().ok())
}
