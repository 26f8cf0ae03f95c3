//! Core library for the spotbroker GPU provisioning engine.
//!
//! The crate turns an unreliable spot/on-demand GPU marketplace into a
//! single ready-to-use, SSH-reachable machine. Callers describe the machine
//! they need with a [`ProvisionConfig`] and receive a [`ProvisionResult`]
//! that either carries verified connection details or says precisely why
//! provisioning failed.
//!
//! Three strategies are available: [`RaceStrategy`] creates several
//! candidates per batch and keeps the first one that is truly reachable,
//! [`SingleStrategy`] rents one machine at a time at the lowest price, and
//! [`ColdStartStrategy`] resumes a paused instance while racing a backup.
//! [`MachineProvisioner`] is the facade that ties them together.

pub mod config;
pub mod janitor;
pub mod provider;
pub mod service;
pub mod ssh;
pub mod strategy;
pub mod test_support;

pub use config::{ConfigError, ProvisionConfig, ProvisionConfigBuilder, ProvisionDefaults};
pub use janitor::{Janitor, JanitorError, SweepSummary};
pub use provider::{
    CloudProvider, InstanceState, InstanceStatus, MachineType, Offer, OfferQuery,
    RateLimitedProvider, RetryPolicy,
};
pub use service::MachineProvisioner;
pub use ssh::{CommandSshProbe, SshConfig, SshError, SshProbe};
pub use strategy::{
    ColdStartStrategy, Progress, ProgressStatus, ProgressUpdate, ProvisionError, ProvisionResult,
    ProvisionStats, ProvisionStrategy, ProvisionedMachine, RaceStrategy, ResumeOptions,
    SingleStrategy, StrategyKind,
};
