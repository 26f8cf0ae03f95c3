//! Outcome of a provisioning call.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::provider::PortMappings;

use super::get_mapped_port;

/// A verified, SSH-reachable machine handed to the caller.
#[derive(Clone, Debug, PartialEq)]
pub struct ProvisionedMachine {
    /// Provider identifier of the instance.
    pub instance_id: String,
    /// SSH host.
    pub ssh_host: String,
    /// SSH port on `ssh_host`.
    pub ssh_port: u16,
    /// Public address of the host machine.
    pub public_ip: Option<String>,
    /// GPU model.
    pub gpu_name: Option<String>,
    /// Price per hour.
    pub dph_total: Option<f64>,
    /// Container port table at the time the machine was verified.
    pub port_mappings: PortMappings,
}

impl ProvisionedMachine {
    /// Host port mapped to `container_port`, if the provider published one.
    #[must_use]
    pub fn mapped_port(&self, container_port: u16) -> Option<u16> {
        get_mapped_port(&self.port_mappings, container_port)
    }
}

/// Counters describing the work a call performed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProvisionStats {
    /// Batches or rounds started.
    pub rounds_attempted: u32,
    /// Offers (or paused instances) a creation was attempted on.
    pub machines_tried: u32,
    /// Instances that actually exist or existed.
    pub machines_created: u32,
    /// Wall-clock duration of the call.
    pub total_time: Duration,
    /// Time from the creation call to verified SSH for the winner.
    pub time_to_ready: Option<Duration>,
}

impl ProvisionStats {
    pub(crate) const fn absorb(&mut self, other: &Self) {
        self.rounds_attempted = self.rounds_attempted.saturating_add(other.rounds_attempted);
        self.machines_tried = self.machines_tried.saturating_add(other.machines_tried);
        self.machines_created = self.machines_created.saturating_add(other.machines_created);
    }
}

/// Destroy call that failed during cleanup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CleanupFailure {
    /// Instance that may have leaked.
    pub instance_id: String,
    /// Provider message.
    pub message: String,
}

/// Why a provisioning call failed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProvisionError {
    /// The marketplace returned no matching offers.
    #[error("no offers match the requested configuration")]
    NoOffers,
    /// Every creation attempt was refused.
    #[error("no instance could be created from {tried} offers: {}", reasons.join("; "))]
    CreationExhausted {
        /// Offers a creation was attempted on.
        tried: u32,
        /// One entry per refused offer.
        reasons: Vec<String>,
    },
    /// Instances were created but none became ready in time.
    #[error(
        "no machine became ready within {waited_secs}s ({machines_created} created: {})",
        instances.join(", ")
    )]
    ReadinessTimeout {
        /// Instances created during the call.
        machines_created: u32,
        /// Seconds spent waiting.
        waited_secs: u64,
        /// Identifiers of the created instances, all destroyed.
        instances: Vec<String>,
    },
    /// Every provisioned machine failed the remote command check.
    #[error(
        "ssh verification failed on {attempts} machines: {}",
        failed_instances.join(", ")
    )]
    SshVerificationFailed {
        /// Rounds attempted.
        attempts: u32,
        /// Machines that were provisioned and then rejected.
        failed_instances: Vec<String>,
    },
    /// Neither the resumed instance nor a backup became ready.
    #[error("instance {instance_id} did not resume{}", backup.as_ref().map(|reason| format!(" and backup failed: {reason}")).unwrap_or_default())]
    ResumeFailed {
        /// Paused instance that was resumed.
        instance_id: String,
        /// Backup failure, when a backup ran.
        backup: Option<String>,
    },
    /// The call was cancelled; every tracked instance was destroyed.
    #[error("provisioning cancelled")]
    Cancelled,
    /// The configuration was rejected before any work started.
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
    /// Unexpected failure contained at the strategy boundary.
    #[error("internal provisioning failure: {0}")]
    Internal(String),
}

/// Sole artefact returned by every provisioning call.
#[derive(Clone, Debug, PartialEq)]
pub struct ProvisionResult {
    /// The machine, or why there is none.
    pub outcome: Result<ProvisionedMachine, ProvisionError>,
    /// Work counters.
    pub stats: ProvisionStats,
    /// Destroy calls that failed; the listed instances may still be billed.
    pub cleanup_failures: Vec<CleanupFailure>,
}

impl ProvisionResult {
    /// Successful result.
    #[must_use]
    pub const fn success(machine: ProvisionedMachine, stats: ProvisionStats) -> Self {
        Self {
            outcome: Ok(machine),
            stats,
            cleanup_failures: Vec::new(),
        }
    }

    /// Failed result.
    #[must_use]
    pub const fn failure(error: ProvisionError, stats: ProvisionStats) -> Self {
        Self {
            outcome: Err(error),
            stats,
            cleanup_failures: Vec::new(),
        }
    }

    /// Attaches cleanup failures.
    #[must_use]
    pub fn with_cleanup_failures(mut self, failures: Vec<CleanupFailure>) -> Self {
        self.cleanup_failures.extend(failures);
        self
    }

    /// `true` when a machine was provisioned.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The provisioned machine, if any.
    #[must_use]
    pub fn machine(&self) -> Option<&ProvisionedMachine> {
        self.outcome.as_ref().ok()
    }

    /// The failure, if any.
    #[must_use]
    pub fn error(&self) -> Option<&ProvisionError> {
        self.outcome.as_ref().err()
    }

    /// Identifier of the provisioned instance.
    #[must_use]
    pub fn instance_id(&self) -> Option<&str> {
        self.machine().map(|machine| machine.instance_id.as_str())
    }

    /// [`ProvisionStats::total_time`] in seconds.
    #[must_use]
    pub const fn total_time_seconds(&self) -> f64 {
        self.stats.total_time.as_secs_f64()
    }

    /// [`ProvisionStats::time_to_ready`] in seconds.
    #[must_use]
    pub fn time_to_ready_seconds(&self) -> Option<f64> {
        self.stats.time_to_ready.map(|ready| ready.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_timeout_names_created_instances() {
        let err = ProvisionError::ReadinessTimeout {
            machines_created: 2,
            waited_secs: 120,
            instances: vec![String::from("11"), String::from("12")],
        };
        assert_eq!(
            err.to_string(),
            "no machine became ready within 120s (2 created: 11, 12)"
        );
    }

    #[test]
    fn resume_failure_mentions_backup_reason() {
        let bare = ProvisionError::ResumeFailed {
            instance_id: String::from("7"),
            backup: None,
        };
        let with_backup = ProvisionError::ResumeFailed {
            instance_id: String::from("7"),
            backup: Some(String::from("no offers match the requested configuration")),
        };
        assert_eq!(bare.to_string(), "instance 7 did not resume");
        assert_eq!(
            with_backup.to_string(),
            "instance 7 did not resume and backup failed: no offers match the requested configuration"
        );
    }

    #[test]
    fn stats_absorb_sums_counters() {
        let mut total = ProvisionStats {
            rounds_attempted: 1,
            machines_tried: 3,
            machines_created: 2,
            ..ProvisionStats::default()
        };
        total.absorb(&ProvisionStats {
            rounds_attempted: 2,
            machines_tried: 4,
            machines_created: 1,
            total_time: Duration::from_secs(9),
            time_to_ready: None,
        });
        assert_eq!(
            (total.rounds_attempted, total.machines_tried, total.machines_created),
            (3, 7, 3)
        );
        assert_eq!(total.total_time, Duration::ZERO);
    }
}
