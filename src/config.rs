//! Provisioning configuration.
//!
//! [`ProvisionDefaults`] carries the operator tunables loaded via
//! `ortho-config` (defaults, `spotbroker.toml` discovery and `SPOTBROKER_*`
//! environment variables). Callers turn them into a per-request
//! [`ProvisionConfig`] through [`ProvisionConfigBuilder`], which applies the
//! request specific matching constraints and validates the result.

use std::collections::BTreeSet;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::provider::{CreateInstanceRequest, MachineType, OfferQuery};

/// Container port that is always exposed.
pub const SSH_PORT: u16 = 22;

/// Operator level defaults for every provisioning request.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq)]
#[ortho_config(
    prefix = "SPOTBROKER",
    discovery(
        app_name = "spotbroker",
        env_var = "SPOTBROKER_CONFIG_PATH",
        config_file_name = "spotbroker.toml",
        dotfile_name = ".spotbroker.toml",
        project_file_name = "spotbroker.toml"
    )
)]
pub struct ProvisionDefaults {
    /// Container image launched on new machines.
    #[ortho_config(default = "pytorch/pytorch:latest".to_owned())]
    pub image: String,
    /// Disk to allocate in gigabytes.
    #[ortho_config(default = 50.0)]
    pub disk_space: f64,
    /// Maximum total price per hour.
    #[ortho_config(default = 1.0)]
    pub max_price: f64,
    /// Minimum reliability score between 0 and 1.
    #[ortho_config(default = 0.9)]
    pub min_reliability: f64,
    /// Minimum download bandwidth in Mbps.
    #[ortho_config(default = 100.0)]
    pub min_inet_down: f64,
    /// Billing model: `on-demand` or `interruptible`.
    #[ortho_config(default = "on-demand".to_owned())]
    pub machine_type: String,
    /// Prefix of generated instance labels.
    #[ortho_config(default = "spotbroker".to_owned())]
    pub label_prefix: String,
    /// Candidates created per race batch.
    #[ortho_config(default = 3)]
    pub batch_size: u32,
    /// Seconds a batch may take to produce a winner.
    #[ortho_config(default = 120)]
    pub batch_timeout_secs: u64,
    /// Batches attempted before giving up.
    #[ortho_config(default = 3)]
    pub max_batches: u32,
    /// Seconds between readiness polls.
    #[ortho_config(default = 5)]
    pub check_interval_secs: u64,
    /// Seconds a single creation call may take.
    #[ortho_config(default = 60)]
    pub create_timeout_secs: u64,
    /// Milliseconds between staggered creation calls.
    #[ortho_config(default = 500)]
    pub create_stagger_ms: u64,
    /// Machines burned through when command verification fails.
    #[ortho_config(default = 3)]
    pub max_ssh_retries: u32,
    /// Seconds allowed for the remote command check.
    #[ortho_config(default = 30)]
    pub ssh_command_timeout_secs: u64,
    /// Seconds allowed for the liveness probe.
    #[ortho_config(default = 10)]
    pub ssh_connect_timeout_secs: u64,
    /// Require a remote command during readiness polling.
    #[ortho_config(default = false)]
    pub verify_ssh_with_command: bool,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to spotbroker.toml",
            self.description, self.env_var, self.toml_key
        ))
    }

    fn invalid(&self, reason: &str) -> ConfigError {
        ConfigError::Invalid {
            field: self.toml_key.to_owned(),
            reason: format!(
                "{} {reason}: set {} or {} in spotbroker.toml",
                self.description, self.env_var, self.toml_key
            ),
        }
    }
}

const IMAGE: FieldMetadata = FieldMetadata::new("container image", "SPOTBROKER_IMAGE", "image");
const MACHINE_TYPE: FieldMetadata =
    FieldMetadata::new("machine type", "SPOTBROKER_MACHINE_TYPE", "machine_type");
const LABEL_PREFIX: FieldMetadata =
    FieldMetadata::new("label prefix", "SPOTBROKER_LABEL_PREFIX", "label_prefix");
const MAX_PRICE: FieldMetadata =
    FieldMetadata::new("maximum price", "SPOTBROKER_MAX_PRICE", "max_price");
const MIN_RELIABILITY: FieldMetadata = FieldMetadata::new(
    "minimum reliability",
    "SPOTBROKER_MIN_RELIABILITY",
    "min_reliability",
);

impl ProvisionDefaults {
    /// Returns the built-in defaults without consulting any source.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            image: String::from("pytorch/pytorch:latest"),
            disk_space: 50.0,
            max_price: 1.0,
            min_reliability: 0.9,
            min_inet_down: 100.0,
            machine_type: String::from("on-demand"),
            label_prefix: String::from("spotbroker"),
            batch_size: 3,
            batch_timeout_secs: 120,
            max_batches: 3,
            check_interval_secs: 5,
            create_timeout_secs: 60,
            create_stagger_ms: 500,
            max_ssh_retries: 3,
            ssh_command_timeout_secs: 30,
            ssh_connect_timeout_secs: 10,
            verify_ssh_with_command: false,
        }
    }

    /// Loads defaults without attempting to parse CLI arguments. Values
    /// merge built-in defaults, configuration files and environment
    /// variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails, or a validation
    /// error when a merged value is unusable.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        let defaults = Self::load_from_iter([std::ffi::OsString::from("spotbroker")])
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        defaults.validate()?;
        Ok(defaults)
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that supply the offending value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for empty strings and
    /// [`ConfigError::Invalid`] for out of range values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image.trim().is_empty() {
            return Err(IMAGE.missing());
        }
        if self.label_prefix.trim().is_empty() {
            return Err(LABEL_PREFIX.missing());
        }
        self.parsed_machine_type()?;
        if self.max_price.is_nan() || self.max_price <= 0.0 {
            return Err(MAX_PRICE.invalid("must be positive"));
        }
        if !(0.0..=1.0).contains(&self.min_reliability) {
            return Err(MIN_RELIABILITY.invalid("must be between 0 and 1"));
        }
        self.builder().build().map(|_| ())
    }

    /// Starts a [`ProvisionConfigBuilder`] seeded with these defaults.
    #[must_use]
    pub fn builder(&self) -> ProvisionConfigBuilder {
        ProvisionConfigBuilder {
            gpu_name: None,
            min_gpu_ram: 0.0,
            num_gpus: 1,
            max_price: self.max_price,
            machine_type: self.parsed_machine_type().unwrap_or_default(),
            disk_space: self.disk_space,
            min_inet_down: self.min_inet_down,
            min_reliability: self.min_reliability,
            region: None,
            image: self.image.clone(),
            onstart_cmd: None,
            docker_options: None,
            ports: BTreeSet::new(),
            label: None,
            label_prefix: self.label_prefix.clone(),
            batch_size: usize::try_from(self.batch_size).unwrap_or(usize::MAX),
            batch_timeout: Duration::from_secs(self.batch_timeout_secs),
            max_batches: self.max_batches,
            check_interval: Duration::from_secs(self.check_interval_secs),
            create_timeout: Duration::from_secs(self.create_timeout_secs),
            create_stagger: Duration::from_millis(self.create_stagger_ms),
            max_ssh_retries: self.max_ssh_retries,
            ssh_command_timeout: Duration::from_secs(self.ssh_command_timeout_secs),
            ssh_connect_timeout: Duration::from_secs(self.ssh_connect_timeout_secs),
            verify_ssh_with_command: self.verify_ssh_with_command,
        }
    }

    fn parsed_machine_type(&self) -> Result<MachineType, ConfigError> {
        self.machine_type
            .parse()
            .map_err(|_| MACHINE_TYPE.invalid("must be on-demand or interruptible"))
    }
}

/// Immutable parameters of one provisioning request.
///
/// Strategies only ever borrow a config; build one with
/// [`ProvisionConfig::builder`] or [`ProvisionDefaults::builder`].
#[derive(Clone, Debug, PartialEq)]
pub struct ProvisionConfig {
    /// Exact GPU model, when set.
    pub gpu_name: Option<String>,
    /// Minimum memory per GPU in gigabytes.
    pub min_gpu_ram: f64,
    /// Exact GPU count.
    pub num_gpus: u32,
    /// Maximum total price per hour.
    pub max_price: f64,
    /// Billing model.
    pub machine_type: MachineType,
    /// Disk to allocate in gigabytes.
    pub disk_space: f64,
    /// Minimum download bandwidth in Mbps.
    pub min_inet_down: f64,
    /// Minimum reliability score.
    pub min_reliability: f64,
    /// Region filter.
    pub region: Option<String>,
    /// Container image.
    pub image: String,
    /// Command run when the container starts.
    pub onstart_cmd: Option<String>,
    /// Extra container runtime options.
    pub docker_options: Option<String>,
    /// Exposed container ports, sorted, always containing 22.
    pub ports: Vec<u16>,
    /// Label attached to every instance created for this request.
    pub label: String,
    /// Candidates created per race batch.
    pub batch_size: usize,
    /// Time a batch may take to produce a winner.
    pub batch_timeout: Duration,
    /// Batches attempted before giving up.
    pub max_batches: u32,
    /// Readiness polling cadence.
    pub check_interval: Duration,
    /// Hard cutoff for one creation call.
    pub create_timeout: Duration,
    /// Delay between staggered creation calls within a batch.
    pub create_stagger: Duration,
    /// Provision rounds attempted by the SSH failover wrapper.
    pub max_ssh_retries: u32,
    /// Bound for the remote command check.
    pub ssh_command_timeout: Duration,
    /// Bound for the liveness probe.
    pub ssh_connect_timeout: Duration,
    /// Require a remote command during readiness polling.
    pub verify_ssh_with_command: bool,
}

impl ProvisionConfig {
    /// Starts a builder seeded with [`ProvisionDefaults::builtin`].
    #[must_use]
    pub fn builder() -> ProvisionConfigBuilder {
        ProvisionDefaults::builtin().builder()
    }

    /// Checks every invariant the strategies rely on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image.trim().is_empty() {
            return Err(ConfigError::MissingField(String::from("image")));
        }
        if self.label.trim().is_empty() {
            return Err(ConfigError::MissingField(String::from("label")));
        }
        require(self.num_gpus > 0, "num_gpus", "must be at least 1")?;
        require(self.max_price > 0.0, "max_price", "must be positive")?;
        require(
            (0.0..=1.0).contains(&self.min_reliability),
            "min_reliability",
            "must be between 0 and 1",
        )?;
        require(self.batch_size > 0, "batch_size", "must be at least 1")?;
        require(self.max_batches > 0, "max_batches", "must be at least 1")?;
        require(self.max_ssh_retries > 0, "max_ssh_retries", "must be at least 1")?;
        for (field, value) in [
            ("batch_timeout", self.batch_timeout),
            ("check_interval", self.check_interval),
            ("create_timeout", self.create_timeout),
            ("ssh_command_timeout", self.ssh_command_timeout),
            ("ssh_connect_timeout", self.ssh_connect_timeout),
        ] {
            require(!value.is_zero(), field, "must be greater than zero")?;
        }
        require(self.ports.contains(&SSH_PORT), "ports", "must include 22")?;
        Ok(())
    }

    /// Derives the offer search sent to the marketplace.
    #[must_use]
    pub fn offer_query(&self) -> OfferQuery {
        OfferQuery {
            gpu_name: self.gpu_name.clone(),
            min_gpu_ram: self.min_gpu_ram,
            num_gpus: self.num_gpus,
            max_price: self.max_price,
            machine_type: self.machine_type,
            disk_space: self.disk_space,
            min_inet_down: self.min_inet_down,
            min_reliability: self.min_reliability,
            region: self.region.clone(),
        }
    }

    /// Builds the creation request for `offer_id`.
    #[must_use]
    pub fn create_request(&self, offer_id: &str) -> CreateInstanceRequest {
        CreateInstanceRequest {
            offer_id: offer_id.to_owned(),
            image: self.image.clone(),
            disk_space: self.disk_space,
            ports: self.ports.clone(),
            onstart_cmd: self.onstart_cmd.clone(),
            docker_options: self.docker_options.clone(),
            label: self.label.clone(),
        }
    }

    /// Bound used by the readiness probe during polling.
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        if self.verify_ssh_with_command {
            self.ssh_command_timeout
        } else {
            self.ssh_connect_timeout
        }
    }

    /// Window a single machine is given to become ready: `batch_timeout`
    /// multiplied by `max_batches`.
    #[must_use]
    pub fn readiness_window(&self) -> Duration {
        self.batch_timeout.saturating_mul(self.max_batches)
    }
}

fn require(condition: bool, field: &str, reason: &str) -> Result<(), ConfigError> {
    if condition {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field: field.to_owned(),
            reason: format!("{field} {reason}"),
        })
    }
}

/// Builder for [`ProvisionConfig`] that defers port normalisation, label
/// generation and validation to [`ProvisionConfigBuilder::build`].
#[derive(Clone, Debug)]
pub struct ProvisionConfigBuilder {
    gpu_name: Option<String>,
    min_gpu_ram: f64,
    num_gpus: u32,
    max_price: f64,
    machine_type: MachineType,
    disk_space: f64,
    min_inet_down: f64,
    min_reliability: f64,
    region: Option<String>,
    image: String,
    onstart_cmd: Option<String>,
    docker_options: Option<String>,
    ports: BTreeSet<u16>,
    label: Option<String>,
    label_prefix: String,
    batch_size: usize,
    batch_timeout: Duration,
    max_batches: u32,
    check_interval: Duration,
    create_timeout: Duration,
    create_stagger: Duration,
    max_ssh_retries: u32,
    ssh_command_timeout: Duration,
    ssh_connect_timeout: Duration,
    verify_ssh_with_command: bool,
}

macro_rules! setter {
    ($(#[$doc:meta])* $name:ident: $ty:ty) => {
        $(#[$doc])*
        #[must_use]
        pub fn $name(mut self, value: $ty) -> Self {
            self.$name = value;
            self
        }
    };
}

impl ProvisionConfigBuilder {
    /// Sets the exact GPU model to match.
    #[must_use]
    pub fn gpu_name(mut self, value: impl Into<String>) -> Self {
        self.gpu_name = Some(value.into());
        self
    }

    /// Sets the region filter.
    #[must_use]
    pub fn region(mut self, value: impl Into<String>) -> Self {
        self.region = Some(value.into());
        self
    }

    /// Sets the container image.
    #[must_use]
    pub fn image(mut self, value: impl Into<String>) -> Self {
        self.image = value.into();
        self
    }

    /// Sets the container start command.
    #[must_use]
    pub fn onstart_cmd(mut self, value: impl Into<String>) -> Self {
        self.onstart_cmd = Some(value.into());
        self
    }

    /// Sets extra container runtime options.
    #[must_use]
    pub fn docker_options(mut self, value: impl Into<String>) -> Self {
        self.docker_options = Some(value.into());
        self
    }

    /// Adds container ports to expose. Port 22 is always exposed.
    #[must_use]
    pub fn ports(mut self, value: impl IntoIterator<Item = u16>) -> Self {
        self.ports.extend(value);
        self
    }

    /// Overrides the generated instance label.
    #[must_use]
    pub fn label(mut self, value: impl Into<String>) -> Self {
        self.label = Some(value.into());
        self
    }

    setter!(
        /// Sets the minimum memory per GPU in gigabytes.
        min_gpu_ram: f64
    );
    setter!(
        /// Sets the exact GPU count.
        num_gpus: u32
    );
    setter!(
        /// Sets the maximum total price per hour.
        max_price: f64
    );
    setter!(
        /// Sets the billing model.
        machine_type: MachineType
    );
    setter!(
        /// Sets the disk size in gigabytes.
        disk_space: f64
    );
    setter!(
        /// Sets the minimum download bandwidth in Mbps.
        min_inet_down: f64
    );
    setter!(
        /// Sets the minimum reliability score.
        min_reliability: f64
    );
    setter!(
        /// Sets the number of candidates per race batch.
        batch_size: usize
    );
    setter!(
        /// Sets the time a batch may take to produce a winner.
        batch_timeout: Duration
    );
    setter!(
        /// Sets the number of race batches.
        max_batches: u32
    );
    setter!(
        /// Sets the readiness polling cadence.
        check_interval: Duration
    );
    setter!(
        /// Sets the hard cutoff for one creation call.
        create_timeout: Duration
    );
    setter!(
        /// Sets the delay between staggered creation calls.
        create_stagger: Duration
    );
    setter!(
        /// Sets the number of SSH failover rounds.
        max_ssh_retries: u32
    );
    setter!(
        /// Sets the remote command check bound.
        ssh_command_timeout: Duration
    );
    setter!(
        /// Sets the liveness probe bound.
        ssh_connect_timeout: Duration
    );
    setter!(
        /// Requires a remote command during readiness polling.
        verify_ssh_with_command: bool
    );

    /// Validates inputs and constructs a [`ProvisionConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when any field violates its constraint.
    pub fn build(self) -> Result<ProvisionConfig, ConfigError> {
        let mut ports = self.ports;
        ports.insert(SSH_PORT);
        let label = self
            .label
            .map(|label| label.trim().to_owned())
            .unwrap_or_else(|| format!("{}-{}", self.label_prefix.trim(), Uuid::new_v4()));
        let config = ProvisionConfig {
            gpu_name: trimmed(self.gpu_name),
            min_gpu_ram: self.min_gpu_ram,
            num_gpus: self.num_gpus,
            max_price: self.max_price,
            machine_type: self.machine_type,
            disk_space: self.disk_space,
            min_inet_down: self.min_inet_down,
            min_reliability: self.min_reliability,
            region: trimmed(self.region),
            image: self.image.trim().to_owned(),
            onstart_cmd: self.onstart_cmd,
            docker_options: self.docker_options,
            ports: ports.into_iter().collect(),
            label,
            batch_size: self.batch_size,
            batch_timeout: self.batch_timeout,
            max_batches: self.max_batches,
            check_interval: self.check_interval,
            create_timeout: self.create_timeout,
            create_stagger: self.create_stagger,
            max_ssh_retries: self.max_ssh_retries,
            ssh_command_timeout: self.ssh_command_timeout,
            ssh_connect_timeout: self.ssh_connect_timeout,
            verify_ssh_with_command: self.verify_ssh_with_command,
        };
        config.validate()?;
        Ok(config)
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|inner| inner.trim().to_owned())
        .filter(|inner| !inner.is_empty())
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a value outside its accepted range.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Offending field.
        field: String,
        /// Actionable description.
        reason: String,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn builder_always_exposes_ssh_port_once() {
        let config = ProvisionConfig::builder()
            .ports([8080, 22, 8080])
            .build()
            .unwrap_or_else(|err| panic!("config should build: {err}"));
        assert_eq!(config.ports, vec![22, 8080]);
    }

    #[test]
    fn builder_generates_prefixed_label() {
        let config = ProvisionConfig::builder()
            .build()
            .unwrap_or_else(|err| panic!("config should build: {err}"));
        let suffix = config
            .label
            .strip_prefix("spotbroker-")
            .unwrap_or_else(|| panic!("unexpected label {}", config.label));
        assert!(Uuid::parse_str(suffix).is_ok());
    }

    #[rstest]
    #[case(ProvisionConfig::builder().batch_size(0), "batch_size")]
    #[case(ProvisionConfig::builder().max_batches(0), "max_batches")]
    #[case(ProvisionConfig::builder().max_ssh_retries(0), "max_ssh_retries")]
    #[case(ProvisionConfig::builder().check_interval(Duration::ZERO), "check_interval")]
    #[case(ProvisionConfig::builder().min_reliability(1.5), "min_reliability")]
    #[case(ProvisionConfig::builder().max_price(0.0), "max_price")]
    fn builder_rejects_invalid_values(#[case] builder: ProvisionConfigBuilder, #[case] expected: &str) {
        let Err(ConfigError::Invalid { field, .. }) = builder.build() else {
            panic!("expected {expected} to be rejected");
        };
        assert_eq!(field, expected);
    }

    #[test]
    fn builder_rejects_blank_image() {
        let result = ProvisionConfig::builder().image("  ").build();
        assert_eq!(
            result.err(),
            Some(ConfigError::MissingField(String::from("image")))
        );
    }

    #[test]
    fn offer_query_copies_matching_constraints() {
        let config = ProvisionConfig::builder()
            .gpu_name(" RTX 4090 ")
            .num_gpus(2)
            .max_price(1.5)
            .machine_type(MachineType::Interruptible)
            .build()
            .unwrap_or_else(|err| panic!("config should build: {err}"));
        let query = config.offer_query();

        assert_eq!(query.gpu_name.as_deref(), Some("RTX 4090"));
        assert_eq!(query.num_gpus, 2);
        assert_eq!(query.machine_type, MachineType::Interruptible);
        assert_eq!(query.max_price.total_cmp(&1.5), std::cmp::Ordering::Equal);
    }

    #[test]
    fn readiness_window_multiplies_batches() {
        let config = ProvisionConfig::builder()
            .batch_timeout(Duration::from_secs(30))
            .max_batches(4)
            .build()
            .unwrap_or_else(|err| panic!("config should build: {err}"));
        assert_eq!(config.readiness_window(), Duration::from_secs(120));
    }

    #[test]
    fn probe_timeout_follows_verification_mode() {
        let builder = ProvisionConfig::builder()
            .ssh_connect_timeout(Duration::from_secs(4))
            .ssh_command_timeout(Duration::from_secs(40));
        let liveness = builder
            .clone()
            .build()
            .unwrap_or_else(|err| panic!("config should build: {err}"));
        let command = builder
            .verify_ssh_with_command(true)
            .build()
            .unwrap_or_else(|err| panic!("config should build: {err}"));

        assert_eq!(liveness.probe_timeout(), Duration::from_secs(4));
        assert_eq!(command.probe_timeout(), Duration::from_secs(40));
    }

    #[test]
    fn defaults_reject_unknown_machine_type() {
        let defaults = ProvisionDefaults {
            machine_type: String::from("reserved"),
            ..ProvisionDefaults::builtin()
        };
        let Err(ConfigError::Invalid { field, reason }) = defaults.validate() else {
            panic!("reserved should be rejected");
        };
        assert_eq!(field, "machine_type");
        assert!(reason.contains("SPOTBROKER_MACHINE_TYPE"));
    }

    #[rstest]
    #[case::zero(0.0)]
    #[case::negative(f64::NEG_INFINITY)]
    #[case::not_a_number(f64::NAN)]
    fn defaults_reject_non_positive_price(#[case] max_price: f64) {
        let defaults = ProvisionDefaults {
            max_price,
            ..ProvisionDefaults::builtin()
        };
        let Err(ConfigError::Invalid { field, reason }) = defaults.validate() else {
            panic!("{max_price} should be rejected");
        };
        assert_eq!(field, "max_price");
        assert!(reason.contains("SPOTBROKER_MAX_PRICE"), "reason: {reason}");
    }

    #[test]
    fn defaults_report_missing_image_with_guidance() {
        let defaults = ProvisionDefaults {
            image: String::new(),
            ..ProvisionDefaults::builtin()
        };
        assert_eq!(
            defaults.validate().err(),
            Some(ConfigError::MissingField(String::from(
                "missing container image: set SPOTBROKER_IMAGE or add image to spotbroker.toml"
            )))
        );
    }
}
