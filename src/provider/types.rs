//! Value types exchanged with the marketplace.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ProviderError;

/// Billing model requested from the marketplace.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MachineType {
    /// Guaranteed capacity billed at the listed on-demand price.
    #[default]
    OnDemand,
    /// Spot capacity that the host may reclaim at any time.
    Interruptible,
}

impl MachineType {
    /// Returns the marketplace spelling of the machine type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OnDemand => "on-demand",
            Self::Interruptible => "interruptible",
        }
    }
}

impl fmt::Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MachineType {
    type Err = ProviderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "on-demand" | "on_demand" | "ondemand" => Ok(Self::OnDemand),
            "interruptible" | "spot" | "bid" => Ok(Self::Interruptible),
            other => Err(ProviderError::Unsupported(format!("machine type '{other}'"))),
        }
    }
}

/// A marketplace listing for a machine configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Offer {
    /// Provider identifier of the offer.
    pub id: String,
    /// GPU model name (for example `RTX 4090`).
    pub gpu_name: String,
    /// Number of GPUs on the machine.
    #[serde(default = "one")]
    pub num_gpus: u32,
    /// Memory per GPU in gigabytes.
    #[serde(default)]
    pub gpu_ram: f64,
    /// Total price per hour, storage and bandwidth included.
    pub dph_total: f64,
    /// Download bandwidth in Mbps.
    #[serde(default)]
    pub inet_down: f64,
    /// Provider supplied 0–1 reliability score.
    #[serde(default, alias = "reliability2", alias = "reliability_score")]
    pub reliability: f64,
    /// Free-form location string (for example `Sweden, SE`).
    #[serde(default)]
    pub geolocation: Option<String>,
}

const fn one() -> u32 {
    1
}

/// Matching constraints sent to the offer search endpoint.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OfferQuery {
    /// Exact GPU model match, when set.
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
    /// Region filter, matched against the offer geolocation.
    pub region: Option<String>,
}

impl OfferQuery {
    /// Returns `true` when `offer` satisfies every constraint.
    ///
    /// Bindings whose search endpoint filters loosely can use this to drop
    /// offers before handing them to a strategy.
    #[must_use]
    pub fn matches(&self, offer: &Offer) -> bool {
        let gpu_ok = self
            .gpu_name
            .as_deref()
            .is_none_or(|name| name.eq_ignore_ascii_case(&offer.gpu_name));
        let region_ok = self.region.as_deref().is_none_or(|region| {
            offer
                .geolocation
                .as_deref()
                .is_some_and(|geo| geo.to_ascii_lowercase().contains(&region.to_ascii_lowercase()))
        });
        gpu_ok
            && region_ok
            && offer.num_gpus == self.num_gpus
            && offer.gpu_ram >= self.min_gpu_ram
            && offer.dph_total <= self.max_price
            && offer.inet_down >= self.min_inet_down
            && offer.reliability >= self.min_reliability
    }
}

/// Parameters for creating an instance from an offer.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CreateInstanceRequest {
    /// Offer to rent.
    pub offer_id: String,
    /// Container image to launch.
    pub image: String,
    /// Disk size in gigabytes.
    pub disk_space: f64,
    /// Container ports to expose; always includes 22.
    pub ports: Vec<u16>,
    /// Command run when the container starts.
    pub onstart_cmd: Option<String>,
    /// Extra options passed to the container runtime.
    pub docker_options: Option<String>,
    /// Tag used to find the instance later.
    pub label: String,
}

/// Lifecycle state reported by the marketplace.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(from = "String", into = "String")]
pub enum InstanceState {
    /// Accepted but not yet scheduled on the host.
    Created,
    /// Image is being pulled or the container is booting.
    Loading,
    /// Container is up.
    Running,
    /// Container is stopped (paused instances report this).
    Exited,
    /// Host is unreachable.
    Offline,
    /// Any state this crate does not model.
    Unknown(String),
    /// Sentinel returned when the status could not be fetched.
    Error(String),
}

impl InstanceState {
    /// Returns `true` when the provider reports the container as running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns `true` for the error sentinel.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl From<String> for InstanceState {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "created" | "scheduling" => Self::Created,
            "loading" | "starting" | "booting" => Self::Loading,
            "running" => Self::Running,
            "exited" | "stopped" => Self::Exited,
            "offline" => Self::Offline,
            _ => Self::Unknown(value),
        }
    }
}

impl From<InstanceState> for String {
    fn from(value: InstanceState) -> Self {
        value.to_string()
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Loading => f.write_str("loading"),
            Self::Running => f.write_str("running"),
            Self::Exited => f.write_str("exited"),
            Self::Offline => f.write_str("offline"),
            Self::Unknown(raw) => f.write_str(raw),
            Self::Error(message) => write!(f, "error: {message}"),
        }
    }
}

/// One host binding for a container port.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PortBinding {
    /// Host interface, usually `0.0.0.0`.
    #[serde(rename = "HostIp", default)]
    pub host_ip: Option<String>,
    /// Host port as reported by the provider.
    #[serde(rename = "HostPort")]
    pub host_port: String,
}

/// Docker style port table keyed by `"<port>/<proto>"`.
///
/// Ports that exist but are not mapped yet carry `None`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PortMappings(BTreeMap<String, Option<Vec<PortBinding>>>);

impl PortMappings {
    /// Creates an empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Adds a TCP binding from `container_port` to `host_port`.
    pub fn insert_tcp(&mut self, container_port: u16, host_port: u16) {
        let bindings = self
            .0
            .entry(format!("{container_port}/tcp"))
            .or_insert_with(|| Some(Vec::new()));
        bindings.get_or_insert_with(Vec::new).push(PortBinding {
            host_ip: Some(String::from("0.0.0.0")),
            host_port: host_port.to_string(),
        });
    }

    /// Returns the bindings stored under `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&[PortBinding]> {
        self.0.get(key).and_then(Option::as_deref)
    }

    /// Returns `true` when no ports are listed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Status snapshot of a single instance.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct InstanceStatus {
    /// Lifecycle state.
    #[serde(rename = "actual_status", alias = "status")]
    pub state: InstanceState,
    /// SSH host (proxy or direct), absent until the instance is scheduled.
    #[serde(default)]
    pub ssh_host: Option<String>,
    /// SSH port on `ssh_host`.
    #[serde(default)]
    pub ssh_port: Option<u16>,
    /// Public address of the host machine.
    #[serde(default)]
    pub public_ip: Option<String>,
    /// Container port table.
    #[serde(default, rename = "ports")]
    pub port_mappings: PortMappings,
    /// GPU model reported for the instance.
    #[serde(default)]
    pub gpu_name: Option<String>,
    /// Price per hour reported for the instance.
    #[serde(default)]
    pub dph_total: Option<f64>,
}

impl InstanceStatus {
    /// Status carrying only a state, every connection field absent.
    #[must_use]
    pub const fn bare(state: InstanceState) -> Self {
        Self {
            state,
            ssh_host: None,
            ssh_port: None,
            public_ip: None,
            port_mappings: PortMappings::new(),
            gpu_name: None,
            dph_total: None,
        }
    }

    /// Error sentinel returned when the status could not be fetched.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::bare(InstanceState::Error(message.into()))
    }

    /// Returns the SSH host and port when both are populated.
    #[must_use]
    pub fn ssh_endpoint(&self) -> Option<(&str, u16)> {
        let host = self.ssh_host.as_deref().filter(|host| !host.trim().is_empty())?;
        let port = self.ssh_port.filter(|port| *port != 0)?;
        Some((host, port))
    }
}

/// Minimal listing entry used for label based sweeps.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct InstanceSummary {
    /// Provider identifier of the instance.
    pub id: String,
    /// Label attached at creation time.
    #[serde(default)]
    pub label: Option<String>,
    /// Lifecycle state.
    #[serde(rename = "actual_status", alias = "status")]
    pub state: InstanceState,
}
