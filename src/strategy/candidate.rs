//! Per-call bookkeeping for speculatively created instances.

use std::time::Duration;

use tokio::time::Instant;

use crate::provider::{InstanceStatus, Offer, PortMappings};

use super::ProvisionedMachine;

/// Lifecycle of a [`MachineCandidate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CandidateStatus {
    /// The creation call is in flight.
    Provisioning,
    /// Created, waiting for the readiness predicate.
    Waiting,
    /// Passed the readiness predicate.
    Ready,
    /// Reported a terminal state; no longer polled.
    Failed,
}

/// One instance created during a single provisioning call.
///
/// Candidates never outlive the call that created them: each one is either
/// destroyed or promoted into a [`ProvisionedMachine`].
#[derive(Clone, Debug, PartialEq)]
pub struct MachineCandidate {
    /// Provider identifier of the instance.
    pub instance_id: String,
    /// Offer the instance was rented from.
    pub offer_id: String,
    /// GPU model advertised by the offer.
    pub gpu_name: String,
    /// Price per hour advertised by the offer.
    pub dph_total: f64,
    /// Last observed SSH host.
    pub ssh_host: Option<String>,
    /// Last observed SSH port.
    pub ssh_port: Option<u16>,
    /// Last observed public address.
    pub public_ip: Option<String>,
    /// Last observed port table.
    pub port_mappings: PortMappings,
    /// Current status.
    pub status: CandidateStatus,
    /// Whether SSH verification succeeded.
    pub connected: bool,
    /// When the creation call was issued.
    pub provision_start: Instant,
    /// Time from the creation call to verified SSH.
    pub ready_time: Option<Duration>,
}

impl MachineCandidate {
    /// Starts tracking an instance created from `offer`.
    #[must_use]
    pub fn new(instance_id: impl Into<String>, offer: &Offer, provision_start: Instant) -> Self {
        Self {
            instance_id: instance_id.into(),
            offer_id: offer.id.clone(),
            gpu_name: offer.gpu_name.clone(),
            dph_total: offer.dph_total,
            ssh_host: None,
            ssh_port: None,
            public_ip: None,
            port_mappings: PortMappings::new(),
            status: CandidateStatus::Waiting,
            connected: false,
            provision_start,
            ready_time: None,
        }
    }

    /// Starts tracking an instance that already exists, such as a resumed one.
    #[must_use]
    pub fn existing(instance_id: impl Into<String>, provision_start: Instant) -> Self {
        Self {
            instance_id: instance_id.into(),
            offer_id: String::new(),
            gpu_name: String::new(),
            dph_total: 0.0,
            ssh_host: None,
            ssh_port: None,
            public_ip: None,
            port_mappings: PortMappings::new(),
            status: CandidateStatus::Waiting,
            connected: false,
            provision_start,
            ready_time: None,
        }
    }

    /// Copies connection fields from a status snapshot.
    pub fn observe(&mut self, status: &InstanceStatus) {
        if let Some(ref host) = status.ssh_host {
            self.ssh_host = Some(host.clone());
        }
        if status.ssh_port.is_some() {
            self.ssh_port = status.ssh_port;
        }
        if status.public_ip.is_some() {
            self.public_ip.clone_from(&status.public_ip);
        }
        if !status.port_mappings.is_empty() {
            self.port_mappings = status.port_mappings.clone();
        }
        if let Some(ref name) = status.gpu_name {
            self.gpu_name = name.clone();
        }
        if let Some(price) = status.dph_total {
            self.dph_total = price;
        }
    }

    /// Records verified SSH at `now`.
    pub fn mark_ready(&mut self, now: Instant) {
        self.status = CandidateStatus::Ready;
        self.connected = true;
        self.ready_time = Some(now.saturating_duration_since(self.provision_start));
    }

    /// Stops polling this candidate.
    pub const fn mark_failed(&mut self) {
        self.status = CandidateStatus::Failed;
    }

    /// `true` while the candidate should still be polled.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self.status, CandidateStatus::Waiting)
    }

    /// Promotes a ready candidate. Returns `None` until the SSH endpoint is
    /// known.
    #[must_use]
    pub fn into_machine(self) -> Option<ProvisionedMachine> {
        let ssh_host = self.ssh_host?;
        let ssh_port = self.ssh_port?;
        Some(ProvisionedMachine {
            instance_id: self.instance_id,
            ssh_host,
            ssh_port,
            public_ip: self.public_ip,
            gpu_name: Some(self.gpu_name).filter(|name| !name.is_empty()),
            dph_total: Some(self.dph_total).filter(|price| *price > 0.0),
            port_mappings: self.port_mappings,
        })
    }
}
