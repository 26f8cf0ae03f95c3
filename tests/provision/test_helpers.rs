//! Shared fixtures for provisioning BDD scenarios.

use std::sync::Arc;
use std::time::Duration;

use rstest::fixture;
use spotbroker::test_support::{InstanceScript, ScriptedMarketplace, ScriptedProbe, scripted_offer};
use spotbroker::{CloudProvider, MachineProvisioner, ProvisionConfig, ProvisionResult};
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};

pub const LABEL: &str = "spotbroker-bdd";

#[derive(Clone, Debug)]
pub struct ProvisionContext {
    pub market: ScriptedMarketplace,
    pub probe: ScriptedProbe,
    pub paused: Option<String>,
    pub outcome: Option<Outcome>,
}

/// What a `when` step observed, measured on the paused scenario clock.
#[derive(Clone, Debug)]
pub struct Outcome {
    pub result: ProvisionResult,
    pub elapsed: Duration,
    pub creation_offsets: Vec<(String, Duration)>,
}

#[derive(Debug, Error)]
pub enum ProvisionTestError {
    #[error("invalid scenario fixture: {0}")]
    Fixture(String),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[fixture]
pub fn provision_context() -> ProvisionContext {
    ProvisionContext {
        market: ScriptedMarketplace::new(),
        probe: ScriptedProbe::always(true),
        paused: None,
        outcome: None,
    }
}

impl ProvisionContext {
    pub fn add_offer(&self, id: &str, reliability: f64, script: InstanceScript) {
        self.market
            .add_offer(scripted_offer(id, reliability, 0.5), script);
    }

    pub fn provisioner(&self) -> MachineProvisioner {
        let provider: Arc<dyn CloudProvider> = Arc::new(self.market.clone());
        MachineProvisioner::new(provider, Arc::new(self.probe.clone()))
    }

    pub fn outcome(&self) -> Result<&Outcome, ProvisionTestError> {
        self.outcome
            .as_ref()
            .ok_or_else(|| ProvisionTestError::Assertion(String::from("missing outcome")))
    }
}

/// A current-thread runtime whose clock only advances while every task is
/// idle, so scripted boot times resolve instantly.
pub fn paused_runtime() -> Result<Runtime, ProvisionTestError> {
    Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .map_err(|err| ProvisionTestError::Fixture(err.to_string()))
}

pub fn scenario_config(stagger: Duration) -> Result<ProvisionConfig, ProvisionTestError> {
    ProvisionConfig::builder()
        .gpu_name("RTX 4090")
        .label(LABEL)
        .batch_size(3)
        .max_batches(1)
        .batch_timeout(Duration::from_secs(20))
        .check_interval(Duration::from_secs(1))
        .create_stagger(stagger)
        .build()
        .map_err(|err| ProvisionTestError::Fixture(err.to_string()))
}
