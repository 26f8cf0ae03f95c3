//! Provisioning facade.
//!
//! [`MachineProvisioner`] owns the marketplace client and the SSH probe,
//! resolves a strategy for each request and adds the SSH failover and cold
//! start workflows on top. It is cheap to clone and safe to share between
//! concurrent requests; no state crosses calls.

use std::sync::Arc;

use tracing::info;

use crate::config::{ConfigError, ProvisionConfig, ProvisionDefaults};
use crate::janitor::Janitor;
use crate::provider::CloudProvider;
use crate::ssh::SshProbe;
use crate::strategy::{
    ColdStartStrategy, Progress, ProvisionResult, ProvisionStats, ProvisionStrategy, RaceStrategy,
    ResumeOptions, Strategy, StrategyKind,
};

/// Price ceiling used by [`MachineProvisioner::provision_fast`].
pub const FAST_MAX_PRICE: f64 = 2.0;

/// Batch size used by [`MachineProvisioner::provision_fast`].
pub const FAST_BATCH_SIZE: usize = 5;

/// Price ceiling used by [`MachineProvisioner::provision_cheap`].
pub const CHEAP_MAX_PRICE: f64 = 0.5;

/// Entry point for every provisioning workflow.
#[derive(Clone)]
pub struct MachineProvisioner {
    provider: Arc<dyn CloudProvider>,
    probe: Arc<dyn SshProbe>,
    defaults: ProvisionDefaults,
}

impl std::fmt::Debug for MachineProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineProvisioner")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl MachineProvisioner {
    /// Creates a provisioner with [`ProvisionDefaults::builtin`].
    #[must_use]
    pub fn new(provider: Arc<dyn CloudProvider>, probe: Arc<dyn SshProbe>) -> Self {
        Self {
            provider,
            probe,
            defaults: ProvisionDefaults::builtin(),
        }
    }

    /// Replaces the defaults used by the convenience wrappers.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `defaults` fail validation.
    pub fn with_defaults(mut self, defaults: ProvisionDefaults) -> Result<Self, ConfigError> {
        defaults.validate()?;
        self.defaults = defaults;
        Ok(self)
    }

    /// The marketplace client.
    #[must_use]
    pub const fn provider(&self) -> &Arc<dyn CloudProvider> {
        &self.provider
    }

    /// The defaults used by the convenience wrappers.
    #[must_use]
    pub const fn defaults(&self) -> &ProvisionDefaults {
        &self.defaults
    }

    /// Resolves the strategy for `kind`.
    #[must_use]
    pub fn strategy(&self, kind: StrategyKind) -> Strategy {
        Strategy::new(kind, Arc::clone(&self.probe))
    }

    /// Provisions one machine with the selected strategy.
    pub async fn provision(
        &self,
        config: &ProvisionConfig,
        kind: StrategyKind,
        progress: &Progress,
    ) -> ProvisionResult {
        let strategy = self.strategy(kind);
        info!(strategy = strategy.name(), label = %config.label, "provisioning");
        strategy.provision(config, &self.provider, progress).await
    }

    /// Races a machine and proves it with a remote command, replacing
    /// machines that fail the check up to `max_ssh_retries` times.
    pub async fn provision_with_failover(
        &self,
        config: &ProvisionConfig,
        progress: &Progress,
    ) -> ProvisionResult {
        RaceStrategy::new(Arc::clone(&self.probe))
            .provision_with_failover(config, &self.provider, progress)
            .await
    }

    /// Resumes a paused instance, racing a backup built from
    /// `backup_config` when one is given.
    pub async fn resume_with_failover(
        &self,
        instance_id: &str,
        backup_config: Option<&ProvisionConfig>,
        options: &ResumeOptions,
        progress: &Progress,
    ) -> ProvisionResult {
        ColdStartStrategy::new(Arc::clone(&self.probe))
            .resume_with_failover(instance_id, backup_config, options, &self.provider, progress)
            .await
    }

    /// Races up to five offers at a generous price ceiling.
    pub async fn provision_fast(
        &self,
        gpu_name: &str,
        num_gpus: u32,
        progress: &Progress,
    ) -> ProvisionResult {
        let config = self
            .defaults
            .builder()
            .gpu_name(gpu_name)
            .num_gpus(num_gpus)
            .max_price(FAST_MAX_PRICE)
            .batch_size(FAST_BATCH_SIZE)
            .build();
        self.provision_built(config, StrategyKind::Race, progress)
            .await
    }

    /// Rents the cheapest reliable offer under a tight price ceiling.
    pub async fn provision_cheap(
        &self,
        gpu_name: &str,
        num_gpus: u32,
        progress: &Progress,
    ) -> ProvisionResult {
        let config = self
            .defaults
            .builder()
            .gpu_name(gpu_name)
            .num_gpus(num_gpus)
            .max_price(CHEAP_MAX_PRICE)
            .build();
        self.provision_built(config, StrategyKind::Single, progress)
            .await
    }

    /// A janitor sharing this provisioner's marketplace client.
    #[must_use]
    pub fn janitor(&self) -> Janitor {
        Janitor::new(Arc::clone(&self.provider))
    }

    async fn provision_built(
        &self,
        config: Result<ProvisionConfig, ConfigError>,
        kind: StrategyKind,
        progress: &Progress,
    ) -> ProvisionResult {
        match config {
            Ok(built) => self.provision(&built, kind, progress).await,
            Err(err) => ProvisionResult::failure(err.into(), ProvisionStats::default()),
        }
    }
}
