//! Sequential, lowest-cost acquisition.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep, sleep_until, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProvisionConfig;
use crate::provider::{CloudProvider, Offer, ProviderError};
use crate::ssh::SshProbe;

use super::lifecycle::{Ledger, Readiness, check_readiness, destroy_all, is_terminal, run_guarded};
use super::{
    MachineCandidate, Progress, ProgressStatus, ProvisionError, ProvisionResult, ProvisionStats,
    ProvisionStrategy, StrategyFuture,
};

/// Offers a creation is attempted on before giving up.
pub const MAX_CREATE_ATTEMPTS: usize = 5;

/// Pause after a refused creation before trying the next offer.
pub const CREATE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Rents one machine at a time, cheapest reliable offer first.
#[derive(Clone)]
pub struct SingleStrategy {
    probe: Arc<dyn SshProbe>,
}

impl std::fmt::Debug for SingleStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleStrategy").finish_non_exhaustive()
    }
}

impl SingleStrategy {
    /// Creates the strategy around an SSH probe.
    #[must_use]
    pub fn new(probe: Arc<dyn SshProbe>) -> Self {
        Self { probe }
    }

    async fn run(
        &self,
        config: &ProvisionConfig,
        provider: &Arc<dyn CloudProvider>,
        progress: &Progress,
    ) -> ProvisionResult {
        if let Err(err) = config.validate() {
            return ProvisionResult::failure(err.into(), ProvisionStats::default());
        }
        let ledger = Ledger::default();
        let started = Instant::now();
        let cancel = CancellationToken::new();
        let run = SingleRun {
            config: config.clone(),
            provider: Arc::clone(provider),
            probe: Arc::clone(&self.probe),
            progress: progress.clone(),
            ledger: ledger.clone(),
            cancel: cancel.clone(),
            started,
        };
        run_guarded(provider, &ledger, started, cancel, run.execute()).await
    }
}

impl ProvisionStrategy for SingleStrategy {
    fn name(&self) -> &'static str {
        "single"
    }

    fn provision<'a>(
        &'a self,
        config: &'a ProvisionConfig,
        provider: &'a Arc<dyn CloudProvider>,
        progress: &'a Progress,
    ) -> StrategyFuture<'a> {
        Box::pin(self.run(config, provider, progress))
    }
}

/// Orders offers by reliability descending, then price ascending.
pub(crate) fn sort_for_cost(offers: &mut [Offer]) {
    offers.sort_by(|left, right| {
        right
            .reliability
            .partial_cmp(&left.reliability)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                left.dph_total
                    .partial_cmp(&right.dph_total)
                    .unwrap_or(Ordering::Equal)
            })
    });
}

struct SingleRun {
    config: ProvisionConfig,
    provider: Arc<dyn CloudProvider>,
    probe: Arc<dyn SshProbe>,
    progress: Progress,
    ledger: Ledger,
    cancel: CancellationToken,
    started: Instant,
}

impl SingleRun {
    async fn execute(self) -> ProvisionResult {
        self.progress
            .emit(ProgressStatus::Searching, "searching offers", 0);
        let mut offers = self
            .provider
            .search_offers(&self.config.offer_query())
            .await;
        let mut stats = ProvisionStats {
            rounds_attempted: 1,
            ..ProvisionStats::default()
        };
        if offers.is_empty() {
            info!(label = %self.config.label, "no offers match");
            stats.total_time = self.started.elapsed();
            self.progress.emit(ProgressStatus::Failed, "no offers", 100);
            return ProvisionResult::failure(ProvisionError::NoOffers, stats);
        }
        sort_for_cost(&mut offers);

        let mut reasons = Vec::new();
        let Some(mut candidate) = self.create_first(&offers, &mut stats, &mut reasons).await else {
            stats.total_time = self.started.elapsed();
            let error = ProvisionError::CreationExhausted {
                tried: stats.machines_tried,
                reasons,
            };
            self.progress
                .emit(ProgressStatus::Failed, error.to_string(), 100);
            return ProvisionResult::failure(error, stats);
        };
        stats.machines_created = 1;

        self.progress.emit(
            ProgressStatus::Waiting,
            format!("waiting for {}", candidate.instance_id),
            40,
        );
        let deadline = Instant::now() + self.config.readiness_window();
        let ready = tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            waited = timeout_at(deadline, self.wait_ready(&mut candidate)) => waited.unwrap_or(false),
        };
        stats.total_time = self.started.elapsed();

        if ready {
            stats.time_to_ready = candidate.ready_time;
            if let Some(machine) = candidate.clone().into_machine() {
                info!(instance_id = %machine.instance_id, "machine ready");
                self.progress.emit(ProgressStatus::Ready, "machine ready", 100);
                return ProvisionResult::success(machine, stats);
            }
        }

        let waited_secs = stats.total_time.as_secs();
        warn!(
            instance_id = %candidate.instance_id,
            waited_secs,
            "instance never became ready; destroying"
        );
        let cleanup_failures = destroy_all(&self.provider, self.ledger.snapshot()).await;
        stats.total_time = self.started.elapsed();
        let error = if self.cancel.is_cancelled() {
            ProvisionError::Cancelled
        } else {
            ProvisionError::ReadinessTimeout {
                machines_created: stats.machines_created,
                waited_secs,
                instances: vec![candidate.instance_id],
            }
        };
        self.progress
            .emit(ProgressStatus::Failed, error.to_string(), 100);
        ProvisionResult::failure(error, stats).with_cleanup_failures(cleanup_failures)
    }

    async fn create_first(
        &self,
        offers: &[Offer],
        stats: &mut ProvisionStats,
        reasons: &mut Vec<String>,
    ) -> Option<MachineCandidate> {
        for (attempt, offer) in offers.iter().take(MAX_CREATE_ATTEMPTS).enumerate() {
            if attempt > 0 {
                sleep(CREATE_RETRY_DELAY).await;
            }
            if self.cancel.is_cancelled() {
                break;
            }
            stats.machines_tried = stats.machines_tried.saturating_add(1);
            self.progress.emit(
                ProgressStatus::Creating,
                format!("renting offer {} at ${:.3}/h", offer.id, offer.dph_total),
                10,
            );
            let issued = Instant::now();
            let request = self.config.create_request(&offer.id);
            let limit = self.config.create_timeout;
            let reason = match timeout(limit, self.provider.create_instance(&request)).await {
                Ok(Ok(instance_id)) => {
                    self.ledger.record(&instance_id);
                    info!(instance_id = %instance_id, offer_id = %offer.id, "created instance");
                    return Some(MachineCandidate::new(instance_id, offer, issued));
                }
                Ok(Err(err)) => err.to_string(),
                Err(_) => ProviderError::Timeout {
                    operation: String::from("create_instance"),
                    seconds: limit.as_secs(),
                }
                .to_string(),
            };
            warn!(offer_id = %offer.id, attempt, reason = %reason, "creation failed");
            reasons.push(format!("{}: {reason}", offer.id));
        }
        None
    }

    async fn wait_ready(&self, candidate: &mut MachineCandidate) -> bool {
        loop {
            let readiness = check_readiness(
                self.provider.as_ref(),
                self.probe.as_ref(),
                &candidate.instance_id,
                self.config.probe_timeout(),
                self.config.verify_ssh_with_command,
            )
            .await;
            match readiness {
                Readiness::Ready(status) => {
                    candidate.observe(&status);
                    candidate.mark_ready(Instant::now());
                    return true;
                }
                Readiness::NotReady { status, reason } => {
                    candidate.observe(&status);
                    if is_terminal(&status.state) {
                        candidate.mark_failed();
                        return false;
                    }
                    debug!(instance_id = %candidate.instance_id, state = %status.state, reason, "not ready");
                }
            }
            sleep_until(Instant::now() + self.config.check_interval).await;
        }
    }
}
