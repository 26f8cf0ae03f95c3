//! Speculative parallel acquisition.
//!
//! Each batch rents several offers at once and keeps whichever instance is
//! first observed to pass the full readiness predicate. Boot time varies
//! far more than offer quality, so the winner is decided by observation
//! order rather than by the order offers were created in.

use std::cmp::Ordering;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, sleep_until, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProvisionConfig;
use crate::provider::{CloudProvider, Offer, ProviderError};
use crate::ssh::SshProbe;

use super::lifecycle::{Ledger, Readiness, check_readiness, destroy_all, is_terminal, run_guarded};
use super::{
    MachineCandidate, Progress, ProgressStatus, ProvisionError, ProvisionResult, ProvisionStats,
    ProvisionStrategy, StrategyFuture, test_ssh_connection,
};

/// Creation calls allowed in flight at once within a batch.
pub const MAX_CONCURRENT_CREATES: usize = 3;

/// Races several candidates per batch and keeps the first ready one.
#[derive(Clone)]
pub struct RaceStrategy {
    probe: Arc<dyn SshProbe>,
}

impl std::fmt::Debug for RaceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaceStrategy").finish_non_exhaustive()
    }
}

impl RaceStrategy {
    /// Creates the strategy around an SSH probe.
    #[must_use]
    pub fn new(probe: Arc<dyn SshProbe>) -> Self {
        Self { probe }
    }

    /// Runs a race that stops early when `cancel` fires. On cancellation
    /// every tracked candidate is destroyed and the result carries
    /// [`ProvisionError::Cancelled`]. Creation calls already in flight are
    /// allowed to return so their instances can be destroyed too.
    pub async fn provision_until(
        &self,
        config: &ProvisionConfig,
        provider: &Arc<dyn CloudProvider>,
        progress: &Progress,
        cancel: CancellationToken,
    ) -> ProvisionResult {
        if let Err(err) = config.validate() {
            return ProvisionResult::failure(err.into(), ProvisionStats::default());
        }
        let ledger = Ledger::default();
        let started = Instant::now();
        let cancel = cancel.child_token();
        let run = RaceRun {
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

    /// Provisions, then proves the winner with a real remote command.
    ///
    /// A winner that fails the command check is destroyed and a brand new
    /// race is started, up to `max_ssh_retries` rounds. Statistics
    /// accumulate across rounds; the failure lists every rejected instance,
    /// including when a replacement round fails to produce a machine.
    pub async fn provision_with_failover(
        &self,
        config: &ProvisionConfig,
        provider: &Arc<dyn CloudProvider>,
        progress: &Progress,
    ) -> ProvisionResult {
        let started = Instant::now();
        let mut stats = ProvisionStats::default();
        let mut cleanup_failures = Vec::new();
        let mut failed_instances = Vec::new();

        for attempt in 1..=config.max_ssh_retries {
            let round = self
                .provision_until(config, provider, progress, CancellationToken::new())
                .await;
            stats.absorb(&round.stats);
            cleanup_failures.extend(round.cleanup_failures);
            let machine = match round.outcome {
                Ok(machine) => machine,
                Err(err) if failed_instances.is_empty() => {
                    stats.total_time = started.elapsed();
                    return ProvisionResult::failure(err, stats)
                        .with_cleanup_failures(cleanup_failures);
                }
                Err(err) => {
                    warn!(attempt, error = %err, "replacement round failed");
                    stats.total_time = started.elapsed();
                    progress.emit(ProgressStatus::Failed, "ssh verification failed", 100);
                    return ProvisionResult::failure(
                        ProvisionError::SshVerificationFailed {
                            attempts: attempt,
                            failed_instances,
                        },
                        stats,
                    )
                    .with_cleanup_failures(cleanup_failures);
                }
            };

            progress.emit(
                ProgressStatus::Verifying,
                format!("verifying ssh on {}", machine.instance_id),
                90,
            );
            if test_ssh_connection(
                self.probe.as_ref(),
                &machine.ssh_host,
                machine.ssh_port,
                config.ssh_command_timeout,
                true,
            )
            .await
            {
                info!(instance_id = %machine.instance_id, attempt, "ssh command check passed");
                stats.total_time = started.elapsed();
                stats.time_to_ready = Some(stats.total_time);
                progress.emit(ProgressStatus::Ready, "machine ready", 100);
                return ProvisionResult::success(machine, stats)
                    .with_cleanup_failures(cleanup_failures);
            }

            warn!(
                instance_id = %machine.instance_id,
                attempt,
                max_attempts = config.max_ssh_retries,
                "ssh command check failed; replacing machine"
            );
            cleanup_failures.extend(destroy_all(provider, [machine.instance_id.clone()]).await);
            failed_instances.push(machine.instance_id);
        }

        stats.total_time = started.elapsed();
        progress.emit(ProgressStatus::Failed, "ssh verification failed", 100);
        ProvisionResult::failure(
            ProvisionError::SshVerificationFailed {
                attempts: config.max_ssh_retries,
                failed_instances,
            },
            stats,
        )
        .with_cleanup_failures(cleanup_failures)
    }
}

impl ProvisionStrategy for RaceStrategy {
    fn name(&self) -> &'static str {
        "race"
    }

    fn provision<'a>(
        &'a self,
        config: &'a ProvisionConfig,
        provider: &'a Arc<dyn CloudProvider>,
        progress: &'a Progress,
    ) -> StrategyFuture<'a> {
        Box::pin(self.provision_until(config, provider, progress, CancellationToken::new()))
    }
}

/// Orders offers by reliability, then bandwidth, best first.
pub(crate) fn sort_for_race(offers: &mut [Offer]) {
    offers.sort_by(|left, right| {
        right
            .reliability
            .partial_cmp(&left.reliability)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                right
                    .inet_down
                    .partial_cmp(&left.inet_down)
                    .unwrap_or(Ordering::Equal)
            })
    });
}

enum CreateOutcome {
    Created(MachineCandidate),
    Failed { offer_id: String, reason: String },
    Skipped,
}

enum BatchOutcome {
    Winner(MachineCandidate),
    TimedOut,
    Cancelled,
}

struct RaceRun {
    config: ProvisionConfig,
    provider: Arc<dyn CloudProvider>,
    probe: Arc<dyn SshProbe>,
    progress: Progress,
    ledger: Ledger,
    cancel: CancellationToken,
    started: Instant,
}

impl RaceRun {
    async fn execute(self) -> ProvisionResult {
        self.progress
            .emit(ProgressStatus::Searching, "searching offers", 0);
        let mut offers = self
            .provider
            .search_offers(&self.config.offer_query())
            .await;
        let mut stats = ProvisionStats::default();
        if offers.is_empty() {
            info!(label = %self.config.label, "no offers match");
            stats.total_time = self.started.elapsed();
            self.progress.emit(ProgressStatus::Failed, "no offers", 100);
            return ProvisionResult::failure(ProvisionError::NoOffers, stats);
        }
        sort_for_race(&mut offers);
        info!(offers = offers.len(), label = %self.config.label, "found offers");

        let max_batches = usize::try_from(self.config.max_batches).unwrap_or(usize::MAX);
        let mut reasons = Vec::new();
        let mut winner = None;
        let mut cancelled = false;

        for (batch, chunk) in offers
            .chunks(self.config.batch_size)
            .take(max_batches)
            .enumerate()
        {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            stats.rounds_attempted = stats.rounds_attempted.saturating_add(1);
            stats.machines_tried = stats
                .machines_tried
                .saturating_add(u32::try_from(chunk.len()).unwrap_or(u32::MAX));
            self.progress.emit(
                ProgressStatus::Creating,
                format!("creating {} instances (batch {})", chunk.len(), batch + 1),
                batch_percent(batch, max_batches, 10),
            );

            let candidates = self.create_batch(batch, chunk, &mut reasons).await;
            stats.machines_created = self.ledger.len();
            if candidates.is_empty() {
                warn!(batch, "no instance could be created in batch");
                continue;
            }

            self.progress.emit(
                ProgressStatus::Waiting,
                format!("waiting for {} instances (batch {})", candidates.len(), batch + 1),
                batch_percent(batch, max_batches, 40),
            );
            match self.poll_batch(batch, candidates).await {
                BatchOutcome::Winner(candidate) => {
                    winner = Some(candidate);
                    break;
                }
                BatchOutcome::TimedOut => {
                    info!(batch, timeout_secs = self.config.batch_timeout.as_secs(), "batch timed out");
                }
                BatchOutcome::Cancelled => {
                    cancelled = true;
                    break;
                }
            }
        }

        stats.machines_created = self.ledger.len();
        let created = self.ledger.snapshot();
        let machine = winner.and_then(|candidate| {
            stats.time_to_ready = candidate.ready_time;
            candidate.into_machine()
        });
        let winner_id = machine.as_ref().map(|found| found.instance_id.as_str());
        let losers = created
            .iter()
            .filter(|id| winner_id != Some(id.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        let cleanup_failures = destroy_all(&self.provider, losers).await;
        stats.total_time = self.started.elapsed();

        let result = match machine {
            Some(machine) => {
                info!(
                    instance_id = %machine.instance_id,
                    ssh_host = %machine.ssh_host,
                    ssh_port = machine.ssh_port,
                    "race won"
                );
                self.progress.emit(ProgressStatus::Ready, "machine ready", 100);
                ProvisionResult::success(machine, stats)
            }
            None => {
                let error = if cancelled {
                    ProvisionError::Cancelled
                } else if created.is_empty() {
                    ProvisionError::CreationExhausted {
                        tried: stats.machines_tried,
                        reasons,
                    }
                } else {
                    ProvisionError::ReadinessTimeout {
                        machines_created: stats.machines_created,
                        waited_secs: stats.total_time.as_secs(),
                        instances: created,
                    }
                };
                self.progress
                    .emit(ProgressStatus::Failed, error.to_string(), 100);
                ProvisionResult::failure(error, stats)
            }
        };
        result.with_cleanup_failures(cleanup_failures)
    }

    async fn create_batch(
        &self,
        batch: usize,
        offers: &[Offer],
        reasons: &mut Vec<String>,
    ) -> Vec<MachineCandidate> {
        let permits = Arc::new(Semaphore::new(MAX_CONCURRENT_CREATES));
        let mut tasks = JoinSet::new();
        for (slot, offer) in offers.iter().cloned().enumerate() {
            let request = self.config.create_request(&offer.id);
            let provider = Arc::clone(&self.provider);
            let ledger = self.ledger.clone();
            let permits = Arc::clone(&permits);
            let cancel = self.cancel.clone();
            let stagger = self
                .config
                .create_stagger
                .saturating_mul(u32::try_from(slot).unwrap_or(u32::MAX));
            let limit = self.config.create_timeout;
            tasks.spawn(async move {
                tokio::select! {
                    () = cancel.cancelled() => return CreateOutcome::Skipped,
                    () = sleep(stagger) => {}
                }
                let Ok(_permit) = permits.acquire_owned().await else {
                    return CreateOutcome::Skipped;
                };
                if cancel.is_cancelled() {
                    return CreateOutcome::Skipped;
                }
                let issued = Instant::now();
                match timeout(limit, provider.create_instance(&request)).await {
                    Ok(Ok(instance_id)) => {
                        ledger.record(&instance_id);
                        CreateOutcome::Created(MachineCandidate::new(instance_id, &offer, issued))
                    }
                    Ok(Err(err)) => CreateOutcome::Failed {
                        offer_id: offer.id,
                        reason: err.to_string(),
                    },
                    Err(_) => CreateOutcome::Failed {
                        offer_id: offer.id,
                        reason: ProviderError::Timeout {
                            operation: String::from("create_instance"),
                            seconds: limit.as_secs(),
                        }
                        .to_string(),
                    },
                }
            });
        }

        let mut candidates = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(CreateOutcome::Created(candidate)) => {
                    info!(
                        batch,
                        instance_id = %candidate.instance_id,
                        offer_id = %candidate.offer_id,
                        "created candidate"
                    );
                    candidates.push(candidate);
                }
                Ok(CreateOutcome::Failed { offer_id, reason }) => {
                    warn!(batch, offer_id = %offer_id, reason = %reason, "creation failed");
                    reasons.push(format!("{offer_id}: {reason}"));
                }
                Ok(CreateOutcome::Skipped) => debug!(batch, "creation skipped after cancellation"),
                Err(err) => {
                    warn!(batch, error = %err, "creation task did not complete");
                    reasons.push(err.to_string());
                }
            }
        }
        candidates
    }

    async fn poll_batch(&self, batch: usize, mut candidates: Vec<MachineCandidate>) -> BatchOutcome {
        let deadline = Instant::now() + self.config.batch_timeout;
        loop {
            if Instant::now() >= deadline || !candidates.iter().any(MachineCandidate::is_live) {
                return BatchOutcome::TimedOut;
            }
            let tick = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return BatchOutcome::Cancelled,
                checked = timeout_at(deadline, self.check_candidates(&mut candidates)) => checked,
            };
            match tick {
                Ok(Some(index)) if index < candidates.len() => {
                    return BatchOutcome::Winner(candidates.swap_remove(index));
                }
                Ok(_) => {}
                Err(_) => return BatchOutcome::TimedOut,
            }
            debug!(batch, live = candidates.iter().filter(|c| c.is_live()).count(), "no candidate ready yet");
            let next = (Instant::now() + self.config.check_interval).min(deadline);
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return BatchOutcome::Cancelled,
                () = sleep_until(next) => {}
            }
        }
    }

    /// Checks every live candidate in parallel. Returns the index of the
    /// first candidate observed ready and aborts the remaining checks.
    async fn check_candidates(&self, candidates: &mut [MachineCandidate]) -> Option<usize> {
        let mut checks = JoinSet::new();
        for (index, candidate) in candidates.iter().enumerate() {
            if !candidate.is_live() {
                continue;
            }
            let provider = Arc::clone(&self.provider);
            let probe = Arc::clone(&self.probe);
            let instance_id = candidate.instance_id.clone();
            let probe_timeout = self.config.probe_timeout();
            let run_command = self.config.verify_ssh_with_command;
            checks.spawn(async move {
                let readiness = check_readiness(
                    provider.as_ref(),
                    probe.as_ref(),
                    &instance_id,
                    probe_timeout,
                    run_command,
                )
                .await;
                (index, readiness)
            });
        }

        while let Some(joined) = checks.join_next().await {
            let Ok((index, readiness)) = joined else {
                continue;
            };
            let Some(candidate) = candidates.get_mut(index) else {
                continue;
            };
            match readiness {
                Readiness::Ready(status) => {
                    candidate.observe(&status);
                    candidate.mark_ready(Instant::now());
                    checks.abort_all();
                    return Some(index);
                }
                Readiness::NotReady { status, reason } => {
                    candidate.observe(&status);
                    if is_terminal(&status.state) {
                        warn!(
                            instance_id = %candidate.instance_id,
                            state = %status.state,
                            "candidate stopped; no longer polling"
                        );
                        candidate.mark_failed();
                    } else {
                        debug!(instance_id = %candidate.instance_id, state = %status.state, reason, "candidate not ready");
                    }
                }
            }
        }
        None
    }
}

fn batch_percent(batch: usize, max_batches: usize, offset: usize) -> u8 {
    let span = 90_usize.checked_div(max_batches.max(1)).unwrap_or(90);
    let percent = span.saturating_mul(batch).saturating_add(offset.min(span));
    u8::try_from(percent.min(99)).unwrap_or(99)
}
