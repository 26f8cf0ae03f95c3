//! Resuming a paused instance with a racing backup.
//!
//! A paused instance is the cheapest machine to bring back, but resumes on
//! marketplace hosts are unreliable: the host may have been rented out or
//! the container may hang while booting. [`ColdStartStrategy`] resumes the
//! instance and, in parallel or after a grace period, races a fresh backup
//! machine. Whichever verifies first wins and the other is destroyed.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProvisionConfig;
use crate::provider::CloudProvider;
use crate::ssh::SshProbe;

use super::lifecycle::{Readiness, check_readiness, destroy_all};
use super::{
    CleanupFailure, MachineCandidate, Progress, ProgressStatus, ProvisionError, ProvisionResult,
    ProvisionStats, ProvisionStrategy, ProvisionedMachine, RaceStrategy, StrategyFuture,
    test_ssh_connection,
};

/// Timing and verification knobs for [`ColdStartStrategy::resume_with_failover`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResumeOptions {
    /// Launch the backup race immediately instead of after `resume_timeout`.
    pub parallel_backup: bool,
    /// Grace period the resumed instance gets before a deferred backup starts.
    pub resume_timeout: Duration,
    /// Hard bound on the whole call.
    pub total_timeout: Duration,
    /// Polling cadence.
    pub check_interval: Duration,
    /// Bound for each SSH check of the resumed instance.
    pub ssh_timeout: Duration,
    /// Require a remote command on the resumed instance.
    pub verify_ssh_with_command: bool,
}

impl Default for ResumeOptions {
    fn default() -> Self {
        Self {
            parallel_backup: false,
            resume_timeout: Duration::from_secs(120),
            total_timeout: Duration::from_secs(600),
            check_interval: Duration::from_secs(5),
            ssh_timeout: Duration::from_secs(30),
            verify_ssh_with_command: true,
        }
    }
}

/// Resumes paused instances and races a backup machine.
#[derive(Clone)]
pub struct ColdStartStrategy {
    race: RaceStrategy,
    probe: Arc<dyn SshProbe>,
}

impl std::fmt::Debug for ColdStartStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColdStartStrategy").finish_non_exhaustive()
    }
}

enum Winner {
    Original(ProvisionedMachine),
    Backup(ProvisionedMachine),
}

impl ColdStartStrategy {
    /// Creates the strategy around an SSH probe.
    #[must_use]
    pub fn new(probe: Arc<dyn SshProbe>) -> Self {
        Self {
            race: RaceStrategy::new(Arc::clone(&probe)),
            probe,
        }
    }

    /// Resumes `instance_id`, racing a machine built from `backup_config`
    /// when one is supplied.
    ///
    /// The returned `instance_id` tells the caller which machine won. When
    /// the resumed instance wins, an in-flight backup is cancelled and any
    /// machine it produced is destroyed. When the backup wins, the original
    /// instance is destroyed. When neither verifies within
    /// `total_timeout`, the original instance is left paused as it was.
    pub async fn resume_with_failover(
        &self,
        instance_id: &str,
        backup_config: Option<&ProvisionConfig>,
        options: &ResumeOptions,
        provider: &Arc<dyn CloudProvider>,
        progress: &Progress,
    ) -> ProvisionResult {
        let started = Instant::now();
        let mut stats = ProvisionStats {
            rounds_attempted: 1,
            machines_tried: 1,
            machines_created: 1,
            ..ProvisionStats::default()
        };
        if let Some(Err(err)) = backup_config.map(ProvisionConfig::validate) {
            return ProvisionResult::failure(err.into(), stats);
        }

        let cancel = CancellationToken::new();
        let _cancel_on_drop = cancel.clone().drop_guard();
        let total_deadline = started + options.total_timeout;
        let resume_deadline = started + options.resume_timeout;

        progress.emit(ProgressStatus::Resuming, format!("resuming {instance_id}"), 5);
        if provider.resume_instance(instance_id).await {
            info!(instance_id, "resume requested");
        } else {
            warn!(instance_id, "resume request failed; polling anyway");
        }

        let mut backup: Option<JoinHandle<ProvisionResult>> = None;
        let mut backup_error: Option<String> = None;
        let mut cleanup_failures: Vec<CleanupFailure> = Vec::new();
        let mut winner = None;
        let mut ready_time = None;

        let watch = self.watch_original(
            provider,
            MachineCandidate::existing(instance_id, started),
            options,
        );
        tokio::pin!(watch);

        loop {
            if backup.is_none()
                && backup_error.is_none()
                && let Some(config) = backup_config
                && (options.parallel_backup || Instant::now() >= resume_deadline)
            {
                info!(instance_id, parallel = options.parallel_backup, "launching backup race");
                progress.emit(ProgressStatus::Creating, "launching backup machine", 20);
                backup = Some(self.spawn_backup(config, provider, progress, cancel.child_token()));
            }
            let awaiting_launch =
                backup.is_none() && backup_error.is_none() && backup_config.is_some();

            tokio::select! {
                biased;
                (candidate, machine) = &mut watch => {
                    ready_time = candidate.ready_time;
                    winner = Some(Winner::Original(machine));
                    break;
                }
                result = next_backup(&mut backup), if backup.is_some() => {
                    backup = None;
                    stats.absorb(&result.stats);
                    cleanup_failures.extend(result.cleanup_failures);
                    match result.outcome {
                        Ok(machine) => {
                            winner = Some(Winner::Backup(machine));
                            break;
                        }
                        Err(err) => {
                            warn!(instance_id, error = %err, "backup failed");
                            backup_error = Some(err.to_string());
                        }
                    }
                }
                () = sleep_until(resume_deadline), if awaiting_launch => {}
                () = sleep_until(total_deadline) => break,
            }
        }

        cancel.cancel();
        if let Some(mut handle) = backup.take() {
            let result = join_backup(&mut handle).await;
            stats.absorb(&result.stats);
            cleanup_failures.extend(result.cleanup_failures);
            if let Ok(machine) = result.outcome {
                info!(instance_id = %machine.instance_id, "destroying late backup machine");
                cleanup_failures.extend(destroy_all(provider, [machine.instance_id]).await);
            }
        }

        stats.total_time = started.elapsed();
        match winner {
            Some(Winner::Original(machine)) => {
                info!(instance_id, "resumed instance won");
                stats.time_to_ready = ready_time;
                progress.emit(ProgressStatus::Ready, "resumed machine ready", 100);
                ProvisionResult::success(machine, stats).with_cleanup_failures(cleanup_failures)
            }
            Some(Winner::Backup(machine)) => {
                info!(
                    instance_id,
                    backup_instance_id = %machine.instance_id,
                    "backup won; destroying resumed instance"
                );
                cleanup_failures.extend(destroy_all(provider, [instance_id.to_owned()]).await);
                stats.total_time = started.elapsed();
                stats.time_to_ready = Some(stats.total_time);
                progress.emit(ProgressStatus::Ready, "backup machine ready", 100);
                ProvisionResult::success(machine, stats).with_cleanup_failures(cleanup_failures)
            }
            None => {
                warn!(instance_id, "neither resumed instance nor backup became ready");
                let error = ProvisionError::ResumeFailed {
                    instance_id: instance_id.to_owned(),
                    backup: backup_error,
                };
                progress.emit(ProgressStatus::Failed, error.to_string(), 100);
                ProvisionResult::failure(error, stats).with_cleanup_failures(cleanup_failures)
            }
        }
    }

    /// Polls the resumed instance until it passes the readiness check.
    /// Callers bound the wait.
    async fn watch_original(
        &self,
        provider: &Arc<dyn CloudProvider>,
        mut candidate: MachineCandidate,
        options: &ResumeOptions,
    ) -> (MachineCandidate, ProvisionedMachine) {
        let instance_id = candidate.instance_id.clone();
        loop {
            let check = check_readiness(
                provider.as_ref(),
                self.probe.as_ref(),
                &instance_id,
                options.ssh_timeout,
                options.verify_ssh_with_command,
            );
            match check.await {
                Readiness::Ready(status) => {
                    candidate.observe(&status);
                    candidate.mark_ready(Instant::now());
                    if let Some(machine) = candidate.clone().into_machine() {
                        return (candidate, machine);
                    }
                }
                Readiness::NotReady { status, reason } => {
                    candidate.observe(&status);
                    debug!(instance_id, state = %status.state, reason, "resumed instance not ready");
                }
            }
            sleep(options.check_interval).await;
        }
    }

    /// Spawns a race plus remote command check. The task destroys its own
    /// machine when it observes cancellation.
    fn spawn_backup(
        &self,
        config: &ProvisionConfig,
        provider: &Arc<dyn CloudProvider>,
        progress: &Progress,
        cancel: CancellationToken,
    ) -> JoinHandle<ProvisionResult> {
        let race = self.race.clone();
        let probe = Arc::clone(&self.probe);
        let config = config.clone();
        let provider = Arc::clone(provider);
        let progress = progress.clone();
        tokio::spawn(async move {
            let mut result = race
                .provision_until(&config, &provider, &progress, cancel.clone())
                .await;
            let Some((host, port, instance_id)) = result.machine().map(|machine| {
                (machine.ssh_host.clone(), machine.ssh_port, machine.instance_id.clone())
            }) else {
                return result;
            };
            let verified = test_ssh_connection(
                probe.as_ref(),
                &host,
                port,
                config.ssh_command_timeout,
                true,
            )
            .await;
            if verified && !cancel.is_cancelled() {
                return result;
            }
            result
                .cleanup_failures
                .extend(destroy_all(&provider, [instance_id.clone()]).await);
            result.outcome = Err(if verified {
                ProvisionError::Cancelled
            } else {
                ProvisionError::SshVerificationFailed {
                    attempts: 1,
                    failed_instances: vec![instance_id],
                }
            });
            result
        })
    }
}

async fn join_backup(handle: &mut JoinHandle<ProvisionResult>) -> ProvisionResult {
    handle.await.unwrap_or_else(|err| {
        warn!(error = %err, "backup task did not complete");
        ProvisionResult::failure(
            ProvisionError::Internal(err.to_string()),
            ProvisionStats::default(),
        )
    })
}

async fn next_backup(backup: &mut Option<JoinHandle<ProvisionResult>>) -> ProvisionResult {
    match backup.as_mut() {
        Some(handle) => join_backup(handle).await,
        None => std::future::pending().await,
    }
}

impl ProvisionStrategy for ColdStartStrategy {
    fn name(&self) -> &'static str {
        "cold-start"
    }

    fn provision<'a>(
        &'a self,
        config: &'a ProvisionConfig,
        provider: &'a Arc<dyn CloudProvider>,
        progress: &'a Progress,
    ) -> StrategyFuture<'a> {
        self.race.provision(config, provider, progress)
    }
}
