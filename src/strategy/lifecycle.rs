//! Shared instance lifecycle helpers: the per-call ledger, readiness
//! checks, best-effort teardown and the panic boundary.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::provider::{CloudProvider, InstanceState, InstanceStatus};
use crate::ssh::SshProbe;

use super::{CleanupFailure, ProvisionError, ProvisionResult, ProvisionStats, test_ssh_connection};

/// Every instance id created during one call, recorded as soon as the
/// creation call returns.
#[derive(Clone, Debug, Default)]
pub(crate) struct Ledger(Arc<Mutex<Vec<String>>>);

impl Ledger {
    pub(crate) fn record(&self, instance_id: &str) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(instance_id.to_owned());
    }

    pub(crate) fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn len(&self) -> u32 {
        let count = self.0.lock().unwrap_or_else(PoisonError::into_inner).len();
        u32::try_from(count).unwrap_or(u32::MAX)
    }
}

/// Destroys every instance concurrently. Failures are logged and returned,
/// never raised.
pub(crate) async fn destroy_all(
    provider: &Arc<dyn CloudProvider>,
    instance_ids: impl IntoIterator<Item = String>,
) -> Vec<CleanupFailure> {
    let pending: BTreeSet<String> = instance_ids.into_iter().collect();
    if pending.is_empty() {
        return Vec::new();
    }

    let mut tasks = JoinSet::new();
    for instance_id in pending.iter().cloned() {
        let client = Arc::clone(provider);
        tasks.spawn(async move {
            let outcome = client.destroy_instance(&instance_id).await;
            (instance_id, outcome)
        });
    }

    let mut failures = Vec::new();
    let mut settled = BTreeSet::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((instance_id, Ok(()))) => {
                debug!(instance_id = %instance_id, "destroyed instance");
                settled.insert(instance_id);
            }
            Ok((instance_id, Err(err))) => {
                warn!(instance_id = %instance_id, error = %err, "failed to destroy instance");
                failures.push(CleanupFailure {
                    instance_id: instance_id.clone(),
                    message: err.to_string(),
                });
                settled.insert(instance_id);
            }
            Err(err) => warn!(error = %err, "destroy task did not complete"),
        }
    }

    failures.extend(
        pending
            .into_iter()
            .filter(|instance_id| !settled.contains(instance_id))
            .map(|instance_id| CleanupFailure {
                instance_id,
                message: String::from("destroy task did not complete"),
            }),
    );
    failures
}

/// Result of one readiness check.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Readiness {
    /// Running, endpoint known, probe passed.
    Ready(InstanceStatus),
    /// Some stage of the predicate failed.
    NotReady {
        status: InstanceStatus,
        reason: &'static str,
    },
}

/// Evaluates the full readiness predicate: provider reports running, SSH
/// host and port are present, and the probe succeeds.
pub(crate) async fn check_readiness(
    provider: &dyn CloudProvider,
    probe: &dyn SshProbe,
    instance_id: &str,
    probe_timeout: Duration,
    run_command: bool,
) -> Readiness {
    let status = provider.get_instance_status(instance_id).await;
    if !status.state.is_running() {
        return Readiness::NotReady {
            status,
            reason: "not running",
        };
    }
    let Some((host, port)) = status.ssh_endpoint() else {
        return Readiness::NotReady {
            status,
            reason: "ssh endpoint not published",
        };
    };
    if test_ssh_connection(probe, host, port, probe_timeout, run_command).await {
        Readiness::Ready(status)
    } else {
        Readiness::NotReady {
            status,
            reason: "ssh probe failed",
        }
    }
}

/// States after which an instance will not become ready on its own.
pub(crate) const fn is_terminal(state: &InstanceState) -> bool {
    matches!(state, InstanceState::Exited | InstanceState::Offline)
}

/// Runs a strategy body on its own task. If the body panics, every id in
/// `ledger` is destroyed and a failure result is returned.
///
/// `cancel` is the token the body observes. It fires when the returned
/// future is dropped, and a machine the body still produces afterwards is
/// destroyed instead of being handed to nobody.
pub(crate) async fn run_guarded<F>(
    provider: &Arc<dyn CloudProvider>,
    ledger: &Ledger,
    started: Instant,
    cancel: CancellationToken,
    body: F,
) -> ProvisionResult
where
    F: Future<Output = ProvisionResult> + Send + 'static,
{
    let _cancel_on_drop = cancel.clone().drop_guard();
    let task_provider = Arc::clone(provider);
    let task = tokio::spawn(async move {
        let result = body.await;
        if cancel.is_cancelled() {
            discard(&task_provider, result).await
        } else {
            result
        }
    });
    match task.await {
        Ok(result) => result,
        Err(err) => {
            error!(error = %err, "provisioning task failed; destroying tracked instances");
            let created = ledger.snapshot();
            let stats = ProvisionStats {
                rounds_attempted: 1,
                machines_tried: ledger.len(),
                machines_created: ledger.len(),
                total_time: started.elapsed(),
                time_to_ready: None,
            };
            let failures = destroy_all(provider, created).await;
            ProvisionResult::failure(ProvisionError::Internal(err.to_string()), stats)
                .with_cleanup_failures(failures)
        }
    }
}

/// Destroys the machine of a cancelled call.
async fn discard(provider: &Arc<dyn CloudProvider>, mut result: ProvisionResult) -> ProvisionResult {
    if let Ok(machine) = &result.outcome {
        warn!(instance_id = %machine.instance_id, "call cancelled after a machine was ready; destroying it");
        let failures = destroy_all(provider, [machine.instance_id.clone()]).await;
        result.cleanup_failures.extend(failures);
        result.outcome = Err(ProvisionError::Cancelled);
        result.stats.time_to_ready = None;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::PortMappings;
    use crate::strategy::ProvisionedMachine;
    use crate::test_support::{ScriptedMarketplace, ScriptedProbe};

    #[tokio::test]
    async fn destroy_all_deduplicates_and_reports_failures() {
        let market = ScriptedMarketplace::new();
        market.fail_destroy("2");
        let provider: Arc<dyn CloudProvider> = Arc::new(market.clone());

        let failures = destroy_all(
            &provider,
            [String::from("1"), String::from("2"), String::from("1")],
        )
        .await;

        assert_eq!(market.destroy_calls("1"), 1);
        assert_eq!(
            failures
                .iter()
                .map(|failure| failure.instance_id.as_str())
                .collect::<Vec<_>>(),
            ["2"]
        );
    }

    #[tokio::test]
    async fn readiness_requires_published_endpoint() {
        let market = ScriptedMarketplace::new();
        let instance_id = market.add_running_instance_without_endpoint();
        let probe = ScriptedProbe::always(true);

        let readiness =
            check_readiness(&market, &probe, &instance_id, Duration::from_secs(5), false).await;

        assert!(matches!(
            readiness,
            Readiness::NotReady {
                reason: "ssh endpoint not published",
                ..
            }
        ));
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test]
    async fn guarded_panic_destroys_ledger() {
        let market = ScriptedMarketplace::new();
        let provider: Arc<dyn CloudProvider> = Arc::new(market.clone());
        let ledger = Ledger::default();
        ledger.record("55");
        let body_ledger = ledger.clone();

        let cancel = CancellationToken::new();
        let result = run_guarded(&provider, &ledger, Instant::now(), cancel, async move {
            assert!(body_ledger.len() > 1, "strategy bug");
            ProvisionResult::failure(ProvisionError::NoOffers, ProvisionStats::default())
        })
        .await;

        assert!(matches!(result.error(), Some(ProvisionError::Internal(_))));
        assert_eq!(market.destroy_calls("55"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_call_destroys_the_machine_its_body_still_produces() {
        let market = ScriptedMarketplace::new();
        let instance_id = market.add_labelled_instance("dropped");
        let provider: Arc<dyn CloudProvider> = Arc::new(market.clone());
        let ledger = Ledger::default();
        let machine = ProvisionedMachine {
            instance_id: instance_id.clone(),
            ssh_host: String::from("ssh.scripted.test"),
            ssh_port: 22,
            public_ip: None,
            gpu_name: None,
            dph_total: None,
            port_mappings: PortMappings::default(),
        };

        let call = run_guarded(
            &provider,
            &ledger,
            Instant::now(),
            CancellationToken::new(),
            async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                ProvisionResult::success(machine, ProvisionStats::default())
            },
        );
        assert!(tokio::time::timeout(Duration::from_secs(1), call).await.is_err());
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(market.destroy_calls(&instance_id), 1);
        assert!(market.destroyed_instances().contains(&instance_id));
    }
}
