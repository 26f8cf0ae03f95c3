//! Test support utilities shared across unit and integration tests.
//!
//! [`ScriptedMarketplace`] is an in-memory [`CloudProvider`] whose instances
//! follow scripted timelines measured on the Tokio clock, so tests run under
//! `#[tokio::test(start_paused = true)]` and exercise real timeouts without
//! waiting for them.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{Instant, sleep};

use crate::provider::{
    ApiError, CloudProvider, CreateInstanceRequest, InstanceState, InstanceStatus,
    InstanceSummary, Offer, OfferQuery, PortMappings, ProviderError, ProviderFuture,
};
use crate::ssh::{CommandOutput, CommandRunner, ProbeFuture, RunnerFuture, SshError, SshProbe};

fn lock<T>(mutex: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builds an offer with sensible defaults for tests.
#[must_use]
pub fn scripted_offer(id: &str, reliability: f64, dph_total: f64) -> Offer {
    Offer {
        id: id.to_owned(),
        gpu_name: String::from("RTX 4090"),
        num_gpus: 1,
        gpu_ram: 24.0,
        dph_total,
        inet_down: 500.0,
        reliability,
        geolocation: Some(String::from("Sweden, SE")),
    }
}

/// Timeline followed by a scripted instance once it is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceScript {
    /// Reports `running` with an SSH endpoint once the duration has passed.
    ReadyAfter(Duration),
    /// Stays `loading` forever.
    NeverReady,
    /// Reports `running` immediately but never publishes an SSH endpoint.
    RunningWithoutEndpoint,
    /// Reports `exited` once the duration has passed.
    ExitsAfter(Duration),
}

#[derive(Clone, Debug)]
struct OfferEntry {
    offer: Offer,
    rejection: Option<String>,
    script: InstanceScript,
}

#[derive(Clone, Debug)]
struct ScriptedInstance {
    offer_id: Option<String>,
    label: Option<String>,
    script: InstanceScript,
    created_at: Instant,
    started_at: Option<Instant>,
    destroyed: bool,
    port: u16,
}

#[derive(Debug, Default)]
struct MarketState {
    offers: Vec<OfferEntry>,
    instances: BTreeMap<String, ScriptedInstance>,
    creation_order: Vec<String>,
    next_id: u32,
    create_delay: Duration,
    withdraw_rented: bool,
    resume_result: Option<bool>,
    search_calls: usize,
    resume_calls: Vec<String>,
    destroy_calls: BTreeMap<String, usize>,
    failing_destroys: BTreeSet<String>,
}

impl MarketState {
    fn insert(
        &mut self,
        offer_id: Option<String>,
        label: Option<String>,
        script: InstanceScript,
        started_at: Option<Instant>,
    ) -> String {
        self.next_id += 1;
        let id = (1000 + self.next_id).to_string();
        let port = u16::try_from(20_000 + self.next_id).unwrap_or(u16::MAX);
        self.instances.insert(
            id.clone(),
            ScriptedInstance {
                offer_id,
                label,
                script,
                created_at: Instant::now(),
                started_at,
                destroyed: false,
                port,
            },
        );
        id
    }
}

/// In-memory marketplace following scripted timelines.
#[derive(Clone, Debug, Default)]
pub struct ScriptedMarketplace {
    state: Arc<StdMutex<MarketState>>,
}

impl ScriptedMarketplace {
    /// Creates an empty marketplace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lists an offer whose instances follow `script`.
    pub fn add_offer(&self, offer: Offer, script: InstanceScript) {
        lock(&self.state).offers.push(OfferEntry {
            offer,
            rejection: None,
            script,
        });
    }

    /// Lists an offer whose creation is always refused.
    pub fn add_rejected_offer(&self, offer: Offer, message: &str) {
        lock(&self.state).offers.push(OfferEntry {
            offer,
            rejection: Some(message.to_owned()),
            script: InstanceScript::NeverReady,
        });
    }

    /// Makes every creation call take `delay`.
    pub fn set_create_delay(&self, delay: Duration) {
        lock(&self.state).create_delay = delay;
    }

    /// Overrides the value returned by `resume_instance`.
    pub fn set_resume_result(&self, accepted: bool) {
        lock(&self.state).resume_result = Some(accepted);
    }

    /// Adds a paused instance that follows `script` once resumed.
    #[must_use]
    pub fn add_paused_instance(&self, label: &str, script: InstanceScript) -> String {
        lock(&self.state).insert(None, Some(label.to_owned()), script, None)
    }

    /// Adds a running instance that never publishes an SSH endpoint.
    #[must_use]
    pub fn add_running_instance_without_endpoint(&self) -> String {
        let now = Instant::now();
        lock(&self.state).insert(None, None, InstanceScript::RunningWithoutEndpoint, Some(now))
    }

    /// Adds a stuck instance carrying `label`.
    #[must_use]
    pub fn add_labelled_instance(&self, label: &str) -> String {
        let now = Instant::now();
        lock(&self.state).insert(None, Some(label.to_owned()), InstanceScript::NeverReady, Some(now))
    }

    /// Makes destroy calls for `instance_id` fail.
    pub fn fail_destroy(&self, instance_id: &str) {
        lock(&self.state)
            .failing_destroys
            .insert(instance_id.to_owned());
    }

    /// Instances created through `create_instance`, in creation order.
    #[must_use]
    pub fn created_instances(&self) -> Vec<String> {
        lock(&self.state).creation_order.clone()
    }

    /// Instances that have been destroyed.
    #[must_use]
    pub fn destroyed_instances(&self) -> BTreeSet<String> {
        lock(&self.state)
            .instances
            .iter()
            .filter(|(_, instance)| instance.destroyed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Instances created through `create_instance` that were not destroyed.
    #[must_use]
    pub fn surviving_instances(&self) -> Vec<String> {
        let state = lock(&self.state);
        state
            .creation_order
            .iter()
            .filter(|id| state.instances.get(*id).is_some_and(|instance| !instance.destroyed))
            .cloned()
            .collect()
    }

    /// Hides offers from searches once an instance has been rented from them.
    pub fn withdraw_rented_offers(&self) {
        lock(&self.state).withdraw_rented = true;
    }

    /// Number of destroy calls made for `instance_id`.
    #[must_use]
    pub fn destroy_calls(&self, instance_id: &str) -> usize {
        lock(&self.state)
            .destroy_calls
            .get(instance_id)
            .copied()
            .unwrap_or(0)
    }

    /// When `instance_id` was created.
    #[must_use]
    pub fn created_at(&self, instance_id: &str) -> Option<Instant> {
        lock(&self.state)
            .instances
            .get(instance_id)
            .map(|instance| instance.created_at)
    }

    /// Instance created from `offer_id`, if any.
    #[must_use]
    pub fn instance_for_offer(&self, offer_id: &str) -> Option<String> {
        let state = lock(&self.state);
        state
            .creation_order
            .iter()
            .find(|id| {
                state
                    .instances
                    .get(*id)
                    .is_some_and(|instance| instance.offer_id.as_deref() == Some(offer_id))
            })
            .cloned()
    }

    /// Number of offer searches.
    #[must_use]
    pub fn search_calls(&self) -> usize {
        lock(&self.state).search_calls
    }

    /// Instances `resume_instance` was called for.
    #[must_use]
    pub fn resume_calls(&self) -> Vec<String> {
        lock(&self.state).resume_calls.clone()
    }

    fn status_of(instance: &ScriptedInstance, now: Instant) -> InstanceStatus {
        let Some(started_at) = instance.started_at else {
            return InstanceStatus::bare(InstanceState::Exited);
        };
        let elapsed = now.saturating_duration_since(started_at);
        match instance.script {
            InstanceScript::ReadyAfter(after) if elapsed >= after => {
                let mut ports = PortMappings::new();
                ports.insert_tcp(22, instance.port);
                InstanceStatus {
                    state: InstanceState::Running,
                    ssh_host: Some(format!("ssh{}.scripted.test", instance.port)),
                    ssh_port: Some(instance.port),
                    public_ip: Some(String::from("203.0.113.10")),
                    port_mappings: ports,
                    gpu_name: None,
                    dph_total: None,
                }
            }
            InstanceScript::RunningWithoutEndpoint => InstanceStatus::bare(InstanceState::Running),
            InstanceScript::ExitsAfter(after) if elapsed >= after => {
                InstanceStatus::bare(InstanceState::Exited)
            }
            _ => InstanceStatus::bare(InstanceState::Loading),
        }
    }
}

impl CloudProvider for ScriptedMarketplace {
    fn search_offers<'a>(&'a self, query: &'a OfferQuery) -> ProviderFuture<'a, Vec<Offer>> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.search_calls += 1;
            let rented = |offer_id: &str| {
                state
                    .instances
                    .values()
                    .any(|instance| instance.offer_id.as_deref() == Some(offer_id))
            };
            state
                .offers
                .iter()
                .filter(|entry| query.matches(&entry.offer))
                .filter(|entry| !(state.withdraw_rented && rented(&entry.offer.id)))
                .map(|entry| entry.offer.clone())
                .collect()
        })
    }

    fn create_instance<'a>(
        &'a self,
        request: &'a CreateInstanceRequest,
    ) -> ProviderFuture<'a, Result<String, ProviderError>> {
        Box::pin(async move {
            let delay = lock(&self.state).create_delay;
            if !delay.is_zero() {
                sleep(delay).await;
            }
            let mut state = lock(&self.state);
            let Some(entry) = state
                .offers
                .iter()
                .find(|entry| entry.offer.id == request.offer_id)
                .cloned()
            else {
                return Err(ProviderError::Rejected {
                    offer_id: request.offer_id.clone(),
                    message: String::from("no such offer"),
                });
            };
            if let Some(message) = entry.rejection {
                return Err(ProviderError::Rejected {
                    offer_id: request.offer_id.clone(),
                    message,
                });
            }
            let now = Instant::now();
            let id = state.insert(
                Some(request.offer_id.clone()),
                Some(request.label.clone()),
                entry.script,
                Some(now),
            );
            state.creation_order.push(id.clone());
            Ok(id)
        })
    }

    fn get_instance_status<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, InstanceStatus> {
        Box::pin(async move {
            let state = lock(&self.state);
            match state.instances.get(instance_id) {
                Some(instance) if !instance.destroyed => Self::status_of(instance, Instant::now()),
                _ => InstanceStatus::error(format!("instance {instance_id} not found")),
            }
        })
    }

    fn destroy_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, Result<(), ProviderError>> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            *state.destroy_calls.entry(instance_id.to_owned()).or_insert(0) += 1;
            if state.failing_destroys.contains(instance_id) {
                return Err(ProviderError::Api {
                    operation: String::from("destroy_instance"),
                    source: ApiError::http(500, "scripted destroy failure"),
                });
            }
            if let Some(instance) = state.instances.get_mut(instance_id) {
                instance.destroyed = true;
            }
            Ok(())
        })
    }

    fn resume_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, bool> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.resume_calls.push(instance_id.to_owned());
            let accepted = state.resume_result.unwrap_or(true);
            if let Some(instance) = state.instances.get_mut(instance_id)
                && !instance.destroyed
                && instance.started_at.is_none()
            {
                instance.started_at = Some(Instant::now());
            }
            accepted
        })
    }

    fn list_instances<'a>(
        &'a self,
        label: &'a str,
    ) -> ProviderFuture<'a, Result<Vec<InstanceSummary>, ProviderError>> {
        Box::pin(async move {
            let state = lock(&self.state);
            let now = Instant::now();
            Ok(state
                .instances
                .iter()
                .filter(|(_, instance)| !instance.destroyed && instance.label.as_deref() == Some(label))
                .map(|(id, instance)| InstanceSummary {
                    id: id.clone(),
                    label: instance.label.clone(),
                    state: Self::status_of(instance, now).state,
                })
                .collect())
        })
    }
}

#[derive(Debug, Default)]
struct ProbeState {
    liveness: bool,
    command: bool,
    failing_commands: usize,
    rejected_hosts: BTreeSet<String>,
    stalled_hosts: BTreeSet<String>,
    delay: Duration,
    calls: usize,
    command_calls: usize,
}

/// SSH probe returning scripted answers.
#[derive(Clone, Debug, Default)]
pub struct ScriptedProbe {
    state: Arc<StdMutex<ProbeState>>,
}

impl ScriptedProbe {
    /// A probe whose liveness and command checks both return `result`.
    #[must_use]
    pub fn always(result: bool) -> Self {
        Self::new(result, result)
    }

    /// A probe with separate liveness and command answers.
    #[must_use]
    pub fn new(liveness: bool, command: bool) -> Self {
        Self {
            state: Arc::new(StdMutex::new(ProbeState {
                liveness,
                command,
                ..ProbeState::default()
            })),
        }
    }

    /// Makes every check take `delay`.
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        lock(&self.state).delay = delay;
        self
    }

    /// Makes the next `count` command checks fail.
    #[must_use]
    pub fn with_failing_commands(self, count: usize) -> Self {
        lock(&self.state).failing_commands = count;
        self
    }

    /// Makes every check against `host` fail.
    pub fn reject_host(&self, host: &str) {
        lock(&self.state).rejected_hosts.insert(host.to_owned());
    }

    /// Makes every check against `host` hang until its caller gives up.
    pub fn stall_host(&self, host: &str) {
        lock(&self.state).stalled_hosts.insert(host.to_owned());
    }

    /// Number of checks performed.
    #[must_use]
    pub fn calls(&self) -> usize {
        lock(&self.state).calls
    }

    /// Number of command checks performed.
    #[must_use]
    pub fn command_calls(&self) -> usize {
        lock(&self.state).command_calls
    }
}

impl SshProbe for ScriptedProbe {
    fn verify<'a>(
        &'a self,
        host: &'a str,
        _port: u16,
        _timeout: Duration,
        run_command: bool,
    ) -> ProbeFuture<'a> {
        Box::pin(async move {
            let (delay, answer, stalled) = {
                let mut state = lock(&self.state);
                state.calls += 1;
                let stalled = state.stalled_hosts.contains(host);
                let rejected = state.rejected_hosts.contains(host);
                let answer = if run_command {
                    state.command_calls += 1;
                    if state.failing_commands > 0 {
                        state.failing_commands -= 1;
                        false
                    } else {
                        state.command
                    }
                } else {
                    state.liveness
                };
                (state.delay, answer && !rejected, stalled)
            };
            if stalled {
                std::future::pending::<()>().await;
            }
            if !delay.is_zero() {
                sleep(delay).await;
            }
            answer
        })
    }
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

#[derive(Debug, Default)]
struct RunnerState {
    responses: VecDeque<(Duration, CommandOutput)>,
    invocations: Vec<CommandInvocation>,
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    state: Arc<StdMutex<RunnerState>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.state).invocations.clone()
    }

    /// Pushes an explicit command output response.
    pub fn push_output(&self, code: Option<i32>, stdout: impl Into<String>, stderr: impl Into<String>) {
        lock(&self.state).responses.push_back((
            Duration::ZERO,
            CommandOutput {
                code,
                stdout: stdout.into(),
                stderr: stderr.into(),
            },
        ));
    }

    /// Pushes a response that only arrives after `delay`.
    pub fn push_delayed(&self, delay: Duration, code: Option<i32>, stdout: impl Into<String>) {
        lock(&self.state).responses.push_back((
            delay,
            CommandOutput {
                code,
                stdout: stdout.into(),
                stderr: String::new(),
            },
        ));
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> RunnerFuture<'a> {
        Box::pin(async move {
            let next = {
                let mut state = lock(&self.state);
                state.invocations.push(CommandInvocation {
                    program: program.to_owned(),
                    args: args.to_vec(),
                });
                state.responses.pop_front()
            };
            let Some((delay, output)) = next else {
                return Err(SshError::Spawn {
                    program: program.to_owned(),
                    message: String::from("no scripted response available"),
                });
            };
            if !delay.is_zero() {
                sleep(delay).await;
            }
            Ok(output)
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
