//! SSH reachability probes.
//!
//! A freshly booted marketplace container frequently exposes its SSH port
//! before the daemon accepts sessions. [`SshProbe::verify`] therefore has
//! two modes: a cheap liveness check (TCP connect plus the `SSH-` protocol
//! banner) and a command check that logs in with the system `ssh` client
//! and runs a benign command whose output is compared with an expected
//! marker.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use shell_escape::unix::escape;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

mod config;
mod runner;
mod util;

pub use config::{DEFAULT_PROBE_COMMAND, DEFAULT_PROBE_MARKER, SshConfig, SshError};
pub use runner::{CommandOutput, CommandRunner, ProcessCommandRunner, RunnerFuture};
pub use util::expand_tilde;

const BANNER_PREFIX: &[u8] = b"SSH-";

/// Future returned by [`SshProbe::verify`].
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Checks whether an SSH endpoint is usable.
pub trait SshProbe: Send + Sync {
    /// Returns `true` when `host:port` is reachable within `timeout`.
    ///
    /// With `run_command` unset only transport reachability is required;
    /// with it set, a remote command must run and print the expected
    /// output. Never fails: every error maps to `false`.
    fn verify<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        timeout: Duration,
        run_command: bool,
    ) -> ProbeFuture<'a>;
}

/// Probe backed by a TCP banner read and the system `ssh` client.
#[derive(Clone, Debug)]
pub struct CommandSshProbe<R: CommandRunner = ProcessCommandRunner> {
    config: SshConfig,
    runner: R,
}

impl CommandSshProbe<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::InvalidConfig`] when validation fails.
    pub fn with_process_runner(config: SshConfig) -> Result<Self, SshError> {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> CommandSshProbe<R> {
    /// Creates a probe using the provided runner and configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::InvalidConfig`] when configuration validation
    /// fails.
    pub fn new(config: SshConfig, runner: R) -> Result<Self, SshError> {
        config.validate()?;
        Ok(Self { config, runner })
    }

    /// Returns a reference to the underlying configuration.
    #[must_use]
    pub const fn config(&self) -> &SshConfig {
        &self.config
    }

    async fn banner_check(host: &str, port: u16, limit: Duration) -> bool {
        let attempt = async {
            let mut stream = TcpStream::connect((host, port)).await?;
            let mut buffer = [0_u8; 64];
            let read = stream.read(&mut buffer).await?;
            Ok::<bool, std::io::Error>(
                buffer
                    .get(..read)
                    .is_some_and(|banner| banner.starts_with(BANNER_PREFIX)),
            )
        };
        match timeout(limit, attempt).await {
            Ok(Ok(seen)) => seen,
            Ok(Err(err)) => {
                debug!(host, port, error = %err, "ssh port not reachable");
                false
            }
            Err(_) => {
                debug!(host, port, "ssh banner timed out");
                false
            }
        }
    }

    async fn command_check(&self, host: &str, port: u16, limit: Duration) -> bool {
        let args = self.build_ssh_args(host, port, limit);
        match timeout(limit, self.runner.run(&self.config.ssh_bin, &args)).await {
            Ok(Ok(output)) => {
                let ready = output.is_success() && output.stdout.contains(&self.config.probe_marker);
                if !ready {
                    debug!(
                        host,
                        port,
                        code = ?output.code,
                        stderr = %output.stderr.trim(),
                        "ssh probe command did not confirm readiness"
                    );
                }
                ready
            }
            Ok(Err(err)) => {
                debug!(host, port, error = %err, "ssh probe command failed to run");
                false
            }
            Err(_) => {
                debug!(host, port, "ssh probe command timed out");
                false
            }
        }
    }

    fn build_ssh_args(&self, host: &str, port: u16, limit: Duration) -> Vec<OsString> {
        let mut args = vec![OsString::from("-p"), OsString::from(port.to_string())];

        if let Some(ref identity_file) = self.config.ssh_identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(identity_file).into_string()));
        }

        if self.config.ssh_batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.config.ssh_strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.config.ssh_known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.config.ssh_known_hosts_file
            )));
        }

        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "ConnectTimeout={}",
            limit.as_secs().max(1)
        )));
        args.push(OsString::from(format!("{}@{host}", self.config.ssh_user)));
        args.push(OsString::from(format!(
            "sh -c {}",
            escape(self.config.probe_command.as_str().into())
        )));
        args
    }
}

impl<R: CommandRunner> SshProbe for CommandSshProbe<R> {
    fn verify<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        timeout: Duration,
        run_command: bool,
    ) -> ProbeFuture<'a> {
        Box::pin(async move {
            if run_command {
                self.command_check(host, port, timeout).await
            } else {
                Self::banner_check(host, port, timeout).await
            }
        })
    }
}
