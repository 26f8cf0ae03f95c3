//! SSH client configuration and validation.
//!
//! Values are loaded via `ortho-config`, which merges defaults,
//! configuration files and `SPOTBROKER_SSH_*` environment variables.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Remote command used to prove that the SSH daemon accepts sessions.
pub const DEFAULT_PROBE_COMMAND: &str = "echo spotbroker-ready";

/// Output expected from [`DEFAULT_PROBE_COMMAND`].
pub const DEFAULT_PROBE_MARKER: &str = "spotbroker-ready";

/// SSH settings used by [`super::CommandSshProbe`].
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SPOTBROKER_SSH",
    discovery(
        app_name = "spotbroker",
        env_var = "SPOTBROKER_CONFIG_PATH",
        config_file_name = "spotbroker.toml",
        dotfile_name = ".spotbroker.toml",
        project_file_name = "spotbroker.toml"
    )
)]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Remote user to connect as. Marketplace containers log in as root.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Private key used for authentication. Supports `~/` expansion; when
    /// absent the client falls back to its default key locations.
    pub ssh_identity_file: Option<String>,
    /// Whether to force batch mode so a missing key fails instead of
    /// prompting.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking; off for ephemeral hosts.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override; `/dev/null` keeps ephemeral keys out of
    /// the user's file.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Benign command run by the command probe.
    #[ortho_config(default = DEFAULT_PROBE_COMMAND.to_owned())]
    pub probe_command: String,
    /// Text the probe command must print.
    #[ortho_config(default = DEFAULT_PROBE_MARKER.to_owned())]
    pub probe_marker: String,
}

impl SshConfig {
    /// Returns the built-in settings without consulting any source.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            ssh_user: String::from("root"),
            ssh_identity_file: None,
            ssh_batch_mode: true,
            ssh_strict_host_key_checking: false,
            ssh_known_hosts_file: String::from("/dev/null"),
            probe_command: String::from(DEFAULT_PROBE_COMMAND),
            probe_marker: String::from(DEFAULT_PROBE_MARKER),
        }
    }

    /// Ensures configuration values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::InvalidConfig`] when any required field is empty.
    pub fn validate(&self) -> Result<(), SshError> {
        Self::require_value(&self.ssh_bin, "ssh_bin")?;
        Self::require_value(&self.ssh_user, "ssh_user")?;
        Self::require_optional_value(self.ssh_identity_file.as_deref(), "ssh_identity_file")?;
        Self::require_value(&self.probe_command, "probe_command")?;
        Self::require_value(&self.probe_marker, "probe_marker")?;
        Ok(())
    }

    /// Loads configuration from defaults, configuration files and
    /// environment variables, ignoring process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Load`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, SshError> {
        Self::load_from_iter([std::ffi::OsString::from("spotbroker")])
            .map_err(|err| SshError::Load(err.to_string()))
    }

    fn require_optional_value(value: Option<&str>, field: &str) -> Result<(), SshError> {
        match value {
            None => Ok(()),
            Some(v) if !v.trim().is_empty() => Ok(()),
            Some(_) => Err(SshError::InvalidConfig {
                field: field.to_owned(),
            }),
        }
    }

    fn require_value(value: &str, field: &str) -> Result<(), SshError> {
        Self::require_optional_value(Some(value), field)
    }
}

/// Errors surfaced while configuring or running SSH commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SshError {
    /// Raised when configuration is missing required values.
    #[error("missing {field}: set SPOTBROKER_SSH_{env_suffix} or add {field} to spotbroker.toml", env_suffix = field.to_uppercase())]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Raised when layered configuration cannot be merged.
    #[error("ssh configuration parsing failed: {0}")]
    Load(String),
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
}
