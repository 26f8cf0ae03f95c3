//! Label based sweep of leaked instances.
//!
//! Every instance created for a request carries the request label. When a
//! process dies mid-provision, or a destroy call keeps failing, the janitor
//! finds the leftovers by label and destroys them, failing if anything is
//! still listed afterwards.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::provider::{CloudProvider, InstanceSummary, ProviderError};
use crate::strategy::CleanupFailure;

/// Summary of janitor work.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Instances carrying the label when the sweep started.
    pub found: usize,
    /// Instances destroyed successfully.
    pub destroyed: usize,
    /// Destroy calls that failed.
    pub failures: Vec<CleanupFailure>,
}

/// Errors returned by the janitor.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum JanitorError {
    /// Raised when the label is blank.
    #[error("missing label")]
    InvalidLabel,
    /// Raised when the provider cannot list instances.
    #[error("failed to list instances: {0}")]
    List(#[source] ProviderError),
    /// Raised when instances remain after the sweep.
    #[error("instances remain after janitor sweep: {}", remaining.join(", "))]
    NotClean {
        /// Identifiers still listed.
        remaining: Vec<String>,
    },
}

/// Destroys every instance carrying a label.
#[derive(Clone)]
pub struct Janitor {
    provider: Arc<dyn CloudProvider>,
}

impl std::fmt::Debug for Janitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Janitor").finish_non_exhaustive()
    }
}

impl Janitor {
    /// Creates a janitor over the given marketplace client.
    #[must_use]
    pub const fn new(provider: Arc<dyn CloudProvider>) -> Self {
        Self { provider }
    }

    /// Destroys every instance labelled `label` and checks none remain.
    ///
    /// # Errors
    ///
    /// Returns [`JanitorError`] when the label is blank, listing fails, or
    /// instances remain after destroy attempts.
    pub async fn sweep(&self, label: &str) -> Result<SweepSummary, JanitorError> {
        let wanted = label.trim();
        if wanted.is_empty() {
            return Err(JanitorError::InvalidLabel);
        }

        let found = self.list(wanted).await?;
        let mut summary = SweepSummary {
            found: found.len(),
            ..SweepSummary::default()
        };
        for instance in found {
            match self.provider.destroy_instance(&instance.id).await {
                Ok(()) => summary.destroyed += 1,
                Err(err) => {
                    warn!(instance_id = %instance.id, error = %err, "janitor failed to destroy instance");
                    summary.failures.push(CleanupFailure {
                        instance_id: instance.id,
                        message: err.to_string(),
                    });
                }
            }
        }

        let remaining = self.list(wanted).await?;
        if !remaining.is_empty() {
            return Err(JanitorError::NotClean {
                remaining: remaining.into_iter().map(|instance| instance.id).collect(),
            });
        }

        info!(label = wanted, destroyed = summary.destroyed, "janitor sweep complete");
        Ok(summary)
    }

    async fn list(&self, label: &str) -> Result<Vec<InstanceSummary>, JanitorError> {
        let listed = self
            .provider
            .list_instances(label)
            .await
            .map_err(JanitorError::List)?;
        Ok(listed
            .into_iter()
            .filter(|instance| instance.label.as_deref() == Some(label))
            .collect())
    }
}
