//! Rate-limit retry adapter.
//!
//! Marketplace bindings implement [`MarketplaceApi`] and report every failure
//! as an [`ApiError`]. [`RateLimitedProvider`] wraps such a binding and
//! applies the retry contract expected by strategies: HTTP 429 is retried
//! with exponential backoff, offer search degrades to "no offers", status
//! polls degrade to an error sentinel, and destroy treats "not found" as
//! done.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use super::{
    ApiError, CloudProvider, CreateInstanceRequest, InstanceStatus, InstanceSummary, Offer,
    OfferQuery, ProviderError, ProviderFuture,
};

/// Raw marketplace binding; every call may fail with an [`ApiError`].
pub trait MarketplaceApi: Send + Sync {
    /// Searches offers matching `query`.
    fn search_offers<'a>(&'a self, query: &'a OfferQuery)
    -> ProviderFuture<'a, Result<Vec<Offer>, ApiError>>;

    /// Rents an offer and returns the new instance identifier.
    fn create_instance<'a>(
        &'a self,
        request: &'a CreateInstanceRequest,
    ) -> ProviderFuture<'a, Result<String, ApiError>>;

    /// Fetches the status of an instance.
    fn instance_status<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, Result<InstanceStatus, ApiError>>;

    /// Destroys an instance.
    fn destroy_instance<'a>(&'a self, instance_id: &'a str)
    -> ProviderFuture<'a, Result<(), ApiError>>;

    /// Starts a stopped instance.
    fn start_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, Result<(), ApiError>>;

    /// Lists instances carrying `label`.
    fn list_instances<'a>(
        &'a self,
        label: &'a str,
    ) -> ProviderFuture<'a, Result<Vec<InstanceSummary>, ApiError>>;
}

/// Backoff settings for [`RateLimitedProvider`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Attempts for search, create, destroy and resume calls.
    pub max_attempts: u32,
    /// Attempts for status polls, kept short because polls repeat anyway.
    pub status_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            status_attempts: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the failed attempt numbered `attempt` (0-based).
    ///
    /// A server supplied hint wins when present; both are capped at
    /// [`RetryPolicy::max_delay`].
    #[must_use]
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(attempt.min(16)));
        hint.unwrap_or(exponential).min(self.max_delay)
    }
}

/// [`super::CloudProvider`] built from a raw [`MarketplaceApi`] binding.
#[derive(Clone, Debug)]
pub struct RateLimitedProvider<A> {
    api: A,
    policy: RetryPolicy,
}

impl<A: MarketplaceApi> RateLimitedProvider<A> {
    /// Wraps `api` with the default [`RetryPolicy`].
    #[must_use]
    pub fn new(api: A) -> Self {
        Self {
            api,
            policy: RetryPolicy::default(),
        }
    }

    /// Overrides the retry policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Returns the wrapped binding.
    #[must_use]
    pub const fn api(&self) -> &A {
        &self.api
    }

    async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        attempts: u32,
        retryable: fn(&ApiError) -> bool,
        mut request: F,
    ) -> Result<T, CallFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let attempts = attempts.max(1);
        let mut attempt = 0;
        loop {
            match request().await {
                Ok(value) => return Ok(value),
                Err(err) if retryable(&err) && attempt + 1 < attempts => {
                    let delay = self.policy.delay_for(attempt, err.retry_after);
                    debug!(
                        operation,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "retrying marketplace call"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) if err.is_rate_limited() => {
                    return Err(CallFailure::Exhausted {
                        attempts: attempt + 1,
                        last: err,
                    });
                }
                Err(err) => return Err(CallFailure::Failed(err)),
            }
        }
    }
}

enum CallFailure {
    Exhausted { attempts: u32, last: ApiError },
    Failed(ApiError),
}

impl CallFailure {
    fn into_provider_error(self, operation: &str) -> ProviderError {
        match self {
            Self::Exhausted { attempts, last } => {
                debug!(operation, error = %last, "rate limit retries exhausted");
                ProviderError::RateLimited {
                    operation: operation.to_owned(),
                    attempts,
                }
            }
            Self::Failed(source) => ProviderError::Api {
                operation: operation.to_owned(),
                source,
            },
        }
    }
}

impl<A: MarketplaceApi> CloudProvider for RateLimitedProvider<A> {
    fn search_offers<'a>(&'a self, query: &'a OfferQuery) -> ProviderFuture<'a, Vec<Offer>> {
        Box::pin(async move {
            let outcome = self
                .call(
                    "search_offers",
                    self.policy.max_attempts,
                    ApiError::is_transient,
                    move || self.api.search_offers(query),
                )
                .await;
            match outcome {
                Ok(offers) => offers,
                Err(failure) => {
                    let err = failure.into_provider_error("search_offers");
                    warn!(error = %err, "offer search failed, treating as no supply");
                    Vec::new()
                }
            }
        })
    }

    fn create_instance<'a>(
        &'a self,
        request: &'a CreateInstanceRequest,
    ) -> ProviderFuture<'a, Result<String, ProviderError>> {
        Box::pin(async move {
            let outcome = self
                .call(
                    "create_instance",
                    self.policy.max_attempts,
                    ApiError::is_rate_limited,
                    move || self.api.create_instance(request),
                )
                .await;
            match outcome {
                Ok(instance_id) => Ok(instance_id),
                Err(CallFailure::Failed(err))
                    if err.status.is_some_and(|code| (400..500).contains(&code)) =>
                {
                    Err(ProviderError::Rejected {
                        offer_id: request.offer_id.clone(),
                        message: err.message,
                    })
                }
                Err(failure) => Err(failure.into_provider_error("create_instance")),
            }
        })
    }

    fn get_instance_status<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, InstanceStatus> {
        Box::pin(async move {
            let outcome = self
                .call(
                    "get_instance_status",
                    self.policy.status_attempts,
                    ApiError::is_transient,
                    move || self.api.instance_status(instance_id),
                )
                .await;
            outcome.unwrap_or_else(|failure| {
                let err = failure.into_provider_error("get_instance_status");
                debug!(instance_id, error = %err, "status unavailable");
                InstanceStatus::error(err.to_string())
            })
        })
    }

    fn destroy_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, Result<(), ProviderError>> {
        Box::pin(async move {
            let outcome = self
                .call(
                    "destroy_instance",
                    self.policy.max_attempts,
                    ApiError::is_transient,
                    move || self.api.destroy_instance(instance_id),
                )
                .await;
            match outcome {
                Ok(()) => Ok(()),
                Err(CallFailure::Failed(err)) if err.is_not_found() => {
                    debug!(instance_id, "instance already gone");
                    Ok(())
                }
                Err(failure) => Err(failure.into_provider_error("destroy_instance")),
            }
        })
    }

    fn resume_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, bool> {
        Box::pin(async move {
            let outcome = self
                .call(
                    "resume_instance",
                    self.policy.max_attempts,
                    ApiError::is_transient,
                    move || self.api.start_instance(instance_id),
                )
                .await;
            match outcome {
                Ok(()) => true,
                Err(failure) => {
                    let err = failure.into_provider_error("resume_instance");
                    warn!(instance_id, error = %err, "resume call failed");
                    false
                }
            }
        })
    }

    fn list_instances<'a>(
        &'a self,
        label: &'a str,
    ) -> ProviderFuture<'a, Result<Vec<InstanceSummary>, ProviderError>> {
        Box::pin(async move {
            self.call(
                "list_instances",
                self.policy.max_attempts,
                ApiError::is_transient,
                move || self.api.list_instances(label),
            )
            .await
            .map_err(|failure| failure.into_provider_error("list_instances"))
        })
    }
}
