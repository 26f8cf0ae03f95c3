//! Cloud provider contract consumed by the provisioning strategies.
//!
//! Strategies only ever talk to the marketplace through [`CloudProvider`].
//! Implementations own the rate-limit retry policy, so a strategy can treat
//! every call as "best effort, never raises": offer search yields an empty
//! list on failure, status polls yield an [`InstanceState::Error`] sentinel,
//! and creation or destroy failures are returned as values.

mod error;
mod retry;
mod types;

use std::future::Future;
use std::pin::Pin;

pub use error::{ApiError, ProviderError};
pub use retry::{MarketplaceApi, RateLimitedProvider, RetryPolicy};
pub use types::{
    CreateInstanceRequest, InstanceState, InstanceStatus, InstanceSummary, MachineType, Offer,
    OfferQuery, PortBinding, PortMappings,
};

/// Future returned by provider operations.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Offer search and instance lifecycle operations of a GPU marketplace.
///
/// The trait is object safe; the provisioning service holds it as
/// `Arc<dyn CloudProvider>` and shares it between concurrent calls.
pub trait CloudProvider: Send + Sync {
    /// Returns offers matching `query`, or an empty list when none match or
    /// the marketplace stayed unavailable through every retry.
    fn search_offers<'a>(&'a self, query: &'a OfferQuery) -> ProviderFuture<'a, Vec<Offer>>;

    /// Rents an offer. `Err` signals an ordinary creation failure (offer
    /// taken, quota) and is never fatal to the caller.
    fn create_instance<'a>(
        &'a self,
        request: &'a CreateInstanceRequest,
    ) -> ProviderFuture<'a, Result<String, ProviderError>>;

    /// Polls an instance. Persistent failures yield a status whose state is
    /// [`InstanceState::Error`].
    fn get_instance_status<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, InstanceStatus>;

    /// Destroys an instance. Destroying an instance that is already gone
    /// succeeds.
    fn destroy_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, Result<(), ProviderError>>;

    /// Asks the marketplace to start a paused instance. `false` does not
    /// rule out the instance coming up later.
    fn resume_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, bool>;

    /// Lists instances carrying `label`.
    ///
    /// Bindings without a listing endpoint keep the default, which reports
    /// [`ProviderError::Unsupported`].
    fn list_instances<'a>(
        &'a self,
        label: &'a str,
    ) -> ProviderFuture<'a, Result<Vec<InstanceSummary>, ProviderError>> {
        let _ = label;
        Box::pin(async {
            Err(ProviderError::Unsupported(String::from(
                "list_instances is not implemented by this provider",
            )))
        })
    }
}
