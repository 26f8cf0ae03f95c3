//! Shared request and marketplace fixtures for provisioning tests.

use std::sync::Arc;
use std::time::Duration;

use spotbroker::test_support::{InstanceScript, ScriptedMarketplace, ScriptedProbe, scripted_offer};
use spotbroker::{CloudProvider, ProvisionConfig, ProvisionConfigBuilder, SshProbe};

pub const GPU_NAME: &str = "RTX 4090";
pub const LABEL: &str = "spotbroker-it";

/// A request that matches every scripted offer, polls once a second and
/// creates without stagger.
pub fn request() -> ProvisionConfigBuilder {
    ProvisionConfig::builder()
        .gpu_name(GPU_NAME)
        .label(LABEL)
        .create_stagger(Duration::ZERO)
        .check_interval(Duration::from_secs(1))
        .batch_timeout(Duration::from_secs(30))
}

pub fn build(builder: ProvisionConfigBuilder) -> ProvisionConfig {
    builder
        .build()
        .unwrap_or_else(|err| panic!("test config should be valid: {err}"))
}

pub fn provider(market: &ScriptedMarketplace) -> Arc<dyn CloudProvider> {
    Arc::new(market.clone())
}

pub fn probe(probe: &ScriptedProbe) -> Arc<dyn SshProbe> {
    Arc::new(probe.clone())
}

/// Lists `(offer id, reliability, price, script)` tuples on `market`.
pub fn list_offers(market: &ScriptedMarketplace, offers: &[(&str, f64, f64, InstanceScript)]) {
    for (id, reliability, price, script) in offers {
        market.add_offer(scripted_offer(id, *reliability, *price), *script);
    }
}

pub fn instance_for(market: &ScriptedMarketplace, offer_id: &str) -> String {
    market
        .instance_for_offer(offer_id)
        .unwrap_or_else(|| panic!("offer {offer_id} should have been rented"))
}
