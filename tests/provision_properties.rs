//! Cross-strategy guarantees: at most one surviving machine, consistent
//! statistics, SSH failover bounds and the facade presets.

#[path = "common/fixtures.rs"]
mod fixtures;

use std::time::Duration;

use rstest::rstest;
use spotbroker::service::FAST_BATCH_SIZE;
use spotbroker::strategy::test_ssh_connection;
use spotbroker::test_support::{InstanceScript, ScriptedMarketplace, ScriptedProbe, scripted_offer};
use spotbroker::{
    ConfigError, MachineProvisioner, Progress, ProvisionDefaults, ProvisionError,
    ProvisionStrategy, RaceStrategy, SingleStrategy, StrategyKind,
};
use tokio::time::Instant;

use fixtures::{GPU_NAME, build, instance_for, list_offers, probe, provider, request};

const NEVER: InstanceScript = InstanceScript::NeverReady;

const fn ready_after(secs: u64) -> InstanceScript {
    InstanceScript::ReadyAfter(Duration::from_secs(secs))
}

/// Strictly decreasing reliability so offers race in insertion order.
fn reliability_rank(index: usize) -> f64 {
    const RANKS: [f64; 6] = [0.99, 0.98, 0.97, 0.96, 0.95, 0.94];
    RANKS.get(index).copied().unwrap_or(0.9)
}

fn provisioner(market: &ScriptedMarketplace, probe_double: &ScriptedProbe) -> MachineProvisioner {
    MachineProvisioner::new(provider(market), probe(probe_double))
}

#[rstest]
#[case::single_winner(vec![NEVER, ready_after(2), NEVER], StrategyKind::Race)]
#[case::two_ready(vec![ready_after(1), ready_after(1), NEVER], StrategyKind::Race)]
#[case::none_ready(vec![NEVER, NEVER, NEVER], StrategyKind::Race)]
#[case::exits(vec![InstanceScript::ExitsAfter(Duration::from_secs(2)), ready_after(4)], StrategyKind::Race)]
#[case::single_ready(vec![ready_after(3)], StrategyKind::Single)]
#[case::single_never(vec![NEVER, ready_after(1)], StrategyKind::Single)]
#[tokio::test(start_paused = true)]
async fn at_most_one_machine_survives(
    #[case] scripts: Vec<InstanceScript>,
    #[case] kind: StrategyKind,
) {
    let market = ScriptedMarketplace::new();
    for (index, script) in scripts.iter().enumerate() {
        let reliability = reliability_rank(index);
        market.add_offer(scripted_offer(&format!("offer-{index}"), reliability, 0.5), *script);
    }
    let config = build(
        request()
            .batch_size(3)
            .max_batches(1)
            .batch_timeout(Duration::from_secs(10)),
    );

    let result = provisioner(&market, &ScriptedProbe::always(true))
        .provision(&config, kind, &Progress::none())
        .await;

    let survivors = market.surviving_instances();
    match result.instance_id() {
        Some(winner) => assert_eq!(survivors, vec![winner.to_owned()]),
        None => assert!(survivors.is_empty(), "failed call leaked {survivors:?}"),
    }
    let stats = result.stats;
    assert!(stats.machines_tried >= stats.machines_created);
    assert_eq!(
        usize::try_from(stats.machines_created).unwrap_or(usize::MAX),
        market.created_instances().len()
    );
    assert!(stats.time_to_ready.is_none_or(|ready| ready <= stats.total_time));
}

#[tokio::test(start_paused = true)]
async fn failover_replaces_a_machine_that_fails_the_command_check() {
    let market = ScriptedMarketplace::new();
    list_offers(&market, &[("offer-a", 0.99, 0.5, ready_after(1))]);
    let probe_double = ScriptedProbe::always(true).with_failing_commands(1);
    let config = build(request().max_ssh_retries(3));

    let result = provisioner(&market, &probe_double)
        .provision_with_failover(&config, &Progress::none())
        .await;

    let created = market.created_instances();
    assert_eq!(created.len(), 2);
    assert_eq!(result.instance_id(), created.last().map(String::as_str));
    assert_eq!(market.surviving_instances().len(), 1);
    assert_eq!(result.stats.rounds_attempted, 2);
    assert_eq!(result.stats.machines_created, 2);
    assert_eq!(probe_double.command_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn failover_gives_up_after_max_ssh_retries() {
    let market = ScriptedMarketplace::new();
    list_offers(&market, &[("offer-a", 0.99, 0.5, ready_after(1))]);
    let config = build(request().max_ssh_retries(2));

    let result = provisioner(&market, &ScriptedProbe::new(true, false))
        .provision_with_failover(&config, &Progress::none())
        .await;

    let Some(ProvisionError::SshVerificationFailed {
        attempts,
        failed_instances,
    }) = result.error()
    else {
        panic!("expected ssh verification failure, got {result:?}");
    };
    assert_eq!(*attempts, 2);
    assert_eq!(failed_instances, &market.created_instances());
    assert!(market.surviving_instances().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failover_returns_provision_failures_immediately() {
    let market = ScriptedMarketplace::new();
    let config = build(request().max_ssh_retries(3));

    let result = RaceStrategy::new(probe(&ScriptedProbe::always(true)))
        .provision_with_failover(&config, &provider(&market), &Progress::none())
        .await;

    assert_eq!(result.error(), Some(&ProvisionError::NoOffers));
    assert_eq!(market.search_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn failover_keeps_rejected_machines_when_a_later_round_finds_no_offers() {
    let market = ScriptedMarketplace::new();
    list_offers(&market, &[("offer-a", 0.99, 0.5, ready_after(1))]);
    market.withdraw_rented_offers();
    let probe_double = ScriptedProbe::always(true).with_failing_commands(1);
    let config = build(request().max_ssh_retries(3));

    let result = provisioner(&market, &probe_double)
        .provision_with_failover(&config, &Progress::none())
        .await;

    let rejected = instance_for(&market, "offer-a");
    assert_eq!(
        result.error(),
        Some(&ProvisionError::SshVerificationFailed {
            attempts: 2,
            failed_instances: vec![rejected],
        })
    );
    assert_eq!(market.search_calls(), 2);
    assert!(market.surviving_instances().is_empty());
}

#[tokio::test(start_paused = true)]
async fn single_rents_the_cheapest_of_the_most_reliable_offers() {
    let market = ScriptedMarketplace::new();
    list_offers(
        &market,
        &[
            ("offer-a", 0.95, 0.8, ready_after(1)),
            ("offer-b", 0.95, 0.3, ready_after(1)),
            ("offer-c", 0.92, 0.1, ready_after(1)),
        ],
    );
    let config = build(request());

    let result = SingleStrategy::new(probe(&ScriptedProbe::always(true)))
        .provision(&config, &provider(&market), &Progress::none())
        .await;

    assert_eq!(
        result.instance_id(),
        Some(instance_for(&market, "offer-b").as_str())
    );
    assert_eq!(market.created_instances().len(), 1);
    assert_eq!(result.machine().and_then(|machine| machine.dph_total), Some(0.3));
}

#[tokio::test(start_paused = true)]
async fn single_moves_to_the_next_offer_after_a_refusal() {
    let market = ScriptedMarketplace::new();
    market.add_rejected_offer(scripted_offer("offer-a", 0.99, 0.3), "host busy");
    list_offers(&market, &[("offer-b", 0.95, 0.5, ready_after(1))]);
    let config = build(request());
    let started = Instant::now();

    let result = SingleStrategy::new(probe(&ScriptedProbe::always(true)))
        .provision(&config, &provider(&market), &Progress::none())
        .await;

    assert!(result.is_success());
    assert_eq!(result.stats.machines_tried, 2);
    assert_eq!(result.stats.machines_created, 1);
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn single_waits_for_the_full_readiness_window() {
    let market = ScriptedMarketplace::new();
    list_offers(&market, &[("offer-a", 0.99, 0.5, NEVER)]);
    let config = build(
        request()
            .batch_timeout(Duration::from_secs(10))
            .max_batches(2),
    );
    let started = Instant::now();

    let result = SingleStrategy::new(probe(&ScriptedProbe::always(true)))
        .provision(&config, &provider(&market), &Progress::none())
        .await;

    let Some(ProvisionError::ReadinessTimeout { waited_secs, .. }) = result.error() else {
        panic!("expected readiness timeout, got {result:?}");
    };
    assert!(*waited_secs >= 20);
    assert!(started.elapsed() < Duration::from_secs(25));
    assert!(market.surviving_instances().is_empty());
}

#[tokio::test(start_paused = true)]
async fn single_abandons_an_instance_that_exits() {
    let market = ScriptedMarketplace::new();
    list_offers(
        &market,
        &[("offer-a", 0.99, 0.5, InstanceScript::ExitsAfter(Duration::from_secs(2)))],
    );
    let config = build(request().batch_timeout(Duration::from_secs(60)));
    let started = Instant::now();

    let result = SingleStrategy::new(probe(&ScriptedProbe::always(true)))
        .provision(&config, &provider(&market), &Progress::none())
        .await;

    assert!(matches!(
        result.error(),
        Some(ProvisionError::ReadinessTimeout { .. })
    ));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(market.surviving_instances().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cleanup_failures_are_reported_alongside_success() {
    let market = ScriptedMarketplace::new();
    list_offers(
        &market,
        &[
            ("offer-a", 0.99, 0.5, NEVER),
            ("offer-b", 0.98, 0.5, ready_after(2)),
        ],
    );
    // First created instance receives id 1001.
    market.fail_destroy("1001");
    let config = build(
        request()
            .batch_size(2)
            .create_stagger(Duration::from_millis(500)),
    );

    let result = provisioner(&market, &ScriptedProbe::always(true))
        .provision(&config, StrategyKind::Race, &Progress::none())
        .await;

    assert!(result.is_success());
    assert_eq!(
        result
            .cleanup_failures
            .iter()
            .map(|failure| failure.instance_id.as_str())
            .collect::<Vec<_>>(),
        vec!["1001"]
    );
    assert_eq!(market.destroy_calls("1001"), 1);
}

#[tokio::test(start_paused = true)]
async fn cheap_preset_caps_price_and_rents_one_machine() {
    let market = ScriptedMarketplace::new();
    list_offers(
        &market,
        &[
            ("offer-pricey", 0.99, 0.8, ready_after(5)),
            ("offer-cheap", 0.99, 0.4, ready_after(5)),
        ],
    );

    let result = provisioner(&market, &ScriptedProbe::always(true))
        .provision_cheap(GPU_NAME, 1, &Progress::none())
        .await;

    assert_eq!(
        result.instance_id(),
        Some(instance_for(&market, "offer-cheap").as_str())
    );
    assert_eq!(market.created_instances().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn fast_preset_races_a_wide_batch_above_the_default_price() {
    let market = ScriptedMarketplace::new();
    for index in 0..FAST_BATCH_SIZE {
        let reliability = reliability_rank(index);
        let script = if index + 1 == FAST_BATCH_SIZE {
            ready_after(5)
        } else {
            NEVER
        };
        market.add_offer(scripted_offer(&format!("offer-{index}"), reliability, 1.5), script);
    }

    let result = provisioner(&market, &ScriptedProbe::always(true))
        .provision_fast(GPU_NAME, 1, &Progress::none())
        .await;

    assert!(result.is_success(), "fast preset should succeed: {result:?}");
    assert_eq!(market.created_instances().len(), FAST_BATCH_SIZE);
    assert_eq!(market.surviving_instances().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn presets_surface_invalid_requests_without_searching() {
    let market = ScriptedMarketplace::new();

    let result = provisioner(&market, &ScriptedProbe::always(true))
        .provision_fast(GPU_NAME, 0, &Progress::none())
        .await;

    assert!(matches!(
        result.error(),
        Some(ProvisionError::InvalidConfig(ConfigError::Invalid { field, .. })) if field == "num_gpus"
    ));
    assert_eq!(market.search_calls(), 0);
}

#[test]
fn provisioner_rejects_invalid_defaults() {
    let market = ScriptedMarketplace::new();
    let defaults = ProvisionDefaults {
        max_price: 0.0,
        ..ProvisionDefaults::builtin()
    };

    let err = provisioner(&market, &ScriptedProbe::always(true))
        .with_defaults(defaults)
        .expect_err("zero price ceiling should be rejected");

    assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "max_price"));
}

#[tokio::test(start_paused = true)]
async fn ssh_probe_is_bounded_by_its_timeout() {
    let slow = ScriptedProbe::always(true).with_delay(Duration::from_secs(60));
    let started = Instant::now();

    let reachable = test_ssh_connection(
        &slow,
        "ssh.scripted.test",
        22,
        Duration::from_secs(5),
        false,
    )
    .await;

    assert!(!reachable);
    assert!(started.elapsed() < Duration::from_secs(6));
}
