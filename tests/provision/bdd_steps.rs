//! BDD step definitions for race, failover and cold start provisioning.

use std::future::Future;
use std::time::Duration;

use rstest_bdd_macros::{given, then, when};
use spotbroker::test_support::InstanceScript;
use spotbroker::{Progress, ProvisionError, ProvisionResult, ResumeOptions, StrategyKind};
use tokio::time::Instant;

use super::test_helpers::{
    LABEL, Outcome, ProvisionContext, ProvisionTestError, paused_runtime, scenario_config,
};

fn observe(
    context: ProvisionContext,
    call: impl Future<Output = ProvisionResult>,
) -> Result<ProvisionContext, ProvisionTestError> {
    let runtime = paused_runtime()?;
    let market = context.market.clone();
    let outcome = runtime.block_on(async move {
        let started = Instant::now();
        let result = call.await;
        let elapsed = started.elapsed();
        let creation_offsets = market
            .created_instances()
            .into_iter()
            .filter_map(|id| {
                let offset = market.created_at(&id)?.saturating_duration_since(started);
                Some((id, offset))
            })
            .collect();
        Outcome {
            result,
            elapsed,
            creation_offsets,
        }
    });
    Ok(ProvisionContext {
        outcome: Some(outcome),
        ..context
    })
}

#[given("a marketplace with three offers where only the second boots")]
fn second_offer_boots(provision_context: ProvisionContext) -> ProvisionContext {
    provision_context.add_offer("offer-a", 0.99, InstanceScript::NeverReady);
    provision_context.add_offer(
        "offer-b",
        0.98,
        InstanceScript::ReadyAfter(Duration::from_secs(2)),
    );
    provision_context.add_offer("offer-c", 0.97, InstanceScript::NeverReady);
    provision_context
}

#[given("a marketplace where no machine ever boots")]
fn nothing_boots(provision_context: ProvisionContext) -> ProvisionContext {
    for (id, reliability) in [("offer-a", 0.99), ("offer-b", 0.98), ("offer-c", 0.97)] {
        provision_context.add_offer(id, reliability, InstanceScript::NeverReady);
    }
    provision_context
}

#[given("a marketplace whose machines boot in one second")]
fn machines_boot_quickly(provision_context: ProvisionContext) -> ProvisionContext {
    provision_context.add_offer(
        "offer-a",
        0.99,
        InstanceScript::ReadyAfter(Duration::from_secs(1)),
    );
    provision_context
}

#[given("the first remote command check fails")]
fn first_command_fails(mut provision_context: ProvisionContext) -> ProvisionContext {
    provision_context.probe = provision_context.probe.with_failing_commands(1);
    provision_context
}

#[given("a paused instance that never finishes booting")]
fn paused_instance(mut provision_context: ProvisionContext) -> ProvisionContext {
    provision_context.paused = Some(
        provision_context
            .market
            .add_paused_instance(LABEL, InstanceScript::NeverReady),
    );
    provision_context
}

#[given("a backup offer \"{offer_id}\" that boots in {seconds:u64} seconds")]
fn backup_offer(
    provision_context: ProvisionContext,
    offer_id: String,
    seconds: u64,
) -> ProvisionContext {
    provision_context.add_offer(
        offer_id.trim(),
        0.99,
        InstanceScript::ReadyAfter(Duration::from_secs(seconds)),
    );
    provision_context
}

#[when("I race for a machine with a stagger of {stagger_ms:u64} ms")]
fn race_for_machine(
    provision_context: ProvisionContext,
    stagger_ms: u64,
) -> Result<ProvisionContext, ProvisionTestError> {
    let config = scenario_config(Duration::from_millis(stagger_ms))?;
    let provisioner = provision_context.provisioner();
    observe(provision_context, async move {
        provisioner
            .provision(&config, StrategyKind::Race, &Progress::none())
            .await
    })
}

#[when("I provision with ssh failover")]
fn provision_with_failover(
    provision_context: ProvisionContext,
) -> Result<ProvisionContext, ProvisionTestError> {
    let config = scenario_config(Duration::ZERO)?;
    let provisioner = provision_context.provisioner();
    observe(provision_context, async move {
        provisioner
            .provision_with_failover(&config, &Progress::none())
            .await
    })
}

#[when("I resume the paused instance with a {seconds:u64} second grace period")]
fn resume_paused(
    provision_context: ProvisionContext,
    seconds: u64,
) -> Result<ProvisionContext, ProvisionTestError> {
    let paused = provision_context
        .paused
        .clone()
        .ok_or_else(|| ProvisionTestError::Fixture(String::from("no paused instance")))?;
    let backup = scenario_config(Duration::ZERO)?;
    let options = ResumeOptions {
        parallel_backup: false,
        resume_timeout: Duration::from_secs(seconds),
        total_timeout: Duration::from_secs(120),
        check_interval: Duration::from_secs(1),
        ..ResumeOptions::default()
    };
    let provisioner = provision_context.provisioner();
    observe(provision_context, async move {
        provisioner
            .resume_with_failover(&paused, Some(&backup), &options, &Progress::none())
            .await
    })
}

#[then("the instance rented from \"{offer_id}\" is returned")]
fn offer_instance_returned(
    provision_context: &ProvisionContext,
    offer_id: String,
) -> Result<(), ProvisionTestError> {
    let outcome = provision_context.outcome()?;
    let expected = provision_context
        .market
        .instance_for_offer(offer_id.trim())
        .ok_or_else(|| ProvisionTestError::Assertion(format!("{offer_id} was never rented")))?;
    if outcome.result.instance_id() == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(ProvisionTestError::Assertion(format!(
            "expected {expected}, got {:?}",
            outcome.result
        )))
    }
}

#[then("the last created instance is returned")]
fn last_instance_returned(provision_context: &ProvisionContext) -> Result<(), ProvisionTestError> {
    let outcome = provision_context.outcome()?;
    let created = provision_context.market.created_instances();
    if created.len() > 1 && outcome.result.instance_id() == created.last().map(String::as_str) {
        Ok(())
    } else {
        Err(ProvisionTestError::Assertion(format!(
            "expected the replacement of {created:?}, got {:?}",
            outcome.result
        )))
    }
}

#[then("every other created instance is destroyed")]
fn others_destroyed(provision_context: &ProvisionContext) -> Result<(), ProvisionTestError> {
    let outcome = provision_context.outcome()?;
    let winner = outcome.result.instance_id().map(str::to_owned);
    let survivors = provision_context.market.surviving_instances();
    if winner.is_some() && survivors == winner.into_iter().collect::<Vec<_>>() {
        Ok(())
    } else {
        Err(ProvisionTestError::Assertion(format!(
            "unexpected survivors {survivors:?}"
        )))
    }
}

#[then("provisioning fails with a readiness timeout")]
fn fails_with_timeout(provision_context: &ProvisionContext) -> Result<(), ProvisionTestError> {
    let outcome = provision_context.outcome()?;
    match outcome.result.error() {
        Some(ProvisionError::ReadinessTimeout { .. }) => Ok(()),
        other => Err(ProvisionTestError::Assertion(format!(
            "expected readiness timeout after {:?}, got {other:?}",
            outcome.elapsed
        ))),
    }
}

#[then("no created instance survives")]
fn none_survive(provision_context: &ProvisionContext) -> Result<(), ProvisionTestError> {
    let survivors = provision_context.market.surviving_instances();
    if survivors.is_empty() {
        Ok(())
    } else {
        Err(ProvisionTestError::Assertion(format!(
            "leaked instances {survivors:?}"
        )))
    }
}

#[then("the backup was created no earlier than {seconds:u64} seconds in")]
fn backup_deferred(
    provision_context: &ProvisionContext,
    seconds: u64,
) -> Result<(), ProvisionTestError> {
    let outcome = provision_context.outcome()?;
    let grace = Duration::from_secs(seconds);
    if !outcome.creation_offsets.is_empty()
        && outcome
            .creation_offsets
            .iter()
            .all(|(_, offset)| *offset >= grace)
    {
        Ok(())
    } else {
        Err(ProvisionTestError::Assertion(format!(
            "backup started too early: {:?}",
            outcome.creation_offsets
        )))
    }
}

#[then("the paused instance is destroyed")]
fn paused_destroyed(provision_context: &ProvisionContext) -> Result<(), ProvisionTestError> {
    let paused = provision_context
        .paused
        .as_ref()
        .ok_or_else(|| ProvisionTestError::Fixture(String::from("no paused instance")))?;
    if provision_context.market.destroyed_instances().contains(paused) {
        Ok(())
    } else {
        Err(ProvisionTestError::Assertion(format!(
            "paused instance {paused} is still alive"
        )))
    }
}
