//! # End-to-end runs against threaded simulated radios
//!
//! Every test starts a real worker thread and one command thread per radio.
//! Latencies are a few milliseconds, so settling takes well under a second.

use std::time::Duration;

use phoneswitch::types::{ApnType, Capability, EndpointId, RequestId};
use phoneswitch::ArbiterConfig;
use phoneswitch_sim::{RandomScenario, ScenarioFile, SimRadioConfig, Simulation, Step};

// ─── Helpers ────────────────────────────────────────────────────────────────

fn fast_radios() -> SimRadioConfig {
    SimRadioConfig {
        attach_latency: Duration::from_millis(4),
        detach_latency: Duration::from_millis(2),
    }
}

fn config(endpoints: usize) -> ArbiterConfig {
    ArbiterConfig {
        endpoint_count: endpoints,
        attach_ahead: false,
        retry_interval: Duration::from_millis(40),
        ..Default::default()
    }
}

fn request(id: u64, specifier: Option<&str>, priority: Option<i32>) -> Step {
    Step::Request {
        id,
        capabilities: vec![Capability::Internet],
        specifier: specifier.map(str::to_string),
        priority,
    }
}

fn settle(sim: &mut Simulation) {
    assert!(sim.settle(Duration::from_secs(5)), "simulation did not settle");
}

// ─── Preemption ─────────────────────────────────────────────────────────────

#[test]
fn higher_priority_request_moves_the_session() -> anyhow::Result<()> {
    let mut sim = Simulation::start(config(2), fast_radios())?;
    sim.apply(&request(1, Some("endpoint:0"), Some(1)))?;
    settle(&mut sim);
    assert_eq!(sim.snapshot().active, Some(EndpointId(0)));

    sim.apply(&request(2, Some("endpoint:1"), Some(10)))?;
    settle(&mut sim);

    let snap = sim.snapshot();
    assert_eq!(snap.active, Some(EndpointId(1)));
    assert!(snap.is_executed(RequestId(2)));
    assert!(!snap.is_executed(RequestId(1)));
    assert_eq!(sim.ledger.ref_count(EndpointId(0), ApnType::Default), 0);
    assert_eq!(sim.ledger.ref_count(EndpointId(1), ApnType::Default), 1);
    sim.check().map_err(anyhow::Error::msg)?;
    assert!(!sim.radio(EndpointId(0)).unwrap().is_session_up());

    sim.shutdown();
    Ok(())
}

// ─── Radio Faults ───────────────────────────────────────────────────────────

#[test]
fn dropped_session_is_restored() -> anyhow::Result<()> {
    let mut sim = Simulation::start(config(2), fast_radios())?;
    sim.apply(&request(1, None, None))?;
    settle(&mut sim);
    assert_eq!(sim.ledger.increments(), 1);

    sim.apply(&Step::DropSession { endpoint: 0 })?;
    settle(&mut sim);

    let snap = sim.snapshot();
    assert!(snap.is_executed(RequestId(1)));
    assert_eq!(snap.active, Some(EndpointId(0)));
    assert_eq!(sim.ledger.decrements(), 1);
    assert_eq!(sim.ledger.increments(), 2);
    sim.check().map_err(anyhow::Error::msg)?;
    Ok(())
}

#[test]
fn channel_outage_is_retried() -> anyhow::Result<()> {
    let mut sim = Simulation::start(config(2), fast_radios())?;
    sim.apply(&Step::ChannelDown { endpoint: 0 })?;
    sim.apply(&request(1, None, None))?;
    sim.apply(&Step::Wait { ms: 60 })?;
    assert!(sim.snapshot().stats.radio_errors >= 1);
    assert_eq!(sim.snapshot().active, None);

    sim.apply(&Step::ChannelUp { endpoint: 0 })?;
    sim.apply(&Step::Wait { ms: 100 })?;
    settle(&mut sim);
    let snap = sim.snapshot();
    assert_eq!(snap.active, Some(EndpointId(0)));
    assert!(snap.is_executed(RequestId(1)));
    Ok(())
}

// ─── Admission ──────────────────────────────────────────────────────────────

#[test]
fn refused_requests_are_recorded() -> anyhow::Result<()> {
    let mut sim = Simulation::start(config(2), fast_radios())?;
    sim.apply(&request(1, None, None))?;
    sim.apply(&request(1, None, None))?;
    sim.apply(&request(2, Some("endpoint:9"), None))?;
    sim.apply(&request(3, Some("sub:555"), None))?;
    settle(&mut sim);

    let ids: Vec<RequestId> = sim.rejected().iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![RequestId(1), RequestId(2), RequestId(3)]);
    assert_eq!(sim.snapshot().requests.len(), 1);
    Ok(())
}

#[test]
fn subscription_loss_releases_pinned_request() -> anyhow::Result<()> {
    let mut sim = Simulation::start(config(2), fast_radios())?;
    sim.apply(&request(1, Some("sub:101"), Some(5)))?;
    settle(&mut sim);
    assert_eq!(sim.snapshot().active, Some(EndpointId(1)));

    sim.apply(&Step::SubscriptionLost { endpoint: 1 })?;
    settle(&mut sim);
    let snap = sim.snapshot();
    assert!(snap.request(RequestId(1)).is_none());
    assert_eq!(sim.ledger.ref_count(EndpointId(1), ApnType::Default), 0);

    // Pinned requests for the missing subscription wait for it to return.
    sim.apply(&request(2, Some("endpoint:1"), Some(5)))?;
    settle(&mut sim);
    assert_eq!(sim.snapshot().deferred, 1);
    sim.apply(&Step::SubscriptionReady { endpoint: 1 })?;
    settle(&mut sim);
    assert!(sim.snapshot().is_executed(RequestId(2)));
    Ok(())
}

// ─── Persistence ────────────────────────────────────────────────────────────

#[test]
fn attach_target_survives_restart() -> anyhow::Result<()> {
    let dir = std::env::temp_dir().join(format!("phoneswitch-sim-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    let state_file = dir.join("attach_target");
    let _ = std::fs::remove_file(&state_file);

    let mut cfg = config(2);
    cfg.state_file = Some(state_file.clone());
    let mut sim = Simulation::start(cfg.clone(), fast_radios())?;
    sim.apply(&request(1, Some("endpoint:1"), Some(3)))?;
    settle(&mut sim);
    sim.shutdown();
    assert_eq!(std::fs::read_to_string(&state_file)?.trim(), "1");

    // With attach-ahead on, the restarted arbiter goes straight back to ep1.
    cfg.attach_ahead = true;
    let mut sim = Simulation::start(cfg, fast_radios())?;
    settle(&mut sim);
    assert_eq!(sim.snapshot().active, Some(EndpointId(1)));
    sim.shutdown();

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

// ─── Scenarios ──────────────────────────────────────────────────────────────

#[test]
fn random_churn_keeps_one_radio_up() -> anyhow::Result<()> {
    let steps = RandomScenario::new(0x5eed, 3).steps(80);
    let mut sim = Simulation::start(config(3), fast_radios())?;
    for step in &steps {
        sim.apply(step)?;
        let snap = sim.snapshot();
        assert!(
            snap.non_idle_count() <= 1,
            "after {:?}: {:?}",
            step,
            snap.endpoints
        );
    }
    // Let any timed disallow expire before the final check.
    sim.apply(&Step::Allow {
        allowed: true,
        timeout_ms: 0,
    })?;
    settle(&mut sim);
    sim.check().map_err(anyhow::Error::msg)?;
    assert_eq!(sim.snapshot().stats.invariant_violations, 0);
    Ok(())
}

#[test]
fn scripted_scenario_runs() -> anyhow::Result<()> {
    let file = ScenarioFile::from_toml_str(
        r#"
[[steps]]
op = "request"
id = 1
capabilities = ["internet"]

[[steps]]
op = "request"
id = 2
capabilities = ["ims"]
specifier = "endpoint:1"

[[steps]]
op = "settle"

[[steps]]
op = "allow"
allowed = false
timeout_ms = 50

[[steps]]
op = "settle"
"#,
    )?;
    let mut sim = Simulation::start(config(2), fast_radios())?;
    for step in &file.steps {
        sim.apply(step)?;
    }
    let snap = sim.snapshot();
    assert!(!snap.allowed || snap.active.is_some());

    sim.apply(&Step::Wait { ms: 80 })?;
    settle(&mut sim);
    let snap = sim.snapshot();
    assert!(snap.allowed);
    // IMS outranks internet by default, so ep1 holds the session.
    assert_eq!(snap.active, Some(EndpointId(1)));
    assert!(snap.is_executed(RequestId(2)));
    sim.check().map_err(anyhow::Error::msg)?;
    Ok(())
}
