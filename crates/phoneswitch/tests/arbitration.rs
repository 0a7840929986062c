//! # Arbitration scenarios driven through the deterministic harness
//!
//! Radio confirmations are delivered by `Harness::settle`, so every
//! assertion runs against a fully settled state unless noted.

use std::time::Duration;

use phoneswitch::arbiter::ArbiterEvent;
use phoneswitch::endpoint::SwitchState;
use phoneswitch::error::RegistryError;
use phoneswitch::test_util::{CommandKind, Harness, RadioCommand};
use phoneswitch::types::{ApnType, Capability, EndpointId, NetworkRequest, RequestId, Specifier};

// ─── Helpers ────────────────────────────────────────────────────────────────

fn pinned(id: u64, ep: usize, priority: i32) -> NetworkRequest {
    NetworkRequest::new(id)
        .with_capability(Capability::Internet)
        .with_specifier(Specifier::Endpoint(EndpointId(ep)))
        .with_priority(priority)
}

fn default_routed(id: u64) -> NetworkRequest {
    NetworkRequest::new(id).with_capability(Capability::Internet)
}

fn executed(h: &Harness, id: u64) -> Option<EndpointId> {
    h.arbiter
        .registry()
        .get(RequestId(id))
        .and_then(|e| e.executed_on)
}

fn position(cmds: &[RadioCommand], endpoint: usize, kind: CommandKind) -> Option<usize> {
    cmds.iter()
        .position(|c| c.endpoint == EndpointId(endpoint) && c.kind == kind)
}

// ─── Priority ───────────────────────────────────────────────────────────────

#[test]
fn higher_priority_endpoint_wins() {
    let mut h = Harness::builder(2).attach_ahead(false).build();
    h.add(pinned(1, 0, 5));
    h.add(pinned(2, 1, 10));
    h.settle();

    assert_eq!(h.arbiter.active_endpoint(), Some(EndpointId(1)));
    assert_eq!(executed(&h, 1), None);
    assert_eq!(executed(&h, 2), Some(EndpointId(1)));
    h.check_invariants().unwrap();
}

#[test]
fn equal_priority_goes_to_lower_endpoint() {
    let mut h = Harness::builder(3).attach_ahead(false).build();
    h.add(pinned(1, 2, 4));
    h.add(pinned(2, 1, 4));
    h.settle();

    assert_eq!(h.arbiter.active_endpoint(), Some(EndpointId(1)));
    assert_eq!(executed(&h, 2), Some(EndpointId(1)));
    h.check_invariants().unwrap();
}

#[test]
fn releasing_top_request_hands_over() {
    let mut h = Harness::builder(2).attach_ahead(false).build();
    h.add(pinned(1, 0, 5));
    h.add(pinned(2, 1, 10));
    h.settle();

    h.remove(RequestId(2));
    h.settle();
    assert_eq!(h.arbiter.active_endpoint(), Some(EndpointId(0)));
    assert_eq!(executed(&h, 1), Some(EndpointId(0)));
    assert_eq!(h.ledger.ref_count(EndpointId(1), ApnType::Default), 0);
    h.check_invariants().unwrap();
}

// ─── Preemption Ordering ────────────────────────────────────────────────────

#[test]
fn preemption_detaches_before_attaching() {
    let mut h = Harness::builder(2).attach_ahead(false).build();
    h.add(pinned(1, 0, 1));
    h.settle();
    assert_eq!(executed(&h, 1), Some(EndpointId(0)));

    h.add(pinned(2, 1, 10));
    // Nothing may be attached on ep1 until ep0 confirms its detach.
    let cmds = h.commands();
    assert!(position(&cmds, 1, CommandKind::Attach).is_none());
    assert_eq!(executed(&h, 1), None);
    assert!(h.arbiter.switch(EndpointId(0)).unwrap().is_detaching());

    h.settle();
    let cmds = h.commands();
    let detach = position(&cmds, 0, CommandKind::Detach).unwrap();
    let attach = position(&cmds, 1, CommandKind::Attach).unwrap();
    assert!(detach < attach, "commands out of order: {:?}", cmds);
    assert_eq!(executed(&h, 2), Some(EndpointId(1)));
    h.check_invariants().unwrap();
}

#[test]
fn draining_endpoint_is_reused_when_target_returns() {
    let mut h = Harness::builder(2).attach_ahead(false).build();
    h.add(pinned(1, 0, 1));
    h.settle();
    h.add(pinned(2, 1, 10));
    // Top request goes away before ep0 finishes detaching.
    h.remove(RequestId(2));
    h.settle();

    assert_eq!(h.arbiter.active_endpoint(), Some(EndpointId(0)));
    assert_eq!(executed(&h, 1), Some(EndpointId(0)));
    assert!(position(&h.commands(), 1, CommandKind::Attach).is_none());
    assert!(h.arbiter.stats().stale_confirmations >= 1);
    h.check_invariants().unwrap();
}

// ─── Attach-Ahead (default config) ──────────────────────────────────────────

#[test]
fn requests_arriving_during_attach_ahead_execute_only_the_top() {
    let mut h = Harness::new(2);
    h.bootstrap();
    assert_eq!(h.commands(), vec![RadioCommand::attach(EndpointId(0), 1)]);

    // Both arrive before ep0 confirms the attach-ahead session.
    h.add(pinned(1, 0, 5));
    h.add(pinned(2, 1, 10));
    h.settle();

    assert_eq!(
        h.commands(),
        vec![
            RadioCommand::attach(EndpointId(0), 1),
            RadioCommand::detach(EndpointId(0), 2),
            RadioCommand::attach(EndpointId(1), 1),
        ]
    );
    assert_eq!(h.arbiter.active_endpoint(), Some(EndpointId(1)));
    assert_eq!(executed(&h, 1), None);
    assert_eq!(executed(&h, 2), Some(EndpointId(1)));
    assert_eq!(h.ledger.ref_count(EndpointId(0), ApnType::Default), 0);
    assert_eq!(h.ledger.ref_count(EndpointId(1), ApnType::Default), 1);
    h.check_invariants().unwrap();
}

#[test]
fn attach_ahead_session_is_detached_before_preempting_attach() {
    let mut h = Harness::new(2);
    h.bootstrap();
    h.settle();
    h.add(pinned(1, 0, 5));
    h.settle();
    assert_eq!(executed(&h, 1), Some(EndpointId(0)));

    h.add(pinned(2, 1, 10));
    assert_eq!(
        h.outstanding(),
        vec![RadioCommand::detach(EndpointId(0), 2)],
        "ep1 must wait for ep0 to detach"
    );
    h.settle();

    let cmds = h.commands();
    let detach = position(&cmds, 0, CommandKind::Detach).unwrap();
    let attach = position(&cmds, 1, CommandKind::Attach).unwrap();
    assert!(detach < attach, "commands out of order: {:?}", cmds);
    assert_eq!(executed(&h, 1), None);
    assert_eq!(executed(&h, 2), Some(EndpointId(1)));
    h.check_invariants().unwrap();
}

#[test]
fn unsupported_only_registry_still_attaches_ahead() {
    let mut h = Harness::new(2);
    h.ledger.set_unsupported(EndpointId(1), ApnType::Mms);
    h.add(
        NetworkRequest::new(1)
            .with_capability(Capability::Mms)
            .with_specifier(Specifier::Endpoint(EndpointId(1)))
            .with_priority(9),
    );
    assert_eq!(h.commands(), vec![RadioCommand::attach(EndpointId(0), 1)]);
    h.settle();

    assert_eq!(h.arbiter.active_endpoint(), Some(EndpointId(0)));
    assert_eq!(executed(&h, 1), None);
    h.check_invariants().unwrap();
}

// ─── Default Data Endpoint ──────────────────────────────────────────────────

#[test]
fn default_change_moves_request_with_one_ref_count_pair() {
    let mut h = Harness::builder(2).attach_ahead(false).build();
    h.add(default_routed(1));
    h.settle();
    assert_eq!(executed(&h, 1), Some(EndpointId(0)));
    let before = h.ledger.events().len();

    h.change_default(EndpointId(1));
    assert_eq!(executed(&h, 1), None);
    h.settle();

    let delta = &h.ledger.events()[before..];
    assert_eq!(delta.len(), 2, "unexpected ref-count traffic: {:?}", delta);
    assert_eq!((delta[0].endpoint, delta[0].delta), (EndpointId(0), -1));
    assert_eq!((delta[1].endpoint, delta[1].delta), (EndpointId(1), 1));
    assert_eq!(executed(&h, 1), Some(EndpointId(1)));
    assert_eq!(h.arbiter.active_endpoint(), Some(EndpointId(1)));
    h.check_invariants().unwrap();
}

#[test]
fn pinned_request_ignores_default_change() {
    let mut h = Harness::builder(2).attach_ahead(false).build();
    h.add(pinned(1, 0, 5));
    h.settle();
    h.change_default(EndpointId(1));
    h.settle();

    assert_eq!(executed(&h, 1), Some(EndpointId(0)));
    assert_eq!(h.ledger.decrements(), 0);
}

#[test]
fn out_of_range_default_is_ignored() {
    let mut h = Harness::builder(2).attach_ahead(false).build();
    h.add(default_routed(1));
    h.settle();
    h.change_default(EndpointId(7));
    h.settle();

    assert_eq!(h.arbiter.default_endpoint(), EndpointId(0));
    assert_eq!(executed(&h, 1), Some(EndpointId(0)));
}

// ─── Policy Gate ────────────────────────────────────────────────────────────

#[test]
fn timed_disallow_idles_then_reexecutes() {
    let mut h = Harness::builder(2).attach_ahead(false).build();
    h.add(pinned(1, 0, 5));
    h.settle();

    h.set_allowed(false, Duration::from_millis(1000));
    h.settle();
    assert_eq!(h.arbiter.active_endpoint(), None);
    assert_eq!(executed(&h, 1), None);
    assert_eq!(h.ledger.ref_count(EndpointId(0), ApnType::Default), 0);
    h.check_invariants().unwrap();

    h.advance(Duration::from_millis(999));
    h.settle();
    assert_eq!(h.arbiter.active_endpoint(), None);

    h.advance(Duration::from_millis(1));
    h.settle();
    assert!(h.arbiter.policy().is_allowed());
    assert_eq!(h.arbiter.active_endpoint(), Some(EndpointId(0)));
    assert_eq!(executed(&h, 1), Some(EndpointId(0)));
    h.check_invariants().unwrap();
}

#[test]
fn explicit_allow_cancels_reenable_timer() {
    let mut h = Harness::builder(2).attach_ahead(false).build();
    h.set_allowed(false, Duration::from_millis(500));
    h.set_allowed(true, Duration::ZERO);
    assert!(h.arbiter.next_deadline().is_none());

    h.set_allowed(false, Duration::ZERO);
    h.advance(Duration::from_secs(60));
    assert!(!h.arbiter.policy().is_allowed());
}

#[test]
fn disallowed_requests_are_held() {
    let mut h = Harness::builder(2).attach_ahead(false).build();
    h.set_allowed(false, Duration::ZERO);
    h.add(pinned(1, 1, 3));
    h.settle();
    assert!(h.commands().is_empty());
    assert_eq!(executed(&h, 1), None);

    h.set_allowed(true, Duration::ZERO);
    h.settle();
    assert_eq!(executed(&h, 1), Some(EndpointId(1)));
}

// ─── Release ────────────────────────────────────────────────────────────────

#[test]
fn second_release_is_a_noop() {
    let mut h = Harness::builder(2).attach_ahead(false).build();
    h.add(pinned(1, 0, 5));
    h.settle();

    assert!(h.arbiter.release(RequestId(1)).is_ok());
    let decs = h.ledger.decrements();
    assert_eq!(
        h.arbiter.release(RequestId(1)),
        Err(RegistryError::UnknownRequest(RequestId(1)))
    );
    // Via the event path as well.
    h.remove(RequestId(1));
    h.settle();
    assert_eq!(h.ledger.decrements(), decs);
    assert_eq!(decs, 1);
}

#[test]
fn emptied_registry_keeps_last_attach() {
    let mut h = Harness::new(2);
    h.bootstrap();
    h.settle();
    h.add(pinned(1, 1, 5));
    h.settle();
    assert_eq!(h.store.get(), Some(EndpointId(1)));

    h.remove(RequestId(1));
    h.settle();
    // Fallback follows the last confirmed attach, so no churn back to ep0.
    assert_eq!(h.arbiter.active_endpoint(), Some(EndpointId(1)));
    assert_eq!(
        h.arbiter.switch(EndpointId(1)).unwrap().state(),
        SwitchState::Attached
    );
}

// ─── Capabilities ───────────────────────────────────────────────────────────

#[test]
fn unsupported_apn_is_accepted_but_never_executed() {
    let mut h = Harness::builder(2).attach_ahead(false).build();
    h.ledger.set_unsupported(EndpointId(1), ApnType::Mms);
    h.add(
        NetworkRequest::new(1)
            .with_capability(Capability::Mms)
            .with_specifier(Specifier::Endpoint(EndpointId(1)))
            .with_priority(9),
    );
    h.add(pinned(2, 0, 1));
    h.settle();

    assert!(h.arbiter.registry().contains(RequestId(1)));
    assert_eq!(executed(&h, 1), None);
    // The unsupported request does not drag the radio to ep1.
    assert_eq!(h.arbiter.active_endpoint(), Some(EndpointId(0)));
    assert_eq!(executed(&h, 2), Some(EndpointId(0)));
    h.check_invariants().unwrap();
}

#[test]
fn subscription_specifier_resolves_through_directory() {
    let mut h = Harness::builder(2).attach_ahead(false).build();
    h.add(
        NetworkRequest::new(1)
            .with_capability(Capability::Ims)
            .with_specifier(Specifier::Subscription(101)),
    );
    h.settle();
    assert_eq!(executed(&h, 1), Some(EndpointId(1)));
    assert_eq!(h.ledger.ref_count(EndpointId(1), ApnType::Ims), 1);
}

#[test]
fn default_priority_comes_from_channel_or_config() {
    let mut config = phoneswitch::ArbiterConfig {
        endpoint_count: 2,
        attach_ahead: false,
        ..Default::default()
    };
    config.apn_priority.insert(ApnType::Supl, 42);
    let mut h = Harness::builder(2).config(config).build();
    h.add(
        NetworkRequest::new(1)
            .with_capability(Capability::Ims)
            .with_specifier(Specifier::Endpoint(EndpointId(0))),
    );
    h.add(
        NetworkRequest::new(2)
            .with_capability(Capability::Supl)
            .with_specifier(Specifier::Endpoint(EndpointId(1))),
    );
    assert_eq!(h.arbiter.registry().get(RequestId(1)).unwrap().priority, 5);
    assert_eq!(h.arbiter.registry().get(RequestId(2)).unwrap().priority, 42);
    h.settle();
    assert_eq!(h.arbiter.active_endpoint(), Some(EndpointId(1)));
}

// ─── Startup ────────────────────────────────────────────────────────────────

#[test]
fn idle_boot_session_is_torn_down_without_requests() {
    let mut h = Harness::builder(2)
        .attach_ahead(false)
        .attached_at_boot(&[1])
        .build();
    h.bootstrap();
    h.settle();
    // With no requests the lingering session is torn down toward the fallback.
    assert_eq!(
        h.commands(),
        vec![RadioCommand::detach(EndpointId(1), 1)]
    );
    assert_eq!(h.arbiter.active_endpoint(), None);
}

#[test]
fn unknown_endpoint_confirmation_is_ignored() {
    let mut h = Harness::new(2);
    h.event(ArbiterEvent::AttachConfirmed {
        endpoint: EndpointId(9),
        epoch: 1,
    });
    h.settle();
    h.check_invariants().unwrap();
}
