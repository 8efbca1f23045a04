mod common;

use smsfleet::gateway::GatewayCall;
use smsfleet::pool::Health;

#[tokio::test]
async fn health_transitions_follow_each_rescan() {
    let fleet = common::fleet(2);
    let pool = fleet.session().pool().clone();
    let (a, b) = (&fleet.devices[0], &fleet.devices[1]);

    let modems = pool.rescan().await;
    assert_eq!(modems.len(), 2);
    assert!(modems.iter().all(|m| m.health == Health::Ok));
    assert_eq!(modems[0].chip_number.as_deref(), Some("+5511900000000"));

    fleet.gateway.unplug(b);
    pool.rescan().await;
    assert_eq!(pool.health_of(a), Some(Health::Ok));
    assert_eq!(pool.health_of(b), Some(Health::Fail));
    assert_eq!(pool.healthy(), vec![a.clone()]);
    let snapshot = pool.snapshot();
    assert!(snapshot[1].chip_number.is_none());
    assert!(snapshot[1].last_error.is_some());

    fleet.gateway.add_modem(b, None);
    pool.rescan().await;
    assert_eq!(pool.health_of(b), Some(Health::Ok));

    // device node disappears: dropped from the pool
    std::fs::remove_file(b).unwrap();
    pool.rescan().await;
    assert_eq!(pool.health_of(b), None);
    assert_eq!(pool.snapshot().len(), 1);
}

#[tokio::test]
async fn validation_disabled_reports_unknown() {
    let mut fleet = common::fleet(1);
    fleet.config.modems.validate = false;
    let pool = fleet.session().pool().clone();
    let modems = pool.rescan().await;
    assert_eq!(modems[0].health, Health::Unknown);
    assert!(fleet.gateway.calls().is_empty());
    assert_eq!(pool.dispatchable(&fleet.devices), fleet.devices);
}

#[tokio::test]
async fn busy_port_is_released_once_and_retried() {
    let mut fleet = common::fleet(1);
    fleet.config.modems.release_busy_ports = true;
    let dev = fleet.devices[0].clone();
    fleet.gateway.set_busy(&dev);

    let pool = fleet.session().pool().clone();
    let modems = pool.rescan().await;
    assert_eq!(modems[0].health, Health::Ok);
    let calls = fleet.gateway.calls();
    assert_eq!(
        calls,
        vec![
            GatewayCall::Identify(dev.clone()),
            GatewayCall::Release(vec![dev.clone()]),
            GatewayCall::Identify(dev.clone()),
        ]
    );
}

#[tokio::test]
async fn activation_failures_are_isolated() {
    let fleet = common::fleet(3);
    fleet.gateway.fail_activation(&fleet.devices[1]);
    let pool = fleet.session().pool().clone();
    pool.rescan().await;

    let results = pool.activate_selected(&fleet.devices).await;
    assert_eq!(results.len(), 3);
    assert!(results[0].1.is_ok());
    assert!(results[1].1.is_err());
    assert!(results[2].1.is_ok());
    let activations = fleet
        .gateway
        .calls()
        .into_iter()
        .filter(|c| matches!(c, GatewayCall::Activate { commands, .. } if commands == &vec!["AT".to_string(), "AT+CMGF=1".to_string()]))
        .count();
    assert_eq!(activations, 3);
}

#[tokio::test]
async fn keepalive_demotes_and_skips_busy_modems() {
    let fleet = common::fleet(3);
    let pool = fleet.session().pool().clone();
    pool.rescan().await;
    fleet.gateway.unplug(&fleet.devices[0]);

    let held = pool.locks().acquire(&fleet.devices[2]).await;
    let summary = pool.keepalive_tick().await;
    drop(held);

    assert_eq!(summary.demoted, vec![fleet.devices[0].clone()]);
    assert_eq!(summary.answered, vec![fleet.devices[1].clone()]);
    assert_eq!(summary.skipped_busy, vec![fleet.devices[2].clone()]);
    assert_eq!(pool.health_of(&fleet.devices[0]), Some(Health::Fail));
    assert_eq!(pool.health_of(&fleet.devices[2]), Some(Health::Ok));

    // demoted modems are no longer keepalive targets
    let summary = pool.keepalive_tick().await;
    assert_eq!(summary.answered.len(), 2);
    assert!(summary.demoted.is_empty());
}

#[tokio::test]
async fn auto_activation_on_session_start() {
    let mut fleet = common::fleet(2);
    fleet.config.activation.auto_activate_on_start = true;
    let mut session = fleet.session();
    session.start(false).await;
    let activated: Vec<_> = fleet
        .gateway
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            GatewayCall::Activate { device, .. } => Some(device),
            _ => None,
        })
        .collect();
    assert_eq!(activated, fleet.devices);
    session.shutdown().await;
}
