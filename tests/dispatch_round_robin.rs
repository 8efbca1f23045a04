mod common;

use std::collections::HashMap;

use smsfleet::dispatch::{plan, CancelToken};
use smsfleet::history::Status;
use smsfleet::import::{parse_pasted, Recipient};

fn recipients(n: usize) -> Vec<Recipient> {
    (0..n)
        .map(|i| Recipient {
            name: format!("R{i}"),
            phone_number: format!("55119{:08}", i),
            source_row: i + 1,
        })
        .collect()
}

#[test]
fn fairness_for_any_batch_size() {
    let modems: Vec<String> = (0..3).map(|i| format!("/dev/ttyUSB{i}")).collect();
    for r in 0..20 {
        let tasks = plan(&recipients(r), &modems, "hi", false);
        assert_eq!(tasks.len(), r);
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for t in &tasks {
            *counts.entry(t.assigned_modem.as_str()).or_default() += 1;
        }
        for m in &modems {
            let c = counts.get(m.as_str()).copied().unwrap_or(0);
            assert!(c == r / 3 || c == r.div_ceil(3), "r={r} modem={m} got {c}");
        }
        for (i, t) in tasks.iter().enumerate() {
            assert_eq!(t.assigned_modem, modems[i % 3]);
        }
    }
}

#[test]
fn plan_is_deterministic() {
    let modems = vec!["/dev/a".to_string(), "/dev/b".to_string()];
    let batch = recipients(7);
    assert_eq!(
        plan(&batch, &modems, "Oi <NAME>", true),
        plan(&batch, &modems, "Oi <NAME>", true)
    );
}

#[tokio::test]
async fn run_sends_in_planned_order_and_records_everything() {
    let fleet = common::fleet(2);
    let mut session = fleet.session();
    session.start(false).await;

    let batch = parse_pasted("11911110000 11922220000 11933330000", "55");
    let report = session
        .dispatcher()
        .send_batch(&batch, &fleet.devices, "Oi <NAME>!", false, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(report.sent, 3);
    assert_eq!(report.failed, 0);
    let sends = fleet.gateway.sends();
    let expected = vec![
        (fleet.devices[0].clone(), "+5511911110000".to_string()),
        (fleet.devices[1].clone(), "+5511922220000".to_string()),
        (fleet.devices[0].clone(), "+5511933330000".to_string()),
    ];
    let got: Vec<_> = sends.iter().map(|(d, n, _)| (d.clone(), n.clone())).collect();
    assert_eq!(got, expected);
    // empty name substituted
    assert_eq!(sends[0].2, "Oi !");

    let history = session.history().query(None, None).await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|r| r.status == Status::Sent));
    assert_eq!(history[1].modem, fleet.devices[1]);
    session.shutdown().await;
}

#[tokio::test]
async fn one_failure_does_not_abort_the_run() {
    let fleet = common::fleet(1);
    let mut session = fleet.session();
    session.start(false).await;
    fleet.gateway.fail_number("5511922220000");

    let batch = parse_pasted("11911110000 11922220000 11933330000", "55");
    let report = session
        .dispatcher()
        .send_batch(&batch, &fleet.devices, "x", false, &CancelToken::new())
        .await
        .unwrap();
    assert_eq!((report.sent, report.failed), (2, 1));
    assert_eq!(report.records[1].status, Status::Failed);
    assert!(report.reasons[&1].contains("rejected"));
    assert_eq!(fleet.gateway.sends().len(), 3);
}
