mod common;

use std::sync::Arc;

use tempfile::tempdir;
use tokio_test::assert_ok;

use motorlink_core::event::Notification;
use motorlink_core::types::{Attr, DeviceId, Value};
use motorlink_devices::error::{DeviceError, ErrorCode};
use motorlink_devices::{ConnectionStatus, MotorContext};

use common::{drain, next_matching, provider_with, test_config, wait_until, Simulator};

fn went(device: DeviceId, online: bool) -> impl Fn(&Notification) -> bool {
    let value = Value::Integer(i64::from(online));
    move |n: &Notification| {
        matches!(
            n,
            Notification::DataChanged { device: d, attr: Attr::OnlineStatus, value: v }
                if *d == device && *v == value
        )
    }
}

#[test_log::test(tokio::test)]
async fn test_missed_heartbeats_take_motor_offline_and_back() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.motor.heartbeat_interval_ms = 30;
    config.motor.request_all_on_register = false;

    let sim = Simulator::new(&[(1, 0x71)]);
    let provider = provider_with(&[("ttyA", &sim)]);
    let context = assert_ok!(MotorContext::with_defaults(config, Arc::new(provider)));
    let mut rx = context.subscribe();
    assert_ok!(context.start_recognize(false).await);
    let registry = context.registry().clone();
    assert!(assert_ok!(registry.is_online(DeviceId(1))));

    sim.set_silent(true);
    next_matching(&mut rx, went(DeviceId(1), false)).await;
    assert!(!assert_ok!(registry.is_online(DeviceId(1))));
    assert!(assert_ok!(registry.record(DeviceId(1))).heartbeat_failures() >= 3);

    sim.set_silent(false);
    next_matching(&mut rx, went(DeviceId(1), true)).await;
    assert!(assert_ok!(registry.is_online(DeviceId(1))));
    assert_eq!(assert_ok!(registry.record(DeviceId(1))).heartbeat_failures(), 0);

    context.shutdown().await;
}

#[tokio::test]
async fn test_answered_heartbeats_keep_motor_online() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.motor.heartbeat_interval_ms = 20;
    config.motor.request_all_on_register = false;

    let sim = Simulator::new(&[(1, 0x72)]);
    let provider = provider_with(&[("ttyA", &sim)]);
    let context = assert_ok!(MotorContext::with_defaults(config, Arc::new(provider.clone())));
    assert_ok!(context.start_recognize(false).await);
    let mut rx = context.subscribe();

    let port = provider.port("ttyA").expect("port");
    wait_until("several heartbeats", || port.written().len() >= 6).await;
    assert!(assert_ok!(context.registry().is_online(DeviceId(1))));
    assert!(!drain(&mut rx).iter().any(went(DeviceId(1), false)));

    context.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_vanished_link_takes_its_motors_offline() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.motor.request_all_on_register = false;

    let bus_a = Simulator::new(&[(1, 0x81), (2, 0x82)]);
    let bus_b = Simulator::new(&[(3, 0x83)]);
    let provider = provider_with(&[("ttyA", &bus_a), ("ttyB", &bus_b)]);
    let context = assert_ok!(MotorContext::with_defaults(config, Arc::new(provider.clone())));
    assert_ok!(context.start_recognize(false).await);
    let mut rx = context.subscribe();

    provider.port("ttyA").expect("port").unplug();
    let mut lost = assert_ok!(context.remove_unavailable_links().await);
    lost.sort();
    assert_eq!(lost, vec![DeviceId(1), DeviceId(2)]);

    let link_lost: Vec<Notification> = drain(&mut rx)
        .into_iter()
        .filter(|n| {
            matches!(n, Notification::ConnectionError { code, .. } if *code == ErrorCode::LinkLost.code())
        })
        .collect();
    assert_eq!(link_lost.len(), 2);

    let registry = context.registry();
    assert!(!assert_ok!(registry.is_online(DeviceId(1))));
    assert!(!assert_ok!(registry.is_online(DeviceId(2))));
    assert!(assert_ok!(registry.is_online(DeviceId(3))));
    assert!(matches!(
        registry.request_value(DeviceId(1), Attr::VelActual),
        Err(DeviceError::UnknownDevice(DeviceId(1)))
    ));
    assert_ok!(registry.request_value(DeviceId(3), Attr::VelActual));

    context.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_heartbeat_revives_link_after_write_failure() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.motor.heartbeat_interval_ms = 30;
    config.motor.request_all_on_register = false;

    let sim = Simulator::new(&[(1, 0x91), (2, 0x92)]);
    let provider = provider_with(&[("ttyA", &sim)]);
    let context = assert_ok!(MotorContext::with_defaults(config, Arc::new(provider.clone())));
    assert_ok!(context.start_recognize(false).await);
    let mut rx = context.subscribe();
    let registry = context.registry().clone();
    let router = context.router().clone();
    let transport = assert_ok!(router.transport(router.link_of(DeviceId(1)).expect("route")));
    let port = provider.port("ttyA").expect("port");

    port.set_fail_writes(true);
    next_matching(&mut rx, went(DeviceId(1), false)).await;
    assert_eq!(transport.status(), ConnectionStatus::Failed);
    assert!(matches!(
        registry.request_value(DeviceId(1), Attr::VelActual),
        Err(DeviceError::LinkUnavailable(_))
    ));

    // One answered heartbeat brings the link and its motors back
    port.set_fail_writes(false);
    next_matching(&mut rx, went(DeviceId(1), true)).await;
    wait_until("both motors online", || {
        registry.is_online(DeviceId(2)).ok() == Some(true)
    })
    .await;
    assert_eq!(transport.status(), ConnectionStatus::Connected);
    assert_ok!(registry.request_value(DeviceId(1), Attr::VelActual));

    context.shutdown().await;
}
