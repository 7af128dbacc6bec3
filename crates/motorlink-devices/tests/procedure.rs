mod common;

use std::sync::Arc;

use tempfile::tempdir;
use tokio_test::assert_ok;

use motorlink_core::event::{Notification, ProcedureKind};
use motorlink_core::types::{Attr, DeviceId, MotorMode, Value};
use motorlink_devices::error::DeviceError;
use motorlink_devices::MotorContext;

use common::{next_matching, provider_with, test_config, wait_until, Simulator};

async fn single_motor() -> (MotorContext, Arc<Simulator>, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.motor.request_all_on_register = false;
    let sim = Simulator::new(&[(1, 0x51), (2, 0x52)]);
    let provider = provider_with(&[("ttyA", &sim)]);
    let context = assert_ok!(MotorContext::with_defaults(config, Arc::new(provider)));
    assert_ok!(context.start_recognize(false).await);
    (context, sim, dir)
}

#[test_log::test(tokio::test)]
async fn test_calibration_runs_to_completion() {
    let (context, _sim, _dir) = single_motor().await;
    let registry = context.registry();
    let mut rx = context.subscribe();

    let handle = assert_ok!(registry.start_calibration(DeviceId(1)));
    assert_eq!(handle.kind(), ProcedureKind::Calibration);
    assert_ok!(handle.wait().await);

    assert_eq!(
        assert_ok!(registry.get_value(DeviceId(1), Attr::CalibrationAngle)),
        Value::Float(42.5)
    );
    assert!(!assert_ok!(registry.procedure_running(DeviceId(1))));
    let finished = next_matching(&mut rx, |n| {
        matches!(n, Notification::ProcedureFinished { .. })
    })
    .await;
    assert_eq!(
        finished,
        Notification::ProcedureFinished {
            device: DeviceId(1),
            kind: ProcedureKind::Calibration,
            failure: None,
        }
    );

    context.shutdown().await;
}

#[tokio::test]
async fn test_homing_reaches_position() {
    let (context, _sim, _dir) = single_motor().await;
    let registry = context.registry();

    let handle = assert_ok!(registry.start_homing(DeviceId(2), 1));
    assert_ok!(handle.wait().await);
    assert_eq!(
        assert_ok!(registry.get_value(DeviceId(2), Attr::PosHoming)),
        Value::Float(-3.25)
    );
    // The mode write was acknowledged and confirmed along the way
    assert_eq!(
        assert_ok!(registry.get_value(DeviceId(2), Attr::ModeId)),
        Value::from(MotorMode::Homing)
    );

    context.shutdown().await;
}

#[tokio::test]
async fn test_rejection_aborts_at_current_step() {
    let (context, sim, _dir) = single_motor().await;
    let registry = context.registry();
    let mut rx = context.subscribe();

    sim.reject(Attr::ModeId);
    let handle = assert_ok!(registry.start_homing(DeviceId(1), 2));
    let result = handle.wait().await;
    assert!(matches!(
        result,
        Err(DeviceError::SequenceAborted {
            kind: ProcedureKind::Homing,
            step: "configure",
            ..
        })
    ));

    let finished = next_matching(&mut rx, |n| {
        matches!(n, Notification::ProcedureFinished { .. })
    })
    .await;
    assert!(matches!(
        finished,
        Notification::ProcedureFinished { failure: Some(_), .. }
    ));
    assert!(assert_ok!(registry.get_value(DeviceId(1), Attr::PosHoming)).is_null());

    context.shutdown().await;
}

#[tokio::test]
async fn test_one_procedure_per_motor() {
    let (context, _sim, _dir) = single_motor().await;
    let registry = context.registry();

    let first = assert_ok!(registry.start_calibration(DeviceId(1)));
    assert!(matches!(
        registry.start_homing(DeviceId(1), 1),
        Err(DeviceError::ProcedureBusy(DeviceId(1)))
    ));
    // Other motors are independent
    let other = assert_ok!(registry.start_calibration(DeviceId(2)));

    assert_ok!(first.wait().await);
    assert_ok!(other.wait().await);

    context.shutdown().await;
}

#[tokio::test]
async fn test_offline_motor_refuses_procedures() {
    let (context, _sim, _dir) = single_motor().await;
    let registry = context.registry().clone();

    registry.handle_link_lost(&[DeviceId(1)]);
    wait_until("motor offline", || {
        registry.is_online(DeviceId(1)).ok() == Some(false)
    })
    .await;
    assert!(matches!(
        registry.start_calibration(DeviceId(1)),
        Err(DeviceError::SequenceAborted { .. })
    ));

    context.shutdown().await;
}
