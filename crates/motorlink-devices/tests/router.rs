mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_test::{assert_err, assert_ok};

use motorlink_core::event::{Notification, NotificationBus};
use motorlink_core::types::DeviceId;
use motorlink_devices::error::{DeviceError, ErrorCode};
use motorlink_devices::link::{LinkProvider, MemoryLinkProvider};
use motorlink_devices::router::DeviceRouter;
use motorlink_devices::ConnectionStatus;

use common::{drain, wait_until};

fn router(provider: &MemoryLinkProvider) -> (DeviceRouter, NotificationBus) {
    let bus = NotificationBus::new();
    let provider: Arc<dyn LinkProvider> = Arc::new(provider.clone());
    let (router, _events) = DeviceRouter::new(provider, Duration::from_millis(5), bus.clone());
    (router, bus)
}

fn frame(tag: &str) -> Bytes {
    Bytes::copy_from_slice(tag.as_bytes())
}

#[test_log::test(tokio::test)]
async fn test_per_device_order_is_preserved() {
    let provider = MemoryLinkProvider::new();
    let port = provider.add_port("ttyA");
    let (router, _bus) = router(&provider);

    let link = assert_ok!(router.add_link("ttyA", 1_500_000).await);
    let (x, y) = (DeviceId(1), DeviceId(2));
    assert_ok!(router.add_relation(link, x));
    assert_ok!(router.add_relation(link, y));

    for tag in ["x1", "y1", "x2", "y2", "x3"] {
        let device = if tag.starts_with('x') { x } else { y };
        assert_ok!(router.send(device, frame(tag)));
    }

    wait_until("all frames written", || port.written().len() == 5).await;
    let written: Vec<Bytes> = port.written();
    let stream = |prefix: u8| -> Vec<Bytes> {
        written.iter().filter(|f| f[0] == prefix).cloned().collect()
    };
    assert_eq!(stream(b'x'), vec![frame("x1"), frame("x2"), frame("x3")]);
    assert_eq!(stream(b'y'), vec![frame("y1"), frame("y2")]);
    assert!(!router.has_pending_data());

    router.shutdown().await;
}

#[tokio::test]
async fn test_unknown_device_is_refused() {
    let provider = MemoryLinkProvider::new();
    let port = provider.add_port("ttyA");
    let (router, _bus) = router(&provider);
    assert_ok!(router.add_link("ttyA", 1_500_000).await);

    let result = router.send(DeviceId(9), frame("lost"));
    assert!(matches!(result, Err(DeviceError::UnknownDevice(DeviceId(9)))));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(port.written().is_empty());

    router.shutdown().await;
}

#[tokio::test]
async fn test_missing_port_is_link_error() {
    let provider = MemoryLinkProvider::new();
    let (router, _bus) = router(&provider);
    assert!(matches!(
        router.add_link("ttyGone", 9600).await,
        Err(DeviceError::UnknownLink(_))
    ));
    assert!(router.link_names().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_remove_unavailable_links() {
    let provider = MemoryLinkProvider::new();
    let lost = provider.add_port("ttyA");
    let kept = provider.add_port("ttyB");
    let (router, bus) = router(&provider);
    let mut rx = bus.subscribe();

    let a = assert_ok!(router.add_link("ttyA", 1_500_000).await);
    let b = assert_ok!(router.add_link("ttyB", 1_500_000).await);
    assert_ok!(router.add_relation(a, DeviceId(1)));
    assert_ok!(router.add_relation(a, DeviceId(2)));
    assert_ok!(router.add_relation(b, DeviceId(3)));

    // Park frames on the kept link behind a write failure
    kept.set_fail_writes(true);
    for tag in ["z0", "z1", "z2"] {
        assert_ok!(router.send(DeviceId(3), frame(tag)));
    }
    let kept_transport = assert_ok!(router.transport(b));
    wait_until("kept link failed", || {
        kept_transport.status() == ConnectionStatus::Failed
    })
    .await;
    assert_eq!(kept_transport.pending_for(DeviceId(3)), 2);

    lost.unplug();
    let mut removed = assert_ok!(router.remove_unavailable_links().await);
    removed.sort();
    assert_eq!(removed, vec![DeviceId(1), DeviceId(2)]);

    let errors: Vec<Notification> = drain(&mut rx)
        .into_iter()
        .filter(|n| matches!(n, Notification::ConnectionError { .. }))
        .collect();
    assert_eq!(errors.len(), 2);
    for error in &errors {
        match error {
            Notification::ConnectionError { device, code, .. } => {
                assert!(*device == DeviceId(1) || *device == DeviceId(2));
                assert_eq!(*code, ErrorCode::LinkLost.code());
            }
            other => panic!("unexpected notification {other:?}"),
        }
    }

    // Removed devices are unroutable; the other link is untouched
    assert_err!(router.send(DeviceId(1), frame("x")));
    assert_eq!(router.link_names(), vec!["ttyB".to_string()]);
    assert_eq!(router.link_of(DeviceId(3)), Some(b));
    assert_eq!(kept_transport.pending_for(DeviceId(3)), 2);

    kept.set_fail_writes(false);
    assert_ok!(router.set_connection_status(b, ConnectionStatus::Connected));
    assert_ok!(router.send(DeviceId(3), frame("z3")));
    wait_until("frames on the kept link", || {
        kept.written() == vec![frame("z1"), frame("z2"), frame("z3")]
    })
    .await;
    assert_eq!(lost.close_count(), 1);

    router.shutdown().await;
}

#[tokio::test]
async fn test_remap_moves_queue_and_route() {
    let provider = MemoryLinkProvider::new();
    let port = provider.add_port("ttyA");
    let other = provider.add_port("ttyB");
    let (router, _bus) = router(&provider);
    let a = assert_ok!(router.add_link("ttyA", 1_500_000).await);
    let b = assert_ok!(router.add_link("ttyB", 1_500_000).await);
    assert_ok!(router.add_relation(a, DeviceId(1)));
    assert_ok!(router.add_relation(b, DeviceId(7)));

    // The new id already lives on a different link
    assert!(matches!(
        router.remap(DeviceId(1), DeviceId(7)),
        Err(DeviceError::DuplicateDeviceId(DeviceId(7)))
    ));

    assert_ok!(router.remap(DeviceId(1), DeviceId(4)));
    assert_eq!(router.link_of(DeviceId(1)), None);
    assert_eq!(router.link_of(DeviceId(4)), Some(a));
    assert_ok!(router.send(DeviceId(4), frame("after")));
    wait_until("remapped frame written", || port.written() == vec![frame("after")]).await;
    assert!(other.written().is_empty());

    router.shutdown().await;
}

#[tokio::test]
async fn test_frames_queued_before_remap_keep_their_order() {
    let provider = MemoryLinkProvider::new();
    let port = provider.add_port("ttyA");
    let (router, _bus) = router(&provider);
    let link = assert_ok!(router.add_link("ttyA", 1_500_000).await);
    assert_ok!(router.add_relation(link, DeviceId(1)));
    let transport = assert_ok!(router.transport(link));

    // Nothing below yields, so the drain loop cannot run in between
    assert_ok!(router.send(DeviceId(1), frame("m1")));
    assert_ok!(router.send(DeviceId(1), frame("m2")));
    assert_ok!(router.remap(DeviceId(1), DeviceId(6)));
    assert_eq!(transport.pending_for(DeviceId(1)), 0);
    assert_eq!(transport.pending_for(DeviceId(6)), 2);
    assert_ok!(router.send(DeviceId(6), frame("m3")));

    wait_until("queued frames written", || port.written().len() == 3).await;
    assert_eq!(port.written(), vec![frame("m1"), frame("m2"), frame("m3")]);

    router.shutdown().await;
}

#[tokio::test]
async fn test_failed_link_refuses_until_revived() {
    let provider = MemoryLinkProvider::new();
    let port = provider.add_port("ttyA");
    let (router, _bus) = router(&provider);
    let link = assert_ok!(router.add_link("ttyA", 1_500_000).await);
    assert_ok!(router.add_relation(link, DeviceId(1)));

    port.set_fail_writes(true);
    assert_ok!(router.send(DeviceId(1), frame("boom")));
    let transport = assert_ok!(router.transport(link));
    wait_until("transport failed", || {
        transport.status() == ConnectionStatus::Failed
    })
    .await;
    assert!(matches!(
        router.send(DeviceId(1), frame("refused")),
        Err(DeviceError::LinkUnavailable(_))
    ));

    port.set_fail_writes(false);
    assert_ok!(router.set_connection_status(link, ConnectionStatus::Connected));
    assert_ok!(router.send(DeviceId(1), frame("again")));
    wait_until("frame after revival", || port.written() == vec![frame("again")]).await;

    router.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_flushes_pending_frames() {
    let provider = MemoryLinkProvider::new();
    let port = provider.add_port("ttyA");
    let (router, _bus) = router(&provider);
    let link = assert_ok!(router.add_link("ttyA", 1_500_000).await);
    assert_ok!(router.add_relation(link, DeviceId(1)));

    for i in 0..5 {
        assert_ok!(router.send(DeviceId(1), frame(&format!("f{i}"))));
    }
    router.shutdown().await;

    assert_eq!(port.written().len(), 5);
    assert_eq!(port.close_count(), 1);
    assert!(router.link_names().is_empty());
}
