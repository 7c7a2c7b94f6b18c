//! Device monitor behavior against a stub multiplexer

#[macro_use]
mod common;

use std::time::Duration;

use muxdev::{
    usbmuxd::{monitor::DeviceMonitor, monitor::MonitorEvent, UsbmuxdAddr},
    MuxdevError,
};
use tokio::{io::AsyncReadExt, sync::oneshot};

use common::{
    attached_event, detached_event, listener, serve_monitor_handshake, write_mux_frame, TEST_UDID,
};

async fn expect_no_event(events: &mut tokio::sync::mpsc::UnboundedReceiver<MonitorEvent>) {
    match tokio::time::timeout(Duration::from_millis(100), events.recv()).await {
        Err(_) => {}
        Ok(event) => panic!("expected silence, got {event:?}"),
    }
}

#[tokio::test]
async fn discovery_attach_and_detach() {
    let (listener, addr) = listener().await;
    let (attach_tx, attach_rx) = oneshot::channel::<()>();
    let (detach_tx, detach_rx) = oneshot::channel::<()>();

    let stub = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        serve_monitor_handshake(&mut sock).await;

        attach_rx.await.unwrap();
        write_mux_frame(&mut sock, &attached_event(7, TEST_UDID), 0).await;

        detach_rx.await.unwrap();
        write_mux_frame(&mut sock, &detached_event(7), 0).await;

        // Keep the connection up until the monitor goes away
        let mut buf = [0u8; 1];
        let _ = sock.read(&mut buf).await;
    });

    let monitor = DeviceMonitor::start(UsbmuxdAddr::TcpSocket(addr), "monitor-test");
    // The monitor task has not run yet, so the sink observes everything
    let (snapshot, mut events) = monitor.subscribe();
    assert!(snapshot.is_empty());

    assert_eq!(events.recv().await, Some(MonitorEvent::Connected));

    attach_tx.send(()).unwrap();
    assert_eq!(
        events.recv().await,
        Some(MonitorEvent::DeviceAttached(TEST_UDID.to_string()))
    );
    assert_eq!(monitor.list_devices(), vec![TEST_UDID.to_string()]);
    assert_eq!(monitor.get_device_id(TEST_UDID), Some(7));
    // Exactly once
    expect_no_event(&mut events).await;

    detach_tx.send(()).unwrap();
    assert_eq!(
        events.recv().await,
        Some(MonitorEvent::DeviceDetached(TEST_UDID.to_string()))
    );
    assert!(monitor.list_devices().is_empty());
    assert_eq!(monitor.get_device_id(TEST_UDID), None);

    drop(monitor);
    stub.await.unwrap();
}

#[tokio::test]
async fn non_usb_attaches_are_ignored() {
    let (listener, addr) = listener().await;

    let stub = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        serve_monitor_handshake(&mut sock).await;

        let mut event = attached_event(3, "network-device-udid");
        let mut properties = event
            .get("Properties")
            .unwrap()
            .as_dictionary()
            .unwrap()
            .clone();
        properties.insert("ConnectionType".into(), "Network".into());
        properties.insert(
            "NetworkAddress".into(),
            plist::Value::Data(vec![
                0x02, 0x00, 0x00, 0x00, 192, 168, 1, 5, 0, 0, 0, 0, 0, 0, 0, 0,
            ]),
        );
        event.insert("Properties".into(), plist::Value::Dictionary(properties));
        write_mux_frame(&mut sock, &event, 0).await;
        write_mux_frame(&mut sock, &attached_event(4, TEST_UDID), 0).await;

        let mut buf = [0u8; 1];
        let _ = sock.read(&mut buf).await;
    });

    let monitor = DeviceMonitor::start(UsbmuxdAddr::TcpSocket(addr), "monitor-test");
    let (_, mut events) = monitor.subscribe();

    assert_eq!(events.recv().await, Some(MonitorEvent::Connected));
    // The network attach produces nothing; the USB attach follows
    assert_eq!(
        events.recv().await,
        Some(MonitorEvent::DeviceAttached(TEST_UDID.to_string()))
    );
    assert_eq!(monitor.get_device_id("network-device-udid"), None);

    drop(monitor);
    stub.await.unwrap();
}

#[tokio::test]
async fn reconnects_after_connection_loss() {
    let (listener, addr) = listener().await;

    let stub = tokio::spawn(async move {
        // First connection: handshake, one attach, then drop
        let (mut sock, _) = listener.accept().await.unwrap();
        serve_monitor_handshake(&mut sock).await;
        write_mux_frame(&mut sock, &attached_event(7, TEST_UDID), 0).await;
        drop(sock);

        // The monitor comes back on its own
        let (mut sock, _) = listener.accept().await.unwrap();
        serve_monitor_handshake(&mut sock).await;
        write_mux_frame(&mut sock, &attached_event(8, TEST_UDID), 0).await;

        let mut buf = [0u8; 1];
        let _ = sock.read(&mut buf).await;
    });

    let monitor = DeviceMonitor::start(UsbmuxdAddr::TcpSocket(addr), "monitor-test");
    let (_, mut events) = monitor.subscribe();

    assert_eq!(events.recv().await, Some(MonitorEvent::Connected));
    assert_eq!(
        events.recv().await,
        Some(MonitorEvent::DeviceAttached(TEST_UDID.to_string()))
    );
    assert_eq!(events.recv().await, Some(MonitorEvent::Disconnected));
    // Registry resets with the connection
    assert_eq!(monitor.get_device_id(TEST_UDID), None);

    assert_eq!(events.recv().await, Some(MonitorEvent::Connected));
    assert_eq!(
        events.recv().await,
        Some(MonitorEvent::DeviceAttached(TEST_UDID.to_string()))
    );
    // The device came back under a fresh muxer id
    assert_eq!(monitor.get_device_id(TEST_UDID), Some(8));

    drop(monitor);
    stub.await.unwrap();
}

#[tokio::test]
async fn connect_thru_unknown_udid_sends_nothing() {
    let (muxd_listener, muxd_addr) = listener().await;

    // Monitor with an empty registry
    let monitor_stub = tokio::spawn(async move {
        let (mut sock, _) = muxd_listener.accept().await.unwrap();
        serve_monitor_handshake(&mut sock).await;
        let mut buf = [0u8; 1];
        let _ = sock.read(&mut buf).await;
    });
    let monitor = DeviceMonitor::start(UsbmuxdAddr::TcpSocket(muxd_addr), "monitor-test");
    let (_, mut events) = monitor.subscribe();
    assert_eq!(events.recv().await, Some(MonitorEvent::Connected));

    // A second muxer connection for the tunnel attempt; the stub asserts
    // the client sends no bytes at all
    let (tunnel_listener, tunnel_addr) = listener().await;
    let tunnel_stub = tokio::spawn(async move {
        let (mut sock, _) = tunnel_listener.accept().await.unwrap();
        let mut buf = [0u8; 1];
        let n = sock.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "client sent bytes before failing the lookup");
    });

    let conn = UsbmuxdAddr::TcpSocket(tunnel_addr)
        .connect(0, "monitor-test")
        .await
        .unwrap();
    match conn
        .connect_thru(&monitor, "no-such-udid", 62078, "monitor-test")
        .await
    {
        Err(MuxdevError::DeviceNotFound) => {}
        other => panic!("expected DeviceNotFound, got {other:?}"),
    }

    tunnel_stub.await.unwrap();
    drop(monitor);
    monitor_stub.await.unwrap();
}
