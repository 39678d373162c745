//! Connector and mock broker tests
//!
//! Exercises the [`Connector`] abstraction the way the client uses it:
//! generically, and through a boxed stream.

use common::test_utils::{MockBroker, MockConnector, create_mock_device, with_timeout};
use common::{BoxedStream, Connector};
use protocol::{DeviceList, FrameDecoder, Request, read_frame_async, write_frame_async};
use serde_json::json;

async fn list_over<C: Connector>(connector: &C) -> DeviceList {
    let mut stream = connector.connect().await.expect("Failed to connect");
    let mut decoder = FrameDecoder::new();

    write_frame_async(&mut stream, &Request::UsbList)
        .await
        .expect("Failed to send request");
    let reply = read_frame_async(&mut stream, &mut decoder)
        .await
        .expect("Failed to read reply")
        .expect("Connection closed before reply");

    DeviceList::from_frame(&reply).expect("Failed to parse device list")
}

#[tokio::test]
async fn test_generic_connector() {
    let broker = MockBroker::new();
    broker.set_devices(vec![
        create_mock_device("/dev/a", "Keyboard", &["vmA"]),
        create_mock_device("/dev/b", "Mouse", &["vmA", "vmB"]),
    ]);

    let list = with_timeout(list_over(&MockConnector::new(broker.clone()))).await;
    assert_eq!(list.len(), 2);
    assert_eq!(list.devices[1].allowed_vms.as_deref(), Some(&["vmA".to_string(), "vmB".to_string()][..]));
    assert_eq!(broker.connections(), 1);
}

#[tokio::test]
async fn test_boxed_stream() {
    let broker = MockBroker::new();
    let connector = MockConnector::new(broker.clone());

    let mut stream: BoxedStream = Box::new(connector.connect().await.expect("Failed to connect"));
    let mut decoder = FrameDecoder::new();

    write_frame_async(&mut stream, &Request::EnableNotifications)
        .await
        .expect("Failed to send request");
    let reply = with_timeout(read_frame_async(&mut stream, &mut decoder))
        .await
        .expect("Failed to read reply")
        .expect("Connection closed before reply");
    assert!(reply.is_ok());

    broker.wait_for_subscribers(1).await;
    assert_eq!(broker.push(json!({"event": "usb_detached"})), 1);

    let push = with_timeout(read_frame_async(&mut stream, &mut decoder))
        .await
        .expect("Failed to read push")
        .expect("Connection closed before push");
    assert_eq!(push.event(), Some("usb_detached"));
}

#[tokio::test]
async fn test_disconnect_all_closes_streams() {
    let broker = MockBroker::new();
    let connector = MockConnector::new(broker.clone());
    let mut stream = connector.connect().await.expect("Failed to connect");
    let mut decoder = FrameDecoder::new();

    write_frame_async(&mut stream, &Request::EnableNotifications)
        .await
        .expect("Failed to send request");
    read_frame_async(&mut stream, &mut decoder)
        .await
        .expect("Failed to read reply");

    broker.disconnect_all();
    let eof = with_timeout(read_frame_async(&mut stream, &mut decoder))
        .await
        .expect("Failed to read after disconnect");
    assert!(eof.is_none());
}
