use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bluegatt::att::Pdu;
use bluegatt::error::{AttError, AttErrorCode, ErrorKind};
use bluegatt::sim::{SimCharacteristic, SimPeripheral, SimService, SimulatedTransport, SERVER_MTU};
use bluegatt::transport::DisconnectReason;
use bluegatt::*;
use futures_lite::{future, Stream, StreamExt};

const THINGY: DeviceId = DeviceId([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
const OTHER: DeviceId = DeviceId([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
const ABSENT: DeviceId = DeviceId([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);

const UI_SERVICE: Uuid = Uuid::from_u128(0xef680300_9b35_4933_9b10_52ffa9740042);
const LED: Uuid = Uuid::from_u128(0xef680301_9b35_4933_9b10_52ffa9740042);
const BUTTON: Uuid = Uuid::from_u128(0xef680302_9b35_4933_9b10_52ffa9740042);
const LOG: Uuid = Uuid::from_u128(0xef680303_9b35_4933_9b10_52ffa9740042);
const ALARM: Uuid = Uuid::from_u128(0xef680304_9b35_4933_9b10_52ffa9740042);

fn thingy() -> SimPeripheral {
    SimPeripheral::new(THINGY).name("Thingy").service(
        SimService::new(UI_SERVICE)
            .characteristic(
                SimCharacteristic::new(LED)
                    .readable()
                    .writable()
                    .value([0x01, 0x00, 0x00, 0x00]),
            )
            .characteristic(SimCharacteristic::new(BUTTON).notify().value([0x00]))
            .characteristic(
                SimCharacteristic::new(LOG)
                    .readable()
                    .writable()
                    .value((0..44).collect::<Vec<u8>>())
                    .descriptor(btuuid::descriptors::CHARACTERISTIC_USER_DESCRIPTION, "log"),
            )
            .characteristic(SimCharacteristic::new(ALARM).readable().indicate().value([0x00])),
    )
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn setup(config: AdapterConfig) -> (SimulatedTransport, Adapter) {
    init_tracing();
    let sim = SimulatedTransport::new();
    sim.add_peripheral(thingy());
    let adapter = Adapter::new(sim.clone(), config).unwrap();
    adapter.open().await.unwrap();
    (sim, adapter)
}

async fn connected(config: AdapterConfig) -> (SimulatedTransport, Adapter, Device) {
    let (sim, adapter) = setup(config).await;
    let device = adapter.open_device(&THINGY);
    adapter.connect_device(&device).await.unwrap();
    (sim, adapter, device)
}

async fn characteristic(device: &Device, uuid: Uuid) -> Characteristic {
    let service = device.discover_services_with_uuid(UI_SERVICE).await.unwrap().remove(0);
    service.discover_characteristics_with_uuid(uuid).await.unwrap().remove(0)
}

async fn next_event(events: &mut (impl Stream<Item = Event> + Unpin)) -> Event {
    tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream ended")
}

/// Collects discovered peripheral ids until the controller reports `PoweredOff`.
async fn discovered_until_power_off(events: &mut (impl Stream<Item = Event> + Unpin)) -> Vec<DeviceId> {
    let mut found = Vec::new();
    loop {
        match next_event(events).await {
            Event::PeripheralDiscovered(adv) => found.push(adv.device.id()),
            Event::StateChanged(PowerState::PoweredOff) => return found,
            _ => {}
        }
    }
}

async fn disconnection(events: &mut (impl Stream<Item = Event> + Unpin)) -> (DeviceId, Option<ErrorKind>) {
    loop {
        if let Event::PeripheralDisconnected { device, error } = next_event(events).await {
            return (device.id(), error.map(|e| e.kind()));
        }
    }
}

async fn connection(events: &mut (impl Stream<Item = Event> + Unpin)) -> (DeviceId, Option<ErrorKind>) {
    loop {
        if let Event::PeripheralConnected { device, error } = next_event(events).await {
            return (device.id(), error.map(|e| e.kind()));
        }
    }
}

async fn wait_for_client_pdu(sim: &SimulatedTransport, expected: &[u8]) {
    let mut seen = Vec::new();
    for _ in 0..200 {
        seen.extend(sim.take_client_pdus(&THINGY));
        if seen.iter().any(|pdu| pdu == expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("client never sent {expected:02x?}, saw {seen:02x?}");
}

#[tokio::test]
async fn thingy_led_round_trip() {
    let (sim, adapter) = setup(AdapterConfig::default()).await;
    let mut events = adapter.events();

    adapter.start_scan(&[], false).await.unwrap();
    let device = loop {
        if let Event::PeripheralDiscovered(adv) = next_event(&mut events).await {
            if adv.device.id() == THINGY {
                assert_eq!(adv.adv_data.local_name.as_deref(), Some("Thingy"));
                assert!(adv.adv_data.services.contains(&UI_SERVICE));
                break adv.device;
            }
        }
    };
    adapter.stop_scan().await.unwrap();
    assert_eq!(device.name().as_deref(), Some("Thingy"));

    adapter.connect_device(&device).await.unwrap();
    assert_eq!(connection(&mut events).await, (THINGY, None));
    assert_eq!(device.state(), ConnectionState::Connected);

    let services = device.discover_services(&[]).await.unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].uuid(), UI_SERVICE);

    let led = services[0]
        .characteristics()
        .await
        .unwrap()
        .into_iter()
        .find(|c| c.uuid() == LED)
        .unwrap();
    assert!(led.properties().read);
    assert!(led.properties().write);
    assert_eq!(led.declaration_handle() + 1, led.handle());

    led.write(&[0x01, 0xff, 0x00, 0x00]).await.unwrap();
    assert_eq!(led.read().await.unwrap(), [0x01, 0xff, 0x00, 0x00]);
    assert_eq!(sim.value(&THINGY, LED).unwrap(), [0x01, 0xff, 0x00, 0x00]);

    adapter.cancel_connection(&device).await.unwrap();
    assert_eq!(disconnection(&mut events).await, (THINGY, None));
    adapter.close().await;
}

#[tokio::test]
async fn scan_reports_each_peripheral_once() {
    let (sim, adapter) = setup(AdapterConfig::default()).await;
    sim.add_peripheral(SimPeripheral::new(OTHER).name("Other"));
    let mut events = adapter.events();

    adapter.start_scan(&[], false).await.unwrap();
    assert!(adapter.is_scanning());
    assert!(sim.advertise(&THINGY));
    assert!(sim.advertise(&OTHER));
    sim.set_power(PowerState::PoweredOff);

    assert_eq!(discovered_until_power_off(&mut events).await, [OTHER, THINGY]);
    assert!(!adapter.is_scanning());
}

#[tokio::test]
async fn scan_with_duplicates() {
    let (sim, adapter) = setup(AdapterConfig::default()).await;
    sim.add_peripheral(SimPeripheral::new(OTHER));
    let mut events = adapter.events();

    adapter.start_scan(&[], true).await.unwrap();
    assert!(sim.advertise(&THINGY));
    sim.set_power(PowerState::PoweredOff);

    assert_eq!(discovered_until_power_off(&mut events).await, [OTHER, THINGY, THINGY]);
}

#[tokio::test]
async fn scan_filters_by_service() {
    let (sim, adapter) = setup(AdapterConfig::default()).await;
    sim.add_peripheral(SimPeripheral::new(OTHER).name("Other"));
    let mut events = adapter.events();

    adapter.start_scan(&[UI_SERVICE], false).await.unwrap();
    assert!(sim.advertise(&OTHER));
    sim.set_power(PowerState::PoweredOff);

    assert_eq!(discovered_until_power_off(&mut events).await, [THINGY]);
}

#[tokio::test]
async fn stop_scan_while_idle() {
    let (sim, adapter) = setup(AdapterConfig::default()).await;
    let mut events = adapter.events();

    adapter.stop_scan().await.unwrap();
    adapter.stop_scan().await.unwrap();
    sim.set_power(PowerState::PoweredOff);

    loop {
        match next_event(&mut events).await {
            Event::StateChanged(PowerState::PoweredOn) => {}
            Event::StateChanged(PowerState::PoweredOff) => break,
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[tokio::test]
async fn scan_requires_power() {
    let (sim, adapter) = setup(AdapterConfig::default()).await;
    sim.set_power(PowerState::PoweredOff);
    assert_eq!(adapter.state(), PowerState::PoweredOff);

    let err = adapter.start_scan(&[], false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AdapterUnavailable);
    let err = adapter.connect_device(&adapter.open_device(&THINGY)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AdapterUnavailable);

    let waiter = adapter.clone();
    let available = tokio::spawn(async move { waiter.wait_available().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    sim.set_power(PowerState::PoweredOn);
    tokio::time::timeout(Duration::from_secs(5), available)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn connect_to_absent_peripheral_times_out() {
    let config = AdapterConfig::default().with_connect_timeout(Duration::from_millis(200));
    let (sim, adapter) = setup(config).await;
    let mut events = adapter.events();

    let device = adapter.open_device(&ABSENT);
    let err = adapter.connect_device(&device).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(connection(&mut events).await, (ABSENT, Some(ErrorKind::Timeout)));
    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert!(!sim.is_connected(&ABSENT));
    assert!(adapter.connected_devices().is_empty());
}

#[tokio::test]
async fn rejected_connection() {
    let (sim, adapter) = setup(AdapterConfig::default()).await;
    sim.reject_connections(&THINGY, true);
    let mut events = adapter.events();

    let device = adapter.open_device(&THINGY);
    let err = adapter.connect_device(&device).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
    assert_eq!(connection(&mut events).await, (THINGY, Some(ErrorKind::ConnectionFailed)));

    sim.reject_connections(&THINGY, false);
    adapter.connect_device(&device).await.unwrap();
    assert!(device.is_connected());
}

#[tokio::test]
async fn connect_completes_when_peripheral_appears() {
    let (sim, adapter) = setup(AdapterConfig::default()).await;
    sim.set_present(&THINGY, false);

    let device = adapter.open_device(&THINGY);
    let mut attempt = Box::pin(adapter.connect_device(&device));
    assert!(future::poll_once(&mut attempt).await.is_none());
    assert_eq!(device.state(), ConnectionState::Connecting);

    let err = adapter.connect_device(&device).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyConnecting);

    sim.set_present(&THINGY, true);
    attempt.await.unwrap();
    assert!(device.is_connected());
    assert_eq!(adapter.connected_devices(), [device.clone()]);

    // Connecting again is a no-op.
    adapter.connect_device(&device).await.unwrap();
}

#[tokio::test]
async fn cancel_while_connecting() {
    let (sim, adapter) = setup(AdapterConfig::default()).await;
    sim.set_present(&THINGY, false);
    let mut events = adapter.events();

    let device = adapter.open_device(&THINGY);
    let mut attempt = Box::pin(adapter.connect_device(&device));
    assert!(future::poll_once(&mut attempt).await.is_none());

    adapter.cancel_connection(&device).await.unwrap();
    assert_eq!(attempt.await.unwrap_err().kind(), ErrorKind::Cancelled);
    assert_eq!(disconnection(&mut events).await, (THINGY, None));
    assert_eq!(device.state(), ConnectionState::Disconnected);

    // The peripheral showing up afterwards does not resurrect the attempt.
    sim.set_present(&THINGY, true);
    assert!(!sim.is_connected(&THINGY));
    assert!(!device.is_connected());

    // Cancelling an idle device does nothing.
    adapter.cancel_connection(&device).await.unwrap();
}

#[tokio::test]
async fn read_requires_read_property() {
    let (sim, _adapter, device) = connected(AdapterConfig::default()).await;
    let button = characteristic(&device, BUTTON).await;
    assert!(!button.properties().read);

    let before = sim.request_count(&THINGY);
    let err = button.read().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PropertyNotSupported);
    let err = button.write(&[1]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PropertyNotSupported);
    let err = button.write_without_response(&[1]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PropertyNotSupported);
    assert_eq!(sim.request_count(&THINGY), before);
}

#[tokio::test]
async fn read_long_on_chunk_boundary() {
    let (_sim, _adapter, device) = connected(AdapterConfig::default()).await;
    assert_eq!(device.mtu().unwrap(), 23);
    let log = characteristic(&device, LOG).await;

    // 44 bytes is exactly two full 22 byte fragments.
    let expected: Vec<u8> = (0..44).collect();
    assert_eq!(log.read().await.unwrap(), expected[..22]);
    assert_eq!(log.read_long().await.unwrap(), expected);
    assert_eq!(log.value().unwrap(), expected);

    for len in [21, 22, 43] {
        let value: Vec<u8> = (0..len).map(|x| x as u8 ^ 0x5a).collect();
        log.write(&value).await.unwrap();
        assert_eq!(log.read_long().await.unwrap(), value, "{len} byte value");
    }
}

#[tokio::test]
async fn long_write_round_trip() {
    let (sim, _adapter, device) = connected(AdapterConfig::default()).await;
    let log = characteristic(&device, LOG).await;
    assert_eq!(log.max_write_len(), 20);

    let value: Vec<u8> = (0..100).rev().collect();
    log.write(&value).await.unwrap();
    assert_eq!(sim.value(&THINGY, LOG).unwrap(), value);
    assert_eq!(log.read_long().await.unwrap(), value);

    let err = log.write(&[0; 513]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
}

#[tokio::test]
async fn writes_respect_configured_attribute_len() {
    let config = AdapterConfig::default().with_max_attribute_len(64);
    let (sim, _adapter, device) = connected(config).await;
    let log = characteristic(&device, LOG).await;

    let before = sim.request_count(&THINGY);
    let err = log.write(&[0; 65]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    assert_eq!(sim.request_count(&THINGY), before);

    log.write(&[0x42; 64]).await.unwrap();
    assert_eq!(log.read_long().await.unwrap(), [0x42; 64]);
}

#[tokio::test]
async fn descriptor_read_write() {
    let config = AdapterConfig::default().with_max_queued_requests(1);
    let (sim, adapter, device) = connected(config).await;
    let log = characteristic(&device, LOG).await;
    let description = log
        .descriptors()
        .await
        .unwrap()
        .into_iter()
        .find(|d| d.uuid() == btuuid::descriptors::CHARACTERISTIC_USER_DESCRIPTION)
        .unwrap();
    assert_eq!(description.characteristic(), Some(log.clone()));
    assert_eq!(description.value(), None);

    assert_eq!(description.read().await.unwrap(), b"log");
    assert_eq!(description.value().unwrap(), b"log");
    description.write(b"event log").await.unwrap();
    assert_eq!(description.value().unwrap(), b"event log");
    assert_eq!(description.read().await.unwrap(), b"event log");

    sim.set_unresponsive(&THINGY, true);
    let mut first = Box::pin(description.read());
    assert!(future::poll_once(&mut first).await.is_none());
    let mut second = Box::pin(description.write(b"queued"));
    assert!(future::poll_once(&mut second).await.is_none());
    assert_eq!(description.read().await.unwrap_err().kind(), ErrorKind::Busy);

    adapter.cancel_connection(&device).await.unwrap();
    assert_eq!(first.await.unwrap_err().kind(), ErrorKind::TransportLost);
    assert_eq!(second.await.unwrap_err().kind(), ErrorKind::TransportLost);
    assert_eq!(description.read().await.unwrap_err().kind(), ErrorKind::NotConnected);
    assert_eq!(description.write(b"late").await.unwrap_err().kind(), ErrorKind::NotConnected);
    assert_eq!(description.value().unwrap(), b"event log");
}

#[tokio::test]
async fn mtu_exchange_happens_once() {
    let (_sim, _adapter, device) = connected(AdapterConfig::default()).await;
    assert_eq!(device.set_mtu(500).await.unwrap(), SERVER_MTU);
    assert_eq!(device.mtu().unwrap(), SERVER_MTU);

    let err = device.set_mtu(100).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSupported);

    let log = characteristic(&device, LOG).await;
    assert_eq!(log.read().await.unwrap().len(), 44);
    assert_eq!(log.max_write_len(), usize::from(SERVER_MTU) - 3);
}

#[tokio::test]
async fn mtu_exchange_forbidden_by_transport() {
    let (sim, adapter) = setup(AdapterConfig::default()).await;
    sim.set_mtu_exchange_allowed(false);
    let device = adapter.open_device(&THINGY);
    adapter.connect_device(&device).await.unwrap();

    let err = device.set_mtu(247).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSupported);
    assert_eq!(device.mtu().unwrap(), 23);
}

#[tokio::test]
async fn notifications_reach_handlers_and_streams() {
    let (sim, adapter, device) = connected(AdapterConfig::default()).await;
    let (tx, rx) = async_channel::unbounded();
    adapter.on_value_updated(move |characteristic, value| {
        let _ = tx.try_send((characteristic.uuid(), value.to_vec()));
    });

    let button = characteristic(&device, BUTTON).await;
    assert!(!sim.notify(&THINGY, BUTTON, &[1]));
    let mut values = button.notify().await.unwrap();
    assert!(button.is_notifying());

    assert!(sim.notify(&THINGY, BUTTON, &[1]));
    assert!(sim.notify(&THINGY, BUTTON, &[0]));

    let next = || async {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    };
    assert_eq!(next().await, (BUTTON, vec![1]));
    assert_eq!(next().await, (BUTTON, vec![0]));
    assert_eq!(values.next().await.unwrap(), [1]);
    assert_eq!(values.next().await.unwrap(), [0]);
    assert_eq!(button.value().unwrap(), [0]);

    button.unsubscribe().await.unwrap();
    assert!(!button.is_notifying());
    assert!(!sim.notify(&THINGY, BUTTON, &[1]));

    // The stream ends with the link.
    adapter.cancel_connection(&device).await.unwrap();
    assert!(values.next().await.is_none());
}

#[tokio::test]
async fn indications_are_confirmed() {
    let (sim, _adapter, device) = connected(AdapterConfig::default()).await;
    let alarm = characteristic(&device, ALARM).await;

    let mut values = alarm.notify().await.unwrap();
    let cccd = alarm
        .descriptors()
        .await
        .unwrap()
        .into_iter()
        .find(|d| d.uuid() == btuuid::descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION)
        .unwrap();
    assert_eq!(cccd.read().await.unwrap(), [0x02, 0x00]);

    assert!(sim.notify(&THINGY, ALARM, &[7]));
    assert_eq!(values.next().await.unwrap(), [7]);
    wait_for_client_pdu(&sim, &Pdu::HandleValueConfirmation.encode()).await;
}

#[tokio::test]
async fn peer_requests_are_rejected() {
    let (sim, _adapter, _device) = connected(AdapterConfig::default()).await;

    assert!(sim.inject(&THINGY, Pdu::ReadRequest { handle: 1 }.encode()));
    let rejection = Pdu::ErrorResponse {
        request: 0x0a,
        handle: 0,
        error: AttError::Known(AttErrorCode::RequestNotSupported),
    };
    wait_for_client_pdu(&sim, &rejection.encode()).await;
}

#[tokio::test]
async fn disconnect_during_read() {
    let (sim, adapter, device) = connected(AdapterConfig::default()).await;
    let led = characteristic(&device, LED).await;
    let mut events = adapter.events();

    sim.set_unresponsive(&THINGY, true);
    let mut read = Box::pin(led.read());
    assert!(future::poll_once(&mut read).await.is_none());

    assert!(sim.drop_link(&THINGY, DisconnectReason::ConnectionTimeout));
    assert_eq!(read.await.unwrap_err().kind(), ErrorKind::TransportLost);
    assert_eq!(disconnection(&mut events).await, (THINGY, Some(ErrorKind::Timeout)));

    assert!(!device.is_connected());
    assert_eq!(led.read().await.unwrap_err().kind(), ErrorKind::NotConnected);
    assert_eq!(device.services().await.unwrap_err().kind(), ErrorKind::NotConnected);
}

#[tokio::test]
async fn disconnect_reasons() {
    let (sim, adapter, device) = connected(AdapterConfig::default()).await;
    let mut events = adapter.events();

    assert!(sim.drop_link(&THINGY, DisconnectReason::RemoteUserTerminated));
    assert_eq!(disconnection(&mut events).await, (THINGY, None));

    adapter.connect_device(&device).await.unwrap();
    assert!(sim.drop_link(&THINGY, DisconnectReason::TransportLost));
    assert_eq!(disconnection(&mut events).await, (THINGY, Some(ErrorKind::TransportLost)));

    adapter.connect_device(&device).await.unwrap();
    sim.set_power(PowerState::PoweredOff);
    assert_eq!(disconnection(&mut events).await, (THINGY, Some(ErrorKind::TransportLost)));
    assert_eq!(device.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn timed_out_request_does_not_confuse_the_next() {
    let config = AdapterConfig::default().with_request_timeout(Duration::from_millis(200));
    let (sim, _adapter, device) = connected(config).await;
    let led = characteristic(&device, LED).await;

    sim.set_unresponsive(&THINGY, true);
    assert_eq!(led.read().await.unwrap_err().kind(), ErrorKind::Timeout);

    // The peripheral answers the abandoned request late.
    assert!(sim.inject(&THINGY, Pdu::ReadResponse { value: vec![9, 9] }.encode()));
    sim.set_unresponsive(&THINGY, false);
    assert_eq!(led.read().await.unwrap(), [0x01, 0x00, 0x00, 0x00]);
    assert!(device.is_connected());
}

#[tokio::test]
async fn requests_queue_until_full() {
    let config = AdapterConfig::default()
        .with_max_queued_requests(1)
        .with_request_timeout(Duration::from_secs(5));
    let (sim, adapter, device) = connected(config).await;
    let led = characteristic(&device, LED).await;

    sim.set_unresponsive(&THINGY, true);
    let before = sim.request_count(&THINGY);
    let mut first = Box::pin(led.read());
    assert!(future::poll_once(&mut first).await.is_none());
    let mut second = Box::pin(led.read());
    assert!(future::poll_once(&mut second).await.is_none());
    assert_eq!(sim.request_count(&THINGY), before + 1);

    let err = led.read().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);

    adapter.cancel_connection(&device).await.unwrap();
    assert_eq!(first.await.unwrap_err().kind(), ErrorKind::TransportLost);
    assert_eq!(second.await.unwrap_err().kind(), ErrorKind::TransportLost);
}

#[tokio::test]
async fn discovery_is_cached() {
    let (sim, _adapter, device) = connected(AdapterConfig::default()).await;
    let led = characteristic(&device, LED).await;
    led.descriptors().await.unwrap();

    let before = sim.request_count(&THINGY);
    let again = characteristic(&device, LED).await;
    assert_eq!(again, led);
    led.descriptors().await.unwrap();
    assert_eq!(sim.request_count(&THINGY), before);

    device.invalidate_cache().await.unwrap();
    let fresh = characteristic(&device, LED).await;
    assert_ne!(fresh, led);
    assert!(sim.request_count(&THINGY) > before);

    // Handles from before the invalidation still work.
    assert_eq!(led.read().await.unwrap(), [0x01, 0x00, 0x00, 0x00]);
}

#[tokio::test]
async fn wait_all_disconnected() {
    let (sim, adapter) = setup(AdapterConfig::default()).await;
    sim.add_peripheral(SimPeripheral::new(OTHER));
    adapter.wait_all_disconnected().await;

    let thingy = adapter.open_device(&THINGY);
    let other = adapter.open_device(&OTHER);
    adapter.connect_device(&thingy).await.unwrap();
    adapter.connect_device(&other).await.unwrap();
    assert_eq!(adapter.connected_devices().len(), 2);

    let waiter = adapter.clone();
    let done = tokio::spawn(async move { waiter.wait_all_disconnected().await });

    adapter.cancel_connection(&thingy).await.unwrap();
    assert!(sim.drop_link(&OTHER, DisconnectReason::RemoteUserTerminated));
    tokio::time::timeout(Duration::from_secs(5), done).await.unwrap().unwrap();
    assert!(adapter.connected_devices().is_empty());
}

#[tokio::test]
async fn reconnect_while_disconnect_is_dispatched() {
    let (sim, adapter, device) = connected(AdapterConfig::default()).await;
    adapter.on_peripheral_disconnected(|_, _| std::thread::sleep(Duration::from_millis(300)));

    assert!(sim.drop_link(&THINGY, DisconnectReason::RemoteUserTerminated));
    adapter.connect_device(&device).await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(device.is_connected());
    let waited = tokio::time::timeout(Duration::from_millis(500), adapter.wait_all_disconnected()).await;
    assert!(waited.is_err(), "resolved with {THINGY} still connected");

    adapter.cancel_connection(&device).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), adapter.wait_all_disconnected())
        .await
        .unwrap();
}

#[tokio::test]
async fn peripheral_registry() {
    let (_sim, adapter, device) = connected(AdapterConfig::default()).await;
    assert_eq!(adapter.peripherals(), [device.clone()]);

    let err = adapter.remove_device(&device).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);

    adapter.cancel_connection(&device).await.unwrap();
    adapter.remove_device(&device).unwrap();
    assert!(adapter.peripherals().is_empty());
}

#[tokio::test]
async fn panicking_handler_does_not_stop_dispatch() {
    let (sim, adapter) = setup(AdapterConfig::default()).await;
    let mut events = adapter.events();
    let id = adapter.on_state_changed(|_| panic!("handler failure"));

    sim.set_power(PowerState::PoweredOff);
    loop {
        if let Event::StateChanged(PowerState::PoweredOff) = next_event(&mut events).await {
            break;
        }
    }
    assert!(adapter.remove_handler(id));
    assert!(!adapter.remove_handler(id));
}

#[tokio::test]
async fn close_ends_event_stream() {
    let (_sim, adapter, device) = connected(AdapterConfig::default()).await;
    let mut events = adapter.events();

    adapter.close().await;
    assert_eq!(disconnection(&mut events).await, (THINGY, None));
    while let Some(_event) = events.next().await {}
    assert!(!device.is_connected());
    assert_eq!(
        adapter.start_scan(&[], false).await.unwrap_err().kind(),
        ErrorKind::AdapterUnavailable
    );
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn close_releases_handlers() {
    let (sim, adapter) = setup(AdapterConfig::default()).await;
    let released = Arc::new(AtomicBool::new(false));
    let flag = DropFlag(released.clone());
    let held = adapter.clone();
    adapter.on_state_changed(move |_| {
        let _ = (&held, &flag);
    });

    adapter.close().await;
    drop(adapter);
    drop(sim);

    for _ in 0..200 {
        if released.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(released.load(Ordering::SeqCst));
}
