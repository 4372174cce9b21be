use std::error::Error;
use std::time::Duration;

use bluegatt::sim::{SimCharacteristic, SimPeripheral, SimService, SimulatedTransport};
use bluegatt::{btuuid, Adapter, AdapterConfig, BluetoothUuidExt, DeviceId, Event, Uuid};
use futures_lite::StreamExt;
use tracing::{info, metadata::LevelFilter};

const THINGY_UI_SERVICE: Uuid = Uuid::from_u128(0xef680300_9b35_4933_9b10_52ffa9740042);
const THINGY_LED_CHARACTERISTIC: Uuid = Uuid::from_u128(0xef680301_9b35_4933_9b10_52ffa9740042);
const THINGY_BUTTON_CHARACTERISTIC: Uuid = Uuid::from_u128(0xef680302_9b35_4933_9b10_52ffa9740042);

const NORDIC_SEMICONDUCTOR: u16 = 0x0059;

fn short(uuid: Uuid) -> String {
    match uuid.try_to_u16() {
        Some(short) => format!("0x{short:04x}"),
        None => uuid.to_string(),
    }
}

fn simulated_thingy() -> SimPeripheral {
    SimPeripheral::new(DeviceId([0xd1, 0x5c, 0x3e, 0x42, 0x07, 0xa9]))
        .name("Thingy")
        .rssi(-48)
        .manufacturer_data(NORDIC_SEMICONDUCTOR, [0x01, 0x02])
        .service(
            SimService::new(btuuid::services::DEVICE_INFORMATION).characteristic(
                SimCharacteristic::new(btuuid::characteristics::MANUFACTURER_NAME_STRING)
                    .readable()
                    .value("Nordic Semiconductor ASA"),
            ),
        )
        .service(
            SimService::new(THINGY_UI_SERVICE)
                .characteristic(
                    SimCharacteristic::new(THINGY_LED_CHARACTERISTIC)
                        .readable()
                        .writable()
                        .value([0x01, 0x00, 0x00, 0x00]),
                )
                .characteristic(SimCharacteristic::new(THINGY_BUTTON_CHARACTERISTIC).notify().value([0x00])),
        )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let sim = SimulatedTransport::new();
    sim.add_peripheral(simulated_thingy());

    let config = AdapterConfig::default().with_connect_timeout(Duration::from_secs(5));
    let adapter = Adapter::new(sim.clone(), config)?;
    let mut events = adapter.events();
    adapter.open().await?;
    adapter.wait_available().await?;

    adapter.on_value_updated(|characteristic, value| {
        info!("{} changed to {:02x?}", characteristic.uuid(), value);
    });

    info!("starting scan");
    adapter.start_scan(&[THINGY_UI_SERVICE], false).await?;
    let discovered = loop {
        match events.next().await {
            Some(Event::PeripheralDiscovered(discovered)) => break discovered,
            Some(_) => {}
            None => return Err("adapter closed while scanning".into()),
        }
    };
    adapter.stop_scan().await?;

    info!(
        "found device: {} {:?}dBm {:?}",
        discovered.device,
        discovered.rssi,
        discovered.adv_data.manufacturer_data
    );
    let device = discovered.device;
    adapter.connect_device(&device).await?;
    info!("connected!");

    let mtu = device.set_mtu(500).await?;
    info!("negotiated MTU of {}", mtu);

    for service in device.services().await? {
        info!(
            "service {} {}",
            short(service.uuid()),
            service.name().unwrap_or("<unknown>")
        );
        for characteristic in service.characteristics().await? {
            info!(
                "  characteristic {} {} [{}]",
                short(characteristic.uuid()),
                characteristic.name().unwrap_or("<unknown>"),
                characteristic.properties()
            );
            if characteristic.properties().read {
                let value = characteristic.read_long().await?;
                info!("    value: {:?}", String::from_utf8_lossy(&value));
            }
            for descriptor in characteristic.descriptors().await? {
                info!(
                    "    descriptor {} {}: {:02x?}",
                    short(descriptor.uuid()),
                    descriptor.name().unwrap_or("<unknown>"),
                    descriptor.read().await?
                );
            }
        }
    }

    let ui = device
        .discover_services_with_uuid(THINGY_UI_SERVICE)
        .await?
        .into_iter()
        .next()
        .ok_or("UI service not found")?;
    let led = ui
        .discover_characteristics_with_uuid(THINGY_LED_CHARACTERISTIC)
        .await?
        .into_iter()
        .next()
        .ok_or("LED characteristic not found")?;
    let button = ui
        .discover_characteristics_with_uuid(THINGY_BUTTON_CHARACTERISTIC)
        .await?
        .into_iter()
        .next()
        .ok_or("button characteristic not found")?;

    let mut presses = button.notify().await?;
    for (i, color) in [[0xff, 0x00, 0x00], [0x00, 0xff, 0x00], [0x00, 0x00, 0xff]].iter().enumerate() {
        let mut value = vec![0x01];
        value.extend_from_slice(color);
        led.write(&value).await?;
        info!("LED set to {:02x?}", led.read().await?);

        sim.notify(&device.id(), THINGY_BUTTON_CHARACTERISTIC, &[(i % 2) as u8 ^ 1]);
        if let Some(state) = presses.next().await {
            info!("button state: {:?}", state);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    adapter.cancel_connection(&device).await?;
    adapter.wait_all_disconnected().await;
    info!("disconnected");
    adapter.close().await;

    Ok(())
}
