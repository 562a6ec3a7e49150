//! Protocol of the demo peripheral: a battery-powered alarm panel with a
//! relay output and four zones.

use gatt_coordinator::domain::transform;
use gatt_coordinator::infrastructure::bluetooth::SimulatedTransport;
use gatt_coordinator::{Characteristic, Properties, ReadStrategy, Service};
use std::collections::HashMap;
use std::time::Duration;

pub const BATTERY_LEVEL: &str = "2a19";
pub const FIRMWARE_REVISION: &str = "2a26";
pub const ZONE_STATUS: &str = "fff1";
pub const RELAY: &str = "fff2";
pub const PASSWORD: &str = "fff3";
pub const ARM_MODE: &str = "fff4";

pub fn services() -> Vec<Service> {
    let readable = Properties::READABLE;

    let modes: HashMap<u8, String> = [(0, "disarmed"), (1, "home"), (2, "away")]
        .into_iter()
        .map(|(code, name)| (code, name.to_string()))
        .collect();

    vec![
        Service::new("180f", "Battery Service").characteristic(
            Characteristic::new(BATTERY_LEVEL, "Battery Level", "battery")
                .properties(readable)
                .strategy(ReadStrategy::Poll(Duration::from_secs(30)))
                .read_transform(transform::u8_at(0)),
        ),
        Service::new("180a", "Device Information").characteristic(
            Characteristic::new(FIRMWARE_REVISION, "Firmware Revision", "firmware")
                .properties(readable)
                .strategy(ReadStrategy::Index)
                .read_transform(transform::utf8()),
        ),
        Service::new("fff0", "Alarm Panel")
            .characteristic(
                Characteristic::new(ZONE_STATUS, "Zone Status", "zones")
                    .properties(readable | Properties::NOTIFIABLE)
                    .strategy(ReadStrategy::Notify)
                    .read_transform(transform::flags_at(0, 4)),
            )
            .characteristic(
                Characteristic::new(RELAY, "Relay", "relay")
                    .properties(readable | Properties::WRITABLE)
                    .strategy(ReadStrategy::AfterWrite {
                        interval: Duration::from_secs(2),
                        window: Duration::from_secs(30),
                    })
                    .read_transform(transform::bit_at(0, 0x01))
                    .write_transform(transform::write_u8()),
            )
            .characteristic(
                Characteristic::new(PASSWORD, "Password", "password")
                    .properties(Properties::WRITABLE)
                    .write_transform(transform::write_ascii(20)),
            )
            .characteristic(
                Characteristic::new(ARM_MODE, "Arm Mode", "arm_mode")
                    .properties(readable)
                    .strategy(ReadStrategy::Poll(Duration::from_secs(10)))
                    .read_transform(transform::lookup_at(0, modes, "unknown")),
            ),
    ]
}

/// Seed a simulated panel with plausible values.
pub fn seed(transport: &SimulatedTransport) {
    transport.set_value(BATTERY_LEVEL, vec![97]);
    transport.set_value(FIRMWARE_REVISION, b"2.4.1\0\0".to_vec());
    transport.set_value(ZONE_STATUS, vec![0b0000]);
    transport.set_value(RELAY, vec![0]);
    transport.set_value(ARM_MODE, vec![0]);
}

/// Drain the battery and trip zones so there is something to watch.
pub async fn animate(transport: SimulatedTransport) {
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    let mut battery: u8 = 97;
    let mut step: u8 = 0;
    loop {
        ticker.tick().await;
        step = step.wrapping_add(1);
        if step % 6 == 0 {
            battery = battery.saturating_sub(1);
            transport.set_value(BATTERY_LEVEL, vec![battery]);
        }
        transport.notify(ZONE_STATUS, vec![1 << (step % 4)]);
        if step % 12 == 0 {
            transport.set_value(ARM_MODE, vec![(step / 12) % 3]);
        }
    }
}
