//! A simulated sensor test device shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use hidpp_core::{
    channel::UsbChannel,
    config::TransportConfig,
    feature::{feature_set, mlx90393_multi_sensor, root},
    report::{HEADER_LENGTH, MessageHeader},
    transport::{
        UsbContext,
        virtual_device::{VirtualBackend, VirtualDevice},
    },
};

/// The device index the tests talk to.
pub const DEVICE_INDEX: u8 = 0x01;

/// Root, FeatureSet and the sensor feature at index 2.
pub const SENSOR_FEATURES: &[(u16, u8)] = &[
    (root::FEATURE_ID, 2),
    (feature_set::FEATURE_ID, 2),
    (mlx90393_multi_sensor::FEATURE_ID, 0),
];

pub const SENSOR_FEATURE_INDEX: u8 = 2;

/// The value the simulated device keeps in a sensor register.
pub fn register_value(sensor_id: u8, reg_addr: u8) -> u16 {
    u16::from_be_bytes([sensor_id, reg_addr]) ^ 0x5aa5
}

/// Answers discovery requests and sensor register reads.
pub fn sensor_responder(features: &'static [(u16, u8)]) -> impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static {
    move |request| {
        if let Some(reply) = VirtualDevice::answer_discovery(features, request) {
            return vec![reply];
        }

        let Some(header) = MessageHeader::read(request) else {
            return Vec::new();
        };
        let is_sensor = features
            .get(usize::from(header.feature_index))
            .is_some_and(|(id, _)| *id == mlx90393_multi_sensor::FEATURE_ID);

        match (is_sensor, header.function_index.to_lo()) {
            (true, 0) => {
                let (sensor_id, reg_addr) = (request[HEADER_LENGTH], request[HEADER_LENGTH + 1]);
                let [hi, lo] = register_value(sensor_id, reg_addr).to_be_bytes();
                vec![VirtualDevice::long_reply(request, &[sensor_id, reg_addr, hi, lo])]
            },
            _ => Vec::new(),
        }
    }
}

pub fn config(usb_timeout_ms: u64, max_threads: usize) -> TransportConfig {
    TransportConfig {
        usb_timeout_ms,
        max_threads,
        ..Default::default()
    }
}

/// An open channel to a simulated device.
pub struct Rig {
    pub backend: Arc<VirtualBackend>,
    pub device: Arc<VirtualDevice>,
    pub context: Arc<UsbContext>,
    pub channel: Arc<UsbChannel>,
}

impl Rig {
    /// Plugs the device in and opens a channel to it.
    pub fn open(device: VirtualDevice, features: &'static [(u16, u8)], config: TransportConfig) -> Self {
        let rig = Self::closed(device, features, config);
        rig.channel.open().expect("could not open channel");
        rig
    }

    /// Plugs the device in and creates a channel without opening it.
    pub fn closed(device: VirtualDevice, features: &'static [(u16, u8)], config: TransportConfig) -> Self {
        Self::closed_at(device, features, config, DEVICE_INDEX)
    }

    /// Plugs the device in and creates a closed channel to a device index.
    pub fn closed_at(
        device: VirtualDevice,
        features: &'static [(u16, u8)],
        config: TransportConfig,
        device_index: u8,
    ) -> Self {
        let backend = Arc::new(VirtualBackend::new());
        let device = backend.add_device(device);
        device.set_responder(sensor_responder(features));

        let context = UsbContext::new(config, backend.clone()).expect("invalid configuration");
        context.open().expect("could not open context");
        let record = context.select_device().expect("no device found");
        let channel = UsbChannel::new(Arc::clone(&context), &record, device_index);

        Self {
            backend,
            device,
            context,
            channel,
        }
    }

    pub fn sensor_device(config: TransportConfig) -> Self {
        Self::open(VirtualDevice::logitech(1, 4, 0xc548), SENSOR_FEATURES, config)
    }
}
