//! End-to-end behaviour of a channel talking to a simulated device.

mod common;

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use common::{DEVICE_INDEX, Rig, SENSOR_FEATURE_INDEX, SENSOR_FEATURES, config, register_value};
use hidpp_core::{
    channel::{ChannelError, DIRECT_DEVICE_INDEX, UsbChannel},
    config::TransportConfig,
    dispatcher::QueueName,
    feature::{
        feature_set,
        mlx90393_multi_sensor::{
            self, Mlx90393MultiSensorFeature, ReadSensorRegister, ReadSensorRegisterResponse,
        },
        root,
    },
    nibble::U4,
    protocol::v20,
    report::MessageHeader,
    schema::TypedMessage,
    transport::{
        TransportError,
        backend::{EndpointInfo, InterfaceInfo, UsbDeviceInfo},
        device::{DeviceEvent, DeviceState},
        virtual_device::{HIDPP_REPORT_DESCRIPTOR, VirtualDevice},
    },
};
use tracing_test::traced_test;

fn wait_for(events: &flume::Receiver<DeviceEvent>, wanted: impl Fn(&DeviceEvent) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match events.recv_deadline(deadline) {
            Ok(event) if wanted(&event) => return,
            Ok(_) => continue,
            Err(err) => panic!("device event was not reported: {err}"),
        }
    }
}

#[test]
fn short_request_encoding() {
    let mut request = ReadSensorRegister::new(0x01, 0x07, 0x02, 0x0a);
    request.header.software_id = U4::from_lo(3);
    assert_eq!(request.encode().unwrap(), [0x10, 0x01, 0x07, 0x03, 0x02, 0x0a, 0x00]);

    request.header.function_index = U4::from_lo(9);
    assert_eq!(request.encode().unwrap(), [0x10, 0x01, 0x07, 0x93, 0x02, 0x0a, 0x00]);
}

#[test]
fn long_response_decoding() {
    let mut frame = [0u8; 20];
    frame[..8].copy_from_slice(&[0x11, 0x01, 0x07, 0x03, 0x02, 0x0a, 0x12, 0x34]);

    let response = ReadSensorRegisterResponse::decode(&frame).unwrap();
    assert_eq!(response.header.device_index, 0x01);
    assert_eq!(response.header.feature_index, 0x07);
    assert_eq!(response.sensor_id, 0x02);
    assert_eq!(response.reg_addr, 0x0a);
    assert_eq!(response.reg_value, 0x1234);
}

#[test]
fn unsupported_feature_stays_off_the_wire() {
    const WITHOUT_SENSORS: &[(u16, u8)] = &[(root::FEATURE_ID, 2), (feature_set::FEATURE_ID, 2)];
    let rig = Rig::open(VirtualDevice::logitech(1, 4, 0xc548), WITHOUT_SENSORS, config(500, 4));

    assert!(matches!(
        rig.channel.feature::<Mlx90393MultiSensorFeature>(),
        Err(ChannelError::FeatureNotSupported(mlx90393_multi_sensor::FEATURE_ID))
    ));
    assert_eq!(rig.device.written().len(), 1);

    let request = ReadSensorRegister::new(DEVICE_INDEX, 0x05, 0x02, 0x0a);
    assert!(matches!(
        rig.channel.send(request),
        Err(ChannelError::FeatureNotSupported(mlx90393_multi_sensor::FEATURE_ID))
    ));
    assert!(matches!(
        rig.channel.feature::<Mlx90393MultiSensorFeature>(),
        Err(ChannelError::FeatureNotSupported(_))
    ));
    assert_eq!(rig.device.written().len(), 1);
}

#[test]
fn concurrent_requests_get_their_own_responses() {
    let rig = Rig::sensor_device(config(1000, 4));
    let sensors = Arc::new(rig.channel.feature::<Mlx90393MultiSensorFeature>().unwrap());

    let workers = (0..6u8)
        .map(|sensor_id| {
            let sensors = Arc::clone(&sensors);
            thread::spawn(move || {
                for reg_addr in 0..20u8 {
                    let started = Instant::now();
                    let value = sensors.read_sensor_register(sensor_id, reg_addr).unwrap();
                    assert_eq!(value, register_value(sensor_id, reg_addr));
                    assert!(started.elapsed() < Duration::from_secs(1));
                }
            })
        })
        .collect::<Vec<_>>();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(rig.channel.dispatcher().pending_count(), 0);
}

#[test]
fn device_loss_while_polling() {
    let rig = Rig::sensor_device(config(500, 4));
    let events = rig.context.subscribe();
    let sensors = rig.channel.feature::<Mlx90393MultiSensorFeature>().unwrap();
    assert!(sensors.read_sensor_register(0x01, 0x02).is_ok());

    rig.backend.unplug(&rig.device);
    wait_for(&events, |event| matches!(event, DeviceEvent::Lost(_)));

    let record = rig.channel.record();
    assert!(matches!(record, Err(ChannelError::DeviceNotConnected)));
    let record = rig.context.devices().remove(0);
    assert_eq!(record.state(), DeviceState::Lost);

    assert!(matches!(
        sensors.read_sensor_register(0x01, 0x02),
        Err(ChannelError::DeviceNotConnected)
    ));

    rig.channel.close().unwrap();
    assert!(!record.is_open());
}

#[test]
fn replugged_device_is_resurrected() {
    let rig = Rig::sensor_device(config(300, 4));
    let events = rig.context.subscribe();

    rig.backend.unplug(&rig.device);
    wait_for(&events, |event| matches!(event, DeviceEvent::Lost(_)));
    rig.backend.replug(&rig.device);
    wait_for(&events, |event| matches!(event, DeviceEvent::Arrived(_)));

    rig.channel.close().unwrap();
    rig.channel.open().unwrap();
    assert_eq!(rig.channel.root().ping(0x11).unwrap(), 0x11);
}

#[test]
fn fresh_channel_after_replug() {
    let rig = Rig::sensor_device(config(300, 8));
    let events = rig.context.subscribe();
    let record = rig.channel.record().unwrap();

    rig.backend.unplug(&rig.device);
    wait_for(&events, |event| matches!(event, DeviceEvent::Lost(_)));
    assert!(!record.is_open());

    rig.backend.replug(&rig.device);
    wait_for(&events, |event| matches!(event, DeviceEvent::Arrived(_)));
    assert_eq!(record.state(), DeviceState::Detected);
    assert!(!record.is_open());

    let channel = UsbChannel::new(Arc::clone(&rig.context), &record, DEVICE_INDEX);
    channel.open().unwrap();
    assert_eq!(channel.root().ping(0x42).unwrap(), 0x42);
    assert_eq!(record.state(), DeviceState::Open);
    assert!(record.is_connected());

    channel.close().unwrap();
}

#[test]
fn lost_channel_reopens_without_closing() {
    let rig = Rig::sensor_device(config(300, 8));
    let events = rig.context.subscribe();

    rig.backend.unplug(&rig.device);
    wait_for(&events, |event| matches!(event, DeviceEvent::Lost(_)));
    rig.backend.replug(&rig.device);
    wait_for(&events, |event| matches!(event, DeviceEvent::Arrived(_)));

    assert!(rig.channel.is_open());
    rig.channel.open().unwrap();
    assert_eq!(rig.channel.root().ping(0x24).unwrap(), 0x24);
    assert_eq!(rig.device.claimed_interfaces(), [0, 1, 2]);
}

#[test]
fn direct_device_errors_resolve_requests() {
    let rig = Rig::closed_at(
        VirtualDevice::logitech(1, 4, 0xc548),
        SENSOR_FEATURES,
        config(500, 4),
        DIRECT_DEVICE_INDEX,
    );
    rig.channel.open().unwrap();

    let err = rig
        .channel
        .send(ReadSensorRegister::new(DIRECT_DEVICE_INDEX, 0x07, 0x02, 0x0a))
        .unwrap_err();
    let ChannelError::Hidpp(err) = err else {
        panic!("expected an error reply, got {err:?}");
    };
    assert_eq!(err.device_index, DIRECT_DEVICE_INDEX);
    assert_eq!(err.sub_id, 0x07);
    assert_eq!(err.v20_error(), Some(v20::ErrorType::InvalidFeatureIndex));
    assert_eq!(rig.channel.dispatcher().queue_len(QueueName::ReceiverError), 0);
}

fn reattaching(reattach_kernel_driver: bool) -> TransportConfig {
    TransportConfig {
        reattach_kernel_driver,
        ..config(200, 4)
    }
}

#[test]
fn kernel_drivers_are_reattached_only_on_request() {
    let rig = Rig::sensor_device(reattaching(true));
    let interfaces = rig.device.claimed_interfaces();
    assert!(interfaces.iter().all(|&i| !rig.device.kernel_driver_attached(i)));

    rig.channel.close().unwrap();
    assert!(interfaces.iter().all(|&i| rig.device.kernel_driver_attached(i)));

    let rig = Rig::sensor_device(reattaching(false));
    let interfaces = rig.device.claimed_interfaces();
    rig.channel.close().unwrap();
    assert!(!interfaces.is_empty());
    assert!(interfaces.iter().all(|&i| !rig.device.kernel_driver_attached(i)));
}

#[test]
#[traced_test]
fn zero_software_id_echo_is_an_event() {
    let rig = Rig::sensor_device(config(200, 4));
    rig.channel.resolve_feature(mlx90393_multi_sensor::FEATURE_ID).unwrap();

    let mut header = MessageHeader {
        device_index: DEVICE_INDEX,
        feature_index: SENSOR_FEATURE_INDEX,
        function_index: U4::from_lo(0),
        software_id: U4::from_lo(0),
    };
    let _pending = rig.channel.dispatcher().begin_request(&mut header).unwrap();

    let echo = VirtualDevice::long_reply(&[0x11, DEVICE_INDEX, SENSOR_FEATURE_INDEX, 0x00], &[0x02, 0x0a]);
    assert_eq!(rig.channel.dispatcher().dispatch(&echo), Some(QueueName::Event));
    assert!(logs_contain("device answered with a zero software ID"));
}

/// A device with four interfaces, each polled on its own endpoint.
fn four_endpoint_device() -> VirtualDevice {
    let interfaces = (0..4u8)
        .map(|number| InterfaceInfo {
            number,
            protocol: if number == 3 { 0 } else { 2 },
            endpoints: vec![EndpointInfo {
                address: 0x81 + number,
                max_packet_size: 64,
            }],
        })
        .collect();

    VirtualDevice::new(UsbDeviceInfo {
        bus: 3,
        ports: vec![1, 2],
        address: 9,
        vendor_id: 0x046d,
        product_id: 0xc54d,
        interfaces,
    })
    .with_report_descriptor(3, HIDPP_REPORT_DESCRIPTOR)
}

#[test]
fn stopping_all_pollers_takes_one_timeout() {
    let rig = Rig::open(four_endpoint_device(), SENSOR_FEATURES, config(2000, 5));
    let record = rig.channel.record().unwrap();
    assert_eq!(record.polled_endpoints(), [0x81, 0x82, 0x83, 0x84]);

    let started = Instant::now();
    rig.channel.close().unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_millis(2200), "closing took {elapsed:?}");
    assert!(record.polled_endpoints().is_empty());
    assert!(rig.device.claimed_interfaces().is_empty());
}

#[test]
fn exhausted_pool_rolls_back_open() {
    let rig = Rig::closed(VirtualDevice::logitech(1, 4, 0xc548), SENSOR_FEATURES, config(200, 3));

    let err = rig.channel.open().unwrap_err();
    assert!(matches!(
        err,
        ChannelError::Transport(TransportError::WorkerPoolExhausted { max_threads: 3 })
    ));
    assert!(!rig.channel.is_open());
    assert!(rig.device.claimed_interfaces().is_empty());
    assert!(rig.channel.record().unwrap().polled_endpoints().is_empty());
}

#[test]
fn closing_twice_is_harmless() {
    let rig = Rig::sensor_device(config(200, 4));

    rig.channel.close().unwrap();
    rig.channel.close().unwrap();
    assert!(!rig.channel.is_open());
    assert!(matches!(rig.channel.root().ping(0x01), Err(ChannelError::ChannelClosed)));

    rig.context.close().unwrap();
    rig.context.close().unwrap();
    assert!(!rig.context.is_open());
}

#[test]
#[traced_test]
fn late_responses_are_dropped() {
    let rig = Rig::sensor_device(config(200, 4));
    rig.channel.resolve_feature(mlx90393_multi_sensor::FEATURE_ID).unwrap();

    let frame = VirtualDevice::long_reply(&[0x10, DEVICE_INDEX, SENSOR_FEATURE_INDEX, 0x07], &[0x02, 0x0a]);
    assert_eq!(rig.channel.dispatcher().dispatch(&frame), None);

    assert!(logs_contain("dropping response without a pending request"));
}

#[test]
#[traced_test]
fn untreated_messages_are_reported_on_close() {
    let rig = Rig::sensor_device(config(200, 4));
    rig.channel.resolve_feature(mlx90393_multi_sensor::FEATURE_ID).unwrap();

    let event = VirtualDevice::long_reply(&[0x11, DEVICE_INDEX, SENSOR_FEATURE_INDEX, 0x00], &[0x01, 0x00, 0x10]);
    assert_eq!(rig.channel.dispatcher().dispatch(&event), Some(QueueName::Event));
    assert_eq!(rig.channel.dispatcher().queue_len(QueueName::Event), 1);

    rig.channel.close().unwrap();
    assert_eq!(rig.channel.dispatcher().queue_len(QueueName::Event), 0);
    assert!(logs_contain("untreated message"));
}

#[test]
fn monitor_reports_arrive_as_events() {
    let rig = Rig::sensor_device(config(500, 4));
    let sensors = rig.channel.feature::<Mlx90393MultiSensorFeature>().unwrap();

    let mut event = VirtualDevice::long_reply(
        &[0x11, DEVICE_INDEX, SENSOR_FEATURE_INDEX, 0x00],
        &[0x01, 0x00, 0x10, 0x00, 0x20, 0x00, 0x30],
    );
    event[18..20].copy_from_slice(&[0x00, 0x2a]);
    rig.device.inject(0x83, &event);

    let report = sensors.next_monitor_report(Duration::from_secs(1)).unwrap();
    assert_eq!(report.sensor_id, 0x01);
    assert_eq!((report.axis_x, report.axis_y, report.axis_z), (0x10, 0x20, 0x30));
    assert_eq!(report.counter, 0x2a);
}
