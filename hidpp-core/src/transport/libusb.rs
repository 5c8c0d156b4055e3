//! The production backend, driving devices through libusb.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use rusb::{Context, Device, DeviceHandle, Hotplug, HotplugBuilder, Registration, TransferType, UsbContext};
use tracing::{debug, warn};

use super::{
    TransportError,
    backend::{EndpointInfo, HID_CLASS, HotplugSink, InterfaceInfo, UsbBackend, UsbDeviceInfo, UsbHandle},
};

impl From<rusb::Error> for TransportError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Pipe => Self::Pipe,
            rusb::Error::Io => Self::Io,
            rusb::Error::NoDevice => Self::NoDevice,
            rusb::Error::Timeout => Self::Timeout,
            rusb::Error::Busy => Self::Busy,
            rusb::Error::Access => Self::PermissionDenied,
            rusb::Error::NotFound => Self::DeviceNotFound,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A backend based on a dedicated libusb context.
pub struct LibUsbBackend {
    context: Context,
    registration: Mutex<Option<Registration<Context>>>,
}

impl LibUsbBackend {
    pub fn new() -> Result<Self, TransportError> {
        Ok(Self {
            context: Context::new()?,
            registration: Mutex::new(None),
        })
    }
}

/// Describes a device, returning [`None`] if it has no HID interface.
fn describe(device: &Device<Context>) -> Result<Option<UsbDeviceInfo>, rusb::Error> {
    let descriptor = device.device_descriptor()?;
    let config = device.active_config_descriptor()?;

    let interfaces = config
        .interfaces()
        .filter_map(|interface| interface.descriptors().next())
        .filter(|desc| desc.class_code() == HID_CLASS)
        .map(|desc| InterfaceInfo {
            number: desc.interface_number(),
            protocol: desc.protocol_code(),
            endpoints: desc
                .endpoint_descriptors()
                .filter(|ep| ep.transfer_type() == TransferType::Interrupt)
                .map(|ep| EndpointInfo {
                    address: ep.address(),
                    max_packet_size: ep.max_packet_size(),
                })
                .collect(),
        })
        .collect::<Vec<_>>();

    if interfaces.is_empty() {
        return Ok(None);
    }

    Ok(Some(UsbDeviceInfo {
        bus: device.bus_number(),
        ports: device.port_numbers()?,
        address: device.address(),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        interfaces,
    }))
}

/// Describes a device that may already be gone, without its interfaces.
fn describe_minimal(device: &Device<Context>) -> Option<UsbDeviceInfo> {
    let descriptor = device.device_descriptor().ok()?;

    Some(UsbDeviceInfo {
        bus: device.bus_number(),
        ports: device.port_numbers().unwrap_or_default(),
        address: device.address(),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        interfaces: Vec::new(),
    })
}

impl UsbBackend for LibUsbBackend {
    fn devices(&self) -> Result<Vec<UsbDeviceInfo>, TransportError> {
        let mut found = Vec::new();

        for device in self.context.devices()?.iter() {
            match describe(&device) {
                Ok(Some(info)) => found.push(info),
                Ok(None) => {},
                Err(err) => debug!(
                    bus = device.bus_number(),
                    address = device.address(),
                    "skipping device: {err}"
                ),
            }
        }

        Ok(found)
    }

    fn open(&self, info: &UsbDeviceInfo) -> Result<Arc<dyn UsbHandle>, TransportError> {
        let device = self
            .context
            .devices()?
            .iter()
            .find(|dev| dev.bus_number() == info.bus && dev.address() == info.address)
            .ok_or(TransportError::DeviceNotFound)?;

        Ok(Arc::new(LibUsbHandle {
            handle: device.open()?,
        }))
    }

    fn register_hotplug(&self, sink: Weak<dyn HotplugSink>) -> Result<bool, TransportError> {
        if !rusb::has_hotplug() {
            return Ok(false);
        }

        let registration =
            HotplugBuilder::new().register::<Context, _>(&self.context, Box::new(HotplugForwarder { sink }))?;
        *self.registration.lock() = Some(registration);

        Ok(true)
    }

    fn unregister_hotplug(&self) {
        self.registration.lock().take();
    }

    fn handle_events(&self, timeout: Duration) -> Result<(), TransportError> {
        self.context.handle_events(Some(timeout))?;
        Ok(())
    }
}

struct HotplugForwarder {
    sink: Weak<dyn HotplugSink>,
}

impl Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<Context>) {
        let Some(sink) = self.sink.upgrade() else {
            return;
        };

        match describe(&device) {
            Ok(Some(info)) => sink.device_arrived(info),
            Ok(None) => {},
            Err(err) => warn!("could not describe arrived device: {err}"),
        }
    }

    fn device_left(&mut self, device: Device<Context>) {
        let Some(sink) = self.sink.upgrade() else {
            return;
        };

        if let Some(info) = describe_minimal(&device) {
            sink.device_left(info);
        }
    }
}

struct LibUsbHandle {
    handle: DeviceHandle<Context>,
}

impl UsbHandle for LibUsbHandle {
    fn kernel_driver_active(&self, interface: u8) -> Result<bool, TransportError> {
        match self.handle.kernel_driver_active(interface) {
            Ok(active) => Ok(active),
            Err(rusb::Error::NotSupported) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn detach_kernel_driver(&self, interface: u8) -> Result<(), TransportError> {
        Ok(self.handle.detach_kernel_driver(interface)?)
    }

    fn attach_kernel_driver(&self, interface: u8) -> Result<(), TransportError> {
        Ok(self.handle.attach_kernel_driver(interface)?)
    }

    fn claim_interface(&self, interface: u8) -> Result<(), TransportError> {
        Ok(self.handle.claim_interface(interface)?)
    }

    fn release_interface(&self, interface: u8) -> Result<(), TransportError> {
        Ok(self.handle.release_interface(interface)?)
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        Ok(self
            .handle
            .read_control(request_type, request, value, index, buf, timeout)?)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        Ok(self
            .handle
            .write_control(request_type, request, value, index, data, timeout)?)
    }

    fn read_interrupt(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        Ok(self.handle.read_interrupt(endpoint, buf, timeout)?)
    }

    fn write_interrupt(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        Ok(self.handle.write_interrupt(endpoint, data, timeout)?)
    }
}
