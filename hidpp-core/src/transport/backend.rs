//! The seam between the transport context and the USB library doing the
//! actual I/O.

use std::{fmt, sync::Arc, time::Duration};

use super::TransportError;

/// The USB class code of HID interfaces.
pub const HID_CLASS: u8 = 0x03;

/// Describes an interrupt endpoint of an interface.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
pub struct EndpointInfo {
    pub address: u8,
    pub max_packet_size: u16,
}

impl EndpointInfo {
    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }
}

/// What an interface is used for, derived from its interface protocol.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
pub enum InterfaceKind {
    Hidpp,
    Keyboard,
    Mouse,
    Other(u8),
}

impl From<u8> for InterfaceKind {
    fn from(protocol: u8) -> Self {
        match protocol {
            0 => Self::Hidpp,
            1 => Self::Keyboard,
            2 => Self::Mouse,
            other => Self::Other(other),
        }
    }
}

/// Describes a HID interface of a device.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
pub struct InterfaceInfo {
    pub number: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointInfo>,
}

impl InterfaceInfo {
    pub fn kind(&self) -> InterfaceKind {
        InterfaceKind::from(self.protocol)
    }

    pub fn in_endpoints(&self) -> impl Iterator<Item = &EndpointInfo> {
        self.endpoints.iter().filter(|ep| ep.is_in())
    }

    pub fn out_endpoint(&self) -> Option<&EndpointInfo> {
        self.endpoints.iter().find(|ep| !ep.is_in())
    }
}

/// Describes a device found on the bus.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
pub struct UsbDeviceInfo {
    pub bus: u8,
    pub ports: Vec<u8>,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub interfaces: Vec<InterfaceInfo>,
}

impl UsbDeviceInfo {
    /// A stable name derived from the bus number and the port chain, e.g.
    /// `Bus 001 Device 3->1`.
    pub fn reader_name(&self) -> String {
        let ports = self
            .ports
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("->");
        format!("Bus {:03} Device {}", self.bus, ports)
    }

    /// Whether two descriptions denote the same physical device slot.
    pub fn same_device(&self, other: &UsbDeviceInfo) -> bool {
        self.bus == other.bus
            && self.ports == other.ports
            && self.vendor_id == other.vendor_id
            && self.product_id == other.product_id
    }
}

impl fmt::Display for UsbDeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:04x}:{:04x}]",
            self.reader_name(),
            self.vendor_id,
            self.product_id
        )
    }
}

/// Receives hot-plug notifications from a backend.
pub trait HotplugSink: Send + Sync {
    fn device_arrived(&self, info: UsbDeviceInfo);
    fn device_left(&self, info: UsbDeviceInfo);
}

/// A USB library able to enumerate and open devices.
pub trait UsbBackend: Send + Sync + 'static {
    /// Lists the devices exposing at least one HID interface.
    fn devices(&self) -> Result<Vec<UsbDeviceInfo>, TransportError>;

    /// Opens a previously listed device.
    fn open(&self, device: &UsbDeviceInfo) -> Result<Arc<dyn UsbHandle>, TransportError>;

    /// Registers the single hot-plug callback of the context.
    ///
    /// Returns `false` if the platform does not support hot-plug detection.
    fn register_hotplug(&self, sink: std::sync::Weak<dyn HotplugSink>) -> Result<bool, TransportError>;

    fn unregister_hotplug(&self);

    /// Processes pending library events, such as hot-plug notifications.
    fn handle_events(&self, timeout: Duration) -> Result<(), TransportError>;
}

/// An open device.
pub trait UsbHandle: Send + Sync {
    fn kernel_driver_active(&self, interface: u8) -> Result<bool, TransportError>;
    fn detach_kernel_driver(&self, interface: u8) -> Result<(), TransportError>;
    fn attach_kernel_driver(&self, interface: u8) -> Result<(), TransportError>;
    fn claim_interface(&self, interface: u8) -> Result<(), TransportError>;
    fn release_interface(&self, interface: u8) -> Result<(), TransportError>;

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    fn read_interrupt(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    fn write_interrupt(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_name_from_port_chain() {
        let info = UsbDeviceInfo {
            bus: 1,
            ports: vec![3, 1],
            address: 7,
            vendor_id: 0x046d,
            product_id: 0xc548,
            interfaces: vec![],
        };

        assert_eq!(info.reader_name(), "Bus 001 Device 3->1");
        assert_eq!(info.to_string(), "Bus 001 Device 3->1 [046d:c548]");
    }

    #[test]
    fn interface_classification() {
        let interface = InterfaceInfo {
            number: 2,
            protocol: 0,
            endpoints: vec![
                EndpointInfo {
                    address: 0x83,
                    max_packet_size: 64,
                },
                EndpointInfo {
                    address: 0x03,
                    max_packet_size: 64,
                },
            ],
        };

        assert_eq!(interface.kind(), InterfaceKind::Hidpp);
        assert_eq!(interface.in_endpoints().count(), 1);
        assert_eq!(interface.out_endpoint().unwrap().address, 0x03);
        assert_eq!(InterfaceKind::from(2), InterfaceKind::Mouse);
    }
}
