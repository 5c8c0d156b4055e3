//! An in-memory USB backend.
//!
//! Virtual devices answer written HID++ frames through a scripted responder
//! and can be unplugged and plugged in again. Hot-plug notifications are
//! delivered from [`UsbBackend::handle_events`], i.e. on the context event
//! thread, like libusb does.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tracing::debug;

use super::{
    REPORT_DESCRIPTOR_TYPE, REQUEST_GET_DESCRIPTOR, REQUEST_SET_REPORT, REQUEST_TYPE_CLASS_INTERFACE_OUT,
    REQUEST_TYPE_INTERFACE_IN, TransportError,
    backend::{EndpointInfo, HotplugSink, InterfaceInfo, UsbBackend, UsbDeviceInfo, UsbHandle},
};
use crate::{
    feature::{feature_set, root},
    protocol::v20,
    report::{HEADER_LENGTH, LONG_REPORT_ID, LONG_REPORT_LENGTH, MessageHeader},
};

/// The report descriptor of a HID++ interface declaring short (`0x10`) and
/// long (`0x11`) reports on the vendor usage page `0xff00`.
pub const HIDPP_REPORT_DESCRIPTOR: &[u8] = &[
    0x06, 0x00, 0xff, // Usage Page (Vendor 0xff00)
    0x09, 0x01, // Usage (1)
    0xa1, 0x01, // Collection (Application)
    0x85, 0x10, //   Report ID (0x10)
    0x75, 0x08, //   Report Size (8)
    0x95, 0x06, //   Report Count (6)
    0x15, 0x00, //   Logical Minimum (0)
    0x26, 0xff, 0x00, //   Logical Maximum (255)
    0x09, 0x01, //   Usage (1)
    0x81, 0x00, //   Input (Data, Array, Abs)
    0x09, 0x01, //   Usage (1)
    0x91, 0x00, //   Output (Data, Array, Abs)
    0xc0, // End Collection
    0x06, 0x00, 0xff, // Usage Page (Vendor 0xff00)
    0x09, 0x02, // Usage (2)
    0xa1, 0x01, // Collection (Application)
    0x85, 0x11, //   Report ID (0x11)
    0x75, 0x08, //   Report Size (8)
    0x95, 0x13, //   Report Count (19)
    0x15, 0x00, //   Logical Minimum (0)
    0x26, 0xff, 0x00, //   Logical Maximum (255)
    0x09, 0x02, //   Usage (2)
    0x81, 0x00, //   Input (Data, Array, Abs)
    0x09, 0x02, //   Usage (2)
    0x91, 0x00, //   Output (Data, Array, Abs)
    0xc0, // End Collection
];

/// Answers a written frame with the frames the device sends back.
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

enum Inbound {
    Frame(Vec<u8>),
    Unplugged,
}

/// A simulated USB device.
pub struct VirtualDevice {
    info: UsbDeviceInfo,
    plugged: AtomicBool,
    generation: AtomicU32,
    endpoints: HashMap<u8, (flume::Sender<Inbound>, flume::Receiver<Inbound>)>,
    report_descriptors: HashMap<u8, Vec<u8>>,
    responder: Mutex<Option<Responder>>,
    written: Mutex<Vec<Vec<u8>>>,
    kernel_drivers: Mutex<HashSet<u8>>,
    claimed: Mutex<HashSet<u8>>,
}

impl VirtualDevice {
    /// Creates a device with the given interfaces. Every interface starts out
    /// bound to a kernel driver.
    pub fn new(info: UsbDeviceInfo) -> Self {
        let endpoints = info
            .interfaces
            .iter()
            .flat_map(InterfaceInfo::in_endpoints)
            .map(|ep| (ep.address, flume::unbounded()))
            .collect();
        let kernel_drivers = info.interfaces.iter().map(|i| i.number).collect();

        Self {
            info,
            plugged: AtomicBool::new(true),
            generation: AtomicU32::new(0),
            endpoints,
            report_descriptors: HashMap::new(),
            responder: Mutex::new(None),
            written: Mutex::new(Vec::new()),
            kernel_drivers: Mutex::new(kernel_drivers),
            claimed: Mutex::new(HashSet::new()),
        }
    }

    /// Creates a typical Logitech device: a keyboard interface on endpoint
    /// `0x81`, a mouse interface on `0x82` and a HID++ interface on `0x83`
    /// without interrupt OUT endpoint.
    pub fn logitech(bus: u8, port: u8, product_id: u16) -> Self {
        let interface = |number: u8, protocol: u8, endpoint: u8| InterfaceInfo {
            number,
            protocol,
            endpoints: vec![EndpointInfo {
                address: endpoint,
                max_packet_size: 64,
            }],
        };

        Self::new(UsbDeviceInfo {
            bus,
            ports: vec![port],
            address: port + 1,
            vendor_id: 0x046d,
            product_id,
            interfaces: vec![interface(0, 1, 0x81), interface(1, 2, 0x82), interface(2, 0, 0x83)],
        })
        .with_report_descriptor(2, HIDPP_REPORT_DESCRIPTOR)
    }

    pub fn with_report_descriptor(mut self, interface: u8, raw: &[u8]) -> Self {
        self.report_descriptors.insert(interface, raw.to_vec());
        self
    }

    pub fn info(&self) -> &UsbDeviceInfo {
        &self.info
    }

    /// Sets the responder invoked for every written HID++ frame.
    pub fn set_responder(&self, responder: impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static) {
        *self.responder.lock() = Some(Box::new(responder));
    }

    /// Makes a frame readable from an IN endpoint.
    pub fn inject(&self, endpoint: u8, frame: &[u8]) {
        if let Some((tx, _)) = self.endpoints.get(&endpoint) {
            let _ = tx.send(Inbound::Frame(frame.to_vec()));
        }
    }

    /// Every frame written to the device so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }

    pub fn is_plugged(&self) -> bool {
        self.plugged.load(Ordering::Acquire)
    }

    pub fn claimed_interfaces(&self) -> Vec<u8> {
        let mut claimed = self.claimed.lock().iter().copied().collect::<Vec<_>>();
        claimed.sort_unstable();
        claimed
    }

    pub fn kernel_driver_attached(&self, interface: u8) -> bool {
        self.kernel_drivers.lock().contains(&interface)
    }

    /// Builds a long response echoing the header of a request.
    pub fn long_reply(request: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; LONG_REPORT_LENGTH];
        frame[0] = LONG_REPORT_ID;
        if let Some(header) = request.get(1..4) {
            frame[1..4].copy_from_slice(header);
        }

        let len = payload.len().min(LONG_REPORT_LENGTH - HEADER_LENGTH);
        frame[HEADER_LENGTH..HEADER_LENGTH + len].copy_from_slice(&payload[..len]);
        frame
    }

    /// Builds a HID++2.0 error reply to a request.
    pub fn error_reply(request: &[u8], code: v20::ErrorType) -> Vec<u8> {
        let mut frame = vec![0u8; LONG_REPORT_LENGTH];
        frame[0] = LONG_REPORT_ID;
        frame[2] = v20::ERROR_MARKER;
        if let Some(&[device_index, feature_index, address]) = request.get(1..4) {
            frame[1] = device_index;
            frame[3] = feature_index;
            frame[4] = address;
        }
        frame[5] = code.into();
        frame
    }

    /// Answers the Root and FeatureSet requests of a HID++2.0 device with
    /// the given feature table of `(feature ID, version)` pairs.
    ///
    /// The position in the table is the feature index, so the table has to
    /// start with the Root feature. Requests to other features are left
    /// unanswered.
    pub fn answer_discovery(features: &[(u16, u8)], request: &[u8]) -> Option<Vec<u8>> {
        let header = MessageHeader::read(request)?;
        let payload = request.get(HEADER_LENGTH..)?;
        let function = header.function_index.to_lo();

        let Some(&(feature_id, _)) = features.get(usize::from(header.feature_index)) else {
            return Some(Self::error_reply(request, v20::ErrorType::InvalidFeatureIndex));
        };

        match (feature_id, function) {
            (root::FEATURE_ID, 0) => {
                let wanted = u16::from_be_bytes([*payload.first()?, *payload.get(1)?]);
                let (index, version) = features
                    .iter()
                    .enumerate()
                    .find(|(_, (id, _))| *id == wanted)
                    .and_then(|(index, &(_, version))| Some((u8::try_from(index).ok()?, version)))
                    .unwrap_or_default();
                Some(Self::long_reply(request, &[index, 0, version]))
            },
            (root::FEATURE_ID, 1) => Some(Self::long_reply(request, &[4, 0, *payload.get(2)?])),
            (feature_set::FEATURE_ID, 0) => {
                let count = u8::try_from(features.len().saturating_sub(1)).ok()?;
                Some(Self::long_reply(request, &[count]))
            },
            (feature_set::FEATURE_ID, 1) => match features.get(usize::from(*payload.first()?)) {
                Some(&(id, version)) => {
                    let [hi, lo] = id.to_be_bytes();
                    Some(Self::long_reply(request, &[hi, lo, 0, version]))
                },
                None => Some(Self::error_reply(request, v20::ErrorType::OutOfRange)),
            },
            (root::FEATURE_ID | feature_set::FEATURE_ID, _) => {
                Some(Self::error_reply(request, v20::ErrorType::InvalidFunctionId))
            },
            _ => None,
        }
    }

    fn unplug(&self) {
        self.plugged.store(false, Ordering::Release);
        self.claimed.lock().clear();
        for (tx, _) in self.endpoints.values() {
            let _ = tx.send(Inbound::Unplugged);
        }
    }

    fn replug(&self) {
        for (_, rx) in self.endpoints.values() {
            rx.drain().for_each(drop);
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        *self.kernel_drivers.lock() = self.info.interfaces.iter().map(|i| i.number).collect();
        self.plugged.store(true, Ordering::Release);
    }

    fn respond(&self, interface: u8, data: &[u8]) {
        self.written.lock().push(data.to_vec());

        let frames = match self.responder.lock().as_mut() {
            Some(responder) => responder(data),
            None => return,
        };

        let endpoint = self
            .info
            .interfaces
            .iter()
            .find(|i| i.number == interface)
            .and_then(|i| i.in_endpoints().next());

        match endpoint {
            Some(ep) => {
                for frame in frames {
                    self.inject(ep.address, &frame);
                }
            },
            None => debug!(interface, "no IN endpoint to answer on"),
        }
    }

    fn interface_of(&self, endpoint: u8) -> Option<u8> {
        self.info
            .interfaces
            .iter()
            .find(|i| i.endpoints.iter().any(|ep| ep.address == endpoint))
            .map(|i| i.number)
    }
}

impl fmt::Debug for VirtualDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualDevice")
            .field("info", &self.info)
            .field("plugged", &self.is_plugged())
            .finish_non_exhaustive()
    }
}

enum HotplugEvent {
    Arrived(UsbDeviceInfo),
    Left(UsbDeviceInfo),
}

/// A backend serving [`VirtualDevice`]s.
pub struct VirtualBackend {
    devices: Mutex<Vec<Arc<VirtualDevice>>>,
    sink: Mutex<Option<Weak<dyn HotplugSink>>>,
    hotplug_tx: flume::Sender<HotplugEvent>,
    hotplug_rx: flume::Receiver<HotplugEvent>,
}

impl VirtualBackend {
    pub fn new() -> Self {
        let (hotplug_tx, hotplug_rx) = flume::unbounded();
        Self {
            devices: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
            hotplug_tx,
            hotplug_rx,
        }
    }

    /// Attaches a device to the virtual bus.
    pub fn add_device(&self, device: VirtualDevice) -> Arc<VirtualDevice> {
        let device = Arc::new(device);
        self.devices.lock().push(Arc::clone(&device));
        device
    }

    /// Pulls the plug: pending and future I/O fails with
    /// [`TransportError::NoDevice`].
    pub fn unplug(&self, device: &VirtualDevice) {
        device.unplug();
        let _ = self.hotplug_tx.send(HotplugEvent::Left(device.info.clone()));
    }

    /// Plugs a device back in. Handles opened before stay dead.
    pub fn replug(&self, device: &VirtualDevice) {
        device.replug();
        let _ = self.hotplug_tx.send(HotplugEvent::Arrived(device.info.clone()));
    }
}

impl Default for VirtualBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbBackend for VirtualBackend {
    fn devices(&self) -> Result<Vec<UsbDeviceInfo>, TransportError> {
        Ok(self
            .devices
            .lock()
            .iter()
            .filter(|dev| dev.is_plugged())
            .map(|dev| dev.info.clone())
            .collect())
    }

    fn open(&self, info: &UsbDeviceInfo) -> Result<Arc<dyn UsbHandle>, TransportError> {
        let device = self
            .devices
            .lock()
            .iter()
            .find(|dev| dev.is_plugged() && dev.info.bus == info.bus && dev.info.address == info.address)
            .cloned()
            .ok_or(TransportError::DeviceNotFound)?;

        Ok(Arc::new(VirtualHandle {
            generation: device.generation.load(Ordering::Acquire),
            device,
        }))
    }

    fn register_hotplug(&self, sink: Weak<dyn HotplugSink>) -> Result<bool, TransportError> {
        *self.sink.lock() = Some(sink);
        Ok(true)
    }

    fn unregister_hotplug(&self) {
        self.sink.lock().take();
    }

    fn handle_events(&self, timeout: Duration) -> Result<(), TransportError> {
        let event = match self.hotplug_rx.recv_timeout(timeout) {
            Ok(event) => event,
            Err(_) => return Ok(()),
        };

        let Some(sink) = self.sink.lock().as_ref().and_then(Weak::upgrade) else {
            return Ok(());
        };

        match event {
            HotplugEvent::Arrived(info) => sink.device_arrived(info),
            HotplugEvent::Left(info) => sink.device_left(info),
        }
        Ok(())
    }
}

struct VirtualHandle {
    device: Arc<VirtualDevice>,
    generation: u32,
}

impl VirtualHandle {
    fn alive(&self) -> Result<&VirtualDevice, TransportError> {
        let device = self.device.as_ref();
        if device.is_plugged() && device.generation.load(Ordering::Acquire) == self.generation {
            Ok(device)
        } else {
            Err(TransportError::NoDevice)
        }
    }
}

impl UsbHandle for VirtualHandle {
    fn kernel_driver_active(&self, interface: u8) -> Result<bool, TransportError> {
        Ok(self.alive()?.kernel_driver_attached(interface))
    }

    fn detach_kernel_driver(&self, interface: u8) -> Result<(), TransportError> {
        self.alive()?.kernel_drivers.lock().remove(&interface);
        Ok(())
    }

    fn attach_kernel_driver(&self, interface: u8) -> Result<(), TransportError> {
        self.alive()?.kernel_drivers.lock().insert(interface);
        Ok(())
    }

    fn claim_interface(&self, interface: u8) -> Result<(), TransportError> {
        let device = self.alive()?;
        if device.kernel_driver_attached(interface) {
            return Err(TransportError::Busy);
        }
        if !device.claimed.lock().insert(interface) {
            return Err(TransportError::Busy);
        }
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<(), TransportError> {
        if self.alive()?.claimed.lock().remove(&interface) {
            Ok(())
        } else {
            Err(TransportError::DeviceNotFound)
        }
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        let device = self.alive()?;
        if (request_type, request, value) != (REQUEST_TYPE_INTERFACE_IN, REQUEST_GET_DESCRIPTOR, REPORT_DESCRIPTOR_TYPE) {
            return Err(TransportError::Pipe);
        }

        let index = u8::try_from(index).map_err(|_| TransportError::Pipe)?;
        let descriptor = device.report_descriptors.get(&index).ok_or(TransportError::Pipe)?;
        let len = descriptor.len().min(buf.len());
        buf[..len].copy_from_slice(&descriptor[..len]);
        Ok(len)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        _value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        let device = self.alive()?;
        if (request_type, request) == (REQUEST_TYPE_CLASS_INTERFACE_OUT, REQUEST_SET_REPORT) {
            let interface = u8::try_from(index).map_err(|_| TransportError::Pipe)?;
            device.respond(interface, data);
        }
        Ok(data.len())
    }

    fn read_interrupt(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let device = self.alive()?;
        let (tx, rx) = device.endpoints.get(&endpoint).ok_or(TransportError::Pipe)?;

        match rx.recv_timeout(timeout) {
            Ok(Inbound::Frame(frame)) => {
                // Frames sent after a replug belong to the handles opened since.
                if self.alive().is_err() {
                    let _ = tx.send(Inbound::Frame(frame));
                    return Err(TransportError::NoDevice);
                }
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                Ok(len)
            },
            Ok(Inbound::Unplugged) => Err(TransportError::NoDevice),
            Err(flume::RecvTimeoutError::Timeout) => {
                self.alive()?;
                Err(TransportError::Timeout)
            },
            Err(flume::RecvTimeoutError::Disconnected) => Err(TransportError::NoDevice),
        }
    }

    fn write_interrupt(&self, endpoint: u8, data: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        let device = self.alive()?;
        let interface = device.interface_of(endpoint).ok_or(TransportError::Pipe)?;
        device.respond(interface, data);
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responder_answers_on_interface_endpoint() {
        let backend = VirtualBackend::new();
        let device = backend.add_device(VirtualDevice::logitech(1, 2, 0xc094));
        device.set_responder(|request| vec![VirtualDevice::long_reply(request, &[0xaa])]);

        let info = backend.devices().unwrap().remove(0);
        let handle = backend.open(&info).unwrap();
        handle
            .write_control(0x21, 0x09, 0x0210, 2, &[0x10, 0x01, 0x00, 0x1a, 0, 0, 0], Duration::ZERO)
            .unwrap();

        let mut buf = [0u8; 20];
        let len = handle.read_interrupt(0x83, &mut buf, Duration::from_millis(100)).unwrap();
        assert_eq!(len, 20);
        assert_eq!(buf[..5], [0x11, 0x01, 0x00, 0x1a, 0xaa]);
        assert_eq!(device.written().len(), 1);
    }

    #[test]
    fn unplugged_handles_stay_dead() {
        let backend = VirtualBackend::new();
        let device = backend.add_device(VirtualDevice::logitech(1, 2, 0xc094));
        let info = device.info().clone();
        let handle = backend.open(&info).unwrap();

        backend.unplug(&device);
        let mut buf = [0u8; 20];
        assert!(matches!(
            handle.read_interrupt(0x81, &mut buf, Duration::from_millis(10)),
            Err(TransportError::NoDevice)
        ));
        assert!(backend.devices().unwrap().is_empty());

        backend.replug(&device);
        assert!(matches!(handle.claim_interface(0), Err(TransportError::NoDevice)));
        assert_eq!(backend.devices().unwrap().len(), 1);
        assert!(backend.open(&info).is_ok());
    }

    #[test]
    fn kernel_driver_blocks_claim() {
        let backend = VirtualBackend::new();
        let device = backend.add_device(VirtualDevice::logitech(1, 2, 0xc094));
        let handle = backend.open(device.info()).unwrap();

        assert!(handle.kernel_driver_active(2).unwrap());
        assert!(matches!(handle.claim_interface(2), Err(TransportError::Busy)));

        handle.detach_kernel_driver(2).unwrap();
        handle.claim_interface(2).unwrap();
        assert_eq!(device.claimed_interfaces(), [2]);
    }
}
