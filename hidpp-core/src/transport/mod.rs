//! Owns USB device handles and runs the background readers feeding the
//! channels.
//!
//! The [`UsbContext`] keeps a record for every HID device found on the bus.
//! Opening a device claims all of its HID interfaces, after which every
//! interrupt IN endpoint can be polled by a [`PollingTask`] running on a
//! bounded [`WorkerPool`].
//!
//! Locks are taken in the order context open/close, device open/close,
//! endpoint task map. Hot-plug and poller threads only ever try to take the
//! endpoint task map.

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Mutex, ReentrantMutex};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    config::{ConfigError, TransportConfig},
    event::EventEmitter,
    trace::TraceSink,
};

pub mod backend;
pub mod device;
pub mod libusb;
pub mod polling;
pub mod virtual_device;

use backend::{HotplugSink, UsbBackend, UsbDeviceInfo, UsbHandle};
use device::{DeviceEvent, DeviceRecord, DeviceState};
use polling::{FrameCallback, InterruptReader, PollingTask, TaskExit, WorkerPool};

/// `bmRequestType` of a standard GET_DESCRIPTOR request addressed to an
/// interface.
pub const REQUEST_TYPE_INTERFACE_IN: u8 = 0x81;

/// `bmRequestType` of a HID class request addressed to an interface.
pub const REQUEST_TYPE_CLASS_INTERFACE_OUT: u8 = 0x21;

pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
pub const REQUEST_SET_REPORT: u8 = 0x09;

/// Descriptor type of HID report descriptors, in the high byte of `wValue`.
pub const REPORT_DESCRIPTOR_TYPE: u16 = 0x2200;

/// Report type of output reports, in the high byte of `wValue`.
pub const OUTPUT_REPORT_TYPE: u16 = 0x0200;

/// Grace added to the USB timeout when waiting for a poller to stop.
const STOP_GRACE_FACTOR: f64 = 1.01;

/// Represents an error reported by the USB transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("endpoint stalled")]
    Pipe,

    #[error("input/output error")]
    Io,

    #[error("the device is gone")]
    NoDevice,

    #[error("the transfer timed out")]
    Timeout,

    #[error("the device was not found")]
    DeviceNotFound,

    #[error("the device is not open")]
    DeviceNotOpen,

    #[error("the device is not connected")]
    DeviceNotConnected,

    #[error("the device or interface is busy")]
    Busy,

    #[error("insufficient permissions to access the device")]
    PermissionDenied,

    #[error("the USB context is not open")]
    ContextNotOpen,

    #[error("all {max_threads} worker threads are in use")]
    WorkerPoolExhausted { max_threads: usize },

    #[error("invalid transport configuration")]
    Config(#[from] ConfigError),

    #[error("USB error: {0}")]
    Other(String),
}

/// Owns the USB backend, its device records and the worker pool.
pub struct UsbContext {
    config: TransportConfig,
    backend: Arc<dyn UsbBackend>,
    trace: TraceSink,
    pool: WorkerPool,
    devices: Mutex<Vec<Arc<DeviceRecord>>>,
    events: Arc<EventEmitter<DeviceEvent>>,
    open_close: ReentrantMutex<()>,
    is_open: AtomicBool,
    event_task: Mutex<Option<PollingTask>>,
    weak: Weak<UsbContext>,
}

impl UsbContext {
    /// Creates a context driving devices through the given backend.
    pub fn new(config: TransportConfig, backend: Arc<dyn UsbBackend>) -> Result<Arc<Self>, TransportError> {
        config.validate()?;
        let trace = TraceSink::from_config(&config)?;

        Ok(Arc::new_cyclic(|weak| Self {
            pool: WorkerPool::new(config.max_threads),
            config,
            backend,
            trace,
            devices: Mutex::new(Vec::new()),
            events: Arc::new(EventEmitter::new()),
            open_close: ReentrantMutex::new(()),
            is_open: AtomicBool::new(false),
            event_task: Mutex::new(None),
            weak: weak.clone(),
        }))
    }

    /// Creates a context driving devices through libusb.
    pub fn with_libusb(config: TransportConfig) -> Result<Arc<Self>, TransportError> {
        Self::new(config, Arc::new(libusb::LibUsbBackend::new()?))
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn trace(&self) -> &TraceSink {
        &self.trace
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Acquire)
    }

    /// Creates a receiver for device events.
    pub fn subscribe(&self) -> flume::Receiver<DeviceEvent> {
        self.events.create_receiver()
    }

    /// Enumerates the bus and starts listening for hot-plug events.
    pub fn open(&self) -> Result<(), TransportError> {
        self.trace.in_scope(|| {
            let _guard = self.open_close.lock();
            if self.is_open() {
                debug!("USB context already open");
                return Ok(());
            }

            self.update_device_list()?;

            let sink: Weak<dyn HotplugSink> = self.weak.clone();
            if self.backend.register_hotplug(sink)? {
                let task = PollingTask::context_events(&self.pool, self.trace.clone(), Arc::clone(&self.backend));
                match task {
                    Ok(task) => *self.event_task.lock() = Some(task),
                    Err(err) => {
                        self.backend.unregister_hotplug();
                        return Err(err);
                    },
                }
            } else {
                info!("hot-plug detection is not supported, relying on enumeration");
            }

            self.is_open.store(true, Ordering::Release);
            info!("USB context open");
            Ok(())
        })
    }

    /// Closes every open device and stops listening for hot-plug events.
    ///
    /// Closing a closed context does nothing.
    pub fn close(&self) -> Result<(), TransportError> {
        self.trace.in_scope(|| {
            let _guard = self.open_close.lock();
            if !self.is_open() {
                debug!("USB context already closed");
                return Ok(());
            }

            self.backend.unregister_hotplug();
            if let Some(task) = self.event_task.lock().take() {
                task.stop(self.stop_timeout());
            }

            for record in self.devices() {
                if let Err(err) = self.close_device(&record) {
                    warn!(reader_name = record.reader_name(), "could not close device: {err}");
                }
            }

            self.is_open.store(false, Ordering::Release);
            info!("USB context closed");
            Ok(())
        })
    }

    /// Enumerates the bus, adding new devices and marking vanished ones as
    /// lost.
    pub fn update_device_list(&self) -> Result<Vec<Arc<DeviceRecord>>, TransportError> {
        self.trace.in_scope(|| {
            let found = self.backend.devices()?;
            let mut devices = self.devices.lock();

            for record in devices.iter() {
                if !found.iter().any(|info| record.matches(info)) {
                    record.mark_lost();
                }
            }

            for info in found {
                match devices.iter().find(|record| record.matches(&info)) {
                    Some(record) => record.mark_arrived(info),
                    None => {
                        debug!(device = %info, "detected device");
                        let record = Arc::new(DeviceRecord::new(info, Arc::clone(&self.events)));
                        self.events.emit(DeviceEvent::Arrived(record.reader_name().to_string()));
                        devices.push(record);
                    },
                }
            }

            Ok(devices.clone())
        })
    }

    /// All known device records, including lost ones.
    pub fn devices(&self) -> Vec<Arc<DeviceRecord>> {
        self.devices.lock().clone()
    }

    pub fn find_device(&self, reader_name: &str) -> Option<Arc<DeviceRecord>> {
        self.devices
            .lock()
            .iter()
            .find(|record| record.reader_name() == reader_name)
            .cloned()
    }

    /// The first connected device matching the configured selector.
    pub fn select_device(&self) -> Result<Arc<DeviceRecord>, TransportError> {
        self.devices
            .lock()
            .iter()
            .find(|record| {
                record.is_connected()
                    && self
                        .config
                        .selects(record.reader_name(), record.vendor_id(), record.product_id())
            })
            .cloned()
            .ok_or(TransportError::DeviceNotFound)
    }

    /// Opens a device, detaching kernel drivers and claiming every HID
    /// interface.
    pub fn open_device(&self, record: &DeviceRecord) -> Result<(), TransportError> {
        self.trace.in_scope(|| {
            if !self.is_open() {
                return Err(TransportError::ContextNotOpen);
            }

            let _guard = record.open_close.lock();
            if record.is_open() {
                return Ok(());
            }
            if !record.is_connected() {
                return Err(TransportError::DeviceNotConnected);
            }

            record.set_state(DeviceState::Opening);
            let claimed = self.claim_device(record).and_then(|()| {
                if record.is_connected() {
                    return Ok(());
                }
                drop(std::mem::take(&mut *record.inner.lock()));
                Err(TransportError::DeviceNotConnected)
            });
            match claimed {
                Ok(()) => {
                    record.set_state(DeviceState::Open);
                    info!(reader_name = record.reader_name(), "device open");
                    record.emit(DeviceEvent::Opened(record.reader_name().to_string()));
                    Ok(())
                },
                Err(err) => {
                    record.set_state(if record.is_connected() {
                        DeviceState::Detected
                    } else {
                        DeviceState::Lost
                    });
                    Err(err)
                },
            }
        })
    }

    fn claim_device(&self, record: &DeviceRecord) -> Result<(), TransportError> {
        let info = record.info();
        let handle = self.backend.open(&info)?;
        let mut detached = Vec::new();
        let mut claimed = Vec::new();

        let result = info.interfaces.iter().try_for_each(|interface| {
            if handle.kernel_driver_active(interface.number)? {
                debug!(interface = interface.number, "detaching kernel driver");
                handle.detach_kernel_driver(interface.number)?;
                detached.push(interface.number);
            }

            handle.claim_interface(interface.number)?;
            claimed.push(interface.number);
            Ok(())
        });

        if let Err(err) = result {
            self.release(handle.as_ref(), &claimed, &detached);
            return Err(err);
        }

        *record.inner.lock() = device::DeviceInner {
            handle: Some(handle),
            claimed,
            detached,
        };
        Ok(())
    }

    fn release(&self, handle: &dyn UsbHandle, claimed: &[u8], detached: &[u8]) {
        for &interface in claimed {
            if let Err(err) = handle.release_interface(interface) {
                warn!(interface, "could not release interface: {err}");
            }
        }

        if self.config.reattach_kernel_driver {
            for &interface in detached {
                if let Err(err) = handle.attach_kernel_driver(interface) {
                    warn!(interface, "could not reattach kernel driver: {err}");
                }
            }
        }
    }

    /// Stops every poller of a device, releases its interfaces and closes
    /// its handle.
    ///
    /// Closing a closed device only stops pollers left behind by a device
    /// loss. Teardown failures are logged and do not prevent releasing the
    /// remaining interfaces.
    pub fn close_device(&self, record: &DeviceRecord) -> Result<(), TransportError> {
        self.trace.in_scope(|| {
            let _guard = record.open_close.lock();
            if !record.is_open() {
                self.stop_interrupt_read_polling(record, None);
                return Ok(());
            }

            record.set_state(DeviceState::Closing);
            self.stop_interrupt_read_polling(record, None);

            let inner = std::mem::take(&mut *record.inner.lock());
            if let Some(handle) = inner.handle {
                if record.is_connected() {
                    self.release(handle.as_ref(), &inner.claimed, &inner.detached);
                }
            }

            record.set_state(if record.is_connected() {
                DeviceState::Detected
            } else {
                DeviceState::Lost
            });
            info!(reader_name = record.reader_name(), "device closed");
            record.emit(DeviceEvent::Closed(record.reader_name().to_string()));
            Ok(())
        })
    }

    fn usb_call<T>(
        &self,
        record: &DeviceRecord,
        call: impl FnOnce(&dyn UsbHandle) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        self.trace.in_scope(|| {
            let handle = record.handle()?;
            let result = call(handle.as_ref());
            if matches!(result, Err(TransportError::NoDevice)) {
                record.mark_lost();
            }
            result
        })
    }

    pub fn control_write(
        &self,
        record: &DeviceRecord,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        debug!(request_type, request, value, index, ?data, "control write");
        self.usb_call(record, |handle| {
            handle.write_control(request_type, request, value, index, data, self.config.usb_timeout())
        })
    }

    pub fn control_read(
        &self,
        record: &DeviceRecord,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: usize,
    ) -> Result<Vec<u8>, TransportError> {
        self.usb_call(record, |handle| {
            let mut buf = vec![0u8; length];
            let len = handle.read_control(request_type, request, value, index, &mut buf, self.config.usb_timeout())?;
            buf.truncate(len);
            debug!(request_type, request, value, index, data = ?buf, "control read");
            Ok(buf)
        })
    }

    pub fn interrupt_write(&self, record: &DeviceRecord, endpoint: u8, data: &[u8]) -> Result<usize, TransportError> {
        debug!(endpoint, ?data, "interrupt write");
        self.usb_call(record, |handle| {
            handle.write_interrupt(endpoint, data, self.config.usb_timeout())
        })
    }

    pub fn interrupt_read(&self, record: &DeviceRecord, endpoint: u8, length: usize) -> Result<Vec<u8>, TransportError> {
        self.usb_call(record, |handle| {
            let mut buf = vec![0u8; length];
            let len = handle.read_interrupt(endpoint, &mut buf, self.config.usb_timeout())?;
            buf.truncate(len);
            Ok(buf)
        })
    }

    /// Starts polling an interrupt IN endpoint of an open device.
    ///
    /// Every frame read is sent to the queue and passed to the callback, if
    /// given. Polling an endpoint twice does nothing.
    pub fn start_interrupt_read_polling(
        &self,
        record: &Arc<DeviceRecord>,
        endpoint: u8,
        length: usize,
        queue: Option<flume::Sender<Vec<u8>>>,
        callback: Option<FrameCallback>,
    ) -> Result<(), TransportError> {
        self.trace.in_scope(|| {
            let handle = record.handle()?;
            let mut tasks = record.tasks.lock();
            if tasks.contains_key(&endpoint) {
                debug!(endpoint, "endpoint already polled");
                return Ok(());
            }

            let lost = Arc::downgrade(record);
            let task = PollingTask::interrupt_reader(
                &self.pool,
                format!("poll-{:02x}", endpoint),
                self.trace.clone(),
                InterruptReader {
                    handle,
                    endpoint,
                    length,
                    timeout: self.config.usb_timeout(),
                    queue,
                    callback,
                    on_lost: Box::new(move || {
                        if let Some(record) = lost.upgrade() {
                            record.mark_lost();
                        }
                    }),
                },
            )?;

            tasks.insert(endpoint, task);
            Ok(())
        })
    }

    /// Stops one or all pollers of a device.
    ///
    /// All affected pollers are signalled before the first one is joined, so
    /// stopping many of them takes about one USB timeout. Pollers not ending
    /// in time are leaked.
    pub fn stop_interrupt_read_polling(&self, record: &DeviceRecord, endpoint: Option<u8>) {
        self.trace.in_scope(|| {
            let stopping = {
                let mut tasks = record.tasks.lock();
                match endpoint {
                    Some(endpoint) => tasks.remove(&endpoint).into_iter().collect::<Vec<_>>(),
                    None => tasks.drain().map(|(_, task)| task).collect(),
                }
            };

            for task in &stopping {
                task.signal_stop();
            }

            let deadline = Instant::now() + self.stop_timeout();
            for task in stopping {
                let name = task.name().to_string();
                match task.join_until(deadline) {
                    Some(TaskExit::Lost) => debug!(task = %name, "poller had already lost its device"),
                    Some(TaskExit::Stopped) => {},
                    None => warn!(task = %name, "poller leaked"),
                }
            }
        })
    }

    fn stop_timeout(&self) -> Duration {
        self.config.usb_timeout().mul_f64(STOP_GRACE_FACTOR)
    }
}

impl HotplugSink for UsbContext {
    fn device_arrived(&self, info: UsbDeviceInfo) {
        self.trace.in_scope(|| {
            let mut devices = self.devices.lock();
            match devices.iter().find(|record| record.matches(&info)) {
                Some(record) => record.mark_arrived(info),
                None => {
                    let record = Arc::new(DeviceRecord::new(info, Arc::clone(&self.events)));
                    info!(reader_name = record.reader_name(), "device arrived");
                    self.events.emit(DeviceEvent::Arrived(record.reader_name().to_string()));
                    devices.push(record);
                },
            }
        })
    }

    fn device_left(&self, info: UsbDeviceInfo) {
        self.trace.in_scope(|| {
            let record = self
                .devices
                .lock()
                .iter()
                .find(|record| record.matches(&info))
                .cloned();

            if let Some(record) = record {
                record.emit(DeviceEvent::Left(record.reader_name().to_string()));
                record.mark_lost();
            }
        })
    }
}

impl Drop for UsbContext {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("could not close USB context: {err}");
        }
    }
}
