//! Device records owned by the transport context.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::{info, warn};

use super::{
    TransportError,
    backend::{UsbDeviceInfo, UsbHandle},
    polling::PollingTask,
};
use crate::event::EventEmitter;

/// The lifecycle state of a device record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
pub enum DeviceState {
    Unknown,
    Detected,
    Opening,
    Open,
    Closing,
    Lost,
}

/// An event concerning a device known to the transport context. Every variant
/// carries the reader name of the device.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum DeviceEvent {
    Arrived(String),
    Left(String),
    Lost(String),
    Opened(String),
    Closed(String),
}

#[derive(Default)]
pub(crate) struct DeviceInner {
    pub handle: Option<Arc<dyn UsbHandle>>,
    pub claimed: Vec<u8>,
    pub detached: Vec<u8>,
}

/// A USB device known to the transport context.
///
/// The native handle is present exactly while the device is open, and
/// endpoint tasks only run while it is.
pub struct DeviceRecord {
    reader_name: String,
    info: Mutex<UsbDeviceInfo>,
    connected: AtomicBool,
    state: Mutex<DeviceState>,
    pub(crate) open_close: Mutex<()>,
    pub(crate) inner: Mutex<DeviceInner>,
    pub(crate) tasks: Mutex<HashMap<u8, PollingTask>>,
    events: Arc<EventEmitter<DeviceEvent>>,
}

impl DeviceRecord {
    pub(crate) fn new(info: UsbDeviceInfo, events: Arc<EventEmitter<DeviceEvent>>) -> Self {
        Self {
            reader_name: info.reader_name(),
            info: Mutex::new(info),
            connected: AtomicBool::new(true),
            state: Mutex::new(DeviceState::Detected),
            open_close: Mutex::new(()),
            inner: Mutex::new(DeviceInner::default()),
            tasks: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn reader_name(&self) -> &str {
        &self.reader_name
    }

    pub fn info(&self) -> UsbDeviceInfo {
        self.info.lock().clone()
    }

    pub fn vendor_id(&self) -> u16 {
        self.info.lock().vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.info.lock().product_id
    }

    pub fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: DeviceState) {
        *self.state.lock() = state;
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().handle.is_some()
    }

    /// The endpoints currently being polled.
    pub fn polled_endpoints(&self) -> Vec<u8> {
        let mut endpoints = self.tasks.lock().keys().copied().collect::<Vec<_>>();
        endpoints.sort_unstable();
        endpoints
    }

    /// Returns the native handle of a connected, open device.
    pub(crate) fn handle(&self) -> Result<Arc<dyn UsbHandle>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::DeviceNotConnected);
        }

        self.inner
            .lock()
            .handle
            .clone()
            .ok_or(TransportError::DeviceNotOpen)
    }

    /// Whether a description denotes this record's device.
    pub(crate) fn matches(&self, info: &UsbDeviceInfo) -> bool {
        self.info.lock().same_device(info)
    }

    /// Records the loss of the device, drops its native handle and tears
    /// down its endpoint tasks.
    ///
    /// The interfaces of a lost device cannot be released, so the handle is
    /// dropped as is. Runs on hot-plug and poller threads, so the task map is
    /// only taken if it is free. A holder of the task map is stopping the
    /// tasks anyway.
    pub(crate) fn mark_lost(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        self.set_state(DeviceState::Lost);
        drop(std::mem::take(&mut *self.inner.lock()));

        match self.tasks.try_lock() {
            Some(mut tasks) => {
                for (_, task) in tasks.drain() {
                    task.signal_stop();
                }
            },
            None => warn!(
                reader_name = %self.reader_name,
                "endpoint tasks are busy, leaving their teardown to the holder"
            ),
        }

        info!(reader_name = %self.reader_name, "device lost");
        self.events.emit(DeviceEvent::Lost(self.reader_name.clone()));
    }

    /// Records the (re)appearance of the device.
    pub(crate) fn mark_arrived(&self, info: UsbDeviceInfo) {
        *self.info.lock() = info;

        if self.connected.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let mut state = self.state.lock();
            if *state == DeviceState::Lost {
                *state = DeviceState::Detected;
            }
        }

        info!(reader_name = %self.reader_name, "device arrived");
        self.events.emit(DeviceEvent::Arrived(self.reader_name.clone()));
    }

    pub(crate) fn emit(&self, event: DeviceEvent) {
        self.events.emit(event);
    }
}

impl fmt::Debug for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRecord")
            .field("reader_name", &self.reader_name)
            .field("connected", &self.is_connected())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
