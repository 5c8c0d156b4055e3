//! Implements HID++ messaging across a USB device.
//!
//! A [`UsbChannel`] joins a device record of the [`UsbContext`] with a
//! [`Dispatcher`]. Opening it claims the device and starts polling every
//! interrupt IN endpoint into the dispatcher. Requests are matched to their
//! responses by software ID.

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::{Mutex, ReentrantMutex};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    dispatcher::{Dispatcher, DispatcherConfig, FeatureEntry, FeatureSlot, InboundFrame, QueueName},
    feature::{
        CreatableFeature, FeatureError,
        feature_set::FeatureSetFeature,
        root::{self, RootFeature},
    },
    protocol::HidppError,
    report::{self, MAX_REPORT_DESCRIPTOR_LENGTH, ReportKind},
    schema::{CodecError, Message, Request, Schema, TypedMessage},
    transport::{
        OUTPUT_REPORT_TYPE, REPORT_DESCRIPTOR_TYPE, REQUEST_GET_DESCRIPTOR, REQUEST_SET_REPORT,
        REQUEST_TYPE_CLASS_INTERFACE_OUT, REQUEST_TYPE_INTERFACE_IN, TransportError, UsbContext,
        backend::{InterfaceInfo, InterfaceKind},
        device::DeviceRecord,
    },
};

/// The device index of directly connected devices.
pub const DIRECT_DEVICE_INDEX: u8 = 0xff;

/// The HID++ interface of an open device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
pub struct HidppInterface {
    pub number: u8,
    pub out_endpoint: Option<u8>,
    pub supports_short: bool,
    pub supports_long: bool,
}

impl HidppInterface {
    fn supports(&self, kind: ReportKind) -> bool {
        match kind {
            ReportKind::Short => self.supports_short,
            ReportKind::Long => self.supports_long,
        }
    }
}

/// A HID++ channel to one device index behind a USB device.
pub struct UsbChannel {
    context: Arc<UsbContext>,
    record: Weak<DeviceRecord>,
    reader_name: String,
    device_index: u8,
    dispatcher: Arc<Dispatcher>,
    interface: Mutex<Option<HidppInterface>>,
    is_open: AtomicBool,
    open_close: ReentrantMutex<()>,
    timeout: Duration,
}

impl UsbChannel {
    /// Creates a closed channel to a device.
    pub fn new(context: Arc<UsbContext>, record: &Arc<DeviceRecord>, device_index: u8) -> Arc<Self> {
        let config = DispatcherConfig {
            queue_capacity: context.config().queue_capacity,
            ..Default::default()
        };
        Self::with_dispatcher(context, record, device_index, config)
    }

    /// Creates a closed channel routing responses according to a custom
    /// dispatcher configuration.
    pub fn with_dispatcher(
        context: Arc<UsbContext>,
        record: &Arc<DeviceRecord>,
        device_index: u8,
        config: DispatcherConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            timeout: context.config().usb_timeout(),
            context,
            record: Arc::downgrade(record),
            reader_name: record.reader_name().to_string(),
            device_index,
            dispatcher: Arc::new(Dispatcher::new(config)),
            interface: Mutex::new(None),
            is_open: AtomicBool::new(false),
            open_close: ReentrantMutex::new(()),
        })
    }

    pub fn device_index(&self) -> u8 {
        self.device_index
    }

    pub fn reader_name(&self) -> &str {
        &self.reader_name
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Acquire)
    }

    /// The HID++ interface found when opening the channel.
    pub fn interface(&self) -> Option<HidppInterface> {
        *self.interface.lock()
    }

    /// Re-validates the device record the channel was created for.
    pub fn record(&self) -> Result<Arc<DeviceRecord>, ChannelError> {
        let record = self
            .record
            .upgrade()
            .or_else(|| self.context.find_device(&self.reader_name))
            .ok_or(ChannelError::DeviceNotConnected)?;

        if !record.is_connected() {
            return Err(ChannelError::DeviceNotConnected);
        }
        Ok(record)
    }

    /// Opens the device and starts polling all of its interrupt IN endpoints.
    ///
    /// A channel whose device was lost while open is closed and opened again.
    pub fn open(&self) -> Result<(), ChannelError> {
        self.context.trace().in_scope(|| {
            let _guard = self.open_close.lock();
            if self.is_open() {
                if self.record.upgrade().is_some_and(|record| record.is_open()) {
                    debug!(reader_name = %self.reader_name, "channel already open");
                    return Ok(());
                }
                debug!(reader_name = %self.reader_name, "reopening channel after device loss");
                self.close()?;
            }

            let record = self.record()?;
            self.context.open()?;
            self.context.open_device(&record)?;

            if let Err(err) = self.start(&record) {
                if let Err(close_err) = self.context.close_device(&record) {
                    warn!("could not close device after failed open: {close_err}");
                }
                return Err(err);
            }

            self.is_open.store(true, Ordering::Release);
            info!(reader_name = %self.reader_name, device_index = self.device_index, "channel open");
            Ok(())
        })
    }

    fn start(&self, record: &Arc<DeviceRecord>) -> Result<(), ChannelError> {
        let info = record.info();

        let interface = info
            .interfaces
            .iter()
            .find_map(|interface| self.detect_hidpp(record, interface))
            .ok_or(ChannelError::NoHidppInterface)?;
        debug!(?interface, "found HID++ interface");
        *self.interface.lock() = Some(interface);

        let callback = self.dispatcher.callback();
        for interface in &info.interfaces {
            for endpoint in interface.in_endpoints() {
                self.context.start_interrupt_read_polling(
                    record,
                    endpoint.address,
                    usize::from(endpoint.max_packet_size).max(report::LONG_REPORT_LENGTH),
                    None,
                    Some(Arc::clone(&callback)),
                )?;
            }
        }

        Ok(())
    }

    /// Checks whether an interface carries HID++ reports, preferring its
    /// report descriptor over its interface protocol.
    fn detect_hidpp(&self, record: &DeviceRecord, interface: &InterfaceInfo) -> Option<HidppInterface> {
        let descriptor = self.context.control_read(
            record,
            REQUEST_TYPE_INTERFACE_IN,
            REQUEST_GET_DESCRIPTOR,
            REPORT_DESCRIPTOR_TYPE,
            u16::from(interface.number),
            MAX_REPORT_DESCRIPTOR_LENGTH,
        );

        let (supports_short, supports_long) = match descriptor.map(|raw| report::supports_short_long_hidpp(&raw)) {
            Ok(Ok(supported)) => supported,
            Ok(Err(err)) => {
                debug!(interface = interface.number, "unparsable report descriptor: {err:?}");
                let hidpp = interface.kind() == InterfaceKind::Hidpp;
                (hidpp, hidpp)
            },
            Err(err) => {
                debug!(interface = interface.number, "could not read report descriptor: {err}");
                let hidpp = interface.kind() == InterfaceKind::Hidpp;
                (hidpp, hidpp)
            },
        };

        (supports_short || supports_long).then(|| HidppInterface {
            number: interface.number,
            out_endpoint: interface.out_endpoint().map(|ep| ep.address),
            supports_short,
            supports_long,
        })
    }

    /// Stops polling, releases the device and drains every queue.
    ///
    /// Closing a closed channel does nothing.
    pub fn close(&self) -> Result<(), ChannelError> {
        self.context.trace().in_scope(|| {
            let _guard = self.open_close.lock();
            if !self.is_open() {
                debug!(reader_name = %self.reader_name, "channel already closed");
                return Ok(());
            }

            if let Some(record) = self.record.upgrade() {
                if let Err(err) = self.context.close_device(&record) {
                    warn!(reader_name = %self.reader_name, "could not close device: {err}");
                }
            }

            for (queue, frame) in self.dispatcher.clear_all_queues() {
                warn!(%queue, frame = ?frame.data, "untreated message");
            }
            self.interface.lock().take();

            self.is_open.store(false, Ordering::Release);
            info!(reader_name = %self.reader_name, "channel closed");
            Ok(())
        })
    }

    /// Writes a raw HID++ report to the device.
    pub fn write_report(&self, data: &[u8]) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::ChannelClosed);
        }
        let record = self.record()?;
        let interface = self.interface().ok_or(ChannelError::ChannelClosed)?;

        let report_id = data.first().copied().unwrap_or_default();
        let kind = ReportKind::from_id(report_id).ok_or_else(|| {
            ChannelError::WrongParameter(format!("{report_id:#04x} is no HID++ report ID"))
        })?;
        if data.len() != kind.size() {
            return Err(ChannelError::WrongParameter(format!(
                "report {report_id:#04x} must be {} bytes long, not {}",
                kind.size(),
                data.len()
            )));
        }
        if !interface.supports(kind) {
            return Err(ChannelError::MessageTypeNotSupported);
        }

        let written = match interface.out_endpoint {
            Some(endpoint) => self.context.interrupt_write(&record, endpoint, data)?,
            None => self.context.control_write(
                &record,
                REQUEST_TYPE_CLASS_INTERFACE_OUT,
                REQUEST_SET_REPORT,
                OUTPUT_REPORT_TYPE | u16::from(report_id),
                u16::from(interface.number),
                data,
            )?,
        };

        if written != data.len() {
            return Err(ChannelError::IncompleteWrite {
                written,
                expected: data.len(),
            });
        }
        Ok(())
    }

    /// Sends a message and waits for its response.
    ///
    /// A fresh software ID is written into the message header. Error replies
    /// matching the request resolve into [`ChannelError::Hidpp`].
    pub fn send_message(
        &self,
        mut msg: Message,
        response: &'static Schema,
        timeout: Option<Duration>,
    ) -> Result<Message, ChannelError> {
        self.context.trace().in_scope(|| {
            let feature_id = msg.schema().feature_id;
            let mut header = msg.header();

            if self.dispatcher.feature_slot(header.device_index, feature_id) == Some(FeatureSlot::Unsupported) {
                return Err(ChannelError::FeatureNotSupported(feature_id));
            }
            if !self.is_open() {
                return Err(ChannelError::ChannelClosed);
            }
            self.record()?;

            if self.dispatcher.feature_at(header.device_index, header.feature_index).is_none() {
                let version = msg.schema().versions.first().copied().unwrap_or_default();
                self.dispatcher
                    .register_feature(header.device_index, header.feature_index, feature_id, version);
            }

            let pending = self
                .dispatcher
                .begin_request(&mut header)
                .ok_or(ChannelError::NoFreeSoftwareId)?;
            msg.set_header(&header);

            debug!(request = %msg, "sending request");
            self.write_report(msg.as_bytes())?;

            let (queue, frame) = self
                .dispatcher
                .get_first(
                    &[self.dispatcher.queue_for(feature_id), QueueName::Error],
                    |frame| pending.matches(frame),
                    timeout.unwrap_or(self.timeout),
                )
                .ok_or(ChannelError::Timeout)?;

            if queue == QueueName::Error {
                return Err(error_reply(&frame.data));
            }

            let response = response.decode(&frame.data)?;
            debug!(%response, "received response");
            Ok(response)
        })
    }

    /// Sends a typed request and waits for its typed response.
    pub fn send<R: Request>(&self, request: R) -> Result<R::Response, ChannelError> {
        let response = self.send_message(request.to_message()?, R::Response::schema(), None)?;
        Ok(R::Response::from_message(&response)?)
    }

    /// Waits for the next event of a type sent by a device index.
    pub fn wait_event<E: TypedMessage>(&self, device_index: u8, timeout: Duration) -> Result<E, ChannelError> {
        let schema = E::schema();
        let is_event = |frame: &InboundFrame| {
            frame.feature_id == Some(schema.feature_id)
                && frame.header().is_some_and(|header| {
                    header.device_index == device_index && header.function_index.to_lo() == schema.index
                })
        };

        let (_, frame) = self
            .dispatcher
            .get_first(&[QueueName::Event], is_event, timeout)
            .ok_or(ChannelError::Timeout)?;
        Ok(E::decode(&frame.data)?)
    }

    /// Looks up the index and version of a feature, asking the Root feature
    /// once per feature.
    pub fn resolve_feature(self: &Arc<Self>, feature_id: u16) -> Result<FeatureEntry, ChannelError> {
        match self.dispatcher.feature_slot(self.device_index, feature_id) {
            Some(FeatureSlot::Supported { version, .. }) => {
                return Ok(FeatureEntry {
                    feature_id,
                    version,
                });
            },
            Some(FeatureSlot::Unsupported) => return Err(ChannelError::FeatureNotSupported(feature_id)),
            None => {},
        }

        match self.root().get_feature(feature_id)? {
            Some(info) => {
                self.dispatcher
                    .register_feature(self.device_index, info.index, feature_id, info.version);
                Ok(FeatureEntry {
                    feature_id,
                    version: info.version,
                })
            },
            None => {
                self.dispatcher.register_unsupported(self.device_index, feature_id);
                Err(ChannelError::FeatureNotSupported(feature_id))
            },
        }
    }

    /// Creates a typed feature implementation, resolving its index first.
    pub fn feature<F: CreatableFeature>(self: &Arc<Self>) -> Result<F, ChannelError> {
        let entry = self.resolve_feature(F::ID)?;
        if entry.version < F::STARTING_VERSION {
            return Err(FeatureError::UnsupportedVersion {
                feature_id: F::ID,
                version: entry.version,
            }
            .into());
        }

        match self.dispatcher.feature_slot(self.device_index, F::ID) {
            Some(FeatureSlot::Supported { index, .. }) => Ok(F::new(Arc::clone(self), self.device_index, index)),
            _ => Err(ChannelError::FeatureNotSupported(F::ID)),
        }
    }

    /// The Root feature of the device.
    pub fn root(self: &Arc<Self>) -> RootFeature {
        RootFeature::new(Arc::clone(self), self.device_index, root::FEATURE_INDEX)
    }

    /// Reads the whole feature table of the device through the FeatureSet
    /// feature and registers every entry.
    pub fn enumerate_features(self: &Arc<Self>) -> Result<Vec<(u8, FeatureEntry)>, ChannelError> {
        let version = self.resolve_feature(FeatureSetFeature::ID)?.version;
        let feature_set = self.feature::<FeatureSetFeature>()?.with_version(version);

        let count = feature_set.count()?;
        for index in 1..=count {
            let info = feature_set.get_feature(index)?;
            self.dispatcher
                .register_feature(self.device_index, index, info.id, info.version);
        }

        Ok(self.dispatcher.features(self.device_index))
    }
}

/// Turns a frame from the error queue into the error it reports.
fn error_reply(data: &[u8]) -> ChannelError {
    match HidppError::from_frame(data) {
        Some(err) => ChannelError::Hidpp(err),
        None => ChannelError::MalformedErrorReply(data.to_vec()),
    }
}

impl Drop for UsbChannel {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(reader_name = %self.reader_name, "could not close channel: {err}");
        }
    }
}

/// Represents an error that occurred when communicating across a
/// [`UsbChannel`].
#[derive(Debug, Error)]
pub enum ChannelError {
    /// No response arrived in time.
    #[error("the device did not respond in time")]
    Timeout,

    /// The device answered with an error reply.
    #[error("{0}")]
    Hidpp(HidppError),

    #[error("the channel is closed")]
    ChannelClosed,

    /// The device reported the feature as not supported.
    #[error("the device does not support feature {0:#06x}")]
    FeatureNotSupported(u16),

    #[error("the device is not connected")]
    DeviceNotConnected,

    #[error("the device has no HID++ interface")]
    NoHidppInterface,

    /// Indicates that the HID++ interface does not support messages of the
    /// given type (short/long).
    #[error("the interface does not support the given HID++ message type")]
    MessageTypeNotSupported,

    #[error("wrong parameter: {0}")]
    WrongParameter(String),

    #[error("only {written} of {expected} bytes were written")]
    IncompleteWrite { written: usize, expected: usize },

    /// An error reply matched the request but could not be decoded.
    #[error("malformed error reply {0:02x?}")]
    MalformedErrorReply(Vec<u8>),

    /// All software IDs are taken by pending requests for the feature.
    #[error("no free software ID")]
    NoFreeSoftwareId,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Feature(#[from] FeatureError),

    #[error("USB transport error")]
    Transport(#[source] TransportError),
}

impl From<TransportError> for ChannelError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NoDevice | TransportError::DeviceNotConnected => Self::DeviceNotConnected,
            TransportError::Timeout => Self::Timeout,
            other => Self::Transport(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::TransportConfig,
        feature::feature_set,
        transport::virtual_device::{VirtualBackend, VirtualDevice},
    };

    const FEATURES: &[(u16, u8)] = &[(root::FEATURE_ID, 2), (feature_set::FEATURE_ID, 2), (0x9209, 0)];

    fn open_channel() -> (Arc<UsbChannel>, Arc<VirtualDevice>) {
        let backend = Arc::new(VirtualBackend::new());
        let device = backend.add_device(VirtualDevice::logitech(1, 3, 0xc094));
        device.set_responder(|request| VirtualDevice::answer_discovery(FEATURES, request).into_iter().collect());

        let config = TransportConfig {
            usb_timeout_ms: 200,
            ..Default::default()
        };
        let context = UsbContext::new(config, backend).unwrap();
        context.open().unwrap();
        let record = context.select_device().unwrap();

        let channel = UsbChannel::new(context, &record, 0x01);
        channel.open().unwrap();
        (channel, device)
    }

    #[test]
    fn open_finds_hidpp_interface() {
        let (channel, device) = open_channel();

        assert_eq!(
            channel.interface(),
            Some(HidppInterface {
                number: 2,
                out_endpoint: None,
                supports_short: true,
                supports_long: true,
            })
        );
        assert_eq!(device.claimed_interfaces(), [0, 1, 2]);
        assert_eq!(channel.record().unwrap().polled_endpoints(), [0x81, 0x82, 0x83]);

        channel.close().unwrap();
        channel.close().unwrap();
        assert!(device.claimed_interfaces().is_empty());
    }

    #[test]
    fn ping_echoes_data() {
        let (channel, device) = open_channel();

        assert_eq!(channel.root().ping(0x5a).unwrap(), 0x5a);

        let written = device.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0][..3], [0x10, 0x01, 0x00]);
        assert_eq!(written[0][3] >> 4, 1);
        assert_ne!(written[0][3] & 0x0f, 0);
    }

    #[test]
    fn features_are_resolved_once() {
        let (channel, device) = open_channel();

        let entry = channel.resolve_feature(0x9209).unwrap();
        assert_eq!(entry, FeatureEntry {
            feature_id: 0x9209,
            version: 0,
        });
        channel.resolve_feature(0x9209).unwrap();
        assert_eq!(device.written().len(), 1);

        assert!(matches!(
            channel.resolve_feature(0x1b04),
            Err(ChannelError::FeatureNotSupported(0x1b04))
        ));
        assert!(matches!(
            channel.resolve_feature(0x1b04),
            Err(ChannelError::FeatureNotSupported(0x1b04))
        ));
        assert_eq!(device.written().len(), 2);
    }

    #[test]
    fn enumerates_feature_table() {
        let (channel, _device) = open_channel();

        let features = channel.enumerate_features().unwrap();
        let ids = features
            .iter()
            .map(|(index, entry)| (*index, entry.feature_id))
            .collect::<Vec<_>>();
        assert_eq!(ids, [(1, feature_set::FEATURE_ID), (2, 0x9209)]);
    }

    #[test]
    fn error_reply_resolves_request() {
        let (channel, _device) = open_channel();
        channel.dispatcher().register_feature(0x01, 0x07, 0x9209, 0);

        let request = crate::feature::mlx90393_multi_sensor::ReadSensorRegister::new(0x01, 0x07, 0x02, 0x0a);
        let err = channel.send(request).unwrap_err();
        let ChannelError::Hidpp(err) = err else {
            panic!("expected an error reply, got {err:?}");
        };
        assert_eq!(err.sub_id, 0x07);
        assert_eq!(err.v20_error(), Some(crate::protocol::v20::ErrorType::InvalidFeatureIndex));
    }

    #[test]
    fn malformed_error_replies_are_no_timeouts() {
        assert!(matches!(
            error_reply(&[0x11, 0x01, 0xff, 0x07]),
            ChannelError::MalformedErrorReply(data) if data == [0x11, 0x01, 0xff, 0x07]
        ));

        let mut frame = [0u8; 20];
        frame[..6].copy_from_slice(&[0x11, 0x01, 0xff, 0x07, 0x03, 0x02]);
        assert!(matches!(error_reply(&frame), ChannelError::Hidpp(err) if err.sub_id == 0x07));
    }

    #[test]
    fn write_validates_reports() {
        let (channel, device) = open_channel();

        assert!(matches!(
            channel.write_report(&[0x10, 0x01, 0x00]),
            Err(ChannelError::WrongParameter(_))
        ));
        assert!(matches!(
            channel.write_report(&[0x20; 7]),
            Err(ChannelError::WrongParameter(_))
        ));
        assert!(device.written().is_empty());

        channel.close().unwrap();
        assert!(matches!(
            channel.write_report(&[0x10, 0x01, 0x00, 0x10, 0, 0, 0]),
            Err(ChannelError::ChannelClosed)
        ));
    }
}
