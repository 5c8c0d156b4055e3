//! Classifies inbound frames and delivers each of them to exactly one named
//! queue.
//!
//! Frames are classified in this order:
//!
//! 1. Plain HID reports go to [`QueueName::Hid`].
//! 2. HID++ error replies go to [`QueueName::Error`]. HID++1.0 error replies
//!    sent with the receiver index go to [`QueueName::ReceiverError`] unless
//!    they fail a pending request.
//! 3. Frames addressing a feature index that is not in the feature index map
//!    are HID++1.0 receiver traffic when sent with the receiver index, and
//!    unclassified errors otherwise.
//! 4. A software ID of `0` marks an event.
//! 5. Everything else is a response that has to match a pending request by
//!    device index, feature index and software ID. Matched responses go to
//!    the queue owning the feature, unmatched ones are dropped.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::{
    nibble::U4,
    protocol::{HidppError, v10, v20},
    report::{MessageHeader, is_hidpp_report},
};

/// The device index HID++ receivers answer with.
pub const RECEIVER_INDEX: u8 = 0xff;

/// The queues inbound frames are delivered to.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum QueueName {
    Common,
    Important,
    Mouse,
    Keyboard,
    Touchpad,
    Gaming,
    Peripheral,
    Event,
    Hid,
    ReceiverResponse,
    ReceiverError,
    ReceiverEvent,
    Error,
}

impl QueueName {
    pub const ALL: [QueueName; 13] = [
        Self::Common,
        Self::Important,
        Self::Mouse,
        Self::Keyboard,
        Self::Touchpad,
        Self::Gaming,
        Self::Peripheral,
        Self::Event,
        Self::Hid,
        Self::ReceiverResponse,
        Self::ReceiverError,
        Self::ReceiverEvent,
        Self::Error,
    ];

    /// The queue owning the responses of a feature, derived from the
    /// category encoded in the high nibble of its ID.
    pub fn for_feature(feature_id: u16) -> Self {
        match feature_id {
            0x0000 | 0x0001 => Self::Important,
            0x0000..=0x1fff => Self::Common,
            0x2000..=0x2fff => Self::Mouse,
            0x4000..=0x4fff => Self::Keyboard,
            0x6000..=0x6fff => Self::Touchpad,
            0x8000..=0x8fff => Self::Gaming,
            0x9000..=0x9fff => Self::Peripheral,
            _ => Self::Common,
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Common => "COMMON",
            Self::Important => "IMPORTANT",
            Self::Mouse => "MOUSE",
            Self::Keyboard => "KEYBOARD",
            Self::Touchpad => "TOUCHPAD",
            Self::Gaming => "GAMING",
            Self::Peripheral => "PERIPHERAL",
            Self::Event => "EVENT",
            Self::Hid => "HID",
            Self::ReceiverResponse => "RECEIVER_RESPONSE",
            Self::ReceiverError => "RECEIVER_ERROR",
            Self::ReceiverEvent => "RECEIVER_EVENT",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Construction parameters of a [`Dispatcher`].
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// The maximum amount of frames a queue holds. When a queue is full the
    /// oldest frame is dropped.
    pub queue_capacity: usize,

    /// Routes the responses of specific features to another queue than the
    /// one of their category.
    pub overrides: HashMap<u16, QueueName>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            overrides: HashMap::new(),
        }
    }
}

/// A frame waiting in one of the queues.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct InboundFrame {
    /// The raw report, including its report ID.
    pub data: Vec<u8>,

    /// The feature the frame belongs to, if it could be resolved.
    pub feature_id: Option<u16>,

    /// When the frame was dispatched.
    pub received_at: Instant,
}

impl InboundFrame {
    pub fn header(&self) -> Option<MessageHeader> {
        MessageHeader::read(&self.data)
    }
}

/// The feature registered at an index of a device's feature table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FeatureEntry {
    pub feature_id: u16,
    pub version: u8,
}

/// What is known about a feature ID on a device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum FeatureSlot {
    /// The feature lives at the index with the version.
    Supported { index: u8, version: u8 },

    /// The device reported the feature as not supported.
    Unsupported,
}

#[derive(Debug, Default)]
struct FeatureIndexMap {
    by_index: HashMap<(u8, u8), FeatureEntry>,
    by_id: HashMap<(u8, u16), FeatureSlot>,
}

type PendingKey = (u8, u8, U4);

/// Routes inbound frames of one channel into named queues.
#[derive(Debug)]
pub struct Dispatcher {
    config: DispatcherConfig,
    queues: Mutex<HashMap<QueueName, VecDeque<InboundFrame>>>,
    available: Condvar,
    features: RwLock<FeatureIndexMap>,
    pending: Mutex<HashMap<PendingKey, U4>>,
    last_sw_id: Mutex<U4>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let queues = QueueName::ALL
            .iter()
            .map(|&name| (name, VecDeque::new()))
            .collect();

        Self {
            config,
            queues: Mutex::new(queues),
            available: Condvar::new(),
            features: RwLock::new(FeatureIndexMap::default()),
            pending: Mutex::new(HashMap::new()),
            last_sw_id: Mutex::new(U4::from_lo(rand::random_range(0..0x0f))),
        }
    }

    /// The queue owning the responses of a feature, honoring the configured
    /// overrides.
    pub fn queue_for(&self, feature_id: u16) -> QueueName {
        self.config
            .overrides
            .get(&feature_id)
            .copied()
            .unwrap_or_else(|| QueueName::for_feature(feature_id))
    }

    /// Records the index and version of a feature on a device.
    pub fn register_feature(&self, device_index: u8, feature_index: u8, feature_id: u16, version: u8) {
        let mut features = self.features.write();
        features.by_index.insert((device_index, feature_index), FeatureEntry {
            feature_id,
            version,
        });
        features.by_id.insert(
            (device_index, feature_id),
            FeatureSlot::Supported {
                index: feature_index,
                version,
            },
        );
    }

    /// Records that a device does not support a feature.
    pub fn register_unsupported(&self, device_index: u8, feature_id: u16) {
        self.features
            .write()
            .by_id
            .insert((device_index, feature_id), FeatureSlot::Unsupported);
    }

    /// Looks up what is known about a feature ID on a device.
    ///
    /// The Root feature is always known at index `0`.
    pub fn feature_slot(&self, device_index: u8, feature_id: u16) -> Option<FeatureSlot> {
        let features = self.features.read();
        features
            .by_id
            .get(&(device_index, feature_id))
            .copied()
            .or_else(|| {
                (feature_id == crate::feature::root::FEATURE_ID).then_some(FeatureSlot::Supported {
                    index: crate::feature::root::FEATURE_INDEX,
                    version: 0,
                })
            })
    }

    /// Looks up the feature living at an index of a device.
    pub fn feature_at(&self, device_index: u8, feature_index: u8) -> Option<FeatureEntry> {
        let features = self.features.read();
        features
            .by_index
            .get(&(device_index, feature_index))
            .copied()
            .or_else(|| {
                (feature_index == crate::feature::root::FEATURE_INDEX).then_some(FeatureEntry {
                    feature_id: crate::feature::root::FEATURE_ID,
                    version: 0,
                })
            })
    }

    /// All features registered for a device, ordered by index.
    pub fn features(&self, device_index: u8) -> Vec<(u8, FeatureEntry)> {
        let features = self.features.read();
        let mut entries = features
            .by_index
            .iter()
            .filter(|((dev, _), _)| *dev == device_index)
            .map(|(&(_, index), &entry)| (index, entry))
            .collect::<Vec<_>>();
        entries.sort_by_key(|(index, _)| *index);
        entries
    }

    /// Forgets the feature table of every device.
    pub fn clear_features(&self) {
        let mut features = self.features.write();
        features.by_index.clear();
        features.by_id.clear();
    }

    /// Allocates a software ID for a request and registers it as pending.
    ///
    /// Software IDs rotate through `1..=15`, skipping the ones still pending
    /// for the same device and feature. Returns [`None`] if all of them are.
    pub fn begin_request(&self, header: &mut MessageHeader) -> Option<PendingRequest<'_>> {
        let mut pending = self.pending.lock();
        let mut last = self.last_sw_id.lock();

        for _ in 0..0x0f {
            let candidate = U4::from_lo(last.to_lo() % 0x0f + 1);
            *last = candidate;

            let key = (header.device_index, header.feature_index, candidate);
            if pending.contains_key(&key) {
                continue;
            }

            pending.insert(key, header.function_index);
            header.software_id = candidate;
            return Some(PendingRequest {
                dispatcher: self,
                key,
            });
        }

        None
    }

    /// The amount of requests waiting for their response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Classifies a frame and pushes it to its queue.
    ///
    /// Returns the queue the frame was delivered to, or [`None`] if it was
    /// dropped.
    pub fn dispatch(&self, data: &[u8]) -> Option<QueueName> {
        let (queue, feature_id) = self.classify(data)?;

        trace!(%queue, frame = ?data, "dispatching frame");
        self.push(queue, InboundFrame {
            data: data.to_vec(),
            feature_id,
            received_at: Instant::now(),
        });

        Some(queue)
    }

    fn classify(&self, data: &[u8]) -> Option<(QueueName, Option<u16>)> {
        if !is_hidpp_report(data) {
            return Some((QueueName::Hid, None));
        }

        let Some(header) = MessageHeader::read(data) else {
            warn!(frame = ?data, "dropping truncated HID++ frame");
            return None;
        };

        if header.feature_index == v20::ERROR_MARKER {
            return Some((QueueName::Error, None));
        }
        if header.feature_index == v10::ERROR_MARKER {
            let queue = if header.device_index == RECEIVER_INDEX && !self.answers_pending(data) {
                QueueName::ReceiverError
            } else {
                QueueName::Error
            };
            return Some((queue, None));
        }

        let Some(entry) = self.feature_at(header.device_index, header.feature_index) else {
            if header.device_index == RECEIVER_INDEX {
                let queue = if v10::MessageType::is_register_access(header.feature_index) {
                    QueueName::ReceiverResponse
                } else {
                    QueueName::ReceiverEvent
                };
                return Some((queue, None));
            }

            warn!(
                device_index = header.device_index,
                feature_index = header.feature_index,
                "frame addresses an unknown feature index"
            );
            return Some((QueueName::Error, None));
        };

        let pending = self.pending.lock();

        if header.software_id == U4::from_lo(0) {
            let echoed = pending.iter().any(|(&(dev, feat, _), &function)| {
                dev == header.device_index
                    && feat == header.feature_index
                    && function == header.function_index
            });
            if echoed {
                warn!(
                    feature_id = entry.feature_id,
                    function_index = %header.function_index,
                    "device answered with a zero software ID, treating it as an event"
                );
            }
            return Some((QueueName::Event, Some(entry.feature_id)));
        }

        let key = (header.device_index, header.feature_index, header.software_id);
        if !pending.contains_key(&key) {
            warn!(
                feature_id = entry.feature_id,
                software_id = %header.software_id,
                frame = ?data,
                "dropping response without a pending request"
            );
            return None;
        }

        Some((self.queue_for(entry.feature_id), Some(entry.feature_id)))
    }

    /// Whether an error reply fails one of the pending requests.
    fn answers_pending(&self, data: &[u8]) -> bool {
        HidppError::from_frame(data).is_some_and(|err| {
            self.pending
                .lock()
                .contains_key(&(err.device_index, err.sub_id, err.software_id()))
        })
    }

    fn push(&self, queue: QueueName, frame: InboundFrame) {
        let mut queues = self.queues.lock();
        let entries = queues.entry(queue).or_default();

        if entries.len() >= self.config.queue_capacity {
            if let Some(dropped) = entries.pop_front() {
                warn!(%queue, frame = ?dropped.data, "queue is full, dropping the oldest frame");
            }
        }
        entries.push_back(frame);

        self.available.notify_all();
    }

    /// Removes and returns the first frame of the given queues matching the
    /// predicate, waiting up to `timeout` for one to arrive.
    ///
    /// Queues are searched in the given order.
    pub fn get_first(
        &self,
        queues: &[QueueName],
        predicate: impl Fn(&InboundFrame) -> bool,
        timeout: Duration,
    ) -> Option<(QueueName, InboundFrame)> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.queues.lock();

        loop {
            for &queue in queues {
                let Some(entries) = guard.get_mut(&queue) else {
                    continue;
                };

                if let Some(pos) = entries.iter().position(&predicate) {
                    return entries.remove(pos).map(|frame| (queue, frame));
                }
            }

            if self.available.wait_until(&mut guard, deadline).timed_out() {
                return None;
            }
        }
    }

    /// The amount of frames waiting in a queue.
    pub fn queue_len(&self, queue: QueueName) -> usize {
        self.queues.lock().get(&queue).map_or(0, VecDeque::len)
    }

    /// Empties every queue, returning the frames nobody consumed.
    pub fn clear_all_queues(&self) -> Vec<(QueueName, InboundFrame)> {
        let mut queues = self.queues.lock();
        let mut untreated = Vec::new();

        for queue in QueueName::ALL {
            if let Some(entries) = queues.get_mut(&queue) {
                untreated.extend(entries.drain(..).map(|frame| (queue, frame)));
            }
        }

        if !untreated.is_empty() {
            debug!(count = untreated.len(), "cleared untreated frames");
        }
        untreated
    }

    /// Creates the callback pollers feed their frames into.
    pub fn callback(self: &Arc<Self>) -> Arc<dyn Fn(&[u8]) + Send + Sync> {
        let dispatcher = Arc::clone(self);
        Arc::new(move |data: &[u8]| {
            dispatcher.dispatch(data);
        })
    }
}

/// A request waiting for its response. Dropping it unregisters the request,
/// so late responses are dropped by the dispatcher.
#[derive(Debug)]
pub struct PendingRequest<'a> {
    dispatcher: &'a Dispatcher,
    key: PendingKey,
}

impl PendingRequest<'_> {
    /// The software ID allocated for the request.
    pub fn software_id(&self) -> U4 {
        self.key.2
    }

    /// Whether a frame answers the request, either as response or as error
    /// reply.
    pub fn matches(&self, frame: &InboundFrame) -> bool {
        let Some(header) = frame.header() else {
            return false;
        };

        let (device_index, feature_index, software_id) = self.key;
        if matches!(header.feature_index, v20::ERROR_MARKER | v10::ERROR_MARKER) {
            return HidppError::from_frame(&frame.data).is_some_and(|err| {
                err.device_index == device_index
                    && err.sub_id == feature_index
                    && err.software_id() == software_id
            });
        }

        header.device_index == device_index
            && header.feature_index == feature_index
            && header.software_id == software_id
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.dispatcher.pending.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long(bytes: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; 20];
        frame[..bytes.len()].copy_from_slice(bytes);
        frame
    }

    fn dispatcher() -> Dispatcher {
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        dispatcher.register_feature(0x01, 0x07, 0x9209, 0);
        dispatcher
    }

    fn request(dispatcher: &Dispatcher) -> (MessageHeader, PendingRequest<'_>) {
        let mut header = MessageHeader {
            device_index: 0x01,
            feature_index: 0x07,
            function_index: U4::from_lo(0x0),
            software_id: U4::from_lo(0),
        };
        let pending = dispatcher.begin_request(&mut header).unwrap();
        (header, pending)
    }

    #[test]
    fn hid_reports_go_to_hid() {
        let dispatcher = dispatcher();

        assert_eq!(dispatcher.dispatch(&[0x02, 0x00, 0x05, 0x00]), Some(QueueName::Hid));
        assert_eq!(dispatcher.queue_len(QueueName::Hid), 1);
    }

    #[test]
    fn matched_response_goes_to_feature_queue() {
        let dispatcher = dispatcher();
        let (header, pending) = request(&dispatcher);

        let frame = long(&[0x11, 0x01, 0x07, header.function_and_sw_id(), 0x02]);
        assert_eq!(dispatcher.dispatch(&frame), Some(QueueName::Peripheral));

        let (queue, received) = dispatcher
            .get_first(&[QueueName::Peripheral], |f| pending.matches(f), Duration::ZERO)
            .unwrap();
        assert_eq!(queue, QueueName::Peripheral);
        assert_eq!(received.feature_id, Some(0x9209));
    }

    #[test]
    fn unmatched_response_is_dropped() {
        let dispatcher = dispatcher();

        assert_eq!(dispatcher.dispatch(&long(&[0x11, 0x01, 0x07, 0x05])), None);
        assert!(
            QueueName::ALL
                .iter()
                .all(|&queue| dispatcher.queue_len(queue) == 0)
        );
    }

    #[test]
    fn zero_software_id_is_an_event() {
        let dispatcher = dispatcher();

        assert_eq!(
            dispatcher.dispatch(&long(&[0x11, 0x01, 0x07, 0x00, 0x01])),
            Some(QueueName::Event)
        );
    }

    #[test]
    fn errors_and_receiver_traffic() {
        let dispatcher = dispatcher();

        assert_eq!(
            dispatcher.dispatch(&long(&[0x11, 0x01, 0xff, 0x07, 0x13, 0x02])),
            Some(QueueName::Error)
        );
        assert_eq!(
            dispatcher.dispatch(&long(&[0x11, 0xff, 0xff, 0x07, 0x13, 0x02])),
            Some(QueueName::Error)
        );
        assert_eq!(
            dispatcher.dispatch(&[0x10, 0xff, 0x8f, 0x81, 0x02, 0x02, 0x00]),
            Some(QueueName::ReceiverError)
        );
        assert_eq!(
            dispatcher.dispatch(&[0x10, 0xff, 0x81, 0x02, 0x00, 0x00, 0x00]),
            Some(QueueName::ReceiverResponse)
        );
        assert_eq!(
            dispatcher.dispatch(&[0x10, 0xff, 0x41, 0x04, 0x61, 0x40, 0x10]),
            Some(QueueName::ReceiverEvent)
        );
        assert_eq!(
            dispatcher.dispatch(&long(&[0x11, 0x01, 0x33, 0x01])),
            Some(QueueName::Error)
        );
    }

    #[test]
    fn v10_error_failing_a_request_is_an_error() {
        let dispatcher = dispatcher();
        let mut header = MessageHeader {
            device_index: RECEIVER_INDEX,
            feature_index: 0x00,
            function_index: U4::from_lo(0x1),
            software_id: U4::from_lo(0),
        };
        let pending = dispatcher.begin_request(&mut header).unwrap();

        let reply = [0x10, 0xff, 0x8f, 0x00, header.function_and_sw_id(), 0x01, 0x00];
        assert_eq!(dispatcher.dispatch(&reply), Some(QueueName::Error));

        let (_, frame) = dispatcher
            .get_first(&[QueueName::Error], |f| pending.matches(f), Duration::ZERO)
            .unwrap();
        assert_eq!(frame.data, reply);
    }

    #[test]
    fn software_ids_skip_zero_and_pending() {
        let dispatcher = dispatcher();
        let requests = (0..15).map(|_| request(&dispatcher)).collect::<Vec<_>>();

        let mut ids = requests
            .iter()
            .map(|(header, _)| header.software_id.to_lo())
            .collect::<Vec<_>>();
        ids.sort_unstable();
        assert_eq!(ids, (1..=15).collect::<Vec<_>>());

        let mut header = requests[0].0;
        assert!(dispatcher.begin_request(&mut header).is_none());

        drop(requests);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[test]
    fn full_queue_drops_oldest() {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            queue_capacity: 2,
            ..Default::default()
        });

        for i in 0..3 {
            dispatcher.dispatch(&[0x02, i]);
        }

        let untreated = dispatcher.clear_all_queues();
        let data = untreated.iter().map(|(_, f)| f.data[1]).collect::<Vec<_>>();
        assert_eq!(data, [1, 2]);
        assert_eq!(dispatcher.queue_len(QueueName::Hid), 0);
    }

    #[test]
    fn overrides_take_precedence() {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            overrides: HashMap::from([(0x9209, QueueName::Common)]),
            ..Default::default()
        });

        assert_eq!(dispatcher.queue_for(0x9209), QueueName::Common);
        assert_eq!(dispatcher.queue_for(0x9001), QueueName::Peripheral);
        assert_eq!(dispatcher.queue_for(0x0001), QueueName::Important);
    }
}
