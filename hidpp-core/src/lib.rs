//! An implementation of Logitech's HID++2.0 protocol on top of raw USB.
//!
//! HID++ extends standard [HID](https://en.wikipedia.org/wiki/Human_interface_device)
//! with a request/response protocol. Devices group their capabilities into
//! so-called features, each identified by a 16 bit feature ID and living at a
//! device-specific feature index.
//!
//! This crate covers three layers:
//!
//! - a declarative message codec ([`field`], [`schema`]) describing HID++
//!   frames as bit-packed field lists with defaults and value checks,
//! - feature models ([`feature`]) mapping feature versions to the schemas of
//!   their functions and events, plus a [`dispatcher`] routing inbound frames
//!   into named queues,
//! - a USB transport ([`transport`]) owning device handles and polling every
//!   interrupt IN endpoint on a bounded pool of worker threads, joined with
//!   the dispatcher by a [`channel::UsbChannel`].
//!
//! Logitech kindly provided a [public Google Drive folder](https://drive.google.com/drive/folders/0BxbRzx7vEV7eWmgwazJ3NUFfQ28)
//! with a lot of documentation on HID++ and several device features.
//!
//! # Quickstart
//!
//! ```no_run
//! use hidpp_core::{
//!     channel::UsbChannel,
//!     config::TransportConfig,
//!     feature::mlx90393_multi_sensor::Mlx90393MultiSensorFeature,
//!     transport::UsbContext,
//! };
//!
//! // The context owns libusb and the worker pool. Opening it enumerates the
//! // bus and starts listening for hot-plug events.
//! let context = UsbContext::with_libusb(TransportConfig::default())?;
//! context.open()?;
//!
//! // Pick the first device matching the configured selector and open a
//! // channel to it. This claims all of its HID interfaces and starts polling
//! // their interrupt IN endpoints.
//! let record = context.select_device()?;
//! let channel = UsbChannel::new(context, &record, 0xff);
//! channel.open()?;
//!
//! // Every device supports the Root feature at index 0.
//! assert_eq!(channel.root().ping(0x5a)?, 0x5a);
//!
//! // Other features are looked up by their ID first. The resolved index is
//! // cached for the lifetime of the channel.
//! let sensors = channel.feature::<Mlx90393MultiSensorFeature>()?;
//! let value = sensors.read_sensor_register(0x02, 0x0a)?;
//! println!("register 0x0a of sensor 2: {value:#06x}");
//!
//! channel.close()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod event;
pub mod feature;
pub mod field;
pub mod nibble;
pub mod protocol;
pub mod report;
pub mod schema;
pub mod trace;
pub mod transport;
