//! USB descriptor encoding and decoding, and a per-device queue of I/O
//! request packets executed against a host-controller [`Transport`][transport::Transport].
//!
//! * [`descriptors`] decodes standard and BOS descriptors into typed records
//!   and encodes them back to the same bytes.
//! * [`transfer`] holds the request packet types and the [`IrpQueue`][transfer::IrpQueue],
//!   which accepts packets from any thread and runs them in order, one at a time,
//!   on a worker thread.
//! * A [`Device`] pairs a queue with a transport and adds control and
//!   descriptor requests on top.
//!
//! Waiting for a result returns a [`MaybeFuture`]: block with `.wait()`, or
//! `.await` it in async code.
//!
//! This crate logs with the [`log`](https://docs.rs/log) facade and installs no logger.

#![warn(missing_docs)]

pub mod descriptors;

mod device;
pub use device::{Device, DeviceId};

mod error;
pub use error::{DescriptorError, Error, ErrorKind, GetDescriptorError};

mod maybe_future;
pub use maybe_future::MaybeFuture;

pub mod transfer;

pub mod transport;
