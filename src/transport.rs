//! The host-controller binding that actually moves bytes.
//!
//! An [`IrpQueue`][crate::transfer::IrpQueue] calls into a [`Transport`] from
//! its worker thread, one transfer at a time.

use std::time::Duration;

use crate::{descriptors::EndpointAddress, transfer::TransferError};

/// Synchronous transfer functions provided by a USB host stack.
///
/// Both functions block until the transfer finishes or `timeout` elapses,
/// and return the number of bytes transferred. A negative `Ok` value is a
/// status code, translated with [`TransferError::from_status`].
pub trait Transport: Send + Sync {
    /// Perform a control transfer.
    ///
    /// For an IN request, `buf` receives the data stage; for an OUT request it
    /// holds the data to send. `buf.len()` is `wLength`.
    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<i32, TransferError>;

    /// Perform a bulk or interrupt transfer on `endpoint`.
    fn endpoint_transfer(
        &self,
        endpoint: EndpointAddress,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<i32, TransferError> {
        let _ = (endpoint, buf, timeout);
        Err(TransferError::Unsupported)
    }
}
