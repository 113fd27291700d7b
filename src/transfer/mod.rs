//! Transfer-related types.
//!
//! Build an [`Irp`] or [`ControlIrp`], wrap it in a [`Request`] and submit it
//! to an [`IrpQueue`] (or to a [`Device`][crate::Device], which owns one).

mod control;
pub use control::{ControlIn, ControlOut, ControlSetup, ControlType, Recipient, RequestType};
pub(crate) use control::STANDARD_REQUEST_GET_DESCRIPTOR;

mod irp;
pub use irp::{Completion, ControlIrp, Irp};

mod queue;
pub use queue::{IrpQueue, QueueConfig, Request};

pub use crate::error::TransferError;

/// Transfer direction
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    /// Host to device
    Out = 0,

    /// Device to host
    In = 1,
}

impl Direction {
    /// Get the direction from bit 7 of an endpoint address or `bmRequestType`.
    pub fn from_address(addr: u8) -> Direction {
        match addr & Self::MASK {
            0 => Self::Out,
            _ => Self::In,
        }
    }

    pub(crate) const MASK: u8 = 0x80;

    /// The direction bit positioned at bit 7.
    pub(crate) fn bits(self) -> u8 {
        (self as u8) << 7
    }
}

/// Endpoint transfer type, from bits 1..0 of `bmAttributes`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransferType {
    /// Control endpoint.
    Control = 0,

    /// Isochronous endpoint.
    Isochronous = 1,

    /// Bulk endpoint.
    Bulk = 2,

    /// Interrupt endpoint.
    Interrupt = 3,
}

impl TransferType {
    /// Decode the transfer type from an endpoint `bmAttributes` byte.
    pub fn from_attributes(attributes: u8) -> TransferType {
        match attributes & 0x03 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            3 => TransferType::Interrupt,
            _ => unreachable!(),
        }
    }
}

#[test]
fn direction_from_address() {
    assert_eq!(Direction::from_address(0x81), Direction::In);
    assert_eq!(Direction::from_address(0x02), Direction::Out);
    assert_eq!(Direction::In.bits(), 0x80);
    assert_eq!(Direction::Out.bits(), 0x00);
}

#[test]
fn transfer_type_masks_two_bits() {
    assert_eq!(TransferType::from_attributes(0x00), TransferType::Control);
    assert_eq!(TransferType::from_attributes(0x05), TransferType::Isochronous);
    assert_eq!(TransferType::from_attributes(0xFE), TransferType::Bulk);
    assert_eq!(TransferType::from_attributes(0x03), TransferType::Interrupt);
}
