//! Single-byte bitfields found inside descriptors.

use std::fmt::Debug;

use crate::{
    transfer::{Direction, TransferType},
    Error, ErrorKind,
};

/// The `bEndpointAddress` field: endpoint number in bits 3..0, direction in bit 7.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointAddress(u8);

impl EndpointAddress {
    const NUMBER_MASK: u8 = 0x0F;

    /// Build an address from an endpoint number (0..=15) and direction.
    pub fn new(number: u8, direction: Direction) -> Result<Self, Error> {
        if number > Self::NUMBER_MASK {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "endpoint number out of range",
            ));
        }
        Ok(EndpointAddress(number | direction.bits()))
    }

    /// Wrap a raw `bEndpointAddress` byte.
    pub fn from_byte(b: u8) -> Self {
        EndpointAddress(b)
    }

    /// Get the raw `bEndpointAddress` byte.
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Endpoint number, 0..=15.
    pub fn number(self) -> u8 {
        self.0 & Self::NUMBER_MASK
    }

    /// Endpoint direction.
    pub fn direction(self) -> Direction {
        Direction::from_address(self.0)
    }
}

impl Debug for EndpointAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EndpointAddress(0x{:02X})", self.0)
    }
}

/// Isochronous synchronization type, bits 3..2 of endpoint `bmAttributes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SyncType {
    /// No synchronization.
    NoSync = 0,

    /// Asynchronous.
    Asynchronous = 1,

    /// Adaptive.
    Adaptive = 2,

    /// Synchronous.
    Synchronous = 3,
}

/// Isochronous usage type, bits 5..4 of endpoint `bmAttributes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UsageType {
    /// Data endpoint.
    Data = 0,

    /// Feedback endpoint.
    Feedback = 1,

    /// Implicit feedback data endpoint.
    ImplicitFeedback = 2,

    /// Reserved.
    Reserved = 3,
}

/// The endpoint `bmAttributes` field.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointAttributes {
    transfer_type: TransferType,
    sync_type: SyncType,
    usage_type: UsageType,
}

impl EndpointAttributes {
    /// Build attributes from their fields.
    pub fn new(transfer_type: TransferType, sync_type: SyncType, usage_type: UsageType) -> Self {
        EndpointAttributes {
            transfer_type,
            sync_type,
            usage_type,
        }
    }

    /// Decode a `bmAttributes` byte. Bits 7..6 are reserved and ignored.
    pub fn from_byte(b: u8) -> Self {
        let sync_type = match (b >> 2) & 0x03 {
            0 => SyncType::NoSync,
            1 => SyncType::Asynchronous,
            2 => SyncType::Adaptive,
            _ => SyncType::Synchronous,
        };
        let usage_type = match (b >> 4) & 0x03 {
            0 => UsageType::Data,
            1 => UsageType::Feedback,
            2 => UsageType::ImplicitFeedback,
            _ => UsageType::Reserved,
        };
        EndpointAttributes {
            transfer_type: TransferType::from_attributes(b),
            sync_type,
            usage_type,
        }
    }

    /// Encode into a `bmAttributes` byte.
    pub fn as_byte(self) -> u8 {
        (self.transfer_type as u8) | ((self.sync_type as u8) << 2) | ((self.usage_type as u8) << 4)
    }

    /// Transfer type.
    pub fn transfer_type(self) -> TransferType {
        self.transfer_type
    }

    /// Synchronization type (isochronous endpoints only).
    pub fn sync_type(self) -> SyncType {
        self.sync_type
    }

    /// Usage type (isochronous endpoints only).
    pub fn usage_type(self) -> UsageType {
        self.usage_type
    }
}

impl Debug for EndpointAttributes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointAttributes")
            .field("transfer_type", &self.transfer_type)
            .field("sync_type", &self.sync_type)
            .field("usage_type", &self.usage_type)
            .finish()
    }
}

/// USB connection speed
#[derive(Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Hash, Debug)]
pub enum Speed {
    /// Low speed (1.5 Mbit)
    Low,

    /// Full speed (12 Mbit)
    Full,

    /// High speed (480 Mbit)
    High,

    /// Super speed (5000 Mbit)
    Super,
}

impl Speed {
    const ALL: [Speed; 4] = [Speed::Low, Speed::Full, Speed::High, Speed::Super];

    fn mask(self) -> u16 {
        match self {
            Speed::Low => 1 << 0,
            Speed::Full => 1 << 1,
            Speed::High => 1 << 2,
            Speed::Super => 1 << 3,
        }
    }
}

/// A set of speeds, decoded from a capability bitmask
/// (bit 0 low, bit 1 full, bit 2 high, bit 3 super).
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct SpeedSet(u16);

impl SpeedSet {
    /// Decode the low four bits of a speed bitmask. Higher bits are ignored.
    pub fn from_bitmask(bits: u16) -> Self {
        SpeedSet(bits & 0x0F)
    }

    /// Get the bitmask.
    pub fn bits(self) -> u16 {
        self.0
    }

    /// Whether `speed` is in the set.
    pub fn contains(self, speed: Speed) -> bool {
        self.0 & speed.mask() != 0
    }

    /// Whether no speed is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate the speeds in the set, lowest first.
    pub fn iter(self) -> impl Iterator<Item = Speed> {
        Speed::ALL.into_iter().filter(move |&s| self.contains(s))
    }

    /// The highest speed in the set, in priority order super, high, full, low.
    pub fn highest(self) -> Option<Speed> {
        Speed::ALL.into_iter().rev().find(|&s| self.contains(s))
    }

    /// The lowest speed in the set.
    pub fn lowest(self) -> Option<Speed> {
        self.iter().next()
    }
}

impl FromIterator<Speed> for SpeedSet {
    fn from_iter<T: IntoIterator<Item = Speed>>(iter: T) -> Self {
        SpeedSet(iter.into_iter().fold(0, |bits, s| bits | s.mask()))
    }
}

impl Debug for SpeedSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_address() {
        let ep = EndpointAddress::from_byte(0x81);
        assert_eq!(ep.number(), 1);
        assert_eq!(ep.direction(), Direction::In);

        let ep = EndpointAddress::from_byte(0x02);
        assert_eq!(ep.number(), 2);
        assert_eq!(ep.direction(), Direction::Out);

        // numbers above 7 must survive the mask
        let ep = EndpointAddress::from_byte(0x8F);
        assert_eq!(ep.number(), 15);
        assert_eq!(EndpointAddress::new(15, Direction::In).unwrap(), ep);

        assert_eq!(
            EndpointAddress::new(16, Direction::Out).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn endpoint_attributes_round_trip() {
        for b in 0..0x40u8 {
            assert_eq!(EndpointAttributes::from_byte(b).as_byte(), b);
        }

        let attr = EndpointAttributes::from_byte(0x25);
        assert_eq!(attr.transfer_type(), TransferType::Isochronous);
        assert_eq!(attr.sync_type(), SyncType::Asynchronous);
        assert_eq!(attr.usage_type(), UsageType::ImplicitFeedback);

        let attr = EndpointAttributes::new(TransferType::Bulk, SyncType::NoSync, UsageType::Data);
        assert_eq!(attr.as_byte(), 0x02);
    }

    #[test]
    fn speed_bitmask() {
        let speeds = SpeedSet::from_bitmask(0x0C);
        assert!(speeds.contains(Speed::High));
        assert!(speeds.contains(Speed::Super));
        assert!(!speeds.contains(Speed::Full));
        assert_eq!(speeds.highest(), Some(Speed::Super));
        assert_eq!(speeds.lowest(), Some(Speed::High));

        let speeds = SpeedSet::from_bitmask(0x06);
        assert_eq!(speeds.highest(), Some(Speed::High));
        assert_eq!(speeds.iter().collect::<Vec<_>>(), vec![Speed::Full, Speed::High]);

        assert_eq!(SpeedSet::from_bitmask(0xF0).highest(), None);
        assert_eq!(
            [Speed::Low, Speed::Super].into_iter().collect::<SpeedSet>().bits(),
            0x09
        );
    }
}
