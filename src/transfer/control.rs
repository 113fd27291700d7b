use super::Direction;

pub(crate) const STANDARD_REQUEST_GET_DESCRIPTOR: u8 = 0x06;

/// Specification defining the request, from bits 6..5 of `bmRequestType`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
#[repr(u8)]
pub enum ControlType {
    /// Request defined by the USB standard.
    Standard = 0,

    /// Request defined by the standard USB class specification.
    Class = 1,

    /// Non-standard request.
    Vendor = 2,

    /// Reserved by the USB standard.
    Reserved = 3,
}

impl ControlType {
    fn from_bits(bits: u8) -> ControlType {
        match bits & 0x03 {
            0 => ControlType::Standard,
            1 => ControlType::Class,
            2 => ControlType::Vendor,
            _ => ControlType::Reserved,
        }
    }
}

/// Entity targeted by the request, from bits 4..0 of `bmRequestType`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum Recipient {
    /// Request made to device as a whole.
    Device,

    /// Request made to specific interface.
    Interface,

    /// Request made to specific endpoint.
    Endpoint,

    /// Other request.
    Other,

    /// A reserved recipient code (4..=31), preserved as-is.
    Reserved(u8),
}

impl Recipient {
    fn from_bits(bits: u8) -> Recipient {
        match bits & 0x1F {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            n => Recipient::Reserved(n),
        }
    }

    fn bits(self) -> u8 {
        match self {
            Recipient::Device => 0,
            Recipient::Interface => 1,
            Recipient::Endpoint => 2,
            Recipient::Other => 3,
            Recipient::Reserved(n) => n & 0x1F,
        }
    }
}

/// The `bmRequestType` field of a control request.
///
/// Bit 7 is the data stage direction, bits 6..5 the [`ControlType`], and bits
/// 4..0 the [`Recipient`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestType(u8);

impl RequestType {
    /// Pack a `bmRequestType` from its fields.
    pub fn new(direction: Direction, control_type: ControlType, recipient: Recipient) -> Self {
        RequestType(direction.bits() | ((control_type as u8) << 5) | recipient.bits())
    }

    /// Wrap a raw `bmRequestType` byte.
    pub fn from_byte(b: u8) -> Self {
        RequestType(b)
    }

    /// Get the raw `bmRequestType` byte.
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Direction of the data stage.
    pub fn direction(self) -> Direction {
        Direction::from_address(self.0)
    }

    /// Request type.
    pub fn control_type(self) -> ControlType {
        ControlType::from_bits(self.0 >> 5)
    }

    /// Request recipient.
    pub fn recipient(self) -> Recipient {
        Recipient::from_bits(self.0)
    }
}

impl From<u8> for RequestType {
    fn from(value: u8) -> Self {
        RequestType(value)
    }
}

impl From<RequestType> for u8 {
    fn from(value: RequestType) -> Self {
        value.0
    }
}

impl std::fmt::Debug for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestType")
            .field("raw", &format_args!("0x{:02X}", self.0))
            .field("direction", &self.direction())
            .field("control_type", &self.control_type())
            .field("recipient", &self.recipient())
            .finish()
    }
}

/// The four fields identifying a control request, excluding `wLength`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct ControlSetup {
    /// Direction, type and recipient of the request.
    #[doc(alias = "bmRequestType")]
    pub request_type: RequestType,

    /// Request code.
    #[doc(alias = "bRequest")]
    pub request: u8,

    /// Request-specific value.
    #[doc(alias = "wValue")]
    pub value: u16,

    /// Request-specific index.
    #[doc(alias = "wIndex")]
    pub index: u16,
}

pub(crate) const SETUP_PACKET_SIZE: usize = 8;

impl ControlSetup {
    /// Pack the 8-byte SETUP packet with the given `wLength`.
    pub fn setup_packet(&self, length: u16) -> [u8; SETUP_PACKET_SIZE] {
        [
            self.request_type.as_byte(),
            self.request,
            (self.value & 0xFF) as u8,
            (self.value >> 8) as u8,
            (self.index & 0xFF) as u8,
            (self.index >> 8) as u8,
            (length & 0xFF) as u8,
            (length >> 8) as u8,
        ]
    }

    /// Unpack a SETUP packet into its request fields and `wLength`.
    pub fn from_setup_packet(packet: [u8; SETUP_PACKET_SIZE]) -> (ControlSetup, u16) {
        (
            ControlSetup {
                request_type: RequestType(packet[0]),
                request: packet[1],
                value: u16::from_le_bytes([packet[2], packet[3]]),
                index: u16::from_le_bytes([packet[4], packet[5]]),
            },
            u16::from_le_bytes([packet[6], packet[7]]),
        )
    }
}

/// A control request with an OUT (host-to-device) data stage.
#[derive(Debug, Clone, Copy)]
pub struct ControlOut<'a> {
    /// Request type used for the `bmRequestType` field sent in the SETUP packet.
    #[doc(alias = "bmRequestType")]
    pub control_type: ControlType,

    /// Recipient used for the `bmRequestType` field sent in the SETUP packet.
    #[doc(alias = "bmRequestType")]
    pub recipient: Recipient,

    /// Request code.
    #[doc(alias = "bRequest")]
    pub request: u8,

    /// Request-specific value.
    #[doc(alias = "wValue")]
    pub value: u16,

    /// Request-specific index.
    #[doc(alias = "wIndex")]
    pub index: u16,

    /// Data to send in the DATA stage. `wLength` is its length.
    #[doc(alias = "wLength")]
    pub data: &'a [u8],
}

impl ControlOut<'_> {
    pub(crate) fn setup(&self) -> ControlSetup {
        ControlSetup {
            request_type: RequestType::new(Direction::Out, self.control_type, self.recipient),
            request: self.request,
            value: self.value,
            index: self.index,
        }
    }
}

/// A control request with an IN (device-to-host) data stage.
#[derive(Debug, Clone, Copy)]
pub struct ControlIn {
    /// Request type used for the `bmRequestType` field sent in the SETUP packet.
    #[doc(alias = "bmRequestType")]
    pub control_type: ControlType,

    /// Recipient used for the `bmRequestType` field sent in the SETUP packet.
    #[doc(alias = "bmRequestType")]
    pub recipient: Recipient,

    /// Request code.
    #[doc(alias = "bRequest")]
    pub request: u8,

    /// Request-specific value.
    #[doc(alias = "wValue")]
    pub value: u16,

    /// Request-specific index.
    #[doc(alias = "wIndex")]
    pub index: u16,

    /// Maximum number of bytes to receive in the DATA stage.
    #[doc(alias = "wLength")]
    pub length: u16,
}

impl ControlIn {
    pub(crate) fn setup(&self) -> ControlSetup {
        ControlSetup {
            request_type: RequestType::new(Direction::In, self.control_type, self.recipient),
            request: self.request,
            value: self.value,
            index: self.index,
        }
    }
}
