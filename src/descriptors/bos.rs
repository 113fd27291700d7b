//! Binary device Object Store (BOS) descriptor and the device capabilities it carries.

use std::fmt::Debug;

use log::warn;

use super::{
    descriptor_fields, take_descriptor, SpeedSet, DESCRIPTOR_LEN_BOS,
    DESCRIPTOR_LEN_DEVICE_CAPABILITY, DESCRIPTOR_TYPE_BOS, DESCRIPTOR_TYPE_DEVICE_CAPABILITY,
};
use crate::{error::DescriptorError, Error, ErrorKind};

const CAPABILITY_LEN_USB2_EXTENSION: u8 = 7;
const CAPABILITY_LEN_SUPERSPEED: u8 = 10;
const CAPABILITY_LEN_CONTAINER_ID: u8 = 20;
const CAPABILITY_LEN_PLATFORM: u8 = 20;

/// The `bDevCapabilityType` field of a device capability descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum CapabilityType {
    Reserved = 0x00,
    WirelessUsb = 0x01,
    Usb20Extension = 0x02,
    SuperSpeedUsb = 0x03,
    ContainerId = 0x04,
    Platform = 0x05,
    PowerDelivery = 0x06,
    BatteryInfo = 0x07,
    PdConsumerPort = 0x08,
    PdProviderPort = 0x09,
    SuperSpeedPlus = 0x0A,
    PrecisionTimeMeasurement = 0x0B,
    WirelessUsbExt = 0x0C,
}

impl CapabilityType {
    /// Look up a capability type code. Returns `None` for codes above `0x0C`.
    pub fn from_u8(value: u8) -> Option<CapabilityType> {
        use CapabilityType::*;
        Some(match value {
            0x00 => Reserved,
            0x01 => WirelessUsb,
            0x02 => Usb20Extension,
            0x03 => SuperSpeedUsb,
            0x04 => ContainerId,
            0x05 => Platform,
            0x06 => PowerDelivery,
            0x07 => BatteryInfo,
            0x08 => PdConsumerPort,
            0x09 => PdProviderPort,
            0x0A => SuperSpeedPlus,
            0x0B => PrecisionTimeMeasurement,
            0x0C => WirelessUsbExt,
            _ => return None,
        })
    }
}

impl TryFrom<u8> for CapabilityType {
    type Error = DescriptorError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        CapabilityType::from_u8(value).ok_or(DescriptorError::UnknownCapabilityType(value))
    }
}

impl From<CapabilityType> for u8 {
    fn from(value: CapabilityType) -> Self {
        value as u8
    }
}

fn capability_header(capability_type: CapabilityType, len: u8) -> Vec<u8> {
    vec![len, DESCRIPTOR_TYPE_DEVICE_CAPABILITY, capability_type as u8]
}

fn check_capability_len(buf: &[u8], min_len: u8) -> Result<(), DescriptorError> {
    if buf.len() < min_len as usize {
        Err(DescriptorError::Malformed(
            "bLength too short for the device capability type",
        ))
    } else {
        Ok(())
    }
}

/// USB 2.0 Extension capability.
#[derive(Clone, PartialEq, Eq)]
pub struct Usb2ExtensionCapability(Vec<u8>);

impl Usb2ExtensionCapability {
    /// Build the capability. Only the LPM bit of `bmAttributes` is set.
    pub fn new(lpm: bool) -> Self {
        let mut buf = capability_header(
            CapabilityType::Usb20Extension,
            CAPABILITY_LEN_USB2_EXTENSION,
        );
        buf.extend_from_slice(&(if lpm { 0x02u32 } else { 0 }).to_le_bytes());
        Usb2ExtensionCapability(buf)
    }

    /// Whether the device supports Link Power Management.
    pub fn lpm(&self) -> bool {
        self.attributes() & 0x02 != 0
    }
}

descriptor_fields! {
    impl Usb2ExtensionCapability {
        /// `bmAttributes` field.
        #[doc(alias = "bmAttributes")]
        pub fn attributes at 3 -> u32;
    }
}

impl Debug for Usb2ExtensionCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Usb2ExtensionCapability")
            .field("lpm", &self.lpm())
            .finish()
    }
}

/// SuperSpeed USB capability.
#[derive(Clone, PartialEq, Eq)]
pub struct SuperSpeedCapability(Vec<u8>);

impl SuperSpeedCapability {
    /// Build the capability from its fields.
    pub fn from_fields(
        ltm: bool,
        speeds: SpeedSet,
        lowest_functional_speeds: SpeedSet,
        u1_exit_latency: u8,
        u2_exit_latency: u16,
    ) -> Self {
        let mut buf = capability_header(CapabilityType::SuperSpeedUsb, CAPABILITY_LEN_SUPERSPEED);
        buf.push(if ltm { 0x02 } else { 0 });
        buf.extend_from_slice(&speeds.bits().to_le_bytes());
        buf.push(lowest_functional_speeds.bits() as u8);
        buf.push(u1_exit_latency);
        buf.extend_from_slice(&u2_exit_latency.to_le_bytes());
        SuperSpeedCapability(buf)
    }

    /// Whether the device can generate Latency Tolerance Messages.
    pub fn ltm(&self) -> bool {
        self.attributes() & 0x02 != 0
    }

    /// Speeds the device supports.
    pub fn speeds(&self) -> SpeedSet {
        SpeedSet::from_bitmask(self.speeds_supported())
    }

    /// Lowest speeds at which all of the device's functionality is available.
    pub fn lowest_functional_speeds(&self) -> SpeedSet {
        SpeedSet::from_bitmask(self.functionality_support() as u16)
    }
}

descriptor_fields! {
    impl SuperSpeedCapability {
        /// `bmAttributes` field.
        #[doc(alias = "bmAttributes")]
        pub fn attributes at 3 -> u8;

        /// `wSpeedsSupported` field, see [`speeds`][Self::speeds].
        #[doc(alias = "wSpeedsSupported")]
        pub fn speeds_supported at 4 -> u16;

        /// `bFunctionalitySupport` field.
        #[doc(alias = "bFunctionalitySupport")]
        pub fn functionality_support at 6 -> u8;

        /// `bU1DevExitLat` field: U1 exit latency in µs (0..=10).
        #[doc(alias = "bU1DevExitLat")]
        pub fn u1_exit_latency at 7 -> u8;

        /// `wU2DevExitLat` field: U2 exit latency in µs (0..=2047).
        #[doc(alias = "wU2DevExitLat")]
        pub fn u2_exit_latency at 8 -> u16;
    }
}

impl Debug for SuperSpeedCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuperSpeedCapability")
            .field("ltm", &self.ltm())
            .field("speeds", &self.speeds())
            .field("lowest_functional_speeds", &self.lowest_functional_speeds())
            .field("u1_exit_latency", &self.u1_exit_latency())
            .field("u2_exit_latency", &self.u2_exit_latency())
            .finish()
    }
}

fn format_uuid(f: &mut std::fmt::Formatter<'_>, uuid: &[u8]) -> std::fmt::Result {
    for (i, b) in uuid.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            write!(f, "-")?;
        }
        write!(f, "{b:02x}")?;
    }
    Ok(())
}

/// Container ID capability: a UUID unique to the device instance.
#[derive(Clone, PartialEq, Eq)]
pub struct ContainerIdCapability(Vec<u8>);

impl ContainerIdCapability {
    /// Build the capability with a zero reserved byte.
    pub fn new(container_id: [u8; 16]) -> Self {
        let mut buf = capability_header(CapabilityType::ContainerId, CAPABILITY_LEN_CONTAINER_ID);
        buf.push(0);
        buf.extend_from_slice(&container_id);
        ContainerIdCapability(buf)
    }

    /// The container UUID, in wire byte order.
    #[doc(alias = "ContainerID")]
    pub fn container_id(&self) -> [u8; 16] {
        let mut uuid = [0; 16];
        uuid.copy_from_slice(&self.0[4..20]);
        uuid
    }
}

descriptor_fields! {
    impl ContainerIdCapability {
        /// `bReserved` field.
        pub fn reserved at 3 -> u8;
    }
}

impl Debug for ContainerIdCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContainerIdCapability(")?;
        format_uuid(f, &self.0[4..20])?;
        write!(f, ")")
    }
}

/// Platform capability: a platform UUID followed by platform-defined data.
#[derive(Clone, PartialEq, Eq)]
pub struct PlatformCapability(Vec<u8>);

impl PlatformCapability {
    /// Build the capability with a zero reserved byte.
    ///
    /// Fails with [`ErrorKind::InvalidArgument`] if `data` does not fit in a descriptor.
    pub fn new(platform_uuid: [u8; 16], data: &[u8]) -> Result<Self, Error> {
        let len: u8 = (CAPABILITY_LEN_PLATFORM as usize + data.len())
            .try_into()
            .map_err(|_| Error::new(ErrorKind::InvalidArgument, "platform capability data too long"))?;
        let mut buf = capability_header(CapabilityType::Platform, len);
        buf.push(0);
        buf.extend_from_slice(&platform_uuid);
        buf.extend_from_slice(data);
        Ok(PlatformCapability(buf))
    }

    /// The platform UUID, in wire byte order.
    #[doc(alias = "PlatformCapabilityUUID")]
    pub fn platform_uuid(&self) -> [u8; 16] {
        let mut uuid = [0; 16];
        uuid.copy_from_slice(&self.0[4..20]);
        uuid
    }

    /// Platform-specific data following the UUID.
    pub fn data(&self) -> &[u8] {
        &self.0[CAPABILITY_LEN_PLATFORM as usize..]
    }
}

descriptor_fields! {
    impl PlatformCapability {
        /// `bReserved` field.
        pub fn reserved at 3 -> u8;
    }
}

impl Debug for PlatformCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        struct Uuid<'a>(&'a [u8]);
        impl Debug for Uuid<'_> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                format_uuid(f, self.0)
            }
        }

        f.debug_struct("PlatformCapability")
            .field("platform_uuid", &Uuid(&self.0[4..20]))
            .field("data", &self.data())
            .finish()
    }
}

/// A device capability descriptor (`bDescriptorType` 0x10).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceCapability {
    /// USB 2.0 Extension (`0x02`).
    Usb20Extension(Usb2ExtensionCapability),

    /// SuperSpeed USB (`0x03`).
    SuperSpeedUsb(SuperSpeedCapability),

    /// Container ID (`0x04`).
    ContainerId(ContainerIdCapability),

    /// Platform (`0x05`).
    Platform(PlatformCapability),

    /// Any other recognized capability, kept as an opaque payload.
    Other {
        /// `bDevCapabilityType` field.
        capability_type: CapabilityType,

        /// The whole descriptor, header included.
        bytes: Vec<u8>,
    },
}

impl DeviceCapability {
    /// Decode the device capability descriptor at the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<DeviceCapability, DescriptorError> {
        let buf = take_descriptor(
            buf,
            DESCRIPTOR_TYPE_DEVICE_CAPABILITY,
            DESCRIPTOR_LEN_DEVICE_CAPABILITY,
        )?;

        let capability_type = CapabilityType::try_from(buf[2])?;
        match capability_type {
            CapabilityType::Usb20Extension => {
                check_capability_len(buf, CAPABILITY_LEN_USB2_EXTENSION)?;
                Ok(DeviceCapability::Usb20Extension(Usb2ExtensionCapability(
                    buf.to_vec(),
                )))
            }
            CapabilityType::SuperSpeedUsb => {
                check_capability_len(buf, CAPABILITY_LEN_SUPERSPEED)?;
                Ok(DeviceCapability::SuperSpeedUsb(SuperSpeedCapability(
                    buf.to_vec(),
                )))
            }
            CapabilityType::ContainerId => {
                check_capability_len(buf, CAPABILITY_LEN_CONTAINER_ID)?;
                if buf[3] != 0 {
                    warn!("container ID capability has non-zero reserved byte 0x{:02X}", buf[3]);
                }
                Ok(DeviceCapability::ContainerId(ContainerIdCapability(
                    buf.to_vec(),
                )))
            }
            CapabilityType::Platform => {
                check_capability_len(buf, CAPABILITY_LEN_PLATFORM)?;
                Ok(DeviceCapability::Platform(PlatformCapability(buf.to_vec())))
            }
            capability_type => Ok(DeviceCapability::Other {
                capability_type,
                bytes: buf.to_vec(),
            }),
        }
    }

    fn as_bytes(&self) -> &[u8] {
        match self {
            DeviceCapability::Usb20Extension(c) => &c.0,
            DeviceCapability::SuperSpeedUsb(c) => &c.0,
            DeviceCapability::ContainerId(c) => &c.0,
            DeviceCapability::Platform(c) => &c.0,
            DeviceCapability::Other { bytes, .. } => bytes,
        }
    }

    /// Encode the capability into its wire format.
    pub fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    /// Get the `bDevCapabilityType` field.
    pub fn capability_type(&self) -> CapabilityType {
        match self {
            DeviceCapability::Usb20Extension(_) => CapabilityType::Usb20Extension,
            DeviceCapability::SuperSpeedUsb(_) => CapabilityType::SuperSpeedUsb,
            DeviceCapability::ContainerId(_) => CapabilityType::ContainerId,
            DeviceCapability::Platform(_) => CapabilityType::Platform,
            DeviceCapability::Other {
                capability_type, ..
            } => *capability_type,
        }
    }

    /// The bytes following `bDevCapabilityType`.
    pub fn payload(&self) -> &[u8] {
        &self.as_bytes()[3..]
    }

    /// Get the `bLength` field.
    pub fn descriptor_len(&self) -> usize {
        self.as_bytes().len()
    }
}

/// BOS descriptor, together with the device capability descriptors that follow it.
#[derive(Clone, PartialEq, Eq)]
pub struct BosDescriptor {
    header: Vec<u8>,
    capabilities: Vec<DeviceCapability>,
}

impl BosDescriptor {
    /// Build a BOS descriptor from its capabilities, filling in `wTotalLength`
    /// and `bNumDeviceCaps`.
    pub fn new(capabilities: Vec<DeviceCapability>) -> Result<Self, Error> {
        let total_len: usize = DESCRIPTOR_LEN_BOS as usize
            + capabilities.iter().map(|c| c.descriptor_len()).sum::<usize>();
        let total_len: u16 = total_len
            .try_into()
            .map_err(|_| Error::new(ErrorKind::InvalidArgument, "BOS total length too long"))?;
        let num_caps: u8 = capabilities
            .len()
            .try_into()
            .map_err(|_| Error::new(ErrorKind::InvalidArgument, "too many device capabilities"))?;

        let [lo, hi] = total_len.to_le_bytes();
        Ok(BosDescriptor {
            header: vec![DESCRIPTOR_LEN_BOS, DESCRIPTOR_TYPE_BOS, lo, hi, num_caps],
            capabilities,
        })
    }

    /// Decode a BOS descriptor and its capabilities from the start of `buf`.
    ///
    /// `buf` must hold at least `wTotalLength` bytes; anything after that is ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, DescriptorError> {
        let header = take_descriptor(buf, DESCRIPTOR_TYPE_BOS, DESCRIPTOR_LEN_BOS)?;

        let total_len = u16::from_le_bytes([header[2], header[3]]) as usize;
        if total_len < header.len() {
            return Err(DescriptorError::Malformed(
                "wTotalLength shorter than BOS header",
            ));
        }
        if total_len > buf.len() {
            return Err(DescriptorError::Malformed(
                "wTotalLength exceeds buffer length",
            ));
        }

        let mut rest = &buf[header.len()..total_len];
        let mut capabilities = Vec::new();
        while !rest.is_empty() {
            if rest.len() < 2 || rest[0] < 2 || rest[0] as usize > rest.len() {
                return Err(DescriptorError::Malformed(
                    "device capability overruns wTotalLength",
                ));
            }
            let (cap, next) = rest.split_at(rest[0] as usize);
            capabilities.push(DeviceCapability::decode(cap)?);
            rest = next;
        }

        if capabilities.len() != header[4] as usize {
            warn!(
                "BOS bNumDeviceCaps is {} but {} capabilities follow",
                header[4],
                capabilities.len()
            );
        }

        Ok(BosDescriptor {
            header: header.to_vec(),
            capabilities,
        })
    }

    /// Encode the BOS descriptor followed by its capabilities.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.header.clone();
        for cap in &self.capabilities {
            buf.extend_from_slice(cap.as_bytes());
        }
        buf
    }

    /// Get the `bLength` field of the BOS header.
    pub fn descriptor_len(&self) -> usize {
        self.header.len()
    }

    /// `wTotalLength` field: length of the BOS descriptor and all its capabilities.
    #[doc(alias = "wTotalLength")]
    pub fn total_length(&self) -> u16 {
        u16::from_le_bytes([self.header[2], self.header[3]])
    }

    /// `bNumDeviceCaps` field.
    #[doc(alias = "bNumDeviceCaps")]
    pub fn num_device_caps(&self) -> u8 {
        self.header[4]
    }

    /// The device capabilities, in the order they appear.
    pub fn capabilities(&self) -> &[DeviceCapability] {
        &self.capabilities
    }
}

impl Debug for BosDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BosDescriptor")
            .field("total_length", &self.total_length())
            .field("num_device_caps", &self.num_device_caps())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::{DescriptorRecord, Speed};

    #[test]
    fn superspeed_capability() {
        let mut bytes = vec![10, 0x10, 0x03];
        bytes.extend_from_slice(&[0x02, 0x0C, 0x00, 0x01, 0x0A, 0xFF, 0x03]);

        let DeviceCapability::SuperSpeedUsb(ss) = DeviceCapability::decode(&bytes).unwrap() else {
            panic!("expected SuperSpeed capability");
        };
        assert!(ss.ltm());
        assert!(ss.speeds().contains(Speed::High));
        assert!(ss.speeds().contains(Speed::Super));
        assert!(!ss.speeds().contains(Speed::Full));
        assert_eq!(ss.speeds().highest(), Some(Speed::Super));
        assert_eq!(ss.lowest_functional_speeds().lowest(), Some(Speed::Low));
        assert_eq!(ss.u1_exit_latency(), 10);
        assert_eq!(ss.u2_exit_latency(), 0x03FF);

        let built = SuperSpeedCapability::from_fields(
            true,
            [Speed::High, Speed::Super].into_iter().collect(),
            SpeedSet::from_bitmask(0x01),
            10,
            0x03FF,
        );
        assert_eq!(built, ss);
        assert_eq!(DeviceCapability::SuperSpeedUsb(built).encode(), bytes);
    }

    #[test]
    fn usb2_extension_capability() {
        let cap = DeviceCapability::decode(&[7, 0x10, 0x02, 0x02, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(cap.capability_type(), CapabilityType::Usb20Extension);
        let DeviceCapability::Usb20Extension(ext) = &cap else {
            panic!("expected USB 2.0 extension capability");
        };
        assert!(ext.lpm());
        assert_eq!(
            DeviceCapability::Usb20Extension(Usb2ExtensionCapability::new(true)),
            cap
        );
        assert!(!Usb2ExtensionCapability::new(false).lpm());
    }

    #[test]
    fn container_id_and_platform() {
        let uuid: [u8; 16] = std::array::from_fn(|i| i as u8);

        let mut bytes = vec![20, 0x10, 0x04, 0x00];
        bytes.extend_from_slice(&uuid);
        let cap = DeviceCapability::decode(&bytes).unwrap();
        let DeviceCapability::ContainerId(c) = &cap else {
            panic!("expected container ID capability");
        };
        assert_eq!(c.container_id(), uuid);
        assert_eq!(c, &ContainerIdCapability::new(uuid));

        // non-zero reserved byte is tolerated
        bytes[3] = 0x55;
        let cap = DeviceCapability::decode(&bytes).unwrap();
        assert_eq!(cap.encode(), bytes);

        let platform = PlatformCapability::new(uuid, &[1, 2, 3]).unwrap();
        let cap = DeviceCapability::Platform(platform.clone());
        assert_eq!(cap.descriptor_len(), 23);
        assert_eq!(DeviceCapability::decode(&cap.encode()).unwrap(), cap);
        assert_eq!(platform.data(), &[1, 2, 3]);
        assert_eq!(platform.platform_uuid(), uuid);

        assert!(PlatformCapability::new(uuid, &[0; 240]).is_err());
    }

    #[test]
    fn capability_errors() {
        assert_eq!(
            DeviceCapability::decode(&[3, 0x10, 0x0D]),
            Err(DescriptorError::UnknownCapabilityType(0x0D))
        );
        assert!(matches!(
            DeviceCapability::decode(&[5, 0x10, 0x03, 0x00, 0x00]),
            Err(DescriptorError::Malformed(_))
        ));

        let other = DeviceCapability::decode(&[5, 0x10, 0x0A, 0xAB, 0xCD]).unwrap();
        assert_eq!(other.capability_type(), CapabilityType::SuperSpeedPlus);
        assert_eq!(other.payload(), &[0xAB, 0xCD]);
    }

    #[test]
    #[rustfmt::skip]
    fn bos_descriptor() {
        let bytes = [
            0x05, 0x0f, 0x16, 0x00, 0x02,
            0x07, 0x10, 0x02, 0x02, 0x00, 0x00, 0x00,
            0x0a, 0x10, 0x03, 0x00, 0x0e, 0x00, 0x01, 0x0a, 0xff, 0x07,
        ];

        let DescriptorRecord::Bos(bos) = DescriptorRecord::decode(&bytes).unwrap() else {
            panic!("expected BOS descriptor");
        };
        assert_eq!(bos.total_length(), 22);
        assert_eq!(bos.num_device_caps(), 2);
        assert_eq!(bos.capabilities().len(), 2);
        assert_eq!(bos.capabilities()[1].capability_type(), CapabilityType::SuperSpeedUsb);
        assert_eq!(bos.encode(), bytes);

        let rebuilt = BosDescriptor::new(bos.capabilities().to_vec()).unwrap();
        assert_eq!(rebuilt, bos);

        // wTotalLength beyond the buffer
        assert!(matches!(
            BosDescriptor::decode(&bytes[..20]),
            Err(DescriptorError::Malformed(_))
        ));
    }

    #[test]
    fn empty_bos() {
        let bos = BosDescriptor::new(Vec::new()).unwrap();
        assert_eq!(bos.encode(), [0x05, 0x0f, 0x05, 0x00, 0x00]);
        assert_eq!(BosDescriptor::decode(&bos.encode()).unwrap(), bos);
    }
}
