//! Utilities for parsing and building USB descriptors.
//!
//! A device reports its identity and layout in descriptors.
//! [`DescriptorRecord::decode`] turns the bytes of one descriptor into a typed
//! record, and [`DescriptorRecord::encode`] turns it back into the identical bytes.

use std::{collections::BTreeMap, fmt::Debug, iter, ops::Deref};

use log::warn;

use crate::{error::DescriptorError, transfer::Direction, Error, ErrorKind};

mod fields;
pub use fields::{EndpointAddress, EndpointAttributes, Speed, SpeedSet, SyncType, UsageType};

mod bos;
pub use bos::{
    BosDescriptor, CapabilityType, ContainerIdCapability, DeviceCapability,
    PlatformCapability, SuperSpeedCapability, Usb2ExtensionCapability,
};

pub(crate) const DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
pub(crate) const DESCRIPTOR_LEN_DEVICE: u8 = 18;

pub(crate) const DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;
pub(crate) const DESCRIPTOR_LEN_CONFIGURATION: u8 = 9;

pub(crate) const DESCRIPTOR_TYPE_STRING: u8 = 0x03;
pub(crate) const DESCRIPTOR_LEN_STRING: u8 = 3;

pub(crate) const DESCRIPTOR_TYPE_INTERFACE: u8 = 0x04;
pub(crate) const DESCRIPTOR_LEN_INTERFACE: u8 = 9;

pub(crate) const DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;
pub(crate) const DESCRIPTOR_LEN_ENDPOINT: u8 = 7;

pub(crate) const DESCRIPTOR_TYPE_DEVICE_QUALIFIER: u8 = 0x06;
pub(crate) const DESCRIPTOR_LEN_DEVICE_QUALIFIER: u8 = 10;

pub(crate) const DESCRIPTOR_TYPE_OTHER_SPEED_CONFIGURATION: u8 = 0x07;

pub(crate) const DESCRIPTOR_TYPE_INTERFACE_POWER: u8 = 0x08;
pub(crate) const DESCRIPTOR_LEN_INTERFACE_POWER: u8 = 9;

pub(crate) const DESCRIPTOR_TYPE_BOS: u8 = 0x0F;
pub(crate) const DESCRIPTOR_LEN_BOS: u8 = 5;

pub(crate) const DESCRIPTOR_TYPE_DEVICE_CAPABILITY: u8 = 0x10;
pub(crate) const DESCRIPTOR_LEN_DEVICE_CAPABILITY: u8 = 3;

/// Language IDs for string descriptor requests.
///
/// Devices rarely offer anything besides [`language_id::US_ENGLISH`].
pub mod language_id {
    /// US English
    pub const US_ENGLISH: u16 = 0x0409;
}

/// One undecoded descriptor within a larger buffer.
///
/// Derefs to the descriptor's bytes, starting at `bLength`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Descriptor<'a>(&'a [u8]);

impl<'a> Descriptor<'a> {
    /// Wrap `buf`, or return `None` if it is shorter than 2 bytes or than its own `bLength`.
    pub fn new(buf: &[u8]) -> Option<Descriptor> {
        if buf.len() >= 2 && buf.len() >= buf[0] as usize {
            Some(Descriptor(buf))
        } else {
            None
        }
    }

    /// `bLength` field.
    #[doc(alias = "bLength")]
    pub fn descriptor_len(&self) -> usize {
        self.0[0] as usize
    }

    /// `bDescriptorType` field.
    #[doc(alias = "bDescriptorType")]
    pub fn descriptor_type(&self) -> u8 {
        self.0[1]
    }

    /// Decode the descriptor into a typed record.
    pub fn decode(&self) -> Result<DescriptorRecord, DescriptorError> {
        DescriptorRecord::decode(self.0)
    }
}

impl<'a> Deref for Descriptor<'a> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.0
    }
}

/// Iterator over back-to-back descriptors in a buffer.
///
/// Iteration stops at the first descriptor whose `bLength` is invalid.
#[derive(Clone)]
pub struct Descriptors<'a>(&'a [u8]);

impl<'a> Descriptors<'a> {
    /// Iterate the descriptors in a buffer of concatenated descriptors.
    pub fn new(buf: &'a [u8]) -> Self {
        Descriptors(buf)
    }

    /// The bytes not yet iterated.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.0
    }

    fn split_first(&self) -> Option<(&'a [u8], &'a [u8])> {
        if self.0.len() < 2 {
            return None;
        }

        if self.0[0] < 2 {
            warn!(
                "descriptor with bLength {} can't point to next descriptor",
                self.0[0]
            );
            return None;
        }

        if self.0[0] as usize > self.0.len() {
            warn!(
                "descriptor with bLength {} exceeds remaining buffer length {}",
                self.0[0],
                self.0.len()
            );
            return None;
        }

        Some(self.0.split_at(self.0[0] as usize))
    }

    /// Split into groups, each starting at a descriptor of `descriptor_type`
    /// and running up to the next one.
    ///
    /// Leading descriptors of other types are skipped, as are group headers
    /// shorter than `min_len`.
    fn split_by_type(mut self, descriptor_type: u8, min_len: u8) -> impl Iterator<Item = &'a [u8]> {
        iter::from_fn(move || {
            let group = loop {
                let group = self.0;
                let header = self.next()?;
                if header.descriptor_type() != descriptor_type {
                    continue;
                }
                if header.descriptor_len() >= min_len as usize {
                    break group;
                }
                warn!(
                    "skipping descriptor of type {descriptor_type} with bLength {}, below the minimum of {min_len}",
                    header.descriptor_len()
                );
            };

            while let Some((desc, rest)) = self.split_first() {
                if desc[1] == descriptor_type {
                    break;
                }
                self.0 = rest;
            }

            Some(&group[..group.len() - self.0.len()])
        })
    }
}

impl<'a> Iterator for Descriptors<'a> {
    type Item = Descriptor<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some((cur, next)) = self.split_first() {
            self.0 = next;
            Some(Descriptor(cur))
        } else {
            None
        }
    }
}

macro_rules! descriptor_fields {
    (impl $tname:ident {
        $(
            $(#[$attr:meta])*
            $vis:vis fn $name:ident at $pos:literal -> $ty:ty;
        )*
    }) => {
        impl $tname {
            $(
                $(#[$attr])*
                #[inline]
                $vis fn $name(&self) -> $ty { <$ty>::from_le_bytes(self.0[$pos..$pos + std::mem::size_of::<$ty>()].try_into().unwrap()) }
            )*
        }
    }
}
pub(crate) use descriptor_fields;

/// Check the header of the descriptor at the start of `buf` and return its `bLength` bytes.
///
/// Trailing bytes after `bLength` are not part of the descriptor and are not returned.
pub(crate) fn take_descriptor(
    buf: &[u8],
    descriptor_type: u8,
    min_len: u8,
) -> Result<&[u8], DescriptorError> {
    if buf.len() < 2 {
        return Err(DescriptorError::Malformed("buffer shorter than descriptor header"));
    }

    if buf[0] as usize > buf.len() {
        return Err(DescriptorError::Malformed("bLength exceeds buffer length"));
    }

    if buf[1] != descriptor_type {
        return Err(DescriptorError::Malformed("unexpected bDescriptorType"));
    }

    if buf[0] < min_len {
        return Err(DescriptorError::Malformed(
            "bLength shorter than the minimum for the descriptor type",
        ));
    }

    Ok(&buf[..buf[0] as usize])
}

fn string_index(i: u8) -> Option<u8> {
    Some(i).filter(|&i| i != 0)
}

/// A decoded descriptor of any supported type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DescriptorRecord {
    /// Device descriptor (`0x01`).
    Device(DeviceDescriptor),

    /// Configuration descriptor (`0x02`), without the trailing interface descriptors.
    Configuration(ConfigurationDescriptor),

    /// String descriptor (`0x03`).
    String(StringDescriptor),

    /// Interface descriptor (`0x04`).
    Interface(InterfaceDescriptor),

    /// Endpoint descriptor (`0x05`).
    Endpoint(EndpointDescriptor),

    /// Device qualifier descriptor (`0x06`).
    DeviceQualifier(DeviceQualifierDescriptor),

    /// Other speed configuration descriptor (`0x07`).
    OtherSpeedConfiguration(ConfigurationDescriptor),

    /// Interface power descriptor (`0x08`).
    InterfacePower(InterfacePowerDescriptor),

    /// Binary device object store (`0x0F`), including its capabilities.
    Bos(BosDescriptor),

    /// A single device capability descriptor (`0x10`).
    DeviceCapability(DeviceCapability),
}

impl DescriptorRecord {
    /// Decode the descriptor at the start of `buf`.
    ///
    /// Only the first `bLength` bytes are used (for a BOS descriptor, `wTotalLength`).
    pub fn decode(buf: &[u8]) -> Result<DescriptorRecord, DescriptorError> {
        if buf.len() < 2 {
            return Err(DescriptorError::Malformed("buffer shorter than descriptor header"));
        }

        match buf[1] {
            DESCRIPTOR_TYPE_DEVICE => DeviceDescriptor::decode(buf).map(Self::Device),
            DESCRIPTOR_TYPE_CONFIGURATION => {
                ConfigurationDescriptor::decode(buf).map(Self::Configuration)
            }
            DESCRIPTOR_TYPE_STRING => StringDescriptor::decode(buf).map(Self::String),
            DESCRIPTOR_TYPE_INTERFACE => InterfaceDescriptor::decode(buf).map(Self::Interface),
            DESCRIPTOR_TYPE_ENDPOINT => EndpointDescriptor::decode(buf).map(Self::Endpoint),
            DESCRIPTOR_TYPE_DEVICE_QUALIFIER => {
                DeviceQualifierDescriptor::decode(buf).map(Self::DeviceQualifier)
            }
            DESCRIPTOR_TYPE_OTHER_SPEED_CONFIGURATION => {
                ConfigurationDescriptor::decode(buf).map(Self::OtherSpeedConfiguration)
            }
            DESCRIPTOR_TYPE_INTERFACE_POWER => {
                InterfacePowerDescriptor::decode(buf).map(Self::InterfacePower)
            }
            DESCRIPTOR_TYPE_BOS => BosDescriptor::decode(buf).map(Self::Bos),
            DESCRIPTOR_TYPE_DEVICE_CAPABILITY => {
                DeviceCapability::decode(buf).map(Self::DeviceCapability)
            }
            t => Err(DescriptorError::UnknownDescriptorType(t)),
        }
    }

    /// Encode the record into its wire format.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            DescriptorRecord::Device(d) => d.as_bytes().to_vec(),
            DescriptorRecord::Configuration(d) => d.as_bytes().to_vec(),
            DescriptorRecord::String(d) => d.as_bytes().to_vec(),
            DescriptorRecord::Interface(d) => d.as_bytes().to_vec(),
            DescriptorRecord::Endpoint(d) => d.as_bytes().to_vec(),
            DescriptorRecord::DeviceQualifier(d) => d.as_bytes().to_vec(),
            DescriptorRecord::OtherSpeedConfiguration(d) => d.as_bytes().to_vec(),
            DescriptorRecord::InterfacePower(d) => d.as_bytes().to_vec(),
            DescriptorRecord::Bos(d) => d.encode(),
            DescriptorRecord::DeviceCapability(d) => d.encode(),
        }
    }

    /// Get the `bDescriptorType` field.
    pub fn descriptor_type(&self) -> u8 {
        match self {
            DescriptorRecord::Device(_) => DESCRIPTOR_TYPE_DEVICE,
            DescriptorRecord::Configuration(_) => DESCRIPTOR_TYPE_CONFIGURATION,
            DescriptorRecord::String(_) => DESCRIPTOR_TYPE_STRING,
            DescriptorRecord::Interface(_) => DESCRIPTOR_TYPE_INTERFACE,
            DescriptorRecord::Endpoint(_) => DESCRIPTOR_TYPE_ENDPOINT,
            DescriptorRecord::DeviceQualifier(_) => DESCRIPTOR_TYPE_DEVICE_QUALIFIER,
            DescriptorRecord::OtherSpeedConfiguration(_) => {
                DESCRIPTOR_TYPE_OTHER_SPEED_CONFIGURATION
            }
            DescriptorRecord::InterfacePower(_) => DESCRIPTOR_TYPE_INTERFACE_POWER,
            DescriptorRecord::Bos(_) => DESCRIPTOR_TYPE_BOS,
            DescriptorRecord::DeviceCapability(_) => DESCRIPTOR_TYPE_DEVICE_CAPABILITY,
        }
    }

    /// Get the `bLength` field.
    pub fn descriptor_len(&self) -> usize {
        match self {
            DescriptorRecord::Device(d) => d.as_bytes().len(),
            DescriptorRecord::Configuration(d) => d.as_bytes().len(),
            DescriptorRecord::String(d) => d.as_bytes().len(),
            DescriptorRecord::Interface(d) => d.as_bytes().len(),
            DescriptorRecord::Endpoint(d) => d.as_bytes().len(),
            DescriptorRecord::DeviceQualifier(d) => d.as_bytes().len(),
            DescriptorRecord::OtherSpeedConfiguration(d) => d.as_bytes().len(),
            DescriptorRecord::InterfacePower(d) => d.as_bytes().len(),
            DescriptorRecord::Bos(d) => d.descriptor_len(),
            DescriptorRecord::DeviceCapability(d) => d.descriptor_len(),
        }
    }
}

/// Information about a USB device.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceDescriptor(Vec<u8>);

impl DeviceDescriptor {
    /// Decode a device descriptor from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, DescriptorError> {
        take_descriptor(buf, DESCRIPTOR_TYPE_DEVICE, DESCRIPTOR_LEN_DEVICE)
            .map(|d| DeviceDescriptor(d.to_vec()))
    }

    /// Get the bytes of the descriptor.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Build a device descriptor from its fields.
    #[allow(clippy::too_many_arguments)]
    pub fn from_fields(
        usb_version: u16,
        class: u8,
        subclass: u8,
        protocol: u8,
        max_packet_size_0: u8,
        vendor_id: u16,
        product_id: u16,
        device_version: u16,
        manufacturer_string_index: u8,
        product_string_index: u8,
        serial_number_string_index: u8,
        num_configurations: u8,
    ) -> DeviceDescriptor {
        DeviceDescriptor(vec![
            DESCRIPTOR_LEN_DEVICE,
            DESCRIPTOR_TYPE_DEVICE,
            usb_version.to_le_bytes()[0],
            usb_version.to_le_bytes()[1],
            class,
            subclass,
            protocol,
            max_packet_size_0,
            vendor_id.to_le_bytes()[0],
            vendor_id.to_le_bytes()[1],
            product_id.to_le_bytes()[0],
            product_id.to_le_bytes()[1],
            device_version.to_le_bytes()[0],
            device_version.to_le_bytes()[1],
            manufacturer_string_index,
            product_string_index,
            serial_number_string_index,
            num_configurations,
        ])
    }
}

descriptor_fields! {
    impl DeviceDescriptor {
        /// `bcdUSB` descriptor field: USB Specification Number.
        #[doc(alias = "bcdUSB")]
        pub fn usb_version at 2 -> u16;

        /// `bDeviceClass` descriptor field: Class code, assigned by USB-IF.
        #[doc(alias = "bDeviceClass")]
        pub fn class at 4 -> u8;

        /// `bDeviceSubClass` descriptor field: Subclass code, assigned by USB-IF.
        #[doc(alias = "bDeviceSubClass")]
        pub fn subclass at 5 -> u8;

        /// `bDeviceProtocol` descriptor field: Protocol code, assigned by USB-IF.
        #[doc(alias = "bDeviceProtocol")]
        pub fn protocol at 6 -> u8;

        /// `bMaxPacketSize0` descriptor field: Maximum packet size for 0 Endpoint.
        #[doc(alias = "bMaxPacketSize0")]
        pub fn max_packet_size_0 at 7 -> u8;

        /// `idVendor` descriptor field: Vendor ID, assigned by USB-IF.
        #[doc(alias = "idVendor")]
        pub fn vendor_id at 8 -> u16;

        /// `idProduct` descriptor field: Product ID, assigned by the manufacturer.
        #[doc(alias = "idProduct")]
        pub fn product_id at 10 -> u16;

        /// `bcdDevice` descriptor field: Device release number.
        #[doc(alias = "bcdDevice")]
        pub fn device_version at 12 -> u16;

        fn manufacturer_string_index_raw at 14 -> u8;
        fn product_string_index_raw at 15 -> u8;
        fn serial_number_string_index_raw at 16 -> u8;

        /// `bNumConfigurations` descriptor field: Number of configurations
        #[doc(alias = "bNumConfigurations")]
        pub fn num_configurations at 17 -> u8;
    }
}

impl DeviceDescriptor {
    /// `iManufacturer` descriptor field: Index for manufacturer description string.
    pub fn manufacturer_string_index(&self) -> Option<u8> {
        string_index(self.manufacturer_string_index_raw())
    }

    /// `iProduct` descriptor field: Index for product description string.
    pub fn product_string_index(&self) -> Option<u8> {
        string_index(self.product_string_index_raw())
    }

    /// `iSerialNumber` descriptor field: Index for serial number string.
    pub fn serial_number_string_index(&self) -> Option<u8> {
        string_index(self.serial_number_string_index_raw())
    }
}

impl Debug for DeviceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceDescriptor")
            .field("usb_version", &format_args!("0x{:04X}", self.usb_version()))
            .field("class", &format_args!("0x{:02X}", self.class()))
            .field("subclass", &format_args!("0x{:02X}", self.subclass()))
            .field("protocol", &format_args!("0x{:02X}", self.protocol()))
            .field("max_packet_size_0", &self.max_packet_size_0())
            .field("vendor_id", &format_args!("0x{:04X}", self.vendor_id()))
            .field("product_id", &format_args!("0x{:04X}", self.product_id()))
            .field(
                "device_version",
                &format_args!("0x{:04X}", self.device_version()),
            )
            .field(
                "manufacturer_string_index",
                &self.manufacturer_string_index(),
            )
            .field("product_string_index", &self.product_string_index())
            .field(
                "serial_number_string_index",
                &self.serial_number_string_index(),
            )
            .field("num_configurations", &self.num_configurations())
            .finish()
    }
}

/// A configuration or other-speed configuration descriptor, without the
/// interface and endpoint descriptors that follow it.
///
/// Use [`Configuration`] to walk the full `wTotalLength` bundle.
#[derive(Clone, PartialEq, Eq)]
pub struct ConfigurationDescriptor(Vec<u8>);

impl ConfigurationDescriptor {
    /// Decode a configuration (`0x02`) or other speed configuration (`0x07`)
    /// descriptor from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, DescriptorError> {
        let descriptor_type = match buf.get(1) {
            Some(&DESCRIPTOR_TYPE_OTHER_SPEED_CONFIGURATION) => {
                DESCRIPTOR_TYPE_OTHER_SPEED_CONFIGURATION
            }
            _ => DESCRIPTOR_TYPE_CONFIGURATION,
        };
        take_descriptor(buf, descriptor_type, DESCRIPTOR_LEN_CONFIGURATION)
            .map(|d| ConfigurationDescriptor(d.to_vec()))
    }

    /// Get the bytes of the descriptor.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Build a configuration descriptor from its fields.
    ///
    /// Pass `other_speed` to build an other speed configuration descriptor.
    pub fn from_fields(
        other_speed: bool,
        total_length: u16,
        num_interfaces: u8,
        configuration_value: u8,
        string_index: u8,
        attributes: u8,
        max_power: u8,
    ) -> ConfigurationDescriptor {
        let descriptor_type = if other_speed {
            DESCRIPTOR_TYPE_OTHER_SPEED_CONFIGURATION
        } else {
            DESCRIPTOR_TYPE_CONFIGURATION
        };
        ConfigurationDescriptor(vec![
            DESCRIPTOR_LEN_CONFIGURATION,
            descriptor_type,
            total_length.to_le_bytes()[0],
            total_length.to_le_bytes()[1],
            num_interfaces,
            configuration_value,
            string_index,
            attributes,
            max_power,
        ])
    }

    /// Whether this is an other speed configuration descriptor.
    pub fn is_other_speed(&self) -> bool {
        self.0[1] == DESCRIPTOR_TYPE_OTHER_SPEED_CONFIGURATION
    }

    /// Index of the string descriptor describing this configuration.
    #[doc(alias = "iConfiguration")]
    pub fn string_index(&self) -> Option<u8> {
        string_index(self.string_index_raw())
    }

    /// Whether the device is self powered in this configuration (bit 6 of `bmAttributes`).
    pub fn self_powered(&self) -> bool {
        self.attributes() & 0x40 != 0
    }

    /// Whether the device supports remote wakeup in this configuration (bit 5 of `bmAttributes`).
    pub fn remote_wakeup(&self) -> bool {
        self.attributes() & 0x20 != 0
    }
}

descriptor_fields! {
    impl ConfigurationDescriptor {
        /// `wTotalLength` descriptor field: Length of this descriptor and all
        /// interface, endpoint and class descriptors returned with it.
        #[doc(alias = "wTotalLength")]
        pub fn total_length at 2 -> u16;

        /// `bNumInterfaces` descriptor field: Number of interfaces.
        #[doc(alias = "bNumInterfaces")]
        pub fn num_interfaces at 4 -> u8;

        /// `bConfigurationValue` descriptor field: Identifier for the configuration.
        #[doc(alias = "bConfigurationValue")]
        pub fn configuration_value at 5 -> u8;

        fn string_index_raw at 6 -> u8;

        /// `bmAttributes` descriptor field: Bitmap of configuration attributes.
        #[doc(alias = "bmAttributes")]
        pub fn attributes at 7 -> u8;

        /// `bMaxPower` descriptor field: Maximum power, in units of **2** milliamps.
        #[doc(alias = "bMaxPower")]
        pub fn max_power at 8 -> u8;
    }
}

impl Debug for ConfigurationDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigurationDescriptor")
            .field("other_speed", &self.is_other_speed())
            .field("total_length", &self.total_length())
            .field("configuration_value", &self.configuration_value())
            .field("num_interfaces", &self.num_interfaces())
            .field("attributes", &format_args!("0x{:02X}", self.attributes()))
            .field("max_power", &self.max_power())
            .field("string_index", &self.string_index())
            .finish()
    }
}

/// A string descriptor, or the language ID table at string index 0.
#[derive(Clone, PartialEq, Eq)]
pub struct StringDescriptor(Vec<u8>);

impl StringDescriptor {
    /// Decode a string descriptor from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, DescriptorError> {
        take_descriptor(buf, DESCRIPTOR_TYPE_STRING, DESCRIPTOR_LEN_STRING)
            .map(|d| StringDescriptor(d.to_vec()))
    }

    /// Build a string descriptor holding `s` encoded as UTF-16LE.
    ///
    /// Fails with [`ErrorKind::InvalidArgument`] if `s` is empty, or if the
    /// encoded string does not fit in a descriptor.
    pub fn from_text(s: &str) -> Result<Self, Error> {
        StringDescriptor::from_code_units(s.encode_utf16(), "string length out of range")
    }

    /// Build the language ID table returned for string index 0.
    ///
    /// Fails with [`ErrorKind::InvalidArgument`] if `languages` is empty or too long.
    pub fn from_languages(languages: &[u16]) -> Result<Self, Error> {
        StringDescriptor::from_code_units(
            languages.iter().copied(),
            "language count out of range",
        )
    }

    fn from_code_units(
        units: impl Iterator<Item = u16>,
        message: &'static str,
    ) -> Result<Self, Error> {
        let mut buf = vec![0, DESCRIPTOR_TYPE_STRING];
        buf.extend(units.flat_map(|c| c.to_le_bytes()));
        buf[0] = u8::try_from(buf.len())
            .ok()
            .filter(|&len| len >= DESCRIPTOR_LEN_STRING)
            .ok_or(Error::new(ErrorKind::InvalidArgument, message))?;
        Ok(StringDescriptor(buf))
    }

    /// Get the bytes of the descriptor.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn code_units(&self) -> impl Iterator<Item = u16> + '_ {
        self.0[2..]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
    }

    /// Decode the UTF-16LE text.
    ///
    /// Unpaired UTF-16 surrogates will be replaced with `�`, like [`String::from_utf16_lossy`].
    /// A trailing odd byte is ignored.
    pub fn to_string_lossy(&self) -> String {
        char::decode_utf16(self.code_units())
            .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect::<String>()
    }

    /// Interpret the descriptor as the language ID table (string index 0).
    pub fn languages(&self) -> impl Iterator<Item = u16> + '_ {
        self.code_units()
    }
}

impl Debug for StringDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StringDescriptor")
            .field(&self.to_string_lossy())
            .finish()
    }
}

/// Information about a USB interface alternate setting.
///
/// Multiple interface descriptors with the same [`interface_number`][Self::interface_number]
/// but different [`alternate_setting`][Self::alternate_setting] values represent different alternate settings.
#[derive(Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor(Vec<u8>);

impl InterfaceDescriptor {
    /// Decode an interface descriptor from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, DescriptorError> {
        take_descriptor(buf, DESCRIPTOR_TYPE_INTERFACE, DESCRIPTOR_LEN_INTERFACE)
            .map(|d| InterfaceDescriptor(d.to_vec()))
    }

    /// Get the bytes of the descriptor.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Build an interface descriptor from its fields.
    pub fn from_fields(
        interface_number: u8,
        alternate_setting: u8,
        num_endpoints: u8,
        class: u8,
        subclass: u8,
        protocol: u8,
        string_index: u8,
    ) -> InterfaceDescriptor {
        InterfaceDescriptor(vec![
            DESCRIPTOR_LEN_INTERFACE,
            DESCRIPTOR_TYPE_INTERFACE,
            interface_number,
            alternate_setting,
            num_endpoints,
            class,
            subclass,
            protocol,
            string_index,
        ])
    }

    /// Index of the string descriptor describing this interface or alternate setting.
    #[doc(alias = "iInterface")]
    pub fn string_index(&self) -> Option<u8> {
        string_index(self.string_index_raw())
    }
}

descriptor_fields! {
    impl InterfaceDescriptor {
        /// `bInterfaceNumber` descriptor field: Identifier for the interface.
        #[doc(alias="bInterfaceNumber")]
        pub fn interface_number at 2 -> u8;

        /// `bAlternateSetting` descriptor field: Identifier for this alternate setting.
        #[doc(alias="bAlternateSetting")]
        pub fn alternate_setting at 3 -> u8;

        /// `bNumEndpoints` descriptor field: Number of endpoints in this alternate setting.
        #[doc(alias="bNumEndpoints")]
        pub fn num_endpoints at 4 -> u8;

        /// `bInterfaceClass` descriptor field: Standard interface class.
        #[doc(alias="bInterfaceClass")]
        pub fn class at 5 -> u8;

        /// `bInterfaceSubClass` descriptor field: Standard interface subclass.
        #[doc(alias="bInterfaceSubClass")]
        pub fn subclass at 6 -> u8;

        /// `bInterfaceProtocol` descriptor field: Standard interface protocol.
        #[doc(alias="bInterfaceProtocol")]
        pub fn protocol at 7 -> u8;

        fn string_index_raw at 8 -> u8;
    }
}

impl Debug for InterfaceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceDescriptor")
            .field("interface_number", &self.interface_number())
            .field("alternate_setting", &self.alternate_setting())
            .field("num_endpoints", &self.num_endpoints())
            .field("class", &self.class())
            .field("subclass", &self.subclass())
            .field("protocol", &self.protocol())
            .field("string_index", &self.string_index())
            .finish()
    }
}

/// Information about a USB endpoint.
///
/// Audio class endpoints are 9 bytes long and carry `bRefresh` and `bSynchAddress`.
#[derive(Clone, PartialEq, Eq)]
pub struct EndpointDescriptor(Vec<u8>);

impl EndpointDescriptor {
    /// Decode an endpoint descriptor from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, DescriptorError> {
        take_descriptor(buf, DESCRIPTOR_TYPE_ENDPOINT, DESCRIPTOR_LEN_ENDPOINT)
            .map(|d| EndpointDescriptor(d.to_vec()))
    }

    /// Get the bytes of the descriptor.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Build a 7-byte endpoint descriptor from its fields.
    pub fn from_fields(
        address: EndpointAddress,
        attributes: EndpointAttributes,
        max_packet_size_raw: u16,
        interval: u8,
    ) -> EndpointDescriptor {
        EndpointDescriptor(vec![
            DESCRIPTOR_LEN_ENDPOINT,
            DESCRIPTOR_TYPE_ENDPOINT,
            address.as_byte(),
            attributes.as_byte(),
            max_packet_size_raw.to_le_bytes()[0],
            max_packet_size_raw.to_le_bytes()[1],
            interval,
        ])
    }

    /// Get the `bEndpointAddress` field.
    #[doc(alias = "bEndpointAddress")]
    pub fn address(&self) -> EndpointAddress {
        EndpointAddress::from_byte(self.address_raw())
    }

    /// Get the endpoint's direction.
    pub fn direction(&self) -> Direction {
        self.address().direction()
    }

    /// Get the `bmAttributes` field.
    #[doc(alias = "bmAttributes")]
    pub fn attributes(&self) -> EndpointAttributes {
        EndpointAttributes::from_byte(self.attributes_raw())
    }

    /// Get the maximum packet size in bytes.
    pub fn max_packet_size(&self) -> usize {
        (self.max_packet_size_raw() & ((1 << 11) - 1)) as usize
    }

    /// For isochronous endpoints at high speed, get the number of packets per microframe (1, 2, or 3).
    pub fn packets_per_microframe(&self) -> u8 {
        ((self.max_packet_size_raw() >> 11) & 0b11) as u8 + 1
    }

    /// `bRefresh` field of an audio class endpoint.
    pub fn refresh(&self) -> Option<u8> {
        self.0.get(7).copied()
    }

    /// `bSynchAddress` field of an audio class endpoint.
    pub fn synch_address(&self) -> Option<u8> {
        self.0.get(8).copied()
    }
}

descriptor_fields! {
    impl EndpointDescriptor {
        fn address_raw at 2 -> u8;
        fn attributes_raw at 3 -> u8;

        /// Get the raw value of the `wMaxPacketSize` descriptor field.
        ///
        /// See [`max_packet_size`][Self::max_packet_size] and [`packets_per_microframe`][Self::packets_per_microframe]
        /// for the parsed subfields.
        #[doc(alias = "wMaxPacketSize")]
        pub fn max_packet_size_raw at 4 -> u16;

        /// Get the `bInterval` field: Polling interval in frames or microframes.
        #[doc(alias = "bInterval")]
        pub fn interval at 6 -> u8;
    }
}

impl Debug for EndpointDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointDescriptor")
            .field("address", &self.address())
            .field("direction", &self.direction())
            .field("attributes", &self.attributes())
            .field("max_packet_size", &self.max_packet_size())
            .field("packets_per_microframe", &self.packets_per_microframe())
            .field("interval", &self.interval())
            .finish()
    }
}

/// Information a high-speed capable device would report at the other speed.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceQualifierDescriptor(Vec<u8>);

impl DeviceQualifierDescriptor {
    /// Decode a device qualifier descriptor from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, DescriptorError> {
        take_descriptor(
            buf,
            DESCRIPTOR_TYPE_DEVICE_QUALIFIER,
            DESCRIPTOR_LEN_DEVICE_QUALIFIER,
        )
        .map(|d| DeviceQualifierDescriptor(d.to_vec()))
    }

    /// Get the bytes of the descriptor.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Build a device qualifier descriptor from its fields. `bReserved` is zero.
    pub fn from_fields(
        usb_version: u16,
        class: u8,
        subclass: u8,
        protocol: u8,
        max_packet_size_0: u8,
        num_configurations: u8,
    ) -> DeviceQualifierDescriptor {
        DeviceQualifierDescriptor(vec![
            DESCRIPTOR_LEN_DEVICE_QUALIFIER,
            DESCRIPTOR_TYPE_DEVICE_QUALIFIER,
            usb_version.to_le_bytes()[0],
            usb_version.to_le_bytes()[1],
            class,
            subclass,
            protocol,
            max_packet_size_0,
            num_configurations,
            0,
        ])
    }
}

descriptor_fields! {
    impl DeviceQualifierDescriptor {
        /// `bcdUSB` descriptor field.
        #[doc(alias = "bcdUSB")]
        pub fn usb_version at 2 -> u16;

        /// `bDeviceClass` descriptor field.
        #[doc(alias = "bDeviceClass")]
        pub fn class at 4 -> u8;

        /// `bDeviceSubClass` descriptor field.
        #[doc(alias = "bDeviceSubClass")]
        pub fn subclass at 5 -> u8;

        /// `bDeviceProtocol` descriptor field.
        #[doc(alias = "bDeviceProtocol")]
        pub fn protocol at 6 -> u8;

        /// `bMaxPacketSize0` descriptor field at the other speed.
        #[doc(alias = "bMaxPacketSize0")]
        pub fn max_packet_size_0 at 7 -> u8;

        /// `bNumConfigurations` descriptor field: Number of other-speed configurations.
        #[doc(alias = "bNumConfigurations")]
        pub fn num_configurations at 8 -> u8;

        /// `bReserved` descriptor field.
        pub fn reserved at 9 -> u8;
    }
}

impl Debug for DeviceQualifierDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceQualifierDescriptor")
            .field("usb_version", &format_args!("0x{:04X}", self.usb_version()))
            .field("class", &format_args!("0x{:02X}", self.class()))
            .field("subclass", &format_args!("0x{:02X}", self.subclass()))
            .field("protocol", &format_args!("0x{:02X}", self.protocol()))
            .field("max_packet_size_0", &self.max_packet_size_0())
            .field("num_configurations", &self.num_configurations())
            .finish()
    }
}

/// Interface power management descriptor.
///
/// The D1..D3 power saving fields are in the first 9 bytes; the
/// transition times that some devices append are exposed when present.
#[derive(Clone, PartialEq, Eq)]
pub struct InterfacePowerDescriptor(Vec<u8>);

impl InterfacePowerDescriptor {
    /// Decode an interface power descriptor from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, DescriptorError> {
        take_descriptor(
            buf,
            DESCRIPTOR_TYPE_INTERFACE_POWER,
            DESCRIPTOR_LEN_INTERFACE_POWER,
        )
        .map(|d| InterfacePowerDescriptor(d.to_vec()))
    }

    /// Get the bytes of the descriptor.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Build the 9-byte form of the descriptor.
    ///
    /// `power_saving` holds the bus and self powered savings for D1, D2 and D3, in that order.
    pub fn from_fields(capabilities: u8, power_saving: [u8; 6]) -> InterfacePowerDescriptor {
        let mut buf = vec![
            DESCRIPTOR_LEN_INTERFACE_POWER,
            DESCRIPTOR_TYPE_INTERFACE_POWER,
            capabilities,
        ];
        buf.extend_from_slice(&power_saving);
        InterfacePowerDescriptor(buf)
    }

    /// Transition time from D1, D2 and D3 to D0, in units of 100µs, if present.
    pub fn transition_times(&self) -> Option<[u16; 3]> {
        let t = self.0.get(9..15)?;
        Some([
            u16::from_le_bytes([t[0], t[1]]),
            u16::from_le_bytes([t[2], t[3]]),
            u16::from_le_bytes([t[4], t[5]]),
        ])
    }
}

descriptor_fields! {
    impl InterfacePowerDescriptor {
        /// `bmCapabilitiesFlags` descriptor field.
        #[doc(alias = "bmCapabilitiesFlags")]
        pub fn capabilities at 2 -> u8;

        /// `bBusPowerSavingD1` descriptor field.
        pub fn bus_power_saving_d1 at 3 -> u8;

        /// `bSelfPowerSavingD1` descriptor field.
        pub fn self_power_saving_d1 at 4 -> u8;

        /// `bBusPowerSavingD2` descriptor field.
        pub fn bus_power_saving_d2 at 5 -> u8;

        /// `bSelfPowerSavingD2` descriptor field.
        pub fn self_power_saving_d2 at 6 -> u8;

        /// `bBusPowerSavingD3` descriptor field.
        pub fn bus_power_saving_d3 at 7 -> u8;

        /// `bSelfPowerSavingD3` descriptor field.
        pub fn self_power_saving_d3 at 8 -> u8;
    }
}

impl Debug for InterfacePowerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfacePowerDescriptor")
            .field("capabilities", &format_args!("0x{:02X}", self.capabilities()))
            .field("transition_times", &self.transition_times())
            .finish_non_exhaustive()
    }
}

/// Check whether the buffer starts with a configuration descriptor and return its `wTotalLength`.
fn validate_config_descriptor(buf: &[u8]) -> Option<usize> {
    if buf.len() < DESCRIPTOR_LEN_CONFIGURATION as usize {
        if !buf.is_empty() {
            warn!(
                "config descriptor buffer is {} bytes, need {}",
                buf.len(),
                DESCRIPTOR_LEN_CONFIGURATION
            );
        }
        return None;
    }

    if buf[0] < DESCRIPTOR_LEN_CONFIGURATION {
        warn!("invalid config descriptor bLength");
        return None;
    }

    if buf[1] != DESCRIPTOR_TYPE_CONFIGURATION && buf[1] != DESCRIPTOR_TYPE_OTHER_SPEED_CONFIGURATION
    {
        warn!(
            "config bDescriptorType is {}, not a configuration descriptor",
            buf[1]
        );
        return None;
    }

    let total_len = u16::from_le_bytes([buf[2], buf[3]]) as usize;
    if total_len < buf[0] as usize || total_len > buf.len() {
        warn!(
            "invalid config descriptor wTotalLen of {total_len} (buffer size is {bufsize})",
            bufsize = buf.len()
        );
        return None;
    }

    Some(total_len)
}

/// A configuration descriptor together with its interface, endpoint, and other descriptors.
#[derive(Clone)]
pub struct Configuration<'a> {
    descriptor: ConfigurationDescriptor,
    buf: &'a [u8],
}

impl<'a> Configuration<'a> {
    /// Create a `Configuration` from the `wTotalLength` bytes returned by a
    /// GET_DESCRIPTOR(CONFIGURATION) request.
    ///
    /// Bytes beyond `wTotalLength` are ignored.
    pub fn new(buf: &'a [u8]) -> Result<Configuration<'a>, DescriptorError> {
        let descriptor = ConfigurationDescriptor::decode(buf)?;
        let total_len = validate_config_descriptor(buf)
            .ok_or(DescriptorError::Malformed("invalid wTotalLength"))?;
        Ok(Configuration {
            descriptor,
            buf: &buf[..total_len],
        })
    }

    /// The configuration descriptor itself.
    pub fn descriptor(&self) -> &ConfigurationDescriptor {
        &self.descriptor
    }

    /// Get the configuration descriptor followed by all trailing interface and other descriptors.
    pub fn descriptors(&self) -> Descriptors<'a> {
        Descriptors(self.buf)
    }

    /// Every interface alternate setting in the configuration, in order.
    pub fn interface_alt_settings(&self) -> impl Iterator<Item = InterfaceAltSetting<'a>> {
        self.descriptors()
            .split_by_type(DESCRIPTOR_TYPE_INTERFACE, DESCRIPTOR_LEN_INTERFACE)
            .filter_map(|buf| {
                Some(InterfaceAltSetting {
                    descriptor: InterfaceDescriptor::decode(buf).ok()?,
                    buf,
                })
            })
    }

    /// The interfaces of the configuration, with the alternate settings of each grouped together.
    pub fn interfaces(&self) -> impl Iterator<Item = InterfaceGroup<'a>> {
        let mut interfaces = BTreeMap::new();

        for intf in self.interface_alt_settings() {
            interfaces
                .entry(intf.descriptor.interface_number())
                .or_insert_with(Vec::new)
                .push(intf);
        }

        interfaces
            .into_iter()
            .map(|(intf_number, interfaces)| InterfaceGroup {
                intf_number,
                interfaces,
            })
    }
}

struct DebugEntries<F>(F);

impl<F, I> Debug for DebugEntries<F>
where
    F: Fn() -> I,
    I: Iterator,
    I::Item: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.0()).finish()
    }
}

impl<'a> Debug for Configuration<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configuration")
            .field("descriptor", &self.descriptor)
            .field(
                "interface_alt_settings",
                &DebugEntries(|| self.interface_alt_settings()),
            )
            .finish()
    }
}

/// Interface descriptors for alternate settings, grouped by the interface number.
#[derive(Clone)]
pub struct InterfaceGroup<'a> {
    intf_number: u8,
    interfaces: Vec<InterfaceAltSetting<'a>>,
}

impl<'a> InterfaceGroup<'a> {
    /// `bInterfaceNumber` descriptor field: Identifier for the interface.
    #[doc(alias = "bInterfaceNumber")]
    pub fn interface_number(&self) -> u8 {
        self.intf_number
    }

    /// Iterator over alternate settings of the interface.
    pub fn alt_settings(&self) -> impl Iterator<Item = InterfaceAltSetting<'a>> + '_ {
        self.interfaces.iter().cloned()
    }
}

/// An interface alternate setting, with access to its endpoints and other descriptors.
#[derive(Clone)]
pub struct InterfaceAltSetting<'a> {
    descriptor: InterfaceDescriptor,
    buf: &'a [u8],
}

impl<'a> InterfaceAltSetting<'a> {
    /// The interface descriptor itself.
    pub fn descriptor(&self) -> &InterfaceDescriptor {
        &self.descriptor
    }

    /// Get the interface descriptor followed by all trailing endpoint and other
    /// descriptors up to the next interface descriptor.
    pub fn descriptors(&self) -> Descriptors<'a> {
        Descriptors(self.buf)
    }

    /// Get the endpoints of this interface.
    pub fn endpoints(&self) -> impl Iterator<Item = EndpointDescriptor> + 'a {
        self.descriptors()
            .split_by_type(DESCRIPTOR_TYPE_ENDPOINT, DESCRIPTOR_LEN_ENDPOINT)
            .filter_map(|buf| EndpointDescriptor::decode(buf).ok())
    }
}

impl<'a> Debug for InterfaceAltSetting<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceAltSetting")
            .field("descriptor", &self.descriptor)
            .field("endpoints", &DebugEntries(|| self.endpoints()))
            .finish()
    }
}

/// Split a chain of concatenated configuration descriptors by `wTotalLength`
pub(crate) fn parse_concatenated_config_descriptors(mut buf: &[u8]) -> impl Iterator<Item = &[u8]> {
    iter::from_fn(move || {
        let total_len = validate_config_descriptor(buf)?;
        let descriptors = &buf[..total_len];
        buf = &buf[total_len..];
        Some(descriptors)
    })
}

/// Iterate the configurations in a buffer of back-to-back configuration
/// bundles, each `wTotalLength` bytes long.
///
/// Iteration stops at the first bundle with an invalid header.
pub fn configurations(buf: &[u8]) -> impl Iterator<Item = Configuration<'_>> {
    parse_concatenated_config_descriptors(buf).map_while(|b| Configuration::new(b).ok())
}
