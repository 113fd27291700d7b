use std::{fmt::Display, num::NonZeroU8, sync::Arc};

use log::error;

use crate::{
    descriptors::{
        BosDescriptor, DeviceDescriptor, StringDescriptor, DESCRIPTOR_LEN_BOS,
        DESCRIPTOR_LEN_CONFIGURATION, DESCRIPTOR_TYPE_BOS, DESCRIPTOR_TYPE_CONFIGURATION,
        DESCRIPTOR_TYPE_DEVICE, DESCRIPTOR_TYPE_STRING,
    },
    error::DescriptorError,
    transfer::{
        ControlIn, ControlIrp, ControlOut, ControlType, IrpQueue, QueueConfig, Recipient, Request,
        TransferError, STANDARD_REQUEST_GET_DESCRIPTOR,
    },
    transport::Transport,
    maybe_future::blocking::Blocking,
    Error, GetDescriptorError, MaybeFuture,
};

/// Identifies a device by its bus number and address on that bus.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId {
    bus: u8,
    address: u8,
}

impl DeviceId {
    /// Create a device ID.
    pub fn new(bus: u8, address: u8) -> DeviceId {
        DeviceId { bus, address }
    }

    /// Bus number.
    pub fn bus(&self) -> u8 {
        self.bus
    }

    /// Device address on the bus.
    pub fn address(&self) -> u8 {
        self.address
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

/// A USB device reached through a [`Transport`], with its request queue.
///
/// ```
/// use std::{sync::Arc, time::Duration};
/// use usbirp::{
///     transfer::{QueueConfig, TransferError},
///     transport::Transport,
///     Device, DeviceId, MaybeFuture,
/// };
///
/// struct Stalled;
///
/// impl Transport for Stalled {
///     fn control_transfer(
///         &self, _: u8, _: u8, _: u16, _: u16, _: &mut [u8], _: Duration,
///     ) -> Result<i32, TransferError> {
///         Err(TransferError::Stall)
///     }
/// }
///
/// let device = Device::new(DeviceId::new(1, 4), Arc::new(Stalled), QueueConfig::new()).unwrap();
/// let result = device.device_descriptor().unwrap().wait();
/// assert!(result.is_err());
/// ```
///
/// This type is reference-counted internally, and can be cloned cheaply for use
/// in multiple places in your program. All clones share one queue.
#[derive(Clone, Debug)]
pub struct Device {
    queue: IrpQueue,
}

impl Device {
    /// Create a device and its idle queue.
    ///
    /// Fails if `config` is invalid, see [`IrpQueue::new`].
    pub fn new(
        id: DeviceId,
        transport: Arc<dyn Transport>,
        config: QueueConfig,
    ) -> Result<Device, Error> {
        Ok(Device {
            queue: IrpQueue::new(id, transport, config)?,
        })
    }

    /// The device's bus and address.
    pub fn id(&self) -> DeviceId {
        *self.queue.device()
    }

    /// The device's request queue.
    pub fn queue(&self) -> &IrpQueue {
        &self.queue
    }

    /// Queue a request packet. See [`IrpQueue::submit`].
    pub fn submit(&self, request: impl Into<Request>) -> Result<(), Error> {
        self.queue.submit(request)
    }

    /// Discard queued packets and wait for the one in progress. See [`IrpQueue::abort`].
    pub fn abort(&self) -> impl MaybeFuture<Output = ()> {
        self.queue.abort()
    }

    /// Queue a single **IN (device-to-host)** transfer on the default **control** endpoint.
    ///
    /// The device may return less than `length` bytes.
    ///
    /// ### Example
    ///
    /// ```no_run
    /// use usbirp::transfer::{ControlIn, ControlType, Recipient};
    /// # use usbirp::MaybeFuture;
    /// # fn run(device: usbirp::Device) -> Result<(), std::io::Error> {
    ///
    /// let data: Vec<u8> = device.control_in(ControlIn {
    ///     control_type: ControlType::Vendor,
    ///     recipient: Recipient::Device,
    ///     request: 0x30,
    ///     value: 0x0,
    ///     index: 0x0,
    ///     length: 64,
    /// })?.wait()?;
    /// # Ok(()) }
    /// ```
    pub fn control_in(
        &self,
        data: ControlIn,
    ) -> Result<impl MaybeFuture<Output = Result<Vec<u8>, TransferError>>, Error> {
        let irp = ControlIrp::from(data);
        self.queue.submit_for_wait(irp.clone())?;
        Ok(irp.completion().map(move |()| irp.status()))
    }

    /// Queue a single **OUT (host-to-device)** transfer on the default **control** endpoint.
    ///
    /// Resolves to the number of bytes sent. Sending fewer bytes than
    /// `data.len()` is a [`TransferError::ShortPacket`].
    pub fn control_out(
        &self,
        data: ControlOut,
    ) -> Result<impl MaybeFuture<Output = Result<usize, TransferError>>, Error> {
        let irp = ControlIrp::from(data);
        irp.set_accept_short_packet(false)?;
        self.queue.submit_for_wait(irp.clone())?;
        Ok(irp
            .completion()
            .map(move |()| irp.status().map(|data| data.len())))
    }

    /// Request a descriptor from the device, reading at most `length` bytes.
    ///
    /// The `language_id` should be `0` unless you are requesting a string descriptor.
    pub fn get_descriptor(
        &self,
        desc_type: u8,
        desc_index: u8,
        language_id: u16,
        length: u16,
    ) -> Result<impl MaybeFuture<Output = Result<Vec<u8>, GetDescriptorError>, IntoFuture: Unpin>, Error> {
        get_descriptor(&self.queue, desc_type, desc_index, language_id, length)
    }

    /// Request and decode the device descriptor.
    pub fn device_descriptor(
        &self,
    ) -> Result<impl MaybeFuture<Output = Result<DeviceDescriptor, GetDescriptorError>>, Error>
    {
        Ok(self
            .get_descriptor(DESCRIPTOR_TYPE_DEVICE, 0, 0, 18)?
            .map(|r| -> Result<_, GetDescriptorError> { Ok(DeviceDescriptor::decode(&r?)?) }))
    }

    /// Request the list of supported languages for string descriptors.
    pub fn get_string_descriptor_supported_languages(
        &self,
    ) -> Result<impl MaybeFuture<Output = Result<Vec<u16>, GetDescriptorError>>, Error> {
        Ok(self
            .get_descriptor(DESCRIPTOR_TYPE_STRING, 0, 0, 255)?
            .map(|r| -> Result<Vec<u16>, GetDescriptorError> {
                let data = r?;
                let desc = StringDescriptor::decode(&data).map_err(|e| {
                    error!("String descriptor language list read {data:?}, not a valid string descriptor");
                    e
                })?;
                Ok(desc.languages().collect())
            }))
    }

    /// Request a string descriptor from the device.
    ///
    /// Almost all devices support only the language ID [`US_ENGLISH`][`crate::descriptors::language_id::US_ENGLISH`].
    ///
    /// Unpaired UTF-16 surrogates will be replaced with `�`, like [`String::from_utf16_lossy`].
    pub fn get_string_descriptor(
        &self,
        desc_index: NonZeroU8,
        language_id: u16,
    ) -> Result<impl MaybeFuture<Output = Result<String, GetDescriptorError>>, Error> {
        Ok(self
            .get_descriptor(DESCRIPTOR_TYPE_STRING, desc_index.get(), language_id, 255)?
            .map(|r| -> Result<_, GetDescriptorError> {
                Ok(StringDescriptor::decode(&r?)?.to_string_lossy())
            }))
    }

    /// Request a configuration descriptor together with all interface,
    /// endpoint and class descriptors returned with it.
    ///
    /// The header is read first to learn `wTotalLength`. Parse the result with
    /// [`Configuration::new`][crate::descriptors::Configuration::new].
    ///
    /// Awaiting this requires the `smol` or `tokio` feature.
    pub fn configuration_descriptor(
        &self,
        index: u8,
    ) -> impl MaybeFuture<Output = Result<Vec<u8>, GetDescriptorError>> {
        let queue = self.queue.clone();
        Blocking::new(move || {
            get_descriptor_total_length(
                &queue,
                DESCRIPTOR_TYPE_CONFIGURATION,
                index,
                DESCRIPTOR_LEN_CONFIGURATION,
            )
        })
    }

    /// Request and decode the BOS descriptor and its device capabilities.
    ///
    /// Awaiting this requires the `smol` or `tokio` feature.
    pub fn bos_descriptor(&self) -> impl MaybeFuture<Output = Result<BosDescriptor, GetDescriptorError>> {
        let queue = self.queue.clone();
        Blocking::new(move || -> Result<_, GetDescriptorError> {
            let data = get_descriptor_total_length(&queue, DESCRIPTOR_TYPE_BOS, 0, DESCRIPTOR_LEN_BOS)?;
            Ok(BosDescriptor::decode(&data)?)
        })
    }
}

fn get_descriptor(
    queue: &IrpQueue,
    desc_type: u8,
    desc_index: u8,
    language_id: u16,
    length: u16,
) -> Result<impl MaybeFuture<Output = Result<Vec<u8>, GetDescriptorError>, IntoFuture: Unpin>, Error> {
    let irp = ControlIrp::from(ControlIn {
        control_type: ControlType::Standard,
        recipient: Recipient::Device,
        request: STANDARD_REQUEST_GET_DESCRIPTOR,
        value: ((desc_type as u16) << 8) | desc_index as u16,
        index: language_id,
        length,
    });
    queue.submit_for_wait(irp.clone())?;
    Ok(irp
        .completion()
        .map(move |()| irp.status().map_err(GetDescriptorError::Transfer)))
}

/// Read the header of a descriptor with a `wTotalLength` field, then the whole thing.
fn get_descriptor_total_length(
    queue: &IrpQueue,
    desc_type: u8,
    desc_index: u8,
    header_len: u8,
) -> Result<Vec<u8>, GetDescriptorError> {
    let header = get_descriptor(queue, desc_type, desc_index, 0, header_len as u16)?.wait()?;
    if header.len() < 4 {
        return Err(DescriptorError::Malformed("descriptor header too short").into());
    }

    let total_len = u16::from_le_bytes([header[2], header[3]]);
    if total_len <= header.len() as u16 {
        return Ok(header);
    }
    get_descriptor(queue, desc_type, desc_index, 0, total_len)?.wait()
}

#[test]
fn device_id_display() {
    assert_eq!(DeviceId::new(1, 23).to_string(), "001:023");
    assert!(DeviceId::new(1, 2) < DeviceId::new(2, 1));
}
