use std::{sync::Arc, time::Duration};

use usbirp::{
    transfer::{ControlIn, ControlOut, ControlType, QueueConfig, Recipient, TransferError},
    transport::Transport,
    Device, DeviceId, MaybeFuture,
};

/// Pretends to be a device that answers GET_DESCRIPTOR(DEVICE) and echoes
/// vendor requests back.
struct Loopback;

#[rustfmt::skip]
const DEVICE_DESCRIPTOR: [u8; 18] = [
    0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0xe3, 0x59,
    0x23, 0x0a, 0x00, 0x01, 0x01, 0x02, 0x03, 0x01,
];

impl Transport for Loopback {
    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        _index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<i32, TransferError> {
        match (request_type, request) {
            (0x80, 0x06) if value == 0x0100 => {
                let n = buf.len().min(DEVICE_DESCRIPTOR.len());
                buf[..n].copy_from_slice(&DEVICE_DESCRIPTOR[..n]);
                Ok(n as i32)
            }
            (0x40, 0x81) => Ok(buf.len() as i32),
            (0xC0, 0x81) => {
                let n = buf.len().min(4);
                buf[..n].copy_from_slice(&[1, 2, 3, 4][..n]);
                Ok(n as i32)
            }
            _ => Err(TransferError::Stall),
        }
    }
}

fn main() {
    env_logger::init();

    let config = QueueConfig::new()
        .transfer_timeout(Duration::from_millis(100))
        .on_finish(|id, request| println!("{id}: finished {:?}", request.irp().error()));
    let device = Device::new(DeviceId::new(1, 4), Arc::new(Loopback), config).unwrap();

    let result = device
        .control_out(ControlOut {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request: 0x81,
            value: 0x9999,
            index: 0x9999,
            data: &[1, 2, 3, 4],
        })
        .unwrap()
        .wait();
    println!("{result:?}");

    let result = device
        .control_in(ControlIn {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request: 0x81,
            value: 0x9999,
            index: 0x9999,
            length: 256,
        })
        .unwrap()
        .wait();
    println!("{result:?}");

    let desc = device.device_descriptor().unwrap().wait();
    println!("{desc:#?}");

    // unsupported requests stall, and the queue keeps going
    let result = device
        .control_in(ControlIn {
            control_type: ControlType::Class,
            recipient: Recipient::Interface,
            request: 0x01,
            value: 0,
            index: 0,
            length: 8,
        })
        .unwrap()
        .wait();
    println!("{result:?}");

    device.abort().wait();
}
