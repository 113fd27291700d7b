#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc::{Receiver, Sender},
        Mutex,
    },
    thread,
    time::Duration,
};

use usbirp::{transfer::TransferError, transport::Transport};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One control transfer as seen by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: usize,
    pub thread_name: Option<String>,
}

pub enum Response {
    /// Copy up to `buf.len()` bytes and report how many were copied.
    Data(Vec<u8>),

    /// Return this value without touching the buffer.
    Status(i32),

    Fail(TransferError),

    /// Block until a message arrives, then fill the whole buffer.
    Hold(Receiver<()>),
}

/// Replays scripted responses in order; once the script runs out, fills the
/// buffer with the request code and reports a full transfer.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Response>>,
    calls: Mutex<Vec<Call>>,
    started: Mutex<Option<Sender<u16>>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedTransport {
    pub fn new(script: impl IntoIterator<Item = Response>) -> Self {
        ScriptedTransport {
            script: Mutex::new(script.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Send `wValue` of every transfer when it starts.
    pub fn notify_started(&self, tx: Sender<u16>) {
        *self.started.lock().unwrap() = Some(tx);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl Transport for ScriptedTransport {
    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<i32, TransferError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        self.calls.lock().unwrap().push(Call {
            request_type,
            request,
            value,
            index,
            length: buf.len(),
            thread_name: thread::current().name().map(String::from),
        });
        if let Some(tx) = &*self.started.lock().unwrap() {
            let _ = tx.send(value);
        }

        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }

        let response = self.script.lock().unwrap().pop_front();
        let result = match response {
            Some(Response::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n as i32)
            }
            Some(Response::Status(status)) => Ok(status),
            Some(Response::Fail(e)) => Err(e),
            Some(Response::Hold(rx)) => {
                let _ = rx.recv();
                buf.fill(request);
                Ok(buf.len() as i32)
            }
            None => {
                buf.fill(request);
                Ok(buf.len() as i32)
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Answers GET_DESCRIPTOR requests from a table keyed by descriptor type and index.
pub struct DescriptorTransport {
    descriptors: HashMap<(u8, u8), Vec<u8>>,
    pub calls: Mutex<Vec<Call>>,
}

impl DescriptorTransport {
    pub fn new(descriptors: impl IntoIterator<Item = ((u8, u8), Vec<u8>)>) -> Self {
        DescriptorTransport {
            descriptors: descriptors.into_iter().collect(),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl Transport for DescriptorTransport {
    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<i32, TransferError> {
        self.calls.lock().unwrap().push(Call {
            request_type,
            request,
            value,
            index,
            length: buf.len(),
            thread_name: None,
        });

        if request_type != 0x80 || request != 0x06 {
            return Err(TransferError::Stall);
        }

        let key = ((value >> 8) as u8, value as u8);
        let Some(data) = self.descriptors.get(&key) else {
            return Ok(-32);
        };

        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n as i32)
    }
}
