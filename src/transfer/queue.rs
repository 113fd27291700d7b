use std::{
    any::Any,
    collections::VecDeque,
    fmt::Debug,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread::{self, ThreadId},
    time::Duration,
};

use log::{debug, error};

use super::{ControlIrp, Irp, TransferError};
use crate::{
    descriptors::EndpointAddress,
    maybe_future::blocking::Blocking,
    transport::Transport,
    DeviceId, Error, ErrorKind, MaybeFuture,
};

/// A packet submitted to an [`IrpQueue`].
#[derive(Clone, Debug)]
pub enum Request {
    /// A control transfer on the default control pipe.
    Control(ControlIrp),

    /// A bulk or interrupt transfer on another endpoint.
    Endpoint {
        /// Target endpoint; the direction bit selects IN or OUT.
        endpoint: EndpointAddress,

        /// Data packet.
        irp: Irp,
    },
}

impl Request {
    /// The data packet of the request.
    pub fn irp(&self) -> &Irp {
        match self {
            Request::Control(c) => c.irp(),
            Request::Endpoint { irp, .. } => irp,
        }
    }
}

impl From<ControlIrp> for Request {
    fn from(value: ControlIrp) -> Self {
        Request::Control(value)
    }
}

type OnFinish = Arc<dyn Fn(&DeviceId, &Request) + Send + Sync>;

const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_THREAD_NAME: &str = "usb-irp";

/// Options for an [`IrpQueue`].
///
/// ```
/// use std::time::Duration;
/// use usbirp::transfer::QueueConfig;
///
/// let config = QueueConfig::new()
///     .transfer_timeout(Duration::from_millis(500))
///     .thread_name("my-device")
///     .on_finish(|device, request| {
///         println!("{device}: {:?}", request.irp().error());
///     });
/// ```
#[derive(Clone)]
pub struct QueueConfig {
    transfer_timeout: Duration,
    thread_name: String,
    on_finish: Option<OnFinish>,
}

impl QueueConfig {
    /// Default options: 5 second transfer timeout, worker thread named `usb-irp`, no callback.
    pub fn new() -> Self {
        QueueConfig {
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            thread_name: DEFAULT_THREAD_NAME.into(),
            on_finish: None,
        }
    }

    /// Timeout passed to the transport for each transfer. Must be non-zero.
    pub fn transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    /// Name of the worker thread.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Function called on the worker thread after each packet completes.
    ///
    /// A panic in the callback is logged and otherwise ignored. The callback
    /// may submit packets, but must not block waiting for one: the worker
    /// cannot run it while it is inside the callback. The [`Device`][crate::Device]
    /// request helpers fail with [`ErrorKind::Busy`] when called here.
    /// [`IrpQueue::abort`] returns without waiting.
    pub fn on_finish(mut self, f: impl Fn(&DeviceId, &Request) + Send + Sync + 'static) -> Self {
        self.on_finish = Some(Arc::new(f));
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig::new()
    }
}

impl Debug for QueueConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConfig")
            .field("transfer_timeout", &self.transfer_timeout)
            .field("thread_name", &self.thread_name)
            .field("on_finish", &self.on_finish.is_some())
            .finish()
    }
}

struct QueueState {
    pending: VecDeque<Request>,

    /// A worker thread exists and will drain `pending`.
    running: bool,

    /// Set by `abort`, cleared when the worker goes idle.
    aborting: bool,

    worker: Option<ThreadId>,

    /// Incremented each time the worker goes idle.
    idle_count: u64,
}

struct Shared {
    device: DeviceId,
    transport: Arc<dyn Transport>,
    transfer_timeout: Duration,
    on_finish: Option<OnFinish>,
    state: Mutex<QueueState>,
    idle: Condvar,
}

/// Per-device FIFO of request packets, executed one at a time on a worker thread.
///
/// Any number of threads may [`submit`][IrpQueue::submit] concurrently. The
/// queue starts a worker thread when a packet arrives while it is idle; the
/// worker hands each packet to the [`Transport`] in submission order, marks it
/// complete, calls the configured on-finish callback, and exits once the queue
/// is empty. There is never more than one worker per queue.
///
/// `IrpQueue` is a handle and can be cloned cheaply. Packets still queued when
/// the last handle is dropped are processed.
#[derive(Clone)]
pub struct IrpQueue {
    shared: Arc<Shared>,
    thread_name: String,
}

impl IrpQueue {
    /// Create an idle queue for `device`.
    ///
    /// Fails with [`ErrorKind::InvalidArgument`] if the configured transfer timeout is zero.
    pub fn new(
        device: DeviceId,
        transport: Arc<dyn Transport>,
        config: QueueConfig,
    ) -> Result<IrpQueue, Error> {
        if config.transfer_timeout.is_zero() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "transfer timeout must be non-zero",
            )
            .log_error());
        }

        Ok(IrpQueue {
            shared: Arc::new(Shared {
                device,
                transport,
                transfer_timeout: config.transfer_timeout,
                on_finish: config.on_finish,
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    running: false,
                    aborting: false,
                    worker: None,
                    idle_count: 0,
                }),
                idle: Condvar::new(),
            }),
            thread_name: config.thread_name,
        })
    }

    /// The device this queue serves.
    pub fn device(&self) -> &DeviceId {
        &self.shared.device
    }

    /// Append a packet to the queue, starting the worker thread if it is idle.
    ///
    /// Errors:
    ///  * [`ErrorKind::Aborted`] while an [`abort`][Self::abort] is draining the queue.
    ///  * [`ErrorKind::InvalidArgument`] if the packet is already complete, or a
    ///    control packet is longer than `wLength` can express.
    ///  * [`ErrorKind::Busy`] if the packet is already in a queue.
    ///  * [`ErrorKind::Other`] if the worker thread could not be started. The
    ///    packet is not queued.
    pub fn submit(&self, request: impl Into<Request>) -> Result<(), Error> {
        let request = request.into();
        let irp = request.irp().clone();

        if matches!(request, Request::Control(_)) && irp.length() > u16::MAX as usize {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "control transfer length exceeds wLength",
            ));
        }

        let mut state = self.shared.lock();
        if state.aborting {
            return Err(Error::new(ErrorKind::Aborted, "queue is aborting").log_debug());
        }

        irp.mark_queued()?;
        state.pending.push_back(request);

        if !state.running {
            let shared = self.shared.clone();
            let spawned = thread::Builder::new()
                .name(self.thread_name.clone())
                .spawn(move || shared.run());

            match spawned {
                Ok(handle) => {
                    state.running = true;
                    state.worker = Some(handle.thread().id());
                }
                Err(e) => {
                    state.pending.pop_back();
                    irp.unqueue();
                    error!("{}: failed to start queue worker: {e}", self.shared.device);
                    return Err(Error::new(
                        ErrorKind::Other,
                        "failed to start queue worker thread",
                    ));
                }
            }
        }

        Ok(())
    }

    /// Submit a packet that the caller is about to wait for.
    ///
    /// On the worker thread that wait could never end, so it is refused.
    pub(crate) fn submit_for_wait(&self, request: impl Into<Request>) -> Result<(), Error> {
        if self.shared.lock().worker == Some(thread::current().id()) {
            return Err(Error::new(
                ErrorKind::Busy,
                "cannot wait for a packet on the queue's own worker thread",
            )
            .log_error());
        }
        self.submit(request)
    }

    /// Discard all packets that have not started, and wait for the packet in
    /// progress (if any) to finish.
    ///
    /// Discarded packets are never completed. New submissions fail with
    /// [`ErrorKind::Aborted`] until the worker goes idle.
    ///
    /// The packets are discarded immediately; waiting for the worker happens
    /// with `.wait()` or `.await`. When called from the worker thread, for
    /// example in the on-finish callback, there is nothing to wait for.
    pub fn abort(&self) -> impl MaybeFuture<Output = ()> {
        let (wait_for, on_worker) = {
            let mut state = self.shared.lock();
            let discarded = state.pending.len();
            for request in state.pending.drain(..) {
                request.irp().unqueue();
            }

            if state.running {
                state.aborting = true;
            }

            let on_worker = state.worker == Some(thread::current().id());
            debug!(
                "{}: abort discarded {discarded} packets, worker {}",
                self.shared.device,
                if state.running { "running" } else { "idle" }
            );
            (state.idle_count, on_worker)
        };

        let shared = self.shared.clone();
        Blocking::new(move || {
            if !on_worker {
                shared.wait_idle(wait_for);
            }
        })
    }

    /// Whether packets are queued or in progress.
    pub fn is_busy(&self) -> bool {
        let state = self.shared.lock();
        state.running || !state.pending.is_empty()
    }

    /// Number of packets waiting to start, not counting one in progress.
    pub fn pending(&self) -> usize {
        self.shared.lock().pending.len()
    }
}

impl Debug for IrpQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("IrpQueue")
            .field("device", &self.shared.device)
            .field("pending", &state.pending.len())
            .field("running", &state.running)
            .field("aborting", &state.aborting)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap()
    }

    fn run(&self) {
        debug!("{}: queue worker started", self.device);

        loop {
            let request = {
                let mut state = self.lock();
                match state.pending.pop_front() {
                    Some(request) => request,
                    None => {
                        state.running = false;
                        state.aborting = false;
                        state.worker = None;
                        state.idle_count += 1;
                        self.idle.notify_all();
                        debug!("{}: queue empty, worker exiting", self.device);
                        return;
                    }
                }
            };

            self.process(&request);
            request.irp().complete_from_queue();
            self.finish(&request);
        }
    }

    fn process(&self, request: &Request) {
        let irp = request.irp();
        let mut buf = irp.transfer_buffer();

        let result = catch_unwind(AssertUnwindSafe(|| match request {
            Request::Control(c) => {
                let setup = c.setup();
                self.transport.control_transfer(
                    setup.request_type.as_byte(),
                    setup.request,
                    setup.value,
                    setup.index,
                    &mut buf,
                    self.transfer_timeout,
                )
            }
            Request::Endpoint { endpoint, .. } => {
                self.transport
                    .endpoint_transfer(*endpoint, &mut buf, self.transfer_timeout)
            }
        }))
        .unwrap_or_else(|e| {
            error!(
                "{}: transport panicked: {}",
                self.device,
                panic_message(e.as_ref())
            );
            Err(TransferError::Fault)
        });

        irp.store_result(&buf, result);

        match irp.error() {
            None => debug!(
                "{}: transferred {} of {} bytes",
                self.device,
                irp.actual_length(),
                irp.length()
            ),
            Some(e) => debug!("{}: transfer failed: {e}", self.device),
        }
    }

    fn finish(&self, request: &Request) {
        let Some(on_finish) = &self.on_finish else {
            return;
        };

        if let Err(e) = catch_unwind(AssertUnwindSafe(|| on_finish(&self.device, request))) {
            error!(
                "{}: on-finish callback panicked: {}",
                self.device,
                panic_message(e.as_ref())
            );
        }
    }

    fn wait_idle(&self, idle_count: u64) {
        let mut state = self.lock();
        while state.running && state.idle_count == idle_count {
            state = self.idle.wait(state).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::transfer::{ControlType, Direction, Recipient, RequestType};

    struct Echo;

    impl Transport for Echo {
        fn control_transfer(
            &self,
            _request_type: u8,
            request: u8,
            _value: u16,
            _index: u16,
            buf: &mut [u8],
            _timeout: Duration,
        ) -> Result<i32, TransferError> {
            buf.fill(request);
            Ok(buf.len() as i32)
        }
    }

    fn control(request: u8, length: usize) -> ControlIrp {
        let c = ControlIrp::new(
            RequestType::new(Direction::In, ControlType::Vendor, Recipient::Device),
            request,
            0,
            0,
        );
        c.set_data(&vec![0; length]).unwrap();
        c
    }

    fn queue(config: QueueConfig) -> IrpQueue {
        IrpQueue::new(DeviceId::new(1, 2), Arc::new(Echo), config).unwrap()
    }

    #[test]
    fn zero_timeout_rejected() {
        let err = IrpQueue::new(
            DeviceId::new(1, 2),
            Arc::new(Echo),
            QueueConfig::new().transfer_timeout(Duration::ZERO),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn submit_and_complete() {
        let q = queue(QueueConfig::new());
        let c = control(0x5A, 4);
        q.submit(c.clone()).unwrap();
        assert!(c.wait_until_complete_timeout(Duration::from_secs(5)));
        assert_eq!(c.status().unwrap(), [0x5A; 4]);
        assert_eq!(c.actual_length(), 4);

        // a complete packet must be reset before it is submitted again
        assert_eq!(
            q.submit(c.clone()).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        c.reset().unwrap();
        q.submit(c.clone()).unwrap();
        c.completion().wait();
    }

    #[test]
    fn callback_panic_does_not_stop_queue() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let q = queue(QueueConfig::new().on_finish(move |device, _| {
            assert_eq!(device, &DeviceId::new(1, 2));
            if calls2.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("callback failure");
            }
        }));

        let a = control(1, 1);
        let b = control(2, 1);
        q.submit(a.clone()).unwrap();
        q.submit(b.clone()).unwrap();
        b.wait_until_complete();
        q.abort().wait();
        assert!(a.is_complete());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!q.is_busy());
    }

    #[test]
    fn endpoint_unsupported_by_default() {
        let q = queue(QueueConfig::new());
        let irp = Irp::with_length(8);
        q.submit(Request::Endpoint {
            endpoint: EndpointAddress::from_byte(0x81),
            irp: irp.clone(),
        })
        .unwrap();
        irp.wait_until_complete();
        assert_eq!(irp.error(), Some(TransferError::Unsupported));
    }

    #[test]
    fn oversized_control_rejected() {
        let q = queue(QueueConfig::new());
        let c = control(1, 0x10000);
        assert_eq!(q.submit(c).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert!(!q.is_busy());
    }
}
