use std::{
    fmt::Debug,
    future::Future,
    ops::Deref,
    pin::Pin,
    mem,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    task::{Context, Poll, Waker},
    time::Duration,
};

use super::{ControlIn, ControlOut, ControlSetup, RequestType, TransferError};
use crate::{Error, ErrorKind, MaybeFuture};

struct IrpState {
    data: Vec<u8>,
    offset: usize,
    length: usize,
    actual_length: usize,
    accept_short_packet: bool,
    complete: bool,
    error: Option<TransferError>,

    /// Set while the packet sits in a queue or is being processed. Only the
    /// queue clears it.
    queued: bool,

    /// Async tasks waiting for completion.
    wakers: Vec<Waker>,
}

struct IrpInner {
    state: Mutex<IrpState>,
    completed: Condvar,
}

/// An I/O request packet: a data buffer plus the status of its transfer.
///
/// `Irp` is a handle; clones refer to the same packet. The submitter keeps a
/// clone to wait for completion and read the result while the queue's worker
/// thread fills it in.
///
/// The buffer is always copied in and out, so changing the slice passed to
/// [`set_data`][Self::set_data] or the vector returned by [`data`][Self::data]
/// never affects the packet.
#[derive(Clone)]
pub struct Irp {
    inner: Arc<IrpInner>,
}

impl Irp {
    /// Create a packet with an empty buffer.
    pub fn new() -> Irp {
        Irp::with_data(&[])
    }

    /// Create a packet holding a copy of `data`, for an OUT transfer.
    pub fn with_data(data: &[u8]) -> Irp {
        Irp {
            inner: Arc::new(IrpInner {
                state: Mutex::new(IrpState {
                    data: data.to_vec(),
                    offset: 0,
                    length: data.len(),
                    actual_length: 0,
                    accept_short_packet: true,
                    complete: false,
                    error: None,
                    queued: false,
                    wakers: Vec::new(),
                }),
                completed: Condvar::new(),
            }),
        }
    }

    /// Create a packet with a zero-filled buffer of `length` bytes, for an IN transfer.
    pub fn with_length(length: usize) -> Irp {
        Irp::with_data(&vec![0; length])
    }

    fn state(&self) -> MutexGuard<'_, IrpState> {
        self.inner.state.lock().unwrap()
    }

    /// Lock the state for a caller-side change, which is refused while the
    /// queue owns the packet.
    fn state_for_update(&self) -> Result<MutexGuard<'_, IrpState>, Error> {
        let state = self.state();
        if state.queued {
            return Err(Error::new(ErrorKind::Busy, "packet is queued"));
        }
        Ok(state)
    }

    /// Replace the buffer with a copy of `data` and transfer all of it.
    ///
    /// Fails with [`ErrorKind::Busy`] if the packet is queued.
    pub fn set_data(&self, data: &[u8]) -> Result<(), Error> {
        let mut state = self.state_for_update()?;
        state.data = data.to_vec();
        state.offset = 0;
        state.length = data.len();
        Ok(())
    }

    /// Replace the buffer with a copy of `data` and transfer `length` bytes starting at `offset`.
    ///
    /// Fails with [`ErrorKind::InvalidArgument`] if the range does not fit in
    /// `data`, or [`ErrorKind::Busy`] if the packet is queued.
    pub fn set_data_range(&self, data: &[u8], offset: usize, length: usize) -> Result<(), Error> {
        if offset.checked_add(length).map_or(true, |end| end > data.len()) {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "data range exceeds buffer length",
            ));
        }

        let mut state = self.state_for_update()?;
        state.data = data.to_vec();
        state.offset = offset;
        state.length = length;
        Ok(())
    }

    /// Get a copy of the whole buffer.
    pub fn data(&self) -> Vec<u8> {
        self.state().data.clone()
    }

    /// Offset of the transferred range within the buffer.
    pub fn offset(&self) -> usize {
        self.state().offset
    }

    /// Number of bytes to transfer.
    pub fn length(&self) -> usize {
        self.state().length
    }

    /// Number of bytes actually transferred.
    pub fn actual_length(&self) -> usize {
        self.state().actual_length
    }

    /// Record the number of bytes actually transferred.
    ///
    /// Fails with [`ErrorKind::InvalidArgument`] if `n` exceeds [`length`][Self::length],
    /// or [`ErrorKind::Busy`] if the packet is queued.
    pub fn set_actual_length(&self, n: usize) -> Result<(), Error> {
        let mut state = self.state_for_update()?;
        if n > state.length {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "actual length exceeds requested length",
            ));
        }
        state.actual_length = n;
        Ok(())
    }

    /// Whether a transfer shorter than [`length`][Self::length] counts as success.
    ///
    /// Defaults to `true`.
    pub fn accept_short_packet(&self) -> bool {
        self.state().accept_short_packet
    }

    /// Set whether a transfer shorter than [`length`][Self::length] counts as success.
    ///
    /// Fails with [`ErrorKind::Busy`] if the packet is queued.
    pub fn set_accept_short_packet(&self, accept: bool) -> Result<(), Error> {
        self.state_for_update()?.accept_short_packet = accept;
        Ok(())
    }

    /// Error attached when the transfer failed.
    pub fn error(&self) -> Option<TransferError> {
        self.state().error
    }

    /// Attach an error to the packet.
    ///
    /// Fails with [`ErrorKind::Busy`] if the packet is queued.
    pub fn set_error(&self, error: TransferError) -> Result<(), Error> {
        self.state_for_update()?.error = Some(error);
        Ok(())
    }

    /// Get the transfer result: `Ok` with the transferred bytes, or the attached error.
    pub fn status(&self) -> Result<Vec<u8>, TransferError> {
        let state = self.state();
        match state.error {
            Some(e) => Err(e),
            None => Ok(state
                .data
                .get(state.offset..state.offset + state.actual_length)
                .unwrap_or_default()
                .to_vec()),
        }
    }

    /// Whether the packet has completed.
    pub fn is_complete(&self) -> bool {
        self.state().complete
    }

    /// Mark the packet complete and wake everything waiting on it.
    ///
    /// Calling this again has no effect. A queued packet stays queued until
    /// the worker has processed it.
    pub fn complete(&self) {
        let state = self.state();
        self.set_complete(state);
    }

    fn set_complete(&self, mut state: MutexGuard<'_, IrpState>) {
        if state.complete {
            return;
        }
        state.complete = true;
        let wakers = mem::take(&mut state.wakers);
        drop(state);

        self.inner.completed.notify_all();
        for waker in wakers {
            waker.wake();
        }
    }

    /// Clear the completion flag, error and actual length so the packet can be submitted again.
    ///
    /// Fails with [`ErrorKind::Busy`] if the packet is queued.
    pub fn reset(&self) -> Result<(), Error> {
        let mut state = self.state();
        if state.queued {
            return Err(Error::new(ErrorKind::Busy, "packet is queued"));
        }
        state.complete = false;
        state.error = None;
        state.actual_length = 0;
        Ok(())
    }

    /// Block until the packet completes.
    pub fn wait_until_complete(&self) {
        let mut state = self.state();
        while !state.complete {
            state = self.inner.completed.wait(state).unwrap();
        }
    }

    /// Block until the packet completes or `timeout` elapses, and return
    /// whether it completed.
    ///
    /// A zero `timeout` waits without bound.
    pub fn wait_until_complete_timeout(&self, timeout: Duration) -> bool {
        if timeout.is_zero() {
            self.wait_until_complete();
            return true;
        }

        let state = self.state();
        let (state, _) = self
            .inner
            .completed
            .wait_timeout_while(state, timeout, |s| !s.complete)
            .unwrap();
        state.complete
    }

    /// Wait for completion with `.await` or [`MaybeFuture::wait`].
    pub fn completion(&self) -> Completion {
        Completion { irp: self.clone() }
    }

    /// Claim the packet for a queue.
    pub(crate) fn mark_queued(&self) -> Result<(), Error> {
        let mut state = self.state();
        if state.complete {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "packet already complete",
            ));
        }
        if state.queued {
            return Err(Error::new(ErrorKind::Busy, "packet already queued"));
        }
        state.queued = true;
        Ok(())
    }

    /// Release a packet discarded from a queue without completing it.
    pub(crate) fn unqueue(&self) {
        self.state().queued = false;
    }

    /// Release a processed packet from its queue and complete it.
    pub(crate) fn complete_from_queue(&self) {
        let mut state = self.state();
        state.queued = false;
        self.set_complete(state);
    }

    /// Copy of the range to transfer.
    pub(crate) fn transfer_buffer(&self) -> Vec<u8> {
        let state = self.state();
        state.data[state.offset..state.offset + state.length].to_vec()
    }

    /// Store the outcome of a transport call made with `buf` from
    /// [`transfer_buffer`][Self::transfer_buffer].
    pub(crate) fn store_result(&self, buf: &[u8], result: Result<i32, TransferError>) {
        let mut state = self.state();
        let n = match result {
            Ok(n) if n < 0 => {
                state.error = Some(TransferError::from_status(n));
                return;
            }
            Ok(n) => n as usize,
            Err(e) => {
                state.error = Some(e);
                return;
            }
        };

        if n > state.length || n > buf.len() || state.offset + n > state.data.len() {
            state.error = Some(TransferError::Fault);
            return;
        }

        let offset = state.offset;
        state.data[offset..offset + n].copy_from_slice(&buf[..n]);
        state.actual_length = n;

        if n != state.length && !state.accept_short_packet {
            state.error = Some(TransferError::ShortPacket {
                requested: state.length,
                actual: n,
            });
        }
    }
}

impl Default for Irp {
    fn default() -> Self {
        Irp::new()
    }
}

impl Debug for Irp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Irp")
            .field("offset", &state.offset)
            .field("length", &state.length)
            .field("actual_length", &state.actual_length)
            .field("complete", &state.complete)
            .field("error", &state.error)
            .finish_non_exhaustive()
    }
}

/// Completion of an [`Irp`].
///
/// Use `.await` in async code, or [`MaybeFuture::wait`] to block.
pub struct Completion {
    irp: Irp,
}

impl Future for Completion {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.irp.state();
        if state.complete {
            return Poll::Ready(());
        }

        state.wakers.retain(|w| !w.will_wake(cx.waker()));
        state.wakers.push(cx.waker().clone());
        Poll::Pending
    }
}

impl MaybeFuture for Completion {
    fn wait(self) {
        self.irp.wait_until_complete()
    }
}

/// A packet for a control transfer, carrying the request fields of its SETUP stage.
///
/// `wLength` comes from the packet's [`length`][Irp::length].
#[derive(Clone, Debug)]
pub struct ControlIrp {
    irp: Irp,
    setup: ControlSetup,
}

impl ControlIrp {
    /// Create a control packet with an empty buffer.
    pub fn new(request_type: RequestType, request: u8, value: u16, index: u16) -> ControlIrp {
        ControlIrp::with_setup(
            ControlSetup {
                request_type,
                request,
                value,
                index,
            },
            Irp::new(),
        )
    }

    /// Create a control packet from request fields and a data packet.
    pub fn with_setup(setup: ControlSetup, irp: Irp) -> ControlIrp {
        ControlIrp { irp, setup }
    }

    /// `bmRequestType` field.
    pub fn request_type(&self) -> RequestType {
        self.setup.request_type
    }

    /// `bRequest` field.
    pub fn request(&self) -> u8 {
        self.setup.request
    }

    /// `wValue` field.
    pub fn value(&self) -> u16 {
        self.setup.value
    }

    /// `wIndex` field.
    pub fn index(&self) -> u16 {
        self.setup.index
    }

    /// All request fields.
    pub fn setup(&self) -> ControlSetup {
        self.setup
    }

    /// The data packet.
    pub fn irp(&self) -> &Irp {
        &self.irp
    }
}

impl Deref for ControlIrp {
    type Target = Irp;

    fn deref(&self) -> &Irp {
        &self.irp
    }
}

impl From<ControlIn> for ControlIrp {
    fn from(value: ControlIn) -> Self {
        ControlIrp::with_setup(value.setup(), Irp::with_length(value.length as usize))
    }
}

impl From<ControlOut<'_>> for ControlIrp {
    fn from(value: ControlOut<'_>) -> Self {
        ControlIrp::with_setup(value.setup(), Irp::with_data(value.data))
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, thread, time::Instant};

    use super::*;
    use crate::transfer::{ControlType, Direction, Recipient};

    #[test]
    fn data_is_copied_in_and_out() {
        let mut src = vec![1, 2, 3, 4];
        let irp = Irp::with_data(&src);
        src[0] = 0xFF;
        assert_eq!(irp.data(), [1, 2, 3, 4]);

        let mut out = irp.data();
        out[1] = 0xFF;
        assert_eq!(irp.data(), [1, 2, 3, 4]);
        assert_eq!(irp.length(), 4);
    }

    #[test]
    fn data_range() {
        let irp = Irp::new();
        irp.set_data_range(&[0, 1, 2, 3, 4, 5], 2, 3).unwrap();
        assert_eq!(irp.offset(), 2);
        assert_eq!(irp.length(), 3);
        assert_eq!(irp.transfer_buffer(), [2, 3, 4]);

        let err = irp.set_data_range(&[0, 1, 2], 2, 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(
            irp.set_data_range(&[0], usize::MAX, 2).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );

        // a rejected range leaves the packet unchanged
        assert_eq!(irp.data(), [0, 1, 2, 3, 4, 5]);

        irp.set_data(&[9, 9]).unwrap();
        assert_eq!(irp.offset(), 0);
        assert_eq!(irp.length(), 2);
    }

    #[test]
    fn actual_length_bounded_by_length() {
        let irp = Irp::with_length(8);
        irp.set_actual_length(8).unwrap();
        assert_eq!(irp.actual_length(), 8);
        assert_eq!(
            irp.set_actual_length(9).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(irp.actual_length(), 8);
    }

    #[test]
    fn complete_is_idempotent_and_wakes_waiters() {
        let irp = Irp::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let irp = irp.clone();
                thread::spawn(move || irp.wait_until_complete())
            })
            .collect();

        irp.complete();
        irp.complete();
        assert!(irp.is_complete());

        for w in waiters {
            w.join().unwrap();
        }
    }

    #[test]
    fn wait_timeout() {
        let irp = Irp::new();
        let start = Instant::now();
        assert!(!irp.wait_until_complete_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));

        let irp2 = irp.clone();
        let t = thread::spawn(move || irp2.wait_until_complete_timeout(Duration::ZERO));
        thread::sleep(Duration::from_millis(10));
        irp.complete();
        assert!(t.join().unwrap());
        assert!(irp.wait_until_complete_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn completion_future() {
        let irp = Irp::new();
        let irp2 = irp.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            irp2.complete();
        });
        futures_lite::future::block_on(irp.completion());
        assert!(irp.is_complete());
        t.join().unwrap();

        // already complete
        irp.completion().wait();
    }

    #[test]
    fn mapped_completion_awaits() {
        let irp = Irp::with_data(&[1, 2]);
        let irp2 = irp.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            irp2.complete();
        });
        let len = futures_lite::future::block_on(async {
            irp.completion().map(|()| irp.length()).await
        });
        assert_eq!(len, 2);
        t.join().unwrap();
    }

    #[test]
    fn completion_wakes_every_task() {
        let irp = Irp::new();
        let (tx, rx) = mpsc::channel();
        let waiters: Vec<_> = (0..2)
            .map(|i| {
                let irp = irp.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    futures_lite::future::block_on(irp.completion());
                    tx.send(i).unwrap();
                })
            })
            .collect();

        // let both tasks register before completing
        thread::sleep(Duration::from_millis(50));
        irp.complete();

        let mut woken: Vec<i32> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        woken.sort();
        assert_eq!(woken, [0, 1]);
        for w in waiters {
            w.join().unwrap();
        }
    }

    #[test]
    fn store_result() {
        let irp = Irp::with_length(64);
        irp.set_accept_short_packet(false).unwrap();
        irp.store_result(&[0xAA; 64], Ok(32));
        assert_eq!(irp.actual_length(), 32);
        assert_eq!(
            irp.error(),
            Some(TransferError::ShortPacket {
                requested: 64,
                actual: 32
            })
        );

        let irp = Irp::with_length(64);
        irp.store_result(&[0xAA; 64], Ok(32));
        assert_eq!(irp.error(), None);
        assert_eq!(irp.status().unwrap(), vec![0xAA; 32]);

        let irp = Irp::with_length(4);
        irp.store_result(&[0; 4], Ok(-32));
        assert_eq!(irp.error(), Some(TransferError::Stall));

        let irp = Irp::with_length(4);
        irp.store_result(&[0; 4], Ok(5));
        assert_eq!(irp.error(), Some(TransferError::Fault));
    }

    #[test]
    fn queue_claim_and_reset() {
        let irp = Irp::new();
        irp.mark_queued().unwrap();
        assert_eq!(irp.mark_queued().unwrap_err().kind(), ErrorKind::Busy);
        assert_eq!(irp.reset().unwrap_err().kind(), ErrorKind::Busy);

        irp.complete();
        assert_eq!(
            irp.mark_queued().unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );

        irp.reset().unwrap();
        assert!(!irp.is_complete());
        irp.mark_queued().unwrap();

        // completing a queued packet early does not release it
        irp.complete();
        assert_eq!(irp.reset().unwrap_err().kind(), ErrorKind::Busy);
        irp.complete_from_queue();
        irp.reset().unwrap();
    }

    #[test]
    fn queued_packet_is_read_only() {
        let irp = Irp::with_length(4);
        irp.mark_queued().unwrap();

        assert_eq!(irp.set_data(&[1]).unwrap_err().kind(), ErrorKind::Busy);
        assert_eq!(
            irp.set_data_range(&[1, 2], 0, 1).unwrap_err().kind(),
            ErrorKind::Busy
        );
        assert_eq!(
            irp.set_accept_short_packet(false).unwrap_err().kind(),
            ErrorKind::Busy
        );
        assert_eq!(
            irp.set_error(TransferError::Stall).unwrap_err().kind(),
            ErrorKind::Busy
        );
        assert_eq!(irp.set_actual_length(1).unwrap_err().kind(), ErrorKind::Busy);
        assert_eq!(irp.data(), [0; 4]);
        assert!(irp.accept_short_packet());

        irp.unqueue();
        irp.set_data(&[1]).unwrap();
        assert_eq!(irp.length(), 1);
    }

    #[test]
    fn control_irp() {
        let rt = RequestType::new(Direction::In, ControlType::Standard, Recipient::Device);
        let c = ControlIrp::new(rt, 0x06, 0x0100, 0);
        assert_eq!(c.request_type().as_byte(), 0x80);
        assert_eq!(c.request(), 0x06);
        assert_eq!(c.value(), 0x0100);
        assert_eq!(c.index(), 0);
        assert_eq!(c.length(), 0);

        let c = ControlIrp::from(ControlIn {
            control_type: ControlType::Vendor,
            recipient: Recipient::Interface,
            request: 0x01,
            value: 0,
            index: 2,
            length: 16,
        });
        assert_eq!(c.request_type().as_byte(), 0xC1);
        assert_eq!(c.length(), 16);
    }
}
