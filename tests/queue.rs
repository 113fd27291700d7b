use std::{
    collections::HashMap,
    sync::{mpsc, Arc, Mutex, OnceLock},
    thread,
    time::Duration,
};

use usbirp::{
    transfer::{
        ControlIrp, ControlType, Direction, IrpQueue, QueueConfig, Recipient, Request,
        RequestType, TransferError,
    },
    DeviceId, ErrorKind, MaybeFuture,
};

mod common;
use common::{init_logger, Response, ScriptedTransport};

fn control_in(request: u8, value: u16, length: usize) -> ControlIrp {
    let irp = ControlIrp::new(
        RequestType::new(Direction::In, ControlType::Vendor, Recipient::Device),
        request,
        value,
        0,
    );
    irp.set_data(&vec![0; length]).unwrap();
    irp
}

fn recorder() -> (Arc<Mutex<Vec<u16>>>, QueueConfig) {
    let finished = Arc::new(Mutex::new(Vec::new()));
    let f = finished.clone();
    let config = QueueConfig::new().on_finish(move |_, request| {
        if let Request::Control(c) = request {
            f.lock().unwrap().push(c.value());
        }
    });
    (finished, config)
}

#[test]
fn single_producer_fifo() {
    init_logger();
    let transport = Arc::new(ScriptedTransport::new([]));
    let (finished, config) = recorder();
    let queue = IrpQueue::new(DeviceId::new(1, 1), transport.clone(), config).unwrap();

    let irps: Vec<_> = (0..10).map(|i| control_in(0x01, i, 4)).collect();
    for irp in &irps {
        queue.submit(irp.clone()).unwrap();
    }
    for irp in &irps {
        irp.wait_until_complete();
    }
    queue.abort().wait();

    let values: Vec<u16> = transport.calls().iter().map(|c| c.value).collect();
    assert_eq!(values, (0..10).collect::<Vec<_>>());
    assert_eq!(*finished.lock().unwrap(), values);
}

#[test]
fn concurrent_producers_single_worker() {
    init_logger();
    let transport = Arc::new(ScriptedTransport::new([]).with_delay(Duration::from_micros(200)));
    let (finished, config) = recorder();
    let queue = IrpQueue::new(
        DeviceId::new(1, 2),
        transport.clone(),
        config.thread_name("irp-worker-test"),
    )
    .unwrap();

    let producers: Vec<_> = (0..4u16)
        .map(|p| {
            let queue = queue.clone();
            thread::spawn(move || {
                let irps: Vec<_> = (0..25u16)
                    .map(|i| control_in(0x02, (p << 8) | i, 8))
                    .collect();
                for irp in &irps {
                    queue.submit(irp.clone()).unwrap();
                }
                irps
            })
        })
        .collect();

    let irps: Vec<_> = producers
        .into_iter()
        .flat_map(|p| p.join().unwrap())
        .collect();
    for irp in &irps {
        assert!(irp.wait_until_complete_timeout(Duration::from_secs(10)));
        assert_eq!(irp.status().unwrap(), vec![0x02; 8]);
    }
    queue.abort().wait();

    assert_eq!(transport.max_active(), 1);
    let calls = transport.calls();
    assert_eq!(calls.len(), 100);
    assert!(calls
        .iter()
        .all(|c| c.thread_name.as_deref() == Some("irp-worker-test")));

    // each producer's packets run in the order it submitted them
    let mut last: HashMap<u16, u16> = HashMap::new();
    for c in &calls {
        let (p, i) = (c.value >> 8, c.value & 0xFF);
        if let Some(prev) = last.insert(p, i) {
            assert!(i > prev, "producer {p}: {i} ran after {prev}");
        }
    }

    let values: Vec<u16> = calls.iter().map(|c| c.value).collect();
    assert_eq!(*finished.lock().unwrap(), values);
}

#[test]
fn short_packet_policy() {
    init_logger();
    let transport = Arc::new(ScriptedTransport::new([
        Response::Data(vec![0xAB; 32]),
        Response::Data(vec![0xCD; 32]),
    ]));
    let queue = IrpQueue::new(DeviceId::new(1, 3), transport, QueueConfig::new()).unwrap();

    let strict = control_in(0x03, 0, 64);
    strict.set_accept_short_packet(false).unwrap();
    queue.submit(strict.clone()).unwrap();
    strict.wait_until_complete();
    assert_eq!(
        strict.error(),
        Some(TransferError::ShortPacket {
            requested: 64,
            actual: 32
        })
    );
    assert_eq!(strict.actual_length(), 32);

    let lenient = control_in(0x03, 1, 64);
    assert!(lenient.accept_short_packet());
    queue.submit(lenient.clone()).unwrap();
    lenient.wait_until_complete();
    assert_eq!(lenient.error(), None);
    assert_eq!(lenient.actual_length(), 32);

    let data = lenient.data();
    assert_eq!(&data[..32], &[0xCD; 32]);
    assert_eq!(&data[32..], &[0; 32]);
}

#[test]
fn transfer_range_is_sent_and_filled() {
    init_logger();
    let transport = Arc::new(ScriptedTransport::new([Response::Data(vec![7, 8])]));
    let queue = IrpQueue::new(DeviceId::new(1, 3), transport.clone(), QueueConfig::new()).unwrap();

    let irp = control_in(0x04, 0, 0);
    irp.set_data_range(&[1, 2, 3, 4, 5], 1, 2).unwrap();
    queue.submit(irp.clone()).unwrap();
    irp.wait_until_complete();

    assert_eq!(transport.calls()[0].length, 2);
    assert_eq!(irp.data(), [1, 7, 8, 4, 5]);
    assert_eq!(irp.status().unwrap(), [7, 8]);
}

#[test]
fn transport_errors_do_not_stop_queue() {
    init_logger();
    let transport = Arc::new(ScriptedTransport::new([
        Response::Fail(TransferError::Stall),
        Response::Status(-110),
        Response::Status(-5),
        Response::Status(9),
    ]));
    let (finished, config) = recorder();
    let queue = IrpQueue::new(DeviceId::new(2, 1), transport, config).unwrap();

    let irps: Vec<_> = (0..5).map(|i| control_in(0x05, i, 8)).collect();
    for irp in &irps {
        queue.submit(irp.clone()).unwrap();
    }
    for irp in &irps {
        irp.wait_until_complete();
    }
    queue.abort().wait();

    let errors: Vec<_> = irps.iter().map(|i| i.error()).collect();
    assert_eq!(
        errors,
        vec![
            Some(TransferError::Stall),
            Some(TransferError::Timeout),
            Some(TransferError::Transport(-5)),
            Some(TransferError::Fault),
            None,
        ]
    );
    assert_eq!(finished.lock().unwrap().len(), 5);
}

#[test]
fn abort_discards_pending() {
    init_logger();
    let (release, hold) = mpsc::channel();
    let transport = Arc::new(ScriptedTransport::new([Response::Hold(hold)]));
    let (started_tx, started) = mpsc::channel();
    transport.notify_started(started_tx);

    let (finished, config) = recorder();
    let queue = IrpQueue::new(DeviceId::new(3, 1), transport.clone(), config).unwrap();

    let irps: Vec<_> = (0..5).map(|i| control_in(0x06, i, 2)).collect();
    for irp in &irps {
        queue.submit(irp.clone()).unwrap();
    }

    // first packet is now blocked in the transport
    assert_eq!(started.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
    assert_eq!(queue.pending(), 4);

    let abort = queue.abort();
    assert_eq!(queue.pending(), 0);
    assert!(queue.is_busy());

    let late = control_in(0x06, 99, 2);
    assert_eq!(
        queue.submit(late.clone()).unwrap_err().kind(),
        ErrorKind::Aborted
    );

    release.send(()).unwrap();
    abort.wait();

    assert!(!queue.is_busy());
    assert!(irps[0].is_complete());
    assert_eq!(irps[0].error(), None);
    for irp in &irps[1..] {
        assert!(!irp.is_complete());
        assert!(!irp.wait_until_complete_timeout(Duration::from_millis(10)));
    }
    assert_eq!(*finished.lock().unwrap(), vec![0]);
    assert_eq!(transport.calls().len(), 1);

    // the queue accepts work again, including packets that were discarded
    queue.submit(late.clone()).unwrap();
    queue.submit(irps[1].clone()).unwrap();
    irps[1].wait_until_complete();
    assert!(late.is_complete());
}

#[test]
fn abort_idle_queue_returns_immediately() {
    let queue = IrpQueue::new(
        DeviceId::new(3, 2),
        Arc::new(ScriptedTransport::new([])),
        QueueConfig::new(),
    )
    .unwrap();
    queue.abort().wait();
    assert!(!queue.is_busy());

    let irp = control_in(0x07, 0, 1);
    queue.submit(irp.clone()).unwrap();
    irp.wait_until_complete();
}

#[test]
fn abort_from_callback() {
    init_logger();
    let transport = Arc::new(ScriptedTransport::new([]).with_delay(Duration::from_millis(5)));
    let queue_slot: Arc<OnceLock<IrpQueue>> = Arc::new(OnceLock::new());
    let slot = queue_slot.clone();

    let config = QueueConfig::new().on_finish(move |_, request| {
        if let Request::Control(c) = request {
            if c.value() == 0 {
                slot.get().unwrap().abort().wait();
            }
        }
    });
    let queue = IrpQueue::new(DeviceId::new(3, 3), transport.clone(), config).unwrap();
    queue_slot.set(queue.clone()).unwrap();

    let irps: Vec<_> = (0..3).map(|i| control_in(0x08, i, 1)).collect();
    for irp in &irps {
        queue.submit(irp.clone()).unwrap();
    }

    irps[0].wait_until_complete();
    queue.abort().wait();
    assert!(!queue.is_busy());
    assert_eq!(transport.calls().len(), 1);
    assert!(!irps[1].is_complete());
    assert!(!irps[2].is_complete());
}

#[test]
fn duplicate_submission_rejected() {
    let (release, hold) = mpsc::channel();
    let transport = Arc::new(ScriptedTransport::new([Response::Hold(hold)]));
    let queue = IrpQueue::new(DeviceId::new(4, 1), transport, QueueConfig::new()).unwrap();

    let irp = control_in(0x09, 0, 1);
    queue.submit(irp.clone()).unwrap();
    assert_eq!(
        queue.submit(irp.clone()).unwrap_err().kind(),
        ErrorKind::Busy
    );

    release.send(()).unwrap();
    irp.wait_until_complete();
    queue.abort().wait();
}

#[test]
fn early_completion_keeps_packet_queued() {
    init_logger();
    let (release, hold) = mpsc::channel();
    let transport = Arc::new(ScriptedTransport::new([Response::Hold(hold)]));
    let (started_tx, started) = mpsc::channel();
    transport.notify_started(started_tx);
    let (finished, config) = recorder();
    let queue = IrpQueue::new(DeviceId::new(4, 2), transport.clone(), config).unwrap();

    let a = control_in(0x0B, 0, 1);
    let b = control_in(0x0B, 1, 1);
    let c = control_in(0x0B, 2, 1);
    queue.submit(a.clone()).unwrap();
    assert_eq!(started.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
    queue.submit(b.clone()).unwrap();

    // the caller completes `b` while it is still waiting in the queue
    b.complete();
    assert_eq!(b.reset().unwrap_err().kind(), ErrorKind::Busy);
    assert_eq!(
        queue.submit(b.clone()).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    assert_eq!(queue.pending(), 1);

    queue.submit(c.clone()).unwrap();
    release.send(()).unwrap();
    c.wait_until_complete();
    queue.abort().wait();

    assert_eq!(transport.calls().len(), 3);
    assert_eq!(*finished.lock().unwrap(), vec![0, 1, 2]);
    b.reset().unwrap();
}

#[pollster::test]
async fn completion_can_be_awaited() {
    let transport = Arc::new(ScriptedTransport::new([Response::Data(vec![1, 2, 3])]));
    let queue = IrpQueue::new(DeviceId::new(5, 1), transport, QueueConfig::new()).unwrap();

    let irp = control_in(0x0A, 0, 3);
    queue.submit(irp.clone()).unwrap();
    irp.completion().await;
    assert_eq!(irp.status().unwrap(), [1, 2, 3]);
}
