//! Transfer lifecycle tests
//!
//! Submission, completion, cancellation and resubmission through a session
//! backed by the mock transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use usb_session::test_utils::MockTransport;
use usb_session::{
    ControlSetup, DeviceToken, Error, Session, Transfer, TransferId, TransferKind, TransferState,
    TransferStatus,
};

const DEV: DeviceToken = DeviceToken(1);
const PASS: Option<Duration> = Some(Duration::from_millis(200));

#[derive(Debug, Clone, PartialEq, Eq)]
struct Finished {
    id: TransferId,
    state: TransferState,
    status: Option<TransferStatus>,
    actual_length: usize,
    data: Vec<u8>,
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Finished>>>);

impl Recorder {
    fn callback(&self) -> impl Fn(Transfer) + Send + Sync + 'static {
        let seen = self.0.clone();
        move |t: Transfer| {
            seen.lock().unwrap().push(Finished {
                id: t.id(),
                state: t.state(),
                status: t.status(),
                actual_length: t.actual_length(),
                data: t.data().to_vec(),
            })
        }
    }

    fn finished(&self) -> Vec<Finished> {
        self.0.lock().unwrap().clone()
    }
}

fn setup() -> (Arc<MockTransport>, Session) {
    let mock = Arc::new(MockTransport::new());
    let session = Session::new(mock.clone());
    (mock, session)
}

#[test]
fn test_bulk_in_completes_with_data() {
    let (mock, session) = setup();
    let recorder = Recorder::default();

    let transfer = session
        .bulk_transfer(DEV, 0x81, 4)
        .timeout(Duration::from_millis(100))
        .callback(recorder.callback())
        .build()
        .unwrap();
    let id = session.submit(transfer).unwrap();

    let submitted = mock.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].endpoint.0, 0x81);
    assert_eq!(submitted[0].length, 4);
    assert_eq!(submitted[0].timeout, Some(Duration::from_millis(100)));

    assert!(mock.complete_with_data(id, &[0xde, 0xad, 0xbe, 0xef]));
    assert_eq!(session.handle_events(PASS).unwrap(), 1);

    assert_eq!(
        recorder.finished(),
        vec![Finished {
            id,
            state: TransferState::Completed,
            status: Some(TransferStatus::Completed),
            actual_length: 4,
            data: vec![0xde, 0xad, 0xbe, 0xef],
        }]
    );
    assert_eq!(session.pending_transfers(), 0);
}

#[test]
fn test_bulk_in_times_out() {
    let (_mock, session) = setup();
    let recorder = Recorder::default();

    let transfer = session
        .bulk_transfer(DEV, 0x81, 4)
        .timeout(Duration::from_millis(100))
        .callback(recorder.callback())
        .build()
        .unwrap();
    session.submit(transfer).unwrap();

    let started = Instant::now();
    // The wait is bounded by the transfer deadline, not the 5s argument
    session.handle_events(Some(Duration::from_secs(5))).unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    let finished = recorder.finished();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].state, TransferState::TimedOut);
    assert_eq!(finished[0].status, Some(TransferStatus::TimedOut));
    assert_eq!(finished[0].actual_length, 0);
}

#[test]
fn test_short_completion_reports_actual_length() {
    let (mock, session) = setup();
    let recorder = Recorder::default();

    let transfer = session
        .interrupt_transfer(DEV, 0x83, 8)
        .callback(recorder.callback())
        .build()
        .unwrap();
    let id = session.submit(transfer).unwrap();

    mock.complete_with_data(id, &[1, 2, 3]);
    session.handle_events(PASS).unwrap();

    let finished = recorder.finished();
    assert_eq!(finished[0].actual_length, 3);
    assert_eq!(finished[0].data, vec![1, 2, 3]);
}

#[test]
fn test_bulk_out_sends_payload() {
    let (mock, session) = setup();
    let transfer = session
        .bulk_transfer(DEV, 0x02, 0)
        .data(vec![9, 8, 7])
        .build()
        .unwrap();
    session.submit(transfer).unwrap();

    let submitted = mock.submitted();
    assert_eq!(submitted[0].kind, TransferKind::Bulk);
    assert_eq!(submitted[0].data, vec![9, 8, 7]);
}

#[test]
fn test_control_in_data_follows_setup() {
    let (mock, session) = setup();
    let recorder = Recorder::default();
    let setup = ControlSetup {
        request_type: 0x80,
        request: 0x06,
        value: 0x0100,
        index: 0,
        length: 18,
    };

    let transfer = session
        .control_transfer(DEV, setup)
        .callback(recorder.callback())
        .build()
        .unwrap();
    let id = session.submit(transfer).unwrap();

    let submitted = mock.submitted();
    assert_eq!(submitted[0].length, 8 + 18);
    assert_eq!(&submitted[0].data[..8], &setup.to_bytes());

    let descriptor = [0x12, 0x01, 0x00, 0x02];
    mock.complete_with_data(id, &descriptor);
    session.handle_events(PASS).unwrap();

    let finished = recorder.finished();
    assert_eq!(finished[0].actual_length, 4);
    assert_eq!(finished[0].data, descriptor.to_vec());
}

#[test]
fn test_iso_packets_reported() {
    let (mock, session) = setup();
    let packets = Arc::new(Mutex::new(Vec::new()));

    let seen = packets.clone();
    let transfer = session
        .iso_transfer(DEV, 0x84, vec![192, 192, 192])
        .callback(move |t| seen.lock().unwrap().extend_from_slice(t.iso_packets()))
        .build()
        .unwrap();
    let id = session.submit(transfer).unwrap();

    mock.complete_iso(
        id,
        &[
            (192, TransferStatus::Completed),
            (100, TransferStatus::Completed),
            (0, TransferStatus::Errored),
        ],
    );
    session.handle_events(PASS).unwrap();

    let packets = packets.lock().unwrap();
    assert_eq!(packets.len(), 3);
    assert_eq!(packets[1].actual_length, 100);
    assert_eq!(packets[2].status, Some(TransferStatus::Errored));
}

#[test]
fn test_cancel_reports_cancelled() {
    let (_mock, session) = setup();
    let recorder = Recorder::default();

    let transfer = session
        .bulk_transfer(DEV, 0x81, 64)
        .callback(recorder.callback())
        .build()
        .unwrap();
    let id = session.submit(transfer).unwrap();

    session.cancel(id).unwrap();
    session.handle_events(PASS).unwrap();

    let finished = recorder.finished();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].state, TransferState::Cancelled);
    assert_eq!(finished[0].status, Some(TransferStatus::Cancelled));
}

#[test]
fn test_completion_wins_cancel_race() {
    let (mock, session) = setup();
    mock.set_auto_confirm_cancel(false);
    let recorder = Recorder::default();

    let transfer = session
        .bulk_transfer(DEV, 0x81, 4)
        .callback(recorder.callback())
        .build()
        .unwrap();
    let id = session.submit(transfer).unwrap();

    session.cancel(id).unwrap();
    assert_eq!(mock.cancel_requests(), vec![id]);

    // The transfer finished before the cancellation took effect
    mock.complete(id, 4);
    session.handle_events(PASS).unwrap();

    let finished = recorder.finished();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].status, Some(TransferStatus::Completed));
    assert_eq!(finished[0].actual_length, 4);
}

#[test]
fn test_cancel_after_completion_is_noop() {
    let (mock, session) = setup();
    let recorder = Recorder::default();

    let transfer = session
        .bulk_transfer(DEV, 0x81, 4)
        .callback(recorder.callback())
        .build()
        .unwrap();
    let id = session.submit(transfer).unwrap();
    mock.complete(id, 4);
    session.handle_events(PASS).unwrap();

    session.cancel(id).unwrap();
    assert_eq!(session.handle_events(Some(Duration::from_millis(10))).unwrap(), 0);
    assert_eq!(recorder.finished().len(), 1);
    assert!(mock.cancel_requests().is_empty());
}

#[test]
fn test_every_transfer_finishes_exactly_once() {
    let (mock, session) = setup();
    let recorder = Recorder::default();

    let ids: Vec<TransferId> = (0..10)
        .map(|_| {
            let transfer = session
                .bulk_transfer(DEV, 0x81, 16)
                .callback(recorder.callback())
                .build()
                .unwrap();
            session.submit(transfer).unwrap()
        })
        .collect();

    for (i, &id) in ids.iter().enumerate() {
        match i % 3 {
            0 => assert!(mock.complete(id, 16)),
            1 => session.cancel(id).unwrap(),
            _ => assert!(mock.complete_with_status(id, TransferStatus::Stall, 0)),
        }
    }
    // Late duplicates for already reported ids change nothing
    assert!(!mock.complete(ids[0], 16));
    session.handle_events(PASS).unwrap();

    let mut seen: Vec<TransferId> = recorder.finished().iter().map(|f| f.id).collect();
    seen.sort();
    assert_eq!(seen, ids);
    assert_eq!(session.pending_transfers(), 0);

    let states: Vec<TransferState> = recorder.finished().iter().map(|f| f.state).collect();
    assert!(states.contains(&TransferState::Errored));
    assert!(states.iter().all(|s| s.is_terminal()));
}

#[test]
fn test_refused_submission_returns_transfer() {
    let (mock, session) = setup();
    mock.set_submit_error(Some(Error::NoDevice));

    let transfer = session.bulk_transfer(DEV, 0x81, 4).build().unwrap();
    let original_id = transfer.id();

    let err = session.submit(transfer).unwrap_err();
    assert_eq!(err.error, Error::NoDevice);
    assert_eq!(err.transfer.id(), original_id);
    assert_eq!(session.pending_transfers(), 0);

    // The same transfer can be submitted once the device is back
    mock.set_submit_error(None);
    assert_eq!(session.submit(err.transfer).unwrap(), original_id);
}

#[test]
fn test_freed_transfer_rejected() {
    let (mock, session) = setup();
    let mut transfer = session.bulk_transfer(DEV, 0x81, 4).build().unwrap();
    transfer.free().unwrap();

    let err = session.submit(transfer).unwrap_err();
    assert!(matches!(err.error, Error::InvalidState(_)));
    assert!(mock.submitted().is_empty());
}

#[test]
fn test_unconfigured_transfer_rejected() {
    let (_mock, session) = setup();
    let err = session.submit(Transfer::alloc(0)).unwrap_err();
    assert!(matches!(err.error, Error::InvalidArgument(_)));
}

#[test]
fn test_completed_transfer_resubmitted_from_callback() {
    let (mock, session) = setup();
    let rounds = Arc::new(AtomicUsize::new(0));

    let resubmit = session.clone();
    let counter = rounds.clone();
    let transfer = session
        .interrupt_transfer(DEV, 0x81, 8)
        .callback(move |t| {
            let round = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if t.status() == Some(TransferStatus::Completed) && round < 3 {
                resubmit.submit(t).unwrap();
            }
        })
        .build()
        .unwrap();
    let first = session.submit(transfer).unwrap();

    for _ in 0..3 {
        let pending = mock.pending_ids();
        assert_eq!(pending, vec![first], "the same transfer is re-armed");
        mock.complete(first, 8);
        session.handle_events(PASS).unwrap();
    }

    assert_eq!(rounds.load(Ordering::SeqCst), 3);
    assert_eq!(session.pending_transfers(), 0);
    assert_eq!(mock.submitted().len(), 3);
    session.close();
}

#[test]
fn test_panicking_callback_does_not_affect_others() {
    let (mock, session) = setup();
    let recorder = Recorder::default();

    let bad = session
        .bulk_transfer(DEV, 0x81, 4)
        .callback(|_| panic!("broken completion handler"))
        .build()
        .unwrap();
    let good = session
        .bulk_transfer(DEV, 0x82, 4)
        .callback(recorder.callback())
        .build()
        .unwrap();
    let bad = session.submit(bad).unwrap();
    let good = session.submit(good).unwrap();

    mock.complete(bad, 4);
    mock.complete(good, 4);
    assert_eq!(session.handle_events(PASS).unwrap(), 2);

    let finished = recorder.finished();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].id, good);
    assert_eq!(session.pending_transfers(), 0);
}
