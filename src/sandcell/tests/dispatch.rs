//! Dispatcher admission control: in-flight caps and the broadcast barrier.

use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use sandcell::{CodeObject, Config, InvocationRequestOwned, RuntimeService, StatusKind};

static DISPATCH_TESTS: Mutex<()> = Mutex::new(());

fn serialize_test() -> MutexGuard<'static, ()> {
    DISPATCH_TESTS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

const RECV_TIMEOUT: Duration = Duration::from_secs(30);

const BUSY_HANDLER: &str = r#"
function busy(millis) {
    const end = Date.now() + millis;
    while (Date.now() < end) {}
    return "finished";
}
function quick() { return "quick"; }
"#;

fn busy_service(max_pending: usize) -> RuntimeService {
    let service = RuntimeService::new(Config {
        worker_count: 1,
        max_pending_requests: max_pending,
        ..Default::default()
    })
    .unwrap();
    service.init().unwrap();
    service.run().unwrap();

    let (tx, rx) = mpsc::channel();
    service
        .broadcast(
            CodeObject {
                id: "busy".to_string(),
                version: 1,
                js: BUSY_HANDLER.to_string(),
                ..Default::default()
            },
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )
        .unwrap();
    rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    service
}

fn invocation(handler: &str, inputs: &[&str]) -> InvocationRequestOwned {
    InvocationRequestOwned {
        id: handler.to_string(),
        version: 1,
        handler_name: handler.to_string(),
        input: inputs.iter().map(|input| input.to_string()).collect(),
        ..Default::default()
    }
}

#[test]
fn requests_beyond_the_cap_never_reach_a_worker() {
    let _guard = serialize_test();
    let service = busy_service(2);

    let (tx, rx) = mpsc::channel();
    for _ in 0..2 {
        let tx = tx.clone();
        service
            .dispatch(
                invocation("busy", &["500"]),
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
            )
            .unwrap();
    }

    // The cap is two; the third admission fails synchronously.
    let error = service
        .dispatch(invocation("quick", &[]), Box::new(|_| {}))
        .unwrap_err();
    assert_eq!(error.kind, StatusKind::CapacityExhausted);

    for _ in 0..2 {
        rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    }

    // With the pool drained, admissions open up again.
    let (tx, rx) = mpsc::channel();
    service
        .dispatch(
            invocation("quick", &[]),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )
        .unwrap();
    let response = rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    assert_eq!(response.resp, r#""quick""#);
}

#[test]
fn broadcast_waits_for_in_flight_work_and_blocks_new_dispatches() {
    let _guard = serialize_test();
    let service = busy_service(16);

    let (busy_tx, busy_rx) = mpsc::channel();
    service
        .dispatch(
            invocation("busy", &["800"]),
            Box::new(move |result| {
                let _ = busy_tx.send(result);
            }),
        )
        .unwrap();

    std::thread::scope(|scope| {
        let (loaded_tx, loaded_rx) = mpsc::channel();
        let broadcaster = scope.spawn(|| {
            service.broadcast(
                CodeObject {
                    id: "v2".to_string(),
                    version: 2,
                    js: r#"function hello() { return "v2"; }"#.to_string(),
                    ..Default::default()
                },
                Box::new(move |result| {
                    let _ = loaded_tx.send(result);
                }),
            )
        });

        // The barrier is up while the busy request drains.
        std::thread::sleep(Duration::from_millis(150));
        let error = service
            .dispatch(invocation("quick", &[]), Box::new(|_| {}))
            .unwrap_err();
        assert_eq!(error.kind, StatusKind::DispatchDisallowed);

        broadcaster.join().unwrap().unwrap();
        loaded_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    });

    busy_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();

    // Both versions answer after the broadcast completes.
    let (tx, rx) = mpsc::channel();
    let mut request = invocation("hello", &[]);
    request.version = 2;
    service
        .dispatch(
            request,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )
        .unwrap();
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap().resp, r#""v2""#);
}

#[test]
fn batch_dispatch_rides_out_capacity_pressure() {
    let _guard = serialize_test();
    let service = busy_service(2);

    // Eight items against a cap of two: the batch enqueues them as slots
    // free up instead of failing.
    let batch: Vec<_> = (0..8).map(|_| invocation("busy", &["50"])).collect();
    let (tx, rx) = mpsc::channel();
    service
        .dispatch_batch(
            batch,
            Box::new(move |responses| {
                let _ = tx.send(responses);
            }),
        )
        .unwrap();

    let responses = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(responses.len(), 8);
    for response in responses {
        assert_eq!(response.unwrap().resp, r#""finished""#);
    }
}

#[test]
fn invalid_requests_are_rejected_at_admission() {
    let _guard = serialize_test();
    let service = busy_service(8);

    let error = service
        .dispatch(
            InvocationRequestOwned {
                version: 1,
                ..Default::default()
            },
            Box::new(|_| {}),
        )
        .unwrap_err();
    assert_eq!(error.kind, StatusKind::InvalidArgument);

    let (tx, rx) = mpsc::channel();
    service
        .dispatch(
            invocation("quick", &[]),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )
        .expect("a valid request is admitted");
    rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
}
