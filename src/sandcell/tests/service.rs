//! End-to-end behaviour of the service: sandboxed workers, broadcasts,
//! dispatches, bindings, timeouts and crash recovery.
//!
//! Workers are real forked processes running under the syscall filter, so
//! these tests are serialized behind one lock to keep fork windows calm.

use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use sandcell::{
    CodeObject, Config, FunctionBinding, InvocationRequestOwned, Result, ResponseObject,
    RuntimeService, StatusKind, WasmReturnType, tags,
};

static SERVICE_TESTS: Mutex<()> = Mutex::new(());

fn serialize_test() -> MutexGuard<'static, ()> {
    SERVICE_TESTS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

const RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// (module (func (export "add") (param i32 i32) (result i32)
///   local.get 0 local.get 1 i32.add))
const ADD_WASM: &[u8] = &[
    0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, 0x01, 0x07, 0x01, 0x60, 0x02, 0x7f, 0x7f,
    0x01, 0x7f, 0x03, 0x02, 0x01, 0x00, 0x07, 0x07, 0x01, 0x03, 0x61, 0x64, 0x64, 0x00, 0x00,
    0x0a, 0x09, 0x01, 0x07, 0x00, 0x20, 0x00, 0x20, 0x01, 0x6a, 0x0b,
];

fn started_service(config: Config) -> RuntimeService {
    let service = RuntimeService::new(config).unwrap();
    service.init().unwrap();
    service.run().unwrap();
    service
}

fn js_code_object(version: u64, js: &str) -> CodeObject {
    CodeObject {
        id: format!("code-{version}"),
        version,
        js: js.to_string(),
        ..Default::default()
    }
}

fn execute(version: u64, handler: &str, inputs: &[&str]) -> InvocationRequestOwned {
    InvocationRequestOwned {
        id: format!("req-{version}-{handler}"),
        version,
        handler_name: handler.to_string(),
        input: inputs.iter().map(|input| input.to_string()).collect(),
        ..Default::default()
    }
}

fn broadcast_and_wait(service: &RuntimeService, code: CodeObject) -> Result<ResponseObject> {
    let (tx, rx) = mpsc::channel();
    service
        .broadcast(
            code,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )
        .unwrap();
    rx.recv_timeout(RECV_TIMEOUT).unwrap()
}

fn dispatch_and_wait(
    service: &RuntimeService,
    request: InvocationRequestOwned,
) -> Result<ResponseObject> {
    let (tx, rx) = mpsc::channel();
    service
        .dispatch(
            request,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )
        .unwrap();
    rx.recv_timeout(RECV_TIMEOUT).unwrap()
}

#[test]
fn init_and_stop() {
    let _guard = serialize_test();
    let mut service = started_service(Config {
        worker_count: 2,
        ..Default::default()
    });
    service.stop().unwrap();
    // Idempotent.
    service.stop().unwrap();
}

#[test]
fn load_then_execute_returns_the_handler_result() {
    let _guard = serialize_test();
    let service = started_service(Config {
        worker_count: 2,
        ..Default::default()
    });

    let code = js_code_object(
        1,
        r#"function Handler(input) { return "Hello world! " + JSON.stringify(input); }"#,
    );
    broadcast_and_wait(&service, code).unwrap();

    let response = dispatch_and_wait(&service, execute(1, "Handler", &["\"Foobar\""])).unwrap();
    assert_eq!(response.resp, r#""Hello world! \"Foobar\"""#);
}

#[test]
fn fifteen_dispatches_spread_over_five_workers() {
    let _guard = serialize_test();
    let service = started_service(Config {
        worker_count: 5,
        ..Default::default()
    });

    let code = js_code_object(1, r#"function test(input) { return input + " Some string"; }"#);
    broadcast_and_wait(&service, code).unwrap();

    let (tx, rx) = mpsc::channel();
    for index in 0..15 {
        let tx = tx.clone();
        let mut request = execute(1, "test", &[&format!("\"Hello{index}\"")]);
        request.id = index.to_string();
        service
            .dispatch(
                request,
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
            )
            .unwrap();
    }
    drop(tx);

    let mut seen = 0;
    while let Ok(result) = rx.recv_timeout(RECV_TIMEOUT) {
        let response = result.unwrap();
        let index: usize = response.id.parse().unwrap();
        assert_eq!(response.resp, format!("\"Hello{index} Some string\""));
        seen += 1;
    }
    assert_eq!(seen, 15, "every callback fires exactly once");
}

#[test]
fn batch_responses_preserve_submission_order() {
    let _guard = serialize_test();
    let service = started_service(Config {
        worker_count: 2,
        ..Default::default()
    });

    let code = js_code_object(1, "function double(x) { return x * 2; }");
    broadcast_and_wait(&service, code).unwrap();

    let batch: Vec<_> = (0..5)
        .map(|index| execute(1, "double", &[&index.to_string()]))
        .collect();
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
    assert_eq!(responses.len(), 5);
    for (index, response) in responses.into_iter().enumerate() {
        assert_eq!(response.unwrap().resp, (index * 2).to_string());
    }
}

#[test]
fn code_versions_coexist_per_worker() {
    let _guard = serialize_test();
    let service = started_service(Config {
        worker_count: 1,
        ..Default::default()
    });

    broadcast_and_wait(
        &service,
        js_code_object(1, r#"function Handler() { return "Hello Version 1!"; }"#),
    )
    .unwrap();
    broadcast_and_wait(
        &service,
        js_code_object(2, r#"function Handler() { return "Hello Version 2!"; }"#),
    )
    .unwrap();

    let first = dispatch_and_wait(&service, execute(1, "Handler", &[])).unwrap();
    assert_eq!(first.resp, r#""Hello Version 1!""#);
    let second = dispatch_and_wait(&service, execute(2, "Handler", &[])).unwrap();
    assert_eq!(second.resp, r#""Hello Version 2!""#);
}

#[test]
fn execute_without_broadcast_reports_missing_context() {
    let _guard = serialize_test();
    let service = started_service(Config {
        worker_count: 1,
        ..Default::default()
    });
    let error = dispatch_and_wait(&service, execute(7, "Handler", &["1"])).unwrap_err();
    assert_eq!(error.kind, StatusKind::MissingContext);
}

#[test]
fn host_binding_round_trips_through_the_sandbox() {
    let _guard = serialize_test();
    let service = started_service(Config {
        worker_count: 2,
        function_bindings: vec![FunctionBinding::new("cool_function", |io| {
            let input = io.input_string.take().unwrap_or_default();
            io.output_string = Some(format!("{input} String from host"));
        })],
        ..Default::default()
    });

    let code = js_code_object(1, "function Handler(input) { return cool_function(input); }");
    broadcast_and_wait(&service, code).unwrap();

    let response = dispatch_and_wait(&service, execute(1, "Handler", &["\"Foobar\""])).unwrap();
    assert_eq!(response.resp, r#""Foobar String from host""#);
}

#[test]
fn failing_binding_surfaces_as_an_error_and_worker_survives() {
    let _guard = serialize_test();
    let service = started_service(Config {
        worker_count: 1,
        function_bindings: vec![FunctionBinding::new("explode", |io| {
            io.errors.push("refused".to_string());
        })],
        ..Default::default()
    });

    broadcast_and_wait(
        &service,
        js_code_object(1, "function Handler(input) { return explode(input); }"),
    )
    .unwrap();
    broadcast_and_wait(
        &service,
        js_code_object(2, r#"function Handler() { return "unrelated"; }"#),
    )
    .unwrap();

    let error = dispatch_and_wait(&service, execute(1, "Handler", &["\"x\""])).unwrap_err();
    assert_eq!(error.kind, StatusKind::InvokeError);

    let response = dispatch_and_wait(&service, execute(2, "Handler", &[])).unwrap();
    assert_eq!(response.resp, r#""unrelated""#);
}

#[test]
fn wasm_module_executes_end_to_end() {
    let _guard = serialize_test();
    let service = started_service(Config {
        worker_count: 1,
        ..Default::default()
    });

    let code = CodeObject {
        id: "adder".to_string(),
        version: 1,
        wasm: ADD_WASM.to_vec(),
        wasm_return_type: Some(WasmReturnType::Uint32),
        ..Default::default()
    };
    broadcast_and_wait(&service, code).unwrap();

    let mut request = execute(1, "add", &["1", "2"]);
    request
        .tags
        .insert(tags::REQUEST_TYPE.to_string(), tags::REQUEST_TYPE_WASM.to_string());
    let response = dispatch_and_wait(&service, request).unwrap();
    assert_eq!(response.resp, "3");
}

#[test]
fn runaway_execution_times_out_and_worker_stays_usable() {
    let _guard = serialize_test();
    let service = started_service(Config {
        worker_count: 1,
        ..Default::default()
    });

    broadcast_and_wait(
        &service,
        js_code_object(1, r#"function Handler(spin) { if (spin) { while (true) {} } return "done"; }"#),
    )
    .unwrap();

    let mut runaway = execute(1, "Handler", &["true"]);
    runaway
        .tags
        .insert(tags::TIMEOUT_MS.to_string(), "200".to_string());
    let error = dispatch_and_wait(&service, runaway).unwrap_err();
    assert_eq!(error.kind, StatusKind::ExecutionTimeout);

    let response = dispatch_and_wait(&service, execute(1, "Handler", &["false"])).unwrap();
    assert_eq!(response.resp, r#""done""#);
}

#[test]
fn crashed_worker_reports_retry_and_recovers_after_reload() {
    let _guard = serialize_test();
    let service = started_service(Config {
        worker_count: 1,
        max_heap_mib: 128,
        ..Default::default()
    });

    broadcast_and_wait(
        &service,
        js_code_object(
            1,
            r#"
            function Handler(bomb) {
                if (!bomb) { return "alive"; }
                const hoard = [];
                while (true) { hoard.push(new Array(1024 * 1024).fill(7)); }
            }
            "#,
        ),
    )
    .unwrap();

    let error = dispatch_and_wait(&service, execute(1, "Handler", &["true"])).unwrap_err();
    assert_eq!(error.kind, StatusKind::WorkerCrashed);
    assert!(error.is_retryable());

    // The replacement worker starts with an empty cache; re-broadcast and
    // the next dispatch to the same index succeeds.
    broadcast_and_wait(
        &service,
        js_code_object(1, r#"function Handler(bomb) { return "alive"; }"#),
    )
    .unwrap();
    let response = dispatch_and_wait(&service, execute(1, "Handler", &["false"])).unwrap();
    assert_eq!(response.resp, r#""alive""#);
}

#[test]
#[ignore = "installs the global metrics recorder; run separately"]
fn worker_lifecycle_is_visible_in_metrics() {
    let _guard = serialize_test();
    let recorder = metrics_util::debugging::DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().unwrap();

    let snapshot = {
        let service = started_service(Config {
            worker_count: 2,
            ..Default::default()
        });
        broadcast_and_wait(&service, js_code_object(1, "function noop() {}")).unwrap();
        snapshotter.snapshot()
    };
    let metrics = snapshot.into_vec();
    assert!(
        metrics
            .iter()
            .any(|(key, _, _, _)| key.key().name() == "active_sandbox_workers"),
        "expected the worker gauge in {metrics:#?}"
    );
    assert!(
        metrics
            .iter()
            .any(|(key, _, _, _)| key.key().name() == "code_broadcasts_total"),
        "expected the broadcast counter in {metrics:#?}"
    );
}

#[test]
fn dispatch_after_stop_is_refused() {
    let _guard = serialize_test();
    let mut service = started_service(Config {
        worker_count: 1,
        ..Default::default()
    });
    service.stop().unwrap();
    let error = service
        .dispatch(execute(1, "Handler", &[]), Box::new(|_| {}))
        .unwrap_err();
    assert_eq!(error.kind, StatusKind::DispatchDisallowed);
}
