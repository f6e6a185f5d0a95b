//! The per-worker V8 engine wrapper.
//!
//! One engine owns one isolate and its [`ExecutionWatchdog`]. Every
//! execution enters a fresh context, applies the registered
//! [`FunctionBindingVisitor`]s, then either replays a cached compilation
//! context or compiles the submitted code. Handler arguments arrive as
//! JSON-encoded strings; the return value leaves as a JSON-encoded string.

mod bindings;
mod context;
pub(crate) mod wasm_memory;
mod watchdog;

use std::collections::HashMap;
use std::sync::{Arc, Once};
use std::time::Duration;

use sandcell_common::{Error, Result, StatusKind, WasmReturnType, tags};

pub use bindings::{BindingInvoker, ChannelInvoker, FunctionBindingVisitor};
pub use context::CompilationContext;
use context::ContextKind;
pub use watchdog::ExecutionWatchdog;

/// Global object key under which a wasm instance's exports are registered.
const REGISTERED_WASM_EXPORTS: &str = "RegisteredWasmExports";

const MIB: u64 = 1024 * 1024;

/// Process-wide engine configuration, applied exactly once.
#[derive(Debug, Clone, Default)]
pub struct SetupOptions {
    /// Cap on wasm memory pages; zero leaves the engine default. Values
    /// above 65536 are clamped.
    pub max_wasm_memory_pages: u64,
}

static PLATFORM_INIT: Once = Once::new();

/// Initialize the V8 platform. Idempotent; the first caller's options win,
/// since engine flags cannot change after platform startup.
pub fn one_time_setup(options: &SetupOptions) {
    PLATFORM_INIT.call_once(|| {
        if options.max_wasm_memory_pages > 0 {
            let pages = options.max_wasm_memory_pages.min(tags::MAX_WASM_MEMORY_PAGES);
            v8::V8::set_flags_from_string(&format!("--wasm_max_mem_pages={pages}"));
        }
        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform);
        v8::V8::initialize();
    });
}

/// Per-engine configuration.
#[derive(Default)]
pub struct EngineOptions {
    /// Initial isolate heap size in MiB; zero leaves the engine default.
    pub initial_heap_mib: u64,
    /// Maximum isolate heap size in MiB; zero leaves the engine default.
    pub max_heap_mib: u64,
    /// Host function bindings to install on every context.
    pub visitors: Vec<FunctionBindingVisitor>,
}

/// Outcome of one engine call.
pub struct ExecutionResponse {
    /// JSON-encoded handler return value; empty when nothing was invoked or
    /// the handler returned nothing.
    pub response: String,
    /// Freshly created compilation context, present when the call compiled
    /// the submitted code rather than replaying a cached context.
    pub context: Option<CompilationContext>,
}

/// A V8 isolate together with its watchdog and binding visitors.
pub struct V8JsEngine {
    visitors: Vec<FunctionBindingVisitor>,
    // Declared before the isolate: the watchdog thread is joined before
    // the isolate it terminates is disposed.
    watchdog: ExecutionWatchdog,
    isolate: v8::OwnedIsolate,
}

impl V8JsEngine {
    /// Create the isolate and start its watchdog. [`one_time_setup`] must
    /// have run first.
    pub fn new(options: EngineOptions) -> Self {
        let mut params = v8::CreateParams::default();
        if options.max_heap_mib > 0 {
            params = params.heap_limits(
                (options.initial_heap_mib * MIB) as usize,
                (options.max_heap_mib * MIB) as usize,
            );
        }
        let isolate = v8::Isolate::new(params);
        let watchdog = ExecutionWatchdog::new(isolate.thread_safe_handle());
        Self {
            visitors: options.visitors,
            watchdog,
            isolate,
        }
    }

    /// Compile and run a script, optionally invoking `handler_name` with
    /// the JSON-encoded `inputs` afterwards.
    ///
    /// With a cached `context` the stored unbound script is re-bound to a
    /// fresh context instead of recompiling. Attached `wasm` bytes are
    /// exposed to the script as a global `Uint8Array` named by the
    /// `WasmCodeArrayName` tag.
    pub fn compile_and_run_js(
        &mut self,
        code: &str,
        wasm: &[u8],
        handler_name: &str,
        inputs: &[String],
        metadata: &HashMap<String, String>,
        context: Option<&CompilationContext>,
    ) -> Result<ExecutionResponse> {
        let (source, wasm_bytes, cached_script) = match context {
            Some(CompilationContext {
                kind: ContextKind::Js {
                    source,
                    wasm,
                    unbound,
                },
            }) => (Arc::clone(source), Arc::clone(wasm), Some(unbound)),
            Some(_) => {
                return Err(Error::invalid_argument(
                    "cached code version is not a script",
                ));
            }
            None => (Arc::<str>::from(code), Arc::<[u8]>::from(wasm), None),
        };

        let handle = self.isolate.thread_safe_handle();
        self.clear_stale_termination(&handle);
        self.watchdog.arm(execution_timeout(metadata));
        let outcome = run_js(
            &mut self.isolate,
            &self.visitors,
            &source,
            &wasm_bytes,
            cached_script,
            handler_name,
            inputs,
            metadata,
        );
        self.watchdog.disarm();

        match outcome {
            Ok((response, compiled)) => Ok(ExecutionResponse {
                response,
                context: compiled.map(|unbound| CompilationContext::js(source, wasm_bytes, unbound)),
            }),
            Err(error) => Err(self.classify_failure(&handle, error)),
        }
    }

    /// Compile and instantiate a wasm module, optionally invoking the
    /// exported `handler_name` with `inputs` marshalled through linear
    /// memory.
    pub fn compile_and_run_wasm(
        &mut self,
        module_bytes: &[u8],
        handler_name: &str,
        inputs: &[String],
        metadata: &HashMap<String, String>,
        wasm_return_type: WasmReturnType,
        context: Option<&CompilationContext>,
    ) -> Result<ExecutionResponse> {
        let (module, return_type) = match context {
            Some(CompilationContext {
                kind: ContextKind::Wasm {
                    module,
                    return_type,
                },
            }) => (Arc::clone(module), *return_type),
            Some(_) => {
                return Err(Error::invalid_argument(
                    "cached code version is not a wasm module",
                ));
            }
            None => (Arc::<[u8]>::from(module_bytes), wasm_return_type),
        };
        if module.is_empty() {
            return Err(Error::new(
                StatusKind::UnknownCodeType,
                "the request carries no wasm module",
            ));
        }

        let handle = self.isolate.thread_safe_handle();
        self.clear_stale_termination(&handle);
        self.watchdog.arm(execution_timeout(metadata));
        let outcome = run_wasm(
            &mut self.isolate,
            &self.visitors,
            &module,
            handler_name,
            inputs,
            return_type,
        );
        self.watchdog.disarm();

        match outcome {
            Ok(response) => Ok(ExecutionResponse {
                response,
                context: match context {
                    Some(_) => None,
                    None => Some(CompilationContext::wasm(module, return_type)),
                },
            }),
            Err(error) => Err(self.classify_failure(&handle, error)),
        }
    }

    // A previous execution may have been terminated right as its disarm
    // raced the watchdog; a stale pending termination would kill the next
    // run immediately.
    fn clear_stale_termination(&self, handle: &v8::IsolateHandle) {
        if handle.is_execution_terminating() {
            handle.cancel_terminate_execution();
        }
    }

    fn classify_failure(&self, handle: &v8::IsolateHandle, error: Error) -> Error {
        let fired = self.watchdog.take_fired();
        if handle.is_execution_terminating() {
            handle.cancel_terminate_execution();
        }
        if fired {
            return Error::new(StatusKind::ExecutionTimeout, "execution timeout");
        }
        error
    }
}

fn execution_timeout(metadata: &HashMap<String, String>) -> Duration {
    let requested = metadata
        .get(tags::TIMEOUT_MS)
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(tags::DEFAULT_EXECUTION_TIMEOUT_MS);
    Duration::from_millis(requested.min(tags::MAX_EXECUTION_TIMEOUT_MS))
}

fn new_v8_string<'s>(scope: &mut v8::HandleScope<'s>, value: &str) -> Result<v8::Local<'s, v8::String>> {
    v8::String::new(scope, value)
        .ok_or_else(|| Error::new(StatusKind::Internal, "string allocation failed"))
}

/// Error message in the form `line N: <engine message>`, falling back to
/// `fallback` when the engine recorded no exception.
fn caught_error(
    scope: &mut v8::TryCatch<v8::HandleScope>,
    kind: StatusKind,
    fallback: &str,
) -> Error {
    let message = match scope.message() {
        Some(message) => describe_message(scope, message),
        None => fallback.to_string(),
    };
    Error::new(kind, message)
}

fn describe_message(scope: &mut v8::HandleScope, message: v8::Local<v8::Message>) -> String {
    let text = message.get(scope).to_rust_string_lossy(scope);
    match message.get_line_number(scope) {
        Some(line) => format!("line {line}: {text}"),
        None => text,
    }
}

fn parse_js_inputs<'s>(
    scope: &mut v8::HandleScope<'s>,
    inputs: &[String],
) -> Result<Vec<v8::Local<'s, v8::Value>>> {
    let mut arguments = Vec::with_capacity(inputs.len());
    for (index, input) in inputs.iter().enumerate() {
        if input.is_empty() {
            arguments.push(v8::undefined(scope).into());
            continue;
        }
        let text = new_v8_string(scope, input)?;
        let Some(parsed) = v8::json::parse(scope, text) else {
            return Err(Error::new(
                StatusKind::InputParseError,
                format!("input {index} is not valid JSON"),
            ));
        };
        arguments.push(parsed);
    }
    Ok(arguments)
}

fn install_wasm_code_array(
    scope: &mut v8::HandleScope,
    metadata: &HashMap<String, String>,
    wasm: &[u8],
) -> Result<()> {
    let Some(name) = metadata.get(tags::WASM_CODE_ARRAY_NAME) else {
        return Err(Error::invalid_argument(
            "wasm bytes attached to a script require the WasmCodeArrayName tag",
        ));
    };
    let backing = v8::ArrayBuffer::new_backing_store_from_boxed_slice(wasm.to_vec().into_boxed_slice());
    let buffer = v8::ArrayBuffer::with_backing_store(scope, &backing.make_shared());
    let array = v8::Uint8Array::new(scope, buffer, 0, wasm.len()).ok_or_else(|| {
        Error::new(StatusKind::Internal, "could not create the wasm byte array")
    })?;
    let context = scope.get_current_context();
    let global = context.global(scope);
    let key = new_v8_string(scope, name)?;
    if global.set(scope, key.into(), array.into()).is_none() {
        return Err(Error::new(
            StatusKind::Internal,
            "could not register the wasm byte array",
        ));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_js(
    isolate: &mut v8::OwnedIsolate,
    visitors: &[FunctionBindingVisitor],
    source: &str,
    wasm: &[u8],
    cached_script: Option<&v8::Global<v8::UnboundScript>>,
    handler_name: &str,
    inputs: &[String],
    metadata: &HashMap<String, String>,
) -> Result<(String, Option<v8::Global<v8::UnboundScript>>)> {
    let scope = &mut v8::HandleScope::new(isolate);
    let context = v8::Context::new(scope, v8::ContextOptions::default());
    let scope = &mut v8::ContextScope::new(scope, context);
    for visitor in visitors {
        visitor.visit(scope)?;
    }
    if !wasm.is_empty() {
        install_wasm_code_array(scope, metadata, wasm)?;
    }
    let scope = &mut v8::TryCatch::new(scope);

    let (script, compiled) = match cached_script {
        Some(unbound) => {
            let unbound = v8::Local::new(scope, unbound);
            (unbound.bind_to_current_context(scope), None)
        }
        None => {
            let text = new_v8_string(scope, source)?;
            let Some(script) = v8::Script::compile(scope, text, None) else {
                return Err(caught_error(
                    scope,
                    StatusKind::CompileError,
                    "could not compile the script",
                ));
            };
            let unbound = script.get_unbound_script(scope);
            let unbound = v8::Global::new(scope, unbound);
            (script, Some(unbound))
        }
    };

    if script.run(scope).is_none() {
        return Err(caught_error(
            scope,
            StatusKind::RunError,
            "top-level script execution failed",
        ));
    }

    if handler_name.is_empty() {
        return Ok((String::new(), compiled));
    }

    let global = context.global(scope);
    let key = new_v8_string(scope, handler_name)?;
    let handler = global
        .get(scope, key.into())
        .and_then(|value| v8::Local::<v8::Function>::try_from(value).ok());
    let Some(handler) = handler else {
        return Err(Error::new(
            StatusKind::InvokeError,
            format!("handler `{handler_name}` is not a function"),
        ));
    };

    let arguments = parse_js_inputs(scope, inputs)?;
    let Some(result) = handler.call(scope, global.into(), &arguments) else {
        return Err(caught_error(
            scope,
            StatusKind::InvokeError,
            "handler invocation failed",
        ));
    };

    let result = if result.is_promise() {
        let promise = v8::Local::<v8::Promise>::try_from(result)
            .map_err(|_| Error::new(StatusKind::Internal, "promise cast failed"))?;
        while promise.state() == v8::PromiseState::Pending {
            if scope.is_execution_terminating() {
                return Err(Error::new(StatusKind::ExecutionTimeout, "execution timeout"));
            }
            scope.perform_microtask_checkpoint();
        }
        if promise.state() == v8::PromiseState::Rejected {
            let exception = promise.result(scope);
            let message = v8::Exception::create_message(scope, exception);
            let text = describe_message(scope, message);
            return Err(Error::new(StatusKind::AsyncExecutionFailed, text));
        }
        promise.result(scope)
    } else {
        result
    };

    if result.is_undefined() {
        return Ok((String::new(), compiled));
    }
    let Some(json) = v8::json::stringify(scope, result) else {
        return Err(caught_error(
            scope,
            StatusKind::OutputStringifyError,
            "could not serialize the handler result",
        ));
    };
    Ok((json.to_rust_string_lossy(scope), compiled))
}

enum WasmArg {
    Uint32(u32),
    Int32(i32),
    Text(String),
    TextList(Vec<String>),
}

fn parse_wasm_inputs(inputs: &[String]) -> Result<Vec<WasmArg>> {
    let mut parsed = Vec::with_capacity(inputs.len());
    for (index, input) in inputs.iter().enumerate() {
        let bad_input = || {
            Error::new(
                StatusKind::InputParseError,
                format!("input {index} is not a supported wasm argument"),
            )
        };
        let value: serde_json::Value = serde_json::from_str(input).map_err(|_| bad_input())?;
        let argument = match value {
            serde_json::Value::Number(number) => {
                if let Some(unsigned) = number.as_u64().and_then(|v| u32::try_from(v).ok()) {
                    WasmArg::Uint32(unsigned)
                } else if let Some(signed) = number.as_i64().and_then(|v| i32::try_from(v).ok()) {
                    WasmArg::Int32(signed)
                } else {
                    return Err(bad_input());
                }
            }
            serde_json::Value::String(text) => WasmArg::Text(text),
            serde_json::Value::Array(elements) => {
                let mut list = Vec::with_capacity(elements.len());
                for element in elements {
                    match element {
                        serde_json::Value::String(text) => list.push(text),
                        _ => return Err(bad_input()),
                    }
                }
                WasmArg::TextList(list)
            }
            _ => return Err(bad_input()),
        };
        parsed.push(argument);
    }
    Ok(parsed)
}

/// View of a wasm instance's linear memory.
///
/// The slice aliases the live backing store; it must not outlive the scope
/// the memory object came from, and no engine code may run while it is
/// held.
fn linear_memory<'a>(memory: &v8::Local<'a, v8::WasmMemoryObject>) -> Option<&'a mut [u8]> {
    let buffer = memory.buffer();
    let data = buffer.data()?;
    let length = buffer.byte_length();
    Some(unsafe { std::slice::from_raw_parts_mut(data.as_ptr().cast::<u8>(), length) })
}

fn wasi_imports<'s>(scope: &mut v8::HandleScope<'s>) -> Result<v8::Local<'s, v8::Object>> {
    // The only piece of WASI offered to untrusted modules: proc_exit, which
    // terminates the current execution whatever its argument.
    fn proc_exit(
        scope: &mut v8::HandleScope,
        _args: v8::FunctionCallbackArguments,
        _rv: v8::ReturnValue,
    ) {
        scope.terminate_execution();
    }

    let wasi = v8::Object::new(scope);
    let exit = v8::Function::new(scope, proc_exit)
        .ok_or_else(|| Error::new(StatusKind::Internal, "could not build proc_exit"))?;
    let exit_key = new_v8_string(scope, "proc_exit")?;
    let _ = wasi.set(scope, exit_key.into(), exit.into());

    let imports = v8::Object::new(scope);
    let module_key = new_v8_string(scope, "wasi_snapshot_preview1")?;
    let _ = imports.set(scope, module_key.into(), wasi.into());
    Ok(imports)
}

fn run_wasm(
    isolate: &mut v8::OwnedIsolate,
    visitors: &[FunctionBindingVisitor],
    module_bytes: &[u8],
    handler_name: &str,
    inputs: &[String],
    return_type: WasmReturnType,
) -> Result<String> {
    let scope = &mut v8::HandleScope::new(isolate);
    let context = v8::Context::new(scope, v8::ContextOptions::default());
    let scope = &mut v8::ContextScope::new(scope, context);
    for visitor in visitors {
        visitor.visit(scope)?;
    }
    let scope = &mut v8::TryCatch::new(scope);

    let Some(module) = v8::WasmModuleObject::compile(scope, module_bytes) else {
        return Err(caught_error(
            scope,
            StatusKind::CompileError,
            "could not compile the wasm module",
        ));
    };

    let global = context.global(scope);
    let assembly_key = new_v8_string(scope, "WebAssembly")?;
    let instance_key = new_v8_string(scope, "Instance")?;
    let constructor = global
        .get(scope, assembly_key.into())
        .and_then(|value| v8::Local::<v8::Object>::try_from(value).ok())
        .and_then(|assembly| assembly.get(scope, instance_key.into()))
        .and_then(|value| v8::Local::<v8::Function>::try_from(value).ok())
        .ok_or_else(|| Error::new(StatusKind::RunError, "WebAssembly.Instance is not available"))?;

    let imports = wasi_imports(scope)?;
    let Some(instance) = constructor.new_instance(scope, &[module.into(), imports.into()]) else {
        return Err(caught_error(
            scope,
            StatusKind::RunError,
            "could not instantiate the wasm module",
        ));
    };

    let exports_key = new_v8_string(scope, "exports")?;
    let exports = instance
        .get(scope, exports_key.into())
        .and_then(|value| v8::Local::<v8::Object>::try_from(value).ok())
        .ok_or_else(|| Error::new(StatusKind::RunError, "wasm instance has no exports"))?;
    let registered_key = new_v8_string(scope, REGISTERED_WASM_EXPORTS)?;
    let _ = global.set(scope, registered_key.into(), exports.into());

    if handler_name.is_empty() {
        return Ok(String::new());
    }

    let handler_key = new_v8_string(scope, handler_name)?;
    let handler = exports
        .get(scope, handler_key.into())
        .and_then(|value| v8::Local::<v8::Function>::try_from(value).ok())
        .ok_or_else(|| {
            Error::new(
                StatusKind::InvokeError,
                format!("wasm export `{handler_name}` is not a function"),
            )
        })?;

    let parsed = parse_wasm_inputs(inputs)?;
    let memory_key = new_v8_string(scope, "memory")?;
    let memory = exports
        .get(scope, memory_key.into())
        .and_then(|value| v8::Local::<v8::WasmMemoryObject>::try_from(value).ok());

    let mut arguments: Vec<v8::Local<v8::Value>> = Vec::with_capacity(parsed.len());
    match &memory {
        Some(memory) => {
            let bytes = linear_memory(memory).ok_or_else(|| {
                Error::new(StatusKind::InputParseError, "module memory is not accessible")
            })?;
            let overflow = || {
                Error::new(
                    StatusKind::InputParseError,
                    "arguments do not fit in the module's linear memory",
                )
            };
            let mut cursor = 0usize;
            for argument in &parsed {
                let value: v8::Local<v8::Value> = match argument {
                    WasmArg::Uint32(value) => v8::Integer::new_from_unsigned(scope, *value).into(),
                    WasmArg::Int32(value) => v8::Integer::new(scope, *value).into(),
                    WasmArg::Text(text) => {
                        let offset = wasm_memory::write_string(bytes, &mut cursor, text)
                            .ok_or_else(overflow)?;
                        v8::Integer::new_from_unsigned(scope, offset).into()
                    }
                    WasmArg::TextList(list) => {
                        let offset = wasm_memory::write_list_of_string(bytes, &mut cursor, list)
                            .ok_or_else(overflow)?;
                        v8::Integer::new_from_unsigned(scope, offset).into()
                    }
                };
                arguments.push(value);
            }
        }
        // The module exports no memory; only values that need no
        // serialization can cross.
        None => {
            for argument in &parsed {
                let value: v8::Local<v8::Value> = match argument {
                    WasmArg::Uint32(value) => v8::Integer::new_from_unsigned(scope, *value).into(),
                    WasmArg::Int32(value) => v8::Integer::new(scope, *value).into(),
                    WasmArg::Text(text) => new_v8_string(scope, text)?.into(),
                    WasmArg::TextList(list) => {
                        let array = v8::Array::new(scope, list.len() as i32);
                        for (index, element) in list.iter().enumerate() {
                            let element = new_v8_string(scope, element)?;
                            let _ = array.set_index(scope, index as u32, element.into());
                        }
                        array.into()
                    }
                };
                arguments.push(value);
            }
        }
    }

    let Some(result) = handler.call(scope, global.into(), &arguments) else {
        return Err(caught_error(
            scope,
            StatusKind::InvokeError,
            "wasm handler invocation failed",
        ));
    };
    if result.is_undefined() {
        return Ok(String::new());
    }
    let Some(offset) = result.int32_value(scope) else {
        return Err(Error::new(
            StatusKind::OutputStringifyError,
            "wasm handler did not return an i32",
        ));
    };

    let value = match return_type {
        WasmReturnType::Uint32 => serde_json::Value::from(offset as u32),
        WasmReturnType::String | WasmReturnType::ListOfString => {
            let memory = memory.as_ref().ok_or_else(|| {
                Error::new(
                    StatusKind::OutputStringifyError,
                    "module exports no memory to read the result from",
                )
            })?;
            let bytes = linear_memory(memory).ok_or_else(|| {
                Error::new(StatusKind::OutputStringifyError, "module memory is not accessible")
            })?;
            let unreadable = || {
                Error::new(
                    StatusKind::OutputStringifyError,
                    "could not read the handler result from linear memory",
                )
            };
            if offset < 0 {
                return Err(unreadable());
            }
            if return_type == WasmReturnType::String {
                serde_json::Value::from(
                    wasm_memory::read_string(bytes, offset as u32).ok_or_else(unreadable)?,
                )
            } else {
                serde_json::Value::from(
                    wasm_memory::read_list_of_string(bytes, offset as u32).ok_or_else(unreadable)?,
                )
            }
        }
        WasmReturnType::Unspecified => {
            return Err(Error::new(
                StatusKind::UnknownWasmReturnType,
                "the code object declared no wasm return type",
            ));
        }
    };
    serde_json::to_string(&value)
        .map_err(|e| Error::new(StatusKind::OutputStringifyError, e.to_string()))
}
