//! The caller-facing request and response model.

use std::collections::HashMap;
use std::sync::Arc;

use sandcell_common::{Error, Result, WasmReturnType, WorkerRunRequest, tags};

/// A program submitted for loading, immutable after submission.
///
/// At least one of `js` and `wasm` must be present. When both are, the
/// wasm bytes are exposed to the script as a global `Uint8Array` named by
/// the `WasmCodeArrayName` tag so the script can instantiate the module
/// itself.
#[derive(Debug, Clone, Default)]
pub struct CodeObject {
    /// Free-form identifier, echoed in responses.
    pub id: String,
    /// Caller-chosen monotone version; invocation requests reference it.
    pub version: u64,
    /// JavaScript source.
    pub js: String,
    /// Wasm module bytes.
    pub wasm: Vec<u8>,
    /// Declared handler return type; required when `wasm` is used without
    /// a JavaScript wrapper.
    pub wasm_return_type: Option<WasmReturnType>,
    /// Side-channel metadata forwarded to the worker.
    pub tags: HashMap<String, String>,
}

/// A handler invocation against a previously loaded code version.
///
/// Generic over how inputs are held: owned strings
/// ([`InvocationRequestOwned`]) or shared references to external strings
/// ([`InvocationRequestShared`]).
#[derive(Debug, Clone, Default)]
pub struct InvocationRequest<Input = String> {
    /// Free-form identifier, echoed in responses.
    pub id: String,
    /// Version of the code object to execute.
    pub version: u64,
    /// The exported function to call.
    pub handler_name: String,
    /// JSON-encoded arguments, one per handler parameter.
    pub input: Vec<Input>,
    /// Side-channel metadata forwarded to the worker; recognised tags
    /// include `TimeoutMs` and `RequestType`.
    pub tags: HashMap<String, String>,
}

/// Invocation request owning its input strings.
pub type InvocationRequestOwned = InvocationRequest<String>;
/// Invocation request sharing externally owned input strings.
pub type InvocationRequestShared = InvocationRequest<Arc<str>>;

/// The outcome delivered to a dispatch callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseObject {
    /// The request's `id`, echoed.
    pub id: String,
    /// JSON-encoded handler return value; empty when the call produced no
    /// value or the request named no handler.
    pub resp: String,
}

pub(crate) fn code_object_worker_request(code: &CodeObject) -> WorkerRunRequest {
    let mut metadata = code.tags.clone();
    metadata.insert(
        tags::REQUEST_ACTION.to_string(),
        tags::REQUEST_ACTION_LOAD.to_string(),
    );
    metadata.insert(tags::CODE_VERSION.to_string(), code.version.to_string());
    let request_type = if code.js.is_empty() {
        tags::REQUEST_TYPE_WASM
    } else {
        tags::REQUEST_TYPE_JS
    };
    metadata.insert(tags::REQUEST_TYPE.to_string(), request_type.to_string());
    WorkerRunRequest {
        code: code.js.clone(),
        wasm: code.wasm.clone(),
        inputs: Vec::new(),
        metadata,
        wasm_return_type: code.wasm_return_type.unwrap_or_default() as i32,
    }
}

pub(crate) fn validate_code_object(code: &CodeObject) -> Result<()> {
    if code.version == 0 {
        return Err(Error::invalid_argument("code objects need a non-zero version"));
    }
    if code.js.is_empty() && code.wasm.is_empty() {
        return Err(Error::invalid_argument(
            "code objects need a script or a wasm module",
        ));
    }
    Ok(())
}

pub(crate) fn invocation_worker_request<Input: AsRef<str>>(
    request: &InvocationRequest<Input>,
) -> WorkerRunRequest {
    let mut metadata = request.tags.clone();
    metadata.insert(
        tags::REQUEST_ACTION.to_string(),
        tags::REQUEST_ACTION_EXECUTE.to_string(),
    );
    metadata.insert(tags::CODE_VERSION.to_string(), request.version.to_string());
    metadata.insert(tags::HANDLER_NAME.to_string(), request.handler_name.clone());
    metadata
        .entry(tags::REQUEST_TYPE.to_string())
        .or_insert_with(|| tags::REQUEST_TYPE_JS.to_string());
    WorkerRunRequest {
        code: String::new(),
        wasm: Vec::new(),
        inputs: request
            .input
            .iter()
            .map(|input| input.as_ref().to_string())
            .collect(),
        metadata,
        wasm_return_type: WasmReturnType::Unspecified as i32,
    }
}

pub(crate) fn validate_invocation<Input>(request: &InvocationRequest<Input>) -> Result<()> {
    if request.version == 0 {
        return Err(Error::invalid_argument(
            "invocation requests need a non-zero version",
        ));
    }
    if request.handler_name.is_empty() {
        return Err(Error::invalid_argument(
            "invocation requests need a handler name",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_objects_pick_the_request_type_from_their_payload() {
        let js = CodeObject {
            version: 1,
            js: "function h() {}".to_string(),
            ..Default::default()
        };
        let request = code_object_worker_request(&js);
        assert_eq!(
            request.metadata.get(tags::REQUEST_TYPE).map(String::as_str),
            Some(tags::REQUEST_TYPE_JS)
        );

        let wasm = CodeObject {
            version: 1,
            wasm: vec![0x00],
            wasm_return_type: Some(WasmReturnType::Uint32),
            ..Default::default()
        };
        let request = code_object_worker_request(&wasm);
        assert_eq!(
            request.metadata.get(tags::REQUEST_TYPE).map(String::as_str),
            Some(tags::REQUEST_TYPE_WASM)
        );
        assert_eq!(request.wasm_return_type, WasmReturnType::Uint32 as i32);
    }

    #[test]
    fn empty_code_objects_are_rejected() {
        let empty = CodeObject {
            version: 1,
            ..Default::default()
        };
        assert!(validate_code_object(&empty).is_err());
    }

    #[test]
    fn caller_tags_survive_conversion_but_cannot_override_routing() {
        let mut invocation = InvocationRequestOwned {
            id: "req".to_string(),
            version: 3,
            handler_name: "Handler".to_string(),
            input: vec!["1".to_string()],
            ..Default::default()
        };
        invocation
            .tags
            .insert(tags::TIMEOUT_MS.to_string(), "250".to_string());
        invocation
            .tags
            .insert(tags::REQUEST_ACTION.to_string(), "Load".to_string());

        let request = invocation_worker_request(&invocation);
        assert_eq!(request.metadata.get(tags::TIMEOUT_MS).map(String::as_str), Some("250"));
        assert_eq!(
            request.metadata.get(tags::REQUEST_ACTION).map(String::as_str),
            Some(tags::REQUEST_ACTION_EXECUTE)
        );
        assert_eq!(request.metadata.get(tags::CODE_VERSION).map(String::as_str), Some("3"));
    }

    #[test]
    fn invocations_without_handler_are_rejected() {
        let invocation = InvocationRequestOwned {
            version: 1,
            ..Default::default()
        };
        assert!(validate_invocation(&invocation).is_err());
    }

    #[test]
    fn shared_inputs_convert_like_owned_ones() {
        let shared = InvocationRequestShared {
            id: "req".to_string(),
            version: 1,
            handler_name: "Handler".to_string(),
            input: vec![Arc::from("\"x\"")],
            ..Default::default()
        };
        let request = invocation_worker_request(&shared);
        assert_eq!(request.inputs, vec!["\"x\"".to_string()]);
    }
}
