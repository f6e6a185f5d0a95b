//! The worker serving all run-code calls inside one sandbox.

use std::num::NonZeroUsize;

use lru::LruCache;
use sandcell_common::{Error, Result, StatusKind, WasmReturnType, WorkerRunRequest, tags};

use crate::engine::{CompilationContext, V8JsEngine};

/// A single engine plus a bounded cache of compilation contexts keyed by
/// code version, so several program versions can coexist in one worker.
pub struct Worker {
    // Contexts hold isolate-scoped handles; the field order drops them
    // before the engine.
    contexts: LruCache<String, CompilationContext>,
    engine: V8JsEngine,
    require_preload: bool,
}

impl Worker {
    /// Wrap `engine`. A `cache_capacity` of zero selects the default.
    pub fn new(engine: V8JsEngine, require_preload: bool, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity)
            .or_else(|| NonZeroUsize::new(tags::DEFAULT_CONTEXT_CACHE_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            contexts: LruCache::new(capacity),
            engine,
            require_preload,
        }
    }

    /// Serve one load or execute request, returning the JSON-encoded
    /// handler result.
    ///
    /// Loads always compile fresh and replace any cached context for the
    /// same version; executes replay the cached context, or fail with
    /// [`StatusKind::MissingContext`] when preloading is required and the
    /// version is unknown (evicted contexts count as unknown).
    pub fn run_code(&mut self, request: &WorkerRunRequest) -> Result<String> {
        let metadata = &request.metadata;
        let request_type = require_tag(metadata, tags::REQUEST_TYPE)?;
        let version = require_tag(metadata, tags::CODE_VERSION)?;
        let action = require_tag(metadata, tags::REQUEST_ACTION)?;
        let is_load = match action {
            tags::REQUEST_ACTION_LOAD => true,
            tags::REQUEST_ACTION_EXECUTE => false,
            other => {
                return Err(Error::invalid_argument(format!(
                    "unknown request action `{other}`"
                )));
            }
        };
        let handler_name = metadata
            .get(tags::HANDLER_NAME)
            .map(String::as_str)
            .unwrap_or_default();
        if !is_load && handler_name.is_empty() {
            return Err(Error::invalid_argument(
                "execute requests must name a handler",
            ));
        }

        let Self {
            contexts,
            engine,
            require_preload,
        } = self;
        let context = if is_load { None } else { contexts.get(version) };
        if context.is_none() && *require_preload && !is_load {
            return Err(Error::new(
                StatusKind::MissingContext,
                format!("code version `{version}` has not been loaded"),
            ));
        }

        let response = match request_type {
            tags::REQUEST_TYPE_JS => {
                if is_load && request.code.is_empty() {
                    return Err(Error::new(
                        StatusKind::UnknownCodeType,
                        "load request carries no script",
                    ));
                }
                engine.compile_and_run_js(
                    &request.code,
                    &request.wasm,
                    handler_name,
                    &request.inputs,
                    metadata,
                    context,
                )?
            }
            tags::REQUEST_TYPE_WASM => {
                let return_type = WasmReturnType::try_from(request.wasm_return_type)
                    .unwrap_or(WasmReturnType::Unspecified);
                if is_load {
                    if request.wasm.is_empty() {
                        return Err(Error::new(
                            StatusKind::UnknownCodeType,
                            "load request carries no wasm module",
                        ));
                    }
                    if return_type == WasmReturnType::Unspecified {
                        return Err(Error::new(
                            StatusKind::UnknownWasmReturnType,
                            "wasm code objects must declare a return type",
                        ));
                    }
                }
                engine.compile_and_run_wasm(
                    &request.wasm,
                    handler_name,
                    &request.inputs,
                    metadata,
                    return_type,
                    context,
                )?
            }
            other => {
                return Err(Error::new(
                    StatusKind::UnknownRequestType,
                    format!("unknown request type `{other}`"),
                ));
            }
        };

        if is_load {
            if let Some(context) = response.context {
                self.contexts.put(version.to_string(), context);
            }
        }
        Ok(response.response)
    }
}

fn require_tag<'m>(
    metadata: &'m std::collections::HashMap<String, String>,
    tag: &str,
) -> Result<&'m str> {
    metadata
        .get(tag)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| Error::invalid_argument(format!("missing required tag `{tag}`")))
}
