use std::sync::Arc;

use sandcell_common::WasmReturnType;

/// Cached product of loading one code version, replayable on later
/// executions of that version.
///
/// Contexts hold handles scoped to the engine's isolate; a context must be
/// dropped before the engine that produced it.
pub struct CompilationContext {
    pub(crate) kind: ContextKind,
}

pub(crate) enum ContextKind {
    /// A compiled script. The unbound script is context-independent and is
    /// re-bound to a fresh context on every execution. Attached wasm bytes
    /// are kept so re-executions can re-expose them to the script.
    Js {
        source: Arc<str>,
        wasm: Arc<[u8]>,
        unbound: v8::Global<v8::UnboundScript>,
    },
    /// A wasm module kept as bytes together with its declared return type.
    Wasm {
        module: Arc<[u8]>,
        return_type: WasmReturnType,
    },
}

impl CompilationContext {
    pub(crate) fn js(
        source: Arc<str>,
        wasm: Arc<[u8]>,
        unbound: v8::Global<v8::UnboundScript>,
    ) -> Self {
        Self {
            kind: ContextKind::Js {
                source,
                wasm,
                unbound,
            },
        }
    }

    pub(crate) fn wasm(module: Arc<[u8]>, return_type: WasmReturnType) -> Self {
        Self {
            kind: ContextKind::Wasm {
                module,
                return_type,
            },
        }
    }
}
