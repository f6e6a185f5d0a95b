//! Host function bindings visible to sandboxed code.
//!
//! Before each execution the engine walks its visitors; each visitor
//! installs its functions on the fresh context's global object. When a
//! script calls one, the callback packs the argument into a
//! [`FunctionBindingIo`], hands it to the invoker (in production a framed
//! unix-socket channel out of the sandbox), and converts the reply back
//! into an engine value. Any reported error becomes a thrown exception.

use std::ffi::c_void;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};

use sandcell_common::{
    Error, FunctionBindingIo, ListOfString, MapOfString, Result, StatusKind, recv_message,
    send_message,
};

const COULD_NOT_PACK_INPUT: &str = "could not convert the function argument to a supported type";
const COULD_NOT_REACH_HOST: &str = "could not reach the host function binding";
const BINDING_REPORTED_ERROR: &str = "host function binding reported an error";
const COULD_NOT_UNPACK_OUTPUT: &str = "could not convert the host function result";

/// Delivers one packed binding invocation to its host-side handler.
pub trait BindingInvoker: Send + Sync {
    /// Fill in the output side of `io`, or fail if the host is unreachable.
    fn invoke(&self, io: &mut FunctionBindingIo) -> Result<()>;
}

/// Production invoker: one length-prefixed request/reply exchange per call
/// over the channel the host transferred at sandbox init.
pub struct ChannelInvoker {
    stream: Mutex<UnixStream>,
}

impl ChannelInvoker {
    /// Wrap the in-sandbox end of the binding channel.
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream: Mutex::new(stream),
        }
    }
}

impl BindingInvoker for ChannelInvoker {
    fn invoke(&self, io: &mut FunctionBindingIo) -> Result<()> {
        let mut stream = self
            .stream
            .lock()
            .map_err(|_| Error::new(StatusKind::Internal, "binding channel lock poisoned"))?;
        send_message(&mut *stream, io)?;
        *io = recv_message(&mut *stream)?;
        Ok(())
    }
}

struct BindingRegistration {
    name: String,
    invoker: Arc<dyn BindingInvoker>,
}

/// Installs a set of named host functions on every context the engine
/// creates.
pub struct FunctionBindingVisitor {
    // Boxed so each registration has a stable address for the callback
    // data slot; registrations outlive every context the engine creates.
    registrations: Vec<Box<BindingRegistration>>,
}

impl FunctionBindingVisitor {
    /// A visitor exposing `names`, all routed through `invoker`.
    pub fn new(names: impl IntoIterator<Item = String>, invoker: Arc<dyn BindingInvoker>) -> Self {
        Self {
            registrations: names
                .into_iter()
                .map(|name| {
                    Box::new(BindingRegistration {
                        name,
                        invoker: Arc::clone(&invoker),
                    })
                })
                .collect(),
        }
    }

    pub(crate) fn visit(&self, scope: &mut v8::HandleScope) -> Result<()> {
        let context = scope.get_current_context();
        let global = context.global(scope);
        for registration in &self.registrations {
            let data = v8::External::new(
                scope,
                std::ptr::from_ref::<BindingRegistration>(registration.as_ref()) as *mut c_void,
            );
            let function = v8::Function::builder(binding_callback)
                .data(data.into())
                .build(scope)
                .ok_or_else(|| {
                    Error::new(StatusKind::Internal, "could not build a binding function")
                })?;
            let name = v8::String::new(scope, &registration.name).ok_or_else(|| {
                Error::new(StatusKind::Internal, "could not intern a binding name")
            })?;
            if global.set(scope, name.into(), function.into()).is_none() {
                return Err(Error::new(
                    StatusKind::Internal,
                    "could not register a binding function",
                ));
            }
        }
        Ok(())
    }
}

fn binding_callback(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let Ok(data) = v8::Local::<v8::External>::try_from(args.data()) else {
        throw_error(scope, "unexpected data in binding callback");
        return;
    };
    // The external points at a BindingRegistration boxed inside the
    // visitor, which outlives every context the engine creates.
    let registration = unsafe { &*(data.value() as *const BindingRegistration) };

    let mut io = FunctionBindingIo {
        function_name: registration.name.clone(),
        ..Default::default()
    };
    if !pack_argument(scope, &args, &mut io) {
        throw_error(scope, COULD_NOT_PACK_INPUT);
        return;
    }
    if let Err(error) = registration.invoker.invoke(&mut io) {
        tracing::error!(binding = %registration.name, %error, "binding invocation failed");
        throw_error(scope, COULD_NOT_REACH_HOST);
        return;
    }
    if !io.errors.is_empty() {
        throw_error(scope, BINDING_REPORTED_ERROR);
        return;
    }
    match unpack_output(scope, &io) {
        Some(value) => rv.set(value),
        None => throw_error(scope, COULD_NOT_UNPACK_OUTPUT),
    }
}

/// Accepts at most one argument of a supported shape: string, array of
/// strings, or object with string values.
fn pack_argument(
    scope: &mut v8::HandleScope,
    args: &v8::FunctionCallbackArguments,
    io: &mut FunctionBindingIo,
) -> bool {
    match args.length() {
        0 => true,
        1 => {
            let arg = args.get(0);
            if arg.is_string() {
                io.input_string = Some(arg.to_rust_string_lossy(scope));
                return true;
            }
            if arg.is_array() {
                let Ok(array) = v8::Local::<v8::Array>::try_from(arg) else {
                    return false;
                };
                let mut data = Vec::with_capacity(array.length() as usize);
                for index in 0..array.length() {
                    let Some(element) = array.get_index(scope, index) else {
                        return false;
                    };
                    if !element.is_string() {
                        return false;
                    }
                    data.push(element.to_rust_string_lossy(scope));
                }
                io.input_list_of_string = Some(ListOfString { data });
                return true;
            }
            if arg.is_object() {
                let Ok(object) = v8::Local::<v8::Object>::try_from(arg) else {
                    return false;
                };
                let Some(names) =
                    object.get_own_property_names(scope, v8::GetPropertyNamesArgs::default())
                else {
                    return false;
                };
                let mut map = MapOfString::default();
                for index in 0..names.length() {
                    let Some(key) = names.get_index(scope, index) else {
                        return false;
                    };
                    let Some(value) = object.get(scope, key) else {
                        return false;
                    };
                    if !key.is_string() || !value.is_string() {
                        return false;
                    }
                    map.data.insert(
                        key.to_rust_string_lossy(scope),
                        value.to_rust_string_lossy(scope),
                    );
                }
                io.input_map_of_string = Some(map);
                return true;
            }
            false
        }
        _ => false,
    }
}

fn unpack_output<'s>(
    scope: &mut v8::HandleScope<'s>,
    io: &FunctionBindingIo,
) -> Option<v8::Local<'s, v8::Value>> {
    if let Some(output) = &io.output_string {
        return v8::String::new(scope, output).map(Into::into);
    }
    if let Some(output) = &io.output_list_of_string {
        let array = v8::Array::new(scope, output.data.len() as i32);
        for (index, element) in output.data.iter().enumerate() {
            let element = v8::String::new(scope, element)?;
            array.set_index(scope, index as u32, element.into())?;
        }
        return Some(array.into());
    }
    if let Some(output) = &io.output_map_of_string {
        let object = v8::Object::new(scope);
        for (key, value) in &output.data {
            let key = v8::String::new(scope, key)?;
            let value = v8::String::new(scope, value)?;
            object.set(scope, key.into(), value.into())?;
        }
        return Some(object.into());
    }
    None
}

fn throw_error(scope: &mut v8::HandleScope, message: &str) {
    if let Some(text) = v8::String::new(scope, message) {
        let exception = v8::Exception::error(scope, text);
        scope.throw_exception(exception);
    }
}
