//! Host side of the function-binding bridge.
//!
//! Each worker gets its own socket pair at service construction. The
//! sandbox end is inherited by the worker child (and re-inherited on every
//! restart); the host end is drained by a dedicated reader thread that
//! dispatches each [`FunctionBindingIo`] frame by function name and writes
//! the filled-in message back. The sandboxed caller blocks until the reply
//! arrives, so one exchange is always in flight per worker at most.

use std::collections::HashMap;
use std::fmt;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::JoinHandle;

use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use sandcell_common::{Error, FunctionBindingIo, Result, StatusKind, recv_message, send_message};

pub(crate) type BindingFn = Arc<dyn Fn(&mut FunctionBindingIo) + Send + Sync>;

/// A named host function callable from sandboxed code.
///
/// The handler reads one `input_*` field of the proto and fills in one
/// `output_*` field, or appends to `errors` to make the sandboxed call
/// throw.
#[derive(Clone)]
pub struct FunctionBinding {
    /// Name under which the function appears on the script's global object.
    pub name: String,
    /// The host-side handler.
    pub function: BindingFn,
}

impl FunctionBinding {
    /// Bind `function` under `name`.
    pub fn new(
        name: impl Into<String>,
        function: impl Fn(&mut FunctionBindingIo) + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            function: Arc::new(function),
        }
    }
}

impl fmt::Debug for FunctionBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionBinding")
            .field("name", &self.name)
            .finish()
    }
}

/// Create the per-worker binding channel: the host end for the reader
/// thread and the sandbox end for the worker child to inherit.
pub(crate) fn channel_pair() -> Result<(UnixStream, OwnedFd)> {
    let (host_end, sandbox_end) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .map_err(|errno| {
        Error::new(
            StatusKind::SandboxInitFailed,
            format!("could not create the binding channel: {errno}"),
        )
    })?;
    Ok((UnixStream::from(host_end), sandbox_end))
}

/// Drain one worker's binding channel until the sandbox end closes.
pub(crate) fn spawn_reader(
    worker_index: usize,
    stream: UnixStream,
    bindings: Arc<HashMap<String, BindingFn>>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("sandcell-binding-{worker_index}"))
        .spawn(move || serve(stream, &bindings))
        .map_err(|error| {
            Error::new(
                StatusKind::SandboxInitFailed,
                format!("could not spawn a binding reader: {error}"),
            )
        })
}

fn serve(mut stream: UnixStream, bindings: &HashMap<String, BindingFn>) {
    loop {
        let mut io: FunctionBindingIo = match recv_message(&mut stream) {
            Ok(io) => io,
            // The last sandbox holding the peer end is gone.
            Err(_) => return,
        };
        match bindings.get(&io.function_name) {
            Some(function) => function(&mut io),
            None => io
                .errors
                .push(format!("no host function named `{}`", io.function_name)),
        }
        if send_message(&mut stream, &io).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader_with_echo() -> (UnixStream, JoinHandle<()>) {
        let (host_end, sandbox_end) = channel_pair().unwrap();
        let bindings: Arc<HashMap<String, BindingFn>> = Arc::new(
            [(
                "echo".to_string(),
                Arc::new(|io: &mut FunctionBindingIo| {
                    io.output_string = io.input_string.take();
                }) as BindingFn,
            )]
            .into_iter()
            .collect(),
        );
        let reader = spawn_reader(0, host_end, bindings).unwrap();
        (UnixStream::from(sandbox_end), reader)
    }

    #[test]
    fn reader_answers_by_function_name() {
        let (mut sandbox_side, reader) = reader_with_echo();
        let request = FunctionBindingIo {
            function_name: "echo".to_string(),
            input_string: Some("ping".to_string()),
            ..Default::default()
        };
        send_message(&mut sandbox_side, &request).unwrap();
        let reply: FunctionBindingIo = recv_message(&mut sandbox_side).unwrap();
        assert_eq!(reply.output_string.as_deref(), Some("ping"));
        assert!(reply.errors.is_empty());

        drop(sandbox_side);
        reader.join().unwrap();
    }

    #[test]
    fn unknown_function_names_come_back_as_errors() {
        let (mut sandbox_side, reader) = reader_with_echo();
        let request = FunctionBindingIo {
            function_name: "missing".to_string(),
            ..Default::default()
        };
        send_message(&mut sandbox_side, &request).unwrap();
        let reply: FunctionBindingIo = recv_message(&mut sandbox_side).unwrap();
        assert_eq!(reply.errors.len(), 1);

        drop(sandbox_side);
        reader.join().unwrap();
    }
}
