//! Script-side view of a request running on the [`MemoryRuntime`].
//!
//! [`MemoryRuntime`]: super::MemoryRuntime

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashSet;
use thiserror::Error;

use crate::codec::{self, DynamicValue};
use crate::memory::heap::{MemoryHeap, Zval};
use crate::native::{
    Callback, ContextHandle, HeaderOp, HostBridge, InstanceHandle, ReceiverCall, Reply, ValueHeap,
};
use crate::value::{HostMap, HostValue, MapKey};

/// Error raised by script code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScriptError {
    /// An uncaught exception.
    #[error("Uncaught Exception: {0}")]
    Exception(String),

    /// A fatal error.
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl ScriptError {
    pub fn exception(message: impl Into<String>) -> Self {
        Self::Exception(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }
}

/// Result of a script body.
pub type ScriptResult = Result<HostValue, ScriptError>;

/// A script body registered with the runtime.
pub type ScriptFn = dyn Fn(&mut ScriptScope<'_>) -> ScriptResult + Send + Sync;

/// Reference to a receiver instance created by a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub class: String,
    pub instance: InstanceHandle,
}

/// Per-request state kept by the runtime between calls.
#[derive(Debug, Default)]
pub(crate) struct RequestState {
    pub(crate) server: HostMap,
    pub(crate) get: HostMap,
    pub(crate) post: HostMap,
    pub(crate) cookie: HostMap,
    pub(crate) vars: HashMap<String, Zval>,
    pub(crate) buffers: Vec<Vec<u8>>,
    pub(crate) headers_sent: bool,
    pub(crate) response_code: Option<u16>,
    pub(crate) finished: bool,
    pub(crate) instances: Vec<ObjectRef>,
}

impl RequestState {
    pub(crate) fn new(server: HostMap) -> Self {
        Self {
            server,
            ..Self::default()
        }
    }

    pub(crate) fn send_headers(&mut self, context: ContextHandle, host: &mut dyn HostBridge) {
        if self.headers_sent {
            return;
        }
        self.headers_sent = true;
        host.dispatch(Callback::SendHeaders {
            context,
            status: self.response_code,
        });
    }

    /// Unbuffered write. Output after the request was finished is dropped.
    pub(crate) fn write_out(
        &mut self,
        context: ContextHandle,
        host: &mut dyn HostBridge,
        bytes: &[u8],
    ) {
        if self.finished || bytes.is_empty() {
            return;
        }
        self.send_headers(context, host);
        host.dispatch(Callback::WriteOut { context, bytes });
    }

    pub(crate) fn echo(&mut self, context: ContextHandle, host: &mut dyn HostBridge, bytes: &[u8]) {
        match self.buffers.last_mut() {
            Some(buffer) => buffer.extend_from_slice(bytes),
            None => self.write_out(context, host, bytes),
        }
    }

    /// Close every output buffer, writing their contents in order.
    pub(crate) fn end_all_buffers(&mut self, context: ContextHandle, host: &mut dyn HostBridge) {
        let pending: Vec<u8> = self.buffers.drain(..).flatten().collect();
        self.write_out(context, host, &pending);
    }

    /// Finish the request early. Returns `false` if it already was.
    pub(crate) fn finish(&mut self, context: ContextHandle, host: &mut dyn HostBridge) -> bool {
        if self.finished {
            return false;
        }
        self.send_headers(context, host);
        self.end_all_buffers(context, host);
        self.finished = true;
        true
    }

    pub(crate) fn shutdown(&mut self, context: ContextHandle, host: &mut dyn HostBridge) {
        if !self.finished {
            self.end_all_buffers(context, host);
            self.send_headers(context, host);
        }
        for object in self.instances.drain(..) {
            host.dispatch(Callback::Receiver {
                receiver: &object.class,
                instance: object.instance,
                call: ReceiverCall::Release,
            });
        }
    }
}

/// Builtins available to a script while it runs.
pub struct ScriptScope<'a> {
    pub(crate) context: ContextHandle,
    pub(crate) heap: &'a Arc<MemoryHeap>,
    pub(crate) classes: &'a DashSet<String>,
    pub(crate) instance_ids: &'a AtomicUsize,
    pub(crate) state: &'a mut RequestState,
    pub(crate) host: &'a mut dyn HostBridge,
}

impl ScriptScope<'_> {
    pub fn context(&self) -> ContextHandle {
        self.context
    }

    fn values(&self) -> Arc<dyn ValueHeap> {
        self.heap.clone()
    }

    /// Write output, through the active output buffer if there is one.
    pub fn echo(&mut self, text: impl AsRef<[u8]>) {
        self.state.echo(self.context, self.host, text.as_ref());
    }

    /// Open a new output buffer.
    pub fn ob_start(&mut self) {
        self.state.buffers.push(Vec::new());
    }

    pub fn ob_get_level(&self) -> usize {
        self.state.buffers.len()
    }

    /// Close the innermost output buffer and pass its contents on.
    pub fn ob_end_flush(&mut self) -> bool {
        let Some(buffer) = self.state.buffers.pop() else {
            return false;
        };
        self.state.echo(self.context, self.host, &buffer);
        true
    }

    /// Close the innermost output buffer and return its contents.
    pub fn ob_get_clean(&mut self) -> Option<String> {
        self.state
            .buffers
            .pop()
            .map(|buffer| String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Set a header from a `Name: value` line.
    ///
    /// Ignored, with a warning in the log, once headers were sent.
    pub fn header(&mut self, line: &str, replace: bool) {
        if self.state.headers_sent {
            self.error_log("PHP Warning:  Cannot modify header information - headers already sent");
            return;
        }
        let op = if replace {
            HeaderOp::Replace
        } else {
            HeaderOp::Append
        };
        self.host.dispatch(Callback::Header {
            context: self.context,
            op,
            line,
        });
    }

    pub fn header_remove(&mut self, name: &str) {
        if self.state.headers_sent {
            return;
        }
        self.host.dispatch(Callback::Header {
            context: self.context,
            op: HeaderOp::Delete,
            line: name,
        });
    }

    /// Set the response status. Returns the previous one.
    pub fn http_response_code(&mut self, code: u16) -> Option<u16> {
        let previous = self.state.response_code;
        if !self.state.headers_sent {
            self.state.response_code = Some(code);
        }
        previous
    }

    pub fn headers_sent(&self) -> bool {
        self.state.headers_sent
    }

    /// Flush everything and finish the request. Returns `false` if it was
    /// already finished.
    pub fn fastcgi_finish_request(&mut self) -> bool {
        self.state.finish(self.context, self.host)
    }

    /// Send a message to the log sink.
    pub fn error_log(&mut self, message: &str) {
        let mut line = message.to_string();
        line.push('\n');
        self.host.dispatch(Callback::WriteLog {
            context: self.context,
            bytes: line.as_bytes(),
        });
    }

    /// `$_SERVER` entry.
    pub fn server(&self, key: &str) -> Option<&HostValue> {
        self.state.server.get(&MapKey::from(key))
    }

    /// `$_GET` entry.
    pub fn get(&self, key: &str) -> Option<&HostValue> {
        self.state.get.get(&MapKey::from(key))
    }

    /// `$_POST` entry.
    pub fn post(&self, key: &str) -> Option<&HostValue> {
        self.state.post.get(&MapKey::from(key))
    }

    /// `$_COOKIE` entry.
    pub fn cookie(&self, key: &str) -> Option<&HostValue> {
        self.state.cookie.get(&MapKey::from(key))
    }

    /// A global variable, decoded.
    pub fn var(&self, name: &str) -> Option<HostValue> {
        let zval = self.state.vars.get(name)?.clone();
        let raw = self.heap.insert(zval);
        Some(DynamicValue::from_raw(self.values(), raw).as_native())
    }

    /// Assign a global variable.
    pub fn set_var(&mut self, name: &str, value: impl Into<HostValue>) -> Result<(), ScriptError> {
        let encoded = codec::encode(&self.values(), &value.into())
            .map_err(|e| ScriptError::fatal(e.to_string()))?;
        let zval = encoded
            .into_raw()
            .and_then(|raw| self.heap.take(raw))
            .unwrap_or(Zval::Null);
        self.state.vars.insert(name.to_string(), zval);
        Ok(())
    }

    /// `new Class(...args)` for a receiver class.
    pub fn new_object(
        &mut self,
        class: &str,
        args: Vec<HostValue>,
    ) -> Result<ObjectRef, ScriptError> {
        if !self.classes.contains(class) {
            return Err(ScriptError::fatal(format!("Class \"{class}\" not found")));
        }

        let instance = InstanceHandle(self.instance_ids.fetch_add(1, Ordering::Relaxed));
        let args = codec::encode(&self.values(), &HostValue::List(args))
            .map_err(|e| ScriptError::fatal(e.to_string()))?;
        let Some(raw_args) = args.raw() else {
            return Err(ScriptError::fatal("argument list was released"));
        };

        let reply = self.host.dispatch(Callback::Receiver {
            receiver: class,
            instance,
            call: ReceiverCall::New { args: raw_args },
        });

        match reply {
            Reply::Done => {
                let object = ObjectRef {
                    class: class.to_string(),
                    instance,
                };
                self.state.instances.push(object.clone());
                Ok(object)
            }
            _ => Err(ScriptError::exception("Failed to instantiate method receiver")),
        }
    }

    /// Destroy a receiver instance.
    pub fn release_object(&mut self, object: &ObjectRef) {
        let before = self.state.instances.len();
        self.state.instances.retain(|o| o != object);
        if self.state.instances.len() == before {
            return;
        }
        self.host.dispatch(Callback::Receiver {
            receiver: &object.class,
            instance: object.instance,
            call: ReceiverCall::Release,
        });
    }

    pub fn get_property(&mut self, object: &ObjectRef, name: &str) -> HostValue {
        let reply = self.host.dispatch(Callback::Receiver {
            receiver: &object.class,
            instance: object.instance,
            call: ReceiverCall::Get { property: name },
        });
        self.take_value(reply)
    }

    pub fn set_property(&mut self, object: &ObjectRef, name: &str, value: impl Into<HostValue>) {
        let Ok(value) = codec::encode(&self.values(), &value.into()) else {
            return;
        };
        if let Some(raw) = value.raw() {
            self.host.dispatch(Callback::Receiver {
                receiver: &object.class,
                instance: object.instance,
                call: ReceiverCall::Set {
                    property: name,
                    value: raw,
                },
            });
        }
    }

    /// `isset($object->name)`.
    pub fn property_exists(&mut self, object: &ObjectRef, name: &str) -> bool {
        let reply = self.host.dispatch(Callback::Receiver {
            receiver: &object.class,
            instance: object.instance,
            call: ReceiverCall::Exists { property: name },
        });
        matches!(reply, Reply::Exists(true))
    }

    pub fn call_method(
        &mut self,
        object: &ObjectRef,
        method: &str,
        args: Vec<HostValue>,
    ) -> HostValue {
        let Ok(args) = codec::encode(&self.values(), &HostValue::List(args)) else {
            return HostValue::Null;
        };
        let Some(raw_args) = args.raw() else {
            return HostValue::Null;
        };
        let reply = self.host.dispatch(Callback::Receiver {
            receiver: &object.class,
            instance: object.instance,
            call: ReceiverCall::Call {
                method,
                args: raw_args,
            },
        });
        self.take_value(reply)
    }

    fn take_value(&self, reply: Reply) -> HostValue {
        match reply {
            Reply::Value(raw) => DynamicValue::from_raw(self.values(), raw).as_native(),
            _ => HostValue::Null,
        }
    }
}
