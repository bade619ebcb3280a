//! Engine lifecycle and request execution.
//!
//! The [`Engine`] owns the native runtime for its whole life and is passed by
//! reference into every operation. It defines two lifecycle phases:
//! - engine: [`Engine::initialize`] / [`Engine::destroy`]
//! - request: [`Engine::request_startup`] / [`Engine::request_shutdown`]
//!
//! Only one engine may be active on a runtime at a time. The rule is held by
//! the runtime's [`EngineSlot`](crate::native::EngineSlot): a runtime bound to
//! a process-wide library keeps it in a static, the in-memory runtime owns
//! one per instance.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use php_embed_common::{CallbackError, EngineError, RuntimeConfig};

use crate::codec::{self, DynamicValue};
use crate::context::{ContextIo, ContextState, ExecutionContext};
use crate::native::{
    Callback, ContextHandle, HostBridge, InstanceHandle, NativeRuntime, ReceiverCall, Reply,
    ValueHeap,
};
use crate::receiver::{ReceiverMessage, ReceiverObject, ReceiverRegistry, ReceiverResponse};
use crate::ser::to_host_value;
use crate::value::HostValue;

/// Script text reported when finishing a request fails.
pub const FINISH_REQUEST_SCRIPT: &str = "return fastcgi_finish_request();";

/// A registered context, as seen by callbacks.
struct ContextEntry {
    id: Uuid,
    io: Arc<Mutex<ContextIo>>,
}

/// The embedded engine.
///
/// # Example
///
/// ```ignore
/// let runtime = Arc::new(MemoryRuntime::new());
/// let mut engine = Engine::new(runtime, &RuntimeConfig::default());
/// engine.initialize()?;
///
/// let mut ctx = ExecutionContext::builder().output(SharedBuffer::new()).build();
/// engine.request_startup(&mut ctx)?;
/// let value = engine.eval(&mut ctx, "return 1 + 1;")?;
/// engine.request_shutdown(&mut ctx);
/// ```
pub struct Engine {
    runtime: Arc<dyn NativeRuntime>,
    config: RuntimeConfig,
    ini_path_overridden: bool,
    running: bool,
    contexts: HashMap<ContextHandle, ContextEntry>,
    receivers: ReceiverRegistry,
}

impl Engine {
    /// Create an engine over a native runtime. Nothing is started yet.
    pub fn new(runtime: Arc<dyn NativeRuntime>, config: &RuntimeConfig) -> Self {
        Self {
            runtime,
            config: config.clone(),
            ini_path_overridden: false,
            running: false,
            contexts: HashMap::new(),
            receivers: ReceiverRegistry::new(),
        }
    }

    /// Override the runtime's ini file path.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] if the engine is already
    /// initialized or the path was already overridden.
    pub fn set_ini_path(&mut self, path: impl Into<PathBuf>) -> Result<(), EngineError> {
        if self.running {
            return Err(EngineError::invalid_config(
                "ini path must be set before the engine is initialized",
            ));
        }
        if self.ini_path_overridden {
            return Err(EngineError::invalid_config("ini path may only be set once"));
        }

        let path = path.into();
        debug!(path = %path.display(), "Ini path override set");
        self.config.engine.ini_path = Some(path);
        self.ini_path_overridden = true;
        Ok(())
    }

    /// The ini file path handed to the runtime, if any.
    pub fn ini_path(&self) -> Option<&Path> {
        self.config.engine.ini_path.as_deref()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Start the native engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyInitialized`] if an engine is already
    /// active on the runtime and [`EngineError::NativeInitFailed`] if the
    /// runtime refuses to start.
    pub fn initialize(&mut self) -> Result<(), EngineError> {
        if self.running || !self.runtime.slot().claim() {
            return Err(EngineError::AlreadyInitialized);
        }

        let ini_text = self.config.engine.ini_text();
        if let Err(e) = self
            .runtime
            .engine_init(&ini_text, self.config.engine.ini_path.as_deref())
        {
            self.runtime.slot().release();
            warn!(error = %e, "Native engine failed to start");
            return Err(EngineError::native_init_failed(e.message));
        }

        self.running = true;
        info!(
            ini_path = ?self.config.engine.ini_path,
            ini_entries = self.config.engine.ini_entries().len(),
            "Engine initialized"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Shut the engine down.
    ///
    /// Still registered contexts are torn down first, then the receivers are
    /// dropped and the native engine is stopped. Calling this on an engine
    /// that is not running does nothing.
    pub fn destroy(&mut self) {
        if !self.running {
            return;
        }

        let handles: Vec<ContextHandle> = self.contexts.keys().copied().collect();
        let heap = self.runtime.heap();
        for handle in handles {
            let mut dispatcher = Dispatcher {
                contexts: &self.contexts,
                receivers: &mut self.receivers,
                heap: &heap,
            };
            self.runtime.context_destroy(handle, &mut dispatcher);
            if let Some(entry) = self.contexts.remove(&handle) {
                debug!(context_id = %entry.id, "Context shut down with engine");
            }
        }

        self.receivers.clear();
        self.runtime.engine_shutdown();
        self.runtime.slot().release();
        self.running = false;
        info!("Engine destroyed");
    }

    /// Register a receiver class.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotRunning`] before initialization and
    /// [`EngineError::DuplicateReceiver`] if the name is taken.
    pub fn define<F>(&mut self, name: &str, constructor: F) -> Result<(), EngineError>
    where
        F: Fn(Vec<HostValue>) -> Result<Box<dyn ReceiverObject>, String> + Send + Sync + 'static,
    {
        self.ensure_running()?;
        self.receivers.define(name, Box::new(constructor))?;
        self.runtime.receiver_define(name);
        debug!(receiver = name, "Receiver defined");
        Ok(())
    }

    pub fn receivers(&self) -> &ReceiverRegistry {
        &self.receivers
    }

    /// Number of contexts currently registered.
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Start a request on `ctx`.
    ///
    /// On failure the context is left [`ContextState::Unbound`] and nothing
    /// built for it stays allocated.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotRunning`] if the engine is not initialized
    /// - [`EngineError::ConflictingOutputTarget`] if both an output sink and
    ///   an HTTP response are attached
    /// - [`EngineError::EnvironmentBuildFailed`] if the server values cannot
    ///   be encoded
    /// - [`EngineError::ContextInitFailed`] if the runtime refuses the request
    pub fn request_startup(&mut self, ctx: &mut ExecutionContext) -> Result<(), EngineError> {
        self.ensure_running()?;
        if ctx.state != ContextState::Unbound {
            return Err(EngineError::context_init_failed(format!(
                "context is {}",
                ctx.state
            )));
        }
        if ctx.has_conflicting_outputs() {
            return Err(EngineError::ConflictingOutputTarget);
        }

        ctx.state = ContextState::Starting;
        match self.start(ctx) {
            Ok(handle) => {
                ctx.handle = Some(handle);
                ctx.state = ContextState::Active;
                info!(
                    context_id = %ctx.id(),
                    handle = handle.0,
                    script = ctx.script_filename(),
                    "Request started"
                );
                Ok(())
            }
            Err(e) => {
                ctx.state = ContextState::Unbound;
                warn!(context_id = %ctx.id(), error = %e, "Request startup failed");
                Err(e)
            }
        }
    }

    fn start(&mut self, ctx: &ExecutionContext) -> Result<ContextHandle, EngineError> {
        let heap = self.runtime.heap();
        let document_root = ctx
            .document_root()
            .or(self.config.request.document_root.as_deref())
            .unwrap_or_default()
            .to_string();

        let server_values = match ctx.server_values(&document_root) {
            Some(values) => Some(
                codec::encode(&heap, &HostValue::Map(values))
                    .map_err(|e| EngineError::environment_build_failed(e.to_string()))?,
            ),
            None => None,
        };

        let handle = self
            .runtime
            .context_new(server_values.as_ref().and_then(DynamicValue::raw))
            .map_err(|e| EngineError::context_init_failed(e.message))?;
        // the runtime keeps its own copy
        drop(server_values);

        self.contexts.insert(
            handle,
            ContextEntry {
                id: ctx.id(),
                io: Arc::clone(&ctx.io),
            },
        );

        let mut dispatcher = Dispatcher {
            contexts: &self.contexts,
            receivers: &mut self.receivers,
            heap: &heap,
        };
        if let Err(e) = self.runtime.context_startup(handle, &mut dispatcher) {
            self.runtime.context_destroy(handle, &mut dispatcher);
            self.contexts.remove(&handle);
            return Err(EngineError::context_init_failed(e.message));
        }

        Ok(handle)
    }

    /// End the request on `ctx`.
    ///
    /// Pending output is flushed to the context's sinks before the context
    /// is unregistered. Calling this again, or on a context that never
    /// started, does nothing.
    pub fn request_shutdown(&mut self, ctx: &mut ExecutionContext) {
        if ctx.state != ContextState::Active {
            return;
        }
        let Some(handle) = ctx.handle.take() else {
            ctx.state = ContextState::Closed;
            return;
        };

        let registered = self
            .contexts
            .get(&handle)
            .is_some_and(|entry| entry.id == ctx.id());
        if self.running && registered {
            let heap = self.runtime.heap();
            let mut dispatcher = Dispatcher {
                contexts: &self.contexts,
                receivers: &mut self.receivers,
                heap: &heap,
            };
            self.runtime.context_destroy(handle, &mut dispatcher);
            self.contexts.remove(&handle);
        }

        ctx.state = ContextState::Closed;
        info!(context_id = %ctx.id(), "Request shut down");
    }

    /// Execute a script file.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ContextNotActive`] outside the request window
    /// and [`EngineError::ExecFailed`] if the script fails.
    #[instrument(skip_all, fields(context_id = %ctx.id()))]
    pub fn exec(
        &mut self,
        ctx: &mut ExecutionContext,
        path: impl AsRef<Path>,
    ) -> Result<(), EngineError> {
        let handle = self.active_handle(ctx)?;
        let path = path.as_ref();
        let heap = self.runtime.heap();
        let mut dispatcher = Dispatcher {
            contexts: &self.contexts,
            receivers: &mut self.receivers,
            heap: &heap,
        };

        debug!(path = %path.display(), "Executing script file");
        self.runtime
            .context_exec(handle, path, &mut dispatcher)
            .map_err(|e| EngineError::exec_failed(path, e.message))
    }

    /// Evaluate a script and return its result.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ContextNotActive`] outside the request window
    /// and [`EngineError::EvalFailed`] if the script fails.
    #[instrument(skip_all, fields(context_id = %ctx.id()))]
    pub fn eval(
        &mut self,
        ctx: &mut ExecutionContext,
        script: &str,
    ) -> Result<DynamicValue, EngineError> {
        let handle = self.active_handle(ctx)?;
        let heap = self.runtime.heap();
        let mut dispatcher = Dispatcher {
            contexts: &self.contexts,
            receivers: &mut self.receivers,
            heap: &heap,
        };

        debug!(script_len = script.len(), "Evaluating script");
        let raw = self
            .runtime
            .context_eval(handle, script, &mut dispatcher)
            .map_err(|e| EngineError::eval_failed(script, e.message))?;
        Ok(DynamicValue::from_raw(heap, raw))
    }

    /// Bind a host value as a script variable.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Codec`] if the value cannot be encoded; the
    /// binding is then not made.
    pub fn bind(
        &mut self,
        ctx: &mut ExecutionContext,
        name: &str,
        value: &HostValue,
    ) -> Result<(), EngineError> {
        let handle = self.active_handle(ctx)?;
        let heap = self.runtime.heap();

        let encoded = codec::encode(&heap, value)?;
        if let Some(raw) = encoded.raw() {
            self.runtime.context_bind(handle, name, raw);
        }
        debug!(context_id = %ctx.id(), name, kind = value.kind_name(), "Value bound");
        Ok(())
    }

    /// Bind any serializable value as a script variable.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Codec`] if the value has no engine
    /// representation.
    pub fn bind_serialized<T: Serialize + ?Sized>(
        &mut self,
        ctx: &mut ExecutionContext,
        name: &str,
        value: &T,
    ) -> Result<(), EngineError> {
        let value = to_host_value(value)?;
        self.bind(ctx, name, &value)
    }

    /// Finish the request early, flushing output and sending headers.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyFinished`] on the second call for the
    /// same context.
    #[instrument(skip_all, fields(context_id = %ctx.id()))]
    pub fn finish_request(&mut self, ctx: &mut ExecutionContext) -> Result<(), EngineError> {
        let handle = self.active_handle(ctx)?;
        let heap = self.runtime.heap();
        let mut dispatcher = Dispatcher {
            contexts: &self.contexts,
            receivers: &mut self.receivers,
            heap: &heap,
        };

        match self.runtime.context_finish(handle, &mut dispatcher) {
            Ok(true) => {
                debug!("Request finished");
                Ok(())
            }
            Ok(false) => Err(EngineError::AlreadyFinished),
            Err(e) => Err(EngineError::eval_failed(FINISH_REQUEST_SCRIPT, e.message)),
        }
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.running {
            Ok(())
        } else {
            Err(EngineError::NotRunning)
        }
    }

    fn active_handle(&self, ctx: &ExecutionContext) -> Result<ContextHandle, EngineError> {
        self.ensure_running()?;
        match (ctx.state, ctx.handle) {
            (ContextState::Active, Some(handle)) if self.contexts.contains_key(&handle) => {
                Ok(handle)
            }
            (state, _) => Err(EngineError::context_not_active(state)),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Answers callbacks from the runtime.
struct Dispatcher<'a> {
    contexts: &'a HashMap<ContextHandle, ContextEntry>,
    receivers: &'a mut ReceiverRegistry,
    heap: &'a Arc<dyn ValueHeap>,
}

/// What a receiver miss is answered with.
enum Neutral {
    Failed,
    Null,
    False,
    Done,
}

impl Dispatcher<'_> {
    fn entry(&self, context: ContextHandle) -> Result<&ContextEntry, CallbackError> {
        self.contexts
            .get(&context)
            .ok_or(CallbackError::UnknownContext { handle: context.0 })
    }

    fn write(sink: Option<&mut Box<dyn Write + Send>>, bytes: &[u8]) -> Reply {
        match sink {
            // Nothing to write to; the bytes are dropped.
            None => Reply::Written(bytes.len()),
            Some(sink) => match sink.write_all(bytes) {
                Ok(()) => Reply::Written(bytes.len()),
                Err(e) => {
                    warn!(error = %e, "Output sink write failed");
                    Reply::Failed
                }
            },
        }
    }

    fn value_reply(&self, value: &HostValue) -> Reply {
        let encoded = codec::encode(self.heap, value).or_else(|e| {
            warn!(error = %e, "Receiver result could not be encoded");
            codec::encode(self.heap, &HostValue::Null)
        });
        match encoded {
            Ok(value) => value.into_raw().map_or(Reply::Failed, Reply::Value),
            Err(_) => Reply::Failed,
        }
    }

    fn neutral(&self, neutral: &Neutral) -> Reply {
        match neutral {
            Neutral::Failed => Reply::Failed,
            Neutral::Null => self.value_reply(&HostValue::Null),
            Neutral::False => Reply::Exists(false),
            Neutral::Done => Reply::Done,
        }
    }

    fn receiver(
        &mut self,
        receiver: &str,
        instance: InstanceHandle,
        call: ReceiverCall<'_>,
    ) -> Reply {
        let (message, neutral) = match call {
            ReceiverCall::New { args } => (
                ReceiverMessage::New {
                    receiver,
                    instance,
                    args: codec::decode_list(self.heap, args),
                },
                Neutral::Failed,
            ),
            ReceiverCall::Get { property } => (
                ReceiverMessage::Get {
                    receiver,
                    instance,
                    property,
                },
                Neutral::Null,
            ),
            ReceiverCall::Set { property, value } => (
                ReceiverMessage::Set {
                    receiver,
                    instance,
                    property,
                    value: codec::decode(self.heap, value),
                },
                Neutral::Done,
            ),
            ReceiverCall::Exists { property } => (
                ReceiverMessage::Exists {
                    receiver,
                    instance,
                    property,
                },
                Neutral::False,
            ),
            ReceiverCall::Call { method, args } => (
                ReceiverMessage::Call {
                    receiver,
                    instance,
                    method,
                    args: codec::decode_list(self.heap, args),
                },
                Neutral::Null,
            ),
            ReceiverCall::Release => (
                ReceiverMessage::Release { receiver, instance },
                Neutral::Done,
            ),
        };

        match self.receivers.handle(message) {
            ReceiverResponse::Created | ReceiverResponse::Done => Reply::Done,
            ReceiverResponse::Exists(exists) => Reply::Exists(exists),
            ReceiverResponse::Value(value) => self.value_reply(&value),
            ReceiverResponse::NotFound(e) => {
                debug!(error = %e, "Receiver callback miss");
                self.neutral(&neutral)
            }
            ReceiverResponse::Rejected(e) => {
                warn!(error = %e, "Receiver constructor failed");
                Reply::Failed
            }
        }
    }
}

fn unknown_context(error: &CallbackError, reply: Reply) -> Reply {
    debug!(error = %error, "Callback for unknown context");
    reply
}

impl HostBridge for Dispatcher<'_> {
    fn dispatch(&mut self, callback: Callback<'_>) -> Reply {
        match callback {
            Callback::WriteOut { context, bytes } => {
                let entry = match self.entry(context) {
                    Ok(entry) => entry,
                    Err(e) => return unknown_context(&e, Reply::Failed),
                };
                let mut io = entry.io.lock();
                let io = &mut *io;
                if let Some(response) = io.response.as_mut() {
                    return match response.write_body(bytes) {
                        Ok(written) => Reply::Written(written),
                        Err(e) => {
                            warn!(context_id = %entry.id, error = %e, "Response write failed");
                            Reply::Failed
                        }
                    };
                }
                Self::write(io.output.as_mut(), bytes)
            }
            Callback::WriteLog { context, bytes } => {
                let entry = match self.entry(context) {
                    Ok(entry) => entry,
                    Err(e) => return unknown_context(&e, Reply::Failed),
                };
                let mut io = entry.io.lock();
                if io.log.is_none() {
                    let message = String::from_utf8_lossy(bytes);
                    info!(context_id = %entry.id, script_log = true, "{}", message.trim_end());
                    return Reply::Written(bytes.len());
                }
                Self::write(io.log.as_mut(), bytes)
            }
            Callback::Header { context, op, line } => {
                let entry = match self.entry(context) {
                    Ok(entry) => entry,
                    Err(e) => return unknown_context(&e, Reply::Done),
                };
                if let Some(response) = entry.io.lock().response.as_mut() {
                    response.apply_header(op, line);
                }
                Reply::Done
            }
            Callback::SendHeaders { context, status } => {
                let entry = match self.entry(context) {
                    Ok(entry) => entry,
                    Err(e) => return unknown_context(&e, Reply::Done),
                };
                if let Some(response) = entry.io.lock().response.as_mut() {
                    response.send_headers(status);
                }
                Reply::Done
            }
            Callback::ReadPost {
                context,
                offset,
                max,
            } => {
                let entry = match self.entry(context) {
                    Ok(entry) => entry,
                    Err(e) => return unknown_context(&e, Reply::Body(Vec::new())),
                };
                let io = entry.io.lock();
                let body = io.request.as_ref().map_or(&[][..], |request| request.body());
                let start = offset.min(body.len());
                let end = start.saturating_add(max).min(body.len());
                Reply::Body(body[start..end].to_vec())
            }
            Callback::Receiver {
                receiver,
                instance,
                call,
            } => self.receiver(receiver, instance, call),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SharedBuffer;
    use crate::memory::MemoryHeap;
    use crate::native::HeaderOp;

    fn heap() -> Arc<dyn ValueHeap> {
        Arc::new(MemoryHeap::new())
    }

    #[test]
    fn test_unknown_context_answers_neutrally() {
        let contexts = HashMap::new();
        let mut receivers = ReceiverRegistry::new();
        let heap = heap();
        let mut dispatcher = Dispatcher {
            contexts: &contexts,
            receivers: &mut receivers,
            heap: &heap,
        };
        let context = ContextHandle(7);

        assert_eq!(
            dispatcher.entry(context).err(),
            Some(CallbackError::UnknownContext { handle: 7 })
        );
        assert_eq!(
            dispatcher.dispatch(Callback::WriteOut {
                context,
                bytes: b"lost"
            }),
            Reply::Failed
        );
        assert_eq!(
            dispatcher.dispatch(Callback::ReadPost {
                context,
                offset: 0,
                max: 16
            }),
            Reply::Body(Vec::new())
        );
        assert_eq!(
            dispatcher.dispatch(Callback::Header {
                context,
                op: HeaderOp::Replace,
                line: "X-Testing: Hello"
            }),
            Reply::Done
        );
    }

    #[test]
    fn test_registered_context_receives_output() {
        let output = SharedBuffer::new();
        let ctx = ExecutionContext::builder().output(output.clone()).build();
        let context = ContextHandle(3);
        let mut contexts = HashMap::new();
        contexts.insert(
            context,
            ContextEntry {
                id: ctx.id(),
                io: Arc::clone(&ctx.io),
            },
        );
        let mut receivers = ReceiverRegistry::new();
        let heap = heap();
        let mut dispatcher = Dispatcher {
            contexts: &contexts,
            receivers: &mut receivers,
            heap: &heap,
        };

        let reply = dispatcher.dispatch(Callback::WriteOut {
            context,
            bytes: b"Hello",
        });

        assert_eq!(reply, Reply::Written(5));
        assert_eq!(output.to_string_lossy(), "Hello");
    }
}
