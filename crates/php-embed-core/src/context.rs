//! Per-request execution context.
//!
//! This module provides:
//! - [`ExecutionContext`]: sinks and request data for one script request
//! - [`InboundRequest`] and [`ResponseWriter`]: the HTTP pair a host may
//!   attach to a context
//! - [`SharedBuffer`]: a cloneable in-memory output sink

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use php_embed_common::EngineError;

use crate::native::{ContextHandle, HeaderOp};
use crate::value::HostMap;

/// Inbound request attached to a context.
pub trait InboundRequest: Send {
    /// Superglobal server entries for this request.
    fn server_values(&self, document_root: &str, script_filename: &str) -> HostMap;

    /// Raw request body.
    fn body(&self) -> &[u8];
}

/// Response sink attached to a context.
pub trait ResponseWriter: Send {
    /// Apply a header operation to a `Name: value` line (a bare name for
    /// deletes).
    fn apply_header(&mut self, op: HeaderOp, line: &str);

    /// Send the status line. `None` leaves the default status.
    fn send_headers(&mut self, status: Option<u16>);

    /// Write response body bytes.
    fn write_body(&mut self, bytes: &[u8]) -> io::Result<usize>;
}

/// Lifecycle state of an [`ExecutionContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Not started, or startup failed.
    Unbound,
    /// Startup in progress.
    Starting,
    /// Started; scripts may run.
    Active,
    /// Shut down.
    Closed,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextState::Unbound => write!(f, "unbound"),
            ContextState::Starting => write!(f, "starting"),
            ContextState::Active => write!(f, "active"),
            ContextState::Closed => write!(f, "closed"),
        }
    }
}

/// Sinks and request data reachable from native callbacks.
#[derive(Default)]
pub(crate) struct ContextIo {
    pub(crate) output: Option<Box<dyn Write + Send>>,
    pub(crate) log: Option<Box<dyn Write + Send>>,
    pub(crate) request: Option<Box<dyn InboundRequest>>,
    pub(crate) response: Option<Box<dyn ResponseWriter>>,
}

/// One script request.
///
/// A context is started with [`Engine::request_startup`], runs any number of
/// scripts and is closed with [`Engine::request_shutdown`]. Script output is
/// forwarded while it happens, to the HTTP response if one is attached and
/// otherwise to the output sink; without either it is discarded.
///
/// [`Engine::request_startup`]: crate::Engine::request_startup
/// [`Engine::request_shutdown`]: crate::Engine::request_shutdown
pub struct ExecutionContext {
    id: Uuid,
    pub(crate) state: ContextState,
    pub(crate) handle: Option<ContextHandle>,
    pub(crate) io: Arc<Mutex<ContextIo>>,
    document_root: Option<String>,
    script_filename: String,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    /// Create a context without sinks or request.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: ContextState::Unbound,
            handle: None,
            io: Arc::new(Mutex::new(ContextIo::default())),
            document_root: None,
            script_filename: String::new(),
        }
    }

    pub fn builder() -> ExecutionContextBuilder {
        ExecutionContextBuilder::default()
    }

    /// Unique id used in log records.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ContextState::Active
    }

    /// Native handle, while the context is active.
    pub fn handle(&self) -> Option<ContextHandle> {
        self.handle
    }

    pub fn document_root(&self) -> Option<&str> {
        self.document_root.as_deref()
    }

    pub fn script_filename(&self) -> &str {
        &self.script_filename
    }

    pub fn has_request(&self) -> bool {
        self.io.lock().request.is_some()
    }

    pub fn has_response(&self) -> bool {
        self.io.lock().response.is_some()
    }

    /// Replace the output sink. Takes effect for the next write, also while
    /// the context is active.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ConflictingOutputTarget`] if an HTTP response
    /// is attached.
    pub fn set_output(&mut self, output: impl Write + Send + 'static) -> Result<(), EngineError> {
        let mut io = self.io.lock();
        if io.response.is_some() {
            return Err(EngineError::ConflictingOutputTarget);
        }
        io.output = Some(Box::new(output));
        Ok(())
    }

    /// Replace the log sink.
    pub fn set_log(&mut self, log: impl Write + Send + 'static) {
        self.io.lock().log = Some(Box::new(log));
    }

    pub(crate) fn has_conflicting_outputs(&self) -> bool {
        let io = self.io.lock();
        io.output.is_some() && io.response.is_some()
    }

    pub(crate) fn server_values(&self, document_root: &str) -> Option<HostMap> {
        self.io
            .lock()
            .request
            .as_ref()
            .map(|request| request.server_values(document_root, &self.script_filename))
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("handle", &self.handle)
            .field("document_root", &self.document_root)
            .field("script_filename", &self.script_filename)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ExecutionContext`].
#[derive(Default)]
pub struct ExecutionContextBuilder {
    io: ContextIo,
    document_root: Option<String>,
    script_filename: String,
}

impl ExecutionContextBuilder {
    #[must_use]
    pub fn output(mut self, output: impl Write + Send + 'static) -> Self {
        self.io.output = Some(Box::new(output));
        self
    }

    #[must_use]
    pub fn log(mut self, log: impl Write + Send + 'static) -> Self {
        self.io.log = Some(Box::new(log));
        self
    }

    #[must_use]
    pub fn request(mut self, request: impl InboundRequest + 'static) -> Self {
        self.io.request = Some(Box::new(request));
        self
    }

    #[must_use]
    pub fn response(mut self, response: impl ResponseWriter + 'static) -> Self {
        self.io.response = Some(Box::new(response));
        self
    }

    #[must_use]
    pub fn document_root(mut self, document_root: impl Into<String>) -> Self {
        self.document_root = Some(document_root.into());
        self
    }

    #[must_use]
    pub fn script_filename(mut self, script_filename: impl Into<String>) -> Self {
        self.script_filename = script_filename.into();
        self
    }

    pub fn build(self) -> ExecutionContext {
        ExecutionContext {
            id: Uuid::new_v4(),
            state: ContextState::Unbound,
            handle: None,
            io: Arc::new(Mutex::new(self.io)),
            document_root: self.document_root,
            script_filename: self.script_filename,
        }
    }
}

/// Cloneable in-memory sink. All clones share one buffer.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the bytes written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    /// Contents as text, replacing invalid UTF-8.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
