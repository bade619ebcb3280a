//! In-process implementation of the native runtime contract.
//!
//! [`MemoryRuntime`] keeps dynamic values in a [`MemoryHeap`] that follows
//! the runtime's array and coercion rules, and runs scripts that are host
//! closures registered by source text or by file path. It drives the same
//! callbacks a linked runtime would, which makes it the runtime the test
//! suites run against.
//!
//! ```ignore
//! let runtime = Arc::new(MemoryRuntime::new());
//! runtime.script("echo 'hello';", |scope| {
//!     scope.echo("hello");
//!     Ok(HostValue::Null)
//! });
//! ```

mod heap;
mod scope;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

pub use heap::MemoryHeap;
pub use scope::{ObjectRef, ScriptError, ScriptFn, ScriptResult, ScriptScope};

use crate::codec;
use crate::native::{
    Callback, ContextHandle, EngineSlot, HostBridge, NativeFailure, NativeRuntime, RawValue,
    Reply, ValueHeap,
};
use crate::value::{HostMap, HostValue, MapKey};
use scope::RequestState;

/// Bytes requested per body read.
const POST_CHUNK: usize = 8192;

/// Native runtime running host-defined scripts in memory.
pub struct MemoryRuntime {
    slot: EngineSlot,
    heap: Arc<MemoryHeap>,
    running: AtomicBool,
    ini: RwLock<BTreeMap<String, String>>,
    classes: DashSet<String>,
    sources: DashMap<String, Arc<ScriptFn>>,
    files: DashMap<PathBuf, Arc<ScriptFn>>,
    contexts: DashMap<usize, RequestState>,
    context_ids: AtomicUsize,
    instance_ids: AtomicUsize,
    startup_failure: Mutex<Option<String>>,
}

impl Default for MemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self {
            slot: EngineSlot::new(),
            heap: Arc::new(MemoryHeap::new()),
            running: AtomicBool::new(false),
            ini: RwLock::new(BTreeMap::new()),
            classes: DashSet::new(),
            sources: DashMap::new(),
            files: DashMap::new(),
            contexts: DashMap::new(),
            context_ids: AtomicUsize::new(1),
            instance_ids: AtomicUsize::new(1),
            startup_failure: Mutex::new(None),
        }
    }

    /// Register the body run when `source` is evaluated.
    pub fn script<F>(&self, source: &str, body: F) -> &Self
    where
        F: Fn(&mut ScriptScope<'_>) -> ScriptResult + Send + Sync + 'static,
    {
        self.sources
            .insert(source.trim().to_string(), Arc::new(body));
        self
    }

    /// Register the body run when `path` is executed.
    pub fn file<F>(&self, path: impl Into<PathBuf>, body: F) -> &Self
    where
        F: Fn(&mut ScriptScope<'_>) -> ScriptResult + Send + Sync + 'static,
    {
        self.files.insert(path.into(), Arc::new(body));
        self
    }

    /// Make the next request initialisation fail with `message`.
    pub fn fail_next_startup(&self, message: impl Into<String>) {
        *self.startup_failure.lock() = Some(message.into());
    }

    pub fn memory_heap(&self) -> &Arc<MemoryHeap> {
        &self.heap
    }

    /// Number of values currently allocated on the heap.
    pub fn live_values(&self) -> usize {
        self.heap.live_values()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Effective ini setting.
    pub fn ini_value(&self, key: &str) -> Option<String> {
        self.ini.read().get(key).cloned()
    }

    pub fn has_class(&self, name: &str) -> bool {
        self.classes.contains(name)
    }

    /// Number of live native contexts.
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    fn output_buffering(&self) -> bool {
        self.ini_value("output_buffering").is_some_and(|value| {
            let value = value.trim().to_ascii_lowercase();
            value == "on" || value.parse::<i64>().is_ok_and(|size| size > 0)
        })
    }

    /// Run `f` with the request state taken out of the map, so callbacks
    /// made while it runs never contend with it.
    fn with_state<R>(
        &self,
        context: ContextHandle,
        f: impl FnOnce(&mut RequestState) -> R,
    ) -> Result<R, NativeFailure> {
        let Some((id, mut state)) = self.contexts.remove(&context.0) else {
            return Err(NativeFailure::new(format!(
                "Unknown context {:#x}",
                context.0
            )));
        };
        let result = f(&mut state);
        self.contexts.insert(id, state);
        Ok(result)
    }

    fn run(
        &self,
        context: ContextHandle,
        body: &ScriptFn,
        host: &mut dyn HostBridge,
    ) -> Result<HostValue, NativeFailure> {
        self.with_state(context, |state| {
            let mut scope = ScriptScope {
                context,
                heap: &self.heap,
                classes: &self.classes,
                instance_ids: &self.instance_ids,
                state,
                host,
            };
            body(&mut scope)
        })?
        .map_err(|e| NativeFailure::new(e.to_string()))
    }
}

fn parse_ini(text: &str, into: &mut BTreeMap<String, String>) {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('[') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"');
            into.insert(key.trim().to_string(), value.to_string());
        }
    }
}

fn parse_query(query: &str) -> HostMap {
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (MapKey::Str(k.into_owned()), HostValue::String(v.into_owned())))
        .collect()
}

fn parse_cookies(header: &str) -> HostMap {
    header
        .split(';')
        .filter_map(|pair| {
            url::form_urlencoded::parse(pair.trim().as_bytes())
                .next()
                .map(|(k, v)| (MapKey::Str(k.into_owned()), HostValue::String(v.into_owned())))
        })
        .collect()
}

fn read_body(context: ContextHandle, host: &mut dyn HostBridge) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        match host.dispatch(Callback::ReadPost {
            context,
            offset: body.len(),
            max: POST_CHUNK,
        }) {
            Reply::Body(chunk) if !chunk.is_empty() => {
                let done = chunk.len() < POST_CHUNK;
                body.extend_from_slice(&chunk);
                if done {
                    break;
                }
            }
            _ => break,
        }
    }
    body
}

impl NativeRuntime for MemoryRuntime {
    fn slot(&self) -> &EngineSlot {
        &self.slot
    }

    fn heap(&self) -> Arc<dyn ValueHeap> {
        self.heap.clone()
    }

    fn engine_init(&self, ini_text: &str, ini_path: Option<&Path>) -> Result<(), NativeFailure> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(NativeFailure::new("engine already started"));
        }

        let mut ini = BTreeMap::new();
        parse_ini(ini_text, &mut ini);

        if let Some(path) = ini_path {
            match std::fs::read_to_string(path) {
                Ok(text) => parse_ini(&text, &mut ini),
                Err(e) => debug!(path = %path.display(), error = %e, "Ini file not loaded"),
            }
        }

        *self.ini.write() = ini;
        Ok(())
    }

    fn engine_shutdown(&self) {
        self.contexts.clear();
        self.classes.clear();
        self.running.store(false, Ordering::Release);
    }

    fn receiver_define(&self, name: &str) {
        self.classes.insert(name.to_string());
    }

    fn context_new(
        &self,
        server_values: Option<RawValue>,
    ) -> Result<ContextHandle, NativeFailure> {
        if !self.is_running() {
            return Err(NativeFailure::new("engine not started"));
        }

        let values: Arc<dyn ValueHeap> = self.heap.clone();
        let server = match server_values.map(|raw| codec::decode(&values, raw)) {
            Some(HostValue::Map(map)) => map,
            _ => HostMap::new(),
        };

        let id = self.context_ids.fetch_add(1, Ordering::Relaxed);
        self.contexts.insert(id, RequestState::new(server));
        Ok(ContextHandle(id))
    }

    fn context_startup(
        &self,
        context: ContextHandle,
        host: &mut dyn HostBridge,
    ) -> Result<(), NativeFailure> {
        if let Some(message) = self.startup_failure.lock().take() {
            return Err(NativeFailure::new(message));
        }
        let buffering = self.output_buffering();

        self.with_state(context, |state| {
            let field = |state: &RequestState, key: &str| {
                state
                    .server
                    .get(&MapKey::from(key))
                    .and_then(HostValue::as_str)
                    .map(str::to_string)
            };

            if let Some(query) = field(state, "QUERY_STRING") {
                state.get = parse_query(&query);
            }
            if let Some(cookies) = field(state, "HTTP_COOKIE") {
                state.cookie = parse_cookies(&cookies);
            }

            let is_post = field(state, "REQUEST_METHOD").is_some_and(|m| m == "POST");
            let is_form = field(state, "HTTP_CONTENT_TYPE")
                .is_some_and(|t| t.starts_with("application/x-www-form-urlencoded"));
            if is_post && is_form {
                let body = read_body(context, host);
                state.post = parse_query(&String::from_utf8_lossy(&body));
            }

            if buffering {
                state.buffers.push(Vec::new());
            }
        })
    }

    fn context_exec(
        &self,
        context: ContextHandle,
        path: &Path,
        host: &mut dyn HostBridge,
    ) -> Result<(), NativeFailure> {
        let body = self
            .files
            .get(path)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                NativeFailure::new(format!(
                    "Failed opening '{}' for inclusion",
                    path.display()
                ))
            })?;

        self.run(context, body.as_ref(), host).map(|_| ())
    }

    fn context_eval(
        &self,
        context: ContextHandle,
        script: &str,
        host: &mut dyn HostBridge,
    ) -> Result<RawValue, NativeFailure> {
        let body = self
            .sources
            .get(script.trim())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| NativeFailure::new("Parse error: syntax error in evaluated code"))?;

        let result = self.run(context, body.as_ref(), host)?;
        let encoded = codec::encode(&self.heap(), &result)
            .map_err(|e| NativeFailure::new(e.to_string()))?;
        encoded
            .into_raw()
            .ok_or_else(|| NativeFailure::new("result value was released"))
    }

    fn context_bind(&self, context: ContextHandle, name: &str, value: RawValue) {
        let zval = self.heap.get(value);
        if let Some(mut state) = self.contexts.get_mut(&context.0) {
            state
                .vars
                .insert(name.to_string(), zval.unwrap_or(heap::Zval::Null));
        }
    }

    fn context_finish(
        &self,
        context: ContextHandle,
        host: &mut dyn HostBridge,
    ) -> Result<bool, NativeFailure> {
        self.with_state(context, |state| state.finish(context, host))
    }

    fn context_destroy(&self, context: ContextHandle, host: &mut dyn HostBridge) {
        if let Some((_, mut state)) = self.contexts.remove(&context.0) {
            state.shutdown(context, host);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bridge recording output and answering body reads from a fixed body.
    #[derive(Default)]
    struct Recorder {
        output: Vec<u8>,
        log: Vec<u8>,
        statuses: Vec<Option<u16>>,
        body: Vec<u8>,
    }

    impl HostBridge for Recorder {
        fn dispatch(&mut self, callback: Callback<'_>) -> Reply {
            match callback {
                Callback::WriteOut { bytes, .. } => {
                    self.output.extend_from_slice(bytes);
                    Reply::Written(bytes.len())
                }
                Callback::WriteLog { bytes, .. } => {
                    self.log.extend_from_slice(bytes);
                    Reply::Written(bytes.len())
                }
                Callback::SendHeaders { status, .. } => {
                    self.statuses.push(status);
                    Reply::Done
                }
                Callback::ReadPost { offset, max, .. } => {
                    let start = offset.min(self.body.len());
                    let end = (start + max).min(self.body.len());
                    Reply::Body(self.body[start..end].to_vec())
                }
                _ => Reply::Done,
            }
        }
    }

    fn started() -> MemoryRuntime {
        let runtime = MemoryRuntime::new();
        runtime.engine_init("output_buffering = 0\n", None).unwrap();
        runtime
    }

    #[test]
    fn test_engine_init_reads_ini() {
        let runtime = MemoryRuntime::new();
        runtime
            .engine_init("expose_php = 0\nerror_log = \"/tmp/php-error.log\"\n", None)
            .unwrap();

        assert_eq!(runtime.ini_value("expose_php").as_deref(), Some("0"));
        assert_eq!(
            runtime.ini_value("error_log").as_deref(),
            Some("/tmp/php-error.log")
        );
        assert!(runtime.engine_init("", None).is_err());
    }

    #[test]
    fn test_eval_unknown_script_fails() {
        let runtime = started();
        let mut host = Recorder::default();
        let context = runtime.context_new(None).unwrap();

        let err = runtime
            .context_eval(context, "return nope();", &mut host)
            .unwrap_err();
        assert!(err.message.contains("Parse error"));
    }

    #[test]
    fn test_exec_missing_file_fails() {
        let runtime = started();
        let mut host = Recorder::default();
        let context = runtime.context_new(None).unwrap();

        let err = runtime
            .context_exec(context, Path::new("/srv/missing.php"), &mut host)
            .unwrap_err();
        assert!(err.message.contains("/srv/missing.php"));
    }

    #[test]
    fn test_echo_sends_headers_first() {
        let runtime = started();
        runtime.script("echo 'hi';", |scope| {
            scope.http_response_code(201);
            scope.echo("hi");
            Ok(HostValue::Null)
        });
        let mut host = Recorder::default();
        let context = runtime.context_new(None).unwrap();

        let result = runtime.context_eval(context, "echo 'hi';", &mut host).unwrap();
        runtime.heap().destroy(result);

        assert_eq!(host.output, b"hi");
        assert_eq!(host.statuses, vec![Some(201)]);
    }

    #[test]
    fn test_output_buffering_ini_defers_output() {
        let runtime = MemoryRuntime::new();
        runtime.engine_init("output_buffering = 4096\n", None).unwrap();
        runtime.script("echo 'hello';", |scope| {
            scope.echo("hello");
            Ok(HostValue::Null)
        });

        let mut host = Recorder::default();
        let context = runtime.context_new(None).unwrap();
        runtime.context_startup(context, &mut host).unwrap();

        let result = runtime.context_eval(context, "echo 'hello';", &mut host).unwrap();
        runtime.heap().destroy(result);
        assert!(host.output.is_empty());

        runtime.context_destroy(context, &mut host);
        assert_eq!(host.output, b"hello");
        assert_eq!(runtime.live_values(), 0);
    }

    #[test]
    fn test_startup_parses_form_body() {
        let runtime = started();
        let mut host = Recorder {
            body: b"form_arg=form_value&other=a+b".to_vec(),
            ..Recorder::default()
        };

        let server: HostValue = vec![
            ("REQUEST_METHOD", "POST"),
            ("HTTP_CONTENT_TYPE", "application/x-www-form-urlencoded"),
            ("QUERY_STRING", "qs_arg=qs_value"),
            ("HTTP_COOKIE", "session=abc; theme=dark"),
        ]
        .into_iter()
        .collect();
        let values = runtime.heap();
        let server = codec::encode(&values, &server).unwrap();

        let context = runtime.context_new(server.raw()).unwrap();
        drop(server);
        runtime.context_startup(context, &mut host).unwrap();

        let state = runtime.contexts.get(&context.0).unwrap();
        assert_eq!(
            state.post.get(&MapKey::from("form_arg")),
            Some(&HostValue::from("form_value"))
        );
        assert_eq!(
            state.post.get(&MapKey::from("other")),
            Some(&HostValue::from("a b"))
        );
        assert_eq!(
            state.get.get(&MapKey::from("qs_arg")),
            Some(&HostValue::from("qs_value"))
        );
        assert_eq!(
            state.cookie.get(&MapKey::from("theme")),
            Some(&HostValue::from("dark"))
        );
    }

    #[test]
    fn test_injected_startup_failure_fires_once() {
        let runtime = started();
        let mut host = Recorder::default();
        let context = runtime.context_new(None).unwrap();

        runtime.fail_next_startup("Failed to start request");
        let err = runtime.context_startup(context, &mut host).unwrap_err();
        assert_eq!(err.message, "Failed to start request");

        runtime.context_startup(context, &mut host).unwrap();
    }

    #[test]
    fn test_finish_only_once() {
        let runtime = started();
        let mut host = Recorder::default();
        let context = runtime.context_new(None).unwrap();

        assert!(runtime.context_finish(context, &mut host).unwrap());
        assert!(!runtime.context_finish(context, &mut host).unwrap());
        assert_eq!(host.statuses, vec![None]);
    }

    #[test]
    fn test_bind_copies_value() {
        let runtime = started();
        runtime.script("return $name;", |scope| {
            Ok(scope.var("name").unwrap_or_default())
        });
        let mut host = Recorder::default();
        let context = runtime.context_new(None).unwrap();

        let values = runtime.heap();
        let value = codec::encode(&values, &HostValue::from("alice")).unwrap();
        runtime.context_bind(context, "name", value.raw().unwrap());
        drop(value);

        let result = runtime.context_eval(context, "return $name;", &mut host).unwrap();
        assert_eq!(values.get_string(result), "alice");
        values.destroy(result);
        assert_eq!(runtime.live_values(), 0);
    }
}
