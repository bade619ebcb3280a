//! Runtime bound to the libphp embed shim.
//!
//! The shim wraps the PHP SAPI in a small C interface: lifecycle and value
//! functions are imported below, and the SAPI hooks call back into the
//! `engine*` functions exported from this module. Callbacks are routed to the
//! [`HostBridge`] installed for the duration of the native call that runs
//! script code.
//!
//! Handles map directly to shim pointers: a [`RawValue`] is a `zval *`, a
//! [`ContextHandle`] an `engine_context *` and an [`InstanceHandle`] the
//! receiver object pointer. Values live on the request heap, so a handle
//! must not be used after the request that created it has shut down.
//!
//! The shim sources and `php_embed_shim.h`, which declares both directions of
//! the interface, live in `shim/` and are compiled by the build script.

use std::cell::Cell;
use std::ffi::{CStr, CString, c_char, c_int, c_uint, c_void};
use std::path::Path;
use std::ptr;
use std::sync::Arc;

use tracing::{debug, warn};

use php_embed_common::CallbackError;

use crate::native::{
    ArrayKey, Callback, ContextHandle, EngineSlot, HeaderOp, HostBridge, InstanceHandle,
    NativeFailure, NativeRuntime, RawValue, ReceiverCall, Reply, ValueHeap, ValueKind,
};

/// libphp keeps its state in process globals.
static SLOT: EngineSlot = EngineSlot::new();

#[repr(C)]
struct Zval {
    _private: [u8; 0],
}

#[repr(C)]
struct EngineContext {
    _private: [u8; 0],
}

unsafe extern "C" {
    fn engine_init(ini: *const c_char, ini_path: *const c_char) -> c_int;
    fn engine_shutdown();
    fn engine_last_error() -> *const c_char;
    fn receiver_define(name: *const c_char);

    fn context_new(server_values: *mut Zval) -> *mut EngineContext;
    fn context_startup(context: *mut EngineContext) -> c_int;
    fn context_exec(context: *mut EngineContext, filename: *const c_char) -> c_int;
    fn context_eval(
        context: *mut EngineContext,
        script: *const c_char,
        result: *mut *mut Zval,
    ) -> c_int;
    fn context_bind(context: *mut EngineContext, name: *const c_char, value: *mut Zval);
    fn context_finish(context: *mut EngineContext) -> c_int;
    fn context_destroy(context: *mut EngineContext);

    fn value_new() -> *mut Zval;
    fn value_destroy(value: *mut Zval);
    fn value_kind(value: *mut Zval) -> u8;
    fn value_set_null(value: *mut Zval);
    fn value_set_long(value: *mut Zval, num: i64);
    fn value_set_double(value: *mut Zval, num: f64);
    fn value_set_bool(value: *mut Zval, flag: bool);
    fn value_set_string(value: *mut Zval, text: *const c_char, len: usize);
    fn value_set_array(value: *mut Zval, size: c_uint);
    fn value_set_object(value: *mut Zval);
    fn value_array_next_set(array: *mut Zval, item: *mut Zval);
    fn value_array_index_set(array: *mut Zval, index: i64, item: *mut Zval);
    fn value_array_key_set(array: *mut Zval, key: *const c_char, len: usize, item: *mut Zval);
    fn value_object_property_set(object: *mut Zval, name: *const c_char, item: *mut Zval);
    fn value_get_long(value: *mut Zval) -> i64;
    fn value_get_double(value: *mut Zval) -> f64;
    fn value_get_bool(value: *mut Zval) -> bool;
    fn value_get_string(value: *mut Zval, len: *mut usize) -> *mut c_char;
    fn value_free_string(text: *mut c_char);
    fn value_array_size(array: *mut Zval) -> c_uint;
    fn value_array_is_associative(array: *mut Zval) -> bool;
    fn value_array_entry(
        array: *mut Zval,
        position: c_uint,
        index: *mut i64,
        name: *mut *mut c_char,
        name_len: *mut usize,
    ) -> *mut Zval;
}

thread_local! {
    static BRIDGE: Cell<Option<*mut (dyn HostBridge + 'static)>> = const { Cell::new(None) };
}

/// Clears the installed bridge, restoring the previous one.
struct BridgeGuard(Option<*mut (dyn HostBridge + 'static)>);

impl Drop for BridgeGuard {
    fn drop(&mut self) {
        BRIDGE.with(|bridge| bridge.set(self.0));
    }
}

/// Run `f` with `host` receiving every callback made on this thread.
fn with_bridge<R>(host: &mut dyn HostBridge, f: impl FnOnce() -> R) -> R {
    let host: *mut (dyn HostBridge + '_) = host;
    // SAFETY: only the lifetime is erased. The pointer is removed by the
    // guard before `host` goes out of scope.
    let host: *mut (dyn HostBridge + 'static) = unsafe { std::mem::transmute(host) };
    let _guard = BridgeGuard(BRIDGE.with(|bridge| bridge.replace(Some(host))));
    f()
}

/// Hand a callback to the installed bridge.
///
/// Fails with [`CallbackError::EngineNotRunning`] when no native call is in
/// progress on this thread, for example when the runtime logs during its own
/// startup or shutdown.
fn dispatch(callback: Callback<'_>) -> Result<Reply, CallbackError> {
    let host = BRIDGE
        .with(Cell::get)
        .ok_or(CallbackError::EngineNotRunning)?;
    // SAFETY: the bridge is installed by `with_bridge`, which keeps it alive
    // and exclusively borrowed until its guard removes it.
    Ok(unsafe { (*host).dispatch(callback) })
}

/// Answer used when a callback could not be dispatched.
fn undelivered(result: Result<Reply, CallbackError>) -> Option<Reply> {
    match result {
        Ok(reply) => Some(reply),
        Err(e) => {
            debug!(error = %e, "Callback not delivered");
            None
        }
    }
}

fn last_error(fallback: &str) -> NativeFailure {
    // SAFETY: the shim returns null or a string it owns until the next call.
    let message = unsafe {
        let text = engine_last_error();
        if text.is_null() {
            None
        } else {
            Some(CStr::from_ptr(text).to_string_lossy().into_owned())
        }
    };
    NativeFailure::new(message.unwrap_or_else(|| fallback.to_string()))
}

fn c_string(text: &str) -> Result<CString, NativeFailure> {
    CString::new(text).map_err(|_| NativeFailure::new(format!("{text:?} contains a NUL byte")))
}

fn zval(value: RawValue) -> *mut Zval {
    value.0 as *mut Zval
}

fn context(handle: ContextHandle) -> *mut EngineContext {
    handle.0 as *mut EngineContext
}

/// # Safety
///
/// `text` must be null or a valid NUL-terminated string.
unsafe fn borrowed_str<'a>(text: *const c_char) -> Option<&'a str> {
    if text.is_null() {
        return None;
    }
    // SAFETY: guaranteed by the caller.
    unsafe { CStr::from_ptr(text) }.to_str().ok()
}

/// # Safety
///
/// `buffer` must be null or valid for `length` bytes.
unsafe fn borrowed_bytes<'a>(buffer: *const c_void, length: c_uint) -> &'a [u8] {
    if buffer.is_null() || length == 0 {
        return &[];
    }
    // SAFETY: guaranteed by the caller.
    unsafe { std::slice::from_raw_parts(buffer.cast::<u8>(), length as usize) }
}

/// Values owned by libphp.
#[derive(Debug, Default)]
pub struct LibphpHeap;

impl ValueHeap for LibphpHeap {
    fn alloc(&self) -> Result<RawValue, NativeFailure> {
        // SAFETY: value_new has no preconditions.
        let value = unsafe { value_new() };
        if value.is_null() {
            return Err(last_error("could not allocate value"));
        }
        Ok(RawValue(value as usize))
    }

    fn destroy(&self, value: RawValue) {
        // SAFETY: handles only come from this heap or from the runtime.
        unsafe { value_destroy(zval(value)) }
    }

    fn kind(&self, value: RawValue) -> ValueKind {
        // SAFETY: see `destroy`.
        ValueKind::from_raw(unsafe { value_kind(zval(value)) })
    }

    fn set_null(&self, value: RawValue) {
        // SAFETY: see `destroy`.
        unsafe { value_set_null(zval(value)) }
    }

    fn set_long(&self, value: RawValue, num: i64) {
        // SAFETY: see `destroy`.
        unsafe { value_set_long(zval(value), num) }
    }

    fn set_double(&self, value: RawValue, num: f64) {
        // SAFETY: see `destroy`.
        unsafe { value_set_double(zval(value), num) }
    }

    fn set_bool(&self, value: RawValue, flag: bool) {
        // SAFETY: see `destroy`.
        unsafe { value_set_bool(zval(value), flag) }
    }

    fn set_string(&self, value: RawValue, text: &str) {
        // SAFETY: the shim copies `len` bytes out of `text`.
        unsafe { value_set_string(zval(value), text.as_ptr().cast(), text.len()) }
    }

    fn set_array(&self, value: RawValue, size_hint: usize) {
        let size = c_uint::try_from(size_hint).unwrap_or(c_uint::MAX);
        // SAFETY: see `destroy`.
        unsafe { value_set_array(zval(value), size) }
    }

    fn set_object(&self, value: RawValue) {
        // SAFETY: see `destroy`.
        unsafe { value_set_object(zval(value)) }
    }

    fn array_push(&self, array: RawValue, item: RawValue) {
        // SAFETY: the shim takes ownership of `item`.
        unsafe { value_array_next_set(zval(array), zval(item)) }
    }

    fn array_insert(&self, array: RawValue, key: &ArrayKey, item: RawValue) {
        // SAFETY: the shim takes ownership of `item` and copies the key.
        unsafe {
            match key {
                ArrayKey::Index(index) => {
                    value_array_index_set(zval(array), *index, zval(item));
                }
                ArrayKey::Name(name) => value_array_key_set(
                    zval(array),
                    name.as_ptr().cast(),
                    name.len(),
                    zval(item),
                ),
            }
        }
    }

    fn object_set_property(&self, object: RawValue, name: &str, item: RawValue) {
        let Ok(name) = c_string(name) else {
            warn!(property = name, "Property name not representable");
            return;
        };
        // SAFETY: the shim copies both the name and `item`.
        unsafe { value_object_property_set(zval(object), name.as_ptr(), zval(item)) }
    }

    fn get_long(&self, value: RawValue) -> i64 {
        // SAFETY: see `destroy`.
        unsafe { value_get_long(zval(value)) }
    }

    fn get_double(&self, value: RawValue) -> f64 {
        // SAFETY: see `destroy`.
        unsafe { value_get_double(zval(value)) }
    }

    fn get_bool(&self, value: RawValue) -> bool {
        // SAFETY: see `destroy`.
        unsafe { value_get_bool(zval(value)) }
    }

    fn get_string(&self, value: RawValue) -> String {
        let mut len = 0;
        // SAFETY: the returned buffer holds `len` bytes and is freed with
        // value_free_string.
        unsafe {
            let text = value_get_string(zval(value), &raw mut len);
            if text.is_null() {
                return String::new();
            }
            let bytes = std::slice::from_raw_parts(text.cast::<u8>(), len);
            let result = String::from_utf8_lossy(bytes).into_owned();
            value_free_string(text);
            result
        }
    }

    fn array_len(&self, value: RawValue) -> usize {
        // SAFETY: see `destroy`.
        unsafe { value_array_size(zval(value)) as usize }
    }

    fn array_is_associative(&self, value: RawValue) -> bool {
        // SAFETY: see `destroy`.
        unsafe { value_array_is_associative(zval(value)) }
    }

    fn array_entries(&self, value: RawValue) -> Vec<(ArrayKey, RawValue)> {
        // SAFETY: see `destroy`.
        let size = unsafe { value_array_size(zval(value)) };
        let mut entries = Vec::with_capacity(size as usize);

        for position in 0..size {
            let mut index = 0;
            let mut name: *mut c_char = ptr::null_mut();
            let mut name_len = 0;
            // SAFETY: the entry is a fresh copy owned by the caller; a
            // returned name is freed with value_free_string.
            unsafe {
                let item = value_array_entry(
                    zval(value),
                    position,
                    &raw mut index,
                    &raw mut name,
                    &raw mut name_len,
                );
                if item.is_null() {
                    continue;
                }
                let key = if name.is_null() {
                    ArrayKey::Index(index)
                } else {
                    let bytes = std::slice::from_raw_parts(name.cast::<u8>(), name_len);
                    let key = ArrayKey::Name(String::from_utf8_lossy(bytes).into_owned());
                    value_free_string(name);
                    key
                };
                entries.push((key, RawValue(item as usize)));
            }
        }
        entries
    }
}

/// The process-wide libphp runtime.
pub struct LibphpRuntime {
    heap: Arc<LibphpHeap>,
}

impl Default for LibphpRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl LibphpRuntime {
    pub fn new() -> Self {
        Self {
            heap: Arc::new(LibphpHeap),
        }
    }
}

impl NativeRuntime for LibphpRuntime {
    fn slot(&self) -> &EngineSlot {
        &SLOT
    }

    fn heap(&self) -> Arc<dyn ValueHeap> {
        self.heap.clone()
    }

    fn engine_init(&self, ini_text: &str, ini_path: Option<&Path>) -> Result<(), NativeFailure> {
        let ini = c_string(ini_text)?;
        let path = ini_path
            .map(|path| c_string(&path.to_string_lossy()))
            .transpose()?;

        // SAFETY: both strings outlive the call; the shim copies them.
        let status = unsafe {
            engine_init(
                ini.as_ptr(),
                path.as_ref().map_or(ptr::null(), |path| path.as_ptr()),
            )
        };
        if status != 0 {
            return Err(last_error("PHP engine failed to start"));
        }
        Ok(())
    }

    fn engine_shutdown(&self) {
        // SAFETY: called once per successful engine_init.
        unsafe { engine_shutdown() }
    }

    fn receiver_define(&self, name: &str) {
        match c_string(name) {
            // SAFETY: the shim copies the name.
            Ok(name) => unsafe { receiver_define(name.as_ptr()) },
            Err(e) => warn!(error = %e, "Receiver name not representable"),
        }
    }

    fn context_new(
        &self,
        server_values: Option<RawValue>,
    ) -> Result<ContextHandle, NativeFailure> {
        let values = server_values.map_or(ptr::null_mut(), zval);
        // SAFETY: the shim copies the server values.
        let context = unsafe { context_new(values) };
        if context.is_null() {
            return Err(last_error("Failed to initialize request"));
        }
        Ok(ContextHandle(context as usize))
    }

    fn context_startup(
        &self,
        handle: ContextHandle,
        host: &mut dyn HostBridge,
    ) -> Result<(), NativeFailure> {
        // SAFETY: the handle came from context_new.
        let status = with_bridge(host, || unsafe { context_startup(context(handle)) });
        if status != 0 {
            return Err(last_error("Failed to start request"));
        }
        Ok(())
    }

    fn context_exec(
        &self,
        handle: ContextHandle,
        path: &Path,
        host: &mut dyn HostBridge,
    ) -> Result<(), NativeFailure> {
        let filename = c_string(&path.to_string_lossy())?;
        // SAFETY: the handle came from context_new.
        let status = with_bridge(host, || unsafe {
            context_exec(context(handle), filename.as_ptr())
        });
        if status != 0 {
            return Err(last_error("Error executing script"));
        }
        Ok(())
    }

    fn context_eval(
        &self,
        handle: ContextHandle,
        script: &str,
        host: &mut dyn HostBridge,
    ) -> Result<RawValue, NativeFailure> {
        let script = c_string(script)?;
        let mut result: *mut Zval = ptr::null_mut();
        // SAFETY: the handle came from context_new; the result is a fresh
        // value owned by the caller.
        let status = with_bridge(host, || unsafe {
            context_eval(context(handle), script.as_ptr(), &raw mut result)
        });
        if status != 0 || result.is_null() {
            return Err(last_error("Error executing script"));
        }
        Ok(RawValue(result as usize))
    }

    fn context_bind(&self, handle: ContextHandle, name: &str, value: RawValue) {
        match c_string(name) {
            // SAFETY: the shim copies both the name and the value.
            Ok(name) => unsafe { context_bind(context(handle), name.as_ptr(), zval(value)) },
            Err(e) => warn!(error = %e, "Variable name not representable"),
        }
    }

    fn context_finish(
        &self,
        handle: ContextHandle,
        host: &mut dyn HostBridge,
    ) -> Result<bool, NativeFailure> {
        // SAFETY: the handle came from context_new.
        match with_bridge(host, || unsafe { context_finish(context(handle)) }) {
            1 => Ok(true),
            0 => Ok(false),
            _ => Err(last_error("Error finishing request")),
        }
    }

    fn context_destroy(&self, handle: ContextHandle, host: &mut dyn HostBridge) {
        // SAFETY: the handle came from context_new and is not used again.
        with_bridge(host, || unsafe { context_destroy(context(handle)) });
    }
}

fn write_reply(reply: Option<Reply>) -> c_int {
    match reply {
        Some(Reply::Written(n)) => c_int::try_from(n).unwrap_or(c_int::MAX),
        _ => -1,
    }
}

fn value_reply(reply: Option<Reply>) -> *mut Zval {
    match reply {
        Some(Reply::Value(value)) => zval(value),
        _ => ptr::null_mut(),
    }
}

/// # Safety
///
/// `buffer` must be valid for `length` bytes.
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
unsafe extern "C" fn engineWriteOut(
    ctx: *mut c_void,
    buffer: *const c_void,
    length: c_uint,
) -> c_int {
    // SAFETY: guaranteed by the caller.
    let bytes = unsafe { borrowed_bytes(buffer, length) };
    write_reply(undelivered(dispatch(Callback::WriteOut {
        context: ContextHandle(ctx as usize),
        bytes,
    })))
}

/// # Safety
///
/// `buffer` must be valid for `length` bytes.
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
unsafe extern "C" fn engineWriteLog(
    ctx: *mut c_void,
    buffer: *const c_void,
    length: c_uint,
) -> c_int {
    // SAFETY: guaranteed by the caller.
    let bytes = unsafe { borrowed_bytes(buffer, length) };
    write_reply(undelivered(dispatch(Callback::WriteLog {
        context: ContextHandle(ctx as usize),
        bytes,
    })))
}

/// # Safety
///
/// `buffer` must be valid for `length` bytes.
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
unsafe extern "C" fn engineSetHeader(
    ctx: *mut c_void,
    operation: c_uint,
    buffer: *const c_void,
    length: c_uint,
) {
    let Some(op) = HeaderOp::from_raw(operation) else {
        debug!(operation, "Unknown header operation");
        return;
    };
    // SAFETY: guaranteed by the caller.
    let line = String::from_utf8_lossy(unsafe { borrowed_bytes(buffer, length) });
    undelivered(dispatch(Callback::Header {
        context: ContextHandle(ctx as usize),
        op,
        line: &line,
    }));
}

#[unsafe(no_mangle)]
#[allow(non_snake_case)]
extern "C" fn engineSendHeaders(ctx: *mut c_void, status: c_int) {
    undelivered(dispatch(Callback::SendHeaders {
        context: ContextHandle(ctx as usize),
        status: u16::try_from(status).ok().filter(|status| *status > 0),
    }));
}

/// # Safety
///
/// `buffer` must be valid for writes of `max` bytes.
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
unsafe extern "C" fn engineReadPost(
    ctx: *mut c_void,
    buffer: *mut c_char,
    offset: usize,
    max: usize,
) -> usize {
    let Some(Reply::Body(body)) = undelivered(dispatch(Callback::ReadPost {
        context: ContextHandle(ctx as usize),
        offset,
        max,
    })) else {
        return 0;
    };
    let len = body.len().min(max);
    // SAFETY: `len` never exceeds the caller's buffer.
    unsafe { ptr::copy_nonoverlapping(body.as_ptr(), buffer.cast::<u8>(), len) };
    len
}

/// Route a receiver callback. Names that are not valid strings are answered
/// like a missing receiver.
///
/// # Safety
///
/// `name` and `member` must be null or valid NUL-terminated strings.
unsafe fn receiver_dispatch<'a>(
    name: *const c_char,
    instance: *mut c_void,
    member: *const c_char,
    call: impl FnOnce(&'a str) -> ReceiverCall<'a>,
) -> Option<Reply> {
    // SAFETY: guaranteed by the caller.
    let receiver = unsafe { borrowed_str(name) }?;
    // SAFETY: guaranteed by the caller.
    let member: &'a str = unsafe { borrowed_str(member) }.unwrap_or_default();
    undelivered(dispatch(Callback::Receiver {
        receiver,
        instance: InstanceHandle(instance as usize),
        call: call(member),
    }))
}

/// # Safety
///
/// `name` must be a valid NUL-terminated string.
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
unsafe extern "C" fn engineReceiverNew(
    name: *const c_char,
    instance: *mut c_void,
    args: *mut c_void,
) -> c_int {
    let args = RawValue(args as usize);
    // SAFETY: guaranteed by the caller.
    let reply =
        unsafe { receiver_dispatch(name, instance, ptr::null(), |_| ReceiverCall::New { args }) };
    match reply {
        Some(Reply::Done) => 0,
        _ => 1,
    }
}

/// # Safety
///
/// `name` and `property` must be valid NUL-terminated strings.
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
unsafe extern "C" fn engineReceiverGet(
    name: *const c_char,
    instance: *mut c_void,
    property: *const c_char,
) -> *mut c_void {
    // SAFETY: guaranteed by the caller.
    let reply = unsafe {
        receiver_dispatch(name, instance, property, |property| {
            ReceiverCall::Get { property }
        })
    };
    value_reply(reply).cast()
}

/// # Safety
///
/// `name` and `property` must be valid NUL-terminated strings.
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
unsafe extern "C" fn engineReceiverSet(
    name: *const c_char,
    instance: *mut c_void,
    property: *const c_char,
    value: *mut c_void,
) {
    let value = RawValue(value as usize);
    // SAFETY: guaranteed by the caller.
    unsafe {
        receiver_dispatch(name, instance, property, |property| {
            ReceiverCall::Set { property, value }
        })
    };
}

/// # Safety
///
/// `name` and `property` must be valid NUL-terminated strings.
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
unsafe extern "C" fn engineReceiverExists(
    name: *const c_char,
    instance: *mut c_void,
    property: *const c_char,
) -> c_int {
    // SAFETY: guaranteed by the caller.
    let reply = unsafe {
        receiver_dispatch(name, instance, property, |property| {
            ReceiverCall::Exists { property }
        })
    };
    match reply {
        Some(Reply::Exists(true)) => 1,
        _ => 0,
    }
}

/// # Safety
///
/// `name` and `method` must be valid NUL-terminated strings.
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
unsafe extern "C" fn engineReceiverCall(
    name: *const c_char,
    instance: *mut c_void,
    method: *const c_char,
    args: *mut c_void,
) -> *mut c_void {
    let args = RawValue(args as usize);
    // SAFETY: guaranteed by the caller.
    let reply = unsafe {
        receiver_dispatch(name, instance, method, |method| {
            ReceiverCall::Call { method, args }
        })
    };
    value_reply(reply).cast()
}

/// # Safety
///
/// `name` must be a valid NUL-terminated string.
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
unsafe extern "C" fn engineReceiverRelease(name: *const c_char, instance: *mut c_void) {
    // SAFETY: guaranteed by the caller.
    unsafe { receiver_dispatch(name, instance, ptr::null(), |_| ReceiverCall::Release) };
}
