//! Contract between the engine and a native runtime.
//!
//! The engine never touches runtime internals directly. It goes through two
//! traits:
//! - [`ValueHeap`]: allocation and inspection of the runtime's dynamic values
//! - [`NativeRuntime`]: engine and request lifecycle, script evaluation
//!
//! While the runtime executes script code it talks back to the host by
//! sending [`Callback`] messages through a [`HostBridge`]. Every callback is
//! answered with a [`Reply`]; a miss on the host side is an ordinary reply,
//! never a failure that has to cross the native boundary.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

/// Opaque handle to a dynamic value owned by a [`ValueHeap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawValue(pub usize);

/// Opaque handle to a native request context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub usize);

/// Opaque handle the runtime associates with one script-visible receiver
/// instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle(pub usize);

/// Type tag of a dynamic value, numbered as the runtime numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueKind {
    Undef = 0,
    Null = 1,
    False = 2,
    True = 3,
    Long = 4,
    Double = 5,
    String = 6,
    Array = 7,
    Object = 8,
    Resource = 9,
    Reference = 10,
}

impl ValueKind {
    /// Map a raw type tag. Unknown tags map to [`ValueKind::Undef`].
    pub fn from_raw(tag: u8) -> Self {
        match tag {
            1 => Self::Null,
            2 => Self::False,
            3 => Self::True,
            4 => Self::Long,
            5 => Self::Double,
            6 => Self::String,
            7 => Self::Array,
            8 => Self::Object,
            9 => Self::Resource,
            10 => Self::Reference,
            _ => Self::Undef,
        }
    }
}

/// Key of a runtime array entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArrayKey {
    /// Integer key.
    Index(i64),
    /// String key.
    Name(String),
}

/// Header operation requested by a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HeaderOp {
    /// Set the header, overwriting earlier values.
    Replace = 0,
    /// Add another value for the header.
    Append = 1,
    /// Remove every value for the header.
    Delete = 2,
}

impl HeaderOp {
    /// Map the runtime's operation code.
    pub fn from_raw(op: u32) -> Option<Self> {
        match op {
            0 => Some(Self::Replace),
            1 => Some(Self::Append),
            2 => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Failure reported by the native runtime.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct NativeFailure {
    /// The runtime's own error message.
    pub message: String,
}

impl NativeFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Storage for the runtime's dynamic values.
///
/// Handles are exclusively owned by whoever allocated them until they are
/// destroyed or explicitly handed over. Destroying an unknown or already
/// destroyed handle is a no-op.
pub trait ValueHeap: Send + Sync {
    /// Allocate a new null value.
    fn alloc(&self) -> Result<RawValue, NativeFailure>;

    /// Release a value and everything it owns.
    fn destroy(&self, value: RawValue);

    /// Type tag of a value. Unknown handles report [`ValueKind::Undef`].
    fn kind(&self, value: RawValue) -> ValueKind;

    fn set_null(&self, value: RawValue);
    fn set_long(&self, value: RawValue, num: i64);
    fn set_double(&self, value: RawValue, num: f64);
    fn set_bool(&self, value: RawValue, flag: bool);
    fn set_string(&self, value: RawValue, text: &str);

    /// Turn the value into an empty array with room for `size_hint` entries.
    fn set_array(&self, value: RawValue, size_hint: usize);

    /// Turn the value into an empty object.
    fn set_object(&self, value: RawValue);

    /// Append `item` at the next free index. Ownership of `item` moves into
    /// the array.
    fn array_push(&self, array: RawValue, item: RawValue);

    /// Store `item` under `key`. Ownership of `item` moves into the array.
    fn array_insert(&self, array: RawValue, key: &ArrayKey, item: RawValue);

    /// Set an object property to a copy of `item`. The caller keeps `item`.
    fn object_set_property(&self, object: RawValue, name: &str, item: RawValue);

    /// Integer value, coerced with the runtime's rules.
    fn get_long(&self, value: RawValue) -> i64;

    /// Floating point value, coerced with the runtime's rules.
    fn get_double(&self, value: RawValue) -> f64;

    /// Truthiness with the runtime's rules.
    fn get_bool(&self, value: RawValue) -> bool;

    /// String value, coerced with the runtime's rules.
    fn get_string(&self, value: RawValue) -> String;

    /// Number of entries of an array or properties of an object.
    fn array_len(&self, value: RawValue) -> usize;

    /// Whether an array has string or non-contiguous keys.
    fn array_is_associative(&self, value: RawValue) -> bool;

    /// Copies of every entry, in iteration order. The returned handles are
    /// owned by the caller.
    fn array_entries(&self, value: RawValue) -> Vec<(ArrayKey, RawValue)>;
}

/// A message sent by the runtime to the host while script code runs.
#[derive(Debug)]
pub enum Callback<'a> {
    /// Script output.
    WriteOut {
        context: ContextHandle,
        bytes: &'a [u8],
    },
    /// Runtime log output.
    WriteLog {
        context: ContextHandle,
        bytes: &'a [u8],
    },
    /// Header manipulation.
    Header {
        context: ContextHandle,
        op: HeaderOp,
        line: &'a str,
    },
    /// The runtime is about to send the status line and headers.
    SendHeaders {
        context: ContextHandle,
        status: Option<u16>,
    },
    /// Read up to `max` bytes of the request body starting at `offset`.
    ReadPost {
        context: ContextHandle,
        offset: usize,
        max: usize,
    },
    /// Operation on a receiver class or instance.
    Receiver {
        receiver: &'a str,
        instance: InstanceHandle,
        call: ReceiverCall<'a>,
    },
}

/// Receiver operations. Value handles are borrowed from the runtime.
#[derive(Debug)]
pub enum ReceiverCall<'a> {
    /// Construct a host object; `args` is an indexed array.
    New { args: RawValue },
    Get { property: &'a str },
    Set { property: &'a str, value: RawValue },
    Exists { property: &'a str },
    Call { method: &'a str, args: RawValue },
    /// The script-side instance was destroyed.
    Release,
}

/// Host answer to a [`Callback`].
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    /// Bytes accepted by the sink.
    Written(usize),
    /// The host could not serve the callback.
    Failed,
    /// Request body bytes.
    Body(Vec<u8>),
    /// A value; ownership passes to the runtime.
    Value(RawValue),
    /// Answer to an existence check.
    Exists(bool),
    /// Acknowledgement.
    Done,
}

/// Host side of the callback channel.
pub trait HostBridge {
    fn dispatch(&mut self, callback: Callback<'_>) -> Reply;
}

/// Single-occupancy slot guarding a native engine.
///
/// A runtime that can only host one engine per process keeps its slot in a
/// static; runtimes that support isolated instances own one slot each.
#[derive(Debug, Default)]
pub struct EngineSlot(AtomicBool);

impl EngineSlot {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Take the slot. Returns `false` if it is already taken.
    pub fn claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A native runtime able to host one engine.
///
/// Every call that may run script code receives the [`HostBridge`] its
/// callbacks must go through.
pub trait NativeRuntime: Send + Sync {
    /// The slot enforcing a single active engine.
    fn slot(&self) -> &EngineSlot;

    /// The value heap shared by all contexts.
    fn heap(&self) -> Arc<dyn ValueHeap>;

    /// Start the engine with the given ini text and optional ini file path.
    fn engine_init(&self, ini_text: &str, ini_path: Option<&Path>) -> Result<(), NativeFailure>;

    fn engine_shutdown(&self);

    /// Make a receiver class instantiable from scripts.
    fn receiver_define(&self, name: &str);

    /// Create a request context. `server_values` is borrowed; the runtime
    /// keeps its own copy.
    fn context_new(&self, server_values: Option<RawValue>)
    -> Result<ContextHandle, NativeFailure>;

    /// Run request initialisation (superglobals, body parsing).
    fn context_startup(
        &self,
        context: ContextHandle,
        host: &mut dyn HostBridge,
    ) -> Result<(), NativeFailure>;

    fn context_exec(
        &self,
        context: ContextHandle,
        path: &Path,
        host: &mut dyn HostBridge,
    ) -> Result<(), NativeFailure>;

    /// Evaluate a script; the returned value is owned by the caller.
    fn context_eval(
        &self,
        context: ContextHandle,
        script: &str,
        host: &mut dyn HostBridge,
    ) -> Result<RawValue, NativeFailure>;

    /// Bind a copy of `value` as a script variable.
    fn context_bind(&self, context: ContextHandle, name: &str, value: RawValue);

    /// Finish the request early and flush. Returns `false` if the request
    /// was already finished.
    fn context_finish(
        &self,
        context: ContextHandle,
        host: &mut dyn HostBridge,
    ) -> Result<bool, NativeFailure>;

    /// Tear the request down, flushing pending output through `host`.
    fn context_destroy(&self, context: ContextHandle, host: &mut dyn HostBridge);
}
