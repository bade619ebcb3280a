//! Core embedding layer for php-embed.
//!
//! This crate provides the engine and everything that crosses the native
//! boundary:
//! - [`Engine`]: engine and request lifecycle, script evaluation
//! - [`ExecutionContext`]: per-request sinks and request data
//! - [`HostValue`] and [`codec`]: conversion between host and script values
//! - [`DynamicValue`]: owned handle to a script value
//! - [`ReceiverRegistry`]: host classes instantiable from scripts
//! - [`MemoryRuntime`]: in-process runtime used by the test suites
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Engine                           │
//! │  (One active per runtime, passed by reference)          │
//! │  - Ini configuration                                    │
//! │  - Receiver registry                                    │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                   ExecutionContext                      │
//! │  (Per-request, isolated)                                │
//! │  - Output and log sinks                                 │
//! │  - Optional HTTP request/response pair                  │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    NativeRuntime                        │
//! │  (libphp shim or in-memory)                             │
//! │  - Value heap                                           │
//! │  - Callbacks back into the host                         │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod codec;
pub mod context;
pub mod engine;
pub mod memory;
pub mod native;
pub mod receiver;
pub mod ser;
pub mod value;

#[cfg(feature = "libphp")]
#[allow(unsafe_code)]
mod ffi;

pub use codec::{DynamicValue, decode, encode};
pub use context::{
    ContextState, ExecutionContext, ExecutionContextBuilder, InboundRequest, ResponseWriter,
    SharedBuffer,
};
pub use engine::Engine;
#[cfg(feature = "libphp")]
pub use ffi::LibphpRuntime;
pub use memory::{MemoryRuntime, ObjectRef, ScriptError, ScriptResult, ScriptScope};
pub use native::{
    ArrayKey, ContextHandle, HeaderOp, InstanceHandle, NativeFailure, NativeRuntime, RawValue,
    ValueHeap, ValueKind,
};
pub use receiver::{DynamicObject, ReceiverObject, ReceiverRegistry};
pub use ser::to_host_value;
pub use value::{HostMap, HostValue, MapKey, Record};
