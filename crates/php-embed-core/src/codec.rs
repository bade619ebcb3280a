//! Conversion between [`HostValue`]s and the runtime's dynamic values.
//!
//! [`encode`] builds a dynamic value from a host value; [`DynamicValue`] owns
//! the resulting handle and projects it back with the typed accessors.
//! Handles are released when the guard drops, on every path, including the
//! error paths of a partially built container.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use php_embed_common::CodecError;

use crate::native::{ArrayKey, RawValue, ValueHeap, ValueKind};
use crate::value::{HostMap, HostValue, MapKey};

/// An owned dynamic value.
///
/// The handle is destroyed when the guard drops. [`DynamicValue::release`]
/// does it early; releasing twice is a no-op.
pub struct DynamicValue {
    heap: Arc<dyn ValueHeap>,
    raw: Option<RawValue>,
}

impl DynamicValue {
    /// Allocate a new null value.
    pub fn new(heap: Arc<dyn ValueHeap>) -> Result<Self, CodecError> {
        let raw = heap
            .alloc()
            .map_err(|e| CodecError::allocation_failed(e.message))?;
        Ok(Self::from_raw(heap, raw))
    }

    /// Take ownership of an existing handle.
    pub fn from_raw(heap: Arc<dyn ValueHeap>, raw: RawValue) -> Self {
        Self {
            heap,
            raw: Some(raw),
        }
    }

    /// The handle, or `None` once released.
    pub fn raw(&self) -> Option<RawValue> {
        self.raw
    }

    /// Give up ownership of the handle without destroying it.
    pub fn into_raw(mut self) -> Option<RawValue> {
        self.raw.take()
    }

    /// Destroy the handle now.
    pub fn release(&mut self) {
        if let Some(raw) = self.raw.take() {
            self.heap.destroy(raw);
        }
    }

    pub fn is_released(&self) -> bool {
        self.raw.is_none()
    }

    pub fn kind(&self) -> ValueKind {
        self.raw.map_or(ValueKind::Undef, |raw| self.heap.kind(raw))
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind(), ValueKind::Null | ValueKind::Undef)
    }

    pub fn as_int(&self) -> i64 {
        self.raw.map_or(0, |raw| self.heap.get_long(raw))
    }

    pub fn as_float(&self) -> f64 {
        self.raw.map_or(0.0, |raw| self.heap.get_double(raw))
    }

    pub fn as_bool(&self) -> bool {
        self.raw.is_some_and(|raw| self.heap.get_bool(raw))
    }

    /// String value using the runtime's string coercion.
    pub fn as_string(&self) -> String {
        self.raw
            .map(|raw| self.heap.get_string(raw))
            .unwrap_or_default()
    }

    /// The value as an ordered sequence.
    ///
    /// Arrays and objects yield their values in order; null is empty and any
    /// other value becomes a one-element list.
    pub fn as_list(&self) -> Vec<HostValue> {
        self.raw
            .map(|raw| decode_list(&self.heap, raw))
            .unwrap_or_default()
    }

    /// The value as a map keyed by string.
    ///
    /// Integer keys are stringified in base 10. Null is empty and any other
    /// non-container value is keyed by `"0"`.
    pub fn as_map(&self) -> IndexMap<String, HostValue> {
        self.raw
            .map(|raw| decode_map(&self.heap, raw))
            .unwrap_or_default()
    }

    /// Decode to the natural host shape. Never fails: unrecognised kinds
    /// decode to [`HostValue::Null`].
    pub fn as_native(&self) -> HostValue {
        self.raw
            .map_or(HostValue::Null, |raw| decode(&self.heap, raw))
    }
}

impl Drop for DynamicValue {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for DynamicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicValue")
            .field("raw", &self.raw)
            .field("kind", &self.kind())
            .finish()
    }
}

/// Encode a host value into a new dynamic value.
///
/// Unsupported categories are detected before anything is allocated.
///
/// # Errors
///
/// Returns [`CodecError::UnsupportedType`] for values without an engine
/// representation and [`CodecError::AllocationFailed`] if the heap refuses
/// an allocation; nothing stays allocated in either case.
pub fn encode(heap: &Arc<dyn ValueHeap>, value: &HostValue) -> Result<DynamicValue, CodecError> {
    if let Some(type_name) = value.find_unsupported() {
        return Err(CodecError::unsupported(type_name));
    }
    encode_value(heap, value)
}

fn encode_value(heap: &Arc<dyn ValueHeap>, value: &HostValue) -> Result<DynamicValue, CodecError> {
    let guard = DynamicValue::new(Arc::clone(heap))?;
    let Some(target) = guard.raw() else {
        return Err(CodecError::allocation_failed("value released during encoding"));
    };

    match value {
        HostValue::Null => heap.set_null(target),
        HostValue::Bool(b) => heap.set_bool(target, *b),
        HostValue::Int(i) => heap.set_long(target, *i),
        HostValue::Float(f) => heap.set_double(target, *f),
        HostValue::String(s) => heap.set_string(target, s),
        HostValue::List(items) => {
            heap.set_array(target, items.len());
            for item in items {
                // On error the guard drops the array and every element
                // already moved into it.
                let child = encode_value(heap, item)?;
                if let Some(raw) = child.into_raw() {
                    heap.array_push(target, raw);
                }
            }
        }
        HostValue::Map(map) => {
            heap.set_array(target, map.len());
            for (key, item) in map {
                let child = encode_value(heap, item)?;
                let key = match key {
                    MapKey::Int(i) => ArrayKey::Index(*i),
                    MapKey::Str(s) => ArrayKey::Name(s.clone()),
                };
                if let Some(raw) = child.into_raw() {
                    heap.array_insert(target, &key, raw);
                }
            }
        }
        HostValue::Record(record) => {
            heap.set_object(target);
            for (name, field) in &record.fields {
                let child = encode_value(heap, field)?;
                if let Some(raw) = child.raw() {
                    heap.object_set_property(target, name, raw);
                }
                // child drops here; the object holds its own copy
            }
        }
        HostValue::Unsupported { type_name } => {
            return Err(CodecError::unsupported(type_name.clone()));
        }
    }

    Ok(guard)
}

/// Decode a borrowed handle. The handle stays owned by the caller.
pub fn decode(heap: &Arc<dyn ValueHeap>, raw: RawValue) -> HostValue {
    match heap.kind(raw) {
        ValueKind::Long => HostValue::Int(heap.get_long(raw)),
        ValueKind::Double => HostValue::Float(heap.get_double(raw)),
        ValueKind::True => HostValue::Bool(true),
        ValueKind::False => HostValue::Bool(false),
        ValueKind::String => HostValue::String(heap.get_string(raw)),
        ValueKind::Array if !heap.array_is_associative(raw) => {
            HostValue::List(decode_list(heap, raw))
        }
        ValueKind::Array | ValueKind::Object => HostValue::Map(
            decode_map(heap, raw)
                .into_iter()
                .map(|(k, v)| (MapKey::Str(k), v))
                .collect::<HostMap>(),
        ),
        _ => HostValue::Null,
    }
}

/// Decode a borrowed handle as an ordered sequence.
pub fn decode_list(heap: &Arc<dyn ValueHeap>, raw: RawValue) -> Vec<HostValue> {
    match heap.kind(raw) {
        ValueKind::Array | ValueKind::Object => entries(heap, raw)
            .into_iter()
            .map(|(_, child)| child.as_native())
            .collect(),
        ValueKind::Null | ValueKind::Undef => Vec::new(),
        _ => vec![decode(heap, raw)],
    }
}

/// Decode a borrowed handle as a map keyed by string.
pub fn decode_map(heap: &Arc<dyn ValueHeap>, raw: RawValue) -> IndexMap<String, HostValue> {
    match heap.kind(raw) {
        ValueKind::Array | ValueKind::Object => entries(heap, raw)
            .into_iter()
            .map(|(key, child)| {
                let key = match key {
                    ArrayKey::Index(i) => i.to_string(),
                    ArrayKey::Name(name) => name,
                };
                (key, child.as_native())
            })
            .collect(),
        ValueKind::Null | ValueKind::Undef => IndexMap::new(),
        _ => {
            let mut map = IndexMap::with_capacity(1);
            map.insert("0".to_string(), decode(heap, raw));
            map
        }
    }
}

/// Entry copies wrapped in guards as soon as they are handed over, so they
/// are released even if projection stops early.
fn entries(heap: &Arc<dyn ValueHeap>, raw: RawValue) -> Vec<(ArrayKey, DynamicValue)> {
    heap.array_entries(raw)
        .into_iter()
        .map(|(key, child)| (key, DynamicValue::from_raw(Arc::clone(heap), child)))
        .collect()
}
