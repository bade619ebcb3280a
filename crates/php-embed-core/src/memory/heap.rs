//! In-memory value heap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::native::{ArrayKey, NativeFailure, RawValue, ValueHeap, ValueKind};

/// A dynamic value stored in a [`MemoryHeap`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Zval {
    Null,
    False,
    True,
    Long(i64),
    Double(f64),
    Str(String),
    Array(ZArray),
    /// Plain object; properties keyed by name.
    Object(ZArray),
}

impl Zval {
    fn kind(&self) -> ValueKind {
        match self {
            Zval::Null => ValueKind::Null,
            Zval::False => ValueKind::False,
            Zval::True => ValueKind::True,
            Zval::Long(_) => ValueKind::Long,
            Zval::Double(_) => ValueKind::Double,
            Zval::Str(_) => ValueKind::String,
            Zval::Array(_) => ValueKind::Array,
            Zval::Object(_) => ValueKind::Object,
        }
    }

    pub(crate) fn to_long(&self) -> i64 {
        match self {
            Zval::Null | Zval::False => 0,
            Zval::True | Zval::Object(_) => 1,
            Zval::Long(i) => *i,
            #[allow(clippy::cast_possible_truncation)]
            Zval::Double(f) => *f as i64,
            Zval::Str(s) => match numeric_prefix(s) {
                Numeric::Long(i) => i,
                #[allow(clippy::cast_possible_truncation)]
                Numeric::Double(f) => f as i64,
            },
            Zval::Array(a) => i64::from(!a.is_empty()),
        }
    }

    pub(crate) fn to_double(&self) -> f64 {
        match self {
            Zval::Double(f) => *f,
            #[allow(clippy::cast_precision_loss)]
            Zval::Str(s) => match numeric_prefix(s) {
                Numeric::Long(i) => i as f64,
                Numeric::Double(f) => f,
            },
            #[allow(clippy::cast_precision_loss)]
            other => other.to_long() as f64,
        }
    }

    pub(crate) fn to_bool(&self) -> bool {
        match self {
            Zval::Null | Zval::False => false,
            Zval::True | Zval::Object(_) => true,
            Zval::Long(i) => *i != 0,
            Zval::Double(f) => *f != 0.0,
            Zval::Str(s) => !(s.is_empty() || s == "0"),
            Zval::Array(a) => !a.is_empty(),
        }
    }

    pub(crate) fn to_text(&self) -> String {
        match self {
            Zval::Null | Zval::False | Zval::Object(_) => String::new(),
            Zval::True => "1".to_string(),
            Zval::Long(i) => i.to_string(),
            Zval::Double(f) => format_double(*f),
            Zval::Str(s) => s.clone(),
            Zval::Array(_) => "Array".to_string(),
        }
    }
}

/// Ordered array with the runtime's key rules.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ZArray {
    entries: IndexMap<ArrayKey, Zval>,
    next_index: i64,
}

impl ZArray {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: IndexMap::with_capacity(capacity),
            next_index: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn push(&mut self, value: Zval) {
        let index = self.next_index;
        self.entries.insert(ArrayKey::Index(index), value);
        self.next_index = index.saturating_add(1);
    }

    /// Insert under `key`; numeric string keys are stored as integers.
    pub(crate) fn insert(&mut self, key: ArrayKey, value: Zval) {
        let key = normalize_key(key);
        if let ArrayKey::Index(index) = key {
            if index >= self.next_index {
                self.next_index = index.saturating_add(1);
            }
        }
        self.entries.insert(key, value);
    }

    /// Insert a property; names are kept as given.
    pub(crate) fn insert_property(&mut self, name: &str, value: Zval) {
        self.entries.insert(ArrayKey::Name(name.to_string()), value);
    }

    pub(crate) fn get(&self, key: &str) -> Option<&Zval> {
        self.entries.get(&normalize_key(ArrayKey::Name(key.to_string())))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&ArrayKey, &Zval)> {
        self.entries.iter()
    }

    /// An array is associative unless its keys are exactly `0..len` in order.
    pub(crate) fn is_associative(&self) -> bool {
        let Ok(len) = i64::try_from(self.entries.len()) else {
            return true;
        };
        if len != self.next_index {
            return true;
        }
        self.entries
            .keys()
            .zip(0_i64..)
            .any(|(key, position)| *key != ArrayKey::Index(position))
    }
}

fn normalize_key(key: ArrayKey) -> ArrayKey {
    match key {
        ArrayKey::Name(name) => match name.parse::<i64>() {
            Ok(index) if index.to_string() == name => ArrayKey::Index(index),
            _ => ArrayKey::Name(name),
        },
        index @ ArrayKey::Index(_) => index,
    }
}

enum Numeric {
    Long(i64),
    Double(f64),
}

/// Leading numeric part of a string, as used by numeric coercion.
fn numeric_prefix(s: &str) -> Numeric {
    let trimmed = s.trim_start();
    let bytes = trimmed.as_bytes();
    let mut end = 0;
    let mut is_float = false;

    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        let mut frac = end + 1;
        while frac < bytes.len() && bytes[frac].is_ascii_digit() {
            frac += 1;
        }
        if frac > end + 1 || end > digits_start {
            is_float = true;
            end = frac;
        }
    }
    if end > digits_start && end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp = end + 1;
        if exp < bytes.len() && (bytes[exp] == b'+' || bytes[exp] == b'-') {
            exp += 1;
        }
        let exp_digits = exp;
        while exp < bytes.len() && bytes[exp].is_ascii_digit() {
            exp += 1;
        }
        if exp > exp_digits {
            is_float = true;
            end = exp;
        }
    }

    let number = &trimmed[..end];
    if is_float {
        Numeric::Double(number.parse().unwrap_or(0.0))
    } else {
        match number.parse::<i64>() {
            Ok(i) => Numeric::Long(i),
            // out of range integers overflow into doubles
            Err(_) => Numeric::Double(number.parse().unwrap_or(0.0)),
        }
    }
}

/// Render a double as the engine prints it at `precision = 14`: at most 14
/// significant digits, exponent form below `1e-4` and from `1e14` upwards.
fn format_double(f: f64) -> String {
    const PRECISION: i32 = 14;

    if f.is_nan() {
        return "NAN".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "INF" } else { "-INF" }.to_string();
    }

    // 13 fractional digits in scientific form give the 14 significant ones.
    let scientific = format!("{:.13e}", f.abs());
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return scientific;
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();
    let digits = match digits.trim_end_matches('0') {
        "" => "0",
        trimmed => trimmed,
    };
    let sign = if f.is_sign_negative() { "-" } else { "" };

    if exponent < -4 || exponent >= PRECISION {
        let (first, rest) = digits.split_at(1);
        let rest = if rest.is_empty() { "0" } else { rest };
        let exponent_sign = if exponent < 0 { '-' } else { '+' };
        return format!("{sign}{first}.{rest}E{exponent_sign}{}", exponent.unsigned_abs());
    }

    if exponent < 0 {
        let zeros = "0".repeat(exponent.unsigned_abs() as usize - 1);
        return format!("{sign}0.{zeros}{digits}");
    }

    let integral = exponent.unsigned_abs() as usize + 1;
    if digits.len() <= integral {
        format!("{sign}{digits}{}", "0".repeat(integral - digits.len()))
    } else {
        let (whole, fraction) = digits.split_at(integral);
        format!("{sign}{whole}.{fraction}")
    }
}

/// Value heap backed by a map of handles to values.
///
/// Handles are never reused, so a stale handle can only ever miss.
#[derive(Debug)]
pub struct MemoryHeap {
    values: Mutex<HashMap<usize, Zval>>,
    next_id: AtomicUsize,
}

impl Default for MemoryHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHeap {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
        }
    }

    /// Number of values currently allocated.
    pub fn live_values(&self) -> usize {
        self.values.lock().len()
    }

    pub(crate) fn insert(&self, value: Zval) -> RawValue {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.values.lock().insert(id, value);
        RawValue(id)
    }

    pub(crate) fn take(&self, raw: RawValue) -> Option<Zval> {
        self.values.lock().remove(&raw.0)
    }

    pub(crate) fn get(&self, raw: RawValue) -> Option<Zval> {
        self.values.lock().get(&raw.0).cloned()
    }

    fn with<R>(&self, raw: RawValue, default: R, f: impl FnOnce(&Zval) -> R) -> R {
        self.values.lock().get(&raw.0).map_or(default, f)
    }

    fn set(&self, raw: RawValue, value: Zval) {
        if let Some(slot) = self.values.lock().get_mut(&raw.0) {
            *slot = value;
        }
    }
}

impl ValueHeap for MemoryHeap {
    fn alloc(&self) -> Result<RawValue, NativeFailure> {
        Ok(self.insert(Zval::Null))
    }

    fn destroy(&self, value: RawValue) {
        self.values.lock().remove(&value.0);
    }

    fn kind(&self, value: RawValue) -> ValueKind {
        self.with(value, ValueKind::Undef, Zval::kind)
    }

    fn set_null(&self, value: RawValue) {
        self.set(value, Zval::Null);
    }

    fn set_long(&self, value: RawValue, num: i64) {
        self.set(value, Zval::Long(num));
    }

    fn set_double(&self, value: RawValue, num: f64) {
        self.set(value, Zval::Double(num));
    }

    fn set_bool(&self, value: RawValue, flag: bool) {
        self.set(value, if flag { Zval::True } else { Zval::False });
    }

    fn set_string(&self, value: RawValue, text: &str) {
        self.set(value, Zval::Str(text.to_string()));
    }

    fn set_array(&self, value: RawValue, size_hint: usize) {
        self.set(value, Zval::Array(ZArray::with_capacity(size_hint)));
    }

    fn set_object(&self, value: RawValue) {
        self.set(value, Zval::Object(ZArray::default()));
    }

    fn array_push(&self, array: RawValue, item: RawValue) {
        let mut values = self.values.lock();
        let item = values.remove(&item.0).unwrap_or(Zval::Null);
        if let Some(Zval::Array(entries)) = values.get_mut(&array.0) {
            entries.push(item);
        }
    }

    fn array_insert(&self, array: RawValue, key: &ArrayKey, item: RawValue) {
        let mut values = self.values.lock();
        let item = values.remove(&item.0).unwrap_or(Zval::Null);
        if let Some(Zval::Array(entries)) = values.get_mut(&array.0) {
            entries.insert(key.clone(), item);
        }
    }

    fn object_set_property(&self, object: RawValue, name: &str, item: RawValue) {
        let mut values = self.values.lock();
        let item = values.get(&item.0).cloned().unwrap_or(Zval::Null);
        if let Some(Zval::Object(properties)) = values.get_mut(&object.0) {
            properties.insert_property(name, item);
        }
    }

    fn get_long(&self, value: RawValue) -> i64 {
        self.with(value, 0, Zval::to_long)
    }

    fn get_double(&self, value: RawValue) -> f64 {
        self.with(value, 0.0, Zval::to_double)
    }

    fn get_bool(&self, value: RawValue) -> bool {
        self.with(value, false, Zval::to_bool)
    }

    fn get_string(&self, value: RawValue) -> String {
        self.with(value, String::new(), Zval::to_text)
    }

    fn array_len(&self, value: RawValue) -> usize {
        self.with(value, 0, |zval| match zval {
            Zval::Array(a) | Zval::Object(a) => a.len(),
            Zval::Null => 0,
            _ => 1,
        })
    }

    fn array_is_associative(&self, value: RawValue) -> bool {
        self.with(value, false, |zval| match zval {
            Zval::Array(a) => a.is_associative(),
            Zval::Object(_) => true,
            _ => false,
        })
    }

    fn array_entries(&self, value: RawValue) -> Vec<(ArrayKey, RawValue)> {
        let entries: Vec<(ArrayKey, Zval)> = self.with(value, Vec::new(), |zval| match zval {
            Zval::Array(a) | Zval::Object(a) => {
                a.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
            }
            _ => Vec::new(),
        });

        entries
            .into_iter()
            .map(|(key, zval)| (key, self.insert(zval)))
            .collect()
    }
}
