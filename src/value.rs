//! Host-side values exchanged with scripts.

use std::collections::BTreeMap;

use bytes::Bytes;

/// Structured value crossing the host/script boundary.
///
/// Conversions from script values are lossy by contract: numbers are
/// truncated to 32-bit integers, and shapes with no variant here (booleans,
/// `null`, functions, symbols...) become [`TaggedValue::Absent`].
#[derive(Debug, Clone, Default)]
pub enum TaggedValue {
    /// No value (`undefined` on the script side).
    #[default]
    Absent,
    Int32(i32),
    String(String),
    /// Bytes supplied by the host.
    HostBuffer(HostBuffer),
    /// Bytes externalized from a script-owned buffer.
    ScriptBuffer(ScriptBuffer),
    Array(Vec<TaggedValue>),
    /// Key/value pairs. Order is irrelevant; on duplicate keys the last pair wins.
    Object(Vec<(String, TaggedValue)>),
}

impl TaggedValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, TaggedValue::Absent)
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            TaggedValue::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TaggedValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Byte content of either buffer variant.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            TaggedValue::HostBuffer(b) => Some(b.as_bytes()),
            TaggedValue::ScriptBuffer(b) => Some(b.as_bytes()),
            _ => None,
        }
    }

    /// Look up `key` in an object, honoring last-write-wins.
    pub fn get(&self, key: &str) -> Option<&TaggedValue> {
        match self {
            TaggedValue::Object(pairs) => pairs.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Build an object from pairs.
    pub fn object<K: Into<String>>(pairs: impl IntoIterator<Item = (K, TaggedValue)>) -> Self {
        TaggedValue::Object(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Lossy conversion to JSON. Buffers become arrays of byte values.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;

        match self {
            TaggedValue::Absent => Value::Null,
            TaggedValue::Int32(v) => Value::from(*v),
            TaggedValue::String(s) => Value::from(s.as_str()),
            TaggedValue::HostBuffer(_) | TaggedValue::ScriptBuffer(_) => Value::Array(
                self.as_bytes()
                    .unwrap_or_default()
                    .iter()
                    .map(|b| Value::from(*b))
                    .collect(),
            ),
            TaggedValue::Array(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            TaggedValue::Object(pairs) => Value::Object(
                pairs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    fn canonical(pairs: &[(String, TaggedValue)]) -> BTreeMap<&str, &TaggedValue> {
        pairs.iter().map(|(k, v)| (k.as_str(), v)).collect()
    }
}

impl PartialEq for TaggedValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TaggedValue::Absent, TaggedValue::Absent) => true,
            (TaggedValue::Int32(a), TaggedValue::Int32(b)) => a == b,
            (TaggedValue::String(a), TaggedValue::String(b)) => a == b,
            (TaggedValue::HostBuffer(a), TaggedValue::HostBuffer(b)) => a.as_bytes() == b.as_bytes(),
            (TaggedValue::ScriptBuffer(a), TaggedValue::ScriptBuffer(b)) => a == b,
            (TaggedValue::Array(a), TaggedValue::Array(b)) => a == b,
            (TaggedValue::Object(a), TaggedValue::Object(b)) => {
                Self::canonical(a) == Self::canonical(b)
            }
            _ => false,
        }
    }
}

impl From<i32> for TaggedValue {
    fn from(v: i32) -> Self {
        TaggedValue::Int32(v)
    }
}

impl From<&str> for TaggedValue {
    fn from(v: &str) -> Self {
        TaggedValue::String(v.to_string())
    }
}

impl From<String> for TaggedValue {
    fn from(v: String) -> Self {
        TaggedValue::String(v)
    }
}

impl From<Vec<TaggedValue>> for TaggedValue {
    fn from(v: Vec<TaggedValue>) -> Self {
        TaggedValue::Array(v)
    }
}

impl From<HostBuffer> for TaggedValue {
    fn from(v: HostBuffer) -> Self {
        TaggedValue::HostBuffer(v)
    }
}

/// Lossy conversion from JSON: numbers truncate to `i32`, booleans map to
/// 0/1, `null` maps to `Absent`.
impl From<serde_json::Value> for TaggedValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => TaggedValue::Absent,
            Value::Bool(b) => TaggedValue::Int32(i32::from(b)),
            Value::Number(n) => n
                .as_i64()
                .map(|i| TaggedValue::Int32(i as i32))
                .or_else(|| n.as_f64().map(|f| TaggedValue::Int32(f as i32)))
                .unwrap_or_default(),
            Value::String(s) => TaggedValue::String(s),
            Value::Array(items) => TaggedValue::Array(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => {
                TaggedValue::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

/// Byte buffer handed from the host to a script.
///
/// A buffer built from an owned allocation ([`HostBuffer::from_allocation`],
/// [`HostBuffer::from_vec`]) is wrapped zero-copy: the script's view aliases
/// that memory and the allocation is freed once the engine drops it. A buffer
/// built with [`HostBuffer::copied`] carries no allocation and is copied into
/// budget-checked engine memory.
#[derive(Clone)]
pub struct HostBuffer {
    storage: HostStorage,
    offset: usize,
    len: usize,
}

#[derive(Clone)]
enum HostStorage {
    Shared(Bytes),
    Allocation(Box<[u8]>),
}

impl HostBuffer {
    pub fn copied(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let len = bytes.len();
        Self {
            storage: HostStorage::Shared(bytes),
            offset: 0,
            len,
        }
    }

    /// Wrap `allocation[offset..offset + len]` without copying.
    ///
    /// The range is clamped to the allocation.
    pub fn from_allocation(allocation: Box<[u8]>, offset: usize, len: usize) -> Self {
        let offset = offset.min(allocation.len());
        let len = len.min(allocation.len() - offset);
        Self {
            storage: HostStorage::Allocation(allocation),
            offset,
            len,
        }
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self::from_allocation(bytes.into_boxed_slice(), 0, len)
    }

    /// Whether the buffer carries a host allocation (zero-copy on import).
    pub fn has_allocation(&self) -> bool {
        matches!(self.storage, HostStorage::Allocation(_))
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        let all: &[u8] = match &self.storage {
            HostStorage::Shared(b) => b,
            HostStorage::Allocation(a) => a,
        };
        &all[self.offset..self.offset + self.len]
    }

    /// Split into `(allocation, offset, len)` when zero-copy is possible.
    pub(crate) fn into_allocation(self) -> Result<(Box<[u8]>, usize, usize), Self> {
        let (offset, len) = (self.offset, self.len);
        match self.storage {
            HostStorage::Allocation(allocation) => Ok((allocation, offset, len)),
            storage => Err(Self {
                storage,
                offset,
                len,
            }),
        }
    }
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer")
            .field("zero_copy", &self.has_allocation())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Bytes externalized from a script buffer.
///
/// Holds the engine backing store alive after the script-side buffer was
/// detached, so the bytes stay valid for as long as the host keeps this value.
/// Scripts never see this store again: passing the value back copies it.
#[derive(Clone)]
pub struct ScriptBuffer {
    store: v8::SharedRef<v8::BackingStore>,
    offset: usize,
    len: usize,
}

impl ScriptBuffer {
    pub(crate) fn new(store: v8::SharedRef<v8::BackingStore>, offset: usize, len: usize) -> Self {
        let total = store.byte_length();
        let offset = offset.min(total);
        let len = len.min(total - offset);
        Self { store, offset, len }
    }

    /// Length of the whole backing allocation.
    pub fn allocation_len(&self) -> usize {
        self.store.byte_length()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }

        match self.store.data() {
            // SAFETY: the range was clamped to the store, which stays alive
            // as long as `self` holds its reference
            Some(ptr) => unsafe {
                std::slice::from_raw_parts(
                    (ptr.as_ptr() as *const u8).add(self.offset),
                    self.len,
                )
            },
            None => &[],
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl PartialEq for ScriptBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl std::fmt::Debug for ScriptBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptBuffer")
            .field("allocation_len", &self.allocation_len())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// A script-initiated call, consumed once by the host handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Correlation token chosen by the script.
    pub id: u32,
    pub synchronous: bool,
    /// Host-defined message kind.
    pub kind: i32,
    pub value: TaggedValue,
    /// Optional raw buffer passed as `send`'s second argument.
    pub raw: Option<ScriptBuffer>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_equality_ignores_order() {
        let a = TaggedValue::object([("x", 1.into()), ("y", "two".into())]);
        let b = TaggedValue::object([("y", "two".into()), ("x", 1.into())]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_object_duplicate_keys_last_write_wins() {
        let dup = TaggedValue::object([("k", 1.into()), ("k", 2.into())]);
        let single = TaggedValue::object([("k", 2.into())]);

        assert_eq!(dup, single);
        assert_eq!(dup.get("k"), Some(&TaggedValue::Int32(2)));
    }

    #[test]
    fn test_variants_do_not_compare_across_tags() {
        assert_ne!(TaggedValue::Int32(0), TaggedValue::Absent);
        assert_ne!(TaggedValue::from("1"), TaggedValue::Int32(1));
    }

    #[test]
    fn test_host_buffer_range_is_clamped() {
        let buf = HostBuffer::from_allocation(vec![1, 2, 3, 4].into_boxed_slice(), 2, 10);
        assert_eq!(buf.as_bytes(), &[3, 4]);
        assert!(buf.has_allocation());

        let copied = HostBuffer::copied(vec![9u8, 8]);
        assert!(!copied.has_allocation());
        assert!(copied.into_allocation().is_err());
    }

    #[test]
    fn test_json_conversion_is_lossy() {
        let json = serde_json::json!({
            "n": 3.9,
            "big": 4294967297i64,
            "ok": true,
            "none": null,
            "list": ["a", 1],
        });

        let value = TaggedValue::from(json);
        assert_eq!(value.get("n"), Some(&TaggedValue::Int32(3)));
        assert_eq!(value.get("big"), Some(&TaggedValue::Int32(1)));
        assert_eq!(value.get("ok"), Some(&TaggedValue::Int32(1)));
        assert_eq!(value.get("none"), Some(&TaggedValue::Absent));
        assert_eq!(
            value.get("list"),
            Some(&TaggedValue::Array(vec!["a".into(), 1.into()]))
        );

        let back = TaggedValue::from("x").to_json();
        assert_eq!(back, serde_json::json!("x"));
    }
}
