//! Heap objects and the arena that owns them
//!
//! Every object lives in the heap's allocation list until the heap is torn
//! down; nothing is reclaimed while a program runs. Values refer to objects
//! through [`Handle`]s, which stay valid for the heap's whole lifetime.

use std::fmt;
use tracing::debug;

use crate::table::{fnv1a, hash_value, Key, Table};
use crate::value::Value;

/// A stable reference to a heap object: its index in the allocation list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub usize);

/// Object type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjType {
    String,
}

/// How a string object came by its character buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringOrigin {
    /// The heap copied the caller's bytes into a fresh buffer
    Copied,
    /// The heap took over a buffer the caller allocated
    Adopted,
}

/// Interned string
#[derive(Debug)]
pub struct ObjString {
    chars: String,
    hash: u32,
    origin: StringOrigin,
}

impl ObjString {
    pub fn as_str(&self) -> &str {
        &self.chars
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn origin(&self) -> StringOrigin {
        self.origin
    }
}

impl fmt::Display for ObjString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.chars)
    }
}

/// A heap object
#[derive(Debug)]
pub enum Object {
    String(ObjString),
}

impl Object {
    pub fn kind(&self) -> ObjType {
        match self {
            Object::String(_) => ObjType::String,
        }
    }

    fn hash(&self) -> u32 {
        match self {
            Object::String(s) => s.hash,
        }
    }
}

/// Owner of every object allocated during a run, plus the intern set
#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<Object>,
    strings: Table,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a copy of `chars`. Equal content always yields the same handle.
    pub fn copy_string(&mut self, chars: &str) -> Handle {
        let hash = fnv1a(chars.as_bytes());
        if let Some(handle) = self.find_interned(chars, hash) {
            return handle;
        }

        self.allocate_string(chars.to_owned(), hash, StringOrigin::Copied)
    }

    /// Intern a buffer the caller hands over. On a miss the buffer becomes
    /// the string's storage without copying; on a hit it is dropped and the
    /// existing handle returned.
    pub fn take_string(&mut self, chars: String) -> Handle {
        let hash = fnv1a(chars.as_bytes());
        if let Some(handle) = self.find_interned(&chars, hash) {
            return handle;
        }

        self.allocate_string(chars, hash, StringOrigin::Adopted)
    }

    pub fn get(&self, handle: Handle) -> Option<&Object> {
        self.objects.get(handle.0)
    }

    pub fn get_string(&self, handle: Handle) -> Option<&ObjString> {
        match self.objects.get(handle.0)? {
            Object::String(s) => Some(s),
        }
    }

    /// Build a table key for `value` using the shared hash function
    pub fn key(&self, value: Value) -> Key {
        let hash = hash_value(&value, |handle| self.get(handle).map_or(0, Object::hash));
        Key::new(value, hash)
    }

    /// Text of a value as `print` writes it
    pub fn display(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Obj(handle) => match self.get(handle) {
                Some(Object::String(s)) => s.to_string(),
                None => "<dangling object>".to_string(),
            },
        }
    }

    /// Number of objects allocated so far
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Number of distinct interned strings
    pub fn interned_count(&self) -> usize {
        self.strings.len()
    }

    /// Release every object. Handles issued before this call are invalid
    /// afterwards.
    pub fn free_objects(&mut self) {
        if !self.objects.is_empty() {
            debug!(objects = self.objects.len(), "freeing heap objects");
        }
        self.strings = Table::new();
        self.objects.clear();
    }

    /// Handle of the interned string with this content, without allocating
    pub(crate) fn find_interned(&self, chars: &str, hash: u32) -> Option<Handle> {
        let objects = &self.objects;
        self.strings
            .find_key(hash, |key| match key {
                Value::Obj(handle) => matches!(
                    objects.get(handle.0),
                    Some(Object::String(s)) if s.as_str() == chars
                ),
                _ => false,
            })
            .and_then(|value| value.as_handle())
    }

    fn allocate_string(&mut self, chars: String, hash: u32, origin: StringOrigin) -> Handle {
        let handle = self.allocate(Object::String(ObjString { chars, hash, origin }));
        self.strings.set(Key::new(Value::Obj(handle), hash), Value::Nil);
        handle
    }

    fn allocate(&mut self, object: Object) -> Handle {
        let handle = Handle(self.objects.len());
        self.objects.push(object);
        handle
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.free_objects();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_string_interns() {
        let mut heap = Heap::new();
        let a = heap.copy_string("hello");
        let b = heap.copy_string("hello");
        let c = heap.copy_string("world");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.object_count(), 2);
        assert_eq!(heap.get_string(a).map(ObjString::as_str), Some("hello"));
        assert_eq!(heap.get_string(a).map(ObjString::origin), Some(StringOrigin::Copied));
    }

    #[test]
    fn test_take_string_adopts_buffer_on_miss() {
        let mut heap = Heap::new();
        let buffer = String::from("fresh");
        let ptr = buffer.as_ptr();

        let handle = heap.take_string(buffer);
        let s = heap.get_string(handle).expect("string object");
        assert_eq!(s.as_str().as_ptr(), ptr);
        assert_eq!(s.origin(), StringOrigin::Adopted);
    }

    #[test]
    fn test_take_string_returns_canonical_on_hit() {
        let mut heap = Heap::new();
        let first = heap.copy_string("dup");
        let second = heap.take_string("dup".to_string());

        assert_eq!(first, second);
        assert_eq!(heap.object_count(), 1);
        assert_eq!(heap.interned_count(), 1);
    }

    #[test]
    fn test_empty_string() {
        let mut heap = Heap::new();
        let a = heap.copy_string("");
        assert_eq!(heap.take_string(String::new()), a);
        assert!(heap.get_string(a).is_some_and(ObjString::is_empty));
    }

    #[test]
    fn test_string_key_uses_content_hash() {
        let mut heap = Heap::new();
        let handle = heap.copy_string("abc");
        let key = heap.key(Value::Obj(handle));
        assert_eq!(key.hash, fnv1a(b"abc"));
    }

    #[test]
    fn test_display() {
        let mut heap = Heap::new();
        let s = heap.copy_string("a \"quoted\"\tstring");
        assert_eq!(heap.display(Value::Obj(s)), "a \"quoted\"\tstring");
        assert_eq!(heap.display(Value::Number(3.0)), "3");
        assert_eq!(heap.display(Value::Number(2.5)), "2.5");
        assert_eq!(heap.display(Value::Bool(false)), "false");
        assert_eq!(heap.display(Value::Nil), "nil");
    }

    #[test]
    fn test_free_objects() {
        let mut heap = Heap::new();
        heap.copy_string("one");
        heap.copy_string("two");
        heap.free_objects();
        assert_eq!(heap.object_count(), 0);
        assert_eq!(heap.interned_count(), 0);
        assert_eq!(heap.get(Handle(0)).map(Object::kind), None);
    }

    #[test]
    fn test_object_kind() {
        let mut heap = Heap::new();
        let handle = heap.copy_string("x");
        assert_eq!(heap.get(handle).map(Object::kind), Some(ObjType::String));
    }
}
