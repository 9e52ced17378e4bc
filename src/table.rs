//! Open-addressing hash table
//!
//! Linear probing with tombstone deletion. Serves as the string intern set
//! and as the global variable store.

use crate::object::Handle;
use crate::value::Value;

/// Maximum load (occupied + tombstone slots) as a fraction `MAX_LOAD_NUM / MAX_LOAD_DEN`
const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

/// Capacity of the first slot array
const MIN_CAPACITY: usize = 8;

/// 32-bit FNV-1a
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for &byte in bytes {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

/// Hash any value through its canonical byte representation.
///
/// Objects delegate to `object_hash`, which for strings is the hash
/// computed when the string was allocated.
pub fn hash_value(value: &Value, object_hash: impl FnOnce(Handle) -> u32) -> u32 {
    match value {
        Value::Nil => fnv1a(&[0]),
        Value::Bool(b) => fnv1a(&[1, u8::from(*b)]),
        Value::Number(n) => {
            let mut bytes = [2u8; 9];
            bytes[1..].copy_from_slice(&canonical_bits(*n).to_le_bytes());
            fnv1a(&bytes)
        }
        Value::Obj(handle) => object_hash(*handle),
    }
}

/// Bit pattern a number key is hashed and compared by. `-0.0` folds into
/// `0.0` and every NaN into one NaN, so a NaN key can be found again.
fn canonical_bits(n: f64) -> u64 {
    if n == 0.0 {
        0.0f64.to_bits()
    } else if n.is_nan() {
        f64::NAN.to_bits()
    } else {
        n.to_bits()
    }
}

/// Key identity: numbers by canonical bits, everything else by `==`
fn same_key(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => canonical_bits(*x) == canonical_bits(*y),
        _ => a == b,
    }
}

/// A table key: the value plus its precomputed hash
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Key {
    pub value: Value,
    pub hash: u32,
}

impl Key {
    pub fn new(value: Value, hash: u32) -> Self {
        Self { value, hash }
    }
}

#[derive(Debug, Clone, Copy)]
enum Entry {
    Empty,
    Tombstone,
    Occupied { key: Key, value: Value },
}

/// Open-addressing hash map from [`Key`] to [`Value`]
#[derive(Debug, Clone, Default)]
pub struct Table {
    /// Occupied plus tombstone slots
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots in use for load-factor purposes, tombstones included
    pub fn load(&self) -> usize {
        self.count
    }

    pub fn get(&self, key: &Key) -> Option<Value> {
        if self.count == 0 {
            return None;
        }

        match self.entries[find_slot(&self.entries, key)] {
            Entry::Occupied { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Insert or replace. Returns `true` when the key was not present.
    pub fn set(&mut self, key: Key, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DEN > self.capacity() * MAX_LOAD_NUM {
            let capacity = grow_capacity(self.capacity());
            self.adjust_capacity(capacity);
        }

        let slot = find_slot(&self.entries, &key);
        let entry = &mut self.entries[slot];
        let is_new = !matches!(entry, Entry::Occupied { .. });
        // Reusing a tombstone does not change the load
        if matches!(entry, Entry::Empty) {
            self.count += 1;
        }

        *entry = Entry::Occupied { key, value };
        is_new
    }

    /// Remove a key, leaving a tombstone so later probes still reach
    /// entries inserted after it. Returns `true` if the key was present.
    pub fn delete(&mut self, key: &Key) -> bool {
        if self.count == 0 {
            return false;
        }

        let slot = find_slot(&self.entries, key);
        match self.entries[slot] {
            Entry::Occupied { .. } => {
                self.entries[slot] = Entry::Tombstone;
                true
            }
            _ => false,
        }
    }

    /// Copy every live entry of `from` into this table
    pub fn add_all(&mut self, from: &Table) {
        for (key, value) in from.iter() {
            self.set(*key, *value);
        }
    }

    /// Probe the bucket chain for `hash` and return the first key accepted
    /// by `matches`. Used to find an interned string by content before a
    /// handle for it exists.
    pub fn find_key(&self, hash: u32, mut matches: impl FnMut(&Value) -> bool) -> Option<Value> {
        if self.count == 0 {
            return None;
        }

        let capacity = self.capacity();
        let mut index = hash as usize % capacity;
        loop {
            match &self.entries[index] {
                Entry::Empty => return None,
                Entry::Tombstone => {}
                Entry::Occupied { key, .. } => {
                    if key.hash == hash && matches(&key.value) {
                        return Some(key.value);
                    }
                }
            }
            index = (index + 1) % capacity;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.entries.iter().filter_map(|entry| match entry {
            Entry::Occupied { key, value } => Some((key, value)),
            _ => None,
        })
    }

    /// Rebuild the slot array at `capacity`, dropping tombstones.
    fn adjust_capacity(&mut self, capacity: usize) {
        let mut entries = vec![Entry::Empty; capacity];

        self.count = 0;
        for entry in &self.entries {
            if let Entry::Occupied { key, value } = *entry {
                let slot = find_slot(&entries, &key);
                entries[slot] = Entry::Occupied { key, value };
                self.count += 1;
            }
        }

        self.entries = entries;
    }
}

fn grow_capacity(capacity: usize) -> usize {
    if capacity < MIN_CAPACITY {
        MIN_CAPACITY
    } else {
        capacity * 2
    }
}

/// Find the slot holding `key`, or the slot an insert of `key` should use:
/// the first tombstone passed on the way, else the empty slot that ended
/// the probe.
fn find_slot(entries: &[Entry], key: &Key) -> usize {
    let capacity = entries.len();
    let mut index = key.hash as usize % capacity;
    let mut tombstone = None;

    loop {
        match &entries[index] {
            Entry::Empty => return tombstone.unwrap_or(index),
            Entry::Tombstone => {
                tombstone.get_or_insert(index);
            }
            Entry::Occupied { key: existing, .. } => {
                if same_key(&existing.value, &key.value) {
                    return index;
                }
            }
        }
        index = (index + 1) % capacity;
    }
}
