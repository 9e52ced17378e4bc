//! Property-based tests for the hash table and string interning.

use std::collections::HashMap;

use loxvm::table::{hash_value, Key, Table};
use loxvm::{Heap, Value};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Set(u16, f64),
    Delete(u16),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u16..96, -1.0e6..1.0e6f64).prop_map(|(k, v)| Op::Set(k, v)),
        1 => (0u16..96).prop_map(Op::Delete),
    ]
}

fn number_key(n: u16) -> Key {
    let value = Value::Number(f64::from(n));
    Key::new(value, hash_value(&value, |_| 0))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Every key set and not deleted stays retrievable with its last value,
    /// across any number of resizes
    #[test]
    fn table_matches_model(ops in prop::collection::vec(op_strategy(), 0..400)) {
        let mut table = Table::new();
        let mut model: HashMap<u16, f64> = HashMap::new();

        for op in &ops {
            match *op {
                Op::Set(k, v) => {
                    let is_new = table.set(number_key(k), Value::Number(v));
                    prop_assert_eq!(is_new, model.insert(k, v).is_none());
                }
                Op::Delete(k) => {
                    let removed = table.delete(&number_key(k));
                    prop_assert_eq!(removed, model.remove(&k).is_some());
                }
            }
            prop_assert!(table.load() * 4 <= table.capacity() * 3);
        }

        prop_assert_eq!(table.len(), model.len());
        for k in 0u16..96 {
            let expected = model.get(&k).map(|v| Value::Number(*v));
            prop_assert_eq!(table.get(&number_key(k)), expected);
        }
    }

    /// String keys built through the heap behave the same way
    #[test]
    fn string_keys_survive_resizes(words in prop::collection::hash_set("[a-z]{1,8}", 1..120)) {
        let mut heap = Heap::new();
        let mut table = Table::new();

        for (i, word) in words.iter().enumerate() {
            let handle = heap.copy_string(word);
            table.set(heap.key(Value::Obj(handle)), Value::Number(i as f64));
        }

        for (i, word) in words.iter().enumerate() {
            let handle = heap.copy_string(word);
            prop_assert_eq!(table.get(&heap.key(Value::Obj(handle))), Some(Value::Number(i as f64)));
        }
    }

    /// Equal content always interns to the same handle, whichever
    /// constructor is used
    #[test]
    fn interning_is_idempotent(words in prop::collection::vec("[a-c]{0,4}", 1..60)) {
        let mut heap = Heap::new();
        let mut seen: HashMap<String, loxvm::Handle> = HashMap::new();

        for word in &words {
            let copied = heap.copy_string(word);
            let taken = heap.take_string(word.clone());
            prop_assert_eq!(copied, taken);

            let first = *seen.entry(word.clone()).or_insert(copied);
            prop_assert_eq!(first, copied);
        }

        prop_assert_eq!(heap.object_count(), seen.len());
        prop_assert_eq!(heap.interned_count(), seen.len());
    }
}
