//! Environment records.
//!
//! Declarative records with insertion-ordered bindings, so a binding's map
//! index doubles as its cache slot. Each record carries a monotonically
//! assigned id that environment-coordinate caches validate against. A
//! binding whose value is the empty marker is declared but uninitialized;
//! reading it faults (TDZ).

use indexmap::IndexMap;

use crate::errors::messages;
use crate::heap::ManagedObject;
use crate::runtime::Runtime;
use crate::value::Value;

pub type FastIndexMap<K, V> = IndexMap<K, V, ahash::RandomState>;

#[derive(Clone, Copy, Debug)]
pub struct Binding {
    pub value: Value,
    pub mutable: bool,
}

pub struct EnvRecord {
    pub parent: Value,
    pub bindings: FastIndexMap<String, Binding>,
    pub id: u64,
}

impl Runtime {
    pub fn env_create(&mut self, parent: Value) -> Value {
        self.next_environment_id += 1;
        let record = EnvRecord {
            parent,
            bindings: FastIndexMap::default(),
            id: self.next_environment_id,
        };
        Value::environment(self.heap.alloc(ManagedObject::Environment(Box::new(record))))
    }

    pub(crate) fn env_record(&self, env: Value) -> &EnvRecord {
        match self.heap.get(env.as_obj_id()) {
            ManagedObject::Environment(record) => record,
            _ => unreachable!("value is not an environment record"),
        }
    }

    pub(crate) fn env_record_mut(&mut self, env: Value) -> &mut EnvRecord {
        match self.heap.get_mut(env.as_obj_id()) {
            ManagedObject::Environment(record) => record,
            _ => unreachable!("value is not an environment record"),
        }
    }

    /// Declare a binding in the given record, uninitialized.
    pub fn env_declare(&mut self, env: Value, name: &str, mutable: bool) {
        let is_global = env == self.global_environment;
        let record = self.env_record_mut(env);
        record
            .bindings
            .insert(name.to_string(), Binding { value: Value::EMPTY, mutable });
        if is_global {
            self.global_generation += 1;
        }
    }

    /// Declare a binding already carrying its value.
    pub fn env_declare_initialized(&mut self, env: Value, name: &str, value: Value, mutable: bool) {
        let is_global = env == self.global_environment;
        let record = self.env_record_mut(env);
        record.bindings.insert(name.to_string(), Binding { value, mutable });
        if is_global {
            self.global_generation += 1;
        }
    }

    /// Walk the chain looking for a binding. Returns the record holding it,
    /// the hop count, and the slot index within the record.
    pub fn lookup_binding(&self, start: Value, name: &str) -> Option<(Value, u32, u32)> {
        let mut env = start;
        let mut depth = 0;
        while env.is_environment() {
            let record = self.env_record(env);
            if let Some(index) = record.bindings.get_index_of(name) {
                return Some((env, depth, index as u32));
            }
            let parent = record.parent;
            env = parent;
            depth += 1;
        }
        None
    }

    /// Hop a fixed number of records out from `start`.
    pub fn env_at_depth(&self, start: Value, depth: u32) -> Option<Value> {
        let mut env = start;
        for _ in 0..depth {
            if !env.is_environment() {
                return None;
            }
            env = self.env_record(env).parent;
        }
        env.is_environment().then_some(env)
    }

    pub fn env_binding_at(&self, env: Value, slot: u32) -> Option<(&str, Binding)> {
        let record = self.env_record(env);
        record
            .bindings
            .get_index(slot as usize)
            .map(|(name, binding)| (name.as_str(), *binding))
    }

    pub fn get_variable(&mut self, env: Value, name: &str) -> Result<Value, Value> {
        match self.lookup_binding(env, name) {
            Some((holder, _, slot)) => {
                let record = self.env_record(holder);
                let binding = record.bindings[slot as usize];
                if binding.value.is_empty() {
                    return Err(self.throw_string(&messages::binding_not_initialized(name)));
                }
                Ok(binding.value)
            }
            None => Err(self.throw_string(&messages::undefined_binding(name))),
        }
    }

    pub fn set_variable(&mut self, env: Value, name: &str, value: Value) -> Result<(), Value> {
        match self.lookup_binding(env, name) {
            Some((holder, _, slot)) => {
                let binding = self.env_record(holder).bindings[slot as usize];
                if binding.value.is_empty() {
                    return Err(self.throw_string(&messages::binding_not_initialized(name)));
                }
                if !binding.mutable {
                    return Err(self.throw_string(messages::ASSIGNMENT_TO_CONSTANT));
                }
                let record = self.env_record_mut(holder);
                record.bindings[slot as usize].value = value;
                Ok(())
            }
            None => {
                // An unresolvable assignment creates a global binding.
                let global = self.global_environment;
                self.env_declare_initialized(global, name, value, true);
                Ok(())
            }
        }
    }

    /// Initialize a declared binding, or define one in the current record if
    /// the declaration instruction never ran (function-style bindings).
    pub fn initialize_variable(&mut self, env: Value, name: &str, value: Value) -> Result<(), Value> {
        match self.lookup_binding(env, name) {
            Some((holder, _, slot)) if self.env_record(holder).bindings[slot as usize].value.is_empty() => {
                let record = self.env_record_mut(holder);
                record.bindings[slot as usize].value = value;
                Ok(())
            }
            _ => {
                self.env_declare_initialized(env, name, value, true);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    #[test]
    fn lookup_walks_the_chain() {
        let mut rt = Runtime::new();
        let global = rt.global_environment;
        rt.env_declare_initialized(global, "outer", Value::from_i64(1), true);
        let child = rt.env_create(global);
        rt.env_declare_initialized(child, "inner", Value::from_i64(2), true);

        let (_, depth, _) = rt.lookup_binding(child, "outer").unwrap();
        assert_eq!(depth, 1);
        let (_, depth, _) = rt.lookup_binding(child, "inner").unwrap();
        assert_eq!(depth, 0);
        assert!(rt.lookup_binding(child, "missing").is_none());
    }

    #[test]
    fn reading_an_uninitialized_binding_faults() {
        let mut rt = Runtime::new();
        let env = rt.env_create(rt.global_environment);
        rt.env_declare(env, "x", true);
        assert!(rt.get_variable(env, "x").is_err());
        rt.initialize_variable(env, "x", Value::from_i64(5)).unwrap();
        assert_eq!(rt.get_variable(env, "x").unwrap(), Value::from_i64(5));
    }

    #[test]
    fn immutable_bindings_refuse_assignment() {
        let mut rt = Runtime::new();
        let env = rt.env_create(rt.global_environment);
        rt.env_declare_initialized(env, "k", Value::from_i64(1), false);
        assert!(rt.set_variable(env, "k", Value::from_i64(2)).is_err());
    }

    #[test]
    fn unresolvable_assignment_defines_a_global() {
        let mut rt = Runtime::new();
        let env = rt.env_create(rt.global_environment);
        rt.set_variable(env, "fresh", Value::from_i64(9)).unwrap();
        let global = rt.global_environment;
        assert_eq!(rt.get_variable(global, "fresh").unwrap(), Value::from_i64(9));
    }
}
