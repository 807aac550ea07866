//! Garbage-collected heap.
//!
//! A slot vector with a free list and a bitset mark phase. Collection runs
//! only at the interpreter's instruction checkpoint, when every live value
//! is reachable from the registered roots (global environment, active call
//! frames, engine temp roots, host sink).

use crate::env::EnvRecord;
use crate::frame::{ActivationState, Frame};
use crate::iterator::{IteratorImpl, IteratorRecord};
use crate::object::{Accessor, FieldInit, FunctionObject, ScriptObject, Shape};
use crate::value::Value;

/// Handle to a heap-allocated object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(pub usize);

pub enum ManagedObject {
    Str(String),
    Object(Box<ScriptObject>),
    Function(Box<FunctionObject>),
    Environment(Box<EnvRecord>),
    Iterator(Box<IteratorRecord>),
    Activation(Box<ActivationState>),
    Completion { kind: i32, value: Value },
    Accessor(Box<Accessor>),
    Shape(Box<Shape>),
}

impl ManagedObject {
    /// Rough retained size used to drive the byte threshold.
    pub fn size(&self) -> usize {
        let base = std::mem::size_of::<ManagedObject>();
        let deep = match self {
            ManagedObject::Str(s) => s.capacity(),
            ManagedObject::Object(o) => {
                (o.prop_values.capacity() + o.elements.capacity()) * std::mem::size_of::<Value>()
                    + 64
            }
            ManagedObject::Function(f) => {
                f.properties.capacity() * (std::mem::size_of::<String>() + std::mem::size_of::<Value>())
                    + 128
            }
            ManagedObject::Environment(e) => {
                e.bindings.capacity() * (std::mem::size_of::<String>() + std::mem::size_of::<Value>())
                    + 64
            }
            ManagedObject::Iterator(_) => 96,
            ManagedObject::Activation(a) => {
                a.frame
                    .as_ref()
                    .map_or(0, |f| f.slots.len() * std::mem::size_of::<Value>())
                    + 128
            }
            ManagedObject::Completion { .. } => 16,
            ManagedObject::Accessor(_) => 32,
            ManagedObject::Shape(s) => {
                (s.prop_map.capacity() + s.transitions.capacity())
                    * (std::mem::size_of::<String>() + 16)
                    + 64
            }
        };
        base + deep
    }
}

pub struct Heap {
    objects: Vec<Option<ManagedObject>>,
    free_list: Vec<usize>,
    marks: Vec<u64>,
    pub(crate) alloc_count: usize,
    pub(crate) gc_threshold: usize,
    pub(crate) alloc_bytes: usize,
    pub(crate) gc_threshold_bytes: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            objects: Vec::with_capacity(1024),
            free_list: Vec::new(),
            marks: Vec::new(),
            alloc_count: 0,
            gc_threshold: 100_000,
            alloc_bytes: 0,
            gc_threshold_bytes: 32 * 1024 * 1024,
        }
    }

    pub fn alloc(&mut self, obj: ManagedObject) -> ObjectId {
        self.alloc_count += 1;
        self.alloc_bytes += obj.size();

        if let Some(id) = self.free_list.pop() {
            self.objects[id] = Some(obj);
            ObjectId(id)
        } else {
            let id = self.objects.len();
            self.objects.push(Some(obj));
            ObjectId(id)
        }
    }

    #[inline]
    pub fn should_gc(&self) -> bool {
        self.alloc_count >= self.gc_threshold || self.alloc_bytes >= self.gc_threshold_bytes
    }

    pub fn get(&self, id: ObjectId) -> &ManagedObject {
        self.objects[id.0].as_ref().expect("object was garbage collected")
    }

    pub fn get_mut(&mut self, id: ObjectId) -> &mut ManagedObject {
        self.objects[id.0].as_mut().expect("object was garbage collected")
    }

    pub fn len(&self) -> usize {
        self.objects.len() - self.free_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set_mark(&mut self, id: ObjectId) -> bool {
        let word = id.0 >> 6;
        let bit = id.0 & 63;
        if word >= self.marks.len() {
            self.marks.resize(word + 1, 0);
        }
        let slot = &mut self.marks[word];
        let mask = 1u64 << bit;
        if (*slot & mask) != 0 {
            return false;
        }
        *slot |= mask;
        true
    }

    fn is_marked(&self, id: ObjectId) -> bool {
        let word = id.0 >> 6;
        let bit = id.0 & 63;
        self.marks.get(word).is_some_and(|w| (w & (1 << bit)) != 0)
    }

    /// Mark everything reachable from the given roots and frames.
    pub fn mark_all(&mut self, roots: &[Value], frames: &[&Frame]) {
        self.marks.clear();

        let mut pending: Vec<Value> = roots.to_vec();
        for frame in frames {
            pending.extend_from_slice(&frame.slots);
            pending.push(frame.lexical_environment);
        }

        while let Some(value) = pending.pop() {
            if !value.is_heap() {
                continue;
            }
            let id = value.as_obj_id();
            if id.0 >= self.objects.len() || self.objects[id.0].is_none() {
                continue;
            }
            if !self.set_mark(id) {
                continue;
            }
            if let Some(obj) = &self.objects[id.0] {
                trace_object(obj, &mut pending);
            }
        }
    }

    /// Free unmarked objects and rebuild the allocation thresholds.
    pub fn sweep(&mut self) {
        let mut live_bytes = 0;
        let mut live_count = 0;
        self.free_list.clear();

        for i in 0..self.objects.len() {
            if let Some(obj) = &self.objects[i] {
                if self.is_marked(ObjectId(i)) {
                    live_bytes += obj.size();
                    live_count += 1;
                } else {
                    self.objects[i] = None;
                    self.free_list.push(i);
                }
            } else {
                self.free_list.push(i);
            }
        }

        while self.objects.last().is_some_and(|o| o.is_none()) {
            self.objects.pop();
        }
        let new_len = self.objects.len();
        self.free_list.retain(|&i| i < new_len);

        self.marks.clear();
        self.alloc_count = 0;
        self.alloc_bytes = live_bytes;

        // Grow fast while small, slower once large to bound pause times.
        let growth = if live_bytes > 10 * 1024 * 1024 { 1.5 } else { 2.0 };
        self.gc_threshold = ((live_count as f64 * growth) as usize).max(32_768);
        self.gc_threshold_bytes = ((live_bytes as f64 * growth) as usize).max(1024 * 1024);
    }
}

fn trace_object(obj: &ManagedObject, pending: &mut Vec<Value>) {
    match obj {
        ManagedObject::Str(_) => {}
        ManagedObject::Object(object) => {
            pending.push(Value::shape(object.shape));
            pending.push(object.prototype);
            pending.extend_from_slice(&object.prop_values);
            pending.extend_from_slice(&object.elements);
        }
        ManagedObject::Function(function) => {
            pending.push(function.environment);
            for value in function.properties.values() {
                pending.push(*value);
            }
            if let Some(class_info) = &function.class_info {
                pending.push(class_info.superclass);
                for (_, init) in &class_info.fields {
                    if let FieldInit::Constant(value) = init {
                        pending.push(*value);
                    }
                }
            }
        }
        ManagedObject::Environment(env) => {
            pending.push(env.parent);
            for binding in env.bindings.values() {
                pending.push(binding.value);
            }
        }
        ManagedObject::Iterator(iterator) => match &iterator.kind {
            IteratorImpl::Elements { object, .. } => pending.push(*object),
            IteratorImpl::StringChars { string, .. } => pending.push(*string),
            IteratorImpl::PropertyNames { keys, .. } => pending.extend_from_slice(keys),
            IteratorImpl::Object { iterator, next_method } => {
                pending.push(*iterator);
                pending.push(*next_method);
            }
            IteratorImpl::Activation { activation } => pending.push(*activation),
        },
        ManagedObject::Activation(activation) => {
            if let Some(frame) = &activation.frame {
                pending.extend_from_slice(&frame.slots);
                pending.push(frame.lexical_environment);
            }
        }
        ManagedObject::Completion { value, .. } => pending.push(*value),
        ManagedObject::Accessor(accessor) => {
            pending.push(accessor.getter);
            pending.push(accessor.setter);
        }
        ManagedObject::Shape(shape) => {
            if let Some(parent) = shape.parent {
                pending.push(Value::shape(parent));
            }
            for target in shape.transitions.values() {
                pending.push(Value::shape(*target));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_reuses_swept_slots() {
        let mut heap = Heap::new();
        let a = heap.alloc(ManagedObject::Str("a".into()));
        let b = heap.alloc(ManagedObject::Str("b".into()));
        // Only `b` is rooted.
        heap.mark_all(&[Value::string(b)], &[]);
        heap.sweep();
        assert!(matches!(heap.get(b), ManagedObject::Str(s) if s == "b"));
        let c = heap.alloc(ManagedObject::Str("c".into()));
        assert_eq!(c, a, "freed slot is reused");
    }

    #[test]
    fn completion_values_keep_their_payload_alive() {
        let mut heap = Heap::new();
        let payload = heap.alloc(ManagedObject::Str("kept".into()));
        let completion = heap.alloc(ManagedObject::Completion {
            kind: 0,
            value: Value::string(payload),
        });
        heap.mark_all(&[Value::completion(completion)], &[]);
        heap.sweep();
        assert!(matches!(heap.get(payload), ManagedObject::Str(s) if s == "kept"));
    }
}
